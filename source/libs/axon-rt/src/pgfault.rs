// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: User-level page-fault handler registration
//! OWNERS: @runtime
//! PUBLIC API: UserFaultHandler, handler_fn, install_handler
//! DEPENDS_ON: axon::{FaultHandler, Kernel::set_fault_upcall}
//! INVARIANTS: One handler per context; the first registration allocates the exception stack;
//!             later registrations only swap the handler
//!
//! The kernel only knows a [`FaultHandler`] upcall. [`Upcall`] is the
//! landing routine: it rebuilds an [`Env`] for the faulting context, runs the
//! user handler and reduces its error to the taxonomy class the kernel
//! records in the abort report.

use std::sync::Arc;

use axon::{ContextId, ErrorClass, FaultHandler, Kernel, PteFlags, SysResult, UTrapFrame, UXSTACK_BASE};

use crate::env::Env;
use crate::error::FaultError;

/// A user-level page-fault handler.
pub trait UserFaultHandler: Send + Sync {
    /// Resolves the fault described by `utf` or refuses it.
    fn handle(&self, env: &mut Env<'_>, utf: &UTrapFrame) -> Result<(), FaultError>;
}

impl<F> UserFaultHandler for F
where
    F: Fn(&mut Env<'_>, &UTrapFrame) -> Result<(), FaultError> + Send + Sync,
{
    fn handle(&self, env: &mut Env<'_>, utf: &UTrapFrame) -> Result<(), FaultError> {
        self(env, utf)
    }
}

/// Wraps a closure as a shareable handler.
pub fn handler_fn<F>(f: F) -> Arc<dyn UserFaultHandler>
where
    F: Fn(&mut Env<'_>, &UTrapFrame) -> Result<(), FaultError> + Send + Sync + 'static,
{
    Arc::new(f)
}

struct Upcall {
    handler: Arc<dyn UserFaultHandler>,
}

impl FaultHandler for Upcall {
    fn handle(&self, kernel: &mut Kernel, ctx: ContextId, utf: &UTrapFrame) -> Result<(), ErrorClass> {
        let mut env = Env::new(kernel, ctx);
        self.handler.handle(&mut env, utf).map_err(|err| {
            log::error!(
                target: "pgfault",
                "[{ctx}] unhandled fault va={:#010x} ip={:#x}: {err}",
                utf.fault_va(),
                utf.saved.pc
            );
            err.class()
        })
    }
}

/// Registers `handler` for the calling context.
pub fn install_handler(env: &mut Env<'_>, handler: Arc<dyn UserFaultHandler>) -> SysResult<()> {
    let id = env.id();
    if env.kernel().fault_upcall(id)?.is_none() {
        env.page_alloc(id, UXSTACK_BASE, PteFlags::USER_RW)?;
        log::debug!(target: "pgfault", "[{id}] exception stack at {UXSTACK_BASE:#010x}");
    }
    env.set_fault_upcall(id, Some(Arc::new(Upcall { handler })))
}
