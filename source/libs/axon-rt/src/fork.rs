// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Copy-on-write and shared-memory duplication of the calling context
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests + tests/fork.rs
//! PUBLIC API: fork, sfork, fork_with, sfork_with, cow_fault, ForkView
//! DEPENDS_ON: pgfault::install_handler, Env::{exofork, page_map, page_alloc, set_status}
//! INVARIANTS: Child pages are marked before the parent's; the exception stack is never shared;
//!             the child becomes Runnable only after its address space and upcall are complete
//!
//! Failure midway leaves a partially built NotRunnable child behind; nothing
//! is rolled back.
//!
//! [`fork`] and [`sfork`] only build the child context. Under a
//! [`crate::Machine`] the child also needs a program: use [`fork_with`] or
//! [`sfork_with`], otherwise the machine halts when it dispatches the child.

use std::ops::Range;

use axon::{
    page_round_down, ContextId, ContextStatus, PageAttrs, PteFlags, UTrapFrame, PAGE_SIZE, PFTEMP,
    USTACKTOP, UTEXT, UTOP, UXSTACK_BASE,
};

use crate::env::Env;
use crate::error::{FaultError, Result};
use crate::machine::Program;
use crate::pgfault::{handler_fn, install_handler};

/// The two sides of a duplication. The caller gets `Parent(child)` back
/// from [`fork`]; the child observes `Child` when it is first dispatched.
#[must_use = "both sides of a fork must be handled"]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkView {
    /// Returned in the duplicating context; carries the child's id.
    Parent(ContextId),
    /// Seen by the child.
    Child,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Sharing {
    /// Every writable page becomes copy-on-write in both contexts.
    CopyOnWrite,
    /// Writable pages stay shared and writable; only the stack is copy-on-write.
    Shared,
}

/// Copy-on-write fault handler: duplicates the faulting page into a private
/// writable frame via the [`PFTEMP`] scratch page.
pub fn cow_fault(env: &mut Env<'_>, utf: &UTrapFrame) -> core::result::Result<(), FaultError> {
    let va = utf.fault_va();
    let pc = utf.saved.pc;
    if !utf.is_write() {
        return Err(FaultError::NotWrite { va, pc });
    }
    if !env.is_cow(va)? {
        return Err(FaultError::NotCopyOnWrite { va, pc });
    }
    let id = env.id();
    let page = page_round_down(va);
    env.page_alloc(id, PFTEMP, PteFlags::USER_RW)?;
    let mut copy = vec![0u8; PAGE_SIZE];
    env.read(page, &mut copy)?;
    env.write(PFTEMP, &copy)?;
    env.page_map(id, PFTEMP, id, page, PteFlags::USER_RW)?;
    env.page_unmap(id, PFTEMP)?;
    log::trace!(target: "fork", "[{id}] cow copy of {page:#010x}");
    Ok(())
}

/// Duplicates the calling context with copy-on-write sharing. Returns
/// `ForkView::Parent(child)`; the child is Runnable on return.
pub fn fork(env: &mut Env<'_>) -> Result<ForkView> {
    duplicate(env, Sharing::CopyOnWrite).map(ForkView::Parent)
}

/// Like [`fork`], but writable memory outside the stack stays shared
/// between parent and child.
pub fn sfork(env: &mut Env<'_>) -> Result<ForkView> {
    duplicate(env, Sharing::Shared).map(ForkView::Parent)
}

/// Forks and registers `child` as the program the new context runs.
pub fn fork_with(env: &mut Env<'_>, child: impl Program + 'static) -> Result<ContextId> {
    adopt(env, Sharing::CopyOnWrite, Box::new(child))
}

/// [`sfork`] counterpart of [`fork_with`].
pub fn sfork_with(env: &mut Env<'_>, child: impl Program + 'static) -> Result<ContextId> {
    adopt(env, Sharing::Shared, Box::new(child))
}

fn adopt(env: &mut Env<'_>, sharing: Sharing, program: Box<dyn Program>) -> Result<ContextId> {
    let id = duplicate(env, sharing)?;
    env.adopt(id, program);
    Ok(id)
}

/// The contiguous run of mapped pages ending at [`USTACKTOP`].
fn stack_extent(env: &Env<'_>) -> Result<Range<usize>> {
    let mut bottom = USTACKTOP;
    while bottom > UTEXT && env.is_mapped(bottom - PAGE_SIZE)? {
        bottom -= PAGE_SIZE;
    }
    Ok(bottom..USTACKTOP)
}

fn duplicate(env: &mut Env<'_>, sharing: Sharing) -> Result<ContextId> {
    install_handler(env, handler_fn(cow_fault))?;
    let parent = env.id();
    let stack = stack_extent(env)?;
    let child = env.exofork()?;

    for (va, attrs) in env.mapped_pages(0..UTOP)? {
        if va == UXSTACK_BASE || !attrs.is_user() {
            continue;
        }
        let sharing = if stack.contains(&va) { Sharing::CopyOnWrite } else { sharing };
        duppage(env, child, va, attrs, sharing)?;
    }

    env.page_alloc(child, UXSTACK_BASE, PteFlags::USER_RW)?;
    let upcall = env.kernel().fault_upcall(parent)?;
    env.set_fault_upcall(child, upcall)?;
    env.set_status(child, ContextStatus::Runnable)?;
    log::debug!(target: "fork", "[{parent}] forked {child}");
    Ok(child)
}

fn duppage(env: &mut Env<'_>, child: ContextId, va: usize, attrs: PageAttrs, sharing: Sharing) -> Result<()> {
    let parent = env.id();
    if sharing == Sharing::Shared && attrs.is_writable() {
        env.page_map(parent, va, child, va, PteFlags::USER_RW)?;
    } else if attrs.is_writable() || attrs.is_cow() {
        // Child first: the parent may touch the page between the two calls.
        env.page_map(parent, va, child, va, PteFlags::USER_COW)?;
        env.page_map(parent, va, parent, va, PteFlags::USER_COW)?;
    } else {
        env.page_map(parent, va, child, va, attrs.flags & PteFlags::SYSCALL)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use axon::{Kernel, KernelConfig, ResumeReason, SysError};

    use super::*;

    const DATA: usize = 0x0100_0000;

    fn parent() -> (Kernel, ContextId) {
        let mut kernel = Kernel::boot(KernelConfig::default()).expect("boot");
        let id = kernel.spawn().expect("spawn");
        (kernel, id)
    }

    #[test]
    fn child_gets_private_exception_stack_and_runs() {
        let (mut kernel, id) = parent();
        let mut env = Env::new(&mut kernel, id);
        let ForkView::Parent(child) = fork(&mut env).expect("fork") else {
            panic!("caller must see the parent view");
        };
        let mine = env.page_attrs(UXSTACK_BASE).expect("query").expect("stack");
        let theirs = kernel.page_attrs(child, UXSTACK_BASE).expect("query").expect("stack");
        assert_ne!(mine.frame, theirs.frame);
        assert!(theirs.is_writable());
        assert_eq!(kernel.status(child), Some(ContextStatus::Runnable));
        assert_eq!(kernel.take_resume(child).expect("resume"), Some(ResumeReason::ExoforkChild));
        assert!(kernel.fault_upcall(child).expect("query").is_some());
    }

    #[test]
    fn read_fault_on_cow_page_is_refused() {
        let (mut kernel, id) = parent();
        let mut env = Env::new(&mut kernel, id);
        install_handler(&mut env, handler_fn(cow_fault)).expect("install");
        // A read of an unmapped page reaches the handler, which refuses it.
        let err = env.read_u32(DATA).expect_err("not a write");
        assert!(matches!(err, SysError::Aborted(report) if report.va == DATA));
    }

    #[test]
    fn write_fault_on_plain_page_is_refused() {
        let (mut kernel, id) = parent();
        let mut env = Env::new(&mut kernel, id);
        install_handler(&mut env, handler_fn(cow_fault)).expect("install");
        env.page_alloc(id, DATA, PteFlags::USER_RO).expect("alloc");
        let err = env.write_u32(DATA, 1).expect_err("not cow");
        assert!(matches!(err, SysError::Aborted(_)));
    }

    #[test]
    fn stack_page_is_copy_on_write_after_fork() {
        let (mut kernel, id) = parent();
        let mut env = Env::new(&mut kernel, id);
        let _ = fork(&mut env).expect("fork");
        assert!(env.is_cow(USTACKTOP - 1).expect("query"));
        assert!(!env.is_mapped(PFTEMP).expect("query"));
    }

    #[test]
    fn sfork_shares_data_but_not_stack() {
        let (mut kernel, id) = parent();
        let mut env = Env::new(&mut kernel, id);
        env.page_alloc(id, DATA, PteFlags::USER_RW).expect("alloc");
        let ForkView::Parent(child) = sfork(&mut env).expect("sfork") else {
            panic!("caller must see the parent view");
        };
        env.write_u32(DATA, 77).expect("write shared");
        env.write_u32(USTACKTOP - 4, 1).expect("write stack");

        let mut child_env = Env::new(&mut kernel, child);
        assert_eq!(child_env.read_u32(DATA).expect("read shared"), 77);
        assert_eq!(child_env.read_u32(USTACKTOP - 4).expect("read stack"), 0);
        assert!(!child_env.is_cow(DATA).expect("query"));
    }

    #[test]
    fn sfork_keeps_every_stack_page_private() {
        let (mut kernel, id) = parent();
        let deep = USTACKTOP - 2 * PAGE_SIZE;
        let mut env = Env::new(&mut kernel, id);
        env.page_alloc(id, deep, PteFlags::USER_RW).expect("grow stack");
        env.page_alloc(id, DATA, PteFlags::USER_RW).expect("alloc");
        let ForkView::Parent(child) = sfork(&mut env).expect("sfork") else {
            panic!("caller must see the parent view");
        };
        assert!(env.is_cow(deep).expect("query"));
        env.write_u32(deep, 5).expect("write deep stack");

        let mut child_env = Env::new(&mut kernel, child);
        assert_eq!(child_env.read_u32(deep).expect("read deep stack"), 0);
        assert!(child_env.is_cow(deep).expect("query"));
        assert!(!child_env.is_cow(DATA).expect("query"));
    }

    #[test]
    fn stack_extent_stops_at_the_first_gap() {
        let (mut kernel, id) = parent();
        let mut env = Env::new(&mut kernel, id);
        env.page_alloc(id, USTACKTOP - 2 * PAGE_SIZE, PteFlags::USER_RW).expect("grow stack");
        env.page_alloc(id, USTACKTOP - 4 * PAGE_SIZE, PteFlags::USER_RW).expect("detached page");
        assert_eq!(stack_extent(&env).expect("extent"), USTACKTOP - 2 * PAGE_SIZE..USTACKTOP);
    }
}
