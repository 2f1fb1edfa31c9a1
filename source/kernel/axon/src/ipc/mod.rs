// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Synchronous rendezvous IPC (one scalar, optionally one page)
//! OWNERS: @kernel-ipc-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests (posting, delivery, page transfer, validation)
//! PUBLIC API: Kernel::{ipc_recv, ipc_try_send, last_message}, Received
//! DEPENDS_ON: kernel::Kernel, syscall::api::{UserPage, decode_perm}
//! INVARIANTS: No wait queues; a send either completes against a posted receive or fails with
//!             NotReceiving; a page moves only when both sides supply an address
//!
//! The receiver blocks (NotRunnable) until a sender targets it. Senders never
//! block in the kernel: retrying with a yield in between is library policy.

use crate::kernel::Kernel;
use crate::mm::PteFlags;
use crate::syscall::api::{decode_perm, UserPage};
use crate::syscall::{SysError, SysResult};
use crate::task::{ContextStatus, ResumeReason};
use crate::types::ContextId;

/// A completed receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Received {
    pub from: ContextId,
    pub value: u32,
    /// Permission of the transferred page; empty when no page moved.
    pub perm: PteFlags,
}

impl Kernel {
    /// Posts willingness to receive and blocks `caller`. `dst` is where a
    /// transferred page should land; `None` refuses pages.
    pub fn ipc_recv(&mut self, caller: ContextId, dst: Option<usize>) -> SysResult<()> {
        self.ensure_live()?;
        let dst = dst.map(UserPage::decode).transpose()?.map(UserPage::raw);
        let context = self.context_mut(caller)?;
        context.mailbox.receiving = true;
        context.mailbox.dst = dst;
        context.status.store(ContextStatus::NotRunnable);
        crate::log_trace!(target: "ipc", "[{caller}] recv posted dst={dst:?}");
        Ok(())
    }

    /// Delivers `value` (and the page at `src` with `perm`) to `target` if it
    /// is blocked in [`Kernel::ipc_recv`]; otherwise fails with `NotReceiving`.
    pub fn ipc_try_send(
        &mut self,
        caller: ContextId,
        target: ContextId,
        value: u32,
        src: Option<usize>,
        perm: PteFlags,
    ) -> SysResult<()> {
        self.ensure_live()?;
        self.resolve(caller, target, false)?;
        let mailbox = self.context(target)?.mailbox;
        if !mailbox.receiving {
            return Err(SysError::NotReceiving);
        }

        let mut delivered = PteFlags::empty();
        if let Some(src) = src {
            let page = UserPage::decode(src)?;
            let perm = decode_perm(perm)?;
            let pte = self.context(caller)?.page_table.lookup(page.raw()).ok_or(SysError::NotMapped)?;
            if perm.contains(PteFlags::WRITABLE) && !pte.flags.contains(PteFlags::WRITABLE) {
                return Err(SysError::InvalidPermission);
            }
            if let Some(dst) = mailbox.dst {
                self.install(target, dst, pte.frame, perm)?;
                delivered = perm;
            }
        }

        let context = self.context_mut(target)?;
        context.mailbox.receiving = false;
        context.mailbox.dst = None;
        context.mailbox.from = Some(caller);
        context.mailbox.value = value;
        context.mailbox.perm = delivered;
        context.frame.ret = 0;
        context.resume = Some(ResumeReason::IpcDelivered);
        context.status.store(ContextStatus::Runnable);
        crate::log_trace!(target: "ipc", "[{caller}] -> {target} value={value:#x} perm={delivered:?}");
        Ok(())
    }

    /// The last message delivered to `id`, if any.
    pub fn last_message(&self, id: ContextId) -> SysResult<Option<Received>> {
        let mailbox = self.context(id)?.mailbox;
        Ok(mailbox.from.map(|from| Received { from, value: mailbox.value, perm: mailbox.perm }))
    }

    /// Whether `id` is blocked in a receive.
    pub fn is_receiving(&self, id: ContextId) -> SysResult<bool> {
        Ok(self.context(id)?.mailbox.receiving)
    }
}
