// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Context lifecycle and memory entry points
//! OWNERS: @kernel-team
//! PUBLIC API: Kernel::{getid, exofork, set_status, destroy, page_alloc, page_map, page_unmap}
//! DEPENDS_ON: kernel::Kernel, mm::{PageTable, FramePool}, task::ContextTable
//! INVARIANTS: Decode -> Check -> Execute; mutating calls require caller == target or parent;
//!             user mappings stay below UTOP and never combine COW with WRITABLE

use crate::kernel::Kernel;
use crate::mm::{is_page_aligned, PteFlags};
use crate::syscall::{SysError, SysResult};
use crate::task::{ContextKind, ContextStatus, ResumeReason};
use crate::types::{ContextId, UTOP};

/// Page-aligned user address below [`UTOP`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct UserPage(usize);

impl UserPage {
    #[inline]
    pub(crate) fn decode(va: usize) -> SysResult<Self> {
        if va >= UTOP || !is_page_aligned(va) {
            return Err(SysError::InvalidAddress);
        }
        Ok(Self(va))
    }

    #[inline]
    pub(crate) fn raw(self) -> usize {
        self.0
    }
}

#[inline]
pub(crate) fn decode_perm(perm: PteFlags) -> SysResult<PteFlags> {
    if perm.is_valid_user_perm() {
        Ok(perm)
    } else {
        Err(SysError::InvalidPermission)
    }
}

impl Kernel {
    /// Validates `caller` and returns it.
    pub fn getid(&self, caller: ContextId) -> SysResult<ContextId> {
        self.ensure_live()?;
        self.context(caller)?;
        Ok(caller)
    }

    /// Creates a blank child of `caller`: empty address space, NotRunnable,
    /// register state copied from the caller with a zero return register.
    /// The child observes [`ResumeReason::ExoforkChild`] on first dispatch.
    pub fn exofork(&mut self, caller: ContextId) -> SysResult<ContextId> {
        self.ensure_live()?;
        let frame = self.context(caller)?.frame;
        let child = self
            .contexts
            .allocate(ContextKind::User, Some(caller))
            .ok_or(SysError::NoFreeContext)?;
        let context = self.context_mut(child)?;
        context.frame = frame;
        context.frame.ret = 0;
        context.resume = Some(ResumeReason::ExoforkChild);
        self.context_mut(caller)?.frame.ret = u64::from(child.as_raw());
        crate::log_debug!(target: "task", "[{caller}] exofork -> {child}");
        Ok(child)
    }

    /// Sets `target` Runnable or NotRunnable.
    pub fn set_status(&mut self, caller: ContextId, target: ContextId, status: ContextStatus) -> SysResult<()> {
        self.ensure_live()?;
        if !matches!(status, ContextStatus::Runnable | ContextStatus::NotRunnable) {
            return Err(SysError::InvalidStatus);
        }
        self.resolve(caller, target, true)?;
        let context = self.context(target)?;
        match (context.status(), status) {
            // Already on a processor; it stays there until it yields.
            (ContextStatus::Running, ContextStatus::Runnable) => {}
            (ContextStatus::Dying, _) => return Err(SysError::BadContext),
            _ => context.status.store(status),
        }
        Ok(())
    }

    /// Destroys `target`. A context running on another processor is marked
    /// Dying and reaped when that processor next schedules.
    pub fn destroy(&mut self, caller: ContextId, target: ContextId) -> SysResult<()> {
        self.ensure_live()?;
        self.resolve(caller, target, true)?;
        let context = self.context(target)?;
        if context.status() == ContextStatus::Running && caller != target {
            context.status.store(ContextStatus::Dying);
            crate::log_info!(target: "task", "[{caller}] destroying running {target}: dying");
            return Ok(());
        }
        if caller != target {
            crate::log_info!(target: "task", "[{caller}] destroying {target}");
        }
        self.free_context(target);
        Ok(())
    }

    /// Maps a fresh zeroed page at `va` in `target`, replacing any mapping there.
    pub fn page_alloc(&mut self, caller: ContextId, target: ContextId, va: usize, perm: PteFlags) -> SysResult<()> {
        self.ensure_live()?;
        let page = UserPage::decode(va)?;
        let perm = decode_perm(perm)?;
        self.resolve(caller, target, true)?;
        self.map_fresh(target, page.raw(), perm)
    }

    /// Maps the frame behind `src_va` in `src` at `dst_va` in `dst`.
    pub fn page_map(
        &mut self,
        caller: ContextId,
        src: ContextId,
        src_va: usize,
        dst: ContextId,
        dst_va: usize,
        perm: PteFlags,
    ) -> SysResult<()> {
        self.ensure_live()?;
        let src_page = UserPage::decode(src_va)?;
        let dst_page = UserPage::decode(dst_va)?;
        let perm = decode_perm(perm)?;
        self.resolve(caller, src, true)?;
        self.resolve(caller, dst, true)?;
        let pte = self.context(src)?.page_table.lookup(src_page.raw()).ok_or(SysError::NotMapped)?;
        if perm.contains(PteFlags::WRITABLE) && !pte.flags.contains(PteFlags::WRITABLE) {
            return Err(SysError::InvalidPermission);
        }
        self.install(dst, dst_page.raw(), pte.frame, perm)
    }

    /// Removes the mapping at `va` in `target`; unmapped pages are ignored.
    pub fn page_unmap(&mut self, caller: ContextId, target: ContextId, va: usize) -> SysResult<()> {
        self.ensure_live()?;
        let page = UserPage::decode(va)?;
        self.resolve(caller, target, true)?;
        if let Some(old) = self.context_mut(target)?.page_table.remove(page.raw()) {
            self.frames.decref(old.frame);
        }
        Ok(())
    }
}
