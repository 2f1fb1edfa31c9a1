// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel state root: boot, context lookup and read-only queries
//! OWNERS: @kernel-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: tests/kernel.rs + per-module unit tests
//! PUBLIC API: Kernel::{boot, spawn, status, info, contexts, frame, stats, page_attrs,
//!             mapped_pages, current, cpus, take_resume, fault_upcall, halted}
//! DEPENDS_ON: config, mm::{FramePool, PageTable}, task::ContextTable
//! INVARIANTS: Idle contexts occupy slots 0..cpus; a halted kernel rejects every entry point;
//!             destroying a context releases every frame reference it held

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ops::Range;

use crate::config::{ConfigError, KernelConfig};
use crate::mm::{FrameNumber, FramePool, PteFlags, PAGE_SIZE};
use crate::syscall::{KernelPanic, SysError, SysResult};
use crate::task::{
    ContextKind, ContextStats, ContextStatus, ContextTable, ResumeReason, TrapFrame,
};
use crate::trap::FaultHandler;
use crate::types::{ContextId, CpuId, USTACKTOP, UTEXT};

/// Per-processor scheduling state.
pub(crate) struct Cpu {
    pub(crate) id: CpuId,
    pub(crate) idle: ContextId,
    pub(crate) current: Option<ContextId>,
    /// Slot of the context this processor ran last; the round-robin scan starts after it.
    pub(crate) last_slot: Option<usize>,
}

/// Snapshot of a mapping as returned by the introspection queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageAttrs {
    pub frame: FrameNumber,
    pub flags: PteFlags,
}

impl PageAttrs {
    pub fn is_present(&self) -> bool {
        self.flags.contains(PteFlags::PRESENT)
    }

    pub fn is_writable(&self) -> bool {
        self.flags.contains(PteFlags::WRITABLE)
    }

    pub fn is_user(&self) -> bool {
        self.flags.contains(PteFlags::USER)
    }

    pub fn is_dirty(&self) -> bool {
        self.flags.contains(PteFlags::DIRTY)
    }

    pub fn is_cow(&self) -> bool {
        self.flags.contains(PteFlags::COW)
    }
}

/// Public view of a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextInfo {
    pub id: ContextId,
    pub parent: Option<ContextId>,
    pub kind: ContextKind,
    pub status: ContextStatus,
    pub last_cpu: Option<CpuId>,
}

/// The simulated machine: frame pool, context table and processors.
pub struct Kernel {
    pub(crate) frames: FramePool,
    pub(crate) contexts: ContextTable,
    pub(crate) cpus: Vec<Cpu>,
    pub(crate) halted: Option<KernelPanic>,
}

impl Kernel {
    /// Validates `config` and creates one Runnable idle context per processor.
    pub fn boot(config: KernelConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let mut contexts = ContextTable::new(config.max_contexts);
        let mut cpus = Vec::with_capacity(config.cpus);
        for index in 0..config.cpus {
            let idle = contexts
                .allocate(ContextKind::Idle, None)
                .ok_or(ConfigError::TooFewContexts)?;
            if let Some(context) = contexts.get_mut(idle) {
                context.status.store(ContextStatus::Runnable);
            }
            cpus.push(Cpu { id: CpuId::from_raw(index as u16), idle, current: None, last_slot: None });
        }
        crate::log_info!(
            target: "task",
            "boot: {} cpu(s), {} context slots, {} frames",
            config.cpus,
            config.max_contexts,
            config.phys_frames
        );
        Ok(Self {
            frames: FramePool::new(config.phys_frames),
            contexts,
            cpus,
            halted: None,
        })
    }

    /// Boot-loader entry: creates a Runnable user context with one stack page
    /// mapped just below [`USTACKTOP`].
    pub fn spawn(&mut self) -> SysResult<ContextId> {
        self.ensure_live()?;
        let id = self
            .contexts
            .allocate(ContextKind::User, None)
            .ok_or(SysError::NoFreeContext)?;
        if let Err(err) = self.map_fresh(id, USTACKTOP - PAGE_SIZE, PteFlags::USER_RW) {
            self.free_context(id);
            return Err(err);
        }
        let context = self.context_mut(id)?;
        context.frame = TrapFrame { pc: UTEXT as u64, sp: USTACKTOP as u64, ret: 0 };
        context.resume = Some(ResumeReason::Start);
        context.status.store(ContextStatus::Runnable);
        crate::log_info!(target: "task", "[{id}] new context");
        Ok(id)
    }

    pub fn halted(&self) -> Option<KernelPanic> {
        self.halted
    }

    pub fn status(&self, id: ContextId) -> Option<ContextStatus> {
        self.contexts.get(id).map(|context| context.status())
    }

    pub fn info(&self, id: ContextId) -> Option<ContextInfo> {
        self.contexts.get(id).map(|context| ContextInfo {
            id: context.id,
            parent: context.parent,
            kind: context.kind,
            status: context.status(),
            last_cpu: context.last_cpu,
        })
    }

    /// Every live context in slot order.
    pub fn contexts(&self) -> impl Iterator<Item = ContextInfo> + '_ {
        self.contexts.iter().filter_map(|context| self.info(context.id))
    }

    pub fn frame(&self, id: ContextId) -> SysResult<TrapFrame> {
        Ok(self.context(id)?.frame)
    }

    pub fn stats(&self, id: ContextId) -> SysResult<ContextStats> {
        Ok(self.context(id)?.stats)
    }

    /// Mapping covering `va` in `id`'s table.
    pub fn page_attrs(&self, id: ContextId, va: usize) -> SysResult<Option<PageAttrs>> {
        Ok(self
            .context(id)?
            .page_table
            .lookup(va)
            .map(|pte| PageAttrs { frame: pte.frame, flags: pte.flags }))
    }

    /// Mappings whose page address lies in `range`, in address order.
    pub fn mapped_pages(&self, id: ContextId, range: Range<usize>) -> SysResult<Vec<(usize, PageAttrs)>> {
        Ok(self
            .context(id)?
            .page_table
            .range(range)
            .map(|(va, pte)| (va, PageAttrs { frame: pte.frame, flags: pte.flags }))
            .collect())
    }

    pub fn fault_upcall(&self, id: ContextId) -> SysResult<Option<Arc<dyn FaultHandler>>> {
        Ok(self.context(id)?.upcall.clone())
    }

    /// Consumes the pending resumption reason of `id`.
    pub fn take_resume(&mut self, id: ContextId) -> SysResult<Option<ResumeReason>> {
        Ok(self.context_mut(id)?.resume.take())
    }

    pub fn current(&self, cpu: CpuId) -> Option<ContextId> {
        self.cpus.get(cpu.as_index()).and_then(|state| state.current)
    }

    pub fn idle_context(&self, cpu: CpuId) -> Option<ContextId> {
        self.cpus.get(cpu.as_index()).map(|state| state.idle)
    }

    pub fn cpus(&self) -> impl Iterator<Item = CpuId> + '_ {
        self.cpus.iter().map(|state| state.id)
    }

    /// Processor `id` is currently running on, if any.
    pub fn cpu_of(&self, id: ContextId) -> Option<CpuId> {
        self.cpus.iter().find(|state| state.current == Some(id)).map(|state| state.id)
    }

    pub fn frames_in_use(&self) -> usize {
        self.frames.in_use()
    }

    pub fn frame_refs(&self, frame: FrameNumber) -> u32 {
        self.frames.refs(frame)
    }

    pub(crate) fn ensure_live(&self) -> SysResult<()> {
        match self.halted {
            Some(panic) => Err(SysError::Halted(panic)),
            None => Ok(()),
        }
    }

    /// Latches a kernel panic; the returned error is what the failing entry point reports.
    pub(crate) fn panic(&mut self, panic: KernelPanic) -> SysError {
        crate::log_error!(target: "task", "kernel panic: {panic}");
        if self.halted.is_none() {
            self.halted = Some(panic);
        }
        SysError::Halted(panic)
    }

    pub(crate) fn context(&self, id: ContextId) -> SysResult<&crate::task::Context> {
        self.contexts.get(id).ok_or(SysError::BadContext)
    }

    pub(crate) fn context_mut(&mut self, id: ContextId) -> SysResult<&mut crate::task::Context> {
        self.contexts.get_mut(id).ok_or(SysError::BadContext)
    }

    /// Resolves `target` on behalf of `caller`. With `check_perm`, the caller
    /// must be the target itself or its immediate parent.
    pub(crate) fn resolve(&self, caller: ContextId, target: ContextId, check_perm: bool) -> SysResult<()> {
        self.context(caller)?;
        let context = self.context(target)?;
        if check_perm && caller != target && context.parent != Some(caller) {
            return Err(SysError::PermissionDenied);
        }
        Ok(())
    }

    /// Allocates a zeroed frame and maps it at `va` in `id`.
    pub(crate) fn map_fresh(&mut self, id: ContextId, va: usize, perm: PteFlags) -> SysResult<()> {
        let Some(frame) = self.frames.alloc_zeroed() else {
            crate::log_warn!(target: "mm", "[{id}] out of frames mapping {va:#010x}");
            return Err(SysError::NoMemory);
        };
        if let Err(err) = self.install(id, va, frame, perm) {
            self.frames.release_unused(frame);
            return Err(err);
        }
        Ok(())
    }

    /// Maps `frame` at `va`, taking a reference before the replaced mapping
    /// drops its own.
    pub(crate) fn install(&mut self, id: ContextId, va: usize, frame: FrameNumber, perm: PteFlags) -> SysResult<()> {
        let context = self.contexts.get_mut(id).ok_or(SysError::BadContext)?;
        let previous = context.page_table.insert(va, frame, perm)?;
        self.frames.incref(frame);
        if let Some(old) = previous {
            self.frames.decref(old.frame);
        }
        Ok(())
    }

    /// Frees `id` immediately: releases its mappings and vacates its slot.
    pub(crate) fn free_context(&mut self, id: ContextId) {
        let Some(mut context) = self.contexts.free(id) else {
            return;
        };
        for pte in context.page_table.clear() {
            self.frames.decref(pte.frame);
        }
        for cpu in self.cpus.iter_mut().filter(|cpu| cpu.current == Some(id)) {
            cpu.current = None;
        }
        crate::log_info!(target: "task", "[{id}] free context");
    }
}

#[cfg(feature = "failpoints")]
pub mod failpoints {
    use super::Kernel;

    /// Forces the next frame allocation of `kernel` to fail with `NoMemory`.
    pub fn deny_next_frame(kernel: &mut Kernel) {
        kernel.frames.deny_next_alloc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boot_creates_idle_contexts_in_low_slots() {
        let kernel = Kernel::boot(KernelConfig { cpus: 2, ..KernelConfig::default() }).expect("boot");
        let idle: Vec<_> = kernel.cpus().filter_map(|cpu| kernel.idle_context(cpu)).collect();
        assert_eq!(idle.iter().map(|id| id.slot()).collect::<Vec<_>>(), vec![0, 1]);
        for id in idle {
            let info = kernel.info(id).expect("idle context");
            assert_eq!(info.kind, ContextKind::Idle);
            assert_eq!(info.status, ContextStatus::Runnable);
        }
    }

    #[test]
    fn spawn_maps_a_stack_page() {
        let mut kernel = Kernel::boot(KernelConfig::default()).expect("boot");
        let id = kernel.spawn().expect("spawn");
        let attrs = kernel
            .page_attrs(id, USTACKTOP - 1)
            .expect("live context")
            .expect("stack mapped");
        assert!(attrs.is_writable() && attrs.is_user());
        assert_eq!(kernel.frame(id).expect("frame").sp, USTACKTOP as u64);
        assert_eq!(kernel.take_resume(id).expect("resume"), Some(ResumeReason::Start));
        assert_eq!(kernel.take_resume(id).expect("resume"), None);
    }

    #[test]
    fn free_context_releases_frames() {
        let mut kernel = Kernel::boot(KernelConfig::default()).expect("boot");
        let id = kernel.spawn().expect("spawn");
        assert_eq!(kernel.frames_in_use(), 1);
        kernel.free_context(id);
        assert_eq!(kernel.frames_in_use(), 0);
        assert!(kernel.status(id).is_none());
    }

    #[test]
    fn spawn_without_frames_leaves_no_context() {
        let mut kernel =
            Kernel::boot(KernelConfig { phys_frames: 1, ..KernelConfig::default() }).expect("boot");
        kernel.spawn().expect("first spawn");
        assert_eq!(kernel.spawn(), Err(SysError::NoMemory));
        assert_eq!(kernel.contexts().filter(|info| info.kind == ContextKind::User).count(), 1);
    }
}
