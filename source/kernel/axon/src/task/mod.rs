// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Execution contexts and the generation-checked context table
//! OWNERS: @kernel-sched-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests (allocation, stale ids, status claims)
//! PUBLIC API: ContextTable, Context, ContextStatus, ContextKind, TrapFrame, ResumeReason
//! DEPENDS_ON: mm::PageTable, trap::FaultHandler, types::ContextId
//! INVARIANTS: A freed slot bumps its generation; lookups with a stale generation fail;
//!             Runnable -> Running only through StatusCell::claim

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU8, Ordering};

use crate::mm::{PageTable, PteFlags};
use crate::trap::FaultHandler;
use crate::types::{ContextId, CpuId};

/// Lifecycle status of a context.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextStatus {
    Free = 0,
    Runnable = 1,
    Running = 2,
    /// Blocked (waiting in `recv`, or not yet released after exofork).
    NotRunnable = 3,
    /// Destroyed while running on another processor; reaped on its next reschedule.
    Dying = 4,
}

impl ContextStatus {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Runnable,
            2 => Self::Running,
            3 => Self::NotRunnable,
            4 => Self::Dying,
            _ => Self::Free,
        }
    }
}

/// Atomic status cell. Processors share the table, so the Runnable to
/// Running transition is a compare-exchange.
#[derive(Debug)]
pub struct StatusCell(AtomicU8);

impl StatusCell {
    pub const fn new(status: ContextStatus) -> Self {
        Self(AtomicU8::new(status as u8))
    }

    pub fn load(&self) -> ContextStatus {
        ContextStatus::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, status: ContextStatus) {
        self.0.store(status as u8, Ordering::Release);
    }

    /// Claims a Runnable context for execution. Fails if another processor
    /// got there first or the context is not Runnable.
    #[must_use]
    pub fn claim(&self) -> bool {
        self.0
            .compare_exchange(
                ContextStatus::Runnable as u8,
                ContextStatus::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextKind {
    /// Per-processor idle context, kernel owned.
    Idle,
    User,
}

/// Saved register state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrapFrame {
    /// Instruction counter; advanced once per user memory access.
    pub pc: u64,
    pub sp: u64,
    /// Return register of the last kernel entry.
    pub ret: u64,
}

/// Why a context is being dispatched, consumed by its runtime on resumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeReason {
    /// First dispatch of a boot-loaded context.
    Start,
    /// First dispatch of an exofork child; its return register is 0.
    ExoforkChild,
    /// A blocked `recv` completed.
    IpcDelivered,
}

/// One-slot inbound IPC state.
#[derive(Debug, Clone, Copy)]
pub struct Mailbox {
    pub receiving: bool,
    pub dst: Option<usize>,
    pub value: u32,
    pub from: Option<ContextId>,
    pub perm: PteFlags,
}

impl Default for Mailbox {
    fn default() -> Self {
        Self { receiving: false, dst: None, value: 0, from: None, perm: PteFlags::empty() }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContextStats {
    /// Faults delivered to the upcall.
    pub faults: u64,
    /// Times the scheduler dispatched the context.
    pub dispatches: u64,
}

pub struct Context {
    pub(crate) id: ContextId,
    pub(crate) parent: Option<ContextId>,
    pub(crate) kind: ContextKind,
    pub(crate) status: StatusCell,
    pub(crate) page_table: PageTable,
    pub(crate) frame: TrapFrame,
    pub(crate) upcall: Option<Arc<dyn FaultHandler>>,
    pub(crate) mailbox: Mailbox,
    pub(crate) resume: Option<ResumeReason>,
    pub(crate) last_cpu: Option<CpuId>,
    pub(crate) stats: ContextStats,
}

impl Context {
    fn new(id: ContextId, kind: ContextKind, parent: Option<ContextId>) -> Self {
        Self {
            id,
            parent,
            kind,
            status: StatusCell::new(ContextStatus::NotRunnable),
            page_table: PageTable::new(),
            frame: TrapFrame::default(),
            upcall: None,
            mailbox: Mailbox::default(),
            resume: None,
            last_cpu: None,
            stats: ContextStats::default(),
        }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn parent(&self) -> Option<ContextId> {
        self.parent
    }

    pub fn kind(&self) -> ContextKind {
        self.kind
    }

    pub fn status(&self) -> ContextStatus {
        self.status.load()
    }

    pub fn page_table(&self) -> &PageTable {
        &self.page_table
    }
}

struct Slot {
    generation: u32,
    context: Option<Context>,
}

/// Fixed-size table of contexts indexed by slot.
pub struct ContextTable {
    slots: Vec<Slot>,
}

impl ContextTable {
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity).map(|_| Slot { generation: 1, context: None }).collect();
        Self { slots }
    }

    /// Occupies the lowest free slot with a NotRunnable context.
    pub fn allocate(&mut self, kind: ContextKind, parent: Option<ContextId>) -> Option<ContextId> {
        let (index, slot) = self.slots.iter_mut().enumerate().find(|(_, s)| s.context.is_none())?;
        let id = ContextId::new(index, slot.generation);
        slot.context = Some(Context::new(id, kind, parent));
        Some(id)
    }

    pub fn get(&self, id: ContextId) -> Option<&Context> {
        let slot = self.slots.get(id.slot())?;
        if slot.generation != id.generation() {
            return None;
        }
        slot.context.as_ref()
    }

    pub fn get_mut(&mut self, id: ContextId) -> Option<&mut Context> {
        let slot = self.slots.get_mut(id.slot())?;
        if slot.generation != id.generation() {
            return None;
        }
        slot.context.as_mut()
    }

    /// Context currently occupying `index`, whatever its generation.
    pub fn slot(&self, index: usize) -> Option<&Context> {
        self.slots.get(index).and_then(|slot| slot.context.as_ref())
    }

    /// Vacates the slot and bumps its generation so `id` no longer resolves.
    pub fn free(&mut self, id: ContextId) -> Option<Context> {
        let slot = self.slots.get_mut(id.slot())?;
        if slot.generation != id.generation() {
            return None;
        }
        let mut context = slot.context.take()?;
        context.status.store(ContextStatus::Free);
        slot.generation = ContextId::next_generation(slot.generation);
        Some(context)
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Context> + '_ {
        self.slots.iter().filter_map(|slot| slot.context.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_takes_lowest_free_slot() {
        let mut table = ContextTable::new(4);
        let a = table.allocate(ContextKind::User, None).expect("slot");
        let b = table.allocate(ContextKind::User, Some(a)).expect("slot");
        assert_eq!((a.slot(), b.slot()), (0, 1));
        assert_eq!(table.get(b).and_then(Context::parent), Some(a));
        table.free(a).expect("free");
        let c = table.allocate(ContextKind::User, None).expect("slot");
        assert_eq!(c.slot(), 0);
    }

    #[test]
    fn stale_id_does_not_resolve_after_reuse() {
        let mut table = ContextTable::new(2);
        let old = table.allocate(ContextKind::User, None).expect("slot");
        table.free(old).expect("free");
        let new = table.allocate(ContextKind::User, None).expect("slot");
        assert_eq!(old.slot(), new.slot());
        assert_ne!(old, new);
        assert!(table.get(old).is_none());
        assert!(table.free(old).is_none());
        assert!(table.get(new).is_some());
    }

    #[test]
    fn table_full_returns_none() {
        let mut table = ContextTable::new(1);
        table.allocate(ContextKind::Idle, None).expect("slot");
        assert!(table.allocate(ContextKind::User, None).is_none());
    }

    #[test]
    fn claim_only_succeeds_from_runnable() {
        let cell = StatusCell::new(ContextStatus::NotRunnable);
        assert!(!cell.claim());
        cell.store(ContextStatus::Runnable);
        assert!(cell.claim());
        assert_eq!(cell.load(), ContextStatus::Running);
        assert!(!cell.claim());
    }
}
