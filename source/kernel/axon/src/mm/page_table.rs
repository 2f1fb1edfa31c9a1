// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-context mapping table (virtual page -> frame + flags)
//! OWNERS: @kernel-mm-team
//! PUBLIC API: Pte, PageTable::{insert, remove, lookup, range, clear}
//! DEPENDS_ON: mm::FrameNumber, mm::PteFlags
//! INVARIANTS: Keys are page aligned and below UTOP; every entry is PRESENT;
//!             no entry carries COW together with WRITABLE
//!
//! The table does not own frame references. Callers adjust the frame pool
//! refcounts around `insert`/`remove` (increment the new frame before the old
//! one is released so remapping a page onto itself never frees it).

use super::{is_page_aligned, page_round_down, FrameNumber, MapError, PteFlags};
use crate::types::UTOP;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::ops::Range;

/// A single mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Pte {
    pub frame: FrameNumber,
    pub flags: PteFlags,
}

#[derive(Debug, Default)]
pub struct PageTable {
    entries: BTreeMap<usize, Pte>,
}

impl PageTable {
    pub fn new() -> Self {
        Self { entries: BTreeMap::new() }
    }

    /// Installs `frame` at `va`, returning the entry it replaced.
    pub fn insert(
        &mut self,
        va: usize,
        frame: FrameNumber,
        flags: PteFlags,
    ) -> Result<Option<Pte>, MapError> {
        if !is_page_aligned(va) {
            return Err(MapError::Unaligned);
        }
        if va >= UTOP {
            return Err(MapError::OutOfRange);
        }
        if !flags.contains(PteFlags::PRESENT) {
            return Err(MapError::InvalidFlags);
        }
        if flags.contains(PteFlags::WRITABLE | PteFlags::COW) {
            return Err(MapError::PermissionDenied);
        }
        Ok(self.entries.insert(va, Pte { frame, flags }))
    }

    pub fn remove(&mut self, va: usize) -> Option<Pte> {
        self.entries.remove(&page_round_down(va))
    }

    /// Entry covering `va` (any address inside the page).
    pub fn lookup(&self, va: usize) -> Option<Pte> {
        self.entries.get(&page_round_down(va)).copied()
    }

    /// Sets hardware-maintained bits (ACCESSED/DIRTY) on an existing entry.
    pub(crate) fn mark(&mut self, va: usize, bits: PteFlags) {
        if let Some(pte) = self.entries.get_mut(&page_round_down(va)) {
            pte.flags |= bits & (PteFlags::ACCESSED | PteFlags::DIRTY);
        }
    }

    /// Mappings whose page address lies in `range`, in address order.
    pub fn range(&self, range: Range<usize>) -> impl Iterator<Item = (usize, Pte)> + '_ {
        self.entries.range(range).map(|(va, pte)| (*va, *pte))
    }

    /// Removes every mapping, returning them for refcount release.
    pub fn clear(&mut self) -> Vec<Pte> {
        core::mem::take(&mut self.entries).into_values().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
