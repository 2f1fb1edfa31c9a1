// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Identity newtypes and the user address-space layout
//! OWNERS: @kernel-team
//! PUBLIC API: ContextId, CpuId, UTEXT, UTOP, UXSTACKTOP, UXSTACK_BASE, USTACKTOP, PFTEMP
//! INVARIANTS: A ContextId is never 0; slot bits + generation bits fit in 32 bits
//!
//! ## Context identity
//!
//! Slots in the context table are recycled. A [`ContextId`] packs the slot
//! index together with the slot's generation so that an id held across a
//! destroy/recreate cycle no longer resolves.

use crate::mm::PAGE_SIZE;
use core::fmt;

/// Lowest address of user program text.
pub const UTEXT: usize = 0x0080_0000;
/// Top of user-accessible memory; nothing at or above is mappable by user code.
pub const UTOP: usize = 0xEEC0_0000;
/// One past the last byte of the user exception stack.
pub const UXSTACKTOP: usize = UTOP;
/// Base of the single exception stack page.
pub const UXSTACK_BASE: usize = UXSTACKTOP - PAGE_SIZE;
/// Top of the normal user stack. One unmapped guard page separates it from
/// the exception stack.
pub const USTACKTOP: usize = UTOP - 2 * PAGE_SIZE;
/// Scratch page used by user-level fault handlers for copies.
pub const PFTEMP: usize = 0x007F_F000;

/// Number of low id bits holding the slot index.
pub const SLOT_BITS: u32 = 10;
/// Largest context table the id encoding can address.
pub const MAX_SLOTS: usize = 1 << SLOT_BITS;
const SLOT_MASK: u32 = (1 << SLOT_BITS) - 1;
const GENERATION_LIMIT: u32 = 1 << (32 - SLOT_BITS);

static_assertions::const_assert!(UXSTACK_BASE % PAGE_SIZE == 0);
static_assertions::const_assert!(PFTEMP < UTEXT);

/// Stable identifier of an execution context: slot index plus generation.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContextId(u32);

impl ContextId {
    /// Builds an id from a slot and a non-zero generation.
    pub(crate) const fn new(slot: usize, generation: u32) -> Self {
        Self((generation << SLOT_BITS) | (slot as u32 & SLOT_MASK))
    }

    /// Reconstructs an id from its raw encoding (as seen in a return register).
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> u32 {
        self.0
    }

    /// Index of the table slot the id refers to.
    #[inline]
    pub const fn slot(self) -> usize {
        (self.0 & SLOT_MASK) as usize
    }

    #[inline]
    pub const fn generation(self) -> u32 {
        self.0 >> SLOT_BITS
    }

    /// Generation that follows `generation`, skipping 0 on wrap.
    pub(crate) const fn next_generation(generation: u32) -> u32 {
        let next = (generation + 1) % GENERATION_LIMIT;
        if next == 0 {
            1
        } else {
            next
        }
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Processor index.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CpuId(u16);

impl CpuId {
    #[inline]
    pub const fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> u16 {
        self.0
    }

    #[inline]
    pub const fn as_index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_roundtrips_slot_and_generation() {
        let id = ContextId::new(5, 3);
        assert_eq!(id.slot(), 5);
        assert_eq!(id.generation(), 3);
        assert_eq!(ContextId::from_raw(id.as_raw()), id);
        assert_ne!(id.as_raw(), 0);
    }

    #[test]
    fn generation_wrap_skips_zero() {
        assert_eq!(ContextId::next_generation(1), 2);
        assert_eq!(ContextId::next_generation(GENERATION_LIMIT - 1), 1);
    }

    #[test]
    fn same_slot_different_generation_differs() {
        assert_ne!(ContextId::new(7, 1), ContextId::new(7, 2));
    }
}
