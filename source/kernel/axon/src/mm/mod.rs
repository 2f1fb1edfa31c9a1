// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Physical frames and per-context mapping tables.

pub mod frame;
pub mod page_table;

pub use frame::{FrameNumber, FramePool};
pub use page_table::{PageTable, Pte};

use bitflags::bitflags;
use core::fmt;

/// Size of a page in bytes.
pub const PAGE_SIZE: usize = 4096;

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    /// Flags stored in a mapping table entry. Bit values follow the x86 PTE layout.
    pub struct PteFlags: u32 {
        const PRESENT = 0x001;
        const WRITABLE = 0x002;
        const USER = 0x004;
        const ACCESSED = 0x020;
        const DIRTY = 0x040;
        /// Copy-on-write marker, kept in a software-available bit.
        const COW = 0x800;
    }
}

impl PteFlags {
    /// Readable user page.
    pub const USER_RO: Self = Self::PRESENT.union(Self::USER);
    /// Readable and writable user page.
    pub const USER_RW: Self = Self::USER_RO.union(Self::WRITABLE);
    /// Shared copy-on-write user page.
    pub const USER_COW: Self = Self::USER_RO.union(Self::COW);
    /// Bits user code may request through the mapping entry points.
    pub const SYSCALL: Self = Self::USER_RW.union(Self::COW);

    /// Whether `self` is acceptable as a permission set for a user mapping:
    /// present and user, nothing outside [`Self::SYSCALL`], and never
    /// copy-on-write together with writable.
    pub const fn is_valid_user_perm(self) -> bool {
        self.contains(Self::USER_RO)
            && Self::SYSCALL.contains(self)
            && !self.contains(Self::WRITABLE.union(Self::COW))
    }
}

/// Error returned by mapping operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// Virtual address is not page aligned.
    Unaligned,
    /// Address lies at or above the top of user memory.
    OutOfRange,
    /// Mapping would combine copy-on-write with writable.
    PermissionDenied,
    /// Provided flags are not suitable for installing a mapping.
    InvalidFlags,
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unaligned => write!(f, "address not page aligned"),
            Self::OutOfRange => write!(f, "address outside user memory"),
            Self::PermissionDenied => write!(f, "copy-on-write mapping must not be writable"),
            Self::InvalidFlags => write!(f, "invalid mapping flags"),
        }
    }
}

/// Rounds `va` down to the containing page boundary.
#[inline]
pub const fn page_round_down(va: usize) -> usize {
    va & !(PAGE_SIZE - 1)
}

/// Offset of `va` within its page.
#[inline]
pub const fn page_offset(va: usize) -> usize {
    va & (PAGE_SIZE - 1)
}

#[inline]
pub const fn is_page_aligned(va: usize) -> bool {
    page_offset(va) == 0
}
