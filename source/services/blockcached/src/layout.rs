// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! On-disk geometry and the block window.

use axon::PAGE_SIZE;

/// One block fills one page.
pub const BLOCK_SIZE: usize = PAGE_SIZE;
/// Device sector size.
pub const SECTOR_SIZE: usize = 512;
/// Sectors per block.
pub const BLOCK_SECTORS: u32 = (BLOCK_SIZE / SECTOR_SIZE) as u32;
/// Base of the block window.
pub const DISKMAP: usize = 0x1000_0000;
/// Size of the block window; bounds the largest volume.
pub const DISKSIZE: usize = 0xC000_0000;
/// Block holding the volume header.
pub const SUPER_BLOCK: u32 = 1;
/// First free-block bitmap block.
pub const BITMAP_START: u32 = 2;
/// Blocks tracked by one bitmap block.
pub const BITS_PER_BLOCK: u32 = (BLOCK_SIZE * 8) as u32;
/// Super-block magic.
pub const FS_MAGIC: u32 = 0x4A05_30AE;

static_assertions::const_assert!(BLOCK_SIZE % SECTOR_SIZE == 0);
static_assertions::const_assert!(DISKMAP % BLOCK_SIZE == 0);
static_assertions::const_assert!(DISKMAP + DISKSIZE <= axon::UTOP);

/// Bitmap blocks needed for a volume of `nblocks`.
pub const fn bitmap_blocks(nblocks: u32) -> u32 {
    nblocks.div_ceil(BITS_PER_BLOCK)
}

/// Most blocks the window can address.
pub(crate) const MAX_BLOCKS: u32 = (DISKSIZE / BLOCK_SIZE) as u32;

/// Block behind a window address, if `va` lies in the window.
pub(crate) fn block_of(va: usize) -> Option<u32> {
    va.checked_sub(DISKMAP)
        .filter(|offset| *offset < DISKSIZE)
        .map(|offset| (offset / BLOCK_SIZE) as u32)
}

/// Window address of `block` without range checks.
pub(crate) fn window_address(block: u32) -> usize {
    DISKMAP + block as usize * BLOCK_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_round_trips_blocks() {
        assert_eq!(block_of(window_address(7) + 123), Some(7));
        assert_eq!(block_of(DISKMAP - 1), None);
        assert_eq!(block_of(DISKMAP + DISKSIZE), None);
        assert_eq!(block_of(DISKMAP + DISKSIZE - 1), Some(MAX_BLOCKS - 1));
    }

    #[test]
    fn bitmap_sizing() {
        assert_eq!(bitmap_blocks(1), 1);
        assert_eq!(bitmap_blocks(BITS_PER_BLOCK), 1);
        assert_eq!(bitmap_blocks(BITS_PER_BLOCK + 1), 2);
    }
}
