// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Synchronous sector-addressed backing store
//! OWNERS: @storage
//! PUBLIC API: BlockDevice, MemDisk::{new, format, counters, mark_used, resident_blocks}, IoCounters
//! INVARIANTS: Transfers are whole sectors; every call counts as one operation;
//!   a block is backed by memory only once written

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::DiskError;
use crate::layout::{bitmap_blocks, BITMAP_START, BITS_PER_BLOCK, BLOCK_SIZE, FS_MAGIC, SECTOR_SIZE, SUPER_BLOCK};

static ZERO_BLOCK: [u8; BLOCK_SIZE] = [0; BLOCK_SIZE];

/// A disk the cache reads blocks from and writes them back to.
pub trait BlockDevice: Send {
    /// Fills `buf` starting at `sector`.
    fn read_sectors(&mut self, sector: u32, buf: &mut [u8]) -> Result<(), DiskError>;
    /// Writes `buf` starting at `sector`.
    fn write_sectors(&mut self, sector: u32, buf: &[u8]) -> Result<(), DiskError>;
}

/// Operation counters shared between a [`MemDisk`] and its observers.
#[derive(Debug, Default)]
pub struct IoCounters {
    reads: AtomicU64,
    writes: AtomicU64,
    written: Mutex<Vec<u32>>,
    fail_next: AtomicBool,
}

impl IoCounters {
    /// Completed read calls.
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Completed write calls.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// First sector of every completed write, oldest first.
    pub fn written_sectors(&self) -> Vec<u32> {
        self.written.lock().clone()
    }

    /// Makes the next transfer fail with [`DiskError::Io`].
    pub fn fail_next_io(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    fn take_failure(&self) -> bool {
        self.fail_next.swap(false, Ordering::SeqCst)
    }
}

/// RAM-backed disk. Blocks are allocated on first write; untouched blocks
/// read as zeros.
pub struct MemDisk {
    nblocks: u32,
    blocks: BTreeMap<u32, Box<[u8]>>,
    counters: Arc<IoCounters>,
}

impl MemDisk {
    /// A zero-filled disk of `nblocks` blocks.
    pub fn new(nblocks: u32) -> Self {
        Self { nblocks, blocks: BTreeMap::new(), counters: Arc::default() }
    }

    /// A disk holding an empty volume: super block at block 1 and a bitmap
    /// from block 2 with every block free except 0, 1 and the bitmap itself.
    /// `nblocks` must cover those reserved blocks.
    pub fn format(nblocks: u32) -> Self {
        let mut disk = Self::new(nblocks);
        let header = disk.block_mut(SUPER_BLOCK);
        header[0..4].copy_from_slice(&FS_MAGIC.to_le_bytes());
        header[4..8].copy_from_slice(&nblocks.to_le_bytes());

        let bitmap = BITMAP_START..BITMAP_START + bitmap_blocks(nblocks);
        for block in bitmap.clone() {
            disk.block_mut(block).fill(0xFF);
        }
        for block in [0, SUPER_BLOCK].into_iter().chain(bitmap) {
            disk.set_free(block, false);
        }
        disk
    }

    /// Handle on the operation counters.
    pub fn counters(&self) -> Arc<IoCounters> {
        self.counters.clone()
    }

    /// Device size in blocks.
    pub fn nblocks(&self) -> u32 {
        self.nblocks
    }

    /// Blocks currently backed by memory.
    pub fn resident_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Marks `block` allocated in the bitmap.
    pub fn mark_used(&mut self, block: u32) {
        self.set_free(block, false);
    }

    /// Raw contents of `block`.
    pub fn block(&self, block: u32) -> &[u8] {
        self.blocks.get(&block).map_or(&ZERO_BLOCK[..], |data| &data[..])
    }

    fn block_mut(&mut self, block: u32) -> &mut [u8] {
        self.blocks.entry(block).or_insert_with(|| vec![0; BLOCK_SIZE].into_boxed_slice())
    }

    fn set_free(&mut self, block: u32, free: bool) {
        let bitmap = BITMAP_START + block / BITS_PER_BLOCK;
        let bit = (block % BITS_PER_BLOCK) as usize;
        let byte = &mut self.block_mut(bitmap)[bit / 8];
        if free {
            *byte |= 1 << (bit % 8);
        } else {
            *byte &= !(1 << (bit % 8));
        }
    }

    /// Byte offset of `sector` after checking that `len` bytes fit.
    fn span(&self, sector: u32, len: usize) -> Result<usize, DiskError> {
        if len % SECTOR_SIZE != 0 {
            return Err(DiskError::Unaligned { len });
        }
        let start = sector as usize * SECTOR_SIZE;
        if start + len > self.nblocks as usize * BLOCK_SIZE {
            return Err(DiskError::OutOfRange {
                start: u64::from(sector),
                end: u64::from(sector) + (len / SECTOR_SIZE) as u64,
            });
        }
        Ok(start)
    }

    /// Splits `[start, start + len)` at block boundaries.
    fn pieces(start: usize, len: usize) -> impl Iterator<Item = (u32, usize, std::ops::Range<usize>)> {
        let mut done = 0;
        std::iter::from_fn(move || {
            if done == len {
                return None;
            }
            let pos = start + done;
            let offset = pos % BLOCK_SIZE;
            let take = (BLOCK_SIZE - offset).min(len - done);
            let piece = ((pos / BLOCK_SIZE) as u32, offset, done..done + take);
            done += take;
            Some(piece)
        })
    }
}

impl BlockDevice for MemDisk {
    fn read_sectors(&mut self, sector: u32, buf: &mut [u8]) -> Result<(), DiskError> {
        let start = self.span(sector, buf.len())?;
        if self.counters.take_failure() {
            return Err(DiskError::Io { sector });
        }
        for (block, offset, range) in Self::pieces(start, buf.len()) {
            let len = range.len();
            buf[range].copy_from_slice(&self.block(block)[offset..offset + len]);
        }
        self.counters.reads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn write_sectors(&mut self, sector: u32, buf: &[u8]) -> Result<(), DiskError> {
        let start = self.span(sector, buf.len())?;
        if self.counters.take_failure() {
            return Err(DiskError::Io { sector });
        }
        for (block, offset, range) in Self::pieces(start, buf.len()) {
            let len = range.len();
            self.block_mut(block)[offset..offset + len].copy_from_slice(&buf[range]);
        }
        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        self.counters.written.lock().push(sector);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::BLOCK_SECTORS;

    fn is_free(disk: &MemDisk, block: u32) -> bool {
        let bitmap = disk.block(BITMAP_START + block / BITS_PER_BLOCK);
        let bit = (block % BITS_PER_BLOCK) as usize;
        bitmap[bit / 8] & (1 << (bit % 8)) != 0
    }

    #[test]
    fn format_reserves_header_and_bitmap() {
        let disk = MemDisk::format(64);
        assert_eq!(&disk.block(SUPER_BLOCK)[0..4], &FS_MAGIC.to_le_bytes());
        assert_eq!(&disk.block(SUPER_BLOCK)[4..8], &64u32.to_le_bytes());
        assert!(!is_free(&disk, 0));
        assert!(!is_free(&disk, SUPER_BLOCK));
        assert!(!is_free(&disk, BITMAP_START));
        assert!(is_free(&disk, BITMAP_START + 1));
        assert!(is_free(&disk, 63));
    }

    #[test]
    fn transfers_count_and_check_bounds() {
        let mut disk = MemDisk::new(4);
        let counters = disk.counters();
        let mut buf = vec![0u8; BLOCK_SIZE];
        disk.write_sectors(BLOCK_SECTORS, &[7u8; BLOCK_SIZE]).expect("write");
        disk.read_sectors(BLOCK_SECTORS, &mut buf).expect("read");
        assert!(buf.iter().all(|byte| *byte == 7));
        assert_eq!((counters.reads(), counters.writes()), (1, 1));

        assert_eq!(
            disk.read_sectors(4 * BLOCK_SECTORS, &mut buf[..SECTOR_SIZE]),
            Err(DiskError::OutOfRange { start: 32, end: 33 })
        );
        assert_eq!(disk.read_sectors(0, &mut buf[..100]), Err(DiskError::Unaligned { len: 100 }));
    }

    #[test]
    fn injected_failure_hits_one_transfer() {
        let mut disk = MemDisk::new(2);
        let counters = disk.counters();
        counters.fail_next_io();
        let mut buf = [0u8; SECTOR_SIZE];
        assert_eq!(disk.read_sectors(3, &mut buf), Err(DiskError::Io { sector: 3 }));
        disk.read_sectors(3, &mut buf).expect("second read");
        assert_eq!(counters.reads(), 1);
    }

    #[test]
    fn transfers_may_straddle_blocks() {
        let mut disk = MemDisk::new(4);
        let data: Vec<u8> = (0..2 * SECTOR_SIZE).map(|i| i as u8).collect();
        disk.write_sectors(BLOCK_SECTORS - 1, &data).expect("write");
        let mut back = vec![0u8; data.len()];
        disk.read_sectors(BLOCK_SECTORS - 1, &mut back).expect("read");
        assert_eq!(back, data);
        assert_eq!(disk.resident_blocks(), 2);
        assert_eq!(disk.counters().written_sectors(), vec![BLOCK_SECTORS - 1]);
    }

    #[test]
    fn largest_volume_formats_without_backing_every_block() {
        let nblocks = crate::layout::MAX_BLOCKS;
        let disk = MemDisk::format(nblocks);
        assert_eq!(disk.nblocks(), nblocks);
        assert_eq!(disk.resident_blocks(), 1 + bitmap_blocks(nblocks) as usize);
        assert!(!is_free(&disk, BITMAP_START + bitmap_blocks(nblocks) - 1));
        assert!(is_free(&disk, nblocks - 1));
        assert!(disk.block(nblocks - 1).iter().all(|byte| *byte == 0));
    }
}
