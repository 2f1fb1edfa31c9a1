// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Demand-paged view of a block device through the block window
//! OWNERS: @storage
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests + tests/cache.rs
//! PUBLIC API: BlockCache::{new, attach, mount, block_address, flush, evict, block_is_free,
//!             read_block, write_block, check}
//! DEPENDS_ON: axon_rt::{install_handler, Env}, disk::BlockDevice
//! INVARIANTS: A faulted-in block is clean; the bitmap check runs only after the fill;
//!             the device lock is never held across a kernel call
//!
//! ## Fault path
//!
//! 1. The address must lie in the window and name a block inside the volume.
//! 2. A fresh page is mapped at the block's window address and filled from
//!    the device.
//! 3. The page is remapped onto itself so the fill does not leave it dirty.
//! 4. Once mounted, the block is checked against the free-block bitmap. The
//!    bitmap lives in the window too, so this may fault again (nested).
//!
//! There is no eviction policy; pages stay mapped until [`BlockCache::evict`].

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use axon::{page_round_down, PteFlags, UTrapFrame};
use axon_rt::{handler_fn, install_handler, Env, FaultError};
use parking_lot::Mutex;

use crate::disk::BlockDevice;
use crate::error::{CacheError, Result};
use crate::layout::{
    bitmap_blocks, block_of, window_address, BITMAP_START, BLOCK_SECTORS, BLOCK_SIZE, FS_MAGIC, MAX_BLOCKS,
    SUPER_BLOCK,
};

const SMASH: &[u8] = b"OOPS!\n\0";

struct Shared {
    device: Mutex<Box<dyn BlockDevice>>,
    /// Volume size; 0 until mounted.
    nblocks: AtomicU32,
    bitmap: AtomicBool,
}

/// Block cache over one device. Clones share the device and volume state.
#[derive(Clone)]
pub struct BlockCache {
    shared: Arc<Shared>,
}

impl BlockCache {
    /// Wraps `device`; nothing is read until [`BlockCache::mount`] or a fault.
    pub fn new(device: impl BlockDevice + 'static) -> Self {
        Self {
            shared: Arc::new(Shared {
                device: Mutex::new(Box::new(device)),
                nblocks: AtomicU32::new(0),
                bitmap: AtomicBool::new(false),
            }),
        }
    }

    /// Volume size once mounted.
    pub fn nblocks(&self) -> Option<u32> {
        match self.shared.nblocks.load(Ordering::Acquire) {
            0 => None,
            n => Some(n),
        }
    }

    /// Installs the cache's fault handler in the calling context.
    pub fn attach(&self, env: &mut Env<'_>) -> Result<()> {
        let cache = self.clone();
        install_handler(env, handler_fn(move |env, utf| cache.fault(env, utf).map_err(FaultError::from)))?;
        log::debug!(target: "bc", "[{}] block window attached", env.id());
        Ok(())
    }

    /// Window address of `block`. Block 0 never maps; past the end of a
    /// mounted volume is out of range.
    pub fn block_address(&self, block: u32) -> Result<usize> {
        if block == 0 || block >= MAX_BLOCKS || self.nblocks().is_some_and(|n| block >= n) {
            return Err(CacheError::BadBlock { block });
        }
        Ok(window_address(block))
    }

    /// Reads and validates the super block, then turns on bitmap checks.
    pub fn mount(&self, env: &mut Env<'_>) -> Result<()> {
        let header = window_address(SUPER_BLOCK);
        let found = env.read_u32(header)?;
        if found != FS_MAGIC {
            return Err(CacheError::BadMagic { found });
        }
        let nblocks = env.read_u32(header + 4)?;
        if nblocks > MAX_BLOCKS || nblocks < BITMAP_START + bitmap_blocks(nblocks) {
            return Err(CacheError::BadVolume { nblocks });
        }
        self.shared.nblocks.store(nblocks, Ordering::Release);
        self.shared.bitmap.store(true, Ordering::Release);
        self.check_bitmap(env)?;
        log::info!(target: "bc", "[{}] mounted volume of {nblocks} blocks", env.id());
        Ok(())
    }

    /// Writes the block containing `va` back if it is cached and dirty, then
    /// clears its dirty bit. Anything else is a no-op.
    pub fn flush(&self, env: &mut Env<'_>, va: usize) -> Result<()> {
        let block = block_of(va).ok_or(CacheError::OutsideWindow { va })?;
        let page = page_round_down(va);
        let Some(attrs) = env.page_attrs(page)? else {
            return Ok(());
        };
        if !attrs.is_dirty() {
            return Ok(());
        }
        let mut buf = vec![0u8; BLOCK_SIZE];
        env.read(page, &mut buf)?;
        self.shared.device.lock().write_sectors(block * BLOCK_SECTORS, &buf)?;
        let me = env.id();
        env.page_map(me, page, me, page, attrs.flags & PteFlags::SYSCALL)?;
        log::trace!(target: "bc", "[{me}] flushed block {block}");
        Ok(())
    }

    /// Drops `block` from the cache. Unflushed changes are lost.
    pub fn evict(&self, env: &mut Env<'_>, block: u32) -> Result<()> {
        let va = self.block_address(block)?;
        let me = env.id();
        env.page_unmap(me, va)?;
        Ok(())
    }

    /// Whether the bitmap marks `block` free. Unmounted volumes and blocks
    /// past the end report in-use.
    pub fn block_is_free(&self, env: &mut Env<'_>, block: u32) -> Result<bool> {
        let Some(nblocks) = self.nblocks() else {
            return Ok(false);
        };
        if block >= nblocks {
            return Ok(false);
        }
        let word = window_address(BITMAP_START) + (block / 32) as usize * 4;
        Ok(env.read_u32(word)? & (1 << (block % 32)) != 0)
    }

    /// Copies the start of `block` into `buf`.
    pub fn read_block(&self, env: &mut Env<'_>, block: u32, buf: &mut [u8]) -> Result<()> {
        if buf.len() > BLOCK_SIZE {
            return Err(CacheError::BufferTooLarge { len: buf.len() });
        }
        let va = self.block_address(block)?;
        env.read(va, buf)?;
        Ok(())
    }

    /// Overwrites the start of `block` with `data` in the cache.
    pub fn write_block(&self, env: &mut Env<'_>, block: u32, data: &[u8]) -> Result<()> {
        if data.len() > BLOCK_SIZE {
            return Err(CacheError::BufferTooLarge { len: data.len() });
        }
        let va = self.block_address(block)?;
        env.write(va, data)?;
        Ok(())
    }

    /// Self-test: smash the super block, flush, evict, reload, compare, and
    /// put the original back.
    pub fn check(&self, env: &mut Env<'_>) -> Result<()> {
        let header = self.block_address(SUPER_BLOCK)?;
        let mut backup = vec![0u8; BLOCK_SIZE];
        env.read(header, &mut backup)?;

        env.write(header, SMASH)?;
        self.flush(env, header)?;
        if !env.is_mapped(header)? {
            return Err(CacheError::SelfCheck("flush unmapped the block"));
        }
        if env.is_dirty(header)? {
            return Err(CacheError::SelfCheck("flush left the block dirty"));
        }

        self.evict(env, SUPER_BLOCK)?;
        if env.is_mapped(header)? {
            return Err(CacheError::SelfCheck("evicted block still mapped"));
        }
        let mut reloaded = vec![0u8; SMASH.len()];
        env.read(header, &mut reloaded)?;
        if reloaded != SMASH {
            return Err(CacheError::SelfCheck("flushed contents did not reach the device"));
        }

        env.write(header, &backup)?;
        self.flush(env, header)?;
        log::info!(target: "bc", "[{}] block cache is good", env.id());
        Ok(())
    }

    fn check_bitmap(&self, env: &mut Env<'_>) -> Result<()> {
        let nblocks = self.nblocks().unwrap_or(0);
        let reserved = [0, SUPER_BLOCK].into_iter().chain(BITMAP_START..BITMAP_START + bitmap_blocks(nblocks));
        for block in reserved {
            if self.block_is_free(env, block)? {
                return Err(CacheError::BitmapCorrupt { block });
            }
        }
        Ok(())
    }

    fn fault(&self, env: &mut Env<'_>, utf: &UTrapFrame) -> Result<()> {
        let va = utf.fault_va();
        let block = block_of(va).ok_or(CacheError::OutsideWindow { va })?;
        if self.nblocks().is_some_and(|n| block >= n) {
            return Err(CacheError::BadBlock { block });
        }

        let me = env.id();
        let page = page_round_down(va);
        env.page_alloc(me, page, PteFlags::USER_RW)?;
        let mut buf = vec![0u8; BLOCK_SIZE];
        self.shared.device.lock().read_sectors(block * BLOCK_SECTORS, &mut buf)?;
        env.write(page, &buf)?;
        env.page_map(me, page, me, page, PteFlags::USER_RW)?;
        log::trace!(target: "bc", "[{me}] paged in block {block}");

        if self.shared.bitmap.load(Ordering::Acquire) && self.block_is_free(env, block)? {
            return Err(CacheError::FreeBlock { block });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use axon::{Kernel, KernelConfig};

    use super::*;
    use crate::disk::MemDisk;

    #[test]
    fn block_address_bounds_follow_the_volume() {
        let cache = BlockCache::new(MemDisk::format(16));
        assert_eq!(cache.block_address(0), Err(CacheError::BadBlock { block: 0 }));
        assert_eq!(cache.block_address(1000), Ok(window_address(1000)));

        let mut kernel = Kernel::boot(KernelConfig::default()).expect("boot");
        let id = kernel.spawn().expect("spawn");
        let mut env = Env::new(&mut kernel, id);
        cache.attach(&mut env).expect("attach");
        cache.mount(&mut env).expect("mount");
        assert_eq!(cache.nblocks(), Some(16));
        assert_eq!(cache.block_address(15), Ok(window_address(15)));
        assert_eq!(cache.block_address(16), Err(CacheError::BadBlock { block: 16 }));
    }

    #[test]
    fn oversized_buffers_are_refused() {
        let cache = BlockCache::new(MemDisk::format(16));
        let mut kernel = Kernel::boot(KernelConfig::default()).expect("boot");
        let id = kernel.spawn().expect("spawn");
        let mut env = Env::new(&mut kernel, id);
        let big = vec![0u8; BLOCK_SIZE + 1];
        assert_eq!(
            cache.write_block(&mut env, 5, &big),
            Err(CacheError::BufferTooLarge { len: BLOCK_SIZE + 1 })
        );
    }
}
