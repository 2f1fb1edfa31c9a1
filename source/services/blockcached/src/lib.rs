// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(missing_docs)]

//! CONTEXT: Demand-paged block cache service
//! OWNERS: @storage
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests + tests/cache.rs
//! PUBLIC API: BlockCache, BlockDevice, MemDisk, IoCounters, CacheError, DiskError
//! DEPENDS_ON: axon-rt::{Env, install_handler}, axon::UTrapFrame
//! INVARIANTS: A block is filled from the device before it is validated against the bitmap;
//!             flush writes back only mapped dirty pages
//!
//! The whole disk appears at [`DISKMAP`]; touching a block that is not yet
//! cached faults into the cache's handler, which reads it in.

mod cache;
mod disk;
mod error;
mod layout;

pub use cache::BlockCache;
pub use disk::{BlockDevice, IoCounters, MemDisk};
pub use error::{CacheError, DiskError, Result};
pub use layout::{
    bitmap_blocks, BITMAP_START, BITS_PER_BLOCK, BLOCK_SECTORS, BLOCK_SIZE, DISKMAP, DISKSIZE, FS_MAGIC,
    SECTOR_SIZE, SUPER_BLOCK,
};

use axon_rt::{program, Program, Step};

/// The service body: attach the cache, mount the volume and run the
/// self-check, then exit.
pub fn service(cache: BlockCache) -> impl Program {
    program(move |env, _| {
        cache.attach(env)?;
        cache.mount(env)?;
        cache.check(env)?;
        Ok(Step::Exit)
    })
}
