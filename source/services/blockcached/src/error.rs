// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Block cache and device errors.

use axon::{ErrorClass, SysError};
use axon_rt::{FaultError, RtError};
use thiserror::Error;

/// Result alias for cache operations.
pub type Result<T, E = CacheError> = core::result::Result<T, E>;

/// Backing-store failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DiskError {
    /// The transfer runs past the end of the device.
    #[error("sectors {start}..{end} out of range")]
    OutOfRange {
        /// First sector of the transfer.
        start: u64,
        /// One past the last sector.
        end: u64,
    },
    /// The buffer is not a whole number of sectors.
    #[error("buffer of {len} bytes is not sector aligned")]
    Unaligned {
        /// Buffer length.
        len: usize,
    },
    /// The device reported an I/O error.
    #[error("i/o error at sector {sector}")]
    Io {
        /// First sector of the failed transfer.
        sector: u32,
    },
}

/// Block cache failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// The address is not inside the block window.
    #[error("address {va:#010x} outside the block window")]
    OutsideWindow {
        /// Offending address.
        va: usize,
    },
    /// Block 0, or a block past the end of the volume.
    #[error("block {block} out of range")]
    BadBlock {
        /// Offending block.
        block: u32,
    },
    /// A block marked free in the bitmap was read in.
    #[error("reading free block {block}")]
    FreeBlock {
        /// Offending block.
        block: u32,
    },
    /// The super block does not carry the volume magic.
    #[error("bad super block magic {found:#010x}")]
    BadMagic {
        /// Magic found on disk.
        found: u32,
    },
    /// The volume size recorded in the super block is unusable.
    #[error("volume of {nblocks} blocks does not fit the block window")]
    BadVolume {
        /// Size recorded on disk.
        nblocks: u32,
    },
    /// A reserved block is marked free.
    #[error("bitmap marks reserved block {block} free")]
    BitmapCorrupt {
        /// Offending block.
        block: u32,
    },
    /// The cache self-check observed the wrong thing.
    #[error("self-check failed: {0}")]
    SelfCheck(&'static str),
    /// The buffer exceeds one block.
    #[error("buffer of {len} bytes exceeds a block")]
    BufferTooLarge {
        /// Buffer length.
        len: usize,
    },
    /// Backing-store failure.
    #[error("disk: {0}")]
    Disk(#[from] DiskError),
    /// Kernel entry point failure.
    #[error("kernel: {0}")]
    Kernel(#[from] SysError),
}

impl CacheError {
    /// Taxonomy class of the error.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::OutsideWindow { .. } | Self::BadBlock { .. } | Self::BufferTooLarge { .. } => {
                ErrorClass::InvalidAddress
            }
            Self::FreeBlock { .. }
            | Self::BadMagic { .. }
            | Self::BadVolume { .. }
            | Self::BitmapCorrupt { .. }
            | Self::SelfCheck(_) => ErrorClass::ProtocolViolation,
            Self::Disk(_) => ErrorClass::FatalIo,
            Self::Kernel(err) => err.class(),
        }
    }
}

impl From<CacheError> for FaultError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::Kernel(err) => FaultError::Kernel(err),
            other => FaultError::Service { class: other.class(), detail: other.to_string() },
        }
    }
}

impl From<CacheError> for RtError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::Kernel(err) => RtError::Kernel(err),
            other => RtError::Service { class: other.class(), detail: other.to_string() },
        }
    }
}
