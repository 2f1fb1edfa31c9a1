// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Runtime error types.

use axon::{ConfigError, ContextId, ErrorClass, SysError};

/// Result alias for runtime operations.
pub type Result<T> = core::result::Result<T, RtError>;

/// Errors surfaced to user programs and the dispatcher.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum RtError {
    /// A kernel entry point failed.
    #[error("kernel: {0}")]
    Kernel(#[from] SysError),
    /// A fault handler rejected a fault.
    #[error("fault handler: {0}")]
    Fault(#[from] FaultError),
    /// The dispatcher reached a context nobody registered a program for.
    #[error("context {0} has no program")]
    NoProgram(ContextId),
    /// The machine configuration was rejected at boot.
    #[error("boot: {0}")]
    Boot(#[from] ConfigError),
    /// A service built on the runtime failed.
    #[error("{detail}")]
    Service {
        /// Taxonomy class of the failure.
        class: ErrorClass,
        /// Human-readable description.
        detail: String,
    },
}

impl RtError {
    /// Taxonomy class of the error.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Kernel(err) => err.class(),
            Self::Fault(err) => err.class(),
            Self::NoProgram(_) | Self::Boot(_) => ErrorClass::ProtocolViolation,
            Self::Service { class, .. } => *class,
        }
    }
}

/// Reasons a user-level fault handler refuses a fault. Returning one aborts
/// the faulting context.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum FaultError {
    /// Copy-on-write only resolves write faults.
    #[error("fault at {va:#010x} (ip {pc:#x}) is not a write")]
    NotWrite {
        /// Faulting address.
        va: usize,
        /// Instruction counter at the fault.
        pc: u64,
    },
    /// The faulting page is not marked copy-on-write.
    #[error("fault at {va:#010x} (ip {pc:#x}) is not on a copy-on-write page")]
    NotCopyOnWrite {
        /// Faulting address.
        va: usize,
        /// Instruction counter at the fault.
        pc: u64,
    },
    /// A kernel entry point used by the handler failed.
    #[error(transparent)]
    Kernel(#[from] SysError),
    /// A service-specific handler failed.
    #[error("{detail}")]
    Service {
        /// Taxonomy class of the failure.
        class: ErrorClass,
        /// Human-readable description.
        detail: String,
    },
}

impl FaultError {
    /// Taxonomy class of the error.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::NotWrite { .. } | Self::NotCopyOnWrite { .. } => ErrorClass::ProtocolViolation,
            Self::Kernel(err) => err.class(),
            Self::Service { class, .. } => *class,
        }
    }
}
