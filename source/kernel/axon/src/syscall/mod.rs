// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel entry-point errors and the shared error taxonomy
//! OWNERS: @kernel-team
//! PUBLIC API: SysError, SysResult, ErrorClass, AbortReport, AbortCause, KernelPanic
//! DEPENDS_ON: mm::MapError, trap::AccessKind, syscall::api
//! INVARIANTS: Every error reports exactly one ErrorClass; errors are Copy and carry no heap data

pub mod api;

use core::fmt;

use crate::mm::MapError;
use crate::trap::AccessKind;
use crate::types::{ContextId, CpuId};

/// Result type used by kernel entry points.
pub type SysResult<T> = Result<T, SysError>;

/// Coarse classification shared by kernel and user-level error types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// No frame, no context slot.
    ResourceExhaustion,
    /// Misaligned, out of range or unmapped address.
    InvalidAddress,
    /// Caller broke an interface contract.
    ProtocolViolation,
    /// Retry later (receiver not yet waiting).
    TransientContention,
    /// Backing store failure.
    FatalIo,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ResourceExhaustion => "resource exhaustion",
            Self::InvalidAddress => "invalid address",
            Self::ProtocolViolation => "protocol violation",
            Self::TransientContention => "transient contention",
            Self::FatalIo => "fatal i/o",
        };
        f.write_str(name)
    }
}

/// Why a faulting context was destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortCause {
    /// No fault upcall registered.
    NoHandler,
    /// Exception stack page missing or not user-writable.
    BadExceptionStack,
    /// Nested faults exhausted the exception stack.
    ExceptionStackOverflow,
    /// The upcall reported an error of the given class.
    Handler(ErrorClass),
    /// The upcall kept returning without fixing the faulting access.
    Refault,
}

impl AbortCause {
    pub const fn class(self) -> ErrorClass {
        match self {
            Self::NoHandler | Self::Refault => ErrorClass::ProtocolViolation,
            Self::BadExceptionStack | Self::ExceptionStackOverflow => ErrorClass::InvalidAddress,
            Self::Handler(class) => class,
        }
    }
}

impl fmt::Display for AbortCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoHandler => write!(f, "no fault handler registered"),
            Self::BadExceptionStack => write!(f, "exception stack not mapped writable"),
            Self::ExceptionStackOverflow => write!(f, "exception stack overflow"),
            Self::Handler(class) => write!(f, "fault handler failed ({class})"),
            Self::Refault => write!(f, "fault handler did not resolve the fault"),
        }
    }
}

/// Report produced when a user fault is fatal to its context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbortReport {
    pub ctx: ContextId,
    pub va: usize,
    pub pc: u64,
    pub kind: AccessKind,
    pub cause: AbortCause,
}

impl fmt::Display for AbortReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {:?} fault va {:#010x} ip {:#x}: {}",
            self.ctx, self.kind, self.va, self.pc, self.cause
        )
    }
}

/// Latched when the kernel cannot continue. Every later entry point returns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelPanic {
    /// A fault was raised against a kernel-owned context.
    PrivilegedFault { ctx: ContextId, va: usize },
    /// A processor has no idle context to fall back on.
    NoIdle(CpuId),
}

impl fmt::Display for KernelPanic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PrivilegedFault { ctx, va } => {
                write!(f, "page fault in kernel context {ctx} at va {va:#010x}")
            }
            Self::NoIdle(cpu) => write!(f, "{cpu}: no idle context"),
        }
    }
}

/// Error returned by kernel entry points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SysError {
    /// Id does not name a live context (never allocated, destroyed, or stale generation).
    BadContext,
    /// Caller is neither the target nor its parent.
    PermissionDenied,
    /// Context table is full.
    NoFreeContext,
    /// Frame pool is exhausted.
    NoMemory,
    /// Address misaligned or at/above UTOP.
    InvalidAddress,
    /// Permission set invalid for the operation.
    InvalidPermission,
    /// Source page not mapped.
    NotMapped,
    /// Requested status is not Runnable or NotRunnable.
    InvalidStatus,
    /// Processor index out of range.
    BadCpu,
    /// Target is not blocked in `recv`.
    NotReceiving,
    /// Mapping table rejected the entry.
    Map(MapError),
    /// The context was destroyed by a fatal fault.
    Aborted(AbortReport),
    /// The kernel has halted.
    Halted(KernelPanic),
}

impl SysError {
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::NoFreeContext | Self::NoMemory => ErrorClass::ResourceExhaustion,
            Self::InvalidAddress | Self::NotMapped | Self::Map(_) => ErrorClass::InvalidAddress,
            Self::NotReceiving => ErrorClass::TransientContention,
            Self::Aborted(report) => report.cause.class(),
            Self::BadContext
            | Self::PermissionDenied
            | Self::InvalidPermission
            | Self::InvalidStatus
            | Self::BadCpu
            | Self::Halted(_) => ErrorClass::ProtocolViolation,
        }
    }
}

impl From<MapError> for SysError {
    fn from(value: MapError) -> Self {
        Self::Map(value)
    }
}

impl From<AbortReport> for SysError {
    fn from(value: AbortReport) -> Self {
        Self::Aborted(value)
    }
}

impl From<KernelPanic> for SysError {
    fn from(value: KernelPanic) -> Self {
        Self::Halted(value)
    }
}

impl fmt::Display for SysError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Map(err) => write!(f, "map: {err}"),
            Self::Aborted(report) => write!(f, "aborted: {report}"),
            Self::Halted(panic) => write!(f, "kernel halted: {panic}"),
            other => write!(f, "{other:?}"),
        }
    }
}

impl core::error::Error for SysError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_classes() {
        assert_eq!(SysError::NoMemory.class(), ErrorClass::ResourceExhaustion);
        assert_eq!(SysError::NotReceiving.class(), ErrorClass::TransientContention);
        assert_eq!(SysError::Map(MapError::Unaligned).class(), ErrorClass::InvalidAddress);
        let report = AbortReport {
            ctx: ContextId::from_raw(0x401),
            va: 0,
            pc: 0,
            kind: AccessKind::Write,
            cause: AbortCause::Handler(ErrorClass::FatalIo),
        };
        assert_eq!(SysError::Aborted(report).class(), ErrorClass::FatalIo);
    }
}
