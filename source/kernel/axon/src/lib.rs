// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: AXON exokernel core library (host-simulated machine)
//! OWNERS: @kernel-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests per module + integration tests under tests/
//! PUBLIC API: Kernel, KernelConfig, ContextId, CpuId, PteFlags, UTrapFrame, FaultHandler, SysError
//! DEPENDS_ON: bitflags, log, static_assertions
//! INVARIANTS: Kernel state mutates only through `Kernel` entry points; COW never combined with WRITABLE
//!
//! The kernel exports mechanism only: frame allocation, per-context mapping
//! tables, page-fault delivery to a registered user upcall, a round-robin
//! scheduler and a synchronous rendezvous IPC primitive. Policy (copy-on-write
//! fork, demand paging, blocking send) lives in user-level libraries built on
//! these entry points.

#![cfg_attr(not(test), no_std)]
#![forbid(clippy::unwrap_used)]

extern crate alloc;

pub mod config;
pub mod diag;
pub mod ipc;
pub mod kernel;
pub mod mm;
pub mod sched;
pub mod syscall;
pub mod task;
pub mod trap;
pub mod types;

pub use config::{ConfigError, KernelConfig};
pub use ipc::Received;
pub use kernel::{ContextInfo, Kernel, PageAttrs};
pub use mm::{page_round_down, FrameNumber, PteFlags, PAGE_SIZE};
pub use sched::Dispatch;
pub use syscall::{AbortCause, AbortReport, ErrorClass, KernelPanic, SysError, SysResult};
pub use task::{ContextKind, ContextStats, ContextStatus, ResumeReason, TrapFrame};
pub use trap::{AccessKind, FaultCode, FaultHandler, UTrapFrame};
pub use types::{ContextId, CpuId, PFTEMP, USTACKTOP, UTEXT, UTOP, UXSTACK_BASE, UXSTACKTOP};
