// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: User-level runtime built on the AXON kernel entry points
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests + tests/{fork,ipc,machine}.rs
//!
//! PUBLIC API:
//!   - Env: per-context syscall facade and introspection queries
//!   - install_handler / handler_fn: user page-fault handlers on the trampoline
//!   - fork / sfork / fork_with / sfork_with: copy-on-write (or shared) duplication
//!   - ipc::{send, try_send, recv, find_context}: rendezvous messaging and peer lookup
//!   - Machine / Program: dispatcher running one program per context
//!
//! DEPENDENCIES:
//!   - axon: kernel entry points
//!   - thiserror: error enums
//!   - log: diagnostics

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(missing_docs)]

pub mod env;
pub mod error;
pub mod fork;
pub mod ipc;
pub mod machine;
pub mod pgfault;
pub mod vm;

pub use env::Env;
pub use error::{FaultError, Result, RtError};
pub use fork::{cow_fault, fork, fork_with, sfork, sfork_with, ForkView};
pub use machine::{program, Machine, Panic, Program, Resumed, RunOutcome, Step};
pub use pgfault::{handler_fn, install_handler, UserFaultHandler};
