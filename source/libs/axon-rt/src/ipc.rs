// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Rendezvous IPC wrappers
//! OWNERS: @runtime
//! PUBLIC API: try_send, send, recv, received, find_context
//! INVARIANTS: Only NotReceiving is retried; every other kernel error is fatal to the sender
//!
//! `send` is a poll: `Pending` means the receiver is not waiting yet and the
//! program should yield the processor and try again on its next slice.
//! `recv` posts the receive and blocks the context; the message arrives as
//! [`crate::Resumed::Message`] when the context is next dispatched.

use std::task::Poll;

use axon::{ContextId, ContextKind, PteFlags, Received, SysError, SysResult};

use crate::env::Env;
use crate::error::Result;

/// One delivery attempt. `page` is the source address and permission of a
/// page to transfer.
pub fn try_send(env: &mut Env<'_>, to: ContextId, value: u32, page: Option<(usize, PteFlags)>) -> SysResult<()> {
    let (src, perm) = match page {
        Some((va, perm)) => (Some(va), perm),
        None => (None, PteFlags::empty()),
    };
    env.ipc_try_send(to, value, src, perm)
}

/// Delivers or reports `Pending` while `to` is not receiving.
pub fn send(env: &mut Env<'_>, to: ContextId, value: u32, page: Option<(usize, PteFlags)>) -> Result<Poll<()>> {
    match try_send(env, to, value, page) {
        Ok(()) => Ok(Poll::Ready(())),
        Err(SysError::NotReceiving) => Ok(Poll::Pending),
        Err(err) => {
            log::error!(target: "ipc", "[{}] send to {to} failed: {err}", env.id());
            Err(err.into())
        }
    }
}

/// Posts a receive and blocks the calling context. A transferred page lands
/// at `dst`; `None` refuses pages.
pub fn recv(env: &mut Env<'_>, dst: Option<usize>) -> Result<()> {
    env.ipc_recv(dst)?;
    Ok(())
}

/// The last message delivered to the calling context.
pub fn received(env: &Env<'_>) -> Result<Option<Received>> {
    Ok(env.kernel().last_message(env.id())?)
}

/// First live context of `kind` in slot order, for finding a peer to talk to.
pub fn find_context(env: &Env<'_>, kind: ContextKind) -> Option<ContextId> {
    env.kernel().contexts().find(|info| info.kind == kind).map(|info| info.id)
}
