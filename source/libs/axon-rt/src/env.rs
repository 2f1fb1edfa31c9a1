// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-context view of the kernel used by user programs and handlers
//! OWNERS: @runtime
//! PUBLIC API: Env::{id, read, write, page_alloc, page_map, page_unmap, exofork, set_status, destroy}
//! INVARIANTS: Every call is made on behalf of `id`; kernel permission checks apply unchanged

use std::sync::Arc;

use axon::{ContextId, ContextStatus, FaultHandler, Kernel, PteFlags, SysResult};

use crate::machine::Program;

/// What a running context can reach: its own identity and the kernel entry points.
pub struct Env<'k> {
    kernel: &'k mut Kernel,
    id: ContextId,
    spawned: Vec<(ContextId, Box<dyn Program>)>,
}

impl<'k> Env<'k> {
    /// Acts as `id` against `kernel`.
    pub fn new(kernel: &'k mut Kernel, id: ContextId) -> Self {
        Self { kernel, id, spawned: Vec::new() }
    }

    /// The calling context.
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Read-only kernel queries.
    pub fn kernel(&self) -> &Kernel {
        &*self.kernel
    }

    /// Reads user memory, faulting as the MMU would.
    pub fn read(&mut self, va: usize, buf: &mut [u8]) -> SysResult<()> {
        self.kernel.load(self.id, va, buf)
    }

    /// Writes user memory, faulting as the MMU would.
    pub fn write(&mut self, va: usize, data: &[u8]) -> SysResult<()> {
        self.kernel.store(self.id, va, data)
    }

    /// Reads a little-endian `u32`.
    pub fn read_u32(&mut self, va: usize) -> SysResult<u32> {
        let mut raw = [0u8; 4];
        self.read(va, &mut raw)?;
        Ok(u32::from_le_bytes(raw))
    }

    /// Writes a little-endian `u32`.
    pub fn write_u32(&mut self, va: usize, value: u32) -> SysResult<()> {
        self.write(va, &value.to_le_bytes())
    }

    /// Maps a fresh zeroed page at `va` in `target`.
    pub fn page_alloc(&mut self, target: ContextId, va: usize, perm: PteFlags) -> SysResult<()> {
        self.kernel.page_alloc(self.id, target, va, perm)
    }

    /// Maps `src`'s page at `src_va` into `dst` at `dst_va`.
    pub fn page_map(
        &mut self,
        src: ContextId,
        src_va: usize,
        dst: ContextId,
        dst_va: usize,
        perm: PteFlags,
    ) -> SysResult<()> {
        self.kernel.page_map(self.id, src, src_va, dst, dst_va, perm)
    }

    /// Unmaps `va` in `target`.
    pub fn page_unmap(&mut self, target: ContextId, va: usize) -> SysResult<()> {
        self.kernel.page_unmap(self.id, target, va)
    }

    /// Creates a blank, NotRunnable child.
    pub fn exofork(&mut self) -> SysResult<ContextId> {
        self.kernel.exofork(self.id)
    }

    /// Sets `target` Runnable or NotRunnable.
    pub fn set_status(&mut self, target: ContextId, status: ContextStatus) -> SysResult<()> {
        self.kernel.set_status(self.id, target, status)
    }

    /// Destroys `target` (possibly the caller itself).
    pub fn destroy(&mut self, target: ContextId) -> SysResult<()> {
        self.kernel.destroy(self.id, target)
    }

    /// Registers the raw kernel upcall of `target`.
    pub fn set_fault_upcall(&mut self, target: ContextId, upcall: Option<Arc<dyn FaultHandler>>) -> SysResult<()> {
        self.kernel.set_fault_upcall(self.id, target, upcall)
    }

    /// Raw non-blocking send; see [`crate::ipc::send`] for the retrying form.
    pub fn ipc_try_send(&mut self, to: ContextId, value: u32, src: Option<usize>, perm: PteFlags) -> SysResult<()> {
        self.kernel.ipc_try_send(self.id, to, value, src, perm)
    }

    /// Posts a receive and blocks the caller.
    pub fn ipc_recv(&mut self, dst: Option<usize>) -> SysResult<()> {
        self.kernel.ipc_recv(self.id, dst)
    }

    /// Registers the program a freshly forked child runs once dispatched.
    pub fn adopt(&mut self, child: ContextId, program: Box<dyn Program>) {
        self.spawned.push((child, program));
    }

    pub(crate) fn into_spawned(self) -> Vec<(ContextId, Box<dyn Program>)> {
        self.spawned
    }
}
