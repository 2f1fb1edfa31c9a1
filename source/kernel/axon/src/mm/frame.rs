// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Reference-counted physical frame pool
//! OWNERS: @kernel-mm-team
//! PUBLIC API: FrameNumber, FramePool::{alloc_zeroed, incref, decref, bytes, bytes_mut}
//! INVARIANTS: A frame with refcount 0 is either freshly allocated (not yet mapped) or free;
//!             capacity is never exceeded; freed frames are zeroed again on reuse

use super::PAGE_SIZE;
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;

/// Index of a physical frame in the pool.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameNumber(u32);

impl FrameNumber {
    #[inline]
    pub const fn as_raw(self) -> u32 {
        self.0
    }

    #[inline]
    const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for FrameNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pfn{}", self.0)
    }
}

struct Frame {
    data: Box<[u8; PAGE_SIZE]>,
    refs: u32,
}

/// Fixed-capacity pool of page frames.
pub struct FramePool {
    frames: Vec<Option<Frame>>,
    free: Vec<u32>,
    capacity: usize,
    in_use: usize,
    #[cfg(feature = "failpoints")]
    deny_next: bool,
}

impl FramePool {
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: Vec::new(),
            free: Vec::new(),
            capacity,
            in_use: 0,
            #[cfg(feature = "failpoints")]
            deny_next: false,
        }
    }

    /// Allocates a zero-filled frame with refcount 0. Returns `None` when the
    /// pool is exhausted.
    pub fn alloc_zeroed(&mut self) -> Option<FrameNumber> {
        #[cfg(feature = "failpoints")]
        if core::mem::take(&mut self.deny_next) {
            return None;
        }
        let frame = Frame { data: Box::new([0u8; PAGE_SIZE]), refs: 0 };
        let index = if let Some(index) = self.free.pop() {
            self.frames[index as usize] = Some(frame);
            index
        } else if self.frames.len() < self.capacity {
            self.frames.push(Some(frame));
            (self.frames.len() - 1) as u32
        } else {
            return None;
        };
        self.in_use += 1;
        Some(FrameNumber(index))
    }

    pub fn incref(&mut self, frame: FrameNumber) {
        if let Some(Some(slot)) = self.frames.get_mut(frame.index()) {
            slot.refs += 1;
        }
    }

    /// Drops one reference; the frame returns to the pool when none remain.
    pub fn decref(&mut self, frame: FrameNumber) {
        let Some(entry) = self.frames.get_mut(frame.index()) else {
            return;
        };
        let Some(slot) = entry.as_mut() else {
            return;
        };
        slot.refs = slot.refs.saturating_sub(1);
        if slot.refs == 0 {
            *entry = None;
            self.free.push(frame.0);
            self.in_use -= 1;
        }
    }

    /// Returns a frame that was allocated but never mapped.
    pub fn release_unused(&mut self, frame: FrameNumber) {
        if self.refs(frame) == 0 {
            if let Some(entry) = self.frames.get_mut(frame.index()) {
                if entry.take().is_some() {
                    self.free.push(frame.0);
                    self.in_use -= 1;
                }
            }
        }
    }

    /// Number of mappings referencing `frame` (0 when free).
    pub fn refs(&self, frame: FrameNumber) -> u32 {
        match self.frames.get(frame.index()) {
            Some(Some(slot)) => slot.refs,
            _ => 0,
        }
    }

    pub fn bytes(&self, frame: FrameNumber) -> Option<&[u8; PAGE_SIZE]> {
        match self.frames.get(frame.index()) {
            Some(Some(slot)) => Some(&*slot.data),
            _ => None,
        }
    }

    pub fn bytes_mut(&mut self, frame: FrameNumber) -> Option<&mut [u8; PAGE_SIZE]> {
        match self.frames.get_mut(frame.index()) {
            Some(Some(slot)) => Some(&mut *slot.data),
            _ => None,
        }
    }

    /// Frames currently allocated.
    pub fn in_use(&self) -> usize {
        self.in_use
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Forces the next allocation to fail.
    #[cfg(feature = "failpoints")]
    pub fn deny_next_alloc(&mut self) {
        self.deny_next = true;
    }
}
