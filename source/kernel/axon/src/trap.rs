// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Software MMU and the page-fault trampoline
//! OWNERS: @kernel-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests (delivery, nesting, overflow, refault guard, aborts)
//! PUBLIC API: Kernel::{load, store, raise_fault, resume, set_fault_upcall}, FaultHandler, UTrapFrame
//! DEPENDS_ON: mm::{PageTable, FramePool}, task::Context, syscall::{AbortReport, KernelPanic}
//! INVARIANTS: Faults land on the exception stack page, never the faulting stack;
//!             a nested fault pushes below the live exception-stack pointer leaving one scratch word;
//!             the saved frame is restored from the exception stack before the access is retried
//!
//! ## Delivery
//!
//! A user access that misses the mapping table (or writes a non-writable page)
//! becomes a [`FaultRecord`]. The kernel serialises a [`UTrapFrame`] onto the
//! context's exception stack, points the saved stack pointer at it and calls
//! the registered [`FaultHandler`]. When the handler returns `Ok`, [`Kernel::resume`]
//! pops the frame and the access is retried. Anything else destroys the
//! context and yields an [`AbortReport`].

use alloc::sync::Arc;

use bitflags::bitflags;

use crate::kernel::Kernel;
use crate::mm::{page_offset, FrameNumber, PteFlags, PAGE_SIZE};
use crate::syscall::{AbortCause, AbortReport, ErrorClass, KernelPanic, SysError, SysResult};
use crate::task::{ContextKind, TrapFrame};
use crate::types::{ContextId, UXSTACKTOP, UXSTACK_BASE};

/// Consecutive unresolved faults on one access before the context is aborted.
pub const MAX_REFAULTS: usize = 8;
/// Gap left above a nested frame, as a trap-time return slot.
pub const SCRATCH_WORD: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
}

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    /// Fault error code; bit values follow x86 `FEC_*`.
    pub struct FaultCode: u32 {
        /// The page was present (protection fault rather than a miss).
        const PRESENT = 0x1;
        const WRITE = 0x2;
        const USER = 0x4;
    }
}

/// A fault as captured by the MMU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultRecord {
    pub va: usize,
    pub kind: AccessKind,
    pub code: FaultCode,
    pub pc: u64,
}

/// Frame pushed onto the exception stack for the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UTrapFrame {
    pub fault_va: u64,
    pub err: FaultCode,
    /// Register state at the faulting access.
    pub saved: TrapFrame,
}

static_assertions::const_assert!(UTrapFrame::SIZE + SCRATCH_WORD < PAGE_SIZE);
static_assertions::const_assert_eq!(UTrapFrame::SIZE % 8, 0);

impl UTrapFrame {
    /// Serialised size: five little-endian 64-bit words.
    pub const SIZE: usize = 40;

    pub fn fault_va(&self) -> usize {
        self.fault_va as usize
    }

    pub fn is_write(&self) -> bool {
        self.err.contains(FaultCode::WRITE)
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let words = [
            self.fault_va,
            u64::from(self.err.bits()),
            self.saved.pc,
            self.saved.sp,
            self.saved.ret,
        ];
        let mut out = [0u8; Self::SIZE];
        for (chunk, word) in out.chunks_exact_mut(8).zip(words) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        out
    }

    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let word = |index: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[index * 8..index * 8 + 8]);
            u64::from_le_bytes(raw)
        };
        Self {
            fault_va: word(0),
            err: FaultCode::from_bits_truncate(word(1) as u32),
            saved: TrapFrame { pc: word(2), sp: word(3), ret: word(4) },
        }
    }
}

/// User-level fault upcall. Runs on the faulting context's behalf with the
/// kernel entry points available; returning an error is fatal to the context.
pub trait FaultHandler: Send + Sync {
    fn handle(&self, kernel: &mut Kernel, ctx: ContextId, frame: &UTrapFrame) -> Result<(), ErrorClass>;
}

impl<F> FaultHandler for F
where
    F: Fn(&mut Kernel, ContextId, &UTrapFrame) -> Result<(), ErrorClass> + Send + Sync,
{
    fn handle(&self, kernel: &mut Kernel, ctx: ContextId, frame: &UTrapFrame) -> Result<(), ErrorClass> {
        self(kernel, ctx, frame)
    }
}

fn permits(flags: PteFlags, kind: AccessKind) -> bool {
    flags.contains(PteFlags::USER_RO) && (kind == AccessKind::Read || flags.contains(PteFlags::WRITABLE))
}

impl Kernel {
    /// Reads `buf.len()` bytes of `ctx`'s memory at `va`, faulting as needed.
    pub fn load(&mut self, ctx: ContextId, va: usize, buf: &mut [u8]) -> SysResult<()> {
        self.begin_access(ctx)?;
        let mut done = 0;
        while done < buf.len() {
            let addr = va.checked_add(done).ok_or(SysError::InvalidAddress)?;
            let frame = self.translate(ctx, addr, AccessKind::Read)?;
            let offset = page_offset(addr);
            let len = (PAGE_SIZE - offset).min(buf.len() - done);
            let bytes = self.frames.bytes(frame).ok_or(SysError::NotMapped)?;
            buf[done..done + len].copy_from_slice(&bytes[offset..offset + len]);
            done += len;
        }
        Ok(())
    }

    /// Writes `data` into `ctx`'s memory at `va`, faulting as needed.
    pub fn store(&mut self, ctx: ContextId, va: usize, data: &[u8]) -> SysResult<()> {
        self.begin_access(ctx)?;
        let mut done = 0;
        while done < data.len() {
            let addr = va.checked_add(done).ok_or(SysError::InvalidAddress)?;
            let frame = self.translate(ctx, addr, AccessKind::Write)?;
            let offset = page_offset(addr);
            let len = (PAGE_SIZE - offset).min(data.len() - done);
            let bytes = self.frames.bytes_mut(frame).ok_or(SysError::NotMapped)?;
            bytes[offset..offset + len].copy_from_slice(&data[done..done + len]);
            done += len;
        }
        Ok(())
    }

    /// Registers (or clears) the fault upcall of `target`.
    pub fn set_fault_upcall(
        &mut self,
        caller: ContextId,
        target: ContextId,
        upcall: Option<Arc<dyn FaultHandler>>,
    ) -> SysResult<()> {
        self.ensure_live()?;
        self.resolve(caller, target, true)?;
        self.context_mut(target)?.upcall = upcall;
        Ok(())
    }

    /// Raises a fault for an access of `kind` at `va` in `ctx`, exactly as the
    /// MMU would, and returns once the handler has resolved it.
    pub fn raise_fault(&mut self, ctx: ContextId, va: usize, kind: AccessKind) -> SysResult<()> {
        self.ensure_live()?;
        let context = self.context(ctx)?;
        let record = FaultRecord {
            va,
            kind,
            code: fault_code(context.page_table.lookup(va).is_some(), kind),
            pc: context.frame.pc,
        };
        self.deliver(ctx, record)
    }

    /// Pops the topmost [`UTrapFrame`] off `ctx`'s exception stack and restores
    /// the register state it saved.
    pub fn resume(&mut self, ctx: ContextId) -> SysResult<()> {
        self.ensure_live()?;
        let context = self.context(ctx)?;
        let sp = context.frame.sp as usize;
        if !(UXSTACK_BASE..UXSTACKTOP).contains(&sp) || sp + UTrapFrame::SIZE > UXSTACKTOP {
            return Err(SysError::InvalidAddress);
        }
        let stack = context
            .page_table
            .lookup(UXSTACK_BASE)
            .filter(|pte| pte.flags.contains(PteFlags::USER_RW))
            .map(|pte| pte.frame);
        let Some(utf) = stack.and_then(|frame| self.read_frame(frame, sp - UXSTACK_BASE)) else {
            let record = FaultRecord {
                va: sp,
                kind: AccessKind::Read,
                code: fault_code(false, AccessKind::Read),
                pc: context.frame.pc,
            };
            return Err(self.abort(ctx, record, AbortCause::BadExceptionStack).into());
        };
        self.context_mut(ctx)?.frame = utf.saved;
        Ok(())
    }

    fn begin_access(&mut self, ctx: ContextId) -> SysResult<()> {
        self.ensure_live()?;
        let context = self.context_mut(ctx)?;
        context.frame.pc = context.frame.pc.wrapping_add(1);
        Ok(())
    }

    /// Resolves `va` to a frame, delivering faults until the mapping permits
    /// the access. Sets ACCESSED (and DIRTY for writes) like hardware.
    fn translate(&mut self, ctx: ContextId, va: usize, kind: AccessKind) -> SysResult<FrameNumber> {
        let mut faults = 0;
        loop {
            let context = self.context_mut(ctx)?;
            let pte = context.page_table.lookup(va);
            if let Some(pte) = pte.filter(|pte| permits(pte.flags, kind)) {
                let bits = match kind {
                    AccessKind::Read => PteFlags::ACCESSED,
                    AccessKind::Write => PteFlags::ACCESSED | PteFlags::DIRTY,
                };
                context.page_table.mark(va, bits);
                return Ok(pte.frame);
            }
            let record = FaultRecord { va, kind, code: fault_code(pte.is_some(), kind), pc: context.frame.pc };
            if faults == MAX_REFAULTS {
                return Err(self.abort(ctx, record, AbortCause::Refault).into());
            }
            faults += 1;
            self.deliver(ctx, record)?;
        }
    }

    fn deliver(&mut self, ctx: ContextId, record: FaultRecord) -> SysResult<()> {
        self.ensure_live()?;
        let context = self.context_mut(ctx)?;
        if context.kind == ContextKind::Idle {
            return Err(self.panic(KernelPanic::PrivilegedFault { ctx, va: record.va }));
        }
        context.stats.faults += 1;
        let Some(handler) = context.upcall.clone() else {
            return Err(self.abort(ctx, record, AbortCause::NoHandler).into());
        };
        let stack = context
            .page_table
            .lookup(UXSTACK_BASE)
            .filter(|pte| pte.flags.contains(PteFlags::USER_RW));
        let Some(stack) = stack else {
            return Err(self.abort(ctx, record, AbortCause::BadExceptionStack).into());
        };
        let sp = context.frame.sp as usize;
        let top = if (UXSTACK_BASE..UXSTACKTOP).contains(&sp) {
            sp.saturating_sub(SCRATCH_WORD)
        } else {
            UXSTACKTOP
        };
        let Some(base) = top.checked_sub(UTrapFrame::SIZE).filter(|base| *base >= UXSTACK_BASE) else {
            return Err(self.abort(ctx, record, AbortCause::ExceptionStackOverflow).into());
        };

        let utf = UTrapFrame { fault_va: record.va as u64, err: record.code, saved: context.frame };
        context.page_table.mark(UXSTACK_BASE, PteFlags::ACCESSED | PteFlags::DIRTY);
        context.frame.sp = base as u64;
        let offset = base - UXSTACK_BASE;
        let bytes = self.frames.bytes_mut(stack.frame).ok_or(SysError::NotMapped)?;
        bytes[offset..offset + UTrapFrame::SIZE].copy_from_slice(&utf.to_bytes());

        crate::log_trace!(
            target: "trap",
            "[{ctx}] fault va={:#010x} err={:?} ip={:#x} -> upcall sp={base:#x}",
            record.va,
            record.code,
            record.pc
        );
        match handler.handle(self, ctx, &utf) {
            Ok(()) => self.resume(ctx),
            Err(class) => Err(self.abort(ctx, record, AbortCause::Handler(class)).into()),
        }
    }

    fn read_frame(&self, frame: FrameNumber, offset: usize) -> Option<UTrapFrame> {
        let bytes = self.frames.bytes(frame)?;
        let mut raw = [0u8; UTrapFrame::SIZE];
        raw.copy_from_slice(bytes.get(offset..offset + UTrapFrame::SIZE)?);
        Some(UTrapFrame::from_bytes(&raw))
    }

    /// Destroys `ctx` (if still alive) after an unrecoverable user fault.
    fn abort(&mut self, ctx: ContextId, record: FaultRecord, cause: AbortCause) -> AbortReport {
        let report = AbortReport { ctx, va: record.va, pc: record.pc, kind: record.kind, cause };
        crate::log_error!(target: "trap", "{report}");
        self.free_context(ctx);
        report
    }
}

fn fault_code(present: bool, kind: AccessKind) -> FaultCode {
    let mut code = FaultCode::USER;
    if present {
        code |= FaultCode::PRESENT;
    }
    if kind == AccessKind::Write {
        code |= FaultCode::WRITE;
    }
    code
}
