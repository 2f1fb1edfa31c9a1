// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Dispatcher running one user program per context on the simulated processors
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests + tests/machine.rs
//! PUBLIC API: Machine::{boot, spawn, run, kernel}, Program, Step, Resumed, RunOutcome, Panic
//! DEPENDS_ON: axon::Kernel::{sched_yield, take_resume, last_message}
//! INVARIANTS: One step per time slice, then a forced reschedule; idle contexts run no program;
//!             a program error halts the whole machine
//!
//! A program is an explicit continuation. Blocking operations (`recv`, a
//! pending `send`) return [`Step::Yield`] and pick up again from the
//! [`Resumed`] value on a later dispatch.

use std::collections::BTreeMap;

use axon::{ContextId, ContextKind, ContextStatus, CpuId, Dispatch, Kernel, KernelConfig, Received, ResumeReason};

use crate::env::Env;
use crate::error::{Result, RtError};
use crate::fork::ForkView;

/// Why a program is being run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resumed {
    /// First dispatch of a boot-loaded context.
    Start,
    /// First dispatch of a forked child.
    Fork(ForkView),
    /// A posted receive completed.
    Message(Received),
    /// Ordinary time slice after a yield or preemption.
    Preempted,
}

/// What a program wants after its step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Give up the processor; run again later.
    Yield,
    /// Destroy the context.
    Exit,
}

/// User code bound to one context.
pub trait Program: Send {
    /// Runs one time slice.
    fn step(&mut self, env: &mut Env<'_>, resumed: Resumed) -> Result<Step>;
}

impl<F> Program for F
where
    F: FnMut(&mut Env<'_>, Resumed) -> Result<Step> + Send,
{
    fn step(&mut self, env: &mut Env<'_>, resumed: Resumed) -> Result<Step> {
        self(env, resumed)
    }
}

/// Pins a closure to the [`Program`] signature.
pub fn program<F>(f: F) -> F
where
    F: FnMut(&mut Env<'_>, Resumed) -> Result<Step> + Send + 'static,
{
    f
}

/// Report of a fatal error that halted the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Panic {
    /// Context whose program failed; `None` for kernel-level failures.
    pub ctx: Option<ContextId>,
    /// The error.
    pub error: RtError,
}

/// Why [`Machine::run`] returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// No context left to run; the kernel fell back to its monitor.
    Monitor,
    /// A fatal error stopped the machine.
    Halted(Panic),
    /// The slice budget ran out first.
    BudgetExhausted,
}

/// A kernel plus the programs of its user contexts.
pub struct Machine {
    kernel: Kernel,
    programs: BTreeMap<ContextId, Box<dyn Program>>,
}

impl Machine {
    /// Boots a kernel sized by `config`.
    pub fn boot(config: KernelConfig) -> Result<Self> {
        Ok(Self { kernel: Kernel::boot(config)?, programs: BTreeMap::new() })
    }

    /// Read-only access to the kernel.
    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    /// Loads `program` into a new Runnable context.
    pub fn spawn(&mut self, program: impl Program + 'static) -> Result<ContextId> {
        let id = self.kernel.spawn()?;
        self.programs.insert(id, Box::new(program));
        Ok(id)
    }

    /// Runs up to `budget` rounds; each round gives every processor one slice.
    pub fn run(&mut self, budget: usize) -> RunOutcome {
        let cpus: Vec<CpuId> = self.kernel.cpus().collect();
        for _ in 0..budget {
            for &cpu in &cpus {
                if let Some(outcome) = self.slice(cpu) {
                    return outcome;
                }
            }
        }
        RunOutcome::BudgetExhausted
    }

    fn slice(&mut self, cpu: CpuId) -> Option<RunOutcome> {
        let id = match self.kernel.current(cpu) {
            Some(id) => id,
            None => match self.kernel.sched_yield(cpu) {
                Ok(Dispatch::Run(id)) => id,
                Ok(Dispatch::Monitor) => return Some(RunOutcome::Monitor),
                Err(err) => return Some(halt(None, err.into())),
            },
        };

        let runnable_user = self
            .kernel
            .info(id)
            .is_some_and(|info| info.kind == ContextKind::User && info.status == ContextStatus::Running);
        if runnable_user {
            if let Err(panic) = self.step(id) {
                return Some(RunOutcome::Halted(panic));
            }
        }

        let kernel = &self.kernel;
        self.programs.retain(|id, _| kernel.status(*id).is_some());

        match self.kernel.sched_yield(cpu) {
            Ok(Dispatch::Run(_)) => None,
            Ok(Dispatch::Monitor) => Some(RunOutcome::Monitor),
            Err(err) => Some(halt(None, err.into())),
        }
    }

    fn step(&mut self, id: ContextId) -> core::result::Result<(), Panic> {
        let Some(mut program) = self.programs.remove(&id) else {
            log::error!(target: "machine", "[{id}] dispatched without a program");
            return Err(Panic { ctx: Some(id), error: RtError::NoProgram(id) });
        };
        let resumed = self.resumption(id).map_err(|err| Panic { ctx: Some(id), error: err.into() })?;

        let mut env = Env::new(&mut self.kernel, id);
        let result = program.step(&mut env, resumed);
        let spawned = env.into_spawned();
        self.programs.extend(spawned);

        match result {
            Ok(Step::Yield) => {
                if self.kernel.status(id).is_some() {
                    self.programs.insert(id, program);
                }
                Ok(())
            }
            Ok(Step::Exit) => self.exit(id),
            Err(error) => {
                log::error!(target: "machine", "[{id}] fatal: {error}");
                Err(Panic { ctx: Some(id), error })
            }
        }
    }

    fn exit(&mut self, id: ContextId) -> core::result::Result<(), Panic> {
        if self.kernel.status(id).is_none() {
            return Ok(());
        }
        log::info!(target: "machine", "[{id}] exiting gracefully");
        self.kernel
            .destroy(id, id)
            .map_err(|err| Panic { ctx: Some(id), error: err.into() })
    }

    fn resumption(&mut self, id: ContextId) -> axon::SysResult<Resumed> {
        Ok(match self.kernel.take_resume(id)? {
            Some(ResumeReason::Start) => Resumed::Start,
            Some(ResumeReason::ExoforkChild) => Resumed::Fork(ForkView::Child),
            Some(ResumeReason::IpcDelivered) => match self.kernel.last_message(id)? {
                Some(message) => Resumed::Message(message),
                None => Resumed::Preempted,
            },
            None => Resumed::Preempted,
        })
    }
}

fn halt(ctx: Option<ContextId>, error: RtError) -> RunOutcome {
    log::error!(target: "machine", "halted: {error}");
    RunOutcome::Halted(Panic { ctx, error })
}
