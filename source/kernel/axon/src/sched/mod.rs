// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Round-robin scheduler over the shared context table
//! OWNERS: @kernel-sched-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests + proptest (circular order, fallbacks, Dying reaping)
//! PUBLIC API: Kernel::sched_yield(cpu) -> Dispatch
//! DEPENDS_ON: kernel::Cpu, task::{ContextTable, StatusCell}
//! INVARIANTS: Scan starts one past the slot last run on this cpu; idle contexts never picked by
//!             the scan; Runnable -> Running only through StatusCell::claim; Dying current context
//!             is reaped before the scan
//!
//! ## Choice order
//!
//! 1. First Runnable non-idle context in circular slot order.
//! 2. The context this processor was running, if it is still Running.
//! 3. [`Dispatch::Monitor`] when no non-idle context anywhere is Runnable or Running.
//! 4. The processor's idle context; missing it is a kernel panic.

use crate::kernel::Kernel;
use crate::syscall::{KernelPanic, SysError, SysResult};
use crate::task::{ContextKind, ContextStatus};
use crate::types::{ContextId, CpuId};

/// Outcome of a scheduling decision.
#[must_use = "dispatch outcomes must be handled"]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// The processor now runs this context.
    Run(ContextId),
    /// Nothing left to run; drop to the diagnostic monitor.
    Monitor,
}

impl Kernel {
    /// Picks the next context for `cpu` and switches to it.
    pub fn sched_yield(&mut self, cpu: CpuId) -> SysResult<Dispatch> {
        self.ensure_live()?;
        let state = self.cpus.get(cpu.as_index()).ok_or(SysError::BadCpu)?;
        let mut current = state.current;
        let last_slot = state.last_slot;

        if let Some(id) = current {
            if self.status(id) == Some(ContextStatus::Dying) {
                crate::log_info!(target: "sched", "{cpu}: reaping dying {id}");
                self.free_context(id);
                current = None;
            }
        }

        let slots = self.contexts.capacity();
        let start = last_slot.map_or(0, |slot| (slot + 1) % slots);
        for offset in 0..slots {
            let slot = (start + offset) % slots;
            let Some(context) = self.contexts.slot(slot) else {
                continue;
            };
            if context.kind == ContextKind::Idle || Some(context.id) == current {
                continue;
            }
            if context.status.claim() {
                let next = context.id;
                return Ok(self.switch_to(cpu, next));
            }
        }

        if let Some(id) = current {
            if self.status(id) == Some(ContextStatus::Running) {
                return Ok(self.switch_to(cpu, id));
            }
        }

        let any_live = self.contexts.iter().any(|context| {
            context.kind != ContextKind::Idle
                && matches!(context.status(), ContextStatus::Runnable | ContextStatus::Running)
        });
        if !any_live {
            crate::log_info!(target: "sched", "{cpu}: no runnable contexts, entering monitor");
            if let Some(state) = self.cpus.get_mut(cpu.as_index()) {
                state.current = None;
            }
            return Ok(Dispatch::Monitor);
        }

        let idle = self.idle_context(cpu).and_then(|idle| self.contexts.get(idle));
        match idle {
            Some(context) if context.status() == ContextStatus::Running || context.status.claim() => {
                let id = context.id;
                Ok(self.switch_to(cpu, id))
            }
            _ => Err(self.panic(KernelPanic::NoIdle(cpu))),
        }
    }

    /// Makes `next` (already Running) current on `cpu`; the outgoing context
    /// goes back to Runnable if it was still Running.
    fn switch_to(&mut self, cpu: CpuId, next: ContextId) -> Dispatch {
        let Some(state) = self.cpus.get_mut(cpu.as_index()) else {
            return Dispatch::Monitor;
        };
        let previous = state.current.replace(next);
        state.last_slot = Some(next.slot());
        if let Some(prev) = previous.filter(|prev| *prev != next) {
            if let Some(context) = self.contexts.get(prev) {
                if context.status() == ContextStatus::Running {
                    context.status.store(ContextStatus::Runnable);
                }
            }
        }
        if let Some(context) = self.contexts.get_mut(next) {
            context.last_cpu = Some(cpu);
            context.stats.dispatches += 1;
        }
        crate::log_trace!(target: "sched", "{cpu}: run {next}");
        Dispatch::Run(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;
    use proptest::prelude::*;

    fn boot(cpus: usize) -> Kernel {
        Kernel::boot(KernelConfig { cpus, ..KernelConfig::default() }).expect("boot")
    }

    fn cpu(index: u16) -> CpuId {
        CpuId::from_raw(index)
    }

    fn block(kernel: &mut Kernel, id: ContextId) {
        kernel.set_status(id, id, ContextStatus::NotRunnable).expect("block");
    }

    #[test]
    fn single_runnable_context_is_always_chosen() {
        let mut kernel = boot(1);
        let a = kernel.spawn().expect("spawn");
        let b = kernel.spawn().expect("spawn");
        let c = kernel.spawn().expect("spawn");
        block(&mut kernel, a);
        block(&mut kernel, c);
        for _ in 0..4 {
            assert_eq!(kernel.sched_yield(cpu(0)), Ok(Dispatch::Run(b)));
        }
    }

    #[test]
    fn round_robin_visits_in_slot_order() {
        let mut kernel = boot(1);
        let ids: Vec<_> = (0..3).map(|_| kernel.spawn().expect("spawn")).collect();
        let order: Vec<_> = (0..6)
            .map(|_| match kernel.sched_yield(cpu(0)).expect("dispatch") {
                Dispatch::Run(id) => id,
                Dispatch::Monitor => panic!("unexpected monitor"),
            })
            .collect();
        assert_eq!(order, vec![ids[0], ids[1], ids[2], ids[0], ids[1], ids[2]]);
        assert_eq!(kernel.stats(ids[0]).expect("stats").dispatches, 2);
    }

    #[test]
    fn running_context_resumes_when_nothing_else_runnable() {
        let mut kernel = boot(1);
        let a = kernel.spawn().expect("spawn");
        assert_eq!(kernel.sched_yield(cpu(0)), Ok(Dispatch::Run(a)));
        assert_eq!(kernel.sched_yield(cpu(0)), Ok(Dispatch::Run(a)));
        assert_eq!(kernel.status(a), Some(ContextStatus::Running));
    }

    #[test]
    fn switching_returns_previous_to_runnable() {
        let mut kernel = boot(1);
        let a = kernel.spawn().expect("spawn");
        let b = kernel.spawn().expect("spawn");
        assert_eq!(kernel.sched_yield(cpu(0)), Ok(Dispatch::Run(a)));
        assert_eq!(kernel.sched_yield(cpu(0)), Ok(Dispatch::Run(b)));
        assert_eq!(kernel.status(a), Some(ContextStatus::Runnable));
        assert_eq!(kernel.status(b), Some(ContextStatus::Running));
    }

    #[test]
    fn idle_runs_while_another_cpu_holds_the_only_context() {
        let mut kernel = boot(2);
        let a = kernel.spawn().expect("spawn");
        assert_eq!(kernel.sched_yield(cpu(1)), Ok(Dispatch::Run(a)));
        let idle = kernel.idle_context(cpu(0)).expect("idle");
        assert_eq!(kernel.sched_yield(cpu(0)), Ok(Dispatch::Run(idle)));
        assert_eq!(kernel.current(cpu(1)), Some(a));
    }

    #[test]
    fn two_cpus_never_pick_the_same_context() {
        let mut kernel = boot(2);
        let a = kernel.spawn().expect("spawn");
        let b = kernel.spawn().expect("spawn");
        let first = kernel.sched_yield(cpu(0)).expect("dispatch");
        let second = kernel.sched_yield(cpu(1)).expect("dispatch");
        assert_eq!(first, Dispatch::Run(a));
        assert_eq!(second, Dispatch::Run(b));
    }

    #[test]
    fn monitor_when_everything_blocked() {
        let mut kernel = boot(1);
        let a = kernel.spawn().expect("spawn");
        assert_eq!(kernel.sched_yield(cpu(0)), Ok(Dispatch::Run(a)));
        block(&mut kernel, a);
        assert_eq!(kernel.sched_yield(cpu(0)), Ok(Dispatch::Monitor));
        assert_eq!(kernel.current(cpu(0)), None);
    }

    #[test]
    fn monitor_with_no_user_contexts() {
        let mut kernel = boot(1);
        assert_eq!(kernel.sched_yield(cpu(0)), Ok(Dispatch::Monitor));
    }

    #[test]
    fn dying_context_is_reaped_on_next_schedule() {
        let mut kernel = boot(2);
        let parent = kernel.spawn().expect("spawn");
        let child = kernel.exofork(parent).expect("exofork");
        kernel.set_status(parent, child, ContextStatus::Runnable).expect("release");
        assert_eq!(kernel.sched_yield(cpu(0)), Ok(Dispatch::Run(parent)));
        assert_eq!(kernel.sched_yield(cpu(1)), Ok(Dispatch::Run(child)));
        kernel.destroy(parent, child).expect("destroy");
        assert_eq!(kernel.status(child), Some(ContextStatus::Dying));
        let _ = kernel.sched_yield(cpu(1)).expect("dispatch");
        assert!(kernel.status(child).is_none());
        assert_ne!(kernel.current(cpu(1)), Some(child));
    }

    #[test]
    fn bad_cpu_is_rejected() {
        let mut kernel = boot(1);
        assert_eq!(kernel.sched_yield(cpu(3)), Err(SysError::BadCpu));
    }

    proptest! {
        #[test]
        fn scan_picks_first_runnable_after_last_slot(
            runnable in proptest::collection::vec(any::<bool>(), 2..12),
            rounds in 1usize..20,
        ) {
            let mut kernel = boot(1);
            let ids: Vec<_> = runnable.iter().map(|_| kernel.spawn().expect("spawn")).collect();
            for (id, keep) in ids.iter().zip(&runnable) {
                if !keep {
                    block(&mut kernel, *id);
                }
            }
            let live: Vec<_> = ids.iter().zip(&runnable).filter(|(_, keep)| **keep).map(|(id, _)| *id).collect();
            for round in 0..rounds {
                let dispatch = kernel.sched_yield(cpu(0)).expect("dispatch");
                if live.is_empty() {
                    prop_assert_eq!(dispatch, Dispatch::Monitor);
                } else {
                    prop_assert_eq!(dispatch, Dispatch::Run(live[round % live.len()]));
                }
            }
        }
    }
}
