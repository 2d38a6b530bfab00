//! Processor lifecycle: stop points, reset draining and wait states.

use std::sync::Arc;

use log::{debug, info, warn};

use crate::execute::Boundary;
use crate::{
    ExecMode, InterceptReason, IntClass, IntLockGuard, LifecycleEvent, Processor, ResetKind,
    RunState, StepOutcome, TraceEvent,
};

/// What a stop point decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StopPoint {
    /// The processor was started again; re-check interruptions.
    Resume,
    /// Still not started and the caller asked not to block.
    Parked(RunState),
    /// Configured offline; leave the dispatch loop.
    Offline,
}

impl Processor {
    /// Applies `event` to this processor's lifecycle state under `guard`.
    pub(crate) fn transition(
        &mut self,
        guard: &mut IntLockGuard<'_>,
        event: LifecycleEvent,
    ) -> Option<RunState> {
        let cpu = self.cpu();
        let Some((from, to)) = guard.apply(cpu, event) else {
            debug!("cpu {cpu}: {event:?} ignored");
            return None;
        };
        self.last_state = to;
        if from != to {
            debug!("cpu {cpu}: {from:?} -> {to:?} on {event:?}");
            self.trace(TraceEvent::Lifecycle { cpu, from, to });
        }
        Some(to)
    }

    /// Applies `event` after taking the interrupt lock.
    pub(crate) fn transition_now(&mut self, event: LifecycleEvent) -> Option<RunState> {
        let ctx = Arc::clone(&self.ctx);
        let mut guard = ctx.lock(Some(self.cpu()));
        self.transition(&mut guard, event)
    }

    /// Applies a reset; any guest is abandoned.
    pub(crate) fn apply_reset(&mut self, kind: ResetKind) {
        if self.guest.take().is_some() {
            self.state.set_mode(ExecMode::Native);
        }
        self.state.reset(kind);
        info!("cpu {}: {kind:?} reset applied", self.cpu());
    }

    /// Drains pending resets while stopping or stopped and parks while stopped.
    ///
    /// Blocks only when `blocking` is set; returns once the processor is
    /// started, waiting, or configured offline.
    pub(crate) fn stop_point(&mut self, blocking: bool) -> StopPoint {
        let cpu = self.cpu();
        let ctx = Arc::clone(&self.ctx);
        let mut guard = ctx.lock(Some(cpu));
        loop {
            let Some(slot) = guard.slot_mut(cpu) else {
                return StopPoint::Offline;
            };
            match slot.run_state {
                RunState::Stopping => {
                    let reset = slot.reset.take();
                    slot.pending.remove(IntClass::RESET | IntClass::STOP);
                    if let Some(kind) = reset {
                        self.apply_reset(kind);
                    }
                    self.transition(&mut guard, LifecycleEvent::ResetsDrained);
                }
                RunState::Stopped => {
                    let reset = slot.reset.take();
                    slot.pending.remove(IntClass::RESET | IntClass::STOP);
                    let online = slot.online;
                    if let Some(kind) = reset {
                        self.apply_reset(kind);
                    }
                    if !online {
                        self.last_state = RunState::Stopped;
                        return StopPoint::Offline;
                    }
                    self.last_state = RunState::Stopped;
                    if !blocking {
                        return StopPoint::Parked(RunState::Stopped);
                    }
                    guard.park(cpu);
                }
                state @ (RunState::Started | RunState::Waiting) => {
                    self.last_state = state;
                    return StopPoint::Resume;
                }
            }
        }
    }

    /// Handles a PSW with the wait bit on.
    ///
    /// A disabled wait stops the processor. An enabled wait parks it until an
    /// enabled interruption, a restart or a lifecycle request arrives; a guest
    /// wait exits to the host instead.
    pub(crate) fn wait_point(&mut self, blocking: bool) -> Boundary {
        let cpu = self.cpu();
        if self.guest.is_some() {
            let intercept = self.intercept(InterceptReason::Wait);
            return Boundary::Outcome(StepOutcome::Intercepted(intercept));
        }
        let psw = *self.state().psw();
        if psw.is_disabled_wait() {
            warn!("cpu {cpu}: disabled wait, PSW address {:#x}", psw.ia);
            self.transition_now(LifecycleEvent::DisabledWait);
            return Boundary::Outcome(StepOutcome::NotStarted(RunState::Stopping));
        }
        let ctx = Arc::clone(&self.ctx);
        let mut guard = ctx.lock(Some(cpu));
        self.transition(&mut guard, LifecycleEvent::EnterWait);
        while !self.wait_ends(&guard) {
            if !blocking {
                return Boundary::Outcome(StepOutcome::Waiting);
            }
            guard.park(cpu);
        }
        if guard.run_state(cpu) == Some(RunState::Waiting) {
            self.transition(&mut guard, LifecycleEvent::Wake);
        }
        Boundary::Continue
    }
}
