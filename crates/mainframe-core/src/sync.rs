//! Shared context for a processor complex: the interrupt lock guarding pending
//! interruption state and lifecycle states, per-processor condition variables,
//! and the storage-serialization lock.
//!
//! Lock order is fixed: a processor never requests the storage-serialization
//! lock while holding the interrupt lock. Interrupt-lock guards are scoped, so
//! by the time a trap reaches the dispatch boundary only the
//! storage-serialization lock can still be held; [`SystemContext::release_locks_held_by`]
//! discharges it.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use log::debug;
use parking_lot::{Condvar, Mutex, MutexGuard};
use thiserror::Error;

use crate::{
    CpuConfig, CpuId, ExternalConditions, IntClass, LifecycleEvent, ResetKind, RunState,
};

const NO_HOLDER: u32 = u32::MAX;

/// Lock-discipline violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum LockError {
    /// The processor already holds the storage-serialization lock.
    #[error("processor {0} already holds the storage-serialization lock")]
    Reentrant(CpuId),
    /// The processor released a lock it does not hold.
    #[error("processor {0} released a lock it does not hold")]
    NotHeld(CpuId),
    /// The storage-serialization lock was requested under the interrupt lock.
    #[error("processor {0} requested the storage-serialization lock while holding the interrupt lock")]
    OrderViolation(CpuId),
}

/// Request addressed to a processor that is not configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum ContextError {
    /// No such processor.
    #[error("processor {0} is not configured")]
    UnknownCpu(CpuId),
}

/// Which processor holds each global lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct LockOwnership {
    /// Holder of the interrupt lock.
    pub interrupt: Option<CpuId>,
    /// Holder of the storage-serialization lock.
    pub storage: Option<CpuId>,
}

/// Per-processor slice of the interrupt state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuSlot {
    /// Lifecycle state.
    pub run_state: RunState,
    /// Configured online.
    pub online: bool,
    /// Processor-local pending classes (`RESTART`, `STOP`, `RESET`).
    pub pending: IntClass,
    /// Processor-local external conditions.
    pub external: ExternalConditions,
    /// Bit per processor address that sent an emergency signal.
    pub emergency_from: u64,
    /// Sender of the pending external call.
    pub external_call_from: Option<CpuId>,
    /// Strongest reset requested and not yet applied.
    pub reset: Option<ResetKind>,
}

impl Default for CpuSlot {
    fn default() -> Self {
        Self {
            run_state: RunState::Stopped,
            online: true,
            pending: IntClass::empty(),
            external: ExternalConditions::empty(),
            emergency_from: 0,
            external_call_from: None,
            reset: None,
        }
    }
}

/// State guarded by the interrupt lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterruptState {
    /// System-wide pending classes (`IO`, `MACHINE_CHECK`).
    pub system: IntClass,
    /// System-wide external conditions (service signal).
    pub system_external: ExternalConditions,
    /// Accumulated service-signal parameter.
    pub service_parameter: u32,
    /// Set once the complex is shutting down.
    pub shutdown: bool,
    cpus: Vec<CpuSlot>,
}

impl InterruptState {
    fn new(num_cpus: u16) -> Self {
        Self {
            system: IntClass::empty(),
            system_external: ExternalConditions::empty(),
            service_parameter: 0,
            shutdown: false,
            cpus: vec![CpuSlot::default(); usize::from(num_cpus)],
        }
    }

    /// Slot for `cpu`.
    #[must_use]
    pub fn slot(&self, cpu: CpuId) -> Option<&CpuSlot> {
        self.cpus.get(usize::from(cpu))
    }

    /// Mutable slot for `cpu`.
    pub fn slot_mut(&mut self, cpu: CpuId) -> Option<&mut CpuSlot> {
        self.cpus.get_mut(usize::from(cpu))
    }

    /// External conditions presentable to `cpu`.
    #[must_use]
    pub fn external_for(&self, cpu: CpuId) -> ExternalConditions {
        self.slot(cpu)
            .map_or(ExternalConditions::empty(), |slot| slot.external)
            | self.system_external
    }

    /// Every class pending for `cpu`, system-wide classes included.
    #[must_use]
    pub fn pending_for(&self, cpu: CpuId) -> IntClass {
        let mut classes = self.system & (IntClass::IO | IntClass::MACHINE_CHECK);
        if let Some(slot) = self.slot(cpu) {
            classes |= slot.pending;
            if !slot.online {
                classes |= IntClass::STOP;
            }
        }
        if !self.external_for(cpu).is_empty() {
            classes |= IntClass::EXTERNAL;
        }
        classes
    }

    /// Lifecycle state of `cpu`.
    #[must_use]
    pub fn run_state(&self, cpu: CpuId) -> Option<RunState> {
        self.slot(cpu).map(|slot| slot.run_state)
    }

    /// Applies a lifecycle event to `cpu`, returning `(from, to)` when accepted.
    pub fn apply(&mut self, cpu: CpuId, event: LifecycleEvent) -> Option<(RunState, RunState)> {
        let slot = self.slot_mut(cpu)?;
        let from = slot.run_state;
        let to = from.transition(event).ok()?;
        slot.run_state = to;
        Some((from, to))
    }
}

/// Guard over [`InterruptState`] that tracks its holder.
///
/// Dropping the guard republishes every processor's attention hint.
pub struct IntLockGuard<'a> {
    ctx: &'a SystemContext,
    guard: MutexGuard<'a, InterruptState>,
    holder: u32,
}

impl IntLockGuard<'_> {
    /// Blocks `cpu`'s thread on its condition variable, releasing the lock while parked.
    pub fn park(&mut self, cpu: CpuId) {
        let ctx = self.ctx;
        let Some(cv) = ctx.wake.get(usize::from(cpu)) else {
            return;
        };
        ctx.publish(&self.guard);
        ctx.intlock_holder.store(NO_HOLDER, Ordering::Release);
        cv.wait(&mut self.guard);
        ctx.intlock_holder.store(self.holder, Ordering::Release);
    }

    /// Wakes `cpu` if it is parked.
    pub fn wake(&self, cpu: CpuId) {
        if let Some(cv) = self.ctx.wake.get(usize::from(cpu)) {
            cv.notify_all();
        }
    }

    /// Wakes every processor.
    pub fn wake_all(&self) {
        for cv in &*self.ctx.wake {
            cv.notify_all();
        }
    }
}

impl Deref for IntLockGuard<'_> {
    type Target = InterruptState;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl DerefMut for IntLockGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

impl Drop for IntLockGuard<'_> {
    fn drop(&mut self) {
        self.ctx.publish(&self.guard);
        self.ctx.intlock_holder.store(NO_HOLDER, Ordering::Release);
    }
}

/// Shared context passed explicitly to every processor of a complex.
#[derive(Debug)]
pub struct SystemContext {
    config: CpuConfig,
    intlock: Mutex<InterruptState>,
    intlock_holder: AtomicU32,
    wake: Box<[Condvar]>,
    attention: Box<[AtomicU32]>,
    mainlock: Mutex<Option<CpuId>>,
    mainlock_released: Condvar,
    instructions: AtomicU64,
}

impl SystemContext {
    /// Creates a context with every configured processor online and stopped.
    #[must_use]
    pub fn new(config: CpuConfig) -> Self {
        let count = usize::from(config.num_cpus);
        Self {
            config,
            intlock: Mutex::new(InterruptState::new(config.num_cpus)),
            intlock_holder: AtomicU32::new(NO_HOLDER),
            wake: (0..count).map(|_| Condvar::new()).collect(),
            attention: (0..count).map(|_| AtomicU32::new(0)).collect(),
            mainlock: Mutex::new(None),
            mainlock_released: Condvar::new(),
            instructions: AtomicU64::new(0),
        }
    }

    /// Configuration the complex was built from.
    #[must_use]
    pub const fn config(&self) -> &CpuConfig {
        &self.config
    }

    /// Acquires the interrupt lock on behalf of `holder` (`None` for operator requests).
    pub fn lock(&self, holder: Option<CpuId>) -> IntLockGuard<'_> {
        let guard = self.intlock.lock();
        let holder = holder.map_or(NO_HOLDER, u32::from);
        self.intlock_holder.store(holder, Ordering::Release);
        IntLockGuard {
            ctx: self,
            guard,
            holder,
        }
    }

    fn publish(&self, state: &InterruptState) {
        for (cpu, hint) in (0..).zip(self.attention.iter()) {
            hint.store(state.pending_for(cpu).bits(), Ordering::Release);
        }
    }

    /// Lock-free hint of the classes pending for `cpu`, as of the last unlock.
    #[must_use]
    pub fn attention(&self, cpu: CpuId) -> IntClass {
        self.attention
            .get(usize::from(cpu))
            .map_or(IntClass::empty(), |hint| {
                IntClass::from_bits_truncate(hint.load(Ordering::Acquire))
            })
    }

    fn interrupt_holder(&self) -> Option<CpuId> {
        CpuId::try_from(self.intlock_holder.load(Ordering::Acquire)).ok()
    }

    /// Acquires the storage-serialization lock for `cpu`, blocking while another holds it.
    ///
    /// # Errors
    ///
    /// [`LockError::Reentrant`] when `cpu` already holds it,
    /// [`LockError::OrderViolation`] when `cpu` holds the interrupt lock.
    pub fn obtain_mainlock(&self, cpu: CpuId) -> Result<(), LockError> {
        if self.interrupt_holder() == Some(cpu) {
            return Err(LockError::OrderViolation(cpu));
        }
        let mut holder = self.mainlock.lock();
        if *holder == Some(cpu) {
            return Err(LockError::Reentrant(cpu));
        }
        while holder.is_some() {
            self.mainlock_released.wait(&mut holder);
        }
        *holder = Some(cpu);
        Ok(())
    }

    /// Acquires the storage-serialization lock only if it is free.
    ///
    /// # Errors
    ///
    /// Same as [`Self::obtain_mainlock`].
    pub fn try_obtain_mainlock(&self, cpu: CpuId) -> Result<bool, LockError> {
        if self.interrupt_holder() == Some(cpu) {
            return Err(LockError::OrderViolation(cpu));
        }
        let mut holder = self.mainlock.lock();
        match *holder {
            Some(owner) if owner == cpu => Err(LockError::Reentrant(cpu)),
            Some(_) => Ok(false),
            None => {
                *holder = Some(cpu);
                Ok(true)
            }
        }
    }

    /// Releases the storage-serialization lock held by `cpu`.
    ///
    /// # Errors
    ///
    /// [`LockError::NotHeld`] when `cpu` is not the holder.
    pub fn release_mainlock(&self, cpu: CpuId) -> Result<(), LockError> {
        let mut holder = self.mainlock.lock();
        if *holder != Some(cpu) {
            return Err(LockError::NotHeld(cpu));
        }
        *holder = None;
        self.mainlock_released.notify_one();
        Ok(())
    }

    /// Releases whatever global lock `cpu` still holds; returns what was released.
    pub fn release_locks_held_by(&self, cpu: CpuId) -> LockOwnership {
        let mut released = LockOwnership::default();
        let mut holder = self.mainlock.lock();
        if *holder == Some(cpu) {
            *holder = None;
            self.mainlock_released.notify_one();
            released.storage = Some(cpu);
            debug!("cpu {cpu}: storage-serialization lock released on trap");
        }
        released
    }

    /// Current lock holders.
    #[must_use]
    pub fn ownership(&self) -> LockOwnership {
        LockOwnership {
            interrupt: self.interrupt_holder(),
            storage: *self.mainlock.lock(),
        }
    }

    /// Adds to the system-wide instruction counter.
    pub fn add_instructions(&self, count: u64) {
        self.instructions.fetch_add(count, Ordering::Relaxed);
    }

    /// System-wide instruction counter.
    #[must_use]
    pub fn instructions(&self) -> u64 {
        self.instructions.load(Ordering::Relaxed)
    }

    fn request<F>(&self, cpu: CpuId, apply: F) -> Result<(), ContextError>
    where
        F: FnOnce(&mut InterruptState),
    {
        let mut guard = self.lock(None);
        if guard.slot(cpu).is_none() {
            return Err(ContextError::UnknownCpu(cpu));
        }
        apply(&mut guard);
        guard.wake(cpu);
        Ok(())
    }

    /// Start request; withdraws a stop request not yet observed.
    ///
    /// Ignored for a processor configured offline.
    ///
    /// # Errors
    ///
    /// [`ContextError::UnknownCpu`] for an unconfigured processor.
    pub fn start(&self, cpu: CpuId) -> Result<(), ContextError> {
        self.request(cpu, |state| {
            let Some(slot) = state.slot_mut(cpu) else {
                return;
            };
            if !slot.online {
                return;
            }
            slot.pending.remove(IntClass::STOP);
            state.apply(cpu, LifecycleEvent::Start);
        })
    }

    /// Stop request; the processor observes it at its next interrupt check.
    ///
    /// # Errors
    ///
    /// [`ContextError::UnknownCpu`] for an unconfigured processor.
    pub fn stop(&self, cpu: CpuId) -> Result<(), ContextError> {
        self.request(cpu, |state| {
            if let Some(slot) = state.slot_mut(cpu) {
                slot.pending |= IntClass::STOP;
            }
            state.apply(cpu, LifecycleEvent::StopRequest);
        })
    }

    /// Restart request; starts a stopped processor and makes the restart interruption pending.
    ///
    /// Ignored for a processor configured offline.
    ///
    /// # Errors
    ///
    /// [`ContextError::UnknownCpu`] for an unconfigured processor.
    pub fn restart(&self, cpu: CpuId) -> Result<(), ContextError> {
        self.request(cpu, |state| {
            let Some(slot) = state.slot_mut(cpu) else {
                return;
            };
            if !slot.online {
                return;
            }
            slot.pending |= IntClass::RESTART;
            slot.pending.remove(IntClass::STOP);
            state.apply(cpu, LifecycleEvent::Restart);
        })
    }

    /// Reset request; stops the processor, which applies the reset while stopping.
    ///
    /// # Errors
    ///
    /// [`ContextError::UnknownCpu`] for an unconfigured processor.
    pub fn reset(&self, cpu: CpuId, kind: ResetKind) -> Result<(), ContextError> {
        self.request(cpu, |state| {
            if let Some(slot) = state.slot_mut(cpu) {
                slot.reset = slot.reset.max(Some(kind));
                slot.pending |= IntClass::RESET | IntClass::STOP;
            }
            state.apply(cpu, LifecycleEvent::StopRequest);
        })
    }

    /// Makes external conditions pending for `cpu`.
    ///
    /// # Errors
    ///
    /// [`ContextError::UnknownCpu`] for an unconfigured processor.
    pub fn raise_external(
        &self,
        cpu: CpuId,
        conditions: ExternalConditions,
    ) -> Result<(), ContextError> {
        self.request(cpu, |state| {
            if let Some(slot) = state.slot_mut(cpu) {
                slot.external |= conditions;
            }
        })
    }

    /// Emergency signal from `from` to `to`.
    ///
    /// # Errors
    ///
    /// [`ContextError::UnknownCpu`] for an unconfigured target.
    pub fn signal_emergency(&self, from: CpuId, to: CpuId) -> Result<(), ContextError> {
        self.request(to, |state| {
            if let Some(slot) = state.slot_mut(to) {
                slot.emergency_from |= 1_u64.checked_shl(u32::from(from)).unwrap_or(0);
                slot.external |= ExternalConditions::EMERGENCY_SIGNAL;
            }
        })
    }

    /// External call from `from` to `to`; returns `false` if one is already pending.
    ///
    /// # Errors
    ///
    /// [`ContextError::UnknownCpu`] for an unconfigured target.
    pub fn signal_external_call(&self, from: CpuId, to: CpuId) -> Result<bool, ContextError> {
        let mut accepted = false;
        self.request(to, |state| {
            if let Some(slot) = state.slot_mut(to) {
                if slot.external_call_from.is_none() {
                    slot.external_call_from = Some(from);
                    slot.external |= ExternalConditions::EXTERNAL_CALL;
                    accepted = true;
                }
            }
        })?;
        Ok(accepted)
    }

    /// Raises a service signal with `parameter` merged into the pending parameter.
    pub fn raise_service_signal(&self, parameter: u32) {
        let mut guard = self.lock(None);
        guard.system_external |= ExternalConditions::SERVICE_SIGNAL;
        guard.service_parameter |= parameter;
        guard.wake_all();
    }

    /// Signals that the I/O subsystem has an interruption to present.
    pub fn raise_io(&self) {
        let mut guard = self.lock(None);
        guard.system |= IntClass::IO;
        guard.wake_all();
    }

    /// Signals that a machine-check condition is pending.
    pub fn raise_machine_check(&self) {
        let mut guard = self.lock(None);
        guard.system |= IntClass::MACHINE_CHECK;
        guard.wake_all();
    }

    /// Configures `cpu` offline; its dispatch loop exits at the next stop point.
    ///
    /// # Errors
    ///
    /// [`ContextError::UnknownCpu`] for an unconfigured processor.
    pub fn configure_offline(&self, cpu: CpuId) -> Result<(), ContextError> {
        self.request(cpu, |state| {
            if let Some(slot) = state.slot_mut(cpu) {
                slot.online = false;
                slot.pending |= IntClass::STOP;
            }
            state.apply(cpu, LifecycleEvent::StopRequest);
        })
    }

    /// Takes every processor offline.
    pub fn shutdown(&self) {
        let mut guard = self.lock(None);
        guard.shutdown = true;
        for cpu in 0..self.config.num_cpus {
            if let Some(slot) = guard.slot_mut(cpu) {
                slot.online = false;
                slot.pending |= IntClass::STOP;
            }
            guard.apply(cpu, LifecycleEvent::StopRequest);
        }
        guard.wake_all();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::{LockError, SystemContext};
    use crate::{CpuConfig, ExternalConditions, IntClass, ResetKind, RunState};

    fn context(num_cpus: u16) -> SystemContext {
        SystemContext::new(CpuConfig {
            num_cpus,
            ..CpuConfig::default()
        })
    }

    #[test]
    fn mainlock_rejects_reentry_and_foreign_release() {
        let ctx = context(2);
        ctx.obtain_mainlock(0).unwrap();
        assert_eq!(ctx.obtain_mainlock(0), Err(LockError::Reentrant(0)));
        assert_eq!(ctx.release_mainlock(1), Err(LockError::NotHeld(1)));
        assert_eq!(ctx.try_obtain_mainlock(1), Ok(false));
        ctx.release_mainlock(0).unwrap();
        assert_eq!(ctx.try_obtain_mainlock(1), Ok(true));
    }

    #[test]
    fn mainlock_under_interrupt_lock_is_an_order_violation() {
        let ctx = context(1);
        let guard = ctx.lock(Some(0));
        assert_eq!(ctx.obtain_mainlock(0), Err(LockError::OrderViolation(0)));
        drop(guard);
        assert!(ctx.obtain_mainlock(0).is_ok());
    }

    #[test]
    fn release_on_trap_frees_mainlock_for_other_processors() {
        let ctx = Arc::new(context(2));
        ctx.obtain_mainlock(0).unwrap();
        let released = ctx.release_locks_held_by(0);
        assert_eq!(released.storage, Some(0));
        let other = Arc::clone(&ctx);
        let handle = thread::spawn(move || other.try_obtain_mainlock(1));
        assert_eq!(handle.join().unwrap(), Ok(true));
        assert_eq!(ctx.ownership().storage, Some(1));
    }

    #[test]
    fn holder_is_tracked_while_guard_lives() {
        let ctx = context(2);
        {
            let _guard = ctx.lock(Some(1));
            assert_eq!(ctx.ownership().interrupt, Some(1));
        }
        assert_eq!(ctx.ownership().interrupt, None);
    }

    #[test]
    fn attention_hint_reflects_pending_state_after_unlock() {
        let ctx = context(2);
        ctx.raise_io();
        ctx.raise_external(1, ExternalConditions::CPU_TIMER).unwrap();
        assert!(ctx.attention(0).contains(IntClass::IO));
        assert!(!ctx.attention(0).contains(IntClass::EXTERNAL));
        assert!(ctx.attention(1).contains(IntClass::IO | IntClass::EXTERNAL));
    }

    #[test]
    fn requests_drive_lifecycle_states() {
        let ctx = context(1);
        ctx.start(0).unwrap();
        assert_eq!(ctx.lock(None).run_state(0), Some(RunState::Started));
        ctx.reset(0, ResetKind::InitialCpu).unwrap();
        let guard = ctx.lock(None);
        assert_eq!(guard.run_state(0), Some(RunState::Stopping));
        assert_eq!(guard.slot(0).unwrap().reset, Some(ResetKind::InitialCpu));
    }

    #[test]
    fn unknown_processor_is_rejected() {
        let ctx = context(1);
        assert!(ctx.stop(3).is_err());
    }

    #[test]
    fn second_external_call_is_refused_while_pending() {
        let ctx = context(2);
        assert_eq!(ctx.signal_external_call(0, 1), Ok(true));
        assert_eq!(ctx.signal_external_call(0, 1), Ok(false));
    }
}
