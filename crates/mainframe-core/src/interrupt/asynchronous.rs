use std::sync::Arc;

use log::warn;

use crate::interrupt::fields::{store_bytes, store_field};
use crate::interrupt::program::{Delivery, SwapError};
use crate::{
    AbortCause, CpuId, ExternalConditions, IntClass, Intercept, InterceptReason,
    InterruptKind, InterruptPresenter, InterruptState, IoInterrupt, LifecycleEvent, MachineCheck,
    ProgramCheck, Processor, PsaLayout, RunState, Storage,
};

/// Result of an interrupt check at an instruction boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CheckOutcome {
    /// Nothing to do; continue fetching.
    Proceed,
    /// An interruption of this class was delivered.
    Delivered(InterruptKind),
    /// The guest must exit to its host.
    Intercepted(Intercept),
    /// Delivery failed fatally; the processor is stopping.
    Stopping,
    /// The processor is stopping or stopped.
    NotStarted,
}

/// An interruption taken off the pending state, to be delivered without the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Presented {
    Restart,
    MachineCheck(MachineCheck),
    External {
        code: u16,
        cpu_address: Option<CpuId>,
        parameter: Option<u32>,
    },
    Io(IoInterrupt),
}

fn io_subclass_mask(cr6: u64) -> u8 {
    (cr6 >> 24).to_be_bytes()[7]
}

/// Removes the highest-priority instance of `condition` from the pending state.
fn consume_external(
    state: &mut InterruptState,
    cpu: CpuId,
    condition: ExternalConditions,
) -> Presented {
    let mut cpu_address = None;
    let mut parameter = None;
    if condition == ExternalConditions::SERVICE_SIGNAL {
        parameter = Some(state.service_parameter);
        state.service_parameter = 0;
        state.system_external.remove(condition);
    } else if let Some(slot) = state.slot_mut(cpu) {
        if condition == ExternalConditions::EMERGENCY_SIGNAL {
            let sender = slot.emergency_from.trailing_zeros();
            slot.emergency_from &= slot.emergency_from.wrapping_sub(1);
            cpu_address = CpuId::try_from(sender).ok();
            if slot.emergency_from == 0 {
                slot.external.remove(condition);
            }
        } else if condition == ExternalConditions::EXTERNAL_CALL {
            cpu_address = slot.external_call_from.take();
            slot.external.remove(condition);
        } else {
            slot.external.remove(condition);
        }
    }
    Presented::External {
        code: condition.code(),
        cpu_address,
        parameter,
    }
}

impl Processor {
    /// Whether anything pending would end an enabled wait.
    pub(crate) fn wait_ends(&self, state: &InterruptState) -> bool {
        let cpu = self.cpu();
        let pending = state.pending_for(cpu);
        if pending.intersects(IntClass::RESTART | IntClass::STOP | IntClass::RESET)
            || state.run_state(cpu) != Some(RunState::Waiting)
        {
            return true;
        }
        let current = self.state();
        let psw = current.psw();
        (psw.machine_check && pending.contains(IntClass::MACHINE_CHECK))
            || (psw.external_enabled()
                && state
                    .external_for(cpu)
                    .highest_enabled(current.regs().cr(0))
                    .is_some())
            || (psw.io_enabled() && pending.contains(IntClass::IO))
    }

    /// Picks the highest-priority enabled interruption and takes it off the pending state.
    ///
    /// A presenter with nothing for this processor clears the system-wide bit.
    fn take_presentable(
        &self,
        state: &mut InterruptState,
        presenter: &dyn InterruptPresenter,
    ) -> Option<Presented> {
        let cpu = self.cpu();
        let current = self.state();
        let psw = current.psw();
        if psw.machine_check && state.system.contains(IntClass::MACHINE_CHECK) {
            match presenter.present_machine_check(cpu) {
                Some(check) => return Some(Presented::MachineCheck(check)),
                None => state.system.remove(IntClass::MACHINE_CHECK),
            }
        }
        if psw.external_enabled() {
            let cr0 = current.regs().cr(0);
            if let Some(condition) = state.external_for(cpu).highest_enabled(cr0) {
                return Some(consume_external(state, cpu, condition));
            }
        }
        if psw.io_enabled() && state.system.contains(IntClass::IO) {
            let mask = io_subclass_mask(current.regs().cr(6));
            match presenter.present_io(cpu, mask) {
                Some(io) => return Some(Presented::Io(io)),
                None => state.system.remove(IntClass::IO),
            }
        }
        None
    }

    /// Checks for pending interruptions and delivers the highest-priority enabled one.
    ///
    /// Priority: pending reset, restart, stop, machine check, external, I/O.
    /// The interrupt lock is dropped before any PSW is swapped.
    pub(crate) fn check_interrupts(&mut self) -> CheckOutcome {
        let cpu = self.cpu();
        let ctx = Arc::clone(&self.ctx);
        let presenter = Arc::clone(&self.presenter);
        let mut guard = ctx.lock(Some(cpu));

        let reset = guard.slot_mut(cpu).and_then(|slot| {
            slot.pending.remove(IntClass::RESET);
            slot.reset.take()
        });
        if let Some(kind) = reset {
            self.apply_reset(kind);
        }

        let pending = guard.pending_for(cpu);
        if self.guest.is_some() && pending.intersects(self.state.enabled_classes()) {
            drop(guard);
            return CheckOutcome::Intercepted(self.intercept(InterceptReason::HostInterrupt));
        }

        let run_state = guard.run_state(cpu).unwrap_or(RunState::Stopped);
        self.last_state = run_state;
        if pending.contains(IntClass::RESTART) {
            if let Some(slot) = guard.slot_mut(cpu) {
                slot.pending.remove(IntClass::RESTART);
            }
            drop(guard);
            return self.deliver(Presented::Restart);
        }
        if matches!(run_state, RunState::Stopping | RunState::Stopped) {
            return CheckOutcome::NotStarted;
        }
        if pending.contains(IntClass::STOP) {
            // A start overtook the stop.
            if let Some(slot) = guard.slot_mut(cpu) {
                slot.pending.remove(IntClass::STOP);
            }
        }

        let Some(presented) = self.take_presentable(&mut guard, presenter.as_ref()) else {
            return CheckOutcome::Proceed;
        };
        if run_state == RunState::Waiting {
            self.transition(&mut guard, LifecycleEvent::Wake);
        }
        drop(guard);
        self.deliver(presented)
    }

    fn deliver(&mut self, presented: Presented) -> CheckOutcome {
        match presented {
            Presented::Restart => self.deliver_async(InterruptKind::Restart, None, 0, |_, _, _| Ok(())),
            Presented::MachineCheck(check) => self.deliver_async(
                InterruptKind::MachineCheck,
                Some(AbortCause::MachineCheck),
                0,
                |storage, base, psa| {
                    store_field(storage, base, psa.machine_check_code, check.code)?;
                    store_field(
                        storage,
                        base,
                        psa.external_damage_code,
                        u64::from(check.external_damage),
                    )?;
                    store_field(storage, base, psa.failing_storage_address, check.failing_address)
                },
            ),
            Presented::External {
                code,
                cpu_address,
                parameter,
            } => self.deliver_async(
                InterruptKind::External,
                Some(AbortCause::External),
                code,
                |storage, base, psa| {
                    store_field(storage, base, psa.external_code, u64::from(code))?;
                    if let Some(address) = cpu_address {
                        store_field(storage, base, psa.external_cpu_address, u64::from(address))?;
                    }
                    if let Some(parameter) = parameter {
                        store_field(storage, base, psa.external_parameter, u64::from(parameter))?;
                    }
                    Ok(())
                },
            ),
            Presented::Io(io) => self.deliver_async(
                InterruptKind::Io,
                Some(AbortCause::Io),
                io.device_address,
                |storage, base, psa| {
                    store_field(storage, base, psa.io_subsystem_id, u64::from(io.subsystem_id))?;
                    store_field(storage, base, psa.io_parameter, u64::from(io.parameter))?;
                    if let Some(span) = psa.io_identification {
                        store_field(storage, base, span, u64::from(io.identification))?;
                    }
                    if let Some(span) = psa.io_device_address {
                        store_field(storage, base, span, u64::from(io.device_address))?;
                    }
                    if let Some(span) = psa.channel_status_word {
                        store_bytes(storage, base, span, &io.csw)?;
                    }
                    Ok(())
                },
            ),
        }
    }

    /// Aborts any transaction, stores the class fields and swaps PSWs.
    ///
    /// An unusable new PSW becomes a specification exception recognised
    /// outside any instruction.
    fn deliver_async<F>(
        &mut self,
        kind: InterruptKind,
        cause: Option<AbortCause>,
        code: u16,
        fields: F,
    ) -> CheckOutcome
    where
        F: FnOnce(&dyn Storage, u64, &PsaLayout) -> Result<(), ProgramCheck>,
    {
        if let Some(cause) = cause {
            if let Some(abort) = self.abort_transaction(cause) {
                abort.apply(self.state_mut().psw_mut());
            }
        }
        let storage = Arc::clone(&self.storage);
        let base = self.state().psa_address(0);
        let psa = self.state().arch().psa();
        let result = fields(storage.as_ref(), base, psa)
            .map_err(SwapError::from)
            .and_then(|()| self.swap_psw(kind, code, 0));
        match result {
            Ok(old_address) => {
                self.delivered(kind, code, old_address);
                CheckOutcome::Delivered(kind)
            }
            Err(err) => {
                warn!("cpu {}: {kind:?} interruption not delivered: {err}", self.cpu());
                match self.program_check_now(err.check()) {
                    Delivery::Delivered => CheckOutcome::Delivered(InterruptKind::Program),
                    Delivery::Intercepted(intercept) => CheckOutcome::Intercepted(intercept),
                    Delivery::Loop => {
                        self.transition_now(LifecycleEvent::Fatal);
                        CheckOutcome::Stopping
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::io_subclass_mask;

    #[test]
    fn io_subclass_mask_is_taken_from_cr6_bits_32_to_39() {
        assert_eq!(io_subclass_mask(0xFF00_0000), 0xFF);
        assert_eq!(io_subclass_mask(0x8000_0000), 0x80);
        assert_eq!(io_subclass_mask(0x00FF_FFFF), 0);
    }
}
