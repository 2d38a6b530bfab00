use std::sync::Arc;

use log::{debug, error, trace};
use thiserror::Error;

use crate::interrupt::fields::{fetch_psw, store_field};
use crate::{
    psw, reflect_program_interrupt, AbortCause, DiagArea, FaultSite, Intercept, InterceptReason,
    InterruptKind, PerEvent, Processor, ProgramCheck, ProgramCode, PswFormat, Reflection,
    SpecificationFault, TraceEvent, PER_EVENT_FLAG, TRANSACTION_FLAG,
};

/// Result of delivering a synchronous interruption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    /// The PSWs were swapped; execution continues at the new PSW.
    Delivered,
    /// The guest PSW is untouched and the host must handle the event.
    Intercepted(Intercept),
    /// The program new PSW could not be loaded; the processor must stop.
    Loop,
}

/// Why a PSW swap failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub(crate) enum SwapError {
    #[error("PSA not accessible: {0}")]
    Storage(#[from] ProgramCheck),
    #[error("invalid new PSW: {0}")]
    NewPsw(#[from] SpecificationFault),
}

impl SwapError {
    /// The program check the failed swap raises.
    pub(crate) fn check(self) -> ProgramCheck {
        match self {
            Self::Storage(check) => check,
            Self::NewPsw(fault) => fault.into(),
        }
    }
}

impl Processor {
    /// Stores the current PSW as the old PSW of `kind` and loads its new PSW.
    ///
    /// In basic-control mode `code` and `ilc` travel in the old PSW itself.
    /// Returns the instruction address of the stored old PSW. A new PSW that
    /// fails validation leaves the current PSW in place.
    pub(crate) fn swap_psw(
        &mut self,
        kind: InterruptKind,
        code: u16,
        ilc: u8,
    ) -> Result<u64, SwapError> {
        let storage = Arc::clone(&self.storage);
        let state = self.state_mut();
        let arch = state.arch();
        let psa = arch.psa();
        let mut old = *state.psw();
        if old.format == PswFormat::BasicControl {
            old.interruption_code = code;
            old.ilc = ilc;
        }
        let image = psw::encode(arch, &old);
        storage.store_absolute(state.psa_address(psa.old_psw(kind)), image.as_bytes())?;
        let new = fetch_psw(
            storage.as_ref(),
            state.psa_address(psa.new_psw(kind)),
            arch.psw_len(),
        )?;
        state.load_psw(&new[..arch.psw_len()])?;
        Ok(old.ia)
    }

    /// Bookkeeping for a completed delivery.
    pub(crate) fn delivered(&mut self, kind: InterruptKind, code: u16, old_address: u64) {
        let cpu = self.cpu();
        self.diag.record_interrupt(kind);
        trace!("cpu {cpu}: {kind:?} interruption {code:#06x}, old PSW at {old_address:#x}");
        self.trace(TraceEvent::Interrupt {
            cpu,
            kind,
            code,
            old_address,
        });
    }

    /// Builds the exit information for the active guest.
    pub(crate) fn intercept(&mut self, reason: InterceptReason) -> Intercept {
        let cpu = self.cpu();
        let state_descriptor = self
            .guest
            .as_deref()
            .map_or(0, |guest| guest.host.state_descriptor);
        self.diag.record_intercept();
        debug!("cpu {cpu}: guest intercept {reason:?}, sd {state_descriptor:#x}");
        self.trace(TraceEvent::Intercept { cpu, reason });
        Intercept {
            reason,
            state_descriptor,
        }
    }

    fn store_program_fields(
        &self,
        base: u64,
        code: u16,
        ilc: u8,
        check: &ProgramCheck,
        per: Option<PerEvent>,
    ) -> Result<(), ProgramCheck> {
        let storage = self.storage.as_ref();
        let state = self.state();
        let psa = state.arch().psa();
        if state.psw().format != PswFormat::BasicControl {
            store_field(storage, base, psa.program_ilc, u64::from(ilc))?;
            store_field(storage, base, psa.program_code, u64::from(code))?;
        }
        let detail = &check.detail;
        if let Some(teid) = detail.translation_exception_id {
            if check.code.stores_translation_id() {
                store_field(storage, base, psa.translation_exception_id, teid)?;
            }
        }
        if let Some(dxc) = detail.data_exception_code {
            store_field(storage, base, psa.data_exception_code, u64::from(dxc))?;
        }
        if let Some(monitor) = detail.monitor {
            store_field(storage, base, psa.monitor_class, u64::from(monitor.class))?;
            store_field(storage, base, psa.monitor_code, monitor.code)?;
        }
        if let Some(id) = detail.exception_access_id {
            store_field(storage, base, psa.exception_access_id, u64::from(id))?;
        }
        if let Some(per) = per {
            store_field(storage, base, psa.per_code, u64::from(per.code))?;
            store_field(storage, base, psa.per_address, per.address)?;
        }
        Ok(())
    }

    /// Delivers a program interruption for `check` recognised at `site`.
    ///
    /// Order: locks held by this processor are released, the old PSW is
    /// adjusted for fetch or nullification, an active transaction is aborted, a
    /// pending PER event is merged, a guest event may be handed to the host,
    /// and finally the PSWs are swapped. A new PSW that fails to load is never
    /// retried: natively it is reported as [`Delivery::Loop`], in a guest as a
    /// validity intercept.
    pub(crate) fn program_interrupt(&mut self, check: ProgramCheck, site: FaultSite) -> Delivery {
        let cpu = self.cpu();
        self.ctx.release_locks_held_by(cpu);

        let ilc = match site {
            FaultSite::Fetch { ilc } | FaultSite::Execute { ilc } => ilc,
            FaultSite::NoInstruction => 0,
        };
        let mut old = *self.state().psw();
        match site {
            FaultSite::Fetch { ilc } => old.advance(u64::from(ilc)),
            FaultSite::Execute { ilc } if check.code.is_nullifying() => {
                old.back_up(u64::from(ilc));
            }
            _ => {}
        }

        let mut code = check.code.as_u16();
        if check.code != ProgramCode::TransactionConstraint {
            if let Some(abort) = self.abort_transaction(AbortCause::Program) {
                abort.apply(&mut old);
                code |= TRANSACTION_FLAG;
            }
        }
        let per = self.state_mut().per_pending.take();
        if per.is_some() {
            code |= PER_EVENT_FLAG;
        }

        let reflection = self.guest.as_deref().map(|guest| {
            (
                reflect_program_interrupt(code, guest.state.mode(), &guest.host),
                guest.state.psa_address(0),
            )
        });
        if let Some((Reflection::Intercept(area), guest_psa)) = reflection {
            let base = match area {
                DiagArea::GuestPsa => guest_psa,
                DiagArea::HostParameterArea(address) => address,
            };
            if let Err(err) = self.store_program_fields(base, code, ilc, &check, per) {
                debug!("cpu {cpu}: intercept fields not stored: {err}");
            }
            self.diag.record_program(code, old.ia);
            return Delivery::Intercepted(self.intercept(InterceptReason::Program { code, ilc }));
        }

        self.state_mut().set_psw(old);
        self.diag.record_program(code, old.ia);
        let base = self.state().psa_address(0);
        let result = self
            .store_program_fields(base, code, ilc, &check, per)
            .map_err(SwapError::from)
            .and_then(|()| self.swap_psw(InterruptKind::Program, code, ilc));
        match result {
            Ok(old_address) => {
                self.delivered(InterruptKind::Program, code, old_address);
                Delivery::Delivered
            }
            Err(err) if self.guest.is_some() => {
                debug!("cpu {cpu}: guest program new PSW unusable: {err}");
                Delivery::Intercepted(self.intercept(InterceptReason::Validity { code }))
            }
            Err(err) => {
                error!("cpu {cpu}: program interruption loop, code {code:#06x}: {err}");
                self.diag.record_program_loop();
                self.trace(TraceEvent::ProgramInterruptLoop { cpu, code });
                Delivery::Loop
            }
        }
    }

    /// Delivers a supervisor-call interruption for `SVC number`.
    pub(crate) fn svc_interrupt(&mut self, number: u8, ilc: u8) -> Delivery {
        let code = u16::from(number);
        let storage = Arc::clone(&self.storage);
        let state = self.state();
        let psa = state.arch().psa();
        let base = state.psa_address(0);
        let fields = if state.psw().format == PswFormat::BasicControl {
            Ok(())
        } else {
            store_field(storage.as_ref(), base, psa.svc_ilc, u64::from(ilc))
                .and_then(|()| store_field(storage.as_ref(), base, psa.svc_code, u64::from(code)))
        };
        let result = fields
            .map_err(SwapError::from)
            .and_then(|()| self.swap_psw(InterruptKind::SupervisorCall, code, ilc));
        match result {
            Ok(old_address) => {
                self.delivered(InterruptKind::SupervisorCall, code, old_address);
                Delivery::Delivered
            }
            Err(err) => self.program_check_now(err.check()),
        }
    }
}
