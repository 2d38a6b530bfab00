//! Interpretive execution: a guest configuration running under a host on the
//! same processor, and the decision of which guest program interruptions the
//! host must see.

use bitflags::bitflags;
use log::debug;
use thiserror::Error;

use crate::{
    ExecMode, Facilities, Processor, ProcessorState, ProgramCode, Psw, SpecificationFault,
    PER_EVENT_FLAG, TRANSACTION_FLAG,
};

/// Offset of the interception-parameter pseudo-PSA within a state descriptor.
pub const SIE_IP_PSA_OFFSET: u64 = 0x40;

bitflags! {
    /// Host facilities that change which guest interruptions are always intercepted.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
    pub struct HostFacilities: u32 {
        /// Protection exceptions may be delivered to the guest.
        const PROTECTION_INTERCEPTION = 1 << 0;
        /// PER events may be delivered to the guest.
        const GUEST_PER = 1 << 1;
    }
}

bitflags! {
    /// Interception controls from the state descriptor: set bits keep the class with the host.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
    pub struct InterceptControls: u32 {
        /// Operation exceptions.
        const OPERATION = 1 << 0;
        /// Privileged-operation exceptions.
        const PRIVILEGED_OPERATION = 1 << 1;
        /// Protection exceptions, when the protection-interception facility is installed.
        const PROTECTION = 1 << 2;
        /// PER events, when the guest-PER facility is installed.
        const PER = 1 << 3;
        /// Every other program interruption.
        const PROGRAM_ALL = 1 << 4;
    }
}

/// Host configuration consulted for a guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct HostConfig {
    /// Host facilities.
    pub facilities: HostFacilities,
    /// Interception controls.
    pub controls: InterceptControls,
    /// Absolute address of the guest's state descriptor.
    pub state_descriptor: u64,
}

/// Where diagnostic fields of an intercepted interruption are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiagArea {
    /// The guest's own PSA.
    GuestPsa,
    /// The host-owned parameter area at the given absolute address.
    HostParameterArea(u64),
}

/// Outcome of [`reflect_program_interrupt`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reflection {
    /// The running record handles the interruption itself.
    Deliver,
    /// The host intercepts; fields go to the given area.
    Intercept(DiagArea),
}

impl Reflection {
    /// Returns `true` when the host must intercept.
    #[must_use]
    pub const fn must_intercept(self) -> bool {
        matches!(self, Self::Intercept(_))
    }
}

/// Decides whether a program interruption with `code` must be intercepted by the host.
///
/// `code` may carry the PER and transaction flags. The result depends on
/// nothing but the arguments. A parameter area past the end of the address
/// space saturates at `u64::MAX`, which no storage accepts.
#[must_use]
pub fn reflect_program_interrupt(code: u16, mode: ExecMode, host: &HostConfig) -> Reflection {
    if mode != ExecMode::Guest {
        return Reflection::Deliver;
    }
    let per = code & PER_EVENT_FLAG != 0;
    let base = ProgramCode::from_u16(code & !(PER_EVENT_FLAG | TRANSACTION_FLAG));
    let protection_delegable = host
        .facilities
        .contains(HostFacilities::PROTECTION_INTERCEPTION);

    let always = matches!(
        base,
        Some(ProgramCode::Addressing | ProgramCode::Specification | ProgramCode::SpecialOperation)
    ) || (base == Some(ProgramCode::Protection) && !protection_delegable)
        || (per && !host.facilities.contains(HostFacilities::GUEST_PER));

    let controlled = match base {
        Some(ProgramCode::Operation) => host.controls.contains(InterceptControls::OPERATION),
        Some(ProgramCode::PrivilegedOperation) => {
            host.controls.contains(InterceptControls::PRIVILEGED_OPERATION)
        }
        Some(ProgramCode::Protection) => host.controls.contains(InterceptControls::PROTECTION),
        None if per => host.controls.contains(InterceptControls::PER),
        _ => host.controls.contains(InterceptControls::PROGRAM_ALL),
    };

    if !(always || controlled) {
        return Reflection::Deliver;
    }
    let area = if base == Some(ProgramCode::Operation) {
        DiagArea::GuestPsa
    } else {
        DiagArea::HostParameterArea(host.state_descriptor.saturating_add(SIE_IP_PSA_OFFSET))
    };
    Reflection::Intercept(area)
}

/// Why a guest exited to its host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterceptReason {
    /// A program interruption the host must handle.
    Program {
        /// Interruption code including PER/transaction flags.
        code: u16,
        /// Instruction length code in bytes.
        ilc: u8,
    },
    /// A host interruption became pending while the guest ran.
    HostInterrupt,
    /// The guest PSW entered a wait state.
    Wait,
    /// The guest's own new PSW was invalid; the guest cannot continue.
    Validity {
        /// Code of the interruption whose new PSW failed to load.
        code: u16,
    },
}

/// Guest exit information returned to the interpretive-execution driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Intercept {
    /// Reason for the exit.
    pub reason: InterceptReason,
    /// State descriptor of the exiting guest.
    pub state_descriptor: u64,
}

/// Misuse of nested entry or exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum NestError {
    /// A guest is already active on this processor.
    #[error("a guest is already active on this processor")]
    AlreadyNested,
    /// No guest is active.
    #[error("no guest is active on this processor")]
    NotNested,
    /// The processor is itself a guest or lacks the facility.
    #[error("interpretive execution is not available")]
    Unavailable,
    /// The initial guest PSW is invalid.
    #[error("invalid guest PSW: {0}")]
    GuestPsw(#[from] SpecificationFault),
    /// The guest PSA or the state descriptor runs past the end of the address space.
    #[error("guest storage or state descriptor at {0:#x} exceeds the address space")]
    AddressRange(u64),
}

/// Parameters for entering a guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestEntry {
    /// Host configuration for the guest.
    pub host: HostConfig,
    /// Guest main-storage origin in host absolute storage.
    pub origin: u64,
    /// Guest prefix.
    pub prefix: u64,
    /// Initial guest PSW image in the guest's architecture.
    pub psw: [u8; 16],
}

/// An active guest: its state record and the host configuration it runs under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestState {
    /// Guest state record.
    pub state: ProcessorState,
    /// Host configuration.
    pub host: HostConfig,
}

impl GuestState {
    /// Builds a guest record from `entry` for a host with `host_state`.
    ///
    /// # Errors
    ///
    /// [`NestError::GuestPsw`] when the initial PSW does not decode,
    /// [`NestError::AddressRange`] when the guest PSA or the state
    /// descriptor's parameter area would wrap the address space.
    pub fn new(host_state: &ProcessorState, entry: &GuestEntry) -> Result<Self, NestError> {
        let arch = host_state.arch();
        let psa_end = entry
            .origin
            .checked_add(entry.prefix)
            .and_then(|base| base.checked_add(arch.psa_size()));
        if psa_end.is_none() {
            return Err(NestError::AddressRange(entry.origin));
        }
        let sd_end = entry
            .host
            .state_descriptor
            .checked_add(SIE_IP_PSA_OFFSET + arch.psa_size());
        if sd_end.is_none() {
            return Err(NestError::AddressRange(entry.host.state_descriptor));
        }
        let facilities = host_state.facilities() - Facilities::INTERPRETIVE_EXECUTION;
        let mut state = ProcessorState::new(host_state.cpu(), arch, facilities);
        state.set_origin(entry.origin);
        state.set_prefix(entry.prefix);
        state.load_psw(&entry.psw[..arch.psw_len()])?;
        state.set_mode(ExecMode::Guest);
        debug!(
            "cpu {}: entering guest at {:#x}, sd {:#x}",
            host_state.cpu(),
            state.psw().ia,
            entry.host.state_descriptor
        );
        Ok(Self {
            state,
            host: entry.host,
        })
    }

    /// Current guest PSW.
    #[must_use]
    pub const fn psw(&self) -> &Psw {
        self.state.psw()
    }
}

impl Processor {
    /// Starts interpretive execution of the guest described by `entry`.
    ///
    /// # Errors
    ///
    /// [`NestError::AlreadyNested`] while a guest is active,
    /// [`NestError::Unavailable`] without the interpretive-execution facility,
    /// [`NestError::GuestPsw`] for an invalid initial guest PSW,
    /// [`NestError::AddressRange`] for guest storage that wraps the address space.
    pub fn enter_guest(&mut self, entry: &GuestEntry) -> Result<(), NestError> {
        if self.guest.is_some() {
            return Err(NestError::AlreadyNested);
        }
        if self.state.mode() == ExecMode::Guest
            || !self
                .state
                .facilities()
                .contains(Facilities::INTERPRETIVE_EXECUTION)
        {
            return Err(NestError::Unavailable);
        }
        let guest = GuestState::new(&self.state, entry)?;
        self.state.set_mode(ExecMode::Host);
        self.guest = Some(Box::new(guest));
        Ok(())
    }

    /// Ends interpretive execution and returns the final guest record.
    ///
    /// # Errors
    ///
    /// [`NestError::NotNested`] when no guest is active.
    pub fn exit_guest(&mut self) -> Result<ProcessorState, NestError> {
        let guest = self.guest.take().ok_or(NestError::NotNested)?;
        self.state.set_mode(ExecMode::Native);
        debug!(
            "cpu {}: guest exited at {:#x}",
            self.cpu(),
            guest.state.psw().ia
        );
        Ok(guest.state)
    }
}
