use thiserror::Error;

use crate::{LockError, SpecificationFault};

/// Program-interruption code flag merged in when a PER event is pending.
pub const PER_EVENT_FLAG: u16 = 0x0080;
/// Program-interruption code flag merged in when a transaction was aborted.
pub const TRANSACTION_FLAG: u16 = 0x0200;

/// Architected program-interruption codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[repr(u16)]
#[allow(missing_docs)]
pub enum ProgramCode {
    #[error("operation exception")]
    Operation = 0x01,
    #[error("privileged-operation exception")]
    PrivilegedOperation = 0x02,
    #[error("execute exception")]
    Execute = 0x03,
    #[error("protection exception")]
    Protection = 0x04,
    #[error("addressing exception")]
    Addressing = 0x05,
    #[error("specification exception")]
    Specification = 0x06,
    #[error("data exception")]
    Data = 0x07,
    #[error("fixed-point overflow")]
    FixedPointOverflow = 0x08,
    #[error("fixed-point divide")]
    FixedPointDivide = 0x09,
    #[error("decimal overflow")]
    DecimalOverflow = 0x0A,
    #[error("decimal divide")]
    DecimalDivide = 0x0B,
    #[error("HFP exponent overflow")]
    HfpExponentOverflow = 0x0C,
    #[error("HFP exponent underflow")]
    HfpExponentUnderflow = 0x0D,
    #[error("HFP significance")]
    HfpSignificance = 0x0E,
    #[error("HFP floating-point divide")]
    HfpDivide = 0x0F,
    #[error("segment-translation exception")]
    SegmentTranslation = 0x10,
    #[error("page-translation exception")]
    PageTranslation = 0x11,
    #[error("translation-specification exception")]
    TranslationSpecification = 0x12,
    #[error("special-operation exception")]
    SpecialOperation = 0x13,
    #[error("operand exception")]
    Operand = 0x15,
    #[error("trace-table exception")]
    TraceTable = 0x16,
    #[error("vector-operation exception")]
    VectorOperation = 0x19,
    #[error("vector-processing exception")]
    VectorProcessing = 0x1B,
    #[error("space-switch event")]
    SpaceSwitchEvent = 0x1C,
    #[error("HFP square-root exception")]
    HfpSquareRoot = 0x1D,
    #[error("PC-translation specification exception")]
    PcTranslationSpecification = 0x1F,
    #[error("AFX-translation exception")]
    AfxTranslation = 0x20,
    #[error("ASX-translation exception")]
    AsxTranslation = 0x21,
    #[error("LX-translation exception")]
    LxTranslation = 0x22,
    #[error("EX-translation exception")]
    ExTranslation = 0x23,
    #[error("primary-authority exception")]
    PrimaryAuthority = 0x24,
    #[error("secondary-authority exception")]
    SecondaryAuthority = 0x25,
    #[error("LFX-translation exception")]
    LfxTranslation = 0x26,
    #[error("LSX-translation exception")]
    LsxTranslation = 0x27,
    #[error("ALET-specification exception")]
    AletSpecification = 0x28,
    #[error("ALEN-translation exception")]
    AlenTranslation = 0x29,
    #[error("ALE-sequence exception")]
    AleSequence = 0x2A,
    #[error("ASTE-validity exception")]
    AsteValidity = 0x2B,
    #[error("ASTE-sequence exception")]
    AsteSequence = 0x2C,
    #[error("extended-authority exception")]
    ExtendedAuthority = 0x2D,
    #[error("LSTE-sequence exception")]
    LsteSequence = 0x2E,
    #[error("ASTE-instance exception")]
    AsteInstance = 0x2F,
    #[error("stack-full exception")]
    StackFull = 0x30,
    #[error("stack-empty exception")]
    StackEmpty = 0x31,
    #[error("stack-specification exception")]
    StackSpecification = 0x32,
    #[error("stack-type exception")]
    StackType = 0x33,
    #[error("stack-operation exception")]
    StackOperation = 0x34,
    #[error("ASCE-type exception")]
    AsceType = 0x38,
    #[error("region-first-translation exception")]
    RegionFirstTranslation = 0x39,
    #[error("region-second-translation exception")]
    RegionSecondTranslation = 0x3A,
    #[error("region-third-translation exception")]
    RegionThirdTranslation = 0x3B,
    #[error("monitor event")]
    MonitorEvent = 0x40,
    #[error("PER event")]
    PerEvent = 0x80,
    #[error("transaction-constraint exception")]
    TransactionConstraint = 0x218,
}

const PROGRAM_CODES: &[ProgramCode] = &[
    ProgramCode::Operation,
    ProgramCode::PrivilegedOperation,
    ProgramCode::Execute,
    ProgramCode::Protection,
    ProgramCode::Addressing,
    ProgramCode::Specification,
    ProgramCode::Data,
    ProgramCode::FixedPointOverflow,
    ProgramCode::FixedPointDivide,
    ProgramCode::DecimalOverflow,
    ProgramCode::DecimalDivide,
    ProgramCode::HfpExponentOverflow,
    ProgramCode::HfpExponentUnderflow,
    ProgramCode::HfpSignificance,
    ProgramCode::HfpDivide,
    ProgramCode::SegmentTranslation,
    ProgramCode::PageTranslation,
    ProgramCode::TranslationSpecification,
    ProgramCode::SpecialOperation,
    ProgramCode::Operand,
    ProgramCode::TraceTable,
    ProgramCode::VectorOperation,
    ProgramCode::VectorProcessing,
    ProgramCode::SpaceSwitchEvent,
    ProgramCode::HfpSquareRoot,
    ProgramCode::PcTranslationSpecification,
    ProgramCode::AfxTranslation,
    ProgramCode::AsxTranslation,
    ProgramCode::LxTranslation,
    ProgramCode::ExTranslation,
    ProgramCode::PrimaryAuthority,
    ProgramCode::SecondaryAuthority,
    ProgramCode::LfxTranslation,
    ProgramCode::LsxTranslation,
    ProgramCode::AletSpecification,
    ProgramCode::AlenTranslation,
    ProgramCode::AleSequence,
    ProgramCode::AsteValidity,
    ProgramCode::AsteSequence,
    ProgramCode::ExtendedAuthority,
    ProgramCode::LsteSequence,
    ProgramCode::AsteInstance,
    ProgramCode::StackFull,
    ProgramCode::StackEmpty,
    ProgramCode::StackSpecification,
    ProgramCode::StackType,
    ProgramCode::StackOperation,
    ProgramCode::AsceType,
    ProgramCode::RegionFirstTranslation,
    ProgramCode::RegionSecondTranslation,
    ProgramCode::RegionThirdTranslation,
    ProgramCode::MonitorEvent,
    ProgramCode::PerEvent,
    ProgramCode::TransactionConstraint,
];

impl ProgramCode {
    /// Every architected code, in ascending order.
    pub const ALL: &'static [Self] = PROGRAM_CODES;

    /// Converts to the value stored in the PSA program-interruption code field.
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    /// Converts a stored interruption code (flags stripped) back into a code.
    #[must_use]
    pub fn from_u16(code: u16) -> Option<Self> {
        PROGRAM_CODES.iter().copied().find(|c| c.as_u16() == code)
    }

    /// Faults after which the instruction is nullified and retried.
    ///
    /// Completing faults leave the instruction address at the next
    /// instruction; nullifying faults back it up by the instruction length
    /// unless they were recognised during instruction fetch.
    #[must_use]
    pub const fn is_nullifying(self) -> bool {
        matches!(
            self,
            Self::PageTranslation
                | Self::SegmentTranslation
                | Self::AsceType
                | Self::RegionFirstTranslation
                | Self::RegionSecondTranslation
                | Self::RegionThirdTranslation
                | Self::TraceTable
                | Self::AfxTranslation
                | Self::AsxTranslation
                | Self::LxTranslation
                | Self::LfxTranslation
                | Self::LsxTranslation
                | Self::LsteSequence
                | Self::ExTranslation
                | Self::PrimaryAuthority
                | Self::SecondaryAuthority
                | Self::AlenTranslation
                | Self::AleSequence
                | Self::AsteValidity
                | Self::AsteSequence
                | Self::AsteInstance
                | Self::ExtendedAuthority
                | Self::StackFull
                | Self::StackEmpty
                | Self::StackSpecification
                | Self::StackType
                | Self::StackOperation
                | Self::VectorOperation
        )
    }

    /// Faults whose translation-exception identification is stored.
    #[must_use]
    pub const fn stores_translation_id(self) -> bool {
        matches!(
            self,
            Self::PageTranslation
                | Self::SegmentTranslation
                | Self::AsceType
                | Self::RegionFirstTranslation
                | Self::RegionSecondTranslation
                | Self::RegionThirdTranslation
                | Self::Protection
                | Self::AfxTranslation
                | Self::AsxTranslation
                | Self::LxTranslation
                | Self::LfxTranslation
                | Self::LsxTranslation
                | Self::ExTranslation
                | Self::SpaceSwitchEvent
        )
    }
}

/// Monitor-call class and code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MonitorEvent {
    /// Monitor class number.
    pub class: u16,
    /// Monitor code.
    pub code: u64,
}

/// Interruption-class specific fields stored alongside a program check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CheckDetail {
    /// Translation-exception identification.
    pub translation_exception_id: Option<u64>,
    /// Data-exception code.
    pub data_exception_code: Option<u8>,
    /// Monitor event.
    pub monitor: Option<MonitorEvent>,
    /// Exception access identification.
    pub exception_access_id: Option<u8>,
}

/// A program check raised by an instruction handler or by the storage subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[error("program check: {code}")]
pub struct ProgramCheck {
    /// Interruption code.
    pub code: ProgramCode,
    /// Class-specific diagnostic fields.
    pub detail: CheckDetail,
}

impl ProgramCheck {
    /// Creates a check with no diagnostic fields.
    #[must_use]
    pub const fn new(code: ProgramCode) -> Self {
        Self {
            code,
            detail: CheckDetail {
                translation_exception_id: None,
                data_exception_code: None,
                monitor: None,
                exception_access_id: None,
            },
        }
    }

    /// Attaches a translation-exception identification.
    #[must_use]
    pub const fn with_translation_id(mut self, teid: u64) -> Self {
        self.detail.translation_exception_id = Some(teid);
        self
    }

    /// Attaches a data-exception code.
    #[must_use]
    pub const fn with_data_exception_code(mut self, dxc: u8) -> Self {
        self.detail.data_exception_code = Some(dxc);
        self
    }

    /// Attaches a monitor class and code.
    #[must_use]
    pub const fn with_monitor(mut self, class: u16, code: u64) -> Self {
        self.detail.monitor = Some(MonitorEvent { class, code });
        self
    }

    /// Attaches an exception access identification.
    #[must_use]
    pub const fn with_access_id(mut self, id: u8) -> Self {
        self.detail.exception_access_id = Some(id);
        self
    }
}

impl From<ProgramCode> for ProgramCheck {
    fn from(code: ProgramCode) -> Self {
        Self::new(code)
    }
}

impl From<SpecificationFault> for ProgramCheck {
    fn from(_: SpecificationFault) -> Self {
        Self::new(ProgramCode::Specification)
    }
}

/// Where in the instruction cycle a program check was recognised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultSite {
    /// During fetch or decode, before the instruction address was advanced.
    Fetch {
        /// Length known so far: 2 until the first halfword has been fetched.
        ilc: u8,
    },
    /// During execution; the instruction address already points past it.
    Execute {
        /// Length of the executing instruction.
        ilc: u8,
    },
    /// Outside any instruction, e.g. while delivering a restart.
    NoInstruction,
}

/// Abrupt exit from an instruction back to the dispatch boundary.
///
/// Handlers return this as the error half of their result; the dispatch loop
/// catches it at one place and routes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Trap {
    /// The instruction raised a program check.
    #[error(transparent)]
    Program(#[from] ProgramCheck),
    /// `SVC` with the given interruption code.
    #[error("supervisor call {0}")]
    SupervisorCall(u8),
    /// The instruction changed interrupt masks; check before the next fetch.
    #[error("interrupt masks changed")]
    Recheck,
    /// A transaction started or ended; re-enter fetch in the other lane.
    #[error("transactional lane switch")]
    LaneSwitch,
    /// The architecture generation changed; reload the opcode table.
    #[error("architecture mode switch")]
    ModeSwitch,
    /// A handler broke the lock discipline.
    #[error(transparent)]
    Lock(#[from] LockError),
}

impl From<ProgramCode> for Trap {
    fn from(code: ProgramCode) -> Self {
        Self::Program(ProgramCheck::new(code))
    }
}

impl From<SpecificationFault> for Trap {
    fn from(fault: SpecificationFault) -> Self {
        Self::Program(fault.into())
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::{ProgramCheck, ProgramCode, Trap, PER_EVENT_FLAG, TRANSACTION_FLAG};
    use crate::SpecificationFault;

    #[test]
    fn stable_code_roundtrip_is_bijective_for_defined_values() {
        for code in ProgramCode::ALL {
            assert_eq!(ProgramCode::from_u16(code.as_u16()), Some(*code));
        }
    }

    #[test]
    fn unknown_code_is_rejected() {
        assert!(ProgramCode::from_u16(0x0000).is_none());
        assert!(ProgramCode::from_u16(0x0014).is_none());
        assert!(ProgramCode::from_u16(0xFFFF).is_none());
    }

    #[test]
    fn flags_do_not_collide_with_base_codes() {
        for code in ProgramCode::ALL {
            if *code == ProgramCode::PerEvent || *code == ProgramCode::TransactionConstraint {
                continue;
            }
            assert_eq!(code.as_u16() & (PER_EVENT_FLAG | TRANSACTION_FLAG), 0);
        }
    }

    #[rstest]
    #[case(ProgramCode::PageTranslation, true)]
    #[case(ProgramCode::SegmentTranslation, true)]
    #[case(ProgramCode::RegionThirdTranslation, true)]
    #[case(ProgramCode::StackEmpty, true)]
    #[case(ProgramCode::TraceTable, true)]
    #[case(ProgramCode::Addressing, false)]
    #[case(ProgramCode::Specification, false)]
    #[case(ProgramCode::Protection, false)]
    #[case(ProgramCode::Operation, false)]
    #[case(ProgramCode::FixedPointOverflow, false)]
    fn nullification_table_matches_architecture(#[case] code: ProgramCode, #[case] nullifies: bool) {
        assert_eq!(code.is_nullifying(), nullifies);
    }

    #[test]
    fn specification_fault_becomes_specification_check() {
        let trap: Trap = SpecificationFault::ControlFormat.into();
        assert_eq!(
            trap,
            Trap::Program(ProgramCheck::new(ProgramCode::Specification))
        );
    }

    #[test]
    fn detail_builders_accumulate() {
        let check = ProgramCheck::new(ProgramCode::PageTranslation)
            .with_translation_id(0x1234_5000)
            .with_access_id(3);
        assert_eq!(check.detail.translation_exception_id, Some(0x1234_5000));
        assert_eq!(check.detail.exception_access_id, Some(3));
        assert!(check.detail.monitor.is_none());
    }
}
