//! Interrupt state machine: pending classes, PSA field writers, and the
//! program, supervisor-call, external, I/O, machine-check and restart
//! delivery paths.

use bitflags::bitflags;

/// Interrupt-check and asynchronous delivery.
pub(crate) mod asynchronous;
/// Big-endian writers for PSA diagnostic fields.
pub mod fields;
/// Program and supervisor-call interruption delivery.
pub(crate) mod program;

pub(crate) use asynchronous::CheckOutcome;
pub(crate) use program::Delivery;

bitflags! {
    /// Interrupt classes that can be pending for a processor or the system.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
    pub struct IntClass: u32 {
        /// Restart requested.
        const RESTART = 1 << 0;
        /// Stop requested.
        const STOP = 1 << 1;
        /// CPU reset pending.
        const RESET = 1 << 2;
        /// Machine-check condition pending (system wide).
        const MACHINE_CHECK = 1 << 3;
        /// At least one external condition pending.
        const EXTERNAL = 1 << 4;
        /// I/O interruption pending (system wide).
        const IO = 1 << 5;
    }
}

bitflags! {
    /// External-interruption conditions, highest presentation priority first.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
    pub struct ExternalConditions: u32 {
        /// Operator interrupt key.
        const INTERRUPT_KEY = 1 << 0;
        /// Emergency signal from another processor.
        const EMERGENCY_SIGNAL = 1 << 1;
        /// External call from another processor.
        const EXTERNAL_CALL = 1 << 2;
        /// Clock comparator.
        const CLOCK_COMPARATOR = 1 << 3;
        /// CPU timer.
        const CPU_TIMER = 1 << 4;
        /// Service signal (system wide).
        const SERVICE_SIGNAL = 1 << 5;
    }
}

/// Condition, external interruption code, CR0 subclass-mask bit.
const EXTERNAL_TABLE: [(ExternalConditions, u16, u64); 6] = [
    (ExternalConditions::INTERRUPT_KEY, 0x0040, 0x0040),
    (ExternalConditions::EMERGENCY_SIGNAL, 0x1201, 0x4000),
    (ExternalConditions::EXTERNAL_CALL, 0x1202, 0x2000),
    (ExternalConditions::CLOCK_COMPARATOR, 0x1004, 0x0800),
    (ExternalConditions::CPU_TIMER, 0x1005, 0x0400),
    (ExternalConditions::SERVICE_SIGNAL, 0x2401, 0x0200),
];

impl ExternalConditions {
    /// External interruption code stored at the external-code field.
    ///
    /// Only meaningful for a single condition; combinations return 0.
    #[must_use]
    pub fn code(self) -> u16 {
        EXTERNAL_TABLE
            .iter()
            .find_map(|(cond, code, _)| (*cond == self).then_some(*code))
            .unwrap_or(0)
    }

    /// Control register 0 subclass-mask bit that enables this condition.
    #[must_use]
    pub fn subclass_mask(self) -> u64 {
        EXTERNAL_TABLE
            .iter()
            .find_map(|(cond, _, mask)| (*cond == self).then_some(*mask))
            .unwrap_or(0)
    }

    /// Highest-priority condition in `self` that CR0 enables.
    #[must_use]
    pub fn highest_enabled(self, cr0: u64) -> Option<Self> {
        EXTERNAL_TABLE
            .iter()
            .find(|(cond, _, mask)| self.contains(*cond) && cr0 & mask != 0)
            .map(|(cond, _, _)| *cond)
    }
}

#[cfg(test)]
mod tests {
    use super::ExternalConditions;

    #[test]
    fn priority_prefers_emergency_over_timer() {
        let pending = ExternalConditions::CPU_TIMER | ExternalConditions::EMERGENCY_SIGNAL;
        assert_eq!(
            pending.highest_enabled(0xFFFF),
            Some(ExternalConditions::EMERGENCY_SIGNAL)
        );
    }

    #[test]
    fn subclass_mask_gates_presentation() {
        let pending = ExternalConditions::CPU_TIMER | ExternalConditions::EMERGENCY_SIGNAL;
        assert_eq!(
            pending.highest_enabled(0x0400),
            Some(ExternalConditions::CPU_TIMER)
        );
        assert_eq!(pending.highest_enabled(0x0200), None);
    }

    #[test]
    fn codes_match_architecture() {
        assert_eq!(ExternalConditions::SERVICE_SIGNAL.code(), 0x2401);
        assert_eq!(ExternalConditions::EXTERNAL_CALL.code(), 0x1202);
        assert_eq!(
            (ExternalConditions::CPU_TIMER | ExternalConditions::INTERRUPT_KEY).code(),
            0
        );
    }
}
