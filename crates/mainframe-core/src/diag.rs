//! Per-processor diagnostic counters.

use crate::InterruptKind;

/// Saturating counters kept by each processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DiagCounters {
    /// Instructions dispatched to a handler.
    pub instructions: u64,
    /// Interruptions delivered, indexed by [`InterruptKind::index`].
    pub interrupts: [u64; 6],
    /// Guest events handed to the host.
    pub intercepts: u64,
    /// Program-interrupt loops detected.
    pub program_loops: u64,
    /// Last program interruption code delivered or intercepted.
    pub last_program_code: Option<u16>,
    /// Instruction address in the old PSW of that interruption.
    pub last_program_address: u64,
}

impl DiagCounters {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `count` dispatched instructions.
    pub const fn add_instructions(&mut self, count: u64) {
        self.instructions = self.instructions.saturating_add(count);
    }

    /// Records a delivered interruption.
    pub const fn record_interrupt(&mut self, kind: InterruptKind) {
        let slot = &mut self.interrupts[kind.index()];
        *slot = slot.saturating_add(1);
    }

    /// Records the code and address of a program interruption.
    pub const fn record_program(&mut self, code: u16, address: u64) {
        self.last_program_code = Some(code);
        self.last_program_address = address;
    }

    /// Records an interception.
    pub const fn record_intercept(&mut self) {
        self.intercepts = self.intercepts.saturating_add(1);
    }

    /// Records a program-interrupt loop.
    pub const fn record_program_loop(&mut self) {
        self.program_loops = self.program_loops.saturating_add(1);
    }

    /// Interruptions of `kind` delivered so far.
    #[must_use]
    pub const fn interrupts(&self, kind: InterruptKind) -> u64 {
        self.interrupts[kind.index()]
    }

    /// Resets every counter.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::DiagCounters;
    use crate::InterruptKind;

    #[test]
    fn interrupt_counters_are_per_class() {
        let mut diag = DiagCounters::new();
        diag.record_interrupt(InterruptKind::Program);
        diag.record_interrupt(InterruptKind::Program);
        diag.record_interrupt(InterruptKind::Io);
        assert_eq!(diag.interrupts(InterruptKind::Program), 2);
        assert_eq!(diag.interrupts(InterruptKind::Io), 1);
        assert_eq!(diag.interrupts(InterruptKind::External), 0);
    }

    #[test]
    fn counters_saturate() {
        let mut diag = DiagCounters {
            instructions: u64::MAX - 1,
            ..DiagCounters::default()
        };
        diag.add_instructions(10);
        assert_eq!(diag.instructions, u64::MAX);
    }

    #[test]
    fn reset_clears_last_program_fields() {
        let mut diag = DiagCounters::new();
        diag.record_program(0x11, 0x2000);
        diag.record_program_loop();
        diag.reset();
        assert_eq!(diag, DiagCounters::default());
    }
}
