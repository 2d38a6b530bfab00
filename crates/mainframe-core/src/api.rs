use thiserror::Error;

use crate::{
    Architecture, Facilities, Intercept, InterceptReason, InterruptKind, OpcodeKey, ProgramCheck,
    RunState,
};

/// Processor address within a configuration.
pub type CpuId = u16;

/// Smallest dispatch batch between interrupt checks.
pub const MIN_BATCH_SIZE: u32 = 16;
/// Largest dispatch batch between interrupt checks.
pub const MAX_BATCH_SIZE: u32 = 32;
/// Default instruction limit inside a constrained transaction.
pub const DEFAULT_TX_INSTRUCTION_LIMIT: u32 = 32;

/// Window of instruction counts inside which every instruction is traced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct AutoTrace {
    /// Per-processor instruction count at which tracing starts.
    pub start: u64,
    /// Number of instructions traced.
    pub count: u64,
}

impl AutoTrace {
    /// Returns `true` when `executed` lies inside the window.
    #[must_use]
    pub const fn covers(&self, executed: u64) -> bool {
        executed >= self.start && executed - self.start < self.count
    }
}

/// Top-level configuration for a processor complex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct CpuConfig {
    /// Architecture generation every processor starts in.
    pub arch: Architecture,
    /// Number of configured processors.
    pub num_cpus: u16,
    /// Installed facilities.
    pub facilities: Facilities,
    /// Instructions per dispatch batch; clamped to `16..=32`.
    pub batch_size: u32,
    /// Automatic instruction-trace window.
    pub auto_trace: Option<AutoTrace>,
    /// Maximum instructions inside a constrained transaction.
    pub tx_instruction_limit: u32,
}

impl Default for CpuConfig {
    fn default() -> Self {
        let arch = Architecture::default();
        Self {
            arch,
            num_cpus: 1,
            facilities: arch.default_facilities(),
            batch_size: MAX_BATCH_SIZE,
            auto_trace: None,
            tx_instruction_limit: DEFAULT_TX_INSTRUCTION_LIMIT,
        }
    }
}

impl CpuConfig {
    /// Batch size after clamping to the supported range.
    #[must_use]
    pub const fn effective_batch_size(&self) -> u32 {
        if self.batch_size < MIN_BATCH_SIZE {
            MIN_BATCH_SIZE
        } else if self.batch_size > MAX_BATCH_SIZE {
            MAX_BATCH_SIZE
        } else {
            self.batch_size
        }
    }
}

/// Absolute-storage contract consumed by the core.
///
/// Address translation, key protection and atomic primitives belong to the
/// implementor; the core only touches absolute addresses for PSA traffic and
/// hands instruction fetches over with the address already prefixed.
pub trait Storage: Send + Sync {
    /// Reads `buf.len()` bytes at absolute address `addr`.
    ///
    /// # Errors
    ///
    /// Returns the program check the access raises, typically addressing.
    fn read_absolute(&self, addr: u64, buf: &mut [u8]) -> Result<(), ProgramCheck>;

    /// Stores `data` at absolute address `addr`.
    ///
    /// # Errors
    ///
    /// Returns the program check the access raises, typically addressing.
    fn store_absolute(&self, addr: u64, data: &[u8]) -> Result<(), ProgramCheck>;

    /// Fetches instruction bytes at absolute address `addr`.
    ///
    /// # Errors
    ///
    /// Returns the program check the fetch raises.
    fn fetch_instruction(&self, addr: u64, buf: &mut [u8]) -> Result<(), ProgramCheck> {
        self.read_absolute(addr, buf)
    }
}

/// Parameters of a presented I/O interruption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct IoInterrupt {
    /// Subsystem-identification word.
    pub subsystem_id: u32,
    /// Interruption parameter.
    pub parameter: u32,
    /// Interruption-identification word (z/Architecture).
    pub identification: u32,
    /// Device address (S/370).
    pub device_address: u16,
    /// Channel status word (S/370).
    pub csw: [u8; 8],
}

/// Parameters of a presented machine check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MachineCheck {
    /// Machine-check interruption code.
    pub code: u64,
    /// External damage code.
    pub external_damage: u32,
    /// Failing storage address.
    pub failing_address: u64,
}

/// I/O and machine-check presentation contract.
///
/// Both calls may be made when nothing is pending and then return `None`.
pub trait InterruptPresenter: Send + Sync {
    /// Dequeues an I/O interruption enabled by `subclass_mask` for `cpu`.
    fn present_io(&self, cpu: CpuId, subclass_mask: u8) -> Option<IoInterrupt>;

    /// Dequeues a machine-check condition for `cpu`.
    fn present_machine_check(&self, cpu: CpuId) -> Option<MachineCheck>;
}

/// Presenter for configurations without a channel or machine-check subsystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPresenter;

impl InterruptPresenter for NoPresenter {
    fn present_io(&self, _cpu: CpuId, _subclass_mask: u8) -> Option<IoInterrupt> {
        None
    }

    fn present_machine_check(&self, _cpu: CpuId) -> Option<MachineCheck> {
        None
    }
}

/// Deterministic trace events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceEvent {
    /// An instruction inside the automatic-trace window is about to execute.
    Instruction {
        /// Processor address.
        cpu: CpuId,
        /// Instruction address.
        address: u64,
        /// Dispatch key.
        key: OpcodeKey,
    },
    /// The automatic-trace window opened.
    AutoTraceStart {
        /// Processor address.
        cpu: CpuId,
        /// Instruction count at the boundary.
        executed: u64,
    },
    /// The automatic-trace window closed.
    AutoTraceStop {
        /// Processor address.
        cpu: CpuId,
        /// Instruction count at the boundary.
        executed: u64,
    },
    /// An interruption was delivered through the PSA.
    Interrupt {
        /// Processor address.
        cpu: CpuId,
        /// Interruption class.
        kind: InterruptKind,
        /// Interruption code as stored.
        code: u16,
        /// Instruction address in the stored old PSW.
        old_address: u64,
    },
    /// A guest event was handed to the host.
    Intercept {
        /// Processor address.
        cpu: CpuId,
        /// Why the guest exited.
        reason: InterceptReason,
    },
    /// Lifecycle transition.
    Lifecycle {
        /// Processor address.
        cpu: CpuId,
        /// Previous state.
        from: RunState,
        /// New state.
        to: RunState,
    },
    /// A program new PSW was invalid; delivery abandoned.
    ProgramInterruptLoop {
        /// Processor address.
        cpu: CpuId,
        /// Interruption code being delivered.
        code: u16,
    },
}

/// Failure reported by a trace sink. Never fatal to the processor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("trace sink failed: {0}")]
pub struct TraceError(pub String);

/// Sink for deterministic trace events.
pub trait TraceSink: Send {
    /// Records an event in execution order.
    ///
    /// # Errors
    ///
    /// Returns [`TraceError`] when the event could not be recorded; the
    /// processor logs and continues.
    fn on_event(&mut self, event: &TraceEvent) -> Result<(), TraceError>;
}

/// Result of one [`crate::Processor::step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// One instruction was dispatched.
    Executed,
    /// An interruption was delivered; execution continues at the new PSW.
    Interrupted(InterruptKind),
    /// The guest must exit to its host; the guest PSW is untouched.
    Intercepted(Intercept),
    /// The PSW wait bit is on and no enabled interruption is pending.
    Waiting,
    /// The processor is not started.
    NotStarted(RunState),
}

/// Why [`crate::Processor::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    /// The processor was configured offline.
    Offline,
    /// The running guest must exit to its host.
    Intercepted(Intercept),
}
