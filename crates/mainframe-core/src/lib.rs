//! Execution and interrupt core for an S/370, ESA/390 and z/Architecture
//! processor complex.

/// Architecture generations, facilities and PSA layouts.
pub mod arch;
pub use arch::{Architecture, Facilities, FieldSpan, InterruptKind, PsaLayout};

/// PSW model and its per-generation codec.
pub mod psw;
pub use psw::{
    AddressSpaceControl, AddressingMode, Psw, PswFormat, PswImage, SpecificationFault,
    PSW_BC_CHANNEL_MASKS, PSW_MASK_DAT, PSW_MASK_EXTERNAL, PSW_MASK_IO, PSW_MASK_PER,
};

/// Program-interruption codes, program checks and handler traps.
pub mod fault;
pub use fault::{
    CheckDetail, FaultSite, MonitorEvent, ProgramCheck, ProgramCode, Trap, PER_EVENT_FLAG,
    TRANSACTION_FLAG,
};

/// Host-facing configuration, storage, presenter and trace contracts.
pub mod api;
pub use api::{
    AutoTrace, CpuConfig, CpuId, InterruptPresenter, IoInterrupt, MachineCheck, NoPresenter,
    RunExit, StepOutcome, Storage, TraceError, TraceEvent, TraceSink,
    DEFAULT_TX_INSTRUCTION_LIMIT, MAX_BATCH_SIZE, MIN_BATCH_SIZE,
};

/// Per-processor architectural state.
pub mod state;
pub use state::{
    ExecMode, LifecycleEvent, PerEvent, ProcessorState, Register, RegisterFile, ResetKind,
    RunState, TransitionError, CR0_INITIAL, CR14_INITIAL, PER_INSTRUCTION_FETCH,
    PER_SUCCESSFUL_BRANCH, REGISTER_COUNT,
};

/// Opcode extension locations and instruction lengths.
pub mod encoding;
pub use encoding::{ExtensionLocation, OpcodeKey};

/// Instruction decode.
pub mod decoder;
pub use decoder::{Instruction, MAX_INSTRUCTION_LEN};

/// Interrupt lock, storage-serialization lock and shared pending state.
pub mod sync;
pub use sync::{
    ContextError, CpuSlot, IntLockGuard, InterruptState, LockError, LockOwnership, SystemContext,
};

/// Pending interruption classes and delivery.
pub mod interrupt;
pub use interrupt::{ExternalConditions, IntClass};

/// Diagnostic counters.
pub mod diag;
pub use diag::DiagCounters;

/// Interpretive execution of guests.
pub mod sie;
pub use sie::{
    reflect_program_interrupt, DiagArea, GuestEntry, GuestState, HostConfig, HostFacilities,
    Intercept, InterceptControls, InterceptReason, NestError, Reflection, SIE_IP_PSA_OFFSET,
};

/// Dispatch loop and built-in instructions.
pub mod execute;
pub use execute::{
    AbortCause, Handler, OpcodeEntry, OpcodeTable, OpcodeTables, Processor, TxAbort, TxState,
};

mod lifecycle;

/// Flat absolute storage.
pub mod memory;
pub use memory::{validate_alignment, validate_range, FlatStorage, DOUBLEWORD};

/// Thread-per-processor complex.
pub mod machine;
pub use machine::{Machine, MachineError};

#[cfg(test)]
use proptest as _;
#[cfg(test)]
use rstest as _;
