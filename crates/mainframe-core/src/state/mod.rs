//! Per-processor architectural state: register files, the PSW-bearing state
//! record, and the lifecycle state machine.

/// Processor state record.
pub mod processor;
/// General, control and access register files.
pub mod registers;
/// Lifecycle states and their transition table.
pub mod run_state;

pub use processor::{
    ExecMode, PerEvent, ProcessorState, ResetKind, PER_INSTRUCTION_FETCH, PER_SUCCESSFUL_BRANCH,
};
pub use registers::{Register, RegisterFile, CR0_INITIAL, CR14_INITIAL, REGISTER_COUNT};
pub use run_state::{LifecycleEvent, RunState, TransitionError};
