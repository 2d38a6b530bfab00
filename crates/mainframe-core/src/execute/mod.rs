//! Instruction dispatch loop.
//!
//! Each processor fetches, decodes and dispatches instructions in batches,
//! checking for pending interruptions only at batch boundaries or when a
//! handler asks for it. Every abrupt exit from a handler is a [`Trap`] that
//! comes back to one place, [`Processor::route`], which releases held locks and
//! turns it into an interruption, an interception or a lifecycle transition.

mod control;
mod helpers;
pub mod table;
pub mod tx;

pub use table::{Handler, OpcodeEntry, OpcodeTable, OpcodeTables};
pub use tx::{AbortCause, TxAbort, TxState, MAX_NESTING_DEPTH};

use std::sync::Arc;

use log::{debug, error};

use crate::encoding::instruction_length;
use crate::interrupt::{CheckOutcome, Delivery};
use crate::lifecycle::StopPoint;
use crate::{
    AutoTrace, CpuId, DiagCounters, FaultSite, GuestState, Instruction, InterruptKind,
    InterruptPresenter, LifecycleEvent, NoPresenter, PerEvent, ProcessorState, ProgramCheck,
    ProgramCode, RunExit, RunState, StepOutcome, Storage, SystemContext, TraceEvent, TraceSink,
    Trap, MAX_INSTRUCTION_LEN, PER_INSTRUCTION_FETCH,
};

/// CR9 bit enabling instruction-fetching PER events.
pub(crate) const CR9_IFETCH: u64 = 0x4000_0000;
/// CR9 bit enabling successful-branching PER events.
pub(crate) const CR9_BRANCH: u64 = 0x8000_0000;

/// An instruction whose later halfwords would wrap the address space.
const FETCH_WRAP: ProgramCheck = ProgramCheck::new(ProgramCode::Addressing);

/// Which fetch path the next instruction takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lane {
    Ordinary,
    Constrained,
}

/// What the interrupt boundary decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Boundary {
    /// Fetch the next instruction.
    Continue,
    /// Report this outcome without executing.
    Outcome(StepOutcome),
    /// The processor was configured offline.
    Offline,
}

/// One processor of a complex.
///
/// A processor owns its architectural state and, while interpretively
/// executing, the guest record layered under it. Everything shared with other
/// processors goes through the [`SystemContext`].
pub struct Processor {
    pub(crate) state: ProcessorState,
    pub(crate) guest: Option<Box<GuestState>>,
    pub(crate) ctx: Arc<SystemContext>,
    pub(crate) storage: Arc<dyn Storage>,
    pub(crate) presenter: Arc<dyn InterruptPresenter>,
    pub(crate) tables: Arc<OpcodeTables>,
    pub(crate) sink: Option<Box<dyn TraceSink>>,
    pub(crate) diag: DiagCounters,
    pub(crate) executed: u64,
    pub(crate) last_state: RunState,
    batch_size: u32,
    auto_trace: Option<AutoTrace>,
    pub(crate) tx_limit: u32,
}

impl std::fmt::Debug for Processor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Processor")
            .field("cpu", &self.state.cpu())
            .field("state", &self.state)
            .field("guest", &self.guest)
            .field("executed", &self.executed)
            .field("last_state", &self.last_state)
            .finish_non_exhaustive()
    }
}

impl Processor {
    /// Creates processor `cpu` of the complex described by `ctx`.
    #[must_use]
    pub fn new(cpu: CpuId, ctx: Arc<SystemContext>, storage: Arc<dyn Storage>) -> Self {
        let config = *ctx.config();
        Self {
            state: ProcessorState::new(cpu, config.arch, config.facilities),
            guest: None,
            ctx,
            storage,
            presenter: Arc::new(NoPresenter),
            tables: Arc::new(OpcodeTables::with_builtins()),
            sink: None,
            diag: DiagCounters::new(),
            executed: 0,
            last_state: RunState::Stopped,
            batch_size: config.effective_batch_size(),
            auto_trace: config.auto_trace,
            tx_limit: config.tx_instruction_limit,
        }
    }

    /// Uses `presenter` for I/O and machine-check interruptions.
    #[must_use]
    pub fn with_presenter(mut self, presenter: Arc<dyn InterruptPresenter>) -> Self {
        self.presenter = presenter;
        self
    }

    /// Dispatches through `tables` instead of the built-ins.
    #[must_use]
    pub fn with_tables(mut self, tables: Arc<OpcodeTables>) -> Self {
        self.tables = tables;
        self
    }

    /// Sends trace events to `sink`.
    #[must_use]
    pub fn with_trace_sink(mut self, sink: Box<dyn TraceSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Processor address.
    #[must_use]
    pub const fn cpu(&self) -> CpuId {
        self.state.cpu()
    }

    /// The record currently executing: the guest while one is active.
    #[must_use]
    pub fn state(&self) -> &ProcessorState {
        self.guest.as_deref().map_or(&self.state, |guest| &guest.state)
    }

    /// Mutable access to the record currently executing.
    pub fn state_mut(&mut self) -> &mut ProcessorState {
        match self.guest.as_deref_mut() {
            Some(guest) => &mut guest.state,
            None => &mut self.state,
        }
    }

    /// The host (or native) record, regardless of any active guest.
    #[must_use]
    pub const fn host_state(&self) -> &ProcessorState {
        &self.state
    }

    /// Active guest, if any.
    #[must_use]
    pub fn guest(&self) -> Option<&GuestState> {
        self.guest.as_deref()
    }

    /// Diagnostic counters.
    #[must_use]
    pub const fn diag(&self) -> &DiagCounters {
        &self.diag
    }

    /// Instructions this processor has dispatched.
    #[must_use]
    pub const fn executed(&self) -> u64 {
        self.executed
    }

    /// Shared context.
    #[must_use]
    pub const fn context(&self) -> &Arc<SystemContext> {
        &self.ctx
    }

    /// Lifecycle state as of this processor's last look under the interrupt lock.
    #[must_use]
    pub const fn last_run_state(&self) -> RunState {
        self.last_state
    }

    /// Runs at most one instruction, after checking for pending interruptions.
    ///
    /// Never blocks: a stopped or waiting processor reports so and returns.
    pub fn step(&mut self) -> StepOutcome {
        match self.boundary(false) {
            Boundary::Continue => {}
            Boundary::Outcome(outcome) => return outcome,
            Boundary::Offline => return StepOutcome::NotStarted(RunState::Stopped),
        }
        let ordinal = self.executed;
        match self.execute_one(self.lane(), ordinal) {
            Ok(()) => {
                self.count(1);
                StepOutcome::Executed
            }
            Err((trap, site)) => {
                if matches!(site, FaultSite::Execute { .. }) {
                    self.count(1);
                }
                self.route(trap, site)
            }
        }
    }

    /// Runs until the processor is configured offline or its guest must exit.
    ///
    /// Blocks while stopped or in an enabled wait.
    pub fn run(&mut self) -> RunExit {
        debug!("cpu {}: dispatch loop entered", self.cpu());
        loop {
            match self.boundary(true) {
                Boundary::Continue => {}
                Boundary::Outcome(StepOutcome::Intercepted(intercept)) => {
                    return RunExit::Intercepted(intercept)
                }
                Boundary::Outcome(_) => continue,
                Boundary::Offline => {
                    debug!("cpu {}: offline, leaving dispatch loop", self.cpu());
                    return RunExit::Offline;
                }
            }
            if let Some(StepOutcome::Intercepted(intercept)) = self.run_batch() {
                return RunExit::Intercepted(intercept);
            }
        }
    }

    /// Runs up to one batch; returns the outcome that ended it early, if any.
    fn run_batch(&mut self) -> Option<StepOutcome> {
        let lane = self.lane();
        let mut executed: u32 = 0;
        let mut exit = None;
        while executed < self.batch_size {
            let ordinal = self.executed + u64::from(executed);
            match self.execute_one(lane, ordinal) {
                Ok(()) => executed += 1,
                Err((trap, site)) => {
                    if matches!(site, FaultSite::Execute { .. }) {
                        executed += 1;
                    }
                    exit = Some(self.route(trap, site));
                    break;
                }
            }
        }
        self.count(u64::from(executed));
        exit
    }

    fn count(&mut self, instructions: u64) {
        self.executed += instructions;
        self.diag.add_instructions(instructions);
        self.ctx.add_instructions(instructions);
    }

    fn lane(&self) -> Lane {
        match &self.state().tx {
            Some(tx) if tx.constrained => Lane::Constrained,
            _ => Lane::Ordinary,
        }
    }

    /// Decides whether the next instruction may run.
    pub(crate) fn boundary(&mut self, blocking: bool) -> Boundary {
        loop {
            let mut enabled = self.state().enabled_classes();
            if self.guest.is_some() {
                enabled |= self.state.enabled_classes();
            }
            let quiet = !self.ctx.attention(self.cpu()).intersects(enabled);
            if quiet && self.last_state == RunState::Started && !self.state().psw().wait {
                return Boundary::Continue;
            }
            match self.check_interrupts() {
                CheckOutcome::Proceed => {}
                CheckOutcome::Delivered(kind) => {
                    return Boundary::Outcome(StepOutcome::Interrupted(kind))
                }
                CheckOutcome::Intercepted(intercept) => {
                    return Boundary::Outcome(StepOutcome::Intercepted(intercept))
                }
                CheckOutcome::Stopping => {
                    return Boundary::Outcome(StepOutcome::NotStarted(RunState::Stopping))
                }
                CheckOutcome::NotStarted => match self.stop_point(blocking) {
                    StopPoint::Resume => continue,
                    StopPoint::Parked(state) => {
                        return Boundary::Outcome(StepOutcome::NotStarted(state))
                    }
                    StopPoint::Offline => return Boundary::Offline,
                },
            }
            if self.state().psw().wait {
                match self.wait_point(blocking) {
                    Boundary::Continue => continue,
                    other => return other,
                }
            }
            return Boundary::Continue;
        }
    }

    /// Fetches, decodes and dispatches one instruction.
    fn execute_one(&mut self, lane: Lane, ordinal: u64) -> Result<(), (Trap, FaultSite)> {
        let (insn, entry) = self.fetch()?;
        let site = FaultSite::Execute { ilc: insn.length() };
        if lane == Lane::Constrained {
            self.check_constrained(entry.constrained_ok)
                .map_err(|trap| (trap, site))?;
        }
        self.trace_instruction(&insn, ordinal);
        self.recognise_fetch_event(insn.address());
        self.state_mut().advance_ia(u64::from(insn.length()));
        (entry.handler)(self, &insn).map_err(|trap| (trap, site))?;
        if self.state().per_pending.is_some() {
            return Err((ProgramCode::PerEvent.into(), site));
        }
        Ok(())
    }

    fn fetch(&mut self) -> Result<(Instruction, OpcodeEntry), (Trap, FaultSite)> {
        let ia = self.state().psw().ia;
        if ia & 1 != 0 {
            return Err((ProgramCode::Specification.into(), FaultSite::Fetch { ilc: 2 }));
        }
        let absolute = self.state().real_to_absolute(ia);
        let mut buf = [0; MAX_INSTRUCTION_LEN];
        self.storage
            .fetch_instruction(absolute, &mut buf[..2])
            .map_err(|check| (Trap::from(check), FaultSite::Fetch { ilc: 2 }))?;
        let len = instruction_length(buf[0]);
        let site = FaultSite::Fetch { ilc: len };
        if len > 2 {
            let rest = absolute
                .checked_add(2)
                .ok_or((Trap::Program(FETCH_WRAP), site))?;
            self.storage
                .fetch_instruction(rest, &mut buf[2..usize::from(len)])
                .map_err(|check| (Trap::from(check), site))?;
        }
        let Some(insn) = Instruction::decode(ia, &buf[..usize::from(len)]) else {
            return Err((ProgramCode::Operation.into(), site));
        };
        let arch = self.state().arch();
        let Some(entry) = self.tables.lookup(arch, &insn).copied() else {
            return Err((ProgramCode::Operation.into(), site));
        };
        Ok((insn, entry))
    }

    fn recognise_fetch_event(&mut self, address: u64) {
        let state = self.state_mut();
        if state.psw().per_enabled() && state.regs().cr(9) & CR9_IFETCH != 0 {
            let code = state.per_pending.map_or(0, |per| per.code);
            state.per_pending = Some(PerEvent {
                code: code | PER_INSTRUCTION_FETCH,
                address,
            });
        }
    }

    /// Turns a trap into whatever the architecture requires next.
    pub(crate) fn route(&mut self, trap: Trap, site: FaultSite) -> StepOutcome {
        match trap {
            Trap::Program(check) => {
                let delivery = self.program_interrupt(check, site);
                self.settle(delivery, InterruptKind::Program)
            }
            Trap::SupervisorCall(number) => {
                if let Some(abort) = self.abort_transaction(AbortCause::Restricted) {
                    abort.apply(self.state_mut().psw_mut());
                    return StepOutcome::Executed;
                }
                let ilc = match site {
                    FaultSite::Fetch { ilc } | FaultSite::Execute { ilc } => ilc,
                    FaultSite::NoInstruction => 0,
                };
                let delivery = self.svc_interrupt(number, ilc);
                self.settle(delivery, InterruptKind::SupervisorCall)
            }
            Trap::Recheck | Trap::LaneSwitch | Trap::ModeSwitch => StepOutcome::Executed,
            Trap::Lock(err) => {
                error!("cpu {}: {err}", self.cpu());
                self.ctx.release_locks_held_by(self.cpu());
                self.transition_now(LifecycleEvent::Fatal);
                StepOutcome::NotStarted(RunState::Stopping)
            }
        }
    }

    pub(crate) fn settle(&mut self, delivery: Delivery, kind: InterruptKind) -> StepOutcome {
        match delivery {
            Delivery::Delivered => StepOutcome::Interrupted(kind),
            Delivery::Intercepted(intercept) => StepOutcome::Intercepted(intercept),
            Delivery::Loop => {
                self.transition_now(LifecycleEvent::Fatal);
                StepOutcome::NotStarted(RunState::Stopping)
            }
        }
    }

    fn trace_instruction(&mut self, insn: &Instruction, ordinal: u64) {
        let Some(window) = self.auto_trace else {
            return;
        };
        let cpu = self.cpu();
        if ordinal == window.start {
            self.trace(TraceEvent::AutoTraceStart {
                cpu,
                executed: ordinal,
            });
        }
        if window.covers(ordinal) {
            self.trace(TraceEvent::Instruction {
                cpu,
                address: insn.address(),
                key: insn.key(),
            });
        }
        if ordinal == window.start.saturating_add(window.count) {
            self.trace(TraceEvent::AutoTraceStop {
                cpu,
                executed: ordinal,
            });
        }
    }

    /// Hands `event` to the trace sink; sink failures are logged and dropped.
    pub(crate) fn trace(&mut self, event: TraceEvent) {
        let cpu = self.cpu();
        if let Some(sink) = self.sink.as_mut() {
            if let Err(err) = sink.on_event(&event) {
                debug!("cpu {cpu}: {err}");
            }
        }
    }

    /// Raises a program check outside any instruction (new-PSW validation).
    pub(crate) fn program_check_now(&mut self, check: ProgramCheck) -> Delivery {
        self.program_interrupt(check, FaultSite::NoInstruction)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::{OpcodeEntry, OpcodeTables, Processor};
    use crate::{
        psw, AddressingMode, Architecture, AutoTrace, CpuConfig, FaultSite, FlatStorage,
        InterruptKind, ProgramCheck, ProgramCode, Psw, PswFormat, RunState, StepOutcome, Storage,
        SystemContext, TraceError, TraceEvent, TraceSink, Trap,
    };

    const HANDLER: u64 = 0x8000;

    struct Recorder(Arc<Mutex<Vec<TraceEvent>>>);

    impl TraceSink for Recorder {
        fn on_event(&mut self, event: &TraceEvent) -> Result<(), TraceError> {
            self.0.lock().unwrap().push(*event);
            Ok(())
        }
    }

    struct Broken;

    impl TraceSink for Broken {
        fn on_event(&mut self, _event: &TraceEvent) -> Result<(), TraceError> {
            Err(TraceError("disk full".into()))
        }
    }

    fn z_psw(ia: u64) -> Psw {
        Psw {
            format: PswFormat::ExtendedControl,
            amode: AddressingMode::Bits64,
            ia,
            ..Psw::default()
        }
    }

    fn started(config: CpuConfig) -> (Processor, Arc<FlatStorage>) {
        let ctx = Arc::new(SystemContext::new(config));
        let storage = Arc::new(FlatStorage::new(0x10_0000));
        let new = psw::encode(Architecture::ZArch, &z_psw(HANDLER));
        let slot = Architecture::ZArch.psa().new_psw(InterruptKind::Program);
        storage.load(slot, new.as_bytes()).unwrap();
        ctx.start(0).unwrap();
        let mut cpu = Processor::new(0, Arc::clone(&ctx), storage.clone());
        cpu.state_mut().set_psw(z_psw(0x1000));
        (cpu, storage)
    }

    fn nop_tables() -> Arc<OpcodeTables> {
        fn nop(_: &mut Processor, _: &crate::Instruction) -> Result<(), Trap> {
            Ok(())
        }
        let mut tables = OpcodeTables::with_builtins();
        tables.register(Architecture::ZArch, 0x18, None, OpcodeEntry::new("LR", nop));
        Arc::new(tables)
    }

    #[test]
    fn unregistered_opcode_raises_operation_exception() {
        let (mut cpu, storage) = started(CpuConfig::default());
        storage.load(0x1000, &[0x00, 0x00]).unwrap();
        assert_eq!(
            cpu.step(),
            StepOutcome::Interrupted(InterruptKind::Program)
        );
        assert_eq!(cpu.state().psw().ia, HANDLER);
        assert_eq!(
            cpu.diag().last_program_code,
            Some(ProgramCode::Operation.as_u16())
        );
        assert_eq!(cpu.executed(), 0);
    }

    #[test]
    fn executed_instructions_are_counted_per_processor_and_system() {
        let (cpu, storage) = started(CpuConfig::default());
        let mut cpu = cpu.with_tables(nop_tables());
        storage.load(0x1000, &[0x18, 0x12, 0x18, 0x12]).unwrap();
        assert_eq!(cpu.step(), StepOutcome::Executed);
        assert_eq!(cpu.step(), StepOutcome::Executed);
        assert_eq!(cpu.executed(), 2);
        assert_eq!(cpu.diag().instructions, 2);
        assert_eq!(cpu.context().instructions(), 2);
        assert_eq!(cpu.state().psw().ia, 0x1004);
    }

    #[test]
    fn not_started_processor_does_not_execute() {
        let ctx = Arc::new(SystemContext::new(CpuConfig::default()));
        let storage = Arc::new(FlatStorage::new(0x1_0000));
        let mut cpu = Processor::new(0, ctx, storage);
        assert_eq!(cpu.step(), StepOutcome::NotStarted(RunState::Stopped));
        assert_eq!(cpu.executed(), 0);
    }

    #[test]
    fn auto_trace_window_brackets_instruction_events() {
        let config = CpuConfig {
            auto_trace: Some(AutoTrace { start: 1, count: 2 }),
            ..CpuConfig::default()
        };
        let events = Arc::new(Mutex::new(Vec::new()));
        let (cpu, storage) = started(config);
        let mut cpu = cpu
            .with_tables(nop_tables())
            .with_trace_sink(Box::new(Recorder(Arc::clone(&events))));
        storage.load(0x1000, &[0x18, 0x12].repeat(5)).unwrap();
        for _ in 0..5 {
            assert_eq!(cpu.step(), StepOutcome::Executed);
        }
        let events = events.lock().unwrap();
        let kinds: Vec<_> = events
            .iter()
            .filter_map(|event| match event {
                TraceEvent::AutoTraceStart { executed, .. } => Some(("start", *executed)),
                TraceEvent::Instruction { address, .. } => Some(("insn", *address)),
                TraceEvent::AutoTraceStop { executed, .. } => Some(("stop", *executed)),
                _ => None,
            })
            .collect();
        assert_eq!(
            kinds,
            vec![("start", 1), ("insn", 0x1002), ("insn", 0x1004), ("stop", 3)]
        );
    }

    #[test]
    fn failing_trace_sink_does_not_stop_execution() {
        let config = CpuConfig {
            auto_trace: Some(AutoTrace { start: 0, count: 10 }),
            ..CpuConfig::default()
        };
        let (cpu, storage) = started(config);
        let mut cpu = cpu
            .with_tables(nop_tables())
            .with_trace_sink(Box::new(Broken));
        storage.load(0x1000, &[0x18, 0x12]).unwrap();
        assert_eq!(cpu.step(), StepOutcome::Executed);
    }

    #[test]
    fn odd_instruction_address_is_a_specification_exception() {
        let (mut cpu, storage) = started(CpuConfig::default());
        cpu.state_mut().set_psw(z_psw(0x1001));
        assert_eq!(
            cpu.step(),
            StepOutcome::Interrupted(InterruptKind::Program)
        );
        assert_eq!(
            cpu.diag().last_program_code,
            Some(ProgramCode::Specification.as_u16())
        );
        let mut old = [0; 16];
        storage
            .read_absolute(Architecture::ZArch.psa().old_psw(InterruptKind::Program), &mut old)
            .unwrap();
        let mut ia = [0; 8];
        ia.copy_from_slice(&old[8..]);
        assert_eq!(u64::from_be_bytes(ia), 0x1003);
    }

    /// Storage that answers every read with the first byte of a 6-byte opcode.
    struct Unbounded;

    impl Storage for Unbounded {
        fn read_absolute(&self, _addr: u64, buf: &mut [u8]) -> Result<(), ProgramCheck> {
            buf.fill(0xC0);
            Ok(())
        }

        fn store_absolute(&self, _addr: u64, _data: &[u8]) -> Result<(), ProgramCheck> {
            Ok(())
        }
    }

    #[test]
    fn instruction_wrapping_the_address_space_is_an_addressing_exception() {
        let ctx = Arc::new(SystemContext::new(CpuConfig::default()));
        ctx.start(0).unwrap();
        let mut cpu = Processor::new(0, ctx, Arc::new(Unbounded));
        cpu.state_mut().set_psw(z_psw(u64::MAX - 1));

        let Err((trap, site)) = cpu.fetch() else {
            panic!("fetch across the top of storage succeeded");
        };
        assert_eq!(trap, Trap::Program(ProgramCheck::new(ProgramCode::Addressing)));
        assert_eq!(site, FaultSite::Fetch { ilc: 6 });
    }
}
