//! Program and supervisor-call interruptions driven through the dispatch loop:
//! old-PSW adjustment, PSA diagnostic fields, lock discharge, PER and
//! transaction merging, and the program-interruption loop.

#![allow(
    clippy::pedantic,
    clippy::nursery,
    clippy::unwrap_used,
    clippy::missing_const_for_fn
)]

use std::sync::{Arc, Mutex};
use std::thread;

use bitflags as _;
use log as _;
use mainframe_core::{
    psw, AddressingMode, Architecture, CpuConfig, FieldSpan, FlatStorage, Instruction,
    InterruptKind, OpcodeEntry, OpcodeTables, Processor, ProgramCheck, ProgramCode, Psw,
    PswFormat, Register, RunState, StepOutcome, Storage, SystemContext, TraceError, TraceEvent,
    TraceSink, Trap, PSW_MASK_PER, TRANSACTION_FLAG,
};
use parking_lot as _;
use proptest as _;
use rstest::rstest;
#[cfg(feature = "serde")]
use serde as _;
use thiserror as _;

const Z: Architecture = Architecture::ZArch;
const CODE: u64 = 0x1000;
const HANDLER: u64 = 0x8000;

fn z_psw(ia: u64) -> Psw {
    Psw {
        format: PswFormat::ExtendedControl,
        amode: AddressingMode::Bits64,
        ia,
        ..Psw::default()
    }
}

fn install_new_psw(storage: &FlatStorage, kind: InterruptKind, psw: &Psw) {
    storage
        .load(Z.psa().new_psw(kind), psw::encode(Z, psw).as_bytes())
        .unwrap();
}

fn old_psw(storage: &dyn Storage, kind: InterruptKind) -> Psw {
    let mut image = [0; 16];
    storage
        .read_absolute(Z.psa().old_psw(kind), &mut image)
        .unwrap();
    psw::decode(Z, Z.default_facilities(), &image).unwrap()
}

fn field(storage: &dyn Storage, span: FieldSpan) -> u64 {
    let mut buf = vec![0; span.len];
    storage.read_absolute(span.offset, &mut buf).unwrap();
    buf.iter().fold(0, |acc, byte| (acc << 8) | u64::from(*byte))
}

fn page_fault(_: &mut Processor, _: &Instruction) -> Result<(), Trap> {
    Err(ProgramCode::PageTranslation.into())
}

fn overflow(_: &mut Processor, _: &Instruction) -> Result<(), Trap> {
    Err(ProgramCode::FixedPointOverflow.into())
}

fn tables() -> Arc<OpcodeTables> {
    let mut tables = OpcodeTables::with_builtins();
    tables.register(Z, 0x18, None, OpcodeEntry::new("LR", page_fault));
    tables.register(Z, 0x1A, None, OpcodeEntry::new("AR", overflow));
    Arc::new(tables)
}

struct Rig {
    ctx: Arc<SystemContext>,
    storage: Arc<FlatStorage>,
}

impl Rig {
    fn new(num_cpus: u16) -> Self {
        let ctx = Arc::new(SystemContext::new(CpuConfig {
            num_cpus,
            ..CpuConfig::default()
        }));
        let storage = Arc::new(FlatStorage::new(0x2_0000));
        install_new_psw(&storage, InterruptKind::Program, &z_psw(HANDLER));
        install_new_psw(&storage, InterruptKind::SupervisorCall, &z_psw(HANDLER + 0x100));
        Self { ctx, storage }
    }

    fn processor(&self, cpu: u16, ia: u64) -> Processor {
        self.ctx.start(cpu).unwrap();
        let mut processor = Processor::new(cpu, Arc::clone(&self.ctx), self.storage.clone())
            .with_tables(tables());
        processor.state_mut().set_psw(z_psw(ia));
        processor
    }
}

#[rstest]
#[case::nullifying(0x18, ProgramCode::PageTranslation, CODE)]
#[case::completing(0x1A, ProgramCode::FixedPointOverflow, CODE + 2)]
fn execution_fault_old_psw_address_follows_fault_class(
    #[case] opcode: u8,
    #[case] code: ProgramCode,
    #[case] expected: u64,
) {
    let rig = Rig::new(1);
    rig.storage.load(CODE, &[opcode, 0x12]).unwrap();
    let mut cpu = rig.processor(0, CODE);

    assert_eq!(cpu.step(), StepOutcome::Interrupted(InterruptKind::Program));

    let psa = Z.psa();
    assert_eq!(old_psw(rig.storage.as_ref(), InterruptKind::Program).ia, expected);
    assert_eq!(field(rig.storage.as_ref(), psa.program_code), u64::from(code.as_u16()));
    assert_eq!(field(rig.storage.as_ref(), psa.program_ilc), 2);
    assert_eq!(cpu.state().psw().ia, HANDLER);
    assert_eq!(cpu.diag().interrupts(InterruptKind::Program), 1);
    assert_eq!(cpu.diag().last_program_address, expected);
}

/// Storage whose instruction fetches fault from `boundary` upwards.
struct FetchBoundary {
    inner: Arc<FlatStorage>,
    boundary: u64,
}

impl Storage for FetchBoundary {
    fn read_absolute(&self, addr: u64, buf: &mut [u8]) -> Result<(), ProgramCheck> {
        self.inner.read_absolute(addr, buf)
    }

    fn store_absolute(&self, addr: u64, data: &[u8]) -> Result<(), ProgramCheck> {
        self.inner.store_absolute(addr, data)
    }

    fn fetch_instruction(&self, addr: u64, buf: &mut [u8]) -> Result<(), ProgramCheck> {
        if addr + buf.len() as u64 > self.boundary {
            return Err(ProgramCheck::new(ProgramCode::PageTranslation));
        }
        self.inner.read_absolute(addr, buf)
    }
}

#[test]
fn fetch_fault_on_first_halfword_advances_by_two() {
    let rig = Rig::new(1);
    let storage = Arc::new(FetchBoundary {
        inner: rig.storage.clone(),
        boundary: 0x3000,
    });
    rig.ctx.start(0).unwrap();
    let mut cpu = Processor::new(0, Arc::clone(&rig.ctx), storage);
    cpu.state_mut().set_psw(z_psw(0x3000));

    assert_eq!(cpu.step(), StepOutcome::Interrupted(InterruptKind::Program));
    assert_eq!(old_psw(rig.storage.as_ref(), InterruptKind::Program).ia, 0x3002);
    assert_eq!(field(rig.storage.as_ref(), Z.psa().program_ilc), 2);
    assert_eq!(cpu.executed(), 0);
}

#[test]
fn fetch_fault_past_first_halfword_advances_by_instruction_length() {
    let rig = Rig::new(1);
    // LPSWE straddles the boundary: first halfword fetched, the rest faults.
    rig.storage.load(0x2FFE, &[0xB2, 0xB2]).unwrap();
    let storage = Arc::new(FetchBoundary {
        inner: rig.storage.clone(),
        boundary: 0x3000,
    });
    rig.ctx.start(0).unwrap();
    let mut cpu = Processor::new(0, Arc::clone(&rig.ctx), storage);
    cpu.state_mut().set_psw(z_psw(0x2FFE));

    assert_eq!(cpu.step(), StepOutcome::Interrupted(InterruptKind::Program));
    assert_eq!(old_psw(rig.storage.as_ref(), InterruptKind::Program).ia, 0x3002);
    assert_eq!(field(rig.storage.as_ref(), Z.psa().program_ilc), 4);
}

#[test]
fn supervisor_call_stores_number_and_resumes_after_svc() {
    let rig = Rig::new(1);
    rig.storage.load(CODE, &[0x0A, 0x2A]).unwrap();
    let mut cpu = rig.processor(0, CODE);

    assert_eq!(
        cpu.step(),
        StepOutcome::Interrupted(InterruptKind::SupervisorCall)
    );
    let psa = Z.psa();
    assert_eq!(field(rig.storage.as_ref(), psa.svc_code), 0x2A);
    assert_eq!(field(rig.storage.as_ref(), psa.svc_ilc), 2);
    assert_eq!(
        old_psw(rig.storage.as_ref(), InterruptKind::SupervisorCall).ia,
        CODE + 2
    );
    assert_eq!(cpu.state().psw().ia, HANDLER + 0x100);
    assert_eq!(cpu.executed(), 1);
}

#[test]
fn problem_state_lpswe_is_a_privileged_operation() {
    let rig = Rig::new(1);
    rig.storage.load(CODE, &[0xB2, 0xB2, 0x00, 0x00]).unwrap();
    let mut cpu = rig.processor(0, CODE);
    cpu.state_mut().set_psw(Psw {
        problem_state: true,
        ..z_psw(CODE)
    });

    assert_eq!(cpu.step(), StepOutcome::Interrupted(InterruptKind::Program));
    assert_eq!(
        cpu.diag().last_program_code,
        Some(ProgramCode::PrivilegedOperation.as_u16())
    );
}

#[test]
fn lpswe_of_invalid_psw_leaves_current_psw_and_raises_specification() {
    let rig = Rig::new(1);
    rig.storage.load(CODE, &[0xB2, 0xB2, 0x06, 0x00]).unwrap();
    let mut bad = psw::encode(Z, &z_psw(0x4000)).as_bytes().to_vec();
    bad[4] = 0x00;
    bad[3] = 0x01;
    rig.storage.load(0x600, &bad).unwrap();
    let mut cpu = rig.processor(0, CODE);

    assert_eq!(cpu.step(), StepOutcome::Interrupted(InterruptKind::Program));
    assert_eq!(
        cpu.diag().last_program_code,
        Some(ProgramCode::Specification.as_u16())
    );
    assert_eq!(old_psw(rig.storage.as_ref(), InterruptKind::Program).ia, CODE + 4);
}

#[test]
fn lpswe_loads_new_psw() {
    let rig = Rig::new(1);
    rig.storage.load(CODE, &[0xB2, 0xB2, 0x06, 0x00]).unwrap();
    let target = Psw {
        condition_code: 2,
        ..z_psw(0x4000)
    };
    rig.storage
        .load(0x600, psw::encode(Z, &target).as_bytes())
        .unwrap();
    let mut cpu = rig.processor(0, CODE);

    assert_eq!(cpu.step(), StepOutcome::Executed);
    assert_eq!(*cpu.state().psw(), target);
}

#[test]
fn per_event_is_merged_into_program_code() {
    let rig = Rig::new(1);
    rig.storage.load(CODE, &[0x1A, 0x12]).unwrap();
    let mut cpu = rig.processor(0, CODE);
    cpu.state_mut().set_psw(Psw {
        system_mask: PSW_MASK_PER,
        ..z_psw(CODE)
    });
    cpu.state_mut().regs_mut().set_cr(9, 0x4000_0000);

    assert_eq!(cpu.step(), StepOutcome::Interrupted(InterruptKind::Program));
    let psa = Z.psa();
    assert_eq!(
        field(rig.storage.as_ref(), psa.program_code),
        u64::from(ProgramCode::FixedPointOverflow.as_u16() | 0x80)
    );
    assert_eq!(field(rig.storage.as_ref(), psa.per_address), CODE);
    assert!(cpu.state().per_pending.is_none());
}

#[test]
fn successful_branch_alone_raises_per_event() {
    let rig = Rig::new(1);
    rig.storage.load(CODE, &[0x07, 0xF3]).unwrap();
    let mut cpu = rig.processor(0, CODE);
    cpu.state_mut().set_psw(Psw {
        system_mask: PSW_MASK_PER,
        ..z_psw(CODE)
    });
    cpu.state_mut().regs_mut().set_cr(9, 0x8000_0000);
    cpu.state_mut().regs_mut().set_gpr(Register::R3, 0x5000);

    assert_eq!(cpu.step(), StepOutcome::Interrupted(InterruptKind::Program));
    assert_eq!(
        field(rig.storage.as_ref(), Z.psa().program_code),
        u64::from(ProgramCode::PerEvent.as_u16())
    );
    assert_eq!(old_psw(rig.storage.as_ref(), InterruptKind::Program).ia, 0x5000);
}

#[test]
fn program_check_in_transaction_aborts_it_and_flags_the_code() {
    let rig = Rig::new(1);
    // TBEGIN saving pair 0-1, then a faulting AR.
    rig.storage
        .load(CODE, &[0xE5, 0x60, 0x00, 0x00, 0x80, 0x00, 0x1A, 0x12])
        .unwrap();
    let mut cpu = rig.processor(0, CODE);
    cpu.state_mut().regs_mut().set_gpr(Register::R1, 7);

    assert_eq!(cpu.step(), StepOutcome::Executed);
    assert!(cpu.state().tx.is_some());
    cpu.state_mut().regs_mut().set_gpr(Register::R1, 99);

    assert_eq!(cpu.step(), StepOutcome::Interrupted(InterruptKind::Program));
    assert!(cpu.state().tx.is_none());
    assert_eq!(cpu.state().regs().gpr(Register::R1), 7);
    let old = old_psw(rig.storage.as_ref(), InterruptKind::Program);
    assert_eq!(old.ia, CODE + 6);
    assert_eq!(old.condition_code, 3);
    assert_eq!(
        field(rig.storage.as_ref(), Z.psa().program_code),
        u64::from(ProgramCode::FixedPointOverflow.as_u16() | TRANSACTION_FLAG)
    );
}

#[test]
fn constrained_transaction_over_limit_raises_constraint_at_tbeginc() {
    let rig = Rig::new(1);
    let config = CpuConfig {
        tx_instruction_limit: 2,
        ..CpuConfig::default()
    };
    let ctx = Arc::new(SystemContext::new(config));
    ctx.start(0).unwrap();
    // TBEGINC followed by three BCR 0,0 no-ops.
    rig.storage
        .load(
            CODE,
            &[0xE5, 0x61, 0x00, 0x00, 0x00, 0x00, 0x07, 0x00, 0x07, 0x00, 0x07, 0x00],
        )
        .unwrap();
    let mut cpu = Processor::new(0, ctx, rig.storage.clone());
    cpu.state_mut().set_psw(z_psw(CODE));

    assert_eq!(cpu.step(), StepOutcome::Executed);
    assert!(cpu.state().tx.as_ref().unwrap().constrained);
    assert_eq!(cpu.step(), StepOutcome::Executed);
    assert_eq!(cpu.step(), StepOutcome::Executed);
    assert_eq!(cpu.step(), StepOutcome::Interrupted(InterruptKind::Program));

    assert!(cpu.state().tx.is_none());
    assert_eq!(
        field(rig.storage.as_ref(), Z.psa().program_code),
        u64::from(ProgramCode::TransactionConstraint.as_u16())
    );
    assert_eq!(old_psw(rig.storage.as_ref(), InterruptKind::Program).ia, CODE);
}

#[test]
fn restricted_instruction_in_constrained_transaction_is_rejected() {
    let rig = Rig::new(1);
    rig.storage
        .load(CODE, &[0xE5, 0x61, 0x00, 0x00, 0x00, 0x00, 0x0A, 0x01])
        .unwrap();
    let mut cpu = rig.processor(0, CODE);

    assert_eq!(cpu.step(), StepOutcome::Executed);
    assert_eq!(cpu.step(), StepOutcome::Interrupted(InterruptKind::Program));
    assert_eq!(
        cpu.diag().last_program_code,
        Some(ProgramCode::TransactionConstraint.as_u16())
    );
    assert_eq!(cpu.diag().interrupts(InterruptKind::SupervisorCall), 0);
}

#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Vec<TraceEvent>>>);

impl TraceSink for Recorder {
    fn on_event(&mut self, event: &TraceEvent) -> Result<(), TraceError> {
        self.0.lock().unwrap().push(*event);
        Ok(())
    }
}

#[test]
fn invalid_program_new_psw_stops_after_one_attempt() {
    let rig = Rig::new(1);
    let mut bad = psw::encode(Z, &z_psw(HANDLER)).as_bytes().to_vec();
    bad[15] |= 1;
    rig.storage
        .load(Z.psa().new_psw(InterruptKind::Program), &bad)
        .unwrap();
    rig.storage.load(CODE, &[0x1A, 0x12]).unwrap();
    let recorder = Recorder::default();
    let mut cpu = rig
        .processor(0, CODE)
        .with_trace_sink(Box::new(recorder.clone()));

    assert_eq!(cpu.step(), StepOutcome::NotStarted(RunState::Stopping));
    assert_eq!(cpu.diag().program_loops, 1);
    assert_eq!(cpu.diag().interrupts(InterruptKind::Program), 0);
    let loops = recorder
        .0
        .lock()
        .unwrap()
        .iter()
        .filter(|event| matches!(event, TraceEvent::ProgramInterruptLoop { .. }))
        .count();
    assert_eq!(loops, 1);

    assert_eq!(cpu.step(), StepOutcome::NotStarted(RunState::Stopped));
    assert_eq!(cpu.diag().program_loops, 1);
}

#[test]
fn fault_while_holding_storage_lock_releases_it_for_other_processors() {
    let rig = Rig::new(2);
    // TS 0(R15) with R15 past the end of storage: addressing after the lock is taken.
    rig.storage.load(CODE, &[0x93, 0x00, 0xF0, 0x00]).unwrap();
    let mut faulting = rig.processor(0, CODE);
    faulting
        .state_mut()
        .regs_mut()
        .set_gpr(Register::R15, 0x10_0000);

    assert_eq!(
        faulting.step(),
        StepOutcome::Interrupted(InterruptKind::Program)
    );
    assert_eq!(
        faulting.diag().last_program_code,
        Some(ProgramCode::Addressing.as_u16())
    );
    assert_eq!(rig.ctx.ownership().storage, None);

    rig.storage.load(0x2000, &[0x93, 0x00, 0x07, 0x00]).unwrap();
    let mut other = rig.processor(1, 0x2000);
    let (outcome, other) = thread::spawn(move || (other.step(), other))
        .join()
        .unwrap();
    assert_eq!(outcome, StepOutcome::Executed);
    assert_eq!(other.state().psw().condition_code, 0);
    let mut byte = [0];
    rig.storage.read_absolute(0x700, &mut byte).unwrap();
    assert_eq!(byte, [0xFF]);
    assert_eq!(rig.ctx.ownership().storage, None);
}
