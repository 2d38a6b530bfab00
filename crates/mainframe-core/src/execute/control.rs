//! Built-in control instructions: branching, supervisor call, PSW loading and
//! the interlocked update that serialises storage across processors.

use crate::execute::CR9_BRANCH;
use crate::{
    psw, validate_alignment, Architecture, Instruction, PerEvent, Processor, Register, Trap,
    DOUBLEWORD, PER_SUCCESSFUL_BRANCH,
};

/// `BCR` (`07`).
pub(crate) fn bcr(cpu: &mut Processor, insn: &Instruction) -> Result<(), Trap> {
    let mask = insn.bytes()[1] >> 4;
    let state = cpu.state_mut();
    let taken = mask & (0x8 >> state.psw().condition_code) != 0;
    if !taken || insn.r2() == Register::R0 {
        return Ok(());
    }
    let target = state.regs().gpr(insn.r2());
    state.branch_to(target);
    if state.psw().per_enabled() && state.regs().cr(9) & CR9_BRANCH != 0 {
        let code = state.per_pending.map_or(0, |per| per.code);
        state.per_pending = Some(PerEvent {
            code: code | PER_SUCCESSFUL_BRANCH,
            address: insn.address(),
        });
    }
    Ok(())
}

/// `SVC` (`0A`).
pub(crate) fn svc(_cpu: &mut Processor, insn: &Instruction) -> Result<(), Trap> {
    Err(Trap::SupervisorCall(insn.i1()))
}

/// `SSM` (`80`): replaces the system mask.
pub(crate) fn ssm(cpu: &mut Processor, insn: &Instruction) -> Result<(), Trap> {
    cpu.require_supervisor()?;
    let address = cpu.operand_address(insn);
    let mut mask = [0];
    cpu.read_real(address, &mut mask)?;
    let state = cpu.state_mut();
    let mut candidate = *state.psw();
    candidate.system_mask = mask[0];
    let image = psw::encode(state.arch(), &candidate);
    state.load_psw(image.as_bytes())?;
    Err(Trap::Recheck)
}

/// `LPSW` (`82`): loads an 8-byte PSW, short format on z/Architecture.
pub(crate) fn lpsw(cpu: &mut Processor, insn: &Instruction) -> Result<(), Trap> {
    cpu.require_supervisor()?;
    let address = cpu.operand_address(insn);
    validate_alignment(address, DOUBLEWORD)?;
    let mut image = [0; 8];
    cpu.read_real(address, &mut image)?;
    let state = cpu.state_mut();
    if state.arch() == Architecture::ZArch {
        state.load_short_psw(&image)?;
    } else {
        state.load_psw(&image)?;
    }
    Err(Trap::Recheck)
}

/// `LPSWE` (`B2B2`): loads a 16-byte z/Architecture PSW.
pub(crate) fn lpswe(cpu: &mut Processor, insn: &Instruction) -> Result<(), Trap> {
    cpu.require_supervisor()?;
    let address = cpu.operand_address(insn);
    validate_alignment(address, DOUBLEWORD)?;
    let mut image = [0; 16];
    cpu.read_real(address, &mut image)?;
    cpu.state_mut().load_psw(&image)?;
    Err(Trap::Recheck)
}

/// `TS` (`93`): sets the condition code from the leftmost bit and stores all ones.
///
/// The byte is updated under the storage-serialization lock. A program check
/// between obtain and release leaves the lock held; the dispatch boundary
/// discharges it.
pub(crate) fn ts(cpu: &mut Processor, insn: &Instruction) -> Result<(), Trap> {
    let address = cpu.operand_address(insn);
    cpu.obtain_mainlock()?;
    let mut byte = [0];
    cpu.read_real(address, &mut byte)?;
    cpu.store_real(address, &[0xFF])?;
    cpu.release_mainlock()?;
    cpu.state_mut().set_condition_code(byte[0] >> 7);
    Ok(())
}
