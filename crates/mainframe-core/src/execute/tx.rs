//! Transactional execution: `TBEGIN`, `TBEGINC`, `TEND` and transaction abort.

use log::debug;

use crate::{Facilities, Instruction, Processor, ProgramCode, Trap, REGISTER_COUNT};

/// Deepest transaction nesting accepted.
pub const MAX_NESTING_DEPTH: u8 = 15;

/// Why a transaction was aborted. The discriminant is the architected abort code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[repr(u8)]
pub enum AbortCause {
    /// External interruption.
    External = 2,
    /// Program interruption (unfiltered).
    Program = 4,
    /// Machine-check interruption.
    MachineCheck = 5,
    /// I/O interruption.
    Io = 6,
    /// Restricted instruction or constraint violation.
    Restricted = 11,
}

impl AbortCause {
    /// Architected abort code.
    #[must_use]
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Condition code set for a non-constrained abort.
    #[must_use]
    pub const fn condition_code(self) -> u8 {
        match self {
            Self::Program | Self::Restricted => 3,
            Self::External | Self::MachineCheck | Self::Io => 2,
        }
    }
}

/// An active transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxState {
    /// Address of the outermost `TBEGIN`/`TBEGINC`.
    pub begin_address: u64,
    /// Address of the instruction after the outermost `TBEGIN`.
    pub resume_address: u64,
    /// Started by `TBEGINC`.
    pub constrained: bool,
    /// General-register save mask (bit 7 selects pair 0-1).
    pub save_mask: u8,
    /// General registers at transaction start.
    pub saved_gprs: [u64; REGISTER_COUNT],
    /// Nesting depth, at least 1.
    pub depth: u8,
    /// Instructions executed inside a constrained transaction.
    pub executed: u32,
}

/// Where execution resumes after an abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TxAbort {
    /// Abort cause.
    pub cause: AbortCause,
    /// Instruction address to resume at.
    pub resume_address: u64,
    /// Condition code to set; `None` for constrained transactions.
    pub condition_code: Option<u8>,
}

impl TxAbort {
    /// Applies the resume address and condition code to `psw`.
    pub const fn apply(&self, psw: &mut crate::Psw) {
        psw.ia = self.resume_address;
        if let Some(cc) = self.condition_code {
            psw.condition_code = cc;
        }
    }
}

impl Processor {
    /// Aborts the active transaction, restoring the saved register pairs.
    ///
    /// The PSW is left alone; callers apply the returned [`TxAbort`] to
    /// whichever PSW they are about to store or resume.
    pub fn abort_transaction(&mut self, cause: AbortCause) -> Option<TxAbort> {
        let cpu = self.cpu();
        let state = self.state_mut();
        let tx = state.tx.take()?;
        state.regs_mut().restore_pairs(tx.save_mask, &tx.saved_gprs);
        let abort = if tx.constrained {
            TxAbort {
                cause,
                resume_address: tx.begin_address,
                condition_code: None,
            }
        } else {
            TxAbort {
                cause,
                resume_address: tx.resume_address,
                condition_code: Some(cause.condition_code()),
            }
        };
        debug!(
            "cpu {cpu}: transaction aborted, code {}, resuming at {:#x}",
            cause.code(),
            abort.resume_address
        );
        Some(abort)
    }

    /// Checks one instruction about to run in the constrained lane.
    pub(crate) fn check_constrained(&mut self, constrained_ok: bool) -> Result<(), Trap> {
        let limit = self.tx_limit;
        let violated = match self.state_mut().tx.as_mut() {
            Some(tx) => {
                tx.executed += 1;
                !constrained_ok || tx.executed > limit
            }
            None => false,
        };
        if violated {
            if let Some(abort) = self.abort_transaction(AbortCause::Restricted) {
                abort.apply(self.state_mut().psw_mut());
            }
            return Err(ProgramCode::TransactionConstraint.into());
        }
        Ok(())
    }
}

fn begin(cpu: &mut Processor, insn: &Instruction, constrained: bool) -> Result<(), Trap> {
    let facility = if constrained {
        Facilities::CONSTRAINED_TRANSACTIONS
    } else {
        Facilities::TRANSACTIONAL_EXECUTION
    };
    if !cpu.state().facilities().contains(facility) {
        return Err(ProgramCode::Operation.into());
    }
    if let Some(depth) = cpu.state().tx.as_ref().map(|tx| tx.depth) {
        if depth >= MAX_NESTING_DEPTH {
            if let Some(abort) = cpu.abort_transaction(AbortCause::Restricted) {
                abort.apply(cpu.state_mut().psw_mut());
            }
            return Ok(());
        }
        let state = cpu.state_mut();
        if let Some(tx) = state.tx.as_mut() {
            tx.depth += 1;
        }
        state.set_condition_code(0);
        return Ok(());
    }
    let state = cpu.state_mut();
    let save_mask = insn.i16_at4().to_be_bytes()[0];
    let tx = TxState {
        begin_address: insn.address(),
        resume_address: state.psw().ia,
        constrained,
        save_mask,
        saved_gprs: *state.regs().gprs(),
        depth: 1,
        executed: 0,
    };
    state.tx = Some(tx);
    state.set_condition_code(0);
    if constrained {
        Err(Trap::LaneSwitch)
    } else {
        Ok(())
    }
}

/// `TBEGIN` (`E560`).
pub(crate) fn tbegin(cpu: &mut Processor, insn: &Instruction) -> Result<(), Trap> {
    begin(cpu, insn, false)
}

/// `TBEGINC` (`E561`).
pub(crate) fn tbeginc(cpu: &mut Processor, insn: &Instruction) -> Result<(), Trap> {
    begin(cpu, insn, true)
}

/// `TEND` (`B2F8`).
pub(crate) fn tend(cpu: &mut Processor, _insn: &Instruction) -> Result<(), Trap> {
    if !cpu
        .state()
        .facilities()
        .contains(Facilities::TRANSACTIONAL_EXECUTION)
    {
        return Err(ProgramCode::Operation.into());
    }
    let state = cpu.state_mut();
    let Some(tx) = state.tx.as_mut() else {
        state.set_condition_code(2);
        return Ok(());
    };
    tx.depth -= 1;
    if tx.depth > 0 {
        state.set_condition_code(0);
        return Ok(());
    }
    let constrained = tx.constrained;
    state.tx = None;
    state.set_condition_code(0);
    if constrained {
        Err(Trap::LaneSwitch)
    } else {
        Ok(())
    }
}
