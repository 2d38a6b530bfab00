//! Helpers shared by instruction handlers.

use log::info;

use crate::{
    AddressingMode, Architecture, Instruction, Processor, ProgramCheck, ProgramCode, Register,
    Trap,
};

impl Processor {
    /// Effective address of a base-displacement operand, wrapped to the addressing mode.
    pub fn effective_address(&mut self, base: Register, displacement: u16) -> u64 {
        let state = self.state_mut();
        let base = if base == Register::R0 {
            0
        } else {
            state.regs().gpr(base)
        };
        base.wrapping_add(u64::from(displacement)) & state.address_mask()
    }

    /// Effective address of the first storage operand of an S-format instruction.
    pub(crate) fn operand_address(&mut self, insn: &Instruction) -> u64 {
        let (base, displacement) = insn.base_displacement();
        self.effective_address(base, displacement)
    }

    /// Reads `buf.len()` bytes at real address `real`.
    ///
    /// # Errors
    ///
    /// The storage subsystem's program check.
    pub fn read_real(&self, real: u64, buf: &mut [u8]) -> Result<(), ProgramCheck> {
        let absolute = self.state().real_to_absolute(real);
        self.storage.read_absolute(absolute, buf)
    }

    /// Stores `data` at real address `real`.
    ///
    /// # Errors
    ///
    /// The storage subsystem's program check.
    pub fn store_real(&self, real: u64, data: &[u8]) -> Result<(), ProgramCheck> {
        let absolute = self.state().real_to_absolute(real);
        self.storage.store_absolute(absolute, data)
    }

    /// Acquires the storage-serialization lock for this processor.
    ///
    /// # Errors
    ///
    /// [`Trap::Lock`] on a lock-discipline violation.
    pub fn obtain_mainlock(&self) -> Result<(), Trap> {
        Ok(self.ctx.obtain_mainlock(self.cpu())?)
    }

    /// Releases the storage-serialization lock.
    ///
    /// # Errors
    ///
    /// [`Trap::Lock`] when this processor does not hold it.
    pub fn release_mainlock(&self) -> Result<(), Trap> {
        Ok(self.ctx.release_mainlock(self.cpu())?)
    }

    /// Rejects privileged instructions in the problem state.
    ///
    /// # Errors
    ///
    /// A privileged-operation exception.
    pub fn require_supervisor(&self) -> Result<(), Trap> {
        if self.state().psw().problem_state {
            Err(ProgramCode::PrivilegedOperation.into())
        } else {
            Ok(())
        }
    }

    /// Switches the executing record to `arch`; the returned trap ends the batch.
    pub fn switch_architecture(&mut self, arch: Architecture) -> Trap {
        let cpu = self.cpu();
        let state = self.state_mut();
        let mut psw = *state.psw();
        if arch != Architecture::ZArch && psw.amode == AddressingMode::Bits64 {
            psw.amode = AddressingMode::Bits31;
            psw.ia &= AddressingMode::Bits31.address_limit();
        }
        state.set_arch(arch);
        state.set_psw(psw);
        info!("cpu {cpu}: architecture mode {}", arch.name());
        Trap::ModeSwitch
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::{
        AddressingMode, Architecture, CpuConfig, FlatStorage, Processor, Psw, PswFormat, Register,
        SystemContext, Trap,
    };

    fn processor() -> Processor {
        let ctx = Arc::new(SystemContext::new(CpuConfig::default()));
        Processor::new(0, ctx, Arc::new(FlatStorage::new(0x1_0000)))
    }

    #[test]
    fn effective_address_wraps_to_addressing_mode() {
        let mut cpu = processor();
        cpu.state_mut().set_psw(Psw {
            format: PswFormat::ExtendedControl,
            amode: AddressingMode::Bits24,
            ..Psw::default()
        });
        cpu.state_mut().regs_mut().set_gpr(Register::R3, 0x00FF_FFFF);
        assert_eq!(cpu.effective_address(Register::R3, 2), 1);
        assert_eq!(cpu.effective_address(Register::R0, 0x123), 0x123);
    }

    #[test]
    fn address_mask_is_cached_until_the_psw_changes() {
        let mut cpu = processor();
        let _ = cpu.effective_address(Register::R0, 0);
        assert!(cpu.state().has_cached_address_mask());
        cpu.state_mut().psw_mut().amode = AddressingMode::Bits31;
        assert!(!cpu.state().has_cached_address_mask());
    }

    #[test]
    fn mainlock_reentry_surfaces_as_a_lock_trap() {
        let cpu = processor();
        cpu.obtain_mainlock().unwrap();
        assert!(matches!(cpu.obtain_mainlock(), Err(Trap::Lock(_))));
        cpu.release_mainlock().unwrap();
    }

    #[test]
    fn leaving_z_mode_narrows_a_64_bit_psw() {
        let mut cpu = processor();
        cpu.state_mut().set_psw(Psw {
            format: PswFormat::ExtendedControl,
            amode: AddressingMode::Bits64,
            ia: 0x1_0000_2000,
            ..Psw::default()
        });
        assert_eq!(cpu.switch_architecture(Architecture::Esa390), Trap::ModeSwitch);
        assert_eq!(cpu.state().arch(), Architecture::Esa390);
        assert_eq!(cpu.state().psw().amode, AddressingMode::Bits31);
        assert_eq!(cpu.state().psw().ia, 0x2000);
    }
}
