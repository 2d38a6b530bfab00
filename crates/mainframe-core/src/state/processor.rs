use crate::{
    psw, Architecture, CpuId, Facilities, IntClass, Psw, PswImage, RegisterFile,
    SpecificationFault, TxState,
};

/// Whether a record runs on bare hardware, hosts a guest, or is the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum ExecMode {
    /// No interpretive execution in progress.
    #[default]
    Native,
    /// This record has an active guest layered under it.
    Host,
    /// This record is the guest of an interpretive-execution host.
    Guest,
}

/// Reset requested for a processor; applied while it is stopping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum ResetKind {
    /// Clears pending interruptions and any transaction; registers survive.
    Cpu,
    /// CPU reset plus PSW, prefix and control registers to initial values.
    InitialCpu,
}

/// A recognised PER event waiting to be merged into the next program interruption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PerEvent {
    /// PER code bits as stored at the PER-code field.
    pub code: u8,
    /// Address of the instruction that caused the event.
    pub address: u64,
}

/// PER code for a successful-branching event.
pub const PER_SUCCESSFUL_BRANCH: u8 = 0x80;
/// PER code for an instruction-fetching event.
pub const PER_INSTRUCTION_FETCH: u8 = 0x40;

/// Per-processor architectural state record.
///
/// Lifecycle state is not kept here; it lives in [`crate::SystemContext`]
/// under the interrupt lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorState {
    cpu: CpuId,
    arch: Architecture,
    facilities: Facilities,
    mode: ExecMode,
    psw: Psw,
    regs: RegisterFile,
    prefix: u64,
    origin: u64,
    address_mask: Option<u64>,
    /// Active transaction, if any.
    pub tx: Option<TxState>,
    /// PER event recognised during the current instruction.
    pub per_pending: Option<PerEvent>,
}

impl ProcessorState {
    /// Creates a record in the initial-reset state.
    #[must_use]
    pub fn new(cpu: CpuId, arch: Architecture, facilities: Facilities) -> Self {
        let mut regs = RegisterFile::default();
        regs.initial_reset(arch);
        Self {
            cpu,
            arch,
            facilities,
            mode: ExecMode::Native,
            psw: Psw::default(),
            regs,
            prefix: 0,
            origin: 0,
            address_mask: None,
            tx: None,
            per_pending: None,
        }
    }

    /// Processor address.
    #[must_use]
    pub const fn cpu(&self) -> CpuId {
        self.cpu
    }

    /// Current architecture generation.
    #[must_use]
    pub const fn arch(&self) -> Architecture {
        self.arch
    }

    /// Switches architecture generation; the PSW must be reloaded afterwards.
    pub const fn set_arch(&mut self, arch: Architecture) {
        self.arch = arch;
        self.address_mask = None;
    }

    /// Installed facilities.
    #[must_use]
    pub const fn facilities(&self) -> Facilities {
        self.facilities
    }

    /// Native, host or guest.
    #[must_use]
    pub const fn mode(&self) -> ExecMode {
        self.mode
    }

    pub(crate) const fn set_mode(&mut self, mode: ExecMode) {
        self.mode = mode;
    }

    /// Current PSW.
    #[must_use]
    pub const fn psw(&self) -> &Psw {
        &self.psw
    }

    /// Mutable PSW access; drops any cached addressing-mode data.
    pub const fn psw_mut(&mut self) -> &mut Psw {
        self.address_mask = None;
        &mut self.psw
    }

    /// Replaces the PSW with an already validated value.
    pub const fn set_psw(&mut self, psw: Psw) {
        self.psw = psw;
        self.address_mask = None;
    }

    /// Steps the instruction address past an instruction of `len` bytes.
    pub const fn advance_ia(&mut self, len: u64) {
        self.psw.advance(len);
    }

    /// Sets the instruction address of a taken branch, wrapped to the addressing mode.
    pub const fn branch_to(&mut self, address: u64) {
        self.psw.ia = address & self.psw.address_wrap();
    }

    /// Sets the condition code.
    pub const fn set_condition_code(&mut self, cc: u8) {
        self.psw.condition_code = cc & 3;
    }

    /// Decodes and installs a PSW image of the current generation.
    ///
    /// Nothing is changed when the image is invalid.
    ///
    /// # Errors
    ///
    /// Returns the [`SpecificationFault`] reported by the decoder.
    pub fn load_psw(&mut self, image: &[u8]) -> Result<(), SpecificationFault> {
        let decoded = psw::decode(self.arch, self.facilities, image)?;
        self.set_psw(decoded);
        Ok(())
    }

    /// Decodes and installs an 8-byte short-format PSW (z/Architecture `LPSW`).
    ///
    /// # Errors
    ///
    /// Returns the [`SpecificationFault`] reported by the decoder.
    pub fn load_short_psw(&mut self, image: &[u8]) -> Result<(), SpecificationFault> {
        let decoded = psw::decode_short(self.facilities, image)?;
        self.set_psw(decoded);
        Ok(())
    }

    /// Encodes the current PSW in the layout of the current generation.
    #[must_use]
    pub fn store_psw(&self) -> PswImage {
        psw::encode(self.arch, &self.psw)
    }

    /// Returns the instruction-address mask, computing it on first use after a PSW load.
    pub fn address_mask(&mut self) -> u64 {
        let limit = self.psw.amode.address_limit();
        *self.address_mask.get_or_insert(limit)
    }

    /// Whether a derived addressing-mode value is currently cached.
    #[must_use]
    pub const fn has_cached_address_mask(&self) -> bool {
        self.address_mask.is_some()
    }

    /// Register files.
    #[must_use]
    pub const fn regs(&self) -> &RegisterFile {
        &self.regs
    }

    /// Mutable register files.
    pub const fn regs_mut(&mut self) -> &mut RegisterFile {
        &mut self.regs
    }

    /// Prefix register.
    #[must_use]
    pub const fn prefix(&self) -> u64 {
        self.prefix
    }

    /// Sets the prefix register, dropping bits below the PSA boundary.
    pub const fn set_prefix(&mut self, prefix: u64) {
        self.prefix = prefix & !(self.arch.psa_size() - 1);
    }

    /// Main-storage origin: zero natively, the guest origin when nested.
    #[must_use]
    pub const fn origin(&self) -> u64 {
        self.origin
    }

    /// Sets the main-storage origin.
    pub const fn set_origin(&mut self, origin: u64) {
        self.origin = origin;
    }

    /// Absolute address of byte `offset` of this processor's PSA.
    ///
    /// Saturates at `u64::MAX`, an address no storage accepts.
    #[must_use]
    pub const fn psa_address(&self, offset: u64) -> u64 {
        self.origin.saturating_add(self.prefix).saturating_add(offset)
    }

    /// Applies prefixing and the storage origin to a real address.
    ///
    /// Saturates at `u64::MAX`, an address no storage accepts.
    #[must_use]
    pub const fn real_to_absolute(&self, real: u64) -> u64 {
        let size = self.arch.psa_size();
        let absolute = if real < size {
            real.saturating_add(self.prefix)
        } else if real >= self.prefix && real < self.prefix.saturating_add(size) {
            real - self.prefix
        } else {
            real
        };
        self.origin.saturating_add(absolute)
    }

    /// Interrupt classes the current PSW allows to be presented.
    #[must_use]
    pub fn enabled_classes(&self) -> IntClass {
        let mut classes = IntClass::RESTART | IntClass::STOP | IntClass::RESET;
        if self.psw.io_enabled() {
            classes |= IntClass::IO;
        }
        if self.psw.external_enabled() {
            classes |= IntClass::EXTERNAL;
        }
        if self.psw.machine_check {
            classes |= IntClass::MACHINE_CHECK;
        }
        classes
    }

    /// Applies a reset to this record.
    pub fn reset(&mut self, kind: ResetKind) {
        self.tx = None;
        self.per_pending = None;
        if kind == ResetKind::InitialCpu {
            self.set_psw(Psw::default());
            self.prefix = 0;
            self.regs.initial_reset(self.arch);
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::{ExecMode, ProcessorState, ResetKind};
    use crate::{psw, AddressingMode, Architecture, Psw, PswFormat};

    fn state() -> ProcessorState {
        ProcessorState::new(0, Architecture::ZArch, Architecture::ZArch.default_facilities())
    }

    #[test]
    fn failed_load_leaves_psw_and_cache_untouched() {
        let mut cpu = state();
        let before = Psw {
            format: PswFormat::ExtendedControl,
            amode: AddressingMode::Bits64,
            ia: 0x4000,
            ..Psw::default()
        };
        cpu.set_psw(before);
        let _ = cpu.address_mask();
        let mut image = psw::encode(Architecture::ZArch, &before).as_bytes().to_vec();
        image[0] |= 0x80;
        assert!(cpu.load_psw(&image).is_err());
        assert_eq!(*cpu.psw(), before);
        assert!(cpu.has_cached_address_mask());
    }

    #[test]
    fn successful_load_invalidates_cached_address_mask() {
        let mut cpu = state();
        assert_eq!(cpu.address_mask(), AddressingMode::Bits24.address_limit());
        let next = Psw {
            amode: AddressingMode::Bits31,
            ia: 0x0010_0000,
            ..Psw::default()
        };
        let image = psw::encode(Architecture::ZArch, &next);
        cpu.load_psw(image.as_bytes()).unwrap();
        assert!(!cpu.has_cached_address_mask());
        assert_eq!(cpu.address_mask(), AddressingMode::Bits31.address_limit());
    }

    #[test]
    fn prefixing_swaps_low_core_and_prefix_area() {
        let mut cpu = state();
        cpu.set_prefix(0x0002_0000);
        assert_eq!(cpu.real_to_absolute(0x100), 0x0002_0100);
        assert_eq!(cpu.real_to_absolute(0x0002_0100), 0x100);
        assert_eq!(cpu.real_to_absolute(0x0005_0000), 0x0005_0000);
        cpu.set_origin(0x1000_0000);
        assert_eq!(cpu.psa_address(0x1D0), 0x1002_01D0);
    }

    #[rstest]
    #[case::origin_at_the_top(u64::MAX - 0x10, 0)]
    #[case::prefix_at_the_top(0x1000, u64::MAX - 0x1000)]
    fn addresses_past_the_top_saturate(#[case] origin: u64, #[case] prefix: u64) {
        let mut cpu = state();
        cpu.set_origin(origin);
        cpu.set_prefix(prefix);
        assert_eq!(cpu.psa_address(0x1D0), u64::MAX);
        assert_eq!(cpu.real_to_absolute(0x100), u64::MAX);
    }

    #[test]
    fn initial_reset_clears_psw_and_prefix() {
        let mut cpu = state();
        cpu.set_prefix(0x4000);
        cpu.psw_mut().ia = 0x8000;
        cpu.reset(ResetKind::Cpu);
        assert_eq!(cpu.prefix(), 0x4000);
        cpu.reset(ResetKind::InitialCpu);
        assert_eq!(cpu.prefix(), 0);
        assert_eq!(cpu.psw().ia, 0);
        assert_eq!(cpu.mode(), ExecMode::Native);
    }
}
