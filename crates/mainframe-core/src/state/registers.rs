use crate::Architecture;

/// Number of registers in each architected register file.
pub const REGISTER_COUNT: usize = 16;

/// Control register 0 value after initial CPU reset.
pub const CR0_INITIAL: u64 = 0x0000_00E0;
/// Control register 14 value after initial CPU reset.
pub const CR14_INITIAL: u64 = 0xC200_0000;

/// Register number taken from a 4-bit instruction field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum Register {
    R0 = 0,
    R1 = 1,
    R2 = 2,
    R3 = 3,
    R4 = 4,
    R5 = 5,
    R6 = 6,
    R7 = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Register {
    /// Ordered list of all register numbers.
    pub const ALL: [Self; REGISTER_COUNT] = [
        Self::R0,
        Self::R1,
        Self::R2,
        Self::R3,
        Self::R4,
        Self::R5,
        Self::R6,
        Self::R7,
        Self::R8,
        Self::R9,
        Self::R10,
        Self::R11,
        Self::R12,
        Self::R13,
        Self::R14,
        Self::R15,
    ];

    /// Returns the array index for this register (`0..=15`).
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Decodes the low four bits of an instruction field.
    #[must_use]
    pub const fn from_u4(bits: u8) -> Self {
        Self::ALL[(bits & 0x0F) as usize]
    }
}

/// General, control and access register files of one processor.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct RegisterFile {
    gpr: [u64; REGISTER_COUNT],
    cr: [u64; REGISTER_COUNT],
    ar: [u32; REGISTER_COUNT],
}

impl RegisterFile {
    /// Reads a full 64-bit general register.
    #[must_use]
    pub const fn gpr(&self, reg: Register) -> u64 {
        self.gpr[reg.index()]
    }

    /// Writes a full 64-bit general register.
    pub const fn set_gpr(&mut self, reg: Register, value: u64) {
        self.gpr[reg.index()] = value;
    }

    /// Reads bits 32-63 of a general register.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn gpr_low(&self, reg: Register) -> u32 {
        self.gpr[reg.index()] as u32
    }

    /// Writes bits 32-63 of a general register, leaving bits 0-31 intact.
    pub const fn set_gpr_low(&mut self, reg: Register, value: u32) {
        let slot = &mut self.gpr[reg.index()];
        *slot = (*slot & 0xFFFF_FFFF_0000_0000) | value as u64;
    }

    /// All general registers in order.
    #[must_use]
    pub const fn gprs(&self) -> &[u64; REGISTER_COUNT] {
        &self.gpr
    }

    /// Reads a control register.
    #[must_use]
    pub const fn cr(&self, index: usize) -> u64 {
        self.cr[index % REGISTER_COUNT]
    }

    /// Writes a control register.
    pub const fn set_cr(&mut self, index: usize, value: u64) {
        self.cr[index % REGISTER_COUNT] = value;
    }

    /// Reads an access register.
    #[must_use]
    pub const fn ar(&self, reg: Register) -> u32 {
        self.ar[reg.index()]
    }

    /// Writes an access register.
    pub const fn set_ar(&mut self, reg: Register, value: u32) {
        self.ar[reg.index()] = value;
    }

    /// Copies back the even/odd register pairs selected by `mask`.
    ///
    /// Bit 7 of `mask` selects pair 0-1, bit 0 selects pair 14-15.
    pub fn restore_pairs(&mut self, mask: u8, saved: &[u64; REGISTER_COUNT]) {
        for pair in 0..8 {
            if mask & (0x80 >> pair) != 0 {
                self.gpr[pair * 2] = saved[pair * 2];
                self.gpr[pair * 2 + 1] = saved[pair * 2 + 1];
            }
        }
    }

    /// Loads architected initial control-register values.
    pub fn initial_reset(&mut self, arch: Architecture) {
        self.cr = [0; REGISTER_COUNT];
        self.cr[0] = CR0_INITIAL;
        self.cr[14] = CR14_INITIAL;
        if arch == Architecture::S370 {
            self.cr[2] = 0xFFFF_FFFF;
        }
    }
}
