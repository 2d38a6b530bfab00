//! Instruction image decoding for dispatch.
//!
//! The dispatch loop only needs the length, the dispatch key and a handful of
//! operand fields shared by the built-in control instructions; the opcode
//! library decodes its own formats from [`Instruction::bytes`].

use crate::encoding::{extension_location, instruction_length, opcode_key, OpcodeKey};
use crate::{ExtensionLocation, Register};

/// Longest instruction in bytes.
pub const MAX_INSTRUCTION_LEN: usize = 6;

/// A fetched instruction image and the address it was fetched from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Instruction {
    address: u64,
    bytes: [u8; MAX_INSTRUCTION_LEN],
    len: u8,
}

impl Instruction {
    /// Builds an instruction from at least as many bytes as its opcode implies.
    ///
    /// Returns `None` when `bytes` is empty or shorter than the encoded length.
    #[must_use]
    pub fn decode(address: u64, bytes: &[u8]) -> Option<Self> {
        let len = instruction_length(*bytes.first()?);
        let image = bytes.get(..usize::from(len))?;
        let mut buf = [0; MAX_INSTRUCTION_LEN];
        buf[..image.len()].copy_from_slice(image);
        Some(Self {
            address,
            bytes: buf,
            len,
        })
    }

    /// Address the instruction was fetched from.
    #[must_use]
    pub const fn address(&self) -> u64 {
        self.address
    }

    /// Length in bytes (2, 4 or 6).
    #[must_use]
    pub const fn length(&self) -> u8 {
        self.len
    }

    /// Raw image.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes[..usize::from(self.len)]
    }

    /// Primary opcode.
    #[must_use]
    pub const fn opcode(&self) -> u8 {
        self.bytes[0]
    }

    /// Extended opcode, when the primary opcode has one.
    #[must_use]
    pub fn extension(&self) -> Option<u8> {
        match extension_location(self.opcode()) {
            ExtensionLocation::None => None,
            ExtensionLocation::Byte1 => Some(self.bytes[1]),
            ExtensionLocation::Nibble1 => Some(self.bytes[1] & 0x0F),
            ExtensionLocation::Byte5 => Some(self.bytes[5]),
        }
    }

    /// Dispatch key for the opcode table.
    #[must_use]
    pub fn key(&self) -> OpcodeKey {
        opcode_key(self.opcode(), self.extension())
    }

    /// `R1` / `M1` field (byte 1, high nibble).
    #[must_use]
    pub const fn r1(&self) -> Register {
        Register::from_u4(self.bytes[1] >> 4)
    }

    /// `R2` field (byte 1, low nibble).
    #[must_use]
    pub const fn r2(&self) -> Register {
        Register::from_u4(self.bytes[1])
    }

    /// 8-bit immediate in byte 1 (`SVC`, `SSM`-style).
    #[must_use]
    pub const fn i1(&self) -> u8 {
        self.bytes[1]
    }

    /// Base register and 12-bit displacement of the first storage operand (bytes 2-3).
    #[must_use]
    pub const fn base_displacement(&self) -> (Register, u16) {
        let base = Register::from_u4(self.bytes[2] >> 4);
        let disp = (((self.bytes[2] & 0x0F) as u16) << 8) | self.bytes[3] as u16;
        (base, disp)
    }

    /// 16-bit immediate in bytes 4-5 (`SIL` format).
    #[must_use]
    pub const fn i16_at4(&self) -> u16 {
        ((self.bytes[4] as u16) << 8) | self.bytes[5] as u16
    }
}

#[cfg(test)]
mod tests {
    use super::Instruction;
    use crate::Register;

    #[test]
    fn decode_requires_full_image() {
        assert!(Instruction::decode(0, &[]).is_none());
        assert!(Instruction::decode(0, &[0xB2, 0xB2]).is_none());
        let insn = Instruction::decode(0x100, &[0xB2, 0xB2, 0x10, 0x08, 0xFF]).unwrap();
        assert_eq!(insn.length(), 4);
        assert_eq!(insn.bytes(), &[0xB2, 0xB2, 0x10, 0x08]);
    }

    #[test]
    fn keys_include_extension_where_defined() {
        let lpswe = Instruction::decode(0, &[0xB2, 0xB2, 0x00, 0x00]).unwrap();
        assert_eq!(lpswe.key(), 0xB2B2);
        let lpsw = Instruction::decode(0, &[0x82, 0x00, 0x00, 0x00]).unwrap();
        assert_eq!(lpsw.key(), 0x8200);
        let tbegin = Instruction::decode(0, &[0xE5, 0x60, 0x00, 0x00, 0xFF, 0x00]).unwrap();
        assert_eq!(tbegin.key(), 0xE560);
        let lg = Instruction::decode(0, &[0xE3, 0x10, 0x20, 0x00, 0x00, 0x04]).unwrap();
        assert_eq!(lg.key(), 0xE304);
    }

    #[test]
    fn operand_fields() {
        let insn = Instruction::decode(0, &[0x82, 0x00, 0x3A, 0xBC]).unwrap();
        assert_eq!(insn.base_displacement(), (Register::R3, 0xABC));
        let bcr = Instruction::decode(0, &[0x07, 0xF9]).unwrap();
        assert_eq!(bcr.r1(), Register::R15);
        assert_eq!(bcr.r2(), Register::R9);
    }
}
