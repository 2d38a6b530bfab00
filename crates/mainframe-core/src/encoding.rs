/// Where the extended operation code of a primary opcode lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtensionLocation {
    /// The primary opcode alone selects the instruction.
    None,
    /// Byte 1 holds an 8-bit extension (`B2xx`, `B9xx`, ...).
    Byte1,
    /// The low nibble of byte 1 holds a 4-bit extension (`A7x`, `C0x`, ...).
    Nibble1,
    /// Byte 5 holds an 8-bit extension (`E3..xx`, `EB..xx`, ...).
    Byte5,
}

/// Primary opcodes that carry an extension, with its location.
///
/// Any primary opcode not present here dispatches on the first byte alone.
pub const EXTENDED_OPCODE_TABLE: &[(u8, ExtensionLocation)] = &[
    (0x01, ExtensionLocation::Byte1),
    (0xA5, ExtensionLocation::Nibble1),
    (0xA7, ExtensionLocation::Nibble1),
    (0xB2, ExtensionLocation::Byte1),
    (0xB3, ExtensionLocation::Byte1),
    (0xB9, ExtensionLocation::Byte1),
    (0xC0, ExtensionLocation::Nibble1),
    (0xC2, ExtensionLocation::Nibble1),
    (0xC4, ExtensionLocation::Nibble1),
    (0xC6, ExtensionLocation::Nibble1),
    (0xC8, ExtensionLocation::Nibble1),
    (0xCC, ExtensionLocation::Nibble1),
    (0xE3, ExtensionLocation::Byte5),
    (0xE5, ExtensionLocation::Byte1),
    (0xE7, ExtensionLocation::Byte5),
    (0xEB, ExtensionLocation::Byte5),
    (0xEC, ExtensionLocation::Byte5),
    (0xED, ExtensionLocation::Byte5),
];

/// Dispatch key combining a primary opcode and its extension.
pub type OpcodeKey = u16;

/// Returns the extension location for a primary opcode.
#[must_use]
pub fn extension_location(opcode: u8) -> ExtensionLocation {
    EXTENDED_OPCODE_TABLE
        .iter()
        .find_map(|(op, location)| (*op == opcode).then_some(*location))
        .unwrap_or(ExtensionLocation::None)
}

/// Instruction length in bytes from the two high bits of the first opcode byte.
#[must_use]
pub const fn instruction_length(first: u8) -> u8 {
    match first >> 6 {
        0 => 2,
        1 | 2 => 4,
        _ => 6,
    }
}

/// Builds a dispatch key from a primary opcode and an optional extension.
#[must_use]
pub const fn opcode_key(opcode: u8, extension: Option<u8>) -> OpcodeKey {
    match extension {
        Some(ext) => ((opcode as u16) << 8) | ext as u16,
        None => (opcode as u16) << 8,
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::{extension_location, instruction_length, opcode_key, ExtensionLocation};

    #[rstest]
    #[case(0x07, 2)]
    #[case(0x0A, 2)]
    #[case(0x41, 4)]
    #[case(0x82, 4)]
    #[case(0xB2, 4)]
    #[case(0xC0, 6)]
    #[case(0xE5, 6)]
    fn length_follows_opcode_high_bits(#[case] first: u8, #[case] len: u8) {
        assert_eq!(instruction_length(first), len);
    }

    #[test]
    fn extension_lookup_covers_each_location() {
        assert_eq!(extension_location(0xB2), ExtensionLocation::Byte1);
        assert_eq!(extension_location(0xA7), ExtensionLocation::Nibble1);
        assert_eq!(extension_location(0xE3), ExtensionLocation::Byte5);
        assert_eq!(extension_location(0x82), ExtensionLocation::None);
    }

    #[test]
    fn keys_distinguish_extension_from_none() {
        assert_eq!(opcode_key(0xB2, Some(0xB2)), 0xB2B2);
        assert_eq!(opcode_key(0x82, None), 0x8200);
        assert_ne!(opcode_key(0x01, Some(0x01)), opcode_key(0x01, None));
    }
}
