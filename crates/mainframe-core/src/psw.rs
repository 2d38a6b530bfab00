//! Program-status word model and its per-generation storage codec.
//!
//! [`encode`] packs a [`Psw`] into the fixed image the architecture stores in
//! the PSA; [`decode`] is the inverse and rejects every illegal bit
//! combination with a [`SpecificationFault`] instead of tolerating it.

use thiserror::Error;

use crate::{Architecture, Facilities};

/// System-mask bit enabling program-event recording (EC formats).
pub const PSW_MASK_PER: u8 = 0x40;
/// System-mask bit enabling dynamic address translation (EC formats).
pub const PSW_MASK_DAT: u8 = 0x04;
/// System-mask bit enabling I/O interruptions (EC formats).
pub const PSW_MASK_IO: u8 = 0x02;
/// System-mask bit enabling external interruptions (both S/370 formats).
pub const PSW_MASK_EXTERNAL: u8 = 0x01;
/// Channel-mask bits of a basic-control system mask (channels 0-5, 6+).
pub const PSW_BC_CHANNEL_MASKS: u8 = 0xFE;

const EC_RESERVED_SYSTEM_MASK: u8 = 0xB8;
const EC_MODE_BIT: u8 = 0x08;

/// Addressing mode selected by the PSW.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum AddressingMode {
    /// 24-bit addressing.
    #[default]
    Bits24,
    /// 31-bit addressing.
    Bits31,
    /// 64-bit addressing.
    Bits64,
}

impl AddressingMode {
    /// Highest instruction address representable in this mode.
    #[must_use]
    pub const fn address_limit(self) -> u64 {
        match self {
            Self::Bits24 => 0x00FF_FFFF,
            Self::Bits31 => 0x7FFF_FFFF,
            Self::Bits64 => u64::MAX,
        }
    }
}

/// Address-space control bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[repr(u8)]
pub enum AddressSpaceControl {
    /// Primary-space mode.
    #[default]
    Primary = 0,
    /// Access-register mode.
    AccessRegister = 1,
    /// Secondary-space mode.
    Secondary = 2,
    /// Home-space mode.
    Home = 3,
}

impl AddressSpaceControl {
    /// Decodes the two ASC bits.
    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        match bits & 0x3 {
            0 => Self::Primary,
            1 => Self::AccessRegister,
            2 => Self::Secondary,
            _ => Self::Home,
        }
    }

    /// Facility a non-primary space control depends on.
    #[must_use]
    pub const fn required_facility(self) -> Option<Facilities> {
        match self {
            Self::Primary => None,
            Self::AccessRegister => Some(Facilities::ACCESS_REGISTER),
            Self::Secondary => Some(Facilities::DUAL_ADDRESS_SPACE),
            Self::Home => Some(Facilities::HOME_SPACE),
        }
    }
}

/// PSW control format. Only S/370 distinguishes the two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum PswFormat {
    /// S/370 basic-control mode; interruption code and ILC live in the PSW.
    BasicControl,
    /// Extended-control mode.
    #[default]
    ExtendedControl,
}

/// Reasons a PSW image is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum SpecificationFault {
    /// The image is not as wide as the generation's PSW.
    #[error("psw image is {actual} bytes, expected {expected}")]
    ImageLength {
        /// Expected width.
        expected: usize,
        /// Width supplied.
        actual: usize,
    },
    /// A bit that must be zero is one.
    #[error("reserved psw bit set (byte {byte}, mask {mask:#04x})")]
    ReservedBits {
        /// Byte index within the image.
        byte: usize,
        /// Offending bits.
        mask: u8,
    },
    /// Bit 12 does not select the generation's control format.
    #[error("psw bit 12 does not match the control format")]
    ControlFormat,
    /// Basic-control mode requested without the facility.
    #[error("basic-control mode is not installed")]
    BasicControlUnavailable,
    /// Extended addressing selected without basic addressing.
    #[error("64-bit addressing bit set without 31-bit addressing bit")]
    InvalidAddressingMode,
    /// Instruction address exceeds the addressing mode.
    #[error("instruction address {address:#x} exceeds {mode:?} addressing")]
    AddressExceedsMode {
        /// Offending address.
        address: u64,
        /// Selected addressing mode.
        mode: AddressingMode,
    },
    /// Space-control requires a facility that is not installed.
    #[error("address-space control {0:?} requires a facility that is not installed")]
    SpaceControlUnavailable(AddressSpaceControl),
    /// The instruction address is odd.
    #[error("instruction address {0:#x} is odd")]
    OddInstructionAddress(u64),
}

/// Decoded program-status word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct Psw {
    /// Control format (S/370 only).
    pub format: PswFormat,
    /// Bits 0-7.
    pub system_mask: u8,
    /// Storage-protection key, 0..=15.
    pub key: u8,
    /// Machine-check mask.
    pub machine_check: bool,
    /// Wait state.
    pub wait: bool,
    /// Problem state.
    pub problem_state: bool,
    /// Address-space control.
    pub asc: AddressSpaceControl,
    /// Condition code, 0..=3.
    pub condition_code: u8,
    /// Program mask, 0..=15.
    pub program_mask: u8,
    /// Addressing mode.
    pub amode: AddressingMode,
    /// Instruction address.
    pub ia: u64,
    /// Interruption code (basic-control format only).
    pub interruption_code: u16,
    /// Instruction length in bytes (basic-control format only).
    pub ilc: u8,
}

impl Psw {
    /// Returns the wrap mask for instruction addresses in the current mode.
    #[must_use]
    pub const fn address_wrap(&self) -> u64 {
        self.amode.address_limit()
    }

    /// Advances the instruction address by `len` bytes, wrapping at the mode limit.
    pub const fn advance(&mut self, len: u64) {
        self.ia = self.ia.wrapping_add(len) & self.address_wrap();
    }

    /// Backs the instruction address up by `len` bytes, wrapping at the mode limit.
    pub const fn back_up(&mut self, len: u64) {
        self.ia = self.ia.wrapping_sub(len) & self.address_wrap();
    }

    /// True when I/O interruptions are enabled by the system mask.
    #[must_use]
    pub const fn io_enabled(&self) -> bool {
        match self.format {
            PswFormat::BasicControl => self.system_mask & PSW_BC_CHANNEL_MASKS != 0,
            PswFormat::ExtendedControl => self.system_mask & PSW_MASK_IO != 0,
        }
    }

    /// True when external interruptions are enabled.
    #[must_use]
    pub const fn external_enabled(&self) -> bool {
        self.system_mask & PSW_MASK_EXTERNAL != 0
    }

    /// True when PER is enabled.
    #[must_use]
    pub const fn per_enabled(&self) -> bool {
        matches!(self.format, PswFormat::ExtendedControl) && self.system_mask & PSW_MASK_PER != 0
    }

    /// True when DAT is on.
    #[must_use]
    pub const fn dat_enabled(&self) -> bool {
        matches!(self.format, PswFormat::ExtendedControl) && self.system_mask & PSW_MASK_DAT != 0
    }

    /// True for a wait PSW that no maskable interruption can ever end.
    #[must_use]
    pub const fn is_disabled_wait(&self) -> bool {
        self.wait && !self.io_enabled() && !self.external_enabled() && !self.machine_check
    }
}

/// Encoded PSW image as stored in the PSA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PswImage {
    bytes: [u8; 16],
    len: usize,
}

impl PswImage {
    /// Returns the significant image bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }
}

impl AsRef<[u8]> for PswImage {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

const fn control_byte(psw: &Psw, ec_bit: bool) -> u8 {
    ((psw.key & 0x0F) << 4)
        | if ec_bit { EC_MODE_BIT } else { 0 }
        | if psw.machine_check { 0x04 } else { 0 }
        | if psw.wait { 0x02 } else { 0 }
        | if psw.problem_state { 0x01 } else { 0 }
}

const fn cc_pm_bits(psw: &Psw) -> u8 {
    ((psw.condition_code & 0x3) << 4) | (psw.program_mask & 0x0F)
}

/// Encodes `psw` into the storage image of `arch`.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn encode(arch: Architecture, psw: &Psw) -> PswImage {
    let mut bytes = [0u8; 16];
    bytes[0] = psw.system_mask;
    match arch {
        Architecture::S370 => match psw.format {
            PswFormat::BasicControl => {
                bytes[1] = control_byte(psw, false);
                bytes[2..4].copy_from_slice(&psw.interruption_code.to_be_bytes());
                bytes[4] = (((psw.ilc / 2) & 0x3) << 6) | cc_pm_bits(psw);
                bytes[5..8].copy_from_slice(&((psw.ia & 0x00FF_FFFF) as u32).to_be_bytes()[1..]);
            }
            PswFormat::ExtendedControl => {
                bytes[1] = control_byte(psw, true);
                let secondary = matches!(psw.asc, AddressSpaceControl::Secondary);
                bytes[2] = if secondary { 0x80 } else { 0 } | cc_pm_bits(psw);
                bytes[5..8].copy_from_slice(&((psw.ia & 0x00FF_FFFF) as u32).to_be_bytes()[1..]);
            }
        },
        Architecture::Esa390 => {
            bytes[1] = control_byte(psw, true);
            bytes[2] = ((psw.asc as u8) << 6) | cc_pm_bits(psw);
            let amode = if matches!(psw.amode, AddressingMode::Bits24) {
                0
            } else {
                0x8000_0000
            };
            let word = amode | ((psw.ia & 0x7FFF_FFFF) as u32);
            bytes[4..8].copy_from_slice(&word.to_be_bytes());
        }
        Architecture::ZArch => {
            bytes[1] = control_byte(psw, false);
            bytes[2] = ((psw.asc as u8) << 6) | cc_pm_bits(psw);
            match psw.amode {
                AddressingMode::Bits24 => {}
                AddressingMode::Bits31 => bytes[4] = 0x80,
                AddressingMode::Bits64 => {
                    bytes[3] = 0x01;
                    bytes[4] = 0x80;
                }
            }
            bytes[8..16].copy_from_slice(&psw.ia.to_be_bytes());
        }
    }
    PswImage {
        bytes,
        len: arch.psw_len(),
    }
}

const fn reserved(bytes: &[u8], byte: usize, mask: u8) -> Result<(), SpecificationFault> {
    let bad = bytes[byte] & mask;
    if bad == 0 {
        Ok(())
    } else {
        Err(SpecificationFault::ReservedBits { byte, mask: bad })
    }
}

fn check_space_control(
    asc: AddressSpaceControl,
    facilities: Facilities,
) -> Result<(), SpecificationFault> {
    match asc.required_facility() {
        Some(needed) if !facilities.contains(needed) => {
            Err(SpecificationFault::SpaceControlUnavailable(asc))
        }
        _ => Ok(()),
    }
}

const fn check_address(ia: u64, amode: AddressingMode) -> Result<(), SpecificationFault> {
    if ia > amode.address_limit() {
        return Err(SpecificationFault::AddressExceedsMode { address: ia, mode: amode });
    }
    if ia & 1 != 0 {
        return Err(SpecificationFault::OddInstructionAddress(ia));
    }
    Ok(())
}

fn common_fields(bytes: &[u8], format: PswFormat) -> Psw {
    Psw {
        format,
        system_mask: bytes[0],
        key: bytes[1] >> 4,
        machine_check: bytes[1] & 0x04 != 0,
        wait: bytes[1] & 0x02 != 0,
        problem_state: bytes[1] & 0x01 != 0,
        ..Psw::default()
    }
}

fn be_u24(bytes: &[u8]) -> u64 {
    u64::from(u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]]))
}

/// Decodes a PSW image of `arch`, validating it against `facilities`.
///
/// # Errors
///
/// Returns a [`SpecificationFault`] naming the first violated rule. No
/// partially decoded value is ever returned.
pub fn decode(
    arch: Architecture,
    facilities: Facilities,
    bytes: &[u8],
) -> Result<Psw, SpecificationFault> {
    let expected = arch.psw_len();
    if bytes.len() != expected {
        return Err(SpecificationFault::ImageLength {
            expected,
            actual: bytes.len(),
        });
    }
    match arch {
        Architecture::S370 => decode_s370(facilities, bytes),
        Architecture::Esa390 => decode_esa390(facilities, bytes),
        Architecture::ZArch => decode_zarch(facilities, bytes),
    }
}

fn decode_s370(facilities: Facilities, bytes: &[u8]) -> Result<Psw, SpecificationFault> {
    if bytes[1] & EC_MODE_BIT == 0 {
        if !facilities.contains(Facilities::BASIC_CONTROL_MODE) {
            return Err(SpecificationFault::BasicControlUnavailable);
        }
        let ia = be_u24(&bytes[5..8]);
        check_address(ia, AddressingMode::Bits24)?;
        return Ok(Psw {
            interruption_code: u16::from_be_bytes([bytes[2], bytes[3]]),
            ilc: (bytes[4] >> 6) * 2,
            condition_code: (bytes[4] >> 4) & 0x3,
            program_mask: bytes[4] & 0x0F,
            ia,
            ..common_fields(bytes, PswFormat::BasicControl)
        });
    }

    reserved(bytes, 0, EC_RESERVED_SYSTEM_MASK)?;
    reserved(bytes, 2, 0x40)?;
    reserved(bytes, 3, 0xFF)?;
    reserved(bytes, 4, 0xFF)?;
    let asc = if bytes[2] & 0x80 == 0 {
        AddressSpaceControl::Primary
    } else {
        AddressSpaceControl::Secondary
    };
    check_space_control(asc, facilities)?;
    let ia = be_u24(&bytes[5..8]);
    check_address(ia, AddressingMode::Bits24)?;
    Ok(Psw {
        asc,
        condition_code: (bytes[2] >> 4) & 0x3,
        program_mask: bytes[2] & 0x0F,
        ia,
        ..common_fields(bytes, PswFormat::ExtendedControl)
    })
}

fn decode_esa390(facilities: Facilities, bytes: &[u8]) -> Result<Psw, SpecificationFault> {
    reserved(bytes, 0, EC_RESERVED_SYSTEM_MASK)?;
    if bytes[1] & EC_MODE_BIT == 0 {
        return Err(SpecificationFault::ControlFormat);
    }
    reserved(bytes, 3, 0xFF)?;
    let asc = AddressSpaceControl::from_bits(bytes[2] >> 6);
    check_space_control(asc, facilities)?;
    let word = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    let amode = if word & 0x8000_0000 == 0 {
        AddressingMode::Bits24
    } else {
        AddressingMode::Bits31
    };
    let ia = u64::from(word & 0x7FFF_FFFF);
    check_address(ia, amode)?;
    Ok(Psw {
        asc,
        condition_code: (bytes[2] >> 4) & 0x3,
        program_mask: bytes[2] & 0x0F,
        amode,
        ia,
        ..common_fields(bytes, PswFormat::ExtendedControl)
    })
}

fn decode_zarch(facilities: Facilities, bytes: &[u8]) -> Result<Psw, SpecificationFault> {
    reserved(bytes, 0, EC_RESERVED_SYSTEM_MASK)?;
    if bytes[1] & EC_MODE_BIT != 0 {
        return Err(SpecificationFault::ControlFormat);
    }
    reserved(bytes, 3, 0xFE)?;
    reserved(bytes, 4, 0x7F)?;
    for byte in 5..8 {
        reserved(bytes, byte, 0xFF)?;
    }
    let asc = AddressSpaceControl::from_bits(bytes[2] >> 6);
    check_space_control(asc, facilities)?;
    let extended = bytes[3] & 0x01 != 0;
    let basic = bytes[4] & 0x80 != 0;
    let amode = match (extended, basic) {
        (false, false) => AddressingMode::Bits24,
        (false, true) => AddressingMode::Bits31,
        (true, true) => AddressingMode::Bits64,
        (true, false) => return Err(SpecificationFault::InvalidAddressingMode),
    };
    let mut ia_bytes = [0u8; 8];
    ia_bytes.copy_from_slice(&bytes[8..16]);
    let ia = u64::from_be_bytes(ia_bytes);
    check_address(ia, amode)?;
    Ok(Psw {
        asc,
        condition_code: (bytes[2] >> 4) & 0x3,
        program_mask: bytes[2] & 0x0F,
        amode,
        ia,
        ..common_fields(bytes, PswFormat::ExtendedControl)
    })
}

/// Decodes an 8-byte ESA/390-format PSW loaded into a z/Architecture processor.
///
/// Bit 12 must be one in the short form; it is inverted before the result is
/// treated as an ordinary z/Architecture PSW.
///
/// # Errors
///
/// Returns a [`SpecificationFault`] for any illegal bit combination.
pub fn decode_short(facilities: Facilities, bytes: &[u8]) -> Result<Psw, SpecificationFault> {
    if bytes.len() != 8 {
        return Err(SpecificationFault::ImageLength {
            expected: 8,
            actual: bytes.len(),
        });
    }
    if bytes[1] & EC_MODE_BIT == 0 {
        return Err(SpecificationFault::ControlFormat);
    }
    let word = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    let mut long = [0u8; 16];
    long[..4].copy_from_slice(&bytes[..4]);
    long[1] &= !EC_MODE_BIT;
    long[4] = bytes[4] & 0x80;
    long[12..16].copy_from_slice(&(word & 0x7FFF_FFFF).to_be_bytes());
    decode_zarch(facilities, &long)
}
