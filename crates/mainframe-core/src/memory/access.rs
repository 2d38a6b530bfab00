//! Storage access legality checks.

use crate::{ProgramCheck, ProgramCode};

/// Doubleword boundary, the alignment of a PSW operand.
pub const DOUBLEWORD: u64 = 8;

/// Validates that `len` bytes at `addr` lie inside storage of `size` bytes.
///
/// # Errors
///
/// Returns an addressing exception when any byte is outside storage.
pub const fn validate_range(addr: u64, len: usize, size: u64) -> Result<(), ProgramCheck> {
    match addr.checked_add(len as u64) {
        Some(end) if end <= size => Ok(()),
        _ => Err(ProgramCheck::new(ProgramCode::Addressing)),
    }
}

/// Validates that `addr` is a multiple of `boundary`, which must be a power of two.
///
/// # Errors
///
/// Returns a specification exception when `addr` is misaligned.
pub const fn validate_alignment(addr: u64, boundary: u64) -> Result<(), ProgramCheck> {
    if addr & (boundary - 1) == 0 {
        Ok(())
    } else {
        Err(ProgramCheck::new(ProgramCode::Specification))
    }
}
