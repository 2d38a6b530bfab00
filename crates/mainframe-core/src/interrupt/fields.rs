use crate::{FieldSpan, ProgramCheck, ProgramCode, Storage};

const ADDRESSING: ProgramCheck = ProgramCheck::new(ProgramCode::Addressing);

fn field_address(base: u64, span: FieldSpan) -> Result<u64, ProgramCheck> {
    base.checked_add(span.offset).ok_or(ADDRESSING)
}

/// Writes the low `span.len` bytes of `value`, big-endian, at `base + span.offset`.
///
/// # Errors
///
/// Propagates the storage subsystem's program check; an address past the
/// end of the address space is an addressing exception.
pub fn store_field(
    storage: &dyn Storage,
    base: u64,
    span: FieldSpan,
    value: u64,
) -> Result<(), ProgramCheck> {
    let bytes = value.to_be_bytes();
    let len = span.len.min(bytes.len());
    storage.store_absolute(field_address(base, span)?, &bytes[bytes.len() - len..])
}

/// Writes raw bytes at `base + span.offset`, truncated to the field width.
///
/// # Errors
///
/// Propagates the storage subsystem's program check; an address past the
/// end of the address space is an addressing exception.
pub fn store_bytes(
    storage: &dyn Storage,
    base: u64,
    span: FieldSpan,
    data: &[u8],
) -> Result<(), ProgramCheck> {
    let len = span.len.min(data.len());
    storage.store_absolute(field_address(base, span)?, &data[..len])
}

/// Reads a PSW image of `len` bytes at absolute `address`.
///
/// # Errors
///
/// Propagates the storage subsystem's program check.
pub fn fetch_psw(storage: &dyn Storage, address: u64, len: usize) -> Result<[u8; 16], ProgramCheck> {
    let mut image = [0; 16];
    storage.read_absolute(address, &mut image[..len.min(16)])?;
    Ok(image)
}
