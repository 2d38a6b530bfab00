//! Flat absolute storage for processor complexes without a storage subsystem.

/// Range and alignment checks.
pub mod access;

pub use access::{validate_alignment, validate_range, DOUBLEWORD};

use std::ops::Range;

use parking_lot::RwLock;

use crate::{ProgramCheck, ProgramCode, Storage};

/// Zero-initialised absolute storage shared by every processor of a complex.
#[derive(Debug)]
pub struct FlatStorage {
    bytes: RwLock<Vec<u8>>,
}

impl FlatStorage {
    /// Allocates `size` bytes of zeroed storage.
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self {
            bytes: RwLock::new(vec![0; size]),
        }
    }

    /// Storage size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        u64::try_from(self.bytes.read().len()).unwrap_or(u64::MAX)
    }

    /// Copies `data` in at `addr`, for loading programs and PSA contents.
    ///
    /// # Errors
    ///
    /// Returns an addressing exception when the range is outside storage.
    pub fn load(&self, addr: u64, data: &[u8]) -> Result<(), ProgramCheck> {
        self.store_absolute(addr, data)
    }
}

fn byte_range(addr: u64, len: usize, size: usize) -> Result<Range<usize>, ProgramCheck> {
    validate_range(addr, len, u64::try_from(size).unwrap_or(u64::MAX))?;
    let start = usize::try_from(addr).map_err(|_| ProgramCheck::new(ProgramCode::Addressing))?;
    Ok(start..start + len)
}

impl Storage for FlatStorage {
    fn read_absolute(&self, addr: u64, buf: &mut [u8]) -> Result<(), ProgramCheck> {
        let bytes = self.bytes.read();
        let range = byte_range(addr, buf.len(), bytes.len())?;
        buf.copy_from_slice(&bytes[range]);
        Ok(())
    }

    fn store_absolute(&self, addr: u64, data: &[u8]) -> Result<(), ProgramCheck> {
        let mut bytes = self.bytes.write();
        let range = byte_range(addr, data.len(), bytes.len())?;
        bytes[range].copy_from_slice(data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::FlatStorage;
    use crate::{ProgramCode, Storage};

    #[test]
    fn new_storage_is_zeroed() {
        let storage = FlatStorage::new(0x100);
        let mut buf = [0xAA; 16];
        storage.read_absolute(0xF0, &mut buf).unwrap();
        assert_eq!(buf, [0; 16]);
        assert_eq!(storage.size(), 0x100);
    }

    #[test]
    fn out_of_range_access_is_an_addressing_exception() {
        let storage = FlatStorage::new(0x100);
        let err = storage.store_absolute(0xFE, &[1, 2, 3]).unwrap_err();
        assert_eq!(err.code, ProgramCode::Addressing);
        let mut buf = [0; 2];
        storage.read_absolute(0xFE, &mut buf).unwrap();
        assert_eq!(buf, [0, 0]);
    }

    #[test]
    fn stores_are_visible_to_instruction_fetch() {
        let storage = FlatStorage::new(0x100);
        storage.load(0x10, &[0x07, 0xFE]).unwrap();
        let mut buf = [0; 2];
        storage.fetch_instruction(0x10, &mut buf).unwrap();
        assert_eq!(buf, [0x07, 0xFE]);
    }
}
