//! Per-generation opcode tables keyed by operation code and extension.

use std::collections::HashMap;

use crate::encoding::{opcode_key, OpcodeKey};
use crate::execute::{control, tx};
use crate::{Architecture, Instruction, Processor, Trap};

/// Instruction handler signature shared by built-ins and the opcode library.
///
/// The handler runs with the PSW already advanced past the instruction and
/// returns [`Trap`] to abandon it; the dispatch loop routes the trap.
pub type Handler = fn(&mut Processor, &Instruction) -> Result<(), Trap>;

/// One registered instruction.
#[derive(Debug, Clone, Copy)]
pub struct OpcodeEntry {
    /// Assembler mnemonic, for tracing.
    pub mnemonic: &'static str,
    /// Handler.
    pub handler: Handler,
    /// Permitted inside a constrained transaction.
    pub constrained_ok: bool,
}

impl OpcodeEntry {
    /// Entry not permitted in a constrained transaction.
    #[must_use]
    pub const fn new(mnemonic: &'static str, handler: Handler) -> Self {
        Self {
            mnemonic,
            handler,
            constrained_ok: false,
        }
    }

    /// Marks the entry as permitted in a constrained transaction.
    #[must_use]
    pub const fn constrained(mut self) -> Self {
        self.constrained_ok = true;
        self
    }
}

/// Dispatch table for one architecture generation.
#[derive(Debug, Clone, Default)]
pub struct OpcodeTable {
    entries: HashMap<OpcodeKey, OpcodeEntry>,
}

impl OpcodeTable {
    /// Looks up the entry for `key`.
    #[must_use]
    pub fn get(&self, key: OpcodeKey) -> Option<&OpcodeEntry> {
        self.entries.get(&key)
    }

    /// Number of registered instructions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Per-generation dispatch tables, built once and shared by every processor.
#[derive(Debug, Clone, Default)]
pub struct OpcodeTables {
    tables: [OpcodeTable; 3],
}

const fn arch_index(arch: Architecture) -> usize {
    match arch {
        Architecture::S370 => 0,
        Architecture::Esa390 => 1,
        Architecture::ZArch => 2,
    }
}

impl OpcodeTables {
    /// Empty tables; every opcode raises an operation exception.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Tables holding the built-in control instructions of each generation.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut tables = Self::new();
        for arch in Architecture::ALL {
            tables.register(arch, 0x07, None, OpcodeEntry::new("BCR", control::bcr).constrained());
            tables.register(arch, 0x0A, None, OpcodeEntry::new("SVC", control::svc));
            tables.register(arch, 0x80, None, OpcodeEntry::new("SSM", control::ssm));
            tables.register(arch, 0x82, None, OpcodeEntry::new("LPSW", control::lpsw));
            tables.register(arch, 0x93, None, OpcodeEntry::new("TS", control::ts).constrained());
        }
        let z = Architecture::ZArch;
        tables.register(z, 0xB2, Some(0xB2), OpcodeEntry::new("LPSWE", control::lpswe));
        tables.register(z, 0xE5, Some(0x60), OpcodeEntry::new("TBEGIN", tx::tbegin));
        tables.register(z, 0xE5, Some(0x61), OpcodeEntry::new("TBEGINC", tx::tbeginc));
        tables.register(
            z,
            0xB2,
            Some(0xF8),
            OpcodeEntry::new("TEND", tx::tend).constrained(),
        );
        tables
    }

    /// Registers `entry` for `opcode`/`extension` in the table of `arch`, replacing any previous entry.
    pub fn register(
        &mut self,
        arch: Architecture,
        opcode: u8,
        extension: Option<u8>,
        entry: OpcodeEntry,
    ) {
        self.tables[arch_index(arch)]
            .entries
            .insert(opcode_key(opcode, extension), entry);
    }

    /// Table of `arch`.
    #[must_use]
    pub const fn table(&self, arch: Architecture) -> &OpcodeTable {
        &self.tables[arch_index(arch)]
    }

    /// Entry for `insn` under `arch`.
    #[must_use]
    pub fn lookup(&self, arch: Architecture, insn: &Instruction) -> Option<&OpcodeEntry> {
        self.table(arch).get(insn.key())
    }
}

#[cfg(test)]
mod tests {
    use super::OpcodeTables;
    use crate::{Architecture, Instruction};

    #[test]
    fn builtins_are_registered_per_generation() {
        let tables = OpcodeTables::with_builtins();
        let lpswe = Instruction::decode(0, &[0xB2, 0xB2, 0x00, 0x00]).unwrap();
        assert!(tables.lookup(Architecture::ZArch, &lpswe).is_some());
        assert!(tables.lookup(Architecture::Esa390, &lpswe).is_none());
        let svc = Instruction::decode(0, &[0x0A, 0x01]).unwrap();
        for arch in Architecture::ALL {
            assert_eq!(tables.lookup(arch, &svc).unwrap().mnemonic, "SVC");
        }
    }

    #[test]
    fn constrained_flag_is_carried() {
        let tables = OpcodeTables::with_builtins();
        let tend = Instruction::decode(0, &[0xB2, 0xF8, 0x00, 0x00]).unwrap();
        let svc = Instruction::decode(0, &[0x0A, 0x01]).unwrap();
        let z = Architecture::ZArch;
        assert!(tables.lookup(z, &tend).unwrap().constrained_ok);
        assert!(!tables.lookup(z, &svc).unwrap().constrained_ok);
    }

    #[test]
    fn empty_tables_have_no_entries() {
        let tables = OpcodeTables::new();
        assert!(tables.table(Architecture::S370).is_empty());
        assert_eq!(OpcodeTables::with_builtins().table(Architecture::S370).len(), 5);
    }
}
