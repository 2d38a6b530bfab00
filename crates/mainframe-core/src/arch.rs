//! Architecture generations, installed facilities, and the fixed layout of the
//! prefixed storage area (PSA) each generation defines.
//!
//! Everything that differs between S/370, ESA/390 and z/Architecture is
//! expressed as data on [`Architecture`] so the rest of the core is written
//! once and parameterised by this value.

use bitflags::bitflags;

/// Architecture generation a processor is currently running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum Architecture {
    /// System/370 with basic-control and extended-control PSWs.
    S370,
    /// Enterprise Systems Architecture/390.
    Esa390,
    /// z/Architecture.
    #[default]
    ZArch,
}

bitflags! {
    /// Optional facilities installed in a configuration.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
    pub struct Facilities: u32 {
        /// Secondary address space (S/370 PSW bit 16, ESA/z ASC `10`).
        const DUAL_ADDRESS_SPACE = 1 << 0;
        /// Access-register mode (ASC `01`).
        const ACCESS_REGISTER = 1 << 1;
        /// Home address space (ASC `11`).
        const HOME_SPACE = 1 << 2;
        /// S/370 basic-control mode PSWs.
        const BASIC_CONTROL_MODE = 1 << 3;
        /// Program-event recording.
        const PER = 1 << 4;
        /// Transactional execution (`TBEGIN`/`TEND`).
        const TRANSACTIONAL_EXECUTION = 1 << 5;
        /// Constrained transactions (`TBEGINC`).
        const CONSTRAINED_TRANSACTIONS = 1 << 6;
        /// Interpretive execution of a guest configuration.
        const INTERPRETIVE_EXECUTION = 1 << 7;
    }
}

/// Interrupt classes that own an old/new PSW pair in the PSA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum InterruptKind {
    /// Operator or SIGP restart.
    Restart,
    /// External interruption.
    External,
    /// Supervisor call.
    SupervisorCall,
    /// Program interruption.
    Program,
    /// Machine-check interruption.
    MachineCheck,
    /// Input/output interruption.
    Io,
}

impl InterruptKind {
    /// All interrupt kinds in PSA order.
    pub const ALL: [Self; 6] = [
        Self::Restart,
        Self::External,
        Self::SupervisorCall,
        Self::Program,
        Self::MachineCheck,
        Self::Io,
    ];

    /// Stable index used for counters.
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }
}

/// Location and width of a diagnostic field in the PSA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldSpan {
    /// Offset from the start of the PSA.
    pub offset: u64,
    /// Field width in bytes.
    pub len: usize,
}

impl FieldSpan {
    const fn new(offset: u64, len: usize) -> Self {
        Self { offset, len }
    }
}

/// Fixed-offset layout of the prefixed storage area for one generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PsaLayout {
    /// Old PSW slots indexed by [`InterruptKind::index`].
    pub old_psw: [u64; 6],
    /// New PSW slots indexed by [`InterruptKind::index`].
    pub new_psw: [u64; 6],
    /// Service-signal external parameter.
    pub external_parameter: FieldSpan,
    /// Originating CPU address for emergency signal / external call.
    pub external_cpu_address: FieldSpan,
    /// External interruption code.
    pub external_code: FieldSpan,
    /// Supervisor-call ILC byte.
    pub svc_ilc: FieldSpan,
    /// Supervisor-call interruption code.
    pub svc_code: FieldSpan,
    /// Program interruption ILC byte.
    pub program_ilc: FieldSpan,
    /// Program interruption code.
    pub program_code: FieldSpan,
    /// Translation-exception identification.
    pub translation_exception_id: FieldSpan,
    /// Data-exception code.
    pub data_exception_code: FieldSpan,
    /// Monitor class number.
    pub monitor_class: FieldSpan,
    /// PER code.
    pub per_code: FieldSpan,
    /// PER address.
    pub per_address: FieldSpan,
    /// Exception access identification.
    pub exception_access_id: FieldSpan,
    /// Monitor code.
    pub monitor_code: FieldSpan,
    /// I/O subsystem identification word.
    pub io_subsystem_id: FieldSpan,
    /// I/O interruption parameter.
    pub io_parameter: FieldSpan,
    /// I/O interruption identification (z/Architecture only).
    pub io_identification: Option<FieldSpan>,
    /// S/370 I/O device address.
    pub io_device_address: Option<FieldSpan>,
    /// S/370 channel status word.
    pub channel_status_word: Option<FieldSpan>,
    /// Machine-check interruption code.
    pub machine_check_code: FieldSpan,
    /// External damage code.
    pub external_damage_code: FieldSpan,
    /// Failing storage address.
    pub failing_storage_address: FieldSpan,
}

impl PsaLayout {
    /// Offset of the old PSW slot for `kind`.
    #[must_use]
    pub const fn old_psw(&self, kind: InterruptKind) -> u64 {
        self.old_psw[kind.index()]
    }

    /// Offset of the new PSW slot for `kind`.
    #[must_use]
    pub const fn new_psw(&self, kind: InterruptKind) -> u64 {
        self.new_psw[kind.index()]
    }
}

const PSA_S370: PsaLayout = PsaLayout {
    old_psw: [0x008, 0x018, 0x020, 0x028, 0x030, 0x038],
    new_psw: [0x000, 0x058, 0x060, 0x068, 0x070, 0x078],
    external_parameter: FieldSpan::new(0x80, 4),
    external_cpu_address: FieldSpan::new(0x84, 2),
    external_code: FieldSpan::new(0x86, 2),
    svc_ilc: FieldSpan::new(0x89, 1),
    svc_code: FieldSpan::new(0x8A, 2),
    program_ilc: FieldSpan::new(0x8D, 1),
    program_code: FieldSpan::new(0x8E, 2),
    translation_exception_id: FieldSpan::new(0x90, 4),
    data_exception_code: FieldSpan::new(0x93, 1),
    monitor_class: FieldSpan::new(0x94, 2),
    per_code: FieldSpan::new(0x96, 1),
    per_address: FieldSpan::new(0x98, 4),
    exception_access_id: FieldSpan::new(0xA0, 1),
    monitor_code: FieldSpan::new(0x9C, 4),
    io_subsystem_id: FieldSpan::new(0xB8, 4),
    io_parameter: FieldSpan::new(0xBC, 4),
    io_identification: None,
    io_device_address: Some(FieldSpan::new(0xBA, 2)),
    channel_status_word: Some(FieldSpan::new(0x40, 8)),
    machine_check_code: FieldSpan::new(0xE8, 8),
    external_damage_code: FieldSpan::new(0xF4, 4),
    failing_storage_address: FieldSpan::new(0xF8, 4),
};

const PSA_ESA390: PsaLayout = PsaLayout {
    io_device_address: None,
    channel_status_word: None,
    ..PSA_S370
};

const PSA_ZARCH: PsaLayout = PsaLayout {
    old_psw: [0x120, 0x130, 0x140, 0x150, 0x160, 0x170],
    new_psw: [0x1A0, 0x1B0, 0x1C0, 0x1D0, 0x1E0, 0x1F0],
    translation_exception_id: FieldSpan::new(0xA8, 8),
    per_address: FieldSpan::new(0x98, 8),
    monitor_code: FieldSpan::new(0xB0, 8),
    io_identification: Some(FieldSpan::new(0xC0, 4)),
    failing_storage_address: FieldSpan::new(0xF8, 8),
    ..PSA_ESA390
};

impl Architecture {
    /// All supported generations, oldest first.
    pub const ALL: [Self; 3] = [Self::S370, Self::Esa390, Self::ZArch];

    /// Width of a full PSW image in storage.
    #[must_use]
    pub const fn psw_len(self) -> usize {
        match self {
            Self::S370 | Self::Esa390 => 8,
            Self::ZArch => 16,
        }
    }

    /// PSA size; real addresses below this are subject to prefixing.
    #[must_use]
    pub const fn psa_size(self) -> u64 {
        match self {
            Self::S370 | Self::Esa390 => 0x1000,
            Self::ZArch => 0x2000,
        }
    }

    /// PSA field layout.
    #[must_use]
    pub const fn psa(self) -> &'static PsaLayout {
        match self {
            Self::S370 => &PSA_S370,
            Self::Esa390 => &PSA_ESA390,
            Self::ZArch => &PSA_ZARCH,
        }
    }

    /// Facilities present on a default configuration of this generation.
    #[must_use]
    pub const fn default_facilities(self) -> Facilities {
        match self {
            Self::S370 => Facilities::BASIC_CONTROL_MODE
                .union(Facilities::DUAL_ADDRESS_SPACE)
                .union(Facilities::PER),
            Self::Esa390 => Facilities::DUAL_ADDRESS_SPACE
                .union(Facilities::ACCESS_REGISTER)
                .union(Facilities::HOME_SPACE)
                .union(Facilities::PER)
                .union(Facilities::INTERPRETIVE_EXECUTION),
            Self::ZArch => Facilities::DUAL_ADDRESS_SPACE
                .union(Facilities::ACCESS_REGISTER)
                .union(Facilities::HOME_SPACE)
                .union(Facilities::PER)
                .union(Facilities::TRANSACTIONAL_EXECUTION)
                .union(Facilities::CONSTRAINED_TRANSACTIONS)
                .union(Facilities::INTERPRETIVE_EXECUTION),
        }
    }

    /// Short operator-facing name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::S370 => "S/370",
            Self::Esa390 => "ESA/390",
            Self::ZArch => "z/Arch",
        }
    }
}
