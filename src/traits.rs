//! Traits & Feature Registry (component A).
//!
//! A read-only mapping from a CPU model to the trait record that gates
//! which instructions, registers, and faults are active. Enumerations are
//! carried over from `x86_cpu_type_t`/`x86_cpu_subtype_t`/`x87_fpu_type_t`
//! in the original C `cpu.h` rather than invented.

/// Processor family, mirroring `enum x86_cpu_type_t`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CpuFamily {
    /// Intel 8086/8088 and compatibles.
    I8086,
    /// Intel 80186/80188 and compatibles.
    I186,
    /// NEC V60 (x86-emulation mode only).
    V60,
    /// NEC V20/V30/V40/V50.
    V20,
    /// NEC µPD9002.
    Upd9002,
    /// NEC V33/V53.
    V33,
    /// NEC V25.
    V25,
    /// NEC V55.
    V55,
    /// Intel 80286 and compatibles.
    I286,
    /// Intel 80386 and compatibles.
    I386,
    /// Intel 80486 and compatibles.
    I486,
    /// Intel P5 and later ("586+").
    Intel,
    /// AMD CPUs.
    Amd,
    /// Cyrix CPUs and derivatives (incl. NatSemi/AMD Geode lineage).
    Cyrix,
    /// Centaur/VIA/Zhaoxin CPUs.
    Via,
    /// Experimental emulator extensions (polarity-inverted emulation-mode bit).
    Extended,
}

/// Minor stepping/variant within a [`CpuFamily`], mirroring
/// `enum x86_cpu_subtype_t`. `0` means "no distinguished subtype".
pub type CpuSubtype = u32;

/// x87-family FPU identity, mirroring `enum x87_fpu_type_t`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FpuType {
    /// No floating point coprocessor present.
    None,
    /// Intel 8087.
    I8087,
    /// Intel 80287.
    I287,
    /// Intel 80387 (and 80187).
    I387,
    /// Cyrix EMC87.
    Emc87,
    /// IIT 3C87 (four FPU register banks rather than one).
    Iit,
    /// FPU integrated into the host CPU (486DX and later, or 487).
    Integrated,
}

/// Vendor-specific SMM save-state layout selector (§6.e, §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SmmFormat {
    /// No SMM support.
    None,
    Intel80386Sl,
    IntelP5,
    IntelP6,
    IntelP4,
    Intel64,
    AmdK5K6,
    Amd64,
    CyrixCx486Slce,
    CyrixM1,
    CyrixM2,
    CyrixMediaGx,
    /// Marked "check if it worked like LX did" in the original source;
    /// see DESIGN.md Open Question decisions.
    CyrixGx2Lx,
}

bitflags::bitflags! {
    /// Vendor/model capability flags gating instruction availability.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CpuCapabilities: u32 {
        /// AMD-style SMM where ICEBP is repurposed.
        const AMD_SMM_ICEBP           = 1 << 0;
        /// CPUID instruction present.
        const CPUID                  = 1 << 1;
        /// RDPMC instruction present.
        const RDPMC                  = 1 << 2;
        /// Multi-byte NOP (0F 1F /0) supported.
        const MULTIBYTE_NOP          = 1 << 3;
        /// SSE present but only as scalar/non-SIMD extension (early Cyrix).
        const SSE_NON_SIMD           = 1 << 4;
        /// Full SIMD SSE.
        const SSE_SIMD               = 1 << 5;
        /// Large single-operand-macrofusion (L1OM) style decode hints.
        const L1OM                   = 1 << 6;
        /// MVEX (Xeon Phi style) EVEX variant supported.
        const MVEX                   = 1 << 7;
        /// DREX byte (some AMD64 pre-release encodings).
        const DREX                   = 1 << 8;
        /// Cyrix RDSHR/WRSHR smm-shadow instructions.
        const CYRIX_RDSHR            = 1 << 9;
        /// Cyrix MediaGX unified memory/display controller instructions.
        const CYRIX_MEDIAGX          = 1 << 10;
        /// Cyrix EMMI multimedia instructions.
        const CYRIX_EMMI             = 1 << 11;
        /// Cyrix/Geode DMM (debug management mode) support declared.
        const CYRIX_DMM              = 1 << 12;
        /// Cyrix/Geode 3DNow!-GX extensions.
        const CYRIX_3DNOW_GX         = 1 << 13;
        /// VIA "alternate instruction set" (ALTINST) MSR-gated opcodes.
        const VIA_ALT_INST           = 1 << 14;
    }
}

/// CPUID leaf data as raw (eax, ebx, ecx, edx) tuples. Unsupported leaves on
/// a given model are all-zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuidLeaf {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

/// The six CPUID leaves the engine consults (spec §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuidLeaves {
    pub basic_0: CpuidLeaf,
    pub basic_1: CpuidLeaf,
    pub leaf_7_0: CpuidLeaf,
    pub leaf_7_1: CpuidLeaf,
    pub ext_0: CpuidLeaf,
    pub ext_1: CpuidLeaf,
}

/// Read-only per-model trait record (component A).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuTraits {
    pub family: CpuFamily,
    pub subtype: CpuSubtype,
    pub description: &'static str,
    /// FPU type present if any coprocessor is attached at reset.
    pub fpu_default: FpuType,
    /// FPU types this model can have attached (bitmask over a small fixed set).
    pub fpu_supported: &'static [FpuType],
    /// Size of the prefetch queue in bytes. `0` means byte-at-a-time fetch
    /// (the model that detects self-modifying code immediately, §4.4).
    pub prefetch_queue_size: u8,
    pub smm_format: SmmFormat,
    pub cpuid: CpuidLeaves,
    pub capabilities: CpuCapabilities,
    /// True for 8086/8088/V20 original silicon: unknown opcodes are
    /// silently ignored instead of raising `#UD` (§4.1, §7).
    pub silent_ignore_undefined: bool,
    /// True for V20/µPD9002-style emulation-mode switching (bit MD);
    /// `Extended` flips the polarity (§4.6).
    pub has_emulation_mode: bool,
    /// True for V25/V55 which carry register banks (§3).
    pub has_register_banks: bool,
    pub register_bank_count: u8,
    /// True for the 8089 I/O coprocessor being present on this platform.
    pub has_8089: bool,
}

impl CpuTraits {
    /// Whether an instruction gated by `cap` should raise `#UD` (true) or be
    /// silently accepted (false, handled by the caller as a no-op/ignore per
    /// `silent_ignore_undefined`).
    pub fn requires(&self, cap: CpuCapabilities) -> bool {
        !self.capabilities.contains(cap)
    }
}

/// Intel 8086, the baseline pre-CPUID CPU.
pub const TRAITS_8086: CpuTraits = CpuTraits {
    family: CpuFamily::I8086,
    subtype: 0,
    description: "Intel 8086/8088",
    fpu_default: FpuType::None,
    fpu_supported: &[FpuType::None, FpuType::I8087],
    prefetch_queue_size: 6,
    smm_format: SmmFormat::None,
    cpuid: CpuidLeaves {
        basic_0: CpuidLeaf { eax: 0, ebx: 0, ecx: 0, edx: 0 },
        basic_1: CpuidLeaf { eax: 0, ebx: 0, ecx: 0, edx: 0 },
        leaf_7_0: CpuidLeaf { eax: 0, ebx: 0, ecx: 0, edx: 0 },
        leaf_7_1: CpuidLeaf { eax: 0, ebx: 0, ecx: 0, edx: 0 },
        ext_0: CpuidLeaf { eax: 0, ebx: 0, ecx: 0, edx: 0 },
        ext_1: CpuidLeaf { eax: 0, ebx: 0, ecx: 0, edx: 0 },
    },
    capabilities: CpuCapabilities::empty(),
    silent_ignore_undefined: true,
    has_emulation_mode: false,
    has_register_banks: false,
    register_bank_count: 0,
    has_8089: false,
};

/// NEC V20: 80186-superset plus 8080 emulation mode.
pub const TRAITS_V20: CpuTraits = CpuTraits {
    family: CpuFamily::V20,
    subtype: 0,
    description: "NEC V20/V30/V40/V50",
    fpu_default: FpuType::None,
    fpu_supported: &[FpuType::None, FpuType::I8087],
    prefetch_queue_size: 6,
    smm_format: SmmFormat::None,
    cpuid: TRAITS_8086.cpuid,
    capabilities: CpuCapabilities::MULTIBYTE_NOP,
    silent_ignore_undefined: true,
    has_emulation_mode: true,
    has_register_banks: false,
    register_bank_count: 0,
    has_8089: false,
};

/// NEC µPD9002: V20-compatible with Z80 emulation including system instructions.
pub const TRAITS_UPD9002: CpuTraits = CpuTraits {
    family: CpuFamily::Upd9002,
    description: "NEC uPD9002",
    has_emulation_mode: true,
    ..TRAITS_V20
};

/// NEC V25: V20-compatible, 8 register banks, no 8080 emulation.
pub const TRAITS_V25: CpuTraits = CpuTraits {
    family: CpuFamily::V25,
    description: "NEC V25",
    has_emulation_mode: false,
    has_register_banks: true,
    register_bank_count: 8,
    ..TRAITS_V20
};

/// NEC V55: V25-compatible, 16 register banks, DS2/DS3.
pub const TRAITS_V55: CpuTraits = CpuTraits {
    family: CpuFamily::V55,
    description: "NEC V55",
    register_bank_count: 16,
    ..TRAITS_V25
};

/// Intel 80286: 80186-compatible, protected mode, no paging.
pub const TRAITS_286: CpuTraits = CpuTraits {
    family: CpuFamily::I286,
    subtype: 0,
    description: "Intel 80286",
    fpu_default: FpuType::None,
    fpu_supported: &[FpuType::None, FpuType::I287],
    prefetch_queue_size: 6,
    smm_format: SmmFormat::None,
    cpuid: TRAITS_8086.cpuid,
    capabilities: CpuCapabilities::empty(),
    silent_ignore_undefined: false,
    has_emulation_mode: false,
    has_register_banks: false,
    register_bank_count: 0,
    has_8089: false,
};

/// Intel 80386: 32-bit GPRs, paging.
pub const TRAITS_386: CpuTraits = CpuTraits {
    family: CpuFamily::I386,
    description: "Intel 80386",
    fpu_default: FpuType::None,
    fpu_supported: &[FpuType::None, FpuType::I287, FpuType::I387],
    prefetch_queue_size: 16,
    ..TRAITS_286
};

/// Intel 80486: integrated FPU, CMPXCHG, multi-byte NOP.
pub const TRAITS_486: CpuTraits = CpuTraits {
    family: CpuFamily::I486,
    description: "Intel 80486",
    fpu_default: FpuType::Integrated,
    fpu_supported: &[FpuType::Integrated],
    prefetch_queue_size: 32,
    capabilities: CpuCapabilities::MULTIBYTE_NOP,
    ..TRAITS_386
};

/// A generic modern Intel64 long-mode CPU (P6-and-later lineage, CPUID+SSE2+).
pub const TRAITS_INTEL64: CpuTraits = CpuTraits {
    family: CpuFamily::Intel,
    description: "Generic Intel64 long-mode CPU",
    fpu_default: FpuType::Integrated,
    fpu_supported: &[FpuType::Integrated],
    prefetch_queue_size: 32,
    smm_format: SmmFormat::Intel64,
    capabilities: CpuCapabilities::from_bits_truncate(
        CpuCapabilities::CPUID.bits()
            | CpuCapabilities::RDPMC.bits()
            | CpuCapabilities::MULTIBYTE_NOP.bits()
            | CpuCapabilities::SSE_SIMD.bits(),
    ),
    ..TRAITS_486
};

/// A generic modern AMD64 long-mode CPU.
pub const TRAITS_AMD64: CpuTraits = CpuTraits {
    family: CpuFamily::Amd,
    description: "Generic AMD64 long-mode CPU",
    smm_format: SmmFormat::Amd64,
    capabilities: CpuCapabilities::from_bits_truncate(
        CpuCapabilities::CPUID.bits()
            | CpuCapabilities::RDPMC.bits()
            | CpuCapabilities::MULTIBYTE_NOP.bits()
            | CpuCapabilities::SSE_SIMD.bits()
            | CpuCapabilities::AMD_SMM_ICEBP.bits(),
    ),
    ..TRAITS_INTEL64
};

/// AMD Geode LX, representative of the Cyrix/NatSemi/AMD Geode lineage.
pub const TRAITS_GEODE_LX: CpuTraits = CpuTraits {
    family: CpuFamily::Cyrix,
    description: "AMD Geode LX",
    fpu_default: FpuType::Integrated,
    fpu_supported: &[FpuType::Integrated, FpuType::Emc87],
    smm_format: SmmFormat::CyrixGx2Lx,
    capabilities: CpuCapabilities::from_bits_truncate(
        CpuCapabilities::CPUID.bits()
            | CpuCapabilities::MULTIBYTE_NOP.bits()
            | CpuCapabilities::CYRIX_RDSHR.bits()
            | CpuCapabilities::CYRIX_MEDIAGX.bits()
            | CpuCapabilities::CYRIX_DMM.bits(),
    ),
    ..TRAITS_486
};

/// Centaur/VIA C3-lineage CPU with the alternate-instruction-set MSR.
pub const TRAITS_VIA: CpuTraits = CpuTraits {
    family: CpuFamily::Via,
    description: "VIA C3/C7 lineage",
    smm_format: SmmFormat::IntelP6,
    capabilities: CpuCapabilities::from_bits_truncate(
        CpuCapabilities::CPUID.bits()
            | CpuCapabilities::MULTIBYTE_NOP.bits()
            | CpuCapabilities::SSE_SIMD.bits()
            | CpuCapabilities::VIA_ALT_INST.bits(),
    ),
    ..TRAITS_486
};

/// Look up a trait record by an opaque numeric model id, the only indexing
/// scheme exposed across the host/core boundary (spec §6: "no CLI/config
/// surface, programmatic configuration only").
pub fn lookup(model_id: u32) -> Option<&'static CpuTraits> {
    MODEL_TABLE.get(model_id as usize).map(|(_, t)| t)
}

/// Stable table of (name, traits) pairs; index is the model id used by
/// [`lookup`].
pub static MODEL_TABLE: &[(&str, CpuTraits)] = &[
    ("8086", TRAITS_8086),
    ("v20", TRAITS_V20),
    ("upd9002", TRAITS_UPD9002),
    ("v25", TRAITS_V25),
    ("v55", TRAITS_V55),
    ("286", TRAITS_286),
    ("386", TRAITS_386),
    ("486", TRAITS_486),
    ("intel64", TRAITS_INTEL64),
    ("amd64", TRAITS_AMD64),
    ("geode_lx", TRAITS_GEODE_LX),
    ("via", TRAITS_VIA),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_roundtrips_model_table() {
        for (idx, (name, traits)) in MODEL_TABLE.iter().enumerate() {
            let found = lookup(idx as u32).unwrap_or_else(|| panic!("missing {name}"));
            assert_eq!(found, traits);
        }
    }

    #[test]
    fn lookup_out_of_range_is_none() {
        assert!(lookup(MODEL_TABLE.len() as u32).is_none());
    }

    #[test]
    fn pre_186_silicon_ignores_unknown_opcodes() {
        assert!(TRAITS_8086.silent_ignore_undefined);
        assert!(TRAITS_V20.silent_ignore_undefined);
        assert!(!TRAITS_386.silent_ignore_undefined);
    }

    #[test]
    fn requires_reflects_capability_gaps() {
        assert!(TRAITS_8086.requires(CpuCapabilities::CPUID));
        assert!(!TRAITS_INTEL64.requires(CpuCapabilities::CPUID));
    }
}
