//! GPR bank, xIP/xSP, segment/table register caches, and the control set
//! (component B). Grounded on the teacher's `cpu/mod.rs` register struct and
//! `cpu/helpers.rs` sub-register accessors, generalized from the eZ80's
//! fixed 8/16/24-bit views to x86's 8/16/32/64-bit partial-register rules
//! (§9 "bit-packed unions over register views": reproduced as pure
//! functions over a 64-bit cell rather than memory overlays).

use super::limits::{CR_COUNT, DR_COUNT, GPR_COUNT, SR_COUNT, TABLEREG_COUNT, TR386_COUNT};

/// Index of the legacy GPRs, for readability at call sites.
pub mod gpr {
    pub const AX: usize = 0;
    pub const CX: usize = 1;
    pub const DX: usize = 2;
    pub const BX: usize = 3;
    pub const SP: usize = 4;
    pub const BP: usize = 5;
    pub const SI: usize = 6;
    pub const DI: usize = 7;
}

/// Index of the architectural segment registers.
pub mod sreg {
    pub const ES: usize = 0;
    pub const CS: usize = 1;
    pub const SS: usize = 2;
    pub const DS: usize = 3;
    pub const DS3: usize = 4;
    pub const DS2: usize = 5;
    pub const FS: usize = 6;
    pub const GS: usize = 7;
}

/// One general-purpose register cell and its partial-width views.
///
/// Write rules (§3): a 32-bit write zero-extends to the full 64-bit cell; a
/// 16-bit or 8-bit write preserves the untouched upper bits. The AH/BH/CH/DH
/// high-byte aliases address bits 8..15 of the first four cells; that
/// aliasing is modelled by [`GprBank::write8_high`]/`read8_high` rather than
/// overlapping storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GprCell(u64);

impl GprCell {
    #[inline]
    pub fn read64(&self) -> u64 {
        self.0
    }
    #[inline]
    pub fn read32(&self) -> u32 {
        self.0 as u32
    }
    #[inline]
    pub fn read16(&self) -> u16 {
        self.0 as u16
    }
    #[inline]
    pub fn read8_low(&self) -> u8 {
        self.0 as u8
    }
    #[inline]
    pub fn read8_high(&self) -> u8 {
        (self.0 >> 8) as u8
    }

    #[inline]
    pub fn write64(&mut self, v: u64) {
        self.0 = v;
    }
    #[inline]
    pub fn write32(&mut self, v: u32) {
        // Zero-extends to 64 bits per the x86-64 partial-write rule.
        self.0 = v as u64;
    }
    #[inline]
    pub fn write16(&mut self, v: u16) {
        self.0 = (self.0 & !0xFFFF) | v as u64;
    }
    #[inline]
    pub fn write8_low(&mut self, v: u8) {
        self.0 = (self.0 & !0xFF) | v as u64;
    }
    #[inline]
    pub fn write8_high(&mut self, v: u8) {
        self.0 = (self.0 & !0xFF00) | ((v as u64) << 8);
    }
}

/// Hidden segment descriptor cache, authoritative for translation once a
/// selector load has refilled it (§3, §4.5 invariant).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DescriptorCache {
    pub base: u64,
    pub limit: u32,
    pub access: u16,
    /// Whether this cache reflects a successfully loaded selector (vs. the
    /// power-on default, which real mode uses verbatim without a "load").
    pub valid: bool,
}

/// One architectural segment register: visible selector plus hidden cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SegmentRegister {
    pub selector: u16,
    pub cache: DescriptorCache,
}

/// GDTR/IDTR/LDTR/TR: base+limit pair (LDTR/TR additionally carry a selector
/// but share the same physical layout for this model).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TableRegister {
    pub selector: u16,
    pub base: u64,
    pub limit: u32,
}

/// The named table register slots.
pub mod tablereg {
    pub const GDTR: usize = 0;
    pub const IDTR: usize = 1;
    pub const LDTR: usize = 2;
    pub const TR: usize = 3;
}

/// Operating mode, determines effective widths and the xIP/xSP views.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuMode {
    Real,
    Virtual8086,
    Protected16,
    Protected32,
    Compatibility,
    Long64,
}

impl CpuMode {
    pub fn default_operand_bits(&self) -> u32 {
        match self {
            CpuMode::Real | CpuMode::Virtual8086 | CpuMode::Protected16 => 16,
            CpuMode::Protected32 | CpuMode::Compatibility => 32,
            CpuMode::Long64 => 32, // 64-bit only via REX.W, per SDM.
        }
    }
}

bitflags::bitflags! {
    /// CR0 control bits actually consulted by the engine.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Cr0Flags: u64 {
        const PE = 1 << 0;
        const MP = 1 << 1;
        const EM = 1 << 2;
        const TS = 1 << 3;
        const ET = 1 << 4;
        const NE = 1 << 5;
        const WP = 1 << 16;
        const AM = 1 << 18;
        const NW = 1 << 29;
        const CD = 1 << 30;
        const PG = 1 << 31;
    }

    /// CR4 control bits actually consulted by the engine.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Cr4Flags: u64 {
        const VME = 1 << 0;
        const PVI = 1 << 1;
        const TSD = 1 << 2;
        const DE  = 1 << 3;
        const PSE = 1 << 4;
        const PAE = 1 << 5;
        const MCE = 1 << 6;
        const PGE = 1 << 7;
        const OSFXSR = 1 << 9;
        const LA57 = 1 << 12;
        const SMEP = 1 << 20;
        const SMAP = 1 << 21;
    }

    /// EFER bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EferFlags: u64 {
        const SCE = 1 << 0;
        const LME = 1 << 8;
        const LMA = 1 << 10;
        const NXE = 1 << 11;
    }

    /// DR7 debug-control bits (per-breakpoint R/W and LEN nibbles packed
    /// architecturally, §6.d).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Dr7Flags: u64 {
        const L0 = 1 << 0;
        const G0 = 1 << 1;
        const L1 = 1 << 2;
        const G1 = 1 << 3;
        const L2 = 1 << 4;
        const G2 = 1 << 5;
        const L3 = 1 << 6;
        const G3 = 1 << 7;
        const LE = 1 << 8;
        const GE = 1 << 9;
    }

    /// MXCSR SSE control/status bits (rounding-control field excluded; it's
    /// a 2-bit value, not a flag, see [`ControlSet::mxcsr_rounding_control`]).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MxcsrFlags: u32 {
        const IE = 1 << 0;
        const DE = 1 << 1;
        const ZE = 1 << 2;
        const OE = 1 << 3;
        const UE = 1 << 4;
        const PE = 1 << 5;
        const DAZ = 1 << 6;
        const IM = 1 << 7;
        const DM = 1 << 8;
        const ZM = 1 << 9;
        const OM = 1 << 10;
        const UM = 1 << 11;
        const PM = 1 << 12;
        const FZ = 1 << 15;
    }
}

/// A named architectural MSR. Only the ones the spec names (§3) are given
/// symbolic slots; the rest of the ~80-entry bank is addressed by raw index.
pub mod msr {
    pub const TSC: usize = 0;
    pub const SYSENTER_CS: usize = 1;
    pub const SYSENTER_ESP: usize = 2;
    pub const SYSENTER_EIP: usize = 3;
    pub const STAR: usize = 4;
    pub const LSTAR: usize = 5;
    pub const CSTAR: usize = 6;
    pub const SF_MASK: usize = 7;
    pub const FS_BASE: usize = 8;
    pub const GS_BASE: usize = 9;
    pub const KERNEL_GS_BASE: usize = 10;
    pub const MSR_COUNT: usize = 80;
}

/// The control set: CRs, DRs, TR386 bank, EFER, XCR0, MXCSR, MSRs (§3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlSet {
    pub cr: [u64; CR_COUNT],
    pub dr: [u64; DR_COUNT],
    pub tr386: [u64; TR386_COUNT],
    pub efer: u64,
    pub xcr0: u64,
    pub mxcsr: u32,
    pub msr: [u64; msr::MSR_COUNT],
}

impl Default for ControlSet {
    fn default() -> Self {
        Self {
            cr: [0; CR_COUNT],
            dr: [0; DR_COUNT],
            tr386: [0; TR386_COUNT],
            efer: 0,
            xcr0: 1, // x87 state component always enabled.
            mxcsr: 0x1F80, // Power-on default per SDM.
            msr: [0; msr::MSR_COUNT],
        }
    }
}

impl ControlSet {
    pub fn cr0(&self) -> Cr0Flags {
        Cr0Flags::from_bits_truncate(self.cr[0])
    }
    pub fn set_cr0(&mut self, flags: Cr0Flags) {
        self.cr[0] = flags.bits();
    }
    pub fn cr4(&self) -> Cr4Flags {
        Cr4Flags::from_bits_truncate(self.cr[4])
    }
    pub fn set_cr4(&mut self, flags: Cr4Flags) {
        self.cr[4] = flags.bits();
    }
    pub fn efer_flags(&self) -> EferFlags {
        EferFlags::from_bits_truncate(self.efer)
    }
    pub fn dr7(&self) -> Dr7Flags {
        Dr7Flags::from_bits_truncate(self.dr[7])
    }
    pub fn mxcsr_flags(&self) -> MxcsrFlags {
        MxcsrFlags::from_bits_truncate(self.mxcsr)
    }
    pub fn set_mxcsr_flags(&mut self, flags: MxcsrFlags) {
        self.mxcsr = (self.mxcsr & !MxcsrFlags::all().bits()) | flags.bits();
    }
    /// MXCSR.RC, bits 13..14 (not a flag; a 2-bit rounding-control field).
    pub fn mxcsr_rounding_control(&self) -> u8 {
        ((self.mxcsr >> 13) & 0b11) as u8
    }
}

/// The GPR bank, segment/table caches, and xIP (component B core).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterFile {
    pub gpr: [GprCell; GPR_COUNT],
    pub seg: [SegmentRegister; SR_COUNT],
    pub table: [TableRegister; TABLEREG_COUNT],
    /// Instruction pointer, width-interpreted per current mode.
    pub xip: u64,
    /// Value of `xip` before the current instruction began; restored on a
    /// `fault`-class exception (§8 universal invariant).
    pub old_xip: u64,
    pub mode: CpuMode,
}

impl Default for RegisterFile {
    fn default() -> Self {
        Self {
            gpr: [GprCell::default(); GPR_COUNT],
            seg: [SegmentRegister::default(); SR_COUNT],
            table: [TableRegister::default(); TABLEREG_COUNT],
            xip: 0,
            old_xip: 0,
            mode: CpuMode::Real,
        }
    }
}

impl RegisterFile {
    /// Snapshot `xip` into `old_xip`; called at the start of every `step`
    /// (§4.2, §8).
    pub fn begin_instruction(&mut self) {
        self.old_xip = self.xip;
    }

    /// Restore `xip` to the value it held before the current instruction;
    /// used on a `fault`-class exception (§7, §8).
    pub fn restart_at_old_xip(&mut self) {
        self.xip = self.old_xip;
    }

    pub fn reg8_low(&self, idx: usize) -> u8 {
        self.gpr[idx].read8_low()
    }
    pub fn set_reg8_low(&mut self, idx: usize, v: u8) {
        self.gpr[idx].write8_low(v);
    }
    /// AH/BH/CH/DH: bits 8..15 of the first four cells only (§3).
    pub fn reg8_high(&self, idx: usize) -> u8 {
        debug_assert!(idx < 4, "high-byte aliases only exist for AX..BX");
        self.gpr[idx].read8_high()
    }
    pub fn set_reg8_high(&mut self, idx: usize, v: u8) {
        debug_assert!(idx < 4, "high-byte aliases only exist for AX..BX");
        self.gpr[idx].write8_high(v);
    }
    pub fn reg16(&self, idx: usize) -> u16 {
        self.gpr[idx].read16()
    }
    pub fn set_reg16(&mut self, idx: usize, v: u16) {
        self.gpr[idx].write16(v);
    }
    pub fn reg32(&self, idx: usize) -> u32 {
        self.gpr[idx].read32()
    }
    pub fn set_reg32(&mut self, idx: usize, v: u32) {
        self.gpr[idx].write32(v);
    }
    pub fn reg64(&self, idx: usize) -> u64 {
        self.gpr[idx].read64()
    }
    pub fn set_reg64(&mut self, idx: usize, v: u64) {
        self.gpr[idx].write64(v);
    }

    /// Destroy and rebuild a segment register's descriptor cache on a
    /// successful selector load (§3, §4.5, §8 invariant).
    pub fn load_segment(&mut self, idx: usize, selector: u16, cache: DescriptorCache) {
        self.seg[idx] = SegmentRegister {
            selector,
            cache: DescriptorCache { valid: true, ..cache },
        };
    }

    /// Long mode forces base=0/limit=max for DS/ES/SS while FS/GS keep their
    /// MSR-sourced bases (§4.5).
    pub fn enter_long_mode_segment_defaults(&mut self) {
        for idx in [sreg::DS, sreg::ES, sreg::SS] {
            self.seg[idx].cache.base = 0;
            self.seg[idx].cache.limit = u32::MAX;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_writes_follow_x86_64_rules() {
        let mut cell = GprCell::default();
        cell.write64(0xFFFF_FFFF_FFFF_FFFF);
        cell.write32(0x1234_5678);
        assert_eq!(cell.read64(), 0x0000_0000_1234_5678, "32-bit write zero-extends");

        cell.write64(0xFFFF_FFFF_FFFF_FFFF);
        cell.write16(0xBEEF);
        assert_eq!(cell.read64(), 0xFFFF_FFFF_FFFF_BEEF, "16-bit write preserves upper bits");

        cell.write64(0xFFFF_FFFF_FFFF_FFFF);
        cell.write8_low(0x42);
        assert_eq!(cell.read64(), 0xFFFF_FFFF_FFFF_FF42);
    }

    #[test]
    fn ah_bh_ch_dh_alias_bits_8_15() {
        let mut rf = RegisterFile::default();
        rf.set_reg16(gpr::AX, 0x1234);
        assert_eq!(rf.reg8_high(gpr::AX), 0x12);
        assert_eq!(rf.reg8_low(gpr::AX), 0x34);
        rf.set_reg8_high(gpr::AX, 0xAB);
        assert_eq!(rf.reg16(gpr::AX), 0xAB34);
    }

    #[test]
    fn segment_load_rebuilds_cache() {
        let mut rf = RegisterFile::default();
        assert!(!rf.seg[sreg::DS].cache.valid);
        rf.load_segment(
            sreg::DS,
            0x18,
            DescriptorCache { base: 0x1000, limit: 0xFFFF, access: 0x93, valid: false },
        );
        assert!(rf.seg[sreg::DS].cache.valid);
        assert_eq!(rf.seg[sreg::DS].cache.base, 0x1000);
    }

    #[test]
    fn mxcsr_flags_round_trip_independently_of_rounding_control() {
        let mut control = ControlSet::default();
        control.mxcsr = 0x1F80; // power-on default: all exception masks set, RC=0
        assert!(control.mxcsr_flags().contains(MxcsrFlags::IM | MxcsrFlags::DM));
        control.set_mxcsr_flags(control.mxcsr_flags() | MxcsrFlags::FZ);
        assert!(control.mxcsr_flags().contains(MxcsrFlags::FZ));
        assert_eq!(control.mxcsr_rounding_control(), 0);
    }

    #[test]
    fn begin_instruction_then_restart_restores_xip() {
        let mut rf = RegisterFile::default();
        rf.xip = 0x100;
        rf.begin_instruction();
        rf.xip = 0x105; // decoder advanced past a 5-byte instruction.
        rf.restart_at_old_xip();
        assert_eq!(rf.xip, 0x100);
    }
}
