//! Instruction decoder (component D, §4.3).
//!
//! A cursor over the byte stream rooted at CS:xIP produces a
//! [`DecodedInstruction`]: prefixes consumed, operand/address sizes
//! resolved, ModR/M and SIB decomposed into a fully-computed
//! [`MemOperand`], immediate/displacement bytes extracted. Grounded on the
//! teacher's `cpu/mod.rs` `step()` prefix-then-opcode loop (itself an
//! x/y/z/p/q decomposition of the Z80 opcode byte), generalized here to
//! x86's much larger prefix space: legacy prefixes, REX, and a single
//! two-byte (`0F`) escape map sufficient for the opcode set this crate
//! implements (VEX/XOP/EVEX/MVEX decode as unrecognized-prefix #UD on the
//! families that lack them, matching §4.1's gate-failure contract).

use crate::except::FaultInfo;
use crate::state::limits::MAX_INSTRUCTION_LEN;
use crate::state::registers::CpuMode;

/// REP-family prefix state (§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RepState {
    #[default]
    None,
    Repz,
    Repnz,
    /// NEC V-series REPC (repeat while carry).
    Repc,
    /// NEC V-series REPNC (repeat while not carry).
    Repnc,
}

/// SIMD-prefix class, tracked independently of the legacy operand-size
/// prefix per §4.3 ("in addition to operand-size tracking").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SimdPrefixClass {
    #[default]
    None,
    Opsize66,
    F3,
    F2,
}

/// A fully-resolved memory operand: segment, computed linear offset within
/// that segment, and whether the addressing form was IP-relative (§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemOperand {
    pub segment: usize,
    pub offset: u64,
    pub ip_relative: bool,
}

/// Decoded ModR/M, generalizing the teacher's single-byte opcode split into
/// x86's register/memory operand duality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RmOperand {
    Reg(usize),
    Mem(MemOperand),
}

/// Output of the decoder (§4.3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedInstruction {
    pub opcode_map: OpcodeMap,
    pub opcode: u8,
    pub length: usize,
    pub operand_size: u32,
    pub address_size: u32,
    pub segment_override: Option<usize>,
    pub rep: RepState,
    pub simd_prefix: SimdPrefixClass,
    pub lock: bool,
    pub rex_w: bool,
    pub modrm_reg: Option<usize>,
    pub rm: Option<RmOperand>,
    pub immediate: Option<u64>,
    pub disp: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpcodeMap {
    OneByte,
    TwoByte0f,
}

/// Host-supplied byte fetcher, backed by the prefetch queue / bus in
/// practice; kept generic here so the decoder has no `Bus` dependency of
/// its own (§4.3 "cursor never advances past a byte not successfully
/// fetched").
pub trait InstructionCursor {
    fn fetch_u8(&mut self) -> Result<u8, FaultInfo>;
}

/// V25 secure-mode (MD=0) substitutes the first opcode byte through an
/// external 256-entry table before decoding proceeds (§4.3).
pub type SecureModeTranslation = [u8; 256];

struct Prefixes {
    segment_override: Option<usize>,
    operand_size_override: bool,
    address_size_override: bool,
    rep: RepState,
    simd_prefix: SimdPrefixClass,
    lock: bool,
    rex: Option<u8>,
}

fn decode_prefixes<C: InstructionCursor>(
    cursor: &mut C,
    mode: CpuMode,
    length: &mut usize,
) -> Result<(Prefixes, u8), FaultInfo> {
    use crate::state::registers::sreg;

    let mut p = Prefixes {
        segment_override: None,
        operand_size_override: false,
        address_size_override: false,
        rep: RepState::None,
        simd_prefix: SimdPrefixClass::None,
        lock: false,
        rex: None,
    };

    loop {
        if *length >= MAX_INSTRUCTION_LEN {
            return Err(FaultInfo::general_protection(0));
        }
        let byte = cursor.fetch_u8()?;
        *length += 1;
        match byte {
            0x26 => p.segment_override = Some(sreg::ES),
            0x2E => p.segment_override = Some(sreg::CS),
            0x36 => p.segment_override = Some(sreg::SS),
            0x3E => p.segment_override = Some(sreg::DS),
            0x64 => p.segment_override = Some(sreg::FS),
            0x65 => p.segment_override = Some(sreg::GS),
            0x66 => {
                p.operand_size_override = true;
                p.simd_prefix = SimdPrefixClass::Opsize66;
            }
            0x67 => p.address_size_override = true,
            0xF0 => p.lock = true,
            0xF2 => {
                p.rep = RepState::Repnz;
                p.simd_prefix = SimdPrefixClass::F2;
            }
            0xF3 => {
                p.rep = RepState::Repz;
                p.simd_prefix = SimdPrefixClass::F3;
            }
            // REX is accepted only in 64-bit code; elsewhere it decodes as
            // its corresponding one-byte opcode (INC/DEC r16/32 in legacy
            // encodings), per §4.3's parser invariant.
            0x40..=0x4F if mode == CpuMode::Long64 => {
                p.rex = Some(byte);
                return Ok((p, cursor.fetch_u8().map(|b| {
                    *length += 1;
                    b
                })?));
            }
            other => return Ok((p, other)),
        }
    }
}

fn resolve_sizes(mode: CpuMode, p: &Prefixes) -> (u32, u32) {
    let default_op = mode.default_operand_bits();
    let default_addr = match mode {
        CpuMode::Real | CpuMode::Virtual8086 => 16,
        CpuMode::Protected16 => 16,
        CpuMode::Protected32 | CpuMode::Compatibility => 32,
        CpuMode::Long64 => 64,
    };
    let mut operand_size = if p.operand_size_override { if default_op == 16 { 32 } else { 16 } } else { default_op };
    if mode == CpuMode::Long64 && p.rex.map(|r| r & 0x08 != 0).unwrap_or(false) {
        operand_size = 64;
    }
    let address_size = if p.address_size_override { if default_addr == 16 { 32 } else { default_addr / 2 } } else { default_addr };
    (operand_size, address_size)
}

/// Decode ModR/M (and SIB, for 32/64-bit addressing) into a register field
/// plus an [`RmOperand`], consuming displacement bytes as needed. 16-bit
/// addressing follows the classic BX/BP+SI/DI table; 32/64-bit addressing
/// follows the SIB-extended table.
fn decode_modrm<C: InstructionCursor>(
    cursor: &mut C,
    regs: &crate::state::registers::RegisterFile,
    address_size: u32,
    default_data_segment_override: Option<usize>,
    length: &mut usize,
) -> Result<(usize, RmOperand, Option<i64>), FaultInfo> {
    use crate::state::registers::{gpr, sreg};

    let modrm = cursor.fetch_u8()?;
    *length += 1;
    let md = modrm >> 6;
    let reg = ((modrm >> 3) & 0x7) as usize;
    let rm = (modrm & 0x7) as usize;

    if md == 3 {
        return Ok((reg, RmOperand::Reg(rm), None));
    }

    if address_size == 16 {
        let (base_sum, seg): (u16, usize) = match rm {
            0 => (regs.reg16(gpr::BX).wrapping_add(regs.reg16(gpr::SI)), sreg::DS),
            1 => (regs.reg16(gpr::BX).wrapping_add(regs.reg16(gpr::DI)), sreg::DS),
            2 => (regs.reg16(gpr::BP).wrapping_add(regs.reg16(gpr::SI)), sreg::SS),
            3 => (regs.reg16(gpr::BP).wrapping_add(regs.reg16(gpr::DI)), sreg::SS),
            4 => (regs.reg16(gpr::SI), sreg::DS),
            5 => (regs.reg16(gpr::DI), sreg::DS),
            6 if md != 0 => (regs.reg16(gpr::BP), sreg::SS),
            7 => (regs.reg16(gpr::BX), sreg::DS),
            _ => (0, sreg::DS), // rm==6, md==0: disp16-only, no base.
        };
        let disp = match md {
            0 if rm == 6 => {
                let lo = cursor.fetch_u8()? as u16;
                let hi = cursor.fetch_u8()? as u16;
                *length += 2;
                ((hi << 8 | lo) as i16) as i64
            }
            1 => {
                let d = cursor.fetch_u8()? as i8;
                *length += 1;
                d as i64
            }
            2 => {
                let lo = cursor.fetch_u8()? as u16;
                let hi = cursor.fetch_u8()? as u16;
                *length += 2;
                ((hi << 8 | lo) as i16) as i64
            }
            _ => 0,
        };
        let offset = (base_sum as i64).wrapping_add(disp) as u16;
        let segment = default_data_segment_override.unwrap_or(seg);
        let mem = MemOperand { segment, offset: offset as u64, ip_relative: false };
        return Ok((reg, RmOperand::Mem(mem), Some(disp)));
    }

    // 32/64-bit addressing: SIB byte on rm==4, RIP-relative on md==0,rm==5.
    let mut seg = sreg::DS;
    let mut disp32_only = false;
    let (mut base_sum, ip_relative) = if rm == 4 {
        let sib = cursor.fetch_u8()?;
        *length += 1;
        let scale = 1u64 << (sib >> 6);
        let index = ((sib >> 3) & 0x7) as usize;
        let base = (sib & 0x7) as usize;
        let index_val = if index == 4 { 0 } else { regs.reg32(index) as u64 };
        let base_val = if base == 5 && md == 0 {
            disp32_only = true;
            0 // disp32 follows, no base register.
        } else {
            if base == gpr::SP {
                seg = sreg::SS;
            }
            regs.reg32(base) as u64
        };
        (base_val.wrapping_add(index_val.wrapping_mul(scale)), false)
    } else if md == 0 && rm == 5 {
        (0, true)
    } else {
        if rm == gpr::BP {
            seg = sreg::SS;
        }
        (regs.reg32(rm) as u64, false)
    };

    let disp = match md {
        0 if rm == 5 || disp32_only => {
            let mut bytes = [0u8; 4];
            for b in bytes.iter_mut() {
                *b = cursor.fetch_u8()?;
            }
            *length += 4;
            i32::from_le_bytes(bytes) as i64
        }
        1 => {
            let d = cursor.fetch_u8()? as i8;
            *length += 1;
            d as i64
        }
        2 => {
            let mut bytes = [0u8; 4];
            for b in bytes.iter_mut() {
                *b = cursor.fetch_u8()?;
            }
            *length += 4;
            i32::from_le_bytes(bytes) as i64
        }
        _ => 0,
    };
    base_sum = (base_sum as i64).wrapping_add(disp) as u64;
    if ip_relative {
        base_sum = base_sum.wrapping_add(regs.xip);
    }

    let segment = default_data_segment_override.unwrap_or(seg);
    let mem = MemOperand { segment, offset: base_sum, ip_relative };
    Ok((reg, RmOperand::Mem(mem), Some(disp)))
}

/// Decode one instruction. `secure_translation` is `Some` only when the
/// model is MD=0 (secure mode); the first opcode byte passes through it
/// before dispatch (§4.3).
pub fn decode<C: InstructionCursor>(
    cursor: &mut C,
    regs: &crate::state::registers::RegisterFile,
    mode: CpuMode,
    secure_translation: Option<&SecureModeTranslation>,
) -> Result<DecodedInstruction, FaultInfo> {
    let mut length = 0usize;
    let (prefixes, mut opcode) = decode_prefixes(cursor, mode, &mut length)?;

    if let Some(table) = secure_translation {
        opcode = table[opcode as usize];
    }

    let (operand_size, address_size) = resolve_sizes(mode, &prefixes);

    let (opcode_map, opcode) = if opcode == 0x0F {
        if length >= MAX_INSTRUCTION_LEN {
            return Err(FaultInfo::general_protection(0));
        }
        let b = cursor.fetch_u8()?;
        length += 1;
        (OpcodeMap::TwoByte0f, b)
    } else {
        (OpcodeMap::OneByte, opcode)
    };

    let has_modrm = opcode_has_modrm(opcode_map, opcode);
    let (modrm_reg, rm, disp) = if has_modrm {
        let (reg, rm, disp) = decode_modrm(cursor, regs, address_size, prefixes.segment_override, &mut length)?;
        (Some(reg), Some(rm), disp)
    } else {
        (None, None, None)
    };

    let immediate = decode_immediate(cursor, opcode_map, opcode, operand_size, &mut length)?;

    if length > MAX_INSTRUCTION_LEN {
        return Err(FaultInfo::general_protection(0));
    }

    Ok(DecodedInstruction {
        opcode_map,
        opcode,
        length,
        operand_size,
        address_size,
        segment_override: prefixes.segment_override,
        rep: prefixes.rep,
        simd_prefix: prefixes.simd_prefix,
        lock: prefixes.lock,
        rex_w: prefixes.rex.map(|r| r & 0x08 != 0).unwrap_or(false),
        modrm_reg,
        rm,
        immediate,
        disp,
    })
}

/// Minimal opcode table covering the instruction set this crate's
/// executor implements. A fully general implementation would index a
/// per-generation dispatch array (§9 "per-generation dispatch table");
/// this crate's `exec` module plays that role for the opcodes named here.
fn opcode_has_modrm(map: OpcodeMap, opcode: u8) -> bool {
    match map {
        OpcodeMap::OneByte => matches!(
            opcode,
            0x00..=0x03 | 0x08..=0x0B | 0x10..=0x13 | 0x18..=0x1B | 0x20..=0x23 | 0x28..=0x2B | 0x30..=0x33 | 0x38..=0x3B
                | 0x84 | 0x85 | 0x88..=0x8B | 0x8D | 0x8F | 0xC0 | 0xC1 | 0xC6 | 0xC7 | 0xD0..=0xD3 | 0xF6 | 0xF7
                | 0xFE | 0xFF | 0x80 | 0x81 | 0x83
        ),
        // No two-byte-map opcodes are implemented by `exec` yet; treat the
        // whole map as immediate-only until one needs a ModR/M operand.
        OpcodeMap::TwoByte0f => false,
    }
}

fn decode_immediate<C: InstructionCursor>(
    cursor: &mut C,
    map: OpcodeMap,
    opcode: u8,
    operand_size: u32,
    length: &mut usize,
) -> Result<Option<u64>, FaultInfo> {
    if map == OpcodeMap::TwoByte0f {
        return Ok(None);
    }
    let imm_len: usize = match opcode {
        0x04 | 0x0C | 0x14 | 0x1C | 0x24 | 0x2C | 0x34 | 0x3C | 0xA8 | 0xB0..=0xB7 | 0xC6 | 0xCD | 0x6A => 1,
        0x05 | 0x0D | 0x15 | 0x1D | 0x25 | 0x2D | 0x35 | 0x3D | 0xA9 | 0xC7 | 0x68 => {
            if operand_size == 16 {
                2
            } else {
                4
            }
        }
        0xB8..=0xBF => (operand_size / 8) as usize,
        0x80 | 0x83 | 0xC0 | 0xC1 => 1,
        0xC2 => 2,
        0x81 => {
            if operand_size == 16 {
                2
            } else {
                4
            }
        }
        0xE8 | 0xE9 => {
            if operand_size == 16 {
                2
            } else {
                4
            }
        }
        0xEB | 0x70..=0x7F | 0xE0..=0xE2 => 1,
        _ => 0,
    };
    if imm_len == 0 {
        return Ok(None);
    }
    let mut value = 0u64;
    for i in 0..imm_len {
        let b = cursor.fetch_u8()?;
        *length += 1;
        value |= (b as u64) << (i * 8);
    }
    // Sign-extend single/word immediates used as signed displacements so
    // callers can reinterpret as needed; raw bits are preserved otherwise.
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::state::registers::RegisterFile;

    struct SliceCursor<'a> {
        bytes: &'a [u8],
        pos: usize,
    }
    impl<'a> InstructionCursor for SliceCursor<'a> {
        fn fetch_u8(&mut self) -> Result<u8, FaultInfo> {
            let b = *self.bytes.get(self.pos).ok_or_else(|| FaultInfo::general_protection(0))?;
            self.pos += 1;
            Ok(b)
        }
    }

    #[test]
    fn decodes_add_ax_cx_modrm() {
        let mut cur = SliceCursor { bytes: &[0x01, 0xC8], pos: 0 };
        let d = decode(&mut cur, &RegisterFile::default(), CpuMode::Real, None).unwrap();
        assert_eq!(d.opcode, 0x01);
        assert_eq!(d.length, 2);
        assert_eq!(d.modrm_reg, Some(1)); // CX
        assert_eq!(d.rm, Some(RmOperand::Reg(0))); // AX
    }

    #[test]
    fn decodes_rep_movsb() {
        let mut cur = SliceCursor { bytes: &[0xF3, 0xA4], pos: 0 };
        let d = decode(&mut cur, &RegisterFile::default(), CpuMode::Real, None).unwrap();
        assert_eq!(d.opcode, 0xA4);
        assert_eq!(d.rep, RepState::Repz);
        assert_eq!(d.length, 2);
    }

    #[test]
    fn decodes_div_cx_group_f7() {
        let mut cur = SliceCursor { bytes: &[0xF7, 0xF1], pos: 0 };
        let d = decode(&mut cur, &RegisterFile::default(), CpuMode::Real, None).unwrap();
        assert_eq!(d.opcode, 0xF7);
        assert_eq!(d.modrm_reg, Some(6)); // /6 = DIV
        assert_eq!(d.rm, Some(RmOperand::Reg(1))); // CX
    }

    #[test]
    fn decodes_int_imm8() {
        let mut cur = SliceCursor { bytes: &[0xCD, 0xFF], pos: 0 };
        let d = decode(&mut cur, &RegisterFile::default(), CpuMode::Real, None).unwrap();
        assert_eq!(d.opcode, 0xCD);
        assert_eq!(d.immediate, Some(0xFF));
    }

    #[test]
    fn secure_mode_translation_substitutes_first_byte() {
        let mut table = [0u8; 256];
        for (i, b) in table.iter_mut().enumerate() {
            *b = i as u8;
        }
        table[0x90] = 0xF4; // NOP -> HLT
        let mut cur = SliceCursor { bytes: &[0x90], pos: 0 };
        let d = decode(&mut cur, &RegisterFile::default(), CpuMode::Real, Some(&table)).unwrap();
        assert_eq!(d.opcode, 0xF4);
    }

    #[test]
    fn instruction_longer_than_15_bytes_faults() {
        let mut bytes = vec![0x66u8; 20];
        bytes.push(0x90);
        let mut cur = SliceCursor { bytes: &bytes, pos: 0 };
        let err = decode(&mut cur, &RegisterFile::default(), CpuMode::Real, None).unwrap_err();
        assert_eq!(err.vector, FaultInfo::GENERAL_PROTECTION);
    }
}
