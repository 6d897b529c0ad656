//! Per-opcode semantics and the `step()` contract (component E, §4.2).
//!
//! Grounded on the teacher's `cpu/execute.rs`/`cpu/helpers.rs`
//! dispatch-by-decoded-field style: `execute()` there switches on the `x/y/z`
//! fields the Z80 opcode decomposes into and calls small per-operation
//! helpers that read/write through the register file. Here the switch is on
//! `(opcode_map, opcode)` from the x86 [`crate::parser::DecodedInstruction`]
//! and the helpers commit through [`crate::mmu`]/[`crate::bus`] instead of a
//! flat array, per §9's "per-generation dispatch table" design note. Covers
//! the core integer ALU/data-movement/control-flow surface (ALU group,
//! MOV/PUSH/POP/PUSHA/POPA, Jcc/CALL/JMP/RET/IRET, the shift/rotate and
//! imm-ALU groups, Group3 and Group5, string MOVS, INT/ICEBP, legacy
//! SYSRET/SYSEXIT); opcodes this crate has no architectural model for (most
//! of the two-byte SSE/AVX surface, far CALL/JMP through descriptor tables)
//! raise `#UD`, or are silently ignored on pre-186 traits per §4.1.

pub mod alu;

use crate::bus::{AccessKind, AccessLevel, Bus};
use crate::error::CoreError;
use crate::except::{self, FaultInfo};
use crate::mmu;
use crate::parser::{self, DecodedInstruction, InstructionCursor, OpcodeMap, RepState, RmOperand, SecureModeTranslation};
use crate::state::registers::sreg;
use crate::state::{CpuState, RunState};

/// Result tag of one `step()` call (§4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Success,
    StringContinue,
    Halt,
    CpuInterrupt(u32),
    IceInterrupt,
    Irq(u32),
    TripleFault,
    InhibitInterrupts,
    Undefined,
}

struct BusCursor<'s, 'b, B: Bus + ?Sized> {
    state: &'s CpuState,
    bus: &'b mut B,
    linear: u64,
}

impl<'s, 'b, B: Bus + ?Sized> InstructionCursor for BusCursor<'s, 'b, B> {
    fn fetch_u8(&mut self) -> Result<u8, FaultInfo> {
        let phys = mmu::translate(self.state, self.bus, self.linear, AccessKind::Fetch)?;
        let mut buf = [0u8; 1];
        self.bus.mem_read(AccessLevel::from(self.state.exec.cpu_level), phys, &mut buf)?;
        mmu::mark_accessed_dirty(self.state, self.bus, self.linear, false)?;
        self.linear = self.linear.wrapping_add(1);
        Ok(buf[0])
    }
}

/// One architectural instruction at most is retired per call (§4.2).
pub fn step<B: Bus + ?Sized>(
    state: &mut CpuState,
    bus: &mut B,
    secure_translation: Option<&SecureModeTranslation>,
) -> Result<StepOutcome, CoreError> {
    state.regs.begin_instruction();

    if state.exec.state == RunState::Halted || state.exec.state == RunState::Stopped {
        return Ok(StepOutcome::Halt);
    }

    if state.traits.has_emulation_mode && z80_mode_active(state) {
        let outcome = step_z80(state, bus);
        if state.traits.has_register_banks {
            sync_register_bank(state);
        }
        return Ok(outcome);
    }

    let cs_base = match mmu::linear_address(state, sreg::CS, state.regs.xip, 1, AccessKind::Fetch) {
        Ok(l) => l,
        Err(fault) => return Ok(deliver_fault(state, bus, fault)),
    };

    let mode = state.regs.mode;
    let decode_result = {
        let mut cursor = BusCursor { state: &*state, bus: &mut *bus, linear: cs_base };
        parser::decode(&mut cursor, &state.regs, mode, secure_translation)
    };
    let decoded = match decode_result {
        Ok(d) => d,
        Err(fault) => return Ok(deliver_fault(state, bus, fault)),
    };

    state.regs.xip = state.regs.xip.wrapping_add(decoded.length as u64);

    let result = match dispatch(state, bus, &decoded) {
        Ok(outcome) => Ok(outcome),
        Err(DispatchError::Fault(fault)) => Ok(deliver_fault(state, bus, fault)),
        Err(DispatchError::Core(e)) => Err(e),
    };

    if state.traits.has_register_banks {
        sync_register_bank(state);
    }

    result
}

/// Keep the active V25/V55 register bank's memory-mapped slots consistent
/// with the architectural GPR/flags/PC file after every retired instruction
/// (§8 bank-sync invariant: either side can be written during the
/// instruction, so the two must be reconciled at the boundary).
fn sync_register_bank(state: &mut CpuState) {
    use crate::state::registers::gpr;
    let aw = state.regs.reg16(gpr::AX);
    let cw = state.regs.reg16(gpr::CX);
    let dw = state.regs.reg16(gpr::DX);
    let bw = state.regs.reg16(gpr::BX);
    let sp = state.regs.reg16(gpr::SP);
    let psw = state.flags.to_bits() as u8;
    let pc = state.regs.xip as u32;
    state.banks.sync_from_architectural(aw, cw, dw, bw, sp, psw, pc);
}

/// Whether the 8080/Z80 emulation path should handle this step instead of
/// the native x86 pipeline (§4.6 MD flag). MD=0 means emulation mode on
/// V20/µPD9002; the `Extended` family inverts that polarity per
/// [`crate::state::CpuState::md_enabled`]'s own doc comment.
fn z80_mode_active(state: &CpuState) -> bool {
    let inverted = state.traits.family == crate::traits::CpuFamily::Extended;
    if inverted {
        state.md_enabled
    } else {
        !state.md_enabled
    }
}

/// Advance the 8080/Z80 emulation path by one guest instruction. Addressing
/// is flat 16-bit (the teacher crate's own eZ80 addressing style, §4.6): no
/// x86 segmentation or paging applies while MD indicates emulation mode.
/// Bus faults here are out of this crate's Z80 modeling scope and are
/// surfaced as an undefined step rather than as a guest-visible exception.
fn step_z80<B: Bus + ?Sized>(state: &mut CpuState, bus: &mut B) -> StepOutcome {
    let level = AccessLevel::from(state.exec.cpu_level);
    let opcode = match fetch_z80_byte(state, bus, level) {
        Some(b) => b,
        None => return StepOutcome::Undefined,
    };
    match opcode {
        0x00 => StepOutcome::Success,
        0x76 => {
            state.exec.state = RunState::Halted;
            StepOutcome::Halt
        }
        0xF3 => {
            state.z80.iff1 = false;
            state.z80.iff2 = false;
            StepOutcome::Success
        }
        0xFB => {
            state.z80.iff1 = true;
            state.z80.iff2 = true;
            StepOutcome::Success
        }
        0x08 => {
            state.z80.ex_af();
            StepOutcome::Success
        }
        0xD9 => {
            state.z80.exx();
            StepOutcome::Success
        }
        0xC3 => {
            let lo = match fetch_z80_byte(state, bus, level) {
                Some(b) => b,
                None => return StepOutcome::Undefined,
            };
            let hi = match fetch_z80_byte(state, bus, level) {
                Some(b) => b,
                None => return StepOutcome::Undefined,
            };
            state.z80.pc = (lo as u16) | ((hi as u16) << 8);
            StepOutcome::Success
        }
        0x06 | 0x0E | 0x16 | 0x1E | 0x26 | 0x2E | 0x3E => {
            let n = match fetch_z80_byte(state, bus, level) {
                Some(b) => b,
                None => return StepOutcome::Undefined,
            };
            write_z80_reg8(state, z80_reg_index(opcode), n);
            StepOutcome::Success
        }
        0x04 | 0x0C | 0x14 | 0x1C | 0x24 | 0x2C | 0x3C => {
            let idx = z80_reg_index(opcode);
            let v = read_z80_reg8(state, idx).wrapping_add(1);
            write_z80_reg8(state, idx, v);
            StepOutcome::Success
        }
        0x05 | 0x0D | 0x15 | 0x1D | 0x25 | 0x2D | 0x3D => {
            let idx = z80_reg_index(opcode);
            let v = read_z80_reg8(state, idx).wrapping_sub(1);
            write_z80_reg8(state, idx, v);
            StepOutcome::Success
        }
        _ => StepOutcome::Undefined,
    }
}

fn fetch_z80_byte<B: Bus + ?Sized>(state: &mut CpuState, bus: &mut B, level: AccessLevel) -> Option<u8> {
    let mut buf = [0u8; 1];
    bus.mem_read(level, state.z80.pc as u64, &mut buf).ok()?;
    state.z80.pc = state.z80.pc.wrapping_add(1);
    Some(buf[0])
}

/// Z80 8-bit register-field encoding (bits 5:3 of the opcode byte):
/// B/C/D/E/H/L/(HL)/A. `(HL)` (index 6) is not modeled by the small
/// instruction subset above and is never passed in here.
fn z80_reg_index(opcode: u8) -> u8 {
    (opcode >> 3) & 7
}

fn read_z80_reg8(state: &CpuState, idx: u8) -> u8 {
    match idx {
        0 => (state.z80.bc >> 8) as u8,
        1 => state.z80.bc as u8,
        2 => (state.z80.de >> 8) as u8,
        3 => state.z80.de as u8,
        4 => (state.z80.hl >> 8) as u8,
        5 => state.z80.hl as u8,
        _ => state.z80.a,
    }
}

fn write_z80_reg8(state: &mut CpuState, idx: u8, value: u8) {
    match idx {
        0 => state.z80.bc = (state.z80.bc & 0x00FF) | ((value as u16) << 8),
        1 => state.z80.bc = (state.z80.bc & 0xFF00) | value as u16,
        2 => state.z80.de = (state.z80.de & 0x00FF) | ((value as u16) << 8),
        3 => state.z80.de = (state.z80.de & 0xFF00) | value as u16,
        4 => state.z80.hl = (state.z80.hl & 0x00FF) | ((value as u16) << 8),
        5 => state.z80.hl = (state.z80.hl & 0xFF00) | value as u16,
        _ => state.z80.a = value,
    }
}

fn deliver_fault<B: Bus + ?Sized>(state: &mut CpuState, bus: &mut B, fault: FaultInfo) -> StepOutcome {
    match except::deliver(state, fault) {
        except::DeliveryOutcome::TripleFault => StepOutcome::TripleFault,
        except::DeliveryOutcome::Delivered(vector) => {
            if let Err(e) = dispatch_real_mode_interrupt(state, bus, vector) {
                log::warn!("interrupt dispatch for vector {vector} failed: {e:?}");
            }
            StepOutcome::CpuInterrupt(vector)
        }
    }
}

enum DispatchError {
    Fault(FaultInfo),
    Core(CoreError),
}
impl From<FaultInfo> for DispatchError {
    fn from(f: FaultInfo) -> Self {
        DispatchError::Fault(f)
    }
}

/// Real-mode IVT interrupt dispatch: push FLAGS/CS/IP, clear IF/TF, load
/// CS:IP from the 4-byte vector table at physical address `vector * 4`
/// (§4.6; protected/long-mode IDT gate walking is out of scope, DESIGN.md
/// Open Question decisions).
pub(crate) fn dispatch_real_mode_interrupt<B: Bus + ?Sized>(state: &mut CpuState, bus: &mut B, vector: u32) -> Result<(), FaultInfo> {
    let flags_bits = state.flags.to_bits() as u16;
    let ret_cs = state.regs.seg[sreg::CS].selector;
    let ret_ip = state.regs.xip as u16;
    push16(state, bus, flags_bits)?;
    push16(state, bus, ret_cs)?;
    push16(state, bus, ret_ip)?;

    state.flags.r#if.set(false);
    state.flags.tf.set(false);

    let table_addr = (vector as u64) * 4;
    let bytes = crate::bus::read_widened(bus, AccessLevel::from(state.exec.cpu_level), table_addr, 4)?;
    let new_ip = crate::bus::le_read_u16(&bytes[0..2]);
    let new_cs = crate::bus::le_read_u16(&bytes[2..4]);
    state.regs.load_segment(
        sreg::CS,
        new_cs,
        crate::state::registers::DescriptorCache { base: (new_cs as u64) << 4, limit: 0xFFFF, access: 0x9B, valid: true },
    );
    state.regs.xip = new_ip as u64;
    Ok(())
}

fn push16<B: Bus + ?Sized>(state: &mut CpuState, bus: &mut B, value: u16) -> Result<(), FaultInfo> {
    use crate::state::registers::gpr;
    let sp = state.regs.reg16(gpr::SP).wrapping_sub(2);
    state.regs.set_reg16(gpr::SP, sp);
    let linear = mmu::linear_address(state, sreg::SS, sp as u64, 2, AccessKind::Write)?;
    let phys = mmu::translate(state, bus, linear, AccessKind::Write)?;
    crate::bus::write_widened(bus, AccessLevel::from(state.exec.cpu_level), phys, &value.to_le_bytes())
}

/// Read-effective-address width in bytes for a given bit width.
fn bits_to_bytes(bits: u32) -> usize {
    (bits / 8) as usize
}

/// Push a `bits`-wide value, decrementing xSP by `bits/8` first (§4.2 PUSH
/// family: PUSH r, PUSH imm, PUSHA, PUSHF, CALL near, interrupt delivery).
fn push_value<B: Bus + ?Sized>(state: &mut CpuState, bus: &mut B, bits: u32, value: u64) -> Result<(), FaultInfo> {
    use crate::state::registers::gpr;
    let size = bits_to_bytes(bits) as u64;
    let sp = state.regs.reg64(gpr::SP).wrapping_sub(size);
    write_gpr(state, gpr::SP, state.regs.mode.default_operand_bits(), sp);
    let linear = mmu::linear_address(state, sreg::SS, sp, size, AccessKind::Write)?;
    let phys = mmu::translate(state, bus, linear, AccessKind::Write)?;
    let bytes: Vec<u8> = match bits {
        16 => (value as u16).to_le_bytes().to_vec(),
        32 => (value as u32).to_le_bytes().to_vec(),
        _ => value.to_le_bytes().to_vec(),
    };
    crate::bus::write_widened(bus, AccessLevel::from(state.exec.cpu_level), phys, &bytes)?;
    mmu::mark_accessed_dirty(state, bus, linear, true)
}

/// Pop a `bits`-wide value, incrementing xSP by `bits/8` after the read.
fn pop_value<B: Bus + ?Sized>(state: &mut CpuState, bus: &mut B, bits: u32) -> Result<u64, FaultInfo> {
    use crate::state::registers::gpr;
    let size = bits_to_bytes(bits) as u64;
    let sp = state.regs.reg64(gpr::SP);
    let linear = mmu::linear_address(state, sreg::SS, sp, size, AccessKind::Read)?;
    let phys = mmu::translate(state, bus, linear, AccessKind::Read)?;
    let bytes = crate::bus::read_widened(bus, AccessLevel::from(state.exec.cpu_level), phys, size as usize)?;
    mmu::mark_accessed_dirty(state, bus, linear, false)?;
    write_gpr(state, gpr::SP, state.regs.mode.default_operand_bits(), sp.wrapping_add(size));
    Ok(match bits {
        16 => crate::bus::le_read_u16(&bytes) as u64,
        32 => crate::bus::le_read_u32(&bytes) as u64,
        _ => crate::bus::le_read_u64(&bytes),
    })
}

/// INC/DEC leave CF untouched; every other flag follows the ADD/SUB-by-one
/// rule (§4.2 Group5/0x40-series).
fn apply_inc(flags: &mut crate::state::flags::FlagLanes, value: u64, bits: u32) -> u64 {
    let saved_cf = flags.cf.is_set();
    let result = alu::set_flags_add(flags, value, 1, bits);
    flags.cf.set(saved_cf);
    result
}

fn apply_dec(flags: &mut crate::state::flags::FlagLanes, value: u64, bits: u32) -> u64 {
    let saved_cf = flags.cf.is_set();
    let result = alu::set_flags_sub(flags, value, 1, bits);
    flags.cf.set(saved_cf);
    result
}

/// Shift/rotate group (`C0`/`C1`/`D0`-`D3`), selected by the ModR/M `reg`
/// field: ROL/ROR/RCL/RCR/SHL/SHR/SHL(alias)/SAR (§4.2).
fn apply_shift_group(flags: &mut crate::state::flags::FlagLanes, sub_op: usize, value: u64, count: u32, bits: u32) -> u64 {
    let mask = alu::width_mask(bits);
    let msb = 1u64 << (bits - 1);
    match sub_op {
        0 => {
            // ROL
            let n = (count % bits) as u32;
            let result = if n == 0 { value } else { ((value << n) | (value >> (bits - n))) & mask };
            if count != 0 {
                flags.cf.set(result & 1 != 0);
                if count == 1 {
                    flags.of.set((result & msb != 0) != (result & 1 != 0));
                }
            }
            result
        }
        1 => {
            // ROR
            let n = (count % bits) as u32;
            let result = if n == 0 { value } else { ((value >> n) | (value << (bits - n))) & mask };
            if count != 0 {
                flags.cf.set(result & msb != 0);
                if count == 1 {
                    let bit2 = (result >> (bits - 2)) & 1;
                    flags.of.set(((result & msb != 0) as u64) != bit2);
                }
            }
            result
        }
        2 => {
            // RCL through CF, modulo bits+1
            let mut result = value & mask;
            let mut cf = flags.cf.is_set();
            let n = count % (bits + 1);
            for _ in 0..n {
                let new_cf = result & msb != 0;
                result = ((result << 1) | (cf as u64)) & mask;
                cf = new_cf;
            }
            if count != 0 {
                flags.cf.set(cf);
                if count == 1 {
                    flags.of.set((result & msb != 0) != cf);
                }
            }
            result
        }
        3 => {
            // RCR through CF, modulo bits+1
            let mut result = value & mask;
            let mut cf = flags.cf.is_set();
            let n = count % (bits + 1);
            for _ in 0..n {
                let new_cf = result & 1 != 0;
                result = (result >> 1) | ((cf as u64) << (bits - 1));
                cf = new_cf;
            }
            if count != 0 {
                flags.cf.set(cf);
                if count == 1 {
                    flags.of.set((result & msb != 0) != (result & (msb >> 1) != 0));
                }
            }
            result
        }
        4 | 6 => {
            // SHL/SAL
            if count == 0 {
                value & mask
            } else {
                let n = count.min(bits + 1);
                let result = if n >= bits { 0 } else { (value << n) & mask };
                let cf = if n == 0 { false } else if n > bits { false } else { (value >> (bits - n)) & 1 != 0 };
                flags.cf.set(cf);
                if count == 1 {
                    flags.of.set((result & msb != 0) != cf);
                }
                alu::set_flags_logic(flags, result, bits);
                result
            }
        }
        5 => {
            // SHR
            if count == 0 {
                value & mask
            } else {
                let n = count.min(bits);
                let result = if n >= bits { 0 } else { (value & mask) >> n };
                let cf = if n == 0 { false } else { (value >> (n - 1)) & 1 != 0 };
                flags.cf.set(cf);
                if count == 1 {
                    flags.of.set(value & msb != 0);
                }
                alu::set_flags_logic(flags, result, bits);
                result
            }
        }
        7 => {
            // SAR
            let sign = value & msb != 0;
            if count == 0 {
                value & mask
            } else {
                let n = count.min(bits);
                let cf = if n == 0 { false } else { (value >> (n - 1)) & 1 != 0 };
                let result = if sign {
                    let filled = if n >= bits { mask } else { (!0u64) << (bits - n) };
                    ((value >> n) | filled) & mask
                } else if n >= bits {
                    0
                } else {
                    (value & mask) >> n
                };
                flags.cf.set(cf);
                if count == 1 {
                    flags.of.set(false);
                }
                alu::set_flags_logic(flags, result, bits);
                result
            }
        }
        _ => unreachable!(),
    }
}

/// Evaluate a Jcc condition code (ModR/M-free low nibble of `0x70..=0x7F`
/// and the two-byte `0x80..=0x8F` Jcc rel32 forms) against FLAGS (§4.2).
fn check_condition(flags: &crate::state::flags::FlagLanes, code: u8) -> bool {
    let cf = flags.cf.is_set();
    let zf = flags.zf.is_set();
    let sf = flags.sf.is_set();
    let of = flags.of.is_set();
    let pf = flags.pf.is_set();
    match code & 0x0F {
        0x0 => of,
        0x1 => !of,
        0x2 => cf,
        0x3 => !cf,
        0x4 => zf,
        0x5 => !zf,
        0x6 => cf || zf,
        0x7 => !cf && !zf,
        0x8 => sf,
        0x9 => !sf,
        0xA => pf,
        0xB => !pf,
        0xC => sf != of,
        0xD => sf == of,
        0xE => zf || (sf != of),
        0xF => !zf && (sf == of),
        _ => unreachable!(),
    }
}

/// ModR/M's 8-bit register field encodes AL/CL/DL/BL as 0..3 and
/// AH/CH/DH/BH as 4..7, aliasing the high byte of the first four cells
/// rather than naming four more cells (§3 partial-register rule).
fn read_gpr(state: &CpuState, idx: usize, bits: u32) -> u64 {
    match bits {
        8 => {
            if idx < 4 {
                state.regs.reg8_low(idx) as u64
            } else {
                state.regs.reg8_high(idx - 4) as u64
            }
        }
        16 => state.regs.reg16(idx) as u64,
        32 => state.regs.reg32(idx) as u64,
        _ => state.regs.reg64(idx),
    }
}

fn write_gpr(state: &mut CpuState, idx: usize, bits: u32, value: u64) {
    match bits {
        8 => {
            if idx < 4 {
                state.regs.set_reg8_low(idx, value as u8)
            } else {
                state.regs.set_reg8_high(idx - 4, value as u8)
            }
        }
        16 => state.regs.set_reg16(idx, value as u16),
        32 => state.regs.set_reg32(idx, value as u32),
        _ => state.regs.set_reg64(idx, value),
    }
}

fn read_rm<B: Bus + ?Sized>(state: &CpuState, bus: &mut B, rm: &RmOperand, bits: u32) -> Result<u64, FaultInfo> {
    match rm {
        RmOperand::Reg(idx) => Ok(read_gpr(state, *idx, bits)),
        RmOperand::Mem(mem) => {
            let linear = mmu::linear_address(state, mem.segment, mem.offset, bits_to_bytes(bits) as u64, AccessKind::Read)?;
            let phys = mmu::translate(state, bus, linear, AccessKind::Read)?;
            let bytes = crate::bus::read_widened(bus, AccessLevel::from(state.exec.cpu_level), phys, bits_to_bytes(bits))?;
            mmu::mark_accessed_dirty(state, bus, linear, false)?;
            Ok(match bits {
                8 => bytes[0] as u64,
                16 => crate::bus::le_read_u16(&bytes) as u64,
                32 => crate::bus::le_read_u32(&bytes) as u64,
                _ => crate::bus::le_read_u64(&bytes),
            })
        }
    }
}

fn write_rm<B: Bus + ?Sized>(
    state: &mut CpuState,
    bus: &mut B,
    rm: &RmOperand,
    bits: u32,
    value: u64,
) -> Result<(), FaultInfo> {
    match rm {
        RmOperand::Reg(idx) => {
            write_gpr(state, *idx, bits, value);
            Ok(())
        }
        RmOperand::Mem(mem) => {
            let linear = mmu::linear_address(state, mem.segment, mem.offset, bits_to_bytes(bits) as u64, AccessKind::Write)?;
            let phys = mmu::translate(state, bus, linear, AccessKind::Write)?;
            let bytes: Vec<u8> = match bits {
                8 => vec![value as u8],
                16 => (value as u16).to_le_bytes().to_vec(),
                32 => (value as u32).to_le_bytes().to_vec(),
                _ => value.to_le_bytes().to_vec(),
            };
            crate::bus::write_widened(bus, AccessLevel::from(state.exec.cpu_level), phys, &bytes)?;
            mmu::mark_accessed_dirty(state, bus, linear, true)?;
            Ok(())
        }
    }
}

fn dispatch<B: Bus + ?Sized>(
    state: &mut CpuState,
    bus: &mut B,
    d: &DecodedInstruction,
) -> Result<StepOutcome, DispatchError> {
    if d.opcode_map == OpcodeMap::TwoByte0f {
        return dispatch_two_byte(state, d);
    }

    match d.opcode {
        // ALU group: ADD/OR/ADC/SBB/AND/SUB/XOR/CMP, forms 0..5 (§4.2, scenario 1).
        0x00..=0x3D if d.opcode % 8 <= 3 || matches!(d.opcode % 8, 4 | 5) => {
            exec_alu_group(state, bus, d)?;
            Ok(StepOutcome::Success)
        }

        // MOV r/m, r and r, r/m (8/16/32/64).
        0x88..=0x8B => {
            exec_mov(state, bus, d)?;
            Ok(StepOutcome::Success)
        }

        0x90 => Ok(StepOutcome::Success), // NOP

        0xF4 => {
            state.exec.state = RunState::Halted;
            Ok(StepOutcome::Halt)
        }

        0xFA => {
            state.flags.r#if.set(false);
            Ok(StepOutcome::Success)
        }
        0xFB => {
            state.flags.r#if.set(true);
            state.exec.inhibit_interrupts_next = true;
            Ok(StepOutcome::InhibitInterrupts)
        }

        0xA4 | 0xA5 => exec_movs(state, bus, d),

        0xF6 | 0xF7 => exec_group3(state, bus, d),

        0xCD => {
            let vector = d.immediate.unwrap_or(0) as u32;
            let outcome = except::deliver(
                state,
                FaultInfo::software_int(vector),
            );
            match outcome {
                except::DeliveryOutcome::TripleFault => Ok(StepOutcome::TripleFault),
                except::DeliveryOutcome::Delivered(v) => {
                    dispatch_real_mode_interrupt(state, bus, v).map_err(DispatchError::Fault)?;
                    Ok(StepOutcome::CpuInterrupt(v))
                }
            }
        }

        0xF1 => Ok(StepOutcome::IceInterrupt), // ICEBP

        0x50..=0x57 => {
            let bits = d.operand_size;
            let v = read_gpr(state, (d.opcode - 0x50) as usize, bits);
            push_value(state, bus, bits, v).map_err(DispatchError::Fault)?;
            Ok(StepOutcome::Success)
        }
        0x58..=0x5F => {
            let bits = d.operand_size;
            let v = pop_value(state, bus, bits).map_err(DispatchError::Fault)?;
            write_gpr(state, (d.opcode - 0x58) as usize, bits, v);
            Ok(StepOutcome::Success)
        }

        0x60 => {
            // PUSHA/PUSHAD: AX,CX,DX,BX,(original)SP,BP,SI,DI, in that order.
            use crate::state::registers::gpr;
            let bits = d.operand_size;
            let sp_before = read_gpr(state, gpr::SP, bits);
            for idx in [gpr::AX, gpr::CX, gpr::DX, gpr::BX] {
                push_value(state, bus, bits, read_gpr(state, idx, bits)).map_err(DispatchError::Fault)?;
            }
            push_value(state, bus, bits, sp_before).map_err(DispatchError::Fault)?;
            for idx in [gpr::BP, gpr::SI, gpr::DI] {
                push_value(state, bus, bits, read_gpr(state, idx, bits)).map_err(DispatchError::Fault)?;
            }
            Ok(StepOutcome::Success)
        }
        0x61 => {
            // POPA/POPAD: reverse order, discarding the saved SP slot.
            use crate::state::registers::gpr;
            let bits = d.operand_size;
            for idx in [gpr::DI, gpr::SI, gpr::BP] {
                let v = pop_value(state, bus, bits).map_err(DispatchError::Fault)?;
                write_gpr(state, idx, bits, v);
            }
            pop_value(state, bus, bits).map_err(DispatchError::Fault)?; // discarded SP
            for idx in [gpr::BX, gpr::DX, gpr::CX, gpr::AX] {
                let v = pop_value(state, bus, bits).map_err(DispatchError::Fault)?;
                write_gpr(state, idx, bits, v);
            }
            Ok(StepOutcome::Success)
        }

        0x68 => {
            let bits = d.operand_size;
            let imm = d.immediate.unwrap_or(0);
            push_value(state, bus, bits, imm).map_err(DispatchError::Fault)?;
            Ok(StepOutcome::Success)
        }
        0x6A => {
            let bits = d.operand_size;
            let shift = 64 - 8;
            let imm = (((d.immediate.unwrap_or(0) as u8 as i8 as i64) << shift) >> shift) as u64;
            push_value(state, bus, bits, imm & alu::width_mask(bits)).map_err(DispatchError::Fault)?;
            Ok(StepOutcome::Success)
        }

        0x70..=0x7F => {
            if check_condition(&state.flags, d.opcode) {
                let disp = d.immediate.unwrap_or(0) as u8 as i8 as i64;
                state.regs.xip = (state.regs.xip as i64).wrapping_add(disp) as u64;
            }
            Ok(StepOutcome::Success)
        }

        0x80 | 0x81 | 0x83 => {
            exec_group1(state, bus, d)?;
            Ok(StepOutcome::Success)
        }

        0x9C => {
            let bits = d.operand_size;
            push_value(state, bus, bits, state.flags.to_bits()).map_err(DispatchError::Fault)?;
            Ok(StepOutcome::Success)
        }
        0x9D => {
            let bits = d.operand_size;
            let v = pop_value(state, bus, bits).map_err(DispatchError::Fault)?;
            state.flags.from_bits(v);
            Ok(StepOutcome::Success)
        }

        0xC0 | 0xC1 | 0xD0..=0xD3 => {
            exec_group2(state, bus, d)?;
            Ok(StepOutcome::Success)
        }

        0xC2 => {
            let bits = d.operand_size;
            let new_ip = pop_value(state, bus, bits).map_err(DispatchError::Fault)?;
            state.regs.xip = new_ip;
            use crate::state::registers::gpr;
            let sp = read_gpr(state, gpr::SP, bits).wrapping_add(d.immediate.unwrap_or(0));
            write_gpr(state, gpr::SP, bits, sp);
            Ok(StepOutcome::Success)
        }
        0xC3 => {
            let bits = d.operand_size;
            let new_ip = pop_value(state, bus, bits).map_err(DispatchError::Fault)?;
            state.regs.xip = new_ip;
            Ok(StepOutcome::Success)
        }

        0xC6 | 0xC7 => {
            let is_byte = d.opcode == 0xC6;
            let bits = operand_bits(d, is_byte);
            let rm = d.rm.clone().expect("C6/C7 has modrm");
            let imm = d.immediate.unwrap_or(0);
            write_rm(state, bus, &rm, bits, imm).map_err(DispatchError::Fault)?;
            Ok(StepOutcome::Success)
        }

        0xCF => {
            let bits = d.operand_size;
            let new_ip = pop_value(state, bus, bits).map_err(DispatchError::Fault)?;
            let new_cs = pop_value(state, bus, 16).map_err(DispatchError::Fault)?;
            let flags_bits = pop_value(state, bus, bits).map_err(DispatchError::Fault)?;
            state.regs.xip = new_ip;
            state.regs.seg[sreg::CS].selector = new_cs as u16;
            state.flags.from_bits(flags_bits);
            except::clear_in_flight(state);
            Ok(StepOutcome::Success)
        }

        0xE8 => {
            let bits = d.operand_size;
            let disp = if bits == 16 { d.immediate.unwrap_or(0) as u16 as i16 as i64 } else { d.immediate.unwrap_or(0) as u32 as i32 as i64 };
            push_value(state, bus, bits, state.regs.xip).map_err(DispatchError::Fault)?;
            state.regs.xip = (state.regs.xip as i64).wrapping_add(disp) as u64;
            Ok(StepOutcome::Success)
        }
        0xE9 => {
            let bits = d.operand_size;
            let disp = if bits == 16 { d.immediate.unwrap_or(0) as u16 as i16 as i64 } else { d.immediate.unwrap_or(0) as u32 as i32 as i64 };
            state.regs.xip = (state.regs.xip as i64).wrapping_add(disp) as u64;
            Ok(StepOutcome::Success)
        }
        0xEB => {
            let disp = d.immediate.unwrap_or(0) as u8 as i8 as i64;
            state.regs.xip = (state.regs.xip as i64).wrapping_add(disp) as u64;
            Ok(StepOutcome::Success)
        }

        0xFE | 0xFF => exec_group5(state, bus, d),

        _ => undefined_opcode(state),
    }
}

/// Two-byte (`0F`) map dispatch. Only SYSRET/SYSEXIT are modeled; everything
/// else raises `#UD` (DESIGN.md Open Question decisions: the full SSE/AVX
/// and system-instruction surface of this map is out of scope for this
/// pass).
fn dispatch_two_byte(state: &mut CpuState, d: &DecodedInstruction) -> Result<StepOutcome, DispatchError> {
    use crate::state::registers::{gpr, msr, sreg};
    match d.opcode {
        0x07 => {
            // SYSRET (legacy 32-bit form): CS/SS come from STAR[63:48], EIP
            // from ECX. The 64-bit long-mode variant (RCX/R11/RFLAGS) is a
            // documented open question, not silently approximated here.
            let star = state.control.msr[msr::STAR];
            let cs_base_sel = ((star >> 48) & 0xFFFF) as u16;
            state.regs.seg[sreg::CS].selector = cs_base_sel.wrapping_add(16) | 3;
            state.regs.seg[sreg::SS].selector = cs_base_sel.wrapping_add(8) | 3;
            state.regs.xip = state.regs.reg32(gpr::CX) as u64;
            Ok(StepOutcome::Success)
        }
        0x35 => {
            // SYSEXIT (legacy 32-bit form): CS/SS come from SYSENTER_CS, EIP
            // from EDX, ESP from ECX.
            let sysenter_cs = state.control.msr[msr::SYSENTER_CS] as u16;
            state.regs.seg[sreg::CS].selector = sysenter_cs.wrapping_add(16) | 3;
            state.regs.seg[sreg::SS].selector = sysenter_cs.wrapping_add(24) | 3;
            state.regs.xip = state.regs.reg32(gpr::DX) as u64;
            state.regs.set_reg32(gpr::SP, state.regs.reg32(gpr::CX));
            Ok(StepOutcome::Success)
        }
        _ => undefined_opcode(state),
    }
}

fn exec_group1<B: Bus + ?Sized>(state: &mut CpuState, bus: &mut B, d: &DecodedInstruction) -> Result<(), DispatchError> {
    let is_byte = d.opcode == 0x80;
    let bits = operand_bits(d, is_byte);
    let rm = d.rm.clone().expect("group1 has modrm");
    let alu_op = d.modrm_reg.expect("group1 has modrm") as u8;
    let raw_imm = d.immediate.unwrap_or(0);
    let imm = if d.opcode == 0x81 {
        raw_imm
    } else {
        // 0x80/0x83: imm8, sign-extended to the operand width.
        let shift = 64 - 8;
        (((raw_imm as u8 as i8 as i64) << shift) >> shift) as u64 & alu::width_mask(bits)
    };
    let dest = read_rm(state, bus, &rm, bits)?;
    let result = apply_alu(alu_op, &mut state.flags, dest, imm, bits);
    if alu_op != 7 {
        write_rm(state, bus, &rm, bits, result)?;
    }
    Ok(())
}

fn exec_group2<B: Bus + ?Sized>(state: &mut CpuState, bus: &mut B, d: &DecodedInstruction) -> Result<(), DispatchError> {
    use crate::state::registers::gpr;
    let is_byte = matches!(d.opcode, 0xC0 | 0xD0 | 0xD2);
    let bits = operand_bits(d, is_byte);
    let rm = d.rm.clone().expect("group2 has modrm");
    let sub_op = d.modrm_reg.expect("group2 has modrm") as usize;
    let count = match d.opcode {
        0xC0 | 0xC1 => d.immediate.unwrap_or(0) as u32,
        0xD0 | 0xD1 => 1,
        _ => read_gpr(state, gpr::CX, 8) as u32,
    };
    let value = read_rm(state, bus, &rm, bits)?;
    let result = apply_shift_group(&mut state.flags, sub_op, value, count, bits);
    write_rm(state, bus, &rm, bits, result)?;
    Ok(())
}

fn exec_group5<B: Bus + ?Sized>(state: &mut CpuState, bus: &mut B, d: &DecodedInstruction) -> Result<StepOutcome, DispatchError> {
    let is_byte = d.opcode == 0xFE;
    let bits = operand_bits(d, is_byte);
    let rm = d.rm.clone().expect("group5 has modrm");
    let sub_op = d.modrm_reg.expect("group5 has modrm");
    match sub_op {
        0 => {
            let v = read_rm(state, bus, &rm, bits)?;
            let result = apply_inc(&mut state.flags, v, bits);
            write_rm(state, bus, &rm, bits, result)?;
            Ok(StepOutcome::Success)
        }
        1 => {
            let v = read_rm(state, bus, &rm, bits)?;
            let result = apply_dec(&mut state.flags, v, bits);
            write_rm(state, bus, &rm, bits, result)?;
            Ok(StepOutcome::Success)
        }
        2 => {
            // CALL near r/m.
            let target = read_rm(state, bus, &rm, bits)?;
            push_value(state, bus, bits, state.regs.xip)?;
            state.regs.xip = target;
            Ok(StepOutcome::Success)
        }
        4 => {
            // JMP near r/m.
            let target = read_rm(state, bus, &rm, bits)?;
            state.regs.xip = target;
            Ok(StepOutcome::Success)
        }
        6 => {
            // PUSH r/m.
            let v = read_rm(state, bus, &rm, bits)?;
            push_value(state, bus, bits, v)?;
            Ok(StepOutcome::Success)
        }
        // 3/5: far CALL/JMP r/m. This crate's flat/paged bus model has no
        // segment-descriptor-table call gate surface to resolve a far
        // target against, so these raise #UD rather than silently no-op.
        3 | 5 | 7 => undefined_opcode(state),
        _ => unreachable!(),
    }
}

fn undefined_opcode(state: &mut CpuState) -> Result<StepOutcome, DispatchError> {
    if state.traits.silent_ignore_undefined {
        Ok(StepOutcome::Undefined)
    } else {
        Err(DispatchError::Fault(FaultInfo::invalid_opcode()))
    }
}

fn operand_bits(d: &DecodedInstruction, is_byte_form: bool) -> u32 {
    if is_byte_form {
        8
    } else {
        d.operand_size
    }
}

fn exec_alu_group<B: Bus + ?Sized>(state: &mut CpuState, bus: &mut B, d: &DecodedInstruction) -> Result<(), DispatchError> {
    let alu_op = d.opcode / 8;
    let form = d.opcode % 8;
    let is_byte = matches!(form, 0 | 2 | 4);
    let bits = operand_bits(d, is_byte);

    let (dest, src) = match form {
        0 | 1 => {
            // r/m, reg
            let rm = d.rm.clone().expect("alu form 0/1 has modrm");
            let reg = d.modrm_reg.expect("alu form 0/1 has modrm");
            (read_rm(state, bus, &rm, bits)?, read_gpr(state, reg, bits))
        }
        2 | 3 => {
            let rm = d.rm.clone().expect("alu form 2/3 has modrm");
            let reg = d.modrm_reg.expect("alu form 2/3 has modrm");
            (read_gpr(state, reg, bits), read_rm(state, bus, &rm, bits)?)
        }
        4 | 5 => {
            use crate::state::registers::gpr;
            (read_gpr(state, gpr::AX, bits), d.immediate.unwrap_or(0))
        }
        _ => unreachable!(),
    };

    let result = apply_alu(alu_op, &mut state.flags, dest, src, bits);

    match form {
        0 | 1 => {
            if alu_op != 7 {
                let rm = d.rm.clone().unwrap();
                write_rm(state, bus, &rm, bits, result)?;
            }
        }
        2 | 3 => {
            if alu_op != 7 {
                let reg = d.modrm_reg.unwrap();
                write_gpr(state, reg, bits, result);
            }
        }
        4 | 5 => {
            if alu_op != 7 {
                use crate::state::registers::gpr;
                write_gpr(state, gpr::AX, bits, result);
            }
        }
        _ => unreachable!(),
    }
    Ok(())
}

fn apply_alu(op: u8, flags: &mut crate::state::flags::FlagLanes, dest: u64, src: u64, bits: u32) -> u64 {
    match op {
        0 => alu::set_flags_add(flags, dest, src, bits),
        1 => alu::set_flags_logic(flags, dest | src, bits),
        2 => {
            let cf = flags.cf.is_set() as u64;
            alu::set_flags_add(flags, dest, src.wrapping_add(cf), bits)
        }
        3 => {
            let cf = flags.cf.is_set() as u64;
            alu::set_flags_sub(flags, dest, src.wrapping_add(cf), bits)
        }
        4 => alu::set_flags_logic(flags, dest & src, bits),
        5 => alu::set_flags_sub(flags, dest, src, bits),
        6 => alu::set_flags_logic(flags, dest ^ src, bits),
        7 => {
            alu::set_flags_sub(flags, dest, src, bits);
            dest
        }
        _ => unreachable!(),
    }
}

fn exec_mov<B: Bus + ?Sized>(state: &mut CpuState, bus: &mut B, d: &DecodedInstruction) -> Result<(), DispatchError> {
    let is_byte = matches!(d.opcode, 0x88 | 0x8A);
    let bits = operand_bits(d, is_byte);
    let rm = d.rm.clone().expect("mov has modrm");
    let reg = d.modrm_reg.expect("mov has modrm");
    match d.opcode {
        0x88 | 0x89 => {
            let v = read_gpr(state, reg, bits);
            write_rm(state, bus, &rm, bits, v)?;
        }
        0x8A | 0x8B => {
            let v = read_rm(state, bus, &rm, bits)?;
            write_gpr(state, reg, bits, v);
        }
        _ => unreachable!(),
    }
    Ok(())
}

/// MOVSB/MOVSW with an optional REP prefix (§4.2, §4.3, §8 scenario 2). One
/// call retires a single iteration and reports `StringContinue` while `CX`
/// (or the whole move, for non-REP) still has work left, matching the
/// "re-enter to continue" contract instead of looping internally.
fn exec_movs<B: Bus + ?Sized>(state: &mut CpuState, bus: &mut B, d: &DecodedInstruction) -> Result<StepOutcome, DispatchError> {
    use crate::state::registers::gpr;

    let bits = if d.opcode == 0xA4 { 8 } else { d.operand_size };
    let has_rep = d.rep != RepState::None;

    if has_rep && state.regs.reg16(gpr::CX) == 0 {
        return Ok(StepOutcome::Success);
    }

    let src_seg = d.segment_override.unwrap_or(sreg::DS);
    let si = state.regs.reg16(gpr::SI);
    let di = state.regs.reg16(gpr::DI);

    let src_linear = mmu::linear_address(state, src_seg, si as u64, bits_to_bytes(bits) as u64, AccessKind::Read)
        .map_err(DispatchError::Fault)?;
    let src_phys = mmu::translate(state, bus, src_linear, AccessKind::Read).map_err(DispatchError::Fault)?;
    let bytes = crate::bus::read_widened(bus, AccessLevel::from(state.exec.cpu_level), src_phys, bits_to_bytes(bits))
        .map_err(DispatchError::Fault)?;

    let dst_linear = mmu::linear_address(state, sreg::ES, di as u64, bits_to_bytes(bits) as u64, AccessKind::Write)
        .map_err(DispatchError::Fault)?;
    let dst_phys = mmu::translate(state, bus, dst_linear, AccessKind::Write).map_err(DispatchError::Fault)?;
    crate::bus::write_widened(bus, AccessLevel::from(state.exec.cpu_level), dst_phys, &bytes).map_err(DispatchError::Fault)?;

    let step_size = bits_to_bytes(bits) as u16;
    let delta: u16 = if state.flags.df.is_set() { 0u16.wrapping_sub(step_size) } else { step_size };
    state.regs.set_reg16(gpr::SI, si.wrapping_add(delta));
    state.regs.set_reg16(gpr::DI, di.wrapping_add(delta));

    if has_rep {
        let cx = state.regs.reg16(gpr::CX).wrapping_sub(1);
        state.regs.set_reg16(gpr::CX, cx);
        if cx == 0 {
            Ok(StepOutcome::Success)
        } else {
            state.regs.xip = state.regs.old_xip;
            Ok(StepOutcome::StringContinue)
        }
    } else {
        Ok(StepOutcome::Success)
    }
}

/// Group 3 (`F6`/`F7`): TEST/NOT/NEG/MUL/IMUL/DIV/IDIV, selected by the
/// ModR/M `reg` field.
fn exec_group3<B: Bus + ?Sized>(state: &mut CpuState, bus: &mut B, d: &DecodedInstruction) -> Result<StepOutcome, DispatchError> {
    use crate::state::registers::gpr;

    let is_byte = d.opcode == 0xF6;
    let bits = operand_bits(d, is_byte);
    let rm = d.rm.clone().expect("group3 has modrm");
    let sub_op = d.modrm_reg.expect("group3 has modrm");
    let value = read_rm(state, bus, &rm, bits).map_err(DispatchError::Fault)?;

    match sub_op {
        0 | 1 => {
            let imm = d.immediate.unwrap_or(0);
            alu::set_flags_logic(&mut state.flags, value & imm, bits);
        }
        2 => {
            let result = (!value) & alu::width_mask(bits);
            write_rm(state, bus, &rm, bits, result).map_err(DispatchError::Fault)?;
        }
        3 => {
            let result = alu::set_flags_sub(&mut state.flags, 0, value, bits);
            write_rm(state, bus, &rm, bits, result).map_err(DispatchError::Fault)?;
        }
        6 => {
            // DIV: AX/DX:AX divided by r/m (§8 scenario 3).
            let (dividend, divisor) = match bits {
                8 => (state.regs.reg16(gpr::AX) as u64, value),
                16 => {
                    let dx = state.regs.reg16(gpr::DX) as u64;
                    let ax = state.regs.reg16(gpr::AX) as u64;
                    ((dx << 16) | ax, value)
                }
                32 => {
                    let dx = state.regs.reg32(gpr::DX) as u64;
                    let ax = state.regs.reg32(gpr::AX) as u64;
                    ((dx << 32) | ax, value)
                }
                _ => (state.regs.reg64(gpr::AX), value),
            };
            if divisor == 0 {
                return Err(DispatchError::Fault(FaultInfo::divide_error()));
            }
            let quotient = dividend / divisor;
            let remainder = dividend % divisor;
            let max = alu::width_mask(bits);
            if quotient > max {
                return Err(DispatchError::Fault(FaultInfo::divide_error()));
            }
            match bits {
                8 => state.regs.set_reg16(gpr::AX, ((remainder as u16) << 8) | (quotient as u16 & 0xFF)),
                16 => {
                    state.regs.set_reg16(gpr::AX, quotient as u16);
                    state.regs.set_reg16(gpr::DX, remainder as u16);
                }
                32 => {
                    state.regs.set_reg32(gpr::AX, quotient as u32);
                    state.regs.set_reg32(gpr::DX, remainder as u32);
                }
                _ => {
                    state.regs.set_reg64(gpr::AX, quotient);
                    state.regs.set_reg64(gpr::DX, remainder);
                }
            }
        }
        7 => {
            // IDIV: signed variant of the above.
            let sign_extend = |v: u64, bits: u32| -> i64 {
                let shift = 64 - bits;
                ((v << shift) as i64) >> shift
            };
            let divisor = sign_extend(value, bits);
            if divisor == 0 {
                return Err(DispatchError::Fault(FaultInfo::divide_error()));
            }
            let dividend: i64 = match bits {
                8 => sign_extend(state.regs.reg16(gpr::AX) as u64, 16),
                16 => {
                    let dx = state.regs.reg16(gpr::DX) as u64;
                    let ax = state.regs.reg16(gpr::AX) as u64;
                    sign_extend((dx << 16) | ax, 32)
                }
                32 => {
                    let dx = state.regs.reg32(gpr::DX) as u64;
                    let ax = state.regs.reg32(gpr::AX) as u64;
                    (((dx << 32) | ax) as i64)
                }
                _ => state.regs.reg64(gpr::AX) as i64,
            };
            let quotient = dividend / divisor;
            let remainder = dividend % divisor;
            match bits {
                8 => state.regs.set_reg16(gpr::AX, ((remainder as u16) << 8) | (quotient as u16 & 0xFF)),
                16 => {
                    state.regs.set_reg16(gpr::AX, quotient as u16);
                    state.regs.set_reg16(gpr::DX, remainder as u16);
                }
                32 => {
                    state.regs.set_reg32(gpr::AX, quotient as u32);
                    state.regs.set_reg32(gpr::DX, remainder as u32);
                }
                _ => {
                    state.regs.set_reg64(gpr::AX, quotient as u64);
                    state.regs.set_reg64(gpr::DX, remainder as u64);
                }
            }
        }
        4 => {
            // MUL: unsigned AX * r/m -> DX:AX (or the wider equivalents).
            // CF/OF set iff the upper half is non-zero (SDM vol.2 MUL).
            let al = match bits {
                8 => state.regs.reg16(gpr::AX) & 0xFF,
                16 => state.regs.reg16(gpr::AX) as u16,
                _ => 0,
            } as u64;
            let (lo, hi, upper_nonzero) = match bits {
                8 => {
                    let product = al * value;
                    (product & 0xFF, product >> 8, product >> 8 != 0)
                }
                16 => {
                    let product = (state.regs.reg16(gpr::AX) as u64) * value;
                    (product & 0xFFFF, product >> 16, product >> 16 != 0)
                }
                32 => {
                    let product = (state.regs.reg32(gpr::AX) as u64) * value;
                    (product & 0xFFFF_FFFF, product >> 32, product >> 32 != 0)
                }
                _ => {
                    let product = (state.regs.reg64(gpr::AX) as u128) * (value as u128);
                    ((product & u64::MAX as u128) as u64, (product >> 64) as u64, product >> 64 != 0)
                }
            };
            match bits {
                8 => state.regs.set_reg16(gpr::AX, ((hi as u16) << 8) | (lo as u16 & 0xFF)),
                16 => {
                    state.regs.set_reg16(gpr::AX, lo as u16);
                    state.regs.set_reg16(gpr::DX, hi as u16);
                }
                32 => {
                    state.regs.set_reg32(gpr::AX, lo as u32);
                    state.regs.set_reg32(gpr::DX, hi as u32);
                }
                _ => {
                    state.regs.set_reg64(gpr::AX, lo);
                    state.regs.set_reg64(gpr::DX, hi);
                }
            }
            state.flags.cf.set(upper_nonzero);
            state.flags.of.set(upper_nonzero);
        }
        5 => {
            // IMUL (one-operand form): signed AX * r/m -> DX:AX. CF/OF set
            // iff the upper half is not the sign extension of the lower.
            let sign_extend = |v: u64, bits: u32| -> i64 {
                let shift = 64 - bits;
                ((v << shift) as i64) >> shift
            };
            let rhs = sign_extend(value, bits);
            let (lo, hi, overflowed) = match bits {
                8 => {
                    let lhs = sign_extend(state.regs.reg16(gpr::AX) as u64 & 0xFF, 8);
                    let product = (lhs * rhs) as i16;
                    let sign_extended_lo = ((product as i8) as i16) == product;
                    ((product as u16) as u64, 0u64, !sign_extended_lo)
                }
                16 => {
                    let lhs = sign_extend(state.regs.reg16(gpr::AX) as u64, 16);
                    let product = lhs * rhs;
                    let lo = product as u16;
                    let hi = (product >> 16) as u16;
                    let overflow = ((lo as i16) as i64) != product;
                    (lo as u64, hi as u64, overflow)
                }
                32 => {
                    let lhs = sign_extend(state.regs.reg32(gpr::AX) as u64, 32);
                    let product = lhs * rhs;
                    let lo = product as u32;
                    let hi = (product >> 32) as u32;
                    let overflow = ((lo as i32) as i64) != product;
                    (lo as u64, hi as u64, overflow)
                }
                _ => {
                    let lhs = state.regs.reg64(gpr::AX) as i64 as i128;
                    let product = lhs * (rhs as i128);
                    let lo = product as u64;
                    let hi = (product >> 64) as u64;
                    let overflow = ((lo as i64) as i128) != product;
                    (lo, hi, overflow)
                }
            };
            match bits {
                8 => state.regs.set_reg16(gpr::AX, lo as u16),
                16 => {
                    state.regs.set_reg16(gpr::AX, lo as u16);
                    state.regs.set_reg16(gpr::DX, hi as u16);
                }
                32 => {
                    state.regs.set_reg32(gpr::AX, lo as u32);
                    state.regs.set_reg32(gpr::DX, hi as u32);
                }
                _ => {
                    state.regs.set_reg64(gpr::AX, lo);
                    state.regs.set_reg64(gpr::DX, hi);
                }
            }
            state.flags.cf.set(overflowed);
            state.flags.of.set(overflowed);
        }
        _ => {}
    }
    Ok(StepOutcome::Success)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::tests_support::TestBus;
    use crate::state::registers::gpr;
    use crate::traits::{TRAITS_386, TRAITS_V20};

    /// Reset leaves CS based at the top-of-address-space alias
    /// (`0xFFFF_0000`) with `xIP = 0xFFF0`; programs load at that linear
    /// address, matching `CpuState::reset`.
    fn load_program(bus: &mut TestBus, bytes: &[u8]) {
        for (i, b) in bytes.iter().enumerate() {
            bus.poke(0xFFFF_FFF0 + i as u64, *b);
        }
    }

    #[test]
    fn scenario_1_flag_affecting_add() {
        let mut state = CpuState::new(&TRAITS_386);
        let mut bus = TestBus::new();
        load_program(&mut bus, &[0x01, 0xC8]); // ADD AX, CX
        state.regs.set_reg16(gpr::AX, 0x0001);
        state.regs.set_reg16(gpr::CX, 0x00FF);

        let outcome = step(&mut state, &mut bus, None).unwrap();
        assert_eq!(outcome, StepOutcome::Success);
        assert_eq!(state.regs.reg16(gpr::AX), 0x0100);
        assert!(!state.flags.cf.is_set());
        assert!(state.flags.pf.is_set());
        assert!(state.flags.af.is_set());
        assert!(!state.flags.zf.is_set());
        assert!(!state.flags.sf.is_set());
        assert!(!state.flags.of.is_set());
    }

    #[test]
    fn scenario_2_rep_movsb() {
        let mut state = CpuState::new(&TRAITS_386);
        let mut bus = TestBus::new();
        load_program(&mut bus, &[0xF3, 0xA4]); // REP MOVSB

        state.regs.load_segment(sreg::DS, 0x1000, crate::state::registers::DescriptorCache { base: 0x10000, limit: 0xFFFF, access: 0x93, valid: true });
        state.regs.load_segment(sreg::ES, 0x2000, crate::state::registers::DescriptorCache { base: 0x20000, limit: 0xFFFF, access: 0x93, valid: true });
        for (i, b) in [0x41u8, 0x42, 0x43, 0x44].iter().enumerate() {
            bus.poke(0x10000 + i as u64, *b);
        }
        state.regs.set_reg16(gpr::SI, 0);
        state.regs.set_reg16(gpr::DI, 0);
        state.regs.set_reg16(gpr::CX, 4);
        state.flags.df.set(false);

        for expected in [StepOutcome::StringContinue, StepOutcome::StringContinue, StepOutcome::StringContinue, StepOutcome::Success] {
            let outcome = step(&mut state, &mut bus, None).unwrap();
            assert_eq!(outcome, expected);
        }

        assert_eq!(state.regs.reg16(gpr::CX), 0);
        assert_eq!(state.regs.reg16(gpr::SI), 4);
        assert_eq!(state.regs.reg16(gpr::DI), 4);
        for (i, expected) in [0x41u8, 0x42, 0x43, 0x44].iter().enumerate() {
            assert_eq!(bus.peek(0x20000 + i as u64), *expected);
        }
    }

    #[test]
    fn scenario_3_divide_by_zero_pushes_the_faulting_return_address() {
        let mut state = CpuState::new(&TRAITS_386);
        let mut bus = TestBus::new();
        load_program(&mut bus, &[0xF7, 0xF1]); // DIV CX
        state.regs.set_reg16(gpr::AX, 0x1000);
        state.regs.set_reg16(gpr::CX, 0);
        let start_xip = state.regs.xip;

        let outcome = step(&mut state, &mut bus, None).unwrap();
        assert_eq!(outcome, StepOutcome::CpuInterrupt(0));

        // #DE is a fault: the pushed return address points back at the DIV
        // itself, not past it, so a handler could in principle retry it.
        let sp = state.regs.reg16(gpr::SP);
        let pushed_ip = bus.peek(sp as u64) as u16 | ((bus.peek(sp as u64 + 1) as u16) << 8);
        assert_eq!(pushed_ip, start_xip as u16);
    }

    #[test]
    fn scenario_5_v25_secure_mode_translates_nop_to_hlt() {
        let mut state = CpuState::new(&TRAITS_V20);
        let mut bus = TestBus::new();
        load_program(&mut bus, &[0x90]);
        let mut table: SecureModeTranslation = [0u8; 256];
        for (i, b) in table.iter_mut().enumerate() {
            *b = i as u8;
        }
        table[0x90] = 0xF4;

        let outcome = step(&mut state, &mut bus, Some(&table)).unwrap();
        assert_eq!(outcome, StepOutcome::Halt);
        assert_eq!(state.exec.state, RunState::Halted);
    }

    #[test]
    fn pre_186_trait_silently_ignores_unknown_opcode() {
        let mut state = CpuState::new(&TRAITS_V20);
        let mut bus = TestBus::new();
        load_program(&mut bus, &[0x0F, 0xFF]); // unrecognized two-byte opcode
        let outcome = step(&mut state, &mut bus, None).unwrap();
        assert_eq!(outcome, StepOutcome::Undefined);
    }

    #[test]
    fn push_then_pop_round_trips_a_register() {
        let mut state = CpuState::new(&TRAITS_386);
        let mut bus = TestBus::new();
        load_program(&mut bus, &[0x50, 0x5B]); // PUSH AX; POP BX
        state.regs.set_reg16(gpr::SP, 0x1000);
        state.regs.set_reg16(gpr::AX, 0xBEEF);

        step(&mut state, &mut bus, None).unwrap();
        assert_eq!(state.regs.reg16(gpr::SP), 0x0FFE);
        step(&mut state, &mut bus, None).unwrap();
        assert_eq!(state.regs.reg16(gpr::BX), 0xBEEF);
        assert_eq!(state.regs.reg16(gpr::SP), 0x1000);
    }

    #[test]
    fn pusha_then_popa_restores_every_general_register() {
        let mut state = CpuState::new(&TRAITS_386);
        let mut bus = TestBus::new();
        load_program(&mut bus, &[0x60, 0x61]); // PUSHA; POPA
        state.regs.set_reg16(gpr::SP, 0x2000);
        state.regs.set_reg16(gpr::AX, 1);
        state.regs.set_reg16(gpr::CX, 2);
        state.regs.set_reg16(gpr::DX, 3);
        state.regs.set_reg16(gpr::BX, 4);
        state.regs.set_reg16(gpr::BP, 5);
        state.regs.set_reg16(gpr::SI, 6);
        state.regs.set_reg16(gpr::DI, 7);

        step(&mut state, &mut bus, None).unwrap();
        // Corrupt the registers in between so POPA has to actually restore them.
        for idx in [gpr::AX, gpr::CX, gpr::DX, gpr::BX, gpr::BP, gpr::SI, gpr::DI] {
            state.regs.set_reg16(idx, 0xDEAD);
        }
        step(&mut state, &mut bus, None).unwrap();

        assert_eq!(state.regs.reg16(gpr::AX), 1);
        assert_eq!(state.regs.reg16(gpr::CX), 2);
        assert_eq!(state.regs.reg16(gpr::DX), 3);
        assert_eq!(state.regs.reg16(gpr::BX), 4);
        assert_eq!(state.regs.reg16(gpr::BP), 5);
        assert_eq!(state.regs.reg16(gpr::SI), 6);
        assert_eq!(state.regs.reg16(gpr::DI), 7);
        assert_eq!(state.regs.reg16(gpr::SP), 0x2000);
    }

    #[test]
    fn jcc_branches_only_when_the_condition_holds() {
        let mut state = CpuState::new(&TRAITS_386);
        let mut bus = TestBus::new();
        load_program(&mut bus, &[0x74, 0x10]); // JZ +0x10
        let start = state.regs.xip;

        state.flags.zf.set(false);
        step(&mut state, &mut bus, None).unwrap();
        assert_eq!(state.regs.xip, start + 2, "ZF clear: fall through");

        state.regs.xip = start;
        state.flags.zf.set(true);
        step(&mut state, &mut bus, None).unwrap();
        assert_eq!(state.regs.xip, start + 2 + 0x10, "ZF set: branch taken");
    }

    #[test]
    fn group1_add_immediate_writes_back_and_sets_flags() {
        let mut state = CpuState::new(&TRAITS_386);
        let mut bus = TestBus::new();
        // ADD AL, imm8: 0x80 /0, ModRM 0xC0 selects AL, imm8 = 1.
        load_program(&mut bus, &[0x80, 0xC0, 0x01]);
        state.regs.set_reg16(gpr::AX, 0x00FF);

        step(&mut state, &mut bus, None).unwrap();
        assert_eq!(state.regs.reg16(gpr::AX) & 0xFF, 0x00);
        assert!(state.flags.cf.is_set());
        assert!(state.flags.zf.is_set());
    }

    #[test]
    fn group1_cmp_does_not_write_back() {
        let mut state = CpuState::new(&TRAITS_386);
        let mut bus = TestBus::new();
        // CMP AL, imm8: 0x80 /7, ModRM 0xF8 selects AL, imm8 = 1.
        load_program(&mut bus, &[0x80, 0xF8, 0x01]);
        state.regs.set_reg16(gpr::AX, 0x0005);

        step(&mut state, &mut bus, None).unwrap();
        assert_eq!(state.regs.reg16(gpr::AX), 0x0005, "CMP must not modify the destination");
        assert!(!state.flags.zf.is_set());
    }

    #[test]
    fn group2_shift_left_sets_carry_from_the_vacated_bit() {
        let mut state = CpuState::new(&TRAITS_386);
        let mut bus = TestBus::new();
        // SHL AX, imm8: 0xC1 /4, ModRM 0xE0 selects AX, count = 1.
        load_program(&mut bus, &[0xC1, 0xE0, 0x01]);
        state.regs.set_reg16(gpr::AX, 0x8001);

        step(&mut state, &mut bus, None).unwrap();
        assert_eq!(state.regs.reg16(gpr::AX), 0x0002);
        assert!(state.flags.cf.is_set(), "bit 15 shifted out into CF");
    }

    #[test]
    fn call_near_then_ret_round_trips_the_return_address() {
        let mut state = CpuState::new(&TRAITS_386);
        let mut bus = TestBus::new();
        // CALL rel16 +0x0003 lands on a RET placed right after the CALL.
        load_program(&mut bus, &[0xE8, 0x01, 0x00, 0x90, 0xC3]);
        state.regs.set_reg16(gpr::SP, 0x3000);
        let start = state.regs.xip;

        let outcome = step(&mut state, &mut bus, None).unwrap(); // CALL, lands directly on the RET byte
        assert_eq!(outcome, StepOutcome::Success);
        assert_eq!(state.regs.xip, start + 3 + 1);

        step(&mut state, &mut bus, None).unwrap(); // RET
        assert_eq!(state.regs.xip, start + 3);
        assert_eq!(state.regs.reg16(gpr::SP), 0x3000);
    }

    #[test]
    fn pushf_then_popf_round_trips_flags() {
        let mut state = CpuState::new(&TRAITS_386);
        let mut bus = TestBus::new();
        load_program(&mut bus, &[0x9C, 0x9D]); // PUSHF; POPF
        state.regs.set_reg16(gpr::SP, 0x4000);
        state.flags.cf.set(true);
        state.flags.zf.set(true);

        step(&mut state, &mut bus, None).unwrap();
        state.flags.cf.set(false);
        state.flags.zf.set(false);
        step(&mut state, &mut bus, None).unwrap();

        assert!(state.flags.cf.is_set());
        assert!(state.flags.zf.is_set());
        assert_eq!(state.regs.reg16(gpr::SP), 0x4000);
    }

    #[test]
    fn iret_restores_ip_cs_and_flags_and_clears_in_flight_exception() {
        let mut state = CpuState::new(&TRAITS_386);
        let mut bus = TestBus::new();
        load_program(&mut bus, &[0xCF]); // IRET
        state.regs.set_reg16(gpr::SP, 0x5000);
        state.exec.current_exception_class = Some(crate::state::ExceptionClass::Contributory);
        // Frame pushed on the stack as [IP][CS][FLAGS] from low to high address.
        bus.poke(0x5000, 0x34);
        bus.poke(0x5001, 0x12); // IP = 0x1234
        bus.poke(0x5002, 0x00);
        bus.poke(0x5003, 0x20); // CS = 0x2000
        bus.poke(0x5004, 0x02);
        bus.poke(0x5005, 0x00); // FLAGS = 0x0002 (reserved bit 1)

        step(&mut state, &mut bus, None).unwrap();
        assert_eq!(state.regs.xip, 0x1234);
        assert_eq!(state.regs.seg[sreg::CS].selector, 0x2000);
        assert_eq!(state.regs.reg16(gpr::SP), 0x5006);
        assert_eq!(state.exec.current_exception_class, None);
    }

    #[test]
    fn group5_inc_and_dec_leave_carry_untouched() {
        let mut state = CpuState::new(&TRAITS_386);
        let mut bus = TestBus::new();
        // INC AX (0xFF /0), DEC AX (0xFF /1), both ModRM mod=11 rm=AX.
        load_program(&mut bus, &[0xFF, 0xC0, 0xFF, 0xC8]);
        state.regs.set_reg16(gpr::AX, 0xFFFF);
        state.flags.cf.set(true);

        step(&mut state, &mut bus, None).unwrap(); // INC: 0xFFFF -> 0x0000
        assert_eq!(state.regs.reg16(gpr::AX), 0x0000);
        assert!(state.flags.zf.is_set());
        assert!(state.flags.cf.is_set(), "INC must not touch CF");

        step(&mut state, &mut bus, None).unwrap(); // DEC: 0x0000 -> 0xFFFF
        assert_eq!(state.regs.reg16(gpr::AX), 0xFFFF);
        assert!(state.flags.cf.is_set(), "DEC must not touch CF");
    }

    #[test]
    fn group5_call_near_through_a_register_pushes_return_address() {
        let mut state = CpuState::new(&TRAITS_386);
        let mut bus = TestBus::new();
        // CALL AX (0xFF /2), ModRM 0xD0 selects AX.
        load_program(&mut bus, &[0xFF, 0xD0]);
        state.regs.set_reg16(gpr::SP, 0x6000);
        state.regs.set_reg16(gpr::AX, 0x4242);
        let start = state.regs.xip;

        step(&mut state, &mut bus, None).unwrap();
        assert_eq!(state.regs.xip, 0x4242);
        assert_eq!(state.regs.reg16(gpr::SP), 0x5FFE);
        let pushed = bus.peek(0x5FFE) as u16 | ((bus.peek(0x5FFF) as u16) << 8);
        assert_eq!(pushed, (start + 2) as u16);
    }

    #[test]
    fn mul_sets_carry_and_overflow_only_when_the_upper_half_is_nonzero() {
        let mut state = CpuState::new(&TRAITS_386);
        let mut bus = TestBus::new();
        // MUL CX (0xF7 /4), ModRM 0xE1 selects CX.
        load_program(&mut bus, &[0xF7, 0xE1]);
        state.regs.set_reg16(gpr::AX, 0x1000);
        state.regs.set_reg16(gpr::CX, 0x0010);

        step(&mut state, &mut bus, None).unwrap();
        assert_eq!(state.regs.reg16(gpr::AX), 0x0000);
        assert_eq!(state.regs.reg16(gpr::DX), 0x0001);
        assert!(state.flags.cf.is_set());
        assert!(state.flags.of.is_set());
    }

    #[test]
    fn imul_one_operand_clears_overflow_when_the_product_fits() {
        let mut state = CpuState::new(&TRAITS_386);
        let mut bus = TestBus::new();
        // IMUL CX (0xF7 /5), ModRM 0xE9 selects CX.
        load_program(&mut bus, &[0xF7, 0xE9]);
        state.regs.set_reg16(gpr::AX, 3);
        state.regs.set_reg16(gpr::CX, (-2i16) as u16);

        step(&mut state, &mut bus, None).unwrap();
        assert_eq!(state.regs.reg16(gpr::AX), (-6i16) as u16);
        assert!(!state.flags.cf.is_set());
        assert!(!state.flags.of.is_set());
    }

    #[test]
    fn sysret_loads_cs_ss_from_star_and_eip_from_ecx() {
        use crate::state::registers::msr;
        let mut state = CpuState::new(&TRAITS_386);
        let mut bus = TestBus::new();
        load_program(&mut bus, &[0x0F, 0x07]); // SYSRET
        state.control.msr[msr::STAR] = 0x20u64 << 48;
        state.regs.set_reg32(gpr::CX, 0x5000);

        step(&mut state, &mut bus, None).unwrap();
        assert_eq!(state.regs.seg[sreg::CS].selector, 0x20u16.wrapping_add(16) | 3);
        assert_eq!(state.regs.seg[sreg::SS].selector, 0x20u16.wrapping_add(8) | 3);
        assert_eq!(state.regs.xip, 0x5000);
    }

    #[test]
    fn sysexit_loads_cs_ss_eip_esp_from_sysenter_msrs() {
        use crate::state::registers::msr;
        let mut state = CpuState::new(&TRAITS_386);
        let mut bus = TestBus::new();
        load_program(&mut bus, &[0x0F, 0x35]); // SYSEXIT
        state.control.msr[msr::SYSENTER_CS] = 0x30;
        state.regs.set_reg32(gpr::DX, 0x1000);
        state.regs.set_reg32(gpr::CX, 0x2000);

        step(&mut state, &mut bus, None).unwrap();
        assert_eq!(state.regs.seg[sreg::CS].selector, 0x30u16.wrapping_add(16) | 3);
        assert_eq!(state.regs.seg[sreg::SS].selector, 0x30u16.wrapping_add(24) | 3);
        assert_eq!(state.regs.xip, 0x1000);
        assert_eq!(state.regs.reg32(gpr::SP), 0x2000);
    }

    #[test]
    fn z80_emulation_mode_steps_its_own_small_opcode_subset() {
        let mut state = CpuState::new(&TRAITS_V20);
        let mut bus = TestBus::new();
        // DI; LD B,n (n=0x7); INC B; HALT, addressed from z80.pc=0.
        for (i, b) in [0xF3u8, 0x06, 0x07, 0x04, 0x76].iter().enumerate() {
            bus.poke(i as u64, *b);
        }
        state.md_enabled = false; // non-Extended family: MD clear selects Z80 emulation

        let outcomes: Vec<StepOutcome> = (0..4).map(|_| step(&mut state, &mut bus, None).unwrap()).collect();
        assert_eq!(outcomes, vec![StepOutcome::Success, StepOutcome::Success, StepOutcome::Success, StepOutcome::Halt]);
        assert!(!state.z80.iff1, "DI cleared IFF1");
        assert_eq!(read_z80_reg8(&state, 0), 0x08, "LD B,7 then INC B");
        assert_eq!(state.exec.state, RunState::Halted);
    }

    #[test]
    fn register_bank_sync_runs_after_every_step_on_bank_capable_traits() {
        use crate::state::registers::gpr as g;
        use crate::state::banks::bank_slot;
        use crate::traits::TRAITS_V25;
        let mut state = CpuState::new(&TRAITS_V25);
        let mut bus = TestBus::new();
        load_program(&mut bus, &[0x90]); // NOP
        state.regs.set_reg16(g::AX, 0x9999);

        step(&mut state, &mut bus, None).unwrap();
        assert_eq!(state.banks.active_bank().slots[bank_slot::AW], 0x9999);
    }

    #[test]
    fn instruction_fetch_marks_the_page_table_accessed_bit() {
        let mut state = CpuState::new(&TRAITS_386);
        let mut bus = TestBus::new();
        state.control.cr[3] = 0x3000;
        state.control.cr[0] |= crate::state::registers::Cr0Flags::PG.bits();
        // PDE 0 as an identity-mapped present/writable 4MiB large page,
        // same shape as mmu.rs's own `legacy_32bit_large_page_translates`.
        const PTE_PRESENT: u32 = 1 << 0;
        const PTE_WRITE: u32 = 1 << 1;
        const PTE_ACCESSED: u32 = 1 << 5;
        const PTE_PS: u32 = 1 << 7;
        let pde = PTE_PRESENT | PTE_WRITE | PTE_PS;
        for (i, b) in pde.to_le_bytes().iter().enumerate() {
            bus.poke(0x3000 + i as u64, *b);
        }
        state.regs.seg[sreg::CS].cache.base = 0;
        state.regs.xip = 0x1000;
        bus.poke(0x1000, 0x90); // NOP at the identity-mapped address

        step(&mut state, &mut bus, None).unwrap();

        let mut buf = [0u8; 4];
        bus.mem_read(AccessLevel::User, 0x3000, &mut buf).unwrap();
        let entry = u32::from_le_bytes(buf);
        assert_ne!(entry & PTE_ACCESSED, 0, "fetch must mark the A-bit");
    }
}
