//! Segmentation + paging translation pipeline (component C, §4.5).
//!
//! Every architectural access is: effective address in segment → segment
//! check → linear address → (if `CR0.PG` or V33 XA) paging → physical
//! address → [`crate::bus::Bus`]. This module owns everything up to the
//! physical address; the byte-wise widened access itself lives in
//! `bus.rs`, grounded on the teacher's address-routing front end.

use crate::bus::{AccessKind, AccessLevel, Bus};
use crate::except::{pf_error, FaultInfo};
use crate::state::registers::{sreg, CpuMode, DescriptorCache};
use crate::state::CpuState;

/// Selector-load descriptor, as a host-supplied GDT/LDT resolver would
/// return it (§4.5: "type check, privilege check, limit read, descriptor
/// refill").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawDescriptor {
    pub base: u64,
    pub limit: u32,
    pub access: u16,
    pub is_code: bool,
    pub is_system: bool,
    pub dpl: u8,
}

/// Host-supplied descriptor-table resolver, kept separate from [`Bus`]
/// because descriptor tables live in guest memory the host may cache or
/// shadow differently from ordinary RAM (§4.5).
pub trait DescriptorTable {
    fn resolve_selector(&mut self, table_base: u64, table_limit: u32, selector: u16) -> Option<RawDescriptor>;
}

/// Load a segment register, performing the §4.5 checks: null-selector
/// handling (only legal for non-SS, outside 64-bit mode), privilege check
/// against CPL/RPL, and descriptor-cache refill. Real mode and V8086 skip
/// the table walk entirely: the "descriptor" is synthesised from the
/// selector value itself (§3 "hidden cache mirrors the legacy base=sel<<4
/// rule in real mode").
pub fn load_segment(
    state: &mut CpuState,
    table: &mut impl DescriptorTable,
    seg_index: usize,
    selector: u16,
) -> Result<(), FaultInfo> {
    match state.regs.mode {
        CpuMode::Real | CpuMode::Virtual8086 => {
            state.regs.load_segment(
                seg_index,
                selector,
                DescriptorCache { base: (selector as u64) << 4, limit: 0xFFFF, access: 0x93, valid: true },
            );
            Ok(())
        }
        _ => {
            if selector & !0x7 == 0 {
                if seg_index == sreg::SS {
                    return Err(FaultInfo::general_protection(0));
                }
                state.regs.load_segment(seg_index, 0, DescriptorCache::default());
                return Ok(());
            }

            let gdtr = state.regs.table[crate::state::registers::tablereg::GDTR];
            let ldtr = state.regs.table[crate::state::registers::tablereg::LDTR];
            let from_ldt = selector & 0x4 != 0;
            let (table_base, table_limit) = if from_ldt { (ldtr.base, ldtr.limit) } else { (gdtr.base, gdtr.limit) };

            let desc = table
                .resolve_selector(table_base, table_limit, selector)
                .ok_or_else(|| FaultInfo::general_protection(selector as u32 & !0x7))?;

            let rpl = (selector & 0x3) as u8;
            let required_dpl = desc.dpl.max(rpl).max(if seg_index == sreg::SS { state.exec.cpl } else { 0 });
            if seg_index == sreg::SS && desc.dpl != state.exec.cpl {
                return Err(FaultInfo::new(FaultInfo::STACK_FAULT, crate::except::Provenance::Fault)
                    .with_error_code(selector as u32 & !0x7));
            }
            if required_dpl < desc.dpl {
                return Err(FaultInfo::general_protection(selector as u32 & !0x7));
            }

            state.regs.load_segment(
                seg_index,
                selector,
                DescriptorCache { base: desc.base, limit: desc.limit, access: desc.access, valid: true },
            );
            Ok(())
        }
    }
}

/// Compute the linear address for `offset` within segment `seg_index`,
/// raising the segment's natural fault if `offset..offset+len` runs past
/// the cached limit (§4.5). Long mode segments (except FS/GS) are treated
/// as base=0/limit=unbounded per `enter_long_mode_segment_defaults`.
pub fn linear_address(state: &CpuState, seg_index: usize, offset: u64, len: u64, kind: AccessKind) -> Result<u64, FaultInfo> {
    let seg = &state.regs.seg[seg_index];
    if !matches!(state.regs.mode, CpuMode::Real | CpuMode::Virtual8086 | CpuMode::Long64) {
        let last_byte = offset.wrapping_add(len.saturating_sub(1));
        if last_byte > seg.cache.limit as u64 {
            let fault = if seg_index == sreg::SS {
                FaultInfo::new(FaultInfo::STACK_FAULT, crate::except::Provenance::Fault).with_error_code(0)
            } else {
                FaultInfo::general_protection(0)
            };
            return Err(fault);
        }
    }
    let _ = kind;
    Ok(seg.cache.base.wrapping_add(offset))
}

/// One level of a hierarchical page-table walk, abstracted so the same
/// function drives 32-bit, PAE, and 4-/5-level long-mode paging (§4.5,
/// spec's "Non-goals: exact TLB timing" — only correctness is modelled,
/// no caching).
fn walk_entry<B: Bus + ?Sized>(
    bus: &mut B,
    level: AccessLevel,
    table_phys: u64,
    index: u64,
    entry_bytes: u64,
) -> Result<u64, FaultInfo> {
    let entry_addr = table_phys + index * entry_bytes;
    let mut buf = [0u8; 8];
    bus.mem_read(level, entry_addr, &mut buf[..entry_bytes as usize])?;
    Ok(if entry_bytes == 8 { u64::from_le_bytes(buf) } else { u32::from_le_bytes(buf[..4].try_into().unwrap()) as u64 })
}

const PTE_PRESENT: u64 = 1 << 0;
const PTE_WRITE: u64 = 1 << 1;
const PTE_USER: u64 = 1 << 2;
const PTE_ACCESSED: u64 = 1 << 5;
const PTE_DIRTY: u64 = 1 << 6;
const PTE_PS: u64 = 1 << 7;
const PHYS_ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// Paging modes the walker supports (§3 "32-bit, PAE, and 4-/5-level").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingMode {
    None,
    Legacy32,
    Pae,
    LongMode4Level,
    LongMode5Level,
}

pub fn paging_mode(state: &CpuState) -> PagingMode {
    use crate::state::registers::{Cr4Flags, EferFlags};
    let cr0_pg = state.control.cr0() & crate::state::registers::Cr0Flags::PG != crate::state::registers::Cr0Flags::empty();
    if !cr0_pg && !state.v33_paging.xa_enabled {
        return PagingMode::None;
    }
    if !cr0_pg {
        // V33 XA mode paging with CR0.PG clear: NEC's extended-addressing
        // page dictionary is a flat one-level 32-bit-style walk (§4.5 "(if
        // CR0.PG or V33 XA) paging"), not the long-mode hierarchy below.
        return PagingMode::Legacy32;
    }
    if state.control.efer_flags().contains(EferFlags::LMA) {
        if state.control.cr4().contains(Cr4Flags::LA57) {
            PagingMode::LongMode5Level
        } else {
            PagingMode::LongMode4Level
        }
    } else if state.control.cr4().contains(Cr4Flags::PAE) {
        PagingMode::Pae
    } else {
        PagingMode::Legacy32
    }
}

/// Translate a linear address to a physical address, walking the page
/// tables per the active [`PagingMode`]. Returns the linear address
/// unchanged when paging is disabled.
pub fn translate<B: Bus + ?Sized>(
    state: &CpuState,
    bus: &mut B,
    linear: u64,
    kind: AccessKind,
) -> Result<u64, FaultInfo> {
    let mode = paging_mode(state);
    if mode == PagingMode::None {
        return Ok(linear);
    }

    let level = AccessLevel::from(state.exec.cpu_level);
    let cr3 = state.control.cr[3];
    let is_write = matches!(kind, AccessKind::Write);
    let is_fetch = matches!(kind, AccessKind::Fetch);
    let is_user = state.exec.cpl == 3;

    let levels: &[(u64, u64)] = match mode {
        PagingMode::Legacy32 => &[(22, 10), (12, 10)],
        PagingMode::Pae => &[(30, 2), (21, 9), (12, 9)],
        PagingMode::LongMode4Level => &[(39, 9), (30, 9), (21, 9), (12, 9)],
        PagingMode::LongMode5Level => &[(48, 9), (39, 9), (30, 9), (21, 9), (12, 9)],
        PagingMode::None => unreachable!(),
    };
    let entry_bytes: u64 = if mode == PagingMode::Legacy32 { 4 } else { 8 };

    let mut table_phys = cr3 & PHYS_ADDR_MASK;
    let mut entry = 0u64;
    for (depth, (shift, bits)) in levels.iter().enumerate() {
        let index = (linear >> shift) & ((1u64 << bits) - 1);
        entry = walk_entry(bus, level, table_phys, index, entry_bytes)?;

        if entry & PTE_PRESENT == 0 {
            return Err(page_fault(linear, is_write, is_user, is_fetch, false));
        }
        if is_write && entry & PTE_WRITE == 0 {
            return Err(page_fault(linear, is_write, is_user, is_fetch, true));
        }
        if is_user && entry & PTE_USER == 0 {
            return Err(page_fault(linear, is_write, is_user, is_fetch, true));
        }

        let is_last = depth == levels.len() - 1;
        if !is_last && entry & PTE_PS != 0 {
            // Large page: stop walking early, remaining linear bits pass through.
            let offset_bits = if depth == levels.len() - 2 { *shift } else { 0 };
            let page_base = entry & PHYS_ADDR_MASK;
            return Ok(page_base | (linear & ((1u64 << offset_bits) - 1)));
        }
        if is_last {
            break;
        }
        table_phys = entry & PHYS_ADDR_MASK;
    }

    let page_base = entry & PHYS_ADDR_MASK;
    Ok(page_base | (linear & 0xFFF))
}

fn page_fault(_linear: u64, is_write: bool, is_user: bool, is_fetch: bool, present: bool) -> FaultInfo {
    let mut code = 0u32;
    if present {
        code |= pf_error::PRESENT;
    }
    if is_write {
        code |= pf_error::WRITE;
    }
    if is_user {
        code |= pf_error::USER;
    }
    if is_fetch {
        code |= pf_error::INSTRUCTION_FETCH;
    }
    FaultInfo::page_fault(code)
}

/// Mark a PTE accessed/dirty after a successful translation. Kept separate
/// from [`translate`] (which takes `&CpuState`) because it requires a
/// read-modify-write back through the bus; callers invoke it only after
/// the access itself has succeeded (§4.5 "access/dirty bits").
pub fn mark_accessed_dirty<B: Bus + ?Sized>(
    state: &CpuState,
    bus: &mut B,
    linear: u64,
    is_write: bool,
) -> Result<(), FaultInfo> {
    let mode = paging_mode(state);
    if mode == PagingMode::None {
        return Ok(());
    }
    let level = AccessLevel::from(state.exec.cpu_level);
    let cr3 = state.control.cr[3] & PHYS_ADDR_MASK;
    let entry_bytes: u64 = if mode == PagingMode::Legacy32 { 4 } else { 8 };
    let levels: &[(u64, u64)] = match mode {
        PagingMode::Legacy32 => &[(22, 10), (12, 10)],
        PagingMode::Pae => &[(30, 2), (21, 9), (12, 9)],
        PagingMode::LongMode4Level => &[(39, 9), (30, 9), (21, 9), (12, 9)],
        PagingMode::LongMode5Level => &[(48, 9), (39, 9), (30, 9), (21, 9), (12, 9)],
        PagingMode::None => unreachable!(),
    };

    let mut table_phys = cr3;
    for (depth, (shift, bits)) in levels.iter().enumerate() {
        let index = (linear >> shift) & ((1u64 << bits) - 1);
        let entry_addr = table_phys + index * entry_bytes;
        let mut buf = [0u8; 8];
        bus.mem_read(level, entry_addr, &mut buf[..entry_bytes as usize])?;
        let mut entry = if entry_bytes == 8 {
            u64::from_le_bytes(buf)
        } else {
            u32::from_le_bytes(buf[..4].try_into().unwrap()) as u64
        };

        let is_last = depth == levels.len() - 1 || entry & PTE_PS != 0;
        entry |= PTE_ACCESSED;
        if is_last && is_write {
            entry |= PTE_DIRTY;
        }
        let out = if entry_bytes == 8 { entry.to_le_bytes().to_vec() } else { (entry as u32).to_le_bytes().to_vec() };
        bus.mem_write(level, entry_addr, &out)?;

        if is_last {
            break;
        }
        table_phys = entry & PHYS_ADDR_MASK;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::tests_support::TestBus;
    use crate::traits::TRAITS_386;

    fn identity_map_386(bus: &mut TestBus, cr3: u64) {
        // One PDE covering 0..4MiB as a 4MiB large page.
        let pde = (0u64) | PTE_PRESENT | PTE_WRITE | PTE_PS;
        for (i, b) in (pde as u32).to_le_bytes().iter().enumerate() {
            bus.poke(cr3 + i as u64, *b);
        }
    }

    #[test]
    fn paging_disabled_is_identity() {
        let state = CpuState::new(&TRAITS_386);
        let mut bus = TestBus::new();
        let phys = translate(&state, &mut bus, 0x1234, AccessKind::Read).unwrap();
        assert_eq!(phys, 0x1234);
    }

    #[test]
    fn legacy_32bit_large_page_translates() {
        let mut state = CpuState::new(&TRAITS_386);
        state.control.cr[3] = 0x3000;
        state.control.cr[0] |= crate::state::registers::Cr0Flags::PG.bits();
        let mut bus = TestBus::new();
        identity_map_386(&mut bus, 0x3000);
        let phys = translate(&state, &mut bus, 0x2000, AccessKind::Read).unwrap();
        assert_eq!(phys, 0x2000);
    }

    #[test]
    fn not_present_pde_raises_page_fault() {
        let mut state = CpuState::new(&TRAITS_386);
        state.control.cr[3] = 0x3000;
        state.control.cr[0] |= crate::state::registers::Cr0Flags::PG.bits();
        let mut bus = TestBus::new();
        let err = translate(&state, &mut bus, 0x2000, AccessKind::Read).unwrap_err();
        assert_eq!(err.vector, FaultInfo::PAGE_FAULT);
    }

    #[test]
    fn real_mode_segment_load_is_base_times_16() {
        let mut state = CpuState::new(&TRAITS_386);
        struct NoTable;
        impl DescriptorTable for NoTable {
            fn resolve_selector(&mut self, _: u64, _: u32, _: u16) -> Option<RawDescriptor> {
                None
            }
        }
        load_segment(&mut state, &mut NoTable, sreg::DS, 0x1000).unwrap();
        assert_eq!(state.regs.seg[sreg::DS].cache.base, 0x10000);
    }

    #[test]
    fn v33_xa_enabled_selects_legacy32_paging_even_with_cr0_pg_clear() {
        let mut state = CpuState::new(&TRAITS_386);
        assert_eq!(paging_mode(&state), PagingMode::None);

        state.v33_paging.xa_enabled = true;
        assert_eq!(paging_mode(&state), PagingMode::Legacy32);
    }

    #[test]
    fn cr0_pg_without_v33_xa_still_selects_legacy32() {
        let mut state = CpuState::new(&TRAITS_386);
        state.control.cr[0] |= crate::state::registers::Cr0Flags::PG.bits();
        assert_eq!(paging_mode(&state), PagingMode::Legacy32);
    }
}
