//! Processor state model (component B) and its lifecycle (§3).
//!
//! One [`CpuState`] aggregate per emulated CPU, parameterised by an
//! immutable [`crate::traits::CpuTraits`] reference. Grounded on the
//! teacher's `Cpu` struct in `cpu/mod.rs` (a single plain-old-data register
//! file plus a handful of execution-control booleans) generalized from one
//! CPU generation to the full 8086..APX span plus the NEC/8089/x87/Z80
//! sub-states the spec names. Per §9 "pointer-graph state": everything below
//! is a tagged, single-owner aggregate addressed by array index, never a
//! back-pointer.

pub mod banks;
pub mod flags;
pub mod fpu;
pub mod limits;
pub mod registers;
pub mod simd;
pub mod x89;
pub mod z80;

use crate::traits::CpuTraits;
use registers::{ControlSet, CpuMode, RegisterFile};

/// Run state (§3, §4.6 state machine).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    Halted,
    /// V25/V55 STP instruction (lower-power stop, distinct from HALT).
    Stopped,
}

/// Nested privilege level (§3). DMM has no modelled transitions yet — see
/// DESIGN.md Open Question decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuLevel {
    User,
    Smm,
    Ice,
    Dmm,
}

/// Which non-local exit target a fault dispatches through (§3, §4.4, §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    /// Exceptions are observable and dispatch through the IDT/gate path.
    Normal,
    /// Speculative fetch; exceptions are suppressed rather than dispatched.
    Prefetch,
}

/// SDM double/triple-fault escalation class (§4.6, §8; GLOSSARY).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionClass {
    Benign,
    Contributory,
    PageFault,
    DoubleFault,
}

/// Prefetch-queue model (§4.4). `size == 0` means byte-at-a-time fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefetchQueue {
    pub size: usize,
    pub data: Vec<u8>,
    /// Linear address of the first byte still in `data`.
    pub base_pointer: u64,
    /// Linear address the next fetch-from-bus will target.
    pub next_fetch_pointer: u64,
}

impl PrefetchQueue {
    pub fn new(size: usize) -> Self {
        Self { size, data: Vec::with_capacity(size), base_pointer: 0, next_fetch_pointer: 0 }
    }

    /// A write at `addr` invalidates the queue unless it falls within
    /// `[next_fetch_pointer - size, next_fetch_pointer)`, in which case the
    /// stale prefetched bytes are faithfully executed instead (§4.4, §8).
    pub fn write_invalidates(&self, addr: u64) -> bool {
        if self.size == 0 {
            return true;
        }
        let window_start = self.next_fetch_pointer.saturating_sub(self.size as u64);
        !(window_start..self.next_fetch_pointer).contains(&addr)
    }

    pub fn invalidate(&mut self) {
        self.data.clear();
        self.base_pointer = self.next_fetch_pointer;
    }
}

/// Saved prefixes/segment/rep/operand-size state letting a string or WAIT
/// instruction resume after an interrupt (§3, GLOSSARY "restart descriptor").
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RestartDescriptor {
    pub active: bool,
    pub rep_prefix: Option<crate::parser::RepState>,
    pub segment_override: Option<usize>,
    pub operand_size_override: bool,
    pub address_size_override: bool,
    pub resume_xip: u64,
}

/// Execution-control fields (§3): run state, privilege nesting, pending
/// results, fault-recovery slots, prefetch, and the restart descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionControl {
    pub state: RunState,
    pub cpu_level: CpuLevel,
    pub cpl: u8,
    pub fetch_mode: FetchMode,
    pub current_exception_class: Option<ExceptionClass>,
    pub prefetch: PrefetchQueue,
    pub restart: RestartDescriptor,
    /// One-shot inhibit of maskable interrupts after STI/MOV SS/POP SS (§4.2).
    pub inhibit_interrupts_next: bool,
}

impl ExecutionControl {
    fn new(prefetch_queue_size: u8) -> Self {
        Self {
            state: RunState::Running,
            cpu_level: CpuLevel::User,
            cpl: 0,
            fetch_mode: FetchMode::Normal,
            current_exception_class: None,
            prefetch: PrefetchQueue::new(prefetch_queue_size as usize),
            restart: RestartDescriptor::default(),
            inhibit_interrupts_next: false,
        }
    }
}

/// The full processor-state aggregate (§3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuState {
    pub traits: &'static CpuTraits,
    pub regs: RegisterFile,
    pub flags: flags::FlagLanes,
    pub control: ControlSet,
    pub fpu: fpu::X87State,
    pub simd: simd::SimdState,
    pub banks: banks::RegisterBanks,
    pub v33_paging: banks::V33PagingAux,
    pub peripherals: banks::PeripheralBlock,
    pub z80: z80::Z80State,
    pub x89: x89::X89State,
    pub exec: ExecutionControl,
    /// Emulation-mode flag MD (§3, §4.6): true = native x86, false = 8080/Z80
    /// emulation on V20/µPD9002. Polarity inverted on the `Extended` family.
    pub md_enabled: bool,
    /// Mixed-memory-mode ADL toggle, eZ80-lineage vendor extension (teacher
    /// crate's `madl`), kept here because the spec's V-series family tree
    /// includes eZ80-adjacent parts.
    pub madl: bool,
}

impl CpuState {
    /// Construct a new aggregate for the given trait record and perform a
    /// hard reset (§3 "created once; reset initialises traits/defaults").
    pub fn new(traits: &'static CpuTraits) -> Self {
        let mut state = Self {
            traits,
            regs: RegisterFile::default(),
            flags: flags::FlagLanes::default(),
            control: ControlSet::default(),
            fpu: fpu::X87State::default(),
            simd: simd::SimdState::default(),
            banks: banks::RegisterBanks::default(),
            v33_paging: banks::V33PagingAux::default(),
            peripherals: banks::PeripheralBlock::default(),
            z80: z80::Z80State::default(),
            x89: x89::X89State { present: traits.has_8089, ..x89::X89State::default() },
            exec: ExecutionControl::new(traits.prefetch_queue_size),
            md_enabled: true,
            madl: false,
        };
        state.reset(true);
        state
    }

    /// Reset (§6 `reset(state, hard)`). `hard` reinitialises everything;
    /// soft performs an INIT-equivalent subset: CS:xIP to the reset vector,
    /// CR0.PE cleared, most of the rest preserved.
    pub fn reset(&mut self, hard: bool) {
        if hard {
            log::debug!("hard reset: {}", self.traits.description);
            self.regs = RegisterFile::default();
            self.flags = flags::FlagLanes::default();
            self.control = ControlSet::default();
            self.fpu = fpu::X87State::default();
            self.simd = simd::SimdState::default();
            self.banks = banks::RegisterBanks::default();
            self.v33_paging = banks::V33PagingAux::default();
            self.peripherals = banks::PeripheralBlock::default();
            self.z80 = z80::Z80State::default();
            self.x89 = x89::X89State { present: self.traits.has_8089, ..x89::X89State::default() };
            self.md_enabled = true;
            self.madl = false;
        } else {
            log::debug!("soft reset (INIT): {}", self.traits.description);
            self.control.cr[0] &= !registers::Cr0Flags::PE.bits();
        }

        // Real-mode reset vector: CS selector 0xF000, base forced to
        // 0xFFFF0000 for the classic "reset to top of address space" alias
        // on 32-bit+ parts, 0xF0000 on pure 8086-class parts.
        self.regs.seg[registers::sreg::CS].selector = 0xF000;
        self.regs.seg[registers::sreg::CS].cache = registers::DescriptorCache {
            base: 0xFFFF_0000,
            limit: 0xFFFF,
            access: 0x9B,
            valid: true,
        };
        self.regs.xip = 0xFFF0;
        self.regs.old_xip = self.regs.xip;
        self.regs.mode = CpuMode::Real;
        self.exec.state = RunState::Running;
        self.exec.cpu_level = CpuLevel::User;
        self.exec.cpl = 0;
        self.exec.prefetch.invalidate();
        self.exec.restart = RestartDescriptor::default();
        self.exec.current_exception_class = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::TRAITS_386;

    #[test]
    fn hard_reset_forces_reset_vector_and_running_state() {
        let state = CpuState::new(&TRAITS_386);
        assert_eq!(state.regs.xip, 0xFFF0);
        assert_eq!(state.regs.seg[registers::sreg::CS].selector, 0xF000);
        assert_eq!(state.exec.state, RunState::Running);
    }

    #[test]
    fn soft_reset_clears_pe_but_preserves_gprs() {
        let mut state = CpuState::new(&TRAITS_386);
        state.control.cr[0] |= registers::Cr0Flags::PE.bits();
        state.regs.set_reg32(registers::gpr::AX, 0xDEAD_BEEF);
        state.reset(false);
        assert_eq!(state.control.cr0() & registers::Cr0Flags::PE, registers::Cr0Flags::empty());
        assert_eq!(state.regs.reg32(registers::gpr::AX), 0xDEAD_BEEF);
    }

    #[test]
    fn prefetch_write_within_window_does_not_invalidate() {
        let mut q = PrefetchQueue::new(6);
        q.next_fetch_pointer = 0x200;
        assert!(!q.write_invalidates(0x1FE));
        assert!(q.write_invalidates(0x200));
        assert!(q.write_invalidates(0x100));
    }

    #[test]
    fn zero_size_prefetch_queue_always_invalidates() {
        let q = PrefetchQueue::new(0);
        assert!(q.write_invalidates(0));
    }
}
