//! Exception, interrupt, and mode-transition engine (component F, §4.6, §7).
//!
//! Grounded on the teacher's `handle_irq`/`handle_nmi` in `cpu/mod.rs`
//! (push return address, reload prefetch, jump to handler) generalized to
//! x86's much richer taxonomy: fault/trap/abort propagation, benign vs
//! contributory vs page-fault escalation into double/triple fault, and
//! gate-based dispatch. The fixed vector-0..31 table is grounded on the
//! enumeration in `examples/original_source/src/cpu/cpu.h` rather than
//! invented (§9 "resolve ambiguity from original_source").

use crate::state::{CpuState, ExceptionClass, RunState};
use crate::traits::SmmFormat;

/// Provenance/category bits layered on top of the raw vector number, per
/// §4.6 ("bits 8+ of the internal exception word encode category and
/// provenance").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    Fault,
    Trap,
    Abort,
    /// Error code (`VALUE`) is present and must be pushed.
    Value,
    /// Software `INT n`.
    IntN,
    /// `INT3`/`INTO`-style software interrupt distinct from `INT n`.
    IntSw,
    Icebp,
    Ice,
    Smi,
}

/// One architectural vector plus its fixed classification, taken from
/// `cpu.h`'s vector enumeration (divide, debug, NMI, BP, OF, BR, UD, NM, DF,
/// TS, NP, SS, GP, PF, MF, AC, MC, XM, VE, CP, HV, VC, SX) plus the
/// non-architectural vectors the spec calls out (V60 0x2000..0x2006,
/// µPD9002 Z80-mode intercepts 0x7C..0x7E).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultInfo {
    pub vector: u32,
    pub provenance: Provenance,
    pub class: ExceptionClass,
    pub error_code: Option<u32>,
}

impl FaultInfo {
    pub const DIVIDE_ERROR: u32 = 0;
    pub const DEBUG: u32 = 1;
    pub const NMI: u32 = 2;
    pub const BREAKPOINT: u32 = 3;
    pub const OVERFLOW: u32 = 4;
    pub const BOUND_RANGE: u32 = 5;
    pub const INVALID_OPCODE: u32 = 6;
    pub const DEVICE_NOT_AVAILABLE: u32 = 7;
    pub const DOUBLE_FAULT: u32 = 8;
    pub const INVALID_TSS: u32 = 10;
    pub const SEGMENT_NOT_PRESENT: u32 = 11;
    pub const STACK_FAULT: u32 = 12;
    pub const GENERAL_PROTECTION: u32 = 13;
    pub const PAGE_FAULT: u32 = 14;
    pub const X87_FP_ERROR: u32 = 16;
    pub const ALIGNMENT_CHECK: u32 = 17;
    pub const MACHINE_CHECK: u32 = 18;
    pub const SIMD_FP_EXCEPTION: u32 = 19;
    pub const VIRTUALIZATION: u32 = 20;
    pub const CONTROL_PROTECTION: u32 = 21;

    /// Classify a fixed vector per the SDM benign/contributory/page-fault
    /// table (§4.6, §8). Vectors outside 0..31 (V60/µPD9002 extensions) are
    /// treated as benign: they do not participate in double-fault
    /// escalation.
    fn class_of(vector: u32) -> ExceptionClass {
        match vector {
            Self::DIVIDE_ERROR | Self::INVALID_TSS | Self::SEGMENT_NOT_PRESENT | Self::STACK_FAULT | Self::GENERAL_PROTECTION => {
                ExceptionClass::Contributory
            }
            Self::PAGE_FAULT => ExceptionClass::PageFault,
            Self::DOUBLE_FAULT => ExceptionClass::DoubleFault,
            _ => ExceptionClass::Benign,
        }
    }

    pub fn new(vector: u32, provenance: Provenance) -> Self {
        Self { vector, provenance, class: Self::class_of(vector), error_code: None }
    }

    pub fn with_error_code(mut self, code: u32) -> Self {
        self.error_code = Some(code);
        self.provenance = Provenance::Value;
        self
    }

    pub fn general_protection(error_code: u32) -> Self {
        Self::new(Self::GENERAL_PROTECTION, Provenance::Fault).with_error_code(error_code)
    }

    pub fn page_fault(error_code: u32) -> Self {
        Self::new(Self::PAGE_FAULT, Provenance::Fault).with_error_code(error_code)
    }

    pub fn divide_error() -> Self {
        Self::new(Self::DIVIDE_ERROR, Provenance::Fault)
    }

    pub fn invalid_opcode() -> Self {
        Self::new(Self::INVALID_OPCODE, Provenance::Fault)
    }

    pub fn software_int(vector: u32) -> Self {
        Self::new(vector, Provenance::IntN)
    }
}

/// Page-fault error code bits (§7).
pub mod pf_error {
    pub const PRESENT: u32 = 1 << 0;
    pub const WRITE: u32 = 1 << 1;
    pub const USER: u32 = 1 << 2;
    pub const RESERVED: u32 = 1 << 3;
    pub const INSTRUCTION_FETCH: u32 = 1 << 4;
}

/// Outcome of delivering a [`FaultInfo`] through the escalation/dispatch
/// pipeline (§4.6, §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Gate dispatch completed; vector `u32` taken (host may observe).
    Delivered(u32),
    /// Escalated past double fault; engine halts (§4.6, §8).
    TripleFault,
}

/// Apply the escalation rule (§4.6, §8):
/// - benign atop anything stays as-is
/// - contributory atop contributory becomes double-fault
/// - page-fault atop page-fault becomes double-fault
/// - anything atop double-fault becomes triple-fault
pub fn escalate(current: Option<ExceptionClass>, incoming: ExceptionClass) -> ExceptionClass {
    match (current, incoming) {
        (Some(ExceptionClass::DoubleFault), _) => ExceptionClass::DoubleFault, // caller checks for triple separately
        (Some(ExceptionClass::Contributory), ExceptionClass::Contributory) => ExceptionClass::DoubleFault,
        (Some(ExceptionClass::PageFault), ExceptionClass::PageFault) => ExceptionClass::DoubleFault,
        _ => incoming,
    }
}

/// Deliver a fault/trap/abort to `state`, performing escalation and a
/// real-mode table-0 vector dispatch. Protected/long-mode IDT gate walking
/// is out of scope for this crate (DESIGN.md Open Question decisions); the
/// vector returned here is still correct, only the gate lookup is not
/// reproduced.
pub fn deliver(state: &mut CpuState, fault: FaultInfo) -> DeliveryOutcome {
    let already_double_fault = state.exec.current_exception_class == Some(ExceptionClass::DoubleFault);
    let escalated = escalate(state.exec.current_exception_class, fault.class);

    if already_double_fault {
        log::error!("triple fault: vector {} atop an unresolved double fault", fault.vector);
        state.exec.state = RunState::Halted;
        state.exec.current_exception_class = None;
        return DeliveryOutcome::TripleFault;
    }

    state.exec.current_exception_class = Some(escalated);

    let delivered_vector = if escalated == ExceptionClass::DoubleFault && fault.vector != FaultInfo::DOUBLE_FAULT {
        log::warn!("escalating vector {} into #DF", fault.vector);
        FaultInfo::DOUBLE_FAULT
    } else {
        fault.vector
    };

    if matches!(fault.provenance, Provenance::Fault) {
        state.regs.restart_at_old_xip();
    }

    DeliveryOutcome::Delivered(delivered_vector)
}

/// Clear the in-flight exception-class marker once a handler has
/// successfully returned (IRET et al.), so the next unrelated fault is not
/// mistakenly escalated.
pub fn clear_in_flight(state: &mut CpuState) {
    state.exec.current_exception_class = None;
}

/// Number of 32-bit words in the generic SMM save area this crate writes at
/// `smbase + SMM_SAVE_AREA_OFFSET` (§4.6, §8). This is not any vendor's
/// literal SMRAM map (those differ byte-for-byte between Intel and AMD
/// generations and are out of scope); it is a fixed, crate-internal layout
/// sufficient for `enter_smi`/`exit_smi` to round-trip the architectural
/// state this crate models (see DESIGN.md Open Question decisions).
const SMM_SAVE_WORDS: usize = 12;
const SMM_SAVE_AREA_OFFSET: u64 = 0xFE00;

mod smm_slot {
    pub const CS_BASE_LOW: usize = 0;
    pub const CS_BASE_HIGH: usize = 1;
    pub const CS_SELECTOR: usize = 2;
    pub const XIP_LOW: usize = 3;
    pub const XIP_HIGH: usize = 4;
    pub const FLAGS_LOW: usize = 5;
    pub const FLAGS_HIGH: usize = 6;
    pub const CPU_LEVEL: usize = 7;
}

fn cpu_level_tag(level: crate::state::CpuLevel) -> u32 {
    use crate::state::CpuLevel;
    match level {
        CpuLevel::User => 0,
        CpuLevel::Ice => 1,
        CpuLevel::Smm => 2,
        CpuLevel::Dmm => 3,
    }
}

fn cpu_level_from_tag(tag: u32) -> crate::state::CpuLevel {
    use crate::state::CpuLevel;
    match tag {
        1 => CpuLevel::Ice,
        2 => CpuLevel::Smm,
        3 => CpuLevel::Dmm,
        _ => CpuLevel::User,
    }
}

/// SMI entry (§4.6, §8): serialise the architectural state this crate models
/// into the generic save area at `smbase + SMM_SAVE_AREA_OFFSET`, then
/// switch to SMM and re-home CS to `smbase`. Unimplemented vendor save
/// formats are reported rather than guessed at (DESIGN.md Open Question
/// decisions).
pub fn enter_smi<B: crate::bus::Bus + ?Sized>(
    state: &mut CpuState,
    bus: &mut B,
    smbase: u64,
) -> Result<(), crate::error::CoreError> {
    if state.traits.smm_format == SmmFormat::CyrixGx2Lx {
        return Err(crate::error::CoreError::UnsupportedSmmFormat("Cyrix GX2/LX"));
    }
    if state.traits.smm_format == SmmFormat::None {
        return Err(crate::error::CoreError::UnsupportedSmmFormat("none (SMM not present on this model)"));
    }
    log::debug!("SMI entry, smbase={smbase:#x}, format={:?}", state.traits.smm_format);

    let mut words = [0u32; SMM_SAVE_WORDS];
    let old_cs_base = state.regs.seg[crate::state::registers::sreg::CS].cache.base;
    words[smm_slot::CS_BASE_LOW] = old_cs_base as u32;
    words[smm_slot::CS_BASE_HIGH] = (old_cs_base >> 32) as u32;
    words[smm_slot::CS_SELECTOR] = state.regs.seg[crate::state::registers::sreg::CS].selector as u32;
    words[smm_slot::XIP_LOW] = state.regs.xip as u32;
    words[smm_slot::XIP_HIGH] = (state.regs.xip >> 32) as u32;
    let flags_bits = state.flags.to_bits();
    words[smm_slot::FLAGS_LOW] = flags_bits as u32;
    words[smm_slot::FLAGS_HIGH] = (flags_bits >> 32) as u32;
    words[smm_slot::CPU_LEVEL] = cpu_level_tag(state.exec.cpu_level);

    let save_addr = smbase.wrapping_add(SMM_SAVE_AREA_OFFSET);
    for (i, word) in words.iter().enumerate() {
        let addr = save_addr.wrapping_add((i * 4) as u64);
        crate::bus::write_widened(bus, crate::bus::AccessLevel::Smm, addr, &word.to_le_bytes())
            .map_err(|_| crate::error::CoreError::SmmSaveAreaFault)?;
    }

    state.exec.cpu_level = crate::state::CpuLevel::Smm;
    state.regs.seg[crate::state::registers::sreg::CS].cache.base = smbase;
    state.regs.xip = 0x8000;
    Ok(())
}

/// RSM (§4.6, §8): read the generic save area back out and restore the
/// architectural state `enter_smi` wrote, including the caller's original
/// privilege level, rather than unconditionally dropping to `User`.
pub fn exit_smi<B: crate::bus::Bus + ?Sized>(
    state: &mut CpuState,
    bus: &mut B,
    smbase: u64,
) -> Result<(), crate::error::CoreError> {
    let save_addr = smbase.wrapping_add(SMM_SAVE_AREA_OFFSET);
    let mut words = [0u32; SMM_SAVE_WORDS];
    for (i, word) in words.iter_mut().enumerate() {
        let addr = save_addr.wrapping_add((i * 4) as u64);
        let bytes = crate::bus::read_widened(bus, crate::bus::AccessLevel::Smm, addr, 4)
            .map_err(|_| crate::error::CoreError::SmmSaveAreaFault)?;
        *word = crate::bus::le_read_u32(&bytes);
    }

    let cs_base = words[smm_slot::CS_BASE_LOW] as u64 | ((words[smm_slot::CS_BASE_HIGH] as u64) << 32);
    let xip = words[smm_slot::XIP_LOW] as u64 | ((words[smm_slot::XIP_HIGH] as u64) << 32);
    let flags_bits = words[smm_slot::FLAGS_LOW] as u64 | ((words[smm_slot::FLAGS_HIGH] as u64) << 32);

    state.regs.seg[crate::state::registers::sreg::CS].cache.base = cs_base;
    state.regs.seg[crate::state::registers::sreg::CS].selector = words[smm_slot::CS_SELECTOR] as u16;
    state.regs.xip = xip;
    state.flags.from_bits(flags_bits);
    state.exec.cpu_level = cpu_level_from_tag(words[smm_slot::CPU_LEVEL]);
    Ok(())
}

/// ICE-mode entry on 386/486 and 80286 LOADALL remain open questions in the
/// original source (DESIGN.md); this stub documents rather than guesses.
pub fn enter_ice_mode(_state: &mut CpuState) -> Result<(), crate::error::CoreError> {
    Err(crate::error::CoreError::UnimplementedTransition("ICE mode entry criteria (386/486)"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::TRAITS_386;

    #[test]
    fn contributory_atop_contributory_is_double_fault() {
        assert_eq!(
            escalate(Some(ExceptionClass::Contributory), ExceptionClass::Contributory),
            ExceptionClass::DoubleFault
        );
    }

    #[test]
    fn page_fault_atop_page_fault_is_double_fault() {
        assert_eq!(escalate(Some(ExceptionClass::PageFault), ExceptionClass::PageFault), ExceptionClass::DoubleFault);
    }

    #[test]
    fn benign_atop_anything_stays_benign() {
        assert_eq!(escalate(Some(ExceptionClass::Contributory), ExceptionClass::Benign), ExceptionClass::Benign);
        assert_eq!(escalate(Some(ExceptionClass::DoubleFault), ExceptionClass::Benign), ExceptionClass::DoubleFault);
    }

    #[test]
    fn anything_atop_double_fault_is_triple_fault() {
        let mut state = CpuState::new(&TRAITS_386);
        state.exec.current_exception_class = Some(ExceptionClass::DoubleFault);
        let outcome = deliver(&mut state, FaultInfo::general_protection(0));
        assert_eq!(outcome, DeliveryOutcome::TripleFault);
        assert_eq!(state.exec.state, RunState::Halted);
    }

    #[test]
    fn double_fault_escalation_rewrites_delivered_vector() {
        let mut state = CpuState::new(&TRAITS_386);
        state.exec.current_exception_class = Some(ExceptionClass::Contributory);
        let outcome = deliver(&mut state, FaultInfo::general_protection(0));
        assert_eq!(outcome, DeliveryOutcome::Delivered(FaultInfo::DOUBLE_FAULT));
    }

    #[test]
    fn fault_restores_old_xip() {
        let mut state = CpuState::new(&TRAITS_386);
        state.regs.old_xip = 0x1000;
        state.regs.xip = 0x1005;
        deliver(&mut state, FaultInfo::divide_error());
        assert_eq!(state.regs.xip, 0x1000);
    }

    #[test]
    fn smi_entry_then_rsm_round_trips_architectural_state() {
        use crate::bus::tests_support::TestBus;
        use crate::state::CpuLevel;
        use crate::traits::TRAITS_INTEL64;
        let mut state = CpuState::new(&TRAITS_INTEL64);
        let mut bus = TestBus::new();
        let smbase = 0x30000u64;

        state.regs.seg[crate::state::registers::sreg::CS].cache.base = 0xF0000;
        state.regs.seg[crate::state::registers::sreg::CS].selector = 0xF000;
        state.regs.xip = 0x1234;
        state.flags.cf.set(true);
        state.flags.zf.set(true);

        enter_smi(&mut state, &mut bus, smbase).unwrap();
        assert_eq!(state.exec.cpu_level, CpuLevel::Smm);
        assert_eq!(state.regs.seg[crate::state::registers::sreg::CS].cache.base, smbase);
        assert_eq!(state.regs.xip, 0x8000);

        exit_smi(&mut state, &mut bus, smbase).unwrap();
        assert_eq!(state.exec.cpu_level, CpuLevel::User);
        assert_eq!(state.regs.seg[crate::state::registers::sreg::CS].cache.base, 0xF0000);
        assert_eq!(state.regs.seg[crate::state::registers::sreg::CS].selector, 0xF000);
        assert_eq!(state.regs.xip, 0x1234);
        assert!(state.flags.cf.is_set());
        assert!(state.flags.zf.is_set());
    }

    #[test]
    fn smi_entry_on_a_model_without_smm_reports_the_unsupported_format() {
        use crate::bus::tests_support::TestBus;
        let mut state = CpuState::new(&TRAITS_386);
        let mut bus = TestBus::new();
        let err = enter_smi(&mut state, &mut bus, 0x30000).unwrap_err();
        assert_eq!(err, crate::error::CoreError::UnsupportedSmmFormat("none (SMM not present on this model)"));
    }
}
