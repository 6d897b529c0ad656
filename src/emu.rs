//! Host-facing orchestrator (§5, §6): owns one [`CpuState`], exposes the
//! three independent step entry points (x86/x87/x89), reset, and interrupt
//! injection. Grounded on the teacher's `Emu` — a thin struct wrapping CPU +
//! bus plus a ring-buffer execution history for crash diagnostics — with the
//! TI-84-specific framebuffer/ROM/key-matrix surface dropped (out of scope:
//! this crate has no peripherals of its own, §1 Non-goals) and the single
//! `step`/`run_cycles` pair replaced by the three independent step entry
//! points §5 requires ("the host is responsible for sequencing x86/x87/x89
//! progress").

use crate::bus::Bus;
use crate::coproc::x87::{self, X87Op, X87Outcome};
use crate::coproc::x89::{self, X89Op, X89Outcome};
use crate::except::FaultInfo;
use crate::exec::{self, StepOutcome};
use crate::parser::SecureModeTranslation;
use crate::state::CpuState;
use crate::traits::CpuTraits;

/// Number of entries in the instruction-retirement ring buffer kept for
/// crash diagnostics (teacher's `HISTORY_SIZE`).
const HISTORY_SIZE: usize = 64;

#[derive(Clone, Copy, Default)]
struct HistoryEntry {
    xip: u64,
    outcome_tag: u8,
}

/// Ring buffer of the last `HISTORY_SIZE` retired steps, oldest overwritten
/// first (teacher's `ExecutionHistory`).
struct ExecutionHistory {
    entries: [HistoryEntry; HISTORY_SIZE],
    write_idx: usize,
    count: usize,
}

impl ExecutionHistory {
    fn new() -> Self {
        Self { entries: [HistoryEntry::default(); HISTORY_SIZE], write_idx: 0, count: 0 }
    }

    fn record(&mut self, xip: u64, outcome: StepOutcome) {
        self.entries[self.write_idx] = HistoryEntry { xip, outcome_tag: outcome_tag(outcome) };
        self.write_idx = (self.write_idx + 1) % HISTORY_SIZE;
        self.count = (self.count + 1).min(HISTORY_SIZE);
    }

    fn clear(&mut self) {
        self.write_idx = 0;
        self.count = 0;
    }

    fn iter(&self) -> impl Iterator<Item = &HistoryEntry> {
        let start = if self.count < HISTORY_SIZE { 0 } else { self.write_idx };
        (0..self.count).map(move |i| &self.entries[(start + i) % HISTORY_SIZE])
    }
}

fn outcome_tag(outcome: StepOutcome) -> u8 {
    match outcome {
        StepOutcome::Success => 0,
        StepOutcome::StringContinue => 1,
        StepOutcome::Halt => 2,
        StepOutcome::CpuInterrupt(_) => 3,
        StepOutcome::IceInterrupt => 4,
        StepOutcome::Irq(_) => 5,
        StepOutcome::TripleFault => 6,
        StepOutcome::InhibitInterrupts => 7,
        StepOutcome::Undefined => 8,
    }
}

/// The single aggregate a host embeds: CPU state plus the diagnostics ring
/// buffer. The bus, secure-mode translation table, and coprocessor op
/// streams are all supplied per call rather than owned here, matching §5's
/// "register file and bus are owned exclusively by the state aggregate;
/// the host drives progress" split.
pub struct Emu {
    pub state: CpuState,
    history: ExecutionHistory,
    secure_translation: Option<SecureModeTranslation>,
}

impl Emu {
    /// Create a new orchestrator for the given CPU model's trait record
    /// (§4.1 "traits select behavior, never a branch on a raw model id").
    pub fn new(traits: &'static CpuTraits) -> Self {
        Self { state: CpuState::new(traits), history: ExecutionHistory::new(), secure_translation: None }
    }

    /// Install or clear a V25/V55 secure-mode opcode substitution table
    /// (§4.1, §4.2).
    pub fn set_secure_mode_translation(&mut self, table: Option<SecureModeTranslation>) {
        self.secure_translation = table;
    }

    /// Reset (§6 `reset(state, hard)`).
    pub fn reset(&mut self, hard: bool) {
        self.state.reset(hard);
        self.history.clear();
    }

    /// Advance the x86 pipeline by at most one architectural instruction.
    pub fn step(&mut self, bus: &mut dyn Bus) -> Result<StepOutcome, crate::error::CoreError> {
        let xip = self.state.regs.xip;
        let outcome = exec::step(&mut self.state, bus, self.secure_translation.as_ref())?;
        self.history.record(xip, outcome);
        Ok(outcome)
    }

    /// Advance the x87 coprocessor by at most one queued/deferred-exception
    /// step (§4.8, §5).
    pub fn step_x87(&mut self, op: X87Op) -> Result<X87Outcome, FaultInfo> {
        x87::step_x87(&mut self.state, op)
    }

    /// Advance one 8089 channel by at most one channel-program step (§4.7,
    /// §5).
    pub fn step_x89(&mut self, channel: usize, op: X89Op) -> X89Outcome {
        x89::step_x89(&mut self.state.x89, channel, op)
    }

    /// Inject a hardware interrupt (§6 `hardware_interrupt`). Returns
    /// `false` if the CPU is not currently accepting interrupts (IF clear,
    /// or the one-shot inhibit window from a just-executed STI/MOV SS).
    pub fn hardware_interrupt(&mut self, bus: &mut dyn Bus, vector: u32) -> bool {
        if self.state.exec.inhibit_interrupts_next {
            self.state.exec.inhibit_interrupts_next = false;
            return false;
        }
        if !self.state.flags.r#if.is_set() {
            return false;
        }
        exec::dispatch_real_mode_interrupt(&mut self.state, bus, vector).is_ok()
    }

    /// Dump the retirement history for crash diagnostics (teacher's
    /// `dump_history`), newest last.
    pub fn dump_history(&self) -> String {
        let mut out = String::new();
        out.push_str("retirement history (oldest to newest):\n");
        for entry in self.history.iter() {
            out.push_str(&format!("  xIP={:#010x} outcome_tag={}\n", entry.xip, entry.outcome_tag));
        }
        out.push_str(&format!("current xIP: {:#010x}\n", self.state.regs.xip));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::tests_support::TestBus;
    use crate::traits::TRAITS_386;

    #[test]
    fn new_emu_starts_at_the_reset_vector() {
        let emu = Emu::new(&TRAITS_386);
        assert_eq!(emu.state.regs.xip, 0xFFF0);
    }

    #[test]
    fn step_records_history_and_advances_xip() {
        let mut emu = Emu::new(&TRAITS_386);
        let mut bus = TestBus::new();
        bus.poke(0xFFFF_FFF0, 0x90); // NOP
        let outcome = emu.step(&mut bus).unwrap();
        assert_eq!(outcome, StepOutcome::Success);
        assert_eq!(emu.state.regs.xip, 0xFFF1);
        assert!(emu.dump_history().contains("outcome_tag=0"));
    }

    #[test]
    fn reset_clears_history() {
        let mut emu = Emu::new(&TRAITS_386);
        let mut bus = TestBus::new();
        bus.poke(0xFFFF_FFF0, 0x90);
        emu.step(&mut bus).unwrap();
        emu.reset(true);
        assert_eq!(emu.dump_history().matches("outcome_tag").count(), 0);
    }

    #[test]
    fn hardware_interrupt_is_refused_while_if_is_clear() {
        let mut emu = Emu::new(&TRAITS_386);
        let mut bus = TestBus::new();
        assert!(!emu.state.flags.r#if.is_set());
        assert!(!emu.hardware_interrupt(&mut bus, 0x20));
    }
}
