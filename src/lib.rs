//! Multi-generation x86-family instruction-processing engine.
//!
//! Covers the 8086 through AVX-512/APX instruction set architecture, the
//! NEC V-series (V20/V25/V33/V55/µPD9002/V60) and Cyrix/AMD/VIA derivative
//! lineages, the x87 FPU family, and the Intel 8089 I/O coprocessor, behind
//! a single trait-selected core rather than one model per crate (§4.1).
//!
//! # Architecture
//!
//! - [`traits`]: the per-model feature/behavior registry (component A)
//! - [`state`]: the register file, flag lanes, and coprocessor state
//!   aggregate (component B)
//! - [`bus`] / [`mmu`]: host callback contract and segmentation/paging
//!   translation (component C)
//! - [`parser`]: prefix/opcode/ModRM decode (component D)
//! - [`exec`]: per-opcode semantics and the `step()` contract (component E)
//! - [`except`]: fault/trap/abort classification and delivery (component F)
//! - [`coproc`]: x87 and 8089 asynchronous steps (component G)
//! - [`emu`]: the host-facing orchestrator tying the above together (§6)
//!
//! No OS APIs are used; all I/O crosses the [`bus::Bus`] trait the host
//! implements. There is no CLI or file-based configuration surface — the
//! [`traits::CpuTraits`] registry is the entire configuration surface (§6).

pub mod bus;
pub mod coproc;
pub mod emu;
pub mod error;
pub mod except;
pub mod exec;
pub mod mmu;
pub mod parser;
pub mod state;
pub mod traits;

pub use emu::Emu;
pub use error::{CoreError, CoreResult};
pub use exec::StepOutcome;
pub use state::CpuState;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::tests_support::TestBus;
    use crate::traits::TRAITS_386;

    #[test]
    fn emu_round_trips_reset_and_a_single_nop() {
        let mut emu = Emu::new(&TRAITS_386);
        let mut bus = TestBus::new();
        bus.poke(0xFFFF_FFF0, 0x90);
        assert_eq!(emu.step(&mut bus).unwrap(), StepOutcome::Success);
        emu.reset(true);
        assert_eq!(emu.state.regs.xip, 0xFFF0);
    }
}
