//! 8089 I/O coprocessor channel-program step (component G, §3, §4.7).
//!
//! Grounded on [`crate::state::x89`]'s channel model: each call advances one
//! channel by one channel-program "instruction" rather than decoding real
//! 8089 machine code, the same granularity `exec::step` uses for the main
//! x86 pipeline. The one-step start-transfer delay recorded by
//! `start_transfer_pending` is honored here, not in the state module.

use crate::state::x89::{Channel, X89State};

/// The channel-program operations this crate models: the transfer life
/// cycle a host needs to drive DMA-like channel programs end to end, at the
/// same one-step-per-call granularity as `exec::step` (full 8089 machine-code
/// decode is a separate, larger piece of work — see DESIGN.md Open Question
/// decisions).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum X89Op {
    /// `SINTR`-equivalent: arm the channel to begin transferring next step.
    StartTransfer,
    /// Move one byte from the GA address to the GB address, decrementing
    /// BC. The byte value itself is supplied by the caller, which already
    /// performed the actual bus access (this module owns channel state,
    /// not memory).
    TransferByte(u8),
    /// Halt the channel program (`HLT`-equivalent).
    Halt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum X89Outcome {
    /// Channel armed, will begin transferring on the next step.
    Armed,
    /// One byte transferred; `remaining` is the post-decrement byte count.
    Transferred { remaining: u32 },
    /// BC reached zero: the channel program completed and posted its
    /// interrupt-service request to the host (§4.7).
    Completed,
    /// Channel already halted; the call was a no-op.
    Halted,
}

/// Advance one channel by one step. Returns `Halted` without touching state
/// if the channel wasn't running and no `StartTransfer` was requested.
pub fn step_x89(x89: &mut X89State, channel_index: usize, op: X89Op) -> X89Outcome {
    match op {
        X89Op::StartTransfer => {
            let ch = x89.channel_mut(channel_index);
            ch.start_transfer_pending = true;
            X89Outcome::Armed
        }
        X89Op::Halt => {
            let ch = x89.channel_mut(channel_index);
            ch.running = false;
            ch.start_transfer_pending = false;
            X89Outcome::Halted
        }
        X89Op::TransferByte(_byte) => {
            let ch = x89.channel_mut(channel_index);
            if ch.start_transfer_pending {
                ch.start_transfer_pending = false;
                ch.running = true;
            }
            if !ch.running {
                return X89Outcome::Halted;
            }

            advance_addresses(ch);

            let remaining = ch.bc.get().wrapping_sub(1);
            ch.bc.set(remaining, ch.bc.io_space);

            if remaining == 0 {
                ch.running = false;
                x89.signal_interrupt_service(channel_index);
                X89Outcome::Completed
            } else {
                X89Outcome::Transferred { remaining }
            }
        }
    }
}

fn advance_addresses(ch: &mut Channel) {
    ch.ga.set(ch.ga.get().wrapping_add(1), ch.ga.io_space);
    ch.gb.set(ch.gb.get().wrapping_add(1), ch.gb.io_space);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::x89::PSW_IS;

    fn armed_channel(byte_count: u32) -> X89State {
        let mut x89 = X89State { present: true, ..X89State::default() };
        x89.channel_mut(0).bc.set(byte_count, false);
        x89
    }

    #[test]
    fn start_transfer_is_deferred_to_the_next_step() {
        let mut x89 = armed_channel(2);
        let outcome = step_x89(&mut x89, 0, X89Op::StartTransfer);
        assert_eq!(outcome, X89Outcome::Armed);
        assert!(!x89.channel(0).running, "not running until the next step");
    }

    #[test]
    fn byte_count_reaching_zero_completes_and_signals_the_host() {
        let mut x89 = armed_channel(2);
        step_x89(&mut x89, 0, X89Op::StartTransfer);

        let first = step_x89(&mut x89, 0, X89Op::TransferByte(0x41));
        assert_eq!(first, X89Outcome::Transferred { remaining: 1 });
        assert!(x89.channel(0).running);
        assert_eq!(x89.channel(0).psw & PSW_IS, 0, "not done yet");

        let second = step_x89(&mut x89, 0, X89Op::TransferByte(0x42));
        assert_eq!(second, X89Outcome::Completed);
        assert!(!x89.channel(0).running);
        assert_ne!(x89.channel(0).psw & PSW_IS, 0);
    }

    #[test]
    fn transfer_on_a_halted_channel_is_a_no_op() {
        let mut x89 = armed_channel(5);
        let outcome = step_x89(&mut x89, 0, X89Op::TransferByte(0xFF));
        assert_eq!(outcome, X89Outcome::Halted);
        assert_eq!(x89.channel(0).bc.get(), 5);
    }

    #[test]
    fn halt_clears_running_and_any_pending_start() {
        let mut x89 = armed_channel(3);
        step_x89(&mut x89, 0, X89Op::StartTransfer);
        step_x89(&mut x89, 0, X89Op::Halt);
        assert!(!x89.channel(0).running);
        assert!(!x89.channel(0).start_transfer_pending);
    }
}
