//! x87 state (component B, G). Four register banks to support the IIT
//! layout (only bank 0 is used on every other vendor); tag word of 2-bit
//! entries; FOP/FCS/FDS/FIP/FDP error pointers; a queued-operation slot so
//! the host can continue while FSAVE/FSTENV "finishes" asynchronously
//! (§3, §4.8).

/// One 80-bit extended-precision x87 register, stored as raw bytes to avoid
/// committing to a software-float representation here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct X87Reg(pub [u8; 10]);

impl Default for X87Reg {
    fn default() -> Self {
        X87Reg([0; 10])
    }
}

/// 2-bit tag-word entry per the SDM: valid / zero / special / empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TagEntry {
    Valid,
    Zero,
    Special,
    #[default]
    Empty,
}

/// A queued FPU operation the host may still be "completing" asynchronously
/// (§3, §4.8): the x87 engine lets the x86 core continue executing while a
/// slow FSAVE/FSTENV finishes draining to memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueuedOp {
    #[default]
    None,
    Fsave {
        segment: u16,
        offset: u32,
    },
    Fstenv {
        segment: u16,
        offset: u32,
    },
}

/// One bank of 8 x87 registers (IIT FPUs expose four; everyone else one).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct X87Bank {
    pub regs: [X87Reg; 8],
    pub tags: [TagEntry; 8],
}

impl Default for X87Bank {
    fn default() -> Self {
        Self { regs: [X87Reg::default(); 8], tags: [TagEntry::default(); 8] }
    }
}

/// Full x87 coprocessor state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct X87State {
    /// IIT FPUs expose 4 banks; `active_bank` selects which one ST(0..7)
    /// currently addresses.
    pub banks: [X87Bank; 4],
    pub active_bank: u8,
    /// `top` field of the status word: ST(0) = physical register `top`.
    pub top: u8,
    pub control_word: u16,
    pub status_word: u16,
    /// Deferred/sticky exception flags not yet folded into `status_word`
    /// (§4.8 "deferred exception" model: an unmasked exception fires on the
    /// *next* FPU instruction, not the one that produced it).
    pub pending_exceptions: u8,
    pub fop: u16,
    pub fcs: u16,
    pub fds: u16,
    pub fip: u32,
    pub fdp: u32,
    pub queued: QueuedOp,
}

impl Default for X87State {
    fn default() -> Self {
        Self {
            banks: [X87Bank::default(); 4],
            active_bank: 0,
            top: 0,
            control_word: 0x037F, // Power-on default per SDM.
            status_word: 0,
            pending_exceptions: 0,
            fop: 0,
            fcs: 0,
            fds: 0,
            fip: 0,
            fdp: 0,
            queued: QueuedOp::None,
        }
    }
}

impl X87State {
    pub fn bank(&self) -> &X87Bank {
        &self.banks[self.active_bank as usize]
    }
    pub fn bank_mut(&mut self) -> &mut X87Bank {
        &mut self.banks[self.active_bank as usize]
    }

    /// Physical register index for logical ST(i).
    pub fn physical(&self, st_index: u8) -> usize {
        ((self.top as usize) + st_index as usize) % 8
    }

    /// Mask bits 0..5 of the control word (IM/DM/ZM/OM/UM/PM), per SDM layout.
    pub fn exception_masked(&self, bit: u8) -> bool {
        self.control_word & (1 << bit) != 0
    }

    /// Record a sticky exception flag and, if unmasked, arm it to fire on
    /// the next FPU instruction rather than immediately (§4.8).
    pub fn raise_exception(&mut self, bit: u8) {
        self.status_word |= 1 << bit;
        if !self.exception_masked(bit) {
            self.pending_exceptions |= 1 << bit;
        }
    }

    /// Consume any exception armed by a previous instruction; returns the
    /// bit number of the first one found, if any.
    pub fn take_pending_exception(&mut self) -> Option<u8> {
        if self.pending_exceptions == 0 {
            return None;
        }
        let bit = self.pending_exceptions.trailing_zeros() as u8;
        self.pending_exceptions &= !(1 << bit);
        Some(bit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masked_exception_is_sticky_but_not_armed() {
        let mut fpu = X87State::default();
        // PM (precision mask) is bit 5; power-on control word masks it.
        assert!(fpu.exception_masked(5));
        fpu.raise_exception(5);
        assert_ne!(fpu.status_word & (1 << 5), 0, "sticky PE bit set");
        assert_eq!(fpu.take_pending_exception(), None, "masked exception never arms");
    }

    #[test]
    fn unmasked_exception_fires_on_next_instruction_not_immediately() {
        let mut fpu = X87State::default();
        fpu.control_word &= !(1 << 5); // unmask PM
        fpu.raise_exception(5);
        // The instruction that produced it does not see the exception land
        // here; the *caller* (exec/except) decides when to consume it.
        assert_eq!(fpu.pending_exceptions, 1 << 5);
        assert_eq!(fpu.take_pending_exception(), Some(5));
        assert_eq!(fpu.take_pending_exception(), None);
    }
}
