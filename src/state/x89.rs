//! 8089 I/O coprocessor state (component B, G, §3, §4.7).

/// A tagged 20-bit register: the tag discriminates memory-space vs
/// I/O-space addressing for that register's current value (§4.7: "the TP
/// register is the channel program counter with its tag discriminating
/// memory vs I/O space").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TaggedReg {
    pub value: u32, // low 20 bits significant
    pub io_space: bool,
}

impl TaggedReg {
    pub const MASK: u32 = 0xF_FFFF;

    pub fn get(&self) -> u32 {
        self.value & Self::MASK
    }
    pub fn set(&mut self, value: u32, io_space: bool) {
        self.value = value & Self::MASK;
        self.io_space = io_space;
    }
}

/// One 8089 channel: eight tagged registers (GA/GB/GC general-address,
/// BC byte-count, TP task-pointer/program-counter, IX index, CC channel
/// control, MC mask/compare), a 20-bit parameter pointer, an 8-bit PSW, a
/// running flag, and a one-instruction start-transfer delay (§3, §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Channel {
    pub ga: TaggedReg,
    pub gb: TaggedReg,
    pub gc: TaggedReg,
    pub bc: TaggedReg,
    pub tp: TaggedReg,
    pub ix: TaggedReg,
    pub cc: TaggedReg,
    pub mc: TaggedReg,
    pub pp: u32, // 20-bit parameter pointer
    pub psw: u8,
    pub running: bool,
    /// Set by `SINTR`/channel-attention handshakes: the channel has a
    /// transfer queued to begin on the *next* channel step, not this one.
    pub start_transfer_pending: bool,
}

/// PSW bit for "interrupt service requested to host" (§4.7).
pub const PSW_IS: u8 = 1 << 5;

/// Full 8089 coprocessor state: presence flag, SYSBUS/SOC configuration
/// words, the channel-common pointer, and the two channels (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct X89State {
    pub present: bool,
    pub sysbus: u8,
    pub soc: u8,
    /// Channel-common block pointer (`cp`); its control words select
    /// whether each channel executes in system or program space (§4.7).
    pub cp: u32,
    pub channels: [Channel; 2],
}

impl X89State {
    pub fn channel(&self, index: usize) -> &Channel {
        &self.channels[index]
    }
    pub fn channel_mut(&mut self, index: usize) -> &mut Channel {
        &mut self.channels[index]
    }

    /// Raise the host-visible interrupt-service bit on a channel's PSW,
    /// which the surrounding platform maps onto an x86 IRQ line (§4.7).
    pub fn signal_interrupt_service(&mut self, channel: usize) {
        self.channels[channel].psw |= PSW_IS;
    }
}
