//! Host-boundary error taxonomy.
//!
//! Architectural faults/traps/aborts (the things a real CPU would vector
//! through the IDT) are *not* represented here — see [`crate::except`] for
//! that in-band channel. This enum only covers conditions that are bugs in
//! how the engine is being driven from the outside: bad snapshot buffers,
//! decode overruns, and features the traits record declares unsupported.

use thiserror::Error;

/// Errors surfaced at the library boundary, not to architectural code.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum CoreError {
    /// A save/restore buffer was too small or malformed.
    #[error("state buffer too small: need {need} bytes, got {got}")]
    BufferTooSmall {
        /// Bytes required.
        need: usize,
        /// Bytes supplied.
        got: usize,
    },

    /// Instruction decode exceeded the 15-byte x86 instruction length limit.
    #[error("instruction length exceeded 15 bytes")]
    InstructionTooLong,

    /// A CPU-model index passed to the traits registry has no entry.
    #[error("unknown cpu model id {0}")]
    UnknownCpuModel(u32),

    /// An SMM save-state format is declared but not implemented.
    ///
    /// See DESIGN.md: the Cyrix GX2/LX layout is an open question in the
    /// original source and is deliberately not guessed at.
    #[error("unsupported SMM save-state format: {0}")]
    UnsupportedSmmFormat(&'static str),

    /// A mode transition named by the spec is left open per DESIGN.md.
    #[error("unimplemented mode transition: {0}")]
    UnimplementedTransition(&'static str),

    /// A bus access while serializing or restoring the SMM save area faulted.
    #[error("bus fault accessing the SMM save area")]
    SmmSaveAreaFault,
}

pub type CoreResult<T> = Result<T, CoreError>;
