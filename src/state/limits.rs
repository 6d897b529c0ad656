//! Register-file sizing constants, carried over from `cpu.h`.

/// General-purpose register count: RAX..RDI, R8..R31 (post-APX).
pub const GPR_COUNT: usize = 32;
/// Segment registers: ES, CS, SS, DS, DS3, DS2, FS, GS (V55 adds DS2/DS3).
pub const SR_COUNT: usize = 8;
/// Table registers: GDTR, IDTR, LDTR, TR.
pub const TABLEREG_COUNT: usize = 4;
/// Control registers CR0..CR15.
pub const CR_COUNT: usize = 16;
/// Debug registers DR0..DR15.
pub const DR_COUNT: usize = 16;
/// Test registers (386/486/Pentium scheme) TR386_0..TR386_15.
pub const TR386_COUNT: usize = 16;
/// SIMD registers (up to ZMM31, 512 bits each).
pub const SIMD_COUNT: usize = 32;
/// SIMD register width in bytes (ZMM = 64 bytes).
pub const SIMD_WIDTH_BYTES: usize = 64;
/// AVX-512 opmask registers k0..k7.
pub const MASK_REG_COUNT: usize = 8;
/// AMX tile registers tmm0..tmm7.
pub const TILE_COUNT: usize = 8;
/// Bytes per AMX tile row.
pub const TILE_ROW_BYTES: usize = 64;
/// Rows per AMX tile.
pub const TILE_ROWS: usize = 16;
/// MPX bound register pairs BND0..BND3.
pub const MPX_BOUNDS_COUNT: usize = 4;
/// V25/V55 register bank slot count (16-bit words per bank).
pub const BANK_SLOT_COUNT: usize = 16;
/// Maximum V55 register banks.
pub const MAX_REGISTER_BANKS: usize = 16;
/// V33 page dictionary entry count.
pub const V33_PAGE_DICT_COUNT: usize = 64;
/// 186-family peripheral control block size, in 16-bit words.
pub const PCB_WORD_COUNT: usize = 128;
/// V25 internal RAM size, in bytes (includes SFR window).
pub const V25_IRAM_BYTES: usize = 512;
/// Operand size constants (`SIZE_8BIT`..`SIZE_64BIT` in `cpu.h`).
pub const SIZE_8BIT: u32 = 1;
pub const SIZE_16BIT: u32 = 2;
pub const SIZE_32BIT: u32 = 4;
pub const SIZE_64BIT: u32 = 8;
/// Maximum length of a single x86 instruction (decoder boundary, §4.3).
pub const MAX_INSTRUCTION_LEN: usize = 15;
