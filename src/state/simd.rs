//! SIMD/MMX/mask/tile/MPX register files (component B, §3).

use super::limits::{
    MASK_REG_COUNT, MPX_BOUNDS_COUNT, SIMD_COUNT, SIMD_WIDTH_BYTES, TILE_COUNT, TILE_ROWS,
    TILE_ROW_BYTES,
};

/// One XMM/YMM/ZMM register, stored at its widest (512-bit) extent; MMX
/// aliases the low 64 bits of registers 0..7 per the architectural mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VectorReg(pub [u8; SIMD_WIDTH_BYTES]);

impl Default for VectorReg {
    fn default() -> Self {
        VectorReg([0; SIMD_WIDTH_BYTES])
    }
}

impl VectorReg {
    pub fn as_u32_lanes(&self) -> [u32; SIMD_WIDTH_BYTES / 4] {
        let mut out = [0u32; SIMD_WIDTH_BYTES / 4];
        for (i, chunk) in self.0.chunks_exact(4).enumerate() {
            out[i] = u32::from_le_bytes(chunk.try_into().unwrap());
        }
        out
    }
    pub fn as_u64_lanes(&self) -> [u64; SIMD_WIDTH_BYTES / 8] {
        let mut out = [0u64; SIMD_WIDTH_BYTES / 8];
        for (i, chunk) in self.0.chunks_exact(8).enumerate() {
            out[i] = u64::from_le_bytes(chunk.try_into().unwrap());
        }
        out
    }
    pub fn mmx_alias(&self) -> u64 {
        u64::from_le_bytes(self.0[0..8].try_into().unwrap())
    }
    pub fn set_mmx_alias(&mut self, v: u64) {
        self.0[0..8].copy_from_slice(&v.to_le_bytes());
    }
}

/// One AVX-512 tile register: 16 rows of 64 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileReg(pub [[u8; TILE_ROW_BYTES]; TILE_ROWS]);

impl Default for TileReg {
    fn default() -> Self {
        TileReg([[0; TILE_ROW_BYTES]; TILE_ROWS])
    }
}

/// One MPX bound register pair: lower/upper bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BoundPair {
    pub lower: u64,
    pub upper: u64,
}

/// MPX configuration/status, modelled as the three architectural MSRs named
/// in §3 (BNDCFGU, BNDCFGS, BNDSTATUS).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MpxConfig {
    pub bndcfgu: u64,
    pub bndcfgs: u64,
    pub bndstatus: u64,
}

/// Vector/mask/tile/MPX register files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimdState {
    pub vector: [VectorReg; SIMD_COUNT],
    pub mask: [u64; MASK_REG_COUNT],
    pub tile: [TileReg; TILE_COUNT],
    pub bounds: [BoundPair; MPX_BOUNDS_COUNT],
    pub mpx: MpxConfig,
}

impl Default for SimdState {
    fn default() -> Self {
        Self {
            vector: [VectorReg::default(); SIMD_COUNT],
            mask: [0; MASK_REG_COUNT],
            tile: [TileReg::default(); TILE_COUNT],
            bounds: [BoundPair::default(); MPX_BOUNDS_COUNT],
            mpx: MpxConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mmx_alias_round_trips_through_low_64_bits() {
        let mut v = VectorReg::default();
        v.set_mmx_alias(0x1122_3344_5566_7788);
        assert_eq!(v.mmx_alias(), 0x1122_3344_5566_7788);
        assert_eq!(v.as_u64_lanes()[0], 0x1122_3344_5566_7788);
    }
}
