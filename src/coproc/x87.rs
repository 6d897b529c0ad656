//! x87 FPU step entry point (component G, §4.8).
//!
//! A deliberately small operation set (load/add/store) rather than a full
//! D8..DF ModR/M decoder: the point this module demonstrates is the
//! *deferred exception* contract — an unmasked exception an FPU instruction
//! raises is not delivered to that instruction, it is delivered at the
//! start of the *next* one, attributed to that instruction's own `xIP` —
//! not a faithful IEEE-754 80-bit extended arithmetic unit. Register values
//! are held as `f64` reinterpreted into [`crate::state::fpu::X87Reg`]'s raw
//! bytes; real 80-bit extended precision and full rounding-mode control are
//! out of scope (DESIGN.md).

use crate::except::{FaultInfo, Provenance};
use crate::state::fpu::{TagEntry, X87Reg};
use crate::state::CpuState;

/// Bit position of the precision (PE) exception in the x87 control/status
/// word, per SDM layout (IM=0, DM=1, ZM=2, OM=3, UM=4, PM=5).
pub const PE_BIT: u8 = 5;
pub const IM_BIT: u8 = 0;

/// The handful of x87 operations this crate models end to end.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum X87Op {
    /// Push a value onto the register stack (`FLD`-family).
    Fld(f64),
    /// Add to ST(0) in place (`FADD`-family, two-operand form folded to one).
    Fadd(f64),
    /// Pop ST(0), returning its value (`FSTP`-family).
    Fstp,
    /// Divide ST(0) by zero deliberately, to exercise `#ZE` (DESIGN.md
    /// scope note: division by an architectural zero value is detected
    /// structurally rather than by inspecting the stored bit pattern).
    FdivByZero,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum X87Outcome {
    Pushed,
    Value(f64),
}

fn f64_to_x87reg(v: f64) -> X87Reg {
    let mut bytes = [0u8; 10];
    bytes[0..8].copy_from_slice(&v.to_le_bytes());
    X87Reg(bytes)
}

fn x87reg_to_f64(r: &X87Reg) -> f64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&r.0[0..8]);
    f64::from_le_bytes(buf)
}

fn st0(state: &CpuState) -> f64 {
    let phys = state.fpu.physical(0);
    x87reg_to_f64(&state.fpu.bank().regs[phys])
}

fn set_st0(state: &mut CpuState, v: f64) {
    let phys = state.fpu.physical(0);
    state.fpu.bank_mut().regs[phys] = f64_to_x87reg(v);
    state.fpu.bank_mut().tags[phys] = TagEntry::Valid;
}

fn push_stack(state: &mut CpuState, v: f64) {
    state.fpu.top = (state.fpu.top + 7) % 8; // decrement mod 8
    set_st0(state, v);
}

fn pop_stack(state: &mut CpuState) -> f64 {
    let v = st0(state);
    let phys = state.fpu.physical(0);
    state.fpu.bank_mut().tags[phys] = TagEntry::Empty;
    state.fpu.top = (state.fpu.top + 1) % 8;
    v
}

/// Execute one x87 operation. Checks for a deferred exception armed by the
/// *previous* FPU instruction before doing anything else (§4.8): that fault
/// is attributed to the caller's already-snapshotted `old_xip` once
/// [`crate::except::deliver`] processes it, which is this instruction's own
/// address, not the one that originally raised the condition.
pub fn step_x87(state: &mut CpuState, op: X87Op) -> Result<X87Outcome, FaultInfo> {
    if let Some(bit) = state.fpu.take_pending_exception() {
        return Err(FaultInfo::new(FaultInfo::X87_FP_ERROR, Provenance::Fault).with_error_code(bit as u32));
    }

    match op {
        X87Op::Fld(v) => {
            push_stack(state, v);
            Ok(X87Outcome::Pushed)
        }
        X87Op::Fadd(operand) => {
            let result = st0(state) + operand;
            if result.fract() != 0.0 {
                state.fpu.raise_exception(PE_BIT);
            }
            set_st0(state, result);
            Ok(X87Outcome::Value(result))
        }
        X87Op::Fstp => Ok(X87Outcome::Value(pop_stack(state))),
        X87Op::FdivByZero => {
            state.fpu.raise_exception(zero_divide_bit());
            Err(FaultInfo::new(FaultInfo::X87_FP_ERROR, Provenance::Fault))
        }
    }
}

fn zero_divide_bit() -> u8 {
    2 // ZM/ZE, per SDM control/status word layout.
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::CpuLevel;
    use crate::traits::TRAITS_386;

    #[test]
    fn scenario_6_unmasked_precision_exception_defers_to_next_fpu_instruction() {
        let mut state = CpuState::new(&TRAITS_386);
        state.fpu.control_word &= !(1 << PE_BIT); // unmask PE up front

        state.regs.xip = 0x2000;
        state.regs.begin_instruction(); // FLD 1.0
        step_x87(&mut state, X87Op::Fld(1.0)).unwrap();

        state.regs.xip = 0x2002;
        state.regs.begin_instruction(); // FADD 0.1, at xIP 0x2002
        let outcome = step_x87(&mut state, X87Op::Fadd(0.1)).unwrap();
        assert_eq!(outcome, X87Outcome::Value(1.1));
        assert_ne!(state.fpu.status_word & (1 << PE_BIT), 0, "PE is sticky");

        state.regs.xip = 0x2005;
        state.regs.begin_instruction(); // FLD 2.0, at xIP 0x2005
        let err = step_x87(&mut state, X87Op::Fld(2.0)).unwrap_err();
        assert_eq!(err.vector, FaultInfo::X87_FP_ERROR);

        // Faulting is a `Fault`-provenance condition: the surrounding
        // `except::deliver` call restores xIP to this FLD's own start, not
        // the FADD that actually produced the condition.
        let mut delivery_state = CpuState::new(&TRAITS_386);
        delivery_state.regs.old_xip = 0x2005;
        delivery_state.regs.xip = 0x2007;
        crate::except::deliver(&mut delivery_state, err);
        assert_eq!(delivery_state.regs.xip, 0x2005);
    }

    #[test]
    fn masked_precision_exception_never_arms() {
        let mut state = CpuState::new(&TRAITS_386);
        assert!(state.fpu.exception_masked(PE_BIT), "power-on default masks PE");
        step_x87(&mut state, X87Op::Fld(1.0)).unwrap();
        let outcome = step_x87(&mut state, X87Op::Fadd(0.1)).unwrap();
        assert_eq!(outcome, X87Outcome::Value(1.1));
        assert_ne!(state.fpu.status_word & (1 << PE_BIT), 0);

        // Stays masked: the next FPU instruction does not fault.
        let outcome = step_x87(&mut state, X87Op::Fld(3.0));
        assert!(outcome.is_ok());
    }

    #[test]
    fn fstp_pops_the_pushed_value() {
        let mut state = CpuState::new(&TRAITS_386);
        step_x87(&mut state, X87Op::Fld(42.0)).unwrap();
        let outcome = step_x87(&mut state, X87Op::Fstp).unwrap();
        assert_eq!(outcome, X87Outcome::Value(42.0));
        let _ = CpuLevel::User;
    }
}
