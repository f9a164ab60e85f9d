//! Floating-point instruction semantics.

use smallvec::SmallVec;

use crate::command::{Arg, Command};
use crate::context::Flags;
use crate::error::{VmError, VmResult};
use crate::linker::Linker;
use crate::logic;
use crate::mmu::Mmu;
use crate::value::{Value, ValueType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FpOp {
    Push,
    Pop,
    Top,
    Cmp,
    Swap,
    Dup,
    Anal,
    Ld,
    St,
    SetType,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Inc,
    Dec,
    Neg,
    Abs,
    Sqrt,
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
}

fn of(handle: u32) -> FpOp {
    const TABLE: &[FpOp] = &[
        FpOp::Push, FpOp::Pop, FpOp::Top, FpOp::Cmp, FpOp::Swap, FpOp::Dup, FpOp::Anal,
        FpOp::Ld, FpOp::St, FpOp::SetType,
        FpOp::Add, FpOp::Sub, FpOp::Mul, FpOp::Div, FpOp::Mod,
        FpOp::Inc, FpOp::Dec, FpOp::Neg, FpOp::Abs,
        FpOp::Sqrt, FpOp::Sin, FpOp::Cos, FpOp::Tan, FpOp::Asin, FpOp::Acos, FpOp::Atan,
    ];
    TABLE[handle as usize]
}

pub fn execute(handle: u32, cmd: &Command, mmu: &mut Mmu, linker: &Linker) -> VmResult<()> {
    let nfc = mmu.context().flags.contains(Flags::NFC);
    match of(handle) {
        FpOp::Push => {
            let v = immediate(cmd)?;
            mmu.stack_push(v);
        }
        FpOp::Pop => {
            mmu.stack_pop()?;
        }
        FpOp::Top => {
            mmu.stack_top(0)?;
        }
        FpOp::Cmp => {
            let b = mmu.stack_pop()?.get_into_fp()?;
            let a = mmu.stack_top(0)?.get_into_fp()?;
            logic::analyze(mmu, Value::Float(a - b));
        }
        FpOp::Swap => {
            let b = mmu.stack_pop()?;
            let a = mmu.stack_pop()?;
            mmu.stack_push(b);
            mmu.stack_push(a);
        }
        FpOp::Dup => {
            let v = *mmu.stack_top(0)?;
            mmu.stack_push(v);
        }
        FpOp::Anal => {
            let v = *mmu.stack_top(0)?;
            logic::analyze(mmu, v);
        }
        FpOp::Ld => {
            let r = reference(cmd)?;
            let v = logic::read(mmu, linker, r)?;
            v.expect(ValueType::Float, true)?;
            mmu.stack_push(v);
        }
        FpOp::St => {
            let r = reference(cmd)?;
            let v = mmu.stack_pop()?;
            logic::write(mmu, linker, r, v)?;
        }
        FpOp::SetType => {
            let v = mmu.stack_pop()?;
            mmu.stack_push(Value::set_from_abi(v.to_abi(), ValueType::Float));
        }
        FpOp::Add | FpOp::Sub | FpOp::Mul | FpOp::Div | FpOp::Mod => {
            let mut scratch: SmallVec<[f64; 2]> = SmallVec::new();
            scratch.push(mmu.stack_pop()?.get_into_fp()?);
            scratch.push(mmu.stack_pop()?.get_into_fp()?);
            let result = match of(handle) {
                FpOp::Add => scratch[1] + scratch[0],
                FpOp::Sub => scratch[1] - scratch[0],
                FpOp::Mul => scratch[1] * scratch[0],
                FpOp::Div => scratch[1] / scratch[0],
                FpOp::Mod => libm_fprem1(scratch[1], scratch[0]),
                _ => unreachable!(),
            };
            mmu.stack_push(Value::Float(result));
            if !nfc {
                logic::analyze(mmu, Value::Float(result));
            }
        }
        FpOp::Inc
        | FpOp::Dec
        | FpOp::Neg
        | FpOp::Abs
        | FpOp::Sqrt
        | FpOp::Sin
        | FpOp::Cos
        | FpOp::Tan
        | FpOp::Asin
        | FpOp::Acos
        | FpOp::Atan => {
            let a = mmu.stack_pop()?.get_into_fp()?;
            let result = match of(handle) {
                FpOp::Inc => a + 1.0,
                FpOp::Dec => a - 1.0,
                FpOp::Neg => -a,
                FpOp::Abs => a.abs(),
                FpOp::Sqrt => a.sqrt(),
                FpOp::Sin => a.sin(),
                FpOp::Cos => a.cos(),
                FpOp::Tan => a.tan(),
                FpOp::Asin => a.asin(),
                FpOp::Acos => a.acos(),
                FpOp::Atan => a.atan(),
                _ => unreachable!(),
            };
            mmu.stack_push(Value::Float(result));
            if !nfc {
                logic::analyze(mmu, Value::Float(result));
            }
        }
    }
    Ok(())
}

/// Partial remainder matching x87's `fprem1`, used by the interpreter's
/// `mod` so the interpreted and compiled paths agree per §8.
fn libm_fprem1(dividend: f64, divisor: f64) -> f64 {
    dividend - divisor * (dividend / divisor).round()
}

fn immediate(cmd: &Command) -> VmResult<Value> {
    match &cmd.arg {
        Arg::Immediate(v) => Ok(*v),
        _ => Err(VmError::format_error("expected an immediate argument")),
    }
}

fn reference(cmd: &Command) -> VmResult<&crate::reference::Reference> {
    match &cmd.arg {
        Arg::Reference(r) => Ok(r),
        _ => Err(VmError::format_error("expected a reference argument")),
    }
}
