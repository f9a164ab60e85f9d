//! Integer-typed instruction semantics.

use smallvec::SmallVec;

use crate::command::{Arg, Command};
use crate::context::Flags;
use crate::error::{VmError, VmResult};
use crate::linker::Linker;
use crate::logic;
use crate::mmu::Mmu;
use crate::reference::Section;
use crate::value::{Value, ValueType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum IntOp {
    Push,
    Pop,
    Top,
    Cmp,
    Swap,
    Dup,
    Anal,
    Ld,
    St,
    LdInt,
    StInt,
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
}

fn of(handle: u32) -> IntOp {
    // Safety-free conversion: `handle` always comes from `IntOp as u32`
    // via `dispatch_table`, never from untrusted input.
    const TABLE: &[IntOp] = &[
        IntOp::Push, IntOp::Pop, IntOp::Top, IntOp::Cmp, IntOp::Swap, IntOp::Dup, IntOp::Anal,
        IntOp::Ld, IntOp::St, IntOp::LdInt, IntOp::StInt, IntOp::SetType,
        IntOp::Add, IntOp::Sub, IntOp::Mul, IntOp::Div, IntOp::Mod,
        IntOp::Inc, IntOp::Dec, IntOp::Neg, IntOp::Abs,
    ];
    TABLE[handle as usize]
}

pub fn execute(handle: u32, cmd: &Command, mmu: &mut Mmu, linker: &Linker) -> VmResult<()> {
    let nfc = mmu.context().flags.contains(Flags::NFC);
    match of(handle) {
        IntOp::Push => {
            let v = immediate(cmd)?;
            mmu.stack_push(v);
        }
        IntOp::Pop => {
            mmu.stack_pop()?;
        }
        IntOp::Top => {
            mmu.stack_top(0)?;
        }
        IntOp::Cmp => {
            let b = mmu.stack_pop()?.get_into_int()?;
            let a = mmu.stack_top(0)?.get_into_int()?;
            let diff = a.wrapping_sub(b);
            logic::analyze(mmu, Value::Integer(diff));
        }
        IntOp::Swap => {
            let b = mmu.stack_pop()?;
            let a = mmu.stack_pop()?;
            mmu.stack_push(b);
            mmu.stack_push(a);
        }
        IntOp::Dup => {
            let v = *mmu.stack_top(0)?;
            mmu.stack_push(v);
        }
        IntOp::Anal => {
            let v = *mmu.stack_top(0)?;
            logic::analyze(mmu, v);
        }
        IntOp::Ld => {
            let r = reference(cmd)?;
            let v = logic::read(mmu, linker, r)?;
            v.expect(ValueType::Integer, true)?;
            mmu.stack_push(v);
        }
        IntOp::St => {
            let r = reference(cmd)?;
            let v = mmu.stack_pop()?;
            logic::write(mmu, linker, r, v)?;
        }
        IntOp::LdInt => {
            let r = reference(cmd)?;
            let v = logic::read(mmu, linker, r)?;
            v.expect(ValueType::Integer, false)?;
            mmu.stack_push(v);
        }
        IntOp::StInt => {
            let r = reference(cmd)?;
            let v = mmu.stack_pop()?;
            v.expect(ValueType::Integer, false)?;
            logic::write(mmu, linker, r, v)?;
        }
        IntOp::SetType => {
            let v = mmu.stack_pop()?;
            mmu.stack_push(Value::set_from_abi(v.to_abi(), ValueType::Integer));
        }
        IntOp::Add | IntOp::Sub | IntOp::Mul | IntOp::Div | IntOp::Mod => {
            let mut scratch: SmallVec<[i64; 2]> = SmallVec::new();
            scratch.push(mmu.stack_pop()?.get_into_int()?);
            scratch.push(mmu.stack_pop()?.get_into_int()?);
            // scratch[0] = top (divisor/subtrahend), scratch[1] = next.
            let result = match of(handle) {
                IntOp::Add => scratch[1].wrapping_add(scratch[0]),
                IntOp::Sub => scratch[1].wrapping_sub(scratch[0]),
                IntOp::Mul => scratch[1].wrapping_mul(scratch[0]),
                IntOp::Div => {
                    if scratch[0] == 0 {
                        return Err(VmError::OutOfBounds {
                            section: Section::None,
                            index: 0,
                            limit: 0,
                        });
                    }
                    scratch[1].wrapping_div(scratch[0])
                }
                IntOp::Mod => {
                    if scratch[0] == 0 {
                        return Err(VmError::OutOfBounds {
                            section: Section::None,
                            index: 0,
                            limit: 0,
                        });
                    }
                    scratch[1].wrapping_rem(scratch[0])
                }
                _ => unreachable!(),
            };
            mmu.stack_push(Value::Integer(result));
            if !nfc {
                logic::analyze(mmu, Value::Integer(result));
            }
        }
        IntOp::Inc | IntOp::Dec | IntOp::Neg | IntOp::Abs => {
            let a = mmu.stack_pop()?.get_into_int()?;
            let result = match of(handle) {
                IntOp::Inc => a.wrapping_add(1),
                IntOp::Dec => a.wrapping_sub(1),
                IntOp::Neg => a.wrapping_neg(),
                IntOp::Abs => a.wrapping_abs(),
                _ => unreachable!(),
            };
            mmu.stack_push(Value::Integer(result));
            if !nfc {
                logic::analyze(mmu, Value::Integer(result));
            }
        }
    }
    Ok(())
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
