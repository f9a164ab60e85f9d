//! Service instructions: branches, context control, flag control and
//! the small set of host-facing operations (`sys`, `dump`, `sleep`,
//! `quit`). None of these touch an operand stack.

use log::info;

use crate::command::{Arg, Command};
use crate::context::Flags;
use crate::error::{VmError, VmResult};
use crate::linker::Linker;
use crate::logic;
use crate::mmu::Mmu;
use crate::reference::Reference;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ServiceOp {
    Lea,
    Je,
    Jne,
    Ja,
    Jna,
    Jae,
    Jnae,
    Jb,
    Jnb,
    Jbe,
    Jnbe,
    Jmp,
    Call,
    Ret,
    Snfc,
    Cnfc,
    Init,
    Sleep,
    Sys,
    Dump,
    Quit,
}

fn of(handle: u32) -> ServiceOp {
    const TABLE: &[ServiceOp] = &[
        ServiceOp::Lea, ServiceOp::Je, ServiceOp::Jne, ServiceOp::Ja, ServiceOp::Jna,
        ServiceOp::Jae, ServiceOp::Jnae, ServiceOp::Jb, ServiceOp::Jnb, ServiceOp::Jbe,
        ServiceOp::Jnbe, ServiceOp::Jmp, ServiceOp::Call, ServiceOp::Ret, ServiceOp::Snfc,
        ServiceOp::Cnfc, ServiceOp::Init, ServiceOp::Sleep, ServiceOp::Sys, ServiceOp::Dump,
        ServiceOp::Quit,
    ];
    TABLE[handle as usize]
}

/// Index of the register `lea` stores its resolved address into (`R_F`,
/// the last register in the file).
const R_F: usize = crate::mmu::R_MAX - 1;

pub fn execute(handle: u32, cmd: &Command, mmu: &mut Mmu, linker: &Linker) -> VmResult<()> {
    match of(handle) {
        ServiceOp::Lea => {
            let r = reference(cmd)?;
            let direct = linker.resolve(mmu, r)?;
            *mmu.a_register(R_F)? = Value::Integer(direct.offset);
        }
        ServiceOp::Je => jump_if(mmu, linker, cmd, condition_eq(mmu))?,
        ServiceOp::Jne => jump_if(mmu, linker, cmd, !condition_eq(mmu))?,
        ServiceOp::Ja => jump_if(mmu, linker, cmd, condition_above(mmu))?,
        ServiceOp::Jna => jump_if(mmu, linker, cmd, !condition_above(mmu))?,
        ServiceOp::Jae => jump_if(mmu, linker, cmd, !condition_below(mmu))?,
        ServiceOp::Jnae => jump_if(mmu, linker, cmd, condition_below(mmu))?,
        ServiceOp::Jb => jump_if(mmu, linker, cmd, condition_below(mmu))?,
        ServiceOp::Jnb => jump_if(mmu, linker, cmd, !condition_below(mmu))?,
        ServiceOp::Jbe => jump_if(mmu, linker, cmd, condition_below(mmu) || condition_eq(mmu))?,
        ServiceOp::Jnbe => jump_if(mmu, linker, cmd, condition_above(mmu))?,
        ServiceOp::Jmp => {
            let r = reference(cmd)?;
            logic::jump(mmu, linker, r)?;
        }
        ServiceOp::Call => {
            mmu.save_context();
            let r = reference(cmd)?;
            logic::jump(mmu, linker, r)?;
        }
        ServiceOp::Ret => {
            mmu.restore_context()?;
        }
        ServiceOp::Snfc => {
            mmu.context_mut().flags.insert(Flags::NFC);
        }
        ServiceOp::Cnfc => {
            mmu.context_mut().flags.remove(Flags::NFC);
        }
        ServiceOp::Init => {
            mmu.reset_everything();
            let id = mmu.alloc_context_buffer();
            mmu.context_mut().buffer = id;
        }
        ServiceOp::Sleep => {
            // Single-threaded cooperative scheduling model (see §5):
            // there is nothing to yield to, so this is a no-op.
        }
        ServiceOp::Sys => {
            let k = match &cmd.arg {
                Arg::Immediate(v) => v.get_into_int().unwrap_or(0),
                _ => 0,
            };
            info!("sys {k}: no host syscall table registered, ignoring");
        }
        ServiceOp::Dump => {
            let ctx = mmu.context();
            info!(
                "dump: ip={} flags={:?} buffer={} depth={}",
                ctx.ip, ctx.flags, ctx.buffer, ctx.depth
            );
        }
        ServiceOp::Quit => {
            mmu.context_mut().flags.insert(Flags::EXIT);
        }
    }
    Ok(())
}

fn condition_eq(mmu: &Mmu) -> bool {
    mmu.context().flags.contains(Flags::ZERO)
}

/// `a > b` under the simplified flag set this VM keeps (only
/// Zero/Negative survive `cmp`, so "above" and "below" collapse onto
/// the same signed comparison "ja"/"jnbe" would use on a host with a
/// full EFLAGS carry/overflow pair).
fn condition_above(mmu: &Mmu) -> bool {
    let f = mmu.context().flags;
    !f.contains(Flags::ZERO) && !f.contains(Flags::NEGATIVE)
}

fn condition_below(mmu: &Mmu) -> bool {
    mmu.context().flags.contains(Flags::NEGATIVE)
}

fn jump_if(mmu: &mut Mmu, linker: &Linker, cmd: &Command, condition: bool) -> VmResult<()> {
    if condition {
        let r = reference(cmd)?;
        logic::jump(mmu, linker, r)?;
    }
    Ok(())
}

fn reference(cmd: &Command) -> VmResult<&Reference> {
    match &cmd.arg {
        Arg::Reference(r) => Ok(r),
        _ => Err(VmError::format_error("expected a reference argument")),
    }
}
