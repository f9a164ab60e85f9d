//! Per-instruction dispatch, flag analysis, and the `read`/`write`/`jump`
//! primitives executors build on. Kept as free functions over borrowed
//! collaborators rather than a struct with back-pointers into its
//! owner, per the "no long-lived back-pointers" design note.

use std::hash::{Hash, Hasher};
use std::collections::hash_map::DefaultHasher;

use log::warn;

use crate::command::{Command, ExecutorKind};
use crate::commandset::CommandSet;
use crate::context::Flags;
use crate::error::VmResult;
use crate::linker::Linker;
use crate::mmu::{Mmu, StackKind};
use crate::reference::{Reference, Section};
use crate::value::{Value, ValueType};

/// Fetch `mmu.a_command(ip)`, resolve (and cache) its executor and
/// handle, select the matching stack, and dispatch to the executor.
pub fn execute_single_command(mmu: &mut Mmu, command_set: &CommandSet, linker: &Linker) -> VmResult<()> {
    let ip = mmu.context().ip;
    let mut cmd = mmu.a_command(ip)?.clone();

    let generation = command_set.generation();
    let (kind, handle) = match cmd.cached_dispatch(generation) {
        Some(pair) => pair,
        None => {
            let traits = command_set.decode(cmd.id)?;
            let kind = if traits.is_service {
                ExecutorKind::Service
            } else {
                match cmd.value_type {
                    ValueType::Integer => ExecutorKind::Integer,
                    ValueType::Float => ExecutorKind::Float,
                    ValueType::Uninitialised => {
                        return Err(crate::error::VmError::TypeError {
                            expected: ValueType::Integer,
                            found: ValueType::Uninitialised,
                        })
                    }
                }
            };
            let handle = *traits.execution_handles.get(&kind).ok_or_else(|| {
                crate::error::VmError::format_error(format!(
                    "{} has no handle registered for executor {kind:?}",
                    traits.mnemonic
                ))
            })?;
            mmu.a_command_mut(ip)?.cache_dispatch(kind, handle, generation);
            (kind, handle)
        }
    };

    mmu.context_mut().flags.remove(Flags::WAS_JUMP);
    if kind != ExecutorKind::Service {
        let stack = match cmd.value_type {
            ValueType::Integer => StackKind::Integer,
            ValueType::Float => StackKind::Float,
            ValueType::Uninitialised => unreachable!("ruled out above"),
        };
        mmu.select_stack(stack);
    }

    crate::executors::execute(kind, handle, &mut cmd, mmu, linker)
}

/// Clear Zero/Negative/InvalidFP, then set them from `v`.
pub fn analyze(mmu: &mut Mmu, v: Value) {
    let flags = &mut mmu.context_mut().flags;
    flags.remove(Flags::ZERO | Flags::NEGATIVE | Flags::INVALID_FP);
    match v {
        Value::Integer(i) => {
            if i == 0 {
                flags.insert(Flags::ZERO);
            }
            if i < 0 {
                flags.insert(Flags::NEGATIVE);
            }
        }
        Value::Float(f) => {
            if f == 0.0 {
                flags.insert(Flags::ZERO);
            }
            if f < 0.0 {
                flags.insert(Flags::NEGATIVE);
            }
            if f.is_nan() || f.is_infinite() || (f != 0.0 && f.is_subnormal()) {
                flags.insert(Flags::INVALID_FP);
            }
        }
        Value::Uninitialised => {}
    }
}

/// Resolve `reference` and, if it names Code, set `ip` and `WAS_JUMP`.
/// Anything else is `InvalidJumpTarget`.
pub fn jump(mmu: &mut Mmu, linker: &Linker, reference: &Reference) -> VmResult<()> {
    let direct = linker.resolve(mmu, reference)?;
    if direct.section != Section::Code {
        return Err(crate::error::VmError::InvalidJumpTarget {
            section: direct.section,
        });
    }
    mmu.context_mut().ip = direct.offset as usize;
    mmu.context_mut().flags.insert(Flags::WAS_JUMP);
    Ok(())
}

/// Resolve `reference` and read the `Value` it names.
pub fn read(mmu: &mut Mmu, linker: &Linker, reference: &Reference) -> VmResult<Value> {
    let direct = linker.resolve(mmu, reference)?;
    mmu.verify_reference(direct)?;
    match direct.section {
        Section::Data => Ok(*mmu.a_data(direct.offset as usize)?),
        Section::Register => Ok(*mmu.a_register(direct.offset as usize)?),
        Section::Frame => Ok(*mmu.stack_frame(direct.offset)?),
        Section::FrameBack => Ok(*mmu.stack_frame(-direct.offset)?),
        Section::BytePool => Ok(Value::Integer(*mmu.a_bytepool(direct.offset as usize)? as i64)),
        Section::Code => {
            let cmd = mmu.a_command(direct.offset as usize)?;
            Ok(match &cmd.arg {
                crate::command::Arg::Immediate(v) => *v,
                _ => Value::Uninitialised,
            })
        }
        Section::None => Ok(Value::Uninitialised),
    }
}

/// Resolve `reference` and write `v` into it. Writes to Code are
/// diagnostic-logged and dropped.
pub fn write(mmu: &mut Mmu, linker: &Linker, reference: &Reference, v: Value) -> VmResult<()> {
    let direct = linker.resolve(mmu, reference)?;
    mmu.verify_reference(direct)?;
    match direct.section {
        Section::Data => *mmu.a_data(direct.offset as usize)? = v,
        Section::Register => *mmu.a_register(direct.offset as usize)? = v,
        Section::Frame => *mmu.stack_frame(direct.offset)? = v,
        Section::FrameBack => *mmu.stack_frame(-direct.offset)? = v,
        Section::BytePool => {
            let byte = v.get_into_int()?;
            *mmu.a_bytepool(direct.offset as usize)? = byte as u8;
        }
        Section::Code => {
            warn!("write to Code section at offset {} dropped", direct.offset);
        }
        Section::None => {}
    }
    Ok(())
}

/// A 64-bit digest over the current `Context` and the current text
/// image, used by the native backend as a compiled image's identity.
pub fn checksum_state(mmu: &Mmu) -> VmResult<u64> {
    let mut hasher = DefaultHasher::new();
    let ctx = mmu.context();
    ctx.ip.hash(&mut hasher);
    ctx.flags.bits().hash(&mut hasher);
    ctx.buffer.hash(&mut hasher);
    ctx.depth.hash(&mut hasher);
    ctx.frame_pointer.hash(&mut hasher);
    let buf = mmu.buffer(ctx.buffer)?;
    for cmd in &buf.commands {
        hash_command(&mut hasher, cmd);
    }
    Ok(hasher.finish())
}

fn hash_command(hasher: &mut DefaultHasher, cmd: &Command) {
    cmd.id.hash(hasher);
    cmd.value_type.as_u8().hash(hasher);
    match &cmd.arg {
        crate::command::Arg::None => 0u8.hash(hasher),
        crate::command::Arg::Immediate(v) => {
            1u8.hash(hasher);
            v.to_abi().hash(hasher);
        }
        crate::command::Arg::Reference(_) => 2u8.hash(hasher),
    }
}
