//! The three executors: integer, floating, and service. Each is a
//! stateless set of functions dispatched to by `Logic` through a
//! `(ExecutorKind, handle)` pair cached on the `Command`.

pub mod float;
pub mod integer;
pub mod service;

use crate::command::{Command, ExecutorKind};
use crate::commandset::{initial_table, CommandSet};
use crate::error::VmResult;
use crate::linker::Linker;
use crate::mmu::Mmu;

pub fn execute(kind: ExecutorKind, handle: u32, cmd: &Command, mmu: &mut Mmu, linker: &Linker) -> VmResult<()> {
    match kind {
        ExecutorKind::Integer => integer::execute(handle, cmd, mmu, linker),
        ExecutorKind::Float => float::execute(handle, cmd, mmu, linker),
        ExecutorKind::Service => service::execute(handle, cmd, mmu, linker),
    }
}

/// Populate `set` with the fixed initial mnemonic table and register
/// each mnemonic's per-executor handle(s).
pub fn register_initial_set(set: &mut CommandSet) -> VmResult<()> {
    for (id, traits) in initial_table() {
        let mnemonic = traits.mnemonic;
        set.register(id, traits)?;
        for (kind, op) in dispatch_table(mnemonic) {
            set.add_command_impl(mnemonic, kind, op)?;
        }
    }
    Ok(())
}

/// Which executor(s) implement a mnemonic, and the opaque handle (the
/// executor's own operation enum, as `u32`) each one uses.
fn dispatch_table(mnemonic: &str) -> Vec<(ExecutorKind, u32)> {
    use ExecutorKind::*;
    match mnemonic {
        "push" => vec![(Integer, integer::IntOp::Push as u32), (Float, float::FpOp::Push as u32)],
        "pop" => vec![(Integer, integer::IntOp::Pop as u32), (Float, float::FpOp::Pop as u32)],
        "top" => vec![(Integer, integer::IntOp::Top as u32), (Float, float::FpOp::Top as u32)],
        "cmp" => vec![(Integer, integer::IntOp::Cmp as u32), (Float, float::FpOp::Cmp as u32)],
        "swap" => vec![(Integer, integer::IntOp::Swap as u32), (Float, float::FpOp::Swap as u32)],
        "dup" => vec![(Integer, integer::IntOp::Dup as u32), (Float, float::FpOp::Dup as u32)],
        "anal" => vec![(Integer, integer::IntOp::Anal as u32), (Float, float::FpOp::Anal as u32)],
        "ld" => vec![(Integer, integer::IntOp::Ld as u32), (Float, float::FpOp::Ld as u32)],
        "st" => vec![(Integer, integer::IntOp::St as u32), (Float, float::FpOp::St as u32)],
        "ldint" => vec![(Integer, integer::IntOp::LdInt as u32)],
        "stint" => vec![(Integer, integer::IntOp::StInt as u32)],
        "settype" => vec![(Integer, integer::IntOp::SetType as u32), (Float, float::FpOp::SetType as u32)],
        "add" => vec![(Integer, integer::IntOp::Add as u32), (Float, float::FpOp::Add as u32)],
        "sub" => vec![(Integer, integer::IntOp::Sub as u32), (Float, float::FpOp::Sub as u32)],
        "mul" => vec![(Integer, integer::IntOp::Mul as u32), (Float, float::FpOp::Mul as u32)],
        "div" => vec![(Integer, integer::IntOp::Div as u32), (Float, float::FpOp::Div as u32)],
        "mod" => vec![(Integer, integer::IntOp::Mod as u32), (Float, float::FpOp::Mod as u32)],
        "inc" => vec![(Integer, integer::IntOp::Inc as u32), (Float, float::FpOp::Inc as u32)],
        "dec" => vec![(Integer, integer::IntOp::Dec as u32), (Float, float::FpOp::Dec as u32)],
        "neg" => vec![(Integer, integer::IntOp::Neg as u32), (Float, float::FpOp::Neg as u32)],
        "abs" => vec![(Integer, integer::IntOp::Abs as u32), (Float, float::FpOp::Abs as u32)],
        "sqrt" => vec![(Float, float::FpOp::Sqrt as u32)],
        "sin" => vec![(Float, float::FpOp::Sin as u32)],
        "cos" => vec![(Float, float::FpOp::Cos as u32)],
        "tan" => vec![(Float, float::FpOp::Tan as u32)],
        "asin" => vec![(Float, float::FpOp::Asin as u32)],
        "acos" => vec![(Float, float::FpOp::Acos as u32)],
        "atan" => vec![(Float, float::FpOp::Atan as u32)],
        "lea" => vec![(Service, service::ServiceOp::Lea as u32)],
        "je" => vec![(Service, service::ServiceOp::Je as u32)],
        "jne" => vec![(Service, service::ServiceOp::Jne as u32)],
        "ja" => vec![(Service, service::ServiceOp::Ja as u32)],
        "jna" => vec![(Service, service::ServiceOp::Jna as u32)],
        "jae" => vec![(Service, service::ServiceOp::Jae as u32)],
        "jnae" => vec![(Service, service::ServiceOp::Jnae as u32)],
        "jb" => vec![(Service, service::ServiceOp::Jb as u32)],
        "jnb" => vec![(Service, service::ServiceOp::Jnb as u32)],
        "jbe" => vec![(Service, service::ServiceOp::Jbe as u32)],
        "jnbe" => vec![(Service, service::ServiceOp::Jnbe as u32)],
        "jmp" => vec![(Service, service::ServiceOp::Jmp as u32)],
        "call" => vec![(Service, service::ServiceOp::Call as u32)],
        "ret" => vec![(Service, service::ServiceOp::Ret as u32)],
        "snfc" => vec![(Service, service::ServiceOp::Snfc as u32)],
        "cnfc" => vec![(Service, service::ServiceOp::Cnfc as u32)],
        "init" => vec![(Service, service::ServiceOp::Init as u32)],
        "sleep" => vec![(Service, service::ServiceOp::Sleep as u32)],
        "sys" => vec![(Service, service::ServiceOp::Sys as u32)],
        "dump" => vec![(Service, service::ServiceOp::Dump as u32)],
        "quit" => vec![(Service, service::ServiceOp::Quit as u32)],
        other => unreachable!("mnemonic {other:?} missing from dispatch_table"),
    }
}
