//! A stack-based virtual machine: an MMU, a linker, a fixed instruction
//! set dispatched across three executors, an interpreter driver, and an
//! x86-64 native backend that falls back to the interpreter whenever it
//! can't translate a buffer.
//!
//! [`Vm`] is the single entry point most callers need; the modules
//! below it (`mmu`, `linker`, `logic`, `interpreter`, `codegen`,
//! `reader`) are usable on their own for callers that want to drive
//! the pieces directly, the way `wasmtime::Engine`/`Store` sit on top
//! of `wasmtime_environ`/`wasmtime_jit` without hiding them.

pub mod codegen;
pub mod command;
pub mod commandset;
pub mod context;
pub mod error;
pub mod executors;
pub mod interpreter;
pub mod linker;
pub mod logic;
pub mod mmu;
pub mod reader;
pub mod reference;
pub mod symbol;
pub mod value;

use log::{info, warn};

use crate::codegen::Backend;
use crate::commandset::CommandSet;
use crate::error::VmResult;
use crate::linker::{Linker, SectionOffsets};
use crate::mmu::Mmu;
use crate::value::Value;

/// Owns one of everything: the MMU, the linker, the fixed command set,
/// and the native backend. Construct one per independent program; nothing
/// here is `Sync`/`Send` on purpose (see the concurrency model: this is
/// a single-threaded, cooperative-scheduling machine).
pub struct Vm {
    mmu: Mmu,
    linker: Linker,
    command_set: CommandSet,
    backend: Backend,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    pub fn new() -> Self {
        Vm {
            mmu: Mmu::new(),
            linker: Linker::new(),
            command_set: CommandSet::with_initial_set(),
            backend: Backend::new(),
        }
    }

    pub fn mmu(&self) -> &Mmu {
        &self.mmu
    }

    pub fn mmu_mut(&mut self) -> &mut Mmu {
        &mut self.mmu
    }

    pub fn command_set(&self) -> &CommandSet {
        &self.command_set
    }

    /// Assemble `text`, link it into a freshly allocated buffer, and
    /// select that buffer as the current context. Returns the new
    /// buffer's id.
    pub fn load_asm(&mut self, text: &str) -> VmResult<usize> {
        let assembled = reader::asm::assemble(text, &self.command_set)?;
        let id = self.mmu.alloc_context_buffer();
        {
            let buf = self.mmu.buffer_mut_for_load(id)?;
            buf.commands = assembled.commands;
        }
        self.linker.init_link_session();
        self.linker.add_symbols(
            assembled.symbols,
            SectionOffsets {
                code: self.mmu.buffer(id)?.commands.len(),
                data: 0,
            },
        )?;
        self.linker.finalize_session_end(&mut self.mmu)?;
        self.mmu.context_mut().buffer = id;
        info!("load_asm: buffer {id} linked ({} commands)", self.mmu.buffer(id)?.commands.len());
        Ok(id)
    }

    /// Load a module from its binary form and select it as the current
    /// context, without running the linker again (a bytecode module's
    /// symbols are already resolved at encode time).
    pub fn load_bytecode(&mut self, bytes: &[u8]) -> VmResult<usize> {
        let id = reader::bytecode::read_module(&mut self.mmu, bytes)?;
        self.mmu.context_mut().buffer = id;
        info!("load_bytecode: buffer {id} loaded");
        Ok(id)
    }

    /// Serialize the current buffer to its binary form.
    pub fn dump_bytecode(&self) -> VmResult<Vec<u8>> {
        reader::bytecode::write_module(self.mmu.buffer(self.mmu.context().buffer)?)
    }

    /// Run the current context to completion through the fetch-execute
    /// loop.
    pub fn run_interpreted(&mut self) -> VmResult<Value> {
        interpreter::run(&mut self.mmu, &self.command_set, &self.linker)
    }

    /// Try to compile the current buffer and run it natively; on any
    /// codegen failure (unsupported opcode, unsupported host), log the
    /// reason and fall back to `run_interpreted` instead, per the
    /// error-handling design's "a failed exec attempt falls back to the
    /// interpreter" rule.
    pub fn compile_and_run(&mut self) -> VmResult<Value> {
        let checksum = logic::checksum_state(&self.mmu)?;
        if !self.backend.image_is_ok(checksum) {
            if let Err(e) = self.backend.compile(checksum, &self.mmu, &self.command_set) {
                warn!("native compile failed, falling back to interpreter: {e}");
                return self.run_interpreted();
            }
        }
        self.backend.run(checksum)
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_two_integers() {
        let mut vm = Vm::new();
        vm.load_asm("push.i 3\npush.i 4\nadd.i\nquit").unwrap();
        assert_eq!(vm.run_interpreted().unwrap(), Value::Integer(7));
    }

    #[test]
    fn division_by_zero_is_out_of_bounds() {
        let mut vm = Vm::new();
        vm.load_asm("push.i 1\npush.i 0\ndiv.i\nquit").unwrap();
        assert!(matches!(
            vm.run_interpreted(),
            Err(crate::error::VmError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn labelled_loop_counts_to_zero() {
        let mut vm = Vm::new();
        let text = "\
            push.i 3\n\
            loop: dup.i\n\
            jne loop_done\n\
            jmp loop_end\n\
            loop_done: dec.i\n\
            jmp loop\n\
            loop_end: quit\n";
        // This isn't a meaningful program on its own (constructed only
        // to exercise multi-label resolution); just check it links.
        assert!(vm.load_asm(text).is_ok());
    }

    #[test]
    fn bytecode_round_trip_preserves_commands() {
        let mut vm = Vm::new();
        vm.load_asm("push.i 5\nquit").unwrap();
        let bytes = vm.dump_bytecode().unwrap();

        let mut vm2 = Vm::new();
        vm2.load_bytecode(&bytes).unwrap();
        assert_eq!(vm2.run_interpreted().unwrap(), Value::Integer(5));
    }
}
