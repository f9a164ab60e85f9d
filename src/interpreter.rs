//! The fetch-execute loop: drives `Logic::execute_single_command` until
//! the initial context is restored, handling call/return/quit unwinding
//! and diagnostic enrichment on failure.

use log::error;

use crate::commandset::CommandSet;
use crate::context::Flags;
use crate::error::VmResult;
use crate::linker::Linker;
use crate::logic;
use crate::mmu::Mmu;
use crate::value::Value;

/// Run `mmu`'s current context to completion (a `quit` reached at the
/// initial buffer), returning the value on top of whichever stack was
/// last selected.
pub fn run(mmu: &mut Mmu, command_set: &CommandSet, linker: &Linker) -> VmResult<Value> {
    loop {
        let ip = mmu.context().ip;
        if let Err(e) = logic::execute_single_command(mmu, command_set, linker) {
            let cmd = mmu.a_command(ip).ok();
            error!(
                "execution failed at ip={ip} mnemonic={:?} type={:?}: {e}",
                cmd.and_then(|c| command_set.decode(c.id).ok()).map(|t| t.mnemonic),
                cmd.map(|c| c.value_type),
            );
            return Err(e);
        }

        let flags = mmu.context().flags;
        if flags.contains(Flags::EXIT) {
            if mmu.call_depth() == 0 {
                break;
            }
            mmu.restore_context()?;
            continue;
        }
        if !flags.contains(Flags::WAS_JUMP) {
            mmu.context_mut().ip += 1;
        }
    }
    Ok(mmu.result_value())
}
