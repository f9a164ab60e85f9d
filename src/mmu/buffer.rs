//! `ContextBuffer`: the per-module container the MMU keys by buffer id.

use std::collections::HashMap;

use crate::command::Command;
use crate::error::{VmError, VmResult};
use crate::mmu::R_MAX;
use crate::reference::Section;
use crate::symbol::Symbol;
use crate::value::Value;

/// Code, data, byte pool, symbol table and register file for one loaded
/// module. Buffers are never shared between `Mmu` instances; `clone` is
/// used only internally by `paste_from_context`.
#[derive(Clone)]
pub struct ContextBuffer {
    pub commands: Vec<Command>,
    pub data: Vec<Value>,
    pub byte_pool: Vec<u8>,
    pub symbols: HashMap<u64, (String, Symbol)>,
    pub registers: [Value; R_MAX],
}

impl ContextBuffer {
    pub fn new() -> Self {
        ContextBuffer {
            commands: Vec::new(),
            data: Vec::new(),
            byte_pool: Vec::new(),
            symbols: HashMap::new(),
            registers: [Value::Uninitialised; R_MAX],
        }
    }

    /// Append a raw image to the named section. `Code`/`Data` are
    /// appended as opaque byte ranges here; `Mmu::read_section` is only
    /// used for `BytePool` in practice (the reader decodes `Code`/`Data`
    /// directly into typed `Command`/`Value` sequences), but the raw
    /// form is kept general for bytecode round-tripping of the byte
    /// pool.
    pub fn append_raw(&mut self, kind: Section, image: &[u8]) -> VmResult<()> {
        match kind {
            Section::BytePool => {
                self.byte_pool.extend_from_slice(image);
                Ok(())
            }
            other => Err(VmError::format_error(format!(
                "append_raw: unsupported bulk section {other:?}"
            ))),
        }
    }

    pub fn dump_raw(&self, kind: Section) -> VmResult<Vec<u8>> {
        match kind {
            Section::BytePool => Ok(self.byte_pool.clone()),
            other => Err(VmError::format_error(format!(
                "dump_raw: unsupported bulk section {other:?}"
            ))),
        }
    }

    /// Overlay another buffer's sections onto `self`: commands and data
    /// are appended, the byte pool is appended, symbols from `other`
    /// win on hash collision (the merge is meant for "base module plus
    /// patch module").
    pub fn overlay(&mut self, other: &ContextBuffer) {
        self.commands.extend(other.commands.iter().cloned());
        self.data.extend(other.data.iter().copied());
        self.byte_pool.extend_from_slice(&other.byte_pool);
        for (hash, entry) in &other.symbols {
            self.symbols.insert(*hash, entry.clone());
        }
    }
}

impl Default for ContextBuffer {
    fn default() -> Self {
        Self::new()
    }
}
