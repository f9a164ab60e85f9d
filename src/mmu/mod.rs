//! The memory-management unit: owns every byte of per-module state and
//! exposes typed, bounds-checked accessors over it. Nothing outside this
//! module ever indexes a `ContextBuffer`'s fields directly.

mod buffer;

pub use buffer::ContextBuffer;

use log::{debug, info, trace};

use crate::command::Command;
use crate::context::{Context, Flags, NO_BUFFER};
use crate::error::{VmError, VmResult};
use crate::reference::{DirectReference, Section};
use crate::symbol::Symbol;
use crate::value::{Value, ValueType};

/// Register file size: `R_A` through `R_F`.
pub const R_MAX: usize = 6;

/// Which operand stack an instruction's declared type selects. The
/// frame stack is addressed separately (`stack_frame`) and is always
/// integer-typed regardless of which operand stack is selected — see
/// `lea`, which always writes an address into `R_F`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackKind {
    Integer,
    Float,
}

pub struct Mmu {
    buffers: Vec<ContextBuffer>,
    context: Context,
    call_stack: Vec<Context>,
    int_stack: Vec<Value>,
    fp_stack: Vec<Value>,
    frame_stack: Vec<Value>,
    selected: StackKind,
}

impl Default for Mmu {
    fn default() -> Self {
        Self::new()
    }
}

impl Mmu {
    pub fn new() -> Self {
        Mmu {
            buffers: Vec::new(),
            context: Context::empty(),
            call_stack: Vec::new(),
            int_stack: Vec::new(),
            fp_stack: Vec::new(),
            frame_stack: Vec::new(),
            selected: StackKind::Integer,
        }
    }

    // ---- context access -------------------------------------------------

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut Context {
        &mut self.context
    }

    fn current_buffer(&self) -> VmResult<&ContextBuffer> {
        if self.context.buffer == NO_BUFFER {
            return Err(VmError::OutOfBounds {
                section: Section::None,
                index: 0,
                limit: 0,
            });
        }
        Ok(&self.buffers[self.context.buffer])
    }

    fn current_buffer_mut(&mut self) -> VmResult<&mut ContextBuffer> {
        if self.context.buffer == NO_BUFFER {
            return Err(VmError::OutOfBounds {
                section: Section::None,
                index: 0,
                limit: 0,
            });
        }
        Ok(&mut self.buffers[self.context.buffer])
    }

    // ---- stack selection -------------------------------------------------

    /// A no-op if `kind` already matches the selected stack; otherwise
    /// rebinds it (invariant 4 of `Mmu`).
    pub fn select_stack(&mut self, kind: StackKind) {
        self.selected = kind;
    }

    pub fn selected_stack(&self) -> StackKind {
        self.selected
    }

    fn operand_stack_mut(&mut self) -> &mut Vec<Value> {
        match self.selected {
            StackKind::Integer => &mut self.int_stack,
            StackKind::Float => &mut self.fp_stack,
        }
    }

    fn operand_stack(&self) -> &Vec<Value> {
        match self.selected {
            StackKind::Integer => &self.int_stack,
            StackKind::Float => &self.fp_stack,
        }
    }

    pub fn stack_push(&mut self, v: Value) {
        self.operand_stack_mut().push(v);
    }

    pub fn stack_pop(&mut self) -> VmResult<Value> {
        self.operand_stack_mut().pop().ok_or(VmError::OutOfBounds {
            section: Section::None,
            index: -1,
            limit: 0,
        })
    }

    /// `offset` counts down from the top: `0` is the top-of-stack.
    pub fn stack_top(&mut self, offset: usize) -> VmResult<&mut Value> {
        let len = self.operand_stack().len();
        if offset >= len {
            return Err(VmError::OutOfBounds {
                section: Section::None,
                index: offset as i64,
                limit: len,
            });
        }
        let idx = len - 1 - offset;
        Ok(&mut self.operand_stack_mut()[idx])
    }

    pub fn alter_stack_top(&mut self, f: impl FnOnce(&mut Value)) -> VmResult<()> {
        f(self.stack_top(0)?);
        Ok(())
    }

    /// `k >= 0` addresses locals (`frame_stack[frame + k]`); `k < 0`
    /// addresses incoming parameters below the frame pointer.
    pub fn stack_frame(&mut self, k: i64) -> VmResult<&mut Value> {
        let frame = self.context.frame_pointer as i64;
        let idx = frame + k;
        if idx < 0 || idx as usize >= self.frame_stack.len() {
            return Err(VmError::OutOfBounds {
                section: Section::Frame,
                index: idx,
                limit: self.frame_stack.len(),
            });
        }
        Ok(&mut self.frame_stack[idx as usize])
    }

    /// Push a value onto the always-integer frame stack (used when a
    /// caller sets up parameters ahead of `call`).
    pub fn frame_push(&mut self, v: Value) {
        self.frame_stack.push(v);
    }

    pub fn frame_stack_len(&self) -> usize {
        self.frame_stack.len()
    }

    // ---- direct memory access --------------------------------------------

    pub fn a_data(&mut self, addr: usize) -> VmResult<&mut Value> {
        let buf = self.current_buffer_mut()?;
        buf.data
            .get_mut(addr)
            .ok_or_else(|| VmError::OutOfBounds {
                section: Section::Data,
                index: addr as i64,
                limit: 0,
            })
    }

    pub fn a_command(&self, ip: usize) -> VmResult<&Command> {
        let buf = self.current_buffer()?;
        buf.commands.get(ip).ok_or(VmError::OutOfBounds {
            section: Section::Code,
            index: ip as i64,
            limit: buf.commands.len(),
        })
    }

    pub fn a_command_mut(&mut self, ip: usize) -> VmResult<&mut Command> {
        let buf = self.current_buffer_mut()?;
        let len = buf.commands.len();
        buf.commands.get_mut(ip).ok_or(VmError::OutOfBounds {
            section: Section::Code,
            index: ip as i64,
            limit: len,
        })
    }

    pub fn a_symbol(&self, hash: u64) -> VmResult<&Symbol> {
        let buf = self.current_buffer()?;
        buf.symbols
            .get(&hash)
            .map(|(_, s)| s)
            .ok_or(VmError::SymbolUnresolved { hash })
    }

    pub fn a_register(&mut self, r: usize) -> VmResult<&mut Value> {
        let buf = self.current_buffer_mut()?;
        buf.registers
            .get_mut(r)
            .ok_or_else(|| VmError::OutOfBounds {
                section: Section::Register,
                index: r as i64,
                limit: R_MAX,
            })
    }

    pub fn a_bytepool(&mut self, offset: usize) -> VmResult<&mut u8> {
        let buf = self.current_buffer_mut()?;
        buf.byte_pool
            .get_mut(offset)
            .ok_or_else(|| VmError::OutOfBounds {
                section: Section::BytePool,
                index: offset as i64,
                limit: 0,
            })
    }

    /// Checks a resolved address against the bounds of its declared
    /// section before any load/store is attempted.
    pub fn verify_reference(&self, r: DirectReference) -> VmResult<()> {
        let buf = self.current_buffer()?;
        let (limit, ok) = match r.section {
            Section::Code => (buf.commands.len(), r.offset >= 0 && (r.offset as usize) < buf.commands.len()),
            Section::Data => (buf.data.len(), r.offset >= 0 && (r.offset as usize) < buf.data.len()),
            Section::Register => (R_MAX, r.offset >= 0 && (r.offset as usize) < R_MAX),
            Section::Frame | Section::FrameBack => {
                let idx = self.context.frame_pointer as i64 + r.offset;
                (
                    self.frame_stack.len(),
                    idx >= 0 && (idx as usize) < self.frame_stack.len(),
                )
            }
            Section::BytePool => (
                buf.byte_pool.len(),
                r.offset >= 0 && (r.offset as usize) < buf.byte_pool.len(),
            ),
            Section::None => (0, false),
        };
        if ok {
            Ok(())
        } else {
            trace!("verify_reference failed: {r:?} (limit {limit})");
            Err(VmError::OutOfBounds {
                section: r.section,
                index: r.offset,
                limit,
            })
        }
    }

    // ---- bulk section operations ------------------------------------------

    pub fn read_section(&mut self, kind: Section, image: &[u8]) -> VmResult<()> {
        let buf = self.current_buffer_mut()?;
        buf.append_raw(kind, image)
    }

    pub fn write_section(&self, kind: Section) -> VmResult<Vec<u8>> {
        let buf = self.current_buffer()?;
        buf.dump_raw(kind)
    }

    pub fn read_symbol_image(&mut self, symbols: std::collections::HashMap<u64, (String, Symbol)>) -> VmResult<()> {
        let buf = self.current_buffer_mut()?;
        buf.symbols = symbols;
        Ok(())
    }

    /// Overlay another buffer's sections onto the current one (used by a
    /// merge operation when combining two linked modules).
    pub fn paste_from_context(&mut self, other_id: usize) -> VmResult<()> {
        if other_id >= self.buffers.len() {
            return Err(VmError::OutOfBounds {
                section: Section::None,
                index: other_id as i64,
                limit: self.buffers.len(),
            });
        }
        let other = self.buffers[other_id].clone();
        let cur = self.current_buffer_mut()?;
        cur.overlay(&other);
        Ok(())
    }

    // ---- context control ----------------------------------------------------

    pub fn save_context(&mut self) {
        let mut ctx = self.context;
        ctx.frame_pointer = self.frame_stack.len();
        self.call_stack.push(self.context);
        self.context = ctx;
        self.context.depth = self.call_stack.len();
        debug!("save_context: depth now {}", self.context.depth);
    }

    pub fn clear_context(&mut self) {
        self.context.clear();
    }

    pub fn restore_context(&mut self) -> VmResult<()> {
        let popped = self.call_stack.pop().ok_or(VmError::OutOfBounds {
            section: Section::None,
            index: -1,
            limit: 0,
        })?;
        self.context = popped;
        Ok(())
    }

    pub fn call_depth(&self) -> usize {
        self.call_stack.len()
    }

    pub fn alloc_context_buffer(&mut self) -> usize {
        self.buffers.push(ContextBuffer::new());
        let id = self.buffers.len() - 1;
        debug!("alloc_context_buffer: new buffer id {id}");
        id
    }

    /// `save_context`, then `clear_context`, then point the (cleared)
    /// context at a freshly allocated buffer.
    pub fn next_context_buffer(&mut self) -> usize {
        self.save_context();
        self.clear_context();
        let id = self.alloc_context_buffer();
        self.context.buffer = id;
        id
    }

    pub fn reset_everything(&mut self) {
        info!("reset_everything: dropping {} buffer(s)", self.buffers.len());
        self.buffers.clear();
        self.call_stack.clear();
        self.int_stack.clear();
        self.fp_stack.clear();
        self.frame_stack.clear();
        self.context = Context::empty();
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn buffer(&self, id: usize) -> VmResult<&ContextBuffer> {
        self.buffers.get(id).ok_or(VmError::OutOfBounds {
            section: Section::None,
            index: id as i64,
            limit: self.buffers.len(),
        })
    }

    /// A mutable handle to a buffer by id, independent of which buffer
    /// the current context selects — used by the bytecode reader to
    /// populate a freshly allocated buffer before anything runs against
    /// it.
    pub fn buffer_mut_for_load(&mut self, id: usize) -> VmResult<&mut ContextBuffer> {
        let limit = self.buffers.len();
        self.buffers.get_mut(id).ok_or(VmError::OutOfBounds {
            section: Section::None,
            index: id as i64,
            limit,
        })
    }

    /// The value at the top of whichever stack is currently selected, or
    /// `Uninitialised` when empty — the interpreter driver's result on a
    /// clean `quit` at the initial buffer.
    pub fn result_value(&self) -> Value {
        self.operand_stack().last().copied().unwrap_or(Value::Uninitialised)
    }

    pub fn result_tag(&self) -> ValueType {
        self.result_value().tag()
    }
}
