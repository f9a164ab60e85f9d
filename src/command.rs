//! The decoded instruction record and the dispatch cache attached to it.

use crate::reference::Reference;
use crate::value::{Value, ValueType};

/// A command's argument: none, an immediate literal, or a reference to
/// be resolved at dispatch time.
#[derive(Debug, Clone)]
pub enum Arg {
    None,
    Immediate(Value),
    Reference(Reference),
}

/// Identifies which of the three executors owns a command, cached on
/// first dispatch alongside the executor-specific handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutorKind {
    Integer,
    Float,
    Service,
}

/// A decoded instruction. `id`/`value_type` identify it in the
/// `CommandSet`; `dispatch` is filled in lazily by `Logic` on first
/// execution and invalidated whenever the command set's registry
/// changes (see `CommandSet::bump_generation`).
#[derive(Debug, Clone)]
pub struct Command {
    pub id: u16,
    pub value_type: ValueType,
    pub arg: Arg,
    dispatch: Option<(ExecutorKind, u32, u64)>,
}

impl Command {
    pub fn new(id: u16, value_type: ValueType, arg: Arg) -> Self {
        Command {
            id,
            value_type,
            arg,
            dispatch: None,
        }
    }

    /// The cached (executor, handle) pair, if it was computed against
    /// the command set generation `generation`.
    pub fn cached_dispatch(&self, generation: u64) -> Option<(ExecutorKind, u32)> {
        match self.dispatch {
            Some((kind, handle, gen)) if gen == generation => Some((kind, handle)),
            _ => None,
        }
    }

    pub fn cache_dispatch(&mut self, kind: ExecutorKind, handle: u32, generation: u64) {
        self.dispatch = Some((kind, handle, generation));
    }
}
