//! The mnemonic/id bidirectional map and per-command executor registry.

use std::collections::HashMap;

use crate::command::ExecutorKind;
use crate::error::{VmError, VmResult};
use crate::value::ValueType;

/// What kind of argument a mnemonic's instructions carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgType {
    None,
    Value,
    Reference,
}

/// Static metadata for one mnemonic, plus the per-executor dispatch
/// handles registered against it.
#[derive(Debug, Clone)]
pub struct Traits {
    pub mnemonic: &'static str,
    pub description: &'static str,
    pub arg_type: ArgType,
    pub is_service: bool,
    pub execution_handles: HashMap<ExecutorKind, u32>,
}

pub struct CommandSet {
    by_id: HashMap<u16, Traits>,
    by_mnemonic: HashMap<&'static str, u16>,
    /// Bumped on every registry mutation; commands cache dispatch
    /// results against this value and recompute when it moves on.
    generation: u64,
}

impl Default for CommandSet {
    fn default() -> Self {
        Self::with_initial_set()
    }
}

impl CommandSet {
    pub fn new() -> Self {
        CommandSet {
            by_id: HashMap::new(),
            by_mnemonic: HashMap::new(),
            generation: 0,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn bump_generation(&mut self) {
        self.generation += 1;
    }

    pub fn register(&mut self, id: u16, traits: Traits) -> VmResult<()> {
        if self.by_id.contains_key(&id) {
            return Err(VmError::format_error(format!(
                "command id collision: {id} ({:?})",
                traits.mnemonic
            )));
        }
        self.by_mnemonic.insert(traits.mnemonic, id);
        self.by_id.insert(id, traits);
        self.bump_generation();
        Ok(())
    }

    pub fn id_of(&self, mnemonic: &str) -> VmResult<u16> {
        self.by_mnemonic
            .get(mnemonic)
            .copied()
            .ok_or_else(|| VmError::format_error(format!("unknown mnemonic {mnemonic:?}")))
    }

    pub fn decode(&self, id: u16) -> VmResult<&Traits> {
        self.by_id
            .get(&id)
            .ok_or_else(|| VmError::format_error(format!("unknown command id {id}")))
    }

    pub fn decode_mnemonic(&self, mnemonic: &str) -> VmResult<&Traits> {
        let id = self.id_of(mnemonic)?;
        self.decode(id)
    }

    /// Register a per-executor dispatch target for an existing mnemonic.
    pub fn add_command_impl(&mut self, mnemonic: &str, executor: ExecutorKind, handle: u32) -> VmResult<()> {
        let id = self.id_of(mnemonic)?;
        let traits = self.by_id.get_mut(&id).expect("id_of found it");
        traits.execution_handles.insert(executor, handle);
        self.bump_generation();
        Ok(())
    }

    /// The fixed initial instruction set described in the spec: stack
    /// ops, memory ops, integer/float arithmetic, branches, flag
    /// control, and service instructions.
    pub fn with_initial_set() -> Self {
        let mut set = CommandSet::new();
        crate::executors::register_initial_set(&mut set).expect("initial command set is well-formed");
        set
    }
}

fn traits(
    mnemonic: &'static str,
    description: &'static str,
    arg_type: ArgType,
    is_service: bool,
) -> Traits {
    Traits {
        mnemonic,
        description,
        arg_type,
        is_service,
        execution_handles: HashMap::new(),
    }
}

/// The full table of `(id, mnemonic, description, arg_type, is_service)`
/// tuples for the fixed initial set, shared between `CommandSet`
/// construction and `reader::asm`'s mnemonic table.
pub fn initial_table() -> Vec<(u16, Traits)> {
    let mut id = 0u16;
    let mut next = || {
        let v = id;
        id += 1;
        v
    };
    vec![
        (next(), traits("push", "push a value onto the selected stack", ArgType::Value, false)),
        (next(), traits("pop", "pop and discard the top of the selected stack", ArgType::None, false)),
        (next(), traits("top", "peek the top of the selected stack", ArgType::None, false)),
        (next(), traits("cmp", "compare the top two values of the selected stack", ArgType::None, false)),
        (next(), traits("swap", "swap the top two values of the selected stack", ArgType::None, false)),
        (next(), traits("dup", "duplicate the top of the selected stack", ArgType::None, false)),
        (next(), traits("anal", "re-run flag analysis over the top of the selected stack", ArgType::None, false)),
        (next(), traits("lea", "store a resolved address into R_F", ArgType::Reference, true)),
        (next(), traits("ld", "load a value onto the selected stack", ArgType::Reference, false)),
        (next(), traits("st", "store the top of the selected stack", ArgType::Reference, false)),
        (next(), traits("ldint", "load an integer value onto the integer stack", ArgType::Reference, false)),
        (next(), traits("stint", "store the top of the integer stack", ArgType::Reference, false)),
        (next(), traits("settype", "retag a value in place", ArgType::None, false)),
        (next(), traits("add", "add the top two values", ArgType::None, false)),
        (next(), traits("sub", "subtract (subtrahend on top)", ArgType::None, false)),
        (next(), traits("mul", "multiply the top two values", ArgType::None, false)),
        (next(), traits("div", "divide (divisor on top)", ArgType::None, false)),
        (next(), traits("mod", "remainder (divisor on top)", ArgType::None, false)),
        (next(), traits("inc", "increment the top of stack", ArgType::None, false)),
        (next(), traits("dec", "decrement the top of stack", ArgType::None, false)),
        (next(), traits("neg", "negate the top of stack", ArgType::None, false)),
        (next(), traits("abs", "absolute value of the top of stack", ArgType::None, false)),
        (next(), traits("sqrt", "square root", ArgType::None, false)),
        (next(), traits("sin", "sine", ArgType::None, false)),
        (next(), traits("cos", "cosine", ArgType::None, false)),
        (next(), traits("tan", "tangent", ArgType::None, false)),
        (next(), traits("asin", "arcsine", ArgType::None, false)),
        (next(), traits("acos", "arccosine", ArgType::None, false)),
        (next(), traits("atan", "arctangent", ArgType::None, false)),
        (next(), traits("je", "jump if Zero", ArgType::Reference, true)),
        (next(), traits("jne", "jump if not Zero", ArgType::Reference, true)),
        (next(), traits("ja", "jump if above", ArgType::Reference, true)),
        (next(), traits("jna", "jump if not above", ArgType::Reference, true)),
        (next(), traits("jae", "jump if above or equal", ArgType::Reference, true)),
        (next(), traits("jnae", "jump if not above or equal", ArgType::Reference, true)),
        (next(), traits("jb", "jump if below", ArgType::Reference, true)),
        (next(), traits("jnb", "jump if not below", ArgType::Reference, true)),
        (next(), traits("jbe", "jump if below or equal", ArgType::Reference, true)),
        (next(), traits("jnbe", "jump if not below or equal", ArgType::Reference, true)),
        (next(), traits("jmp", "unconditional jump", ArgType::Reference, true)),
        (next(), traits("call", "save context then jump", ArgType::Reference, true)),
        (next(), traits("ret", "restore context", ArgType::None, true)),
        (next(), traits("snfc", "set the no-flag-change flag", ArgType::None, true)),
        (next(), traits("cnfc", "clear the no-flag-change flag", ArgType::None, true)),
        (next(), traits("init", "reset the MMU and allocate a new buffer", ArgType::None, true)),
        (next(), traits("sleep", "yield to the host scheduler (a no-op in this crate)", ArgType::None, true)),
        (next(), traits("sys", "invoke a host syscall-like service handle", ArgType::Value, true)),
        (next(), traits("dump", "log a diagnostic dump of the current context", ArgType::None, true)),
        (next(), traits("quit", "stop execution and set the result ABI", ArgType::None, true)),
    ]
}

/// The value type an argument literal is meant to be parsed as for a
/// given mnemonic; used by `reader::asm`. Branches/`lea`/`call` always
/// carry references (no value type to infer); everything else infers
/// from the instruction's own declared `ValueType` at decode time.
pub fn default_value_type_hint(_mnemonic: &str) -> ValueType {
    ValueType::Integer
}
