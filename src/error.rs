//! The single tagged error representation returned by every fallible
//! operation in this crate.

use thiserror::Error;

use crate::reference::Section;
use crate::value::ValueType;

/// Everything that can go wrong inside the MMU, linker, interpreter or
/// native backend.
#[derive(Debug, Error)]
pub enum VmError {
    /// A `Value` was read or written with a tag that does not match its
    /// actual variant.
    #[error("type error: expected {expected:?}, found {found:?}")]
    TypeError {
        expected: ValueType,
        found: ValueType,
    },

    /// An MMU access fell outside a section, stack or register file.
    #[error("out of bounds: {section:?} index {index} (limit {limit})")]
    OutOfBounds {
        section: Section,
        index: i64,
        limit: usize,
    },

    /// `resolve` walked into a symbol with no definition.
    #[error("unresolved symbol (hash {hash:#x})")]
    SymbolUnresolved { hash: u64 },

    /// Two definitions were committed for the same symbol hash.
    #[error("symbol redefinition (hash {hash:#x}, name {name:?})")]
    SymbolRedefinition { hash: u64, name: String },

    /// A composite reference was malformed: duplicate section
    /// contributions, or an auto-placement flag on a non-label section.
    #[error("invalid reference: {reason}")]
    InvalidReference { reason: String },

    /// A jump resolved to a non-Code section.
    #[error("invalid jump target: resolved to section {section:?}")]
    InvalidJumpTarget { section: Section },

    /// A byte-stream or file operation failed.
    #[error("I/O error: {0}")]
    IOError(#[from] std::io::Error),

    /// The bytecode or assembly text violated its format.
    #[error("format error: {0}")]
    FormatError(String),

    /// A fault was observed inside a compiled image, or code generation
    /// refused to run (unsupported host, an unreachable fix-up).
    #[error("native backend error: {0}")]
    Native(String),
}

impl VmError {
    pub fn invalid_reference(reason: impl Into<String>) -> Self {
        Self::InvalidReference {
            reason: reason.into(),
        }
    }

    pub fn format_error(reason: impl Into<String>) -> Self {
        Self::FormatError(reason.into())
    }

    pub fn native(reason: impl Into<String>) -> Self {
        Self::Native(reason.into())
    }
}

pub type VmResult<T> = Result<T, VmError>;
