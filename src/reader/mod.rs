//! Parsing the two on-disk module forms into MMU state: `asm` for the
//! textual format, `bytecode` for the binary one.

pub mod asm;
pub mod bytecode;
