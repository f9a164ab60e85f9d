//! The textual assembly format: a small line-oriented grammar, assembled
//! against a `CommandSet` into a `Code` section plus a batch of symbols
//! ready for `Linker::add_symbols`. Modeled on `cranelift-reader`'s
//! lexer/parser split (`Lexer` → `Token`, `Parser` → AST), scaled down
//! to one pass with no separate lexer struct since the grammar has no
//! nesting.
//!
//! A mnemonic that needs a declared `ValueType` (anything dispatched
//! through the integer or float executor) takes a `.i`/`.f` suffix,
//! e.g. `push.i 3`, `add.f`; a bare mnemonic defaults to `Integer`.
//! Service mnemonics (branches, `call`, `snfc`, ...) never take a
//! suffix.

use std::collections::HashMap;

use crate::command::{Arg, Command};
use crate::commandset::CommandSet;
use crate::error::{VmError, VmResult};
use crate::reference::{Component, Reference, Section};
use crate::symbol::{hash_name, Symbol};
use crate::value::{Value, ValueType};

/// The result of assembling one module's worth of text: its `Code`
/// section and every label/use as a `(name, Symbol)` pair, ready to
/// hand to `Linker::add_symbols`.
pub struct Assembled {
    pub commands: Vec<Command>,
    pub symbols: Vec<(String, Symbol)>,
}

pub fn assemble(text: &str, command_set: &CommandSet) -> VmResult<Assembled> {
    let mut commands = Vec::new();
    let mut symbols: Vec<(String, Symbol)> = Vec::new();
    let mut seen_uses: HashMap<String, ()> = HashMap::new();

    for raw_line in text.lines() {
        let line = strip_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }

        let mut rest = line;
        while let Some(colon) = rest.find(':') {
            let candidate = rest[..colon].trim();
            if candidate.is_empty() || candidate.contains(char::is_whitespace) {
                break;
            }
            let hash = hash_name(candidate);
            // The assembler already knows a label's offset (the
            // instruction count so far, since nothing for this line has
            // been pushed yet) so it resolves labels directly rather
            // than routing them through the linker's batch
            // auto-placement, which assigns one offset per
            // `add_symbols` call and so can't distinguish several
            // labels staged together.
            let reference = Reference::new(
                Some(Section::Code),
                vec![Component::direct(commands.len() as i64)],
            );
            symbols.push((candidate.to_string(), Symbol::definition(candidate, hash, reference)));
            rest = rest[colon + 1..].trim();
        }
        if rest.is_empty() {
            continue;
        }

        let mut tokens = rest.split_whitespace();
        let mnemonic_token = tokens
            .next()
            .ok_or_else(|| VmError::format_error(format!("empty instruction on line {raw_line:?}")))?;
        let operand = tokens.next();
        if tokens.next().is_some() {
            return Err(VmError::format_error(format!(
                "too many operands on line {raw_line:?}"
            )));
        }

        let (mnemonic, value_type) = split_suffix(mnemonic_token)?;
        let id = command_set.id_of(mnemonic)?;

        let arg = match operand {
            None => Arg::None,
            Some(tok) => parse_operand(tok, value_type, &mut symbols, &mut seen_uses)?,
        };

        commands.push(Command::new(id, value_type, arg));
    }

    Ok(Assembled { commands, symbols })
}

fn strip_comment(line: &str) -> &str {
    match line.find(';') {
        Some(idx) => &line[..idx],
        None => line,
    }
}

fn split_suffix(token: &str) -> VmResult<(&str, ValueType)> {
    if let Some(stem) = token.strip_suffix(".i") {
        Ok((stem, ValueType::Integer))
    } else if let Some(stem) = token.strip_suffix(".f") {
        Ok((stem, ValueType::Float))
    } else {
        Ok((token, ValueType::Integer))
    }
}

fn parse_operand(
    token: &str,
    value_type: ValueType,
    symbols: &mut Vec<(String, Symbol)>,
    seen_uses: &mut HashMap<String, ()>,
) -> VmResult<Arg> {
    if let Some(rest) = token.strip_prefix("$r") {
        let reg = parse_register_letter(rest)?;
        return Ok(Arg::Reference(Reference::new(
            Some(Section::Register),
            vec![Component::direct(reg as i64)],
        )));
    }
    if let Some((prefix, n)) = token.split_once(':') {
        let section = match prefix {
            "c" => Section::Code,
            "d" => Section::Data,
            "f" => Section::Frame,
            "p" => Section::FrameBack,
            "r" => Section::Register,
            other => return Err(VmError::format_error(format!("unknown reference prefix {other:?}"))),
        };
        let offset: i64 = n
            .parse()
            .map_err(|e| VmError::format_error(format!("bad reference offset {n:?}: {e}")))?;
        return Ok(Arg::Reference(Reference::new(
            Some(section),
            vec![Component::direct(offset)],
        )));
    }
    if looks_like_identifier(token) {
        if !seen_uses.contains_key(token) {
            seen_uses.insert(token.to_string(), ());
            symbols.push((token.to_string(), Symbol::unresolved_use(token, hash_name(token))));
        }
        return Ok(Arg::Reference(Reference::new(
            None,
            vec![Component::symbol(hash_name(token))],
        )));
    }
    let v = match value_type {
        ValueType::Float => Value::parse_fp(token)?,
        _ => Value::parse_int(token)?,
    };
    Ok(Arg::Immediate(v))
}

fn parse_register_letter(letter: &str) -> VmResult<u8> {
    let c = letter
        .chars()
        .next()
        .ok_or_else(|| VmError::format_error("empty register name"))?;
    if !c.is_ascii_alphabetic() {
        return Err(VmError::format_error(format!("bad register name ${letter}")));
    }
    let idx = (c.to_ascii_lowercase() as u8).wrapping_sub(b'a');
    if idx as usize >= crate::mmu::R_MAX {
        return Err(VmError::format_error(format!("register ${letter} out of range")));
    }
    Ok(idx)
}

fn looks_like_identifier(token: &str) -> bool {
    let mut chars = token.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
