//! The binary module format: a small header, then a sequence of
//! fixed-layout sections (Code, Data, BytePool, Symbols). Mirrors the
//! layered "header, then typed sections, then payload" shape of
//! `cranelift-wasm`'s `ModuleEnvironment`, scaled down to this crate's
//! four section kinds.

use std::io::{Read, Write};

use crate::command::{Arg, Command};
use crate::error::{VmError, VmResult};
use crate::mmu::{ContextBuffer, Mmu};
use crate::reference::{Component, Reference, Section};
use crate::symbol::Symbol;
use crate::value::{Value, ValueType};

const FILE_SIGNATURE: u32 = u32::from_le_bytes(*b"BCDE");
const SECTION_SIGNATURE: u32 = u32::from_le_bytes(*b"SEC_");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum SectionType {
    Code = 0,
    Data = 1,
    BytePool = 2,
    Symbols = 3,
}

impl SectionType {
    fn from_u8(b: u8) -> VmResult<Self> {
        match b {
            0 => Ok(SectionType::Code),
            1 => Ok(SectionType::Data),
            2 => Ok(SectionType::BytePool),
            3 => Ok(SectionType::Symbols),
            _ => Err(VmError::format_error(format!("unknown section type {b}"))),
        }
    }
}

/// Serialize `buffer` to the bytecode format described in the external
/// interfaces section.
pub fn write_module(buffer: &ContextBuffer) -> VmResult<Vec<u8>> {
    let mut out = Vec::new();
    out.extend_from_slice(&FILE_SIGNATURE.to_le_bytes());
    out.push(4); // section_count

    write_section(&mut out, SectionType::Code, buffer.commands.len(), |body| {
        for cmd in &buffer.commands {
            encode_command(body, cmd)?;
        }
        Ok(())
    })?;
    write_section(&mut out, SectionType::Data, buffer.data.len(), |body| {
        for v in &buffer.data {
            body.push(v.tag().as_u8());
            body.extend_from_slice(&v.to_abi().to_le_bytes());
        }
        Ok(())
    })?;
    write_section(&mut out, SectionType::BytePool, buffer.byte_pool.len(), |body| {
        body.extend_from_slice(&buffer.byte_pool);
        Ok(())
    })?;
    write_section(&mut out, SectionType::Symbols, buffer.symbols.len(), |body| {
        for (name, symbol) in buffer.symbols.values() {
            body.extend_from_slice(name.as_bytes());
            body.push(0);
            body.push(u8::from(symbol.resolved));
            if let Some(r) = &symbol.reference {
                encode_reference(body, r)?;
            }
        }
        Ok(())
    })?;

    Ok(out)
}

fn write_section(
    out: &mut Vec<u8>,
    kind: SectionType,
    size_entries: usize,
    fill: impl FnOnce(&mut Vec<u8>) -> VmResult<()>,
) -> VmResult<()> {
    let mut body = Vec::new();
    fill(&mut body)?;
    out.extend_from_slice(&SECTION_SIGNATURE.to_le_bytes());
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&(size_entries as u32).to_le_bytes());
    out.push(kind as u8);
    out.extend_from_slice(&body);
    Ok(())
}

/// Load a module from its bytecode form into a freshly allocated
/// buffer, returning that buffer's id.
pub fn read_module(mmu: &mut Mmu, mut bytes: &[u8]) -> VmResult<usize> {
    let signature = read_u32(&mut bytes)?;
    if signature != FILE_SIGNATURE {
        return Err(VmError::format_error("bad file signature"));
    }
    let section_count = read_u8(&mut bytes)?;

    let id = mmu.alloc_context_buffer();
    let mut commands = Vec::new();
    let mut data = Vec::new();
    let mut byte_pool = Vec::new();
    let mut symbols = std::collections::HashMap::new();

    for _ in 0..section_count {
        let sig = read_u32(&mut bytes)?;
        if sig != SECTION_SIGNATURE {
            return Err(VmError::format_error("bad section signature"));
        }
        let size_bytes = read_u32(&mut bytes)? as usize;
        let _size_entries = read_u32(&mut bytes)?;
        let kind = SectionType::from_u8(read_u8(&mut bytes)?)?;
        if bytes.len() < size_bytes {
            return Err(VmError::format_error("section body truncated"));
        }
        let (body, rest) = bytes.split_at(size_bytes);
        bytes = rest;
        let mut cursor = body;
        match kind {
            SectionType::Code => {
                while !cursor.is_empty() {
                    commands.push(decode_command(&mut cursor)?);
                }
            }
            SectionType::Data => {
                while !cursor.is_empty() {
                    let tag = ValueType::from_u8(read_u8(&mut cursor)?)?;
                    let bits = read_u64(&mut cursor)?;
                    data.push(Value::set_from_abi(bits, tag));
                }
            }
            SectionType::BytePool => byte_pool.extend_from_slice(cursor),
            SectionType::Symbols => {
                while !cursor.is_empty() {
                    let name = read_cstr(&mut cursor)?;
                    let resolved = read_u8(&mut cursor)? != 0;
                    let hash = crate::symbol::hash_name(&name);
                    let symbol = if resolved {
                        Symbol::definition(name.clone(), hash, decode_reference(&mut cursor)?)
                    } else {
                        Symbol::unresolved_use(name.clone(), hash)
                    };
                    symbols.insert(hash, (name, symbol));
                }
            }
        }
    }

    {
        let buf = mmu.buffer_mut_for_load(id)?;
        buf.commands = commands;
        buf.data = data;
        buf.byte_pool = byte_pool;
        buf.symbols = symbols;
    }
    Ok(id)
}

fn encode_command(out: &mut Vec<u8>, cmd: &Command) -> VmResult<()> {
    out.extend_from_slice(&cmd.id.to_le_bytes());
    out.push(cmd.value_type.as_u8());
    match &cmd.arg {
        Arg::None => {
            out.push(0);
            out.extend_from_slice(&[0u8; 16]);
        }
        Arg::Immediate(v) => {
            out.push(1);
            out.extend_from_slice(&v.to_abi().to_le_bytes());
            out.extend_from_slice(&[0u8; 8]);
        }
        Arg::Reference(r) => {
            out.push(2);
            out.extend_from_slice(&encode_reference_component_inline(r)?);
        }
    }
    Ok(())
}

fn decode_command(cursor: &mut &[u8]) -> VmResult<Command> {
    let id = read_u16(cursor)?;
    let value_type = ValueType::from_u8(read_u8(cursor)?)?;
    let arg_kind = read_u8(cursor)?;
    if cursor.len() < 16 {
        return Err(VmError::format_error("command argument truncated"));
    }
    let (arg_bytes, rest) = cursor.split_at(16);
    *cursor = rest;
    let arg = match arg_kind {
        0 => Arg::None,
        1 => {
            let bits = u64::from_le_bytes(arg_bytes[0..8].try_into().unwrap());
            Arg::Immediate(Value::set_from_abi(bits, value_type))
        }
        2 => Arg::Reference(decode_reference_component_inline(arg_bytes)?),
        other => return Err(VmError::format_error(format!("unknown arg kind {other}"))),
    };
    Ok(Command::new(id, value_type, arg))
}

/// A command argument reference is limited to one component (no
/// `Indirect`, matching the fixed 16-byte slot the in-memory format
/// reserves for it).
fn encode_reference_component_inline(r: &Reference) -> VmResult<[u8; 16]> {
    if r.components.len() != 1 {
        return Err(VmError::format_error(
            "an inline command-argument reference must have exactly one component",
        ));
    }
    let mut out = [0u8; 16];
    out[0] = section_byte(r.global_section);
    match &r.components[0] {
        Component::Direct { offset, .. } => {
            out[1] = 0;
            out[2..10].copy_from_slice(&offset.to_le_bytes());
        }
        Component::Symbol { hash, .. } => {
            out[1] = 1;
            out[2..10].copy_from_slice(&hash.to_le_bytes());
        }
        Component::Indirect { .. } => {
            return Err(VmError::format_error(
                "an inline command-argument reference cannot be Indirect",
            ))
        }
    }
    Ok(out)
}

fn decode_reference_component_inline(bytes: &[u8]) -> VmResult<Reference> {
    let section = section_from_byte(bytes[0])?;
    let payload = i64::from_le_bytes(bytes[2..10].try_into().unwrap());
    let component = match bytes[1] {
        0 => Component::direct(payload),
        1 => Component::symbol(payload as u64),
        other => return Err(VmError::format_error(format!("unknown component kind {other}"))),
    };
    Ok(Reference::new(section, vec![component]))
}

/// A symbol definition's reference: up to two components, so it uses
/// the fuller record (global_section, flags, component_count, then
/// that many 16-byte component slots).
fn encode_reference(out: &mut Vec<u8>, r: &Reference) -> VmResult<()> {
    out.push(section_byte(r.global_section));
    out.push(u8::from(r.needs_linker_placement));
    out.push(r.components.len() as u8);
    out.push(0); // padding
    for c in &r.components {
        let as_ref = Reference::new(r.global_section, vec![*c]);
        out.extend_from_slice(&encode_reference_component_inline(&as_ref)?);
    }
    Ok(())
}

fn decode_reference(cursor: &mut &[u8]) -> VmResult<Reference> {
    let section = section_from_byte(read_u8(cursor)?)?;
    let needs_placement = read_u8(cursor)? != 0;
    let count = read_u8(cursor)? as usize;
    let _padding = read_u8(cursor)?;
    if count == 0 || count > 2 {
        return Err(VmError::format_error("reference component_count out of range"));
    }
    let mut components = Vec::with_capacity(count);
    for _ in 0..count {
        if cursor.len() < 16 {
            return Err(VmError::format_error("reference component truncated"));
        }
        let (slot, rest) = cursor.split_at(16);
        *cursor = rest;
        components.push(decode_reference_component_inline(slot)?.components.remove(0));
    }
    let mut r = Reference::new(section, components);
    r.needs_linker_placement = needs_placement;
    Ok(r)
}

fn section_byte(section: Option<Section>) -> u8 {
    match section {
        None => 7,
        Some(Section::Code) => 0,
        Some(Section::Data) => 1,
        Some(Section::Register) => 2,
        Some(Section::Frame) => 3,
        Some(Section::FrameBack) => 4,
        Some(Section::BytePool) => 5,
        Some(Section::None) => 6,
    }
}

fn section_from_byte(b: u8) -> VmResult<Option<Section>> {
    Ok(match b {
        0 => Some(Section::Code),
        1 => Some(Section::Data),
        2 => Some(Section::Register),
        3 => Some(Section::Frame),
        4 => Some(Section::FrameBack),
        5 => Some(Section::BytePool),
        6 => Some(Section::None),
        7 => None,
        other => return Err(VmError::format_error(format!("unknown section byte {other}"))),
    })
}

fn read_u8(cursor: &mut &[u8]) -> VmResult<u8> {
    if cursor.is_empty() {
        return Err(VmError::format_error("unexpected end of bytecode stream"));
    }
    let (b, rest) = cursor.split_at(1);
    *cursor = rest;
    Ok(b[0])
}

fn read_u16(cursor: &mut &[u8]) -> VmResult<u16> {
    if cursor.len() < 2 {
        return Err(VmError::format_error("unexpected end of bytecode stream"));
    }
    let (b, rest) = cursor.split_at(2);
    *cursor = rest;
    Ok(u16::from_le_bytes(b.try_into().unwrap()))
}

fn read_u32(cursor: &mut &[u8]) -> VmResult<u32> {
    if cursor.len() < 4 {
        return Err(VmError::format_error("unexpected end of bytecode stream"));
    }
    let (b, rest) = cursor.split_at(4);
    *cursor = rest;
    Ok(u32::from_le_bytes(b.try_into().unwrap()))
}

fn read_u64(cursor: &mut &[u8]) -> VmResult<u64> {
    if cursor.len() < 8 {
        return Err(VmError::format_error("unexpected end of bytecode stream"));
    }
    let (b, rest) = cursor.split_at(8);
    *cursor = rest;
    Ok(u64::from_le_bytes(b.try_into().unwrap()))
}

fn read_cstr(cursor: &mut &[u8]) -> VmResult<String> {
    let nul = cursor
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| VmError::format_error("symbol name missing NUL terminator"))?;
    let (name, rest) = cursor.split_at(nul);
    *cursor = &rest[1..];
    String::from_utf8(name.to_vec()).map_err(|e| VmError::format_error(format!("invalid utf-8 symbol name: {e}")))
}

/// Write a module to a stream (wraps `write_module`, following
/// `std::io::Write` the way the rest of the crate's "external
/// interfaces" expect rather than returning only an owned buffer).
pub fn write_module_to<W: Write>(buffer: &ContextBuffer, mut w: W) -> VmResult<()> {
    w.write_all(&write_module(buffer)?)?;
    Ok(())
}

pub fn read_module_from<R: Read>(mmu: &mut Mmu, mut r: R) -> VmResult<usize> {
    let mut bytes = Vec::new();
    r.read_to_end(&mut bytes)?;
    read_module(mmu, &bytes)
}
