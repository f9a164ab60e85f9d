//! Per-opcode lowering: translates one guest `Command` into its x86-64
//! instruction sequence, following the encodings listed in the native
//! backend's design (§4.8 of the originating design document).
//!
//! Scope: every stack, arithmetic, comparison, branch and call/return
//! opcode is lowered directly. Opcodes that need a pointer into the
//! MMU's backing storage at call time (`ld`, `st`, `ldint`, `stint`,
//! `lea`, `settype`) or that have no meaningful native form (`sys`,
//! `dump`, `sleep`, `init`) are refused at compile time rather than
//! routed through a runtime "command gate" trampoline: `compile()`
//! returns `VmError::Native` for a buffer containing any of them, and
//! `Vm::compile_and_run` falls back to the interpreter for that whole
//! buffer, which satisfies the "try native then interpret" contract in
//! §7 without the unsafe cross-ABI state threading a real mid-stream
//! gate would need. See `DESIGN.md` for the full rationale.

use crate::codegen::emit::CodeBuffer;
use crate::command::{Arg, Command};
use crate::commandset::CommandSet;
use crate::error::{VmError, VmResult};
use crate::mmu::Mmu;
use crate::value::{Value, ValueType};

const RAX: u8 = 0;
const RCX: u8 = 1;
const RDX: u8 = 2;
const RBX: u8 = 3;
const RSP: u8 = 4;
const RSI: u8 = 6;
const R11: u8 = 11;

/// Bit layout of the flag-capture register (RBX, low byte): bits 0-1
/// (Zero, Negative) are rewritten by every `cmp`/`anal`; bit 3 (NFC) is
/// only ever touched by `snfc`/`cnfc` and is read (not rewritten) by
/// arithmetic. InvalidFP has no cheap EFLAGS-derived equivalent, so the
/// native backend never sets it — a buffer that branches on it falls
/// back to the interpreter along with every other unsupported opcode.
const FLAG_ZERO: u8 = 0x01;
const FLAG_NEGATIVE: u8 = 0x02;
const FLAG_NFC: u8 = 0x08;

pub fn compile_buffer(mmu: &Mmu, command_set: &CommandSet) -> VmResult<Vec<u8>> {
    let buf_id = mmu.context().buffer;
    let buffer = mmu.buffer(buf_id)?;

    let mut out = CodeBuffer::new();
    prologue(&mut out);

    for (ip, cmd) in buffer.commands.iter().enumerate() {
        out.mark_ip(ip);
        let traits = command_set.decode(cmd.id)?;
        compile_one(&mut out, traits.mnemonic, cmd)?;
    }

    out.apply_fixups();
    Ok(out.bytes)
}

fn prologue(buf: &mut CodeBuffer) {
    // mov r11, rdi  (capture out_tag, the SysV first integer argument)
    buf.u8(0x49);
    buf.u8(0x89);
    buf.u8(crate::codegen::emit::encode_modrm(0b11, RDI_REG, R11 & 7));
    // push rbx ; push rbp ; mov rbp, rsp
    buf.u8(0x53);
    buf.u8(0x55);
    buf.u8(0x48);
    buf.u8(0x89);
    buf.u8(crate::codegen::emit::encode_modrm(0b11, RSP, 5 /* rbp */));
    // finit (no FWAIT)
    buf.u8(0xdb);
    buf.u8(0xe3);
    // xor ebx, ebx
    buf.u8(0x31);
    buf.u8(crate::codegen::emit::encode_modrm(0b11, RBX, RBX));
}

const RDI_REG: u8 = 7;

fn epilogue_quit(buf: &mut CodeBuffer, value_type: ValueType) {
    // mov dword [r11], tag
    buf.u8(0x41); // REX.B for r11 base
    buf.u8(0xc7);
    buf.u8(crate::codegen::emit::encode_modrm(0b00, 0, R11 & 7));
    buf.u32(value_type.as_u8() as u32);

    match value_type {
        ValueType::Integer => { /* result already in rax */ }
        ValueType::Float => {
            // sub rsp, 8 ; fstp qword [rsp] ; pop rax
            buf.u8(0x48);
            buf.u8(0x83);
            buf.u8(crate::codegen::emit::encode_modrm(0b11, 5, RSP));
            buf.u8(0x08);
            // fstp qword [rsp]: DD /3 with SIB for rsp
            buf.u8(0xdd);
            buf.u8(0x1c);
            buf.u8(0x24);
            buf.u8(0x58); // pop rax
        }
        ValueType::Uninitialised => {
            // xor eax, eax
            buf.u8(0x31);
            buf.u8(crate::codegen::emit::encode_modrm(0b11, RAX, RAX));
        }
    }

    buf.u8(0xdb);
    buf.u8(0xe3); // finit
    buf.u8(0xc9); // leave
    buf.u8(0x5b); // pop rbx
    buf.u8(0xc3); // ret
}

fn mov_rax_imm64(buf: &mut CodeBuffer, bits: u64) {
    buf.u8(0x48);
    buf.u8(0xb8);
    buf.u64(bits);
}

fn mov_rcx_imm64(buf: &mut CodeBuffer, bits: u64) {
    buf.u8(0x48);
    buf.u8(0xb9);
    buf.u64(bits);
}

fn push_reg(buf: &mut CodeBuffer, reg: u8) {
    buf.u8(0x50 + (reg & 7));
}

fn pop_reg(buf: &mut CodeBuffer, reg: u8) {
    buf.u8(0x58 + (reg & 7));
}

/// `mov reg, reg` (64-bit).
fn mov_reg_reg(buf: &mut CodeBuffer, dst: u8, src: u8) {
    buf.u8(0x48);
    buf.u8(0x89);
    buf.u8(crate::codegen::emit::encode_modrm(0b11, src, dst));
}

fn alu_reg_reg(buf: &mut CodeBuffer, opcode: u8, dst: u8, src: u8) {
    buf.u8(0x48);
    buf.u8(opcode);
    buf.u8(crate::codegen::emit::encode_modrm(0b11, src, dst));
}

/// `fld qword [rsp]`.
fn fld_rsp(buf: &mut CodeBuffer) {
    buf.u8(0xdd);
    buf.u8(0x04);
    buf.u8(0x24);
}

fn x87(buf: &mut CodeBuffer, bytes: &[u8]) {
    buf.bytes.extend_from_slice(bytes);
}

fn immediate(cmd: &Command) -> VmResult<Value> {
    match &cmd.arg {
        Arg::Immediate(v) => Ok(*v),
        _ => Err(VmError::native("push with no immediate argument")),
    }
}

fn jump_target(cmd: &Command) -> VmResult<usize> {
    // The linker has already resolved every reference in this buffer
    // by the time codegen runs; a Code-section reference's offset is
    // simply the target ip.
    match &cmd.arg {
        Arg::Reference(r) if r.components.len() == 1 => {
            if let crate::reference::Component::Direct {
                section: Some(crate::reference::Section::Code),
                offset,
            } = r.components[0]
            {
                return Ok(offset as usize);
            }
            Err(VmError::native("branch target is not a resolved Code reference"))
        }
        _ => Err(VmError::native("branch with no usable reference argument")),
    }
}

/// Emit `test bl, NFC ; jnz skip` around `body`, so arithmetic respects
/// a runtime-toggled `snfc`/`cnfc` the way the interpreter does.
fn unless_nfc(buf: &mut CodeBuffer, body: impl FnOnce(&mut CodeBuffer)) {
    // test bl, 0x08
    buf.u8(0xf6);
    buf.u8(crate::codegen::emit::encode_modrm(0b11, 0, RBX));
    buf.u8(FLAG_NFC);
    // jnz rel8 (patched below)
    buf.u8(0x75);
    let patch_at = buf.offset();
    buf.u8(0); // placeholder
    body(buf);
    let rel = (buf.offset() - (patch_at + 1)) as u8;
    buf.bytes[patch_at] = rel;
}

/// Set EFLAGS from `result_reg`'s value, then fold ZF/SF into bits 0-1
/// of BL, preserving the NFC bit (bit 3). Used by integer arithmetic,
/// where there is no other source of flags.
fn capture_flags_int(buf: &mut CodeBuffer, result_reg: u8) {
    alu_reg_reg(buf, 0x85, result_reg, result_reg); // test reg,reg
    fold_eflags_into_bl(buf);
}

/// Fold whatever ZF/SF the last comparison left in EFLAGS into bits
/// 0-1 of BL, preserving the NFC bit. Does not touch EFLAGS itself, so
/// it is safe to call right after `fucomip`/`sahf` without re-deriving
/// the flags from a register.
fn fold_eflags_into_bl(buf: &mut CodeBuffer) {
    // and bl, NFC
    buf.u8(0x80);
    buf.u8(crate::codegen::emit::encode_modrm(0b11, 4, RBX));
    buf.u8(FLAG_NFC);
    // setz cl
    buf.u8(0x0f);
    buf.u8(0x94);
    buf.u8(crate::codegen::emit::encode_modrm(0b11, 0, RCX));
    // sets dl
    buf.u8(0x0f);
    buf.u8(0x98);
    buf.u8(crate::codegen::emit::encode_modrm(0b11, 0, RDX));
    // shl dl, 1
    buf.u8(0xc0);
    buf.u8(crate::codegen::emit::encode_modrm(0b11, 4, RDX));
    buf.u8(1);
    // or bl, cl ; or bl, dl
    buf.u8(0x08);
    buf.u8(crate::codegen::emit::encode_modrm(0b11, RCX, RBX));
    buf.u8(0x08);
    buf.u8(crate::codegen::emit::encode_modrm(0b11, RDX, RBX));
}

fn compile_one(buf: &mut CodeBuffer, mnemonic: &str, cmd: &Command) -> VmResult<()> {
    match mnemonic {
        "push" => {
            let v = immediate(cmd)?;
            match v {
                Value::Integer(i) => {
                    push_reg(buf, RAX);
                    mov_rax_imm64(buf, i as u64);
                }
                Value::Float(f) => {
                    mov_rcx_imm64(buf, f.to_bits());
                    push_reg(buf, RCX);
                    fld_rsp(buf);
                    pop_reg(buf, RCX);
                }
                Value::Uninitialised => return Err(VmError::native("push of an uninitialised literal")),
            }
        }
        "pop" => match cmd.value_type {
            ValueType::Integer => pop_reg(buf, RAX),
            ValueType::Float => x87(buf, &[0xdd, 0xc0, 0xd9, 0xf7]), // ffree st0 ; fincstp
            ValueType::Uninitialised => return Err(VmError::native("pop with no declared type")),
        },
        "dup" => match cmd.value_type {
            ValueType::Integer => push_reg(buf, RAX),
            ValueType::Float => x87(buf, &[0xd9, 0xc0]), // fld st(0)
            ValueType::Uninitialised => return Err(VmError::native("dup with no declared type")),
        },
        "swap" => match cmd.value_type {
            ValueType::Integer => {
                // xchg rax, [rsp]
                buf.u8(0x48);
                buf.u8(0x87);
                buf.u8(0x04);
                buf.u8(0x24);
            }
            ValueType::Float => x87(buf, &[0xd9, 0xc9]), // fxch st(1)
            ValueType::Uninitialised => return Err(VmError::native("swap with no declared type")),
        },
        "top" => { /* pure peek: nothing to emit, value already resident */ }
        "cmp" | "anal" => compile_compare_or_analyze(buf, mnemonic, cmd.value_type)?,
        "add" | "sub" | "mul" | "div" | "mod" => compile_binary_arith(buf, mnemonic, cmd.value_type)?,
        "inc" | "dec" | "neg" | "abs" => compile_unary_arith(buf, mnemonic, cmd.value_type)?,
        "sqrt" => x87(buf, &[0xd9, 0xfa]),
        "sin" => x87(buf, &[0xd9, 0xfe]),
        "cos" => x87(buf, &[0xd9, 0xff]),
        "tan" => x87(buf, &[0xd9, 0xf2, 0xdd, 0xd8]), // fptan ; fstp st(0) pop-1.0 fixup
        "asin" | "acos" => {
            return Err(VmError::native(format!(
                "{mnemonic} has no single x87 opcode; native backend does not lower it"
            )))
        }
        "atan" => x87(buf, &[0xd9, 0xe8, 0xd9, 0xf3]), // fld1 ; fpatan
        "je" => compile_cond_jump(buf, cmd, FLAG_ZERO, true)?,
        "jne" => compile_cond_jump(buf, cmd, FLAG_ZERO, false)?,
        "ja" | "jnbe" => compile_cond_jump(buf, cmd, FLAG_ZERO | FLAG_NEGATIVE, false)?,
        "jna" | "jbe" => compile_cond_jump(buf, cmd, FLAG_ZERO | FLAG_NEGATIVE, true)?,
        "jae" | "jnb" => compile_cond_jump(buf, cmd, FLAG_NEGATIVE, false)?,
        "jnae" | "jb" => compile_cond_jump(buf, cmd, FLAG_NEGATIVE, true)?,
        "jmp" => {
            let target = jump_target(cmd)?;
            buf.u8(0xe9);
            buf.rel32_fixup(target);
        }
        "call" => {
            return Err(VmError::native(
                "call crosses a save_context/restore_context boundary the native backend does not model",
            ))
        }
        "ret" => {
            return Err(VmError::native(
                "ret crosses a save_context/restore_context boundary the native backend does not model",
            ))
        }
        "snfc" => {
            buf.u8(0x80);
            buf.u8(crate::codegen::emit::encode_modrm(0b11, 1, RBX));
            buf.u8(FLAG_NFC);
        }
        "cnfc" => {
            buf.u8(0x80);
            buf.u8(crate::codegen::emit::encode_modrm(0b11, 4, RBX));
            buf.u8(!FLAG_NFC);
        }
        "quit" => epilogue_quit(buf, cmd.value_type),
        other => {
            return Err(VmError::native(format!(
                "{other} has no direct native lowering; native backend does not translate this buffer"
            )))
        }
    }
    Ok(())
}

fn compile_compare_or_analyze(buf: &mut CodeBuffer, mnemonic: &str, ty: ValueType) -> VmResult<()> {
    match ty {
        ValueType::Integer => {
            if mnemonic == "cmp" {
                mov_reg_reg(buf, RSI, RAX); // rsi = b (old top)
                pop_reg(buf, RAX); // rax = a (remaining top)
                alu_reg_reg(buf, 0x39, RAX, RSI); // cmp rax, rsi  -> flags = a - b
                capture_flags_int(buf, RAX);
            } else {
                capture_flags_int(buf, RAX);
            }
        }
        ValueType::Float => {
            if mnemonic == "cmp" {
                // fucomip st0, st1 ; fstp st(0): compares b (st0) against
                // a (st1) and writes ZF/PF/CF into RFLAGS directly, so
                // unlike `ftst` there is no `fstsw`/`sahf` step here.
                x87(buf, &[0xdf, 0xe9, 0xdd, 0xd8]);
            } else {
                // ftst ; fstsw ax ; sahf : compare st0 against 0.0 and
                // fold the legacy x87 status word into RFLAGS.
                x87(buf, &[0xd9, 0xe4, 0xdf, 0xe0]);
                buf.u8(0x9e); // sahf
            }
            fold_eflags_into_bl(buf);
        }
        ValueType::Uninitialised => return Err(VmError::native("cmp/anal with no declared type")),
    }
    Ok(())
}

fn compile_binary_arith(buf: &mut CodeBuffer, mnemonic: &str, ty: ValueType) -> VmResult<()> {
    match ty {
        ValueType::Integer => {
            mov_reg_reg(buf, RCX, RAX); // rcx = b (top/divisor/subtrahend)
            pop_reg(buf, RAX); // rax = a
            match mnemonic {
                "add" => alu_reg_reg(buf, 0x01, RAX, RCX),
                "sub" => alu_reg_reg(buf, 0x29, RAX, RCX),
                "mul" => {
                    // imul rax, rcx : 0F AF /r
                    buf.u8(0x48);
                    buf.u8(0x0f);
                    buf.u8(0xaf);
                    buf.u8(crate::codegen::emit::encode_modrm(0b11, RAX, RCX));
                }
                "div" | "mod" => {
                    // cqo ; idiv rcx  (division by zero faults at the
                    // hardware level; a host embedding this backend is
                    // expected to translate that fault into
                    // `VmError::Native`, the way `wasmtime-runtime`
                    // installs its own SIGFPE/SIGSEGV handler around
                    // calls into compiled code)
                    buf.u8(0x48);
                    buf.u8(0x99); // cqo
                    buf.u8(0x48);
                    buf.u8(0xf7);
                    buf.u8(crate::codegen::emit::encode_modrm(0b11, 7, RCX)); // idiv rcx
                    if mnemonic == "mod" {
                        mov_reg_reg(buf, RAX, RDX);
                    }
                }
                _ => unreachable!(),
            }
            unless_nfc(buf, |b| capture_flags_int(b, RAX));
        }
        ValueType::Float => {
            let op: &[u8] = match mnemonic {
                "add" => &[0xde, 0xc1],
                "sub" => &[0xde, 0xe9],
                "mul" => &[0xde, 0xc9],
                "div" => &[0xde, 0xf9],
                "mod" => &[0xd9, 0xf5], // fprem1
                _ => unreachable!(),
            };
            x87(buf, op);
            unless_nfc(buf, |b| {
                x87(b, &[0xd9, 0xe4, 0xdf, 0xe0]); // ftst ; fstsw ax
                b.u8(0x9e); // sahf
                fold_eflags_into_bl(b);
            });
        }
        ValueType::Uninitialised => return Err(VmError::native("arithmetic with no declared type")),
    }
    Ok(())
}

fn compile_unary_arith(buf: &mut CodeBuffer, mnemonic: &str, ty: ValueType) -> VmResult<()> {
    match ty {
        ValueType::Integer => {
            match mnemonic {
                "inc" => {
                    buf.u8(0x48);
                    buf.u8(0x83);
                    buf.u8(crate::codegen::emit::encode_modrm(0b11, 0, RAX));
                    buf.u8(1);
                }
                "dec" => {
                    buf.u8(0x48);
                    buf.u8(0x83);
                    buf.u8(crate::codegen::emit::encode_modrm(0b11, 5, RAX));
                    buf.u8(1);
                }
                "neg" => {
                    buf.u8(0x48);
                    buf.u8(0xf7);
                    buf.u8(crate::codegen::emit::encode_modrm(0b11, 3, RAX));
                }
                "abs" => {
                    // cqo ; xor rax, rdx ; sub rax, rdx
                    buf.u8(0x48);
                    buf.u8(0x99);
                    alu_reg_reg(buf, 0x31, RAX, RDX);
                    alu_reg_reg(buf, 0x29, RAX, RDX);
                }
                _ => unreachable!(),
            }
            unless_nfc(buf, |b| capture_flags_int(b, RAX));
        }
        ValueType::Float => {
            let op: &[u8] = match mnemonic {
                "inc" => &[0xd9, 0xe8, 0xde, 0xc1],  // fld1 ; faddp
                "dec" => &[0xd9, 0xe8, 0xde, 0xe9],  // fld1 ; fsubp(st1,st0) = x-1
                "neg" => &[0xd9, 0xe0],              // fchs
                "abs" => &[0xd9, 0xe1],              // fabs
                _ => unreachable!(),
            };
            x87(buf, op);
            unless_nfc(buf, |b| {
                x87(b, &[0xd9, 0xe4, 0xdf, 0xe0]);
                b.u8(0x9e);
                fold_eflags_into_bl(b);
            });
        }
        ValueType::Uninitialised => return Err(VmError::native("arithmetic with no declared type")),
    }
    Ok(())
}

/// `cmp`'s flag bits are captured as a linear combination; a conditional
/// branch tests one or two of those bits. `any_set == true` jumps when
/// any bit in `mask` is set; `false` jumps when none are.
fn compile_cond_jump(buf: &mut CodeBuffer, cmd: &Command, mask: u8, any_set: bool) -> VmResult<()> {
    let target = jump_target(cmd)?;
    // test bl, mask
    buf.u8(0xf6);
    buf.u8(crate::codegen::emit::encode_modrm(0b11, 0, RBX));
    buf.u8(mask);
    if any_set {
        // jnz rel32 (taken when any masked bit is set)
        buf.u8(0x0f);
        buf.u8(0x85);
    } else {
        // jz rel32 (taken when no masked bit is set)
        buf.u8(0x0f);
        buf.u8(0x84);
    }
    buf.rel32_fixup(target);
    Ok(())
}
