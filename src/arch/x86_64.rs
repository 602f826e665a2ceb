//! The x86-64 instruction encoder.
//!
//! Turns one [Instruction] into its opcode byte sequence: REX prefix where
//! the operation needs one, opcode, ModR/M, immediate. Instructions that
//! reference a label or a symbolic immediate are emitted with zeroed
//! placeholder bytes at the patch site; the assembler driver records the
//! matching relocation.
//!
//! Only the qword forms of the supported mnemonics are encoded; REX.W is
//! always set where a REX prefix is emitted.

use bytes::{BufMut, BytesMut};

use crate::arch::{self, Arch, EncodeError};
use crate::syntax::ast::{Expr, Instruction, Operand};

/// The 4-bit register number for any width alias of a general-purpose
/// register. Numbers 8..15 need a REX extension bit.
fn register_number(name: &str) -> Option<u8> {
    let lower = name.to_lowercase();

    match lower.as_str() {
        "rax" | "eax" | "ax" | "al" | "ah" => Some(0),
        "rcx" | "ecx" | "cx" | "cl" | "ch" => Some(1),
        "rdx" | "edx" | "dx" | "dl" | "dh" => Some(2),
        "rbx" | "ebx" | "bx" | "bl" | "bh" => Some(3),
        "rsp" | "esp" | "sp" | "spl" => Some(4),
        "rbp" | "ebp" | "bp" | "bpl" => Some(5),
        "rsi" | "esi" | "si" | "sil" => Some(6),
        "rdi" | "edi" | "di" | "dil" => Some(7),
        "r8" | "r8d" | "r8w" | "r8b" => Some(8),
        "r9" | "r9d" | "r9w" | "r9b" => Some(9),
        "r10" | "r10d" | "r10w" | "r10b" => Some(10),
        "r11" | "r11d" | "r11w" | "r11b" => Some(11),
        "r12" | "r12d" | "r12w" | "r12b" => Some(12),
        "r13" | "r13d" | "r13w" | "r13b" => Some(13),
        "r14" | "r14d" | "r14w" | "r14b" => Some(14),
        "r15" | "r15d" | "r15w" | "r15b" => Some(15),
        _ => None,
    }
}

/// Full REX byte: `0x40 | W | R | B`, with `R`/`B` from the high bits of the
/// reg and r/m fields.
fn write_rex(buf: &mut BytesMut, reg_field: u8, rm_field: u8, w: bool) {
    let mut rex: u8 = 0x40;
    if w {
        rex |= 0x08;
    }
    if reg_field >= 8 {
        rex |= 0x04;
    }
    if rm_field >= 8 {
        rex |= 0x01;
    }
    buf.put_u8(rex);
}

/// Simplified REX for encoding schemes that never need the `.R` extension:
/// always `0x48`, with `B` set when any participating register is 8..15.
fn write_rex_wb(buf: &mut BytesMut, regs: &[u8]) {
    let mut rex: u8 = 0x48;
    if regs.iter().any(|&r| r >= 8) {
        rex |= 0x01;
    }
    buf.put_u8(rex);
}

fn write_modrm(buf: &mut BytesMut, reg_field: u8, rm_field: u8, base: u8) {
    buf.put_u8(base | ((reg_field & 7) << 3) | (rm_field & 7));
}

fn reg_id(name: &str) -> Result<u8, EncodeError> {
    register_number(name).ok_or_else(|| EncodeError::UnknownRegister(name.to_string()))
}

/// The x86-64 encoder. Stateless; encoding is a pure function of the
/// instruction node.
#[derive(Debug, Clone, Copy, Default)]
pub struct Encoder;

impl Encoder {
    pub fn new() -> Encoder {
        Encoder
    }
}

impl arch::Encoder for Encoder {
    fn arch(&self) -> Arch {
        Arch::X86_64
    }

    fn word_size(&self) -> usize {
        8
    }

    fn encode_instruction(&self, ins: &Instruction) -> Result<Vec<u8>, EncodeError> {
        let mut buf = BytesMut::new();
        let mn = ins.mnemonic.to_lowercase();

        match mn.as_str() {
            "mov" => encode_mov(&mut buf, ins)?,
            "xor" => encode_xor(&mut buf, ins)?,
            "add" => encode_arith(&mut buf, ins, 0x03, 0)?,
            "sub" => encode_arith(&mut buf, ins, 0x2B, 5)?,
            "cmp" => encode_arith(&mut buf, ins, 0x3B, 7)?,
            "inc" => encode_unary_ff(&mut buf, ins, 0)?,
            "dec" => encode_unary_ff(&mut buf, ins, 1)?,
            "jmp" => encode_branch(&mut buf, ins, &[0xE9])?,
            "je" | "jz" => encode_branch(&mut buf, ins, &[0x0F, 0x84])?,
            "jne" | "jnz" => encode_branch(&mut buf, ins, &[0x0F, 0x85])?,
            "jg" => encode_branch(&mut buf, ins, &[0x0F, 0x8F])?,
            "jl" => encode_branch(&mut buf, ins, &[0x0F, 0x8C])?,
            "jge" => encode_branch(&mut buf, ins, &[0x0F, 0x8D])?,
            "jle" => encode_branch(&mut buf, ins, &[0x0F, 0x8E])?,
            "ja" => encode_branch(&mut buf, ins, &[0x0F, 0x87])?,
            "jb" => encode_branch(&mut buf, ins, &[0x0F, 0x82])?,
            "call" => encode_branch(&mut buf, ins, &[0xE8])?,
            "push" => encode_push_pop(&mut buf, ins, 0x50)?,
            "pop" => encode_push_pop(&mut buf, ins, 0x58)?,
            "ret" => buf.put_u8(0xC3),
            "syscall" => buf.put_slice(&[0x0F, 0x05]),
            "nop" => buf.put_u8(0x90),
            "int" => encode_int(&mut buf, ins)?,
            "lea" => return Err(EncodeError::Unimplemented("lea")),
            "test" => return Err(EncodeError::Unimplemented("test")),
            _ => return Err(EncodeError::UnknownMnemonic(ins.mnemonic.clone())),
        }

        Ok(buf.to_vec())
    }
}

fn encode_mov(buf: &mut BytesMut, ins: &Instruction) -> Result<(), EncodeError> {
    if ins.operands.len() != 2 {
        return Err(EncodeError::OperandCount {
            mnemonic: "mov".to_string(),
            expected: 2,
        });
    }

    let dst = &ins.operands[0];
    let src = &ins.operands[1];

    if let Operand::Reg(rd) = dst {
        let dst_id = reg_id(rd)?;

        return match src {
            Operand::Imm(expr) => encode_mov_reg_imm(buf, dst_id, expr),
            Operand::Reg(rs) => {
                let src_id = reg_id(rs)?;
                write_rex(buf, src_id, dst_id, true);
                buf.put_u8(0x89);
                write_modrm(buf, src_id, dst_id, 0xC0);
                Ok(())
            }
            Operand::Mem(_) => {
                // Displacement is not encoded yet; see the memory-operand
                // note on MemOperand.
                write_rex(buf, dst_id, 0, true);
                buf.put_u8(0x8B);
                write_modrm(buf, dst_id, 0, 0x00);
                Ok(())
            }
            Operand::Label(_) => {
                write_rex_wb(buf, &[dst_id]);
                buf.put_u8(0xB8 | (dst_id & 7));
                buf.put_slice(&[0; 8]);
                Ok(())
            }
            Operand::Str(_) => Err(EncodeError::BadOperand {
                mnemonic: "mov".to_string(),
                role: "src",
                expected: "a register, immediate, memory or label operand",
            }),
        };
    }

    if let Operand::Mem(_) = dst {
        return match src {
            Operand::Reg(rs) => {
                let src_id = reg_id(rs)?;
                write_rex(buf, src_id, 0, true);
                buf.put_u8(0x89);
                write_modrm(buf, src_id, 0, 0x00);
                Ok(())
            }
            Operand::Imm(_) => Err(EncodeError::Unimplemented("mov mem, imm")),
            _ => Err(EncodeError::BadOperand {
                mnemonic: "mov".to_string(),
                role: "src",
                expected: "a register or immediate",
            }),
        };
    }

    Err(EncodeError::BadOperand {
        mnemonic: "mov".to_string(),
        role: "dst",
        expected: "a register or memory operand",
    })
}

fn encode_mov_reg_imm(buf: &mut BytesMut, dst_id: u8, expr: &Expr) -> Result<(), EncodeError> {
    // Symbolic immediates get a zeroed imm64; the driver records an abs64
    // relocation at the immediate's offset.
    if expr.symbol_ref().is_some() {
        write_rex(buf, 0, dst_id, true);
        buf.put_u8(0xB8 | (dst_id & 7));
        buf.put_slice(&[0; 8]);
        return Ok(());
    }

    let value = expr.eval().map_err(|_| EncodeError::NonConstantImmediate {
        mnemonic: "mov".to_string(),
    })?;

    write_rex(buf, 0, dst_id, true);
    buf.put_u8(0xB8 | (dst_id & 7));
    buf.put_u64_le(value as u64);
    Ok(())
}

fn encode_xor(buf: &mut BytesMut, ins: &Instruction) -> Result<(), EncodeError> {
    if ins.operands.len() != 2 {
        return Err(EncodeError::OperandCount {
            mnemonic: "xor".to_string(),
            expected: 2,
        });
    }

    let dst = match &ins.operands[0] {
        Operand::Reg(name) => reg_id(name)?,
        _ => {
            return Err(EncodeError::BadOperand {
                mnemonic: "xor".to_string(),
                role: "dst",
                expected: "a register",
            })
        }
    };
    let src = match &ins.operands[1] {
        Operand::Reg(name) => reg_id(name)?,
        _ => {
            return Err(EncodeError::BadOperand {
                mnemonic: "xor".to_string(),
                role: "src",
                expected: "a register",
            })
        }
    };

    write_rex_wb(buf, &[dst, src]);
    buf.put_u8(0x31);
    write_modrm(buf, src, dst, 0xC0);
    Ok(())
}

/// Shared encoding for add/sub/cmp: `op_rr /r` for register sources,
/// `83 /ext ib` for immediates in signed 8-bit range, `81 /ext id`
/// otherwise.
fn encode_arith(
    buf: &mut BytesMut,
    ins: &Instruction,
    op_rr: u8,
    ext: u8,
) -> Result<(), EncodeError> {
    let mn = ins.mnemonic.to_lowercase();

    if ins.operands.len() != 2 {
        return Err(EncodeError::OperandCount {
            mnemonic: mn,
            expected: 2,
        });
    }

    let dst = match &ins.operands[0] {
        Operand::Reg(name) => reg_id(name)?,
        _ => {
            return Err(EncodeError::BadOperand {
                mnemonic: mn,
                role: "dst",
                expected: "a register",
            })
        }
    };

    match &ins.operands[1] {
        Operand::Reg(name) => {
            let src = reg_id(name)?;
            write_rex(buf, dst, src, true);
            buf.put_u8(op_rr);
            write_modrm(buf, dst, src, 0xC0);
            Ok(())
        }
        Operand::Imm(expr) => {
            let value = expr
                .eval()
                .map_err(|_| EncodeError::NonConstantImmediate {
                    mnemonic: mn.clone(),
                })?;

            if (-128..=127).contains(&value) {
                write_rex(buf, ext, dst, true);
                buf.put_u8(0x83);
                write_modrm(buf, ext, dst, 0xC0);
                buf.put_u8(value as u8);
            } else if i32::try_from(value).is_ok() {
                write_rex(buf, ext, dst, true);
                buf.put_u8(0x81);
                write_modrm(buf, ext, dst, 0xC0);
                buf.put_i32_le(value as i32);
            } else {
                return Err(EncodeError::ImmediateOutOfRange {
                    mnemonic: mn,
                    value,
                });
            }
            Ok(())
        }
        _ => Err(EncodeError::BadOperand {
            mnemonic: mn,
            role: "src",
            expected: "a register or immediate",
        }),
    }
}

/// `FF /ext` register forms (inc, dec).
fn encode_unary_ff(buf: &mut BytesMut, ins: &Instruction, ext: u8) -> Result<(), EncodeError> {
    let mn = ins.mnemonic.to_lowercase();

    if ins.operands.len() != 1 {
        return Err(EncodeError::OperandCount {
            mnemonic: mn,
            expected: 1,
        });
    }

    let reg = match &ins.operands[0] {
        Operand::Reg(name) => reg_id(name)?,
        _ => {
            return Err(EncodeError::BadOperand {
                mnemonic: mn,
                role: "operand",
                expected: "a register",
            })
        }
    };

    write_rex(buf, ext, reg, true);
    buf.put_u8(0xFF);
    write_modrm(buf, ext, reg, 0xC0);
    Ok(())
}

/// `jmp`/`call`/`jcc` to a label: opcode bytes followed by a zeroed rel32
/// the driver records a relocation for.
fn encode_branch(buf: &mut BytesMut, ins: &Instruction, opcode: &[u8]) -> Result<(), EncodeError> {
    let mn = ins.mnemonic.to_lowercase();

    if ins.operands.len() != 1 {
        return Err(EncodeError::OperandCount {
            mnemonic: mn,
            expected: 1,
        });
    }

    if !matches!(&ins.operands[0], Operand::Label(_)) {
        return Err(EncodeError::BadOperand {
            mnemonic: mn,
            role: "operand",
            expected: "a label",
        });
    }

    buf.put_slice(opcode);
    buf.put_slice(&[0; 4]);
    Ok(())
}

/// `50+rd`/`58+rd` with an `0x41` REX.B prefix for the extended registers.
fn encode_push_pop(buf: &mut BytesMut, ins: &Instruction, base: u8) -> Result<(), EncodeError> {
    let mn = ins.mnemonic.to_lowercase();

    if ins.operands.len() != 1 {
        return Err(EncodeError::OperandCount {
            mnemonic: mn,
            expected: 1,
        });
    }

    let reg = match &ins.operands[0] {
        Operand::Reg(name) => reg_id(name)?,
        _ => {
            return Err(EncodeError::BadOperand {
                mnemonic: mn,
                role: "operand",
                expected: "a register",
            })
        }
    };

    if reg >= 8 {
        buf.put_u8(0x41);
    }
    buf.put_u8(base | (reg & 7));
    Ok(())
}

fn encode_int(buf: &mut BytesMut, ins: &Instruction) -> Result<(), EncodeError> {
    if ins.operands.len() != 1 {
        return Err(EncodeError::OperandCount {
            mnemonic: "int".to_string(),
            expected: 1,
        });
    }

    let expr = match &ins.operands[0] {
        Operand::Imm(expr) => expr,
        _ => {
            return Err(EncodeError::BadOperand {
                mnemonic: "int".to_string(),
                role: "operand",
                expected: "an immediate",
            })
        }
    };

    let value = expr.eval().map_err(|_| EncodeError::NonConstantImmediate {
        mnemonic: "int".to_string(),
    })?;

    buf.put_u8(0xCD);
    buf.put_u8(value as u8);
    Ok(())
}
