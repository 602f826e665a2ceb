//! The assembler driver: walks the AST in order, maintaining a current
//! section cursor and two growing byte buffers, collecting symbols and
//! relocation requests along the way. The companion link pass hands the
//! result to a container [Builder](crate::format::Builder) and patches the
//! recorded relocations against the layout the container reports.

use std::collections::HashSet;

use thiserror::Error;

use crate::arch::{AssemblyResult, EncodeError, Encoder, Reloc, RelocKind, Section, Symbol};
use crate::error::LinkError;
use crate::format::{Builder, BuilderInput};
use crate::syntax::ast::{DataItem, File, Item, Operand};

const TEXT: &str = ".text";
const DATA: &str = ".data";

/// Errors from the assemble phase, attributed to the offending item's
/// source line.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AsmError {
    #[error("line {line}: duplicate label: {name}")]
    DuplicateLabel { name: String, line: usize },

    #[error("line {line}: {source}")]
    Encode { line: usize, source: EncodeError },

    #[error("line {line}: {message}")]
    Data { line: usize, message: String },

    #[error("relocation for {name} overruns section {section}")]
    RelocOutOfBounds { name: String, section: String },
}

/// The current output section. Symbols and relocations refer to sections by
/// name; this is just the cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cursor {
    Text,
    Data,
}

impl Cursor {
    fn name(self) -> &'static str {
        match self {
            Cursor::Text => TEXT,
            Cursor::Data => DATA,
        }
    }
}

pub struct Assembler<E, B> {
    encoder: E,
    builder: B,
}

impl<E: Encoder, B: Builder> Assembler<E, B> {
    pub fn new(encoder: E, builder: B) -> Assembler<E, B> {
        Assembler { encoder, builder }
    }

    /// Walks the file's items and produces section bytes, the symbol table
    /// and the relocation list. Nothing is resolved yet; that is the link
    /// pass's job.
    pub fn assemble(&self, file: &File) -> Result<AssemblyResult, AsmError> {
        let mut code: Vec<u8> = Vec::new();
        let mut data: Vec<u8> = Vec::new();

        let mut symbols: Vec<Symbol> = Vec::new();
        let mut defined: HashSet<String> = HashSet::new();
        let mut relocs: Vec<Reloc> = Vec::new();

        let mut cursor = Cursor::Text;

        for item in &file.items {
            match item {
                Item::Label { name, line, .. } => {
                    if !defined.insert(name.clone()) {
                        return Err(AsmError::DuplicateLabel {
                            name: name.clone(),
                            line: *line,
                        });
                    }

                    let offset = match cursor {
                        Cursor::Text => code.len() as u64,
                        Cursor::Data => data.len() as u64,
                    };

                    symbols.push(Symbol {
                        name: name.clone(),
                        section: cursor.name().to_string(),
                        offset,
                    });
                }

                Item::Directive { name, args, .. } => match name.as_str() {
                    ".text" => cursor = Cursor::Text,
                    ".data" => cursor = Cursor::Data,
                    _ => match args.first().map(String::as_str) {
                        Some(".text") | Some("text") => cursor = Cursor::Text,
                        Some(".data") | Some("data") => cursor = Cursor::Data,
                        _ => {}
                    },
                },

                Item::Data(decl) => {
                    cursor = Cursor::Data;

                    for data_item in &decl.items {
                        match data_item {
                            DataItem::Str(s) => data.extend_from_slice(s.as_bytes()),

                            DataItem::Expr(expr) if decl.kind.reserves() => {
                                let count = expr.eval().map_err(|e| AsmError::Data {
                                    line: decl.line,
                                    message: format!("reserve count: {}", e),
                                })?;

                                if count < 0 {
                                    return Err(AsmError::Data {
                                        line: decl.line,
                                        message: format!(
                                            "reserve count must not be negative, got {}",
                                            count
                                        ),
                                    });
                                }

                                let total = count as usize * decl.kind.unit();
                                data.resize(data.len() + total, 0);
                            }

                            DataItem::Expr(expr) => {
                                if let Some((name, addend)) = expr.symbol_ref() {
                                    relocs.push(Reloc {
                                        section: DATA.to_string(),
                                        offset: data.len() as u64,
                                        size: 8,
                                        name: name.to_string(),
                                        addend,
                                        kind: RelocKind::Abs64,
                                    });
                                    data.extend_from_slice(&[0; 8]);
                                    continue;
                                }

                                let value = expr.eval().map_err(|e| AsmError::Data {
                                    line: decl.line,
                                    message: format!("data expression: {}", e),
                                })?;

                                match decl.kind.unit() {
                                    1 => data.push(value as u8),
                                    2 => data.extend_from_slice(&(value as u16).to_le_bytes()),
                                    4 => data.extend_from_slice(&(value as u32).to_le_bytes()),
                                    _ => data.extend_from_slice(&(value as u64).to_le_bytes()),
                                }
                            }
                        }
                    }
                }

                Item::Instruction(ins) => {
                    if cursor != Cursor::Text {
                        continue;
                    }

                    let bytes =
                        self.encoder
                            .encode_instruction(ins)
                            .map_err(|source| AsmError::Encode {
                                line: ins.line,
                                source,
                            })?;

                    let mn = ins.mnemonic.to_lowercase();

                    for op in &ins.operands {
                        match op {
                            Operand::Label(name) => {
                                if mn == "jmp" || mn == "call" || mn.starts_with('j') {
                                    // Patch site follows the opcode: one byte
                                    // for jmp/call, two for the 0F 8x
                                    // conditional forms.
                                    let opcode_len = if mn == "jmp" || mn == "call" { 1 } else { 2 };
                                    relocs.push(Reloc {
                                        section: TEXT.to_string(),
                                        offset: code.len() as u64 + opcode_len,
                                        size: 4,
                                        name: name.clone(),
                                        addend: 0,
                                        kind: RelocKind::Rel32,
                                    });
                                } else if mn == "mov" {
                                    // REX + opcode precede the imm64.
                                    relocs.push(Reloc {
                                        section: TEXT.to_string(),
                                        offset: code.len() as u64 + 2,
                                        size: 8,
                                        name: name.clone(),
                                        addend: 0,
                                        kind: RelocKind::Abs64,
                                    });
                                }
                            }

                            Operand::Imm(expr) => {
                                if let Some((name, addend)) = expr.symbol_ref() {
                                    relocs.push(Reloc {
                                        section: TEXT.to_string(),
                                        offset: code.len() as u64 + 2,
                                        size: 8,
                                        name: name.to_string(),
                                        addend,
                                        kind: RelocKind::Abs64,
                                    });
                                }
                            }

                            _ => {}
                        }
                    }

                    code.extend_from_slice(&bytes);
                }

                // Parsed for structure only; expansion and evaluation are a
                // future pre-pass.
                Item::Macro(_) | Item::If(_) => {}
            }
        }

        for r in &relocs {
            let limit = if r.section == TEXT {
                code.len()
            } else {
                data.len()
            } as u64;

            if r.offset + r.size as u64 > limit {
                return Err(AsmError::RelocOutOfBounds {
                    name: r.name.clone(),
                    section: r.section.clone(),
                });
            }
        }

        let sections = vec![
            Section {
                name: TEXT.to_string(),
                data: code.clone(),
            },
            Section {
                name: DATA.to_string(),
                data: data.clone(),
            },
        ];

        Ok(AssemblyResult {
            code,
            data,
            symbols,
            relocs,
            sections,
        })
    }

    /// Builds the container image and resolves every relocation against the
    /// layout it reports. Section payloads are copied in before patching so
    /// patches land on top of the real bytes.
    pub fn link(&self, result: &AssemblyResult) -> Result<Vec<u8>, crate::Error> {
        let input = BuilderInput {
            sections: &result.sections,
            symbols: &result.symbols,
            relocs: &result.relocs,
            arch: self.encoder.arch(),
            word_size: self.encoder.word_size(),
            entry: "_start",
        };

        let image = self.builder.build(&input)?;
        let layout = image.layout;
        let mut bytes = image.bytes;

        let code_end = layout.text_file_off as usize + result.code.len();
        let data_end = layout.data_file_off as usize + result.data.len();
        let needed = code_end.max(data_end);
        if bytes.len() < needed {
            bytes.resize(needed, 0);
        }

        bytes[layout.text_file_off as usize..code_end].copy_from_slice(&result.code);
        bytes[layout.data_file_off as usize..data_end].copy_from_slice(&result.data);

        for r in &result.relocs {
            let sym = result
                .symbol(&r.name)
                .ok_or_else(|| LinkError::UndefinedSymbol(r.name.clone()))?;

            let target = if sym.section == TEXT {
                layout.text_vaddr + sym.offset
            } else {
                layout.data_vaddr + sym.offset
            };
            let adjusted = (target as i64).wrapping_add(r.addend) as u64;

            let base = if r.section == TEXT {
                layout.text_file_off
            } else {
                layout.data_file_off
            };
            let off = (base + r.offset) as usize;

            if off + r.size as usize > bytes.len() {
                return Err(LinkError::PatchOutOfBounds {
                    symbol: r.name.clone(),
                    offset: off as u64,
                }
                .into());
            }

            match r.kind {
                RelocKind::Abs64 => {
                    bytes[off..off + 8].copy_from_slice(&adjusted.to_le_bytes());
                }
                RelocKind::Abs32 => {
                    bytes[off..off + 4].copy_from_slice(&(adjusted as u32).to_le_bytes());
                }
                RelocKind::Rel32 => {
                    let rel = target as i64 - layout.text_vaddr as i64 - r.offset as i64 - 4
                        + r.addend;
                    bytes[off..off + 4].copy_from_slice(&(rel as i32).to_le_bytes());
                }
            }
        }

        Ok(bytes)
    }
}
