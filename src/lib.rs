//! A crate for assembling a NASM-like x86-64 dialect into runnable native
//! executables.
//!
//! The pipeline has five stages:
//! - Lex the source text into tokens ([syntax::token]).
//! - Parse the tokens into an AST of labels, directives, data declarations,
//!   instructions and macro/conditional blocks ([syntax::parser]).
//! - Encode each instruction into opcode bytes ([arch::x86_64]).
//! - Walk the AST collecting section bytes, symbols and relocation requests
//!   ([assembler]).
//! - Emit an executable container and patch the relocations against its
//!   layout ([format::elf], [format::pe]).
//!
//! Everything operates on in-memory buffers; opening the input file and
//! writing the output is the caller's job (see the `gasm` binary).
//!
//! # Example
//! ```
//! use gasm::{arch::Arch, format::Format};
//!
//! let source = r#"
//!     section .text
//! _start:
//!     mov rax, 60
//!     mov rdi, 0
//!     syscall
//! "#;
//!
//! let binary = gasm::assemble(source, Arch::X86_64, Format::Elf).unwrap();
//!
//! // A well-formed ELF executable with the entry point at 0x401000.
//! assert_eq!(&binary[..4], b"\x7fELF");
//! ```

pub mod arch;
pub mod assembler;
pub mod error;
pub mod format;
pub mod syntax;

pub use error::Error;

use arch::Arch;
use format::Format;

/// Assembles `source` for the given architecture and container format,
/// returning the executable image bytes.
///
/// This is the whole pipeline in one call. The individual stages are public
/// for callers that want the intermediate artifacts (for example the
/// [AssemblyResult](arch::AssemblyResult) with its symbol and relocation
/// tables).
pub fn assemble(source: &str, arch: Arch, fmt: Format) -> Result<Vec<u8>, Error> {
    let file = syntax::parser::parse_file(source)?;

    let encoder = match arch {
        Arch::X86_64 => arch::x86_64::Encoder::new(),
        other => return Err(Error::UnsupportedArch(other)),
    };

    let builder = format::builder_for(fmt);
    let assembler = assembler::Assembler::new(encoder, builder);

    let result = assembler.assemble(&file)?;
    let binary = assembler.link(&result)?;

    Ok(binary)
}
