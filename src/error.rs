//! Crate-wide error taxonomy.
//!
//! Every phase of the pipeline has its own error enum; this module ties them
//! together into one [Error] so callers can `?` their way through the whole
//! pipeline. All errors render as human-readable strings with source-line
//! attribution where a source line exists.

use std::fmt;

use thiserror::Error;

use crate::arch::Arch;
use crate::assembler::AsmError;
use crate::format::BuildError;

/// A single parse-time message with its source position.
///
/// The parser accumulates these instead of aborting; a file that produced
/// any of them fails as a batch after parsing.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    /// 1-based source line.
    pub line: usize,
    /// 1-based column of the offending token.
    pub col: usize,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

/// The batch of diagnostics produced by a failed parse.
#[derive(Debug, Clone)]
pub struct ParseErrors {
    pub diagnostics: Vec<Diagnostic>,
}

impl fmt::Display for ParseErrors {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} parse error(s)", self.diagnostics.len())?;
        for d in &self.diagnostics {
            write!(f, "\n - {}", d)?;
        }
        Ok(())
    }
}

impl std::error::Error for ParseErrors {}

/// Errors produced while resolving relocations against the output image.
#[derive(Debug, Clone, Error)]
pub enum LinkError {
    #[error("undefined symbol: {0}")]
    UndefinedSymbol(String),

    #[error("relocation for {symbol} at file offset {offset:#x} is outside the image")]
    PatchOutOfBounds { symbol: String, offset: u64 },
}

/// Any failure of the assemble pipeline.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Parse(#[from] ParseErrors),

    #[error(transparent)]
    Assemble(#[from] AsmError),

    #[error(transparent)]
    Link(#[from] LinkError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error("unsupported architecture: {0}")]
    UnsupportedArch(Arch),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
