//! Executable container formats.
//!
//! A [Builder] turns an assembly result into a loadable image and reports
//! the [Layout] its headers imply; the link pass patches relocations against
//! that layout, so every builder stays in charge of its own geometry.

use std::fmt;

use thiserror::Error;

use crate::arch::{Arch, Reloc, Section, Symbol};

pub mod elf;
pub mod pe;

/// A supported output container format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Elf,
    Pe,
}

impl Format {
    pub fn parse(s: &str) -> Option<Format> {
        match s {
            "elf" => Some(Format::Elf),
            "pe" | "exe" | "dll" => Some(Format::Pe),
            _ => None,
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Format::Elf => write!(f, "elf"),
            Format::Pe => write!(f, "pe"),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum BuildError {
    #[error("section {0} is too large for the image format")]
    SectionTooLarge(String),
}

/// Where the container put things: file offsets and virtual addresses for
/// the text and data payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub text_file_off: u64,
    pub text_vaddr: u64,
    pub data_file_off: u64,
    pub data_vaddr: u64,
}

/// A built container image. The payload areas may still be zeroed; the link
/// pass copies section bytes in and applies patches using `layout`.
#[derive(Debug, Clone)]
pub struct Image {
    pub bytes: Vec<u8>,
    pub layout: Layout,
}

/// Everything a builder needs from the assemble phase.
pub struct BuilderInput<'a> {
    pub sections: &'a [Section],
    pub symbols: &'a [Symbol],
    pub relocs: &'a [Reloc],
    pub arch: Arch,
    /// Bytes per machine word: 8 selects the 64-bit container variant.
    pub word_size: usize,
    /// Name of the entry symbol, normally `_start`.
    pub entry: &'a str,
}

impl BuilderInput<'_> {
    /// The `.text` payload.
    pub fn code(&self) -> &[u8] {
        self.sections
            .iter()
            .find(|s| s.name == ".text")
            .map(|s| s.data.as_slice())
            .unwrap_or(&[])
    }

    /// The `.data` payload.
    pub fn data(&self) -> Vec<u8> {
        self.sections
            .iter()
            .find(|s| s.name == ".data")
            .map(|s| s.data.clone())
            .unwrap_or_default()
    }

    /// Offset of the entry symbol within `.text`, or 0 when it is not
    /// defined.
    pub fn entry_offset(&self) -> u64 {
        self.symbols
            .iter()
            .find(|s| s.name == self.entry && s.section == ".text")
            .map(|s| s.offset)
            .unwrap_or(0)
    }
}

/// An executable container builder.
pub trait Builder {
    fn format(&self) -> Format;

    /// File extension the output should carry, or `""`.
    fn extension(&self) -> &'static str;

    fn build(&self, input: &BuilderInput) -> Result<Image, BuildError>;
}

impl<B: Builder + ?Sized> Builder for Box<B> {
    fn format(&self) -> Format {
        (**self).format()
    }

    fn extension(&self) -> &'static str {
        (**self).extension()
    }

    fn build(&self, input: &BuilderInput) -> Result<Image, BuildError> {
        (**self).build(input)
    }
}

/// The builder for a format.
pub fn builder_for(fmt: Format) -> Box<dyn Builder> {
    match fmt {
        Format::Elf => Box::new(elf::ElfBuilder::new()),
        Format::Pe => Box::new(pe::PeBuilder::new()),
    }
}

/// Rounds `n` up to a multiple of `alignment` (a power of two).
pub(crate) fn align_up(n: u64, alignment: u64) -> u64 {
    (n + alignment - 1) & !(alignment - 1)
}
