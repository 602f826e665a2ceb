//! The ELF executable builder.
//!
//! Emits a minimal statically-linked image: a 64-byte ELF64 header, one
//! 56-byte `PT_LOAD` program header mapping text and data as a single RWX
//! segment, zero padding up to the page-aligned text offset, and room for
//! the payload. No section header table.

use bytes::{BufMut, BytesMut};

use super::{BuildError, Builder, BuilderInput, Format, Image, Layout};
use crate::arch::Arch;

pub const PAGE_SIZE: u64 = 0x1000;
pub const BASE_VADDR: u64 = 0x400000;

const EH_SIZE: u16 = 64;
const PH_SIZE: u16 = 56;

/// `e_machine` value for an architecture.
fn machine(arch: Arch) -> u16 {
    match arch {
        Arch::X86 => 3,
        Arch::X86_64 => 0x3E,
        Arch::Arm => 40,
        Arch::Arm64 => 183,
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ElfBuilder;

impl ElfBuilder {
    pub fn new() -> ElfBuilder {
        ElfBuilder
    }
}

impl Builder for ElfBuilder {
    fn format(&self) -> Format {
        Format::Elf
    }

    fn extension(&self) -> &'static str {
        ""
    }

    fn build(&self, input: &BuilderInput) -> Result<Image, BuildError> {
        let code_len = input.code().len() as u64;
        let data_len = input.data().len() as u64;

        let text_file_off = PAGE_SIZE;
        let text_vaddr = BASE_VADDR + text_file_off;
        let payload = code_len + data_len;
        let entry = text_vaddr + input.entry_offset();

        let mut buf = BytesMut::with_capacity((text_file_off + payload) as usize);

        // e_ident
        buf.put_slice(b"\x7fELF");
        buf.put_u8(if input.word_size == 8 { 2 } else { 1 }); // EI_CLASS
        buf.put_u8(1); // EI_DATA: little-endian
        buf.put_u8(1); // EI_VERSION
        buf.put_slice(&[0; 9]);

        buf.put_u16_le(2); // e_type = ET_EXEC
        buf.put_u16_le(machine(input.arch));
        buf.put_u32_le(1); // e_version
        buf.put_u64_le(entry);
        buf.put_u64_le(EH_SIZE as u64); // e_phoff: right after the header
        buf.put_u64_le(0); // e_shoff: no section table
        buf.put_u32_le(0); // e_flags
        buf.put_u16_le(EH_SIZE);
        buf.put_u16_le(PH_SIZE);
        buf.put_u16_le(1); // e_phnum
        buf.put_u16_le(0); // e_shentsize
        buf.put_u16_le(0); // e_shnum
        buf.put_u16_le(0); // e_shstrndx

        // The single PT_LOAD segment covering text and data.
        buf.put_u32_le(1); // p_type = PT_LOAD
        buf.put_u32_le(7); // p_flags = R|W|X
        buf.put_u64_le(text_file_off);
        buf.put_u64_le(text_vaddr); // p_vaddr
        buf.put_u64_le(text_vaddr); // p_paddr
        buf.put_u64_le(payload); // p_filesz
        buf.put_u64_le(payload); // p_memsz
        buf.put_u64_le(PAGE_SIZE); // p_align

        buf.resize((text_file_off + payload) as usize, 0);

        Ok(Image {
            bytes: buf.to_vec(),
            layout: Layout {
                text_file_off,
                text_vaddr,
                data_file_off: text_file_off + code_len,
                data_vaddr: text_vaddr + code_len,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{Section, Symbol};

    fn input<'a>(sections: &'a [Section], symbols: &'a [Symbol]) -> BuilderInput<'a> {
        BuilderInput {
            sections,
            symbols,
            relocs: &[],
            arch: Arch::X86_64,
            word_size: 8,
            entry: "_start",
        }
    }

    fn text_and_data(code: Vec<u8>, data: Vec<u8>) -> Vec<Section> {
        vec![
            Section {
                name: ".text".to_string(),
                data: code,
            },
            Section {
                name: ".data".to_string(),
                data,
            },
        ]
    }

    fn u16_at(buf: &[u8], off: usize) -> u16 {
        u16::from_le_bytes(buf[off..off + 2].try_into().unwrap())
    }

    fn u64_at(buf: &[u8], off: usize) -> u64 {
        u64::from_le_bytes(buf[off..off + 8].try_into().unwrap())
    }

    #[test]
    fn header_shape() {
        let sections = text_and_data(vec![0x90; 4], vec![1, 2]);
        let image = ElfBuilder::new().build(&input(&sections, &[])).unwrap();
        let buf = &image.bytes;

        assert_eq!(&buf[..4], b"\x7fELF");
        assert_eq!(buf[4], 2); // ELFCLASS64
        assert_eq!(buf[5], 1); // little-endian
        assert_eq!(u16_at(buf, 16), 2); // ET_EXEC
        assert_eq!(u16_at(buf, 18), 0x3E); // EM_X86_64
        assert_eq!(u64_at(buf, 24), 0x401000); // entry
        assert_eq!(u64_at(buf, 32), 64); // e_phoff
        assert_eq!(u16_at(buf, 54), 56); // e_phentsize
        assert_eq!(u16_at(buf, 56), 1); // e_phnum

        assert_eq!(buf.len(), 0x1000 + 6);
    }

    #[test]
    fn program_header_maps_one_rwx_segment() {
        let sections = text_and_data(vec![0x90; 4], vec![1, 2]);
        let image = ElfBuilder::new().build(&input(&sections, &[])).unwrap();
        let buf = &image.bytes;

        let ph = 64;
        assert_eq!(u16_at(buf, ph), 1); // PT_LOAD (low half)
        assert_eq!(buf[ph + 4], 7); // R|W|X
        assert_eq!(u64_at(buf, ph + 8), 0x1000); // p_offset
        assert_eq!(u64_at(buf, ph + 16), 0x401000); // p_vaddr
        assert_eq!(u64_at(buf, ph + 24), 0x401000); // p_paddr
        assert_eq!(u64_at(buf, ph + 32), 6); // p_filesz
        assert_eq!(u64_at(buf, ph + 40), 6); // p_memsz
        assert_eq!(u64_at(buf, ph + 48), 0x1000); // p_align
    }

    #[test]
    fn entry_honors_start_symbol() {
        let sections = text_and_data(vec![0x90; 8], vec![]);
        let symbols = vec![Symbol {
            name: "_start".to_string(),
            section: ".text".to_string(),
            offset: 4,
        }];

        let image = ElfBuilder::new().build(&input(&sections, &symbols)).unwrap();

        assert_eq!(u64_at(&image.bytes, 24), 0x401004);
    }

    #[test]
    fn machine_ids() {
        assert_eq!(machine(Arch::X86), 3);
        assert_eq!(machine(Arch::X86_64), 0x3E);
        assert_eq!(machine(Arch::Arm), 40);
        assert_eq!(machine(Arch::Arm64), 183);
    }

    #[test]
    fn layout_places_data_after_text() {
        let sections = text_and_data(vec![0; 10], vec![0; 3]);
        let image = ElfBuilder::new().build(&input(&sections, &[])).unwrap();

        assert_eq!(
            image.layout,
            Layout {
                text_file_off: 0x1000,
                text_vaddr: 0x401000,
                data_file_off: 0x1000 + 10,
                data_vaddr: 0x401000 + 10,
            }
        );
    }

    #[test]
    fn empty_file_is_headers_only() {
        let sections = text_and_data(vec![], vec![]);
        let image = ElfBuilder::new().build(&input(&sections, &[])).unwrap();

        assert_eq!(image.bytes.len(), 0x1000);
        assert_eq!(u64_at(&image.bytes, 24), 0x401000);
    }
}
