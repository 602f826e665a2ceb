//! The PE executable builder.
//!
//! Emits a DOS stub, the `PE\0\0` signature, a COFF header, a PE32+ (or
//! PE32 for 32-bit word sizes) optional header and one section header per
//! non-empty section. Sections are placed on file-alignment boundaries with
//! section-aligned RVAs.

use bytes::{BufMut, BytesMut};

use super::{align_up, BuildError, Builder, BuilderInput, Format, Image, Layout};
use crate::arch::Arch;

pub const IMAGE_BASE: u64 = 0x10000000;
pub const SECTION_ALIGN: u64 = 0x1000;
pub const FILE_ALIGN: u64 = 0x200;

const COFF_SIZE: u64 = 20;
const OPT_SIZE_64: u16 = 240;
const OPT_SIZE_32: u16 = 224;
const SECTION_HEADER_SIZE: u64 = 40;

const TEXT_CHARACTERISTICS: u32 = 0x6000_0020; // code | execute | read
const DATA_CHARACTERISTICS: u32 = 0xC000_0040; // initialized | read | write

#[derive(Debug, Clone, Copy, Default)]
pub struct PeBuilder;

impl PeBuilder {
    pub fn new() -> PeBuilder {
        PeBuilder
    }
}

impl Builder for PeBuilder {
    fn format(&self) -> Format {
        Format::Pe
    }

    fn extension(&self) -> &'static str {
        ".exe"
    }

    fn build(&self, input: &BuilderInput) -> Result<Image, BuildError> {
        let code = input.code();
        let data = input.data();

        if code.len() > u32::MAX as usize {
            return Err(BuildError::SectionTooLarge(".text".to_string()));
        }
        if data.len() > u32::MAX as usize {
            return Err(BuildError::SectionTooLarge(".data".to_string()));
        }

        let is64 = input.word_size == 8;
        let opt_size = if is64 { OPT_SIZE_64 } else { OPT_SIZE_32 };
        let nsections: u16 = if data.is_empty() { 1 } else { 2 };

        let headers_end = 64 + 4 + COFF_SIZE + opt_size as u64
            + nsections as u64 * SECTION_HEADER_SIZE;
        let size_of_headers = align_up(headers_end, FILE_ALIGN);

        let text_off = size_of_headers;
        let text_rva = SECTION_ALIGN;
        let code_raw = align_up(code.len() as u64, FILE_ALIGN);

        let data_off = text_off + code_raw;
        let data_rva = text_rva + align_up((code.len() as u64).max(1), SECTION_ALIGN);
        let data_raw = align_up(data.len() as u64, FILE_ALIGN);

        let file_size = data_off + data_raw;
        let size_of_image = if data.is_empty() {
            data_rva
        } else {
            data_rva + align_up(data.len() as u64, SECTION_ALIGN)
        };

        let entry_rva = text_rva + input.entry_offset();

        let machine: u16 = if input.arch == Arch::X86 || !is64 {
            0x014C
        } else {
            0x8664
        };

        let mut buf = BytesMut::with_capacity(file_size as usize);

        // DOS stub: just the magic and e_lfanew.
        buf.put_slice(b"MZ");
        buf.put_slice(&[0; 58]);
        buf.put_u32_le(64);

        buf.put_slice(b"PE\0\0");

        // COFF header
        buf.put_u16_le(machine);
        buf.put_u16_le(nsections);
        buf.put_u32_le(0); // TimeDateStamp
        buf.put_u32_le(0); // PointerToSymbolTable
        buf.put_u32_le(0); // NumberOfSymbols
        buf.put_u16_le(opt_size);
        buf.put_u16_le(if is64 { 0x22 } else { 0x103 });

        if is64 {
            write_opt_header_64(
                &mut buf,
                code_raw as u32,
                data_raw as u32,
                entry_rva as u32,
                text_rva as u32,
                size_of_image as u32,
                size_of_headers as u32,
            );
        } else {
            write_opt_header_32(
                &mut buf,
                code_raw as u32,
                data_raw as u32,
                entry_rva as u32,
                text_rva as u32,
                data_rva as u32,
                size_of_image as u32,
                size_of_headers as u32,
            );
        }

        write_section_header(
            &mut buf,
            b".text\0\0\0",
            code.len() as u32,
            text_rva as u32,
            code_raw as u32,
            text_off as u32,
            TEXT_CHARACTERISTICS,
        );
        if !data.is_empty() {
            write_section_header(
                &mut buf,
                b".data\0\0\0",
                data.len() as u32,
                data_rva as u32,
                data_raw as u32,
                data_off as u32,
                DATA_CHARACTERISTICS,
            );
        }

        buf.resize(text_off as usize, 0);
        buf.put_slice(code);
        buf.resize(data_off as usize, 0);
        buf.put_slice(&data);
        buf.resize(file_size as usize, 0);

        Ok(Image {
            bytes: buf.to_vec(),
            layout: Layout {
                text_file_off: text_off,
                text_vaddr: IMAGE_BASE + text_rva,
                data_file_off: data_off,
                data_vaddr: IMAGE_BASE + data_rva,
            },
        })
    }
}

fn write_opt_header_64(
    buf: &mut BytesMut,
    size_of_code: u32,
    size_of_data: u32,
    entry_rva: u32,
    base_of_code: u32,
    size_of_image: u32,
    size_of_headers: u32,
) {
    buf.put_u16_le(0x20B); // PE32+
    buf.put_u8(14); // linker major
    buf.put_u8(0); // linker minor
    buf.put_u32_le(size_of_code);
    buf.put_u32_le(size_of_data);
    buf.put_u32_le(0); // SizeOfUninitializedData
    buf.put_u32_le(entry_rva);
    buf.put_u32_le(base_of_code);
    buf.put_u64_le(IMAGE_BASE);
    buf.put_u32_le(SECTION_ALIGN as u32);
    buf.put_u32_le(FILE_ALIGN as u32);
    buf.put_u16_le(6); // OS major
    buf.put_u16_le(0);
    buf.put_u16_le(0); // image version
    buf.put_u16_le(0);
    buf.put_u16_le(6); // subsystem version
    buf.put_u16_le(0);
    buf.put_u32_le(0); // Win32VersionValue
    buf.put_u32_le(size_of_image);
    buf.put_u32_le(size_of_headers);
    buf.put_u32_le(0); // CheckSum
    buf.put_u16_le(3); // subsystem: console
    buf.put_u16_le(0); // DllCharacteristics
    buf.put_u64_le(0x200000); // SizeOfStackReserve
    buf.put_u64_le(0x1000); // SizeOfStackCommit
    buf.put_u64_le(0x100000); // SizeOfHeapReserve
    buf.put_u64_le(0x1000); // SizeOfHeapCommit
    buf.put_u32_le(0); // LoaderFlags
    buf.put_u32_le(16); // NumberOfRvaAndSizes
    buf.put_slice(&[0; 128]); // data directories
}

#[allow(clippy::too_many_arguments)]
fn write_opt_header_32(
    buf: &mut BytesMut,
    size_of_code: u32,
    size_of_data: u32,
    entry_rva: u32,
    base_of_code: u32,
    base_of_data: u32,
    size_of_image: u32,
    size_of_headers: u32,
) {
    buf.put_u16_le(0x10B); // PE32
    buf.put_u8(14);
    buf.put_u8(0);
    buf.put_u32_le(size_of_code);
    buf.put_u32_le(size_of_data);
    buf.put_u32_le(0);
    buf.put_u32_le(entry_rva);
    buf.put_u32_le(base_of_code);
    buf.put_u32_le(base_of_data);
    buf.put_u32_le(IMAGE_BASE as u32);
    buf.put_u32_le(SECTION_ALIGN as u32);
    buf.put_u32_le(FILE_ALIGN as u32);
    buf.put_u16_le(6);
    buf.put_u16_le(0);
    buf.put_u16_le(0);
    buf.put_u16_le(0);
    buf.put_u16_le(6);
    buf.put_u16_le(0);
    buf.put_u32_le(0);
    buf.put_u32_le(size_of_image);
    buf.put_u32_le(size_of_headers);
    buf.put_u32_le(0);
    buf.put_u16_le(3);
    buf.put_u16_le(0);
    buf.put_u32_le(0x200000);
    buf.put_u32_le(0x1000);
    buf.put_u32_le(0x100000);
    buf.put_u32_le(0x1000);
    buf.put_u32_le(0);
    buf.put_u32_le(16);
    buf.put_slice(&[0; 128]);
}

fn write_section_header(
    buf: &mut BytesMut,
    name: &[u8; 8],
    virtual_size: u32,
    rva: u32,
    raw_size: u32,
    raw_off: u32,
    characteristics: u32,
) {
    buf.put_slice(name);
    buf.put_u32_le(virtual_size);
    buf.put_u32_le(rva);
    buf.put_u32_le(raw_size);
    buf.put_u32_le(raw_off);
    buf.put_u32_le(0); // PointerToRelocations
    buf.put_u32_le(0); // PointerToLinenumbers
    buf.put_u16_le(0); // NumberOfRelocations
    buf.put_u16_le(0); // NumberOfLinenumbers
    buf.put_u32_le(characteristics);
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

    fn sections(code: Vec<u8>, data: Vec<u8>) -> Vec<Section> {
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

    fn u32_at(buf: &[u8], off: usize) -> u32 {
        u32::from_le_bytes(buf[off..off + 4].try_into().unwrap())
    }

    #[test]
    fn image_shape() {
        let sections = sections(vec![0x48, 0x31, 0xC0, 0xC3], vec![]);
        let image = PeBuilder::new().build(&input(&sections, &[])).unwrap();
        let buf = &image.bytes;

        assert_eq!(&buf[..2], b"MZ");
        assert_eq!(u32_at(buf, 60), 64); // e_lfanew
        assert_eq!(&buf[64..68], b"PE\0\0");
        assert_eq!(u16_at(buf, 68), 0x8664); // machine
        assert_eq!(u16_at(buf, 70), 1); // one section, no data
        assert_eq!(u16_at(buf, 84), 240); // SizeOfOptionalHeader
        assert_eq!(u16_at(buf, 88), 0x20B); // PE32+ magic

        // .text payload lands at the file-alignment boundary.
        assert_eq!(&buf[0x200..0x204], &[0x48, 0x31, 0xC0, 0xC3]);
        assert_eq!(buf.len(), 0x400);
    }

    #[test]
    fn optional_header_fields() {
        let sections = sections(vec![0x90; 4], vec![7; 3]);
        let image = PeBuilder::new().build(&input(&sections, &[])).unwrap();
        let buf = &image.bytes;

        let opt = 88;
        assert_eq!(u32_at(buf, opt + 16), 0x1000); // AddressOfEntryPoint
        assert_eq!(u32_at(buf, opt + 20), 0x1000); // BaseOfCode
        assert_eq!(u32_at(buf, opt + 24), 0x10000000); // ImageBase (low half)
        assert_eq!(u32_at(buf, opt + 32), 0x1000); // SectionAlignment
        assert_eq!(u32_at(buf, opt + 36), 0x200); // FileAlignment
        assert_eq!(u32_at(buf, opt + 60), 0x200); // SizeOfHeaders
        assert_eq!(u16_at(buf, opt + 68), 3); // Subsystem
    }

    #[test]
    fn section_headers() {
        let sections = sections(vec![0x90; 4], vec![7; 3]);
        let image = PeBuilder::new().build(&input(&sections, &[])).unwrap();
        let buf = &image.bytes;

        assert_eq!(u16_at(buf, 70), 2);

        let text = 88 + 240;
        assert_eq!(&buf[text..text + 5], b".text");
        assert_eq!(u32_at(buf, text + 8), 4); // VirtualSize
        assert_eq!(u32_at(buf, text + 12), 0x1000); // VirtualAddress
        assert_eq!(u32_at(buf, text + 16), 0x200); // SizeOfRawData
        assert_eq!(u32_at(buf, text + 20), 0x200); // PointerToRawData
        assert_eq!(u32_at(buf, text + 36), TEXT_CHARACTERISTICS);

        let data = text + 40;
        assert_eq!(&buf[data..data + 5], b".data");
        assert_eq!(u32_at(buf, data + 8), 3);
        assert_eq!(u32_at(buf, data + 12), 0x2000);
        assert_eq!(u32_at(buf, data + 20), 0x400);
        assert_eq!(u32_at(buf, data + 36), DATA_CHARACTERISTICS);

        assert_eq!(&buf[0x400..0x403], &[7, 7, 7]);
    }

    #[test]
    fn entry_honors_start_symbol() {
        let secs = sections(vec![0x90; 8], vec![]);
        let symbols = vec![Symbol {
            name: "_start".to_string(),
            section: ".text".to_string(),
            offset: 2,
        }];

        let image = PeBuilder::new().build(&input(&secs, &symbols)).unwrap();

        assert_eq!(u32_at(&image.bytes, 88 + 16), 0x1002);
    }

    #[test]
    fn layout_matches_headers() {
        let secs = sections(vec![0x90; 4], vec![1]);
        let image = PeBuilder::new().build(&input(&secs, &[])).unwrap();

        assert_eq!(
            image.layout,
            Layout {
                text_file_off: 0x200,
                text_vaddr: IMAGE_BASE + 0x1000,
                data_file_off: 0x400,
                data_vaddr: IMAGE_BASE + 0x2000,
            }
        );
    }

    #[test]
    fn extension_is_exe() {
        assert_eq!(PeBuilder::new().extension(), ".exe");
    }
}
