use gasm::arch::Arch;
use gasm::format::Format;

fn u64_at(buf: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(buf[off..off + 8].try_into().unwrap())
}

#[test]
fn mov_label_is_patched_to_the_data_vaddr() {
    let source = r#"
section .data
msg: db "hi"

section .text
_start:
    mov rax, msg
    ret
"#;
    let binary = gasm::assemble(source, Arch::X86_64, Format::Elf).unwrap();

    // Code is mov (10 bytes) + ret; data follows code in the load segment.
    let code_len = 11;
    let data_vaddr = 0x401000 + code_len;

    assert_eq!(u64_at(&binary, 0x1002), data_vaddr);
    assert_eq!(&binary[0x1000 + code_len as usize..][..2], b"hi");
}

#[test]
fn symbolic_immediate_addend_is_applied() {
    let source = r#"
section .data
msg: db "hello"

section .text
_start:
    mov rax, 1 + msg
    ret
"#;
    let binary = gasm::assemble(source, Arch::X86_64, Format::Elf).unwrap();

    let data_vaddr = 0x401000 + 11;
    assert_eq!(u64_at(&binary, 0x1002), data_vaddr + 1);
}

#[test]
fn data_pointer_to_text_symbol() {
    let source = r#"
section .text
_start:
    ret

section .data
ptr: dq _start
"#;
    let binary = gasm::assemble(source, Arch::X86_64, Format::Elf).unwrap();

    // ret is the whole text section; the dq cell is the first data bytes.
    assert_eq!(u64_at(&binary, 0x1001), 0x401000);
}

#[test]
fn mixed_data_declaration_layout() {
    let source = "section .data\nv: db \"ab\", 0\nw: dw 0x0102\nr: resb 4\n";
    let binary = gasm::assemble(source, Arch::X86_64, Format::Elf).unwrap();

    let data = &binary[0x1000..];
    assert_eq!(&data[..3], b"ab\0");
    assert_eq!(&data[3..5], &[0x02, 0x01]);
    assert_eq!(&data[5..9], &[0, 0, 0, 0]);
    assert_eq!(binary.len(), 0x1000 + 9);
}

#[test]
fn undefined_data_symbol_fails_the_link() {
    let err =
        gasm::assemble("section .data\nptr: dq missing\n", Arch::X86_64, Format::Elf).unwrap_err();

    assert!(matches!(err, gasm::Error::Link(_)));
}
