//! End-to-end integration test: build a minimal static ELF32/EM_386 binary,
//! write it to a real file on disk, load it through [`ia32run::elf_loader`],
//! and run it to completion on [`ia32run::Cpu`].
//!
//! This exercises the same path `main.rs` takes (`std::fs::read` -> `load`
//! -> `Cpu::run`) rather than poking memory directly, the way the unit tests
//! elsewhere in this crate do.

use std::io::Write;

use ia32run::cpu::{Cpu, ExitReason};
use ia32run::elf_loader;

const EHDR_SIZE: u16 = 52;
const PHDR_SIZE: u16 = 32;

/// Hand-build a single-`PT_LOAD` static ET_EXEC ELF32/EM_386 image wrapping
/// `code`, loaded at a fixed virtual address.
fn build_elf(code: &[u8]) -> Vec<u8> {
    let vaddr: u32 = 0x0804_8000;
    let entry = vaddr + EHDR_SIZE as u32 + PHDR_SIZE as u32;

    let mut buf = Vec::new();
    buf.extend_from_slice(&[0x7f, b'E', b'L', b'F']);
    buf.push(1); // ELFCLASS32
    buf.push(1); // little-endian
    buf.push(1); // EI_VERSION
    buf.extend_from_slice(&[0u8; 9]);
    buf.extend_from_slice(&2u16.to_le_bytes()); // e_type = ET_EXEC
    buf.extend_from_slice(&3u16.to_le_bytes()); // e_machine = EM_386
    buf.extend_from_slice(&1u32.to_le_bytes()); // e_version
    buf.extend_from_slice(&entry.to_le_bytes());
    buf.extend_from_slice(&(EHDR_SIZE as u32).to_le_bytes()); // e_phoff
    buf.extend_from_slice(&0u32.to_le_bytes()); // e_shoff
    buf.extend_from_slice(&0u32.to_le_bytes()); // e_flags
    buf.extend_from_slice(&EHDR_SIZE.to_le_bytes());
    buf.extend_from_slice(&PHDR_SIZE.to_le_bytes());
    buf.extend_from_slice(&1u16.to_le_bytes()); // e_phnum
    buf.extend_from_slice(&0u16.to_le_bytes());
    buf.extend_from_slice(&0u16.to_le_bytes());
    buf.extend_from_slice(&0u16.to_le_bytes());
    assert_eq!(buf.len(), EHDR_SIZE as usize);

    let offset = (EHDR_SIZE + PHDR_SIZE) as u32;
    buf.extend_from_slice(&1u32.to_le_bytes()); // p_type = PT_LOAD
    buf.extend_from_slice(&offset.to_le_bytes()); // p_offset
    buf.extend_from_slice(&vaddr.to_le_bytes()); // p_vaddr
    buf.extend_from_slice(&vaddr.to_le_bytes()); // p_paddr
    buf.extend_from_slice(&(code.len() as u32).to_le_bytes()); // p_filesz
    buf.extend_from_slice(&(code.len() as u32 + 0x1000).to_le_bytes()); // p_memsz
    buf.extend_from_slice(&5u32.to_le_bytes()); // p_flags = R+X
    buf.extend_from_slice(&0x1000u32.to_le_bytes()); // p_align

    buf.extend_from_slice(code);
    buf
}

#[test]
fn loads_and_runs_an_on_disk_binary_to_exit() {
    // mov eax, 1 ; mov ebx, 7 ; int 0x80  (exit(7))
    let code: &[u8] = &[0xB8, 0x01, 0x00, 0x00, 0x00, 0xBB, 0x07, 0x00, 0x00, 0x00, 0xCD, 0x80];
    let image = build_elf(code);

    let mut file = tempfile::NamedTempFile::new().expect("create temp file");
    file.write_all(&image).expect("write ELF image");
    file.flush().expect("flush ELF image");

    let bytes = std::fs::read(file.path()).expect("read back temp file");

    let mut cpu = Cpu::new(0x1000_0000, 0);
    let loaded = elf_loader::load(&bytes, &mut cpu.mem, &mut cpu.regs).expect("load ELF");
    cpu.set_brk_floor(loaded.brk_floor);

    let reason = cpu.run(Some(1000));
    assert_eq!(reason, ExitReason::Exited(7));
}

#[test]
fn rejects_a_non_elf_file() {
    let mut file = tempfile::NamedTempFile::new().expect("create temp file");
    file.write_all(b"not an ELF image").expect("write garbage");
    file.flush().expect("flush garbage");

    let bytes = std::fs::read(file.path()).expect("read back temp file");
    let mut mem = ia32run::memory::LinearMemory::new(0x1000);
    let mut regs = ia32run::registers::RegisterFile::new();
    assert!(elf_loader::load(&bytes, &mut mem, &mut regs).is_err());
}
