//! ELF loader.
//!
//! Parses a 32-bit little-endian, statically linked `ET_EXEC` ELF image
//! using the `elf` crate, maps its `PT_LOAD` segments into linear guest
//! memory, and reports the entry point and the watermark the syscall layer
//! enforces as the floor for `brk`.

use elf::abi::{EM_386, ET_EXEC, PT_INTERP, PT_LOAD};
use elf::endian::AnyEndian;
use elf::file::Class;
use elf::ElfBytes;
use log::info;

use crate::error::LoadError;
use crate::memory::LinearMemory;
use crate::registers::RegisterFile;

/// Bytes reserved below the highest loaded address for the initial stack,
/// and the alignment the resulting `brk` floor is rounded up to.
const STACK_SIZE: u32 = 0x0010_0000;
const PAGE_SIZE: u32 = 0x1000;

/// Result of a successful load: where execution begins and where the heap
/// may legally start growing.
pub struct LoadedImage {
    pub entry: u32,
    pub initial_sp: u32,
    pub brk_floor: u32,
}

/// Parse `data` as a static 32-bit x86 executable and copy its `PT_LOAD`
/// segments into `mem`, zero-filling BSS. Sets `regs.eip` to the entry
/// point and `regs.esp` to a fixed stack top below the highest loaded
/// segment.
pub fn load(data: &[u8], mem: &mut LinearMemory, regs: &mut RegisterFile) -> Result<LoadedImage, LoadError> {
    let elf = ElfBytes::<AnyEndian>::minimal_parse(data)?;

    if elf.ehdr.class != Class::ELF32 {
        return Err(LoadError::WrongClass);
    }
    if elf.ehdr.e_machine != EM_386 {
        return Err(LoadError::WrongMachine);
    }
    if elf.ehdr.e_type != ET_EXEC {
        return Err(LoadError::NotStaticExecutable);
    }

    let segments = elf.segments().into_iter().flatten();
    let mut highest: u32 = 0;
    let mut loaded_any = false;

    for phdr in segments {
        if phdr.p_type == PT_INTERP {
            return Err(LoadError::DynamicallyLinked);
        }
        if phdr.p_type != PT_LOAD {
            continue;
        }

        let vaddr = phdr.p_vaddr as u32;
        let filesz = phdr.p_filesz as usize;
        let memsz = phdr.p_memsz as usize;
        let end = (phdr.p_vaddr + phdr.p_memsz) as u64;
        if end > mem.len() as u64 {
            return Err(LoadError::SegmentOutOfRange { vaddr: phdr.p_vaddr, size: phdr.p_memsz });
        }

        let file_start = phdr.p_offset as usize;
        let file_bytes = data
            .get(file_start..file_start + filesz)
            .ok_or(LoadError::SegmentOutOfRange { vaddr: phdr.p_vaddr, size: phdr.p_memsz })?;

        if !mem.load_at(vaddr as usize, file_bytes) {
            return Err(LoadError::SegmentOutOfRange { vaddr: phdr.p_vaddr, size: phdr.p_memsz });
        }
        if memsz > filesz {
            let bss = vec![0u8; memsz - filesz];
            mem.load_at(vaddr as usize + filesz, &bss);
        }

        highest = highest.max(vaddr.wrapping_add(memsz as u32));
        loaded_any = true;
        info!("loaded PT_LOAD segment at 0x{vaddr:08X}, {memsz} bytes");
    }

    if !loaded_any {
        return Err(LoadError::SegmentOutOfRange { vaddr: 0, size: 0 });
    }

    let brk_floor = (highest + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
    let initial_sp = brk_floor.wrapping_add(STACK_SIZE) & !0xF;

    regs.eip = elf.ehdr.e_entry as u32;
    regs.set_sp(initial_sp);
    mem.program_break = brk_floor;

    Ok(LoadedImage { entry: regs.eip, initial_sp, brk_floor })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::SegReg;

    /// Build a minimal single-PT_LOAD static ET_EXEC ELF32/EM_386 image by
    /// hand: a 52-byte Ehdr, one 32-byte Phdr, then the segment payload.
    fn build_minimal_elf(code: &[u8]) -> Vec<u8> {
        let ehdr_size = 52u16;
        let phdr_size = 32u16;
        let entry: u32 = 0x1000_0000 + ehdr_size as u32 + phdr_size as u32;

        let mut buf = Vec::new();
        // e_ident
        buf.extend_from_slice(&[0x7f, b'E', b'L', b'F']);
        buf.push(1); // ELFCLASS32
        buf.push(1); // little endian
        buf.push(1); // EI_VERSION
        buf.extend_from_slice(&[0u8; 9]); // padding
        buf.extend_from_slice(&2u16.to_le_bytes()); // e_type = ET_EXEC
        buf.extend_from_slice(&3u16.to_le_bytes()); // e_machine = EM_386
        buf.extend_from_slice(&1u32.to_le_bytes()); // e_version
        buf.extend_from_slice(&entry.to_le_bytes()); // e_entry
        buf.extend_from_slice(&(ehdr_size as u32).to_le_bytes()); // e_phoff
        buf.extend_from_slice(&0u32.to_le_bytes()); // e_shoff
        buf.extend_from_slice(&0u32.to_le_bytes()); // e_flags
        buf.extend_from_slice(&ehdr_size.to_le_bytes()); // e_ehsize
        buf.extend_from_slice(&phdr_size.to_le_bytes()); // e_phentsize
        buf.extend_from_slice(&1u16.to_le_bytes()); // e_phnum
        buf.extend_from_slice(&0u16.to_le_bytes()); // e_shentsize
        buf.extend_from_slice(&0u16.to_le_bytes()); // e_shnum
        buf.extend_from_slice(&0u16.to_le_bytes()); // e_shstrndx
        assert_eq!(buf.len(), ehdr_size as usize);

        let offset = (ehdr_size + phdr_size) as u32;
        buf.extend_from_slice(&1u32.to_le_bytes()); // p_type = PT_LOAD
        buf.extend_from_slice(&offset.to_le_bytes()); // p_offset
        buf.extend_from_slice(&0x1000_0000u32.to_le_bytes()); // p_vaddr
        buf.extend_from_slice(&0x1000_0000u32.to_le_bytes()); // p_paddr
        buf.extend_from_slice(&(code.len() as u32).to_le_bytes()); // p_filesz
        buf.extend_from_slice(&(code.len() as u32 + 0x1000).to_le_bytes()); // p_memsz
        buf.extend_from_slice(&5u32.to_le_bytes()); // p_flags = R+X
        buf.extend_from_slice(&0x1000u32.to_le_bytes()); // p_align

        buf.extend_from_slice(code);
        buf
    }

    #[test]
    fn loads_entry_point_and_zero_fills_bss() {
        let image = build_minimal_elf(&[0x90, 0x90, 0xF4]);
        let mut mem = LinearMemory::new(0x2000_0000);
        let mut regs = RegisterFile::new();
        regs.load_segment_flat(SegReg::Ds, 0x2B);

        let loaded = load(&image, &mut mem, &mut regs).unwrap();
        assert_eq!(regs.eip, loaded.entry);
        assert_eq!(mem.get(loaded.entry, 3).unwrap(), &[0x90, 0x90, 0xF4]);
        // BSS past filesz is zero-filled.
        assert_eq!(mem.get(0x1000_0000 + 3, 1).unwrap(), &[0]);
        assert!(regs.sp() > 0);
    }
}
