//! Global descriptor table.
//!
//! An ordered list of 8-byte packed segment descriptors in the standard x86
//! layout (base split 16+8+8, limit split 16+4, access byte, flags nibble).
//! Entry 0 is always the null descriptor. The loader installs flat code and
//! data descriptors at process start; `set_thread_area` populates further
//! entries at runtime by scanning for the first slot whose present bit is
//! clear.

use crate::registers::{RegisterFile, SegReg, SegmentDescriptor};

/// Fixed GDT slot indices the runner installs at process start.
pub const NULL_INDEX: usize = 0;
pub const CODE_INDEX: usize = 1;
pub const DATA_INDEX: usize = 2;

/// Number of entries reserved before `set_thread_area` may start allocating.
const RESERVED_ENTRIES: usize = 3;

/// Raw, packed global descriptor table.
pub struct Gdt {
    entries: Vec<u64>,
}

impl Gdt {
    /// An empty table holding only the null descriptor.
    pub fn new() -> Self {
        Gdt { entries: vec![0u64; RESERVED_ENTRIES] }
    }

    /// Raw 8-byte value of entry `index`, or `None` if out of range.
    pub fn raw(&self, index: usize) -> Option<u64> {
        self.entries.get(index).copied()
    }

    /// Overwrite entry `index` with a raw packed value, growing the table if
    /// necessary.
    pub fn set_raw(&mut self, index: usize, raw: u64) {
        if index >= self.entries.len() {
            self.entries.resize(index + 1, 0);
        }
        self.entries[index] = raw;
    }

    /// Whether entry `index` exists and has its present bit (byte 5, bit 7)
    /// set.
    pub fn is_present(&self, index: usize) -> bool {
        match self.raw(index) {
            Some(raw) => ((raw >> 40) & 0x80) != 0,
            None => false,
        }
    }

    /// Scan from `start` (inclusive) for the first entry that is either
    /// absent from the table or present-bit clear. Used by `set_thread_area`
    /// with `start = 1`.
    pub fn find_free_from(&self, start: usize) -> usize {
        let mut idx = start;
        loop {
            if idx >= self.entries.len() || !self.is_present(idx) {
                return idx;
            }
            idx += 1;
        }
    }

    /// Pack a descriptor from its constituent fields, following the same
    /// layout [`SegmentDescriptor::from_raw`] decodes.
    pub fn pack(base: u32, limit: u32, access: u8, granularity: bool) -> u64 {
        let (limit_field, flags) = if granularity {
            ((limit >> 12) & 0xFFFFF, 0x8u8)
        } else {
            (limit & 0xFFFFF, 0x0u8)
        };
        let limit_low = (limit_field & 0xFFFF) as u64;
        let limit_high = ((limit_field >> 16) & 0x0F) as u64;
        let base_low = (base & 0xFFFF) as u64;
        let base_mid = ((base >> 16) & 0xFF) as u64;
        let base_high = ((base >> 24) & 0xFF) as u64;

        limit_low
            | (base_low << 16)
            | (base_mid << 32)
            | ((access as u64) << 40)
            | (limit_high << 48)
            | ((flags as u64) << 52)
            | (base_high << 56)
    }

    /// Install the null, flat code, and flat data descriptors at their fixed
    /// indices, then load CS/DS/ES/SS in the register file to point at them.
    pub fn install_flat(&mut self, regs: &mut RegisterFile) {
        self.set_raw(NULL_INDEX, 0);
        // Access 0x9A: present, ring 0, code, executable, readable.
        self.set_raw(CODE_INDEX, Self::pack(0, 0xFFFF_FFFF, 0x9A, true));
        // Access 0x92: present, ring 0, data, writable.
        self.set_raw(DATA_INDEX, Self::pack(0, 0xFFFF_FFFF, 0x92, true));

        let code_selector = (CODE_INDEX as u16) << 3;
        let data_selector = (DATA_INDEX as u16) << 3;

        regs.load_segment(SegReg::Cs, code_selector, self.raw(CODE_INDEX).unwrap());
        for seg in [SegReg::Ds, SegReg::Es, SegReg::Ss] {
            regs.load_segment(seg, data_selector, self.raw(DATA_INDEX).unwrap());
        }
    }

    /// Decode entry `index` into a [`SegmentDescriptor`] under the given
    /// selector, or `None` if the entry does not exist.
    pub fn descriptor(&self, index: usize, selector: u16) -> Option<SegmentDescriptor> {
        self.raw(index).map(|raw| SegmentDescriptor::from_raw(selector, raw))
    }
}

impl Default for Gdt {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_flat_loads_cs_ds_es_ss() {
        let mut gdt = Gdt::new();
        let mut regs = RegisterFile::new();
        gdt.install_flat(&mut regs);
        assert_eq!(regs.segment(SegReg::Cs).base, 0);
        assert_eq!(regs.segment(SegReg::Cs).limit, 0xFFFF_FFFF);
        assert!(regs.segment(SegReg::Ds).present);
        assert_eq!(regs.segment(SegReg::Ss).selector, (DATA_INDEX as u16) << 3);
    }

    #[test]
    fn find_free_from_skips_present_entries() {
        let mut gdt = Gdt::new();
        gdt.install_flat(&mut RegisterFile::new());
        assert_eq!(gdt.find_free_from(1), RESERVED_ENTRIES);
        gdt.set_raw(3, Gdt::pack(0x1000, 0xFFF, 0x92, false));
        assert_eq!(gdt.find_free_from(1), 4);
    }

    #[test]
    fn pack_then_unpack_roundtrips_base_and_page_granular_limit() {
        let raw = Gdt::pack(0x1234_5678, 0x0010_0000, 0x92, true);
        let desc = SegmentDescriptor::from_raw(0x33, raw);
        assert_eq!(desc.base, 0x1234_5678);
        // Granular limits round down to the containing 4 KiB page, then read
        // back as "page base | 0xFFF" (the same expansion `from_raw` applies).
        assert_eq!(desc.limit, (0x0010_0000u32 & !0xFFF) | 0xFFF);
    }
}
