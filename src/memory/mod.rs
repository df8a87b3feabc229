//! Linear guest memory.
//!
//! The emulator core only ever sees a single flat byte-addressable space: the
//! ELF loader and GDT bootstrap live outside the core and feed it data
//! through this module's `get`/`set` surface. Unlike a hardware bus, an
//! out-of-range access here is a hard fault rather than a floating-bus read
//! or a silently dropped write, since there is no MMU to legitimately map
//! "unbacked" addresses in a user-mode emulator.

use crate::error::{AccessKind, VmError};

/// Flat, contiguous guest linear memory.
pub struct LinearMemory {
    data: Vec<u8>,
    /// Segment-override hint. Instructions that need to read/write through a
    /// segment other than the implicit default (e.g. `MOVS`'s ES-destination
    /// half) save the current value, set this field, perform the access, and
    /// restore it. The store itself does not interpret this field — it is
    /// state for the caller's convenience, per `§4.B` of the governing
    /// design.
    pub segment_override: Option<crate::registers::SegReg>,
    /// Current end of the heap, advanced by `brk`.
    pub program_break: u32,
}

impl LinearMemory {
    /// Allocate `size` bytes of zeroed guest memory.
    pub fn new(size: usize) -> Self {
        LinearMemory {
            data: vec![0u8; size],
            segment_override: None,
            program_break: 0,
        }
    }

    /// Total addressable size in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn bounds_check(&self, addr: u32, n: usize, access: AccessKind) -> Result<(), VmError> {
        let end = (addr as usize).checked_add(n);
        match end {
            Some(end) if end <= self.data.len() => Ok(()),
            _ => Err(VmError::MemoryFault {
                addr,
                len: n as u32,
                access,
            }),
        }
    }

    /// Read `n` bytes at `addr`. Fatal fault if any byte is out of range.
    pub fn get(&self, addr: u32, n: usize) -> Result<&[u8], VmError> {
        self.bounds_check(addr, n, AccessKind::Read)?;
        let start = addr as usize;
        Ok(&self.data[start..start + n])
    }

    /// Read `n` bytes at `addr`, identical to [`get`](Self::get) but used
    /// from the instruction-fetch path so logs can distinguish fetch traffic
    /// from data traffic.
    pub fn get_eip(&self, addr: u32, n: usize) -> Result<&[u8], VmError> {
        self.get(addr, n)
    }

    /// Read `n` little-endian bytes at `addr` as an unsigned integer
    /// (`n` in 1..=4).
    pub fn get_uint(&self, addr: u32, n: usize) -> Result<u64, VmError> {
        let bytes = self.get(addr, n)?;
        let mut val: u64 = 0;
        for (i, b) in bytes.iter().enumerate() {
            val |= (*b as u64) << (8 * i);
        }
        Ok(val)
    }

    /// Read `n` little-endian bytes at `addr` as a sign-extended integer.
    pub fn get_int(&self, addr: u32, n: usize) -> Result<i64, VmError> {
        let val = self.get_uint(addr, n)?;
        let bits = (n * 8) as u32;
        let sign_bit = 1u64 << (bits - 1);
        Ok(if val & sign_bit != 0 {
            (val as i64) - (1i64 << bits)
        } else {
            val as i64
        })
    }

    /// Write raw bytes verbatim at `addr`.
    pub fn set(&mut self, addr: u32, bytes: &[u8]) -> Result<(), VmError> {
        self.bounds_check(addr, bytes.len(), AccessKind::Write)?;
        let start = addr as usize;
        self.data[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Write an integer value as `n` little-endian bytes at `addr`.
    pub fn set_uint(&mut self, addr: u32, n: usize, value: u64) -> Result<(), VmError> {
        let bytes = value.to_le_bytes();
        self.set(addr, &bytes[..n])
    }

    /// Copy `src` into guest memory starting at `offset`, without bounds
    /// checking failures surfacing as a `VmError` — used by the ELF loader,
    /// which works with a pre-sized image and treats an out-of-range segment
    /// as a load-time error instead.
    pub fn load_at(&mut self, offset: usize, src: &[u8]) -> bool {
        let end = offset + src.len();
        if end > self.data.len() {
            return false;
        }
        self.data[offset..end].copy_from_slice(src);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_bounds_roundtrip() {
        let mut mem = LinearMemory::new(0x1000);
        mem.set(0x10, &[1, 2, 3, 4]).unwrap();
        assert_eq!(mem.get(0x10, 4).unwrap(), &[1, 2, 3, 4]);
        assert_eq!(mem.get_uint(0x10, 4).unwrap(), 0x0403_0201);
    }

    #[test]
    fn out_of_range_read_faults() {
        let mem = LinearMemory::new(0x10);
        assert!(mem.get(0x20, 1).is_err());
        assert!(mem.get(0x0C, 8).is_err());
    }

    #[test]
    fn out_of_range_write_faults() {
        let mut mem = LinearMemory::new(0x10);
        assert!(mem.set(0x10, &[1]).is_err());
    }

    #[test]
    fn signed_read() {
        let mut mem = LinearMemory::new(0x10);
        mem.set_uint(0, 1, 0xFF).unwrap();
        assert_eq!(mem.get_int(0, 1).unwrap(), -1);
    }
}
