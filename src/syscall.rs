//! Linux syscall dispatcher and handlers.
//!
//! Reached only through `int 0x80` (see `executor::control::exec_int`).
//! Dispatch uses an explicit, enumerable registration table built once at
//! startup, keyed by the EAX syscall number. Handlers read their arguments
//! from EBX/ECX/EDX/ESI/EDI in that order and return a value written to
//! EAX; negative values encode an errno-style failure.

use std::collections::HashMap;

use log::{debug, trace, warn};

use crate::descriptor::DescriptorTable;
use crate::error::{Result, VmError};
use crate::gdt::Gdt;
use crate::memory::LinearMemory;
use crate::registers::{GprIndex, RegisterFile};

/// Process-wide state a syscall handler may need beyond the register file
/// and memory: open descriptors, the GDT (for `set_thread_area`), and the
/// exit status this single-threaded process is carrying.
pub struct SyscallState {
    pub descriptors: DescriptorTable,
    pub running: bool,
    pub exit_code: i32,
    /// Lowest legal value for `program_break`, set by the ELF loader to the
    /// end of the highest `PT_LOAD` segment.
    pub brk_floor: u32,
}

impl SyscallState {
    pub fn new(brk_floor: u32) -> Self {
        SyscallState {
            descriptors: DescriptorTable::new(),
            running: true,
            exit_code: 0,
            brk_floor,
        }
    }
}

type Handler = fn(&mut RegisterFile, &mut LinearMemory, &mut Gdt, &mut SyscallState) -> i64;

/// The syscall number to handler mapping, built once and consulted on every
/// `int 0x80`.
pub struct SyscallTable {
    handlers: HashMap<u32, Handler>,
}

impl SyscallTable {
    pub fn new() -> Self {
        let mut handlers: HashMap<u32, Handler> = HashMap::new();
        handlers.insert(0x00, sys_py_dbg);
        handlers.insert(0x01, sys_exit);
        handlers.insert(0x03, sys_read);
        handlers.insert(0x04, sys_write);
        handlers.insert(0x05, sys_open);
        handlers.insert(0x2d, sys_brk);
        handlers.insert(0x36, sys_ioctl);
        handlers.insert(0x7a, sys_newuname);
        handlers.insert(0x7b, sys_modify_ldt);
        handlers.insert(0x8c, sys_llseek);
        handlers.insert(0x92, sys_writev);
        handlers.insert(0xae, sys_sigaction);
        handlers.insert(0xaf, sys_rt_sigprocmask);
        handlers.insert(0xc0, sys_mmap_pgoff);
        handlers.insert(0xf3, sys_set_thread_area);
        handlers.insert(0xfc, sys_exit_group);
        handlers.insert(0x102, sys_set_tid_address);
        handlers.insert(0x10e, sys_tgkill);
        SyscallTable { handlers }
    }

    /// Dispatch the syscall named by EAX. Returns `Err` only for a number
    /// with no registered handler; the handler's own (possibly negative)
    /// result is always written to EAX before returning `Ok`.
    pub fn dispatch(
        &self,
        regs: &mut RegisterFile,
        mem: &mut LinearMemory,
        gdt: &mut Gdt,
        state: &mut SyscallState,
    ) -> Result<()> {
        let num = regs.read_gpr32(GprIndex::Eax as u8);
        let handler = self.handlers.get(&num).copied().ok_or(VmError::UnsupportedSyscall(num))?;
        trace!("syscall {num:#x} entry");
        let ret = handler(regs, mem, gdt, state);
        regs.write_gpr32(GprIndex::Eax as u8, ret as u32);
        trace!("syscall {num:#x} -> {ret}");
        Ok(())
    }
}

impl Default for SyscallTable {
    fn default() -> Self {
        Self::new()
    }
}

fn arg(regs: &RegisterFile, idx: u8) -> u32 {
    regs.read_gpr32(idx)
}

/// `0x00`: py_dbg. ECX selects the format: 0 = NUL-terminated C string at
/// EBX, 1 = unsigned decimal, 2 = signed decimal. Routed through the
/// logging facility instead of directly to stdout so it composes with the
/// rest of the emulator's structured logs.
fn sys_py_dbg(regs: &mut RegisterFile, mem: &mut LinearMemory, _gdt: &mut Gdt, _state: &mut SyscallState) -> i64 {
    let format = arg(regs, GprIndex::Ecx as u8);
    let value = arg(regs, GprIndex::Ebx as u8);
    match format {
        0 => {
            let mut bytes = Vec::new();
            let mut addr = value;
            loop {
                match mem.get(addr, 1) {
                    Ok(b) if b[0] != 0 => {
                        bytes.push(b[0]);
                        addr = addr.wrapping_add(1);
                    }
                    _ => break,
                }
            }
            debug!("py_dbg: {}", String::from_utf8_lossy(&bytes));
        }
        1 => debug!("py_dbg: {value}"),
        2 => debug!("py_dbg: {}", value as i32),
        other => warn!("py_dbg: unknown format {other}"),
    }
    0
}

/// `0x01`: exit.
fn sys_exit(regs: &mut RegisterFile, _mem: &mut LinearMemory, _gdt: &mut Gdt, state: &mut SyscallState) -> i64 {
    state.exit_code = arg(regs, GprIndex::Ebx as u8) as i32;
    state.running = false;
    0
}

/// `0xfc`: exit_group. This machine has no concept of a thread group
/// distinct from the single process, so it behaves identically to `exit`.
fn sys_exit_group(regs: &mut RegisterFile, mem: &mut LinearMemory, gdt: &mut Gdt, state: &mut SyscallState) -> i64 {
    sys_exit(regs, mem, gdt, state)
}

/// `0x03`: read. Transfers up to EDX bytes from host fd EBX into memory at
/// ECX.
fn sys_read(regs: &mut RegisterFile, mem: &mut LinearMemory, _gdt: &mut Gdt, state: &mut SyscallState) -> i64 {
    let fd = arg(regs, GprIndex::Ebx as u8) as i32;
    let addr = arg(regs, GprIndex::Ecx as u8);
    let count = arg(regs, GprIndex::Edx as u8) as usize;
    let Some(desc) = state.descriptors.get_mut(fd) else { return -1 };
    let mut buf = vec![0u8; count];
    match desc.read(&mut buf) {
        Ok(n) => {
            if mem.set(addr, &buf[..n]).is_err() {
                return -1;
            }
            n as i64
        }
        Err(_) => -1,
    }
}

/// `0x04`: write. Transfers EDX bytes from memory at ECX to host fd EBX.
fn sys_write(regs: &mut RegisterFile, mem: &mut LinearMemory, _gdt: &mut Gdt, state: &mut SyscallState) -> i64 {
    let fd = arg(regs, GprIndex::Ebx as u8) as i32;
    let addr = arg(regs, GprIndex::Ecx as u8);
    let count = arg(regs, GprIndex::Edx as u8) as usize;
    let Ok(bytes) = mem.get(addr, count) else { return -1 };
    let bytes = bytes.to_vec();
    let Some(desc) = state.descriptors.get_mut(fd) else { return -1 };
    match desc.write(&bytes) {
        Ok(n) => n as i64,
        Err(_) => -1,
    }
}

/// `0x05`: open. Not supported.
fn sys_open(_regs: &mut RegisterFile, _mem: &mut LinearMemory, _gdt: &mut Gdt, _state: &mut SyscallState) -> i64 {
    -1
}

/// `0x2d`: brk. Enforces `brk >= code_segment_end`; returns the (possibly
/// unchanged) current break.
fn sys_brk(regs: &mut RegisterFile, mem: &mut LinearMemory, _gdt: &mut Gdt, state: &mut SyscallState) -> i64 {
    let requested = arg(regs, GprIndex::Ebx as u8);
    if requested != 0 && requested >= state.brk_floor {
        mem.program_break = requested;
    }
    mem.program_break as i64
}

const TIOCGWINSZ: u32 = 0x5413;

/// `0x36`: ioctl. Only TIOCGWINSZ is answered, with a fixed 256x256 window.
fn sys_ioctl(regs: &mut RegisterFile, mem: &mut LinearMemory, _gdt: &mut Gdt, _state: &mut SyscallState) -> i64 {
    let request = arg(regs, GprIndex::Ecx as u8);
    let addr = arg(regs, GprIndex::Edx as u8);
    if request == TIOCGWINSZ {
        // struct winsize { u16 ws_row, ws_col, ws_xpixel, ws_ypixel; }
        let winsize: [u16; 4] = [256, 256, 0, 0];
        for (i, word) in winsize.iter().enumerate() {
            if mem.set_uint(addr.wrapping_add((i * 2) as u32), 2, *word as u64).is_err() {
                return -1;
            }
        }
        0
    } else {
        -1
    }
}

/// `0x7a`: newuname. Writes a fixed `struct new_utsname` (six 65-byte
/// fields: sysname, nodename, release, version, machine, domainname).
fn sys_newuname(regs: &mut RegisterFile, mem: &mut LinearMemory, _gdt: &mut Gdt, _state: &mut SyscallState) -> i64 {
    let addr = arg(regs, GprIndex::Ebx as u8);
    let fields: [&str; 6] = ["Linux", "localhost", "5.0.0", "#1", "i686", "(none)"];
    for (i, field) in fields.iter().enumerate() {
        let mut buf = [0u8; 65];
        let bytes = field.as_bytes();
        buf[..bytes.len()].copy_from_slice(bytes);
        if mem.set(addr.wrapping_add((i * 65) as u32), &buf).is_err() {
            return -1;
        }
    }
    0
}

/// `0x7b`: modify_ldt. Stub.
fn sys_modify_ldt(_regs: &mut RegisterFile, _mem: &mut LinearMemory, _gdt: &mut Gdt, _state: &mut SyscallState) -> i64 {
    -1
}

/// `0x8c`: _llseek. Combines `offset_high:offset_low` into a signed 64-bit
/// offset, seeks host fd EBX, and writes the resulting position at ESI.
fn sys_llseek(regs: &mut RegisterFile, mem: &mut LinearMemory, _gdt: &mut Gdt, state: &mut SyscallState) -> i64 {
    let fd = arg(regs, GprIndex::Ebx as u8) as i32;
    let offset_high = arg(regs, GprIndex::Ecx as u8) as u64;
    let offset_low = arg(regs, GprIndex::Edx as u8) as u64;
    let result_addr = arg(regs, GprIndex::Esi as u8);
    let whence = arg(regs, GprIndex::Edi as u8) as i32;
    let offset = ((offset_high << 32) | offset_low) as i64;

    let Some(desc) = state.descriptors.get_mut(fd) else { return -1 };
    let new_pos = unsafe { libc::lseek64(desc.fileno(), offset, whence) };
    if new_pos < 0 {
        return -1;
    }
    if mem.set_uint(result_addr, 8, new_pos as u64).is_err() {
        return -1;
    }
    0
}

/// `0x92`: writev. Iterates EDX iovecs at ECX (layout `<u32 base, u32
/// len>`), writing each non-empty buffer to host fd EBX.
fn sys_writev(regs: &mut RegisterFile, mem: &mut LinearMemory, _gdt: &mut Gdt, state: &mut SyscallState) -> i64 {
    let fd = arg(regs, GprIndex::Ebx as u8) as i32;
    let iov_addr = arg(regs, GprIndex::Ecx as u8);
    let iov_count = arg(regs, GprIndex::Edx as u8);

    let mut total = 0i64;
    for i in 0..iov_count {
        let entry_addr = iov_addr.wrapping_add(i * 8);
        let Ok(base) = mem.get_uint(entry_addr, 4) else { return -1 };
        let Ok(len) = mem.get_uint(entry_addr.wrapping_add(4), 4) else { return -1 };
        if len == 0 {
            continue;
        }
        let Ok(bytes) = mem.get(base as u32, len as usize) else { return -1 };
        let bytes = bytes.to_vec();
        let Some(desc) = state.descriptors.get_mut(fd) else { return -1 };
        match desc.write(&bytes) {
            Ok(n) => total += n as i64,
            Err(_) => return -1,
        }
    }
    total
}

/// `0xae`: sigaction. Stub.
fn sys_sigaction(_regs: &mut RegisterFile, _mem: &mut LinearMemory, _gdt: &mut Gdt, _state: &mut SyscallState) -> i64 {
    -1
}

/// `0xaf`: rt_sigprocmask. Stub.
fn sys_rt_sigprocmask(_regs: &mut RegisterFile, _mem: &mut LinearMemory, _gdt: &mut Gdt, _state: &mut SyscallState) -> i64 {
    0
}

/// `0xc0`: mmap_pgoff. Stub.
fn sys_mmap_pgoff(_regs: &mut RegisterFile, _mem: &mut LinearMemory, _gdt: &mut Gdt, _state: &mut SyscallState) -> i64 {
    -1
}

/// `0xf3`: set_thread_area. Reads a `struct user_desc` at EBX; when
/// `entry_number == 0xFFFFFFFF`, scans the GDT from index 1 for the first
/// descriptor with the present bit clear, installs it there, and writes the
/// chosen index back into the structure.
fn sys_set_thread_area(regs: &mut RegisterFile, mem: &mut LinearMemory, gdt: &mut Gdt, _state: &mut SyscallState) -> i64 {
    let desc_addr = arg(regs, GprIndex::Ebx as u8);
    let Ok(entry_number) = mem.get_uint(desc_addr, 4) else { return -1 };
    let Ok(base_addr) = mem.get_uint(desc_addr.wrapping_add(4), 4) else { return -1 };
    let Ok(limit) = mem.get_uint(desc_addr.wrapping_add(8), 4) else { return -1 };
    let Ok(flags) = mem.get_uint(desc_addr.wrapping_add(12), 1) else { return -1 };

    let limit_in_pages = (flags & 0x10) != 0;
    let seg_not_present = (flags & 0x20) != 0;
    // Only the present bit is synthesized here, matching the reference
    // `sys_set_thread_area` (which sets only `info |= 1<<7` over an
    // otherwise-zeroed slot). This emulator never consults type/DPL bits
    // since `MOV Sreg` is a no-op and no code ever reads a TLS base back
    // out of the GDT.
    let access: u8 = if seg_not_present { 0x00 } else { 0x80 };

    let index = if entry_number == 0xFFFF_FFFF {
        gdt.find_free_from(1)
    } else {
        entry_number as usize
    };

    gdt.set_raw(index, crate::gdt::Gdt::pack(base_addr as u32, limit as u32, access, limit_in_pages));

    if entry_number == 0xFFFF_FFFF && mem.set_uint(desc_addr, 4, index as u64).is_err() {
        return -1;
    }
    0
}

/// `0x102`: set_tid_address. Reads the 4 bytes already stored at `*tidptr`
/// and echoes them back into EAX verbatim — this process has exactly one
/// thread, so no real tid is ever allocated here.
fn sys_set_tid_address(regs: &mut RegisterFile, mem: &mut LinearMemory, _gdt: &mut Gdt, _state: &mut SyscallState) -> i64 {
    let tidptr = arg(regs, GprIndex::Ebx as u8);
    match mem.get_uint(tidptr, 4) {
        Ok(v) => v as i64,
        Err(_) => 0,
    }
}

/// `0x10e`: tgkill. Stub.
fn sys_tgkill(_regs: &mut RegisterFile, _mem: &mut LinearMemory, _gdt: &mut Gdt, _state: &mut SyscallState) -> i64 {
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (RegisterFile, LinearMemory, Gdt, SyscallState) {
        let mut regs = RegisterFile::new();
        let mem = LinearMemory::new(0x10000);
        let mut gdt = Gdt::new();
        gdt.install_flat(&mut regs);
        let state = SyscallState::new(0x8000);
        (regs, mem, gdt, state)
    }

    #[test]
    fn brk_enforces_floor_and_returns_current_break() {
        let (mut regs, mut mem, mut gdt, mut state) = setup();
        mem.program_break = 0x8000;
        regs.write_gpr32(GprIndex::Ebx as u8, 0x9000);
        let ret = sys_brk(&mut regs, &mut mem, &mut gdt, &mut state);
        assert_eq!(ret, 0x9000);
        assert_eq!(mem.program_break, 0x9000);

        // A request below the floor is ignored; current break is returned.
        regs.write_gpr32(GprIndex::Ebx as u8, 0x100);
        let ret = sys_brk(&mut regs, &mut mem, &mut gdt, &mut state);
        assert_eq!(ret, 0x9000);
    }

    #[test]
    fn set_tid_address_echoes_existing_bytes() {
        let (mut regs, mut mem, mut gdt, mut state) = setup();
        mem.set_uint(0x300, 4, 0xAABBCCDD).unwrap();
        regs.write_gpr32(GprIndex::Ebx as u8, 0x300);
        let ret = sys_set_tid_address(&mut regs, &mut mem, &mut gdt, &mut state);
        assert_eq!(ret as u32, 0xAABBCCDD);
    }

    #[test]
    fn set_thread_area_allocates_first_free_slot() {
        let (mut regs, mut mem, mut gdt, mut state) = setup();
        mem.set_uint(0x400, 4, 0xFFFF_FFFF).unwrap(); // entry_number
        mem.set_uint(0x404, 4, 0x1234_0000).unwrap(); // base_addr
        mem.set_uint(0x408, 4, 0x0000_0FFF).unwrap(); // limit
        mem.set_uint(0x40C, 1, 0).unwrap(); // flags
        regs.write_gpr32(GprIndex::Ebx as u8, 0x400);

        let ret = sys_set_thread_area(&mut regs, &mut mem, &mut gdt, &mut state);
        assert_eq!(ret, 0);
        let written_index = mem.get_uint(0x400, 4).unwrap();
        assert_eq!(written_index, 3);
        let desc = gdt.descriptor(3, 0).unwrap();
        assert_eq!(desc.base, 0x1234_0000);
        assert!(desc.present);
    }

    #[test]
    fn dispatch_rejects_unregistered_syscall_number() {
        let (mut regs, mut mem, mut gdt, mut state) = setup();
        let table = SyscallTable::new();
        regs.write_gpr32(GprIndex::Eax as u8, 0xDEAD);
        assert!(table.dispatch(&mut regs, &mut mem, &mut gdt, &mut state).is_err());
    }

    #[test]
    fn dispatch_exit_clears_running_and_sets_code() {
        let (mut regs, mut mem, mut gdt, mut state) = setup();
        let table = SyscallTable::new();
        regs.write_gpr32(GprIndex::Eax as u8, 0x01);
        regs.write_gpr32(GprIndex::Ebx as u8, 7);
        table.dispatch(&mut regs, &mut mem, &mut gdt, &mut state).unwrap();
        assert!(!state.running);
        assert_eq!(state.exit_code, 7);
    }
}
