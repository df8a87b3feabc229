//! ia32run — a user-mode emulator for a subset of 32-bit IA-32, for running
//! statically linked Linux/i386 ELF binaries.
//!
//! Provides a software x86 CPU sufficient to execute user-mode code: the
//! general-purpose/segment/EFLAGS register file, a flat linear address
//! space, a decoder covering the integer instruction set these binaries
//! need, and a syscall layer that translates the ~20 Linux syscalls such
//! binaries actually make into host I/O.
//!
//! Deliberately out of scope: privileged-mode emulation, paging/an MMU,
//! hardware interrupts, floating-point and SIMD, multithreading,
//! self-modifying-code caches, a JIT, and compatibility with any kernel
//! beyond the syscalls implemented here.
//!
//! # Architecture
//!
//! - **Registers** (`registers.rs`) — GPRs, segment selectors, EFLAGS.
//! - **Flags** (`flags.rs`) — EFLAGS bit semantics and condition codes.
//! - **Decoder** (`decoder.rs`) — ModR/M + SIB parsing, prefix handling,
//!   opcode tables.
//! - **Executor** (`executor/`) — instruction semantics grouped by family.
//! - **Memory** (`memory/`) — flat guest linear memory.
//! - **GDT** (`gdt.rs`) — the packed segment-descriptor table.
//! - **Syscalls** (`syscall.rs`, `descriptor.rs`) — the `int 0x80` gate and
//!   its handlers.
//! - **ELF loader** (`elf_loader.rs`) — maps a static executable into guest
//!   memory.
//! - **CPU** (`cpu.rs`) — ties the above into the fetch-decode-execute loop.

pub mod cpu;
pub mod decoder;
pub mod descriptor;
pub mod elf_loader;
pub mod error;
pub mod executor;
pub mod flags;
pub mod gdt;
pub mod instruction;
pub mod memory;
pub mod registers;
pub mod syscall;

pub use cpu::{Cpu, ExitReason};
pub use error::{LoadError, VmError};
