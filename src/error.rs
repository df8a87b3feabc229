//! Error types for the emulator core.
//!
//! `VmError` is the single fatal-error type threaded through the decoder,
//! executor and CPU loop. Recoverable syscall failures never produce a
//! `VmError` — they are mapped to a negative return value in EAX instead.

use thiserror::Error;

/// Fatal errors that halt emulation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VmError {
    /// No decoder handler claimed this opcode (or opcode-group slot).
    #[error("illegal instruction 0x{opcode:02X} at eip=0x{eip:08X}")]
    IllegalInstruction { opcode: u16, eip: u32 },

    /// An access (read or write) fell outside the bounds of linear memory.
    #[error("memory fault: {access} access of {len} byte(s) at 0x{addr:08X}")]
    MemoryFault {
        addr: u32,
        len: u32,
        access: AccessKind,
    },

    /// `int 0x80` was executed with an EAX value not present in the syscall
    /// registration table.
    #[error("unsupported syscall number {0} (0x{0:X})")]
    UnsupportedSyscall(u32),

    /// The decoder reached a state that should be unreachable by construction
    /// (e.g. a ModR/M mod field outside 0..=3). Indicates a bug in this crate,
    /// not in the guest program.
    #[error("decoder invariant violated: {0}")]
    DecoderInvariant(&'static str),

    /// The guest executed `HLT` or an equivalent halting condition outside of
    /// a syscall-driven exit. Not produced by the current instruction set but
    /// kept as a distinct, matchable exit reason.
    #[error("cpu halted")]
    Halted,

    /// The instruction-count safety limit configured by the runner was
    /// exceeded; used to terminate runaway/looping guests under test.
    #[error("instruction limit exceeded")]
    InstructionLimitExceeded,
}

/// Which direction a faulting memory access was.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
}

impl core::fmt::Display for AccessKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            AccessKind::Read => write!(f, "read"),
            AccessKind::Write => write!(f, "write"),
        }
    }
}

/// Errors raised while loading an ELF image, before emulation starts.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to parse ELF file: {0}")]
    Parse(#[from] elf::ParseError),

    #[error("unsupported ELF class: expected ELFCLASS32")]
    WrongClass,

    #[error("unsupported machine type: expected EM_386")]
    WrongMachine,

    #[error("unsupported ELF type: expected ET_EXEC (statically linked)")]
    NotStaticExecutable,

    #[error("binary requires a dynamic linker (PT_INTERP present), which is out of scope")]
    DynamicallyLinked,

    #[error("segment at vaddr 0x{vaddr:08X} (size 0x{size:X}) does not fit in guest memory")]
    SegmentOutOfRange { vaddr: u64, size: u64 },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Convenience result alias for fallible VM operations.
pub type Result<T> = core::result::Result<T, VmError>;
