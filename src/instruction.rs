//! Decoded x86 instruction representation.
//!
//! The decoder produces a `DecodedInst` that fully describes one instruction:
//! opcode, operands, prefix state and sizes. The executor consumes this
//! struct to carry out the operation; nothing here performs I/O.

use crate::flags::OperandSize;
use crate::registers::SegReg;

/// An x86 instruction fully decoded from its byte encoding.
#[derive(Debug, Clone)]
pub struct DecodedInst {
    /// Length of the encoded instruction in bytes.
    pub length: u8,

    /// Primary opcode byte. For two-byte opcodes (`0F xx`), stored as
    /// `0x0F00 | byte2`.
    pub opcode: u16,

    /// Which opcode map this instruction belongs to.
    pub opcode_map: OpcodeMap,

    /// Operand size, resolved from the 0x66 prefix against the 32-bit
    /// default.
    pub operand_size: OperandSize,

    /// Address size for memory operands, resolved from the 0x67 prefix.
    pub address_size: OperandSize,

    /// Decoded operands (x86 instructions here use at most 3).
    pub operands: [Operand; 3],

    /// Number of valid entries in `operands`.
    pub operand_count: u8,

    /// Prefix state (segment override, size overrides, repeat prefix).
    pub prefix: PrefixState,

    /// ModR/M byte, if one was consumed.
    pub modrm: Option<u8>,

    /// SIB byte, if one was consumed.
    pub sib: Option<u8>,

    /// Displacement value, sign-extended to i64.
    pub displacement: i64,

    /// Repeat prefix (0xF2/0xF3), a decoder-level concern; string-move
    /// handlers execute a single element per invocation regardless.
    pub rep: RepPrefix,
}

impl DecodedInst {
    /// A zeroed instruction, used by the decoder as its starting point.
    pub fn empty() -> Self {
        DecodedInst {
            length: 0,
            opcode: 0,
            opcode_map: OpcodeMap::Primary,
            operand_size: OperandSize::Dword,
            address_size: OperandSize::Dword,
            operands: [Operand::None, Operand::None, Operand::None],
            operand_count: 0,
            prefix: PrefixState::default(),
            modrm: None,
            sib: None,
            displacement: 0,
            rep: RepPrefix::None,
        }
    }

    /// The ModR/M reg field (bits 5:3).
    #[inline]
    pub fn modrm_reg(&self) -> u8 {
        self.modrm.map(|m| (m >> 3) & 7).unwrap_or(0)
    }

    /// The ModR/M r/m field (bits 2:0).
    #[inline]
    pub fn modrm_rm(&self) -> u8 {
        self.modrm.map(|m| m & 7).unwrap_or(0)
    }

    /// The ModR/M mod field (bits 7:6).
    #[inline]
    pub fn modrm_mod(&self) -> u8 {
        self.modrm.map(|m| (m >> 6) & 3).unwrap_or(0)
    }
}

/// Opcode map identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpcodeMap {
    /// One-byte opcodes (no escape prefix).
    Primary,
    /// Two-byte opcodes (`0F xx`).
    Secondary,
}

/// Decoded prefix state.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrefixState {
    /// Segment override (None = use the instruction's implicit default).
    pub seg_override: Option<SegReg>,
    /// Operand-size override (0x66 prefix).
    pub operand_size_override: bool,
    /// Address-size override (0x67 prefix).
    pub address_size_override: bool,
}

/// REP/REPNE prefix, relevant to string operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RepPrefix {
    /// No REP prefix.
    #[default]
    None,
    /// REP/REPE prefix (0xF3).
    Rep,
    /// REPNE prefix (0xF2).
    Repne,
}

/// An instruction operand.
#[derive(Debug, Clone, Copy)]
pub enum Operand {
    /// Unused operand slot.
    None,
    /// Register operand.
    Register(RegOperand),
    /// Memory operand (address from ModR/M + SIB + displacement).
    Memory(MemOperand),
    /// Immediate value.
    Immediate(u64),
    /// Relative branch offset (JMP/CALL/Jcc), sign-extended.
    RelativeOffset(i64),
}

/// Register operand sub-types.
#[derive(Debug, Clone, Copy)]
pub enum RegOperand {
    /// General-purpose register (0-7).
    Gpr(u8),
    /// Segment register.
    Seg(SegReg),
}

/// Memory operand (effective-address components, pre-computation).
#[derive(Debug, Clone, Copy)]
pub struct MemOperand {
    /// Base register index (None = no base register, e.g. disp32-only mode).
    pub base: Option<u8>,
    /// Index register index (None = no index register).
    pub index: Option<u8>,
    /// Scale factor (1, 2, 4, or 8).
    pub scale: u8,
    /// Displacement, sign-extended.
    pub displacement: i64,
    /// Segment used for this memory access absent an override prefix.
    pub segment: SegReg,
    /// Width of the memory access.
    pub size: OperandSize,
}
