//! x86 instruction decoder (32-bit protected mode only).
//!
//! Decodes raw instruction bytes from linear memory into [`DecodedInst`]
//! structs the executor can consume. Handles the primary opcode map and the
//! two-byte (`0F xx`) escape needed to run statically linked 32-bit Linux
//! binaries.
//!
//! The decoder operates in three phases:
//!
//! 1. **Prefix parsing** — segment-override, operand-size, address-size, and
//!    repeat prefixes.
//! 2. **Opcode fetch** — one-byte or two-byte (`0F xx`) opcodes.
//! 3. **Operand decoding** — ModR/M, SIB, displacement, and immediate fields.
//!
//! This module only determines instruction *shape*: which bytes were
//! consumed and what their operands are. Opcode-specific semantics — which
//! ModR/M `reg` value means ADD vs. AND, for instance — are resolved by the
//! executor, which is handed the full `DecodedInst` including the raw
//! ModR/M byte.

use crate::error::{Result, VmError};
use crate::flags::OperandSize;
use crate::instruction::{DecodedInst, MemOperand, OpcodeMap, Operand, RegOperand, RepPrefix};
use crate::memory::LinearMemory;
use crate::registers::SegReg;

/// Maximum x86 instruction length this decoder will consume before giving up
/// (the architectural limit is 15 bytes).
const MAX_INST_LEN: u32 = 15;

/// Stateless 32-bit x86 instruction decoder.
///
/// The decoder borrows guest memory and produces a fully decoded
/// [`DecodedInst`] describing the instruction at a given EIP; it never
/// mutates CPU state itself.
pub struct Decoder;

impl Decoder {
    /// Create a new decoder. Stateless — kept as a type for symmetry with
    /// the executor, and in case future prefix-persisting modes are added.
    pub fn new() -> Self {
        Decoder
    }

    /// Decode one instruction starting at `eip`.
    ///
    /// Returns a [`DecodedInst`] describing the opcode, operands, prefixes,
    /// and byte length of the instruction. The caller advances EIP by
    /// `inst.length` before executing (control-transfer handlers may then
    /// overwrite EIP again).
    pub fn decode(&self, mem: &LinearMemory, eip: u32) -> Result<DecodedInst> {
        let mut cur = DecodeCursor::new(mem, eip);
        cur.decode_instruction()
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Internal cursor tracking position within the instruction byte stream and
/// accumulating decoded fields.
struct DecodeCursor<'m> {
    mem: &'m LinearMemory,
    start_eip: u32,
    pos: u32,
    inst: DecodedInst,
}

impl<'m> DecodeCursor<'m> {
    fn new(mem: &'m LinearMemory, eip: u32) -> Self {
        DecodeCursor {
            mem,
            start_eip: eip,
            pos: eip,
            inst: DecodedInst::empty(),
        }
    }

    // ── byte fetching ──

    fn fetch_u8(&mut self) -> Result<u8> {
        if self.pos.wrapping_sub(self.start_eip) >= MAX_INST_LEN {
            return Err(VmError::DecoderInvariant("instruction exceeds 15 bytes"));
        }
        let b = self.mem.get(self.pos, 1)?[0];
        self.pos = self.pos.wrapping_add(1);
        Ok(b)
    }

    fn fetch_u16(&mut self) -> Result<u16> {
        let lo = self.fetch_u8()? as u16;
        let hi = self.fetch_u8()? as u16;
        Ok(lo | (hi << 8))
    }

    fn fetch_u32(&mut self) -> Result<u32> {
        let lo = self.fetch_u16()? as u32;
        let hi = self.fetch_u16()? as u32;
        Ok(lo | (hi << 16))
    }

    fn fetch_imm(&mut self, size: OperandSize) -> Result<u64> {
        match size {
            OperandSize::Byte => Ok(self.fetch_u8()? as i8 as i64 as u64),
            OperandSize::Word => Ok(self.fetch_u16()? as i16 as i64 as u64),
            OperandSize::Dword => Ok(self.fetch_u32()? as i32 as i64 as u64),
        }
    }

    fn fetch_imm_zx(&mut self, size: OperandSize) -> Result<u64> {
        match size {
            OperandSize::Byte => Ok(self.fetch_u8()? as u64),
            OperandSize::Word => Ok(self.fetch_u16()? as u64),
            OperandSize::Dword => Ok(self.fetch_u32()? as u64),
        }
    }

    // ── prefixes ──

    fn parse_prefixes(&mut self) -> Result<()> {
        loop {
            let b = self.mem.get(self.pos, 1)?[0];
            match b {
                0x26 => {
                    self.inst.prefix.seg_override = Some(SegReg::Es);
                }
                0x2E => {
                    self.inst.prefix.seg_override = Some(SegReg::Cs);
                }
                0x36 => {
                    self.inst.prefix.seg_override = Some(SegReg::Ss);
                }
                0x3E => {
                    self.inst.prefix.seg_override = Some(SegReg::Ds);
                }
                0x64 => {
                    self.inst.prefix.seg_override = Some(SegReg::Fs);
                }
                0x65 => {
                    self.inst.prefix.seg_override = Some(SegReg::Gs);
                }
                0x66 => {
                    self.inst.prefix.operand_size_override = true;
                }
                0x67 => {
                    self.inst.prefix.address_size_override = true;
                }
                0xF0 => { /* LOCK: accepted, not enforced (single-threaded) */ }
                0xF2 => {
                    self.inst.rep = RepPrefix::Repne;
                }
                0xF3 => {
                    self.inst.rep = RepPrefix::Rep;
                }
                _ => break,
            }
            self.pos = self.pos.wrapping_add(1);
        }
        self.inst.operand_size = if self.inst.prefix.operand_size_override {
            OperandSize::Word
        } else {
            OperandSize::Dword
        };
        self.inst.address_size = if self.inst.prefix.address_size_override {
            OperandSize::Word
        } else {
            OperandSize::Dword
        };
        Ok(())
    }

    // ── ModR/M + SIB ──

    /// Decode ModR/M (and SIB/displacement if present). Returns the `reg`
    /// field and the r/m [`Operand`].
    fn decode_modrm(&mut self, size: OperandSize) -> Result<(u8, Operand)> {
        let modrm = self.fetch_u8()?;
        self.inst.modrm = Some(modrm);
        let md = (modrm >> 6) & 3;
        let reg = (modrm >> 3) & 7;
        let rm = modrm & 7;

        if md == 3 {
            return Ok((reg, Operand::Register(RegOperand::Gpr(rm))));
        }

        let (base, index, scale, mut disp) = if rm == 4 {
            // SIB byte follows.
            let sib = self.fetch_u8()?;
            self.inst.sib = Some(sib);
            let ss = (sib >> 6) & 3;
            let idx = (sib >> 3) & 7;
            let bse = sib & 7;
            let scale = 1u8 << ss;
            let index = if idx == 4 { None } else { Some(idx) };
            let base = if bse == 5 && md == 0 { None } else { Some(bse) };
            (base, index, scale, 0i64)
        } else if rm == 5 && md == 0 {
            // disp32-only addressing (no base).
            (None, None, 1u8, 0i64)
        } else {
            (Some(rm), None, 1u8, 0i64)
        };

        disp = match md {
            0 => {
                if (rm == 5 && self.inst.sib.is_none()) || (self.inst.sib.is_some() && base.is_none()) {
                    self.fetch_u32()? as i32 as i64
                } else {
                    disp
                }
            }
            1 => self.fetch_u8()? as i8 as i64,
            2 => self.fetch_u32()? as i32 as i64,
            _ => unreachable!(),
        };

        let segment = self.inst.prefix.seg_override.unwrap_or_else(|| {
            if base == Some(4) || base == Some(5) {
                // ESP/EBP-based addressing defaults to the stack segment.
                SegReg::Ss
            } else {
                SegReg::Ds
            }
        });

        Ok((
            reg,
            Operand::Memory(MemOperand {
                base,
                index,
                scale,
                displacement: disp,
                segment,
                size,
            }),
        ))
    }

    // ── top-level dispatch ──

    fn decode_instruction(mut self) -> Result<DecodedInst> {
        self.parse_prefixes()?;

        let op1 = self.fetch_u8()?;
        if op1 == 0x0F {
            let op2 = self.fetch_u8()?;
            self.inst.opcode = 0x0F00 | op2 as u16;
            self.inst.opcode_map = OpcodeMap::Secondary;
            self.decode_secondary(op2)?;
        } else {
            self.inst.opcode = op1 as u16;
            self.inst.opcode_map = OpcodeMap::Primary;
            self.decode_primary(op1)?;
        }

        self.inst.length = (self.pos - self.start_eip) as u8;
        Ok(self.inst)
    }

    fn push_operand(&mut self, op: Operand) {
        let n = self.inst.operand_count as usize;
        self.inst.operands[n] = op;
        self.inst.operand_count += 1;
    }

    fn size8_or(&self, op: u8) -> OperandSize {
        if op & 1 == 0 {
            OperandSize::Byte
        } else {
            self.inst.operand_size
        }
    }

    /// Decode the common "ALU r/m, reg" family: opcode low 3 bits select
    /// direction/width (`00`=Eb,Gb `01`=Ev,Gv `02`=Gb,Eb `03`=Gv,Ev
    /// `04`=AL,ib `05`=eAX,iz).
    fn decode_alu_family(&mut self, op: u8) -> Result<()> {
        match op & 0x07 {
            0x00 | 0x01 => {
                let size = self.size8_or(op);
                let (reg, rm) = self.decode_modrm(size)?;
                self.push_operand(rm);
                self.push_operand(Operand::Register(RegOperand::Gpr(reg)));
            }
            0x02 | 0x03 => {
                let size = self.size8_or(op);
                let (reg, rm) = self.decode_modrm(size)?;
                self.push_operand(Operand::Register(RegOperand::Gpr(reg)));
                self.push_operand(rm);
            }
            0x04 => {
                self.push_operand(Operand::Register(RegOperand::Gpr(0)));
                let imm = self.fetch_imm(OperandSize::Byte)?;
                self.push_operand(Operand::Immediate(imm));
            }
            0x05 => {
                self.push_operand(Operand::Register(RegOperand::Gpr(0)));
                let imm = self.fetch_imm(self.inst.operand_size)?;
                self.push_operand(Operand::Immediate(imm));
            }
            _ => unreachable!(),
        }
        Ok(())
    }

    fn decode_primary(&mut self, op: u8) -> Result<()> {
        match op {
            // ADD/OR/ADC/SBB/AND/SUB/XOR/CMP r/m,reg families (8 groups of 6
            // opcodes each, skipping the two segment-prefix slots at +6/+7
            // which primary decoding never sees as opcodes here).
            0x00..=0x05
            | 0x08..=0x0D
            | 0x10..=0x15
            | 0x18..=0x1D
            | 0x20..=0x25
            | 0x28..=0x2D
            | 0x30..=0x35
            | 0x38..=0x3D => self.decode_alu_family(op),

            // INC r32 / DEC r32
            0x40..=0x4F => Ok(()),

            // PUSH r32 / POP r32
            0x50..=0x5F => Ok(()),

            // PUSHA/PUSHAD, POPA/POPAD
            0x60 | 0x61 => Ok(()),

            // PUSH imm32
            0x68 => {
                let imm = self.fetch_imm(self.inst.operand_size)?;
                self.push_operand(Operand::Immediate(imm));
                Ok(())
            }
            // PUSH imm8 (sign-extended)
            0x6A => {
                let imm = self.fetch_imm(OperandSize::Byte)?;
                self.push_operand(Operand::Immediate(imm));
                Ok(())
            }

            // Jcc rel8
            0x70..=0x7F => {
                let rel = self.fetch_u8()? as i8 as i64;
                self.push_operand(Operand::RelativeOffset(rel));
                Ok(())
            }

            // Group1: ADD/OR/ADC/SBB/AND/SUB/XOR/CMP r/m, imm
            0x80 => {
                let (_reg, rm) = self.decode_modrm(OperandSize::Byte)?;
                self.push_operand(rm);
                let imm = self.fetch_imm_zx(OperandSize::Byte)?;
                self.push_operand(Operand::Immediate(imm));
                Ok(())
            }
            0x81 => {
                let (_reg, rm) = self.decode_modrm(self.inst.operand_size)?;
                self.push_operand(rm);
                let imm = self.fetch_imm(self.inst.operand_size)?;
                self.push_operand(Operand::Immediate(imm));
                Ok(())
            }
            0x83 => {
                let (_reg, rm) = self.decode_modrm(self.inst.operand_size)?;
                self.push_operand(rm);
                let imm = self.fetch_imm(OperandSize::Byte)?;
                self.push_operand(Operand::Immediate(imm));
                Ok(())
            }

            // TEST r/m, reg
            0x84 | 0x85 => {
                let size = self.size8_or(op);
                let (reg, rm) = self.decode_modrm(size)?;
                self.push_operand(rm);
                self.push_operand(Operand::Register(RegOperand::Gpr(reg)));
                Ok(())
            }

            // XCHG r/m, reg
            0x86 | 0x87 => {
                let size = self.size8_or(op);
                let (reg, rm) = self.decode_modrm(size)?;
                self.push_operand(rm);
                self.push_operand(Operand::Register(RegOperand::Gpr(reg)));
                Ok(())
            }

            // MOV r/m,reg (88/89) and reg,r/m (8A/8B)
            0x88 | 0x89 => {
                let size = self.size8_or(op);
                let (reg, rm) = self.decode_modrm(size)?;
                self.push_operand(rm);
                self.push_operand(Operand::Register(RegOperand::Gpr(reg)));
                Ok(())
            }
            0x8A | 0x8B => {
                let size = self.size8_or(op);
                let (reg, rm) = self.decode_modrm(size)?;
                self.push_operand(Operand::Register(RegOperand::Gpr(reg)));
                self.push_operand(rm);
                Ok(())
            }

            // MOV r/m16, Sreg and MOV Sreg, r/m16 — segment registers are
            // not user-settable targets in this emulator; decoded for shape
            // completeness but rejected at execution time.
            0x8C | 0x8E => {
                let (reg, rm) = self.decode_modrm(OperandSize::Word)?;
                self.push_operand(rm);
                self.push_operand(Operand::Register(RegOperand::Seg(
                    SegReg::from_encoding(reg).unwrap_or(SegReg::Ds),
                )));
                Ok(())
            }

            // LEA
            0x8D => {
                let (reg, rm) = self.decode_modrm(self.inst.operand_size)?;
                self.push_operand(Operand::Register(RegOperand::Gpr(reg)));
                self.push_operand(rm);
                Ok(())
            }

            // POP r/m32 (Group 1A)
            0x8F => {
                let (_reg, rm) = self.decode_modrm(self.inst.operand_size)?;
                self.push_operand(rm);
                Ok(())
            }

            // NOP / XCHG eAX,eAX
            0x90 => Ok(()),
            // XCHG eAX, r32
            0x91..=0x97 => Ok(()),

            // CBW/CWDE, CWD/CDQ
            0x98 | 0x99 => Ok(()),

            // PUSHF/PUSHFD, POPF/POPFD
            0x9C | 0x9D => Ok(()),

            // MOV AL/eAX, moffs and moffs, AL/eAX
            0xA0..=0xA3 => {
                let size = self.size8_or(op);
                let addr = self.fetch_u32()?;
                self.push_operand(Operand::Memory(MemOperand {
                    base: None,
                    index: None,
                    scale: 1,
                    displacement: addr as i64,
                    segment: self.inst.prefix.seg_override.unwrap_or(SegReg::Ds),
                    size,
                }));
                Ok(())
            }

            // MOVSB/MOVSD
            0xA4 | 0xA5 => Ok(()),

            // MOV r8, imm8
            0xB0..=0xB7 => {
                let imm = self.fetch_imm_zx(OperandSize::Byte)?;
                self.push_operand(Operand::Immediate(imm));
                Ok(())
            }
            // MOV r32, imm32
            0xB8..=0xBF => {
                let imm = self.fetch_imm_zx(self.inst.operand_size)?;
                self.push_operand(Operand::Immediate(imm));
                Ok(())
            }

            // Group2 shift r/m, imm8
            0xC0 => {
                let (_reg, rm) = self.decode_modrm(OperandSize::Byte)?;
                self.push_operand(rm);
                let imm = self.fetch_imm_zx(OperandSize::Byte)?;
                self.push_operand(Operand::Immediate(imm));
                Ok(())
            }
            0xC1 => {
                let (_reg, rm) = self.decode_modrm(self.inst.operand_size)?;
                self.push_operand(rm);
                let imm = self.fetch_imm_zx(OperandSize::Byte)?;
                self.push_operand(Operand::Immediate(imm));
                Ok(())
            }

            // RET / RET imm16
            0xC2 => {
                let imm = self.fetch_u16()?;
                self.push_operand(Operand::Immediate(imm as u64));
                Ok(())
            }
            0xC3 => Ok(()),

            // MOV r/m, imm (Group 11)
            0xC6 => {
                let (_reg, rm) = self.decode_modrm(OperandSize::Byte)?;
                self.push_operand(rm);
                let imm = self.fetch_imm_zx(OperandSize::Byte)?;
                self.push_operand(Operand::Immediate(imm));
                Ok(())
            }
            0xC7 => {
                let (_reg, rm) = self.decode_modrm(self.inst.operand_size)?;
                self.push_operand(rm);
                let imm = self.fetch_imm_zx(self.inst.operand_size)?;
                self.push_operand(Operand::Immediate(imm));
                Ok(())
            }

            // LEAVE
            0xC9 => Ok(()),

            // INT imm8
            0xCD => {
                let imm = self.fetch_u8()?;
                self.push_operand(Operand::Immediate(imm as u64));
                Ok(())
            }

            // Group2 shift r/m, 1
            0xD0 => {
                let (_reg, rm) = self.decode_modrm(OperandSize::Byte)?;
                self.push_operand(rm);
                self.push_operand(Operand::Immediate(1));
                Ok(())
            }
            0xD1 => {
                let (_reg, rm) = self.decode_modrm(self.inst.operand_size)?;
                self.push_operand(rm);
                self.push_operand(Operand::Immediate(1));
                Ok(())
            }
            // Group2 shift r/m, CL
            0xD2 => {
                let (_reg, rm) = self.decode_modrm(OperandSize::Byte)?;
                self.push_operand(rm);
                self.push_operand(Operand::Register(RegOperand::Gpr(1)));
                Ok(())
            }
            0xD3 => {
                let (_reg, rm) = self.decode_modrm(self.inst.operand_size)?;
                self.push_operand(rm);
                self.push_operand(Operand::Register(RegOperand::Gpr(1)));
                Ok(())
            }

            // LOOPNE/LOOPE/LOOP/JECXZ rel8
            0xE0..=0xE3 => {
                let rel = self.fetch_u8()? as i8 as i64;
                self.push_operand(Operand::RelativeOffset(rel));
                Ok(())
            }

            // CALL rel32
            0xE8 => {
                let rel = self.fetch_u32()? as i32 as i64;
                self.push_operand(Operand::RelativeOffset(rel));
                Ok(())
            }
            // JMP rel32
            0xE9 => {
                let rel = self.fetch_u32()? as i32 as i64;
                self.push_operand(Operand::RelativeOffset(rel));
                Ok(())
            }
            // JMP rel8
            0xEB => {
                let rel = self.fetch_u8()? as i8 as i64;
                self.push_operand(Operand::RelativeOffset(rel));
                Ok(())
            }

            // HLT
            0xF4 => Ok(()),

            // Group3: TEST/NOT/NEG r/m (reg field disambiguates in the
            // executor; TEST additionally consumes an immediate).
            0xF6 => {
                let (reg, rm) = self.decode_modrm(OperandSize::Byte)?;
                self.push_operand(rm);
                if reg == 0 || reg == 1 {
                    let imm = self.fetch_imm_zx(OperandSize::Byte)?;
                    self.push_operand(Operand::Immediate(imm));
                }
                Ok(())
            }
            0xF7 => {
                let (reg, rm) = self.decode_modrm(self.inst.operand_size)?;
                self.push_operand(rm);
                if reg == 0 || reg == 1 {
                    let imm = self.fetch_imm_zx(self.inst.operand_size)?;
                    self.push_operand(Operand::Immediate(imm));
                }
                Ok(())
            }

            // CLC/STC/CMC
            0xF8 | 0xF9 | 0xF5 => Ok(()),
            // CLD/STD
            0xFC | 0xFD => Ok(()),

            // Group4: INC/DEC r/m8
            0xFE => {
                let (_reg, rm) = self.decode_modrm(OperandSize::Byte)?;
                self.push_operand(rm);
                Ok(())
            }
            // Group5: INC/DEC/CALL/JMP/PUSH r/m32
            0xFF => {
                let (_reg, rm) = self.decode_modrm(self.inst.operand_size)?;
                self.push_operand(rm);
                Ok(())
            }

            _ => Err(VmError::IllegalInstruction {
                opcode: op as u16,
                eip: self.start_eip,
            }),
        }
    }

    fn decode_secondary(&mut self, op: u8) -> Result<()> {
        match op {
            // Jcc rel32
            0x80..=0x8F => {
                let rel = self.fetch_u32()? as i32 as i64;
                self.push_operand(Operand::RelativeOffset(rel));
                Ok(())
            }

            // SHLD r/m,reg,imm8 / CL
            0xA4 => {
                let (reg, rm) = self.decode_modrm(self.inst.operand_size)?;
                self.push_operand(rm);
                self.push_operand(Operand::Register(RegOperand::Gpr(reg)));
                let imm = self.fetch_imm_zx(OperandSize::Byte)?;
                self.push_operand(Operand::Immediate(imm));
                Ok(())
            }
            0xA5 => {
                let (reg, rm) = self.decode_modrm(self.inst.operand_size)?;
                self.push_operand(rm);
                self.push_operand(Operand::Register(RegOperand::Gpr(reg)));
                self.push_operand(Operand::Register(RegOperand::Gpr(1)));
                Ok(())
            }
            // SHRD r/m,reg,imm8 / CL
            0xAC => {
                let (reg, rm) = self.decode_modrm(self.inst.operand_size)?;
                self.push_operand(rm);
                self.push_operand(Operand::Register(RegOperand::Gpr(reg)));
                let imm = self.fetch_imm_zx(OperandSize::Byte)?;
                self.push_operand(Operand::Immediate(imm));
                Ok(())
            }
            0xAD => {
                let (reg, rm) = self.decode_modrm(self.inst.operand_size)?;
                self.push_operand(rm);
                self.push_operand(Operand::Register(RegOperand::Gpr(reg)));
                self.push_operand(Operand::Register(RegOperand::Gpr(1)));
                Ok(())
            }

            // CMPXCHG r/m, reg
            0xB0 => {
                let (reg, rm) = self.decode_modrm(OperandSize::Byte)?;
                self.push_operand(rm);
                self.push_operand(Operand::Register(RegOperand::Gpr(reg)));
                Ok(())
            }
            0xB1 => {
                let (reg, rm) = self.decode_modrm(self.inst.operand_size)?;
                self.push_operand(rm);
                self.push_operand(Operand::Register(RegOperand::Gpr(reg)));
                Ok(())
            }

            // MOVZX r, r/m8 / r/m16
            0xB6 => {
                let (reg, rm) = self.decode_modrm(OperandSize::Byte)?;
                self.push_operand(Operand::Register(RegOperand::Gpr(reg)));
                self.push_operand(rm);
                Ok(())
            }
            0xB7 => {
                let (reg, rm) = self.decode_modrm(OperandSize::Word)?;
                self.push_operand(Operand::Register(RegOperand::Gpr(reg)));
                self.push_operand(rm);
                Ok(())
            }

            // BSF r, r/m
            0xBC => {
                let (reg, rm) = self.decode_modrm(self.inst.operand_size)?;
                self.push_operand(Operand::Register(RegOperand::Gpr(reg)));
                self.push_operand(rm);
                Ok(())
            }

            // MOVSX r, r/m8 / r/m16
            0xBE => {
                let (reg, rm) = self.decode_modrm(OperandSize::Byte)?;
                self.push_operand(Operand::Register(RegOperand::Gpr(reg)));
                self.push_operand(rm);
                Ok(())
            }
            0xBF => {
                let (reg, rm) = self.decode_modrm(OperandSize::Word)?;
                self.push_operand(Operand::Register(RegOperand::Gpr(reg)));
                self.push_operand(rm);
                Ok(())
            }

            _ => Err(VmError::IllegalInstruction {
                opcode: 0x0F00 | op as u16,
                eip: self.start_eip,
            }),
        }
    }
}
