//! Data movement instruction handlers.
//!
//! Implements MOV (register/memory and moffs forms), MOV r32, imm32, LEA,
//! XCHG, CBW/CWDE, CWD/CDQ, MOVZX/MOVSX, and the single-bit flag setters
//! CLC/STC/CMC/CLD/STD.

use super::{effective_address, gpr_index_of, read_operand, write_operand, Step};
use crate::error::Result;
use crate::flags::{self, OperandSize};
use crate::instruction::{DecodedInst, Operand};
use crate::memory::LinearMemory;
use crate::registers::{GprIndex, RegisterFile};

/// `88`/`89`/`8A`/`8B`/`A0..A3`/`C6`/`C7`: MOV, every r/m and moffs shape.
///
/// The decoder always places the destination in `operands[0]` and the
/// source in `operands[1]`, except for the moffs forms (`A0..A3`), which
/// carry only the memory side as `operands[0]`; direction there is inferred
/// from the opcode's direction bit (bit 1).
pub fn exec_mov(inst: &DecodedInst, regs: &mut RegisterFile, mem: &mut LinearMemory) -> Result<Step> {
    if (0xA0..=0xA3).contains(&inst.opcode) {
        let size = if inst.opcode & 1 == 0 { OperandSize::Byte } else { inst.operand_size };
        let to_accumulator = inst.opcode & 2 == 0;
        if to_accumulator {
            let val = read_operand(&inst.operands[0], regs, mem, size)?;
            regs.write_gpr(GprIndex::Eax as u8, size, val);
        } else {
            let val = regs.read_gpr(GprIndex::Eax as u8, size);
            write_operand(&inst.operands[0], regs, mem, size, val)?;
        }
        return Ok(Step::Next);
    }

    let size = super::operand_size_of(&inst.operands[0], inst.operand_size);
    let val = read_operand(&inst.operands[1], regs, mem, size)?;
    write_operand(&inst.operands[0], regs, mem, size, val)?;
    Ok(Step::Next)
}

/// `B0..BF`: MOV r8/r32, imm. Register index is the opcode's low 3 bits;
/// bit 3 selects an 8-bit destination (`B0..B7`) versus the full operand
/// size (`B8..BF`).
pub fn exec_mov_imm(inst: &DecodedInst, regs: &mut RegisterFile, _mem: &mut LinearMemory) -> Result<Step> {
    let idx = (inst.opcode & 0x07) as u8;
    let size = if inst.opcode < 0xB8 { OperandSize::Byte } else { inst.operand_size };
    let imm = match inst.operands[0] {
        Operand::Immediate(v) => v,
        _ => return Err(crate::error::VmError::DecoderInvariant("MOV r, imm missing immediate")),
    };
    regs.write_gpr(idx, size, imm);
    Ok(Step::Next)
}

/// `8D`: LEA. Computes the effective address of a memory operand without
/// accessing memory, and stores it in a general-purpose register. When the
/// address size is narrower than the operand size, the result is
/// zero-extended.
pub fn exec_lea(inst: &DecodedInst, regs: &mut RegisterFile, _mem: &mut LinearMemory) -> Result<Step> {
    let dst = gpr_index_of(&inst.operands[0])?;
    let src = match inst.operands[1] {
        Operand::Memory(m) => m,
        _ => return Err(crate::error::VmError::DecoderInvariant("LEA source must be a memory operand")),
    };
    let addr = effective_address(&src, regs);
    let addr = match inst.address_size {
        OperandSize::Word => addr & 0xFFFF,
        _ => addr,
    };
    regs.write_gpr(dst, inst.operand_size, addr as u64);
    Ok(Step::Next)
}

/// `86`/`87`: XCHG r/m, r.
pub fn exec_xchg(inst: &DecodedInst, regs: &mut RegisterFile, mem: &mut LinearMemory) -> Result<Step> {
    let size = super::operand_size_of(&inst.operands[0], inst.operand_size);
    let a = read_operand(&inst.operands[0], regs, mem, size)?;
    let b = read_operand(&inst.operands[1], regs, mem, size)?;
    write_operand(&inst.operands[0], regs, mem, size, b)?;
    write_operand(&inst.operands[1], regs, mem, size, a)?;
    Ok(Step::Next)
}

/// `91..97`: XCHG eAX, r32. `90` itself is NOP and handled by the dispatcher.
pub fn exec_xchg_eax(inst: &DecodedInst, regs: &mut RegisterFile, _mem: &mut LinearMemory) -> Result<Step> {
    let idx = (inst.opcode & 0x07) as u8;
    let size = inst.operand_size;
    let a = regs.read_gpr(GprIndex::Eax as u8, size);
    let b = regs.read_gpr(idx, size);
    regs.write_gpr(GprIndex::Eax as u8, size, b);
    regs.write_gpr(idx, size, a);
    Ok(Step::Next)
}

/// `98`: CBW/CWDE. Sign-extends AL into AX, or AX into EAX, depending on
/// the operand size.
pub fn exec_cbw_cwde(inst: &DecodedInst, regs: &mut RegisterFile) -> Result<Step> {
    match inst.operand_size {
        OperandSize::Word => {
            let al = regs.read_gpr8(GprIndex::Eax as u8) as i8;
            regs.write_gpr16(GprIndex::Eax as u8, al as i16 as u16);
        }
        _ => {
            let ax = regs.read_gpr16(GprIndex::Eax as u8) as i16;
            regs.write_gpr32(GprIndex::Eax as u8, ax as i32 as u32);
        }
    }
    Ok(Step::Next)
}

/// `99`: CWD/CDQ. Sign-extends AX into DX:AX, or EAX into EDX:EAX.
pub fn exec_cwd_cdq(inst: &DecodedInst, regs: &mut RegisterFile) -> Result<Step> {
    match inst.operand_size {
        OperandSize::Word => {
            let ax = regs.read_gpr16(GprIndex::Eax as u8) as i16;
            let dx = if ax < 0 { 0xFFFF } else { 0 };
            regs.write_gpr16(GprIndex::Edx as u8, dx);
        }
        _ => {
            let eax = regs.read_gpr32(GprIndex::Eax as u8) as i32;
            let edx = if eax < 0 { 0xFFFF_FFFF } else { 0 };
            regs.write_gpr32(GprIndex::Edx as u8, edx);
        }
    }
    Ok(Step::Next)
}

/// `0FB6`/`0FB7`: MOVZX. Source width is implied by the opcode (`B6` = byte,
/// `B7` = word) since a register operand alone carries no width.
pub fn exec_movzx(inst: &DecodedInst, regs: &mut RegisterFile, mem: &mut LinearMemory) -> Result<Step> {
    let dst = gpr_index_of(&inst.operands[0])?;
    let src_size = if inst.opcode & 1 == 0 { OperandSize::Byte } else { OperandSize::Word };
    let src = read_operand(&inst.operands[1], regs, mem, src_size)?;
    regs.write_gpr(dst, inst.operand_size, src);
    Ok(Step::Next)
}

/// `0FBE`/`0FBF`: MOVSX. Source width is implied by the opcode (`BE` = byte,
/// `BF` = word); the value is sign-extended to the destination's width.
pub fn exec_movsx(inst: &DecodedInst, regs: &mut RegisterFile, mem: &mut LinearMemory) -> Result<Step> {
    let dst = gpr_index_of(&inst.operands[0])?;
    let src_size = if inst.opcode & 1 == 0 { OperandSize::Byte } else { OperandSize::Word };
    let src = read_operand(&inst.operands[1], regs, mem, src_size)?;
    let extended = match src_size {
        OperandSize::Byte => src as u8 as i8 as i32 as u32 as u64,
        OperandSize::Word => src as u16 as i16 as i32 as u32 as u64,
        OperandSize::Dword => src,
    };
    regs.write_gpr(dst, inst.operand_size, extended);
    Ok(Step::Next)
}

/// `F8`: CLC.
pub fn exec_clc(regs: &mut RegisterFile) -> Result<Step> {
    regs.eflags_set(flags::CF, false);
    Ok(Step::Next)
}

/// `F9`: STC.
pub fn exec_stc(regs: &mut RegisterFile) -> Result<Step> {
    regs.eflags_set(flags::CF, true);
    Ok(Step::Next)
}

/// `F5`: CMC.
pub fn exec_cmc(regs: &mut RegisterFile) -> Result<Step> {
    let cf = regs.eflags_get(flags::CF);
    regs.eflags_set(flags::CF, !cf);
    Ok(Step::Next)
}

/// `FC`: CLD.
pub fn exec_cld(regs: &mut RegisterFile) -> Result<Step> {
    regs.eflags_set(flags::DF, false);
    Ok(Step::Next)
}

/// `FD`: STD.
pub fn exec_std(regs: &mut RegisterFile) -> Result<Step> {
    regs.eflags_set(flags::DF, true);
    Ok(Step::Next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::{MemOperand, OpcodeMap, RegOperand};
    use crate::registers::SegReg;

    fn new_inst(opcode: u16) -> DecodedInst {
        let mut inst = DecodedInst::empty();
        inst.opcode = opcode;
        inst.opcode_map = if opcode > 0xFF { OpcodeMap::Secondary } else { OpcodeMap::Primary };
        inst
    }

    #[test]
    fn mov_reg_to_reg_copies_value() {
        let mut regs = RegisterFile::new();
        let mut mem = LinearMemory::new(0x1000);
        regs.write_gpr32(GprIndex::Ecx as u8, 0xCAFEBABE);
        let mut inst = new_inst(0x89);
        inst.operand_size = OperandSize::Dword;
        inst.operands[0] = Operand::Register(RegOperand::Gpr(GprIndex::Eax as u8));
        inst.operands[1] = Operand::Register(RegOperand::Gpr(GprIndex::Ecx as u8));
        exec_mov(&inst, &mut regs, &mut mem).unwrap();
        assert_eq!(regs.read_gpr32(GprIndex::Eax as u8), 0xCAFEBABE);
    }

    #[test]
    fn lea_computes_address_without_touching_memory() {
        let mut regs = RegisterFile::new();
        let mut mem = LinearMemory::new(0x1000);
        regs.load_segment_flat(SegReg::Ds, 0x2B);
        regs.write_gpr32(GprIndex::Ebx as u8, 0x100);
        let mut inst = new_inst(0x8D);
        inst.operand_size = OperandSize::Dword;
        inst.address_size = OperandSize::Dword;
        inst.operands[0] = Operand::Register(RegOperand::Gpr(GprIndex::Eax as u8));
        inst.operands[1] = Operand::Memory(MemOperand {
            base: Some(GprIndex::Ebx as u8),
            index: None,
            scale: 1,
            displacement: 8,
            segment: SegReg::Ds,
            size: OperandSize::Dword,
        });
        exec_lea(&inst, &mut regs, &mut mem).unwrap();
        assert_eq!(regs.read_gpr32(GprIndex::Eax as u8), 0x108);
    }

    #[test]
    fn cwde_sign_extends_negative_ax() {
        let mut regs = RegisterFile::new();
        regs.write_gpr16(GprIndex::Eax as u8, 0x8000);
        let mut inst = new_inst(0x98);
        inst.operand_size = OperandSize::Dword;
        exec_cbw_cwde(&inst, &mut regs).unwrap();
        assert_eq!(regs.read_gpr32(GprIndex::Eax as u8), 0xFFFF_8000);
    }

    #[test]
    fn cdq_splits_sign_into_edx() {
        let mut regs = RegisterFile::new();
        regs.write_gpr32(GprIndex::Eax as u8, 0x8000_0000);
        let mut inst = new_inst(0x99);
        inst.operand_size = OperandSize::Dword;
        exec_cwd_cdq(&inst, &mut regs).unwrap();
        assert_eq!(regs.read_gpr32(GprIndex::Edx as u8), 0xFFFF_FFFF);
    }

    #[test]
    fn movzx_zero_extends_byte_source() {
        let mut regs = RegisterFile::new();
        let mut mem = LinearMemory::new(0x1000);
        regs.write_gpr32(GprIndex::Ecx as u8, 0xFF);
        let mut inst = new_inst(0x0FB6);
        inst.operand_size = OperandSize::Dword;
        inst.operands[0] = Operand::Register(RegOperand::Gpr(GprIndex::Eax as u8));
        inst.operands[1] = Operand::Register(RegOperand::Gpr(GprIndex::Ecx as u8));
        exec_movzx(&inst, &mut regs, &mut mem).unwrap();
        assert_eq!(regs.read_gpr32(GprIndex::Eax as u8), 0xFF);
    }

    #[test]
    fn movsx_sign_extends_negative_byte() {
        let mut regs = RegisterFile::new();
        let mut mem = LinearMemory::new(0x1000);
        regs.write_gpr32(GprIndex::Ecx as u8, 0xFF);
        let mut inst = new_inst(0x0FBE);
        inst.operand_size = OperandSize::Dword;
        inst.operands[0] = Operand::Register(RegOperand::Gpr(GprIndex::Eax as u8));
        inst.operands[1] = Operand::Register(RegOperand::Gpr(GprIndex::Ecx as u8));
        exec_movsx(&inst, &mut regs, &mut mem).unwrap();
        assert_eq!(regs.read_gpr32(GprIndex::Eax as u8), 0xFFFF_FFFF);
    }
}
