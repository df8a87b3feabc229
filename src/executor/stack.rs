//! Stack instruction handlers.
//!
//! Implements PUSH/POP (register, immediate, and r/m forms), PUSHF/PUSHFD,
//! POPF/POPFD, PUSHA/PUSHAD, POPA/POPAD, and LEAVE.

use super::{operand_size_of, pop, push, read_operand, write_operand, Step};
use crate::error::Result;
use crate::flags::OperandSize;
use crate::instruction::{DecodedInst, Operand};
use crate::memory::LinearMemory;
use crate::registers::{GprIndex, RegisterFile};

/// `50..5F`: PUSH r32 (50-57) / POP r32 (58-5F), register encoded in the
/// opcode's low 3 bits.
pub fn exec_push_pop_reg(inst: &DecodedInst, regs: &mut RegisterFile, mem: &mut LinearMemory) -> Result<Step> {
    let idx = (inst.opcode & 0x07) as u8;
    let size = inst.operand_size;
    if inst.opcode < 0x58 {
        let val = regs.read_gpr(idx, size);
        push(regs, mem, size, val)?;
    } else {
        let val = pop(regs, mem, size)?;
        regs.write_gpr(idx, size, val);
    }
    Ok(Step::Next)
}

/// `68`/`6A`: PUSH imm32 / PUSH imm8 (sign-extended to operand size).
pub fn exec_push_imm(inst: &DecodedInst, regs: &mut RegisterFile, mem: &mut LinearMemory) -> Result<Step> {
    let imm = match inst.operands[0] {
        Operand::Immediate(v) => v,
        _ => return Ok(Step::Next),
    };
    push(regs, mem, inst.operand_size, imm)?;
    Ok(Step::Next)
}

/// `8F` (Group 1A): POP r/m.
pub fn exec_pop_rm(inst: &DecodedInst, regs: &mut RegisterFile, mem: &mut LinearMemory) -> Result<Step> {
    let size = inst.operand_size;
    let val = pop(regs, mem, size)?;
    write_operand(&inst.operands[0], regs, mem, size, val)?;
    Ok(Step::Next)
}

/// `FF` Group 5, reg=6: PUSH r/m.
pub fn exec_push_rm(inst: &DecodedInst, regs: &mut RegisterFile, mem: &mut LinearMemory) -> Result<Step> {
    let dst = &inst.operands[0];
    let size = operand_size_of(dst, inst.operand_size);
    let val = read_operand(dst, regs, mem, size)?;
    push(regs, mem, size, val)?;
    Ok(Step::Next)
}

/// `9C`: PUSHF/PUSHFD. Pushes EFLAGS masked to operand size; the 32-bit form
/// additionally masks reserved bits per the Intel reference (`0x00FCFFFF`).
pub fn exec_pushf(inst: &DecodedInst, regs: &mut RegisterFile, mem: &mut LinearMemory) -> Result<Step> {
    let size = inst.operand_size;
    let val = match size {
        OperandSize::Word => (regs.eflags & 0xFFFF) as u64,
        _ => (regs.eflags & 0x00FC_FFFF) as u64,
    };
    push(regs, mem, size, val)?;
    Ok(Step::Next)
}

/// `9D`: POPF/POPFD. Pops into EFLAGS masked to operand size; a 16-bit POPF
/// leaves the upper half of EFLAGS untouched. Bit 1, fixed at 1, is always
/// restored regardless of the popped value.
pub fn exec_popf(inst: &DecodedInst, regs: &mut RegisterFile, mem: &mut LinearMemory) -> Result<Step> {
    let size = inst.operand_size;
    let val = pop(regs, mem, size)?;
    match size {
        OperandSize::Word => {
            regs.eflags = (regs.eflags & 0xFFFF_0000) | (val as u32 & 0xFFFF);
        }
        _ => {
            regs.eflags = val as u32;
        }
    }
    regs.eflags |= crate::flags::EFLAGS_FIXED;
    Ok(Step::Next)
}

/// `60`: PUSHA/PUSHAD. Pushes {EAX,ECX,EDX,EBX,original ESP,EBP,ESI,EDI} in
/// that order.
pub fn exec_pusha(inst: &DecodedInst, regs: &mut RegisterFile, mem: &mut LinearMemory) -> Result<Step> {
    let size = inst.operand_size;
    let original_esp = regs.sp();
    for idx in [GprIndex::Eax, GprIndex::Ecx, GprIndex::Edx, GprIndex::Ebx] {
        let val = regs.read_gpr(idx as u8, size);
        push(regs, mem, size, val)?;
    }
    push(regs, mem, size, original_esp as u64)?;
    for idx in [GprIndex::Ebp, GprIndex::Esi, GprIndex::Edi] {
        let val = regs.read_gpr(idx as u8, size);
        push(regs, mem, size, val)?;
    }
    Ok(Step::Next)
}

/// `61`: POPA/POPAD. Pops in reverse order, discarding the saved ESP slot by
/// advancing ESP past it instead of writing it back.
pub fn exec_popa(inst: &DecodedInst, regs: &mut RegisterFile, mem: &mut LinearMemory) -> Result<Step> {
    let size = inst.operand_size;
    for idx in [GprIndex::Edi, GprIndex::Esi, GprIndex::Ebp] {
        let val = pop(regs, mem, size)?;
        regs.write_gpr(idx as u8, size, val);
    }
    // Discard the saved ESP slot.
    let _ = pop(regs, mem, size)?;
    for idx in [GprIndex::Ebx, GprIndex::Edx, GprIndex::Ecx, GprIndex::Eax] {
        let val = pop(regs, mem, size)?;
        regs.write_gpr(idx as u8, size, val);
    }
    Ok(Step::Next)
}

/// `C9`: LEAVE. ESP := EBP; EBP := pop().
pub fn exec_leave(_inst: &DecodedInst, regs: &mut RegisterFile, mem: &mut LinearMemory) -> Result<Step> {
    let ebp = regs.read_gpr32(GprIndex::Ebp as u8);
    regs.set_sp(ebp);
    let val = pop(regs, mem, OperandSize::Dword)?;
    regs.write_gpr32(GprIndex::Ebp as u8, val as u32);
    Ok(Step::Next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::OpcodeMap;

    fn new_inst(opcode: u16) -> DecodedInst {
        let mut inst = DecodedInst::empty();
        inst.opcode = opcode;
        inst.opcode_map = OpcodeMap::Primary;
        inst
    }

    #[test]
    fn push_pop_roundtrip_preserves_register_and_esp() {
        let mut regs = RegisterFile::new();
        let mut mem = LinearMemory::new(0x1000);
        regs.set_sp(0x800);
        regs.write_gpr32(GprIndex::Ebx as u8, 0xDEAD_BEEF);
        let esp_before = regs.sp();

        let push_inst = new_inst(0x53); // PUSH EBX
        exec_push_pop_reg(&push_inst, &mut regs, &mut mem).unwrap();
        assert_eq!(regs.sp(), esp_before - 4);

        regs.write_gpr32(GprIndex::Ebx as u8, 0);
        let pop_inst = new_inst(0x5B); // POP EBX
        exec_push_pop_reg(&pop_inst, &mut regs, &mut mem).unwrap();
        assert_eq!(regs.read_gpr32(GprIndex::Ebx as u8), 0xDEAD_BEEF);
        assert_eq!(regs.sp(), esp_before);
    }

    #[test]
    fn pusha_popa_roundtrip() {
        let mut regs = RegisterFile::new();
        let mut mem = LinearMemory::new(0x1000);
        regs.set_sp(0x800);
        regs.write_gpr32(GprIndex::Eax as u8, 0x1111_1111);
        regs.write_gpr32(GprIndex::Ecx as u8, 0x2222_2222);
        regs.write_gpr32(GprIndex::Edx as u8, 0x3333_3333);
        regs.write_gpr32(GprIndex::Ebx as u8, 0x4444_4444);
        regs.write_gpr32(GprIndex::Ebp as u8, 0x5555_5555);
        regs.write_gpr32(GprIndex::Esi as u8, 0x6666_6666);
        regs.write_gpr32(GprIndex::Edi as u8, 0x7777_7777);
        let esp_before = regs.sp();

        exec_pusha(&new_inst(0x60), &mut regs, &mut mem).unwrap();

        regs.write_gpr32(GprIndex::Eax as u8, 0);
        regs.write_gpr32(GprIndex::Ecx as u8, 0);
        regs.write_gpr32(GprIndex::Edx as u8, 0);
        regs.write_gpr32(GprIndex::Ebx as u8, 0);
        regs.write_gpr32(GprIndex::Ebp as u8, 0);
        regs.write_gpr32(GprIndex::Esi as u8, 0);
        regs.write_gpr32(GprIndex::Edi as u8, 0);

        exec_popa(&new_inst(0x61), &mut regs, &mut mem).unwrap();

        assert_eq!(regs.read_gpr32(GprIndex::Eax as u8), 0x1111_1111);
        assert_eq!(regs.read_gpr32(GprIndex::Ecx as u8), 0x2222_2222);
        assert_eq!(regs.read_gpr32(GprIndex::Edx as u8), 0x3333_3333);
        assert_eq!(regs.read_gpr32(GprIndex::Ebx as u8), 0x4444_4444);
        assert_eq!(regs.read_gpr32(GprIndex::Ebp as u8), 0x5555_5555);
        assert_eq!(regs.read_gpr32(GprIndex::Esi as u8), 0x6666_6666);
        assert_eq!(regs.read_gpr32(GprIndex::Edi as u8), 0x7777_7777);
        assert_eq!(regs.sp(), esp_before);
    }

    #[test]
    fn pushfd_popfd_roundtrip() {
        let mut regs = RegisterFile::new();
        let mut mem = LinearMemory::new(0x1000);
        regs.set_sp(0x800);
        regs.eflags_set(crate::flags::CF, true);
        regs.eflags_set(crate::flags::ZF, true);
        let eflags_before = regs.eflags;

        exec_pushf(&new_inst(0x9C), &mut regs, &mut mem).unwrap();
        regs.eflags = crate::flags::EFLAGS_FIXED;
        exec_popf(&new_inst(0x9D), &mut regs, &mut mem).unwrap();
        assert_eq!(regs.eflags & 0x00FC_FFFF, eflags_before & 0x00FC_FFFF);
    }
}
