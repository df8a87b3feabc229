//! Control-transfer instruction handlers.
//!
//! Implements the conditional (Jcc, short and near) and unconditional (JMP)
//! jump families, CALL/RET, LOOP/LOOPE/LOOPNE/JECXZ, and `int 0x80` — the
//! only software interrupt this machine recognizes.

use super::{operand_size_of, pop, push, read_operand, Step};
use crate::error::{Result, VmError};
use crate::flags::{eval_cc, OperandSize};
use crate::instruction::{DecodedInst, Operand};
use crate::memory::LinearMemory;
use crate::registers::{GprIndex, RegisterFile};

fn rel_offset(inst: &DecodedInst) -> i64 {
    match inst.operands[0] {
        Operand::RelativeOffset(rel) => rel,
        _ => 0,
    }
}

/// `70..7F`: Jcc rel8. Condition code is the opcode's low nibble.
pub fn exec_jcc_short(inst: &DecodedInst, regs: &mut RegisterFile, _mem: &mut LinearMemory) -> Result<Step> {
    jcc(inst, regs, (inst.opcode & 0x0F) as u8)
}

/// `0F80..0F8F`: Jcc rel32 (two-byte near form).
pub fn exec_jcc_near(inst: &DecodedInst, regs: &mut RegisterFile, _mem: &mut LinearMemory) -> Result<Step> {
    jcc(inst, regs, (inst.opcode & 0x0F) as u8)
}

fn jcc(inst: &DecodedInst, regs: &mut RegisterFile, cc: u8) -> Result<Step> {
    let next = regs.eip.wrapping_add(inst.length as u32);
    if eval_cc(cc, regs.eflags) {
        let rel = rel_offset(inst);
        regs.eip = (next as i64).wrapping_add(rel) as u32;
    } else {
        regs.eip = next;
    }
    Ok(Step::Jumped)
}

/// `E9`/`EB`: JMP rel32 / JMP rel8.
pub fn exec_jmp_rel(inst: &DecodedInst, regs: &mut RegisterFile, _mem: &mut LinearMemory) -> Result<Step> {
    let next = regs.eip.wrapping_add(inst.length as u32);
    let rel = rel_offset(inst);
    regs.eip = (next as i64).wrapping_add(rel) as u32;
    Ok(Step::Jumped)
}

/// `FF` Group 5, reg=4: JMP r/m (absolute indirect, within this segment).
pub fn exec_jmp_indirect(inst: &DecodedInst, regs: &mut RegisterFile, mem: &mut LinearMemory) -> Result<Step> {
    let target = read_operand(&inst.operands[0], regs, mem, OperandSize::Dword)?;
    regs.eip = target as u32;
    Ok(Step::Jumped)
}

/// `E8`: CALL rel32. Pushes the return address, then jumps.
pub fn exec_call(inst: &DecodedInst, regs: &mut RegisterFile, mem: &mut LinearMemory) -> Result<Step> {
    let next = regs.eip.wrapping_add(inst.length as u32);
    let rel = rel_offset(inst);
    push(regs, mem, OperandSize::Dword, next as u64)?;
    regs.eip = (next as i64).wrapping_add(rel) as u32;
    Ok(Step::Jumped)
}

/// `FF` Group 5, reg=2: CALL r/m (absolute indirect).
pub fn exec_call_indirect(inst: &DecodedInst, regs: &mut RegisterFile, mem: &mut LinearMemory) -> Result<Step> {
    let dst = &inst.operands[0];
    let size = operand_size_of(dst, inst.operand_size);
    let target = read_operand(dst, regs, mem, size)?;
    let next = regs.eip.wrapping_add(inst.length as u32);
    push(regs, mem, OperandSize::Dword, next as u64)?;
    regs.eip = target as u32;
    Ok(Step::Jumped)
}

/// `C2`/`C3`: RET imm16 / RET. The near-return form pops EIP and then
/// releases `imm16` extra bytes of arguments off the stack.
pub fn exec_ret(inst: &DecodedInst, regs: &mut RegisterFile, mem: &mut LinearMemory) -> Result<Step> {
    let target = pop(regs, mem, OperandSize::Dword)?;
    if inst.opcode == 0xC2 {
        let extra = match inst.operands[0] {
            Operand::Immediate(v) => v as u32,
            _ => return Err(VmError::DecoderInvariant("RET imm16 missing immediate")),
        };
        regs.set_sp(regs.sp().wrapping_add(extra));
    }
    regs.eip = target as u32;
    Ok(Step::Jumped)
}

/// `E0..E3`: LOOPNE/LOOPE/LOOP/JECXZ. ECX (or CX, under a 16-bit address
/// size) is decremented first for the LOOP family; JECXZ tests it unchanged.
pub fn exec_loop(inst: &DecodedInst, regs: &mut RegisterFile, _mem: &mut LinearMemory) -> Result<Step> {
    let next = regs.eip.wrapping_add(inst.length as u32);
    let addr_size = inst.address_size;
    let taken = match inst.opcode {
        0xE3 => regs.read_gpr(GprIndex::Ecx as u8, addr_size) == 0,
        _ => {
            let count = regs.read_gpr(GprIndex::Ecx as u8, addr_size).wrapping_sub(1);
            regs.write_gpr(GprIndex::Ecx as u8, addr_size, count);
            let nonzero = count != 0;
            match inst.opcode {
                0xE0 => nonzero && !regs.eflags_get(crate::flags::ZF),
                0xE1 => nonzero && regs.eflags_get(crate::flags::ZF),
                0xE2 => nonzero,
                _ => unreachable!(),
            }
        }
    };
    if taken {
        let rel = rel_offset(inst);
        regs.eip = (next as i64).wrapping_add(rel) as u32;
    } else {
        regs.eip = next;
    }
    Ok(Step::Jumped)
}

/// `CD`: INT imm8. Only vector `0x80` (the Linux syscall gate) is
/// recognized; anything else is an illegal instruction in this machine.
pub fn exec_int(inst: &DecodedInst, regs: &mut RegisterFile) -> Result<Step> {
    let vector = match inst.operands[0] {
        Operand::Immediate(v) => v,
        _ => return Err(VmError::DecoderInvariant("INT missing immediate vector")),
    };
    if vector == 0x80 {
        regs.eip = regs.eip.wrapping_add(inst.length as u32);
        Ok(Step::Syscall)
    } else {
        Err(VmError::IllegalInstruction {
            opcode: inst.opcode,
            eip: regs.eip,
        })
    }
}
