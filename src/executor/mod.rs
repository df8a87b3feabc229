//! Top-level instruction executor and dispatch.
//!
//! [`execute`] is the entry point called by the CPU run loop for each
//! decoded instruction. It dispatches on the opcode map and opcode value to
//! the appropriate handler in the sub-modules (arith, data, stack, string,
//! control), and returns a [`Step`] telling the caller whether it already
//! moved EIP (a taken branch/call/return) or a fault-free default advance by
//! `inst.length` is still needed.
//!
//! Shared helpers for reading/writing operands and computing effective
//! addresses live here so every family module uses exactly one convention.

pub mod arith;
pub mod control;
pub mod data;
pub mod stack;
pub mod string;

use crate::error::{Result, VmError};
use crate::flags::OperandSize;
use crate::instruction::{DecodedInst, MemOperand, Operand, OpcodeMap, RegOperand};
use crate::memory::LinearMemory;
use crate::registers::RegisterFile;

/// What the CPU run loop should do after a handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Advance EIP by the decoded instruction length (the common case).
    Next,
    /// The handler already set EIP to its final value (jumps, calls, loops,
    /// returns); the run loop must not also add `inst.length`.
    Jumped,
    /// `int 0x80` was executed; the run loop should invoke the syscall
    /// dispatcher before fetching the next instruction.
    Syscall,
    /// `HLT` or an equivalent terminal condition was reached outside of a
    /// syscall-driven exit.
    Halt,
}

/// Execute a single decoded instruction against the given register file and
/// memory.
pub fn execute(
    inst: &DecodedInst,
    regs: &mut RegisterFile,
    mem: &mut LinearMemory,
) -> Result<Step> {
    match inst.opcode_map {
        OpcodeMap::Primary => exec_primary(inst, regs, mem),
        OpcodeMap::Secondary => exec_secondary(inst, regs, mem),
    }
}

fn exec_primary(inst: &DecodedInst, regs: &mut RegisterFile, mem: &mut LinearMemory) -> Result<Step> {
    match inst.opcode {
        0x00..=0x05
        | 0x08..=0x0D
        | 0x10..=0x15
        | 0x18..=0x1D
        | 0x20..=0x25
        | 0x28..=0x2D
        | 0x30..=0x35
        | 0x38..=0x3D => arith::exec_alu_family(inst, regs, mem),

        0x40..=0x4F => arith::exec_inc_dec(inst, regs, mem),
        0x50..=0x5F => stack::exec_push_pop_reg(inst, regs, mem),
        0x60 => stack::exec_pusha(inst, regs, mem),
        0x61 => stack::exec_popa(inst, regs, mem),
        0x68 | 0x6A => stack::exec_push_imm(inst, regs, mem),
        0x70..=0x7F => control::exec_jcc_short(inst, regs, mem),
        0x80 | 0x81 | 0x83 => arith::exec_group1(inst, regs, mem),
        0x84 | 0x85 => arith::exec_test(inst, regs, mem),
        0x86 | 0x87 => data::exec_xchg(inst, regs, mem),
        0x88 | 0x89 | 0x8A | 0x8B => data::exec_mov(inst, regs, mem),
        0x8C | 0x8E => Ok(Step::Next), // segment-register moves: accepted as no-ops
        0x8D => data::exec_lea(inst, regs, mem),
        0x8F => stack::exec_pop_rm(inst, regs, mem),
        0x90 => Ok(Step::Next),
        0x91..=0x97 => data::exec_xchg_eax(inst, regs, mem),
        0x98 => data::exec_cbw_cwde(inst, regs),
        0x99 => data::exec_cwd_cdq(inst, regs),
        0x9C => stack::exec_pushf(inst, regs, mem),
        0x9D => stack::exec_popf(inst, regs, mem),
        0xA0..=0xA3 => data::exec_mov(inst, regs, mem),
        0xA4 | 0xA5 => string::exec_movs(inst, regs, mem),
        0xB0..=0xBF => data::exec_mov_imm(inst, regs, mem),
        0xC0 | 0xC1 => arith::exec_shift_group2(inst, regs, mem),
        0xC2 | 0xC3 => control::exec_ret(inst, regs, mem),
        0xC6 | 0xC7 => data::exec_mov(inst, regs, mem),
        0xC9 => stack::exec_leave(inst, regs, mem),
        0xCD => control::exec_int(inst, regs),
        0xD0..=0xD3 => arith::exec_shift_group2(inst, regs, mem),
        0xE0..=0xE3 => control::exec_loop(inst, regs, mem),
        0xE8 => control::exec_call(inst, regs, mem),
        0xE9 | 0xEB => control::exec_jmp_rel(inst, regs, mem),
        0xF4 => Ok(Step::Halt),
        0xF5 => data::exec_cmc(regs),
        0xF6 | 0xF7 => arith::exec_group3(inst, regs, mem),
        0xF8 => data::exec_clc(regs),
        0xF9 => data::exec_stc(regs),
        0xFC => data::exec_cld(regs),
        0xFD => data::exec_std(regs),
        0xFE => arith::exec_inc_dec_rm(inst, regs, mem),
        0xFF => exec_group5(inst, regs, mem),

        _ => Err(VmError::IllegalInstruction {
            opcode: inst.opcode,
            eip: regs.eip,
        }),
    }
}

/// Group 5 (`FF`): reg field selects INC/DEC/CALL/JMP/PUSH r/m.
fn exec_group5(inst: &DecodedInst, regs: &mut RegisterFile, mem: &mut LinearMemory) -> Result<Step> {
    match inst.modrm_reg() {
        0 | 1 => arith::exec_inc_dec_rm(inst, regs, mem),
        2 => control::exec_call_indirect(inst, regs, mem),
        4 => control::exec_jmp_indirect(inst, regs, mem),
        6 => stack::exec_push_rm(inst, regs, mem),
        _ => Err(VmError::IllegalInstruction {
            opcode: inst.opcode,
            eip: regs.eip,
        }),
    }
}

fn exec_secondary(inst: &DecodedInst, regs: &mut RegisterFile, mem: &mut LinearMemory) -> Result<Step> {
    match inst.opcode {
        0x0F80..=0x0F8F => control::exec_jcc_near(inst, regs, mem),
        0x0FA4 | 0x0FA5 => arith::exec_shld(inst, regs, mem),
        0x0FAC | 0x0FAD => arith::exec_shrd(inst, regs, mem),
        0x0FB0 | 0x0FB1 => arith::exec_cmpxchg(inst, regs, mem),
        0x0FB6 | 0x0FB7 => data::exec_movzx(inst, regs, mem),
        0x0FBC => arith::exec_bsf(inst, regs, mem),
        0x0FBE | 0x0FBF => data::exec_movsx(inst, regs, mem),

        _ => Err(VmError::IllegalInstruction {
            opcode: inst.opcode,
            eip: regs.eip,
        }),
    }
}

// ── Shared operand access helpers ──

/// Compute the linear address of a memory operand (segment base + effective
/// address, masked to the operand's address width).
pub fn effective_address(m: &MemOperand, regs: &RegisterFile) -> u32 {
    let mut addr: i64 = m.displacement;
    if let Some(base) = m.base {
        addr = addr.wrapping_add(regs.read_gpr32(base) as i64);
    }
    if let Some(index) = m.index {
        addr = addr.wrapping_add((regs.read_gpr32(index) as i64).wrapping_mul(m.scale as i64));
    }
    let base = regs.segment(m.segment).base as i64;
    (addr.wrapping_add(base)) as u32
}

/// Read an operand's value, widened to `u64`.
pub fn read_operand(
    op: &Operand,
    regs: &RegisterFile,
    mem: &LinearMemory,
    size: OperandSize,
) -> Result<u64> {
    match op {
        Operand::Register(RegOperand::Gpr(i)) => Ok(regs.read_gpr(*i, size)),
        Operand::Register(RegOperand::Seg(s)) => Ok(regs.segment(*s).selector as u64),
        Operand::Memory(m) => {
            let addr = effective_address(m, regs);
            mem.get_uint(addr, size.bytes() as usize)
        }
        Operand::Immediate(v) => Ok(*v),
        Operand::RelativeOffset(v) => Ok(*v as u64),
        Operand::None => Err(VmError::DecoderInvariant("read of empty operand slot")),
    }
}

/// Write a value back to an operand at the given width.
pub fn write_operand(
    op: &Operand,
    regs: &mut RegisterFile,
    mem: &mut LinearMemory,
    size: OperandSize,
    val: u64,
) -> Result<()> {
    match op {
        Operand::Register(RegOperand::Gpr(i)) => {
            regs.write_gpr(*i, size, val);
            Ok(())
        }
        Operand::Register(RegOperand::Seg(_)) => Ok(()),
        Operand::Memory(m) => {
            let addr = effective_address(m, regs);
            mem.set_uint(addr, size.bytes() as usize, val)
        }
        Operand::Immediate(_) | Operand::RelativeOffset(_) | Operand::None => {
            Err(VmError::DecoderInvariant("write to a non-addressable operand"))
        }
    }
}

/// The width to use for a memory operand (falls back to `inst.operand_size`
/// for non-memory operands, which carry no width of their own).
pub fn operand_size_of(op: &Operand, default: OperandSize) -> OperandSize {
    match op {
        Operand::Memory(m) => m.size,
        _ => default,
    }
}

/// Extract the general-purpose register index out of a register operand.
/// Used by handlers whose destination is architecturally guaranteed to be a
/// GPR (LEA, MOVZX/MOVSX) rather than a general r/m operand.
pub fn gpr_index_of(op: &Operand) -> Result<u8> {
    match op {
        Operand::Register(RegOperand::Gpr(i)) => Ok(*i),
        _ => Err(VmError::DecoderInvariant("expected a general-purpose register operand")),
    }
}

/// Decrement ESP by `size` and write `val` to the new top of stack.
pub fn push(regs: &mut RegisterFile, mem: &mut LinearMemory, size: OperandSize, val: u64) -> Result<()> {
    let new_esp = regs.sp().wrapping_sub(size.bytes());
    regs.set_sp(new_esp);
    mem.set_uint(new_esp, size.bytes() as usize, val & size.mask())
}

/// Read `size` bytes from the top of stack and increment ESP past them.
pub fn pop(regs: &mut RegisterFile, mem: &LinearMemory, size: OperandSize) -> Result<u64> {
    let esp = regs.sp();
    let val = mem.get_uint(esp, size.bytes() as usize)?;
    regs.set_sp(esp.wrapping_add(size.bytes()));
    Ok(val)
}
