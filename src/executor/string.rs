//! String instruction handlers.
//!
//! This machine only ever executes MOVS without a REP prefix reduced to a
//! single element per invocation (`inst.rep` is decoded but the run loop
//! does not re-issue the instruction; a REP MOVS in a guest program is
//! driven by its own loop around repeated single-element steps, matching
//! how the decoder already treats the repeat prefix as a decode-time flag
//! rather than a hardware microcode loop).

use super::Step;
use crate::error::Result;
use crate::flags::OperandSize;
use crate::instruction::DecodedInst;
use crate::memory::LinearMemory;
use crate::registers::{GprIndex, RegisterFile, SegReg};

/// `A4`/`A5`: MOVS. Copies one element from `DS:[ESI]` to `ES:[EDI]`, then
/// advances ESI/EDI by the element size (incrementing if DF=0, decrementing
/// if DF=1). `A4` moves a byte; `A5` moves a full operand-size element.
pub fn exec_movs(inst: &DecodedInst, regs: &mut RegisterFile, mem: &mut LinearMemory) -> Result<Step> {
    let size = if inst.opcode == 0xA4 { OperandSize::Byte } else { inst.operand_size };

    let esi = regs.read_gpr(GprIndex::Esi as u8, inst.address_size) as u32;
    let edi = regs.read_gpr(GprIndex::Edi as u8, inst.address_size) as u32;

    let src_seg = inst.prefix.seg_override.unwrap_or(SegReg::Ds);
    let src_addr = regs.segment(src_seg).base.wrapping_add(esi);
    let dst_addr = regs.segment(SegReg::Es).base.wrapping_add(edi);

    let val = mem.get_uint(src_addr, size.bytes() as usize)?;
    mem.set_uint(dst_addr, size.bytes() as usize, val)?;

    let step = size.bytes();
    let (new_esi, new_edi) = if regs.eflags_get(crate::flags::DF) {
        (esi.wrapping_sub(step), edi.wrapping_sub(step))
    } else {
        (esi.wrapping_add(step), edi.wrapping_add(step))
    };
    regs.write_gpr(GprIndex::Esi as u8, inst.address_size, new_esi as u64);
    regs.write_gpr(GprIndex::Edi as u8, inst.address_size, new_edi as u64);

    Ok(Step::Next)
}
