//! CPU emulation core — state ownership and the fetch-decode-execute loop.
//!
//! The `Cpu` struct ties together the register file, linear memory, GDT,
//! decoder, and syscall dispatcher, and drives the run loop that executes a
//! guest program until it halts, faults, exits, or exceeds an instruction
//! budget.

use log::{trace, warn};

use crate::decoder::Decoder;
use crate::error::{Result, VmError};
use crate::executor::{self, Step};
use crate::gdt::Gdt;
use crate::memory::LinearMemory;
use crate::registers::RegisterFile;
use crate::syscall::{SyscallState, SyscallTable};

/// Reason the run loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// `exit`/`exit_group` was called; carries the guest-supplied code.
    Exited(i32),
    /// A fatal fault halted emulation (illegal instruction, memory fault,
    /// unsupported syscall, decoder invariant, or an explicit `HLT`).
    Fault(VmError),
    /// The instruction-count safety limit configured by the caller was
    /// reached before the guest exited.
    InstructionLimit,
}

/// The virtual IA-32 machine: register file, linear memory, GDT, and the
/// syscall dispatch table, driven one instruction at a time by [`Cpu::run`].
pub struct Cpu {
    pub regs: RegisterFile,
    pub mem: LinearMemory,
    pub gdt: Gdt,
    decoder: Decoder,
    syscalls: SyscallTable,
    state: SyscallState,
    pub instruction_count: u64,
}

impl Cpu {
    /// Build a CPU over `mem_size` bytes of guest memory, with the GDT's
    /// null/flat descriptors installed and segment registers loaded. The
    /// caller loads a program and sets `regs.eip`/`regs.esp` afterward (see
    /// [`crate::elf_loader::load`]).
    pub fn new(mem_size: usize, brk_floor: u32) -> Self {
        let mut regs = RegisterFile::new();
        let mut gdt = Gdt::new();
        gdt.install_flat(&mut regs);
        Cpu {
            regs,
            mem: LinearMemory::new(mem_size),
            gdt,
            decoder: Decoder::new(),
            syscalls: SyscallTable::new(),
            state: SyscallState::new(brk_floor),
            instruction_count: 0,
        }
    }

    /// Update the floor `brk` enforces, once the ELF loader has determined
    /// where the highest loaded segment ends. Called after construction
    /// since the loader needs a `Cpu`'s memory and registers to place the
    /// image before its extent — and thus the floor — is known.
    pub fn set_brk_floor(&mut self, floor: u32) {
        self.state.brk_floor = floor;
    }

    /// Execute one fetch-decode-execute cycle. Returns `Ok(None)` to keep
    /// running, `Ok(Some(reason))` when the run loop should stop, and an
    /// `Err` for a fault the caller hasn't already mapped to an
    /// `ExitReason` (used internally; `run` never lets one escape).
    fn step(&mut self) -> Result<Option<ExitReason>> {
        let eip = self.regs.eip;
        let inst = self.decoder.decode(&self.mem, eip)?;
        trace!("eip={eip:#010x} opcode={:#06x}", inst.opcode);

        match executor::execute(&inst, &mut self.regs, &mut self.mem)? {
            Step::Next => {
                self.regs.eip = eip.wrapping_add(inst.length as u32);
            }
            Step::Jumped => {}
            Step::Syscall => {
                self.syscalls.dispatch(&mut self.regs, &mut self.mem, &mut self.gdt, &mut self.state)?;
                if !self.state.running {
                    return Ok(Some(ExitReason::Exited(self.state.exit_code)));
                }
            }
            Step::Halt => return Err(VmError::Halted),
        }

        self.instruction_count += 1;
        Ok(None)
    }

    /// Run until the guest exits, faults, or `instruction_limit` (if set)
    /// is reached.
    pub fn run(&mut self, instruction_limit: Option<u64>) -> ExitReason {
        loop {
            if let Some(limit) = instruction_limit {
                if self.instruction_count >= limit {
                    return ExitReason::InstructionLimit;
                }
            }
            match self.step() {
                Ok(Some(reason)) => return reason,
                Ok(None) => continue,
                Err(VmError::Halted) => return ExitReason::Exited(0),
                Err(fault) => {
                    warn!("fault at eip={:#010x}: {fault}", self.regs.eip);
                    return ExitReason::Fault(fault);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_until_explicit_exit_syscall() {
        let mut cpu = Cpu::new(0x1_0000, 0x8000);
        // mov eax, 1 ; mov ebx, 42 ; int 0x80
        let program: &[u8] = &[0xB8, 0x01, 0x00, 0x00, 0x00, 0xBB, 0x2A, 0x00, 0x00, 0x00, 0xCD, 0x80];
        cpu.mem.load_at(0x1000, program);
        cpu.regs.eip = 0x1000;

        let reason = cpu.run(Some(100));
        assert_eq!(reason, ExitReason::Exited(42));
    }

    #[test]
    fn illegal_opcode_reports_a_fault() {
        let mut cpu = Cpu::new(0x1_0000, 0x8000);
        cpu.mem.load_at(0x1000, &[0x0F, 0x0B]); // UD2-style undefined two-byte opcode
        cpu.regs.eip = 0x1000;

        let reason = cpu.run(Some(10));
        assert!(matches!(reason, ExitReason::Fault(_)));
    }

    #[test]
    fn instruction_limit_stops_a_runaway_loop() {
        let mut cpu = Cpu::new(0x1_0000, 0x8000);
        cpu.mem.load_at(0x1000, &[0xEB, 0xFE]); // jmp $ (infinite self-loop)
        cpu.regs.eip = 0x1000;

        let reason = cpu.run(Some(50));
        assert_eq!(reason, ExitReason::InstructionLimit);
    }
}
