//! `ia32run` — CLI entry point.
//!
//! Loads a statically linked 32-bit Linux/i386 ELF executable, installs the
//! flat GDT, and runs it to completion on the emulator core in this crate.
//! On a clean `exit`/`exit_group`, the process exits with the guest-supplied
//! code; on a fatal fault, EIP and the fault description are printed to
//! stderr and the process exits non-zero.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::error;

use ia32run::cpu::{Cpu, ExitReason};
use ia32run::elf_loader;

/// Default guest address space size: 256 MiB, enough headroom for a static
/// binary's segments, its heap, and the fixed-size initial stack below them.
const DEFAULT_MEM_SIZE: usize = 256 * 1024 * 1024;

#[derive(Parser, Debug)]
#[command(name = "ia32run", about = "User-mode emulator for statically linked 32-bit Linux/i386 executables")]
struct Args {
    /// Path to the static ELF32/EM_386 executable to run.
    binary: PathBuf,

    /// Maximum number of instructions to execute before aborting (useful
    /// against runaway/looping guests); unset means no limit.
    #[arg(long)]
    instruction_limit: Option<u64>,

    /// Increase log verbosity; repeatable (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Guest linear address space size in bytes.
    #[arg(long, default_value_t = DEFAULT_MEM_SIZE)]
    mem_size: usize,
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose);

    let image = match std::fs::read(&args.binary) {
        Ok(bytes) => bytes,
        Err(e) => {
            error!("failed to read {}: {e}", args.binary.display());
            return ExitCode::FAILURE;
        }
    };

    let mut cpu = Cpu::new(args.mem_size, 0);
    let loaded = match elf_loader::load(&image, &mut cpu.mem, &mut cpu.regs) {
        Ok(loaded) => loaded,
        Err(e) => {
            error!("failed to load {}: {e}", args.binary.display());
            return ExitCode::FAILURE;
        }
    };
    cpu.set_brk_floor(loaded.brk_floor);

    match cpu.run(args.instruction_limit) {
        ExitReason::Exited(code) => {
            // Wrap to the low byte, matching a real process exit status.
            ExitCode::from((code & 0xFF) as u8)
        }
        ExitReason::Fault(fault) => {
            error!("halted at eip={:#010x}: {fault}", cpu.regs.eip);
            ExitCode::FAILURE
        }
        ExitReason::InstructionLimit => {
            error!("instruction limit ({:?}) reached without the guest exiting", args.instruction_limit);
            ExitCode::FAILURE
        }
    }
}
