//! Reference host driver: load an ELF, run it, mirror its exit status.
//!
//! Usage: `rvemu <elf-file> [guest args...]`
//!
//! Environment:
//!   RVEMU_MAX_MEMORY  guest memory bound in MiB (default 64)
//!   RVEMU_BUDGET      instruction budget per run slice (default 4G)
//!   RUST_LOG          log filter (env_logger)

use anyhow::{bail, Context};
use rvemu::{Machine, MachineOptions, RunOutcome};
use std::env;
use std::fs;

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        bail!("usage: rvemu <elf-file> [guest args...]");
    }

    let max_memory = env::var("RVEMU_MAX_MEMORY")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(64)
        << 20;
    let budget = env::var("RVEMU_BUDGET")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(4_000_000_000);

    let elf_bytes = fs::read(&args[1]).with_context(|| format!("reading {}", args[1]))?;

    let options = MachineOptions {
        max_memory,
        argv: args[1..].to_vec(),
        ..Default::default()
    };
    let mut machine = Machine::new(&elf_bytes, options)?;

    match machine.run(budget) {
        Ok(RunOutcome::Halted) => {
            let status = machine.exit_code();
            log::info!(
                "guest exited with status {} after {} instructions",
                status,
                machine.instruction_counter()
            );
            std::process::exit(status as i32);
        }
        Ok(RunOutcome::Timeout) => {
            bail!("instruction budget of {} exhausted", budget);
        }
        Ok(outcome) => {
            bail!("machine stopped unexpectedly: {:?}", outcome);
        }
        Err(e) => {
            eprintln!("{}", machine);
            bail!(
                "machine exception {}: {} (data {:#x})",
                e.kind(),
                e,
                e.data()
            );
        }
    }
}
