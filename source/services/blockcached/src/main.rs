// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: blockcached entrypoint: boots a machine over a RAM disk and runs the cache self-check

use axon::KernelConfig;
use axon_rt::{Machine, RunOutcome};
use blockcached::{service, BlockCache, MemDisk};
use clap::Parser;

/// Demand-paged block cache self-check on a freshly formatted RAM disk.
#[derive(Debug, Parser)]
#[command(name = "blockcached", version)]
struct Args {
    /// Volume size in blocks.
    #[arg(long, default_value_t = 1024, value_parser = clap::value_parser!(u32).range(3..=0x000C_0000))]
    blocks: u32,
    /// Simulated processors.
    #[arg(long, default_value_t = 1)]
    cpus: usize,
    /// Physical frames available to the kernel.
    #[arg(long, default_value_t = 4096)]
    frames: usize,
    /// Raise the default log level to trace.
    #[arg(short, long)]
    verbose: bool,
}

const SLICES: usize = 1_000;

fn main() {
    let args = Args::parse();
    let level = if args.verbose { log::LevelFilter::Trace } else { log::LevelFilter::Info };
    env_logger::Builder::new().filter_level(level).parse_default_env().init();

    if let Err(err) = run(&args) {
        eprintln!("blockcached: exited with error: {err}");
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), String> {
    let config = KernelConfig { cpus: args.cpus, phys_frames: args.frames, ..KernelConfig::default() };
    let mut machine = Machine::boot(config).map_err(|err| err.to_string())?;
    let cache = BlockCache::new(MemDisk::format(args.blocks));
    machine.spawn(service(cache)).map_err(|err| err.to_string())?;
    match machine.run(SLICES) {
        RunOutcome::Monitor => Ok(()),
        RunOutcome::Halted(panic) => Err(match panic.ctx {
            Some(ctx) => format!("[{ctx}] {}", panic.error),
            None => panic.error.to_string(),
        }),
        RunOutcome::BudgetExhausted => Err(format!("no result after {SLICES} slices")),
    }
}
