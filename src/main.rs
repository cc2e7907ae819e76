use std::path::PathBuf;
use std::process;

use clap::{Parser, ValueEnum};
use log::{error, info, warn};

use longan::board::{LONGAN_NANO, LonganNano};
use longan::{RuntimeError, StopReason};

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Machine {
    /// RISC-V Longan Nano board (GD32VF103).
    LonganNano,
}

/// GD32VF103 emulator.
///
/// Boots unmodified Longan Nano firmware. Accesses to Bumblebee custom CSRs are logged (RUST_LOG=warn) instead of
/// trapping.
#[derive(Parser, Debug)]
#[command(version, about, long_about)]
struct Args {
    /// Machine type.
    #[arg(short = 'M', long, value_enum, default_value_t = Machine::LonganNano)]
    machine: Machine,

    /// Firmware image loaded into flash.
    #[arg(short = 'b', long)]
    bios: Option<String>,

    /// Directory searched for the firmware image. May be given more than once.
    #[arg(short = 'L', long = "search-dir")]
    search_dirs: Vec<PathBuf>,

    /// Stop after this many instructions. 0 runs until the guest faults.
    #[arg(long, default_value_t = 0)]
    max_insns: usize,

    /// Print the memory map and exit.
    #[arg(long)]
    dump_map: bool,
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let Machine::LonganNano = args.machine;
    let mut board = match LonganNano::initialize_machine(args.bios.as_deref(), &args.search_dirs) {
        Ok(board) => board,
        Err(err @ (RuntimeError::FirmwareNotFound(_) | RuntimeError::FirmwareLoad(_))) => {
            error!("{err}");
            process::exit(1);
        }
        Err(err) => {
            error!("{}: {err}", LONGAN_NANO.name);
            process::abort();
        }
    };

    if args.dump_map {
        print!("{}", board.mcu().address_space());
        return;
    }

    match board.run(args.max_insns) {
        Ok(StopReason::Finished) => info!("{}: instruction budget exhausted", LONGAN_NANO.name),
        Ok(StopReason::Quit(detail)) => warn!("{}: stopped: {detail:?}", LONGAN_NANO.name),
        Err(err) => {
            error!("{}: {err}", LONGAN_NANO.name);
            process::exit(1);
        }
    }
}
