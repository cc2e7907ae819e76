/// Machine (board) composition and run loop.
pub mod board;
/// RISC-V core instantiation on top of the unicorn engine.
pub mod cpu;
/// Control and status register interception.
///
/// Vendor CSRs that the engine does not implement are routed through a per-core [`csr::CsrTable`] instead of
/// trapping the guest.
pub mod csr;
/// Emulation context shared with engine hooks.
mod device;
/// Guest fault reporting.
mod exception;
/// Firmware image search and loading.
pub mod loader;
/// Memory regions and the system address space.
pub mod memory;
/// GigaDevice GD32VF103 SoC composition.
pub mod soc;

#[cfg(test)]
mod testing;

use std::fmt;
use std::io;

use unicorn_engine::uc_error;

pub use board::LonganNano;
pub use device::{CoreState, QuitDetail, StopReason, UnicornContext};
pub use soc::Gd32vf103;

#[derive(Debug)]
pub enum RuntimeError {
    IOError(io::Error),
    UnicornError(uc_error),
    /// Host memory for a region could not be allocated.
    BackingAllocation { name: String, size: usize },
    RegionOverlap { name: String, other: String },
    RegionMisaligned { name: String, base: u64, size: usize },
    AliasOutOfRange { name: String, target: String },
    UnknownRegion(String),
    ImageTooLarge { size: u64, capacity: usize },
    FirmwareNotFound(String),
    FirmwareLoad(String),
}

impl From<io::Error> for RuntimeError {
    fn from(value: io::Error) -> Self {
        Self::IOError(value)
    }
}

impl From<uc_error> for RuntimeError {
    fn from(value: uc_error) -> Self {
        Self::UnicornError(value)
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IOError(err) => write!(f, "I/O error: {err}"),
            Self::UnicornError(err) => write!(f, "unicorn error: {err:?}"),
            Self::BackingAllocation { name, size } => {
                write!(f, "cannot allocate {size} bytes of backing memory for {name}")
            }
            Self::RegionOverlap { name, other } => write!(f, "region {name} overlaps {other}"),
            Self::RegionMisaligned { name, base, size } => {
                write!(f, "region {name} (0x{base:08x}, 0x{size:x} bytes) is not page aligned")
            }
            Self::AliasOutOfRange { name, target } => write!(f, "alias {name} exceeds its target {target}"),
            Self::UnknownRegion(name) => write!(f, "no region named {name}"),
            Self::ImageTooLarge { size, capacity } => {
                write!(f, "image of {size} bytes does not fit in {capacity} bytes")
            }
            Self::FirmwareNotFound(name) => write!(f, "Unable to find {name}"),
            Self::FirmwareLoad(name) => write!(f, "Unable to load firmware image {name}"),
        }
    }
}

impl std::error::Error for RuntimeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::IOError(err) => Some(err),
            _ => None,
        }
    }
}
