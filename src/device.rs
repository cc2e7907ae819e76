use log::error;
use unicorn_engine::Unicorn;

use crate::csr::CsrTable;
use crate::memory::AddressSpace;

/// Why a guest fault ended emulation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QuitDetail {
    UnmappedAccess { addr: u64 },
    IllegalInstruction { pc: u64 },
    CPUException { cause: u32, pc: u64 },
}

/// Why the engine handed control back to the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// The stop address or the instruction budget was reached.
    Finished,
    Quit(QuitDetail),
}

/// Per-core emulation context.
///
/// Lives in the engine's user data so hooks can reach it. The CSR table is fixed once the core is realized; the
/// address space keeps every region's backing memory alive for as long as the engine maps it.
#[derive(Default)]
pub struct CoreState {
    pub csrs: CsrTable,
    pub memory: AddressSpace,
    pub stop_reason: Option<StopReason>,
}

pub type UnicornContext<'a> = Unicorn<'a, CoreState>;

/// Record the stop reason and ask the engine to return after the current instruction.
pub fn request_stop(uc: &mut UnicornContext, reason: StopReason) {
    uc.get_data_mut().stop_reason = Some(reason);
    if let Err(err) = uc.emu_stop() {
        error!("cannot stop emulation: {err:?}");
    }
}

/// Record a stop reason for a fault the engine will stop on by itself.
pub fn record_quit(uc: &mut UnicornContext, detail: QuitDetail) {
    uc.get_data_mut().stop_reason = Some(StopReason::Quit(detail));
}
