use log::{error, warn};
use unicorn_engine::MemType;

use crate::csr;
use crate::device::{QuitDetail, StopReason, UnicornContext, record_quit, request_stop};

const EBREAK: u32 = 0x0010_0073;
const C_EBREAK: u32 = 0x9002;

/// RISC-V synchronous exception causes (`mcause` with the interrupt bit clear).
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ExceptionType {
    InstructionMisaligned = 0,
    InstructionAccessFault = 1,
    IllegalInstruction = 2,
    Breakpoint = 3,
    LoadMisaligned = 4,
    LoadAccessFault = 5,
    StoreMisaligned = 6,
    StoreAccessFault = 7,
    UserEcall = 8,
    SupervisorEcall = 9,
    MachineEcall = 11,
    InstructionPageFault = 12,
    LoadPageFault = 13,
    StorePageFault = 15,
}

impl TryFrom<u32> for ExceptionType {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::InstructionMisaligned,
            1 => Self::InstructionAccessFault,
            2 => Self::IllegalInstruction,
            3 => Self::Breakpoint,
            4 => Self::LoadMisaligned,
            5 => Self::LoadAccessFault,
            6 => Self::StoreMisaligned,
            7 => Self::StoreAccessFault,
            8 => Self::UserEcall,
            9 => Self::SupervisorEcall,
            11 => Self::MachineEcall,
            12 => Self::InstructionPageFault,
            13 => Self::LoadPageFault,
            15 => Self::StorePageFault,
            other => return Err(other),
        })
    }
}

pub fn unmapped_access(uc: &mut UnicornContext, access_type: MemType, addr: u64, size: usize, value: i64) -> bool {
    let pc = uc.pc_read().unwrap_or_default();
    error!("exception: {access_type:?} of {size} bytes at 0x{addr:08x}, value 0x{value:08x}, by 0x{pc:08x}.");
    record_quit(uc, QuitDetail::UnmappedAccess { addr });
    false
}

/// Guest store into flash or its alias. The store is dropped and execution continues.
pub fn write_protected(uc: &mut UnicornContext, _access_type: MemType, addr: u64, size: usize, value: i64) -> bool {
    let pc = uc.pc_read().unwrap_or_default();
    let region = uc
        .get_data()
        .memory
        .resolve(addr)
        .map_or_else(|| String::from("?"), |(m, _)| m.region.name().to_owned());
    warn!("Ignored write{} of value 0x{value:08x} to read-only {region} @ 0x{addr:08x}, by 0x{pc:08x}.", 8 * size);
    true
}

/// Exceptions that reach the host instead of a guest trap handler.
///
/// Illegal instructions go through the CSR table first; every other cause stops emulation.
pub fn intr(uc: &mut UnicornContext, intno: u32) {
    if intno == ExceptionType::IllegalInstruction as u32 {
        csr::intercept_illegal_instruction(uc);
        return;
    }
    let pc = uc.pc_read().unwrap_or_default();
    match ExceptionType::try_from(intno) {
        Ok(exc_type) => error!("exception: {exc_type:?} @ 0x{pc:08x}."),
        Err(cause) => error!("exception: unknown cause {cause} @ 0x{pc:08x}."),
    }
    request_stop(uc, StopReason::Quit(QuitDetail::CPUException { cause: intno, pc }));
}

/// `ebreak`/`c.ebreak` hook. The engine reports breakpoints as invalid instructions and stops on its own.
pub fn breakpoint(uc: &mut UnicornContext) -> bool {
    let pc = uc.pc_read().unwrap_or_default();
    let mut raw = [0u8; 4];
    if uc.mem_read(pc, &mut raw).is_ok() && is_ebreak(u32::from_le_bytes(raw)) {
        error!("exception: {:?} @ 0x{pc:08x}.", ExceptionType::Breakpoint);
        record_quit(uc, QuitDetail::CPUException { cause: ExceptionType::Breakpoint as u32, pc });
    }
    false
}

fn is_ebreak(insn: u32) -> bool {
    insn == EBREAK || insn & 0xffff == C_EBREAK
}
