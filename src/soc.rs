use std::rc::Rc;

use log::{debug, info};

use crate::RuntimeError;
use crate::cpu::{CpuVariant, RiscvCpu};
use crate::csr::{BUMBLEBEE_CUSTOM_CSRS, CsrOps, CsrTable, UnimplementedCsr};
use crate::device::{StopReason, UnicornContext};
use crate::memory::{self, AddressSpace, Mapping, MemoryRegion};

pub const TYPE_GD32VF103: &str = "gd32vf103-mcu";

pub const FLASH_BASE_ADDRESS: u64 = 0x08000000;
pub const FLASH_ALIAS_ADDRESS: u64 = 0x00000000;
pub const SRAM_BASE_ADDRESS: u64 = 0x20000000;

pub const FLASH_SIZE: usize = 128 * 1024;
pub const SRAM_SIZE: usize = 32 * 1024;

pub const FLASH_NAME: &str = "GD32VF103.flash";
pub const FLASH_ALIAS_NAME: &str = "GD32VF103.flash.alias";
pub const SRAM_NAME: &str = "GD32VF103.sram";

/// Execution starts where the alias maps flash.
pub const RESET_VECTOR: u64 = FLASH_ALIAS_ADDRESS;

/// CSR table with every Bumblebee custom CSR bound to one shared stub.
pub fn bumblebee_csr_table() -> CsrTable {
    let unimp: Rc<dyn CsrOps> = Rc::new(UnimplementedCsr::new("Bumblebee Custom CSR unimplemented"));
    let mut table = CsrTable::new();
    for info in &BUMBLEBEE_CUSTOM_CSRS {
        debug!("gd32vf103: {:04x} ({}) -> {}", info.number, info.name, unimp.name());
        table.set_csr_ops(info.number, Rc::clone(&unimp));
    }
    table
}

/// GigaDevice GD32VF103 MCU: one Bumblebee core, 128KiB flash aliased at 0, 32KiB SRAM.
pub struct Gd32vf103<'a> {
    cpu: UnicornContext<'a>,
}

impl<'a> Gd32vf103<'a> {
    pub fn compose() -> Result<Self, RuntimeError> {
        Self::compose_with(bumblebee_csr_table())
    }

    /// Compose the SoC with a caller-provided CSR table.
    pub fn compose_with(csrs: CsrTable) -> Result<Self, RuntimeError> {
        let mut cpu = RiscvCpu::new(CpuVariant::Bumblebee);
        cpu.set_reset_vector(RESET_VECTOR);
        cpu.set_csr_table(csrs);
        let mut uc = cpu.realize()?;

        let flash = MemoryRegion::init_rom(FLASH_NAME, FLASH_SIZE)?;
        let flash_alias = MemoryRegion::init_alias(FLASH_ALIAS_NAME, &flash, 0, FLASH_SIZE)?;
        let sram = MemoryRegion::init_ram(SRAM_NAME, SRAM_SIZE)?;

        memory::add_subregion(&mut uc, FLASH_BASE_ADDRESS, flash)?;
        memory::add_subregion(&mut uc, FLASH_ALIAS_ADDRESS, flash_alias)?;
        memory::add_subregion(&mut uc, SRAM_BASE_ADDRESS, sram)?;

        info!("{TYPE_GD32VF103}: composed");
        Ok(Self { cpu: uc })
    }

    pub fn cpu(&self) -> &UnicornContext<'a> {
        &self.cpu
    }

    pub fn cpu_mut(&mut self) -> &mut UnicornContext<'a> {
        &mut self.cpu
    }

    pub fn address_space(&self) -> &AddressSpace {
        &self.cpu.get_data().memory
    }

    pub fn region(&self, name: &str) -> Result<&Mapping, RuntimeError> {
        self.address_space().find(name).ok_or_else(|| RuntimeError::UnknownRegion(name.to_owned()))
    }

    pub fn flash(&self) -> Result<&MemoryRegion, RuntimeError> {
        Ok(&self.region(FLASH_NAME)?.region)
    }

    pub fn pc(&self) -> Result<u64, RuntimeError> {
        Ok(self.cpu.pc_read()?)
    }

    /// Guest-physical read through the engine.
    pub fn read_memory(&self, addr: u64, buf: &mut [u8]) -> Result<(), RuntimeError> {
        Ok(self.cpu.mem_read(addr, buf)?)
    }

    /// Guest-physical write through the engine. Ignores guest permissions.
    pub fn write_memory(&mut self, addr: u64, data: &[u8]) -> Result<(), RuntimeError> {
        Ok(self.cpu.mem_write(addr, data)?)
    }

    /// Run from the current pc until `until` is reached, `max_insns` instructions were executed (0 for no limit)
    /// or the guest faults.
    pub fn run(&mut self, until: Option<u64>, max_insns: usize) -> Result<StopReason, RuntimeError> {
        let uc = &mut self.cpu;
        uc.get_data_mut().stop_reason = None;
        let pc = uc.pc_read()?;
        let result = uc.emu_start(pc, until.unwrap_or(u64::MAX), 0, max_insns);
        if let Some(reason) = uc.get_data_mut().stop_reason.take() {
            return Ok(reason);
        }
        result?;
        Ok(StopReason::Finished)
    }
}
