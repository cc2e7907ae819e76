use std::rc::Rc;

use log::{debug, info};
use unicorn_engine::{Arch, HookType, Mode, Riscv32CpuModel, Unicorn};

use crate::RuntimeError;
use crate::csr::{CsrNumber, CsrOps, CsrTable};
use crate::device::{CoreState, UnicornContext};
use crate::exception;

/// Core variants this crate knows how to instantiate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CpuVariant {
    /// Nuclei Bumblebee (RV32IMAC), as found in the GD32VF103.
    Bumblebee,
}

impl CpuVariant {
    pub fn name(self) -> &'static str {
        match self {
            CpuVariant::Bumblebee => "nuclei-bumblebee",
        }
    }

    fn model(self) -> Riscv32CpuModel {
        match self {
            // Closest stock model: RV32IMAC without an MMU. Vendor CSRs come from the CSR table.
            CpuVariant::Bumblebee => Riscv32CpuModel::UC_CPU_RISCV32_SIFIVE_E31,
        }
    }
}

/// An unrealized RISC-V core.
///
/// CSR operations can only be installed here; [`RiscvCpu::realize`] consumes the builder, so installation always
/// happens before the core can run.
#[derive(Debug)]
pub struct RiscvCpu {
    variant: CpuVariant,
    reset_vector: u64,
    csrs: CsrTable,
}

impl RiscvCpu {
    pub fn new(variant: CpuVariant) -> Self {
        Self { variant, reset_vector: 0, csrs: CsrTable::new() }
    }

    pub fn variant(&self) -> CpuVariant {
        self.variant
    }

    pub fn reset_vector(&self) -> u64 {
        self.reset_vector
    }

    pub fn set_reset_vector(&mut self, addr: u64) {
        self.reset_vector = addr;
    }

    pub fn set_csr_ops(&mut self, csrno: CsrNumber, ops: Rc<dyn CsrOps>) {
        if let Some(previous) = self.csrs.set_csr_ops(csrno, ops) {
            debug!("cpu: replacing {} for csr {csrno:04x}", previous.name());
        }
    }

    /// Replace the whole CSR table.
    pub fn set_csr_table(&mut self, csrs: CsrTable) {
        self.csrs = csrs;
    }

    pub fn csrs(&self) -> &CsrTable {
        &self.csrs
    }

    /// Create the engine instance, install the exception hooks (CSR interception runs from the interrupt hook), and point the core at its reset vector.
    pub fn realize<'a>(self) -> Result<UnicornContext<'a>, RuntimeError> {
        let state = CoreState { csrs: self.csrs, ..Default::default() };
        let mut uc = Unicorn::new_with_data(Arch::RISCV, Mode::RISCV32, state)?;
        uc.ctl_set_cpu_model(self.variant.model().into())?;

        uc.add_insn_invalid_hook(exception::breakpoint)?;
        uc.add_intr_hook(exception::intr)?;
        uc.add_mem_hook(HookType::MEM_UNMAPPED, 0, 0xffffffff, exception::unmapped_access)?;
        uc.add_mem_hook(HookType::MEM_WRITE_PROT, 0, 0xffffffff, exception::write_protected)?;

        uc.set_pc(self.reset_vector)?;
        info!(
            "cpu: {} realized, reset vector 0x{:08x}, {} CSR handlers",
            self.variant.name(),
            self.reset_vector,
            uc.get_data().csrs.len()
        );
        Ok(uc)
    }
}
