use std::path::{Path, PathBuf};

use log::{debug, info};

use crate::RuntimeError;
use crate::device::StopReason;
use crate::loader;
use crate::soc::{self, Gd32vf103};

pub const TYPE_LONGAN_NANO_MACHINE: &str = "longan-nano";

/// Static description of a machine type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MachineInfo {
    pub name: &'static str,
    pub desc: &'static str,
    pub mcu_type: &'static str,
    pub default_cpus: u32,
    pub min_cpus: u32,
    pub max_cpus: u32,
}

pub const LONGAN_NANO: MachineInfo = MachineInfo {
    name: TYPE_LONGAN_NANO_MACHINE,
    desc: "RISC-V Longan Nano board",
    mcu_type: soc::TYPE_GD32VF103,
    default_cpus: 1,
    min_cpus: 1,
    max_cpus: 1,
};

/// Sipeed Longan Nano: a GD32VF103 with optional firmware in flash.
pub struct LonganNano<'a> {
    mcu: Gd32vf103<'a>,
    firmware: Option<PathBuf>,
    bytes_loaded: usize,
}

impl<'a> LonganNano<'a> {
    /// Compose the MCU and, if `firmware` is given, load it into flash.
    ///
    /// `firmware` is resolved with [`loader::find_file`] against `search_path`. Returns
    /// [`RuntimeError::FirmwareNotFound`] or [`RuntimeError::FirmwareLoad`] if the image cannot be used; no machine is
    /// produced in that case.
    pub fn initialize_machine(firmware: Option<&str>, search_path: &[PathBuf]) -> Result<Self, RuntimeError> {
        let mcu = Gd32vf103::compose()?;

        let Some(firmware) = firmware else {
            info!("{}: no firmware, flash left empty", LONGAN_NANO.name);
            return Ok(Self { mcu, firmware: None, bytes_loaded: 0 });
        };

        let filename =
            loader::find_file(firmware, search_path).ok_or_else(|| RuntimeError::FirmwareNotFound(firmware.to_owned()))?;
        let bytes_loaded = loader::load_image_mr(&filename, mcu.flash()?).map_err(|err| {
            debug!("loader: {}: {err}", filename.display());
            RuntimeError::FirmwareLoad(firmware.to_owned())
        })?;

        Ok(Self { mcu, firmware: Some(filename), bytes_loaded })
    }

    pub fn mcu(&self) -> &Gd32vf103<'a> {
        &self.mcu
    }

    pub fn mcu_mut(&mut self) -> &mut Gd32vf103<'a> {
        &mut self.mcu
    }

    /// Resolved path of the loaded firmware image.
    pub fn firmware(&self) -> Option<&Path> {
        self.firmware.as_deref()
    }

    pub fn bytes_loaded(&self) -> usize {
        self.bytes_loaded
    }

    /// Run from the reset vector (or wherever the core stopped last) until the guest faults or `max_insns`
    /// instructions were executed. `max_insns == 0` means no limit.
    pub fn run(&mut self, max_insns: usize) -> Result<StopReason, RuntimeError> {
        self.mcu.run(None, max_insns)
    }
}
