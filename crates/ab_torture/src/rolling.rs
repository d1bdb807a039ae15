//! Rolling reboot torture.
//!
//! Plain reboots in a loop. Optionally asserts the slot never moves, and
//! optionally checks the Tegra UEFI `VarErrorFlag` variable before each
//! reboot (a device whose variable store is filling up reports something
//! other than `ff`).

use crate::channel::RunOptions;
use crate::error::{InvariantViolation, Result};
use crate::harness::Harness;
use crate::slot::SlotId;
use serde::Serialize;

/// Succeeds only while `VarErrorFlag` still reads `ff`.
pub const VAR_ERROR_FLAG_COMMAND: &str =
    "efivar  -p -n 04b37fe8-f6ae-480b-bdd5-37d98c5e89aa-VarErrorFlag | grep ff";

/// Knobs for [`RollingReboot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollingConfig {
    pub num_reboots: u32,
    pub check_slot: bool,
    pub check_var_error_flag: bool,
}

impl Default for RollingConfig {
    fn default() -> Self {
        Self {
            num_reboots: 100,
            check_slot: false,
            check_var_error_flag: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RollingReport {
    pub reboots: u32,
    pub slot: Option<SlotId>,
}

pub struct RollingReboot {
    config: RollingConfig,
}

impl RollingReboot {
    pub fn new(config: RollingConfig) -> Self {
        Self { config }
    }

    pub fn run(&self, harness: &mut Harness) -> Result<RollingReport> {
        log::info!(
            "Starting reboot torture tests with {} reboots",
            self.config.num_reboots
        );
        let slot = if self.config.check_slot {
            Some(harness.current_slot()?)
        } else {
            None
        };

        for i in 0..self.config.num_reboots {
            if self.config.check_var_error_flag {
                log::info!("Checking var error flag");
                harness
                    .session
                    .run(VAR_ERROR_FLAG_COMMAND, RunOptions::new())?;
            }
            log::info!("Starting reboot {}", i + 1);
            harness.reboot()?;

            if let Some(before) = slot {
                let after = harness.current_slot()?;
                if after != before {
                    return Err(InvariantViolation::SlotChangedAfterReboot { before, after }.into());
                }
            }
        }

        Ok(RollingReport {
            reboots: self.config.num_reboots,
            slot,
        })
    }
}
