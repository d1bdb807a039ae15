//! Guided recovery scenarios.
//!
//! Both scenarios need one physical action from a human: cutting the device's
//! power while the capsule update is being applied during boot. The run blocks
//! on [`Operator::confirm`] until the operator reports the power cycle done.

use crate::error::{Error, InvariantViolation, Result};
use crate::harness::Harness;
use crate::slot::{Bootability, SlotId, SlotStatus};
use serde::Serialize;
use std::io::{self, BufRead, Write};

/// Forced capsule updates cleared before the power scenario gives up.
pub const MAX_FORCED_CLEARS: u32 = 2;

/// Instruction shown to the operator while the device reboots into the update.
pub const POWER_INTERRUPT_PROMPT: &str = "Interrupt power to the device while the capsule update \
progress is shown, restore power, then press Enter to continue";

/// A human (or stand-in) who can act on the hardware.
pub trait Operator {
    /// Shows `prompt` and blocks until the operator confirms.
    fn confirm(&mut self, prompt: &str) -> Result<()>;
}

/// Prompts on stdout and waits for a line on stdin.
#[derive(Debug, Default)]
pub struct ConsoleOperator;

impl Operator for ConsoleOperator {
    fn confirm(&mut self, prompt: &str) -> Result<()> {
        let mut stdout = io::stdout();
        writeln!(stdout, "{}", prompt)?;
        stdout.flush()?;
        let mut line = String::new();
        io::stdin().lock().read_line(&mut line)?;
        Ok(())
    }
}

/// What a recovery scenario observed.
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryReport {
    pub scenario: String,
    /// Slot the device stayed on through the interrupted update.
    pub interrupted_slot: SlotId,
    /// The update target as seen before the recovery update.
    pub interrupted_target: SlotStatus,
    /// Slot after the recovery update.
    pub final_slot: SlotId,
    /// Capsule updates run to clear a forced state left by an earlier run.
    pub forced_clears: u32,
}

/// Drives the power interruption and unbootable slot scenarios.
pub struct RecoveryScenarios {
    operator: Box<dyn Operator>,
}

impl RecoveryScenarios {
    pub fn new(operator: Box<dyn Operator>) -> Self {
        Self { operator }
    }

    /// Runs capsule update cycles until no capsule update is forced.
    ///
    /// Returns the number of cycles needed. A capsule update still forced
    /// after [`MAX_FORCED_CLEARS`] cycles is a protocol violation.
    pub fn clear_forced_capsule(&mut self, harness: &mut Harness) -> Result<u32> {
        let mut cleared = 0;
        while harness.slots.is_capsule_update_forced(harness.session.as_mut())? {
            if cleared == MAX_FORCED_CLEARS {
                return Err(Error::Protocol(format!(
                    "capsule update still forced after {} clearing updates",
                    cleared
                )));
            }
            cleared += 1;
            log::info!("Capsule update forced from a prior run, clearing ({})", cleared);
            harness.update_cycle_with(true, false)?;
        }
        Ok(cleared)
    }

    /// Starts a forced capsule update and has the operator interrupt power
    /// while it is applied. The slot must not change.
    ///
    /// Returns the slot the device stayed on.
    pub fn interrupted_update(&mut self, harness: &mut Harness) -> Result<SlotId> {
        harness.session.invalidate();
        harness.log_machine_id();
        let before = harness.current_slot()?;

        harness.updater.inject_version_mismatch(harness.session.as_mut())?;
        harness.updater.transfer(harness.session.as_mut())?;
        harness.updater.run_update_tool(harness.session.as_mut())?;

        log::info!("Rebooting from slot {} for the power interruption", before);
        let operator = &mut self.operator;
        harness
            .rebooter
            .reboot_with_hook(harness.session.as_mut(), &mut || -> Result<()> {
                operator.confirm(POWER_INTERRUPT_PROMPT)
            })?;

        let after = harness.current_slot()?;
        if after != before {
            return Err(InvariantViolation::SlotChangedDuringRecovery {
                context: "an interrupted update".to_string(),
                before,
                after,
            }
            .into());
        }
        log::info!("Interrupted update left the device on slot {}", after);
        Ok(after)
    }

    fn expect_bootable(harness: &mut Harness, slot: SlotId, expected: Bootability) -> Result<()> {
        harness
            .slots
            .expect_bootability(harness.session.as_mut(), slot, expected)
    }

    fn expect_target_unbootable(harness: &mut Harness, slot: SlotId) -> Result<SlotStatus> {
        let status = harness.slots.slot_status(harness.session.as_mut(), slot)?;
        log::info!(
            "Slot {} on {}: {}, capsule forced: {}",
            status.slot,
            status.root_device,
            status.bootability,
            status.capsule_forced
        );
        if status.bootability != Bootability::Unbootable {
            return Err(InvariantViolation::Bootability {
                slot,
                expected: Bootability::Unbootable,
                observed: status.bootability,
            }
            .into());
        }
        Ok(status)
    }

    fn expect_recovered(harness: &mut Harness) -> Result<SlotId> {
        for slot in SlotId::ALL {
            Self::expect_bootable(harness, slot, Bootability::Normal)?;
        }
        if harness.slots.is_capsule_update_forced(harness.session.as_mut())? {
            return Err(InvariantViolation::CapsuleStillForced.into());
        }
        harness.current_slot()
    }

    /// Power interruption recovery.
    ///
    /// After the interrupted update the device must still run the old slot,
    /// the current slot must be bootable, the untouched target must be marked
    /// unbootable and the capsule update must still be forced. A following
    /// capsule update must then succeed and clear all of that.
    pub fn power_interruption(&mut self, harness: &mut Harness) -> Result<RecoveryReport> {
        log::info!("Starting power interruption recovery scenario");
        let forced_clears = self.clear_forced_capsule(harness)?;

        let slot = self.interrupted_update(harness)?;
        Self::expect_bootable(harness, slot, Bootability::Normal)?;
        let target = Self::expect_target_unbootable(harness, slot.other())?;
        if !target.capsule_forced {
            return Err(InvariantViolation::CapsuleNotForced.into());
        }

        log::info!("Running recovery update");
        harness.update_cycle(true)?;
        let final_slot = Self::expect_recovered(harness)?;
        log::info!("Power interruption recovery verified");

        Ok(RecoveryReport {
            scenario: "power-interrupt".to_string(),
            interrupted_slot: slot,
            interrupted_target: target,
            final_slot,
            forced_clears,
        })
    }

    /// Unbootable slot recovery.
    ///
    /// The interrupted update leaves the alternate slot unbootable, so
    /// switching the active boot slot to it and rebooting must leave the
    /// device where it was. A forced capsule update must then restore both
    /// slots and clear the forced state.
    pub fn unbootable_slot(&mut self, harness: &mut Harness) -> Result<RecoveryReport> {
        log::info!("Starting unbootable slot recovery scenario");
        let slot = self.interrupted_update(harness)?;
        let alternate = slot.other();

        harness
            .slots
            .set_active_boot_slot(harness.session.as_mut(), alternate)?;
        harness.reboot()?;
        let after = harness.current_slot()?;
        if after != slot {
            return Err(InvariantViolation::SlotChangedDuringRecovery {
                context: "a switch to an unbootable slot".to_string(),
                before: slot,
                after,
            }
            .into());
        }
        let target = Self::expect_target_unbootable(harness, alternate)?;

        log::info!("Running recovery update");
        harness.update_cycle(true)?;
        let final_slot = Self::expect_recovered(harness)?;
        log::info!("Unbootable slot recovery verified");

        Ok(RecoveryReport {
            scenario: "unbootable-slot".to_string(),
            interrupted_slot: slot,
            interrupted_target: target,
            final_slot,
            forced_clears: 0,
        })
    }
}
