//! The assembled test harness for one device.
//!
//! [`Harness`] composes the capabilities every scenario needs: a
//! [`RemoteSession`], a [`Rebootable`], the slot tracker and the update driver.
//! Scenarios receive a harness by reference instead of building their own
//! connections, so exactly one session exists per device.

use crate::channel::Connector;
use crate::config::Config;
use crate::error::{InvariantViolation, Result};
use crate::payload::UpdateDriver;
use crate::reachability::{Pinger, ReachabilityMonitor};
use crate::reboot::{RebootOrchestrator, Rebootable};
use crate::session::{RemoteSession, SessionManager};
use crate::slot::{SlotId, SlotStateTracker};

/// Slots observed around one update or reboot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleOutcome {
    pub pre_slot: SlotId,
    pub post_slot: SlotId,
    /// Upload attempts, zero when nothing was transferred.
    pub transfer_attempts: u32,
}

/// Capabilities for driving one device.
pub struct Harness {
    pub session: Box<dyn RemoteSession>,
    pub rebooter: Box<dyn Rebootable>,
    pub slots: SlotStateTracker,
    pub updater: UpdateDriver,
}

impl Harness {
    /// Builds the standard stack for `config` on top of `connector` and `pinger`.
    pub fn new(config: &Config, connector: Box<dyn Connector>, pinger: Box<dyn Pinger>) -> Self {
        let session = SessionManager::new(config.target.clone(), &config.timing, connector);
        let monitor = ReachabilityMonitor::new(
            pinger,
            config.timing.poll_interval,
            config.timing.max_wait,
        );
        Self {
            session: Box::new(session),
            rebooter: Box::new(RebootOrchestrator::new(
                monitor,
                &config.timing,
                config.target.elevated,
            )),
            slots: SlotStateTracker::new(config.update.capsule_marker.clone()),
            updater: UpdateDriver::new(&config.update, &config.timing),
        }
    }

    /// Reboots and waits for the device to be confirmed stable.
    pub fn reboot(&mut self) -> Result<()> {
        self.rebooter.reboot(self.session.as_mut())
    }

    /// The active slot.
    pub fn current_slot(&mut self) -> Result<SlotId> {
        self.slots.current_slot(self.session.as_mut())
    }

    /// Logs the machine identity. Failures are only logged.
    pub fn log_machine_id(&mut self) {
        match self.updater.machine_id(self.session.as_mut()) {
            Ok(id) => log::info!("Machine id: {}", id),
            Err(e) => log::warn!("Could not read machine id: {}", e),
        }
    }

    /// Reboots without updating and asserts the slot did not move.
    pub fn reboot_only(&mut self) -> Result<CycleOutcome> {
        let pre_slot = self.current_slot()?;
        log::info!("Rebooting from slot {}", pre_slot);
        self.reboot()?;
        let post_slot = self.current_slot()?;
        if post_slot != pre_slot {
            return Err(InvariantViolation::SlotChangedAfterReboot {
                before: pre_slot,
                after: post_slot,
            }
            .into());
        }
        log::info!("Reboot completed, still on slot {}", post_slot);
        Ok(CycleOutcome {
            pre_slot,
            post_slot,
            transfer_attempts: 0,
        })
    }

    /// Reboots into a freshly installed update and checks that it took.
    ///
    /// The slot must change and the new slot must be mounted. With
    /// `check_capsule` the capsule update must report status 1 and must no
    /// longer be forced.
    pub fn verify_update(&mut self, check_capsule: bool) -> Result<CycleOutcome> {
        let pre_slot = self.current_slot()?;
        self.slots.validate_slot_mounted(self.session.as_mut(), pre_slot)?;

        log::info!("Rebooting from slot {}", pre_slot);
        self.reboot()?;

        let post_slot = self.current_slot()?;
        log::info!("Reboot completed, new slot is {}", post_slot);
        if post_slot == pre_slot {
            return Err(InvariantViolation::SlotUnchangedAfterUpdate { slot: pre_slot }.into());
        }
        self.slots.validate_slot_mounted(self.session.as_mut(), post_slot)?;

        if check_capsule {
            let status = self.slots.capsule_update_status(self.session.as_mut())?;
            if status != Some(1) {
                return Err(InvariantViolation::CapsuleStatus {
                    expected: 1,
                    observed: status,
                }
                .into());
            }
            if self.slots.is_capsule_update_forced(self.session.as_mut())? {
                return Err(InvariantViolation::CapsuleStillForced.into());
            }
            log::info!("Capsule update verified on slot {}", post_slot);
        }

        Ok(CycleOutcome {
            pre_slot,
            post_slot,
            transfer_attempts: 0,
        })
    }

    /// One full update: fresh session, transfer, optional version mismatch,
    /// update tool, then [`Harness::verify_update`]. Forced capsule updates
    /// are verified with the capsule checks.
    pub fn update_cycle(&mut self, force_capsule: bool) -> Result<CycleOutcome> {
        self.update_cycle_with(force_capsule, force_capsule)
    }

    /// [`Harness::update_cycle`] with the capsule checks chosen separately.
    pub fn update_cycle_with(
        &mut self,
        force_capsule: bool,
        check_capsule: bool,
    ) -> Result<CycleOutcome> {
        // Host keys change across reboots; never reuse a session here.
        self.session.invalidate();
        self.log_machine_id();

        let transfer_attempts = self.updater.transfer(self.session.as_mut())?;
        if force_capsule {
            self.updater.inject_version_mismatch(self.session.as_mut())?;
        }
        self.updater.run_update_tool(self.session.as_mut())?;

        let outcome = self.verify_update(check_capsule)?;
        Ok(CycleOutcome {
            transfer_attempts,
            ..outcome
        })
    }
}
