//! Simulated A/B device.
//!
//! [`MockDevice`] models just enough of a Tegra style target to drive every
//! scenario without hardware: two slots with bootability, a capsule update
//! status, the journal marker for forced capsule updates, a staged update that
//! is applied on the next boot, and a power state that answers pings while
//! shutting down, stops answering while off, and comes back after a scripted
//! number of polls.
//!
//! Faults can be injected: failed uploads, refused connections, a bad capsule
//! status, a failing update tool, an out-of-range slot id and a power
//! interruption during boot.
//!
//! # Example
//! ```
//! use ab_torture::mock::MockDevice;
//! use ab_torture::{Config, Harness, SlotId};
//!
//! let device = MockDevice::new();
//! let mut harness = Harness::new(
//!     &Config::test_mode(),
//!     Box::new(device.clone()),
//!     Box::new(device.clone()),
//! );
//! let outcome = harness.reboot_only().unwrap();
//! assert_eq!(outcome.post_slot, SlotId::A);
//! assert_eq!(device.state().reboots, 1);
//! ```

use crate::channel::{effective_command, CommandChannel, CommandOutput, Connector, RunOptions};
use crate::config::DeviceTarget;
use crate::error::{Error, Result};
use crate::payload::{file_sha256, MACHINE_ID_COMMAND};
use crate::reachability::Pinger;
use crate::recovery::Operator;
use crate::session::LIVENESS_COMMAND;
use crate::slot::{Bootability, SlotId, CURRENT_SLOT_COMMAND, PARTLABEL_DIR, SLOTS_INFO_COMMAND};
use std::cell::{Ref, RefCell, RefMut};
use std::collections::VecDeque;
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;

/// Journal line emitted by the simulated update tool when it forces a capsule.
pub const FORCED_CAPSULE_LOG: &str = "swupdate[812]: Version mismatch, forcing capsule update";

/// Machine id reported by the simulated device.
pub const MOCK_MACHINE_ID: &str = "4c4c4544004b4a10805ab4c04f4e3732";

/// Power state of the simulated device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Power {
    Up,
    /// Still answering pings for the given number of polls.
    ShuttingDown(u32),
    /// Silent for the given number of polls, then boots.
    Down(u32),
}

/// A fault applied to the next upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadFault {
    Timeout,
    Refused,
    /// The upload succeeds but the payload on the device is damaged.
    Corrupt,
}

/// An update installed into the alternate slot, applied on the next boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagedUpdate {
    pub capsule: bool,
}

/// Mutable state of the simulated device. Every field is public so tests can
/// arrange and inspect it directly.
#[derive(Debug, Clone)]
pub struct DeviceState {
    /// Reported by `nvbootctrl get-current-slot`; may be set out of range.
    pub slot_index: i64,
    pub bootability: [Bootability; 2],
    /// `None` omits the line from the slot info dump.
    pub capsule_status: Option<i64>,
    /// Capsule status reported after the next successful capsule update.
    pub capsule_result: Option<i64>,
    pub capsule_forced: bool,
    /// Capsule updates never clear the forced state.
    pub capsule_stuck: bool,
    pub versions_mismatched: bool,
    pub staged: Option<StagedUpdate>,
    pub pending_active: Option<SlotId>,
    pub power: Power,
    /// Pings answered after a reboot command before going silent.
    pub shutdown_polls: u32,
    /// Pings left unanswered before the device is back.
    pub down_polls: u32,
    /// Power was cut while the device was booting.
    pub interrupted: bool,
    pub upload_faults: VecDeque<UploadFault>,
    /// Connections refused before accepting again.
    pub refuse_connects: u32,
    /// Connections refused right after each boot, while sshd is still starting.
    pub refuse_after_boot: u32,
    pub update_exit_code: i32,
    /// UEFI `VarErrorFlag` still reads `ff`.
    pub var_error_flag_clear: bool,
    pub payload_digest: Option<String>,
    pub boot_count: u64,
    pub uploads: u32,
    pub connects: u32,
    /// Channels currently open, and the most ever open at once.
    pub live_channels: u32,
    pub max_live_channels: u32,
    pub reboots: u32,
    /// Every command received, as it would run on the device.
    pub commands: Vec<String>,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            slot_index: 0,
            bootability: [Bootability::Normal; 2],
            capsule_status: Some(1),
            capsule_result: Some(1),
            capsule_forced: false,
            capsule_stuck: false,
            versions_mismatched: false,
            staged: None,
            pending_active: None,
            power: Power::Up,
            shutdown_polls: 0,
            down_polls: 1,
            interrupted: false,
            upload_faults: VecDeque::new(),
            refuse_connects: 0,
            refuse_after_boot: 0,
            update_exit_code: 0,
            var_error_flag_clear: true,
            payload_digest: None,
            boot_count: 0,
            uploads: 0,
            connects: 0,
            live_channels: 0,
            max_live_channels: 0,
            reboots: 0,
            commands: Vec::new(),
        }
    }
}

impl DeviceState {
    fn current(&self) -> Option<SlotId> {
        SlotId::from_index(self.slot_index).ok()
    }

    fn root_device(slot: SlotId) -> String {
        format!("/dev/mmcblk0p{}", slot.index() + 1)
    }

    fn slots_info(&self) -> String {
        let name = |i: i64| if i == 1 { "B" } else { "A" };
        let mut dump = String::from("Current version: 36.3.0\n");
        if let Some(status) = self.capsule_status {
            dump.push_str(&format!("Capsule update status: {}\n", status));
        }
        dump.push_str(&format!("Current bootloader slot: {}\n", name(self.slot_index)));
        dump.push_str(&format!("Active bootloader slot: {}\n", name(self.slot_index)));
        dump.push_str("num_slots: 2\n");
        for (i, b) in self.bootability.iter().enumerate() {
            dump.push_str(&format!("slot: {},             status: {}\n", i, b));
        }
        dump
    }

    fn boot(&mut self) {
        self.power = Power::Up;
        self.boot_count += 1;
        self.refuse_connects = self.refuse_after_boot;
        let Some(current) = self.current() else {
            return;
        };
        let alternate = current.other();
        let idx = |s: SlotId| usize::from(s.index());

        if self.interrupted {
            // The capsule never finished: stay put, the target slot is left
            // unbootable and the capsule is still pending.
            self.interrupted = false;
            self.staged = None;
            self.bootability[idx(alternate)] = Bootability::Unbootable;
            self.capsule_forced = true;
        } else if let Some(staged) = self.staged.take() {
            self.slot_index = i64::from(alternate.index());
            self.bootability = [Bootability::Normal; 2];
            self.capsule_forced = staged.capsule && self.capsule_stuck;
            if staged.capsule {
                self.capsule_status = self.capsule_result;
                self.versions_mismatched = false;
            }
        } else if let Some(target) = self.pending_active.take() {
            if self.bootability[idx(target)] == Bootability::Normal {
                self.slot_index = i64::from(target.index());
            }
        }
        self.pending_active = None;
    }

    fn execute(&mut self, command: &str) -> CommandOutput {
        match command {
            LIVENESS_COMMAND => return CommandOutput::ok("connection test\n"),
            "reboot" => {
                self.reboots += 1;
                self.power = Power::ShuttingDown(self.shutdown_polls);
                return CommandOutput::ok("");
            }
            CURRENT_SLOT_COMMAND => return CommandOutput::ok(format!("{}\n", self.slot_index)),
            SLOTS_INFO_COMMAND => return CommandOutput::ok(self.slots_info()),
            MACHINE_ID_COMMAND => return CommandOutput::ok(format!("{}\n", MOCK_MACHINE_ID)),
            _ => {}
        }

        if let Some(slot) = command.strip_prefix("nvbootctrl set-active-boot-slot ") {
            return match slot.trim().parse().map(SlotId::from_index) {
                Ok(Ok(slot)) => {
                    self.pending_active = Some(slot);
                    CommandOutput::ok("")
                }
                _ => CommandOutput::failed(1, "invalid slot"),
            };
        }

        if let Some(label) = command.strip_prefix(&format!("ls -la {}/", PARTLABEL_DIR)) {
            let node = match label.trim() {
                "APP" => "mmcblk0p1",
                "APP_b" => "mmcblk0p2",
                other => {
                    return CommandOutput::failed(
                        2,
                        format!("ls: cannot access '{}': No such file or directory", other),
                    )
                }
            };
            return CommandOutput::ok(format!(
                "lrwxrwxrwx 1 root root 15 Oct 18 09:12 {}/{} -> ../../{}\n",
                PARTLABEL_DIR,
                label.trim(),
                node
            ));
        }

        if let Some(rest) = command.strip_prefix("mount | grep '") {
            let device = rest.trim_end_matches('\'').trim_end();
            return match self.current() {
                Some(slot) if DeviceState::root_device(slot) == device => {
                    CommandOutput::ok(format!("{} on / type ext4 (rw,relatime)\n", device))
                }
                _ => CommandOutput::failed(1, ""),
            };
        }

        if command.starts_with("journalctl") {
            return if self.capsule_forced {
                CommandOutput::ok(format!("{}\n", FORCED_CAPSULE_LOG))
            } else {
                CommandOutput::failed(1, "")
            };
        }

        if command.starts_with("sed -i -E") {
            self.versions_mismatched = true;
            return CommandOutput::ok("");
        }

        if let Some(path) = command.strip_prefix("sha256sum ") {
            return match &self.payload_digest {
                Some(digest) => CommandOutput::ok(format!("{}  {}\n", digest, path)),
                None => CommandOutput::failed(1, format!("sha256sum: {}: No such file", path)),
            };
        }

        if command.starts_with("efivar") {
            return if self.var_error_flag_clear {
                CommandOutput::ok("0000: ff\n")
            } else {
                CommandOutput::failed(1, "")
            };
        }

        if command.contains("swupdate") {
            if self.payload_digest.is_none() {
                return CommandOutput::failed(1, "swupdate: cannot open image");
            }
            if self.update_exit_code != 0 {
                return CommandOutput::failed(self.update_exit_code, "swupdate: installation failed");
            }
            let capsule = self.versions_mismatched;
            if capsule {
                self.capsule_forced = true;
            }
            self.staged = Some(StagedUpdate { capsule });
            return CommandOutput::ok("SWUPDATE successful !\n");
        }

        CommandOutput::failed(127, format!("sh: {}: not found", command))
    }
}

/// A handle to a simulated device. Clones share the same device.
#[derive(Debug, Clone, Default)]
pub struct MockDevice {
    state: Rc<RefCell<DeviceState>>,
}

impl MockDevice {
    /// A powered-up device on slot 0 with both slots bootable.
    pub fn new() -> Self {
        Self::default()
    }

    /// A device booted from `slot`.
    pub fn on_slot(slot: SlotId) -> Self {
        let device = Self::new();
        device.state_mut().slot_index = i64::from(slot.index());
        device
    }

    pub fn state(&self) -> Ref<'_, DeviceState> {
        self.state.borrow()
    }

    pub fn state_mut(&self) -> RefMut<'_, DeviceState> {
        self.state.borrow_mut()
    }

    /// Queues upload faults, consumed one per upload.
    pub fn fail_uploads(&self, faults: impl IntoIterator<Item = UploadFault>) {
        self.state_mut().upload_faults.extend(faults);
    }

    /// Cuts power while the device is down, abandoning any capsule in progress.
    pub fn interrupt_power(&self) {
        let mut state = self.state_mut();
        state.interrupted = true;
        if state.power == Power::Up {
            state.power = Power::Down(state.down_polls);
        }
    }

    /// Number of commands received whose text starts with `prefix`.
    pub fn count_commands(&self, prefix: &str) -> usize {
        self.state()
            .commands
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }
}

impl Connector for MockDevice {
    fn connect(&self, target: &DeviceTarget, _timeout: Duration) -> Result<Box<dyn CommandChannel>> {
        let mut state = self.state_mut();
        if state.power != Power::Up {
            return Err(Error::connection(&target.host, "No route to host"));
        }
        if state.refuse_connects > 0 {
            state.refuse_connects -= 1;
            return Err(Error::connection(&target.host, "Connection refused"));
        }
        state.connects += 1;
        state.live_channels += 1;
        state.max_live_channels = state.max_live_channels.max(state.live_channels);
        Ok(Box::new(MockChannel {
            device: self.clone(),
            host: target.host.clone(),
            boot: state.boot_count,
            open: true,
        }))
    }
}

impl Pinger for MockDevice {
    fn ping(&mut self, host: &str) -> Result<bool> {
        if host.is_empty() {
            return Err(Error::Protocol("invalid ping target ''".into()));
        }
        let mut state = self.state_mut();
        let power = state.power;
        let (next, reachable) = match power {
            Power::Up => (Power::Up, true),
            Power::ShuttingDown(0) => (Power::Down(state.down_polls), false),
            Power::ShuttingDown(n) => (Power::ShuttingDown(n - 1), true),
            Power::Down(0) => {
                state.boot();
                (Power::Up, true)
            }
            Power::Down(n) => (Power::Down(n - 1), false),
        };
        state.power = next;
        Ok(reachable)
    }
}

struct MockChannel {
    device: MockDevice,
    host: String,
    boot: u64,
    open: bool,
}

impl MockChannel {
    fn ensure_live(&self, state: &DeviceState) -> Result<()> {
        if !self.open || state.power != Power::Up || state.boot_count != self.boot {
            return Err(Error::connection(&self.host, "Connection reset by peer"));
        }
        Ok(())
    }
}

impl CommandChannel for MockChannel {
    fn run(&mut self, command: &str, opts: &RunOptions) -> Result<CommandOutput> {
        let mut state = self.device.state_mut();
        self.ensure_live(&state)?;
        state.commands.push(effective_command(command, opts));
        let output = state.execute(command);
        output.check(command, opts)
    }

    fn upload(&mut self, local: &Path, remote: &str, timeout: Option<Duration>) -> Result<()> {
        let digest = file_sha256(local)?;
        let mut state = self.device.state_mut();
        self.ensure_live(&state)?;
        state.uploads += 1;
        match state.upload_faults.pop_front() {
            Some(UploadFault::Timeout) => Err(Error::timeout(
                format!("upload to {}", remote),
                timeout.unwrap_or_default(),
            )),
            Some(UploadFault::Refused) => {
                Err(Error::connection(&self.host, "Connection closed during transfer"))
            }
            Some(UploadFault::Corrupt) => {
                state.payload_digest = Some("0".repeat(64));
                Ok(())
            }
            None => {
                state.payload_digest = Some(digest);
                Ok(())
            }
        }
    }

    fn close(&mut self) {
        if self.open {
            self.open = false;
            self.device.state_mut().live_channels -= 1;
        }
    }
}

impl Drop for MockChannel {
    fn drop(&mut self) {
        self.close();
    }
}

/// Operator stand-in that cuts the simulated device's power when asked.
#[derive(Debug, Clone)]
pub struct PowerCycleOperator {
    device: MockDevice,
    prompts: Vec<String>,
}

impl PowerCycleOperator {
    pub fn new(device: MockDevice) -> Self {
        Self {
            device,
            prompts: Vec::new(),
        }
    }

    /// Prompts shown so far.
    pub fn prompts(&self) -> &[String] {
        &self.prompts
    }
}

impl Operator for PowerCycleOperator {
    fn confirm(&mut self, prompt: &str) -> Result<()> {
        self.prompts.push(prompt.to_string());
        self.device.interrupt_power();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> DeviceTarget {
        DeviceTarget {
            host: "mock-device".into(),
            ..DeviceTarget::default()
        }
    }

    #[test]
    fn test_mock_reports_slot_and_dump() {
        let device = MockDevice::on_slot(SlotId::B);
        let mut ch = device.connect(&target(), Duration::ZERO).unwrap();
        let out = ch.run(CURRENT_SLOT_COMMAND, &RunOptions::new()).unwrap();
        assert_eq!(out.stdout, "1\n");
        let dump = ch.run(SLOTS_INFO_COMMAND, &RunOptions::new()).unwrap();
        assert!(dump.stdout.contains("Capsule update status: 1"));
        assert!(dump.stdout.contains("slot: 1,             status: normal"));
    }

    #[test]
    fn test_mock_power_cycle_via_ping() {
        let mut device = MockDevice::new();
        device.state_mut().shutdown_polls = 1;
        let mut ch = device.connect(&target(), Duration::ZERO).unwrap();
        ch.run("reboot", &RunOptions::new()).unwrap();

        assert!(device.ping("mock-device").unwrap());
        assert!(!device.ping("mock-device").unwrap());
        assert!(device.connect(&target(), Duration::ZERO).is_err());
        assert!(!device.ping("mock-device").unwrap());
        assert!(device.ping("mock-device").unwrap());
        assert_eq!(device.state().boot_count, 1);

        // the old channel belongs to the previous boot
        assert!(ch.run(LIVENESS_COMMAND, &RunOptions::new()).is_err());
        assert!(device.connect(&target(), Duration::ZERO).is_ok());
    }

    #[test]
    fn test_mock_staged_update_switches_slot() {
        let mut state = DeviceState {
            staged: Some(StagedUpdate { capsule: false }),
            ..DeviceState::default()
        };
        state.boot();
        assert_eq!(state.slot_index, 1);
    }

    #[test]
    fn test_mock_interrupted_boot_keeps_slot() {
        let mut state = DeviceState {
            staged: Some(StagedUpdate { capsule: true }),
            interrupted: true,
            ..DeviceState::default()
        };
        state.boot();
        assert_eq!(state.slot_index, 0);
        assert_eq!(state.bootability, [Bootability::Normal, Bootability::Unbootable]);
        assert!(state.capsule_forced);
        assert!(state.staged.is_none());
    }

    #[test]
    fn test_mock_refuses_switch_to_unbootable_slot() {
        let mut state = DeviceState {
            bootability: [Bootability::Normal, Bootability::Unbootable],
            pending_active: Some(SlotId::B),
            ..DeviceState::default()
        };
        state.boot();
        assert_eq!(state.slot_index, 0);
        assert!(state.pending_active.is_none());
    }

    #[test]
    fn test_mock_mount_check() {
        let mut state = DeviceState::default();
        assert!(state.execute("mount | grep '/dev/mmcblk0p1 '").success());
        assert!(!state.execute("mount | grep '/dev/mmcblk0p2 '").success());
    }

    #[test]
    fn test_mock_unknown_command() {
        let mut state = DeviceState::default();
        assert_eq!(state.execute("frobnicate").exit_code, 127);
    }
}
