//! A/B boot slot queries.
//!
//! Every query is a synchronous remote command whose output is interpreted by a
//! pure parser in this module. Parsers are anchored on key tokens (`slot:`,
//! `status:`, `->`) and tolerate extra whitespace, so they can be exercised
//! without a device.

use crate::channel::RunOptions;
use crate::error::{Error, InvariantViolation, Result};
use crate::session::RemoteSession;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Bootloader control query for the active slot.
pub const CURRENT_SLOT_COMMAND: &str = "nvbootctrl get-current-slot";
/// Bootloader control dump with per-slot status and capsule update status.
pub const SLOTS_INFO_COMMAND: &str = "nvbootctrl dump-slots-info";
/// Directory holding the partition label symlinks.
pub const PARTLABEL_DIR: &str = "/dev/disk/by-partlabel";

const CAPSULE_STATUS_KEY: &str = "capsule update status:";

/// One of the two redundant boot targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum SlotId {
    /// Slot 0, partition label `APP`.
    A,
    /// Slot 1, partition label `APP_b`.
    B,
}

impl SlotId {
    /// Both slots, in bootloader order.
    pub const ALL: [SlotId; 2] = [SlotId::A, SlotId::B];

    /// Maps a bootloader index to a slot. Anything but 0 or 1 is a protocol
    /// violation.
    pub fn from_index(index: i64) -> Result<Self> {
        match index {
            0 => Ok(SlotId::A),
            1 => Ok(SlotId::B),
            other => Err(Error::Protocol(format!("invalid slot {}", other))),
        }
    }

    /// The bootloader index of this slot.
    pub fn index(self) -> u8 {
        match self {
            SlotId::A => 0,
            SlotId::B => 1,
        }
    }

    /// The other slot.
    pub fn other(self) -> Self {
        match self {
            SlotId::A => SlotId::B,
            SlotId::B => SlotId::A,
        }
    }

    /// Partition label of the application filesystem for this slot.
    pub fn partition_label(self) -> &'static str {
        match self {
            SlotId::A => "APP",
            SlotId::B => "APP_b",
        }
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.index())
    }
}

impl From<SlotId> for u8 {
    fn from(slot: SlotId) -> u8 {
        slot.index()
    }
}

impl TryFrom<u8> for SlotId {
    type Error = Error;

    fn try_from(index: u8) -> Result<Self> {
        SlotId::from_index(i64::from(index))
    }
}

/// Whether the bootloader considers a slot eligible to boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bootability {
    Normal,
    Unbootable,
}

impl Bootability {
    fn parse(token: &str) -> Result<Self> {
        match token.to_ascii_lowercase().as_str() {
            "normal" => Ok(Bootability::Normal),
            "unbootable" => Ok(Bootability::Unbootable),
            other => Err(Error::Protocol(format!("unknown slot status '{}'", other))),
        }
    }
}

impl fmt::Display for Bootability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Bootability::Normal => write!(f, "normal"),
            Bootability::Unbootable => write!(f, "unbootable"),
        }
    }
}

/// Everything the tracker knows about one slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotStatus {
    pub slot: SlotId,
    /// Device node backing the slot's application partition.
    pub root_device: String,
    pub bootability: Bootability,
    /// A capsule update is pending (forced) since the last boot.
    pub capsule_forced: bool,
}

/// Parses the output of [`CURRENT_SLOT_COMMAND`].
pub fn parse_current_slot(output: &str) -> Result<SlotId> {
    let token = output.trim();
    let index: i64 = token
        .parse()
        .map_err(|_| Error::Protocol(format!("invalid slot '{}'", token)))?;
    SlotId::from_index(index)
}

/// Parses the `Capsule update status:` line of a slot info dump.
///
/// Returns `None` when the line is absent.
pub fn parse_capsule_status(dump: &str) -> Result<Option<i64>> {
    for line in dump.lines() {
        let lower = line.to_ascii_lowercase();
        if let Some(pos) = lower.find(CAPSULE_STATUS_KEY) {
            let value = line[pos + CAPSULE_STATUS_KEY.len()..].trim();
            return value
                .parse()
                .map(Some)
                .map_err(|_| Error::Protocol(format!("invalid capsule update status '{}'", value)));
        }
    }
    Ok(None)
}

/// Parses per-slot bootability from a slot info dump.
///
/// Only lines containing both `slot:` and `status:` are considered and they are
/// taken in order, the first for slot 0 and the second for slot 1.
pub fn parse_slot_bootability(dump: &str) -> Result<[Bootability; 2]> {
    let mut found = Vec::with_capacity(2);
    for line in dump.lines() {
        if !(line.contains("slot:") && line.contains("status:")) {
            continue;
        }
        let token = line
            .split("status:")
            .nth(1)
            .and_then(|rest| rest.split_whitespace().next())
            .map(|t| t.trim_end_matches(','))
            .unwrap_or("");
        found.push(Bootability::parse(token)?);
    }
    match found.as_slice() {
        [a, b] => Ok([*a, *b]),
        other => Err(Error::Protocol(format!(
            "expected 2 slot status entries, found {}",
            other.len()
        ))),
    }
}

/// Resolves the device node from an `ls -la` listing of a partition label.
///
/// `... /dev/disk/by-partlabel/APP -> ../../mmcblk0p1` yields `/dev/mmcblk0p1`.
pub fn parse_label_target(listing: &str) -> Result<String> {
    let target = listing
        .lines()
        .find_map(|line| line.split("->").nth(1))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| Error::Protocol(format!("no symlink target in '{}'", listing.trim())))?;

    if target.starts_with("/dev/") {
        return Ok(target.to_string());
    }
    match target.rsplit('/').next() {
        Some(node) if !node.is_empty() && node != ".." => Ok(format!("/dev/{}", node)),
        _ => Err(Error::Protocol(format!("unexpected symlink target '{}'", target))),
    }
}

/// Queries and interprets boot slot state on the device.
#[derive(Debug, Clone)]
pub struct SlotStateTracker {
    capsule_marker: String,
}

impl SlotStateTracker {
    /// Creates a tracker that looks for `capsule_marker` in the boot journal.
    pub fn new(capsule_marker: impl Into<String>) -> Self {
        Self {
            capsule_marker: capsule_marker.into(),
        }
    }

    fn bootctrl(&self, session: &mut dyn RemoteSession, command: &str) -> Result<String> {
        log::debug!("{}", command);
        Ok(session
            .run(command, RunOptions::new())?
            .stdout)
    }

    /// The currently active slot.
    pub fn current_slot(&self, session: &mut dyn RemoteSession) -> Result<SlotId> {
        let out = self.bootctrl(session, CURRENT_SLOT_COMMAND)?;
        parse_current_slot(&out)
    }

    /// The slot that is not `slot`.
    pub fn alternate_slot(slot: SlotId) -> SlotId {
        slot.other()
    }

    /// Device node bound to `slot`'s application partition label.
    pub fn root_device_for_slot(
        &self,
        session: &mut dyn RemoteSession,
        slot: SlotId,
    ) -> Result<String> {
        let cmd = format!("ls -la {}/{}", PARTLABEL_DIR, slot.partition_label());
        let out = session.run(&cmd, RunOptions::new())?;
        parse_label_target(&out.stdout)
    }

    /// Fails with an assertion unless `slot`'s device node is mounted.
    pub fn validate_slot_mounted(
        &self,
        session: &mut dyn RemoteSession,
        slot: SlotId,
    ) -> Result<()> {
        let device = self.root_device_for_slot(session, slot)?;
        let cmd = format!("mount | grep '{} '", device);
        let out = session.run(&cmd, RunOptions::new().allow_failure())?;
        if out.success() {
            log::debug!("Slot {} root {} is mounted", slot, device);
            Ok(())
        } else {
            Err(InvariantViolation::NotMounted { slot, device }.into())
        }
    }

    /// Capsule update status from the slot info dump; `Some(1)` means success.
    pub fn capsule_update_status(&self, session: &mut dyn RemoteSession) -> Result<Option<i64>> {
        let dump = self.bootctrl(session, SLOTS_INFO_COMMAND)?;
        parse_capsule_status(&dump)
    }

    /// Bootability of slot 0 and slot 1, in that order.
    pub fn slot_bootability(&self, session: &mut dyn RemoteSession) -> Result<[Bootability; 2]> {
        let dump = self.bootctrl(session, SLOTS_INFO_COMMAND)?;
        parse_slot_bootability(&dump)
    }

    /// The boot-scoped journal query for the forced capsule marker.
    pub fn capsule_forced_command(&self) -> String {
        format!(
            "journalctl -b 0 --no-pager | grep -i '{}'",
            self.capsule_marker
        )
    }

    /// Returns `true` if the update tool forced a capsule update since boot.
    pub fn is_capsule_update_forced(&self, session: &mut dyn RemoteSession) -> Result<bool> {
        let cmd = self.capsule_forced_command();
        let out = session.run(
            &cmd,
            RunOptions::new().allow_failure(),
        )?;
        Ok(out.success() && !out.stdout.trim().is_empty())
    }

    /// Marks `slot` as the next boot target.
    pub fn set_active_boot_slot(&self, session: &mut dyn RemoteSession, slot: SlotId) -> Result<()> {
        let cmd = format!("nvbootctrl set-active-boot-slot {}", slot);
        log::info!("Switching active boot slot to {}", slot);
        self.bootctrl(session, &cmd).map(|_| ())
    }

    /// Collects the full status of `slot`.
    pub fn slot_status(&self, session: &mut dyn RemoteSession, slot: SlotId) -> Result<SlotStatus> {
        let root_device = self.root_device_for_slot(session, slot)?;
        let bootability = self.slot_bootability(session)?[usize::from(slot.index())];
        let capsule_forced = self.is_capsule_update_forced(session)?;
        Ok(SlotStatus {
            slot,
            root_device,
            bootability,
            capsule_forced,
        })
    }

    /// Asserts that `slot` reports `expected` bootability.
    pub fn expect_bootability(
        &self,
        session: &mut dyn RemoteSession,
        slot: SlotId,
        expected: Bootability,
    ) -> Result<()> {
        let observed = self.slot_bootability(session)?[usize::from(slot.index())];
        if observed != expected {
            return Err(InvariantViolation::Bootability {
                slot,
                expected,
                observed,
            }
            .into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DUMP: &str = "\
Current version: 36.3.0
Capsule update status: 1
Current bootloader slot: A
Active bootloader slot: A
num_slots: 2
slot: 0,             status: normal
slot: 1,             status: unbootable
";

    #[test]
    fn test_parse_current_slot() {
        assert_eq!(parse_current_slot("0\n").unwrap(), SlotId::A);
        assert_eq!(parse_current_slot("  1  ").unwrap(), SlotId::B);
    }

    #[test]
    fn test_parse_current_slot_rejects_out_of_range() {
        for bad in ["2", "-1", "", "A", "0 1"] {
            let err = parse_current_slot(bad).unwrap_err();
            assert!(matches!(err, Error::Protocol(_)), "{bad:?} -> {err}");
        }
    }

    #[test]
    fn test_alternate_slot_idempotent() {
        for slot in SlotId::ALL {
            let alt = SlotStateTracker::alternate_slot(slot);
            assert_ne!(alt, slot);
            assert_eq!(SlotStateTracker::alternate_slot(alt), slot);
        }
    }

    #[test]
    fn test_parse_capsule_status() {
        assert_eq!(parse_capsule_status(DUMP).unwrap(), Some(1));
        assert_eq!(
            parse_capsule_status("CAPSULE UPDATE STATUS:   0\n").unwrap(),
            Some(0)
        );
        assert_eq!(parse_capsule_status("num_slots: 2\n").unwrap(), None);
        assert!(parse_capsule_status("Capsule update status: n/a").is_err());
    }

    #[test]
    fn test_parse_slot_bootability() {
        assert_eq!(
            parse_slot_bootability(DUMP).unwrap(),
            [Bootability::Normal, Bootability::Unbootable]
        );
        let tight = "slot:0,status:normal\nslot: 1, status:   unbootable\n";
        assert_eq!(
            parse_slot_bootability(tight).unwrap(),
            [Bootability::Normal, Bootability::Unbootable]
        );
        let spaced = "slot: 0, status: normal\n  slot: 1,\tstatus:\tnormal  \n";
        assert_eq!(
            parse_slot_bootability(spaced).unwrap(),
            [Bootability::Normal, Bootability::Normal]
        );
    }

    #[test]
    fn test_parse_slot_bootability_requires_two_entries() {
        assert!(parse_slot_bootability("slot: 0, status: normal\n").is_err());
        assert!(parse_slot_bootability("").is_err());
        assert!(parse_slot_bootability("slot: 0, status: broken\nslot: 1, status: normal").is_err());
    }

    #[test]
    fn test_parse_label_target() {
        let listing =
            "lrwxrwxrwx 1 root root 15 Jan  1 00:00 /dev/disk/by-partlabel/APP -> ../../mmcblk0p1\n";
        assert_eq!(parse_label_target(listing).unwrap(), "/dev/mmcblk0p1");
        let absolute = "lrwxrwxrwx 1 root root 15 APP_b -> /dev/nvme0n1p2";
        assert_eq!(parse_label_target(absolute).unwrap(), "/dev/nvme0n1p2");
        assert!(parse_label_target("ls: cannot access").is_err());
        assert!(parse_label_target("APP -> ").is_err());
    }

    #[test]
    fn test_slot_display_and_serde() {
        assert_eq!(SlotId::A.to_string(), "0");
        assert_eq!(SlotId::B.to_string(), "1");
        assert_eq!(serde_json::to_string(&SlotId::B).unwrap(), "1");
        assert_eq!(serde_json::from_str::<SlotId>("0").unwrap(), SlotId::A);
        assert!(serde_json::from_str::<SlotId>("2").is_err());
        assert_eq!(Bootability::Unbootable.to_string(), "unbootable");
    }

    #[test]
    fn test_partition_labels() {
        assert_eq!(SlotId::A.partition_label(), "APP");
        assert_eq!(SlotId::B.partition_label(), "APP_b");
    }
}
