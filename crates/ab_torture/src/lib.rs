#![doc = include_str!("../README.md")]
//! # A/B Torture - Dual Slot Update Stress Tester
//!
//! Drives a remote embedded device with A/B boot slots through repeated
//! reboot and update cycles, asserting after each cycle which slot is active,
//! which slots are bootable and whether a capsule update is still pending.
//!
//! ## Overview
//!
//! The crate is split into a connectivity layer and a verification layer:
//!
//! - **Connectivity**: [`SessionManager`] owns the single management session
//!   and proves liveness on demand; [`ReachabilityMonitor`] watches ICMP
//!   reachability; [`RebootOrchestrator`] sequences "gone, back, stable".
//! - **Verification**: [`SlotStateTracker`] interprets bootloader state;
//!   [`UpdateCampaign`] runs the torture loop; [`RecoveryScenarios`] walks the
//!   two guided power interruption scenarios; [`RollingReboot`] repeats plain
//!   reboots.
//!
//! Every remote call is synchronous. Reachability polling and reboot
//! confirmation wait forever unless [`TimingConfig::max_wait`] is set.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ab_torture::{Config, Harness, IcmpPinger, SshConnector, UpdateCampaign};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = Config::default();
//!     config.target.host = "192.168.1.50".into();
//!     config.update.update_file = Some("image.swu".into());
//!     config.validate_for_updates()?;
//!
//!     let mut harness = Harness::new(
//!         &config,
//!         Box::new(SshConnector::new()),
//!         Box::new(IcmpPinger::new(config.timing.ping_wait)),
//!     );
//!     let report = UpdateCampaign::new(&config.campaign).run(&mut harness)?;
//!     println!("{} updates", report.stats.updates());
//!     Ok(())
//! }
//! ```
//!
//! ## Simulated Device
//!
//! [`mock::MockDevice`] stands in for hardware in tests and dry runs:
//!
//! ```
//! use ab_torture::mock::MockDevice;
//! use ab_torture::{Config, Harness, SlotId, UpdateCampaign};
//!
//! let payload = tempfile::NamedTempFile::new().unwrap();
//! let mut config = Config::test_mode();
//! config.update.update_file = Some(payload.path().to_path_buf());
//! config.campaign.num_updates = 2;
//!
//! let device = MockDevice::new();
//! let mut harness = Harness::new(&config, Box::new(device.clone()), Box::new(device.clone()));
//! let report = UpdateCampaign::new(&config.campaign).run(&mut harness).unwrap();
//!
//! assert_eq!(report.stats.normal_updates, 2);
//! assert_eq!(harness.current_slot().unwrap(), SlotId::A);
//! ```

pub mod campaign;
pub mod channel;
pub mod config;
pub mod error;
pub mod harness;
pub mod mock;
pub mod payload;
pub mod reachability;
pub mod reboot;
pub mod recovery;
pub mod rolling;
pub mod session;
pub mod slot;
pub mod ssh;

// Re-exports
pub use campaign::{ActionKind, CampaignReport, CampaignStats, UpdateAttempt, UpdateCampaign};
pub use channel::{CommandChannel, CommandOutput, Connector, RunOptions};
pub use config::{
    CampaignConfig, Config, ConfigError, Credential, DeviceTarget, TimingConfig, UpdateConfig,
};
pub use error::{Error, InvariantViolation, Result};
pub use harness::{CycleOutcome, Harness};
pub use payload::UpdateDriver;
pub use reachability::{IcmpPinger, PingFlavor, Pinger, ReachabilityMonitor};
pub use reboot::{RebootOrchestrator, RebootPhase, Rebootable};
pub use recovery::{ConsoleOperator, Operator, RecoveryReport, RecoveryScenarios};
pub use rolling::{RollingConfig, RollingReboot, RollingReport};
pub use session::{RemoteSession, SessionManager};
pub use slot::{Bootability, SlotId, SlotStateTracker, SlotStatus};
pub use ssh::{SshChannel, SshConnector};

/// Version information for the crate.
///
/// # Examples
///
/// ```
/// # use ab_torture::VERSION;
/// println!("ab-torture version: {}", VERSION);
/// ```
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Environment variable overriding the reachability poll interval.
///
/// Set this to a number of milliseconds.
pub const ENV_POLL_INTERVAL_MS: &str = "AB_TORTURE_POLL_INTERVAL_MS";

/// Environment variable capping every otherwise unbounded wait, in seconds.
pub const ENV_MAX_WAIT_SECS: &str = "AB_TORTURE_MAX_WAIT_SECS";

/// Environment variable seeding the random action selection.
pub const ENV_SEED: &str = "AB_TORTURE_SEED";

/// Environment variable holding the log filter, in `env_logger` syntax.
pub const ENV_LOG: &str = "AB_TORTURE_LOG";
