//! Configuration for a torture-test run.
//!
//! A [`Config`] is built once at start-up (from the command line and the
//! environment), validated, and then passed by reference into every component.
//! Nothing mutates it afterwards.
//!
//! # Configuration Presets
//!
//! - [`Config::default()`] - timings used against real hardware
//! - [`Config::test_mode()`] - zero delays, for tests against
//!   [`MockDevice`](crate::mock::MockDevice)
//!
//! # Examples
//!
//! ```
//! # use ab_torture::{Config, Credential};
//! let mut config = Config::default();
//! config.target.host = "192.168.1.50".to_string();
//! config.target.credential = Credential::select(None, Some("secret".into()));
//! config.validate().unwrap();
//! ```

use crate::{ENV_MAX_WAIT_SECS, ENV_POLL_INTERVAL_MS, ENV_SEED};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// The user assumed when none is given.
pub const DEFAULT_USER: &str = "root";

/// How to authenticate against the device.
///
/// Selection precedence is key file, then password, then no authentication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Credential {
    /// Authenticate with a private key file.
    KeyFile(PathBuf),
    /// Authenticate with a password.
    Password(String),
    /// Passwordless login with key discovery disabled.
    None,
}

impl Credential {
    /// Picks a credential following the key > password > none precedence.
    ///
    /// # Examples
    ///
    /// ```
    /// # use ab_torture::Credential;
    /// let c = Credential::select(Some("id_ed25519".into()), Some("pw".into()));
    /// assert!(matches!(c, Credential::KeyFile(_)));
    /// assert_eq!(Credential::select(None, None), Credential::None);
    /// ```
    pub fn select(key: Option<PathBuf>, password: Option<String>) -> Self {
        match (key, password) {
            (Some(key), _) => Credential::KeyFile(key),
            (None, Some(password)) => Credential::Password(password),
            (None, None) => Credential::None,
        }
    }
}

impl Default for Credential {
    fn default() -> Self {
        Self::None
    }
}

/// Identifies the device under test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceTarget {
    /// IP address or host name of the device.
    pub host: String,
    /// SSH user name.
    pub user: String,
    /// Authentication material.
    #[serde(skip_serializing, default)]
    pub credential: Credential,
    /// Reboot through `sudo`. Every other command is sent as is.
    pub elevated: bool,
}

impl Default for DeviceTarget {
    fn default() -> Self {
        Self {
            host: String::new(),
            user: DEFAULT_USER.to_string(),
            credential: Credential::None,
            elevated: false,
        }
    }
}

impl DeviceTarget {
    /// `user@host`, as used on ssh command lines.
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

/// Delays and timeouts.
///
/// The reachability polls and the reboot confirmation loop are unbounded unless
/// `max_wait` is set: a device that never returns keeps the run waiting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Budget for establishing the transport.
    pub connect_timeout: Duration,
    /// Budget for one liveness check, connection included.
    pub verify_timeout: Duration,
    /// Budget for the no-op command run inside a liveness check.
    pub verify_command_timeout: Duration,
    /// Budget for a single payload upload.
    pub transfer_timeout: Duration,
    /// Pause between failed payload uploads.
    pub transfer_retry_interval: Duration,
    /// Pause between reachability polls.
    pub poll_interval: Duration,
    /// Bounded wait for a single ICMP echo reply.
    pub ping_wait: Duration,
    /// Delay between the first and second liveness checks after boot.
    pub confirm_short_delay: Duration,
    /// Delay between the second and third liveness checks after boot.
    pub confirm_long_delay: Duration,
    /// Pause before restarting the confirmation phase after a failure.
    pub confirm_retry_interval: Duration,
    /// Optional cap on every unbounded wait. `None` waits forever.
    pub max_wait: Option<Duration>,
    /// Timeout for short informational queries (machine id).
    pub query_timeout: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
            verify_timeout: Duration::from_secs(5),
            verify_command_timeout: Duration::from_secs(3),
            transfer_timeout: Duration::from_secs(600),
            transfer_retry_interval: Duration::from_secs(3),
            poll_interval: Duration::from_millis(500),
            ping_wait: Duration::from_secs(1),
            confirm_short_delay: Duration::from_secs(3),
            confirm_long_delay: Duration::from_secs(15),
            confirm_retry_interval: Duration::from_secs(3),
            max_wait: None,
            query_timeout: Duration::from_secs(3),
        }
    }
}

impl TimingConfig {
    /// All delays zeroed, for simulated devices.
    pub fn instant() -> Self {
        Self {
            transfer_retry_interval: Duration::ZERO,
            poll_interval: Duration::ZERO,
            confirm_short_delay: Duration::ZERO,
            confirm_long_delay: Duration::ZERO,
            confirm_retry_interval: Duration::ZERO,
            ..Self::default()
        }
    }
}

/// Where the update payload goes and how the update tool is driven.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateConfig {
    /// Local update payload.
    pub update_file: Option<PathBuf>,
    /// Destination of the payload on the device.
    pub remote_path: String,
    /// Shell command that runs the update tool against `remote_path`.
    pub update_command: String,
    /// File whose version tokens are replaced with `0.0.0` to force a mismatch.
    pub version_file: String,
    /// Journal marker logged by the update tool when it forces a capsule update.
    pub capsule_marker: String,
    /// Compare the remote `sha256sum` of the payload with the local digest.
    pub verify_checksum: bool,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        let remote_path = "/tmp/swupdate.swu".to_string();
        Self {
            update_file: None,
            update_command: format!(
                "bash -c 'source /usr/lib/swupdate/conf.d/* && swupdate $SWUPDATE_ARGS -i {}'",
                remote_path
            ),
            remote_path,
            version_file: "/etc/sw-versions".to_string(),
            capsule_marker: "forcing capsule update".to_string(),
            verify_checksum: true,
        }
    }
}

/// Shape of the update campaign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignConfig {
    /// Number of genuine updates (normal + forced capsule) to complete.
    pub num_updates: u32,
    /// Force a version mismatch before every update.
    pub force_capsule: bool,
    /// Draw each iteration uniformly from reboot / capsule update / update.
    pub mixed_random: bool,
    /// Seed for the random draw; OS entropy when `None`.
    pub seed: Option<u64>,
}

impl Default for CampaignConfig {
    fn default() -> Self {
        Self {
            num_updates: 100,
            force_capsule: false,
            mixed_random: false,
            seed: None,
        }
    }
}

/// The full, immutable configuration of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// The device under test.
    pub target: DeviceTarget,
    /// Delays and timeouts.
    pub timing: TimingConfig,
    /// Payload and update tool settings.
    pub update: UpdateConfig,
    /// Campaign shape.
    pub campaign: CampaignConfig,
}

impl Config {
    /// A configuration with every delay removed, suitable for simulated devices.
    ///
    /// # Examples
    ///
    /// ```
    /// # use ab_torture::Config;
    /// let config = Config::test_mode();
    /// assert!(config.timing.poll_interval.is_zero());
    /// assert!(config.validate().is_ok());
    /// ```
    pub fn test_mode() -> Self {
        Self {
            target: DeviceTarget {
                host: "mock-device".to_string(),
                ..DeviceTarget::default()
            },
            timing: TimingConfig::instant(),
            update: UpdateConfig {
                verify_checksum: false,
                ..UpdateConfig::default()
            },
            campaign: CampaignConfig {
                num_updates: 1,
                ..CampaignConfig::default()
            },
        }
    }

    /// Applies overrides from the environment.
    ///
    /// Unparseable values are ignored, matching how the rest of the
    /// configuration treats optional tuning knobs.
    pub fn apply_env(&mut self) {
        if let Ok(value) = std::env::var(ENV_POLL_INTERVAL_MS) {
            if let Ok(ms) = value.parse::<u64>() {
                self.timing.poll_interval = Duration::from_millis(ms);
            }
        }

        if let Ok(value) = std::env::var(ENV_MAX_WAIT_SECS) {
            if let Ok(secs) = value.parse::<u64>() {
                self.timing.max_wait = Some(Duration::from_secs(secs));
            }
        }

        if self.campaign.seed.is_none() {
            if let Ok(value) = std::env::var(ENV_SEED) {
                if let Ok(seed) = value.parse::<u64>() {
                    self.campaign.seed = Some(seed);
                }
            }
        }
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.target.host.trim().is_empty() {
            return Err(ConfigError::MissingDevice);
        }
        if self.target.host.chars().any(char::is_whitespace) || self.target.host.starts_with('-')
        {
            return Err(ConfigError::Invalid(format!(
                "device address {:?} is not a host name",
                self.target.host
            )));
        }
        if self.target.user.trim().is_empty() {
            return Err(ConfigError::Invalid("user must not be empty".into()));
        }
        if self.timing.verify_timeout.is_zero() {
            return Err(ConfigError::Invalid("verify timeout must be non-zero".into()));
        }
        if self.timing.verify_command_timeout > self.timing.verify_timeout {
            return Err(ConfigError::Invalid(
                "verify command timeout exceeds the verify budget".into(),
            ));
        }
        if self.update.remote_path.trim().is_empty() {
            return Err(ConfigError::Invalid("remote payload path is empty".into()));
        }
        Ok(())
    }

    /// Validates the parts needed by update campaigns and recovery scenarios.
    pub fn validate_for_updates(&self) -> Result<(), ConfigError> {
        self.validate()?;
        match &self.update.update_file {
            None => Err(ConfigError::MissingUpdateFile),
            Some(path) if !path.is_file() => Err(ConfigError::UpdateFileNotFound(path.clone())),
            Some(_) => Ok(()),
        }
    }
}

/// Defines errors that can occur during configuration validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// No device address was given.
    #[error("Must specify device as argument")]
    MissingDevice,
    /// An update run was requested without a payload.
    #[error("An update file is required")]
    MissingUpdateFile,
    /// The payload path does not point at a file.
    #[error("Update file not found: {}", .0.display())]
    UpdateFileNotFound(PathBuf),
    /// The configuration contains an invalid setting.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
