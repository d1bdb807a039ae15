//! Out-of-band reachability probing.
//!
//! Reachability is network-level ICMP responsiveness, independent of the
//! management session. A single unanswered echo is a normal `false`, never an
//! error.

use crate::error::{Error, Result};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// Answers whether a host responds on the network right now.
pub trait Pinger {
    /// Sends one echo request to `host`. Errors only for a malformed invocation.
    fn ping(&mut self, host: &str) -> Result<bool>;
}

/// Which `ping` dialect the host speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingFlavor {
    /// iputils/busybox: `-W` in seconds.
    Linux,
    /// macOS and the BSDs: `-W` in milliseconds.
    Bsd,
    /// `ping.exe`: `-w` in milliseconds.
    Windows,
}

impl PingFlavor {
    /// The dialect of the platform this binary was built for.
    pub fn host() -> Self {
        if cfg!(windows) {
            PingFlavor::Windows
        } else if cfg!(any(
            target_os = "macos",
            target_os = "ios",
            target_os = "freebsd",
            target_os = "dragonfly"
        )) {
            PingFlavor::Bsd
        } else {
            PingFlavor::Linux
        }
    }

    /// Arguments for one echo request to `host`, waiting at most `wait`.
    pub fn args(self, wait: Duration, host: &str) -> Vec<String> {
        let millis = wait.as_millis().max(1).to_string();
        let mut args: Vec<String> = match self {
            PingFlavor::Linux => vec![
                "-c".into(),
                "1".into(),
                "-W".into(),
                wait.as_secs().max(1).to_string(),
            ],
            PingFlavor::Bsd => vec!["-c".into(), "1".into(), "-W".into(), millis],
            PingFlavor::Windows => vec!["-n".into(), "1".into(), "-w".into(), millis],
        };
        args.push(host.to_string());
        args
    }
}

/// Pings with the system `ping` utility, one echo request per call.
#[derive(Debug, Clone)]
pub struct IcmpPinger {
    wait: Duration,
    flavor: PingFlavor,
}

impl IcmpPinger {
    /// Creates a pinger that waits at most `wait` for each reply.
    pub fn new(wait: Duration) -> Self {
        Self {
            wait,
            flavor: PingFlavor::host(),
        }
    }

    /// Builds the platform specific invocation.
    pub fn command(&self, host: &str) -> Command {
        let mut cmd = Command::new("ping");
        cmd.args(self.flavor.args(self.wait, host));
        cmd
    }
}

impl Default for IcmpPinger {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl Pinger for IcmpPinger {
    fn ping(&mut self, host: &str) -> Result<bool> {
        if host.is_empty() || host.starts_with('-') || host.chars().any(char::is_whitespace) {
            return Err(Error::Protocol(format!("invalid ping target '{}'", host)));
        }
        let status = self
            .command(host)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()?;
        Ok(status.success())
    }
}

/// Polls a [`Pinger`] until the device reaches a wanted state.
///
/// Polling uses a fixed interval with no backoff. Without `max_wait` the waits
/// never give up.
pub struct ReachabilityMonitor {
    pinger: Box<dyn Pinger>,
    poll_interval: Duration,
    max_wait: Option<Duration>,
    pings: u64,
}

impl ReachabilityMonitor {
    pub fn new(pinger: Box<dyn Pinger>, poll_interval: Duration, max_wait: Option<Duration>) -> Self {
        Self {
            pinger,
            poll_interval,
            max_wait,
            pings: 0,
        }
    }

    /// Total pings sent.
    pub fn pings(&self) -> u64 {
        self.pings
    }

    /// Sends a single ping.
    pub fn is_reachable(&mut self, host: &str) -> Result<bool> {
        self.pings += 1;
        self.pinger.ping(host)
    }

    /// Blocks until `host` stops answering.
    pub fn wait_until_unreachable(&mut self, host: &str) -> Result<()> {
        self.wait_for(host, false)
    }

    /// Blocks until `host` answers again.
    pub fn wait_until_reachable(&mut self, host: &str) -> Result<()> {
        self.wait_for(host, true)
    }

    fn wait_for(&mut self, host: &str, wanted: bool) -> Result<()> {
        let start = Instant::now();
        let mut polls = 0u64;
        while self.is_reachable(host)? != wanted {
            polls += 1;
            if let Some(limit) = self.max_wait {
                if start.elapsed() >= limit {
                    let what = if wanted { "reachable" } else { "unreachable" };
                    return Err(Error::timeout(format!("waiting for {} to become {}", host, what), limit));
                }
            }
            thread::sleep(self.poll_interval);
        }
        log::debug!(
            "{} {} after {} polls in {:?}",
            host,
            if wanted { "reachable" } else { "unreachable" },
            polls + 1,
            start.elapsed()
        );
        Ok(())
    }
}
