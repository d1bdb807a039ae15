//! Reboot sequencing.
//!
//! A reboot walks `Stable -> Issued -> Unreachable -> Reachable -> Confirmed`.
//! The device must be observed going away before it is trusted to come back,
//! and once it answers pings again it must pass three liveness checks spaced
//! by fixed delays. Any failed check restarts the confirmation from a fresh
//! session.

use crate::channel::RunOptions;
use crate::config::TimingConfig;
use crate::error::{Error, Result};
use crate::reachability::ReachabilityMonitor;
use crate::session::RemoteSession;
use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

/// Command that reboots the device.
pub const REBOOT_COMMAND: &str = "reboot";

/// Where a reboot currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebootPhase {
    Stable,
    Issued,
    Unreachable,
    Reachable,
    Confirmed,
}

impl fmt::Display for RebootPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RebootPhase::Stable => "stable",
            RebootPhase::Issued => "issued",
            RebootPhase::Unreachable => "unreachable",
            RebootPhase::Reachable => "reachable",
            RebootPhase::Confirmed => "confirmed",
        };
        f.write_str(name)
    }
}

/// Something that can reboot the device and wait for it to settle.
pub trait Rebootable {
    /// Reboots and blocks until the device is confirmed stable.
    fn reboot(&mut self, session: &mut dyn RemoteSession) -> Result<()> {
        self.reboot_with_hook(session, &mut || -> Result<()> { Ok(()) })
    }

    /// Like [`Rebootable::reboot`], running `while_down` once the device has
    /// gone unreachable and before waiting for it to return.
    fn reboot_with_hook(
        &mut self,
        session: &mut dyn RemoteSession,
        while_down: &mut dyn FnMut() -> Result<()>,
    ) -> Result<()>;
}

/// Drives the reboot state machine.
pub struct RebootOrchestrator {
    monitor: ReachabilityMonitor,
    elevated: bool,
    verify_timeout: Duration,
    short_delay: Duration,
    long_delay: Duration,
    retry_interval: Duration,
    max_wait: Option<Duration>,
    phase: RebootPhase,
    reboots: u64,
}

impl RebootOrchestrator {
    /// Creates an orchestrator. `elevated` selects the privileged reboot.
    pub fn new(monitor: ReachabilityMonitor, timing: &TimingConfig, elevated: bool) -> Self {
        Self {
            monitor,
            elevated,
            verify_timeout: timing.verify_timeout,
            short_delay: timing.confirm_short_delay,
            long_delay: timing.confirm_long_delay,
            retry_interval: timing.confirm_retry_interval,
            max_wait: timing.max_wait,
            phase: RebootPhase::Stable,
            reboots: 0,
        }
    }

    /// The phase of the current (or last) reboot.
    pub fn phase(&self) -> RebootPhase {
        self.phase
    }

    /// Number of reboots that reached `Confirmed`.
    pub fn reboots(&self) -> u64 {
        self.reboots
    }

    /// The reachability monitor used for the down/up phases.
    pub fn monitor(&self) -> &ReachabilityMonitor {
        &self.monitor
    }

    fn enter(&mut self, phase: RebootPhase, host: &str) {
        log::info!("Reboot of {}: {} -> {}", host, self.phase, phase);
        self.phase = phase;
    }

    fn issue(&mut self, session: &mut dyn RemoteSession) {
        let opts = RunOptions::new().elevated(self.elevated).allow_failure();
        // The device may drop the connection before acknowledging.
        match session.run(REBOOT_COMMAND, opts) {
            Ok(out) if !out.success() => {
                log::warn!("reboot exited with status {}, continuing", out.exit_code)
            }
            Ok(_) => {}
            Err(e) => log::warn!("reboot command did not complete cleanly: {}", e),
        }
        session.invalidate();
    }

    fn confirm_once(&mut self, session: &mut dyn RemoteSession) -> Result<()> {
        session.verify(self.verify_timeout)?;
        thread::sleep(self.short_delay);
        session.verify(self.verify_timeout)?;
        thread::sleep(self.long_delay);
        session.verify(self.verify_timeout)
    }

    fn confirm(&mut self, session: &mut dyn RemoteSession) -> Result<()> {
        let start = Instant::now();
        let mut attempt = 1u32;
        loop {
            match self.confirm_once(session) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    log::warn!("Device not stable yet (attempt {}): {}", attempt, e);
                    session.invalidate();
                }
            }
            if let Some(limit) = self.max_wait {
                if start.elapsed() >= limit {
                    return Err(Error::timeout("reboot confirmation", limit));
                }
            }
            attempt += 1;
            thread::sleep(self.retry_interval);
        }
    }
}

impl Rebootable for RebootOrchestrator {
    fn reboot_with_hook(
        &mut self,
        session: &mut dyn RemoteSession,
        while_down: &mut dyn FnMut() -> Result<()>,
    ) -> Result<()> {
        let host = session.host().to_string();
        self.phase = RebootPhase::Stable;
        let started = Instant::now();

        self.issue(session);
        self.enter(RebootPhase::Issued, &host);

        self.monitor.wait_until_unreachable(&host)?;
        self.enter(RebootPhase::Unreachable, &host);

        while_down()?;

        self.monitor.wait_until_reachable(&host)?;
        self.enter(RebootPhase::Reachable, &host);

        self.confirm(session)?;
        self.enter(RebootPhase::Confirmed, &host);

        self.reboots += 1;
        log::info!("Reboot of {} completed in {:?}", host, started.elapsed());
        Ok(())
    }
}
