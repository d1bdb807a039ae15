//! Session lifecycle for the device under test.
//!
//! [`SessionManager`] owns the single logical connection to the device. It
//! creates it lazily, discards it on request, and recreates it whenever
//! staleness is suspected. Nothing here retries: a failed connect or a slow
//! liveness check is reported to the caller, which decides whether to try again.
//!
//! Other components reach the device through the [`RemoteSession`] capability
//! rather than through the manager's concrete type.

use crate::channel::{CommandChannel, CommandOutput, Connector, RunOptions};
use crate::config::{DeviceTarget, TimingConfig};
use crate::error::{Error, Result};
use std::path::Path;
use std::time::{Duration, Instant};

/// The no-op used to prove the device is alive.
pub const LIVENESS_COMMAND: &str = "echo connection test";

/// Remote access to the device under test.
pub trait RemoteSession {
    /// Host name or address of the device.
    fn host(&self) -> &str;

    /// Runs `command` on the device, connecting first if needed.
    fn run(&mut self, command: &str, opts: RunOptions) -> Result<CommandOutput>;

    /// Uploads `local` to `remote`, connecting first if needed.
    fn upload(&mut self, local: &Path, remote: &str, timeout: Option<Duration>) -> Result<()>;

    /// Discards the current session. Idempotent.
    fn invalidate(&mut self);

    /// Proves the device is alive with a fresh session within `timeout`.
    fn verify(&mut self, timeout: Duration) -> Result<()>;
}

/// One open transport to the device.
struct DeviceSession {
    id: u64,
    channel: Box<dyn CommandChannel>,
    opened_at: Instant,
}

/// Owns the lifecycle of the connection to one device.
pub struct SessionManager {
    target: DeviceTarget,
    connector: Box<dyn Connector>,
    connect_timeout: Duration,
    verify_command_timeout: Duration,
    session: Option<DeviceSession>,
    sessions_opened: u64,
}

impl SessionManager {
    /// Creates a manager for `target`. No connection is made yet.
    pub fn new(target: DeviceTarget, timing: &TimingConfig, connector: Box<dyn Connector>) -> Self {
        Self {
            target,
            connector,
            connect_timeout: timing.connect_timeout,
            verify_command_timeout: timing.verify_command_timeout,
            session: None,
            sessions_opened: 0,
        }
    }

    /// The device this manager connects to.
    pub fn target(&self) -> &DeviceTarget {
        &self.target
    }

    /// Opens a new session, discarding any existing one first.
    pub fn connect(&mut self) -> Result<()> {
        self.invalidate();
        let channel = self.connector.connect(&self.target, self.connect_timeout)?;
        self.sessions_opened += 1;
        log::debug!(
            "Session {} opened to {}",
            self.sessions_opened,
            self.target.destination()
        );
        self.session = Some(DeviceSession {
            id: self.sessions_opened,
            channel,
            opened_at: Instant::now(),
        });
        Ok(())
    }

    /// Returns `true` while a session is held.
    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    /// Total number of sessions opened so far.
    pub fn sessions_opened(&self) -> u64 {
        self.sessions_opened
    }

    fn channel(&mut self) -> Result<&mut dyn CommandChannel> {
        if self.session.is_none() {
            self.connect()?;
        }
        match self.session.as_mut() {
            Some(session) => Ok(session.channel.as_mut()),
            None => Err(Error::connection(&self.target.host, "no session")),
        }
    }
}

impl RemoteSession for SessionManager {
    fn host(&self) -> &str {
        &self.target.host
    }

    fn run(&mut self, command: &str, opts: RunOptions) -> Result<CommandOutput> {
        self.channel()?.run(command, &opts)
    }

    fn upload(&mut self, local: &Path, remote: &str, timeout: Option<Duration>) -> Result<()> {
        self.channel()?.upload(local, remote, timeout)
    }

    fn invalidate(&mut self) {
        if let Some(mut session) = self.session.take() {
            log::debug!(
                "Discarding session {} after {:?}",
                session.id,
                session.opened_at.elapsed()
            );
            session.channel.close();
        }
    }

    fn verify(&mut self, timeout: Duration) -> Result<()> {
        let start = Instant::now();
        self.connect()?;

        let remaining = timeout.saturating_sub(start.elapsed());
        if remaining.is_zero() {
            return Err(Error::timeout("liveness check", timeout));
        }
        let budget = remaining.min(self.verify_command_timeout);

        self.run(LIVENESS_COMMAND, RunOptions::new().timeout(budget))?;

        if start.elapsed() > timeout {
            return Err(Error::timeout("liveness check", timeout));
        }
        Ok(())
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.invalidate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default)]
    struct Log {
        connects: u32,
        closes: u32,
        commands: Vec<String>,
        refuse: bool,
        /// How long each command takes.
        latency: Duration,
    }

    struct FakeConnector(Rc<RefCell<Log>>);

    struct FakeChannel(Rc<RefCell<Log>>);

    impl CommandChannel for FakeChannel {
        fn run(&mut self, command: &str, _opts: &RunOptions) -> Result<CommandOutput> {
            let latency = {
                let mut log = self.0.borrow_mut();
                log.commands.push(command.to_string());
                log.latency
            };
            std::thread::sleep(latency);
            Ok(CommandOutput::ok("connection test\n"))
        }

        fn upload(&mut self, _local: &Path, _remote: &str, _t: Option<Duration>) -> Result<()> {
            Ok(())
        }

        fn close(&mut self) {
            self.0.borrow_mut().closes += 1;
        }
    }

    impl Connector for FakeConnector {
        fn connect(&self, target: &DeviceTarget, _t: Duration) -> Result<Box<dyn CommandChannel>> {
            let mut log = self.0.borrow_mut();
            if log.refuse {
                return Err(Error::connection(&target.host, "refused"));
            }
            log.connects += 1;
            Ok(Box::new(FakeChannel(self.0.clone())))
        }
    }

    fn manager() -> (SessionManager, Rc<RefCell<Log>>) {
        let log = Rc::new(RefCell::new(Log::default()));
        let target = DeviceTarget {
            host: "dut".into(),
            ..DeviceTarget::default()
        };
        let mgr = SessionManager::new(
            target,
            &TimingConfig::instant(),
            Box::new(FakeConnector(log.clone())),
        );
        (mgr, log)
    }

    #[test]
    fn test_run_connects_lazily() {
        let (mut mgr, log) = manager();
        assert!(!mgr.is_connected());
        mgr.run("true", RunOptions::new()).unwrap();
        mgr.run("true", RunOptions::new()).unwrap();
        assert!(mgr.is_connected());
        assert_eq!(log.borrow().connects, 1);
    }

    #[test]
    fn test_invalidate_is_idempotent() {
        let (mut mgr, log) = manager();
        mgr.connect().unwrap();
        mgr.invalidate();
        mgr.invalidate();
        assert!(!mgr.is_connected());
        assert_eq!(log.borrow().closes, 1);
    }

    #[test]
    fn test_connect_replaces_existing_session() {
        let (mut mgr, log) = manager();
        mgr.connect().unwrap();
        mgr.connect().unwrap();
        let log = log.borrow();
        assert_eq!(log.connects, 2);
        assert_eq!(log.closes, 1);
        assert_eq!(mgr.sessions_opened(), 2);
    }

    #[test]
    fn test_verify_always_uses_fresh_session() {
        let (mut mgr, log) = manager();
        mgr.connect().unwrap();
        mgr.verify(Duration::from_secs(5)).unwrap();
        mgr.verify(Duration::from_secs(5)).unwrap();
        let log = log.borrow();
        assert_eq!(log.connects, 3);
        assert_eq!(log.commands, vec![LIVENESS_COMMAND, LIVENESS_COMMAND]);
    }

    #[test]
    fn test_verify_reports_connection_error() {
        let (mut mgr, log) = manager();
        log.borrow_mut().refuse = true;
        let err = mgr.verify(Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, Error::Connection { .. }));
        assert!(!mgr.is_connected());
    }

    #[test]
    fn test_verify_times_out_on_slow_liveness_check() {
        let (mut mgr, log) = manager();
        log.borrow_mut().latency = Duration::from_millis(300);
        let err = mgr.verify(Duration::from_millis(100)).unwrap_err();
        assert!(err.is_recoverable());
        match err {
            Error::Timeout { operation, timeout } => {
                assert_eq!(operation, "liveness check");
                assert_eq!(timeout, Duration::from_millis(100));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_verify_with_no_budget_left_skips_command() {
        let (mut mgr, log) = manager();
        let err = mgr.verify(Duration::ZERO).unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        assert!(log.borrow().commands.is_empty());
    }

    #[test]
    fn test_drop_closes_session() {
        let (mut mgr, log) = manager();
        mgr.connect().unwrap();
        drop(mgr);
        assert_eq!(log.borrow().closes, 1);
    }
}
