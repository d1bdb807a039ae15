//! OpenSSH-backed command channel.
//!
//! Each [`SshChannel`] owns one OpenSSH control master. Commands and uploads are
//! multiplexed over its control socket, so "the session" has a real open/closed
//! state: [`SshConnector::connect`] authenticates once, and
//! [`CommandChannel::close`] asks the master to exit.
//!
//! Host key checking is relaxed (never reject, never record) because the device
//! regenerates its host keys on reboot.
//!
//! Password and passwordless logins go through `sshpass -e`, which reads the
//! password from the environment rather than the command line.

use crate::channel::{effective_command, CommandChannel, CommandOutput, Connector, RunOptions};
use crate::config::{Credential, DeviceTarget};
use crate::error::{Error, Result};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use wait_timeout::ChildExt;

/// Exit status OpenSSH reserves for its own failures.
const SSH_TRANSPORT_FAILURE: i32 = 255;

/// How long to wait for output readers of a process that forks a daemon.
const READER_JOIN_TIMEOUT: Duration = Duration::from_millis(250);

/// Budget for asking a control master to exit.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

static SOCKET_SEQ: AtomicU64 = AtomicU64::new(0);

/// Opens [`SshChannel`]s using the system `ssh` client.
#[derive(Debug, Clone)]
pub struct SshConnector {
    control_dir: PathBuf,
}

impl SshConnector {
    /// Creates a connector that keeps control sockets in the temp directory.
    pub fn new() -> Self {
        Self {
            control_dir: std::env::temp_dir(),
        }
    }

    /// Creates a connector that keeps control sockets in `dir`.
    pub fn with_control_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            control_dir: dir.into(),
        }
    }

    fn next_socket(&self) -> PathBuf {
        let seq = SOCKET_SEQ.fetch_add(1, Ordering::Relaxed);
        self.control_dir
            .join(format!("ab-torture-{}-{}.sock", std::process::id(), seq))
    }
}

impl Default for SshConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl Connector for SshConnector {
    fn connect(&self, target: &DeviceTarget, timeout: Duration) -> Result<Box<dyn CommandChannel>> {
        let socket = self.next_socket();
        let mut cmd = master_command(target, timeout);
        cmd.arg("-M")
            .arg("-N")
            .arg("-f")
            .arg("-S")
            .arg(&socket)
            .args(["-o", "ControlPersist=yes"])
            .arg(target.destination());

        log::debug!("Opening ssh control master to {}", target.destination());
        // ssh enforces ConnectTimeout itself; the extra second covers authentication.
        // The backgrounded master inherits the pipes, so its output is not awaited.
        let budget = Some(timeout + Duration::from_secs(1));
        let drain = Drain::Bounded(READER_JOIN_TIMEOUT);
        let output = run_process_with(cmd, budget, drain).map_err(|e| match e {
            Error::Timeout { timeout, .. } => {
                Error::timeout(format!("connect to {}", target.host), timeout)
            }
            other => other,
        })?;

        if !output.success() {
            return Err(Error::connection(
                &target.host,
                non_empty(output.stderr.trim(), "ssh exited with status 255"),
            ));
        }

        Ok(Box::new(SshChannel {
            destination: target.destination(),
            host: target.host.clone(),
            socket,
            open: true,
        }))
    }
}

/// A command channel multiplexed over an OpenSSH control master.
#[derive(Debug)]
pub struct SshChannel {
    destination: String,
    host: String,
    socket: PathBuf,
    open: bool,
}

impl SshChannel {
    fn client(&self, program: &str) -> Command {
        let mut cmd = Command::new(program);
        cmd.arg("-o")
            .arg(format!("ControlPath={}", self.socket.display()))
            .args(["-o", "ControlMaster=no"])
            .args(["-o", "BatchMode=yes"])
            .args(relaxed_host_key_options());
        cmd
    }

    fn ensure_open(&self) -> Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(Error::connection(&self.host, "session closed"))
        }
    }
}

impl CommandChannel for SshChannel {
    fn run(&mut self, command: &str, opts: &RunOptions) -> Result<CommandOutput> {
        self.ensure_open()?;
        let remote = effective_command(command, opts);
        log::debug!("[{}] $ {}", self.host, remote);

        let mut cmd = self.client("ssh");
        cmd.arg(&self.destination).arg(&remote);

        let output = run_process(cmd, opts.timeout).map_err(|e| match e {
            Error::Timeout { timeout, .. } => Error::timeout(format!("`{}`", remote), timeout),
            other => other,
        })?;

        if output.exit_code == SSH_TRANSPORT_FAILURE {
            return Err(Error::connection(
                &self.host,
                non_empty(output.stderr.trim(), "ssh transport failure"),
            ));
        }
        output.check(&remote, opts)
    }

    fn upload(&mut self, local: &Path, remote: &str, timeout: Option<Duration>) -> Result<()> {
        self.ensure_open()?;
        log::debug!("[{}] scp {} -> {}", self.host, local.display(), remote);

        let mut cmd = self.client("scp");
        cmd.arg("-q")
            .arg(local)
            .arg(format!("{}:{}", self.destination, remote));

        let output = run_process(cmd, timeout).map_err(|e| match e {
            Error::Timeout { timeout, .. } => {
                Error::timeout(format!("upload of {}", local.display()), timeout)
            }
            other => other,
        })?;

        if output.success() {
            Ok(())
        } else {
            Err(Error::CommandFailed {
                command: format!("scp {} {}", local.display(), remote),
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            })
        }
    }

    fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;

        let mut cmd = Command::new("ssh");
        cmd.arg("-S")
            .arg(&self.socket)
            .args(["-O", "exit"])
            .arg(&self.destination);
        if let Err(e) = run_process(cmd, Some(CLOSE_TIMEOUT)) {
            log::debug!("Closing control master for {} failed: {}", self.host, e);
        }
        let _ = std::fs::remove_file(&self.socket);
    }
}

impl Drop for SshChannel {
    fn drop(&mut self) {
        self.close();
    }
}

/// Builds the command that starts a control master, credential handling included.
fn master_command(target: &DeviceTarget, timeout: Duration) -> Command {
    let connect_secs = timeout.as_secs().max(1).to_string();
    let mut cmd = match &target.credential {
        Credential::KeyFile(key) => {
            let mut cmd = Command::new("ssh");
            cmd.arg("-i")
                .arg(key)
                .args(["-o", "IdentitiesOnly=yes"])
                .args(["-o", "BatchMode=yes"]);
            cmd
        }
        Credential::Password(password) => sshpass(password),
        Credential::None => {
            let mut cmd = sshpass("");
            cmd.args(["-o", "PubkeyAuthentication=no"]);
            cmd
        }
    };
    cmd.args(relaxed_host_key_options())
        .arg("-o")
        .arg(format!("ConnectTimeout={}", connect_secs))
        .args(["-o", "ServerAliveInterval=2"])
        .args(["-o", "ServerAliveCountMax=2"]);
    cmd
}

fn sshpass(password: &str) -> Command {
    let mut cmd = Command::new("sshpass");
    cmd.env("SSHPASS", password).arg("-e").arg("ssh");
    cmd
}

fn relaxed_host_key_options() -> [&'static str; 6] {
    [
        "-o",
        "StrictHostKeyChecking=no",
        "-o",
        "UserKnownHostsFile=/dev/null",
        "-o",
        "LogLevel=ERROR",
    ]
}

fn non_empty(s: &str, fallback: &str) -> String {
    if s.is_empty() {
        fallback.to_string()
    } else {
        s.to_string()
    }
}

/// How long to keep reading a process's output after it has exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Drain {
    /// Read until the pipes close.
    Full,
    /// Give up after the bound. For processes that fork a daemon holding the
    /// pipes open, such as `ssh -f`.
    Bounded(Duration),
}

/// Runs a local process to completion, capturing all of its output.
///
/// When `timeout` elapses the process is killed and [`Error::Timeout`] is
/// returned.
pub(crate) fn run_process(cmd: Command, timeout: Option<Duration>) -> Result<CommandOutput> {
    run_process_with(cmd, timeout, Drain::Full)
}

pub(crate) fn run_process_with(
    mut cmd: Command,
    timeout: Option<Duration>,
    drain: Drain,
) -> Result<CommandOutput> {
    let program = cmd.get_program().to_string_lossy().into_owned();
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let stdout = child.stdout.take().map(spawn_reader);
    let stderr = child.stderr.take().map(spawn_reader);

    let status = match timeout {
        Some(limit) => child.wait_timeout(limit)?,
        None => Some(child.wait()?),
    };
    let Some(status) = status else {
        let _ = child.kill();
        let _ = child.wait();
        // A killed child may leave descendants holding the pipes.
        join_reader(&program, stdout, Drain::Bounded(READER_JOIN_TIMEOUT));
        join_reader(&program, stderr, Drain::Bounded(READER_JOIN_TIMEOUT));
        return Err(Error::timeout(program, timeout.unwrap_or_default()));
    };

    Ok(CommandOutput {
        stdout: join_reader(&program, stdout, drain),
        stderr: join_reader(&program, stderr, drain),
        exit_code: status.code().unwrap_or(-1),
    })
}

fn spawn_reader<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn join_reader(program: &str, handle: Option<thread::JoinHandle<String>>, drain: Drain) -> String {
    let Some(handle) = handle else {
        return String::new();
    };
    if let Drain::Bounded(bound) = drain {
        let deadline = Instant::now() + bound;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                log::debug!("{} still holds its output open, not waiting for it", program);
                return String::new();
            }
            thread::sleep(Duration::from_millis(5));
        }
    }
    match handle.join() {
        Ok(output) => output,
        Err(_) => {
            log::warn!("Output reader for {} panicked, output discarded", program);
            String::new()
        }
    }
}
