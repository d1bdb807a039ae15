//! Update payload handling and update tool invocation.
//!
//! Transfers retry forever on any failure (upload error, timeout, digest
//! mismatch) with a fixed pause in between. No distinction is made between
//! transient and permanent failures.

use crate::channel::{CommandOutput, RunOptions};
use crate::config::{ConfigError, TimingConfig, UpdateConfig};
use crate::error::{Error, Result};
use crate::session::RemoteSession;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

/// Prints the machine identity of the device.
pub const MACHINE_ID_COMMAND: &str = "systemd-machine-id-setup --print";

/// SHA-256 of a local file as lowercase hex.
pub fn file_sha256(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Extracts the digest from `sha256sum` output.
pub fn parse_sha256sum(output: &str) -> Option<String> {
    output
        .split_whitespace()
        .next()
        .filter(|d| d.len() == 64 && d.chars().all(|c| c.is_ascii_hexdigit()))
        .map(str::to_ascii_lowercase)
}

/// The command that rewrites every `x.y.z` token in `version_file` to `0.0.0`.
pub fn version_mismatch_command(version_file: &str) -> String {
    format!(
        "sed -i -E 's/[0-9]+\\.[0-9]+\\.[0-9]+/0.0.0/g' {}",
        version_file
    )
}

/// Moves the update payload to the device and runs the update tool on it.
pub struct UpdateDriver {
    update: UpdateConfig,
    transfer_timeout: Duration,
    retry_interval: Duration,
    query_timeout: Duration,
    local_digest: Option<String>,
    transfer_attempts: u64,
}

impl UpdateDriver {
    pub fn new(update: &UpdateConfig, timing: &TimingConfig) -> Self {
        Self {
            update: update.clone(),
            transfer_timeout: timing.transfer_timeout,
            retry_interval: timing.transfer_retry_interval,
            query_timeout: timing.query_timeout,
            local_digest: None,
            transfer_attempts: 0,
        }
    }

    /// Total upload attempts across all transfers.
    pub fn transfer_attempts(&self) -> u64 {
        self.transfer_attempts
    }

    fn local_file(&self) -> Result<PathBuf> {
        match &self.update.update_file {
            None => Err(ConfigError::MissingUpdateFile.into()),
            Some(path) if !path.is_file() => {
                Err(ConfigError::UpdateFileNotFound(path.clone()).into())
            }
            Some(path) => Ok(path.clone()),
        }
    }

    fn expected_digest(&mut self, local: &Path) -> Result<String> {
        if let Some(digest) = &self.local_digest {
            return Ok(digest.clone());
        }
        let digest = file_sha256(local)?;
        log::debug!("Payload {} sha256 {}", local.display(), digest);
        self.local_digest = Some(digest.clone());
        Ok(digest)
    }

    fn attempt(
        &mut self,
        session: &mut dyn RemoteSession,
        local: &Path,
        expected: Option<&str>,
    ) -> Result<()> {
        let remote = self.update.remote_path.clone();
        session.upload(local, &remote, Some(self.transfer_timeout))?;

        if let Some(expected) = expected {
            let cmd = format!("sha256sum {}", remote);
            let out = session.run(&cmd, RunOptions::new().timeout(self.transfer_timeout))?;
            let actual = parse_sha256sum(&out.stdout).ok_or_else(|| {
                Error::Protocol(format!("unexpected sha256sum output '{}'", out.stdout.trim()))
            })?;
            if actual != expected {
                return Err(Error::Protocol(format!(
                    "payload digest mismatch: expected {}, device has {}",
                    expected, actual
                )));
            }
        }
        Ok(())
    }

    /// Uploads the payload, retrying until it lands intact.
    ///
    /// Returns the number of attempts this transfer took.
    pub fn transfer(&mut self, session: &mut dyn RemoteSession) -> Result<u32> {
        let local = self.local_file()?;
        let expected = if self.update.verify_checksum {
            Some(self.expected_digest(&local)?)
        } else {
            None
        };

        log::info!(
            "Copying update file {} to {}",
            local.display(),
            self.update.remote_path
        );
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            self.transfer_attempts += 1;
            match self.attempt(session, &local, expected.as_deref()) {
                Ok(()) => {
                    log::debug!("Transfer completed after {} attempt(s)", attempts);
                    return Ok(attempts);
                }
                Err(e) => {
                    log::warn!("Transfer attempt {} failed [{}]: {}", attempts, e.code(), e);
                    session.invalidate();
                    thread::sleep(self.retry_interval);
                }
            }
        }
    }

    /// Rewrites the version metadata so the update tool sees a mismatch and
    /// forces a capsule update.
    pub fn inject_version_mismatch(&self, session: &mut dyn RemoteSession) -> Result<()> {
        let cmd = version_mismatch_command(&self.update.version_file);
        log::info!("Forcing version mismatch in {}", self.update.version_file);
        session.run(&cmd, RunOptions::new()).map(|_| ())
    }

    /// Runs the update tool against the uploaded payload. A non-zero exit is
    /// returned as [`Error::CommandFailed`].
    pub fn run_update_tool(&self, session: &mut dyn RemoteSession) -> Result<CommandOutput> {
        log::info!("Starting update");
        session.run(&self.update.update_command, RunOptions::new())
    }

    /// Reads the machine identity of the device.
    pub fn machine_id(&self, session: &mut dyn RemoteSession) -> Result<String> {
        let out = session.run(
            MACHINE_ID_COMMAND,
            RunOptions::new().timeout(self.query_timeout),
        )?;
        Ok(out.stdout.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn test_file_sha256() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        assert_eq!(file_sha256(file.path()).unwrap(), EMPTY_SHA256);

        file.write_all(b"abc").unwrap();
        file.flush().unwrap();
        assert_eq!(
            file_sha256(file.path()).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_file_sha256_missing_file() {
        let err = file_sha256(Path::new("/nonexistent/payload.swu")).unwrap_err();
        assert_eq!(err.code(), "E_IO");
    }

    #[test]
    fn test_parse_sha256sum() {
        let line = format!("{}  /tmp/swupdate.swu\n", EMPTY_SHA256);
        assert_eq!(parse_sha256sum(&line).as_deref(), Some(EMPTY_SHA256));
        assert_eq!(parse_sha256sum(&EMPTY_SHA256.to_uppercase()).as_deref(), Some(EMPTY_SHA256));
        assert!(parse_sha256sum("sha256sum: /tmp/x: No such file").is_none());
        assert!(parse_sha256sum("").is_none());
    }

    #[test]
    fn test_version_mismatch_command() {
        assert_eq!(
            version_mismatch_command("/etc/sw-versions"),
            r"sed -i -E 's/[0-9]+\.[0-9]+\.[0-9]+/0.0.0/g' /etc/sw-versions"
        );
    }

    #[test]
    fn test_transfer_requires_update_file() {
        struct Unreachable;
        impl RemoteSession for Unreachable {
            fn host(&self) -> &str {
                "dut"
            }
            fn run(&mut self, _c: &str, _o: RunOptions) -> Result<CommandOutput> {
                unreachable!()
            }
            fn upload(&mut self, _l: &Path, _r: &str, _t: Option<Duration>) -> Result<()> {
                unreachable!()
            }
            fn invalidate(&mut self) {}
            fn verify(&mut self, _t: Duration) -> Result<()> {
                unreachable!()
            }
        }

        let mut driver = UpdateDriver::new(&UpdateConfig::default(), &TimingConfig::instant());
        let err = driver.transfer(&mut Unreachable).unwrap_err();
        assert_eq!(err.code(), "E_CONFIG");

        let update = UpdateConfig {
            update_file: Some(PathBuf::from("/nonexistent/payload.swu")),
            ..UpdateConfig::default()
        };
        let mut driver = UpdateDriver::new(&update, &TimingConfig::instant());
        let err = driver.transfer(&mut Unreachable).unwrap_err();
        assert!(matches!(
            err,
            Error::Config(ConfigError::UpdateFileNotFound(_))
        ));
    }
}
