//! SSH/SCP transport for the push pipeline.
//!
//! Transfers are bounded by a budget derived from the file size, with a
//! 30 second idle keepalive; remote commands run non-interactively with
//! host-key acceptance on first connection.

use std::path::Path;
use std::process::Command;
use std::time::Duration;

use crate::error::Error;
use crate::runtime::run_bounded;

use super::target::ScpTarget;

/// Assumed minimum sustained transfer rate when sizing budgets.
const MIN_TRANSFER_RATE_BYTES_PER_SEC: u64 = 1024 * 1024;

/// Floor for any transfer budget.
const MIN_TRANSFER_TIMEOUT: Duration = Duration::from_secs(60);

/// Idle keepalive interval.
const KEEPALIVE_SECS: u32 = 30;

/// An SSH destination with an optional identity file.
#[derive(Debug, Clone)]
pub struct SshSession {
    target: ScpTarget,
    identity: Option<String>,
}

impl SshSession {
    /// Build a session for a resolved target.
    #[must_use]
    pub fn new(target: ScpTarget, identity: Option<String>) -> Self {
        Self { target, identity }
    }

    /// The resolved target.
    #[must_use]
    pub const fn target(&self) -> &ScpTarget {
        &self.target
    }

    fn common_options(&self, cmd: &mut Command) {
        cmd.arg("-o").arg("BatchMode=yes");
        cmd.arg("-o").arg("StrictHostKeyChecking=accept-new");
        cmd.arg("-o")
            .arg(format!("ServerAliveInterval={KEEPALIVE_SECS}"));
        if let Some(identity) = &self.identity {
            cmd.arg("-i").arg(identity);
        }
    }

    /// Copy a local file to the target's remote path.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Network`] on transfer failure and
    /// [`Error::Timeout`] when the size-derived budget elapses.
    pub fn copy_file(&self, local: &Path) -> Result<String, Error> {
        let size = std::fs::metadata(local)
            .map_err(|e| Error::io(format!("failed to stat {}", local.display()), e))?
            .len();
        let budget = transfer_budget(size);

        let file_name = local
            .file_name()
            .ok_or_else(|| Error::validation("transfer source has no file name"))?
            .to_string_lossy();
        let remote_file = format!("{}/{file_name}", self.target.path.trim_end_matches('/'));

        let mut cmd = Command::new("scp");
        self.common_options(&mut cmd);
        cmd.arg(local);
        cmd.arg(format!(
            "{}@{}:{remote_file}",
            self.target.user, self.target.host
        ));

        tracing::info!(
            file = %local.display(),
            target = %self.target,
            budget_secs = budget.as_secs(),
            "transferring package"
        );
        let output = run_bounded(&mut cmd, budget, "scp")?;
        if output.success {
            Ok(remote_file)
        } else {
            Err(Error::network(format!(
                "scp to {} failed: {}",
                self.target,
                output.stderr_tail()
            )))
        }
    }

    /// Run a command on the remote host, capturing output.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Network`] when the remote command fails.
    pub fn exec(&self, script: &str, timeout: Duration) -> Result<String, Error> {
        let mut cmd = Command::new("ssh");
        self.common_options(&mut cmd);
        cmd.arg(format!("{}@{}", self.target.user, self.target.host));
        cmd.arg("bash").arg("-s");
        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::io("failed to spawn ssh", e))?;
        if let Some(stdin) = child.stdin.take() {
            use std::io::Write;
            let mut stdin = stdin;
            stdin
                .write_all(script.as_bytes())
                .map_err(|e| Error::io("failed to send remote script", e))?;
        }

        use wait_timeout::ChildExt;
        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();
        let stdout_reader = std::thread::spawn(move || {
            let mut buf = Vec::new();
            if let Some(pipe) = stdout_pipe.as_mut() {
                use std::io::Read;
                let _ = pipe.read_to_end(&mut buf);
            }
            buf
        });
        let stderr_reader = std::thread::spawn(move || {
            let mut buf = Vec::new();
            if let Some(pipe) = stderr_pipe.as_mut() {
                use std::io::Read;
                let _ = pipe.read_to_end(&mut buf);
            }
            buf
        });

        let status = match child
            .wait_timeout(timeout)
            .map_err(|e| Error::io("failed to wait for ssh", e))?
        {
            Some(status) => status,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(Error::Timeout {
                    operation: "remote command".to_string(),
                    seconds: timeout.as_secs(),
                });
            },
        };

        let stdout = String::from_utf8_lossy(&stdout_reader.join().unwrap_or_default()).into_owned();
        let stderr = String::from_utf8_lossy(&stderr_reader.join().unwrap_or_default()).into_owned();
        if status.success() {
            Ok(stdout)
        } else {
            Err(Error::network(format!(
                "remote command on {} failed (exit {:?}): {}",
                self.target,
                status.code(),
                stderr.trim()
            )))
        }
    }

    /// Returns `true` when the host answers an SSH no-op.
    #[must_use]
    pub fn is_reachable(&self) -> bool {
        self.exec("true", Duration::from_secs(20)).is_ok()
    }
}

/// Transfer budget derived from the payload size with a floor.
#[must_use]
pub fn transfer_budget(size_bytes: u64) -> Duration {
    let secs = size_bytes / MIN_TRANSFER_RATE_BYTES_PER_SEC;
    MIN_TRANSFER_TIMEOUT.max(Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_transfers_get_the_floor_budget() {
        assert_eq!(transfer_budget(10), MIN_TRANSFER_TIMEOUT);
        assert_eq!(transfer_budget(1024 * 1024 * 10), MIN_TRANSFER_TIMEOUT);
    }

    #[test]
    fn large_transfers_scale_with_size() {
        let budget = transfer_budget(1024 * 1024 * 1024);
        assert_eq!(budget, Duration::from_secs(1024));
    }
}
