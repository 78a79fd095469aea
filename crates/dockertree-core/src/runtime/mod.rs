//! Typed adapter over the container runtime.
//!
//! This module is the only place that invokes `docker`. Everything above it
//! reasons in typed operations and [`Error`] values. All invocations are
//! non-interactive and bounded by the timeouts in [`timeouts`].

pub mod compose;

use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;

use wait_timeout::ChildExt;

use crate::error::Error;

pub use compose::{ComposeInvocation, ComposeStyle};

/// Operation timeouts at the command boundary.
pub mod timeouts {
    use std::time::Duration;

    /// Creating or inspecting the shared proxy network.
    pub const ENSURE_NETWORK: Duration = Duration::from_secs(10);
    /// Bringing a stack up.
    pub const STACK_UP: Duration = Duration::from_secs(300);
    /// File-level volume copy.
    pub const VOLUME_COPY: Duration = Duration::from_secs(600);
    /// Database dump-and-replay volume copy.
    pub const LIVE_SNAPSHOT: Duration = Duration::from_secs(1800);
    /// DNS provider operations.
    pub const DNS: Duration = Duration::from_secs(30);
    /// Droplet readiness polling.
    pub const DROPLET_READY: Duration = Duration::from_secs(600);
    /// Everything else that talks to the local runtime.
    pub const DEFAULT: Duration = Duration::from_secs(120);
}

/// Keep at most this many trailing bytes of stderr in error records.
const STDERR_TAIL_BYTES: usize = 2048;

/// A running or stopped container observed on the local runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    /// Runtime container ID.
    pub id: String,
    /// Container name without the leading slash.
    pub name: String,
    /// `running`, `exited`, ...
    pub state: String,
    /// Human status line (`Up 2 minutes`, ...).
    pub status: String,
    /// Image reference.
    pub image: String,
}

impl ContainerInfo {
    /// Returns `true` if the container is currently running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state == "running"
    }
}

/// Typed wrapper over container runtime invocations.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    compose_style: ComposeStyle,
}

impl DockerRuntime {
    /// Probe the local runtime and detect the compose flavor.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PreconditionFailed`] when the runtime daemon is not
    /// reachable.
    pub fn new() -> Result<Self, Error> {
        let probe = run_bounded(
            Command::new("docker").args(["info", "--format", "{{.ServerVersion}}"]),
            timeouts::DEFAULT,
            "docker info",
        );
        match probe {
            Ok(output) if output.success => {},
            _ => {
                return Err(Error::precondition(
                    "container runtime is not available; start Docker and retry",
                ));
            },
        }
        Ok(Self {
            compose_style: ComposeStyle::detect(),
        })
    }

    /// Build an adapter with a fixed compose flavor, skipping the probe.
    #[must_use]
    pub const fn with_compose_style(compose_style: ComposeStyle) -> Self {
        Self { compose_style }
    }

    /// The detected compose flavor.
    #[must_use]
    pub const fn compose_style(&self) -> ComposeStyle {
        self.compose_style
    }

    // === Networks ===

    /// Create the external proxy network if it does not exist. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Runtime`] when creation fails for a reason other
    /// than the network already existing.
    pub fn ensure_network(&self, name: &str) -> Result<(), Error> {
        if self.network_exists(name)? {
            tracing::debug!(network = name, "proxy network already exists");
            return Ok(());
        }
        tracing::info!(network = name, "creating proxy network");
        match self.docker(&["network", "create", name], timeouts::ENSURE_NETWORK) {
            Ok(_) => Ok(()),
            // Lost the race with a concurrent create: still idempotent.
            Err(Error::Runtime { stderr, .. }) if stderr.contains("already exists") => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Returns `true` if a network with this name exists.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Runtime`] on runtime failure.
    pub fn network_exists(&self, name: &str) -> Result<bool, Error> {
        self.object_exists(&["network", "inspect", name])
    }

    // === Volumes ===

    /// Create a named volume. Idempotent on the runtime side.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Runtime`] on failure.
    pub fn volume_create(&self, name: &str) -> Result<(), Error> {
        self.docker(&["volume", "create", name], timeouts::DEFAULT)
            .map(|_| ())
    }

    /// Remove a named volume.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Runtime`] on failure.
    pub fn volume_remove(&self, name: &str) -> Result<(), Error> {
        self.docker(&["volume", "rm", name], timeouts::DEFAULT)
            .map(|_| ())
    }

    /// Returns `true` if a volume with this name exists.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Runtime`] on runtime failure.
    pub fn volume_exists(&self, name: &str) -> Result<bool, Error> {
        self.object_exists(&["volume", "inspect", name])
    }

    /// List volume names starting with `prefix`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Runtime`] on failure.
    pub fn volume_list(&self, prefix: &str) -> Result<Vec<String>, Error> {
        let stdout = self.docker(&["volume", "ls", "-q"], timeouts::DEFAULT)?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && l.starts_with(prefix))
            .map(ToString::to_string)
            .collect())
    }

    /// Raw inspect document for a volume.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] when the volume does not exist and
    /// [`Error::Runtime`] on other failures.
    pub fn volume_inspect(&self, name: &str) -> Result<serde_json::Value, Error> {
        match self.docker(&["volume", "inspect", name], timeouts::DEFAULT) {
            Ok(stdout) => serde_json::from_str::<serde_json::Value>(&stdout)
                .map(|v| v.get(0).cloned().unwrap_or(v))
                .map_err(|e| Error::Runtime {
                    tool: "docker".to_string(),
                    exit_code: Some(0),
                    stderr: format!("unparseable volume inspect output: {e}"),
                }),
            Err(Error::Runtime { stderr, .. }) if stderr.contains("no such volume") => {
                Err(Error::not_found(format!("volume '{name}'")))
            },
            Err(e) => Err(e),
        }
    }

    /// Human-readable size of a volume, measured from a throwaway container.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Runtime`] on failure.
    pub fn volume_size(&self, name: &str) -> Result<String, Error> {
        let stdout = self.docker(
            &[
                "run",
                "--rm",
                "-v",
                &format!("{name}:/data:ro"),
                "alpine",
                "du",
                "-sh",
                "/data",
            ],
            timeouts::DEFAULT,
        )?;
        Ok(stdout
            .split_whitespace()
            .next()
            .unwrap_or("unknown")
            .to_string())
    }

    /// Running containers that mount the volume.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Runtime`] on failure.
    pub fn containers_using_volume(&self, name: &str) -> Result<Vec<ContainerInfo>, Error> {
        let stdout = self.docker(
            &[
                "ps",
                "--filter",
                &format!("volume={name}"),
                "--format",
                "{{.ID}}|{{.Names}}|{{.State}}|{{.Status}}|{{.Image}}",
            ],
            timeouts::DEFAULT,
        )?;
        Ok(parse_container_lines(&stdout))
    }

    /// Returns `true` if every listed container ID is currently running.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Runtime`] on failure.
    pub fn containers_are_running(&self, ids: &[String]) -> Result<bool, Error> {
        let running = self.running_containers()?;
        Ok(ids
            .iter()
            .all(|id| running.iter().any(|c| c.id.starts_with(id.as_str()) || id.starts_with(&c.id))))
    }

    // === Containers ===

    /// Containers belonging to a compose stack, running or not.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Runtime`] on failure.
    pub fn containers_for_stack(&self, stack_name: &str) -> Result<Vec<ContainerInfo>, Error> {
        let stdout = self.docker(
            &[
                "ps",
                "-a",
                "--filter",
                &format!("label=com.docker.compose.project={stack_name}"),
                "--format",
                "{{.ID}}|{{.Names}}|{{.State}}|{{.Status}}|{{.Image}}",
            ],
            timeouts::DEFAULT,
        )?;
        Ok(parse_container_lines(&stdout))
    }

    /// All currently running containers.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Runtime`] on failure.
    pub fn running_containers(&self) -> Result<Vec<ContainerInfo>, Error> {
        let stdout = self.docker(
            &[
                "ps",
                "--format",
                "{{.ID}}|{{.Names}}|{{.State}}|{{.Status}}|{{.Image}}",
            ],
            timeouts::DEFAULT,
        )?;
        Ok(parse_container_lines(&stdout))
    }

    /// Labels of one container.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Runtime`] on failure.
    pub fn container_labels(&self, id: &str) -> Result<BTreeMap<String, String>, Error> {
        let stdout = self.docker(
            &["inspect", "--format", "{{json .Config.Labels}}", id],
            timeouts::DEFAULT,
        )?;
        let labels: Option<BTreeMap<String, String>> = serde_json::from_str(stdout.trim())
            .map_err(|e| Error::Runtime {
                tool: "docker".to_string(),
                exit_code: Some(0),
                stderr: format!("unparseable label JSON for container {id}: {e}"),
            })?;
        Ok(labels.unwrap_or_default())
    }

    /// Returns `true` if a container with this exact name is running.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Runtime`] on failure.
    pub fn container_running(&self, name: &str) -> Result<bool, Error> {
        let stdout = self.docker(
            &[
                "ps",
                "--filter",
                &format!("name=^{name}$"),
                "--format",
                "{{.Names}}",
            ],
            timeouts::DEFAULT,
        )?;
        Ok(stdout.lines().any(|l| l.trim() == name))
    }

    /// Returns `true` if a container with this name exists (any state).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Runtime`] on failure.
    pub fn container_exists(&self, name: &str) -> Result<bool, Error> {
        self.object_exists(&["container", "inspect", name])
    }

    /// Force-remove a container by name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Runtime`] on failure.
    pub fn container_remove(&self, name: &str) -> Result<(), Error> {
        self.docker(&["rm", "-f", name], timeouts::DEFAULT).map(|_| ())
    }

    /// Run `docker exec` in a container, capturing stdout.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Runtime`] on non-zero exit.
    pub fn exec_capture(
        &self,
        container: &str,
        cmd: &[&str],
        timeout: Duration,
    ) -> Result<String, Error> {
        let mut args = vec!["exec", container];
        args.extend_from_slice(cmd);
        self.docker(&args, timeout)
    }

    /// Run a throwaway container (`docker run --rm`) with volume mounts.
    ///
    /// Mount specs are passed verbatim (`name:/path[:ro]`).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Runtime`] on non-zero exit and [`Error::Timeout`]
    /// when the budget elapses.
    pub fn run_throwaway(
        &self,
        image: &str,
        mounts: &[String],
        cmd: &[&str],
        timeout: Duration,
    ) -> Result<String, Error> {
        let mut args: Vec<&str> = vec!["run", "--rm"];
        for mount in mounts {
            args.push("-v");
            args.push(mount);
        }
        args.push(image);
        args.extend_from_slice(cmd);
        self.docker(&args, timeout)
    }

    /// Run `docker` with raw arguments, capturing stdout. Used by a handful
    /// of callers whose argument shape does not fit a typed operation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Runtime`] on non-zero exit.
    pub fn docker_raw(&self, args: &[&str], timeout: Duration) -> Result<String, Error> {
        self.docker(args, timeout)
    }

    /// Run `docker` with inherited stdio so output streams to the user.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Runtime`] on non-zero exit.
    pub fn docker_streaming(&self, args: &[&str], cwd: Option<&Path>) -> Result<(), Error> {
        let mut cmd = Command::new("docker");
        cmd.args(args);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        let status = cmd
            .status()
            .map_err(|e| Error::io("failed to spawn docker", e))?;
        if status.success() {
            Ok(())
        } else {
            Err(Error::Runtime {
                tool: "docker".to_string(),
                exit_code: status.code(),
                stderr: String::new(),
            })
        }
    }

    fn docker(&self, args: &[&str], timeout: Duration) -> Result<String, Error> {
        let output = run_bounded(
            Command::new("docker").args(args),
            timeout,
            &format!("docker {}", args.first().copied().unwrap_or_default()),
        )?;
        if output.success {
            Ok(output.stdout)
        } else {
            Err(Error::Runtime {
                tool: "docker".to_string(),
                exit_code: output.exit_code,
                stderr: output.stderr_tail(),
            })
        }
    }

    fn object_exists(&self, inspect_args: &[&str]) -> Result<bool, Error> {
        let output = run_bounded(
            Command::new("docker").args(inspect_args),
            timeouts::DEFAULT,
            "docker inspect",
        )?;
        Ok(output.success)
    }
}

fn parse_container_lines(stdout: &str) -> Vec<ContainerInfo> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut parts = line.splitn(5, '|');
            Some(ContainerInfo {
                id: parts.next()?.trim().to_string(),
                name: parts.next()?.trim().trim_start_matches('/').to_string(),
                state: parts.next()?.trim().to_string(),
                status: parts.next()?.trim().to_string(),
                image: parts.next()?.trim().to_string(),
            })
        })
        .collect()
}

/// Captured result of a bounded external command.
#[derive(Debug)]
pub(crate) struct BoundedOutput {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl BoundedOutput {
    /// Trailing portion of stderr for error records; falls back to stdout
    /// when stderr is empty.
    pub fn stderr_tail(&self) -> String {
        let text = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        let text = text.trim();
        if text.len() <= STDERR_TAIL_BYTES {
            return text.to_string();
        }
        let cut = text.len() - STDERR_TAIL_BYTES;
        // Cut on a char boundary.
        let start = (cut..text.len())
            .find(|&i| text.is_char_boundary(i))
            .unwrap_or(cut);
        text[start..].to_string()
    }
}

/// Spawn a command with piped output and wait for it with a deadline.
///
/// Reader threads drain both pipes so large outputs cannot deadlock the
/// child. On deadline expiry the child is killed and [`Error::Timeout`] is
/// returned.
pub(crate) fn run_bounded(
    cmd: &mut Command,
    timeout: Duration,
    operation: &str,
) -> Result<BoundedOutput, Error> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd
        .spawn()
        .map_err(|e| Error::io(format!("failed to spawn {operation}"), e))?;

    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();
    let stdout_reader = std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(pipe) = stdout_pipe.as_mut() {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    });
    let stderr_reader = std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(pipe) = stderr_pipe.as_mut() {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    });

    let status = match child
        .wait_timeout(timeout)
        .map_err(|e| Error::io(format!("failed to wait for {operation}"), e))?
    {
        Some(status) => status,
        None => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(Error::Timeout {
                operation: operation.to_string(),
                seconds: timeout.as_secs(),
            });
        },
    };

    let stdout = stdout_reader.join().unwrap_or_default();
    let stderr = stderr_reader.join().unwrap_or_default();

    Ok(BoundedOutput {
        success: status.success(),
        exit_code: status.code(),
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_run_captures_output() {
        let out = run_bounded(
            Command::new("sh").args(["-c", "echo hello; echo oops >&2"]),
            Duration::from_secs(5),
            "sh",
        )
        .unwrap();
        assert!(out.success);
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.stderr.trim(), "oops");
    }

    #[test]
    fn bounded_run_times_out() {
        let err = run_bounded(
            Command::new("sleep").arg("5"),
            Duration::from_millis(100),
            "sleep",
        )
        .unwrap_err();
        assert_eq!(err.code(), "timeout");
    }

    #[test]
    fn stderr_tail_prefers_stderr_and_truncates() {
        let out = BoundedOutput {
            success: false,
            exit_code: Some(1),
            stdout: "ignored".into(),
            stderr: "x".repeat(STDERR_TAIL_BYTES + 100),
        };
        assert_eq!(out.stderr_tail().len(), STDERR_TAIL_BYTES);

        let out = BoundedOutput {
            success: false,
            exit_code: Some(1),
            stdout: "fallback".into(),
            stderr: String::new(),
        };
        assert_eq!(out.stderr_tail(), "fallback");
    }

    #[test]
    fn container_line_parsing() {
        let parsed = parse_container_lines(
            "abc123|myapp-feature-auth-web-1|running|Up 2 minutes|myapp-web:dev\n",
        );
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].name, "myapp-feature-auth-web-1");
        assert!(parsed[0].is_running());
    }
}
