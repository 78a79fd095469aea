//! Declarative stack (compose) invocations.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use crate::error::Error;

use super::{run_bounded, timeouts};

/// Which compose flavor is installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComposeStyle {
    /// `docker compose` (v2 plugin).
    Plugin,
    /// Standalone `docker-compose` binary.
    Standalone,
}

impl ComposeStyle {
    /// Probe for the v2 plugin first, then the standalone binary.
    #[must_use]
    pub fn detect() -> Self {
        let plugin = run_bounded(
            Command::new("docker").args(["compose", "version"]),
            Duration::from_secs(10),
            "docker compose version",
        );
        if matches!(plugin, Ok(ref out) if out.success) {
            return Self::Plugin;
        }
        let standalone = run_bounded(
            Command::new("docker-compose").arg("version"),
            Duration::from_secs(10),
            "docker-compose version",
        );
        if matches!(standalone, Ok(ref out) if out.success) {
            return Self::Standalone;
        }
        // Nothing responded; the plugin form gives the clearest error later.
        Self::Plugin
    }

    fn base_command(self) -> Command {
        match self {
            Self::Plugin => {
                let mut cmd = Command::new("docker");
                cmd.arg("compose");
                cmd
            },
            Self::Standalone => Command::new("docker-compose"),
        }
    }
}

/// One fully-specified compose invocation: stack identity, files,
/// environment file, and working directory.
#[derive(Debug, Clone)]
pub struct ComposeInvocation {
    /// Compose files, in precedence order.
    pub files: Vec<PathBuf>,
    /// Stack (project) name.
    pub stack_name: String,
    /// Environment file passed via `--env-file`, when present on disk.
    pub env_file: Option<PathBuf>,
    /// Working directory for relative paths in the compose files.
    pub working_dir: PathBuf,
}

impl ComposeInvocation {
    fn command(&self, style: ComposeStyle, args: &[&str]) -> Command {
        let mut cmd = style.base_command();
        if let Some(env_file) = &self.env_file {
            if env_file.exists() {
                cmd.arg("--env-file").arg(env_file);
            }
        }
        cmd.arg("-p").arg(&self.stack_name);
        for file in &self.files {
            cmd.arg("-f").arg(file);
        }
        cmd.args(args);
        cmd.current_dir(&self.working_dir);
        // Compose files reference the checkout through PROJECT_ROOT.
        cmd.env("PROJECT_ROOT", &self.working_dir);
        cmd
    }

    fn run_captured(
        &self,
        style: ComposeStyle,
        args: &[&str],
        timeout: Duration,
    ) -> Result<String, Error> {
        let operation = format!("compose {}", args.first().copied().unwrap_or_default());
        let output = run_bounded(&mut self.command(style, args), timeout, &operation)?;
        if output.success {
            Ok(output.stdout)
        } else {
            Err(Error::Runtime {
                tool: "docker compose".to_string(),
                exit_code: output.exit_code,
                stderr: output.stderr_tail(),
            })
        }
    }
}

impl super::DockerRuntime {
    /// Bring a stack up detached.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Runtime`] on compose failure and [`Error::Timeout`]
    /// after the stack-up budget.
    pub fn stack_up(&self, invocation: &ComposeInvocation, detach: bool) -> Result<(), Error> {
        let args: &[&str] = if detach { &["up", "-d"] } else { &["up"] };
        tracing::info!(stack = %invocation.stack_name, "bringing stack up");
        invocation
            .run_captured(self.compose_style(), args, timeouts::STACK_UP)
            .map(|_| ())
    }

    /// Bring a stack down without removing volumes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Runtime`] on compose failure.
    pub fn stack_down(&self, invocation: &ComposeInvocation) -> Result<(), Error> {
        tracing::info!(stack = %invocation.stack_name, "bringing stack down");
        invocation
            .run_captured(self.compose_style(), &["down"], timeouts::STACK_UP)
            .map(|_| ())
    }

    /// `docker compose ps` output for a stack.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Runtime`] on compose failure.
    pub fn stack_ps(&self, invocation: &ComposeInvocation) -> Result<String, Error> {
        invocation.run_captured(self.compose_style(), &["ps"], timeouts::DEFAULT)
    }

    /// Pass arbitrary compose arguments through with inherited stdio, so
    /// interactive and streaming subcommands (`exec`, `logs -f`, `run`)
    /// behave exactly as the underlying tool.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Runtime`] when the tool exits non-zero.
    pub fn stack_passthrough(
        &self,
        invocation: &ComposeInvocation,
        args: &[String],
    ) -> Result<(), Error> {
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let mut cmd = invocation.command(self.compose_style(), &arg_refs);
        cmd.stdin(std::process::Stdio::inherit())
            .stdout(std::process::Stdio::inherit())
            .stderr(std::process::Stdio::inherit());
        let status = cmd
            .status()
            .map_err(|e| Error::io("failed to spawn compose", e))?;
        if status.success() {
            Ok(())
        } else {
            Err(Error::Runtime {
                tool: "docker compose".to_string(),
                exit_code: status.code(),
                stderr: String::new(),
            })
        }
    }
}

/// Build the standard invocation for a worktree: the derived compose variant
/// with the worktree's env file, rooted at the worktree checkout.
#[must_use]
pub fn worktree_invocation(
    worktree_root: &Path,
    compose_file: PathBuf,
    stack_name: String,
) -> ComposeInvocation {
    ComposeInvocation {
        files: vec![compose_file],
        stack_name,
        env_file: Some(crate::paths::ProjectContext::env_file_path(worktree_root)),
        working_dir: worktree_root.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invocation_assembles_expected_argv() {
        let inv = ComposeInvocation {
            files: vec![PathBuf::from("/p/.dockertree/docker-compose.worktree.yml")],
            stack_name: "myapp-feature-auth".to_string(),
            env_file: None,
            working_dir: PathBuf::from("/p"),
        };
        let cmd = inv.command(ComposeStyle::Plugin, &["up", "-d"]);
        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            vec![
                "compose",
                "-p",
                "myapp-feature-auth",
                "-f",
                "/p/.dockertree/docker-compose.worktree.yml",
                "up",
                "-d"
            ]
        );
    }

    #[test]
    fn standalone_style_uses_plain_binary() {
        let inv = ComposeInvocation {
            files: vec![],
            stack_name: "s".to_string(),
            env_file: None,
            working_dir: PathBuf::from("."),
        };
        let cmd = inv.command(ComposeStyle::Standalone, &["ps"]);
        assert_eq!(cmd.get_program(), "docker-compose");
    }
}
