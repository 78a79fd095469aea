//! Command implementations.

pub mod completion;
pub mod droplet;
pub mod packages;
pub mod passthrough;
pub mod proxy;
pub mod setup;
pub mod volumes;
pub mod worktree;

use dockertree_core::config::ProjectConfig;
use dockertree_core::error::Error;
use dockertree_core::orchestrator::WorktreeOrchestrator;
use dockertree_core::output::CommandOutput;
use dockertree_core::paths::ProjectContext;
use dockertree_core::runtime::DockerRuntime;

/// Outcome of one command: the structured envelope plus the process exit
/// code derived from it.
pub struct CmdResult {
    /// Envelope printed under `--json`.
    pub output: CommandOutput,
    /// Process exit code.
    pub exit: i32,
}

impl CmdResult {
    /// Successful command.
    pub fn ok(operation: &str, data: serde_json::Value) -> Self {
        Self {
            output: CommandOutput::ok(operation, data),
            exit: 0,
        }
    }

    /// Failed command; prints the human message to stderr when not in
    /// JSON mode.
    pub fn err(operation: &str, error: &Error, json: bool) -> Self {
        if !json {
            eprintln!("error: {error}");
        }
        Self {
            output: CommandOutput::err(operation, error),
            exit: error.exit_code(),
        }
    }

    /// Failed command carrying per-item data (bulk operations).
    pub fn err_with_data(
        operation: &str,
        error: &Error,
        data: serde_json::Value,
        json: bool,
    ) -> Self {
        let mut result = Self::err(operation, error, json);
        result.output = result.output.with_data(data);
        result
    }
}

/// Everything a project-scoped command needs.
pub struct Project {
    /// Resolved layout.
    pub ctx: ProjectContext,
    /// Loaded configuration.
    pub config: ProjectConfig,
    /// Runtime adapter.
    pub runtime: DockerRuntime,
}

impl Project {
    /// Discover the project from the working directory and probe the
    /// runtime.
    pub fn open() -> Result<Self, Error> {
        let cwd = std::env::current_dir().map_err(|e| Error::io("failed to read cwd", e))?;
        let ctx = ProjectContext::discover(&cwd)?;
        let config = ProjectConfig::load(&ctx.root)?;
        let runtime = DockerRuntime::new()?;
        Ok(Self {
            ctx,
            config,
            runtime,
        })
    }

    /// Build the orchestrator, consuming the project handle.
    pub fn orchestrator(self) -> WorktreeOrchestrator {
        WorktreeOrchestrator::new(self.ctx, self.config, self.runtime)
    }
}

/// Run a closure against an opened project, mapping discovery failures
/// into the command envelope.
pub fn with_project(
    operation: &str,
    json: bool,
    f: impl FnOnce(Project) -> Result<serde_json::Value, Error>,
) -> CmdResult {
    match Project::open().and_then(f) {
        Ok(data) => CmdResult::ok(operation, data),
        Err(err) => CmdResult::err(operation, &err, json),
    }
}
