//! Request dispatch: IPC requests onto core operations.

use std::path::{Path, PathBuf};

use dockertree_core::config::ProjectConfig;
use dockertree_core::error::Error;
use dockertree_core::ipc::IpcRequest;
use dockertree_core::orchestrator::WorktreeOrchestrator;
use dockertree_core::output::CommandOutput;
use dockertree_core::package::{ExportOptions, ImportOptions, PackageManager};
use dockertree_core::paths::ProjectContext;
use dockertree_core::runtime::DockerRuntime;
use dockertree_core::setup::SetupManager;

/// Handle one request, mapping any failure into the error envelope.
pub fn dispatch(request: &IpcRequest) -> CommandOutput {
    let operation = request.operation();
    match handle(request) {
        Ok(data) => CommandOutput::ok(operation, data),
        Err(err) => CommandOutput::err(operation, &err),
    }
}

fn handle(request: &IpcRequest) -> Result<serde_json::Value, Error> {
    let wd = resolve_working_directory(request.working_directory())?;
    if request.is_mutating() {
        validate_project(&wd)?;
    }

    match request {
        IpcRequest::Setup {
            project_name,
            force,
            ..
        } => {
            let report = SetupManager::new(&wd).run(project_name.as_deref(), *force)?;
            Ok(serde_json::to_value(report).unwrap_or_default())
        },
        IpcRequest::ListWorktrees { .. } => {
            let orchestrator = open(&wd)?;
            let worktrees = orchestrator.list()?;
            Ok(serde_json::to_value(worktrees).unwrap_or_default())
        },
        IpcRequest::WorktreeStatus { branch, .. } => {
            let orchestrator = open(&wd)?;
            let status = orchestrator.status(branch)?;
            Ok(serde_json::to_value(status).unwrap_or_default())
        },
        IpcRequest::CreateWorktree { branch, .. } => {
            let orchestrator = open(&wd)?;
            let status = orchestrator.create(branch)?;
            Ok(serde_json::to_value(status).unwrap_or_default())
        },
        IpcRequest::StartWorktree { branch, .. } => {
            let orchestrator = open(&wd)?;
            let status = orchestrator.start(branch, true)?;
            Ok(serde_json::to_value(status).unwrap_or_default())
        },
        IpcRequest::StopWorktree { branch, .. } => {
            let orchestrator = open(&wd)?;
            let status = orchestrator.stop(branch)?;
            Ok(serde_json::to_value(status).unwrap_or_default())
        },
        IpcRequest::RemoveWorktree { branch, .. } => {
            let orchestrator = open(&wd)?;
            let report = orchestrator.remove(branch)?;
            Ok(serde_json::to_value(report).unwrap_or_default())
        },
        IpcRequest::DeleteWorktree { branch, force, .. } => {
            let orchestrator = open(&wd)?;
            let report = orchestrator.delete(branch, *force)?;
            Ok(serde_json::to_value(report).unwrap_or_default())
        },
        IpcRequest::ExportPackage {
            branch,
            include_code,
            output_dir,
            ..
        } => {
            let orchestrator = open(&wd)?;
            let manager = PackageManager::new(&orchestrator);
            let report = manager.export(
                branch,
                &ExportOptions {
                    include_code: *include_code,
                    output_dir: output_dir.clone(),
                    skip_volumes: false,
                },
            )?;
            Ok(serde_json::to_value(report).unwrap_or_default())
        },
        IpcRequest::ImportPackage {
            package,
            target_branch,
            restore_data,
            ..
        } => {
            let orchestrator = open(&wd)?;
            let manager = PackageManager::new(&orchestrator);
            let report = manager.import(
                package,
                &ImportOptions {
                    target_branch: target_branch.clone(),
                    restore_data: *restore_data,
                    ..ImportOptions::default()
                },
            )?;
            Ok(serde_json::to_value(report).unwrap_or_default())
        },
        IpcRequest::ValidatePackage { package, .. } => {
            let orchestrator = open(&wd)?;
            let manager = PackageManager::new(&orchestrator);
            let metadata = manager.validate(package)?;
            Ok(serde_json::to_value(metadata).unwrap_or_default())
        },
    }
}

/// Working directories must be absolute; a relative path is accepted only
/// when `DOCKERTREE_WORKING_DIR` provides an absolute base to resolve it
/// against.
fn resolve_working_directory(requested: &Path) -> Result<PathBuf, Error> {
    if requested.is_absolute() {
        return Ok(requested.to_path_buf());
    }
    if let Some(base) = std::env::var_os("DOCKERTREE_WORKING_DIR") {
        let base = PathBuf::from(base);
        if base.is_absolute() {
            return Ok(base.join(requested));
        }
    }
    Err(Error::validation(format!(
        "working_directory must be absolute, got '{}'",
        requested.display()
    )))
}

fn validate_project(working_directory: &Path) -> Result<(), Error> {
    if !ProjectConfig::path(working_directory).is_file() {
        return Err(Error::precondition(format!(
            "{} is not an initialized dockertree project",
            working_directory.display()
        )));
    }
    Ok(())
}

fn open(working_directory: &Path) -> Result<WorktreeOrchestrator, Error> {
    let ctx = ProjectContext::discover(working_directory)?;
    let config = ProjectConfig::load(&ctx.root)?;
    let runtime = DockerRuntime::new()?;
    Ok(WorktreeOrchestrator::new(ctx, config, runtime))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_working_directory_is_rejected() {
        if std::env::var_os("DOCKERTREE_WORKING_DIR").is_some() {
            return;
        }
        let request = IpcRequest::ListWorktrees {
            working_directory: PathBuf::from("relative/path"),
        };
        let output = dispatch(&request);
        assert!(!output.success);
        assert_eq!(output.error.as_ref().unwrap().code, "validation_error");
    }

    #[test]
    fn mutating_requests_require_a_project() {
        let dir = tempfile::tempdir().unwrap();
        let request = IpcRequest::CreateWorktree {
            working_directory: dir.path().to_path_buf(),
            branch: "feature-auth".to_string(),
        };
        let output = dispatch(&request);
        assert!(!output.success);
        assert_eq!(
            output.error.as_ref().unwrap().code,
            "precondition_failed"
        );
    }
}
