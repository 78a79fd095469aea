//! End-to-end worktree lifecycle: create, start, stop, remove, delete.
//!
//! Per worktree the admissible states are
//! `Absent -> Created -> {Running <-> Stopped} -> Absent`. Each transition
//! is total: it either reaches the target state or rolls back the steps it
//! completed, in reverse order, and returns a single typed error. Commands
//! targeting the same branch serialize through an in-process wait set plus
//! an advisory file lock, so concurrent invocations cannot interleave.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};

use fs2::FileExt;
use serde::Serialize;

use crate::config::ProjectConfig;
use crate::envgen;
use crate::error::Error;
use crate::paths::{copy_dockertree_dir, ProjectContext};
use crate::pattern;
use crate::runtime::compose::worktree_invocation;
use crate::runtime::DockerRuntime;
use crate::validate;
use crate::vcs::GitAdapter;
use crate::volumes::VolumeCloner;

/// Observable state of a worktree's stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorktreeState {
    /// Checkout exists, no containers yet.
    Created,
    /// At least one stack container is running.
    Running,
    /// Containers exist but none are running.
    Stopped,
}

/// Summary of one worktree for listings and `--json` output.
#[derive(Debug, Clone, Serialize)]
pub struct WorktreeStatus {
    /// Branch owning the worktree.
    pub branch: String,
    /// Checkout path.
    pub path: PathBuf,
    /// HEAD commit.
    pub head: String,
    /// Stack state.
    pub state: WorktreeState,
    /// Local routing domain.
    pub domain: String,
    /// Container names with their states.
    pub containers: Vec<ContainerSummary>,
}

/// One container of a worktree's stack.
#[derive(Debug, Clone, Serialize)]
pub struct ContainerSummary {
    /// Container name.
    pub name: String,
    /// `running`, `exited`, ...
    pub state: String,
    /// Image reference.
    pub image: String,
}

/// Per-item outcome of a bulk remove/delete.
#[derive(Debug, Clone, Serialize)]
pub struct BulkItemResult {
    /// Branch the item targeted.
    pub branch: String,
    /// Whether the item completed.
    pub success: bool,
    /// Error message when it did not.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Cooperative cancellation token checked between orchestration steps.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    /// Create an unset token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Returns `true` once cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), Error> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Result of removing a worktree.
#[derive(Debug, Clone, Serialize)]
pub struct RemovalReport {
    /// Branch that was removed.
    pub branch: String,
    /// Volumes that were removed.
    pub volumes_removed: Vec<String>,
    /// Whether the checkout was removed.
    pub worktree_removed: bool,
    /// Whether the branch itself was deleted.
    pub branch_deleted: bool,
}

/// Coordinates VCS, runtime, environment, and volume operations for one
/// project.
pub struct WorktreeOrchestrator {
    ctx: ProjectContext,
    config: ProjectConfig,
    runtime: DockerRuntime,
    git: GitAdapter,
    cancel: CancellationToken,
}

impl WorktreeOrchestrator {
    /// Build an orchestrator for a discovered project.
    #[must_use]
    pub fn new(ctx: ProjectContext, config: ProjectConfig, runtime: DockerRuntime) -> Self {
        let git = GitAdapter::new(&ctx.outer_root);
        Self {
            ctx,
            config,
            runtime,
            git,
            cancel: CancellationToken::new(),
        }
    }

    /// Install a cancellation token checked between steps.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// The project configuration in use.
    #[must_use]
    pub const fn config(&self) -> &ProjectConfig {
        &self.config
    }

    /// The runtime adapter in use.
    #[must_use]
    pub const fn runtime(&self) -> &DockerRuntime {
        &self.runtime
    }

    /// The VCS adapter in use.
    #[must_use]
    pub const fn git(&self) -> &GitAdapter {
        &self.git
    }

    /// The resolved project context.
    #[must_use]
    pub const fn context(&self) -> &ProjectContext {
        &self.ctx
    }

    fn worktree_path(&self, branch: &str) -> PathBuf {
        self.ctx.worktree_path(&self.config.worktree_dir, branch)
    }

    /// Create a worktree: checkout, fractal config copy, port allocation,
    /// env file, and cloned volumes. On failure every completed step is
    /// undone in reverse order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for bad branch names,
    /// [`Error::AlreadyExists`] when the worktree exists, and the failing
    /// step's error otherwise.
    pub fn create(&self, branch: &str) -> Result<WorktreeStatus, Error> {
        validate::validate_branch_name(branch)?;
        let _lock = BranchLock::acquire(&self.ctx.outer_root, branch)?;

        if self.git.find_worktree(branch)?.is_some() {
            return Err(Error::already_exists(format!(
                "worktree for branch '{branch}'"
            )));
        }
        let path = self.worktree_path(branch);
        if path.exists() {
            return Err(Error::already_exists(format!(
                "checkout directory {}",
                path.display()
            )));
        }

        let branch_was_new = !self.git.branch_exists(branch)?;
        let mut rollback = Rollback::new(self, branch, &path, branch_was_new);

        // Step 2: checkout.
        self.cancel.check()?;
        if let Err(err) = self.git.worktree_add(branch, &path) {
            return Err(err);
        }
        rollback.worktree_added = true;

        // Steps 3..6 under rollback protection.
        let status = match self.populate_worktree(branch, &path, &mut rollback) {
            Ok(status) => status,
            Err(err) => {
                rollback.run();
                return Err(err);
            },
        };
        rollback.disarm();
        tracing::info!(branch, path = %path.display(), "worktree created");
        Ok(status)
    }

    fn populate_worktree(
        &self,
        branch: &str,
        path: &std::path::Path,
        rollback: &mut Rollback<'_>,
    ) -> Result<WorktreeStatus, Error> {
        // Step 3: fractal configuration copy.
        self.cancel.check()?;
        copy_dockertree_dir(&self.ctx.outer_root, path)?;

        // Step 4: host-port triple disjoint from every existing worktree.
        self.cancel.check()?;
        let env_paths: Vec<PathBuf> = self
            .git
            .worktree_list()?
            .iter()
            .map(|e| ProjectContext::env_file_path(&e.path))
            .collect();
        let used = envgen::used_ports(&env_paths);
        let ports = envgen::allocate_triple(&used)?;

        // Step 5: env file.
        self.cancel.check()?;
        let env = envgen::generate(&self.config, branch, path, ports);
        env.store(&ProjectContext::env_file_path(path))?;

        // Copy the project .env alongside when one exists.
        let source_env = self.ctx.outer_root.join(".env");
        if source_env.is_file() {
            std::fs::copy(&source_env, path.join(".env"))
                .map_err(|e| Error::io("failed to copy project .env", e))?;
        }

        // Step 6: clone every declared volume.
        let cloner = VolumeCloner::new(&self.runtime, &self.config);
        for declared in &self.config.volumes {
            self.cancel.check()?;
            let src = self.config.source_volume_name(declared);
            let dst = self.config.volume_name(branch, declared);
            cloner.copy(declared, &src, &dst)?;
            rollback.volumes_created.push(dst);
        }

        self.status(branch)
    }

    /// Start a worktree's stack (`Created|Stopped -> Running`).
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] when the worktree does not exist and
    /// [`Error::Runtime`] on compose failure.
    pub fn start(&self, branch: &str, detach: bool) -> Result<WorktreeStatus, Error> {
        let _lock = BranchLock::acquire(&self.ctx.outer_root, branch)?;
        let entry = self.require_worktree(branch)?;

        self.runtime.ensure_network(&self.config.caddy_network)?;

        let compose_file = ProjectContext::compose_worktree_path(&entry.path);
        if !compose_file.is_file() {
            return Err(Error::precondition(format!(
                "compose variant missing at {} (re-run setup)",
                compose_file.display()
            )));
        }
        let invocation =
            worktree_invocation(&entry.path, compose_file, self.config.stack_name(branch));
        self.runtime.stack_up(&invocation, detach)?;
        self.status(branch)
    }

    /// Stop a worktree's stack (`Running -> Stopped`), keeping volumes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] when the worktree does not exist and
    /// [`Error::Runtime`] on compose failure.
    pub fn stop(&self, branch: &str) -> Result<WorktreeStatus, Error> {
        let _lock = BranchLock::acquire(&self.ctx.outer_root, branch)?;
        let entry = self.require_worktree(branch)?;
        let compose_file = ProjectContext::compose_worktree_path(&entry.path);
        let invocation =
            worktree_invocation(&entry.path, compose_file, self.config.stack_name(branch));
        self.runtime.stack_down(&invocation)?;
        self.status(branch)
    }

    /// Remove a worktree: stack down, branch-scoped volumes removed,
    /// checkout removed. The branch itself is preserved.
    ///
    /// # Errors
    ///
    /// Best-effort; on partial failure the error's details list the
    /// objects left behind.
    pub fn remove(&self, branch: &str) -> Result<RemovalReport, Error> {
        let _lock = BranchLock::acquire(&self.ctx.outer_root, branch)?;
        self.remove_locked(branch, false, false)
    }

    /// Remove a worktree and delete its branch.
    ///
    /// Protected branches are refused without `force`; unmerged branches
    /// are refused unless `force` is set.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for protected branches, otherwise as
    /// [`Self::remove`].
    pub fn delete(&self, branch: &str, force: bool) -> Result<RemovalReport, Error> {
        validate::check_deletable(branch, &self.config.protected_branches, force)?;
        let _lock = BranchLock::acquire(&self.ctx.outer_root, branch)?;
        self.remove_locked(branch, true, force)
    }

    fn remove_locked(
        &self,
        branch: &str,
        delete_branch: bool,
        force: bool,
    ) -> Result<RemovalReport, Error> {
        let stack_name = self.config.stack_name(branch);
        let entry = self.git.find_worktree(branch)?;
        let branch_exists = self.git.branch_exists(branch)?;
        let stack_volumes = self.runtime.volume_list(&format!("{stack_name}_"))?;

        if entry.is_none() && !branch_exists && stack_volumes.is_empty() {
            return Err(Error::not_found(format!(
                "nothing to remove for '{branch}': no worktree, branch, or volumes"
            )));
        }

        // Stack down first so volume removal cannot race running containers.
        if let Some(entry) = &entry {
            let compose_file = ProjectContext::compose_worktree_path(&entry.path);
            if compose_file.is_file() {
                let invocation =
                    worktree_invocation(&entry.path, compose_file, stack_name.clone());
                if let Err(err) = self.runtime.stack_down(&invocation) {
                    tracing::warn!(branch, error = %err, "stack down failed, continuing removal");
                }
            }
        }

        let cloner = VolumeCloner::new(&self.runtime, &self.config);
        let volumes_removed = cloner.remove_stack_volumes(&stack_name)?;

        let mut worktree_removed = false;
        if let Some(entry) = &entry {
            self.git.worktree_remove(&entry.path, true)?;
            worktree_removed = true;
        }

        let mut branch_deleted = false;
        if delete_branch && branch_exists {
            self.git.branch_delete(branch, force)?;
            branch_deleted = true;
        }

        tracing::info!(branch, "worktree removed");
        Ok(RemovalReport {
            branch: branch.to_string(),
            volumes_removed,
            worktree_removed,
            branch_deleted,
        })
    }

    /// Remove or delete every branch matching a glob pattern.
    ///
    /// Items run sequentially; one failure does not abort the rest. The
    /// caller maps any failed item to exit code 1.
    pub fn bulk(
        &self,
        pattern: &str,
        delete_branch: bool,
        force: bool,
    ) -> Result<Vec<BulkItemResult>, Error> {
        let matched = self.matching_branches(pattern)?;
        if matched.is_empty() {
            return Err(Error::not_found(format!(
                "no worktree branches match '{pattern}'"
            )));
        }
        let mut results = Vec::with_capacity(matched.len());
        for branch in matched {
            let outcome = if delete_branch {
                self.delete(&branch, force).map(|_| ())
            } else {
                self.remove(&branch).map(|_| ())
            };
            match outcome {
                Ok(()) => results.push(BulkItemResult {
                    branch,
                    success: true,
                    error: None,
                }),
                Err(err) => {
                    tracing::warn!(branch = %branch, error = %err, "bulk item failed, continuing");
                    results.push(BulkItemResult {
                        branch,
                        success: false,
                        error: Some(err.to_string()),
                    });
                },
            }
        }
        Ok(results)
    }

    /// Branches with worktrees matching a glob pattern. Protected branches
    /// and the outermost checkout's branch never match, so bulk operations
    /// cannot pick up collateral.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Runtime`] when the VCS cannot be queried.
    pub fn matching_branches(&self, pat: &str) -> Result<Vec<String>, Error> {
        let current = self.git.current_branch()?;
        let branches: Vec<String> = self
            .git
            .worktree_list()?
            .into_iter()
            .filter(|e| e.path != self.ctx.outer_root)
            .filter_map(|e| e.branch)
            .filter(|b| !validate::is_protected(b, &self.config.protected_branches))
            .filter(|b| Some(b.as_str()) != current.as_deref())
            .collect();
        Ok(pattern::matching_branches(pat, &branches)
            .into_iter()
            .map(ToString::to_string)
            .collect())
    }

    /// List all worktrees with their stack state.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Runtime`] when the VCS or runtime cannot be
    /// queried.
    pub fn list(&self) -> Result<Vec<WorktreeStatus>, Error> {
        let mut out = Vec::new();
        for entry in self.git.worktree_list()? {
            if entry.path == self.ctx.outer_root {
                continue;
            }
            let Some(branch) = entry.branch else {
                continue;
            };
            out.push(self.status(&branch)?);
        }
        Ok(out)
    }

    /// Status of one worktree.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] when no worktree exists for the branch.
    pub fn status(&self, branch: &str) -> Result<WorktreeStatus, Error> {
        let entry = self.require_worktree(branch)?;
        let stack_name = self.config.stack_name(branch);
        let containers = self.runtime.containers_for_stack(&stack_name)?;
        let state = if containers.iter().any(crate::runtime::ContainerInfo::is_running) {
            WorktreeState::Running
        } else if containers.is_empty() {
            WorktreeState::Created
        } else {
            WorktreeState::Stopped
        };
        Ok(WorktreeStatus {
            branch: branch.to_string(),
            path: entry.path,
            head: entry.head,
            state,
            domain: format!("{stack_name}.localhost"),
            containers: containers
                .into_iter()
                .map(|c| ContainerSummary {
                    name: c.name,
                    state: c.state,
                    image: c.image,
                })
                .collect(),
        })
    }

    /// Drop stale checkout metadata.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Runtime`] on VCS failure.
    pub fn prune(&self) -> Result<(), Error> {
        self.git.worktree_prune()
    }

    fn require_worktree(&self, branch: &str) -> Result<crate::vcs::WorktreeEntry, Error> {
        self.git.find_worktree(branch)?.ok_or_else(|| {
            Error::not_found(format!(
                "worktree for branch '{branch}' (create it first)"
            ))
        })
    }
}

/// Reverse-order undo list for `create`.
struct Rollback<'a> {
    orchestrator: &'a WorktreeOrchestrator,
    branch: &'a str,
    path: &'a std::path::Path,
    branch_was_new: bool,
    worktree_added: bool,
    volumes_created: Vec<String>,
    armed: bool,
}

impl<'a> Rollback<'a> {
    fn new(
        orchestrator: &'a WorktreeOrchestrator,
        branch: &'a str,
        path: &'a std::path::Path,
        branch_was_new: bool,
    ) -> Self {
        Self {
            orchestrator,
            branch,
            path,
            branch_was_new,
            worktree_added: false,
            volumes_created: Vec::new(),
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }

    fn run(&mut self) {
        if !self.armed {
            return;
        }
        tracing::warn!(branch = self.branch, "creation failed, rolling back");
        for volume in self.volumes_created.iter().rev() {
            if let Err(err) = self.orchestrator.runtime.volume_remove(volume) {
                tracing::warn!(volume = %volume, error = %err, "rollback: volume removal failed");
            }
        }
        if self.worktree_added {
            if let Err(err) = self.orchestrator.git.worktree_remove(self.path, true) {
                tracing::warn!(error = %err, "rollback: worktree removal failed");
            }
            if self.branch_was_new {
                if let Err(err) = self.orchestrator.git.branch_delete(self.branch, true) {
                    tracing::warn!(error = %err, "rollback: branch deletion failed");
                }
            }
        }
        self.armed = false;
    }
}

/// Serializes commands targeting one branch: a process-wide wait set plus
/// an advisory file lock under the outermost `.dockertree/locks/`.
struct BranchLock {
    branch: String,
    _file: std::fs::File,
}

fn active_set() -> &'static (Mutex<HashSet<String>>, Condvar) {
    static ACTIVE: OnceLock<(Mutex<HashSet<String>>, Condvar)> = OnceLock::new();
    ACTIVE.get_or_init(|| (Mutex::new(HashSet::new()), Condvar::new()))
}

impl BranchLock {
    fn acquire(outer_root: &std::path::Path, branch: &str) -> Result<Self, Error> {
        let (set, condvar) = active_set();
        {
            let mut active = set
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            while active.contains(branch) {
                active = condvar
                    .wait(active)
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
            }
            active.insert(branch.to_string());
        }

        let lock_dir = outer_root.join(crate::config::DOCKERTREE_DIR).join("locks");
        let result = (|| {
            std::fs::create_dir_all(&lock_dir)
                .map_err(|e| Error::io(format!("failed to create {}", lock_dir.display()), e))?;
            let lock_path = lock_dir.join(format!("{}.lock", branch.replace('/', "-")));
            let file = std::fs::OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&lock_path)
                .map_err(|e| Error::io(format!("failed to open {}", lock_path.display()), e))?;
            FileExt::lock_exclusive(&file)
                .map_err(|e| Error::io(format!("failed to lock {}", lock_path.display()), e))?;
            Ok(file)
        })();

        match result {
            Ok(file) => Ok(Self {
                branch: branch.to_string(),
                _file: file,
            }),
            Err(err) => {
                Self::release(branch);
                Err(err)
            },
        }
    }

    fn release(branch: &str) {
        let (set, condvar) = active_set();
        let mut active = set
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        active.remove(branch);
        condvar.notify_all();
    }
}

impl Drop for BranchLock {
    fn drop(&mut self) {
        Self::release(&self.branch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_token_flips_once() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        assert!(token.check().is_ok());
        token.cancel();
        assert!(token.is_cancelled());
        assert_eq!(token.check().unwrap_err().code(), "cancelled");
    }

    #[test]
    fn branch_lock_serializes_within_the_process() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().to_path_buf();
        let first = BranchLock::acquire(&root, "feature-lock").unwrap();

        let root2 = root.clone();
        let handle = std::thread::spawn(move || {
            let _second = BranchLock::acquire(&root2, "feature-lock").unwrap();
            std::time::Instant::now()
        });
        std::thread::sleep(std::time::Duration::from_millis(80));
        let released_at = std::time::Instant::now();
        drop(first);
        let acquired_at = handle.join().unwrap();
        assert!(acquired_at >= released_at);
    }

    #[test]
    fn distinct_branches_do_not_contend() {
        let tmp = tempfile::tempdir().unwrap();
        let a = BranchLock::acquire(tmp.path(), "branch-a").unwrap();
        let b = BranchLock::acquire(tmp.path(), "branch-b").unwrap();
        drop(a);
        drop(b);
    }
}
