//! Typed adapter over the version-control system's multi-checkout feature.
//!
//! The only module that invokes `git`. Invocations are non-interactive:
//! prompts are disabled and system configuration is not read.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use crate::error::Error;
use crate::runtime::run_bounded;

const GIT_TIMEOUT: Duration = Duration::from_secs(120);

/// One entry from `git worktree list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeEntry {
    /// Checkout path.
    pub path: PathBuf,
    /// HEAD commit.
    pub head: String,
    /// Branch name, absent for detached checkouts.
    pub branch: Option<String>,
}

/// Typed wrapper over git invocations, rooted at one repository.
#[derive(Debug, Clone)]
pub struct GitAdapter {
    repo_root: PathBuf,
}

impl GitAdapter {
    /// Create an adapter rooted at `repo_root`.
    #[must_use]
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
        }
    }

    /// Returns `true` if `path` is the top level of a git repository.
    #[must_use]
    pub fn is_repo_root(path: &Path) -> bool {
        path.join(".git").exists()
    }

    /// Current branch name, when HEAD is on a branch.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Runtime`] on git failure.
    pub fn current_branch(&self) -> Result<Option<String>, Error> {
        let stdout = self.git(&["branch", "--show-current"])?;
        let name = stdout.trim();
        Ok(if name.is_empty() {
            None
        } else {
            Some(name.to_string())
        })
    }

    /// Returns `true` if a local branch exists.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Runtime`] when git fails for a reason other than
    /// the ref being absent.
    pub fn branch_exists(&self, branch: &str) -> Result<bool, Error> {
        let mut cmd = Command::new("git");
        cmd.env("GIT_TERMINAL_PROMPT", "0");
        cmd.current_dir(&self.repo_root);
        cmd.args(["show-ref", "--verify", "--quiet"]);
        cmd.arg(format!("refs/heads/{branch}"));
        let output = run_bounded(&mut cmd, GIT_TIMEOUT, "git show-ref")?;
        Ok(output.success)
    }

    /// All local branch names.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Runtime`] on git failure.
    pub fn list_branches(&self) -> Result<Vec<String>, Error> {
        let stdout = self.git(&["for-each-ref", "--format=%(refname:short)", "refs/heads"])?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(ToString::to_string)
            .collect())
    }

    /// Create a checkout at `path` for `branch`, creating the branch from
    /// HEAD when it does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyExists`] when the branch is already checked
    /// out elsewhere, and [`Error::Runtime`] for other git failures.
    pub fn worktree_add(&self, branch: &str, path: &Path) -> Result<(), Error> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::io(format!("failed to create {}", parent.display()), e))?;
        }
        let path_str = path.to_string_lossy();
        let result = if self.branch_exists(branch)? {
            self.git(&["worktree", "add", path_str.as_ref(), branch])
        } else {
            self.git(&["worktree", "add", "-b", branch, path_str.as_ref()])
        };
        match result {
            Ok(_) => Ok(()),
            Err(Error::Runtime { stderr, .. }) if stderr.contains("already checked out") => {
                Err(Error::already_exists(format!(
                    "branch '{branch}' is already checked out in another worktree"
                )))
            },
            Err(e) => Err(e),
        }
    }

    /// Remove the checkout at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Runtime`] on git failure.
    pub fn worktree_remove(&self, path: &Path, force: bool) -> Result<(), Error> {
        let path_str = path.to_string_lossy();
        let mut args = vec!["worktree", "remove"];
        if force {
            args.push("--force");
        }
        args.push(path_str.as_ref());
        self.git(&args).map(|_| ())
    }

    /// List all checkouts of the repository.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Runtime`] on git failure.
    pub fn worktree_list(&self) -> Result<Vec<WorktreeEntry>, Error> {
        let stdout = self.git(&["worktree", "list", "--porcelain"])?;
        Ok(parse_worktree_porcelain(&stdout))
    }

    /// Drop stale checkout administrative data.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Runtime`] on git failure.
    pub fn worktree_prune(&self) -> Result<(), Error> {
        self.git(&["worktree", "prune"]).map(|_| ())
    }

    /// Find the checkout path for a branch, if one exists.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Runtime`] on git failure.
    pub fn find_worktree(&self, branch: &str) -> Result<Option<WorktreeEntry>, Error> {
        Ok(self
            .worktree_list()?
            .into_iter()
            .find(|e| e.branch.as_deref() == Some(branch)))
    }

    /// Delete a local branch.
    ///
    /// In safe mode (`force == false`) git refuses branches with unmerged
    /// commits; that refusal surfaces as [`Error::Validation`] so callers
    /// can prompt for an explicit override.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for unmerged branches in safe mode and
    /// [`Error::Runtime`] for other git failures.
    pub fn branch_delete(&self, branch: &str, force: bool) -> Result<(), Error> {
        let flag = if force { "-D" } else { "-d" };
        match self.git(&["branch", flag, branch]) {
            Ok(_) => Ok(()),
            Err(Error::Runtime { stderr, .. }) if stderr.contains("not fully merged") => {
                Err(Error::validation(format!(
                    "branch '{branch}' has unmerged commits (use --force to delete anyway)"
                )))
            },
            Err(e) => Err(e),
        }
    }

    /// Produce a reproducible tar archive of a branch's tree.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Runtime`] on git failure.
    pub fn archive(&self, branch: &str, out_path: &Path) -> Result<(), Error> {
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::io(format!("failed to create {}", parent.display()), e))?;
        }
        let out = out_path.to_string_lossy();
        self.git(&["archive", "--format=tar", "-o", out.as_ref(), branch])
            .map(|_| ())
    }

    /// HEAD commit of a branch.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Runtime`] on git failure.
    pub fn rev_parse(&self, branch: &str) -> Result<String, Error> {
        Ok(self.git(&["rev-parse", branch])?.trim().to_string())
    }

    /// Initialize a fresh repository at the adapter root and commit its
    /// current contents. Used by standalone package imports; the commit
    /// carries a tool identity so unconfigured servers work.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Runtime`] on git failure.
    pub fn init_with_commit(&self, message: &str) -> Result<(), Error> {
        self.git(&["init"])?;
        self.git(&["add", "-A"])?;
        self.git(&[
            "-c",
            "user.email=dockertree@local",
            "-c",
            "user.name=dockertree",
            "commit",
            "-m",
            message,
        ])
        .map(|_| ())
    }

    fn git(&self, args: &[&str]) -> Result<String, Error> {
        let mut cmd = Command::new("git");
        cmd.env("GIT_TERMINAL_PROMPT", "0");
        cmd.current_dir(&self.repo_root);
        cmd.args(args);
        let operation = format!("git {}", args.first().copied().unwrap_or_default());
        let output = run_bounded(&mut cmd, GIT_TIMEOUT, &operation)?;
        if output.success {
            Ok(output.stdout)
        } else {
            Err(Error::Runtime {
                tool: "git".to_string(),
                exit_code: output.exit_code,
                stderr: output.stderr_tail(),
            })
        }
    }
}

fn parse_worktree_porcelain(stdout: &str) -> Vec<WorktreeEntry> {
    let mut entries = Vec::new();
    let mut path: Option<PathBuf> = None;
    let mut head = String::new();
    let mut branch: Option<String> = None;
    for line in stdout.lines().chain(std::iter::once("")) {
        if line.is_empty() {
            if let Some(p) = path.take() {
                entries.push(WorktreeEntry {
                    path: p,
                    head: std::mem::take(&mut head),
                    branch: branch.take(),
                });
            }
            continue;
        }
        if let Some(rest) = line.strip_prefix("worktree ") {
            path = Some(PathBuf::from(rest));
        } else if let Some(rest) = line.strip_prefix("HEAD ") {
            head = rest.to_string();
        } else if let Some(rest) = line.strip_prefix("branch ") {
            branch = Some(
                rest.trim_start_matches("refs/heads/")
                    .to_string(),
            );
        }
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn porcelain_parsing_handles_main_and_worktrees() {
        let raw = "worktree /repo\nHEAD 1111111111111111111111111111111111111111\nbranch refs/heads/main\n\nworktree /repo/worktrees/feature-auth\nHEAD 2222222222222222222222222222222222222222\nbranch refs/heads/feature-auth\n\nworktree /repo/worktrees/detached\nHEAD 3333333333333333333333333333333333333333\ndetached\n\n";
        let entries = parse_worktree_porcelain(raw);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].branch.as_deref(), Some("main"));
        assert_eq!(
            entries[1].path,
            PathBuf::from("/repo/worktrees/feature-auth")
        );
        assert_eq!(entries[1].branch.as_deref(), Some("feature-auth"));
        assert!(entries[2].branch.is_none());
    }

    #[test]
    fn repo_root_detection() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(!GitAdapter::is_repo_root(tmp.path()));
        std::fs::create_dir(tmp.path().join(".git")).unwrap();
        assert!(GitAdapter::is_repo_root(tmp.path()));
    }
}
