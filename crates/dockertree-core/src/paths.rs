//! Project root discovery and path helpers.
//!
//! Every worktree embeds a full `.dockertree/` (minus `worktrees/`), so the
//! resolver walks upward from the working directory and prefers the nearest
//! directory carrying `.dockertree/config.yml`. Inside a worktree that makes
//! the worktree itself the effective root (the fractal layout); config
//! writes still target the outermost project root.

use std::path::{Path, PathBuf};

use crate::config::{COMPOSE_WORKTREE_FILE, DOCKERTREE_DIR, ENV_FILE_NAME};
use crate::error::Error;

/// Where a command is executing relative to the project layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionContext {
    /// At (or under) the outermost project root.
    ProjectRoot,
    /// Inside a worktree with its own embedded `.dockertree/`.
    WorktreeLocal {
        /// Branch owning the worktree, derived from the directory name.
        branch: String,
    },
}

/// Resolved project layout for one CLI invocation.
#[derive(Debug, Clone)]
pub struct ProjectContext {
    /// Effective root for this invocation (worktree root in fractal mode).
    pub root: PathBuf,
    /// Outermost project root; differs from `root` in fractal mode.
    pub outer_root: PathBuf,
    /// Execution context classification.
    pub context: ExecutionContext,
}

impl ProjectContext {
    /// Discover the project layout starting from `cwd`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] when no `.dockertree/` exists anywhere on
    /// the path from `cwd` to the filesystem root.
    pub fn discover(cwd: &Path) -> Result<Self, Error> {
        let root = find_root(cwd).ok_or_else(|| {
            Error::not_found(format!(
                "no {DOCKERTREE_DIR}/config.yml found from {} upward (run 'setup' first)",
                cwd.display()
            ))
        })?;

        let outer_root = find_outer_root(&root);
        let context = if outer_root == root {
            ExecutionContext::ProjectRoot
        } else {
            let branch = root
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            ExecutionContext::WorktreeLocal { branch }
        };

        Ok(Self {
            root,
            outer_root,
            context,
        })
    }

    /// Root directory used for new worktree checkouts.
    #[must_use]
    pub fn worktree_dir(&self, configured: &str) -> PathBuf {
        self.outer_root.join(configured)
    }

    /// Checkout path for a branch under the configured worktree directory.
    #[must_use]
    pub fn worktree_path(&self, configured: &str, branch: &str) -> PathBuf {
        self.worktree_dir(configured).join(branch)
    }

    /// The `.dockertree/` directory under the effective root.
    #[must_use]
    pub fn dockertree_dir(&self) -> PathBuf {
        self.root.join(DOCKERTREE_DIR)
    }

    /// Path of the derived compose variant under a given root.
    #[must_use]
    pub fn compose_worktree_path(root: &Path) -> PathBuf {
        root.join(DOCKERTREE_DIR).join(COMPOSE_WORKTREE_FILE)
    }

    /// Path of the per-worktree env file under a worktree root.
    #[must_use]
    pub fn env_file_path(worktree_root: &Path) -> PathBuf {
        worktree_root.join(DOCKERTREE_DIR).join(ENV_FILE_NAME)
    }
}

/// Walk from `start` toward the filesystem root looking for a directory with
/// `.dockertree/config.yml`, preferring the nearest. Falls back to a bare
/// `.dockertree/` directory for legacy layouts.
fn find_root(start: &Path) -> Option<PathBuf> {
    let mut cursor = Some(start);
    while let Some(dir) = cursor {
        if dir.join(DOCKERTREE_DIR).join("config.yml").is_file() {
            return Some(dir.to_path_buf());
        }
        cursor = dir.parent();
    }
    // Legacy: a .dockertree directory without config.yml.
    let mut cursor = Some(start);
    while let Some(dir) = cursor {
        if dir.join(DOCKERTREE_DIR).is_dir() {
            return Some(dir.to_path_buf());
        }
        cursor = dir.parent();
    }
    None
}

/// Walk from `root`'s parent upward to find the outermost directory that
/// also carries `.dockertree/config.yml`. Returns `root` itself when none of
/// its ancestors do.
fn find_outer_root(root: &Path) -> PathBuf {
    let mut outer = root.to_path_buf();
    let mut cursor = root.parent();
    while let Some(dir) = cursor {
        if dir.join(DOCKERTREE_DIR).join("config.yml").is_file() {
            outer = dir.to_path_buf();
        }
        cursor = dir.parent();
    }
    outer
}

/// Recursively copy `.dockertree/` from `source_root` into `target_root`,
/// excluding the `worktrees/` subtree. Existing target content is preserved.
///
/// # Errors
///
/// Returns [`Error::Io`] on filesystem failure.
pub fn copy_dockertree_dir(source_root: &Path, target_root: &Path) -> Result<(), Error> {
    let source = source_root.join(DOCKERTREE_DIR);
    let target = target_root.join(DOCKERTREE_DIR);
    if !source.is_dir() {
        return Err(Error::not_found(format!(
            "source configuration directory {}",
            source.display()
        )));
    }
    copy_tree(&source, &target, true)
}

fn copy_tree(source: &Path, target: &Path, skip_worktrees: bool) -> Result<(), Error> {
    std::fs::create_dir_all(target)
        .map_err(|e| Error::io(format!("failed to create {}", target.display()), e))?;
    let entries = std::fs::read_dir(source)
        .map_err(|e| Error::io(format!("failed to read {}", source.display()), e))?;
    for entry in entries {
        let entry = entry.map_err(|e| Error::io("failed to read directory entry", e))?;
        let name = entry.file_name();
        if skip_worktrees && name == "worktrees" {
            continue;
        }
        let from = entry.path();
        let to = target.join(&name);
        let file_type = entry
            .file_type()
            .map_err(|e| Error::io(format!("failed to stat {}", from.display()), e))?;
        if file_type.is_dir() {
            copy_tree(&from, &to, false)?;
        } else if !to.exists() {
            std::fs::copy(&from, &to)
                .map_err(|e| Error::io(format!("failed to copy {}", from.display()), e))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_project(dir: &Path) {
        std::fs::create_dir_all(dir.join(DOCKERTREE_DIR)).unwrap();
        std::fs::write(
            dir.join(DOCKERTREE_DIR).join("config.yml"),
            "project_name: demo\n",
        )
        .unwrap();
    }

    #[test]
    fn discovers_root_from_nested_directory() {
        let tmp = tempfile::tempdir().unwrap();
        make_project(tmp.path());
        let nested = tmp.path().join("src/app");
        std::fs::create_dir_all(&nested).unwrap();

        let ctx = ProjectContext::discover(&nested).unwrap();
        assert_eq!(ctx.root, tmp.path());
        assert_eq!(ctx.context, ExecutionContext::ProjectRoot);
    }

    #[test]
    fn prefers_worktree_local_config() {
        let tmp = tempfile::tempdir().unwrap();
        make_project(tmp.path());
        let worktree = tmp.path().join("worktrees/feature-auth");
        make_project(&worktree);

        let ctx = ProjectContext::discover(&worktree).unwrap();
        assert_eq!(ctx.root, worktree);
        assert_eq!(ctx.outer_root, tmp.path());
        assert_eq!(
            ctx.context,
            ExecutionContext::WorktreeLocal {
                branch: "feature-auth".to_string()
            }
        );
    }

    #[test]
    fn missing_project_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let err = ProjectContext::discover(tmp.path()).unwrap_err();
        assert_eq!(err.code(), "not_found");
    }

    #[test]
    fn fractal_copy_excludes_worktrees() {
        let tmp = tempfile::tempdir().unwrap();
        make_project(tmp.path());
        let dt = tmp.path().join(DOCKERTREE_DIR);
        std::fs::write(dt.join("docker-compose.worktree.yml"), "services: {}\n").unwrap();
        std::fs::create_dir_all(dt.join("worktrees/old")).unwrap();
        std::fs::write(dt.join("worktrees/old/marker"), "x").unwrap();

        let target = tmp.path().join("worktrees/feature-auth");
        std::fs::create_dir_all(&target).unwrap();
        copy_dockertree_dir(tmp.path(), &target).unwrap();

        let copied = target.join(DOCKERTREE_DIR);
        assert!(copied.join("config.yml").is_file());
        assert!(copied.join("docker-compose.worktree.yml").is_file());
        assert!(!copied.join("worktrees").exists());
    }
}
