//! Project initialization: `.dockertree/` scaffolding.
//!
//! `setup` derives the worktree compose variant from the project's stack
//! file (writing a minimal skeleton when none exists), authors
//! `config.yml`, and drops the proxy template and an agent-facing README
//! into `.dockertree/`. Re-running reports existing state and refuses to
//! overwrite unless forced.

use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_yaml::Value;

use crate::config::{ProjectConfig, COMPOSE_WORKTREE_FILE, DOCKERTREE_DIR};
use crate::error::Error;
use crate::transform::{find_source_compose, ComposeTransformer};
use crate::vcs::GitAdapter;

/// Minimal stack skeleton written when the project has no compose file.
const MINIMAL_COMPOSE: &str = r#"services:
  web:
    build: .
    ports:
      - "8000:8000"
    depends_on:
      - db
      - redis
  db:
    image: postgres:16
    environment:
      POSTGRES_USER: ${POSTGRES_USER:-postgres}
      POSTGRES_PASSWORD: ${POSTGRES_PASSWORD:-postgres}
      POSTGRES_DB: ${POSTGRES_DB:-app}
    volumes:
      - postgres_data:/var/lib/postgresql/data
  redis:
    image: redis:7
    volumes:
      - redis_data:/data

volumes:
  postgres_data:
  redis_data:
"#;

/// Proxy configuration template dropped into `.dockertree/`.
const CADDYFILE_TEMPLATE: &str = r#"# dockertree global proxy template
#
# The proxy is configured at runtime through its admin API; this file
# documents the static fallback used when the API is unavailable.
{
    admin 0.0.0.0:2019
}

*.localhost {
    respond "dockertree proxy is running, no worktree matches this host" 200
}
"#;

const README: &str = r#"# .dockertree/

Per-branch isolated development environments.

- `config.yml` - project configuration (committed).
- `docker-compose.worktree.yml` - derived compose variant used for every
  worktree stack (committed). The project's own compose file is never
  modified.
- `env.dockertree` - generated per-worktree environment (not committed).
- `Caddyfile.dockertree` - proxy configuration template.

Common commands:

    dockertree create <branch>     # new isolated environment
    dockertree <branch> up -d      # start it
    dockertree list                # see what exists
    dockertree remove <branch>     # tear it down, keep the branch

Every worktree embeds a copy of this directory, so the CLI also works from
inside `worktrees/<branch>/`.
"#;

/// Result of a setup run.
#[derive(Debug, Clone, Serialize)]
pub struct SetupReport {
    /// Project root that was initialized.
    pub project_root: PathBuf,
    /// Resolved project name.
    pub project_name: String,
    /// Compose file the variant was derived from.
    pub compose_source: PathBuf,
    /// Whether a minimal compose skeleton was written.
    pub created_minimal_compose: bool,
    /// Whether existing state was found and left untouched.
    pub already_initialized: bool,
}

/// Initializes `.dockertree/` for a project.
pub struct SetupManager {
    project_root: PathBuf,
}

impl SetupManager {
    /// Build a setup manager for a project root.
    #[must_use]
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
        }
    }

    /// Returns `true` when the project is already initialized.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        ProjectConfig::path(&self.project_root).is_file()
    }

    /// Run setup.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyExists`] when initialized and not forced,
    /// [`Error::Transform`] when the stack file cannot be rewritten.
    pub fn run(&self, project_name: Option<&str>, force: bool) -> Result<SetupReport, Error> {
        if self.is_initialized() && !force {
            let config = ProjectConfig::load(&self.project_root)?;
            tracing::info!(
                project = %config.project_name,
                "project already initialized; use --force to regenerate"
            );
            return Ok(SetupReport {
                project_root: self.project_root.clone(),
                project_name: config.project_name,
                compose_source: find_source_compose(&self.project_root).unwrap_or_default(),
                created_minimal_compose: false,
                already_initialized: true,
            });
        }

        if !GitAdapter::is_repo_root(&self.project_root) {
            tracing::warn!(
                root = %self.project_root.display(),
                "project root is not a git repository; worktree commands will fail until it is"
            );
        }

        let dockertree_dir = self.project_root.join(DOCKERTREE_DIR);
        std::fs::create_dir_all(&dockertree_dir)
            .map_err(|e| Error::io(format!("failed to create {}", dockertree_dir.display()), e))?;

        // Locate or synthesize the stack description.
        let (compose_source, created_minimal) = match find_source_compose(&self.project_root) {
            Some(path) => (path, false),
            None => {
                let path = self.project_root.join("docker-compose.yml");
                tracing::info!("no compose file found, writing a minimal skeleton");
                std::fs::write(&path, MINIMAL_COMPOSE)
                    .map_err(|e| Error::io(format!("failed to write {}", path.display()), e))?;
                (path, true)
            },
        };

        // Author config.yml, declaring the stack file's named volumes
        // explicitly so per-branch isolation is opt-out rather than
        // inferred later.
        let name = project_name
            .map(ToString::to_string)
            .or_else(|| {
                self.project_root
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
            })
            .ok_or_else(|| Error::validation("cannot derive a project name"))?;
        let mut config = ProjectConfig::new(&name);
        config.volumes = declared_volumes(&compose_source)?;
        config.store(&self.project_root)?;

        // Derive the worktree compose variant.
        let transformer = ComposeTransformer::new(&config);
        transformer.transform_file(&compose_source, &dockertree_dir.join(COMPOSE_WORKTREE_FILE))?;

        // Proxy template and agent-facing README.
        write_if_absent(&dockertree_dir.join("Caddyfile.dockertree"), CADDYFILE_TEMPLATE)?;
        write_if_absent(&dockertree_dir.join("README.md"), README)?;

        self.update_gitignore()?;

        tracing::info!(project = %config.project_name, "project initialized");
        Ok(SetupReport {
            project_root: self.project_root.clone(),
            project_name: config.project_name,
            compose_source,
            created_minimal_compose: created_minimal,
            already_initialized: false,
        })
    }

    /// Regenerate the compose variant from the current stack file,
    /// dropping any legacy per-worktree proxy services that older
    /// releases injected.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] when the project is not initialized.
    pub fn clean_legacy(&self) -> Result<(), Error> {
        let config = ProjectConfig::load(&self.project_root)?;
        let source = find_source_compose(&self.project_root).ok_or_else(|| {
            Error::not_found("compose file to regenerate the worktree variant from")
        })?;
        let transformer = ComposeTransformer::new(&config);
        let target = self
            .project_root
            .join(DOCKERTREE_DIR)
            .join(COMPOSE_WORKTREE_FILE);
        transformer.transform_file(&source, &target)?;
        tracing::info!("worktree compose variant regenerated");
        Ok(())
    }

    fn update_gitignore(&self) -> Result<(), Error> {
        let path = self.project_root.join(".gitignore");
        let wanted = ["worktrees/", ".dockertree/env.dockertree", ".dockertree/locks/"];
        let current = std::fs::read_to_string(&path).unwrap_or_default();
        let missing: Vec<&str> = wanted
            .iter()
            .filter(|w| !current.lines().any(|l| l.trim() == **w))
            .copied()
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        let mut updated = current;
        if !updated.is_empty() && !updated.ends_with('\n') {
            updated.push('\n');
        }
        updated.push_str("\n# dockertree\n");
        for entry in missing {
            updated.push_str(entry);
            updated.push('\n');
        }
        std::fs::write(&path, updated)
            .map_err(|e| Error::io(format!("failed to write {}", path.display()), e))
    }
}

/// Named volumes declared at the top level of a compose file, excluding
/// the shared proxy volumes.
fn declared_volumes(compose_path: &Path) -> Result<Vec<String>, Error> {
    let raw = std::fs::read_to_string(compose_path)
        .map_err(|e| Error::io(format!("failed to read {}", compose_path.display()), e))?;
    let doc: Value = serde_yaml::from_str(&raw)?;
    let mut volumes = Vec::new();
    if let Some(Value::Mapping(map)) = doc.get("volumes") {
        for key in map.keys() {
            if let Some(name) = key.as_str() {
                if name != "caddy_data" && name != "caddy_config" {
                    volumes.push(name.to_string());
                }
            }
        }
    }
    Ok(volumes)
}

fn write_if_absent(path: &Path, content: &str) -> Result<(), Error> {
    if path.exists() {
        return Ok(());
    }
    std::fs::write(path, content)
        .map_err(|e| Error::io(format!("failed to write {}", path.display()), e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initializes_an_empty_project_with_a_skeleton() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SetupManager::new(dir.path());
        let report = manager.run(Some("myapp"), false).unwrap();

        assert!(report.created_minimal_compose);
        assert!(!report.already_initialized);
        assert!(dir.path().join("docker-compose.yml").is_file());
        assert!(dir.path().join(".dockertree/config.yml").is_file());
        assert!(dir
            .path()
            .join(".dockertree/docker-compose.worktree.yml")
            .is_file());
        assert!(dir.path().join(".dockertree/README.md").is_file());

        let config = ProjectConfig::load(dir.path()).unwrap();
        assert_eq!(config.project_name, "myapp");
        assert_eq!(config.volumes, vec!["postgres_data", "redis_data"]);
    }

    #[test]
    fn rerunning_setup_reports_existing_state() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SetupManager::new(dir.path());
        manager.run(Some("myapp"), false).unwrap();

        let report = manager.run(Some("other"), false).unwrap();
        assert!(report.already_initialized);
        // The original name survives the refused overwrite.
        assert_eq!(report.project_name, "myapp");
    }

    #[test]
    fn force_regenerates_the_config() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SetupManager::new(dir.path());
        manager.run(Some("myapp"), false).unwrap();
        let report = manager.run(Some("renamed"), true).unwrap();
        assert!(!report.already_initialized);
        assert_eq!(report.project_name, "renamed");
    }

    #[test]
    fn existing_compose_is_used_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("docker-compose.yml"),
            "services:\n  api:\n    image: nginx\nvolumes:\n  media_files:\n",
        )
        .unwrap();
        let manager = SetupManager::new(dir.path());
        let report = manager.run(Some("myapp"), false).unwrap();
        assert!(!report.created_minimal_compose);
        let config = ProjectConfig::load(dir.path()).unwrap();
        assert_eq!(config.volumes, vec!["media_files"]);
    }

    #[test]
    fn gitignore_entries_are_added_once() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SetupManager::new(dir.path());
        manager.run(Some("myapp"), false).unwrap();
        manager.run(Some("myapp"), true).unwrap();
        let gitignore = std::fs::read_to_string(dir.path().join(".gitignore")).unwrap();
        assert_eq!(gitignore.matches("worktrees/").count(), 1);
    }
}
