//! Project configuration (`.dockertree/config.yml`) and derived identifiers.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Name of the configuration directory inside a project root.
pub const DOCKERTREE_DIR: &str = ".dockertree";

/// Default external network shared by the proxy and all web-class services.
pub const DEFAULT_CADDY_NETWORK: &str = "dockertree_caddy_proxy";

/// Default directory (relative to the project root) holding worktrees.
pub const DEFAULT_WORKTREE_DIR: &str = "worktrees";

/// File name of the derived compose variant.
pub const COMPOSE_WORKTREE_FILE: &str = "docker-compose.worktree.yml";

/// File name of the per-worktree environment file.
pub const ENV_FILE_NAME: &str = "env.dockertree";

/// Per-service settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceConfig {
    /// Template for the container name, e.g. `${COMPOSE_PROJECT_NAME}-web`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_name_template: Option<String>,
}

/// VPC deployment options.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VpcConfig {
    /// Publish central db/cache ports for worker access.
    #[serde(default)]
    pub auto_bind_ports: bool,
    /// Bind published ports to the VPC private IP instead of 0.0.0.0.
    #[serde(default)]
    pub bind_to_private_ip: bool,
    /// Add firewall rules restricting ingress to the VPC range.
    #[serde(default)]
    pub auto_configure_firewall: bool,
}

/// Default deployment targets for the push pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeploymentConfig {
    /// Default push target server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_server: Option<String>,
    /// Default deployment domain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_domain: Option<String>,
    /// Default deployment IP.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_ip: Option<String>,
    /// SSH identity file for push transport.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_key: Option<String>,
}

/// DNS provider settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DnsConfig {
    /// Provider name (`digitalocean`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// API token; environment variables take precedence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_token: Option<String>,
    /// Root domain for subdomain records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_domain: Option<String>,
}

/// Project configuration loaded from `.dockertree/config.yml`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectConfig {
    /// Short project slug; prefixes every runtime object.
    pub project_name: String,

    /// Directory (relative to the project root) holding worktrees.
    #[serde(default = "default_worktree_dir")]
    pub worktree_dir: String,

    /// Name of the external proxy network.
    #[serde(default = "default_caddy_network")]
    pub caddy_network: String,

    /// Per-service settings keyed by compose service name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub services: BTreeMap<String, ServiceConfig>,

    /// Declared named volumes to isolate per branch, in order.
    #[serde(default)]
    pub volumes: Vec<String>,

    /// Static environment overrides written into every worktree env file.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,

    /// Branches that `delete` refuses without force. Empty means the
    /// built-in default set.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub protected_branches: Vec<String>,

    /// VPC deployment options.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vpc: Option<VpcConfig>,

    /// Default deployment settings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment: Option<DeploymentConfig>,

    /// DNS provider settings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns: Option<DnsConfig>,
}

fn default_worktree_dir() -> String {
    DEFAULT_WORKTREE_DIR.to_string()
}

fn default_caddy_network() -> String {
    DEFAULT_CADDY_NETWORK.to_string()
}

impl ProjectConfig {
    /// Build a default configuration for a freshly initialized project.
    #[must_use]
    pub fn new(project_name: impl Into<String>) -> Self {
        Self {
            project_name: sanitize_project_name(&project_name.into()),
            worktree_dir: default_worktree_dir(),
            caddy_network: default_caddy_network(),
            services: BTreeMap::new(),
            volumes: Vec::new(),
            environment: BTreeMap::new(),
            protected_branches: Vec::new(),
            vpc: None,
            deployment: None,
            dns: None,
        }
    }

    /// Load configuration from `<project_root>/.dockertree/config.yml`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] when the file is absent and
    /// [`Error::Transform`] when it cannot be parsed.
    pub fn load(project_root: &Path) -> Result<Self, Error> {
        let path = Self::path(project_root);
        if !path.exists() {
            return Err(Error::not_found(format!(
                "project config at {}",
                path.display()
            )));
        }
        let raw = std::fs::read_to_string(&path)
            .map_err(|e| Error::io(format!("failed to read {}", path.display()), e))?;
        let config: Self = serde_yaml::from_str(&raw)?;
        Ok(config)
    }

    /// Write configuration to `<project_root>/.dockertree/config.yml`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] on filesystem failure.
    pub fn store(&self, project_root: &Path) -> Result<(), Error> {
        let path = Self::path(project_root);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::io(format!("failed to create {}", parent.display()), e))?;
        }
        let raw = serde_yaml::to_string(self)?;
        std::fs::write(&path, raw)
            .map_err(|e| Error::io(format!("failed to write {}", path.display()), e))
    }

    /// Path of the config file under a project root.
    #[must_use]
    pub fn path(project_root: &Path) -> PathBuf {
        project_root.join(DOCKERTREE_DIR).join("config.yml")
    }

    /// Sanitized project slug.
    #[must_use]
    pub fn slug(&self) -> String {
        sanitize_project_name(&self.project_name)
    }

    /// The declarative-stack project identifier for a branch.
    #[must_use]
    pub fn stack_name(&self, branch: &str) -> String {
        stack_name(&self.project_name, branch)
    }

    /// The isolated volume name for a declared volume under a branch.
    #[must_use]
    pub fn volume_name(&self, branch: &str, volume: &str) -> String {
        format!("{}_{volume}", self.stack_name(branch))
    }

    /// All isolated volume names for a branch, in declaration order.
    #[must_use]
    pub fn volume_names(&self, branch: &str) -> Vec<String> {
        self.volumes
            .iter()
            .map(|v| self.volume_name(branch, v))
            .collect()
    }

    /// Source (non-worktree) name for a declared volume.
    #[must_use]
    pub fn source_volume_name(&self, volume: &str) -> String {
        format!("{}_{volume}", self.slug())
    }

    /// Returns `true` when a declared volume hosts a relational database and
    /// must not be file-copied while its producer is live.
    #[must_use]
    pub fn requires_live_snapshot(&self, volume: &str) -> bool {
        let lower = volume.to_lowercase();
        (lower.contains("postgres") || lower.contains("mysql") || lower.contains("mariadb"))
            && lower.contains("data")
    }
}

/// Sanitize a name for use in runtime object names: underscores and invalid
/// characters become hyphens, the result is trimmed and lowercased.
#[must_use]
pub fn sanitize_project_name(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    while out.starts_with('-') {
        out.remove(0);
    }
    while out.ends_with('-') {
        out.pop();
    }
    out
}

/// Compute the stack name (`project-branch`) for a branch. Slashes in branch
/// names map to hyphens so the result stays hostname-safe.
#[must_use]
pub fn stack_name(project_name: &str, branch: &str) -> String {
    let branch = branch.replace(['/', '_'], "-");
    format!("{}-{branch}", sanitize_project_name(project_name))
}

/// Path of the optional global per-user config file
/// (`~/.dockertree/env.dockertree`), used for provider tokens and default
/// deployment settings.
#[must_use]
pub fn global_config_path() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| {
        PathBuf::from(home)
            .join(DOCKERTREE_DIR)
            .join(ENV_FILE_NAME)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_collapses_to_hostname_safe_slug() {
        assert_eq!(sanitize_project_name("My_App"), "my-app");
        assert_eq!(sanitize_project_name("--app--"), "app");
        assert_eq!(sanitize_project_name("app.2"), "app-2");
    }

    #[test]
    fn stack_names_prefix_every_object() {
        assert_eq!(stack_name("myapp", "feature-auth"), "myapp-feature-auth");
        assert_eq!(stack_name("My_App", "fix/login"), "my-app-fix-login");
    }

    #[test]
    fn roundtrips_through_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ProjectConfig::new("myapp");
        config.volumes = vec!["postgres_data".into(), "redis_data".into()];
        config
            .environment
            .insert("DEBUG".into(), "True".into());
        config.store(dir.path()).unwrap();

        let loaded = ProjectConfig::load(dir.path()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn missing_config_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = ProjectConfig::load(dir.path()).unwrap_err();
        assert_eq!(err.code(), "not_found");
    }

    #[test]
    fn defaults_fill_absent_keys() {
        let config: ProjectConfig = serde_yaml::from_str("project_name: demo\n").unwrap();
        assert_eq!(config.worktree_dir, "worktrees");
        assert_eq!(config.caddy_network, DEFAULT_CADDY_NETWORK);
        assert!(config.volumes.is_empty());
    }

    #[test]
    fn database_volumes_are_tagged_for_live_snapshot() {
        let config = ProjectConfig::new("myapp");
        assert!(config.requires_live_snapshot("postgres_data"));
        assert!(config.requires_live_snapshot("mysql_data"));
        assert!(!config.requires_live_snapshot("redis_data"));
        assert!(!config.requires_live_snapshot("media_files"));
    }

    #[test]
    fn volume_names_are_stack_prefixed() {
        let mut config = ProjectConfig::new("myapp");
        config.volumes = vec!["postgres_data".into()];
        assert_eq!(
            config.volume_names("feature-auth"),
            vec!["myapp-feature-auth_postgres_data"]
        );
        assert_eq!(config.source_volume_name("postgres_data"), "myapp_postgres_data");
    }
}
