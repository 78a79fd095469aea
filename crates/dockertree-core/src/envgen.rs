//! Per-worktree environment file generation and host-port allocation.
//!
//! `env.dockertree` is a line-oriented `KEY=VALUE` file. The codec preserves
//! comments and ordering so push-state updates do not reshuffle the file.

use std::collections::BTreeSet;
use std::path::Path;

use crate::config::ProjectConfig;
use crate::error::Error;

/// Host-port ranges for the three well-known service classes. The ranges
/// are disjoint so a port number identifies its class.
pub const DB_PORT_RANGE: std::ops::Range<u16> = 55000..56000;
/// Cache (redis) host-port range.
pub const REDIS_PORT_RANGE: std::ops::Range<u16> = 56000..57000;
/// Web host-port range.
pub const WEB_PORT_RANGE: std::ops::Range<u16> = 57000..58000;

/// The three debug host ports allocated to one worktree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortTriple {
    /// Database host port.
    pub db: u16,
    /// Cache host port.
    pub redis: u16,
    /// Web host port.
    pub web: u16,
}

/// One line of an env file.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Line {
    /// Comment or blank line, kept verbatim.
    Raw(String),
    /// `KEY=VALUE` pair.
    Pair { key: String, value: String },
}

/// A parsed `env.dockertree` file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvFile {
    lines: Vec<Line>,
}

impl EnvFile {
    /// Parse env-file text.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        let lines = text
            .lines()
            .map(|line| {
                let trimmed = line.trim_start();
                if trimmed.is_empty() || trimmed.starts_with('#') {
                    return Line::Raw(line.to_string());
                }
                match line.split_once('=') {
                    Some((key, value)) => Line::Pair {
                        key: key.trim().to_string(),
                        value: value.to_string(),
                    },
                    None => Line::Raw(line.to_string()),
                }
            })
            .collect();
        Self { lines }
    }

    /// Load an env file from disk.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] when the file cannot be read.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::io(format!("failed to read {}", path.display()), e))?;
        Ok(Self::parse(&text))
    }

    /// Serialize back to env-file text.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            match line {
                Line::Raw(raw) => out.push_str(raw),
                Line::Pair { key, value } => {
                    out.push_str(key);
                    out.push('=');
                    out.push_str(value);
                },
            }
            out.push('\n');
        }
        out
    }

    /// Write the file to disk, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] on filesystem failure.
    pub fn store(&self, path: &Path) -> Result<(), Error> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::io(format!("failed to create {}", parent.display()), e))?;
        }
        std::fs::write(path, self.render())
            .map_err(|e| Error::io(format!("failed to write {}", path.display()), e))
    }

    /// Value of a key, if present.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.lines.iter().rev().find_map(|line| match line {
            Line::Pair { key: k, value } if k == key => Some(value.as_str()),
            _ => None,
        })
    }

    /// Set a key, replacing the existing pair in place or appending.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        for line in &mut self.lines {
            if let Line::Pair { key: k, value: v } = line {
                if *k == key {
                    *v = value;
                    return;
                }
            }
        }
        self.lines.push(Line::Pair { key, value });
    }

    /// Remove a key. Returns `true` if it was present.
    pub fn remove(&mut self, key: &str) -> bool {
        let before = self.lines.len();
        self.lines
            .retain(|line| !matches!(line, Line::Pair { key: k, .. } if k == key));
        self.lines.len() != before
    }

    /// Append a comment line.
    pub fn push_comment(&mut self, text: &str) {
        self.lines.push(Line::Raw(format!("# {text}")));
    }

    /// All key/value pairs in order.
    #[must_use]
    pub fn pairs(&self) -> Vec<(&str, &str)> {
        self.lines
            .iter()
            .filter_map(|line| match line {
                Line::Pair { key, value } => Some((key.as_str(), value.as_str())),
                _ => None,
            })
            .collect()
    }
}

/// Allocate a host-port triple disjoint from every port in `used`.
///
/// Allocation scans each class range from its start, so triples are
/// deterministic given the set of existing worktrees.
///
/// # Errors
///
/// Returns [`Error::PreconditionFailed`] when a range is exhausted.
pub fn allocate_triple(used: &BTreeSet<u16>) -> Result<PortTriple, Error> {
    let pick = |range: std::ops::Range<u16>, class: &str| {
        range
            .clone()
            .find(|p| !used.contains(p))
            .ok_or_else(|| {
                Error::precondition(format!(
                    "no free {class} host port left in {}..{}",
                    range.start, range.end
                ))
            })
    };
    Ok(PortTriple {
        db: pick(DB_PORT_RANGE, "database")?,
        redis: pick(REDIS_PORT_RANGE, "cache")?,
        web: pick(WEB_PORT_RANGE, "web")?,
    })
}

/// Collect every host port already claimed by existing worktree env files.
///
/// Unreadable or legacy env files (without triples) contribute nothing;
/// the runtime falls back to port 0 for those worktrees.
#[must_use]
pub fn used_ports(env_files: &[std::path::PathBuf]) -> BTreeSet<u16> {
    let mut used = BTreeSet::new();
    for path in env_files {
        let Ok(env) = EnvFile::load(path) else {
            continue;
        };
        for key in [
            "DOCKERTREE_DB_HOST_PORT",
            "DOCKERTREE_REDIS_HOST_PORT",
            "DOCKERTREE_WEB_HOST_PORT",
        ] {
            if let Some(port) = env.get(key).and_then(|v| v.trim().parse::<u16>().ok()) {
                used.insert(port);
            }
        }
    }
    used
}

/// Compute `VITE_ALLOWED_HOSTS` for a host: the host itself, its wildcard
/// parent, and the local loopback names.
#[must_use]
pub fn vite_allowed_hosts(host: &str) -> String {
    let parent = host
        .split_once('.')
        .map(|(_, rest)| format!(".{rest}"))
        .unwrap_or_else(|| format!(".{host}"));
    format!("{host},{parent},localhost,127.0.0.1")
}

/// Generate the env file for a new worktree.
#[must_use]
pub fn generate(config: &ProjectConfig, branch: &str, worktree_root: &Path, ports: PortTriple) -> EnvFile {
    let stack = config.stack_name(branch);
    let domain = format!("{stack}.localhost");

    let mut env = EnvFile::default();
    env.push_comment(&format!("dockertree environment for {branch}"));
    env.set("COMPOSE_PROJECT_NAME", &stack);
    env.set("PROJECT_ROOT", worktree_root.to_string_lossy());
    env.set("SITE_DOMAIN", format!("http://{domain}"));
    env.set(
        "ALLOWED_HOSTS",
        format!("localhost,127.0.0.1,{domain},*.localhost"),
    );
    env.set("USE_X_FORWARDED_HOST", "True");
    env.set("VITE_ALLOWED_HOSTS", vite_allowed_hosts(&domain));
    env.set("DOCKERTREE_DB_HOST_PORT", ports.db.to_string());
    env.set("DOCKERTREE_REDIS_HOST_PORT", ports.redis.to_string());
    env.set("DOCKERTREE_WEB_HOST_PORT", ports.web.to_string());
    for (key, value) in &config.environment {
        env.set(key, value);
    }
    env
}

/// Rewrite an env file for a domain deployment: HTTPS site, domain added to
/// allowed hosts, dev-server hosts updated.
pub fn apply_domain_override(env: &mut EnvFile, domain: &str) {
    env.set("SITE_DOMAIN", format!("https://{domain}"));
    append_allowed_host(env, domain);
    env.set("VITE_ALLOWED_HOSTS", vite_allowed_hosts(domain));
}

/// Rewrite an env file for an IP deployment: HTTP-only site.
pub fn apply_ip_override(env: &mut EnvFile, ip: &str) {
    env.set("SITE_DOMAIN", format!("http://{ip}"));
    append_allowed_host(env, ip);
}

fn append_allowed_host(env: &mut EnvFile, host: &str) {
    let current = env.get("ALLOWED_HOSTS").unwrap_or_default();
    if current.split(',').any(|h| h.trim() == host) {
        return;
    }
    let updated = if current.is_empty() {
        host.to_string()
    } else {
        format!("{current},{host}")
    };
    env.set("ALLOWED_HOSTS", updated);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> ProjectConfig {
        ProjectConfig::new("myapp")
    }

    #[test]
    fn codec_preserves_comments_and_order() {
        let text = "# header\nA=1\n\nB=two words\n";
        let env = EnvFile::parse(text);
        assert_eq!(env.get("A"), Some("1"));
        assert_eq!(env.get("B"), Some("two words"));
        assert_eq!(env.render(), text);
    }

    #[test]
    fn set_replaces_in_place() {
        let mut env = EnvFile::parse("A=1\nB=2\n");
        env.set("A", "9");
        assert_eq!(env.render(), "A=9\nB=2\n");
        env.set("C", "3");
        assert_eq!(env.render(), "A=9\nB=2\nC=3\n");
    }

    #[test]
    fn triples_come_from_disjoint_ranges() {
        let triple = allocate_triple(&BTreeSet::new()).unwrap();
        assert!(DB_PORT_RANGE.contains(&triple.db));
        assert!(REDIS_PORT_RANGE.contains(&triple.redis));
        assert!(WEB_PORT_RANGE.contains(&triple.web));
    }

    #[test]
    fn allocation_skips_used_ports() {
        let mut used = BTreeSet::new();
        used.insert(55000);
        used.insert(55001);
        used.insert(56000);
        used.insert(57000);
        let triple = allocate_triple(&used).unwrap();
        assert_eq!(triple.db, 55002);
        assert_eq!(triple.redis, 56001);
        assert_eq!(triple.web, 57001);
    }

    #[test]
    fn used_ports_scans_existing_env_files() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a/env.dockertree");
        std::fs::create_dir_all(a.parent().unwrap()).unwrap();
        std::fs::write(
            &a,
            "DOCKERTREE_DB_HOST_PORT=55003\nDOCKERTREE_WEB_HOST_PORT=57009\n",
        )
        .unwrap();
        let used = used_ports(&[a, dir.path().join("missing/env.dockertree")]);
        assert!(used.contains(&55003));
        assert!(used.contains(&57009));
        assert_eq!(used.len(), 2);
    }

    #[test]
    fn generated_env_has_the_required_keys() {
        let config = test_config();
        let ports = PortTriple {
            db: 55000,
            redis: 56000,
            web: 57000,
        };
        let env = generate(&config, "feature-auth", Path::new("/p/worktrees/feature-auth"), ports);
        assert_eq!(env.get("COMPOSE_PROJECT_NAME"), Some("myapp-feature-auth"));
        assert_eq!(
            env.get("SITE_DOMAIN"),
            Some("http://myapp-feature-auth.localhost")
        );
        assert_eq!(env.get("USE_X_FORWARDED_HOST"), Some("True"));
        assert_eq!(env.get("DOCKERTREE_DB_HOST_PORT"), Some("55000"));
        assert!(env
            .get("ALLOWED_HOSTS")
            .unwrap()
            .contains("myapp-feature-auth.localhost"));
        assert!(env
            .get("VITE_ALLOWED_HOSTS")
            .unwrap()
            .starts_with("myapp-feature-auth.localhost,.localhost"));
    }

    #[test]
    fn domain_override_switches_to_https() {
        let config = test_config();
        let mut env = generate(
            &config,
            "feature-auth",
            Path::new("/p"),
            PortTriple {
                db: 55000,
                redis: 56000,
                web: 57000,
            },
        );
        apply_domain_override(&mut env, "app.example.com");
        assert_eq!(env.get("SITE_DOMAIN"), Some("https://app.example.com"));
        assert!(env.get("ALLOWED_HOSTS").unwrap().contains("app.example.com"));
        assert_eq!(
            env.get("VITE_ALLOWED_HOSTS"),
            Some("app.example.com,.example.com,localhost,127.0.0.1")
        );
        // Idempotent: applying again does not duplicate the host.
        apply_domain_override(&mut env, "app.example.com");
        let hosts = env.get("ALLOWED_HOSTS").unwrap();
        assert_eq!(hosts.matches("app.example.com").count(), 1);
    }

    #[test]
    fn ip_override_is_http_only() {
        let mut env = EnvFile::parse("SITE_DOMAIN=http://x.localhost\nALLOWED_HOSTS=localhost\n");
        apply_ip_override(&mut env, "203.0.113.10");
        assert_eq!(env.get("SITE_DOMAIN"), Some("http://203.0.113.10"));
        assert_eq!(env.get("ALLOWED_HOSTS"), Some("localhost,203.0.113.10"));
    }
}
