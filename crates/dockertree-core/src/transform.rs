//! Structural rewrite of the project's compose file into the per-worktree
//! variant.
//!
//! The original file is never mutated; the output lives at
//! `.dockertree/docker-compose.worktree.yml`. The rewrite substitutes
//! `${COMPOSE_PROJECT_NAME}` for identifiers, neutralizes host port
//! bindings, injects proxy-discovery labels, and attaches web-class services
//! to the shared proxy network. Applying the transformer to its own output
//! is a fixed point.

use std::path::{Path, PathBuf};

use serde_yaml::{Mapping, Value};

use crate::config::ProjectConfig;
use crate::error::Error;

/// Service-name fragments that mark a web-class service.
pub const WEB_CLASS_NAMES: &[&str] = &["web", "app", "frontend", "api"];

/// Global proxy services excluded from per-worktree stacks.
const EXCLUDED_SERVICES: &[&str] = &["caddy", "caddy-monitor", "dockertree_caddy_proxy"];

/// Proxy volumes shared across worktrees, never isolated per branch.
const SHARED_VOLUMES: &[&str] = &["caddy_data", "caddy_config"];

/// Default container port assumed for web services with no port hints.
const DEFAULT_WEB_PORT: u16 = 8000;

/// Service classification for port neutralization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServiceClass {
    Database,
    Cache,
    Web,
    Other,
}

fn classify(service_name: &str) -> ServiceClass {
    let name = service_name.to_lowercase();
    if WEB_CLASS_NAMES.iter().any(|w| name.contains(w)) {
        ServiceClass::Web
    } else if name.contains("redis") || name.contains("cache") {
        ServiceClass::Cache
    } else if name.contains("postgres") || name.contains("db") || name.contains("database") {
        ServiceClass::Database
    } else {
        ServiceClass::Other
    }
}

impl ServiceClass {
    /// Env var carrying the debug host port for this class, when any.
    const fn host_port_var(self) -> Option<&'static str> {
        match self {
            Self::Database => Some("DOCKERTREE_DB_HOST_PORT"),
            Self::Cache => Some("DOCKERTREE_REDIS_HOST_PORT"),
            Self::Web => Some("DOCKERTREE_WEB_HOST_PORT"),
            Self::Other => None,
        }
    }
}

/// Locate the project's compose file, preferring `.yml` over `.yaml`.
#[must_use]
pub fn find_source_compose(root: &Path) -> Option<PathBuf> {
    for name in [
        "docker-compose.yml",
        "docker-compose.yaml",
        "compose.yml",
        "compose.yaml",
    ] {
        let candidate = root.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

/// Compose transformer, parameterized by project configuration.
#[derive(Debug)]
pub struct ComposeTransformer<'a> {
    config: &'a ProjectConfig,
}

impl<'a> ComposeTransformer<'a> {
    /// Create a transformer for a project.
    #[must_use]
    pub const fn new(config: &'a ProjectConfig) -> Self {
        Self { config }
    }

    /// Transform a compose file on disk, writing the worktree variant.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transform`] when the source lacks required
    /// structure and [`Error::Io`] on filesystem failure.
    pub fn transform_file(&self, source: &Path, target: &Path) -> Result<(), Error> {
        let raw = std::fs::read_to_string(source)
            .map_err(|e| Error::io(format!("failed to read {}", source.display()), e))?;
        let output = self.transform_str(&raw)?;
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::io(format!("failed to create {}", parent.display()), e))?;
        }
        std::fs::write(target, output)
            .map_err(|e| Error::io(format!("failed to write {}", target.display()), e))
    }

    /// Transform compose YAML text.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transform`] on parse failure or missing `services:`.
    pub fn transform_str(&self, yaml: &str) -> Result<String, Error> {
        let doc: Value = serde_yaml::from_str(yaml)?;
        let transformed = self.transform_value(doc)?;
        Ok(serde_yaml::to_string(&transformed)?)
    }

    /// Transform a parsed compose document.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transform`] when the document has no `services:`
    /// mapping.
    pub fn transform_value(&self, doc: Value) -> Result<Value, Error> {
        let Value::Mapping(mut root) = doc else {
            return Err(Error::transform("compose file is not a mapping"));
        };

        let services = match root.get_mut("services") {
            Some(Value::Mapping(services)) => services,
            _ => {
                return Err(Error::transform(
                    "compose file has no 'services:' mapping",
                ));
            },
        };

        // Drop global proxy services: they run once, not per worktree.
        let excluded: Vec<Value> = services
            .keys()
            .filter(|k| {
                k.as_str()
                    .is_some_and(|name| EXCLUDED_SERVICES.contains(&name))
            })
            .cloned()
            .collect();
        for key in excluded {
            tracing::debug!(service = ?key.as_str(), "excluding global proxy service");
            services.remove(key);
        }

        let service_names: Vec<String> = services
            .keys()
            .filter_map(|k| k.as_str().map(ToString::to_string))
            .collect();
        for name in &service_names {
            let Some(Value::Mapping(service)) = services.get_mut(name.as_str()) else {
                continue;
            };
            self.transform_service(name, service);
        }

        self.transform_volumes(&mut root)?;

        // Declare the shared proxy network as external.
        let networks = root
            .entry(Value::from("networks"))
            .or_insert_with(|| Value::Mapping(Mapping::new()));
        if let Value::Mapping(networks) = networks {
            let mut external = Mapping::new();
            external.insert(Value::from("external"), Value::from(true));
            networks.insert(
                Value::from(self.config.caddy_network.clone()),
                Value::Mapping(external),
            );
        }

        Ok(Value::Mapping(root))
    }

    fn transform_service(&self, name: &str, service: &mut Mapping) {
        let class = classify(name);

        // Identity rewrite: templated container name keyed by service name.
        if service.contains_key("container_name") {
            service.insert(
                Value::from("container_name"),
                Value::from(format!("${{COMPOSE_PROJECT_NAME}}-{name}")),
            );
        }

        let container_port = detect_container_port(service);
        self.neutralize_ports(service, class);

        if class == ServiceClass::Web {
            self.add_proxy_labels(name, service, container_port);
            self.attach_proxy_network(service);
        }

        inject_environment(service);
        rewrite_build_target(service);
    }

    /// Convert published ports into `expose` entries, keeping a single
    /// env-templated debug binding for the well-known classes.
    ///
    /// Existing keys are rewritten in place so repeated transformation
    /// does not reorder the document.
    fn neutralize_ports(&self, service: &mut Mapping, class: ServiceClass) {
        let entries = match service.get("ports") {
            Some(Value::Sequence(entries)) => entries.clone(),
            Some(_) | None => return,
        };

        let mut expose: Vec<Value> = match service.get("expose") {
            Some(Value::Sequence(existing)) => existing.clone(),
            _ => Vec::new(),
        };
        let mut container_ports = Vec::new();
        for entry in &entries {
            if let Some(port) = container_port_of(entry) {
                if !expose.iter().any(|e| value_is_port(e, &port)) {
                    expose.push(Value::from(port.clone()));
                }
                container_ports.push(port);
            }
        }
        if !expose.is_empty() {
            set_key(service, "expose", Value::Sequence(expose));
        }

        if let (Some(var), Some(first)) = (class.host_port_var(), container_ports.first()) {
            let binding = format!("${{{var}:-0}}:{first}");
            set_key(
                service,
                "ports",
                Value::Sequence(vec![Value::from(binding)]),
            );
        } else {
            service.remove("ports");
        }
    }

    fn add_proxy_labels(&self, name: &str, service: &mut Mapping, container_port: u16) {
        let hostname = "${COMPOSE_PROJECT_NAME}.localhost".to_string();
        let upstream = format!("${{COMPOSE_PROJECT_NAME}}-{name}:{container_port}");

        let labels = service
            .entry(Value::from("labels"))
            .or_insert_with(|| Value::Sequence(Vec::new()));
        match labels {
            Value::Sequence(list) => {
                upsert_label_list(list, "caddy.proxy", &hostname);
                upsert_label_list(list, "caddy.proxy.reverse_proxy", &upstream);
            },
            Value::Mapping(map) => {
                map.insert(Value::from("caddy.proxy"), Value::from(hostname));
                map.insert(Value::from("caddy.proxy.reverse_proxy"), Value::from(upstream));
            },
            _ => {},
        }
    }

    fn attach_proxy_network(&self, service: &mut Mapping) {
        let network = self.config.caddy_network.clone();
        let networks = service
            .entry(Value::from("networks"))
            .or_insert_with(|| Value::Sequence(Vec::new()));
        match networks {
            Value::Sequence(list) => {
                if !list.iter().any(|n| n.as_str() == Some(network.as_str())) {
                    list.push(Value::from(network));
                }
            },
            Value::Mapping(map) => {
                map.entry(Value::from(network)).or_insert(Value::Null);
            },
            _ => {},
        }
    }

    /// Rewrite project-level volume declarations with branch-scoped names,
    /// warning about stack volumes missing from the declared config set.
    fn transform_volumes(&self, root: &mut Mapping) -> Result<(), Error> {
        let Some(volumes) = root.get_mut("volumes") else {
            return Ok(());
        };
        let Value::Mapping(volumes) = volumes else {
            return Ok(());
        };

        let shared: Vec<Value> = volumes
            .keys()
            .filter(|k| k.as_str().is_some_and(|n| SHARED_VOLUMES.contains(&n)))
            .cloned()
            .collect();
        for key in shared {
            volumes.remove(key);
        }

        let names: Vec<String> = volumes
            .keys()
            .filter_map(|k| k.as_str().map(ToString::to_string))
            .collect();
        for name in &names {
            if !self.config.volumes.iter().any(|v| v == name) {
                tracing::warn!(
                    volume = %name,
                    "compose file declares a volume not listed in config.yml; \
                     it will not be isolated per branch"
                );
            }
            let templated = format!("${{COMPOSE_PROJECT_NAME}}_{name}");
            let entry = volumes
                .get_mut(name.as_str())
                .expect("volume key present");
            match entry {
                Value::Mapping(config) => {
                    // Source-provided name overrides are dropped.
                    config.insert(Value::from("name"), Value::from(templated));
                },
                _ => {
                    let mut config = Mapping::new();
                    config.insert(Value::from("name"), Value::from(templated));
                    *entry = Value::Mapping(config);
                },
            }
        }
        Ok(())
    }
}

/// Overwrite a key in place when present, append otherwise. Keeps the
/// document's key order stable across repeated transformation.
fn set_key(map: &mut Mapping, key: &str, value: Value) {
    if let Some(slot) = map.get_mut(key) {
        *slot = value;
    } else {
        map.insert(Value::from(key), value);
    }
}

/// Replace or insert a `key=value` entry in a list-form label set.
fn upsert_label_list(list: &mut Vec<Value>, key: &str, value: &str) {
    let prefix = format!("{key}=");
    let entry = format!("{key}={value}");
    for existing in list.iter_mut() {
        if let Some(text) = existing.as_str() {
            if text.starts_with(&prefix) {
                *existing = Value::from(entry);
                return;
            }
        }
    }
    list.push(Value::from(entry));
}

fn value_is_port(value: &Value, port: &str) -> bool {
    match value {
        Value::String(s) => s == port,
        Value::Number(n) => n.to_string() == port,
        _ => false,
    }
}

/// Extract the container-side port from a ports entry.
///
/// Handles short syntax (`"8000"`, `"8000:8000"`, `"127.0.0.1:5432:5432"`,
/// env-templated host parts), numeric entries, and long-syntax mappings
/// (`target:`). Host IP prefixes are stripped per the neutralization rule.
fn container_port_of(entry: &Value) -> Option<String> {
    match entry {
        Value::String(s) => {
            let container = s.rsplit(':').next().unwrap_or(s);
            let container = container.split('/').next().unwrap_or(container);
            if container.is_empty() {
                None
            } else {
                Some(container.to_string())
            }
        },
        Value::Number(n) => Some(n.to_string()),
        Value::Mapping(map) => map.get("target").map(|t| match t {
            Value::Number(n) => n.to_string(),
            Value::String(s) => s.clone(),
            other => format!("{other:?}"),
        }),
        _ => None,
    }
}

/// Find the web container port for the reverse-proxy label: first `expose`
/// entry, then first `ports` container port, then the default.
fn detect_container_port(service: &Mapping) -> u16 {
    if let Some(Value::Sequence(expose)) = service.get("expose") {
        if let Some(first) = expose.first() {
            if let Some(port) = parse_port_number(first) {
                return port;
            }
        }
    }
    if let Some(Value::Sequence(ports)) = service.get("ports") {
        if let Some(first) = ports.first() {
            if let Some(port) = container_port_of(first).and_then(|p| p.parse().ok()) {
                return port;
            }
        }
    }
    DEFAULT_WEB_PORT
}

fn parse_port_number(value: &Value) -> Option<u16> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
        Value::String(s) => s.split('/').next().and_then(|p| p.parse().ok()),
        _ => None,
    }
}

/// Ensure service environments expose the stack identity.
fn inject_environment(service: &mut Mapping) {
    let vars = [
        ("COMPOSE_PROJECT_NAME", "${COMPOSE_PROJECT_NAME}"),
        ("PROJECT_ROOT", "${PROJECT_ROOT}"),
    ];
    let environment = service
        .entry(Value::from("environment"))
        .or_insert_with(|| Value::Mapping(Mapping::new()));
    match environment {
        Value::Mapping(map) => {
            for (key, value) in vars {
                map.insert(Value::from(key), Value::from(value));
            }
        },
        Value::Sequence(list) => {
            for (key, value) in vars {
                let entry = format!("{key}={value}");
                let prefix = format!("{key}=");
                if !list
                    .iter()
                    .any(|e| e.as_str().is_some_and(|s| s.starts_with(&prefix)))
                {
                    list.push(Value::from(entry));
                }
            }
        },
        _ => {},
    }
}

/// Switch build stage selection to `${BUILD_MODE:-dev}` where a target is
/// present.
fn rewrite_build_target(service: &mut Mapping) {
    if let Some(Value::Mapping(build)) = service.get_mut("build") {
        if build.contains_key("target") {
            build.insert(Value::from("target"), Value::from("${BUILD_MODE:-dev}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ProjectConfig {
        let mut config = ProjectConfig::new("myapp");
        config.volumes = vec!["postgres_data".into(), "redis_data".into(), "media_files".into()];
        config
    }

    const SOURCE: &str = r#"
services:
  web:
    build:
      context: .
      target: prod
    container_name: myapp-web
    ports:
      - "8000:8000"
    environment:
      DEBUG: "${DEBUG:-True}"
    volumes:
      - media_files:/app/media
    depends_on:
      - db
  db:
    image: postgres:16
    ports:
      - "127.0.0.1:5432:5432"
    volumes:
      - postgres_data:/var/lib/postgresql/data
  redis:
    image: redis:7
    ports:
      - 6379
  caddy:
    image: caddy:2
volumes:
  postgres_data:
  redis_data:
  media_files:
    name: custom_media
  caddy_data:
"#;

    fn transform(yaml: &str) -> Value {
        let config = config();
        let transformer = ComposeTransformer::new(&config);
        serde_yaml::from_str(&transformer.transform_str(yaml).unwrap()).unwrap()
    }

    fn service<'v>(doc: &'v Value, name: &str) -> &'v Value {
        &doc["services"][name]
    }

    #[test]
    fn refuses_documents_without_services() {
        let config = config();
        let transformer = ComposeTransformer::new(&config);
        let err = transformer.transform_str("volumes: {}\n").unwrap_err();
        assert_eq!(err.code(), "transform_error");
    }

    #[test]
    fn global_proxy_services_are_excluded() {
        let doc = transform(SOURCE);
        assert!(doc["services"].get("caddy").is_none());
        assert!(doc["services"].get("web").is_some());
    }

    #[test]
    fn container_names_are_templated() {
        let doc = transform(SOURCE);
        assert_eq!(
            service(&doc, "web")["container_name"].as_str(),
            Some("${COMPOSE_PROJECT_NAME}-web")
        );
        // db had no container_name; the compose default already includes
        // the stack name.
        assert!(service(&doc, "db").get("container_name").is_none());
    }

    #[test]
    fn ports_become_expose_plus_debug_binding() {
        let doc = transform(SOURCE);

        let web = service(&doc, "web");
        assert_eq!(web["expose"][0].as_str(), Some("8000"));
        assert_eq!(
            web["ports"][0].as_str(),
            Some("${DOCKERTREE_WEB_HOST_PORT:-0}:8000")
        );

        // Host-IP prefix is stripped before the standard rule applies.
        let db = service(&doc, "db");
        assert_eq!(db["expose"][0].as_str(), Some("5432"));
        assert_eq!(
            db["ports"][0].as_str(),
            Some("${DOCKERTREE_DB_HOST_PORT:-0}:5432")
        );

        let redis = service(&doc, "redis");
        assert_eq!(redis["expose"][0].as_str(), Some("6379"));
        assert_eq!(
            redis["ports"][0].as_str(),
            Some("${DOCKERTREE_REDIS_HOST_PORT:-0}:6379")
        );
    }

    #[test]
    fn web_services_get_proxy_labels_and_network() {
        let doc = transform(SOURCE);
        let web = service(&doc, "web");
        let labels: Vec<&str> = web["labels"]
            .as_sequence()
            .unwrap()
            .iter()
            .filter_map(Value::as_str)
            .collect();
        assert!(labels.contains(&"caddy.proxy=${COMPOSE_PROJECT_NAME}.localhost"));
        assert!(labels.contains(&"caddy.proxy.reverse_proxy=${COMPOSE_PROJECT_NAME}-web:8000"));

        let networks: Vec<&str> = web["networks"]
            .as_sequence()
            .unwrap()
            .iter()
            .filter_map(Value::as_str)
            .collect();
        assert!(networks.contains(&"dockertree_caddy_proxy"));

        // Database and cache services stay off the proxy network.
        assert!(service(&doc, "db").get("networks").is_none());
        assert!(doc["networks"]["dockertree_caddy_proxy"]["external"]
            .as_bool()
            .unwrap());
    }

    #[test]
    fn volumes_are_renamed_and_shared_proxy_volumes_dropped() {
        let doc = transform(SOURCE);
        assert_eq!(
            doc["volumes"]["postgres_data"]["name"].as_str(),
            Some("${COMPOSE_PROJECT_NAME}_postgres_data")
        );
        // A source-provided name override is replaced.
        assert_eq!(
            doc["volumes"]["media_files"]["name"].as_str(),
            Some("${COMPOSE_PROJECT_NAME}_media_files")
        );
        assert!(doc["volumes"].get("caddy_data").is_none());
        // Service mount strings are preserved verbatim.
        assert_eq!(
            service(&doc, "db")["volumes"][0].as_str(),
            Some("postgres_data:/var/lib/postgresql/data")
        );
    }

    #[test]
    fn build_target_switches_to_build_mode() {
        let doc = transform(SOURCE);
        assert_eq!(
            service(&doc, "web")["build"]["target"].as_str(),
            Some("${BUILD_MODE:-dev}")
        );
    }

    #[test]
    fn environment_substitutions_are_preserved() {
        let doc = transform(SOURCE);
        let web = service(&doc, "web");
        assert_eq!(
            web["environment"]["DEBUG"].as_str(),
            Some("${DEBUG:-True}")
        );
        assert_eq!(
            web["environment"]["COMPOSE_PROJECT_NAME"].as_str(),
            Some("${COMPOSE_PROJECT_NAME}")
        );
        assert_eq!(
            service(&doc, "web")["depends_on"][0].as_str(),
            Some("db")
        );
    }

    #[test]
    fn transformer_is_idempotent() {
        let config = config();
        let transformer = ComposeTransformer::new(&config);
        let once = transformer.transform_str(SOURCE).unwrap();
        let twice = transformer.transform_str(&once).unwrap();
        let a: Value = serde_yaml::from_str(&once).unwrap();
        let b: Value = serde_yaml::from_str(&twice).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn prefers_yml_over_yaml() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("docker-compose.yaml"), "a").unwrap();
        std::fs::write(dir.path().join("docker-compose.yml"), "b").unwrap();
        assert_eq!(
            find_source_compose(dir.path()).unwrap(),
            dir.path().join("docker-compose.yml")
        );
    }

    #[test]
    fn long_syntax_ports_use_target() {
        let yaml = r"
services:
  web:
    ports:
      - target: 3000
        published: 3000
";
        let doc = transform(yaml);
        let web = service(&doc, "web");
        assert_eq!(web["expose"][0].as_str(), Some("3000"));
        assert_eq!(
            web["ports"][0].as_str(),
            Some("${DOCKERTREE_WEB_HOST_PORT:-0}:3000")
        );
    }
}
