//! Routing configuration generation for the global proxy.
//!
//! Containers advertise themselves through `caddy.proxy` labels; the
//! generator renders a full proxy configuration from the discovered set.
//! Domain hostnames get automatic TLS; raw IP hostnames are HTTP-only
//! because the certificate authority will not issue for them.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::error::Error;
use crate::runtime::DockerRuntime;

/// Label carrying the routed hostname.
pub const PROXY_LABEL: &str = "caddy.proxy";
/// Label carrying the upstream `container:port` target.
pub const UPSTREAM_LABEL: &str = "caddy.proxy.reverse_proxy";
/// Optional label carrying an active health-check path.
pub const HEALTH_CHECK_LABEL: &str = "caddy.proxy.health_check";

/// Production ACME directory.
pub const ACME_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";
/// Staging ACME directory used while rate-limited.
pub const ACME_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

/// How long a rate-limited hostname stays on the staging issuer.
pub const RATE_LIMIT_BACKOFF_SECS: i64 = 3600;

/// One discovered routing target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTarget {
    /// Hostname the route matches.
    pub hostname: String,
    /// Upstream dial target (`container:port`).
    pub upstream: String,
    /// Optional health-check path.
    pub health_check: Option<String>,
}

/// Returns `true` when a host is a real domain: not localhost, not an IP
/// literal, and containing at least one dot.
#[must_use]
pub fn is_domain(host: &str) -> bool {
    if host.starts_with("localhost") || host.starts_with("127.0.0.1") {
        return false;
    }
    if is_ipv4(host) {
        return false;
    }
    host.contains('.') && !host.starts_with('.')
}

/// Returns `true` for dotted-quad IPv4 literals.
#[must_use]
pub fn is_ipv4(host: &str) -> bool {
    let mut octets = 0;
    for part in host.split('.') {
        if part.is_empty() || part.len() > 3 || !part.chars().all(|c| c.is_ascii_digit()) {
            return false;
        }
        if part.parse::<u16>().map_or(true, |n| n > 255) {
            return false;
        }
        octets += 1;
    }
    octets == 4
}

/// Discover routing targets from running containers carrying proxy labels.
///
/// # Errors
///
/// Returns [`Error::Runtime`] when the runtime cannot be queried.
pub fn discover_targets(runtime: &DockerRuntime) -> Result<Vec<RouteTarget>, Error> {
    let mut targets = Vec::new();
    for container in runtime.running_containers()? {
        let labels = runtime.container_labels(&container.id)?;
        let Some(hostname) = labels.get(PROXY_LABEL) else {
            continue;
        };
        let upstream = labels
            .get(UPSTREAM_LABEL)
            .cloned()
            .unwrap_or_else(|| format!("{}:8000", container.name));
        targets.push(RouteTarget {
            hostname: hostname.clone(),
            upstream,
            health_check: labels.get(HEALTH_CHECK_LABEL).cloned(),
        });
    }
    Ok(targets)
}

/// Hostnames currently forced onto the staging issuer after a certificate
/// authority rate limit, with the time the limit is expected to lift.
#[derive(Debug, Clone, Default)]
pub struct RateLimitState {
    entries: Vec<(String, DateTime<Utc>)>,
}

impl RateLimitState {
    /// Create an empty state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark hostnames as rate-limited, recording the expected expiry.
    pub fn mark(&mut self, hostnames: &[String]) {
        let expiry = Utc::now() + chrono::Duration::seconds(RATE_LIMIT_BACKOFF_SECS);
        for host in hostnames {
            if !self.entries.iter().any(|(h, _)| h == host) {
                tracing::warn!(
                    hostname = %host,
                    retry_after = %expiry,
                    "certificate authority rate limit hit, switching to staging issuer \
                     (certificates will be untrusted until the limit expires)"
                );
                self.entries.push((host.clone(), expiry));
            }
        }
    }

    /// Drop expired entries and return whether any hostname is still
    /// rate-limited.
    pub fn sweep(&mut self) -> bool {
        let now = Utc::now();
        self.entries.retain(|(_, expiry)| *expiry > now);
        !self.entries.is_empty()
    }

    /// Returns `true` when the hostname should use the staging issuer.
    #[must_use]
    pub fn is_limited(&self, hostname: &str) -> bool {
        self.entries.iter().any(|(h, _)| h == hostname)
    }
}

/// Returns `true` when a certificate authority response body indicates a
/// rate limit.
#[must_use]
pub fn is_rate_limit_response(body: &str) -> bool {
    body.contains("rateLimited") || body.contains("too many certificates")
}

/// Render the full proxy configuration for the discovered targets.
#[must_use]
pub fn build_config(
    targets: &[RouteTarget],
    acme_email: Option<&str>,
    rate_limits: &RateLimitState,
) -> Value {
    let domains: BTreeSet<&str> = targets
        .iter()
        .map(|t| t.hostname.as_str())
        .filter(|h| is_domain(h))
        .collect();

    let mut listen = vec![":80"];
    if !domains.is_empty() {
        listen.push(":443");
    }

    let mut routes: Vec<Value> = Vec::with_capacity(targets.len() + 1);
    for target in targets {
        let mut handler = json!({
            "handler": "reverse_proxy",
            "upstreams": [{"dial": target.upstream}],
        });
        if let Some(path) = &target.health_check {
            handler["health_checks"] = json!({
                "active": {
                    "path": path,
                    "headers": {"Host": [target.hostname]},
                    "timeout": "30s",
                    "interval": "10s",
                }
            });
        }
        routes.push(json!({
            "match": [{"host": [target.hostname]}],
            "handle": [handler],
        }));
    }
    // Wildcard fallback must come last for the matcher order to hold.
    routes.push(json!({
        "match": [{"host": ["*"]}],
        "handle": [{
            "handler": "static_response",
            "body": "dockertree proxy is running, no worktree matches this host",
            "status_code": 200,
        }],
    }));

    let mut config = json!({
        "admin": {"listen": "0.0.0.0:2019"},
        "apps": {
            "http": {
                "servers": {
                    "srv0": {
                        "listen": listen,
                        "routes": routes,
                    }
                }
            }
        }
    });

    if !domains.is_empty() {
        let email = acme_email.unwrap_or("admin@example.com");
        let (limited, live): (Vec<&str>, Vec<&str>) = domains
            .iter()
            .copied()
            .partition(|h| rate_limits.is_limited(h));

        let mut policies = Vec::new();
        if !live.is_empty() {
            policies.push(json!({
                "subjects": live,
                "issuers": [{"module": "acme", "email": email, "ca": ACME_PRODUCTION}],
            }));
        }
        if !limited.is_empty() {
            policies.push(json!({
                "subjects": limited,
                "issuers": [{"module": "acme", "email": email, "ca": ACME_STAGING}],
            }));
        }
        config["apps"]["tls"] = json!({"automation": {"policies": policies}});
    }

    config
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(host: &str) -> RouteTarget {
        RouteTarget {
            hostname: host.to_string(),
            upstream: "myapp-feature-auth-web:8000".to_string(),
            health_check: None,
        }
    }

    #[test]
    fn domain_classification() {
        assert!(is_domain("app.example.com"));
        assert!(!is_domain("myapp-feature-auth.localhost"));
        assert!(!is_domain("localhost"));
        assert!(!is_domain("203.0.113.10"));
        assert!(!is_domain(".example.com"));
    }

    #[test]
    fn ipv4_literals() {
        assert!(is_ipv4("203.0.113.10"));
        assert!(is_ipv4("10.0.0.1"));
        assert!(!is_ipv4("300.0.0.1"));
        assert!(!is_ipv4("example.com"));
        assert!(!is_ipv4("1.2.3"));
    }

    #[test]
    fn localhost_routes_stay_http_only() {
        let config = build_config(
            &[target("myapp-feature-auth.localhost")],
            None,
            &RateLimitState::new(),
        );
        let listen = config["apps"]["http"]["servers"]["srv0"]["listen"]
            .as_array()
            .unwrap();
        assert_eq!(listen.len(), 1);
        assert!(config["apps"].get("tls").is_none());
    }

    #[test]
    fn domains_enable_https_and_acme() {
        let config = build_config(
            &[target("app.example.com")],
            Some("ops@example.com"),
            &RateLimitState::new(),
        );
        let listen = config["apps"]["http"]["servers"]["srv0"]["listen"]
            .as_array()
            .unwrap();
        assert!(listen.iter().any(|l| l == ":443"));
        let policy = &config["apps"]["tls"]["automation"]["policies"][0];
        assert_eq!(policy["subjects"][0], "app.example.com");
        assert_eq!(policy["issuers"][0]["ca"], ACME_PRODUCTION);
        assert_eq!(policy["issuers"][0]["email"], "ops@example.com");
    }

    #[test]
    fn ip_hosts_never_get_tls_policies() {
        let config = build_config(&[target("203.0.113.10")], None, &RateLimitState::new());
        assert!(config["apps"].get("tls").is_none());
    }

    #[test]
    fn rate_limited_domains_move_to_staging() {
        let mut limits = RateLimitState::new();
        limits.mark(&["app.example.com".to_string()]);
        let config = build_config(
            &[target("app.example.com"), target("other.example.com")],
            None,
            &limits,
        );
        let policies = config["apps"]["tls"]["automation"]["policies"]
            .as_array()
            .unwrap();
        assert_eq!(policies.len(), 2);
        let staging = policies
            .iter()
            .find(|p| p["issuers"][0]["ca"] == ACME_STAGING)
            .unwrap();
        assert_eq!(staging["subjects"][0], "app.example.com");
        let production = policies
            .iter()
            .find(|p| p["issuers"][0]["ca"] == ACME_PRODUCTION)
            .unwrap();
        assert_eq!(production["subjects"][0], "other.example.com");
    }

    #[test]
    fn wildcard_fallback_is_last() {
        let config = build_config(&[target("a.localhost")], None, &RateLimitState::new());
        let routes = config["apps"]["http"]["servers"]["srv0"]["routes"]
            .as_array()
            .unwrap();
        assert_eq!(routes.last().unwrap()["match"][0]["host"][0], "*");
    }

    #[test]
    fn health_checks_ride_along() {
        let config = build_config(
            &[RouteTarget {
                hostname: "a.localhost".to_string(),
                upstream: "web:8000".to_string(),
                health_check: Some("/health-check/".to_string()),
            }],
            None,
            &RateLimitState::new(),
        );
        let handler = &config["apps"]["http"]["servers"]["srv0"]["routes"][0]["handle"][0];
        assert_eq!(
            handler["health_checks"]["active"]["path"],
            "/health-check/"
        );
    }

    #[test]
    fn rate_limit_bodies_are_recognized() {
        assert!(is_rate_limit_response(
            r#"{"type":"urn:ietf:params:acme:error:rateLimited","detail":"..."}"#
        ));
        assert!(is_rate_limit_response("too many certificates already issued"));
        assert!(!is_rate_limit_response("ok"));
    }
}
