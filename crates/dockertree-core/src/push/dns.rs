//! DNS record management for domain deployments.

use std::path::Path;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::envgen::EnvFile;
use crate::error::Error;

/// Outcome of ensuring an A record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsOutcome {
    /// A new record was created.
    Created,
    /// An existing record was updated to the new IP.
    Updated,
    /// The record already pointed at the IP (idempotent, warned).
    AlreadyCorrect,
}

/// Split `app.example.com` into `("app", "example.com")`.
///
/// # Errors
///
/// Returns [`Error::Validation`] for domains without at least one dot.
pub fn parse_domain(full_domain: &str) -> Result<(String, String), Error> {
    let Some((sub, root)) = full_domain.split_once('.') else {
        return Err(Error::validation(format!(
            "invalid domain '{full_domain}': expected subdomain.domain.tld"
        )));
    };
    if sub.is_empty() || !root.contains('.') {
        return Err(Error::validation(format!(
            "invalid domain '{full_domain}': expected subdomain.domain.tld"
        )));
    }
    Ok((sub.to_string(), root.to_string()))
}

/// Provider-agnostic DNS operations.
pub trait DnsProvider {
    /// Provider name for diagnostics.
    fn provider_name(&self) -> &'static str;

    /// Find an A record, returning `(record_id, current_ip)` when present.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Network`] when the provider cannot be queried.
    fn find_a_record(&self, subdomain: &str, domain: &str)
        -> Result<Option<(u64, String)>, Error>;

    /// Create an A record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Network`] on API failure.
    fn create_a_record(&self, subdomain: &str, domain: &str, ip: &str) -> Result<(), Error>;

    /// Update an existing A record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Network`] on API failure.
    fn update_a_record(&self, record_id: u64, domain: &str, ip: &str) -> Result<(), Error>;
}

/// Create or update the A record for `full_domain` pointing at `ip`.
///
/// # Errors
///
/// Returns [`Error::Validation`] for malformed domains and provider
/// errors otherwise.
pub fn ensure_a_record(
    provider: &dyn DnsProvider,
    full_domain: &str,
    ip: &str,
) -> Result<DnsOutcome, Error> {
    let (sub, root) = parse_domain(full_domain)?;
    match provider.find_a_record(&sub, &root)? {
        Some((_, current)) if current == ip => {
            tracing::warn!(
                domain = full_domain,
                ip,
                "DNS record already points at the target IP"
            );
            Ok(DnsOutcome::AlreadyCorrect)
        },
        Some((record_id, current)) => {
            tracing::info!(domain = full_domain, from = %current, to = ip, "updating A record");
            provider.update_a_record(record_id, &root, ip)?;
            Ok(DnsOutcome::Updated)
        },
        None => {
            tracing::info!(domain = full_domain, ip, "creating A record");
            provider.create_a_record(&sub, &root, ip)?;
            Ok(DnsOutcome::Created)
        },
    }
}

/// Resolve the DNS API token through the documented chain: CLI flag, shell
/// environment (`DIGITALOCEAN_API_TOKEN` then `DNS_API_TOKEN`), the
/// project `.env`, and finally the global per-user config file.
#[must_use]
pub fn resolve_dns_token(flag: Option<&str>, project_root: Option<&Path>) -> Option<SecretString> {
    if let Some(token) = flag {
        return Some(SecretString::new(token.to_string()));
    }
    for var in ["DIGITALOCEAN_API_TOKEN", "DNS_API_TOKEN"] {
        if let Ok(token) = std::env::var(var) {
            if !token.trim().is_empty() {
                return Some(SecretString::new(token));
            }
        }
    }
    let mut candidates = Vec::new();
    if let Some(root) = project_root {
        candidates.push(root.join(".env"));
    }
    if let Some(global) = crate::config::global_config_path() {
        candidates.push(global);
    }
    for path in candidates {
        if !path.is_file() {
            continue;
        }
        let Ok(env) = EnvFile::load(&path) else {
            continue;
        };
        for key in ["DIGITALOCEAN_API_TOKEN", "DNS_API_TOKEN"] {
            if let Some(token) = env.get(key) {
                if !token.trim().is_empty() {
                    return Some(SecretString::new(token.trim().to_string()));
                }
            }
        }
    }
    None
}

/// DigitalOcean DNS provider.
pub struct DigitalOceanDns {
    token: SecretString,
    api_base: String,
    http: reqwest::blocking::Client,
}

#[derive(Debug, Deserialize)]
struct DomainRecord {
    id: u64,
    #[serde(rename = "type")]
    kind: String,
    name: String,
    data: String,
}

#[derive(Debug, Deserialize)]
struct DomainRecordsResponse {
    domain_records: Vec<DomainRecord>,
}

impl DigitalOceanDns {
    /// Build a provider with the default API endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Network`] when the HTTP client cannot be built.
    pub fn new(token: SecretString) -> Result<Self, Error> {
        Self::with_api_base(token, "https://api.digitalocean.com/v2")
    }

    /// Build a provider against an explicit API endpoint (tests).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Network`] when the HTTP client cannot be built.
    pub fn with_api_base(token: SecretString, api_base: impl Into<String>) -> Result<Self, Error> {
        let http = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(crate::runtime::timeouts::DNS)
            .build()
            .map_err(|e| Error::network(e.to_string()))?;
        Ok(Self {
            token,
            api_base: api_base.into(),
            http,
        })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{endpoint}", self.api_base.trim_end_matches('/'))
    }

    fn check(response: reqwest::blocking::Response) -> Result<reqwest::blocking::Response, Error> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            let body = response.text().unwrap_or_default();
            Err(Error::network(format!(
                "DNS API request failed with {status}: {body}"
            )))
        }
    }
}

impl DnsProvider for DigitalOceanDns {
    fn provider_name(&self) -> &'static str {
        "digitalocean"
    }

    fn find_a_record(
        &self,
        subdomain: &str,
        domain: &str,
    ) -> Result<Option<(u64, String)>, Error> {
        let response = self
            .http
            .get(self.url(&format!("/domains/{domain}/records?type=A&per_page=200")))
            .bearer_auth(self.token.expose_secret())
            .send()?;
        let records: DomainRecordsResponse = Self::check(response)?.json()?;
        Ok(records
            .domain_records
            .into_iter()
            .find(|r| r.kind == "A" && r.name == subdomain)
            .map(|r| (r.id, r.data)))
    }

    fn create_a_record(&self, subdomain: &str, domain: &str, ip: &str) -> Result<(), Error> {
        let response = self
            .http
            .post(self.url(&format!("/domains/{domain}/records")))
            .bearer_auth(self.token.expose_secret())
            .json(&serde_json::json!({
                "type": "A",
                "name": subdomain,
                "data": ip,
                "ttl": 300,
            }))
            .send()?;
        Self::check(response).map(|_| ())
    }

    fn update_a_record(&self, record_id: u64, domain: &str, ip: &str) -> Result<(), Error> {
        let response = self
            .http
            .put(self.url(&format!("/domains/{domain}/records/{record_id}")))
            .bearer_auth(self.token.expose_secret())
            .json(&serde_json::json!({ "data": ip }))
            .send()?;
        Self::check(response).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domains_split_into_sub_and_root() {
        assert_eq!(
            parse_domain("app.example.com").unwrap(),
            ("app".to_string(), "example.com".to_string())
        );
        assert_eq!(
            parse_domain("deep.app.example.com").unwrap(),
            ("deep".to_string(), "app.example.com".to_string())
        );
        assert!(parse_domain("example").is_err());
        assert!(parse_domain("example.com").is_err());
    }

    struct FakeDns {
        existing: Option<(u64, String)>,
    }

    impl DnsProvider for FakeDns {
        fn provider_name(&self) -> &'static str {
            "fake"
        }

        fn find_a_record(&self, _: &str, _: &str) -> Result<Option<(u64, String)>, Error> {
            Ok(self.existing.clone())
        }

        fn create_a_record(&self, _: &str, _: &str, _: &str) -> Result<(), Error> {
            Ok(())
        }

        fn update_a_record(&self, _: u64, _: &str, _: &str) -> Result<(), Error> {
            Ok(())
        }
    }

    #[test]
    fn ensure_creates_updates_or_confirms() {
        let absent = FakeDns { existing: None };
        assert_eq!(
            ensure_a_record(&absent, "app.example.com", "203.0.113.10").unwrap(),
            DnsOutcome::Created
        );

        let stale = FakeDns {
            existing: Some((7, "198.51.100.1".to_string())),
        };
        assert_eq!(
            ensure_a_record(&stale, "app.example.com", "203.0.113.10").unwrap(),
            DnsOutcome::Updated
        );

        let correct = FakeDns {
            existing: Some((7, "203.0.113.10".to_string())),
        };
        assert_eq!(
            ensure_a_record(&correct, "app.example.com", "203.0.113.10").unwrap(),
            DnsOutcome::AlreadyCorrect
        );
    }

    #[test]
    fn token_chain_prefers_the_flag() {
        let token = resolve_dns_token(Some("tok-from-flag"), None).unwrap();
        assert_eq!(token.expose_secret(), "tok-from-flag");
    }

    #[test]
    fn token_chain_reads_project_env_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".env"), "DNS_API_TOKEN=tok-from-env-file\n").unwrap();
        // Only deterministic when the shell vars are absent; skip otherwise.
        if std::env::var("DIGITALOCEAN_API_TOKEN").is_ok() || std::env::var("DNS_API_TOKEN").is_ok()
        {
            return;
        }
        let token = resolve_dns_token(None, Some(dir.path())).unwrap();
        assert_eq!(token.expose_secret(), "tok-from-env-file");
    }
}
