//! Droplet provisioning for the push pipeline.

use std::time::{Duration, Instant};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::runtime::timeouts;

/// Defaults for droplet creation, overridable through the environment.
#[derive(Debug, Clone, Serialize)]
pub struct DropletDefaults {
    /// Region slug.
    pub region: String,
    /// Size slug.
    pub size: String,
    /// Image slug.
    pub image: String,
    /// SSH key ids or fingerprints.
    pub ssh_keys: Vec<String>,
}

impl DropletDefaults {
    /// Read defaults from `DROPLET_DEFAULT_{REGION,SIZE,IMAGE,SSH_KEYS}`.
    #[must_use]
    pub fn from_env() -> Self {
        let var = |name: &str, fallback: &str| {
            std::env::var(name).unwrap_or_else(|_| fallback.to_string())
        };
        Self {
            region: var("DROPLET_DEFAULT_REGION", "nyc3"),
            size: var("DROPLET_DEFAULT_SIZE", "s-2vcpu-4gb"),
            image: var("DROPLET_DEFAULT_IMAGE", "docker-20-04"),
            ssh_keys: std::env::var("DROPLET_DEFAULT_SSH_KEYS")
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|k| !k.is_empty())
                        .map(ToString::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        }
    }
}

/// A droplet as seen by the provider API.
#[derive(Debug, Clone, Serialize)]
pub struct DropletInfo {
    /// Provider id.
    pub id: u64,
    /// Droplet name.
    pub name: String,
    /// Provisioning status (`new`, `active`, ...).
    pub status: String,
    /// Region slug.
    pub region: String,
    /// Public IPv4 address, once assigned.
    pub public_ip: Option<String>,
    /// VPC-private IPv4 address, once assigned.
    pub private_ip: Option<String>,
    /// VPC the droplet is attached to.
    pub vpc_uuid: Option<String>,
}

/// Parameters for droplet creation.
#[derive(Debug, Clone)]
pub struct CreateDropletRequest {
    /// Droplet name.
    pub name: String,
    /// Region slug.
    pub region: String,
    /// Size slug.
    pub size: String,
    /// Image slug.
    pub image: String,
    /// SSH key ids or fingerprints.
    pub ssh_keys: Vec<String>,
    /// VPC to attach to, when reusing a central droplet's network.
    pub vpc_uuid: Option<String>,
}

/// Provider-agnostic droplet operations.
pub trait DropletProvider {
    /// Provider name for diagnostics.
    fn provider_name(&self) -> &'static str;

    /// Create a droplet.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Network`] on API failure.
    fn create(&self, request: &CreateDropletRequest) -> Result<DropletInfo, Error>;

    /// List all droplets.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Network`] on API failure.
    fn list(&self) -> Result<Vec<DropletInfo>, Error>;

    /// Fetch one droplet by id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Network`] on API failure.
    fn get(&self, id: u64) -> Result<DropletInfo, Error>;

    /// Find a droplet by numeric id or name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Network`] on API failure.
    fn find(&self, id_or_name: &str) -> Result<Option<DropletInfo>, Error> {
        if let Ok(id) = id_or_name.parse::<u64>() {
            return match self.get(id) {
                Ok(info) => Ok(Some(info)),
                Err(Error::NotFound { .. }) => Ok(None),
                Err(e) => Err(e),
            };
        }
        Ok(self.list()?.into_iter().find(|d| d.name == id_or_name))
    }

    /// Destroy a droplet.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Network`] on API failure.
    fn destroy(&self, id: u64) -> Result<(), Error>;

    /// Region slugs the account can deploy to.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Network`] on API failure.
    fn regions(&self) -> Result<Vec<String>, Error>;

    /// Poll until the droplet is active with a public IP.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] when the readiness budget elapses.
    fn wait_ready(&self, id: u64, timeout: Duration) -> Result<DropletInfo, Error> {
        let deadline = Instant::now() + timeout;
        loop {
            let info = self.get(id)?;
            if info.status == "active" && info.public_ip.is_some() {
                return Ok(info);
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout {
                    operation: format!("droplet {id} readiness"),
                    seconds: timeout.as_secs(),
                });
            }
            std::thread::sleep(Duration::from_secs(5));
        }
    }
}

/// Resolve the droplet API token: CLI flag, `DIGITALOCEAN_API_TOKEN`,
/// project `.env`, then the global config file.
#[must_use]
pub fn resolve_api_token(
    flag: Option<&str>,
    project_root: Option<&std::path::Path>,
) -> Option<SecretString> {
    // Same chain as the DNS token minus the DNS-specific variable.
    if let Some(token) = flag {
        return Some(SecretString::new(token.to_string()));
    }
    if let Ok(token) = std::env::var("DIGITALOCEAN_API_TOKEN") {
        if !token.trim().is_empty() {
            return Some(SecretString::new(token));
        }
    }
    super::dns::resolve_dns_token(None, project_root)
}

/// DigitalOcean droplet provider.
pub struct DigitalOceanDroplets {
    token: SecretString,
    api_base: String,
    http: reqwest::blocking::Client,
}

#[derive(Debug, Deserialize)]
struct ApiNetwork {
    ip_address: String,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct ApiNetworks {
    #[serde(default)]
    v4: Vec<ApiNetwork>,
}

#[derive(Debug, Deserialize)]
struct ApiRegion {
    slug: String,
    #[serde(default)]
    available: bool,
}

#[derive(Debug, Deserialize)]
struct ApiDroplet {
    id: u64,
    name: String,
    status: String,
    #[serde(default)]
    networks: Option<ApiNetworks>,
    region: ApiRegion,
    vpc_uuid: Option<String>,
}

impl From<ApiDroplet> for DropletInfo {
    fn from(value: ApiDroplet) -> Self {
        let networks = value.networks.unwrap_or(ApiNetworks { v4: Vec::new() });
        let ip_of = |kind: &str| {
            networks
                .v4
                .iter()
                .find(|n| n.kind == kind)
                .map(|n| n.ip_address.clone())
        };
        Self {
            id: value.id,
            name: value.name,
            status: value.status,
            region: value.region.slug,
            public_ip: ip_of("public"),
            private_ip: ip_of("private"),
            vpc_uuid: value.vpc_uuid,
        }
    }
}

impl DigitalOceanDroplets {
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
            .timeout(Duration::from_secs(60))
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
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::not_found("droplet"));
        }
        if status.is_success() {
            Ok(response)
        } else {
            let body = response.text().unwrap_or_default();
            Err(Error::network(format!(
                "droplet API request failed with {status}: {body}"
            )))
        }
    }
}

impl DropletProvider for DigitalOceanDroplets {
    fn provider_name(&self) -> &'static str {
        "digitalocean"
    }

    fn create(&self, request: &CreateDropletRequest) -> Result<DropletInfo, Error> {
        #[derive(Deserialize)]
        struct Response {
            droplet: ApiDroplet,
        }
        let mut body = serde_json::json!({
            "name": request.name,
            "region": request.region,
            "size": request.size,
            "image": request.image,
            "ssh_keys": request.ssh_keys,
        });
        if let Some(vpc) = &request.vpc_uuid {
            body["vpc_uuid"] = serde_json::json!(vpc);
        }
        let response = self
            .http
            .post(self.url("/droplets"))
            .bearer_auth(self.token.expose_secret())
            .json(&body)
            .send()?;
        let parsed: Response = Self::check(response)?.json()?;
        Ok(parsed.droplet.into())
    }

    fn list(&self) -> Result<Vec<DropletInfo>, Error> {
        #[derive(Deserialize)]
        struct Response {
            droplets: Vec<ApiDroplet>,
        }
        let response = self
            .http
            .get(self.url("/droplets?per_page=200"))
            .bearer_auth(self.token.expose_secret())
            .send()?;
        let parsed: Response = Self::check(response)?.json()?;
        Ok(parsed.droplets.into_iter().map(Into::into).collect())
    }

    fn get(&self, id: u64) -> Result<DropletInfo, Error> {
        #[derive(Deserialize)]
        struct Response {
            droplet: ApiDroplet,
        }
        let response = self
            .http
            .get(self.url(&format!("/droplets/{id}")))
            .bearer_auth(self.token.expose_secret())
            .send()?;
        let parsed: Response = Self::check(response)?.json()?;
        Ok(parsed.droplet.into())
    }

    fn destroy(&self, id: u64) -> Result<(), Error> {
        let response = self
            .http
            .delete(self.url(&format!("/droplets/{id}")))
            .bearer_auth(self.token.expose_secret())
            .send()?;
        Self::check(response).map(|_| ())
    }

    fn regions(&self) -> Result<Vec<String>, Error> {
        #[derive(Deserialize)]
        struct Response {
            regions: Vec<ApiRegion>,
        }
        let response = self
            .http
            .get(self.url("/regions?per_page=200"))
            .bearer_auth(self.token.expose_secret())
            .send()?;
        let parsed: Response = Self::check(response)?.json()?;
        Ok(parsed
            .regions
            .into_iter()
            .filter(|r| r.available)
            .map(|r| r.slug)
            .collect())
    }
}

/// Default readiness budget.
#[must_use]
pub const fn readiness_timeout() -> Duration {
    timeouts::DROPLET_READY
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_droplet_maps_public_and_private_ips() {
        let raw = serde_json::json!({
            "id": 42,
            "name": "worker-1",
            "status": "active",
            "networks": {"v4": [
                {"ip_address": "10.10.0.5", "type": "private"},
                {"ip_address": "203.0.113.10", "type": "public"}
            ]},
            "region": {"slug": "nyc3", "available": true},
            "vpc_uuid": "vpc-1234"
        });
        let droplet: ApiDroplet = serde_json::from_value(raw).unwrap();
        let info = DropletInfo::from(droplet);
        assert_eq!(info.public_ip.as_deref(), Some("203.0.113.10"));
        assert_eq!(info.private_ip.as_deref(), Some("10.10.0.5"));
        assert_eq!(info.vpc_uuid.as_deref(), Some("vpc-1234"));
    }

    #[test]
    fn defaults_fall_back_when_env_is_unset() {
        // Values depend on the ambient environment; assert the fallbacks
        // only when the variables are absent.
        if std::env::var("DROPLET_DEFAULT_REGION").is_err() {
            assert_eq!(DropletDefaults::from_env().region, "nyc3");
        }
    }
}
