//! Client for the proxy's live configuration endpoint.

use std::time::Duration;

use crate::error::Error;

/// Default admin endpoint published by the global proxy container.
pub const DEFAULT_ADMIN_URL: &str = "http://127.0.0.1:2019";

/// Blocking client for the proxy admin API.
#[derive(Debug)]
pub struct ProxyAdminClient {
    base_url: String,
    http: reqwest::blocking::Client,
}

impl ProxyAdminClient {
    /// Build a client for an admin endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Network`] when the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>) -> Result<Self, Error> {
        let http = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::network(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into(),
            http,
        })
    }

    /// Upload a full configuration to the live-config endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PreconditionFailed`] when the proxy is not
    /// reachable (it must be running before configuration is produced) and
    /// [`Error::Runtime`] when the proxy rejects the configuration.
    pub fn load_config(&self, config: &serde_json::Value) -> Result<(), Error> {
        let url = format!("{}/load", self.base_url.trim_end_matches('/'));
        let response = self.http.post(&url).json(config).send().map_err(|e| {
            if e.is_connect() {
                Error::precondition(
                    "proxy admin endpoint is not reachable; start the proxy first",
                )
            } else {
                Error::from(e)
            }
        })?;

        let status = response.status();
        if status.is_success() {
            tracing::debug!("proxy configuration uploaded");
            return Ok(());
        }
        let body = response.text().unwrap_or_default();
        Err(Error::Runtime {
            tool: "caddy-admin".to_string(),
            exit_code: None,
            stderr: format!("config upload failed with {status}: {body}"),
        })
    }

    /// Fetch the currently loaded configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Network`] on transport failure.
    pub fn current_config(&self) -> Result<serde_json::Value, Error> {
        let url = format!("{}/config/", self.base_url.trim_end_matches('/'));
        let response = self.http.get(&url).send()?;
        Ok(response.json()?)
    }

    /// Returns `true` when the admin endpoint answers.
    #[must_use]
    pub fn is_reachable(&self) -> bool {
        let url = format!("{}/config/", self.base_url.trim_end_matches('/'));
        self.http.get(&url).send().is_ok()
    }
}
