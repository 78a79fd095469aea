//! Global proxy lifecycle and route coordination.
//!
//! One proxy container serves every worktree. It is the only process
//! publishing host ports 80/443; worktree services stay unpublished and are
//! reached through label-based routing on the shared external network.

pub mod admin;
pub mod routes;

use crate::config::ProjectConfig;
use crate::error::Error;
use crate::runtime::{timeouts, DockerRuntime};

pub use admin::{ProxyAdminClient, DEFAULT_ADMIN_URL};
pub use routes::{RateLimitState, RouteTarget};

/// Name of the global proxy container.
pub const PROXY_CONTAINER: &str = "dockertree_caddy_proxy";

/// Image run for the global proxy.
const PROXY_IMAGE: &str = "caddy:2";

/// Shared proxy volumes (certificates and config survive restarts).
const PROXY_VOLUMES: &[(&str, &str)] = &[("caddy_data", "/data"), ("caddy_config", "/config")];

/// Starts, stops, and configures the global proxy.
pub struct ProxyCoordinator<'a> {
    runtime: &'a DockerRuntime,
    network: String,
    admin: ProxyAdminClient,
    rate_limits: RateLimitState,
}

impl<'a> ProxyCoordinator<'a> {
    /// Build a coordinator for a project's proxy network.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Network`] when the admin client cannot be built.
    pub fn new(runtime: &'a DockerRuntime, config: &ProjectConfig) -> Result<Self, Error> {
        Ok(Self {
            runtime,
            network: config.caddy_network.clone(),
            admin: ProxyAdminClient::new(DEFAULT_ADMIN_URL)?,
            rate_limits: RateLimitState::new(),
        })
    }

    /// Returns `true` when the proxy container is running.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Runtime`] when the runtime cannot be queried.
    pub fn is_running(&self) -> Result<bool, Error> {
        self.runtime.container_running(PROXY_CONTAINER)
    }

    /// Start the global proxy: ensure the shared network, run (or restart)
    /// the container, and push an initial route configuration. Returns
    /// the number of routes configured.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Runtime`] on runtime failure.
    pub fn start(&mut self) -> Result<usize, Error> {
        self.runtime.ensure_network(&self.network)?;

        if self.is_running()? {
            tracing::info!("proxy already running");
        } else if self.runtime.container_exists(PROXY_CONTAINER)? {
            tracing::info!("starting existing proxy container");
            self.runtime
                .docker_raw(&["start", PROXY_CONTAINER], timeouts::DEFAULT)?;
        } else {
            tracing::info!("creating proxy container");
            let mut args: Vec<String> = vec![
                "run".into(),
                "-d".into(),
                "--name".into(),
                PROXY_CONTAINER.into(),
                "--restart".into(),
                "unless-stopped".into(),
                "--network".into(),
                self.network.clone(),
                "-p".into(),
                "80:80".into(),
                "-p".into(),
                "443:443".into(),
                "-p".into(),
                "127.0.0.1:2019:2019".into(),
            ];
            for (volume, mount) in PROXY_VOLUMES {
                self.runtime.volume_create(volume)?;
                args.push("-v".into());
                args.push(format!("{volume}:{mount}"));
            }
            args.push(PROXY_IMAGE.into());
            let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
            self.runtime.docker_raw(&arg_refs, timeouts::STACK_UP)?;
        }

        self.wait_for_admin()?;
        self.refresh_routes()
    }

    /// Stop and remove the proxy container. Shared volumes are kept so
    /// issued certificates survive.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Runtime`] on runtime failure.
    pub fn stop(&self) -> Result<(), Error> {
        if !self.runtime.container_exists(PROXY_CONTAINER)? {
            tracing::info!("proxy is not running");
            return Ok(());
        }
        self.runtime
            .docker_raw(&["stop", PROXY_CONTAINER], timeouts::DEFAULT)?;
        self.runtime.container_remove(PROXY_CONTAINER)?;
        tracing::info!("proxy stopped");
        Ok(())
    }

    /// Discover labeled containers and upload a fresh routing
    /// configuration. The proxy must be running.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PreconditionFailed`] when the proxy is down and
    /// [`Error::Runtime`] when the upload is rejected.
    pub fn refresh_routes(&mut self) -> Result<usize, Error> {
        if !self.is_running()? {
            return Err(Error::precondition(
                "proxy is not running; start it before configuring routes",
            ));
        }
        self.rate_limits.sweep();
        let targets = routes::discover_targets(self.runtime)?;
        let acme_email = std::env::var("CADDY_EMAIL").ok();
        let config = routes::build_config(&targets, acme_email.as_deref(), &self.rate_limits);

        match self.admin.load_config(&config) {
            Ok(()) => {},
            Err(Error::Runtime { stderr, .. }) if routes::is_rate_limit_response(&stderr) => {
                // Flip every domain target onto the staging issuer and
                // retry, so HTTPS keeps answering with untrusted chains.
                let domains: Vec<String> = targets
                    .iter()
                    .map(|t| t.hostname.clone())
                    .filter(|h| routes::is_domain(h))
                    .collect();
                self.rate_limits.mark(&domains);
                let fallback =
                    routes::build_config(&targets, acme_email.as_deref(), &self.rate_limits);
                self.admin.load_config(&fallback)?;
            },
            Err(err) => return Err(err),
        }

        tracing::info!(routes = targets.len(), "proxy routes configured");
        Ok(targets.len())
    }

    /// Watch the runtime: refresh routes every `interval` until the token
    /// is cancelled. Discovery failures are logged and retried so a
    /// transient runtime hiccup does not kill the watcher.
    pub fn watch(
        &mut self,
        interval: std::time::Duration,
        cancel: &crate::orchestrator::CancellationToken,
    ) {
        tracing::info!(interval_secs = interval.as_secs(), "route watcher started");
        while !cancel.is_cancelled() {
            if let Err(err) = self.refresh_routes() {
                tracing::warn!(error = %err, "route refresh failed, will retry");
            }
            std::thread::sleep(interval);
        }
        tracing::info!("route watcher stopped");
    }

    /// Access the rate-limit state (used by tests and diagnostics).
    #[must_use]
    pub const fn rate_limits(&self) -> &RateLimitState {
        &self.rate_limits
    }

    fn wait_for_admin(&self) -> Result<(), Error> {
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(15);
        while std::time::Instant::now() < deadline {
            if self.admin.is_reachable() {
                return Ok(());
            }
            std::thread::sleep(std::time::Duration::from_millis(250));
        }
        Err(Error::Timeout {
            operation: "proxy admin endpoint readiness".to_string(),
            seconds: 15,
        })
    }
}
