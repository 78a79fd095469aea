//! End-to-end deployment of a worktree to a remote host.
//!
//! The pipeline resolves the target, optionally provisions a droplet and a
//! DNS record, prepares the server, exports a package, transfers it, runs
//! the bracketed remote import, and persists the push state so later
//! `--code-only` pushes can reuse it. The pipeline halts at the first hard
//! failure; re-invocation is safe up to and including the transfer.

pub mod dns;
pub mod droplet;
pub mod scripts;
pub mod target;
pub mod transfer;

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

use crate::envgen::EnvFile;
use crate::error::Error;
use crate::orchestrator::WorktreeOrchestrator;
use crate::package::{ExportOptions, PackageManager};
use crate::paths::{ExecutionContext, ProjectContext};
use crate::vcs::GitAdapter;

pub use dns::{DigitalOceanDns, DnsOutcome, DnsProvider};
pub use droplet::{
    CreateDropletRequest, DigitalOceanDroplets, DropletDefaults, DropletInfo, DropletProvider,
};
pub use target::{resolve_target, HostResolver, ScpTarget, SystemResolver};
pub use transfer::SshSession;

/// Budget for the remote import step.
const REMOTE_IMPORT_TIMEOUT: Duration = Duration::from_secs(1200);

/// Budget for server preparation.
const SERVER_PREP_TIMEOUT: Duration = Duration::from_secs(900);

/// Options for `droplet push`.
#[derive(Debug, Clone, Default)]
pub struct PushOptions {
    /// Branch to push; defaults to the current worktree's branch.
    pub branch: Option<String>,
    /// Target string; defaults to the persisted `PUSH_SCP_TARGET`.
    pub target: Option<String>,
    /// Transfer only the code delta.
    pub code_only: bool,
    /// Domain for the deployment (TLS on). Mutually exclusive with `ip`.
    pub domain: Option<String>,
    /// IP for the deployment (TLS off). Mutually exclusive with `domain`.
    pub ip: Option<String>,
    /// Run the server preparation script first.
    pub prepare_server: bool,
    /// Run the remote import after transfer (default true).
    pub auto_import: bool,
    /// DNS API token flag (start of the resolution chain).
    pub dns_token: Option<String>,
    /// Droplet API token flag.
    pub api_token: Option<String>,
    /// Reuse this central droplet's VPC and point worker db/cache at it.
    pub central_droplet_name: Option<String>,
    /// SSH identity file.
    pub ssh_key: Option<String>,
}

/// Result of a push.
#[derive(Debug, Clone, Serialize)]
pub struct PushReport {
    /// Branch that was pushed.
    pub branch: String,
    /// Canonical resolved target.
    pub target: String,
    /// Local package path (absent on code-only pushes).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub package: Option<PathBuf>,
    /// Remote file the package landed at.
    pub remote_file: String,
    /// DNS outcome when a domain was supplied.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns: Option<String>,
    /// Whether the remote import ran.
    pub imported: bool,
}

/// Drives the push pipeline over an orchestrator.
pub struct PushPipeline<'a> {
    orchestrator: &'a WorktreeOrchestrator,
}

impl<'a> PushPipeline<'a> {
    /// Build a pipeline over an orchestrator.
    #[must_use]
    pub const fn new(orchestrator: &'a WorktreeOrchestrator) -> Self {
        Self { orchestrator }
    }

    /// Run the full push.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for conflicting options and the
    /// failing step's error otherwise.
    pub fn push(&self, options: &PushOptions) -> Result<PushReport, Error> {
        if options.domain.is_some() && options.ip.is_some() {
            return Err(Error::validation(
                "--domain and --ip are mutually exclusive",
            ));
        }

        let branch = self.resolve_branch(options)?;
        let worktree = self
            .orchestrator
            .git()
            .find_worktree(&branch)?
            .ok_or_else(|| Error::not_found(format!("worktree for branch '{branch}'")))?;
        let env_path = ProjectContext::env_file_path(&worktree.path);

        // Step 1: target resolution (IP literal -> DNS -> droplet).
        let project_root = self.orchestrator.context().outer_root.clone();
        let api_token = droplet::resolve_api_token(options.api_token.as_deref(), Some(&project_root));
        let droplet_provider: Option<DigitalOceanDroplets> = match api_token {
            Some(token) => Some(DigitalOceanDroplets::new(token)?),
            None => None,
        };

        let target_input = match &options.target {
            Some(target) => target.clone(),
            None => {
                let env = EnvFile::load(&env_path)?;
                env.get("PUSH_SCP_TARGET")
                    .map(ToString::to_string)
                    .ok_or_else(|| {
                        Error::validation(
                            "no push target given and no previous push recorded for this worktree",
                        )
                    })?
            },
        };
        let target = match &droplet_provider {
            Some(provider) => {
                target::resolve_target(&target_input, &SystemResolver::with_droplets(provider))?
            },
            None => target::resolve_target(&target_input, &SystemResolver::new())?,
        };
        let session = SshSession::new(target.clone(), options.ssh_key.clone());

        if options.code_only {
            return self.push_code_only(&branch, &worktree.path, session, options);
        }

        // Step 2 (VPC mode): point worker db/cache at the central droplet.
        if let Some(central) = &options.central_droplet_name {
            let provider = droplet_provider.as_ref().ok_or_else(|| {
                Error::precondition("central droplet lookup requires an API token")
            })?;
            let info = provider
                .find(central)?
                .ok_or_else(|| Error::not_found(format!("central droplet '{central}'")))?;
            let private_ip = info.private_ip.ok_or_else(|| {
                Error::precondition(format!("central droplet '{central}' has no private IP"))
            })?;
            let mut env = EnvFile::load(&env_path)?;
            env.set("DB_HOST", &private_ip);
            env.set("REDIS_HOST", &private_ip);
            env.store(&env_path)?;
            tracing::info!(central = %central, ip = %private_ip, "worker configured for VPC mode");

            let vpc = self.orchestrator.config().vpc.clone().unwrap_or_default();
            if vpc.auto_configure_firewall {
                let central_public = info.public_ip.ok_or_else(|| {
                    Error::precondition(format!(
                        "central droplet '{central}' has no public IP for firewall setup"
                    ))
                })?;
                let cidr = vpc_cidr(&private_ip);
                let central_session = SshSession::new(
                    ScpTarget {
                        user: "root".to_string(),
                        host: central_public,
                        path: "/root".to_string(),
                    },
                    options.ssh_key.clone(),
                );
                tracing::info!(cidr = %cidr, "restricting central db/cache ingress to the VPC");
                central_session.exec(&scripts::vpc_firewall_script(&cidr), SERVER_PREP_TIMEOUT)?;
            }
        }

        // Step 3: DNS management.
        let mut dns_outcome = None;
        if let Some(domain) = &options.domain {
            let token = dns::resolve_dns_token(options.dns_token.as_deref(), Some(&project_root))
                .ok_or_else(|| {
                    Error::precondition(
                        "a DNS token is required for --domain (flag, environment, .env, or global config)",
                    )
                })?;
            let provider = DigitalOceanDns::new(token)?;
            let outcome = dns::ensure_a_record(&provider, domain, &target.host)?;
            dns_outcome = Some(format!("{outcome:?}").to_lowercase());
        }

        // Step 4: server preparation.
        if options.prepare_server {
            tracing::info!(target = %target, "preparing server");
            session.exec(scripts::SERVER_PREP_SCRIPT, SERVER_PREP_TIMEOUT)?;
        }

        // Step 5: export.
        let package_manager = PackageManager::new(self.orchestrator);
        let export = package_manager.export(
            &branch,
            &ExportOptions {
                include_code: true,
                output_dir: None,
                skip_volumes: false,
            },
        )?;

        // Step 6: transfer.
        let remote_file = session.copy_file(&export.package_path)?;

        // Step 7: remote import.
        let mut imported = false;
        if options.auto_import {
            tracing::info!(target = %target, "running remote import");
            let script = scripts::remote_import_script(
                &remote_file,
                &branch,
                options.domain.as_deref(),
                options.ip.as_deref(),
            );
            session.exec(&script, REMOTE_IMPORT_TIMEOUT)?;
            imported = true;
        }

        // Step 8: persist push state for later code-only pushes.
        self.persist_push_state(&env_path, &branch, &target, options)?;

        Ok(PushReport {
            branch,
            target: target.to_string(),
            package: Some(export.package_path),
            remote_file,
            dns: dns_outcome,
            imported,
        })
    }

    /// Code-only fast path: ship just the code delta and restart the
    /// remote stack. Safe to retry at any point.
    fn push_code_only(
        &self,
        branch: &str,
        worktree_path: &std::path::Path,
        session: SshSession,
        options: &PushOptions,
    ) -> Result<PushReport, Error> {
        let git = self.orchestrator.git();
        let config = self.orchestrator.config();

        // Volume-based code (a declared volume carries the tree) ships the
        // volume archive; bind-mounted code ships a VCS archive.
        let code_volume = config
            .volumes
            .iter()
            .find(|v| v.to_lowercase().contains("code"))
            .cloned();

        let staging = tempfile::tempdir()
            .map_err(|e| Error::io("failed to create code staging directory", e))?;
        let archive = match &code_volume {
            Some(volume) => {
                let cloner =
                    crate::volumes::VolumeCloner::new(self.orchestrator.runtime(), config);
                cloner.backup(&config.volume_name(branch, volume), staging.path())?
            },
            None => {
                let path = staging.path().join(format!("{branch}-code.tar"));
                git.archive(branch, &path)?;
                path
            },
        };

        let remote_file = session.copy_file(&archive)?;
        let script = scripts::remote_code_update_script(&remote_file, branch);
        session.exec(&script, REMOTE_IMPORT_TIMEOUT)?;

        let env_path = ProjectContext::env_file_path(worktree_path);
        self.persist_push_state(&env_path, branch, session.target(), options)?;

        Ok(PushReport {
            branch: branch.to_string(),
            target: session.target().to_string(),
            package: None,
            remote_file,
            dns: None,
            imported: true,
        })
    }

    fn resolve_branch(&self, options: &PushOptions) -> Result<String, Error> {
        if let Some(branch) = &options.branch {
            return Ok(branch.clone());
        }
        if let ExecutionContext::WorktreeLocal { branch } = &self.orchestrator.context().context {
            return Ok(branch.clone());
        }
        let git = GitAdapter::new(&self.orchestrator.context().outer_root);
        git.current_branch()?.ok_or_else(|| {
            Error::validation("no branch given and none detectable from the working directory")
        })
    }

    fn persist_push_state(
        &self,
        env_path: &std::path::Path,
        branch: &str,
        target: &ScpTarget,
        options: &PushOptions,
    ) -> Result<(), Error> {
        let mut env = EnvFile::load(env_path)?;
        env.set("PUSH_SCP_TARGET", target.to_string());
        env.set("PUSH_BRANCH_NAME", branch);
        match (&options.domain, &options.ip) {
            (Some(domain), _) => {
                env.set("PUSH_DOMAIN", domain);
                env.remove("PUSH_IP");
                crate::envgen::apply_domain_override(&mut env, domain);
            },
            (None, Some(ip)) => {
                env.set("PUSH_IP", ip);
                env.remove("PUSH_DOMAIN");
                crate::envgen::apply_ip_override(&mut env, ip);
            },
            (None, None) => {},
        }
        env.store(env_path)
    }
}

/// /16 network containing a VPC-private address, the range firewall rules
/// admit.
fn vpc_cidr(private_ip: &str) -> String {
    let mut octets = private_ip.split('.');
    let a = octets.next().unwrap_or("10");
    let b = octets.next().unwrap_or("0");
    format!("{a}.{b}.0.0/16")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vpc_cidr_is_the_enclosing_slash_16() {
        assert_eq!(vpc_cidr("10.116.0.3"), "10.116.0.0/16");
        assert_eq!(vpc_cidr("172.16.4.9"), "172.16.0.0/16");
    }
}
