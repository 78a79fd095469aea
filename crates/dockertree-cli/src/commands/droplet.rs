//! `droplet {create,push,list,info,destroy,regions}`.

use clap::Subcommand;
use dockertree_core::error::Error;
use dockertree_core::push::droplet::{
    readiness_timeout, resolve_api_token, CreateDropletRequest, DigitalOceanDroplets,
    DropletDefaults, DropletProvider,
};
use dockertree_core::push::{PushOptions, PushPipeline};

use super::{with_project, CmdResult, Project};

/// Droplet provisioning and push deployment.
#[derive(Subcommand, Debug)]
pub enum DropletCommands {
    /// Create a droplet and optionally push a branch to it
    Create {
        /// Branch to push after creation
        branch: Option<String>,
        /// Only create the droplet, do not push
        #[arg(long)]
        create_only: bool,
        /// Explicit SCP target to push to instead of the new droplet
        #[arg(long)]
        scp_target: Option<String>,
        /// Domain for the deployment
        #[arg(long, conflicts_with = "ip")]
        domain: Option<String>,
        /// IP for the deployment
        #[arg(long)]
        ip: Option<String>,
        /// Run the server preparation script
        #[arg(long)]
        prepare_server: bool,
        /// Skip the remote import
        #[arg(long)]
        no_auto_import: bool,
        /// Reuse this central droplet's VPC
        #[arg(long)]
        central_droplet_name: Option<String>,
        /// Droplet region
        #[arg(long)]
        region: Option<String>,
        /// Droplet size
        #[arg(long)]
        size: Option<String>,
        /// Droplet image
        #[arg(long)]
        image: Option<String>,
        /// SSH key ids or fingerprints (comma separated)
        #[arg(long)]
        ssh_keys: Option<String>,
        /// Droplet API token
        #[arg(long)]
        api_token: Option<String>,
        /// DNS API token
        #[arg(long)]
        dns_token: Option<String>,
        /// Wait for the droplet to become ready even with --create-only
        #[arg(long)]
        wait: bool,
    },
    /// Push a worktree to a remote host
    Push {
        /// Branch (defaults to the current worktree's branch)
        branch: Option<String>,
        /// Push target (user@host:/path, host, IP, or droplet name)
        target: Option<String>,
        /// Transfer only the code delta
        #[arg(long)]
        code_only: bool,
        /// Domain for the deployment
        #[arg(long, conflicts_with = "ip")]
        domain: Option<String>,
        /// IP for the deployment
        #[arg(long)]
        ip: Option<String>,
        /// Run the server preparation script
        #[arg(long)]
        prepare_server: bool,
        /// Skip the remote import
        #[arg(long)]
        no_auto_import: bool,
        /// Reuse this central droplet's VPC
        #[arg(long)]
        central_droplet_name: Option<String>,
        /// Droplet API token
        #[arg(long)]
        api_token: Option<String>,
        /// DNS API token
        #[arg(long)]
        dns_token: Option<String>,
    },
    /// List droplets
    List {
        /// Droplet API token
        #[arg(long)]
        api_token: Option<String>,
    },
    /// Show one droplet
    Info {
        /// Droplet id or name
        id: String,
        /// Droplet API token
        #[arg(long)]
        api_token: Option<String>,
    },
    /// Destroy droplets
    Destroy {
        /// Comma-separated droplet ids
        ids: String,
        /// Droplet API token
        #[arg(long)]
        api_token: Option<String>,
    },
    /// List available regions
    Regions {
        /// Droplet API token
        #[arg(long)]
        api_token: Option<String>,
    },
}

/// Dispatch a droplet subcommand.
pub fn run(cmd: DropletCommands, json: bool) -> CmdResult {
    match cmd {
        DropletCommands::Create {
            branch,
            create_only,
            scp_target,
            domain,
            ip,
            prepare_server,
            no_auto_import,
            central_droplet_name,
            region,
            size,
            image,
            ssh_keys,
            api_token,
            dns_token,
            wait,
        } => create(CreateArgs {
            branch,
            create_only,
            scp_target,
            domain,
            ip,
            prepare_server,
            no_auto_import,
            central_droplet_name,
            region,
            size,
            image,
            ssh_keys,
            api_token,
            dns_token,
            wait,
            json,
        }),
        DropletCommands::Push {
            branch,
            target,
            code_only,
            domain,
            ip,
            prepare_server,
            no_auto_import,
            central_droplet_name,
            api_token,
            dns_token,
        } => push(
            PushOptions {
                branch,
                target,
                code_only,
                domain,
                ip,
                prepare_server,
                auto_import: !no_auto_import,
                dns_token,
                api_token,
                central_droplet_name,
                ssh_key: None,
            },
            json,
        ),
        DropletCommands::List { api_token } => {
            provider_op("droplet.list", api_token.as_deref(), json, |provider| {
                let droplets = provider.list()?;
                if !json {
                    for droplet in &droplets {
                        println!(
                            "{:<12} {:<24} {:<10} {}",
                            droplet.id,
                            droplet.name,
                            droplet.status,
                            droplet.public_ip.as_deref().unwrap_or("-")
                        );
                    }
                }
                Ok(serde_json::to_value(&droplets).unwrap_or_default())
            })
        },
        DropletCommands::Info { id, api_token } => {
            provider_op("droplet.info", api_token.as_deref(), json, |provider| {
                let info = provider
                    .find(&id)?
                    .ok_or_else(|| Error::not_found(format!("droplet '{id}'")))?;
                if !json {
                    println!("{:<12} {:<24} {:<10}", info.id, info.name, info.status);
                    println!("  public:  {}", info.public_ip.as_deref().unwrap_or("-"));
                    println!("  private: {}", info.private_ip.as_deref().unwrap_or("-"));
                    println!("  region:  {}", info.region);
                }
                Ok(serde_json::to_value(&info).unwrap_or_default())
            })
        },
        DropletCommands::Destroy { ids, api_token } => {
            provider_op("droplet.destroy", api_token.as_deref(), json, |provider| {
                let mut destroyed = Vec::new();
                for raw in ids.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                    let id: u64 = raw.parse().map_err(|_| {
                        Error::validation(format!("invalid droplet id '{raw}'"))
                    })?;
                    provider.destroy(id)?;
                    if !json {
                        println!("Destroyed droplet {id}");
                    }
                    destroyed.push(id);
                }
                Ok(serde_json::json!({ "destroyed": destroyed }))
            })
        },
        DropletCommands::Regions { api_token } => {
            provider_op("droplet.regions", api_token.as_deref(), json, |provider| {
                let regions = provider.regions()?;
                if !json {
                    for region in &regions {
                        println!("{region}");
                    }
                }
                Ok(serde_json::json!({ "regions": regions }))
            })
        },
    }
}

struct CreateArgs {
    branch: Option<String>,
    create_only: bool,
    scp_target: Option<String>,
    domain: Option<String>,
    ip: Option<String>,
    prepare_server: bool,
    no_auto_import: bool,
    central_droplet_name: Option<String>,
    region: Option<String>,
    size: Option<String>,
    image: Option<String>,
    ssh_keys: Option<String>,
    api_token: Option<String>,
    dns_token: Option<String>,
    wait: bool,
    json: bool,
}

fn create(args: CreateArgs) -> CmdResult {
    let operation = "droplet.create";
    let json = args.json;
    let result = (|| -> Result<serde_json::Value, Error> {
        let provider = open_provider(args.api_token.as_deref())?;
        let defaults = DropletDefaults::from_env();

        let name = args
            .branch
            .clone()
            .map(|b| format!("dockertree-{b}"))
            .unwrap_or_else(|| "dockertree".to_string());

        // VPC mode: attach the new droplet to the central droplet's VPC.
        let vpc_uuid = match &args.central_droplet_name {
            Some(central) => {
                let info = provider
                    .find(central)?
                    .ok_or_else(|| Error::not_found(format!("central droplet '{central}'")))?;
                info.vpc_uuid
            },
            None => None,
        };

        let request = CreateDropletRequest {
            name,
            region: args.region.clone().unwrap_or(defaults.region),
            size: args.size.clone().unwrap_or(defaults.size),
            image: args.image.clone().unwrap_or(defaults.image),
            ssh_keys: args
                .ssh_keys
                .as_deref()
                .map(|v| v.split(',').map(|k| k.trim().to_string()).collect())
                .unwrap_or(defaults.ssh_keys),
            vpc_uuid,
        };
        let created = provider.create(&request)?;
        if !json {
            println!("Created droplet {} ({})", created.name, created.id);
        }

        let needs_ip = !args.create_only || args.wait;
        let ready = if needs_ip {
            let info = provider.wait_ready(created.id, readiness_timeout())?;
            if !json {
                println!(
                    "Droplet ready at {}",
                    info.public_ip.as_deref().unwrap_or("-")
                );
            }
            info
        } else {
            created
        };

        if args.create_only {
            return Ok(serde_json::to_value(&ready).unwrap_or_default());
        }

        let target = match args.scp_target.clone() {
            Some(target) => target,
            None => {
                let ip = ready.public_ip.clone().ok_or_else(|| {
                    Error::precondition("droplet has no public IP to push to")
                })?;
                format!("root@{ip}:/root")
            },
        };

        let project = Project::open()?;
        let orchestrator = project.orchestrator();
        let pipeline = PushPipeline::new(&orchestrator);
        let report = pipeline.push(&PushOptions {
            branch: args.branch,
            target: Some(target),
            code_only: false,
            domain: args.domain,
            ip: args.ip,
            prepare_server: args.prepare_server,
            auto_import: !args.no_auto_import,
            dns_token: args.dns_token,
            api_token: args.api_token,
            central_droplet_name: args.central_droplet_name,
            ssh_key: None,
        })?;
        if !json {
            println!("Pushed '{}' to {}", report.branch, report.target);
        }
        Ok(serde_json::json!({
            "droplet": ready,
            "push": report,
        }))
    })();

    match result {
        Ok(data) => CmdResult::ok(operation, data),
        Err(err) => CmdResult::err(operation, &err, json),
    }
}

fn push(options: PushOptions, json: bool) -> CmdResult {
    with_project("droplet.push", json, move |project| {
        let orchestrator = project.orchestrator();
        let pipeline = PushPipeline::new(&orchestrator);
        let report = pipeline.push(&options)?;
        if !json {
            println!("Pushed '{}' to {}", report.branch, report.target);
            if let Some(dns) = &report.dns {
                println!("  DNS: {dns}");
            }
            if report.imported {
                println!("  remote import: done");
            }
        }
        Ok(serde_json::to_value(&report).unwrap_or_default())
    })
}

fn open_provider(flag: Option<&str>) -> Result<DigitalOceanDroplets, Error> {
    let project_root = std::env::current_dir().ok();
    let token = resolve_api_token(flag, project_root.as_deref()).ok_or_else(|| {
        Error::precondition(
            "a droplet API token is required (flag, DIGITALOCEAN_API_TOKEN, .env, or global config)",
        )
    })?;
    DigitalOceanDroplets::new(token)
}

fn provider_op(
    operation: &str,
    api_token: Option<&str>,
    json: bool,
    f: impl FnOnce(&DigitalOceanDroplets) -> Result<serde_json::Value, Error>,
) -> CmdResult {
    match open_provider(api_token).and_then(|provider| f(&provider)) {
        Ok(data) => CmdResult::ok(operation, data),
        Err(err) => CmdResult::err(operation, &err, json),
    }
}
