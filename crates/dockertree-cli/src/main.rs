//! dockertree - isolated per-branch development environments.
//!
//! CLI over the dockertree core: worktree lifecycle, proxy management,
//! volumes, packages, and remote deployment.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

mod commands;

use commands::CmdResult;

/// dockertree - isolated per-branch development environments
#[derive(Parser, Debug)]
#[command(name = "dockertree")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Emit structured JSON output
    #[arg(long, global = true)]
    json: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    // === Setup ===
    /// Initialize .dockertree/ for this project
    Setup {
        /// Project name (defaults to the directory name)
        #[arg(long)]
        project_name: Option<String>,

        /// Overwrite existing configuration
        #[arg(long)]
        force: bool,

        /// Accepted for compatibility; application-level patching is not
        /// performed
        #[arg(long, hide = true)]
        monkey_patch: bool,
    },

    // === Proxy ===
    /// Start the global reverse proxy
    #[command(alias = "start")]
    StartProxy,

    /// Stop the global reverse proxy
    #[command(alias = "stop")]
    StopProxy,

    // === Worktree lifecycle ===
    /// Create an isolated worktree for a branch
    Create {
        /// Branch name
        branch: String,
    },

    /// Remove worktree(s), keeping the branch(es)
    Remove {
        /// Branch name or glob pattern (*, ?, [...])
        pattern: String,

        /// Skip confirmation and override safety checks
        #[arg(long)]
        force: bool,
    },

    /// Remove worktree(s) and delete the branch(es)
    Delete {
        /// Branch name or glob pattern (*, ?, [...])
        pattern: String,

        /// Delete protected or unmerged branches too
        #[arg(long)]
        force: bool,
    },

    /// Remove every worktree, keeping branches
    RemoveAll {
        /// Skip confirmation
        #[arg(long)]
        force: bool,
    },

    /// Remove every worktree and delete the branches
    DeleteAll {
        /// Skip confirmation and delete unmerged branches
        #[arg(long)]
        force: bool,
    },

    /// List worktrees with their stack state
    List,

    /// Drop stale worktree metadata
    Prune,

    /// Regenerate the worktree compose variant from the project stack file
    CleanLegacy,

    // === Volumes ===
    /// Volume operations
    #[command(subcommand)]
    Volumes(VolumeCommands),

    // === Packages ===
    /// Package export/import
    #[command(subcommand)]
    Packages(PackageCommands),

    // === Deployment ===
    /// Droplet provisioning and push deployment
    #[command(subcommand)]
    Droplet(commands::droplet::DropletCommands),

    // === Completion ===
    /// Shell completion management
    #[command(subcommand)]
    Completion(CompletionCommands),

    /// Completion helper used by shell scripts
    #[command(name = "_completion", hide = true)]
    CompletionHelper {
        /// What to complete (worktrees, git, services)
        kind: String,
    },

    /// `<branch> <compose args...>` passthrough (up, down, exec, logs, ...)
    #[command(external_subcommand)]
    Passthrough(Vec<String>),
}

#[derive(Subcommand, Debug)]
enum VolumeCommands {
    /// List branch-scoped volumes
    List,
    /// Show volume sizes
    Size,
    /// Back up a worktree's volumes to tar.gz archives
    Backup {
        /// Branch name
        branch: String,
        /// Output directory (defaults to ./volume-backups)
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },
    /// Restore a worktree volume from an archive
    Restore {
        /// Branch name
        branch: String,
        /// Archive file (<volume>.tar.gz)
        file: PathBuf,
    },
    /// Remove a worktree's volumes
    Clean {
        /// Branch name
        branch: String,
    },
}

#[derive(Subcommand, Debug)]
enum PackageCommands {
    /// Export a worktree into a package
    Export {
        /// Branch name
        branch: String,
        /// Output directory
        #[arg(long)]
        output_dir: Option<PathBuf>,
        /// Include a code archive
        #[arg(long = "include-code", overrides_with = "no_code")]
        include_code: bool,
        /// Exclude the code archive (default)
        #[arg(long = "no-code")]
        no_code: bool,
        /// Compress the package (default; kept for compatibility)
        #[arg(long)]
        compressed: bool,
    },
    /// Import a package
    Import {
        /// Package file
        file: PathBuf,
        /// Import as this branch instead of the packaged one
        #[arg(long)]
        target_branch: Option<String>,
        /// Restore volume data (default)
        #[arg(long = "restore-data", overrides_with = "no_data")]
        restore_data: bool,
        /// Skip volume data
        #[arg(long = "no-data")]
        no_data: bool,
        /// Force standalone mode
        #[arg(long)]
        standalone: bool,
        /// Extraction directory for standalone imports
        #[arg(long)]
        target_dir: Option<PathBuf>,
        /// Domain override (enables TLS)
        #[arg(long, conflicts_with = "ip")]
        domain: Option<String>,
        /// IP override (HTTP only)
        #[arg(long)]
        ip: Option<String>,
    },
    /// List packages in a directory
    List {
        /// Directory to scan (defaults to the project root)
        #[arg(long)]
        package_dir: Option<PathBuf>,
    },
    /// Verify a package's manifest
    Validate {
        /// Package file
        file: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
enum CompletionCommands {
    /// Install shell completion
    Install {
        /// Shell (bash, zsh, fish); detected when omitted
        shell: Option<String>,
    },
    /// Remove installed completion
    Uninstall,
    /// Show completion installation state
    Status,
}

fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();

    let json = cli.json;
    let result = dispatch(cli);

    if json {
        match serde_json::to_string_pretty(&result.output) {
            Ok(rendered) => println!("{rendered}"),
            Err(err) => eprintln!("failed to render JSON output: {err}"),
        }
    }
    std::process::exit(result.exit);
}

fn dispatch(cli: Cli) -> CmdResult {
    let json = cli.json;
    match cli.command {
        Commands::Setup {
            project_name,
            force,
            monkey_patch: _,
        } => commands::setup::run(project_name.as_deref(), force, json),
        Commands::StartProxy => commands::proxy::start(json),
        Commands::StopProxy => commands::proxy::stop(json),
        Commands::Create { branch } => commands::worktree::create(&branch, json),
        Commands::Remove { pattern, force } => {
            commands::worktree::remove(&pattern, force, json)
        },
        Commands::Delete { pattern, force } => {
            commands::worktree::delete(&pattern, force, json)
        },
        Commands::RemoveAll { force } => commands::worktree::remove("*", force, json),
        Commands::DeleteAll { force } => commands::worktree::delete("*", force, json),
        Commands::List => commands::worktree::list(json),
        Commands::Prune => commands::worktree::prune(json),
        Commands::CleanLegacy => commands::setup::clean_legacy(json),
        Commands::Volumes(cmd) => match cmd {
            VolumeCommands::List => commands::volumes::list(json),
            VolumeCommands::Size => commands::volumes::size(json),
            VolumeCommands::Backup { branch, output_dir } => {
                commands::volumes::backup(&branch, output_dir, json)
            },
            VolumeCommands::Restore { branch, file } => {
                commands::volumes::restore(&branch, &file, json)
            },
            VolumeCommands::Clean { branch } => commands::volumes::clean(&branch, json),
        },
        Commands::Packages(cmd) => match cmd {
            PackageCommands::Export {
                branch,
                output_dir,
                include_code,
                no_code: _,
                compressed: _,
            } => commands::packages::export(&branch, output_dir, include_code, json),
            PackageCommands::Import {
                file,
                target_branch,
                restore_data: _,
                no_data,
                standalone,
                target_dir,
                domain,
                ip,
            } => commands::packages::import(commands::packages::ImportArgs {
                file,
                target_branch,
                restore_data: !no_data,
                standalone,
                target_dir,
                domain,
                ip,
                json,
            }),
            PackageCommands::List { package_dir } => commands::packages::list(package_dir, json),
            PackageCommands::Validate { file } => commands::packages::validate(&file, json),
        },
        Commands::Droplet(cmd) => commands::droplet::run(cmd, json),
        Commands::Completion(cmd) => match cmd {
            CompletionCommands::Install { shell } => {
                commands::completion::install(shell.as_deref(), json)
            },
            CompletionCommands::Uninstall => commands::completion::uninstall(json),
            CompletionCommands::Status => commands::completion::status(json),
        },
        Commands::CompletionHelper { kind } => commands::completion::helper(&kind),
        Commands::Passthrough(args) => commands::passthrough::run(&args, json),
    }
}
