//! `packages {export,import,list,validate}`.

use std::path::{Path, PathBuf};

use dockertree_core::package::{self, ExportOptions, ImportOptions, PackageManager};

use super::{with_project, CmdResult};

/// Export a worktree into a package.
pub fn export(branch: &str, output_dir: Option<PathBuf>, include_code: bool, json: bool) -> CmdResult {
    with_project("packages.export", json, |project| {
        let orchestrator = project.orchestrator();
        let manager = PackageManager::new(&orchestrator);
        let report = manager.export(
            branch,
            &ExportOptions {
                include_code,
                output_dir,
                skip_volumes: false,
            },
        )?;
        if !json {
            println!("Exported {}", report.package_path.display());
            println!(
                "  volumes: {}  code: {}",
                report.volumes.len(),
                if report.include_code { "yes" } else { "no" }
            );
        }
        Ok(serde_json::to_value(&report).unwrap_or_default())
    })
}

/// Arguments for `packages import`.
pub struct ImportArgs {
    pub file: PathBuf,
    pub target_branch: Option<String>,
    pub restore_data: bool,
    pub standalone: bool,
    pub target_dir: Option<PathBuf>,
    pub domain: Option<String>,
    pub ip: Option<String>,
    pub json: bool,
}

/// Import a package, auto-detecting the mode.
///
/// Outside a project (a bare server, an empty directory) only standalone
/// mode is possible, and it needs no project discovery.
pub fn import(args: ImportArgs) -> CmdResult {
    let operation = "packages.import";
    let json = args.json;
    let options = ImportOptions {
        target_branch: args.target_branch,
        restore_data: args.restore_data,
        standalone: args.standalone.then_some(true),
        target_dir: args.target_dir,
        domain: args.domain,
        ip: args.ip,
    };

    let result = match super::Project::open() {
        Ok(project) => {
            let orchestrator = project.orchestrator();
            let manager = PackageManager::new(&orchestrator);
            manager.import(&args.file, &options)
        },
        // No project anywhere above the working directory: standalone.
        Err(dockertree_core::error::Error::NotFound { .. }) => {
            dockertree_core::runtime::DockerRuntime::new().and_then(|runtime| {
                let mut options = options;
                if options.target_dir.is_none() {
                    options.target_dir = std::env::current_dir().ok().map(|d| d.join("imported"));
                }
                package::import_standalone(&runtime, &args.file, &options)
            })
        },
        Err(err) => Err(err),
    };

    match result {
        Ok(report) => {
            if !json {
                if report.standalone {
                    println!(
                        "Imported standalone project into {}",
                        report.path.display()
                    );
                } else {
                    println!("Imported worktree '{}'", report.branch);
                }
                println!("Start it with: dockertree {} up -d", report.branch);
            }
            CmdResult::ok(operation, serde_json::to_value(&report).unwrap_or_default())
        },
        Err(err) => CmdResult::err(operation, &err, json),
    }
}

/// List packages in a directory.
pub fn list(package_dir: Option<PathBuf>, json: bool) -> CmdResult {
    with_project("packages.list", json, |project| {
        let dir = package_dir.unwrap_or_else(|| project.ctx.outer_root.clone());
        let entries = package::list_packages(&dir)?;
        if !json {
            if entries.is_empty() {
                println!("No packages in {}", dir.display());
            }
            for entry in &entries {
                println!(
                    "{:<50} {:>10}  {}",
                    entry
                        .path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                    human_size(entry.size_bytes),
                    entry.branch.as_deref().unwrap_or("?")
                );
            }
        }
        Ok(serde_json::to_value(&entries).unwrap_or_default())
    })
}

/// Validate a package's manifest without importing it.
pub fn validate(file: &Path, json: bool) -> CmdResult {
    with_project("packages.validate", json, |project| {
        let orchestrator = project.orchestrator();
        let manager = PackageManager::new(&orchestrator);
        let metadata = manager.validate(file)?;
        if !json {
            println!("Package is valid");
            println!("  branch:  {}", metadata.branch_name);
            println!("  project: {}", metadata.project_name);
            println!("  volumes: {}", metadata.volumes.join(", "));
            println!("  code:    {}", if metadata.include_code { "yes" } else { "no" });
        }
        Ok(serde_json::to_value(&metadata).unwrap_or_default())
    })
}

fn human_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
