//! `setup` and `clean-legacy`.

use dockertree_core::setup::SetupManager;

use super::CmdResult;

/// Initialize the project in the current directory.
pub fn run(project_name: Option<&str>, force: bool, json: bool) -> CmdResult {
    let operation = "setup";
    let cwd = match std::env::current_dir() {
        Ok(cwd) => cwd,
        Err(e) => {
            let err = dockertree_core::error::Error::io("failed to read cwd", e);
            return CmdResult::err(operation, &err, json);
        },
    };

    match SetupManager::new(&cwd).run(project_name, force) {
        Ok(report) => {
            if !json {
                if report.already_initialized {
                    println!(
                        "Project '{}' is already set up (use --force to regenerate)",
                        report.project_name
                    );
                } else {
                    println!("Initialized dockertree project '{}'", report.project_name);
                    if report.created_minimal_compose {
                        println!("Wrote a minimal docker-compose.yml (web + db + redis)");
                    }
                    println!("Next: dockertree create <branch>");
                }
            }
            CmdResult::ok(
                operation,
                serde_json::to_value(&report).unwrap_or_default(),
            )
        },
        Err(err) => CmdResult::err(operation, &err, json),
    }
}

/// Regenerate the worktree compose variant.
pub fn clean_legacy(json: bool) -> CmdResult {
    let operation = "clean-legacy";
    let result = std::env::current_dir()
        .map_err(|e| dockertree_core::error::Error::io("failed to read cwd", e))
        .and_then(|cwd| {
            let ctx = dockertree_core::paths::ProjectContext::discover(&cwd)?;
            SetupManager::new(&ctx.outer_root).clean_legacy()
        });
    match result {
        Ok(()) => {
            if !json {
                println!("Worktree compose variant regenerated");
            }
            CmdResult::ok(operation, serde_json::json!({}))
        },
        Err(err) => CmdResult::err(operation, &err, json),
    }
}
