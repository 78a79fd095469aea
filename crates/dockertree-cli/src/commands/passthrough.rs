//! `<branch> <compose args...>` passthrough.
//!
//! The first token is the branch; everything after it goes to the
//! declarative stack tool with the worktree's compose variant, env file,
//! and stack name filled in. `up`/`down` route through the orchestrator so
//! network setup and state rules apply; everything else streams through.

use dockertree_core::error::Error;
use dockertree_core::paths::ProjectContext;
use dockertree_core::proxy::ProxyCoordinator;
use dockertree_core::runtime::compose::worktree_invocation;

use super::{CmdResult, Project};

/// Run a passthrough command.
pub fn run(args: &[String], json: bool) -> CmdResult {
    let operation = "worktree.compose";
    let Some((branch, compose_args)) = args.split_first() else {
        let err = Error::validation("missing branch name");
        return CmdResult::err(operation, &err, json);
    };
    if compose_args.is_empty() {
        let err = Error::validation(format!(
            "no command given for worktree '{branch}' (try: dockertree {branch} up -d)"
        ));
        return CmdResult::err(operation, &err, json);
    }

    let project = match Project::open() {
        Ok(project) => project,
        Err(err) => return CmdResult::err(operation, &err, json),
    };
    let orchestrator = project.orchestrator();

    let result = match compose_args[0].as_str() {
        "up" => {
            let detach = compose_args.iter().any(|a| a == "-d" || a == "--detach");
            // The proxy must be up before routes can be served.
            let mut coordinator =
                match ProxyCoordinator::new(orchestrator.runtime(), orchestrator.config()) {
                    Ok(coordinator) => coordinator,
                    Err(err) => return CmdResult::err(operation, &err, json),
                };
            match coordinator.is_running() {
                Ok(false) => {
                    if let Err(err) = coordinator.start() {
                        return CmdResult::err(operation, &err, json);
                    }
                },
                Ok(true) => {},
                Err(err) => return CmdResult::err(operation, &err, json),
            }
            orchestrator.start(branch, detach).map(|status| {
                // Containers are up; route them.
                if let Err(err) = coordinator.refresh_routes() {
                    tracing::warn!(error = %err, "route refresh failed");
                }
                if !json {
                    println!("Worktree '{branch}' running at http://{}", status.domain);
                }
                serde_json::to_value(&status).unwrap_or_default()
            })
        },
        "down" => orchestrator.stop(branch).map(|status| {
            if !json {
                println!("Worktree '{branch}' stopped");
            }
            serde_json::to_value(&status).unwrap_or_default()
        }),
        "ps" => {
            let entry = orchestrator
                .git()
                .find_worktree(branch)
                .and_then(|e| e.ok_or_else(|| missing(branch)));
            entry.and_then(|entry| {
                let invocation = worktree_invocation(
                    &entry.path,
                    ProjectContext::compose_worktree_path(&entry.path),
                    orchestrator.config().stack_name(branch),
                );
                let output = orchestrator.runtime().stack_ps(&invocation)?;
                if !json {
                    print!("{output}");
                }
                Ok(serde_json::json!({ "output": output }))
            })
        },
        // exec, logs, run, build, restart, and any other compose
        // subcommand stream straight through.
        _ => {
            let entry = orchestrator
                .git()
                .find_worktree(branch)
                .and_then(|e| e.ok_or_else(|| missing(branch)));
            entry.and_then(|entry| {
                let invocation = worktree_invocation(
                    &entry.path,
                    ProjectContext::compose_worktree_path(&entry.path),
                    orchestrator.config().stack_name(branch),
                );
                orchestrator
                    .runtime()
                    .stack_passthrough(&invocation, compose_args)?;
                Ok(serde_json::json!({}))
            })
        },
    };

    match result {
        Ok(data) => CmdResult::ok(operation, data),
        Err(err) => CmdResult::err(operation, &err, json),
    }
}

fn missing(branch: &str) -> Error {
    Error::not_found(format!("worktree for branch '{branch}' (create it first)"))
}
