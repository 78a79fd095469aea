//! Worktree lifecycle commands: create, remove, delete, list, prune.

use dockertree_core::error::Error;
use dockertree_core::pattern;

use super::{with_project, CmdResult, Project};

/// Create an isolated worktree for a branch.
pub fn create(branch: &str, json: bool) -> CmdResult {
    with_project("worktree.create", json, |project| {
        let orchestrator = project.orchestrator();
        let status = orchestrator.create(branch)?;
        if !json {
            println!("Created worktree for '{branch}' at {}", status.path.display());
            println!("Start it with: dockertree {branch} up -d");
        }
        Ok(serde_json::to_value(&status).unwrap_or_default())
    })
}

/// Remove worktrees matching a branch or pattern, keeping branches.
pub fn remove(pattern: &str, force: bool, json: bool) -> CmdResult {
    bulk("worktree.remove", pattern, false, force, json)
}

/// Remove worktrees matching a branch or pattern and delete the branches.
pub fn delete(pattern: &str, force: bool, json: bool) -> CmdResult {
    bulk("worktree.delete", pattern, true, force, json)
}

fn bulk(operation: &str, pat: &str, delete_branch: bool, force: bool, json: bool) -> CmdResult {
    let project = match Project::open() {
        Ok(project) => project,
        Err(err) => return CmdResult::err(operation, &err, json),
    };
    let orchestrator = project.orchestrator();

    // Exact names skip matching so error messages stay precise.
    if !pattern::has_wildcard(pat) {
        let result = if delete_branch {
            orchestrator.delete(pat, force).map(|r| {
                serde_json::to_value(&r).unwrap_or_default()
            })
        } else {
            orchestrator.remove(pat).map(|r| {
                serde_json::to_value(&r).unwrap_or_default()
            })
        };
        return match result {
            Ok(data) => {
                if !json {
                    println!("Removed '{pat}'");
                }
                CmdResult::ok(operation, data)
            },
            Err(err) => CmdResult::err(operation, &err, json),
        };
    }

    // Pattern form: collect, print, confirm (unless forced), run.
    let matched = match orchestrator.matching_branches(pat) {
        Ok(matched) => matched,
        Err(err) => return CmdResult::err(operation, &err, json),
    };
    if matched.is_empty() {
        let err = Error::not_found(format!("no worktree branches match '{pat}'"));
        return CmdResult::err(operation, &err, json);
    }
    if !json {
        println!("Branches matching '{pat}':");
        for branch in &matched {
            println!("  {branch}");
        }
    }
    if !force && !json && !confirm(&format!("{} {} worktree(s)?", verb(delete_branch), matched.len()))
    {
        let err = Error::Cancelled;
        return CmdResult::err(operation, &err, json);
    }

    let results = match orchestrator.bulk(pat, delete_branch, force) {
        Ok(results) => results,
        Err(err) => return CmdResult::err(operation, &err, json),
    };
    let failed = results.iter().filter(|r| !r.success).count();
    let data = serde_json::to_value(&results).unwrap_or_default();
    if !json {
        for item in &results {
            if item.success {
                println!("  ok   {}", item.branch);
            } else {
                println!(
                    "  fail {}: {}",
                    item.branch,
                    item.error.as_deref().unwrap_or("unknown")
                );
            }
        }
    }
    if failed > 0 {
        let err = Error::validation(format!("{failed} of {} item(s) failed", results.len()));
        CmdResult::err_with_data(operation, &err, data, json)
    } else {
        CmdResult::ok(operation, data)
    }
}

const fn verb(delete_branch: bool) -> &'static str {
    if delete_branch {
        "delete"
    } else {
        "remove"
    }
}

fn confirm(prompt: &str) -> bool {
    use std::io::Write;
    print!("{prompt} [y/N] ");
    let _ = std::io::stdout().flush();
    let mut line = String::new();
    if std::io::stdin().read_line(&mut line).is_err() {
        return false;
    }
    matches!(line.trim(), "y" | "Y" | "yes")
}

/// List all worktrees with their stack state.
pub fn list(json: bool) -> CmdResult {
    with_project("worktree.list", json, |project| {
        let orchestrator = project.orchestrator();
        let worktrees = orchestrator.list()?;
        if !json {
            if worktrees.is_empty() {
                println!("No worktrees (create one with: dockertree create <branch>)");
            }
            for status in &worktrees {
                println!(
                    "{:<30} {:<8} {}",
                    status.branch,
                    format!("{:?}", status.state).to_lowercase(),
                    status.domain
                );
            }
        }
        Ok(serde_json::to_value(&worktrees).unwrap_or_default())
    })
}

/// Drop stale worktree metadata.
pub fn prune(json: bool) -> CmdResult {
    with_project("worktree.prune", json, |project| {
        let orchestrator = project.orchestrator();
        orchestrator.prune()?;
        if !json {
            println!("Pruned stale worktree metadata");
        }
        Ok(serde_json::json!({}))
    })
}
