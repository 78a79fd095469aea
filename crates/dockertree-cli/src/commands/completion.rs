//! `completion {install,uninstall,status}` and the hidden `_completion`
//! helper consumed by shell scripts.

use dockertree_core::error::Error;

use super::{CmdResult, Project};

const MARKER_BEGIN: &str = "# >>> dockertree completion >>>";
const MARKER_END: &str = "# <<< dockertree completion <<<";

const BASH_SNIPPET: &str = r#"_dockertree_complete() {
    local cur="${COMP_WORDS[COMP_CWORD]}"
    if [ "$COMP_CWORD" -eq 1 ]; then
        COMPREPLY=( $(compgen -W "$(dockertree _completion worktrees 2>/dev/null) setup create remove delete list prune start-proxy stop-proxy volumes packages droplet completion" -- "$cur") )
    fi
}
complete -F _dockertree_complete dockertree"#;

fn rc_file(shell: &str) -> Result<std::path::PathBuf, Error> {
    let home = std::env::var_os("HOME")
        .map(std::path::PathBuf::from)
        .ok_or_else(|| Error::precondition("HOME is not set"))?;
    match shell {
        "bash" => Ok(home.join(".bashrc")),
        "zsh" => Ok(home.join(".zshrc")),
        other => Err(Error::validation(format!(
            "unsupported shell '{other}' (bash and zsh are supported)"
        ))),
    }
}

fn detect_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .and_then(|s| s.rsplit('/').next().map(ToString::to_string))
        .unwrap_or_else(|| "bash".to_string())
}

/// Install the completion snippet into the shell rc file.
pub fn install(shell: Option<&str>, json: bool) -> CmdResult {
    let operation = "completion.install";
    let shell = shell.map_or_else(detect_shell, ToString::to_string);
    let result = (|| -> Result<serde_json::Value, Error> {
        let rc = rc_file(&shell)?;
        let current = std::fs::read_to_string(&rc).unwrap_or_default();
        if current.contains(MARKER_BEGIN) {
            if !json {
                println!("Completion already installed in {}", rc.display());
            }
            return Ok(serde_json::json!({ "rc_file": rc, "installed": true }));
        }
        let mut updated = current;
        if !updated.is_empty() && !updated.ends_with('\n') {
            updated.push('\n');
        }
        updated.push_str(&format!("{MARKER_BEGIN}\n{BASH_SNIPPET}\n{MARKER_END}\n"));
        std::fs::write(&rc, updated)
            .map_err(|e| Error::io(format!("failed to write {}", rc.display()), e))?;
        if !json {
            println!("Installed completion into {} (restart your shell)", rc.display());
        }
        Ok(serde_json::json!({ "rc_file": rc, "installed": true }))
    })();
    match result {
        Ok(data) => CmdResult::ok(operation, data),
        Err(err) => CmdResult::err(operation, &err, json),
    }
}

/// Remove the completion snippet.
pub fn uninstall(json: bool) -> CmdResult {
    let operation = "completion.uninstall";
    let result = (|| -> Result<serde_json::Value, Error> {
        let rc = rc_file(&detect_shell())?;
        let current = std::fs::read_to_string(&rc).unwrap_or_default();
        let Some(begin) = current.find(MARKER_BEGIN) else {
            if !json {
                println!("Completion is not installed");
            }
            return Ok(serde_json::json!({ "installed": false }));
        };
        let end = current
            .find(MARKER_END)
            .map_or(current.len(), |i| i + MARKER_END.len());
        let mut updated = String::new();
        updated.push_str(current[..begin].trim_end_matches('\n'));
        updated.push('\n');
        updated.push_str(current[end..].trim_start_matches('\n'));
        std::fs::write(&rc, updated)
            .map_err(|e| Error::io(format!("failed to write {}", rc.display()), e))?;
        if !json {
            println!("Removed completion from {}", rc.display());
        }
        Ok(serde_json::json!({ "installed": false }))
    })();
    match result {
        Ok(data) => CmdResult::ok(operation, data),
        Err(err) => CmdResult::err(operation, &err, json),
    }
}

/// Show whether completion is installed.
pub fn status(json: bool) -> CmdResult {
    let operation = "completion.status";
    let shell = detect_shell();
    let result = rc_file(&shell).map(|rc| {
        let installed = std::fs::read_to_string(&rc)
            .map(|c| c.contains(MARKER_BEGIN))
            .unwrap_or(false);
        if !json {
            println!(
                "Completion for {shell}: {}",
                if installed { "installed" } else { "not installed" }
            );
        }
        serde_json::json!({ "shell": shell, "installed": installed })
    });
    match result {
        Ok(data) => CmdResult::ok(operation, data),
        Err(err) => CmdResult::err(operation, &err, json),
    }
}

/// Hidden helper: print completion candidates, one per line.
pub fn helper(kind: &str) -> CmdResult {
    let operation = "completion.helper";
    let result = (|| -> Result<serde_json::Value, Error> {
        let candidates: Vec<String> = match kind {
            "worktrees" => {
                let project = Project::open()?;
                let orchestrator = project.orchestrator();
                orchestrator
                    .list()?
                    .into_iter()
                    .map(|s| s.branch)
                    .collect()
            },
            "git" => {
                let project = Project::open()?;
                let orchestrator = project.orchestrator();
                orchestrator.git().list_branches()?
            },
            "services" => {
                let project = Project::open()?;
                project.config.services.keys().cloned().collect()
            },
            other => {
                return Err(Error::validation(format!(
                    "unknown completion kind '{other}'"
                )));
            },
        };
        for candidate in &candidates {
            println!("{candidate}");
        }
        Ok(serde_json::json!(candidates))
    })();
    match result {
        Ok(data) => CmdResult::ok(operation, data),
        // Completion helpers must stay silent on error for shell UX.
        Err(_) => CmdResult::ok(operation, serde_json::json!([])),
    }
}
