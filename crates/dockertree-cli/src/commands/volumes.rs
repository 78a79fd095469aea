//! `volumes {list,size,backup,restore,clean}`.

use std::path::{Path, PathBuf};

use dockertree_core::error::Error;
use dockertree_core::volumes::VolumeCloner;

use super::{with_project, CmdResult};

/// List branch-scoped volumes across all worktrees.
pub fn list(json: bool) -> CmdResult {
    with_project("volumes.list", json, |project| {
        let prefix = format!("{}-", project.config.slug());
        let volumes = project.runtime.volume_list(&prefix)?;
        if !json {
            if volumes.is_empty() {
                println!("No worktree volumes");
            }
            for volume in &volumes {
                println!("{volume}");
            }
        }
        Ok(serde_json::json!({ "volumes": volumes }))
    })
}

/// Show the size of each branch-scoped volume.
pub fn size(json: bool) -> CmdResult {
    with_project("volumes.size", json, |project| {
        let prefix = format!("{}-", project.config.slug());
        let mut sizes = serde_json::Map::new();
        for volume in project.runtime.volume_list(&prefix)? {
            let size = project
                .runtime
                .volume_size(&volume)
                .unwrap_or_else(|_| "unknown".to_string());
            if !json {
                println!("{size:>10}  {volume}");
            }
            sizes.insert(volume, serde_json::Value::String(size));
        }
        Ok(serde_json::Value::Object(sizes))
    })
}

/// Back up a worktree's volumes into tar.gz archives.
pub fn backup(branch: &str, output_dir: Option<PathBuf>, json: bool) -> CmdResult {
    with_project("volumes.backup", json, |project| {
        let out = output_dir.unwrap_or_else(|| project.ctx.outer_root.join("volume-backups"));
        let cloner = VolumeCloner::new(&project.runtime, &project.config);
        let mut archives = Vec::new();
        for declared in &project.config.volumes {
            let volume = project.config.volume_name(branch, declared);
            if !project.runtime.volume_exists(&volume)? {
                tracing::warn!(volume = %volume, "volume missing, skipping");
                continue;
            }
            let archive = cloner.backup(&volume, &out)?;
            if !json {
                println!("Backed up {volume} -> {}", archive.display());
            }
            archives.push(archive);
        }
        if archives.is_empty() {
            return Err(Error::not_found(format!(
                "volumes for branch '{branch}'"
            )));
        }
        Ok(serde_json::json!({ "archives": archives }))
    })
}

/// Restore one worktree volume from an archive.
pub fn restore(branch: &str, file: &Path, json: bool) -> CmdResult {
    with_project("volumes.restore", json, |project| {
        // The archive name carries the volume it came from: either a
        // declared name (package archives) or an already-prefixed one
        // (volume backups).
        let stem = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let stem = stem.trim_end_matches(".tar.gz");
        let volume = if project.config.volumes.iter().any(|v| v == stem) {
            project.config.volume_name(branch, stem)
        } else {
            stem.to_string()
        };
        let cloner = VolumeCloner::new(&project.runtime, &project.config);
        cloner.restore(&volume, file)?;
        if !json {
            println!("Restored {volume} from {}", file.display());
        }
        Ok(serde_json::json!({ "volume": volume }))
    })
}

/// Remove a worktree's volumes.
pub fn clean(branch: &str, json: bool) -> CmdResult {
    with_project("volumes.clean", json, |project| {
        let stack = project.config.stack_name(branch);
        let cloner = VolumeCloner::new(&project.runtime, &project.config);
        let removed = cloner.remove_stack_volumes(&stack)?;
        if !json {
            for volume in &removed {
                println!("Removed {volume}");
            }
            if removed.is_empty() {
                println!("No volumes to remove for '{branch}'");
            }
        }
        Ok(serde_json::json!({ "removed": removed }))
    })
}
