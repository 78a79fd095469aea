//! Request/response types and framing for the RPC surface.
//!
//! The server speaks length-framed JSON over a Unix socket: a 4-byte
//! big-endian length prefix followed by one JSON document. Responses reuse
//! the [`crate::output::CommandOutput`] envelope, so the RPC surface and
//! `--json` CLI output share one schema.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Maximum accepted frame size (16 MB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// One RPC request. Every variant carries a mandatory absolute
/// `working_directory`; the server validates it contains a project before
/// any mutating operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum IpcRequest {
    /// Initialize a project.
    Setup {
        working_directory: PathBuf,
        #[serde(default)]
        project_name: Option<String>,
        #[serde(default)]
        force: bool,
    },
    /// List worktrees.
    ListWorktrees { working_directory: PathBuf },
    /// Status of one worktree.
    WorktreeStatus {
        working_directory: PathBuf,
        branch: String,
    },
    /// Create a worktree.
    CreateWorktree {
        working_directory: PathBuf,
        branch: String,
    },
    /// Start a worktree's stack.
    StartWorktree {
        working_directory: PathBuf,
        branch: String,
    },
    /// Stop a worktree's stack.
    StopWorktree {
        working_directory: PathBuf,
        branch: String,
    },
    /// Remove a worktree, keeping the branch.
    RemoveWorktree {
        working_directory: PathBuf,
        branch: String,
    },
    /// Remove a worktree and delete its branch.
    DeleteWorktree {
        working_directory: PathBuf,
        branch: String,
        #[serde(default)]
        force: bool,
    },
    /// Export a package.
    ExportPackage {
        working_directory: PathBuf,
        branch: String,
        #[serde(default)]
        include_code: bool,
        #[serde(default)]
        output_dir: Option<PathBuf>,
    },
    /// Import a package.
    ImportPackage {
        working_directory: PathBuf,
        package: PathBuf,
        #[serde(default)]
        target_branch: Option<String>,
        #[serde(default = "default_true")]
        restore_data: bool,
    },
    /// Validate a package's manifest.
    ValidatePackage {
        working_directory: PathBuf,
        package: PathBuf,
    },
}

fn default_true() -> bool {
    true
}

impl IpcRequest {
    /// The working directory the request targets.
    #[must_use]
    pub fn working_directory(&self) -> &PathBuf {
        match self {
            Self::Setup {
                working_directory, ..
            }
            | Self::ListWorktrees { working_directory }
            | Self::WorktreeStatus {
                working_directory, ..
            }
            | Self::CreateWorktree {
                working_directory, ..
            }
            | Self::StartWorktree {
                working_directory, ..
            }
            | Self::StopWorktree {
                working_directory, ..
            }
            | Self::RemoveWorktree {
                working_directory, ..
            }
            | Self::DeleteWorktree {
                working_directory, ..
            }
            | Self::ExportPackage {
                working_directory, ..
            }
            | Self::ImportPackage {
                working_directory, ..
            }
            | Self::ValidatePackage {
                working_directory, ..
            } => working_directory,
        }
    }

    /// Returns `true` when the request changes state, requiring an
    /// initialized project at the working directory.
    #[must_use]
    pub const fn is_mutating(&self) -> bool {
        !matches!(
            self,
            Self::Setup { .. }
                | Self::ListWorktrees { .. }
                | Self::WorktreeStatus { .. }
                | Self::ValidatePackage { .. }
        )
    }

    /// Operation name used in the response envelope.
    #[must_use]
    pub const fn operation(&self) -> &'static str {
        match self {
            Self::Setup { .. } => "setup",
            Self::ListWorktrees { .. } => "worktree.list",
            Self::WorktreeStatus { .. } => "worktree.status",
            Self::CreateWorktree { .. } => "worktree.create",
            Self::StartWorktree { .. } => "worktree.start",
            Self::StopWorktree { .. } => "worktree.stop",
            Self::RemoveWorktree { .. } => "worktree.remove",
            Self::DeleteWorktree { .. } => "worktree.delete",
            Self::ExportPackage { .. } => "packages.export",
            Self::ImportPackage { .. } => "packages.import",
            Self::ValidatePackage { .. } => "packages.validate",
        }
    }
}

/// Frame a JSON document for the wire.
#[must_use]
pub fn frame_message(payload: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(payload.len() + 4);
    framed.extend_from_slice(&u32::try_from(payload.len()).unwrap_or(u32::MAX).to_be_bytes());
    framed.extend_from_slice(payload);
    framed
}

/// Parse a frame length prefix.
///
/// # Errors
///
/// Returns [`Error::Validation`] for oversized frames.
pub fn parse_frame_length(prefix: [u8; 4]) -> Result<usize, Error> {
    let length = u32::from_be_bytes(prefix) as usize;
    if length > MAX_FRAME_SIZE {
        return Err(Error::validation(format!(
            "frame of {length} bytes exceeds the {MAX_FRAME_SIZE} byte limit"
        )));
    }
    Ok(length)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_roundtrip_through_json() {
        let request = IpcRequest::CreateWorktree {
            working_directory: PathBuf::from("/work/project"),
            branch: "feature-auth".to_string(),
        };
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"op\":\"create_worktree\""));
        let back: IpcRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.working_directory(), &PathBuf::from("/work/project"));
        assert_eq!(back.operation(), "worktree.create");
    }

    #[test]
    fn mutating_classification() {
        let list = IpcRequest::ListWorktrees {
            working_directory: PathBuf::from("/p"),
        };
        assert!(!list.is_mutating());
        let create = IpcRequest::CreateWorktree {
            working_directory: PathBuf::from("/p"),
            branch: "b".to_string(),
        };
        assert!(create.is_mutating());
    }

    #[test]
    fn frames_carry_a_length_prefix() {
        let framed = frame_message(b"{}");
        assert_eq!(framed.len(), 6);
        let mut prefix = [0u8; 4];
        prefix.copy_from_slice(&framed[..4]);
        assert_eq!(parse_frame_length(prefix).unwrap(), 2);
    }

    #[test]
    fn oversized_frames_are_rejected() {
        let prefix = u32::MAX.to_be_bytes();
        assert!(parse_frame_length(prefix).is_err());
    }
}
