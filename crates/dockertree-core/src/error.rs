//! Typed errors shared by every dockertree component.
//!
//! All component boundaries return [`Error`]. Each variant corresponds to a
//! stable error code surfaced through `--json` output, and maps to a process
//! exit code at the CLI layer. Wrapped causes are preserved through
//! `#[source]` so diagnostics keep the full chain.

use thiserror::Error;

/// Errors emitted by dockertree operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Malformed branch name, protected branch, or conflicting flags.
    #[error("validation error: {reason}")]
    Validation {
        /// Why the input was rejected.
        reason: String,
    },

    /// No matching worktree, branch, volume, or DNS record.
    #[error("not found: {resource}")]
    NotFound {
        /// The missing resource, named for diagnostics.
        resource: String,
    },

    /// The target resource already exists.
    #[error("already exists: {resource}")]
    AlreadyExists {
        /// The conflicting resource.
        resource: String,
    },

    /// The environment is not in the state the operation requires.
    #[error("precondition failed: {reason}")]
    PreconditionFailed {
        /// Which precondition was violated.
        reason: String,
    },

    /// The source compose file is missing required structure.
    #[error("compose transform error: {reason}")]
    Transform {
        /// Why the transformation was refused.
        reason: String,
    },

    /// Volume cloning failed; the destination has been removed.
    #[error("volume copy failed for '{volume}': {reason}")]
    VolumeCopy {
        /// Destination volume name.
        volume: String,
        /// Why the copy failed.
        reason: String,
    },

    /// An external tool exited non-zero.
    #[error("external tool '{tool}' failed: {stderr}")]
    Runtime {
        /// The executable that failed (`docker`, `git`, `scp`, ...).
        tool: String,
        /// Exit code when the process terminated normally.
        exit_code: Option<i32>,
        /// Trailing lines of captured stderr.
        stderr: String,
    },

    /// Connectivity to a remote host or provider API failed.
    #[error("network error: {reason}")]
    Network {
        /// Transport-level failure description.
        reason: String,
    },

    /// Checksum mismatch, truncated archive, or corrupt metadata.
    #[error("integrity error: {reason}")]
    Integrity {
        /// What failed verification.
        reason: String,
    },

    /// The operation was cancelled by signal or caller.
    #[error("operation cancelled")]
    Cancelled,

    /// A bounded operation did not complete in time.
    #[error("{operation} timed out after {seconds}s")]
    Timeout {
        /// The operation that exceeded its budget.
        operation: String,
        /// The budget in seconds.
        seconds: u64,
    },

    /// Filesystem operation failed.
    #[error("I/O error: {context}")]
    Io {
        /// What was being done when the error occurred.
        context: String,
        /// Underlying cause.
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// Build a [`Error::Validation`].
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }

    /// Build a [`Error::NotFound`].
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    /// Build a [`Error::AlreadyExists`].
    pub fn already_exists(resource: impl Into<String>) -> Self {
        Self::AlreadyExists {
            resource: resource.into(),
        }
    }

    /// Build a [`Error::PreconditionFailed`].
    pub fn precondition(reason: impl Into<String>) -> Self {
        Self::PreconditionFailed {
            reason: reason.into(),
        }
    }

    /// Build a [`Error::Transform`].
    pub fn transform(reason: impl Into<String>) -> Self {
        Self::Transform {
            reason: reason.into(),
        }
    }

    /// Build a [`Error::VolumeCopy`].
    pub fn volume_copy(volume: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::VolumeCopy {
            volume: volume.into(),
            reason: reason.into(),
        }
    }

    /// Build a [`Error::Network`].
    pub fn network(reason: impl Into<String>) -> Self {
        Self::Network {
            reason: reason.into(),
        }
    }

    /// Build a [`Error::Integrity`].
    pub fn integrity(reason: impl Into<String>) -> Self {
        Self::Integrity {
            reason: reason.into(),
        }
    }

    /// Build a [`Error::Io`] with context naming the failed operation.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Stable machine-readable code for `--json` output.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation_error",
            Self::NotFound { .. } => "not_found",
            Self::AlreadyExists { .. } => "already_exists",
            Self::PreconditionFailed { .. } => "precondition_failed",
            Self::Transform { .. } => "transform_error",
            Self::VolumeCopy { .. } => "volume_copy_failed",
            Self::Runtime { .. } | Self::Io { .. } => "runtime_error",
            Self::Network { .. } => "network_error",
            Self::Integrity { .. } => "integrity_error",
            Self::Cancelled => "cancelled",
            Self::Timeout { .. } => "timeout",
        }
    }

    /// Process exit code for the CLI layer.
    ///
    /// `0` success, `1` expected failure, `2` misuse (handled by the
    /// argument parser), `3` external system failure, `4` cancelled,
    /// `5` integrity failure.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Validation { .. }
            | Self::NotFound { .. }
            | Self::AlreadyExists { .. }
            | Self::PreconditionFailed { .. }
            | Self::Transform { .. }
            | Self::VolumeCopy { .. } => 1,
            Self::Runtime { .. } | Self::Network { .. } | Self::Timeout { .. } | Self::Io { .. } => {
                3
            },
            Self::Cancelled => 4,
            Self::Integrity { .. } => 5,
        }
    }

    /// Structured detail payload for the `--json` error record.
    #[must_use]
    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            Self::Runtime {
                tool,
                exit_code,
                stderr,
            } => Some(serde_json::json!({
                "tool": tool,
                "exit_code": exit_code,
                "stderr": stderr,
            })),
            Self::VolumeCopy { volume, .. } => Some(serde_json::json!({ "volume": volume })),
            Self::Timeout { operation, seconds } => Some(serde_json::json!({
                "operation": operation,
                "timeout_seconds": seconds,
            })),
            _ => None,
        }
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(value: serde_yaml::Error) -> Self {
        Self::Transform {
            reason: value.to_string(),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        if value.is_timeout() {
            Self::Timeout {
                operation: "http request".to_string(),
                seconds: 0,
            }
        } else {
            Self::Network {
                reason: value.to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(Error::validation("x").code(), "validation_error");
        assert_eq!(Error::not_found("x").code(), "not_found");
        assert_eq!(Error::integrity("x").code(), "integrity_error");
        assert_eq!(Error::Cancelled.code(), "cancelled");
    }

    #[test]
    fn exit_codes_follow_the_contract() {
        assert_eq!(Error::validation("x").exit_code(), 1);
        assert_eq!(
            Error::Runtime {
                tool: "docker".into(),
                exit_code: Some(125),
                stderr: String::new(),
            }
            .exit_code(),
            3
        );
        assert_eq!(Error::Cancelled.exit_code(), 4);
        assert_eq!(Error::integrity("bad checksum").exit_code(), 5);
    }

    #[test]
    fn runtime_details_carry_the_stderr_tail() {
        let err = Error::Runtime {
            tool: "docker".into(),
            exit_code: Some(1),
            stderr: "no such volume".into(),
        };
        let details = err.details().unwrap();
        assert_eq!(details["tool"], "docker");
        assert_eq!(details["stderr"], "no such volume");
    }
}
