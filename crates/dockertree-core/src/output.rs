//! Structured command output for `--json` mode and the RPC surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Machine-readable error record inside a [`CommandOutput`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorRecord {
    /// Stable error code (see [`Error::code`]).
    pub code: String,
    /// Human-oriented message.
    pub message: String,
    /// Structured details, error-kind specific.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// The envelope every command emits under `--json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandOutput {
    /// Whether the operation completed.
    pub success: bool,
    /// Operation name, e.g. `worktree.create`.
    pub operation: String,
    /// Operation-specific payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Present iff `success` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorRecord>,
    /// Completion timestamp.
    pub timestamp: DateTime<Utc>,
}

impl CommandOutput {
    /// Successful result with a payload.
    #[must_use]
    pub fn ok(operation: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            success: true,
            operation: operation.into(),
            data: Some(data),
            error: None,
            timestamp: Utc::now(),
        }
    }

    /// Failed result carrying the typed error.
    #[must_use]
    pub fn err(operation: impl Into<String>, error: &Error) -> Self {
        Self {
            success: false,
            operation: operation.into(),
            data: None,
            error: Some(ErrorRecord {
                code: error.code().to_string(),
                message: error.to_string(),
                details: error.details(),
            }),
            timestamp: Utc::now(),
        }
    }

    /// Attach a payload to a failed result (e.g. per-item bulk outcomes).
    #[must_use]
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_envelope_shape() {
        let out = CommandOutput::ok("worktree.list", serde_json::json!([]));
        let value = serde_json::to_value(&out).unwrap();
        assert_eq!(value["success"], true);
        assert_eq!(value["operation"], "worktree.list");
        assert!(value.get("error").is_none());
        assert!(value.get("timestamp").is_some());
    }

    #[test]
    fn error_envelope_carries_code_and_details() {
        let err = Error::Runtime {
            tool: "docker".into(),
            exit_code: Some(125),
            stderr: "boom".into(),
        };
        let out = CommandOutput::err("worktree.up", &err);
        let value = serde_json::to_value(&out).unwrap();
        assert_eq!(value["success"], false);
        assert_eq!(value["error"]["code"], "runtime_error");
        assert_eq!(value["error"]["details"]["exit_code"], 125);
    }
}
