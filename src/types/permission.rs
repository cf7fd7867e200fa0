//! Permission request / decision records
//!
//! These travel over the loopback bridge and, for the decision, back into the
//! CLI through the `--permission-prompt-tool` result, so the wire names follow
//! the CLI's contract rather than Rust naming.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A tool invocation the CLI wants approved
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionRequest {
    /// Correlates the request with exactly one decision
    #[serde(rename = "tool_use_id")]
    pub request_id: String,
    pub tool_name: String,
    #[serde(rename = "input", default)]
    pub tool_input: Value,
}

impl PermissionRequest {
    pub fn new(request_id: impl Into<String>, tool_name: impl Into<String>, tool_input: Value) -> Self {
        Self {
            request_id: request_id.into(),
            tool_name: tool_name.into(),
            tool_input,
        }
    }
}

/// Outcome of a permission request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "behavior", rename_all = "lowercase")]
pub enum PermissionDecision {
    Allow {
        #[serde(
            rename = "updatedInput",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        updated_input: Option<Value>,
    },
    Deny {
        #[serde(default)]
        message: String,
    },
}

impl PermissionDecision {
    /// Allow without rewriting the tool input
    pub fn allow() -> Self {
        PermissionDecision::Allow {
            updated_input: None,
        }
    }

    /// Allow and pass `input` back as the tool's (possibly edited) input
    pub fn allow_with(input: Value) -> Self {
        PermissionDecision::Allow {
            updated_input: Some(input),
        }
    }

    pub fn deny(message: impl Into<String>) -> Self {
        PermissionDecision::Deny {
            message: message.into(),
        }
    }

    pub fn is_allow(&self) -> bool {
        matches!(self, PermissionDecision::Allow { .. })
    }

    /// Deny reason, if denied
    pub fn deny_message(&self) -> Option<&str> {
        match self {
            PermissionDecision::Deny { message } => Some(message),
            PermissionDecision::Allow { .. } => None,
        }
    }
}
