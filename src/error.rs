//! Error taxonomy for the bridge.
//!
//! Two tiers: `ToolError` covers failures of a single tool call and is
//! recovered locally by converting it into an error-payload tool message,
//! so the LLM sees the failure and can adapt. `BridgeError` is terminal
//! for the current turn (or the whole session) and surfaces to the caller.

use serde_json::{json, Value};
use thiserror::Error;

/// Failure of one tool call within a turn. Never aborts the turn.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown tool: {name}")]
    UnknownTool { name: String },

    #[error("invalid arguments for tool {tool}: field `{field}`: {reason}")]
    InvalidArguments {
        tool: String,
        field: String,
        reason: String,
    },

    #[error("tool {tool} timed out after {elapsed_ms}ms")]
    Timeout { tool: String, elapsed_ms: u64 },

    #[error("protocol error from tool {tool}: {detail}")]
    Protocol { tool: String, detail: String },
}

impl ToolError {
    /// Machine-readable kind, stable across message wording changes.
    pub fn kind(&self) -> &'static str {
        match self {
            ToolError::UnknownTool { .. } => "unknown_tool",
            ToolError::InvalidArguments { .. } => "invalid_arguments",
            ToolError::Timeout { .. } => "timeout",
            ToolError::Protocol { .. } => "protocol_error",
        }
    }

    /// Render as the error payload carried in a `role: "tool"` message.
    pub fn to_payload(&self) -> Value {
        json!({
            "error": {
                "kind": self.kind(),
                "message": self.to_string(),
            }
        })
    }
}

/// Terminal failure of a turn or session.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("cannot translate schema for tool {tool}: unsupported construct `{construct}` at {path}")]
    SchemaTranslation {
        tool: String,
        path: String,
        construct: String,
    },

    #[error("tool discovery failed: {0}")]
    Discovery(String),

    #[error("MCP server connection lost: {0}")]
    ConnectionLost(String),

    #[error("LLM request failed: {0}")]
    LlmRequest(String),

    #[error("malformed LLM response: {0}")]
    LlmProtocol(String),

    #[error("iteration limit of {limit} LLM round-trips exceeded")]
    IterationLimitExceeded { limit: usize },

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T, E = BridgeError> = std::result::Result<T, E>;
