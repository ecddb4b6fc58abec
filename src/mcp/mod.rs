//! MCP (Model Context Protocol) client support.
//!
//! Connects to one MCP server subprocess per session and exposes its
//! tool/resource/prompt catalog to the bridge.

pub mod client;
pub mod transport;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Tool definition discovered from an MCP server.
///
/// Immutable once fetched; a fresh `discover` call replaces the whole set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Tool name as the server knows it (e.g. "fetch-page")
    pub name: String,
    /// Sanitized name presented to the LLM (e.g. "fetch_page")
    pub openai_name: String,
    /// Human-readable description
    pub description: String,
    /// JSON Schema for the tool's input parameters
    pub input_schema: Value,
}

/// Resource exposed by the MCP server, surfaced to the LLM as context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub uri: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "mimeType", default)]
    pub mime_type: Option<String>,
}

/// Prompt template exposed by the MCP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// Outcome of one `tools/call` invocation.
///
/// `is_error` mirrors the MCP result's `isError` flag: the call completed
/// at the protocol level but the tool itself reported failure.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub text: String,
    pub is_error: bool,
}

/// Sanitize a tool name for the chat-completion API.
///
/// Dashes and spaces become underscores, lowercased. The original server
/// name is kept on the descriptor and restored at dispatch.
pub fn sanitize_tool_name(name: &str) -> String {
    name.replace(['-', ' '], "_").to_lowercase()
}
