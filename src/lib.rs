//! Bridge between MCP (Model Context Protocol) servers and
//! OpenAI-compatible chat-completion endpoints.
//!
//! The bridge discovers an MCP server's tools, translates their schemas
//! into the chat-completion function format, and runs the tool-calling
//! loop: LLM response → MCP tool dispatch → tool results → LLM, until
//! the model produces a final answer.
//!
//! ```ignore
//! use mcp_llm_bridge::{Bridge, BridgeConfig};
//!
//! let config = BridgeConfig::load(None)?;
//! let mut bridge = Bridge::start(config).await?;
//! let answer = bridge.send_user_message("What's at this URL?").await?;
//! ```

pub mod bridge;
pub mod config;
pub mod error;
pub mod llm;
pub mod mcp;
pub mod metrics;
pub mod schema;

pub use bridge::{Bridge, Session, UsageStats};
pub use config::{BridgeConfig, LlmConfig, McpServerConfig};
pub use error::{BridgeError, ToolError};
