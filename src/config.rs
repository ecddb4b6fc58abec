//! Bridge configuration: the LLM endpoint, the MCP server command, and
//! the orchestrator's limits.
//!
//! Sources, later wins: user config (`~/.mcp-llm-bridge/config.toml`),
//! project config (`bridge.toml`), then CLI flags applied in `main`.

use crate::error::BridgeError;
use secrecy::SecretString;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// System prompt used when the config does not set one.
pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a helpful assistant that can use tools to help answer questions.";

/// Configuration for the chat-completion endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Environment variable to read the key from when `api_key` is unset.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Request token-level streaming from the endpoint. The orchestrator
    /// sees a complete assistant turn either way.
    #[serde(default)]
    pub streaming: bool,
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_model() -> String {
    "gpt-4o".to_string()
}

fn default_api_key_env() -> Option<String> {
    Some("OPENAI_API_KEY".to_string())
}

fn default_temperature() -> f64 {
    0.7
}

fn default_max_tokens() -> u32 {
    2000
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            api_key: None,
            api_key_env: default_api_key_env(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            streaming: false,
        }
    }
}

impl LlmConfig {
    /// Resolve the API key from config or environment.
    /// Returns "ollama" as a dummy key for endpoints that don't require
    /// authentication (Ollama wants the header but ignores its value).
    pub fn resolve_api_key(&self) -> Result<SecretString, BridgeError> {
        if let Some(key) = &self.api_key {
            return Ok(SecretString::from(key.clone()));
        }
        if let Some(env_var) = &self.api_key_env {
            if let Ok(key) = std::env::var(env_var) {
                return Ok(SecretString::from(key));
            }
        }
        Ok(SecretString::from("ollama"))
    }
}

/// Configuration for the MCP server subprocess.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpServerConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default = "default_cwd")]
    pub cwd: String,
    /// Per-call timeout for `tools/call` and discovery requests.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_cwd() -> String {
    ".".to_string()
}

fn default_timeout_ms() -> u64 {
    30_000
}

impl Default for McpServerConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: default_cwd(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

/// Top-level bridge configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub mcp: McpServerConfig,
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Per-turn cap on LLM round-trips; guards against tool-call loops.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
}

fn default_max_iterations() -> usize {
    8
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            llm: LlmConfig::default(),
            mcp: McpServerConfig::default(),
            system_prompt: None,
            max_iterations: default_max_iterations(),
        }
    }
}

impl BridgeConfig {
    /// Load configuration from the first path that exists:
    /// an explicit `--config` path, `bridge.toml` in the working
    /// directory, then `~/.mcp-llm-bridge/config.toml`.
    pub fn load(explicit: Option<&Path>) -> Result<Self, BridgeError> {
        if let Some(path) = explicit {
            return Self::load_from(path);
        }

        let project = Path::new("bridge.toml");
        if project.exists() {
            return Self::load_from(project);
        }

        if let Some(user) = Self::user_config_path() {
            if user.exists() {
                return Self::load_from(&user);
            }
        }

        Ok(Self::default())
    }

    pub fn load_from(path: &Path) -> Result<Self, BridgeError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| BridgeError::Config(format!("cannot read {}: {e}", path.display())))?;
        toml::from_str(&content)
            .map_err(|e| BridgeError::Config(format!("invalid config {}: {e}", path.display())))
    }

    fn user_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".mcp-llm-bridge").join("config.toml"))
    }

    /// The effective system prompt.
    pub fn system_prompt(&self) -> &str {
        self.system_prompt.as_deref().unwrap_or(DEFAULT_SYSTEM_PROMPT)
    }

    /// Reject configs the bridge cannot start from.
    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.mcp.command.is_empty() {
            return Err(BridgeError::Config(
                "no MCP server command configured (set [mcp] command or pass --command)".into(),
            ));
        }
        if self.max_iterations == 0 {
            return Err(BridgeError::Config("max_iterations must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use std::io::Write;

    #[test]
    fn parses_full_config() {
        let toml_src = r#"
            system_prompt = "Be terse."
            max_iterations = 3

            [llm]
            base_url = "http://localhost:11434/v1"
            model = "llama3.2"
            api_key = "whatever"
            temperature = 0.2
            streaming = true

            [mcp]
            command = "uvx"
            args = ["mcp-server-fetch"]
            timeoutMs = 10000
        "#;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(toml_src.as_bytes()).unwrap();

        let config = BridgeConfig::load_from(file.path()).unwrap();
        assert_eq!(config.system_prompt(), "Be terse.");
        assert_eq!(config.max_iterations, 3);
        assert_eq!(config.llm.model, "llama3.2");
        assert!(config.llm.streaming);
        assert_eq!(config.mcp.command, "uvx");
        assert_eq!(config.mcp.timeout_ms, 10_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn defaults_fill_missing_sections() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"[mcp]\ncommand = \"uvx\"\n").unwrap();

        let config = BridgeConfig::load_from(file.path()).unwrap();
        assert_eq!(config.llm.model, "gpt-4o");
        assert_eq!(config.llm.max_tokens, 2000);
        assert_eq!(config.max_iterations, 8);
        assert_eq!(config.mcp.timeout_ms, 30_000);
        assert_eq!(config.system_prompt(), DEFAULT_SYSTEM_PROMPT);
    }

    #[test]
    fn direct_api_key_takes_priority() {
        let config = LlmConfig {
            api_key: Some("direct".to_string()),
            api_key_env: Some("SOME_UNSET_VAR_FOR_TEST".to_string()),
            ..LlmConfig::default()
        };
        assert_eq!(config.resolve_api_key().unwrap().expose_secret(), "direct");
    }

    #[test]
    fn missing_key_falls_back_to_placeholder() {
        let config = LlmConfig {
            api_key: None,
            api_key_env: Some("SOME_UNSET_VAR_FOR_TEST".to_string()),
            ..LlmConfig::default()
        };
        assert_eq!(config.resolve_api_key().unwrap().expose_secret(), "ollama");
    }

    #[test]
    fn validate_requires_a_server_command() {
        let config = BridgeConfig::default();
        assert!(matches!(config.validate(), Err(BridgeError::Config(_))));
    }
}
