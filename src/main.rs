//! Interactive REPL front-end for the MCP ↔ LLM bridge.

use anyhow::{Context, Result};
use clap::Parser;
use mcp_llm_bridge::{Bridge, BridgeConfig};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "mcp-llm-bridge", version, about = "Bridge MCP tools to an OpenAI-compatible LLM")]
struct Args {
    /// Path to a TOML config file (default: bridge.toml, then
    /// ~/.mcp-llm-bridge/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// MCP server command to spawn (overrides config)
    #[arg(long)]
    command: Option<String>,

    /// Arguments for the MCP server command
    #[arg(long, num_args = 0.., allow_hyphen_values = true)]
    args: Vec<String>,

    /// Model identifier (overrides config)
    #[arg(long)]
    model: Option<String>,

    /// Chat-completion endpoint base URL (overrides config)
    #[arg(long)]
    base_url: Option<String>,

    /// API key; falls back to OPENAI_API_KEY
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Request streamed responses from the endpoint
    #[arg(long)]
    stream: bool,

    /// Per-turn cap on LLM round-trips
    #[arg(long)]
    max_iterations: Option<usize>,

    /// Per-call timeout for MCP requests, in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,
}

impl Args {
    /// Fold CLI flags over the loaded config.
    fn apply(self, mut config: BridgeConfig) -> BridgeConfig {
        if let Some(command) = self.command {
            config.mcp.command = command;
            config.mcp.args = self.args;
        }
        if let Some(model) = self.model {
            config.llm.model = model;
        }
        if let Some(base_url) = self.base_url {
            config.llm.base_url = base_url;
        }
        if let Some(api_key) = self.api_key {
            config.llm.api_key = Some(api_key);
        }
        if self.stream {
            config.llm.streaming = true;
        }
        if let Some(n) = self.max_iterations {
            config.max_iterations = n;
        }
        if let Some(ms) = self.timeout_ms {
            config.mcp.timeout_ms = ms;
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config_path = args.config.clone();
    let config = args.apply(BridgeConfig::load(config_path.as_deref())?);

    info!(model = %config.llm.model, command = %config.mcp.command, "starting bridge");
    let mut bridge = Bridge::start(config).await?;

    let mut editor = DefaultEditor::new().context("failed to initialize line editor")?;
    let history_path = dirs::home_dir().map(|h| h.join(".mcp-llm-bridge").join("history"));
    if let Some(path) = &history_path {
        let _ = editor.load_history(path);
    }

    println!("Connected. {} tool(s) available. Type 'quit' to exit.", bridge.tools().len());

    loop {
        match editor.readline("> ") {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if matches!(line, "quit" | "exit" | "q") {
                    break;
                }
                let _ = editor.add_history_entry(line);

                match bridge.send_user_message(line).await {
                    Ok(answer) => println!("\n{answer}\n"),
                    Err(e) => {
                        error!(error = %e, "turn failed");
                        eprintln!("error: {e}");
                    }
                }
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(e) => {
                error!(error = %e, "readline failed");
                break;
            }
        }
    }

    if let Some(path) = &history_path {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let _ = editor.save_history(path);
    }

    let usage = bridge.usage();
    info!(
        turns = usage.turns,
        input_tokens = usage.input_tokens,
        output_tokens = usage.output_tokens,
        tool_calls = usage.tool_calls,
        "session summary"
    );
    bridge.shutdown();

    Ok(())
}
