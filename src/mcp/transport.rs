//! Stdio transport layer for MCP server communication.
//!
//! Spawns the MCP server as a subprocess and communicates via
//! newline-delimited JSON on its stdin/stdout.

use crate::config::McpServerConfig;
use crate::error::BridgeError;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Stdio transport for communicating with an MCP server subprocess.
///
/// Inbound messages arrive on `inbound` in arrival order; the channel
/// closes when the server's stdout does.
pub struct StdioTransport {
    pub(crate) child: Child,
    pub(crate) stdin: ChildStdin,
    pub(crate) inbound: mpsc::Receiver<Value>,
}

impl StdioTransport {
    /// Spawn an MCP server subprocess and set up communication channels.
    pub fn spawn(config: &McpServerConfig) -> Result<Self, BridgeError> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .current_dir(&config.cwd)
            .envs(&config.env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::inherit()) // Let server errors show in terminal
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            BridgeError::ConnectionLost(format!(
                "failed to spawn MCP server `{}`: {e}",
                config.command
            ))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BridgeError::ConnectionLost("MCP server stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BridgeError::ConnectionLost("MCP server stdout unavailable".into()))?;

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(reader_loop(stdout, tx));

        debug!(command = %config.command, "spawned MCP server");

        Ok(Self {
            child,
            stdin,
            inbound: rx,
        })
    }
}

/// Reader loop that parses newline-delimited JSON from the server's stdout.
async fn reader_loop(stdout: ChildStdout, tx: mpsc::Sender<Value>) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if !line.is_empty() => match serde_json::from_str(&line) {
                Ok(msg) => {
                    if tx.send(msg).await.is_err() {
                        // Receiver dropped, exit loop
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, line = %line, "skipping non-JSON line from MCP server");
                }
            },
            Ok(Some(_)) => {}
            Ok(None) | Err(_) => break, // Pipe closed
        }
    }
    debug!("MCP server stdout closed");
}

/// Write one JSON-RPC message as a single line.
pub(crate) async fn write_message(
    stdin: &mut ChildStdin,
    message: &Value,
) -> std::io::Result<()> {
    let mut json = serde_json::to_string(message)?;
    json.push('\n');
    stdin.write_all(json.as_bytes()).await?;
    stdin.flush().await
}
