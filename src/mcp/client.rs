//! JSON-RPC 2.0 client for one MCP server session.
//!
//! Owns exactly one transport for the lifetime of the session. Requests
//! carry fresh ids from an atomic counter; a router task matches inbound
//! responses to pending requests through a [`DashMap`], so independent
//! calls may be in flight concurrently. A dead transport surfaces as
//! `ConnectionLost` on the next call, never asynchronously.

use crate::error::{BridgeError, ToolError};
use crate::mcp::transport::{write_message, StdioTransport};
use crate::mcp::{
    sanitize_tool_name, PromptDescriptor, ResourceDescriptor, ToolDescriptor, ToolOutcome,
};
use dashmap::DashMap;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// MCP protocol revision this client speaks.
const PROTOCOL_VERSION: &str = "2024-11-05";

/// JSON-RPC "method not found"; servers without the optional
/// resources/prompts capabilities answer listing requests with it.
const METHOD_NOT_FOUND: i64 = -32601;

/// Everything discovered from the server in one pass.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    pub tools: Vec<ToolDescriptor>,
    pub resources: Vec<ResourceDescriptor>,
    pub prompts: Vec<PromptDescriptor>,
}

/// How a single JSON-RPC exchange failed. Mapped to the public error
/// taxonomy at each call site.
enum RpcFailure {
    Closed,
    Timeout(u64),
    Rpc { code: i64, message: String },
    Malformed(String),
}

pub struct McpClient {
    outbound: mpsc::Sender<Value>,
    pending: Arc<DashMap<u64, oneshot::Sender<Value>>>,
    next_id: AtomicU64,
    /// Set by the router task when the transport goes away.
    closed: Arc<AtomicBool>,
    /// Kept so the subprocess dies with the client (kill_on_drop).
    _child: Option<tokio::process::Child>,
}

impl McpClient {
    /// Take ownership of a spawned transport and start the router task.
    pub fn connect(transport: StdioTransport) -> Self {
        let StdioTransport {
            child,
            mut stdin,
            inbound,
        } = transport;

        let (out_tx, mut out_rx) = mpsc::channel::<Value>(32);
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if let Err(e) = write_message(&mut stdin, &msg).await {
                    warn!(error = %e, "failed to write to MCP server stdin");
                    break;
                }
            }
        });

        Self::from_channels(out_tx, inbound, Some(child))
    }

    /// Build a client over raw channels. Production code goes through
    /// [`McpClient::connect`]; tests drive the other end directly.
    pub(crate) fn from_channels(
        outbound: mpsc::Sender<Value>,
        mut inbound: mpsc::Receiver<Value>,
        child: Option<tokio::process::Child>,
    ) -> Self {
        let pending: Arc<DashMap<u64, oneshot::Sender<Value>>> = Arc::new(DashMap::new());
        let closed = Arc::new(AtomicBool::new(false));

        let router_pending = Arc::clone(&pending);
        let router_closed = Arc::clone(&closed);
        tokio::spawn(async move {
            while let Some(msg) = inbound.recv().await {
                let id = msg.get("id").and_then(Value::as_u64);
                match id {
                    Some(id) if msg.get("result").is_some() || msg.get("error").is_some() => {
                        match router_pending.remove(&id) {
                            Some((_, tx)) => {
                                let _ = tx.send(msg);
                            }
                            None => debug!(id, "response for unknown or abandoned request"),
                        }
                    }
                    _ => {
                        // Server-initiated notification or request; the
                        // tool-call loop has no use for these.
                        debug!(
                            method = msg.get("method").and_then(|v| v.as_str()).unwrap_or("?"),
                            "ignoring server-initiated message"
                        );
                    }
                }
            }
            // Channel closed: fail anything still waiting.
            router_closed.store(true, Ordering::SeqCst);
            router_pending.clear();
        });

        Self {
            outbound,
            pending,
            next_id: AtomicU64::new(1),
            closed,
            _child: child,
        }
    }

    /// One request/response exchange, correlated by a fresh id.
    async fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, RpcFailure> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RpcFailure::Closed);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        if self.outbound.send(request).await.is_err() {
            self.pending.remove(&id);
            return Err(RpcFailure::Closed);
        }

        let response = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => {
                // Router dropped our sender: transport went away.
                return Err(RpcFailure::Closed);
            }
            Err(_) => {
                self.pending.remove(&id);
                return Err(RpcFailure::Timeout(timeout.as_millis() as u64));
            }
        };

        if let Some(err) = response.get("error") {
            return Err(RpcFailure::Rpc {
                code: err.get("code").and_then(Value::as_i64).unwrap_or(0),
                message: err
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
            });
        }

        response
            .get("result")
            .cloned()
            .ok_or_else(|| RpcFailure::Malformed("response carries neither result nor error".into()))
    }

    /// Fire-and-forget JSON-RPC notification.
    async fn notify(&self, method: &str) -> Result<(), BridgeError> {
        let note = json!({ "jsonrpc": "2.0", "method": method });
        self.outbound
            .send(note)
            .await
            .map_err(|_| BridgeError::ConnectionLost("MCP transport closed".into()))
    }

    /// Perform the MCP `initialize` handshake.
    pub async fn initialize(&self, timeout: Duration) -> Result<(), BridgeError> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            },
        });
        let result = self
            .request("initialize", params, timeout)
            .await
            .map_err(|f| match f {
                RpcFailure::Closed => BridgeError::ConnectionLost("MCP transport closed".into()),
                RpcFailure::Timeout(ms) => {
                    BridgeError::Discovery(format!("initialize timed out after {ms}ms"))
                }
                RpcFailure::Rpc { code, message } => {
                    BridgeError::Discovery(format!("initialize rejected ({code}): {message}"))
                }
                RpcFailure::Malformed(d) => BridgeError::Discovery(d),
            })?;

        debug!(
            server = result
                .pointer("/serverInfo/name")
                .and_then(|v| v.as_str())
                .unwrap_or("?"),
            "MCP server initialized"
        );

        self.notify("notifications/initialized").await
    }

    /// Discover the server's tool, resource, and prompt catalog.
    ///
    /// A failing `tools/list` is a `Discovery` error. Resources and
    /// prompts are optional capabilities: "method not found" yields an
    /// empty list.
    pub async fn discover(&self, timeout: Duration) -> Result<Catalog, BridgeError> {
        let tools = self.list_tools(timeout).await?;
        let resources = self.list_optional(timeout, "resources/list", "resources").await?;
        let prompts = self.list_optional(timeout, "prompts/list", "prompts").await?;

        let resources: Vec<ResourceDescriptor> = resources
            .into_iter()
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect();
        let prompts: Vec<PromptDescriptor> = prompts
            .into_iter()
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect();

        debug!(
            tools = tools.len(),
            resources = resources.len(),
            prompts = prompts.len(),
            "discovery complete"
        );

        Ok(Catalog {
            tools,
            resources,
            prompts,
        })
    }

    /// `tools/list`, following `nextCursor` pagination.
    async fn list_tools(&self, timeout: Duration) -> Result<Vec<ToolDescriptor>, BridgeError> {
        let mut descriptors = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut cursor: Option<String> = None;

        loop {
            let params = match &cursor {
                Some(c) => json!({ "cursor": c }),
                None => json!({}),
            };
            let result = self
                .request("tools/list", params, timeout)
                .await
                .map_err(|f| match f {
                    RpcFailure::Closed => {
                        BridgeError::ConnectionLost("MCP transport closed".into())
                    }
                    RpcFailure::Timeout(ms) => {
                        BridgeError::Discovery(format!("tools/list timed out after {ms}ms"))
                    }
                    RpcFailure::Rpc { code, message } => {
                        BridgeError::Discovery(format!("tools/list failed ({code}): {message}"))
                    }
                    RpcFailure::Malformed(d) => BridgeError::Discovery(d),
                })?;

            let tools = result
                .get("tools")
                .and_then(Value::as_array)
                .ok_or_else(|| {
                    BridgeError::Discovery("tools/list result is missing `tools`".into())
                })?;

            for tool in tools {
                let name = tool
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| BridgeError::Discovery("tool without a name".into()))?
                    .to_string();
                let openai_name = sanitize_tool_name(&name);
                if !seen.insert(openai_name.clone()) {
                    return Err(BridgeError::Discovery(format!(
                        "tool name collision after sanitization: {openai_name}"
                    )));
                }
                descriptors.push(ToolDescriptor {
                    openai_name,
                    description: tool
                        .get("description")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_string(),
                    input_schema: tool
                        .get("inputSchema")
                        .cloned()
                        .unwrap_or_else(|| json!({ "type": "object", "properties": {} })),
                    name,
                });
            }

            cursor = result
                .get("nextCursor")
                .and_then(Value::as_str)
                .map(str::to_string);
            if cursor.is_none() {
                break;
            }
        }

        Ok(descriptors)
    }

    /// Listing request for an optional capability (`resources/list`,
    /// `prompts/list`).
    async fn list_optional(
        &self,
        timeout: Duration,
        method: &str,
        key: &str,
    ) -> Result<Vec<Value>, BridgeError> {
        match self.request(method, json!({}), timeout).await {
            Ok(result) => Ok(result
                .get(key)
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default()),
            Err(RpcFailure::Rpc { code, .. }) if code == METHOD_NOT_FOUND => {
                debug!(method, "server does not support this capability");
                Ok(Vec::new())
            }
            Err(RpcFailure::Closed) => {
                Err(BridgeError::ConnectionLost("MCP transport closed".into()))
            }
            Err(RpcFailure::Timeout(ms)) => Err(BridgeError::Discovery(format!(
                "{method} timed out after {ms}ms"
            ))),
            Err(RpcFailure::Rpc { code, message }) => Err(BridgeError::Discovery(format!(
                "{method} failed ({code}): {message}"
            ))),
            Err(RpcFailure::Malformed(d)) => Err(BridgeError::Discovery(d)),
        }
    }

    /// Invoke one tool via `tools/call`.
    ///
    /// The outer `Result` is session-fatal (`ConnectionLost`); the inner
    /// one is the per-call outcome the orchestrator feeds back to the
    /// LLM. Timeouts are not retried.
    pub async fn invoke(
        &self,
        tool: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<Result<ToolOutcome, ToolError>, BridgeError> {
        let params = json!({ "name": tool, "arguments": arguments });
        let result = match self.request("tools/call", params, timeout).await {
            Ok(result) => result,
            Err(RpcFailure::Closed) => {
                return Err(BridgeError::ConnectionLost("MCP transport closed".into()))
            }
            Err(RpcFailure::Timeout(ms)) => {
                return Ok(Err(ToolError::Timeout {
                    tool: tool.to_string(),
                    elapsed_ms: ms,
                }))
            }
            Err(RpcFailure::Rpc { code, message }) => {
                return Ok(Err(ToolError::Protocol {
                    tool: tool.to_string(),
                    detail: format!("server error ({code}): {message}"),
                }))
            }
            Err(RpcFailure::Malformed(detail)) => {
                return Ok(Err(ToolError::Protocol {
                    tool: tool.to_string(),
                    detail,
                }))
            }
        };

        let content = match result.get("content").and_then(Value::as_array) {
            Some(items) => items,
            None => {
                return Ok(Err(ToolError::Protocol {
                    tool: tool.to_string(),
                    detail: "tools/call result is missing `content`".into(),
                }))
            }
        };

        // Join the text items, as the original bridge did; non-text
        // content (images, embedded resources) is not surfaced.
        let text = content
            .iter()
            .filter_map(|item| item.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join(" ");

        Ok(Ok(ToolOutcome {
            text,
            is_error: result
                .get("isError")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        }))
    }
}
