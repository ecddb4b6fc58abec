//! The bridge orchestrator: drives one conversational turn from user
//! message to final answer, dispatching tool calls through the MCP
//! client along the way.
//!
//! A turn moves through `LLMPending` and `ToolDispatch` until the LLM
//! answers without tool calls or the iteration guard trips. Failures of
//! a single tool call are folded back into the conversation as error
//! payload messages; session-level failures abort the turn and leave the
//! conversation as of the last successful append.

use crate::config::BridgeConfig;
use crate::error::{BridgeError, ToolError};
use crate::llm::{ChatMessage, LlmClient, ToolCallRequest};
use crate::mcp::client::{Catalog, McpClient};
use crate::mcp::transport::StdioTransport;
use crate::mcp::{PromptDescriptor, ResourceDescriptor, ToolDescriptor};
use crate::metrics::METRICS;
use crate::schema;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Token and tool usage accumulated over a session.
#[derive(Debug, Clone, Copy, Default)]
pub struct UsageStats {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub tool_calls: u64,
    pub turns: u64,
}

/// One bridge session: the conversation, the discovered catalog, and the
/// translated tool schemas. Mutated only by the orchestrator.
pub struct Session {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    conversation: Vec<ChatMessage>,
    tools: Vec<ToolDescriptor>,
    by_openai_name: HashMap<String, usize>,
    tool_schemas: Vec<Value>,
    resources: Vec<ResourceDescriptor>,
    prompts: Vec<PromptDescriptor>,
    usage: UsageStats,
}

impl Session {
    fn new(system_prompt: String, catalog: Catalog) -> Result<Self, BridgeError> {
        let tool_schemas = catalog
            .tools
            .iter()
            .map(schema::translate)
            .collect::<Result<Vec<_>, _>>()?;

        let by_openai_name = catalog
            .tools
            .iter()
            .enumerate()
            .map(|(i, t)| (t.openai_name.clone(), i))
            .collect();

        let preamble = context_preamble(&system_prompt, &catalog.resources, &catalog.prompts);

        Ok(Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            conversation: vec![ChatMessage::system(preamble)],
            tools: catalog.tools,
            by_openai_name,
            tool_schemas,
            resources: catalog.resources,
            prompts: catalog.prompts,
            usage: UsageStats::default(),
        })
    }

    fn descriptor(&self, openai_name: &str) -> Option<&ToolDescriptor> {
        self.by_openai_name
            .get(openai_name)
            .map(|&i| &self.tools[i])
    }
}

/// Fold the discovered resources and prompts into the system prompt so
/// the LLM knows what context the server can provide.
fn context_preamble(
    system_prompt: &str,
    resources: &[ResourceDescriptor],
    prompts: &[PromptDescriptor],
) -> String {
    let mut out = system_prompt.to_string();
    if !resources.is_empty() {
        out.push_str("\n\nThe connected server exposes these resources:");
        for r in resources {
            out.push('\n');
            out.push_str("- ");
            if r.name.is_empty() {
                out.push_str(&r.uri);
            } else {
                out.push_str(&format!("{} ({})", r.name, r.uri));
            }
            if let Some(desc) = &r.description {
                out.push_str(": ");
                out.push_str(desc);
            }
        }
    }
    if !prompts.is_empty() {
        out.push_str("\n\nThe connected server exposes these prompt templates:");
        for p in prompts {
            out.push('\n');
            out.push_str("- ");
            out.push_str(&p.name);
            if let Some(desc) = &p.description {
                out.push_str(": ");
                out.push_str(desc);
            }
        }
    }
    out
}

/// Bridge between one MCP server session and one LLM endpoint.
pub struct Bridge {
    session: Session,
    mcp: McpClient,
    llm: LlmClient,
    tool_timeout: Duration,
    max_iterations: usize,
    streaming: bool,
}

impl Bridge {
    /// Spawn the MCP server, run the handshake, discover and translate
    /// the tool catalog, and open the session.
    ///
    /// Schema translation failures are fatal here rather than silently
    /// degraded at call time.
    pub async fn start(config: BridgeConfig) -> Result<Self, BridgeError> {
        config.validate()?;

        let transport = StdioTransport::spawn(&config.mcp)?;
        let mcp = McpClient::connect(transport);
        let timeout = Duration::from_millis(config.mcp.timeout_ms);

        mcp.initialize(timeout).await?;
        let catalog = mcp.discover(timeout).await?;

        info!(
            tools = catalog.tools.len(),
            resources = catalog.resources.len(),
            prompts = catalog.prompts.len(),
            model = %config.llm.model,
            "bridge session starting"
        );

        let session = Session::new(config.system_prompt().to_string(), catalog)?;
        let llm = LlmClient::new(&config.llm)?;

        Ok(Self {
            session,
            mcp,
            llm,
            tool_timeout: timeout,
            max_iterations: config.max_iterations,
            streaming: config.llm.streaming,
        })
    }

    /// Process one user message to a final assistant answer.
    ///
    /// Loops LLM call → tool dispatch until the LLM stops requesting
    /// tools, every requested call answered by exactly one tool message
    /// in request order before the next LLM call. Cancel-safe: dropping
    /// the future abandons in-flight requests.
    pub async fn send_user_message(&mut self, text: &str) -> Result<String, BridgeError> {
        self.session.conversation.push(ChatMessage::user(text));
        self.session.usage.turns += 1;

        for iteration in 1..=self.max_iterations {
            debug!(iteration, "requesting completion");

            let started = Instant::now();
            let result = self
                .llm
                .complete(
                    &self.session.conversation,
                    &self.session.tool_schemas,
                    self.streaming,
                )
                .await;
            let elapsed_ms = started.elapsed().as_millis() as f64;

            let turn = match result {
                Ok(turn) => {
                    METRICS.record_llm_request(self.llm.model(), "ok", elapsed_ms);
                    turn
                }
                Err(e) => {
                    METRICS.record_llm_request(self.llm.model(), "error", elapsed_ms);
                    return Err(e);
                }
            };

            if let Some(usage) = &turn.usage {
                self.session.usage.input_tokens += usage.prompt_tokens;
                self.session.usage.output_tokens += usage.completion_tokens;
                METRICS.record_tokens(
                    self.llm.model(),
                    usage.prompt_tokens,
                    usage.completion_tokens,
                );
            }

            if turn.finish_reason.as_deref() == Some("length") {
                warn!("response truncated by max_tokens");
            }

            if !turn.has_tool_calls() {
                let answer = turn.content.clone().unwrap_or_default();
                self.session.conversation.push(turn.to_message());
                return Ok(answer);
            }

            // ToolDispatch: the assistant message is appended with all
            // requested calls preserved, then the batch is dispatched
            // concurrently. Results are appended in request order, not
            // completion order.
            let calls = turn.tool_calls.clone();
            self.session.conversation.push(turn.to_message());
            self.session.usage.tool_calls += calls.len() as u64;

            let results = join_all(calls.iter().map(|call| self.run_tool_call(call))).await;
            for outcome in results {
                self.session.conversation.push(outcome?);
            }
        }

        Err(BridgeError::IterationLimitExceeded {
            limit: self.max_iterations,
        })
    }

    /// Resolve one tool call to the tool message that answers it.
    ///
    /// Per-call failures come back as `Ok` with an error payload message;
    /// only connection loss escapes as `Err`.
    async fn run_tool_call(&self, call: &ToolCallRequest) -> Result<ChatMessage, BridgeError> {
        let openai_name = call.function.name.as_str();

        let descriptor = match self.session.descriptor(openai_name) {
            Some(d) => d,
            None => {
                let err = ToolError::UnknownTool {
                    name: openai_name.to_string(),
                };
                return Ok(self.error_message(call, &err));
            }
        };

        let arguments: Value = match serde_json::from_str(&call.function.arguments) {
            Ok(v) => v,
            Err(e) => {
                let err = ToolError::InvalidArguments {
                    tool: descriptor.name.clone(),
                    field: "/".to_string(),
                    reason: format!("arguments are not valid JSON: {e}"),
                };
                return Ok(self.error_message(call, &err));
            }
        };

        let validated = match schema::validate_arguments(arguments, descriptor) {
            Ok(v) => v,
            Err(err) => return Ok(self.error_message(call, &err)),
        };

        debug!(tool = %descriptor.name, "invoking MCP tool");
        let outcome = self
            .mcp
            .invoke(&descriptor.name, validated, self.tool_timeout)
            .await?;

        Ok(match outcome {
            Ok(result) if result.is_error => {
                METRICS.record_tool_call(&descriptor.name, "tool_error");
                let payload = serde_json::json!({
                    "error": { "kind": "tool_error", "message": result.text }
                });
                ChatMessage::tool(call.id.clone(), payload.to_string())
            }
            Ok(result) => {
                METRICS.record_tool_call(&descriptor.name, "ok");
                ChatMessage::tool(call.id.clone(), result.text)
            }
            Err(err) => {
                METRICS.record_tool_call(&descriptor.name, err.kind());
                warn!(tool = %descriptor.name, error = %err, "tool call failed");
                ChatMessage::tool(call.id.clone(), err.to_payload().to_string())
            }
        })
    }

    fn error_message(&self, call: &ToolCallRequest, err: &ToolError) -> ChatMessage {
        METRICS.record_tool_call(&call.function.name, err.kind());
        warn!(tool = %call.function.name, error = %err, "tool call rejected");
        ChatMessage::tool(call.id.clone(), err.to_payload().to_string())
    }

    /// The conversation so far, for diagnostics. Retained across failed
    /// turns as of the last successful append.
    pub fn conversation(&self) -> &[ChatMessage] {
        &self.session.conversation
    }

    pub fn usage(&self) -> UsageStats {
        self.session.usage
    }

    pub fn session_id(&self) -> Uuid {
        self.session.id
    }

    pub fn tools(&self) -> &[ToolDescriptor] {
        &self.session.tools
    }

    pub fn resources(&self) -> &[ResourceDescriptor] {
        &self.session.resources
    }

    pub fn prompts(&self) -> &[PromptDescriptor] {
        &self.session.prompts
    }

    /// End the session. Dropping the bridge kills the MCP subprocess.
    pub fn shutdown(self) {
        info!(session = %self.session.id, "bridge session closed");
    }
}
