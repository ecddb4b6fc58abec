//! Client for OpenAI-compatible chat-completion endpoints.
//!
//! Sends the conversation plus translated tool schemas and returns one
//! fully assembled [`AssistantTurn`], whether or not the transport was
//! streamed. Token-level SSE deltas are consumed here and never reach
//! the orchestrator.

use crate::config::LlmConfig;
use crate::error::BridgeError;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use tracing::debug;

/// Message roles in the chat-completion conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One message in the conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallRequest>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::text(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::text(Role::User, content)
    }

    pub fn assistant(content: Option<String>, tool_calls: Vec<ToolCallRequest>) -> Self {
        Self {
            role: Role::Assistant,
            content,
            tool_calls: if tool_calls.is_empty() {
                None
            } else {
                Some(tool_calls)
            },
            tool_call_id: None,
        }
    }

    /// A tool-result message correlated to its originating call.
    pub fn tool(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: Some(call_id.into()),
        }
    }

    fn text(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

/// A tool call requested by the assistant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    #[serde(rename = "type", default = "function_type")]
    pub call_type: String,
    pub function: FunctionCall,
}

fn function_type() -> String {
    "function".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded argument object, as the wire format carries it.
    pub arguments: String,
}

/// Token usage reported by the endpoint.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

/// One assembled assistant response: either final content with no tool
/// calls, or one or more tool calls (content may be empty).
#[derive(Debug, Clone)]
pub struct AssistantTurn {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
    pub finish_reason: Option<String>,
    pub usage: Option<Usage>,
}

impl AssistantTurn {
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    /// The assistant message to append to the conversation, preserving
    /// all requested calls.
    pub fn to_message(&self) -> ChatMessage {
        ChatMessage::assistant(self.content.clone(), self.tool_calls.clone())
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<&'a [Value]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'a str>,
    temperature: f64,
    max_tokens: u32,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallRequest>>,
}

/// HTTP client for one configured chat-completion endpoint.
pub struct LlmClient {
    http: reqwest::Client,
    base_url: String,
    api_key: SecretString,
    model: String,
    temperature: f64,
    max_tokens: u32,
}

impl LlmClient {
    pub fn new(config: &LlmConfig) -> Result<Self, BridgeError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| BridgeError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.resolve_api_key()?,
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Send the conversation and return one assembled assistant turn.
    ///
    /// The conversation is borrowed, never mutated; new messages are the
    /// orchestrator's to append.
    pub async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[Value],
        streaming: bool,
    ) -> Result<AssistantTurn, BridgeError> {
        let request = ChatRequest {
            model: &self.model,
            messages,
            tools: if tools.is_empty() { None } else { Some(tools) },
            tool_choice: if tools.is_empty() { None } else { Some("auto") },
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            stream: streaming,
        };

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .json(&request)
            .send()
            .await
            .map_err(|e| BridgeError::LlmRequest(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BridgeError::LlmRequest(format!(
                "endpoint returned {status}: {}",
                body.chars().take(500).collect::<String>()
            )));
        }

        let turn = if streaming {
            self.assemble_stream(response).await?
        } else {
            let parsed: ChatResponse = response
                .json()
                .await
                .map_err(|e| BridgeError::LlmProtocol(format!("undecodable response: {e}")))?;
            let choice = parsed
                .choices
                .into_iter()
                .next()
                .ok_or_else(|| BridgeError::LlmProtocol("response has no choices".into()))?;
            AssistantTurn {
                content: choice.message.content,
                tool_calls: choice.message.tool_calls.unwrap_or_default(),
                finish_reason: choice.finish_reason,
                usage: parsed.usage,
            }
        };

        check_declared(&turn, tools)?;

        debug!(
            tool_calls = turn.tool_calls.len(),
            finish_reason = turn.finish_reason.as_deref().unwrap_or("?"),
            "assistant turn assembled"
        );

        Ok(turn)
    }

    /// Consume SSE chunks and merge deltas into one assistant turn.
    async fn assemble_stream(
        &self,
        response: reqwest::Response,
    ) -> Result<AssistantTurn, BridgeError> {
        let mut assembler = StreamAssembler::default();
        let mut events = response.bytes_stream().eventsource();

        while let Some(event) = events.next().await {
            let event =
                event.map_err(|e| BridgeError::LlmRequest(format!("stream error: {e}")))?;
            if event.data.trim() == "[DONE]" {
                break;
            }
            let chunk: Value = serde_json::from_str(&event.data)
                .map_err(|e| BridgeError::LlmProtocol(format!("undecodable stream chunk: {e}")))?;
            assembler.apply(&chunk)?;
        }

        assembler.finish()
    }
}

/// Fail if the assistant called a tool no schema was declared for.
fn check_declared(turn: &AssistantTurn, tools: &[Value]) -> Result<(), BridgeError> {
    let declared: HashSet<&str> = tools
        .iter()
        .filter_map(|t| t.pointer("/function/name").and_then(Value::as_str))
        .collect();
    for call in &turn.tool_calls {
        if !declared.contains(call.function.name.as_str()) {
            return Err(BridgeError::LlmProtocol(format!(
                "assistant called undeclared tool `{}`",
                call.function.name
            )));
        }
    }
    Ok(())
}

/// Incremental assembly of streamed deltas.
///
/// Tool-call fragments arrive keyed by `index`: the id and name once,
/// the argument string in pieces.
#[derive(Debug, Default)]
struct StreamAssembler {
    content: String,
    saw_content: bool,
    calls: Vec<PartialCall>,
    finish_reason: Option<String>,
    usage: Option<Usage>,
}

#[derive(Debug, Default)]
struct PartialCall {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

impl StreamAssembler {
    fn apply(&mut self, chunk: &Value) -> Result<(), BridgeError> {
        if let Some(usage) = chunk.get("usage") {
            if !usage.is_null() {
                self.usage = serde_json::from_value(usage.clone()).ok();
            }
        }

        let choice = match chunk.get("choices").and_then(Value::as_array).and_then(|c| c.first()) {
            Some(choice) => choice,
            None => return Ok(()), // usage-only or keep-alive chunk
        };

        if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
            self.finish_reason = Some(reason.to_string());
        }

        let delta = match choice.get("delta") {
            Some(delta) => delta,
            None => return Ok(()),
        };

        if let Some(text) = delta.get("content").and_then(Value::as_str) {
            self.saw_content = true;
            self.content.push_str(text);
        }

        if let Some(fragments) = delta.get("tool_calls").and_then(Value::as_array) {
            for fragment in fragments {
                let index = fragment
                    .get("index")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| {
                        BridgeError::LlmProtocol("tool-call fragment without index".into())
                    })? as usize;
                if index >= self.calls.len() {
                    self.calls.resize_with(index + 1, PartialCall::default);
                }
                let call = &mut self.calls[index];
                if let Some(id) = fragment.get("id").and_then(Value::as_str) {
                    call.id = Some(id.to_string());
                }
                if let Some(name) = fragment.pointer("/function/name").and_then(Value::as_str) {
                    call.name = Some(name.to_string());
                }
                if let Some(args) = fragment
                    .pointer("/function/arguments")
                    .and_then(Value::as_str)
                {
                    call.arguments.push_str(args);
                }
            }
        }

        Ok(())
    }

    fn finish(self) -> Result<AssistantTurn, BridgeError> {
        let mut tool_calls = Vec::with_capacity(self.calls.len());
        for call in self.calls {
            let id = call
                .id
                .ok_or_else(|| BridgeError::LlmProtocol("streamed tool call without id".into()))?;
            let name = call.name.ok_or_else(|| {
                BridgeError::LlmProtocol("streamed tool call without a function name".into())
            })?;
            tool_calls.push(ToolCallRequest {
                id,
                call_type: function_type(),
                function: FunctionCall {
                    name,
                    arguments: call.arguments,
                },
            });
        }

        Ok(AssistantTurn {
            content: if self.saw_content {
                Some(self.content)
            } else {
                None
            },
            tool_calls,
            finish_reason: self.finish_reason,
            usage: self.usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> LlmClient {
        LlmClient::new(&LlmConfig {
            base_url: server.uri(),
            model: "gpt-4o".to_string(),
            api_key: Some("test-key".to_string()),
            api_key_env: None,
            temperature: 0.7,
            max_tokens: 2000,
            streaming: false,
        })
        .unwrap()
    }

    fn fetch_schema() -> Value {
        json!({
            "type": "function",
            "function": {
                "name": "fetch",
                "description": "Fetch a URL",
                "parameters": { "type": "object", "properties": {} }
            }
        })
    }

    #[tokio::test]
    async fn parses_a_final_text_answer() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(body_partial_json(json!({ "model": "gpt-4o" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{
                    "message": { "role": "assistant", "content": "Hello there" },
                    "finish_reason": "stop"
                }],
                "usage": { "prompt_tokens": 12, "completion_tokens": 3, "total_tokens": 15 }
            })))
            .mount(&server)
            .await;

        let turn = client_for(&server)
            .complete(&[ChatMessage::user("hi")], &[], false)
            .await
            .unwrap();
        assert_eq!(turn.content.as_deref(), Some("Hello there"));
        assert!(turn.tool_calls.is_empty());
        assert_eq!(turn.usage.unwrap().prompt_tokens, 12);
    }

    #[tokio::test]
    async fn parses_tool_call_requests() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{
                    "message": {
                        "role": "assistant",
                        "content": null,
                        "tool_calls": [{
                            "id": "call_1",
                            "type": "function",
                            "function": {
                                "name": "fetch",
                                "arguments": "{\"url\":\"http://example.com\"}"
                            }
                        }]
                    },
                    "finish_reason": "tool_calls"
                }]
            })))
            .mount(&server)
            .await;

        let turn = client_for(&server)
            .complete(&[ChatMessage::user("fetch it")], &[fetch_schema()], false)
            .await
            .unwrap();
        assert!(turn.has_tool_calls());
        assert_eq!(turn.tool_calls[0].function.name, "fetch");
        assert_eq!(turn.finish_reason.as_deref(), Some("tool_calls"));
    }

    #[tokio::test]
    async fn server_error_is_llm_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("upstream exploded"))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .complete(&[ChatMessage::user("hi")], &[], false)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::LlmRequest(_)));
        assert!(err.to_string().contains("500"));
    }

    #[tokio::test]
    async fn empty_choices_is_llm_protocol() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "choices": [] })))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .complete(&[ChatMessage::user("hi")], &[], false)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::LlmProtocol(_)));
    }

    #[tokio::test]
    async fn undeclared_tool_call_is_llm_protocol() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{
                    "message": {
                        "role": "assistant",
                        "tool_calls": [{
                            "id": "call_1",
                            "type": "function",
                            "function": { "name": "made_up", "arguments": "{}" }
                        }]
                    },
                    "finish_reason": "tool_calls"
                }]
            })))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .complete(&[ChatMessage::user("hi")], &[fetch_schema()], false)
            .await
            .unwrap_err();
        match err {
            BridgeError::LlmProtocol(detail) => assert!(detail.contains("made_up")),
            other => panic!("expected LlmProtocol, got {other}"),
        }
    }

    fn sse_body(chunks: &[Value]) -> String {
        let mut body = String::new();
        for chunk in chunks {
            body.push_str("data: ");
            body.push_str(&chunk.to_string());
            body.push_str("\n\n");
        }
        body.push_str("data: [DONE]\n\n");
        body
    }

    #[tokio::test]
    async fn streaming_reassembles_content_deltas() {
        let server = MockServer::start().await;
        let body = sse_body(&[
            json!({ "choices": [{ "delta": { "role": "assistant", "content": "The page " } }] }),
            json!({ "choices": [{ "delta": { "content": "says hello." } }] }),
            json!({ "choices": [{ "delta": {}, "finish_reason": "stop" }] }),
        ]);
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(body),
            )
            .mount(&server)
            .await;

        let turn = client_for(&server)
            .complete(&[ChatMessage::user("hi")], &[], true)
            .await
            .unwrap();
        assert_eq!(turn.content.as_deref(), Some("The page says hello."));
        assert!(turn.tool_calls.is_empty());
        assert_eq!(turn.finish_reason.as_deref(), Some("stop"));
    }

    #[tokio::test]
    async fn streaming_reassembles_split_tool_call_arguments() {
        let server = MockServer::start().await;
        let body = sse_body(&[
            json!({ "choices": [{ "delta": { "tool_calls": [{
                "index": 0, "id": "call_9", "type": "function",
                "function": { "name": "fetch", "arguments": "" }
            }] } }] }),
            json!({ "choices": [{ "delta": { "tool_calls": [{
                "index": 0, "function": { "arguments": "{\"url\":\"http://exa" }
            }] } }] }),
            json!({ "choices": [{ "delta": { "tool_calls": [{
                "index": 0, "function": { "arguments": "mple.com\"}" }
            }] } }] }),
            json!({ "choices": [{ "delta": {}, "finish_reason": "tool_calls" }] }),
        ]);
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(body),
            )
            .mount(&server)
            .await;

        let turn = client_for(&server)
            .complete(&[ChatMessage::user("hi")], &[fetch_schema()], true)
            .await
            .unwrap();
        assert_eq!(turn.tool_calls.len(), 1);
        assert_eq!(turn.tool_calls[0].id, "call_9");
        assert_eq!(
            turn.tool_calls[0].function.arguments,
            "{\"url\":\"http://example.com\"}"
        );
    }

    #[test]
    fn assembler_rejects_nameless_calls() {
        let mut assembler = StreamAssembler::default();
        assembler
            .apply(&json!({ "choices": [{ "delta": { "tool_calls": [{
                "index": 0, "id": "call_1",
                "function": { "arguments": "{}" }
            }] } }] }))
            .unwrap();
        assert!(matches!(
            assembler.finish(),
            Err(BridgeError::LlmProtocol(_))
        ));
    }

    #[test]
    fn tool_message_serializes_with_call_id() {
        let msg = ChatMessage::tool("call_1", "page text");
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v, json!({
            "role": "tool",
            "content": "page text",
            "tool_call_id": "call_1"
        }));
    }
}
