//! Anthropic Messages API adapter.
//!
//! System messages go in the top-level `system` field, tool results are
//! user messages with `tool_result` blocks, and streamed tool inputs
//! arrive as partial-JSON deltas assembled per content block.

use serde_json::{json, Value};

use kronk_domain::chat::{ChatMessage, Role, ToolCall, ToolDefinition};
use kronk_domain::config::KronkConfig;
use kronk_domain::stream::{BoxStream, StreamChunk};
use kronk_domain::{Error, Result};

use crate::sse::sse_chunk_stream;
use crate::traits::{
    usage_from_counts, ChatRequest, ChatResponse, EmbeddingsRequest, EmbeddingsResponse,
    LlmProvider,
};
use crate::util::{check_status, from_reqwest};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";
const DEFAULT_MAX_TOKENS: u32 = 4096;

pub struct AnthropicProvider {
    base_url: String,
    api_key: String,
    default_model: String,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn from_config(cfg: &KronkConfig) -> Result<Self> {
        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .map_err(|_| Error::Config("ANTHROPIC_API_KEY is not set".into()))?;
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .map_err(from_reqwest)?;
        Ok(Self {
            base_url: cfg
                .api_base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.into())
                .trim_end_matches('/')
                .to_string(),
            api_key,
            default_model: cfg.model.clone().unwrap_or_else(|| DEFAULT_MODEL.into()),
            client,
        })
    }

    fn authed_post(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .post(format!("{}{path}", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
    }

    fn build_messages_body(&self, req: &ChatRequest, stream: bool) -> Value {
        let mut system_parts: Vec<String> = Vec::new();
        let mut api_messages: Vec<Value> = Vec::new();

        for msg in &req.messages {
            match msg.role {
                Role::System => system_parts.push(msg.content.clone()),
                Role::User => {
                    api_messages.push(json!({"role": "user", "content": msg.content}));
                }
                Role::Assistant => api_messages.push(assistant_to_anthropic(msg)),
                Role::Tool => api_messages.push(tool_result_to_anthropic(msg)),
            }
        }

        let mut body = json!({
            "model": req.model.clone().unwrap_or_else(|| self.default_model.clone()),
            "messages": api_messages,
            "max_tokens": req.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "stream": stream,
        });
        if !system_parts.is_empty() {
            body["system"] = Value::String(system_parts.join("\n\n"));
        }
        if !req.tools.is_empty() {
            body["tools"] = Value::Array(req.tools.iter().map(tool_to_anthropic).collect());
        }
        if let Some(temp) = req.temperature {
            body["temperature"] = json!(temp);
        }
        body
    }
}

// ── Wire serialization ─────────────────────────────────────────────

fn assistant_to_anthropic(msg: &ChatMessage) -> Value {
    let mut content: Vec<Value> = Vec::new();
    if !msg.content.is_empty() {
        content.push(json!({"type": "text", "text": msg.content}));
    }
    for call in &msg.tool_calls {
        content.push(json!({
            "type": "tool_use",
            "id": call.id,
            "name": call.name,
            "input": call.arguments,
        }));
    }
    if content.is_empty() {
        content.push(json!({"type": "text", "text": ""}));
    }
    json!({"role": "assistant", "content": content})
}

fn tool_result_to_anthropic(msg: &ChatMessage) -> Value {
    json!({
        "role": "user",
        "content": [{
            "type": "tool_result",
            "tool_use_id": msg.tool_call_id.clone().unwrap_or_default(),
            "content": msg.content,
        }]
    })
}

fn tool_to_anthropic(tool: &ToolDefinition) -> Value {
    json!({
        "name": tool.name,
        "description": tool.description,
        "input_schema": tool.parameters,
    })
}

fn parse_response(body: &Value) -> ChatResponse {
    let mut text_parts: Vec<String> = Vec::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();
    if let Some(blocks) = body.get("content").and_then(Value::as_array) {
        for block in blocks {
            match block.get("type").and_then(Value::as_str) {
                Some("text") => {
                    if let Some(text) = block.get("text").and_then(Value::as_str) {
                        text_parts.push(text.to_string());
                    }
                }
                Some("tool_use") => {
                    tool_calls.push(ToolCall {
                        id: block.get("id").and_then(Value::as_str).unwrap_or_default().into(),
                        name: block.get("name").and_then(Value::as_str).unwrap_or_default().into(),
                        arguments: block.get("input").cloned().unwrap_or(json!({})),
                    });
                }
                _ => {}
            }
        }
    }
    let usage = body.get("usage").map(|u| {
        usage_from_counts(
            u.get("input_tokens").and_then(Value::as_u64).unwrap_or(0),
            u.get("output_tokens").and_then(Value::as_u64).unwrap_or(0),
        )
    });
    ChatResponse {
        content: text_parts.join(""),
        tool_calls,
        usage,
        model: body
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    }
}

// ── Streamed content-block assembly ────────────────────────────────

#[derive(Default)]
struct StreamState {
    /// Tool block under construction: (id, name, partial input JSON).
    current_tool: Option<(String, String, String)>,
    input_tokens: u64,
    output_tokens: u64,
}

fn parse_stream_data(state: &mut StreamState, data: &str) -> Vec<Result<StreamChunk>> {
    let event: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => {
            return vec![Err(Error::Provider {
                provider: "anthropic".into(),
                message: format!("bad stream event: {e}"),
            })]
        }
    };

    match event.get("type").and_then(Value::as_str) {
        Some("message_start") => {
            if let Some(usage) = event.pointer("/message/usage") {
                state.input_tokens = usage
                    .get("input_tokens")
                    .and_then(Value::as_u64)
                    .unwrap_or(0);
            }
            Vec::new()
        }
        Some("content_block_start") => {
            if let Some(block) = event.get("content_block") {
                if block.get("type").and_then(Value::as_str) == Some("tool_use") {
                    state.current_tool = Some((
                        block.get("id").and_then(Value::as_str).unwrap_or_default().into(),
                        block.get("name").and_then(Value::as_str).unwrap_or_default().into(),
                        String::new(),
                    ));
                }
            }
            Vec::new()
        }
        Some("content_block_delta") => {
            let Some(delta) = event.get("delta") else {
                return Vec::new();
            };
            match delta.get("type").and_then(Value::as_str) {
                Some("text_delta") => delta
                    .get("text")
                    .and_then(Value::as_str)
                    .filter(|t| !t.is_empty())
                    .map(|t| vec![Ok(StreamChunk::Chunk { content: t.into() })])
                    .unwrap_or_default(),
                Some("input_json_delta") => {
                    if let (Some((_, _, input)), Some(part)) = (
                        state.current_tool.as_mut(),
                        delta.get("partial_json").and_then(Value::as_str),
                    ) {
                        input.push_str(part);
                    }
                    Vec::new()
                }
                _ => Vec::new(),
            }
        }
        Some("content_block_stop") => match state.current_tool.take() {
            Some((id, name, input)) => {
                let arguments = if input.trim().is_empty() {
                    json!({})
                } else {
                    serde_json::from_str(&input).unwrap_or(Value::String(input))
                };
                vec![Ok(StreamChunk::ToolCall {
                    tool_call: ToolCall { id, name, arguments },
                })]
            }
            None => Vec::new(),
        },
        Some("message_delta") => {
            if let Some(output) = event
                .pointer("/usage/output_tokens")
                .and_then(Value::as_u64)
            {
                state.output_tokens = output;
            }
            Vec::new()
        }
        Some("message_stop") => {
            let total = state.input_tokens + state.output_tokens;
            vec![Ok(StreamChunk::Done {
                tokens_used: (total > 0).then_some(total),
            })]
        }
        Some("error") => {
            let message = event
                .pointer("/error/message")
                .and_then(Value::as_str)
                .unwrap_or("stream error")
                .to_string();
            vec![Err(Error::Provider {
                provider: "anthropic".into(),
                message,
            })]
        }
        _ => Vec::new(),
    }
}

#[async_trait::async_trait]
impl LlmProvider for AnthropicProvider {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse> {
        let body = self.build_messages_body(&req, false);
        let response = self
            .authed_post("/v1/messages")
            .json(&body)
            .send()
            .await
            .map_err(from_reqwest)?;
        let response = check_status("anthropic", response).await?;
        let parsed: Value = response.json().await.map_err(from_reqwest)?;
        Ok(parse_response(&parsed))
    }

    async fn chat_stream(
        &self,
        req: ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamChunk>>> {
        let body = self.build_messages_body(&req, true);
        let response = self
            .authed_post("/v1/messages")
            .json(&body)
            .send()
            .await
            .map_err(from_reqwest)?;
        let response = check_status("anthropic", response).await?;

        let mut state = StreamState::default();
        Ok(sse_chunk_stream(response, move |data| {
            parse_stream_data(&mut state, data)
        }))
    }

    async fn embeddings(&self, _req: EmbeddingsRequest) -> Result<EmbeddingsResponse> {
        Err(Error::Provider {
            provider: "anthropic".into(),
            message: "no embeddings API; configure ollama or openai for vector search".into(),
        })
    }

    fn provider_id(&self) -> &str {
        "anthropic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_results_become_user_messages() {
        let msg = ChatMessage::tool_result("toolu_1", "{\"ok\":true}");
        let v = tool_result_to_anthropic(&msg);
        assert_eq!(v["role"], "user");
        assert_eq!(v["content"][0]["type"], "tool_result");
        assert_eq!(v["content"][0]["tool_use_id"], "toolu_1");
    }

    #[test]
    fn response_parses_text_and_tool_use() {
        let body = json!({
            "model": "claude-sonnet-4-20250514",
            "content": [
                {"type": "text", "text": "checking"},
                {"type": "tool_use", "id": "toolu_1", "name": "add", "input": {"a": 1}},
            ],
            "usage": {"input_tokens": 10, "output_tokens": 4},
        });
        let parsed = parse_response(&body);
        assert_eq!(parsed.content, "checking");
        assert_eq!(parsed.tool_calls.len(), 1);
        assert_eq!(parsed.tool_calls[0].id, "toolu_1");
        assert_eq!(parsed.usage.map(|u| u.total_tokens), Some(14));
    }

    #[test]
    fn streamed_tool_input_assembles_across_deltas() {
        let mut state = StreamState::default();
        parse_stream_data(
            &mut state,
            r#"{"type":"content_block_start","index":0,"content_block":{"type":"tool_use","id":"toolu_1","name":"add"}}"#,
        );
        parse_stream_data(
            &mut state,
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"{\"a\""}}"#,
        );
        parse_stream_data(
            &mut state,
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":":2}"}}"#,
        );
        let chunks = parse_stream_data(&mut state, r#"{"type":"content_block_stop","index":0}"#);
        match &chunks[0] {
            Ok(StreamChunk::ToolCall { tool_call }) => {
                assert_eq!(tool_call.name, "add");
                assert_eq!(tool_call.arguments, json!({"a": 2}));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn message_stop_reports_usage() {
        let mut state = StreamState::default();
        parse_stream_data(
            &mut state,
            r#"{"type":"message_start","message":{"usage":{"input_tokens":7}}}"#,
        );
        parse_stream_data(
            &mut state,
            r#"{"type":"message_delta","usage":{"output_tokens":3}}"#,
        );
        let chunks = parse_stream_data(&mut state, r#"{"type":"message_stop"}"#);
        assert!(matches!(chunks[0], Ok(StreamChunk::Done { tokens_used: Some(10) })));
    }
}
