//! OpenAI chat-completions adapter.
//!
//! Also covers any endpoint that follows the same contract when
//! `apiBaseUrl` points elsewhere.

use std::collections::BTreeMap;

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

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_EMBED_MODEL: &str = "text-embedding-3-small";

pub struct OpenAiProvider {
    base_url: String,
    api_key: String,
    default_model: String,
    embed_model: String,
    client: reqwest::Client,
}

impl OpenAiProvider {
    pub fn from_config(cfg: &KronkConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| Error::Config("OPENAI_API_KEY is not set".into()))?;
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
            embed_model: cfg
                .embedding_model
                .clone()
                .unwrap_or_else(|| DEFAULT_EMBED_MODEL.into()),
            client,
        })
    }

    fn authed_post(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .post(format!("{}{path}", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
    }

    fn build_chat_body(&self, req: &ChatRequest, stream: bool) -> Value {
        let messages: Vec<Value> = req.messages.iter().map(msg_to_openai).collect();
        let mut body = json!({
            "model": req.model.clone().unwrap_or_else(|| self.default_model.clone()),
            "messages": messages,
            "stream": stream,
        });
        if !req.tools.is_empty() {
            body["tools"] = Value::Array(req.tools.iter().map(tool_to_openai).collect());
        }
        if let Some(temp) = req.temperature {
            body["temperature"] = json!(temp);
        }
        if let Some(max) = req.max_tokens {
            body["max_tokens"] = json!(max);
        }
        if stream {
            body["stream_options"] = json!({"include_usage": true});
        }
        body
    }
}

// ── Wire serialization ─────────────────────────────────────────────

fn msg_to_openai(msg: &ChatMessage) -> Value {
    match msg.role {
        Role::Tool => json!({
            "role": "tool",
            "tool_call_id": msg.tool_call_id.clone().unwrap_or_default(),
            "content": msg.content,
        }),
        Role::Assistant if !msg.tool_calls.is_empty() => {
            let calls: Vec<Value> = msg
                .tool_calls
                .iter()
                .map(|c| {
                    json!({
                        "id": c.id,
                        "type": "function",
                        "function": {
                            "name": c.name,
                            "arguments": c.arguments.to_string(),
                        }
                    })
                })
                .collect();
            json!({
                "role": "assistant",
                "content": msg.content,
                "tool_calls": calls,
            })
        }
        _ => json!({"role": msg.role.as_str(), "content": msg.content}),
    }
}

fn tool_to_openai(tool: &ToolDefinition) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters,
        }
    })
}

fn parse_tool_call(raw: &Value) -> Option<ToolCall> {
    let function = raw.get("function")?;
    let arguments = function
        .get("arguments")
        .and_then(Value::as_str)
        .map(|s| serde_json::from_str(s).unwrap_or(Value::String(s.to_string())))
        .unwrap_or(json!({}));
    Some(ToolCall {
        id: raw.get("id").and_then(Value::as_str).unwrap_or_default().to_string(),
        name: function.get("name")?.as_str()?.to_string(),
        arguments,
    })
}

// ── Streamed tool-call assembly ────────────────────────────────────

#[derive(Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

/// Mutable state threaded through the SSE parser: OpenAI streams tool
/// calls as per-index deltas that only become valid JSON at the end.
#[derive(Default)]
struct StreamState {
    calls: BTreeMap<u64, PartialCall>,
    tokens_used: Option<u64>,
}

impl StreamState {
    fn flush_calls(&mut self) -> Vec<Result<StreamChunk>> {
        std::mem::take(&mut self.calls)
            .into_values()
            .map(|partial| {
                let arguments = if partial.arguments.trim().is_empty() {
                    json!({})
                } else {
                    serde_json::from_str(&partial.arguments)
                        .unwrap_or(Value::String(partial.arguments.clone()))
                };
                Ok(StreamChunk::ToolCall {
                    tool_call: ToolCall {
                        id: partial.id,
                        name: partial.name,
                        arguments,
                    },
                })
            })
            .collect()
    }
}

fn parse_stream_data(state: &mut StreamState, data: &str) -> Vec<Result<StreamChunk>> {
    if data == "[DONE]" {
        let mut chunks = state.flush_calls();
        chunks.push(Ok(StreamChunk::Done {
            tokens_used: state.tokens_used,
        }));
        return chunks;
    }
    let event: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => {
            return vec![Err(Error::Provider {
                provider: "openai".into(),
                message: format!("bad stream event: {e}"),
            })]
        }
    };

    if let Some(total) = event
        .get("usage")
        .and_then(|u| u.get("total_tokens"))
        .and_then(Value::as_u64)
    {
        state.tokens_used = Some(total);
    }

    let mut chunks = Vec::new();
    if let Some(delta) = event
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
        .and_then(|c| c.get("delta"))
    {
        if let Some(text) = delta.get("content").and_then(Value::as_str) {
            if !text.is_empty() {
                chunks.push(Ok(StreamChunk::Chunk {
                    content: text.to_string(),
                }));
            }
        }
        if let Some(calls) = delta.get("tool_calls").and_then(Value::as_array) {
            for call in calls {
                let index = call.get("index").and_then(Value::as_u64).unwrap_or(0);
                let partial = state.calls.entry(index).or_default();
                if let Some(id) = call.get("id").and_then(Value::as_str) {
                    partial.id = id.to_string();
                }
                if let Some(function) = call.get("function") {
                    if let Some(name) = function.get("name").and_then(Value::as_str) {
                        partial.name.push_str(name);
                    }
                    if let Some(args) = function.get("arguments").and_then(Value::as_str) {
                        partial.arguments.push_str(args);
                    }
                }
            }
        }
    }
    chunks
}

#[async_trait::async_trait]
impl LlmProvider for OpenAiProvider {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse> {
        let body = self.build_chat_body(&req, false);
        let model = body["model"].as_str().unwrap_or_default().to_string();
        let response = self
            .authed_post("/chat/completions")
            .json(&body)
            .send()
            .await
            .map_err(from_reqwest)?;
        let response = check_status("openai", response).await?;
        let parsed: Value = response.json().await.map_err(from_reqwest)?;

        let message = parsed
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|c| c.first())
            .and_then(|c| c.get("message"))
            .cloned()
            .unwrap_or(json!({}));
        let tool_calls = message
            .get("tool_calls")
            .and_then(Value::as_array)
            .map(|calls| calls.iter().filter_map(parse_tool_call).collect())
            .unwrap_or_default();
        let usage = parsed.get("usage").map(|u| {
            usage_from_counts(
                u.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0),
                u.get("completion_tokens").and_then(Value::as_u64).unwrap_or(0),
            )
        });
        Ok(ChatResponse {
            content: message
                .get("content")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            tool_calls,
            usage,
            model,
        })
    }

    async fn chat_stream(
        &self,
        req: ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamChunk>>> {
        let body = self.build_chat_body(&req, true);
        let response = self
            .authed_post("/chat/completions")
            .json(&body)
            .send()
            .await
            .map_err(from_reqwest)?;
        let response = check_status("openai", response).await?;

        let mut state = StreamState::default();
        Ok(sse_chunk_stream(response, move |data| {
            parse_stream_data(&mut state, data)
        }))
    }

    async fn embeddings(&self, req: EmbeddingsRequest) -> Result<EmbeddingsResponse> {
        let model = req.model.unwrap_or_else(|| self.embed_model.clone());
        let response = self
            .authed_post("/embeddings")
            .json(&json!({"model": model, "input": req.input}))
            .send()
            .await
            .map_err(from_reqwest)?;
        let response = check_status("openai", response).await?;
        let parsed: Value = response.json().await.map_err(from_reqwest)?;

        let embeddings = parsed
            .get("data")
            .and_then(Value::as_array)
            .map(|rows| {
                rows.iter()
                    .filter_map(|row| {
                        Some(
                            row.get("embedding")?
                                .as_array()?
                                .iter()
                                .filter_map(Value::as_f64)
                                .map(|v| v as f32)
                                .collect::<Vec<f32>>(),
                        )
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(EmbeddingsResponse { embeddings })
    }

    fn provider_id(&self) -> &str {
        "openai"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assistant_tool_calls_encode_arguments_as_string() {
        let msg = ChatMessage::assistant_tool_calls(
            "",
            vec![ToolCall {
                id: "call_1".into(),
                name: "add".into(),
                arguments: json!({"a": 1}),
            }],
        );
        let v = msg_to_openai(&msg);
        assert_eq!(v["tool_calls"][0]["id"], "call_1");
        assert_eq!(v["tool_calls"][0]["function"]["arguments"], "{\"a\":1}");
    }

    #[test]
    fn tool_result_carries_call_id() {
        let msg = ChatMessage::tool_result("call_1", "{\"sum\":3}");
        let v = msg_to_openai(&msg);
        assert_eq!(v["role"], "tool");
        assert_eq!(v["tool_call_id"], "call_1");
    }

    #[test]
    fn streamed_tool_call_assembles_across_deltas() {
        let mut state = StreamState::default();
        let first = r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_9","function":{"name":"add","arguments":"{\"a\""}}]}}]}"#;
        let second = r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":":1}"}}]}}]}"#;
        assert!(parse_stream_data(&mut state, first).is_empty());
        assert!(parse_stream_data(&mut state, second).is_empty());

        let done = parse_stream_data(&mut state, "[DONE]");
        assert_eq!(done.len(), 2);
        match &done[0] {
            Ok(StreamChunk::ToolCall { tool_call }) => {
                assert_eq!(tool_call.id, "call_9");
                assert_eq!(tool_call.name, "add");
                assert_eq!(tool_call.arguments, json!({"a": 1}));
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(matches!(done[1], Ok(StreamChunk::Done { .. })));
    }

    #[test]
    fn text_deltas_stream_through() {
        let mut state = StreamState::default();
        let data = r#"{"choices":[{"delta":{"content":"hel"}}]}"#;
        let chunks = parse_stream_data(&mut state, data);
        assert!(matches!(&chunks[0], Ok(StreamChunk::Chunk { content }) if content == "hel"));
    }
}
