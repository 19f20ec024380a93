//! Ollama native adapter (`/api/chat`, `/api/embeddings`).
//!
//! Ollama streams newline-delimited JSON rather than SSE, and its tool
//! calls carry no ids, so the agent loop synthesizes them.

use serde_json::{json, Value};

use kronk_domain::chat::{ChatMessage, Role, ToolCall, ToolDefinition};
use kronk_domain::config::KronkConfig;
use kronk_domain::stream::{BoxStream, StreamChunk};
use kronk_domain::{Error, Result};

use crate::traits::{
    usage_from_counts, ChatRequest, ChatResponse, EmbeddingsRequest, EmbeddingsResponse,
    LlmProvider,
};
use crate::util::{check_status, from_reqwest};

const DEFAULT_HOST: &str = "http://localhost:11434";
const DEFAULT_MODEL: &str = "llama3.2";
const DEFAULT_EMBED_MODEL: &str = "nomic-embed-text";

pub struct OllamaProvider {
    base_url: String,
    default_model: String,
    embed_model: String,
    client: reqwest::Client,
}

impl OllamaProvider {
    pub fn from_config(cfg: &KronkConfig) -> Result<Self> {
        let base_url = cfg
            .api_base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_HOST.to_string());
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .map_err(from_reqwest)?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            default_model: cfg.model.clone().unwrap_or_else(|| DEFAULT_MODEL.into()),
            embed_model: cfg
                .embedding_model
                .clone()
                .unwrap_or_else(|| DEFAULT_EMBED_MODEL.into()),
            client,
        })
    }

    fn build_chat_body(&self, req: &ChatRequest, stream: bool) -> Value {
        let messages: Vec<Value> = req.messages.iter().map(msg_to_ollama).collect();
        let mut body = json!({
            "model": req.model.clone().unwrap_or_else(|| self.default_model.clone()),
            "messages": messages,
            "stream": stream,
        });
        if !req.tools.is_empty() {
            body["tools"] = Value::Array(req.tools.iter().map(tool_to_ollama).collect());
        }
        let mut options = serde_json::Map::new();
        if let Some(temp) = req.temperature {
            options.insert("temperature".into(), json!(temp));
        }
        if let Some(max) = req.max_tokens {
            options.insert("num_predict".into(), json!(max));
        }
        if !options.is_empty() {
            body["options"] = Value::Object(options);
        }
        body
    }
}

fn msg_to_ollama(msg: &ChatMessage) -> Value {
    let mut out = json!({
        "role": msg.role.as_str(),
        "content": msg.content,
    });
    if msg.role == Role::Assistant && !msg.tool_calls.is_empty() {
        out["tool_calls"] = Value::Array(
            msg.tool_calls
                .iter()
                .map(|c| {
                    json!({
                        "function": {"name": c.name, "arguments": c.arguments},
                    })
                })
                .collect(),
        );
    }
    out
}

fn tool_to_ollama(tool: &ToolDefinition) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters,
        }
    })
}

fn parse_tool_calls(message: &Value) -> Vec<ToolCall> {
    message
        .get("tool_calls")
        .and_then(Value::as_array)
        .map(|calls| {
            calls
                .iter()
                .filter_map(|c| {
                    let function = c.get("function")?;
                    Some(ToolCall {
                        // Ollama supplies no call ids.
                        id: String::new(),
                        name: function.get("name")?.as_str()?.to_string(),
                        arguments: function.get("arguments").cloned().unwrap_or(json!({})),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait::async_trait]
impl LlmProvider for OllamaProvider {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse> {
        let body = self.build_chat_body(&req, false);
        let model = body["model"].as_str().unwrap_or_default().to_string();
        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(from_reqwest)?;
        let response = check_status("ollama", response).await?;
        let parsed: Value = response.json().await.map_err(from_reqwest)?;

        let message = parsed.get("message").cloned().unwrap_or(json!({}));
        let prompt = parsed.get("prompt_eval_count").and_then(Value::as_u64);
        let completion = parsed.get("eval_count").and_then(Value::as_u64);
        Ok(ChatResponse {
            content: message
                .get("content")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            tool_calls: parse_tool_calls(&message),
            usage: match (prompt, completion) {
                (Some(p), Some(c)) => Some(usage_from_counts(p, c)),
                _ => None,
            },
            model,
        })
    }

    async fn chat_stream(
        &self,
        req: ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamChunk>>> {
        let body = self.build_chat_body(&req, true);
        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(from_reqwest)?;
        let response = check_status("ollama", response).await?;

        let stream = async_stream::stream! {
            let mut response = response;
            let mut buffer = String::new();
            let mut done_emitted = false;

            loop {
                match response.chunk().await {
                    Ok(Some(bytes)) => {
                        buffer.push_str(&String::from_utf8_lossy(&bytes));
                        while let Some(pos) = buffer.find('\n') {
                            let line: String = buffer.drain(..=pos).collect();
                            let line = line.trim();
                            if line.is_empty() {
                                continue;
                            }
                            match serde_json::from_str::<Value>(line) {
                                Ok(event) => {
                                    for chunk in parse_stream_line(&event) {
                                        if matches!(&chunk, Ok(StreamChunk::Done { .. })) {
                                            done_emitted = true;
                                        }
                                        yield chunk;
                                    }
                                }
                                Err(e) => {
                                    yield Err(Error::Provider {
                                        provider: "ollama".into(),
                                        message: format!("bad stream line: {e}"),
                                    });
                                }
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        yield Err(from_reqwest(e));
                        break;
                    }
                }
            }

            if !done_emitted {
                yield Ok(StreamChunk::Done { tokens_used: None });
            }
        };
        Ok(Box::pin(stream))
    }

    async fn embeddings(&self, req: EmbeddingsRequest) -> Result<EmbeddingsResponse> {
        let model = req.model.unwrap_or_else(|| self.embed_model.clone());
        let mut embeddings = Vec::with_capacity(req.input.len());
        for text in &req.input {
            let response = self
                .client
                .post(format!("{}/api/embeddings", self.base_url))
                .json(&json!({"model": model, "prompt": text}))
                .send()
                .await
                .map_err(from_reqwest)?;
            let response = check_status("ollama", response).await?;
            let parsed: Value = response.json().await.map_err(from_reqwest)?;
            let vector = parsed
                .get("embedding")
                .and_then(Value::as_array)
                .ok_or_else(|| Error::Provider {
                    provider: "ollama".into(),
                    message: "embeddings response missing vector".into(),
                })?
                .iter()
                .filter_map(Value::as_f64)
                .map(|v| v as f32)
                .collect();
            embeddings.push(vector);
        }
        Ok(EmbeddingsResponse { embeddings })
    }

    fn provider_id(&self) -> &str {
        "ollama"
    }
}

fn parse_stream_line(event: &Value) -> Vec<Result<StreamChunk>> {
    let mut chunks = Vec::new();
    if let Some(message) = event.get("message") {
        if let Some(text) = message.get("content").and_then(Value::as_str) {
            if !text.is_empty() {
                chunks.push(Ok(StreamChunk::Chunk {
                    content: text.to_string(),
                }));
            }
        }
        for call in parse_tool_calls(message) {
            chunks.push(Ok(StreamChunk::ToolCall { tool_call: call }));
        }
    }
    if event.get("done").and_then(Value::as_bool) == Some(true) {
        let prompt = event.get("prompt_eval_count").and_then(Value::as_u64);
        let completion = event.get("eval_count").and_then(Value::as_u64);
        chunks.push(Ok(StreamChunk::Done {
            tokens_used: match (prompt, completion) {
                (Some(p), Some(c)) => Some(p + c),
                _ => None,
            },
        }));
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_serialize_with_tool_calls() {
        let msg = ChatMessage::assistant_tool_calls(
            "",
            vec![ToolCall {
                id: "ignored".into(),
                name: "add_numbers".into(),
                arguments: json!({"a": 1, "b": 2}),
            }],
        );
        let v = msg_to_ollama(&msg);
        assert_eq!(v["tool_calls"][0]["function"]["name"], "add_numbers");
        assert_eq!(v["tool_calls"][0]["function"]["arguments"]["a"], 1);
    }

    #[test]
    fn stream_line_with_text_and_done() {
        let line = json!({
            "message": {"role": "assistant", "content": "hi"},
            "done": true,
            "prompt_eval_count": 10,
            "eval_count": 5,
        });
        let chunks = parse_stream_line(&line);
        assert_eq!(chunks.len(), 2);
        assert!(matches!(chunks[0], Ok(StreamChunk::Chunk { ref content }) if content == "hi"));
        assert!(matches!(chunks[1], Ok(StreamChunk::Done { tokens_used: Some(15) })));
    }

    #[test]
    fn tool_calls_have_empty_ids() {
        let message = json!({
            "tool_calls": [{"function": {"name": "f", "arguments": {"x": 1}}}],
        });
        let calls = parse_tool_calls(&message);
        assert_eq!(calls.len(), 1);
        assert!(calls[0].id.is_empty());
    }
}
