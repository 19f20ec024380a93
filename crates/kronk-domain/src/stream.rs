//! Streaming completion events (provider-agnostic).

use std::pin::Pin;

use serde::{Deserialize, Serialize};

use crate::chat::ToolCall;

/// A boxed async stream, used for LLM streaming responses.
pub type BoxStream<'a, T> = Pin<Box<dyn futures_core::Stream<Item = T> + Send + 'a>>;

/// Token usage for a completion.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// A typed chunk in a streaming completion.
///
/// The agent loop aggregates `Chunk` deltas into the final content and
/// collects `ToolCall` events; `Done` closes the stream.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StreamChunk {
    Chunk { content: String },
    ToolCall { tool_call: ToolCall },
    Done {
        #[serde(skip_serializing_if = "Option::is_none")]
        tokens_used: Option<u64>,
    },
}
