//! Bridges from the provider to the memory manager's seams: embedding
//! and summarization backed by the configured LLM.

use std::sync::Arc;

use kronk_domain::chat::ChatMessage;
use kronk_domain::{Error, Result};
use kronk_memory::{Embedder, Summarizer};
use kronk_providers::{ChatRequest, EmbeddingsRequest, LlmProvider};

pub struct LlmEmbedder {
    provider: Arc<dyn LlmProvider>,
    dim: usize,
}

impl LlmEmbedder {
    pub fn new(provider: Arc<dyn LlmProvider>, dim: usize) -> Self {
        Self { provider, dim }
    }
}

#[async_trait::async_trait]
impl Embedder for LlmEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let response = self
            .provider
            .embeddings(EmbeddingsRequest {
                input: vec![text.to_string()],
                model: None,
            })
            .await?;
        let vector = response
            .embeddings
            .into_iter()
            .next()
            .ok_or_else(|| Error::Other("provider returned no embedding".into()))?;
        if vector.len() != self.dim {
            return Err(Error::invalid(format!(
                "provider embedding dimension {} does not match configured {}",
                vector.len(),
                self.dim
            )));
        }
        Ok(vector)
    }

    fn dim(&self) -> usize {
        self.dim
    }
}

pub struct LlmSummarizer {
    provider: Arc<dyn LlmProvider>,
}

impl LlmSummarizer {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait::async_trait]
impl Summarizer for LlmSummarizer {
    async fn summarize(&self, texts: &[String]) -> Result<String> {
        let joined = texts.join("\n---\n");
        let response = self
            .provider
            .chat(ChatRequest {
                messages: vec![
                    ChatMessage::system(
                        "Condense the following notes into one short paragraph. \
                         Keep concrete facts; drop filler.",
                    ),
                    ChatMessage::user(joined),
                ],
                tools: vec![],
                temperature: Some(0.2),
                max_tokens: Some(512),
                model: None,
            })
            .await?;
        Ok(response.content.trim().to_string())
    }
}
