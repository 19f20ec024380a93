//! LLM provider adapters.
//!
//! Each adapter translates the neutral message log to and from one
//! vendor's wire format. The agent loop only ever sees [`LlmProvider`].

mod anthropic;
mod ollama;
mod openai;
mod sse;
mod traits;
mod util;

use std::sync::Arc;

use kronk_domain::config::{KronkConfig, ProviderKind};
use kronk_domain::Result;

pub use anthropic::AnthropicProvider;
pub use ollama::OllamaProvider;
pub use openai::OpenAiProvider;
pub use traits::{ChatRequest, ChatResponse, EmbeddingsRequest, EmbeddingsResponse, LlmProvider};

/// Build the configured provider. Environment overrides have already
/// been applied to the config by the loader.
pub fn create_provider(config: &KronkConfig) -> Result<Arc<dyn LlmProvider>> {
    let provider: Arc<dyn LlmProvider> = match config.provider {
        ProviderKind::Ollama => Arc::new(OllamaProvider::from_config(config)?),
        ProviderKind::Openai => Arc::new(OpenAiProvider::from_config(config)?),
        ProviderKind::Anthropic => Arc::new(AnthropicProvider::from_config(config)?),
    };
    tracing::info!(provider = config.provider.as_str(), "LLM provider ready");
    Ok(provider)
}
