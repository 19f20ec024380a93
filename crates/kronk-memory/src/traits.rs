//! Seams to the language-model layer. The manager never talks to a
//! provider directly; the daemon injects these at wiring time.

use kronk_domain::Result;

/// Computes text embeddings for similarity search.
#[async_trait::async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Dimension of the vectors this embedder produces.
    fn dim(&self) -> usize;
}

/// Collapses several memories into one summary.
#[async_trait::async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, texts: &[String]) -> Result<String>;
}
