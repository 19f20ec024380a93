//! The tiered memory manager: tier defaults, decay, consolidation, and
//! context-window assembly.

mod manager;
mod traits;
mod window;

pub use manager::{MemoryManager, SearchOpts, IMPORTANCE_FLOOR};
pub use traits::{Embedder, Summarizer};
pub use window::{estimate_tokens, ContextWindow};
