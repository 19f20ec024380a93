//! Tiered memory entities.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tier
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One of the three memory partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryTier {
    /// Long-horizon knowledge: small budget, near-zero decay.
    System2,
    /// Active working set: largest budget, moderate decay.
    Working,
    /// Short-term scratch: small budget, fast decay.
    System1,
}

impl MemoryTier {
    pub const ALL: [MemoryTier; 3] = [MemoryTier::System2, MemoryTier::Working, MemoryTier::System1];

    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryTier::System2 => "system2",
            MemoryTier::Working => "working",
            MemoryTier::System1 => "system1",
        }
    }

    pub fn parse(s: &str) -> Option<MemoryTier> {
        match s {
            "system2" => Some(MemoryTier::System2),
            "working" => Some(MemoryTier::Working),
            "system1" => Some(MemoryTier::System1),
            _ => None,
        }
    }

    /// Token budget for context-window assembly.
    pub fn max_tokens(&self) -> usize {
        match self {
            MemoryTier::System2 => 4000,
            MemoryTier::Working => 8000,
            MemoryTier::System1 => 4000,
        }
    }

    /// Per-day decay rate applied by `apply_decay`.
    pub fn decay_rate(&self) -> f64 {
        match self {
            MemoryTier::System2 => 0.01,
            MemoryTier::Working => 0.10,
            MemoryTier::System1 => 0.50,
        }
    }

    /// Importance assigned when the caller does not supply one.
    pub fn default_importance(&self) -> f64 {
        match self {
            MemoryTier::System2 => 0.8,
            MemoryTier::Working => 0.6,
            MemoryTier::System1 => 0.3,
        }
    }
}

impl std::fmt::Display for MemoryTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Source
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Where a memory came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemorySource {
    User,
    Agent,
    Tool,
    Inference,
}

impl MemorySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemorySource::User => "user",
            MemorySource::Agent => "agent",
            MemorySource::Tool => "tool",
            MemorySource::Inference => "inference",
        }
    }

    pub fn parse(s: &str) -> Option<MemorySource> {
        match s {
            "user" => Some(MemorySource::User),
            "agent" => Some(MemorySource::Agent),
            "tool" => Some(MemorySource::Tool),
            "inference" => Some(MemorySource::Inference),
            _ => None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Memory
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A single persisted memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Memory {
    pub id: String,
    pub tier: MemoryTier,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Fixed-dimension embedding, present only when vector search is enabled.
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
    /// Relevance weight in [0, 1]; reduced over time by decay.
    pub importance: f64,
    pub access_count: u64,
    pub decay_rate: f64,
    pub source: MemorySource,
    pub tags: Vec<String>,
    pub related_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Memory {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|t| t <= now)
    }
}

/// Caller-facing input for creating a memory. Missing fields take the
/// tier defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryInput {
    pub content: String,
    #[serde(default)]
    pub tier: Option<MemoryTier>,
    #[serde(default)]
    pub importance: Option<f64>,
    #[serde(default)]
    pub source: Option<MemorySource>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub related_ids: Vec<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// A search hit: the memory plus its similarity to the query in [0, 1].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryHit {
    #[serde(flatten)]
    pub memory: Memory,
    pub similarity: f64,
}

/// Per-tier counts and token totals, as reported by `get_stats`.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStats {
    pub counts: HashMap<String, u64>,
    pub tokens: HashMap<String, usize>,
    pub total_count: u64,
    pub total_tokens: usize,
}
