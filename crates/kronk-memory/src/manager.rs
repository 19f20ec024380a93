//! The memory manager.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;

use kronk_domain::config::MemoryLimits;
use kronk_domain::event::{Event, EventBus};
use kronk_domain::id::new_id;
use kronk_domain::memory::{Memory, MemoryHit, MemoryInput, MemorySource, MemoryStats, MemoryTier};
use kronk_domain::Result;
use kronk_store::Store;

use crate::traits::{Embedder, Summarizer};
use crate::window::{estimate_tokens, ContextWindow};

/// Memories whose importance falls below this are removed by cleanup.
pub const IMPORTANCE_FLOOR: f64 = 1e-3;

/// Memories at or above this importance are consolidation candidates.
const CONSOLIDATION_MIN_IMPORTANCE: f64 = 0.3;

/// How many memories one consolidation pass collapses.
const CONSOLIDATION_BATCH: usize = 10;

/// Default similarity cutoff for vector search.
const DEFAULT_MIN_SIMILARITY: f64 = 0.3;

/// Options for [`MemoryManager::search`].
#[derive(Debug, Clone)]
pub struct SearchOpts {
    pub limit: usize,
    pub tier: Option<MemoryTier>,
    pub min_similarity: f64,
}

impl Default for SearchOpts {
    fn default() -> Self {
        Self {
            limit: 10,
            tier: None,
            min_similarity: DEFAULT_MIN_SIMILARITY,
        }
    }
}

/// Owns the three-tier store, produces the context window for every LLM
/// request, and runs maintenance (decay, cleanup, consolidation).
pub struct MemoryManager {
    store: Arc<Store>,
    bus: EventBus,
    limits: MemoryLimits,
    embedder: RwLock<Option<Arc<dyn Embedder>>>,
    summarizer: RwLock<Option<Arc<dyn Summarizer>>>,
}

impl MemoryManager {
    pub fn new(store: Arc<Store>, bus: EventBus, limits: MemoryLimits) -> Self {
        Self {
            store,
            bus,
            limits,
            embedder: RwLock::new(None),
            summarizer: RwLock::new(None),
        }
    }

    /// Attach an embedder; subsequent stores compute embeddings and
    /// searches go through vector similarity.
    pub fn set_embedder(&self, embedder: Arc<dyn Embedder>) {
        *self.embedder.write() = Some(embedder);
    }

    /// Attach the summarizer used by autosummarization.
    pub fn set_summarizer(&self, summarizer: Arc<dyn Summarizer>) {
        *self.summarizer.write() = Some(summarizer);
    }

    /// Effective token budget for a tier, honoring config overrides.
    pub fn tier_budget(&self, tier: MemoryTier) -> usize {
        let configured = match tier {
            MemoryTier::System2 => self.limits.system2,
            MemoryTier::Working => self.limits.working,
            MemoryTier::System1 => self.limits.system1,
        };
        configured.unwrap_or_else(|| tier.max_tokens())
    }

    // ── Create / read / update / delete ────────────────────────────

    /// Write a new memory, filling tier defaults for missing fields.
    pub async fn store(&self, input: MemoryInput) -> Result<Memory> {
        let now = Utc::now();
        let tier = input.tier.unwrap_or(MemoryTier::Working);
        let embedding = self.maybe_embed(&input.content).await;
        let memory = Memory {
            id: new_id(),
            tier,
            content: input.content,
            summary: None,
            embedding,
            importance: input
                .importance
                .unwrap_or_else(|| tier.default_importance())
                .clamp(0.0, 1.0),
            access_count: 0,
            decay_rate: tier.decay_rate(),
            source: input.source.unwrap_or(MemorySource::Agent),
            tags: input.tags,
            related_ids: input.related_ids,
            created_at: now,
            updated_at: now,
            last_accessed_at: now,
            expires_at: input.expires_at,
        };
        self.store.insert_memory(&memory)?;
        self.bus.publish(Event::MemoryStored {
            id: memory.id.clone(),
            tier,
        });

        // Keep the tier inside its budget when a summarizer is attached.
        if let Err(e) = self.autosummarize_tier(tier).await {
            tracing::warn!(tier = %tier, error = %e, "autosummarization failed");
        }
        Ok(memory)
    }

    /// Fetch by id, recording the access. Absent ids return `None`.
    pub fn get(&self, id: &str) -> Result<Option<Memory>> {
        let memory = self.store.get_memory(id)?;
        if memory.is_some() {
            self.store.touch_memory(id, Utc::now())?;
        }
        Ok(memory)
    }

    pub fn update(&self, memory: &Memory) -> Result<bool> {
        let mut updated = memory.clone();
        updated.updated_at = Utc::now();
        self.store.update_memory(&updated)
    }

    pub fn delete(&self, id: &str) -> Result<bool> {
        self.store.delete_memory(id)
    }

    /// Memories in one tier, importance DESC then recency DESC.
    pub fn get_by_tier(&self, tier: MemoryTier, limit: Option<usize>) -> Result<Vec<Memory>> {
        self.store.list_memories_by_tier(tier, limit)
    }

    // ── Search ─────────────────────────────────────────────────────

    /// Vector similarity when an embedder and vector store are both
    /// available; otherwise content match scored by importance and
    /// recency. Hits always carry a similarity in [0, 1].
    pub async fn search(&self, query: &str, opts: SearchOpts) -> Result<Vec<MemoryHit>> {
        let embedder = self.embedder.read().clone();
        if let (Some(embedder), true) = (embedder, self.store.vector_enabled()) {
            let vector = embedder.embed(query).await?;
            let scored = self.store.search_memories_vector(
                &vector,
                opts.min_similarity,
                opts.tier,
                opts.limit,
            )?;
            let now = Utc::now();
            for (memory, _) in &scored {
                self.store.touch_memory(&memory.id, now)?;
            }
            return Ok(scored
                .into_iter()
                .map(|(memory, similarity)| MemoryHit {
                    memory,
                    similarity: similarity.clamp(0.0, 1.0),
                })
                .collect());
        }

        let matches = self
            .store
            .search_memories_content(query, opts.tier, opts.limit)?;
        let now = Utc::now();
        let mut hits = Vec::with_capacity(matches.len());
        for memory in matches {
            self.store.touch_memory(&memory.id, now)?;
            let age_days = (now - memory.last_accessed_at).num_seconds() as f64 / 86_400.0;
            let recency = (-age_days / 30.0).exp();
            let similarity = ((memory.importance + recency) / 2.0).clamp(0.0, 1.0);
            hits.push(MemoryHit { memory, similarity });
        }
        hits.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(hits)
    }

    // ── Maintenance ────────────────────────────────────────────────

    /// Multiply each memory's importance by `exp(−decayRate · days)`
    /// using time elapsed since its last access. Returns the number of
    /// memories decayed. Repeated calls compound: decaying twice equals
    /// decaying once over double the elapsed time.
    pub fn apply_decay(&self) -> Result<u64> {
        let now = Utc::now();
        let mut decayed = 0;
        for memory in self.store.list_all_memories()? {
            let elapsed_days = (now - memory.last_accessed_at).num_seconds() as f64 / 86_400.0;
            if elapsed_days <= 0.0 {
                continue;
            }
            let importance = memory.importance * (-memory.decay_rate * elapsed_days).exp();
            self.store.set_memory_importance(&memory.id, importance, now)?;
            decayed += 1;
            if importance < IMPORTANCE_FLOOR {
                tracing::debug!(id = %memory.id, "memory fell below importance floor");
            }
        }
        Ok(decayed)
    }

    /// Delete expired memories and those below the importance floor.
    pub fn cleanup(&self) -> Result<u64> {
        let removed = self.store.cleanup_memories(Utc::now(), IMPORTANCE_FLOOR)?;
        if removed > 0 {
            tracing::info!(removed, "memory cleanup");
        }
        Ok(removed)
    }

    /// Collapse the oldest consolidation-eligible memories in `tier`
    /// into a single summary memory of the same tier.
    ///
    /// The summary's importance is the maximum of the inputs. The inputs
    /// are deleted only after the summary is durably written; partial
    /// failure leaves them intact. An empty eligible set is a no-op.
    pub async fn consolidate(
        &self,
        tier: MemoryTier,
        summarizer: &dyn Summarizer,
    ) -> Result<Option<Memory>> {
        let inputs =
            self.store
                .oldest_memories_above(tier, CONSOLIDATION_MIN_IMPORTANCE, CONSOLIDATION_BATCH)?;
        if inputs.len() < 2 {
            return Ok(None);
        }

        let texts: Vec<String> = inputs.iter().map(|m| m.content.clone()).collect();
        let summary_text = summarizer.summarize(&texts).await?;
        let embedding = self.maybe_embed(&summary_text).await;
        let importance = inputs
            .iter()
            .map(|m| m.importance)
            .fold(0.0f64, f64::max);
        let now = Utc::now();
        let summary = Memory {
            id: new_id(),
            tier,
            content: summary_text,
            summary: None,
            embedding,
            importance,
            access_count: 0,
            decay_rate: tier.decay_rate(),
            source: MemorySource::Inference,
            tags: vec!["consolidated".into()],
            related_ids: Vec::new(),
            created_at: now,
            updated_at: now,
            last_accessed_at: now,
            expires_at: None,
        };

        let input_ids: Vec<String> = inputs.iter().map(|m| m.id.clone()).collect();
        self.store.consolidate_replace(&summary, &input_ids)?;
        self.bus.publish(Event::MemoryStored {
            id: summary.id.clone(),
            tier,
        });
        tracing::info!(tier = %tier, inputs = input_ids.len(), "consolidated memories");
        Ok(Some(summary))
    }

    /// Run one consolidation pass over every tier with the attached
    /// summarizer. Without one this is a no-op.
    pub async fn consolidate_all(&self) -> Result<u64> {
        let Some(summarizer) = self.summarizer.read().clone() else {
            return Ok(0);
        };
        let mut consolidated = 0;
        for tier in MemoryTier::ALL {
            if self.consolidate(tier, summarizer.as_ref()).await?.is_some() {
                consolidated += 1;
            }
        }
        Ok(consolidated)
    }

    /// Collapse the oldest low-importance memories of any tier that
    /// exceeds its token budget until it fits again.
    pub async fn autosummarize(&self) -> Result<()> {
        for tier in MemoryTier::ALL {
            self.autosummarize_tier(tier).await?;
        }
        Ok(())
    }

    async fn autosummarize_tier(&self, tier: MemoryTier) -> Result<()> {
        let Some(summarizer) = self.summarizer.read().clone() else {
            return Ok(());
        };
        let budget = self.tier_budget(tier);

        // Bounded: each pass removes at least one row, so the tier
        // shrinks monotonically.
        loop {
            let memories = self.store.list_memories_by_tier(tier, None)?;
            let total: usize = memories.iter().map(|m| estimate_tokens(&m.content)).sum();
            if total <= budget {
                return Ok(());
            }
            let inputs = self.store.oldest_low_importance(tier, 0.5, CONSOLIDATION_BATCH)?;
            if inputs.len() < 2 {
                tracing::debug!(tier = %tier, total, budget, "over budget but nothing to summarize");
                return Ok(());
            }
            let texts: Vec<String> = inputs.iter().map(|m| m.content.clone()).collect();
            let summary_text = summarizer.summarize(&texts).await?;
            let importance = inputs.iter().map(|m| m.importance).fold(0.0f64, f64::max);
            let now = Utc::now();
            let summary = Memory {
                id: new_id(),
                tier,
                content: summary_text,
                summary: None,
                embedding: None,
                importance,
                access_count: 0,
                decay_rate: tier.decay_rate(),
                source: MemorySource::Inference,
                tags: vec!["autosummary".into()],
                related_ids: Vec::new(),
                created_at: now,
                updated_at: now,
                last_accessed_at: now,
                expires_at: None,
            };
            let input_ids: Vec<String> = inputs.iter().map(|m| m.id.clone()).collect();
            self.store.consolidate_replace(&summary, &input_ids)?;
            tracing::info!(tier = %tier, collapsed = input_ids.len(), "autosummarized over-budget tier");
        }
    }

    // ── Context window ─────────────────────────────────────────────

    /// Greedy per-tier selection by importance DESC, stopping at each
    /// tier's token budget. Expired memories are elided.
    pub fn build_context_window(&self) -> Result<ContextWindow> {
        let now = Utc::now();
        let mut window = ContextWindow::default();
        for tier in MemoryTier::ALL {
            let budget = self.tier_budget(tier);
            let mut used = 0;
            for memory in self.store.list_memories_by_tier(tier, None)? {
                if memory.is_expired(now) {
                    continue;
                }
                let tokens = estimate_tokens(&memory.content);
                if used + tokens > budget {
                    break;
                }
                used += tokens;
                window.tier_mut(tier).push(memory);
            }
            window.total_tokens += used;
        }
        Ok(window)
    }

    /// Per-tier counts and token totals computed straight from the
    /// store's current rows.
    pub fn get_stats(&self) -> Result<MemoryStats> {
        let mut stats = MemoryStats::default();
        for tier in MemoryTier::ALL {
            let memories = self.store.list_memories_by_tier(tier, None)?;
            let tokens: usize = memories.iter().map(|m| estimate_tokens(&m.content)).sum();
            stats.counts.insert(tier.as_str().into(), memories.len() as u64);
            stats.tokens.insert(tier.as_str().into(), tokens);
            stats.total_count += memories.len() as u64;
            stats.total_tokens += tokens;
        }
        Ok(stats)
    }

    // ── Internal ───────────────────────────────────────────────────

    async fn maybe_embed(&self, text: &str) -> Option<Vec<f32>> {
        if !self.store.vector_enabled() {
            return None;
        }
        let embedder = self.embedder.read().clone()?;
        match embedder.embed(text).await {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!(error = %e, "embedding failed; storing without vector");
                None
            }
        }
    }

}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use kronk_store::StoreOptions;

    struct FixedSummarizer;

    #[async_trait::async_trait]
    impl Summarizer for FixedSummarizer {
        async fn summarize(&self, texts: &[String]) -> Result<String> {
            Ok(format!("summary of {} items", texts.len()))
        }
    }

    fn manager() -> MemoryManager {
        let store = Arc::new(Store::open_in_memory(StoreOptions::default()).unwrap());
        MemoryManager::new(store, EventBus::new(), MemoryLimits::default())
    }

    fn input(content: &str, tier: MemoryTier, importance: Option<f64>) -> MemoryInput {
        MemoryInput {
            content: content.into(),
            tier: Some(tier),
            importance,
            source: Some(MemorySource::User),
            tags: vec!["t".into()],
            related_ids: vec![],
            expires_at: None,
        }
    }

    #[tokio::test]
    async fn store_get_round_trip() {
        let mgr = manager();
        let stored = mgr
            .store(input("the sky is blue", MemoryTier::Working, None))
            .await
            .unwrap();
        let got = mgr.get(&stored.id).unwrap().unwrap();
        assert_eq!(got.content, stored.content);
        assert_eq!(got.tier, stored.tier);
        assert_eq!(got.tags, stored.tags);
        assert_eq!(got.source, stored.source);
        assert!((got.importance - 0.6).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn tier_defaults_apply() {
        let mgr = manager();
        let m = mgr
            .store(MemoryInput {
                content: "bare".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(m.tier, MemoryTier::Working);
        assert!((m.importance - 0.6).abs() < f64::EPSILON);
        assert!((m.decay_rate - 0.10).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn get_records_access() {
        let mgr = manager();
        let m = mgr.store(input("x", MemoryTier::System1, None)).await.unwrap();
        mgr.get(&m.id).unwrap();
        mgr.get(&m.id).unwrap();
        // get() touches after the read, so the second read sees one touch.
        let got = mgr.get(&m.id).unwrap().unwrap();
        assert_eq!(got.access_count, 2);
    }

    #[tokio::test]
    async fn stats_match_store_totals() {
        let mgr = manager();
        mgr.store(input(&"a".repeat(40), MemoryTier::Working, None)).await.unwrap();
        mgr.store(input(&"b".repeat(10), MemoryTier::Working, None)).await.unwrap();
        mgr.store(input("cc", MemoryTier::System1, None)).await.unwrap();

        let stats = mgr.get_stats().unwrap();
        assert_eq!(stats.counts["working"], 2);
        assert_eq!(stats.tokens["working"], 10 + 3);
        assert_eq!(stats.counts["system1"], 1);
        assert_eq!(stats.tokens["system1"], 1);
        assert_eq!(stats.total_count, 3);
        assert_eq!(stats.total_tokens, 14);
    }

    #[tokio::test]
    async fn context_window_is_greedy_by_importance() {
        let mgr = manager();
        // Budget for system1 is 4000 tokens; each memory is 1000.
        for i in 0..6 {
            let importance = 0.1 + 0.1 * i as f64;
            mgr.store(input(
                &format!("{i}").repeat(4000),
                MemoryTier::System1,
                Some(importance),
            ))
            .await
            .unwrap();
        }
        let window = mgr.build_context_window().unwrap();
        assert_eq!(window.system1.len(), 4);
        // Highest importance first.
        assert!(window.system1[0].importance > window.system1[3].importance);
        assert_eq!(window.total_tokens, 4000);
    }

    #[tokio::test]
    async fn expired_memories_are_elided_from_window() {
        let mgr = manager();
        let mut expired = input("gone", MemoryTier::Working, Some(0.9));
        expired.expires_at = Some(Utc::now() - chrono::Duration::minutes(1));
        mgr.store(expired).await.unwrap();
        mgr.store(input("kept", MemoryTier::Working, Some(0.5))).await.unwrap();

        let window = mgr.build_context_window().unwrap();
        assert_eq!(window.working.len(), 1);
        assert_eq!(window.working[0].content, "kept");
    }

    #[tokio::test]
    async fn decay_reduces_importance_exponentially() {
        let mgr = manager();
        let m = mgr.store(input("fade", MemoryTier::System1, Some(0.8))).await.unwrap();

        // Backdate the last access by one day.
        let mut aged = mgr.get(&m.id).unwrap().unwrap();
        aged.last_accessed_at = Utc::now() - chrono::Duration::days(1);
        mgr.update(&aged).unwrap();

        let decayed = mgr.apply_decay().unwrap();
        assert!(decayed >= 1);

        let after = mgr.store.get_memory(&m.id).unwrap().unwrap();
        let expected = 0.8 * (-0.5f64).exp();
        assert!((after.importance - expected).abs() < 0.01, "{}", after.importance);
    }

    #[tokio::test]
    async fn double_decay_compounds() {
        let mgr = manager();
        let m = mgr.store(input("fade", MemoryTier::Working, Some(0.8))).await.unwrap();
        let mut aged = mgr.store.get_memory(&m.id).unwrap().unwrap();
        aged.last_accessed_at = Utc::now() - chrono::Duration::days(2);
        mgr.store.update_memory(&aged).unwrap();

        mgr.apply_decay().unwrap();
        mgr.apply_decay().unwrap();

        // Two passes over ~2 elapsed days each ≈ one pass over 4 days.
        let after = mgr.store.get_memory(&m.id).unwrap().unwrap();
        let expected = 0.8 * (-0.10f64 * 4.0).exp();
        assert!((after.importance - expected).abs() < 0.01, "{}", after.importance);
    }

    #[tokio::test]
    async fn cleanup_removes_floor_and_expired() {
        let mgr = manager();
        mgr.store(input("tiny", MemoryTier::System1, Some(0.0))).await.unwrap();
        let mut gone = input("expired", MemoryTier::System1, Some(0.9));
        gone.expires_at = Some(Utc::now() - chrono::Duration::minutes(1));
        mgr.store(gone).await.unwrap();
        mgr.store(input("stays", MemoryTier::System1, Some(0.5))).await.unwrap();

        assert_eq!(mgr.cleanup().unwrap(), 2);
        assert_eq!(mgr.get_by_tier(MemoryTier::System1, None).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn consolidate_empty_set_is_noop() {
        let mgr = manager();
        let result = mgr.consolidate(MemoryTier::Working, &FixedSummarizer).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn consolidate_takes_max_importance_and_deletes_inputs() {
        let mgr = manager();
        mgr.store(input("one", MemoryTier::Working, Some(0.4))).await.unwrap();
        mgr.store(input("two", MemoryTier::Working, Some(0.7))).await.unwrap();
        mgr.store(input("below threshold", MemoryTier::Working, Some(0.1))).await.unwrap();

        let summary = mgr
            .consolidate(MemoryTier::Working, &FixedSummarizer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(summary.content, "summary of 2 items");
        assert!((summary.importance - 0.7).abs() < f64::EPSILON);

        let remaining = mgr.get_by_tier(MemoryTier::Working, None).unwrap();
        // Summary plus the below-threshold row.
        assert_eq!(remaining.len(), 2);
    }

    #[tokio::test]
    async fn content_search_scores_in_unit_interval() {
        let mgr = manager();
        mgr.store(input("rust is fast", MemoryTier::Working, Some(0.9))).await.unwrap();
        mgr.store(input("rust is safe", MemoryTier::Working, Some(0.2))).await.unwrap();
        mgr.store(input("python is slow", MemoryTier::Working, None)).await.unwrap();

        let hits = mgr.search("rust", SearchOpts::default()).await.unwrap();
        assert_eq!(hits.len(), 2);
        for hit in &hits {
            assert!((0.0..=1.0).contains(&hit.similarity));
        }
        assert!(hits[0].memory.importance >= hits[1].memory.importance);
    }

    #[tokio::test]
    async fn autosummarize_collapses_over_budget_tier() {
        let store = Arc::new(Store::open_in_memory(StoreOptions::default()).unwrap());
        let limits = MemoryLimits {
            system1: Some(50),
            ..Default::default()
        };
        let mgr = MemoryManager::new(store, EventBus::new(), limits);
        mgr.set_summarizer(Arc::new(FixedSummarizer));

        // 5 × 100 chars = 125 tokens, far over the 50-token budget.
        for i in 0..5 {
            mgr.store(input(&format!("{i}").repeat(100), MemoryTier::System1, Some(0.2)))
                .await
                .unwrap();
        }
        let stats = mgr.get_stats().unwrap();
        assert!(
            stats.tokens["system1"] <= 50 || stats.counts["system1"] < 5,
            "autosummarization should have collapsed rows: {stats:?}"
        );
    }
}
