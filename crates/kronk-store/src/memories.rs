//! Memory table queries.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use kronk_domain::memory::{Memory, MemorySource, MemoryTier};
use kronk_domain::{Error, Result};

use crate::vector::{cosine_similarity, decode, encode};
use crate::{json_err, parse_ts, ts, Store};

const BASE_COLS: &str = "id, tier, content, summary, importance, access_count, decay_rate, \
     source, tags, related_ids, created_at, updated_at, last_accessed_at, expires_at";

fn row_to_memory(row: &Row<'_>, has_embedding: bool) -> rusqlite::Result<Memory> {
    let tier: String = row.get(1)?;
    let source: String = row.get(7)?;
    let tags: String = row.get(8)?;
    let related: String = row.get(9)?;
    let created: String = row.get(10)?;
    let updated: String = row.get(11)?;
    let accessed: String = row.get(12)?;
    let expires: Option<String> = row.get(13)?;
    let embedding = if has_embedding {
        row.get::<_, Option<Vec<u8>>>(14)?.map(|b| decode(&b))
    } else {
        None
    };

    Ok(Memory {
        id: row.get(0)?,
        tier: MemoryTier::parse(&tier).unwrap_or(MemoryTier::Working),
        content: row.get(2)?,
        summary: row.get(3)?,
        embedding,
        importance: row.get(4)?,
        access_count: row.get::<_, i64>(5)? as u64,
        decay_rate: row.get(6)?,
        source: MemorySource::parse(&source).unwrap_or(MemorySource::Agent),
        tags: serde_json::from_str(&tags).map_err(json_err)?,
        related_ids: serde_json::from_str(&related).map_err(json_err)?,
        created_at: parse_ts(&created)?,
        updated_at: parse_ts(&updated)?,
        last_accessed_at: parse_ts(&accessed)?,
        expires_at: match expires {
            Some(s) => Some(parse_ts(&s)?),
            None => None,
        },
    })
}

impl Store {
    fn memory_cols(&self) -> String {
        if self.vector_enabled() {
            format!("{BASE_COLS}, embedding")
        } else {
            BASE_COLS.to_string()
        }
    }

    pub fn insert_memory(&self, m: &Memory) -> Result<()> {
        if let Some(embedding) = &m.embedding {
            self.check_dim(embedding)?;
        }
        let tags = serde_json::to_string(&m.tags)?;
        let related = serde_json::to_string(&m.related_ids)?;
        self.with_conn(|conn| {
            if self.vector_enabled() {
                conn.execute(
                    &format!("INSERT INTO memory ({BASE_COLS}, embedding) \
                         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)"),
                    params![
                        m.id,
                        m.tier.as_str(),
                        m.content,
                        m.summary,
                        m.importance,
                        m.access_count as i64,
                        m.decay_rate,
                        m.source.as_str(),
                        tags,
                        related,
                        ts(m.created_at),
                        ts(m.updated_at),
                        ts(m.last_accessed_at),
                        m.expires_at.map(ts),
                        m.embedding.as_deref().map(encode),
                    ],
                )?;
            } else {
                conn.execute(
                    &format!("INSERT INTO memory ({BASE_COLS}) \
                         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14)"),
                    params![
                        m.id,
                        m.tier.as_str(),
                        m.content,
                        m.summary,
                        m.importance,
                        m.access_count as i64,
                        m.decay_rate,
                        m.source.as_str(),
                        tags,
                        related,
                        ts(m.created_at),
                        ts(m.updated_at),
                        ts(m.last_accessed_at),
                        m.expires_at.map(ts),
                    ],
                )?;
            }
            Ok(())
        })
    }

    pub fn get_memory(&self, id: &str) -> Result<Option<Memory>> {
        let cols = self.memory_cols();
        let has_embedding = self.vector_enabled();
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {cols} FROM memory WHERE id = ?1"),
                [id],
                |row| row_to_memory(row, has_embedding),
            )
            .optional()
            .map_err(Error::from)
        })
    }

    /// Record an access: bump the counter and refresh `last_accessed_at`.
    pub fn touch_memory(&self, id: &str, now: DateTime<Utc>) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE memory SET access_count = access_count + 1, last_accessed_at = ?2 \
                 WHERE id = ?1",
                params![id, ts(now)],
            )?;
            Ok(())
        })
    }

    /// Full-row update (content, tier, importance, tags, …); returns
    /// false when the id does not exist.
    pub fn update_memory(&self, m: &Memory) -> Result<bool> {
        let tags = serde_json::to_string(&m.tags)?;
        let related = serde_json::to_string(&m.related_ids)?;
        self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE memory SET tier=?2, content=?3, summary=?4, importance=?5, \
                 access_count=?6, decay_rate=?7, source=?8, tags=?9, related_ids=?10, \
                 updated_at=?11, last_accessed_at=?12, expires_at=?13 WHERE id=?1",
                params![
                    m.id,
                    m.tier.as_str(),
                    m.content,
                    m.summary,
                    m.importance,
                    m.access_count as i64,
                    m.decay_rate,
                    m.source.as_str(),
                    tags,
                    related,
                    ts(m.updated_at),
                    ts(m.last_accessed_at),
                    m.expires_at.map(ts),
                ],
            )?;
            Ok(n > 0)
        })
    }

    pub fn set_memory_importance(&self, id: &str, importance: f64, now: DateTime<Utc>) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE memory SET importance = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, importance, ts(now)],
            )?;
            Ok(())
        })
    }

    pub fn delete_memory(&self, id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let n = conn.execute("DELETE FROM memory WHERE id = ?1", [id])?;
            Ok(n > 0)
        })
    }

    /// Memories in one tier, importance DESC then recency DESC.
    pub fn list_memories_by_tier(
        &self,
        tier: MemoryTier,
        limit: Option<usize>,
    ) -> Result<Vec<Memory>> {
        let cols = self.memory_cols();
        let has_embedding = self.vector_enabled();
        let limit = limit.map_or(-1i64, |n| n as i64);
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {cols} FROM memory WHERE tier = ?1 \
                 ORDER BY importance DESC, last_accessed_at DESC LIMIT ?2"
            ))?;
            let rows = stmt.query_map(params![tier.as_str(), limit], |row| {
                row_to_memory(row, has_embedding)
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
        })
    }

    pub fn list_all_memories(&self) -> Result<Vec<Memory>> {
        let cols = self.memory_cols();
        let has_embedding = self.vector_enabled();
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {cols} FROM memory ORDER BY created_at ASC"
            ))?;
            let rows = stmt.query_map([], |row| row_to_memory(row, has_embedding))?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
        })
    }

    pub fn count_memories_by_tier(&self) -> Result<HashMap<String, u64>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT tier, COUNT(*) FROM memory GROUP BY tier")?;
            let mut counts: HashMap<String, u64> = MemoryTier::ALL
                .iter()
                .map(|t| (t.as_str().to_string(), 0))
                .collect();
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
            })?;
            for row in rows {
                let (tier, n) = row?;
                counts.insert(tier, n);
            }
            Ok(counts)
        })
    }

    /// Case-insensitive substring match, importance DESC then recency.
    pub fn search_memories_content(
        &self,
        query: &str,
        tier: Option<MemoryTier>,
        limit: usize,
    ) -> Result<Vec<Memory>> {
        let cols = self.memory_cols();
        let has_embedding = self.vector_enabled();
        let tier_str = tier.map(|t| t.as_str().to_string());
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {cols} FROM memory \
                 WHERE content LIKE '%' || ?1 || '%' COLLATE NOCASE \
                 AND (?2 IS NULL OR tier = ?2) \
                 ORDER BY importance DESC, last_accessed_at DESC LIMIT ?3"
            ))?;
            let rows = stmt.query_map(params![query, tier_str, limit as i64], |row| {
                row_to_memory(row, has_embedding)
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
        })
    }

    /// The oldest rows in `tier` at or above `min_importance`: the
    /// consolidation candidates.
    pub fn oldest_memories_above(
        &self,
        tier: MemoryTier,
        min_importance: f64,
        limit: usize,
    ) -> Result<Vec<Memory>> {
        let cols = self.memory_cols();
        let has_embedding = self.vector_enabled();
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {cols} FROM memory WHERE tier = ?1 AND importance >= ?2 \
                 ORDER BY created_at ASC LIMIT ?3"
            ))?;
            let rows = stmt.query_map(params![tier.as_str(), min_importance, limit as i64], |row| {
                row_to_memory(row, has_embedding)
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
        })
    }

    /// The oldest, least-important rows in `tier`, used as
    /// autosummarization input when the tier exceeds its token budget.
    pub fn oldest_low_importance(
        &self,
        tier: MemoryTier,
        max_importance: f64,
        limit: usize,
    ) -> Result<Vec<Memory>> {
        let cols = self.memory_cols();
        let has_embedding = self.vector_enabled();
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {cols} FROM memory WHERE tier = ?1 AND importance <= ?2 \
                 ORDER BY importance ASC, created_at ASC LIMIT ?3"
            ))?;
            let rows = stmt.query_map(params![tier.as_str(), max_importance, limit as i64], |row| {
                row_to_memory(row, has_embedding)
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
        })
    }

    /// Delete expired rows and rows below the importance floor; returns
    /// the number removed.
    pub fn cleanup_memories(&self, now: DateTime<Utc>, floor: f64) -> Result<u64> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "DELETE FROM memory WHERE (expires_at IS NOT NULL AND expires_at <= ?1) \
                 OR importance < ?2",
                params![ts(now), floor],
            )?;
            Ok(n as u64)
        })
    }

    /// Write a consolidation summary and delete its inputs in one
    /// transaction; partial failure leaves the inputs intact.
    pub fn consolidate_replace(&self, summary: &Memory, input_ids: &[String]) -> Result<()> {
        let tags = serde_json::to_string(&summary.tags)?;
        let related = serde_json::to_string(&summary.related_ids)?;
        let vector_enabled = self.vector_enabled();
        self.with_transaction(|tx| {
            if vector_enabled {
                tx.execute(
                    &format!("INSERT INTO memory ({BASE_COLS}, embedding) \
                         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)"),
                    params![
                        summary.id,
                        summary.tier.as_str(),
                        summary.content,
                        summary.summary,
                        summary.importance,
                        summary.access_count as i64,
                        summary.decay_rate,
                        summary.source.as_str(),
                        tags,
                        related,
                        ts(summary.created_at),
                        ts(summary.updated_at),
                        ts(summary.last_accessed_at),
                        summary.expires_at.map(ts),
                        summary.embedding.as_deref().map(encode),
                    ],
                )?;
            } else {
                tx.execute(
                    &format!("INSERT INTO memory ({BASE_COLS}) \
                         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14)"),
                    params![
                        summary.id,
                        summary.tier.as_str(),
                        summary.content,
                        summary.summary,
                        summary.importance,
                        summary.access_count as i64,
                        summary.decay_rate,
                        summary.source.as_str(),
                        tags,
                        related,
                        ts(summary.created_at),
                        ts(summary.updated_at),
                        ts(summary.last_accessed_at),
                        summary.expires_at.map(ts),
                    ],
                )?;
            }
            for id in input_ids {
                tx.execute("DELETE FROM memory WHERE id = ?1", [id])?;
            }
            Ok(())
        })
    }

    /// Cosine-similarity search over stored embeddings.
    ///
    /// Returns `(memory, similarity)` pairs with similarity ≥
    /// `min_similarity`, ordered descending, at most `limit`.
    pub fn search_memories_vector(
        &self,
        query: &[f32],
        min_similarity: f64,
        tier: Option<MemoryTier>,
        limit: usize,
    ) -> Result<Vec<(Memory, f64)>> {
        self.check_dim(query)?;
        let cols = self.memory_cols();
        let tier_str = tier.map(|t| t.as_str().to_string());
        let candidates = self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {cols} FROM memory \
                 WHERE embedding IS NOT NULL AND (?1 IS NULL OR tier = ?1)"
            ))?;
            let rows = stmt.query_map(params![tier_str], |row| row_to_memory(row, true))?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
        })?;

        let mut scored: Vec<(Memory, f64)> = candidates
            .into_iter()
            .filter_map(|m| {
                let sim = cosine_similarity(m.embedding.as_deref()?, query);
                (sim >= min_similarity).then_some((m, sim))
            })
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        Ok(scored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StoreOptions;
    use kronk_domain::id::new_id;

    fn mem(tier: MemoryTier, content: &str, importance: f64) -> Memory {
        let now = Utc::now();
        Memory {
            id: new_id(),
            tier,
            content: content.into(),
            summary: None,
            embedding: None,
            importance,
            access_count: 0,
            decay_rate: tier.decay_rate(),
            source: MemorySource::Agent,
            tags: vec!["test".into()],
            related_ids: vec![],
            created_at: now,
            updated_at: now,
            last_accessed_at: now,
            expires_at: None,
        }
    }

    #[test]
    fn insert_get_round_trip() {
        let store = Store::open_in_memory(StoreOptions::default()).unwrap();
        let m = mem(MemoryTier::Working, "remember the milk", 0.6);
        store.insert_memory(&m).unwrap();

        let got = store.get_memory(&m.id).unwrap().unwrap();
        assert_eq!(got.content, m.content);
        assert_eq!(got.tier, m.tier);
        assert_eq!(got.tags, m.tags);
        assert_eq!(got.source, m.source);
        assert!((got.importance - m.importance).abs() < f64::EPSILON);
    }

    #[test]
    fn embedding_round_trip() {
        let store = Store::open_in_memory(StoreOptions { vector_dim: Some(3) }).unwrap();
        let mut m = mem(MemoryTier::System2, "vec", 0.8);
        m.embedding = Some(vec![0.1, 0.2, 0.3]);
        store.insert_memory(&m).unwrap();
        let got = store.get_memory(&m.id).unwrap().unwrap();
        assert_eq!(got.embedding, m.embedding);
    }

    #[test]
    fn wrong_dimension_rejected() {
        let store = Store::open_in_memory(StoreOptions { vector_dim: Some(3) }).unwrap();
        let mut m = mem(MemoryTier::System2, "vec", 0.8);
        m.embedding = Some(vec![0.1, 0.2]);
        assert!(store.insert_memory(&m).is_err());
    }

    #[test]
    fn tier_listing_orders_by_importance() {
        let store = Store::open_in_memory(StoreOptions::default()).unwrap();
        store.insert_memory(&mem(MemoryTier::Working, "low", 0.2)).unwrap();
        store.insert_memory(&mem(MemoryTier::Working, "high", 0.9)).unwrap();
        store.insert_memory(&mem(MemoryTier::System1, "other tier", 0.5)).unwrap();

        let listed = store.list_memories_by_tier(MemoryTier::Working, None).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].content, "high");
    }

    #[test]
    fn cleanup_removes_expired_and_floor() {
        let store = Store::open_in_memory(StoreOptions::default()).unwrap();
        let mut expired = mem(MemoryTier::System1, "old", 0.5);
        expired.expires_at = Some(Utc::now() - chrono::Duration::hours(1));
        store.insert_memory(&expired).unwrap();
        store.insert_memory(&mem(MemoryTier::System1, "faded", 0.0001)).unwrap();
        store.insert_memory(&mem(MemoryTier::System1, "keep", 0.5)).unwrap();

        let removed = store.cleanup_memories(Utc::now(), 1e-3).unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.list_memories_by_tier(MemoryTier::System1, None).unwrap().len(), 1);
    }

    #[test]
    fn consolidate_replace_is_atomic() {
        let store = Store::open_in_memory(StoreOptions::default()).unwrap();
        let a = mem(MemoryTier::Working, "a", 0.5);
        let b = mem(MemoryTier::Working, "b", 0.7);
        store.insert_memory(&a).unwrap();
        store.insert_memory(&b).unwrap();

        let summary = mem(MemoryTier::Working, "a+b", 0.7);
        store
            .consolidate_replace(&summary, &[a.id.clone(), b.id.clone()])
            .unwrap();

        assert!(store.get_memory(&a.id).unwrap().is_none());
        assert!(store.get_memory(&b.id).unwrap().is_none());
        assert!(store.get_memory(&summary.id).unwrap().is_some());
    }

    #[test]
    fn vector_search_filters_and_orders() {
        let store = Store::open_in_memory(StoreOptions { vector_dim: Some(2) }).unwrap();
        let mut close = mem(MemoryTier::Working, "close", 0.5);
        close.embedding = Some(vec![1.0, 0.0]);
        let mut far = mem(MemoryTier::Working, "far", 0.5);
        far.embedding = Some(vec![0.0, 1.0]);
        let mut near = mem(MemoryTier::Working, "near", 0.5);
        near.embedding = Some(vec![0.9, 0.1]);
        for m in [&close, &far, &near] {
            store.insert_memory(m).unwrap();
        }

        let hits = store
            .search_memories_vector(&[1.0, 0.0], 0.5, None, 10)
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0.content, "close");
        assert_eq!(hits[1].0.content, "near");
    }
}
