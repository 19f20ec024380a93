//! Journal table queries. Entries are append-only; the only delete path
//! is explicit maintenance.

use rusqlite::{params, Row};

use kronk_domain::journal::{JournalEntry, JournalEntryType};
use kronk_domain::{Error, Result};

use crate::vector::{cosine_similarity, decode, encode};
use crate::{json_err, parse_ts, ts, Store};

const BASE_COLS: &str = "id, entry_type, content, session_id, parent_id, tool_id, memory_ids, \
     input, output, duration_ms, tokens_used, confidence, metadata, created_at";

fn row_to_entry(row: &Row<'_>, has_embedding: bool) -> rusqlite::Result<JournalEntry> {
    let entry_type: String = row.get(1)?;
    let memory_ids: String = row.get(6)?;
    let input: Option<String> = row.get(7)?;
    let output: Option<String> = row.get(8)?;
    let metadata: Option<String> = row.get(12)?;
    let created: String = row.get(13)?;
    let embedding = if has_embedding {
        row.get::<_, Option<Vec<u8>>>(14)?.map(|b| decode(&b))
    } else {
        None
    };

    Ok(JournalEntry {
        id: row.get(0)?,
        entry_type: JournalEntryType::parse(&entry_type).unwrap_or(JournalEntryType::Observation),
        content: row.get(2)?,
        embedding,
        session_id: row.get(3)?,
        parent_id: row.get(4)?,
        tool_id: row.get(5)?,
        memory_ids: serde_json::from_str(&memory_ids).map_err(json_err)?,
        input: match input {
            Some(s) => Some(serde_json::from_str(&s).map_err(json_err)?),
            None => None,
        },
        output: match output {
            Some(s) => Some(serde_json::from_str(&s).map_err(json_err)?),
            None => None,
        },
        duration_ms: row.get::<_, Option<i64>>(9)?.map(|v| v as u64),
        tokens_used: row.get::<_, Option<i64>>(10)?.map(|v| v as u64),
        confidence: row.get(11)?,
        metadata: match metadata {
            Some(s) => Some(serde_json::from_str(&s).map_err(json_err)?),
            None => None,
        },
        created_at: parse_ts(&created)?,
    })
}

impl Store {
    fn journal_cols(&self) -> String {
        if self.vector_enabled() {
            format!("{BASE_COLS}, embedding")
        } else {
            BASE_COLS.to_string()
        }
    }

    /// Append one entry. Foreign keys to `sessions`, `tools`, and the
    /// parent entry are enforced by the schema.
    pub fn insert_journal_entry(&self, e: &JournalEntry) -> Result<()> {
        if let Some(embedding) = &e.embedding {
            self.check_dim(embedding)?;
        }
        let memory_ids = serde_json::to_string(&e.memory_ids)?;
        let input = e.input.as_ref().map(serde_json::to_string).transpose()?;
        let output = e.output.as_ref().map(serde_json::to_string).transpose()?;
        let metadata = e.metadata.as_ref().map(serde_json::to_string).transpose()?;
        self.with_conn(|conn| {
            if self.vector_enabled() {
                conn.execute(
                    &format!("INSERT INTO journal ({BASE_COLS}, embedding) \
                         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)"),
                    params![
                        e.id,
                        e.entry_type.as_str(),
                        e.content,
                        e.session_id,
                        e.parent_id,
                        e.tool_id,
                        memory_ids,
                        input,
                        output,
                        e.duration_ms.map(|v| v as i64),
                        e.tokens_used.map(|v| v as i64),
                        e.confidence,
                        metadata,
                        ts(e.created_at),
                        e.embedding.as_deref().map(encode),
                    ],
                )?;
            } else {
                conn.execute(
                    &format!("INSERT INTO journal ({BASE_COLS}) \
                         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14)"),
                    params![
                        e.id,
                        e.entry_type.as_str(),
                        e.content,
                        e.session_id,
                        e.parent_id,
                        e.tool_id,
                        memory_ids,
                        input,
                        output,
                        e.duration_ms.map(|v| v as i64),
                        e.tokens_used.map(|v| v as i64),
                        e.confidence,
                        metadata,
                        ts(e.created_at),
                    ],
                )?;
            }
            Ok(())
        })
    }

    /// The `n` most recent entries, newest first. Ties on `created_at`
    /// fall back to insertion order.
    pub fn recent_journal_entries(&self, n: usize) -> Result<Vec<JournalEntry>> {
        let cols = self.journal_cols();
        let has_embedding = self.vector_enabled();
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {cols} FROM journal ORDER BY created_at DESC, rowid DESC LIMIT ?1"
            ))?;
            let rows = stmt.query_map([n as i64], |row| row_to_entry(row, has_embedding))?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
        })
    }

    pub fn journal_entries_by_type(
        &self,
        entry_type: JournalEntryType,
        n: usize,
    ) -> Result<Vec<JournalEntry>> {
        let cols = self.journal_cols();
        let has_embedding = self.vector_enabled();
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {cols} FROM journal WHERE entry_type = ?1 \
                 ORDER BY created_at DESC, rowid DESC LIMIT ?2"
            ))?;
            let rows = stmt.query_map(params![entry_type.as_str(), n as i64], |row| {
                row_to_entry(row, has_embedding)
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
        })
    }

    pub fn journal_entries_by_session(&self, session_id: &str) -> Result<Vec<JournalEntry>> {
        let cols = self.journal_cols();
        let has_embedding = self.vector_enabled();
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {cols} FROM journal WHERE session_id = ?1 \
                 ORDER BY created_at ASC, rowid ASC"
            ))?;
            let rows = stmt.query_map([session_id], |row| row_to_entry(row, has_embedding))?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
        })
    }

    pub fn search_journal_content(&self, query: &str, limit: usize) -> Result<Vec<JournalEntry>> {
        let cols = self.journal_cols();
        let has_embedding = self.vector_enabled();
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {cols} FROM journal WHERE content LIKE '%' || ?1 || '%' \
                 ORDER BY created_at DESC, rowid DESC LIMIT ?2"
            ))?;
            let rows = stmt.query_map(params![query, limit as i64], |row| {
                row_to_entry(row, has_embedding)
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
        })
    }

    pub fn search_journal_vector(
        &self,
        query: &[f32],
        min_similarity: f64,
        limit: usize,
    ) -> Result<Vec<(JournalEntry, f64)>> {
        self.check_dim(query)?;
        let cols = self.journal_cols();
        let candidates = self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {cols} FROM journal WHERE embedding IS NOT NULL"
            ))?;
            let rows = stmt.query_map([], |row| row_to_entry(row, true))?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
        })?;

        let mut scored: Vec<(JournalEntry, f64)> = candidates
            .into_iter()
            .filter_map(|e| {
                let sim = cosine_similarity(e.embedding.as_deref()?, query);
                (sim >= min_similarity).then_some((e, sim))
            })
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        Ok(scored)
    }

    pub fn count_journal_entries(&self) -> Result<u64> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM journal", [], |row| row.get(0))?;
            Ok(n as u64)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StoreOptions;
    use chrono::Utc;
    use kronk_domain::id::new_id;

    fn entry(entry_type: JournalEntryType, content: &str) -> JournalEntry {
        JournalEntry {
            id: new_id(),
            entry_type,
            content: content.into(),
            embedding: None,
            session_id: None,
            parent_id: None,
            tool_id: None,
            memory_ids: vec![],
            input: None,
            output: None,
            duration_ms: None,
            tokens_used: None,
            confidence: None,
            metadata: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn append_and_query() {
        let store = Store::open_in_memory(StoreOptions::default()).unwrap();
        store.insert_journal_entry(&entry(JournalEntryType::Thought, "first")).unwrap();
        store.insert_journal_entry(&entry(JournalEntryType::Action, "second")).unwrap();

        let recent = store.recent_journal_entries(10).unwrap();
        assert_eq!(recent.len(), 2);
        // Same-second ties break by insertion order.
        assert_eq!(recent[0].content, "second");

        let thoughts = store
            .journal_entries_by_type(JournalEntryType::Thought, 10)
            .unwrap();
        assert_eq!(thoughts.len(), 1);
        assert_eq!(thoughts[0].content, "first");
    }

    #[test]
    fn unknown_tool_reference_is_rejected() {
        let store = Store::open_in_memory(StoreOptions::default()).unwrap();
        let mut e = entry(JournalEntryType::Action, "used a tool");
        e.tool_id = Some("no-such-tool".into());
        assert!(store.insert_journal_entry(&e).is_err());
    }

    #[test]
    fn content_search() {
        let store = Store::open_in_memory(StoreOptions::default()).unwrap();
        store.insert_journal_entry(&entry(JournalEntryType::Thought, "refactor the parser")).unwrap();
        store.insert_journal_entry(&entry(JournalEntryType::Thought, "walk the dog")).unwrap();

        let hits = store.search_journal_content("parser", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].content, "refactor the parser");
    }
}
