//! The journal: an append-only, typed log of what the agent thought and
//! did, grouped into sessions.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;

use kronk_domain::event::{Event, EventBus};
use kronk_domain::id::new_id;
use kronk_domain::journal::{JournalEntry, JournalEntryOpts, JournalEntryType};
use kronk_domain::memory::{MemoryInput, MemorySource, MemoryTier};
use kronk_domain::session::{Session, SessionStatus};
use kronk_domain::Result;
use kronk_memory::{MemoryManager, Summarizer};
use kronk_store::Store;

/// Append-only journal with session tracking.
///
/// The current session id, once set by [`Journal::start_session`], is
/// inherited by every subsequent entry until [`Journal::end_session`].
pub struct Journal {
    store: Arc<Store>,
    bus: EventBus,
    current_session: Mutex<Option<String>>,
}

impl Journal {
    pub fn new(store: Arc<Store>, bus: EventBus) -> Self {
        Self {
            store,
            bus,
            current_session: Mutex::new(None),
        }
    }

    // ── Session lifecycle ──────────────────────────────────────────

    /// Create an `active` session and make it current.
    pub fn start_session(&self, goal: &str) -> Result<Session> {
        let session = Session {
            id: new_id(),
            name: None,
            status: SessionStatus::Active,
            goal: goal.to_string(),
            context: HashMap::new(),
            started_at: Utc::now(),
            ended_at: None,
        };
        self.store.insert_session(&session)?;
        *self.current_session.lock() = Some(session.id.clone());
        tracing::debug!(session_id = %session.id, "session started");
        Ok(session)
    }

    /// End the current session with the given status.
    pub fn end_session(&self, status: SessionStatus) -> Result<Option<String>> {
        let id = self.current_session.lock().take();
        if let Some(id) = &id {
            self.store.set_session_status(id, status)?;
            tracing::debug!(session_id = %id, status = status.as_str(), "session ended");
        }
        Ok(id)
    }

    pub fn current_session_id(&self) -> Option<String> {
        self.current_session.lock().clone()
    }

    // ── Append ─────────────────────────────────────────────────────

    /// Append one entry. The current session id is filled in unless the
    /// caller supplied one explicitly.
    pub fn log(
        &self,
        entry_type: JournalEntryType,
        content: &str,
        opts: JournalEntryOpts,
    ) -> Result<JournalEntry> {
        let session_id = opts.session_id.or_else(|| self.current_session_id());
        let entry = JournalEntry {
            id: new_id(),
            entry_type,
            content: content.to_string(),
            embedding: None,
            session_id,
            parent_id: opts.parent_id,
            tool_id: opts.tool_id,
            memory_ids: opts.memory_ids,
            input: opts.input,
            output: opts.output,
            duration_ms: opts.duration_ms,
            tokens_used: opts.tokens_used,
            confidence: opts.confidence,
            metadata: opts.metadata,
            created_at: Utc::now(),
        };
        self.store.insert_journal_entry(&entry)?;
        self.bus.publish(Event::JournalAppended {
            entry: entry.clone(),
        });
        Ok(entry)
    }

    pub fn thought(&self, content: &str) -> Result<JournalEntry> {
        self.log(JournalEntryType::Thought, content, JournalEntryOpts::default())
    }

    pub fn action(&self, content: &str, opts: JournalEntryOpts) -> Result<JournalEntry> {
        self.log(JournalEntryType::Action, content, opts)
    }

    pub fn observation(&self, content: &str) -> Result<JournalEntry> {
        self.log(JournalEntryType::Observation, content, JournalEntryOpts::default())
    }

    pub fn reflection(&self, content: &str) -> Result<JournalEntry> {
        self.log(JournalEntryType::Reflection, content, JournalEntryOpts::default())
    }

    pub fn decision(&self, content: &str) -> Result<JournalEntry> {
        self.log(JournalEntryType::Decision, content, JournalEntryOpts::default())
    }

    pub fn error(&self, content: &str) -> Result<JournalEntry> {
        self.log(JournalEntryType::Error, content, JournalEntryOpts::default())
    }

    pub fn milestone(&self, content: &str) -> Result<JournalEntry> {
        self.log(JournalEntryType::Milestone, content, JournalEntryOpts::default())
    }

    // ── Queries ────────────────────────────────────────────────────

    pub fn get_recent(&self, n: usize) -> Result<Vec<JournalEntry>> {
        self.store.recent_journal_entries(n)
    }

    pub fn get_by_type(&self, entry_type: JournalEntryType, n: usize) -> Result<Vec<JournalEntry>> {
        self.store.journal_entries_by_type(entry_type, n)
    }

    pub fn search(&self, query: &str, limit: usize) -> Result<Vec<JournalEntry>> {
        self.store.search_journal_content(query, limit)
    }

    /// Render the `n` most recent entries as a chronological narrative
    /// with typed prefixes.
    pub fn format_as_narrative(&self, n: usize) -> Result<String> {
        let mut entries = self.get_recent(n)?;
        entries.reverse();
        let mut out = String::new();
        for e in entries {
            out.push_str(&format!(
                "[{}] {} {}\n",
                e.entry_type.as_str().to_uppercase(),
                e.created_at.format("%Y-%m-%d %H:%M:%S"),
                e.content
            ));
        }
        Ok(out)
    }

    /// Summarize the recent window into a reflection, written both as a
    /// `reflection` entry and a working-tier memory.
    pub async fn reflect(
        &self,
        memory: &MemoryManager,
        summarizer: &dyn Summarizer,
        window: usize,
    ) -> Result<Option<JournalEntry>> {
        let narrative = self.format_as_narrative(window)?;
        if narrative.trim().is_empty() {
            return Ok(None);
        }
        let text = summarizer.summarize(&[narrative]).await?;
        let entry = self.reflection(&text)?;
        memory
            .store(MemoryInput {
                content: text,
                tier: Some(MemoryTier::Working),
                importance: None,
                source: Some(MemorySource::Inference),
                tags: vec!["reflection".into()],
                related_ids: Vec::new(),
                expires_at: None,
            })
            .await?;
        Ok(Some(entry))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use kronk_domain::config::MemoryLimits;
    use kronk_store::StoreOptions;

    fn journal() -> (Journal, Arc<Store>) {
        let store = Arc::new(Store::open_in_memory(StoreOptions::default()).unwrap());
        (Journal::new(store.clone(), EventBus::new()), store)
    }

    #[test]
    fn entries_inherit_current_session() {
        let (journal, store) = journal();
        let session = journal.start_session("solve it").unwrap();
        let entry = journal.thought("thinking").unwrap();
        assert_eq!(entry.session_id.as_deref(), Some(session.id.as_str()));

        // Every entry with a session id references an existing row.
        assert!(store.get_session(&session.id).unwrap().is_some());

        journal.end_session(SessionStatus::Completed).unwrap();
        let after = journal.observation("no session now").unwrap();
        assert!(after.session_id.is_none());
    }

    #[test]
    fn narrative_is_chronological_with_typed_prefixes() {
        let (journal, _) = journal();
        journal.thought("first").unwrap();
        journal.action("second", JournalEntryOpts::default()).unwrap();
        journal.milestone("third").unwrap();

        let narrative = journal.format_as_narrative(10).unwrap();
        let lines: Vec<&str> = narrative.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("[THOUGHT]"));
        assert!(lines[1].starts_with("[ACTION]"));
        assert!(lines[2].starts_with("[MILESTONE]"));
        assert!(lines[0].ends_with("first"));
    }

    #[test]
    fn get_by_type_filters() {
        let (journal, _) = journal();
        journal.thought("a").unwrap();
        journal.error("bad").unwrap();

        let errors = journal.get_by_type(JournalEntryType::Error, 10).unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].content, "bad");
    }

    struct EchoSummarizer;

    #[async_trait::async_trait]
    impl Summarizer for EchoSummarizer {
        async fn summarize(&self, texts: &[String]) -> Result<String> {
            Ok(format!("reflection on {} chars", texts.iter().map(String::len).sum::<usize>()))
        }
    }

    #[tokio::test]
    async fn reflect_writes_entry_and_memory() {
        let store = Arc::new(Store::open_in_memory(StoreOptions::default()).unwrap());
        let bus = EventBus::new();
        let journal = Journal::new(store.clone(), bus.clone());
        let memory = MemoryManager::new(store.clone(), bus, MemoryLimits::default());

        journal.thought("pondered the problem").unwrap();
        let entry = journal
            .reflect(&memory, &EchoSummarizer, 10)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.entry_type, JournalEntryType::Reflection);

        let working = memory.get_by_tier(MemoryTier::Working, None).unwrap();
        assert_eq!(working.len(), 1);
        assert!(working[0].tags.contains(&"reflection".to_string()));
    }

    #[tokio::test]
    async fn reflect_on_empty_journal_is_noop() {
        let store = Arc::new(Store::open_in_memory(StoreOptions::default()).unwrap());
        let bus = EventBus::new();
        let journal = Journal::new(store.clone(), bus.clone());
        let memory = MemoryManager::new(store, bus, MemoryLimits::default());

        let result = journal.reflect(&memory, &EchoSummarizer, 10).await.unwrap();
        assert!(result.is_none());
    }
}
