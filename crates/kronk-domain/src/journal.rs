//! Journal entries: the chronological, typed event log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The kind of event a journal entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JournalEntryType {
    Thought,
    Action,
    Observation,
    Reflection,
    Decision,
    Error,
    Milestone,
}

impl JournalEntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JournalEntryType::Thought => "thought",
            JournalEntryType::Action => "action",
            JournalEntryType::Observation => "observation",
            JournalEntryType::Reflection => "reflection",
            JournalEntryType::Decision => "decision",
            JournalEntryType::Error => "error",
            JournalEntryType::Milestone => "milestone",
        }
    }

    pub fn parse(s: &str) -> Option<JournalEntryType> {
        match s {
            "thought" => Some(JournalEntryType::Thought),
            "action" => Some(JournalEntryType::Action),
            "observation" => Some(JournalEntryType::Observation),
            "reflection" => Some(JournalEntryType::Reflection),
            "decision" => Some(JournalEntryType::Decision),
            "error" => Some(JournalEntryType::Error),
            "milestone" => Some(JournalEntryType::Milestone),
            _ => None,
        }
    }
}

impl std::fmt::Display for JournalEntryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One appended journal entry. Entries are never updated or deleted
/// outside explicit maintenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalEntry {
    pub id: String,
    pub entry_type: JournalEntryType,
    pub content: String,
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub memory_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
}

/// Optional fields accepted when appending an entry.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalEntryOpts {
    pub session_id: Option<String>,
    pub parent_id: Option<String>,
    pub tool_id: Option<String>,
    #[serde(default)]
    pub memory_ids: Vec<String>,
    pub input: Option<Value>,
    pub output: Option<Value>,
    pub duration_ms: Option<u64>,
    pub tokens_used: Option<u64>,
    pub confidence: Option<f64>,
    pub metadata: Option<Value>,
}
