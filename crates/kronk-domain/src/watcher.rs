//! Filesystem watcher entities.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What a watcher does when its debounce window closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatcherAction {
    /// Render the configured message template and start an agent run.
    Run,
    /// Store a memory with the configured tier/importance/tags.
    Memory,
    /// Enqueue a task of the configured type.
    Queue,
}

impl WatcherAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            WatcherAction::Run => "run",
            WatcherAction::Memory => "memory",
            WatcherAction::Queue => "queue",
        }
    }

    pub fn parse(s: &str) -> Option<WatcherAction> {
        match s {
            "run" => Some(WatcherAction::Run),
            "memory" => Some(WatcherAction::Memory),
            "queue" => Some(WatcherAction::Queue),
            _ => None,
        }
    }
}

/// The kind of filesystem event a watcher observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FsEventKind {
    Add,
    Change,
    Unlink,
}

impl FsEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FsEventKind::Add => "add",
            FsEventKind::Change => "change",
            FsEventKind::Unlink => "unlink",
        }
    }
}

/// A persisted watcher row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Watcher {
    pub id: String,
    /// Path glob relative to the project root.
    pub pattern: String,
    pub action: WatcherAction,
    /// Schema depends on `action`; see the watcher service.
    pub action_config: Value,
    pub enabled: bool,
    pub debounce_ms: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating a watcher.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatcherInput {
    pub pattern: String,
    pub action: WatcherAction,
    #[serde(default)]
    pub action_config: Value,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

fn default_enabled() -> bool {
    true
}

fn default_debounce_ms() -> u64 {
    500
}
