//! Domain events and the in-process broadcast bus.
//!
//! Every long-lived component publishes onto one shared [`EventBus`]; the
//! IPC server forwards events to subscribed clients as JSON-RPC
//! notifications keyed by [`Event::name`].

use serde_json::{json, Value};
use tokio::sync::broadcast;

use crate::agent::AgentState;
use crate::journal::JournalEntry;
use crate::memory::MemoryTier;

/// A discrete domain event.
///
/// Shell confirmation is deliberately not here: it carries a responder
/// channel and is routed through the confirm broker instead of the bus.
#[derive(Debug, Clone)]
pub enum Event {
    AgentStateChanged { state: AgentState },
    ThinkingChunk { delta: String, accumulated: String },
    ThinkingComplete { content: String, tokens_used: Option<u64> },
    ToolInvokeStart { name: String, args: Value },
    ToolInvokeEnd { name: String, success: bool, duration_ms: u64 },
    RunStart { session_id: String, message: String },
    RunComplete { success: bool, response: Option<String>, error: Option<String>, iterations: u32 },
    JournalAppended { entry: JournalEntry },
    MemoryStored { id: String, tier: MemoryTier },
    TaskAdded { id: String, task_type: String },
    TaskStarted { id: String, task_type: String },
    TaskCompleted { id: String, task_type: String },
    TaskFailed { id: String, task_type: String, error: String },
    TaskRetry { id: String, task_type: String, retry_count: u32 },
    TaskCancelled { id: String, task_type: String },
    ScheduleStart { id: String, name: String },
    ScheduleComplete { id: String, name: String, duration_ms: u64 },
    ScheduleError { id: String, name: String, error: String },
    WatcherTriggered { watcher_id: String, path: String, fs_event: String },
}

impl Event {
    /// Stable event name used for IPC subscription matching.
    pub fn name(&self) -> &'static str {
        match self {
            Event::AgentStateChanged { .. } => "agent:state",
            Event::ThinkingChunk { .. } => "thinking:chunk",
            Event::ThinkingComplete { .. } => "thinking:complete",
            Event::ToolInvokeStart { .. } => "tool:invoke:start",
            Event::ToolInvokeEnd { .. } => "tool:invoke:end",
            Event::RunStart { .. } => "run:start",
            Event::RunComplete { .. } => "run:complete",
            Event::JournalAppended { .. } => "journal:entry",
            Event::MemoryStored { .. } => "memory:stored",
            Event::TaskAdded { .. } => "task:added",
            Event::TaskStarted { .. } => "task:started",
            Event::TaskCompleted { .. } => "task:completed",
            Event::TaskFailed { .. } => "task:failed",
            Event::TaskRetry { .. } => "task:retry",
            Event::TaskCancelled { .. } => "task:cancelled",
            Event::ScheduleStart { .. } => "task:start",
            Event::ScheduleComplete { .. } => "task:complete",
            Event::ScheduleError { .. } => "task:error",
            Event::WatcherTriggered { .. } => "watcher:triggered",
        }
    }

    /// JSON payload attached to the IPC notification.
    pub fn params(&self) -> Value {
        match self {
            Event::AgentStateChanged { state } => json!({"state": state.as_str()}),
            Event::ThinkingChunk { delta, accumulated } => {
                json!({"delta": delta, "accumulated": accumulated})
            }
            Event::ThinkingComplete { content, tokens_used } => {
                json!({"content": content, "tokensUsed": tokens_used})
            }
            Event::ToolInvokeStart { name, args } => json!({"name": name, "args": args}),
            Event::ToolInvokeEnd { name, success, duration_ms } => {
                json!({"name": name, "success": success, "durationMs": duration_ms})
            }
            Event::RunStart { session_id, message } => {
                json!({"sessionId": session_id, "message": message})
            }
            Event::RunComplete { success, response, error, iterations } => {
                json!({"success": success, "response": response, "error": error, "iterations": iterations})
            }
            Event::JournalAppended { entry } => {
                serde_json::to_value(entry).unwrap_or_else(|_| json!({}))
            }
            Event::MemoryStored { id, tier } => json!({"id": id, "tier": tier.as_str()}),
            Event::TaskAdded { id, task_type }
            | Event::TaskStarted { id, task_type }
            | Event::TaskCompleted { id, task_type }
            | Event::TaskCancelled { id, task_type } => {
                json!({"id": id, "type": task_type})
            }
            Event::TaskFailed { id, task_type, error } => {
                json!({"id": id, "type": task_type, "error": error})
            }
            Event::TaskRetry { id, task_type, retry_count } => {
                json!({"id": id, "type": task_type, "retryCount": retry_count})
            }
            Event::ScheduleStart { id, name } => json!({"id": id, "name": name}),
            Event::ScheduleComplete { id, name, duration_ms } => {
                json!({"id": id, "name": name, "durationMs": duration_ms})
            }
            Event::ScheduleError { id, name, error } => {
                json!({"id": id, "name": name, "error": error})
            }
            Event::WatcherTriggered { watcher_id, path, fs_event } => {
                json!({"watcherId": watcher_id, "path": path, "event": fs_event})
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// EventBus
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Shared broadcast bus. Cloning is cheap; all clones publish into the
/// same channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    /// Publish an event. A bus with no subscribers drops it silently.
    pub fn publish(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(Event::MemoryStored {
            id: "m1".into(),
            tier: MemoryTier::Working,
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.name(), "memory:stored");
        assert_eq!(event.params()["tier"], "working");
    }

    #[test]
    fn publish_without_subscribers_is_silent() {
        let bus = EventBus::new();
        bus.publish(Event::AgentStateChanged {
            state: AgentState::Idle,
        });
    }
}
