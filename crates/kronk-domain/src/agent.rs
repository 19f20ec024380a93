//! Agent-facing seams shared by components that trigger runs.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// The agent loop's externally visible state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Idle,
    Thinking,
    Acting,
    Observing,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentState::Idle => "idle",
            AgentState::Thinking => "thinking",
            AgentState::Acting => "acting",
            AgentState::Observing => "observing",
        }
    }
}

/// Outcome of one agent run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub iterations: u32,
}

/// Narrow handle to the agent loop. Watchers and the IPC server receive
/// this instead of the whole agent so ownership stays one-directional.
#[async_trait::async_trait]
pub trait AgentHandle: Send + Sync {
    async fn run(&self, message: &str) -> Result<RunResult>;

    /// Current loop state, for status reporting.
    fn state(&self) -> AgentState;
}
