//! The agent loop: iterative reason/act orchestration of LLM calls and
//! tool invocations with strict tool-call id threading.

mod conversation;

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use futures_util::StreamExt;
use parking_lot::{Mutex, RwLock};
use serde_json::json;

use kronk_domain::agent::{AgentHandle, AgentState, RunResult};
use kronk_domain::chat::{ChatMessage, ToolCall, ToolDefinition};
use kronk_domain::event::{Event, EventBus};
use kronk_domain::journal::JournalEntryOpts;
use kronk_domain::memory::{MemoryInput, MemorySource, MemoryTier};
use kronk_domain::session::SessionStatus;
use kronk_domain::stream::StreamChunk;
use kronk_domain::Result;
use kronk_journal::Journal;
use kronk_memory::MemoryManager;
use kronk_providers::{ChatRequest, LlmProvider};
use kronk_store::Store;
use kronk_tools::ToolRegistry;

pub use conversation::ConversationBuffer;

/// The literal shown when the constitution file is absent.
const NO_CONSTITUTION: &str = "No constitution found.";

/// Session goals are the first 200 characters of the triggering message.
const GOAL_PREFIX_CHARS: usize = 200;

#[derive(Debug, Clone)]
pub struct AgentOptions {
    pub max_iterations: u32,
    pub constitution_path: PathBuf,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            constitution_path: PathBuf::from("constitution.md"),
        }
    }
}

pub struct Agent {
    store: Arc<Store>,
    memory: Arc<MemoryManager>,
    journal: Arc<Journal>,
    tools: Arc<ToolRegistry>,
    provider: Arc<dyn LlmProvider>,
    bus: EventBus,
    options: AgentOptions,
    state: RwLock<AgentState>,
    buffer: Mutex<ConversationBuffer>,
    /// One run at a time; the buffer belongs to the running turn.
    run_gate: tokio::sync::Mutex<()>,
}

/// Aggregated result of one streamed completion.
struct Completion {
    content: String,
    tool_calls: Vec<ToolCall>,
    tokens_used: Option<u64>,
}

impl Agent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        memory: Arc<MemoryManager>,
        journal: Arc<Journal>,
        tools: Arc<ToolRegistry>,
        provider: Arc<dyn LlmProvider>,
        bus: EventBus,
        options: AgentOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            memory,
            journal,
            tools,
            provider,
            bus,
            options,
            state: RwLock::new(AgentState::Idle),
            buffer: Mutex::new(ConversationBuffer::new()),
            run_gate: tokio::sync::Mutex::new(()),
        })
    }

    pub fn state(&self) -> AgentState {
        *self.state.read()
    }

    /// Clear the conversation buffer and end the current session.
    pub fn reset(&self) -> Result<()> {
        self.buffer.lock().reset();
        self.journal.end_session(SessionStatus::Completed)?;
        Ok(())
    }

    // ── The run loop ───────────────────────────────────────────────

    /// Drive one reason/act run to completion.
    ///
    /// Failures inside the loop land in the returned [`RunResult`];
    /// `run:complete` always fires and the state always returns to
    /// idle.
    pub async fn run(&self, message: &str) -> RunResult {
        let _gate = self.run_gate.lock().await;

        let outcome = self.run_inner(message).await;
        let result = match outcome {
            Ok(result) => result,
            Err(e) => {
                let _ = self.journal.error(&format!("run failed: {e}"));
                RunResult {
                    success: false,
                    response: None,
                    error: Some(e.to_string()),
                    iterations: 0,
                }
            }
        };

        self.persist_message_log();
        self.set_state(AgentState::Idle);
        self.bus.publish(Event::RunComplete {
            success: result.success,
            response: result.response.clone(),
            error: result.error.clone(),
            iterations: result.iterations,
        });
        result
    }

    async fn run_inner(&self, message: &str) -> Result<RunResult> {
        // 1. Session.
        let session_id = match self.journal.current_session_id() {
            Some(id) => id,
            None => {
                let goal: String = message.chars().take(GOAL_PREFIX_CHARS).collect();
                self.journal.start_session(&goal)?.id
            }
        };
        self.bus.publish(Event::RunStart {
            session_id,
            message: message.to_string(),
        });

        // 2. Context window, tools, system prompt, message log.
        let window = self.memory.build_context_window()?;
        let enabled = self.tools.list_enabled()?;
        let tool_defs: Vec<ToolDefinition> = enabled
            .iter()
            .map(|t| ToolDefinition {
                name: t.name.clone(),
                description: t.description.clone(),
                parameters: t.schema.clone(),
            })
            .collect();
        let system = self.build_system_prompt(&window.format_for_prompt())?;
        {
            let mut buffer = self.buffer.lock();
            buffer.set_system(system);
            buffer.push(ChatMessage::user(message));
        }

        // 3. Iterate.
        for iteration in 1..=self.options.max_iterations {
            self.set_state(AgentState::Thinking);
            let request = ChatRequest {
                messages: self.buffer.lock().snapshot(),
                tools: tool_defs.clone(),
                temperature: None,
                max_tokens: None,
                model: None,
            };
            let completion = self.complete(request).await?;

            if !completion.tool_calls.is_empty() {
                self.set_state(AgentState::Acting);
                self.act(&completion).await?;
                continue;
            }

            // 3c. Final answer.
            self.set_state(AgentState::Observing);
            self.buffer
                .lock()
                .push(ChatMessage::assistant(completion.content.clone()));
            self.memory
                .store(MemoryInput {
                    content: format!("User: {message}\nAssistant: {}", completion.content),
                    tier: Some(MemoryTier::System1),
                    importance: None,
                    source: Some(MemorySource::Agent),
                    tags: vec!["conversation".into()],
                    related_ids: Vec::new(),
                    expires_at: None,
                })
                .await?;
            self.memory.autosummarize().await?;
            self.journal.log(
                kronk_domain::journal::JournalEntryType::Observation,
                &completion.content,
                JournalEntryOpts {
                    tokens_used: completion.tokens_used,
                    ..Default::default()
                },
            )?;

            return Ok(RunResult {
                success: true,
                response: Some(completion.content),
                error: None,
                iterations: iteration,
            });
        }

        Ok(RunResult {
            success: false,
            response: None,
            error: Some(format!(
                "Reached maximum iterations ({})",
                self.options.max_iterations
            )),
            iterations: self.options.max_iterations,
        })
    }

    /// Append the assistant tool-call message, invoke each call, and
    /// append one tool-result message per call.
    async fn act(&self, completion: &Completion) -> Result<()> {
        let calls = thread_call_ids(&completion.tool_calls);
        self.buffer.lock().push(ChatMessage::assistant_tool_calls(
            completion.content.clone(),
            calls.clone(),
        ));

        for call in &calls {
            let started = std::time::Instant::now();
            let invocation = self.tools.invoke(&call.name, call.arguments.clone()).await;
            let content = if invocation.success {
                serde_json::to_string(&invocation.result.clone().unwrap_or(serde_json::Value::Null))?
            } else {
                serde_json::to_string(&json!({
                    "error": invocation.error.clone().unwrap_or_else(|| "tool failed".into())
                }))?
            };

            let tool_id = self.tools.get(&call.name)?.map(|t| t.id);
            let _ = self.journal.action(
                &format!("invoked tool {}", call.name),
                JournalEntryOpts {
                    tool_id,
                    input: Some(call.arguments.clone()),
                    output: invocation.result.clone(),
                    duration_ms: Some(started.elapsed().as_millis() as u64),
                    ..Default::default()
                },
            );

            self.buffer
                .lock()
                .push(ChatMessage::tool_result(call.id.clone(), content));
        }
        Ok(())
    }

    /// Stream one completion, aggregating text and tool calls while
    /// publishing thinking deltas.
    async fn complete(&self, request: ChatRequest) -> Result<Completion> {
        let mut stream = self.provider.chat_stream(request).await?;
        let mut content = String::new();
        let mut tool_calls: Vec<ToolCall> = Vec::new();
        let mut tokens_used = None;

        while let Some(chunk) = stream.next().await {
            match chunk? {
                StreamChunk::Chunk { content: delta } => {
                    content.push_str(&delta);
                    self.bus.publish(Event::ThinkingChunk {
                        delta,
                        accumulated: content.clone(),
                    });
                }
                StreamChunk::ToolCall { tool_call } => tool_calls.push(tool_call),
                StreamChunk::Done { tokens_used: tokens } => {
                    tokens_used = tokens;
                    break;
                }
            }
        }

        self.bus.publish(Event::ThinkingComplete {
            content: content.clone(),
            tokens_used,
        });
        Ok(Completion {
            content,
            tool_calls,
            tokens_used,
        })
    }

    // ── Prompt assembly ────────────────────────────────────────────

    fn build_system_prompt(&self, memory_section: &str) -> Result<String> {
        let constitution = std::fs::read_to_string(&self.options.constitution_path)
            .unwrap_or_else(|_| NO_CONSTITUTION.to_string());
        let tool_prompt = self.tools.generate_tool_prompt()?;

        let mut prompt = constitution.trim_end().to_string();
        if !memory_section.is_empty() {
            prompt.push_str("\n\n");
            prompt.push_str(memory_section.trim_end());
        }
        if !tool_prompt.is_empty() {
            prompt.push_str("\n\n");
            prompt.push_str(tool_prompt.trim_end());
        }
        Ok(prompt)
    }

    // ── Bookkeeping ────────────────────────────────────────────────

    fn set_state(&self, state: AgentState) {
        *self.state.write() = state;
        self.bus.publish(Event::AgentStateChanged { state });
    }

    /// Persist the buffer into the session's context map so completed
    /// runs leave an inspectable message log.
    fn persist_message_log(&self) {
        let Some(session_id) = self.journal.current_session_id() else {
            return;
        };
        let snapshot = self.buffer.lock().snapshot();
        match serde_json::to_value(&snapshot) {
            Ok(messages) => {
                if let Err(e) = self
                    .store
                    .set_session_context_key(&session_id, "messages", &messages)
                {
                    tracing::warn!(error = %e, "persisting message log failed");
                }
            }
            Err(e) => tracing::warn!(error = %e, "serializing message log failed"),
        }
    }
}

/// Give every tool call a stable id. Providers that do not supply ids
/// get `tool_call_<timestamp>_<index>` so the next request's message
/// log is well-formed.
fn thread_call_ids(calls: &[ToolCall]) -> Vec<ToolCall> {
    let stamp = Utc::now().timestamp_millis();
    calls
        .iter()
        .enumerate()
        .map(|(index, call)| {
            let mut call = call.clone();
            if call.id.is_empty() {
                call.id = format!("tool_call_{stamp}_{index}");
            }
            call
        })
        .collect()
}

#[async_trait::async_trait]
impl AgentHandle for Agent {
    async fn run(&self, message: &str) -> Result<RunResult> {
        Ok(Agent::run(self, message).await)
    }

    fn state(&self) -> AgentState {
        Agent::state(self)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
