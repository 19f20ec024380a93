//! JSON-RPC method dispatch.

use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use kronk_agent::Agent;
use kronk_domain::config::KronkConfig;
use kronk_domain::event::EventBus;
use kronk_domain::journal::JournalEntryType;
use kronk_domain::memory::{MemoryInput, MemorySource, MemoryTier};
use kronk_domain::queue::{TaskInput, TaskStatus};
use kronk_journal::Journal;
use kronk_memory::{MemoryManager, SearchOpts, Summarizer};
use kronk_queue::Queue;
use kronk_scheduler::Scheduler;
use kronk_store::Store;
use kronk_tools::ToolRegistry;
use kronk_watcher::WatcherService;

use super::protocol::RpcError;

/// Everything method handlers reach into. The IPC server owns one.
pub struct RpcContext {
    pub config: KronkConfig,
    pub store: Arc<Store>,
    pub memory: Arc<MemoryManager>,
    pub journal: Arc<Journal>,
    pub tools: Arc<ToolRegistry>,
    pub queue: Arc<Queue>,
    pub scheduler: Arc<Scheduler>,
    pub watchers: Arc<WatcherService>,
    pub agent: Arc<Agent>,
    pub summarizer: Arc<dyn Summarizer>,
    pub bus: EventBus,
    pub shutdown: CancellationToken,
    pub started_at: Instant,
}

fn param_str<'a>(params: &'a Value, key: &str) -> Result<&'a str, RpcError> {
    params
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| RpcError::invalid_params(format!("missing string param: {key}")))
}

fn param_usize(params: &Value, key: &str, default: usize) -> usize {
    params
        .get(key)
        .and_then(Value::as_u64)
        .map_or(default, |v| v as usize)
}

fn parse_tier(params: &Value) -> Result<Option<MemoryTier>, RpcError> {
    match params.get("tier").and_then(Value::as_str) {
        None => Ok(None),
        Some(raw) => MemoryTier::parse(raw)
            .map(Some)
            .ok_or_else(|| RpcError::invalid_params(format!("unknown memory tier: {raw}"))),
    }
}

/// Handle one method call. `subscribe`/`unsubscribe` are connection-
/// scoped and handled by the caller before dispatch reaches here.
pub async fn dispatch(ctx: &RpcContext, method: &str, params: Value) -> Result<Value, RpcError> {
    match method {
        "ping" => Ok(json!("pong")),

        // ── Agent ──────────────────────────────────────────────────
        "agent.run" => {
            let message = param_str(&params, "message")?;
            let result = ctx.agent.run(message).await;
            Ok(serde_json::to_value(result).map_err(|e| RpcError::internal(e.to_string()))?)
        }
        "agent.status" => {
            let stats = ctx.memory.get_stats()?;
            Ok(json!({
                "initialized": true,
                "state": ctx.agent.state().as_str(),
                "config": {"name": ctx.config.name, "provider": ctx.config.provider.as_str()},
                "memoryCount": stats.counts,
                "memoryTokens": stats.tokens,
                "journalCount": ctx.store.count_journal_entries()?,
                "toolCount": ctx.store.count_tools()?,
                "queue": ctx.queue.stats()?,
                "uptimeSecs": ctx.started_at.elapsed().as_secs(),
            }))
        }
        "agent.remember" => {
            let content = param_str(&params, "content")?;
            let memory = ctx
                .memory
                .store(MemoryInput {
                    content: content.to_string(),
                    tier: parse_tier(&params)?,
                    importance: params.get("importance").and_then(Value::as_f64),
                    source: Some(MemorySource::User),
                    tags: params
                        .get("tags")
                        .and_then(Value::as_array)
                        .map(|a| {
                            a.iter()
                                .filter_map(Value::as_str)
                                .map(String::from)
                                .collect()
                        })
                        .unwrap_or_default(),
                    related_ids: Vec::new(),
                    expires_at: None,
                })
                .await?;
            Ok(serde_json::to_value(memory).map_err(|e| RpcError::internal(e.to_string()))?)
        }
        "agent.recall" => {
            let query = param_str(&params, "query")?;
            let hits = ctx
                .memory
                .search(
                    query,
                    SearchOpts {
                        limit: param_usize(&params, "limit", 10),
                        tier: parse_tier(&params)?,
                        ..Default::default()
                    },
                )
                .await?;
            Ok(serde_json::to_value(hits).map_err(|e| RpcError::internal(e.to_string()))?)
        }
        "agent.reflect" => {
            let window = param_usize(&params, "window", 20);
            let entry = ctx
                .journal
                .reflect(&ctx.memory, ctx.summarizer.as_ref(), window)
                .await?;
            Ok(json!({"reflected": entry.is_some(), "entry": entry}))
        }
        "agent.decay" => {
            let decayed = ctx.memory.apply_decay()?;
            Ok(json!({"decayed": decayed}))
        }

        // ── Memory ─────────────────────────────────────────────────
        "memory.list" => {
            let limit = param_usize(&params, "limit", 50);
            let memories = match parse_tier(&params)? {
                Some(tier) => ctx.memory.get_by_tier(tier, Some(limit))?,
                None => {
                    let mut all = Vec::new();
                    for tier in MemoryTier::ALL {
                        all.extend(ctx.memory.get_by_tier(tier, Some(limit))?);
                    }
                    all
                }
            };
            Ok(serde_json::to_value(memories).map_err(|e| RpcError::internal(e.to_string()))?)
        }
        "memory.stats" => {
            let stats = ctx.memory.get_stats()?;
            Ok(serde_json::to_value(stats).map_err(|e| RpcError::internal(e.to_string()))?)
        }

        // ── Journal ────────────────────────────────────────────────
        "journal.recent" => {
            let entries = ctx.journal.get_recent(param_usize(&params, "limit", 20))?;
            Ok(serde_json::to_value(entries).map_err(|e| RpcError::internal(e.to_string()))?)
        }
        "journal.search" => {
            let query = param_str(&params, "query")?;
            let entries = ctx
                .journal
                .search(query, param_usize(&params, "limit", 20))?;
            Ok(serde_json::to_value(entries).map_err(|e| RpcError::internal(e.to_string()))?)
        }

        // ── Queue ──────────────────────────────────────────────────
        "queue.add" => {
            let task_type = param_str(&params, "type")?;
            let task = ctx.queue.add(TaskInput {
                task_type: task_type.to_string(),
                payload: params.get("payload").cloned(),
                priority: params.get("priority").and_then(Value::as_i64).unwrap_or(0),
                max_retries: params
                    .get("maxRetries")
                    .and_then(Value::as_u64)
                    .map(|v| v as u32),
            })?;
            Ok(serde_json::to_value(task).map_err(|e| RpcError::internal(e.to_string()))?)
        }
        "queue.list" => {
            let status = match params.get("status").and_then(Value::as_str) {
                None => None,
                Some(raw) => Some(TaskStatus::parse(raw).ok_or_else(|| {
                    RpcError::invalid_params(format!("unknown task status: {raw}"))
                })?),
            };
            let tasks = ctx.queue.list(status, param_usize(&params, "limit", 50))?;
            Ok(serde_json::to_value(tasks).map_err(|e| RpcError::internal(e.to_string()))?)
        }
        "queue.cancel" => {
            let id = param_str(&params, "id")?;
            Ok(json!({"cancelled": ctx.queue.cancel(id)?}))
        }
        "queue.stats" => {
            Ok(serde_json::to_value(ctx.queue.stats()?)
                .map_err(|e| RpcError::internal(e.to_string()))?)
        }

        // ── Scheduler ──────────────────────────────────────────────
        "scheduler.tasks" => {
            Ok(serde_json::to_value(ctx.scheduler.list_tasks())
                .map_err(|e| RpcError::internal(e.to_string()))?)
        }
        "scheduler.run" => {
            let key = param_str(&params, "id")?;
            let id = ctx
                .scheduler
                .find_task(key)
                .ok_or_else(|| RpcError::invalid_params(format!("unknown scheduled task: {key}")))?;
            ctx.scheduler.run_task(&id).await?;
            Ok(json!({"ran": id}))
        }

        // ── Watchers (management, used by the CLI `watch` verb) ────
        "watcher.list" => {
            Ok(serde_json::to_value(ctx.watchers.list()?)
                .map_err(|e| RpcError::internal(e.to_string()))?)
        }
        "watcher.add" => {
            let input = serde_json::from_value(params)
                .map_err(|e| RpcError::invalid_params(format!("watcher input: {e}")))?;
            let watcher = ctx.watchers.add(&input)?;
            Ok(serde_json::to_value(watcher).map_err(|e| RpcError::internal(e.to_string()))?)
        }
        "watcher.remove" => {
            let id = param_str(&params, "id")?;
            Ok(json!({"removed": ctx.watchers.remove(id)?}))
        }
        "watcher.enable" => {
            let id = param_str(&params, "id")?;
            Ok(json!({"enabled": ctx.watchers.set_enabled(id, true)?}))
        }
        "watcher.disable" => {
            let id = param_str(&params, "id")?;
            Ok(json!({"disabled": ctx.watchers.set_enabled(id, false)?}))
        }

        // ── Tools (read-only listing for the CLI) ──────────────────
        "tools.list" => {
            let tools = ctx.tools.list_all()?;
            Ok(serde_json::to_value(tools).map_err(|e| RpcError::internal(e.to_string()))?)
        }

        // ── Journal helper used by the journal CLI verb ────────────
        "journal.log" => {
            let content = param_str(&params, "content")?;
            let entry_type = params
                .get("type")
                .and_then(Value::as_str)
                .map(|raw| {
                    JournalEntryType::parse(raw).ok_or_else(|| {
                        RpcError::invalid_params(format!("unknown journal entry type: {raw}"))
                    })
                })
                .transpose()?
                .unwrap_or(JournalEntryType::Observation);
            let entry = ctx.journal.log(entry_type, content, Default::default())?;
            Ok(serde_json::to_value(entry).map_err(|e| RpcError::internal(e.to_string()))?)
        }

        other => Err(RpcError::method_not_found(other)),
    }
}
