//! Cron-driven maintenance scheduler.
//!
//! Tasks run sequentially within a tick; the scheduler does not prevent
//! overlap across ticks, so handlers must be idempotent.

pub mod cron;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use parking_lot::RwLock;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use kronk_domain::event::{Event, EventBus};
use kronk_domain::id::new_id;
use kronk_domain::{Error, Result};

use cron::{cron_matches, cron_next, validate_cron};

/// A scheduled task's handler.
pub type TaskFn = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// How often the ticker wakes to evaluate cron expressions. Well under
/// a minute so no matching minute is skipped.
const TICK: Duration = Duration::from_secs(30);

struct TaskEntry {
    info: TaskInfo,
    handler: TaskFn,
}

/// Listing row for one scheduled task.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInfo {
    pub id: String,
    pub name: String,
    pub cron: String,
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Utc>>,
    pub run_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_run: Option<DateTime<Utc>>,
}

pub struct Scheduler {
    tasks: RwLock<HashMap<String, TaskEntry>>,
    bus: EventBus,
}

impl Scheduler {
    pub fn new(bus: EventBus) -> Arc<Self> {
        Arc::new(Self {
            tasks: RwLock::new(HashMap::new()),
            bus,
        })
    }

    // ── Registration ───────────────────────────────────────────────

    /// Register a named task; the cron expression is validated here.
    /// Returns the task id.
    pub fn register_task(&self, name: &str, cron: &str, handler: TaskFn) -> Result<String> {
        validate_cron(cron)?;
        let id = new_id();
        let info = TaskInfo {
            id: id.clone(),
            name: name.to_string(),
            cron: cron.to_string(),
            enabled: true,
            last_run: None,
            run_count: 0,
            next_run: cron_next(cron, &Utc::now()),
        };
        self.tasks.write().insert(id.clone(), TaskEntry { info, handler });
        tracing::debug!(name, cron, "scheduled task registered");
        Ok(id)
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) -> bool {
        match self.tasks.write().get_mut(id) {
            Some(entry) => {
                entry.info.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Replace a task's schedule. Invalid expressions are rejected and
    /// the previous schedule stays in effect.
    pub fn update_schedule(&self, id: &str, cron: &str) -> Result<bool> {
        validate_cron(cron)?;
        match self.tasks.write().get_mut(id) {
            Some(entry) => {
                entry.info.cron = cron.to_string();
                entry.info.next_run = cron_next(cron, &Utc::now());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn remove_task(&self, id: &str) -> bool {
        self.tasks.write().remove(id).is_some()
    }

    /// All tasks with freshly computed `next_run`, sorted by name.
    pub fn list_tasks(&self) -> Vec<TaskInfo> {
        let now = Utc::now();
        let mut infos: Vec<TaskInfo> = self
            .tasks
            .read()
            .values()
            .map(|entry| {
                let mut info = entry.info.clone();
                info.next_run = info.enabled.then(|| cron_next(&info.cron, &now)).flatten();
                info
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// Resolve a task by id or name; the CLI accepts either.
    pub fn find_task(&self, key: &str) -> Option<String> {
        let tasks = self.tasks.read();
        if tasks.contains_key(key) {
            return Some(key.to_string());
        }
        tasks
            .values()
            .find(|entry| entry.info.name == key)
            .map(|entry| entry.info.id.clone())
    }

    // ── Execution ──────────────────────────────────────────────────

    /// Run one task immediately, regardless of its schedule.
    pub async fn run_task(&self, id: &str) -> Result<()> {
        let (name, handler) = {
            let tasks = self.tasks.read();
            let entry = tasks
                .get(id)
                .ok_or_else(|| Error::invalid(format!("unknown scheduled task: {id}")))?;
            (entry.info.name.clone(), entry.handler.clone())
        };
        self.execute(id, &name, handler).await
    }

    async fn execute(&self, id: &str, name: &str, handler: TaskFn) -> Result<()> {
        self.bus.publish(Event::ScheduleStart {
            id: id.to_string(),
            name: name.to_string(),
        });
        let started = Instant::now();
        let outcome = handler().await;
        let duration_ms = started.elapsed().as_millis() as u64;

        {
            let mut tasks = self.tasks.write();
            if let Some(entry) = tasks.get_mut(id) {
                entry.info.last_run = Some(Utc::now());
                entry.info.run_count += 1;
            }
        }

        match &outcome {
            Ok(()) => {
                self.bus.publish(Event::ScheduleComplete {
                    id: id.to_string(),
                    name: name.to_string(),
                    duration_ms,
                });
                tracing::debug!(name, duration_ms, "scheduled task completed");
            }
            Err(e) => {
                self.bus.publish(Event::ScheduleError {
                    id: id.to_string(),
                    name: name.to_string(),
                    error: e.to_string(),
                });
                tracing::warn!(name, error = %e, "scheduled task failed");
            }
        }
        outcome
    }

    /// Tick loop: run every enabled task whose expression matches the
    /// current minute and that has not already run this minute.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut tick = tokio::time::interval(TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = tick.tick() => self.tick_once().await,
                _ = shutdown.cancelled() => {
                    tracing::debug!("scheduler stopping");
                    return;
                }
            }
        }
    }

    async fn tick_once(&self) {
        let now = Utc::now();
        let due: Vec<(String, String, TaskFn)> = self
            .tasks
            .read()
            .values()
            .filter(|entry| {
                entry.info.enabled
                    && cron_matches(&entry.info.cron, &now)
                    && !ran_this_minute(entry.info.last_run, now)
            })
            .map(|entry| {
                (
                    entry.info.id.clone(),
                    entry.info.name.clone(),
                    entry.handler.clone(),
                )
            })
            .collect();

        for (id, name, handler) in due {
            let _ = self.execute(&id, &name, handler).await;
        }
    }
}

fn ran_this_minute(last_run: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    last_run.is_some_and(|t| t.timestamp() / 60 == now.timestamp() / 60)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn counting_handler(counter: Arc<AtomicU32>) -> TaskFn {
        Arc::new(move || {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
    }

    #[tokio::test]
    async fn register_validates_cron() {
        let scheduler = Scheduler::new(EventBus::new());
        let counter = Arc::new(AtomicU32::new(0));
        assert!(scheduler
            .register_task("ok", "0 * * * *", counting_handler(counter.clone()))
            .is_ok());
        assert!(scheduler
            .register_task("bad", "99 * * * *", counting_handler(counter))
            .is_err());
    }

    #[tokio::test]
    async fn run_task_executes_and_counts() {
        let scheduler = Scheduler::new(EventBus::new());
        let counter = Arc::new(AtomicU32::new(0));
        let id = scheduler
            .register_task("decay", "0 * * * *", counting_handler(counter.clone()))
            .unwrap();

        scheduler.run_task(&id).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        let info = &scheduler.list_tasks()[0];
        assert_eq!(info.run_count, 1);
        assert!(info.last_run.is_some());
        assert!(info.next_run.is_some());
    }

    #[tokio::test]
    async fn run_task_emits_error_event_on_failure() {
        let bus = EventBus::new();
        let mut events = bus.subscribe();
        let scheduler = Scheduler::new(bus);
        let id = scheduler
            .register_task(
                "broken",
                "0 * * * *",
                Arc::new(|| Box::pin(async { Err(Error::Other("nope".into())) })),
            )
            .unwrap();

        assert!(scheduler.run_task(&id).await.is_err());
        let start = events.recv().await.unwrap();
        assert_eq!(start.name(), "task:start");
        let error = events.recv().await.unwrap();
        assert_eq!(error.name(), "task:error");
        assert_eq!(error.params()["error"], "nope");
    }

    #[tokio::test]
    async fn update_schedule_rejects_invalid_keeps_old() {
        let scheduler = Scheduler::new(EventBus::new());
        let counter = Arc::new(AtomicU32::new(0));
        let id = scheduler
            .register_task("t", "0 * * * *", counting_handler(counter))
            .unwrap();

        assert!(scheduler.update_schedule(&id, "not cron").is_err());
        assert_eq!(scheduler.list_tasks()[0].cron, "0 * * * *");

        assert!(scheduler.update_schedule(&id, "*/10 * * * *").unwrap());
        assert_eq!(scheduler.list_tasks()[0].cron, "*/10 * * * *");
    }

    #[tokio::test]
    async fn disabled_tasks_have_no_next_run() {
        let scheduler = Scheduler::new(EventBus::new());
        let counter = Arc::new(AtomicU32::new(0));
        let id = scheduler
            .register_task("t", "0 * * * *", counting_handler(counter))
            .unwrap();
        scheduler.set_enabled(&id, false);
        assert!(scheduler.list_tasks()[0].next_run.is_none());
    }

    #[tokio::test]
    async fn find_task_by_name_or_id() {
        let scheduler = Scheduler::new(EventBus::new());
        let counter = Arc::new(AtomicU32::new(0));
        let id = scheduler
            .register_task("memory-decay", "0 * * * *", counting_handler(counter))
            .unwrap();
        assert_eq!(scheduler.find_task(&id), Some(id.clone()));
        assert_eq!(scheduler.find_task("memory-decay"), Some(id));
        assert_eq!(scheduler.find_task("ghost"), None);
    }
}
