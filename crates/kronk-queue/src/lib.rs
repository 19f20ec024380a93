//! The persistent task queue: priority plus FIFO ordering, bounded
//! concurrency, and exponential-backoff retry.
//!
//! One pump loop claims work; up to `max_concurrent` workers execute it.
//! Retry backoff is a `not_before` timestamp on the row, so a retried
//! task is never claimed before its window and no worker sleeps.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use kronk_domain::event::{Event, EventBus};
use kronk_domain::id::new_id;
use kronk_domain::queue::{QueueTask, TaskInput, TaskStatus};
use kronk_domain::Result;
use kronk_store::Store;

/// A registered executor for one task type. Handlers may fail by
/// returning an error; the queue applies the retry policy.
#[async_trait::async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &QueueTask) -> Result<Value>;
}

/// Queue tuning knobs.
#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub max_concurrent: usize,
    pub default_retries: u32,
    pub tick: Duration,
    pub retry_base: Duration,
    pub retry_max: Duration,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            default_retries: 3,
            tick: Duration::from_secs(1),
            retry_base: Duration::from_secs(1),
            retry_max: Duration::from_secs(60),
        }
    }
}

pub struct Queue {
    store: Arc<Store>,
    bus: EventBus,
    options: QueueOptions,
    handlers: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
    running: Arc<AtomicUsize>,
}

impl Queue {
    pub fn new(store: Arc<Store>, bus: EventBus, options: QueueOptions) -> Arc<Self> {
        Arc::new(Self {
            store,
            bus,
            options,
            handlers: RwLock::new(HashMap::new()),
            running: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn register_handler(&self, task_type: &str, handler: Arc<dyn TaskHandler>) {
        self.handlers.write().insert(task_type.to_string(), handler);
    }

    // ── Producer API ───────────────────────────────────────────────

    pub fn add(&self, input: TaskInput) -> Result<QueueTask> {
        let task = QueueTask {
            id: new_id(),
            task_type: input.task_type,
            payload: input.payload,
            priority: input.priority,
            status: TaskStatus::Pending,
            retry_count: 0,
            max_retries: input.max_retries.unwrap_or(self.options.default_retries),
            error: None,
            result: None,
            not_before: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        self.store.insert_task(&task)?;
        self.bus.publish(Event::TaskAdded {
            id: task.id.clone(),
            task_type: task.task_type.clone(),
        });
        Ok(task)
    }

    /// Cancel a pending task. Running tasks are not interrupted; the
    /// call returns false for them.
    pub fn cancel(&self, id: &str) -> Result<bool> {
        let cancelled = self.store.cancel_task(id, Utc::now())?;
        if cancelled {
            if let Some(task) = self.store.get_task(id)? {
                self.bus.publish(Event::TaskCancelled {
                    id: task.id,
                    task_type: task.task_type,
                });
            }
        }
        Ok(cancelled)
    }

    pub fn get(&self, id: &str) -> Result<Option<QueueTask>> {
        self.store.get_task(id)
    }

    pub fn list(&self, status: Option<TaskStatus>, limit: usize) -> Result<Vec<QueueTask>> {
        self.store.list_tasks(status, limit)
    }

    pub fn stats(&self) -> Result<HashMap<String, u64>> {
        self.store.task_stats()
    }

    pub fn cleanup(
        &self,
        status: Option<TaskStatus>,
        older_than: Option<chrono::DateTime<Utc>>,
    ) -> Result<u64> {
        self.store.cleanup_tasks(status, older_than)
    }

    // ── Pump ───────────────────────────────────────────────────────

    /// Start the pump loop. Returns once `shutdown` is cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        // Rows left running by a dead process can never complete.
        match self.store.fail_orphaned_running_tasks(Utc::now()) {
            Ok(0) => {}
            Ok(n) => tracing::warn!(n, "failed orphaned running tasks from previous run"),
            Err(e) => tracing::error!(error = %e, "orphan cleanup failed"),
        }

        let mut tick = tokio::time::interval(self.options.tick);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = tick.tick() => self.pump_once(),
                _ = shutdown.cancelled() => {
                    tracing::debug!("queue pump stopping");
                    return;
                }
            }
        }
    }

    /// Claim and dispatch until the concurrency bound is reached or no
    /// eligible work remains.
    fn pump_once(self: &Arc<Self>) {
        loop {
            if self.running.load(Ordering::SeqCst) >= self.options.max_concurrent {
                return;
            }
            let types: Vec<String> = self.handlers.read().keys().cloned().collect();
            let task = match self.store.claim_next_task(&types, Utc::now()) {
                Ok(Some(task)) => task,
                Ok(None) => return,
                Err(e) => {
                    tracing::error!(error = %e, "queue claim failed");
                    return;
                }
            };
            self.running.fetch_add(1, Ordering::SeqCst);
            self.bus.publish(Event::TaskStarted {
                id: task.id.clone(),
                task_type: task.task_type.clone(),
            });

            let queue = Arc::clone(self);
            tokio::spawn(async move {
                queue.execute(task).await;
                queue.running.fetch_sub(1, Ordering::SeqCst);
            });
        }
    }

    async fn execute(&self, task: QueueTask) {
        let handler = self.handlers.read().get(&task.task_type).cloned();
        let Some(handler) = handler else {
            // Handler unregistered between claim and dispatch.
            let _ = self
                .store
                .fail_task(&task.id, "no handler registered", Utc::now());
            return;
        };

        match handler.handle(&task).await {
            Ok(result) => {
                if let Err(e) = self.store.complete_task(&task.id, &result, Utc::now()) {
                    tracing::error!(id = %task.id, error = %e, "completing task failed");
                    return;
                }
                self.bus.publish(Event::TaskCompleted {
                    id: task.id.clone(),
                    task_type: task.task_type.clone(),
                });
            }
            Err(e) => self.handle_failure(&task, &e.to_string()),
        }
    }

    /// Retry with backoff while attempts remain, otherwise fail.
    fn handle_failure(&self, task: &QueueTask, error: &str) {
        if task.retry_count < task.max_retries {
            let retries = task.retry_count + 1;
            let delay = self.backoff_delay(task.retry_count);
            let not_before = Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::seconds(60));
            if let Err(e) = self.store.retry_task(&task.id, retries, error, not_before) {
                tracing::error!(id = %task.id, error = %e, "retry transition failed");
                return;
            }
            self.bus.publish(Event::TaskRetry {
                id: task.id.clone(),
                task_type: task.task_type.clone(),
                retry_count: retries,
            });
            tracing::debug!(id = %task.id, retries, ?delay, "task scheduled for retry");
        } else {
            if let Err(e) = self.store.fail_task(&task.id, error, Utc::now()) {
                tracing::error!(id = %task.id, error = %e, "fail transition failed");
                return;
            }
            self.bus.publish(Event::TaskFailed {
                id: task.id.clone(),
                task_type: task.task_type.clone(),
                error: error.to_string(),
            });
        }
    }

    /// `min(retryMax, retryBase · 2^attempt)`.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        (self.options.retry_base * factor).min(self.options.retry_max)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use kronk_store::StoreOptions;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    fn fast_options() -> QueueOptions {
        QueueOptions {
            max_concurrent: 3,
            default_retries: 3,
            tick: Duration::from_millis(10),
            retry_base: Duration::from_millis(20),
            retry_max: Duration::from_millis(100),
        }
    }

    fn queue(options: QueueOptions) -> (Arc<Queue>, EventBus) {
        let store = Arc::new(Store::open_in_memory(StoreOptions::default()).unwrap());
        let bus = EventBus::new();
        (Queue::new(store, bus.clone(), options), bus)
    }

    async fn wait_for_status(queue: &Queue, id: &str, status: TaskStatus) -> QueueTask {
        for _ in 0..500 {
            let task = queue.get(id).unwrap().unwrap();
            if task.status == status {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {id} never reached {status:?}");
    }

    struct OkHandler;

    #[async_trait::async_trait]
    impl TaskHandler for OkHandler {
        async fn handle(&self, _task: &QueueTask) -> Result<Value> {
            Ok(json!("done"))
        }
    }

    /// Fails `failures` times, then succeeds.
    struct FlakyHandler {
        failures: u32,
        seen: AtomicU32,
    }

    #[async_trait::async_trait]
    impl TaskHandler for FlakyHandler {
        async fn handle(&self, _task: &QueueTask) -> Result<Value> {
            let attempt = self.seen.fetch_add(1, Ordering::SeqCst);
            if attempt < self.failures {
                Err(kronk_domain::Error::Other(format!("attempt {attempt} failed")))
            } else {
                Ok(json!("ok"))
            }
        }
    }

    struct SlowHandler;

    #[async_trait::async_trait]
    impl TaskHandler for SlowHandler {
        async fn handle(&self, _task: &QueueTask) -> Result<Value> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(json!(null))
        }
    }

    #[tokio::test]
    async fn completes_a_task() {
        let (queue, _) = queue(fast_options());
        queue.register_handler("t", Arc::new(OkHandler));
        let shutdown = CancellationToken::new();
        let pump = tokio::spawn(queue.clone().run(shutdown.clone()));

        let task = queue
            .add(TaskInput {
                task_type: "t".into(),
                ..Default::default()
            })
            .unwrap();
        let done = wait_for_status(&queue, &task.id, TaskStatus::Completed).await;
        assert_eq!(done.result, Some(json!("done")));
        assert!(done.completed_at.is_some());

        shutdown.cancel();
        pump.await.unwrap();
    }

    #[tokio::test]
    async fn retries_then_completes() {
        let (queue, bus) = queue(fast_options());
        queue.register_handler(
            "flaky",
            Arc::new(FlakyHandler {
                failures: 2,
                seen: AtomicU32::new(0),
            }),
        );
        let mut events = bus.subscribe();
        let shutdown = CancellationToken::new();
        let pump = tokio::spawn(queue.clone().run(shutdown.clone()));

        let task = queue
            .add(TaskInput {
                task_type: "flaky".into(),
                max_retries: Some(3),
                ..Default::default()
            })
            .unwrap();
        let done = wait_for_status(&queue, &task.id, TaskStatus::Completed).await;
        assert_eq!(done.result, Some(json!("ok")));
        assert_eq!(done.retry_count, 2);

        // task:retry fired twice before task:completed.
        let mut retries = 0;
        let mut completed = false;
        while let Ok(event) = events.try_recv() {
            match event.name() {
                "task:retry" => {
                    assert!(!completed);
                    retries += 1;
                }
                "task:completed" => completed = true,
                _ => {}
            }
        }
        assert_eq!(retries, 2);
        assert!(completed);

        shutdown.cancel();
        pump.await.unwrap();
    }

    #[tokio::test]
    async fn exhausted_retries_fail() {
        let (queue, _) = queue(fast_options());
        queue.register_handler(
            "doomed",
            Arc::new(FlakyHandler {
                failures: u32::MAX,
                seen: AtomicU32::new(0),
            }),
        );
        let shutdown = CancellationToken::new();
        let pump = tokio::spawn(queue.clone().run(shutdown.clone()));

        let task = queue
            .add(TaskInput {
                task_type: "doomed".into(),
                max_retries: Some(1),
                ..Default::default()
            })
            .unwrap();
        let failed = wait_for_status(&queue, &task.id, TaskStatus::Failed).await;
        assert_eq!(failed.retry_count, 1);
        assert!(failed.error.is_some());

        shutdown.cancel();
        pump.await.unwrap();
    }

    #[tokio::test]
    async fn concurrency_never_exceeds_bound() {
        let (queue, _) = queue(QueueOptions {
            max_concurrent: 2,
            ..fast_options()
        });
        queue.register_handler("slow", Arc::new(SlowHandler));
        let shutdown = CancellationToken::new();
        let pump = tokio::spawn(queue.clone().run(shutdown.clone()));

        for _ in 0..6 {
            queue
                .add(TaskInput {
                    task_type: "slow".into(),
                    ..Default::default()
                })
                .unwrap();
        }

        // Sample the running count while the backlog drains.
        for _ in 0..40 {
            let running = queue.stats().unwrap()["running"];
            assert!(running <= 2, "running = {running}");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        shutdown.cancel();
        pump.await.unwrap();
    }

    #[tokio::test]
    async fn cancel_pending_only() {
        let (queue, _) = queue(fast_options());
        // No pump running, so the task stays pending.
        let task = queue
            .add(TaskInput {
                task_type: "t".into(),
                ..Default::default()
            })
            .unwrap();
        assert!(queue.cancel(&task.id).unwrap());
        assert!(!queue.cancel(&task.id).unwrap());
        let got = queue.get(&task.id).unwrap().unwrap();
        assert_eq!(got.status, TaskStatus::Cancelled);
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let (queue, _) = {
            let store = Arc::new(Store::open_in_memory(StoreOptions::default()).unwrap());
            let bus = EventBus::new();
            (
                Queue::new(
                    store,
                    bus.clone(),
                    QueueOptions {
                        retry_base: Duration::from_secs(1),
                        retry_max: Duration::from_secs(60),
                        ..QueueOptions::default()
                    },
                ),
                bus,
            )
        };
        assert_eq!(queue.backoff_delay(0), Duration::from_secs(1));
        assert_eq!(queue.backoff_delay(1), Duration::from_secs(2));
        assert_eq!(queue.backoff_delay(5), Duration::from_secs(32));
        assert_eq!(queue.backoff_delay(10), Duration::from_secs(60));
        assert_eq!(queue.backoff_delay(u32::MAX), Duration::from_secs(60));
    }
}
