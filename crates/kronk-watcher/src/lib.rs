//! Filesystem watchers: path-glob monitors with per-(watcher, path)
//! debounce that trigger an agent run, a memory write, or a queued task.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{RecursiveMode, Watcher as NotifyWatcher};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use kronk_domain::agent::AgentHandle;
use kronk_domain::event::{Event, EventBus};
use kronk_domain::memory::{MemoryInput, MemorySource, MemoryTier};
use kronk_domain::queue::TaskInput;
use kronk_domain::watcher::{FsEventKind, Watcher, WatcherAction, WatcherInput};
use kronk_domain::Result;
use kronk_memory::MemoryManager;
use kronk_queue::Queue;
use kronk_store::Store;

/// The handles watcher actions dispatch into. The service receives
/// these narrow interfaces, never the daemon itself.
#[derive(Clone)]
pub struct WatcherActions {
    pub agent: Arc<dyn AgentHandle>,
    pub memory: Arc<MemoryManager>,
    pub queue: Arc<Queue>,
}

type DebounceKey = (String, PathBuf);

pub struct WatcherService {
    store: Arc<Store>,
    bus: EventBus,
    actions: WatcherActions,
    root: PathBuf,
    /// Enabled watcher rows, kept in sync with the store.
    active: RwLock<HashMap<String, Watcher>>,
    /// One pending timer per (watcher, path); each new event restarts it.
    timers: Mutex<HashMap<DebounceKey, JoinHandle<()>>>,
}

impl WatcherService {
    pub fn new(
        store: Arc<Store>,
        bus: EventBus,
        actions: WatcherActions,
        root: PathBuf,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            bus,
            actions,
            root,
            active: RwLock::new(HashMap::new()),
            timers: Mutex::new(HashMap::new()),
        })
    }

    // ── Management ─────────────────────────────────────────────────

    /// Load enabled watchers from the store; called at daemon startup.
    pub fn restore(&self) -> Result<usize> {
        let watchers = self.store.list_watchers(true)?;
        let count = watchers.len();
        let mut active = self.active.write();
        active.clear();
        for w in watchers {
            active.insert(w.id.clone(), w);
        }
        tracing::info!(count, "watchers restored");
        Ok(count)
    }

    pub fn add(&self, input: &WatcherInput) -> Result<Watcher> {
        // Reject unparsable globs at the boundary.
        glob::Pattern::new(&input.pattern)
            .map_err(|e| kronk_domain::Error::invalid(format!("watcher pattern: {e}")))?;
        let watcher = self.store.insert_watcher(input)?;
        if watcher.enabled {
            self.active.write().insert(watcher.id.clone(), watcher.clone());
        }
        Ok(watcher)
    }

    pub fn remove(&self, id: &str) -> Result<bool> {
        self.active.write().remove(id);
        self.store.delete_watcher(id)
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<bool> {
        let changed = self.store.set_watcher_enabled(id, enabled)?;
        if changed {
            if enabled {
                if let Some(w) = self.store.get_watcher(id)? {
                    self.active.write().insert(w.id.clone(), w);
                }
            } else {
                self.active.write().remove(id);
            }
        }
        Ok(changed)
    }

    pub fn list(&self) -> Result<Vec<Watcher>> {
        self.store.list_watchers(false)
    }

    // ── Event intake ───────────────────────────────────────────────

    /// Watch the project root until shutdown, feeding filesystem events
    /// through the debounce logic.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let (tx, mut rx) = mpsc::unbounded_channel::<(PathBuf, FsEventKind)>();

        let mut fs_watcher = match notify::recommended_watcher(
            move |result: notify::Result<notify::Event>| {
                let Ok(event) = result else { return };
                let Some(kind) = map_event_kind(&event.kind) else {
                    return;
                };
                for path in event.paths {
                    let _ = tx.send((path, kind));
                }
            },
        ) {
            Ok(w) => w,
            Err(e) => {
                tracing::error!(error = %e, "failed to create filesystem watcher");
                return;
            }
        };
        if let Err(e) = fs_watcher.watch(&self.root, RecursiveMode::Recursive) {
            tracing::error!(root = %self.root.display(), error = %e, "failed to watch project root");
            return;
        }

        loop {
            tokio::select! {
                event = rx.recv() => {
                    let Some((path, kind)) = event else { return };
                    self.handle_fs_event(&path, kind);
                }
                _ = shutdown.cancelled() => {
                    tracing::debug!("watcher service stopping");
                    let mut timers = self.timers.lock();
                    for (_, timer) in timers.drain() {
                        timer.abort();
                    }
                    return;
                }
            }
        }
    }

    /// Route one filesystem event to every matching watcher, restarting
    /// that watcher's debounce timer for the path.
    pub fn handle_fs_event(self: &Arc<Self>, path: &Path, kind: FsEventKind) {
        let relative = path.strip_prefix(&self.root).unwrap_or(path);
        let matching: Vec<Watcher> = self
            .active
            .read()
            .values()
            .filter(|w| pattern_matches(&w.pattern, relative))
            .cloned()
            .collect();

        for watcher in matching {
            self.schedule(watcher, path.to_path_buf(), kind);
        }
    }

    fn schedule(self: &Arc<Self>, watcher: Watcher, path: PathBuf, kind: FsEventKind) {
        let key = (watcher.id.clone(), path.clone());
        let debounce = Duration::from_millis(watcher.debounce_ms);
        let service = Arc::clone(self);
        let timer_key = key.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            service.timers.lock().remove(&timer_key);
            service.fire(&watcher, &timer_key.1, kind).await;
        });

        // Restart: the previous timer for this key is cancelled.
        if let Some(previous) = self.timers.lock().insert(key, handle) {
            previous.abort();
        }
    }

    // ── Actions ────────────────────────────────────────────────────

    async fn fire(&self, watcher: &Watcher, path: &Path, kind: FsEventKind) {
        let path_str = path.to_string_lossy().to_string();
        self.bus.publish(Event::WatcherTriggered {
            watcher_id: watcher.id.clone(),
            path: path_str.clone(),
            fs_event: kind.as_str().to_string(),
        });

        let outcome = match watcher.action {
            WatcherAction::Run => self.fire_run(watcher, path, kind).await,
            WatcherAction::Memory => self.fire_memory(watcher, path, kind).await,
            WatcherAction::Queue => self.fire_queue(watcher, path, kind),
        };
        if let Err(e) = outcome {
            tracing::warn!(
                watcher_id = %watcher.id,
                path = %path_str,
                error = %e,
                "watcher action failed"
            );
        }
    }

    async fn fire_run(&self, watcher: &Watcher, path: &Path, kind: FsEventKind) -> Result<()> {
        let template = watcher
            .action_config
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("The file {path} changed ({event}). Review it.");
        let message = render_template(template, path, kind);
        self.actions.agent.run(&message).await?;
        Ok(())
    }

    async fn fire_memory(&self, watcher: &Watcher, path: &Path, kind: FsEventKind) -> Result<()> {
        let config = &watcher.action_config;
        let template = config
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or("File {event}: {path}");
        let tier = config
            .get("tier")
            .and_then(Value::as_str)
            .and_then(MemoryTier::parse);
        let tags: Vec<String> = config
            .get("tags")
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(Value::as_str).map(String::from).collect())
            .unwrap_or_else(|| vec!["watcher".into()]);
        self.actions
            .memory
            .store(MemoryInput {
                content: render_template(template, path, kind),
                tier,
                importance: config.get("importance").and_then(Value::as_f64),
                source: Some(MemorySource::Tool),
                tags,
                related_ids: Vec::new(),
                expires_at: None,
            })
            .await?;
        Ok(())
    }

    fn fire_queue(&self, watcher: &Watcher, path: &Path, kind: FsEventKind) -> Result<()> {
        let task_type = watcher
            .action_config
            .get("taskType")
            .and_then(Value::as_str)
            .unwrap_or("file-change");
        self.actions.queue.add(TaskInput {
            task_type: task_type.to_string(),
            payload: Some(json!({
                "path": path.to_string_lossy(),
                "event": kind.as_str(),
                "watcherId": watcher.id,
            })),
            priority: 0,
            max_retries: None,
        })?;
        Ok(())
    }
}

/// Match a watcher pattern against a root-relative path. Patterns with
/// a leading `./` are normalized first.
fn pattern_matches(pattern: &str, relative: &Path) -> bool {
    let normalized = pattern.strip_prefix("./").unwrap_or(pattern);
    match glob::Pattern::new(normalized) {
        Ok(p) => p.matches_path(relative),
        Err(_) => false,
    }
}

/// `{path}`, `{event}`, and `{basename}` substitutions.
fn render_template(template: &str, path: &Path, kind: FsEventKind) -> String {
    let basename = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    template
        .replace("{path}", &path.to_string_lossy())
        .replace("{event}", kind.as_str())
        .replace("{basename}", &basename)
}

fn map_event_kind(kind: &notify::EventKind) -> Option<FsEventKind> {
    use notify::EventKind;
    match kind {
        EventKind::Create(_) => Some(FsEventKind::Add),
        EventKind::Modify(_) => Some(FsEventKind::Change),
        EventKind::Remove(_) => Some(FsEventKind::Unlink),
        _ => None,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
