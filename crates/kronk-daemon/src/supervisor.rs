//! Daemon wiring and lifecycle.
//!
//! The supervisor owns every component and hands narrow interfaces
//! downstream: the scheduler gets closures over the memory manager, the
//! watcher service gets an [`AgentHandle`], and the IPC server gets the
//! dispatch context. Shutdown is signal-driven; the store closes last.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use kronk_agent::{Agent, AgentOptions};
use kronk_domain::config::KronkConfig;
use kronk_domain::event::EventBus;
use kronk_domain::queue::QueueTask;
use kronk_domain::tool::ToolSpec;
use kronk_domain::Result;
use kronk_journal::Journal;
use kronk_memory::MemoryManager;
use kronk_providers::create_provider;
use kronk_queue::{Queue, QueueOptions, TaskHandler};
use kronk_scheduler::Scheduler;
use kronk_store::Store;
use kronk_tools::handlers::meta::{
    CreateTaskTool, CreateToolTool, DiscoverToolsTool, JournalTool,
};
use kronk_tools::handlers::shell::ShellTool;
use kronk_tools::skills::{DiscoverSkillsTool, ReadSkillTool};
use kronk_tools::{ConfirmBroker, DynamicDeps, ToolRegistry};
use kronk_watcher::{WatcherActions, WatcherService};

use crate::bootstrap::{store_options, EMBEDDING_DIM};
use crate::ipc;
use crate::ipc::methods::RpcContext;
use crate::llm_bridge::{LlmEmbedder, LlmSummarizer};
use crate::paths::ProjectPaths;
use crate::pid;

/// Queue task type handled by the daemon itself: a deferred agent run.
const AGENT_RUN_TASK: &str = "agent-run";

struct AgentRunHandler {
    agent: Arc<Agent>,
}

#[async_trait::async_trait]
impl TaskHandler for AgentRunHandler {
    async fn handle(&self, task: &QueueTask) -> Result<Value> {
        let message = task
            .payload
            .as_ref()
            .and_then(|p| p.get("message"))
            .and_then(Value::as_str)
            .ok_or_else(|| kronk_domain::Error::invalid("agent-run payload needs a message"))?;
        let result = self.agent.run(message).await;
        if result.success {
            Ok(json!({"response": result.response, "iterations": result.iterations}))
        } else {
            Err(kronk_domain::Error::Other(
                result.error.unwrap_or_else(|| "agent run failed".into()),
            ))
        }
    }
}

/// Run the daemon until a shutdown signal or IPC `shutdown` request.
pub async fn run(paths: ProjectPaths) -> anyhow::Result<()> {
    let config = KronkConfig::load(&paths.config())?;
    let pid_path = crate::paths::effective_pid(&paths, &config);

    // The PID lock guards single-instance; held until exit.
    let pid_handle = pid::write_pid_file(&pid_path)?;

    let outcome = run_components(&paths, config).await;

    pid::remove_pid_file(&pid_path, pid_handle);
    outcome
}

async fn run_components(paths: &ProjectPaths, config: KronkConfig) -> anyhow::Result<()> {
    // Store initialization failure is fatal.
    let store = Arc::new(Store::open(&paths.db(), store_options(&config))?);
    let bus = EventBus::new();
    let shutdown = CancellationToken::new();

    // ── Leaves first ───────────────────────────────────────────────
    let memory = Arc::new(MemoryManager::new(
        store.clone(),
        bus.clone(),
        config.memory_limits.clone(),
    ));
    let journal = Arc::new(Journal::new(store.clone(), bus.clone()));
    let tools = Arc::new(ToolRegistry::new(store.clone(), bus.clone()));

    let provider = create_provider(&config)?;
    let summarizer = Arc::new(LlmSummarizer::new(provider.clone()));
    memory.set_summarizer(summarizer.clone());
    if config.use_vector_search {
        memory.set_embedder(Arc::new(LlmEmbedder::new(provider.clone(), EMBEDDING_DIM)));
    }

    // ── Tools ──────────────────────────────────────────────────────
    let confirm = Arc::new(ConfirmBroker::new());
    let deps = DynamicDeps {
        confirm: confirm.clone(),
        project_root: paths.root.clone(),
        http_client: reqwest::Client::new(),
    };
    register_builtin_tools(&tools, &journal, &store, &bus, &config, paths, &deps)?;
    tools.rebuild_dynamic_handlers(&deps)?;

    // ── Queue, agent, scheduler, watchers ──────────────────────────
    let queue = Queue::new(
        store.clone(),
        bus.clone(),
        QueueOptions {
            max_concurrent: config.queue.max_concurrent,
            default_retries: config.queue.default_retries,
            ..Default::default()
        },
    );

    let agent = Agent::new(
        store.clone(),
        memory.clone(),
        journal.clone(),
        tools.clone(),
        provider,
        bus.clone(),
        AgentOptions {
            max_iterations: 10,
            constitution_path: paths.constitution(),
        },
    );
    queue.register_handler(
        AGENT_RUN_TASK,
        Arc::new(AgentRunHandler {
            agent: agent.clone(),
        }),
    );

    let scheduler = Scheduler::new(bus.clone());
    register_maintenance_tasks(&scheduler, &memory, &config)?;

    let watchers = WatcherService::new(
        store.clone(),
        bus.clone(),
        WatcherActions {
            agent: agent.clone(),
            memory: memory.clone(),
            queue: queue.clone(),
        },
        paths.root.clone(),
    );
    watchers.restore()?;

    // ── IPC ────────────────────────────────────────────────────────
    let socket_path = crate::paths::effective_socket(paths, &config);
    let listener = ipc::bind_socket(&socket_path)?;
    let ctx = Arc::new(RpcContext {
        config: config.clone(),
        store,
        memory,
        journal,
        tools,
        queue: queue.clone(),
        scheduler: scheduler.clone(),
        watchers: watchers.clone(),
        agent,
        summarizer,
        bus: bus.clone(),
        shutdown: shutdown.clone(),
        started_at: Instant::now(),
    });

    let mut workers = Vec::new();
    workers.push(tokio::spawn(queue.run(shutdown.clone())));
    workers.push(tokio::spawn(scheduler.run(shutdown.clone())));
    workers.push(tokio::spawn(watchers.run(shutdown.clone())));
    workers.push(tokio::spawn(ipc::serve(
        listener,
        socket_path,
        ctx,
        shutdown.clone(),
    )));

    tracing::info!(name = %config.name, root = %paths.root.display(), "daemon running");

    // ── Wait for a stop signal ─────────────────────────────────────
    wait_for_shutdown(&shutdown).await;
    shutdown.cancel();
    for worker in workers {
        let _ = tokio::time::timeout(Duration::from_secs(5), worker).await;
    }
    tracing::info!("daemon stopped");
    Ok(())
}

async fn wait_for_shutdown(shutdown: &CancellationToken) {
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("interrupt received"),
        _ = sigterm => tracing::info!("terminate received"),
        _ = shutdown.cancelled() => tracing::info!("shutdown requested over IPC"),
    }
}

// ── Built-in tool catalog ──────────────────────────────────────────

fn builtin_spec(name: &str, description: &str, schema: Value) -> ToolSpec {
    ToolSpec {
        name: name.into(),
        description: description.into(),
        schema,
        handler_ref: format!("core:{name}"),
        enabled: true,
        priority: 10,
        metadata: json!({"category": "builtin"}),
    }
}

fn register_builtin_tools(
    tools: &Arc<ToolRegistry>,
    journal: &Arc<Journal>,
    store: &Arc<Store>,
    bus: &EventBus,
    config: &KronkConfig,
    paths: &ProjectPaths,
    deps: &DynamicDeps,
) -> Result<()> {
    let skills_dir = Arc::new(paths.skills());

    tools.register(&builtin_spec(
        "shell",
        "Run a shell command. Requires user confirmation.",
        json!({
            "type": "object",
            "properties": {
                "command": {"type": "string", "description": "command line to run"},
                "cwd": {"type": "string", "description": "working directory"},
                "timeout": {"type": "number", "description": "seconds, max 300"},
            },
            "required": ["command"],
        }),
    ))?;
    tools.register_handler(
        "shell",
        Arc::new(ShellTool::new(deps.confirm.clone(), paths.root.clone())),
    );

    tools.register(&builtin_spec(
        "create_tool",
        "Define a new tool (shell template, HTTP template, or JavaScript body).",
        json!({
            "type": "object",
            "properties": {
                "name": {"type": "string"},
                "description": {"type": "string"},
                "schema": {"type": "object"},
                "handlerType": {"type": "string", "enum": ["shell", "http", "javascript"]},
                "handlerSpec": {"type": "string"},
            },
            "required": ["name", "description", "handlerType", "handlerSpec"],
        }),
    ))?;
    tools.register_handler(
        "create_tool",
        Arc::new(CreateToolTool::new(tools.clone(), deps.clone())),
    );

    tools.register(&builtin_spec(
        "create_task",
        "Queue a background task.",
        json!({
            "type": "object",
            "properties": {
                "type": {"type": "string"},
                "payload": {"type": "object"},
                "priority": {"type": "number"},
                "maxRetries": {"type": "number"},
            },
            "required": ["type"],
        }),
    ))?;
    tools.register_handler(
        "create_task",
        Arc::new(CreateTaskTool::new(
            store.clone(),
            bus.clone(),
            config.queue.default_retries,
        )),
    );

    tools.register(&builtin_spec(
        "discover_tools",
        "List the tools currently available.",
        json!({"type": "object", "properties": {}}),
    ))?;
    tools.register_handler("discover_tools", Arc::new(DiscoverToolsTool::new(tools.clone())));

    tools.register(&builtin_spec(
        "discover_skills",
        "List available skills.",
        json!({"type": "object", "properties": {}}),
    ))?;
    tools.register_handler(
        "discover_skills",
        Arc::new(DiscoverSkillsTool::new(skills_dir.clone())),
    );

    tools.register(&builtin_spec(
        "read_skill",
        "Read one skill's full content.",
        json!({
            "type": "object",
            "properties": {"name": {"type": "string"}},
            "required": ["name"],
        }),
    ))?;
    tools.register_handler("read_skill", Arc::new(ReadSkillTool::new(skills_dir)));

    tools.register(&builtin_spec(
        "journal",
        "Append a typed entry to the journal.",
        json!({
            "type": "object",
            "properties": {
                "type": {"type": "string"},
                "content": {"type": "string"},
            },
            "required": ["content"],
        }),
    ))?;
    tools.register_handler("journal", Arc::new(JournalTool::new(journal.clone())));

    Ok(())
}

// ── Maintenance schedule ───────────────────────────────────────────

fn register_maintenance_tasks(
    scheduler: &Arc<Scheduler>,
    memory: &Arc<MemoryManager>,
    config: &KronkConfig,
) -> Result<()> {
    let decay = memory.clone();
    scheduler.register_task(
        "memory-decay",
        &config.scheduler.memory_decay,
        Arc::new(move || {
            let memory = decay.clone();
            Box::pin(async move { memory.apply_decay().map(|_| ()) })
        }),
    )?;

    let cleanup = memory.clone();
    scheduler.register_task(
        "memory-cleanup",
        &config.scheduler.memory_cleanup,
        Arc::new(move || {
            let memory = cleanup.clone();
            Box::pin(async move { memory.cleanup().map(|_| ()) })
        }),
    )?;

    let consolidate = memory.clone();
    scheduler.register_task(
        "memory-consolidation",
        &config.scheduler.consolidation,
        Arc::new(move || {
            let memory = consolidate.clone();
            Box::pin(async move { memory.consolidate_all().await.map(|_| ()) })
        }),
    )?;

    Ok(())
}
