//! CLI verbs. Every verb except `init` and `start --foreground` is a
//! thin JSON-RPC client over the daemon socket.

pub mod client;

use clap::{Parser, Subcommand};
use serde_json::{json, Value};

use kronk_domain::config::{KronkConfig, ProviderKind};

use crate::bootstrap;
use crate::paths::{self, ProjectPaths};
use crate::supervisor;

#[derive(Parser)]
#[command(name = "kronk", version, about = "A persistent local agent runtime")]
pub struct Cli {
    /// Verbose logging.
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Initialize a new project in the current directory.
    Init {
        #[arg(long, default_value = "kronk")]
        name: String,
        #[arg(long, default_value = "ollama")]
        provider: String,
        #[arg(long)]
        model: Option<String>,
        /// Enable embedding-based memory search.
        #[arg(long)]
        vector: bool,
    },
    /// Start the daemon.
    Start {
        /// Stay in the foreground instead of detaching.
        #[arg(long)]
        foreground: bool,
    },
    /// Stop the daemon.
    Stop,
    /// Restart the daemon.
    Restart,
    /// Show project and daemon status.
    Status,
    /// Interactive session with the agent.
    Ui,
    /// Interactive session with the agent.
    Chat,
    /// Tail the daemon log.
    Logs {
        #[arg(short = 'n', long, default_value_t = 50)]
        lines: usize,
    },
    /// Memory stats, or recall with a query.
    Memory {
        query: Option<String>,
        #[arg(long)]
        tier: Option<String>,
    },
    /// Recent journal entries, or search with a query.
    Journal {
        query: Option<String>,
        #[arg(short = 'n', long, default_value_t = 20)]
        lines: usize,
    },
    /// List registered tools.
    Tools,
    /// Queue contents and stats.
    Queue {
        #[arg(long)]
        stats: bool,
    },
    /// Manage filesystem watchers.
    Watch {
        #[command(subcommand)]
        action: WatchAction,
    },
    /// Print the constitution.
    Constitution,
    /// Print the effective configuration.
    Config,
}

#[derive(Subcommand)]
pub enum WatchAction {
    List,
    Add {
        pattern: String,
        /// run | memory | queue
        #[arg(long, default_value = "queue")]
        action: String,
        /// JSON action config.
        #[arg(long)]
        config: Option<String>,
        #[arg(long, default_value_t = 500)]
        debounce: u64,
    },
    Rm { id: String },
    Enable { id: String },
    Disable { id: String },
}

pub async fn execute(cli: Cli) -> anyhow::Result<()> {
    let cwd = std::env::current_dir()?;

    match cli.command {
        Command::Init {
            name,
            provider,
            model,
            vector,
        } => {
            let provider = ProviderKind::parse(&provider)
                .ok_or_else(|| anyhow::anyhow!("unknown provider: {provider}"))?;
            let paths = paths::project_root_for(&cwd, &name)?;
            let config = KronkConfig {
                name: name.clone(),
                provider,
                model,
                use_vector_search: vector,
                debug: cli.debug,
                ..Default::default()
            };
            bootstrap::init_project(&paths, &config)?;
            println!("Initialized {name} at {}", paths.root.display());
            Ok(())
        }

        Command::Start { foreground } => {
            let paths = resolve_initialized(&cwd)?;
            if foreground {
                supervisor::run(paths).await
            } else {
                start_detached(&paths)
            }
        }

        Command::Stop => {
            let paths = resolve_initialized(&cwd)?;
            client::call_once(&socket_of(&paths), "shutdown", json!({})).await?;
            println!("Daemon stopping");
            Ok(())
        }

        Command::Restart => {
            let paths = resolve_initialized(&cwd)?;
            if let Err(e) = client::call_once(&socket_of(&paths), "shutdown", json!({})).await {
                tracing::debug!(error = %e, "stop before restart");
            }
            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
            start_detached(&paths)
        }

        Command::Status => status(&cwd).await,

        Command::Ui | Command::Chat => chat(&cwd).await,

        Command::Logs { lines } => {
            let paths = resolve_initialized(&cwd)?;
            let content = std::fs::read_to_string(paths.log()).unwrap_or_default();
            for line in tail(&content, lines) {
                println!("{line}");
            }
            Ok(())
        }

        Command::Memory { query, tier } => {
            let paths = resolve_initialized(&cwd)?;
            match query {
                Some(query) => {
                    let mut params = json!({"query": query});
                    if let Some(tier) = tier {
                        params["tier"] = json!(tier);
                    }
                    let hits = client::call_once(&socket_of(&paths), "agent.recall", params).await?;
                    for hit in hits.as_array().into_iter().flatten() {
                        println!(
                            "[{:.2}] ({}) {}",
                            hit["similarity"].as_f64().unwrap_or(0.0),
                            hit["tier"].as_str().unwrap_or("?"),
                            hit["content"].as_str().unwrap_or(""),
                        );
                    }
                }
                None => {
                    let stats = client::call_once(&socket_of(&paths), "memory.stats", json!({})).await?;
                    println!("{}", serde_json::to_string_pretty(&stats)?);
                }
            }
            Ok(())
        }

        Command::Journal { query, lines } => {
            let paths = resolve_initialized(&cwd)?;
            let entries = match query {
                Some(query) => {
                    client::call_once(
                        &socket_of(&paths),
                        "journal.search",
                        json!({"query": query, "limit": lines}),
                    )
                    .await?
                }
                None => {
                    client::call_once(&socket_of(&paths), "journal.recent", json!({"limit": lines}))
                        .await?
                }
            };
            for entry in entries.as_array().into_iter().flatten().rev() {
                println!(
                    "[{}] {} {}",
                    entry["entryType"].as_str().unwrap_or("?").to_uppercase(),
                    entry["createdAt"].as_str().unwrap_or(""),
                    entry["content"].as_str().unwrap_or(""),
                );
            }
            Ok(())
        }

        Command::Tools => {
            let paths = resolve_initialized(&cwd)?;
            let tools = client::call_once(&socket_of(&paths), "tools.list", json!({})).await?;
            for tool in tools.as_array().into_iter().flatten() {
                let marker = if tool["enabled"].as_bool().unwrap_or(false) {
                    ""
                } else {
                    " (disabled)"
                };
                println!(
                    "{}{marker}\n    {}",
                    tool["name"].as_str().unwrap_or("?"),
                    tool["description"].as_str().unwrap_or(""),
                );
            }
            Ok(())
        }

        Command::Queue { stats } => {
            let paths = resolve_initialized(&cwd)?;
            if stats {
                let stats = client::call_once(&socket_of(&paths), "queue.stats", json!({})).await?;
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                let tasks = client::call_once(&socket_of(&paths), "queue.list", json!({})).await?;
                for task in tasks.as_array().into_iter().flatten() {
                    println!(
                        "{} {} [{}] priority={} retries={}",
                        task["id"].as_str().unwrap_or("?"),
                        task["type"].as_str().unwrap_or("?"),
                        task["status"].as_str().unwrap_or("?"),
                        task["priority"].as_i64().unwrap_or(0),
                        task["retryCount"].as_u64().unwrap_or(0),
                    );
                }
            }
            Ok(())
        }

        Command::Watch { action } => watch(&cwd, action).await,

        Command::Constitution => {
            let paths = resolve_initialized(&cwd)?;
            let content = std::fs::read_to_string(paths.constitution())
                .unwrap_or_else(|_| "No constitution found.".into());
            println!("{content}");
            Ok(())
        }

        Command::Config => {
            let paths = resolve_initialized(&cwd)?;
            let content = std::fs::read_to_string(paths.config())?;
            println!("{}", content.trim_end());
            Ok(())
        }
    }
}

// ── Verb helpers ───────────────────────────────────────────────────

fn resolve_initialized(cwd: &std::path::Path) -> anyhow::Result<ProjectPaths> {
    let paths = paths::resolve_project_root(cwd);
    if !paths.is_initialized() {
        anyhow::bail!(
            "no kronk project found at {} (run `kronk init` first)",
            paths.root.display()
        );
    }
    Ok(paths)
}

/// Socket path for client verbs, honoring the config override.
fn socket_of(paths: &ProjectPaths) -> std::path::PathBuf {
    match KronkConfig::load(&paths.config()) {
        Ok(config) => paths::effective_socket(paths, &config),
        Err(_) => paths.socket(),
    }
}

/// Spawn the daemon detached, logging to the project's log file.
fn start_detached(paths: &ProjectPaths) -> anyhow::Result<()> {
    let exe = std::env::current_exe()?;
    std::process::Command::new(exe)
        .args(["start", "--foreground"])
        .env("KRONK_DAEMON", "1")
        .env("KRONK_PATH", &paths.root)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()?;
    println!("Daemon started (socket: {})", paths.socket().display());
    Ok(())
}

async fn status(cwd: &std::path::Path) -> anyhow::Result<()> {
    let paths = paths::resolve_project_root(cwd);
    if !paths.is_initialized() {
        println!("Initialized: false ({})", paths.root.display());
        return Ok(());
    }

    match client::call_once(&socket_of(&paths), "agent.status", json!({})).await {
        Ok(status) => {
            println!("Daemon: running");
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Err(_) => {
            // Daemon down: report what the store says directly.
            let config = KronkConfig::load(&paths.config())?;
            let store =
                kronk_store::Store::open(&paths.db(), bootstrap::store_options(&config))?;
            let counts = store.count_memories_by_tier()?;
            let status = json!({
                "initialized": true,
                "config": {"name": config.name, "provider": config.provider.as_str()},
                "memoryCount": counts,
                "journalCount": store.count_journal_entries()?,
                "toolCount": store.count_tools()?,
            });
            println!("Daemon: not running");
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }
    Ok(())
}

async fn chat(cwd: &std::path::Path) -> anyhow::Result<()> {
    let paths = resolve_initialized(cwd)?;
    let mut rpc = client::Client::connect(&socket_of(&paths)).await?;

    println!("Connected. Type a message; /quit exits.");
    let mut editor = rustyline::DefaultEditor::new()?;
    loop {
        let line = match editor.readline("> ") {
            Ok(line) => line,
            Err(rustyline::error::ReadlineError::Interrupted)
            | Err(rustyline::error::ReadlineError::Eof) => break,
            Err(e) => return Err(e.into()),
        };
        let message = line.trim();
        if message.is_empty() {
            continue;
        }
        if message == "/quit" || message == "/exit" {
            break;
        }
        let _ = editor.add_history_entry(message);

        match rpc.call("agent.run", json!({"message": message})).await {
            Ok(result) => {
                if result["success"].as_bool().unwrap_or(false) {
                    println!("{}", result["response"].as_str().unwrap_or(""));
                } else {
                    eprintln!("Error: {}", result["error"].as_str().unwrap_or("run failed"));
                }
            }
            Err(e) => eprintln!("Error: {e}"),
        }
    }
    Ok(())
}

async fn watch(cwd: &std::path::Path, action: WatchAction) -> anyhow::Result<()> {
    let paths = resolve_initialized(cwd)?;
    match action {
        WatchAction::List => {
            let watchers = client::call_once(&socket_of(&paths), "watcher.list", json!({})).await?;
            for w in watchers.as_array().into_iter().flatten() {
                let marker = if w["enabled"].as_bool().unwrap_or(false) {
                    ""
                } else {
                    " (disabled)"
                };
                println!(
                    "{} {} -> {}{marker} (debounce {} ms)",
                    w["id"].as_str().unwrap_or("?"),
                    w["pattern"].as_str().unwrap_or("?"),
                    w["action"].as_str().unwrap_or("?"),
                    w["debounceMs"].as_u64().unwrap_or(0),
                );
            }
        }
        WatchAction::Add {
            pattern,
            action,
            config,
            debounce,
        } => {
            let action_config: Value = match config {
                Some(raw) => serde_json::from_str(&raw)?,
                None => json!({}),
            };
            let added = client::call_once(
                &socket_of(&paths),
                "watcher.add",
                json!({
                    "pattern": pattern,
                    "action": action,
                    "actionConfig": action_config,
                    "debounceMs": debounce,
                }),
            )
            .await?;
            println!("Added watcher {}", added["id"].as_str().unwrap_or("?"));
        }
        WatchAction::Rm { id } => {
            client::call_once(&socket_of(&paths), "watcher.remove", json!({"id": id})).await?;
            println!("Removed {id}");
        }
        WatchAction::Enable { id } => {
            client::call_once(&socket_of(&paths), "watcher.enable", json!({"id": id})).await?;
            println!("Enabled {id}");
        }
        WatchAction::Disable { id } => {
            client::call_once(&socket_of(&paths), "watcher.disable", json!({"id": id})).await?;
            println!("Disabled {id}");
        }
    }
    Ok(())
}

fn tail(content: &str, n: usize) -> Vec<&str> {
    let lines: Vec<&str> = content.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].to_vec()
}
