//! End-to-end IPC tests: a wired daemon context behind a real Unix
//! socket, driven by a line-oriented JSON-RPC client.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio_util::sync::CancellationToken;

use kronk_agent::{Agent, AgentOptions};
use kronk_daemon::bootstrap::store_options;
use kronk_daemon::ipc;
use kronk_daemon::ipc::methods::RpcContext;
use kronk_daemon::paths::ProjectPaths;
use kronk_domain::config::KronkConfig;
use kronk_domain::event::EventBus;
use kronk_domain::stream::{BoxStream, StreamChunk};
use kronk_domain::Result;
use kronk_journal::Journal;
use kronk_memory::{MemoryManager, Summarizer};
use kronk_providers::{
    ChatRequest, ChatResponse, EmbeddingsRequest, EmbeddingsResponse, LlmProvider,
};
use kronk_queue::{Queue, QueueOptions};
use kronk_scheduler::Scheduler;
use kronk_store::Store;
use kronk_tools::ToolRegistry;
use kronk_watcher::{WatcherActions, WatcherService};

struct StubProvider;

#[async_trait::async_trait]
impl LlmProvider for StubProvider {
    async fn chat(&self, _req: ChatRequest) -> Result<ChatResponse> {
        Ok(ChatResponse {
            content: "stub".into(),
            tool_calls: vec![],
            usage: None,
            model: "stub".into(),
        })
    }

    async fn chat_stream(
        &self,
        req: ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamChunk>>> {
        let response = self.chat(req).await?;
        let stream = async_stream::stream! {
            yield Ok(StreamChunk::Chunk { content: response.content.clone() });
            yield Ok(StreamChunk::Done { tokens_used: None });
        };
        Ok(Box::pin(stream))
    }

    async fn embeddings(&self, _req: EmbeddingsRequest) -> Result<EmbeddingsResponse> {
        Ok(EmbeddingsResponse { embeddings: vec![] })
    }

    fn provider_id(&self) -> &str {
        "stub"
    }
}

struct StubSummarizer;

#[async_trait::async_trait]
impl Summarizer for StubSummarizer {
    async fn summarize(&self, texts: &[String]) -> Result<String> {
        Ok(format!("summary of {}", texts.len()))
    }
}

struct TestDaemon {
    socket: std::path::PathBuf,
    shutdown: CancellationToken,
    server: tokio::task::JoinHandle<()>,
    _dir: tempfile::TempDir,
}

async fn spawn_daemon() -> TestDaemon {
    let dir = tempfile::tempdir().unwrap();
    let paths = ProjectPaths::new(dir.path().join(".alpha"));
    std::fs::create_dir_all(&paths.root).unwrap();
    std::fs::create_dir_all(paths.skills()).unwrap();

    let config = KronkConfig {
        name: "alpha".into(),
        ..Default::default()
    };
    let store = Arc::new(Store::open(&paths.db(), store_options(&config)).unwrap());
    let bus = EventBus::new();
    let shutdown = CancellationToken::new();

    let memory = Arc::new(MemoryManager::new(
        store.clone(),
        bus.clone(),
        config.memory_limits.clone(),
    ));
    let journal = Arc::new(Journal::new(store.clone(), bus.clone()));
    let tools = Arc::new(ToolRegistry::new(store.clone(), bus.clone()));
    let provider: Arc<dyn LlmProvider> = Arc::new(StubProvider);
    let queue = Queue::new(store.clone(), bus.clone(), QueueOptions::default());
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
    let scheduler = Scheduler::new(bus.clone());
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

    let ctx = Arc::new(RpcContext {
        config,
        store,
        memory,
        journal,
        tools,
        queue,
        scheduler,
        watchers,
        agent,
        summarizer: Arc::new(StubSummarizer),
        bus,
        shutdown: shutdown.clone(),
        started_at: Instant::now(),
    });

    let socket = paths.socket();
    let listener = ipc::bind_socket(&socket).unwrap();
    let server = tokio::spawn(ipc::serve(
        listener,
        socket.clone(),
        ctx,
        shutdown.clone(),
    ));

    TestDaemon {
        socket,
        shutdown,
        server,
        _dir: dir,
    }
}

struct TestClient {
    reader: tokio::io::Lines<BufReader<tokio::net::unix::OwnedReadHalf>>,
    writer: tokio::net::unix::OwnedWriteHalf,
}

impl TestClient {
    async fn connect(socket: &std::path::Path) -> Self {
        let stream = UnixStream::connect(socket).await.unwrap();
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: BufReader::new(read_half).lines(),
            writer: write_half,
        }
    }

    async fn send_raw(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
    }

    async fn next_message(&mut self) -> Value {
        let line = tokio::time::timeout(Duration::from_secs(5), self.reader.next_line())
            .await
            .expect("timed out waiting for a message")
            .unwrap()
            .expect("connection closed");
        serde_json::from_str(&line).unwrap()
    }

    async fn call(&mut self, id: u64, method: &str, params: Value) -> Value {
        let request = json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params});
        self.send_raw(&request.to_string()).await;
        loop {
            let message = self.next_message().await;
            if message.get("id").and_then(Value::as_u64) == Some(id) {
                return message;
            }
        }
    }
}

#[tokio::test]
async fn ping_round_trip() {
    let daemon = spawn_daemon().await;
    let mut client = TestClient::connect(&daemon.socket).await;

    let response = client.call(1, "ping", json!({})).await;
    assert_eq!(response["result"], "pong");

    daemon.shutdown.cancel();
    let _ = daemon.server.await;
}

#[tokio::test]
async fn malformed_json_gets_parse_error() {
    let daemon = spawn_daemon().await;
    let mut client = TestClient::connect(&daemon.socket).await;

    client.send_raw("this is not json").await;
    let response = client.next_message().await;
    assert_eq!(response["error"]["code"], -32700);

    // The connection survives a bad line.
    let response = client.call(2, "ping", json!({})).await;
    assert_eq!(response["result"], "pong");

    daemon.shutdown.cancel();
    let _ = daemon.server.await;
}

#[tokio::test]
async fn envelope_and_method_validation() {
    let daemon = spawn_daemon().await;
    let mut client = TestClient::connect(&daemon.socket).await;

    client
        .send_raw(r#"{"id": 1, "method": "ping"}"#)
        .await;
    let response = client.next_message().await;
    assert_eq!(response["error"]["code"], -32600);

    let response = client.call(2, "no.such.method", json!({})).await;
    assert_eq!(response["error"]["code"], -32601);

    let response = client.call(3, "agent.run", json!({})).await;
    assert_eq!(response["error"]["code"], -32602);

    daemon.shutdown.cancel();
    let _ = daemon.server.await;
}

#[tokio::test]
async fn memory_round_trip_over_ipc() {
    let daemon = spawn_daemon().await;
    let mut client = TestClient::connect(&daemon.socket).await;

    let response = client
        .call(
            1,
            "agent.remember",
            json!({"content": "the build is green", "tier": "working"}),
        )
        .await;
    assert_eq!(response["result"]["tier"], "working");

    let response = client
        .call(2, "agent.recall", json!({"query": "build"}))
        .await;
    let hits = response["result"].as_array().unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0]["content"], "the build is green");

    let response = client.call(3, "memory.stats", json!({})).await;
    assert_eq!(response["result"]["counts"]["working"], 1);

    daemon.shutdown.cancel();
    let _ = daemon.server.await;
}

#[tokio::test]
async fn subscribers_receive_matching_events() {
    let daemon = spawn_daemon().await;
    let mut subscriber = TestClient::connect(&daemon.socket).await;
    let mut producer = TestClient::connect(&daemon.socket).await;

    let response = subscriber
        .call(1, "subscribe", json!({"events": ["task:added"]}))
        .await;
    assert_eq!(response["result"]["subscribed"], true);

    producer
        .call(1, "queue.add", json!({"type": "demo", "priority": 1}))
        .await;

    let notification = subscriber.next_message().await;
    assert!(notification.get("id").is_none());
    assert_eq!(notification["method"], "task:added");
    assert_eq!(notification["params"]["type"], "demo");

    daemon.shutdown.cancel();
    let _ = daemon.server.await;
}

#[tokio::test]
async fn unsubscribed_events_are_not_delivered() {
    let daemon = spawn_daemon().await;
    let mut client = TestClient::connect(&daemon.socket).await;

    client
        .call(1, "subscribe", json!({"events": ["run:complete"]}))
        .await;
    client.call(2, "queue.add", json!({"type": "demo"})).await;

    // The next message must be the ping reply, not a task event.
    let response = client.call(3, "ping", json!({})).await;
    assert_eq!(response["result"], "pong");

    daemon.shutdown.cancel();
    let _ = daemon.server.await;
}

#[tokio::test]
async fn shutdown_method_stops_the_server() {
    let daemon = spawn_daemon().await;
    let mut client = TestClient::connect(&daemon.socket).await;

    let response = client.call(1, "shutdown", json!({})).await;
    assert_eq!(response["result"]["shuttingDown"], true);

    tokio::time::timeout(Duration::from_secs(5), daemon.server)
        .await
        .expect("server did not stop")
        .unwrap();
    assert!(!daemon.socket.exists());
}

#[tokio::test]
async fn stale_socket_is_recovered() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("kronk.sock");
    // A socket file nobody is listening on.
    drop(std::os::unix::net::UnixListener::bind(&socket).unwrap());
    assert!(socket.exists());

    let listener = ipc::bind_socket(&socket).unwrap();
    drop(listener);
}

#[tokio::test]
async fn live_socket_refuses_second_daemon() {
    let daemon = spawn_daemon().await;
    assert!(ipc::bind_socket(&daemon.socket).is_err());

    daemon.shutdown.cancel();
    let _ = daemon.server.await;
}
