//! The IPC server: JSON-RPC 2.0 over a Unix stream socket,
//! newline-delimited, with per-connection event subscriptions.

pub mod methods;
pub mod protocol;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use kronk_domain::{Error, Result};

use methods::RpcContext;
use protocol::{
    error_response, notification, result_response, Request, INTERNAL_ERROR, INVALID_REQUEST,
    PARSE_ERROR,
};

/// Outbound lines buffered per connection. A client that cannot drain
/// this backlog is closed rather than allowed to block the broadcaster.
const OUTBOX_CAPACITY: usize = 256;

/// Bind the socket, recovering a stale file left by a dead daemon.
/// Refuses to start when another process is listening.
pub fn bind_socket(path: &Path) -> Result<UnixListener> {
    if path.exists() {
        match std::os::unix::net::UnixStream::connect(path) {
            Ok(_) => {
                return Err(Error::Config(format!(
                    "another daemon is listening on {}",
                    path.display()
                )));
            }
            Err(_) => {
                tracing::warn!(path = %path.display(), "removing stale socket");
                std::fs::remove_file(path)?;
            }
        }
    }
    UnixListener::bind(path).map_err(Error::from)
}

/// Accept connections until shutdown; removes the socket file on exit.
pub async fn serve(
    listener: UnixListener,
    socket_path: PathBuf,
    ctx: Arc<RpcContext>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        let ctx = Arc::clone(&ctx);
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            handle_connection(stream, ctx, shutdown).await;
                        });
                    }
                    Err(e) => tracing::error!(error = %e, "accept failed"),
                }
            }
            _ = shutdown.cancelled() => break,
        }
    }
    if let Err(e) = std::fs::remove_file(&socket_path) {
        tracing::debug!(error = %e, "socket file removal");
    }
    tracing::info!("IPC server stopped");
}

async fn handle_connection(stream: UnixStream, ctx: Arc<RpcContext>, shutdown: CancellationToken) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    // Writer task: everything leaving this connection goes through one
    // bounded outbox, keeping responses ordered with notifications.
    let (outbox, mut outbox_rx) = mpsc::channel::<String>(OUTBOX_CAPACITY);
    let connection_gone = CancellationToken::new();
    let writer_gone = connection_gone.clone();
    let writer = tokio::spawn(async move {
        while let Some(line) = outbox_rx.recv().await {
            if write_half.write_all(line.as_bytes()).await.is_err()
                || write_half.write_all(b"\n").await.is_err()
            {
                break;
            }
        }
        writer_gone.cancel();
    });

    // Subscription set, shared with the event forwarder.
    let subscriptions: Arc<RwLock<HashSet<String>>> = Arc::new(RwLock::new(HashSet::new()));
    let forwarder = {
        let subscriptions = Arc::clone(&subscriptions);
        let outbox = outbox.clone();
        let gone = connection_gone.clone();
        let mut events = ctx.bus.subscribe();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    event = events.recv() => event,
                    _ = gone.cancelled() => return,
                };
                let event = match event {
                    Ok(event) => event,
                    // Lagged: this subscriber missed events; keep going.
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(_) => return,
                };
                let wanted = {
                    let subs = subscriptions.read();
                    subs.contains("*") || subs.contains(event.name())
                };
                if !wanted {
                    continue;
                }
                let line = notification(event.name(), event.params()).to_string();
                // A full outbox means a stuck client; close instead of
                // blocking the broadcast path.
                if outbox.try_send(line).is_err() {
                    tracing::warn!("closing slow IPC subscriber");
                    gone.cancel();
                    return;
                }
            }
        })
    };

    // Request loop: responses are produced in request order.
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = connection_gone.cancelled() => break,
            _ = shutdown.cancelled() => break,
        };
        let line = match line {
            Ok(Some(line)) => line,
            _ => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let reply = handle_line(&ctx, &subscriptions, &line).await;
        if let Some(reply) = reply {
            if outbox.send(reply.to_string()).await.is_err() {
                break;
            }
        }
    }

    connection_gone.cancel();
    forwarder.abort();
    drop(outbox);
    let _ = writer.await;
}

/// Parse and dispatch one request line; `None` for notifications that
/// produce no reply.
async fn handle_line(
    ctx: &Arc<RpcContext>,
    subscriptions: &Arc<RwLock<HashSet<String>>>,
    line: &str,
) -> Option<Value> {
    let request: Request = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(_) => {
            return Some(error_response(&Value::Null, PARSE_ERROR, "parse error"));
        }
    };
    let id = request.id.clone().unwrap_or(Value::Null);

    if request.jsonrpc.as_deref() != Some("2.0") {
        return Some(error_response(&id, INVALID_REQUEST, "expected jsonrpc 2.0"));
    }
    let Some(method) = request.method.as_deref() else {
        return Some(error_response(&id, INVALID_REQUEST, "missing method"));
    };
    let params = request.params.unwrap_or_else(|| Value::Object(Default::default()));

    // Connection-scoped methods.
    match method {
        "subscribe" => {
            let events = params
                .get("events")
                .and_then(Value::as_array)
                .map(|a| {
                    a.iter()
                        .filter_map(Value::as_str)
                        .map(String::from)
                        .collect::<Vec<_>>()
                })
                .unwrap_or_else(|| vec!["*".to_string()]);
            let mut subs = subscriptions.write();
            for event in events {
                subs.insert(event);
            }
            return Some(result_response(&id, serde_json::json!({"subscribed": true})));
        }
        "unsubscribe" => {
            let mut subs = subscriptions.write();
            match params.get("events").and_then(Value::as_array) {
                Some(events) => {
                    for event in events.iter().filter_map(Value::as_str) {
                        subs.remove(event);
                    }
                }
                None => subs.clear(),
            }
            return Some(result_response(&id, serde_json::json!({"unsubscribed": true})));
        }
        "shutdown" => {
            let shutdown = ctx.shutdown.clone();
            tokio::spawn(async move {
                // Let the reply flush before the listener stops.
                tokio::time::sleep(Duration::from_millis(100)).await;
                shutdown.cancel();
            });
            return Some(result_response(&id, serde_json::json!({"shuttingDown": true})));
        }
        _ => {}
    }

    match methods::dispatch(ctx, method, params).await {
        Ok(result) => Some(result_response(&id, result)),
        Err(e) => {
            if e.code == INTERNAL_ERROR {
                tracing::warn!(method, error = %e.message, "request failed");
            }
            Some(error_response(&id, e.code, &e.message))
        }
    }
}
