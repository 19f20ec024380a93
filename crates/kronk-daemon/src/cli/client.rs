//! JSON-RPC client used by the CLI verbs to talk to the daemon.

use std::path::Path;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;

use kronk_domain::{Error, Result};

pub struct Client {
    reader: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
    next_id: u64,
}

impl Client {
    pub async fn connect(socket: &Path) -> Result<Self> {
        let stream = UnixStream::connect(socket).await.map_err(|_| {
            Error::Config("daemon is not running (no socket); start it with `kronk start`".into())
        })?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read_half).lines(),
            writer: write_half,
            next_id: 1,
        })
    }

    /// Issue one request and wait for its response, skipping any event
    /// notifications that arrive in between.
    pub async fn call(&mut self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id;
        self.next_id += 1;
        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        self.writer
            .write_all(request.to_string().as_bytes())
            .await?;
        self.writer.write_all(b"\n").await?;

        loop {
            let line = self
                .reader
                .next_line()
                .await?
                .ok_or_else(|| Error::Other("daemon closed the connection".into()))?;
            let message: Value = serde_json::from_str(&line)?;
            if message.get("id").and_then(Value::as_u64) != Some(id) {
                continue;
            }
            if let Some(error) = message.get("error") {
                let text = error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error");
                return Err(Error::Other(text.to_string()));
            }
            return Ok(message.get("result").cloned().unwrap_or(Value::Null));
        }
    }
}

/// One-shot convenience for simple verbs.
pub async fn call_once(socket: &Path, method: &str, params: Value) -> Result<Value> {
    let mut client = Client::connect(socket).await?;
    client.call(method, params).await
}
