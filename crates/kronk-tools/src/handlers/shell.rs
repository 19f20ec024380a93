//! Shell execution, gated on user confirmation.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use kronk_domain::{Error, Result};

use crate::confirm::ConfirmBroker;
use crate::registry::ToolHandler;

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const MAX_TIMEOUT_SECS: u64 = 300;

/// Cap per output stream; overflow is replaced by a truncation marker.
const MAX_STREAM_BYTES: usize = 1024 * 1024;
const TRUNCATION_MARKER: &str = "... [output truncated]";

const DENIED_STDERR: &str = "Command execution blocked: user confirmation required";

#[derive(Debug, Clone, Deserialize)]
struct ShellArgs {
    command: String,
    #[serde(default)]
    cwd: Option<String>,
    /// Seconds; clamped to [1, 300].
    #[serde(default)]
    timeout: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShellOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
    pub killed: bool,
}

impl ShellOutput {
    fn denied() -> Self {
        Self {
            stdout: String::new(),
            stderr: DENIED_STDERR.to_string(),
            exit_code: -1,
            killed: false,
        }
    }
}

/// The built-in `shell` tool.
pub struct ShellTool {
    confirm: Arc<ConfirmBroker>,
    default_cwd: PathBuf,
}

impl ShellTool {
    pub fn new(confirm: Arc<ConfirmBroker>, default_cwd: PathBuf) -> Self {
        Self {
            confirm,
            default_cwd,
        }
    }
}

#[async_trait::async_trait]
impl ToolHandler for ShellTool {
    async fn call(&self, args: Value) -> Result<Value> {
        let args: ShellArgs =
            serde_json::from_value(args).map_err(|e| Error::invalid(format!("shell args: {e}")))?;
        let cwd = args
            .cwd
            .map(PathBuf::from)
            .unwrap_or_else(|| self.default_cwd.clone());
        let timeout = args
            .timeout
            .unwrap_or(DEFAULT_TIMEOUT_SECS)
            .clamp(1, MAX_TIMEOUT_SECS);

        let output = run_shell(&self.confirm, &args.command, &cwd, timeout).await;
        Ok(serde_json::to_value(output)?)
    }
}

/// A dynamic shell tool: a persisted command template with
/// `${params.x}` placeholders, substituted shell-quoted at invoke time.
pub struct DynamicShellTool {
    template: String,
    confirm: Arc<ConfirmBroker>,
    cwd: PathBuf,
}

impl DynamicShellTool {
    pub fn new(template: String, confirm: Arc<ConfirmBroker>, cwd: PathBuf) -> Self {
        Self {
            template,
            confirm,
            cwd,
        }
    }
}

#[async_trait::async_trait]
impl ToolHandler for DynamicShellTool {
    async fn call(&self, args: Value) -> Result<Value> {
        let command = substitute_shell_template(&self.template, &args);
        let output = run_shell(&self.confirm, &command, &self.cwd, DEFAULT_TIMEOUT_SECS).await;
        Ok(serde_json::to_value(output)?)
    }
}

/// Replace `${params.key}` with the single-quoted value of `args.key`.
fn substitute_shell_template(template: &str, args: &Value) -> String {
    let mut out = template.to_string();
    if let Some(map) = args.as_object() {
        for (key, value) in map {
            let placeholder = format!("${{params.{key}}}");
            if !out.contains(&placeholder) {
                continue;
            }
            let raw = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            out = out.replace(&placeholder, &shell_quote(&raw));
        }
    }
    out
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Spawn `sh -c command`, enforcing the confirmation gate, the timeout,
/// and the per-stream output cap.
pub(crate) async fn run_shell(
    confirm: &ConfirmBroker,
    command: &str,
    cwd: &PathBuf,
    timeout_secs: u64,
) -> ShellOutput {
    if !confirm.request(command, &cwd.to_string_lossy()).await {
        return ShellOutput::denied();
    }

    let mut child = match Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(cwd)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            return ShellOutput {
                stdout: String::new(),
                stderr: format!("failed to spawn: {e}"),
                exit_code: -1,
                killed: false,
            }
        }
    };

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let stdout_task = tokio::spawn(read_capped(stdout));
    let stderr_task = tokio::spawn(read_capped(stderr));

    let (exit_code, killed) = tokio::select! {
        status = child.wait() => {
            let code = status.ok().and_then(|s| s.code()).map_or(-1, i64::from);
            (code, false)
        }
        _ = tokio::time::sleep(Duration::from_secs(timeout_secs)) => {
            let _ = child.kill().await;
            (-1, true)
        }
    };

    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();
    ShellOutput {
        stdout,
        stderr,
        exit_code,
        killed,
    }
}

/// Drain a stream into a string, keeping at most [`MAX_STREAM_BYTES`]
/// and appending the truncation marker on overflow.
async fn read_capped<R: tokio::io::AsyncRead + Unpin>(reader: Option<R>) -> String {
    let Some(mut reader) = reader else {
        return String::new();
    };
    let mut collected: Vec<u8> = Vec::new();
    let mut truncated = false;
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if collected.len() < MAX_STREAM_BYTES {
                    let room = MAX_STREAM_BYTES - collected.len();
                    collected.extend_from_slice(&buf[..n.min(room)]);
                    if n > room {
                        truncated = true;
                    }
                } else {
                    truncated = true;
                }
            }
            Err(_) => break,
        }
    }
    let mut out = String::from_utf8_lossy(&collected).into_owned();
    if truncated {
        out.push_str(TRUNCATION_MARKER);
    }
    out
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn approving_broker() -> Arc<ConfirmBroker> {
        let broker = Arc::new(ConfirmBroker::new());
        let mut rx = broker.set_listener();
        tokio::spawn(async move {
            while let Some(req) = rx.recv().await {
                let _ = req.respond.send(true);
            }
        });
        broker
    }

    #[tokio::test]
    async fn denied_without_listener() {
        let tool = ShellTool::new(Arc::new(ConfirmBroker::new()), PathBuf::from("/tmp"));
        let result = tool.call(json!({"command": "echo hi"})).await.unwrap();
        assert_eq!(result["stdout"], "");
        assert_eq!(result["stderr"], DENIED_STDERR);
        assert_eq!(result["exitCode"], -1);
        assert_eq!(result["killed"], false);
    }

    #[tokio::test]
    async fn runs_approved_command() {
        let tool = ShellTool::new(approving_broker(), PathBuf::from("/tmp"));
        let result = tool.call(json!({"command": "echo hello"})).await.unwrap();
        assert_eq!(result["stdout"], "hello\n");
        assert_eq!(result["exitCode"], 0);
        assert_eq!(result["killed"], false);
    }

    #[tokio::test]
    async fn captures_stderr_and_exit_code() {
        let tool = ShellTool::new(approving_broker(), PathBuf::from("/tmp"));
        let result = tool
            .call(json!({"command": "echo oops >&2; exit 3"}))
            .await
            .unwrap();
        assert_eq!(result["stderr"], "oops\n");
        assert_eq!(result["exitCode"], 3);
    }

    #[tokio::test]
    async fn timeout_kills_the_child() {
        let tool = ShellTool::new(approving_broker(), PathBuf::from("/tmp"));
        let started = std::time::Instant::now();
        let result = tool
            .call(json!({"command": "sleep 30", "timeout": 1}))
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(result["killed"], true);
        assert_eq!(result["exitCode"], -1);
    }

    #[tokio::test]
    async fn timeout_is_clamped_to_maximum() {
        let args: ShellArgs = serde_json::from_value(json!({
            "command": "true", "timeout": 10_000,
        }))
        .unwrap();
        assert_eq!(args.timeout.unwrap().clamp(1, MAX_TIMEOUT_SECS), 300);
    }

    #[tokio::test]
    async fn oversized_output_is_truncated() {
        let tool = ShellTool::new(approving_broker(), PathBuf::from("/tmp"));
        // ~2 MiB of zeros on stdout.
        let result = tool
            .call(json!({"command": "head -c 2097152 /dev/zero | tr '\\0' 'x'"}))
            .await
            .unwrap();
        let stdout = result["stdout"].as_str().unwrap();
        assert!(stdout.ends_with(TRUNCATION_MARKER));
        assert!(stdout.len() <= MAX_STREAM_BYTES + TRUNCATION_MARKER.len());
    }

    #[test]
    fn template_substitution_quotes_values() {
        let command = substitute_shell_template(
            "grep ${params.pattern} ${params.file}",
            &json!({"pattern": "a'b", "file": "notes.txt"}),
        );
        assert_eq!(command, r"grep 'a'\''b' 'notes.txt'");
    }
}
