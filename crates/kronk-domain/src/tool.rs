//! Tool catalog entities and invocation results.

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handler references
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// How a dynamic tool's handler is reconstructed at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DynamicHandlerKind {
    Shell,
    Http,
    Javascript,
}

impl DynamicHandlerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DynamicHandlerKind::Shell => "shell",
            DynamicHandlerKind::Http => "http",
            DynamicHandlerKind::Javascript => "javascript",
        }
    }

    pub fn parse(s: &str) -> Option<DynamicHandlerKind> {
        match s {
            "shell" => Some(DynamicHandlerKind::Shell),
            "http" => Some(DynamicHandlerKind::Http),
            "javascript" => Some(DynamicHandlerKind::Javascript),
            _ => None,
        }
    }
}

/// Parsed form of a tool row's `handler_ref` column.
///
/// `core:<name>` and `runtime:<name>` handlers are bound in-process;
/// `dynamic:<kind>:<spec>` handlers are rebuilt from the persisted spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerRef {
    Core(String),
    Runtime(String),
    Dynamic { kind: DynamicHandlerKind, spec: String },
}

impl HandlerRef {
    pub fn parse(s: &str) -> Result<HandlerRef> {
        if let Some(name) = s.strip_prefix("core:") {
            return Ok(HandlerRef::Core(name.to_string()));
        }
        if let Some(name) = s.strip_prefix("runtime:") {
            return Ok(HandlerRef::Runtime(name.to_string()));
        }
        if let Some(rest) = s.strip_prefix("dynamic:") {
            let (kind_str, spec) = rest
                .split_once(':')
                .ok_or_else(|| Error::invalid(format!("malformed handler ref: {s}")))?;
            let kind = DynamicHandlerKind::parse(kind_str)
                .ok_or_else(|| Error::invalid(format!("unknown dynamic handler kind: {kind_str}")))?;
            return Ok(HandlerRef::Dynamic {
                kind,
                spec: spec.to_string(),
            });
        }
        Err(Error::invalid(format!("malformed handler ref: {s}")))
    }

    pub fn render(&self) -> String {
        match self {
            HandlerRef::Core(name) => format!("core:{name}"),
            HandlerRef::Runtime(name) => format!("runtime:{name}"),
            HandlerRef::Dynamic { kind, spec } => format!("dynamic:{}:{}", kind.as_str(), spec),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool record
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A persisted catalog row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    pub id: String,
    pub name: String,
    pub description: String,
    /// JSON-Schema-shaped parameter description.
    pub schema: Value,
    pub handler_ref: String,
    pub enabled: bool,
    /// Higher priority tools are listed first in the generated prompt.
    pub priority: i64,
    /// Free-form map; dynamic tools carry `dynamicTool`, `handlerType`,
    /// and `handlerSpec` here so the handler can be rebuilt at startup.
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Tool {
    pub fn is_dynamic(&self) -> bool {
        self.metadata
            .get("dynamicTool")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// Input for registering a tool.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    #[serde(default = "default_schema")]
    pub schema: Value,
    pub handler_ref: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub priority: i64,
    #[serde(default = "default_metadata")]
    pub metadata: Value,
}

fn default_schema() -> Value {
    serde_json::json!({"type": "object", "properties": {}})
}

fn default_enabled() -> bool {
    true
}

fn default_metadata() -> Value {
    serde_json::json!({})
}

/// The result of a tool invocation. The registry never throws to the
/// caller; handler failures land in `error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInvocationResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolInvocationResult {
    pub fn ok(result: Value) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(message.into()),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Name validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

static NAME_RE: OnceLock<Regex> = OnceLock::new();

/// Validate a tool name: ASCII, starts with a letter, then letters,
/// digits, or underscores.
pub fn validate_tool_name(name: &str) -> Result<()> {
    let re = NAME_RE
        .get_or_init(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_]*$").expect("static pattern"));
    if re.is_match(name) {
        Ok(())
    } else {
        Err(Error::invalid(format!("invalid tool name: {name:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_names() {
        for name in ["shell", "add_numbers", "Tool2", "x"] {
            assert!(validate_tool_name(name).is_ok(), "{name}");
        }
    }

    #[test]
    fn invalid_names() {
        for name in ["", "2tool", "my-tool", "a b", "emoji🦀", "_x"] {
            assert!(validate_tool_name(name).is_err(), "{name}");
        }
    }

    #[test]
    fn handler_ref_round_trip() {
        for raw in ["core:shell", "runtime:custom", "dynamic:javascript:return 1;"] {
            let parsed = HandlerRef::parse(raw).unwrap();
            assert_eq!(parsed.render(), raw);
        }
    }

    #[test]
    fn handler_ref_dynamic_spec_keeps_colons() {
        let parsed = HandlerRef::parse("dynamic:http:{\"url\":\"http://x\"}").unwrap();
        match parsed {
            HandlerRef::Dynamic { kind, spec } => {
                assert_eq!(kind, DynamicHandlerKind::Http);
                assert_eq!(spec, "{\"url\":\"http://x\"}");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn handler_ref_rejects_garbage() {
        assert!(HandlerRef::parse("plugin:x").is_err());
        assert!(HandlerRef::parse("dynamic:python:spec").is_err());
        assert!(HandlerRef::parse("dynamic:shell").is_err());
    }
}
