//! The tool registry: persistent catalog plus the process-local handler
//! table. Invocations never throw through the registry; every failure
//! lands in the returned result.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use serde_json::Value;

use kronk_domain::event::{Event, EventBus};
use kronk_domain::tool::{
    validate_tool_name, DynamicHandlerKind, HandlerRef, Tool, ToolInvocationResult, ToolSpec,
};
use kronk_domain::{Error, Result};
use kronk_store::Store;

use crate::confirm::ConfirmBroker;
use crate::handlers::http::HttpTemplateTool;
use crate::handlers::script::ScriptTool;
use crate::handlers::shell::DynamicShellTool;

/// A bound tool implementation.
#[async_trait::async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, args: Value) -> Result<Value>;
}

/// Everything a dynamic handler might need at (re)build time.
#[derive(Clone)]
pub struct DynamicDeps {
    pub confirm: Arc<ConfirmBroker>,
    pub project_root: PathBuf,
    pub http_client: reqwest::Client,
}

/// Rebuild a handler from its persisted kind and spec. Used both by
/// `create_tool` and by startup restoration.
pub fn build_dynamic_handler(
    kind: DynamicHandlerKind,
    spec: &str,
    deps: &DynamicDeps,
) -> Result<Arc<dyn ToolHandler>> {
    match kind {
        DynamicHandlerKind::Shell => Ok(Arc::new(DynamicShellTool::new(
            spec.to_string(),
            deps.confirm.clone(),
            deps.project_root.clone(),
        ))),
        DynamicHandlerKind::Http => Ok(Arc::new(HttpTemplateTool::from_spec(
            spec,
            deps.http_client.clone(),
        )?)),
        DynamicHandlerKind::Javascript => Ok(Arc::new(ScriptTool::new(spec)?)),
    }
}

/// Options for [`ToolRegistry::search`].
#[derive(Debug, Clone, Default)]
pub struct ToolSearchOpts {
    pub category: Option<String>,
    pub include_disabled: bool,
}

pub struct ToolRegistry {
    store: Arc<Store>,
    bus: EventBus,
    handlers: RwLock<HashMap<String, Arc<dyn ToolHandler>>>,
}

impl ToolRegistry {
    pub fn new(store: Arc<Store>, bus: EventBus) -> Self {
        Self {
            store,
            bus,
            handlers: RwLock::new(HashMap::new()),
        }
    }

    // ── Catalog ────────────────────────────────────────────────────

    /// Validate and upsert a catalog row.
    pub fn register(&self, spec: &ToolSpec) -> Result<Tool> {
        validate_tool_name(&spec.name)?;
        let handler_ref = HandlerRef::parse(&spec.handler_ref)?;
        if let HandlerRef::Dynamic { kind, spec: handler_spec } = &handler_ref {
            if handler_spec.is_empty() {
                return Err(Error::invalid("dynamic tool spec must be non-empty"));
            }
            // Dynamic rows must carry enough metadata to rebind at startup.
            let meta_kind = spec
                .metadata
                .get("handlerType")
                .and_then(Value::as_str)
                .and_then(DynamicHandlerKind::parse);
            if meta_kind != Some(*kind) {
                return Err(Error::invalid(
                    "dynamic tool metadata.handlerType must match its handler ref",
                ));
            }
        }
        self.store.upsert_tool(spec)
    }

    /// Bind a handler for an already-registered tool in this process.
    pub fn register_handler(&self, name: &str, handler: Arc<dyn ToolHandler>) {
        self.handlers.write().insert(name.to_string(), handler);
    }

    pub fn unregister_handler(&self, name: &str) {
        self.handlers.write().remove(name);
    }

    pub fn has_handler(&self, name: &str) -> bool {
        self.handlers.read().contains_key(name)
    }

    // ── Invocation ─────────────────────────────────────────────────

    /// Resolve and call the handler. Never propagates handler errors.
    pub async fn invoke(&self, name: &str, args: Value) -> ToolInvocationResult {
        let tool = match self.store.get_tool(name) {
            Ok(Some(tool)) => tool,
            Ok(None) => return ToolInvocationResult::err(format!("unknown tool: {name}")),
            Err(e) => return ToolInvocationResult::err(e.to_string()),
        };
        if !tool.enabled {
            return ToolInvocationResult::err(format!("tool is disabled: {name}"));
        }
        let handler = match self.handlers.read().get(name).cloned() {
            Some(h) => h,
            None => return ToolInvocationResult::err(format!("no handler bound for tool: {name}")),
        };

        self.bus.publish(Event::ToolInvokeStart {
            name: name.to_string(),
            args: args.clone(),
        });
        let started = Instant::now();
        let outcome = handler.call(args).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let result = match outcome {
            Ok(value) => ToolInvocationResult::ok(value),
            Err(e) => ToolInvocationResult::err(e.to_string()),
        };
        self.bus.publish(Event::ToolInvokeEnd {
            name: name.to_string(),
            success: result.success,
            duration_ms,
        });
        result
    }

    // ── Queries ────────────────────────────────────────────────────

    pub fn list_enabled(&self) -> Result<Vec<Tool>> {
        self.store.list_tools(true)
    }

    pub fn list_all(&self) -> Result<Vec<Tool>> {
        self.store.list_tools(false)
    }

    pub fn get(&self, name: &str) -> Result<Option<Tool>> {
        self.store.get_tool(name)
    }

    /// Substring match over name and description, optionally filtered
    /// by `metadata.category`.
    pub fn search(&self, query: &str, opts: &ToolSearchOpts) -> Result<Vec<Tool>> {
        let needle = query.to_lowercase();
        let tools = self.store.list_tools(!opts.include_disabled)?;
        Ok(tools
            .into_iter()
            .filter(|t| {
                let matches = t.name.to_lowercase().contains(&needle)
                    || t.description.to_lowercase().contains(&needle);
                let category_ok = opts.category.as_deref().is_none_or(|c| {
                    t.metadata.get("category").and_then(Value::as_str) == Some(c)
                });
                matches && category_ok
            })
            .collect())
    }

    pub fn list_by_category(&self, category: &str) -> Result<Vec<Tool>> {
        let tools = self.store.list_tools(false)?;
        Ok(tools
            .into_iter()
            .filter(|t| t.metadata.get("category").and_then(Value::as_str) == Some(category))
            .collect())
    }

    pub fn enable(&self, name: &str) -> Result<bool> {
        self.store.set_tool_enabled(name, true)
    }

    pub fn disable(&self, name: &str) -> Result<bool> {
        self.store.set_tool_enabled(name, false)
    }

    /// Delete the row and unbind its handler.
    pub fn delete(&self, name: &str) -> Result<bool> {
        self.unregister_handler(name);
        self.store.delete_tool(name)
    }

    /// Human-readable catalog for the system prompt, priority order.
    pub fn generate_tool_prompt(&self) -> Result<String> {
        let tools = self.list_enabled()?;
        if tools.is_empty() {
            return Ok(String::new());
        }
        let mut out = String::from("## Available tools\n");
        for tool in tools {
            out.push_str(&format!("\n### {}\n{}\n", tool.name, tool.description));
            if let Some(props) = tool.schema.get("properties").and_then(Value::as_object) {
                if !props.is_empty() {
                    out.push_str("Parameters:\n");
                    let required: Vec<&str> = tool
                        .schema
                        .get("required")
                        .and_then(Value::as_array)
                        .map(|a| a.iter().filter_map(Value::as_str).collect())
                        .unwrap_or_default();
                    for (key, prop) in props {
                        let kind = prop.get("type").and_then(Value::as_str).unwrap_or("any");
                        let note = prop
                            .get("description")
                            .and_then(Value::as_str)
                            .unwrap_or("");
                        let req = if required.contains(&key.as_str()) {
                            " (required)"
                        } else {
                            ""
                        };
                        out.push_str(&format!("- {key}: {kind}{req} {note}\n"));
                    }
                }
            }
        }
        Ok(out)
    }

    // ── Dynamic tool restoration ───────────────────────────────────

    /// Rebind handlers for every persisted dynamic tool. A tool that
    /// fails to rebuild is logged and skipped, never fatal.
    pub fn rebuild_dynamic_handlers(&self, deps: &DynamicDeps) -> Result<usize> {
        let mut rebuilt = 0;
        for tool in self.list_all()? {
            if !tool.is_dynamic() {
                continue;
            }
            let handler_ref = match HandlerRef::parse(&tool.handler_ref) {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(tool = %tool.name, error = %e, "skipping dynamic tool");
                    continue;
                }
            };
            let HandlerRef::Dynamic { kind, spec } = handler_ref else {
                tracing::warn!(tool = %tool.name, "dynamic metadata on a non-dynamic ref");
                continue;
            };
            match build_dynamic_handler(kind, &spec, deps) {
                Ok(handler) => {
                    self.register_handler(&tool.name, handler);
                    rebuilt += 1;
                }
                Err(e) => {
                    tracing::warn!(tool = %tool.name, error = %e, "failed to rebuild dynamic tool");
                }
            }
        }
        tracing::info!(rebuilt, "dynamic tool handlers restored");
        Ok(rebuilt)
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

    struct EchoHandler;

    #[async_trait::async_trait]
    impl ToolHandler for EchoHandler {
        async fn call(&self, args: Value) -> Result<Value> {
            Ok(json!({"echo": args}))
        }
    }

    struct FailingHandler;

    #[async_trait::async_trait]
    impl ToolHandler for FailingHandler {
        async fn call(&self, _args: Value) -> Result<Value> {
            Err(Error::Other("handler blew up".into()))
        }
    }

    fn registry() -> ToolRegistry {
        let store = Arc::new(Store::open_in_memory(StoreOptions::default()).unwrap());
        ToolRegistry::new(store, EventBus::new())
    }

    fn spec(name: &str) -> ToolSpec {
        ToolSpec {
            name: name.into(),
            description: "test tool".into(),
            schema: json!({"type": "object", "properties": {}}),
            handler_ref: format!("runtime:{name}"),
            enabled: true,
            priority: 0,
            metadata: json!({}),
        }
    }

    #[tokio::test]
    async fn invoke_routes_to_handler() {
        let reg = registry();
        reg.register(&spec("echo")).unwrap();
        reg.register_handler("echo", Arc::new(EchoHandler));

        let result = reg.invoke("echo", json!({"x": 1})).await;
        assert!(result.success);
        assert_eq!(result.result.unwrap()["echo"]["x"], 1);
    }

    #[tokio::test]
    async fn handler_errors_never_throw() {
        let reg = registry();
        reg.register(&spec("boom")).unwrap();
        reg.register_handler("boom", Arc::new(FailingHandler));

        let result = reg.invoke("boom", json!({})).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("handler blew up"));
    }

    #[tokio::test]
    async fn unknown_and_disabled_tools_fail_cleanly() {
        let reg = registry();
        let missing = reg.invoke("nope", json!({})).await;
        assert!(!missing.success);

        reg.register(&spec("off")).unwrap();
        reg.register_handler("off", Arc::new(EchoHandler));
        reg.disable("off").unwrap();
        let disabled = reg.invoke("off", json!({})).await;
        assert!(!disabled.success);
        assert!(disabled.error.unwrap().contains("disabled"));
    }

    #[test]
    fn register_rejects_bad_names() {
        let reg = registry();
        let mut bad = spec("ok");
        bad.name = "not a name".into();
        assert!(reg.register(&bad).is_err());
    }

    #[test]
    fn dynamic_registration_requires_matching_metadata() {
        let reg = registry();
        let mut dynamic = spec("dyn_tool");
        dynamic.handler_ref = "dynamic:javascript:return 1;".into();
        // Missing metadata.handlerType.
        assert!(reg.register(&dynamic).is_err());

        dynamic.metadata = json!({
            "dynamicTool": true,
            "handlerType": "javascript",
            "handlerSpec": "return 1;",
        });
        assert!(reg.register(&dynamic).is_ok());
    }

    #[test]
    fn search_matches_name_and_description() {
        let reg = registry();
        reg.register(&spec("alpha")).unwrap();
        let mut beta = spec("beta");
        beta.description = "greek alpha helper".into();
        reg.register(&beta).unwrap();

        let hits = reg.search("alpha", &ToolSearchOpts::default()).unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn tool_prompt_lists_parameters() {
        let reg = registry();
        let mut tool = spec("add_numbers");
        tool.schema = json!({
            "type": "object",
            "properties": {
                "a": {"type": "number"},
                "b": {"type": "number"},
            },
            "required": ["a", "b"],
        });
        reg.register(&tool).unwrap();

        let prompt = reg.generate_tool_prompt().unwrap();
        assert!(prompt.contains("### add_numbers"));
        assert!(prompt.contains("a: number (required)"));
    }
}
