//! Meta-tools let the agent grow itself: defining new tools, queueing
//! work, and introspecting what it can do.

use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

use kronk_domain::event::{Event, EventBus};
use kronk_domain::id::new_id;
use kronk_domain::journal::{JournalEntryOpts, JournalEntryType};
use kronk_domain::queue::{QueueTask, TaskStatus};
use kronk_domain::tool::{validate_tool_name, DynamicHandlerKind, ToolSpec};
use kronk_domain::{Error, Result};
use kronk_journal::Journal;
use kronk_store::Store;

use crate::registry::{build_dynamic_handler, DynamicDeps, ToolHandler, ToolRegistry};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// create_tool
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateToolArgs {
    name: String,
    description: String,
    #[serde(default)]
    schema: Option<Value>,
    handler_type: String,
    handler_spec: String,
}

/// Defines a new dynamic tool: persists the row and binds its runtime
/// handler immediately, so the next iteration can already call it.
pub struct CreateToolTool {
    registry: Arc<ToolRegistry>,
    deps: DynamicDeps,
}

impl CreateToolTool {
    pub fn new(registry: Arc<ToolRegistry>, deps: DynamicDeps) -> Self {
        Self { registry, deps }
    }
}

#[async_trait::async_trait]
impl ToolHandler for CreateToolTool {
    async fn call(&self, args: Value) -> Result<Value> {
        let args: CreateToolArgs = serde_json::from_value(args)
            .map_err(|e| Error::invalid(format!("create_tool args: {e}")))?;
        validate_tool_name(&args.name)?;
        let kind = DynamicHandlerKind::parse(&args.handler_type).ok_or_else(|| {
            Error::invalid(format!(
                "handlerType must be shell, http, or javascript; got {:?}",
                args.handler_type
            ))
        })?;
        if args.handler_spec.trim().is_empty() {
            return Err(Error::invalid("handlerSpec must be non-empty"));
        }

        // Build first: a spec that cannot produce a handler is rejected
        // before anything is persisted.
        let handler = build_dynamic_handler(kind, &args.handler_spec, &self.deps)?;

        let spec = ToolSpec {
            name: args.name.clone(),
            description: args.description,
            schema: args
                .schema
                .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
            handler_ref: format!("dynamic:{}:{}", kind.as_str(), args.handler_spec),
            enabled: true,
            priority: 0,
            metadata: json!({
                "dynamicTool": true,
                "handlerType": kind.as_str(),
                "handlerSpec": args.handler_spec,
                "createdBy": "agent",
            }),
        };
        let tool = self.registry.register(&spec)?;
        self.registry.register_handler(&tool.name, handler);
        Ok(json!({"name": tool.name, "created": true}))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// create_task
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateTaskArgs {
    #[serde(rename = "type")]
    task_type: String,
    #[serde(default)]
    payload: Option<Value>,
    #[serde(default)]
    priority: i64,
    #[serde(default)]
    max_retries: Option<u32>,
}

/// Enqueues a background task.
pub struct CreateTaskTool {
    store: Arc<Store>,
    bus: EventBus,
    default_retries: u32,
}

impl CreateTaskTool {
    pub fn new(store: Arc<Store>, bus: EventBus, default_retries: u32) -> Self {
        Self {
            store,
            bus,
            default_retries,
        }
    }
}

#[async_trait::async_trait]
impl ToolHandler for CreateTaskTool {
    async fn call(&self, args: Value) -> Result<Value> {
        let args: CreateTaskArgs = serde_json::from_value(args)
            .map_err(|e| Error::invalid(format!("create_task args: {e}")))?;
        let task = QueueTask {
            id: new_id(),
            task_type: args.task_type.clone(),
            payload: args.payload,
            priority: args.priority,
            status: TaskStatus::Pending,
            retry_count: 0,
            max_retries: args.max_retries.unwrap_or(self.default_retries),
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
        Ok(json!({"id": task.id, "status": "pending"}))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// discover_tools
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Read-only listing of the enabled catalog.
pub struct DiscoverToolsTool {
    registry: Arc<ToolRegistry>,
}

impl DiscoverToolsTool {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait::async_trait]
impl ToolHandler for DiscoverToolsTool {
    async fn call(&self, _args: Value) -> Result<Value> {
        let tools: Vec<Value> = self
            .registry
            .list_enabled()?
            .into_iter()
            .map(|t| json!({"name": t.name, "description": t.description}))
            .collect();
        Ok(json!({"tools": tools}))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// journal
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
struct JournalArgs {
    #[serde(rename = "type", default)]
    entry_type: Option<String>,
    content: String,
}

/// Appends a typed entry to the journal.
pub struct JournalTool {
    journal: Arc<Journal>,
}

impl JournalTool {
    pub fn new(journal: Arc<Journal>) -> Self {
        Self { journal }
    }
}

#[async_trait::async_trait]
impl ToolHandler for JournalTool {
    async fn call(&self, args: Value) -> Result<Value> {
        let args: JournalArgs = serde_json::from_value(args)
            .map_err(|e| Error::invalid(format!("journal args: {e}")))?;
        let entry_type = match args.entry_type.as_deref() {
            None => JournalEntryType::Observation,
            Some(raw) => JournalEntryType::parse(raw)
                .ok_or_else(|| Error::invalid(format!("unknown journal entry type: {raw}")))?,
        };
        let entry = self
            .journal
            .log(entry_type, &args.content, JournalEntryOpts::default())?;
        Ok(json!({"id": entry.id, "type": entry.entry_type.as_str()}))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confirm::ConfirmBroker;
    use kronk_store::StoreOptions;

    fn deps() -> DynamicDeps {
        DynamicDeps {
            confirm: Arc::new(ConfirmBroker::new()),
            project_root: std::env::temp_dir(),
            http_client: reqwest::Client::new(),
        }
    }

    fn fixtures() -> (Arc<Store>, Arc<ToolRegistry>, EventBus) {
        let store = Arc::new(Store::open_in_memory(StoreOptions::default()).unwrap());
        let bus = EventBus::new();
        let registry = Arc::new(ToolRegistry::new(store.clone(), bus.clone()));
        (store, registry, bus)
    }

    #[tokio::test]
    async fn create_tool_persists_and_binds() {
        let (_, registry, _) = fixtures();
        let create = CreateToolTool::new(registry.clone(), deps());

        let result = create
            .call(json!({
                "name": "add_numbers",
                "description": "adds two numbers",
                "schema": {
                    "type": "object",
                    "properties": {"a": {"type": "number"}, "b": {"type": "number"}},
                    "required": ["a", "b"],
                },
                "handlerType": "javascript",
                "handlerSpec": "return { sum: params.a + params.b };",
            }))
            .await
            .unwrap();
        assert_eq!(result["created"], true);

        // Immediately invokable.
        let invoked = registry.invoke("add_numbers", json!({"a": 5, "b": 3})).await;
        assert!(invoked.success);
        assert_eq!(invoked.result.unwrap(), json!({"sum": 8}));

        // Persisted with rebuildable metadata.
        let tool = registry.get("add_numbers").unwrap().unwrap();
        assert!(tool.is_dynamic());
        assert_eq!(tool.metadata["handlerType"], "javascript");
        assert!(!tool.metadata["handlerSpec"].as_str().unwrap().is_empty());
    }

    #[tokio::test]
    async fn create_tool_survives_rebuild() {
        let (_, registry, _) = fixtures();
        let create = CreateToolTool::new(registry.clone(), deps());
        create
            .call(json!({
                "name": "double_it",
                "description": "doubles",
                "handlerType": "javascript",
                "handlerSpec": "return params.x * 2;",
            }))
            .await
            .unwrap();

        // Simulate daemon restart: drop runtime handlers, rebuild.
        registry.unregister_handler("double_it");
        let rebuilt = registry.rebuild_dynamic_handlers(&deps()).unwrap();
        assert_eq!(rebuilt, 1);

        let invoked = registry.invoke("double_it", json!({"x": 4})).await;
        assert!(invoked.success);
        assert_eq!(invoked.result.unwrap(), json!(8));
    }

    #[tokio::test]
    async fn create_tool_rejects_bad_script() {
        let (_, registry, _) = fixtures();
        let create = CreateToolTool::new(registry.clone(), deps());
        let err = create
            .call(json!({
                "name": "broken",
                "description": "never compiles",
                "handlerType": "javascript",
                "handlerSpec": "return {{{",
            }))
            .await;
        assert!(err.is_err());
        assert!(registry.get("broken").unwrap().is_none());
    }

    #[tokio::test]
    async fn create_task_inserts_pending_row() {
        let (store, _, bus) = fixtures();
        let create = CreateTaskTool::new(store.clone(), bus, 3);
        let result = create
            .call(json!({"type": "digest", "payload": {"n": 1}, "priority": 2}))
            .await
            .unwrap();

        let id = result["id"].as_str().unwrap();
        let task = store.get_task(id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.priority, 2);
        assert_eq!(task.max_retries, 3);
    }

    #[tokio::test]
    async fn discover_tools_lists_enabled() {
        let (_, registry, _) = fixtures();
        registry
            .register(&ToolSpec {
                name: "visible".into(),
                description: "shown".into(),
                schema: json!({"type": "object", "properties": {}}),
                handler_ref: "runtime:visible".into(),
                enabled: true,
                priority: 0,
                metadata: json!({}),
            })
            .unwrap();

        let discover = DiscoverToolsTool::new(registry);
        let result = discover.call(json!({})).await.unwrap();
        assert_eq!(result["tools"][0]["name"], "visible");
    }
}
