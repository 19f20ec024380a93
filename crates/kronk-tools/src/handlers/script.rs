//! Inline-script tools, executed on an embedded QuickJS engine.
//!
//! The persisted spec is a JavaScript function body; invocation calls
//! `(params) => { <body> }` with the tool arguments. The body is
//! compiled at registration so syntax errors are rejected up front.
//! Execution carries a 1000 ms wall-clock budget enforced through the
//! engine's interrupt handler; isolation beyond the time bound is
//! deliberately not attempted.

use std::time::{Duration, Instant};

use rquickjs::{Context, Ctx, Function, Runtime, Type, Value as JsValue};
use serde_json::{json, Value};

use kronk_domain::{Error, Result};

use crate::registry::ToolHandler;

/// Wall-clock budget for one invocation, including promise settlement.
const SCRIPT_BUDGET: Duration = Duration::from_millis(1000);

pub struct ScriptTool {
    body: String,
}

impl ScriptTool {
    /// Compile-check the body and keep it for invocation.
    pub fn new(body: &str) -> Result<Self> {
        validate_script(body)?;
        Ok(Self {
            body: body.to_string(),
        })
    }

    pub fn body(&self) -> &str {
        &self.body
    }
}

/// Reject bodies that do not compile as a function.
pub fn validate_script(body: &str) -> Result<()> {
    let source = wrap_body(body);
    let runtime = Runtime::new().map_err(engine_err)?;
    let context = Context::full(&runtime).map_err(engine_err)?;
    context.with(|ctx| match ctx.eval::<Function, _>(source) {
        Ok(_) => Ok(()),
        Err(e) => Err(Error::invalid(format!(
            "script syntax error: {}",
            describe_js_error(&ctx, e)
        ))),
    })
}

fn wrap_body(body: &str) -> String {
    format!("(params) => {{ {body} }}")
}

fn engine_err(e: rquickjs::Error) -> Error {
    Error::Other(format!("script engine: {e}"))
}

#[async_trait::async_trait]
impl ToolHandler for ScriptTool {
    async fn call(&self, args: Value) -> Result<Value> {
        let body = self.body.clone();
        tokio::task::spawn_blocking(move || execute(&body, &args))
            .await
            .map_err(|e| Error::Other(format!("script task: {e}")))?
    }
}

/// Run the compiled function on a fresh runtime with the time budget.
fn execute(body: &str, args: &Value) -> Result<Value> {
    let deadline = Instant::now() + SCRIPT_BUDGET;
    let runtime = Runtime::new().map_err(engine_err)?;
    runtime.set_interrupt_handler(Some(Box::new(move || Instant::now() >= deadline)));
    let context = Context::full(&runtime).map_err(engine_err)?;

    context.with(|ctx| {
        let func: Function = ctx
            .eval(wrap_body(body))
            .map_err(|e| script_err(&ctx, e, deadline))?;
        let params = json_to_js(&ctx, args).map_err(engine_err)?;
        let result: JsValue = func
            .call((params,))
            .map_err(|e| script_err(&ctx, e, deadline))?;

        // A deferred return value is awaited within the same budget.
        let result = settle(&runtime, &ctx, result, deadline)?;
        js_to_json(&result)
    })
}

/// Drive pending jobs until a returned promise settles or the budget
/// runs out.
fn settle<'js>(
    runtime: &Runtime,
    ctx: &Ctx<'js>,
    value: JsValue<'js>,
    deadline: Instant,
) -> Result<JsValue<'js>> {
    let Some(promise) = value.as_promise().cloned() else {
        return Ok(value);
    };
    loop {
        match promise.result::<JsValue>() {
            Some(Ok(resolved)) => return Ok(resolved),
            Some(Err(e)) => return Err(script_err(ctx, e, deadline)),
            None => {
                if Instant::now() >= deadline {
                    return Err(budget_exceeded());
                }
                match runtime.execute_pending_job() {
                    Ok(true) => {}
                    Ok(false) => {
                        // Nothing left to run; a promise that cannot
                        // make progress will never settle.
                        return Err(Error::Other(
                            "script returned a promise that never settles".into(),
                        ));
                    }
                    Err(_) => return Err(Error::Other("script job failed".into())),
                }
            }
        }
    }
}

fn budget_exceeded() -> Error {
    Error::Timeout(format!(
        "script exceeded its {} ms budget",
        SCRIPT_BUDGET.as_millis()
    ))
}

fn script_err(ctx: &Ctx<'_>, e: rquickjs::Error, deadline: Instant) -> Error {
    if Instant::now() >= deadline {
        return budget_exceeded();
    }
    Error::Other(format!("script error: {}", describe_js_error(ctx, e)))
}

fn describe_js_error(ctx: &Ctx<'_>, e: rquickjs::Error) -> String {
    if matches!(e, rquickjs::Error::Exception) {
        let caught = ctx.catch();
        if let Some(obj) = caught.as_object() {
            if let Ok(message) = obj.get::<_, String>("message") {
                return message;
            }
        }
        return format!("{caught:?}");
    }
    e.to_string()
}

// ── JSON ⇄ JS conversion ───────────────────────────────────────────

fn json_to_js<'js>(ctx: &Ctx<'js>, value: &Value) -> rquickjs::Result<JsValue<'js>> {
    Ok(match value {
        Value::Null => JsValue::new_null(ctx.clone()),
        Value::Bool(b) => JsValue::new_bool(ctx.clone(), *b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64().filter(|i| i32::try_from(*i).is_ok()) {
                JsValue::new_int(ctx.clone(), i as i32)
            } else {
                JsValue::new_float(ctx.clone(), n.as_f64().unwrap_or(f64::NAN))
            }
        }
        Value::String(s) => rquickjs::String::from_str(ctx.clone(), s)?.into_value(),
        Value::Array(items) => {
            let array = rquickjs::Array::new(ctx.clone())?;
            for (i, item) in items.iter().enumerate() {
                array.set(i, json_to_js(ctx, item)?)?;
            }
            array.into_value()
        }
        Value::Object(map) => {
            let object = rquickjs::Object::new(ctx.clone())?;
            for (key, item) in map {
                object.set(key.as_str(), json_to_js(ctx, item)?)?;
            }
            object.into_value()
        }
    })
}

fn js_to_json(value: &JsValue<'_>) -> Result<Value> {
    Ok(match value.type_of() {
        Type::Undefined | Type::Null | Type::Uninitialized => Value::Null,
        Type::Bool => json!(value.as_bool().unwrap_or(false)),
        Type::Int => json!(value.as_int().unwrap_or(0)),
        Type::Float => {
            let f = value.as_float().unwrap_or(f64::NAN);
            if f.is_finite() {
                json!(f)
            } else {
                Value::Null
            }
        }
        Type::String => {
            let s: String = value
                .get()
                .map_err(|e| Error::Other(format!("script string: {e}")))?;
            json!(s)
        }
        Type::Array => {
            let array = value
                .as_array()
                .ok_or_else(|| Error::Other("script array".into()))?;
            let mut items = Vec::with_capacity(array.len());
            for item in array.iter::<JsValue>() {
                let item = item.map_err(|e| Error::Other(format!("script array: {e}")))?;
                items.push(js_to_json(&item)?);
            }
            Value::Array(items)
        }
        Type::Object => {
            let object = value
                .as_object()
                .ok_or_else(|| Error::Other("script object".into()))?;
            let mut map = serde_json::Map::new();
            for prop in object.props::<String, JsValue>() {
                let (key, item) = prop.map_err(|e| Error::Other(format!("script object: {e}")))?;
                map.insert(key, js_to_json(&item)?);
            }
            Value::Object(map)
        }
        // Functions, symbols, and other engine types have no JSON form.
        _ => Value::Null,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_numbers_round_trip() {
        let tool = ScriptTool::new("return { sum: params.a + params.b };").unwrap();
        let result = tool.call(json!({"a": 5, "b": 3})).await.unwrap();
        assert_eq!(result, json!({"sum": 8}));
    }

    #[test]
    fn syntax_errors_rejected_at_registration() {
        assert!(ScriptTool::new("return {{{").is_err());
        assert!(ScriptTool::new("this is not js").is_err());
    }

    #[tokio::test]
    async fn runtime_exceptions_surface_as_errors() {
        let tool = ScriptTool::new("throw new Error('nope');").unwrap();
        let err = tool.call(json!({})).await.unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    #[tokio::test]
    async fn infinite_loop_is_bounded_by_budget() {
        let tool = ScriptTool::new("while(true){}").unwrap();
        let started = Instant::now();
        let outcome = tool.call(json!({})).await;
        // Returns or rejects within a small multiple of the 1 s budget.
        assert!(started.elapsed() < Duration::from_secs(4));
        assert!(outcome.is_err());
    }

    #[tokio::test]
    async fn resolved_promise_is_awaited() {
        let tool = ScriptTool::new("return Promise.resolve(params.x * 2);").unwrap();
        let result = tool.call(json!({"x": 21})).await.unwrap();
        assert_eq!(result, json!(42));
    }

    #[tokio::test]
    async fn arrays_and_nested_objects_convert() {
        let tool = ScriptTool::new(
            "return { items: [1, 'two', null], nested: { ok: true } };",
        )
        .unwrap();
        let result = tool.call(json!({})).await.unwrap();
        assert_eq!(result, json!({"items": [1, "two", null], "nested": {"ok": true}}));
    }

    #[tokio::test]
    async fn undefined_return_becomes_null() {
        let tool = ScriptTool::new("params;").unwrap();
        let result = tool.call(json!({"ignored": 1})).await.unwrap();
        assert_eq!(result, Value::Null);
    }
}
