//! HTTP template tools: a persisted request shape with `${params.x}`
//! placeholders bound at invoke time.

use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;

use kronk_domain::{Error, Result};

use crate::registry::ToolHandler;

/// The persisted spec of an HTTP template tool.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpTemplateSpec {
    pub url: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default)]
    pub body_template: Option<Value>,
}

pub struct HttpTemplateTool {
    spec: HttpTemplateSpec,
    client: reqwest::Client,
}

impl HttpTemplateTool {
    pub fn new(spec: HttpTemplateSpec, client: reqwest::Client) -> Self {
        Self { spec, client }
    }

    /// Parse the JSON spec string persisted in the handler ref.
    pub fn from_spec(raw: &str, client: reqwest::Client) -> Result<Self> {
        let spec: HttpTemplateSpec = serde_json::from_str(raw)
            .map_err(|e| Error::invalid(format!("http tool spec: {e}")))?;
        Ok(Self::new(spec, client))
    }
}

#[async_trait::async_trait]
impl ToolHandler for HttpTemplateTool {
    async fn call(&self, args: Value) -> Result<Value> {
        let url = substitute_url(&self.spec.url, &args);
        let method = self
            .spec
            .method
            .as_deref()
            .unwrap_or("GET")
            .to_ascii_uppercase();
        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|_| Error::invalid(format!("bad HTTP method: {method}")))?;

        let mut request = self.client.request(method, &url);
        if let Some(headers) = &self.spec.headers {
            for (key, value) in headers {
                request = request.header(key, value);
            }
        }
        if let Some(template) = &self.spec.body_template {
            let body = substitute_body(template, &args);
            request = request.json(&body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        let status = response.status();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let body = response
            .text()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        if content_type.contains("application/json") {
            serde_json::from_str(&body)
                .map_err(|e| Error::Http(format!("bad JSON response: {e}")))
        } else {
            Ok(json!({
                "status": status.as_u16(),
                "statusText": status.canonical_reason().unwrap_or(""),
                "body": body,
            }))
        }
    }
}

/// Replace `${params.key}` in the URL with the percent-encoded value.
fn substitute_url(template: &str, args: &Value) -> String {
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
            out = out.replace(&placeholder, &url_encode(&raw));
        }
    }
    out
}

/// Replace placeholders inside every string value of the body template.
/// Substitution happens before serialization, so the values are JSON-
/// escaped on the wire. A string that is exactly one placeholder takes
/// the parameter's JSON value, preserving numbers and objects.
fn substitute_body(template: &Value, args: &Value) -> Value {
    match template {
        Value::String(s) => {
            if let Some(map) = args.as_object() {
                for (key, value) in map {
                    let placeholder = format!("${{params.{key}}}");
                    if s == &placeholder {
                        return value.clone();
                    }
                }
                let mut out = s.clone();
                for (key, value) in map {
                    let placeholder = format!("${{params.{key}}}");
                    let raw = match value {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    out = out.replace(&placeholder, &raw);
                }
                Value::String(out)
            } else {
                template.clone()
            }
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| substitute_body(v, args)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute_body(v, args)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// RFC 3986 unreserved characters pass through; everything else is
/// percent-encoded.
fn url_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_substitution_is_percent_encoded() {
        let url = substitute_url(
            "https://api.example.com/search?q=${params.query}",
            &json!({"query": "rust & tokio"}),
        );
        assert_eq!(url, "https://api.example.com/search?q=rust%20%26%20tokio");
    }

    #[test]
    fn body_substitution_inside_strings() {
        let body = substitute_body(
            &json!({"message": "hello ${params.name}", "count": 2}),
            &json!({"name": "it's \"me\""}),
        );
        assert_eq!(body["message"], "hello it's \"me\"");
        assert_eq!(body["count"], 2);
        // Serialization escapes the substituted quotes.
        let wire = serde_json::to_string(&body).unwrap();
        assert!(wire.contains(r#"it's \"me\""#));
    }

    #[test]
    fn exact_placeholder_preserves_json_type() {
        let body = substitute_body(
            &json!({"limit": "${params.limit}", "tags": "${params.tags}"}),
            &json!({"limit": 5, "tags": ["a", "b"]}),
        );
        assert_eq!(body["limit"], 5);
        assert_eq!(body["tags"], json!(["a", "b"]));
    }

    #[test]
    fn spec_parses_from_json_string() {
        let raw = r#"{"url": "https://x.test/${params.id}", "method": "post"}"#;
        let tool = HttpTemplateTool::from_spec(raw, reqwest::Client::new()).unwrap();
        assert_eq!(tool.spec.method.as_deref(), Some("post"));
    }

    #[test]
    fn bad_spec_is_rejected() {
        assert!(HttpTemplateTool::from_spec("not json", reqwest::Client::new()).is_err());
    }
}
