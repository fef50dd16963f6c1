//! Tool Registry & Executor (C6).
//!
//! Handlers are registered once at process startup (insertion order
//! preserved so `ToolRegistry::specs()` is stable across calls) and
//! executed behind a bounded `tokio::sync::Semaphore` so a flood of
//! concurrent tool calls from one turn can't starve the rest of the
//! process (SPEC_FULL.md REDESIGN FLAGS: concurrency is a first-class
//! semaphore, not an incidental side effect of spawning).

use super::types::{ToolCall, ToolResult, ToolSpec};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::warn;

/// One callable tool. Handlers run on a blocking-safe async boundary;
/// CPU-bound or blocking implementations should do their own
/// `spawn_blocking` internally.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    fn spec(&self) -> ToolSpec;
    async fn call(&self, arguments: &HashMap<String, Value>) -> Result<String>;
}

/// Insertion-ordered tool registration. `register()` requires a JSON
/// Schema `{"type": "object", "properties": {...}}` shape; `required`
/// defaults to `[]` when absent (spec.md §4.6 edge case).
pub struct ToolRegistry {
    order: Vec<String>,
    handlers: HashMap<String, Arc<dyn ToolHandler>>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            order: Vec::new(),
            handlers: HashMap::new(),
        }
    }

    pub fn register(&mut self, handler: Arc<dyn ToolHandler>) -> Result<()> {
        let spec = handler.spec();
        validate_schema(&spec.json_schema_parameters)?;
        if self.handlers.contains_key(&spec.name) {
            return Err(anyhow!("tool '{}' already registered", spec.name));
        }
        self.order.push(spec.name.clone());
        self.handlers.insert(spec.name, handler);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.handlers.get(name).cloned()
    }

    /// Declarative specs in registration order, handed to the LLM adapter
    /// on every turn.
    pub fn specs(&self) -> Vec<ToolSpec> {
        self.order.iter().filter_map(|n| self.handlers.get(n)).map(|h| h.spec()).collect()
    }
}

fn validate_schema(schema: &Value) -> Result<()> {
    let obj = schema.as_object().ok_or_else(|| anyhow!("tool schema must be a JSON object"))?;
    if obj.get("type").and_then(|t| t.as_str()) != Some("object") {
        return Err(anyhow!("tool schema 'type' must be \"object\""));
    }
    if !obj.contains_key("properties") {
        return Err(anyhow!("tool schema must declare 'properties'"));
    }
    Ok(())
}

/// Runs registered tools with bounded concurrency and a per-call timeout.
/// Never propagates a handler panic or error out of `execute()` — both
/// become a failed `ToolResult` (spec.md §4.6: "A failing tool never
/// crashes the session; it produces a `ToolResult{ok:false,...}`").
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    semaphore: Arc<Semaphore>,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>, max_concurrent: usize, timeout_secs: u64) -> Self {
        Self {
            registry,
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            timeout: Duration::from_secs(timeout_secs.max(1)),
        }
    }

    /// The declarative specs of every registered tool, in registration
    /// order, handed to the LLM adapter on every turn (spec.md §4.9 step 7).
    pub fn registry_specs(&self) -> Vec<ToolSpec> {
        self.registry.specs()
    }

    /// Executes one call, waiting on the shared semaphore for a slot.
    pub async fn execute(&self, call: &ToolCall) -> ToolResult {
        let permit = match self.semaphore.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => {
                return ToolResult {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    ok: false,
                    text_or_error: "tool executor is shutting down".to_string(),
                    structured_attachment: None,
                }
            }
        };

        let Some(handler) = self.registry.get(&call.name) else {
            drop(permit);
            return ToolResult {
                id: call.id.clone(),
                name: call.name.clone(),
                ok: false,
                text_or_error: format!("unknown tool '{}'", call.name),
                structured_attachment: None,
            };
        };

        let arguments = call.arguments.clone();
        let fut = handler.call(&arguments);
        let result = match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(text)) => ToolResult {
                id: call.id.clone(),
                name: call.name.clone(),
                ok: true,
                text_or_error: text,
                structured_attachment: None,
            },
            Ok(Err(e)) => {
                warn!(tool = %call.name, error = %e, "tool call failed");
                ToolResult {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    ok: false,
                    text_or_error: e.to_string(),
                    structured_attachment: None,
                }
            }
            Err(_) => {
                warn!(tool = %call.name, "tool call timed out");
                ToolResult {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    ok: false,
                    text_or_error: format!("tool '{}' timed out after {:?}", call.name, self.timeout),
                    structured_attachment: None,
                }
            }
        };
        drop(permit);
        result
    }

    /// Runs every call concurrently (bounded by the shared semaphore) and
    /// returns results in the same order as `calls` (spec.md §4.6: tool
    /// results must be attributable back to their originating call id
    /// regardless of completion order).
    pub async fn execute_many(&self, calls: &[ToolCall]) -> Vec<ToolResult> {
        let futures = calls.iter().map(|c| self.execute(c));
        futures::future::join_all(futures).await
    }
}

// ===================== Built-in example tools =====================

/// Returns the current UTC time. Grounded on the shape of a minimal
/// zero-argument tool: empty `properties`, empty `required`.
pub struct CurrentTimeTool;

#[async_trait]
impl ToolHandler for CurrentTimeTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "current_time".to_string(),
            description: "Returns the current UTC date and time in RFC 3339 format.".to_string(),
            json_schema_parameters: serde_json::json!({
                "type": "object",
                "properties": {},
                "required": [],
            }),
            category: "utility".to_string(),
        }
    }

    async fn call(&self, _arguments: &HashMap<String, Value>) -> Result<String> {
        Ok(chrono::Utc::now().to_rfc3339())
    }
}

/// Echoes back its `text` argument. Used in tests and as a minimal
/// worked example of a tool with a required parameter.
pub struct EchoTool;

#[async_trait]
impl ToolHandler for EchoTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "echo".to_string(),
            description: "Echoes back the provided text.".to_string(),
            json_schema_parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "text": { "type": "string", "description": "Text to echo back." }
                },
                "required": ["text"],
            }),
            category: "utility".to_string(),
        }
    }

    async fn call(&self, arguments: &HashMap<String, Value>) -> Result<String> {
        let text = arguments
            .get("text")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("missing required argument 'text'"))?;
        Ok(text.to_string())
    }
}

/// Registers the built-in example tools (SPEC_FULL.md C6 supplement).
pub fn builtin_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(CurrentTimeTool)).expect("builtin tool registration cannot collide");
    registry.register(Arc::new(EchoTool)).expect("builtin tool registration cannot collide");
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SlowTool;

    #[async_trait]
    impl ToolHandler for SlowTool {
        fn spec(&self) -> ToolSpec {
            ToolSpec {
                name: "slow".to_string(),
                description: String::new(),
                json_schema_parameters: serde_json::json!({"type": "object", "properties": {}}),
                category: "test".to_string(),
            }
        }

        async fn call(&self, _arguments: &HashMap<String, Value>) -> Result<String> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok("done".to_string())
        }
    }

    struct PanicTool;

    #[async_trait]
    impl ToolHandler for PanicTool {
        fn spec(&self) -> ToolSpec {
            ToolSpec {
                name: "fails".to_string(),
                description: String::new(),
                json_schema_parameters: serde_json::json!({"type": "object", "properties": {}}),
                category: "test".to_string(),
            }
        }

        async fn call(&self, _arguments: &HashMap<String, Value>) -> Result<String> {
            Err(anyhow!("boom"))
        }
    }

    fn call(name: &str) -> ToolCall {
        ToolCall {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            arguments: HashMap::new(),
        }
    }

    #[test]
    fn schema_requires_object_type_and_properties() {
        let mut registry = ToolRegistry::new();
        struct BadTool;
        #[async_trait]
        impl ToolHandler for BadTool {
            fn spec(&self) -> ToolSpec {
                ToolSpec {
                    name: "bad".to_string(),
                    description: String::new(),
                    json_schema_parameters: serde_json::json!({"type": "string"}),
                    category: "test".to_string(),
                }
            }
            async fn call(&self, _arguments: &HashMap<String, Value>) -> Result<String> {
                Ok(String::new())
            }
        }
        assert!(registry.register(Arc::new(BadTool)).is_err());
    }

    #[tokio::test]
    async fn unknown_tool_fails_without_panicking() {
        let registry = Arc::new(builtin_registry());
        let executor = ToolExecutor::new(registry, 4, 5);
        let result = executor.execute(&call("does_not_exist")).await;
        assert!(!result.ok);
    }

    #[tokio::test]
    async fn failing_handler_becomes_failed_result_not_panic() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(PanicTool)).unwrap();
        let executor = ToolExecutor::new(Arc::new(registry), 4, 5);
        let result = executor.execute(&call("fails")).await;
        assert!(!result.ok);
        assert!(result.text_or_error.contains("boom"));
    }

    #[tokio::test]
    async fn timeout_produces_failed_result() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(SlowTool)).unwrap();
        let executor = ToolExecutor::new(Arc::new(registry), 4, 1);
        let result = executor.execute(&call("slow")).await;
        assert!(!result.ok);
        assert!(result.text_or_error.contains("timed out"));
    }

    #[tokio::test]
    async fn execute_many_preserves_input_order() {
        let registry = Arc::new(builtin_registry());
        let executor = ToolExecutor::new(registry, 4, 5);
        let mut c1 = call("echo");
        c1.arguments.insert("text".to_string(), Value::String("first".to_string()));
        let mut c2 = call("echo");
        c2.arguments.insert("text".to_string(), Value::String("second".to_string()));
        let results = executor.execute_many(&[c1, c2]).await;
        assert_eq!(results[0].text_or_error, "first");
        assert_eq!(results[1].text_or_error, "second");
    }

    #[tokio::test]
    async fn current_time_returns_rfc3339() {
        let registry = Arc::new(builtin_registry());
        let executor = ToolExecutor::new(registry, 4, 5);
        let result = executor.execute(&call("current_time")).await;
        assert!(result.ok);
        assert!(chrono::DateTime::parse_from_rfc3339(&result.text_or_error).is_ok());
    }
}
