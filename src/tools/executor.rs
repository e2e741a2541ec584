//! Schema-validated, concurrent tool execution.
//!
//! The executor turns every failure mode into a failed [`ToolResult`]:
//! unknown tool, schema violation, tool error, timeout, panic. Calls within
//! one batch run concurrently and results come back in call order.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use super::{ToolCallRequest, ToolRegistry, ToolResult};
use crate::events::{EventEmitter, TurnEvent};

/// Runs the tool calls requested by one generation step.
#[derive(Clone, Debug)]
pub struct ToolExecutor {
    call_timeout: Duration,
}

impl Default for ToolExecutor {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
        }
    }
}

impl ToolExecutor {
    #[must_use]
    pub fn new(call_timeout: Duration) -> Self {
        Self { call_timeout }
    }

    /// Execute a batch of calls concurrently, in result order matching call
    /// order. Never returns an error: every outcome is a [`ToolResult`].
    #[instrument(skip_all, fields(calls = calls.len()))]
    pub async fn execute_all(
        &self,
        registry: &ToolRegistry,
        calls: &[ToolCallRequest],
        events: &EventEmitter,
    ) -> Vec<ToolResult> {
        let futures = calls
            .iter()
            .map(|call| self.execute_one(registry, call.clone(), events.clone()));
        join_all(futures).await
    }

    async fn execute_one(
        &self,
        registry: &ToolRegistry,
        call: ToolCallRequest,
        events: EventEmitter,
    ) -> ToolResult {
        let Some(tool) = registry.get(&call.tool_name) else {
            warn!(tool = %call.tool_name, "unknown tool requested");
            return ToolResult::failure(&call.tool_name, "unknown tool")
                .with_suggestion("use one of the advertised tools");
        };
        let tool = Arc::clone(tool);

        if let Err(message) = validate_args(tool.schema(), &call.arguments) {
            debug!(tool = %call.tool_name, message = %message, "argument validation failed");
            return ToolResult::failure(&call.tool_name, message)
                .with_suggestion("fix the arguments to match the tool schema");
        }

        events.emit(TurnEvent::ToolStart {
            tool_name: call.tool_name.clone(),
            call_id: call.call_id.clone(),
        });

        let widget = tool.widget().map(str::to_string);
        let args = call.arguments.clone();
        // Spawned so a panicking tool cannot take the turn down with it.
        let mut handle = tokio::spawn(async move { tool.execute(args).await });
        let result = match tokio::time::timeout(self.call_timeout, &mut handle).await {
            Ok(Ok(Ok(data))) => {
                let mut result = ToolResult::success(&call.tool_name, data);
                if let Some(widget) = widget {
                    result = result.with_widget(widget);
                }
                result
            }
            Ok(Ok(Err(err))) => {
                let mut result = ToolResult::failure(&call.tool_name, err.message);
                if let Some(suggestion) = err.suggestion {
                    result = result.with_suggestion(suggestion);
                }
                result
            }
            Ok(Err(join_err)) => {
                warn!(tool = %call.tool_name, error = %join_err, "tool task panicked");
                ToolResult::failure(&call.tool_name, "tool crashed")
            }
            Err(_) => {
                // A call reported as timed out must not commit its side
                // effects later.
                handle.abort();
                warn!(tool = %call.tool_name, timeout = ?self.call_timeout, "tool timed out");
                ToolResult::failure(
                    &call.tool_name,
                    format!("timed out after {}s", self.call_timeout.as_secs()),
                )
                .with_suggestion("retry with a narrower request")
            }
        };

        events.emit(TurnEvent::ToolEnd {
            tool_name: call.tool_name.clone(),
            call_id: call.call_id,
            success: result.success,
        });
        result
    }
}

/// Check `args` against a JSON-schema object: overall type, required keys,
/// and per-property primitive types. Returns a human-readable violation.
fn validate_args(schema: &Value, args: &Value) -> Result<(), String> {
    if schema.get("type").and_then(Value::as_str) == Some("object") && !args.is_object() {
        return Err("arguments must be an object".to_string());
    }

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for field in required.iter().filter_map(Value::as_str) {
            if args.get(field).is_none() {
                return Err(format!("missing required argument `{field}`"));
            }
        }
    }

    if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
        for (name, prop) in properties {
            let Some(value) = args.get(name) else {
                continue;
            };
            let Some(expected) = prop.get("type").and_then(Value::as_str) else {
                continue;
            };
            if !type_matches(expected, value) {
                return Err(format!("argument `{name}` must be of type {expected}"));
            }
        }
    }

    Ok(())
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        // Unknown schema types are not enforced.
        _ => true,
    }
}
