//! Tool abstractions: the [`Tool`] trait, call requests, results, and the
//! process-scoped [`ToolRegistry`].
//!
//! Tool failures are data, not errors. The executor converts every failure
//! mode into a [`ToolResult`] with `success: false`; a `ToolError` never
//! crosses into the orchestrator.

pub mod executor;

use std::sync::Arc;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use executor::ToolExecutor;

/// A callable capability the model can invoke during a turn.
///
/// `schema` is a JSON-schema object describing the arguments; the executor
/// validates calls against it before `execute` runs.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn schema(&self) -> &Value;

    /// Widget type the UI should render for a successful result, if any.
    fn widget(&self) -> Option<&str> {
        None
    }

    /// Whether the turn must pause for user approval before this tool's
    /// effect is committed.
    fn requires_confirmation(&self) -> bool {
        false
    }

    async fn execute(&self, args: Value) -> Result<Value, ToolError>;
}

/// Failure inside a tool implementation. Converted to a failed
/// [`ToolResult`] at the executor boundary.
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
#[error("tool failed: {message}")]
#[diagnostic(code(turnloom::tools::execution))]
pub struct ToolError {
    pub message: String,
    /// Actionable hint surfaced to the model so it can retry sensibly.
    pub suggestion: Option<String>,
}

impl ToolError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            suggestion: None,
        }
    }

    #[must_use]
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

/// One tool invocation requested by a generation step.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Provider-assigned id correlating the call with its result message.
    pub call_id: String,
    pub tool_name: String,
    pub arguments: Value,
}

/// Outcome of one tool call. Always produced, success or not.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    pub tool_name: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub widget: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl ToolResult {
    pub fn success(tool_name: impl Into<String>, data: Value) -> Self {
        Self {
            success: true,
            tool_name: tool_name.into(),
            data,
            widget: None,
            error: None,
            suggestion: None,
        }
    }

    pub fn failure(tool_name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            tool_name: tool_name.into(),
            data: Value::Null,
            widget: None,
            error: Some(error.into()),
            suggestion: None,
        }
    }

    #[must_use]
    pub fn with_widget(mut self, widget: impl Into<String>) -> Self {
        self.widget = Some(widget.into());
        self
    }

    #[must_use]
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

/// Immutable lookup table of tools, built once at startup.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: FxHashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool under its declared name. Last registration wins.
    #[must_use]
    pub fn register(mut self, tool: impl Tool + 'static) -> Self {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Name/description/schema triples advertised to the model.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        let mut out: Vec<ToolSchema> = self
            .tools
            .values()
            .map(|t| ToolSchema {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.schema().clone(),
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}

/// What the model sees about a tool: enough to decide to call it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}
