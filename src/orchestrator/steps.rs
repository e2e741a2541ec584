//! The four steps of a chat turn graph.
//!
//! Steps communicate through well-known context keys (the `keys` module)
//! and receive their collaborators through an explicit [`TurnServices`]
//! handle rather than closure capture.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tracing::{debug, instrument, warn};

use crate::errors::ErrorRecord;
use crate::events::TurnPhase;
use crate::graph::{Step, StepContext, StepError};
use crate::message::Message;
use crate::providers::{ChatModel, ContextRetriever, ModelChunk, Prompt};
use crate::state::{StateSnapshot, StepDelta};
use crate::tools::{ToolCallRequest, ToolExecutor, ToolRegistry, ToolResult};

/// Context keys shared between steps and the orchestrator.
pub mod keys {
    /// User id of the requester, set before the walk starts.
    pub const USER_ID: &str = "turn.user_id";
    /// Retrieved grounding text from the THINKING phase.
    pub const RETRIEVAL_CONTEXT: &str = "retrieval.context";
    /// Set when retrieval failed and the turn runs context-free.
    pub const RETRIEVAL_DEGRADED: &str = "retrieval.degraded";
    /// Tool calls requested by the latest generation, pending execution.
    pub const TOOL_CALLS: &str = "generation.tool_calls";
    /// Accumulated tool results across all ACTING rounds of the turn.
    pub const TOOL_RESULTS: &str = "tools.results";
    /// Message of a model stream failure that cut generation short after
    /// partial output. Transient: a checkpoint never carries it.
    pub const GENERATION_TRUNCATED: &str = "transient.generation.truncated";
    /// Calls held back awaiting user confirmation.
    pub const CONFIRMATION_PENDING: &str = "confirmation.pending";
    /// The user's approval decision, set by resume.
    pub const CONFIRMATION_APPROVED: &str = "confirmation.approved";
}

/// Collaborators injected into every step.
pub struct TurnServices {
    pub model: Arc<dyn ChatModel>,
    pub retriever: Arc<dyn ContextRetriever>,
    pub tools: ToolRegistry,
    pub executor: ToolExecutor,
}

fn context_str<'a>(snapshot: &'a StateSnapshot, key: &str) -> Option<&'a str> {
    snapshot.context_get(key).and_then(Value::as_str)
}

/// THINKING: fetch grounding context for the user's query.
///
/// Retrieval failure is recorded and the turn continues without context;
/// a missing knowledge base must never cost the user their answer.
pub struct AssembleContextStep {
    services: Arc<TurnServices>,
}

impl AssembleContextStep {
    pub fn new(services: Arc<TurnServices>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Step for AssembleContextStep {
    #[instrument(skip_all, fields(step = %ctx.step_name))]
    async fn run(
        &self,
        snapshot: StateSnapshot,
        ctx: StepContext,
    ) -> Result<StepDelta, StepError> {
        ctx.events.status(TurnPhase::Thinking);
        let user_id = context_str(&snapshot, keys::USER_ID).unwrap_or("anonymous");
        let query = snapshot
            .last_user_message()
            .ok_or(StepError::MissingInput {
                what: "user message",
            })?;

        match self
            .services
            .retriever
            .retrieve_context(user_id, query)
            .await
        {
            Ok(context) => {
                debug!(chars = context.len(), "retrieved context");
                Ok(StepDelta::new().with_context_entry(keys::RETRIEVAL_CONTEXT, json!(context)))
            }
            Err(err) => {
                warn!(error = %err, "retrieval failed, degrading to context-free prompt");
                Ok(StepDelta::new()
                    .with_context_entry(keys::RETRIEVAL_DEGRADED, json!(true))
                    .with_error(ErrorRecord::retrieval(err.message)))
            }
        }
    }
}

/// GENERATING: stream the model, forwarding text deltas as they arrive and
/// collecting tool-call intents for the router.
pub struct GenerateStep {
    services: Arc<TurnServices>,
}

impl GenerateStep {
    pub fn new(services: Arc<TurnServices>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Step for GenerateStep {
    #[instrument(skip_all, fields(step = %ctx.step_name))]
    async fn run(
        &self,
        snapshot: StateSnapshot,
        ctx: StepContext,
    ) -> Result<StepDelta, StepError> {
        ctx.events.status(TurnPhase::Generating);
        let prompt = Prompt {
            messages: snapshot.messages.clone(),
            retrieved_context: context_str(&snapshot, keys::RETRIEVAL_CONTEXT)
                .map(str::to_string),
        };
        let schemas = self.services.tools.schemas();

        let mut stream = self
            .services
            .model
            .stream_generate(prompt, schemas)
            .await
            .map_err(|e| StepError::Provider {
                provider: "model",
                message: e.message,
            })?;

        let mut text = String::new();
        let mut calls: Vec<ToolCallRequest> = Vec::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(ModelChunk::TextDelta(delta)) => {
                    ctx.events.token(&delta);
                    text.push_str(&delta);
                }
                Ok(ModelChunk::ToolCall(call)) => calls.push(call),
                Err(err) => {
                    // With nothing produced the turn fails outright. A late
                    // failure keeps the partial text the caller already saw
                    // and surfaces as an error notice instead.
                    if text.is_empty() {
                        return Err(StepError::Provider {
                            provider: "model",
                            message: err.message,
                        });
                    }
                    warn!(error = %err, chars = text.len(), "model stream cut short");
                    return Ok(StepDelta::new()
                        .with_message(Message::assistant(&text))
                        .with_error(ErrorRecord::step(
                            &ctx.step_name,
                            format!("model stream cut short: {}", err.message),
                        ))
                        .with_context_entry(keys::GENERATION_TRUNCATED, json!(err.message))
                        .with_context_entry(keys::TOOL_CALLS, json!([])));
                }
            }
        }
        debug!(chars = text.len(), tool_calls = calls.len(), "generation complete");

        let mut delta =
            StepDelta::new().with_context_entry(keys::TOOL_CALLS, serde_json::to_value(&calls)?);
        if !text.is_empty() {
            delta = delta.with_message(Message::assistant(&text));
        }
        Ok(delta)
    }
}

/// Router key out of the generate step: tool calls pending or not.
pub fn route_after_generate(snapshot: &StateSnapshot) -> String {
    let has_calls = snapshot
        .context_get(keys::TOOL_CALLS)
        .and_then(Value::as_array)
        .is_some_and(|calls| !calls.is_empty());
    if has_calls { "tools" } else { "end" }.to_string()
}

/// ACTING: execute the requested tool calls, or divert to approval when a
/// call needs user confirmation it does not yet have.
pub struct RunToolsStep {
    services: Arc<TurnServices>,
}

impl RunToolsStep {
    pub fn new(services: Arc<TurnServices>) -> Self {
        Self { services }
    }
}

pub const STEP_ASSEMBLE_CONTEXT: &str = "assemble_context";
pub const STEP_GENERATE: &str = "generate";
pub const STEP_RUN_TOOLS: &str = "run_tools";
pub const STEP_AWAIT_APPROVAL: &str = "await_approval";

fn pending_calls(snapshot: &StateSnapshot, key: &str) -> Result<Vec<ToolCallRequest>, StepError> {
    match snapshot.context_get(key) {
        Some(value) if !value.is_null() => Ok(serde_json::from_value(value.clone())?),
        _ => Ok(Vec::new()),
    }
}

fn accumulated_results(snapshot: &StateSnapshot) -> Result<Vec<ToolResult>, StepError> {
    match snapshot.context_get(keys::TOOL_RESULTS) {
        Some(value) if !value.is_null() => Ok(serde_json::from_value(value.clone())?),
        _ => Ok(Vec::new()),
    }
}

#[async_trait]
impl Step for RunToolsStep {
    #[instrument(skip_all, fields(step = %ctx.step_name))]
    async fn run(
        &self,
        snapshot: StateSnapshot,
        ctx: StepContext,
    ) -> Result<StepDelta, StepError> {
        ctx.events.status(TurnPhase::Acting);
        let calls = pending_calls(&snapshot, keys::TOOL_CALLS)?;
        if calls.is_empty() {
            return Err(StepError::MissingInput {
                what: "pending tool calls",
            });
        }

        let approved = snapshot
            .context_get(keys::CONFIRMATION_APPROVED)
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let needs_confirmation: Vec<&str> = calls
            .iter()
            .filter(|call| {
                self.services
                    .tools
                    .get(&call.tool_name)
                    .is_some_and(|t| t.requires_confirmation())
            })
            .map(|call| call.tool_name.as_str())
            .collect();
        if !needs_confirmation.is_empty() && !approved {
            debug!(tools = ?needs_confirmation, "holding calls for confirmation");
            return Ok(StepDelta::new()
                .with_context_entry(
                    keys::CONFIRMATION_PENDING,
                    json!({
                        "tools": needs_confirmation,
                        "calls": serde_json::to_value(&calls)?,
                    }),
                )
                .with_next_step(STEP_AWAIT_APPROVAL));
        }

        let results = self
            .services
            .executor
            .execute_all(&self.services.tools, &calls, &ctx.events)
            .await;

        let mut delta = StepDelta::new();
        for result in &results {
            delta = delta.with_message(Message::tool(&serde_json::to_string(result)?));
        }
        let mut all = accumulated_results(&snapshot)?;
        all.extend(results);
        Ok(delta
            .with_context_entry(keys::TOOL_RESULTS, serde_json::to_value(&all)?)
            .with_context_entry(keys::TOOL_CALLS, json!([]))
            .with_context_entry(keys::CONFIRMATION_PENDING, Value::Null)
            .with_context_entry(keys::CONFIRMATION_APPROVED, json!(false)))
    }
}

/// Interrupt point for tool calls that need user sign-off.
///
/// The walk pauses before this step; by the time it runs, resume has
/// written the user's decision into the context.
pub struct AwaitApprovalStep;

#[async_trait]
impl Step for AwaitApprovalStep {
    #[instrument(skip_all, fields(step = %ctx.step_name))]
    async fn run(
        &self,
        snapshot: StateSnapshot,
        ctx: StepContext,
    ) -> Result<StepDelta, StepError> {
        let approved = snapshot
            .context_get(keys::CONFIRMATION_APPROVED)
            .and_then(Value::as_bool);
        if approved == Some(true) {
            debug!("confirmation granted, re-running tools");
            return Ok(StepDelta::new().with_next_step(STEP_RUN_TOOLS));
        }

        // Declined: surface failed results for the held calls and hand the
        // conversation back to the model.
        ctx.events
            .status_detail(TurnPhase::Acting, "confirmation declined");
        let held = snapshot
            .context_get(keys::CONFIRMATION_PENDING)
            .and_then(|v| v.get("calls"))
            .cloned()
            .unwrap_or(json!([]));
        let calls: Vec<ToolCallRequest> = serde_json::from_value(held)?;

        let mut delta = StepDelta::new();
        let mut all = accumulated_results(&snapshot)?;
        for call in &calls {
            let result = ToolResult::failure(&call.tool_name, "declined by user");
            delta = delta.with_message(Message::tool(&serde_json::to_string(&result)?));
            all.push(result);
        }
        Ok(delta
            .with_context_entry(keys::TOOL_RESULTS, serde_json::to_value(&all)?)
            .with_context_entry(keys::TOOL_CALLS, json!([]))
            .with_context_entry(keys::CONFIRMATION_PENDING, Value::Null)
            .with_context_entry(keys::CONFIRMATION_APPROVED, json!(false))
            .with_next_step(STEP_ASSEMBLE_CONTEXT))
    }
}
