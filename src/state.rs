//! Workflow state: the single mutable unit of one chat turn.
//!
//! [`WorkflowState`] is mutated exclusively by applying [`StepDelta`] values,
//! which is how the structural invariants hold:
//!
//! - `messages` is append-only; the engine never truncates or reorders.
//! - `trace_id` is set at construction and immutable afterwards.
//! - `is_finished` is a one-way transition; no step runs after it.
//!
//! Steps receive a read-only [`StateSnapshot`] and return deltas, never the
//! state itself.

use rustc_hash::FxHashMap;
use serde_json::Value;

use crate::errors::ErrorRecord;
use crate::message::Message;

/// Context keys under this namespace are never persisted to checkpoints.
///
/// The context map is plain JSON, so serialization itself cannot fail; this
/// reserved namespace is the escape hatch for values that are only meaningful
/// inside one process (connection handles encoded as ids, scratch data).
pub const TRANSIENT_PREFIX: &str = "transient.";

/// Why a turn reached its terminal state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// The graph reached End normally.
    Complete,
    /// A step raised and the engine stopped.
    Error,
    /// The caller cancelled the turn.
    Cancelled,
}

/// The single mutable unit of execution for one conversational turn.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkflowState {
    messages: Vec<Message>,
    /// Open key-value map for retrieval results, routing decisions, tool
    /// output. Keys are namespaced strings; values are portable JSON.
    pub context: FxHashMap<String, Value>,
    next_step: Option<String>,
    errors: Vec<ErrorRecord>,
    finished: Option<FinishReason>,
    trace_id: String,
}

/// Read-only view of state handed to steps.
#[derive(Clone, Debug)]
pub struct StateSnapshot {
    pub messages: Vec<Message>,
    pub context: FxHashMap<String, Value>,
    pub next_step: Option<String>,
    pub errors: Vec<ErrorRecord>,
    pub trace_id: String,
}

impl WorkflowState {
    /// Create a fresh state for a turn, seeded with the inbound user message.
    ///
    /// The trace id correlates every log line and event for this turn.
    pub fn new_turn(user_text: &str, trace_id: impl Into<String>) -> Self {
        Self {
            messages: vec![Message::user(user_text)],
            context: FxHashMap::default(),
            next_step: None,
            errors: Vec::new(),
            finished: None,
            trace_id: trace_id.into(),
        }
    }

    /// Builder for states with richer initial content (history, context).
    pub fn builder(trace_id: impl Into<String>) -> WorkflowStateBuilder {
        WorkflowStateBuilder {
            messages: Vec::new(),
            context: FxHashMap::default(),
            next_step: None,
            errors: Vec::new(),
            trace_id: trace_id.into(),
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn errors(&self) -> &[ErrorRecord] {
        &self.errors
    }

    pub fn next_step(&self) -> Option<&str> {
        self.next_step.as_deref()
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn is_finished(&self) -> bool {
        self.finished.is_some()
    }

    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.finished
    }

    /// Take and clear the routing override.
    ///
    /// The walk consumes `next_step` when it routes, so a checkpoint written
    /// afterwards does not re-trigger the same jump on resume.
    pub(crate) fn take_next_step(&mut self) -> Option<String> {
        self.next_step.take()
    }

    pub(crate) fn set_next_step(&mut self, step: Option<String>) {
        self.next_step = step;
    }

    /// Mark the turn finished. One-way: the first reason wins.
    pub fn finish(&mut self, reason: FinishReason) {
        if self.finished.is_none() {
            self.finished = Some(reason);
        }
    }

    /// Append an error record without going through a delta.
    ///
    /// Used by the engine itself when a step raises.
    pub fn record_error(&mut self, record: ErrorRecord) {
        self.errors.push(record);
    }

    /// Apply a step's partial update.
    ///
    /// Messages and errors append; context entries merge key-wise
    /// (last-write-wins); `next_step` and `finish` overwrite/flag.
    /// Appending is the only mutation path, which keeps `messages` length
    /// monotonically non-decreasing within a turn.
    pub fn apply(&mut self, delta: StepDelta) {
        if let Some(messages) = delta.messages {
            self.messages.extend(messages);
        }
        if let Some(context) = delta.context {
            for (key, value) in context {
                self.context.insert(key, value);
            }
        }
        if let Some(errors) = delta.errors {
            self.errors.extend(errors);
        }
        if delta.next_step.is_some() {
            self.next_step = delta.next_step;
        }
        if let Some(reason) = delta.finish {
            self.finish(reason);
        }
    }

    /// Clone out a read-only snapshot for a step.
    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            messages: self.messages.clone(),
            context: self.context.clone(),
            next_step: self.next_step.clone(),
            errors: self.errors.clone(),
            trace_id: self.trace_id.clone(),
        }
    }

    /// Reassemble a state from persisted parts. Crate-internal: only the
    /// checkpoint store restores states wholesale.
    pub(crate) fn from_parts(
        messages: Vec<Message>,
        context: FxHashMap<String, Value>,
        next_step: Option<String>,
        errors: Vec<ErrorRecord>,
        finished: Option<FinishReason>,
        trace_id: String,
    ) -> Self {
        Self {
            messages,
            context,
            next_step,
            errors,
            finished,
            trace_id,
        }
    }
}

impl StateSnapshot {
    /// Convenience: latest user message content, if any.
    #[must_use]
    pub fn last_user_message(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.has_role(Message::USER))
            .map(|m| m.content.as_str())
    }

    /// Convenience: typed read of a context entry.
    #[must_use]
    pub fn context_get(&self, key: &str) -> Option<&Value> {
        self.context.get(key)
    }
}

/// Partial state update returned by a step.
///
/// All fields optional so a step touches only what it cares about. Fluent
/// `with_*` builders mirror how deltas are usually assembled.
#[derive(Clone, Debug, Default)]
pub struct StepDelta {
    pub messages: Option<Vec<Message>>,
    pub context: Option<FxHashMap<String, Value>>,
    pub errors: Option<Vec<ErrorRecord>>,
    pub next_step: Option<String>,
    pub finish: Option<FinishReason>,
}

impl StepDelta {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_messages(mut self, messages: Vec<Message>) -> Self {
        self.messages = Some(messages);
        self
    }

    #[must_use]
    pub fn with_message(mut self, message: Message) -> Self {
        self.messages.get_or_insert_with(Vec::new).push(message);
        self
    }

    #[must_use]
    pub fn with_context(mut self, context: FxHashMap<String, Value>) -> Self {
        self.context = Some(context);
        self
    }

    #[must_use]
    pub fn with_context_entry(mut self, key: &str, value: Value) -> Self {
        self.context
            .get_or_insert_with(FxHashMap::default)
            .insert(key.to_string(), value);
        self
    }

    #[must_use]
    pub fn with_errors(mut self, errors: Vec<ErrorRecord>) -> Self {
        self.errors = Some(errors);
        self
    }

    #[must_use]
    pub fn with_error(mut self, error: ErrorRecord) -> Self {
        self.errors.get_or_insert_with(Vec::new).push(error);
        self
    }

    #[must_use]
    pub fn with_next_step(mut self, step: &str) -> Self {
        self.next_step = Some(step.to_string());
        self
    }

    #[must_use]
    pub fn finished(mut self, reason: FinishReason) -> Self {
        self.finish = Some(reason);
        self
    }
}

/// Fluent constructor for states with existing history or seeded context.
#[derive(Debug, Default)]
pub struct WorkflowStateBuilder {
    messages: Vec<Message>,
    context: FxHashMap<String, Value>,
    next_step: Option<String>,
    errors: Vec<ErrorRecord>,
    trace_id: String,
}

impl WorkflowStateBuilder {
    #[must_use]
    pub fn with_user_message(mut self, content: &str) -> Self {
        self.messages.push(Message::user(content));
        self
    }

    #[must_use]
    pub fn with_assistant_message(mut self, content: &str) -> Self {
        self.messages.push(Message::assistant(content));
        self
    }

    #[must_use]
    pub fn with_system_message(mut self, content: &str) -> Self {
        self.messages.push(Message::system(content));
        self
    }

    #[must_use]
    pub fn with_message(mut self, message: Message) -> Self {
        self.messages.push(message);
        self
    }

    #[must_use]
    pub fn with_context(mut self, key: &str, value: Value) -> Self {
        self.context.insert(key.to_string(), value);
        self
    }

    #[must_use]
    pub fn with_next_step(mut self, step: &str) -> Self {
        self.next_step = Some(step.to_string());
        self
    }

    #[must_use]
    pub fn build(self) -> WorkflowState {
        WorkflowState {
            messages: self.messages,
            context: self.context,
            next_step: self.next_step,
            errors: self.errors,
            finished: None,
            trace_id: self.trace_id,
        }
    }
}
