//! Error taxonomy for turn execution.
//!
//! Two layers, deliberately kept apart:
//!
//! - [`ErrorRecord`] is *data*: a recoverable failure recorded into
//!   `WorkflowState.errors` and carried through checkpoints. Recording one
//!   never halts execution by itself.
//! - [`TurnError`] is the fatal taxonomy returned from orchestrator entry
//!   points. Only unrecoverable conditions (lock contention, model stream
//!   failure, cancellation) surface here.

use chrono::{DateTime, Utc};
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Where in the execution a recorded failure originated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum ErrorScope {
    /// A named step raised or degraded.
    Step { name: String },
    /// A single tool invocation failed.
    Tool { name: String },
    /// Retrieval collaborator failed (turn degrades, does not abort).
    Retrieval,
    /// Checkpoint persistence failed (logged, non-fatal).
    Checkpoint,
    /// Anything orchestrator-level.
    #[default]
    Orchestrator,
}

/// A non-fatal failure recorded into workflow state.
///
/// Ordered and append-only alongside messages; serialized into checkpoints so
/// a resumed turn still knows what went wrong before the crash.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ErrorRecord {
    #[serde(default = "Utc::now")]
    pub when: DateTime<Utc>,
    #[serde(default)]
    pub scope: ErrorScope,
    pub message: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub details: serde_json::Value,
}

impl ErrorRecord {
    /// Record a failure inside a named step.
    pub fn step(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            when: Utc::now(),
            scope: ErrorScope::Step { name: name.into() },
            message: message.into(),
            details: serde_json::Value::Null,
        }
    }

    /// Record a failed tool invocation.
    pub fn tool(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            when: Utc::now(),
            scope: ErrorScope::Tool { name: name.into() },
            message: message.into(),
            details: serde_json::Value::Null,
        }
    }

    /// Record a retrieval degradation.
    pub fn retrieval(message: impl Into<String>) -> Self {
        Self {
            when: Utc::now(),
            scope: ErrorScope::Retrieval,
            message: message.into(),
            details: serde_json::Value::Null,
        }
    }

    /// Record a swallowed checkpoint failure.
    pub fn checkpoint(message: impl Into<String>) -> Self {
        Self {
            when: Utc::now(),
            scope: ErrorScope::Checkpoint,
            message: message.into(),
            details: serde_json::Value::Null,
        }
    }

    /// Record an orchestrator-level failure.
    pub fn orchestrator(message: impl Into<String>) -> Self {
        Self {
            when: Utc::now(),
            scope: ErrorScope::Orchestrator,
            message: message.into(),
            details: serde_json::Value::Null,
        }
    }

    /// Attach structured detail to this record.
    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

/// Fatal errors surfaced from orchestrator entry points.
///
/// Tool failures never appear here; they are converted to
/// [`ToolResult`](crate::tools::ToolResult) data at the executor boundary.
#[derive(Debug, Error, Diagnostic)]
pub enum TurnError {
    /// Malformed inbound request; never retried automatically.
    #[error("invalid request: {0}")]
    #[diagnostic(code(turnloom::turn::validation))]
    Validation(String),

    /// Same request id re-submitted with a different payload.
    #[error("request id {request_id} was already used with a different payload")]
    #[diagnostic(
        code(turnloom::turn::idempotency_conflict),
        help("Use a fresh request id for new content; replays must resend the original payload.")
    )]
    IdempotencyConflict { request_id: String },

    /// Another turn holds the session lock; caller should back off and retry.
    #[error("turn already in progress for session {session_id}")]
    #[diagnostic(
        code(turnloom::turn::lock_contention),
        help("Retry after a short delay; the active turn releases the lock when it finishes.")
    )]
    LockContention { session_id: String },

    /// Upstream model failure with no usable partial output.
    #[error("model service error: {message}")]
    #[diagnostic(code(turnloom::turn::model))]
    Model { message: String },

    /// Checkpoint store failure escalated by an explicit resume request.
    ///
    /// During a live turn checkpoint failures are swallowed; this variant only
    /// surfaces when the caller asked to resume and there is nothing to load.
    #[error("checkpoint error for session {session_id}: {message}")]
    #[diagnostic(code(turnloom::turn::checkpoint))]
    Checkpoint { session_id: String, message: String },

    /// The turn stopped on an orchestration failure that is not the model:
    /// a misrouted graph, undecodable step data, a step contract violation.
    #[error("internal error: {message}")]
    #[diagnostic(code(turnloom::turn::internal))]
    Internal { message: String },

    /// No resumable state exists for the session.
    #[error("no paused turn found for session {session_id}")]
    #[diagnostic(code(turnloom::turn::session_not_found))]
    SessionNotFound { session_id: String },

    /// Caller-initiated cancellation; terminal, distinct from failure.
    #[error("turn cancelled")]
    #[diagnostic(code(turnloom::turn::cancelled))]
    Cancelled,
}

impl TurnError {
    /// Stable machine-readable code for wire envelopes.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            TurnError::Validation(_) => "VALIDATION",
            TurnError::IdempotencyConflict { .. } => "IDEMPOTENCY_CONFLICT",
            TurnError::LockContention { .. } => "LOCK_CONTENTION",
            TurnError::Model { .. } => "MODEL_SERVICE",
            TurnError::Checkpoint { .. } => "CHECKPOINT",
            TurnError::Internal { .. } => "INTERNAL",
            TurnError::SessionNotFound { .. } => "SESSION_NOT_FOUND",
            TurnError::Cancelled => "CANCELLED",
        }
    }

    /// Whether the caller may retry the same request later.
    #[must_use]
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            TurnError::LockContention { .. } | TurnError::Model { .. }
        )
    }
}
