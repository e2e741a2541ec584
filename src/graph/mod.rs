//! Graph engine: directed graphs of named steps over [`WorkflowState`].
//!
//! The engine is deliberately ignorant of what steps do. A [`GraphBuilder`]
//! wires [`Step`] implementations together with static edges and routers,
//! compiles into a [`CompiledGraph`], and execution happens through a
//! pull-driven [`GraphWalk`]: nothing runs until the caller asks for the
//! next item, and dropping the walk cancels whatever was in flight.
//!
//! Routing precedence after a step runs:
//! 1. the step's explicit `next_step` in its delta,
//! 2. a router registered on the step,
//! 3. the static edge.
//!
//! [`WorkflowState`]: crate::state::WorkflowState

mod builder;
mod walk;

pub use builder::{CompiledGraph, GraphBuilder, GraphError, RouterFn};
pub use walk::{GraphWalk, WalkItem};

use async_trait::async_trait;
use miette::Diagnostic;
use thiserror::Error;

use crate::events::EventEmitter;
use crate::state::{StateSnapshot, StepDelta};

/// Identifies a step position in a graph. `Start` and `End` are virtual:
/// they anchor edges but never execute.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum StepKind {
    Start,
    End,
    Custom(String),
}

impl StepKind {
    /// Stable display name, used in logs, checkpoints, and routing.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            StepKind::Start => "__start__",
            StepKind::End => "__end__",
            StepKind::Custom(name) => name,
        }
    }
}

impl From<&str> for StepKind {
    fn from(name: &str) -> Self {
        match name {
            "__start__" => StepKind::Start,
            "__end__" => StepKind::End,
            _ => StepKind::Custom(name.to_string()),
        }
    }
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A single unit of work in a turn graph.
///
/// Steps are stateless: they read a snapshot, do their work, and return a
/// [`StepDelta`]. Recoverable problems go into the delta's `errors`;
/// returning `Err` stops the walk.
#[async_trait]
pub trait Step: Send + Sync {
    async fn run(&self, snapshot: StateSnapshot, ctx: StepContext)
        -> Result<StepDelta, StepError>;
}

/// Execution context handed to a step.
#[derive(Clone, Debug)]
pub struct StepContext {
    /// Name this step was registered under.
    pub step_name: String,
    /// Emitter for progress events (tokens, tool activity, status).
    pub events: EventEmitter,
}

/// Fatal step failure. Stops the walk with `FinishReason::Error`.
#[derive(Debug, Error, Diagnostic)]
pub enum StepError {
    /// Expected data is missing from the snapshot.
    #[error("missing expected input: {what}")]
    #[diagnostic(
        code(turnloom::step::missing_input),
        help("Check that an earlier step produced the required data.")
    )]
    MissingInput { what: &'static str },

    /// External provider failure (model, retriever).
    #[error("provider error ({provider}): {message}")]
    #[diagnostic(code(turnloom::step::provider))]
    Provider {
        provider: &'static str,
        message: String,
    },

    #[error(transparent)]
    #[diagnostic(code(turnloom::step::serde_json))]
    Serde(#[from] serde_json::Error),

    #[error("validation failed: {0}")]
    #[diagnostic(code(turnloom::step::validation))]
    ValidationFailed(String),
}
