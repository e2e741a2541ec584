//! External collaborator traits: the chat model and the context retriever.
//!
//! Both are object-safe `async_trait`s taken as `Arc<dyn ...>` so deployments
//! swap providers without touching the orchestrator. Tests use in-process
//! fakes; production backends live outside this crate.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::message::Message;
use crate::tools::{ToolCallRequest, ToolSchema};

/// Model input for one generation: conversation plus optional retrieved
/// grounding text.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prompt {
    pub messages: Vec<Message>,
    /// Retrieval output injected ahead of the conversation; `None` when the
    /// turn is running degraded.
    pub retrieved_context: Option<String>,
}

/// One increment of streamed model output.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelChunk {
    /// Partial assistant text, emitted to the caller as soon as it arrives.
    TextDelta(String),
    /// A tool the model wants invoked. Collected until the stream ends.
    ToolCall(ToolCallRequest),
}

#[derive(Debug, thiserror::Error, miette::Diagnostic)]
#[error("model: {message}")]
#[diagnostic(
    code(turnloom::providers::model),
    help("Model failures are usually transient. The turn is safe to retry.")
)]
pub struct ModelError {
    pub message: String,
}

impl ModelError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Streaming chat completion provider.
///
/// The stream is cancellable by dropping it; implementations must not hold
/// resources past that point.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn stream_generate(
        &self,
        prompt: Prompt,
        tools: Vec<ToolSchema>,
    ) -> Result<BoxStream<'static, Result<ModelChunk, ModelError>>, ModelError>;
}

#[derive(Debug, thiserror::Error, miette::Diagnostic)]
#[error("retrieval: {message}")]
#[diagnostic(code(turnloom::providers::retrieval))]
pub struct RetrievalError {
    pub message: String,
}

impl RetrievalError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Produces grounding text for a user's query. Failures degrade the turn
/// to a context-free prompt instead of aborting it.
#[async_trait]
pub trait ContextRetriever: Send + Sync {
    async fn retrieve_context(&self, user_id: &str, query: &str) -> Result<String, RetrievalError>;
}
