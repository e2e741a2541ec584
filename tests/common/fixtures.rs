//! Shared fixtures: scripted providers, test tools, event helpers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_stream::stream;
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use serde_json::{json, Value};

use turnloom::config::OrchestratorConfig;
use turnloom::events::{TurnEvent, TurnStream};
use turnloom::kv::{KvError, KvStore, MemoryKv};
use turnloom::orchestrator::{ChatTurnOrchestrator, TurnRequest};
use turnloom::providers::{
    ChatModel, ContextRetriever, ModelChunk, ModelError, Prompt, RetrievalError,
};
use turnloom::tools::{Tool, ToolCallRequest, ToolError, ToolRegistry, ToolSchema};

/// Model that replays a fixed script, one chunk list per generation round.
pub struct ScriptedModel {
    rounds: Mutex<VecDeque<Vec<ModelChunk>>>,
    calls: AtomicUsize,
}

impl ScriptedModel {
    pub fn new(rounds: Vec<Vec<ModelChunk>>) -> Self {
        Self {
            rounds: Mutex::new(rounds.into()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Single round of plain text, split into per-word deltas.
    pub fn text(text: &str) -> Self {
        Self::new(vec![text_round(text)])
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

pub fn text_round(text: &str) -> Vec<ModelChunk> {
    text.split_inclusive(' ')
        .map(|part| ModelChunk::TextDelta(part.to_string()))
        .collect()
}

pub fn tool_round(tool_name: &str, call_id: &str, arguments: Value) -> Vec<ModelChunk> {
    vec![ModelChunk::ToolCall(ToolCallRequest {
        call_id: call_id.to_string(),
        tool_name: tool_name.to_string(),
        arguments,
    })]
}

#[async_trait]
impl ChatModel for ScriptedModel {
    async fn stream_generate(
        &self,
        _prompt: Prompt,
        _tools: Vec<ToolSchema>,
    ) -> Result<BoxStream<'static, Result<ModelChunk, ModelError>>, ModelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let round = self
            .rounds
            .lock()
            .unwrap()
            .pop_front()
            .expect("model called more rounds than scripted");
        Ok(stream::iter(round.into_iter().map(Ok)).boxed())
    }
}

/// Model that emits one delta and then stalls, for cancellation and lock
/// contention tests.
pub struct SlowModel {
    pub stall: Duration,
}

#[async_trait]
impl ChatModel for SlowModel {
    async fn stream_generate(
        &self,
        _prompt: Prompt,
        _tools: Vec<ToolSchema>,
    ) -> Result<BoxStream<'static, Result<ModelChunk, ModelError>>, ModelError> {
        let stall = self.stall;
        Ok(stream! {
            yield Ok(ModelChunk::TextDelta("Working on it".to_string()));
            tokio::time::sleep(stall).await;
            yield Ok(ModelChunk::TextDelta(" ... done.".to_string()));
        }
        .boxed())
    }
}

/// Model whose stream fails partway through.
pub struct BrokenModel;

#[async_trait]
impl ChatModel for BrokenModel {
    async fn stream_generate(
        &self,
        _prompt: Prompt,
        _tools: Vec<ToolSchema>,
    ) -> Result<BoxStream<'static, Result<ModelChunk, ModelError>>, ModelError> {
        Ok(stream::iter(vec![
            Ok(ModelChunk::TextDelta("Let me".to_string())),
            Err(ModelError::new("upstream reset")),
        ])
        .boxed())
    }
}

/// Model whose stream fails before producing any output.
pub struct FailingModel;

#[async_trait]
impl ChatModel for FailingModel {
    async fn stream_generate(
        &self,
        _prompt: Prompt,
        _tools: Vec<ToolSchema>,
    ) -> Result<BoxStream<'static, Result<ModelChunk, ModelError>>, ModelError> {
        Ok(stream::iter(vec![Err(ModelError::new("upstream reset"))]).boxed())
    }
}

pub struct StaticRetriever {
    pub context: String,
    calls: AtomicUsize,
}

impl StaticRetriever {
    pub fn new(context: &str) -> Self {
        Self {
            context: context.to_string(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContextRetriever for StaticRetriever {
    async fn retrieve_context(&self, _user_id: &str, _query: &str) -> Result<String, RetrievalError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.context.clone())
    }
}

pub struct FailingRetriever;

#[async_trait]
impl ContextRetriever for FailingRetriever {
    async fn retrieve_context(&self, _user_id: &str, _query: &str) -> Result<String, RetrievalError> {
        Err(RetrievalError::new("vector index offline"))
    }
}

pub struct CreateStudyTaskTool {
    schema: Value,
}

impl Default for CreateStudyTaskTool {
    fn default() -> Self {
        Self {
            schema: json!({
                "type": "object",
                "properties": {
                    "title": {"type": "string"},
                    "due_date": {"type": "string"}
                },
                "required": ["title"]
            }),
        }
    }
}

#[async_trait]
impl Tool for CreateStudyTaskTool {
    fn name(&self) -> &str {
        "create_study_task"
    }
    fn description(&self) -> &str {
        "Create a study task for the user"
    }
    fn schema(&self) -> &Value {
        &self.schema
    }
    fn widget(&self) -> Option<&str> {
        Some("task_card")
    }
    async fn execute(&self, args: Value) -> Result<Value, ToolError> {
        Ok(json!({"task_id": "task-1", "title": args["title"]}))
    }
}

pub struct ExplodingTool {
    schema: Value,
}

impl Default for ExplodingTool {
    fn default() -> Self {
        Self {
            schema: json!({"type": "object", "properties": {}}),
        }
    }
}

#[async_trait]
impl Tool for ExplodingTool {
    fn name(&self) -> &str {
        "explode"
    }
    fn description(&self) -> &str {
        "Always fails"
    }
    fn schema(&self) -> &Value {
        &self.schema
    }
    async fn execute(&self, _args: Value) -> Result<Value, ToolError> {
        Err(ToolError::new("kaboom").with_suggestion("do not press the red button"))
    }
}

pub struct SleepyTool {
    schema: Value,
    pub sleep: Duration,
}

impl SleepyTool {
    pub fn new(sleep: Duration) -> Self {
        Self {
            schema: json!({"type": "object", "properties": {}}),
            sleep,
        }
    }
}

#[async_trait]
impl Tool for SleepyTool {
    fn name(&self) -> &str {
        "sleepy"
    }
    fn description(&self) -> &str {
        "Sleeps before answering"
    }
    fn schema(&self) -> &Value {
        &self.schema
    }
    async fn execute(&self, _args: Value) -> Result<Value, ToolError> {
        tokio::time::sleep(self.sleep).await;
        Ok(json!({"slept": true}))
    }
}

/// Sleeps, then flips a shared flag. Lets tests observe whether a call
/// reported as timed out still committed its side effect afterwards.
pub struct DelayedEffectTool {
    schema: Value,
    pub sleep: Duration,
    pub fired: Arc<AtomicBool>,
}

impl DelayedEffectTool {
    pub fn new(sleep: Duration) -> Self {
        Self {
            schema: json!({"type": "object", "properties": {}}),
            sleep,
            fired: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl Tool for DelayedEffectTool {
    fn name(&self) -> &str {
        "delayed_effect"
    }
    fn description(&self) -> &str {
        "Commits a side effect after a delay"
    }
    fn schema(&self) -> &Value {
        &self.schema
    }
    async fn execute(&self, _args: Value) -> Result<Value, ToolError> {
        tokio::time::sleep(self.sleep).await;
        self.fired.store(true, Ordering::SeqCst);
        Ok(json!({"fired": true}))
    }
}

pub struct PanickingTool {
    schema: Value,
}

impl Default for PanickingTool {
    fn default() -> Self {
        Self {
            schema: json!({"type": "object", "properties": {}}),
        }
    }
}

#[async_trait]
impl Tool for PanickingTool {
    fn name(&self) -> &str {
        "panics"
    }
    fn description(&self) -> &str {
        "Panics on execution"
    }
    fn schema(&self) -> &Value {
        &self.schema
    }
    async fn execute(&self, _args: Value) -> Result<Value, ToolError> {
        panic!("tool under test panicked");
    }
}

pub struct DeleteAccountTool {
    schema: Value,
}

impl Default for DeleteAccountTool {
    fn default() -> Self {
        Self {
            schema: json!({
                "type": "object",
                "properties": {"confirm_phrase": {"type": "string"}}
            }),
        }
    }
}

#[async_trait]
impl Tool for DeleteAccountTool {
    fn name(&self) -> &str {
        "delete_account"
    }
    fn description(&self) -> &str {
        "Permanently delete the user's account"
    }
    fn schema(&self) -> &Value {
        &self.schema
    }
    fn requires_confirmation(&self) -> bool {
        true
    }
    async fn execute(&self, _args: Value) -> Result<Value, ToolError> {
        Ok(json!({"deleted": true}))
    }
}

/// Fast-failing config so contention tests do not sit in backoff loops.
pub fn quick_config() -> OrchestratorConfig {
    OrchestratorConfig::default()
        .with_lock_wait(Duration::from_millis(0))
        .with_tool_timeout(Duration::from_secs(5))
}

pub fn orchestrator(
    model: Arc<dyn ChatModel>,
    retriever: Arc<dyn ContextRetriever>,
    tools: ToolRegistry,
    kv: Arc<dyn KvStore>,
    config: OrchestratorConfig,
) -> ChatTurnOrchestrator {
    ChatTurnOrchestrator::new(model, retriever, tools, kv, config)
        .expect("turn graph should compile")
}

/// Backend whose checkpoint writes always fail; everything else passes
/// through to an in-memory store.
#[derive(Default)]
pub struct NoCheckpointKv {
    inner: MemoryKv,
}

#[async_trait]
impl KvStore for NoCheckpointKv {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        self.inner.get(key).await
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), KvError> {
        if key.starts_with("checkpoint:") {
            return Err(KvError::new("checkpoint backend offline"));
        }
        self.inner.set_ex(key, value, ttl).await
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError> {
        self.inner.set_nx_ex(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        self.inner.delete(key).await
    }

    async fn delete_if_eq(&self, key: &str, expected: &str) -> Result<bool, KvError> {
        self.inner.delete_if_eq(key, expected).await
    }
}

pub fn memory_kv() -> Arc<dyn KvStore> {
    Arc::new(MemoryKv::new())
}

pub fn request(request_id: &str, session_id: &str, message: &str) -> TurnRequest {
    TurnRequest {
        request_id: request_id.to_string(),
        session_id: session_id.to_string(),
        user_id: "user-1".to_string(),
        message: message.to_string(),
    }
}

/// Drain a turn stream to completion.
pub async fn collect_events(mut stream: TurnStream) -> Vec<TurnEvent> {
    let mut events = Vec::new();
    while let Some(event) = stream.next().await {
        events.push(event);
    }
    events
}
