//! Chat turn orchestrator: drives one conversational turn through the graph
//! with session locking, idempotent replay, checkpointing, and streaming.
//!
//! Per-turn state machine: INIT leads to THINKING, then GENERATING, which
//! either finishes (DONE) or alternates with ACTING until the model stops
//! requesting tools. Failures land in FAILED, a confirmation pause in
//! INTERRUPTED, and caller cancellation in CANCELLED. Every exit path
//! releases the session lock; the lock TTL covers a crashed process.

pub mod steps;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use crate::checkpoint::CheckpointStore;
use crate::compose::{compose, TurnResponse};
use crate::config::OrchestratorConfig;
use crate::errors::{ErrorRecord, TurnError};
use crate::events::{EventEmitter, TurnEvent, TurnPhase, TurnStream};
use crate::graph::{CompiledGraph, GraphBuilder, GraphError, GraphWalk, RouterFn, StepKind, WalkItem};
use crate::kv::KvStore;
use crate::message::Message;
use crate::providers::{ChatModel, ContextRetriever};
use crate::session::{payload_hash, IdempotencyCache, SessionLockGuard, SessionLockManager};
use crate::state::{FinishReason, WorkflowState};
use crate::tools::{ToolExecutor, ToolRegistry, ToolResult};

pub use steps::{keys, TurnServices};
use steps::{
    route_after_generate, AssembleContextStep, AwaitApprovalStep, GenerateStep, RunToolsStep,
    STEP_ASSEMBLE_CONTEXT, STEP_AWAIT_APPROVAL, STEP_GENERATE, STEP_RUN_TOOLS,
};

const MAX_MESSAGE_CHARS: usize = 32_000;

/// One inbound chat request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnRequest {
    /// Caller-chosen id making the request replayable.
    pub request_id: String,
    pub session_id: String,
    pub user_id: String,
    pub message: String,
}

/// Control handle for a streaming turn.
pub struct TurnHandle {
    cancel: watch::Sender<bool>,
    task: JoinHandle<Result<TurnResponse, TurnError>>,
}

impl TurnHandle {
    /// Request graceful cancellation: in-flight model or tool work is
    /// dropped, the lock is released, the last checkpoint kept.
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }

    /// Wait for the turn's terminal result.
    pub async fn join(self) -> Result<TurnResponse, TurnError> {
        self.task.await.map_err(|_| TurnError::Cancelled)?
    }
}

/// Entry point for running chat turns.
#[derive(Clone)]
pub struct ChatTurnOrchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    graph: CompiledGraph,
    checkpoints: CheckpointStore,
    locks: SessionLockManager,
    cache: IdempotencyCache,
}

impl ChatTurnOrchestrator {
    /// Wire the turn graph and persistence layers together.
    pub fn new(
        model: Arc<dyn ChatModel>,
        retriever: Arc<dyn ContextRetriever>,
        tools: ToolRegistry,
        kv: Arc<dyn KvStore>,
        config: OrchestratorConfig,
    ) -> Result<Self, GraphError> {
        let services = Arc::new(TurnServices {
            model,
            retriever,
            tools,
            executor: ToolExecutor::new(config.tool_timeout),
        });
        let graph = build_turn_graph(&services)?;
        Ok(Self {
            inner: Arc::new(Inner {
                graph,
                checkpoints: CheckpointStore::new(Arc::clone(&kv), config.checkpoint_ttl),
                locks: SessionLockManager::new(Arc::clone(&kv), config.lock_ttl, config.lock_wait),
                cache: IdempotencyCache::new(kv, config.response_cache_ttl),
            }),
        })
    }

    /// Run a turn to completion, returning only the terminal response.
    pub async fn process(&self, request: TurnRequest) -> Result<TurnResponse, TurnError> {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let result = self
            .inner
            .run_turn(request, EventEmitter::disconnected(), cancel_rx)
            .await;
        drop(cancel_tx);
        result
    }

    /// Spawn a turn and stream its events. The handle cancels or joins it.
    pub fn process_stream(&self, request: TurnRequest) -> (TurnHandle, TurnStream) {
        let (events, stream) = EventEmitter::channel();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move { inner.run_turn(request, events, cancel_rx).await });
        (
            TurnHandle {
                cancel: cancel_tx,
                task,
            },
            stream,
        )
    }

    /// Continue a turn that paused for confirmation, carrying the user's
    /// decision.
    pub async fn resume_turn(
        &self,
        session_id: &str,
        request_id: &str,
        approved: bool,
    ) -> Result<TurnResponse, TurnError> {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let result = self
            .inner
            .resume(
                session_id,
                request_id,
                Some(approved),
                EventEmitter::disconnected(),
                cancel_rx,
            )
            .await;
        drop(cancel_tx);
        result
    }

    /// Pick up an interrupted session from its last checkpoint and run it to
    /// a terminal outcome. Unlike [`resume_turn`](Self::resume_turn) no
    /// approval decision is injected, so a turn checkpointed at a
    /// confirmation pause will pause again.
    pub async fn recover_turn(
        &self,
        session_id: &str,
        request_id: &str,
    ) -> Result<TurnResponse, TurnError> {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let result = self
            .inner
            .resume(
                session_id,
                request_id,
                None,
                EventEmitter::disconnected(),
                cancel_rx,
            )
            .await;
        drop(cancel_tx);
        result
    }
}

/// The fixed turn graph: context assembly feeds generation, generation
/// routes to tools or the end, tools feed back into context assembly, and
/// approval always pauses before running.
fn build_turn_graph(services: &Arc<TurnServices>) -> Result<CompiledGraph, GraphError> {
    let decide: RouterFn = Arc::new(route_after_generate);
    GraphBuilder::new()
        .add_step(
            STEP_ASSEMBLE_CONTEXT,
            AssembleContextStep::new(Arc::clone(services)),
        )
        .add_step(STEP_GENERATE, GenerateStep::new(Arc::clone(services)))
        .add_step(STEP_RUN_TOOLS, RunToolsStep::new(Arc::clone(services)))
        .add_step(STEP_AWAIT_APPROVAL, AwaitApprovalStep)
        .set_entry_point(STEP_ASSEMBLE_CONTEXT)
        .add_edge(
            StepKind::from(STEP_ASSEMBLE_CONTEXT),
            StepKind::from(STEP_GENERATE),
        )
        .add_router(
            StepKind::from(STEP_GENERATE),
            decide,
            [
                ("tools".to_string(), StepKind::from(STEP_RUN_TOOLS)),
                ("end".to_string(), StepKind::End),
            ],
        )
        .add_edge(
            StepKind::from(STEP_RUN_TOOLS),
            StepKind::from(STEP_ASSEMBLE_CONTEXT),
        )
        .add_edge(
            StepKind::from(STEP_AWAIT_APPROVAL),
            StepKind::from(STEP_RUN_TOOLS),
        )
        .compile(vec![StepKind::from(STEP_AWAIT_APPROVAL)])
}

enum WalkOutcome {
    Finished,
    Paused,
    Cancelled,
}

impl Inner {
    #[instrument(skip(self, events, cancel_rx, request), fields(request_id = %request.request_id, session_id = %request.session_id))]
    async fn run_turn(
        &self,
        request: TurnRequest,
        events: EventEmitter,
        cancel_rx: watch::Receiver<bool>,
    ) -> Result<TurnResponse, TurnError> {
        if let Err(err) = validate(&request) {
            emit_error(&events, &err);
            return Err(err);
        }
        events.emit(TurnEvent::Start {
            session_id: request.session_id.clone(),
            request_id: request.request_id.clone(),
        });
        events.status(TurnPhase::Init);

        let hash = payload_hash(&request.session_id, &request.user_id, &request.message);
        match self.cache.check(&request.request_id, &hash).await {
            Ok(Some(response)) => {
                info!("replaying cached response");
                events.status(TurnPhase::Done);
                events.emit(TurnEvent::Final {
                    response: response.clone(),
                });
                return Ok(response);
            }
            Ok(None) => {}
            Err(err) => {
                emit_error(&events, &err);
                return Err(err);
            }
        }

        let lock = match self
            .locks
            .acquire(&request.session_id, &request.request_id)
            .await
        {
            Ok(lock) => lock,
            Err(err) => {
                emit_error(&events, &err);
                return Err(err);
            }
        };

        let trace_id = uuid::Uuid::new_v4().to_string();
        let state = WorkflowState::builder(&trace_id)
            .with_context(keys::USER_ID, json!(request.user_id))
            .with_user_message(&request.message)
            .build();

        let walk = self.graph.walk(state).with_events(events.clone());
        self.drive(
            walk,
            lock,
            &request.session_id,
            Some((&request.request_id, &hash)),
            &events,
            cancel_rx,
        )
        .await
    }

    #[instrument(skip(self, events, cancel_rx, approval))]
    async fn resume(
        &self,
        session_id: &str,
        request_id: &str,
        approval: Option<bool>,
        events: EventEmitter,
        cancel_rx: watch::Receiver<bool>,
    ) -> Result<TurnResponse, TurnError> {
        let checkpoint = match self.checkpoints.load(session_id).await {
            Ok(Some(checkpoint)) => checkpoint,
            Ok(None) => {
                let err = TurnError::SessionNotFound {
                    session_id: session_id.to_string(),
                };
                emit_error(&events, &err);
                return Err(err);
            }
            Err(err) => {
                emit_error(&events, &err);
                return Err(err);
            }
        };
        let lock = match self.locks.acquire(session_id, request_id).await {
            Ok(lock) => lock,
            Err(err) => {
                emit_error(&events, &err);
                return Err(err);
            }
        };

        let mut state = checkpoint.state;
        if let Some(approved) = approval {
            state
                .context
                .insert(keys::CONFIRMATION_APPROVED.to_string(), json!(approved));
        }
        info!(approval = ?approval, paused_at = %checkpoint.last_step, "resuming turn");

        let mut walk = self.graph.walk(state).with_events(events.clone());
        if approval.is_some() {
            // The confirmation decision clears the pending interrupt; a bare
            // recovery leaves it armed so the pause happens again.
            walk = walk.resumed();
        }
        self.drive(walk, lock, session_id, None, &events, cancel_rx)
            .await
    }

    /// Pull the walk to an outcome, checkpointing at every step boundary.
    async fn drive(
        &self,
        mut walk: GraphWalk<'_>,
        lock: SessionLockGuard,
        session_id: &str,
        cache_entry: Option<(&str, &str)>,
        events: &EventEmitter,
        mut cancel_rx: watch::Receiver<bool>,
    ) -> Result<TurnResponse, TurnError> {
        let outcome = loop {
            tokio::select! {
                biased;
                () = cancelled(&mut cancel_rx) => break WalkOutcome::Cancelled,
                item = walk.next() => match item {
                    WalkItem::Ran { step, .. } => {
                        // Checkpointing is best-effort; a turn never fails
                        // because its save did.
                        if let Err(err) = self.checkpoints.save(session_id, walk.state(), &step).await {
                            warn!(session_id, step = %step, error = %err, "checkpoint save failed");
                            walk.state_mut()
                                .record_error(ErrorRecord::checkpoint(err.to_string()));
                        }
                    }
                    WalkItem::Paused { step } => {
                        events.status_detail(TurnPhase::AwaitingApproval, step.clone());
                        if let Err(err) = self.checkpoints.save(session_id, walk.state(), &step).await {
                            warn!(session_id, step = %step, error = %err, "checkpoint save failed");
                        }
                        break WalkOutcome::Paused;
                    }
                    WalkItem::Finished => break WalkOutcome::Finished,
                },
            }
        };
        let mut state = walk.into_state();

        match outcome {
            WalkOutcome::Cancelled => {
                info!(session_id, "turn cancelled by caller");
                state.finish(FinishReason::Cancelled);
                lock.release().await;
                events.status(TurnPhase::Cancelled);
                let err = TurnError::Cancelled;
                emit_error(events, &err);
                Err(err)
            }
            WalkOutcome::Paused => {
                lock.release().await;
                events.status(TurnPhase::Interrupted);
                let confirmation_data = state
                    .context
                    .get(keys::CONFIRMATION_PENDING)
                    .filter(|v| !v.is_null())
                    .cloned();
                let text = match assistant_text(&state) {
                    Some(text) => text,
                    None => "This action needs your confirmation before I proceed.".to_string(),
                };
                let response = compose(&text, &tool_results_of(&state), true, confirmation_data);
                events.emit(TurnEvent::Final {
                    response: response.clone(),
                });
                Ok(response)
            }
            WalkOutcome::Finished => match state.finish_reason() {
                Some(FinishReason::Error) => {
                    lock.release().await;
                    events.status(TurnPhase::Failed);
                    let err = failure_error(&state);
                    emit_error(events, &err);
                    Err(err)
                }
                _ => {
                    let text = assistant_text(&state).unwrap_or_default();
                    let mut response = compose(&text, &tool_results_of(&state), false, None);
                    if let Some(notice) = state
                        .context
                        .get(keys::GENERATION_TRUNCATED)
                        .and_then(serde_json::Value::as_str)
                    {
                        response
                            .errors
                            .push(format!("response truncated: {notice}"));
                        response.has_errors = true;
                    }
                    if let Some((request_id, hash)) = cache_entry {
                        self.cache.store(request_id, hash, &response).await;
                    }
                    if let Err(err) = self.checkpoints.clear(session_id).await {
                        warn!(session_id, error = %err, "checkpoint clear failed");
                    }
                    lock.release().await;
                    events.status(TurnPhase::Done);
                    events.emit(TurnEvent::Final {
                        response: response.clone(),
                    });
                    Ok(response)
                }
            },
        }
    }
}

/// Resolves when cancellation is signalled; pends forever once the sender
/// side is gone (an unobserved turn cannot be cancelled).
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn validate(request: &TurnRequest) -> Result<(), TurnError> {
    if request.request_id.trim().is_empty() {
        return Err(TurnError::Validation("request_id is required".to_string()));
    }
    if request.session_id.trim().is_empty() {
        return Err(TurnError::Validation("session_id is required".to_string()));
    }
    if request.user_id.trim().is_empty() {
        return Err(TurnError::Validation("user_id is required".to_string()));
    }
    if request.message.trim().is_empty() {
        return Err(TurnError::Validation("message must not be empty".to_string()));
    }
    if request.message.chars().count() > MAX_MESSAGE_CHARS {
        return Err(TurnError::Validation(format!(
            "message exceeds {MAX_MESSAGE_CHARS} characters"
        )));
    }
    Ok(())
}

/// Map a failed walk's last error record onto the wire taxonomy. Provider
/// failures stay `Model`; everything else is an orchestration fault and must
/// not masquerade as one.
fn failure_error(state: &WorkflowState) -> TurnError {
    let Some(record) = state.errors().last() else {
        return TurnError::Internal {
            message: "turn failed".to_string(),
        };
    };
    let from_model = record
        .details
        .get("provider")
        .and_then(serde_json::Value::as_str)
        == Some("model");
    if from_model {
        TurnError::Model {
            message: record.message.clone(),
        }
    } else {
        TurnError::Internal {
            message: record.message.clone(),
        }
    }
}

fn emit_error(events: &EventEmitter, err: &TurnError) {
    events.emit(TurnEvent::Error {
        code: err.code().to_string(),
        message: err.to_string(),
    });
}

fn assistant_text(state: &WorkflowState) -> Option<String> {
    state
        .messages()
        .iter()
        .rev()
        .find(|m| m.has_role(Message::ASSISTANT))
        .map(|m| m.content.clone())
}

fn tool_results_of(state: &WorkflowState) -> Vec<ToolResult> {
    state
        .context
        .get(keys::TOOL_RESULTS)
        .filter(|v| !v.is_null())
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default()
}
