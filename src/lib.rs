//! # Turnloom: Chat Turn Orchestration Engine
//!
//! Turnloom runs conversational AI turns as graph-driven workflows: a
//! generic engine of named steps over an append-only workflow state, plus a
//! chat turn orchestrator layering session locking, idempotent replay,
//! checkpoint persistence, tool execution, and streamed progress events on
//! top of it.
//!
//! ## Core Concepts
//!
//! - **Steps**: Async units of work that read a state snapshot and return a
//!   partial update
//! - **State**: Append-only message history plus an open context map,
//!   checkpointed between steps
//! - **Graph**: Declarative turn shape with static edges, routers, and
//!   interrupt points
//! - **Orchestrator**: The per-turn state machine handling locks, replay,
//!   streaming, and resumption
//!
//! ## Running a Turn
//!
//! ```no_run
//! use std::sync::Arc;
//! use turnloom::config::OrchestratorConfig;
//! use turnloom::kv::MemoryKv;
//! use turnloom::orchestrator::{ChatTurnOrchestrator, TurnRequest};
//! use turnloom::tools::ToolRegistry;
//!
//! # async fn run(model: Arc<dyn turnloom::providers::ChatModel>,
//! #              retriever: Arc<dyn turnloom::providers::ContextRetriever>)
//! #              -> miette::Result<()> {
//! let orchestrator = ChatTurnOrchestrator::new(
//!     model,
//!     retriever,
//!     ToolRegistry::new(),
//!     Arc::new(MemoryKv::new()),
//!     OrchestratorConfig::default(),
//! )?;
//!
//! let response = orchestrator
//!     .process(TurnRequest {
//!         request_id: "req-1".into(),
//!         session_id: "sess-1".into(),
//!         user_id: "user-1".into(),
//!         message: "What is 2+2?".into(),
//!     })
//!     .await?;
//! println!("{}", response.message);
//! # Ok(())
//! # }
//! ```
//!
//! Streaming callers use
//! [`process_stream`](orchestrator::ChatTurnOrchestrator::process_stream)
//! and consume [`events::TurnEvent`]s as the turn progresses.

pub mod checkpoint;
pub mod compose;
pub mod config;
pub mod errors;
pub mod events;
pub mod graph;
pub mod kv;
pub mod message;
pub mod orchestrator;
pub mod providers;
pub mod session;
pub mod state;
pub mod telemetry;
pub mod tools;
