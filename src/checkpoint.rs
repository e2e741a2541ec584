//! Checkpoint persistence: serialize workflow state between steps so a turn
//! survives process restarts and can resume where it stopped.
//!
//! Storage format is decoupled from the runtime types through `Persisted*`
//! mirror structs with `From`/`TryFrom` conversions, so the runtime state can
//! evolve without silently changing what is on disk.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::errors::{ErrorRecord, TurnError};
use crate::kv::KvStore;
use crate::message::Message;
use crate::state::{FinishReason, WorkflowState, TRANSIENT_PREFIX};

pub const CHECKPOINT_KEY_PREFIX: &str = "checkpoint:";

/// A saved position in a turn: the state plus where the walk stopped.
#[derive(Clone, Debug)]
pub struct Checkpoint {
    pub session_id: String,
    pub state: WorkflowState,
    /// Name of the last step that ran before this checkpoint was written.
    pub last_step: String,
    pub saved_at: DateTime<Utc>,
}

/// Wire form of [`Checkpoint`]. Field names here are the storage contract.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedCheckpoint {
    version: u32,
    session_id: String,
    last_step: String,
    saved_at: DateTime<Utc>,
    state: PersistedState,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedState {
    messages: Vec<Message>,
    context: FxHashMap<String, Value>,
    #[serde(default)]
    next_step: Option<String>,
    #[serde(default)]
    errors: Vec<ErrorRecord>,
    #[serde(default)]
    finished: Option<FinishReason>,
    trace_id: String,
}

const FORMAT_VERSION: u32 = 1;

impl From<&Checkpoint> for PersistedCheckpoint {
    fn from(cp: &Checkpoint) -> Self {
        // Keys under the transient namespace never leave the process.
        let context = cp
            .state
            .context
            .iter()
            .filter(|(k, _)| !k.starts_with(TRANSIENT_PREFIX))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Self {
            version: FORMAT_VERSION,
            session_id: cp.session_id.clone(),
            last_step: cp.last_step.clone(),
            saved_at: cp.saved_at,
            state: PersistedState {
                messages: cp.state.messages().to_vec(),
                context,
                next_step: cp.state.next_step().map(str::to_string),
                errors: cp.state.errors().to_vec(),
                finished: cp.state.finish_reason(),
                trace_id: cp.state.trace_id().to_string(),
            },
        }
    }
}

impl From<PersistedCheckpoint> for Checkpoint {
    fn from(p: PersistedCheckpoint) -> Self {
        let state = WorkflowState::from_parts(
            p.state.messages,
            p.state.context,
            p.state.next_step,
            p.state.errors,
            p.state.finished,
            p.state.trace_id,
        );
        Self {
            session_id: p.session_id,
            state,
            last_step: p.last_step,
            saved_at: p.saved_at,
        }
    }
}

/// Saves and restores [`Checkpoint`]s through a [`KvStore`].
#[derive(Clone)]
pub struct CheckpointStore {
    kv: Arc<dyn KvStore>,
    ttl: Duration,
}

impl CheckpointStore {
    pub fn new(kv: Arc<dyn KvStore>, ttl: Duration) -> Self {
        Self { kv, ttl }
    }

    fn key(session_id: &str) -> String {
        format!("{CHECKPOINT_KEY_PREFIX}{session_id}")
    }

    /// Persist the state after a step. Overwrites the previous checkpoint
    /// for the session and refreshes its TTL.
    #[instrument(skip(self, state))]
    pub async fn save(
        &self,
        session_id: &str,
        state: &WorkflowState,
        last_step: &str,
    ) -> Result<(), TurnError> {
        let cp = Checkpoint {
            session_id: session_id.to_string(),
            state: state.clone(),
            last_step: last_step.to_string(),
            saved_at: Utc::now(),
        };
        let persisted = PersistedCheckpoint::from(&cp);
        let body = serde_json::to_string(&persisted).map_err(|e| TurnError::Checkpoint {
            session_id: session_id.to_string(),
            message: format!("encode: {e}"),
        })?;
        self.kv
            .set_ex(&Self::key(session_id), &body, self.ttl)
            .await
            .map_err(|e| TurnError::Checkpoint {
                session_id: session_id.to_string(),
                message: e.message,
            })?;
        debug!(
            session_id,
            last_step,
            messages = cp.state.messages().len(),
            "checkpoint saved"
        );
        Ok(())
    }

    /// Load the latest checkpoint for a session, if one exists and has not
    /// expired.
    #[instrument(skip(self))]
    pub async fn load(&self, session_id: &str) -> Result<Option<Checkpoint>, TurnError> {
        let body = self
            .kv
            .get(&Self::key(session_id))
            .await
            .map_err(|e| TurnError::Checkpoint {
                session_id: session_id.to_string(),
                message: e.message,
            })?;
        let Some(body) = body else {
            return Ok(None);
        };
        // Resuming must never fail on bad persisted bytes; a checkpoint we
        // cannot decode is treated the same as one that never existed.
        let persisted: PersistedCheckpoint = match serde_json::from_str(&body) {
            Ok(persisted) => persisted,
            Err(e) => {
                warn!(session_id, error = %e, "malformed checkpoint, discarding");
                return Ok(None);
            }
        };
        if persisted.version != FORMAT_VERSION {
            warn!(
                session_id,
                found = persisted.version,
                expected = FORMAT_VERSION,
                "checkpoint version mismatch, discarding"
            );
            return Ok(None);
        }
        Ok(Some(Checkpoint::from(persisted)))
    }

    /// Drop a session's checkpoint, usually after a turn completes cleanly.
    pub async fn clear(&self, session_id: &str) -> Result<(), TurnError> {
        self.kv
            .delete(&Self::key(session_id))
            .await
            .map_err(|e| TurnError::Checkpoint {
                session_id: session_id.to_string(),
                message: e.message,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use crate::state::StepDelta;
    use serde_json::json;

    fn store() -> CheckpointStore {
        CheckpointStore::new(Arc::new(MemoryKv::new()), Duration::from_secs(60))
    }

    #[tokio::test]
    async fn save_and_load_round_trip() {
        let store = store();
        let mut state = WorkflowState::new_turn("hello", "trace-9");
        state.apply(
            StepDelta::new()
                .with_message(Message::assistant("hi"))
                .with_context_entry("route", json!("generate")),
        );
        store.save("s1", &state, "assemble_context").await.unwrap();

        let cp = store.load("s1").await.unwrap().unwrap();
        assert_eq!(cp.last_step, "assemble_context");
        assert_eq!(cp.state.messages().len(), 2);
        assert_eq!(cp.state.trace_id(), "trace-9");
        assert_eq!(cp.state.context.get("route"), Some(&json!("generate")));
    }

    #[tokio::test]
    async fn transient_context_is_not_persisted() {
        let store = store();
        let mut state = WorkflowState::new_turn("x", "t");
        state.apply(
            StepDelta::new()
                .with_context_entry("transient.scratch", json!(42))
                .with_context_entry("kept", json!(true)),
        );
        store.save("s1", &state, "generate").await.unwrap();

        let cp = store.load("s1").await.unwrap().unwrap();
        assert!(!cp.state.context.contains_key("transient.scratch"));
        assert_eq!(cp.state.context.get("kept"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn load_missing_session_is_none() {
        let store = store();
        assert!(store.load("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn clear_removes_checkpoint() {
        let store = store();
        let state = WorkflowState::new_turn("x", "t");
        store.save("s1", &state, "generate").await.unwrap();
        store.clear("s1").await.unwrap();
        assert!(store.load("s1").await.unwrap().is_none());
    }
}
