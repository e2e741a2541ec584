//! Pull-driven graph execution.
//!
//! A [`GraphWalk`] runs one step per call to [`GraphWalk::next`]. Nothing
//! executes between calls, so the caller can checkpoint, emit events, or
//! abandon the turn at every step boundary. Dropping the walk mid-await
//! cancels the in-flight step future.

use tracing::{debug, warn};

use super::builder::CompiledGraph;
use super::{StepContext, StepError, StepKind};
use crate::errors::ErrorRecord;
use crate::events::EventEmitter;
use crate::state::{FinishReason, StateSnapshot, WorkflowState};

/// What one call to [`GraphWalk::next`] produced.
#[derive(Debug)]
pub enum WalkItem {
    /// A step ran (successfully or not) and the state was updated.
    Ran {
        step: String,
        snapshot: StateSnapshot,
    },
    /// The walk reached an interrupt-before step and stopped without
    /// running it. The state's `next_step` names the paused step.
    Paused { step: String },
    /// No more steps will run.
    Finished,
}

/// Single-cursor executor over a [`CompiledGraph`].
pub struct GraphWalk<'g> {
    graph: &'g CompiledGraph,
    state: WorkflowState,
    cursor: Option<StepKind>,
    events: EventEmitter,
    /// Interrupt-before step we already paused at; running it next is allowed.
    cleared_interrupt: Option<StepKind>,
}

impl<'g> GraphWalk<'g> {
    pub(crate) fn new(graph: &'g CompiledGraph, mut state: WorkflowState) -> Self {
        let cursor = if state.is_finished() {
            None
        } else {
            match state.take_next_step() {
                Some(name) => Some(StepKind::from(name.as_str())),
                None => Some(graph.entry.clone()),
            }
        };
        Self {
            graph,
            state,
            cursor,
            events: EventEmitter::disconnected(),
            cleared_interrupt: None,
        }
    }

    /// Attach an event emitter; steps emit through it.
    #[must_use]
    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    /// Treat the current cursor's interrupt as already served. Used when
    /// resuming a turn that was checkpointed at a pause.
    #[must_use]
    pub fn resumed(mut self) -> Self {
        self.cleared_interrupt = self.cursor.clone();
        self
    }

    pub(crate) fn state_mut(&mut self) -> &mut WorkflowState {
        &mut self.state
    }

    pub fn state(&self) -> &WorkflowState {
        &self.state
    }

    pub fn into_state(self) -> WorkflowState {
        self.state
    }

    /// Run the next step, or report a pause or the end of the walk.
    pub async fn next(&mut self) -> WalkItem {
        let Some(current) = self.cursor.clone() else {
            return WalkItem::Finished;
        };

        if matches!(current, StepKind::End) {
            self.state.finish(FinishReason::Complete);
            self.cursor = None;
            return WalkItem::Finished;
        }

        if self.graph.interrupt_before.contains(&current)
            && self.cleared_interrupt.as_ref() != Some(&current)
        {
            self.cleared_interrupt = Some(current.clone());
            // Remember where to continue so a checkpoint taken now resumes here.
            self.state.set_next_step(Some(current.name().to_string()));
            return WalkItem::Paused {
                step: current.name().to_string(),
            };
        }

        // A pause left next_step pointing at this step; consume it so the
        // post-run routing does not loop back here.
        if self.state.next_step() == Some(current.name()) {
            self.state.take_next_step();
        }
        // The interrupt clearance is single-use; arriving here again pauses
        // again.
        if self.cleared_interrupt.as_ref() == Some(&current) {
            self.cleared_interrupt = None;
        }

        let Some(step) = self.graph.steps.get(&current) else {
            warn!(step = current.name(), "walk routed to unregistered step");
            self.state.record_error(ErrorRecord::orchestrator(format!(
                "routed to unregistered step `{}`",
                current.name()
            )));
            self.state.finish(FinishReason::Error);
            self.cursor = None;
            return WalkItem::Finished;
        };

        let ctx = StepContext {
            step_name: current.name().to_string(),
            events: self.events.clone(),
        };
        debug!(step = current.name(), "running step");
        match step.run(self.state.snapshot(), ctx).await {
            Ok(delta) => {
                self.state.apply(delta);
                self.cursor = if self.state.is_finished() {
                    None
                } else {
                    self.route_from(&current)
                };
                // Mirror the routed continuation into the state, so a
                // checkpoint taken at this boundary resumes here instead of
                // at the entry point.
                if let Some(next) = &self.cursor {
                    self.state.set_next_step(Some(next.name().to_string()));
                }
            }
            Err(err) => {
                warn!(step = current.name(), error = %err, "step failed");
                let mut record = ErrorRecord::step(current.name(), err.to_string());
                if let StepError::Provider { provider, .. } = &err {
                    record = record.with_details(serde_json::json!({ "provider": provider }));
                }
                self.state.record_error(record);
                self.state.finish(FinishReason::Error);
                self.cursor = None;
            }
        }
        WalkItem::Ran {
            step: current.name().to_string(),
            snapshot: self.state.snapshot(),
        }
    }

    /// Pick the next cursor: explicit `next_step`, then router, then the
    /// static edge. No destination means a clean end.
    fn route_from(&mut self, current: &StepKind) -> Option<StepKind> {
        if let Some(explicit) = self.state.take_next_step() {
            return Some(StepKind::Custom(explicit));
        }

        if let Some(router) = self.graph.routers.get(current) {
            let key = (router.decide)(&self.state.snapshot());
            return match router.mapping.get(&key) {
                Some(target) => Some(target.clone()),
                None => {
                    warn!(step = current.name(), key = %key, "router produced unmapped key");
                    self.state.record_error(ErrorRecord::orchestrator(format!(
                        "router at `{}` produced unmapped key `{key}`",
                        current.name()
                    )));
                    self.state.finish(FinishReason::Error);
                    None
                }
            };
        }

        match self
            .graph
            .edges
            .get(current)
            .and_then(|targets| targets.first())
        {
            Some(target) => Some(target.clone()),
            None => {
                self.state.finish(FinishReason::Complete);
                None
            }
        }
    }
}
