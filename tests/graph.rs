//! Graph engine semantics: routing precedence, failure stop, interrupts,
//! and resumption from a stored position.

mod common;

use std::sync::Arc;

use async_trait::async_trait;
use turnloom::graph::{
    GraphBuilder, RouterFn, Step, StepContext, StepError, StepKind, WalkItem,
};
use turnloom::message::Message;
use turnloom::state::{FinishReason, StateSnapshot, StepDelta, WorkflowState};

/// Appends its own name as an assistant message, so tests can read the
/// execution order out of the state.
struct Record(&'static str);

#[async_trait]
impl Step for Record {
    async fn run(&self, _: StateSnapshot, _: StepContext) -> Result<StepDelta, StepError> {
        Ok(StepDelta::new().with_message(Message::assistant(self.0)))
    }
}

/// Records itself and jumps to an explicit destination.
struct Jump(&'static str, &'static str);

#[async_trait]
impl Step for Jump {
    async fn run(&self, _: StateSnapshot, _: StepContext) -> Result<StepDelta, StepError> {
        Ok(StepDelta::new()
            .with_message(Message::assistant(self.0))
            .with_next_step(self.1))
    }
}

struct Fail;

#[async_trait]
impl Step for Fail {
    async fn run(&self, _: StateSnapshot, _: StepContext) -> Result<StepDelta, StepError> {
        Err(StepError::ValidationFailed("bad input".to_string()))
    }
}

fn ran_steps(state: &WorkflowState) -> Vec<&str> {
    state.messages().iter().map(|m| m.content.as_str()).collect()
}

fn fresh() -> WorkflowState {
    WorkflowState::builder("trace-test").build()
}

#[tokio::test]
async fn walk_follows_static_edges_to_the_end() {
    let graph = GraphBuilder::new()
        .add_step("a", Record("a"))
        .add_step("b", Record("b"))
        .set_entry_point("a")
        .add_edge(StepKind::from("a"), StepKind::from("b"))
        .add_edge(StepKind::from("b"), StepKind::End)
        .compile(vec![])
        .unwrap();

    let mut walk = graph.walk(fresh());
    assert!(matches!(walk.next().await, WalkItem::Ran { step, .. } if step == "a"));
    assert!(matches!(walk.next().await, WalkItem::Ran { step, .. } if step == "b"));
    assert!(matches!(walk.next().await, WalkItem::Finished));

    let state = walk.into_state();
    assert_eq!(ran_steps(&state), vec!["a", "b"]);
    assert_eq!(state.finish_reason(), Some(FinishReason::Complete));
}

#[tokio::test]
async fn explicit_next_step_beats_static_edge() {
    let graph = GraphBuilder::new()
        .add_step("a", Jump("a", "c"))
        .add_step("b", Record("b"))
        .add_step("c", Record("c"))
        .set_entry_point("a")
        .add_edge(StepKind::from("a"), StepKind::from("b"))
        .add_edge(StepKind::from("c"), StepKind::End)
        .compile(vec![])
        .unwrap();

    let mut walk = graph.walk(fresh());
    while !matches!(walk.next().await, WalkItem::Finished) {}
    assert_eq!(ran_steps(walk.state()), vec!["a", "c"]);
}

#[tokio::test]
async fn router_beats_static_edge_when_step_is_silent() {
    let decide: RouterFn = Arc::new(|_| "right".to_string());
    let graph = GraphBuilder::new()
        .add_step("a", Record("a"))
        .add_step("left", Record("left"))
        .add_step("right", Record("right"))
        .set_entry_point("a")
        .add_edge(StepKind::from("a"), StepKind::from("left"))
        .add_router(
            StepKind::from("a"),
            decide,
            [
                ("left".to_string(), StepKind::from("left")),
                ("right".to_string(), StepKind::from("right")),
            ],
        )
        .add_edge(StepKind::from("right"), StepKind::End)
        .compile(vec![])
        .unwrap();

    let mut walk = graph.walk(fresh());
    while !matches!(walk.next().await, WalkItem::Finished) {}
    assert_eq!(ran_steps(walk.state()), vec!["a", "right"]);
}

#[tokio::test]
async fn explicit_next_step_beats_router() {
    let decide: RouterFn = Arc::new(|_| "left".to_string());
    let graph = GraphBuilder::new()
        .add_step("a", Jump("a", "right"))
        .add_step("left", Record("left"))
        .add_step("right", Record("right"))
        .set_entry_point("a")
        .add_router(
            StepKind::from("a"),
            decide,
            [
                ("left".to_string(), StepKind::from("left")),
                ("right".to_string(), StepKind::from("right")),
            ],
        )
        .add_edge(StepKind::from("right"), StepKind::End)
        .add_edge(StepKind::from("left"), StepKind::End)
        .compile(vec![])
        .unwrap();

    let mut walk = graph.walk(fresh());
    while !matches!(walk.next().await, WalkItem::Finished) {}
    assert_eq!(ran_steps(walk.state()), vec!["a", "right"]);
}

#[tokio::test]
async fn step_error_records_and_stops() {
    let graph = GraphBuilder::new()
        .add_step("a", Record("a"))
        .add_step("bad", Fail)
        .add_step("after", Record("after"))
        .set_entry_point("a")
        .add_edge(StepKind::from("a"), StepKind::from("bad"))
        .add_edge(StepKind::from("bad"), StepKind::from("after"))
        .add_edge(StepKind::from("after"), StepKind::End)
        .compile(vec![])
        .unwrap();

    let mut walk = graph.walk(fresh());
    while !matches!(walk.next().await, WalkItem::Finished) {}

    let state = walk.into_state();
    assert_eq!(ran_steps(&state), vec!["a"]);
    assert_eq!(state.finish_reason(), Some(FinishReason::Error));
    assert_eq!(state.errors().len(), 1);
    assert!(state.errors()[0].message.contains("bad input"));
}

#[tokio::test]
async fn router_unmapped_key_stops_with_error() {
    let decide: RouterFn = Arc::new(|_| "nowhere".to_string());
    let graph = GraphBuilder::new()
        .add_step("a", Record("a"))
        .add_step("b", Record("b"))
        .set_entry_point("a")
        .add_router(
            StepKind::from("a"),
            decide,
            [("b".to_string(), StepKind::from("b"))],
        )
        .add_edge(StepKind::from("b"), StepKind::End)
        .compile(vec![])
        .unwrap();

    let mut walk = graph.walk(fresh());
    while !matches!(walk.next().await, WalkItem::Finished) {}
    let state = walk.into_state();
    assert_eq!(state.finish_reason(), Some(FinishReason::Error));
    assert!(state.errors()[0].message.contains("nowhere"));
}

#[tokio::test]
async fn interrupt_before_pauses_then_continues() {
    let graph = GraphBuilder::new()
        .add_step("a", Record("a"))
        .add_step("gated", Record("gated"))
        .set_entry_point("a")
        .add_edge(StepKind::from("a"), StepKind::from("gated"))
        .add_edge(StepKind::from("gated"), StepKind::End)
        .compile(vec![StepKind::from("gated")])
        .unwrap();

    let mut walk = graph.walk(fresh());
    assert!(matches!(walk.next().await, WalkItem::Ran { step, .. } if step == "a"));
    assert!(matches!(walk.next().await, WalkItem::Paused { step } if step == "gated"));
    // The paused position is stored for checkpointing.
    assert_eq!(walk.state().next_step(), Some("gated"));
    // Pulling again runs the gated step once.
    assert!(matches!(walk.next().await, WalkItem::Ran { step, .. } if step == "gated"));
    assert!(matches!(walk.next().await, WalkItem::Finished));
    assert_eq!(ran_steps(walk.state()), vec!["a", "gated"]);
}

#[tokio::test]
async fn walk_starts_from_stored_next_step() {
    let graph = GraphBuilder::new()
        .add_step("a", Record("a"))
        .add_step("b", Record("b"))
        .set_entry_point("a")
        .add_edge(StepKind::from("a"), StepKind::from("b"))
        .add_edge(StepKind::from("b"), StepKind::End)
        .compile(vec![])
        .unwrap();

    let state = WorkflowState::builder("trace-test")
        .with_next_step("b")
        .build();
    let mut walk = graph.walk(state);
    assert!(matches!(walk.next().await, WalkItem::Ran { step, .. } if step == "b"));
    assert!(matches!(walk.next().await, WalkItem::Finished));
    assert_eq!(ran_steps(walk.state()), vec!["b"]);
}

#[tokio::test]
async fn resumed_walk_does_not_pause_again_at_its_cursor() {
    let graph = GraphBuilder::new()
        .add_step("gated", Record("gated"))
        .set_entry_point("gated")
        .add_edge(StepKind::from("gated"), StepKind::End)
        .compile(vec![StepKind::from("gated")])
        .unwrap();

    let state = WorkflowState::builder("trace-test")
        .with_next_step("gated")
        .build();
    let mut walk = graph.walk(state).resumed();
    assert!(matches!(walk.next().await, WalkItem::Ran { step, .. } if step == "gated"));
    assert!(matches!(walk.next().await, WalkItem::Finished));
}

#[tokio::test]
async fn finished_state_yields_no_more_steps() {
    let graph = GraphBuilder::new()
        .add_step("a", Record("a"))
        .set_entry_point("a")
        .add_edge(StepKind::from("a"), StepKind::End)
        .compile(vec![])
        .unwrap();

    let mut state = WorkflowState::builder("trace-test").build();
    state.finish(FinishReason::Complete);
    let mut walk = graph.walk(state);
    assert!(matches!(walk.next().await, WalkItem::Finished));
}

#[tokio::test]
async fn intermediate_state_restarts_at_the_routed_step() {
    let graph = GraphBuilder::new()
        .add_step("a", Record("a"))
        .add_step("b", Record("b"))
        .add_step("c", Record("c"))
        .set_entry_point("a")
        .add_edge(StepKind::from("a"), StepKind::from("b"))
        .add_edge(StepKind::from("b"), StepKind::from("c"))
        .add_edge(StepKind::from("c"), StepKind::End)
        .compile(vec![])
        .unwrap();

    let mut walk = graph.walk(fresh());
    assert!(matches!(walk.next().await, WalkItem::Ran { step, .. } if step == "a"));
    // Every step boundary carries its continuation, not just pauses.
    let saved = walk.state().clone();
    assert_eq!(saved.next_step(), Some("b"));
    drop(walk);

    let mut walk = graph.walk(saved);
    assert!(matches!(walk.next().await, WalkItem::Ran { step, .. } if step == "b"));
    assert!(matches!(walk.next().await, WalkItem::Ran { step, .. } if step == "c"));
    assert!(matches!(walk.next().await, WalkItem::Finished));

    let state = walk.into_state();
    assert_eq!(ran_steps(&state), vec!["a", "b", "c"]);
}

#[tokio::test]
async fn state_routed_to_the_end_resumes_as_finished() {
    let graph = GraphBuilder::new()
        .add_step("a", Record("a"))
        .set_entry_point("a")
        .add_edge(StepKind::from("a"), StepKind::End)
        .compile(vec![])
        .unwrap();

    let mut walk = graph.walk(fresh());
    assert!(matches!(walk.next().await, WalkItem::Ran { step, .. } if step == "a"));
    let saved = walk.state().clone();
    assert_eq!(saved.next_step(), Some("__end__"));
    drop(walk);

    let mut walk = graph.walk(saved);
    assert!(matches!(walk.next().await, WalkItem::Finished));
    let state = walk.into_state();
    assert_eq!(ran_steps(&state), vec!["a"]);
    assert_eq!(state.finish_reason(), Some(FinishReason::Complete));
}
