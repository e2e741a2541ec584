//! Graph construction and compilation.

use std::fmt;
use std::sync::Arc;

use miette::Diagnostic;
use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;

use super::walk::GraphWalk;
use super::{Step, StepKind};
use crate::state::{StateSnapshot, WorkflowState};

/// Routing function evaluated against the state after a step runs.
/// Returns a key into the router's mapping table.
pub type RouterFn = Arc<dyn Fn(&StateSnapshot) -> String + Send + Sync + 'static>;

pub(crate) struct Router {
    pub(crate) decide: RouterFn,
    pub(crate) mapping: FxHashMap<String, StepKind>,
}

/// Structural problems caught at compile time rather than mid-turn.
#[derive(Debug, Error, Diagnostic)]
pub enum GraphError {
    #[error("no entry point: add an edge from Start or call set_entry_point")]
    #[diagnostic(code(turnloom::graph::no_entry))]
    NoEntryPoint,

    #[error("edge or router references unregistered step `{name}`")]
    #[diagnostic(
        code(turnloom::graph::unknown_step),
        help("Every Custom step named in an edge or router mapping must be added with add_step.")
    )]
    UnknownStep { name: String },
}

/// Fluent builder for turn graphs.
///
/// ```
/// use turnloom::graph::{GraphBuilder, Step, StepContext, StepError, StepKind};
/// use turnloom::state::{StateSnapshot, StepDelta};
///
/// struct Noop;
///
/// #[async_trait::async_trait]
/// impl Step for Noop {
///     async fn run(&self, _: StateSnapshot, _: StepContext) -> Result<StepDelta, StepError> {
///         Ok(StepDelta::new())
///     }
/// }
///
/// let graph = GraphBuilder::new()
///     .add_step("greet", Noop)
///     .set_entry_point("greet")
///     .add_edge(StepKind::from("greet"), StepKind::End)
///     .compile(vec![])
///     .unwrap();
/// # let _ = graph;
/// ```
#[derive(Default)]
pub struct GraphBuilder {
    steps: FxHashMap<StepKind, Arc<dyn Step>>,
    edges: FxHashMap<StepKind, Vec<StepKind>>,
    routers: FxHashMap<StepKind, Router>,
}

impl GraphBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a step under `name`. Re-registering a name replaces it.
    #[must_use]
    pub fn add_step(mut self, name: &str, step: impl Step + 'static) -> Self {
        self.steps.insert(StepKind::from(name), Arc::new(step));
        self
    }

    /// Static transition taken when neither the step's delta nor a router
    /// chose a destination.
    #[must_use]
    pub fn add_edge(mut self, from: StepKind, to: StepKind) -> Self {
        self.edges.entry(from).or_default().push(to);
        self
    }

    /// Sugar for `add_edge(Start, name)`.
    #[must_use]
    pub fn set_entry_point(self, name: &str) -> Self {
        self.add_edge(StepKind::Start, StepKind::from(name))
    }

    /// Dynamic routing out of `from`: `decide(snapshot)` yields a key and
    /// the mapping names the destination. A key missing from the mapping is
    /// a runtime routing failure that stops the walk.
    #[must_use]
    pub fn add_router(
        mut self,
        from: StepKind,
        decide: RouterFn,
        mapping: impl IntoIterator<Item = (String, StepKind)>,
    ) -> Self {
        self.routers.insert(
            from,
            Router {
                decide,
                mapping: mapping.into_iter().collect(),
            },
        );
        self
    }

    /// Validate the structure and produce an executable graph.
    ///
    /// Steps in `interrupt_before` pause the walk when they become current,
    /// returning control to the caller before they run.
    pub fn compile(self, interrupt_before: Vec<StepKind>) -> Result<CompiledGraph, GraphError> {
        let entry = self
            .edges
            .get(&StepKind::Start)
            .and_then(|targets| targets.first())
            .cloned()
            .ok_or(GraphError::NoEntryPoint)?;

        let mut referenced: Vec<&StepKind> = Vec::new();
        referenced.extend(self.edges.values().flatten());
        referenced.extend(self.edges.keys());
        referenced.extend(self.routers.keys());
        referenced.extend(self.routers.values().flat_map(|r| r.mapping.values()));
        for kind in referenced {
            if let StepKind::Custom(name) = kind {
                if !self.steps.contains_key(kind) {
                    return Err(GraphError::UnknownStep { name: name.clone() });
                }
            }
        }

        Ok(CompiledGraph {
            steps: self.steps,
            edges: self.edges,
            routers: self.routers,
            interrupt_before: interrupt_before.into_iter().collect(),
            entry,
        })
    }
}

/// Validated, executable graph. Cheap to share; each turn gets its own
/// [`GraphWalk`] over it.
pub struct CompiledGraph {
    pub(crate) steps: FxHashMap<StepKind, Arc<dyn Step>>,
    pub(crate) edges: FxHashMap<StepKind, Vec<StepKind>>,
    pub(crate) routers: FxHashMap<StepKind, Router>,
    pub(crate) interrupt_before: FxHashSet<StepKind>,
    pub(crate) entry: StepKind,
}

// Step and router values hold closures, so Debug shows the topology only.
impl fmt::Debug for CompiledGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut steps: Vec<&str> = self.steps.keys().map(StepKind::name).collect();
        steps.sort_unstable();
        let mut routed: Vec<&str> = self.routers.keys().map(StepKind::name).collect();
        routed.sort_unstable();
        f.debug_struct("CompiledGraph")
            .field("steps", &steps)
            .field("edges", &self.edges)
            .field("routers", &routed)
            .field("interrupt_before", &self.interrupt_before)
            .field("entry", &self.entry)
            .finish()
    }
}

impl CompiledGraph {
    /// Begin (or restart) a walk over this graph.
    ///
    /// If `state.next_step` is set, the walk starts there instead of at the
    /// entry point, which is how checkpointed turns resume.
    #[must_use]
    pub fn walk(&self, state: WorkflowState) -> GraphWalk<'_> {
        GraphWalk::new(self, state)
    }
}
