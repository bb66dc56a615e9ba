//! # Execution Engine
//!
//! Strategy selection and plan execution over the shared result store.
//!
//! ```text
//! SymbolicPlan
//!     ↓ Engine.compile_plan(plan, strategy)
//! PreparedPlan (strategy-specific, opaque)
//!     ↓ run / stream / page
//! results  (every intermediate value passing through the result store)
//! ```
//!
//! The engine never interprets NodeSpecs itself; the selected strategy
//! drives the shared [`Evaluator`]. `run` surfaces goal effects in
//! declaration order; `stream` and `page` are pure readers and trigger no
//! goal side effects.

mod deferred;
mod evaluator;
mod strict;

pub use deferred::DeferredStrategy;
pub use evaluator::Evaluator;
pub use strict::StrictStrategy;

use crate::ir::{GoalOperation, GoalSpec, NodeId, SymbolicPlan};
use crate::primitives::PrimitiveRegistry;
use crate::store::MaterializationStore;
use crate::value::VoxValue;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Execution errors. Reducer errors surface through [`crate::reducer`];
/// these are runtime-side.
#[derive(Error, Debug)]
pub enum ExecError {
    #[error("kernel failed at node {node_id}: {message}")]
    Kernel { node_id: String, message: String },

    #[error("node {node_id} failed: {message}")]
    NodeFailed { node_id: String, message: String },

    #[error("no node {0} in plan")]
    MissingNode(NodeId),

    #[error("node {0} does not produce a sequence")]
    NotASequence(NodeId),

    #[error("execution cancelled")]
    Cancelled,

    #[error(transparent)]
    Store(#[from] crate::store::StoreError),

    #[error(transparent)]
    Value(#[from] crate::value::ValueError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ExecResult<T> = Result<T, ExecError>;

/// Per-run cache accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheSummary {
    pub computed: u64,
    pub cached_store: u64,
    pub failed: u64,
}

/// Per-node progress event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Cached,
    Computed,
    Failed,
}

impl NodeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeStatus::Cached => "cached",
            NodeStatus::Computed => "computed",
            NodeStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeEvent {
    pub node_id: NodeId,
    pub status: NodeStatus,
    pub message: Option<String>,
}

/// A goal that could not be materialized.
#[derive(Debug, Clone)]
pub struct GoalFailure {
    pub goal: GoalSpec,
    pub error: String,
}

/// Outcome of a `run`/`execute_workplan` call. Runtime failures are
/// reported here; the call itself returns normally.
#[derive(Debug, Clone, Default)]
pub struct ExecutionResult {
    pub success: bool,
    pub failures: Vec<GoalFailure>,
    pub cache_summary: CacheSummary,
    pub node_events: Vec<NodeEvent>,
}

/// One page of a sequence output.
#[derive(Debug, Clone, PartialEq)]
pub struct PageResult {
    pub items: Vec<VoxValue>,
    pub has_more: bool,
}

/// Strategy selector. `dask` is accepted as a backwards-compatible alias
/// of `deferred`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    Strict,
    #[default]
    Deferred,
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "strict" => Ok(Strategy::Strict),
            "deferred" | "dask" => Ok(Strategy::Deferred),
            other => Err(format!("unknown strategy '{other}'")),
        }
    }
}

impl Strategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Strategy::Strict => "strict",
            Strategy::Deferred => "deferred",
        }
    }
}

/// Strategy-specific compiled plan. Opaque to callers.
pub struct PreparedPlan {
    pub(crate) plan: Arc<SymbolicPlan>,
    pub(crate) evaluator: Arc<Evaluator>,
    pub(crate) strategy: Strategy,
}

impl PreparedPlan {
    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn goals(&self) -> &[GoalSpec] {
        &self.plan.goals
    }
}

/// Execution strategy contract: compile a symbolic plan, then run, stream
/// or page it.
pub trait ExecutionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn compile(
        &self,
        plan: &SymbolicPlan,
        registry: Arc<PrimitiveRegistry>,
        store: Arc<MaterializationStore>,
        cancel: Arc<AtomicBool>,
    ) -> PreparedPlan;

    /// Run compiled goals (all of them, or a selected subset).
    fn run(&self, prepared: &PreparedPlan, goals: Option<&[NodeId]>) -> ExecutionResult;

    /// Stream a sequence node in chunks. Pure reader: no goal effects.
    fn stream(
        &self,
        prepared: &PreparedPlan,
        node: &str,
        chunk_size: usize,
    ) -> ExecResult<StreamChunks>;

    /// Page a node's output. Scalars page as a single-item first page.
    fn page(
        &self,
        prepared: &PreparedPlan,
        node: &str,
        offset: usize,
        limit: usize,
    ) -> ExecResult<PageResult>;
}

/// Owned chunk iterator over a sequence value. Each chunk re-enters the
/// producer at its offset, so cached partitions are reused on restart.
pub struct StreamChunks {
    sequence: crate::value::SequenceValue,
    offset: usize,
    chunk_size: usize,
    done: bool,
}

impl Iterator for StreamChunks {
    type Item = ExecResult<Vec<VoxValue>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.sequence.page(self.offset, self.chunk_size) {
            Ok((items, has_more)) => {
                if items.is_empty() {
                    self.done = true;
                    return None;
                }
                self.offset += items.len();
                if !has_more {
                    self.done = true;
                }
                Some(Ok(items))
            }
            Err(err) => {
                self.done = true;
                Some(Err(ExecError::Value(err)))
            }
        }
    }
}

// ============================================================================
// Shared strategy plumbing
// ============================================================================

/// Materialize goals in declaration order over an evaluator. Both
/// strategies share this; they differ in how node evaluation is driven
/// before/while goals are surfaced.
pub(crate) fn surface_goals(
    prepared: &PreparedPlan,
    goals: Option<&[NodeId]>,
) -> ExecutionResult {
    let evaluator = &prepared.evaluator;
    let mut failures = Vec::new();

    for goal in &prepared.plan.goals {
        if let Some(filter) = goals {
            if !filter.contains(&goal.id) {
                continue;
            }
        }
        if evaluator.is_cancelled() {
            failures.push(GoalFailure {
                goal: goal.clone(),
                error: ExecError::Cancelled.to_string(),
            });
            continue;
        }
        match evaluator.evaluate(&goal.id) {
            Ok(value) => {
                if let Err(err) = surface_goal(evaluator, goal, &value) {
                    failures.push(GoalFailure {
                        goal: goal.clone(),
                        error: err.to_string(),
                    });
                }
            }
            Err(err) => failures.push(GoalFailure {
                goal: goal.clone(),
                error: err.to_string(),
            }),
        }
    }

    if evaluator.is_cancelled() {
        evaluator.cancelled_cleanup();
    }
    evaluator
        .store()
        .flush(std::time::Duration::from_secs(30));

    let (cache_summary, node_events) = evaluator.take_run_report();
    ExecutionResult {
        success: failures.is_empty(),
        failures,
        cache_summary,
        node_events,
    }
}

fn surface_goal(
    evaluator: &Arc<Evaluator>,
    goal: &GoalSpec,
    value: &VoxValue,
) -> ExecResult<()> {
    match goal.operation {
        GoalOperation::Print => {
            // Sequences print a one-line header without iterating.
            println!("{}={}", goal.name, value.render());
            Ok(())
        }
        GoalOperation::Save => save_goal(evaluator, goal, value),
    }
}

/// Save: serialise the value to the goal's path. Sequences iterate into a
/// JSON array, persisting their element records and parent envelope along
/// the way; the file is rewritten on every run from the cached value.
fn save_goal(
    evaluator: &Arc<Evaluator>,
    goal: &GoalSpec,
    value: &VoxValue,
) -> ExecResult<()> {
    if let Some(parent) = std::path::Path::new(&goal.name).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    match value {
        VoxValue::Sequence(sequence) => {
            let items = evaluator.store().put_sequence(&goal.id, sequence)?;
            let json_items: Vec<serde_json::Value> = items
                .iter()
                .map(|item| item.as_literal_json().unwrap_or(serde_json::Value::Null))
                .collect();
            let rendered = serde_json::to_string(&json_items)
                .map_err(|err| ExecError::NodeFailed {
                    node_id: goal.id.clone(),
                    message: err.to_string(),
                })?;
            std::fs::write(&goal.name, rendered)?;
        }
        VoxValue::Bytes(data) => {
            std::fs::write(&goal.name, data)?;
        }
        other => {
            let literal = other
                .as_literal_json()
                .ok_or_else(|| ExecError::NodeFailed {
                    node_id: goal.id.clone(),
                    message: format!("cannot serialise {} to {}", other.vox_type(), goal.name),
                })?;
            let rendered =
                serde_json::to_string(&literal).map_err(|err| ExecError::NodeFailed {
                    node_id: goal.id.clone(),
                    message: err.to_string(),
                })?;
            std::fs::write(&goal.name, rendered)?;
        }
    }
    tracing::info!(path = %goal.name, "saved goal output");
    Ok(())
}

/// Shared page implementation: sequences page lazily, scalars page as a
/// single-element first page.
pub(crate) fn page_node(
    prepared: &PreparedPlan,
    node: &str,
    offset: usize,
    limit: usize,
) -> ExecResult<PageResult> {
    let value = prepared.evaluator.evaluate(node)?;
    match value {
        VoxValue::Sequence(sequence) => {
            let (items, has_more) = sequence.page(offset, limit)?;
            Ok(PageResult { items, has_more })
        }
        other => Ok(PageResult {
            items: if offset == 0 && limit > 0 {
                vec![other]
            } else {
                vec![]
            },
            has_more: false,
        }),
    }
}

/// Shared stream implementation.
pub(crate) fn stream_node(
    prepared: &PreparedPlan,
    node: &str,
    chunk_size: usize,
) -> ExecResult<StreamChunks> {
    let value = prepared.evaluator.evaluate(node)?;
    match value {
        VoxValue::Sequence(sequence) => Ok(StreamChunks {
            sequence,
            offset: 0,
            chunk_size: chunk_size.max(1),
            done: false,
        }),
        _ => Err(ExecError::NotASequence(node.to_string())),
    }
}

// ============================================================================
// Engine façade
// ============================================================================

/// Selects the strategy, injects the shared result store and registry, and
/// exposes the execution surface.
pub struct ExecutionEngine {
    registry: Arc<PrimitiveRegistry>,
    store: Arc<MaterializationStore>,
    workers: usize,
    cancel: Arc<AtomicBool>,
}

impl ExecutionEngine {
    /// Engine over an explicit store and registry. `workers = 0` means all
    /// available cores for the deferred strategy.
    pub fn new(
        registry: Arc<PrimitiveRegistry>,
        store: Arc<MaterializationStore>,
        workers: usize,
    ) -> Self {
        ExecutionEngine {
            registry,
            store,
            workers,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Ephemeral engine over an in-memory store, for tests and REPL
    /// sessions without a configured database.
    pub fn in_memory() -> crate::store::StoreResult<Self> {
        let backend = crate::store::SqliteResultsDatabase::in_memory()?;
        Ok(Self::new(
            Arc::new(PrimitiveRegistry::new()),
            MaterializationStore::new(backend),
            0,
        ))
    }

    pub fn registry(&self) -> &Arc<PrimitiveRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<MaterializationStore> {
        &self.store
    }

    /// Request cooperative cancellation: in-flight kernels finish, pending
    /// work is dropped.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    /// Re-arm the engine after a cancellation.
    pub fn reset_cancel(&self) {
        self.cancel.store(false, Ordering::Relaxed);
    }

    fn strategy_impl(&self, strategy: Strategy) -> Box<dyn ExecutionStrategy> {
        match strategy {
            Strategy::Strict => Box::new(StrictStrategy::new()),
            Strategy::Deferred => Box::new(DeferredStrategy::new(self.workers)),
        }
    }

    /// Compile a symbolic plan for a strategy.
    pub fn compile_plan(&self, plan: &SymbolicPlan, strategy: Strategy) -> PreparedPlan {
        self.strategy_impl(strategy).compile(
            plan,
            Arc::clone(&self.registry),
            Arc::clone(&self.store),
            Arc::clone(&self.cancel),
        )
    }

    /// Run a prepared plan's goals.
    pub fn run(&self, prepared: &PreparedPlan) -> ExecutionResult {
        self.strategy_impl(prepared.strategy).run(prepared, None)
    }

    /// Compile and run in one step.
    pub fn execute_workplan(&self, plan: &SymbolicPlan, strategy: Strategy) -> ExecutionResult {
        let prepared = self.compile_plan(plan, strategy);
        self.run(&prepared)
    }

    /// Evaluate a single node of a prepared plan to its runtime value.
    pub fn evaluate_node(&self, prepared: &PreparedPlan, node: &str) -> ExecResult<VoxValue> {
        prepared.evaluator.evaluate(node)
    }

    /// Stream a sequence node in chunks (pure reader).
    pub fn stream(
        &self,
        prepared: &PreparedPlan,
        node: &str,
        chunk_size: usize,
    ) -> ExecResult<StreamChunks> {
        self.strategy_impl(prepared.strategy)
            .stream(prepared, node, chunk_size)
    }

    /// Page a node's output (pure reader).
    pub fn page(
        &self,
        prepared: &PreparedPlan,
        node: &str,
        offset: usize,
        limit: usize,
    ) -> ExecResult<PageResult> {
        self.strategy_impl(prepared.strategy)
            .page(prepared, node, offset, limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_parse_accepts_dask_alias() {
        assert_eq!("strict".parse::<Strategy>(), Ok(Strategy::Strict));
        assert_eq!("deferred".parse::<Strategy>(), Ok(Strategy::Deferred));
        assert_eq!("dask".parse::<Strategy>(), Ok(Strategy::Deferred));
        assert!("eager".parse::<Strategy>().is_err());
    }

    #[test]
    fn test_node_status_strings() {
        assert_eq!(NodeStatus::Cached.as_str(), "cached");
        assert_eq!(NodeStatus::Computed.as_str(), "computed");
        assert_eq!(NodeStatus::Failed.as_str(), "failed");
    }
}
