//! Strict strategy: eager single-threaded topological execution.

use super::{
    page_node, stream_node, surface_goals, ExecResult, ExecutionResult, ExecutionStrategy,
    Evaluator, PageResult, PreparedPlan, Strategy, StreamChunks,
};
use crate::ir::{NodeId, SymbolicPlan};
use crate::primitives::PrimitiveRegistry;
use crate::store::MaterializationStore;
use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// Depth-first, single-threaded evaluation over the goal-reachable
/// subgraph, in topological order. A node failure aborts its dependents;
/// independent goals continue.
#[derive(Debug, Default)]
pub struct StrictStrategy;

impl StrictStrategy {
    pub fn new() -> Self {
        StrictStrategy
    }

    /// Topological order (operands first) of nodes reachable from the
    /// goal set.
    fn topological_order(plan: &SymbolicPlan, goals: Option<&[NodeId]>) -> Vec<NodeId> {
        let roots: Vec<NodeId> = match goals {
            Some(filter) => filter.to_vec(),
            None => plan.goals.iter().map(|goal| goal.id.clone()).collect(),
        };

        let mut order = Vec::new();
        let mut visited = HashSet::new();
        // Iterative DFS with an explicit expand/emit stack.
        let mut stack: Vec<(NodeId, bool)> =
            roots.into_iter().rev().map(|id| (id, false)).collect();
        while let Some((id, expanded)) = stack.pop() {
            if expanded {
                order.push(id);
                continue;
            }
            if !visited.insert(id.clone()) {
                continue;
            }
            stack.push((id.clone(), true));
            if let Some(node) = plan.nodes.get(&id) {
                for operand in node.operand_ids() {
                    if !visited.contains(operand) {
                        stack.push((operand.clone(), false));
                    }
                }
            }
        }
        order
    }
}

impl ExecutionStrategy for StrictStrategy {
    fn name(&self) -> &'static str {
        "strict"
    }

    fn compile(
        &self,
        plan: &SymbolicPlan,
        registry: Arc<PrimitiveRegistry>,
        store: Arc<MaterializationStore>,
        cancel: Arc<AtomicBool>,
    ) -> PreparedPlan {
        let plan = Arc::new(plan.clone());
        let evaluator = Evaluator::new(&plan, registry, store, cancel, None);
        PreparedPlan {
            plan,
            evaluator,
            strategy: Strategy::Strict,
        }
    }

    fn run(&self, prepared: &PreparedPlan, goals: Option<&[NodeId]>) -> ExecutionResult {
        // Evaluate every reachable node in topological order; operand
        // values are always present when a node's turn comes. Failures are
        // recorded and poison dependents without stopping the sweep.
        for node_id in Self::topological_order(&prepared.plan, goals) {
            if prepared.evaluator.is_cancelled() {
                break;
            }
            let _ = prepared.evaluator.evaluate(&node_id);
        }
        surface_goals(prepared, goals)
    }

    fn stream(
        &self,
        prepared: &PreparedPlan,
        node: &str,
        chunk_size: usize,
    ) -> ExecResult<StreamChunks> {
        stream_node(prepared, node, chunk_size)
    }

    fn page(
        &self,
        prepared: &PreparedPlan,
        node: &str,
        offset: usize,
        limit: usize,
    ) -> ExecResult<PageResult> {
        page_node(prepared, node, offset, limit)
    }
}
