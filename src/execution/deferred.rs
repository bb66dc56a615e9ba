//! Deferred strategy: task-graph execution with a worker pool.
//!
//! Each node is evaluated as a task whose inputs are its operand nodes;
//! operand fan-out runs on a rayon pool, and concurrent demand for one
//! NodeId coalesces through the evaluator's in-flight map (at-most-once
//! build). Cache probes happen inside each task, so a hit skips the kernel
//! entirely.

use super::{
    page_node, stream_node, surface_goals, ExecResult, ExecutionResult, ExecutionStrategy,
    Evaluator, PageResult, PreparedPlan, Strategy, StreamChunks,
};
use crate::ir::{NodeId, SymbolicPlan};
use crate::primitives::PrimitiveRegistry;
use crate::store::MaterializationStore;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// Parallel strategy. `workers = 0` sizes the pool to the available cores.
#[derive(Debug)]
pub struct DeferredStrategy {
    workers: usize,
}

impl DeferredStrategy {
    pub fn new(workers: usize) -> Self {
        DeferredStrategy { workers }
    }

    fn build_pool(&self) -> Option<Arc<rayon::ThreadPool>> {
        let workers = if self.workers == 0 {
            num_cpus::get()
        } else {
            self.workers
        };
        rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("voxlogica-worker-{i}"))
            .build()
            .map(Arc::new)
            .map_err(|err| {
                tracing::warn!(error = %err, "falling back to sequential evaluation");
                err
            })
            .ok()
    }
}

impl Default for DeferredStrategy {
    fn default() -> Self {
        DeferredStrategy::new(0)
    }
}

impl ExecutionStrategy for DeferredStrategy {
    fn name(&self) -> &'static str {
        "deferred"
    }

    fn compile(
        &self,
        plan: &SymbolicPlan,
        registry: Arc<PrimitiveRegistry>,
        store: Arc<MaterializationStore>,
        cancel: Arc<AtomicBool>,
    ) -> PreparedPlan {
        let plan = Arc::new(plan.clone());
        let evaluator = Evaluator::new(&plan, registry, store, cancel, self.build_pool());
        PreparedPlan {
            plan,
            evaluator,
            strategy: Strategy::Deferred,
        }
    }

    fn run(&self, prepared: &PreparedPlan, goals: Option<&[NodeId]>) -> ExecutionResult {
        // Goals pull their reachable subgraphs; operand fan-out inside the
        // evaluator provides the parallelism.
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
