//! Node evaluation core shared by both strategies.
//!
//! Owns the runtime node graph (plan nodes plus nodes minted while applying
//! closures), the run-scoped memo, the in-flight map that coalesces
//! concurrent demand per NodeId, the per-name effect locks, and the store
//! probing that makes every computation at-most-once across processes.

use super::{CacheSummary, ExecError, ExecResult, NodeEvent, NodeStatus};
use crate::hash::{hash_node, hash_sequence_item};
use crate::ir::{CanonExpr, NodeId, NodeKind, NodeSpec, OutputKind};
use crate::ir::SymbolicPlan;
use crate::primitives::{
    KernelContext, KernelError, KernelInvocation, KernelResult, PrimitiveCall, PrimitiveRegistry,
};
use crate::store::MaterializationStore;
use crate::value::{
    ClosureValue, LazySequence, SeqIter, SequenceValue, ValueError, VoxValue,
};
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use rayon::prelude::*;
use serde_json::{json, Value as JsonValue};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Completion slot for in-flight coalescing: losers of the insert race
/// block here until the winner publishes.
struct InflightSlot {
    state: Mutex<Option<Result<VoxValue, String>>>,
    cond: Condvar,
}

impl InflightSlot {
    fn new() -> Self {
        InflightSlot {
            state: Mutex::new(None),
            cond: Condvar::new(),
        }
    }

    fn publish(&self, result: Result<VoxValue, String>) {
        *self.state.lock() = Some(result);
        self.cond.notify_all();
    }

    fn wait(&self, node_id: &str) -> ExecResult<VoxValue> {
        let mut state = self.state.lock();
        while state.is_none() {
            self.cond.wait(&mut state);
        }
        match state.as_ref() {
            Some(Ok(value)) => Ok(value.clone()),
            Some(Err(message)) => Err(ExecError::NodeFailed {
                node_id: node_id.to_string(),
                message: message.clone(),
            }),
            None => unreachable!("slot published"),
        }
    }
}

/// Shared evaluation state for one prepared plan.
pub struct Evaluator {
    registry: Arc<PrimitiveRegistry>,
    store: Arc<MaterializationStore>,
    imported_namespaces: Vec<String>,
    /// Plan nodes plus nodes minted at run time by closure application.
    nodes: DashMap<NodeId, NodeSpec>,
    /// Run-scoped value cache; also the only home of non-persistable
    /// values (lazy sequences, closure handles).
    memo: DashMap<NodeId, VoxValue>,
    /// Nodes that already failed, so dependents abort instead of retrying.
    failures: DashMap<NodeId, String>,
    inflight: DashMap<NodeId, Arc<InflightSlot>>,
    effect_locks: DashMap<String, Arc<Mutex<()>>>,
    cancel: Arc<AtomicBool>,
    pool: Option<Arc<rayon::ThreadPool>>,
    summary: Mutex<CacheSummary>,
    events: Mutex<Vec<NodeEvent>>,
    me: std::sync::Weak<Evaluator>,
}

impl Evaluator {
    pub fn new(
        plan: &SymbolicPlan,
        registry: Arc<PrimitiveRegistry>,
        store: Arc<MaterializationStore>,
        cancel: Arc<AtomicBool>,
        pool: Option<Arc<rayon::ThreadPool>>,
    ) -> Arc<Self> {
        let nodes = DashMap::new();
        for (id, node) in &plan.nodes {
            nodes.insert(id.clone(), node.clone());
        }
        Arc::new_cyclic(|me| Evaluator {
            registry,
            store,
            imported_namespaces: plan.imported_namespaces.clone(),
            nodes,
            memo: DashMap::new(),
            failures: DashMap::new(),
            inflight: DashMap::new(),
            effect_locks: DashMap::new(),
            cancel,
            pool,
            summary: Mutex::new(CacheSummary::default()),
            events: Mutex::new(Vec::new()),
            me: me.clone(),
        })
    }

    /// Owning handle to this evaluator; valid whenever a method runs,
    /// since callers always hold an Arc.
    fn handle(&self) -> Arc<Evaluator> {
        self.me.upgrade().expect("evaluator accessed through Arc")
    }

    pub fn store(&self) -> &Arc<MaterializationStore> {
        &self.store
    }

    pub fn node(&self, node_id: &str) -> Option<NodeSpec> {
        self.nodes.get(node_id).map(|entry| entry.clone())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Cooperative cancellation: pending work is dropped, the in-flight
    /// map cleared, completed puts flushed.
    pub fn cancelled_cleanup(&self) {
        self.inflight.clear();
        self.store.flush(std::time::Duration::from_secs(5));
    }

    /// Drain the run's accumulated summary and events.
    pub fn take_run_report(&self) -> (CacheSummary, Vec<NodeEvent>) {
        let summary = std::mem::take(&mut *self.summary.lock());
        let events = std::mem::take(&mut *self.events.lock());
        (summary, events)
    }

    fn record_event(&self, node_id: &str, status: NodeStatus, message: Option<String>) {
        {
            let mut summary = self.summary.lock();
            match status {
                NodeStatus::Cached => summary.cached_store += 1,
                NodeStatus::Computed => summary.computed += 1,
                NodeStatus::Failed => summary.failed += 1,
            }
        }
        self.events.lock().push(NodeEvent {
            node_id: node_id.to_string(),
            status,
            message,
        });
    }

    // ------------------------------------------------------------------
    // Evaluation
    // ------------------------------------------------------------------

    /// Evaluate one node to a value, with memoization, store probing and
    /// in-flight coalescing.
    pub fn evaluate(&self, node_id: &str) -> ExecResult<VoxValue> {
        if self.is_cancelled() {
            return Err(ExecError::Cancelled);
        }
        if let Some(value) = self.memo.get(node_id) {
            return Ok(value.clone());
        }
        if let Some(message) = self.failures.get(node_id) {
            return Err(ExecError::NodeFailed {
                node_id: node_id.to_string(),
                message: message.clone(),
            });
        }

        // At-most-one build per fingerprint: the first thread in claims
        // the slot, later arrivals wait on it.
        let slot = {
            use dashmap::mapref::entry::Entry;
            match self.inflight.entry(node_id.to_string()) {
                Entry::Occupied(entry) => {
                    let slot = Arc::clone(entry.get());
                    drop(entry);
                    return slot.wait(node_id);
                }
                Entry::Vacant(entry) => {
                    let slot = Arc::new(InflightSlot::new());
                    entry.insert(Arc::clone(&slot));
                    slot
                }
            }
        };

        // A previous claimant may have completed between the memo check
        // and the slot claim; recheck before computing.
        let result = if let Some(value) = self.memo.get(node_id).map(|v| v.clone()) {
            Ok(value)
        } else {
            self.compute(node_id)
        };
        match &result {
            Ok(value) => {
                self.memo.insert(node_id.to_string(), value.clone());
                slot.publish(Ok(value.clone()));
            }
            Err(err) => {
                let message = err.to_string();
                self.failures.insert(node_id.to_string(), message.clone());
                slot.publish(Err(message));
            }
        }
        self.inflight.remove(node_id);
        result
    }

    fn compute(&self, node_id: &str) -> ExecResult<VoxValue> {
        let node = self
            .node(node_id)
            .ok_or_else(|| ExecError::MissingNode(node_id.to_string()))?;

        match node.kind {
            NodeKind::Closure => Ok(VoxValue::Closure(Arc::new(closure_value(
                node_id, &node,
            )?))),
            NodeKind::Constant => self.compute_constant(node_id, &node),
            NodeKind::Primitive => self.compute_primitive(node_id, &node),
        }
    }

    fn compute_constant(&self, node_id: &str, node: &NodeSpec) -> ExecResult<VoxValue> {
        if let Some(value) = self.probe_store(node_id)? {
            return Ok(value);
        }
        let literal = node.attrs.get("value").cloned().unwrap_or(JsonValue::Null);
        let value = VoxValue::from_literal_json(literal);
        self.persist(node_id, &value, "constant");
        self.record_event(node_id, NodeStatus::Computed, None);
        Ok(value)
    }

    fn compute_primitive(&self, node_id: &str, node: &NodeSpec) -> ExecResult<VoxValue> {
        let spec = self
            .registry
            .resolve(&node.operator, &self.imported_namespaces)
            .map_err(|err| ExecError::NodeFailed {
                node_id: node_id.to_string(),
                message: err.to_string(),
            })?;

        // Effects always run; everything else honours the persistent
        // cache.
        if !spec.is_effect() {
            if let Some(value) = self.probe_store(node_id)? {
                return Ok(value);
            }
        }

        let args = self.gather_operands(node)?;
        let kernel = self.registry.kernel(&spec).map_err(|err| ExecError::Kernel {
            node_id: node_id.to_string(),
            message: err.to_string(),
        })?;

        let invocation = KernelInvocation { node_id, args };
        let invoke = || kernel(self, invocation);
        let result = if spec.is_effect() {
            let lock = self
                .effect_locks
                .entry(spec.qualified_name())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone();
            let _guard = lock.lock();
            invoke()
        } else {
            invoke()
        };

        match result {
            Ok(value) => {
                // Lazy sequence handles are not computations: the elements
                // are, and they account for themselves when touched. This
                // keeps a cache-warm re-run at computed == 0 without
                // forcing materialisation.
                let is_lazy_handle =
                    matches!(value, VoxValue::Sequence(_) | VoxValue::Closure(_));
                if !spec.is_effect() && !is_lazy_handle {
                    self.persist(node_id, &value, &node.operator);
                }
                if !is_lazy_handle {
                    self.record_event(node_id, NodeStatus::Computed, None);
                }
                Ok(value)
            }
            Err(err) => {
                let message = err.to_string();
                self.record_event(node_id, NodeStatus::Failed, Some(message.clone()));
                Err(ExecError::Kernel {
                    node_id: node_id.to_string(),
                    message,
                })
            }
        }
    }

    /// Store probe; a hit is a `cached` event.
    fn probe_store(&self, node_id: &str) -> ExecResult<Option<VoxValue>> {
        match self.store.get_value(node_id) {
            Ok(Some(value)) => {
                self.record_event(node_id, NodeStatus::Cached, None);
                Ok(Some(value))
            }
            Ok(None) => Ok(None),
            Err(err) => {
                // Store trouble is logged, not fatal; recompute instead.
                tracing::error!(node_id, error = %err, "store probe failed");
                Ok(None)
            }
        }
    }

    /// Persist a computed value. Lazy sequences are skipped here: their
    /// elements and parent envelope persist on materialisation.
    fn persist(&self, node_id: &str, value: &VoxValue, operator: &str) {
        if matches!(value, VoxValue::Sequence(_) | VoxValue::Closure(_)) {
            return;
        }
        if let Err(err) = self
            .store
            .put(node_id, value, json!({"operator": operator}))
        {
            tracing::error!(node_id, error = %err, "store put failed");
        }
    }

    /// Evaluate operands, keyed `"0","1",...` for positional arguments and
    /// by name for kwargs. Parallel under the deferred strategy's pool.
    fn gather_operands(
        &self,
        node: &NodeSpec,
    ) -> ExecResult<BTreeMap<String, VoxValue>> {
        let keyed: Vec<(String, NodeId)> = node
            .args
            .iter()
            .enumerate()
            .map(|(i, id)| (i.to_string(), id.clone()))
            .chain(node.kwargs.iter().cloned())
            .collect();

        match (&self.pool, keyed.len() > 1) {
            (Some(pool), true) => pool.install(|| {
                keyed
                    .par_iter()
                    .map(|(key, id)| self.evaluate(id).map(|value| (key.clone(), value)))
                    .collect::<ExecResult<BTreeMap<_, _>>>()
            }),
            _ => keyed
                .iter()
                .map(|(key, id)| self.evaluate(id).map(|value| (key.clone(), value)))
                .collect(),
        }
    }

    // ------------------------------------------------------------------
    // Closure application
    // ------------------------------------------------------------------

    /// Apply a closure to one element value: bind the parameter, reduce the
    /// stored canonical body into (shared, hashed) nodes, and evaluate the
    /// result through the normal pipeline. Equal element values therefore
    /// share per-element results automatically.
    pub fn apply_closure_keyed(
        &self,
        closure: &ClosureValue,
        arg: &VoxValue,
        elem_key: Option<NodeId>,
    ) -> ExecResult<VoxValue> {
        if closure.params.len() != 1 {
            return Err(ExecError::NodeFailed {
                node_id: closure.node_id.clone(),
                message: format!(
                    "closure application expects 1 parameter, closure has {}",
                    closure.params.len()
                ),
            });
        }

        let element_term = self.bind_element(arg, elem_key)?;
        let mut stack = vec![element_term];
        let term = self.reduce_canon(&closure.body, &mut stack)?;
        match term {
            RtTerm::Node(id) => self.evaluate(&id),
            RtTerm::Closure(_) => Err(ExecError::NodeFailed {
                node_id: closure.node_id.clone(),
                message: "closure body reduced to an unapplied closure".to_string(),
            }),
        }
    }

    /// Bind an element value to a runtime term. Literal values become
    /// constant nodes (content-addressed, shared across equal elements);
    /// opaque values are pinned into the memo under their synthetic
    /// element id.
    fn bind_element(
        &self,
        value: &VoxValue,
        elem_key: Option<NodeId>,
    ) -> ExecResult<RtTerm> {
        if let Some(literal) = value.as_literal_json() {
            return Ok(RtTerm::Node(self.mint_constant(literal)));
        }
        if let VoxValue::Closure(closure) = value {
            return Ok(RtTerm::Closure(Arc::clone(closure)));
        }
        match elem_key {
            Some(key) => {
                self.memo.insert(key.clone(), value.clone());
                Ok(RtTerm::Node(key))
            }
            None => Err(ExecError::NodeFailed {
                node_id: "<element>".to_string(),
                message: format!(
                    "cannot bind opaque {} element without a synthetic id",
                    value.vox_type()
                ),
            }),
        }
    }

    fn mint_constant(&self, literal: JsonValue) -> NodeId {
        let mut node = NodeSpec::new(NodeKind::Constant, "constant");
        node.attrs.insert("value".to_string(), literal);
        node.output_kind = OutputKind::Scalar;
        self.mint_node(node)
    }

    fn mint_closure(&self, params: usize, body: CanonExpr) -> (NodeId, Arc<ClosureValue>) {
        let mut node = NodeSpec::new(NodeKind::Closure, "closure");
        let param_names: Vec<JsonValue> = (0..params).map(|i| json!(format!("${i}"))).collect();
        node.attrs
            .insert("params".to_string(), JsonValue::Array(param_names.clone()));
        node.attrs.insert("body".to_string(), body.to_attr_json());
        node.attrs
            .insert("free_vars".to_string(), json!({}));
        node.output_kind = OutputKind::Closure;
        let node_id = self.mint_node(node);
        let closure = Arc::new(ClosureValue {
            node_id: node_id.clone(),
            params: (0..params).map(|i| format!("${i}")).collect(),
            body,
        });
        (node_id, closure)
    }

    /// Insert a runtime-minted node by content hash.
    fn mint_node(&self, node: NodeSpec) -> NodeId {
        let node_id = hash_node(&node);
        self.nodes.entry(node_id.clone()).or_insert(node);
        node_id
    }

    /// Reduce a canonical body against the runtime binding stack,
    /// extending the node graph. Mirrors the reducer's rules over the
    /// erased closure form.
    fn reduce_canon(
        &self,
        expr: &CanonExpr,
        stack: &mut Vec<RtTerm>,
    ) -> ExecResult<RtTerm> {
        match expr {
            CanonExpr::Num { value } => {
                let literal = if value.fract() == 0.0 && value.abs() < 9_007_199_254_740_992.0 {
                    json!(*value as i64)
                } else {
                    json!(value)
                };
                Ok(RtTerm::Node(self.mint_constant(literal)))
            }
            CanonExpr::Str { value } => Ok(RtTerm::Node(self.mint_constant(json!(value)))),
            CanonExpr::Bool { value } => Ok(RtTerm::Node(self.mint_constant(json!(value)))),
            CanonExpr::Param { index } => {
                stack.get(*index).cloned().ok_or_else(|| ExecError::NodeFailed {
                    node_id: "<closure>".to_string(),
                    message: format!("unbound parameter level {index}"),
                })
            }
            CanonExpr::Ref { id } => Ok(RtTerm::Node(id.clone())),
            CanonExpr::Closure { params, body } => {
                let (_, closure) = self.mint_closure(*params, (**body).clone());
                Ok(RtTerm::Closure(closure))
            }
            CanonExpr::Prim { operator, args } => {
                let mut arg_ids = Vec::with_capacity(args.len());
                for arg in args {
                    let term = self.reduce_canon(arg, stack)?;
                    arg_ids.push(self.term_to_node(term));
                }
                let spec = self
                    .registry
                    .resolve(operator, &self.imported_namespaces)
                    .map_err(|err| ExecError::NodeFailed {
                        node_id: operator.clone(),
                        message: err.to_string(),
                    })?;
                let node = (spec.planner)(PrimitiveCall {
                    args: arg_ids,
                    kwargs: vec![],
                    attrs: BTreeMap::new(),
                });
                Ok(RtTerm::Node(self.mint_node(node)))
            }
            CanonExpr::Apply { callee, args } => {
                let callee_term = self.reduce_canon(callee, stack)?;
                let closure = match callee_term {
                    RtTerm::Closure(closure) => closure,
                    RtTerm::Node(id) => {
                        return Err(ExecError::NodeFailed {
                            node_id: id,
                            message: "applied a non-closure value".to_string(),
                        })
                    }
                };
                if args.len() != closure.params.len() {
                    return Err(ExecError::NodeFailed {
                        node_id: closure.node_id.clone(),
                        message: format!(
                            "arity mismatch: closure takes {}, got {}",
                            closure.params.len(),
                            args.len()
                        ),
                    });
                }
                let mut call_stack = Vec::with_capacity(args.len());
                for arg in args {
                    call_stack.push(self.reduce_canon(arg, stack)?);
                }
                // Embedded closures are closed terms: the call stack is
                // exactly their parameters.
                self.reduce_canon(&closure.body, &mut call_stack)
            }
            CanonExpr::Let { rhs, body } => {
                let bound = self.reduce_canon(rhs, stack)?;
                stack.push(bound);
                let result = self.reduce_canon(body, stack);
                stack.pop();
                result
            }
            CanonExpr::For { iter, body } => {
                let producer = match self.reduce_canon(iter, stack)? {
                    RtTerm::Node(id) => id,
                    RtTerm::Closure(closure) => {
                        return Err(ExecError::NodeFailed {
                            node_id: closure.node_id.clone(),
                            message: "for-loop iterable reduced to a closure".to_string(),
                        })
                    }
                };
                // Close the body over the current stack; the loop variable
                // becomes the new closure's only parameter.
                let bound: Vec<CanonExpr> = stack.iter().map(RtTerm::to_canon).collect();
                let closed_body = body.close_over(&bound);
                let (closure_id, _) = self.mint_closure(1, closed_body);
                let spec = self
                    .registry
                    .resolve("default.map", &self.imported_namespaces)
                    .map_err(|err| ExecError::NodeFailed {
                        node_id: "default.map".to_string(),
                        message: err.to_string(),
                    })?;
                let node = (spec.planner)(PrimitiveCall {
                    args: vec![producer, closure_id],
                    kwargs: vec![],
                    attrs: BTreeMap::new(),
                });
                Ok(RtTerm::Node(self.mint_node(node)))
            }
        }
    }

    fn term_to_node(&self, term: RtTerm) -> NodeId {
        match term {
            RtTerm::Node(id) => id,
            RtTerm::Closure(closure) => closure.node_id.clone(),
        }
    }
}

/// Runtime reduction term: a node in the graph or a first-class closure.
#[derive(Clone)]
enum RtTerm {
    Node(NodeId),
    Closure(Arc<ClosureValue>),
}

impl RtTerm {
    fn to_canon(&self) -> CanonExpr {
        match self {
            RtTerm::Node(id) => CanonExpr::Ref { id: id.clone() },
            RtTerm::Closure(closure) => CanonExpr::Closure {
                params: closure.params.len(),
                body: Box::new(closure.body.clone()),
            },
        }
    }
}

/// Decode a closure NodeSpec's attrs into a runtime handle.
fn closure_value(node_id: &str, node: &NodeSpec) -> ExecResult<ClosureValue> {
    let params: Vec<String> = node
        .attrs
        .get("params")
        .and_then(JsonValue::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(JsonValue::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    let body = node
        .attrs
        .get("body")
        .and_then(CanonExpr::from_attr_json)
        .ok_or_else(|| ExecError::NodeFailed {
            node_id: node_id.to_string(),
            message: "closure node has no canonical body".to_string(),
        })?;
    Ok(ClosureValue {
        node_id: node_id.to_string(),
        params,
        body,
    })
}

// ============================================================================
// Kernel context
// ============================================================================

impl KernelContext for Evaluator {
    fn apply_closure(&self, closure: &ClosureValue, arg: &VoxValue) -> KernelResult<VoxValue> {
        self.apply_closure_keyed(closure, arg, None)
            .map_err(|err| KernelError::msg(err.to_string()))
    }

    fn mapped_sequence(
        &self,
        base: SequenceValue,
        closure: Arc<ClosureValue>,
        parent_id: &str,
    ) -> SequenceValue {
        let base_id = self
            .node(parent_id)
            .and_then(|node| node.args.first().cloned());
        SequenceValue::new(Arc::new(MappedSequence {
            base,
            closure,
            parent_id: parent_id.to_string(),
            base_id,
            evaluator: self.handle(),
        }))
    }
}

// ============================================================================
// Mapped sequences
// ============================================================================

/// Lazy mapped view: applies the closure per element on demand. Elements
/// computed once are persisted under `hash_sequence_item(map_node, index)`,
/// so a restarted stream reuses cached partitions and equal element values
/// share work through the content-addressed per-element nodes.
pub struct MappedSequence {
    base: SequenceValue,
    closure: Arc<ClosureValue>,
    parent_id: NodeId,
    base_id: Option<NodeId>,
    evaluator: Arc<Evaluator>,
}

impl LazySequence for MappedSequence {
    fn iter_from(&self, offset: usize) -> SeqIter<'_> {
        let iter = self.base.iter_from(offset);
        Box::new(iter.enumerate().map(move |(i, element)| {
            let index = offset + i;
            let element_id = hash_sequence_item(&self.parent_id, index);

            // Cached partition?
            if let Ok(Some(value)) = self.evaluator.store.get_value(&element_id) {
                return Ok(value);
            }

            let element = element?;
            let binding_key = self
                .base_id
                .as_ref()
                .map(|base| hash_sequence_item(base, index));
            let value = self
                .evaluator
                .apply_closure_keyed(&self.closure, &element, binding_key)
                .map_err(|err| ValueError::Eval(err.to_string()))?;

            // Persist the touched element; lazy nested sequences stay
            // memo-only.
            if !matches!(value, VoxValue::Sequence(_) | VoxValue::Closure(_)) {
                if let Err(err) = self.evaluator.store.put(
                    &element_id,
                    &value,
                    json!({"sequence_parent": self.parent_id, "index": index}),
                ) {
                    tracing::error!(element_id = %element_id, error = %err, "element put failed");
                }
            }
            Ok(value)
        }))
    }

    fn known_len(&self) -> Option<usize> {
        self.base.known_len()
    }

    fn count_lower_bound(&self) -> usize {
        self.base.count_lower_bound()
    }
}
