//! Mutable plan builder driven by the reducer.
//!
//! `add_node` inserts by content hash only when absent, which is what makes
//! equivalent subexpressions share a single node across the whole program.

use super::{GoalOperation, GoalSpec, NodeId, NodeKind, NodeSpec, OutputKind, SymbolicPlan};
use crate::hash::hash_node;
use serde_json::Value as JsonValue;
use std::collections::HashMap;

/// Mutable planner used by the reducer, exporting an immutable
/// [`SymbolicPlan`].
#[derive(Debug, Default)]
pub struct SymbolicPlanner {
    nodes: HashMap<NodeId, NodeSpec>,
    goals: Vec<GoalSpec>,
    imported_namespaces: Vec<String>,
}

impl SymbolicPlanner {
    pub fn new() -> Self {
        SymbolicPlanner::default()
    }

    /// Insert a node keyed by its content hash; equivalent nodes collapse.
    pub fn add_node(&mut self, node: NodeSpec) -> NodeId {
        let node_id = hash_node(&node);
        self.nodes.entry(node_id.clone()).or_insert(node);
        node_id
    }

    /// Add a constant node carrying a literal value in its attrs.
    pub fn add_constant(&mut self, value: JsonValue, output_kind: OutputKind) -> NodeId {
        let mut node = NodeSpec::new(NodeKind::Constant, "constant");
        node.attrs.insert("value".to_string(), value);
        node.output_kind = output_kind;
        self.add_node(node)
    }

    pub fn add_goal(&mut self, operation: GoalOperation, node_id: NodeId, name: impl Into<String>) {
        self.goals.push(GoalSpec {
            operation,
            id: node_id,
            name: name.into(),
        });
    }

    /// Record a namespace import, keeping first-import order.
    pub fn import_namespace(&mut self, namespace: &str) {
        if !self.imported_namespaces.iter().any(|ns| ns == namespace) {
            self.imported_namespaces.push(namespace.to_string());
        }
    }

    pub fn imported_namespaces(&self) -> &[String] {
        &self.imported_namespaces
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node(&self, id: &str) -> Option<&NodeSpec> {
        self.nodes.get(id)
    }

    pub fn to_plan(&self) -> SymbolicPlan {
        SymbolicPlan {
            nodes: self.nodes.clone(),
            goals: self.goals.clone(),
            imported_namespaces: self.imported_namespaces.clone(),
        }
    }
}
