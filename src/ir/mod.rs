//! # Symbolic IR
//!
//! Immutable graph records produced by the reducer: [`NodeSpec`] describes
//! one unit of computation, [`GoalSpec`] one imperative request, and
//! [`SymbolicPlan`] the full reducer output. Node identity is the SHA-256
//! content hash of the node's canonical payload (see [`crate::hash`]), so
//! semantically equivalent subexpressions collapse to a single node.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap};

pub mod canon;
pub mod planner;

pub use canon::CanonExpr;
pub use planner::SymbolicPlanner;

/// Content-addressed node identifier: lowercase hex SHA-256.
pub type NodeId = String;

/// Structural kind of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Constant,
    Primitive,
    Closure,
}

impl NodeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeKind::Constant => "constant",
            NodeKind::Primitive => "primitive",
            NodeKind::Closure => "closure",
        }
    }
}

/// Coarse output classification used for planning and sequence dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    Scalar,
    Sequence,
    Tree,
    Dataset,
    Effect,
    Closure,
    #[default]
    Unknown,
}

impl OutputKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OutputKind::Scalar => "scalar",
            OutputKind::Sequence => "sequence",
            OutputKind::Tree => "tree",
            OutputKind::Dataset => "dataset",
            OutputKind::Effect => "effect",
            OutputKind::Closure => "closure",
            OutputKind::Unknown => "unknown",
        }
    }

    /// Whether values of this kind are consumed through the lazy sequence
    /// capability.
    pub fn is_sequence_like(self) -> bool {
        matches!(self, OutputKind::Sequence | OutputKind::Dataset)
    }
}

/// Canonical symbolic node description.
///
/// `args` order is significant; `kwargs` keys are unique and order-free
/// (sorted at hash time); `attrs` hold only literal-serialisable values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub kind: NodeKind,
    pub operator: String,
    #[serde(default)]
    pub args: Vec<NodeId>,
    #[serde(default)]
    pub kwargs: Vec<(String, NodeId)>,
    #[serde(default)]
    pub attrs: BTreeMap<String, JsonValue>,
    #[serde(default)]
    pub output_kind: OutputKind,
}

impl NodeSpec {
    pub fn new(kind: NodeKind, operator: impl Into<String>) -> Self {
        NodeSpec {
            kind,
            operator: operator.into(),
            args: Vec::new(),
            kwargs: Vec::new(),
            attrs: BTreeMap::new(),
            output_kind: OutputKind::Unknown,
        }
    }

    /// Kwargs sorted by key, the canonical order used for hashing.
    pub fn normalized_kwargs(&self) -> Vec<(String, NodeId)> {
        let mut kwargs = self.kwargs.clone();
        kwargs.sort();
        kwargs
    }

    /// All operand node ids, positional then named.
    pub fn operand_ids(&self) -> impl Iterator<Item = &NodeId> {
        self.args.iter().chain(self.kwargs.iter().map(|(_, v)| v))
    }
}

/// Goal operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GoalOperation {
    Print,
    Save,
}

impl GoalOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            GoalOperation::Print => "print",
            GoalOperation::Save => "save",
        }
    }
}

/// Goal to materialize from the symbolic plan.
///
/// `name` is a display label for `print` and a filesystem path for `save`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoalSpec {
    pub operation: GoalOperation,
    pub id: NodeId,
    pub name: String,
}

/// Reducer output: immutable definition graph + goals.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SymbolicPlan {
    pub nodes: HashMap<NodeId, NodeSpec>,
    pub goals: Vec<GoalSpec>,
    pub imported_namespaces: Vec<String>,
}

impl SymbolicPlan {
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node(&self, id: &str) -> Option<&NodeSpec> {
        self.nodes.get(id)
    }

    pub fn goals(&self) -> &[GoalSpec] {
        &self.goals
    }

    /// Check referential integrity: every id mentioned in args, kwargs or
    /// goals resolves in `nodes`.
    pub fn is_closed(&self) -> bool {
        let resolves = |id: &NodeId| self.nodes.contains_key(id);
        self.nodes
            .values()
            .all(|node| node.operand_ids().all(resolves))
            && self.goals.iter().all(|goal| resolves(&goal.id))
    }
}
