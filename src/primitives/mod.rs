//! # Primitive Registry
//!
//! Namespaced lookup from operator names to [`PrimitiveSpec`] entries.
//! Each spec carries a *planner* (how a call becomes a [`NodeSpec`]) and a
//! *kernel name* that resolves to an executable kernel lazily, on first
//! execution, so unused kernels never load.
//!
//! Resolution order for an operator mentioned in source:
//! 1. fully qualified `ns.name` looks up exactly in that namespace;
//! 2. bare names scan the imported namespaces in import order;
//! 3. a miss is `UnknownPrimitive`.
//!
//! Shipped namespaces: `default` (always imported first), `strings`,
//! `test`, `dataset`.

pub mod dataset;
pub mod default;
pub mod strings;
pub mod testing;

use crate::ir::{NodeId, NodeKind, NodeSpec, OutputKind};
use crate::value::{ClosureValue, SequenceValue, ValueError, VoxValue};
use parking_lot::RwLock;
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;

/// Registry errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("unknown primitive '{0}'")]
    UnknownPrimitive(String),

    #[error("unknown namespace '{0}'")]
    UnknownNamespace(String),
}

/// Kernel failure, surfaced as `KernelError` in execution results.
#[derive(Error, Debug)]
pub enum KernelError {
    #[error("{0}")]
    Message(String),

    #[error("missing argument '{0}'")]
    MissingArgument(String),

    #[error(transparent)]
    Value(#[from] ValueError),
}

impl KernelError {
    pub fn msg(message: impl Into<String>) -> Self {
        KernelError::Message(message.into())
    }
}

pub type KernelResult<T> = Result<T, KernelError>;

/// Services a kernel may call back into; implemented by the execution
/// layer's evaluator.
pub trait KernelContext: Send + Sync {
    /// Apply a closure to one element value, producing (and caching) the
    /// per-element node.
    fn apply_closure(&self, closure: &ClosureValue, arg: &VoxValue) -> KernelResult<VoxValue>;

    /// Lazy mapped view over a base sequence; `parent_id` keys per-element
    /// result records.
    fn mapped_sequence(
        &self,
        base: SequenceValue,
        closure: Arc<ClosureValue>,
        parent_id: &str,
    ) -> SequenceValue;
}

/// One kernel invocation: the node being computed plus its keyword-indexed
/// arguments (positional operands under `"0"`, `"1"`, ..., named kwargs
/// under their names).
pub struct KernelInvocation<'a> {
    pub node_id: &'a str,
    pub args: BTreeMap<String, VoxValue>,
}

impl KernelInvocation<'_> {
    /// Positional argument accessor.
    pub fn positional(&self, index: usize) -> KernelResult<&VoxValue> {
        let key = index.to_string();
        self.args
            .get(&key)
            .ok_or(KernelError::MissingArgument(key))
    }

    /// All positional arguments in order.
    pub fn positional_all(&self) -> Vec<&VoxValue> {
        let mut out = Vec::new();
        let mut i = 0;
        while let Some(value) = self.args.get(&i.to_string()) {
            out.push(value);
            i += 1;
        }
        out
    }
}

/// Executable kernel entry point.
pub type KernelFn = fn(&dyn KernelContext, KernelInvocation<'_>) -> KernelResult<VoxValue>;

/// Planner: how a call site becomes a symbolic node.
pub type PlannerFn = Arc<dyn Fn(PrimitiveCall) -> NodeSpec + Send + Sync>;

/// A primitive call as seen by a planner.
#[derive(Debug, Clone, Default)]
pub struct PrimitiveCall {
    pub args: Vec<NodeId>,
    pub kwargs: Vec<(String, NodeId)>,
    pub attrs: BTreeMap<String, JsonValue>,
}

/// Arity contract of a primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AritySpec {
    Fixed(usize),
    Variadic { min: usize },
}

impl AritySpec {
    pub fn fixed(n: usize) -> Self {
        AritySpec::Fixed(n)
    }

    pub fn variadic(min: usize) -> Self {
        AritySpec::Variadic { min }
    }

    pub fn accepts(self, count: usize) -> bool {
        match self {
            AritySpec::Fixed(n) => count == n,
            AritySpec::Variadic { min } => count >= min,
        }
    }
}

impl std::fmt::Display for AritySpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AritySpec::Fixed(n) => write!(f, "exactly {n}"),
            AritySpec::Variadic { min } => write!(f, "at least {min}"),
        }
    }
}

/// Value kind a primitive produces; doubles as the planner's output kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimitiveKind {
    Scalar,
    Sequence,
    Tree,
    Dataset,
    Effect,
}

impl PrimitiveKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PrimitiveKind::Scalar => "scalar",
            PrimitiveKind::Sequence => "sequence",
            PrimitiveKind::Tree => "tree",
            PrimitiveKind::Dataset => "dataset",
            PrimitiveKind::Effect => "effect",
        }
    }

    pub fn output_kind(self) -> OutputKind {
        match self {
            PrimitiveKind::Scalar => OutputKind::Scalar,
            PrimitiveKind::Sequence => OutputKind::Sequence,
            PrimitiveKind::Tree => OutputKind::Tree,
            PrimitiveKind::Dataset => OutputKind::Dataset,
            PrimitiveKind::Effect => OutputKind::Effect,
        }
    }
}

/// Registry entry describing one primitive.
#[derive(Clone)]
pub struct PrimitiveSpec {
    pub name: String,
    pub namespace: String,
    pub kind: PrimitiveKind,
    pub arity: AritySpec,
    pub attrs_schema: BTreeMap<String, JsonValue>,
    pub planner: PlannerFn,
    pub kernel_name: String,
    pub description: String,
}

impl PrimitiveSpec {
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.namespace, self.name)
    }

    /// Effects always run and are serialised per qualified name.
    pub fn is_effect(&self) -> bool {
        self.kind == PrimitiveKind::Effect
    }
}

impl std::fmt::Debug for PrimitiveSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrimitiveSpec")
            .field("qualified_name", &self.qualified_name())
            .field("kind", &self.kind)
            .field("arity", &self.arity)
            .field("kernel_name", &self.kernel_name)
            .finish()
    }
}

/// The standard planner: emit a primitive node with the call's operands and
/// attrs under the given qualified operator.
pub fn default_planner(qualified_name: &str, output_kind: OutputKind) -> PlannerFn {
    let operator = qualified_name.to_string();
    Arc::new(move |call: PrimitiveCall| {
        let mut node = NodeSpec::new(NodeKind::Primitive, operator.clone());
        node.args = call.args;
        node.kwargs = call.kwargs;
        node.attrs = call.attrs;
        node.output_kind = output_kind;
        node
    })
}

/// Builder for the common spec shape.
pub fn spec(
    namespace: &str,
    name: &str,
    kind: PrimitiveKind,
    arity: AritySpec,
    description: &str,
) -> PrimitiveSpec {
    let qualified = format!("{namespace}.{name}");
    PrimitiveSpec {
        name: name.to_string(),
        namespace: namespace.to_string(),
        kind,
        arity,
        attrs_schema: BTreeMap::new(),
        planner: default_planner(&qualified, kind.output_kind()),
        kernel_name: qualified,
        description: description.to_string(),
    }
}

/// Wrap a bare kernel function (the legacy zero-spec contract) into a full
/// spec with a default planner. Logs a deprecation notice per registration.
pub fn legacy_adapter(
    namespace: &str,
    name: &str,
    kind: PrimitiveKind,
    arity: AritySpec,
    description: &str,
) -> PrimitiveSpec {
    tracing::warn!(
        primitive = %format!("{namespace}.{name}"),
        "Legacy primitive contract: wrapping bare kernel in a default-planner spec"
    );
    spec(namespace, name, kind, arity, description)
}

// ============================================================================
// Registry
// ============================================================================

/// Process-wide primitive registry. Namespaces are populated at engine
/// construction (and on demand for qualified lookups); reads are cheap.
pub struct PrimitiveRegistry {
    namespaces: RwLock<HashMap<String, HashMap<String, Arc<PrimitiveSpec>>>>,
    kernels: dashmap::DashMap<String, KernelFn>,
}

impl Default for PrimitiveRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PrimitiveRegistry {
    /// Registry with the `default` namespace preloaded.
    pub fn new() -> Self {
        let registry = PrimitiveRegistry {
            namespaces: RwLock::new(HashMap::new()),
            kernels: dashmap::DashMap::new(),
        };
        // default is always available without an explicit import.
        let _ = registry.import_namespace("default");
        registry
    }

    /// Load a namespace's manifest, registering each spec found.
    pub fn import_namespace(&self, namespace: &str) -> Result<(), RegistryError> {
        if self.namespaces.read().contains_key(namespace) {
            return Ok(());
        }
        let manifest = match namespace {
            "default" => default::manifest(),
            "strings" => strings::manifest(),
            "test" => testing::manifest(),
            "dataset" => dataset::manifest(),
            other => return Err(RegistryError::UnknownNamespace(other.to_string())),
        };
        let mut table = HashMap::new();
        for spec in manifest {
            table.insert(spec.name.clone(), Arc::new(spec));
        }
        tracing::debug!(namespace, primitives = table.len(), "registered namespace");
        self.namespaces.write().insert(namespace.to_string(), table);
        Ok(())
    }

    pub fn has_namespace(&self, namespace: &str) -> bool {
        self.namespaces.read().contains_key(namespace)
    }

    /// Resolve an operator name against the imported namespace list.
    pub fn resolve(
        &self,
        name: &str,
        imported: &[String],
    ) -> Result<Arc<PrimitiveSpec>, RegistryError> {
        if let Some((namespace, bare)) = name.split_once('.') {
            // Qualified names address their namespace directly, loading it
            // on demand.
            self.import_namespace(namespace)
                .map_err(|_| RegistryError::UnknownPrimitive(name.to_string()))?;
            return self
                .namespaces
                .read()
                .get(namespace)
                .and_then(|table| table.get(bare))
                .cloned()
                .ok_or_else(|| RegistryError::UnknownPrimitive(name.to_string()));
        }

        let namespaces = self.namespaces.read();
        for namespace in imported {
            if let Some(spec) = namespaces.get(namespace).and_then(|t| t.get(name)) {
                return Ok(Arc::clone(spec));
            }
        }
        Err(RegistryError::UnknownPrimitive(name.to_string()))
    }

    /// Resolve the kernel for a spec, loading it on first use.
    pub fn kernel(&self, spec: &PrimitiveSpec) -> KernelResult<KernelFn> {
        if let Some(kernel) = self.kernels.get(&spec.kernel_name) {
            return Ok(*kernel);
        }
        let kernel = kernel_table(&spec.kernel_name).ok_or_else(|| {
            KernelError::msg(format!("no kernel registered for '{}'", spec.kernel_name))
        })?;
        tracing::debug!(kernel = %spec.kernel_name, "loaded kernel");
        self.kernels.insert(spec.kernel_name.clone(), kernel);
        Ok(kernel)
    }
}

/// Static kernel table: name to entry point. Consulted lazily so that a
/// plan-only session never touches kernel code.
fn kernel_table(kernel_name: &str) -> Option<KernelFn> {
    match kernel_name {
        "default.addition" => Some(default::addition),
        "default.subtraction" => Some(default::subtraction),
        "default.multiplication" => Some(default::multiplication),
        "default.division" => Some(default::division),
        "default.range" => Some(default::range),
        "default.map" => Some(default::map),
        "default.for_loop" => Some(default::for_loop),
        "default.load" => Some(default::load),
        "default.index" => Some(default::index),
        "default.print_primitive" => Some(default::print_primitive),
        "strings.concat" => Some(strings::concat),
        "strings.format_string" => Some(strings::format_string),
        "test.fibonacci" => Some(testing::fibonacci),
        "test.impure" => Some(testing::impure),
        "test.demo_data" => Some(testing::demo_data),
        "dataset.readdir" => Some(dataset::readdir),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qualified_resolution_loads_namespace_on_demand() {
        let registry = PrimitiveRegistry::new();
        let spec = registry
            .resolve("strings.concat", &[])
            .expect("qualified lookup");
        assert_eq!(spec.qualified_name(), "strings.concat");
    }

    #[test]
    fn test_bare_resolution_scans_import_order() {
        let registry = PrimitiveRegistry::new();
        registry.import_namespace("test").expect("import");
        let spec = registry
            .resolve(
                "fibonacci",
                &["default".to_string(), "test".to_string()],
            )
            .expect("bare lookup");
        assert_eq!(spec.namespace, "test");
    }

    #[test]
    fn test_unknown_primitive_errors() {
        let registry = PrimitiveRegistry::new();
        let err = registry
            .resolve("no_such_thing", &["default".to_string()])
            .expect_err("miss");
        assert_eq!(
            err,
            RegistryError::UnknownPrimitive("no_such_thing".to_string())
        );
    }

    #[test]
    fn test_specs_have_required_contract_fields() {
        let registry = PrimitiveRegistry::new();
        for name in [
            "default.addition",
            "default.range",
            "default.map",
            "default.for_loop",
            "default.load",
            "default.print_primitive",
        ] {
            let spec = registry.resolve(name, &[]).expect("resolve");
            assert!(!spec.name.is_empty());
            assert!(!spec.namespace.is_empty());
            assert!(!spec.kernel_name.is_empty());
            let planned = (spec.planner)(PrimitiveCall::default());
            assert_eq!(planned.operator, name);
        }
    }

    #[test]
    fn test_kernel_loads_lazily_and_caches() {
        let registry = PrimitiveRegistry::new();
        let spec = registry.resolve("default.addition", &[]).expect("resolve");
        assert!(registry.kernels.is_empty());
        registry.kernel(&spec).expect("kernel");
        assert_eq!(registry.kernels.len(), 1);
        registry.kernel(&spec).expect("cached kernel");
        assert_eq!(registry.kernels.len(), 1);
    }

    #[test]
    fn test_arity_spec_accepts() {
        assert!(AritySpec::fixed(2).accepts(2));
        assert!(!AritySpec::fixed(2).accepts(3));
        assert!(AritySpec::variadic(1).accepts(4));
        assert!(!AritySpec::variadic(1).accepts(0));
    }
}
