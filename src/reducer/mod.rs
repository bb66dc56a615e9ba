//! # Reducer
//!
//! Turns a surface [`Program`] into a [`SymbolicPlan`]: environments with
//! persistent scoping, first-class closures, β-reduction of user function
//! calls, and desugaring of `for` comprehensions into `default.map` nodes
//! over canonical closure NodeSpecs.
//!
//! Memoization falls out of hashing: the planner inserts nodes by content
//! hash, so equivalent subexpressions share ids across the whole program.
//! Closures and environments live only inside the reducer; what reaches the
//! plan is always literal-serialisable.

use crate::ast::{Declaration, Expr, Goal, Program};
use crate::ir::{
    CanonExpr, GoalOperation, NodeId, NodeKind, NodeSpec, OutputKind, SymbolicPlan,
    SymbolicPlanner,
};
use crate::primitives::{PrimitiveCall, PrimitiveRegistry, PrimitiveSpec, RegistryError};
use serde_json::{json, Value as JsonValue};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;

/// Reduction failures. All are fatal for the program: no partial plan
/// escapes the reducer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReduceError {
    #[error("unbound identifier '{0}'")]
    UnboundIdentifier(String),

    #[error("arity mismatch for '{name}': expected {expected} arguments, found {found}")]
    ArityMismatch {
        name: String,
        expected: String,
        found: usize,
    },

    #[error(transparent)]
    UnknownPrimitive(#[from] RegistryError),

    #[error("cycle detected through '{0}'")]
    CycleDetected(String),

    #[error("non-canonical attribute: {0}")]
    NonCanonicalAttr(String),

    #[error("'{0}' is not callable")]
    NotCallable(String),
}

pub type ReduceResult<T> = Result<T, ReduceError>;

// ============================================================================
// Environment
// ============================================================================

/// A function value captured at definition time: parameters, body AST and a
/// snapshot of the enclosing environment. `self_name` makes recursive
/// definitions visible inside their own body.
#[derive(Debug)]
pub struct ClosureBinding {
    pub params: Vec<String>,
    pub body: Expr,
    pub env: Environment,
    pub self_name: Option<String>,
}

/// What a name denotes.
#[derive(Debug, Clone)]
pub enum Binding {
    ValueRef(NodeId),
    Closure(Arc<ClosureBinding>),
}

/// Persistent name environment. Child scopes share their parent chain;
/// rebinding shadows without mutating the parent, so captured snapshots
/// never observe later bindings.
#[derive(Debug, Clone, Default)]
pub struct Environment(Option<Arc<EnvNode>>);

#[derive(Debug)]
struct EnvNode {
    name: String,
    binding: Binding,
    parent: Environment,
}

impl Environment {
    pub fn new() -> Self {
        Environment(None)
    }

    /// Child environment with one extra binding.
    pub fn bind(&self, name: impl Into<String>, binding: Binding) -> Environment {
        Environment(Some(Arc::new(EnvNode {
            name: name.into(),
            binding,
            parent: self.clone(),
        })))
    }

    pub fn lookup(&self, name: &str) -> Option<&Binding> {
        let mut current = self;
        while let Some(node) = &current.0 {
            if node.name == name {
                return Some(&node.binding);
            }
            current = &node.parent;
        }
        None
    }
}

// ============================================================================
// Reducer
// ============================================================================

/// Result of reducing one expression: a plan node, or an unapplied closure
/// (closures stay symbolic until application).
#[derive(Clone)]
enum Reduced {
    Value(NodeId),
    Closure(Arc<ClosureBinding>),
}

/// Reduce a program against a registry.
pub fn reduce_program(
    program: &Program,
    registry: &PrimitiveRegistry,
) -> ReduceResult<SymbolicPlan> {
    reduce_program_with_bindings(program, registry).map(|(plan, _)| plan)
}

/// Reduce a program, also returning the top-level value bindings
/// (`name -> NodeId`) for trace and debugging.
pub fn reduce_program_with_bindings(
    program: &Program,
    registry: &PrimitiveRegistry,
) -> ReduceResult<(SymbolicPlan, BTreeMap<String, NodeId>)> {
    let mut reducer = Reducer::new(registry);
    let env = reducer.reduce_declarations(&program.declarations, Environment::new())?;
    for goal in &program.goals {
        reducer.reduce_goal(goal, &env)?;
    }
    let plan = reducer.planner.to_plan();
    debug_assert!(plan.is_closed(), "reducer emitted dangling node references");
    assert_acyclic(&plan)?;
    Ok((plan, reducer.bindings))
}

pub struct Reducer<'r> {
    registry: &'r PrimitiveRegistry,
    planner: SymbolicPlanner,
    bindings: BTreeMap<String, NodeId>,
}

impl<'r> Reducer<'r> {
    pub fn new(registry: &'r PrimitiveRegistry) -> Self {
        let mut planner = SymbolicPlanner::new();
        planner.import_namespace("default");
        Reducer {
            registry,
            planner,
            bindings: BTreeMap::new(),
        }
    }

    /// Export the (validated) plan built so far. Used by incremental
    /// sessions (REPL) that reduce fragments against a live reducer.
    pub fn finish(&self) -> ReduceResult<SymbolicPlan> {
        let plan = self.planner.to_plan();
        debug_assert!(plan.is_closed(), "reducer emitted dangling node references");
        assert_acyclic(&plan)?;
        Ok(plan)
    }

    /// Top-level value bindings recorded so far.
    pub fn bindings(&self) -> &BTreeMap<String, NodeId> {
        &self.bindings
    }

    /// Process declarations in order, threading the environment.
    pub fn reduce_declarations(
        &mut self,
        declarations: &[Declaration],
        mut env: Environment,
    ) -> ReduceResult<Environment> {
        for declaration in declarations {
            env = self.reduce_declaration(declaration, env)?;
        }
        Ok(env)
    }

    fn reduce_declaration(
        &mut self,
        declaration: &Declaration,
        env: Environment,
    ) -> ReduceResult<Environment> {
        match declaration {
            Declaration::Import { namespace } => {
                self.registry.import_namespace(namespace)?;
                self.planner.import_namespace(namespace);
                Ok(env)
            }
            Declaration::Let { name, params, rhs } => {
                if params.is_empty() {
                    // RHS resolves in the outer environment, then the name
                    // binds in a child scope (shadowing semantics).
                    match self.reduce_expr(rhs, &env)? {
                        Reduced::Value(node_id) => {
                            self.bindings.insert(name.clone(), node_id.clone());
                            Ok(env.bind(name.as_str(), Binding::ValueRef(node_id)))
                        }
                        Reduced::Closure(closure) => {
                            Ok(env.bind(name.as_str(), Binding::Closure(closure)))
                        }
                    }
                } else {
                    let closure = Arc::new(ClosureBinding {
                        params: params.clone(),
                        body: rhs.clone(),
                        env: env.clone(),
                        self_name: Some(name.clone()),
                    });
                    Ok(env.bind(name.as_str(), Binding::Closure(closure)))
                }
            }
        }
    }

    pub fn reduce_goal(&mut self, goal: &Goal, env: &Environment) -> ReduceResult<NodeId> {
        let (operation, expr, name) = match goal {
            Goal::Print { label, expr } => (GoalOperation::Print, expr, label.clone()),
            Goal::Save { path, expr } => (GoalOperation::Save, expr, path.clone()),
        };
        let node_id = self.reduce_to_value(expr, env)?;
        self.planner.add_goal(operation, node_id.clone(), name);
        Ok(node_id)
    }

    /// Reduce an expression that must denote a plan node.
    pub fn reduce_to_value(&mut self, expr: &Expr, env: &Environment) -> ReduceResult<NodeId> {
        match self.reduce_expr(expr, env)? {
            Reduced::Value(id) => Ok(id),
            Reduced::Closure(closure) => {
                // A bare closure can still become a plan node when a
                // primitive needs it (handled at call sites); as a goal or
                // value it has no meaning.
                Err(ReduceError::NotCallable(
                    closure
                        .self_name
                        .clone()
                        .unwrap_or_else(|| "<closure>".to_string()),
                ))
            }
        }
    }

    fn reduce_expr(&mut self, expr: &Expr, env: &Environment) -> ReduceResult<Reduced> {
        match expr {
            Expr::Number(n) => Ok(Reduced::Value(self.add_number_constant(*n)?)),
            Expr::String(s) => Ok(Reduced::Value(
                self.planner.add_constant(json!(s), OutputKind::Scalar),
            )),
            Expr::Boolean(b) => Ok(Reduced::Value(
                self.planner.add_constant(json!(b), OutputKind::Scalar),
            )),
            Expr::Identifier(name) => match env.lookup(name) {
                Some(Binding::ValueRef(id)) => Ok(Reduced::Value(id.clone())),
                Some(Binding::Closure(closure)) => Ok(Reduced::Closure(Arc::clone(closure))),
                // Identifiers that miss the environment may denote
                // zero-argument primitives; a miss there is an unbound
                // name, not an unknown operator.
                None => {
                    let spec = self
                        .resolve_primitive(name)
                        .map_err(|_| ReduceError::UnboundIdentifier(name.clone()))?;
                    self.plan_primitive_call(&spec, vec![], name)
                }
            },
            Expr::Qualified { namespace, name } => {
                let qualified = format!("{namespace}.{name}");
                let spec = self.resolve_primitive(&qualified)?;
                self.plan_primitive_call(&spec, vec![], &qualified)
            }
            Expr::App { callee, args } => self.reduce_application(callee, args, env),
            Expr::LetIn { name, rhs, body } => {
                // RHS in the outer scope; the binding shadows only inside
                // the body.
                let bound = match self.reduce_expr(rhs, env)? {
                    Reduced::Value(id) => Binding::ValueRef(id),
                    Reduced::Closure(closure) => Binding::Closure(closure),
                };
                let inner = env.bind(name.as_str(), bound);
                self.reduce_expr(body, &inner)
            }
            Expr::For { var, iter, body } => {
                let producer = self.reduce_to_value(iter, env)?;
                let closure_id = self.make_closure_node(std::slice::from_ref(var), body, env)?;
                let spec = self.resolve_primitive("default.map")?;
                let node = (spec.planner)(PrimitiveCall {
                    args: vec![producer, closure_id],
                    kwargs: vec![],
                    attrs: BTreeMap::new(),
                });
                Ok(Reduced::Value(self.planner.add_node(node)))
            }
        }
    }

    fn reduce_application(
        &mut self,
        callee: &Expr,
        args: &[Expr],
        env: &Environment,
    ) -> ReduceResult<Reduced> {
        match callee {
            Expr::Identifier(name) => match env.lookup(name) {
                Some(Binding::Closure(closure)) => {
                    let closure = Arc::clone(closure);
                    self.beta_reduce(&closure, name, args, env)
                }
                Some(Binding::ValueRef(_)) => Err(ReduceError::NotCallable(name.clone())),
                None => {
                    let spec = self.resolve_primitive(name)?;
                    let operands = self.reduce_operands(args, env)?;
                    self.plan_primitive_call(&spec, operands, name)
                }
            },
            Expr::Qualified { namespace, name } => {
                let qualified = format!("{namespace}.{name}");
                let spec = self.resolve_primitive(&qualified)?;
                let operands = self.reduce_operands(args, env)?;
                self.plan_primitive_call(&spec, operands, &qualified)
            }
            other => {
                // Callee is itself an expression; it must reduce to a
                // closure.
                match self.reduce_expr(other, env)? {
                    Reduced::Closure(closure) => {
                        self.beta_reduce(&closure, "<closure>", args, env)
                    }
                    Reduced::Value(_) => {
                        Err(ReduceError::NotCallable("<expression>".to_string()))
                    }
                }
            }
        }
    }

    /// Operands reduce left-to-right; side effects (node insertion) follow
    /// operand order.
    fn reduce_operands(
        &mut self,
        args: &[Expr],
        env: &Environment,
    ) -> ReduceResult<Vec<Reduced>> {
        args.iter()
            .map(|arg| self.reduce_expr(arg, env))
            .collect()
    }

    /// β-reduction: bind parameters in a child of the captured environment
    /// and reduce the body there. The captured snapshot means later
    /// top-level rebindings never leak in.
    fn beta_reduce(
        &mut self,
        closure: &Arc<ClosureBinding>,
        name: &str,
        args: &[Expr],
        env: &Environment,
    ) -> ReduceResult<Reduced> {
        if args.len() != closure.params.len() {
            return Err(ReduceError::ArityMismatch {
                name: name.to_string(),
                expected: format!("exactly {}", closure.params.len()),
                found: args.len(),
            });
        }
        let operands = self.reduce_operands(args, env)?;

        let mut call_env = closure.env.clone();
        if let Some(self_name) = &closure.self_name {
            call_env = call_env.bind(self_name.as_str(), Binding::Closure(Arc::clone(closure)));
        }
        for (param, operand) in closure.params.iter().zip(operands) {
            let binding = match operand {
                Reduced::Value(id) => Binding::ValueRef(id),
                Reduced::Closure(inner) => Binding::Closure(inner),
            };
            call_env = call_env.bind(param.as_str(), binding);
        }
        self.reduce_expr(&closure.body, &call_env)
    }

    fn plan_primitive_call(
        &mut self,
        spec: &Arc<PrimitiveSpec>,
        operands: Vec<Reduced>,
        name: &str,
    ) -> ReduceResult<Reduced> {
        if !spec.arity.accepts(operands.len()) {
            return Err(ReduceError::ArityMismatch {
                name: name.to_string(),
                expected: spec.arity.to_string(),
                found: operands.len(),
            });
        }
        let mut args = Vec::with_capacity(operands.len());
        for operand in operands {
            match operand {
                Reduced::Value(id) => args.push(id),
                Reduced::Closure(closure) => {
                    // Closure operand to a primitive (e.g. map): erase it
                    // into a canonical closure node.
                    args.push(self.closure_node_from_binding(&closure)?);
                }
            }
        }
        let node = (spec.planner)(PrimitiveCall {
            args,
            kwargs: vec![],
            attrs: BTreeMap::new(),
        });
        Ok(Reduced::Value(self.planner.add_node(node)))
    }

    /// Canonical closure node for a captured binding, with the closure's
    /// own name visible for recursive bodies.
    fn closure_node_from_binding(
        &mut self,
        closure: &Arc<ClosureBinding>,
    ) -> ReduceResult<NodeId> {
        let mut env = closure.env.clone();
        if let Some(self_name) = &closure.self_name {
            env = env.bind(self_name.as_str(), Binding::Closure(Arc::clone(closure)));
        }
        let params = closure.params.clone();
        let body = closure.body.clone();
        self.make_closure_node(&params, &body, &env)
    }

    fn resolve_primitive(&self, name: &str) -> ReduceResult<Arc<PrimitiveSpec>> {
        self.registry
            .resolve(name, self.planner.imported_namespaces())
            .map_err(ReduceError::from)
    }

    fn add_number_constant(&mut self, value: f64) -> ReduceResult<NodeId> {
        if !value.is_finite() {
            return Err(ReduceError::NonCanonicalAttr(format!(
                "non-finite number literal {value}"
            )));
        }
        // Integral values plan as integers; 41 and 41.0 canonicalise
        // identically either way.
        let json_value = if value.fract() == 0.0 && value.abs() < 9_007_199_254_740_992.0 {
            json!(value as i64)
        } else {
            json!(value)
        };
        Ok(self.planner.add_constant(json_value, OutputKind::Scalar))
    }

    // ------------------------------------------------------------------
    // Closure canonicalization
    // ------------------------------------------------------------------

    /// Build the canonical closure NodeSpec for a body with the given
    /// parameters: bound variables become de Bruijn levels, free value
    /// variables become node refs, free closures embed as closed
    /// sub-closures. Parameter names are renamed to `$0, $1, ...` so
    /// α-equivalent closures hash identically.
    fn make_closure_node(
        &mut self,
        params: &[String],
        body: &Expr,
        env: &Environment,
    ) -> ReduceResult<NodeId> {
        let mut ctx = CanonCtx {
            scope: params.to_vec(),
            free_vars: BTreeMap::new(),
            embedding: HashSet::new(),
        };
        let canon_body = self.canonicalize(body, env, &mut ctx)?;

        let param_names: Vec<JsonValue> = (0..params.len())
            .map(|i| json!(format!("${i}")))
            .collect();
        let free_vars: serde_json::Map<String, JsonValue> = ctx
            .free_vars
            .iter()
            .map(|(name, id)| (name.clone(), json!(id)))
            .collect();

        let mut node = NodeSpec::new(NodeKind::Closure, "closure");
        node.attrs
            .insert("params".to_string(), JsonValue::Array(param_names));
        node.attrs
            .insert("body".to_string(), canon_body.to_attr_json());
        node.attrs
            .insert("free_vars".to_string(), JsonValue::Object(free_vars));
        node.output_kind = OutputKind::Closure;
        Ok(self.planner.add_node(node))
    }

    fn canonicalize(
        &mut self,
        expr: &Expr,
        env: &Environment,
        ctx: &mut CanonCtx,
    ) -> ReduceResult<CanonExpr> {
        match expr {
            Expr::Number(n) => {
                if !n.is_finite() {
                    return Err(ReduceError::NonCanonicalAttr(format!(
                        "non-finite number literal {n}"
                    )));
                }
                Ok(CanonExpr::Num { value: *n })
            }
            Expr::String(s) => Ok(CanonExpr::Str { value: s.clone() }),
            Expr::Boolean(b) => Ok(CanonExpr::Bool { value: *b }),
            Expr::Identifier(name) => {
                if let Some(index) = ctx.scope.iter().rposition(|bound| bound == name) {
                    return Ok(CanonExpr::Param { index });
                }
                match env.lookup(name) {
                    Some(Binding::ValueRef(id)) => {
                        ctx.free_vars.insert(name.clone(), id.clone());
                        Ok(CanonExpr::Ref { id: id.clone() })
                    }
                    Some(Binding::Closure(closure)) => {
                        let closure = Arc::clone(closure);
                        self.embed_closure(&closure, name, ctx)
                    }
                    None => {
                        let spec = self
                            .resolve_primitive(name)
                            .map_err(|_| ReduceError::UnboundIdentifier(name.clone()))?;
                        self.check_canon_arity(&spec, name, 0)?;
                        Ok(CanonExpr::Prim {
                            operator: spec.qualified_name(),
                            args: vec![],
                        })
                    }
                }
            }
            Expr::Qualified { namespace, name } => {
                let qualified = format!("{namespace}.{name}");
                let spec = self.resolve_primitive(&qualified)?;
                self.check_canon_arity(&spec, &qualified, 0)?;
                Ok(CanonExpr::Prim {
                    operator: spec.qualified_name(),
                    args: vec![],
                })
            }
            Expr::App { callee, args } => {
                let canon_args: Vec<CanonExpr> = args
                    .iter()
                    .map(|arg| self.canonicalize(arg, env, ctx))
                    .collect::<ReduceResult<_>>()?;
                match callee.as_ref() {
                    Expr::Identifier(name) => {
                        if let Some(index) =
                            ctx.scope.iter().rposition(|bound| bound == name)
                        {
                            return Ok(CanonExpr::Apply {
                                callee: Box::new(CanonExpr::Param { index }),
                                args: canon_args,
                            });
                        }
                        match env.lookup(name) {
                            Some(Binding::Closure(closure)) => {
                                let closure = Arc::clone(closure);
                                if canon_args.len() != closure.params.len() {
                                    return Err(ReduceError::ArityMismatch {
                                        name: name.clone(),
                                        expected: format!(
                                            "exactly {}",
                                            closure.params.len()
                                        ),
                                        found: canon_args.len(),
                                    });
                                }
                                let embedded = self.embed_closure(&closure, name, ctx)?;
                                Ok(CanonExpr::Apply {
                                    callee: Box::new(embedded),
                                    args: canon_args,
                                })
                            }
                            Some(Binding::ValueRef(_)) => {
                                Err(ReduceError::NotCallable(name.clone()))
                            }
                            None => {
                                let spec = self.resolve_primitive(name)?;
                                self.check_canon_arity(&spec, name, canon_args.len())?;
                                Ok(CanonExpr::Prim {
                                    operator: spec.qualified_name(),
                                    args: canon_args,
                                })
                            }
                        }
                    }
                    Expr::Qualified { namespace, name } => {
                        let qualified = format!("{namespace}.{name}");
                        let spec = self.resolve_primitive(&qualified)?;
                        self.check_canon_arity(&spec, &qualified, canon_args.len())?;
                        Ok(CanonExpr::Prim {
                            operator: spec.qualified_name(),
                            args: canon_args,
                        })
                    }
                    other => {
                        let callee = self.canonicalize(other, env, ctx)?;
                        Ok(CanonExpr::Apply {
                            callee: Box::new(callee),
                            args: canon_args,
                        })
                    }
                }
            }
            Expr::LetIn { name, rhs, body } => {
                let canon_rhs = self.canonicalize(rhs, env, ctx)?;
                ctx.scope.push(name.clone());
                let canon_body = self.canonicalize(body, env, ctx);
                ctx.scope.pop();
                Ok(CanonExpr::Let {
                    rhs: Box::new(canon_rhs),
                    body: Box::new(canon_body?),
                })
            }
            Expr::For { var, iter, body } => {
                let canon_iter = self.canonicalize(iter, env, ctx)?;
                ctx.scope.push(var.clone());
                let canon_body = self.canonicalize(body, env, ctx);
                ctx.scope.pop();
                Ok(CanonExpr::For {
                    iter: Box::new(canon_iter),
                    body: Box::new(canon_body?),
                })
            }
        }
    }

    /// Embed a captured closure as a closed canonical sub-closure.
    /// Re-entrant embedding (a recursive closure captured into a for-body)
    /// cannot produce a finite term and is rejected.
    fn embed_closure(
        &mut self,
        closure: &Arc<ClosureBinding>,
        name: &str,
        ctx: &mut CanonCtx,
    ) -> ReduceResult<CanonExpr> {
        let key = Arc::as_ptr(closure) as usize;
        if !ctx.embedding.insert(key) {
            return Err(ReduceError::CycleDetected(name.to_string()));
        }

        let mut env = closure.env.clone();
        if let Some(self_name) = &closure.self_name {
            env = env.bind(self_name.as_str(), Binding::Closure(Arc::clone(closure)));
        }
        let mut inner_ctx = CanonCtx {
            scope: closure.params.clone(),
            free_vars: BTreeMap::new(),
            embedding: ctx.embedding.clone(),
        };
        let body = self.canonicalize(&closure.body, &env, &mut inner_ctx)?;

        ctx.embedding.remove(&key);
        Ok(CanonExpr::Closure {
            params: closure.params.len(),
            body: Box::new(body),
        })
    }

    fn check_canon_arity(
        &self,
        spec: &Arc<PrimitiveSpec>,
        name: &str,
        found: usize,
    ) -> ReduceResult<()> {
        if spec.arity.accepts(found) {
            Ok(())
        } else {
            Err(ReduceError::ArityMismatch {
                name: name.to_string(),
                expected: spec.arity.to_string(),
                found,
            })
        }
    }
}

struct CanonCtx {
    /// Bound names, outermost first; a name's position is its absolute
    /// de Bruijn level.
    scope: Vec<String>,
    /// Free value variables captured by id.
    free_vars: BTreeMap<String, NodeId>,
    /// Closure pointers currently being embedded (recursion guard).
    embedding: HashSet<usize>,
}

/// Defensive acyclicity check over the emitted plan. Content addressing
/// makes cycles unconstructible bottom-up, but the plan contract promises
/// a DAG, so verify before handing it out.
fn assert_acyclic(plan: &SymbolicPlan) -> ReduceResult<()> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit(
        id: &NodeId,
        plan: &SymbolicPlan,
        marks: &mut HashMap<NodeId, Mark>,
    ) -> ReduceResult<()> {
        match marks.get(id) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => return Err(ReduceError::CycleDetected(id.clone())),
            None => {}
        }
        marks.insert(id.clone(), Mark::Visiting);
        if let Some(node) = plan.nodes.get(id) {
            for operand in node.operand_ids() {
                visit(operand, plan, marks)?;
            }
        }
        marks.insert(id.clone(), Mark::Done);
        Ok(())
    }

    let mut marks = HashMap::new();
    for id in plan.nodes.keys() {
        visit(id, plan, &mut marks)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_program;

    fn reduce(source: &str) -> (SymbolicPlan, BTreeMap<String, NodeId>) {
        let registry = PrimitiveRegistry::new();
        let program = parse_program(source).expect("parse");
        reduce_program_with_bindings(&program, &registry).expect("reduce")
    }

    fn reduce_err(source: &str) -> ReduceError {
        let registry = PrimitiveRegistry::new();
        let program = parse_program(source).expect("parse");
        reduce_program_with_bindings(&program, &registry).expect_err("should fail")
    }

    #[test]
    fn test_shared_subexpressions_collapse() {
        let (plan, _) = reduce("let a = 1 + 2\nlet b = 1 + 2\nprint \"a\" a\nprint \"b\" b");
        // 1, 2 and the addition node, shared across both bindings.
        assert_eq!(plan.node_count(), 3);
        assert_eq!(plan.goals[0].id, plan.goals[1].id);
    }

    #[test]
    fn test_bindings_track_let_nodes() {
        let (plan, bindings) = reduce("let a = 1 + 2\nlet b = a + 4\nprint \"sum\" b");
        assert!(bindings.contains_key("a"));
        assert!(bindings.contains_key("b"));
        assert!(plan.nodes.contains_key(&bindings["a"]));
        assert!(plan.nodes.contains_key(&bindings["b"]));
    }

    #[test]
    fn test_function_application_beta_reduces() {
        let (plan, _) = reduce("let inc(x) = x + 1\nprint \"out\" inc(41)");
        // Nodes: 41, 1, addition(41, 1).
        assert_eq!(plan.node_count(), 3);
        let goal_node = plan.node(&plan.goals[0].id).expect("goal node");
        assert_eq!(goal_node.operator, "default.addition");
    }

    #[test]
    fn test_let_shadowing_resolves_rhs_in_outer_scope() {
        // let r = let x = 1 in let x = x + 10 in x + 5  =>  (1 + 10) + 5
        let (plan, _) = reduce("let r = let x = 1 in let x = x + 10 in x + 5\nprint \"r\" r");
        let goal = plan.node(&plan.goals[0].id).expect("goal node");
        assert_eq!(goal.operator, "default.addition");
        // The inner addition (1 + 10) must appear as the left operand.
        let left = plan.node(&goal.args[0]).expect("left operand");
        assert_eq!(left.operator, "default.addition");
    }

    #[test]
    fn test_for_desugars_to_map_with_closure() {
        let (plan, _) = reduce("let inc(x)=x+1\nprint \"out\" for x in range(0,5) do inc(x)");
        let goal = plan.node(&plan.goals[0].id).expect("goal node");
        assert_eq!(goal.operator, "default.map");
        assert_eq!(goal.args.len(), 2);
        let closure = plan.node(&goal.args[1]).expect("closure node");
        assert_eq!(closure.kind, NodeKind::Closure);
        assert_eq!(closure.output_kind, OutputKind::Closure);
        assert!(closure.attrs.contains_key("params"));
        assert!(closure.attrs.contains_key("body"));
        assert!(closure.attrs.contains_key("free_vars"));
    }

    #[test]
    fn test_alpha_equivalent_for_bodies_share_closure_node() {
        let (plan_x, _) = reduce("print \"out\" for x in range(0,5) do x + 1");
        let (plan_y, _) = reduce("print \"out\" for y in range(0,5) do y + 1");
        assert_eq!(plan_x.goals[0].id, plan_y.goals[0].id);
    }

    #[test]
    fn test_free_variables_captured_by_node_id() {
        let (plan_a, _) = reduce("let k = 7\nprint \"out\" for x in range(0,3) do x + k");
        let (plan_b, _) = reduce("let k = 7\nprint \"out\" for z in range(0,3) do z + k");
        assert_eq!(plan_a.goals[0].id, plan_b.goals[0].id);
    }

    #[test]
    fn test_unbound_identifier_fails() {
        assert!(matches!(
            reduce_err("print \"x\" nope"),
            ReduceError::UnboundIdentifier(_)
        ));
    }

    #[test]
    fn test_arity_mismatch_on_user_function() {
        assert!(matches!(
            reduce_err("let inc(x) = x + 1\nprint \"out\" inc(1, 2)"),
            ReduceError::ArityMismatch { .. }
        ));
    }

    #[test]
    fn test_arity_mismatch_on_primitive() {
        assert!(matches!(
            reduce_err("print \"out\" default.addition(1)"),
            ReduceError::ArityMismatch { .. }
        ));
    }

    #[test]
    fn test_unknown_primitive_fails() {
        assert!(matches!(
            reduce_err("print \"out\" default.nothing(1)"),
            ReduceError::UnknownPrimitive(_)
        ));
    }

    #[test]
    fn test_plan_is_acyclic_and_closed() {
        let (plan, _) = reduce(
            "let f(x) = x * 2\nlet g(x) = f(x) + f(x)\nprint \"out\" g(3)",
        );
        assert!(plan.is_closed());
        assert!(assert_acyclic(&plan).is_ok());
    }

    #[test]
    fn test_fibonacci_chain_reduces_with_sharing() {
        let mut lines = vec!["let f0 = 1".to_string(), "let f1 = 1".to_string()];
        for i in 2..=80 {
            lines.push(format!("let f{i} = f{} + f{}", i - 1, i - 2));
        }
        lines.push("print \"fib80\" f80".to_string());
        let (plan, _) = reduce(&lines.join("\n"));
        assert!(plan.node_count() >= 80);
        assert_eq!(plan.goals.len(), 1);
    }

    #[test]
    fn test_function_explosion_stays_polynomial() {
        let mut lines = vec!["let f0(x) = 1".to_string(), "let f1(x) = 1".to_string()];
        for i in 2..=8 {
            lines.push(format!(
                "let f{i}(x) = f{p}(x+1) + f{q}(x-1) + f{p}(x*2) + f{q}(x/2) + f{p}(x) + f{q}(x)",
                p = i - 1,
                q = i - 2
            ));
        }
        lines.push("print \"explosion\" f8(1)".to_string());
        let (plan, _) = reduce(&lines.join("\n"));
        // Sanity target: rich enough graph, without enforcing unstable
        // exact counts.
        assert!(plan.node_count() > 10);
        assert_eq!(plan.goals.len(), 1);
    }

    #[test]
    fn test_import_registers_namespace() {
        let (plan, _) = reduce("import \"strings\"\nprint \"s\" concat(\"a\", \"b\")");
        assert_eq!(
            plan.imported_namespaces,
            vec!["default".to_string(), "strings".to_string()]
        );
    }

    #[test]
    fn test_goal_order_preserved() {
        let (plan, _) = reduce("print \"one\" 1\nsave \"/tmp/two.json\" 2\nprint \"three\" 3");
        let names: Vec<&str> = plan.goals.iter().map(|g| g.name.as_str()).collect();
        assert_eq!(names, vec!["one", "/tmp/two.json", "three"]);
    }
}
