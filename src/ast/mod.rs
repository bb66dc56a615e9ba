//! # Surface AST
//!
//! Abstract syntax tree for VoxLogicA source programs. Produced by the
//! [`crate::parser`] module and consumed by the [`crate::reducer`].
//!
//! A program is a sequence of declarations (let bindings, function
//! definitions, namespace imports) followed by goals (`print` / `save`).

use serde::{Deserialize, Serialize};

// ============================================================================
// Core AST Types
// ============================================================================

/// An expression in the source language.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    /// Numeric literal. All surface numbers parse to `f64`; integral values
    /// are narrowed back to integers at constant-planning time.
    Number(f64),
    /// String literal (without surrounding quotes).
    String(String),
    /// Boolean literal.
    Boolean(bool),
    /// Identifier reference, resolved through the reducer environment.
    Identifier(String),
    /// Namespace-qualified primitive reference, e.g. `default.addition`.
    Qualified { namespace: String, name: String },
    /// Application `f(e1, ..., en)`.
    App { callee: Box<Expr>, args: Vec<Expr> },
    /// Scoped let expression `let x = rhs in body`.
    LetIn {
        name: String,
        rhs: Box<Expr>,
        body: Box<Expr>,
    },
    /// For comprehension `for var in iter do body`.
    For {
        var: String,
        iter: Box<Expr>,
        body: Box<Expr>,
    },
}

impl Expr {
    /// Application with an identifier callee, the most common shape.
    pub fn call(name: &str, args: Vec<Expr>) -> Self {
        Expr::App {
            callee: Box::new(Expr::Identifier(name.to_string())),
            args,
        }
    }

    /// Qualified reference helper.
    pub fn qualified(namespace: &str, name: &str) -> Self {
        Expr::Qualified {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

/// Top-level declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Declaration {
    /// `let name = rhs` (value) or `let name(p1, ..., pn) = rhs` (function).
    Let {
        name: String,
        params: Vec<String>,
        rhs: Expr,
    },
    /// `import "namespace"`.
    Import { namespace: String },
}

impl Declaration {
    /// Whether this declaration defines a function (has parameters).
    pub fn is_function(&self) -> bool {
        matches!(self, Declaration::Let { params, .. } if !params.is_empty())
    }
}

/// Imperative goal attached to an expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Goal {
    /// `print "label" expr`
    Print { label: String, expr: Expr },
    /// `save "path" expr`
    Save { path: String, expr: Expr },
}

impl Goal {
    /// The expression this goal materializes.
    pub fn expr(&self) -> &Expr {
        match self {
            Goal::Print { expr, .. } | Goal::Save { expr, .. } => expr,
        }
    }
}

/// A parsed program: declarations first, then goals, in source order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub declarations: Vec<Declaration>,
    pub goals: Vec<Goal>,
}

impl Program {
    pub fn new() -> Self {
        Program::default()
    }

    pub fn add_declaration(&mut self, declaration: Declaration) {
        self.declarations.push(declaration);
    }

    pub fn add_goal(&mut self, goal: Goal) {
        self.goals.push(goal);
    }

    /// True when the program carries neither declarations nor goals.
    pub fn is_empty(&self) -> bool {
        self.declarations.is_empty() && self.goals.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_helper_builds_application() {
        let expr = Expr::call("inc", vec![Expr::Number(41.0)]);
        match expr {
            Expr::App { callee, args } => {
                assert_eq!(*callee, Expr::Identifier("inc".to_string()));
                assert_eq!(args, vec![Expr::Number(41.0)]);
            }
            other => panic!("expected App, got {other:?}"),
        }
    }

    #[test]
    fn test_declaration_is_function() {
        let value = Declaration::Let {
            name: "x".to_string(),
            params: vec![],
            rhs: Expr::Number(1.0),
        };
        let function = Declaration::Let {
            name: "f".to_string(),
            params: vec!["x".to_string()],
            rhs: Expr::Identifier("x".to_string()),
        };
        assert!(!value.is_function());
        assert!(function.is_function());
    }

    #[test]
    fn test_goal_expr_accessor() {
        let goal = Goal::Print {
            label: "out".to_string(),
            expr: Expr::Number(1.0),
        };
        assert_eq!(goal.expr(), &Expr::Number(1.0));
    }
}
