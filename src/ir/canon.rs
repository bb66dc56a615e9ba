//! Canonical closure bodies.
//!
//! The body AST stored inside a closure NodeSpec's attrs. Bound variables
//! are de Bruijn-renamed (levels counted from the closure's first
//! parameter), free variables are resolved: value references become
//! explicit node refs, closure references are embedded as closed canonical
//! sub-closures. Two textually different but semantically identical
//! closures therefore canonicalise, and hash, identically.

use super::NodeId;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Canonical expression form. Serialises to the JSON stored in closure
/// attrs; deserialised again when a strategy applies the closure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CanonExpr {
    /// Numeric literal.
    Num { value: f64 },
    /// String literal.
    Str { value: String },
    /// Boolean literal.
    Bool { value: bool },
    /// Bound variable by level: the closure's parameters occupy levels
    /// `0..params`, interior `let`/`for` bindings stack above them.
    Param { index: usize },
    /// Free variable resolved to a node at reduce time.
    Ref { id: NodeId },
    /// Free closure embedded as a closed term.
    Closure { params: usize, body: Box<CanonExpr> },
    /// Primitive call, operator fully qualified.
    Prim {
        operator: String,
        args: Vec<CanonExpr>,
    },
    /// Application of a closure-valued callee (param or embedded closure).
    Apply {
        callee: Box<CanonExpr>,
        args: Vec<CanonExpr>,
    },
    /// Scoped binding; `rhs` is bound at the next level inside `body`.
    Let {
        rhs: Box<CanonExpr>,
        body: Box<CanonExpr>,
    },
    /// For comprehension; the loop variable is bound at the next level
    /// inside `body`.
    For {
        iter: Box<CanonExpr>,
        body: Box<CanonExpr>,
    },
}

impl CanonExpr {
    /// Serialise to the JSON value stored in closure attrs.
    pub fn to_attr_json(&self) -> JsonValue {
        serde_json::to_value(self).unwrap_or(JsonValue::Null)
    }

    /// Parse back from closure attrs.
    pub fn from_attr_json(value: &JsonValue) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }

    /// Close a body over its first `bound.len()` levels by substituting
    /// closed terms (node refs, or embedded closures for closure-valued
    /// bindings), shifting the remaining levels down uniformly. Levels are
    /// absolute, so interior binders (which always sit above the captured
    /// prefix) shift with everything else. Used when a nested `for` inside
    /// an applied closure mints its own closure node at run time.
    pub fn close_over(&self, bound: &[CanonExpr]) -> CanonExpr {
        match self {
            CanonExpr::Param { index } => {
                if *index < bound.len() {
                    bound[*index].clone()
                } else {
                    CanonExpr::Param {
                        index: *index - bound.len(),
                    }
                }
            }
            CanonExpr::Num { .. }
            | CanonExpr::Str { .. }
            | CanonExpr::Bool { .. }
            | CanonExpr::Ref { .. } => self.clone(),
            // Embedded closures are closed terms with their own level base;
            // never substitute inside them.
            CanonExpr::Closure { .. } => self.clone(),
            CanonExpr::Prim { operator, args } => CanonExpr::Prim {
                operator: operator.clone(),
                args: args.iter().map(|a| a.close_over(bound)).collect(),
            },
            CanonExpr::Apply { callee, args } => CanonExpr::Apply {
                callee: Box::new(callee.close_over(bound)),
                args: args.iter().map(|a| a.close_over(bound)).collect(),
            },
            CanonExpr::Let { rhs, body } => CanonExpr::Let {
                rhs: Box::new(rhs.close_over(bound)),
                body: Box::new(body.close_over(bound)),
            },
            CanonExpr::For { iter, body } => CanonExpr::For {
                iter: Box::new(iter.close_over(bound)),
                body: Box::new(body.close_over(bound)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attr_json_roundtrip() {
        let body = CanonExpr::Prim {
            operator: "default.addition".to_string(),
            args: vec![
                CanonExpr::Param { index: 0 },
                CanonExpr::Num { value: 1.0 },
            ],
        };
        let json = body.to_attr_json();
        assert_eq!(CanonExpr::from_attr_json(&json), Some(body));
    }

    #[test]
    fn test_close_over_substitutes_and_relevels() {
        // Body of an inner closure: Param(0) = outer binding, Param(1) = own.
        let body = CanonExpr::Prim {
            operator: "default.addition".to_string(),
            args: vec![
                CanonExpr::Param { index: 0 },
                CanonExpr::Param { index: 1 },
            ],
        };
        let closed = body.close_over(&[CanonExpr::Ref {
            id: "abc123".to_string(),
        }]);
        assert_eq!(
            closed,
            CanonExpr::Prim {
                operator: "default.addition".to_string(),
                args: vec![
                    CanonExpr::Ref {
                        id: "abc123".to_string()
                    },
                    CanonExpr::Param { index: 0 },
                ],
            }
        );
    }

    #[test]
    fn test_close_over_respects_interior_scopes() {
        // let y = Param(0) in y  -- with Param(0) captured, the interior
        // let-bound level must stay a Param.
        let body = CanonExpr::Let {
            rhs: Box::new(CanonExpr::Param { index: 0 }),
            body: Box::new(CanonExpr::Param { index: 1 }),
        };
        let closed = body.close_over(&[CanonExpr::Ref {
            id: "outer".to_string(),
        }]);
        assert_eq!(
            closed,
            CanonExpr::Let {
                rhs: Box::new(CanonExpr::Ref {
                    id: "outer".to_string()
                }),
                body: Box::new(CanonExpr::Param { index: 0 }),
            }
        );
    }
}
