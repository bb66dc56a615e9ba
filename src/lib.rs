//! # VoxLogicA
//!
//! Interpreter for a small declarative image-analysis language. Source
//! programs declare let bindings, (possibly recursive or higher-order)
//! function definitions, for-comprehensions over lazy sequences, and
//! imperative goals (`print`, `save`).
//!
//! ## Pipeline Architecture
//!
//! ```text
//! VoxLogicA Source Code
//!     ↓
//! [Parser]            → AST (declarations + goals)
//!     ↓
//! [Reducer]           → SymbolicPlan (content-addressed dataflow graph)
//!     │                  environments, closures, for-loop desugaring;
//!     │                  consults the primitive registry for planners
//!     ↓
//! [Engine.compile]    → PreparedPlan (strategy-specific)
//!     ↓
//! [run / stream / page]
//!     ↓
//! Results              (every value passing through the result store)
//! ```
//!
//! Node identities are SHA-256 hashes of canonical (RFC 8785) payloads, so
//! semantically equivalent subexpressions collapse to one node within a
//! plan — and to one persisted record across processes. Any node computed
//! once is never recomputed while the store holds its record.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use voxlogica::execution::{ExecutionEngine, Strategy};
//! use voxlogica::parser::parse_program;
//! use voxlogica::primitives::PrimitiveRegistry;
//! use voxlogica::reducer::reduce_program;
//! use voxlogica::store::MaterializationStore;
//!
//! let program = parse_program(
//!     "let inc(x) = x + 1\nprint \"out\" for x in range(0, 5) do inc(x)",
//! )?;
//! let registry = Arc::new(PrimitiveRegistry::new());
//! let plan = reduce_program(&program, &registry)?;
//!
//! let store = MaterializationStore::open("results.db")?;
//! let engine = ExecutionEngine::new(registry, store, 0);
//! let result = engine.execute_workplan(&plan, Strategy::Deferred);
//! assert!(result.success);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Module Organization
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `parser` | Source → AST |
//! | `ast` | Surface syntax tree |
//! | `reducer` | AST → symbolic plan |
//! | `hash` | Canonical (RFC 8785) hashing |
//! | `ir` | NodeSpec / GoalSpec / SymbolicPlan |
//! | `primitives` | Registry, planners, kernels |
//! | `value` | Runtime values + lazy sequences |
//! | `pod` | voxpod/1 storage codec |
//! | `store` | Content-addressed persistent results |
//! | `execution` | Engine façade + strict/deferred strategies |
//! | `repl` | Interactive sessions |
//! | `config` | Configuration system |

pub mod ast;
pub mod config;
pub mod execution;
pub mod hash;
pub mod ir;
pub mod parser;
pub mod pod;
pub mod primitives;
pub mod reducer;
pub mod repl;
pub mod store;
pub mod value;

// Re-export the main pipeline types for convenience
pub use ast::{Declaration, Expr, Goal, Program};
pub use config::Config;
pub use execution::{
    CacheSummary, ExecutionEngine, ExecutionResult, NodeEvent, PageResult, PreparedPlan,
    Strategy,
};
pub use hash::{hash_node, hash_sequence_item};
pub use ir::{GoalSpec, NodeId, NodeSpec, OutputKind, SymbolicPlan};
pub use parser::parse_program;
pub use primitives::{PrimitiveRegistry, PrimitiveSpec};
pub use reducer::{reduce_program, reduce_program_with_bindings, ReduceError};
pub use repl::ReplSession;
pub use store::{MaterializationStore, ResultRecord, SqliteResultsDatabase};
pub use value::{SequenceValue, VoxValue};
