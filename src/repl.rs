//! # REPL Session
//!
//! Incremental evaluation against a persistent store: declarations
//! accumulate across inputs, expressions evaluate immediately and their
//! results persist under their node ids, so a value computed in one
//! session is a cache hit in the next.

use crate::ast::{Declaration, Program};
use crate::execution::{ExecError, ExecutionEngine, ExecutionResult, Strategy};
use crate::ir::NodeId;
use crate::parser::{parse_expression, parse_program, ParseError};
use crate::reducer::{Environment, ReduceError, Reducer};
use crate::value::VoxValue;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// REPL-level errors.
#[derive(Error, Debug)]
pub enum ReplError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Reduce(#[from] ReduceError),

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ReplResult<T> = Result<T, ReplError>;

/// Result of feeding declarations (and possibly goals) into the session.
#[derive(Debug, Clone, Default)]
pub struct ReplProgramResult {
    pub declarations_added: usize,
    pub goals_executed: usize,
    pub execution: Option<ExecutionResult>,
}

/// Result of evaluating a bare expression.
#[derive(Debug, Clone)]
pub struct ReplValue {
    pub value: VoxValue,
    pub node_id: NodeId,
    pub persisted: bool,
}

/// Result of loading a source file into the session.
#[derive(Debug, Clone, Default)]
pub struct LoadResult {
    pub declarations_added: usize,
    pub goals_executed: usize,
    pub goals_skipped: usize,
}

/// Outcome of one REPL input.
#[derive(Debug, Clone)]
pub enum ReplOutcome {
    Program(ReplProgramResult),
    Value(ReplValue),
}

/// Interactive session state: accumulated declarations plus the engine.
pub struct ReplSession {
    engine: ExecutionEngine,
    strategy: Strategy,
    declarations: Vec<Declaration>,
}

impl ReplSession {
    pub fn new(engine: ExecutionEngine, strategy: Strategy) -> Self {
        ReplSession {
            engine,
            strategy,
            declarations: Vec::new(),
        }
    }

    pub fn engine(&self) -> &ExecutionEngine {
        &self.engine
    }

    pub fn declaration_count(&self) -> usize {
        self.declarations.len()
    }

    /// Evaluate one line of input: declarations extend the session,
    /// goals execute, bare expressions evaluate to a value.
    pub fn execute_input(&mut self, input: &str) -> ReplResult<ReplOutcome> {
        match parse_program(input) {
            Ok(program) if !program.is_empty() => {
                let declarations_added = program.declarations.len();
                self.declarations.extend(program.declarations.iter().cloned());

                if program.goals.is_empty() {
                    Ok(ReplOutcome::Program(ReplProgramResult {
                        declarations_added,
                        goals_executed: 0,
                        execution: None,
                    }))
                } else {
                    let goals_executed = program.goals.len();
                    let full = Program {
                        declarations: self.declarations.clone(),
                        goals: program.goals,
                    };
                    let plan =
                        crate::reducer::reduce_program(&full, self.engine.registry())?;
                    let execution = self.engine.execute_workplan(&plan, self.strategy);
                    Ok(ReplOutcome::Program(ReplProgramResult {
                        declarations_added,
                        goals_executed,
                        execution: Some(execution),
                    }))
                }
            }
            Ok(_) => Ok(ReplOutcome::Program(ReplProgramResult::default())),
            // Not a program: try a bare expression.
            Err(program_err) => match parse_expression(input) {
                Ok(expr) => {
                    let mut reducer = Reducer::new(self.engine.registry());
                    let env = reducer
                        .reduce_declarations(&self.declarations, Environment::new())?;
                    let node_id = reducer.reduce_to_value(&expr, &env)?;
                    let plan = reducer.finish()?;

                    let prepared = self.engine.compile_plan(&plan, self.strategy);
                    let value = self.engine.evaluate_node(&prepared, &node_id)?;
                    self.engine.store().flush(Duration::from_secs(10));
                    let persisted = self.engine.store().has(&node_id);
                    Ok(ReplOutcome::Value(ReplValue {
                        value,
                        node_id,
                        persisted,
                    }))
                }
                Err(_) => Err(ReplError::Parse(program_err)),
            },
        }
    }

    /// Load a source file: declarations always join the session; goals
    /// execute only when `execute_goals` is set.
    pub fn load_file(&mut self, path: impl AsRef<Path>, execute_goals: bool) -> ReplResult<LoadResult> {
        let source = std::fs::read_to_string(path)?;
        let program = parse_program(&source)?;
        let declarations_added = program.declarations.len();
        self.declarations.extend(program.declarations.iter().cloned());

        if execute_goals && !program.goals.is_empty() {
            let goals_executed = program.goals.len();
            let full = Program {
                declarations: self.declarations.clone(),
                goals: program.goals,
            };
            let plan = crate::reducer::reduce_program(&full, self.engine.registry())?;
            self.engine.execute_workplan(&plan, self.strategy);
            Ok(LoadResult {
                declarations_added,
                goals_executed,
                goals_skipped: 0,
            })
        } else {
            Ok(LoadResult {
                declarations_added,
                goals_executed: 0,
                goals_skipped: program.goals.len(),
            })
        }
    }
}
