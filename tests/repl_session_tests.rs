//! REPL sessions: incremental declarations, value persistence, file
//! loading with goal skipping.

use std::sync::Arc;
use voxlogica::execution::{ExecutionEngine, Strategy};
use voxlogica::primitives::PrimitiveRegistry;
use voxlogica::repl::{ReplOutcome, ReplSession};
use voxlogica::store::MaterializationStore;
use voxlogica::value::VoxValue;

fn session_at(dir: &std::path::Path) -> ReplSession {
    let engine = ExecutionEngine::new(
        Arc::new(PrimitiveRegistry::new()),
        MaterializationStore::open(dir.join("repl_results.db")).expect("open"),
        0,
    );
    ReplSession::new(engine, Strategy::Deferred)
}

#[test]
fn test_repl_evaluates_expression_and_persists_result() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut session = session_at(dir.path());

    match session.execute_input("let inc(x)=x+1").expect("define") {
        ReplOutcome::Program(result) => {
            assert_eq!(result.declarations_added, 1);
            assert_eq!(result.goals_executed, 0);
        }
        other => panic!("expected program result, got {other:?}"),
    }

    let node_id = match session.execute_input("inc(41)").expect("evaluate") {
        ReplOutcome::Value(value) => {
            assert_eq!(value.value, VoxValue::Integer(42));
            assert!(value.persisted);
            value.node_id
        }
        other => panic!("expected value result, got {other:?}"),
    };

    let record = session.engine().store().get(&node_id).expect("record");
    assert_eq!(record.payload_json["value"], 42);
}

#[test]
fn test_repl_load_file_adds_declarations_and_skips_goals() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut session = session_at(dir.path());

    let source = dir.path().join("defs.imgql");
    std::fs::write(&source, "let inc(x)=x+1\nprint \"unused\" inc(1)\n").expect("write");

    let loaded = session.load_file(&source, false).expect("load");
    assert_eq!(loaded.declarations_added, 1);
    assert_eq!(loaded.goals_skipped, 1);
    assert_eq!(loaded.goals_executed, 0);

    match session.execute_input("inc(2)").expect("evaluate") {
        ReplOutcome::Value(value) => assert_eq!(value.value, VoxValue::Integer(3)),
        other => panic!("expected value result, got {other:?}"),
    }
}

#[test]
fn test_repl_goal_input_executes() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut session = session_at(dir.path());

    session.execute_input("let double(x) = x * 2").expect("define");
    match session
        .execute_input("print \"d\" double(21)")
        .expect("goal")
    {
        ReplOutcome::Program(result) => {
            assert_eq!(result.goals_executed, 1);
            let execution = result.execution.expect("execution result");
            assert!(execution.success);
        }
        other => panic!("expected program result, got {other:?}"),
    }
}

#[test]
fn test_repl_results_survive_sessions() {
    let dir = tempfile::tempdir().expect("tempdir");
    let node_id = {
        let mut session = session_at(dir.path());
        session.execute_input("let inc(x)=x+1").expect("define");
        match session.execute_input("inc(41)").expect("evaluate") {
            ReplOutcome::Value(value) => {
                session.engine().store().close();
                value.node_id
            }
            other => panic!("expected value result, got {other:?}"),
        }
    };

    // A fresh session over the same store file sees the cached record.
    let session = session_at(dir.path());
    assert!(session.engine().store().has(&node_id));
}
