//! End-to-end engine scenarios: goal execution, pagination, streaming,
//! save output, persistent memoization across engine instances.

use std::path::Path;
use std::sync::Arc;
use voxlogica::execution::{ExecutionEngine, Strategy};
use voxlogica::parser::parse_program;
use voxlogica::primitives::PrimitiveRegistry;
use voxlogica::reducer::reduce_program;
use voxlogica::store::MaterializationStore;
use voxlogica::value::VoxValue;
use voxlogica::SymbolicPlan;

fn engine_at(db_path: &Path) -> ExecutionEngine {
    ExecutionEngine::new(
        Arc::new(PrimitiveRegistry::new()),
        MaterializationStore::open(db_path).expect("open store"),
        2,
    )
}

fn plan_for(engine: &ExecutionEngine, source: &str) -> SymbolicPlan {
    let program = parse_program(source).expect("parse");
    reduce_program(&program, engine.registry()).expect("reduce")
}

fn integers(items: &[VoxValue]) -> Vec<i64> {
    items
        .iter()
        .map(|item| match item {
            VoxValue::Integer(i) => *i,
            VoxValue::Number(n) => *n as i64,
            other => panic!("expected number, got {other:?}"),
        })
        .collect()
}

#[test]
fn test_function_application_value() {
    // let inc(x)=x+1 ; inc(41) == 42
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine_at(&dir.path().join("results.db"));
    let plan = plan_for(&engine, "let inc(x)=x+1\nprint \"v\" inc(41)");
    let prepared = engine.compile_plan(&plan, Strategy::Deferred);
    let value = engine
        .evaluate_node(&prepared, &plan.goals[0].id)
        .expect("evaluate");
    assert_eq!(value, VoxValue::Integer(42));
}

#[test]
fn test_for_loop_pages_mapped_values() {
    // page(goal, 0, 10) == [1, 2, 3, 4, 5]
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine_at(&dir.path().join("results.db"));
    let plan = plan_for(
        &engine,
        "let inc(x)=x+1\nprint \"out\" for x in range(0,5) do inc(x)",
    );
    let prepared = engine.compile_plan(&plan, Strategy::Deferred);
    let page = engine
        .page(&prepared, &plan.goals[0].id, 0, 10)
        .expect("page");
    assert_eq!(integers(&page.items), vec![1, 2, 3, 4, 5]);
    assert!(!page.has_more);
}

#[test]
fn test_qualified_addition_pages_scalar() {
    // page(goal, 0, 1) == [5]
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine_at(&dir.path().join("results.db"));
    let plan = plan_for(&engine, "print \"sum\" default.addition(2,3)");
    let prepared = engine.compile_plan(&plan, Strategy::Strict);
    let page = engine
        .page(&prepared, &plan.goals[0].id, 0, 1)
        .expect("page");
    assert_eq!(integers(&page.items), vec![5]);
}

#[test]
fn test_nested_let_shadowing_evaluates() {
    // let r = let x = 1 in let x = x + 10 in x + 5  ==  16
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine_at(&dir.path().join("results.db"));
    let plan = plan_for(
        &engine,
        "let result = let x = 1 in let x = x + 10 in x + 5\nprint \"result\" result",
    );
    let prepared = engine.compile_plan(&plan, Strategy::Deferred);
    let page = engine
        .page(&prepared, &plan.goals[0].id, 0, 1)
        .expect("page");
    assert_eq!(integers(&page.items), vec![16]);
}

#[test]
fn test_let_expression_scope_does_not_leak() {
    // outer=5, result=(5+1)+2, final=5+8 == 13
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine_at(&dir.path().join("results.db"));
    let plan = plan_for(
        &engine,
        "let outer = 5\nlet result = let x = outer + 1 in x + 2\nlet final = outer + result\nprint \"final\" final",
    );
    let prepared = engine.compile_plan(&plan, Strategy::Deferred);
    let page = engine
        .page(&prepared, &plan.goals[0].id, 0, 1)
        .expect("page");
    assert_eq!(integers(&page.items), vec![13]);
}

#[test]
fn test_save_goal_writes_json_array() {
    let dir = tempfile::tempdir().expect("tempdir");
    let output = dir.path().join("out.json");
    let engine = engine_at(&dir.path().join("results.db"));
    let plan = plan_for(
        &engine,
        &format!(
            "save \"{}\" for x in range(0,3) do x+1",
            output.display()
        ),
    );
    let result = engine.execute_workplan(&plan, Strategy::Deferred);
    assert!(result.success, "failures: {:?}", result.failures);

    let payload: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&output).expect("read output"))
            .expect("json");
    assert_eq!(payload, serde_json::json!([1, 2, 3]));
}

#[test]
fn test_second_run_hits_store_with_no_recomputation() {
    // Two independent runs over a shared store: run 2 must be fully
    // cache-driven for non-effect nodes.
    let dir = tempfile::tempdir().expect("tempdir");
    let db = dir.path().join("results.db");
    let source = "let inc(x)=x+1\nprint \"out\" for x in range(0,5) do inc(x)";

    {
        let engine = engine_at(&db);
        let plan = plan_for(&engine, source);
        let prepared = engine.compile_plan(&plan, Strategy::Deferred);
        let first = engine.run(&prepared);
        assert!(first.success);
        assert!(first.cache_summary.computed > 0);
        // Materialize the elements so their records persist.
        engine
            .page(&prepared, &plan.goals[0].id, 0, 10)
            .expect("page");
        engine.store().close();
    }

    let engine = engine_at(&db);
    let plan = plan_for(&engine, source);
    let prepared = engine.compile_plan(&plan, Strategy::Deferred);
    let second = engine.run(&prepared);
    assert!(second.success);
    assert!(second.cache_summary.cached_store > 0);
    assert_eq!(second.cache_summary.computed, 0);
    assert!(second
        .node_events
        .iter()
        .any(|event| event.status.as_str() == "cached"));

    // And the paged elements come straight from the store.
    let page = engine
        .page(&prepared, &plan.goals[0].id, 0, 10)
        .expect("page");
    assert_eq!(integers(&page.items), vec![1, 2, 3, 4, 5]);
}

#[test]
fn test_stream_chunks_lazy_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let dataset = dir.path().join("rows.txt");
    std::fs::write(&dataset, "alpha\nbeta\ngamma\ndelta\nepsilon\n").expect("write dataset");

    let engine = engine_at(&dir.path().join("results.db"));
    let plan = plan_for(
        &engine,
        &format!("print \"rows\" load(\"{}\")", dataset.display()),
    );
    let prepared = engine.compile_plan(&plan, Strategy::Deferred);

    let chunks: Vec<Vec<VoxValue>> = engine
        .stream(&prepared, &plan.goals[0].id, 2)
        .expect("stream")
        .take(2)
        .collect::<Result<_, _>>()
        .expect("chunks");
    assert_eq!(
        chunks,
        vec![
            vec![
                VoxValue::Text("alpha".to_string()),
                VoxValue::Text("beta".to_string())
            ],
            vec![
                VoxValue::Text("gamma".to_string()),
                VoxValue::Text("delta".to_string())
            ],
        ]
    );

    let page = engine
        .page(&prepared, &plan.goals[0].id, 1, 2)
        .expect("page");
    assert_eq!(
        page.items,
        vec![
            VoxValue::Text("beta".to_string()),
            VoxValue::Text("gamma".to_string())
        ]
    );
    assert!(page.has_more);
}

#[test]
fn test_page_head_of_large_file() {
    // Paging the head of a 10k-line file must return promptly with just
    // the requested rows.
    let dir = tempfile::tempdir().expect("tempdir");
    let dataset = dir.path().join("large.txt");
    let body: String = (0..10_000).map(|i| format!("{i}\n")).collect();
    std::fs::write(&dataset, body).expect("write dataset");

    let engine = engine_at(&dir.path().join("results.db"));
    let plan = plan_for(
        &engine,
        &format!("print \"rows\" load(\"{}\")", dataset.display()),
    );
    let prepared = engine.compile_plan(&plan, Strategy::Deferred);
    let page = engine
        .page(&prepared, &plan.goals[0].id, 0, 5)
        .expect("page");
    assert_eq!(
        page.items,
        (0..5)
            .map(|i| VoxValue::Text(i.to_string()))
            .collect::<Vec<_>>()
    );
    assert!(page.has_more);
}

#[test]
fn test_kernel_failure_is_reported_and_other_goals_proceed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine_at(&dir.path().join("results.db"));
    let plan = plan_for(
        &engine,
        "print \"bad\" 1 / 0\nprint \"good\" 2 + 2",
    );
    let result = engine.execute_workplan(&plan, Strategy::Strict);
    assert!(!result.success);
    assert_eq!(result.failures.len(), 1);
    assert_eq!(result.failures[0].goal.name, "bad");
    assert!(result.failures[0].error.contains("Division by zero"));
    assert!(result.cache_summary.failed > 0);
}

#[test]
fn test_cancellation_drops_pending_goals() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine_at(&dir.path().join("results.db"));
    let plan = plan_for(&engine, "print \"a\" 1 + 1\nprint \"b\" 2 + 2");
    let prepared = engine.compile_plan(&plan, Strategy::Deferred);

    engine.cancel();
    let result = engine.run(&prepared);
    assert!(!result.success);
    assert_eq!(result.failures.len(), 2);
    for failure in &result.failures {
        assert!(failure.error.contains("cancelled"));
    }

    engine.reset_cancel();
    let prepared = engine.compile_plan(&plan, Strategy::Deferred);
    assert!(engine.run(&prepared).success);
}

#[test]
fn test_structured_demo_payload_roundtrips() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine_at(&dir.path().join("results.db"));
    let plan = plan_for(&engine, "print \"demo\" test.demo_data()");
    let prepared = engine.compile_plan(&plan, Strategy::Strict);
    let value = engine
        .evaluate_node(&prepared, &plan.goals[0].id)
        .expect("evaluate");
    assert_eq!(value.vox_type(), "json");
}

#[test]
fn test_strings_namespace_via_import() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine_at(&dir.path().join("results.db"));
    let plan = plan_for(
        &engine,
        "import \"strings\"\nprint \"s\" format_string(\"x_{:03d}\", 7)",
    );
    let prepared = engine.compile_plan(&plan, Strategy::Deferred);
    let value = engine
        .evaluate_node(&prepared, &plan.goals[0].id)
        .expect("evaluate");
    assert_eq!(value, VoxValue::Text("x_007".to_string()));
}

#[test]
fn test_nested_for_loop_execution() {
    // for x in range(0,3) do for y in range(0,2) do x + y
    // Outer elements are sequences; page the outer, then check one inner.
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine_at(&dir.path().join("results.db"));
    let plan = plan_for(
        &engine,
        "print \"grid\" for x in range(0,3) do for y in range(0,2) do x + y",
    );
    let prepared = engine.compile_plan(&plan, Strategy::Deferred);
    let page = engine
        .page(&prepared, &plan.goals[0].id, 0, 10)
        .expect("page");
    assert_eq!(page.items.len(), 3);
    let inner = page.items[2].as_sequence().expect("inner sequence");
    assert_eq!(
        integers(&inner.take(10).expect("take")),
        vec![2, 3]
    );
}
