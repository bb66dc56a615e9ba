//! Canonical hashing: determinism, kwarg/attr order independence, RFC 8785
//! number and key-ordering behavior, and sequence-item id derivation.

use proptest::prelude::*;
use serde_json::json;
use std::collections::BTreeMap;
use voxlogica::hash::{canonical_json, format_es_number, hash_node, hash_sequence_item};
use voxlogica::ir::{NodeKind, NodeSpec, OutputKind};

fn primitive_node(
    operator: &str,
    args: Vec<&str>,
    kwargs: Vec<(&str, &str)>,
    attrs: BTreeMap<String, serde_json::Value>,
) -> NodeSpec {
    let mut node = NodeSpec::new(NodeKind::Primitive, operator);
    node.args = args.into_iter().map(str::to_string).collect();
    node.kwargs = kwargs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    node.attrs = attrs;
    node.output_kind = OutputKind::Scalar;
    node
}

#[test]
fn test_hash_determinism_for_identical_nodes() {
    let mut attrs = BTreeMap::new();
    attrs.insert("flag".to_string(), json!(true));
    let node = primitive_node(
        "default.addition",
        vec!["a", "b"],
        vec![("scale", "c")],
        attrs,
    );
    assert_eq!(hash_node(&node), hash_node(&node));
}

#[test]
fn test_hash_normalizes_kwarg_order() {
    let a = primitive_node(
        "default.test",
        vec!["x"],
        vec![("b", "2"), ("a", "1")],
        BTreeMap::new(),
    );
    let b = primitive_node(
        "default.test",
        vec!["x"],
        vec![("a", "1"), ("b", "2")],
        BTreeMap::new(),
    );
    assert_eq!(hash_node(&a), hash_node(&b));
}

#[test]
fn test_hash_distinguishes_argument_order() {
    let ab = primitive_node("default.test", vec!["a", "b"], vec![], BTreeMap::new());
    let ba = primitive_node("default.test", vec!["b", "a"], vec![], BTreeMap::new());
    assert_ne!(hash_node(&ab), hash_node(&ba));
}

#[test]
fn test_hash_distinguishes_output_kind() {
    let mut scalar = primitive_node("default.test", vec![], vec![], BTreeMap::new());
    scalar.output_kind = OutputKind::Scalar;
    let mut sequence = scalar.clone();
    sequence.output_kind = OutputKind::Sequence;
    assert_ne!(hash_node(&scalar), hash_node(&sequence));
}

#[test]
fn test_sequence_item_ids_are_stable_and_distinct() {
    let parent = "a".repeat(64);
    assert_eq!(
        hash_sequence_item(&parent, 3),
        hash_sequence_item(&parent, 3)
    );
    assert_ne!(
        hash_sequence_item(&parent, 3),
        hash_sequence_item(&parent, 4)
    );
    assert_ne!(
        hash_sequence_item(&parent, 0),
        hash_sequence_item(&"b".repeat(64), 0)
    );
}

#[test]
fn test_canonical_json_cross_impl_vector() {
    // Canonicalisation must not depend on insertion order or on
    // integral-float vs integer representations: two differently-built
    // documents with the same meaning encode identically.
    let first = json!({
        "operations": [
            {"operator": 3.14, "arguments": []},
            {"operator": 2.0, "arguments": []},
        ],
        "goals": [{"type": "print", "name": "area", "operation_id": 3}],
    });
    let second = json!({
        "goals": [{"operation_id": 3, "name": "area", "type": "print"}],
        "operations": [
            {"arguments": [], "operator": 3.14},
            {"arguments": [], "operator": 2},
        ],
    });
    assert_eq!(canonical_json(&first), canonical_json(&second));
    assert_eq!(
        canonical_json(&json!({"operator": 2.0})),
        r#"{"operator":2}"#
    );
}

#[test]
fn test_es_number_rfc8785_samples() {
    assert_eq!(format_es_number(0.0), "0");
    assert_eq!(format_es_number(-0.0), "0");
    assert_eq!(format_es_number(1.0), "1");
    assert_eq!(format_es_number(9.5), "9.5");
    assert_eq!(format_es_number(1e21), "1e+21");
    assert_eq!(format_es_number(0.00001), "0.00001");
    assert_eq!(format_es_number(1e-7), "1e-7");
    assert_eq!(format_es_number(-2.5e-8), "-2.5e-8");
}

proptest! {
    #[test]
    fn prop_hash_stable_for_same_attrs(
        attrs in proptest::collection::btree_map("[a-z]{1,4}", 0u32..100, 0..4)
    ) {
        let attrs: BTreeMap<String, serde_json::Value> = attrs
            .into_iter()
            .map(|(k, v)| (k, json!(v)))
            .collect();
        let node = primitive_node("default.test", vec!["a"], vec![], attrs);
        prop_assert_eq!(hash_node(&node), hash_node(&node));
    }

    #[test]
    fn prop_hash_is_lowercase_hex(operator in "[a-z.]{1,16}") {
        let node = primitive_node(&operator, vec![], vec![], BTreeMap::new());
        let id = hash_node(&node);
        prop_assert_eq!(id.len(), 64);
        prop_assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn prop_integral_floats_canonicalise_as_integers(v in -1_000_000i64..1_000_000) {
        let as_int = json!({ "value": v });
        let as_float = json!({ "value": v as f64 });
        prop_assert_eq!(canonical_json(&as_int), canonical_json(&as_float));
    }
}
