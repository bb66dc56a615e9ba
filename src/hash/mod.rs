//! # Canonical Hasher
//!
//! Deterministic content addressing for symbolic nodes:
//! `hash_node(n) = lower_hex(SHA256(canonical_json(payload(n))))`.
//!
//! `canonical_json` implements RFC 8785 (JSON Canonicalization Scheme):
//! object keys sorted by UTF-16 code units, minimal whitespace, JCS string
//! escaping, and ECMAScript number serialization. Independent
//! implementations of this scheme in other host languages produce identical
//! bytes, so node ids agree across processes and implementations; nothing
//! here may depend on a host JSON library's key ordering or number
//! formatting.

use crate::ir::{NodeId, NodeSpec};
use serde_json::{Map, Value as JsonValue};
use sha2::{Digest, Sha256};

/// SHA-256 of a canonical JSON rendering, as lowercase hex.
fn sha256_canonical(payload: &JsonValue) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(payload).as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Canonical hash payload of a node.
///
/// Kwargs are sorted by key; attrs rely on the canonical writer for
/// recursive key ordering.
pub fn node_payload(node: &NodeSpec) -> JsonValue {
    let kwargs: Vec<JsonValue> = node
        .normalized_kwargs()
        .into_iter()
        .map(|(k, v)| JsonValue::Array(vec![JsonValue::String(k), JsonValue::String(v)]))
        .collect();

    let mut payload = Map::new();
    payload.insert(
        "kind".to_string(),
        JsonValue::String(node.kind.as_str().to_string()),
    );
    payload.insert(
        "operator".to_string(),
        JsonValue::String(node.operator.clone()),
    );
    payload.insert(
        "args".to_string(),
        JsonValue::Array(node.args.iter().cloned().map(JsonValue::String).collect()),
    );
    payload.insert("kwargs".to_string(), JsonValue::Array(kwargs));
    payload.insert(
        "attrs".to_string(),
        JsonValue::Object(node.attrs.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
    );
    payload.insert(
        "output_kind".to_string(),
        JsonValue::String(node.output_kind.as_str().to_string()),
    );
    JsonValue::Object(payload)
}

/// Content hash of a node.
pub fn hash_node(node: &NodeSpec) -> NodeId {
    sha256_canonical(&node_payload(node))
}

/// Deterministically derive a child node id for one sequence element.
///
/// Elements of a sequence-producing node are stored as their own records
/// without changing the parent's identity.
pub fn hash_sequence_item(parent_node_id: &str, index: usize) -> NodeId {
    let mut payload = Map::new();
    payload.insert(
        "kind".to_string(),
        JsonValue::String("sequence-item-ref".to_string()),
    );
    payload.insert(
        "parent_node_id".to_string(),
        JsonValue::String(parent_node_id.to_string()),
    );
    payload.insert("index".to_string(), JsonValue::from(index as u64));
    sha256_canonical(&JsonValue::Object(payload))
}

// ============================================================================
// RFC 8785 canonical JSON
// ============================================================================

/// Serialize a JSON value to its RFC 8785 canonical form.
pub fn canonical_json(value: &JsonValue) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &JsonValue, out: &mut String) {
    match value {
        JsonValue::Null => out.push_str("null"),
        JsonValue::Bool(true) => out.push_str("true"),
        JsonValue::Bool(false) => out.push_str("false"),
        JsonValue::Number(n) => write_number(n, out),
        JsonValue::String(s) => write_string(s, out),
        JsonValue::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        JsonValue::Object(map) => {
            // RFC 8785 §3.2.3: sort property names by UTF-16 code units.
            let mut entries: Vec<(Vec<u16>, &String, &JsonValue)> = map
                .iter()
                .map(|(k, v)| (k.encode_utf16().collect(), k, v))
                .collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));

            out.push('{');
            for (i, (_, key, item)) in entries.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(key, out);
                out.push(':');
                write_canonical(item, out);
            }
            out.push('}');
        }
    }
}

/// JCS string escaping (RFC 8785 §3.2.2.2).
fn write_string(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\u{0008}' => out.push_str("\\b"),
            '\u{0009}' => out.push_str("\\t"),
            '\u{000A}' => out.push_str("\\n"),
            '\u{000C}' => out.push_str("\\f"),
            '\u{000D}' => out.push_str("\\r"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

fn write_number(n: &serde_json::Number, out: &mut String) {
    if let Some(i) = n.as_i64() {
        out.push_str(&i.to_string());
    } else if let Some(u) = n.as_u64() {
        out.push_str(&u.to_string());
    } else if let Some(f) = n.as_f64() {
        out.push_str(&format_es_number(f));
    }
}

/// ECMAScript `Number::toString` serialization (RFC 8785 §3.2.2.3).
///
/// Uses Rust's shortest round-trip formatting for the digits, then applies
/// the ECMAScript placement rules: plain decimal inside [1e-6, 1e21),
/// exponent notation with explicit `+` outside.
pub fn format_es_number(f: f64) -> String {
    debug_assert!(f.is_finite(), "non-finite numbers are not canonicalisable");
    if f == 0.0 {
        // Covers -0.0 as well.
        return "0".to_string();
    }
    if f < 0.0 {
        return format!("-{}", format_es_number(-f));
    }

    // Shortest digits via exponential formatting: "d[.ddd]e±x".
    let formatted = format!("{f:e}");
    let (mantissa, exp) = formatted
        .split_once('e')
        .unwrap_or((formatted.as_str(), "0"));
    let exp: i32 = exp.parse().unwrap_or(0);
    let digits: String = mantissa.chars().filter(|c| *c != '.').collect();
    let k = digits.len() as i32;
    // Value is 0.digits * 10^n.
    let n = exp + 1;

    if k <= n && n <= 21 {
        // Integer with trailing zeros.
        let mut s = digits;
        s.extend(std::iter::repeat('0').take((n - k) as usize));
        s
    } else if 0 < n && n <= 21 {
        let (int_part, frac_part) = digits.split_at(n as usize);
        format!("{int_part}.{frac_part}")
    } else if -6 < n && n <= 0 {
        let zeros: String = std::iter::repeat('0').take((-n) as usize).collect();
        format!("0.{zeros}{digits}")
    } else {
        // Exponent form: d[.ddd]e±(n-1), with explicit '+'.
        let exponent = n - 1;
        let sign = if exponent >= 0 { "+" } else { "-" };
        let magnitude = exponent.abs();
        if digits.len() == 1 {
            format!("{digits}e{sign}{magnitude}")
        } else {
            let (head, tail) = digits.split_at(1);
            format!("{head}.{tail}e{sign}{magnitude}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{NodeKind, OutputKind};
    use serde_json::json;

    fn node(kwargs: Vec<(&str, &str)>) -> NodeSpec {
        let mut spec = NodeSpec::new(NodeKind::Primitive, "default.test");
        spec.args = vec!["x".to_string()];
        spec.kwargs = kwargs
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        spec.output_kind = OutputKind::Scalar;
        spec
    }

    #[test]
    fn test_hash_is_deterministic() {
        let spec = node(vec![("scale", "c")]);
        assert_eq!(hash_node(&spec), hash_node(&spec));
    }

    #[test]
    fn test_hash_normalizes_kwarg_order() {
        let a = node(vec![("b", "2"), ("a", "1")]);
        let b = node(vec![("a", "1"), ("b", "2")]);
        assert_eq!(hash_node(&a), hash_node(&b));
    }

    #[test]
    fn test_hash_is_lowercase_hex_sha256() {
        let id = hash_node(&node(vec![]));
        assert_eq!(id.len(), 64);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_sequence_item_ids_differ_by_index() {
        let parent = hash_node(&node(vec![]));
        let first = hash_sequence_item(&parent, 0);
        let second = hash_sequence_item(&parent, 1);
        assert_ne!(first, second);
        assert_eq!(first, hash_sequence_item(&parent, 0));
    }

    #[test]
    fn test_canonical_json_sorts_object_keys() {
        let value = json!({"b": 2, "a": 1, "aa": 3});
        assert_eq!(canonical_json(&value), r#"{"a":1,"aa":3,"b":2}"#);
    }

    #[test]
    fn test_canonical_json_utf16_key_ordering() {
        // U+10000 (surrogate pair D800 DC00) sorts before U+FFFF in UTF-16,
        // the opposite of UTF-8 byte order.
        let value = json!({"\u{ffff}": 1, "\u{10000}": 2});
        let canonical = canonical_json(&value);
        let pos_high = canonical.find('\u{10000}').expect("key present");
        let pos_bmp = canonical.find('\u{ffff}').expect("key present");
        assert!(pos_high < pos_bmp);
    }

    #[test]
    fn test_canonical_json_escapes_control_characters() {
        let value = json!({"k": "a\nb\u{0001}c"});
        assert_eq!(canonical_json(&value), "{\"k\":\"a\\nb\\u0001c\"}");
    }

    #[test]
    fn test_es_number_integral_floats_print_as_integers() {
        assert_eq!(format_es_number(2.0), "2");
        assert_eq!(format_es_number(41.0), "41");
        assert_eq!(format_es_number(-0.0), "0");
        assert_eq!(format_es_number(1e20), "100000000000000000000");
    }

    #[test]
    fn test_es_number_fractions_and_exponents() {
        assert_eq!(format_es_number(3.14), "3.14");
        assert_eq!(format_es_number(0.5), "0.5");
        assert_eq!(format_es_number(0.000001), "0.000001");
        assert_eq!(format_es_number(1e-7), "1e-7");
        assert_eq!(format_es_number(1e21), "1e+21");
        assert_eq!(format_es_number(1.25e22), "1.25e+22");
        assert_eq!(format_es_number(-3.5), "-3.5");
    }

    #[test]
    fn test_integer_and_integral_float_payloads_agree() {
        // 41 and 41.0 must canonicalise identically so constant nodes share.
        let as_int = json!({"value": 41});
        let as_float = json!({"value": 41.0});
        assert_eq!(canonical_json(&as_int), canonical_json(&as_float));
    }

    #[test]
    fn test_rfc8785_appendix_number_samples() {
        // Spot checks from the RFC 8785 appendix table.
        assert_eq!(format_es_number(333333333.3333333), "333333333.3333333");
        assert_eq!(format_es_number(9007199254740996.0), "9007199254740996");
        assert_eq!(format_es_number(0.000035689), "0.000035689");
    }
}
