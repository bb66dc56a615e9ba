//! # Runtime Value System
//!
//! Core runtime values flowing between kernels, the result store and the
//! execution strategies: scalars, raw bytes, structured JSON, dense arrays,
//! medical-style images (array + geometry), lazy sequences, and first-class
//! closure handles (reducer-time only, never persisted).
//!
//! ## Usage
//!
//! ```rust
//! use voxlogica::value::VoxValue;
//!
//! let v = VoxValue::Integer(42);
//! assert_eq!(v.vox_type(), "integer");
//! assert_eq!(v.render(), "42");
//! ```

pub mod sequence;

pub use sequence::{
    LazySequence, LinesFileSequence, MaterializedSequence, RangeSequence, SeqIter, SequenceValue,
};

use crate::hash::format_es_number;
use crate::ir::{CanonExpr, NodeId};
use serde_json::Value as JsonValue;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Value-layer errors (I/O and type mismatches during sequence iteration
/// or array construction).
#[derive(Error, Debug)]
pub enum ValueError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("type error: {0}")]
    Type(String),

    #[error("evaluation failed: {0}")]
    Eval(String),
}

pub type ValueResult<T> = Result<T, ValueError>;

/// Element type of a dense array payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    UInt8,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
}

impl DType {
    /// Size of one element in bytes.
    pub fn item_size(self) -> usize {
        match self {
            DType::UInt8 => 1,
            DType::Int16 => 2,
            DType::Int32 | DType::Float32 => 4,
            DType::Int64 | DType::Float64 => 8,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DType::UInt8 => "uint8",
            DType::Int16 => "int16",
            DType::Int32 => "int32",
            DType::Int64 => "int64",
            DType::Float32 => "float32",
            DType::Float64 => "float64",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "uint8" => Some(DType::UInt8),
            "int16" => Some(DType::Int16),
            "int32" => Some(DType::Int32),
            "int64" => Some(DType::Int64),
            "float32" => Some(DType::Float32),
            "float64" => Some(DType::Float64),
            _ => None,
        }
    }
}

/// Dense n-dimensional array: row-major little-endian bytes plus shape and
/// element type. The payload length always equals
/// `shape.iter().product::<usize>() * dtype.item_size()`.
#[derive(Debug, Clone, PartialEq)]
pub struct NdArrayValue {
    pub shape: Vec<usize>,
    pub dtype: DType,
    pub data: Vec<u8>,
}

impl NdArrayValue {
    pub fn new(shape: Vec<usize>, dtype: DType, data: Vec<u8>) -> ValueResult<Self> {
        let expected = shape.iter().product::<usize>() * dtype.item_size();
        if data.len() != expected {
            return Err(ValueError::Type(format!(
                "ndarray payload is {} bytes, shape {:?} with dtype {} requires {}",
                data.len(),
                shape,
                dtype.name(),
                expected
            )));
        }
        Ok(NdArrayValue { shape, dtype, data })
    }

    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }
}

/// Image value: array payload plus scanner geometry.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageValue {
    pub array: NdArrayValue,
    pub spacing: Vec<f64>,
    pub origin: Vec<f64>,
    pub direction: Vec<f64>,
}

/// Runtime closure handle: the closure node's id plus its canonical body.
/// Consumed by sequence primitives (`map`, `for_loop`); never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct ClosureValue {
    pub node_id: NodeId,
    pub params: Vec<String>,
    pub body: CanonExpr,
}

/// A runtime value.
#[derive(Clone)]
pub enum VoxValue {
    Null,
    Boolean(bool),
    Integer(i64),
    Number(f64),
    Text(String),
    Bytes(Vec<u8>),
    /// Arbitrary structured data returned by a kernel, stored as-is.
    Json(JsonValue),
    NdArray(NdArrayValue),
    Image(ImageValue),
    Sequence(SequenceValue),
    Closure(Arc<ClosureValue>),
}

impl VoxValue {
    /// The voxpod type tag of this value.
    pub fn vox_type(&self) -> &'static str {
        match self {
            VoxValue::Null => "null",
            VoxValue::Boolean(_) => "boolean",
            VoxValue::Integer(_) => "integer",
            VoxValue::Number(_) => "number",
            VoxValue::Text(_) => "string",
            VoxValue::Bytes(_) => "bytes",
            VoxValue::Json(_) => "json",
            VoxValue::NdArray(_) => "ndarray",
            VoxValue::Image(_) => "sitk_image",
            VoxValue::Sequence(_) => "sequence",
            VoxValue::Closure(_) => "closure",
        }
    }

    /// Literal JSON projection for values that are plain data. Sequences,
    /// arrays, bytes and closures have no literal form.
    pub fn as_literal_json(&self) -> Option<JsonValue> {
        match self {
            VoxValue::Null => Some(JsonValue::Null),
            VoxValue::Boolean(b) => Some(JsonValue::Bool(*b)),
            VoxValue::Integer(i) => Some(JsonValue::from(*i)),
            VoxValue::Number(n) => serde_json::Number::from_f64(*n).map(JsonValue::Number),
            VoxValue::Text(s) => Some(JsonValue::String(s.clone())),
            VoxValue::Json(v) => Some(v.clone()),
            _ => None,
        }
    }

    /// Build a value from literal JSON. Integral numbers become integers;
    /// arrays become materialized sequences; objects stay structured.
    pub fn from_literal_json(value: JsonValue) -> VoxValue {
        match value {
            JsonValue::Null => VoxValue::Null,
            JsonValue::Bool(b) => VoxValue::Boolean(b),
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    VoxValue::Integer(i)
                } else {
                    VoxValue::Number(n.as_f64().unwrap_or(0.0))
                }
            }
            JsonValue::String(s) => VoxValue::Text(s),
            JsonValue::Array(items) => {
                let items: Vec<VoxValue> =
                    items.into_iter().map(VoxValue::from_literal_json).collect();
                VoxValue::Sequence(SequenceValue::materialized(items))
            }
            value @ JsonValue::Object(_) => VoxValue::Json(value),
        }
    }

    /// Build a number value, narrowing integral floats to integers.
    pub fn from_f64(value: f64) -> VoxValue {
        if value.is_finite() && value.fract() == 0.0 && value.abs() < 9_007_199_254_740_992.0 {
            VoxValue::Integer(value as i64)
        } else {
            VoxValue::Number(value)
        }
    }

    /// Numeric projection used by the arithmetic kernels.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            VoxValue::Integer(i) => Some(*i as f64),
            VoxValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_sequence(&self) -> Option<&SequenceValue> {
        match self {
            VoxValue::Sequence(seq) => Some(seq),
            _ => None,
        }
    }

    pub fn as_closure(&self) -> Option<&Arc<ClosureValue>> {
        match self {
            VoxValue::Closure(closure) => Some(closure),
            _ => None,
        }
    }

    /// One-line rendering for `print` goals and the REPL.
    pub fn render(&self) -> String {
        match self {
            VoxValue::Null => "null".to_string(),
            VoxValue::Boolean(b) => b.to_string(),
            VoxValue::Integer(i) => i.to_string(),
            VoxValue::Number(n) => format_es_number(*n),
            VoxValue::Text(s) => s.clone(),
            VoxValue::Bytes(b) => format!("<{} bytes>", b.len()),
            VoxValue::Json(v) => v.to_string(),
            VoxValue::NdArray(a) => format!(
                "<ndarray {:?} {}>",
                a.shape,
                a.dtype.name()
            ),
            VoxValue::Image(img) => format!(
                "<image {:?} {}>",
                img.array.shape,
                img.array.dtype.name()
            ),
            VoxValue::Sequence(seq) => {
                let count = seq
                    .known_len()
                    .unwrap_or_else(|| seq.count_lower_bound());
                format!("<sequence of {count} items>")
            }
            VoxValue::Closure(c) => format!("<closure/{}>", c.params.len()),
        }
    }
}

impl fmt::Debug for VoxValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VoxValue::Null => write!(f, "Null"),
            VoxValue::Boolean(b) => write!(f, "Boolean({b})"),
            VoxValue::Integer(i) => write!(f, "Integer({i})"),
            VoxValue::Number(n) => write!(f, "Number({n})"),
            VoxValue::Text(s) => write!(f, "Text({s:?})"),
            VoxValue::Bytes(b) => write!(f, "Bytes(len={})", b.len()),
            VoxValue::Json(v) => write!(f, "Json({v})"),
            VoxValue::NdArray(a) => write!(f, "NdArray(shape={:?}, dtype={})", a.shape, a.dtype.name()),
            VoxValue::Image(i) => write!(f, "Image(shape={:?})", i.array.shape),
            VoxValue::Sequence(s) => write!(f, "Sequence(known_len={:?})", s.known_len()),
            VoxValue::Closure(c) => write!(f, "Closure(params={})", c.params.len()),
        }
    }
}

impl PartialEq for VoxValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (VoxValue::Null, VoxValue::Null) => true,
            (VoxValue::Boolean(a), VoxValue::Boolean(b)) => a == b,
            (VoxValue::Integer(a), VoxValue::Integer(b)) => a == b,
            (VoxValue::Number(a), VoxValue::Number(b)) => a == b,
            // Integers and integral floats compare equal, matching their
            // shared canonical form.
            (VoxValue::Integer(a), VoxValue::Number(b))
            | (VoxValue::Number(b), VoxValue::Integer(a)) => *b == *a as f64,
            (VoxValue::Text(a), VoxValue::Text(b)) => a == b,
            (VoxValue::Bytes(a), VoxValue::Bytes(b)) => a == b,
            (VoxValue::Json(a), VoxValue::Json(b)) => a == b,
            (VoxValue::NdArray(a), VoxValue::NdArray(b)) => a == b,
            (VoxValue::Image(a), VoxValue::Image(b)) => a == b,
            // Sequence handles compare by identity; compare contents via
            // `take`/`page` instead.
            (VoxValue::Sequence(a), VoxValue::Sequence(b)) => a.ptr_eq(b),
            (VoxValue::Closure(a), VoxValue::Closure(b)) => a.node_id == b.node_id,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_f64_narrows_integral_values() {
        assert_eq!(VoxValue::from_f64(42.0), VoxValue::Integer(42));
        assert_eq!(VoxValue::from_f64(2.5), VoxValue::Number(2.5));
        assert_eq!(VoxValue::from_f64(-3.0), VoxValue::Integer(-3));
    }

    #[test]
    fn test_ndarray_payload_length_validated() {
        let ok = NdArrayValue::new(vec![2, 3], DType::Int16, vec![0; 12]);
        assert!(ok.is_ok());
        let bad = NdArrayValue::new(vec![2, 3], DType::Int16, vec![0; 11]);
        assert!(bad.is_err());
    }

    #[test]
    fn test_render_scalars() {
        assert_eq!(VoxValue::Integer(42).render(), "42");
        assert_eq!(VoxValue::Number(2.5).render(), "2.5");
        assert_eq!(VoxValue::Text("hi".to_string()).render(), "hi");
        assert_eq!(VoxValue::Boolean(true).render(), "true");
    }

    #[test]
    fn test_integer_equals_integral_float() {
        assert_eq!(VoxValue::Integer(5), VoxValue::Number(5.0));
        assert_ne!(VoxValue::Integer(5), VoxValue::Number(5.5));
    }

    #[test]
    fn test_literal_json_roundtrip() {
        let v = VoxValue::from_literal_json(serde_json::json!({"a": [1, 2]}));
        assert_eq!(v.vox_type(), "json");
        let i = VoxValue::from_literal_json(serde_json::json!(7));
        assert_eq!(i, VoxValue::Integer(7));
    }
}
