//! # POD Codec — `voxpod/1`
//!
//! Encodes runtime values into the versioned envelope persisted by the
//! result store. Every record carries a JSON payload and, for binary
//! types, a raw little-endian buffer:
//!
//! | vox_type | payload_json encoding | payload_bin |
//! |---|---|---|
//! | integer/number/string/boolean/null/json | `scalar-json-v1` | — |
//! | sequence | `sequence-json-v1` (length + preview ≤16) | — |
//! | bytes | `bytes-binary-v1` (length) | raw |
//! | ndarray | `ndarray-binary-v1` (shape, dtype) | row-major LE |
//! | sitk_image | ndarray payload + spacing/origin/direction | row-major LE |
//!
//! Sequence elements are not part of the parent envelope; they are stored
//! as their own records keyed by `hash_sequence_item(parent, index)`.

use crate::value::{DType, ImageValue, NdArrayValue, VoxValue};
use serde_json::{json, Map, Value as JsonValue};
use thiserror::Error;

/// Envelope format identifier.
pub const FORMAT_VERSION: &str = "voxpod/1";

/// Preview size embedded in sequence envelopes.
pub const SEQUENCE_PREVIEW_LEN: usize = 16;

#[derive(Error, Debug)]
pub enum PodError {
    #[error("cannot encode {0} values for storage")]
    Unsupported(&'static str),

    #[error("malformed {vox_type} payload: {message}")]
    Malformed { vox_type: String, message: String },

    #[error("unknown vox_type '{0}'")]
    UnknownVoxType(String),
}

pub type PodResult<T> = Result<T, PodError>;

/// Encoded storage envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedValue {
    pub format_version: &'static str,
    pub vox_type: String,
    pub descriptor: JsonValue,
    pub payload_json: JsonValue,
    pub payload_bin: Option<Vec<u8>>,
}

fn descriptor(vox_type: &str, summary: JsonValue, navigation: JsonValue) -> JsonValue {
    json!({
        "vox_type": vox_type,
        "format_version": FORMAT_VERSION,
        "summary": summary,
        "navigation": navigation,
    })
}

fn scalar_envelope(vox_type: &str, value: JsonValue) -> EncodedValue {
    EncodedValue {
        format_version: FORMAT_VERSION,
        vox_type: vox_type.to_string(),
        descriptor: descriptor(vox_type, json!({}), json!({})),
        payload_json: json!({"encoding": "scalar-json-v1", "value": value}),
        payload_bin: None,
    }
}

/// Encode a runtime value for storage.
///
/// Sequences are encoded through [`encode_sequence_envelope`] by the store
/// once their length is known; closures are reducer-time only and never
/// reach storage.
pub fn encode_for_storage(value: &VoxValue) -> PodResult<EncodedValue> {
    match value {
        VoxValue::Null => Ok(scalar_envelope("null", JsonValue::Null)),
        VoxValue::Boolean(b) => Ok(scalar_envelope("boolean", json!(b))),
        VoxValue::Integer(i) => Ok(scalar_envelope("integer", json!(i))),
        VoxValue::Number(n) => Ok(scalar_envelope("number", json!(n))),
        VoxValue::Text(s) => Ok(scalar_envelope("string", json!(s))),
        VoxValue::Json(v) => Ok(scalar_envelope("json", v.clone())),
        VoxValue::Bytes(data) => Ok(EncodedValue {
            format_version: FORMAT_VERSION,
            vox_type: "bytes".to_string(),
            descriptor: descriptor("bytes", json!({"length": data.len()}), json!({})),
            payload_json: json!({"encoding": "bytes-binary-v1", "length": data.len()}),
            payload_bin: Some(data.clone()),
        }),
        VoxValue::NdArray(array) => Ok(encode_ndarray("ndarray", array, Map::new())),
        VoxValue::Image(image) => {
            let mut extra = Map::new();
            extra.insert("spacing".to_string(), json!(image.spacing));
            extra.insert("origin".to_string(), json!(image.origin));
            extra.insert("direction".to_string(), json!(image.direction));
            Ok(encode_ndarray("sitk_image", &image.array, extra))
        }
        VoxValue::Sequence(_) => Err(PodError::Unsupported("lazy sequence")),
        VoxValue::Closure(_) => Err(PodError::Unsupported("closure")),
    }
}

fn encode_ndarray(vox_type: &str, array: &NdArrayValue, extra: Map<String, JsonValue>) -> EncodedValue {
    let mut payload = Map::new();
    payload.insert(
        "encoding".to_string(),
        json!("ndarray-binary-v1"),
    );
    payload.insert("shape".to_string(), json!(array.shape));
    payload.insert("dtype".to_string(), json!(array.dtype.name()));
    payload.extend(extra);
    EncodedValue {
        format_version: FORMAT_VERSION,
        vox_type: vox_type.to_string(),
        descriptor: descriptor(
            vox_type,
            json!({"shape": array.shape, "dtype": array.dtype.name()}),
            json!({}),
        ),
        payload_json: JsonValue::Object(payload),
        payload_bin: Some(array.data.clone()),
    }
}

/// Sequence parent envelope: length plus a bounded preview. Elements live
/// in their own records.
pub fn encode_sequence_envelope(length: usize, preview: &[VoxValue]) -> EncodedValue {
    let preview: Vec<JsonValue> = preview
        .iter()
        .take(SEQUENCE_PREVIEW_LEN)
        .map(|item| item.as_literal_json().unwrap_or(JsonValue::Null))
        .collect();
    EncodedValue {
        format_version: FORMAT_VERSION,
        vox_type: "sequence".to_string(),
        descriptor: descriptor(
            "sequence",
            json!({"length": length}),
            json!({"elements": "sequence-item-ref"}),
        ),
        payload_json: json!({
            "encoding": "sequence-json-v1",
            "length": length,
            "preview": preview,
        }),
        payload_bin: None,
    }
}

/// Decoded record: either a self-contained value, or a sequence envelope
/// whose elements the store resolves lazily.
#[derive(Debug)]
pub enum DecodedValue {
    Value(VoxValue),
    Sequence { length: usize },
}

fn malformed(vox_type: &str, message: impl Into<String>) -> PodError {
    PodError::Malformed {
        vox_type: vox_type.to_string(),
        message: message.into(),
    }
}

/// Decode a stored record back into a runtime value.
pub fn decode_runtime_value(
    vox_type: &str,
    payload_json: &JsonValue,
    payload_bin: Option<&[u8]>,
) -> PodResult<DecodedValue> {
    match vox_type {
        "null" | "boolean" | "integer" | "number" | "string" | "json" => {
            let value = payload_json
                .get("value")
                .ok_or_else(|| malformed(vox_type, "missing 'value'"))?;
            let decoded = match vox_type {
                "null" => VoxValue::Null,
                "boolean" => VoxValue::Boolean(
                    value
                        .as_bool()
                        .ok_or_else(|| malformed(vox_type, "expected boolean"))?,
                ),
                "integer" => VoxValue::Integer(
                    value
                        .as_i64()
                        .ok_or_else(|| malformed(vox_type, "expected integer"))?,
                ),
                "number" => VoxValue::Number(
                    value
                        .as_f64()
                        .ok_or_else(|| malformed(vox_type, "expected number"))?,
                ),
                "string" => VoxValue::Text(
                    value
                        .as_str()
                        .ok_or_else(|| malformed(vox_type, "expected string"))?
                        .to_string(),
                ),
                _ => VoxValue::Json(value.clone()),
            };
            Ok(DecodedValue::Value(decoded))
        }
        "sequence" => {
            let length = payload_json
                .get("length")
                .and_then(JsonValue::as_u64)
                .ok_or_else(|| malformed(vox_type, "missing 'length'"))?;
            Ok(DecodedValue::Sequence {
                length: length as usize,
            })
        }
        "bytes" => {
            let data = payload_bin
                .ok_or_else(|| malformed(vox_type, "missing binary payload"))?;
            Ok(DecodedValue::Value(VoxValue::Bytes(data.to_vec())))
        }
        "ndarray" => Ok(DecodedValue::Value(VoxValue::NdArray(decode_ndarray(
            vox_type,
            payload_json,
            payload_bin,
        )?))),
        "sitk_image" => {
            let array = decode_ndarray(vox_type, payload_json, payload_bin)?;
            let geometry = |key: &str| -> Vec<f64> {
                payload_json
                    .get(key)
                    .and_then(JsonValue::as_array)
                    .map(|items| items.iter().filter_map(JsonValue::as_f64).collect())
                    .unwrap_or_default()
            };
            Ok(DecodedValue::Value(VoxValue::Image(ImageValue {
                array,
                spacing: geometry("spacing"),
                origin: geometry("origin"),
                direction: geometry("direction"),
            })))
        }
        other => Err(PodError::UnknownVoxType(other.to_string())),
    }
}

fn decode_ndarray(
    vox_type: &str,
    payload_json: &JsonValue,
    payload_bin: Option<&[u8]>,
) -> PodResult<NdArrayValue> {
    let shape: Vec<usize> = payload_json
        .get("shape")
        .and_then(JsonValue::as_array)
        .ok_or_else(|| malformed(vox_type, "missing 'shape'"))?
        .iter()
        .filter_map(JsonValue::as_u64)
        .map(|v| v as usize)
        .collect();
    let dtype = payload_json
        .get("dtype")
        .and_then(JsonValue::as_str)
        .and_then(DType::parse)
        .ok_or_else(|| malformed(vox_type, "missing or unknown 'dtype'"))?;
    let data = payload_bin
        .ok_or_else(|| malformed(vox_type, "missing binary payload"))?
        .to_vec();
    NdArrayValue::new(shape, dtype, data)
        .map_err(|err| malformed(vox_type, err.to_string()))
}
