//! Default primitive namespace.
//!
//! Arithmetic over numbers, integer ranges, lazy `map`, the strict
//! `for_loop` fallback, dataset `load`, tuple `index` and the `print`
//! effect. Always imported first, so bare names like `addition` resolve
//! here unless shadowed.

use super::{
    legacy_adapter, spec, AritySpec, KernelContext, KernelError, KernelInvocation, KernelResult,
    PrimitiveKind, PrimitiveSpec,
};
use crate::value::{SequenceValue, VoxValue};
use std::path::Path;
use std::sync::Arc;

/// Namespace manifest: the static enumeration the registry imports.
pub fn manifest() -> Vec<PrimitiveSpec> {
    vec![
        spec(
            "default",
            "addition",
            PrimitiveKind::Scalar,
            AritySpec::fixed(2),
            "Addition operation for numeric values",
        ),
        spec(
            "default",
            "subtraction",
            PrimitiveKind::Scalar,
            AritySpec::fixed(2),
            "Subtraction operation for numeric values",
        ),
        spec(
            "default",
            "multiplication",
            PrimitiveKind::Scalar,
            AritySpec::fixed(2),
            "Multiplication operation for numeric values",
        ),
        spec(
            "default",
            "division",
            PrimitiveKind::Scalar,
            AritySpec::fixed(2),
            "Division operation for numeric values",
        ),
        spec(
            "default",
            "range",
            PrimitiveKind::Sequence,
            AritySpec::variadic(1),
            "Half-open integer range: range(end) or range(start, end)",
        ),
        spec(
            "default",
            "map",
            PrimitiveKind::Sequence,
            AritySpec::fixed(2),
            "Map a closure over a sequence",
        ),
        spec(
            "default",
            "for_loop",
            PrimitiveKind::Sequence,
            AritySpec::fixed(2),
            "Apply a closure to each element of an iterable",
        ),
        // load ships under the legacy bare-kernel contract.
        legacy_adapter(
            "default",
            "load",
            PrimitiveKind::Sequence,
            AritySpec::fixed(1),
            "Load a dataset from a path (.json parsed, .txt/.csv streamed by line, other files raw bytes)",
        ),
        spec(
            "default",
            "index",
            PrimitiveKind::Scalar,
            AritySpec::fixed(2),
            "Tuple/list index access",
        ),
        spec(
            "default",
            "print_primitive",
            PrimitiveKind::Effect,
            AritySpec::fixed(2),
            "Render and print a label/value pair",
        ),
    ]
}

// ============================================================================
// Arithmetic
// ============================================================================

fn numeric_operands(
    invocation: &KernelInvocation<'_>,
    op: &str,
) -> KernelResult<(VoxValue, VoxValue)> {
    let left = invocation.positional(0)?.clone();
    let right = invocation.positional(1)?.clone();
    if left.as_f64().is_none() || right.as_f64().is_none() {
        return Err(KernelError::msg(format!(
            "{op} expects numeric operands, got {} and {}",
            left.vox_type(),
            right.vox_type()
        )));
    }
    Ok((left, right))
}

/// Integer-preserving binary op: integer operands stay integers unless the
/// checked operation overflows.
fn binary_int_op(
    left: &VoxValue,
    right: &VoxValue,
    int_op: fn(i64, i64) -> Option<i64>,
    float_op: fn(f64, f64) -> f64,
) -> VoxValue {
    if let (VoxValue::Integer(a), VoxValue::Integer(b)) = (left, right) {
        if let Some(result) = int_op(*a, *b) {
            return VoxValue::Integer(result);
        }
    }
    let a = left.as_f64().unwrap_or(0.0);
    let b = right.as_f64().unwrap_or(0.0);
    VoxValue::Number(float_op(a, b))
}

pub fn addition(
    _ctx: &dyn KernelContext,
    invocation: KernelInvocation<'_>,
) -> KernelResult<VoxValue> {
    let (left, right) = numeric_operands(&invocation, "Addition")?;
    Ok(binary_int_op(&left, &right, i64::checked_add, |a, b| a + b))
}

pub fn subtraction(
    _ctx: &dyn KernelContext,
    invocation: KernelInvocation<'_>,
) -> KernelResult<VoxValue> {
    let (left, right) = numeric_operands(&invocation, "Subtraction")?;
    Ok(binary_int_op(&left, &right, i64::checked_sub, |a, b| a - b))
}

pub fn multiplication(
    _ctx: &dyn KernelContext,
    invocation: KernelInvocation<'_>,
) -> KernelResult<VoxValue> {
    let (left, right) = numeric_operands(&invocation, "Multiplication")?;
    Ok(binary_int_op(&left, &right, i64::checked_mul, |a, b| a * b))
}

/// Division always yields a float; dividing by zero is a kernel error.
pub fn division(
    _ctx: &dyn KernelContext,
    invocation: KernelInvocation<'_>,
) -> KernelResult<VoxValue> {
    let (left, right) = numeric_operands(&invocation, "Division")?;
    let divisor = right.as_f64().unwrap_or(0.0);
    if divisor == 0.0 {
        return Err(KernelError::msg("Division by zero"));
    }
    let dividend = left.as_f64().unwrap_or(0.0);
    Ok(VoxValue::Number(dividend / divisor))
}

// ============================================================================
// Sequences
// ============================================================================

fn integer_argument(value: &VoxValue, what: &str) -> KernelResult<i64> {
    match value {
        VoxValue::Integer(i) => Ok(*i),
        VoxValue::Number(n) if n.fract() == 0.0 => Ok(*n as i64),
        VoxValue::Text(s) => s
            .parse::<i64>()
            .map_err(|_| KernelError::msg(format!("{what} must be an integer, got '{s}'"))),
        other => Err(KernelError::msg(format!(
            "{what} must be an integer, got {}",
            other.vox_type()
        ))),
    }
}

pub fn range(
    _ctx: &dyn KernelContext,
    invocation: KernelInvocation<'_>,
) -> KernelResult<VoxValue> {
    let positional = invocation.positional_all();
    let (start, end) = match positional.as_slice() {
        [end] => (0, integer_argument(end, "range end")?),
        [start, end] => (
            integer_argument(start, "range start")?,
            integer_argument(end, "range end")?,
        ),
        _ => {
            return Err(KernelError::msg(
                "range takes one or two integer arguments",
            ))
        }
    };
    Ok(VoxValue::Sequence(SequenceValue::new(Arc::new(
        crate::value::RangeSequence { start, end },
    ))))
}

fn sequence_argument<'v>(
    value: &'v VoxValue,
    primitive: &str,
) -> KernelResult<&'v SequenceValue> {
    value.as_sequence().ok_or_else(|| {
        KernelError::msg(format!(
            "{primitive} requires a sequence argument at key '0', got {}",
            value.vox_type()
        ))
    })
}

/// Lazy map: the result sequence applies the closure per element on
/// demand, caching per-element records under the map node's id.
pub fn map(ctx: &dyn KernelContext, invocation: KernelInvocation<'_>) -> KernelResult<VoxValue> {
    let base = sequence_argument(invocation.positional(0)?, "map")?.clone();
    let closure = invocation
        .positional(1)?
        .as_closure()
        .ok_or_else(|| KernelError::msg("map expects a closure argument at key '1'"))?
        .clone();
    Ok(VoxValue::Sequence(ctx.mapped_sequence(
        base,
        closure,
        invocation.node_id,
    )))
}

/// Strict fallback: apply the closure across the iterable and materialize.
pub fn for_loop(
    ctx: &dyn KernelContext,
    invocation: KernelInvocation<'_>,
) -> KernelResult<VoxValue> {
    let base = sequence_argument(invocation.positional(0)?, "for_loop")?.clone();
    let closure = invocation
        .positional(1)?
        .as_closure()
        .ok_or_else(|| {
            KernelError::msg("for_loop requires closure argument at key 'closure' or '1'")
        })?
        .clone();

    let mut items = Vec::new();
    for element in base.iter() {
        let element = element?;
        items.push(ctx.apply_closure(&closure, &element)?);
    }
    Ok(VoxValue::Sequence(SequenceValue::materialized(items)))
}

// ============================================================================
// Data access
// ============================================================================

/// Load a dataset at run time.
///
/// Sequence input passes through; `.json` files parse fully; `.txt`/`.csv`
/// files stream line by line; any other file loads as raw bytes.
pub fn load(_ctx: &dyn KernelContext, invocation: KernelInvocation<'_>) -> KernelResult<VoxValue> {
    let source = invocation.positional(0)?;
    if let VoxValue::Sequence(seq) = source {
        return Ok(VoxValue::Sequence(seq.clone()));
    }

    let path_text = match source {
        VoxValue::Text(s) => s.clone(),
        other => {
            return Err(KernelError::msg(format!(
                "load requires a path or sequence, got {}",
                other.vox_type()
            )))
        }
    };
    let path = Path::new(&path_text);
    if !path.exists() {
        return Err(KernelError::msg(format!(
            "load source not found: {path_text}"
        )));
    }

    let suffix = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);
    match suffix.as_deref() {
        Some("json") => {
            let text = std::fs::read_to_string(path)
                .map_err(|err| KernelError::msg(format!("load failed: {err}")))?;
            let parsed: serde_json::Value = serde_json::from_str(&text)
                .map_err(|err| KernelError::msg(format!("load failed: {err}")))?;
            Ok(VoxValue::from_literal_json(parsed))
        }
        Some("txt" | "csv") => Ok(VoxValue::Sequence(SequenceValue::new(Arc::new(
            crate::value::LinesFileSequence::new(path),
        )))),
        _ => {
            let bytes = std::fs::read(path)
                .map_err(|err| KernelError::msg(format!("load failed: {err}")))?;
            Ok(VoxValue::Bytes(bytes))
        }
    }
}

/// Element access by position over sequences and JSON arrays. Float and
/// string indices auto-convert when integral.
pub fn index(_ctx: &dyn KernelContext, invocation: KernelInvocation<'_>) -> KernelResult<VoxValue> {
    let target = invocation.positional(0)?;
    let idx = integer_argument(invocation.positional(1)?, "index argument")?;
    if idx < 0 {
        return Err(KernelError::msg(format!(
            "index argument must be non-negative, got {idx}"
        )));
    }
    let idx = idx as usize;

    match target {
        VoxValue::Sequence(seq) => seq
            .iter_from(idx)
            .next()
            .transpose()?
            .ok_or_else(|| KernelError::msg(format!("index {idx} out of bounds"))),
        VoxValue::Json(serde_json::Value::Array(items)) => items
            .get(idx)
            .cloned()
            .map(VoxValue::from_literal_json)
            .ok_or_else(|| KernelError::msg(format!("index {idx} out of bounds"))),
        other => Err(KernelError::msg(format!(
            "index expects a sequence, got {}",
            other.vox_type()
        ))),
    }
}

// ============================================================================
// Effects
// ============================================================================

/// Print `label=value` and return the rendered string.
pub fn print_primitive(
    _ctx: &dyn KernelContext,
    invocation: KernelInvocation<'_>,
) -> KernelResult<VoxValue> {
    let label = invocation.positional(0)?.render();
    let value = invocation.positional(1)?.render();
    let rendered = format!("{label}={value}");
    println!("{rendered}");
    Ok(VoxValue::Text(rendered))
}
