//! `test` primitive namespace: diagnostics used to observe engine
//! behavior (memoization, effect serialisation, structured payloads).

use super::{
    legacy_adapter, spec, AritySpec, KernelContext, KernelError, KernelInvocation, KernelResult,
    PrimitiveKind, PrimitiveSpec,
};
use crate::value::VoxValue;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};

pub fn manifest() -> Vec<PrimitiveSpec> {
    vec![
        // fibonacci ships under the legacy bare-kernel contract.
        legacy_adapter(
            "test",
            "fibonacci",
            PrimitiveKind::Scalar,
            AritySpec::fixed(1),
            "Compute the nth Fibonacci number",
        ),
        spec(
            "test",
            "impure",
            PrimitiveKind::Effect,
            AritySpec::fixed(1),
            "Impure diagnostic primitive for memoization checks",
        ),
        spec(
            "test",
            "demo_data",
            PrimitiveKind::Scalar,
            AritySpec::variadic(0),
            "Return structured demo payload",
        ),
    ]
}

/// Compute the nth Fibonacci number iteratively.
pub fn fibonacci(
    _ctx: &dyn KernelContext,
    invocation: KernelInvocation<'_>,
) -> KernelResult<VoxValue> {
    let n = match invocation.positional(0)? {
        VoxValue::Integer(i) => *i,
        VoxValue::Number(f) if f.fract() == 0.0 => *f as i64,
        other => {
            return Err(KernelError::msg(format!(
                "Fibonacci input must be an integer, got {}",
                other.vox_type()
            )))
        }
    };
    if n < 0 {
        return Err(KernelError::msg("Fibonacci input must be non-negative"));
    }
    if n <= 1 {
        return Ok(VoxValue::Integer(n));
    }
    let (mut a, mut b) = (0i64, 1i64);
    for _ in 2..=n {
        let next = a.checked_add(b).ok_or_else(|| {
            KernelError::msg(format!("Fibonacci computation failed: overflow at n={n}"))
        })?;
        a = b;
        b = next;
    }
    Ok(VoxValue::Integer(b))
}

static IMPURE_INVOCATIONS: AtomicU64 = AtomicU64::new(0);

/// Total `test.impure` kernel invocations in this process. The counter is
/// what lets tests assert the at-most-once build guarantee.
pub fn impure_invocations() -> u64 {
    IMPURE_INVOCATIONS.load(Ordering::SeqCst)
}

/// Identity effect that logs and counts every invocation. Memoization
/// working correctly means one call per distinct input, and effects always
/// re-run when demanded.
pub fn impure(
    _ctx: &dyn KernelContext,
    invocation: KernelInvocation<'_>,
) -> KernelResult<VoxValue> {
    let input = invocation.positional(0)?.clone();
    IMPURE_INVOCATIONS.fetch_add(1, Ordering::SeqCst);
    tracing::info!(input = %input.render(), "IMPURE CALLED");
    Ok(input)
}

/// Arbitrary structured data, stored and displayed without interpretation.
pub fn demo_data(
    _ctx: &dyn KernelContext,
    _invocation: KernelInvocation<'_>,
) -> KernelResult<VoxValue> {
    Ok(VoxValue::Json(json!({
        "this_is_not_special": "field names carry no meaning to the engine",
        "nested_data": {"level1": {"level2": {"message": "stored as-is"}}},
        "numbers": [1, 2, 3, 4, 5],
        "booleans": {"true": true, "false": false, "null": null}
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::SequenceValue;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    struct NoCtx;

    impl KernelContext for NoCtx {
        fn apply_closure(
            &self,
            _closure: &crate::value::ClosureValue,
            arg: &VoxValue,
        ) -> KernelResult<VoxValue> {
            Ok(arg.clone())
        }

        fn mapped_sequence(
            &self,
            base: SequenceValue,
            _closure: Arc<crate::value::ClosureValue>,
            _parent_id: &str,
        ) -> SequenceValue {
            base
        }
    }

    fn invoke(kernel: super::super::KernelFn, args: Vec<VoxValue>) -> KernelResult<VoxValue> {
        let args: BTreeMap<String, VoxValue> = args
            .into_iter()
            .enumerate()
            .map(|(i, v)| (i.to_string(), v))
            .collect();
        kernel(
            &NoCtx,
            KernelInvocation {
                node_id: "test-node",
                args,
            },
        )
    }

    #[test]
    fn test_fibonacci_values() {
        assert_eq!(
            invoke(fibonacci, vec![VoxValue::Integer(0)]).expect("fib"),
            VoxValue::Integer(0)
        );
        assert_eq!(
            invoke(fibonacci, vec![VoxValue::Integer(1)]).expect("fib"),
            VoxValue::Integer(1)
        );
        assert_eq!(
            invoke(fibonacci, vec![VoxValue::Integer(10)]).expect("fib"),
            VoxValue::Integer(55)
        );
    }

    #[test]
    fn test_fibonacci_rejects_negative() {
        assert!(invoke(fibonacci, vec![VoxValue::Integer(-1)]).is_err());
    }

    #[test]
    fn test_impure_returns_input_and_counts() {
        let before = impure_invocations();
        let result = invoke(impure, vec![VoxValue::Integer(9)]).expect("impure");
        assert_eq!(result, VoxValue::Integer(9));
        assert_eq!(impure_invocations(), before + 1);
    }

    #[test]
    fn test_demo_data_is_structured_json() {
        let result = invoke(demo_data, vec![]).expect("demo");
        assert_eq!(result.vox_type(), "json");
    }
}
