//! Strings primitive namespace: formatting and concatenation.

use super::{
    spec, AritySpec, KernelContext, KernelError, KernelInvocation, KernelResult, PrimitiveKind,
    PrimitiveSpec,
};
use crate::value::VoxValue;

pub fn manifest() -> Vec<PrimitiveSpec> {
    vec![
        spec(
            "strings",
            "concat",
            PrimitiveKind::Scalar,
            AritySpec::variadic(1),
            "Concatenate values as strings",
        ),
        spec(
            "strings",
            "format_string",
            PrimitiveKind::Scalar,
            AritySpec::variadic(1),
            "Format string with positional arguments",
        ),
    ]
}

/// Concatenate positional arguments as strings.
pub fn concat(
    _ctx: &dyn KernelContext,
    invocation: KernelInvocation<'_>,
) -> KernelResult<VoxValue> {
    let parts = invocation.positional_all();
    if parts.is_empty() {
        return Err(KernelError::msg("concat requires at least one argument"));
    }
    let rendered: String = parts.iter().map(|part| part.render()).collect();
    Ok(VoxValue::Text(rendered))
}

/// Apply a positional template: `{}` substitutes the next argument,
/// `{:0Nd}` zero-pads an integer to width N.
///
/// Example: `format_string("x_{:03d}", 7)` -> `"x_007"`.
pub fn format_string(
    _ctx: &dyn KernelContext,
    invocation: KernelInvocation<'_>,
) -> KernelResult<VoxValue> {
    let template = match invocation.positional(0)? {
        VoxValue::Text(s) => s.clone(),
        other => other.render(),
    };
    let args: Vec<&VoxValue> = invocation.positional_all().into_iter().skip(1).collect();

    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    let mut next_arg = 0usize;

    while let Some(c) = chars.next() {
        if c != '{' {
            out.push(c);
            continue;
        }
        // Collect the placeholder up to '}'.
        let mut placeholder = String::new();
        let mut closed = false;
        for inner in chars.by_ref() {
            if inner == '}' {
                closed = true;
                break;
            }
            placeholder.push(inner);
        }
        if !closed {
            return Err(KernelError::msg(
                "format_string failed: unterminated placeholder",
            ));
        }
        let arg = args.get(next_arg).ok_or_else(|| {
            KernelError::msg(format!(
                "format_string failed: missing argument for placeholder {next_arg}"
            ))
        })?;
        next_arg += 1;

        if placeholder.is_empty() {
            out.push_str(&arg.render());
        } else if let Some(width) = placeholder
            .strip_prefix(":0")
            .and_then(|rest| rest.strip_suffix('d'))
            .and_then(|digits| digits.parse::<usize>().ok())
        {
            let value = match arg {
                VoxValue::Integer(i) => *i,
                VoxValue::Number(n) if n.fract() == 0.0 => *n as i64,
                other => {
                    return Err(KernelError::msg(format!(
                        "format_string failed: {{:{placeholder}}} expects an integer, got {}",
                        other.vox_type()
                    )))
                }
            };
            out.push_str(&format!("{value:0width$}"));
        } else {
            return Err(KernelError::msg(format!(
                "format_string failed: unsupported placeholder '{{{placeholder}}}'"
            )));
        }
    }

    Ok(VoxValue::Text(out))
}
