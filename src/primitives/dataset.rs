//! `dataset` primitive namespace: directory scanning for dataset
//! pipelines.

use super::{
    spec, AritySpec, KernelContext, KernelError, KernelInvocation, KernelResult, PrimitiveKind,
    PrimitiveSpec,
};
use crate::value::{SequenceValue, VoxValue};
use std::path::Path;

pub fn manifest() -> Vec<PrimitiveSpec> {
    vec![spec(
        "dataset",
        "readdir",
        PrimitiveKind::Dataset,
        AritySpec::variadic(1),
        "List files in a directory as a dataset of absolute paths",
    )]
}

/// Minimal `*` glob: segments between stars must appear in order.
fn glob_matches(pattern: &str, name: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    let mut rest = name;
    let segments: Vec<&str> = pattern.split('*').collect();
    for (i, segment) in segments.iter().enumerate() {
        if segment.is_empty() {
            continue;
        }
        if i == 0 {
            if !rest.starts_with(segment) {
                return false;
            }
            rest = &rest[segment.len()..];
        } else if let Some(pos) = rest.find(segment) {
            rest = &rest[pos + segment.len()..];
        } else {
            return false;
        }
    }
    // Without a trailing star, the last segment must anchor the end.
    if !pattern.ends_with('*') {
        if let Some(last) = segments.last() {
            return name.ends_with(last);
        }
    }
    true
}

/// List the files of a directory matching a glob, sorted for determinism.
pub fn readdir(
    _ctx: &dyn KernelContext,
    invocation: KernelInvocation<'_>,
) -> KernelResult<VoxValue> {
    let directory = match invocation.positional(0)? {
        VoxValue::Text(s) => s.clone(),
        other => {
            return Err(KernelError::msg(format!(
                "Directory path must be string, got {}",
                other.vox_type()
            )))
        }
    };
    let pattern = match invocation.args.get("1") {
        Some(VoxValue::Text(p)) => p.clone(),
        Some(other) => {
            return Err(KernelError::msg(format!(
                "readdir pattern must be string, got {}",
                other.vox_type()
            )))
        }
        None => "*".to_string(),
    };

    let path = Path::new(&directory);
    if !path.exists() {
        return Err(KernelError::msg(format!(
            "Directory does not exist: {directory}"
        )));
    }
    if !path.is_dir() {
        return Err(KernelError::msg(format!(
            "Path is not a directory: {directory}"
        )));
    }

    let mut files: Vec<String> = std::fs::read_dir(path)
        .map_err(|err| KernelError::msg(format!("readdir failed: {err}")))?
        .filter_map(Result::ok)
        .filter(|entry| entry.path().is_file())
        .filter(|entry| glob_matches(&pattern, &entry.file_name().to_string_lossy()))
        .map(|entry| entry.path().display().to_string())
        .collect();
    files.sort();

    Ok(VoxValue::Sequence(SequenceValue::materialized(
        files.into_iter().map(VoxValue::Text).collect(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
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

    #[test]
    fn test_glob_matching() {
        assert!(glob_matches("*", "anything"));
        assert!(glob_matches("*.txt", "notes.txt"));
        assert!(!glob_matches("*.txt", "notes.csv"));
        assert!(glob_matches("img_*", "img_001.png"));
        assert!(glob_matches("a*b*c", "aXbYc"));
        assert!(!glob_matches("a*b*c", "aXbY"));
    }

    #[test]
    fn test_readdir_lists_matching_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("a.txt"), "x").expect("write");
        std::fs::write(dir.path().join("b.csv"), "y").expect("write");

        let mut args = BTreeMap::new();
        args.insert(
            "0".to_string(),
            VoxValue::Text(dir.path().display().to_string()),
        );
        args.insert("1".to_string(), VoxValue::Text("*.txt".to_string()));
        let result = readdir(
            &NoCtx,
            KernelInvocation {
                node_id: "test-node",
                args,
            },
        )
        .expect("readdir");
        let seq = result.as_sequence().expect("sequence");
        let items = seq.take(10).expect("take");
        assert_eq!(items.len(), 1);
        match &items[0] {
            VoxValue::Text(path) => assert!(path.ends_with("a.txt")),
            other => panic!("expected path, got {other:?}"),
        }
    }
}
