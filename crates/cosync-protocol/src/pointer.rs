//! JSON Pointer (RFC 6901) paths and RFC 6902 patch operations

use crate::error::{ProtocolError, ProtocolResult};
use cosync_core::{Patch, PatchOp, PathKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Cow;

/// Escape one pointer segment (`~` as `~0`, `/` as `~1`)
pub fn encode_segment(segment: &str) -> Cow<'_, str> {
    if !segment.contains(['~', '/']) {
        return Cow::Borrowed(segment);
    }
    Cow::Owned(segment.replace('~', "~0").replace('/', "~1"))
}

pub fn decode_segment(segment: &str) -> String {
    if !segment.contains('~') {
        return segment.to_string();
    }
    segment.replace("~1", "/").replace("~0", "~")
}

/// Render a patch path as a pointer, `""` for the root
pub fn to_pointer(path: &[PathKey]) -> String {
    let mut out = String::new();
    for key in path {
        out.push('/');
        match key {
            PathKey::Key(k) => out.push_str(&encode_segment(k)),
            PathKey::Index(i) => out.push_str(&i.to_string()),
        }
    }
    out
}

/// Split a pointer into decoded string segments
pub fn parse_pointer(pointer: &str) -> ProtocolResult<Vec<String>> {
    if pointer.is_empty() {
        return Ok(Vec::new());
    }
    let Some(rest) = pointer.strip_prefix('/') else {
        return Err(ProtocolError::InvalidPointer(format!(
            "{:?} does not start with '/'",
            pointer
        )));
    };
    Ok(rest.split('/').map(decode_segment).collect())
}

/// Resolve pointer segments into a patch path against the value they address.
///
/// A segment becomes an index only where the value at that depth is an
/// array; past the end of the existing tree every segment is a key.
pub fn resolve_path(segments: &[String], target: &Value) -> Vec<PathKey> {
    let mut current = Some(target);
    segments
        .iter()
        .map(|segment| {
            let key = PathKey::parse_index(segment, matches!(current, Some(Value::Array(_))));
            current = current.and_then(|value| match &key {
                PathKey::Index(i) => value.get(*i),
                PathKey::Key(k) => value.get(k.as_str()),
            });
            key
        })
        .collect()
}

/// One RFC 6902 operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonPatchOperation {
    pub op: PatchOp,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl JsonPatchOperation {
    /// Convert back into a patch, using `target` to tell indices from keys
    pub fn to_patch(&self, target: &Value) -> ProtocolResult<Patch> {
        let segments = parse_pointer(&self.path)?;
        Ok(Patch {
            op: self.op,
            path: resolve_path(&segments, target),
            value: self.value.clone(),
        })
    }
}

impl From<&Patch> for JsonPatchOperation {
    fn from(patch: &Patch) -> Self {
        Self {
            op: patch.op,
            path: to_pointer(&patch.path),
            value: patch.value.clone(),
        }
    }
}

pub fn to_json_patch_operations(patches: &[Patch]) -> Vec<JsonPatchOperation> {
    patches.iter().map(JsonPatchOperation::from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use cosync_core::path;
    use serde_json::json;

    #[test]
    fn test_segment_escaping() {
        assert_eq!(encode_segment("plain"), "plain");
        assert_eq!(encode_segment("a/b~c"), "a~1b~0c");
        assert_eq!(decode_segment("a~1b~0c"), "a/b~c");
        // ~01 is an escaped tilde followed by a literal 1
        assert_eq!(decode_segment("~01"), "~1");
    }

    #[test]
    fn test_to_pointer() {
        assert_eq!(to_pointer(&[]), "");
        assert_eq!(to_pointer(&path!["nodes", "a/b", 3usize]), "/nodes/a~1b/3");
    }

    #[test]
    fn test_parse_pointer() {
        assert_eq!(parse_pointer("").unwrap(), Vec::<String>::new());
        assert_eq!(parse_pointer("/").unwrap(), vec![String::new()]);
        assert_eq!(
            parse_pointer("/nodes/a~1b/3").unwrap(),
            vec!["nodes".to_string(), "a/b".to_string(), "3".to_string()]
        );
        assert!(matches!(
            parse_pointer("nodes"),
            Err(ProtocolError::InvalidPointer(_))
        ));
    }

    #[test]
    fn test_resolve_path_uses_target_shape() {
        let target = json!({"list": [{"7": true}], "map": {"7": 1}});
        let segments = parse_pointer("/list/0/7").unwrap();
        assert_eq!(resolve_path(&segments, &target), path!["list", 0usize, "7"]);

        let segments = parse_pointer("/map/7").unwrap();
        assert_eq!(resolve_path(&segments, &target), path!["map", "7"]);

        let segments = parse_pointer("/missing/0").unwrap();
        assert_eq!(resolve_path(&segments, &target), path!["missing", "0"]);
    }

    #[test]
    fn test_json_patch_operations() {
        let patches = vec![
            Patch::replace(path!["n1", "y"], json!(88)),
            Patch::remove(path!["scenes", 0usize]),
        ];
        let ops = to_json_patch_operations(&patches);

        assert_eq!(
            serde_json::to_value(&ops).unwrap(),
            json!([
                {"op": "replace", "path": "/n1/y", "value": 88},
                {"op": "remove", "path": "/scenes/0"}
            ])
        );

        let target = json!({"n1": {"y": 0}, "scenes": ["s"]});
        let back: Vec<Patch> = ops.iter().map(|op| op.to_patch(&target).unwrap()).collect();
        assert_eq!(back, patches);
    }
}
