//! Patch model, plain-JSON patch application and structural diff

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single path segment: a map key or an array index
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathKey {
    Index(usize),
    Key(String),
}

impl PathKey {
    /// Resolve a decoded pointer segment against the shape it addresses.
    ///
    /// Pointer segments are always strings, so the caller has to say whether
    /// the parent is an array for `"0"` to become an index.
    pub fn parse_index(segment: &str, parent_is_array: bool) -> Self {
        if parent_is_array {
            if let Ok(idx) = segment.parse::<usize>() {
                return PathKey::Index(idx);
            }
        }
        PathKey::Key(segment.to_string())
    }

    pub fn as_key(&self) -> Option<&str> {
        match self {
            PathKey::Key(k) => Some(k),
            PathKey::Index(_) => None,
        }
    }

    pub fn as_index(&self) -> Option<usize> {
        match self {
            PathKey::Index(i) => Some(*i),
            PathKey::Key(_) => None,
        }
    }

    /// Empty plain value of the kind this key addresses
    pub(crate) fn empty_parent(&self) -> Value {
        match self {
            PathKey::Key(_) => Value::Object(Map::new()),
            PathKey::Index(_) => Value::Array(Vec::new()),
        }
    }
}

impl std::fmt::Display for PathKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PathKey::Key(k) => write!(f, "{}", k),
            PathKey::Index(i) => write!(f, "{}", i),
        }
    }
}

impl From<&str> for PathKey {
    fn from(v: &str) -> Self {
        PathKey::Key(v.to_string())
    }
}

impl From<String> for PathKey {
    fn from(v: String) -> Self {
        PathKey::Key(v)
    }
}

impl From<usize> for PathKey {
    fn from(v: usize) -> Self {
        PathKey::Index(v)
    }
}

/// Build a `Vec<PathKey>` from mixed string and index segments.
///
/// ```
/// use cosync_core::{path, PathKey};
/// assert_eq!(path!["nodes", 2usize], vec![PathKey::from("nodes"), PathKey::Index(2)]);
/// ```
#[macro_export]
macro_rules! path {
    ($($seg:expr),* $(,)?) => {
        vec![$($crate::PathKey::from($seg)),*]
    };
}

/// Patch operation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchOp {
    Add,
    Replace,
    Remove,
}

impl std::fmt::Display for PatchOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PatchOp::Add => write!(f, "add"),
            PatchOp::Replace => write!(f, "replace"),
            PatchOp::Remove => write!(f, "remove"),
        }
    }
}

/// A structural mutation at a path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    pub op: PatchOp,
    pub path: Vec<PathKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl Patch {
    pub fn add(path: Vec<PathKey>, value: Value) -> Self {
        Self {
            op: PatchOp::Add,
            path,
            value: Some(value),
        }
    }

    pub fn replace(path: Vec<PathKey>, value: Value) -> Self {
        Self {
            op: PatchOp::Replace,
            path,
            value: Some(value),
        }
    }

    pub fn remove(path: Vec<PathKey>) -> Self {
        Self {
            op: PatchOp::Remove,
            path,
            value: None,
        }
    }

    /// The patch value, with a missing value read as `null`
    pub fn value_or_null(&self) -> Value {
        self.value.clone().unwrap_or(Value::Null)
    }

    /// Same patch addressed under `prefix`
    pub fn prefixed(&self, prefix: &[PathKey]) -> Self {
        let mut path = Vec::with_capacity(prefix.len() + self.path.len());
        path.extend_from_slice(prefix);
        path.extend_from_slice(&self.path);
        Self {
            op: self.op,
            path,
            value: self.value.clone(),
        }
    }

    /// Same patch with the first `n` path segments dropped
    pub fn strip_prefix(&self, n: usize) -> Self {
        Self {
            op: self.op,
            path: self.path.iter().skip(n).cloned().collect(),
            value: self.value.clone(),
        }
    }

    pub(crate) fn describe_path(&self) -> String {
        let segments: Vec<String> = self.path.iter().map(ToString::to_string).collect();
        format!("/{}", segments.join("/"))
    }
}

/// Apply `patches` to a copy of `base` and return the result.
///
/// The rules are the ones the container translator enforces, so a list that
/// applies cleanly here also applies cleanly to a container mirroring `base`.
pub fn apply_patches(base: &Value, patches: &[Patch]) -> Result<Value> {
    let mut draft = base.clone();
    for patch in patches {
        apply_patch(&mut draft, patch)?;
    }
    Ok(draft)
}

/// Apply one patch in place
pub fn apply_patch(root: &mut Value, patch: &Patch) -> Result<()> {
    check_value(patch)?;
    let Some((leaf, parents)) = patch.path.split_last() else {
        return replace_root(root, patch);
    };

    let mut current = root;
    for (i, key) in parents.iter().enumerate() {
        current = descend(current, key, &patch.path[i + 1], patch)?;
    }

    write_leaf(current, leaf, patch)
}

fn replace_root(root: &mut Value, patch: &Patch) -> Result<()> {
    if patch.op != PatchOp::Replace {
        return Err(Error::UnsupportedPatch(format!(
            "root patch must be a replace, got {}",
            patch.op
        )));
    }

    let value = patch.value_or_null();
    let same_shape = matches!(
        (&*root, &value),
        (Value::Object(_), Value::Object(_)) | (Value::Array(_), Value::Array(_))
    );
    if !same_shape {
        return Err(Error::UnsupportedPatch(
            "root replacement does not match the container shape".into(),
        ));
    }
    *root = value;
    Ok(())
}

fn descend<'a>(
    current: &'a mut Value,
    key: &PathKey,
    next: &PathKey,
    patch: &Patch,
) -> Result<&'a mut Value> {
    let slot: &'a mut Value = match current {
        Value::Object(map) => {
            let Some(k) = key.as_key() else {
                return Err(Error::UnsupportedPatch(format!(
                    "integer key {} on a map at {}",
                    key,
                    patch.describe_path()
                )));
            };
            map.entry(k.to_string()).or_insert(Value::Null)
        }
        Value::Array(items) => {
            let Some(idx) = key.as_index() else {
                return Err(Error::UnsupportedPatch(format!(
                    "string key {} on an array at {}",
                    key,
                    patch.describe_path()
                )));
            };
            if idx > items.len() {
                return Err(Error::UnsupportedPatch(format!(
                    "index {} out of bounds ({}) at {}",
                    idx,
                    items.len(),
                    patch.describe_path()
                )));
            }
            if idx == items.len() {
                items.push(Value::Null);
            }
            &mut items[idx]
        }
        other => {
            return Err(Error::Traversal(format!(
                "cannot descend into {} at {}",
                other,
                patch.describe_path()
            )))
        }
    };

    if slot.is_null() {
        *slot = next.empty_parent();
    } else if !slot.is_object() && !slot.is_array() {
        return Err(Error::Traversal(format!(
            "cannot descend into primitive {} at {}",
            slot,
            patch.describe_path()
        )));
    }
    Ok(slot)
}

fn write_leaf(target: &mut Value, key: &PathKey, patch: &Patch) -> Result<()> {
    match (target, key) {
        (Value::Object(map), PathKey::Key(k)) => {
            match patch.op {
                PatchOp::Add | PatchOp::Replace => {
                    map.insert(k.clone(), patch.value_or_null());
                }
                PatchOp::Remove => {
                    map.remove(k);
                }
            }
            Ok(())
        }
        (Value::Object(_), PathKey::Index(idx)) => Err(Error::UnsupportedPatch(format!(
            "{} with integer key {} on a map at {}",
            patch.op,
            idx,
            patch.describe_path()
        ))),
        (Value::Array(items), PathKey::Index(idx)) => {
            let idx = *idx;
            let len = items.len();
            match patch.op {
                PatchOp::Add if idx <= len => items.insert(idx, patch.value_or_null()),
                PatchOp::Replace if idx < len => items[idx] = patch.value_or_null(),
                PatchOp::Remove if idx < len => {
                    items.remove(idx);
                }
                op => {
                    return Err(Error::UnsupportedPatch(format!(
                        "{} at index {} out of bounds ({}) at {}",
                        op,
                        idx,
                        len,
                        patch.describe_path()
                    )))
                }
            }
            Ok(())
        }
        (Value::Array(items), PathKey::Key(k)) => match truncate_length(patch, k, items.len()) {
            Some(new_len) => {
                items.truncate(new_len);
                Ok(())
            }
            None => Err(Error::UnsupportedPatch(format!(
                "{} with key {} on an array at {}",
                patch.op,
                k,
                patch.describe_path()
            ))),
        },
        (other, _) => Err(Error::Traversal(format!(
            "cannot write into {} at {}",
            other,
            patch.describe_path()
        ))),
    }
}

/// Reject integers a container cannot store exactly (above `i64::MAX`)
pub(crate) fn check_value(patch: &Patch) -> Result<()> {
    fn walk(value: &Value, patch: &Patch) -> Result<()> {
        match value {
            Value::Number(n) if n.is_u64() && n.as_i64().is_none() => {
                Err(Error::UnsupportedPatch(format!(
                    "integer {} out of range at {}",
                    n,
                    patch.describe_path()
                )))
            }
            Value::Array(items) => items.iter().try_for_each(|v| walk(v, patch)),
            Value::Object(entries) => entries.values().try_for_each(|v| walk(v, patch)),
            _ => Ok(()),
        }
    }

    match (&patch.op, &patch.value) {
        (PatchOp::Remove, _) | (_, None) => Ok(()),
        (_, Some(value)) => walk(value, patch),
    }
}

/// New length for a `length` truncation patch, if `patch` is one
pub(crate) fn truncate_length(patch: &Patch, key: &str, current_len: usize) -> Option<usize> {
    if key != "length" || patch.op == PatchOp::Remove {
        return None;
    }
    let new_len = patch.value.as_ref()?.as_u64()?;
    let new_len = usize::try_from(new_len).ok()?;
    (new_len < current_len).then_some(new_len)
}

/// Structural diff: patches that turn `prev` into `next`.
///
/// Objects recurse per key, arrays recurse over the common prefix and then
/// add or remove the tail. Removals from an array run back to front so every
/// index stays valid while the list is replayed in order.
pub fn diff(prev: &Value, next: &Value) -> Vec<Patch> {
    let mut patches = Vec::new();
    diff_at_path(&mut patches, &mut Vec::new(), prev, next);
    patches
}

fn diff_at_path(out: &mut Vec<Patch>, path: &mut Vec<PathKey>, prev: &Value, next: &Value) {
    if prev == next {
        return;
    }
    match (prev, next) {
        (Value::Object(a), Value::Object(b)) => {
            for key in a.keys() {
                if !b.contains_key(key) {
                    path.push(PathKey::Key(key.clone()));
                    out.push(Patch::remove(path.clone()));
                    path.pop();
                }
            }
            for (key, b_val) in b {
                path.push(PathKey::Key(key.clone()));
                match a.get(key) {
                    Some(a_val) => diff_at_path(out, path, a_val, b_val),
                    None => out.push(Patch::add(path.clone(), b_val.clone())),
                }
                path.pop();
            }
        }
        (Value::Array(a), Value::Array(b)) => {
            let common = a.len().min(b.len());
            for i in 0..common {
                path.push(PathKey::Index(i));
                diff_at_path(out, path, &a[i], &b[i]);
                path.pop();
            }
            for (i, item) in b.iter().enumerate().skip(common) {
                path.push(PathKey::Index(i));
                out.push(Patch::add(path.clone(), item.clone()));
                path.pop();
            }
            for i in (common..a.len()).rev() {
                path.push(PathKey::Index(i));
                out.push(Patch::remove(path.clone()));
                path.pop();
            }
        }
        _ => out.push(Patch::replace(path.clone(), next.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path;
    use serde_json::json;

    #[test]
    fn test_patch_serde_shape() {
        let patch = Patch::replace(path!["n1", "y"], json!(88));
        let encoded = serde_json::to_value(&patch).unwrap();
        assert_eq!(encoded, json!({"op": "replace", "path": ["n1", "y"], "value": 88}));

        let decoded: Patch =
            serde_json::from_value(json!({"op": "remove", "path": ["items", 2]})).unwrap();
        assert_eq!(decoded, Patch::remove(path!["items", 2usize]));
    }

    #[test]
    fn test_apply_creates_intermediate_containers() {
        let patches = vec![
            Patch::add(path!["a", "b", "c"], json!(1)),
            Patch::add(path!["list", 0usize, "name"], json!("first")),
        ];
        let result = apply_patches(&json!({}), &patches).unwrap();
        assert_eq!(
            result,
            json!({"a": {"b": {"c": 1}}, "list": [{"name": "first"}]})
        );
    }

    #[test]
    fn test_apply_array_ops() {
        let base = json!({"xs": [1, 2, 3]});
        let patches = vec![
            Patch::add(path!["xs", 1usize], json!(9)),
            Patch::replace(path!["xs", 0usize], json!(0)),
            Patch::remove(path!["xs", 3usize]),
        ];
        assert_eq!(apply_patches(&base, &patches).unwrap(), json!({"xs": [0, 9, 2]}));
    }

    #[test]
    fn test_apply_length_truncation() {
        let base = json!({"xs": [1, 2, 3, 4]});
        let patch = Patch::replace(path!["xs", "length"], json!(1));
        assert_eq!(apply_patches(&base, &[patch]).unwrap(), json!({"xs": [1]}));

        let grow = Patch::replace(path!["xs", "length"], json!(10));
        assert!(matches!(
            apply_patches(&base, &[grow]),
            Err(Error::UnsupportedPatch(_))
        ));
    }

    #[test]
    fn test_apply_rejects_bad_shapes() {
        let base = json!({"n": {"x": 1}, "xs": [1]});

        let int_on_map = Patch::remove(path!["n", 0usize]);
        assert!(matches!(
            apply_patches(&base, &[int_on_map]),
            Err(Error::UnsupportedPatch(_))
        ));

        let through_primitive = Patch::replace(path!["n", "x", "deeper"], json!(2));
        assert!(matches!(
            apply_patches(&base, &[through_primitive]),
            Err(Error::Traversal(_))
        ));

        let past_end = Patch::add(path!["xs", 5usize], json!(2));
        assert!(matches!(
            apply_patches(&base, &[past_end]),
            Err(Error::UnsupportedPatch(_))
        ));

        let root_add = Patch::add(vec![], json!({}));
        assert!(matches!(
            apply_patches(&base, &[root_add]),
            Err(Error::UnsupportedPatch(_))
        ));

        let root_mismatch = Patch::replace(vec![], json!([]));
        assert!(matches!(
            apply_patches(&base, &[root_mismatch]),
            Err(Error::UnsupportedPatch(_))
        ));
    }

    #[test]
    fn test_apply_rejects_integers_above_i64() {
        let base = json!({});
        let nested = Patch::add(path!["n1"], json!({"ids": [1, u64::MAX]}));
        assert!(matches!(
            apply_patches(&base, &[nested]),
            Err(Error::UnsupportedPatch(_))
        ));

        let edge = Patch::add(path!["n1"], json!(i64::MAX as u64));
        assert_eq!(
            apply_patches(&base, &[edge]).unwrap(),
            json!({"n1": i64::MAX})
        );
    }

    #[test]
    fn test_apply_is_all_or_nothing() {
        let base = json!({"a": 1});
        let patches = vec![
            Patch::replace(path!["a"], json!(2)),
            Patch::replace(path!["a", "b"], json!(3)),
        ];
        assert!(apply_patches(&base, &patches).is_err());
        assert_eq!(base, json!({"a": 1}));
    }

    #[test]
    fn test_diff_nested_replace() {
        let prev = json!({"n1": {"id": "n1", "x": 0, "y": 0}});
        let next = json!({"n1": {"id": "n1", "x": 0, "y": 88}});
        assert_eq!(diff(&prev, &next), vec![Patch::replace(path!["n1", "y"], json!(88))]);
    }

    #[test]
    fn test_diff_equal_is_empty() {
        let v = json!({"a": [1, {"b": null}]});
        assert!(diff(&v, &v).is_empty());
    }

    #[test]
    fn test_diff_replays_to_target() {
        let prev = json!({"a": 1, "gone": true, "xs": [1, 2, 3, 4], "t": "s"});
        let next = json!({"a": 2, "new": {"k": []}, "xs": [1, 5], "t": [1]});
        let patches = diff(&prev, &next);
        assert_eq!(apply_patches(&prev, &patches).unwrap(), next);
    }
}
