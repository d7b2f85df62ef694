//! Translation between plain JSON values and yrs containers

use crate::error::{Error, Result};
use crate::patch::{check_value, truncate_length, Patch, PatchOp, PathKey};
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use std::collections::HashMap;
use std::sync::Arc;
use yrs::types::ToJson;
use yrs::{Any, Array as _, ArrayRef, In, Map as _, MapRef, Out, ReadTxn, TransactionMut};

/// Kind of a replicated container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerKind {
    Map,
    Array,
}

impl std::fmt::Display for ContainerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerKind::Map => write!(f, "map"),
            ContainerKind::Array => write!(f, "array"),
        }
    }
}

/// Typed handle to a yrs container
#[derive(Clone)]
pub enum Container {
    Map(MapRef),
    Array(ArrayRef),
}

impl Container {
    /// Wrap a value read out of a container, if it is itself a container
    pub fn from_out(out: Out) -> Option<Self> {
        match out {
            Out::YMap(map) => Some(Container::Map(map)),
            Out::YArray(array) => Some(Container::Array(array)),
            _ => None,
        }
    }

    pub fn kind(&self) -> ContainerKind {
        match self {
            Container::Map(_) => ContainerKind::Map,
            Container::Array(_) => ContainerKind::Array,
        }
    }

    pub fn len<T: ReadTxn>(&self, txn: &T) -> u32 {
        match self {
            Container::Map(map) => map.len(txn),
            Container::Array(array) => array.len(txn),
        }
    }

    pub fn is_empty<T: ReadTxn>(&self, txn: &T) -> bool {
        self.len(txn) == 0
    }

    /// Flatten the container into a plain JSON value
    pub fn to_plain<T: ReadTxn>(&self, txn: &T) -> Value {
        match self {
            Container::Map(map) => any_to_json(&map.to_json(txn)),
            Container::Array(array) => any_to_json(&array.to_json(txn)),
        }
    }
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Container::{}", self.kind())
    }
}

/// Convert a plain value into something insertable into a container.
///
/// Objects and arrays become nested containers, scalars are stored as-is.
pub fn to_container(value: &Value) -> In {
    match value {
        Value::Object(entries) => In::Map(
            entries
                .iter()
                .map(|(k, v)| (k.as_str(), to_container(v)))
                .collect(),
        ),
        Value::Array(items) => In::Array(items.iter().map(to_container).collect()),
        scalar => In::Any(json_to_any(scalar)),
    }
}

/// Convert a plain value into an embedded (non-container) yrs value.
///
/// Integers are kept as `BigInt` so they read back as integers.
pub fn json_to_any(value: &Value) -> Any {
    match value {
        Value::Null => Any::Null,
        Value::Bool(b) => Any::Bool(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Any::BigInt(i),
            None => Any::Number(n.as_f64().unwrap_or(0.0)),
        },
        Value::String(s) => Any::String(Arc::from(s.as_str())),
        Value::Array(items) => Any::Array(Arc::from(
            items.iter().map(json_to_any).collect::<Vec<_>>(),
        )),
        Value::Object(entries) => Any::Map(Arc::new(
            entries
                .iter()
                .map(|(k, v)| (k.clone(), json_to_any(v)))
                .collect::<HashMap<_, _>>(),
        )),
    }
}

pub fn any_to_json(any: &Any) -> Value {
    match any {
        Any::Null | Any::Undefined => Value::Null,
        Any::Bool(b) => Value::Bool(*b),
        Any::Number(f) => Number::from_f64(*f).map(Value::Number).unwrap_or(Value::Null),
        Any::BigInt(i) => Value::from(*i),
        Any::String(s) => Value::String(s.to_string()),
        Any::Buffer(bytes) => Value::Array(bytes.iter().map(|b| Value::from(*b)).collect()),
        Any::Array(items) => Value::Array(items.iter().map(any_to_json).collect()),
        Any::Map(entries) => Value::Object(
            entries
                .iter()
                .map(|(k, v)| (k.clone(), any_to_json(v)))
                .collect(),
        ),
    }
}

/// Flatten any value read out of a container
pub fn out_to_json<T: ReadTxn>(out: &Out, txn: &T) -> Value {
    any_to_json(&out.to_json(txn))
}

/// Apply one patch to the container tree rooted at `root`.
///
/// Missing or null intermediate slots are filled with an empty container of
/// the kind the next path segment implies. Embedded plain objects and arrays
/// on the path are promoted to containers before descending.
pub fn apply_patch(txn: &mut TransactionMut, root: &Container, patch: &Patch) -> Result<()> {
    check_value(patch)?;
    let Some((leaf, parents)) = patch.path.split_last() else {
        return replace_root(txn, root, patch);
    };

    let mut current = root.clone();
    for (i, key) in parents.iter().enumerate() {
        current = descend(txn, &current, key, &patch.path[i + 1], patch)?;
    }

    write_leaf(txn, &current, leaf, patch)
}

fn replace_root(txn: &mut TransactionMut, root: &Container, patch: &Patch) -> Result<()> {
    if patch.op != PatchOp::Replace {
        return Err(Error::UnsupportedPatch(format!(
            "root patch must be a replace, got {}",
            patch.op
        )));
    }

    match (root, patch.value.as_ref()) {
        (Container::Map(map), Some(Value::Object(entries))) => {
            map.clear(txn);
            for (k, v) in entries {
                map.insert(txn, k.as_str(), to_container(v));
            }
            Ok(())
        }
        (Container::Array(array), Some(Value::Array(items))) => {
            let len = array.len(&*txn);
            if len > 0 {
                array.remove_range(txn, 0, len);
            }
            for (i, item) in items.iter().enumerate() {
                array.insert(txn, to_u32(i, patch)?, to_container(item));
            }
            Ok(())
        }
        (root, _) => Err(Error::UnsupportedPatch(format!(
            "root replacement does not match a {} container",
            root.kind()
        ))),
    }
}

fn descend(
    txn: &mut TransactionMut,
    current: &Container,
    key: &PathKey,
    next: &PathKey,
    patch: &Patch,
) -> Result<Container> {
    match child_of(txn, current, key, patch)? {
        Some(Out::YMap(map)) => Ok(Container::Map(map)),
        Some(Out::YArray(array)) => Ok(Container::Array(array)),
        None | Some(Out::Any(Any::Null)) | Some(Out::Any(Any::Undefined)) => {
            attach(txn, current, key, to_container(&next.empty_parent()), patch)
        }
        Some(Out::Any(plain @ (Any::Map(_) | Any::Array(_)))) => {
            attach(txn, current, key, to_container(&any_to_json(&plain)), patch)
        }
        Some(_) => Err(Error::Traversal(format!(
            "cannot descend into a primitive at {}",
            patch.describe_path()
        ))),
    }
}

fn child_of(
    txn: &TransactionMut,
    current: &Container,
    key: &PathKey,
    patch: &Patch,
) -> Result<Option<Out>> {
    match (current, key) {
        (Container::Map(map), PathKey::Key(k)) => Ok(map.get(txn, k)),
        (Container::Array(array), PathKey::Index(idx)) => {
            let idx = to_u32(*idx, patch)?;
            let len = array.len(txn);
            if idx > len {
                return Err(Error::UnsupportedPatch(format!(
                    "index {} out of bounds ({}) at {}",
                    idx,
                    len,
                    patch.describe_path()
                )));
            }
            Ok(array.get(txn, idx))
        }
        (container, key) => Err(Error::UnsupportedPatch(format!(
            "key {} cannot address a {} at {}",
            key,
            container.kind(),
            patch.describe_path()
        ))),
    }
}

/// Store `value` at `key` in `current` and return it as a container
fn attach(
    txn: &mut TransactionMut,
    current: &Container,
    key: &PathKey,
    value: In,
    patch: &Patch,
) -> Result<Container> {
    let out = match (current, key) {
        (Container::Map(map), PathKey::Key(k)) => map.insert(txn, k.as_str(), value),
        (Container::Array(array), PathKey::Index(idx)) => {
            let idx = to_u32(*idx, patch)?;
            if idx < array.len(&*txn) {
                array.remove_range(txn, idx, 1);
            }
            array.insert(txn, idx, value)
        }
        (container, key) => {
            return Err(Error::UnsupportedPatch(format!(
                "key {} cannot address a {} at {}",
                key,
                container.kind(),
                patch.describe_path()
            )))
        }
    };

    Container::from_out(out).ok_or_else(|| {
        Error::Traversal(format!(
            "attached value is not a container at {}",
            patch.describe_path()
        ))
    })
}

fn write_leaf(
    txn: &mut TransactionMut,
    target: &Container,
    key: &PathKey,
    patch: &Patch,
) -> Result<()> {
    match (target, key) {
        (Container::Map(map), PathKey::Key(k)) => {
            match patch.op {
                PatchOp::Add | PatchOp::Replace => {
                    map.insert(txn, k.as_str(), to_container(&patch.value_or_null()));
                }
                PatchOp::Remove => {
                    map.remove(txn, k);
                }
            }
            Ok(())
        }
        (Container::Array(array), PathKey::Index(idx)) => {
            let idx = to_u32(*idx, patch)?;
            let len = array.len(&*txn);
            match patch.op {
                PatchOp::Add if idx <= len => {
                    array.insert(txn, idx, to_container(&patch.value_or_null()));
                }
                // no native replace: delete then insert at the same index
                PatchOp::Replace if idx < len => {
                    array.remove_range(txn, idx, 1);
                    array.insert(txn, idx, to_container(&patch.value_or_null()));
                }
                PatchOp::Remove if idx < len => {
                    array.remove_range(txn, idx, 1);
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
        (Container::Array(array), PathKey::Key(k)) => {
            let len = array.len(&*txn);
            match truncate_length(patch, k, len as usize) {
                Some(new_len) => {
                    let new_len = to_u32(new_len, patch)?;
                    array.remove_range(txn, new_len, len - new_len);
                    Ok(())
                }
                None => Err(Error::UnsupportedPatch(format!(
                    "{} with key {} on an array at {}",
                    patch.op,
                    k,
                    patch.describe_path()
                ))),
            }
        }
        (Container::Map(_), PathKey::Index(idx)) => Err(Error::UnsupportedPatch(format!(
            "{} with integer key {} on a map at {}",
            patch.op,
            idx,
            patch.describe_path()
        ))),
    }
}

fn to_u32(idx: usize, patch: &Patch) -> Result<u32> {
    u32::try_from(idx).map_err(|_| {
        Error::UnsupportedPatch(format!(
            "index {} exceeds container limits at {}",
            idx,
            patch.describe_path()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::apply_patches;
    use crate::path;
    use serde_json::json;
    use yrs::{Doc, Transact};

    fn apply_all(doc: &Doc, root: &Container, patches: &[Patch]) -> Result<()> {
        let mut txn = doc.transact_mut();
        for patch in patches {
            apply_patch(&mut txn, root, patch)?;
        }
        Ok(())
    }

    fn plain(doc: &Doc, root: &Container) -> Value {
        let txn = doc.transact();
        root.to_plain(&txn)
    }

    #[test]
    fn test_round_trip_matches_plain_apply() {
        let doc = Doc::new();
        let root = Container::Map(doc.get_or_insert_map("root"));

        let patches = vec![
            Patch::add(path!["n1"], json!({"id": "n1", "x": 0, "y": 0.5, "tags": ["a"]})),
            Patch::replace(path!["n1", "x"], json!(12)),
            Patch::add(path!["n1", "tags", 1usize], json!("b")),
            Patch::add(path!["n1", "tags", 0usize], json!({"k": true})),
            Patch::replace(path!["n1", "tags", 2usize], json!(null)),
            Patch::add(path!["fresh", "deep", "leaf"], json!("v")),
            Patch::add(path!["list", 0usize], json!(1)),
            Patch::remove(path!["n1", "tags", 0usize]),
            Patch::remove(path!["missing"]),
        ];

        apply_all(&doc, &root, &patches).unwrap();

        let expected = apply_patches(&json!({}), &patches).unwrap();
        assert_eq!(plain(&doc, &root), expected);
    }

    #[test]
    fn test_root_replace_map_and_array() {
        let doc = Doc::new();
        let map = Container::Map(doc.get_or_insert_map("m"));
        let array = Container::Array(doc.get_or_insert_array("a"));

        apply_all(&doc, &map, &[Patch::add(path!["old"], json!(1))]).unwrap();
        apply_all(&doc, &map, &[Patch::replace(vec![], json!({"new": {"x": 1}}))]).unwrap();
        assert_eq!(plain(&doc, &map), json!({"new": {"x": 1}}));

        apply_all(&doc, &array, &[Patch::replace(vec![], json!([1, 2]))]).unwrap();
        apply_all(&doc, &array, &[Patch::replace(vec![], json!([3]))]).unwrap();
        assert_eq!(plain(&doc, &array), json!([3]));
    }

    #[test]
    fn test_root_shape_mismatch_is_unsupported() {
        let doc = Doc::new();
        let map = Container::Map(doc.get_or_insert_map("m"));
        let result = apply_all(&doc, &map, &[Patch::replace(vec![], json!([1]))]);
        assert!(matches!(result, Err(Error::UnsupportedPatch(_))));

        let result = apply_all(&doc, &map, &[Patch::add(vec![], json!({}))]);
        assert!(matches!(result, Err(Error::UnsupportedPatch(_))));
    }

    #[test]
    fn test_integer_key_on_map_is_unsupported() {
        let doc = Doc::new();
        let map = Container::Map(doc.get_or_insert_map("m"));
        let result = apply_all(&doc, &map, &[Patch::remove(path![0usize])]);
        assert!(matches!(result, Err(Error::UnsupportedPatch(_))));
    }

    #[test]
    fn test_descending_into_primitive_fails() {
        let doc = Doc::new();
        let map = Container::Map(doc.get_or_insert_map("m"));
        apply_all(&doc, &map, &[Patch::add(path!["x"], json!(5))]).unwrap();

        let result = apply_all(&doc, &map, &[Patch::add(path!["x", "y"], json!(1))]);
        assert!(matches!(result, Err(Error::Traversal(_))));
    }

    #[test]
    fn test_length_truncation() {
        let doc = Doc::new();
        let array = Container::Array(doc.get_or_insert_array("a"));
        apply_all(&doc, &array, &[Patch::replace(vec![], json!([1, 2, 3, 4]))]).unwrap();
        apply_all(&doc, &array, &[Patch::replace(path!["length"], json!(2))]).unwrap();
        assert_eq!(plain(&doc, &array), json!([1, 2]));
    }

    #[test]
    fn test_embedded_plain_object_is_promoted() {
        let doc = Doc::new();
        let map = Container::Map(doc.get_or_insert_map("m"));
        {
            let mut txn = doc.transact_mut();
            if let Container::Map(m) = &map {
                m.insert(&mut txn, "plain", In::Any(json_to_any(&json!({"a": 1}))));
            }
        }

        apply_all(&doc, &map, &[Patch::add(path!["plain", "b"], json!(2))]).unwrap();
        assert_eq!(plain(&doc, &map), json!({"plain": {"a": 1, "b": 2}}));

        let txn = doc.transact();
        if let Container::Map(m) = &map {
            assert!(matches!(m.get(&txn, "plain"), Some(Out::YMap(_))));
        }
    }

    #[test]
    fn test_integers_above_i64_are_rejected() {
        let doc = Doc::new();
        let map = Container::Map(doc.get_or_insert_map("m"));

        let result = apply_all(&doc, &map, &[Patch::add(path!["big"], json!(u64::MAX))]);
        assert!(matches!(result, Err(Error::UnsupportedPatch(_))));
        assert_eq!(plain(&doc, &map), json!({}));
    }

    #[test]
    fn test_numbers_keep_their_kind() {
        assert_eq!(any_to_json(&json_to_any(&json!(88))), json!(88));
        assert_eq!(any_to_json(&json_to_any(&json!(1.5))), json!(1.5));
        assert_eq!(any_to_json(&json_to_any(&json!(-3))), json!(-3));
    }
}
