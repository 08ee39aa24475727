//! Structured diffs between before/after snapshots.
//!
//! Output follows the JSON Patch operation shape (`op`, `path`, `value`)
//! with one extension: `replace` operations also carry `oldValue`, so an
//! audit timeline can show "before → after" without replaying history.
//! Paths are JSON Pointers (`/a/0/b`, with `~` and `/` escaped).

pub mod patcher;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Patch operation kind.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PatchOp {
    /// Field present only in the after snapshot.
    Add,
    /// Field present only in the before snapshot.
    Remove,
    /// Field present in both with a different value.
    Replace,
}

/// One difference between two snapshots.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PatchOperation {
    /// Operation kind.
    pub op: PatchOp,
    /// JSON Pointer to the differing field.
    pub path: String,
    /// New value for `add`/`replace`; prior value for `remove`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// Prior value, only for `replace`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_value: Option<Value>,
}

impl PatchOperation {
    /// An `add` of `value` at `path`.
    #[must_use]
    pub fn add(path: impl Into<String>, value: Value) -> Self {
        Self {
            op: PatchOp::Add,
            path: path.into(),
            value: Some(value),
            old_value: None,
        }
    }

    /// A `remove` at `path`, carrying the removed value.
    #[must_use]
    pub fn remove(path: impl Into<String>, prior: Value) -> Self {
        Self {
            op: PatchOp::Remove,
            path: path.into(),
            value: Some(prior),
            old_value: None,
        }
    }

    /// A `replace` at `path` from `old_value` to `value`.
    #[must_use]
    pub fn replace(path: impl Into<String>, value: Value, old_value: Value) -> Self {
        Self {
            op: PatchOp::Replace,
            path: path.into(),
            value: Some(value),
            old_value: Some(old_value),
        }
    }
}

/// Property snapshot of a persisted entity, in property declaration order.
pub type PropertySnapshot = Map<String, Value>;

/// Escape one JSON Pointer reference token.
#[must_use]
pub fn escape_token(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

/// Reverse of [`escape_token`].
#[must_use]
pub fn unescape_token(token: &str) -> String {
    token.replace("~1", "/").replace("~0", "~")
}

/// Unescaped reference tokens of a JSON Pointer; empty for the root.
pub fn pointer_tokens(path: &str) -> impl Iterator<Item = String> + '_ {
    path.strip_prefix('/')
        .into_iter()
        .flat_map(|rest| rest.split('/'))
        .map(unescape_token)
}

fn child_path(parent: &str, token: &str) -> String {
    format!("{parent}/{}", escape_token(token))
}

/// Diff two DTO-shaped documents, recursing into objects and arrays.
///
/// `None` (or a JSON `null` root) on the before side means creation: every
/// top-level field of `after` becomes an `add`. `None` on the after side
/// means deletion: every top-level field of `before` becomes a `remove`.
#[must_use]
pub fn diff_values(before: Option<&Value>, after: Option<&Value>) -> Vec<PatchOperation> {
    let before = before.filter(|v| !v.is_null());
    let after = after.filter(|v| !v.is_null());
    let mut ops = Vec::new();

    match (before, after) {
        (None, None) => {}
        (None, Some(after)) => push_all(&mut ops, "", after, |p, v| PatchOperation::add(p, v)),
        (Some(before), None) => push_all(&mut ops, "", before, |p, v| {
            PatchOperation::remove(p, v)
        }),
        (Some(before), Some(after)) => walk(&mut ops, "", before, after),
    }

    ops
}

/// Diff two entity property snapshots.
///
/// Properties are compared as whole values without recursion, matching the
/// flat scalar shape of persisted rows. Operations follow the declaration
/// order of `after`, then properties dropped from `before`.
#[must_use]
pub fn diff_snapshots(
    before: Option<&PropertySnapshot>,
    after: Option<&PropertySnapshot>,
) -> Vec<PatchOperation> {
    let empty = PropertySnapshot::new();
    let before_map = before.unwrap_or(&empty);
    let after_map = after.unwrap_or(&empty);
    let mut ops = Vec::new();

    for (name, new_value) in after_map {
        let path = child_path("", name);
        match before_map.get(name) {
            None => ops.push(PatchOperation::add(path, new_value.clone())),
            Some(old_value) if old_value != new_value => {
                ops.push(PatchOperation::replace(path, new_value.clone(), old_value.clone()));
            }
            Some(_) => {}
        }
    }

    for (name, old_value) in before_map {
        if !after_map.contains_key(name) {
            ops.push(PatchOperation::remove(child_path("", name), old_value.clone()));
        }
    }

    ops
}

fn push_all(
    ops: &mut Vec<PatchOperation>,
    path: &str,
    value: &Value,
    make: fn(String, Value) -> PatchOperation,
) {
    match value {
        Value::Object(map) => {
            for (key, field) in map {
                ops.push(make(child_path(path, key), field.clone()));
            }
        }
        Value::Array(items) => {
            for (index, item) in items.iter().enumerate() {
                ops.push(make(child_path(path, &index.to_string()), item.clone()));
            }
        }
        scalar => ops.push(make(path.to_owned(), scalar.clone())),
    }
}

fn walk(ops: &mut Vec<PatchOperation>, path: &str, before: &Value, after: &Value) {
    if before == after {
        return;
    }

    match (before, after) {
        (Value::Object(old), Value::Object(new)) => {
            for (key, new_value) in new {
                let field_path = child_path(path, key);
                match old.get(key) {
                    Some(old_value) => walk(ops, &field_path, old_value, new_value),
                    None => ops.push(PatchOperation::add(field_path, new_value.clone())),
                }
            }
            for (key, old_value) in old {
                if !new.contains_key(key) {
                    ops.push(PatchOperation::remove(child_path(path, key), old_value.clone()));
                }
            }
        }
        (Value::Array(old), Value::Array(new)) => {
            let shared = old.len().min(new.len());
            for index in 0..shared {
                walk(ops, &child_path(path, &index.to_string()), &old[index], &new[index]);
            }
            for (index, item) in new.iter().enumerate().skip(shared) {
                ops.push(PatchOperation::add(child_path(path, &index.to_string()), item.clone()));
            }
            // Highest index first so each removal leaves earlier indices valid.
            for index in (shared..old.len()).rev() {
                ops.push(PatchOperation::remove(
                    child_path(path, &index.to_string()),
                    old[index].clone(),
                ));
            }
        }
        _ => ops.push(PatchOperation::replace(path, after.clone(), before.clone())),
    }
}
