//! Replays a list of [`PatchOperation`]s onto a JSON document.
//!
//! Used to reconstruct an "after" snapshot from a stored "before" snapshot
//! and its diff. `oldValue` is informational and ignored here.

use serde_json::Value;

use super::{unescape_token, PatchOp, PatchOperation};
use crate::{AppError, Result};

/// Apply `ops` in order to a copy of `document`.
///
/// # Errors
///
/// Returns `AppError::Validation` if a path does not resolve against the
/// document, or an `add`/`replace` carries no value.
pub fn apply(document: &Value, ops: &[PatchOperation]) -> Result<Value> {
    let mut doc = document.clone();
    for op in ops {
        apply_one(&mut doc, op)?;
    }
    Ok(doc)
}

fn apply_one(doc: &mut Value, op: &PatchOperation) -> Result<()> {
    let tokens = parse_pointer(&op.path)?;
    let Some((last, parents)) = tokens.split_last() else {
        // Root pointer.
        *doc = match op.op {
            PatchOp::Remove => Value::Null,
            PatchOp::Add | PatchOp::Replace => required_value(op)?,
        };
        return Ok(());
    };

    let parent = resolve_mut(doc, parents, &op.path)?;
    match (op.op, parent) {
        (PatchOp::Add | PatchOp::Replace, Value::Object(map)) => {
            if op.op == PatchOp::Replace && !map.contains_key(last) {
                return Err(missing(&op.path));
            }
            map.insert(last.clone(), required_value(op)?);
        }
        (PatchOp::Remove, Value::Object(map)) => {
            map.shift_remove(last).ok_or_else(|| missing(&op.path))?;
        }
        (PatchOp::Add, Value::Array(items)) => {
            let index = if last == "-" {
                items.len()
            } else {
                array_index(last, items.len() + 1, &op.path)?
            };
            items.insert(index, required_value(op)?);
        }
        (PatchOp::Replace, Value::Array(items)) => {
            let index = array_index(last, items.len(), &op.path)?;
            items[index] = required_value(op)?;
        }
        (PatchOp::Remove, Value::Array(items)) => {
            let index = array_index(last, items.len(), &op.path)?;
            items.remove(index);
        }
        _ => return Err(missing(&op.path)),
    }
    Ok(())
}

fn required_value(op: &PatchOperation) -> Result<Value> {
    op.value
        .clone()
        .ok_or_else(|| AppError::Validation(format!("{:?} at {} has no value", op.op, op.path)))
}

fn resolve_mut<'a>(doc: &'a mut Value, tokens: &[String], path: &str) -> Result<&'a mut Value> {
    let mut cursor = doc;
    for token in tokens {
        cursor = match cursor {
            Value::Object(map) => map.get_mut(token).ok_or_else(|| missing(path))?,
            Value::Array(items) => {
                let index = array_index(token, items.len(), path)?;
                &mut items[index]
            }
            _ => return Err(missing(path)),
        };
    }
    Ok(cursor)
}

fn array_index(token: &str, bound: usize, path: &str) -> Result<usize> {
    token
        .parse::<usize>()
        .ok()
        .filter(|index| *index < bound)
        .ok_or_else(|| missing(path))
}

fn parse_pointer(path: &str) -> Result<Vec<String>> {
    if path.is_empty() {
        return Ok(Vec::new());
    }
    let Some(rest) = path.strip_prefix('/') else {
        return Err(AppError::Validation(format!("invalid pointer: {path}")));
    };
    Ok(rest.split('/').map(unescape_token).collect())
}

fn missing(path: &str) -> AppError {
    AppError::Validation(format!("patch path does not resolve: {path}"))
}
