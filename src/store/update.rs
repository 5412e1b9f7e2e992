//! Update operators: `$set`, `$unset` and `$inc`.

use serde_json::{Map, Value};

use crate::core::StoreError;

type Result<T> = std::result::Result<T, StoreError>;

/// Applies an operator patch to `doc` in place.
pub fn apply_patch(doc: &mut Value, patch: &Value) -> Result<()> {
    let ops = patch
        .as_object()
        .ok_or_else(|| StoreError::invalid_update("patch must be an object"))?;
    if ops.is_empty() {
        return Err(StoreError::invalid_update("patch is empty"));
    }

    for (op, fields) in ops {
        let fields = fields
            .as_object()
            .ok_or_else(|| StoreError::invalid_update(format!("{op} expects an object")))?;
        for (path, value) in fields {
            if path == "_id" || path.starts_with("_id.") {
                return Err(StoreError::invalid_update("_id is immutable"));
            }
            match op.as_str() {
                "$set" => set_path(doc, path, value.clone())?,
                "$unset" => unset_path(doc, path),
                "$inc" => increment(doc, path, value)?,
                other => {
                    return Err(StoreError::invalid_update(format!("unknown update operator {other}")))
                }
            }
        }
    }
    Ok(())
}

pub(crate) fn set_path(doc: &mut Value, path: &str, value: Value) -> Result<()> {
    let mut segments = path.split('.').peekable();
    let mut current = doc;
    while let Some(segment) = segments.next() {
        let map = current
            .as_object_mut()
            .ok_or_else(|| StoreError::invalid_update(format!("cannot set {path}: parent is not an object")))?;
        if segments.peek().is_none() {
            map.insert(segment.to_string(), value);
            return Ok(());
        }
        current = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    Ok(())
}

pub(crate) fn unset_path(doc: &mut Value, path: &str) {
    let (parent, leaf) = match path.rsplit_once('.') {
        Some((parent, leaf)) => (parent, leaf),
        None => ("", path),
    };
    let target = if parent.is_empty() {
        Some(doc)
    } else {
        parent
            .split('.')
            .try_fold(doc, |current, segment| current.as_object_mut()?.get_mut(segment))
    };
    if let Some(Value::Object(map)) = target {
        map.remove(leaf);
    }
}

fn increment(doc: &mut Value, path: &str, amount: &Value) -> Result<()> {
    let current = super::query::get_path(doc, path).cloned().unwrap_or(Value::from(0));
    let next = match (current.as_i64(), amount.as_i64()) {
        (Some(a), Some(b)) => Value::from(a + b),
        _ => match (current.as_f64(), amount.as_f64()) {
            (Some(a), Some(b)) => Value::from(a + b),
            _ => return Err(StoreError::invalid_update(format!("$inc on non-numeric field {path}"))),
        },
    };
    set_path(doc, path, next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_set_unset_inc() {
        let mut doc = json!({"status": "queued", "priority": 1, "extra": {"a": 1, "b": 2}});
        apply_patch(
            &mut doc,
            &json!({
                "$set": {"status": "running", "meta.startedBy": "loop"},
                "$unset": {"extra.a": ""},
                "$inc": {"priority": 2, "attempts": 1}
            }),
        )
        .unwrap();
        assert_eq!(
            doc,
            json!({
                "status": "running",
                "priority": 3,
                "extra": {"b": 2},
                "meta": {"startedBy": "loop"},
                "attempts": 1
            })
        );
    }

    #[test]
    fn test_rejects_replacement_and_id_changes() {
        let mut doc = json!({"_id": "1", "a": 1});
        assert!(apply_patch(&mut doc, &json!({"a": 2})).is_err());
        assert!(apply_patch(&mut doc, &json!({"$set": {"_id": "2"}})).is_err());
        assert!(apply_patch(&mut doc, &json!({"$inc": {"a": "x"}})).is_err());
        assert_eq!(doc, json!({"_id": "1", "a": 1}));
    }
}
