//! Cursor options (sort, skip, limit, projection) and the aggregation pipeline.

use std::cmp::Ordering;

use serde_json::{Map, Value};

use super::query::{compare_values, get_path, matches, truthy};
use super::update::{set_path, unset_path};
use crate::core::StoreError;

type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

/// Ordered list of sort keys. Ties keep insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SortSpec {
    keys: Vec<(String, SortOrder)>,
}

impl SortSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn asc(mut self, field: impl Into<String>) -> Self {
        self.keys.push((field.into(), SortOrder::Asc));
        self
    }

    pub fn desc(mut self, field: impl Into<String>) -> Self {
        self.keys.push((field.into(), SortOrder::Desc));
        self
    }

    /// Parses a `{field: 1 | -1}` sort document, keeping key order.
    pub fn from_document(doc: &Value) -> Result<Self> {
        let fields = doc
            .as_object()
            .ok_or_else(|| StoreError::invalid_pipeline("sort must be an object"))?;
        let mut spec = Self::new();
        for (field, order) in fields {
            spec = match order.as_i64() {
                Some(1) => spec.asc(field.as_str()),
                Some(-1) => spec.desc(field.as_str()),
                _ => {
                    return Err(StoreError::invalid_pipeline(format!(
                        "sort order for {field} must be 1 or -1"
                    )))
                }
            };
        }
        Ok(spec)
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn compare(&self, a: &Value, b: &Value) -> Ordering {
        for (field, order) in &self.keys {
            let left = get_path(a, field).unwrap_or(&Value::Null);
            let right = get_path(b, field).unwrap_or(&Value::Null);
            let ord = match order {
                SortOrder::Asc => compare_values(left, right),
                SortOrder::Desc => compare_values(right, left),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }

    /// Stable sort of `docs`.
    pub fn apply(&self, docs: &mut [Value]) {
        if !self.is_empty() {
            docs.sort_by(|a, b| self.compare(a, b));
        }
    }
}

/// Options accepted by `Collection::find`.
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    pub sort: Option<SortSpec>,
    pub skip: usize,
    pub limit: Option<usize>,
    pub projection: Option<Value>,
}

impl FindOptions {
    pub fn sorted(sort: SortSpec) -> Self {
        Self {
            sort: Some(sort),
            ..Self::default()
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_skip(mut self, skip: usize) -> Self {
        self.skip = skip;
        self
    }

    pub fn with_projection(mut self, projection: Value) -> Self {
        self.projection = Some(projection);
        self
    }

    pub(crate) fn apply(&self, mut docs: Vec<Value>) -> Result<Vec<Value>> {
        if let Some(sort) = &self.sort {
            sort.apply(&mut docs);
        }
        let limit = self.limit.unwrap_or(usize::MAX);
        let docs = docs.into_iter().skip(self.skip).take(limit);
        match &self.projection {
            Some(projection) => docs.map(|doc| project(&doc, projection)).collect(),
            None => Ok(docs.collect()),
        }
    }
}

/// Applies an inclusion (`{a: 1}`) or exclusion (`{a: 0}`) projection.
/// `_id` is kept unless explicitly excluded.
pub fn project(doc: &Value, projection: &Value) -> Result<Value> {
    let fields = projection
        .as_object()
        .ok_or_else(|| StoreError::invalid_pipeline("projection must be an object"))?;
    let include = fields
        .iter()
        .any(|(field, flag)| field != "_id" && truthy(flag));

    let mut out = if include {
        let mut out = Value::Object(Map::new());
        for (field, flag) in fields {
            if truthy(flag) {
                if let Some(value) = get_path(doc, field) {
                    set_path(&mut out, field, value.clone())?;
                }
            }
        }
        if let (Some(id), Value::Object(map)) = (doc.get("_id"), &mut out) {
            map.insert("_id".to_string(), id.clone());
        }
        out
    } else {
        doc.clone()
    };

    for (field, flag) in fields {
        if !truthy(flag) {
            unset_path(&mut out, field);
        }
    }
    Ok(out)
}

/// Runs `$match`, `$sort`, `$skip`, `$limit`, `$project` and `$count` stages.
pub fn run_pipeline(mut docs: Vec<Value>, pipeline: &[Value]) -> Result<Vec<Value>> {
    for stage in pipeline {
        let (name, spec) = stage
            .as_object()
            .filter(|map| map.len() == 1)
            .and_then(|map| map.iter().next())
            .ok_or_else(|| StoreError::invalid_pipeline("each stage must have exactly one operator"))?;

        docs = match name.as_str() {
            "$match" => {
                let mut kept = Vec::with_capacity(docs.len());
                for doc in docs {
                    if matches(&doc, spec)? {
                        kept.push(doc);
                    }
                }
                kept
            }
            "$sort" => {
                SortSpec::from_document(spec)?.apply(&mut docs);
                docs
            }
            "$skip" => {
                let n = count_arg(name, spec)?;
                docs.into_iter().skip(n).collect()
            }
            "$limit" => {
                let n = count_arg(name, spec)?;
                docs.into_iter().take(n).collect()
            }
            "$project" => docs
                .iter()
                .map(|doc| project(doc, spec))
                .collect::<Result<Vec<_>>>()?,
            "$count" => {
                let field = spec
                    .as_str()
                    .ok_or_else(|| StoreError::invalid_pipeline("$count expects a field name"))?;
                vec![serde_json::json!({ field: docs.len() })]
            }
            other => return Err(StoreError::invalid_pipeline(format!("unsupported stage {other}"))),
        };
    }
    Ok(docs)
}

fn count_arg(name: &str, spec: &Value) -> Result<usize> {
    spec.as_u64()
        .map(|n| n as usize)
        .ok_or_else(|| StoreError::invalid_pipeline(format!("{name} expects a non-negative integer")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn docs() -> Vec<Value> {
        vec![
            json!({"_id": "1", "uuid": "a", "priority": 0, "createdAt": 1, "status": "queued"}),
            json!({"_id": "2", "uuid": "b", "priority": 5, "createdAt": 2, "status": "queued"}),
            json!({"_id": "3", "uuid": "c", "priority": 5, "createdAt": 3, "status": "done"}),
            json!({"_id": "4", "uuid": "d", "priority": 1, "createdAt": 4, "status": "queued"}),
        ]
    }

    fn uuids(docs: &[Value]) -> Vec<&str> {
        docs.iter().filter_map(|d| d["uuid"].as_str()).collect()
    }

    #[test]
    fn test_sort_priority_desc_created_asc() {
        let mut all = docs();
        SortSpec::new().desc("priority").asc("createdAt").apply(&mut all);
        assert_eq!(uuids(&all), vec!["b", "c", "d", "a"]);
    }

    #[test]
    fn test_find_options_skip_limit_projection() {
        let options = FindOptions::sorted(SortSpec::new().asc("createdAt"))
            .with_skip(1)
            .with_limit(2)
            .with_projection(json!({"uuid": 1, "_id": 0}));
        let out = options.apply(docs()).unwrap();
        assert_eq!(out, vec![json!({"uuid": "b"}), json!({"uuid": "c"})]);
    }

    #[test]
    fn test_exclusion_projection() {
        let out = project(&docs()[0], &json!({"status": 0, "createdAt": 0})).unwrap();
        assert_eq!(out, json!({"_id": "1", "uuid": "a", "priority": 0}));
    }

    #[test]
    fn test_pipeline_stages() {
        let out = run_pipeline(
            docs(),
            &[
                json!({"$match": {"status": "queued"}}),
                json!({"$sort": {"priority": -1}}),
                json!({"$limit": 2}),
                json!({"$project": {"uuid": 1}}),
            ],
        )
        .unwrap();
        assert_eq!(out, vec![json!({"uuid": "b", "_id": "2"}), json!({"uuid": "d", "_id": "4"})]);

        let count = run_pipeline(docs(), &[json!({"$match": {"priority": 5}}), json!({"$count": "n"})]).unwrap();
        assert_eq!(count, vec![json!({"n": 2})]);
    }

    #[test]
    fn test_pipeline_rejects_unknown_stage() {
        assert!(run_pipeline(docs(), &[json!({"$group": {}})]).is_err());
        assert!(run_pipeline(docs(), &[json!({"$limit": -1})]).is_err());
    }
}
