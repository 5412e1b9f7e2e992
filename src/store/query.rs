//! Mongo-style query matching over JSON documents.
//!
//! Supported field operators: `$eq`, `$ne`, `$gt`, `$gte`, `$lt`, `$lte`,
//! `$in`, `$nin`, `$exists`, `$not`. Logical operators: `$or`, `$and`, `$nor`.
//! `$expr` evaluates an aggregation expression against the document.

use std::cmp::Ordering;

use chrono::Utc;
use serde_json::{Map, Number, Value};

use crate::core::StoreError;

type Result<T> = std::result::Result<T, StoreError>;

/// Resolves a dotted path (`data.book`, `items.0`) inside a document.
pub fn get_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = doc;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Returns true when `doc` satisfies `query`.
pub fn matches(doc: &Value, query: &Value) -> Result<bool> {
    let clauses = query
        .as_object()
        .ok_or_else(|| StoreError::invalid_query("query must be an object"))?;
    let now = Utc::now().timestamp_millis();

    for (key, condition) in clauses {
        let ok = match key.as_str() {
            "$or" => any_of(doc, condition)?,
            "$and" => all_of(doc, condition)?,
            "$nor" => !any_of(doc, condition)?,
            "$expr" => truthy(&eval_expr(doc, condition, now)?),
            op if op.starts_with('$') => {
                return Err(StoreError::invalid_query(format!("unknown top-level operator {op}")))
            }
            path => match_field(get_path(doc, path), condition)?,
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn subqueries(condition: &Value) -> Result<&Vec<Value>> {
    condition
        .as_array()
        .ok_or_else(|| StoreError::invalid_query("logical operators expect an array"))
}

fn any_of(doc: &Value, condition: &Value) -> Result<bool> {
    for query in subqueries(condition)? {
        if matches(doc, query)? {
            return Ok(true);
        }
    }
    Ok(false)
}

fn all_of(doc: &Value, condition: &Value) -> Result<bool> {
    for query in subqueries(condition)? {
        if !matches(doc, query)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn is_operator_object(value: &Value) -> bool {
    match value {
        Value::Object(map) => !map.is_empty() && map.keys().all(|k| k.starts_with('$')),
        _ => false,
    }
}

fn match_field(value: Option<&Value>, condition: &Value) -> Result<bool> {
    if !is_operator_object(condition) {
        return Ok(field_equals(value, condition));
    }
    let Value::Object(ops) = condition else {
        return Ok(false);
    };
    for (op, operand) in ops {
        let ok = match op.as_str() {
            "$eq" => field_equals(value, operand),
            "$ne" => !field_equals(value, operand),
            "$gt" => field_compares(value, operand, |o| o == Ordering::Greater),
            "$gte" => field_compares(value, operand, |o| o != Ordering::Less),
            "$lt" => field_compares(value, operand, |o| o == Ordering::Less),
            "$lte" => field_compares(value, operand, |o| o != Ordering::Greater),
            "$in" => field_in(value, operand)?,
            "$nin" => !field_in(value, operand)?,
            "$exists" => value.is_some() == truthy(operand),
            "$not" => !match_field(value, operand)?,
            other => {
                return Err(StoreError::invalid_query(format!("unknown operator {other}")))
            }
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Equality with array membership and `null` matching missing fields.
fn field_equals(value: Option<&Value>, expected: &Value) -> bool {
    match value {
        None => expected.is_null(),
        Some(Value::Array(items)) if !expected.is_array() => {
            items.iter().any(|item| values_equal(item, expected))
        }
        Some(actual) => values_equal(actual, expected),
    }
}

fn field_in(value: Option<&Value>, candidates: &Value) -> Result<bool> {
    let candidates = candidates
        .as_array()
        .ok_or_else(|| StoreError::invalid_query("$in/$nin expect an array"))?;
    Ok(candidates.iter().any(|c| field_equals(value, c)))
}

/// Range comparisons only apply between values of the same type class.
fn field_compares(value: Option<&Value>, operand: &Value, accept: impl Fn(Ordering) -> bool) -> bool {
    let check = |actual: &Value| {
        type_rank(actual) == type_rank(operand) && accept(compare_values(actual, operand))
    };
    match value {
        None => false,
        Some(Value::Array(items)) if !operand.is_array() => items.iter().any(check),
        Some(actual) => check(actual),
    }
}

/// Structural equality that treats `1` and `1.0` as the same number.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| values_equal(x, y))
        }
        (Value::Object(xs), Value::Object(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .all(|(k, x)| ys.get(k).map_or(false, |y| values_equal(x, y)))
        }
        _ => a == b,
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Number(_) => 1,
        Value::String(_) => 2,
        Value::Object(_) => 3,
        Value::Array(_) => 4,
        Value::Bool(_) => 5,
    }
}

/// Total order across JSON values: null < numbers < strings < objects < arrays < booleans.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    let rank = type_rank(a).cmp(&type_rank(b));
    if rank != Ordering::Equal {
        return rank;
    }
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Array(xs), Value::Array(ys)) => {
            for (x, y) in xs.iter().zip(ys) {
                let ord = compare_values(x, y);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            xs.len().cmp(&ys.len())
        }
        (Value::Object(xs), Value::Object(ys)) => {
            for ((kx, x), (ky, y)) in xs.iter().zip(ys) {
                let ord = kx.cmp(ky).then_with(|| compare_values(x, y));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            xs.len().cmp(&ys.len())
        }
        _ => Ordering::Equal,
    }
}

/// Aggregation truthiness: `false`, `null` and `0` are false.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(false, |f| f != 0.0),
        _ => true,
    }
}

fn number(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        Value::from(value as i64)
    } else {
        Number::from_f64(value).map_or(Value::Null, Value::Number)
    }
}

/// Evaluates an aggregation expression (`$expr` operand) against `doc`.
///
/// `now` is the value of `$$NOW` in epoch milliseconds.
pub fn eval_expr(doc: &Value, expr: &Value, now: i64) -> Result<Value> {
    match expr {
        Value::String(s) if s == "$$NOW" => Ok(Value::from(now)),
        Value::String(s) if s.starts_with("$$") => {
            Err(StoreError::invalid_query(format!("unknown variable {s}")))
        }
        Value::String(s) if s.starts_with('$') => {
            Ok(get_path(doc, &s[1..]).cloned().unwrap_or(Value::Null))
        }
        Value::Array(items) => items
            .iter()
            .map(|item| eval_expr(doc, item, now))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        Value::Object(map) if map.len() == 1 && map.keys().all(|k| k.starts_with('$')) => {
            let (op, operand) = map.iter().next().ok_or_else(|| StoreError::invalid_query("empty expression"))?;
            eval_operator(doc, op, operand, now)
        }
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, value) in map {
                out.insert(key.clone(), eval_expr(doc, value, now)?);
            }
            Ok(Value::Object(out))
        }
        literal => Ok(literal.clone()),
    }
}

fn eval_args(doc: &Value, op: &str, operand: &Value, now: i64) -> Result<Vec<Value>> {
    match operand {
        Value::Array(items) => items.iter().map(|item| eval_expr(doc, item, now)).collect(),
        _ => Err(StoreError::invalid_query(format!("{op} expects an array of arguments"))),
    }
}

fn eval_pair(doc: &Value, op: &str, operand: &Value, now: i64) -> Result<(Value, Value)> {
    let mut args = eval_args(doc, op, operand, now)?;
    if args.len() != 2 {
        return Err(StoreError::invalid_query(format!("{op} expects two arguments")));
    }
    let right = args.pop().unwrap_or(Value::Null);
    let left = args.pop().unwrap_or(Value::Null);
    Ok((left, right))
}

fn eval_operator(doc: &Value, op: &str, operand: &Value, now: i64) -> Result<Value> {
    let compare = |accept: fn(Ordering) -> bool| -> Result<Value> {
        let (left, right) = eval_pair(doc, op, operand, now)?;
        Ok(Value::Bool(accept(compare_values(&left, &right))))
    };

    match op {
        "$literal" => Ok(operand.clone()),
        "$eq" => {
            let (left, right) = eval_pair(doc, op, operand, now)?;
            Ok(Value::Bool(values_equal(&left, &right)))
        }
        "$ne" => {
            let (left, right) = eval_pair(doc, op, operand, now)?;
            Ok(Value::Bool(!values_equal(&left, &right)))
        }
        "$gt" => compare(|o| o == Ordering::Greater),
        "$gte" => compare(|o| o != Ordering::Less),
        "$lt" => compare(|o| o == Ordering::Less),
        "$lte" => compare(|o| o != Ordering::Greater),
        "$and" => Ok(Value::Bool(eval_args(doc, op, operand, now)?.iter().all(truthy))),
        "$or" => Ok(Value::Bool(eval_args(doc, op, operand, now)?.iter().any(truthy))),
        "$not" => {
            let value = match operand {
                Value::Array(items) if items.len() == 1 => eval_expr(doc, &items[0], now)?,
                other => eval_expr(doc, other, now)?,
            };
            Ok(Value::Bool(!truthy(&value)))
        }
        "$add" => {
            let mut total = 0.0;
            for arg in eval_args(doc, op, operand, now)? {
                match arg.as_f64() {
                    Some(n) => total += n,
                    None if arg.is_null() => return Ok(Value::Null),
                    None => return Err(StoreError::invalid_query("$add expects numbers")),
                }
            }
            Ok(number(total))
        }
        "$subtract" => {
            let (left, right) = eval_pair(doc, op, operand, now)?;
            match (left.as_f64(), right.as_f64()) {
                (Some(l), Some(r)) => Ok(number(l - r)),
                _ if left.is_null() || right.is_null() => Ok(Value::Null),
                _ => Err(StoreError::invalid_query("$subtract expects numbers")),
            }
        }
        "$dateAdd" => date_add(doc, operand, now),
        other => Err(StoreError::invalid_query(format!("unknown expression operator {other}"))),
    }
}

/// `$dateAdd: {startDate, unit, amount}` over epoch-millisecond timestamps.
fn date_add(doc: &Value, operand: &Value, now: i64) -> Result<Value> {
    let spec = operand
        .as_object()
        .ok_or_else(|| StoreError::invalid_query("$dateAdd expects an object"))?;
    let field = |name: &str| -> Result<Value> {
        let value = spec
            .get(name)
            .ok_or_else(|| StoreError::invalid_query(format!("$dateAdd requires {name}")))?;
        eval_expr(doc, value, now)
    };

    let start = field("startDate")?;
    let amount = field("amount")?;
    let unit = field("unit")?;
    if start.is_null() || amount.is_null() {
        return Ok(Value::Null);
    }

    let factor: f64 = match unit.as_str() {
        Some("millisecond") => 1.0,
        Some("second") => 1_000.0,
        Some("minute") => 60_000.0,
        Some("hour") => 3_600_000.0,
        Some("day") => 86_400_000.0,
        Some("week") => 604_800_000.0,
        _ => return Err(StoreError::invalid_query(format!("unsupported $dateAdd unit {unit}"))),
    };
    match (start.as_f64(), amount.as_f64()) {
        (Some(start), Some(amount)) => Ok(number(start + amount * factor)),
        _ => Err(StoreError::invalid_query("$dateAdd expects numeric dates and amounts")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn task() -> Value {
        json!({
            "uuid": "a",
            "status": "running",
            "priority": 5,
            "data": { "book": "x", "tags": ["red", "blue"] },
            "endedAt": 10_000,
            "archiving": { "duration": 1_000 }
        })
    }

    #[test]
    fn test_equality_and_dotted_paths() {
        let doc = task();
        assert!(matches(&doc, &json!({"status": "running", "data.book": "x"})).unwrap());
        assert!(!matches(&doc, &json!({"data.book": "y"})).unwrap());
        assert!(matches(&doc, &json!({"data.tags": "blue"})).unwrap());
        assert!(matches(&doc, &json!({"missing": null})).unwrap());
        assert!(matches(&doc, &json!({"priority": 5.0})).unwrap());
    }

    #[test]
    fn test_field_operators() {
        let doc = task();
        assert!(matches(&doc, &json!({"status": {"$in": ["queued", "running"]}})).unwrap());
        assert!(matches(&doc, &json!({"status": {"$nin": ["done"]}})).unwrap());
        assert!(matches(&doc, &json!({"priority": {"$gt": 1, "$lte": 5}})).unwrap());
        assert!(!matches(&doc, &json!({"priority": {"$gt": "1"}})).unwrap());
        assert!(matches(&doc, &json!({"archiving.duration": {"$exists": true}})).unwrap());
        assert!(matches(&doc, &json!({"startedAt": {"$exists": false}})).unwrap());
        assert!(matches(&doc, &json!({"status": {"$ne": "done"}})).unwrap());
        assert!(matches(&doc, &json!({"priority": {"$not": {"$lt": 3}}})).unwrap());
    }

    #[test]
    fn test_logical_operators() {
        let doc = task();
        assert!(matches(&doc, &json!({"$or": [{"status": "done"}, {"uuid": "a"}]})).unwrap());
        assert!(!matches(&doc, &json!({"$and": [{"status": "running"}, {"uuid": "b"}]})).unwrap());
        assert!(matches(&doc, &json!({"$nor": [{"status": "done"}]})).unwrap());
    }

    #[test]
    fn test_expr_with_date_add() {
        let doc = task();
        let expired = json!({"$expr": {"$lt": [
            {"$dateAdd": {"startDate": "$endedAt", "unit": "millisecond", "amount": "$archiving.duration"}},
            "$$NOW"
        ]}});
        assert!(matches(&doc, &expired).unwrap());

        let value = eval_expr(
            &doc,
            &json!({"$dateAdd": {"startDate": "$endedAt", "unit": "second", "amount": 2}}),
            0,
        )
        .unwrap();
        assert_eq!(value, json!(12_000));

        let missing = eval_expr(
            &json!({}),
            &json!({"$dateAdd": {"startDate": "$endedAt", "unit": "second", "amount": 2}}),
            0,
        )
        .unwrap();
        assert_eq!(missing, Value::Null);
    }

    #[test]
    fn test_invalid_queries_are_errors() {
        let doc = task();
        assert!(matches(&doc, &json!({"status": {"$regex": "r"}})).is_err());
        assert!(matches(&doc, &json!({"$where": "1"})).is_err());
        assert!(matches(&doc, &json!([1])).is_err());
        assert!(matches(&doc, &json!({"$or": {"a": 1}})).is_err());
    }

    #[test]
    fn test_compare_values_orders_types() {
        assert_eq!(compare_values(&json!(null), &json!(0)), Ordering::Less);
        assert_eq!(compare_values(&json!(2), &json!(10)), Ordering::Less);
        assert_eq!(compare_values(&json!("b"), &json!("a")), Ordering::Greater);
        assert_eq!(compare_values(&json!(1), &json!("1")), Ordering::Less);
    }
}
