//! In-process evaluation of resolved queries over JSON rows.
//!
//! The memory and tabular backends keep rows as JSON objects and run a
//! [`Query`] here. The document backend reuses the join step for refs it
//! cannot express natively.

use crate::error::CoreResult;
use crate::geometry::Geometry;
use crate::manifest::Manifest;
use crate::types::{ModelId, Row};
use crate::ufunc::{CmpOp, Column, ColumnFunc, Cond, Join, Query, SortKey};
use crate::value::{compare_values, semantic_eq, set_path};
use serde_json::{json, Value};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

fn walk<'v>(value: &'v Value, segments: &[&str], out: &mut Vec<&'v Value>) {
    match (value, segments.split_first()) {
        (Value::Array(items), _) => {
            for item in items {
                walk(item, segments, out);
            }
        }
        (_, None) => out.push(value),
        (Value::Object(map), Some((head, rest))) => {
            if let Some(inner) = map.get(*head) {
                walk(inner, rest, out);
            }
        }
        _ => {}
    }
}

fn apply_func(func: ColumnFunc, value: Value) -> Value {
    match (func, value) {
        (ColumnFunc::Lower, Value::String(s)) => Value::String(s.to_lowercase()),
        (ColumnFunc::Upper, Value::String(s)) => Value::String(s.to_uppercase()),
        (ColumnFunc::Flip, Value::String(s)) => match Geometry::parse(&s) {
            Ok((_, geom)) => Value::String(geom.flip().to_string()),
            Err(_) => Value::String(s),
        },
        (_, other) => other,
    }
}

fn place_values<'r>(row: &'r Row, place: &str) -> Vec<&'r Value> {
    let mut segments = place.split('.');
    let Some(root) = segments.next().and_then(|head| row.get(head)) else {
        return Vec::new();
    };
    let rest: Vec<&str> = segments.collect();
    let mut found = Vec::new();
    walk(root, &rest, &mut found);
    found
}

/// Every value a column yields for a row. Arrays along the place are
/// flattened; missing places yield nothing.
#[must_use]
pub fn column_values(row: &Row, column: &Column) -> Vec<Value> {
    place_values(row, &column.place)
        .into_iter()
        .map(|v| column.funcs.iter().fold(v.clone(), |acc, f| apply_func(*f, acc)))
        .collect()
}

/// The value a row sorts by: its first column value, or `null`.
#[must_use]
pub fn sort_value(row: &Row, column: &Column) -> Value {
    column_values(row, column)
        .into_iter()
        .next()
        .unwrap_or(Value::Null)
}

fn comparable(a: &Value, b: &Value) -> bool {
    matches!(
        (a, b),
        (Value::Number(_), Value::Number(_))
            | (Value::String(_), Value::String(_))
            | (Value::Bool(_), Value::Bool(_))
    )
}

fn compare_one(value: &Value, op: CmpOp, expected: &Value) -> bool {
    match op {
        CmpOp::Eq => semantic_eq(value, expected),
        CmpOp::Ne => !semantic_eq(value, expected),
        _ if !comparable(value, expected) => false,
        CmpOp::Lt => compare_values(value, expected) == Ordering::Less,
        CmpOp::Le => compare_values(value, expected) != Ordering::Greater,
        CmpOp::Gt => compare_values(value, expected) == Ordering::Greater,
        CmpOp::Ge => compare_values(value, expected) != Ordering::Less,
    }
}

fn key_order(a: &Value, b: &Value, key: &SortKey) -> Ordering {
    let ord = compare_values(a, b);
    if key.descending {
        ord.reverse()
    } else {
        ord
    }
}

/// Whether a row satisfies a condition.
#[must_use]
pub fn matches(row: &Row, cond: &Cond) -> bool {
    match cond {
        Cond::And(conds) => conds.iter().all(|c| matches(row, c)),
        Cond::Or(conds) => conds.iter().any(|c| matches(row, c)),
        Cond::Not(inner) => !matches(row, inner),
        Cond::Compare { column, op, value } => {
            let mut values = column_values(row, column);
            if values.is_empty() {
                values.push(Value::Null);
            }
            match op {
                CmpOp::Ne => !values.iter().any(|v| semantic_eq(v, value)),
                _ => values.iter().any(|v| compare_one(v, *op, value)),
            }
        }
        Cond::Contains { column, value } => column_values(row, column)
            .iter()
            .any(|v| v.as_str().is_some_and(|s| s.contains(value.as_str()))),
        Cond::StartsWith { column, value } => column_values(row, column)
            .iter()
            .any(|v| v.as_str().is_some_and(|s| s.starts_with(value.as_str()))),
        Cond::After { keys, values } => {
            for (key, last) in keys.iter().zip(values) {
                match key_order(&sort_value(row, &key.column), last, key) {
                    Ordering::Equal => continue,
                    ord => return ord == Ordering::Greater,
                }
            }
            false
        }
    }
}

/// Orders two rows by the given keys.
#[must_use]
pub fn compare_rows(a: &Row, b: &Row, keys: &[SortKey]) -> Ordering {
    keys.iter()
        .map(|key| key_order(&sort_value(a, &key.column), &sort_value(b, &key.column), key))
        .find(|ord| *ord != Ordering::Equal)
        .unwrap_or(Ordering::Equal)
}

fn row_id(row: &Row) -> Option<&str> {
    row.get("_id").and_then(Value::as_str)
}

fn ref_id(value: &Value) -> Option<&str> {
    value.get("_id").and_then(Value::as_str)
}

fn embed(value: &mut Value, segments: &[&str], targets: &HashMap<String, Row>) {
    match (value, segments.split_first()) {
        (Value::Array(items), _) => {
            for item in items {
                embed(item, segments, targets);
            }
        }
        (value, None) => {
            let target = ref_id(value).and_then(|id| targets.get(id)).cloned();
            if let Some(target) = target {
                *value = Value::Object(target);
            }
        }
        (Value::Object(map), Some((head, rest))) => {
            if let Some(inner) = map.get_mut(*head) {
                embed(inner, rest, targets);
            }
        }
        _ => {}
    }
}

fn pointing_at<'r>(rows: &'r [Row], place: &str, id: &str) -> impl Iterator<Item = &'r Row> + 'r {
    let place = format!("{place}._id");
    let id = Value::from(id);
    rows.iter()
        .filter(move |row| place_values(row, &place).iter().any(|v| **v == id))
}

/// Performs the joins of a query on every row. `fetch` returns every row
/// of a joined model.
///
/// # Errors
///
/// Propagates `fetch` failures.
pub fn apply_joins(
    manifest: &Manifest,
    joins: &[Join],
    rows: &mut [Row],
    fetch: &mut dyn FnMut(ModelId) -> CoreResult<Vec<Row>>,
) -> CoreResult<()> {
    for join in joins {
        let place = manifest.property(join.prop()).place.clone();
        let others = fetch(join.model())?;
        match join {
            Join::Ref { .. } => {
                let targets: HashMap<String, Row> = others
                    .into_iter()
                    .filter_map(|r| row_id(&r).map(str::to_string).map(|id| (id, r)))
                    .collect();
                let segments: Vec<&str> = place.split('.').collect();
                for row in rows.iter_mut() {
                    if let Some(root) = row.get_mut(segments[0]) {
                        embed(root, &segments[1..], &targets);
                    }
                }
            }
            Join::BackRef { refprop, .. } => {
                let refplace = &manifest.property(*refprop).place;
                for row in rows.iter_mut() {
                    let id = row_id(row).unwrap_or_default().to_string();
                    let items: Vec<Value> = pointing_at(&others, refplace, &id)
                        .filter_map(row_id)
                        .map(|source| json!({ "_id": source }))
                        .collect();
                    set_path(row, &place, Value::Array(items));
                }
            }
            Join::Intermediate { left, right, .. } => {
                let left = &manifest.property(*left).place;
                let right = &manifest.property(*right).place;
                for row in rows.iter_mut() {
                    let id = row_id(row).unwrap_or_default().to_string();
                    let items: Vec<Value> = pointing_at(&others, left, &id)
                        .filter_map(|link| link.get(right.as_str()).and_then(ref_id))
                        .map(|item| json!({ "_id": item }))
                        .collect();
                    set_path(row, &place, Value::Array(items));
                }
            }
        }
    }
    Ok(())
}

/// Runs a query over the rows of its model: joins, filter, distinct,
/// ordering, offset, limit and count, in that order.
///
/// # Errors
///
/// Propagates `fetch` failures.
pub fn run_query(
    manifest: &Manifest,
    query: &Query,
    mut rows: Vec<Row>,
    fetch: &mut dyn FnMut(ModelId) -> CoreResult<Vec<Row>>,
) -> CoreResult<Vec<Row>> {
    apply_joins(manifest, &query.joins, &mut rows, fetch)?;
    if let Some(filter) = &query.filter {
        rows.retain(|row| matches(row, filter));
    }
    if query.distinct {
        let mut seen = HashSet::new();
        rows.retain(|row| {
            let key = if query.select.is_empty() {
                Value::Object(row.clone()).to_string()
            } else {
                let values: Vec<Value> = query
                    .select
                    .iter()
                    .map(|s| Value::Array(column_values(row, &s.column)))
                    .collect();
                Value::Array(values).to_string()
            };
            seen.insert(key)
        });
    }
    if query.count {
        let mut out = Row::new();
        out.insert("count".into(), Value::from(rows.len()));
        return Ok(vec![out]);
    }
    let ordering = query.ordering();
    if !ordering.is_empty() {
        rows.sort_by(|a, b| compare_rows(a, b, ordering));
    }
    let skip = query.offset.unwrap_or(0);
    let take = query.row_limit().unwrap_or(usize::MAX);
    Ok(rows.into_iter().skip(skip).take(take).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PropertyId;

    fn col(place: &str) -> Column {
        Column {
            prop: PropertyId(0),
            place: place.into(),
            join: None,
            funcs: Vec::new(),
        }
    }

    fn row(v: Value) -> Row {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn values_flatten_arrays() {
        let r = row(json!({"notes": [{"note": "a"}, {"note": "b"}, {"other": 1}], "tags": ["x", "y"]}));
        assert_eq!(column_values(&r, &col("notes.note")), vec![json!("a"), json!("b")]);
        assert_eq!(column_values(&r, &col("tags")), vec![json!("x"), json!("y")]);
        assert!(column_values(&r, &col("missing.deep")).is_empty());
        assert_eq!(sort_value(&r, &col("missing")), Value::Null);
    }

    #[test]
    fn functions_apply_to_values() {
        let r = row(json!({"name": "Vilnius", "point": "POINT (1 2)"}));
        let mut lower = col("name");
        lower.funcs.push(ColumnFunc::Lower);
        assert_eq!(column_values(&r, &lower), vec![json!("vilnius")]);
        let mut flip = col("point");
        flip.funcs.push(ColumnFunc::Flip);
        assert_eq!(column_values(&r, &flip), vec![json!("POINT (2 1)")]);
    }

    #[test]
    fn comparisons_are_existential() {
        let r = row(json!({"notes": [{"note": "a"}, {"note": "b"}], "count": 5, "status": null}));
        let cmp = |place: &str, op, value: Value| {
            matches(&r, &Cond::Compare { column: col(place), op, value })
        };
        assert!(cmp("notes.note", CmpOp::Eq, json!("b")));
        assert!(!cmp("notes.note", CmpOp::Ne, json!("b")));
        assert!(cmp("notes.note", CmpOp::Ne, json!("c")));
        assert!(cmp("count", CmpOp::Gt, json!(4)));
        assert!(cmp("count", CmpOp::Le, json!(5.0)));
        assert!(!cmp("count", CmpOp::Lt, json!("9")));
        assert!(cmp("status", CmpOp::Eq, Value::Null));
        assert!(cmp("absent", CmpOp::Eq, Value::Null));
        assert!(!cmp("absent", CmpOp::Lt, json!(1)));
        assert!(matches(&r, &Cond::StartsWith { column: col("notes.note"), value: "b".into() }));
        assert!(!matches(&r, &Cond::Contains { column: col("notes.note"), value: "z".into() }));
    }

    #[test]
    fn after_is_a_tuple_comparison() {
        let keys = vec![
            SortKey { column: col("a"), descending: true },
            SortKey { column: col("b"), descending: false },
        ];
        let after = Cond::After { keys, values: vec![json!(2), json!(5)] };
        assert!(matches(&row(json!({"a": 1, "b": 0})), &after));
        assert!(matches(&row(json!({"a": 2, "b": 6})), &after));
        assert!(!matches(&row(json!({"a": 2, "b": 5})), &after));
        assert!(!matches(&row(json!({"a": 3, "b": 9})), &after));
        assert!(matches(&row(json!({"a": null, "b": 0})), &after));
    }

    #[test]
    fn nulls_sort_first_ascending_and_last_descending() {
        let mut rows = vec![row(json!({"a": 2})), row(json!({"a": null})), row(json!({"a": 1}))];
        let asc = [SortKey { column: col("a"), descending: false }];
        rows.sort_by(|x, y| compare_rows(x, y, &asc));
        let order: Vec<Value> = rows.iter().map(|r| r["a"].clone()).collect();
        assert_eq!(order, vec![Value::Null, json!(1), json!(2)]);
        let desc = [SortKey { column: col("a"), descending: true }];
        rows.sort_by(|x, y| compare_rows(x, y, &desc));
        let order: Vec<Value> = rows.iter().map(|r| r["a"].clone()).collect();
        assert_eq!(order, vec![json!(2), json!(1), Value::Null]);
    }
}
