//! Change log entries and row diffs.

use crate::types::{Action, Revision, Row, TxnId};
use crate::value::semantic_eq;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One committed mutation of one row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEntry {
    /// Per-model counter, assigned by the backend at commit.
    #[serde(rename = "_change")]
    pub change: u64,
    /// Transaction the change was written in.
    #[serde(rename = "_txn")]
    pub txn: TxnId,
    /// Revision of the row after the change.
    #[serde(rename = "_revision")]
    pub revision: Revision,
    /// Id of the changed row.
    #[serde(rename = "_id")]
    pub id: String,
    /// Commit time.
    pub datetime: DateTime<Utc>,
    /// Write action.
    #[serde(rename = "_op")]
    pub op: Action,
    /// Changed values. Full row for inserts, empty for deletes.
    pub diff: Row,
}

impl ChangeEntry {
    /// A change not yet numbered.
    #[must_use]
    pub fn new(txn: &TxnId, revision: Revision, id: &str, op: Action, diff: Row) -> Self {
        Self {
            change: 0,
            txn: txn.clone(),
            revision,
            id: id.to_string(),
            datetime: Utc::now(),
            op,
            diff,
        }
    }

    /// The entry as a JSON object.
    #[must_use]
    pub fn to_row(&self) -> Row {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Row::new(),
        }
    }
}

/// Keys of `given` whose values differ from `saved`.
///
/// Objects are compared recursively, arrays in order, numbers by value.
/// Keys starting with `_` are ignored.
#[must_use]
pub fn diff_rows(saved: &Row, given: &Row) -> Row {
    given
        .iter()
        .filter(|(k, _)| !k.starts_with('_'))
        .filter(|(k, v)| {
            saved
                .get(k.as_str())
                .map_or(!v.is_null(), |old| !semantic_eq(old, v))
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Selects entries by offset: `offset >= 0` keeps entries numbered from
/// `offset` on, a negative offset keeps the last `-offset` entries.
#[must_use]
pub fn select_changes(entries: &[ChangeEntry], offset: i64, limit: Option<usize>) -> Vec<ChangeEntry> {
    let start = if offset < 0 {
        let last = usize::try_from(offset.unsigned_abs()).unwrap_or(usize::MAX);
        entries.len().saturating_sub(last)
    } else {
        let from = offset.unsigned_abs();
        entries.partition_point(|e| e.change < from)
    };
    let rest = &entries[start..];
    let end = limit.map_or(rest.len(), |l| l.min(rest.len()));
    rest[..end].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(v: Value) -> Row {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn diff_is_semantic() {
        let saved = row(json!({"_revision": "a", "count": 1, "meta": {"a": 1, "b": 2}, "tags": [1, 2]}));
        let given = row(json!({"_revision": "b", "count": 1.0, "meta": {"b": 2, "a": 1}, "tags": [2, 1], "note": null}));
        let diff = diff_rows(&saved, &given);
        assert_eq!(Value::Object(diff), json!({"tags": [2, 1]}));
    }

    #[test]
    fn entries_serialize_with_reserved_names() {
        let txn = TxnId::generate();
        let entry = ChangeEntry::new(&txn, Revision::new("r1"), "id1", Action::Insert, row(json!({"a": 1})));
        let out = entry.to_row();
        assert_eq!(out["_id"], "id1");
        assert_eq!(out["_revision"], "r1");
        assert_eq!(out["_op"], "insert");
        assert_eq!(out["_txn"], txn.as_str());
        assert!(out.contains_key("datetime"));
    }

    #[test]
    fn offsets() {
        let txn = TxnId::generate();
        let entries: Vec<ChangeEntry> = (1..=5)
            .map(|n| ChangeEntry {
                change: n,
                ..ChangeEntry::new(&txn, Revision::generate(), "x", Action::Patch, Row::new())
            })
            .collect();
        let changes = |offset, limit| -> Vec<u64> {
            select_changes(&entries, offset, limit).iter().map(|e| e.change).collect()
        };
        assert_eq!(changes(0, None), vec![1, 2, 3, 4, 5]);
        assert_eq!(changes(3, None), vec![3, 4, 5]);
        assert_eq!(changes(-2, None), vec![4, 5]);
        assert_eq!(changes(2, Some(2)), vec![2, 3]);
        assert_eq!(changes(-10, Some(1)), vec![1]);
    }
}
