//! Keyset page cursors.
//!
//! A cursor is the URL-safe base64 form of the JSON array of the last
//! row's page key values.

use super::Query;
use crate::backends::eval::sort_value;
use crate::error::{CoreResult, ErrorKind};
use crate::types::Row;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde_json::Value;

/// Encodes key values into a cursor.
#[must_use]
pub fn encode_cursor(values: &[Value]) -> String {
    let json = Value::Array(values.to_vec()).to_string();
    URL_SAFE_NO_PAD.encode(json.as_bytes())
}

/// Decodes a cursor into key values.
///
/// # Errors
///
/// Returns `InvalidValue` for anything [`encode_cursor`] did not produce.
pub fn decode_cursor(cursor: &str) -> CoreResult<Vec<Value>> {
    let invalid = || {
        ErrorKind::InvalidValue
            .err()
            .with("value", cursor)
            .with("expected", "page cursor")
    };
    let bytes = URL_SAFE_NO_PAD.decode(cursor).map_err(|_| invalid())?;
    match serde_json::from_slice(&bytes) {
        Ok(Value::Array(values)) => Ok(values),
        _ => Err(invalid().into()),
    }
}

/// Cursor of the page after `rows`, or `None` when `rows` is the last page.
///
/// `rows` are backend rows in page order, before projection.
#[must_use]
pub fn next_cursor(query: &Query, rows: &[Row]) -> Option<String> {
    let last = rows.last()?;
    if Some(rows.len()) != query.row_limit() {
        return None;
    }
    cursor_after(query, last)
}

/// Cursor resuming right after `row`, or `None` when `query` does not page.
#[must_use]
pub fn cursor_after(query: &Query, row: &Row) -> Option<String> {
    let page = query.page.as_ref()?;
    let values: Vec<Value> = page
        .keys
        .iter()
        .map(|key| sort_value(row, &key.column))
        .collect();
    Some(encode_cursor(&values))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ModelId, PropertyId};
    use crate::ufunc::{Column, Page, SortKey};
    use serde_json::json;

    fn paged(size: usize) -> Query {
        let mut q = Query::all(ModelId(0));
        q.page = Some(Page {
            size,
            keys: vec![SortKey {
                column: Column {
                    prop: PropertyId(0),
                    place: "id".into(),
                    join: None,
                    funcs: Vec::new(),
                },
                descending: false,
            }],
            after: None,
        });
        q
    }

    fn rows(ids: &[i64]) -> Vec<Row> {
        ids.iter()
            .map(|id| json!({"id": id}).as_object().cloned().unwrap())
            .collect()
    }

    #[test]
    fn cursors_decode_to_their_values() {
        let values = vec![json!(3), Value::Null, json!("Vilnius")];
        let cursor = encode_cursor(&values);
        assert!(!cursor.contains(['+', '/', '=']));
        assert_eq!(decode_cursor(&cursor).unwrap(), values);
        assert_eq!(decode_cursor("%%%").unwrap_err().code(), "InvalidValue");
        assert!(decode_cursor(&URL_SAFE_NO_PAD.encode("{}")).is_err());
    }

    #[test]
    fn next_cursor_only_for_full_pages() {
        let q = paged(2);
        let next = next_cursor(&q, &rows(&[1, 2])).unwrap();
        assert_eq!(decode_cursor(&next).unwrap(), vec![json!(2)]);
        assert!(next_cursor(&q, &rows(&[1])).is_none());
        assert!(next_cursor(&q, &[]).is_none());
        assert!(next_cursor(&Query::all(ModelId(0)), &rows(&[1, 2])).is_none());
    }
}
