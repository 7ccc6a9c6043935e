//! Shapes backend rows into response records.

use crate::changes::ChangeEntry;
use crate::dtype::DType;
use crate::error::CoreResult;
use crate::format::Format;
use crate::manifest::{Manifest, Model, Property};
use crate::types::Row;
use crate::ufunc::page::next_cursor;
use crate::ufunc::{ColumnFunc, Query, Selected};
use crate::value::set_path;
use serde_json::{json, Map, Value};

/// Values at a dotted place. Objects are walked, arrays are mapped over so
/// the nesting of the stored value is kept.
fn project_path(value: &Value, segments: &[&str]) -> Value {
    match (value, segments.split_first()) {
        (_, None) => value.clone(),
        (Value::Array(items), Some(_)) => {
            Value::Array(items.iter().map(|item| project_path(item, segments)).collect())
        }
        (Value::Object(map), Some((head, rest))) => map
            .get(*head)
            .map_or(Value::Null, |inner| project_path(inner, rest)),
        _ => Value::Null,
    }
}

fn apply_funcs(funcs: &[ColumnFunc], value: Value) -> Value {
    funcs.iter().fold(value, |acc, func| match (func, acc) {
        (ColumnFunc::Lower, Value::String(s)) => Value::String(s.to_lowercase()),
        (ColumnFunc::Upper, Value::String(s)) => Value::String(s.to_uppercase()),
        (ColumnFunc::Flip, Value::String(s)) => match crate::geometry::Geometry::parse(&s) {
            Ok((_, geom)) => Value::String(geom.flip().to_string()),
            Err(_) => Value::String(s),
        },
        (_, other) => other,
    })
}

fn ref_key(value: &Value) -> Value {
    match value {
        Value::Object(map) => json!({ "_id": map.get("_id").cloned().unwrap_or(Value::Null) }),
        other => other.clone(),
    }
}

/// Builds response records for one model and output format.
#[derive(Clone, Copy)]
pub struct ResultBuilder<'a> {
    manifest: &'a Manifest,
    model: &'a Model,
    format: Format,
}

impl<'a> ResultBuilder<'a> {
    /// Builder for rows of `model`.
    #[must_use]
    pub fn new(manifest: &'a Manifest, model: &'a Model, format: Format) -> Self {
        Self {
            manifest,
            model,
            format,
        }
    }

    /// Serialized value of a property. Refs below level 4 keep only their
    /// `_id`; joined refs become sub-records of the target model.
    fn output(&self, prop: &Property, value: &Value, joined: bool) -> CoreResult<Value> {
        let manifest = self.manifest;
        Ok(match (&prop.dtype, value) {
            (_, Value::Null) => Value::Null,
            (DType::Ref(r), Value::Object(target)) if joined => {
                let target_model = manifest.model(r.model);
                Value::Object(ResultBuilder::new(manifest, target_model, self.format).embedded(target)?)
            }
            (DType::Ref(_), other) => ref_key(other),
            (DType::Object(obj), Value::Object(map)) => {
                let mut out = Map::new();
                for child in obj.properties.iter().map(|id| manifest.property(*id)) {
                    if let (false, Some(v)) = (child.hidden, map.get(&child.name)) {
                        out.insert(child.name.clone(), self.output(child, v, false)?);
                    }
                }
                Value::Object(out)
            }
            (DType::Array(arr), Value::Array(items)) if arr.intermediate.is_none() => {
                let item = manifest.property(arr.items);
                Value::Array(
                    items
                        .iter()
                        .map(|v| self.output(item, v, false))
                        .collect::<CoreResult<_>>()?,
                )
            }
            (dtype, other) => dtype.serialize(manifest, self.format, other).map_err(|e| {
                let e = e.model(&self.model.name);
                if e.context.contains_key("property") {
                    e
                } else {
                    e.property(&prop.place)
                }
            })?,
        })
    }

    fn embedded(&self, row: &Row) -> CoreResult<Row> {
        let mut out = Map::new();
        out.insert("_id".into(), row.get("_id").cloned().unwrap_or(Value::Null));
        for prop in self
            .manifest
            .top_properties(self.model.id)
            .filter(|p| !p.hidden && !p.is_reserved())
        {
            let value = row.get(&prop.name).unwrap_or(&Value::Null);
            out.insert(prop.name.clone(), self.output(prop, value, false)?);
        }
        Ok(out)
    }

    fn selected(&self, row: &Row, selected: &Selected) -> CoreResult<Value> {
        let manifest = self.manifest;
        let column = &selected.column;
        let prop = manifest.property(column.prop);
        if prop.name == "_type" && prop.parent.is_none() {
            return Ok(Value::from(self.model.name.as_str()));
        }
        let segments: Vec<&str> = column.place.split('.').collect();
        let raw = row
            .get(segments[0])
            .map_or(Value::Null, |root| project_path(root, &segments[1..]));
        let raw = apply_funcs(&column.funcs, raw);
        let joined = column.join.is_some() && column.place == prop.place;
        if column.place.split('.').count() > prop.place.split('.').count() {
            return Ok(raw);
        }
        self.output(prop, &raw, joined)
    }

    /// The response record of one row of a query.
    ///
    /// # Errors
    ///
    /// Values that cannot be rendered in the builder's format.
    pub fn record(&self, query: &Query, row: &Row) -> CoreResult<Row> {
        if query.count {
            return Ok(row.clone());
        }
        let mut out = Map::new();
        if !query.explicit_select {
            out.insert("_type".into(), Value::from(self.model.name.as_str()));
        }
        for selected in &query.select {
            let value = self.selected(row, selected)?;
            set_path(&mut out, &selected.name, value);
        }
        Ok(out)
    }

    /// The response record of a write: identity, `_type` and every
    /// visible value the write returned.
    ///
    /// # Errors
    ///
    /// As [`record`](Self::record).
    pub fn write_record(&self, row: &Row) -> CoreResult<Row> {
        let manifest = self.manifest;
        let mut out = Map::new();
        out.insert("_type".into(), Value::from(self.model.name.as_str()));
        for (key, value) in row {
            match manifest.find_property(self.model.id, key) {
                Some(prop) if prop.hidden => {}
                Some(prop) if !prop.is_reserved() => {
                    out.insert(key.clone(), self.output(prop, value, false)?);
                }
                _ if key == "_id" || key == "_revision" => {
                    out.insert(key.clone(), value.clone());
                }
                _ => {}
            }
        }
        Ok(out)
    }

    /// A change log record. The diff keeps only values of properties the
    /// caller may see, serialized like any other record.
    ///
    /// # Errors
    ///
    /// As [`record`](Self::record).
    pub fn change_record(&self, entry: &ChangeEntry, visible: impl Fn(&Property) -> bool) -> CoreResult<Row> {
        let manifest = self.manifest;
        let mut diff = Row::new();
        for (key, value) in &entry.diff {
            let Some(prop) = manifest.find_property(self.model.id, key) else {
                continue;
            };
            if prop.hidden || prop.is_reserved() || !visible(prop) {
                continue;
            }
            diff.insert(key.clone(), self.output(prop, value, false)?);
        }
        let mut out = entry.to_row();
        out.insert("diff".into(), Value::Object(diff));
        Ok(out)
    }

    /// A list response: `{_data: [...]}` plus `_page.next` when the query
    /// pages and more rows may follow.
    ///
    /// # Errors
    ///
    /// Propagates row errors from the backend stream.
    pub fn collection<I>(&self, query: &Query, rows: I) -> CoreResult<Value>
    where
        I: IntoIterator<Item = CoreResult<Row>>,
    {
        let rows: Vec<Row> = rows.into_iter().collect::<CoreResult<_>>()?;
        let data: Vec<Value> = rows
            .iter()
            .map(|row| self.record(query, row).map(Value::Object))
            .collect::<CoreResult<_>>()?;
        let mut body = Map::new();
        body.insert("_data".into(), Value::Array(data));
        if query.page.is_some() {
            let next = next_cursor(query, &rows).map_or(Value::Null, Value::from);
            body.insert("_page".into(), json!({ "next": next }));
        }
        Ok(Value::Object(body))
    }
}
