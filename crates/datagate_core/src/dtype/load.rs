use super::{DType, GeometryType, RefType};
use crate::error::{CoreError, CoreResult, DataError, ErrorKind};
use crate::geometry::Geometry;
use crate::manifest::{Manifest, Property};
use crate::types::Row;
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat};
use serde_json::{Map, Value};

const DATE_FORMAT: &str = "%Y-%m-%d";
const NAIVE_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];
const FILE_KEYS: [&str; 3] = ["_id", "_content_type", "_content"];

fn located(manifest: &Manifest, prop: &Property, err: DataError) -> CoreError {
    err.model(&manifest.model(prop.model).name)
        .property(&prop.place)
        .into()
}

fn invalid(manifest: &Manifest, prop: &Property, raw: &Value) -> CoreError {
    located(
        manifest,
        prop,
        ErrorKind::InvalidValue
            .err()
            .with("value", raw.clone())
            .with("type", prop.dtype.name()),
    )
}

fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, DATE_FORMAT).ok()
}

/// Parses an ISO 8601 datetime into its normalized string form.
pub(crate) fn normalize_datetime(s: &str) -> Option<String> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.to_rfc3339_opts(SecondsFormat::AutoSi, true));
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(s, f).ok())
        .or_else(|| parse_date(s).and_then(|d| d.and_hms_opt(0, 0, 0)))
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string())
}

/// Rejects absolute file names and names with `..` segments.
///
/// # Errors
///
/// Returns `UnacceptableFileName`.
pub fn validate_file_name(name: &str) -> CoreResult<()> {
    let absolute = name.starts_with('/') || name.starts_with('\\') || name.get(1..2) == Some(":");
    let parent = name.split(['/', '\\']).any(|seg| seg == "..");
    if name.is_empty() || absolute || parent {
        return Err(ErrorKind::UnacceptableFileName
            .err()
            .with("file", name)
            .into());
    }
    Ok(())
}

impl DType {
    /// Coerces raw input into the stored form. `null` passes through.
    ///
    /// # Errors
    ///
    /// Returns a value error (`InvalidValue`, `DateTypeError`, ...) located
    /// at the property.
    pub fn load(&self, manifest: &Manifest, prop: &Property, raw: &Value) -> CoreResult<Value> {
        if raw.is_null() {
            return Ok(Value::Null);
        }
        match self {
            Self::Pk | Self::String => match raw {
                Value::String(s) if !(matches!(self, Self::Pk) && s.is_empty()) => Ok(raw.clone()),
                _ => Err(invalid(manifest, prop, raw)),
            },
            Self::Uri | Self::Url => {
                let ok = raw.as_str().is_some_and(|s| match self {
                    Self::Url => s
                        .split_once("://")
                        .is_some_and(|(scheme, rest)| is_scheme(scheme) && !rest.is_empty()),
                    _ => s.split_once(':').is_some_and(|(scheme, _)| is_scheme(scheme)),
                });
                if ok {
                    Ok(raw.clone())
                } else {
                    Err(invalid(manifest, prop, raw))
                }
            }
            Self::Integer => load_integer(raw).ok_or_else(|| invalid(manifest, prop, raw)),
            Self::Number => match raw {
                Value::Number(_) => Ok(raw.clone()),
                _ => Err(invalid(manifest, prop, raw)),
            },
            Self::Boolean => match raw {
                Value::Bool(_) => Ok(raw.clone()),
                _ => Err(invalid(manifest, prop, raw)),
            },
            Self::Date => raw
                .as_str()
                .and_then(parse_date)
                .map(|d| Value::from(d.format(DATE_FORMAT).to_string()))
                .ok_or_else(|| {
                    located(manifest, prop, ErrorKind::DateTypeError.err().with("value", raw.clone()))
                }),
            Self::DateTime => raw
                .as_str()
                .and_then(normalize_datetime)
                .map(Value::from)
                .ok_or_else(|| {
                    located(
                        manifest,
                        prop,
                        ErrorKind::DateTimeTypeError.err().with("value", raw.clone()),
                    )
                }),
            Self::Ref(r) => load_ref(manifest, prop, r, raw),
            Self::BackRef(_) | Self::Array(super::ArrayType { intermediate: Some(_), .. }) => {
                Err(located(
                    manifest,
                    prop,
                    ErrorKind::InvalidValue
                        .err()
                        .with("value", raw.clone())
                        .with("expected", "computed value"),
                ))
            }
            Self::Array(arr) => {
                let Value::Array(items) = raw else {
                    return Err(located(manifest, prop, ErrorKind::ArrayTypeError.err()));
                };
                let item = manifest.property(arr.items);
                items
                    .iter()
                    .map(|v| item.dtype.load(manifest, item, v))
                    .collect::<CoreResult<Vec<_>>>()
                    .map(Value::Array)
            }
            Self::Object(obj) => {
                let Value::Object(map) = raw else {
                    return Err(located(manifest, prop, ErrorKind::ObjectTypeError.err()));
                };
                let children: Vec<&Property> =
                    obj.properties.iter().map(|id| manifest.property(*id)).collect();
                let unknown: Vec<Value> = map
                    .keys()
                    .filter(|k| !children.iter().any(|c| &c.name == *k))
                    .map(|k| Value::from(k.as_str()))
                    .collect();
                if !unknown.is_empty() {
                    return Err(located(
                        manifest,
                        prop,
                        ErrorKind::UnknownObjectPropertiesError
                            .err()
                            .with("props", Value::Array(unknown)),
                    ));
                }
                let mut out = Map::new();
                for child in children {
                    if let Some(v) = map.get(&child.name) {
                        out.insert(child.name.clone(), child.dtype.load(manifest, child, v)?);
                    }
                }
                Ok(Value::Object(out))
            }
            Self::File => load_file(manifest, prop, raw),
            Self::Geometry(g) => load_geometry(manifest, prop, g, raw),
        }
    }

    /// Explicit conversion used by `cast()`.
    ///
    /// # Errors
    ///
    /// Returns `UnableToCast` when the conversion would lose information.
    pub fn cast(&self, value: &Value) -> CoreResult<Value> {
        let fail = || -> CoreError {
            ErrorKind::UnableToCast
                .err()
                .with("value", value.clone())
                .with("type", self.name())
                .into()
        };
        if value.is_null() {
            return Ok(Value::Null);
        }
        match (self, value) {
            (Self::Integer, Value::String(s)) => {
                s.trim().parse::<i64>().map(Value::from).map_err(|_| fail())
            }
            (Self::Integer, Value::Bool(b)) => Ok(Value::from(i64::from(*b))),
            (Self::Integer, _) => load_integer(value).ok_or_else(fail),
            (Self::Number, Value::String(s)) => s
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .ok_or_else(fail),
            (Self::Number, Value::Number(_)) => Ok(value.clone()),
            (Self::String | Self::Pk | Self::Uri | Self::Url, Value::String(_)) => Ok(value.clone()),
            (Self::String, Value::Number(n)) => Ok(Value::from(n.to_string())),
            (Self::String, Value::Bool(b)) => Ok(Value::from(b.to_string())),
            (Self::Boolean, Value::Bool(_)) => Ok(value.clone()),
            (Self::Boolean, Value::Number(n)) => match n.as_i64() {
                Some(0) => Ok(Value::Bool(false)),
                Some(1) => Ok(Value::Bool(true)),
                _ => Err(fail()),
            },
            (Self::Boolean, Value::String(s)) => match s.as_str() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                _ => Err(fail()),
            },
            (Self::Date, Value::String(s)) => {
                if let Some(d) = parse_date(s) {
                    return Ok(Value::from(d.format(DATE_FORMAT).to_string()));
                }
                let normalized = normalize_datetime(s).ok_or_else(fail)?;
                let (date, time) = normalized.split_once('T').ok_or_else(fail)?;
                if time.trim_start_matches(['0', ':', '.']).trim_end_matches('Z').is_empty() {
                    Ok(Value::from(date))
                } else {
                    Err(fail())
                }
            }
            (Self::DateTime, Value::String(s)) => {
                normalize_datetime(s).map(Value::from).ok_or_else(fail)
            }
            (Self::Geometry(_), Value::String(s)) => Geometry::parse(s)
                .map(|(_, g)| Value::from(g.to_string()))
                .map_err(|_| fail()),
            _ => Err(fail()),
        }
    }
}

fn is_scheme(scheme: &str) -> bool {
    let mut chars = scheme.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
}

fn load_integer(raw: &Value) -> Option<Value> {
    let Value::Number(n) = raw else {
        return None;
    };
    if let Some(i) = n.as_i64() {
        return Some(Value::from(i));
    }
    if n.is_u64() {
        return None;
    }
    let f = n.as_f64()?;
    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    let ok = f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64;
    #[allow(clippy::cast_possible_truncation)]
    ok.then(|| Value::from(f as i64))
}

fn load_ref(manifest: &Manifest, prop: &Property, r: &RefType, raw: &Value) -> CoreResult<Value> {
    let names: Vec<&str> = r
        .refprops
        .iter()
        .map(|id| manifest.property(*id).place.as_str())
        .collect();
    let mut out = Row::new();
    match raw {
        Value::Object(map) => {
            let unknown: Vec<Value> = map
                .keys()
                .filter(|k| k.as_str() != "_id" && !names.contains(&k.as_str()))
                .map(|k| Value::from(k.as_str()))
                .collect();
            if !unknown.is_empty() {
                return Err(located(
                    manifest,
                    prop,
                    ErrorKind::UnknownObjectPropertiesError
                        .err()
                        .with("props", Value::Array(unknown)),
                ));
            }
            if let Some(id) = map.get("_id") {
                if !id.is_string() {
                    return Err(invalid(manifest, prop, raw));
                }
                out.insert("_id".into(), id.clone());
            }
            for name in &names {
                if let Some(v) = map.get(*name) {
                    out.insert((*name).to_string(), v.clone());
                }
            }
        }
        Value::Array(values) => {
            if values.len() != names.len() {
                return Err(located(
                    manifest,
                    prop,
                    ErrorKind::GivenValueCountMissmatch
                        .err()
                        .with("given_count", values.len())
                        .with("expected_count", names.len()),
                ));
            }
            for (name, v) in names.iter().zip(values) {
                out.insert((*name).to_string(), v.clone());
            }
        }
        scalar => {
            if names.len() != 1 {
                return Err(located(
                    manifest,
                    prop,
                    ErrorKind::GivenValueCountMissmatch
                        .err()
                        .with("given_count", 1)
                        .with("expected_count", names.len()),
                ));
            }
            out.insert(names[0].to_string(), scalar.clone());
        }
    }
    if out.is_empty() {
        return Err(invalid(manifest, prop, raw));
    }
    Ok(Value::Object(out))
}

fn load_file(manifest: &Manifest, prop: &Property, raw: &Value) -> CoreResult<Value> {
    let Value::Object(map) = raw else {
        return Err(located(manifest, prop, ErrorKind::ObjectTypeError.err()));
    };
    let unknown: Vec<Value> = map
        .keys()
        .filter(|k| !FILE_KEYS.contains(&k.as_str()))
        .map(|k| Value::from(k.as_str()))
        .collect();
    if !unknown.is_empty() {
        return Err(located(
            manifest,
            prop,
            ErrorKind::UnknownObjectPropertiesError
                .err()
                .with("props", Value::Array(unknown)),
        ));
    }
    let name = map
        .get("_id")
        .and_then(Value::as_str)
        .ok_or_else(|| invalid(manifest, prop, raw))?;
    validate_file_name(name).map_err(|e| match e {
        CoreError::Data(d) => located(manifest, prop, d),
        other => other,
    })?;
    for key in ["_content_type", "_content"] {
        if map.get(key).is_some_and(|v| !v.is_string() && !v.is_null()) {
            return Err(invalid(manifest, prop, raw));
        }
    }
    Ok(raw.clone())
}

fn load_geometry(
    manifest: &Manifest,
    prop: &Property,
    g: &GeometryType,
    raw: &Value,
) -> CoreResult<Value> {
    let text = raw.as_str().ok_or_else(|| invalid(manifest, prop, raw))?;
    let (srid, geom) = Geometry::parse(text).map_err(|_| invalid(manifest, prop, raw))?;
    if let (Some(given), Some(expected)) = (srid, g.srid) {
        if given != expected {
            return Err(located(
                manifest,
                prop,
                ErrorKind::InvalidValue
                    .err()
                    .with("value", given)
                    .with("expected", expected),
            ));
        }
    }
    if let Some(kind) = &g.kind {
        if !geom.type_name().eq_ignore_ascii_case(kind) {
            return Err(located(
                manifest,
                prop,
                ErrorKind::InvalidValue
                    .err()
                    .with("value", geom.type_name().to_ascii_lowercase())
                    .with("expected", kind.as_str()),
            ));
        }
    }
    Ok(Value::from(geom.to_string()))
}

/// Value stored on insert for a property that was not given.
#[must_use]
pub fn default_value(manifest: &Manifest, prop: &Property) -> Value {
    if let Some(default) = &prop.default {
        return default.clone();
    }
    match &prop.dtype {
        DType::Array(_) => Value::Array(Vec::new()),
        DType::Object(obj) => Value::Object(
            obj.properties
                .iter()
                .map(|id| {
                    let child = manifest.property(*id);
                    (child.name.clone(), default_value(manifest, child))
                })
                .collect(),
        ),
        _ => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::load::load_yaml_str;
    use serde_json::json;

    fn manifest() -> Manifest {
        load_yaml_str(
            r"
type: model
name: City
properties:
  code: {type: string}
  name: {type: string}
---
type: model
name: report
properties:
  count: {type: integer}
  score: {type: number}
  valid_from: {type: date}
  created: {type: datetime}
  site: {type: url}
  city: {type: ref, model: City}
  place: {type: ref, model: City, refprops: [code, name]}
  location: {type: 'geometry(point, 3346)'}
  doc: {type: file}
  meta:
    type: object
    properties:
      author: {type: string}
  notes:
    type: array
    items:
      type: object
      properties:
        note: {type: string}
",
        )
        .unwrap()
    }

    fn load(m: &Manifest, place: &str, raw: Value) -> CoreResult<Value> {
        let model = m.model_by_name("report").unwrap();
        let prop = m.property_by_place(model.id, place).unwrap();
        prop.dtype.load(m, prop, &raw)
    }

    #[test]
    fn integers_reject_bools_and_fractions() {
        let m = manifest();
        assert_eq!(load(&m, "count", json!(3)).unwrap(), json!(3));
        assert_eq!(load(&m, "count", json!(3.0)).unwrap(), json!(3));
        assert_eq!(load(&m, "count", json!(true)).unwrap_err().code(), "InvalidValue");
        assert_eq!(load(&m, "count", json!(3.5)).unwrap_err().code(), "InvalidValue");
        assert_eq!(load(&m, "score", json!(3.5)).unwrap(), json!(3.5));
    }

    #[test]
    fn dates() {
        let m = manifest();
        assert_eq!(load(&m, "valid_from", json!("2024-02-29")).unwrap(), json!("2024-02-29"));
        assert_eq!(
            load(&m, "valid_from", json!("2023-02-29")).unwrap_err().code(),
            "DateTypeError"
        );
        assert_eq!(
            load(&m, "created", json!("2024-01-02T03:04:05")).unwrap(),
            json!("2024-01-02T03:04:05")
        );
        assert_eq!(
            load(&m, "created", json!("2024-01-02T03:04:05+02:00")).unwrap(),
            json!("2024-01-02T03:04:05+02:00")
        );
        assert_eq!(load(&m, "created", json!("soon")).unwrap_err().code(), "DateTimeTypeError");
    }

    #[test]
    fn urls_are_lexical() {
        let m = manifest();
        assert!(load(&m, "site", json!("https://example.com/x")).is_ok());
        assert!(load(&m, "site", json!("example.com")).is_err());
    }

    #[test]
    fn refs() {
        let m = manifest();
        assert_eq!(load(&m, "city", json!("abc")).unwrap(), json!({"_id": "abc"}));
        assert_eq!(load(&m, "city", json!({"_id": "abc"})).unwrap(), json!({"_id": "abc"}));
        assert_eq!(
            load(&m, "place", json!(["LT", "Vilnius"])).unwrap(),
            json!({"code": "LT", "name": "Vilnius"})
        );
        let err = load(&m, "place", json!(["LT"])).unwrap_err();
        assert_eq!(err.code(), "GivenValueCountMissmatch");
        assert_eq!(err.context()["expected_count"], 2);
        assert_eq!(
            load(&m, "city", json!({"colour": 1})).unwrap_err().code(),
            "UnknownObjectPropertiesError"
        );
    }

    #[test]
    fn objects_and_arrays() {
        let m = manifest();
        assert_eq!(
            load(&m, "notes", json!([{"note": "hi"}])).unwrap(),
            json!([{"note": "hi"}])
        );
        assert_eq!(load(&m, "notes", json!({})).unwrap_err().code(), "ArrayTypeError");
        assert_eq!(load(&m, "meta", json!([])).unwrap_err().code(), "ObjectTypeError");
        let err = load(&m, "meta", json!({"author": "a", "x": 1})).unwrap_err();
        assert_eq!(err.code(), "UnknownObjectPropertiesError");
        assert_eq!(err.context()["props"], json!(["x"]));
    }

    #[test]
    fn geometry_is_normalized_to_wkt() {
        let m = manifest();
        assert_eq!(
            load(&m, "location", json!("SRID=3346;POINT(1 2)")).unwrap(),
            json!("POINT (1 2)")
        );
        assert!(load(&m, "location", json!("SRID=4326;POINT(1 2)")).is_err());
        assert!(load(&m, "location", json!("LINESTRING(1 2, 3 4)")).is_err());
    }

    #[test]
    fn file_names() {
        let m = manifest();
        assert!(load(&m, "doc", json!({"_id": "a.pdf", "_content": "aGk="})).is_ok());
        for bad in ["/etc/passwd", "../x", "a/../../b"] {
            let err = load(&m, "doc", json!({"_id": bad})).unwrap_err();
            assert_eq!(err.code(), "UnacceptableFileName");
        }
    }

    #[test]
    fn casting() {
        assert_eq!(DType::Integer.cast(&json!("42")).unwrap(), json!(42));
        assert_eq!(DType::Integer.cast(&json!(4.5)).unwrap_err().code(), "UnableToCast");
        assert_eq!(DType::Date.cast(&json!("2024-01-02T00:00:00")).unwrap(), json!("2024-01-02"));
        assert!(DType::Date.cast(&json!("2024-01-02T10:00:00")).is_err());
        assert_eq!(DType::String.cast(&json!(5)).unwrap(), json!("5"));
    }

    #[test]
    fn defaults() {
        let m = manifest();
        let model = m.model_by_name("report").unwrap();
        let notes = m.property_by_place(model.id, "notes").unwrap();
        assert_eq!(default_value(&m, notes), json!([]));
        let meta = m.property_by_place(model.id, "meta").unwrap();
        assert_eq!(default_value(&m, meta), json!({"author": null}));
    }
}
