use super::DType;
use crate::config::BackendKind;
use crate::error::{CoreResult, DataError, ErrorKind};
use crate::format::Format;
use crate::geometry::{osm_link, Geometry};
use crate::manifest::Manifest;
use serde_json::{json, Map, Value};

impl DType {
    /// Converts a stored value into the native form of a backend family.
    #[must_use]
    pub fn encode(&self, manifest: &Manifest, family: BackendKind, value: &Value) -> Value {
        match (self, family, value) {
            (_, _, Value::Null) => Value::Null,
            (Self::Date, BackendKind::Document, Value::String(s)) => {
                json!({"$date": format!("{s}T00:00:00Z")})
            }
            (Self::DateTime, BackendKind::Document, Value::String(s)) => json!({"$date": s}),
            (Self::Geometry(g), BackendKind::Sql, Value::String(s)) => match g.srid {
                Some(srid) => Value::from(format!("SRID={srid};{s}")),
                None => value.clone(),
            },
            (Self::Object(obj), _, Value::Object(map)) => Value::Object(
                obj.properties
                    .iter()
                    .map(|id| manifest.property(*id))
                    .filter_map(|child| {
                        map.get(&child.name).map(|v| {
                            (child.name.clone(), child.dtype.encode(manifest, family, v))
                        })
                    })
                    .collect(),
            ),
            (Self::Array(arr), _, Value::Array(items)) => {
                let item = manifest.property(arr.items);
                Value::Array(
                    items
                        .iter()
                        .map(|v| item.dtype.encode(manifest, family, v))
                        .collect(),
                )
            }
            _ => value.clone(),
        }
    }

    /// Inverse of [`encode`](Self::encode).
    ///
    /// # Errors
    ///
    /// Returns `InvalidValue` for geometry the backend returned in an
    /// unreadable form.
    pub fn decode(&self, manifest: &Manifest, family: BackendKind, value: &Value) -> CoreResult<Value> {
        Ok(match (self, value) {
            (_, Value::Null) => Value::Null,
            (Self::Date, Value::Object(map)) => match map.get("$date").and_then(Value::as_str) {
                Some(s) => Value::from(s.get(..10).unwrap_or(s)),
                None => value.clone(),
            },
            (Self::DateTime, Value::Object(map)) => {
                map.get("$date").cloned().unwrap_or_else(|| value.clone())
            }
            (Self::Geometry(_), Value::String(s)) if family == BackendKind::Sql => {
                Value::from(Geometry::parse(s)?.1.to_string())
            }
            (Self::Object(obj), Value::Object(map)) => {
                let mut out = Map::new();
                for id in &obj.properties {
                    let child = manifest.property(*id);
                    if let Some(v) = map.get(&child.name) {
                        out.insert(child.name.clone(), child.dtype.decode(manifest, family, v)?);
                    }
                }
                Value::Object(out)
            }
            (Self::Array(arr), Value::Array(items)) => {
                let item = manifest.property(arr.items);
                Value::Array(
                    items
                        .iter()
                        .map(|v| item.dtype.decode(manifest, family, v))
                        .collect::<CoreResult<_>>()?,
                )
            }
            _ => value.clone(),
        })
    }

    /// Wire form of a stored value.
    ///
    /// # Errors
    ///
    /// `SRIDNotSetForGeometry` when an HTML map link is needed for a
    /// geometry whose SRID is neither in the value nor in the type.
    pub fn serialize(&self, manifest: &Manifest, format: Format, value: &Value) -> Result<Value, DataError> {
        Ok(match (self, value) {
            (_, Value::Null) => Value::Null,
            (Self::Geometry(g), Value::String(wkt)) if format == Format::Html => {
                let link = match Geometry::parse(wkt) {
                    Ok((srid, geom)) => {
                        let srid = srid.or(g.srid).ok_or_else(|| ErrorKind::SRIDNotSetForGeometry.err())?;
                        geom.to_wgs84(srid).ok().and_then(|geom| geom.centroid()).map(osm_link)
                    }
                    Err(_) => None,
                };
                json!({"value": wkt, "link": link})
            }
            (Self::File, Value::Object(map)) => {
                let mut out = Map::new();
                for key in ["_id", "_content_type"] {
                    out.insert(key.to_string(), map.get(key).cloned().unwrap_or(Value::Null));
                }
                Value::Object(out)
            }
            (Self::Object(obj), Value::Object(map)) => {
                let mut out = Map::new();
                for child in obj.properties.iter().map(|id| manifest.property(*id)) {
                    if child.hidden {
                        continue;
                    }
                    if let Some(v) = map.get(&child.name) {
                        let v = child
                            .dtype
                            .serialize(manifest, format, v)
                            .map_err(|e| e.property(&child.place))?;
                        out.insert(child.name.clone(), v);
                    }
                }
                Value::Object(out)
            }
            (Self::Array(arr), Value::Array(items)) => {
                let item = manifest.property(arr.items);
                Value::Array(
                    items
                        .iter()
                        .map(|v| item.dtype.serialize(manifest, format, v))
                        .collect::<Result<_, _>>()?,
                )
            }
            _ => value.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::load::load_yaml_str;

    fn manifest() -> Manifest {
        load_yaml_str(
            r"
type: model
name: place
properties:
  founded: {type: date}
  seen: {type: datetime}
  location: {type: 'geometry(point, 3346)'}
  spot: {type: geometry}
  doc: {type: file}
  visits:
    type: array
    items: {type: date}
",
        )
        .unwrap()
    }

    fn dtype<'a>(m: &'a Manifest, place: &str) -> &'a DType {
        let model = m.model_by_name("place").unwrap();
        &m.property_by_place(model.id, place).unwrap().dtype
    }

    #[test]
    fn document_dates() {
        let m = manifest();
        let date = dtype(&m, "founded");
        let encoded = date.encode(&m, BackendKind::Document, &json!("2020-01-02"));
        assert_eq!(encoded, json!({"$date": "2020-01-02T00:00:00Z"}));
        assert_eq!(
            date.decode(&m, BackendKind::Document, &encoded).unwrap(),
            json!("2020-01-02")
        );

        let visits = dtype(&m, "visits");
        let encoded = visits.encode(&m, BackendKind::Document, &json!(["2020-01-02"]));
        assert_eq!(encoded, json!([{"$date": "2020-01-02T00:00:00Z"}]));
        assert_eq!(
            visits.decode(&m, BackendKind::Document, &encoded).unwrap(),
            json!(["2020-01-02"])
        );

        assert_eq!(
            date.encode(&m, BackendKind::Memory, &json!("2020-01-02")),
            json!("2020-01-02")
        );
    }

    #[test]
    fn sql_geometry_carries_srid() {
        let m = manifest();
        let g = dtype(&m, "location");
        let encoded = g.encode(&m, BackendKind::Sql, &json!("POINT (1 2)"));
        assert_eq!(encoded, json!("SRID=3346;POINT (1 2)"));
        assert_eq!(g.decode(&m, BackendKind::Sql, &encoded).unwrap(), json!("POINT (1 2)"));
    }

    #[test]
    fn html_geometry_links_to_osm() {
        let m = manifest();
        let out = dtype(&m, "location")
            .serialize(&m, Format::Html, &json!("POINT (500000 6000000)"))
            .unwrap();
        assert_eq!(out["value"], "POINT (500000 6000000)");
        assert!(out["link"]
            .as_str()
            .unwrap()
            .starts_with("https://www.openstreetmap.org/?mlat=54."));

        let out = dtype(&m, "spot")
            .serialize(&m, Format::Html, &json!("SRID=4326;POINT (25.3 54.7)"))
            .unwrap();
        assert_eq!(
            out["link"],
            "https://www.openstreetmap.org/?mlat=54.7&mlon=25.3#map=19/54.7/25.3"
        );
        assert_eq!(
            dtype(&m, "spot").serialize(&m, Format::Json, &json!("POINT (25.3 54.7)")).unwrap(),
            json!("POINT (25.3 54.7)")
        );
    }

    #[test]
    fn html_geometry_without_srid_is_rejected() {
        let m = manifest();
        let err = dtype(&m, "spot")
            .serialize(&m, Format::Html, &json!("POINT (25.3 54.7)"))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::SRIDNotSetForGeometry);
    }

    #[test]
    fn files_hide_storage_details() {
        let m = manifest();
        let stored = json!({"_id": "a.pdf", "_content_type": "application/pdf", "_blob": "ab", "_size": 3});
        assert_eq!(
            dtype(&m, "doc").serialize(&m, Format::Json, &stored).unwrap(),
            json!({"_id": "a.pdf", "_content_type": "application/pdf"})
        );
    }
}
