use super::DType;
use crate::error::{CoreError, CoreResult, ErrorKind};
use crate::manifest::{Manifest, Model, Property};
use crate::types::Row;
use crate::value::semantic_eq;
use serde_json::Value;

/// Lookups [`check`] needs from storage.
pub trait CheckContext {
    /// Whether a row of `model` matches every key of `key`.
    fn exists(&self, model: &Model, key: &Row) -> CoreResult<bool>;

    /// Whether another row (not `exclude`) already holds `value` in `prop`.
    fn taken(&self, prop: &Property, value: &Value, exclude: Option<&str>) -> CoreResult<bool>;
}

/// Validates a loaded value of `prop`.
///
/// `value` is `None` when the property was not given. `insert` selects
/// insert semantics for `required`; `current` is the id of the row being
/// rewritten, excluded from the `unique` lookup. Every violation found is
/// returned, combined into one error.
///
/// # Errors
///
/// `RequiredProperty`, `InvalidValue` (nullable or choices),
/// `UniqueConstraint` or `ItemDoesNotExist` for dangling refs.
pub fn check(
    ctx: &dyn CheckContext,
    manifest: &Manifest,
    prop: &Property,
    value: Option<&Value>,
    insert: bool,
    current: Option<&str>,
) -> CoreResult<()> {
    let mut errors = Vec::new();
    walk(ctx, manifest, prop, value, insert, current, &mut errors)?;
    match CoreError::collect(errors) {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn walk(
    ctx: &dyn CheckContext,
    manifest: &Manifest,
    prop: &Property,
    value: Option<&Value>,
    insert: bool,
    current: Option<&str>,
    errors: &mut Vec<CoreError>,
) -> CoreResult<()> {
    let model = &manifest.model(prop.model).name;
    let missing = value.map_or(true, Value::is_null);

    if prop.required && missing && (insert || value.is_some()) {
        errors.push(ErrorKind::RequiredProperty.err().model(model).property(&prop.place).into());
        return Ok(());
    }
    let Some(value) = value.filter(|v| !v.is_null()) else {
        if value.is_some() && !prop.nullable {
            errors.push(
                ErrorKind::InvalidValue
                    .err()
                    .model(model)
                    .property(&prop.place)
                    .with("value", Value::Null)
                    .into(),
            );
        }
        return Ok(());
    };

    if !prop.choices.is_empty() && !prop.choices.iter().any(|c| semantic_eq(c, value)) {
        errors.push(
            ErrorKind::InvalidValue
                .err()
                .model(model)
                .property(&prop.place)
                .with("value", value.clone())
                .with("choices", Value::Array(prop.choices.clone()))
                .into(),
        );
    }

    if prop.unique && ctx.taken(prop, value, current)? {
        errors.push(
            ErrorKind::UniqueConstraint
                .err()
                .model(model)
                .property(&prop.place)
                .with("value", value.clone())
                .into(),
        );
    }

    match (&prop.dtype, value) {
        (DType::Ref(r), Value::Object(key)) => {
            let target = manifest.model(r.model);
            if !ctx.exists(target, key)? {
                let id = key
                    .get("_id")
                    .cloned()
                    .unwrap_or_else(|| Value::Object(key.clone()));
                errors.push(
                    ErrorKind::ItemDoesNotExist
                        .err()
                        .model(&target.name)
                        .property(&prop.place)
                        .with("id", id)
                        .into(),
                );
            }
        }
        (DType::Object(obj), Value::Object(map)) => {
            for id in &obj.properties {
                let child = manifest.property(*id);
                walk(ctx, manifest, child, map.get(&child.name), insert, None, errors)?;
            }
        }
        (DType::Array(arr), Value::Array(items)) => {
            let item = manifest.property(arr.items);
            for v in items {
                walk(ctx, manifest, item, Some(v), insert, None, errors)?;
            }
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::load::load_yaml_str;
    use serde_json::json;

    struct Fixed {
        existing: Vec<&'static str>,
        taken: Vec<Value>,
    }

    impl CheckContext for Fixed {
        fn exists(&self, _model: &Model, key: &Row) -> CoreResult<bool> {
            Ok(key
                .get("_id")
                .and_then(Value::as_str)
                .is_some_and(|id| self.existing.contains(&id)))
        }

        fn taken(&self, _prop: &Property, value: &Value, exclude: Option<&str>) -> CoreResult<bool> {
            Ok(exclude.is_none() && self.taken.contains(value))
        }
    }

    fn manifest() -> Manifest {
        load_yaml_str(
            r"
type: model
name: City
properties:
  name: {type: string}
---
type: model
name: report
properties:
  status: {type: string, required: true, choices: [ok, failed]}
  code: {type: string, unique: true}
  city: {type: ref, model: City}
  notes:
    type: array
    items:
      type: object
      properties:
        kind: {type: string, choices: [a, b]}
",
        )
        .unwrap()
    }

    fn run(m: &Manifest, place: &str, value: Option<Value>, insert: bool) -> CoreResult<()> {
        let ctx = Fixed {
            existing: vec!["c1"],
            taken: vec![json!("X")],
        };
        let model = m.model_by_name("report").unwrap();
        let prop = m.property_by_place(model.id, place).unwrap();
        check(&ctx, m, prop, value.as_ref(), insert, None)
    }

    #[test]
    fn required_only_on_insert_or_explicit_null() {
        let m = manifest();
        assert_eq!(run(&m, "status", None, true).unwrap_err().code(), "RequiredProperty");
        assert!(run(&m, "status", None, false).is_ok());
        assert_eq!(
            run(&m, "status", Some(Value::Null), false).unwrap_err().code(),
            "RequiredProperty"
        );
    }

    #[test]
    fn choices_and_unique() {
        let m = manifest();
        assert!(run(&m, "status", Some(json!("ok")), true).is_ok());
        let err = run(&m, "status", Some(json!("meh")), true).unwrap_err();
        assert_eq!(err.code(), "InvalidValue");
        assert_eq!(err.context()["choices"], json!(["ok", "failed"]));
        assert_eq!(
            run(&m, "code", Some(json!("X")), true).unwrap_err().code(),
            "UniqueConstraint"
        );
    }

    #[test]
    fn dangling_refs() {
        let m = manifest();
        assert!(run(&m, "city", Some(json!({"_id": "c1"})), true).is_ok());
        let err = run(&m, "city", Some(json!({"_id": "zz"})), true).unwrap_err();
        assert_eq!(err.code(), "ItemDoesNotExist");
        assert_eq!(err.context()["model"], "City");
    }

    #[test]
    fn nested_violations_are_collected() {
        let m = manifest();
        let err = run(
            &m,
            "notes",
            Some(json!([{"kind": "x"}, {"kind": "a"}, {"kind": "y"}])),
            true,
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::Multiple(ref errors) if errors.len() == 2));
    }
}
