//! Data types attached to properties.
//!
//! A [`DType`] is a tagged variant; behavior is dispatched by `match` rather
//! than through a registry:
//!
//! - [`load`](DType::load) coerces raw input into the stored form.
//! - [`check`] enforces `required`, `choices`, `unique` and ref existence.
//! - [`encode`](DType::encode) / [`decode`](DType::decode) convert between the
//!   stored form and a backend family's native form.
//! - [`serialize`](DType::serialize) produces the wire form for a format.

mod check;
mod codec;
mod load;

pub use check::{check, CheckContext};
pub use load::{default_value, validate_file_name};

use crate::error::{CoreResult, ErrorKind};
use crate::types::{ModelId, PropertyId};
use datagate_expr::{Literal, Node};

/// Target of a `ref` property.
#[derive(Debug, Clone, PartialEq)]
pub struct RefType {
    /// Referenced model.
    pub model: ModelId,
    /// Target properties identifying a row. The target's pkeys unless declared.
    pub refprops: Vec<PropertyId>,
    /// Whether `refprops` were declared explicitly.
    pub explicit: bool,
}

/// Inverse of a `ref`: rows of `model` whose `refprop` points here.
#[derive(Debug, Clone, PartialEq)]
pub struct BackRefType {
    /// Model holding the forward reference.
    pub model: ModelId,
    /// The forward `ref` property.
    pub refprop: PropertyId,
}

/// Join model backing an array of refs.
#[derive(Debug, Clone, PartialEq)]
pub struct Intermediate {
    /// Join model.
    pub model: ModelId,
    /// Ref in the join model pointing at the container model.
    pub left: PropertyId,
    /// Ref in the join model pointing at the item model.
    pub right: PropertyId,
}

/// Item type of an array.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayType {
    /// Items property.
    pub items: PropertyId,
    /// Join model, for arrays computed from another model.
    pub intermediate: Option<Intermediate>,
}

/// Named sub-properties of an object.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ObjectType {
    /// Children in declaration order.
    pub properties: Vec<PropertyId>,
}

/// Geometry subtype and SRID.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GeometryType {
    /// Geometry kind, e.g. `point`. `None` accepts any.
    pub kind: Option<String>,
    /// Spatial reference id.
    pub srid: Option<u32>,
}

/// A property's data type.
#[derive(Debug, Clone, PartialEq)]
#[allow(missing_docs)]
pub enum DType {
    Pk,
    String,
    Integer,
    Number,
    Boolean,
    Date,
    DateTime,
    Uri,
    Url,
    Ref(RefType),
    BackRef(BackRefType),
    Array(ArrayType),
    Object(ObjectType),
    File,
    Geometry(GeometryType),
}

impl DType {
    /// Type name as written in manifests.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Pk => "pk",
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Date => "date",
            Self::DateTime => "datetime",
            Self::Uri => "uri",
            Self::Url => "url",
            Self::Ref(_) => "ref",
            Self::BackRef(_) => "backref",
            Self::Array(_) => "array",
            Self::Object(_) => "object",
            Self::File => "file",
            Self::Geometry(_) => "geometry",
        }
    }

    /// Whether values are strings on the wire.
    #[must_use]
    pub const fn is_textual(&self) -> bool {
        matches!(
            self,
            Self::Pk | Self::String | Self::Date | Self::DateTime | Self::Uri | Self::Url
        )
    }

    /// Whether values are numbers.
    #[must_use]
    pub const fn is_numeric(&self) -> bool {
        matches!(self, Self::Integer | Self::Number)
    }

    /// Whether values are stored on the row itself.
    #[must_use]
    pub const fn is_stored(&self) -> bool {
        !matches!(
            self,
            Self::BackRef(_)
                | Self::Array(ArrayType {
                    intermediate: Some(_),
                    ..
                })
        )
    }
}

/// A parsed manifest type string, before ids are linked.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeSpec {
    /// Type name.
    pub name: String,
    /// Geometry kind.
    pub geometry_kind: Option<String>,
    /// Geometry SRID.
    pub srid: Option<u32>,
}

/// Names accepted as property types.
pub const TYPE_NAMES: [&str; 17] = [
    "pk", "string", "text", "integer", "number", "boolean", "date", "datetime", "uri", "url",
    "ref", "backref", "array", "object", "file", "geometry", "money",
];

/// Parses a type string such as `string`, `geometry(point, 3346)` or
/// `geometry(3346)`.
///
/// # Errors
///
/// Returns `InvalidValue` for unknown names or malformed arguments.
pub fn parse_type(text: &str) -> CoreResult<TypeSpec> {
    let invalid = || {
        ErrorKind::InvalidValue
            .err()
            .with("value", text)
            .with("expected", "property type")
    };
    let node = datagate_expr::parse(text).map_err(|_| invalid())?;
    let expr = node.as_expr().ok_or_else(invalid)?;

    let (name, args) = match expr.bound_name() {
        Some(name) => (name.to_string(), Vec::new()),
        None => (expr.name.clone(), expr.args.iter().collect::<Vec<_>>()),
    };
    let name = match name.as_str() {
        "text" => "string".to_string(),
        "money" => "number".to_string(),
        other if TYPE_NAMES.contains(&other) => other.to_string(),
        _ => return Err(invalid().into()),
    };

    let mut spec = TypeSpec {
        name,
        geometry_kind: None,
        srid: None,
    };
    if !args.is_empty() && spec.name != "geometry" {
        return Err(invalid().into());
    }
    for arg in args {
        match arg {
            Node::Literal(Literal::Integer(n)) => {
                spec.srid = Some(u32::try_from(*n).map_err(|_| invalid())?);
            }
            Node::Expr(e) => match e.bound_name() {
                Some(kind) => spec.geometry_kind = Some(kind.to_ascii_lowercase()),
                None => return Err(invalid().into()),
            },
            Node::Literal(_) => return Err(invalid().into()),
        }
    }
    Ok(spec)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_types() {
        assert_eq!(parse_type("string").unwrap().name, "string");
        assert_eq!(parse_type("text").unwrap().name, "string");
        assert!(parse_type("blob").is_err());
        assert!(parse_type("string(3)").is_err());
    }

    #[test]
    fn geometry_arguments() {
        let spec = parse_type("geometry(point, 3346)").unwrap();
        assert_eq!(spec.geometry_kind.as_deref(), Some("point"));
        assert_eq!(spec.srid, Some(3346));

        let spec = parse_type("geometry(3857)").unwrap();
        assert_eq!(spec.geometry_kind, None);
        assert_eq!(spec.srid, Some(3857));

        assert!(parse_type("geometry(-1)").is_err());
    }

    #[test]
    fn stored_types() {
        assert!(DType::String.is_stored());
        assert!(!DType::BackRef(BackRefType {
            model: ModelId(0),
            refprop: PropertyId(0),
        })
        .is_stored());
    }
}
