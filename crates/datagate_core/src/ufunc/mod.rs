//! The query language resolver.
//!
//! An expression tree from [`datagate_expr`] is resolved against a model
//! into a [`Query`]: a backend-neutral plan with an ordered projection, a
//! filter tree, ordering, paging and the joins needed to produce computed
//! and level-4 values. Backends compile a [`Query`] into their native form.
//!
//! Resolution is a plain tree walk. Structural functions (`select`, `sort`,
//! `and`, `recurse`, ...) are handled by the walker; value functions (`eq`,
//! `contains`, `lower`, `point`, ...) are looked up in a
//! [`CommandRegistry`](crate::commands::CommandRegistry) keyed by the kinds
//! of their resolved arguments.

pub mod funcs;
pub mod page;
pub mod params;
pub mod resolve;

use crate::auth::Caller;
use crate::commands::Kind;
use crate::config::BackendKind;
use crate::dtype::DType;
use crate::manifest::{Manifest, Model, Property};
use crate::types::{Action, ModelId, PropertyId};
use serde_json::Value;
use std::collections::BTreeMap;

pub use funcs::{builtins, FuncRegistry, Handler};
pub use page::{decode_cursor, encode_cursor};
pub use resolve::resolve_query;

/// A function applied to column values before comparison or output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnFunc {
    /// Lowercase a string.
    Lower,
    /// Uppercase a string.
    Upper,
    /// Swap geometry axes.
    Flip,
}

impl ColumnFunc {
    /// Function name in expressions.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Lower => "lower",
            Self::Upper => "upper",
            Self::Flip => "flip",
        }
    }
}

/// A value read from each row: a property at a dotted place, possibly
/// through a join, with functions applied.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    /// Property the values belong to.
    pub prop: PropertyId,
    /// Dotted path of the values within the row. Joined values live under
    /// the ref's place.
    pub place: String,
    /// Join the place goes through, as an index into [`Query::joins`].
    pub join: Option<usize>,
    /// Functions applied in order.
    pub funcs: Vec<ColumnFunc>,
}

impl Column {
    /// A plain column of a property.
    #[must_use]
    pub fn of(prop: &Property) -> Self {
        Self {
            prop: prop.id,
            place: prop.place.clone(),
            join: None,
            funcs: Vec::new(),
        }
    }

    /// First segment of the place: the stored top-level field.
    #[must_use]
    pub fn root(&self) -> &str {
        self.place.split('.').next().unwrap_or(&self.place)
    }

    /// The place below the root, if any.
    #[must_use]
    pub fn rest(&self) -> Option<&str> {
        self.place.split_once('.').map(|(_, rest)| rest)
    }
}

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    /// Parses an operator function name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "eq" => Self::Eq,
            "ne" => Self::Ne,
            "lt" => Self::Lt,
            "le" => Self::Le,
            "gt" => Self::Gt,
            "ge" => Self::Ge,
            _ => return None,
        })
    }

    /// Function name in expressions.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::Ne => "ne",
            Self::Lt => "lt",
            Self::Le => "le",
            Self::Gt => "gt",
            Self::Ge => "ge",
        }
    }
}

/// A filter tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Cond {
    /// Every branch holds.
    And(Vec<Cond>),
    /// Some branch holds.
    Or(Vec<Cond>),
    /// The branch does not hold.
    Not(Box<Cond>),
    /// Some value of the column compares true.
    Compare {
        /// Left side.
        column: Column,
        /// Operator.
        op: CmpOp,
        /// Right side, already loaded into the stored form.
        value: Value,
    },
    /// Some string value of the column contains the text.
    Contains {
        /// Left side.
        column: Column,
        /// Needle.
        value: String,
    },
    /// Some string value of the column starts with the text.
    StartsWith {
        /// Left side.
        column: Column,
        /// Prefix.
        value: String,
    },
    /// Rows strictly after a keyset cursor.
    After {
        /// Ordering keys.
        keys: Vec<SortKey>,
        /// Key values of the last row seen.
        values: Vec<Value>,
    },
}

impl Cond {
    /// Combines conditions with `and`, flattening nested `and`s.
    #[must_use]
    pub fn all(conds: Vec<Cond>) -> Option<Cond> {
        let mut flat = Vec::new();
        for cond in conds {
            match cond {
                Cond::And(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => None,
            1 => flat.pop(),
            _ => Some(Cond::And(flat)),
        }
    }
}

/// One ordering key.
#[derive(Debug, Clone, PartialEq)]
pub struct SortKey {
    /// Column to order by.
    pub column: Column,
    /// Descending order. Nulls sort first ascending and last descending.
    pub descending: bool,
}

/// One projected output field.
#[derive(Debug, Clone, PartialEq)]
pub struct Selected {
    /// Output key, dotted for nested output.
    pub name: String,
    /// Source column.
    pub column: Column,
}

/// A join the backend performs so computed or referenced values are
/// available on each row.
#[derive(Debug, Clone, PartialEq)]
pub enum Join {
    /// Replace the stored key of a ref with the full target row.
    Ref {
        /// The ref property.
        prop: PropertyId,
        /// Target model.
        model: ModelId,
    },
    /// Fill a backref with `{_id}` of every row pointing here.
    BackRef {
        /// The backref property.
        prop: PropertyId,
        /// Model holding the ref.
        model: ModelId,
        /// The ref pointing back.
        refprop: PropertyId,
    },
    /// Fill an array with `{_id}` of the right leg of each join-model row
    /// whose left leg points here.
    Intermediate {
        /// The array property.
        prop: PropertyId,
        /// Join model.
        model: ModelId,
        /// Ref from the join model to this model.
        left: PropertyId,
        /// Ref from the join model to the item model.
        right: PropertyId,
    },
}

impl Join {
    /// The property the joined values are placed at.
    #[must_use]
    pub fn prop(&self) -> PropertyId {
        match self {
            Self::Ref { prop, .. } | Self::BackRef { prop, .. } | Self::Intermediate { prop, .. } => {
                *prop
            }
        }
    }

    /// The model joined in.
    #[must_use]
    pub fn model(&self) -> ModelId {
        match self {
            Self::Ref { model, .. }
            | Self::BackRef { model, .. }
            | Self::Intermediate { model, .. } => *model,
        }
    }
}

/// Keyset paging.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    /// Rows per page.
    pub size: usize,
    /// Total order: user sort keys, then primary keys.
    pub keys: Vec<SortKey>,
    /// Key values of the last row of the previous page.
    pub after: Option<Vec<Value>>,
}

/// A resolved, backend-neutral read plan.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    /// Model read.
    pub model: ModelId,
    /// Output fields in order.
    pub select: Vec<Selected>,
    /// Whether `select(...)` was given.
    pub explicit_select: bool,
    /// Row filter.
    pub filter: Option<Cond>,
    /// Ordering.
    pub sort: Vec<SortKey>,
    /// Maximum row count.
    pub limit: Option<usize>,
    /// Rows to skip.
    pub offset: Option<usize>,
    /// Keyset paging.
    pub page: Option<Page>,
    /// Deduplicate by the selected columns.
    pub distinct: bool,
    /// Return `{count}` instead of rows.
    pub count: bool,
    /// Joins, referenced by [`Column::join`].
    pub joins: Vec<Join>,
}

impl Query {
    /// A query reading every row of a model with no projection.
    #[must_use]
    pub fn all(model: ModelId) -> Self {
        Self {
            model,
            select: Vec::new(),
            explicit_select: false,
            filter: None,
            sort: Vec::new(),
            limit: None,
            offset: None,
            page: None,
            distinct: false,
            count: false,
            joins: Vec::new(),
        }
    }

    /// Effective ordering: the page keys when paging, else the sort keys.
    #[must_use]
    pub fn ordering(&self) -> &[SortKey] {
        match &self.page {
            Some(page) => &page.keys,
            None => &self.sort,
        }
    }

    /// Effective row limit: the page size when paging, else the limit.
    #[must_use]
    pub fn row_limit(&self) -> Option<usize> {
        match &self.page {
            Some(page) => Some(self.limit.map_or(page.size, |l| l.min(page.size))),
            None => self.limit,
        }
    }

    /// Adds a join unless an equal one exists, returning its index.
    pub fn add_join(&mut self, join: Join) -> usize {
        match self.joins.iter().position(|j| *j == join) {
            Some(i) => i,
            None => {
                self.joins.push(join);
                self.joins.len() - 1
            }
        }
    }
}

/// Everything resolution depends on besides the expression.
#[derive(Clone, Copy)]
pub struct Env<'a> {
    /// The linked manifest.
    pub manifest: &'a Manifest,
    /// Model being queried.
    pub model: &'a Model,
    /// Backend family the plan is for.
    pub family: BackendKind,
    /// Who is asking. `None` for trusted internal reads.
    pub caller: Option<&'a Caller>,
    /// Action checked for property access.
    pub action: Action,
    /// Function table.
    pub funcs: &'a FuncRegistry,
    /// Values for `param(name)`.
    pub params: &'a BTreeMap<String, Value>,
}

/// Kinds of resolved arguments, used for function dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum ArgKind {
    Any,
    Value,
    Null,
    Bool,
    Number,
    Integer,
    Text,
    Geometry,
    Column,
    TextColumn,
    DateColumn,
    NumberColumn,
    BoolColumn,
    GeometryColumn,
    RefColumn,
    OtherColumn,
    Cond,
}

impl Kind for ArgKind {
    fn parent(self) -> Option<Self> {
        use ArgKind::*;
        match self {
            Any => None,
            Value | Column | Cond => Some(Any),
            Null | Bool | Number | Text | Geometry => Some(Value),
            Integer => Some(Number),
            TextColumn | DateColumn | NumberColumn | BoolColumn | GeometryColumn | RefColumn
            | OtherColumn => Some(Column),
        }
    }
}

/// A resolved argument.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    /// A literal or computed value.
    Value(Value),
    /// A geometry value in WKT.
    Geometry(String),
    /// A column.
    Column(Column),
    /// Several columns, from `recurse`. Functions over them are combined
    /// with `or`.
    Columns(Vec<Column>),
    /// A condition.
    Cond(Cond),
    /// A statement (`select`, `sort`, ...) already applied to the query.
    Done,
}

/// The property whose values a column yields: arrays yield their items.
#[must_use]
pub fn value_prop<'a>(manifest: &'a Manifest, prop: &'a Property) -> &'a Property {
    match &prop.dtype {
        DType::Array(arr) if arr.intermediate.is_none() => value_prop(manifest, manifest.property(arr.items)),
        _ => prop,
    }
}

impl Arg {
    /// Dispatch kind.
    #[must_use]
    pub fn kind(&self, manifest: &Manifest) -> ArgKind {
        match self {
            Self::Value(Value::Null) => ArgKind::Null,
            Self::Value(Value::Bool(_)) => ArgKind::Bool,
            Self::Value(Value::Number(n)) if n.is_i64() || n.is_u64() => ArgKind::Integer,
            Self::Value(Value::Number(_)) => ArgKind::Number,
            Self::Value(Value::String(_)) => ArgKind::Text,
            Self::Value(_) => ArgKind::Value,
            Self::Geometry(_) => ArgKind::Geometry,
            Self::Column(c) => {
                let prop = value_prop(manifest, manifest.property(c.prop));
                match &prop.dtype {
                    DType::Pk | DType::String | DType::Uri | DType::Url => ArgKind::TextColumn,
                    DType::Date | DType::DateTime => ArgKind::DateColumn,
                    DType::Integer | DType::Number => ArgKind::NumberColumn,
                    DType::Boolean => ArgKind::BoolColumn,
                    DType::Geometry(_) => ArgKind::GeometryColumn,
                    DType::Ref(_) => ArgKind::RefColumn,
                    _ => ArgKind::OtherColumn,
                }
            }
            Self::Columns(_) => ArgKind::Column,
            Self::Cond(_) => ArgKind::Cond,
            Self::Done => ArgKind::Any,
        }
    }
}
