//! SQL backend.
//!
//! Queries, writes and schema actions are compiled to PostgreSQL text with
//! `$n` placeholders and handed to a [`SqlDriver`]. Each model maps to a
//! table named after the model; ref properties are stored in a `name._id`
//! column, objects and arrays in `JSONB` columns. Every table has a
//! `{model}/:changelog` companion.
//!
//! Nested places inside `JSONB` columns compile to `EXISTS` over
//! `jsonb_path_query`, which gives the same "some value matches" semantics
//! as in-process evaluation.

use super::eval::run_query;
use super::{backend_models, same_backend, Backend, PendingWrite, RowStream, Transaction};
use crate::changes::ChangeEntry;
use crate::config::BackendKind;
use crate::dtype::DType;
use crate::error::{CoreError, CoreResult};
use crate::manifest::{Manifest, Model, Property};
use crate::migration::{plan_migration, table_schema, ColumnSchema, SchemaAction, SchemaSnapshot, TableSchema};
use crate::types::{ModelId, Row};
use crate::ufunc::{CmpOp, Column, ColumnFunc, Cond, Join, Query, SortKey};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

const SCHEMA_TABLE: &str = "_datagate_schema";
const MANIFEST_TABLE: &str = "_datagate_manifest";

/// A statement with its positional parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlPlan {
    /// Statement text with `$1`, `$2`, ... placeholders.
    pub sql: String,
    /// Parameter values. Objects and arrays bind as `jsonb`.
    pub params: Vec<Value>,
}

impl SqlPlan {
    fn text(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }
}

/// Connection to a SQL database.
pub trait SqlDriver: Send + Sync {
    /// Whether the database answers.
    fn ping(&self) -> bool;

    /// Runs a query, returning rows keyed by column name.
    ///
    /// # Errors
    ///
    /// Returns driver failures.
    fn query(&self, plan: &SqlPlan) -> CoreResult<Vec<Row>>;

    /// Runs statements in one database transaction.
    ///
    /// # Errors
    ///
    /// Returns driver failures; nothing is applied then.
    fn execute_batch(&self, plans: &[SqlPlan]) -> CoreResult<()>;
}

/// Quotes an identifier.
#[must_use]
pub fn ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn changelog(model: &str) -> String {
    format!("{model}/:changelog")
}

/// Stored column name of a top-level property.
#[must_use]
pub fn column_name(prop: &Property) -> String {
    match prop.dtype {
        DType::Ref(_) => format!("{}._id", prop.name),
        _ => prop.name.clone(),
    }
}

fn schema_column_name(column: &ColumnSchema) -> String {
    if column.dtype == "ref" {
        format!("{}._id", column.name)
    } else {
        column.name.clone()
    }
}

fn sql_type(column: &ColumnSchema) -> String {
    let dtype = column.dtype.as_str();
    if let Some(srid) = dtype.strip_prefix("geometry(").and_then(|s| s.strip_suffix(')')) {
        return format!("geometry(GEOMETRY, {srid})");
    }
    match dtype {
        "pk" => "TEXT PRIMARY KEY",
        "string" | "uri" | "url" | "ref" => "TEXT",
        "integer" => "BIGINT",
        "number" => "DOUBLE PRECISION",
        "boolean" => "BOOLEAN",
        "date" => "DATE",
        "datetime" => "TIMESTAMP",
        "geometry" => "geometry",
        _ => "JSONB",
    }
    .to_string()
}

fn column_def(column: &ColumnSchema) -> String {
    format!("{} {}", ident(&schema_column_name(column)), sql_type(column))
}

fn snapshot_upsert(table: &TableSchema) -> SqlPlan {
    SqlPlan {
        sql: format!(
            "INSERT INTO {t} (\"name\", \"schema\") VALUES ($1, $2) \
             ON CONFLICT (\"name\") DO UPDATE SET \"schema\" = EXCLUDED.\"schema\"",
            t = ident(SCHEMA_TABLE)
        ),
        params: vec![
            Value::from(table.name.as_str()),
            serde_json::to_value(table).unwrap_or(Value::Null),
        ],
    }
}

/// Statements performing one schema action.
#[must_use]
pub fn compile_ddl(action: &SchemaAction) -> Vec<SqlPlan> {
    let table = ident(action.table());
    match action {
        SchemaAction::CreateTable { table: schema } => {
            let columns: Vec<String> = schema.columns.iter().map(column_def).collect();
            vec![
                SqlPlan::text(format!("CREATE TABLE IF NOT EXISTS {table} ({})", columns.join(", "))),
                SqlPlan::text(format!(
                    "CREATE TABLE IF NOT EXISTS {} (\"_change\" BIGSERIAL PRIMARY KEY, \
                     \"_txn\" TEXT, \"_revision\" TEXT, \"_rid\" TEXT, \
                     \"datetime\" TIMESTAMPTZ, \"_op\" TEXT, \"diff\" JSONB)",
                    ident(&changelog(&schema.name))
                )),
            ]
        }
        SchemaAction::AddColumn { column, .. } => vec![SqlPlan::text(format!(
            "ALTER TABLE {table} ADD COLUMN {}",
            column_def(column)
        ))],
        SchemaAction::AlterColumn { from, to, .. } => {
            let name = ident(&schema_column_name(to));
            let mut plans = Vec::new();
            if schema_column_name(from) != schema_column_name(to) {
                plans.push(SqlPlan::text(format!(
                    "ALTER TABLE {table} RENAME COLUMN {} TO {name}",
                    ident(&schema_column_name(from))
                )));
            }
            let ty = sql_type(to);
            plans.push(SqlPlan::text(format!(
                "ALTER TABLE {table} ALTER COLUMN {name} TYPE {ty} USING {name}::{ty}"
            )));
            plans
        }
        SchemaAction::DropColumn { column, .. } => vec![SqlPlan::text(format!(
            "ALTER TABLE {table} DROP COLUMN IF EXISTS {}",
            ident(column)
        ))],
        SchemaAction::DropTable { table: name } => vec![
            SqlPlan::text(format!("DROP TABLE IF EXISTS {table}")),
            SqlPlan::text(format!("DROP TABLE IF EXISTS {}", ident(&changelog(name)))),
        ],
    }
}

enum Place {
    /// A plain column expression.
    Scalar(String),
    /// Values at a JSON path inside a `JSONB` column.
    Nested { root: String, path: String },
}

fn json_path(rest: &str) -> String {
    let mut path = String::from("$");
    for segment in rest.split('.').filter(|s| !s.is_empty()) {
        path.push_str(&format!(".\"{}\"", segment.replace('"', "")));
    }
    path.push_str("[*]");
    path.replace('\'', "''")
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Number(_) => "number",
        Value::Bool(_) => "boolean",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
        Value::Null => "null",
    }
}

fn like_pattern(text: &str, prefix_only: bool) -> String {
    let escaped = text
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    if prefix_only {
        format!("{escaped}%")
    } else {
        format!("%{escaped}%")
    }
}

struct Compiler<'a> {
    manifest: &'a Manifest,
    model: &'a Model,
    query: &'a Query,
    backend: &'a str,
    params: Vec<Value>,
}

impl<'a> Compiler<'a> {
    fn param(&mut self, value: Value) -> String {
        self.params.push(value);
        format!("${}", self.params.len())
    }

    fn unsupported(&self, what: impl Into<String>) -> CoreError {
        CoreError::backend(self.backend, what)
    }

    fn top_prop(&self, model: &Model, place: &str) -> CoreResult<&'a Property> {
        let manifest = self.manifest;
        manifest.property_by_place(model.id, place)
    }

    fn place(&self, column: &Column) -> CoreResult<Place> {
        let (alias, model, place) = match column.join {
            Some(i) => {
                let join = &self.query.joins[i];
                let prop = self.manifest.property(join.prop());
                if prop.parent.is_some() {
                    return Err(self.unsupported(format!("join through nested ref {}", prop.place)));
                }
                let inner = column
                    .place
                    .strip_prefix(&format!("{}.", prop.place))
                    .ok_or_else(|| self.unsupported(format!("column {} outside its join", column.place)))?;
                let target = same_backend(self.manifest, self.backend, join.model())?;
                (format!("j{i}"), target, inner.to_string())
            }
            None => ("t".to_string(), self.model, column.place.clone()),
        };
        let (root, rest) = match place.split_once('.') {
            Some((root, rest)) => (root.to_string(), Some(rest.to_string())),
            None => (place.clone(), None),
        };
        let prop = self.top_prop(model, &root)?;
        let qualified = |name: &str| format!("{alias}.{}", ident(name));
        Ok(match (&prop.dtype, rest.as_deref()) {
            (DType::Ref(_), Some("_id")) => Place::Scalar(qualified(&column_name(prop))),
            (DType::Ref(_), _) => {
                return Err(self.unsupported(format!("ref place {place} without a join")));
            }
            (DType::Array(_) | DType::Object(_) | DType::File, rest) => Place::Nested {
                root: qualified(&prop.name),
                path: json_path(rest.unwrap_or("")),
            },
            (_, None) => Place::Scalar(qualified(&prop.name)),
            (_, Some(_)) => return Err(self.unsupported(format!("nested place {place}"))),
        })
    }

    fn with_funcs(expr: String, funcs: &[ColumnFunc]) -> String {
        funcs.iter().fold(expr, |acc, f| match f {
            ColumnFunc::Lower => format!("lower({acc})"),
            ColumnFunc::Upper => format!("upper({acc})"),
            ColumnFunc::Flip => format!("ST_FlipCoordinates({acc})"),
        })
    }

    fn encode(&self, column: &Column, value: &Value) -> Value {
        self.manifest
            .property(column.prop)
            .dtype
            .encode(self.manifest, BackendKind::Sql, value)
    }

    fn sort_expr(&self, column: &Column) -> CoreResult<String> {
        Ok(match self.place(column)? {
            Place::Scalar(e) => Self::with_funcs(e, &column.funcs),
            Place::Nested { root, path } => Self::with_funcs(
                format!("(jsonb_path_query_first({root}, '{path}') #>> '{{}}')"),
                &column.funcs,
            ),
        })
    }

    fn sort_param(&mut self, column: &Column, value: &Value) -> CoreResult<String> {
        let nested = matches!(self.place(column)?, Place::Nested { .. });
        let value = match value {
            Value::String(_) | Value::Null => value.clone(),
            other if nested => Value::from(other.to_string()),
            other => self.encode(column, other),
        };
        Ok(self.param(value))
    }

    fn compare(&mut self, column: &Column, op: CmpOp, value: &Value) -> CoreResult<String> {
        let sql_op = match op {
            CmpOp::Eq => "=",
            CmpOp::Ne => "<>",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        };
        match self.place(column)? {
            Place::Scalar(e) => {
                let e = Self::with_funcs(e, &column.funcs);
                Ok(match (op, value) {
                    (CmpOp::Eq, Value::Null) => format!("{e} IS NULL"),
                    (CmpOp::Ne, Value::Null) => format!("{e} IS NOT NULL"),
                    (CmpOp::Ne, v) => {
                        let p = self.param(self.encode(column, v));
                        format!("{e} IS DISTINCT FROM {p}")
                    }
                    (_, Value::Null) => "FALSE".to_string(),
                    (_, v) => {
                        let p = self.param(self.encode(column, v));
                        format!("{e} {sql_op} {p}")
                    }
                })
            }
            Place::Nested { root, path } => {
                let exists = |cond: String| {
                    format!("EXISTS (SELECT 1 FROM jsonb_path_query({root}, '{path}') AS v(x) WHERE {cond})")
                };
                if !column.funcs.is_empty() {
                    let e = Self::with_funcs("(x #>> '{}')".to_string(), &column.funcs);
                    let p = self.param(value.clone());
                    return Ok(match op {
                        CmpOp::Ne => format!("NOT {}", exists(format!("{e} = {p}"))),
                        _ => exists(format!("{e} {sql_op} {p}")),
                    });
                }
                let encoded = self.encode(column, value);
                Ok(match (op, value) {
                    (CmpOp::Eq, Value::Null) => {
                        format!("NOT {}", exists("x <> 'null'::jsonb".to_string()))
                    }
                    (CmpOp::Ne, Value::Null) => exists("x <> 'null'::jsonb".to_string()),
                    (CmpOp::Eq, _) => {
                        let p = self.param(Value::from(encoded.to_string()));
                        exists(format!("x = {p}::jsonb"))
                    }
                    (CmpOp::Ne, _) => {
                        let p = self.param(Value::from(encoded.to_string()));
                        format!("NOT {}", exists(format!("x = {p}::jsonb")))
                    }
                    (_, v) => {
                        let ty = json_type(v);
                        let p = self.param(Value::from(encoded.to_string()));
                        exists(format!("jsonb_typeof(x) = '{ty}' AND x {sql_op} {p}::jsonb"))
                    }
                })
            }
        }
    }

    fn like(&mut self, column: &Column, text: &str, prefix_only: bool) -> CoreResult<String> {
        let pattern = like_pattern(text, prefix_only);
        match self.place(column)? {
            Place::Scalar(e) => {
                let e = Self::with_funcs(e, &column.funcs);
                let p = self.param(Value::from(pattern));
                Ok(format!("{e} LIKE {p} ESCAPE '\\'"))
            }
            Place::Nested { root, path } => {
                let e = Self::with_funcs("(x #>> '{}')".to_string(), &column.funcs);
                let p = self.param(Value::from(pattern));
                Ok(format!(
                    "EXISTS (SELECT 1 FROM jsonb_path_query({root}, '{path}') AS v(x) \
                     WHERE {e} LIKE {p} ESCAPE '\\')"
                ))
            }
        }
    }

    fn after(&mut self, keys: &[SortKey], values: &[Value]) -> CoreResult<String> {
        let mut branches = Vec::new();
        for (i, (key, value)) in keys.iter().zip(values).enumerate() {
            let mut parts = Vec::new();
            for (prev, prev_value) in keys[..i].iter().zip(values) {
                let e = self.sort_expr(&prev.column)?;
                parts.push(match prev_value {
                    Value::Null => format!("{e} IS NULL"),
                    v => {
                        let p = self.sort_param(&prev.column, v)?;
                        format!("{e} = {p}")
                    }
                });
            }
            let e = self.sort_expr(&key.column)?;
            parts.push(match (key.descending, value) {
                (false, Value::Null) => format!("{e} IS NOT NULL"),
                (false, v) => {
                    let p = self.sort_param(&key.column, v)?;
                    format!("{e} > {p}")
                }
                (true, Value::Null) => "FALSE".to_string(),
                (true, v) => {
                    let p = self.sort_param(&key.column, v)?;
                    format!("({e} < {p} OR {e} IS NULL)")
                }
            });
            branches.push(format!("({})", parts.join(" AND ")));
        }
        Ok(match branches.len() {
            0 => "FALSE".to_string(),
            _ => format!("({})", branches.join(" OR ")),
        })
    }

    fn cond(&mut self, cond: &Cond) -> CoreResult<String> {
        Ok(match cond {
            Cond::And(conds) => {
                let parts = conds.iter().map(|c| self.cond(c)).collect::<CoreResult<Vec<_>>>()?;
                format!("({})", parts.join(" AND "))
            }
            Cond::Or(conds) => {
                let parts = conds.iter().map(|c| self.cond(c)).collect::<CoreResult<Vec<_>>>()?;
                format!("({})", parts.join(" OR "))
            }
            Cond::Not(inner) => format!("NOT ({})", self.cond(inner)?),
            Cond::Compare { column, op, value } => self.compare(column, *op, value)?,
            Cond::Contains { column, value } => self.like(column, value, false)?,
            Cond::StartsWith { column, value } => self.like(column, value, true)?,
            Cond::After { keys, values } => self.after(keys, values)?,
        })
    }

    fn join_sql(&self, i: usize, join: &Join) -> CoreResult<(Option<String>, String)> {
        let prop = self.manifest.property(join.prop());
        if prop.parent.is_some() {
            return Err(self.unsupported(format!("join through nested place {}", prop.place)));
        }
        let target = same_backend(self.manifest, self.backend, join.model())?;
        let table = ident(&target.name);
        let place = ident(&prop.place);
        Ok(match join {
            Join::Ref { .. } => (
                Some(format!(
                    "LEFT JOIN {table} AS j{i} ON j{i}.\"_id\" = t.{}",
                    ident(&column_name(prop))
                )),
                format!("to_jsonb(j{i}.*) AS {place}"),
            ),
            Join::BackRef { refprop, .. } => {
                let refcol = ident(&column_name(self.manifest.property(*refprop)));
                (
                    None,
                    format!(
                        "(SELECT COALESCE(jsonb_agg(jsonb_build_object('_id', b{i}.\"_id\")), '[]'::jsonb) \
                         FROM {table} AS b{i} WHERE b{i}.{refcol} = t.\"_id\") AS {place}"
                    ),
                )
            }
            Join::Intermediate { left, right, .. } => {
                let left = ident(&column_name(self.manifest.property(*left)));
                let right = ident(&column_name(self.manifest.property(*right)));
                (
                    None,
                    format!(
                        "(SELECT COALESCE(jsonb_agg(jsonb_build_object('_id', b{i}.{right})), '[]'::jsonb) \
                         FROM {table} AS b{i} WHERE b{i}.{left} = t.\"_id\") AS {place}"
                    ),
                )
            }
        })
    }

    fn select(mut self) -> CoreResult<SqlPlan> {
        let mut joins = Vec::new();
        let mut computed = Vec::new();
        for (i, join) in self.query.joins.iter().enumerate() {
            let (clause, expr) = self.join_sql(i, join)?;
            joins.extend(clause);
            computed.push(expr);
        }

        let columns: Vec<String> = if self.query.count {
            vec!["COUNT(*) AS \"count\"".to_string()]
        } else if self.query.distinct && !self.query.select.is_empty() {
            let mut out = Vec::new();
            for selected in &self.query.select {
                let e = self.sort_expr(&selected.column)?;
                out.push(format!("{e} AS {}", ident(&selected.column.place)));
            }
            out
        } else {
            let stored = table_schema(self.manifest, self.model);
            let mut out: Vec<String> = stored
                .columns
                .iter()
                .map(|c| format!("t.{}", ident(&schema_column_name(c))))
                .collect();
            out.extend(computed);
            out
        };

        let mut sql = format!(
            "SELECT {}{} FROM {} AS t",
            if self.query.distinct && !self.query.count { "DISTINCT " } else { "" },
            columns.join(", "),
            ident(&self.model.name)
        );
        for join in joins {
            sql.push(' ');
            sql.push_str(&join);
        }
        if let Some(filter) = &self.query.filter {
            let where_sql = self.cond(filter)?;
            sql.push_str(&format!(" WHERE {where_sql}"));
        }
        if !self.query.count {
            let ordering = self.query.ordering();
            if !ordering.is_empty() {
                let keys = ordering
                    .iter()
                    .map(|k| {
                        let e = self.sort_expr(&k.column)?;
                        Ok(if k.descending {
                            format!("{e} DESC NULLS LAST")
                        } else {
                            format!("{e} ASC NULLS FIRST")
                        })
                    })
                    .collect::<CoreResult<Vec<_>>>()?;
                sql.push_str(&format!(" ORDER BY {}", keys.join(", ")));
            }
            if let Some(limit) = self.query.row_limit() {
                sql.push_str(&format!(" LIMIT {limit}"));
            }
            if let Some(offset) = self.query.offset {
                sql.push_str(&format!(" OFFSET {offset}"));
            }
        }
        Ok(SqlPlan {
            sql,
            params: self.params,
        })
    }
}

/// Compiles a read.
///
/// # Errors
///
/// Fails for joins through nested refs and joins into other backends.
pub fn compile_select(manifest: &Manifest, query: &Query, backend: &str) -> CoreResult<SqlPlan> {
    let compiler = Compiler {
        manifest,
        model: manifest.model(query.model),
        query,
        backend,
        params: Vec::new(),
    };
    compiler.select()
}

fn stored_value(manifest: &Manifest, prop: &Property, value: &Value) -> Value {
    match (&prop.dtype, value) {
        (DType::Ref(_), Value::Object(map)) => map.get("_id").cloned().unwrap_or(Value::Null),
        (dtype, v) => dtype.encode(manifest, BackendKind::Sql, v),
    }
}

fn assignments(manifest: &Manifest, model: &Model, row: &Row) -> CoreResult<Vec<(String, Value)>> {
    row.iter()
        .map(|(key, value)| {
            let prop = manifest.property_by_place(model.id, key)?;
            Ok((column_name(prop), stored_value(manifest, prop, value)))
        })
        .collect()
}

/// Compiles one staged write.
///
/// # Errors
///
/// `ModelNotFound` and `PropertyNotFound` for rows not matching the
/// manifest.
pub fn compile_write(manifest: &Manifest, write: &PendingWrite) -> CoreResult<Vec<SqlPlan>> {
    let model = manifest.model_by_name(write.model())?;
    let table = ident(&model.name);
    Ok(match write {
        PendingWrite::Insert { row, .. } => {
            let values = assignments(manifest, model, row)?;
            let names: Vec<String> = values.iter().map(|(c, _)| ident(c)).collect();
            let marks: Vec<String> = (1..=values.len()).map(|n| format!("${n}")).collect();
            vec![SqlPlan {
                sql: format!("INSERT INTO {table} ({}) VALUES ({})", names.join(", "), marks.join(", ")),
                params: values.into_iter().map(|(_, v)| v).collect(),
            }]
        }
        PendingWrite::Update { row, .. } => {
            let mut full = Row::new();
            for column in table_schema(manifest, model).columns {
                let value = row.get(&column.name).cloned().unwrap_or(Value::Null);
                full.insert(column.name, value);
            }
            let id = full.remove("_id").unwrap_or(Value::Null);
            vec![update_plan(&table, assignments(manifest, model, &full)?, id)]
        }
        PendingWrite::Patch { id, patch, .. } => {
            vec![update_plan(&table, assignments(manifest, model, patch)?, Value::from(id.as_str()))]
        }
        PendingWrite::Delete { id, .. } => vec![SqlPlan {
            sql: format!("DELETE FROM {table} WHERE \"_id\" = $1"),
            params: vec![Value::from(id.as_str())],
        }],
        PendingWrite::Wipe { .. } => vec![
            SqlPlan::text(format!("DELETE FROM {table}")),
            SqlPlan::text(format!("DELETE FROM {}", ident(&changelog(&model.name)))),
        ],
        PendingWrite::Change { entry, .. } => vec![SqlPlan {
            sql: format!(
                "INSERT INTO {} (\"_txn\", \"_revision\", \"_rid\", \"datetime\", \"_op\", \"diff\") \
                 VALUES ($1, $2, $3, $4, $5, $6)",
                ident(&changelog(&model.name))
            ),
            params: vec![
                Value::from(entry.txn.as_str()),
                Value::from(entry.revision.as_str()),
                Value::from(entry.id.as_str()),
                Value::from(entry.datetime.to_rfc3339()),
                Value::from(entry.op.as_str()),
                Value::Object(entry.diff.clone()),
            ],
        }],
    })
}

fn update_plan(table: &str, values: Vec<(String, Value)>, id: Value) -> SqlPlan {
    let sets: Vec<String> = values
        .iter()
        .enumerate()
        .map(|(n, (c, _))| format!("{} = ${}", ident(c), n + 1))
        .collect();
    let mut params: Vec<Value> = values.into_iter().map(|(_, v)| v).collect();
    params.push(id);
    SqlPlan {
        sql: format!("UPDATE {table} SET {} WHERE \"_id\" = ${}", sets.join(", "), params.len()),
        params,
    }
}

/// Turns `name._id` columns back into `{name: {_id}}` objects, recursing
/// into joined rows.
#[must_use]
pub fn normalize_row(raw: Row) -> Row {
    let mut out = Row::new();
    let mut refs = Vec::new();
    for (key, value) in raw {
        match key.strip_suffix("._id") {
            Some(base) => refs.push((base.to_string(), value)),
            None => {
                let value = match value {
                    Value::Object(map) => Value::Object(normalize_row(map)),
                    other => other,
                };
                out.insert(key, value);
            }
        }
    }
    for (base, id) in refs {
        let joined = out.get(&base).is_some_and(Value::is_object);
        if !joined {
            let value = if id.is_null() {
                Value::Null
            } else {
                let mut obj = Map::new();
                obj.insert("_id".into(), id);
                Value::Object(obj)
            };
            out.insert(base, value);
        }
    }
    out
}

/// Backend speaking SQL through a driver.
pub struct SqlBackend {
    name: String,
    driver: Arc<dyn SqlDriver>,
}

impl SqlBackend {
    /// Wraps a driver.
    #[must_use]
    pub fn new(name: &str, driver: Arc<dyn SqlDriver>) -> Self {
        Self {
            name: name.to_string(),
            driver,
        }
    }

    fn committed_rows(&self, manifest: &Manifest, model: &Model) -> CoreResult<Vec<Row>> {
        let plan = compile_select(manifest, &Query::all(model.id), &self.name)?;
        self.driver
            .query(&plan)?
            .into_iter()
            .map(|raw| self.decode(manifest, model, raw))
            .collect()
    }

    fn decode(&self, manifest: &Manifest, model: &Model, raw: Row) -> CoreResult<Row> {
        let mut row = normalize_row(raw);
        for prop in manifest.top_properties(model.id) {
            if let Some(value) = row.get_mut(&prop.name) {
                if !matches!(prop.dtype, DType::Ref(_)) {
                    *value = prop.dtype.decode(manifest, BackendKind::Sql, value)?;
                }
            }
        }
        Ok(row)
    }

    fn bootstrap_plans() -> Vec<SqlPlan> {
        vec![
            SqlPlan::text(format!(
                "CREATE TABLE IF NOT EXISTS {} (\"name\" TEXT PRIMARY KEY, \"schema\" JSONB NOT NULL)",
                ident(SCHEMA_TABLE)
            )),
            SqlPlan::text(format!(
                "CREATE TABLE IF NOT EXISTS {} (\"idx\" INTEGER PRIMARY KEY, \"doc\" JSONB NOT NULL)",
                ident(MANIFEST_TABLE)
            )),
        ]
    }

    fn action_plans(action: &SchemaAction, snapshot: &mut SchemaSnapshot) -> Vec<SqlPlan> {
        let mut plans = compile_ddl(action);
        let table = action.table().to_string();
        match action {
            SchemaAction::CreateTable { table: schema } => {
                snapshot.insert(table.clone(), schema.clone());
            }
            SchemaAction::AddColumn { column, .. } => {
                if let Some(s) = snapshot.get_mut(&table) {
                    s.columns.push(column.clone());
                }
            }
            SchemaAction::AlterColumn { from, to, .. } => {
                if let Some(c) = snapshot
                    .get_mut(&table)
                    .and_then(|s| s.columns.iter_mut().find(|c| c.name == from.name))
                {
                    *c = to.clone();
                }
            }
            SchemaAction::DropColumn { column, .. } => {
                if let Some(s) = snapshot.get_mut(&table) {
                    s.columns.retain(|c| c.name != *column);
                }
            }
            SchemaAction::DropTable { .. } => {
                snapshot.remove(&table);
                plans.push(SqlPlan {
                    sql: format!("DELETE FROM {} WHERE \"name\" = $1", ident(SCHEMA_TABLE)),
                    params: vec![Value::from(table.as_str())],
                });
                return plans;
            }
        }
        if let Some(schema) = snapshot.get(&table) {
            plans.push(snapshot_upsert(schema));
        }
        plans
    }
}

impl Backend for SqlBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn family(&self) -> BackendKind {
        BackendKind::Sql
    }

    fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.driver.ping() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(200));
        }
    }

    fn bootstrap(&self, manifest: &Manifest) -> CoreResult<()> {
        self.driver.execute_batch(&Self::bootstrap_plans())?;
        let current = self.schema()?;
        let creates: Vec<SchemaAction> = plan_migration(manifest, backend_models(manifest, &self.name), &current)
            .into_iter()
            .filter(|a| matches!(a, SchemaAction::CreateTable { .. }))
            .collect();
        if !creates.is_empty() {
            info!(backend = %self.name, tables = creates.len(), "bootstrapping");
            self.migrate(manifest, &creates)?;
        }
        Ok(())
    }

    fn schema(&self) -> CoreResult<SchemaSnapshot> {
        let rows = self.driver.query(&SqlPlan::text(format!(
            "SELECT \"name\", \"schema\" FROM {}",
            ident(SCHEMA_TABLE)
        )))?;
        rows.into_iter()
            .map(|row| {
                let schema: TableSchema =
                    serde_json::from_value(row.get("schema").cloned().unwrap_or(Value::Null))?;
                Ok((schema.name.clone(), schema))
            })
            .collect()
    }

    fn migrate(&self, _manifest: &Manifest, actions: &[SchemaAction]) -> CoreResult<()> {
        let mut snapshot = self.schema()?;
        let plans: Vec<SqlPlan> = actions
            .iter()
            .flat_map(|a| Self::action_plans(a, &mut snapshot))
            .collect();
        debug!(backend = %self.name, statements = plans.len(), "applying schema actions");
        self.driver.execute_batch(&plans)
    }

    fn load_manifest_docs(&self) -> CoreResult<Vec<Value>> {
        let rows = self.driver.query(&SqlPlan::text(format!(
            "SELECT \"doc\" FROM {} ORDER BY \"idx\"",
            ident(MANIFEST_TABLE)
        )))?;
        Ok(rows.into_iter().filter_map(|mut r| r.remove("doc")).collect())
    }

    fn save_manifest_docs(&self, docs: &[Value]) -> CoreResult<()> {
        let table = ident(MANIFEST_TABLE);
        let mut plans = vec![SqlPlan::text(format!("DELETE FROM {table}"))];
        for (idx, doc) in docs.iter().enumerate() {
            plans.push(SqlPlan {
                sql: format!("INSERT INTO {table} (\"idx\", \"doc\") VALUES ($1, $2)"),
                params: vec![Value::from(idx), doc.clone()],
            });
        }
        self.driver.execute_batch(&plans)
    }

    fn execute(&self, manifest: &Manifest, query: &Query, txn: &Transaction) -> CoreResult<RowStream> {
        let model = manifest.model(query.model);
        if txn.pending().iter().any(|w| w.model() == model.name) {
            debug!(backend = %self.name, model = %model.name, "evaluating over staged writes");
            let rows = txn.overlay(&model.name, self.committed_rows(manifest, model)?);
            let mut fetch = |id: ModelId| -> CoreResult<Vec<Row>> {
                let joined = same_backend(manifest, &self.name, id)?;
                Ok(txn.overlay(&joined.name, self.committed_rows(manifest, joined)?))
            };
            let rows = run_query(manifest, query, rows, &mut fetch)?;
            return Ok(Box::new(rows.into_iter().map(Ok)));
        }
        let plan = compile_select(manifest, query, &self.name)?;
        debug!(backend = %self.name, sql = %plan.sql, "query");
        let rows = self.driver.query(&plan)?;
        if query.count || query.distinct {
            return Ok(Box::new(rows.into_iter().map(Ok)));
        }
        let decoded = rows
            .into_iter()
            .map(|raw| self.decode(manifest, model, raw))
            .collect::<CoreResult<Vec<_>>>()?;
        Ok(Box::new(decoded.into_iter().map(Ok)))
    }

    fn fetch(&self, manifest: &Manifest, model: &Model, id: &str) -> CoreResult<Option<Row>> {
        let columns: Vec<String> = table_schema(manifest, model)
            .columns
            .iter()
            .map(|c| ident(&schema_column_name(c)))
            .collect();
        let plan = SqlPlan {
            sql: format!(
                "SELECT {} FROM {} WHERE \"_id\" = $1",
                columns.join(", "),
                ident(&model.name)
            ),
            params: vec![Value::from(id)],
        };
        match self.driver.query(&plan)?.into_iter().next() {
            Some(raw) => Ok(Some(self.decode(manifest, model, raw)?)),
            None => Ok(None),
        }
    }

    fn changes(&self, model: &Model, offset: i64, limit: Option<usize>) -> CoreResult<Vec<ChangeEntry>> {
        let table = ident(&changelog(&model.name));
        let columns = "\"_change\", \"_txn\", \"_revision\", \"_rid\" AS \"_id\", \
                       to_char(\"datetime\" AT TIME ZONE 'UTC', 'YYYY-MM-DD\"T\"HH24:MI:SS.US\"Z\"') AS \"datetime\", \
                       \"_op\", \"diff\"";
        let limit_sql = limit.map_or(String::new(), |l| format!(" LIMIT {l}"));
        let plan = if offset < 0 {
            SqlPlan::text(format!(
                "SELECT * FROM (SELECT {columns} FROM {table} ORDER BY \"_change\" DESC LIMIT {}) AS c \
                 ORDER BY \"_change\"{limit_sql}",
                offset.unsigned_abs()
            ))
        } else {
            SqlPlan {
                sql: format!("SELECT {columns} FROM {table} WHERE \"_change\" >= $1 ORDER BY \"_change\"{limit_sql}"),
                params: vec![Value::from(offset)],
            }
        };
        self.driver
            .query(&plan)?
            .into_iter()
            .map(|row| Ok(serde_json::from_value(Value::Object(row))?))
            .collect()
    }

    fn commit(&self, manifest: &Manifest, txn: &mut Transaction) -> CoreResult<()> {
        txn.ensure_active()?;
        let mut plans = Vec::new();
        for write in txn.pending() {
            plans.extend(compile_write(manifest, write)?);
        }
        if !plans.is_empty() {
            self.driver.execute_batch(&plans)?;
        }
        txn.take_writes();
        txn.mark_committed();
        debug!(backend = %self.name, txn = %txn.id(), statements = plans.len(), "transaction committed");
        Ok(())
    }
}
