//! Expression tree walker producing a [`Query`].

use super::page::decode_cursor;
use super::{value_prop, Arg, Column, Cond, Env, Join, Page, Query, Selected, SortKey};
use crate::dtype::{parse_type, ArrayType, DType, GeometryType};
use crate::error::{CoreError, CoreResult, ErrorKind};
use crate::manifest::{Model, Property};
use datagate_expr::{unparse_expr, Expr, Literal, Node};
use serde_json::Value;
use tracing::debug;

/// Resolves an expression against a model into a backend-neutral plan.
///
/// Top-level `and` arguments are statements: conditions are combined into
/// the filter, `select`, `sort`, `page` and friends shape the query.
///
/// # Errors
///
/// `PropertyNotFound` for unknown names, `UnknownMethod` for functions with
/// no matching signature, `InsufficientScope` for properties the caller may
/// not read, `TooShortPageSize` and `InvalidValue` for bad arguments.
pub fn resolve_query(env: &Env<'_>, expr: Option<&Node>) -> CoreResult<Query> {
    let mut resolver = Resolver {
        env,
        query: Query::all(env.model.id),
        filters: Vec::new(),
        page: None,
        prefix: String::new(),
    };
    if let Some(node) = expr {
        match node {
            Node::Expr(e) if e.name == "and" => {
                for arg in &e.args {
                    resolver.statement(arg)?;
                }
            }
            other => resolver.statement(other)?,
        }
    }
    let query = resolver.finish()?;
    debug!(model = %env.model.name, ?query, "query resolved");
    Ok(query)
}

struct PageArgs {
    size: usize,
    cursor: Option<String>,
    keys: Vec<Column>,
}

struct Resolver<'e, 'a> {
    env: &'e Env<'a>,
    query: Query,
    filters: Vec<Cond>,
    page: Option<PageArgs>,
    prefix: String,
}

fn invalid(expr: &Expr) -> CoreError {
    ErrorKind::InvalidValue
        .err()
        .with("expr", unparse_expr(expr))
        .into()
}

fn literal_count(expr: &Expr, node: &Node) -> CoreResult<usize> {
    match node {
        Node::Literal(Literal::Integer(n)) => usize::try_from(*n).map_err(|_| invalid(expr)),
        _ => Err(invalid(expr)),
    }
}

/// A plain type for `cast()`. Linked types (refs, arrays, ...) cannot be
/// cast to.
fn cast_type(name: &str) -> CoreResult<DType> {
    let spec = parse_type(name)?;
    Ok(match spec.name.as_str() {
        "pk" => DType::Pk,
        "string" => DType::String,
        "integer" => DType::Integer,
        "number" => DType::Number,
        "boolean" => DType::Boolean,
        "date" => DType::Date,
        "datetime" => DType::DateTime,
        "uri" => DType::Uri,
        "url" => DType::Url,
        "geometry" => DType::Geometry(GeometryType {
            kind: spec.geometry_kind,
            srid: spec.srid,
        }),
        other => {
            return Err(ErrorKind::UnableToCast
                .err()
                .with("type", other)
                .with("value", Value::Null)
                .into())
        }
    })
}

impl Resolver<'_, '_> {
    fn model(&self) -> &Model {
        self.env.model
    }

    fn not_found(&self, name: &str) -> CoreError {
        ErrorKind::PropertyNotFound
            .err()
            .model(&self.model().name)
            .property(name)
            .into()
    }

    fn check_access(&self, prop: &Property) -> CoreResult<()> {
        match self.env.caller {
            Some(caller) => caller.authorize_property(self.env.manifest, prop, self.env.action),
            None => Ok(()),
        }
    }

    fn readable(&self, prop: &Property) -> bool {
        let manifest = self.env.manifest;
        self.env
            .caller
            .map_or(true, |c| c.can(manifest.model(prop.model), Some(prop), self.env.action))
    }

    fn statement(&mut self, node: &Node) -> CoreResult<()> {
        match self.eval(node)? {
            Arg::Cond(cond) => self.filters.push(cond),
            Arg::Done | Arg::Value(Value::Bool(true)) => {}
            arg @ Arg::Column(_) if self.is_bool(&arg) => {
                let cond = self.call("eq", vec![arg, Arg::Value(Value::Bool(true))])?;
                self.push_cond(cond, node)?;
            }
            _ => {
                return Err(ErrorKind::InvalidValue
                    .err()
                    .with("expr", datagate_expr::unparse(node))
                    .into())
            }
        }
        Ok(())
    }

    fn push_cond(&mut self, arg: Arg, node: &Node) -> CoreResult<()> {
        match arg {
            Arg::Cond(cond) => {
                self.filters.push(cond);
                Ok(())
            }
            _ => Err(ErrorKind::InvalidValue
                .err()
                .with("expr", datagate_expr::unparse(node))
                .into()),
        }
    }

    fn is_bool(&self, arg: &Arg) -> bool {
        arg.kind(self.env.manifest) == super::ArgKind::BoolColumn
    }

    fn eval(&mut self, node: &Node) -> CoreResult<Arg> {
        let expr = match node {
            Node::Literal(lit) => return Ok(Arg::Value(lit.to_json())),
            Node::Expr(e) => e,
        };
        if let Some(name) = expr.bound_name() {
            return self.bind(name).map(Arg::Column);
        }
        match expr.name.as_str() {
            "and" | "or" => {
                let conds = expr
                    .args
                    .iter()
                    .map(|a| self.condition(a))
                    .collect::<CoreResult<Vec<_>>>()?;
                Ok(Arg::Cond(if expr.name == "and" {
                    Cond::And(conds)
                } else {
                    Cond::Or(conds)
                }))
            }
            "not" => {
                let [arg] = expr.args.as_slice() else {
                    return Err(invalid(expr));
                };
                Ok(Arg::Cond(Cond::Not(Box::new(self.condition(arg)?))))
            }
            "select" => self.select(expr),
            "sort" => self.sort(expr),
            "limit" | "offset" => {
                let [arg] = expr.args.as_slice() else {
                    return Err(invalid(expr));
                };
                let n = literal_count(expr, arg)?;
                if expr.name == "limit" {
                    self.query.limit = Some(n);
                } else {
                    self.query.offset = Some(n);
                }
                Ok(Arg::Done)
            }
            "page" => self.page(expr),
            "distinct" => {
                self.query.distinct = true;
                Ok(Arg::Done)
            }
            "count" => {
                self.query.count = true;
                Ok(Arg::Done)
            }
            "any" => self.any(expr),
            "recurse" => self.recurse(expr),
            "filter" => {
                let [receiver, pred] = expr.args.as_slice() else {
                    return Err(invalid(expr));
                };
                let column = self.column(receiver)?;
                let saved = std::mem::replace(&mut self.prefix, format!("{}.", column.place));
                let cond = self.condition(pred);
                self.prefix = saved;
                cond.map(Arg::Cond)
            }
            "getattr" => {
                let [receiver, Node::Expr(attr)] = expr.args.as_slice() else {
                    return Err(invalid(expr));
                };
                let name = attr.bound_name().ok_or_else(|| invalid(expr))?;
                let column = self.column(receiver)?;
                let saved = std::mem::replace(&mut self.prefix, format!("{}.", column.place));
                let result = self.bind(name);
                self.prefix = saved;
                result.map(Arg::Column)
            }
            "negative" | "positive" => {
                let [arg] = expr.args.as_slice() else {
                    return Err(invalid(expr));
                };
                match (self.eval(arg)?, expr.name.as_str()) {
                    (Arg::Value(Value::Number(n)), "positive") => Ok(Arg::Value(Value::Number(n))),
                    (Arg::Value(Value::Number(n)), _) => {
                        let negated = match n.as_i64() {
                            Some(i) => Value::from(-i),
                            None => n
                                .as_f64()
                                .and_then(|f| serde_json::Number::from_f64(-f))
                                .map_or(Value::Null, Value::Number),
                        };
                        Ok(Arg::Value(negated))
                    }
                    _ => Err(invalid(expr)),
                }
            }
            "cast" => {
                let [Node::Expr(ty), value] = expr.args.as_slice() else {
                    return Err(invalid(expr));
                };
                let dtype = cast_type(ty.bound_name().ok_or_else(|| invalid(expr))?)?;
                match self.eval(value)? {
                    Arg::Value(v) => Ok(Arg::Value(dtype.cast(&v)?)),
                    _ => Err(invalid(expr)),
                }
            }
            "param" => {
                let [Node::Expr(name)] = expr.args.as_slice() else {
                    return Err(invalid(expr));
                };
                let name = name.bound_name().ok_or_else(|| invalid(expr))?;
                self.env
                    .params
                    .get(name)
                    .cloned()
                    .map(Arg::Value)
                    .ok_or_else(|| {
                        ErrorKind::InvalidValue
                            .err()
                            .with("param", name)
                            .with("expr", unparse_expr(expr))
                            .into()
                    })
            }
            "kwarg" => Err(invalid(expr)),
            name => {
                let args = expr
                    .args
                    .iter()
                    .map(|a| self.eval(a))
                    .collect::<CoreResult<Vec<_>>>()?;
                self.call(name, args)
            }
        }
    }

    fn condition(&mut self, node: &Node) -> CoreResult<Cond> {
        match self.eval(node)? {
            Arg::Cond(cond) => Ok(cond),
            arg @ Arg::Column(_) if self.is_bool(&arg) => {
                match self.call("eq", vec![arg, Arg::Value(Value::Bool(true))])? {
                    Arg::Cond(cond) => Ok(cond),
                    _ => Err(CoreError::internal("eq did not produce a condition")),
                }
            }
            _ => Err(ErrorKind::InvalidValue
                .err()
                .with("expr", datagate_expr::unparse(node))
                .into()),
        }
    }

    fn column(&mut self, node: &Node) -> CoreResult<Column> {
        match self.eval(node)? {
            Arg::Column(column) => Ok(column),
            _ => Err(ErrorKind::InvalidValue
                .err()
                .with("expr", datagate_expr::unparse(node))
                .into()),
        }
    }

    /// Calls a registered function. Several columns from `recurse` are
    /// expanded into an `or` of one call per column.
    fn call(&mut self, name: &str, mut args: Vec<Arg>) -> CoreResult<Arg> {
        if let Some(Arg::Columns(columns)) = args.first().cloned() {
            let mut conds = Vec::with_capacity(columns.len());
            for column in columns {
                args[0] = Arg::Column(column);
                match self.call(name, args.clone())? {
                    Arg::Cond(cond) => conds.push(cond),
                    _ => return Err(CoreError::internal(format!("{name} over columns"))),
                }
            }
            return Ok(Arg::Cond(Cond::Or(conds)));
        }
        let kinds: Vec<_> = args.iter().map(|a| a.kind(self.env.manifest)).collect();
        let handler = self.env.funcs.lookup(name, &kinds)?;
        handler(self.env, args)
    }

    /// Resolves a dotted name, walking through one ref when the name goes
    /// past it.
    fn bind(&mut self, name: &str) -> CoreResult<Column> {
        let full = format!("{}{name}", self.prefix);
        let manifest = self.env.manifest;
        let model = self.env.model;
        let segments: Vec<&str> = full.split('.').collect();

        let (prop, used) = (1..=segments.len())
            .rev()
            .find_map(|n| {
                model
                    .flat
                    .get(&segments[..n].join("."))
                    .map(|id| (manifest.property(*id), n))
            })
            .ok_or_else(|| self.not_found(&full))?;
        self.check_access(prop)?;
        if used == segments.len() {
            return Ok(Column::of(prop));
        }

        let target = match &value_prop(manifest, prop).dtype {
            DType::Ref(r) => manifest.model(r.model),
            _ => return Err(self.not_found(&full)),
        };
        let rest = segments[used..].join(".");
        let inner = manifest
            .find_property(target.id, &rest)
            .ok_or_else(|| self.not_found(&full))?;
        self.check_access(inner)?;
        let place = format!("{}.{rest}", prop.place);
        if rest == "_id" {
            return Ok(Column {
                prop: inner.id,
                place,
                join: None,
                funcs: Vec::new(),
            });
        }
        let join = self.query.add_join(Join::Ref {
            prop: prop.id,
            model: target.id,
        });
        Ok(Column {
            prop: inner.id,
            place,
            join: Some(join),
            funcs: Vec::new(),
        })
    }

    /// Adds the joins an output column needs: level-4 refs and computed
    /// arrays.
    fn output_column(&mut self, mut column: Column) -> Column {
        let manifest = self.env.manifest;
        let prop = manifest.property(column.prop);
        if column.place != prop.place {
            return column;
        }
        let join = match &prop.dtype {
            DType::Ref(r) if prop.level.is_some_and(|l| l >= 4) => Some(Join::Ref {
                prop: prop.id,
                model: r.model,
            }),
            DType::BackRef(b) => Some(Join::BackRef {
                prop: prop.id,
                model: b.model,
                refprop: b.refprop,
            }),
            DType::Array(ArrayType {
                intermediate: Some(i),
                ..
            }) => Some(Join::Intermediate {
                prop: prop.id,
                model: i.model,
                left: i.left,
                right: i.right,
            }),
            _ => None,
        };
        if let Some(join) = join {
            column.join = Some(self.query.add_join(join));
        }
        column
    }

    fn select(&mut self, expr: &Expr) -> CoreResult<Arg> {
        self.query.explicit_select = true;
        for arg in &expr.args {
            let Node::Expr(e) = arg else {
                return Err(invalid(expr));
            };
            let (name, node) = match e.as_kwarg() {
                Some((alias, value)) => (alias.to_string(), value),
                None => (
                    e.bound_name()
                        .map_or_else(|| unparse_expr(e), str::to_string),
                    arg,
                ),
            };
            let column = self.column(node)?;
            let column = self.output_column(column);
            self.query.select.push(Selected { name, column });
        }
        Ok(Arg::Done)
    }

    fn default_select(&mut self) {
        let manifest = self.env.manifest;
        let props: Vec<&Property> = manifest
            .top_properties(self.env.model.id)
            .filter(|p| !p.hidden && self.readable(p))
            .collect();
        for prop in props {
            let column = self.output_column(Column::of(prop));
            self.query.select.push(Selected {
                name: prop.name.clone(),
                column,
            });
        }
    }

    fn sort(&mut self, expr: &Expr) -> CoreResult<Arg> {
        for arg in &expr.args {
            let (descending, node) = match arg {
                Node::Expr(e) if e.name == "negative" && e.args.len() == 1 => (true, &e.args[0]),
                Node::Expr(e) if e.name == "positive" && e.args.len() == 1 => (false, &e.args[0]),
                other => (false, other),
            };
            let column = self.column(node)?;
            self.query.sort.push(SortKey { column, descending });
        }
        Ok(Arg::Done)
    }

    fn page(&mut self, expr: &Expr) -> CoreResult<Arg> {
        let (positional, keywords) = expr.split_args();
        let cursor = match positional.as_slice() {
            [] => None,
            [Node::Literal(Literal::String(s))] => Some(s.clone()),
            _ => return Err(invalid(expr)),
        };
        let mut size = None;
        let mut keys = Vec::new();
        for (key, value) in keywords {
            match key {
                "size" => size = Some(literal_count(expr, value)?),
                "key" => keys.push(self.column(value)?),
                _ => return Err(invalid(expr)),
            }
        }
        let size = size.ok_or_else(|| invalid(expr))?;
        self.page = Some(PageArgs { size, cursor, keys });
        Ok(Arg::Done)
    }

    fn any(&mut self, expr: &Expr) -> CoreResult<Arg> {
        let [op, path, values @ ..] = expr.args.as_slice() else {
            return Err(invalid(expr));
        };
        let op = match op {
            Node::Literal(Literal::String(s)) => s.clone(),
            Node::Expr(e) => e.bound_name().ok_or_else(|| invalid(expr))?.to_string(),
            Node::Literal(_) => return Err(invalid(expr)),
        };
        let path = self.eval(path)?;
        let mut conds = Vec::with_capacity(values.len());
        for value in values {
            let value = self.eval(value)?;
            match self.call(&op, vec![path.clone(), value])? {
                Arg::Cond(cond) => conds.push(cond),
                _ => return Err(invalid(expr)),
            }
        }
        Ok(Arg::Cond(Cond::Or(conds)))
    }

    fn recurse(&mut self, expr: &Expr) -> CoreResult<Arg> {
        let [Node::Expr(e)] = expr.args.as_slice() else {
            return Err(invalid(expr));
        };
        let name = e.bound_name().ok_or_else(|| invalid(expr))?;
        let manifest = self.env.manifest;
        let mut columns = Vec::new();
        for (place, id) in &self.env.model.flat {
            let under_prefix = place.starts_with(&self.prefix);
            if under_prefix && place.rsplit('.').next() == Some(name) {
                let prop = manifest.property(*id);
                self.check_access(prop)?;
                columns.push(Column::of(prop));
            }
        }
        if columns.is_empty() {
            return Err(self.not_found(name));
        }
        Ok(Arg::Columns(columns))
    }

    fn finish(mut self) -> CoreResult<Query> {
        if !self.query.explicit_select {
            self.default_select();
        }
        if let Some(args) = self.page.take() {
            let manifest = self.env.manifest;
            let mut keys: Vec<SortKey> = self.query.sort.clone();
            keys.extend(args.keys.into_iter().map(|column| SortKey {
                column,
                descending: false,
            }));
            for id in &self.env.model.pkeys {
                keys.push(SortKey {
                    column: Column::of(manifest.property(*id)),
                    descending: false,
                });
            }
            let mut seen = std::collections::HashSet::new();
            keys.retain(|k| seen.insert(k.column.place.clone()));

            let min = keys.len() + 1;
            if args.size < min {
                return Err(ErrorKind::TooShortPageSize
                    .err()
                    .model(&self.env.model.name)
                    .with("size", args.size)
                    .with("min", min)
                    .into());
            }
            let after = match args.cursor {
                Some(cursor) => {
                    let values = decode_cursor(&cursor)?;
                    if values.len() != keys.len() {
                        return Err(ErrorKind::InvalidValue
                            .err()
                            .model(&self.env.model.name)
                            .with("value", cursor)
                            .with("expected", format!("{} page key values", keys.len()))
                            .into());
                    }
                    self.filters.push(Cond::After {
                        keys: keys.clone(),
                        values: values.clone(),
                    });
                    Some(values)
                }
                None => None,
            };
            self.query.page = Some(Page {
                size: args.size,
                keys,
                after,
            });
        }
        self.query.filter = Cond::all(self.filters);
        Ok(self.query)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Caller;
    use crate::config::{BackendKind, Config};
    use crate::manifest::load::load_yaml_str;
    use crate::manifest::Manifest;
    use crate::types::Action;
    use crate::ufunc::{builtins, encode_cursor, CmpOp, FuncRegistry};
    use serde_json::json;
    use std::collections::BTreeMap;

    const DOCS: &str = r"
type: model
name: City
properties:
  name: {type: string}
  population: {type: integer}
---
type: model
name: report
properties:
  status: {type: string}
  count: {type: integer}
  valid: {type: boolean}
  secret: {type: string, hidden: true}
  private: {type: string, access: private}
  founded: {type: date}
  city: {type: ref, model: City}
  capital: {type: ref, model: City, level: 4}
  notes:
    type: array
    items:
      type: object
      properties:
        note: {type: string}
  meta:
    type: object
    properties:
      note: {type: string}
";

    struct Fixture {
        manifest: Manifest,
        funcs: FuncRegistry,
        params: BTreeMap<String, Value>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                manifest: load_yaml_str(DOCS).unwrap(),
                funcs: builtins().unwrap(),
                params: BTreeMap::new(),
            }
        }

        fn resolve_as(&self, source: &str, caller: Option<&Caller>) -> CoreResult<Query> {
            let env = Env {
                manifest: &self.manifest,
                model: self.manifest.model_by_name("report").unwrap(),
                family: BackendKind::Memory,
                caller,
                action: Action::Search,
                funcs: &self.funcs,
                params: &self.params,
            };
            let node = datagate_expr::parse(source).unwrap();
            resolve_query(&env, Some(&node))
        }

        fn resolve(&self, source: &str) -> CoreResult<Query> {
            self.resolve_as(source, None)
        }
    }

    fn names(q: &Query) -> Vec<&str> {
        q.select.iter().map(|s| s.name.as_str()).collect()
    }

    #[test]
    fn conditions_and_statements() {
        let f = Fixture::new();
        let q = f
            .resolve(r#"status="ok"&count>10&select(status,count)&sort(-count)&limit(20)"#)
            .unwrap();
        assert_eq!(names(&q), vec!["status", "count"]);
        assert_eq!(q.limit, Some(20));
        assert!(q.sort[0].descending);
        let Some(Cond::And(conds)) = &q.filter else {
            panic!("expected and, got {:?}", q.filter);
        };
        assert!(matches!(
            &conds[1],
            Cond::Compare { op: CmpOp::Gt, value, .. } if *value == json!(10)
        ));
    }

    #[test]
    fn default_select_skips_hidden_properties() {
        let f = Fixture::new();
        let q = f.resolve("count>1").unwrap();
        let selected = names(&q);
        assert!(selected.contains(&"_id"));
        assert!(selected.contains(&"notes"));
        assert!(!selected.contains(&"secret"));
        assert!(!selected.contains(&"_op"));

        let q = f.resolve("select(secret)").unwrap();
        assert_eq!(names(&q), vec!["secret"]);
    }

    #[test]
    fn unknown_properties_fail_at_resolve_time() {
        let f = Fixture::new();
        let err = f.resolve(r#"colour="red""#).unwrap_err();
        assert_eq!(err.code(), "PropertyNotFound");
        assert_eq!(err.context()["property"], "colour");
        assert_eq!(f.resolve("select(colour)").unwrap_err().code(), "PropertyNotFound");
    }

    #[test]
    fn type_checked_operators() {
        let f = Fixture::new();
        assert_eq!(f.resolve(r#"status>"a""#).unwrap_err().code(), "InvalidValue");
        assert_eq!(f.resolve(r#"count.contains("1")"#).unwrap_err().code(), "InvalidValue");
        assert!(f.resolve(r#"status.contains("o")"#).is_ok());
        assert!(f.resolve(r#"founded>"2020-01-01""#).is_ok());
        assert_eq!(f.resolve("count.lower()").unwrap_err().code(), "UnknownMethod");
        assert_eq!(f.resolve(r#"count="many""#).unwrap_err().code(), "InvalidValue");
    }

    #[test]
    fn recurse_expands_to_every_matching_place() {
        let f = Fixture::new();
        let q = f.resolve(r#"recurse(note)="foo bar""#).unwrap();
        let Some(Cond::Or(branches)) = &q.filter else {
            panic!("expected or, got {:?}", q.filter);
        };
        let places: Vec<&str> = branches
            .iter()
            .map(|c| match c {
                Cond::Compare { column, .. } => column.place.as_str(),
                _ => "",
            })
            .collect();
        assert_eq!(places, vec!["meta.note", "notes.note"]);
        assert_eq!(f.resolve("recurse(nothing)=1").unwrap_err().code(), "PropertyNotFound");
    }

    #[test]
    fn any_expands_to_or() {
        let f = Fixture::new();
        let q = f.resolve(r#"any("eq", status, "ok", "failed")"#).unwrap();
        assert!(matches!(&q.filter, Some(Cond::Or(b)) if b.len() == 2));
        let q = f.resolve("any(gt, count, 1, 2, 3)").unwrap();
        assert!(matches!(&q.filter, Some(Cond::Or(b)) if b.len() == 3));
    }

    #[test]
    fn filter_scopes_names_to_the_receiver() {
        let f = Fixture::new();
        let q = f.resolve(r#"notes[note="x"]"#).unwrap();
        assert!(matches!(
            &q.filter,
            Some(Cond::Compare { column, .. }) if column.place == "notes.note"
        ));
    }

    #[test]
    fn refs_join_only_when_needed() {
        let f = Fixture::new();
        let q = f.resolve(r#"city.name="Vilnius""#).unwrap();
        assert_eq!(q.joins.len(), 2, "city for the filter, capital for output");
        let q = f.resolve(r#"city._id="abc"&select(city)"#).unwrap();
        assert!(q.joins.is_empty());
        let q = f.resolve(r#"city="abc"&select(capital)"#).unwrap();
        assert_eq!(q.joins.len(), 1);
        assert_eq!(q.select[0].column.join, Some(0));
        assert!(matches!(
            &q.filter,
            Some(Cond::Compare { column, .. }) if column.place == "city._id"
        ));
    }

    #[test]
    fn keyset_paging() {
        let f = Fixture::new();
        let q = f.resolve("page(size:6)&sort(count)").unwrap();
        let page = q.page.as_ref().unwrap();
        let keys: Vec<&str> = page.keys.iter().map(|k| k.column.place.as_str()).collect();
        assert_eq!(keys, vec!["count", "_id"]);
        assert_eq!(q.row_limit(), Some(6));

        let cursor = encode_cursor(&[json!(5), json!("x")]);
        let q = f
            .resolve(&format!(r#"sort(count)&page("{cursor}", size:6)"#))
            .unwrap();
        assert!(matches!(&q.filter, Some(Cond::After { values, .. }) if values.len() == 2));

        let err = f.resolve("sort(count)&page(size:2)").unwrap_err();
        assert_eq!(err.code(), "TooShortPageSize");
        assert_eq!(err.context()["min"], 3);

        let short = encode_cursor(&[json!(5)]);
        assert_eq!(
            f.resolve(&format!(r#"sort(count)&page("{short}", size:6)"#))
                .unwrap_err()
                .code(),
            "InvalidValue"
        );
    }

    #[test]
    fn casts_and_params() {
        let mut f = Fixture::new();
        f.params.insert("limit".into(), json!(7));
        let q = f.resolve(r#"count=cast(integer, "12")"#).unwrap();
        assert!(matches!(&q.filter, Some(Cond::Compare { value, .. }) if *value == json!(12)));
        assert_eq!(
            f.resolve(r#"count=cast(integer, "1.5")"#).unwrap_err().code(),
            "UnableToCast"
        );
        let q = f.resolve("count=param(limit)").unwrap();
        assert!(matches!(&q.filter, Some(Cond::Compare { value, .. }) if *value == json!(7)));
        assert!(f.resolve("count=param(other)").is_err());
        assert!(f.resolve("count=-5").is_ok());
    }

    #[test]
    fn boolean_columns_are_conditions() {
        let f = Fixture::new();
        let q = f.resolve("valid&!valid").unwrap();
        let Some(Cond::And(conds)) = &q.filter else {
            panic!("expected and");
        };
        assert!(matches!(&conds[1], Cond::Not(_)));
    }

    #[test]
    fn scopes_limit_what_can_be_selected() {
        let f = Fixture::new();
        let cfg = Config::new();
        let reader = Caller::new("reader", vec!["datagate_search".to_string()], &cfg);
        let q = f.resolve_as("count>1", Some(&reader)).unwrap();
        assert!(!names(&q).contains(&"private"));
        let err = f.resolve_as("select(private)", Some(&reader)).unwrap_err();
        assert_eq!(err.code(), "InsufficientScope");
    }

    #[test]
    fn count_and_distinct() {
        let f = Fixture::new();
        let q = f.resolve("count()").unwrap();
        assert!(q.count);
        let q = f.resolve("select(status)&distinct()").unwrap();
        assert!(q.distinct);
    }
}
