//! Document store backend.
//!
//! Each model is a collection of JSON documents shaped like stored rows.
//! Filters compile to query documents using the usual operator vocabulary
//! (`$eq`, `$ne`, `$lt`, `$regex`, `$and`, `$or`, `$nor`); dotted paths
//! reach into nested objects and arrays natively. Joins are resolved after
//! the read with extra lookups by `_id`.

use super::eval::{apply_joins, run_query};
use super::{backend_models, same_backend, Backend, PendingWrite, RowStream, Transaction};
use crate::changes::ChangeEntry;
use crate::config::BackendKind;
use crate::dtype::DType;
use crate::error::{CoreError, CoreResult};
use crate::manifest::{Manifest, Model};
use crate::migration::{plan_migration, SchemaAction, SchemaSnapshot, TableSchema};
use crate::types::{ModelId, Row};
use crate::ufunc::{CmpOp, Column, ColumnFunc, Cond, Query, SortKey};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

const SCHEMA_COLLECTION: &str = "_schema";
const MANIFEST_COLLECTION: &str = "_manifest";

/// A compiled read.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentPlan {
    /// Collection name.
    pub collection: String,
    /// Query document.
    pub filter: Value,
    /// Sort fields with `1` or `-1`.
    pub sort: Vec<(String, i8)>,
    /// Documents to skip.
    pub skip: Option<usize>,
    /// Maximum documents.
    pub limit: Option<usize>,
}

/// A write sent to the document store.
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentOp {
    /// Insert a document.
    Insert {
        /// Collection name.
        collection: String,
        /// Document with `_id`.
        doc: Row,
    },
    /// Insert or replace a document by `_id`.
    Save {
        /// Collection name.
        collection: String,
        /// Document with `_id`.
        doc: Row,
    },
    /// Set fields of a document.
    Set {
        /// Collection name.
        collection: String,
        /// Document id.
        id: String,
        /// Fields to set.
        fields: Row,
    },
    /// Remove a field from every document.
    Unset {
        /// Collection name.
        collection: String,
        /// Field name.
        field: String,
    },
    /// Delete a document.
    Delete {
        /// Collection name.
        collection: String,
        /// Document id.
        id: String,
    },
    /// Delete every document.
    Clear {
        /// Collection name.
        collection: String,
    },
    /// Drop a collection.
    Drop {
        /// Collection name.
        collection: String,
    },
}

/// Connection to a document store.
pub trait DocumentClient: Send + Sync {
    /// Whether the store answers.
    fn ping(&self) -> bool;

    /// Runs a read.
    ///
    /// # Errors
    ///
    /// Returns client failures.
    fn find(&self, plan: &DocumentPlan) -> CoreResult<Vec<Row>>;

    /// Counts documents matching a query document.
    ///
    /// # Errors
    ///
    /// Returns client failures.
    fn count(&self, collection: &str, filter: &Value) -> CoreResult<u64>;

    /// Applies writes in one session transaction.
    ///
    /// # Errors
    ///
    /// Returns client failures; nothing is applied then.
    fn write(&self, ops: &[DocumentOp]) -> CoreResult<()>;
}

fn changelog(model: &str) -> String {
    format!("{model}/:changelog")
}

fn escape_regex(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if "\\^$.|?*+()[]{}".contains(c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn cmp_op(op: CmpOp) -> &'static str {
    match op {
        CmpOp::Eq => "$eq",
        CmpOp::Ne => "$ne",
        CmpOp::Lt => "$lt",
        CmpOp::Le => "$lte",
        CmpOp::Gt => "$gt",
        CmpOp::Ge => "$gte",
    }
}

struct Compiler<'a> {
    manifest: &'a Manifest,
    backend: &'a str,
}

impl Compiler<'_> {
    fn path(&self, column: &Column) -> CoreResult<String> {
        if column.join.is_some() {
            return Err(CoreError::backend(
                self.backend,
                format!("filtering on joined place {} is not supported", column.place),
            ));
        }
        if column.funcs.contains(&ColumnFunc::Flip) {
            return Err(CoreError::backend(self.backend, "flip() is not supported"));
        }
        Ok(column.place.clone())
    }

    fn folds_case(column: &Column) -> bool {
        column
            .funcs
            .iter()
            .any(|f| matches!(f, ColumnFunc::Lower | ColumnFunc::Upper))
    }

    fn encode(&self, column: &Column, value: &Value) -> Value {
        self.manifest
            .property(column.prop)
            .dtype
            .encode(self.manifest, BackendKind::Document, value)
    }

    fn compare(&self, column: &Column, op: CmpOp, value: &Value) -> CoreResult<Value> {
        let path = self.path(column)?;
        if Self::folds_case(column) {
            if let Value::String(text) = value {
                let regex = json!({"$regex": format!("^{}$", escape_regex(text)), "$options": "i"});
                return Ok(match op {
                    CmpOp::Eq => json!({ path: regex }),
                    CmpOp::Ne => json!({ path: {"$not": regex} }),
                    _ => return Err(CoreError::backend(self.backend, "ordering on lower() or upper()")),
                });
            }
        }
        let value = self.encode(column, value);
        Ok(match op {
            CmpOp::Eq => json!({ path: value }),
            other => json!({ path: { cmp_op(other): value } }),
        })
    }

    fn regex(&self, column: &Column, pattern: String) -> CoreResult<Value> {
        let path = self.path(column)?;
        let mut regex = json!({ "$regex": pattern });
        if Self::folds_case(column) {
            regex["$options"] = json!("i");
        }
        Ok(json!({ path: regex }))
    }

    fn after(&self, keys: &[SortKey], values: &[Value]) -> CoreResult<Value> {
        let mut branches = Vec::new();
        for (i, (key, value)) in keys.iter().zip(values).enumerate() {
            let mut parts = Vec::new();
            for (prev, prev_value) in keys[..i].iter().zip(values) {
                let prev_path = self.path(&prev.column)?;
                parts.push(json!({ prev_path: self.encode(&prev.column, prev_value) }));
            }
            let path = self.path(&key.column)?;
            let last = match (key.descending, value) {
                (false, Value::Null) => json!({ path: {"$ne": null} }),
                (false, v) => json!({ path: {"$gt": self.encode(&key.column, v)} }),
                (true, Value::Null) => continue,
                (true, v) => json!({"$or": [
                    { path.clone(): {"$lt": self.encode(&key.column, v)} },
                    { path: null },
                ]}),
            };
            parts.push(last);
            branches.push(json!({ "$and": parts }));
        }
        Ok(if branches.is_empty() {
            json!({"_id": {"$exists": false}})
        } else {
            json!({ "$or": branches })
        })
    }

    fn cond(&self, cond: &Cond) -> CoreResult<Value> {
        let all = |conds: &[Cond]| conds.iter().map(|c| self.cond(c)).collect::<CoreResult<Vec<_>>>();
        Ok(match cond {
            Cond::And(conds) => json!({ "$and": all(conds)? }),
            Cond::Or(conds) => json!({ "$or": all(conds)? }),
            Cond::Not(inner) => json!({ "$nor": [self.cond(inner)?] }),
            Cond::Compare { column, op, value } => self.compare(column, *op, value)?,
            Cond::Contains { column, value } => self.regex(column, escape_regex(value))?,
            Cond::StartsWith { column, value } => {
                self.regex(column, format!("^{}", escape_regex(value)))?
            }
            Cond::After { keys, values } => self.after(keys, values)?,
        })
    }
}

/// Compiles a read. Joins are not part of the plan.
///
/// # Errors
///
/// Fails for filters on joined places and for `flip()`.
pub fn compile_find(manifest: &Manifest, query: &Query, backend: &str) -> CoreResult<DocumentPlan> {
    let compiler = Compiler { manifest, backend };
    let filter = match &query.filter {
        Some(cond) => compiler.cond(cond)?,
        None => json!({}),
    };
    let sort = query
        .ordering()
        .iter()
        .map(|k| Ok((compiler.path(&k.column)?, if k.descending { -1 } else { 1 })))
        .collect::<CoreResult<Vec<_>>>()?;
    let local = query.distinct;
    Ok(DocumentPlan {
        collection: manifest.model(query.model).name.clone(),
        filter,
        sort,
        skip: if local { None } else { query.offset },
        limit: if local { None } else { query.row_limit() },
    })
}

/// Operations applying one staged write. Change entries need their
/// number assigned first.
#[must_use]
pub fn compile_write(manifest: &Manifest, write: &PendingWrite) -> Vec<DocumentOp> {
    let encode_row = |model: &str, row: &Row| -> Row {
        let Some(model) = manifest.find_model(model) else {
            return row.clone();
        };
        row.iter()
            .map(|(k, v)| {
                let v = manifest
                    .find_property(model.id, k)
                    .map_or_else(|| v.clone(), |p| p.dtype.encode(manifest, BackendKind::Document, v));
                (k.clone(), v)
            })
            .collect()
    };
    match write {
        PendingWrite::Insert { model, row } => vec![DocumentOp::Insert {
            collection: model.clone(),
            doc: encode_row(model, row),
        }],
        PendingWrite::Update { model, row, .. } => vec![DocumentOp::Save {
            collection: model.clone(),
            doc: encode_row(model, row),
        }],
        PendingWrite::Patch { model, id, patch, .. } => vec![DocumentOp::Set {
            collection: model.clone(),
            id: id.clone(),
            fields: encode_row(model, patch),
        }],
        PendingWrite::Delete { model, id, .. } => vec![DocumentOp::Delete {
            collection: model.clone(),
            id: id.clone(),
        }],
        PendingWrite::Wipe { model } => vec![
            DocumentOp::Clear {
                collection: model.clone(),
            },
            DocumentOp::Clear {
                collection: changelog(model),
            },
        ],
        PendingWrite::Change { model, entry } => {
            let mut doc = entry.to_row();
            doc.insert("_rid".into(), Value::from(entry.id.as_str()));
            doc.insert("_id".into(), Value::from(entry.change));
            vec![DocumentOp::Insert {
                collection: changelog(model),
                doc,
            }]
        }
    }
}

/// Backend over a document store client.
pub struct DocumentBackend {
    name: String,
    client: Arc<dyn DocumentClient>,
}

impl DocumentBackend {
    /// Wraps a client.
    #[must_use]
    pub fn new(name: &str, client: Arc<dyn DocumentClient>) -> Self {
        Self {
            name: name.to_string(),
            client,
        }
    }

    fn find_all(&self, collection: &str) -> CoreResult<Vec<Row>> {
        self.client.find(&DocumentPlan {
            collection: collection.to_string(),
            filter: json!({}),
            sort: Vec::new(),
            skip: None,
            limit: None,
        })
    }

    fn decode(&self, manifest: &Manifest, model: &Model, mut row: Row) -> CoreResult<Row> {
        for prop in manifest.top_properties(model.id) {
            if let Some(value) = row.get_mut(&prop.name) {
                if !matches!(prop.dtype, DType::Ref(_)) {
                    *value = prop.dtype.decode(manifest, BackendKind::Document, value)?;
                }
            }
        }
        Ok(row)
    }

    fn last_change(&self, model: &str) -> CoreResult<u64> {
        let last = self.client.find(&DocumentPlan {
            collection: changelog(model),
            filter: json!({}),
            sort: vec![("_change".into(), -1)],
            skip: None,
            limit: Some(1),
        })?;
        Ok(last
            .first()
            .and_then(|r| r.get("_change"))
            .and_then(Value::as_u64)
            .unwrap_or(0))
    }

    fn schema_ops(action: &SchemaAction, snapshot: &mut SchemaSnapshot) -> Vec<DocumentOp> {
        let table = action.table().to_string();
        let mut ops = Vec::new();
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
                ops.push(DocumentOp::Unset {
                    collection: table.clone(),
                    field: column.clone(),
                });
            }
            SchemaAction::DropTable { .. } => {
                snapshot.remove(&table);
                ops.push(DocumentOp::Drop {
                    collection: table.clone(),
                });
                ops.push(DocumentOp::Drop {
                    collection: changelog(&table),
                });
                ops.push(DocumentOp::Delete {
                    collection: SCHEMA_COLLECTION.into(),
                    id: table,
                });
                return ops;
            }
        }
        if let Some(schema) = snapshot.get(&table) {
            let mut doc = Row::new();
            doc.insert("_id".into(), Value::from(table.as_str()));
            doc.insert("schema".into(), serde_json::to_value(schema).unwrap_or(Value::Null));
            ops.push(DocumentOp::Save {
                collection: SCHEMA_COLLECTION.into(),
                doc,
            });
        }
        ops
    }
}

impl Backend for DocumentBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn family(&self) -> BackendKind {
        BackendKind::Document
    }

    fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.client.ping() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(200));
        }
    }

    fn bootstrap(&self, manifest: &Manifest) -> CoreResult<()> {
        let current = self.schema()?;
        let creates: Vec<SchemaAction> = plan_migration(manifest, backend_models(manifest, &self.name), &current)
            .into_iter()
            .filter(|a| matches!(a, SchemaAction::CreateTable { .. }))
            .collect();
        self.migrate(manifest, &creates)
    }

    fn schema(&self) -> CoreResult<SchemaSnapshot> {
        self.find_all(SCHEMA_COLLECTION)?
            .into_iter()
            .map(|doc| {
                let schema: TableSchema =
                    serde_json::from_value(doc.get("schema").cloned().unwrap_or(Value::Null))?;
                Ok((schema.name.clone(), schema))
            })
            .collect()
    }

    fn migrate(&self, _manifest: &Manifest, actions: &[SchemaAction]) -> CoreResult<()> {
        if actions.is_empty() {
            return Ok(());
        }
        let mut snapshot = self.schema()?;
        let ops: Vec<DocumentOp> = actions
            .iter()
            .flat_map(|a| Self::schema_ops(a, &mut snapshot))
            .collect();
        self.client.write(&ops)
    }

    fn load_manifest_docs(&self) -> CoreResult<Vec<Value>> {
        let mut docs = self.find_all(MANIFEST_COLLECTION)?;
        docs.sort_by_key(|d| d.get("_id").and_then(Value::as_u64).unwrap_or(0));
        Ok(docs.into_iter().filter_map(|mut d| d.remove("doc")).collect())
    }

    fn save_manifest_docs(&self, docs: &[Value]) -> CoreResult<()> {
        let mut ops = vec![DocumentOp::Clear {
            collection: MANIFEST_COLLECTION.into(),
        }];
        for (idx, doc) in docs.iter().enumerate() {
            let mut row = Row::new();
            row.insert("_id".into(), Value::from(idx));
            row.insert("doc".into(), doc.clone());
            ops.push(DocumentOp::Insert {
                collection: MANIFEST_COLLECTION.into(),
                doc: row,
            });
        }
        self.client.write(&ops)
    }

    fn execute(&self, manifest: &Manifest, query: &Query, txn: &Transaction) -> CoreResult<RowStream> {
        let model = manifest.model(query.model);
        if txn.pending().iter().any(|w| w.model() == model.name) {
            debug!(backend = %self.name, model = %model.name, "evaluating over staged writes");
            let mut fetch = |id: ModelId| -> CoreResult<Vec<Row>> {
                let joined = same_backend(manifest, &self.name, id)?;
                let committed = self
                    .find_all(&joined.name)?
                    .into_iter()
                    .map(|doc| self.decode(manifest, joined, doc))
                    .collect::<CoreResult<Vec<_>>>()?;
                Ok(txn.overlay(&joined.name, committed))
            };
            let rows = fetch(model.id)?;
            let rows = run_query(manifest, query, rows, &mut fetch)?;
            return Ok(Box::new(rows.into_iter().map(Ok)));
        }
        let plan = compile_find(manifest, query, &self.name)?;
        debug!(backend = %self.name, collection = %plan.collection, filter = %plan.filter, "find");
        if query.count && !query.distinct {
            let count = self.client.count(&plan.collection, &plan.filter)?;
            let mut row = Row::new();
            row.insert("count".into(), Value::from(count));
            return Ok(Box::new(std::iter::once(Ok(row))));
        }
        let mut rows = self
            .client
            .find(&plan)?
            .into_iter()
            .map(|doc| self.decode(manifest, model, doc))
            .collect::<CoreResult<Vec<_>>>()?;
        let mut fetch = |id: ModelId| -> CoreResult<Vec<Row>> {
            let joined = same_backend(manifest, &self.name, id)?;
            self.find_all(&joined.name)?
                .into_iter()
                .map(|doc| self.decode(manifest, joined, doc))
                .collect()
        };
        if query.distinct {
            let mut local = query.clone();
            local.filter = None;
            rows = run_query(manifest, &local, rows, &mut fetch)?;
        } else {
            apply_joins(manifest, &query.joins, &mut rows, &mut fetch)?;
        }
        Ok(Box::new(rows.into_iter().map(Ok)))
    }

    fn fetch(&self, manifest: &Manifest, model: &Model, id: &str) -> CoreResult<Option<Row>> {
        let found = self.client.find(&DocumentPlan {
            collection: model.name.clone(),
            filter: json!({"_id": id}),
            sort: Vec::new(),
            skip: None,
            limit: Some(1),
        })?;
        found
            .into_iter()
            .next()
            .map(|doc| self.decode(manifest, model, doc))
            .transpose()
    }

    fn changes(&self, model: &Model, offset: i64, limit: Option<usize>) -> CoreResult<Vec<ChangeEntry>> {
        let collection = changelog(&model.name);
        let docs = if offset < 0 {
            let take = usize::try_from(offset.unsigned_abs()).unwrap_or(usize::MAX);
            let mut docs = self.client.find(&DocumentPlan {
                collection,
                filter: json!({}),
                sort: vec![("_change".into(), -1)],
                skip: None,
                limit: Some(take),
            })?;
            docs.reverse();
            if let Some(limit) = limit {
                docs.truncate(limit);
            }
            docs
        } else {
            self.client.find(&DocumentPlan {
                collection,
                filter: json!({"_change": {"$gte": offset}}),
                sort: vec![("_change".into(), 1)],
                skip: None,
                limit,
            })?
        };
        docs.into_iter()
            .map(|mut doc| {
                if let Some(rid) = doc.remove("_rid") {
                    doc.insert("_id".into(), rid);
                }
                Ok(serde_json::from_value(Value::Object(doc))?)
            })
            .collect()
    }

    fn commit(&self, manifest: &Manifest, txn: &mut Transaction) -> CoreResult<()> {
        txn.ensure_active()?;
        let mut counters: HashMap<String, u64> = HashMap::new();
        let mut ops = Vec::new();
        for write in txn.pending() {
            let write = match write {
                PendingWrite::Change { model, entry } => {
                    if !counters.contains_key(model) {
                        let last = self.last_change(model)?;
                        counters.insert(model.clone(), last);
                    }
                    let counter = counters.entry(model.clone()).or_insert(0);
                    *counter += 1;
                    PendingWrite::Change {
                        model: model.clone(),
                        entry: ChangeEntry {
                            change: *counter,
                            ..entry.clone()
                        },
                    }
                }
                other => other.clone(),
            };
            ops.extend(compile_write(manifest, &write));
        }
        if !ops.is_empty() {
            self.client.write(&ops)?;
        }
        txn.take_writes();
        txn.mark_committed();
        debug!(backend = %self.name, txn = %txn.id(), ops = ops.len(), "transaction committed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::load::load_yaml_str;
    use crate::types::Action;
    use crate::ufunc::{builtins, resolve_query, Env};
    use parking_lot::Mutex;
    use std::collections::BTreeMap;

    const DOCS: &str = r"
type: model
name: City
properties:
  name: {type: string}
  founded: {type: date}
  population: {type: integer}
";

    #[derive(Default)]
    struct Recorder {
        ops: Mutex<Vec<DocumentOp>>,
    }

    impl DocumentClient for Recorder {
        fn ping(&self) -> bool {
            true
        }

        fn find(&self, _plan: &DocumentPlan) -> CoreResult<Vec<Row>> {
            Ok(Vec::new())
        }

        fn count(&self, _collection: &str, _filter: &Value) -> CoreResult<u64> {
            Ok(0)
        }

        fn write(&self, ops: &[DocumentOp]) -> CoreResult<()> {
            self.ops.lock().extend_from_slice(ops);
            Ok(())
        }
    }

    fn compile(source: &str) -> DocumentPlan {
        let manifest = load_yaml_str(DOCS).unwrap();
        let funcs = builtins().unwrap();
        let params = BTreeMap::new();
        let env = Env {
            manifest: &manifest,
            model: manifest.model_by_name("City").unwrap(),
            family: BackendKind::Document,
            caller: None,
            action: Action::Search,
            funcs: &funcs,
            params: &params,
        };
        let node = datagate_expr::parse(source).unwrap();
        let query = resolve_query(&env, Some(&node)).unwrap();
        compile_find(&manifest, &query, "docs").unwrap()
    }

    #[test]
    fn filters_compile_to_query_documents() {
        let plan = compile("name=\"Vilnius\"&population>100&sort(-population)");
        assert_eq!(
            plan.filter,
            json!({"$and": [{"name": "Vilnius"}, {"population": {"$gt": 100}}]})
        );
        assert_eq!(plan.sort, vec![("population".to_string(), -1)]);
    }

    #[test]
    fn dates_are_wrapped_and_text_uses_regex() {
        let plan = compile("founded=\"1323-01-25\"");
        assert_eq!(plan.filter, json!({"founded": {"$date": "1323-01-25T00:00:00Z"}}));
        let plan = compile("name.contains(\"a.b\")");
        assert_eq!(plan.filter, json!({"name": {"$regex": "a\\.b"}}));
        let plan = compile("lower(name)=\"vilnius\"");
        assert_eq!(plan.filter, json!({"name": {"$regex": "^vilnius$", "$options": "i"}}));
    }

    #[test]
    fn negation_uses_nor() {
        let plan = compile("not(name=\"Vilnius\")");
        assert_eq!(plan.filter, json!({"$nor": [{"name": "Vilnius"}]}));
    }

    #[test]
    fn commit_numbers_changes_after_the_last_one() {
        let manifest = load_yaml_str(DOCS).unwrap();
        let client = Arc::new(Recorder::default());
        let backend = DocumentBackend::new("docs", Arc::clone(&client) as Arc<dyn DocumentClient>);
        let city = manifest.model_by_name("City").unwrap();
        let mut txn = backend.begin(true).unwrap();
        let row = json!({"_id": "c1", "name": "Vilnius"}).as_object().cloned().unwrap();
        let rev = backend.insert(city, row.clone(), &mut txn).unwrap();
        let entry = ChangeEntry::new(txn.id(), rev, "c1", Action::Insert, row);
        backend.append_change(city, entry, &mut txn).unwrap();
        backend.commit(&manifest, &mut txn).unwrap();
        let ops = client.ops.lock();
        assert_eq!(ops.len(), 2);
        match &ops[1] {
            DocumentOp::Insert { collection, doc } => {
                assert_eq!(collection, "City/:changelog");
                assert_eq!(doc["_change"], 1);
                assert_eq!(doc["_rid"], "c1");
            }
            other => panic!("unexpected op {other:?}"),
        }
    }
}
