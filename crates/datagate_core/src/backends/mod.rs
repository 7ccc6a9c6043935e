//! Storage backends.
//!
//! A [`Backend`] stores the rows and change log of the models assigned to
//! it. Reads take a resolved [`Query`] and return a lazy row stream; writes
//! are staged in a [`Transaction`] and applied at commit.
//!
//! Four families ship here:
//!
//! - [`memory`]: JSON rows behind a lock, the reference implementation
//! - [`sql`]: a compiler to parameterized SQL over a pluggable driver
//! - [`document`]: a compiler to filter documents over a pluggable client
//! - [`tabular`]: read-only external sources such as CSV files

pub mod document;
pub mod eval;
pub mod memory;
pub mod sql;
pub mod tabular;
pub mod txn;

use crate::changes::ChangeEntry;
use crate::config::BackendKind;
use crate::error::{CoreError, CoreResult, ErrorKind};
use crate::manifest::{Manifest, Model};
use crate::migration::{SchemaAction, SchemaSnapshot};
use crate::types::{new_row_id, Revision, Row};
use crate::ufunc::{CmpOp, Column, Cond, Query};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

pub use txn::{PendingWrite, RowSet, Transaction, TransactionState};

/// Rows produced by a read, pulled lazily.
pub type RowStream = Box<dyn Iterator<Item = CoreResult<Row>> + Send>;

/// Interface every storage backend implements.
///
/// Staging methods have default implementations that record a
/// [`PendingWrite`]; a backend only needs to apply them in
/// [`commit`](Backend::commit).
pub trait Backend: Send + Sync {
    /// Configured backend name.
    fn name(&self) -> &str;

    /// Backend family, selecting value codecs and query compilation.
    fn family(&self) -> BackendKind;

    /// Blocks until the backend is reachable or `timeout` elapses.
    fn wait(&self, timeout: Duration) -> bool;

    /// Whether the backend rejects writes.
    fn read_only(&self) -> bool {
        false
    }

    /// Creates storage for every model of this backend that has none.
    ///
    /// # Errors
    ///
    /// Returns backend failures.
    fn bootstrap(&self, manifest: &Manifest) -> CoreResult<()>;

    /// Current storage layout.
    ///
    /// # Errors
    ///
    /// Returns backend failures.
    fn schema(&self) -> CoreResult<SchemaSnapshot>;

    /// Applies schema actions in order.
    ///
    /// # Errors
    ///
    /// Returns backend failures.
    fn migrate(&self, manifest: &Manifest, actions: &[SchemaAction]) -> CoreResult<()>;

    /// Manifest documents stored in the backend.
    ///
    /// # Errors
    ///
    /// Fails when the backend cannot hold a manifest.
    fn load_manifest_docs(&self) -> CoreResult<Vec<Value>> {
        Err(CoreError::backend(self.name(), "backend does not store manifests"))
    }

    /// Replaces the manifest documents stored in the backend.
    ///
    /// # Errors
    ///
    /// Fails when the backend cannot hold a manifest.
    fn save_manifest_docs(&self, docs: &[Value]) -> CoreResult<()> {
        let _ = docs;
        Err(CoreError::backend(self.name(), "backend does not store manifests"))
    }

    /// Starts a transaction.
    ///
    /// # Errors
    ///
    /// Fails for write transactions on read-only backends.
    fn begin(&self, write: bool) -> CoreResult<Transaction> {
        if write && self.read_only() {
            return Err(CoreError::backend(self.name(), "backend is read-only"));
        }
        Ok(Transaction::new(self.name(), write))
    }

    /// Runs a query, seeing the transaction's own staged writes.
    ///
    /// # Errors
    ///
    /// Returns backend failures and queries the backend cannot express.
    fn execute(&self, manifest: &Manifest, query: &Query, txn: &Transaction) -> CoreResult<RowStream>;

    /// Reads one committed row by id, without the transaction overlay.
    ///
    /// # Errors
    ///
    /// Returns backend failures.
    fn fetch(&self, manifest: &Manifest, model: &Model, id: &str) -> CoreResult<Option<Row>>;

    /// Reads one row by id as the transaction sees it.
    ///
    /// # Errors
    ///
    /// `ItemDoesNotExist` when there is no such row.
    fn get_one(&self, manifest: &Manifest, model: &Model, id: &str, txn: &Transaction) -> CoreResult<Row> {
        let committed = self.fetch(manifest, model, id)?;
        txn.overlay_row(&model.name, id, committed).ok_or_else(|| {
            ErrorKind::ItemDoesNotExist
                .err()
                .model(&model.name)
                .with("id", id)
                .into()
        })
    }

    /// Rows whose values at the key's places equal the key's values.
    ///
    /// # Errors
    ///
    /// `PropertyNotFound` for unknown places, plus backend failures.
    fn find(&self, manifest: &Manifest, model: &Model, key: &Row, txn: &Transaction) -> CoreResult<Vec<Row>> {
        let query = key_query(manifest, model, key)?;
        self.execute(manifest, &query, txn)?.collect()
    }

    /// Stages a new row, assigning `_id` when missing and a fresh
    /// `_revision` unless one is given.
    ///
    /// # Errors
    ///
    /// Fails on finished or read-only transactions.
    fn insert(&self, model: &Model, mut row: Row, txn: &mut Transaction) -> CoreResult<Revision> {
        let revision = row
            .get("_revision")
            .and_then(Value::as_str)
            .map_or_else(Revision::generate, Revision::new);
        if !row.get("_id").is_some_and(Value::is_string) {
            row.insert("_id".into(), Value::from(new_row_id()));
        }
        row.insert("_revision".into(), Value::from(revision.as_str()));
        txn.stage(PendingWrite::Insert {
            model: model.name.clone(),
            row,
        })?;
        Ok(revision)
    }

    /// Stages a full replacement of the row with the same `_id`. With
    /// `expected`, commit fails unless the row still has that revision.
    ///
    /// # Errors
    ///
    /// Fails on finished or read-only transactions.
    fn update(
        &self,
        model: &Model,
        mut row: Row,
        expected: Option<&str>,
        txn: &mut Transaction,
    ) -> CoreResult<Revision> {
        let revision = Revision::generate();
        row.insert("_revision".into(), Value::from(revision.as_str()));
        txn.stage(PendingWrite::Update {
            model: model.name.clone(),
            row,
            expected: expected.map(str::to_string),
        })?;
        Ok(revision)
    }

    /// Stages a partial update, checked against `expected` like
    /// [`update`](Self::update).
    ///
    /// # Errors
    ///
    /// Fails on finished or read-only transactions.
    fn patch(
        &self,
        model: &Model,
        id: &str,
        mut patch: Row,
        expected: Option<&str>,
        txn: &mut Transaction,
    ) -> CoreResult<Revision> {
        let revision = Revision::generate();
        patch.insert("_revision".into(), Value::from(revision.as_str()));
        txn.stage(PendingWrite::Patch {
            model: model.name.clone(),
            id: id.to_string(),
            patch,
            expected: expected.map(str::to_string),
        })?;
        Ok(revision)
    }

    /// Stages a delete, checked against `expected` like
    /// [`update`](Self::update). The returned revision marks the delete in
    /// the change log.
    ///
    /// # Errors
    ///
    /// Fails on finished or read-only transactions.
    fn delete(
        &self,
        model: &Model,
        id: &str,
        expected: Option<&str>,
        txn: &mut Transaction,
    ) -> CoreResult<Revision> {
        txn.stage(PendingWrite::Delete {
            model: model.name.clone(),
            id: id.to_string(),
            expected: expected.map(str::to_string),
        })?;
        Ok(Revision::generate())
    }

    /// Stages removal of every row and change entry of a model.
    ///
    /// # Errors
    ///
    /// Fails on finished or read-only transactions.
    fn wipe(&self, model: &Model, txn: &mut Transaction) -> CoreResult<()> {
        txn.stage(PendingWrite::Wipe {
            model: model.name.clone(),
        })
    }

    /// Stages a change log entry.
    ///
    /// # Errors
    ///
    /// Fails on finished or read-only transactions.
    fn append_change(&self, model: &Model, entry: ChangeEntry, txn: &mut Transaction) -> CoreResult<()> {
        txn.stage(PendingWrite::Change {
            model: model.name.clone(),
            entry,
        })
    }

    /// Committed change entries of a model, selected by offset: entries
    /// numbered from `offset` on, or the last `-offset` entries.
    ///
    /// # Errors
    ///
    /// Returns backend failures.
    fn changes(&self, model: &Model, offset: i64, limit: Option<usize>) -> CoreResult<Vec<ChangeEntry>>;

    /// Applies the staged writes atomically and numbers change entries.
    ///
    /// # Errors
    ///
    /// Returns backend failures; nothing is applied then.
    fn commit(&self, manifest: &Manifest, txn: &mut Transaction) -> CoreResult<()>;

    /// Discards the staged writes.
    ///
    /// # Errors
    ///
    /// Fails when the transaction is already finished.
    fn rollback(&self, txn: &mut Transaction) -> CoreResult<()> {
        txn.ensure_active()?;
        txn.take_writes();
        txn.mark_aborted();
        Ok(())
    }
}

/// An active transaction bound to its backend. Dropping an active guard
/// rolls the transaction back.
pub struct TxnGuard {
    backend: Arc<dyn Backend>,
    txn: Transaction,
}

impl TxnGuard {
    /// Begins a transaction on `backend`.
    ///
    /// # Errors
    ///
    /// Propagates [`Backend::begin`] failures.
    pub fn begin(backend: Arc<dyn Backend>, write: bool) -> CoreResult<Self> {
        let txn = backend.begin(write)?;
        Ok(Self { backend, txn })
    }

    /// The backend.
    #[must_use]
    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    /// The transaction.
    #[must_use]
    pub fn txn(&self) -> &Transaction {
        &self.txn
    }

    /// The backend and the transaction, for staging writes.
    pub fn parts(&mut self) -> (&dyn Backend, &mut Transaction) {
        (self.backend.as_ref(), &mut self.txn)
    }

    /// Commits the transaction.
    ///
    /// # Errors
    ///
    /// Propagates [`Backend::commit`] failures; the transaction is rolled
    /// back on drop then.
    pub fn commit(mut self, manifest: &Manifest) -> CoreResult<()> {
        self.backend.commit(manifest, &mut self.txn)
    }
}

impl Drop for TxnGuard {
    fn drop(&mut self) {
        if self.txn.is_active() {
            if self.txn.write_count() > 0 {
                warn!(
                    backend = self.backend.name(),
                    txn = %self.txn.id(),
                    writes = self.txn.write_count(),
                    "rolling back unfinished transaction"
                );
            }
            if let Err(err) = self.backend.rollback(&mut self.txn) {
                warn!(backend = self.backend.name(), error = %err, "rollback failed");
            }
        }
    }
}

/// A query matching rows by key values. Ref values match on their `_id`.
///
/// # Errors
///
/// `PropertyNotFound` for places the model does not have.
pub fn key_query(manifest: &Manifest, model: &Model, key: &Row) -> CoreResult<Query> {
    let mut conds = Vec::new();
    for (place, value) in key {
        let prop = manifest.property_by_place(model.id, place)?;
        let (column, value) = match (&prop.dtype, value) {
            (crate::dtype::DType::Ref(r), Value::Object(map)) if map.contains_key("_id") => {
                let target = manifest.property_by_place(r.model, "_id")?;
                let column = Column {
                    prop: target.id,
                    place: format!("{place}._id"),
                    join: None,
                    funcs: Vec::new(),
                };
                (column, map.get("_id").cloned().unwrap_or(Value::Null))
            }
            _ => (Column::of(prop), value.clone()),
        };
        conds.push(Cond::Compare {
            column,
            op: CmpOp::Eq,
            value,
        });
    }
    let mut query = Query::all(model.id);
    query.filter = Cond::all(conds);
    Ok(query)
}

/// Models of a manifest stored in the named backend.
pub fn backend_models<'a>(manifest: &'a Manifest, backend: &'a str) -> impl Iterator<Item = &'a Model> + 'a {
    manifest.models().filter(move |m| m.backend == backend)
}

/// Checks that a joined model lives in the same backend.
pub(crate) fn same_backend<'m>(manifest: &'m Manifest, backend: &str, model: crate::types::ModelId) -> CoreResult<&'m Model> {
    let target = manifest.model(model);
    if target.backend == backend {
        Ok(target)
    } else {
        Err(CoreError::backend(
            backend,
            format!("cannot join {} stored in backend {}", target.name, target.backend),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::memory::MemoryBackend;
    use crate::manifest::load::load_yaml_str;
    use serde_json::json;

    const DOCS: &str = r"
type: model
name: City
properties:
  name: {type: string}
";

    #[test]
    fn dropped_guard_rolls_back() {
        let manifest = load_yaml_str(DOCS).unwrap();
        let model = manifest.model_by_name("City").unwrap();
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new("default"));
        backend.bootstrap(&manifest).unwrap();
        {
            let mut guard = TxnGuard::begin(Arc::clone(&backend), true).unwrap();
            let (b, txn) = guard.parts();
            let row = json!({"name": "Vilnius"}).as_object().cloned().unwrap();
            b.insert(model, row, txn).unwrap();
        }
        let txn = backend.begin(false).unwrap();
        let rows: Vec<Row> = backend
            .execute(&manifest, &Query::all(model.id), &txn)
            .unwrap()
            .collect::<CoreResult<_>>()
            .unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn key_queries_match_refs_by_id() {
        let docs = format!("{DOCS}---\ntype: model\nname: Street\nproperties:\n  city: {{type: ref, model: City}}\n");
        let manifest = load_yaml_str(&docs).unwrap();
        let street = manifest.model_by_name("Street").unwrap();
        let key = json!({"city": {"_id": "c1"}}).as_object().cloned().unwrap();
        let query = key_query(&manifest, street, &key).unwrap();
        assert!(matches!(
            &query.filter,
            Some(Cond::Compare { column, value, .. }) if column.place == "city._id" && *value == json!("c1")
        ));
        let bad = json!({"nope": 1}).as_object().cloned().unwrap();
        assert_eq!(key_query(&manifest, street, &bad).unwrap_err().code(), "PropertyNotFound");
    }
}
