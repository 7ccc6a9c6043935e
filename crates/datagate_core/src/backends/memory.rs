//! In-memory backend.
//!
//! Rows are kept as JSON objects per model behind a single lock. Commits
//! apply staged writes to copies of the touched tables and swap them in,
//! so a failed commit leaves committed data untouched.

use super::eval::run_query;
use super::{backend_models, same_backend, Backend, PendingWrite, RowSet, RowStream, Transaction};
use crate::changes::{select_changes, ChangeEntry};
use crate::config::BackendKind;
use crate::error::{CoreError, CoreResult, ErrorKind};
use crate::manifest::{Manifest, Model};
use crate::migration::{plan_migration, SchemaAction, SchemaSnapshot};
use crate::types::{ModelId, Row};
use crate::ufunc::Query;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone, Default)]
struct Table {
    rows: RowSet,
    changes: Vec<ChangeEntry>,
    counter: u64,
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: BTreeMap<String, Table>,
    schema: SchemaSnapshot,
    manifest_docs: Vec<Value>,
}

/// Backend holding everything in process memory.
#[derive(Debug)]
pub struct MemoryBackend {
    name: String,
    state: RwLock<MemoryState>,
}

impl MemoryBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: RwLock::new(MemoryState::default()),
        }
    }

    fn missing_table(&self, model: &str) -> CoreError {
        CoreError::backend(&self.name, format!("table {model} does not exist"))
    }

    fn committed_rows(&self, state: &MemoryState, model: &str) -> CoreResult<Vec<Row>> {
        state
            .tables
            .get(model)
            .map(|t| t.rows.rows().to_vec())
            .ok_or_else(|| self.missing_table(model))
    }

    /// Rejects a write whose row moved on since it was read.
    fn check_expected(&self, table: &Table, model: &str, write: &PendingWrite) -> CoreResult<()> {
        let Some((id, expected)) = write.expectation() else {
            return Ok(());
        };
        let current = table
            .rows
            .get(id)
            .and_then(|row| row.get("_revision"))
            .and_then(Value::as_str);
        if current == Some(expected) {
            return Ok(());
        }
        debug!(backend = %self.name, model, id, "revision moved on before commit");
        Err(ErrorKind::ConflictingValue
            .err()
            .model(model)
            .with("given", expected)
            .with("expected", current.map_or(Value::Null, Value::from))
            .into())
    }

    fn apply_action(state: &mut MemoryState, action: &SchemaAction) {
        match action {
            SchemaAction::CreateTable { table } => {
                state.tables.entry(table.name.clone()).or_default();
                state.schema.insert(table.name.clone(), table.clone());
            }
            SchemaAction::AddColumn { table, column } => {
                if let Some(schema) = state.schema.get_mut(table) {
                    schema.columns.push(column.clone());
                }
            }
            SchemaAction::AlterColumn { table, to, .. } => {
                if let Some(col) = state
                    .schema
                    .get_mut(table)
                    .and_then(|s| s.columns.iter_mut().find(|c| c.name == to.name))
                {
                    *col = to.clone();
                }
            }
            SchemaAction::DropColumn { table, column } => {
                if let Some(schema) = state.schema.get_mut(table) {
                    schema.columns.retain(|c| c.name != *column);
                }
                if let Some(t) = state.tables.get_mut(table) {
                    let rows = t
                        .rows
                        .rows()
                        .iter()
                        .cloned()
                        .map(|mut row| {
                            row.remove(column);
                            row
                        })
                        .collect();
                    t.rows = RowSet::from_rows(rows);
                }
            }
            SchemaAction::DropTable { table } => {
                state.tables.remove(table);
                state.schema.remove(table);
            }
        }
    }
}

impl Backend for MemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn family(&self) -> BackendKind {
        BackendKind::Memory
    }

    fn wait(&self, _timeout: Duration) -> bool {
        true
    }

    fn bootstrap(&self, manifest: &Manifest) -> CoreResult<()> {
        let mut state = self.state.write();
        let actions = plan_migration(manifest, backend_models(manifest, &self.name), &state.schema);
        for action in actions.iter().filter(|a| matches!(a, SchemaAction::CreateTable { .. })) {
            debug!(backend = %self.name, table = action.table(), "creating table");
            Self::apply_action(&mut state, action);
        }
        Ok(())
    }

    fn schema(&self) -> CoreResult<SchemaSnapshot> {
        Ok(self.state.read().schema.clone())
    }

    fn migrate(&self, _manifest: &Manifest, actions: &[SchemaAction]) -> CoreResult<()> {
        let mut state = self.state.write();
        for action in actions {
            Self::apply_action(&mut state, action);
        }
        info!(backend = %self.name, actions = actions.len(), "migration applied");
        Ok(())
    }

    fn load_manifest_docs(&self) -> CoreResult<Vec<Value>> {
        Ok(self.state.read().manifest_docs.clone())
    }

    fn save_manifest_docs(&self, docs: &[Value]) -> CoreResult<()> {
        self.state.write().manifest_docs = docs.to_vec();
        Ok(())
    }

    fn execute(&self, manifest: &Manifest, query: &Query, txn: &Transaction) -> CoreResult<RowStream> {
        let state = self.state.read();
        let model = manifest.model(query.model);
        let rows = txn.overlay(&model.name, self.committed_rows(&state, &model.name)?);
        let mut fetch = |id: ModelId| -> CoreResult<Vec<Row>> {
            let joined = same_backend(manifest, &self.name, id)?;
            Ok(txn.overlay(&joined.name, self.committed_rows(&state, &joined.name)?))
        };
        let rows = run_query(manifest, query, rows, &mut fetch)?;
        Ok(Box::new(rows.into_iter().map(Ok)))
    }

    fn fetch(&self, _manifest: &Manifest, model: &Model, id: &str) -> CoreResult<Option<Row>> {
        let state = self.state.read();
        let table = state
            .tables
            .get(&model.name)
            .ok_or_else(|| self.missing_table(&model.name))?;
        Ok(table.rows.get(id).cloned())
    }

    fn changes(&self, model: &Model, offset: i64, limit: Option<usize>) -> CoreResult<Vec<ChangeEntry>> {
        let state = self.state.read();
        let table = state
            .tables
            .get(&model.name)
            .ok_or_else(|| self.missing_table(&model.name))?;
        Ok(select_changes(&table.changes, offset, limit))
    }

    fn commit(&self, _manifest: &Manifest, txn: &mut Transaction) -> CoreResult<()> {
        txn.ensure_active()?;
        let mut state = self.state.write();
        let mut touched: BTreeMap<String, Table> = BTreeMap::new();
        for write in txn.pending() {
            let model = write.model();
            if !touched.contains_key(model) {
                let table = state.tables.get(model).ok_or_else(|| self.missing_table(model))?;
                touched.insert(model.to_string(), table.clone());
            }
            let Some(table) = touched.get_mut(model) else {
                continue;
            };
            match write {
                PendingWrite::Insert { row, .. } => {
                    let id = row.get("_id").and_then(Value::as_str).unwrap_or_default();
                    if table.rows.get(id).is_some() {
                        return Err(ErrorKind::UniqueConstraint
                            .err()
                            .model(model)
                            .property("_id")
                            .with("value", id)
                            .into());
                    }
                    table.rows.apply(write);
                }
                PendingWrite::Wipe { .. } => {
                    table.rows.apply(write);
                    table.changes.clear();
                }
                PendingWrite::Change { entry, .. } => {
                    table.counter += 1;
                    table.changes.push(ChangeEntry {
                        change: table.counter,
                        ..entry.clone()
                    });
                }
                _ => {
                    self.check_expected(table, model, write)?;
                    table.rows.apply(write);
                }
            }
        }
        let writes = txn.write_count();
        state.tables.extend(touched);
        txn.take_writes();
        txn.mark_committed();
        debug!(backend = %self.name, txn = %txn.id(), writes, "transaction committed");
        Ok(())
    }
}
