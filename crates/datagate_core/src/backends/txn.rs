//! Backend transactions.
//!
//! Writes are staged in the transaction in call order and applied by the
//! backend at commit. Reads through an active transaction see its own
//! staged writes on top of committed data.

use crate::changes::ChangeEntry;
use crate::error::{CoreError, CoreResult};
use crate::types::{Row, TxnId};
use serde_json::Value;
use std::collections::HashMap;

/// State of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Transaction is active and can perform operations.
    Active,
    /// Transaction has been committed.
    Committed,
    /// Transaction has been aborted.
    Aborted,
}

/// A staged write.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingWrite {
    /// Add a row. The row carries `_id` and `_revision`.
    Insert {
        /// Model name.
        model: String,
        /// Stored row.
        row: Row,
    },
    /// Replace a row by `_id`.
    Update {
        /// Model name.
        model: String,
        /// New stored row.
        row: Row,
        /// Revision the row must still carry at commit.
        expected: Option<String>,
    },
    /// Overwrite some top-level values of a row.
    Patch {
        /// Model name.
        model: String,
        /// Row id.
        id: String,
        /// Values to overwrite, including the new `_revision`.
        patch: Row,
        /// Revision the row must still carry at commit.
        expected: Option<String>,
    },
    /// Remove a row.
    Delete {
        /// Model name.
        model: String,
        /// Row id.
        id: String,
        /// Revision the row must still carry at commit.
        expected: Option<String>,
    },
    /// Remove every row and change entry of a model.
    Wipe {
        /// Model name.
        model: String,
    },
    /// Append a change log entry. The counter is assigned at commit.
    Change {
        /// Model name.
        model: String,
        /// Entry to append.
        entry: ChangeEntry,
    },
}

impl PendingWrite {
    /// Model the write applies to.
    #[must_use]
    pub fn model(&self) -> &str {
        match self {
            Self::Insert { model, .. }
            | Self::Update { model, .. }
            | Self::Patch { model, .. }
            | Self::Delete { model, .. }
            | Self::Wipe { model }
            | Self::Change { model, .. } => model,
        }
    }

    /// Row id and revision a write expects to find at commit, when it
    /// carries one.
    #[must_use]
    pub fn expectation(&self) -> Option<(&str, &str)> {
        match self {
            Self::Update {
                row,
                expected: Some(expected),
                ..
            } => row
                .get("_id")
                .and_then(Value::as_str)
                .map(|id| (id, expected.as_str())),
            Self::Patch {
                id,
                expected: Some(expected),
                ..
            }
            | Self::Delete {
                id,
                expected: Some(expected),
                ..
            } => Some((id.as_str(), expected.as_str())),
            _ => None,
        }
    }
}

/// Rows of one model with an id index, in insertion order.
#[derive(Debug, Clone, Default)]
pub struct RowSet {
    rows: Vec<Row>,
    index: HashMap<String, usize>,
}

impl RowSet {
    /// Builds a set from rows.
    #[must_use]
    pub fn from_rows(rows: Vec<Row>) -> Self {
        let mut set = Self { rows, index: HashMap::new() };
        set.reindex();
        set
    }

    fn reindex(&mut self) {
        self.index = self
            .rows
            .iter()
            .enumerate()
            .filter_map(|(i, row)| row.get("_id").and_then(Value::as_str).map(|id| (id.to_string(), i)))
            .collect();
    }

    /// Looks up a row by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Row> {
        self.index.get(id).map(|i| &self.rows[*i])
    }

    /// Every row.
    #[must_use]
    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    /// Consumes the set, returning its rows.
    #[must_use]
    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns `true` when the set holds no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Applies a row write. Change entries are ignored.
    pub fn apply(&mut self, write: &PendingWrite) {
        match write {
            PendingWrite::Insert { row, .. } => {
                if let Some(id) = row.get("_id").and_then(Value::as_str) {
                    self.index.insert(id.to_string(), self.rows.len());
                }
                self.rows.push(row.clone());
            }
            PendingWrite::Update { row, .. } => {
                let id = row.get("_id").and_then(Value::as_str);
                if let Some(i) = id.and_then(|id| self.index.get(id)) {
                    self.rows[*i] = row.clone();
                }
            }
            PendingWrite::Patch { id, patch, .. } => {
                if let Some(i) = self.index.get(id) {
                    let row = &mut self.rows[*i];
                    for (k, v) in patch {
                        row.insert(k.clone(), v.clone());
                    }
                }
            }
            PendingWrite::Delete { id, .. } => {
                if let Some(i) = self.index.remove(id) {
                    self.rows.remove(i);
                    self.reindex();
                }
            }
            PendingWrite::Wipe { .. } => {
                self.rows.clear();
                self.index.clear();
            }
            PendingWrite::Change { .. } => {}
        }
    }
}

/// A backend transaction.
#[derive(Debug)]
pub struct Transaction {
    id: TxnId,
    backend: String,
    write: bool,
    state: TransactionState,
    writes: Vec<PendingWrite>,
}

impl Transaction {
    /// Starts a transaction on a backend.
    #[must_use]
    pub fn new(backend: &str, write: bool) -> Self {
        Self {
            id: TxnId::generate(),
            backend: backend.to_string(),
            write,
            state: TransactionState::Active,
            writes: Vec::new(),
        }
    }

    /// Returns the transaction ID.
    #[must_use]
    pub fn id(&self) -> &TxnId {
        &self.id
    }

    /// Name of the backend the transaction belongs to.
    #[must_use]
    pub fn backend(&self) -> &str {
        &self.backend
    }

    /// Whether writes may be staged.
    #[must_use]
    pub fn is_write(&self) -> bool {
        self.write
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Checks if the transaction is still active.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state == TransactionState::Active
    }

    /// Stages a write.
    ///
    /// # Errors
    ///
    /// Fails when the transaction is finished or read-only.
    pub fn stage(&mut self, write: PendingWrite) -> CoreResult<()> {
        self.ensure_active()?;
        if !self.write {
            return Err(CoreError::backend(&self.backend, "write in a read-only transaction"));
        }
        self.writes.push(write);
        Ok(())
    }

    /// Staged writes in call order.
    #[must_use]
    pub fn pending(&self) -> &[PendingWrite] {
        &self.writes
    }

    /// Returns the number of pending writes.
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.writes.len()
    }

    /// Removes and returns the staged writes.
    pub fn take_writes(&mut self) -> Vec<PendingWrite> {
        std::mem::take(&mut self.writes)
    }

    /// Committed rows of a model with this transaction's writes applied.
    #[must_use]
    pub fn overlay(&self, model: &str, committed: Vec<Row>) -> Vec<Row> {
        if !self.writes.iter().any(|w| w.model() == model) {
            return committed;
        }
        let mut set = RowSet::from_rows(committed);
        for write in self.writes.iter().filter(|w| w.model() == model) {
            set.apply(write);
        }
        set.into_rows()
    }

    /// A committed row with this transaction's writes applied.
    #[must_use]
    pub fn overlay_row(&self, model: &str, id: &str, committed: Option<Row>) -> Option<Row> {
        let mut row = committed;
        for write in self.writes.iter().filter(|w| w.model() == model) {
            row = match write {
                PendingWrite::Insert { row: new, .. } | PendingWrite::Update { row: new, .. }
                    if new.get("_id").and_then(Value::as_str) == Some(id) =>
                {
                    Some(new.clone())
                }
                PendingWrite::Patch { id: target, patch, .. } if target == id => row.map(|mut r| {
                    for (k, v) in patch {
                        r.insert(k.clone(), v.clone());
                    }
                    r
                }),
                PendingWrite::Delete { id: target, .. } if target == id => None,
                PendingWrite::Wipe { .. } => None,
                _ => row,
            };
        }
        row
    }

    /// Marks the transaction as committed.
    pub(crate) fn mark_committed(&mut self) {
        self.state = TransactionState::Committed;
    }

    /// Marks the transaction as aborted.
    pub(crate) fn mark_aborted(&mut self) {
        self.state = TransactionState::Aborted;
    }

    /// Ensures the transaction is active.
    pub(crate) fn ensure_active(&self) -> CoreResult<()> {
        match self.state {
            TransactionState::Active => Ok(()),
            TransactionState::Committed => {
                Err(CoreError::backend(&self.backend, "transaction already committed"))
            }
            TransactionState::Aborted => {
                Err(CoreError::backend(&self.backend, "transaction already aborted"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(v: Value) -> Row {
        v.as_object().cloned().unwrap()
    }

    fn insert(id: &str, name: &str) -> PendingWrite {
        PendingWrite::Insert {
            model: "City".into(),
            row: row(json!({"_id": id, "name": name})),
        }
    }

    #[test]
    fn new_transaction_is_active() {
        let txn = Transaction::new("default", false);
        assert!(txn.is_active());
        assert_eq!(txn.state(), TransactionState::Active);
        assert_eq!(txn.backend(), "default");
    }

    #[test]
    fn read_only_transactions_reject_writes() {
        let mut txn = Transaction::new("default", false);
        assert!(txn.stage(insert("a", "Vilnius")).is_err());
    }

    #[test]
    fn finished_transactions_reject_writes() {
        let mut txn = Transaction::new("default", true);
        txn.mark_aborted();
        assert!(txn.stage(insert("a", "Vilnius")).is_err());
    }

    #[test]
    fn overlay_applies_writes_in_order() {
        let mut txn = Transaction::new("default", true);
        txn.stage(insert("b", "Kaunas")).unwrap();
        txn.stage(PendingWrite::Patch {
            model: "City".into(),
            id: "a".into(),
            patch: row(json!({"name": "Vilna"})),
            expected: None,
        })
        .unwrap();
        txn.stage(PendingWrite::Delete { model: "City".into(), id: "c".into(), expected: None })
            .unwrap();
        let committed = vec![
            row(json!({"_id": "a", "name": "Vilnius"})),
            row(json!({"_id": "c", "name": "Siauliai"})),
        ];
        let rows = txn.overlay("City", committed.clone());
        let names: Vec<&str> = rows.iter().map(|r| r["name"].as_str().unwrap()).collect();
        assert_eq!(names, vec!["Vilna", "Kaunas"]);

        assert_eq!(txn.overlay("Country", committed.clone()), committed);
        assert!(txn.overlay_row("City", "c", Some(committed[1].clone())).is_none());
        assert_eq!(txn.overlay_row("City", "b", None).unwrap()["name"], "Kaunas");
        assert_eq!(txn.write_count(), 3);
    }
}
