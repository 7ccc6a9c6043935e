//! The write pipeline.
//!
//! Every write goes through the same stages:
//!
//! 1. authorize the action on the model (and property);
//! 2. load the payload through the property types;
//! 3. read the pre-image for rewrites;
//! 4. check the given `_revision` against the stored one;
//! 5. validate `required`, `unique`, `choices` and refs;
//! 6. diff the new values against the pre-image;
//! 7. stage the row write and its change entry in the backend transaction.
//!
//! A batch opens one write transaction per backend and commits them after
//! every item went through. Any error rolls back every open transaction.

use crate::auth::Caller;
use crate::backends::{Backend, Transaction, TxnGuard};
use crate::changes::{diff_rows, ChangeEntry};
use crate::dtype::{check, default_value, CheckContext, DType};
use crate::error::{CoreError, CoreResult, ErrorKind};
use crate::manifest::{Manifest, Model, Property};
use crate::types::{new_row_id, Action, ModelId, PropertyId, Revision, Row};
use crate::ufunc::{resolve_query, Env, FuncRegistry};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use datagate_storage::{BlobStore, ByteStore};
use serde_json::{Map, Value};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Blob store holding `file` contents.
pub type Blobs = BlobStore<Box<dyn ByteStore>>;

/// One write request as it moves through the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct DataItem {
    /// Model written.
    pub model: ModelId,
    /// Property for sub-resource writes.
    pub prop: Option<PropertyId>,
    /// Sub-resource write touching only reference metadata (`prop:ref`).
    pub ref_only: bool,
    /// Requested action.
    pub action: Action,
    /// Row id from the request path.
    pub id: Option<String>,
    /// Raw request body.
    pub payload: Row,
    /// Loaded values.
    pub given: Row,
    /// Pre-image.
    pub saved: Option<Row>,
    /// Values that change.
    pub patch: Row,
}

impl DataItem {
    /// A whole-row write.
    #[must_use]
    pub fn new(model: ModelId, action: Action, payload: Row) -> Self {
        Self {
            model,
            prop: None,
            ref_only: false,
            action,
            id: None,
            payload,
            given: Row::new(),
            saved: None,
            patch: Row::new(),
        }
    }

    /// Sets the row id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Scopes the write to one property.
    #[must_use]
    pub fn with_prop(mut self, prop: PropertyId, ref_only: bool) -> Self {
        self.prop = Some(prop);
        self.ref_only = ref_only;
        self
    }
}

/// What a write did.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteOutcome {
    /// Model written.
    pub model: ModelId,
    /// Effective action: upserts report `insert` or `patch`.
    pub action: Action,
    /// Row id, `None` for wipes.
    pub id: Option<String>,
    /// Revision after the write.
    pub revision: Option<Revision>,
    /// Response values: the full row for inserts and updates, changed
    /// values plus identity for patches, identity for deletes.
    pub row: Row,
    /// Whether anything was staged.
    pub changed: bool,
}

struct Loaded {
    given: Row,
    id: Option<String>,
    revision: Option<String>,
    filter: Option<String>,
}

struct Lookup<'w> {
    manifest: &'w Manifest,
    backends: &'w BTreeMap<String, Arc<dyn Backend>>,
    backend: &'w dyn Backend,
    txn: &'w Transaction,
}

impl Lookup<'_> {
    fn find(&self, model: &Model, key: &Row) -> CoreResult<Vec<Row>> {
        if model.backend == self.backend.name() {
            return self.backend.find(self.manifest, model, key, self.txn);
        }
        let other = backend_named(self.backends, &model.backend)?;
        let txn = other.begin(false)?;
        other.find(self.manifest, model, key, &txn)
    }
}

impl CheckContext for Lookup<'_> {
    fn exists(&self, model: &Model, key: &Row) -> CoreResult<bool> {
        Ok(!self.find(model, key)?.is_empty())
    }

    fn taken(&self, prop: &Property, value: &Value, exclude: Option<&str>) -> CoreResult<bool> {
        let model = self.manifest.model(prop.model);
        let mut key = Row::new();
        key.insert(prop.place.clone(), value.clone());
        Ok(self
            .find(model, &key)?
            .iter()
            .any(|row| row.get("_id").and_then(Value::as_str) != exclude))
    }
}

fn backend_named(backends: &BTreeMap<String, Arc<dyn Backend>>, name: &str) -> CoreResult<Arc<dyn Backend>> {
    backends
        .get(name)
        .cloned()
        .ok_or_else(|| CoreError::config(format!("backend {name} is not configured")))
}

fn identity(id: &str, revision: Option<&Revision>) -> Row {
    let mut row = Row::new();
    row.insert("_id".into(), Value::from(id));
    if let Some(revision) = revision {
        row.insert("_revision".into(), Value::from(revision.as_str()));
    }
    row
}

fn merge_objects(manifest: &Manifest, prop: &Property, saved: Option<&Value>, given: Value) -> Value {
    match (&prop.dtype, saved, given) {
        (DType::Object(obj), Some(Value::Object(old)), Value::Object(new)) => {
            let mut merged = old.clone();
            for (key, value) in new {
                let child = obj
                    .properties
                    .iter()
                    .map(|id| manifest.property(*id))
                    .find(|c| c.name == key);
                let value = match child {
                    Some(child) => merge_objects(manifest, child, old.get(&key), value),
                    None => value,
                };
                merged.insert(key, value);
            }
            Value::Object(merged)
        }
        (_, _, given) => given,
    }
}

/// Runs writes against the backends of a manifest.
pub struct Writer<'a> {
    manifest: &'a Manifest,
    backends: &'a BTreeMap<String, Arc<dyn Backend>>,
    funcs: &'a FuncRegistry,
    caller: Option<&'a Caller>,
    blobs: Option<&'a Blobs>,
}

impl<'a> Writer<'a> {
    /// A trusted writer: no scope checks, no file contents.
    #[must_use]
    pub fn new(
        manifest: &'a Manifest,
        backends: &'a BTreeMap<String, Arc<dyn Backend>>,
        funcs: &'a FuncRegistry,
    ) -> Self {
        Self {
            manifest,
            backends,
            funcs,
            caller: None,
            blobs: None,
        }
    }

    /// Checks scopes of `caller`.
    #[must_use]
    pub fn caller(mut self, caller: &'a Caller) -> Self {
        self.caller = Some(caller);
        self
    }

    /// Stores `file` contents in `blobs`.
    #[must_use]
    pub fn blobs(mut self, blobs: &'a Blobs) -> Self {
        self.blobs = Some(blobs);
        self
    }

    /// Runs one write in its own transaction.
    ///
    /// # Errors
    ///
    /// Any pipeline error; nothing is written then.
    pub fn write(&self, item: DataItem) -> CoreResult<WriteOutcome> {
        self.write_batch(vec![item])?
            .pop()
            .ok_or_else(|| CoreError::internal("write produced no outcome"))
    }

    /// Runs writes in order, one transaction per backend.
    ///
    /// # Errors
    ///
    /// The first failing item's error. Transactions not yet committed are
    /// rolled back; commits on different backends are not atomic.
    pub fn write_batch(&self, items: Vec<DataItem>) -> CoreResult<Vec<WriteOutcome>> {
        let mut guards: BTreeMap<String, TxnGuard> = BTreeMap::new();
        let mut outcomes = Vec::with_capacity(items.len());
        for item in items {
            let model = self.manifest.model(item.model);
            let guard = match guards.entry(model.backend.clone()) {
                Entry::Occupied(e) => e.into_mut(),
                Entry::Vacant(e) => {
                    let backend = backend_named(self.backends, &model.backend)?;
                    e.insert(TxnGuard::begin(backend, true)?)
                }
            };
            outcomes.push(self.process(item, guard)?);
        }
        for (name, guard) in guards {
            let writes = guard.txn().write_count();
            guard.commit(self.manifest)?;
            debug!(backend = %name, writes, "write committed");
        }
        Ok(outcomes)
    }

    fn process(&self, mut item: DataItem, guard: &mut TxnGuard) -> CoreResult<WriteOutcome> {
        let manifest = self.manifest;
        let model = manifest.model(item.model);
        let prop = item.prop.map(|id| manifest.property(id));
        self.authorize(model, prop, item.action)?;

        if item.action == Action::Wipe {
            let (backend, txn) = guard.parts();
            backend.wipe(model, txn)?;
            info!(model = %model.name, backend = backend.name(), "wipe staged");
            return Ok(WriteOutcome {
                model: model.id,
                action: Action::Wipe,
                id: None,
                revision: None,
                row: Row::new(),
                changed: true,
            });
        }

        let loaded = match prop {
            Some(prop) => self.load_subresource(model, prop, &item)?,
            None => self.load(model, &item)?,
        };
        item.given = loaded.given;
        let id = loaded.id.or_else(|| item.id.clone());

        let (saved, action) = {
            let lookup = Lookup {
                manifest,
                backends: self.backends,
                backend: guard.backend(),
                txn: guard.txn(),
            };
            let saved = self.pre_image(model, &item, id.as_deref(), loaded.filter.as_deref(), &lookup)?;
            let action = match (item.action, &saved, prop) {
                (_, _, Some(_)) => Action::Patch,
                (Action::Upsert, Some(_), None) => Action::Patch,
                (Action::Upsert, None, None) => Action::Insert,
                (action, _, None) => action,
            };
            self.check_revision(model, &item, loaded.revision.as_deref(), saved.as_ref())?;
            (saved, action)
        };
        item.saved = saved;

        self.store_files(model, &mut item.given)?;
        {
            let lookup = Lookup {
                manifest,
                backends: self.backends,
                backend: guard.backend(),
                txn: guard.txn(),
            };
            self.resolve_refs(&lookup, model, &mut item.given)?;
            let current = item
                .saved
                .as_ref()
                .and_then(|s| s.get("_id"))
                .and_then(Value::as_str);
            self.validate(&lookup, model, action, id.as_deref(), &item.given, current)?;
        }

        let (backend, txn) = guard.parts();
        match action {
            Action::Insert => self.insert(backend, txn, model, item, id),
            Action::Update => self.update(backend, txn, model, item),
            Action::Patch => self.patch(backend, txn, model, item, prop),
            Action::Delete => self.delete(backend, txn, model, item),
            other => Err(ErrorKind::UnknownAction.err().with("action", other.as_str()).into()),
        }
    }

    fn authorize(&self, model: &Model, prop: Option<&Property>, action: Action) -> CoreResult<()> {
        let Some(caller) = self.caller else {
            return Ok(());
        };
        caller.authorize(model, None, action)?;
        if let Some(prop) = prop {
            caller.authorize(model, Some(prop), action)?;
        }
        Ok(())
    }

    fn require_meta_scope(&self, model: &Model) -> CoreResult<()> {
        match self.caller {
            Some(caller) if !caller.can_set_meta_fields() => Err(ErrorKind::InsufficientScope
                .err()
                .model(&model.name)
                .with("scopes", vec![caller.meta_scope()])
                .into()),
            _ => Ok(()),
        }
    }

    fn load(&self, model: &Model, item: &DataItem) -> CoreResult<Loaded> {
        let manifest = self.manifest;
        let mut loaded = Loaded {
            given: Row::new(),
            id: None,
            revision: None,
            filter: None,
        };
        let mut errors = Vec::new();
        for (key, raw) in &item.payload {
            match key.as_str() {
                "_op" => {}
                "_type" => {
                    if raw.as_str() != Some(model.name.as_str()) {
                        errors.push(
                            ErrorKind::InvalidValue
                                .err()
                                .model(&model.name)
                                .property("_type")
                                .with("value", raw.clone())
                                .with("expected", model.name.as_str())
                                .into(),
                        );
                    }
                }
                "_where" => match raw {
                    Value::String(s) => loaded.filter = Some(s.clone()),
                    other => errors.push(
                        ErrorKind::InvalidValue
                            .err()
                            .model(&model.name)
                            .property("_where")
                            .with("value", other.clone())
                            .into(),
                    ),
                },
                "_revision" => {
                    let Some(revision) = raw.as_str() else {
                        errors.push(
                            ErrorKind::InvalidValue
                                .err()
                                .model(&model.name)
                                .property("_revision")
                                .with("value", raw.clone())
                                .into(),
                        );
                        continue;
                    };
                    if matches!(item.action, Action::Insert) {
                        self.require_meta_scope(model)?;
                        loaded.given.insert("_revision".into(), raw.clone());
                    }
                    loaded.revision = Some(revision.to_string());
                }
                "_id" => {
                    let Some(id) = raw.as_str().filter(|s| !s.is_empty()) else {
                        errors.push(
                            ErrorKind::InvalidValue
                                .err()
                                .model(&model.name)
                                .property("_id")
                                .with("value", raw.clone())
                                .into(),
                        );
                        continue;
                    };
                    match (&item.id, item.action) {
                        (Some(path_id), _) if path_id != id => errors.push(
                            ErrorKind::InvalidValue
                                .err()
                                .model(&model.name)
                                .property("_id")
                                .with("value", id)
                                .with("expected", path_id.as_str())
                                .into(),
                        ),
                        (None, Action::Insert | Action::Upsert) => {
                            self.require_meta_scope(model)?;
                            loaded.id = Some(id.to_string());
                        }
                        _ => loaded.id = Some(id.to_string()),
                    }
                }
                name => {
                    let prop = match manifest.find_property(model.id, name) {
                        Some(p) if p.parent.is_none() && !p.is_reserved() => p,
                        _ => {
                            errors.push(
                                ErrorKind::FieldNotInResource
                                    .err()
                                    .model(&model.name)
                                    .property(name)
                                    .into(),
                            );
                            continue;
                        }
                    };
                    if let Some(caller) = self.caller {
                        caller.authorize(model, Some(prop), item.action)?;
                    }
                    match prop.dtype.load(manifest, prop, raw) {
                        Ok(value) => {
                            loaded.given.insert(prop.name.clone(), value);
                        }
                        Err(err) => errors.push(err),
                    }
                }
            }
        }
        match CoreError::collect(errors) {
            Some(err) => Err(err),
            None => Ok(loaded),
        }
    }

    fn load_subresource(&self, model: &Model, prop: &Property, item: &DataItem) -> CoreResult<Loaded> {
        let manifest = self.manifest;
        let mut body = item.payload.clone();
        let revision = match body.remove("_revision") {
            Some(Value::String(s)) => Some(s),
            Some(other) => {
                return Err(ErrorKind::InvalidValue
                    .err()
                    .model(&model.name)
                    .property("_revision")
                    .with("value", other)
                    .into())
            }
            None => None,
        };
        let raw = match (&prop.dtype, item.action) {
            (_, Action::Delete) => Value::Null,
            (DType::File | DType::Object(_), _) => Value::Object(body),
            _ => body.remove(&prop.name).unwrap_or(Value::Null),
        };
        if item.ref_only && matches!(prop.dtype, DType::File) && raw.get("_content").is_some() {
            return Err(ErrorKind::InvalidValue
                .err()
                .model(&model.name)
                .property(&prop.place)
                .with("value", "_content")
                .into());
        }
        let value = prop.dtype.load(manifest, prop, &raw)?;
        let mut given = Row::new();
        given.insert(prop.name.clone(), value);
        Ok(Loaded {
            given,
            id: None,
            revision,
            filter: None,
        })
    }

    fn select_by_filter(&self, lookup: &Lookup<'_>, model: &Model, filter: &str) -> CoreResult<Option<Row>> {
        let node = datagate_expr::parse(filter)?;
        let params = BTreeMap::new();
        let env = Env {
            manifest: self.manifest,
            model,
            family: lookup.backend.family(),
            caller: None,
            action: Action::Search,
            funcs: self.funcs,
            params: &params,
        };
        let query = resolve_query(&env, Some(&node))?;
        let mut rows: Vec<Row> = lookup
            .backend
            .execute(self.manifest, &query, lookup.txn)?
            .collect::<CoreResult<_>>()?;
        if rows.len() > 1 {
            return Err(ErrorKind::MultipleRowsFound
                .err()
                .model(&model.name)
                .with("value", filter)
                .into());
        }
        let Some(row) = rows.pop() else {
            return Ok(None);
        };
        let id = row.get("_id").and_then(Value::as_str).unwrap_or_default();
        lookup
            .backend
            .get_one(self.manifest, model, id, lookup.txn)
            .map(Some)
    }

    fn pre_image(
        &self,
        model: &Model,
        item: &DataItem,
        id: Option<&str>,
        filter: Option<&str>,
        lookup: &Lookup<'_>,
    ) -> CoreResult<Option<Row>> {
        let missing = || -> CoreError {
            ErrorKind::ItemDoesNotExist
                .err()
                .model(&model.name)
                .with("id", id.or(filter).unwrap_or_default())
                .into()
        };
        match item.action {
            Action::Insert => Ok(None),
            Action::Upsert => match (filter, id) {
                (Some(filter), _) => self.select_by_filter(lookup, model, filter),
                (None, Some(id)) => match lookup.backend.get_one(self.manifest, model, id, lookup.txn) {
                    Ok(row) => Ok(Some(row)),
                    Err(err) if err.kind() == Some(ErrorKind::ItemDoesNotExist) => Ok(None),
                    Err(err) => Err(err),
                },
                (None, None) => Ok(None),
            },
            _ => match (filter, id) {
                (Some(filter), _) => self
                    .select_by_filter(lookup, model, filter)?
                    .map(Some)
                    .ok_or_else(missing),
                (None, Some(id)) => lookup
                    .backend
                    .get_one(self.manifest, model, id, lookup.txn)
                    .map(Some),
                (None, None) => Err(missing()),
            },
        }
    }

    fn check_revision(
        &self,
        model: &Model,
        item: &DataItem,
        given: Option<&str>,
        saved: Option<&Row>,
    ) -> CoreResult<()> {
        let Some(saved) = saved else {
            return Ok(());
        };
        let required = item.prop.is_some()
            || matches!(item.action, Action::Update | Action::Patch | Action::Delete);
        let expected = saved.get("_revision").and_then(Value::as_str);
        match given {
            None if required => Err(ErrorKind::NoItemRevision.err().model(&model.name).into()),
            None => Ok(()),
            Some(given) if Some(given) != expected => Err(ErrorKind::ConflictingValue
                .err()
                .model(&model.name)
                .with("given", given)
                .with("expected", expected.map_or(Value::Null, Value::from))
                .into()),
            Some(_) => Ok(()),
        }
    }

    fn store_files(&self, model: &Model, given: &mut Row) -> CoreResult<()> {
        let manifest = self.manifest;
        for (name, value) in given.iter_mut() {
            if let Some(prop) = manifest.find_property(model.id, name) {
                self.store_file_value(model, prop, value)?;
            }
        }
        Ok(())
    }

    fn store_file_value(&self, model: &Model, prop: &Property, value: &mut Value) -> CoreResult<()> {
        let manifest = self.manifest;
        match (&prop.dtype, value) {
            (DType::File, Value::Object(map)) => {
                let Some(content) = map.remove("_content") else {
                    return Ok(());
                };
                let Some(encoded) = content.as_str() else {
                    return Ok(());
                };
                let bytes = STANDARD.decode(encoded).map_err(|_| -> CoreError {
                    ErrorKind::InvalidValue
                        .err()
                        .model(&model.name)
                        .property(&prop.place)
                        .with("expected", "base64 content")
                        .into()
                })?;
                let blobs = self.blobs.ok_or_else(|| {
                    CoreError::backend(&model.backend, "file contents need a blob store")
                })?;
                let blob = blobs.put(&bytes)?;
                debug!(model = %model.name, property = %prop.place, size = bytes.len(), "file stored");
                map.insert("_blob".into(), Value::from(blob.to_string()));
                map.insert("_size".into(), Value::from(bytes.len()));
            }
            (DType::Object(obj), Value::Object(map)) => {
                for id in &obj.properties {
                    let child = manifest.property(*id);
                    if let Some(v) = map.get_mut(&child.name) {
                        self.store_file_value(model, child, v)?;
                    }
                }
            }
            (DType::Array(arr), Value::Array(items)) => {
                let item = manifest.property(arr.items);
                for v in items {
                    self.store_file_value(model, item, v)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn resolve_refs(&self, lookup: &Lookup<'_>, model: &Model, given: &mut Row) -> CoreResult<()> {
        let mut errors = Vec::new();
        for (name, value) in given.iter_mut() {
            let Some(prop) = self.manifest.find_property(model.id, name) else {
                continue;
            };
            if let Err(err) = self.resolve_ref_value(lookup, prop, value) {
                errors.push(err);
            }
        }
        match CoreError::collect(errors) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Replaces refs given by `refprops` values with the `_id` they point to.
    fn resolve_ref_value(&self, lookup: &Lookup<'_>, prop: &Property, value: &mut Value) -> CoreResult<()> {
        let manifest = self.manifest;
        match (&prop.dtype, value) {
            (DType::Ref(r), Value::Object(key)) => {
                if let Some(id) = key.get("_id").cloned() {
                    key.clear();
                    key.insert("_id".into(), id);
                    return Ok(());
                }
                let target = manifest.model(r.model);
                let rows = lookup.find(target, key)?;
                match rows.as_slice() {
                    [row] => {
                        let id = row.get("_id").cloned().unwrap_or(Value::Null);
                        key.clear();
                        key.insert("_id".into(), id);
                        Ok(())
                    }
                    [] => Err(ErrorKind::ItemDoesNotExist
                        .err()
                        .model(&target.name)
                        .property(&prop.place)
                        .with("id", Value::Object(key.clone()))
                        .into()),
                    _ => Err(ErrorKind::MultipleRowsFound
                        .err()
                        .model(&target.name)
                        .property(&prop.place)
                        .with("value", Value::Object(key.clone()))
                        .into()),
                }
            }
            (DType::Object(obj), Value::Object(map)) => {
                for id in &obj.properties {
                    let child = manifest.property(*id);
                    if let Some(v) = map.get_mut(&child.name) {
                        self.resolve_ref_value(lookup, child, v)?;
                    }
                }
                Ok(())
            }
            (DType::Array(arr), Value::Array(items)) => {
                let item = manifest.property(arr.items);
                for v in items {
                    self.resolve_ref_value(lookup, item, v)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn validate(
        &self,
        lookup: &Lookup<'_>,
        model: &Model,
        action: Action,
        new_id: Option<&str>,
        given: &Row,
        current: Option<&str>,
    ) -> CoreResult<()> {
        let manifest = self.manifest;
        let full = matches!(action, Action::Insert | Action::Update);
        let mut errors = Vec::new();
        if let (Action::Insert, Some(id)) = (action, new_id) {
            let prop = manifest.property_by_place(model.id, "_id")?;
            if lookup.taken(prop, &Value::from(id), None)? {
                errors.push(
                    ErrorKind::UniqueConstraint
                        .err()
                        .model(&model.name)
                        .property("_id")
                        .with("value", id)
                        .into(),
                );
            }
        }
        for prop in manifest.top_properties(model.id) {
            if prop.is_reserved() || !prop.dtype.is_stored() {
                continue;
            }
            let default;
            let value = match given.get(&prop.name) {
                Some(v) => Some(v),
                None if full => {
                    default = default_value(manifest, prop);
                    (!default.is_null()).then_some(&default)
                }
                None => continue,
            };
            if let Err(err) = check(lookup, manifest, prop, value, full, current) {
                errors.push(err);
            }
        }
        match CoreError::collect(errors) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn full_row(&self, model: &Model, id: &str, given: &Row) -> Row {
        let manifest = self.manifest;
        let mut row = Row::new();
        row.insert("_id".into(), Value::from(id));
        if let Some(revision) = given.get("_revision") {
            row.insert("_revision".into(), revision.clone());
        }
        for prop in manifest
            .top_properties(model.id)
            .filter(|p| !p.is_reserved() && p.dtype.is_stored())
        {
            let value = given
                .get(&prop.name)
                .cloned()
                .unwrap_or_else(|| default_value(manifest, prop));
            row.insert(prop.name.clone(), value);
        }
        row
    }

    fn insert(
        &self,
        backend: &dyn Backend,
        txn: &mut Transaction,
        model: &Model,
        item: DataItem,
        id: Option<String>,
    ) -> CoreResult<WriteOutcome> {
        let id = id.unwrap_or_else(new_row_id);
        let mut row = self.full_row(model, &id, &item.given);
        let revision = backend.insert(model, row.clone(), txn)?;
        row.insert("_revision".into(), Value::from(revision.as_str()));
        let diff: Row = row
            .iter()
            .filter(|(k, _)| !k.starts_with('_'))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let entry = ChangeEntry::new(txn.id(), revision.clone(), &id, Action::Insert, diff);
        backend.append_change(model, entry, txn)?;
        debug!(model = %model.name, id = %id, "insert staged");
        Ok(WriteOutcome {
            model: model.id,
            action: Action::Insert,
            id: Some(id),
            revision: Some(revision),
            row,
            changed: true,
        })
    }

    fn update(
        &self,
        backend: &dyn Backend,
        txn: &mut Transaction,
        model: &Model,
        item: DataItem,
    ) -> CoreResult<WriteOutcome> {
        let saved = item.saved.unwrap_or_default();
        let id = saved_id(&saved)?;
        let mut given = item.given;
        given.remove("_revision");
        let mut row = self.full_row(model, &id, &given);
        let patch = diff_rows(&saved, &row);
        if patch.is_empty() {
            return Ok(unchanged(model, &id, &saved, saved.clone()));
        }
        let expected = saved.get("_revision").and_then(Value::as_str);
        let revision = backend.update(model, row.clone(), expected, txn)?;
        row.insert("_revision".into(), Value::from(revision.as_str()));
        let entry = ChangeEntry::new(txn.id(), revision.clone(), &id, Action::Update, patch);
        backend.append_change(model, entry, txn)?;
        debug!(model = %model.name, id = %id, "update staged");
        Ok(WriteOutcome {
            model: model.id,
            action: Action::Update,
            id: Some(id),
            revision: Some(revision),
            row,
            changed: true,
        })
    }

    fn patch(
        &self,
        backend: &dyn Backend,
        txn: &mut Transaction,
        model: &Model,
        item: DataItem,
        prop: Option<&Property>,
    ) -> CoreResult<WriteOutcome> {
        let manifest = self.manifest;
        let saved = item.saved.unwrap_or_default();
        let id = saved_id(&saved)?;
        let mut merged = Row::new();
        for (name, value) in item.given {
            if name.starts_with('_') {
                continue;
            }
            let Some(target) = manifest.find_property(model.id, &name) else {
                continue;
            };
            let value = match (&target.dtype, saved.get(&name), value) {
                (DType::File, Some(Value::Object(old)), Value::Object(new)) if item.ref_only => {
                    let mut file: Map<String, Value> = old.clone();
                    file.extend(new);
                    Value::Object(file)
                }
                (_, old, value) => merge_objects(manifest, target, old, value),
            };
            merged.insert(name, value);
        }
        let patch = diff_rows(&saved, &merged);
        if patch.is_empty() {
            return Ok(unchanged(model, &id, &saved, Row::new()));
        }
        let expected = saved.get("_revision").and_then(Value::as_str);
        let revision = backend.patch(model, &id, patch.clone(), expected, txn)?;
        let entry = ChangeEntry::new(txn.id(), revision.clone(), &id, Action::Patch, patch.clone());
        backend.append_change(model, entry, txn)?;
        debug!(
            model = %model.name,
            id = %id,
            property = prop.map(|p| p.place.as_str()),
            "patch staged"
        );
        let mut row = identity(&id, Some(&revision));
        row.extend(patch);
        Ok(WriteOutcome {
            model: model.id,
            action: Action::Patch,
            id: Some(id),
            revision: Some(revision),
            row,
            changed: true,
        })
    }

    fn delete(
        &self,
        backend: &dyn Backend,
        txn: &mut Transaction,
        model: &Model,
        item: DataItem,
    ) -> CoreResult<WriteOutcome> {
        let saved = item.saved.unwrap_or_default();
        let id = saved_id(&saved)?;
        let expected = saved.get("_revision").and_then(Value::as_str);
        let revision = backend.delete(model, &id, expected, txn)?;
        let entry = ChangeEntry::new(txn.id(), revision.clone(), &id, Action::Delete, Row::new());
        backend.append_change(model, entry, txn)?;
        debug!(model = %model.name, id = %id, "delete staged");
        Ok(WriteOutcome {
            model: model.id,
            action: Action::Delete,
            row: identity(&id, None),
            id: Some(id),
            revision: Some(revision),
            changed: true,
        })
    }
}

fn saved_id(saved: &Row) -> CoreResult<String> {
    saved
        .get("_id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| CoreError::internal("stored row has no _id"))
}

fn unchanged(model: &Model, id: &str, saved: &Row, mut row: Row) -> WriteOutcome {
    let revision = saved
        .get("_revision")
        .and_then(Value::as_str)
        .map(Revision::new);
    row.extend(identity(id, revision.as_ref()));
    WriteOutcome {
        model: model.id,
        action: Action::Patch,
        id: Some(id.to_string()),
        revision,
        row,
        changed: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::memory::MemoryBackend;
    use crate::config::Config;
    use crate::manifest::load::load_yaml_str;
    use crate::ufunc::builtins;
    use datagate_storage::InMemoryStore;
    use serde_json::json;

    const DOCS: &str = r"
type: model
name: City
properties:
  code: {type: string, unique: true}
  name: {type: string}
---
type: model
name: report
properties:
  status: {type: string, required: true}
  count: {type: integer}
  notes:
    type: array
    items:
      type: object
      properties:
        note: {type: string}
  city: {type: ref, model: City, refprops: [code]}
  doc: {type: file}
  meta:
    type: object
    properties:
      a: {type: string}
      b: {type: string}
";

    struct Fixture {
        manifest: Manifest,
        backends: BTreeMap<String, Arc<dyn Backend>>,
        funcs: FuncRegistry,
    }

    impl Fixture {
        fn new() -> Self {
            let manifest = load_yaml_str(DOCS).unwrap();
            let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new("default"));
            backend.bootstrap(&manifest).unwrap();
            let mut backends = BTreeMap::new();
            backends.insert("default".to_string(), backend);
            Self {
                manifest,
                backends,
                funcs: builtins().unwrap(),
            }
        }

        fn writer(&self) -> Writer<'_> {
            Writer::new(&self.manifest, &self.backends, &self.funcs)
        }

        fn model(&self, name: &str) -> &Model {
            self.manifest.model_by_name(name).unwrap()
        }

        fn item(&self, model: &str, action: Action, payload: Value) -> DataItem {
            DataItem::new(self.model(model).id, action, payload.as_object().cloned().unwrap())
        }

        fn get(&self, model: &str, id: &str) -> CoreResult<Row> {
            let backend = &self.backends["default"];
            let txn = backend.begin(false).unwrap();
            backend.get_one(&self.manifest, self.model(model), id, &txn)
        }

        fn changes(&self, model: &str) -> Vec<ChangeEntry> {
            self.backends["default"]
                .changes(self.model(model), 0, None)
                .unwrap()
        }
    }

    #[test]
    fn insert_fills_defaults_and_logs_the_change() {
        let f = Fixture::new();
        let out = f
            .writer()
            .write(f.item("report", Action::Insert, json!({"status": "ok", "count": 42})))
            .unwrap();
        let id = out.id.clone().unwrap();
        let stored = f.get("report", &id).unwrap();
        assert_eq!(stored["notes"], json!([]));
        assert_eq!(stored["city"], Value::Null);
        assert_eq!(stored["_revision"], out.row["_revision"]);
        assert_eq!(out.revision.unwrap().as_str(), stored["_revision"]);

        let changes = f.changes("report");
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].op, Action::Insert);
        assert_eq!(changes[0].diff["count"], 42);
    }

    #[test]
    fn stale_revisions_conflict() {
        let f = Fixture::new();
        let out = f
            .writer()
            .write(f.item("report", Action::Insert, json!({"status": "ok"})))
            .unwrap();
        let id = out.id.unwrap();
        let current = out.row["_revision"].clone();

        let bogus = f
            .item("report", Action::Patch, json!({"_revision": "bogus", "count": 1}))
            .with_id(&id);
        let err = f.writer().write(bogus).unwrap_err();
        assert_eq!(err.code(), "ConflictingValue");
        assert_eq!(err.status(), 409);
        let ctx = err.context();
        assert_eq!(ctx["given"], "bogus");
        assert_eq!(ctx["expected"], current);
        assert_eq!(ctx["model"], "report");

        let missing = f.item("report", Action::Patch, json!({"count": 1})).with_id(&id);
        assert_eq!(f.writer().write(missing).unwrap_err().code(), "NoItemRevision");

        let ok = f
            .item("report", Action::Patch, json!({"_revision": current, "count": 2}))
            .with_id(&id);
        let patched = f.writer().write(ok).unwrap();
        assert_eq!(patched.row["count"], 2);
        assert!(patched.row.get("status").is_none());
        assert_eq!(f.get("report", &id).unwrap()["_revision"], patched.row["_revision"]);
        assert_eq!(f.changes("report").len(), 2);
    }

    #[test]
    fn empty_patches_change_nothing() {
        let f = Fixture::new();
        let out = f
            .writer()
            .write(f.item("report", Action::Insert, json!({"status": "ok"})))
            .unwrap();
        let same = f
            .item("report", Action::Patch, json!({"_revision": out.row["_revision"], "status": "ok"}))
            .with_id(out.id.unwrap());
        let result = f.writer().write(same).unwrap();
        assert!(!result.changed);
        assert_eq!(f.changes("report").len(), 1);
    }

    #[test]
    fn nested_objects_merge_on_patch() {
        let f = Fixture::new();
        let out = f
            .writer()
            .write(f.item("report", Action::Insert, json!({"status": "ok", "meta": {"a": "x", "b": "y"}})))
            .unwrap();
        let id = out.id.unwrap();
        let patch = f
            .item("report", Action::Patch, json!({"_revision": out.row["_revision"], "meta": {"b": "z"}}))
            .with_id(&id);
        f.writer().write(patch).unwrap();
        assert_eq!(f.get("report", &id).unwrap()["meta"], json!({"a": "x", "b": "z"}));
    }

    #[test]
    fn validation_errors_are_collected() {
        let f = Fixture::new();
        let err = f
            .writer()
            .write(f.item("report", Action::Insert, json!({"colour": "red", "count": "many"})))
            .unwrap_err();
        let CoreError::Multiple(errors) = &err else {
            panic!("expected several errors, got {err:?}");
        };
        let codes: Vec<&str> = errors.iter().map(CoreError::code).collect();
        assert_eq!(codes, vec!["FieldNotInResource", "InvalidValue"]);

        let err = f
            .writer()
            .write(f.item("report", Action::Insert, json!({"count": 1})))
            .unwrap_err();
        assert_eq!(err.code(), "RequiredProperty");
    }

    #[test]
    fn refs_resolve_through_refprops() {
        let f = Fixture::new();
        let city = f
            .writer()
            .write(f.item("City", Action::Insert, json!({"code": "vln", "name": "Vilnius"})))
            .unwrap();
        let out = f
            .writer()
            .write(f.item("report", Action::Insert, json!({"status": "ok", "city": "vln"})))
            .unwrap();
        assert_eq!(out.row["city"], json!({"_id": city.id.unwrap()}));

        let err = f
            .writer()
            .write(f.item("report", Action::Insert, json!({"status": "ok", "city": "kns"})))
            .unwrap_err();
        assert_eq!(err.code(), "ItemDoesNotExist");
        assert_eq!(err.context()["model"], "City");
    }

    #[test]
    fn unique_values_are_enforced_across_a_batch() {
        let f = Fixture::new();
        let items = vec![
            f.item("City", Action::Insert, json!({"code": "vln"})),
            f.item("City", Action::Insert, json!({"code": "vln"})),
        ];
        let err = f.writer().write_batch(items).unwrap_err();
        assert_eq!(err.code(), "UniqueConstraint");
        assert!(f.changes("City").is_empty());
    }

    #[test]
    fn batches_share_one_transaction() {
        let f = Fixture::new();
        let items = vec![
            f.item("City", Action::Insert, json!({"code": "a"})),
            f.item("City", Action::Insert, json!({"code": "b"})),
        ];
        let outs = f.writer().write_batch(items).unwrap();
        assert_eq!(outs.len(), 2);
        let changes = f.changes("City");
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].txn, changes[1].txn);
        assert!(changes[0].change < changes[1].change);
    }

    #[test]
    fn upsert_by_where_inserts_then_patches() {
        let f = Fixture::new();
        let payload = json!({"_where": "code=\"vln\"", "code": "vln", "name": "Vilnius"});
        let first = f
            .writer()
            .write(f.item("City", Action::Upsert, payload.clone()))
            .unwrap();
        assert_eq!(first.action, Action::Insert);
        let second = f
            .writer()
            .write(f.item("City", Action::Upsert, json!({"_where": "code=\"vln\"", "name": "Vilna"})))
            .unwrap();
        assert_eq!(second.action, Action::Patch);
        assert_eq!(second.id, first.id);
        assert_eq!(f.get("City", &first.id.unwrap()).unwrap()["name"], "Vilna");
    }

    #[test]
    fn delete_logs_and_removes() {
        let f = Fixture::new();
        let out = f
            .writer()
            .write(f.item("City", Action::Insert, json!({"code": "a"})))
            .unwrap();
        let id = out.id.unwrap();
        let delete = f
            .item("City", Action::Delete, json!({"_revision": out.row["_revision"]}))
            .with_id(&id);
        let deleted = f.writer().write(delete).unwrap();
        assert_eq!(deleted.row, identity(&id, None));
        assert_eq!(f.get("City", &id).unwrap_err().code(), "ItemDoesNotExist");
        let ops: Vec<Action> = f.changes("City").iter().map(|c| c.op).collect();
        assert_eq!(ops, vec![Action::Insert, Action::Delete]);
    }

    #[test]
    fn meta_fields_need_their_scope() {
        let f = Fixture::new();
        let config = Config::new();
        let caller = Caller::new("app", vec!["datagate_insert".to_string()], &config);
        let item = f.item("City", Action::Insert, json!({"_id": "fixed", "code": "a"}));
        let err = f.writer().caller(&caller).write(item.clone()).unwrap_err();
        assert_eq!(err.code(), "InsufficientScope");

        let admin = Caller::new(
            "admin",
            vec!["datagate_insert".to_string(), "datagate_set_meta_fields".to_string()],
            &config,
        );
        let out = f.writer().caller(&admin).write(item).unwrap();
        assert_eq!(out.id.as_deref(), Some("fixed"));
    }

    #[test]
    fn file_contents_go_to_the_blob_store() {
        let f = Fixture::new();
        let blobs: Blobs = BlobStore::open(Box::new(InMemoryStore::new()) as Box<dyn ByteStore>).unwrap();
        let payload = json!({
            "status": "ok",
            "doc": {"_id": "a.txt", "_content_type": "text/plain", "_content": STANDARD.encode("hello")},
        });
        let out = f
            .writer()
            .blobs(&blobs)
            .write(f.item("report", Action::Insert, payload))
            .unwrap();
        let doc = &out.row["doc"];
        assert!(doc.get("_content").is_none());
        assert_eq!(doc["_size"], 5);
        let blob = doc["_blob"].as_str().unwrap().parse().unwrap();
        assert_eq!(blobs.get(&blob).unwrap().unwrap(), b"hello");

        let bad = json!({"status": "ok", "doc": {"_id": "../etc/passwd"}});
        let err = f
            .writer()
            .blobs(&blobs)
            .write(f.item("report", Action::Insert, bad))
            .unwrap_err();
        assert_eq!(err.code(), "UnacceptableFileName");
    }

    #[test]
    fn file_reference_updates_keep_the_content() {
        let f = Fixture::new();
        let blobs: Blobs = BlobStore::open(Box::new(InMemoryStore::new()) as Box<dyn ByteStore>).unwrap();
        let payload = json!({
            "status": "ok",
            "doc": {"_id": "a.txt", "_content_type": "text/plain", "_content": STANDARD.encode("hi")},
        });
        let out = f
            .writer()
            .blobs(&blobs)
            .write(f.item("report", Action::Insert, payload))
            .unwrap();
        let id = out.id.unwrap();
        let doc = f.manifest.property_by_place(f.model("report").id, "doc").unwrap();
        let rename = f
            .item("report", Action::Patch, json!({"_revision": out.row["_revision"], "_id": "b.txt"}))
            .with_id(&id)
            .with_prop(doc.id, true);
        f.writer().blobs(&blobs).write(rename).unwrap();
        let stored = f.get("report", &id).unwrap();
        assert_eq!(stored["doc"]["_id"], "b.txt");
        assert_eq!(stored["doc"]["_size"], 2);
    }

    #[test]
    fn wipe_clears_rows() {
        let f = Fixture::new();
        let out = f
            .writer()
            .write(f.item("City", Action::Insert, json!({"code": "a"})))
            .unwrap();
        f.writer()
            .write(f.item("City", Action::Wipe, json!({})))
            .unwrap();
        assert_eq!(f.get("City", &out.id.unwrap()).unwrap_err().code(), "ItemDoesNotExist");
        assert!(f.changes("City").is_empty());
    }
}
