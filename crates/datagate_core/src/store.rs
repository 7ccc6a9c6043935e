//! Request facade.
//!
//! A [`Store`] owns a linked manifest, its backends, the blob store for
//! file contents and the authenticator. [`Store::handle`] maps requests of
//! the URL surface onto the read and write pipelines.
//!
//! ```rust,ignore
//! let store = Store::builder(Config::new().set("manifest.type", "yaml").set("manifest.path", "manifest"))
//!     .open()?;
//! store.bootstrap()?;
//!
//! let created = store.handle(Request::post("/report", json!({"status": "ok"})));
//! assert_eq!(created.status, 201);
//! ```

use crate::auth::{scope_name, Authenticator, Caller};
use crate::backends::memory::MemoryBackend;
use crate::backends::tabular::{CsvSource, TabularBackend};
use crate::backends::{backend_models, Backend};
use crate::config::{BackendKind, Config, ManifestKind};
use crate::dtype::DType;
use crate::error::{CoreError, CoreResult, ErrorKind, ErrorReport};
use crate::format::Format;
use crate::manifest::{load_manifest, Manifest, Model, Property};
use crate::migration::{plan_migration, SchemaAction, VersionChain};
use crate::result::ResultBuilder;
use crate::stream::{as_is, CancelToken, ChunkedStream};
use crate::types::{Action, PropertyId, Row};
use crate::ufunc::{builtins, resolve_query, CmpOp, Column, Cond, Env, FuncRegistry, Query};
use crate::urlparams::{parse_request_path, PathTarget, PathVerb, RequestPath};
use crate::write::{Blobs, DataItem, WriteOutcome, Writer};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use datagate_storage::{BlobId, BlobStore, ByteStore, FileStore, InMemoryStore};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const ALL_ACTIONS: [Action; 10] = [
    Action::Insert,
    Action::Upsert,
    Action::Update,
    Action::Patch,
    Action::Delete,
    Action::Wipe,
    Action::Getone,
    Action::Getall,
    Action::Search,
    Action::Changes,
];

/// Name of the backend used when none is configured.
pub const DEFAULT_BACKEND: &str = "default";

/// HTTP method of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

/// A transport-neutral request.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// Method.
    pub method: Method,
    /// Path, percent-encoded.
    pub path: String,
    /// Query string without the leading `?`, percent-encoded.
    pub query: String,
    /// Headers with lowercase names.
    pub headers: BTreeMap<String, String>,
    /// Raw body.
    pub body: Vec<u8>,
}

impl Request {
    /// A request without query, headers or body.
    #[must_use]
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        let path = path.into();
        let (path, query) = match path.split_once('?') {
            Some((p, q)) => (p.to_string(), q.to_string()),
            None => (path, String::new()),
        };
        Self {
            method,
            path,
            query,
            headers: BTreeMap::new(),
            body: Vec::new(),
        }
    }

    /// `GET path`; a `?query` suffix is split off.
    #[must_use]
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    /// `POST path` with a JSON body.
    #[must_use]
    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::Post, path).json(&body)
    }

    /// `PUT path` with a JSON body.
    #[must_use]
    pub fn put(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::Put, path).json(&body)
    }

    /// `PATCH path` with a JSON body.
    #[must_use]
    pub fn patch(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::Patch, path).json(&body)
    }

    /// `DELETE path` with a JSON body, usually `{_revision}`.
    #[must_use]
    pub fn delete(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::Delete, path).json(&body)
    }

    /// Sets a header.
    #[must_use]
    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// Sets a JSON body and its content headers.
    #[must_use]
    pub fn json(self, body: &Value) -> Self {
        let bytes = body.to_string().into_bytes();
        self.body(bytes, "application/json")
    }

    /// Sets a raw body and its content headers.
    #[must_use]
    pub fn body(mut self, body: Vec<u8>, content_type: &str) -> Self {
        self.headers
            .insert("content-length".into(), body.len().to_string());
        self.headers
            .insert("content-type".into(), content_type.to_string());
        self.body = body;
        self
    }

    fn header_value(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    fn content_type(&self) -> &str {
        self.header_value("content-type")
            .and_then(|v| v.split(';').next())
            .map_or("application/json", str::trim)
    }

    fn json_body(&self) -> CoreResult<Row> {
        if self.body.is_empty() {
            return Ok(Row::new());
        }
        if self.content_type() != "application/json" {
            return Err(ErrorKind::UnsupportedMediaType
                .err()
                .with("given", self.content_type())
                .into());
        }
        match serde_json::from_slice(&self.body)? {
            Value::Object(map) => Ok(map),
            other => Err(ErrorKind::ObjectTypeError
                .err()
                .with("value", other)
                .into()),
        }
    }
}

/// A response.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// HTTP status.
    pub status: u16,
    /// Media type of the body.
    pub content_type: String,
    /// Body bytes.
    pub body: Vec<u8>,
}

impl Response {
    fn json(status: u16, body: &Value) -> Self {
        Self {
            status,
            content_type: Format::Json.content_type().to_string(),
            body: body.to_string().into_bytes(),
        }
    }

    fn rendered(status: u16, format: Format, body: String) -> Self {
        Self {
            status,
            content_type: format.content_type().to_string(),
            body: body.into_bytes(),
        }
    }

    fn error(err: &CoreError) -> Self {
        Self::json(err.status(), &ErrorReport::from_error(err).to_json())
    }

    /// Body as text.
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Body parsed as JSON, `null` when empty.
    ///
    /// # Errors
    ///
    /// Returns a JSON error for non-JSON bodies.
    pub fn to_json(&self) -> CoreResult<Value> {
        if self.body.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// Builds a [`Store`].
pub struct StoreBuilder {
    config: Config,
    manifest: Option<Manifest>,
    backends: BTreeMap<String, Arc<dyn Backend>>,
    blobs: Option<Blobs>,
}

impl StoreBuilder {
    /// Uses an already linked manifest instead of the configured source.
    #[must_use]
    pub fn manifest(mut self, manifest: Manifest) -> Self {
        self.manifest = Some(manifest);
        self
    }

    /// Adds a backend; it replaces a configured backend of the same name.
    /// SQL and document backends need this since their drivers live outside
    /// the crate.
    #[must_use]
    pub fn backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backends.insert(backend.name().to_string(), backend);
        self
    }

    /// Stores file contents in `blobs`.
    #[must_use]
    pub fn blobs(mut self, blobs: Blobs) -> Self {
        self.blobs = Some(blobs);
        self
    }

    /// Creates configured backends, loads and links the manifest.
    ///
    /// # Errors
    ///
    /// [`CoreError::Config`] for unknown backend types, SQL or document
    /// backends without a driver, and models on unconfigured backends.
    /// Manifest errors from loading and linking.
    pub fn open(self) -> CoreResult<Store> {
        let Self {
            config,
            manifest,
            mut backends,
            blobs,
        } = self;

        for (name, settings) in config.backends()? {
            if backends.contains_key(&name) {
                continue;
            }
            let backend: Arc<dyn Backend> = match settings.kind {
                BackendKind::Memory => Arc::new(MemoryBackend::new(&name)),
                BackendKind::Tabular => {
                    let root = settings.dsn.unwrap_or_else(|| ".".to_string());
                    Arc::new(TabularBackend::new(&name, Arc::new(CsvSource::new(root))))
                }
                BackendKind::Sql | BackendKind::Document => {
                    return Err(CoreError::config(format!(
                        "backend {name} needs a driver; add it with StoreBuilder::backend"
                    )));
                }
            };
            backends.insert(name, backend);
        }
        if backends.is_empty() {
            backends.insert(
                DEFAULT_BACKEND.to_string(),
                Arc::new(MemoryBackend::new(DEFAULT_BACKEND)),
            );
        }

        let manifest = match manifest {
            Some(manifest) => manifest,
            None => {
                let source = config.manifest_source()?;
                let docs = if source.kind == ManifestKind::Backend {
                    let backend = backends.get(DEFAULT_BACKEND).ok_or_else(|| {
                        CoreError::config("manifest.type backend needs a default backend")
                    })?;
                    Some(backend.load_manifest_docs()?)
                } else {
                    None
                };
                load_manifest(&source, docs)?
            }
        };
        for name in manifest.backend_names() {
            if !backends.contains_key(name) {
                return Err(CoreError::config(format!("backend {name} is not configured")));
            }
        }

        let blobs = match blobs {
            Some(blobs) => blobs,
            None => open_blobs(&config)?,
        };
        let store = Store {
            auth: Authenticator::new(&config),
            funcs: builtins()?,
            config,
            manifest,
            backends,
            blobs,
        };
        info!(
            models = store.manifest.models().count(),
            backends = store.backends.len(),
            "store opened"
        );
        Ok(store)
    }
}

fn open_blobs(config: &Config) -> CoreResult<Blobs> {
    let store: Box<dyn ByteStore> = match config.get_str("files.path") {
        Some(path) => Box::new(FileStore::open_with_create_dirs(Path::new(path))?),
        None => Box::new(InMemoryStore::new()),
    };
    Ok(BlobStore::open(store)?)
}

/// Manifest, backends, blobs and auth wired together.
pub struct Store {
    config: Config,
    manifest: Manifest,
    backends: BTreeMap<String, Arc<dyn Backend>>,
    funcs: FuncRegistry,
    blobs: Blobs,
    auth: Authenticator,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("models", &self.manifest.models().count())
            .field("backends", &self.backends.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Starts building a store from `config`.
    #[must_use]
    pub fn builder(config: Config) -> StoreBuilder {
        StoreBuilder {
            config,
            manifest: None,
            backends: BTreeMap::new(),
            blobs: None,
        }
    }

    /// Opens a store for `manifest` on one in-memory backend. Requests
    /// without credentials act as a client holding every scope.
    ///
    /// # Errors
    ///
    /// Fails when the manifest references other backends.
    pub fn in_memory(manifest: Manifest) -> CoreResult<Self> {
        let base = Config::new();
        let prefix = base.scope_prefix().to_string();
        let mut scopes: Vec<String> = ALL_ACTIONS
            .iter()
            .map(|action| scope_name(&prefix, base.scope_max_length(), "", *action))
            .collect();
        scopes.push(format!("{prefix}set_meta_fields"));
        let config = base
            .set("default_auth_client", "default")
            .set("clients.default.scopes", json!(scopes));
        Self::builder(config).manifest(manifest).open()
    }

    /// The configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The linked manifest.
    #[must_use]
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// The blob store holding file contents.
    #[must_use]
    pub fn blobs(&self) -> &Blobs {
        &self.blobs
    }

    /// A backend by name.
    ///
    /// # Errors
    ///
    /// [`CoreError::Config`] for unknown names.
    pub fn backend(&self, name: &str) -> CoreResult<&Arc<dyn Backend>> {
        self.backends
            .get(name)
            .ok_or_else(|| CoreError::config(format!("backend {name} is not configured")))
    }

    fn backend_of(&self, model: &Model) -> CoreResult<&Arc<dyn Backend>> {
        self.backend(&model.backend)
    }

    /// Waits until every backend answers, up to its configured timeout.
    #[must_use]
    pub fn wait(&self) -> bool {
        let timeouts = self.config.backends().unwrap_or_default();
        self.backends.iter().all(|(name, backend)| {
            let timeout = timeouts
                .get(name)
                .map_or(Duration::from_secs(30), |b| b.timeout);
            let ready = backend.wait(timeout);
            if !ready {
                warn!(backend = %name, "backend not ready");
            }
            ready
        })
    }

    /// Creates the tables of every model; with a `backend` manifest source
    /// the manifest documents are saved too.
    ///
    /// # Errors
    ///
    /// Backend failures.
    pub fn bootstrap(&self) -> CoreResult<()> {
        for (name, backend) in &self.backends {
            backend.bootstrap(&self.manifest)?;
            info!(backend = %name, "bootstrapped");
        }
        if self.config.manifest_source()?.kind == ManifestKind::Backend {
            let docs = self.manifest.to_docs().to_values();
            self.backend(DEFAULT_BACKEND)?.save_manifest_docs(&docs)?;
        }
        Ok(())
    }

    /// Schema actions each writable backend needs to match the manifest.
    ///
    /// # Errors
    ///
    /// `MultipleParentsError` when a model has several version heads, and
    /// backend failures reading the current schema.
    pub fn plan_migrations(&self) -> CoreResult<BTreeMap<String, Vec<SchemaAction>>> {
        for model in self.manifest.models() {
            VersionChain::new(model).head()?;
        }
        let mut plans = BTreeMap::new();
        for (name, backend) in &self.backends {
            if backend.read_only() {
                continue;
            }
            let current = backend.schema()?;
            let actions = plan_migration(&self.manifest, backend_models(&self.manifest, name), &current);
            plans.insert(name.clone(), actions);
        }
        Ok(plans)
    }

    /// Applies [`plan_migrations`](Self::plan_migrations).
    ///
    /// # Errors
    ///
    /// As `plan_migrations`, plus failed schema changes.
    pub fn migrate(&self) -> CoreResult<BTreeMap<String, Vec<SchemaAction>>> {
        let plans = self.plan_migrations()?;
        for (name, actions) in &plans {
            if actions.is_empty() {
                continue;
            }
            self.backend(name)?.migrate(&self.manifest, actions)?;
            info!(backend = %name, actions = actions.len(), "migrated");
        }
        Ok(plans)
    }

    /// A writer acting as `caller`.
    #[must_use]
    pub fn writer<'a>(&'a self, caller: &'a Caller) -> Writer<'a> {
        Writer::new(&self.manifest, &self.backends, &self.funcs)
            .caller(caller)
            .blobs(&self.blobs)
    }

    /// The caller a request authenticates as.
    ///
    /// # Errors
    ///
    /// Authentication errors.
    pub fn caller(&self, request: &Request) -> CoreResult<Caller> {
        self.auth.authenticate(request.header_value("authorization"))
    }

    /// Resolves a read of `model`.
    ///
    /// # Errors
    ///
    /// Scope, resolution and expression errors.
    pub fn query(
        &self,
        caller: &Caller,
        model: &Model,
        action: Action,
        expr: Option<&datagate_expr::Node>,
    ) -> CoreResult<Query> {
        caller.authorize(model, None, action)?;
        let backend = self.backend_of(model)?;
        let params = BTreeMap::new();
        let env = Env {
            manifest: &self.manifest,
            model,
            family: backend.family(),
            caller: Some(caller),
            action,
            funcs: &self.funcs,
            params: &params,
        };
        let query = resolve_query(&env, expr)?;
        debug!(model = %model.name, action = %action, "query resolved");
        Ok(query)
    }

    /// Streams the rows of a resolved query rendered as `format`.
    ///
    /// # Errors
    ///
    /// Backend errors starting the read, `UnsupportedMediaType` for formats
    /// that cannot be streamed.
    pub fn stream<'a>(
        &'a self,
        model: &'a Model,
        query: Query,
        format: Format,
        cancel: CancelToken,
    ) -> CoreResult<ChunkedStream<'a>> {
        let backend = self.backend_of(model)?;
        let txn = backend.begin(false)?;
        let rows = backend.execute(&self.manifest, &query, &txn)?;
        let builder = ResultBuilder::new(&self.manifest, model, format);
        let paged = query.clone();
        Ok(ChunkedStream::new(rows, format, move |row| builder.record(&query, row))?
            .paged(&paged)
            .hold(txn)
            .cancel_token(cancel))
    }

    /// Handles one request. Errors become error responses.
    #[must_use]
    pub fn handle(&self, request: Request) -> Response {
        match self.dispatch(&request) {
            Ok(response) => response,
            Err(err) => {
                debug!(code = err.code(), status = err.status(), "request failed");
                Response::error(&err)
            }
        }
    }

    fn dispatch(&self, request: &Request) -> CoreResult<Response> {
        let path = parse_request_path(&self.manifest, &request.path, &request.query)?;
        let caller = self.caller(request)?;
        let format = path
            .format
            .unwrap_or_else(|| Format::negotiate(request.header_value("accept")));

        let model = match &path.target {
            PathTarget::Namespace(name) => return self.read_namespace(&caller, name, format),
            PathTarget::Model(id) => self.manifest.model(*id),
        };

        match (request.method, path.verb) {
            (Method::Get, Some(PathVerb::Changes(offset))) => {
                self.read_changes(&caller, model, offset, format)
            }
            (Method::Get, _) if path.id.is_some() => self.read_one(&caller, model, &path, format),
            (Method::Get, _) => {
                let action = if path.query.is_some() {
                    Action::Search
                } else {
                    Action::Getall
                };
                let query = self.query(&caller, model, action, path.query.as_ref())?;
                let body = self
                    .stream(model, query, format, CancelToken::new())?
                    .collect_string()?;
                Ok(Response::rendered(200, format, body))
            }
            (Method::Delete, Some(PathVerb::Wipe)) => {
                let item = DataItem::new(model.id, Action::Wipe, Row::new());
                self.writer(&caller).write(item)?;
                Ok(Response::json(200, &json!({ "wiped": true })))
            }
            (Method::Post, None) if path.id.is_none() => self.post(&caller, model, request),
            (method, None) if path.id.is_some() => {
                let action = match method {
                    Method::Put => Action::Update,
                    Method::Patch => Action::Patch,
                    Method::Delete => Action::Delete,
                    _ => {
                        return Err(ErrorKind::UnknownMethod
                            .err()
                            .with("name", format!("{method:?}").to_uppercase())
                            .into())
                    }
                };
                self.rewrite(&caller, model, &path, action, request)
            }
            (method, _) => Err(ErrorKind::UnknownMethod
                .err()
                .with("name", format!("{method:?}").to_uppercase())
                .into()),
        }
    }

    fn id_filter(&self, model: &Model, query: &mut Query, id: &str) -> CoreResult<()> {
        let prop = self.manifest.property_by_place(model.id, "_id")?;
        let by_id = Cond::Compare {
            column: Column::of(prop),
            op: CmpOp::Eq,
            value: Value::from(id),
        };
        let mut conds = vec![by_id];
        conds.extend(query.filter.take());
        query.filter = Cond::all(conds);
        Ok(())
    }

    fn read_one(&self, caller: &Caller, model: &Model, path: &RequestPath, format: Format) -> CoreResult<Response> {
        let id = path.id.as_deref().unwrap_or_default();
        let mut query = self.query(caller, model, Action::Getone, path.query.as_ref())?;
        self.id_filter(model, &mut query, id)?;
        let backend = self.backend_of(model)?;
        let txn = backend.begin(false)?;
        let row = backend
            .execute(&self.manifest, &query, &txn)?
            .next()
            .transpose()?
            .ok_or_else(|| {
                CoreError::from(
                    ErrorKind::ItemDoesNotExist
                        .err()
                        .model(&model.name)
                        .with("id", id),
                )
            })?;

        let builder = ResultBuilder::new(&self.manifest, model, format);
        if let Some(prop_id) = path.prop {
            let prop = self.subresource(model, prop_id)?;
            caller.authorize(model, Some(prop), Action::Getone)?;
            let value = row.get(&prop.name).cloned().unwrap_or(Value::Null);
            if matches!(prop.dtype, DType::File) && !path.ref_only {
                return self.file_content(model, prop, &value);
            }
            let mut out = Row::new();
            out.insert("_id".into(), row.get("_id").cloned().unwrap_or(Value::Null));
            out.insert(
                "_revision".into(),
                row.get("_revision").cloned().unwrap_or(Value::Null),
            );
            let mut one = Row::new();
            one.insert(prop.name.clone(), value);
            out.extend(builder.write_record(&one)?);
            return Ok(Response::json(200, &Value::Object(out)));
        }

        let record = builder.record(&query, &row)?;
        if format == Format::Json {
            return Ok(Response::json(200, &Value::Object(record)));
        }
        let body = ChunkedStream::new(Box::new(std::iter::once(Ok::<Row, CoreError>(record))), format, as_is)?
            .collect_string()?;
        Ok(Response::rendered(200, format, body))
    }

    /// Only files and objects are addressable below a row.
    fn subresource(&self, model: &Model, prop: PropertyId) -> CoreResult<&Property> {
        let prop = self.manifest.property(prop);
        if matches!(prop.dtype, DType::File | DType::Object(_)) {
            return Ok(prop);
        }
        Err(ErrorKind::UnavailableSubresource
            .err()
            .model(&model.name)
            .property(&prop.place)
            .into())
    }

    fn file_content(&self, model: &Model, prop: &Property, value: &Value) -> CoreResult<Response> {
        let missing = || {
            CoreError::from(
                ErrorKind::FileNotFound
                    .err()
                    .model(&model.name)
                    .property(&prop.place)
                    .with("file", value.get("_id").cloned().unwrap_or(Value::Null)),
            )
        };
        let blob = value
            .get("_blob")
            .and_then(Value::as_str)
            .ok_or_else(missing)?
            .parse::<BlobId>()?;
        let content = self.blobs.get(&blob)?.ok_or_else(missing)?;
        let content_type = value
            .get("_content_type")
            .and_then(Value::as_str)
            .unwrap_or("application/octet-stream");
        Ok(Response {
            status: 200,
            content_type: content_type.to_string(),
            body: content,
        })
    }

    fn read_changes(&self, caller: &Caller, model: &Model, offset: Option<i64>, format: Format) -> CoreResult<Response> {
        caller.authorize(model, None, Action::Changes)?;
        let entries = self.backend_of(model)?.changes(model, offset.unwrap_or(0), None)?;
        let builder = ResultBuilder::new(&self.manifest, model, format);
        let rows: Vec<Row> = entries
            .iter()
            .map(|entry| builder.change_record(entry, |prop| caller.can(model, Some(prop), Action::Changes)))
            .collect::<CoreResult<_>>()?;
        self.render_rows(rows, format)
    }

    fn read_namespace(&self, caller: &Caller, namespace: &str, format: Format) -> CoreResult<Response> {
        let mut records = Vec::new();
        for model in self.manifest.models_under(namespace) {
            if !caller.can(model, None, Action::Getall) {
                continue;
            }
            let query = self.query(caller, model, Action::Getall, None)?;
            let backend = self.backend_of(model)?;
            let txn = backend.begin(false)?;
            let builder = ResultBuilder::new(&self.manifest, model, format);
            for row in backend.execute(&self.manifest, &query, &txn)? {
                records.push(builder.record(&query, &row?)?);
            }
        }
        self.render_rows(records, format)
    }

    fn render_rows(&self, rows: Vec<Row>, format: Format) -> CoreResult<Response> {
        let body = ChunkedStream::new(Box::new(rows.into_iter().map(Ok::<Row, CoreError>)), format, as_is)?
            .collect_string()?;
        Ok(Response::rendered(200, format, body))
    }

    fn post(&self, caller: &Caller, model: &Model, request: &Request) -> CoreResult<Response> {
        let mut body = request.json_body()?;
        let Some(data) = body.remove("_data") else {
            let outcome = self.writer(caller).write(DataItem::new(model.id, Action::Insert, body))?;
            return Ok(Response::json(201, &self.outcome_record(&outcome)?));
        };
        let Value::Array(data) = data else {
            return Err(ErrorKind::ArrayTypeError
                .err()
                .property("_data")
                .into());
        };
        let items = data
            .into_iter()
            .map(|item| self.batch_item(model, item))
            .collect::<CoreResult<Vec<_>>>()?;
        let outcomes = self.writer(caller).write_batch(items)?;
        let records: Vec<Value> = outcomes
            .iter()
            .map(|o| self.outcome_record(o))
            .collect::<CoreResult<_>>()?;
        Ok(Response::json(200, &json!({ "_data": records })))
    }

    fn batch_item(&self, default: &Model, item: Value) -> CoreResult<DataItem> {
        let Value::Object(mut payload) = item else {
            return Err(ErrorKind::ObjectTypeError.err().with("value", item).into());
        };
        let model = match payload.remove("_type") {
            Some(Value::String(name)) => self.manifest.model_by_name(&name)?,
            _ => default,
        };
        let action: Action = match payload.remove("_op") {
            Some(Value::String(op)) => op.parse()?,
            _ => Action::Insert,
        };
        if !action.is_write() {
            return Err(ErrorKind::UnknownAction
                .err()
                .with("action", action.as_str())
                .into());
        }
        let id = payload
            .get("_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .filter(|_| action != Action::Insert);
        let item = DataItem::new(model.id, action, payload);
        Ok(match id {
            Some(id) => item.with_id(id),
            None => item,
        })
    }

    fn rewrite(
        &self,
        caller: &Caller,
        model: &Model,
        path: &RequestPath,
        action: Action,
        request: &Request,
    ) -> CoreResult<Response> {
        let id = path.id.clone().unwrap_or_default();
        let prop = path.prop.map(|p| self.subresource(model, p)).transpose()?;
        let mut item = match prop {
            Some(prop)
                if matches!(prop.dtype, DType::File)
                    && !path.ref_only
                    && action != Action::Delete =>
            {
                DataItem::new(model.id, action, file_upload(request)?)
            }
            _ => DataItem::new(model.id, action, request.json_body()?),
        };
        item = item.with_id(id);
        if let Some(prop) = path.prop {
            item = item.with_prop(prop, path.ref_only);
        }
        let outcome = self.writer(caller).write(item)?;
        if action == Action::Delete {
            return Ok(Response {
                status: 204,
                content_type: Format::Json.content_type().to_string(),
                body: Vec::new(),
            });
        }
        Ok(Response::json(200, &self.outcome_record(&outcome)?))
    }

    fn outcome_record(&self, outcome: &WriteOutcome) -> CoreResult<Value> {
        let model = self.manifest.model(outcome.model);
        ResultBuilder::new(&self.manifest, model, Format::Json)
            .write_record(&outcome.row)
            .map(Value::Object)
    }
}

/// Payload of a raw file upload: content from the body, type from
/// `Content-Type`, name from `Content-Disposition`, revision from the
/// `Revision` header.
fn file_upload(request: &Request) -> CoreResult<Row> {
    if request.header_value("content-length").is_none() {
        return Err(ErrorKind::ContentLengthRequired.err().into());
    }
    let mut payload = Row::new();
    if let Some(revision) = request.header_value("revision") {
        payload.insert("_revision".into(), Value::from(revision));
    }
    let name = request
        .header_value("content-disposition")
        .and_then(|h| h.split(';').find_map(|p| p.trim().strip_prefix("filename=")))
        .map(|n| n.trim_matches('"').to_string());
    if let Some(name) = name {
        payload.insert("_id".into(), Value::from(name));
    }
    payload.insert("_content_type".into(), Value::from(request.content_type()));
    payload.insert("_content".into(), Value::from(STANDARD.encode(&request.body)));
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::load::load_yaml_str;

    const DOCS: &str = r"
type: model
name: report
properties:
  status: {type: string}
  count: {type: integer}
  secret: {type: string, hidden: true}
  pdf: {type: file}
";

    fn store() -> Store {
        let store = Store::in_memory(load_yaml_str(DOCS).unwrap()).unwrap();
        store.bootstrap().unwrap();
        store
    }

    fn json(response: &Response) -> Value {
        response.to_json().unwrap()
    }

    #[test]
    fn insert_read_patch_delete() {
        let store = store();
        let created = store.handle(Request::post("/report", json!({"status": "ok", "count": 42})));
        assert_eq!(created.status, 201, "{}", created.text());
        let body = json(&created);
        let id = body["_id"].as_str().unwrap().to_string();

        let got = json(&store.handle(Request::get(format!("/report/{id}"))));
        assert_eq!(got["_revision"], body["_revision"]);
        assert_eq!(got["count"], 42);
        assert_eq!(got["_type"], "report");

        let patched = store.handle(Request::patch(
            format!("/report/{id}"),
            json!({"_revision": body["_revision"], "count": 43}),
        ));
        assert_eq!(patched.status, 200, "{}", patched.text());
        let revision = json(&patched)["_revision"].clone();

        let stale = store.handle(Request::patch(
            format!("/report/{id}"),
            json!({"_revision": body["_revision"], "count": 44}),
        ));
        assert_eq!(stale.status, 409);
        assert_eq!(json(&stale)["errors"][0]["code"], "ConflictingValue");

        let deleted = store.handle(Request::delete(format!("/report/{id}"), json!({"_revision": revision})));
        assert_eq!(deleted.status, 204);
        assert_eq!(store.handle(Request::get(format!("/report/{id}"))).status, 404);

        let changes = json(&store.handle(Request::get("/report/:changes")));
        let ops: Vec<&str> = changes["_data"]
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["_op"].as_str().unwrap())
            .collect();
        assert_eq!(ops, vec!["insert", "patch", "delete"]);
    }

    #[test]
    fn batches_take_per_item_ops() {
        let store = store();
        let response = store.handle(Request::post(
            "/report",
            json!({"_data": [
                {"_op": "insert", "status": "a"},
                {"_op": "insert", "status": "b"},
            ]}),
        ));
        assert_eq!(response.status, 200, "{}", response.text());
        assert_eq!(json(&response)["_data"].as_array().unwrap().len(), 2);

        let listed = json(&store.handle(Request::get("/report?sort(status)")));
        let statuses: Vec<&str> = listed["_data"]
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["status"].as_str().unwrap())
            .collect();
        assert_eq!(statuses, vec!["a", "b"]);
    }

    #[test]
    fn files_upload_and_download() {
        let store = store();
        let created = json(&store.handle(Request::post("/report", json!({"status": "ok"}))));
        let id = created["_id"].as_str().unwrap();

        let upload = Request::new(Method::Put, format!("/report/{id}/pdf"))
            .body(b"%PDF-1.7".to_vec(), "application/pdf")
            .header("revision", created["_revision"].as_str().unwrap())
            .header("content-disposition", "attachment; filename=\"report.pdf\"");
        let uploaded = store.handle(upload);
        assert_eq!(uploaded.status, 200, "{}", uploaded.text());

        let download = store.handle(Request::get(format!("/report/{id}/pdf")));
        assert_eq!(download.status, 200);
        assert_eq!(download.content_type, "application/pdf");
        assert_eq!(download.body, b"%PDF-1.7");

        let meta = json(&store.handle(Request::get(format!("/report/{id}/pdf:ref"))));
        assert_eq!(meta["pdf"], json!({"_id": "report.pdf", "_content_type": "application/pdf"}));

        let mut unsized_upload = Request::new(Method::Put, format!("/report/{id}/pdf"));
        unsized_upload.body = b"x".to_vec();
        assert_eq!(store.handle(unsized_upload).status, 411);
    }

    #[test]
    fn scalar_properties_are_not_subresources() {
        let store = store();
        let created = json(&store.handle(Request::post("/report", json!({"status": "ok"}))));
        let id = created["_id"].as_str().unwrap();

        let response = store.handle(Request::get(format!("/report/{id}/status")));
        let body = json(&response);
        assert_eq!(body["errors"][0]["code"], "UnavailableSubresource");
        assert_eq!(body["errors"][0]["context"]["property"], "status");
        assert_eq!(response.status, ErrorKind::UnavailableSubresource.status());

        let patched = store.handle(Request::patch(
            format!("/report/{id}/count"),
            json!({"_revision": created["_revision"], "count": 1}),
        ));
        assert_eq!(json(&patched)["errors"][0]["code"], "UnavailableSubresource");
    }

    #[test]
    fn formats_follow_path_and_accept() {
        let store = store();
        store.handle(Request::post("/report", json!({"status": "ok", "count": 1})));
        let csv = store.handle(Request::get("/report/:format/csv?select(status,count)"));
        assert_eq!(csv.content_type, "text/csv");
        assert_eq!(csv.text(), "status,count\nok,1\n");

        let jsonl = store.handle(Request::get("/report?select(count)").header("accept", "application/x-jsonlines"));
        assert_eq!(jsonl.text(), "{\"count\":1}\n");
    }

    #[test]
    fn errors_carry_status_and_report() {
        let store = store();
        let missing = store.handle(Request::get("/nope"));
        assert_eq!(missing.status, 404);
        assert_eq!(json(&missing)["errors"][0]["code"], "ModelNotFound");

        let invalid = store.handle(Request::post("/report", json!({"count": "many", "colour": "red"})));
        assert_eq!(invalid.status, 400);
        assert_eq!(json(&invalid)["errors"].as_array().unwrap().len(), 2);

        let text = store.handle(Request::new(Method::Post, "/report").body(b"status=ok".to_vec(), "text/plain"));
        assert_eq!(text.status, 415);
    }

    #[test]
    fn credentials_are_required_without_a_default_client() {
        let config = Config::new();
        let store = Store::builder(config)
            .manifest(load_yaml_str(DOCS).unwrap())
            .open()
            .unwrap();
        let response = store.handle(Request::get("/report"));
        assert_eq!(response.status, 401);
        assert_eq!(json(&response)["errors"][0]["code"], "MissingAuthorization");
    }

    #[test]
    fn sql_backends_need_a_driver() {
        let config = Config::new().set("backends.main.type", "sql");
        let err = Store::builder(config)
            .manifest(load_yaml_str(DOCS).unwrap())
            .open()
            .unwrap_err();
        assert_eq!(err.code(), "ConfigError");
    }
}
