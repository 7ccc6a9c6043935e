//! Sample manifests and store helpers.
//!
//! Provides ready-made stores over small manifests so tests can talk to the
//! request surface without wiring config, backends and auth by hand.

use datagate_core::auth::scope_name;
use datagate_core::{load_yaml_str, Action, Config, Request, Response, Store};
use serde_json::{json, Value};
use std::path::PathBuf;
use tempfile::TempDir;

/// A report with scalar fields, a nested array of notes, a hidden field and
/// a file.
pub const REPORT: &str = r"
type: model
name: report
properties:
  status: {type: string}
  count: {type: integer}
  revision: {type: string}
  valid_from_date: {type: date}
  notes:
    type: array
    items:
      type: object
      properties:
        note: {type: string}
        note_type: {type: string}
        create_date: {type: date}
  secret: {type: string, hidden: true}
  pdf: {type: file}
";

/// Cities keyed by `(id, name, code)`.
pub const CITIES: &str = r"
type: model
name: city
pkeys: [id, name, code]
properties:
  id: {type: integer}
  name: {type: string}
  code: {type: string}
";

/// Countries whose languages go through an intermediate model.
pub const COUNTRY_LANGUAGE: &str = r"
type: dataset
name: example
---
type: model
name: example/Language
properties:
  code: {type: string, unique: true}
---
type: model
name: example/Country
properties:
  name: {type: string}
  languages:
    type: array
    intermediate: example/Country_Language
    items: {type: ref, model: Language}
---
type: model
name: example/Country_Language
properties:
  country: {type: ref, model: Country}
  language: {type: ref, model: Language}
";

/// Countries with cities referencing them at level 3 and level 4.
pub const COUNTRY_CITY: &str = r"
type: model
name: country
properties:
  code: {type: string}
  name: {type: string}
---
type: model
name: city3
properties:
  name: {type: string}
  country: {type: ref, model: country, level: 3}
---
type: model
name: city4
properties:
  name: {type: string}
  country: {type: ref, model: country, level: 4}
";

/// Config granting requests without credentials every global scope.
#[must_use]
pub fn full_access(config: Config) -> Config {
    let prefix = config.scope_prefix().to_string();
    let max_len = config.scope_max_length();
    let mut scopes: Vec<String> = [
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
    ]
    .iter()
    .map(|action| scope_name(&prefix, max_len, "", *action))
    .collect();
    scopes.push(format!("{prefix}set_meta_fields"));
    config
        .set("default_auth_client", "default")
        .set("clients.default.scopes", json!(scopes))
}

/// A bootstrapped store with automatic cleanup.
pub struct TestStore {
    /// The store instance.
    pub store: Store,
    /// The temporary directory (kept alive to prevent cleanup).
    _temp_dir: Option<TempDir>,
}

impl TestStore {
    /// Creates an in-memory store over `yaml`.
    pub fn memory(yaml: &str) -> Self {
        let manifest = load_yaml_str(yaml).expect("Failed to load manifest");
        let store = Store::in_memory(manifest).expect("Failed to open store");
        store.bootstrap().expect("Failed to bootstrap store");
        Self {
            store,
            _temp_dir: None,
        }
    }

    /// Creates a store over `yaml` keeping file contents in a temporary
    /// directory.
    pub fn file(yaml: &str) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let files = temp_dir.path().join("files.dat");
        let config = full_access(Config::new().set("files.path", files.display().to_string()));
        let manifest = load_yaml_str(yaml).expect("Failed to load manifest");
        let store = Store::builder(config)
            .manifest(manifest)
            .open()
            .expect("Failed to open store");
        store.bootstrap().expect("Failed to bootstrap store");
        Self {
            store,
            _temp_dir: Some(temp_dir),
        }
    }

    /// Returns the blob file path if file-based, None if in-memory.
    pub fn files_path(&self) -> Option<PathBuf> {
        self._temp_dir.as_ref().map(|d| d.path().join("files.dat"))
    }

    /// `GET path`.
    pub fn get(&self, path: &str) -> Response {
        self.store.handle(Request::get(path))
    }

    /// `POST path` with a JSON body.
    pub fn post(&self, path: &str, body: Value) -> Response {
        self.store.handle(Request::post(path, body))
    }

    /// `PATCH path` with a JSON body.
    pub fn patch(&self, path: &str, body: Value) -> Response {
        self.store.handle(Request::patch(path, body))
    }

    /// `GET path`, asserting a 200 and returning the JSON body.
    pub fn get_json(&self, path: &str) -> Value {
        let response = self.get(path);
        assert_eq!(response.status, 200, "GET {path}: {}", response.text());
        response.to_json().expect("Failed to parse response")
    }

    /// `POST path`, asserting a 201 and returning the JSON body.
    pub fn insert_json(&self, path: &str, body: Value) -> Value {
        let response = self.post(path, body);
        assert_eq!(response.status, 201, "POST {path}: {}", response.text());
        response.to_json().expect("Failed to parse response")
    }

    /// Inserts `body` and returns the new `_id`.
    pub fn insert_id(&self, path: &str, body: Value) -> String {
        let created = self.insert_json(path, body);
        created["_id"]
            .as_str()
            .expect("Insert response without _id")
            .to_string()
    }
}

impl std::ops::Deref for TestStore {
    type Target = Store;

    fn deref(&self) -> &Self::Target {
        &self.store
    }
}

/// Runs a test with a temporary in-memory store over `yaml`.
///
/// # Example
///
/// ```rust,ignore
/// use datagate_testkit::{with_store, REPORT};
///
/// #[test]
/// fn my_test() {
///     with_store(REPORT, |store| {
///         assert_eq!(store.get("/report").status, 200);
///     });
/// }
/// ```
pub fn with_store<F, R>(yaml: &str, f: F) -> R
where
    F: FnOnce(&TestStore) -> R,
{
    let store = TestStore::memory(yaml);
    f(&store)
}

/// The `_data` array of a list response.
pub fn data(body: &Value) -> &Vec<Value> {
    body["_data"].as_array().expect("Response without _data")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_manifests_load() {
        for yaml in [REPORT, CITIES, COUNTRY_LANGUAGE, COUNTRY_CITY] {
            load_yaml_str(yaml).expect("sample manifest");
        }
    }

    #[test]
    fn memory_store_accepts_writes() {
        with_store(REPORT, |store| {
            let id = store.insert_id("/report", json!({"status": "ok"}));
            let got = store.get_json(&format!("/report/{id}"));
            assert_eq!(got["status"], "ok");
        });
    }

    #[test]
    fn file_store_keeps_its_directory() {
        let store = TestStore::file(REPORT);
        assert!(store.files_path().is_some());
        assert_eq!(store.get("/report").status, 200);
    }
}
