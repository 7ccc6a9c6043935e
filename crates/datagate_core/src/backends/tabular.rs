//! Read-only backend over external tabular sources.
//!
//! A model's `external.source` (or its resource's source) is a template
//! such as `cities-{year}.csv`. Resource params fill the template: literal
//! params give one read per value, a param with a prepare expression such
//! as `read().next` pages through the source until it yields `null`.
//! Records are mapped onto properties by their `external.source` column
//! names, cast to the property types and given a stable `_id` derived from
//! the primary key. Filtering, ordering and paging then run in process.

use super::eval::run_query;
use super::{same_backend, Backend, RowStream, Transaction};
use crate::changes::ChangeEntry;
use crate::config::BackendKind;
use crate::dtype::DType;
use crate::error::{CoreError, CoreResult, ErrorKind};
use crate::manifest::{Manifest, Model, Param};
use crate::migration::{SchemaAction, SchemaSnapshot};
use crate::types::{ModelId, Row};
use crate::ufunc::params::{eval_param, ParamScope};
use crate::ufunc::Query;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const MAX_PAGES: usize = 1000;

/// Where tabular records come from.
pub trait ExternalSource: Send + Sync {
    /// Reads every record of a source, values keyed by column name.
    ///
    /// # Errors
    ///
    /// `FileNotFound` or `CannotReadResource` when the source cannot be
    /// opened, `UnexpectedErrorReadingData` when a record cannot be read.
    fn read(&self, source: &str) -> CoreResult<Vec<Row>>;
}

/// CSV files under a directory. Empty cells read as `null`.
#[derive(Debug, Clone)]
pub struct CsvSource {
    root: PathBuf,
}

impl CsvSource {
    /// Reads files relative to `root`.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }
}

impl ExternalSource for CsvSource {
    fn read(&self, source: &str) -> CoreResult<Vec<Row>> {
        let path = self.root.join(source);
        if !path.is_file() {
            return Err(ErrorKind::FileNotFound
                .err()
                .with("file", path.display().to_string())
                .into());
        }
        let unreadable = |e: csv::Error| -> CoreError {
            ErrorKind::CannotReadResource
                .err()
                .with("source", source)
                .with("error", e.to_string())
                .into()
        };
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_path(&path)
            .map_err(unreadable)?;
        let headers = reader.headers().map_err(unreadable)?.clone();
        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.map_err(|e| -> CoreError {
                let line = e.position().map_or(Value::Null, |p| Value::from(p.line()));
                ErrorKind::UnexpectedErrorReadingData
                    .err()
                    .with("source", source)
                    .with("line", line)
                    .with("error", e.to_string())
                    .into()
            })?;
            let row: Row = headers
                .iter()
                .zip(record.iter())
                .map(|(h, v)| {
                    let value = if v.is_empty() { Value::Null } else { Value::from(v) };
                    (h.to_string(), value)
                })
                .collect();
            rows.push(row);
        }
        Ok(rows)
    }
}

/// Records held in memory by source name, for tests and embedding.
#[derive(Debug, Default)]
pub struct MemorySource {
    tables: RwLock<HashMap<String, Vec<Row>>>,
}

impl MemorySource {
    /// An empty source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the records of a source.
    pub fn insert(&self, source: &str, rows: Vec<Row>) {
        self.tables.write().insert(source.to_string(), rows);
    }
}

impl ExternalSource for MemorySource {
    fn read(&self, source: &str) -> CoreResult<Vec<Row>> {
        self.tables.read().get(source).cloned().ok_or_else(|| {
            ErrorKind::CannotReadResource
                .err()
                .with("source", source)
                .into()
        })
    }
}

/// Fills `{name}` placeholders from param values.
#[must_use]
pub fn fill_template(template: &str, values: &BTreeMap<String, Value>) -> String {
    values.iter().fold(template.to_string(), |acc, (name, value)| {
        let text = match value {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        };
        acc.replace(&format!("{{{name}}}"), &text)
    })
}

/// Stable row id from a model name and its key values.
#[must_use]
pub fn derive_id(model: &str, key: &[Value]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(model.as_bytes());
    hasher.update([0u8]);
    hasher.update(Value::Array(key.to_vec()).to_string().as_bytes());
    let hex: String = hasher
        .finalize()
        .iter()
        .take(16)
        .map(|b| format!("{b:02x}"))
        .collect();
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

fn literal_combinations(params: &[&Param]) -> Vec<BTreeMap<String, Value>> {
    let mut combos = vec![BTreeMap::new()];
    for param in params {
        let values = if param.source.is_empty() {
            vec![Value::Null]
        } else {
            param.source.clone()
        };
        combos = combos
            .into_iter()
            .flat_map(|combo| {
                values.iter().map(move |v| {
                    let mut next = combo.clone();
                    next.insert(param.name.clone(), v.clone());
                    next
                })
            })
            .collect();
    }
    combos
}

/// Read-only backend over an [`ExternalSource`].
pub struct TabularBackend {
    name: String,
    source: Arc<dyn ExternalSource>,
}

impl TabularBackend {
    /// Wraps a source.
    #[must_use]
    pub fn new(name: &str, source: Arc<dyn ExternalSource>) -> Self {
        Self {
            name: name.to_string(),
            source,
        }
    }

    fn template<'m>(manifest: &'m Manifest, model: &'m Model) -> CoreResult<&'m str> {
        let own = model.external.as_ref().and_then(|e| e.source.as_deref());
        let resource = model
            .resource
            .and_then(|id| manifest.resource(id).source.as_deref());
        own.or(resource).ok_or_else(|| {
            ErrorKind::SourceNotSet
                .err()
                .model(&model.name)
                .into()
        })
    }

    fn read_records(&self, manifest: &Manifest, model: &Model) -> CoreResult<Vec<Row>> {
        let template = Self::template(manifest, model)?;
        let params: Vec<&Param> = model
            .resource
            .map(|id| manifest.resource(id).params.iter().collect())
            .unwrap_or_default();
        let (paging, literal): (Vec<&Param>, Vec<&Param>) =
            params.into_iter().partition(|p| p.prepare.is_some());

        let mut records = Vec::new();
        for mut values in literal_combinations(&literal) {
            let Some(pager) = paging.first() else {
                records.extend(self.source.read(&fill_template(template, &values))?);
                continue;
            };
            let mut current = pager.source.first().cloned().unwrap_or(Value::Null);
            for page in 0.. {
                values.insert(pager.name.clone(), current.clone());
                let batch = self.source.read(&fill_template(template, &values))?;
                let last = batch.last().cloned().map(Value::Object);
                records.extend(batch);
                let Some(prepare) = &pager.prepare else { break };
                let next = eval_param(
                    prepare,
                    ParamScope {
                        values: &values,
                        last_read: last.as_ref(),
                    },
                )?;
                if next.is_null() || next == current {
                    break;
                }
                if page + 1 >= MAX_PAGES {
                    warn!(model = %model.name, pages = MAX_PAGES, "stopped paging external source");
                    break;
                }
                current = next;
            }
        }
        debug!(model = %model.name, records = records.len(), "read external records");
        Ok(records)
    }

    fn map_record(manifest: &Manifest, model: &Model, record: &Row) -> CoreResult<Row> {
        let mut row = Row::new();
        for prop in manifest.top_properties(model.id) {
            let Some(column) = prop.external.as_ref().and_then(|e| e.source.as_deref()) else {
                continue;
            };
            let raw = record.get(column).cloned().unwrap_or(Value::Null);
            let value = match &prop.dtype {
                DType::Ref(r) if !raw.is_null() => {
                    let mut obj = Map::new();
                    obj.insert(
                        "_id".into(),
                        Value::from(derive_id(&manifest.model(r.model).name, &[raw])),
                    );
                    Value::Object(obj)
                }
                dtype => dtype.cast(&raw)?,
            };
            row.insert(prop.name.clone(), value);
        }
        let declared: Vec<Value> = model
            .pkeys
            .iter()
            .map(|id| manifest.property(*id))
            .filter(|p| p.name != "_id")
            .map(|p| row.get(&p.name).cloned().unwrap_or(Value::Null))
            .collect();
        let key = if declared.is_empty() {
            row.values().cloned().collect()
        } else {
            declared
        };
        row.insert("_id".into(), Value::from(derive_id(&model.name, &key)));
        Ok(row)
    }

    fn model_rows(&self, manifest: &Manifest, model: &Model) -> CoreResult<Vec<Row>> {
        self.read_records(manifest, model)?
            .iter()
            .map(|record| Self::map_record(manifest, model, record))
            .collect()
    }
}

impl Backend for TabularBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn family(&self) -> BackendKind {
        BackendKind::Tabular
    }

    fn wait(&self, _timeout: Duration) -> bool {
        true
    }

    fn read_only(&self) -> bool {
        true
    }

    fn bootstrap(&self, _manifest: &Manifest) -> CoreResult<()> {
        Ok(())
    }

    fn schema(&self) -> CoreResult<SchemaSnapshot> {
        Ok(SchemaSnapshot::new())
    }

    fn migrate(&self, _manifest: &Manifest, actions: &[SchemaAction]) -> CoreResult<()> {
        if actions.is_empty() {
            Ok(())
        } else {
            Err(CoreError::backend(&self.name, "external sources cannot be migrated"))
        }
    }

    fn execute(&self, manifest: &Manifest, query: &Query, _txn: &Transaction) -> CoreResult<RowStream> {
        let model = manifest.model(query.model);
        let rows = self.model_rows(manifest, model)?;
        let mut fetch = |id: ModelId| -> CoreResult<Vec<Row>> {
            let joined = same_backend(manifest, &self.name, id)?;
            self.model_rows(manifest, joined)
        };
        let rows = run_query(manifest, query, rows, &mut fetch)?;
        Ok(Box::new(rows.into_iter().map(Ok)))
    }

    fn fetch(&self, manifest: &Manifest, model: &Model, id: &str) -> CoreResult<Option<Row>> {
        Ok(self
            .model_rows(manifest, model)?
            .into_iter()
            .find(|row| row.get("_id").and_then(Value::as_str) == Some(id)))
    }

    fn changes(&self, _model: &Model, _offset: i64, _limit: Option<usize>) -> CoreResult<Vec<ChangeEntry>> {
        Ok(Vec::new())
    }

    fn commit(&self, _manifest: &Manifest, txn: &mut Transaction) -> CoreResult<()> {
        txn.ensure_active()?;
        if txn.write_count() > 0 {
            return Err(CoreError::backend(&self.name, "backend is read-only"));
        }
        txn.mark_committed();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::load::load_yaml_str;
    use serde_json::json;
    use std::io::Write;

    const DOCS: &str = r"
type: dataset
name: geo
resources:
  files:
    backend: csv
    source: cities.csv
---
type: model
name: geo/City
resource: files
pkeys: [code]
properties:
  code: {type: string, external: {source: code}}
  name: {type: string, external: {source: title}}
  population: {type: integer, external: {source: pop}}
";

    fn rows(v: Value) -> Vec<Row> {
        v.as_array()
            .unwrap()
            .iter()
            .map(|r| r.as_object().cloned().unwrap())
            .collect()
    }

    fn read(backend: &TabularBackend, manifest: &Manifest, source: &str) -> Vec<Row> {
        let model = manifest.model_by_name("geo/City").unwrap();
        let node = datagate_expr::parse(source).unwrap();
        let funcs = crate::ufunc::builtins().unwrap();
        let params = BTreeMap::new();
        let env = crate::ufunc::Env {
            manifest,
            model,
            family: BackendKind::Tabular,
            caller: None,
            action: crate::types::Action::Search,
            funcs: &funcs,
            params: &params,
        };
        let query = crate::ufunc::resolve_query(&env, Some(&node)).unwrap();
        let txn = backend.begin(false).unwrap();
        backend
            .execute(manifest, &query, &txn)
            .unwrap()
            .collect::<CoreResult<_>>()
            .unwrap()
    }

    #[test]
    fn csv_records_are_cast_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("cities.csv")).unwrap();
        writeln!(file, "code,title,pop").unwrap();
        writeln!(file, "vln,Vilnius,540000").unwrap();
        writeln!(file, "kns,Kaunas,").unwrap();
        let manifest = load_yaml_str(DOCS).unwrap();
        let backend = TabularBackend::new("csv", Arc::new(CsvSource::new(dir.path())));
        let found = read(&backend, &manifest, "population>1000");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0]["name"], "Vilnius");
        assert_eq!(found[0]["population"], 540_000);
        assert_eq!(found[0]["_id"], derive_id("geo/City", &[json!("vln")]));
        let all = read(&backend, &manifest, "sort(name)");
        assert_eq!(all[0]["population"], Value::Null);
    }

    #[test]
    fn broken_csv_records_fail_the_read() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("cities.csv")).unwrap();
        writeln!(file, "code,title,pop").unwrap();
        writeln!(file, "vln,Vilnius,540000").unwrap();
        writeln!(file, "kns,Kaunas").unwrap();
        let source = CsvSource::new(dir.path());
        let err = source.read("cities.csv").unwrap_err();
        assert_eq!(err.code(), "UnexpectedErrorReadingData");
        assert_eq!(err.context()["source"], "cities.csv");
        assert_eq!(err.context()["line"], 3);
        assert_eq!(err.status(), 500);

        assert_eq!(source.read("missing.csv").unwrap_err().code(), "FileNotFound");
    }

    #[test]
    fn writes_are_rejected() {
        let backend = TabularBackend::new("csv", Arc::new(MemorySource::new()));
        assert!(backend.begin(true).is_err());
    }

    #[test]
    fn literal_params_fill_templates() {
        let source = r"
type: dataset
name: geo
resources:
  api:
    backend: csv
    params:
      - name: year
        source: [2020, 2021]
---
type: model
name: geo/City
resource: api
external: {source: 'cities-{year}'}
properties:
  code: {type: string, external: {source: code}}
";
        let manifest = load_yaml_str(source).unwrap();
        let memory = MemorySource::new();
        memory.insert("cities-2020", rows(json!([{"code": "a"}])));
        memory.insert("cities-2021", rows(json!([{"code": "b"}, {"code": "c"}])));
        let backend = TabularBackend::new("csv", Arc::new(memory));
        assert_eq!(read(&backend, &manifest, "sort(code)").len(), 3);
    }

    #[test]
    fn templates_and_ids() {
        let mut values = BTreeMap::new();
        values.insert("year".to_string(), json!(2020));
        values.insert("page".to_string(), json!("p2"));
        assert_eq!(fill_template("data-{year}-{page}.csv", &values), "data-2020-p2.csv");
        let id = derive_id("geo/City", &[json!("vln")]);
        assert_eq!(id.len(), 36);
        assert_eq!(id, derive_id("geo/City", &[json!("vln")]));
        assert_ne!(id, derive_id("geo/Town", &[json!("vln")]));
    }
}
