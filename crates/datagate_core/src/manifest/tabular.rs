//! The tabular manifest form.
//!
//! One CSV table with the columns
//! `d,r,b,m,property,type,ref,source,prepare,level,access,title,description`.
//! The first non-empty dimension column (`d`, `r`, `b`, `m`, `property`)
//! decides what a row declares:
//!
//! | Column | Row declares | Notes |
//! |---|---|---|
//! | `d` | dataset | resets the current resource |
//! | `r` | resource of the current dataset | `type` names the backend |
//! | `m` | model | `ref` lists primary keys, `type` names the backend |
//! | `property` | property of the current model | `notes[]` is the items of `notes` |
//!
//! Rows with no dimension set continue the last `enum` (choices) or `param`
//! (resource parameter) row.

use super::load::{
    DatasetDoc, ExternalDoc, ManifestDocs, ModelDoc, Named, NodeDoc, ParamDoc, PropertyDoc,
    ResourceDoc,
};
use crate::error::{CoreError, CoreResult, ErrorKind};
use crate::types::Access;
use datagate_expr::Node;
use serde_json::Value;
use std::path::Path;
use tracing::debug;

/// Column order of the table.
pub const COLUMNS: [&str; 13] = [
    "d",
    "r",
    "b",
    "m",
    "property",
    "type",
    "ref",
    "source",
    "prepare",
    "level",
    "access",
    "title",
    "description",
];

const FLAGS: [&str; 5] = ["required", "unique", "hidden", "nullable", "nonnull"];

/// One table row, keyed by column.
#[derive(Debug, Default)]
struct Row {
    line: u64,
    cells: [String; 13],
}

impl Row {
    fn get(&self, column: &str) -> &str {
        COLUMNS
            .iter()
            .position(|c| *c == column)
            .map_or("", |i| self.cells[i].as_str())
    }

    fn opt(&self, column: &str) -> Option<String> {
        Some(self.get(column)).filter(|s| !s.is_empty()).map(str::to_string)
    }
}

#[derive(Debug, Clone, Copy)]
enum Continuation {
    None,
    Enum,
    Param,
}

/// Reader state: which dataset, resource, model and property rows apply to.
struct Reader<'a> {
    file: &'a str,
    docs: ManifestDocs,
    dataset: Option<usize>,
    resource: Option<String>,
    model: Option<usize>,
    property: Option<String>,
    continuation: Continuation,
}

fn invalid(file: &str, line: u64, error: impl Into<String>) -> CoreError {
    ErrorKind::InvalidManifestFile
        .err()
        .with("file", file)
        .with("line", line)
        .with("error", error.into())
        .into()
}

fn unknown_owner(file: &str, line: u64, node: &str) -> CoreError {
    ErrorKind::UnknownOwner
        .err()
        .with("file", file)
        .with("line", line)
        .with("node", node)
        .into()
}

/// Reads a tabular manifest file.
///
/// # Errors
///
/// `FileNotFound` for a missing file, `InvalidManifestFile` or `UnknownOwner`
/// for malformed rows.
pub fn read_path(path: &Path) -> CoreResult<ManifestDocs> {
    if !path.is_file() {
        return Err(ErrorKind::FileNotFound
            .err()
            .with("file", path.display().to_string())
            .into());
    }
    let text = std::fs::read_to_string(path)?;
    read_str(&text, &path.display().to_string())
}

/// Reads a tabular manifest from a string.
///
/// # Errors
///
/// `InvalidManifestFile` or `UnknownOwner` for malformed rows.
pub fn read_str(text: &str, file: &str) -> CoreResult<ManifestDocs> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());
    let headers = reader
        .headers()
        .map_err(|e| invalid(file, 1, e.to_string()))?
        .clone();
    let positions: Vec<Option<usize>> = headers
        .iter()
        .map(|h| COLUMNS.iter().position(|c| *c == h))
        .collect();
    if !positions.iter().any(|p| *p == Some(4)) {
        return Err(invalid(file, 1, "missing property column"));
    }

    let mut state = Reader {
        file,
        docs: ManifestDocs::default(),
        dataset: None,
        resource: None,
        model: None,
        property: None,
        continuation: Continuation::None,
    };
    for record in reader.records() {
        let record = record.map_err(|e| invalid(file, 0, e.to_string()))?;
        let mut row = Row {
            line: record.position().map_or(0, csv::Position::line),
            ..Row::default()
        };
        for (cell, pos) in record.iter().zip(&positions) {
            if let Some(i) = pos {
                row.cells[*i] = cell.to_string();
            }
        }
        if row.cells.iter().all(String::is_empty) {
            continue;
        }
        state.row(&row)?;
    }
    debug!(file, nodes = state.docs.nodes.len(), "read tabular manifest");
    Ok(state.docs)
}

fn parse_access(file: &str, line: u64, text: &str) -> CoreResult<Option<Access>> {
    if text.is_empty() {
        return Ok(None);
    }
    text.to_ascii_lowercase()
        .parse::<Access>()
        .map(Some)
        .map_err(|_| invalid(file, line, format!("unknown access {text}")))
}

fn parse_level(file: &str, line: u64, text: &str) -> CoreResult<Option<u8>> {
    if text.is_empty() {
        return Ok(None);
    }
    text.parse::<u8>()
        .ok()
        .filter(|l| (1..=5).contains(l))
        .map(Some)
        .ok_or_else(|| invalid(file, line, format!("level must be 1..5, got {text}")))
}

/// Splits `geometry(point, 3346) required unique` into the type and flags.
fn split_type(text: &str) -> (String, Vec<&str>) {
    let (head, rest) = match text.find(')') {
        Some(end) if text.find('(').is_some_and(|start| start < end) => text.split_at(end + 1),
        _ => text.split_once(char::is_whitespace).unwrap_or((text, "")),
    };
    (head.trim().to_string(), rest.split_whitespace().collect())
}

/// `City[code, name]` into the target and its refprops.
fn split_ref(text: &str) -> (String, Vec<String>) {
    match text.split_once('[') {
        Some((target, rest)) => (
            target.trim().to_string(),
            rest.trim_end_matches(']')
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        ),
        None => (text.trim().to_string(), Vec::new()),
    }
}

/// Value of an enum or param continuation: a literal `prepare` wins over
/// the raw `source` string.
fn row_value(file: &str, row: &Row) -> CoreResult<Option<Value>> {
    let prepare = row.get("prepare");
    if !prepare.is_empty() {
        return match datagate_expr::parse(prepare)? {
            Node::Literal(l) => Ok(Some(l.to_json())),
            Node::Expr(_) => Err(invalid(file, row.line, format!("{prepare} is not a literal"))),
        };
    }
    Ok(row.opt("source").map(Value::String))
}

impl Reader<'_> {
    fn row(&mut self, row: &Row) -> CoreResult<()> {
        if !row.get("d").is_empty() {
            self.dataset_row(row)
        } else if !row.get("r").is_empty() {
            self.resource_row(row)
        } else if !row.get("b").is_empty() {
            Err(invalid(self.file, row.line, "base models are not supported"))
        } else if !row.get("m").is_empty() {
            self.model_row(row)
        } else if !row.get("property").is_empty() {
            self.property_row(row)
        } else {
            match row.get("type") {
                "enum" => {
                    self.continuation = Continuation::Enum;
                    self.enum_value(row)
                }
                "param" => self.param_row(row),
                "" => match self.continuation {
                    Continuation::Enum => self.enum_value(row),
                    Continuation::Param => self.param_value(row),
                    Continuation::None => Err(unknown_owner(self.file, row.line, row.get("source"))),
                },
                other => Err(invalid(self.file, row.line, format!("unexpected {other} row"))),
            }
        }
    }

    fn dataset_row(&mut self, row: &Row) -> CoreResult<()> {
        let doc = DatasetDoc {
            name: row.get("d").to_string(),
            title: row.opt("title"),
            description: row.opt("description"),
            access: parse_access(self.file, row.line, row.get("access"))?,
            level: parse_level(self.file, row.line, row.get("level"))?,
            resources: Named::default(),
        };
        self.docs.nodes.push(NodeDoc::Dataset(doc));
        self.dataset = Some(self.docs.nodes.len() - 1);
        self.resource = None;
        self.model = None;
        self.continuation = Continuation::None;
        Ok(())
    }

    fn current_dataset(&mut self, line: u64, node: &str) -> CoreResult<&mut DatasetDoc> {
        match self.dataset.and_then(|i| self.docs.nodes.get_mut(i)) {
            Some(NodeDoc::Dataset(ds)) => Ok(ds),
            _ => Err(unknown_owner(self.file, line, node)),
        }
    }

    fn resource_row(&mut self, row: &Row) -> CoreResult<()> {
        let name = row.get("r").to_string();
        let doc = ResourceDoc {
            backend: row.opt("type"),
            source: row.opt("source"),
            prepare: row.opt("prepare"),
            params: Vec::new(),
            access: parse_access(self.file, row.line, row.get("access"))?,
            level: parse_level(self.file, row.line, row.get("level"))?,
        };
        self.current_dataset(row.line, &name)?
            .resources
            .0
            .push((name.clone(), doc));
        self.resource = Some(name);
        self.model = None;
        self.continuation = Continuation::None;
        Ok(())
    }

    fn param_row(&mut self, row: &Row) -> CoreResult<()> {
        let name = row.get("ref").to_string();
        let Some(resource) = self.resource.clone() else {
            return Err(unknown_owner(self.file, row.line, &name));
        };
        let param = ParamDoc {
            name,
            source: row.opt("source").map(Value::String).into_iter().collect(),
            prepare: row.opt("prepare"),
        };
        let ds = self.current_dataset(row.line, &param.name)?;
        let (_, res) = ds
            .resources
            .0
            .iter_mut()
            .find(|(n, _)| *n == resource)
            .ok_or_else(|| CoreError::internal("current resource vanished"))?;
        res.params.push(param);
        self.continuation = Continuation::Param;
        Ok(())
    }

    fn param_value(&mut self, row: &Row) -> CoreResult<()> {
        let value = row_value(self.file, row)?;
        let file = self.file;
        let resource = self.resource.clone().unwrap_or_default();
        let ds = self.current_dataset(row.line, &resource)?;
        let param = ds
            .resources
            .0
            .iter_mut()
            .find(|(n, _)| *n == resource)
            .and_then(|(_, r)| r.params.last_mut())
            .ok_or_else(|| unknown_owner(file, row.line, &resource))?;
        param.source.extend(value);
        Ok(())
    }

    fn model_row(&mut self, row: &Row) -> CoreResult<()> {
        let dataset = match self.dataset.and_then(|i| self.docs.nodes.get(i)) {
            Some(NodeDoc::Dataset(ds)) => Some(ds.name.clone()),
            _ => None,
        };
        let raw = row.get("m");
        let name = match &dataset {
            Some(ds) if !raw.starts_with(&format!("{ds}/")) => format!("{ds}/{raw}"),
            _ => raw.to_string(),
        };
        let external = (row.opt("source").is_some() || row.opt("prepare").is_some()).then(|| {
            ExternalDoc {
                source: row.opt("source"),
                prepare: row.opt("prepare"),
            }
        });
        let doc = ModelDoc {
            name,
            title: row.opt("title"),
            description: row.opt("description"),
            dataset,
            resource: self.resource.clone(),
            backend: row.opt("type"),
            external,
            pkeys: row
                .get("ref")
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            access: parse_access(self.file, row.line, row.get("access"))?,
            level: parse_level(self.file, row.line, row.get("level"))?,
            ..ModelDoc::default()
        };
        self.docs.nodes.push(NodeDoc::Model(doc));
        self.model = Some(self.docs.nodes.len() - 1);
        self.property = None;
        self.continuation = Continuation::None;
        Ok(())
    }

    fn property_row(&mut self, row: &Row) -> CoreResult<()> {
        let path = row.get("property").to_string();
        let (type_name, flags) = split_type(row.get("type"));
        if let Some(flag) = flags.iter().find(|f| !FLAGS.contains(f)) {
            return Err(invalid(self.file, row.line, format!("unknown flag {flag}")));
        }
        let mut doc = PropertyDoc::of_type(type_name.as_str());
        doc.required = flags.contains(&"required");
        doc.unique = flags.contains(&"unique");
        doc.hidden = flags.contains(&"hidden");
        doc.nullable = if flags.contains(&"nullable") {
            Some(true)
        } else if flags.contains(&"nonnull") {
            Some(false)
        } else {
            None
        };
        doc.access = parse_access(self.file, row.line, row.get("access"))?;
        doc.level = parse_level(self.file, row.line, row.get("level"))?;
        doc.prepare = row.opt("prepare");
        doc.external = row.opt("source").map(|source| ExternalDoc {
            source: Some(source),
            prepare: None,
        });
        doc.title = row.opt("title");
        doc.description = row.opt("description");
        match type_name.as_str() {
            "ref" | "backref" => {
                let (target, refprops) = split_ref(row.get("ref"));
                doc.model = Some(target).filter(|t| !t.is_empty());
                doc.refprops = refprops;
            }
            "array" => doc.intermediate = row.opt("ref"),
            _ => {}
        }

        let file = self.file;
        let line = row.line;
        let model = match self.model.and_then(|i| self.docs.nodes.get_mut(i)) {
            Some(NodeDoc::Model(m)) => m,
            _ => return Err(unknown_owner(file, line, &path)),
        };
        insert_property(&mut model.properties, &path, doc)
            .ok_or_else(|| unknown_owner(file, line, &path))?;
        self.property = Some(path);
        self.continuation = Continuation::None;
        Ok(())
    }

    fn enum_value(&mut self, row: &Row) -> CoreResult<()> {
        let value = row_value(self.file, row)?;
        let file = self.file;
        let line = row.line;
        let path = self.property.clone().unwrap_or_default();
        let prop = match self.model.and_then(|i| self.docs.nodes.get_mut(i)) {
            Some(NodeDoc::Model(m)) => find_property(&mut m.properties, &path),
            _ => None,
        }
        .ok_or_else(|| unknown_owner(file, line, "enum"))?;
        prop.choices.extend(value);
        Ok(())
    }
}

/// Splits `notes[].note` into `[("notes", true), ("note", false)]`.
fn segments(path: &str) -> Vec<(&str, bool)> {
    path.split('.')
        .map(|s| match s.strip_suffix("[]") {
            Some(name) => (name, true),
            None => (s, false),
        })
        .collect()
}

fn step<'a>(props: &'a mut Named<PropertyDoc>, name: &str, items: bool) -> Option<&'a mut PropertyDoc> {
    let (_, prop) = props.0.iter_mut().find(|(n, _)| n == name)?;
    if items {
        prop.items.as_deref_mut()
    } else {
        Some(prop)
    }
}

fn find_property<'a>(props: &'a mut Named<PropertyDoc>, path: &str) -> Option<&'a mut PropertyDoc> {
    let segs = segments(path);
    let ((first, first_items), rest) = segs.split_first()?;
    let mut current = step(props, first, *first_items)?;
    for (name, items) in rest {
        current = step(&mut current.properties, name, *items)?;
    }
    Some(current)
}

/// Places a property document at `path`. `x[]` sets the items of array `x`,
/// creating the array when it is missing.
fn insert_property(props: &mut Named<PropertyDoc>, path: &str, doc: PropertyDoc) -> Option<()> {
    let (parent, leaf) = match path.rsplit_once('.') {
        Some((parent, leaf)) => (Some(parent), leaf),
        None => (None, path),
    };
    let container = match parent {
        Some(parent) => &mut find_property(props, parent)?.properties,
        None => props,
    };
    match leaf.strip_suffix("[]") {
        Some(name) => {
            if container.get(name).is_none() {
                container.0.push((name.to_string(), PropertyDoc::of_type("array")));
            }
            let (_, array) = container.0.iter_mut().find(|(n, _)| n == name)?;
            array.items = Some(Box::new(doc));
        }
        None => container.0.push((leaf.to_string(), doc)),
    }
    Some(())
}

/// Writes documents as a tabular manifest. Models without a dataset come
/// first, then each dataset with its resource-less models and its
/// resources. Endpoints, defaults and schema versions have no column and
/// are left out.
///
/// # Errors
///
/// Returns `InvalidManifestFile` if the CSV writer fails.
pub fn write_str(docs: &ManifestDocs) -> CoreResult<String> {
    let mut out = csv::Writer::from_writer(Vec::new());
    let fail = |e: csv::Error| invalid("<dump>", 0, e.to_string());
    out.write_record(COLUMNS).map_err(fail)?;

    let models: Vec<&ModelDoc> = docs
        .nodes
        .iter()
        .filter_map(|n| match n {
            NodeDoc::Model(m) => Some(m),
            NodeDoc::Dataset(_) => None,
        })
        .collect();
    let mut rows = Vec::new();
    for m in models.iter().filter(|m| m.dataset.is_none()) {
        model_rows(&mut rows, m);
    }
    for node in &docs.nodes {
        let NodeDoc::Dataset(ds) = node else {
            continue;
        };
        let mut row = blank();
        row[0] = ds.name.clone();
        fill_common(&mut row, ds.level, ds.access, ds.title.as_deref(), ds.description.as_deref());
        rows.push(row);
        for m in models_in(&models, &ds.name, None) {
            model_rows(&mut rows, m);
        }
        for (name, r) in &ds.resources.0 {
            let mut row = blank();
            row[1] = name.clone();
            row[5] = r.backend.clone().unwrap_or_default();
            row[7] = r.source.clone().unwrap_or_default();
            row[8] = r.prepare.clone().unwrap_or_default();
            fill_common(&mut row, r.level, r.access, None, None);
            rows.push(row);
            for p in &r.params {
                let mut row = blank();
                row[5] = "param".to_string();
                row[6] = p.name.clone();
                row[8] = p.prepare.clone().unwrap_or_default();
                rows.push(row);
                for v in &p.source {
                    rows.push(value_row(v));
                }
            }
            for m in models_in(&models, &ds.name, Some(name)) {
                model_rows(&mut rows, m);
            }
        }
    }
    for row in rows {
        out.write_record(&row).map_err(fail)?;
    }
    let bytes = out
        .into_inner()
        .map_err(|e| invalid("<dump>", 0, e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| invalid("<dump>", 0, e.to_string()))
}

fn models_in<'a>(models: &[&'a ModelDoc], dataset: &str, resource: Option<&str>) -> Vec<&'a ModelDoc> {
    models
        .iter()
        .copied()
        .filter(|m| m.dataset.as_deref() == Some(dataset) && m.resource.as_deref() == resource)
        .collect()
}

fn blank() -> Vec<String> {
    vec![String::new(); COLUMNS.len()]
}

fn fill_common(
    row: &mut [String],
    level: Option<u8>,
    access: Option<Access>,
    title: Option<&str>,
    description: Option<&str>,
) {
    row[9] = level.map(|l| l.to_string()).unwrap_or_default();
    row[10] = access.map(|a| a.as_str().to_string()).unwrap_or_default();
    row[11] = title.unwrap_or_default().to_string();
    row[12] = description.unwrap_or_default().to_string();
}

fn value_row(value: &Value) -> Vec<String> {
    let mut row = blank();
    match value {
        Value::String(s) => row[7] = s.clone(),
        other => row[8] = other.to_string(),
    }
    row
}

fn model_rows(rows: &mut Vec<Vec<String>>, m: &ModelDoc) {
    let mut row = blank();
    row[3] = m.name.clone();
    row[5] = m.backend.clone().unwrap_or_default();
    row[6] = m.pkeys.join(", ");
    if let Some(ext) = &m.external {
        row[7] = ext.source.clone().unwrap_or_default();
        row[8] = ext.prepare.clone().unwrap_or_default();
    }
    fill_common(&mut row, m.level, m.access, m.title.as_deref(), m.description.as_deref());
    rows.push(row);
    for (name, p) in &m.properties.0 {
        property_rows(rows, name, p);
    }
}

fn property_rows(rows: &mut Vec<Vec<String>>, path: &str, p: &PropertyDoc) {
    let mut row = blank();
    row[4] = path.to_string();
    let mut type_text = p.type_name.clone();
    for (flag, on) in [
        ("required", p.required),
        ("unique", p.unique),
        ("hidden", p.hidden),
        ("nullable", p.nullable == Some(true)),
        ("nonnull", p.nullable == Some(false)),
    ] {
        if on {
            type_text.push(' ');
            type_text.push_str(flag);
        }
    }
    row[5] = type_text;
    row[6] = match (&p.model, &p.intermediate) {
        (Some(target), _) if p.refprops.is_empty() => target.clone(),
        (Some(target), _) => format!("{target}[{}]", p.refprops.join(", ")),
        (None, Some(join)) => join.clone(),
        (None, None) => String::new(),
    };
    row[7] = p
        .external
        .as_ref()
        .and_then(|e| e.source.clone())
        .unwrap_or_default();
    row[8] = p.prepare.clone().unwrap_or_default();
    fill_common(&mut row, p.level, p.access, p.title.as_deref(), p.description.as_deref());
    rows.push(row);

    if !p.choices.is_empty() {
        let mut first = true;
        for choice in &p.choices {
            let mut row = value_row(choice);
            if first {
                row[5] = "enum".to_string();
                first = false;
            }
            rows.push(row);
        }
    }
    if let Some(items) = &p.items {
        property_rows(rows, &format!("{path}[]"), items);
    }
    for (name, child) in &p.properties.0 {
        property_rows(rows, &format!("{path}.{name}"), child);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::DType;
    use serde_json::json;

    const TABLE: &str = "\
d,r,b,m,property,type,ref,source,prepare,level,access,title,description
,,,report,,,,,,,open,Reports,
,,,,status,string required,,,,,,,
,,,,,enum,,ok,,,,,
,,,,,,,error,,,,,
,,,,count,integer,,,,,,,
,,,,notes,array,,,,,,,
,,,,notes[],object,,,,,,,
,,,,notes[].note,string,,,,,,,
example,,,,,,,,,3,,Example,
,,,Country,,,,,,,,,
,,,,code,string unique,,,,,,,
,,,,location,\"geometry(point, 3346) hidden\",,,,,,,
,api,,,,sql,,https://example.com/api,,,,,
,,,,,param,page,,read().next,,,,
,,,City,,,\"id, name\",cities,,,,,
,,,,id,integer,,ID,,,,,
,,,,name,string,,NAME,,,,,
,,,,country,ref,Country[code],,,,,,
";

    #[test]
    fn reads_rows_into_documents() {
        let docs = read_str(TABLE, "manifest.csv").unwrap();
        assert_eq!(docs.nodes.len(), 4);
        let NodeDoc::Model(report) = &docs.nodes[0] else {
            panic!("expected model");
        };
        assert_eq!(report.access, Some(Access::Public));
        let status = report.properties.get("status").unwrap();
        assert!(status.required);
        assert_eq!(status.choices, vec![json!("ok"), json!("error")]);
        let notes = report.properties.get("notes").unwrap();
        assert_eq!(notes.items.as_ref().unwrap().properties.0.len(), 1);

        let NodeDoc::Model(city) = &docs.nodes[3] else {
            panic!("expected model");
        };
        assert_eq!(city.name, "example/City");
        assert_eq!(city.resource.as_deref(), Some("api"));
        assert_eq!(city.pkeys, vec!["id".to_string(), "name".to_string()]);
        assert_eq!(city.external.as_ref().unwrap().source.as_deref(), Some("cities"));
        let country = city.properties.get("country").unwrap();
        assert_eq!(country.refprops, vec!["code".to_string()]);
    }

    #[test]
    fn links_like_yaml() {
        let manifest = read_str(TABLE, "manifest.csv").unwrap().link().unwrap();
        let country = manifest.model_by_name("example/Country").unwrap();
        assert_eq!(country.level, Some(3));
        let location = manifest.find_property(country.id, "location").unwrap();
        assert!(location.hidden);
        assert!(matches!(&location.dtype, DType::Geometry(g) if g.srid == Some(3346)));
        let city = manifest.model_by_name("example/City").unwrap();
        assert_eq!(manifest.resource(city.resource.unwrap()).backend, "sql");
        assert_eq!(
            manifest.resource(city.resource.unwrap()).params[0].name,
            "page"
        );
    }

    #[test]
    fn written_table_reads_back() {
        let first = read_str(TABLE, "manifest.csv").unwrap().link().unwrap();
        let docs = first.to_docs();
        let text = write_str(&docs).unwrap();
        let second = read_str(&text, "dump.csv").unwrap().link().unwrap();
        assert_eq!(first.to_docs(), second.to_docs());
    }

    #[test]
    fn orphans() {
        let err = read_str(
            "d,r,b,m,property,type\n,,,,name,string\n",
            "orphan.csv",
        )
        .unwrap_err();
        assert_eq!(err.code(), "UnknownOwner");

        let err = read_str(
            "d,r,b,m,property,type\n,,,a,,\n,,,,notes[].note,string\n",
            "orphan.csv",
        )
        .unwrap_err();
        assert_eq!(err.code(), "UnknownOwner");

        let err = read_str("d,r,b,m,property,type\n,api,,,,sql\n", "orphan.csv").unwrap_err();
        assert_eq!(err.code(), "UnknownOwner");
    }

    #[test]
    fn param_rows_collect_continuation_values() {
        let table = "\
d,r,b,m,property,type,ref,source,prepare,level,access,title,description
example,,,,,,,,,,,,
,api,,,,sql,,https://example.com/api,,,,,
,,,,,param,year,2020,,,,,
,,,,,,,2021,,,,,
,,,,,,,,2022,,,,
";
        let docs = read_str(table, "params.csv").unwrap();
        let NodeDoc::Dataset(ds) = &docs.nodes[0] else {
            panic!("expected dataset");
        };
        let param = &ds.resources.get("api").unwrap().params[0];
        assert_eq!(param.name, "year");
        assert_eq!(param.source, vec![json!("2020"), json!("2021"), json!(2022)]);
    }

    #[test]
    fn bad_cells() {
        let err = read_str("d,r,b,m,property,type\n,,,a,,\n,,,,x,string shiny\n", "t.csv")
            .unwrap_err();
        assert_eq!(err.code(), "InvalidManifestFile");

        let err = read_str("d,level\nx,9\n", "t.csv").unwrap_err();
        assert_eq!(err.code(), "InvalidManifestFile");
    }

    #[test]
    fn missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_path(&dir.path().join("nope.csv")).unwrap_err();
        assert_eq!(err.code(), "FileNotFound");
    }
}
