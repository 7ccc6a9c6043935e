//! Schema versions and migration planning.
//!
//! Each model carries a chain of [`SchemaVersion`]s. A version records the
//! JSON-patch `changes` it made to the model schema and the `migrate` steps
//! that upgrade and downgrade stored data. A version without parents is the
//! root; a model whose chain has more than one head is rejected with
//! `MultipleParentsError`.
//!
//! [`plan_migration`] compares the manifest against a backend's current
//! [`SchemaSnapshot`] and emits the linear list of [`SchemaAction`]s that
//! `Backend::migrate` applies.

use crate::dtype::DType;
use crate::error::{CoreResult, ErrorKind};
use crate::manifest::{Manifest, Model};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// One data migration step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrateStep {
    /// Step kind, `schema` for structural changes.
    #[serde(rename = "type")]
    pub kind: String,
    /// Expression applied when upgrading.
    pub upgrade: String,
    /// Expression applied when downgrading.
    pub downgrade: String,
}

/// A node in a model's schema version chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaVersion {
    /// Version id.
    pub id: Uuid,
    /// Creation time.
    pub date: DateTime<Utc>,
    /// Parent version ids. Empty for the root.
    #[serde(default)]
    pub parents: Vec<Uuid>,
    /// JSON-patch operations applied to the model schema.
    #[serde(default)]
    pub changes: Vec<Value>,
    /// Data migration steps.
    #[serde(default)]
    pub migrate: Vec<MigrateStep>,
}

#[derive(Deserialize)]
struct VersionHeader {
    id: Uuid,
    date: DateTime<Utc>,
    #[serde(default)]
    parents: Vec<Uuid>,
}

impl SchemaVersion {
    /// Reads a `{version: {id, date, parents}, changes, migrate}` document.
    ///
    /// # Errors
    ///
    /// Returns `InvalidManifestFile` on malformed documents.
    pub fn from_doc(doc: &Value) -> CoreResult<Self> {
        let invalid = |e: serde_json::Error| {
            ErrorKind::InvalidManifestFile
                .err()
                .with("file", "<version>")
                .with("error", e.to_string())
        };
        let header: VersionHeader =
            serde_json::from_value(doc.get("version").cloned().unwrap_or(Value::Null))
                .map_err(invalid)?;
        let changes = match doc.get("changes") {
            Some(v) if !v.is_null() => serde_json::from_value(v.clone()).map_err(invalid)?,
            _ => Vec::new(),
        };
        let migrate = match doc.get("migrate") {
            Some(v) if !v.is_null() => serde_json::from_value(v.clone()).map_err(invalid)?,
            _ => Vec::new(),
        };
        Ok(Self {
            id: header.id,
            date: header.date,
            parents: header.parents,
            changes,
            migrate,
        })
    }

    /// Inverse of [`from_doc`](Self::from_doc).
    #[must_use]
    pub fn to_doc(&self) -> Value {
        json!({
            "version": {
                "id": self.id.to_string(),
                "date": self.date.to_rfc3339(),
                "parents": self.parents.iter().map(ToString::to_string).collect::<Vec<_>>(),
            },
            "changes": self.changes,
            "migrate": self.migrate,
        })
    }

    /// Builds the version recording `actions` on top of `parent`.
    #[must_use]
    pub fn from_actions(parent: Option<Uuid>, actions: &[SchemaAction]) -> Self {
        Self {
            id: Uuid::new_v4(),
            date: Utc::now(),
            parents: parent.into_iter().collect(),
            changes: actions.iter().map(SchemaAction::to_patch).collect(),
            migrate: actions
                .iter()
                .map(|a| MigrateStep {
                    kind: "schema".to_string(),
                    upgrade: a.upgrade_expr(),
                    downgrade: a.downgrade_expr(),
                })
                .collect(),
        }
    }
}

/// The version chain of one model.
#[derive(Debug, Clone)]
pub struct VersionChain<'a> {
    model: &'a str,
    versions: &'a [SchemaVersion],
}

impl<'a> VersionChain<'a> {
    /// Wraps the versions of a model.
    #[must_use]
    pub fn new(model: &'a Model) -> Self {
        Self {
            model: &model.name,
            versions: &model.versions,
        }
    }

    /// The single version no other version names as parent.
    ///
    /// # Errors
    ///
    /// `MultipleParentsError` when there is more than one head,
    /// `InvalidManifestFile` when a parent id is unknown.
    pub fn head(&self) -> CoreResult<Option<&'a SchemaVersion>> {
        let ids: BTreeSet<Uuid> = self.versions.iter().map(|v| v.id).collect();
        let mut referenced = BTreeSet::new();
        for v in self.versions {
            for parent in &v.parents {
                if !ids.contains(parent) {
                    return Err(ErrorKind::InvalidManifestFile
                        .err()
                        .model(self.model)
                        .with("file", "<version>")
                        .with("error", format!("unknown parent version {parent}"))
                        .into());
                }
                referenced.insert(*parent);
            }
        }
        let heads: Vec<&SchemaVersion> =
            self.versions.iter().filter(|v| !referenced.contains(&v.id)).collect();
        match heads.len() {
            0 if self.versions.is_empty() => Ok(None),
            1 => Ok(Some(heads[0])),
            _ => Err(ErrorKind::MultipleParentsError
                .err()
                .model(self.model)
                .with(
                    "heads",
                    heads.iter().map(|v| v.id.to_string()).collect::<Vec<_>>(),
                )
                .into()),
        }
    }

    /// Versions from the root to the head.
    ///
    /// # Errors
    ///
    /// Same as [`head`](Self::head).
    pub fn linear(&self) -> CoreResult<Vec<&'a SchemaVersion>> {
        let mut out = Vec::new();
        let mut current = self.head()?;
        while let Some(v) = current {
            out.push(v);
            current = v
                .parents
                .first()
                .and_then(|p| self.versions.iter().find(|c| c.id == *p));
        }
        out.reverse();
        Ok(out)
    }
}

/// A stored column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    /// Column (top-level property) name.
    pub name: String,
    /// Type name.
    #[serde(rename = "type")]
    pub dtype: String,
    /// Accepts `NULL`.
    pub nullable: bool,
}

/// A stored table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    /// Table (model) name.
    pub name: String,
    /// Columns in declaration order.
    pub columns: Vec<ColumnSchema>,
}

/// Tables a backend currently holds, by name.
pub type SchemaSnapshot = BTreeMap<String, TableSchema>;

/// A structural change to backend storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum SchemaAction {
    /// Create a table with its change log.
    CreateTable {
        /// Table to create.
        table: TableSchema,
    },
    /// Add a column.
    AddColumn {
        /// Table name.
        table: String,
        /// Column to add.
        column: ColumnSchema,
    },
    /// Change a column's type or nullability.
    AlterColumn {
        /// Table name.
        table: String,
        /// Column before the change.
        from: ColumnSchema,
        /// Column after the change.
        to: ColumnSchema,
    },
    /// Drop a column.
    DropColumn {
        /// Table name.
        table: String,
        /// Column name.
        column: String,
    },
    /// Drop a table with its change log.
    DropTable {
        /// Table name.
        table: String,
    },
}

impl SchemaAction {
    /// Table the action applies to.
    #[must_use]
    pub fn table(&self) -> &str {
        match self {
            Self::CreateTable { table } => &table.name,
            Self::AddColumn { table, .. }
            | Self::AlterColumn { table, .. }
            | Self::DropColumn { table, .. }
            | Self::DropTable { table } => table,
        }
    }

    /// The action as a JSON-patch operation on the model schema.
    #[must_use]
    pub fn to_patch(&self) -> Value {
        match self {
            Self::CreateTable { table } => json!({"op": "add", "path": "", "value": table}),
            Self::AddColumn { column, .. } => json!({
                "op": "add",
                "path": format!("/properties/{}", column.name),
                "value": column,
            }),
            Self::AlterColumn { to, .. } => json!({
                "op": "replace",
                "path": format!("/properties/{}", to.name),
                "value": to,
            }),
            Self::DropColumn { column, .. } => json!({
                "op": "remove",
                "path": format!("/properties/{column}"),
            }),
            Self::DropTable { .. } => json!({"op": "remove", "path": ""}),
        }
    }

    fn upgrade_expr(&self) -> String {
        match self {
            Self::CreateTable { table } => format!("create_table({:?})", table.name),
            Self::AddColumn { column, .. } => {
                format!("add_column({:?}, {:?})", column.name, column.dtype)
            }
            Self::AlterColumn { to, .. } => format!("alter_column({:?}, {:?})", to.name, to.dtype),
            Self::DropColumn { column, .. } => format!("drop_column({column:?})"),
            Self::DropTable { table } => format!("drop_table({table:?})"),
        }
    }

    fn downgrade_expr(&self) -> String {
        match self {
            Self::CreateTable { table } => format!("drop_table({:?})", table.name),
            Self::AddColumn { column, .. } => format!("drop_column({:?})", column.name),
            Self::AlterColumn { from, .. } => {
                format!("alter_column({:?}, {:?})", from.name, from.dtype)
            }
            Self::DropColumn { column, .. } => format!("add_column({column:?})"),
            Self::DropTable { table } => format!("create_table({table:?})"),
        }
    }
}

/// Stored table layout of a model: every stored top-level property except
/// `_type`, `_op` and `_where`.
#[must_use]
pub fn table_schema(manifest: &Manifest, model: &Model) -> TableSchema {
    let columns = manifest
        .top_properties(model.id)
        .filter(|p| !matches!(p.name.as_str(), "_type" | "_op" | "_where"))
        .filter(|p| p.dtype.is_stored())
        .map(|p| ColumnSchema {
            name: p.name.clone(),
            dtype: match &p.dtype {
                DType::Geometry(g) => match g.srid {
                    Some(srid) => format!("geometry({srid})"),
                    None => "geometry".to_string(),
                },
                other => other.name().to_string(),
            },
            nullable: p.nullable,
        })
        .collect();
    TableSchema {
        name: model.name.clone(),
        columns,
    }
}

/// The snapshot a backend would hold after bootstrapping `models`.
#[must_use]
pub fn expected_schema<'a>(
    manifest: &Manifest,
    models: impl IntoIterator<Item = &'a Model>,
) -> SchemaSnapshot {
    models
        .into_iter()
        .map(|m| (m.name.clone(), table_schema(manifest, m)))
        .collect()
}

/// `models` in declaration order, except that a ref target comes before every
/// model referencing it. Targets outside `models` are ignored.
fn creation_order<'a>(manifest: &Manifest, models: Vec<&'a Model>) -> Vec<&'a Model> {
    fn visit<'a>(
        manifest: &Manifest,
        models: &[&'a Model],
        index: usize,
        seen: &mut BTreeSet<usize>,
        ordered: &mut Vec<&'a Model>,
    ) {
        if !seen.insert(index) {
            return;
        }
        let model = models[index];
        for prop in manifest.top_properties(model.id) {
            let DType::Ref(r) = &prop.dtype else {
                continue;
            };
            if let Some(target) = models.iter().position(|m| m.id == r.model) {
                visit(manifest, models, target, seen, ordered);
            }
        }
        ordered.push(model);
    }

    let mut seen = BTreeSet::new();
    let mut ordered = Vec::with_capacity(models.len());
    for index in 0..models.len() {
        visit(manifest, &models, index, &mut seen, &mut ordered);
    }
    ordered
}

/// Actions turning `current` into the layout of `models`: table creations
/// first, ref targets before the tables pointing at them, then column
/// changes, then drops.
#[must_use]
pub fn plan_migration<'a>(
    manifest: &Manifest,
    models: impl IntoIterator<Item = &'a Model>,
    current: &SchemaSnapshot,
) -> Vec<SchemaAction> {
    let ordered = creation_order(manifest, models.into_iter().collect());
    let expected: Vec<TableSchema> = ordered.iter().map(|m| table_schema(manifest, m)).collect();
    let mut creates = Vec::new();
    let mut changes = Vec::new();
    let mut drops = Vec::new();

    for table in &expected {
        let name = &table.name;
        let Some(existing) = current.get(name) else {
            creates.push(SchemaAction::CreateTable {
                table: table.clone(),
            });
            continue;
        };
        for column in &table.columns {
            match existing.columns.iter().find(|c| c.name == column.name) {
                None => changes.push(SchemaAction::AddColumn {
                    table: name.clone(),
                    column: column.clone(),
                }),
                Some(old) if old != column => changes.push(SchemaAction::AlterColumn {
                    table: name.clone(),
                    from: old.clone(),
                    to: column.clone(),
                }),
                Some(_) => {}
            }
        }
        for old in &existing.columns {
            if !table.columns.iter().any(|c| c.name == old.name) {
                changes.push(SchemaAction::DropColumn {
                    table: name.clone(),
                    column: old.name.clone(),
                });
            }
        }
    }
    for name in current.keys() {
        if !expected.iter().any(|t| &t.name == name) {
            drops.push(SchemaAction::DropTable {
                table: name.clone(),
            });
        }
    }

    creates.extend(changes);
    creates.extend(drops);
    creates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::load::load_yaml_str;

    fn version(id: u128, parents: &[u128]) -> SchemaVersion {
        SchemaVersion {
            id: Uuid::from_u128(id),
            date: Utc::now(),
            parents: parents.iter().map(|p| Uuid::from_u128(*p)).collect(),
            changes: Vec::new(),
            migrate: Vec::new(),
        }
    }

    fn model_with(versions: Vec<SchemaVersion>) -> Model {
        let manifest = load_yaml_str("type: model\nname: report\n").unwrap();
        let mut model = manifest.model_by_name("report").unwrap().clone();
        model.versions = versions;
        model
    }

    #[test]
    fn linear_chain() {
        let model = model_with(vec![version(1, &[]), version(2, &[1]), version(3, &[2])]);
        let chain = VersionChain::new(&model);
        assert_eq!(chain.head().unwrap().unwrap().id, Uuid::from_u128(3));
        let ids: Vec<u128> = chain.linear().unwrap().iter().map(|v| v.id.as_u128()).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn multiple_heads() {
        let model = model_with(vec![version(1, &[]), version(2, &[1]), version(3, &[1])]);
        let err = VersionChain::new(&model).head().unwrap_err();
        assert_eq!(err.code(), "MultipleParentsError");
        assert_eq!(err.context()["model"], "report");
    }

    #[test]
    fn unknown_parent() {
        let model = model_with(vec![version(2, &[9])]);
        assert_eq!(
            VersionChain::new(&model).head().unwrap_err().code(),
            "InvalidManifestFile"
        );
        assert!(VersionChain::new(&model_with(Vec::new())).head().unwrap().is_none());
    }

    #[test]
    fn doc_roundtrip() {
        let v = SchemaVersion::from_actions(
            Some(Uuid::from_u128(1)),
            &[SchemaAction::DropColumn {
                table: "report".into(),
                column: "status".into(),
            }],
        );
        let back = SchemaVersion::from_doc(&v.to_doc()).unwrap();
        assert_eq!(back.id, v.id);
        assert_eq!(back.parents, v.parents);
        assert_eq!(back.changes, vec![json!({"op": "remove", "path": "/properties/status"})]);
        assert_eq!(back.migrate[0].upgrade, "drop_column(\"status\")");
        assert_eq!(back.migrate[0].downgrade, "add_column(\"status\")");
    }

    #[test]
    fn planning() {
        let manifest = load_yaml_str(
            r"
type: model
name: report
properties:
  status: {type: string}
  count: {type: integer, required: true}
---
type: model
name: city
properties:
  name: {type: string}
",
        )
        .unwrap();

        let actions = plan_migration(&manifest, manifest.models(), &SchemaSnapshot::new());
        assert_eq!(actions.len(), 2);
        assert!(matches!(&actions[0], SchemaAction::CreateTable { table } if table.name == "report"));
        let SchemaAction::CreateTable { table } = &actions[0] else {
            unreachable!()
        };
        let names: Vec<&str> = table.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["_id", "_revision", "status", "count"]);

        let mut current = expected_schema(&manifest, manifest.models());
        let report = current.get_mut("report").unwrap();
        report.columns.retain(|c| c.name != "status");
        report.columns.iter_mut().find(|c| c.name == "count").unwrap().nullable = true;
        report.columns.push(ColumnSchema {
            name: "legacy".into(),
            dtype: "string".into(),
            nullable: true,
        });
        current.insert(
            "old".into(),
            TableSchema {
                name: "old".into(),
                columns: Vec::new(),
            },
        );

        let actions = plan_migration(&manifest, manifest.models(), &current);
        let kinds: Vec<String> = actions
            .iter()
            .map(|a| a.to_patch()["op"].as_str().unwrap().to_string() + " " + a.table())
            .collect();
        assert_eq!(
            kinds,
            vec!["add report", "replace report", "remove report", "remove old"]
        );
    }

    #[test]
    fn ref_targets_are_created_first() {
        let manifest = load_yaml_str(
            r"
type: model
name: report
properties:
  city: {type: ref, model: city}
---
type: model
name: city
properties:
  country: {type: ref, model: country}
---
type: model
name: note
properties:
  text: {type: string}
---
type: model
name: country
properties:
  name: {type: string}
",
        )
        .unwrap();

        let actions = plan_migration(&manifest, manifest.models(), &SchemaSnapshot::new());
        let tables: Vec<&str> = actions.iter().map(SchemaAction::table).collect();
        assert_eq!(tables, vec!["country", "city", "report", "note"]);
    }
}
