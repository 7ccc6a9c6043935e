//! Declarative manifest documents.
//!
//! Every manifest source (YAML files, inline configuration, documents kept by
//! a backend, the tabular CSV form) is first read into [`ManifestDocs`], then
//! linked into a [`Manifest`]. [`Manifest::to_docs`] goes the other way, so a
//! linked manifest can be dumped and loaded again.

use super::{link, tabular, Manifest, Property, RESERVED};
use crate::config::{ManifestKind, ManifestSource};
use crate::dtype::DType;
use crate::error::{CoreError, CoreResult, ErrorKind};
use crate::migration::SchemaVersion;
use crate::types::Access;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::marker::PhantomData;
use std::path::Path;
use tracing::debug;

/// An ordered mapping that keeps declaration order on both read and write.
#[derive(Debug, Clone, PartialEq)]
pub struct Named<T>(pub Vec<(String, T)>);

impl<T> Default for Named<T> {
    fn default() -> Self {
        Self(Vec::new())
    }
}

impl<T> Named<T> {
    /// Returns `true` when there are no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Looks an entry up by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&T> {
        self.0.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }
}

impl<T: Serialize> Serialize for Named<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (k, v) in &self.0 {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Named<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct NamedVisitor<T>(PhantomData<T>);

        impl<'de, T: Deserialize<'de>> Visitor<'de> for NamedVisitor<T> {
            type Value = Named<T>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a mapping")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut entries = Vec::new();
                while let Some((k, v)) = access.next_entry::<String, T>()? {
                    entries.push((k, v));
                }
                Ok(Named(entries))
            }

            fn visit_unit<E: serde::de::Error>(self) -> Result<Self::Value, E> {
                Ok(Named(Vec::new()))
            }
        }

        deserializer.deserialize_any(NamedVisitor(PhantomData))
    }
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// `dataset` document.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct DatasetDoc {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access: Option<Access>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<u8>,
    #[serde(default, skip_serializing_if = "Named::is_empty")]
    pub resources: Named<ResourceDoc>,
}

/// A resource inside a dataset document.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct ResourceDoc {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prepare: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<ParamDoc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access: Option<Access>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<u8>,
}

/// A resource parameter.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct ParamDoc {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub source: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prepare: Option<String>,
}

/// External mapping of a model or property.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct ExternalDoc {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prepare: Option<String>,
}

/// `model` document.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct ModelDoc {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<ExternalDoc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pkeys: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access: Option<Access>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Named::is_empty")]
    pub properties: Named<PropertyDoc>,
    #[serde(skip)]
    pub versions: Vec<SchemaVersion>,
}

/// A property inside a model document.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct PropertyDoc {
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub required: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub unique: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub hidden: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nullable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access: Option<Access>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub choices: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prepare: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<ExternalDoc>,
    /// Target model of `ref`/`backref`.
    #[serde(default, alias = "ref", skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub refprops: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intermediate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<PropertyDoc>>,
    #[serde(default, skip_serializing_if = "Named::is_empty")]
    pub properties: Named<PropertyDoc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl PropertyDoc {
    /// A property of the given type with every other field defaulted.
    pub fn of_type(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            ..Self::default()
        }
    }
}

/// One manifest document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
#[allow(missing_docs)]
pub enum NodeDoc {
    Dataset(DatasetDoc),
    Model(ModelDoc),
}

/// Every document of a manifest, in order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ManifestDocs {
    /// Dataset and model documents.
    pub nodes: Vec<NodeDoc>,
}

fn invalid_file(file: &str, error: impl fmt::Display) -> CoreError {
    ErrorKind::InvalidManifestFile
        .err()
        .with("file", file)
        .with("error", error.to_string())
        .into()
}

impl ManifestDocs {
    /// Reads documents from JSON values. A document with a `version` key
    /// attaches a schema version to the model document before it.
    ///
    /// # Errors
    ///
    /// Returns `InvalidManifestFile` for documents of unknown shape.
    pub fn from_values(values: Vec<Value>, file: &str) -> CoreResult<Self> {
        let mut docs = Self::default();
        for value in values {
            if value.is_null() {
                continue;
            }
            if value.get("version").is_some() {
                let version = SchemaVersion::from_doc(&value)?;
                match docs.nodes.last_mut() {
                    Some(NodeDoc::Model(model)) => model.versions.push(version),
                    _ => return Err(invalid_file(file, "version without a model")),
                }
                continue;
            }
            let node: NodeDoc = serde_json::from_value(value).map_err(|e| invalid_file(file, e))?;
            docs.nodes.push(node);
        }
        Ok(docs)
    }

    /// Reads a multi-document YAML string.
    ///
    /// # Errors
    ///
    /// Returns `InvalidManifestFile` on YAML or shape errors.
    pub fn from_yaml(text: &str, file: &str) -> CoreResult<Self> {
        let mut values = Vec::new();
        for doc in serde_yaml::Deserializer::from_str(text) {
            values.push(Value::deserialize(doc).map_err(|e| invalid_file(file, e))?);
        }
        Self::from_values(values, file)
    }

    /// Reads a YAML file, or every `*.yml`/`*.yaml` file of a directory in
    /// name order.
    ///
    /// # Errors
    ///
    /// `FileNotFound` for a missing path, `InvalidManifestFile` for bad files.
    pub fn read_yaml(path: &Path) -> CoreResult<Self> {
        if !path.exists() {
            return Err(ErrorKind::FileNotFound
                .err()
                .with("file", path.display().to_string())
                .into());
        }
        let mut files = Vec::new();
        if path.is_dir() {
            for entry in std::fs::read_dir(path)? {
                let p = entry?.path();
                if matches!(p.extension().and_then(|e| e.to_str()), Some("yml" | "yaml")) {
                    files.push(p);
                }
            }
            files.sort();
        } else {
            files.push(path.to_path_buf());
        }

        let mut docs = Self::default();
        for file in files {
            let text = std::fs::read_to_string(&file)?;
            let part = Self::from_yaml(&text, &file.display().to_string())?;
            docs.nodes.extend(part.nodes);
        }
        Ok(docs)
    }

    /// Documents as JSON values, schema versions following their model.
    #[must_use]
    pub fn to_values(&self) -> Vec<Value> {
        let mut out = Vec::new();
        for node in &self.nodes {
            out.push(serde_json::to_value(node).unwrap_or(Value::Null));
            if let NodeDoc::Model(model) = node {
                out.extend(model.versions.iter().map(SchemaVersion::to_doc));
            }
        }
        out
    }

    /// Writes a multi-document YAML string.
    ///
    /// # Errors
    ///
    /// Returns `InvalidManifestFile` if a document cannot be encoded.
    pub fn to_yaml(&self) -> CoreResult<String> {
        let mut out = String::new();
        for value in self.to_values() {
            if !out.is_empty() {
                out.push_str("---\n");
            }
            out.push_str(&serde_yaml::to_string(&value).map_err(|e| invalid_file("<dump>", e))?);
        }
        Ok(out)
    }

    /// Links the documents into a manifest.
    ///
    /// # Errors
    ///
    /// Any link or check error.
    pub fn link(self) -> CoreResult<Manifest> {
        link::link(self)
    }
}

/// Loads, links and checks the manifest a configuration points at.
/// `backend_docs` supplies the documents for [`ManifestKind::Backend`].
///
/// # Errors
///
/// Returns load, link or check errors.
pub fn load_manifest(source: &ManifestSource, backend_docs: Option<Vec<Value>>) -> CoreResult<Manifest> {
    let docs = match source.kind {
        ManifestKind::Yaml => ManifestDocs::read_yaml(required_path(source)?)?,
        ManifestKind::Tabular => tabular::read_path(required_path(source)?)?,
        ManifestKind::Memory => ManifestDocs::from_values(source.nodes.clone(), "<config>")?,
        ManifestKind::Backend => {
            ManifestDocs::from_values(backend_docs.unwrap_or_default(), "<backend>")?
        }
    };
    debug!(nodes = docs.nodes.len(), kind = ?source.kind, "loaded manifest documents");
    docs.link()
}

fn required_path(source: &ManifestSource) -> CoreResult<&Path> {
    source
        .path
        .as_deref()
        .ok_or_else(|| CoreError::config("manifest.path is required"))
}

/// Loads a manifest from a YAML string.
///
/// # Errors
///
/// Returns load, link or check errors.
pub fn load_yaml_str(text: &str) -> CoreResult<Manifest> {
    ManifestDocs::from_yaml(text, "<string>")?.link()
}

impl Manifest {
    /// Dumps the manifest back into documents.
    #[must_use]
    pub fn to_docs(&self) -> ManifestDocs {
        let mut nodes = Vec::new();
        for ds in &self.datasets {
            nodes.push(NodeDoc::Dataset(DatasetDoc {
                name: ds.name.clone(),
                title: ds.title.clone(),
                description: ds.description.clone(),
                access: ds.access,
                level: ds.level,
                resources: Named(
                    ds.resources
                        .iter()
                        .map(|id| {
                            let r = self.resource(*id);
                            (
                                r.name.clone(),
                                ResourceDoc {
                                    backend: Some(r.backend.clone()),
                                    source: r.source.clone(),
                                    prepare: r.prepare.as_ref().map(ToString::to_string),
                                    params: r
                                        .params
                                        .iter()
                                        .map(|p| ParamDoc {
                                            name: p.name.clone(),
                                            source: p.source.clone(),
                                            prepare: p.prepare.as_ref().map(ToString::to_string),
                                        })
                                        .collect(),
                                    access: Some(r.access),
                                    level: r.level,
                                },
                            )
                        })
                        .collect(),
                ),
            }));
        }
        for model in &self.models {
            let pkeys = self.pkey_places(model.id);
            nodes.push(NodeDoc::Model(ModelDoc {
                name: model.name.clone(),
                title: model.title.clone(),
                description: model.description.clone(),
                dataset: model.dataset.map(|id| self.dataset(id).name.clone()),
                resource: model.resource.map(|id| self.resource(id).name.clone()),
                backend: Some(model.backend.clone()),
                external: model.external.as_ref().map(|e| ExternalDoc {
                    source: e.source.clone(),
                    prepare: e.prepare.as_ref().map(ToString::to_string),
                }),
                pkeys: if pkeys == ["_id"] { Vec::new() } else { pkeys },
                access: Some(model.access),
                level: model.level,
                endpoint: model.endpoint.clone(),
                properties: Named(
                    self.top_properties(model.id)
                        .filter(|p| !RESERVED.contains(&p.name.as_str()))
                        .map(|p| (p.name.clone(), self.property_doc(p)))
                        .collect(),
                ),
                versions: model.versions.clone(),
            }));
        }
        ManifestDocs { nodes }
    }

    fn property_doc(&self, prop: &Property) -> PropertyDoc {
        let mut doc = PropertyDoc {
            type_name: prop.dtype.name().to_string(),
            required: prop.required,
            unique: prop.unique,
            hidden: prop.hidden,
            nullable: (prop.nullable == prop.required).then_some(prop.nullable),
            access: Some(prop.access),
            level: prop.level,
            default: prop.default.clone(),
            choices: prop.choices.clone(),
            prepare: prop.prepare.as_ref().map(ToString::to_string),
            external: prop.external.as_ref().map(|e| ExternalDoc {
                source: e.source.clone(),
                prepare: e.prepare.as_ref().map(ToString::to_string),
            }),
            title: prop.title.clone(),
            description: prop.description.clone(),
            ..PropertyDoc::default()
        };
        match &prop.dtype {
            DType::Ref(r) => {
                doc.model = Some(self.model(r.model).name.clone());
                if r.explicit {
                    doc.refprops = r
                        .refprops
                        .iter()
                        .map(|id| self.property(*id).place.clone())
                        .collect();
                }
            }
            DType::BackRef(b) => {
                doc.model = Some(self.model(b.model).name.clone());
                doc.refprops = vec![self.property(b.refprop).place.clone()];
            }
            DType::Array(arr) => {
                doc.items = Some(Box::new(self.property_doc(self.property(arr.items))));
                doc.intermediate = arr
                    .intermediate
                    .as_ref()
                    .map(|i| self.model(i.model).name.clone());
            }
            DType::Object(obj) => {
                doc.properties = Named(
                    obj.properties
                        .iter()
                        .map(|id| {
                            let child = self.property(*id);
                            (child.name.clone(), self.property_doc(child))
                        })
                        .collect(),
                );
            }
            DType::Geometry(g) => {
                let args: Vec<String> = g
                    .kind
                    .iter()
                    .cloned()
                    .chain(g.srid.map(|s| s.to_string()))
                    .collect();
                if !args.is_empty() {
                    doc.type_name = format!("geometry({})", args.join(", "));
                }
            }
            _ => {}
        }
        doc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r"
type: dataset
name: example
resources:
  db:
    backend: default
---
type: model
name: example/Language
properties:
  code: {type: string, unique: true}
---
type: model
name: example/Country
endpoint: countries
properties:
  name: {type: string, required: true}
  location: {type: 'geometry(point, 3346)'}
  meta:
    type: object
    properties:
      author: {type: string}
  languages:
    type: array
    intermediate: example/Country_Language
    items: {type: ref, model: Language}
---
version:
  id: 3c2b0a55-94b2-4bbc-9d0a-6b7cf2b3a3b1
  date: 2024-01-01T00:00:00Z
  parents: []
changes: []
migrate:
  - type: schema
    upgrade: create_table()
    downgrade: drop_table()
---
type: model
name: example/Country_Language
properties:
  country: {type: ref, model: Country}
  language: {type: ref, model: Language}
";

    #[test]
    fn property_order_is_kept() {
        let docs = ManifestDocs::from_yaml(YAML, "test.yml").unwrap();
        let NodeDoc::Model(country) = &docs.nodes[2] else {
            panic!("expected model");
        };
        let names: Vec<&str> = country.properties.0.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["name", "location", "meta", "languages"]);
        assert_eq!(country.versions.len(), 1);
    }

    #[test]
    fn dump_and_load_again() {
        let first = load_yaml_str(YAML).unwrap();
        let dumped = first.to_docs().to_yaml().unwrap();
        let second = load_yaml_str(&dumped).unwrap();
        assert_eq!(first.to_docs(), second.to_docs());
        assert_eq!(second.model_by_name("countries").unwrap().name, "example/Country");
        assert_eq!(second.model_by_name("example/Country").unwrap().versions.len(), 1);
    }

    #[test]
    fn bad_documents() {
        let err = ManifestDocs::from_yaml("type: widget\nname: x\n", "bad.yml").unwrap_err();
        assert_eq!(err.code(), "InvalidManifestFile");
        assert_eq!(err.context()["file"], "bad.yml");

        let err = ManifestDocs::from_yaml("version: {id: x}\n", "bad.yml").unwrap_err();
        assert_eq!(err.code(), "InvalidManifestFile");
    }

    #[test]
    fn directory_of_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.yml"), "type: model\nname: a\n").unwrap();
        std::fs::write(dir.path().join("b.yaml"), "type: model\nname: b\n").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        let docs = ManifestDocs::read_yaml(dir.path()).unwrap();
        assert_eq!(docs.nodes.len(), 2);

        let err = ManifestDocs::read_yaml(&dir.path().join("missing")).unwrap_err();
        assert_eq!(err.code(), "FileNotFound");
    }

    #[test]
    fn memory_source() {
        let source = ManifestSource {
            kind: ManifestKind::Memory,
            path: None,
            nodes: vec![serde_json::json!({"type": "model", "name": "report"})],
        };
        let manifest = load_manifest(&source, None).unwrap();
        assert!(manifest.find_model("report").is_some());
    }
}
