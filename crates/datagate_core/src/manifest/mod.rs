//! The manifest: an arena of datasets, resources, models and properties.
//!
//! Nodes are read from declarative documents ([`load`]), linked into the
//! arena ([`link`]) and checked for cross-node constraints. Cross references
//! are arena ids. A [`Manifest`] is only handed out after a successful link
//! and check, and it has no public mutators.

pub mod load;
pub mod link;
pub mod tabular;

use crate::dtype::DType;
use crate::error::{CoreResult, ErrorKind};
use crate::migration::SchemaVersion;
use crate::types::{Access, DatasetId, ModelId, PropertyId, ResourceId};
use datagate_expr::Node;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

pub use load::{load_manifest, ManifestDocs};

/// Names of the implicit properties installed on every model.
pub const RESERVED: [&str; 5] = ["_id", "_revision", "_type", "_op", "_where"];

/// Node kinds that can be listed by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum NodeKind {
    Dataset,
    Resource,
    Model,
    Property,
    Namespace,
    Endpoint,
}

/// A named collection of resources.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    /// Arena id.
    pub id: DatasetId,
    /// Dataset name, also the namespace prefix of its models.
    pub name: String,
    /// Human readable title.
    pub title: Option<String>,
    /// Longer description.
    pub description: Option<String>,
    /// Access level inherited by resources and models.
    pub access: Option<Access>,
    /// Quality level inherited by resources and models.
    pub level: Option<u8>,
    /// Resources in declaration order.
    pub resources: Vec<ResourceId>,
}

/// A parameter of a resource, expanded before reading external data.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    /// Parameter name, referenced by `param(name)`.
    pub name: String,
    /// Literal values, one read per value.
    pub source: Vec<Value>,
    /// Expression producing values (e.g. `read().next`).
    pub prepare: Option<Node>,
}

/// A concrete data source inside a dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    /// Arena id.
    pub id: ResourceId,
    /// Owning dataset.
    pub dataset: DatasetId,
    /// Resource name.
    pub name: String,
    /// Source string: file path, URL or DSN fragment.
    pub source: Option<String>,
    /// Name of the backend serving this resource.
    pub backend: String,
    /// Templated read parameters.
    pub params: Vec<Param>,
    /// Prepare expression applied to the source.
    pub prepare: Option<Node>,
    /// Access level, inherited from the dataset when unset.
    pub access: Access,
    /// Quality level, inherited from the dataset when unset.
    pub level: Option<u8>,
}

/// Mapping of a model or property onto external data.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct External {
    /// Table, file, column or path in the source.
    pub source: Option<String>,
    /// Prepare expression applied while reading.
    pub prepare: Option<Node>,
}

/// A named record type.
#[derive(Debug, Clone, PartialEq)]
pub struct Model {
    /// Arena id.
    pub id: ModelId,
    /// Full name, e.g. `example/Country`.
    pub name: String,
    /// Human readable title.
    pub title: Option<String>,
    /// Longer description.
    pub description: Option<String>,
    /// Owning dataset.
    pub dataset: Option<DatasetId>,
    /// Resource the model reads from.
    pub resource: Option<ResourceId>,
    /// Name of the backend storing rows.
    pub backend: String,
    /// External mapping for read-through models.
    pub external: Option<External>,
    /// Top-level properties in declaration order, implicit ones first.
    pub properties: Vec<PropertyId>,
    /// Every addressable property by dotted place.
    pub flat: BTreeMap<String, PropertyId>,
    /// Primary key properties. `[_id]` unless declared.
    pub pkeys: Vec<PropertyId>,
    /// Effective access level.
    pub access: Access,
    /// Effective quality level.
    pub level: Option<u8>,
    /// Endpoint alias.
    pub endpoint: Option<String>,
    /// Schema version chain.
    pub versions: Vec<SchemaVersion>,
}

impl Model {
    /// Last path segment of the name.
    #[must_use]
    pub fn basename(&self) -> &str {
        self.name.rsplit('/').next().unwrap_or(&self.name)
    }

    /// Namespace part of the name, empty for top-level models.
    #[must_use]
    pub fn namespace(&self) -> &str {
        self.name.rsplit_once('/').map_or("", |(ns, _)| ns)
    }
}

/// A typed field of a model, or a nested sub-field.
#[derive(Debug, Clone, PartialEq)]
pub struct Property {
    /// Arena id.
    pub id: PropertyId,
    /// Owning model.
    pub model: ModelId,
    /// Leaf name.
    pub name: String,
    /// Dotted path from the model root. Array items share their array's place.
    pub place: String,
    /// Enclosing object or array property.
    pub parent: Option<PropertyId>,
    /// Data type.
    pub dtype: DType,
    /// Must be given on insert.
    pub required: bool,
    /// Value must be unique within the model.
    pub unique: bool,
    /// Accepts `null`.
    pub nullable: bool,
    /// Excluded from default projections.
    pub hidden: bool,
    /// Effective access level.
    pub access: Access,
    /// Effective quality level.
    pub level: Option<u8>,
    /// Value used on insert when none is given.
    pub default: Option<Value>,
    /// Allowed values. Empty means unrestricted.
    pub choices: Vec<Value>,
    /// Prepare expression.
    pub prepare: Option<Node>,
    /// External mapping.
    pub external: Option<External>,
    /// Human readable title.
    pub title: Option<String>,
    /// Longer description.
    pub description: Option<String>,
}

impl Property {
    /// Returns `true` for `_id`, `_revision` and friends.
    #[must_use]
    pub fn is_reserved(&self) -> bool {
        self.parent.is_none() && RESERVED.contains(&self.name.as_str())
    }
}

/// A derived namespace node.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Namespace {
    /// Full namespace path, empty for the root.
    pub name: String,
    /// Child namespaces by full path.
    pub namespaces: BTreeSet<String>,
    /// Models registered directly in this namespace.
    pub models: BTreeSet<String>,
}

/// The linked and checked schema graph.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    pub(crate) datasets: Vec<Dataset>,
    pub(crate) resources: Vec<Resource>,
    pub(crate) models: Vec<Model>,
    pub(crate) properties: Vec<Property>,
    pub(crate) dataset_index: BTreeMap<String, DatasetId>,
    pub(crate) model_index: BTreeMap<String, ModelId>,
    pub(crate) namespaces: BTreeMap<String, Namespace>,
    pub(crate) endpoints: BTreeMap<String, ModelId>,
    pub(crate) backends: BTreeSet<String>,
}

impl Manifest {
    /// Returns a dataset.
    #[must_use]
    pub fn dataset(&self, id: DatasetId) -> &Dataset {
        &self.datasets[id.index()]
    }

    /// Returns a resource.
    #[must_use]
    pub fn resource(&self, id: ResourceId) -> &Resource {
        &self.resources[id.index()]
    }

    /// Returns a model.
    #[must_use]
    pub fn model(&self, id: ModelId) -> &Model {
        &self.models[id.index()]
    }

    /// Returns a property.
    #[must_use]
    pub fn property(&self, id: PropertyId) -> &Property {
        &self.properties[id.index()]
    }

    /// Every dataset.
    pub fn datasets(&self) -> impl Iterator<Item = &Dataset> {
        self.datasets.iter()
    }

    /// Every model in declaration order.
    pub fn models(&self) -> impl Iterator<Item = &Model> {
        self.models.iter()
    }

    /// Looks a dataset up by name.
    #[must_use]
    pub fn find_dataset(&self, name: &str) -> Option<&Dataset> {
        self.dataset_index.get(name).map(|id| self.dataset(*id))
    }

    /// Looks a model up by name or endpoint alias.
    #[must_use]
    pub fn find_model(&self, name: &str) -> Option<&Model> {
        self.model_index
            .get(name)
            .or_else(|| self.endpoints.get(name))
            .map(|id| self.model(*id))
    }

    /// Looks a model up by name or endpoint alias.
    ///
    /// # Errors
    ///
    /// Returns `ModelNotFound` when neither matches.
    pub fn model_by_name(&self, name: &str) -> CoreResult<&Model> {
        self.find_model(name)
            .ok_or_else(|| ErrorKind::ModelNotFound.err().model(name).into())
    }

    /// Looks a property up by dotted place.
    #[must_use]
    pub fn find_property(&self, model: ModelId, place: &str) -> Option<&Property> {
        self.model(model).flat.get(place).map(|id| self.property(*id))
    }

    /// Looks a property up by dotted place.
    ///
    /// # Errors
    ///
    /// Returns `PropertyNotFound`.
    pub fn property_by_place(&self, model: ModelId, place: &str) -> CoreResult<&Property> {
        self.find_property(model, place).ok_or_else(|| {
            ErrorKind::PropertyNotFound
                .err()
                .model(&self.model(model).name)
                .property(place)
                .into()
        })
    }

    /// Top-level properties of a model, implicit ones first.
    pub fn top_properties(&self, model: ModelId) -> impl Iterator<Item = &Property> {
        self.model(model)
            .properties
            .iter()
            .map(|id| self.property(*id))
    }

    /// Children of an object property, or the items of an array.
    #[must_use]
    pub fn children(&self, prop: &Property) -> Vec<&Property> {
        match &prop.dtype {
            DType::Object(obj) => obj.properties.iter().map(|id| self.property(*id)).collect(),
            DType::Array(arr) => vec![self.property(arr.items)],
            _ => Vec::new(),
        }
    }

    /// Namespace by full path. The root namespace is `""`.
    #[must_use]
    pub fn namespace(&self, name: &str) -> Option<&Namespace> {
        self.namespaces.get(name)
    }

    /// Names of every backend referenced by a model or resource.
    #[must_use]
    pub fn backend_names(&self) -> &BTreeSet<String> {
        &self.backends
    }

    /// Sorted names of every node of a kind.
    #[must_use]
    pub fn node_names(&self, kind: NodeKind) -> Vec<String> {
        let mut names: Vec<String> = match kind {
            NodeKind::Dataset => self.datasets.iter().map(|d| d.name.clone()).collect(),
            NodeKind::Resource => self
                .resources
                .iter()
                .map(|r| format!("{}/{}", self.dataset(r.dataset).name, r.name))
                .collect(),
            NodeKind::Model => self.models.iter().map(|m| m.name.clone()).collect(),
            NodeKind::Property => self
                .models
                .iter()
                .flat_map(|m| m.flat.keys().map(move |place| format!("{}.{place}", m.name)))
                .collect(),
            NodeKind::Namespace => self
                .namespaces
                .keys()
                .filter(|n| !n.is_empty())
                .cloned()
                .collect(),
            NodeKind::Endpoint => self.endpoints.keys().cloned().collect(),
        };
        names.sort();
        names
    }

    /// Models whose name starts with `prefix/`, or every model for `""`.
    pub fn models_under<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = &'a Model> + 'a {
        self.models.iter().filter(move |m| {
            prefix.is_empty()
                || m.name
                    .strip_prefix(prefix)
                    .is_some_and(|rest| rest.starts_with('/'))
        })
    }

    /// Primary key places of a model.
    #[must_use]
    pub fn pkey_places(&self, model: ModelId) -> Vec<String> {
        self.model(model)
            .pkeys
            .iter()
            .map(|id| self.property(*id).place.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::load::load_yaml_str;

    const DOCS: &str = r"
type: dataset
name: example
resources:
  sql:
    backend: default
---
type: model
name: example/Country
properties:
  code: {type: string, unique: true}
  name: {type: string}
---
type: model
name: example/geo/City
properties:
  name: {type: string}
  country: {type: ref, model: Country}
---
type: model
name: report
endpoint: reports
properties:
  status: {type: string}
";

    fn manifest() -> Manifest {
        load_yaml_str(DOCS).unwrap()
    }

    #[test]
    fn lookups() {
        let m = manifest();
        let country = m.model_by_name("example/Country").unwrap();
        assert_eq!(country.basename(), "Country");
        assert_eq!(country.namespace(), "example");
        assert_eq!(m.find_model("reports").unwrap().name, "report");
        assert_eq!(
            m.model_by_name("nope").unwrap_err().code(),
            "ModelNotFound"
        );
        assert_eq!(m.pkey_places(country.id), vec!["_id".to_string()]);
        assert_eq!(
            m.property_by_place(country.id, "colour").unwrap_err().code(),
            "PropertyNotFound"
        );
    }

    #[test]
    fn implicit_properties_come_first() {
        let m = manifest();
        let report = m.model_by_name("report").unwrap();
        let names: Vec<&str> = m.top_properties(report.id).map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["_id", "_revision", "_type", "_op", "_where", "status"]);
        assert!(m.find_property(report.id, "_op").unwrap().hidden);
    }

    #[test]
    fn namespaces_are_derived() {
        let m = manifest();
        let root = m.namespace("").unwrap();
        assert!(root.namespaces.contains("example"));
        assert!(root.models.contains("report"));
        let example = m.namespace("example").unwrap();
        assert!(example.namespaces.contains("example/geo"));
        assert!(example.models.contains("example/Country"));
        assert_eq!(
            m.node_names(NodeKind::Namespace),
            vec!["example".to_string(), "example/geo".to_string()]
        );
        assert_eq!(m.models_under("example").count(), 2);
    }
}
