//! Linking documents into the manifest arena, then checking cross-node
//! constraints.

use super::load::{ExternalDoc, ManifestDocs, ModelDoc, NodeDoc, PropertyDoc};
use super::{Dataset, External, Manifest, Model, Namespace, Param, Property, Resource};
use crate::dtype::{
    parse_type, ArrayType, BackRefType, DType, GeometryType, Intermediate, ObjectType, RefType,
};
use crate::error::{CoreError, CoreResult, ErrorKind};
use crate::types::{Access, DatasetId, ModelId, PropertyId, ResourceId};
use datagate_expr::Node;
use std::collections::BTreeMap;
use tracing::debug;

/// Name of the backend used when neither model nor resource names one.
pub const DEFAULT_BACKEND: &str = "default";

#[derive(Debug)]
enum Pending {
    Ref {
        prop: PropertyId,
        target: String,
        refprops: Vec<String>,
    },
    BackRef {
        prop: PropertyId,
        target: String,
        refprop: Option<String>,
    },
    Intermediate {
        prop: PropertyId,
        target: String,
    },
}

struct Linker {
    manifest: Manifest,
    pending: Vec<Pending>,
    errors: Vec<CoreError>,
}

fn invalid(model: &str, error: impl Into<String>) -> CoreError {
    ErrorKind::InvalidManifestFile
        .err()
        .model(model)
        .with("file", "<manifest>")
        .with("error", error.into())
        .into()
}

fn parse_expr(text: Option<&str>) -> CoreResult<Option<Node>> {
    text.filter(|t| !t.trim().is_empty())
        .map(datagate_expr::parse)
        .transpose()
        .map_err(CoreError::from)
}

fn external(doc: Option<&ExternalDoc>) -> CoreResult<Option<External>> {
    doc.map(|e| {
        Ok(External {
            source: e.source.clone(),
            prepare: parse_expr(e.prepare.as_deref())?,
        })
    })
    .transpose()
}

/// Links and checks documents.
///
/// # Errors
///
/// Every link and check error found, combined.
pub fn link(docs: ManifestDocs) -> CoreResult<Manifest> {
    let mut linker = Linker {
        manifest: Manifest::default(),
        pending: Vec::new(),
        errors: Vec::new(),
    };

    let mut models = Vec::new();
    for node in docs.nodes {
        match node {
            NodeDoc::Dataset(doc) => linker.add_dataset(doc)?,
            NodeDoc::Model(doc) => models.push(doc),
        }
    }

    let mut created = Vec::new();
    for doc in &models {
        created.push(linker.add_model(doc)?);
    }
    for (doc, id) in models.iter().zip(&created) {
        linker.add_properties(*id, doc)?;
    }
    for (doc, id) in models.iter().zip(&created) {
        linker.set_pkeys(*id, doc);
    }
    linker.resolve_pending();
    linker.register_endpoints(&models, &created);
    linker.register_namespaces();

    if let Some(err) = CoreError::collect(std::mem::take(&mut linker.errors)) {
        return Err(err);
    }
    check(&linker.manifest)?;
    debug!(
        datasets = linker.manifest.datasets.len(),
        models = linker.manifest.models.len(),
        properties = linker.manifest.properties.len(),
        "linked manifest"
    );
    Ok(linker.manifest)
}

impl Linker {
    fn add_dataset(&mut self, doc: super::load::DatasetDoc) -> CoreResult<()> {
        let m = &mut self.manifest;
        if m.dataset_index.contains_key(&doc.name) {
            return Err(invalid(&doc.name, format!("duplicate dataset {}", doc.name)));
        }
        let id = DatasetId(u32::try_from(m.datasets.len()).map_err(|_| CoreError::internal("too many datasets"))?);
        let mut resources = Vec::new();
        for (name, r) in doc.resources.0 {
            let rid = ResourceId(
                u32::try_from(m.resources.len()).map_err(|_| CoreError::internal("too many resources"))?,
            );
            let backend = r.backend.unwrap_or_else(|| DEFAULT_BACKEND.to_string());
            m.backends.insert(backend.clone());
            let params = r
                .params
                .into_iter()
                .map(|p| {
                    Ok(Param {
                        name: p.name,
                        source: p.source,
                        prepare: parse_expr(p.prepare.as_deref())?,
                    })
                })
                .collect::<CoreResult<Vec<_>>>()?;
            m.resources.push(Resource {
                id: rid,
                dataset: id,
                name,
                source: r.source,
                backend,
                params,
                prepare: parse_expr(r.prepare.as_deref())?,
                access: r.access.or(doc.access).unwrap_or(Access::Protected),
                level: r.level.or(doc.level),
            });
            resources.push(rid);
        }
        m.dataset_index.insert(doc.name.clone(), id);
        m.datasets.push(Dataset {
            id,
            name: doc.name,
            title: doc.title,
            description: doc.description,
            access: doc.access,
            level: doc.level,
            resources,
        });
        Ok(())
    }

    fn add_model(&mut self, doc: &ModelDoc) -> CoreResult<ModelId> {
        let m = &mut self.manifest;
        if doc.name.is_empty() {
            return Err(invalid("", "model without a name"));
        }
        if m.model_index.contains_key(&doc.name) {
            return Err(invalid(&doc.name, format!("duplicate model {}", doc.name)));
        }

        let dataset = match &doc.dataset {
            Some(name) => Some(*m.dataset_index.get(name).ok_or_else(|| -> CoreError {
                ErrorKind::UnknownProjectDataset
                    .err()
                    .model(&doc.name)
                    .with("dataset", name.as_str())
                    .into()
            })?),
            None => m
                .dataset_index
                .iter()
                .filter(|(name, _)| {
                    doc.name
                        .strip_prefix(name.as_str())
                        .is_some_and(|rest| rest.starts_with('/'))
                })
                .max_by_key(|(name, _)| name.len())
                .map(|(_, id)| *id),
        };

        let resource = match (&doc.resource, dataset) {
            (Some(name), Some(ds)) => Some(
                m.datasets[ds.index()]
                    .resources
                    .iter()
                    .copied()
                    .find(|r| m.resources[r.index()].name == *name)
                    .ok_or_else(|| -> CoreError {
                        ErrorKind::ModelSourceNotFound
                            .err()
                            .model(&doc.name)
                            .with("source", name.as_str())
                            .into()
                    })?,
            ),
            (Some(name), None) => {
                return Err(ErrorKind::ModelSourceNotFound
                    .err()
                    .model(&doc.name)
                    .with("source", name.as_str())
                    .into())
            }
            (None, Some(ds)) if doc.external.is_some() => {
                match m.datasets[ds.index()].resources.as_slice() {
                    [only] => Some(*only),
                    _ => None,
                }
            }
            (None, _) => None,
        };

        let res = resource.map(|r| &m.resources[r.index()]);
        let ds = dataset.map(|d| &m.datasets[d.index()]);
        let backend = doc
            .backend
            .clone()
            .or_else(|| res.map(|r| r.backend.clone()))
            .unwrap_or_else(|| DEFAULT_BACKEND.to_string());
        let access = doc
            .access
            .or(res.map(|r| r.access))
            .or(ds.and_then(|d| d.access))
            .unwrap_or(Access::Protected);
        let level = doc
            .level
            .or(res.and_then(|r| r.level))
            .or(ds.and_then(|d| d.level));

        let id = ModelId(u32::try_from(m.models.len()).map_err(|_| CoreError::internal("too many models"))?);
        m.backends.insert(backend.clone());
        m.model_index.insert(doc.name.clone(), id);
        m.models.push(Model {
            id,
            name: doc.name.clone(),
            title: doc.title.clone(),
            description: doc.description.clone(),
            dataset,
            resource,
            backend,
            external: external(doc.external.as_ref())?,
            properties: Vec::new(),
            flat: BTreeMap::new(),
            pkeys: Vec::new(),
            access,
            level,
            endpoint: doc.endpoint.clone(),
            versions: doc.versions.clone(),
        });

        for (name, dtype, hidden) in [
            ("_id", DType::Pk, false),
            ("_revision", DType::String, false),
            ("_type", DType::String, false),
            ("_op", DType::String, true),
            ("_where", DType::String, true),
        ] {
            let pid = self.push_property(Property {
                id: PropertyId(0),
                model: id,
                name: name.to_string(),
                place: name.to_string(),
                parent: None,
                dtype,
                required: false,
                unique: name == "_id",
                nullable: name != "_id",
                hidden,
                access,
                level,
                default: None,
                choices: Vec::new(),
                prepare: None,
                external: None,
                title: None,
                description: None,
            })?;
            let model = &mut self.manifest.models[id.index()];
            model.properties.push(pid);
            model.flat.insert(name.to_string(), pid);
        }
        Ok(id)
    }

    fn push_property(&mut self, mut prop: Property) -> CoreResult<PropertyId> {
        let id = PropertyId(
            u32::try_from(self.manifest.properties.len())
                .map_err(|_| CoreError::internal("too many properties"))?,
        );
        prop.id = id;
        self.manifest.properties.push(prop);
        Ok(id)
    }

    fn add_properties(&mut self, model: ModelId, doc: &ModelDoc) -> CoreResult<()> {
        for (name, pdoc) in &doc.properties.0 {
            if super::RESERVED.contains(&name.as_str()) {
                self.errors.push(invalid(&doc.name, format!("{name} is reserved")));
                continue;
            }
            match self.add_property(model, None, name, name, pdoc) {
                Ok(pid) => self.manifest.models[model.index()].properties.push(pid),
                Err(e) => self.errors.push(e),
            }
        }
        Ok(())
    }

    fn add_property(
        &mut self,
        model: ModelId,
        parent: Option<PropertyId>,
        name: &str,
        place: &str,
        doc: &PropertyDoc,
    ) -> CoreResult<PropertyId> {
        let model_name = self.manifest.models[model.index()].name.clone();
        let spec = parse_type(&doc.type_name).map_err(|e| match e {
            CoreError::Data(d) => d.model(&model_name).property(place).into(),
            other => other,
        })?;
        let (inherited_access, inherited_level) = match parent {
            Some(p) => {
                let p = &self.manifest.properties[p.index()];
                (p.access, p.level)
            }
            None => {
                let m = &self.manifest.models[model.index()];
                (m.access, m.level)
            }
        };
        let is_items = parent.is_some_and(|p| {
            matches!(self.manifest.properties[p.index()].dtype, DType::Array(_))
        });

        let pid = self.push_property(Property {
            id: PropertyId(0),
            model,
            name: name.to_string(),
            place: place.to_string(),
            parent,
            dtype: DType::String,
            required: doc.required,
            unique: doc.unique,
            nullable: doc.nullable.unwrap_or(!doc.required),
            hidden: doc.hidden,
            access: doc.access.unwrap_or(inherited_access),
            level: doc.level.or(inherited_level),
            default: doc.default.clone(),
            choices: doc.choices.clone(),
            prepare: parse_expr(doc.prepare.as_deref())?,
            external: external(doc.external.as_ref())?,
            title: doc.title.clone(),
            description: doc.description.clone(),
        })?;

        if !is_items {
            let flat = &mut self.manifest.models[model.index()].flat;
            if flat.insert(place.to_string(), pid).is_some() {
                return Err(invalid(&model_name, format!("duplicate property {place}")));
            }
        }

        let dtype = match spec.name.as_str() {
            "pk" => DType::Pk,
            "string" => DType::String,
            "integer" => DType::Integer,
            "number" => DType::Number,
            "boolean" => DType::Boolean,
            "date" => DType::Date,
            "datetime" => DType::DateTime,
            "uri" => DType::Uri,
            "url" => DType::Url,
            "file" => DType::File,
            "geometry" => DType::Geometry(GeometryType {
                kind: spec.geometry_kind,
                srid: spec.srid,
            }),
            "ref" => {
                let target = doc.model.clone().ok_or_else(|| {
                    invalid(&model_name, format!("ref {place} without a target model"))
                })?;
                self.pending.push(Pending::Ref {
                    prop: pid,
                    target,
                    refprops: doc.refprops.clone(),
                });
                DType::String
            }
            "backref" => {
                let target = doc.model.clone().ok_or_else(|| {
                    invalid(&model_name, format!("backref {place} without a target model"))
                })?;
                self.pending.push(Pending::BackRef {
                    prop: pid,
                    target,
                    refprop: doc.refprops.first().cloned(),
                });
                DType::String
            }
            "object" => {
                let mut children = Vec::new();
                for (child_name, child) in &doc.properties.0 {
                    let child_place = format!("{place}.{child_name}");
                    children.push(self.add_property(model, Some(pid), child_name, &child_place, child)?);
                }
                DType::Object(ObjectType {
                    properties: children,
                })
            }
            "array" => {
                let items_doc = doc.items.as_deref().ok_or_else(|| {
                    invalid(&model_name, format!("array {place} without items"))
                })?;
                // Placeholder so the items see an array parent.
                self.manifest.properties[pid.index()].dtype = DType::Array(ArrayType {
                    items: pid,
                    intermediate: None,
                });
                let items = self.add_property(model, Some(pid), name, place, items_doc)?;
                if let Some(target) = &doc.intermediate {
                    self.pending.push(Pending::Intermediate {
                        prop: pid,
                        target: target.clone(),
                    });
                }
                DType::Array(ArrayType {
                    items,
                    intermediate: None,
                })
            }
            other => return Err(invalid(&model_name, format!("unsupported type {other}"))),
        };
        self.manifest.properties[pid.index()].dtype = dtype;
        Ok(pid)
    }

    fn set_pkeys(&mut self, model: ModelId, doc: &ModelDoc) {
        let m = &self.manifest.models[model.index()];
        let mut pkeys = Vec::new();
        for name in &doc.pkeys {
            match m.flat.get(name) {
                Some(pid) => pkeys.push(*pid),
                None => self.errors.push(
                    ErrorKind::PropertyNotFound
                        .err()
                        .model(&m.name)
                        .property(name)
                        .into(),
                ),
            }
        }
        if pkeys.is_empty() {
            pkeys = m.flat.get("_id").copied().into_iter().collect();
        }
        self.manifest.models[model.index()].pkeys = pkeys;
    }

    /// Resolves a model name as written in a property: absolute first, then
    /// relative to the model's namespace, then to its dataset.
    fn resolve_model(&self, from: ModelId, target: &str) -> Option<ModelId> {
        let m = &self.manifest;
        if let Some(id) = m.model_index.get(target) {
            return Some(*id);
        }
        let model = &m.models[from.index()];
        let ns = model.namespace();
        if !ns.is_empty() {
            if let Some(id) = m.model_index.get(&format!("{ns}/{target}")) {
                return Some(*id);
            }
        }
        model
            .dataset
            .and_then(|ds| m.model_index.get(&format!("{}/{target}", m.datasets[ds.index()].name)))
            .copied()
    }

    fn not_found(&self, prop: PropertyId, target: &str) -> CoreError {
        let p = &self.manifest.properties[prop.index()];
        ErrorKind::ModelNotFound
            .err()
            .model(target)
            .property(&p.place)
            .with("owner", self.manifest.models[p.model.index()].name.as_str())
            .into()
    }

    fn resolve_pending(&mut self) {
        let pending = std::mem::take(&mut self.pending);
        // Refs first: backrefs and intermediate arrays look at resolved refs.
        let (refs, rest): (Vec<_>, Vec<_>) =
            pending.into_iter().partition(|p| matches!(p, Pending::Ref { .. }));
        for item in refs.into_iter().chain(rest) {
            if let Err(e) = self.resolve_one(item) {
                self.errors.push(e);
            }
        }
    }

    fn resolve_one(&mut self, item: Pending) -> CoreResult<()> {
        match item {
            Pending::Ref {
                prop,
                target,
                refprops,
            } => {
                let owner = self.manifest.properties[prop.index()].model;
                let model = self
                    .resolve_model(owner, &target)
                    .ok_or_else(|| self.not_found(prop, &target))?;
                let target_model = &self.manifest.models[model.index()];
                let explicit = !refprops.is_empty();
                let ids = if explicit {
                    refprops
                        .iter()
                        .map(|name| {
                            target_model.flat.get(name).copied().ok_or_else(|| -> CoreError {
                                ErrorKind::PropertyNotFound
                                    .err()
                                    .model(&target_model.name)
                                    .property(name)
                                    .into()
                            })
                        })
                        .collect::<CoreResult<Vec<_>>>()?
                } else {
                    target_model.pkeys.clone()
                };
                self.manifest.properties[prop.index()].dtype = DType::Ref(RefType {
                    model,
                    refprops: ids,
                    explicit,
                });
            }
            Pending::BackRef {
                prop,
                target,
                refprop,
            } => {
                let owner = self.manifest.properties[prop.index()].model;
                let model = self
                    .resolve_model(owner, &target)
                    .ok_or_else(|| self.not_found(prop, &target))?;
                let m = &self.manifest;
                let candidates: Vec<PropertyId> = m.models[model.index()]
                    .flat
                    .iter()
                    .filter(|(place, _)| refprop.as_ref().map_or(true, |r| r == *place))
                    .map(|(_, id)| *id)
                    .filter(|id| {
                        matches!(&m.properties[id.index()].dtype, DType::Ref(r) if r.model == owner)
                    })
                    .collect();
                let [refprop] = candidates.as_slice() else {
                    return Err(invalid(
                        &m.models[owner.index()].name,
                        format!(
                            "backref {} needs exactly one ref in {target} pointing back",
                            m.properties[prop.index()].place
                        ),
                    ));
                };
                let refprop = *refprop;
                self.manifest.properties[prop.index()].dtype =
                    DType::BackRef(BackRefType { model, refprop });
            }
            Pending::Intermediate { prop, target } => {
                let owner = self.manifest.properties[prop.index()].model;
                let join = self
                    .resolve_model(owner, &target)
                    .ok_or_else(|| self.not_found(prop, &target))?;
                let m = &self.manifest;
                let owner_name = &m.models[owner.index()].name;
                let place = &m.properties[prop.index()].place;
                let DType::Array(arr) = &m.properties[prop.index()].dtype else {
                    return Err(CoreError::internal("intermediate on a non-array"));
                };
                let items = arr.items;
                let DType::Ref(item_ref) = &m.properties[items.index()].dtype else {
                    return Err(invalid(owner_name, format!("items of {place} must be a ref")));
                };
                let item_target = item_ref.model;
                let refs_to = |target: ModelId| -> Vec<PropertyId> {
                    m.models[join.index()]
                        .properties
                        .iter()
                        .copied()
                        .filter(|id| {
                            matches!(&m.properties[id.index()].dtype, DType::Ref(r) if r.model == target)
                        })
                        .collect()
                };
                let (left, right) = (refs_to(owner), refs_to(item_target));
                let pick = |ids: &[PropertyId], other: Option<PropertyId>| {
                    let rest: Vec<PropertyId> =
                        ids.iter().copied().filter(|id| Some(*id) != other).collect();
                    match rest.as_slice() {
                        [one] => Some(*one),
                        _ => None,
                    }
                };
                let left = pick(&left, None);
                let right = pick(&right, left);
                let (Some(left), Some(right)) = (left, right) else {
                    return Err(invalid(
                        owner_name,
                        format!(
                            "{target} must hold exactly one ref to {owner_name} and one to {} for {place}",
                            m.models[item_target.index()].name
                        ),
                    ));
                };
                self.manifest.properties[prop.index()].dtype = DType::Array(ArrayType {
                    items,
                    intermediate: Some(Intermediate {
                        model: join,
                        left,
                        right,
                    }),
                });
            }
        }
        Ok(())
    }

    fn register_endpoints(&mut self, docs: &[ModelDoc], ids: &[ModelId]) {
        for (doc, id) in docs.iter().zip(ids) {
            let Some(alias) = &doc.endpoint else {
                continue;
            };
            let m = &mut self.manifest;
            if m.model_index.contains_key(alias) && alias != &doc.name {
                self.errors.push(invalid(
                    &doc.name,
                    format!("endpoint {alias} shadows a model name"),
                ));
            } else if m.endpoints.insert(alias.clone(), *id).is_some() {
                self.errors.push(invalid(
                    &doc.name,
                    format!("endpoint {alias} is used by several models"),
                ));
            }
        }
    }

    fn register_namespaces(&mut self) {
        let m = &mut self.manifest;
        m.namespaces.entry(String::new()).or_default();
        for model in &m.models {
            let ns = model.namespace().to_string();
            let mut path = String::new();
            for segment in ns.split('/').filter(|s| !s.is_empty()) {
                let parent = path.clone();
                if !path.is_empty() {
                    path.push('/');
                }
                path.push_str(segment);
                m.namespaces
                    .entry(parent)
                    .or_default()
                    .namespaces
                    .insert(path.clone());
                m.namespaces.entry(path.clone()).or_insert_with(|| Namespace {
                    name: path.clone(),
                    ..Namespace::default()
                });
            }
            m.namespaces
                .entry(ns)
                .or_default()
                .models
                .insert(model.name.clone());
        }
    }
}

/// Cross-node constraints on a linked manifest.
///
/// # Errors
///
/// `GivenValueCountMissmatch` when a ref's explicit `refprops` do not match
/// the target's declared primary key.
pub fn check(manifest: &Manifest) -> CoreResult<()> {
    let mut errors = Vec::new();
    for prop in &manifest.properties {
        let DType::Ref(r) = &prop.dtype else {
            continue;
        };
        let target = manifest.model(r.model);
        let declared_pkeys = target
            .pkeys
            .iter()
            .all(|id| manifest.property(*id).name != "_id");
        if r.explicit && declared_pkeys && r.refprops.len() != target.pkeys.len() {
            errors.push(
                ErrorKind::GivenValueCountMissmatch
                    .err()
                    .model(&manifest.model(prop.model).name)
                    .property(&prop.place)
                    .with("given_count", r.refprops.len())
                    .with("expected_count", target.pkeys.len())
                    .into(),
            );
        }
    }
    match CoreError::collect(errors) {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use crate::dtype::DType;
    use crate::manifest::load::load_yaml_str;
    use crate::types::Access;

    #[test]
    fn inheritance() {
        let m = load_yaml_str(
            r"
type: dataset
name: gov
access: public
level: 3
resources:
  api: {backend: remote, level: 2}
---
type: model
name: gov/Office
resource: api
external: {source: offices}
properties:
  name: {type: string}
  secret: {type: string, access: private}
",
        )
        .unwrap();
        let office = m.model_by_name("gov/Office").unwrap();
        assert_eq!(office.access, Access::Public);
        assert_eq!(office.level, Some(2));
        assert_eq!(office.backend, "remote");
        assert_eq!(m.find_property(office.id, "name").unwrap().access, Access::Public);
        assert_eq!(m.find_property(office.id, "secret").unwrap().access, Access::Private);
        assert!(m.backend_names().contains("remote"));
    }

    #[test]
    fn default_access_is_protected() {
        let m = load_yaml_str("type: model\nname: a\nproperties:\n  x: {type: string}\n").unwrap();
        let a = m.model_by_name("a").unwrap();
        assert_eq!(a.access, Access::Protected);
        assert_eq!(a.backend, "default");
    }

    #[test]
    fn dangling_ref() {
        let err = load_yaml_str(
            "type: model\nname: a\nproperties:\n  b: {type: ref, model: Missing}\n",
        )
        .unwrap_err();
        assert_eq!(err.code(), "ModelNotFound");
        assert_eq!(err.context()["model"], "Missing");
    }

    #[test]
    fn unknown_dataset_and_resource() {
        let err = load_yaml_str("type: model\nname: a\ndataset: nope\n").unwrap_err();
        assert_eq!(err.code(), "UnknownProjectDataset");

        let err = load_yaml_str("type: dataset\nname: d\n---\ntype: model\nname: d/a\nresource: r\n")
            .unwrap_err();
        assert_eq!(err.code(), "ModelSourceNotFound");
    }

    #[test]
    fn endpoint_clashes() {
        let err = load_yaml_str(
            "type: model\nname: a\nendpoint: b\n---\ntype: model\nname: b\n",
        )
        .unwrap_err();
        assert_eq!(err.code(), "InvalidManifestFile");

        let err = load_yaml_str(
            "type: model\nname: a\nendpoint: x\n---\ntype: model\nname: b\nendpoint: x\n",
        )
        .unwrap_err();
        assert_eq!(err.code(), "InvalidManifestFile");
    }

    #[test]
    fn compound_refs_must_match_declared_pkeys() {
        let yaml = r"
type: model
name: City
pkeys: [code, name]
properties:
  code: {type: string}
  name: {type: string}
---
type: model
name: Street
properties:
  city: {type: ref, model: City, refprops: [code]}
";
        let err = load_yaml_str(yaml).unwrap_err();
        assert_eq!(err.code(), "GivenValueCountMissmatch");

        let ok = yaml.replace("refprops: [code]", "refprops: [code, name]");
        let m = load_yaml_str(&ok).unwrap();
        let street = m.model_by_name("Street").unwrap();
        let DType::Ref(r) = &m.find_property(street.id, "city").unwrap().dtype else {
            panic!("expected ref");
        };
        assert_eq!(r.refprops.len(), 2);
    }

    #[test]
    fn intermediate_legs() {
        let base = r"
type: model
name: example/Language
properties:
  code: {type: string}
---
type: model
name: example/Country
properties:
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
        let m = load_yaml_str(base).unwrap();
        let country = m.model_by_name("example/Country").unwrap();
        let DType::Array(arr) = &m.find_property(country.id, "languages").unwrap().dtype else {
            panic!("expected array");
        };
        let join = arr.intermediate.as_ref().unwrap();
        assert_eq!(m.property(join.left).name, "country");
        assert_eq!(m.property(join.right).name, "language");

        let broken = base.replace("  language: {type: ref, model: Language}\n", "");
        let err = load_yaml_str(&broken).unwrap_err();
        assert_eq!(err.code(), "InvalidManifestFile");
    }

    #[test]
    fn backrefs() {
        let m = load_yaml_str(
            r"
type: model
name: Country
properties:
  cities: {type: backref, model: City}
---
type: model
name: City
properties:
  country: {type: ref, model: Country}
",
        )
        .unwrap();
        let country = m.model_by_name("Country").unwrap();
        let DType::BackRef(b) = &m.find_property(country.id, "cities").unwrap().dtype else {
            panic!("expected backref");
        };
        assert_eq!(m.property(b.refprop).name, "country");
    }

    #[test]
    fn errors_are_collected() {
        let err = load_yaml_str(
            "type: model\nname: a\nproperties:\n  b: {type: ref, model: X}\n  c: {type: ref, model: Y}\n",
        )
        .unwrap_err();
        assert_eq!(crate::error::ErrorReport::from_error(&err).errors.len(), 2);
    }
}
