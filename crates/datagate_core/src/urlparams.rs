//! Request path grammar.
//!
//! ```text
//! /{model}[/{id}[/{prop}[:ref]]][/:all|/:changes[/{offset}]|/:wipe][/:format/{fmt}]?{expr}
//! ```
//!
//! Model names may contain `/`; the longest run of leading segments naming
//! a model wins. A path naming only a namespace is valid with `:all`.

use crate::error::{CoreResult, ErrorKind};
use crate::format::Format;
use crate::manifest::Manifest;
use crate::types::{ModelId, PropertyId};
use datagate_expr::Node;
use percent_encoding::percent_decode_str;

/// What a request path addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathTarget {
    /// One model.
    Model(ModelId),
    /// Every model under a namespace.
    Namespace(String),
}

/// A `:name` suffix of the path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathVerb {
    /// `:all`, list across models.
    All,
    /// `:changes`, with an optional start offset. Negative offsets count
    /// from the end.
    Changes(Option<i64>),
    /// `:wipe`, erase every row.
    Wipe,
}

/// A decoded request path and query string.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestPath {
    /// Model or namespace.
    pub target: PathTarget,
    /// Row id.
    pub id: Option<String>,
    /// Sub-resource property.
    pub prop: Option<PropertyId>,
    /// `{prop}:ref` form.
    pub ref_only: bool,
    /// Path verb.
    pub verb: Option<PathVerb>,
    /// Format from `/:format/{fmt}`.
    pub format: Option<Format>,
    /// Parsed query string.
    pub query: Option<Node>,
}

impl RequestPath {
    /// The model addressed, if the path names one.
    #[must_use]
    pub fn model(&self) -> Option<ModelId> {
        match self.target {
            PathTarget::Model(id) => Some(id),
            PathTarget::Namespace(_) => None,
        }
    }
}

fn decode(segment: &str) -> CoreResult<String> {
    percent_decode_str(segment)
        .decode_utf8()
        .map(|s| s.into_owned())
        .map_err(|_| {
            ErrorKind::InvalidValue
                .err()
                .with("value", segment)
                .with("expected", "UTF-8 path")
                .into()
        })
}

fn unknown_verb(verb: &str) -> crate::error::CoreError {
    ErrorKind::UnknownAction.err().with("action", verb).into()
}

/// Decodes a request path and its query string against `manifest`.
///
/// # Errors
///
/// `ModelNotFound` when no model or namespace matches, `PropertyNotFound`
/// for unknown sub-resources, `UnknownAction` for unknown `:verbs`,
/// `UnsupportedMediaType` for unknown formats, and expression errors from
/// the query string.
pub fn parse_request_path(manifest: &Manifest, path: &str, query: &str) -> CoreResult<RequestPath> {
    let segments: Vec<String> = path
        .split('/')
        .filter(|s| !s.is_empty())
        .map(decode)
        .collect::<CoreResult<_>>()?;

    let names = segments.iter().take_while(|s| !s.starts_with(':')).count();
    let matched = (1..=names).rev().find_map(|n| {
        manifest
            .find_model(&segments[..n].join("/"))
            .map(|model| (n, model))
    });
    let (target, mut rest, model) = match matched {
        Some((n, model)) => (PathTarget::Model(model.id), n, Some(model)),
        None => {
            let name = segments[..names].join("/");
            if manifest.namespace(&name).is_none() {
                return Err(ErrorKind::ModelNotFound.err().model(&name).into());
            }
            (PathTarget::Namespace(name), names, None)
        }
    };

    let mut parsed = RequestPath {
        target,
        id: None,
        prop: None,
        ref_only: false,
        verb: None,
        format: None,
        query: None,
    };

    if let Some(model) = model {
        if let Some(id) = segments.get(rest).filter(|s| !s.starts_with(':')) {
            parsed.id = Some(id.clone());
            rest += 1;
        }
        if let Some(segment) = segments.get(rest).filter(|s| !s.starts_with(':')) {
            let (name, ref_only) = match segment.strip_suffix(":ref") {
                Some(name) => (name, true),
                None => (segment.as_str(), false),
            };
            let prop = manifest.property_by_place(model.id, name)?;
            parsed.prop = Some(prop.id);
            parsed.ref_only = ref_only;
            rest += 1;
        }
    }

    while let Some(segment) = segments.get(rest) {
        rest += 1;
        match segment.as_str() {
            ":all" => parsed.verb = Some(PathVerb::All),
            ":wipe" => parsed.verb = Some(PathVerb::Wipe),
            ":changes" => {
                let offset = segments
                    .get(rest)
                    .filter(|s| !s.starts_with(':'))
                    .map(|s| {
                        s.parse::<i64>().map_err(|_| {
                            ErrorKind::InvalidValue
                                .err()
                                .with("value", s.as_str())
                                .with("expected", "change offset")
                        })
                    })
                    .transpose()?;
                if offset.is_some() {
                    rest += 1;
                }
                parsed.verb = Some(PathVerb::Changes(offset));
            }
            ":format" => {
                let name = segments.get(rest).ok_or_else(|| unknown_verb(":format"))?;
                parsed.format = Some(name.parse()?);
                rest += 1;
            }
            other => return Err(unknown_verb(other)),
        }
    }

    if parsed.model().is_none() && parsed.verb != Some(PathVerb::All) {
        return Err(unknown_verb("namespace requires :all"));
    }

    let query = decode(query)?;
    if !query.trim().is_empty() {
        parsed.query = Some(datagate_expr::parse(&query)?);
    }
    Ok(parsed)
}
