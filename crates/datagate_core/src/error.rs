//! Error types for datagate core.
//!
//! User-facing failures are [`DataError`]s: an [`ErrorKind`] plus a
//! structured context object (`model`, `property`, `given`, `expected`, ...).
//! Everything else (I/O, configuration, backend faults) is a plain
//! [`CoreError`] variant and reports as an internal error.

use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Structured error context, rendered into messages and error reports.
pub type ErrorContext = serde_json::Map<String, Value>;

/// Every user-facing error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum ErrorKind {
    // Structural
    FieldNotInResource,
    PropertyNotFound,
    UnknownMethod,
    UnknownAction,
    UnavailableSubresource,
    // Value
    InvalidValue,
    UnableToCast,
    RequiredProperty,
    UniqueConstraint,
    ConflictingValue,
    NoItemRevision,
    ObjectTypeError,
    ArrayTypeError,
    DateTypeError,
    DateTimeTypeError,
    UnknownObjectPropertiesError,
    MultipleRowsFound,
    // Lookup
    ModelNotFound,
    ItemDoesNotExist,
    ModelSourceNotFound,
    // I/O
    FileNotFound,
    UnacceptableFileName,
    UnexpectedErrorReadingData,
    CannotReadResource,
    SourceNotSet,
    ContentLengthRequired,
    UnsupportedMediaType,
    // Auth
    MissingAuthorization,
    UnsupportedTokenType,
    InvalidToken,
    InsufficientScope,
    BasicAuthRequired,
    // Manifest
    InvalidManifestFile,
    UnknownOwner,
    UnknownProjectDataset,
    MultipleParentsError,
    TooShortPageSize,
    GivenValueCountMissmatch,
    SRIDNotSetForGeometry,
}

impl ErrorKind {
    /// The kind name, used as `code` in error reports.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::FieldNotInResource => "FieldNotInResource",
            Self::PropertyNotFound => "PropertyNotFound",
            Self::UnknownMethod => "UnknownMethod",
            Self::UnknownAction => "UnknownAction",
            Self::UnavailableSubresource => "UnavailableSubresource",
            Self::InvalidValue => "InvalidValue",
            Self::UnableToCast => "UnableToCast",
            Self::RequiredProperty => "RequiredProperty",
            Self::UniqueConstraint => "UniqueConstraint",
            Self::ConflictingValue => "ConflictingValue",
            Self::NoItemRevision => "NoItemRevision",
            Self::ObjectTypeError => "ObjectTypeError",
            Self::ArrayTypeError => "ArrayTypeError",
            Self::DateTypeError => "DateTypeError",
            Self::DateTimeTypeError => "DateTimeTypeError",
            Self::UnknownObjectPropertiesError => "UnknownObjectPropertiesError",
            Self::MultipleRowsFound => "MultipleRowsFound",
            Self::ModelNotFound => "ModelNotFound",
            Self::ItemDoesNotExist => "ItemDoesNotExist",
            Self::ModelSourceNotFound => "ModelSourceNotFound",
            Self::FileNotFound => "FileNotFound",
            Self::UnacceptableFileName => "UnacceptableFileName",
            Self::UnexpectedErrorReadingData => "UnexpectedErrorReadingData",
            Self::CannotReadResource => "CannotReadResource",
            Self::SourceNotSet => "SourceNotSet",
            Self::ContentLengthRequired => "ContentLengthRequired",
            Self::UnsupportedMediaType => "UnsupportedMediaType",
            Self::MissingAuthorization => "MissingAuthorization",
            Self::UnsupportedTokenType => "UnsupportedTokenType",
            Self::InvalidToken => "InvalidToken",
            Self::InsufficientScope => "InsufficientScope",
            Self::BasicAuthRequired => "BasicAuthRequired",
            Self::InvalidManifestFile => "InvalidManifestFile",
            Self::UnknownOwner => "UnknownOwner",
            Self::UnknownProjectDataset => "UnknownProjectDataset",
            Self::MultipleParentsError => "MultipleParentsError",
            Self::TooShortPageSize => "TooShortPageSize",
            Self::GivenValueCountMissmatch => "GivenValueCountMissmatch",
            Self::SRIDNotSetForGeometry => "SRIDNotSetForGeometry",
        }
    }

    /// HTTP status the kind maps to.
    #[must_use]
    pub const fn status(self) -> u16 {
        match self {
            Self::ConflictingValue | Self::UniqueConstraint => 409,
            Self::ModelNotFound
            | Self::ItemDoesNotExist
            | Self::ModelSourceNotFound
            | Self::FileNotFound => 404,
            Self::InsufficientScope => 403,
            Self::MissingAuthorization
            | Self::UnsupportedTokenType
            | Self::InvalidToken
            | Self::BasicAuthRequired => 401,
            Self::ContentLengthRequired => 411,
            Self::UnsupportedMediaType => 415,
            Self::UnexpectedErrorReadingData
            | Self::CannotReadResource
            | Self::SourceNotSet
            | Self::InvalidManifestFile
            | Self::UnknownOwner
            | Self::UnknownProjectDataset
            | Self::MultipleParentsError => 500,
            _ => 400,
        }
    }

    /// Message template; `{key}` placeholders are filled from the context.
    #[must_use]
    pub const fn template(self) -> &'static str {
        match self {
            Self::FieldNotInResource => "Unknown property {property}.",
            Self::PropertyNotFound => "No available property {property} in {model}.",
            Self::UnknownMethod => "Unknown method {name}.",
            Self::UnknownAction => "Unknown action {action}.",
            Self::UnavailableSubresource => "Subresource {property} is not available.",
            Self::InvalidValue => "Invalid value.",
            Self::UnableToCast => "Unable to cast {value} to {type} type.",
            Self::RequiredProperty => "Property is required.",
            Self::UniqueConstraint => "Given value already exists.",
            Self::ConflictingValue => "Conflicting value.",
            Self::NoItemRevision => "'_revision' must be given on rewrite operation.",
            Self::ObjectTypeError => "Expected an object.",
            Self::ArrayTypeError => "Expected an array.",
            Self::DateTypeError => "Invalid date format, expected YYYY-MM-DD.",
            Self::DateTimeTypeError => "Invalid datetime format, expected ISO 8601.",
            Self::UnknownObjectPropertiesError => "Unknown properties {props} in {property}.",
            Self::MultipleRowsFound => "Expected one row in {model}, found several.",
            Self::ModelNotFound => "Model {model} not found.",
            Self::ItemDoesNotExist => "Resource {id} not found.",
            Self::ModelSourceNotFound => "Source {source} of {model} not found.",
            Self::FileNotFound => "File {file} not found.",
            Self::UnacceptableFileName => "Unacceptable file name {file}.",
            Self::UnexpectedErrorReadingData => "Unexpected error while reading data.",
            Self::CannotReadResource => "Cannot read resource {source}.",
            Self::SourceNotSet => "Source is not set for {model}.",
            Self::ContentLengthRequired => "Content-Length header is required.",
            Self::UnsupportedMediaType => "Unsupported media type {given}.",
            Self::MissingAuthorization => "Authorization header is missing.",
            Self::UnsupportedTokenType => "Unsupported token type {given}.",
            Self::InvalidToken => "Invalid token.",
            Self::InsufficientScope => "Insufficient scope, one of {scopes} is required.",
            Self::BasicAuthRequired => "Basic authorization is required.",
            Self::InvalidManifestFile => "Invalid manifest file {file}.",
            Self::UnknownOwner => "Unknown owner {owner} of {property}.",
            Self::UnknownProjectDataset => "Unknown dataset {dataset}.",
            Self::MultipleParentsError => "Model {model} has several schema version heads.",
            Self::TooShortPageSize => "Page size {size} is too short, at least {min} is required.",
            Self::GivenValueCountMissmatch => "Given {given_count} values, expected {expected_count}.",
            Self::SRIDNotSetForGeometry => "SRID is not set for geometry {property}.",
        }
    }

    /// Starts an error of this kind with an empty context.
    #[must_use]
    pub fn err(self) -> DataError {
        DataError {
            kind: self,
            context: ErrorContext::new(),
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// A user-facing error: kind plus structured context.
#[derive(Debug, Clone, PartialEq)]
pub struct DataError {
    /// What went wrong.
    pub kind: ErrorKind,
    /// Where and with which values.
    pub context: ErrorContext,
}

impl DataError {
    /// Adds a context entry.
    #[must_use]
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.context.insert(key.to_string(), value.into());
        self
    }

    /// Adds the `model` context entry.
    #[must_use]
    pub fn model(self, name: &str) -> Self {
        self.with("model", name)
    }

    /// Adds the `property` context entry.
    #[must_use]
    pub fn property(self, name: &str) -> Self {
        self.with("property", name)
    }

    /// Renders the template with the context.
    #[must_use]
    pub fn message(&self) -> String {
        render(self.kind.template(), &self.context)
    }

    /// The node type the error concerns.
    #[must_use]
    pub fn node_type(&self) -> &'static str {
        if self.context.contains_key("property") {
            "property"
        } else if self.context.contains_key("model") {
            "model"
        } else if self.context.contains_key("backend") {
            "backend"
        } else if self.context.contains_key("manifest") || self.context.contains_key("file") {
            "manifest"
        } else {
            "system"
        }
    }
}

impl fmt::Display for DataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.code(), self.message())
    }
}

impl std::error::Error for DataError {}

fn render(template: &str, context: &ErrorContext) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find('}') {
            Some(end) => {
                let key = &after[..end];
                match context.get(key) {
                    Some(Value::String(s)) => out.push_str(s),
                    Some(other) => out.push_str(&other.to_string()),
                    None => {
                        out.push('{');
                        out.push_str(key);
                        out.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Errors that can occur in datagate core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A user-facing error with structured context.
    #[error("{0}")]
    Data(DataError),

    /// Several errors collected while validating one request.
    #[error("{} errors occurred", .0.len())]
    Multiple(Vec<CoreError>),

    /// Expression syntax error.
    #[error("expression error: {0}")]
    Expr(#[from] datagate_expr::ExprError),

    /// Blob storage error.
    #[error("storage error: {0}")]
    Storage(#[from] datagate_storage::StorageError),

    /// JSON decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Invalid configuration.
    #[error("configuration error: {message}")]
    Config {
        /// Description of the problem.
        message: String,
    },

    /// A backend failed while executing a statement.
    #[error("backend {backend} failed: {message}")]
    Backend {
        /// Backend name.
        backend: String,
        /// Description of the failure.
        message: String,
    },

    /// An internal invariant was violated.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the breach.
        message: String,
    },
}

impl From<DataError> for CoreError {
    fn from(err: DataError) -> Self {
        Self::Data(err)
    }
}

impl CoreError {
    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a backend error.
    pub fn backend(backend: &str, message: impl Into<String>) -> Self {
        Self::Backend {
            backend: backend.to_string(),
            message: message.into(),
        }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Combines collected errors. A single error is returned as is.
    #[must_use]
    pub fn collect(mut errors: Vec<CoreError>) -> Option<Self> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(Self::Multiple(errors)),
        }
    }

    /// Returns the error kind if this is a user-facing error.
    #[must_use]
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Data(e) => Some(e.kind),
            Self::Multiple(errors) if errors.len() == 1 => errors[0].kind(),
            _ => None,
        }
    }

    /// Returns the structured error if this is a user-facing error.
    #[must_use]
    pub fn as_data(&self) -> Option<&DataError> {
        match self {
            Self::Data(e) => Some(e),
            _ => None,
        }
    }

    /// Kind name used as `code` in reports.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Data(e) => e.kind.code(),
            Self::Multiple(_) => "MultipleErrors",
            Self::Expr(_) => "InvalidExpression",
            Self::Storage(_) => "StorageError",
            Self::Json(_) => "JSONError",
            Self::Io(_) => "IOError",
            Self::Config { .. } => "ConfigError",
            Self::Backend { .. } => "BackendError",
            Self::Internal { .. } => "InternalError",
        }
    }

    /// HTTP status. For collected errors, the highest member status.
    #[must_use]
    pub fn status(&self) -> u16 {
        match self {
            Self::Data(e) => e.kind.status(),
            Self::Multiple(errors) => errors.iter().map(Self::status).max().unwrap_or(500),
            Self::Expr(_) | Self::Json(_) => 400,
            _ => 500,
        }
    }

    /// Structured context (empty for internal errors).
    #[must_use]
    pub fn context(&self) -> ErrorContext {
        match self {
            Self::Data(e) => e.context.clone(),
            Self::Expr(e) => {
                let mut ctx = ErrorContext::new();
                ctx.insert("offset".into(), Value::from(e.offset()));
                ctx
            }
            Self::Backend { backend, .. } => {
                let mut ctx = ErrorContext::new();
                ctx.insert("backend".into(), Value::from(backend.as_str()));
                ctx
            }
            _ => ErrorContext::new(),
        }
    }

    fn flatten<'a>(&'a self, out: &mut Vec<&'a CoreError>) {
        match self {
            Self::Multiple(errors) => errors.iter().for_each(|e| e.flatten(out)),
            other => out.push(other),
        }
    }
}

/// One entry of an error report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorEntry {
    /// Node type the error concerns.
    #[serde(rename = "type")]
    pub node_type: String,
    /// Error kind name.
    pub code: String,
    /// Un-interpolated message.
    pub template: String,
    /// Rendered message.
    pub message: String,
    /// Structured context.
    pub context: ErrorContext,
}

/// Response body for failed requests: `{errors: [...]}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorReport {
    /// Every collected error.
    pub errors: Vec<ErrorEntry>,
}

impl ErrorReport {
    /// Builds the report for an error, flattening collected errors.
    #[must_use]
    pub fn from_error(error: &CoreError) -> Self {
        let mut flat = Vec::new();
        error.flatten(&mut flat);
        let errors = flat
            .into_iter()
            .map(|e| match e {
                CoreError::Data(d) => ErrorEntry {
                    node_type: d.node_type().to_string(),
                    code: d.kind.code().to_string(),
                    template: d.kind.template().to_string(),
                    message: d.message(),
                    context: d.context.clone(),
                },
                other => {
                    let message = other.to_string();
                    ErrorEntry {
                        node_type: "system".to_string(),
                        code: other.code().to_string(),
                        template: message.clone(),
                        message,
                        context: other.context(),
                    }
                }
            })
            .collect();
        Self { errors }
    }

    /// Serializes into a JSON value.
    #[must_use]
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn message_renders_context() {
        let err = ErrorKind::PropertyNotFound
            .err()
            .model("report")
            .property("colour");
        assert_eq!(err.message(), "No available property colour in report.");
        assert_eq!(err.node_type(), "property");
    }

    #[test]
    fn missing_placeholder_is_kept() {
        let err = ErrorKind::ModelNotFound.err();
        assert_eq!(err.message(), "Model {model} not found.");
    }

    #[test]
    fn conflicting_value_report() {
        let err: CoreError = ErrorKind::ConflictingValue
            .err()
            .with("given", "bogus")
            .with("expected", "r1")
            .model("report")
            .into();
        assert_eq!(err.status(), 409);
        let report = ErrorReport::from_error(&err).to_json();
        assert_eq!(
            report,
            json!({"errors": [{
                "type": "model",
                "code": "ConflictingValue",
                "template": "Conflicting value.",
                "message": "Conflicting value.",
                "context": {"given": "bogus", "expected": "r1", "model": "report"},
            }]})
        );
    }

    #[test]
    fn collected_errors_use_highest_status() {
        let err = CoreError::collect(vec![
            ErrorKind::RequiredProperty.err().property("a").into(),
            ErrorKind::UniqueConstraint.err().property("b").into(),
        ])
        .unwrap();
        assert_eq!(err.status(), 409);
        assert_eq!(ErrorReport::from_error(&err).errors.len(), 2);
        assert!(CoreError::collect(Vec::new()).is_none());
    }

    #[test]
    fn internal_errors_report_as_system() {
        let err = CoreError::backend("default", "connection reset");
        assert_eq!(err.status(), 500);
        let report = ErrorReport::from_error(&err);
        assert_eq!(report.errors[0].code, "BackendError");
        assert_eq!(report.errors[0].context["backend"], "default");
    }
}
