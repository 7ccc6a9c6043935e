//! Configuration.
//!
//! A flat key space with dotted keys (`manifest.type`,
//! `backends.default.type`, ...). Sources, lowest precedence first:
//!
//! 1. built-in defaults
//! 2. a YAML file (nested mappings are flattened into dotted keys)
//! 3. environment variables `DATAGATE_<KEY>`, where `__` separates key parts
//! 4. explicit overrides set through [`Config::set`]

use crate::error::{CoreError, CoreResult};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Prefix of environment variables read into the configuration.
pub const ENV_PREFIX: &str = "DATAGATE_";

/// Where the manifest comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestKind {
    /// CSV table with `d,r,b,m,property,...` columns.
    Tabular,
    /// YAML documents keyed by node type.
    Yaml,
    /// Documents inline in the configuration under `manifest.nodes`.
    Memory,
    /// Documents stored by the default backend during bootstrap.
    Backend,
}

/// Resolved `manifest.*` settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestSource {
    /// Loader to use.
    pub kind: ManifestKind,
    /// File or directory for file-based kinds.
    pub path: Option<PathBuf>,
    /// Inline documents for [`ManifestKind::Memory`].
    pub nodes: Vec<Value>,
}

/// Backend driver family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// In-process store.
    Memory,
    /// Relational database.
    Sql,
    /// Document store.
    Document,
    /// Read-only external tabular source.
    Tabular,
}

impl BackendKind {
    /// Parses a configured type name.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "memory" | "mem" => Some(Self::Memory),
            "sql" | "postgresql" | "sqlite" => Some(Self::Sql),
            "document" | "mongo" => Some(Self::Document),
            "tabular" | "csv" => Some(Self::Tabular),
            _ => None,
        }
    }
}

/// Resolved `backends.{name}.*` settings.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendConfig {
    /// Backend name.
    pub name: String,
    /// Driver family.
    pub kind: BackendKind,
    /// Connection string, if any.
    pub dsn: Option<String>,
    /// Readiness check timeout.
    pub timeout: Duration,
}

/// Configuration values.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    values: BTreeMap<String, Value>,
}

impl Default for Config {
    fn default() -> Self {
        let mut values = BTreeMap::new();
        values.insert("manifest.type".to_string(), Value::from("memory"));
        values.insert("backends.default.type".to_string(), Value::from("memory"));
        values.insert("scope_prefix".to_string(), Value::from("datagate_"));
        values.insert("scope_max_length".to_string(), Value::from(60));
        values.insert(
            "server_url".to_string(),
            Value::from("http://localhost:8000/"),
        );
        Self { values }
    }
}

impl Config {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads defaults, then `config_path` (if given), then the process
    /// environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid YAML.
    pub fn load(config_path: Option<&Path>) -> CoreResult<Self> {
        Self::from_sources(config_path, std::env::vars())
    }

    /// Like [`Config::load`] but with an explicit environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid YAML.
    pub fn from_sources<I>(config_path: Option<&Path>, env: I) -> CoreResult<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut config = Self::default();
        if let Some(path) = config_path {
            let text = std::fs::read_to_string(path)?;
            config.merge_yaml(&text)?;
            config.insert("config_path", path.display().to_string());
        }
        config.merge_env(env);
        Ok(config)
    }

    /// Merges a YAML mapping, flattening nested mappings into dotted keys.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Config`] if the text is not a YAML mapping.
    pub fn merge_yaml(&mut self, text: &str) -> CoreResult<()> {
        let value: Value = serde_yaml::from_str(text)
            .map_err(|e| CoreError::config(format!("invalid configuration file: {e}")))?;
        match value {
            Value::Object(map) => {
                flatten_into(&mut self.values, "", map);
                Ok(())
            }
            Value::Null => Ok(()),
            _ => Err(CoreError::config("configuration file must be a mapping")),
        }
    }

    /// Merges `DATAGATE_*` variables.
    pub fn merge_env<I>(&mut self, env: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (name, raw) in env {
            let Some(rest) = name.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let key = rest.to_lowercase().replace("__", ".");
            let value = serde_yaml::from_str::<Value>(&raw)
                .ok()
                .filter(|v| !v.is_null() || raw.trim() == "null")
                .unwrap_or(Value::String(raw));
            tracing::debug!(key = %key, "configuration from environment");
            self.values.insert(key, value);
        }
    }

    /// Sets a value (builder style).
    #[must_use]
    pub fn set(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// Sets a value in place.
    pub fn insert(&mut self, key: &str, value: impl Into<Value>) {
        self.values.insert(key.to_string(), value.into());
    }

    /// Returns a raw value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Returns a value as a string, if it is one.
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    /// Keys starting with `prefix.`, with the prefix removed.
    fn children(&self, prefix: &str) -> impl Iterator<Item = (&str, &Value)> {
        let dotted = format!("{prefix}.");
        self.values.iter().filter_map(move |(k, v)| {
            k.strip_prefix(dotted.as_str()).map(|rest| (rest, v))
        })
    }

    /// Resolves the manifest source.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Config`] for an unknown type or a file-based type
    /// without `manifest.path`.
    pub fn manifest_source(&self) -> CoreResult<ManifestSource> {
        let kind = match self.get_str("manifest.type").unwrap_or("memory") {
            "tabular" | "csv" => ManifestKind::Tabular,
            "yaml" => ManifestKind::Yaml,
            "memory" => ManifestKind::Memory,
            "backend" => ManifestKind::Backend,
            other => {
                return Err(CoreError::config(format!("unknown manifest type {other:?}")));
            }
        };
        let path = self.get_str("manifest.path").map(PathBuf::from);
        if matches!(kind, ManifestKind::Tabular | ManifestKind::Yaml) && path.is_none() {
            return Err(CoreError::config("manifest.path is required"));
        }
        let nodes = match self.get("manifest.nodes") {
            Some(Value::Array(nodes)) => nodes.clone(),
            _ => Vec::new(),
        };
        Ok(ManifestSource { kind, path, nodes })
    }

    /// Resolves every configured backend.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Config`] for a backend without a type or with an
    /// unknown one.
    pub fn backends(&self) -> CoreResult<BTreeMap<String, BackendConfig>> {
        let names: BTreeSet<&str> = self
            .children("backends")
            .filter_map(|(rest, _)| rest.split('.').next())
            .collect();

        let mut backends = BTreeMap::new();
        for name in names {
            let type_key = format!("backends.{name}.type");
            let type_name = self
                .get_str(&type_key)
                .ok_or_else(|| CoreError::config(format!("{type_key} is not set")))?;
            let kind = BackendKind::parse(type_name).ok_or_else(|| {
                CoreError::config(format!("unknown backend type {type_name:?} for {name}"))
            })?;
            let dsn = self
                .get_str(&format!("backends.{name}.dsn"))
                .map(str::to_string);
            let timeout = self
                .get(&format!("backends.{name}.timeout"))
                .and_then(Value::as_f64)
                .map_or(Duration::from_secs(30), Duration::from_secs_f64);
            backends.insert(
                name.to_string(),
                BackendConfig {
                    name: name.to_string(),
                    kind,
                    dsn,
                    timeout,
                },
            );
        }
        Ok(backends)
    }

    /// Prefix of every scope string.
    #[must_use]
    pub fn scope_prefix(&self) -> &str {
        self.get_str("scope_prefix").unwrap_or("datagate_")
    }

    /// Maximum scope string length before shortening.
    #[must_use]
    pub fn scope_max_length(&self) -> usize {
        self.get("scope_max_length")
            .and_then(Value::as_u64)
            .and_then(|n| usize::try_from(n).ok())
            .unwrap_or(60)
    }

    /// Public base URL of the service.
    #[must_use]
    pub fn server_url(&self) -> &str {
        self.get_str("server_url").unwrap_or("http://localhost:8000/")
    }

    /// Client used for requests without credentials.
    #[must_use]
    pub fn default_auth_client(&self) -> Option<&str> {
        self.get_str("default_auth_client")
    }

    /// Scopes granted to a configured client (`clients.{name}.scopes`).
    #[must_use]
    pub fn client_scopes(&self, client: &str) -> Vec<String> {
        match self.get(&format!("clients.{client}.scopes")) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            Some(Value::String(s)) => s.split_whitespace().map(str::to_string).collect(),
            _ => Vec::new(),
        }
    }

    /// HMAC key used to validate bearer tokens.
    #[must_use]
    pub fn token_validation_key(&self) -> Option<&str> {
        self.get_str("token_validation_key")
    }

    /// Path of the configuration file, if one was loaded.
    #[must_use]
    pub fn config_path(&self) -> Option<&str> {
        self.get_str("config_path")
    }
}

fn flatten_into(out: &mut BTreeMap<String, Value>, prefix: &str, map: serde_json::Map<String, Value>) {
    for (key, value) in map {
        let full = if prefix.is_empty() {
            key
        } else {
            format!("{prefix}.{key}")
        };
        match value {
            Value::Object(inner) if !inner.is_empty() => flatten_into(out, &full, inner),
            other => {
                out.insert(full, other);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.scope_prefix(), "datagate_");
        assert_eq!(config.scope_max_length(), 60);
        assert_eq!(config.manifest_source().unwrap().kind, ManifestKind::Memory);
        let backends = config.backends().unwrap();
        assert_eq!(backends["default"].kind, BackendKind::Memory);
    }

    #[test]
    fn builder_pattern() {
        let config = Config::new()
            .set("manifest.type", "yaml")
            .set("manifest.path", "/srv/manifest")
            .set("scope_max_length", 30);
        let source = config.manifest_source().unwrap();
        assert_eq!(source.kind, ManifestKind::Yaml);
        assert_eq!(source.path.unwrap(), PathBuf::from("/srv/manifest"));
        assert_eq!(config.scope_max_length(), 30);
    }

    #[test]
    fn precedence_file_then_env() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "manifest:\n  type: tabular\n  path: a.csv\nbackends:\n  default:\n    type: sql\n    dsn: postgresql://db\nscope_prefix: x_"
        )
        .unwrap();

        let env = vec![
            ("DATAGATE_SCOPE_PREFIX".to_string(), "env_".to_string()),
            ("DATAGATE_BACKENDS__DEFAULT__TYPE".to_string(), "mongo".to_string()),
            ("OTHER".to_string(), "ignored".to_string()),
        ];
        let config = Config::from_sources(Some(file.path()), env).unwrap();
        assert_eq!(config.scope_prefix(), "env_");
        assert_eq!(config.manifest_source().unwrap().kind, ManifestKind::Tabular);
        let backends = config.backends().unwrap();
        assert_eq!(backends["default"].kind, BackendKind::Document);
        assert_eq!(backends["default"].dsn.as_deref(), Some("postgresql://db"));
        assert!(config.config_path().is_some());
    }

    #[test]
    fn env_values_are_typed() {
        let mut config = Config::new();
        config.merge_env(vec![(
            "DATAGATE_SCOPE_MAX_LENGTH".to_string(),
            "42".to_string(),
        )]);
        assert_eq!(config.scope_max_length(), 42);
    }

    #[test]
    fn errors() {
        let config = Config::new().set("manifest.type", "yaml");
        assert!(matches!(config.manifest_source(), Err(CoreError::Config { .. })));

        let config = Config::new().set("backends.extra.type", "carrier-pigeon");
        assert!(matches!(config.backends(), Err(CoreError::Config { .. })));
    }

    #[test]
    fn client_scopes() {
        let config = Config::new()
            .set("default_auth_client", "anonymous")
            .set("clients.anonymous.scopes", "datagate_getall datagate_getone");
        assert_eq!(config.default_auth_client(), Some("anonymous"));
        assert_eq!(config.client_scopes("anonymous").len(), 2);
    }
}
