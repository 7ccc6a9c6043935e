//! Command implementations.

pub mod bootstrap;
pub mod check;
pub mod inspect;
pub mod migrate;
pub mod plan;

use crate::error::CliResult;
use datagate_core::config::ManifestSource;
use datagate_core::{load_manifest, Config, Manifest, ManifestKind, Store};
use std::path::Path;

/// Manifest loader for a path: `.csv` files are tabular, anything else YAML.
#[must_use]
pub fn manifest_kind(path: &Path) -> ManifestKind {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("csv") => ManifestKind::Tabular,
        _ => ManifestKind::Yaml,
    }
}

/// Loads the configuration, letting `manifest` override the configured
/// manifest source.
///
/// # Errors
///
/// Unreadable or malformed configuration files.
pub fn load_config(config: Option<&Path>, manifest: Option<&Path>) -> CliResult<Config> {
    let mut loaded = Config::load(config)?;
    if let Some(path) = manifest {
        let kind = match manifest_kind(path) {
            ManifestKind::Tabular => "tabular",
            _ => "yaml",
        };
        loaded.insert("manifest.type", kind);
        loaded.insert("manifest.path", path.display().to_string());
    }
    Ok(loaded)
}

/// Loads and links the configured manifest without opening backends.
///
/// # Errors
///
/// Configuration and manifest errors.
pub fn load_configured_manifest(config: &Config) -> CliResult<Manifest> {
    let source: ManifestSource = config.manifest_source()?;
    Ok(load_manifest(&source, None)?)
}

/// Opens a store over the configured manifest and backends.
///
/// # Errors
///
/// Configuration, manifest and backend errors.
pub fn open_store(config: Config) -> CliResult<Store> {
    Ok(Store::builder(config).open()?)
}
