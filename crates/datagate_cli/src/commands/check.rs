//! `check`: load, link and check a manifest.

use super::manifest_kind;
use crate::error::CliResult;
use datagate_core::config::ManifestSource;
use datagate_core::load_manifest;
use datagate_core::manifest::NodeKind;
use std::path::Path;

/// Counts of checked nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckSummary {
    /// Datasets.
    pub datasets: usize,
    /// Models.
    pub models: usize,
    /// Properties, nested ones included.
    pub properties: usize,
}

/// Checks the manifest at `path`.
///
/// # Errors
///
/// Every error found while loading and linking.
pub fn run(path: &Path) -> CliResult<CheckSummary> {
    let source = ManifestSource {
        kind: manifest_kind(path),
        path: Some(path.to_path_buf()),
        nodes: Vec::new(),
    };
    let manifest = load_manifest(&source, None)?;
    let summary = CheckSummary {
        datasets: manifest.node_names(NodeKind::Dataset).len(),
        models: manifest.node_names(NodeKind::Model).len(),
        properties: manifest.node_names(NodeKind::Property).len(),
    };
    println!(
        "{}: OK ({} datasets, {} models, {} properties)",
        path.display(),
        summary.datasets,
        summary.models,
        summary.properties
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CliError;
    use std::fs;

    #[test]
    fn valid_manifests_pass() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.yml");
        fs::write(
            &path,
            "type: model\nname: example/City\nproperties:\n  name: {type: string}\n",
        )
        .unwrap();
        let summary = run(&path).unwrap();
        assert_eq!(summary.models, 1);
    }

    #[test]
    fn broken_refs_fail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.yml");
        fs::write(
            &path,
            "type: model\nname: City\nproperties:\n  country: {type: ref, model: Country}\n",
        )
        .unwrap();
        let err = run(&path).unwrap_err();
        assert!(matches!(err, CliError::Core(_)));
        assert_eq!(err.exit_code(), std::process::ExitCode::from(1));
    }
}
