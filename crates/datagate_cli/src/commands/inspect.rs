//! `inspect`: list namespaces, models and properties.

use crate::error::CliResult;
use datagate_core::manifest::NodeKind;
use datagate_core::Manifest;
use serde::Serialize;

/// One model in the inspection output.
#[derive(Debug, Serialize)]
pub struct ModelInfo {
    /// Full name.
    pub name: String,
    /// Backend storing its rows.
    pub backend: String,
    /// Top-level properties.
    pub properties: Vec<PropertyInfo>,
}

/// One property in the inspection output.
#[derive(Debug, Serialize)]
pub struct PropertyInfo {
    /// Property name.
    pub name: String,
    /// Type name.
    #[serde(rename = "type")]
    pub dtype: &'static str,
    /// Required on insert.
    pub required: bool,
    /// Unique within the model.
    pub unique: bool,
}

/// Inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Namespace paths.
    pub namespaces: Vec<String>,
    /// Models in name order.
    pub models: Vec<ModelInfo>,
}

/// Collects the inspection result for `manifest`.
#[must_use]
pub fn collect(manifest: &Manifest) -> InspectResult {
    let mut models: Vec<ModelInfo> = manifest
        .models()
        .map(|model| ModelInfo {
            name: model.name.clone(),
            backend: model.backend.clone(),
            properties: manifest
                .top_properties(model.id)
                .filter(|p| !p.is_reserved())
                .map(|p| PropertyInfo {
                    name: p.name.clone(),
                    dtype: p.dtype.name(),
                    required: p.required,
                    unique: p.unique,
                })
                .collect(),
        })
        .collect();
    models.sort_by(|a, b| a.name.cmp(&b.name));
    InspectResult {
        namespaces: manifest.node_names(NodeKind::Namespace),
        models,
    }
}

/// Prints the inspection result as text or JSON.
///
/// # Errors
///
/// JSON serialization failures.
pub fn run(manifest: &Manifest, format: &str) -> CliResult<()> {
    let result = collect(manifest);
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&result)?),
        _ => print_text(&result),
    }
    Ok(())
}

fn print_text(result: &InspectResult) {
    if !result.namespaces.is_empty() {
        println!("Namespaces:");
        for ns in &result.namespaces {
            println!("  {ns}");
        }
        println!();
    }
    println!("Models:");
    for model in &result.models {
        println!("  {} [{}]", model.name, model.backend);
        for prop in &model.properties {
            let mut flags = Vec::new();
            if prop.required {
                flags.push("required");
            }
            if prop.unique {
                flags.push("unique");
            }
            let flags = if flags.is_empty() {
                String::new()
            } else {
                format!(" ({})", flags.join(", "))
            };
            println!("    {}: {}{flags}", prop.name, prop.dtype);
        }
    }
}
