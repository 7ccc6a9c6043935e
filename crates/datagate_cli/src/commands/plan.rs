//! `plan`: print the backend plan a query compiles to.

use crate::error::{CliError, CliResult};
use datagate_core::backends::{document, sql};
use datagate_core::types::Action;
use datagate_core::ufunc::{builtins, resolve_query, Env};
use datagate_core::{BackendKind, Config, Manifest};
use std::collections::BTreeMap;

/// Resolves `query` against `model` and renders the plan for the model's
/// backend family. Reads are trusted, so no scope is checked.
///
/// # Errors
///
/// Unknown models, expression and resolution errors, compile errors.
pub fn render(config: &Config, manifest: &Manifest, model: &str, query: Option<&str>) -> CliResult<String> {
    let model = manifest.model_by_name(model)?;
    let family = config
        .backends()?
        .get(&model.backend)
        .map_or(BackendKind::Memory, |b| b.kind);
    let node = query
        .filter(|q| !q.trim().is_empty())
        .map(datagate_expr::parse)
        .transpose()
        .map_err(datagate_core::CoreError::from)?;

    let funcs = builtins()?;
    let params = BTreeMap::new();
    let env = Env {
        manifest,
        model,
        family,
        caller: None,
        action: if node.is_some() { Action::Search } else { Action::Getall },
        funcs: &funcs,
        params: &params,
    };
    let resolved = resolve_query(&env, node.as_ref())?;

    Ok(match family {
        BackendKind::Sql => {
            let plan = sql::compile_select(manifest, &resolved, &model.backend)?;
            let params = serde_json::to_string(&plan.params)?;
            format!("{}\n-- params: {params}", plan.sql)
        }
        BackendKind::Document => {
            let plan = document::compile_find(manifest, &resolved, &model.backend)?;
            let sort: serde_json::Map<String, serde_json::Value> = plan
                .sort
                .iter()
                .map(|(field, dir)| (field.clone(), serde_json::Value::from(*dir)))
                .collect();
            serde_json::to_string_pretty(&serde_json::json!({
                "collection": plan.collection,
                "filter": plan.filter,
                "sort": sort,
                "skip": plan.skip,
                "limit": plan.limit,
            }))?
        }
        BackendKind::Memory | BackendKind::Tabular => format!("{resolved:#?}"),
    })
}

/// Prints the plan.
///
/// # Errors
///
/// As [`render`].
pub fn run(config: &Config, manifest: &Manifest, model: &str, query: Option<&str>) -> CliResult<()> {
    if model.is_empty() {
        return Err(CliError::Usage("model name required".into()));
    }
    println!("{}", render(config, manifest, model, query)?);
    Ok(())
}
