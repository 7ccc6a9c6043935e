//! `migrate`: bring backend schemas in line with the manifest.

use crate::error::CliResult;
use datagate_core::{SchemaAction, Store};
use std::collections::BTreeMap;

/// Plans (with `dry_run`) or applies the migrations of every backend.
///
/// # Errors
///
/// `MultipleParentsError` for diverged version chains, backend failures.
pub fn run(store: &Store, dry_run: bool) -> CliResult<BTreeMap<String, Vec<SchemaAction>>> {
    let plans = if dry_run {
        store.plan_migrations()?
    } else {
        store.migrate()?
    };
    for (backend, actions) in &plans {
        if actions.is_empty() {
            println!("{backend}: up to date");
            continue;
        }
        println!("{backend}:");
        for action in actions {
            println!("  {}", action.to_patch());
        }
    }
    Ok(plans)
}

#[cfg(test)]
mod tests {
    use super::*;
    use datagate_core::load_yaml_str;

    #[test]
    fn dry_runs_report_missing_tables() {
        let manifest = load_yaml_str("type: model\nname: report\nproperties:\n  status: {type: string}\n").unwrap();
        let store = Store::in_memory(manifest).unwrap();
        let plans = run(&store, true).unwrap();
        assert!(matches!(plans["default"][0], SchemaAction::CreateTable { .. }));

        run(&store, false).unwrap();
        let plans = run(&store, true).unwrap();
        assert!(plans["default"].is_empty());
    }
}
