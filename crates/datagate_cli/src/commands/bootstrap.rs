//! `bootstrap`: create storage for every model.

use crate::error::CliResult;
use datagate_core::Store;
use tracing::info;

/// Bootstraps every backend of `store`.
///
/// # Errors
///
/// Backend failures.
pub fn run(store: &Store) -> CliResult<()> {
    if !store.wait() {
        info!("some backends did not answer; bootstrapping anyway");
    }
    store.bootstrap()?;
    println!("bootstrapped {} models", store.manifest().models().count());
    Ok(())
}
