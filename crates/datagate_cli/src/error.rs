//! CLI errors and their exit codes.

use datagate_core::{CoreError, ErrorReport};
use std::process::ExitCode;
use thiserror::Error;

/// Result alias for command implementations.
pub type CliResult<T> = Result<T, CliError>;

/// Errors a command can end with.
#[derive(Debug, Error)]
pub enum CliError {
    /// Configuration, manifest or backend failure.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Bad command-line input.
    #[error("{0}")]
    Usage(String),

    /// Output could not be written.
    #[error("output error: {0}")]
    Output(#[from] serde_json::Error),
}

impl CliError {
    /// `2` for schema version conflicts, `1` otherwise.
    #[must_use]
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Self::Core(err) if is_version_conflict(err) => ExitCode::from(2),
            _ => ExitCode::from(1),
        }
    }

    /// One line per error for stderr.
    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        match self {
            Self::Core(err) => ErrorReport::from_error(err)
                .errors
                .into_iter()
                .map(|e| format!("{}: {}", e.code, e.message))
                .collect(),
            other => vec![other.to_string()],
        }
    }
}

fn is_version_conflict(err: &CoreError) -> bool {
    ErrorReport::from_error(err)
        .errors
        .iter()
        .any(|e| e.code == "MultipleParentsError")
}

#[cfg(test)]
mod tests {
    use super::*;
    use datagate_core::ErrorKind;

    #[test]
    fn version_conflicts_exit_with_two() {
        let err = CliError::from(CoreError::from(
            ErrorKind::MultipleParentsError.err().model("report"),
        ));
        assert_eq!(err.exit_code(), ExitCode::from(2));
    }

    #[test]
    fn config_errors_exit_with_one() {
        let err = CliError::from(CoreError::config("manifest.path is required"));
        assert_eq!(err.exit_code(), ExitCode::from(1));
        assert_eq!(err.lines().len(), 1);
    }
}
