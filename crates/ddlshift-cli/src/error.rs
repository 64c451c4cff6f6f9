//! CLI errors.

use ddlshift_core::MigrationError;
use thiserror::Error;

/// Command errors.
#[derive(Debug, Error)]
pub enum CliError {
    /// Engine error.
    #[error("{0}")]
    Migration(#[from] MigrationError),

    /// File or terminal I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed schema file.
    #[error("invalid schema file: {0}")]
    Json(#[from] serde_json::Error),

    /// Data directory could not be opened.
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    /// Operator declined the plan.
    #[error("migration aborted by operator")]
    Aborted,
}

impl CliError {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Aborted => 2,
            CliError::Migration(MigrationError::AlreadyApplied { .. }) => 0,
            CliError::Migration(e) if e.requires_intervention() => 3,
            _ => 1,
        }
    }
}
