use std::path::PathBuf;
use thiserror::Error;

/// Failure kinds surfaced to callers of the core services. The periodic
/// engines treat everything here as recoverable; request-path operations
/// propagate them to the surface that invoked them.
#[derive(Debug, Error)]
pub enum PanelError {
    #[error("all execution strategies failed for '{action} {service}': {stderr}")]
    ExecutionFailed {
        action: String,
        service: String,
        stderr: String,
    },

    #[error("failed to write service artifact {path}: {source}")]
    ArtifactIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no free port in range {start}-{end}")]
    PortExhausted { start: i64, end: i64 },

    #[error("account '{0}' already exists")]
    DuplicateUsername(String),

    #[error("account not found: {0}")]
    AccountNotFound(String),

    #[error("account '{0}' is protected and cannot be deleted")]
    ProtectedAccount(String),

    #[error("counter source unavailable: {0}")]
    CounterSourceUnavailable(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type PanelResult<T> = Result<T, PanelError>;
