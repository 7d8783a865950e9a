use thiserror::Error;

/// Errors that can occur in the buffer, remote store and lock layers.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The remote store could not be reached. Never fatal to a sync worker.
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The store handle was closed and can no longer be used.
    #[error("Closed: {0}")]
    Closed(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl StoreError {
    /// Whether this error means the remote store was unreachable.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, StoreError::Connectivity(_))
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}
