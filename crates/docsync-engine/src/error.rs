use docsync_core::StoreError;
use thiserror::Error;

/// Errors surfaced by document views.
///
/// Remote connectivity problems never show up here for buffered operations;
/// they are absorbed by the worker and reported through the degraded status.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("document is not open")]
    NotOpen,

    #[error("document is already open")]
    AlreadyOpen,

    /// A closed document cannot be reopened or used.
    #[error("document is closed")]
    Closed,

    #[error("sync worker is no longer running")]
    WorkerStopped,

    #[error(transparent)]
    Store(#[from] StoreError),
}
