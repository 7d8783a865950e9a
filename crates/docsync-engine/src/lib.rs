//! Buffered document synchronization.
//!
//! A [`Document`] keeps its key/value data in a local buffer and mirrors
//! every change to a shared remote store from a background worker, so it
//! stays usable while the remote store is slow or unreachable.

mod config;
mod document;
mod error;
mod milestones;
mod observer;
mod request;
mod status;
mod worker;

pub use config::SyncConfig;
pub use document::{CloseReport, Document, DocumentState, ReadOnlyDocument};
pub use error::SyncError;
pub use milestones::{Milestones, MILESTONE_SET};
pub use observer::{RecordingObserver, SkipReason, SyncEvent, SyncObserver, TracingObserver};
pub use request::{SyncAction, SyncRequest};
pub use status::{FailureKind, SyncFailure, WorkerState, WorkerStatus};
