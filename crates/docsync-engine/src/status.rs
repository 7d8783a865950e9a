use std::fmt;

use docsync_core::StoreError;
use serde::Serialize;

use crate::request::{SyncAction, SyncRequest};

/// Lifecycle of a sync worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Spawned, no poll completed yet.
    Starting,
    /// The queue was empty at the last poll.
    Idle,
    /// Processing a request.
    Syncing,
    /// Stop requested; finishing whatever is still queued.
    Draining,
    Stopped,
}

/// How a replication action failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The remote store could not be reached.
    Connectivity,
    Unexpected,
}

/// A replication action that failed. The request itself is dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncFailure {
    pub kind: FailureKind,
    pub action: SyncAction,
    pub key: Option<String>,
    pub message: String,
}

impl SyncFailure {
    pub(crate) fn new(request: &SyncRequest, error: &StoreError) -> Self {
        let kind = if error.is_connectivity() {
            FailureKind::Connectivity
        } else {
            FailureKind::Unexpected
        };
        Self {
            kind,
            action: request.action(),
            key: request.key().map(str::to_string),
            message: error.to_string(),
        }
    }
}

impl fmt::Display for SyncFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.key {
            Some(key) => write!(f, "{} {:?} failed: {}", self.action, key, self.message),
            None => write!(f, "{} failed: {}", self.action, self.message),
        }
    }
}

/// Snapshot published by the worker after every state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerStatus {
    pub state: WorkerState,
    /// Ticket of the last request the worker finished with, successfully or not.
    pub settled: u64,
    /// Outcome of the last action that reached a verdict. Requests that
    /// found nothing to do (missing keys) leave it untouched.
    pub last_outcome: Option<Result<(), SyncFailure>>,
}

impl WorkerStatus {
    pub(crate) fn starting() -> Self {
        Self {
            state: WorkerState::Starting,
            settled: 0,
            last_outcome: None,
        }
    }

    /// Whether the most recent verdict was a failure.
    pub fn is_degraded(&self) -> bool {
        matches!(self.last_outcome, Some(Err(_)))
    }

    pub fn last_failure(&self) -> Option<&SyncFailure> {
        match &self.last_outcome {
            Some(Err(failure)) => Some(failure),
            _ => None,
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.state == WorkerState::Stopped
    }
}
