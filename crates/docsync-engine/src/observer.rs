use std::sync::Mutex;

use docsync_core::{DocumentId, ReplicaRank};
use tracing::{debug, error, info, warn};

use crate::request::SyncAction;
use crate::status::{FailureKind, SyncFailure};

/// Why the worker left a request without effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The key was no longer in the local buffer.
    LocalMiss,
    /// The key was not in the remote store.
    RemoteMiss,
    /// The local buffer was already empty.
    EmptyBuffer,
    /// The key was written locally after the pull was requested.
    NewerLocalWrite,
    /// The latest local write of the key has not reached the remote store.
    UnpushedLocalWrite,
}

impl SkipReason {
    pub fn is_miss(&self) -> bool {
        matches!(self, SkipReason::LocalMiss | SkipReason::RemoteMiss)
    }

    /// Misses, and pulls held back by a write that never got pushed, carry
    /// no verdict on the health of the sync.
    pub fn has_verdict(&self) -> bool {
        !self.is_miss() && *self != SkipReason::UnpushedLocalWrite
    }
}

/// Something that happened in a document's sync lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    Opened {
        doc: DocumentId,
        rank: ReplicaRank,
        location: String,
        /// Keys found in the buffer and queued for push.
        replayed: usize,
    },
    Applied {
        doc: DocumentId,
        action: SyncAction,
        key: Option<String>,
    },
    Skipped {
        doc: DocumentId,
        action: SyncAction,
        key: Option<String>,
        reason: SkipReason,
    },
    Failed {
        doc: DocumentId,
        failure: SyncFailure,
    },
    Closed {
        doc: DocumentId,
        rank: ReplicaRank,
        worker_stopped: bool,
        degraded: bool,
    },
    Removed {
        doc: DocumentId,
        rank: ReplicaRank,
        /// Set when removing the remote document failed.
        remote_error: Option<String>,
        buffer_deleted: bool,
    },
}

/// Receives every [`SyncEvent`] of the documents it is attached to.
///
/// Called from the worker task, so implementations must not block.
pub trait SyncObserver: Send + Sync {
    fn on_event(&self, event: &SyncEvent);
}

/// Default observer: forwards events to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl SyncObserver for TracingObserver {
    fn on_event(&self, event: &SyncEvent) {
        match event {
            SyncEvent::Opened {
                doc,
                rank,
                location,
                replayed,
            } => info!(
                "Opened {} (rank {}) at {}, replaying {} keys",
                doc, rank, location, replayed
            ),
            SyncEvent::Applied { doc, action, key } => {
                debug!("{}: {} {:?}", doc, action, key)
            }
            SyncEvent::Skipped {
                doc,
                action,
                key,
                reason,
            } => debug!("{}: {} {:?} skipped ({:?})", doc, action, key, reason),
            SyncEvent::Failed { doc, failure } => match failure.kind {
                FailureKind::Connectivity => {
                    warn!("{}: remote unreachable, {}", doc, failure)
                }
                FailureKind::Unexpected => error!("{}: {}", doc, failure),
            },
            SyncEvent::Closed {
                doc,
                rank,
                worker_stopped,
                degraded,
            } => {
                if !worker_stopped || *degraded {
                    warn!(
                        "Closed {} (rank {}) possibly out of sync: worker stopped={}, degraded={}",
                        doc, rank, worker_stopped, degraded
                    );
                } else {
                    info!("Closed {} (rank {})", doc, rank);
                }
            }
            SyncEvent::Removed {
                doc,
                rank,
                remote_error,
                buffer_deleted,
            } => {
                if let Some(e) = remote_error {
                    warn!("Could not remove remote document {}: {}", doc, e);
                }
                info!(
                    "Removed {} (rank {}), buffer deleted={}",
                    doc, rank, buffer_deleted
                );
            }
        }
    }
}

/// Observer keeping every event in memory.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<SyncEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SyncEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn failures(&self) -> Vec<SyncFailure> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                SyncEvent::Failed { failure, .. } => Some(failure),
                _ => None,
            })
            .collect()
    }
}

impl SyncObserver for RecordingObserver {
    fn on_event(&self, event: &SyncEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}
