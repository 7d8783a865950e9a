use std::sync::Arc;
use std::time::Duration;

use docsync_core::{DocumentId, LocalBuffer, RemoteStore, StoreError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, instrument};

use crate::observer::{SkipReason, SyncEvent, SyncObserver};
use crate::request::{Envelope, SyncQueue, SyncRequest};
use crate::status::{SyncFailure, WorkerState, WorkerStatus};

/// What became of a request that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Applied {
    Done,
    Skipped(SkipReason),
}

/// Background task replicating one document between its local buffer and
/// the remote store.
///
/// Requests are handled strictly one at a time, in ticket order. A failed
/// request is reported and dropped; the worker never retries on its own.
pub(crate) struct SyncWorker {
    pub doc: DocumentId,
    pub buffer: Arc<dyn LocalBuffer>,
    pub remote: Arc<dyn RemoteStore>,
    pub queue: Arc<SyncQueue>,
    pub receiver: mpsc::UnboundedReceiver<Envelope>,
    pub stop: watch::Receiver<bool>,
    pub status: watch::Sender<WorkerStatus>,
    pub observer: Arc<dyn SyncObserver>,
    pub poll_interval: Duration,
}

impl SyncWorker {
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    #[instrument(skip(self), fields(doc = %self.doc), level = "debug")]
    async fn run(mut self) {
        debug!("Sync worker started");
        loop {
            if self.stop_requested() {
                self.set_state(WorkerState::Draining);
                match self.receiver.try_recv() {
                    Ok(envelope) => self.process(envelope).await,
                    Err(_) => break,
                }
                continue;
            }

            match tokio::time::timeout(self.poll_interval, self.receiver.recv()).await {
                Ok(Some(envelope)) => self.process(envelope).await,
                // Every sender is gone: nothing can be queued any more.
                Ok(None) => break,
                Err(_) => self.set_state(WorkerState::Idle),
            }
        }
        self.set_state(WorkerState::Stopped);
        debug!("Sync worker stopped");
    }

    /// A dropped stop sender counts as a stop request.
    fn stop_requested(&self) -> bool {
        *self.stop.borrow() || self.stop.has_changed().is_err()
    }

    fn set_state(&self, state: WorkerState) {
        self.status.send_if_modified(|status| {
            if status.state == state {
                return false;
            }
            status.state = state;
            true
        });
    }

    async fn process(&self, envelope: Envelope) {
        let Envelope { ticket, request } = envelope;
        if !self.stop_requested() {
            self.set_state(WorkerState::Syncing);
        }

        let result = self.apply(ticket, &request).await;

        let doc = self.doc.clone();
        let action = request.action();
        let key = request.key().map(str::to_string);
        let (event, outcome) = match result {
            Ok(Applied::Done) => (SyncEvent::Applied { doc, action, key }, Some(Ok(()))),
            Ok(Applied::Skipped(reason)) => {
                let outcome = reason.has_verdict().then_some(Ok(()));
                (
                    SyncEvent::Skipped {
                        doc,
                        action,
                        key,
                        reason,
                    },
                    outcome,
                )
            }
            Err(e) => {
                let failure = SyncFailure::new(&request, &e);
                (
                    SyncEvent::Failed {
                        doc,
                        failure: failure.clone(),
                    },
                    Some(Err(failure)),
                )
            }
        };

        self.observer.on_event(&event);
        self.status.send_modify(|status| {
            status.settled = ticket;
            if let Some(outcome) = outcome {
                status.last_outcome = Some(outcome);
            }
        });
    }

    async fn apply(&self, ticket: u64, request: &SyncRequest) -> Result<Applied, StoreError> {
        match request {
            SyncRequest::Set(key) => {
                let Some(value) = self.buffer.get(key)? else {
                    return Ok(Applied::Skipped(SkipReason::LocalMiss));
                };
                self.remote.set(&self.doc, key, &value).await?;
                self.queue.mark_pushed(key, ticket)?;
                Ok(Applied::Done)
            }
            SyncRequest::Get(key) => {
                let Some(value) = self.remote.get(&self.doc, key).await? else {
                    return Ok(Applied::Skipped(SkipReason::RemoteMiss));
                };
                self.queue.with_local_writes(|writes| {
                    if writes.written_after(key, ticket) {
                        return Ok(Applied::Skipped(SkipReason::NewerLocalWrite));
                    }
                    // A write whose push failed is still the value to keep.
                    if writes.unpushed(key) {
                        return Ok(Applied::Skipped(SkipReason::UnpushedLocalWrite));
                    }
                    self.buffer.set(key, &value)?;
                    Ok(Applied::Done)
                })
            }
            SyncRequest::Delete(key) => {
                // A key already absent remotely is as deleted as it gets.
                let deleted = self.remote.delete(&self.doc, key).await?;
                self.queue.mark_pushed(key, ticket)?;
                if deleted {
                    Ok(Applied::Done)
                } else {
                    Ok(Applied::Skipped(SkipReason::RemoteMiss))
                }
            }
            SyncRequest::Clear => self.queue.with_local_writes(|writes| {
                if self.buffer.is_empty()? {
                    return Ok(Applied::Skipped(SkipReason::EmptyBuffer));
                }
                for key in self.buffer.keys()? {
                    // Keys written after the clear was requested survive it.
                    if !writes.written_after(&key, ticket) {
                        self.buffer.delete(&key)?;
                        writes.forget(&key);
                    }
                }
                Ok(Applied::Done)
            }),
        }
    }
}
