use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};

use docsync_core::StoreError;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::SyncError;

/// The four replication actions understood by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncAction {
    /// Push the buffered value of a key to the remote store.
    Set,
    /// Pull the remote value of a key into the buffer.
    Get,
    /// Delete a key from the remote store.
    Del,
    /// Clear the local buffer. The remote store is untouched.
    Clr,
}

impl SyncAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncAction::Set => "set",
            SyncAction::Get => "get",
            SyncAction::Del => "del",
            SyncAction::Clr => "clr",
        }
    }
}

impl fmt::Display for SyncAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request for the sync worker. Only `Clr` carries no key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncRequest {
    Set(String),
    Get(String),
    Delete(String),
    Clear,
}

impl SyncRequest {
    pub fn action(&self) -> SyncAction {
        match self {
            SyncRequest::Set(_) => SyncAction::Set,
            SyncRequest::Get(_) => SyncAction::Get,
            SyncRequest::Delete(_) => SyncAction::Del,
            SyncRequest::Clear => SyncAction::Clr,
        }
    }

    pub fn key(&self) -> Option<&str> {
        match self {
            SyncRequest::Set(key) | SyncRequest::Get(key) | SyncRequest::Delete(key) => Some(key),
            SyncRequest::Clear => None,
        }
    }
}

impl fmt::Display for SyncRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.key() {
            Some(key) => write!(f, "{} {:?}", self.action(), key),
            None => f.write_str(self.action().as_str()),
        }
    }
}

/// A queued request with its position in the queue.
///
/// Tickets start at 1 and follow enqueue order exactly.
#[derive(Debug)]
pub(crate) struct Envelope {
    pub ticket: u64,
    pub request: SyncRequest,
}

/// Ticket of the latest local write of every key, and of the latest write
/// request the remote store accepted for it.
#[derive(Debug, Default)]
pub(crate) struct LocalWrites {
    last_write: HashMap<String, u64>,
    pushed: HashMap<String, u64>,
}

impl LocalWrites {
    /// Whether `key` was written locally after the request holding `ticket`
    /// was enqueued.
    pub fn written_after(&self, key: &str, ticket: u64) -> bool {
        self.last_write.get(key).is_some_and(|&written| written > ticket)
    }

    /// Whether the latest local write of `key` has not reached the remote
    /// store yet, either still queued or failed.
    pub fn unpushed(&self, key: &str) -> bool {
        let Some(&written) = self.last_write.get(key) else {
            return false;
        };
        self.pushed.get(key).is_none_or(|&pushed| pushed < written)
    }

    /// Drop what is known about `key` once its local value is gone.
    pub fn forget(&mut self, key: &str) {
        self.last_write.remove(key);
        self.pushed.remove(key);
    }

    fn mark_pushed(&mut self, key: &str, ticket: u64) {
        let pushed = self.pushed.entry(key.to_string()).or_insert(0);
        *pushed = (*pushed).max(ticket);
    }
}

#[derive(Debug)]
struct QueueState {
    sender: Option<mpsc::UnboundedSender<Envelope>>,
    last_ticket: u64,
    writes: LocalWrites,
}

impl QueueState {
    fn send(&mut self, request: SyncRequest) -> Result<u64, SyncError> {
        let sender = self.sender.as_ref().ok_or(SyncError::Closed)?;
        let ticket = self.last_ticket + 1;
        sender
            .send(Envelope { ticket, request })
            .map_err(|_| SyncError::WorkerStopped)?;
        self.last_ticket = ticket;
        Ok(ticket)
    }
}

/// FIFO request queue between a document view and its worker.
///
/// Enqueueing never blocks. The same lock that assigns tickets also orders
/// local buffer writes against the worker's pulls, so a pull can tell
/// whether the caller wrote the key after asking for it.
#[derive(Debug)]
pub(crate) struct SyncQueue {
    state: Mutex<QueueState>,
}

impl SyncQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Envelope>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let queue = Self {
            state: Mutex::new(QueueState {
                sender: Some(sender),
                last_ticket: 0,
                writes: LocalWrites::default(),
            }),
        };
        (queue, receiver)
    }

    fn lock(&self) -> Result<MutexGuard<'_, QueueState>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Internal("sync queue lock poisoned".to_string()))
    }

    /// Enqueue a request, returning its ticket.
    pub fn push(&self, request: SyncRequest) -> Result<u64, SyncError> {
        self.lock()?.send(request)
    }

    /// Apply a local write to `key` and enqueue the request it yields.
    ///
    /// `apply` runs while worker pulls are held off. Returns the ticket of
    /// the enqueued request, or `None` when `apply` produced no request.
    pub fn local_write<F>(&self, key: &str, apply: F) -> Result<Option<u64>, SyncError>
    where
        F: FnOnce() -> Result<Option<SyncRequest>, StoreError>,
    {
        let mut state = self.lock()?;
        let Some(request) = apply()? else {
            return Ok(None);
        };
        let ticket = state.send(request)?;
        state.writes.last_write.insert(key.to_string(), ticket);
        Ok(Some(ticket))
    }

    /// Run `f` with local writes held off.
    pub fn with_local_writes<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut LocalWrites) -> Result<T, StoreError>,
    {
        let mut state = self.lock()?;
        f(&mut state.writes)
    }

    /// Record that the remote store accepted the write request of `key`
    /// holding `ticket`.
    pub fn mark_pushed(&self, key: &str, ticket: u64) -> Result<(), StoreError> {
        self.lock()?.writes.mark_pushed(key, ticket);
        Ok(())
    }

    /// Ticket of the most recently enqueued request, 0 if none.
    pub fn last_ticket(&self) -> u64 {
        self.lock().map(|state| state.last_ticket).unwrap_or(0)
    }

    /// Stop accepting requests. Requests already queued stay receivable.
    pub fn close(&self) {
        if let Ok(mut state) = self.lock() {
            state.sender = None;
        }
    }
}
