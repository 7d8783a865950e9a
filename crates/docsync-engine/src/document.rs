use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

use docsync_core::{
    BufferProvider, DocumentId, LocalBuffer, RemoteStore, ReplicaRank, StoreError, Value,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, instrument, warn};

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::observer::{SyncEvent, SyncObserver, TracingObserver};
use crate::request::{SyncQueue, SyncRequest};
use crate::status::{SyncFailure, WorkerState, WorkerStatus};
use crate::worker::SyncWorker;

/// Lifecycle of a document view. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentState {
    Unopened,
    Open,
    Closed,
}

/// How a `close()` went.
///
/// Anything but a clean report means the remote store may be missing some
/// local changes; they stay in the buffer and are replayed on the next open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CloseReport {
    /// The worker finished within the bound. Otherwise it was aborted.
    pub worker_stopped: bool,
    /// The last sync verdict before closing was a failure.
    pub degraded: bool,
}

impl CloseReport {
    pub fn is_clean(&self) -> bool {
        self.worker_stopped && !self.degraded
    }
}

/// Resources that only exist while the document is open.
struct Session {
    buffer: Arc<dyn LocalBuffer>,
    queue: Arc<SyncQueue>,
    stop: watch::Sender<bool>,
    worker: JoinHandle<()>,
}

/// Read-only view of a document.
///
/// Reads are served from the local buffer, after asking the worker to pull
/// the remote value and waiting (bounded) for that pull to settle.
pub struct ReadOnlyDocument {
    id: DocumentId,
    rank: ReplicaRank,
    buffers: Arc<dyn BufferProvider>,
    remote: Arc<dyn RemoteStore>,
    config: SyncConfig,
    observer: Arc<dyn SyncObserver>,
    state: DocumentState,
    session: Option<Session>,
    /// Kept after close so the final status stays queryable.
    status: Option<watch::Receiver<WorkerStatus>>,
}

impl fmt::Debug for ReadOnlyDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadOnlyDocument")
            .field("id", &self.id)
            .field("rank", &self.rank)
            .field("buffers", &self.buffers.provider_name())
            .field("remote", &self.remote.backend_name())
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl ReadOnlyDocument {
    pub fn new(
        id: DocumentId,
        rank: ReplicaRank,
        buffers: Arc<dyn BufferProvider>,
        remote: Arc<dyn RemoteStore>,
    ) -> Self {
        Self {
            id,
            rank,
            buffers,
            remote,
            config: SyncConfig::default(),
            observer: Arc::new(TracingObserver),
            state: DocumentState::Unopened,
            session: None,
            status: None,
        }
    }

    pub fn with_config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn SyncObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn id(&self) -> &DocumentId {
        &self.id
    }

    pub fn rank(&self) -> ReplicaRank {
        self.rank
    }

    pub fn state(&self) -> DocumentState {
        self.state
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Where the local buffer of this document lives.
    pub fn location(&self) -> String {
        self.buffers.location(&self.id, self.rank)
    }

    /// Open the buffer, queue every buffered key for push and start the worker.
    #[instrument(skip(self), fields(doc = %self.id, rank = %self.rank), level = "debug")]
    pub async fn open(&mut self) -> Result<(), SyncError> {
        match self.state {
            DocumentState::Unopened => {}
            DocumentState::Open => return Err(SyncError::AlreadyOpen),
            DocumentState::Closed => return Err(SyncError::Closed),
        }

        let buffer = self.buffers.open(&self.id, self.rank)?;
        let (queue, receiver) = SyncQueue::new();
        let queue = Arc::new(queue);

        // Catch up on anything written while the remote was out of reach.
        let replayed = match Self::replay(buffer.as_ref(), &queue) {
            Ok(replayed) => replayed,
            Err(e) => {
                if let Err(close_err) = buffer.close() {
                    warn!("Failed to close buffer of {}: {}", self.id, close_err);
                }
                return Err(e);
            }
        };

        let (stop, stop_rx) = watch::channel(false);
        let (status_tx, status) = watch::channel(WorkerStatus::starting());
        let worker = SyncWorker {
            doc: self.id.clone(),
            buffer: Arc::clone(&buffer),
            remote: Arc::clone(&self.remote),
            queue: Arc::clone(&queue),
            receiver,
            stop: stop_rx,
            status: status_tx,
            observer: Arc::clone(&self.observer),
            poll_interval: self.config.poll_interval,
        }
        .spawn();

        self.observer.on_event(&SyncEvent::Opened {
            doc: self.id.clone(),
            rank: self.rank,
            location: self.location(),
            replayed,
        });

        self.session = Some(Session {
            buffer,
            queue,
            stop,
            worker,
        });
        self.status = Some(status);
        self.state = DocumentState::Open;
        Ok(())
    }

    fn replay(buffer: &dyn LocalBuffer, queue: &SyncQueue) -> Result<usize, SyncError> {
        let keys = buffer.keys()?;
        // Recorded as local writes: until pushed, pulls leave them alone.
        for key in &keys {
            queue.local_write(key, || Ok(Some(SyncRequest::Set(key.clone()))))?;
        }
        Ok(keys.len())
    }

    fn session(&self) -> Result<&Session, SyncError> {
        match (self.state, &self.session) {
            (DocumentState::Open, Some(session)) => Ok(session),
            (DocumentState::Closed, _) => Err(SyncError::Closed),
            _ => Err(SyncError::NotOpen),
        }
    }

    /// Snapshot of the worker status; `None` before the first open.
    pub fn status(&self) -> Option<WorkerStatus> {
        self.status.as_ref().map(|status| status.borrow().clone())
    }

    /// Whether the most recent sync verdict was a failure.
    pub fn is_degraded(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|status| status.borrow().is_degraded())
    }

    pub fn last_outcome(&self) -> Option<Result<(), SyncFailure>> {
        self.status
            .as_ref()
            .and_then(|status| status.borrow().last_outcome.clone())
    }

    pub fn worker_state(&self) -> Option<WorkerState> {
        self.status.as_ref().map(|status| status.borrow().state)
    }

    /// Whether no sync work is pending: the worker found the queue empty at
    /// its last poll and has settled every request enqueued so far.
    pub fn is_quiescent(&self) -> bool {
        let (Some(session), Some(status)) = (&self.session, &self.status) else {
            return true;
        };
        let status = status.borrow();
        status.state == WorkerState::Idle && status.settled >= session.queue.last_ticket()
    }

    /// Wait until the worker settled `ticket`, stopped, or `timeout` elapsed.
    async fn wait_for_ticket(&self, ticket: u64, timeout: Duration) -> bool {
        let Some(status) = &self.status else {
            return true;
        };
        let mut status = status.clone();
        let settled = tokio::time::timeout(
            timeout,
            status.wait_for(|s| s.settled >= ticket || s.is_stopped()),
        )
        .await;
        matches!(settled, Ok(Ok(_)))
    }

    /// Bounded wait used before reads. Skipped while degraded.
    async fn join(&self, ticket: u64) {
        if self.is_degraded() {
            return;
        }
        if !self.wait_for_ticket(ticket, self.config.read_timeout).await {
            debug!("{}: read proceeding with local data", self.id);
        }
    }

    /// Wait until every request enqueued so far has settled.
    ///
    /// Unlike reads this waits even while degraded. Returns `false` if the
    /// wait timed out.
    pub async fn wait_settled(&self, timeout: Duration) -> Result<bool, SyncError> {
        let ticket = self.session()?.queue.last_ticket();
        Ok(self.wait_for_ticket(ticket, timeout).await)
    }

    /// Pull `key` and read it from the buffer.
    pub async fn get(&self, key: &str) -> Result<Option<Value>, SyncError> {
        let session = self.session()?;
        let ticket = session.queue.push(SyncRequest::Get(key.to_string()))?;
        self.join(ticket).await;
        Ok(session.buffer.get(key)?)
    }

    /// Like [`get`](Self::get), falling back to `default` when the key is absent.
    pub async fn get_or(&self, key: &str, default: Value) -> Result<Value, SyncError> {
        Ok(self.get(key).await?.unwrap_or(default))
    }

    /// Like [`get`](Self::get), deserializing the value into `T`.
    pub async fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, SyncError> {
        match self.get(key).await? {
            Some(value) => {
                let typed = serde_json::from_value(value).map_err(StoreError::from)?;
                Ok(Some(typed))
            }
            None => Ok(None),
        }
    }

    pub async fn contains(&self, key: &str) -> Result<bool, SyncError> {
        let session = self.session()?;
        let ticket = session.queue.push(SyncRequest::Get(key.to_string()))?;
        self.join(ticket).await;
        Ok(session.buffer.contains(key)?)
    }

    /// Buffered keys in ascending order, once pending requests have settled.
    ///
    /// Only keys the buffer already knows are listed; nothing is pulled.
    pub async fn keys(&self) -> Result<Vec<String>, SyncError> {
        let session = self.session()?;
        self.join(session.queue.last_ticket()).await;
        Ok(session.buffer.keys()?)
    }

    pub async fn len(&self) -> Result<usize, SyncError> {
        let session = self.session()?;
        self.join(session.queue.last_ticket()).await;
        Ok(session.buffer.len()?)
    }

    pub async fn is_empty(&self) -> Result<bool, SyncError> {
        Ok(self.len().await? == 0)
    }

    /// Every buffered entry, in key order.
    pub async fn items(&self) -> Result<Vec<(String, Value)>, SyncError> {
        let session = self.session()?;
        self.join(session.queue.last_ticket()).await;
        let mut items = Vec::new();
        for key in session.buffer.keys()? {
            if let Some(value) = session.buffer.get(&key)? {
                items.push((key, value));
            }
        }
        Ok(items)
    }

    /// Close with the configured join timeout.
    pub async fn close(&mut self) -> Result<CloseReport, SyncError> {
        self.close_with_timeout(self.config.join_timeout).await
    }

    /// Stop syncing and close the buffer, returning within about `timeout`.
    ///
    /// The buffer is flushed and closed whatever the worker does, and is
    /// never deleted here.
    #[instrument(skip(self), fields(doc = %self.id, rank = %self.rank), level = "debug")]
    pub async fn close_with_timeout(&mut self, timeout: Duration) -> Result<CloseReport, SyncError> {
        match self.state {
            DocumentState::Open => {}
            DocumentState::Unopened => return Err(SyncError::NotOpen),
            DocumentState::Closed => return Err(SyncError::Closed),
        }
        let Some(mut session) = self.session.take() else {
            return Err(SyncError::NotOpen);
        };
        self.state = DocumentState::Closed;
        let deadline = Instant::now() + timeout;

        // Let the in-flight work settle once.
        let pending = session.queue.last_ticket();
        if !self.is_degraded() {
            let settle = self.config.settle_timeout.min(timeout);
            if !self.wait_for_ticket(pending, settle).await {
                debug!("Pending requests did not settle within {:?}", settle);
            }
        }

        session.queue.close();
        // The worker may already be gone; nothing to tell it then.
        let _ = session.stop.send(true);

        let flushed = session.buffer.flush();

        let remaining = deadline.saturating_duration_since(Instant::now());
        let worker_stopped = match tokio::time::timeout(remaining, &mut session.worker).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                error!("Sync worker of {} ended abnormally: {}", self.id, e);
                true
            }
            Err(_) => {
                session.worker.abort();
                false
            }
        };
        let degraded = self.is_degraded();

        let closed = session.buffer.close();
        self.observer.on_event(&SyncEvent::Closed {
            doc: self.id.clone(),
            rank: self.rank,
            worker_stopped,
            degraded,
        });

        flushed?;
        closed?;
        Ok(CloseReport {
            worker_stopped,
            degraded,
        })
    }
}

impl Drop for ReadOnlyDocument {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        warn!("{} dropped while open; close() it to bound the final sync", self.id);
        session.queue.close();
        let _ = session.stop.send(true);
        if let Err(e) = session.buffer.flush() {
            warn!("Failed to flush buffer of {}: {}", self.id, e);
        }
        // The worker may be stuck on the remote; release the buffer now so
        // the replica can be reopened. Whatever it still drains fails as
        // closed and is replayed on the next open.
        if let Err(e) = session.buffer.close() {
            warn!("Failed to close buffer of {}: {}", self.id, e);
        }
    }
}

/// Read-write view of a document.
///
/// Writes land in the local buffer immediately and are mirrored to the
/// remote store by the worker. They never wait on the network.
#[derive(Debug)]
pub struct Document {
    inner: ReadOnlyDocument,
}

impl Document {
    pub fn new(
        id: DocumentId,
        rank: ReplicaRank,
        buffers: Arc<dyn BufferProvider>,
        remote: Arc<dyn RemoteStore>,
    ) -> Self {
        Self {
            inner: ReadOnlyDocument::new(id, rank, buffers, remote),
        }
    }

    pub fn with_config(self, config: SyncConfig) -> Self {
        Self {
            inner: self.inner.with_config(config),
        }
    }

    pub fn with_observer(self, observer: Arc<dyn SyncObserver>) -> Self {
        Self {
            inner: self.inner.with_observer(observer),
        }
    }

    /// Write `value` to the buffer and queue its push.
    pub fn set(&self, key: &str, value: Value) -> Result<(), SyncError> {
        let session = self.inner.session()?;
        session.queue.local_write(key, || {
            session.buffer.set(key, &value)?;
            Ok(Some(SyncRequest::Set(key.to_string())))
        })?;
        Ok(())
    }

    /// Like [`set`](Self::set), serializing `value` first.
    pub fn set_as<T: Serialize>(&self, key: &str, value: &T) -> Result<(), SyncError> {
        let value = serde_json::to_value(value).map_err(StoreError::from)?;
        self.set(key, value)
    }

    /// Apply a sequence of sets, in order.
    pub fn update<I, K>(&self, items: I) -> Result<(), SyncError>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: AsRef<str>,
    {
        for (key, value) in items {
            self.set(key.as_ref(), value)?;
        }
        Ok(())
    }

    /// Delete `key` from the buffer and queue the remote delete.
    ///
    /// Returns whether the key was buffered. Nothing is queued otherwise.
    pub fn delete(&self, key: &str) -> Result<bool, SyncError> {
        let session = self.inner.session()?;
        let ticket = session.queue.local_write(key, || {
            let existed = session.buffer.delete(key)?;
            Ok(existed.then(|| SyncRequest::Delete(key.to_string())))
        })?;
        Ok(ticket.is_some())
    }

    /// Queue a clear of the local buffer. The remote store keeps its values.
    ///
    /// Without a running worker there is nothing to coordinate with and the
    /// call does nothing. Returns whether a clear was queued.
    pub fn clear(&self) -> Result<bool, SyncError> {
        let Some(session) = &self.inner.session else {
            return Ok(false);
        };
        if session.worker.is_finished() {
            return Ok(false);
        }
        session.queue.push(SyncRequest::Clear)?;
        Ok(true)
    }

    /// Delete the document everywhere: the remote copy on a best-effort
    /// basis, then the local buffer.
    ///
    /// An unreachable remote is logged and does not stop the local removal.
    /// Any other remote error, or failing to delete the buffer, is returned.
    #[instrument(skip(self), fields(doc = %self.inner.id, rank = %self.inner.rank), level = "debug")]
    pub async fn remove(mut self) -> Result<(), SyncError> {
        if self.inner.state == DocumentState::Open {
            if let Err(e) = self.inner.close().await {
                warn!("Closing {} before removal failed: {}", self.inner.id, e);
            }
        }

        let remote_error = match self.inner.remote.remove_document(&self.inner.id).await {
            Ok(existed) => {
                debug!("Remote document {} existed: {}", self.inner.id, existed);
                None
            }
            Err(e) if e.is_connectivity() => Some(e.to_string()),
            Err(e) => return Err(e.into()),
        };

        let buffer_deleted = self.inner.buffers.destroy(&self.inner.id, self.inner.rank)?;
        self.inner.observer.on_event(&SyncEvent::Removed {
            doc: self.inner.id.clone(),
            rank: self.inner.rank,
            remote_error,
            buffer_deleted,
        });
        Ok(())
    }

    pub fn into_inner(self) -> ReadOnlyDocument {
        self.inner
    }
}

impl Deref for Document {
    type Target = ReadOnlyDocument;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl DerefMut for Document {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::{RecordingObserver, SkipReason};
    use crate::status::FailureKind;
    use async_trait::async_trait;
    use docsync_core::{Fault, MemoryBufferProvider, MemoryRemoteStore};
    use docsync_local::RedbBufferProvider;
    use serde_json::json;
    use tempfile::TempDir;

    const SETTLE: Duration = Duration::from_secs(2);

    fn doc_id(id: &str) -> DocumentId {
        DocumentId::new(id).unwrap()
    }

    fn fast_config() -> SyncConfig {
        SyncConfig::default().with_poll_interval(Duration::from_millis(10))
    }

    struct Setup {
        buffers: Arc<dyn BufferProvider>,
        remote: Arc<MemoryRemoteStore>,
        observer: Arc<RecordingObserver>,
    }

    impl Setup {
        fn memory() -> Self {
            Self {
                buffers: Arc::new(MemoryBufferProvider::new()),
                remote: Arc::new(MemoryRemoteStore::new()),
                observer: Arc::new(RecordingObserver::new()),
            }
        }

        fn redb(temp_dir: &TempDir) -> Self {
            Self {
                buffers: Arc::new(RedbBufferProvider::new(temp_dir.path().join("buffers"))),
                ..Self::memory()
            }
        }

        fn document(&self, id: &str, rank: u32) -> Document {
            Document::new(
                doc_id(id),
                ReplicaRank(rank),
                self.buffers.clone(),
                self.remote.clone(),
            )
            .with_config(fast_config())
            .with_observer(self.observer.clone())
        }

        async fn opened(&self, id: &str, rank: u32) -> Document {
            let mut doc = self.document(id, rank);
            doc.open().await.unwrap();
            doc
        }
    }

    /// Remote store whose calls never complete.
    struct StallingRemote;

    #[async_trait]
    impl RemoteStore for StallingRemote {
        fn backend_name(&self) -> &'static str {
            "stalling"
        }

        async fn get(&self, _: &DocumentId, _: &str) -> Result<Option<Value>, StoreError> {
            std::future::pending().await
        }

        async fn set(&self, _: &DocumentId, _: &str, _: &Value) -> Result<(), StoreError> {
            std::future::pending().await
        }

        async fn delete(&self, _: &DocumentId, _: &str) -> Result<bool, StoreError> {
            std::future::pending().await
        }

        async fn keys(&self, _: &DocumentId) -> Result<Vec<String>, StoreError> {
            std::future::pending().await
        }

        async fn clear(&self, _: &DocumentId) -> Result<(), StoreError> {
            std::future::pending().await
        }

        async fn remove_document(&self, _: &DocumentId) -> Result<bool, StoreError> {
            std::future::pending().await
        }

        async fn add_tag(&self, _: &DocumentId, _: &str, _: &str) -> Result<(), StoreError> {
            std::future::pending().await
        }

        async fn remove_tag(&self, _: &DocumentId, _: &str, _: &str) -> Result<(), StoreError> {
            std::future::pending().await
        }

        async fn has_tag(&self, _: &DocumentId, _: &str, _: &str) -> Result<bool, StoreError> {
            std::future::pending().await
        }

        async fn tags(&self, _: &DocumentId, _: &str) -> Result<Vec<String>, StoreError> {
            std::future::pending().await
        }

        async fn clear_tags(&self, _: &DocumentId, _: &str) -> Result<(), StoreError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_reads_see_local_writes_while_offline() {
        let setup = Setup::memory();
        setup.remote.set_fault(Fault::Offline);
        let doc = setup.opened("doc", 0).await;

        doc.set("x", json!(1)).unwrap();
        assert_eq!(doc.get("x").await.unwrap(), Some(json!(1)));

        doc.set("x", json!(2)).unwrap();
        assert_eq!(doc.get("x").await.unwrap(), Some(json!(2)));

        assert!(doc.delete("x").unwrap());
        assert_eq!(doc.get("x").await.unwrap(), None);
        assert!(!doc.delete("x").unwrap());
    }

    #[tokio::test]
    async fn test_writes_reach_remote() {
        let setup = Setup::memory();
        let doc = setup.opened("doc", 0).await;

        doc.update([("a", json!(1)), ("b", json!({"k": [1, 2]}))])
            .unwrap();
        doc.set("gone", json!(true)).unwrap();
        doc.delete("gone").unwrap();
        assert!(doc.wait_settled(SETTLE).await.unwrap());

        let remote = setup.remote.snapshot(doc.id());
        assert_eq!(remote.len(), 2);
        assert_eq!(remote["b"], json!({"k": [1, 2]}));
        assert!(!doc.is_degraded());
        assert_eq!(doc.last_outcome(), Some(Ok(())));
    }

    #[tokio::test]
    async fn test_reads_pull_remote_values() {
        let setup = Setup::memory();
        let doc = setup.opened("doc", 0).await;
        setup
            .remote
            .set(doc.id(), "shared", &json!("from elsewhere"))
            .await
            .unwrap();

        assert!(doc.contains("shared").await.unwrap());
        assert_eq!(
            doc.get("shared").await.unwrap(),
            Some(json!("from elsewhere"))
        );
        assert_eq!(
            doc.get_or("missing", json!(0)).await.unwrap(),
            json!(0)
        );
    }

    #[tokio::test]
    async fn test_typed_access_and_listing() {
        let setup = Setup::memory();
        let doc = setup.opened("doc", 0).await;

        doc.set_as("steps", &vec![1u32, 2, 3]).unwrap();
        doc.set("name", json!("run")).unwrap();

        let steps: Option<Vec<u32>> = doc.get_as("steps").await.unwrap();
        assert_eq!(steps, Some(vec![1, 2, 3]));
        assert!(doc.get_as::<u32>("name").await.is_err());

        assert_eq!(doc.keys().await.unwrap(), vec!["name", "steps"]);
        assert_eq!(doc.len().await.unwrap(), 2);
        assert!(!doc.is_empty().await.unwrap());
        let items = doc.items().await.unwrap();
        assert_eq!(items[0], ("name".to_string(), json!("run")));
    }

    #[tokio::test]
    async fn test_close_and_reopen_keeps_values() {
        let temp_dir = TempDir::new().unwrap();
        let setup = Setup::redb(&temp_dir);

        let mut doc = setup.opened("d1", 0).await;
        doc.set("x", json!(1)).unwrap();
        let report = doc.close().await.unwrap();
        assert!(report.is_clean());
        assert_eq!(setup.remote.snapshot(&doc_id("d1"))["x"], json!(1));

        let mut reopened = setup.opened("d1", 0).await;
        assert_eq!(reopened.get("x").await.unwrap(), Some(json!(1)));
        reopened.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_other_rank_pulls_from_remote() {
        let temp_dir = TempDir::new().unwrap();
        let setup = Setup::redb(&temp_dir);

        let mut writer = setup.opened("d1", 0).await;
        writer.set("x", json!(1)).unwrap();
        writer.close().await.unwrap();

        let mut reader = setup.opened("d1", 1).await;
        assert_eq!(reader.get("x").await.unwrap(), Some(json!(1)));
        reader.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_open_replays_offline_writes() {
        let temp_dir = TempDir::new().unwrap();
        let setup = Setup::redb(&temp_dir);
        setup.remote.set_fault(Fault::Offline);

        let mut doc = setup.opened("d1", 0).await;
        doc.set("late", json!("value")).unwrap();
        let report = doc.close().await.unwrap();
        assert!(report.degraded);
        assert!(setup.remote.snapshot(&doc_id("d1")).is_empty());

        setup.remote.set_fault(Fault::None);
        let mut doc = setup.opened("d1", 0).await;
        assert!(doc.wait_settled(SETTLE).await.unwrap());
        assert_eq!(setup.remote.snapshot(&doc_id("d1"))["late"], json!("value"));
        assert!(setup.observer.events().iter().any(|event| matches!(
            event,
            SyncEvent::Opened { replayed: 1, .. }
        )));
        doc.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_clear_leaves_remote_untouched() {
        let setup = Setup::memory();
        let doc = setup.opened("doc", 0).await;
        doc.update([("a", json!(1)), ("b", json!(2))]).unwrap();
        assert!(doc.wait_settled(SETTLE).await.unwrap());

        assert!(doc.clear().unwrap());
        assert!(doc.wait_settled(SETTLE).await.unwrap());

        assert!(doc.keys().await.unwrap().is_empty());
        assert_eq!(setup.remote.snapshot(doc.id()).len(), 2);
    }

    #[tokio::test]
    async fn test_clear_spares_later_writes() {
        let setup = Setup::memory();
        let doc = setup.opened("doc", 0).await;
        doc.set("before", json!(1)).unwrap();

        doc.clear().unwrap();
        doc.set("after", json!(2)).unwrap();

        assert_eq!(doc.keys().await.unwrap(), vec!["after"]);
    }

    #[tokio::test]
    async fn test_clear_of_empty_buffer_is_a_noop() {
        let setup = Setup::memory();
        let doc = setup.opened("doc", 0).await;

        assert!(doc.clear().unwrap());
        assert!(doc.wait_settled(SETTLE).await.unwrap());

        assert!(setup.observer.events().iter().any(|event| matches!(
            event,
            SyncEvent::Skipped {
                reason: SkipReason::EmptyBuffer,
                ..
            }
        )));
        assert!(!doc.is_degraded());
    }

    #[tokio::test]
    async fn test_clear_without_worker_does_nothing() {
        let setup = Setup::memory();
        let mut doc = setup.document("doc", 0);
        assert!(!doc.clear().unwrap());

        doc.open().await.unwrap();
        doc.close().await.unwrap();
        assert!(!doc.clear().unwrap());
    }

    #[tokio::test]
    async fn test_offline_close_is_bounded_and_remove_deletes_buffer() {
        let temp_dir = TempDir::new().unwrap();
        let setup = Setup::redb(&temp_dir);
        setup.remote.set_fault(Fault::Offline);

        let mut doc = setup.opened("d2", 0).await;
        doc.set("y", json!(2)).unwrap();

        let started = std::time::Instant::now();
        let report = doc.close_with_timeout(Duration::from_secs(1)).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(1500));
        assert!(report.degraded);
        assert!(!report.is_clean());
        assert!(setup.buffers.exists(&doc_id("d2"), ReplicaRank(0)));

        // A fresh view of the closed document removes it.
        setup.document("d2", 0).remove().await.unwrap();
        assert!(!setup.buffers.exists(&doc_id("d2"), ReplicaRank(0)));
        assert!(setup.observer.events().iter().any(|event| matches!(
            event,
            SyncEvent::Removed {
                remote_error: Some(_),
                buffer_deleted: true,
                ..
            }
        )));
    }

    #[tokio::test]
    async fn test_remove_open_document() {
        let setup = Setup::memory();
        let doc = setup.opened("doc", 0).await;
        doc.set("x", json!(1)).unwrap();
        assert!(doc.wait_settled(SETTLE).await.unwrap());

        doc.remove().await.unwrap();
        assert!(setup.remote.snapshot(&doc_id("doc")).is_empty());
        assert!(!setup.buffers.exists(&doc_id("doc"), ReplicaRank(0)));
    }

    #[tokio::test]
    async fn test_remove_surfaces_unexpected_remote_errors() {
        let setup = Setup::memory();
        let mut doc = setup.opened("doc", 0).await;
        doc.close().await.unwrap();

        setup.remote.set_fault(Fault::Unexpected);
        let err = setup.document("doc", 0).remove().await.unwrap_err();
        assert!(matches!(err, SyncError::Store(StoreError::Internal(_))));
        assert!(setup.buffers.exists(&doc_id("doc"), ReplicaRank(0)));
    }

    #[tokio::test]
    async fn test_degraded_clears_after_success() {
        let setup = Setup::memory();
        setup.remote.set_fault(Fault::Offline);
        let doc = setup.opened("doc", 0).await;

        doc.set("x", json!(1)).unwrap();
        assert!(doc.wait_settled(SETTLE).await.unwrap());
        assert!(doc.is_degraded());
        let failure = doc.status().unwrap().last_failure().cloned().unwrap();
        assert_eq!(failure.kind, FailureKind::Connectivity);
        assert_eq!(failure.key.as_deref(), Some("x"));

        setup.remote.set_fault(Fault::None);
        doc.set("y", json!(2)).unwrap();
        assert!(doc.wait_settled(SETTLE).await.unwrap());
        assert!(!doc.is_degraded());

        // The failed push is not retried.
        let remote = setup.remote.snapshot(doc.id());
        assert!(!remote.contains_key("x"));
        assert_eq!(remote["y"], json!(2));
    }

    #[tokio::test]
    async fn test_pull_keeps_unpushed_local_write() {
        let setup = Setup::memory();
        let doc = setup.opened("doc", 0).await;
        setup.remote.set(doc.id(), "x", &json!(1)).await.unwrap();

        setup.remote.set_fault(Fault::Offline);
        doc.set("x", json!(2)).unwrap();
        assert!(doc.wait_settled(SETTLE).await.unwrap());
        assert!(doc.is_degraded());

        setup.remote.set_fault(Fault::None);
        assert_eq!(doc.get("x").await.unwrap(), Some(json!(2)));
        assert!(doc.wait_settled(SETTLE).await.unwrap());
        assert_eq!(doc.get("x").await.unwrap(), Some(json!(2)));
        assert!(setup.observer.events().iter().any(|event| matches!(
            event,
            SyncEvent::Skipped {
                reason: SkipReason::UnpushedLocalWrite,
                ..
            }
        )));

        // The next write goes through and pulls resume.
        doc.set("x", json!(3)).unwrap();
        assert!(doc.wait_settled(SETTLE).await.unwrap());
        assert!(!doc.is_degraded());
        assert_eq!(setup.remote.snapshot(doc.id())["x"], json!(3));
        setup.remote.set(doc.id(), "x", &json!(4)).await.unwrap();
        assert_eq!(doc.get("x").await.unwrap(), Some(json!(4)));
    }

    #[tokio::test]
    async fn test_unexpected_failures_are_classified() {
        let setup = Setup::memory();
        setup.remote.set_fault(Fault::Unexpected);
        let doc = setup.opened("doc", 0).await;

        doc.set("x", json!(1)).unwrap();
        assert!(doc.wait_settled(SETTLE).await.unwrap());

        let failures = setup.observer.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].kind, FailureKind::Unexpected);
        assert!(doc.is_degraded());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_ranks_write_disjoint_keys() {
        let temp_dir = TempDir::new().unwrap();
        let setup = Setup::redb(&temp_dir);

        let mut tasks = Vec::new();
        for rank in 0..2u32 {
            let mut doc = setup.opened("shared", rank).await;
            tasks.push(tokio::spawn(async move {
                for i in 0..20 {
                    doc.set(&format!("r{}-{}", rank, i), json!(i)).unwrap();
                }
                doc.close().await.unwrap()
            }));
        }
        for task in tasks {
            assert!(task.await.unwrap().is_clean());
        }

        let remote = setup.remote.snapshot(&doc_id("shared"));
        assert_eq!(remote.len(), 40);
        assert_eq!(remote["r0-7"], json!(7));
        assert_eq!(remote["r1-19"], json!(19));
    }

    #[tokio::test]
    async fn test_close_aborts_stalled_worker() {
        let buffers: Arc<dyn BufferProvider> = Arc::new(MemoryBufferProvider::new());
        let mut doc = Document::new(
            doc_id("doc"),
            ReplicaRank(0),
            buffers.clone(),
            Arc::new(StallingRemote),
        )
        .with_config(fast_config());
        doc.open().await.unwrap();
        doc.set("x", json!(1)).unwrap();

        let started = std::time::Instant::now();
        let report = doc
            .close_with_timeout(Duration::from_millis(300))
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!report.worker_stopped);
        assert!(!report.degraded);

        // The buffer is kept for the next session.
        let buffer = buffers.open(&doc_id("doc"), ReplicaRank(0)).unwrap();
        assert_eq!(buffer.get("x").unwrap(), Some(json!(1)));
    }

    #[tokio::test]
    async fn test_dropped_view_releases_buffer() {
        let temp_dir = TempDir::new().unwrap();
        let buffers: Arc<dyn BufferProvider> =
            Arc::new(RedbBufferProvider::new(temp_dir.path().join("buffers")));
        let stalled = || {
            Document::new(
                doc_id("d3"),
                ReplicaRank(0),
                buffers.clone(),
                Arc::new(StallingRemote),
            )
            .with_config(fast_config().with_read_timeout(Duration::from_millis(50)))
        };

        let mut doc = stalled();
        doc.open().await.unwrap();
        doc.set("x", json!(1)).unwrap();
        drop(doc);

        // The first worker is still stuck pushing, yet the replica reopens.
        let mut doc = stalled();
        doc.open().await.unwrap();
        assert_eq!(doc.get("x").await.unwrap(), Some(json!(1)));
        doc.close_with_timeout(Duration::from_millis(300))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_lifecycle_errors() {
        let setup = Setup::memory();
        let mut doc = setup.document("doc", 0);
        assert_eq!(doc.state(), DocumentState::Unopened);
        assert!(matches!(doc.get("x").await, Err(SyncError::NotOpen)));
        assert!(matches!(doc.set("x", json!(1)), Err(SyncError::NotOpen)));
        assert!(matches!(doc.close().await, Err(SyncError::NotOpen)));

        doc.open().await.unwrap();
        assert!(matches!(doc.open().await, Err(SyncError::AlreadyOpen)));

        doc.close().await.unwrap();
        assert_eq!(doc.state(), DocumentState::Closed);
        assert!(matches!(doc.get("x").await, Err(SyncError::Closed)));
        assert!(matches!(doc.delete("x"), Err(SyncError::Closed)));
        assert!(matches!(doc.close().await, Err(SyncError::Closed)));
        assert!(matches!(doc.open().await, Err(SyncError::Closed)));
    }

    #[tokio::test]
    async fn test_worker_status_transitions() {
        let setup = Setup::memory();
        let mut doc = setup.opened("doc", 0).await;
        doc.set("x", json!(1)).unwrap();

        let mut status = doc.status.clone().unwrap();
        assert!(matches!(
            tokio::time::timeout(
                SETTLE,
                status.wait_for(|s| s.state == WorkerState::Idle && s.settled >= 1),
            )
            .await,
            Ok(Ok(_))
        ));
        assert!(doc.is_quiescent());

        doc.close().await.unwrap();
        assert_eq!(doc.worker_state(), Some(WorkerState::Stopped));

        let events = setup.observer.events();
        assert!(matches!(events.first(), Some(SyncEvent::Opened { .. })));
        assert!(matches!(
            events.last(),
            Some(SyncEvent::Closed {
                worker_stopped: true,
                degraded: false,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_read_only_view() {
        let setup = Setup::memory();
        setup
            .remote
            .set(&doc_id("doc"), "x", &json!("published"))
            .await
            .unwrap();

        let mut view = ReadOnlyDocument::new(
            doc_id("doc"),
            ReplicaRank(0),
            setup.buffers.clone(),
            setup.remote.clone(),
        )
        .with_config(fast_config());
        view.open().await.unwrap();
        assert_eq!(view.get("x").await.unwrap(), Some(json!("published")));
        assert_eq!(view.keys().await.unwrap(), vec!["x"]);
        view.close().await.unwrap();
    }
}
