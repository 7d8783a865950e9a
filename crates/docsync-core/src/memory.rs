//! In-memory backends.
//!
//! Useful as embedded stand-ins and in tests: the buffer provider keeps each
//! buffer's contents across close/reopen, and the remote store can be made to
//! fail on demand to simulate an unreachable network store.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, instrument};

use crate::buffer::{BufferProvider, LocalBuffer};
use crate::document::{DocumentId, ReplicaRank, Value};
use crate::error::StoreError;
use crate::remote::RemoteStore;

type Entries = Arc<Mutex<BTreeMap<String, Value>>>;

fn lock_entries(entries: &Entries) -> Result<MutexGuard<'_, BTreeMap<String, Value>>, StoreError> {
    entries
        .lock()
        .map_err(|_| StoreError::Internal("memory buffer lock poisoned".to_string()))
}

/// An open handle on an in-memory buffer.
#[derive(Debug)]
pub struct MemoryBuffer {
    name: String,
    entries: Entries,
    closed: AtomicBool,
}

impl MemoryBuffer {
    fn entries(&self) -> Result<MutexGuard<'_, BTreeMap<String, Value>>, StoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed(format!("buffer {} is closed", self.name)));
        }
        lock_entries(&self.entries)
    }
}

impl LocalBuffer for MemoryBuffer {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.entries()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &Value) -> Result<(), StoreError> {
        self.entries()?.insert(key.to_string(), value.clone());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.entries()?.remove(key).is_some())
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.entries()?.keys().cloned().collect())
    }

    fn len(&self) -> Result<usize, StoreError> {
        Ok(self.entries()?.len())
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.entries()?.clear();
        Ok(())
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.entries().map(|_| ())
    }

    fn close(&self) -> Result<(), StoreError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// Provider of in-memory buffers keyed by `(DocumentId, ReplicaRank)`.
#[derive(Debug, Default)]
pub struct MemoryBufferProvider {
    buffers: DashMap<(DocumentId, ReplicaRank), Entries>,
}

impl MemoryBufferProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BufferProvider for MemoryBufferProvider {
    fn provider_name(&self) -> &'static str {
        "memory"
    }

    fn open(
        &self,
        id: &DocumentId,
        rank: ReplicaRank,
    ) -> Result<Arc<dyn LocalBuffer>, StoreError> {
        let entries = Arc::clone(&self.buffers.entry((id.clone(), rank)).or_default());
        Ok(Arc::new(MemoryBuffer {
            name: self.location(id, rank),
            entries,
            closed: AtomicBool::new(false),
        }))
    }

    fn exists(&self, id: &DocumentId, rank: ReplicaRank) -> bool {
        self.buffers.contains_key(&(id.clone(), rank))
    }

    fn destroy(&self, id: &DocumentId, rank: ReplicaRank) -> Result<bool, StoreError> {
        Ok(self.buffers.remove(&(id.clone(), rank)).is_some())
    }

    fn location(&self, id: &DocumentId, rank: ReplicaRank) -> String {
        format!("memory://{}.{}", id, rank)
    }
}

/// Failure mode injected into a [`MemoryRemoteStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Operate normally.
    None,
    /// Every call fails with [`StoreError::Connectivity`].
    Offline,
    /// Every call fails with [`StoreError::Internal`].
    Unexpected,
}

impl Fault {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Fault::Offline,
            2 => Fault::Unexpected,
            _ => Fault::None,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Fault::None => 0,
            Fault::Offline => 1,
            Fault::Unexpected => 2,
        }
    }
}

/// In-memory remote store shared by every document view that holds it.
#[derive(Debug, Default)]
pub struct MemoryRemoteStore {
    documents: DashMap<DocumentId, BTreeMap<String, Value>>,
    /// (document, set name) -> tags
    tag_sets: DashMap<(DocumentId, String), BTreeSet<String>>,
    fault: AtomicU8,
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent calls fail (or succeed again with [`Fault::None`]).
    pub fn set_fault(&self, fault: Fault) {
        self.fault.store(fault.as_u8(), Ordering::Release);
    }

    pub fn fault(&self) -> Fault {
        Fault::from_u8(self.fault.load(Ordering::Acquire))
    }

    /// Snapshot of a document's values, bypassing fault injection.
    pub fn snapshot(&self, doc: &DocumentId) -> BTreeMap<String, Value> {
        self.documents
            .get(doc)
            .map(|entries| entries.value().clone())
            .unwrap_or_default()
    }

    fn check(&self, op: &str) -> Result<(), StoreError> {
        match self.fault() {
            Fault::None => Ok(()),
            Fault::Offline => Err(StoreError::Connectivity(format!(
                "memory remote store is offline ({})",
                op
            ))),
            Fault::Unexpected => Err(StoreError::Internal(format!(
                "memory remote store failed ({})",
                op
            ))),
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    #[instrument(skip(self), level = "debug")]
    async fn get(&self, doc: &DocumentId, key: &str) -> Result<Option<Value>, StoreError> {
        self.check("get")?;
        Ok(self
            .documents
            .get(doc)
            .and_then(|entries| entries.get(key).cloned()))
    }

    #[instrument(skip(self, value), level = "debug")]
    async fn set(&self, doc: &DocumentId, key: &str, value: &Value) -> Result<(), StoreError> {
        self.check("set")?;
        self.documents
            .entry(doc.clone())
            .or_default()
            .insert(key.to_string(), value.clone());
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete(&self, doc: &DocumentId, key: &str) -> Result<bool, StoreError> {
        self.check("delete")?;
        Ok(self
            .documents
            .get_mut(doc)
            .is_some_and(|mut entries| entries.remove(key).is_some()))
    }

    async fn keys(&self, doc: &DocumentId) -> Result<Vec<String>, StoreError> {
        self.check("keys")?;
        Ok(self
            .documents
            .get(doc)
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default())
    }

    #[instrument(skip(self), level = "debug")]
    async fn clear(&self, doc: &DocumentId) -> Result<(), StoreError> {
        self.check("clear")?;
        if let Some(mut entries) = self.documents.get_mut(doc) {
            entries.clear();
        }
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn remove_document(&self, doc: &DocumentId) -> Result<bool, StoreError> {
        self.check("remove_document")?;
        let existed = self.documents.remove(doc).is_some();
        self.tag_sets.retain(|(owner, _), _| owner != doc);
        debug!("Removed document {} (existed: {})", doc, existed);
        Ok(existed)
    }

    async fn add_tag(&self, doc: &DocumentId, set: &str, tag: &str) -> Result<(), StoreError> {
        self.check("add_tag")?;
        self.tag_sets
            .entry((doc.clone(), set.to_string()))
            .or_default()
            .insert(tag.to_string());
        Ok(())
    }

    async fn remove_tag(
        &self,
        doc: &DocumentId,
        set: &str,
        tag: &str,
    ) -> Result<(), StoreError> {
        self.check("remove_tag")?;
        if let Some(mut tags) = self.tag_sets.get_mut(&(doc.clone(), set.to_string())) {
            tags.remove(tag);
        }
        Ok(())
    }

    async fn has_tag(&self, doc: &DocumentId, set: &str, tag: &str) -> Result<bool, StoreError> {
        self.check("has_tag")?;
        Ok(self
            .tag_sets
            .get(&(doc.clone(), set.to_string()))
            .is_some_and(|tags| tags.contains(tag)))
    }

    async fn tags(&self, doc: &DocumentId, set: &str) -> Result<Vec<String>, StoreError> {
        self.check("tags")?;
        Ok(self
            .tag_sets
            .get(&(doc.clone(), set.to_string()))
            .map(|tags| tags.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn clear_tags(&self, doc: &DocumentId, set: &str) -> Result<(), StoreError> {
        self.check("clear_tags")?;
        self.tag_sets.remove(&(doc.clone(), set.to_string()));
        Ok(())
    }
}
