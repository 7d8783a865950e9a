use std::sync::Arc;

use crate::document::{DocumentId, ReplicaRank, Value};
use crate::error::StoreError;

/// Local buffer abstraction: an embedded, ordered key-value store holding the
/// authoritative copy of one document instance for reads.
///
/// Operations are synchronous; implementations are expected to be backed by
/// an embedded engine that never touches the network. After [`close`] every
/// operation fails with [`StoreError::Closed`].
///
/// [`close`]: LocalBuffer::close
pub trait LocalBuffer: Send + Sync {
    /// Read a value, `None` if the key is absent.
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    /// Insert or replace a value.
    fn set(&self, key: &str, value: &Value) -> Result<(), StoreError>;

    /// Delete a key. Returns whether it was present.
    fn delete(&self, key: &str) -> Result<bool, StoreError>;

    fn contains(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.get(key)?.is_some())
    }

    /// All keys in ascending order.
    fn keys(&self) -> Result<Vec<String>, StoreError>;

    fn len(&self) -> Result<usize, StoreError> {
        Ok(self.keys()?.len())
    }

    fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    /// Remove every key.
    fn clear(&self) -> Result<(), StoreError>;

    /// Make every write so far durable.
    fn flush(&self) -> Result<(), StoreError>;

    /// Release the underlying handle. Idempotent.
    fn close(&self) -> Result<(), StoreError>;
}

/// Opens and destroys local buffers, one per `(DocumentId, ReplicaRank)`.
pub trait BufferProvider: Send + Sync {
    /// Returns the provider identifier (e.g., "redb", "memory").
    fn provider_name(&self) -> &'static str;

    /// Open the buffer for a document instance, creating it if absent.
    fn open(
        &self,
        id: &DocumentId,
        rank: ReplicaRank,
    ) -> Result<Arc<dyn LocalBuffer>, StoreError>;

    /// Whether a buffer exists for the document instance.
    fn exists(&self, id: &DocumentId, rank: ReplicaRank) -> bool;

    /// Delete the buffer. Returns false if there was nothing to delete.
    fn destroy(&self, id: &DocumentId, rank: ReplicaRank) -> Result<bool, StoreError>;

    /// Human-readable location of the buffer (a file path for file backends).
    fn location(&self, id: &DocumentId, rank: ReplicaRank) -> String;
}
