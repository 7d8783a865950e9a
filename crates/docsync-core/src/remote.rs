use async_trait::async_trait;

use crate::document::{DocumentId, Value};
use crate::error::StoreError;

/// Remote store abstraction: a shared, networked key-value store addressed
/// by document id.
///
/// Implementations must report an unreachable store as
/// [`StoreError::Connectivity`] so callers can tell it apart from other
/// failures.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Returns the backend identifier (e.g., "http", "memory").
    fn backend_name(&self) -> &'static str;

    // =========================================================================
    // Document values
    // =========================================================================

    /// Read a value, `None` if the document or key is absent.
    async fn get(&self, doc: &DocumentId, key: &str) -> Result<Option<Value>, StoreError>;

    /// Insert or replace a value.
    async fn set(&self, doc: &DocumentId, key: &str, value: &Value) -> Result<(), StoreError>;

    /// Delete a key. Returns whether it was present.
    async fn delete(&self, doc: &DocumentId, key: &str) -> Result<bool, StoreError>;

    /// All keys of a document.
    async fn keys(&self, doc: &DocumentId) -> Result<Vec<String>, StoreError>;

    /// Remove every value of a document, keeping its tag sets.
    async fn clear(&self, doc: &DocumentId) -> Result<(), StoreError>;

    /// Remove the document entirely. Returns whether it existed.
    async fn remove_document(&self, doc: &DocumentId) -> Result<bool, StoreError>;

    // =========================================================================
    // Tag sets
    // =========================================================================

    /// Atomically add a tag to a named set. Adding an existing tag is a no-op.
    async fn add_tag(&self, doc: &DocumentId, set: &str, tag: &str) -> Result<(), StoreError>;

    /// Remove a tag from a named set.
    async fn remove_tag(&self, doc: &DocumentId, set: &str, tag: &str)
        -> Result<(), StoreError>;

    async fn has_tag(&self, doc: &DocumentId, set: &str, tag: &str) -> Result<bool, StoreError>;

    /// Members of a named set, empty if the set does not exist.
    async fn tags(&self, doc: &DocumentId, set: &str) -> Result<Vec<String>, StoreError>;

    /// Remove a named set.
    async fn clear_tags(&self, doc: &DocumentId, set: &str) -> Result<(), StoreError>;
}
