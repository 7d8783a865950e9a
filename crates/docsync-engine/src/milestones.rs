use std::sync::Arc;

use docsync_core::{DocumentId, RemoteStore, StoreError};
use tracing::{debug, instrument};

/// Name of the remote tag set holding a document's milestones.
pub const MILESTONE_SET: &str = "_milestones";

/// Named progress markers of a document, kept directly in the remote store.
///
/// There is no buffering here: every call goes to the remote store and any
/// failure, connectivity included, is returned to the caller.
#[derive(Clone)]
pub struct Milestones {
    remote: Arc<dyn RemoteStore>,
    doc: DocumentId,
}

impl std::fmt::Debug for Milestones {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Milestones")
            .field("doc", &self.doc)
            .field("remote", &self.remote.backend_name())
            .finish()
    }
}

impl Milestones {
    pub fn new(remote: Arc<dyn RemoteStore>, doc: DocumentId) -> Self {
        Self { remote, doc }
    }

    pub fn document(&self) -> &DocumentId {
        &self.doc
    }

    /// Record `name` as reached. Marking twice is a no-op.
    #[instrument(skip(self), fields(doc = %self.doc), level = "debug")]
    pub async fn mark(&self, name: &str) -> Result<(), StoreError> {
        validate(name)?;
        self.remote.add_tag(&self.doc, MILESTONE_SET, name).await?;
        debug!("Milestone {} reached", name);
        Ok(())
    }

    #[instrument(skip(self), fields(doc = %self.doc), level = "debug")]
    pub async fn remove(&self, name: &str) -> Result<(), StoreError> {
        validate(name)?;
        self.remote.remove_tag(&self.doc, MILESTONE_SET, name).await
    }

    pub async fn reached(&self, name: &str) -> Result<bool, StoreError> {
        validate(name)?;
        self.remote.has_tag(&self.doc, MILESTONE_SET, name).await
    }

    /// Every reached milestone, sorted.
    pub async fn all(&self) -> Result<Vec<String>, StoreError> {
        let mut names = self.remote.tags(&self.doc, MILESTONE_SET).await?;
        names.sort();
        Ok(names)
    }

    /// Forget every milestone of the document.
    #[instrument(skip(self), fields(doc = %self.doc), level = "debug")]
    pub async fn clear(&self) -> Result<(), StoreError> {
        self.remote.clear_tags(&self.doc, MILESTONE_SET).await
    }
}

fn validate(name: &str) -> Result<(), StoreError> {
    if name.is_empty() {
        return Err(StoreError::InvalidArgument(
            "milestone name must not be empty".to_string(),
        ));
    }
    Ok(())
}
