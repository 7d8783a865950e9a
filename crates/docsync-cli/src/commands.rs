use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use docsync_core::{
    acquire_scoped, BufferProvider, DocumentId, LockGuard, LockManager, RemoteStore, ReplicaRank,
    Value,
};
use docsync_engine::{Document, Milestones, SyncError};
use docsync_local::{FileLock, RedbBufferProvider};
use docsync_remote::HttpRemoteStore;
use serde_json::json;
use tracing::warn;

use crate::config::{Command, Config, MilestoneCommand};

/// Lifetime of a document lock; a crashed client frees it after this.
const LOCK_TTL: Duration = Duration::from_secs(300);

/// Run the configured command and return its JSON result.
pub async fn run(config: &Config) -> Result<Value> {
    match &config.command {
        Command::Id { params } => {
            let params: Value =
                serde_json::from_str(params).context("parameters must be valid JSON")?;
            Ok(json!({ "id": DocumentId::from_params(&params) }))
        }
        Command::Get { doc, key } => in_document(config, doc, Operation::Get(key)).await,
        Command::Set { doc, key, value } => {
            let value: Value = serde_json::from_str(value)
                .with_context(|| format!("value for {:?} must be valid JSON", key))?;
            in_document(config, doc, Operation::Set(key, value)).await
        }
        Command::Del { doc, key } => in_document(config, doc, Operation::Del(key)).await,
        Command::Keys { doc } => in_document(config, doc, Operation::Keys).await,
        Command::Clear { doc } => in_document(config, doc, Operation::Clear).await,
        Command::Remove { doc } => remove(config, doc).await,
        Command::Milestone(command) => milestone(config, command).await,
    }
}

/// A single operation run against an open document.
enum Operation<'a> {
    Get(&'a str),
    Set(&'a str, Value),
    Del(&'a str),
    Keys,
    Clear,
}

impl Operation<'_> {
    async fn apply(self, document: &Document) -> Result<Value, SyncError> {
        match self {
            Operation::Get(key) => Ok(json!({ "key": key, "value": document.get(key).await? })),
            Operation::Set(key, value) => {
                document.set(key, value)?;
                Ok(json!({ "key": key, "stored": true }))
            }
            Operation::Del(key) => Ok(json!({ "key": key, "deleted": document.delete(key)? })),
            Operation::Keys => Ok(json!({ "keys": document.keys().await? })),
            Operation::Clear => Ok(json!({ "cleared": document.clear()? })),
        }
    }
}

fn remote_store(config: &Config) -> Result<Arc<dyn RemoteStore>> {
    let remote = HttpRemoteStore::new(
        &config.remote_url,
        config.api_token.clone(),
        config.request_timeout(),
    )?;
    Ok(Arc::new(remote))
}

fn document(config: &Config, id: DocumentId) -> Result<Document> {
    let buffers: Arc<dyn BufferProvider> =
        Arc::new(RedbBufferProvider::new(config.effective_buffer_dir()));
    Ok(
        Document::new(id, ReplicaRank(config.rank), buffers, remote_store(config)?)
            .with_config(config.sync_config()),
    )
}

/// Serialize with other processes working on the same document.
async fn lock_document(config: &Config, id: &DocumentId) -> Result<LockGuard> {
    let locks: Arc<dyn LockManager> = Arc::new(FileLock::new(config.effective_buffer_dir()));
    acquire_scoped(locks, id.as_str(), config.lock_timeout(), LOCK_TTL)
        .await
        .with_context(|| format!("document {} is busy", id))
}

async fn release(lock: LockGuard) {
    let resource = lock.resource_id().to_string();
    if let Err(e) = lock.release().await {
        warn!("Failed to release lock on {}: {}", resource, e);
    }
}

async fn in_document(config: &Config, doc: &str, operation: Operation<'_>) -> Result<Value> {
    let id = DocumentId::new(doc)?;
    let mut document = document(config, id.clone())?;
    let lock = lock_document(config, &id).await?;

    let result = session(&mut document, operation).await;
    release(lock).await;
    result
}

async fn session(document: &mut Document, operation: Operation<'_>) -> Result<Value> {
    document.open().await?;
    let result = operation.apply(document).await;
    let report = document.close().await?;
    if !report.is_clean() {
        warn!(
            "{} closed before every change reached the remote store \
             (worker stopped: {}, degraded: {}); changes stay buffered at {}",
            document.id(),
            report.worker_stopped,
            report.degraded,
            document.location()
        );
    }

    let mut output = result?;
    if let Some(fields) = output.as_object_mut() {
        fields.insert("synced".to_string(), json!(report.is_clean()));
    }
    Ok(output)
}

async fn remove(config: &Config, doc: &str) -> Result<Value> {
    let id = DocumentId::new(doc)?;
    let document = document(config, id.clone())?;
    let lock = lock_document(config, &id).await?;

    let result = document.remove().await;
    release(lock).await;
    result?;
    Ok(json!({ "removed": id }))
}

async fn milestone(config: &Config, command: &MilestoneCommand) -> Result<Value> {
    let milestones = |doc: &str| -> Result<Milestones> {
        Ok(Milestones::new(remote_store(config)?, DocumentId::new(doc)?))
    };

    match command {
        MilestoneCommand::Mark { doc, name } => {
            milestones(doc)?.mark(name).await?;
            Ok(json!({ "milestone": name, "reached": true }))
        }
        MilestoneCommand::Remove { doc, name } => {
            milestones(doc)?.remove(name).await?;
            Ok(json!({ "milestone": name, "reached": false }))
        }
        MilestoneCommand::Reached { doc, name } => {
            let reached = milestones(doc)?.reached(name).await?;
            Ok(json!({ "milestone": name, "reached": reached }))
        }
        MilestoneCommand::List { doc } => {
            Ok(json!({ "milestones": milestones(doc)?.all().await? }))
        }
        MilestoneCommand::Clear { doc } => {
            milestones(doc)?.clear().await?;
            Ok(json!({ "cleared": true }))
        }
    }
}
