use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use docsync_core::{
    LockAcquireResult, LockManager, LockReleaseResult, LockRenewResult, StoreError,
};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, instrument, warn};

/// File-based advisory lock manager for processes sharing a host.
///
/// Lock files are stored at:
/// `{base_dir}/locks/{resource_id}.lock`
///
/// Each lock file contains JSON with holder_id and expiration. A new lock is
/// published with a hard link, so exactly one process can create it.
#[derive(Debug, Clone)]
pub struct FileLock {
    base_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockFile {
    holder_id: String,
    expires_at: i64,
}

fn expiry(ttl: Duration) -> i64 {
    chrono::Utc::now().timestamp_millis() + ttl.as_millis() as i64
}

impl FileLock {
    /// Lock files live under `{base_dir}/locks`.
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
        }
    }

    fn locks_dir(&self) -> PathBuf {
        self.base_dir.join("locks")
    }

    fn lock_path(&self, resource_id: &str) -> Result<PathBuf, StoreError> {
        if resource_id.is_empty() || resource_id.contains(['/', '\\']) || resource_id.contains("..")
        {
            return Err(StoreError::InvalidArgument(format!(
                "invalid lock resource {:?}",
                resource_id
            )));
        }
        Ok(self.locks_dir().join(format!("{}.lock", resource_id)))
    }

    async fn ensure_locks_dir(&self) -> Result<(), StoreError> {
        let dir = self.locks_dir();
        fs::create_dir_all(&dir).await.map_err(|e| {
            StoreError::Io(format!("Failed to create locks dir {}: {}", dir.display(), e))
        })?;
        Ok(())
    }

    /// Current live lock on `path`. Expired or unreadable lock files are reclaimed.
    async fn read_lock(&self, path: &Path) -> Option<LockFile> {
        let content = fs::read_to_string(path).await.ok()?;
        match serde_json::from_str::<LockFile>(&content) {
            Ok(lock) if lock.expires_at > chrono::Utc::now().timestamp_millis() => Some(lock),
            Ok(_) => {
                // Expired, reclaim it
                let _ = fs::remove_file(path).await;
                None
            }
            Err(e) => {
                warn!("Removing unreadable lock file {}: {}", path.display(), e);
                let _ = fs::remove_file(path).await;
                None
            }
        }
    }

    fn temp_path(path: &Path, holder_id: &str) -> PathBuf {
        path.with_extension(format!("{}.tmp", holder_id))
    }

    async fn write_temp(path: &Path, holder_id: &str, lock: &LockFile) -> Result<PathBuf, StoreError> {
        let temp_path = Self::temp_path(path, holder_id);
        let content = serde_json::to_string(lock)
            .map_err(|e| StoreError::Serialization(format!("Failed to serialize lock: {}", e)))?;
        fs::write(&temp_path, &content)
            .await
            .map_err(|e| StoreError::Io(format!("Failed to write lock file: {}", e)))?;
        Ok(temp_path)
    }

    /// Replace a lock we already hold.
    async fn overwrite_lock(&self, path: &Path, lock: &LockFile) -> Result<(), StoreError> {
        let temp_path = Self::write_temp(path, &lock.holder_id, lock).await?;
        fs::rename(&temp_path, path)
            .await
            .map_err(|e| StoreError::Io(format!("Failed to rename lock file: {}", e)))
    }

    /// Publish a new lock. Returns false if another holder created it first.
    async fn create_lock(&self, path: &Path, lock: &LockFile) -> Result<bool, StoreError> {
        self.ensure_locks_dir().await?;
        let temp_path = Self::write_temp(path, &lock.holder_id, lock).await?;
        let linked = fs::hard_link(&temp_path, path).await;
        let _ = fs::remove_file(&temp_path).await;
        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(StoreError::Io(format!("Failed to create lock file: {}", e))),
        }
    }
}

#[async_trait]
impl LockManager for FileLock {
    fn lock_type(&self) -> &'static str {
        "file"
    }

    #[instrument(skip(self), level = "debug")]
    async fn acquire(
        &self,
        resource_id: &str,
        holder_id: &str,
        ttl: Duration,
    ) -> Result<LockAcquireResult, StoreError> {
        let path = self.lock_path(resource_id)?;

        if let Some(existing) = self.read_lock(&path).await {
            if existing.holder_id == holder_id {
                // Re-acquiring extends our own lock
                let lock = LockFile {
                    holder_id: holder_id.to_string(),
                    expires_at: expiry(ttl),
                };
                self.overwrite_lock(&path, &lock).await?;
                debug!("Renewed existing lock on {} for {}", resource_id, holder_id);
                return Ok(LockAcquireResult {
                    acquired: true,
                    current_holder: None,
                    expires_at: lock.expires_at,
                });
            }

            debug!(
                "Lock on {} held by {} (requested by {})",
                resource_id, existing.holder_id, holder_id
            );
            return Ok(LockAcquireResult {
                acquired: false,
                current_holder: Some(existing.holder_id),
                expires_at: existing.expires_at,
            });
        }

        let lock = LockFile {
            holder_id: holder_id.to_string(),
            expires_at: expiry(ttl),
        };
        if !self.create_lock(&path, &lock).await? {
            // Lost the race against another holder
            let current = self.read_lock(&path).await;
            return Ok(LockAcquireResult {
                acquired: false,
                current_holder: current.as_ref().map(|l| l.holder_id.clone()),
                expires_at: current.map(|l| l.expires_at).unwrap_or(0),
            });
        }

        debug!(
            "Acquired lock on {} for {} (expires at {})",
            resource_id, holder_id, lock.expires_at
        );
        Ok(LockAcquireResult {
            acquired: true,
            current_holder: None,
            expires_at: lock.expires_at,
        })
    }

    #[instrument(skip(self), level = "debug")]
    async fn release(
        &self,
        resource_id: &str,
        holder_id: &str,
    ) -> Result<LockReleaseResult, StoreError> {
        let path = self.lock_path(resource_id)?;

        let Some(existing) = self.read_lock(&path).await else {
            debug!("Lock on {} not found for release by {}", resource_id, holder_id);
            return Ok(LockReleaseResult {
                released: false,
                reason: "not_found".to_string(),
            });
        };

        if existing.holder_id != holder_id {
            debug!(
                "Cannot release lock on {}: held by {} not {}",
                resource_id, existing.holder_id, holder_id
            );
            return Ok(LockReleaseResult {
                released: false,
                reason: "not_owner".to_string(),
            });
        }

        if let Err(e) = fs::remove_file(&path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(StoreError::Io(format!("Failed to delete lock: {}", e)));
            }
        }

        debug!("Released lock on {} by {}", resource_id, holder_id);
        Ok(LockReleaseResult {
            released: true,
            reason: "ok".to_string(),
        })
    }

    #[instrument(skip(self), level = "debug")]
    async fn renew(
        &self,
        resource_id: &str,
        holder_id: &str,
        ttl: Duration,
    ) -> Result<LockRenewResult, StoreError> {
        let path = self.lock_path(resource_id)?;

        let Some(existing) = self.read_lock(&path).await else {
            return Ok(LockRenewResult {
                renewed: false,
                expires_at: 0,
                reason: "not_found".to_string(),
            });
        };

        if existing.holder_id != holder_id {
            return Ok(LockRenewResult {
                renewed: false,
                expires_at: existing.expires_at,
                reason: "not_owner".to_string(),
            });
        }

        let lock = LockFile {
            holder_id: holder_id.to_string(),
            expires_at: expiry(ttl),
        };
        self.overwrite_lock(&path, &lock).await?;

        debug!(
            "Renewed lock on {} for {} (new expiry: {})",
            resource_id, holder_id, lock.expires_at
        );
        Ok(LockRenewResult {
            renewed: true,
            expires_at: lock.expires_at,
            reason: "ok".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn setup() -> (FileLock, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let lock = FileLock::new(temp_dir.path());
        (lock, temp_dir)
    }

    #[tokio::test]
    async fn test_acquire_release() {
        let (lock_mgr, _temp) = setup();
        let ttl = Duration::from_secs(60);

        let result = lock_mgr.acquire("doc-1", "holder-1", ttl).await.unwrap();
        assert!(result.acquired);
        assert!(result.current_holder.is_none());

        // Different holder is refused
        let result2 = lock_mgr.acquire("doc-1", "holder-2", ttl).await.unwrap();
        assert!(!result2.acquired);
        assert_eq!(result2.current_holder, Some("holder-1".to_string()));

        let release = lock_mgr.release("doc-1", "holder-1").await.unwrap();
        assert!(release.released);
        assert_eq!(release.reason, "ok");

        let result3 = lock_mgr.acquire("doc-1", "holder-2", ttl).await.unwrap();
        assert!(result3.acquired);
    }

    #[tokio::test]
    async fn test_renew() {
        let (lock_mgr, _temp) = setup();
        let ttl = Duration::from_secs(60);

        let acquire = lock_mgr.acquire("doc-1", "holder-1", ttl).await.unwrap();
        assert!(acquire.acquired);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let renew = lock_mgr.renew("doc-1", "holder-1", ttl).await.unwrap();
        assert!(renew.renewed);
        assert!(renew.expires_at >= acquire.expires_at);

        let bad_renew = lock_mgr.renew("doc-1", "wrong-holder", ttl).await.unwrap();
        assert!(!bad_renew.renewed);
        assert_eq!(bad_renew.reason, "not_owner");
    }

    #[tokio::test]
    async fn test_release_not_owner() {
        let (lock_mgr, _temp) = setup();
        let ttl = Duration::from_secs(60);

        lock_mgr.acquire("doc-1", "holder-1", ttl).await.unwrap();

        let release = lock_mgr.release("doc-1", "holder-2").await.unwrap();
        assert!(!release.released);
        assert_eq!(release.reason, "not_owner");

        let missing = lock_mgr.release("doc-2", "holder-1").await.unwrap();
        assert_eq!(missing.reason, "not_found");
    }

    #[tokio::test]
    async fn test_expired_lock() {
        let (lock_mgr, _temp) = setup();

        let result = lock_mgr
            .acquire("doc-1", "holder-1", Duration::from_millis(1))
            .await
            .unwrap();
        assert!(result.acquired);

        tokio::time::sleep(Duration::from_millis(50)).await;

        let result2 = lock_mgr
            .acquire("doc-1", "holder-2", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(result2.acquired);
    }

    #[tokio::test]
    async fn test_rejects_path_like_resources() {
        let (lock_mgr, _temp) = setup();
        let err = lock_mgr
            .acquire("../escape", "holder", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_exactly_one_concurrent_winner() {
        let (lock_mgr, _temp) = setup();
        let lock_mgr = Arc::new(lock_mgr);
        let ttl = Duration::from_secs(60);

        let mut handles = vec![];
        for i in 0..8 {
            let lock_mgr = Arc::clone(&lock_mgr);
            handles.push(tokio::spawn(async move {
                lock_mgr
                    .acquire("doc-1", &format!("holder-{}", i), ttl)
                    .await
                    .unwrap()
                    .acquired
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_scoped_guard_over_file_lock() {
        let (lock_mgr, _temp) = setup();
        let manager: Arc<dyn LockManager> = Arc::new(lock_mgr);

        let guard = docsync_core::acquire_scoped(
            manager.clone(),
            "doc-1",
            Duration::from_millis(100),
            Duration::from_secs(60),
        )
        .await
        .unwrap();

        let busy = docsync_core::acquire_scoped(
            manager.clone(),
            "doc-1",
            Duration::from_millis(50),
            Duration::from_secs(60),
        )
        .await;
        assert!(busy.is_err());

        guard.release().await.unwrap();
        let free = docsync_core::acquire_scoped(
            manager,
            "doc-1",
            Duration::from_millis(50),
            Duration::from_secs(60),
        )
        .await;
        assert!(free.is_ok());
    }
}
