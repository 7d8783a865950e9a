use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::StoreError;

/// Result of a lock acquisition attempt.
#[derive(Debug, Clone)]
pub struct LockAcquireResult {
    /// Whether the lock was acquired.
    pub acquired: bool,
    /// Holder of the lock when it was not acquired.
    pub current_holder: Option<String>,
    /// Unix timestamp (milliseconds) at which the lock expires.
    pub expires_at: i64,
}

/// Result of a lock release attempt.
#[derive(Debug, Clone)]
pub struct LockReleaseResult {
    pub released: bool,
    /// "ok", "not_owner" or "not_found".
    pub reason: String,
}

/// Result of a lock renewal attempt.
#[derive(Debug, Clone)]
pub struct LockRenewResult {
    pub renewed: bool,
    pub expires_at: i64,
    pub reason: String,
}

/// Advisory lock manager used to serialize multi-process access to the same
/// logical document.
///
/// Locks carry a TTL so a crashed holder cannot block others forever.
#[async_trait]
pub trait LockManager: Send + Sync {
    /// Returns the lock backend identifier (e.g., "file").
    fn lock_type(&self) -> &'static str;

    /// Attempt to acquire a lock on `resource_id` without waiting.
    ///
    /// Re-acquiring a lock already held by `holder_id` renews it.
    async fn acquire(
        &self,
        resource_id: &str,
        holder_id: &str,
        ttl: Duration,
    ) -> Result<LockAcquireResult, StoreError>;

    /// Release a lock. Only the current holder can release it.
    async fn release(
        &self,
        resource_id: &str,
        holder_id: &str,
    ) -> Result<LockReleaseResult, StoreError>;

    /// Extend the TTL of a held lock.
    async fn renew(
        &self,
        resource_id: &str,
        holder_id: &str,
        ttl: Duration,
    ) -> Result<LockRenewResult, StoreError>;
}

/// A held advisory lock. Release it explicitly with [`LockGuard::release`];
/// a guard dropped while still held schedules its release on the current
/// tokio runtime.
pub struct LockGuard {
    manager: Arc<dyn LockManager>,
    resource_id: String,
    holder_id: String,
    released: bool,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("resource_id", &self.resource_id)
            .field("holder_id", &self.holder_id)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl LockGuard {
    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// Release the lock now.
    pub async fn release(mut self) -> Result<(), StoreError> {
        self.released = true;
        let result = self
            .manager
            .release(&self.resource_id, &self.holder_id)
            .await?;
        if !result.released {
            warn!(
                "Lock on {} was not released by {}: {}",
                self.resource_id, self.holder_id, result.reason
            );
        }
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(
                "Lock on {} dropped outside a runtime; it will expire on its own",
                self.resource_id
            );
            return;
        };
        let manager = Arc::clone(&self.manager);
        let resource_id = std::mem::take(&mut self.resource_id);
        let holder_id = std::mem::take(&mut self.holder_id);
        handle.spawn(async move {
            if let Err(e) = manager.release(&resource_id, &holder_id).await {
                warn!("Failed to release lock on {}: {}", resource_id, e);
            }
        });
    }
}

/// Acquire `resource_id`, retrying until `timeout` elapses.
///
/// The returned guard holds the lock for `ttl` (renewable through the
/// manager). Fails with [`StoreError::Lock`] if the lock stays held by
/// someone else for the whole wait.
pub async fn acquire_scoped(
    manager: Arc<dyn LockManager>,
    resource_id: &str,
    timeout: Duration,
    ttl: Duration,
) -> Result<LockGuard, StoreError> {
    let holder_id = uuid::Uuid::new_v4().to_string();
    let deadline = Instant::now() + timeout;
    let mut attempt: u64 = 0;

    loop {
        let result = manager.acquire(resource_id, &holder_id, ttl).await?;
        if result.acquired {
            debug!(
                "Acquired {} lock on {} after {} attempts",
                manager.lock_type(),
                resource_id,
                attempt + 1
            );
            return Ok(LockGuard {
                manager,
                resource_id: resource_id.to_string(),
                holder_id,
                released: false,
            });
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(StoreError::Lock(format!(
                "Timed out after {:?} waiting for lock on {} (held by {})",
                timeout,
                resource_id,
                result.current_holder.as_deref().unwrap_or("unknown")
            )));
        }

        attempt += 1;
        let delay = Duration::from_millis(10 + attempt.min(20) * 10);
        tokio::time::sleep(delay.min(deadline - now)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Lock manager keeping holders in memory, without expiry.
    #[derive(Default)]
    struct InProcessLock {
        holders: Mutex<HashMap<String, String>>,
    }

    #[async_trait]
    impl LockManager for InProcessLock {
        fn lock_type(&self) -> &'static str {
            "in-process"
        }

        async fn acquire(
            &self,
            resource_id: &str,
            holder_id: &str,
            _ttl: Duration,
        ) -> Result<LockAcquireResult, StoreError> {
            let mut holders = self.holders.lock().unwrap();
            let other = holders
                .get(resource_id)
                .filter(|holder| holder.as_str() != holder_id)
                .cloned();
            if let Some(holder) = other {
                return Ok(LockAcquireResult {
                    acquired: false,
                    current_holder: Some(holder),
                    expires_at: 0,
                });
            }
            holders.insert(resource_id.to_string(), holder_id.to_string());
            Ok(LockAcquireResult {
                acquired: true,
                current_holder: None,
                expires_at: 0,
            })
        }

        async fn release(
            &self,
            resource_id: &str,
            holder_id: &str,
        ) -> Result<LockReleaseResult, StoreError> {
            let mut holders = self.holders.lock().unwrap();
            if holders.get(resource_id).map(String::as_str) == Some(holder_id) {
                holders.remove(resource_id);
                return Ok(LockReleaseResult {
                    released: true,
                    reason: "ok".to_string(),
                });
            }
            Ok(LockReleaseResult {
                released: false,
                reason: "not_owner".to_string(),
            })
        }

        async fn renew(
            &self,
            _resource_id: &str,
            _holder_id: &str,
            _ttl: Duration,
        ) -> Result<LockRenewResult, StoreError> {
            unimplemented!()
        }
    }

    #[tokio::test]
    async fn test_scoped_acquire_and_release() {
        let manager: Arc<dyn LockManager> = Arc::new(InProcessLock::default());
        let ttl = Duration::from_secs(60);

        let guard = acquire_scoped(manager.clone(), "doc", Duration::from_millis(100), ttl)
            .await
            .unwrap();
        assert_eq!(guard.resource_id(), "doc");

        // A second holder times out while the first holds the lock
        let err = acquire_scoped(manager.clone(), "doc", Duration::from_millis(50), ttl)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Lock(_)));

        guard.release().await.unwrap();
        let again = acquire_scoped(manager, "doc", Duration::from_millis(50), ttl).await;
        assert!(again.is_ok());
    }

    #[tokio::test]
    async fn test_waiter_acquires_after_release() {
        let manager: Arc<dyn LockManager> = Arc::new(InProcessLock::default());
        let ttl = Duration::from_secs(60);

        let guard = acquire_scoped(manager.clone(), "doc", Duration::from_millis(100), ttl)
            .await
            .unwrap();

        let waiter = tokio::spawn({
            let manager = manager.clone();
            async move { acquire_scoped(manager, "doc", Duration::from_secs(5), ttl).await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        guard.release().await.unwrap();

        let second = waiter.await.unwrap().unwrap();
        second.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_guard_releases() {
        let manager: Arc<dyn LockManager> = Arc::new(InProcessLock::default());
        let ttl = Duration::from_secs(60);

        {
            let _guard = acquire_scoped(manager.clone(), "doc", Duration::from_millis(100), ttl)
                .await
                .unwrap();
        }

        let guard = acquire_scoped(manager, "doc", Duration::from_secs(2), ttl).await;
        assert!(guard.is_ok());
    }
}
