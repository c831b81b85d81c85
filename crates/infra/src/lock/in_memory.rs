//! Process-local lock service with the same semantics as the Redis backend.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{DistributedLock, LockError, LockStatus};

#[derive(Debug, Clone)]
struct Holder {
    lock_id: String,
    expires_at: Instant,
}

/// In-memory lock service for tests/dev.
///
/// Expiry uses `tokio::time::Instant`, so paused-time tests can advance past a TTL.
#[derive(Debug, Default)]
pub struct InMemoryLockService {
    locks: Mutex<HashMap<String, Holder>>,
}

impl InMemoryLockService {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DistributedLock for InMemoryLockService {
    async fn try_acquire(
        &self,
        key: &str,
        lock_id: &str,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        let mut locks = self.locks.lock().await;
        let now = Instant::now();

        if let Some(holder) = locks.get(key) {
            if holder.expires_at > now {
                return Ok(false);
            }
        }

        locks.insert(
            key.to_string(),
            Holder {
                lock_id: lock_id.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn release(&self, key: &str, lock_id: &str) -> Result<bool, LockError> {
        let mut locks = self.locks.lock().await;
        let now = Instant::now();

        match locks.get(key) {
            Some(holder) if holder.lock_id == lock_id && holder.expires_at > now => {
                locks.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn status(&self, key: &str) -> Result<LockStatus, LockError> {
        let locks = self.locks.lock().await;
        let now = Instant::now();

        Ok(match locks.get(key) {
            Some(holder) if holder.expires_at > now => LockStatus {
                held: true,
                remaining_ttl: Some(holder.expires_at - now),
            },
            _ => LockStatus::free(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::{with_lock, LockOptions};

    #[tokio::test]
    async fn second_acquire_is_contended_until_release() {
        let locks = InMemoryLockService::new();
        let opts = LockOptions::with_ttl(Duration::from_secs(60));

        let first = locks.acquire("daily-report-scheduler", &opts).await.unwrap();
        assert!(first.acquired);

        let second = locks.acquire("daily-report-scheduler", &opts).await.unwrap();
        assert!(!second.acquired);
        assert!(second.lock_id.is_none());

        let released = locks
            .release("daily-report-scheduler", first.lock_id.as_deref().unwrap())
            .await
            .unwrap();
        assert!(released);

        let third = locks.acquire("daily-report-scheduler", &opts).await.unwrap();
        assert!(third.acquired);
    }

    #[tokio::test]
    async fn release_with_wrong_lock_id_keeps_the_lock() {
        let locks = InMemoryLockService::new();
        let opts = LockOptions::default();

        let held = locks.acquire("k", &opts).await.unwrap();
        assert!(held.acquired);

        assert!(!locks.release("k", "someone-else").await.unwrap());
        assert!(locks.status("k").await.unwrap().held);
    }

    #[tokio::test(start_paused = true)]
    async fn lock_expires_after_ttl() {
        let locks = InMemoryLockService::new();
        let opts = LockOptions::with_ttl(Duration::from_secs(30));

        let first = locks.acquire("k", &opts).await.unwrap();
        assert!(first.acquired);

        tokio::time::advance(Duration::from_secs(10)).await;
        let status = locks.status("k").await.unwrap();
        assert!(status.held);
        assert_eq!(status.remaining_ttl, Some(Duration::from_secs(20)));

        tokio::time::advance(Duration::from_secs(21)).await;
        assert!(!locks.status("k").await.unwrap().held);

        // Stale holder cannot release the new owner's lock.
        let second = locks.acquire("k", &opts).await.unwrap();
        assert!(second.acquired);
        assert!(!locks.release("k", first.lock_id.as_deref().unwrap()).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn retries_wait_for_release_by_expiry() {
        let locks = InMemoryLockService::new();

        let first = locks
            .acquire("k", &LockOptions::with_ttl(Duration::from_millis(250)))
            .await
            .unwrap();
        assert!(first.acquired);

        let opts = LockOptions::with_ttl(Duration::from_secs(5))
            .retries(5, Duration::from_millis(100));
        let second = locks.acquire("k", &opts).await.unwrap();
        assert!(second.acquired);
    }

    #[tokio::test]
    async fn with_lock_skips_when_contended_and_releases_after() {
        let locks = InMemoryLockService::new();
        let opts = LockOptions::default();

        let ran = with_lock(&locks, "k", &opts, || async { 42 }).await.unwrap();
        assert_eq!(ran, Some(42));
        assert!(!locks.status("k").await.unwrap().held);

        let holder = locks.acquire("k", &opts).await.unwrap();
        assert!(holder.acquired);
        let skipped = with_lock(&locks, "k", &opts, || async { 1 }).await.unwrap();
        assert_eq!(skipped, None);
    }
}
