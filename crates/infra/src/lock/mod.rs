//! Named, TTL-bound advisory locks shared across processes.
//!
//! ## Semantics
//!
//! - At most one holder per key; the holder is identified by an opaque lock id.
//! - Failing to acquire is **not** an error: `LockAcquisition { acquired: false }`
//!   means someone else is working and the caller should skip its run.
//! - Release is compare-and-delete: only the matching lock id releases.
//! - Expiry is the only automatic release, so a crashed holder frees the key
//!   after its TTL.
//!
//! Locks are advisory. A caller that never consults the lock service can still
//! mutate report rows; every scheduling path goes through here.

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};
use uuid::Uuid;

pub use in_memory::InMemoryLockService;
#[cfg(feature = "redis")]
pub use self::redis::RedisLockService;

/// Options for a lock acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockOptions {
    pub ttl: Duration,
    /// Additional attempts after the first one fails.
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60),
            max_retries: 0,
            retry_delay: Duration::from_millis(100),
        }
    }
}

impl LockOptions {
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            ..Default::default()
        }
    }

    pub fn retries(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = retry_delay;
        self
    }
}

/// Result of an acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockAcquisition {
    pub acquired: bool,
    /// Present only when `acquired`; required to release.
    pub lock_id: Option<String>,
}

impl LockAcquisition {
    pub fn held(lock_id: String) -> Self {
        Self {
            acquired: true,
            lock_id: Some(lock_id),
        }
    }

    pub fn contended() -> Self {
        Self {
            acquired: false,
            lock_id: None,
        }
    }
}

/// Observed state of a lock key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockStatus {
    pub held: bool,
    /// `None` when not held, or held without expiry.
    pub remaining_ttl: Option<Duration>,
}

impl LockStatus {
    pub fn free() -> Self {
        Self {
            held: false,
            remaining_ttl: None,
        }
    }
}

/// Lock backend error (connection, protocol). Contention is not an error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LockError {
    #[error("lock backend connection error: {0}")]
    Connection(String),
    #[error("lock backend command error: {0}")]
    Command(String),
}

/// Distributed lock service.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// One atomic set-if-absent attempt.
    async fn try_acquire(&self, key: &str, lock_id: &str, ttl: Duration)
        -> Result<bool, LockError>;

    /// Release `key` if and only if it is held with `lock_id`.
    async fn release(&self, key: &str, lock_id: &str) -> Result<bool, LockError>;

    async fn status(&self, key: &str) -> Result<LockStatus, LockError>;

    /// Acquire with bounded retries.
    async fn acquire(&self, key: &str, options: &LockOptions) -> Result<LockAcquisition, LockError> {
        let lock_id = new_lock_id();

        for attempt in 0..=options.max_retries {
            if self.try_acquire(key, &lock_id, options.ttl).await? {
                debug!(lock_key = key, attempt, ttl_ms = options.ttl.as_millis() as u64, "lock acquired");
                return Ok(LockAcquisition::held(lock_id));
            }
            if attempt < options.max_retries {
                tokio::time::sleep(options.retry_delay).await;
            }
        }

        debug!(lock_key = key, attempts = options.max_retries + 1, "lock is held elsewhere");
        Ok(LockAcquisition::contended())
    }
}

fn new_lock_id() -> String {
    format!("{}:{}", std::process::id(), Uuid::now_v7())
}

/// Run `f` while holding `key`; returns `None` without running it when the
/// lock is held elsewhere.
///
/// The lock is released after `f` completes, whatever it returns.
pub async fn with_lock<L, F, Fut, T>(
    lock: &L,
    key: &str,
    options: &LockOptions,
    f: F,
) -> Result<Option<T>, LockError>
where
    L: DistributedLock + ?Sized,
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    let acquisition = lock.acquire(key, options).await?;
    let Some(lock_id) = acquisition.lock_id.filter(|_| acquisition.acquired) else {
        return Ok(None);
    };

    let output = f().await;

    match lock.release(key, &lock_id).await {
        Ok(true) => {}
        Ok(false) => warn!(lock_key = key, "lock expired before release"),
        Err(error) => warn!(lock_key = key, %error, "failed to release lock; it will expire"),
    }

    Ok(Some(output))
}
