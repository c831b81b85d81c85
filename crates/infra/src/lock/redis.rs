//! Redis-backed lock service (`SET NX PX` + compare-and-delete script).

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tracing::instrument;

use super::{DistributedLock, LockError, LockStatus};

/// Default key prefix for lock keys.
const DEFAULT_KEY_PREFIX: &str = "reportflow:lock:";

/// Deletes the key only when it still holds the caller's lock id.
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

#[derive(Clone)]
pub struct RedisLockService {
    conn: ConnectionManager,
    key_prefix: String,
    release: redis::Script,
}

impl std::fmt::Debug for RedisLockService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisLockService")
            .field("key_prefix", &self.key_prefix)
            .finish_non_exhaustive()
    }
}

impl RedisLockService {
    /// Connect to Redis (e.g. `redis://localhost:6379`).
    pub async fn connect(redis_url: impl AsRef<str>) -> Result<Self, LockError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| LockError::Connection(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| LockError::Connection(e.to_string()))?;
        Ok(Self::new(conn))
    }

    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            release: redis::Script::new(RELEASE_SCRIPT),
        }
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }
}

#[async_trait]
impl DistributedLock for RedisLockService {
    #[instrument(skip(self, lock_id), fields(lock_key = key), err)]
    async fn try_acquire(
        &self,
        key: &str,
        lock_id: &str,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        let mut conn = self.conn.clone();
        // PX 0 is rejected by Redis.
        let ttl_ms = ttl.as_millis().max(1) as u64;

        let reply: Option<String> = redis::cmd("SET")
            .arg(self.key(key))
            .arg(lock_id)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await
            .map_err(|e| LockError::Command(e.to_string()))?;

        Ok(reply.is_some())
    }

    #[instrument(skip(self, lock_id), fields(lock_key = key), err)]
    async fn release(&self, key: &str, lock_id: &str) -> Result<bool, LockError> {
        let mut conn = self.conn.clone();

        let deleted: i64 = self
            .release
            .key(self.key(key))
            .arg(lock_id)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| LockError::Command(e.to_string()))?;

        Ok(deleted == 1)
    }

    async fn status(&self, key: &str) -> Result<LockStatus, LockError> {
        let mut conn = self.conn.clone();

        let pttl: i64 = redis::cmd("PTTL")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await
            .map_err(|e| LockError::Command(e.to_string()))?;

        // -2: missing, -1: no expiry.
        Ok(match pttl {
            -2 => LockStatus::free(),
            -1 => LockStatus {
                held: true,
                remaining_ttl: None,
            },
            ms => LockStatus {
                held: true,
                remaining_ttl: Some(Duration::from_millis(ms.max(0) as u64)),
            },
        })
    }
}
