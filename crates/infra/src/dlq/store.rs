//! Storage for dead letter entries.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::types::{FailedJobData, FailedJobFilter, FailedJobId};
use crate::db::RepositoryError;
use crate::jobs::QueueError;

/// Dead letter queue error.
#[derive(Debug, thiserror::Error)]
pub enum DeadLetterError {
    #[error("failed job not found: {0}")]
    NotFound(FailedJobId),
    #[error("no queue registered for origin {0}")]
    UnknownQueue(String),
    #[error("dead letter store error: {0}")]
    Store(String),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error("invalid payload: {0}")]
    Payload(#[from] serde_json::Error),
}

impl From<sqlx::Error> for DeadLetterError {
    fn from(e: sqlx::Error) -> Self {
        DeadLetterError::Store(e.to_string())
    }
}

#[async_trait]
pub trait FailedJobStore: Send + Sync {
    async fn insert(&self, entry: FailedJobData) -> Result<(), DeadLetterError>;

    async fn get(&self, id: FailedJobId) -> Result<Option<FailedJobData>, DeadLetterError>;

    /// Replace an existing entry.
    async fn update(&self, entry: &FailedJobData) -> Result<(), DeadLetterError>;

    /// Entries matching `filter`, oldest failure first.
    async fn matching(&self, filter: &FailedJobFilter)
        -> Result<Vec<FailedJobData>, DeadLetterError>;

    /// Delete resolved entries last updated before `cutoff`.
    async fn delete_resolved_before(&self, cutoff: DateTime<Utc>)
        -> Result<usize, DeadLetterError>;
}

#[derive(Debug, Default)]
pub struct InMemoryFailedJobStore {
    entries: RwLock<HashMap<FailedJobId, FailedJobData>>,
}

impl InMemoryFailedJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl FailedJobStore for InMemoryFailedJobStore {
    async fn insert(&self, entry: FailedJobData) -> Result<(), DeadLetterError> {
        self.entries.write().await.insert(entry.id, entry);
        Ok(())
    }

    async fn get(&self, id: FailedJobId) -> Result<Option<FailedJobData>, DeadLetterError> {
        Ok(self.entries.read().await.get(&id).cloned())
    }

    async fn update(&self, entry: &FailedJobData) -> Result<(), DeadLetterError> {
        let mut entries = self.entries.write().await;
        let slot = entries
            .get_mut(&entry.id)
            .ok_or(DeadLetterError::NotFound(entry.id))?;
        *slot = entry.clone();
        Ok(())
    }

    async fn matching(
        &self,
        filter: &FailedJobFilter,
    ) -> Result<Vec<FailedJobData>, DeadLetterError> {
        let entries = self.entries.read().await;
        let mut result: Vec<_> = entries.values().filter(|e| filter.matches(e)).cloned().collect();
        result.sort_by_key(|e| (e.failed_at, e.id));
        Ok(result)
    }

    async fn delete_resolved_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, DeadLetterError> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| !(e.state.is_resolved() && e.updated_at < cutoff));
        Ok(before - entries.len())
    }
}
