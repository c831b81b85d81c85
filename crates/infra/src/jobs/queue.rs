//! Job queue abstraction and the in-memory implementation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::types::{FailOutcome, Job, JobId, JobOptions, JobStatus};

/// A named queue of jobs with at-least-once delivery.
#[async_trait]
pub trait JobQueue: Send + Sync {
    fn name(&self) -> &str;

    /// Enqueue a new job.
    async fn add(
        &self,
        name: &str,
        payload: serde_json::Value,
        options: JobOptions,
    ) -> Result<Job, QueueError>;

    async fn get(&self, id: JobId) -> Result<Option<Job>, QueueError>;

    /// Claim the next ready job, marking it running.
    /// Returns None if no jobs are available.
    async fn claim_next(&self) -> Result<Option<Job>, QueueError>;

    async fn complete(&self, id: JobId) -> Result<Job, QueueError>;

    /// Record a failed attempt; the job is re-queued with backoff while
    /// attempts remain.
    async fn fail(&self, id: JobId, error: &str) -> Result<(Job, FailOutcome), QueueError>;

    /// Remove a job that has not started. Running jobs are left alone.
    async fn remove(&self, id: JobId) -> Result<bool, QueueError>;

    async fn counts(&self) -> Result<QueueCounts, QueueError>;
}

/// Queue error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job {id} is {status:?}, expected running")]
    NotRunning { id: JobId, status: JobStatus },
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<sqlx::Error> for QueueError {
    fn from(e: sqlx::Error) -> Self {
        QueueError::Storage(e.to_string())
    }
}

/// Job counts per state.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueCounts {
    /// Pending and claimable now
    pub waiting: usize,
    /// Pending with a future `scheduled_at`
    pub delayed: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}

/// In-memory job queue for tests/dev.
#[derive(Debug)]
pub struct InMemoryJobQueue {
    name: String,
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            jobs: RwLock::new(HashMap::new()),
        }
    }

    pub fn arc(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self::new(name))
    }

    /// All jobs with the given name, oldest first.
    pub async fn jobs_named(&self, name: &str) -> Vec<Job> {
        let jobs = self.jobs.read().await;
        let mut result: Vec<_> = jobs.values().filter(|j| j.name == name).cloned().collect();
        result.sort_by_key(|j| j.created_at);
        result
    }

    /// Make a delayed job claimable now.
    pub async fn promote(&self, id: JobId) -> bool {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::Pending => {
                job.scheduled_at = Utc::now();
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn add(
        &self,
        name: &str,
        payload: serde_json::Value,
        options: JobOptions,
    ) -> Result<Job, QueueError> {
        let job = Job::new(self.name.clone(), name, payload, options);
        self.jobs.write().await.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, QueueError> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn claim_next(&self) -> Result<Option<Job>, QueueError> {
        let mut jobs = self.jobs.write().await;
        let now = Utc::now();

        // Highest priority first, then FIFO by schedule.
        let next = jobs
            .values()
            .filter(|j| j.is_ready(now))
            .min_by(|a, b| {
                b.options
                    .priority
                    .cmp(&a.options.priority)
                    .then(a.scheduled_at.cmp(&b.scheduled_at))
                    .then(a.created_at.cmp(&b.created_at))
            })
            .map(|j| j.id);

        Ok(next.and_then(|id| {
            let job = jobs.get_mut(&id)?;
            job.mark_running();
            Some(job.clone())
        }))
    }

    async fn complete(&self, id: JobId) -> Result<Job, QueueError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        if job.status != JobStatus::Running {
            return Err(QueueError::NotRunning {
                id,
                status: job.status,
            });
        }
        job.mark_completed();
        Ok(job.clone())
    }

    async fn fail(&self, id: JobId, error: &str) -> Result<(Job, FailOutcome), QueueError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        if job.status != JobStatus::Running {
            return Err(QueueError::NotRunning {
                id,
                status: job.status,
            });
        }
        let outcome = job.mark_failed(error.to_string());
        Ok((job.clone(), outcome))
    }

    async fn remove(&self, id: JobId) -> Result<bool, QueueError> {
        let mut jobs = self.jobs.write().await;
        match jobs.get(&id) {
            Some(job) if job.status == JobStatus::Running => Ok(false),
            Some(_) => Ok(jobs.remove(&id).is_some()),
            None => Ok(false),
        }
    }

    async fn counts(&self) -> Result<QueueCounts, QueueError> {
        let jobs = self.jobs.read().await;
        let now = Utc::now();
        let mut counts = QueueCounts::default();

        for job in jobs.values() {
            match job.status {
                JobStatus::Pending if job.scheduled_at <= now => counts.waiting += 1,
                JobStatus::Pending => counts.delayed += 1,
                JobStatus::Running => counts.active += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed => counts.failed += 1,
            }
        }

        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::jobs::types::RetryPolicy;

    #[tokio::test]
    async fn add_and_claim() {
        let queue = InMemoryJobQueue::new("reports");

        let job = queue
            .add("test", serde_json::json!({}), JobOptions::default())
            .await
            .unwrap();
        assert_eq!(job.queue, "reports");

        let claimed = queue.claim_next().await.unwrap().unwrap();
        assert_eq!(claimed.id, job.id);
        assert_eq!(claimed.status, JobStatus::Running);
        assert_eq!(claimed.attempts_made, 1);

        // No more jobs
        assert!(queue.claim_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claims_by_priority_then_fifo() {
        let queue = InMemoryJobQueue::new("q");
        let low = queue
            .add("low", serde_json::json!({}), JobOptions::default())
            .await
            .unwrap();
        let high = queue
            .add("high", serde_json::json!({}), JobOptions::default().with_priority(10))
            .await
            .unwrap();

        assert_eq!(queue.claim_next().await.unwrap().unwrap().id, high.id);
        assert_eq!(queue.claim_next().await.unwrap().unwrap().id, low.id);
    }

    #[tokio::test]
    async fn delayed_jobs_wait_until_promoted() {
        let queue = InMemoryJobQueue::new("q");
        let job = queue
            .add(
                "later",
                serde_json::json!({}),
                JobOptions::default().with_delay(Duration::from_secs(300)),
            )
            .await
            .unwrap();

        assert!(queue.claim_next().await.unwrap().is_none());
        assert_eq!(queue.counts().await.unwrap().delayed, 1);

        assert!(queue.promote(job.id).await);
        assert_eq!(queue.claim_next().await.unwrap().unwrap().id, job.id);
    }

    #[tokio::test]
    async fn failed_job_retries_then_exhausts() {
        let queue = InMemoryJobQueue::new("q");
        let options = JobOptions::default()
            .with_attempts(2)
            .with_backoff(RetryPolicy::exponential(Duration::ZERO, Duration::ZERO));
        let job = queue.add("flaky", serde_json::json!({}), options).await.unwrap();

        queue.claim_next().await.unwrap().unwrap();
        let (_, outcome) = queue.fail(job.id, "boom").await.unwrap();
        assert!(matches!(outcome, FailOutcome::Retrying { .. }));

        queue.claim_next().await.unwrap().unwrap();
        let (failed, outcome) = queue.fail(job.id, "boom again").await.unwrap();
        assert_eq!(outcome, FailOutcome::Exhausted);
        assert_eq!(failed.attempts_made, 2);

        let counts = queue.counts().await.unwrap();
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.waiting, 0);
    }

    #[tokio::test]
    async fn remove_leaves_running_jobs() {
        let queue = InMemoryJobQueue::new("q");
        let waiting = queue
            .add("a", serde_json::json!({}), JobOptions::default().with_priority(-1))
            .await
            .unwrap();
        let running = queue
            .add("b", serde_json::json!({}), JobOptions::default())
            .await
            .unwrap();
        queue.claim_next().await.unwrap();

        assert!(!queue.remove(running.id).await.unwrap());
        assert!(queue.remove(waiting.id).await.unwrap());
        assert!(queue.get(waiting.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn completing_an_unclaimed_job_is_rejected() {
        let queue = InMemoryJobQueue::new("q");
        let job = queue
            .add("a", serde_json::json!({}), JobOptions::default())
            .await
            .unwrap();
        assert!(matches!(
            queue.complete(job.id).await,
            Err(QueueError::NotRunning { .. })
        ));
    }
}
