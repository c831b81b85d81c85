//! Core job types and policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Job execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued (possibly delayed), waiting to be picked up
    Pending,
    /// Currently being executed
    Running,
    /// Completed successfully
    Completed,
    /// Exhausted its attempts
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Exponential delay between queue-native attempts: `base * 2^(attempt-1)`,
/// capped at `max_delay`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(Duration::from_millis(500), Duration::from_secs(60))
    }
}

impl RetryPolicy {
    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }

    /// Calculate delay after a given failed attempt (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 2_u32.saturating_pow((attempt - 1).min(30));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Per-job options supplied on `add`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Total attempts including the first one.
    pub attempts: u32,
    pub backoff: RetryPolicy,
    /// Higher runs first.
    pub priority: i32,
    /// Initial delay before the job becomes claimable.
    pub delay: Option<Duration>,
    /// Dead letter entry this job re-submits, if any.
    pub retry_of: Option<Uuid>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            attempts: 1,
            backoff: RetryPolicy::default(),
            priority: 0,
            delay: None,
            retry_of: None,
        }
    }
}

impl JobOptions {
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: RetryPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn retry_of(mut self, dead_letter_id: Uuid) -> Self {
        self.retry_of = Some(dead_letter_id);
        self
    }
}

/// Record of a job execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobAttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// What happened to a job after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Re-queued; claimable again at `next_at`.
    Retrying { next_at: DateTime<Utc> },
    /// No attempts left; the job is terminally failed.
    Exhausted,
}

/// A background job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Queue the job lives on
    pub queue: String,
    /// Job name for routing to a handler
    pub name: String,
    /// JSON payload
    pub payload: serde_json::Value,
    pub options: JobOptions,
    pub status: JobStatus,
    /// Attempts started so far
    pub attempts_made: u32,
    pub created_at: DateTime<Utc>,
    /// When the job next becomes claimable (delayed jobs and retries)
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Error of the most recent failed attempt
    pub failed_reason: Option<String>,
    /// Execution history
    pub history: Vec<JobAttemptRecord>,
}

impl Job {
    /// Create a new job.
    pub fn new(
        queue: impl Into<String>,
        name: impl Into<String>,
        payload: serde_json::Value,
        options: JobOptions,
    ) -> Self {
        let now = Utc::now();
        let scheduled_at = match options.delay {
            Some(delay) => now + chrono::Duration::from_std(delay).unwrap_or_default(),
            None => now,
        };
        Self {
            id: JobId::new(),
            queue: queue.into(),
            name: name.into(),
            payload,
            options,
            status: JobStatus::Pending,
            attempts_made: 0,
            created_at: now,
            scheduled_at,
            started_at: None,
            finished_at: None,
            failed_reason: None,
            history: Vec::new(),
        }
    }

    /// Check if the job is ready to execute.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.scheduled_at <= now
    }

    /// Whether another attempt is allowed after the current one.
    pub fn has_attempts_left(&self) -> bool {
        self.attempts_made < self.options.attempts
    }

    /// Deserialize the payload.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }

    /// Mark job as running.
    pub fn mark_running(&mut self) {
        self.status = JobStatus::Running;
        self.attempts_made += 1;
        self.started_at = Some(Utc::now());
    }

    /// Mark job as completed.
    pub fn mark_completed(&mut self) {
        let now = Utc::now();
        self.status = JobStatus::Completed;
        self.finished_at = Some(now);
        self.record_attempt(now, None);
    }

    /// Mark job as failed; schedules a retry when attempts remain.
    pub fn mark_failed(&mut self, error: String) -> FailOutcome {
        let now = Utc::now();
        self.record_attempt(now, Some(error.clone()));
        self.failed_reason = Some(error);

        if self.has_attempts_left() {
            let delay = self.options.backoff.delay_for_attempt(self.attempts_made);
            let next_at = now + chrono::Duration::from_std(delay).unwrap_or_default();
            self.status = JobStatus::Pending;
            self.scheduled_at = next_at;
            FailOutcome::Retrying { next_at }
        } else {
            self.status = JobStatus::Failed;
            self.finished_at = Some(now);
            FailOutcome::Exhausted
        }
    }

    fn record_attempt(&mut self, finished_at: DateTime<Utc>, error: Option<String>) {
        let started_at = self.started_at.unwrap_or(finished_at);
        self.history.push(JobAttemptRecord {
            attempt: self.attempts_made,
            started_at,
            finished_at,
            success: error.is_none(),
            error,
            duration_ms: (finished_at - started_at).num_milliseconds().max(0) as u64,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(attempts: u32) -> JobOptions {
        JobOptions::default()
            .with_attempts(attempts)
            .with_backoff(RetryPolicy::exponential(
                Duration::from_millis(100),
                Duration::from_secs(10),
            ))
    }

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let policy = RetryPolicy::exponential(Duration::from_millis(100), Duration::from_secs(10));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(800));
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let policy = RetryPolicy::exponential(Duration::from_secs(5), Duration::from_secs(30));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(30));
    }

    #[test]
    fn zero_base_retries_immediately() {
        let policy = RetryPolicy::exponential(Duration::ZERO, Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(3), Duration::ZERO);
    }

    #[test]
    fn job_lifecycle() {
        let mut job = Job::new("q", "test", serde_json::json!({"key": "value"}), options(3));

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts_made, 0);
        assert!(job.is_ready(Utc::now()));

        job.mark_running();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.attempts_made, 1);

        job.mark_completed();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.history.len(), 1);
        assert!(job.history[0].success);
        assert!(job.finished_at.is_some());
    }

    #[test]
    fn job_failure_and_retry() {
        let mut job = Job::new("q", "test", serde_json::json!({}), options(2));

        job.mark_running();
        let outcome = job.mark_failed("error 1".to_string());
        assert!(matches!(outcome, FailOutcome::Retrying { .. }));
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.scheduled_at > job.created_at);

        job.mark_running();
        let outcome = job.mark_failed("error 2".to_string());
        assert_eq!(outcome, FailOutcome::Exhausted);
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.failed_reason.as_deref(), Some("error 2"));
        assert_eq!(job.history.len(), 2);
    }

    #[test]
    fn delayed_job_is_not_ready_yet() {
        let job = Job::new(
            "q",
            "test",
            serde_json::json!({}),
            JobOptions::default().with_delay(Duration::from_secs(60)),
        );
        assert!(!job.is_ready(Utc::now()));
        assert!(job.is_ready(Utc::now() + chrono::Duration::seconds(61)));
    }
}
