//! Dead letter queue records, queries, and reports.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use reportflow_core::{CompanyId, RunId};

use super::classification::FailureClassification;
use crate::jobs::{JobId, JobOptions};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FailedJobId(pub Uuid);

impl FailedJobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for FailedJobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for FailedJobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for FailedJobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Where an entry is in its recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailedJobState {
    /// Waiting for an operator.
    Pending,
    /// An automatic retry is queued for `next_retry_at`.
    ScheduledRetry,
    /// Re-submitted to the origin queue.
    Retried,
    /// Stamped non-retryable by an operator.
    PermanentFailure,
}

impl FailedJobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailedJobState::Pending => "pending",
            FailedJobState::ScheduledRetry => "scheduled_retry",
            FailedJobState::Retried => "retried",
            FailedJobState::PermanentFailure => "permanent_failure",
        }
    }

    /// Retried and permanently failed entries are eligible for cleanup.
    pub fn is_resolved(&self) -> bool {
        matches!(self, FailedJobState::Retried | FailedJobState::PermanentFailure)
    }
}

impl FromStr for FailedJobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(FailedJobState::Pending),
            "scheduled_retry" => Ok(FailedJobState::ScheduledRetry),
            "retried" => Ok(FailedJobState::Retried),
            "permanent_failure" => Ok(FailedJobState::PermanentFailure),
            other => Err(format!("unknown failed job state: {other}")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedJobMetadata {
    pub origin_queue: String,
    pub failure_type: String,
    /// Duration of the last attempt.
    pub duration_ms: Option<u64>,
    /// Job on the dead letter queue carrying the scheduled retry.
    pub retry_job_id: Option<JobId>,
    /// Job on the origin queue created by the most recent retry.
    pub resubmitted_job_id: Option<JobId>,
    pub permanent_reason: Option<String>,
}

/// One dead-lettered job and its recovery bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedJobData {
    pub id: FailedJobId,
    /// The job that exhausted its attempts most recently.
    pub job_id: JobId,
    pub job_name: String,
    pub payload: serde_json::Value,
    /// Options the job was originally added with.
    pub options: JobOptions,
    pub failed_at: DateTime<Utc>,
    pub error: String,
    /// Attempts across the original job and every retry.
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub company_id: Option<CompanyId>,
    pub run_id: Option<RunId>,
    pub classification: FailureClassification,
    pub can_retry: bool,
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Re-submissions made from the dead letter queue.
    pub retry_count: u32,
    pub state: FailedJobState,
    pub metadata: FailedJobMetadata,
    pub updated_at: DateTime<Utc>,
}

/// Options for a manual retry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetryOptions {
    pub priority: Option<i32>,
    pub delay: Option<Duration>,
    /// Retry even if the entry is not retryable.
    pub force_retry: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryResult {
    pub success: bool,
    pub job_id: Option<JobId>,
    pub error: Option<String>,
}

impl RetryResult {
    pub fn resubmitted(job_id: JobId) -> Self {
        Self {
            success: true,
            job_id: Some(job_id),
            error: None,
        }
    }

    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            success: false,
            job_id: None,
            error: Some(error.into()),
        }
    }
}

/// Which entries a bulk retry picks up. Only unresolved entries qualify.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkRetryCriteria {
    pub classification: Option<FailureClassification>,
    pub company_id: Option<CompanyId>,
    pub failed_after: Option<DateTime<Utc>>,
    pub failed_before: Option<DateTime<Utc>>,
    /// Oldest entries are retried first.
    pub max_jobs: Option<usize>,
    pub force_retry: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkRetryItem {
    pub id: FailedJobId,
    #[serde(flatten)]
    pub result: RetryResult,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkRetryResult {
    pub attempted: usize,
    pub successful: usize,
    pub failed: usize,
    pub results: Vec<BulkRetryItem>,
}

/// Store-level filter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FailedJobFilter {
    pub classification: Option<FailureClassification>,
    pub can_retry: Option<bool>,
    pub company_id: Option<CompanyId>,
    pub states: Vec<FailedJobState>,
}

impl FailedJobFilter {
    pub fn unresolved() -> Self {
        Self {
            states: vec![FailedJobState::Pending, FailedJobState::ScheduledRetry],
            ..Default::default()
        }
    }

    pub fn matches(&self, entry: &FailedJobData) -> bool {
        self.classification.is_none_or(|c| entry.classification == c)
            && self.can_retry.is_none_or(|r| entry.can_retry == r)
            && self.company_id.is_none_or(|id| entry.company_id == Some(id))
            && (self.states.is_empty() || self.states.contains(&entry.state))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailedJobSort {
    #[default]
    FailedAt,
    AttemptsMade,
    Classification,
    NextRetryAt,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FailedJobQuery {
    pub filter: FailedJobFilter,
    pub sort: FailedJobSort,
    pub order: SortOrder,
    pub limit: usize,
    pub offset: usize,
}

impl Default for FailedJobQuery {
    fn default() -> Self {
        Self {
            filter: FailedJobFilter::default(),
            sort: FailedJobSort::default(),
            order: SortOrder::default(),
            limit: 50,
            offset: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedJobPage {
    pub jobs: Vec<FailedJobData>,
    /// Matching entries before pagination.
    pub total: usize,
    pub stats: RecoveryStats,
}

/// Aggregates over a set of entries.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryStats {
    pub total: usize,
    pub by_classification: BTreeMap<FailureClassification, usize>,
    pub retryable: usize,
    pub needs_manual_review: usize,
    pub oldest_failure: Option<DateTime<Utc>>,
    pub average_age_secs: Option<u64>,
}

impl RecoveryStats {
    pub fn from_entries(entries: &[FailedJobData], now: DateTime<Utc>) -> Self {
        let mut stats = RecoveryStats {
            total: entries.len(),
            ..Default::default()
        };
        let mut age_sum: i64 = 0;

        for entry in entries {
            *stats.by_classification.entry(entry.classification).or_default() += 1;
            let unresolved = !entry.state.is_resolved();
            if unresolved && entry.can_retry {
                stats.retryable += 1;
            }
            if unresolved && !entry.can_retry {
                stats.needs_manual_review += 1;
            }
            if stats.oldest_failure.is_none_or(|oldest| entry.failed_at < oldest) {
                stats.oldest_failure = Some(entry.failed_at);
            }
            age_sum += (now - entry.failed_at).num_seconds().max(0);
        }

        if !entries.is_empty() {
            stats.average_age_secs = Some((age_sum / entries.len() as i64) as u64);
        }
        stats
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DlqHealth {
    pub healthy: bool,
    pub status: HealthStatus,
    /// Unresolved entries.
    pub failed_jobs: usize,
    pub scheduled_retries: usize,
    pub threshold: usize,
}
