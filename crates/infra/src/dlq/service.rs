//! Dead letter queue service: capture, automatic retry, and operator tools.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use reportflow_core::{CompanyId, RunId, RunStatus};

use super::classification::{can_job_be_retried, classify_failure, next_retry_delay};
use super::store::{DeadLetterError, FailedJobStore};
use super::types::{
    BulkRetryCriteria, BulkRetryItem, BulkRetryResult, DlqHealth, FailedJobData,
    FailedJobFilter, FailedJobId, FailedJobMetadata, FailedJobPage, FailedJobQuery,
    FailedJobSort, FailedJobState, HealthStatus, RecoveryStats, RetryOptions, RetryResult,
    SortOrder,
};
use crate::config::DlqSettings;
use crate::db::ReportRunRepository;
use crate::jobs::{FailedJobSink, Job, JobHandler, JobOptions, JobQueue, Worker, WorkerConfig};

/// The dead letter queue's own job queue.
pub const DLQ_QUEUE: &str = "dead-letter-queue";

/// Scheduled automatic retry of one entry.
pub const DLQ_RETRY_JOB: &str = "dlq-retry";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DlqRetryPayload {
    pub failed_job_id: FailedJobId,
}

pub struct DeadLetterQueueService {
    store: Arc<dyn FailedJobStore>,
    queue: Arc<dyn JobQueue>,
    origins: HashMap<String, Arc<dyn JobQueue>>,
    runs: Arc<dyn ReportRunRepository>,
    settings: DlqSettings,
}

impl DeadLetterQueueService {
    pub fn new(
        store: Arc<dyn FailedJobStore>,
        queue: Arc<dyn JobQueue>,
        runs: Arc<dyn ReportRunRepository>,
        settings: DlqSettings,
    ) -> Self {
        Self {
            store,
            queue,
            origins: HashMap::new(),
            runs,
            settings,
        }
    }

    /// Register a queue that dead-lettered jobs can be re-submitted to.
    pub fn with_origin_queue(mut self, queue: Arc<dyn JobQueue>) -> Self {
        self.origins.insert(queue.name().to_string(), queue);
        self
    }

    /// Record a job that exhausted its attempts and schedule a retry if it
    /// qualifies. Jobs re-submitted by this service update their original entry.
    #[instrument(skip_all, fields(job_id = %job.id, job_name = %job.name), err)]
    pub async fn capture_failed_job(
        &self,
        job: &Job,
        error: &str,
    ) -> Result<FailedJobData, DeadLetterError> {
        let now = Utc::now();
        let previous = match job.options.retry_of {
            Some(id) => self.store.get(FailedJobId(id)).await?,
            None => None,
        };
        let is_new = previous.is_none();

        let mut entry = match previous {
            Some(mut entry) => {
                entry.job_id = job.id;
                entry.attempts_made += job.attempts_made;
                entry
            }
            None => FailedJobData {
                id: FailedJobId::new(),
                job_id: job.id,
                job_name: job.name.clone(),
                payload: job.payload.clone(),
                options: job.options.clone(),
                failed_at: now,
                error: String::new(),
                attempts_made: job.attempts_made,
                max_attempts: job.options.attempts,
                company_id: payload_uuid(&job.payload, "companyId").map(CompanyId::from_uuid),
                run_id: payload_uuid(&job.payload, "runId").map(RunId::from_uuid),
                classification: classify_failure(error, job.attempts_made),
                can_retry: false,
                next_retry_at: None,
                retry_count: 0,
                state: FailedJobState::Pending,
                metadata: FailedJobMetadata {
                    origin_queue: job.queue.clone(),
                    ..Default::default()
                },
                updated_at: now,
            },
        };

        entry.failed_at = now;
        entry.updated_at = now;
        entry.error = error.to_string();
        entry.classification = classify_failure(error, entry.attempts_made);
        entry.can_retry =
            can_job_be_retried(entry.classification, entry.retry_count, self.settings.max_retries);
        entry.state = FailedJobState::Pending;
        entry.next_retry_at = None;
        entry.metadata.failure_type = entry.classification.as_str().to_string();
        entry.metadata.duration_ms = job.history.last().map(|a| a.duration_ms);
        entry.metadata.retry_job_id = None;

        if is_new {
            self.store.insert(entry.clone()).await?;
        } else {
            self.store.update(&entry).await?;
        }

        if entry.can_retry {
            self.schedule_retry(&mut entry).await?;
            info!(
                failed_job_id = %entry.id,
                classification = %entry.classification,
                retry_count = entry.retry_count,
                next_retry_at = ?entry.next_retry_at,
                "dead-lettered job scheduled for retry"
            );
        } else {
            warn!(
                failed_job_id = %entry.id,
                classification = %entry.classification,
                attempts_made = entry.attempts_made,
                error = %entry.error,
                "dead-lettered job needs manual review: {}",
                entry.classification.message()
            );
        }

        Ok(entry)
    }

    async fn schedule_retry(&self, entry: &mut FailedJobData) -> Result<(), DeadLetterError> {
        let delay = next_retry_delay(entry.classification, entry.retry_count);
        let payload = serde_json::to_value(DlqRetryPayload {
            failed_job_id: entry.id,
        })?;
        let retry_job = self
            .queue
            .add(DLQ_RETRY_JOB, payload, JobOptions::default().with_delay(delay))
            .await?;

        entry.state = FailedJobState::ScheduledRetry;
        entry.next_retry_at = Some(retry_job.scheduled_at);
        entry.metadata.retry_job_id = Some(retry_job.id);
        entry.updated_at = Utc::now();
        self.store.update(entry).await
    }

    /// Run a scheduled retry. Returns `None` when the entry was already
    /// handled by an operator since the retry was scheduled.
    #[instrument(skip(self), err)]
    pub async fn process_scheduled_retry(
        &self,
        id: FailedJobId,
    ) -> Result<Option<RetryResult>, DeadLetterError> {
        let entry = self.store.get(id).await?.ok_or(DeadLetterError::NotFound(id))?;
        if entry.state != FailedJobState::ScheduledRetry {
            info!(failed_job_id = %id, state = entry.state.as_str(), "scheduled retry no longer applies");
            return Ok(None);
        }
        self.resubmit(entry, None, None).await.map(Some)
    }

    async fn resubmit(
        &self,
        mut entry: FailedJobData,
        priority: Option<i32>,
        delay: Option<Duration>,
    ) -> Result<RetryResult, DeadLetterError> {
        let origin = self
            .origins
            .get(&entry.metadata.origin_queue)
            .ok_or_else(|| DeadLetterError::UnknownQueue(entry.metadata.origin_queue.clone()))?;

        entry.retry_count += 1;
        let attempts = entry.max_attempts.saturating_sub(entry.retry_count).max(1);
        let mut options = entry.options.clone().with_attempts(attempts).retry_of(entry.id.0);
        options.delay = delay;
        if let Some(priority) = priority {
            options.priority = priority;
        }

        // The run is QUEUED before the job becomes claimable.
        if let Some(run_id) = entry.run_id {
            let step = format!("Retrying from dead letter queue (attempt {})", entry.retry_count);
            self.runs.update_status(run_id, RunStatus::Queued, Some(step)).await?;
        }

        let job = match origin.add(&entry.job_name, entry.payload.clone(), options).await {
            Ok(job) => job,
            Err(e) => {
                if let Some(run_id) = entry.run_id {
                    let step = format!("Dead letter retry could not be queued: {e}");
                    if let Err(revert) =
                        self.runs.update_status(run_id, RunStatus::Failed, Some(step)).await
                    {
                        warn!(run_id = %run_id, error = %revert, "failed to restore run after retry error");
                    }
                }
                return Err(e.into());
            }
        };

        self.cancel_scheduled_retry(&mut entry).await;
        entry.state = FailedJobState::Retried;
        entry.metadata.resubmitted_job_id = Some(job.id);
        entry.updated_at = Utc::now();
        self.store.update(&entry).await?;

        info!(
            failed_job_id = %entry.id,
            job_id = %job.id,
            queue = %entry.metadata.origin_queue,
            retry_count = entry.retry_count,
            attempts,
            "dead-lettered job re-submitted"
        );
        Ok(RetryResult::resubmitted(job.id))
    }

    /// Drop a pending `dlq-retry` job. A running one is left alone and will
    /// find the entry no longer scheduled.
    async fn cancel_scheduled_retry(&self, entry: &mut FailedJobData) {
        entry.next_retry_at = None;
        if let Some(retry_job_id) = entry.metadata.retry_job_id.take() {
            if let Err(e) = self.queue.remove(retry_job_id).await {
                warn!(failed_job_id = %entry.id, job_id = %retry_job_id, error = %e, "failed to remove scheduled retry");
            }
        }
    }

    /// Re-submit one entry now.
    #[instrument(skip(self, options), fields(force = options.force_retry), err)]
    pub async fn retry_job(
        &self,
        id: FailedJobId,
        options: RetryOptions,
    ) -> Result<RetryResult, DeadLetterError> {
        let entry = self.store.get(id).await?.ok_or(DeadLetterError::NotFound(id))?;

        if !options.force_retry {
            let rejection = match entry.state {
                FailedJobState::Retried => Some("Job was already retried".to_string()),
                FailedJobState::PermanentFailure => Some(format!(
                    "Job was marked as a permanent failure: {}",
                    entry.metadata.permanent_reason.as_deref().unwrap_or("no reason given")
                )),
                _ if !entry.can_retry => Some(entry.classification.message().to_string()),
                _ => None,
            };
            if let Some(error) = rejection {
                info!(failed_job_id = %id, reason = %error, "retry rejected");
                return Ok(RetryResult::rejected(error));
            }
        }

        self.resubmit(entry, options.priority, options.delay).await
    }

    /// Retry unresolved entries matching `criteria`, oldest first.
    #[instrument(skip(self), err)]
    pub async fn bulk_retry_jobs(
        &self,
        criteria: BulkRetryCriteria,
    ) -> Result<BulkRetryResult, DeadLetterError> {
        let filter = FailedJobFilter {
            classification: criteria.classification,
            company_id: criteria.company_id,
            can_retry: (!criteria.force_retry).then_some(true),
            ..FailedJobFilter::unresolved()
        };
        let candidates = self
            .store
            .matching(&filter)
            .await?
            .into_iter()
            .filter(|e| criteria.failed_after.is_none_or(|after| e.failed_at >= after))
            .filter(|e| criteria.failed_before.is_none_or(|before| e.failed_at < before))
            .take(criteria.max_jobs.unwrap_or(usize::MAX));

        let mut result = BulkRetryResult::default();
        for entry in candidates {
            let options = RetryOptions {
                force_retry: criteria.force_retry,
                ..Default::default()
            };
            let outcome = match self.retry_job(entry.id, options).await {
                Ok(outcome) => outcome,
                Err(e) => RetryResult::rejected(e.to_string()),
            };
            result.attempted += 1;
            if outcome.success {
                result.successful += 1;
            } else {
                result.failed += 1;
            }
            result.results.push(BulkRetryItem {
                id: entry.id,
                result: outcome,
            });
        }

        info!(
            attempted = result.attempted,
            successful = result.successful,
            failed = result.failed,
            "bulk retry finished"
        );
        Ok(result)
    }

    /// Stamp entries as non-retryable. Returns how many were found.
    #[instrument(skip(self, ids), fields(count = ids.len()), err)]
    pub async fn mark_as_permanent_failure(
        &self,
        ids: &[FailedJobId],
        reason: &str,
    ) -> Result<usize, DeadLetterError> {
        let mut marked = 0;
        for id in ids {
            let Some(mut entry) = self.store.get(*id).await? else {
                warn!(failed_job_id = %id, "cannot mark unknown failed job");
                continue;
            };
            self.cancel_scheduled_retry(&mut entry).await;
            entry.can_retry = false;
            entry.state = FailedJobState::PermanentFailure;
            entry.metadata.permanent_reason = Some(reason.to_string());
            entry.updated_at = Utc::now();
            self.store.update(&entry).await?;
            marked += 1;
        }
        info!(marked, reason, "failed jobs marked as permanent failures");
        Ok(marked)
    }

    pub async fn get_failed_jobs(
        &self,
        query: FailedJobQuery,
    ) -> Result<FailedJobPage, DeadLetterError> {
        let mut entries = self.store.matching(&query.filter).await?;
        let stats = RecoveryStats::from_entries(&entries, Utc::now());

        entries.sort_by(|a, b| {
            let ordering = compare(a, b, query.sort);
            match query.order {
                SortOrder::Asc => ordering,
                SortOrder::Desc => ordering.reverse(),
            }
        });

        let total = entries.len();
        let jobs = entries
            .into_iter()
            .skip(query.offset)
            .take(query.limit)
            .collect();
        Ok(FailedJobPage { jobs, total, stats })
    }

    pub async fn get_health_status(&self) -> Result<DlqHealth, DeadLetterError> {
        let unresolved = self.store.matching(&FailedJobFilter::unresolved()).await?;
        let scheduled_retries = unresolved
            .iter()
            .filter(|e| e.state == FailedJobState::ScheduledRetry)
            .count();
        let failed_jobs = unresolved.len();
        let degraded = failed_jobs > self.settings.degraded_threshold;
        if degraded {
            warn!(
                failed_jobs,
                threshold = self.settings.degraded_threshold,
                "dead letter queue backlog above threshold"
            );
        }

        Ok(DlqHealth {
            healthy: !degraded,
            status: if degraded {
                HealthStatus::Degraded
            } else {
                HealthStatus::Healthy
            },
            failed_jobs,
            scheduled_retries,
            threshold: self.settings.degraded_threshold,
        })
    }

    /// Delete retried and permanently failed entries older than `older_than`.
    #[instrument(skip(self), err)]
    pub async fn cleanup_completed(&self, older_than: Duration) -> Result<usize, DeadLetterError> {
        let age = chrono::Duration::from_std(older_than).unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(age)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let removed = self.store.delete_resolved_before(cutoff).await?;
        info!(removed, "dead letter cleanup finished");
        Ok(removed)
    }

    /// Cleanup using the configured age.
    pub async fn cleanup_expired(&self) -> Result<usize, DeadLetterError> {
        self.cleanup_completed(self.settings.cleanup_after).await
    }
}

fn compare(a: &FailedJobData, b: &FailedJobData, sort: FailedJobSort) -> Ordering {
    let primary = match sort {
        FailedJobSort::FailedAt => a.failed_at.cmp(&b.failed_at),
        FailedJobSort::AttemptsMade => a.attempts_made.cmp(&b.attempts_made),
        FailedJobSort::Classification => a.classification.as_str().cmp(b.classification.as_str()),
        FailedJobSort::NextRetryAt => a.next_retry_at.cmp(&b.next_retry_at),
    };
    primary.then_with(|| a.id.cmp(&b.id))
}

fn payload_uuid(payload: &serde_json::Value, key: &str) -> Option<Uuid> {
    payload.get(key)?.as_str()?.parse().ok()
}

#[async_trait]
impl FailedJobSink for DeadLetterQueueService {
    async fn capture(&self, job: &Job, error: &str) -> anyhow::Result<()> {
        self.capture_failed_job(job, error).await?;
        Ok(())
    }
}

#[async_trait]
impl JobHandler for DeadLetterQueueService {
    async fn handle(&self, job: &Job) -> anyhow::Result<()> {
        let payload: DlqRetryPayload = job.payload_as()?;
        match self.process_scheduled_retry(payload.failed_job_id).await? {
            Some(result) if !result.success => anyhow::bail!(
                "retry of {} rejected: {}",
                payload.failed_job_id,
                result.error.unwrap_or_default()
            ),
            _ => Ok(()),
        }
    }
}

/// Worker for the dead letter queue's own scheduled retries.
pub fn build_worker(service: Arc<DeadLetterQueueService>, poll_interval: Duration) -> Worker {
    let config = WorkerConfig::default()
        .with_name("dead-letter-queue")
        .with_concurrency(service.settings.worker_concurrency)
        .with_poll_interval(poll_interval);
    let mut worker = Worker::new(service.queue.clone(), config);
    worker.register_handler(DLQ_RETRY_JOB, service);
    worker
}
