//! Backup scheduler: re-queues reports the primary daily scheduler missed.
//!
//! Two job types share one worker with concurrency 1:
//!
//! - `trigger-backup-daily-reports` finds eligible companies whose report for
//!   today is missing, failed, or stuck, and force-queues a new one when the
//!   company's schedule says a report is due today.
//! - `trigger-emergency-reports` force-queues a report for every eligible
//!   company regardless of today's state.
//!
//! Each pass runs under its own distributed lock; a pass that cannot take its
//! lock is skipped, not failed.

pub mod assessment;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, instrument, warn};

use reportflow_core::RunStatus;

use crate::config::SchedulerSettings;
use crate::db::{CompanyRepository, ReportRunRepository, RepositoryError};
use crate::external::{alert_fire_and_forget, AlertService, SystemAlert};
use crate::jobs::{
    FailOutcome, FailureObserver, Job, JobHandler, JobOptions, JobQueue, QueueError, RetryPolicy,
    Worker, WorkerConfig, WorkerHandle,
};
use crate::lock::{with_lock, DistributedLock, LockError, LockOptions};
use crate::scheduling::ReportQueuer;

pub use assessment::{assess_today, TodayState};

/// Queue carrying backup and emergency trigger jobs.
pub const BACKUP_QUEUE: &str = "backup-report-scheduler";
pub const TRIGGER_BACKUP_DAILY_REPORTS: &str = "trigger-backup-daily-reports";
pub const TRIGGER_EMERGENCY_REPORTS: &str = "trigger-emergency-reports";

const ALERT_COMPONENT: &str = "backup-report-scheduler";

/// Why a pass did nothing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    /// The primary scheduler still holds its lock with time to spare.
    PrimarySchedulerActive { remaining: Option<Duration> },
    /// Another instance holds this pass's lock.
    LockUnavailable { key: String },
}

/// Result of a pass that may have been skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "summary", rename_all = "snake_case")]
pub enum PassOutcome<T> {
    Skipped(SkipReason),
    Ran(T),
}

impl<T> PassOutcome<T> {
    pub fn ran(self) -> Option<T> {
        match self {
            PassOutcome::Ran(summary) => Some(summary),
            PassOutcome::Skipped(_) => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupSummary {
    pub companies_checked: usize,
    pub backup_reports_triggered: usize,
    pub missing: usize,
    pub failed: usize,
    pub stuck: usize,
    /// Eligible companies whose schedule has no report today.
    pub not_due: usize,
    /// Companies another scheduler was already queueing; no run was created.
    pub already_in_progress: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmergencySummary {
    pub reason: String,
    pub total: usize,
    pub succeeded: usize,
    pub already_in_progress: usize,
    pub failed: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Lock(#[from] LockError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmergencyPayload {
    pub reason: String,
}

pub struct BackupScheduler {
    companies: Arc<dyn CompanyRepository>,
    runs: Arc<dyn ReportRunRepository>,
    queuer: Arc<dyn ReportQueuer>,
    lock: Arc<dyn DistributedLock>,
    alerts: Arc<dyn AlertService>,
    settings: SchedulerSettings,
}

impl BackupScheduler {
    pub fn new(
        companies: Arc<dyn CompanyRepository>,
        runs: Arc<dyn ReportRunRepository>,
        queuer: Arc<dyn ReportQueuer>,
        lock: Arc<dyn DistributedLock>,
        alerts: Arc<dyn AlertService>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            companies,
            runs,
            queuer,
            lock,
            alerts,
            settings,
        }
    }

    /// Backup pass over all eligible companies.
    #[instrument(skip(self), err)]
    pub async fn trigger_backup_daily_reports(
        &self,
    ) -> Result<PassOutcome<BackupSummary>, BackupError> {
        let primary = self.lock.status(&self.settings.primary_lock_key).await?;
        let primary_active = primary.held
            && primary
                .remaining_ttl
                .is_none_or(|left| left > self.settings.primary_skip_threshold);
        if primary_active {
            info!(
                lock_key = %self.settings.primary_lock_key,
                remaining_ms = primary.remaining_ttl.map(|d| d.as_millis() as u64),
                "primary scheduler still running, skipping backup pass"
            );
            return Ok(PassOutcome::Skipped(SkipReason::PrimarySchedulerActive {
                remaining: primary.remaining_ttl,
            }));
        }

        let key = &self.settings.backup_lock_key;
        let options = LockOptions::with_ttl(self.settings.backup_lock_ttl);
        match with_lock(self.lock.as_ref(), key, &options, || self.backup_pass()).await? {
            Some(summary) => Ok(PassOutcome::Ran(summary?)),
            None => {
                info!(lock_key = %key, "backup pass already running elsewhere, skipping");
                Ok(PassOutcome::Skipped(SkipReason::LockUnavailable { key: key.clone() }))
            }
        }
    }

    async fn backup_pass(&self) -> Result<BackupSummary, BackupError> {
        let now = Utc::now();
        let today = now.date_naive();
        let stuck_after = chrono::Duration::from_std(self.settings.stuck_threshold)
            .unwrap_or(chrono::Duration::hours(2));
        let stuck_hours = self.settings.stuck_threshold.as_secs() / 3600;

        let companies = self.companies.eligible_for_backup().await?;
        let mut summary = BackupSummary {
            companies_checked: companies.len(),
            ..Default::default()
        };

        for company in companies {
            if !company.schedule.is_due_on(today) {
                summary.not_due += 1;
                continue;
            }

            let runs_today = match self.runs.list_for_day(company.id, today).await {
                Ok(runs) => runs,
                Err(e) => {
                    warn!(company_id = %company.id, error = %e, "failed to load today's runs");
                    summary.errors.push(format!("{}: {e}", company.id));
                    continue;
                }
            };

            let state = assess_today(&runs_today, now, stuck_after);
            match &state {
                TodayState::Healthy => continue,
                TodayState::Missing => summary.missing += 1,
                TodayState::Failed => summary.failed += 1,
                TodayState::Stuck(run_ids) => {
                    summary.stuck += 1;
                    for run_id in run_ids {
                        let step = format!(
                            "Stuck for more than {stuck_hours}h, superseded by backup scheduler"
                        );
                        if let Err(e) = self
                            .runs
                            .update_status(*run_id, RunStatus::Failed, Some(step))
                            .await
                        {
                            warn!(run_id = %run_id, error = %e, "failed to mark stuck run failed");
                        }
                    }
                }
            }

            match self.queuer.queue_report(company.id, true).await {
                Ok(outcome) if outcome.is_new => {
                    summary.backup_reports_triggered += 1;
                    info!(
                        company_id = %company.id,
                        run_id = %outcome.run_id,
                        state = ?state,
                        "backup report queued"
                    );
                }
                Ok(outcome) => {
                    summary.already_in_progress += 1;
                    info!(
                        company_id = %company.id,
                        run_id = %outcome.run_id,
                        status = %outcome.status,
                        "company is being scheduled elsewhere, not counted"
                    );
                }
                Err(e) => {
                    warn!(company_id = %company.id, error = %e, "backup report could not be queued");
                    summary.errors.push(format!("{}: {e}", company.id));
                }
            }
        }

        if summary.backup_reports_triggered > 0 || !summary.errors.is_empty() {
            alert_fire_and_forget(
                self.alerts.as_ref(),
                SystemAlert::new(
                    ALERT_COMPONENT,
                    format!(
                        "Backup scheduler triggered {} report(s) ({} error(s))",
                        summary.backup_reports_triggered,
                        summary.errors.len()
                    ),
                    json!(summary),
                ),
            )
            .await;
        } else {
            info!(companies_checked = summary.companies_checked, "backup pass complete, no action needed");
        }

        Ok(summary)
    }

    /// Force-queue a report for every eligible company.
    #[instrument(skip(self), err)]
    pub async fn trigger_emergency_reports(
        &self,
        reason: &str,
    ) -> Result<PassOutcome<EmergencySummary>, BackupError> {
        let key = &self.settings.emergency_lock_key;
        let options = LockOptions::with_ttl(self.settings.emergency_lock_ttl);
        match with_lock(self.lock.as_ref(), key, &options, || self.emergency_pass(reason)).await? {
            Some(summary) => Ok(PassOutcome::Ran(summary?)),
            None => {
                info!(lock_key = %key, "emergency trigger already running elsewhere, skipping");
                Ok(PassOutcome::Skipped(SkipReason::LockUnavailable { key: key.clone() }))
            }
        }
    }

    async fn emergency_pass(&self, reason: &str) -> Result<EmergencySummary, BackupError> {
        let companies = self.companies.eligible_for_backup().await?;
        let mut summary = EmergencySummary {
            reason: reason.to_string(),
            total: companies.len(),
            ..Default::default()
        };

        for company in companies {
            match self.queuer.queue_report(company.id, true).await {
                Ok(outcome) if outcome.is_new => summary.succeeded += 1,
                Ok(_) => summary.already_in_progress += 1,
                Err(e) => {
                    warn!(company_id = %company.id, error = %e, "emergency report could not be queued");
                    summary.failed += 1;
                }
            }
        }

        alert_fire_and_forget(
            self.alerts.as_ref(),
            SystemAlert::new(
                ALERT_COMPONENT,
                format!(
                    "Emergency report trigger finished ({reason}): {} queued, {} failed",
                    summary.succeeded, summary.failed
                ),
                json!(summary),
            ),
        )
        .await;

        Ok(summary)
    }
}

#[async_trait]
impl JobHandler for BackupScheduler {
    async fn handle(&self, job: &Job) -> anyhow::Result<()> {
        match job.name.as_str() {
            TRIGGER_BACKUP_DAILY_REPORTS => {
                self.trigger_backup_daily_reports().await?;
            }
            TRIGGER_EMERGENCY_REPORTS => {
                let payload: EmergencyPayload = job.payload_as()?;
                self.trigger_emergency_reports(&payload.reason).await?;
            }
            other => anyhow::bail!("backup worker cannot handle job {other}"),
        }
        Ok(())
    }
}

/// Sends a system alert when a backup job fails.
pub struct BackupFailureAlert {
    alerts: Arc<dyn AlertService>,
}

impl BackupFailureAlert {
    pub fn new(alerts: Arc<dyn AlertService>) -> Self {
        Self { alerts }
    }
}

#[async_trait]
impl FailureObserver for BackupFailureAlert {
    async fn on_failed(&self, job: &Job, error: &str, outcome: FailOutcome) {
        alert_fire_and_forget(
            self.alerts.as_ref(),
            SystemAlert::new(
                ALERT_COMPONENT,
                format!("Backup scheduler job {} failed", job.name),
                json!({
                    "jobName": job.name,
                    "jobId": job.id.to_string(),
                    "error": error,
                    "attemptsMade": job.attempts_made,
                    "willRetry": outcome != FailOutcome::Exhausted,
                }),
            ),
        )
        .await;
    }
}

/// Worker for the backup queue: serialized, alerting on failure.
pub fn build_worker(
    scheduler: Arc<BackupScheduler>,
    queue: Arc<dyn JobQueue>,
    alerts: Arc<dyn AlertService>,
    poll_interval: Duration,
) -> Worker {
    let config = WorkerConfig::default()
        .with_name("backup-scheduler")
        .with_concurrency(1)
        .with_poll_interval(poll_interval);
    let mut worker = Worker::new(queue, config)
        .with_failure_observer(Arc::new(BackupFailureAlert::new(alerts)));
    worker.register_handler(TRIGGER_BACKUP_DAILY_REPORTS, scheduler.clone());
    worker.register_handler(TRIGGER_EMERGENCY_REPORTS, scheduler);
    worker
}

/// Build the backup worker and start it on the current runtime.
pub fn spawn_worker(
    scheduler: Arc<BackupScheduler>,
    queue: Arc<dyn JobQueue>,
    alerts: Arc<dyn AlertService>,
    poll_interval: Duration,
) -> WorkerHandle {
    build_worker(scheduler, queue, alerts, poll_interval).spawn()
}

fn trigger_options() -> JobOptions {
    JobOptions::default()
        .with_attempts(3)
        .with_backoff(RetryPolicy::exponential(Duration::from_secs(30), Duration::from_secs(300)))
}

pub async fn enqueue_backup_check(queue: &dyn JobQueue) -> Result<Job, QueueError> {
    queue
        .add(TRIGGER_BACKUP_DAILY_REPORTS, json!({}), trigger_options())
        .await
}

pub async fn enqueue_emergency(queue: &dyn JobQueue, reason: &str) -> Result<Job, QueueError> {
    let payload = json!(EmergencyPayload {
        reason: reason.to_string()
    });
    queue
        .add(TRIGGER_EMERGENCY_REPORTS, payload, trigger_options().with_priority(10))
        .await
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use chrono::Duration as ChronoDuration;
    use reportflow_core::{Company, CompanyId, Owner, ReportRun, ReportSchedule, UserId};

    use super::*;
    use crate::db::InMemoryDatabase;
    use crate::external::InMemoryAlertService;
    use crate::lock::InMemoryLockService;
    use crate::scheduling::{QueueOutcome, SchedulingError};

    /// Records calls instead of queueing.
    struct RecordingQueuer {
        calls: Mutex<Vec<(CompanyId, bool)>>,
        creates_runs: bool,
    }

    impl RecordingQueuer {
        fn new(creates_runs: bool) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                creates_runs,
            }
        }

        fn calls(&self) -> Vec<(CompanyId, bool)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ReportQueuer for RecordingQueuer {
        async fn queue_report(
            &self,
            company_id: CompanyId,
            force: bool,
        ) -> Result<QueueOutcome, SchedulingError> {
            self.calls.lock().unwrap().push((company_id, force));
            Ok(QueueOutcome {
                is_new: self.creates_runs,
                run_id: reportflow_core::RunId::new(),
                status: RunStatus::Pending,
            })
        }
    }

    struct Fixture {
        db: Arc<InMemoryDatabase>,
        queuer: Arc<RecordingQueuer>,
        locks: Arc<InMemoryLockService>,
        alerts: Arc<InMemoryAlertService>,
        scheduler: BackupScheduler,
    }

    fn fixture() -> Fixture {
        fixture_with(RecordingQueuer::new(true))
    }

    fn fixture_with(queuer: RecordingQueuer) -> Fixture {
        let db = InMemoryDatabase::arc();
        let queuer = Arc::new(queuer);
        let locks = Arc::new(InMemoryLockService::new());
        let alerts = Arc::new(InMemoryAlertService::new());
        let scheduler = BackupScheduler::new(
            db.clone(),
            db.clone(),
            queuer.clone(),
            locks.clone(),
            alerts.clone(),
            SchedulerSettings::default(),
        );
        Fixture {
            db,
            queuer,
            locks,
            alerts,
            scheduler,
        }
    }

    fn company(schedule: ReportSchedule) -> Company {
        Company {
            id: CompanyId::new(),
            name: "Acme".to_string(),
            owner: Owner {
                id: UserId::new(),
                subscription_status: Some("active".to_string()),
                is_admin: false,
            },
            competitors: Vec::new(),
            schedule,
        }
    }

    fn run_at(company_id: CompanyId, status: RunStatus, age: ChronoDuration) -> ReportRun {
        let mut run = ReportRun::pending(company_id);
        run.status = status;
        run.created_at = Utc::now() - age;
        run
    }

    async fn with_history(f: &Fixture, schedule: ReportSchedule) -> Company {
        let c = company(schedule);
        f.db.insert_company(c.clone()).await;
        f.db.insert_run(run_at(c.id, RunStatus::Completed, ChronoDuration::days(1)))
            .await;
        c
    }

    #[tokio::test]
    async fn missing_report_is_force_queued_once() {
        let f = fixture();
        let c = with_history(&f, ReportSchedule::Daily).await;

        let summary = f.scheduler.trigger_backup_daily_reports().await.unwrap().ran().unwrap();

        assert_eq!(f.queuer.calls(), vec![(c.id, true)]);
        assert_eq!(summary.companies_checked, 1);
        assert_eq!(summary.missing, 1);
        assert_eq!(summary.backup_reports_triggered, 1);
        assert_eq!(f.alerts.all().await.len(), 1);
        assert!(!f.locks.status("backup-report-scheduler").await.unwrap().held);
    }

    #[tokio::test]
    async fn contended_company_is_not_counted_as_triggered() {
        let f = fixture_with(RecordingQueuer::new(false));
        let c = with_history(&f, ReportSchedule::Daily).await;

        let summary = f.scheduler.trigger_backup_daily_reports().await.unwrap().ran().unwrap();

        assert_eq!(f.queuer.calls(), vec![(c.id, true)]);
        assert_eq!(summary.missing, 1);
        assert_eq!(summary.backup_reports_triggered, 0);
        assert_eq!(summary.already_in_progress, 1);
        assert!(f.alerts.all().await.is_empty());
    }

    #[tokio::test]
    async fn completed_today_needs_nothing() {
        let f = fixture();
        let c = with_history(&f, ReportSchedule::Daily).await;
        f.db.insert_run(run_at(c.id, RunStatus::Completed, ChronoDuration::zero()))
            .await;

        let summary = f.scheduler.trigger_backup_daily_reports().await.unwrap().ran().unwrap();

        assert!(f.queuer.calls().is_empty());
        assert_eq!(summary.backup_reports_triggered, 0);
        assert!(f.alerts.all().await.is_empty());
    }

    #[tokio::test]
    async fn stuck_run_is_failed_then_replaced() {
        let f = fixture();
        let c = with_history(&f, ReportSchedule::Daily).await;
        // Keep the stuck run on today's date even shortly after midnight.
        let stuck = run_at(c.id, RunStatus::Running, ChronoDuration::minutes(121));
        let still_today = stuck.created_on(Utc::now().date_naive());
        f.db.insert_run(stuck.clone()).await;

        let summary = f.scheduler.trigger_backup_daily_reports().await.unwrap().ran().unwrap();

        if still_today {
            assert_eq!(summary.stuck, 1);
            let stuck = f.db.get(stuck.id).await.unwrap().unwrap();
            assert_eq!(stuck.status, RunStatus::Failed);
            assert!(stuck.step_status.unwrap().contains("superseded"));
        } else {
            assert_eq!(summary.missing, 1);
        }
        assert_eq!(summary.backup_reports_triggered, 1);
    }

    #[tokio::test]
    async fn paused_schedule_is_not_due() {
        let f = fixture();
        with_history(&f, ReportSchedule::Paused).await;

        let summary = f.scheduler.trigger_backup_daily_reports().await.unwrap().ran().unwrap();
        assert_eq!(summary.not_due, 1);
        assert!(f.queuer.calls().is_empty());
    }

    #[tokio::test]
    async fn skipped_while_primary_has_time_left() {
        let f = fixture();
        with_history(&f, ReportSchedule::Daily).await;
        f.locks
            .acquire(
                "daily-report-scheduler",
                &LockOptions::with_ttl(Duration::from_secs(30 * 60)),
            )
            .await
            .unwrap();

        let outcome = f.scheduler.trigger_backup_daily_reports().await.unwrap();
        assert!(matches!(outcome, PassOutcome::Skipped(SkipReason::PrimarySchedulerActive { .. })));
        assert!(f.queuer.calls().is_empty());
    }

    #[tokio::test]
    async fn runs_when_primary_is_about_to_expire() {
        let f = fixture();
        with_history(&f, ReportSchedule::Daily).await;
        f.locks
            .acquire(
                "daily-report-scheduler",
                &LockOptions::with_ttl(Duration::from_secs(5 * 60)),
            )
            .await
            .unwrap();

        let outcome = f.scheduler.trigger_backup_daily_reports().await.unwrap();
        assert!(matches!(outcome, PassOutcome::Ran(_)));
    }

    #[tokio::test]
    async fn skipped_when_backup_lock_is_held() {
        let f = fixture();
        f.locks
            .acquire("backup-report-scheduler", &LockOptions::default())
            .await
            .unwrap();

        let outcome = f.scheduler.trigger_backup_daily_reports().await.unwrap();
        assert!(matches!(outcome, PassOutcome::Skipped(SkipReason::LockUnavailable { .. })));
    }

    #[tokio::test]
    async fn emergency_queues_every_eligible_company() {
        let f = fixture();
        let a = with_history(&f, ReportSchedule::Daily).await;
        let b = with_history(&f, ReportSchedule::Paused).await;
        f.db.insert_run(run_at(a.id, RunStatus::Completed, ChronoDuration::zero()))
            .await;

        let summary = f
            .scheduler
            .trigger_emergency_reports("primary scheduler outage")
            .await
            .unwrap()
            .ran()
            .unwrap();

        assert_eq!(summary.total, 2);
        assert_eq!(summary.succeeded, 2);
        let mut called: Vec<_> = f.queuer.calls().into_iter().map(|(id, _)| id).collect();
        called.sort();
        let mut expected = vec![a.id, b.id];
        expected.sort();
        assert_eq!(called, expected);

        let alerts = f.alerts.all().await;
        assert_eq!(alerts.len(), 1);
        assert!(alerts[0].message.contains("primary scheduler outage"));
    }
}
