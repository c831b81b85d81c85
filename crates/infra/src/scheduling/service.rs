//! Report scheduling: the single entry point that puts a report job on the queue.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tracing::{error, info, instrument, warn};

use reportflow_core::{CompanyId, ReportRun, RunId, RunStatus};

use crate::db::{CompanyRepository, ReportRunRepository, RepositoryError};
use crate::external::{BillingError, BillingService};
use crate::jobs::{JobQueue, QueueError};
use crate::lock::{with_lock, DistributedLock, LockError, LockOptions};

use super::report_job::{report_job_options, GenerateReportPayload, GENERATE_REPORT_JOB};

/// Result of a `queue_report` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueOutcome {
    /// False when an existing run was returned instead of creating one.
    pub is_new: bool,
    pub run_id: RunId,
    pub status: RunStatus,
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulingError {
    #[error("company {0} not found")]
    CompanyNotFound(CompanyId),
    #[error("a report for company {0} is already being scheduled, please wait")]
    InProgress(CompanyId),
    /// The run has already been marked FAILED.
    #[error("billing check failed: {0}")]
    Billing(#[from] BillingError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error("invalid job payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Queues report generation for a company.
#[async_trait]
pub trait ReportQueuer: Send + Sync {
    /// Queue a report, or return today's existing run unless `force`.
    async fn queue_report(
        &self,
        company_id: CompanyId,
        force: bool,
    ) -> Result<QueueOutcome, SchedulingError>;
}

/// Companies with a scheduling attempt in flight in this process.
#[derive(Debug, Default)]
pub struct InFlightSet {
    companies: Mutex<HashSet<CompanyId>>,
}

impl InFlightSet {
    /// Claim `company_id`; `None` if another task holds it.
    pub fn try_claim(&self, company_id: CompanyId) -> Option<InFlightGuard<'_>> {
        let mut companies = self.companies.lock().unwrap_or_else(PoisonError::into_inner);
        companies
            .insert(company_id)
            .then_some(InFlightGuard { set: self, company_id })
    }

    pub fn contains(&self, company_id: CompanyId) -> bool {
        self.companies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&company_id)
    }
}

/// Releases the claim on drop.
#[derive(Debug)]
pub struct InFlightGuard<'a> {
    set: &'a InFlightSet,
    company_id: CompanyId,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set
            .companies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.company_id);
    }
}

/// Lock key guarding check-then-create for one company.
pub fn company_lock_key(company_id: CompanyId) -> String {
    format!("report-schedule:{company_id}")
}

/// Deduplicating report scheduler.
///
/// At most one scheduling attempt per company is in flight: an in-process
/// set covers concurrent calls within this process and a short-lived
/// distributed lock covers other instances.
pub struct ReportScheduler {
    runs: Arc<dyn ReportRunRepository>,
    companies: Arc<dyn CompanyRepository>,
    queue: Arc<dyn JobQueue>,
    billing: Arc<dyn BillingService>,
    lock: Arc<dyn DistributedLock>,
    in_flight: InFlightSet,
    company_lock_ttl: Duration,
}

impl ReportScheduler {
    pub fn new(
        runs: Arc<dyn ReportRunRepository>,
        companies: Arc<dyn CompanyRepository>,
        queue: Arc<dyn JobQueue>,
        billing: Arc<dyn BillingService>,
        lock: Arc<dyn DistributedLock>,
    ) -> Self {
        Self {
            runs,
            companies,
            queue,
            billing,
            lock,
            in_flight: InFlightSet::default(),
            company_lock_ttl: Duration::from_secs(30),
        }
    }

    pub fn with_company_lock_ttl(mut self, ttl: Duration) -> Self {
        self.company_lock_ttl = ttl;
        self
    }

    /// Someone else is scheduling this company: hand back its latest run.
    async fn contended(&self, company_id: CompanyId) -> Result<QueueOutcome, SchedulingError> {
        match self.runs.latest_for_company(company_id).await? {
            Some(run) => {
                info!(company_id = %company_id, run_id = %run.id, step = "contended", "returning existing run");
                Ok(QueueOutcome {
                    is_new: false,
                    run_id: run.id,
                    status: run.status,
                })
            }
            None => Err(SchedulingError::InProgress(company_id)),
        }
    }

    async fn schedule_locked(
        &self,
        company_id: CompanyId,
        force: bool,
    ) -> Result<QueueOutcome, SchedulingError> {
        let started = Instant::now();
        let today = Utc::now().date_naive();

        if !force {
            if let Some(existing) = self
                .runs
                .find_for_day(company_id, today, &RunStatus::COUNTS_AS_TODAY)
                .await?
            {
                info!(
                    company_id = %company_id,
                    run_id = %existing.id,
                    status = %existing.status,
                    step = "dedup",
                    duration_ms = started.elapsed().as_millis() as u64,
                    "report already exists for today"
                );
                return Ok(QueueOutcome {
                    is_new: false,
                    run_id: existing.id,
                    status: existing.status,
                });
            }
        }

        let company = self
            .companies
            .find_with_competitors(company_id)
            .await?
            .ok_or(SchedulingError::CompanyNotFound(company_id))?;

        let run = self.runs.create(ReportRun::pending(company_id)).await?;
        info!(company_id = %company_id, run_id = %run.id, step = "run_created", "created report run");

        let payload = serde_json::to_value(GenerateReportPayload {
            run_id: run.id,
            company_id,
            user_id: company.owner.id,
        })?;
        let job = self
            .queue
            .add(GENERATE_REPORT_JOB, payload, report_job_options())
            .await?;
        self.runs.set_job_id(run.id, &job.id.to_string()).await?;
        info!(company_id = %company_id, run_id = %run.id, job_id = %job.id, step = "job_queued", "queued report job");

        if let Err(billing_error) = self
            .billing
            .start_report_for_billing(company.owner.id, company_id, run.id)
            .await
        {
            error!(
                company_id = %company_id,
                run_id = %run.id,
                job_id = %job.id,
                step = "billing",
                error = %billing_error,
                "billing check failed"
            );
            self.runs
                .update_status(
                    run.id,
                    RunStatus::Failed,
                    Some(format!("Billing check failed: {billing_error}")),
                )
                .await?;
            match self.queue.remove(job.id).await {
                Ok(true) => {}
                Ok(false) => warn!(job_id = %job.id, "job already claimed; it will skip the failed run"),
                Err(e) => warn!(job_id = %job.id, error = %e, "failed to remove job after billing failure"),
            }
            return Err(billing_error.into());
        }

        info!(
            company_id = %company_id,
            run_id = %run.id,
            job_id = %job.id,
            step = "complete",
            duration_ms = started.elapsed().as_millis() as u64,
            "report scheduled"
        );

        Ok(QueueOutcome {
            is_new: true,
            run_id: run.id,
            status: run.status,
        })
    }
}

#[async_trait]
impl ReportQueuer for ReportScheduler {
    #[instrument(skip(self), err)]
    async fn queue_report(
        &self,
        company_id: CompanyId,
        force: bool,
    ) -> Result<QueueOutcome, SchedulingError> {
        let Some(_guard) = self.in_flight.try_claim(company_id) else {
            return self.contended(company_id).await;
        };

        let options = LockOptions::with_ttl(self.company_lock_ttl);
        let key = company_lock_key(company_id);
        match with_lock(self.lock.as_ref(), &key, &options, || {
            self.schedule_locked(company_id, force)
        })
        .await?
        {
            Some(result) => result,
            None => self.contended(company_id).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use reportflow_core::{Company, Owner, ReportSchedule, UserId};

    use super::*;
    use crate::db::InMemoryDatabase;
    use crate::external::AllowAllBilling;
    use crate::jobs::{InMemoryJobQueue, QueueCounts};
    use crate::lock::InMemoryLockService;
    use crate::scheduling::REPORT_QUEUE;

    struct RejectBilling;

    #[async_trait]
    impl BillingService for RejectBilling {
        async fn start_report_for_billing(
            &self,
            _user_id: UserId,
            _company_id: CompanyId,
            _run_id: RunId,
        ) -> Result<(), BillingError> {
            Err(BillingError::InsufficientBudget("no credits left".to_string()))
        }
    }

    struct Fixture {
        db: Arc<InMemoryDatabase>,
        queue: Arc<InMemoryJobQueue>,
        locks: Arc<InMemoryLockService>,
        company: Company,
    }

    async fn fixture() -> Fixture {
        let db = InMemoryDatabase::arc();
        let company = Company {
            id: CompanyId::new(),
            name: "Acme".to_string(),
            owner: Owner {
                id: UserId::new(),
                subscription_status: Some("active".to_string()),
                is_admin: false,
            },
            competitors: Vec::new(),
            schedule: ReportSchedule::Daily,
        };
        db.insert_company(company.clone()).await;
        Fixture {
            db,
            queue: InMemoryJobQueue::arc(REPORT_QUEUE),
            locks: Arc::new(InMemoryLockService::new()),
            company,
        }
    }

    fn scheduler(f: &Fixture, billing: Arc<dyn BillingService>) -> ReportScheduler {
        ReportScheduler::new(f.db.clone(), f.db.clone(), f.queue.clone(), billing, f.locks.clone())
    }

    #[tokio::test]
    async fn second_call_returns_first_run() {
        let f = fixture().await;
        let scheduler = scheduler(&f, Arc::new(AllowAllBilling));

        let first = scheduler.queue_report(f.company.id, false).await.unwrap();
        assert!(first.is_new);
        assert_eq!(first.status, RunStatus::Pending);

        let second = scheduler.queue_report(f.company.id, false).await.unwrap();
        assert!(!second.is_new);
        assert_eq!(second.run_id, first.run_id);

        assert_eq!(f.db.runs_for_company(f.company.id).await.len(), 1);
        assert_eq!(f.queue.counts().await.unwrap().waiting, 1);
    }

    #[tokio::test]
    async fn concurrent_calls_create_one_run() {
        let f = fixture().await;
        let scheduler = Arc::new(scheduler(&f, Arc::new(AllowAllBilling)));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let scheduler = scheduler.clone();
            let company_id = f.company.id;
            tasks.push(tokio::spawn(async move { scheduler.queue_report(company_id, false).await }));
        }

        let mut new_runs = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(outcome) if outcome.is_new => new_runs += 1,
                Ok(_) | Err(SchedulingError::InProgress(_)) => {}
                Err(e) => panic!("unexpected error: {e}"),
            }
        }

        assert_eq!(new_runs, 1);
        assert_eq!(f.db.runs_for_company(f.company.id).await.len(), 1);
    }

    #[tokio::test]
    async fn force_always_creates_a_new_run() {
        let f = fixture().await;
        let scheduler = scheduler(&f, Arc::new(AllowAllBilling));

        let first = scheduler.queue_report(f.company.id, false).await.unwrap();
        let forced = scheduler.queue_report(f.company.id, true).await.unwrap();
        assert!(forced.is_new);
        assert_ne!(forced.run_id, first.run_id);
        assert_eq!(f.db.runs_for_company(f.company.id).await.len(), 2);
    }

    #[tokio::test]
    async fn failed_run_today_does_not_block_a_new_one() {
        let f = fixture().await;
        let scheduler = scheduler(&f, Arc::new(AllowAllBilling));

        let first = scheduler.queue_report(f.company.id, false).await.unwrap();
        f.db.update_status(first.run_id, RunStatus::Failed, None).await.unwrap();

        let second = scheduler.queue_report(f.company.id, false).await.unwrap();
        assert!(second.is_new);
    }

    #[tokio::test]
    async fn unknown_company_is_an_error() {
        let f = fixture().await;
        let scheduler = scheduler(&f, Arc::new(AllowAllBilling));

        let err = scheduler.queue_report(CompanyId::new(), false).await.unwrap_err();
        assert!(matches!(err, SchedulingError::CompanyNotFound(_)));
    }

    #[tokio::test]
    async fn billing_failure_fails_run_and_removes_job() {
        let f = fixture().await;
        let scheduler = scheduler(&f, Arc::new(RejectBilling));

        let err = scheduler.queue_report(f.company.id, false).await.unwrap_err();
        assert!(matches!(err, SchedulingError::Billing(_)));

        let runs = f.db.runs_for_company(f.company.id).await;
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Failed);
        assert!(runs[0].step_status.as_deref().unwrap().starts_with("Billing check failed"));
        assert_eq!(f.queue.counts().await.unwrap(), QueueCounts::default());
    }

    #[tokio::test]
    async fn company_lock_held_elsewhere_returns_latest_run_or_in_progress() {
        let f = fixture().await;
        let scheduler = scheduler(&f, Arc::new(AllowAllBilling));

        let held = f
            .locks
            .acquire(&company_lock_key(f.company.id), &LockOptions::default())
            .await
            .unwrap();
        assert!(held.acquired);

        let err = scheduler.queue_report(f.company.id, false).await.unwrap_err();
        assert!(matches!(err, SchedulingError::InProgress(_)));

        let existing = f.db.create(ReportRun::pending(f.company.id)).await.unwrap();
        let outcome = scheduler.queue_report(f.company.id, true).await.unwrap();
        assert!(!outcome.is_new);
        assert_eq!(outcome.run_id, existing.id);
    }

    #[test]
    fn in_flight_guard_releases_on_drop() {
        let set = InFlightSet::default();
        let company_id = CompanyId::new();

        let guard = set.try_claim(company_id).unwrap();
        assert!(set.try_claim(company_id).is_none());
        drop(guard);
        assert!(!set.contains(company_id));
        assert!(set.try_claim(company_id).is_some());
    }
}
