//! Service wiring: picks in-memory or persistent backends for the process.

use std::sync::Arc;

use reportflow_infra::backup::BACKUP_QUEUE;
use reportflow_infra::config::Settings;
use reportflow_infra::db::{CompanyRepository, InMemoryDatabase, ReportRunRepository};
use reportflow_infra::dlq::{FailedJobStore, InMemoryFailedJobStore, DLQ_QUEUE};
use reportflow_infra::external::{
    AlertService, AllowAllBilling, BillingService, LoggingReportGenerator, ReportGenerator,
    TracingAlertService,
};
use reportflow_infra::jobs::{InMemoryJobQueue, JobQueue};
use reportflow_infra::lock::{DistributedLock, InMemoryLockService};
use reportflow_infra::scheduling::REPORT_QUEUE;

#[cfg(feature = "redis")]
use anyhow::Context;
#[cfg(feature = "redis")]
use reportflow_infra::{
    db::PostgresRepository, dlq::PostgresFailedJobStore, jobs::PostgresJobQueue,
    lock::RedisLockService,
};
#[cfg(feature = "redis")]
use sqlx::PgPool;

/// Which storage family backs the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Backend {
    InMemory,
    Persistent,
}

/// Everything the workers need, behind trait objects.
#[derive(Clone)]
pub struct Services {
    pub backend: Backend,
    pub companies: Arc<dyn CompanyRepository>,
    pub runs: Arc<dyn ReportRunRepository>,
    pub locks: Arc<dyn DistributedLock>,
    pub report_queue: Arc<dyn JobQueue>,
    pub dlq_queue: Arc<dyn JobQueue>,
    pub backup_queue: Arc<dyn JobQueue>,
    pub failed_jobs: Arc<dyn FailedJobStore>,
    pub billing: Arc<dyn BillingService>,
    pub generator: Arc<dyn ReportGenerator>,
    pub alerts: Arc<dyn AlertService>,
}

impl Services {
    /// Queues exposed on the health endpoint, in a stable order.
    pub fn queues(&self) -> [&Arc<dyn JobQueue>; 3] {
        [&self.report_queue, &self.dlq_queue, &self.backup_queue]
    }
}

/// Single-process backends for local development and tests.
pub fn build_in_memory_services() -> Services {
    let db = InMemoryDatabase::arc();
    Services {
        backend: Backend::InMemory,
        companies: db.clone(),
        runs: db,
        locks: Arc::new(InMemoryLockService::new()),
        report_queue: InMemoryJobQueue::arc(REPORT_QUEUE),
        dlq_queue: InMemoryJobQueue::arc(DLQ_QUEUE),
        backup_queue: InMemoryJobQueue::arc(BACKUP_QUEUE),
        failed_jobs: InMemoryFailedJobStore::arc(),
        billing: Arc::new(AllowAllBilling),
        generator: Arc::new(LoggingReportGenerator),
        alerts: Arc::new(TracingAlertService),
    }
}

/// Postgres for runs, companies, queues and the dead letter store; Redis for locks.
#[cfg(feature = "redis")]
pub async fn build_persistent_services(settings: &Settings) -> anyhow::Result<Services> {
    let database_url = settings
        .database_url
        .as_deref()
        .context("DATABASE_URL must be set when USE_PERSISTENT_STORES=true")?;

    let pool = PgPool::connect(database_url)
        .await
        .context("failed to connect to Postgres")?;
    let repository = Arc::new(PostgresRepository::new(pool.clone()));

    let locks = RedisLockService::connect(&settings.redis_url)
        .await
        .context("failed to connect to Redis")?;

    Ok(Services {
        backend: Backend::Persistent,
        companies: repository.clone(),
        runs: repository,
        locks: Arc::new(locks),
        report_queue: Arc::new(PostgresJobQueue::new(pool.clone(), REPORT_QUEUE)),
        dlq_queue: Arc::new(PostgresJobQueue::new(pool.clone(), DLQ_QUEUE)),
        backup_queue: Arc::new(PostgresJobQueue::new(pool.clone(), BACKUP_QUEUE)),
        failed_jobs: Arc::new(PostgresFailedJobStore::new(pool)),
        billing: Arc::new(AllowAllBilling),
        generator: Arc::new(LoggingReportGenerator),
        alerts: Arc::new(TracingAlertService),
    })
}

/// Build services according to `USE_PERSISTENT_STORES`.
pub async fn build_services(settings: &Settings) -> anyhow::Result<Services> {
    if !settings.use_persistent_stores {
        return Ok(build_in_memory_services());
    }

    #[cfg(feature = "redis")]
    {
        build_persistent_services(settings).await
    }
    #[cfg(not(feature = "redis"))]
    {
        tracing::warn!(
            "USE_PERSISTENT_STORES=true but redis feature not enabled, falling back to in-memory"
        );
        Ok(build_in_memory_services())
    }
}
