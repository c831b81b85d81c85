//! Report-run and company repositories.
//!
//! Only single-row creates and updates; no multi-statement transactions and no
//! schema management. Run uniqueness per company and day is enforced by the
//! scheduling service, not by a constraint.

pub mod in_memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::NaiveDate;

use reportflow_core::{Company, CompanyId, ReportRun, RunId, RunStatus};

pub use in_memory::InMemoryDatabase;
pub use postgres::PostgresRepository;

/// Repository error.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

#[async_trait]
pub trait ReportRunRepository: Send + Sync {
    async fn create(&self, run: ReportRun) -> Result<ReportRun, RepositoryError>;

    async fn get(&self, id: RunId) -> Result<Option<ReportRun>, RepositoryError>;

    /// Most recent run created on `date` whose status is in `statuses`
    /// (any status when empty).
    async fn find_for_day(
        &self,
        company_id: CompanyId,
        date: NaiveDate,
        statuses: &[RunStatus],
    ) -> Result<Option<ReportRun>, RepositoryError>;

    /// All runs created on `date`, newest first.
    async fn list_for_day(
        &self,
        company_id: CompanyId,
        date: NaiveDate,
    ) -> Result<Vec<ReportRun>, RepositoryError>;

    async fn latest_for_company(
        &self,
        company_id: CompanyId,
    ) -> Result<Option<ReportRun>, RepositoryError>;

    async fn set_job_id(&self, id: RunId, job_id: &str) -> Result<(), RepositoryError>;

    /// Update status (and step text when given); sets `completed_at` on
    /// COMPLETED/FAILED.
    async fn update_status(
        &self,
        id: RunId,
        status: RunStatus,
        step_status: Option<String>,
    ) -> Result<ReportRun, RepositoryError>;
}

#[async_trait]
pub trait CompanyRepository: Send + Sync {
    async fn find_with_competitors(
        &self,
        id: CompanyId,
    ) -> Result<Option<Company>, RepositoryError>;

    /// Companies with at least one COMPLETED run whose owner has an active
    /// subscription or is an admin.
    async fn eligible_for_backup(&self) -> Result<Vec<Company>, RepositoryError>;
}
