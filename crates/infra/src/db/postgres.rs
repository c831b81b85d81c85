//! Postgres repositories.
//!
//! Tables used (schema is managed elsewhere):
//!
//! | Table | Columns read/written |
//! |-------|----------------------|
//! | `report_runs` | `id, company_id, status, step_status, job_id, created_at, completed_at` |
//! | `companies` | `id, name, user_id, schedule (jsonb, nullable)` |
//! | `competitors` | `company_id, name, website` |
//! | `users` | `id, subscription_status, role` |

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use reportflow_core::{
    day_bounds, Company, CompanyId, Competitor, Owner, ReportRun, ReportSchedule, RunId,
    RunStatus, UserId,
};

use super::{CompanyRepository, ReportRunRepository, RepositoryError};

const RUN_COLUMNS: &str = "id, company_id, status, step_status, job_id, created_at, completed_at";

const COMPANY_SELECT: &str = "SELECT c.id, c.name, c.schedule, u.id AS owner_id, \
     u.subscription_status, (u.role = 'admin') AS is_admin \
     FROM companies c JOIN users u ON u.id = c.user_id";

/// Postgres-backed implementation of both repositories.
#[derive(Debug, Clone)]
pub struct PostgresRepository {
    pool: PgPool,
}

impl PostgresRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn competitors_for(
        &self,
        company_ids: &[Uuid],
    ) -> Result<HashMap<Uuid, Vec<Competitor>>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT company_id, name, website FROM competitors
             WHERE company_id = ANY($1) ORDER BY name",
        )
        .bind(company_ids)
        .fetch_all(&self.pool)
        .await?;

        let mut by_company: HashMap<Uuid, Vec<Competitor>> = HashMap::new();
        for row in rows {
            by_company
                .entry(row.try_get("company_id")?)
                .or_default()
                .push(Competitor {
                    name: row.try_get("name")?,
                    website: row.try_get("website")?,
                });
        }
        Ok(by_company)
    }

    async fn hydrate(&self, rows: Vec<CompanyRow>) -> Result<Vec<Company>, RepositoryError> {
        let ids: Vec<Uuid> = rows.iter().map(|r| r.id).collect();
        let mut competitors = self.competitors_for(&ids).await?;
        rows.into_iter()
            .map(|row| {
                let list = competitors.remove(&row.id).unwrap_or_default();
                row.into_company(list)
            })
            .collect()
    }
}

#[async_trait]
impl ReportRunRepository for PostgresRepository {
    #[instrument(skip(self, run), fields(run_id = %run.id, company_id = %run.company_id), err)]
    async fn create(&self, run: ReportRun) -> Result<ReportRun, RepositoryError> {
        sqlx::query(
            "INSERT INTO report_runs (id, company_id, status, step_status, job_id, created_at, completed_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(*run.id.as_uuid())
        .bind(*run.company_id.as_uuid())
        .bind(run.status.as_str())
        .bind(&run.step_status)
        .bind(&run.job_id)
        .bind(run.created_at)
        .bind(run.completed_at)
        .execute(&self.pool)
        .await?;
        Ok(run)
    }

    async fn get(&self, id: RunId) -> Result<Option<ReportRun>, RepositoryError> {
        let sql = format!("SELECT {RUN_COLUMNS} FROM report_runs WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(*id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| RunRow::from_row(&row)?.into_run()).transpose()
    }

    async fn find_for_day(
        &self,
        company_id: CompanyId,
        date: NaiveDate,
        statuses: &[RunStatus],
    ) -> Result<Option<ReportRun>, RepositoryError> {
        let (start, end) = day_bounds(date);
        let statuses: Vec<&str> = statuses.iter().map(RunStatus::as_str).collect();
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM report_runs
             WHERE company_id = $1 AND created_at >= $2 AND created_at < $3
               AND (cardinality($4::text[]) = 0 OR status = ANY($4))
             ORDER BY created_at DESC, id DESC
             LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(*company_id.as_uuid())
            .bind(start)
            .bind(end)
            .bind(&statuses)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| RunRow::from_row(&row)?.into_run()).transpose()
    }

    async fn list_for_day(
        &self,
        company_id: CompanyId,
        date: NaiveDate,
    ) -> Result<Vec<ReportRun>, RepositoryError> {
        let (start, end) = day_bounds(date);
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM report_runs
             WHERE company_id = $1 AND created_at >= $2 AND created_at < $3
             ORDER BY created_at DESC, id DESC"
        );
        let rows = sqlx::query(&sql)
            .bind(*company_id.as_uuid())
            .bind(start)
            .bind(end)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| RunRow::from_row(row)?.into_run())
            .collect()
    }

    async fn latest_for_company(
        &self,
        company_id: CompanyId,
    ) -> Result<Option<ReportRun>, RepositoryError> {
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM report_runs WHERE company_id = $1
             ORDER BY created_at DESC, id DESC LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(*company_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| RunRow::from_row(&row)?.into_run()).transpose()
    }

    async fn set_job_id(&self, id: RunId, job_id: &str) -> Result<(), RepositoryError> {
        let result = sqlx::query("UPDATE report_runs SET job_id = $2 WHERE id = $1")
            .bind(*id.as_uuid())
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(format!("report run {id}")));
        }
        Ok(())
    }

    #[instrument(skip_all, fields(run_id = %id, status = %status), err)]
    async fn update_status(
        &self,
        id: RunId,
        status: RunStatus,
        step_status: Option<String>,
    ) -> Result<ReportRun, RepositoryError> {
        let completed_at: Option<DateTime<Utc>> = status.is_terminal().then(Utc::now);
        let sql = format!(
            "UPDATE report_runs
             SET status = $2,
                 step_status = COALESCE($3, step_status),
                 completed_at = COALESCE($4, completed_at)
             WHERE id = $1
             RETURNING {RUN_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(*id.as_uuid())
            .bind(status.as_str())
            .bind(step_status)
            .bind(completed_at)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| RepositoryError::NotFound(format!("report run {id}")))?;
        RunRow::from_row(&row)?.into_run()
    }
}

#[async_trait]
impl CompanyRepository for PostgresRepository {
    async fn find_with_competitors(
        &self,
        id: CompanyId,
    ) -> Result<Option<Company>, RepositoryError> {
        let sql = format!("{COMPANY_SELECT} WHERE c.id = $1");
        let row = sqlx::query(&sql)
            .bind(*id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let company = CompanyRow::from_row(&row)?;
        Ok(self.hydrate(vec![company]).await?.pop())
    }

    #[instrument(skip(self), err)]
    async fn eligible_for_backup(&self) -> Result<Vec<Company>, RepositoryError> {
        let sql = format!(
            "{COMPANY_SELECT}
             WHERE (u.subscription_status = 'active' OR u.role = 'admin')
               AND EXISTS (
                   SELECT 1 FROM report_runs r
                   WHERE r.company_id = c.id AND r.status = 'COMPLETED'
               )
             ORDER BY c.id"
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        let companies = rows
            .iter()
            .map(CompanyRow::from_row)
            .collect::<Result<Vec<_>, _>>()?;
        self.hydrate(companies).await
    }
}

struct RunRow {
    id: Uuid,
    company_id: Uuid,
    status: String,
    step_status: Option<String>,
    job_id: Option<String>,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl<'r> FromRow<'r, sqlx::postgres::PgRow> for RunRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(RunRow {
            id: row.try_get("id")?,
            company_id: row.try_get("company_id")?,
            status: row.try_get("status")?,
            step_status: row.try_get("step_status")?,
            job_id: row.try_get("job_id")?,
            created_at: row.try_get("created_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }
}

impl RunRow {
    fn into_run(self) -> Result<ReportRun, RepositoryError> {
        let status = self
            .status
            .parse::<RunStatus>()
            .map_err(|e| RepositoryError::Corrupt(format!("report run {}: {e}", self.id)))?;
        Ok(ReportRun {
            id: RunId::from_uuid(self.id),
            company_id: CompanyId::from_uuid(self.company_id),
            status,
            step_status: self.step_status,
            job_id: self.job_id,
            created_at: self.created_at,
            completed_at: self.completed_at,
        })
    }
}

struct CompanyRow {
    id: Uuid,
    name: String,
    schedule: Option<serde_json::Value>,
    owner_id: Uuid,
    subscription_status: Option<String>,
    is_admin: Option<bool>,
}

impl<'r> FromRow<'r, sqlx::postgres::PgRow> for CompanyRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(CompanyRow {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            schedule: row.try_get("schedule")?,
            owner_id: row.try_get("owner_id")?,
            subscription_status: row.try_get("subscription_status")?,
            is_admin: row.try_get("is_admin")?,
        })
    }
}

impl CompanyRow {
    fn into_company(self, competitors: Vec<Competitor>) -> Result<Company, RepositoryError> {
        // Missing schedule means the default daily report.
        let schedule = match self.schedule {
            Some(value) => serde_json::from_value::<ReportSchedule>(value)
                .map_err(|e| RepositoryError::Corrupt(format!("company {} schedule: {e}", self.id)))?,
            None => ReportSchedule::default(),
        };
        Ok(Company {
            id: CompanyId::from_uuid(self.id),
            name: self.name,
            owner: Owner {
                id: UserId::from_uuid(self.owner_id),
                subscription_status: self.subscription_status,
                is_admin: self.is_admin.unwrap_or(false),
            },
            competitors,
            schedule,
        })
    }
}
