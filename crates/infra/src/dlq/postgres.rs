//! Postgres-backed dead letter store.
//!
//! Filterable fields are stored as columns; the full entry is kept in the
//! `record` JSONB column:
//!
//! ```sql
//! CREATE TABLE failed_jobs (
//!     id UUID PRIMARY KEY,
//!     job_id UUID NOT NULL,
//!     job_name TEXT NOT NULL,
//!     classification TEXT NOT NULL,
//!     can_retry BOOLEAN NOT NULL,
//!     company_id UUID,
//!     state TEXT NOT NULL,
//!     failed_at TIMESTAMPTZ NOT NULL,
//!     updated_at TIMESTAMPTZ NOT NULL,
//!     record JSONB NOT NULL
//! );
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::instrument;

use super::store::{DeadLetterError, FailedJobStore};
use super::types::{FailedJobData, FailedJobFilter, FailedJobId};

#[derive(Debug, Clone)]
pub struct PostgresFailedJobStore {
    pool: PgPool,
}

impl PostgresFailedJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn decode(row: &sqlx::postgres::PgRow) -> Result<FailedJobData, DeadLetterError> {
    let record: serde_json::Value = row.try_get("record")?;
    serde_json::from_value(record)
        .map_err(|e| DeadLetterError::Store(format!("corrupt failed job record: {e}")))
}

#[async_trait]
impl FailedJobStore for PostgresFailedJobStore {
    #[instrument(skip_all, fields(failed_job_id = %entry.id), err)]
    async fn insert(&self, entry: FailedJobData) -> Result<(), DeadLetterError> {
        sqlx::query(
            "INSERT INTO failed_jobs
                 (id, job_id, job_name, classification, can_retry, company_id, state,
                  failed_at, updated_at, record)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(entry.id.0)
        .bind(entry.job_id.0)
        .bind(&entry.job_name)
        .bind(entry.classification.as_str())
        .bind(entry.can_retry)
        .bind(entry.company_id.map(|id| *id.as_uuid()))
        .bind(entry.state.as_str())
        .bind(entry.failed_at)
        .bind(entry.updated_at)
        .bind(serde_json::to_value(&entry)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: FailedJobId) -> Result<Option<FailedJobData>, DeadLetterError> {
        let row = sqlx::query("SELECT record FROM failed_jobs WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(decode).transpose()
    }

    #[instrument(skip_all, fields(failed_job_id = %entry.id, state = entry.state.as_str()), err)]
    async fn update(&self, entry: &FailedJobData) -> Result<(), DeadLetterError> {
        let result = sqlx::query(
            "UPDATE failed_jobs
             SET job_id = $2, classification = $3, can_retry = $4, state = $5,
                 failed_at = $6, updated_at = $7, record = $8
             WHERE id = $1",
        )
        .bind(entry.id.0)
        .bind(entry.job_id.0)
        .bind(entry.classification.as_str())
        .bind(entry.can_retry)
        .bind(entry.state.as_str())
        .bind(entry.failed_at)
        .bind(entry.updated_at)
        .bind(serde_json::to_value(entry)?)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DeadLetterError::NotFound(entry.id));
        }
        Ok(())
    }

    async fn matching(
        &self,
        filter: &FailedJobFilter,
    ) -> Result<Vec<FailedJobData>, DeadLetterError> {
        let states: Vec<&str> = filter.states.iter().map(|s| s.as_str()).collect();
        let rows = sqlx::query(
            "SELECT record FROM failed_jobs
             WHERE ($1::text IS NULL OR classification = $1)
               AND ($2::boolean IS NULL OR can_retry = $2)
               AND ($3::uuid IS NULL OR company_id = $3)
               AND (cardinality($4::text[]) = 0 OR state = ANY($4))
             ORDER BY failed_at ASC, id ASC",
        )
        .bind(filter.classification.map(|c| c.as_str()))
        .bind(filter.can_retry)
        .bind(filter.company_id.map(|id| *id.as_uuid()))
        .bind(&states)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(decode).collect()
    }

    #[instrument(skip(self), err)]
    async fn delete_resolved_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, DeadLetterError> {
        let result = sqlx::query(
            "DELETE FROM failed_jobs
             WHERE state IN ('retried', 'permanent_failure') AND updated_at < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as usize)
    }
}
