//! Postgres-backed job queue.
//!
//! All queues share one `jobs` table, partitioned by the `queue` column.
//! Claims use `FOR UPDATE SKIP LOCKED`, so any number of worker processes can
//! poll the same queue without handing a job to two of them.
//!
//! Options and attempt history are stored as JSONB; state transitions are
//! computed by [`Job`] inside a row-locking transaction.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::instrument;
use uuid::Uuid;

use super::queue::{JobQueue, QueueCounts, QueueError};
use super::types::{FailOutcome, Job, JobId, JobOptions, JobStatus};

const JOB_COLUMNS: &str = "id, queue, name, payload, options, status, attempts_made, \
     created_at, scheduled_at, started_at, finished_at, failed_reason, history";

#[derive(Debug, Clone)]
pub struct PostgresJobQueue {
    pool: PgPool,
    name: String,
}

impl PostgresJobQueue {
    pub fn new(pool: PgPool, name: impl Into<String>) -> Self {
        Self {
            pool,
            name: name.into(),
        }
    }

    async fn lock_job(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: JobId,
    ) -> Result<Job, QueueError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1 AND queue = $2 FOR UPDATE");
        let row = sqlx::query(&sql)
            .bind(id.0)
            .bind(&self.name)
            .fetch_optional(&mut **tx)
            .await?
            .ok_or(QueueError::NotFound(id))?;
        Ok(JobRow::from_row(&row)?.into_job()?)
    }

    async fn store_transition(
        tx: &mut Transaction<'_, Postgres>,
        job: &Job,
    ) -> Result<(), QueueError> {
        sqlx::query(
            "UPDATE jobs
             SET status = $2, attempts_made = $3, scheduled_at = $4, started_at = $5,
                 finished_at = $6, failed_reason = $7, history = $8
             WHERE id = $1",
        )
        .bind(job.id.0)
        .bind(job.status.as_str())
        .bind(job.attempts_made as i32)
        .bind(job.scheduled_at)
        .bind(job.started_at)
        .bind(job.finished_at)
        .bind(&job.failed_reason)
        .bind(to_json(&job.history)?)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl JobQueue for PostgresJobQueue {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self, payload, options), fields(queue = %self.name), err)]
    async fn add(
        &self,
        name: &str,
        payload: serde_json::Value,
        options: JobOptions,
    ) -> Result<Job, QueueError> {
        let job = Job::new(self.name.clone(), name, payload, options);

        sqlx::query(
            "INSERT INTO jobs (id, queue, name, payload, options, status, attempts_made,
                               priority, created_at, scheduled_at, history)
             VALUES ($1, $2, $3, $4, $5, $6, 0, $7, $8, $9, '[]'::jsonb)",
        )
        .bind(job.id.0)
        .bind(&job.queue)
        .bind(&job.name)
        .bind(&job.payload)
        .bind(to_json(&job.options)?)
        .bind(job.status.as_str())
        .bind(job.options.priority)
        .bind(job.created_at)
        .bind(job.scheduled_at)
        .execute(&self.pool)
        .await?;

        Ok(job)
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, QueueError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1 AND queue = $2");
        let row = sqlx::query(&sql)
            .bind(id.0)
            .bind(&self.name)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| JobRow::from_row(&row)?.into_job()).transpose()
    }

    #[instrument(skip(self), fields(queue = %self.name), err)]
    async fn claim_next(&self) -> Result<Option<Job>, QueueError> {
        let sql = format!(
            "UPDATE jobs
             SET status = 'running', attempts_made = attempts_made + 1, started_at = $2
             WHERE id = (
                 SELECT id FROM jobs
                 WHERE queue = $1 AND status = 'pending' AND scheduled_at <= $2
                 ORDER BY priority DESC, scheduled_at ASC, created_at ASC
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING {JOB_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(&self.name)
            .bind(Utc::now())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| JobRow::from_row(&row)?.into_job()).transpose()
    }

    #[instrument(skip(self), fields(queue = %self.name), err)]
    async fn complete(&self, id: JobId) -> Result<Job, QueueError> {
        let mut tx = self.pool.begin().await?;
        let mut job = self.lock_job(&mut tx, id).await?;
        if job.status != JobStatus::Running {
            return Err(QueueError::NotRunning {
                id,
                status: job.status,
            });
        }
        job.mark_completed();
        Self::store_transition(&mut tx, &job).await?;
        tx.commit().await?;
        Ok(job)
    }

    #[instrument(skip(self, error), fields(queue = %self.name), err)]
    async fn fail(&self, id: JobId, error: &str) -> Result<(Job, FailOutcome), QueueError> {
        let mut tx = self.pool.begin().await?;
        let mut job = self.lock_job(&mut tx, id).await?;
        if job.status != JobStatus::Running {
            return Err(QueueError::NotRunning {
                id,
                status: job.status,
            });
        }
        let outcome = job.mark_failed(error.to_string());
        Self::store_transition(&mut tx, &job).await?;
        tx.commit().await?;
        Ok((job, outcome))
    }

    async fn remove(&self, id: JobId) -> Result<bool, QueueError> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = $1 AND queue = $2 AND status <> 'running'")
            .bind(id.0)
            .bind(&self.name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn counts(&self) -> Result<QueueCounts, QueueError> {
        let rows = sqlx::query(
            "SELECT CASE
                        WHEN status = 'pending' AND scheduled_at > NOW() THEN 'delayed'
                        ELSE status
                    END AS state,
                    COUNT(*) AS n
             FROM jobs
             WHERE queue = $1
             GROUP BY 1",
        )
        .bind(&self.name)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = QueueCounts::default();
        for row in rows {
            let state: String = row.try_get("state")?;
            let n = row.try_get::<i64, _>("n")? as usize;
            match state.as_str() {
                "pending" => counts.waiting = n,
                "delayed" => counts.delayed = n,
                "running" => counts.active = n,
                "completed" => counts.completed = n,
                "failed" => counts.failed = n,
                _ => {}
            }
        }
        Ok(counts)
    }
}

fn corrupt(id: Uuid, what: &str, e: impl std::fmt::Display) -> QueueError {
    QueueError::Storage(format!("corrupt job {id} ({what}): {e}"))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, QueueError> {
    serde_json::to_value(value).map_err(|e| QueueError::Storage(e.to_string()))
}

struct JobRow {
    id: Uuid,
    queue: String,
    name: String,
    payload: serde_json::Value,
    options: serde_json::Value,
    status: String,
    attempts_made: i32,
    created_at: chrono::DateTime<Utc>,
    scheduled_at: chrono::DateTime<Utc>,
    started_at: Option<chrono::DateTime<Utc>>,
    finished_at: Option<chrono::DateTime<Utc>>,
    failed_reason: Option<String>,
    history: serde_json::Value,
}

impl<'r> FromRow<'r, sqlx::postgres::PgRow> for JobRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            queue: row.try_get("queue")?,
            name: row.try_get("name")?,
            payload: row.try_get("payload")?,
            options: row.try_get("options")?,
            status: row.try_get("status")?,
            attempts_made: row.try_get("attempts_made")?,
            created_at: row.try_get("created_at")?,
            scheduled_at: row.try_get("scheduled_at")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
            failed_reason: row.try_get("failed_reason")?,
            history: row.try_get("history")?,
        })
    }
}

impl JobRow {
    fn into_job(self) -> Result<Job, QueueError> {
        let id = self.id;
        let options = serde_json::from_value(self.options).map_err(|e| corrupt(id, "options", e))?;
        let history = serde_json::from_value(self.history).map_err(|e| corrupt(id, "history", e))?;
        let status = self.status.parse::<JobStatus>().map_err(|e| corrupt(id, "status", e))?;

        Ok(Job {
            id: JobId(self.id),
            queue: self.queue,
            name: self.name,
            payload: self.payload,
            options,
            status,
            attempts_made: self.attempts_made.max(0) as u32,
            created_at: self.created_at,
            scheduled_at: self.scheduled_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            failed_reason: self.failed_reason,
            history,
        })
    }
}
