//! Report runs: one row per attempted report generation for a company.
//!
//! Runs are an audit trail. This crate never deletes them; status moves
//! forward through `Pending -> Queued/Running -> Completed/Failed`, driven by
//! the scheduler, the worker, and queue-event reconciliation.

use core::str::FromStr;

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::id::{CompanyId, RunId};

/// Lifecycle status of a report run.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    /// Created by the scheduler, job not yet picked up.
    Pending,
    /// A worker is generating the report.
    Running,
    /// Report generated successfully.
    Completed,
    /// Generation (or billing pre-check) failed.
    Failed,
    /// Re-submitted from the dead letter queue, waiting for a worker.
    Queued,
}

impl RunStatus {
    pub const ALL: [RunStatus; 5] = [
        RunStatus::Pending,
        RunStatus::Running,
        RunStatus::Completed,
        RunStatus::Failed,
        RunStatus::Queued,
    ];

    /// Statuses that make a run count as "today's report" for deduplication.
    pub const COUNTS_AS_TODAY: [RunStatus; 3] =
        [RunStatus::Completed, RunStatus::Running, RunStatus::Pending];

    /// Stable storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "PENDING",
            RunStatus::Running => "RUNNING",
            RunStatus::Completed => "COMPLETED",
            RunStatus::Failed => "FAILED",
            RunStatus::Queued => "QUEUED",
        }
    }

    /// In flight: picked up (or about to be) but not finished.
    pub fn is_active(&self) -> bool {
        matches!(self, RunStatus::Pending | RunStatus::Running)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }

    pub fn counts_as_today(&self) -> bool {
        Self::COUNTS_AS_TODAY.contains(self)
    }
}

impl core::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RunStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| DomainError::UnknownStatus(s.to_string()))
    }
}

/// One execution attempt of a company's report generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportRun {
    pub id: RunId,
    pub company_id: CompanyId,
    pub status: RunStatus,
    /// Free-text progress or error message.
    pub step_status: Option<String>,
    /// Identifier of the queue job generating this run.
    pub job_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ReportRun {
    /// A fresh run in `Pending`, as created by the scheduler.
    pub fn pending(company_id: CompanyId) -> Self {
        Self {
            id: RunId::new(),
            company_id,
            status: RunStatus::Pending,
            step_status: Some("Queued for generation".to_string()),
            job_id: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Whether the run was created on the given UTC calendar day.
    pub fn created_on(&self, date: NaiveDate) -> bool {
        self.created_at.date_naive() == date
    }

    /// A run is stuck when it is still pending/running after `threshold`.
    pub fn is_stuck(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        self.status.is_active() && now - self.created_at > threshold
    }

    /// Apply a status transition, stamping `completed_at` on terminal states.
    pub fn transition(&mut self, status: RunStatus, step_status: Option<String>) {
        self.status = status;
        if step_status.is_some() {
            self.step_status = step_status;
        }
        if status.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
    }
}

/// Half-open UTC bounds `[start, end)` of a calendar day.
pub fn day_bounds(date: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = Utc.from_utc_datetime(&date.and_time(chrono::NaiveTime::MIN));
    (start, start + Duration::days(1))
}
