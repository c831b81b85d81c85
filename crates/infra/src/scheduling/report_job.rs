//! The `generate-report` job: payload, options, and handler.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use reportflow_core::{CompanyId, RunId, RunStatus, UserId};

use crate::db::{CompanyRepository, ReportRunRepository};
use crate::external::ReportGenerator;
use crate::jobs::{Job, JobHandler, JobOptions, RetryPolicy};

/// Queue report generation jobs are added to.
pub const REPORT_QUEUE: &str = "report-generation";

pub const GENERATE_REPORT_JOB: &str = "generate-report";

/// Queue-native attempts for a report job.
pub const REPORT_JOB_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateReportPayload {
    pub run_id: RunId,
    pub company_id: CompanyId,
    pub user_id: UserId,
}

/// 3 attempts, 5 s base delay doubling.
pub fn report_job_options() -> JobOptions {
    JobOptions::default()
        .with_attempts(REPORT_JOB_ATTEMPTS)
        .with_backoff(RetryPolicy::exponential(
            Duration::from_secs(5),
            Duration::from_secs(5 * 60),
        ))
}

/// Runs the report pipeline for one run.
pub struct GenerateReportHandler {
    runs: Arc<dyn ReportRunRepository>,
    companies: Arc<dyn CompanyRepository>,
    generator: Arc<dyn ReportGenerator>,
}

impl GenerateReportHandler {
    pub fn new(
        runs: Arc<dyn ReportRunRepository>,
        companies: Arc<dyn CompanyRepository>,
        generator: Arc<dyn ReportGenerator>,
    ) -> Self {
        Self {
            runs,
            companies,
            generator,
        }
    }
}

#[async_trait]
impl JobHandler for GenerateReportHandler {
    async fn handle(&self, job: &Job) -> anyhow::Result<()> {
        let payload: GenerateReportPayload = job.payload_as().context("invalid generate-report payload")?;

        let run = self
            .runs
            .get(payload.run_id)
            .await?
            .with_context(|| format!("report run {} not found", payload.run_id))?;

        // Superseded (stuck) or billing-rejected runs stay failed.
        if run.status.is_terminal() {
            info!(run_id = %run.id, status = %run.status, job_id = %job.id, "run already finished, skipping");
            return Ok(());
        }

        let company = self
            .companies
            .find_with_competitors(payload.company_id)
            .await?
            .with_context(|| format!("company {} not found", payload.company_id))?;

        let run = self
            .runs
            .update_status(
                run.id,
                RunStatus::Running,
                Some(format!("Generating report (attempt {})", job.attempts_made)),
            )
            .await?;

        self.generator.generate(&run, &company).await?;

        // The backup pass may have superseded the run while it was generating.
        let current = self.runs.get(run.id).await?;
        if let Some(current) = current.filter(|r| r.status.is_terminal()) {
            info!(
                run_id = %run.id,
                status = %current.status,
                job_id = %job.id,
                "run finished elsewhere during generation, leaving it as is"
            );
            return Ok(());
        }

        self.runs
            .update_status(run.id, RunStatus::Completed, Some("Report generated".to_string()))
            .await?;

        info!(run_id = %run.id, company_id = %company.id, job_id = %job.id, "report generated");
        Ok(())
    }
}
