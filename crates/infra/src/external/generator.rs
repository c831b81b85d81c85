//! The report pipeline itself.

use async_trait::async_trait;
use tracing::info;

use reportflow_core::{Company, ReportRun};

#[async_trait]
pub trait ReportGenerator: Send + Sync {
    async fn generate(&self, run: &ReportRun, company: &Company) -> anyhow::Result<()>;
}

/// Logs instead of generating; the in-memory profile uses it.
#[derive(Debug, Default, Clone)]
pub struct LoggingReportGenerator;

#[async_trait]
impl ReportGenerator for LoggingReportGenerator {
    async fn generate(&self, run: &ReportRun, company: &Company) -> anyhow::Result<()> {
        info!(
            run_id = %run.id,
            company_id = %company.id,
            competitors = company.competitors.len(),
            "generating report"
        );
        Ok(())
    }
}
