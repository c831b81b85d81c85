//! Report scheduling and the report generation job.

pub mod report_job;
pub mod service;

pub use report_job::{
    report_job_options, GenerateReportHandler, GenerateReportPayload, GENERATE_REPORT_JOB,
    REPORT_JOB_ATTEMPTS, REPORT_QUEUE,
};
pub use service::{
    company_lock_key, InFlightGuard, InFlightSet, QueueOutcome, ReportQueuer, ReportScheduler,
    SchedulingError,
};
