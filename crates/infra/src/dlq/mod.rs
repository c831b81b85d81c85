//! Dead letter queue for jobs that exhausted their queue-native attempts.
//!
//! ```text
//! capture ──classify──▶ retryable ──▶ ScheduledRetry ──dlq-retry job──▶ Retried
//!                   │                                                  (origin queue,
//!                   └─▶ not retryable ──▶ Pending (manual review)       fewer attempts)
//! ```
//!
//! A re-submitted job carries `retry_of`, so if it fails again the original
//! entry is updated instead of a new one being created.

pub mod classification;
pub mod postgres;
pub mod service;
pub mod store;
pub mod types;

pub use classification::{
    can_job_be_retried, classify_failure, next_retry_delay, retry_delay, FailureClassification,
    CLASSIFICATION_RULES,
};
pub use postgres::PostgresFailedJobStore;
pub use service::{build_worker, DeadLetterQueueService, DlqRetryPayload, DLQ_QUEUE, DLQ_RETRY_JOB};
pub use store::{DeadLetterError, FailedJobStore, InMemoryFailedJobStore};
pub use types::{
    BulkRetryCriteria, BulkRetryItem, BulkRetryResult, DlqHealth, FailedJobData, FailedJobFilter,
    FailedJobId, FailedJobMetadata, FailedJobPage, FailedJobQuery, FailedJobSort, FailedJobState,
    HealthStatus, RecoveryStats, RetryOptions, RetryResult, SortOrder,
};
