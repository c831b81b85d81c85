//! Background job queue with retry, backoff, and dead-letter hand-off.
//!
//! ## Design
//!
//! - Jobs live on named queues and are routed to handlers by job name
//! - Queue-native retries with fixed/linear/exponential backoff
//! - Jobs that exhaust their attempts go to a [`FailedJobSink`] (the DLQ)
//! - Workers broadcast [`QueueEvent`]s for run-status reconciliation
//!
//! ## Components
//!
//! - `Job`: Core job abstraction with payload and options
//! - `JobQueue`: Persistence and claiming (in-memory or Postgres)
//! - `Worker`: Polls one queue with bounded concurrency

pub mod events;
pub mod postgres;
pub mod queue;
pub mod types;
pub mod worker;

pub use events::QueueEvent;
pub use postgres::PostgresJobQueue;
pub use queue::{InMemoryJobQueue, JobQueue, QueueCounts, QueueError};
pub use types::{FailOutcome, Job, JobAttemptRecord, JobId, JobOptions, JobStatus, RetryPolicy};
pub use worker::{
    FailedJobSink, FailureObserver, JobHandler, Worker, WorkerConfig, WorkerHandle, WorkerStats,
};
