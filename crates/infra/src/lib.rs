//! Infrastructure layer: DB, Redis, job queues, and the report job lifecycle.
//!
//! Control flow:
//!
//! ```text
//! ReportScheduler ──add──▶ report queue ──claim──▶ Worker ──▶ GenerateReportHandler
//!                                                    │
//!                                  failed, attempts exhausted
//!                                                    ▼
//!                                      DeadLetterQueueService ──retry──▶ report queue
//!                                                    │
//!                                            not retryable: parked for operators
//! ```

pub mod backup;
pub mod config;
pub mod db;
pub mod dlq;
pub mod external;
pub mod jobs;
pub mod listener;
pub mod lock;
pub mod scheduling;
