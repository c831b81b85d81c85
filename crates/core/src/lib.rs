//! `reportflow-core` — domain building blocks for report scheduling.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).

pub mod company;
pub mod error;
pub mod id;
pub mod report;

pub use company::{Company, Competitor, Owner, ReportSchedule};
pub use error::{DomainError, DomainResult};
pub use id::{CompanyId, RunId, UserId};
pub use report::{day_bounds, ReportRun, RunStatus};
