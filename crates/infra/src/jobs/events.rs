//! Lifecycle events broadcast by workers.

use serde::Serialize;

use super::types::JobId;

/// Job lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum QueueEvent {
    Completed {
        queue: String,
        job_id: JobId,
        name: String,
        payload: serde_json::Value,
    },
    Failed {
        queue: String,
        job_id: JobId,
        name: String,
        payload: serde_json::Value,
        error: String,
        attempts_made: u32,
        /// No attempts left; the job will not run again on its own.
        exhausted: bool,
    },
}

impl QueueEvent {
    pub fn job_id(&self) -> JobId {
        match self {
            QueueEvent::Completed { job_id, .. } | QueueEvent::Failed { job_id, .. } => *job_id,
        }
    }

    pub fn payload(&self) -> &serde_json::Value {
        match self {
            QueueEvent::Completed { payload, .. } | QueueEvent::Failed { payload, .. } => payload,
        }
    }
}
