//! Keeps report runs in step with report job outcomes.
//!
//! Consumes the worker's [`QueueEvent`] stream. Handling is idempotent, so a
//! replayed or duplicated event leaves the run unchanged.

use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use reportflow_core::{ReportRun, RunStatus};

use crate::db::{ReportRunRepository, RepositoryError};
use crate::jobs::QueueEvent;
use crate::scheduling::{GenerateReportPayload, GENERATE_REPORT_JOB};

pub struct QueueEventListener {
    runs: Arc<dyn ReportRunRepository>,
}

/// Stops a spawned listener.
#[derive(Debug)]
pub struct ListenerHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl ListenerHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.join.await;
    }
}

impl QueueEventListener {
    pub fn new(runs: Arc<dyn ReportRunRepository>) -> Self {
        Self { runs }
    }

    /// Apply one event. Returns the updated run, or `None` when the event
    /// did not change anything.
    pub async fn reconcile(&self, event: &QueueEvent) -> Result<Option<ReportRun>, RepositoryError> {
        let name = match event {
            QueueEvent::Completed { name, .. } | QueueEvent::Failed { name, .. } => name,
        };
        if name != GENERATE_REPORT_JOB {
            return Ok(None);
        }
        let Ok(payload) = serde_json::from_value::<GenerateReportPayload>(event.payload().clone()) else {
            warn!(job_id = %event.job_id(), "report job event without a valid payload");
            return Ok(None);
        };
        let Some(run) = self.runs.get(payload.run_id).await? else {
            warn!(job_id = %event.job_id(), run_id = %payload.run_id, "report job event for unknown run");
            return Ok(None);
        };
        // Billing-rejected and superseded runs keep their final state.
        if run.status.is_terminal() {
            debug!(run_id = %run.id, status = %run.status, "run already finished, event ignored");
            return Ok(None);
        }

        let (status, step) = match event {
            QueueEvent::Completed { .. } => (RunStatus::Completed, "Report generated".to_string()),
            QueueEvent::Failed {
                error,
                attempts_made,
                exhausted: true,
                ..
            } => (
                RunStatus::Failed,
                format!("Failed after {attempts_made} attempts: {error}"),
            ),
            QueueEvent::Failed {
                error,
                attempts_made,
                exhausted: false,
                ..
            } => (
                run.status,
                format!("Attempt {attempts_made} failed, retrying: {error}"),
            ),
        };

        let updated = self.runs.update_status(run.id, status, Some(step)).await?;
        info!(run_id = %updated.id, job_id = %event.job_id(), status = %updated.status, "run reconciled with job outcome");
        Ok(Some(updated))
    }

    /// Consume `events` until shut down or the channel closes.
    pub fn spawn(self, mut events: broadcast::Receiver<QueueEvent>) -> ListenerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let join = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    event = events.recv() => event,
                };
                match event {
                    Ok(event) => {
                        if let Err(e) = self.reconcile(&event).await {
                            warn!(job_id = %event.job_id(), error = %e, "failed to reconcile run");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "queue event listener lagged, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("queue event listener stopped");
        });

        ListenerHandle {
            shutdown: shutdown_tx,
            join,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use reportflow_core::{CompanyId, UserId};

    use super::*;
    use crate::db::InMemoryDatabase;
    use crate::jobs::JobId;

    async fn running_run(db: &InMemoryDatabase) -> (ReportRun, serde_json::Value) {
        let mut run = ReportRun::pending(CompanyId::new());
        run.status = RunStatus::Running;
        db.insert_run(run.clone()).await;
        let payload = serde_json::to_value(GenerateReportPayload {
            run_id: run.id,
            company_id: run.company_id,
            user_id: UserId::new(),
        })
        .unwrap();
        (run, payload)
    }

    fn failed(payload: serde_json::Value, exhausted: bool) -> QueueEvent {
        QueueEvent::Failed {
            queue: "report-generation".to_string(),
            job_id: JobId::new(),
            name: GENERATE_REPORT_JOB.to_string(),
            payload,
            error: "upstream timed out".to_string(),
            attempts_made: 2,
            exhausted,
        }
    }

    #[tokio::test]
    async fn retrying_failure_only_updates_the_step() {
        let db = InMemoryDatabase::arc();
        let (run, payload) = running_run(&db).await;
        let listener = QueueEventListener::new(db.clone());

        let updated = listener.reconcile(&failed(payload, false)).await.unwrap().unwrap();

        assert_eq!(updated.id, run.id);
        assert_eq!(updated.status, RunStatus::Running);
        assert_eq!(
            updated.step_status.as_deref(),
            Some("Attempt 2 failed, retrying: upstream timed out")
        );
    }

    #[tokio::test]
    async fn exhausted_failure_fails_the_run_once() {
        let db = InMemoryDatabase::arc();
        let (_, payload) = running_run(&db).await;
        let listener = QueueEventListener::new(db.clone());
        let event = failed(payload, true);

        let updated = listener.reconcile(&event).await.unwrap().unwrap();
        assert_eq!(updated.status, RunStatus::Failed);
        assert!(updated.completed_at.is_some());
        assert_eq!(
            updated.step_status.as_deref(),
            Some("Failed after 2 attempts: upstream timed out")
        );

        assert_eq!(listener.reconcile(&event).await.unwrap(), None);
    }

    #[tokio::test]
    async fn completion_does_not_revive_a_failed_run() {
        let db = InMemoryDatabase::arc();
        let (run, payload) = running_run(&db).await;
        db.update_status(run.id, RunStatus::Failed, Some("Billing check failed".into()))
            .await
            .unwrap();
        let listener = QueueEventListener::new(db.clone());

        let event = QueueEvent::Completed {
            queue: "report-generation".to_string(),
            job_id: JobId::new(),
            name: GENERATE_REPORT_JOB.to_string(),
            payload,
        };
        assert_eq!(listener.reconcile(&event).await.unwrap(), None);
        assert_eq!(db.get(run.id).await.unwrap().unwrap().status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn other_jobs_are_ignored() {
        let db = InMemoryDatabase::arc();
        let listener = QueueEventListener::new(db);
        let event = QueueEvent::Completed {
            queue: "backup-report-scheduler".to_string(),
            job_id: JobId::new(),
            name: "trigger-backup-daily-reports".to_string(),
            payload: serde_json::json!({}),
        };
        assert_eq!(listener.reconcile(&event).await.unwrap(), None);
    }

    #[tokio::test]
    async fn spawned_listener_applies_broadcast_events() {
        let db = InMemoryDatabase::arc();
        let (run, payload) = running_run(&db).await;
        let (tx, rx) = broadcast::channel(16);
        let handle = QueueEventListener::new(db.clone()).spawn(rx);

        tx.send(QueueEvent::Completed {
            queue: "report-generation".to_string(),
            job_id: JobId::new(),
            name: GENERATE_REPORT_JOB.to_string(),
            payload,
        })
        .unwrap();

        let mut status = RunStatus::Running;
        for _ in 0..50 {
            status = db.get(run.id).await.unwrap().unwrap().status;
            if status == RunStatus::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status, RunStatus::Completed);
        handle.shutdown().await;
    }
}
