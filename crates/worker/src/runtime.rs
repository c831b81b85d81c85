//! Background tasks of the worker process.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use reportflow_infra::backup::{self, BackupScheduler};
use reportflow_infra::config::Settings;
use reportflow_infra::dlq::{self, DeadLetterQueueService};
use reportflow_infra::jobs::{JobQueue, Worker, WorkerConfig, WorkerHandle, WorkerStats};
use reportflow_infra::listener::{ListenerHandle, QueueEventListener};
use reportflow_infra::scheduling::{GenerateReportHandler, ReportScheduler, GENERATE_REPORT_JOB};

use crate::services::Services;

const EVENT_CAPACITY: usize = 1024;

/// Running workers, listener and backup ticker.
pub struct Runtime {
    services: Services,
    scheduler: Arc<ReportScheduler>,
    dead_letter: Arc<DeadLetterQueueService>,
    workers: Vec<(&'static str, WorkerHandle)>,
    listener: ListenerHandle,
    ticker_shutdown: watch::Sender<bool>,
    ticker: JoinHandle<()>,
}

impl Runtime {
    /// Wire the services together and spawn every background task.
    pub fn start(services: Services, settings: &Settings) -> Self {
        let scheduler = Arc::new(
            ReportScheduler::new(
                services.runs.clone(),
                services.companies.clone(),
                services.report_queue.clone(),
                services.billing.clone(),
                services.locks.clone(),
            )
            .with_company_lock_ttl(settings.scheduler.company_lock_ttl),
        );

        let dead_letter = Arc::new(
            DeadLetterQueueService::new(
                services.failed_jobs.clone(),
                services.dlq_queue.clone(),
                services.runs.clone(),
                settings.dlq.clone(),
            )
            .with_origin_queue(services.report_queue.clone()),
        );

        let (events_tx, events_rx) = broadcast::channel(EVENT_CAPACITY);
        let mut report_worker = Worker::new(
            services.report_queue.clone(),
            WorkerConfig::default()
                .with_name("reports")
                .with_concurrency(settings.report_worker_concurrency)
                .with_poll_interval(settings.poll_interval),
        )
        .with_dead_letter(dead_letter.clone())
        .with_events(events_tx);
        report_worker.register_handler(
            GENERATE_REPORT_JOB,
            Arc::new(GenerateReportHandler::new(
                services.runs.clone(),
                services.companies.clone(),
                services.generator.clone(),
            )),
        );
        let listener = QueueEventListener::new(services.runs.clone()).spawn(events_rx);

        let backup_scheduler = Arc::new(BackupScheduler::new(
            services.companies.clone(),
            services.runs.clone(),
            scheduler.clone(),
            services.locks.clone(),
            services.alerts.clone(),
            settings.scheduler.clone(),
        ));

        let workers = vec![
            ("reports", report_worker.spawn()),
            (
                "dead-letter-queue",
                dlq::build_worker(dead_letter.clone(), settings.dlq_poll_interval).spawn(),
            ),
            (
                "backup-scheduler",
                backup::spawn_worker(
                    backup_scheduler,
                    services.backup_queue.clone(),
                    services.alerts.clone(),
                    settings.poll_interval,
                ),
            ),
        ];

        let (ticker_shutdown, ticker_rx) = watch::channel(false);
        let ticker = spawn_backup_ticker(
            services.backup_queue.clone(),
            dead_letter.clone(),
            settings.backup_check_interval,
            ticker_rx,
        );

        info!(
            backend = ?services.backend,
            report_concurrency = settings.report_worker_concurrency,
            backup_every_secs = settings.backup_check_interval.as_secs(),
            "worker runtime started"
        );

        Self {
            services,
            scheduler,
            dead_letter,
            workers,
            listener,
            ticker_shutdown,
            ticker,
        }
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    /// Entry point for queueing reports from this process.
    pub fn scheduler(&self) -> &Arc<ReportScheduler> {
        &self.scheduler
    }

    pub fn dead_letter(&self) -> &Arc<DeadLetterQueueService> {
        &self.dead_letter
    }

    pub fn worker_stats(&self) -> Vec<(&'static str, WorkerStats)> {
        self.workers
            .iter()
            .map(|(name, handle)| (*name, handle.stats()))
            .collect()
    }

    /// Stop the ticker, drain the workers, then stop the listener.
    pub async fn shutdown(self) {
        let _ = self.ticker_shutdown.send(true);
        if let Err(e) = self.ticker.await {
            error!(error = %e, "backup ticker ended abnormally");
        }
        for (name, handle) in self.workers {
            debug!(worker = name, "stopping worker");
            handle.shutdown().await;
        }
        self.listener.shutdown().await;
        info!("worker runtime stopped");
    }
}

/// Queue a backup check now and then every `every`. Old resolved dead
/// letter entries are pruned on the same cadence.
fn spawn_backup_ticker(
    queue: Arc<dyn JobQueue>,
    dead_letter: Arc<DeadLetterQueueService>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every.max(Duration::from_secs(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = interval.tick() => {
                    match backup::enqueue_backup_check(queue.as_ref()).await {
                        Ok(job) => debug!(job_id = %job.id, "backup check queued"),
                        Err(e) => warn!(error = %e, "failed to queue backup check"),
                    }
                    if let Err(e) = dead_letter.cleanup_expired().await {
                        warn!(error = %e, "dead letter cleanup failed");
                    }
                }
            }
        }
    })
}
