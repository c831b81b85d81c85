//! Queue worker with bounded concurrency, retry bookkeeping, and dead-letter hand-off.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::sync::{broadcast, watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use super::events::QueueEvent;
use super::queue::{JobQueue, QueueError};
use super::types::{FailOutcome, Job};

/// Handler for one or more job names.
///
/// The error text is what the dead letter queue classifies, so include the
/// underlying cause (`anyhow` context chains are flattened with `{:#}`).
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> anyhow::Result<()>;
}

/// Receives jobs that exhausted their queue-native attempts.
#[async_trait]
pub trait FailedJobSink: Send + Sync {
    async fn capture(&self, job: &Job, error: &str) -> anyhow::Result<()>;
}

/// Notified on every failed attempt, retrying or not.
#[async_trait]
pub trait FailureObserver: Send + Sync {
    async fn on_failed(&self, job: &Job, error: &str, outcome: FailOutcome);
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Name for logging
    pub name: String,
    /// Maximum concurrent jobs
    pub concurrency: usize,
    /// How often to poll an empty queue
    pub poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "worker".to_string(),
            concurrency: 1,
            poll_interval: Duration::from_millis(500),
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct WorkerStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_exhausted: u64,
    pub current_running: usize,
}

#[derive(Debug, Default)]
struct StatsCounters {
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    exhausted: AtomicU64,
    running: AtomicUsize,
}

impl StatsCounters {
    fn snapshot(&self) -> WorkerStats {
        WorkerStats {
            jobs_processed: self.processed.load(Ordering::Relaxed),
            jobs_succeeded: self.succeeded.load(Ordering::Relaxed),
            jobs_failed: self.failed.load(Ordering::Relaxed),
            jobs_exhausted: self.exhausted.load(Ordering::Relaxed),
            current_running: self.running.load(Ordering::Relaxed),
        }
    }
}

/// Handle to control a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    name: String,
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
    stats: Arc<StatsCounters>,
}

impl WorkerHandle {
    /// Stop claiming new jobs and wait for in-flight ones to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            error!(worker = %self.name, error = %e, "worker task ended abnormally");
        }
    }

    /// Get current worker statistics.
    pub fn stats(&self) -> WorkerStats {
        self.stats.snapshot()
    }
}

/// Background worker for one queue.
///
/// Claims jobs, routes them by name to registered handlers, records the
/// outcome on the queue, broadcasts a [`QueueEvent`], and hands jobs that
/// exhausted their attempts to the dead-letter sink.
pub struct Worker {
    queue: Arc<dyn JobQueue>,
    handlers: HashMap<String, Arc<dyn JobHandler>>,
    dead_letter: Option<Arc<dyn FailedJobSink>>,
    observers: Vec<Arc<dyn FailureObserver>>,
    events: broadcast::Sender<QueueEvent>,
    config: WorkerConfig,
    stats: Arc<StatsCounters>,
}

impl Worker {
    pub fn new(queue: Arc<dyn JobQueue>, config: WorkerConfig) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            queue,
            handlers: HashMap::new(),
            dead_letter: None,
            observers: Vec::new(),
            events,
            config,
            stats: Arc::new(StatsCounters::default()),
        }
    }

    /// Register a handler for a job name, or `"*"` for any name.
    pub fn register_handler(&mut self, name: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    pub fn with_dead_letter(mut self, sink: Arc<dyn FailedJobSink>) -> Self {
        self.dead_letter = Some(sink);
        self
    }

    pub fn with_failure_observer(mut self, observer: Arc<dyn FailureObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Publish events on an existing channel so several workers share one stream.
    pub fn with_events(mut self, events: broadcast::Sender<QueueEvent>) -> Self {
        self.events = events;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.snapshot()
    }

    fn handler_for(&self, name: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers
            .get(name)
            .or_else(|| self.handlers.get("*"))
            .cloned()
    }

    /// Claim and process a single job. Returns whether a job was processed.
    pub async fn run_next(&self) -> Result<bool, QueueError> {
        match self.queue.claim_next().await? {
            Some(job) => {
                self.process(job).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Process jobs until the queue has nothing claimable.
    pub async fn drain(&self) -> Result<usize, QueueError> {
        let mut processed = 0;
        while self.run_next().await? {
            processed += 1;
        }
        Ok(processed)
    }

    async fn process(&self, job: Job) {
        self.stats.running.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();

        debug!(
            worker = %self.config.name,
            job_id = %job.id,
            job_name = %job.name,
            attempt = job.attempts_made,
            "claimed job"
        );

        let result = match self.handler_for(&job.name) {
            None => Err(anyhow!("no handler registered for job {}", job.name)),
            Some(handler) => {
                // Run on its own task so a panicking handler becomes a failure.
                let task_job = job.clone();
                match tokio::spawn(async move { handler.handle(&task_job).await }).await {
                    Ok(result) => result,
                    Err(e) => Err(anyhow!("job handler panicked: {e}")),
                }
            }
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        self.stats.processed.fetch_add(1, Ordering::Relaxed);

        match result {
            Ok(()) => self.on_success(job, duration_ms).await,
            Err(e) => self.on_failure(job, format!("{e:#}"), duration_ms).await,
        }

        self.stats.running.fetch_sub(1, Ordering::Relaxed);
    }

    async fn on_success(&self, job: Job, duration_ms: u64) {
        self.stats.succeeded.fetch_add(1, Ordering::Relaxed);

        if let Err(e) = self.queue.complete(job.id).await {
            error!(worker = %self.config.name, job_id = %job.id, error = %e, "failed to mark job completed");
            return;
        }

        debug!(worker = %self.config.name, job_id = %job.id, duration_ms, "job completed");
        let _ = self.events.send(QueueEvent::Completed {
            queue: job.queue,
            job_id: job.id,
            name: job.name,
            payload: job.payload,
        });
    }

    async fn on_failure(&self, job: Job, error: String, duration_ms: u64) {
        self.stats.failed.fetch_add(1, Ordering::Relaxed);

        let (job, outcome) = match self.queue.fail(job.id, &error).await {
            Ok(pair) => pair,
            Err(e) => {
                error!(worker = %self.config.name, job_id = %job.id, error = %e, "failed to record job failure");
                return;
            }
        };

        let exhausted = outcome == FailOutcome::Exhausted;
        if exhausted {
            self.stats.exhausted.fetch_add(1, Ordering::Relaxed);
            warn!(
                worker = %self.config.name,
                job_id = %job.id,
                job_name = %job.name,
                attempts = job.attempts_made,
                duration_ms,
                error = %error,
                "job failed, attempts exhausted"
            );
        } else {
            info!(
                worker = %self.config.name,
                job_id = %job.id,
                job_name = %job.name,
                attempt = job.attempts_made,
                duration_ms,
                error = %error,
                "job failed, will retry"
            );
        }

        for observer in &self.observers {
            observer.on_failed(&job, &error, outcome).await;
        }

        if exhausted {
            if let Some(sink) = &self.dead_letter {
                if let Err(e) = sink.capture(&job, &error).await {
                    error!(worker = %self.config.name, job_id = %job.id, error = %format!("{e:#}"), "dead letter capture failed");
                }
            }
        }

        let _ = self.events.send(QueueEvent::Failed {
            queue: job.queue,
            job_id: job.id,
            name: job.name,
            payload: job.payload,
            error,
            attempts_made: job.attempts_made,
            exhausted,
        });
    }

    /// Spawn the polling loop on the current runtime.
    pub fn spawn(self) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let name = self.config.name.clone();
        let stats = self.stats.clone();
        let worker = Arc::new(self);
        let join = tokio::spawn(worker_loop(worker, shutdown_rx));

        WorkerHandle {
            name,
            shutdown: shutdown_tx,
            join,
            stats,
        }
    }
}

async fn worker_loop(worker: Arc<Worker>, mut shutdown: watch::Receiver<bool>) {
    let name = worker.config.name.clone();
    let semaphore = Arc::new(Semaphore::new(worker.config.concurrency.max(1)));
    let mut in_flight = JoinSet::new();

    info!(worker = %name, queue = worker.queue.name(), concurrency = worker.config.concurrency, "worker started");

    loop {
        while in_flight.try_join_next().is_some() {}

        let permit = tokio::select! {
            _ = shutdown.changed() => break,
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        match worker.queue.claim_next().await {
            Ok(Some(job)) => {
                let worker = worker.clone();
                in_flight.spawn(async move {
                    worker.process(job).await;
                    drop(permit);
                });
            }
            Ok(None) => {
                drop(permit);
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(worker.config.poll_interval) => {}
                }
            }
            Err(e) => {
                drop(permit);
                error!(worker = %name, error = %e, "failed to claim job");
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(worker.config.poll_interval) => {}
                }
            }
        }
    }

    while in_flight.join_next().await.is_some() {}
    info!(worker = %name, "worker stopped");
}
