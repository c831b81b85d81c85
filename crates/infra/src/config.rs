//! Configuration loading and representation.
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `USE_PERSISTENT_STORES` | `false` | Postgres + Redis instead of in-memory stores |
//! | `DATABASE_URL` | — | Required when persistent stores are enabled |
//! | `REDIS_URL` | `redis://localhost:6379` | Lock backend |
//! | `HTTP_BIND` | `0.0.0.0:8080` | Health endpoint address |
//! | `BACKUP_CHECK_INTERVAL_SECS` | `900` | How often the backup pass is queued |
//! | `REPORT_WORKER_CONCURRENCY` | `2` | Report jobs processed in parallel |
//! | `QUEUE_POLL_INTERVAL_MS` | `500` | Worker polling interval when a queue is empty |
//! | `DLQ_RETRY_POLL_MS` | `1000` | Polling interval of the dead letter retry worker |
//! | `LOG_FORMAT` | `json` | `json` or `pretty`, read by the binary |
//! | `DLQ_DEGRADED_THRESHOLD` | `50` | Backlog size reported as degraded |
//! | `DLQ_MAX_RETRIES` | `3` | Automatic retries from the dead letter queue |

use std::str::FromStr;
use std::time::Duration;

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value {value:?} for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Lock keys and timings used by the scheduling path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerSettings {
    /// Lock held by the primary daily scheduler.
    pub primary_lock_key: String,
    pub backup_lock_key: String,
    pub emergency_lock_key: String,
    pub backup_lock_ttl: Duration,
    pub emergency_lock_ttl: Duration,
    /// Backup pass is skipped while the primary lock has more than this left.
    pub primary_skip_threshold: Duration,
    /// Pending/running runs older than this are considered stuck.
    pub stuck_threshold: Duration,
    /// TTL of the per-company lock around check-then-create.
    pub company_lock_ttl: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            primary_lock_key: "daily-report-scheduler".to_string(),
            backup_lock_key: "backup-report-scheduler".to_string(),
            emergency_lock_key: "emergency-report-trigger".to_string(),
            backup_lock_ttl: Duration::from_secs(20 * 60),
            emergency_lock_ttl: Duration::from_secs(30 * 60),
            primary_skip_threshold: Duration::from_secs(10 * 60),
            stuck_threshold: Duration::from_secs(2 * 60 * 60),
            company_lock_ttl: Duration::from_secs(30),
        }
    }
}

/// Dead letter queue tunables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DlqSettings {
    pub degraded_threshold: usize,
    pub max_retries: u32,
    pub worker_concurrency: usize,
    /// Resolved entries older than this are removed by cleanup.
    pub cleanup_after: Duration,
}

impl Default for DlqSettings {
    fn default() -> Self {
        Self {
            degraded_threshold: 50,
            max_retries: 3,
            worker_concurrency: 2,
            cleanup_after: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

/// Process configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub use_persistent_stores: bool,
    pub database_url: Option<String>,
    pub redis_url: String,
    pub http_bind: String,
    pub backup_check_interval: Duration,
    pub report_worker_concurrency: usize,
    pub poll_interval: Duration,
    pub dlq_poll_interval: Duration,
    pub log_format: String,
    pub scheduler: SchedulerSettings,
    pub dlq: DlqSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            use_persistent_stores: false,
            database_url: None,
            redis_url: "redis://localhost:6379".to_string(),
            http_bind: "0.0.0.0:8080".to_string(),
            backup_check_interval: Duration::from_secs(900),
            report_worker_concurrency: 2,
            poll_interval: Duration::from_millis(500),
            dlq_poll_interval: Duration::from_millis(1000),
            log_format: "json".to_string(),
            scheduler: SchedulerSettings::default(),
            dlq: DlqSettings::default(),
        }
    }
}

impl Settings {
    /// Read settings from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read settings through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Settings::default();

        let use_persistent_stores = match lookup("USE_PERSISTENT_STORES") {
            Some(v) => parse_bool("USE_PERSISTENT_STORES", &v)?,
            None => defaults.use_persistent_stores,
        };

        let database_url = lookup("DATABASE_URL").filter(|v| !v.trim().is_empty());
        if use_persistent_stores && database_url.is_none() {
            return Err(ConfigError::Missing("DATABASE_URL"));
        }

        let report_worker_concurrency: usize = parse_or(
            &lookup,
            "REPORT_WORKER_CONCURRENCY",
            defaults.report_worker_concurrency,
        )?;

        let dlq = DlqSettings {
            degraded_threshold: parse_or(
                &lookup,
                "DLQ_DEGRADED_THRESHOLD",
                defaults.dlq.degraded_threshold,
            )?,
            max_retries: parse_or(&lookup, "DLQ_MAX_RETRIES", defaults.dlq.max_retries)?,
            ..defaults.dlq
        };

        Ok(Self {
            use_persistent_stores,
            database_url,
            redis_url: lookup("REDIS_URL").unwrap_or(defaults.redis_url),
            http_bind: lookup("HTTP_BIND").unwrap_or(defaults.http_bind),
            backup_check_interval: Duration::from_secs(parse_or(
                &lookup,
                "BACKUP_CHECK_INTERVAL_SECS",
                defaults.backup_check_interval.as_secs(),
            )?),
            report_worker_concurrency: report_worker_concurrency.max(1),
            poll_interval: Duration::from_millis(parse_or(
                &lookup,
                "QUEUE_POLL_INTERVAL_MS",
                defaults.poll_interval.as_millis() as u64,
            )?),
            dlq_poll_interval: Duration::from_millis(parse_or(
                &lookup,
                "DLQ_RETRY_POLL_MS",
                defaults.dlq_poll_interval.as_millis() as u64,
            )?),
            log_format: lookup("LOG_FORMAT").unwrap_or(defaults.log_format),
            scheduler: defaults.scheduler,
            dlq,
        })
    }
}

fn parse_or<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(var) {
        Some(value) => value.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
            var,
            reason: e.to_string(),
            value,
        }),
        None => Ok(default),
    }
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            var,
            value: value.to_string(),
            reason: "expected a boolean".to_string(),
        }),
    }
}
