//! Failure classification and retry backoff for dead-lettered jobs.
//!
//! Classification is a keyword heuristic over the error text. Rules are
//! evaluated in table order and the first category with a matching keyword
//! wins.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Why a job failed, as far as the error text tells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClassification {
    Transient,
    Resource,
    Configuration,
    Permanent,
    CircuitOpen,
    Timeout,
    Dependency,
}

impl FailureClassification {
    pub const ALL: [FailureClassification; 7] = [
        FailureClassification::Transient,
        FailureClassification::Resource,
        FailureClassification::Configuration,
        FailureClassification::Permanent,
        FailureClassification::CircuitOpen,
        FailureClassification::Timeout,
        FailureClassification::Dependency,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClassification::Transient => "transient",
            FailureClassification::Resource => "resource",
            FailureClassification::Configuration => "configuration",
            FailureClassification::Permanent => "permanent",
            FailureClassification::CircuitOpen => "circuit_open",
            FailureClassification::Timeout => "timeout",
            FailureClassification::Dependency => "dependency",
        }
    }

    /// Operator-facing description of what the failure needs.
    pub fn message(&self) -> &'static str {
        match self {
            FailureClassification::Transient => {
                "Transient failure, safe to retry automatically"
            }
            FailureClassification::Resource => {
                "Resource exhaustion, retry once capacity recovers"
            }
            FailureClassification::Configuration => {
                "Configuration error, requires a manual fix before retrying"
            }
            FailureClassification::Permanent => {
                "Permanent failure, retrying will not help without manual review"
            }
            FailureClassification::CircuitOpen => {
                "Circuit breaker open, retry after the downstream service recovers"
            }
            FailureClassification::Timeout => "Operation timed out, retry with a longer delay",
            FailureClassification::Dependency => {
                "External dependency unavailable, retry later"
            }
        }
    }

    /// Delay before the first automatic retry; grows with attempts.
    pub fn base_retry_delay(&self) -> Duration {
        let minutes = match self {
            FailureClassification::Transient => 1,
            FailureClassification::Timeout => 2,
            FailureClassification::Dependency => 3,
            FailureClassification::Resource => 5,
            FailureClassification::CircuitOpen => 5,
            FailureClassification::Configuration => 5,
            FailureClassification::Permanent => 5,
        };
        Duration::from_secs(minutes * 60)
    }
}

impl fmt::Display for FailureClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureClassification {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown failure classification: {s}"))
    }
}

/// Keyword rules in priority order.
pub const CLASSIFICATION_RULES: &[(FailureClassification, &[&str])] = &[
    (
        FailureClassification::Transient,
        &[
            "econnreset",
            "connection reset",
            "socket hang up",
            "temporarily",
            "try again",
            "deadlock",
            "serialization failure",
            "network",
        ],
    ),
    (
        FailureClassification::Resource,
        &[
            "out of memory",
            "enomem",
            "no space left",
            "disk full",
            "quota exceeded",
            "rate limit",
            "too many requests",
            "resource exhausted",
            "insufficient budget",
        ],
    ),
    (
        FailureClassification::Configuration,
        &[
            "api key",
            "unauthorized",
            "forbidden",
            "invalid credentials",
            "permission denied",
            "not configured",
            "missing environment",
            "configuration",
        ],
    ),
    (
        FailureClassification::CircuitOpen,
        &["circuit breaker", "circuit open", "circuit is open", "breaker open"],
    ),
    (
        FailureClassification::Timeout,
        &["timed out", "timeout", "etimedout", "deadline exceeded"],
    ),
    (
        FailureClassification::Dependency,
        &[
            "econnrefused",
            "connection refused",
            "service unavailable",
            "bad gateway",
            "enotfound",
            "dns",
            "upstream",
        ],
    ),
];

/// Attempts at or above which an unrecognised error is treated as permanent.
pub const PERMANENT_AFTER_ATTEMPTS: u32 = 3;

/// Classify an error by its text and the attempts already made.
pub fn classify_failure(error: &str, attempts_made: u32) -> FailureClassification {
    let haystack = error.to_lowercase();
    CLASSIFICATION_RULES
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|k| haystack.contains(k)))
        .map(|(classification, _)| *classification)
        .unwrap_or(if attempts_made >= PERMANENT_AFTER_ATTEMPTS {
            FailureClassification::Permanent
        } else {
            FailureClassification::Transient
        })
}

/// Whether the dead letter queue may retry an entry automatically.
pub fn can_job_be_retried(
    classification: FailureClassification,
    retry_count: u32,
    max_retries: u32,
) -> bool {
    match classification {
        FailureClassification::Permanent | FailureClassification::Configuration => false,
        _ => retry_count < max_retries,
    }
}

const MAX_BACKOFF_EXPONENT: u32 = 5;
pub const JITTER_MIN: f64 = 0.8;
pub const JITTER_MAX: f64 = 1.2;

/// `base * 2^min(attempts, 5) * jitter`.
pub fn retry_delay(classification: FailureClassification, attempts: u32, jitter: f64) -> Duration {
    let factor = 2_u32.pow(attempts.min(MAX_BACKOFF_EXPONENT));
    classification
        .base_retry_delay()
        .mul_f64(f64::from(factor) * jitter.clamp(JITTER_MIN, JITTER_MAX))
}

/// [`retry_delay`] with random jitter in `[0.8, 1.2]`.
pub fn next_retry_delay(classification: FailureClassification, attempts: u32) -> Duration {
    let jitter = rand::thread_rng().gen_range(JITTER_MIN..=JITTER_MAX);
    retry_delay(classification, attempts, jitter)
}
