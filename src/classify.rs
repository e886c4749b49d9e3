//! Error classification and retry policy.
//!
//! Raw failure messages from providers and the validator are mapped onto a
//! small taxonomy that drives the engine's retry decisions. Classification is
//! case-insensitive substring matching against three ordered keyword sets;
//! the first matching set wins, checked transient → configuration → permanent.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How many times a transient (or unknown) failure is retried per task.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Configuration-class failures escalate to manual intervention sooner.
pub const CONFIGURATION_MAX_RETRIES: u32 = 2;

/// Upper bound on the exponential backoff between attempts.
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

const TRANSIENT_KEYWORDS: &[&str] = &[
    "timeout",
    "network",
    "rate limit",
    "temporary",
    "unavailable",
    "connection",
    "retry",
];

const CONFIGURATION_KEYWORDS: &[&str] = &[
    "configuration",
    "config",
    "setup",
    "environment",
    "permission",
    "access",
];

const PERMANENT_KEYWORDS: &[&str] = &[
    "not found",
    "invalid",
    "corrupt",
    "missing",
    "failed",
    "fatal error",
    "critical error",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Transient,
    Configuration,
    Permanent,
    Unknown,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Configuration => "configuration",
            ErrorClass::Permanent => "permanent",
            ErrorClass::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

impl ErrorClass {
    /// Whether another attempt is allowed after `attempts` have already run.
    ///
    /// `max_retries` bounds transient/unknown failures; configuration-class
    /// failures are capped at [`CONFIGURATION_MAX_RETRIES`] regardless, and
    /// permanent failures are never retried.
    pub fn should_retry(self, attempts: u32, max_retries: u32) -> bool {
        match self {
            ErrorClass::Permanent => false,
            ErrorClass::Configuration => attempts < CONFIGURATION_MAX_RETRIES,
            ErrorClass::Transient | ErrorClass::Unknown => attempts < max_retries,
        }
    }
}

/// Map a raw failure message onto its class.
pub fn classify(message: &str) -> ErrorClass {
    let haystack = message.to_lowercase();
    let matches = |set: &[&str]| set.iter().any(|kw| haystack.contains(kw));

    if matches(TRANSIENT_KEYWORDS) {
        ErrorClass::Transient
    } else if matches(CONFIGURATION_KEYWORDS) {
        ErrorClass::Configuration
    } else if matches(PERMANENT_KEYWORDS) {
        ErrorClass::Permanent
    } else {
        ErrorClass::Unknown
    }
}

/// Delay before the next attempt: `min(30s, 1s * 2^attempt)`.
///
/// `attempt` is the zero-based index of the attempt that just failed, so the
/// first retry waits one second.
pub fn backoff_delay(attempt: u32) -> Duration {
    let secs = 1u64 << attempt.min(6);
    Duration::from_secs(secs).min(MAX_BACKOFF)
}
