//! Failure classification for retry decisions.

use std::io;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::TaskError;

/// How likely a failed attempt is to succeed if retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureType {
    /// Timeouts, connectivity, throttling. Expected to recover.
    Transient,
    /// Validation or authorization problems. Retrying will not help.
    Permanent,
    /// No signal either way; retried like a transient failure.
    Unknown,
}

impl FailureType {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FailureType::Permanent)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureType::Transient => "transient",
            FailureType::Permanent => "permanent",
            FailureType::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for FailureType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

const TRANSIENT_KEYWORDS: &[&str] = &[
    "timeout",
    "timed out",
    "connection",
    "network",
    "temporary",
    "temporarily",
    "rate limit",
    "too many requests",
    "service unavailable",
    "try again",
];

const PERMANENT_KEYWORDS: &[&str] = &[
    "invalid",
    "unauthorized",
    "forbidden",
    "not found",
    "bad request",
    "permission denied",
];

static TRANSIENT_STATUS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:429|5\d{2})\b").expect("transient status pattern is valid")
});

static PERMANENT_STATUS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b4\d{2}\b").expect("permanent status pattern is valid"));

/// Classify an attempt error.
///
/// Errors that carry their own classification win, then transient I/O kinds,
/// then keyword matching on the message. Transient keywords are checked before
/// permanent ones so that "429 Too Many Requests" stays retryable.
pub fn classify(error: &TaskError) -> FailureType {
    match error {
        TaskError::Retryable { failure_type, .. } => *failure_type,
        TaskError::Timeout(_) => FailureType::Transient,
        TaskError::Io(io_err) if is_transient_io(io_err.kind()) => FailureType::Transient,
        other => classify_message(&other.to_string()),
    }
}

/// Classify a bare error message.
pub fn classify_message(message: &str) -> FailureType {
    let lowered = message.to_lowercase();

    if TRANSIENT_KEYWORDS.iter().any(|kw| lowered.contains(kw))
        || TRANSIENT_STATUS.is_match(&lowered)
    {
        return FailureType::Transient;
    }

    if PERMANENT_KEYWORDS.iter().any(|kw| lowered.contains(kw))
        || PERMANENT_STATUS.is_match(&lowered)
    {
        return FailureType::Permanent;
    }

    FailureType::Unknown
}

fn is_transient_io(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::TimedOut
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
    )
}
