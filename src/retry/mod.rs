//! Retry policy with exponential backoff.
//!
//! Attempts that fail with a permanent error are not retried. Everything else
//! (transient and unknown failures) is retried up to the configured attempt
//! count, sleeping `base_delay * 2^(attempt - 1)` between attempts.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::classification::FailureType;
use crate::error::{RetryError, TaskError};

/// Retry settings for task execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum attempts per task, including the first one.
    /// Default: 3
    pub max_attempts: u32,

    /// Delay before the first retry, in milliseconds. Doubles per retry.
    /// Default: 30000 (30 seconds)
    pub base_delay_ms: u64,

    /// When false every task gets exactly one attempt.
    /// Default: true
    pub enabled: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 30_000,
            enabled: true,
        }
    }
}

impl RetryConfig {
    /// Creates a new RetryConfig with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an enabled RetryConfig with custom values.
    pub fn with_values(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay_ms: base_delay.as_millis() as u64,
            enabled: max_attempts > 0,
        }
    }

    /// A policy that never retries.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Sets the maximum number of attempts.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Sets the base backoff delay.
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Attempts that will actually be made. Never less than one.
    pub fn effective_attempts(&self) -> u32 {
        if self.enabled {
            self.max_attempts.max(1)
        } else {
            1
        }
    }

    /// Delay slept after the given failed attempt (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        backoff_delay(self.base_delay(), attempt)
    }

    /// Run `operation` under this policy.
    pub async fn run<T, F, Fut>(&self, task_id: &str, operation: F) -> Result<Retried<T>, RetryError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, TaskError>>,
    {
        execute_with_retry(task_id, self.effective_attempts(), self.base_delay(), operation).await
    }
}

/// Successful value together with the number of attempts it took.
#[derive(Debug, Clone, PartialEq)]
pub struct Retried<T> {
    pub value: T,
    pub attempts: u32,
}

impl<T> Retried<T> {
    /// Attempts consumed beyond the first.
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// `base * 2^(attempt - 1)`, saturating.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    base.saturating_mul(1u32 << exponent)
}

/// Run `operation` until it succeeds, fails permanently, or runs out of attempts.
///
/// `operation` receives the 1-based attempt number. On exhaustion the last
/// error is returned inside a [`RetryError`] that records how many attempts
/// were made.
///
/// # Arguments
///
/// * `task_id` - Task the attempts belong to, used for logging and the error
/// * `max_attempts` - Upper bound on attempts; zero is treated as one
/// * `base_delay` - Delay after the first failed attempt
/// * `operation` - Produces one attempt's future
pub async fn execute_with_retry<T, F, Fut>(
    task_id: &str,
    max_attempts: u32,
    base_delay: Duration,
    mut operation: F,
) -> Result<Retried<T>, RetryError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, TaskError>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match operation(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!(task_id, attempt, "Task succeeded after retry");
                }
                return Ok(Retried {
                    value,
                    attempts: attempt,
                });
            }
            Err(err) => {
                let failure_type = err.classify();

                if failure_type == FailureType::Permanent {
                    tracing::warn!(
                        task_id,
                        attempt,
                        error = %err,
                        "Permanent failure, not retrying"
                    );
                    return Err(RetryError {
                        task_id: task_id.to_string(),
                        attempts: attempt,
                        failure_type,
                        source: err,
                    });
                }

                if attempt >= max_attempts {
                    tracing::error!(
                        task_id,
                        attempts = attempt,
                        %failure_type,
                        error = %err,
                        "Retry attempts exhausted"
                    );
                    return Err(RetryError {
                        task_id: task_id.to_string(),
                        attempts: attempt,
                        failure_type,
                        source: err,
                    });
                }

                let delay = backoff_delay(base_delay, attempt);
                tracing::warn!(
                    task_id,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    %failure_type,
                    error = %err,
                    "Attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
