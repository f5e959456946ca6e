use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use taskloom::{execute_with_retry, FailureType, RetryConfig, TaskError, TaskStatus};
use tokio_test::{assert_err, assert_ok};

use crate::common::{orchestrator, tasks, ScriptedClient};

#[tokio::test]
async fn test_permanent_failure_makes_one_attempt() {
    let client = ScriptedClient::new();
    let tasks = tasks(&[("T", "invalid", &[])]);
    let retry = RetryConfig::with_values(5, Duration::from_millis(10));
    let orchestrator = orchestrator(client.clone(), 1, retry, &tasks);

    let outcomes = assert_ok!(orchestrator.orchestrate(tasks).await);
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].status, TaskStatus::Failed);
    assert_eq!(client.attempts("T"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_back_off_then_succeed() {
    let client = ScriptedClient::new();
    let tasks = tasks(&[("T", "flaky:2", &[])]);
    let retry = RetryConfig::with_values(3, Duration::from_millis(10));
    let orchestrator = orchestrator(client.clone(), 1, retry, &tasks);

    let outcomes = assert_ok!(orchestrator.orchestrate(tasks).await);
    assert_eq!(outcomes[0].status, TaskStatus::Completed);
    assert_eq!(outcomes[0].retry_count, 2);

    let times = client.attempt_times("T");
    assert_eq!(times.len(), 3);
    let first_gap = times[1] - times[0];
    let second_gap = times[2] - times[1];
    assert!(first_gap >= Duration::from_millis(10) && first_gap < Duration::from_millis(15));
    assert!(second_gap >= Duration::from_millis(20) && second_gap < Duration::from_millis(25));
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_report_attempts() {
    let client = ScriptedClient::new();
    let tasks = tasks(&[("T", "flaky:9", &[])]);
    let retry = RetryConfig::with_values(3, Duration::from_millis(10));
    let orchestrator = orchestrator(client.clone(), 1, retry, &tasks);

    let outcomes = assert_ok!(orchestrator.orchestrate(tasks).await);
    let outcome = &outcomes[0];
    assert_eq!(outcome.status, TaskStatus::Failed);
    assert_eq!(outcome.retry_count, 2);
    let error = outcome.error.as_deref().unwrap();
    assert!(error.contains("after 3 attempt(s)"), "{}", error);
    assert!(error.contains("Connection timeout"), "{}", error);
    assert_eq!(client.attempts("T"), 3);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_errors_are_retried() {
    let calls = AtomicU32::new(0);
    let err = assert_err!(
        execute_with_retry("mystery", 4, Duration::from_millis(5), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(TaskError::message("something odd happened")) }
        })
        .await
    );
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(err.attempts, 4);
    assert_eq!(err.failure_type, FailureType::Unknown);
}
