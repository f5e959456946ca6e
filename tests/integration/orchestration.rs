use std::collections::HashSet;
use std::io::Write;
use std::time::Duration;

use taskloom::{
    OrchestrationError, OrchestrationState, OutcomeSummary, ProgressMonitor, RetryConfig,
    TaskManifest, TaskStatus,
};
use tokio_test::{assert_err, assert_ok};

use crate::common::{orchestrator, outcome, tasks, ScriptedClient};

// ============================================================================
// Fan-out and ordering
// ============================================================================

#[tokio::test]
async fn test_fan_out_runs_every_task_after_its_prerequisites() {
    let client = ScriptedClient::new();
    let tasks = tasks(&[
        ("a", "ok", &[]),
        ("b", "sleep:5", &["a"]),
        ("c", "sleep:5", &["a"]),
        ("d", "ok", &["b", "c"]),
    ]);
    let orchestrator = orchestrator(client.clone(), 3, RetryConfig::disabled(), &tasks);

    let outcomes = assert_ok!(orchestrator.orchestrate(tasks).await);
    assert_eq!(outcomes.len(), 4);
    assert!(outcomes.iter().all(|o| o.status == TaskStatus::Completed));

    let position = |id: &str| outcomes.iter().position(|o| o.task_id == id).unwrap();
    assert!(position("a") < position("b"));
    assert!(position("a") < position("c"));
    assert!(position("b") < position("d"));
    assert!(position("c") < position("d"));

    for id in ["a", "b", "c", "d"] {
        assert_eq!(client.attempts(id), 1);
    }
    assert_eq!(orchestrator.state(), OrchestrationState::Completed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pool_of_two_never_exceeds_two_busy_agents() {
    let client = ScriptedClient::new();
    let tasks = tasks(&[
        ("t1", "sleep:20", &[]),
        ("t2", "sleep:20", &[]),
        ("t3", "sleep:20", &[]),
        ("t4", "sleep:20", &[]),
        ("t5", "sleep:20", &[]),
    ]);
    let orchestrator = orchestrator(client.clone(), 2, RetryConfig::disabled(), &tasks);

    let outcomes = assert_ok!(orchestrator.orchestrate(tasks).await);
    assert_eq!(outcomes.len(), 5);
    assert!(outcomes.iter().all(|o| o.status.is_terminal()));
    assert!(client.peak_concurrency() <= 2);
    assert_eq!(client.peak_concurrency(), 2);

    let stats = orchestrator.get_stats().await;
    assert_eq!(stats.pool.busy, 0);
    assert_eq!(stats.pool.idle, 2);
    assert_eq!(stats.executor.active_tasks, 0);
}

// ============================================================================
// Partial failure
// ============================================================================

#[tokio::test]
async fn test_failure_never_blocks_independent_or_downstream_work() {
    let client = ScriptedClient::new();
    let tasks = tasks(&[
        ("broken", "invalid", &[]),
        ("downstream", "ok", &["broken"]),
        ("independent", "sleep:5", &[]),
    ]);
    let orchestrator = orchestrator(client.clone(), 2, RetryConfig::new(), &tasks);

    let outcomes = assert_ok!(orchestrator.orchestrate(tasks).await);
    assert_eq!(outcomes.len(), 3);

    let broken = outcome(&outcomes, "broken");
    assert_eq!(broken.status, TaskStatus::Failed);
    assert!(broken.error.as_deref().unwrap().contains("Invalid input"));
    assert_eq!(broken.retry_count, 0);
    assert_eq!(client.attempts("broken"), 1);

    assert!(outcome(&outcomes, "downstream").is_success());
    assert!(outcome(&outcomes, "independent").is_success());

    let summary = OutcomeSummary::from_outcomes(&outcomes);
    assert_eq!(summary.total, 3);
    assert_eq!(summary.failed, 1);
}

#[tokio::test]
async fn test_critical_failure_stops_the_run() {
    let client = ScriptedClient::new();
    let tasks = tasks(&[
        ("migrate", "invalid", &[]),
        ("deploy", "ok", &["migrate"]),
    ]);
    let orchestrator = orchestrator(client.clone(), 2, RetryConfig::disabled(), &tasks);
    let critical: HashSet<String> = HashSet::from(["migrate".to_string()]);

    let err = assert_err!(
        orchestrator
            .orchestrate_with_early_termination(tasks, &critical)
            .await
    );
    match err {
        OrchestrationError::CriticalTaskFailed { task_id, message } => {
            assert_eq!(task_id, "migrate");
            assert!(message.contains("Invalid input"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(client.attempts("deploy"), 0);
    assert_eq!(orchestrator.state(), OrchestrationState::Failed);
}

#[tokio::test]
async fn test_cyclic_input_is_an_orchestration_error() {
    let client = ScriptedClient::new();
    let tasks = tasks(&[("a", "ok", &["b"]), ("b", "ok", &["a"])]);
    let orchestrator = orchestrator(client.clone(), 1, RetryConfig::disabled(), &tasks);

    let err = assert_err!(orchestrator.orchestrate(tasks).await);
    assert!(err
        .to_string()
        .starts_with("Critical orchestration failure: Cycle detected"));
    assert_eq!(client.attempts("a"), 0);
}

// ============================================================================
// Progress and manifests
// ============================================================================

#[tokio::test]
async fn test_progress_monitor_tracks_the_run() {
    let client = ScriptedClient::new();
    let tasks = tasks(&[("a", "ok", &[]), ("b", "invalid", &["a"]), ("c", "ok", &["a"])]);
    let monitor = ProgressMonitor::new(tasks.len(), Duration::from_secs(30)).unwrap();
    let orchestrator = orchestrator(client, 2, RetryConfig::disabled(), &tasks)
        .with_progress(monitor.clone());

    assert_ok!(orchestrator.orchestrate(tasks).await);

    let snapshot = monitor.snapshot().unwrap();
    assert_eq!(snapshot.total, 3);
    assert_eq!(snapshot.completed, 2);
    assert_eq!(snapshot.failed, 1);
    assert_eq!(snapshot.in_progress, 0);
    assert_eq!(snapshot.remaining, 0);
    assert!(monitor.is_complete());
}

#[tokio::test]
async fn test_configured_orchestrator_reports_progress() {
    let client = ScriptedClient::new();
    let tasks = tasks(&[("scan", "spawn", &[]), ("lint", "ok", &["ghost"])]);
    let orchestrator = orchestrator(client, 2, RetryConfig::disabled(), &tasks);

    let outcomes = assert_ok!(orchestrator.orchestrate(tasks).await);
    assert_eq!(outcomes.len(), 4);

    // scan, lint, the dependency-only ghost and the discovered scan-child.
    let progress = orchestrator.get_stats().await.progress.unwrap();
    assert_eq!(progress.total, 4);
    assert_eq!(progress.completed, 3);
    assert_eq!(progress.failed, 1);
    assert_eq!(progress.remaining, 0);
}

#[tokio::test]
async fn test_manifest_file_drives_a_run() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
        [tasks.schema]
        prompt = "ok"

        [tasks.api]
        prompt = "ok"
        dependencies = ["schema"]
        repository = "acme/api"
        "#
    )
    .unwrap();

    let manifest = TaskManifest::load(file.path()).unwrap();
    let tasks = manifest.into_tasks();
    assert_eq!(tasks["api"].repository.as_deref(), Some("acme/api"));

    let client = ScriptedClient::new();
    let orchestrator = orchestrator(client, 1, RetryConfig::disabled(), &tasks);
    let outcomes = assert_ok!(orchestrator.orchestrate(tasks).await);
    assert_eq!(outcomes[0].task_id, "schema");
    assert_eq!(outcomes[1].task_id, "api");
}
