use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use taskloom::{
    build_and_validate, DependencyGraph, DynamicDependencyManager, DynamicTaskRegistrationError,
    RetryConfig, TaskDefinition, TaskExecutionContext,
};
use tokio::sync::Mutex;
use tokio_test::{assert_err, assert_ok};

use crate::common::{orchestrator, outcome, tasks, ScriptedClient};

#[tokio::test]
async fn test_task_discovered_mid_run_is_executed() {
    let client = ScriptedClient::new();
    let tasks = tasks(&[("scan", "spawn", &[]), ("report", "ok", &["scan"])]);
    let orchestrator = orchestrator(client.clone(), 2, RetryConfig::disabled(), &tasks);

    let outcomes = assert_ok!(orchestrator.orchestrate(tasks).await);
    assert_eq!(outcomes.len(), 3);
    assert!(outcome(&outcomes, "scan-child").is_success());
    assert_eq!(client.attempts("scan-child"), 1);

    let position = |id: &str| outcomes.iter().position(|o| o.task_id == id).unwrap();
    assert!(position("scan") < position("scan-child"));

    let manager = orchestrator.dynamic_manager().unwrap();
    assert!(manager.is_task_completed("scan-child"));
    assert!(!manager.has_pending_tasks());
}

#[tokio::test]
async fn test_cyclic_discovery_is_rejected_without_disturbing_the_run() {
    let client = ScriptedClient::new();
    let tasks = tasks(&[("survey", "spawn-cycle", &[]), ("after", "ok", &["survey"])]);
    let orchestrator = orchestrator(client.clone(), 1, RetryConfig::disabled(), &tasks);

    let outcomes = assert_ok!(orchestrator.orchestrate(tasks).await);
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes.iter().all(|o| o.is_success()));

    let rejected = client.rejected.lock().unwrap().clone();
    assert_eq!(rejected.len(), 1);
    assert!(rejected[0].contains("cycle"), "{}", rejected[0]);

    let graph = orchestrator.graph();
    let graph = graph.lock().await;
    assert!(!graph.contains("loop-x"));
    assert!(!graph.contains("loop-y"));
}

#[tokio::test]
async fn test_dependency_on_externally_completed_task_is_satisfied() {
    let client = ScriptedClient::new();
    let tasks = tasks(&[("scan", "ok", &[])]);
    let orchestrator = orchestrator(client.clone(), 2, RetryConfig::disabled(), &tasks);

    let manager = orchestrator.dynamic_manager().unwrap();
    manager.mark_task_completed("external");
    let batch = BTreeMap::from([(
        "child".to_string(),
        TaskDefinition::new("ok").with_dependencies(["external"]),
    )]);
    assert_ok!(manager.add_dynamic_tasks(batch).await);

    let outcomes = assert_ok!(orchestrator.orchestrate(tasks).await);
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes.iter().all(|o| o.is_success()));
    assert!(outcomes.iter().all(|o| o.task_id != "external"));
    assert_eq!(client.attempts("external"), 0);
    assert_eq!(client.attempts("child"), 1);
}

#[tokio::test]
async fn test_finished_dependency_id_cannot_be_registered_as_new_work() {
    let client = ScriptedClient::new();
    let tasks = tasks(&[("a", "ok", &["ghost"])]);
    let orchestrator = orchestrator(client, 1, RetryConfig::disabled(), &tasks);
    let outcomes = assert_ok!(orchestrator.orchestrate(tasks).await);
    assert_eq!(outcomes.len(), 2);

    let manager = orchestrator.dynamic_manager().unwrap();
    let batch = BTreeMap::from([("ghost".to_string(), TaskDefinition::new("ok"))]);
    let err = assert_err!(manager.add_dynamic_tasks(batch).await);
    assert_eq!(err.task_id(), Some("ghost"));
    assert!(!manager.has_pending_tasks());
    let graph = orchestrator.graph();
    assert!(!graph.lock().await.is_active());
}

#[tokio::test]
async fn test_cyclic_batch_leaves_graph_untouched() {
    let initial = tasks(&[("a", "ok", &[])]);
    let graph = Arc::new(Mutex::new(build_and_validate(&initial).unwrap()));
    let manager = DynamicDependencyManager::new(graph.clone());
    let before = graph.lock().await.clone();

    let batch = BTreeMap::from([
        ("x".to_string(), TaskDefinition::new("ok").with_dependencies(["y"])),
        ("y".to_string(), TaskDefinition::new("ok").with_dependencies(["x"])),
    ]);
    let err = assert_err!(manager.add_dynamic_tasks(batch).await);
    assert!(matches!(err, DynamicTaskRegistrationError::CycleDetected { .. }));

    let after = graph.lock().await.clone();
    assert_eq!(before, after);
    assert!(!after.contains("x"));
    assert!(!after.contains("y"));
    assert!(!manager.has_pending_tasks());
}

#[tokio::test]
async fn test_json_batch_with_internal_references() {
    let mut graph = DependencyGraph::new();
    graph.add_task("root", Vec::<String>::new());
    graph.build().unwrap();
    let manager = DynamicDependencyManager::new(Arc::new(Mutex::new(graph)));

    let ids = assert_ok!(
        manager
            .add_dynamic_tasks_json(&json!({
                "lint": {"dependencies": ["root"], "prompt": "lint"},
                "test": {"dependencies": ["lint"], "prompt": "test", "shard": 2}
            }))
            .await
    );
    assert_eq!(ids, vec!["lint".to_string(), "test".to_string()]);

    let queued = manager.drain_pending().await;
    assert_eq!(queued.len(), 2);
    let (_, test_def) = queued.iter().find(|(id, _)| id == "test").unwrap();
    assert_eq!(test_def.extra["shard"], json!(2));

    let err = assert_err!(
        manager
            .add_dynamic_tasks_json(&json!({"bad": {"prompt": "no deps"}}))
            .await
    );
    assert!(matches!(err, DynamicTaskRegistrationError::InvalidTaskData { .. }));

    let err = assert_err!(
        manager
            .add_dynamic_tasks_json(&json!({"orphan": {"dependencies": ["nowhere"]}}))
            .await
    );
    assert_eq!(err.task_id(), Some("orphan"));
}

#[test]
fn test_registration_from_synchronous_code() {
    let initial = tasks(&[("a", "ok", &[])]);
    let graph = Arc::new(Mutex::new(build_and_validate(&initial).unwrap()));
    let manager = Arc::new(DynamicDependencyManager::new(graph));
    let context = TaskExecutionContext::new(manager.clone(), "a");
    assert_eq!(context.caller_task_id(), "a");

    assert_ok!(tokio_test::block_on(
        context.add_discovered_task("b", TaskDefinition::new("ok").with_dependencies(["a"]))
    ));
    assert!(manager.has_pending_tasks());

    let next = tokio_test::block_on(manager.get_next_task(Duration::from_millis(10)));
    assert_eq!(next.map(|(id, _)| id), Some("b".to_string()));
    assert!(tokio_test::block_on(manager.get_next_task(Duration::from_millis(10))).is_none());
}
