//! Shared fixtures.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use taskloom::{
    DependencyGraph, RemoteExecutor, RetryConfig, TaskDefinition, TaskError, TaskId,
    TaskInvocation, TaskOrchestrator, TaskOutcome,
};
use tokio::time::Instant;

/// Agent client whose behavior is chosen by the task prompt:
///
/// - `ok`: succeed immediately
/// - `sleep:<ms>`: succeed after sleeping
/// - `invalid`: fail with "Invalid input"
/// - `flaky:<n>`: fail `n` times with "Connection timeout", then succeed
/// - `spawn`: register `<id>-child` depending on the running task, then succeed
/// - `spawn-cycle`: try to register a cyclic pair, then succeed
#[derive(Default)]
pub struct ScriptedClient {
    attempts: Mutex<HashMap<TaskId, Vec<Instant>>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    pub rejected: Mutex<Vec<String>>,
}

impl ScriptedClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn attempts(&self, task_id: &str) -> usize {
        self.attempt_times(task_id).len()
    }

    pub fn attempt_times(&self, task_id: &str) -> Vec<Instant> {
        self.attempts
            .lock()
            .unwrap()
            .get(task_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    async fn behave(&self, invocation: TaskInvocation<'_>) -> Result<TaskOutcome, TaskError> {
        let id = invocation.task_id;
        let prompt = invocation.definition.prompt.as_str();

        if let Some(ms) = prompt.strip_prefix("sleep:") {
            let ms: u64 = ms.parse().unwrap();
            tokio::time::sleep(Duration::from_millis(ms)).await;
            return Ok(TaskOutcome::completed(id, Utc::now(), None));
        }
        if let Some(failures) = prompt.strip_prefix("flaky:") {
            let failures: u32 = failures.parse().unwrap();
            if invocation.attempt <= failures {
                return Err(TaskError::message("Connection timeout"));
            }
            return Ok(TaskOutcome::completed(id, Utc::now(), None));
        }

        match prompt {
            "invalid" => Err(TaskError::message("Invalid input")),
            "spawn" => {
                let context = invocation.discovery.expect("discovery context");
                context
                    .add_discovered_task(
                        format!("{}-child", id),
                        TaskDefinition::new("ok").with_dependencies([id]),
                    )
                    .await
                    .map_err(|err| TaskError::permanent(err.to_string()))?;
                Ok(TaskOutcome::completed(id, Utc::now(), None))
            }
            "spawn-cycle" => {
                let context = invocation.discovery.expect("discovery context");
                let batch = BTreeMap::from([
                    ("loop-x".to_string(), TaskDefinition::new("ok").with_dependencies(["loop-y"])),
                    ("loop-y".to_string(), TaskDefinition::new("ok").with_dependencies(["loop-x"])),
                ]);
                if let Err(err) = context.add_multiple_discovered_tasks(batch).await {
                    self.rejected.lock().unwrap().push(err.to_string());
                }
                Ok(TaskOutcome::completed(id, Utc::now(), None))
            }
            _ => Ok(TaskOutcome::completed(id, Utc::now(), None)),
        }
    }
}

#[async_trait]
impl RemoteExecutor for ScriptedClient {
    async fn run_one(&self, invocation: TaskInvocation<'_>) -> Result<TaskOutcome, TaskError> {
        self.attempts
            .lock()
            .unwrap()
            .entry(invocation.task_id.to_string())
            .or_default()
            .push(Instant::now());

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let result = self.behave(invocation).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// `(id, prompt, dependencies)` triples into a task mapping.
pub fn tasks(entries: &[(&str, &str, &[&str])]) -> BTreeMap<TaskId, TaskDefinition> {
    entries
        .iter()
        .map(|(id, prompt, deps)| {
            (
                id.to_string(),
                TaskDefinition::new(*prompt).with_dependencies(deps.iter().copied()),
            )
        })
        .collect()
}

/// Orchestrator over `tasks` with short intervals and the given retry policy.
pub fn orchestrator(
    client: Arc<ScriptedClient>,
    pool_size: usize,
    retry: RetryConfig,
    tasks: &BTreeMap<TaskId, TaskDefinition>,
) -> TaskOrchestrator {
    let mut config = taskloom::OrchestratorConfig::new()
        .with_max_agents(pool_size)
        .with_retry(retry)
        .with_timing(taskloom::config::TimingConfig {
            agent_poll_interval_ms: 1,
            tick_wait_interval_ms: 1,
            ..Default::default()
        });
    config.logging.level = "warn".to_string();
    let _ = taskloom::logging::init_from(&config.logging);

    TaskOrchestrator::from_client(&config, client, DependencyGraph::from_tasks(tasks)).unwrap()
}

pub fn outcome<'a>(outcomes: &'a [TaskOutcome], id: &str) -> &'a TaskOutcome {
    outcomes
        .iter()
        .find(|o| o.task_id == id)
        .unwrap_or_else(|| panic!("no outcome for {}", id))
}
