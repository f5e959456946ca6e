//! Concurrency-gated task execution.
//!
//! A semaphore sized to the pool caps how many tasks hold an agent at once.
//! Each task is bound to an idle agent, run through the retry policy, and the
//! agent is always returned to the pool afterwards.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Semaphore;

use crate::error::{ExecutorError, PoolError};
use crate::parallel::dynamic::{DynamicDependencyManager, TaskExecutionContext};
use crate::pool::{AgentPool, PoolStats, TaskInvocation};
use crate::retry::RetryConfig;
use crate::task::{elapsed_between, TaskDefinition, TaskId, TaskOutcome, TaskStatus};

/// Default wait between checks for an idle agent.
pub const DEFAULT_AGENT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Executor counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutorStats {
    /// Tasks currently holding a concurrency slot.
    pub active_tasks: usize,
    /// Tasks with a stored outcome.
    pub completed_tasks: usize,
    pub total_tasks: usize,
    /// Concurrency slots (pool size).
    pub capacity: usize,
    pub available_slots: usize,
    pub pool: PoolStats,
}

/// Runs tasks on pool agents with bounded concurrency.
#[derive(Debug)]
pub struct TaskExecutor {
    pool: Arc<AgentPool>,
    semaphore: Arc<Semaphore>,
    capacity: usize,
    retry: RetryConfig,
    poll_interval: Duration,
    discovery: Option<Arc<DynamicDependencyManager>>,
    active: Mutex<HashSet<TaskId>>,
    cancel_requested: Mutex<HashSet<TaskId>>,
    results: Mutex<HashMap<TaskId, TaskOutcome>>,
}

/// Releases the agent, then clears bookkeeping, however execution ends.
struct ExecutionGuard<'a> {
    executor: &'a TaskExecutor,
    task_id: &'a str,
    agent_id: Option<usize>,
}

impl Drop for ExecutionGuard<'_> {
    fn drop(&mut self) {
        if let Some(agent_id) = self.agent_id {
            if let Err(err) = self.executor.pool.mark_idle(agent_id) {
                tracing::warn!(task_id = self.task_id, agent_id, error = %err, "Failed to release agent");
            }
        }
        lock(&self.executor.active).remove(self.task_id);
        lock(&self.executor.cancel_requested).remove(self.task_id);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl TaskExecutor {
    /// Create an executor whose concurrency matches the pool size.
    pub fn new(pool: Arc<AgentPool>, retry: RetryConfig) -> Self {
        let capacity = pool.get_total_agents();
        Self {
            pool,
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            retry,
            poll_interval: DEFAULT_AGENT_POLL_INTERVAL,
            discovery: None,
            active: Mutex::new(HashSet::new()),
            cancel_requested: Mutex::new(HashSet::new()),
            results: Mutex::new(HashMap::new()),
        }
    }

    /// Sets the idle-agent polling interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Give running tasks a [`TaskExecutionContext`] bound to `manager`.
    pub fn with_dynamic_manager(mut self, manager: Arc<DynamicDependencyManager>) -> Self {
        self.discovery = Some(manager);
        self
    }

    pub fn pool(&self) -> &Arc<AgentPool> {
        &self.pool
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    /// Execute one task on the first available agent.
    ///
    /// Suspends until a concurrency slot and an idle agent are available.
    /// Attempt errors go through the retry policy; once it gives up, the error
    /// is returned after the agent has been released. A failed outcome
    /// returned by the agent is not an error and is not retried.
    pub async fn execute_task(
        &self,
        task_id: &str,
        definition: &TaskDefinition,
    ) -> Result<TaskOutcome, ExecutorError> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| ExecutorError::Closed)?;

        lock(&self.active).insert(task_id.to_string());
        let mut guard = ExecutionGuard {
            executor: self,
            task_id,
            agent_id: None,
        };

        let agent_id = self.wait_for_agent(task_id).await;
        guard.agent_id = Some(agent_id);
        let client = self
            .pool
            .client(agent_id)
            .ok_or(PoolError::UnknownAgent(agent_id))?;

        let context = self
            .discovery
            .as_ref()
            .map(|manager| TaskExecutionContext::new(manager.clone(), task_id));
        let discovery = context.as_ref();
        let started_at = Utc::now();
        tracing::info!(task_id, agent_id, "Task started");

        let result = self
            .retry
            .run(task_id, |attempt| {
                let client = &client;
                async move {
                    client
                        .run_one(TaskInvocation {
                            task_id,
                            definition,
                            attempt,
                            agent_id,
                            discovery,
                        })
                        .await
                }
            })
            .await;

        match result {
            Ok(retried) => {
                let retries = retried.retries();
                let outcome = normalize_outcome(task_id, retried.value, started_at, retries);
                tracing::info!(
                    task_id,
                    agent_id,
                    status = %outcome.status,
                    retries,
                    duration_ms = outcome.duration.as_millis() as u64,
                    "Task finished"
                );
                lock(&self.results).insert(task_id.to_string(), outcome.clone());
                Ok(outcome)
            }
            Err(err) => {
                tracing::error!(task_id, agent_id, error = %err, "Task execution failed");
                let failed = TaskOutcome::failed(task_id, Some(started_at), err.to_string())
                    .with_retry_count(err.attempts.saturating_sub(1));
                lock(&self.results).insert(task_id.to_string(), failed);
                Err(err.into())
            }
        }
    }

    async fn wait_for_agent(&self, task_id: &str) -> usize {
        loop {
            if let Some(agent_id) = self.pool.try_allocate(task_id) {
                return agent_id;
            }
            tracing::trace!(task_id, "Waiting for an idle agent");
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Record a cancellation request for an active task.
    ///
    /// Advisory only: the remote execution already in flight is not
    /// interrupted. Returns false if the task is not active.
    pub fn cancel_task(&self, task_id: &str) -> bool {
        if !lock(&self.active).contains(task_id) {
            return false;
        }
        lock(&self.cancel_requested).insert(task_id.to_string());
        tracing::warn!(
            task_id,
            "Cancellation requested; the in-flight remote execution will not be interrupted"
        );
        true
    }

    pub fn is_cancel_requested(&self, task_id: &str) -> bool {
        lock(&self.cancel_requested).contains(task_id)
    }

    /// Ids of tasks currently holding a slot, sorted.
    pub fn active_tasks(&self) -> Vec<TaskId> {
        let mut active: Vec<TaskId> = lock(&self.active).iter().cloned().collect();
        active.sort();
        active
    }

    pub fn get_result(&self, task_id: &str) -> Option<TaskOutcome> {
        lock(&self.results).get(task_id).cloned()
    }

    pub fn clear_results(&self) {
        lock(&self.results).clear();
    }

    pub fn get_stats(&self) -> ExecutorStats {
        let active_tasks = lock(&self.active).len();
        let completed_tasks = lock(&self.results).len();
        ExecutorStats {
            active_tasks,
            completed_tasks,
            total_tasks: active_tasks + completed_tasks,
            capacity: self.capacity,
            available_slots: self.semaphore.available_permits(),
            pool: self.pool.get_stats(),
        }
    }
}

/// Fill in bookkeeping the agent may have left out and force a terminal status.
fn normalize_outcome(
    task_id: &str,
    mut outcome: TaskOutcome,
    started_at: chrono::DateTime<Utc>,
    retries: u32,
) -> TaskOutcome {
    if !outcome.status.is_terminal() {
        tracing::warn!(task_id, status = %outcome.status, "Agent returned a non-terminal status");
        outcome.error = Some(format!(
            "agent returned non-terminal status '{}'",
            outcome.status
        ));
        outcome.status = TaskStatus::Failed;
    }
    let (start, finish) = match (outcome.started_at, outcome.finished_at) {
        (Some(start), Some(finish)) => (start, finish),
        (start, finish) => {
            let start = start.unwrap_or(started_at);
            let finish = finish.unwrap_or_else(Utc::now);
            outcome.duration = elapsed_between(start, finish);
            (start, finish)
        }
    };
    outcome.started_at = Some(start);
    outcome.finished_at = Some(finish);
    outcome.retry_count = retries;
    outcome
}
