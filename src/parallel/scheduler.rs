//! Orchestration loop.
//!
//! Each tick fetches the ready set from the graph, dispatches every ready task
//! concurrently through the executor, waits for the whole batch, and marks the
//! batch done in the graph. Failed tasks are marked done as well so their
//! dependents still get scheduled.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{watch, Mutex};

use crate::config::OrchestratorConfig;
use crate::error::{OrchestrationError, PoolResult};
use crate::metrics::{ProgressMonitor, ProgressSnapshot, ProgressUpdate};
use crate::parallel::dependency::{DependencyGraph, GraphStats, SharedGraph};
use crate::parallel::dynamic::DynamicDependencyManager;
use crate::parallel::executor::{ExecutorStats, TaskExecutor};
use crate::pool::{AgentPool, PoolStats, RemoteExecutor};
use crate::task::{TaskDefinition, TaskId, TaskOutcome};

/// Default sleep when the graph is active but nothing is ready.
pub const DEFAULT_TICK_WAIT_INTERVAL: Duration = Duration::from_millis(500);

/// Lifecycle of an orchestration run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestrationState {
    /// Not started.
    Idle,
    /// Graph active, dispatching ready tasks.
    Running,
    /// Graph active but nothing ready this tick.
    Draining,
    /// Graph exhausted.
    Completed,
    /// An unrecoverable error ended the run.
    Failed,
}

impl OrchestrationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Point-in-time view for dashboards.
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStats {
    pub state: OrchestrationState,
    pub pool: PoolStats,
    pub graph: GraphStats,
    pub executor: ExecutorStats,
    pub progress: Option<ProgressSnapshot>,
    pub pending_dynamic_tasks: bool,
}

/// Drives a dependency graph to completion.
#[derive(Debug)]
pub struct TaskOrchestrator {
    executor: Arc<TaskExecutor>,
    graph: SharedGraph,
    dynamic: Option<Arc<DynamicDependencyManager>>,
    progress: Option<ProgressMonitor>,
    wait_interval: Duration,
    state: watch::Sender<OrchestrationState>,
}

impl TaskOrchestrator {
    pub fn new(executor: Arc<TaskExecutor>, graph: SharedGraph) -> Self {
        let (state, _) = watch::channel(OrchestrationState::Idle);
        Self {
            executor,
            graph,
            dynamic: None,
            progress: None,
            wait_interval: DEFAULT_TICK_WAIT_INTERVAL,
            state,
        }
    }

    /// Wire a pool, graph and dynamic manager together from configuration.
    ///
    /// Tasks executed by this orchestrator can register new work through the
    /// [`TaskExecutionContext`](crate::parallel::dynamic::TaskExecutionContext)
    /// they receive. A non-empty graph also gets a [`ProgressMonitor`] that
    /// logs every `timing.progress_log_interval_secs`.
    pub fn from_config(
        config: &OrchestratorConfig,
        pool: Arc<AgentPool>,
        graph: DependencyGraph,
    ) -> Self {
        let progress =
            ProgressMonitor::new(graph.node_count(), config.timing.progress_log_interval()).ok();
        let graph: SharedGraph = Arc::new(Mutex::new(graph));
        let manager = Arc::new(DynamicDependencyManager::new(graph.clone()));
        let executor = TaskExecutor::new(pool, config.retry.clone())
            .with_poll_interval(config.timing.agent_poll_interval())
            .with_dynamic_manager(manager.clone());

        let orchestrator = Self::new(Arc::new(executor), graph)
            .with_dynamic_manager(manager)
            .with_wait_interval(config.timing.tick_wait_interval());
        match progress {
            Some(monitor) => orchestrator.with_progress(monitor),
            None => orchestrator,
        }
    }

    /// Like [`from_config`](Self::from_config), with a pool of
    /// `pool.max_agents` agents sharing `client`.
    pub fn from_client(
        config: &OrchestratorConfig,
        client: Arc<dyn RemoteExecutor>,
        graph: DependencyGraph,
    ) -> PoolResult<Self> {
        let pool = Arc::new(config.build_pool(client)?);
        Ok(Self::from_config(config, pool, graph))
    }

    /// Drain tasks registered through `manager` on every tick.
    pub fn with_dynamic_manager(mut self, manager: Arc<DynamicDependencyManager>) -> Self {
        self.dynamic = Some(manager);
        self
    }

    pub fn with_progress(mut self, monitor: ProgressMonitor) -> Self {
        self.progress = Some(monitor);
        self
    }

    /// Sets the sleep used while draining.
    pub fn with_wait_interval(mut self, interval: Duration) -> Self {
        self.wait_interval = interval;
        self
    }

    pub fn graph(&self) -> SharedGraph {
        self.graph.clone()
    }

    pub fn executor(&self) -> &Arc<TaskExecutor> {
        &self.executor
    }

    pub fn dynamic_manager(&self) -> Option<&Arc<DynamicDependencyManager>> {
        self.dynamic.as_ref()
    }

    pub fn state(&self) -> OrchestrationState {
        *self.state.borrow()
    }

    /// Observe state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<OrchestrationState> {
        self.state.subscribe()
    }

    fn set_state(&self, next: OrchestrationState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::debug!(from = ?previous, to = ?next, "Orchestration state changed");
        }
    }

    /// Run every task to a terminal outcome.
    ///
    /// `tasks` supplies the definitions for the ids in the graph; the graph is
    /// built first if needed. Ordinary task failures are returned as failed
    /// outcomes. An error is only returned when the loop itself cannot
    /// continue.
    pub async fn orchestrate<I>(&self, tasks: I) -> Result<Vec<TaskOutcome>, OrchestrationError>
    where
        I: IntoIterator<Item = (TaskId, TaskDefinition)>,
    {
        self.run(tasks.into_iter().collect(), None).await
    }

    /// Like [`orchestrate`](Self::orchestrate), but abort as soon as any task
    /// in `critical` fails.
    pub async fn orchestrate_with_early_termination<I>(
        &self,
        tasks: I,
        critical: &HashSet<TaskId>,
    ) -> Result<Vec<TaskOutcome>, OrchestrationError>
    where
        I: IntoIterator<Item = (TaskId, TaskDefinition)>,
    {
        self.run(tasks.into_iter().collect(), Some(critical)).await
    }

    async fn run(
        &self,
        mut definitions: HashMap<TaskId, TaskDefinition>,
        critical: Option<&HashSet<TaskId>>,
    ) -> Result<Vec<TaskOutcome>, OrchestrationError> {
        if definitions.is_empty() {
            tracing::info!("No tasks to orchestrate");
            self.set_state(OrchestrationState::Completed);
            return Ok(Vec::new());
        }

        tracing::info!(tasks = definitions.len(), "Starting orchestration");
        self.set_state(OrchestrationState::Running);

        let result = self.run_loop(&mut definitions, critical).await;
        match &result {
            Ok(outcomes) => {
                let failed = outcomes.iter().filter(|o| !o.is_success()).count();
                tracing::info!(
                    total = outcomes.len(),
                    succeeded = outcomes.len() - failed,
                    failed,
                    "Orchestration completed"
                );
                self.set_state(OrchestrationState::Completed);
            }
            Err(err) => {
                tracing::error!(error = %err, "Orchestration failed");
                self.set_state(OrchestrationState::Failed);
            }
        }
        result
    }

    async fn run_loop(
        &self,
        definitions: &mut HashMap<TaskId, TaskDefinition>,
        critical: Option<&HashSet<TaskId>>,
    ) -> Result<Vec<TaskOutcome>, OrchestrationError> {
        {
            let mut graph = self.graph.lock().await;
            if !graph.is_built() {
                graph.build()?;
            }
        }

        let mut outcomes = Vec::new();
        let mut tick: u64 = 0;

        loop {
            let ready = {
                let mut graph = self.graph.lock().await;
                if !graph.is_active() {
                    break;
                }
                graph.get_ready_tasks()
            };
            // After the ready set: anything registered before it was fetched
            // has already been queued.
            self.absorb_discovered(definitions).await;

            if ready.is_empty() {
                self.set_state(OrchestrationState::Draining);
                tracing::debug!(
                    wait_ms = self.wait_interval.as_millis() as u64,
                    "No ready tasks, waiting"
                );
                tokio::time::sleep(self.wait_interval).await;
                continue;
            }

            self.set_state(OrchestrationState::Running);
            tick += 1;
            tracing::info!(tick, ready = ready.len(), "Dispatching ready tasks");

            let batch = self.dispatch(&ready, definitions).await;

            if let Some(critical) = critical {
                if let Some(failed) = batch
                    .iter()
                    .find(|outcome| !outcome.is_success() && critical.contains(&outcome.task_id))
                {
                    return Err(OrchestrationError::CriticalTaskFailed {
                        task_id: failed.task_id.clone(),
                        message: failed
                            .error
                            .clone()
                            .unwrap_or_else(|| "unknown error".to_string()),
                    });
                }
            }

            self.graph.lock().await.mark_completed(&ready)?;
            if let Some(manager) = &self.dynamic {
                for id in &ready {
                    manager.mark_task_completed(id.clone());
                }
            }
            outcomes.extend(batch);
        }

        Ok(outcomes)
    }

    async fn absorb_discovered(&self, definitions: &mut HashMap<TaskId, TaskDefinition>) {
        let Some(manager) = &self.dynamic else {
            return;
        };
        let discovered = manager.drain_pending().await;
        if discovered.is_empty() {
            return;
        }
        tracing::info!(count = discovered.len(), "Picked up discovered tasks");
        if let Some(progress) = &self.progress {
            progress.add_tasks(discovered.len());
        }
        definitions.extend(discovered);
    }

    /// Run one batch. Every ready id yields exactly one outcome, in order.
    async fn dispatch(
        &self,
        ready: &[TaskId],
        definitions: &HashMap<TaskId, TaskDefinition>,
    ) -> Vec<TaskOutcome> {
        let handles: Vec<_> = ready
            .iter()
            .map(|id| {
                if let Some(progress) = &self.progress {
                    progress.record(ProgressUpdate::Started);
                }
                let executor = self.executor.clone();
                let id = id.clone();
                let definition = definitions.get(&id).cloned();

                tokio::spawn(async move {
                    let Some(definition) = definition else {
                        tracing::warn!(task_id = %id, "No definition registered for ready task");
                        return TaskOutcome::failed(
                            &id,
                            None,
                            format!("no task definition registered for '{}'", id),
                        );
                    };
                    match executor.execute_task(&id, &definition).await {
                        Ok(mut outcome) => {
                            outcome.task_id = id;
                            outcome
                        }
                        Err(err) => executor.get_result(&id).unwrap_or_else(|| {
                            TaskOutcome::failed(&id, None, err.to_string())
                                .with_retry_count(err.attempts().saturating_sub(1))
                        }),
                    }
                })
            })
            .collect();

        let joined = futures::future::join_all(handles).await;

        let batch: Vec<TaskOutcome> = joined
            .into_iter()
            .zip(ready)
            .map(|(joined, id)| match joined {
                Ok(outcome) => outcome,
                Err(err) => {
                    tracing::error!(task_id = %id, error = %err, "Task aborted");
                    TaskOutcome::failed(id, None, format!("task aborted: {}", err))
                }
            })
            .collect();

        if let Some(progress) = &self.progress {
            for outcome in &batch {
                progress.record_outcome(outcome);
            }
        }
        batch
    }

    pub async fn get_stats(&self) -> OrchestratorStats {
        let graph = self.graph.lock().await.get_stats();
        OrchestratorStats {
            state: self.state(),
            pool: self.executor.pool().get_stats(),
            graph,
            executor: self.executor.get_stats(),
            progress: self.progress.as_ref().and_then(ProgressMonitor::snapshot),
            pending_dynamic_tasks: self
                .dynamic
                .as_ref()
                .is_some_and(|manager| manager.has_pending_tasks()),
        }
    }
}
