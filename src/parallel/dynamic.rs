//! Runtime registration of tasks discovered while the run is in progress.
//!
//! A batch is accepted or rejected as a whole. It is first applied to a copy
//! of the graph to detect cycles, then applied to the live graph with a
//! snapshot kept for rollback. Accepted tasks are queued for the
//! orchestration loop, which picks up their definitions on its next tick.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::{DynamicTaskRegistrationError, GraphError};
use crate::parallel::dependency::SharedGraph;
use crate::task::{TaskDefinition, TaskId};

/// Task queued for the orchestration loop.
pub type DiscoveredTask = (TaskId, TaskDefinition);

/// Serializes runtime mutations of the shared dependency graph.
#[derive(Debug)]
pub struct DynamicDependencyManager {
    graph: SharedGraph,
    completed: Mutex<HashSet<TaskId>>,
    sender: mpsc::UnboundedSender<DiscoveredTask>,
    receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<DiscoveredTask>>,
    pending: AtomicUsize,
}

impl DynamicDependencyManager {
    pub fn new(graph: SharedGraph) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            graph,
            completed: Mutex::new(HashSet::new()),
            sender,
            receiver: tokio::sync::Mutex::new(receiver),
            pending: AtomicUsize::new(0),
        }
    }

    /// The graph this manager mutates.
    pub fn graph(&self) -> SharedGraph {
        self.graph.clone()
    }

    /// Register a batch of tasks.
    ///
    /// Ids already known to the graph, including dependency-only nodes, are
    /// rejected. Every dependency must already be in the graph, be known as
    /// completed, or be another task of the same batch. If the batch would introduce a
    /// cycle nothing is added. Returns the ids that were queued.
    pub async fn add_dynamic_tasks(
        &self,
        batch: BTreeMap<TaskId, TaskDefinition>,
    ) -> Result<Vec<TaskId>, DynamicTaskRegistrationError> {
        self.register(batch, None).await
    }

    /// Parse a JSON object of `{id: definition}` and register it.
    pub async fn add_dynamic_tasks_json(
        &self,
        batch: &Value,
    ) -> Result<Vec<TaskId>, DynamicTaskRegistrationError> {
        self.register(parse_task_batch(batch)?, None).await
    }

    async fn register(
        &self,
        batch: BTreeMap<TaskId, TaskDefinition>,
        caller: Option<&str>,
    ) -> Result<Vec<TaskId>, DynamicTaskRegistrationError> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        let task_ids: Vec<TaskId> = batch.keys().cloned().collect();

        // Held for validate + mutate + rebuild + enqueue.
        let mut graph = self.graph.lock().await;

        // Ids only this manager knows as done; the graph must treat them as
        // satisfied rather than schedule them.
        let mut satisfied = BTreeSet::new();
        {
            let completed = self.completed.lock().unwrap_or_else(PoisonError::into_inner);
            for (id, definition) in &batch {
                if id.trim().is_empty() {
                    return Err(DynamicTaskRegistrationError::InvalidTaskData {
                        task_id: id.clone(),
                        reason: "task id must not be empty".to_string(),
                    });
                }
                if graph.has_node(id) || completed.contains(id) {
                    return Err(DynamicTaskRegistrationError::InvalidTaskData {
                        task_id: id.clone(),
                        reason: "task is already registered".to_string(),
                    });
                }
                for dep in &definition.dependencies {
                    if graph.has_node(dep) || batch.contains_key(dep) {
                        continue;
                    }
                    if completed.contains(dep) {
                        satisfied.insert(dep.clone());
                    } else {
                        return Err(DynamicTaskRegistrationError::MissingDependency {
                            task_id: id.clone(),
                            dependency: dep.clone(),
                        });
                    }
                }
            }
        }

        let mut trial = graph.copy();
        for (id, definition) in &batch {
            trial.add_task(id.clone(), definition.dependencies.iter().cloned());
        }
        if let Err(err) = trial.build() {
            tracing::warn!(
                tasks = ?task_ids,
                caller = caller.unwrap_or("-"),
                error = %err,
                "Rejected dynamic task batch"
            );
            return Err(match err {
                GraphError::CycleDetected(message) => {
                    DynamicTaskRegistrationError::CycleDetected { task_ids, message }
                }
                source => DynamicTaskRegistrationError::RebuildFailed { task_ids, source },
            });
        }

        let snapshot = graph.clone();
        for id in &satisfied {
            graph.mark_satisfied(id.clone());
        }
        for (id, definition) in &batch {
            graph.add_task(id.clone(), definition.dependencies.iter().cloned());
        }
        if let Err(source) = graph.rebuild() {
            *graph = snapshot;
            tracing::error!(
                tasks = ?task_ids,
                error = %source,
                "Rebuild failed after dynamic registration; graph restored"
            );
            return Err(DynamicTaskRegistrationError::RebuildFailed { task_ids, source });
        }

        for (id, definition) in batch {
            self.pending.fetch_add(1, Ordering::SeqCst);
            if self.sender.send((id, definition)).is_err() {
                self.pending.fetch_sub(1, Ordering::SeqCst);
            }
        }
        drop(graph);

        tracing::info!(
            tasks = ?task_ids,
            caller = caller.unwrap_or("-"),
            "Registered dynamic tasks"
        );
        Ok(task_ids)
    }

    /// Record a task as completed so later batches may depend on it.
    pub fn mark_task_completed(&self, task_id: impl Into<TaskId>) {
        self.completed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(task_id.into());
    }

    pub fn is_task_completed(&self, task_id: &str) -> bool {
        self.completed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(task_id)
    }

    /// Whether registered tasks are waiting to be picked up.
    pub fn has_pending_tasks(&self) -> bool {
        self.pending.load(Ordering::SeqCst) > 0
    }

    /// Wait up to `wait` for the next registered task.
    pub async fn get_next_task(&self, wait: Duration) -> Option<DiscoveredTask> {
        let mut receiver = self.receiver.lock().await;
        match tokio::time::timeout(wait, receiver.recv()).await {
            Ok(Some(task)) => {
                self.pending.fetch_sub(1, Ordering::SeqCst);
                Some(task)
            }
            _ => None,
        }
    }

    /// Take every queued task without waiting, in registration order.
    pub async fn drain_pending(&self) -> Vec<DiscoveredTask> {
        let mut receiver = self.receiver.lock().await;
        let mut drained = Vec::new();
        while let Ok(task) = receiver.try_recv() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            drained.push(task);
        }
        drained
    }
}

/// Validate and convert a JSON batch at the registration boundary.
///
/// Every entry must be an object with a `dependencies` array of strings.
pub fn parse_task_batch(
    batch: &Value,
) -> Result<BTreeMap<TaskId, TaskDefinition>, DynamicTaskRegistrationError> {
    let entries = batch
        .as_object()
        .ok_or_else(|| DynamicTaskRegistrationError::InvalidTaskData {
            task_id: String::new(),
            reason: "batch must be an object of task id to definition".to_string(),
        })?;

    let mut parsed = BTreeMap::new();
    for (id, data) in entries {
        let invalid = |reason: &str| DynamicTaskRegistrationError::InvalidTaskData {
            task_id: id.clone(),
            reason: reason.to_string(),
        };

        let fields = data
            .as_object()
            .ok_or_else(|| invalid("definition must be an object"))?;
        let deps = fields
            .get("dependencies")
            .ok_or_else(|| invalid("missing 'dependencies' field"))?;
        let deps = deps
            .as_array()
            .ok_or_else(|| invalid("'dependencies' must be a list"))?;
        if deps.iter().any(|dep| !dep.is_string()) {
            return Err(invalid("'dependencies' must contain task ids"));
        }

        let definition: TaskDefinition = serde_json::from_value(data.clone())
            .map_err(|err| invalid(&err.to_string()))?;
        parsed.insert(id.clone(), definition);
    }
    Ok(parsed)
}

/// Registration handle bound to the task that discovered the work.
///
/// The caller id is only used for attribution in logs.
#[derive(Debug, Clone)]
pub struct TaskExecutionContext {
    manager: Arc<DynamicDependencyManager>,
    caller_task_id: TaskId,
}

impl TaskExecutionContext {
    pub fn new(manager: Arc<DynamicDependencyManager>, caller_task_id: impl Into<TaskId>) -> Self {
        Self {
            manager,
            caller_task_id: caller_task_id.into(),
        }
    }

    pub fn caller_task_id(&self) -> &str {
        &self.caller_task_id
    }

    /// Register a single discovered task.
    pub async fn add_discovered_task(
        &self,
        task_id: impl Into<TaskId>,
        definition: TaskDefinition,
    ) -> Result<(), DynamicTaskRegistrationError> {
        let mut batch = BTreeMap::new();
        batch.insert(task_id.into(), definition);
        self.add_multiple_discovered_tasks(batch).await.map(|_| ())
    }

    /// Register several discovered tasks atomically.
    pub async fn add_multiple_discovered_tasks(
        &self,
        batch: BTreeMap<TaskId, TaskDefinition>,
    ) -> Result<Vec<TaskId>, DynamicTaskRegistrationError> {
        self.manager
            .register(batch, Some(&self.caller_task_id))
            .await
    }
}
