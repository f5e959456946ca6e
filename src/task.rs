//! Task model shared by the graph, the executor and the orchestration loop.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ManifestError;

/// Opaque unique task identifier. Used as the graph node key.
pub type TaskId = String;

/// Caller-owned description of a unit of work.
///
/// The engine only looks at `dependencies`. Everything else is carried through
/// to the [`RemoteExecutor`](crate::pool::RemoteExecutor) untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    /// Ids of tasks that must be done before this one becomes ready.
    #[serde(default)]
    pub dependencies: BTreeSet<TaskId>,
    /// Instruction payload handed to the remote agent.
    #[serde(default)]
    pub prompt: String,
    /// Target repository, when the work is repository scoped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    /// Collaborator specific fields.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TaskDefinition {
    /// Create a definition with the given prompt and no dependencies.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    /// Set the dependency set.
    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<TaskId>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    /// Set the target repository.
    pub fn with_repository(mut self, repository: impl Into<String>) -> Self {
        self.repository = Some(repository.into());
        self
    }

    /// Attach an extension field.
    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

/// Lifecycle status of a task.
///
/// `Pending` and `Running` only exist before and during an attempt. Outcomes
/// delivered to the orchestration loop are always `Completed` or `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    /// Whether this status can appear in a delivered outcome.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal result of running one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration: Duration,
    /// Result payload reported by the agent, if any.
    pub result: Option<Value>,
    pub error: Option<String>,
    /// Attempts consumed beyond the first one.
    pub retry_count: u32,
}

impl TaskOutcome {
    /// Successful outcome finishing now.
    pub fn completed(
        task_id: impl Into<TaskId>,
        started_at: DateTime<Utc>,
        result: Option<Value>,
    ) -> Self {
        let finished_at = Utc::now();
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Completed,
            started_at: Some(started_at),
            finished_at: Some(finished_at),
            duration: elapsed_between(started_at, finished_at),
            result,
            error: None,
            retry_count: 0,
        }
    }

    /// Failed outcome finishing now.
    pub fn failed(
        task_id: impl Into<TaskId>,
        started_at: Option<DateTime<Utc>>,
        error: impl Into<String>,
    ) -> Self {
        let finished_at = Utc::now();
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Failed,
            started_at,
            finished_at: Some(finished_at),
            duration: started_at
                .map(|start| elapsed_between(start, finished_at))
                .unwrap_or_default(),
            result: None,
            error: Some(error.into()),
            retry_count: 0,
        }
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Completed
    }
}

pub(crate) fn elapsed_between(start: DateTime<Utc>, end: DateTime<Utc>) -> Duration {
    (end - start).to_std().unwrap_or_default()
}

/// Task source backed by a TOML document.
///
/// ```toml
/// [tasks.schema]
/// prompt = "Create the schema"
///
/// [tasks.api]
/// prompt = "Build the API"
/// dependencies = ["schema"]
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskManifest {
    #[serde(default)]
    pub tasks: BTreeMap<TaskId, TaskDefinition>,
}

impl TaskManifest {
    pub fn from_toml_str(content: &str) -> Result<Self, ManifestError> {
        Ok(toml::from_str(content)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ManifestError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    pub fn into_tasks(self) -> BTreeMap<TaskId, TaskDefinition> {
        self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
