//! Error taxonomy.
//!
//! Structural errors (cycles, invalid pool transitions, bad registrations)
//! surface to whoever requested the change and leave state untouched.
//! Per-task errors ([`TaskError`], [`RetryError`]) are contained by the
//! executor and the orchestration loop and become failed outcomes.

pub mod classification;

use std::io;

use thiserror::Error;

use crate::pool::AgentStatus;
use crate::task::TaskId;
use classification::FailureType;

/// Errors raised by [`DependencyGraph`](crate::parallel::dependency::DependencyGraph)
/// and the graph renderers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("Cycle detected in dependency graph: {0}")]
    CycleDetected(String),

    #[error("dependency graph has not been built; call build() or rebuild() first")]
    NotBuilt,

    #[error("task '{0}' is not part of the dependency graph")]
    UnknownTask(TaskId),

    #[error("task '{0}' was already marked completed")]
    AlreadyCompleted(TaskId),

    #[error("task '{0}' has not been handed out as ready")]
    NotReady(TaskId),

    #[error("unsupported visualization format: {0}")]
    UnsupportedFormat(String),
}

/// Result alias for graph operations.
pub type GraphResult<T> = Result<T, GraphError>;

/// Errors raised by the agent pool.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("pool size must be between {min} and {max}, got {requested}")]
    InvalidSize {
        requested: usize,
        min: usize,
        max: usize,
    },

    #[error("agent {agent_id} cannot be {action}: current status is {from}")]
    InvalidTransition {
        agent_id: usize,
        from: AgentStatus,
        action: &'static str,
    },

    #[error("agent {0} does not exist")]
    UnknownAgent(usize),
}

/// Result alias for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// A runtime batch registration was rejected. The live graph is unchanged.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DynamicTaskRegistrationError {
    #[error("invalid task data for '{task_id}': {reason}")]
    InvalidTaskData { task_id: TaskId, reason: String },

    #[error("task '{task_id}' depends on unknown task '{dependency}'")]
    MissingDependency { task_id: TaskId, dependency: TaskId },

    #[error("adding tasks [{}] would create a cycle: {message}", .task_ids.join(", "))]
    CycleDetected {
        task_ids: Vec<TaskId>,
        message: String,
    },

    #[error("failed to apply tasks [{}] to the dependency graph: {source}", .task_ids.join(", "))]
    RebuildFailed {
        task_ids: Vec<TaskId>,
        #[source]
        source: GraphError,
    },
}

impl DynamicTaskRegistrationError {
    /// The task the error is attributed to, if a single one applies.
    pub fn task_id(&self) -> Option<&str> {
        match self {
            Self::InvalidTaskData { task_id, .. } | Self::MissingDependency { task_id, .. } => {
                Some(task_id)
            }
            Self::CycleDetected { task_ids, .. } | Self::RebuildFailed { task_ids, .. } => {
                task_ids.first().map(String::as_str)
            }
        }
    }
}

/// Failure of a single execution attempt.
#[derive(Error, Debug)]
pub enum TaskError {
    /// Error that carries its own classification.
    #[error("{message}")]
    Retryable {
        message: String,
        failure_type: FailureType,
    },

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("{0}")]
    Message(String),
}

impl TaskError {
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::Retryable {
            message: message.into(),
            failure_type: FailureType::Transient,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Retryable {
            message: message.into(),
            failure_type: FailureType::Permanent,
        }
    }

    /// Classify this error for retry purposes.
    pub fn classify(&self) -> FailureType {
        classification::classify(self)
    }
}

impl From<tokio::time::error::Elapsed> for TaskError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        Self::Timeout(err.to_string())
    }
}

/// Raised by [`execute_with_retry`](crate::retry::execute_with_retry) once a
/// task has given up.
#[derive(Error, Debug)]
#[error("task '{task_id}' failed after {attempts} attempt(s): {source}")]
pub struct RetryError {
    pub task_id: TaskId,
    pub attempts: u32,
    pub failure_type: FailureType,
    pub source: TaskError,
}

/// Errors surfaced by [`TaskExecutor::execute_task`](crate::parallel::executor::TaskExecutor::execute_task).
#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error(transparent)]
    Retry(#[from] RetryError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("executor concurrency gate was closed")]
    Closed,
}

impl ExecutorError {
    /// Number of attempts made before the error surfaced.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Retry(err) => err.attempts,
            Self::Pool(_) | Self::Closed => 0,
        }
    }
}

/// An unrecoverable failure escaped the orchestration loop, or a critical
/// task failed under early termination.
#[derive(Error, Debug)]
pub enum OrchestrationError {
    #[error("Critical task '{task_id}' failed: {message}")]
    CriticalTaskFailed { task_id: TaskId, message: String },

    #[error("Critical orchestration failure: {0}")]
    Graph(#[from] GraphError),
}

impl OrchestrationError {
    /// The offending task, when the failure is attributable to one.
    pub fn task_id(&self) -> Option<&str> {
        match self {
            Self::CriticalTaskFailed { task_id, .. } => Some(task_id),
            Self::Graph(GraphError::UnknownTask(id))
            | Self::Graph(GraphError::AlreadyCompleted(id))
            | Self::Graph(GraphError::NotReady(id)) => Some(id),
            _ => None,
        }
    }
}

/// Configuration loading and validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Progress monitor construction errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProgressError {
    #[error("total task count must be greater than zero")]
    EmptyRun,
}

/// Task manifest loading errors.
#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to parse task manifest: {0}")]
    Parse(#[from] toml::de::Error),
}
