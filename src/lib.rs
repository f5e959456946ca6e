//! Taskloom: dependency-aware concurrent orchestration.
//!
//! Tasks form a directed dependency graph and are dispatched across a bounded
//! pool of remote-execution agents. Ready tasks run concurrently (gated by a
//! semaphore sized to the pool), failures are retried with exponential backoff
//! when they look transient, and tasks may register newly discovered work
//! while the run is in progress.
//!
//! The main entry points are:
//! - [`build_and_validate`] to turn a task mapping into a built [`DependencyGraph`]
//! - [`TaskOrchestrator::orchestrate`] to run every task to a terminal outcome
//! - [`TaskOrchestrator::get_stats`] for point-in-time introspection

pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod parallel;
pub mod pool;
pub mod retry;
pub mod task;

pub use crate::config::OrchestratorConfig;
pub use error::classification::FailureType;
pub use error::{
    ConfigError, DynamicTaskRegistrationError, ExecutorError, GraphError, OrchestrationError,
    PoolError, RetryError, TaskError,
};
pub use metrics::{OutcomeSummary, ProgressMonitor, ProgressSnapshot, ProgressUpdate};
pub use parallel::dependency::{build_and_validate, DependencyGraph, GraphStats, SharedGraph};
pub use parallel::dynamic::{DynamicDependencyManager, TaskExecutionContext};
pub use parallel::executor::{ExecutorStats, TaskExecutor};
pub use parallel::scheduler::{OrchestrationState, OrchestratorStats, TaskOrchestrator};
pub use parallel::validator::{GraphValidator, ValidationReport, VisualizationFormat};
pub use pool::{AgentPool, AgentStatus, PoolStats, RemoteExecutor, TaskInvocation};
pub use retry::{execute_with_retry, RetryConfig, Retried};
pub use task::{TaskDefinition, TaskId, TaskManifest, TaskOutcome, TaskStatus};
