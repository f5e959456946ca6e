//! Parallel execution of dependency-ordered tasks.
//!
//! - [`dependency`]: the task graph and its incremental topological ordering
//! - [`validator`]: structural diagnostics and diagram export
//! - [`dynamic`]: registration of tasks discovered mid-run
//! - [`executor`]: concurrency-gated execution on pool agents
//! - [`scheduler`]: the orchestration loop tying the above together

pub mod dependency;
pub mod dynamic;
pub mod executor;
pub mod scheduler;
pub mod validator;
