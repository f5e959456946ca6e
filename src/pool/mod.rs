//! Fixed-size pool of remote-execution agents.
//!
//! Each slot follows a small state machine:
//!
//! ```text
//! Idle --mark_busy--> Busy --mark_idle--> Idle
//!  *   --mark_failed--> Failed --reset_agent--> Idle
//! ```
//!
//! Failed agents are never handed out again until explicitly reset.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{PoolError, PoolResult, TaskError};
use crate::parallel::dynamic::TaskExecutionContext;
use crate::task::{TaskDefinition, TaskId, TaskOutcome};

/// Default number of agents in a pool.
pub const DEFAULT_MAX_AGENTS: usize = 10;
/// Smallest allowed pool.
pub const MIN_AGENTS: usize = 1;
/// Hard ceiling on concurrent remote sessions.
pub const MAX_AGENTS: usize = 10;

/// One physical attempt handed to a [`RemoteExecutor`].
#[derive(Clone, Copy)]
pub struct TaskInvocation<'a> {
    pub task_id: &'a str,
    pub definition: &'a TaskDefinition,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Pool slot serving this attempt.
    pub agent_id: usize,
    /// Present when the executor can accept newly discovered tasks.
    pub discovery: Option<&'a TaskExecutionContext>,
}

/// Client able to run a single task to completion on a remote agent.
///
/// Implementations enforce their own timeouts. A returned outcome may itself
/// be a failure; an `Err` is an attempt failure and goes through the retry
/// policy. Attempts may be repeated, so implementations should tolerate
/// at-least-once execution.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn run_one(&self, invocation: TaskInvocation<'_>) -> Result<TaskOutcome, TaskError>;
}

/// Status of a pool slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Busy,
    Failed,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AgentStatus::Idle => "idle",
            AgentStatus::Busy => "busy",
            AgentStatus::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Point-in-time view of one pool slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManagedAgent {
    pub id: usize,
    pub status: AgentStatus,
    /// Task being served; only set while busy.
    pub current_task: Option<TaskId>,
    /// Reason given by the last `mark_failed`.
    pub last_error: Option<String>,
}

impl ManagedAgent {
    fn new(id: usize) -> Self {
        Self {
            id,
            status: AgentStatus::Idle,
            current_task: None,
            last_error: None,
        }
    }
}

/// Counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub idle: usize,
    pub busy: usize,
    pub failed: usize,
}

/// Fixed-size ordered collection of agents, created eagerly.
pub struct AgentPool {
    clients: Vec<Arc<dyn RemoteExecutor>>,
    agents: Mutex<Vec<ManagedAgent>>,
}

impl AgentPool {
    /// Create a pool with one agent per client.
    ///
    /// Fails when the number of clients is outside `[MIN_AGENTS, MAX_AGENTS]`.
    pub fn new(clients: Vec<Arc<dyn RemoteExecutor>>) -> PoolResult<Self> {
        validate_size(clients.len())?;
        let agents = (0..clients.len()).map(ManagedAgent::new).collect();
        tracing::info!(agents = clients.len(), "Agent pool created");
        Ok(Self {
            clients,
            agents: Mutex::new(agents),
        })
    }

    /// Create a pool of `size` agents, building each client with `factory`.
    pub fn with_factory<F>(size: usize, mut factory: F) -> PoolResult<Self>
    where
        F: FnMut(usize) -> Arc<dyn RemoteExecutor>,
    {
        validate_size(size)?;
        Self::new((0..size).map(&mut factory).collect())
    }

    /// Create a pool of `size` agents sharing one client.
    pub fn shared(size: usize, client: Arc<dyn RemoteExecutor>) -> PoolResult<Self> {
        Self::with_factory(size, |_| client.clone())
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ManagedAgent>> {
        self.agents.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get_total_agents(&self) -> usize {
        self.clients.len()
    }

    /// First idle agent in index order. Failed agents are skipped.
    pub fn get_idle_agent(&self) -> Option<usize> {
        self.lock()
            .iter()
            .find(|agent| agent.status == AgentStatus::Idle)
            .map(|agent| agent.id)
    }

    /// Find the first idle agent and mark it busy in one step.
    pub fn try_allocate(&self, task_id: &str) -> Option<usize> {
        let mut agents = self.lock();
        let agent = agents
            .iter_mut()
            .find(|agent| agent.status == AgentStatus::Idle)?;
        agent.status = AgentStatus::Busy;
        agent.current_task = Some(task_id.to_string());
        tracing::debug!(agent_id = agent.id, task_id, "Agent allocated");
        Some(agent.id)
    }

    /// `Idle -> Busy`. Fails from any other status.
    pub fn mark_busy(&self, agent_id: usize, task_id: &str) -> PoolResult<()> {
        let mut agents = self.lock();
        let agent = agents
            .get_mut(agent_id)
            .ok_or(PoolError::UnknownAgent(agent_id))?;
        if agent.status != AgentStatus::Idle {
            return Err(PoolError::InvalidTransition {
                agent_id,
                from: agent.status,
                action: "marked busy",
            });
        }
        agent.status = AgentStatus::Busy;
        agent.current_task = Some(task_id.to_string());
        tracing::debug!(agent_id, task_id, "Agent marked busy");
        Ok(())
    }

    /// Back to idle. Legal from every status so cleanup never fails.
    pub fn mark_idle(&self, agent_id: usize) -> PoolResult<()> {
        let mut agents = self.lock();
        let agent = agents
            .get_mut(agent_id)
            .ok_or(PoolError::UnknownAgent(agent_id))?;
        agent.status = AgentStatus::Idle;
        agent.current_task = None;
        tracing::debug!(agent_id, "Agent marked idle");
        Ok(())
    }

    /// `* -> Failed`. Clears the current task.
    pub fn mark_failed(&self, agent_id: usize, reason: Option<&str>) -> PoolResult<()> {
        let mut agents = self.lock();
        let agent = agents
            .get_mut(agent_id)
            .ok_or(PoolError::UnknownAgent(agent_id))?;
        agent.status = AgentStatus::Failed;
        agent.current_task = None;
        agent.last_error = reason.map(str::to_string);
        tracing::warn!(agent_id, reason = reason.unwrap_or("unspecified"), "Agent marked failed");
        Ok(())
    }

    /// `Failed -> Idle`. The only way back from Failed.
    pub fn reset_agent(&self, agent_id: usize) -> PoolResult<()> {
        let mut agents = self.lock();
        let agent = agents
            .get_mut(agent_id)
            .ok_or(PoolError::UnknownAgent(agent_id))?;
        if agent.status != AgentStatus::Failed {
            return Err(PoolError::InvalidTransition {
                agent_id,
                from: agent.status,
                action: "reset",
            });
        }
        agent.status = AgentStatus::Idle;
        agent.last_error = None;
        tracing::info!(agent_id, "Agent reset");
        Ok(())
    }

    pub fn status(&self, agent_id: usize) -> Option<AgentStatus> {
        self.lock().get(agent_id).map(|agent| agent.status)
    }

    pub fn current_task(&self, agent_id: usize) -> Option<TaskId> {
        self.lock()
            .get(agent_id)
            .and_then(|agent| agent.current_task.clone())
    }

    /// Remote-execution client bound to an agent.
    pub fn client(&self, agent_id: usize) -> Option<Arc<dyn RemoteExecutor>> {
        self.clients.get(agent_id).cloned()
    }

    /// Snapshot of every slot.
    pub fn agents(&self) -> Vec<ManagedAgent> {
        self.lock().clone()
    }

    pub fn get_stats(&self) -> PoolStats {
        let agents = self.lock();
        let mut stats = PoolStats {
            total: agents.len(),
            ..Default::default()
        };
        for agent in agents.iter() {
            match agent.status {
                AgentStatus::Idle => stats.idle += 1,
                AgentStatus::Busy => stats.busy += 1,
                AgentStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }
}

impl fmt::Debug for AgentPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentPool")
            .field("agents", &*self.lock())
            .finish()
    }
}

fn validate_size(size: usize) -> PoolResult<()> {
    if !(MIN_AGENTS..=MAX_AGENTS).contains(&size) {
        return Err(PoolError::InvalidSize {
            requested: size,
            min: MIN_AGENTS,
            max: MAX_AGENTS,
        });
    }
    Ok(())
}
