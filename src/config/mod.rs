//! Orchestrator configuration.
//!
//! Settings are layered with the `config` crate: built-in defaults, then an
//! optional TOML file, then `TASKLOOM__`-prefixed environment variables, e.g.
//! `TASKLOOM__POOL__MAX_AGENTS=4`.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use ::config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, PoolResult};
use crate::pool::{AgentPool, RemoteExecutor, DEFAULT_MAX_AGENTS, MAX_AGENTS, MIN_AGENTS};
use crate::retry::RetryConfig;

const ENV_PREFIX: &str = "TASKLOOM";
const ENV_SEPARATOR: &str = "__";
const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
/// Base retry delays above this are flagged.
const LONG_RETRY_DELAY: Duration = Duration::from_secs(5 * 60);

/// Agent pool settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of agents, between 1 and 10.
    pub max_agents: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_agents: DEFAULT_MAX_AGENTS,
        }
    }
}

/// Polling and logging intervals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Sleep between idle-agent checks while every agent is busy.
    pub agent_poll_interval_ms: u64,
    /// Sleep between ticks when the graph is active but nothing is ready.
    pub tick_wait_interval_ms: u64,
    /// Interval between periodic progress log lines.
    pub progress_log_interval_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            agent_poll_interval_ms: 100,
            tick_wait_interval_ms: 500,
            progress_log_interval_secs: 30,
        }
    }
}

impl TimingConfig {
    pub fn agent_poll_interval(&self) -> Duration {
        Duration::from_millis(self.agent_poll_interval_ms)
    }

    pub fn tick_wait_interval(&self) -> Duration {
        Duration::from_millis(self.tick_wait_interval_ms)
    }

    pub fn progress_log_interval(&self) -> Duration {
        Duration::from_secs(self.progress_log_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Fallback filter when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub pool: PoolConfig,
    pub retry: RetryConfig,
    pub timing: TimingConfig,
    pub logging: LoggingConfig,
}

impl OrchestratorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Layer `path` (if it exists) and the environment over the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        tracing::debug!(path = %path.display(), "Loading configuration");

        let config: Self = Config::builder()
            .add_source(File::from(path).format(FileFormat::Toml).required(false))
            .add_source(environment())
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document. Environment overrides are not applied.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = Config::builder()
            .add_source(File::from_str(content, FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check hard limits and collect soft findings.
    ///
    /// Returns the warnings; each is also logged.
    pub fn validate(&self) -> Result<Vec<String>, ConfigError> {
        if !(MIN_AGENTS..=MAX_AGENTS).contains(&self.pool.max_agents) {
            return Err(ConfigError::Invalid(format!(
                "pool.max_agents must be between {} and {}, got {}",
                MIN_AGENTS, MAX_AGENTS, self.pool.max_agents
            )));
        }
        if !LOG_LEVELS.contains(&self.logging.level.to_ascii_lowercase().as_str()) {
            return Err(ConfigError::Invalid(format!(
                "logging.level must be one of {}, got '{}'",
                LOG_LEVELS.join("/"),
                self.logging.level
            )));
        }
        if self.timing.agent_poll_interval_ms == 0 || self.timing.tick_wait_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "timing poll and tick intervals must be non-zero".to_string(),
            ));
        }

        let mut warnings = Vec::new();
        if self.pool.max_agents == MAX_AGENTS {
            warnings.push(format!(
                "pool.max_agents is at the maximum of {}",
                MAX_AGENTS
            ));
        }
        if self.retry.base_delay() > LONG_RETRY_DELAY {
            warnings.push(format!(
                "retry.base_delay_ms of {} exceeds 5 minutes",
                self.retry.base_delay_ms
            ));
        }
        if self.retry.enabled && self.retry.max_attempts == 0 {
            warnings.push("retry.max_attempts is 0, tasks run once".to_string());
        }

        for warning in &warnings {
            tracing::warn!("{}", warning);
        }
        Ok(warnings)
    }

    pub fn with_max_agents(mut self, max_agents: usize) -> Self {
        self.pool.max_agents = max_agents;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timing(mut self, timing: TimingConfig) -> Self {
        self.timing = timing;
        self
    }

    /// Pool of `pool.max_agents` agents sharing one client.
    pub fn build_pool(&self, client: Arc<dyn RemoteExecutor>) -> PoolResult<AgentPool> {
        AgentPool::shared(self.pool.max_agents, client)
    }
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator(ENV_SEPARATOR)
        .separator(ENV_SEPARATOR)
        .try_parsing(true)
}
