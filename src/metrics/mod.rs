//! Progress tracking for orchestration runs.
//!
//! [`ProgressMonitor`] is a cheap-to-clone counter of in-flight, completed and
//! failed tasks that can be shared with reporting code. [`OutcomeSummary`]
//! condenses a finished run's outcomes.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

use crate::error::ProgressError;
use crate::task::{TaskId, TaskOutcome, TaskStatus};

/// Default interval between periodic progress log lines.
pub const DEFAULT_LOG_INTERVAL: Duration = Duration::from_secs(30);

/// A task lifecycle event fed to the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressUpdate {
    /// A task was dispatched.
    Started,
    /// A dispatched task completed successfully.
    Completed { duration: Duration },
    /// A dispatched task failed.
    Failed { duration: Duration },
}

/// Point-in-time progress view.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub timestamp: DateTime<Utc>,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub in_progress: usize,
    /// Not yet dispatched.
    pub remaining: usize,
    pub elapsed: Duration,
    /// Finished (completed or failed) tasks as a share of the total.
    pub completion_percentage: f64,
    /// Finished tasks per second.
    pub throughput: f64,
    pub average_duration: Option<Duration>,
    /// Estimated time until every task has finished.
    pub eta: Option<Duration>,
}

#[derive(Debug)]
struct ProgressState {
    total: usize,
    completed: usize,
    failed: usize,
    in_progress: usize,
    finished_duration: Duration,
    started: Instant,
    log_interval: Duration,
    last_log: Instant,
}

impl ProgressState {
    fn new(total: usize, log_interval: Duration) -> Self {
        let now = Instant::now();
        Self {
            total,
            completed: 0,
            failed: 0,
            in_progress: 0,
            finished_duration: Duration::ZERO,
            started: now,
            log_interval,
            last_log: now,
        }
    }

    fn finished(&self) -> usize {
        self.completed + self.failed
    }

    fn snapshot(&self) -> ProgressSnapshot {
        let elapsed = self.started.elapsed();
        let finished = self.finished();
        let remaining = self
            .total
            .saturating_sub(finished)
            .saturating_sub(self.in_progress);

        let throughput = if elapsed.is_zero() {
            0.0
        } else {
            finished as f64 / elapsed.as_secs_f64()
        };
        let completion_percentage = if self.total == 0 {
            100.0
        } else {
            (finished as f64 / self.total as f64 * 100.0).min(100.0)
        };
        let average_duration =
            (finished > 0).then(|| self.finished_duration / finished as u32);
        let eta = (throughput > 0.0).then(|| {
            Duration::from_secs_f64((remaining + self.in_progress) as f64 / throughput)
        });

        ProgressSnapshot {
            timestamp: Utc::now(),
            total: self.total,
            completed: self.completed,
            failed: self.failed,
            in_progress: self.in_progress,
            remaining,
            elapsed,
            completion_percentage,
            throughput,
            average_duration,
            eta,
        }
    }
}

/// Shared, mutation-safe progress counters.
#[derive(Debug, Clone)]
pub struct ProgressMonitor {
    inner: Arc<Mutex<ProgressState>>,
}

impl ProgressMonitor {
    /// Create a monitor for a run of `total_tasks` tasks.
    pub fn new(total_tasks: usize, log_interval: Duration) -> Result<Self, ProgressError> {
        if total_tasks == 0 {
            return Err(ProgressError::EmptyRun);
        }
        Ok(Self {
            inner: Arc::new(Mutex::new(ProgressState::new(total_tasks, log_interval))),
        })
    }

    /// Record a lifecycle event.
    pub fn record(&self, update: ProgressUpdate) {
        let Ok(mut state) = self.inner.lock() else {
            return;
        };
        match update {
            ProgressUpdate::Started => state.in_progress += 1,
            ProgressUpdate::Completed { duration } => {
                state.in_progress = state.in_progress.saturating_sub(1);
                state.completed += 1;
                state.finished_duration += duration;
            }
            ProgressUpdate::Failed { duration } => {
                state.in_progress = state.in_progress.saturating_sub(1);
                state.failed += 1;
                state.finished_duration += duration;
            }
        }

        if state.last_log.elapsed() >= state.log_interval {
            state.last_log = Instant::now();
            let snapshot = state.snapshot();
            tracing::info!(
                completed = snapshot.completed,
                failed = snapshot.failed,
                in_progress = snapshot.in_progress,
                total = snapshot.total,
                percent = snapshot.completion_percentage,
                eta_secs = snapshot.eta.map(|eta| eta.as_secs()).unwrap_or_default(),
                "Orchestration progress"
            );
        }
    }

    /// Record the terminal outcome of a dispatched task.
    pub fn record_outcome(&self, outcome: &TaskOutcome) {
        let duration = outcome.duration;
        match outcome.status {
            TaskStatus::Completed => self.record(ProgressUpdate::Completed { duration }),
            _ => self.record(ProgressUpdate::Failed { duration }),
        }
    }

    /// Grow the total, e.g. when tasks are discovered at runtime.
    pub fn add_tasks(&self, count: usize) {
        if let Ok(mut state) = self.inner.lock() {
            state.total += count;
        }
    }

    pub fn snapshot(&self) -> Option<ProgressSnapshot> {
        self.inner.lock().ok().map(|state| state.snapshot())
    }

    /// Zero every counter and restart the clock. The total is kept.
    pub fn reset(&self) {
        if let Ok(mut state) = self.inner.lock() {
            let (total, interval) = (state.total, state.log_interval);
            *state = ProgressState::new(total, interval);
        }
    }

    /// True once every task has completed or failed.
    pub fn is_complete(&self) -> bool {
        self.inner
            .lock()
            .map(|state| state.finished() >= state.total)
            .unwrap_or(false)
    }
}

/// Aggregate view over a run's outcomes.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OutcomeSummary {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub total_retries: u32,
    pub total_duration: Duration,
    pub failed_tasks: Vec<TaskId>,
}

impl OutcomeSummary {
    pub fn from_outcomes(outcomes: &[TaskOutcome]) -> Self {
        let mut summary = Self {
            total: outcomes.len(),
            ..Default::default()
        };
        for outcome in outcomes {
            if outcome.is_success() {
                summary.completed += 1;
            } else {
                summary.failed += 1;
                summary.failed_tasks.push(outcome.task_id.clone());
            }
            summary.total_retries += outcome.retry_count;
            summary.total_duration += outcome.duration;
        }
        summary.failed_tasks.sort();
        summary
    }

    /// Share of successful outcomes in `[0, 1]`. An empty run counts as 1.
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.completed as f64 / self.total as f64
        }
    }

    pub fn average_duration(&self) -> Duration {
        if self.total == 0 {
            Duration::ZERO
        } else {
            self.total_duration / self.total as u32
        }
    }
}

/// Format a summary as markdown for reports.
pub fn format_summary(summary: &OutcomeSummary) -> String {
    let mut output = String::from("## Orchestration Summary\n\n");
    output.push_str(&format!(
        "- **Total Tasks**: {} ({} completed, {} failed)\n",
        summary.total, summary.completed, summary.failed
    ));
    output.push_str(&format!(
        "- **Success Rate**: {:.1}%\n",
        summary.success_rate() * 100.0
    ));
    output.push_str(&format!("- **Retries**: {}\n", summary.total_retries));
    output.push_str(&format!(
        "- **Average Duration**: {:.2}s\n",
        summary.average_duration().as_secs_f64()
    ));

    if !summary.failed_tasks.is_empty() {
        output.push_str("\n### Failed Tasks\n");
        for task_id in &summary.failed_tasks {
            output.push_str(&format!("- {}\n", task_id));
        }
    }
    output
}

/// Format a progress snapshot as a single status line.
pub fn format_progress(snapshot: &ProgressSnapshot) -> String {
    let eta = snapshot
        .eta
        .map(|eta| format!("{}s", eta.as_secs()))
        .unwrap_or_else(|| "unknown".to_string());
    format!(
        "{}/{} done ({:.1}%), {} failed, {} running, {} queued, ETA {}",
        snapshot.completed + snapshot.failed,
        snapshot.total,
        snapshot.completion_percentage,
        snapshot.failed,
        snapshot.in_progress,
        snapshot.remaining,
        eta
    )
}
