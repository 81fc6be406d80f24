//! Bounded-concurrency batch scheduler.
//!
//! Runs a fixed, named batch of tasks with a concurrency ceiling, a per-task
//! timeout and one global deadline, and reports results in submission order.

mod batch;
mod report;
mod task;

use std::fmt;
use std::time::Duration;

use hostprobe_core::DeadlinePolicy;
use hostprobe_core::config::SchedulerSettings;

pub use batch::BatchScheduler;
pub use report::{BatchReport, BatchSummary, TaskTiming};
pub use task::{TaskContext, TaskDescriptor, TaskFuture, TaskOutcome, TaskStatus};

/// Default concurrency ceiling, also used when zero is configured.
pub const DEFAULT_MAX_CONCURRENCY: usize = 8;

/// Limits and timers for one [`BatchScheduler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub max_concurrency: usize,
    /// Applies to tasks without their own timeout.
    pub per_task_timeout: Duration,
    pub global_deadline: Duration,
    pub progress_interval: Duration,
    pub deadline_policy: DeadlinePolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            per_task_timeout: Duration::from_secs(30),
            global_deadline: Duration::from_secs(5 * 60),
            progress_interval: Duration::from_secs(5),
            deadline_policy: DeadlinePolicy::Abandon,
        }
    }
}

impl From<&SchedulerSettings> for SchedulerConfig {
    fn from(settings: &SchedulerSettings) -> Self {
        Self {
            max_concurrency: settings.max_concurrency,
            per_task_timeout: Duration::from_millis(settings.task_timeout_ms),
            global_deadline: Duration::from_millis(settings.global_deadline_ms),
            progress_interval: Duration::from_millis(settings.progress_interval_ms),
            deadline_policy: settings.deadline_policy,
        }
    }
}

/// Errors from [`BatchScheduler::run`].
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError<T: fmt::Debug> {
    /// The global deadline fired under [`DeadlinePolicy::Fail`].
    #[error("Global deadline of {deadline:?} exceeded with {unfinished} unfinished task(s)")]
    DeadlineExceeded {
        deadline: Duration,
        unfinished: usize,
        /// Partial results; unfinished tasks are marked abandoned.
        report: Box<BatchReport<T>>,
    },
}

impl<T: fmt::Debug> SchedulerError<T> {
    /// Recover the partial report.
    pub fn into_report(self) -> BatchReport<T> {
        match self {
            Self::DeadlineExceeded { report, .. } => *report,
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn config_from_settings() {
        let settings = SchedulerSettings {
            max_concurrency: 3,
            task_timeout_ms: 250,
            global_deadline_ms: 1_000,
            progress_interval_ms: 100,
            deadline_policy: DeadlinePolicy::Wait,
        };
        let config = SchedulerConfig::from(&settings);
        assert_eq!(config.max_concurrency, 3);
        assert_eq!(config.per_task_timeout, Duration::from_millis(250));
        assert_eq!(config.global_deadline, Duration::from_secs(1));
        assert_eq!(config.progress_interval, Duration::from_millis(100));
        assert_eq!(config.deadline_policy, DeadlinePolicy::Wait);
    }

    #[test]
    fn defaults_match_settings_defaults() {
        assert_eq!(
            SchedulerConfig::from(&SchedulerSettings::default()),
            SchedulerConfig::default()
        );
    }
}
