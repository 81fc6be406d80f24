//! Batch results and diagnostics summary.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;

use super::task::{TaskOutcome, TaskStatus};

/// Everything a finished batch produced.
///
/// `outcomes[i]` always belongs to the i-th submitted task, whatever order
/// the tasks finished in.
#[derive(Debug, Clone)]
pub struct BatchReport<T> {
    pub outcomes: Vec<TaskOutcome<T>>,
    /// Names of succeeded tasks, in completion order.
    pub succeeded_names: Vec<String>,
    /// Names of failed or timed-out tasks, in completion order.
    pub failed_names: Vec<String>,
    pub elapsed: Duration,
    /// The global deadline fired before every task settled.
    pub deadline_exceeded: bool,
    /// The batch was cancelled through its cancellation token.
    pub cancelled: bool,
}

impl<T> BatchReport<T> {
    /// Result slots in submission order.
    pub fn results(&self) -> Vec<Option<&T>> {
        self.outcomes.iter().map(|o| o.result.as_ref()).collect()
    }

    pub fn into_results(self) -> Vec<Option<T>> {
        self.outcomes.into_iter().map(|o| o.result).collect()
    }

    /// `result_key → result` for every task.
    pub fn into_map(self) -> BTreeMap<String, Option<T>> {
        self.outcomes
            .into_iter()
            .map(|o| (o.result_key, o.result))
            .collect()
    }

    /// Tasks that never settled on their own (queued or running when abandoned).
    pub fn pending_names(&self) -> Vec<String> {
        self.outcomes
            .iter()
            .filter(|o| o.status == TaskStatus::Abandoned)
            .map(|o| o.name.clone())
            .collect()
    }

    pub fn summary(&self) -> BatchSummary {
        BatchSummary {
            total: self.outcomes.len(),
            succeeded: self.succeeded_names.clone(),
            failed: self.failed_names.clone(),
            pending: self.pending_names(),
            tasks: self
                .outcomes
                .iter()
                .map(|o| TaskTiming {
                    name: o.name.clone(),
                    result_key: o.result_key.clone(),
                    status: o.status.clone(),
                    duration_ms: duration_ms(o.duration),
                })
                .collect(),
            elapsed_ms: duration_ms(self.elapsed),
            deadline_exceeded: self.deadline_exceeded,
            cancelled: self.cancelled,
        }
    }
}

/// Serialisable diagnostics for a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
    pub pending: Vec<String>,
    pub tasks: Vec<TaskTiming>,
    pub elapsed_ms: u64,
    pub deadline_exceeded: bool,
    pub cancelled: bool,
}

/// Per-task status and duration, in submission order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskTiming {
    pub name: String,
    pub result_key: String,
    #[serde(flatten)]
    pub status: TaskStatus,
    pub duration_ms: u64,
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::outcome::Outcome;

    fn report() -> BatchReport<&'static str> {
        BatchReport {
            outcomes: vec![
                TaskOutcome::from_outcome(
                    "t0".into(),
                    "k0".into(),
                    Outcome::Ok("A"),
                    Duration::from_millis(30),
                ),
                TaskOutcome::unfinished(
                    "t1".into(),
                    "k1".into(),
                    TaskStatus::TimedOut,
                    Duration::from_millis(100),
                ),
                TaskOutcome::unfinished(
                    "t2".into(),
                    "k2".into(),
                    TaskStatus::Abandoned,
                    Duration::ZERO,
                ),
            ],
            succeeded_names: vec!["t0".into()],
            failed_names: vec!["t1".into()],
            elapsed: Duration::from_millis(150),
            deadline_exceeded: true,
            cancelled: false,
        }
    }

    #[test]
    fn results_follow_submission_order() {
        assert_eq!(report().results(), vec![Some(&"A"), None, None]);
    }

    #[test]
    fn map_is_keyed_by_result_key() {
        let map = report().into_map();
        assert_eq!(map.get("k0"), Some(&Some("A")));
        assert_eq!(map.get("k1"), Some(&None));
        assert_eq!(map.len(), 3);
    }

    #[test]
    fn summary_lists_pending_and_durations() {
        let summary = report().summary();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.succeeded, vec!["t0"]);
        assert_eq!(summary.failed, vec!["t1"]);
        assert_eq!(summary.pending, vec!["t2"]);
        assert_eq!(summary.tasks[1].duration_ms, 100);
        assert!(summary.deadline_exceeded);
    }

    #[test]
    fn summary_serializes() {
        let json = serde_json::to_value(report().summary()).unwrap();
        assert_eq!(json["tasks"][1]["status"], "timed_out");
        assert_eq!(json["tasks"][0]["duration_ms"], 30);
        assert_eq!(json["pending"][0], "t2");
    }
}
