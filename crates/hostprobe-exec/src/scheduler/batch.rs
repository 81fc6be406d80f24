//! The batch driver: FIFO queue, active set, timers.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::Duration;

use hostprobe_core::DeadlinePolicy;
use tokio::task::{Id, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::report::BatchReport;
use super::task::{TaskContext, TaskDescriptor, TaskOutcome, TaskStatus};
use super::{DEFAULT_MAX_CONCURRENCY, SchedulerConfig, SchedulerError};

/// Runs batches of [`TaskDescriptor`]s under a [`SchedulerConfig`].
#[derive(Debug)]
pub struct BatchScheduler {
    config: SchedulerConfig,
    cancel: CancellationToken,
}

impl BatchScheduler {
    /// Create a scheduler. A `max_concurrency` of zero uses the default.
    pub fn new(mut config: SchedulerConfig) -> Self {
        if config.max_concurrency == 0 {
            config.max_concurrency = DEFAULT_MAX_CONCURRENCY;
        }
        info!(
            max_concurrency = config.max_concurrency,
            policy = ?config.deadline_policy,
            "BatchScheduler created"
        );
        Self {
            config,
            cancel: CancellationToken::new(),
        }
    }

    pub const fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Cancelling this token abandons every unfinished task of running and
    /// future batches.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run `tasks` to completion, deadline or cancellation.
    ///
    /// Result slot `i` always belongs to `tasks[i]`. Per-task timeouts and
    /// failures are values in the report; only the global deadline under
    /// [`DeadlinePolicy::Fail`] produces an error.
    pub async fn run<T>(
        &self,
        tasks: Vec<TaskDescriptor<T>>,
    ) -> Result<BatchReport<T>, SchedulerError<T>>
    where
        T: fmt::Debug + Send + 'static,
    {
        let mut batch = Batch::new(self.config, self.cancel.child_token(), tasks);
        info!(
            total = batch.total(),
            max_concurrency = self.config.max_concurrency,
            "Batch started"
        );
        batch.drive(&self.cancel).await;

        let fail = batch.deadline_exceeded && self.config.deadline_policy == DeadlinePolicy::Fail;
        let report = batch.into_report();
        info!(
            elapsed_ms = report.elapsed.as_millis(),
            succeeded = report.succeeded_names.len(),
            failed = report.failed_names.len(),
            pending = report.pending_names().len(),
            "Batch finished"
        );

        if fail {
            return Err(SchedulerError::DeadlineExceeded {
                deadline: self.config.global_deadline,
                unfinished: report.pending_names().len(),
                report: Box::new(report),
            });
        }
        Ok(report)
    }
}

/// Name and result key of a submitted task.
struct Slot {
    name: String,
    result_key: String,
}

/// Counts reported by each `[PROGRESS]` line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Progress {
    completed: usize,
    total: usize,
    active: usize,
}

/// Snapshot logged as `[GLOBAL TIMEOUT]`.
#[derive(Debug, PartialEq, Eq)]
struct DeadlineReport<'a, T> {
    succeeded: &'a [String],
    failed: &'a [String],
    pending: Vec<&'a str>,
    partial: Vec<Option<&'a T>>,
}

/// State of one batch run.
struct Batch<T> {
    config: SchedulerConfig,
    token: CancellationToken,
    slots: Vec<Slot>,
    outcomes: Vec<Option<TaskOutcome<T>>>,
    queue: VecDeque<(usize, TaskDescriptor<T>)>,
    running: JoinSet<(usize, TaskOutcome<T>)>,
    /// Active tasks: join id → (slot index, start time).
    active: HashMap<Id, (usize, Instant)>,
    succeeded: Vec<String>,
    failed: Vec<String>,
    started_at: Instant,
    deadline_exceeded: bool,
    cancelled: bool,
}

impl<T> Batch<T>
where
    T: fmt::Debug + Send + 'static,
{
    fn new(config: SchedulerConfig, token: CancellationToken, tasks: Vec<TaskDescriptor<T>>) -> Self {
        let slots = tasks
            .iter()
            .map(|t| Slot {
                name: t.name().to_string(),
                result_key: t.result_key().to_string(),
            })
            .collect();
        let outcomes = tasks.iter().map(|_| None).collect();
        Self {
            config,
            token,
            slots,
            outcomes,
            queue: tasks.into_iter().enumerate().collect(),
            running: JoinSet::new(),
            active: HashMap::new(),
            succeeded: Vec::new(),
            failed: Vec::new(),
            started_at: Instant::now(),
            deadline_exceeded: false,
            cancelled: false,
        }
    }

    fn total(&self) -> usize {
        self.slots.len()
    }

    fn settled(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    async fn drive(&mut self, external: &CancellationToken) {
        let deadline = tokio::time::sleep(self.config.global_deadline);
        tokio::pin!(deadline);

        let period = self.config.progress_interval.max(Duration::from_millis(1));
        let mut progress = tokio::time::interval_at(Instant::now() + period, period);
        progress.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.fill();
        while !self.active.is_empty() {
            tokio::select! {
                biased;

                joined = self.running.join_next_with_id() => {
                    match joined {
                        Some(Ok((id, (index, outcome)))) => {
                            self.active.remove(&id);
                            self.settle(index, outcome);
                        }
                        Some(Err(e)) => {
                            if let Some((index, started)) = self.active.remove(&e.id()) {
                                let reason = if e.is_panic() { "task panicked" } else { "task aborted" };
                                let slot = &self.slots[index];
                                let outcome = TaskOutcome::unfinished(
                                    slot.name.clone(),
                                    slot.result_key.clone(),
                                    TaskStatus::Failed { reason: reason.to_string() },
                                    started.elapsed(),
                                );
                                self.settle(index, outcome);
                            }
                        }
                        None => break,
                    }
                    self.fill();
                }

                () = external.cancelled(), if !self.cancelled => {
                    self.cancelled = true;
                    warn!(
                        settled = self.settled(),
                        total = self.total(),
                        "Batch cancelled; abandoning unfinished tasks"
                    );
                    self.abandon();
                    break;
                }

                () = &mut deadline, if !self.deadline_exceeded => {
                    self.deadline_exceeded = true;
                    self.log_deadline_report();
                    if self.config.deadline_policy == DeadlinePolicy::Wait {
                        continue;
                    }
                    self.abandon();
                    break;
                }

                _ = progress.tick() => {
                    let Progress { completed, total, active } = self.progress();
                    info!(completed, total, active, "[PROGRESS] {completed}/{total}");
                }
            }
        }

        // Aborted tasks are reaped here; their output is discarded.
        self.running.shutdown().await;
    }

    /// Start queued tasks while there is room.
    fn fill(&mut self) {
        while self.active.len() < self.config.max_concurrency {
            let Some((index, task)) = self.queue.pop_front() else {
                break;
            };
            self.launch(index, task);
        }
    }

    fn launch(&mut self, index: usize, task: TaskDescriptor<T>) {
        let token = self.token.child_token();
        let ctx = TaskContext {
            name: task.name().to_string(),
            index,
            cancel: token.clone(),
        };
        let timeout = task.timeout().unwrap_or(self.config.per_task_timeout);
        let name = task.name().to_string();
        let result_key = task.result_key().to_string();
        debug!(task = %name, index, active = self.active.len() + 1, "Task started");

        let handle = self.running.spawn(async move {
            let started = Instant::now();
            let outcome = match tokio::time::timeout(timeout, task.start(ctx)).await {
                Ok(outcome) => {
                    TaskOutcome::from_outcome(name, result_key, outcome, started.elapsed())
                }
                Err(_) => {
                    token.cancel();
                    TaskOutcome::unfinished(name, result_key, TaskStatus::TimedOut, started.elapsed())
                }
            };
            (index, outcome)
        });
        self.active.insert(handle.id(), (index, Instant::now()));
    }

    fn settle(&mut self, index: usize, outcome: TaskOutcome<T>) {
        if self.outcomes[index].is_some() {
            return;
        }
        let duration_ms = outcome.duration.as_millis();
        match &outcome.status {
            TaskStatus::Succeeded => {
                debug!(task = %outcome.name, index, duration_ms, "Task succeeded");
                self.succeeded.push(outcome.name.clone());
            }
            TaskStatus::TimedOut => {
                warn!(task = %outcome.name, index, duration_ms, "Task timed out");
                self.failed.push(outcome.name.clone());
            }
            TaskStatus::Failed { reason } => {
                warn!(task = %outcome.name, index, duration_ms, reason = %reason, "Task failed");
                self.failed.push(outcome.name.clone());
            }
            TaskStatus::Abandoned => {}
        }
        self.outcomes[index] = Some(outcome);
    }

    /// Cancel the batch and mark every unfinished task abandoned.
    fn abandon(&mut self) {
        self.token.cancel();
        self.running.abort_all();

        for (_, (index, started)) in self.active.drain() {
            let slot = &self.slots[index];
            self.outcomes[index] = Some(TaskOutcome::unfinished(
                slot.name.clone(),
                slot.result_key.clone(),
                TaskStatus::Abandoned,
                started.elapsed(),
            ));
        }
        for (index, _) in self.queue.drain(..) {
            let slot = &self.slots[index];
            self.outcomes[index] = Some(TaskOutcome::unfinished(
                slot.name.clone(),
                slot.result_key.clone(),
                TaskStatus::Abandoned,
                Duration::ZERO,
            ));
        }
    }

    fn progress(&self) -> Progress {
        Progress {
            completed: self.settled(),
            total: self.total(),
            active: self.active.len(),
        }
    }

    fn deadline_report(&self) -> DeadlineReport<'_, T> {
        DeadlineReport {
            succeeded: &self.succeeded,
            failed: &self.failed,
            pending: self
                .slots
                .iter()
                .zip(&self.outcomes)
                .filter(|(_, outcome)| outcome.is_none())
                .map(|(slot, _)| slot.name.as_str())
                .collect(),
            partial: self
                .outcomes
                .iter()
                .map(|o| o.as_ref().and_then(|o| o.result.as_ref()))
                .collect(),
        }
    }

    fn log_deadline_report(&self) {
        let report = self.deadline_report();
        error!(
            deadline_ms = self.config.global_deadline.as_millis(),
            policy = ?self.config.deadline_policy,
            succeeded = ?report.succeeded,
            failed = ?report.failed,
            pending = ?report.pending,
            partial = ?report.partial,
            "[GLOBAL TIMEOUT] batch deadline exceeded"
        );
    }

    fn into_report(self) -> BatchReport<T> {
        let outcomes = self
            .outcomes
            .into_iter()
            .zip(self.slots)
            .map(|(outcome, slot)| {
                outcome.unwrap_or_else(|| {
                    TaskOutcome::unfinished(
                        slot.name,
                        slot.result_key,
                        TaskStatus::Abandoned,
                        Duration::ZERO,
                    )
                })
            })
            .collect();
        BatchReport {
            outcomes,
            succeeded_names: self.succeeded,
            failed_names: self.failed,
            elapsed: self.started_at.elapsed(),
            deadline_exceeded: self.deadline_exceeded,
            cancelled: self.cancelled,
        }
    }
}
