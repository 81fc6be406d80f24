//! Task descriptors and per-task outcomes.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::outcome::Outcome;

/// Boxed future produced by a task body.
pub type TaskFuture<T> = Pin<Box<dyn Future<Output = Outcome<T>> + Send + 'static>>;

type Invoke<T> = Box<dyn FnOnce(TaskContext) -> TaskFuture<T> + Send>;

/// Handed to every task body when it starts.
#[derive(Debug, Clone)]
pub struct TaskContext {
    /// Task name.
    pub name: String,
    /// Position of the task in the submitted batch.
    pub index: usize,
    /// Cancelled when the task times out or the batch is abandoned.
    pub cancel: CancellationToken,
}

impl TaskContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// A named unit of work for [`super::BatchScheduler`].
pub struct TaskDescriptor<T> {
    name: String,
    result_key: String,
    timeout: Option<Duration>,
    invoke: Invoke<T>,
}

impl<T: Send + 'static> TaskDescriptor<T> {
    /// Create a task whose result is reported under `name`.
    pub fn new<F, Fut>(name: impl Into<String>, invoke: F) -> Self
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = Outcome<T>> + Send + 'static,
    {
        let name = name.into();
        Self {
            result_key: name.clone(),
            name,
            timeout: None,
            invoke: Box::new(move |ctx| Box::pin(invoke(ctx))),
        }
    }
}

impl<T> TaskDescriptor<T> {
    #[must_use]
    pub fn with_result_key(mut self, key: impl Into<String>) -> Self {
        self.result_key = key.into();
        self
    }

    /// Override the scheduler's per-task timeout for this task.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn result_key(&self) -> &str {
        &self.result_key
    }

    pub const fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub(crate) fn start(self, ctx: TaskContext) -> TaskFuture<T> {
        (self.invoke)(ctx)
    }
}

impl<T> fmt::Debug for TaskDescriptor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDescriptor")
            .field("name", &self.name)
            .field("result_key", &self.result_key)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Terminal state of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskStatus {
    Succeeded,
    /// Finished without a usable result.
    Failed { reason: String },
    /// Per-task timeout elapsed first.
    TimedOut,
    /// Still queued or running when the batch gave up on it.
    Abandoned,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded => f.write_str("succeeded"),
            Self::Failed { reason } => write!(f, "failed ({reason})"),
            Self::TimedOut => f.write_str("timed out"),
            Self::Abandoned => f.write_str("abandoned"),
        }
    }
}

/// What one task produced. Exactly one per submitted descriptor.
#[derive(Debug, Clone)]
pub struct TaskOutcome<T> {
    pub name: String,
    pub result_key: String,
    pub result: Option<T>,
    pub status: TaskStatus,
    /// Time from start to settle. Zero for tasks that never started.
    pub duration: Duration,
}

impl<T> TaskOutcome<T> {
    pub const fn succeeded(&self) -> bool {
        matches!(self.status, TaskStatus::Succeeded)
    }

    pub(crate) fn from_outcome(
        name: String,
        result_key: String,
        outcome: Outcome<T>,
        duration: Duration,
    ) -> Self {
        let status = match &outcome {
            Outcome::Ok(_) => TaskStatus::Succeeded,
            Outcome::Empty | Outcome::Error(_) => TaskStatus::Failed {
                reason: outcome.failure_reason().unwrap_or_default(),
            },
        };
        Self {
            name,
            result_key,
            result: outcome.ok(),
            status,
            duration,
        }
    }

    pub(crate) const fn unfinished(
        name: String,
        result_key: String,
        status: TaskStatus,
        duration: Duration,
    ) -> Self {
        Self {
            name,
            result_key,
            result: None,
            status,
            duration,
        }
    }
}
