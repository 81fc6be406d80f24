//! Retrying invoker for operations that can spuriously come back empty.
//!
//! Remote command execution against live OS state sometimes returns nothing
//! (session churn, a race with the OS). An empty result is retried a bounded
//! number of times with a fixed delay; an error is returned immediately and
//! never retried.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use hostprobe_core::config::RetrySettings;
use tracing::{error, info, warn};

use crate::outcome::{Emptiness, Outcome};

/// How many times to retry an empty result and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Fixed delay before each retry.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            delay: Duration::from_millis(500),
        }
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            delay: Duration::from_millis(settings.delay_ms),
        }
    }
}

/// Diagnostic emitted while invoking an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryEvent {
    /// Empty result; retry number `attempt` is about to run.
    Retry { attempt: u32 },
    /// A retry produced a value after an initially empty result.
    Recovery { attempts: u32 },
    /// The operation failed; not retried.
    Error { attempt: u32, reason: String },
    /// Every attempt was empty.
    Exhausted { attempts: u32 },
}

/// Outcome of one invocation plus what happened along the way.
#[derive(Debug, Clone)]
pub struct Invocation<T> {
    pub outcome: Outcome<T>,
    /// Total calls made to the operation.
    pub attempts: u32,
    pub events: Vec<RetryEvent>,
}

impl<T> Invocation<T> {
    pub fn retries(&self) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e, RetryEvent::Retry { .. }))
            .count()
    }

    pub fn recovered(&self) -> bool {
        self.events
            .iter()
            .any(|e| matches!(e, RetryEvent::Recovery { .. }))
    }
}

/// Per-invocation bookkeeping.
struct RetryContext<'a> {
    operation_name: &'a str,
    attempt: u32,
    had_empty_initial_result: bool,
    events: Vec<RetryEvent>,
}

impl RetryContext<'_> {
    fn emit(&mut self, event: RetryEvent) {
        let operation = self.operation_name;
        match &event {
            RetryEvent::Retry { attempt } => {
                warn!(operation, attempt, "[RETRY] empty result, retrying");
            }
            RetryEvent::Recovery { attempts } => {
                info!(operation, attempts, "[RECOVERY] retry produced a result");
            }
            RetryEvent::Error { attempt, reason } => {
                error!(operation, attempt, reason = %reason, "[ERROR] operation failed; not retrying");
            }
            RetryEvent::Exhausted { attempts } => {
                warn!(operation, attempts, "[EXHAUSTED] every attempt returned an empty result");
            }
        }
        self.events.push(event);
    }

    fn finish<T>(self, outcome: Outcome<T>) -> Invocation<T> {
        Invocation {
            outcome,
            attempts: self.attempt + 1,
            events: self.events,
        }
    }
}

/// Wraps operations with empty-result retries.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryingInvoker {
    policy: RetryPolicy,
}

impl RetryingInvoker {
    pub const fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub const fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Invoke `op`, retrying empty results. Never panics or returns an error
    /// type: failures come back as [`Outcome::Error`].
    pub async fn invoke<T, E, F, Fut>(&self, operation_name: &str, op: F) -> Outcome<T>
    where
        T: Emptiness,
        E: fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.invoke_with_report(operation_name, op).await.outcome
    }

    /// Like [`Self::invoke`], also returning attempts and emitted diagnostics.
    pub async fn invoke_with_report<T, E, F, Fut>(
        &self,
        operation_name: &str,
        mut op: F,
    ) -> Invocation<T>
    where
        T: Emptiness,
        E: fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut ctx = RetryContext {
            operation_name,
            attempt: 0,
            had_empty_initial_result: false,
            events: Vec::new(),
        };

        loop {
            match op().await {
                Err(e) => {
                    let attempt = ctx.attempt;
                    ctx.emit(RetryEvent::Error {
                        attempt,
                        reason: e.to_string(),
                    });
                    return ctx.finish(Outcome::Error(e.to_string()));
                }
                Ok(value) if !value.is_empty_result() => {
                    if ctx.had_empty_initial_result {
                        let attempts = ctx.attempt + 1;
                        ctx.emit(RetryEvent::Recovery { attempts });
                    }
                    return ctx.finish(Outcome::Ok(value));
                }
                Ok(_) => {
                    if ctx.attempt == 0 {
                        ctx.had_empty_initial_result = true;
                    }
                    if ctx.attempt >= self.policy.max_retries {
                        let attempts = ctx.attempt + 1;
                        ctx.emit(RetryEvent::Exhausted { attempts });
                        return ctx.finish(Outcome::Empty);
                    }
                    ctx.attempt += 1;
                    let attempt = ctx.attempt;
                    ctx.emit(RetryEvent::Retry { attempt });
                    tokio::time::sleep(self.policy.delay).await;
                }
            }
        }
    }
}
