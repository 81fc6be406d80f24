//! Pending command registry.
//!
//! Tracks commands written to a persistent shell that are still awaiting
//! their output frame. Entries are kept in write order; each completion
//! handle fires exactly once and is removed as it fires.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::ChannelError;

/// Receives the result of one multiplexed command.
pub type CompletionReceiver = oneshot::Receiver<Result<String, ChannelError>>;

/// A command awaiting its output frame.
#[derive(Debug)]
pub struct PendingCommand {
    /// Correlation ID, unique among outstanding commands.
    pub id: String,
    /// Command text as submitted.
    pub command: String,
    /// When the command was registered.
    pub enqueued_at: Instant,
    completion: oneshot::Sender<Result<String, ChannelError>>,
}

impl PendingCommand {
    /// Time since registration.
    pub fn age(&self) -> Duration {
        self.enqueued_at.elapsed()
    }

    fn fire(self, result: Result<String, ChannelError>) {
        if self.completion.send(result).is_err() {
            debug!(id = %self.id, "Caller stopped waiting before completion");
        }
    }
}

/// Ordered registry of in-flight commands.
#[derive(Debug, Default)]
pub struct PendingRegistry {
    commands: VecDeque<PendingCommand>,
}

impl PendingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate a correlation ID that no outstanding command uses.
    pub fn fresh_id(&self) -> String {
        loop {
            let id = uuid::Uuid::new_v4().simple().to_string();
            if !self.contains(&id) {
                return id;
            }
        }
    }

    /// Register a command at the back of the queue.
    pub fn register(&mut self, command: &str) -> (String, CompletionReceiver) {
        let id = self.fresh_id();
        let (tx, rx) = oneshot::channel();
        self.commands.push_back(PendingCommand {
            id: id.clone(),
            command: command.to_string(),
            enqueued_at: Instant::now(),
            completion: tx,
        });
        debug!(id, pending = self.commands.len(), "Registered pending command");
        (id, rx)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.commands.iter().any(|c| c.id == id)
    }

    /// Remove a command without firing it.
    pub fn take(&mut self, id: &str) -> Option<PendingCommand> {
        let pos = self.commands.iter().position(|c| c.id == id)?;
        self.commands.remove(pos)
    }

    /// Deliver output to the command with `id`.
    ///
    /// Returns `false` if no such command is pending.
    pub fn complete(&mut self, id: &str, text: String) -> bool {
        let Some(pos) = self.commands.iter().position(|c| c.id == id) else {
            return false;
        };
        if pos != 0 {
            warn!(
                id,
                position = pos,
                "Frame completed out of write order; earlier commands are still pending"
            );
        }
        let Some(command) = self.commands.remove(pos) else {
            return false;
        };
        debug!(id, elapsed_ms = command.age().as_millis(), "Command completed");
        command.fire(Ok(text));
        true
    }

    /// Fail every pending command with `error`, oldest first.
    ///
    /// Returns the number of commands failed.
    pub fn fail_all(&mut self, error: &ChannelError) -> usize {
        let count = self.commands.len();
        for command in self.commands.drain(..) {
            command.fire(Err(error.clone()));
        }
        count
    }

    /// Correlation IDs in write order.
    pub fn ids(&self) -> Vec<String> {
        self.commands.iter().map(|c| c.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_then_complete() {
        let mut registry = PendingRegistry::new();
        let (id, rx) = registry.register("hostname");

        assert!(registry.contains(&id));
        assert!(registry.complete(&id, "box-1\n".into()));
        assert!(registry.is_empty());
        assert_eq!(rx.await.unwrap().unwrap(), "box-1\n");
    }

    #[tokio::test]
    async fn complete_unknown_id_is_ignored() {
        let mut registry = PendingRegistry::new();
        let (_id, _rx) = registry.register("uptime");
        assert!(!registry.complete("nope", "x".into()));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn completes_only_once() {
        let mut registry = PendingRegistry::new();
        let (id, _rx) = registry.register("uptime");
        assert!(registry.complete(&id, "a".into()));
        assert!(!registry.complete(&id, "b".into()));
    }

    #[test]
    fn ids_preserve_write_order() {
        let mut registry = PendingRegistry::new();
        let (a, _ra) = registry.register("a");
        let (b, _rb) = registry.register("b");
        let (c, _rc) = registry.register("c");
        assert_eq!(registry.ids(), vec![a, b, c]);
    }

    #[test]
    fn ids_are_unique_and_printable() {
        let mut registry = PendingRegistry::new();
        let mut receivers = Vec::new();
        for _ in 0..100 {
            receivers.push(registry.register("x"));
        }
        let ids = registry.ids();
        let unique: std::collections::HashSet<_> = ids.iter().collect();
        assert_eq!(unique.len(), 100);
        assert!(ids.iter().all(|id| id.chars().all(|c| c.is_ascii_alphanumeric())));
    }

    #[tokio::test]
    async fn fail_all_fires_each_command_once() {
        let mut registry = PendingRegistry::new();
        let receivers: Vec<_> = (0..5).map(|i| registry.register(&format!("cmd {i}")).1).collect();

        let failed = registry.fail_all(&ChannelError::ShellExited {
            reason: "killed".into(),
        });
        assert_eq!(failed, 5);
        assert!(registry.is_empty());

        for rx in receivers {
            let err = rx.await.unwrap().unwrap_err();
            assert!(matches!(err, ChannelError::ShellExited { .. }));
        }
    }

    #[tokio::test]
    async fn dropped_receiver_does_not_break_registry() {
        let mut registry = PendingRegistry::new();
        let (id, rx) = registry.register("x");
        drop(rx);
        assert!(registry.complete(&id, "late".into()));
        assert!(registry.is_empty());
    }

    #[test]
    fn take_removes_without_firing() {
        let mut registry = PendingRegistry::new();
        let (id, _rx) = registry.register("x");
        let taken = registry.take(&id).unwrap();
        assert_eq!(taken.command, "x");
        assert!(registry.take(&id).is_none());
    }
}
