//! Shell command channels.
//!
//! - [`ShellChannel`]: one long-lived interactive shell shared by many
//!   concurrent commands, with framed, correlated output.
//! - [`EphemeralRunner`]: one shell process per command, used when no
//!   persistent channel is running.

pub mod ephemeral;
pub mod framing;
pub mod pending;
pub mod shell;

use std::path::PathBuf;
use std::time::Duration;

use hostprobe_core::ShellDialect;
use hostprobe_core::config::ShellSettings;

pub use ephemeral::EphemeralRunner;
pub use pending::{PendingCommand, PendingRegistry};
pub use shell::ShellChannel;

/// How to spawn the shell behind a channel or an ephemeral run.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub dialect: ShellDialect,
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Grace period after the exit instruction before the shell is killed.
    pub terminate_timeout: Duration,
}

impl ChannelConfig {
    /// Defaults for a dialect: its usual program, reading commands from stdin.
    pub fn for_dialect(dialect: ShellDialect) -> Self {
        Self {
            dialect,
            program: PathBuf::from(dialect.default_program()),
            args: default_args(dialect),
            terminate_timeout: Duration::from_secs(5),
        }
    }

    #[must_use]
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    #[must_use]
    pub const fn with_terminate_timeout(mut self, timeout: Duration) -> Self {
        self.terminate_timeout = timeout;
        self
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self::for_dialect(ShellDialect::default())
    }
}

impl From<&ShellSettings> for ChannelConfig {
    fn from(settings: &ShellSettings) -> Self {
        Self::for_dialect(settings.dialect)
            .with_program(settings.program())
            .with_terminate_timeout(Duration::from_millis(settings.terminate_timeout_ms))
    }
}

fn default_args(dialect: ShellDialect) -> Vec<String> {
    match dialect {
        ShellDialect::Posix => Vec::new(),
        ShellDialect::PowerShell => ["-NoLogo", "-NoProfile", "-NonInteractive", "-Command", "-"]
            .iter()
            .map(ToString::to_string)
            .collect(),
    }
}

/// Errors delivered to callers of [`ShellChannel::send`].
///
/// Cloneable so that one fault can be delivered to every pending command.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("Shell channel is not running")]
    NotStarted,

    #[error("Failed to spawn shell: {reason}")]
    SpawnFailed { reason: String },

    #[error("Shell stdin closed: {reason}")]
    StdinClosed { reason: String },

    #[error("Shell wrote to stderr: {line}")]
    Stderr { line: String },

    #[error("Shell exited: {reason}")]
    ShellExited { reason: String },

    #[error("Shell channel stopped")]
    Stopped,

    #[error("Command dropped before completion")]
    Dropped,
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn posix_defaults() {
        let config = ChannelConfig::for_dialect(ShellDialect::Posix);
        assert_eq!(config.program, PathBuf::from("/bin/sh"));
        assert!(config.args.is_empty());
    }

    #[test]
    fn powershell_reads_commands_from_stdin() {
        let config = ChannelConfig::for_dialect(ShellDialect::PowerShell);
        assert_eq!(config.program, PathBuf::from("powershell"));
        assert_eq!(config.args.last().map(String::as_str), Some("-"));
    }

    #[test]
    fn from_settings_uses_program_override() {
        let settings = ShellSettings {
            dialect: ShellDialect::Posix,
            program: Some(PathBuf::from("/bin/bash")),
            persistent: true,
            terminate_timeout_ms: 250,
        };
        let config = ChannelConfig::from(&settings);
        assert_eq!(config.program, PathBuf::from("/bin/bash"));
        assert_eq!(config.terminate_timeout, Duration::from_millis(250));
    }
}
