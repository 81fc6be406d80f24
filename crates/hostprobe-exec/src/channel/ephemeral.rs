//! One-process-per-command fallback runner.

use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use super::ChannelConfig;

/// Spawns a fresh shell for every command and returns its whole stdout.
///
/// Never fails: spawn and I/O errors are logged and yield an empty string.
/// Dropping the future kills the shell.
#[derive(Debug, Clone)]
pub struct EphemeralRunner {
    program: PathBuf,
    args: Vec<String>,
}

impl EphemeralRunner {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn from_config(config: &ChannelConfig) -> Self {
        Self::new(config.program.clone(), config.args.clone())
    }

    pub async fn run(&self, command: &str) -> String {
        let mut child = match Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                warn!(program = %self.program.display(), error = %e, "Failed to spawn shell");
                return String::new();
            }
        };

        if let Some(mut stdin) = child.stdin.take() {
            let script = format!("{command}\n");
            if let Err(e) = stdin.write_all(script.as_bytes()).await {
                warn!(error = %e, "Failed to write command to shell stdin");
            }
            // stdin dropped here: EOF lets the shell exit after the command.
        }

        match child.wait_with_output().await {
            Ok(output) => {
                debug!(status = ?output.status, bytes = output.stdout.len(), "Ephemeral shell finished");
                String::from_utf8_lossy(&output.stdout).into_owned()
            }
            Err(e) => {
                warn!(error = %e, "Failed to collect shell output");
                String::new()
            }
        }
    }
}

#[cfg(all(test, unix))]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use hostprobe_core::ShellDialect;

    fn sh() -> EphemeralRunner {
        EphemeralRunner::from_config(&ChannelConfig::for_dialect(ShellDialect::Posix))
    }

    #[tokio::test]
    async fn returns_stdout() {
        assert_eq!(sh().run("echo one; echo two").await, "one\ntwo\n");
    }

    #[tokio::test]
    async fn stderr_is_not_captured() {
        assert_eq!(sh().run("echo visible; echo hidden >&2").await, "visible\n");
    }

    #[tokio::test]
    async fn spawn_failure_yields_empty_string() {
        let runner = EphemeralRunner::new("/nonexistent/hostprobe-shell", Vec::new());
        assert_eq!(runner.run("echo hi").await, "");
    }

    #[tokio::test]
    async fn failing_command_yields_its_stdout() {
        assert_eq!(sh().run("echo partial; exit 3").await, "partial\n");
    }
}
