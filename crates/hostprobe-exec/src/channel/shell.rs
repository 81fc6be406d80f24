//! Persistent shell channel.
//!
//! One long-lived shell process executes every command sent through the
//! channel, strictly in write order. Each command is framed with a fresh
//! correlation ID (see [`super::framing`]) and its output is routed back to
//! the caller that sent it.
//!
//! Task layout per shell process:
//! - stdin writer: drains an unbounded queue of framed instructions
//! - stdout reader: decodes frames and completes pending commands
//! - stderr reader: any stderr output fails every pending command
//!
//! Registration in the pending registry and enqueueing onto the stdin queue
//! happen under one lock, so registry order always equals write order.

use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::framing::{self, Desync, FrameDecoder, LineEvent};
use super::pending::PendingRegistry;
use super::{ChannelConfig, ChannelError};

/// Mutable state shared between the channel handle and its I/O tasks.
#[derive(Debug, Default)]
struct ChannelState {
    pending: PendingRegistry,
    /// Queue feeding the stdin writer. `None` while no shell is usable.
    stdin_tx: Option<mpsc::UnboundedSender<String>>,
    /// Bumped on every spawn so tasks of a dead shell cannot touch a new one.
    generation: u64,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<ChannelState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail everything pending on `generation` and mark the shell unusable.
    fn shut_down(&self, generation: u64, error: &ChannelError) {
        let mut state = self.lock();
        if state.generation != generation {
            return;
        }
        state.stdin_tx = None;
        let failed = state.pending.fail_all(error);
        drop(state);
        warn!(generation, failed, error = %error, "Shell channel shut down");
    }

    /// Fail everything pending on `generation`; the shell stays usable.
    fn fail_pending(&self, generation: u64, error: &ChannelError) {
        let mut state = self.lock();
        if state.generation != generation {
            return;
        }
        let failed = state.pending.fail_all(error);
        drop(state);
        if failed > 0 {
            warn!(generation, failed, error = %error, "Failed pending commands");
        }
    }

    fn complete(&self, generation: u64, frame: framing::Frame) {
        let mut state = self.lock();
        if state.generation != generation {
            return;
        }
        if !state.pending.complete(&frame.id, frame.text) {
            drop(state);
            debug!(id = %frame.id, "Discarding frame with no pending command");
        }
    }
}

struct LiveShell {
    child: Child,
    generation: u64,
}

/// A caller-owned persistent shell shared by many concurrent commands.
///
/// Cheap to share behind an `Arc`; every method takes `&self`.
pub struct ShellChannel {
    config: ChannelConfig,
    live: tokio::sync::Mutex<Option<LiveShell>>,
    shared: Arc<Shared>,
    spawn_count: AtomicUsize,
}

impl std::fmt::Debug for ShellChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShellChannel")
            .field("config", &self.config)
            .field("active", &self.is_active())
            .field("pending", &self.pending_count())
            .field("spawn_count", &self.spawn_count())
            .finish_non_exhaustive()
    }
}

impl ShellChannel {
    pub fn new(config: ChannelConfig) -> Self {
        Self {
            config,
            live: tokio::sync::Mutex::new(None),
            shared: Arc::new(Shared::default()),
            spawn_count: AtomicUsize::new(0),
        }
    }

    pub const fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Spawn the shell if none is running. Calling it again is a no-op.
    ///
    /// A shell that died since the last start is reaped and replaced.
    pub async fn start(&self) -> Result<(), ChannelError> {
        let mut live = self.live.lock().await;
        if live.is_some() && self.is_active() {
            debug!("Shell channel already running");
            return Ok(());
        }

        if let Some(mut dead) = live.take() {
            debug!(generation = dead.generation, "Reaping dead shell");
            dead.child.start_kill().ok();
            dead.child.wait().await.ok();
        }

        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        info!(
            program = %self.config.program.display(),
            dialect = ?self.config.dialect,
            "Spawning persistent shell"
        );
        let mut child = cmd.spawn().map_err(|e| ChannelError::SpawnFailed {
            reason: e.to_string(),
        })?;

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            child.start_kill().ok();
            return Err(ChannelError::SpawnFailed {
                reason: "Failed to capture shell stdio".to_string(),
            });
        };

        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
        let generation = {
            let mut state = self.shared.lock();
            state.generation += 1;
            state.stdin_tx = Some(stdin_tx);
            state.generation
        };

        tokio::spawn(write_stdin(stdin, stdin_rx, Arc::clone(&self.shared), generation));
        tokio::spawn(read_stdout(stdout, Arc::clone(&self.shared), generation));
        tokio::spawn(read_stderr(stderr, Arc::clone(&self.shared), generation));

        self.spawn_count.fetch_add(1, Ordering::Relaxed);
        info!(generation, pid = ?child.id(), "Persistent shell started");
        *live = Some(LiveShell { child, generation });
        Ok(())
    }

    /// Run `command` on the shared shell and wait for its stdout.
    pub async fn send(&self, command: &str) -> Result<String, ChannelError> {
        let (id, rx) = {
            let mut state = self.shared.lock();
            let Some(stdin_tx) = state.stdin_tx.clone() else {
                return Err(ChannelError::NotStarted);
            };
            let (id, rx) = state.pending.register(command);
            let frame = framing::encode_command(self.config.dialect, &id, command);
            if stdin_tx.send(frame).is_err() {
                state.pending.take(&id);
                state.stdin_tx = None;
                return Err(ChannelError::StdinClosed {
                    reason: "stdin writer has exited".to_string(),
                });
            }
            (id, rx)
        };
        debug!(id, "Command queued on shell channel");

        rx.await.unwrap_or(Err(ChannelError::Dropped))
    }

    /// Ask the shell to exit, killing it if it does not within the terminate
    /// timeout. Pending commands fail with [`ChannelError::Stopped`].
    pub async fn stop(&self) -> Result<(), ChannelError> {
        let Some(mut shell) = self.live.lock().await.take() else {
            debug!("Shell channel not running; nothing to stop");
            return Ok(());
        };

        let exit_queued = {
            let mut state = self.shared.lock();
            state.generation == shell.generation
                && state.stdin_tx.take().is_some_and(|tx| {
                    tx.send(framing::exit_instruction(self.config.dialect).to_string())
                        .is_ok()
                })
        };

        if exit_queued {
            match tokio::time::timeout(self.config.terminate_timeout, shell.child.wait()).await {
                Ok(Ok(status)) => info!(?status, "Persistent shell exited"),
                Ok(Err(e)) => {
                    warn!(error = %e, "Error waiting for shell; killing");
                    shell.child.kill().await.ok();
                }
                Err(_) => {
                    warn!("Timeout waiting for shell to exit; killing");
                    shell.child.kill().await.ok();
                }
            }
        } else {
            warn!("Could not send exit instruction; killing shell");
            shell.child.kill().await.ok();
        }

        self.shared.shut_down(shell.generation, &ChannelError::Stopped);
        Ok(())
    }

    /// Alias for [`Self::stop`].
    pub async fn release(&self) -> Result<(), ChannelError> {
        self.stop().await
    }

    /// Whether a shell is running and accepting commands.
    pub fn is_active(&self) -> bool {
        self.shared.lock().stdin_tx.is_some()
    }

    /// Commands written but not yet answered.
    pub fn pending_count(&self) -> usize {
        self.shared.lock().pending.len()
    }

    /// Number of shell processes spawned over this channel's lifetime.
    pub fn spawn_count(&self) -> usize {
        self.spawn_count.load(Ordering::Relaxed)
    }
}

async fn write_stdin(
    mut stdin: ChildStdin,
    mut rx: mpsc::UnboundedReceiver<String>,
    shared: Arc<Shared>,
    generation: u64,
) {
    while let Some(chunk) = rx.recv().await {
        let written = async {
            stdin.write_all(chunk.as_bytes()).await?;
            stdin.flush().await
        }
        .await;
        if let Err(e) = written {
            error!(generation, error = %e, "Failed to write to shell stdin");
            shared.shut_down(
                generation,
                &ChannelError::StdinClosed {
                    reason: e.to_string(),
                },
            );
            return;
        }
    }
    debug!(generation, "Shell stdin writer finished");
}

async fn read_stdout(stdout: impl AsyncRead + Unpin, shared: Arc<Shared>, generation: u64) {
    let mut segments = BufReader::new(stdout).split(b'\n');
    let mut decoder = FrameDecoder::new();

    loop {
        match segments.next_segment().await {
            Ok(Some(bytes)) => {
                let line = String::from_utf8_lossy(&bytes);
                match decoder.feed_line(&line) {
                    LineEvent::Frame(frame) => shared.complete(generation, frame),
                    LineEvent::Desync(desync) => log_desync(generation, &desync),
                    LineEvent::Consumed => {}
                }
            }
            Ok(None) => {
                shared.shut_down(
                    generation,
                    &ChannelError::ShellExited {
                        reason: "stdout closed".to_string(),
                    },
                );
                break;
            }
            Err(e) => {
                shared.shut_down(
                    generation,
                    &ChannelError::ShellExited {
                        reason: format!("stdout read error: {e}"),
                    },
                );
                break;
            }
        }
    }
    debug!(generation, "Shell stdout reader finished");
}

async fn read_stderr(stderr: impl AsyncRead + Unpin, shared: Arc<Shared>, generation: u64) {
    let mut segments = BufReader::new(stderr).split(b'\n');
    while let Ok(Some(bytes)) = segments.next_segment().await {
        let line = String::from_utf8_lossy(&bytes).trim_end().to_string();
        if line.is_empty() {
            continue;
        }
        warn!(generation, "stderr: {}", line);
        shared.fail_pending(generation, &ChannelError::Stderr { line });
    }
    debug!(generation, "Shell stderr reader finished");
}

fn log_desync(generation: u64, desync: &Desync) {
    match desync {
        Desync::EndWithoutBegin { id } => {
            warn!(generation, id, "Discarding END marker with no open frame");
        }
        Desync::MismatchedEnd { open, got } => {
            warn!(generation, open, got, "Discarding frame closed by a foreign END marker");
        }
        Desync::UnterminatedFrame { open, next } => {
            warn!(generation, open, next, "Discarding unterminated frame");
        }
        Desync::BadPayload { id, reason } => {
            warn!(generation, id, reason, "Discarding frame with undecodable payload");
        }
    }
}

#[cfg(all(test, unix))]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use hostprobe_core::ShellDialect;
    use std::time::Duration;

    fn sh_channel() -> ShellChannel {
        ShellChannel::new(
            ChannelConfig::for_dialect(ShellDialect::Posix)
                .with_terminate_timeout(Duration::from_secs(2)),
        )
    }

    #[tokio::test]
    async fn send_before_start_is_not_started() {
        let channel = sh_channel();
        assert_eq!(channel.send("echo hi").await, Err(ChannelError::NotStarted));
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let channel = sh_channel();
        channel.start().await.unwrap();
        channel.start().await.unwrap();
        assert_eq!(channel.spawn_count(), 1);
        assert!(channel.is_active());
        channel.stop().await.unwrap();
        assert!(!channel.is_active());
    }

    #[tokio::test]
    async fn echo_round_trip() {
        let channel = sh_channel();
        channel.start().await.unwrap();
        let out = channel.send("echo hello").await.unwrap();
        assert_eq!(out, "hello\n");
        assert_eq!(channel.pending_count(), 0);
        channel.stop().await.unwrap();
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let channel = ShellChannel::new(
            ChannelConfig::for_dialect(ShellDialect::Posix)
                .with_program("/nonexistent/hostprobe-shell"),
        );
        let err = channel.start().await.unwrap_err();
        assert!(matches!(err, ChannelError::SpawnFailed { .. }));
        assert!(!channel.is_active());
    }

    #[tokio::test]
    async fn stop_without_start_is_ok() {
        let channel = sh_channel();
        channel.stop().await.unwrap();
        assert_eq!(channel.spawn_count(), 0);
    }

    #[tokio::test]
    async fn restart_after_stop_spawns_again() {
        let channel = sh_channel();
        channel.start().await.unwrap();
        channel.stop().await.unwrap();
        channel.start().await.unwrap();
        assert_eq!(channel.spawn_count(), 2);
        assert_eq!(channel.send("echo again").await.unwrap(), "again\n");
        channel.stop().await.unwrap();
    }
}
