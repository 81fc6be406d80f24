//! Command runners: the seam between probes and where commands execute.

use std::future::Future;
use std::sync::Arc;

use tracing::debug;

use crate::channel::{ChannelError, EphemeralRunner, ShellChannel};
use crate::remote::TransportError;

/// Errors from running a command.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("Shell channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Remote transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Runs one shell command and returns its standard output.
pub trait CommandRunner: Send + Sync {
    fn run(&self, command: &str) -> impl Future<Output = Result<String, ExecError>> + Send;
}

impl<R: CommandRunner> CommandRunner for Arc<R> {
    fn run(&self, command: &str) -> impl Future<Output = Result<String, ExecError>> + Send {
        (**self).run(command)
    }
}

/// Runs commands on the local host.
///
/// Uses the persistent channel while it is active and falls back to one
/// process per command otherwise.
#[derive(Debug, Clone)]
pub struct LocalExecutor {
    channel: Arc<ShellChannel>,
    ephemeral: EphemeralRunner,
}

impl LocalExecutor {
    pub const fn new(channel: Arc<ShellChannel>, ephemeral: EphemeralRunner) -> Self {
        Self { channel, ephemeral }
    }

    pub fn channel(&self) -> &Arc<ShellChannel> {
        &self.channel
    }
}

impl CommandRunner for LocalExecutor {
    async fn run(&self, command: &str) -> Result<String, ExecError> {
        if self.channel.is_active() {
            return Ok(self.channel.send(command).await?);
        }
        debug!("Shell channel inactive; running command in an ephemeral shell");
        Ok(self.ephemeral.run(command).await)
    }
}
