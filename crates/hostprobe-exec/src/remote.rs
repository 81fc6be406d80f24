//! Remote execution seam.
//!
//! The wire protocol is not part of this crate: a [`RemoteTransport`] takes a
//! target and command text and returns output text. [`RemoteTarget`] is
//! handed to it untouched.

use std::fmt;
use std::future::Future;

use serde::Deserialize;
use tracing::debug;

use crate::runner::{CommandRunner, ExecError};

/// Connection descriptor for a remote host. Not interpreted here.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct RemoteTarget {
    /// Transport name, e.g. a remote management protocol.
    pub transport: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl RemoteTarget {
    pub fn new(
        transport: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            transport: transport.into(),
            host: host.into(),
            port,
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for RemoteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTarget")
            .field("transport", &self.transport)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl fmt::Display for RemoteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}://{}@{}:{}",
            self.transport, self.username, self.host, self.port
        )
    }
}

/// Errors a transport may report.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Failed to connect to {target}: {reason}")]
    Connect { target: String, reason: String },

    #[error("Command failed on {target}: {reason}")]
    Command { target: String, reason: String },

    #[error("Unsupported transport: {0}")]
    Unsupported(String),
}

/// Executes command text on a remote host.
pub trait RemoteTransport: Send + Sync {
    fn execute(
        &self,
        target: &RemoteTarget,
        command: &str,
    ) -> impl Future<Output = Result<String, TransportError>> + Send;
}

/// Adapts a [`RemoteTransport`] bound to one target into a [`CommandRunner`].
#[derive(Debug, Clone)]
pub struct RemoteExecutor<T> {
    transport: T,
    target: RemoteTarget,
}

impl<T: RemoteTransport> RemoteExecutor<T> {
    pub const fn new(transport: T, target: RemoteTarget) -> Self {
        Self { transport, target }
    }

    pub const fn target(&self) -> &RemoteTarget {
        &self.target
    }
}

impl<T: RemoteTransport> CommandRunner for RemoteExecutor<T> {
    async fn run(&self, command: &str) -> Result<String, ExecError> {
        debug!(target_host = %self.target.host, transport = %self.target.transport, "Executing remote command");
        Ok(self.transport.execute(&self.target, command).await?)
    }
}
