//! hostprobe execution layer
//!
//! Everything between "run this command" and "here is its text":
//! - Persistent shell channel multiplexing many commands over one process
//! - Ephemeral one-process-per-command fallback
//! - Retrying invoker that masks transient empty results
//! - Bounded-concurrency batch scheduler with per-task timeouts and a global deadline
//! - Telemetry probe catalog feeding the scheduler

pub mod channel;
pub mod invoker;
pub mod outcome;
pub mod probes;
pub mod remote;
pub mod runner;
pub mod scheduler;

pub use channel::{ChannelConfig, ChannelError, EphemeralRunner, ShellChannel};
pub use invoker::{Invocation, RetryEvent, RetryPolicy, RetryingInvoker};
pub use outcome::{Emptiness, Outcome};
pub use probes::{build_tasks, default_probes};
pub use remote::{RemoteExecutor, RemoteTarget, RemoteTransport, TransportError};
pub use runner::{CommandRunner, ExecError, LocalExecutor};
pub use scheduler::{
    BatchReport, BatchScheduler, BatchSummary, SchedulerConfig, SchedulerError, TaskContext,
    TaskDescriptor, TaskOutcome, TaskStatus,
};
