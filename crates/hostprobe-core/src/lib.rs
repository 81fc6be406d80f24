//! `hostprobe` Core Library
//!
//! Shared functionality for `hostprobe` components:
//! - Configuration resolution and hierarchy
//! - Shell dialect and deadline policy vocabulary
//! - Tracing subscriber setup
//! - Common error types

pub mod config;
pub mod error;
pub mod tracing_init;

pub use config::{Config, DeadlinePolicy, ProbeSpec, ShellDialect};
pub use error::{Error, Result};
