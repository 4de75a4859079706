//! Command-line agent for rowsync.
//!
//! Loads a TOML config file, registers its operations on a
//! [`rowsync_sync::SyncOrchestrator`] and runs them once at startup and
//! then on their schedules.

pub mod config;
pub mod runner;

pub use config::{AgentConfig, OperationConfig, OutputConfig, SourceConfig, CONFIG_ENV};
pub use runner::{AgentRunner, RunOptions};
