//! `srtcast-agent` library crate.
//!
//! The per-server relay agent: supervises SRT relay and capture processes,
//! executes operator commands from the shared store and reports health.
//! Re-exports internal modules for integration testing. The binary
//! entrypoint lives in `main.rs`.

pub mod collector;
pub mod config;
pub mod context;
pub mod control;
pub mod dispatcher;
pub mod error;
pub mod feed;
pub mod heartbeat;
pub mod locks;
pub mod process;
pub mod prober;
pub mod reconciler;
pub mod recorder;
pub mod runtime;
pub mod supervisor;
pub mod watchdog;

pub use config::AgentConfig;
pub use error::AgentError;
pub use runtime::{Agent, RecoveryReport, RunningAgent};
