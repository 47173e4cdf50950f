//! srtcast event bus and log persistence.
//!
//! - [`EventBus`]: in-process publish/subscribe hub backed by
//!   `tokio::sync::broadcast`.
//! - [`AgentEvent`]: an operator-visible diagnostic (a future `server_logs`
//!   row).
//! - [`LogPersistence`]: background service that writes every event to the
//!   `server_logs` table.

pub mod bus;
pub mod persistence;

pub use bus::{AgentEvent, EventBus};
pub use persistence::LogPersistence;
