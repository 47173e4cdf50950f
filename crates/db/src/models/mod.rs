//! Domain model structs and DTOs.
//!
//! Each submodule contains:
//! - A `FromRow` + `Serialize` entity struct matching the database row
//! - `Create*` DTOs for inserts
//! - Narrow update DTOs for the writes the agent performs

pub mod channel;
pub mod command;
pub mod recording;
pub mod server;
pub mod server_log;
pub mod status;
