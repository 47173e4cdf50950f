//! Command entity: one unit of work queued for a server.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use srtcast_core::types::{EntityId, Timestamp};

use super::status::CommandStatus;

/// A row from the `commands` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Command {
    pub id: EntityId,
    pub server_id: EntityId,
    pub channel_id: Option<EntityId>,
    pub command_type: String,
    pub payload: serde_json::Value,
    pub status: CommandStatus,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub created_at: Timestamp,
    pub claimed_at: Option<Timestamp>,
    pub processed_at: Option<Timestamp>,
}

/// DTO for enqueueing a command.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateCommand {
    pub server_id: EntityId,
    pub channel_id: Option<EntityId>,
    pub command_type: String,
    pub payload: serde_json::Value,
}
