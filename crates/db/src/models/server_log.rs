//! Append-only diagnostic log entries.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use srtcast_core::types::{EntityId, Timestamp};

use super::status::LogLevel;

/// A row from the `server_logs` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ServerLog {
    pub id: EntityId,
    pub server_id: EntityId,
    pub channel_id: Option<EntityId>,
    pub level: LogLevel,
    pub message: String,
    pub details: Option<serde_json::Value>,
    pub created_at: Timestamp,
}

/// DTO for appending a log entry.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateServerLog {
    pub server_id: EntityId,
    pub channel_id: Option<EntityId>,
    pub level: LogLevel,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

/// Filters for listing log entries, newest first.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogListQuery {
    pub channel_id: Option<EntityId>,
    pub level: Option<LogLevel>,
    /// Defaults to 100, capped at 1000.
    pub limit: Option<i64>,
}

impl LogListQuery {
    pub const DEFAULT_LIMIT: i64 = 100;
    pub const MAX_LIMIT: i64 = 1000;

    pub fn effective_limit(&self) -> i64 {
        self.limit
            .unwrap_or(Self::DEFAULT_LIMIT)
            .clamp(1, Self::MAX_LIMIT)
    }
}
