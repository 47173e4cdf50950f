//! Server entity: one managed host running one agent.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use srtcast_core::types::{EntityId, Timestamp};

use super::status::ServerStatus;

/// Default root for channel folders when a server row does not set one.
pub const DEFAULT_BASE_PATH: &str = "/var/streaming";

/// A row from the `servers` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Server {
    pub id: EntityId,
    pub name: String,
    pub token: String,
    pub status: ServerStatus,
    pub last_seen_at: Option<Timestamp>,
    pub cpu_usage: Option<f64>,
    pub memory_usage: Option<f64>,
    pub disk_usage: Option<f64>,
    pub disk_total_gb: Option<f64>,
    pub disk_used_gb: Option<f64>,
    pub base_path: String,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// DTO for registering a server. The token is generated by the caller.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateServer {
    pub name: String,
    pub token: String,
    pub base_path: Option<String>,
}

/// Resource gauges written with every heartbeat.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerHeartbeat {
    pub cpu_usage: Option<f64>,
    pub memory_usage: Option<f64>,
    pub disk_usage: Option<f64>,
    pub disk_total_gb: Option<f64>,
    pub disk_used_gb: Option<f64>,
}
