//! Channel entity: one SRT-to-multicast relay owned by a server.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use srtcast_core::ts_info::TsInfo;
use srtcast_core::types::{EntityId, Timestamp};

use super::status::ChannelStatus;

/// A row from the `channels` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Channel {
    pub id: EntityId,
    pub server_id: EntityId,
    pub name: String,
    pub folder_name: String,
    pub srt_input: String,
    pub multicast_output: String,
    pub status: ChannelStatus,
    pub pid: Option<i32>,
    /// kbps
    pub input_bitrate: Option<i32>,
    /// kbps
    pub output_bitrate: Option<i32>,
    pub uptime_seconds: Option<i64>,
    pub dropped_packets: Option<i64>,
    pub error_message: Option<String>,
    pub last_output: Option<String>,
    pub last_output_at: Option<Timestamp>,
    pub ts_info: Option<serde_json::Value>,
    pub ts_analyzed_at: Option<Timestamp>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Channel {
    /// Decode the stored probe result, if any.
    pub fn ts_info(&self) -> Option<TsInfo> {
        self.ts_info
            .as_ref()
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

/// DTO for creating a channel. `folder_name` is derived by the caller.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateChannel {
    pub server_id: EntityId,
    pub name: String,
    pub folder_name: String,
    pub srt_input: String,
    pub multicast_output: String,
}

/// DTO for editing a stopped channel. All fields are optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateChannel {
    pub name: Option<String>,
    pub folder_name: Option<String>,
    pub srt_input: Option<String>,
    pub multicast_output: Option<String>,
}

/// One atomic state change of a channel row.
///
/// Applied only when the current status is one of `from`; status, pid and
/// error message are written together, and the live stats are cleared when
/// `clear_stats` is set.
#[derive(Debug, Clone)]
pub struct ChannelTransition {
    pub from: Vec<ChannelStatus>,
    pub to: ChannelStatus,
    pub pid: Option<i32>,
    pub error_message: Option<String>,
    pub clear_stats: bool,
}

/// Live snapshot flushed by the relay observer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChannelStats {
    pub input_bitrate: Option<i32>,
    pub output_bitrate: Option<i32>,
    pub uptime_seconds: i64,
    pub dropped_packets: i64,
    pub last_output: Option<String>,
    pub last_output_at: Option<Timestamp>,
}
