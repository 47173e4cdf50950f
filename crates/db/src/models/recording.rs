//! Recording entity: one capture session of a channel.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use srtcast_core::types::{EntityId, Timestamp};

use super::status::RecordingStatus;

/// A row from the `recordings` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Recording {
    pub id: EntityId,
    pub channel_id: EntityId,
    pub filename: String,
    pub filepath: String,
    pub status: RecordingStatus,
    pub started_at: Timestamp,
    pub stopped_at: Option<Timestamp>,
    pub duration_seconds: Option<i32>,
    pub file_size_bytes: Option<i64>,
    pub mp4_filepath: Option<String>,
    pub error_message: Option<String>,
    pub created_at: Timestamp,
}

impl Recording {
    /// A rewrap may start from a finished capture that has no MP4 yet.
    pub fn is_rewrappable(&self) -> bool {
        matches!(
            self.status,
            RecordingStatus::Stopped | RecordingStatus::Completed
        ) && self.mp4_filepath.is_none()
    }
}

/// DTO for starting a recording. The row is created in status `recording`.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateRecording {
    pub channel_id: EntityId,
    pub filename: String,
    pub filepath: String,
}

/// Final values written when a capture ends.
///
/// `status` is `stopped` for a clean stop and `error` when the capture died.
#[derive(Debug, Clone)]
pub struct FinishRecording {
    pub status: RecordingStatus,
    pub stopped_at: Timestamp,
    pub duration_seconds: Option<i32>,
    pub file_size_bytes: Option<i64>,
    pub error_message: Option<String>,
}
