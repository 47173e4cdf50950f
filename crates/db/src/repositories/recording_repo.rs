//! Repository for the `recordings` table.
//!
//! The partial unique index `uq_recordings_active_per_channel` guarantees at
//! most one `recording` row per channel; a concurrent second insert fails
//! with a unique violation.

use sqlx::PgPool;
use srtcast_core::types::EntityId;

use crate::models::recording::{CreateRecording, FinishRecording, Recording};
use crate::models::status::RecordingStatus;

/// Column list for `recordings` queries.
const COLUMNS: &str = "\
    id, channel_id, filename, filepath, status, started_at, stopped_at, \
    duration_seconds, file_size_bytes, mp4_filepath, error_message, created_at";

pub struct RecordingRepo;

impl RecordingRepo {
    pub async fn create(pool: &PgPool, input: &CreateRecording) -> Result<Recording, sqlx::Error> {
        let query = format!(
            "INSERT INTO recordings (channel_id, filename, filepath, status) \
             VALUES ($1, $2, $3, $4) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Recording>(&query)
            .bind(input.channel_id)
            .bind(&input.filename)
            .bind(&input.filepath)
            .bind(RecordingStatus::Recording)
            .fetch_one(pool)
            .await
    }

    pub async fn find_by_id(pool: &PgPool, id: EntityId) -> Result<Option<Recording>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM recordings WHERE id = $1");
        sqlx::query_as::<_, Recording>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// The channel's capture in progress, if any.
    pub async fn find_active(
        pool: &PgPool,
        channel_id: EntityId,
    ) -> Result<Option<Recording>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM recordings WHERE channel_id = $1 AND status = $2"
        );
        sqlx::query_as::<_, Recording>(&query)
            .bind(channel_id)
            .bind(RecordingStatus::Recording)
            .fetch_optional(pool)
            .await
    }

    pub async fn list_by_channel(
        pool: &PgPool,
        channel_id: EntityId,
    ) -> Result<Vec<Recording>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM recordings WHERE channel_id = $1 ORDER BY started_at DESC"
        );
        sqlx::query_as::<_, Recording>(&query)
            .bind(channel_id)
            .fetch_all(pool)
            .await
    }

    /// All recordings of a server's channels in the given status.
    pub async fn list_by_server_and_status(
        pool: &PgPool,
        server_id: EntityId,
        status: RecordingStatus,
    ) -> Result<Vec<Recording>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM recordings \
             WHERE status = $2 \
               AND channel_id IN (SELECT id FROM channels WHERE server_id = $1) \
             ORDER BY started_at ASC"
        );
        sqlx::query_as::<_, Recording>(&query)
            .bind(server_id)
            .bind(status)
            .fetch_all(pool)
            .await
    }

    /// Refresh size and duration of a capture in progress.
    pub async fn update_progress(
        pool: &PgPool,
        id: EntityId,
        file_size_bytes: i64,
        duration_seconds: i32,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE recordings SET file_size_bytes = $2, duration_seconds = $3 \
             WHERE id = $1 AND status = $4",
        )
        .bind(id)
        .bind(file_size_bytes)
        .bind(duration_seconds)
        .bind(RecordingStatus::Recording)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Close a capture in progress. Returns `None` if it was not recording.
    pub async fn finish(
        pool: &PgPool,
        id: EntityId,
        input: &FinishRecording,
    ) -> Result<Option<Recording>, sqlx::Error> {
        let query = format!(
            "UPDATE recordings SET \
                status = $2, stopped_at = $3, duration_seconds = $4, \
                file_size_bytes = $5, error_message = $6 \
             WHERE id = $1 AND status = $7 \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Recording>(&query)
            .bind(id)
            .bind(input.status)
            .bind(input.stopped_at)
            .bind(input.duration_seconds)
            .bind(input.file_size_bytes)
            .bind(&input.error_message)
            .bind(RecordingStatus::Recording)
            .fetch_optional(pool)
            .await
    }

    /// Move a finished recording without an MP4 to `processing`.
    pub async fn begin_rewrap(pool: &PgPool, id: EntityId) -> Result<Option<Recording>, sqlx::Error> {
        let query = format!(
            "UPDATE recordings SET status = $2, error_message = NULL \
             WHERE id = $1 AND status = ANY($3) AND mp4_filepath IS NULL \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Recording>(&query)
            .bind(id)
            .bind(RecordingStatus::Processing)
            .bind([RecordingStatus::Stopped, RecordingStatus::Completed].as_slice())
            .fetch_optional(pool)
            .await
    }

    pub async fn complete_rewrap(
        pool: &PgPool,
        id: EntityId,
        mp4_filepath: &str,
    ) -> Result<Option<Recording>, sqlx::Error> {
        let query = format!(
            "UPDATE recordings SET status = $2, mp4_filepath = $3 \
             WHERE id = $1 AND status = $4 \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Recording>(&query)
            .bind(id)
            .bind(RecordingStatus::Completed)
            .bind(mp4_filepath)
            .bind(RecordingStatus::Processing)
            .fetch_optional(pool)
            .await
    }

    /// Mark a rewrap in progress as failed.
    pub async fn fail_rewrap(
        pool: &PgPool,
        id: EntityId,
        error: &str,
    ) -> Result<Option<Recording>, sqlx::Error> {
        let query = format!(
            "UPDATE recordings SET status = $2, error_message = $3 \
             WHERE id = $1 AND status = $4 \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Recording>(&query)
            .bind(id)
            .bind(RecordingStatus::Error)
            .bind(error)
            .bind(RecordingStatus::Processing)
            .fetch_optional(pool)
            .await
    }
}
