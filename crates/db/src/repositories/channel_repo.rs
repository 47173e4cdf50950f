//! Repository for the `channels` table.
//!
//! Status, pid and error message only ever change together through
//! [`ChannelRepo::transition`].

use sqlx::PgPool;
use srtcast_core::types::EntityId;

use crate::models::channel::{Channel, ChannelStats, ChannelTransition, CreateChannel, UpdateChannel};
use crate::models::status::{ChannelStatus, RecordingStatus};

/// Column list for `channels` queries.
const COLUMNS: &str = "\
    id, server_id, name, folder_name, srt_input, multicast_output, \
    status, pid, input_bitrate, output_bitrate, uptime_seconds, dropped_packets, \
    error_message, last_output, last_output_at, ts_info, ts_analyzed_at, \
    created_at, updated_at";

pub struct ChannelRepo;

impl ChannelRepo {
    pub async fn create(pool: &PgPool, input: &CreateChannel) -> Result<Channel, sqlx::Error> {
        let query = format!(
            "INSERT INTO channels (server_id, name, folder_name, srt_input, multicast_output) \
             VALUES ($1, $2, $3, $4, $5) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Channel>(&query)
            .bind(input.server_id)
            .bind(&input.name)
            .bind(&input.folder_name)
            .bind(&input.srt_input)
            .bind(&input.multicast_output)
            .fetch_one(pool)
            .await
    }

    pub async fn find_by_id(pool: &PgPool, id: EntityId) -> Result<Option<Channel>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM channels WHERE id = $1");
        sqlx::query_as::<_, Channel>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    pub async fn list_by_server(
        pool: &PgPool,
        server_id: EntityId,
    ) -> Result<Vec<Channel>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM channels WHERE server_id = $1 ORDER BY created_at ASC"
        );
        sqlx::query_as::<_, Channel>(&query)
            .bind(server_id)
            .fetch_all(pool)
            .await
    }

    /// Edit a channel's configuration. Applies only while it is stopped.
    pub async fn update_config(
        pool: &PgPool,
        id: EntityId,
        input: &UpdateChannel,
    ) -> Result<Option<Channel>, sqlx::Error> {
        let query = format!(
            "UPDATE channels SET
                name = COALESCE($2, name),
                folder_name = COALESCE($3, folder_name),
                srt_input = COALESCE($4, srt_input),
                multicast_output = COALESCE($5, multicast_output)
             WHERE id = $1 AND status = $6
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Channel>(&query)
            .bind(id)
            .bind(&input.name)
            .bind(&input.folder_name)
            .bind(&input.srt_input)
            .bind(&input.multicast_output)
            .bind(ChannelStatus::Stopped)
            .fetch_optional(pool)
            .await
    }

    /// Apply a state transition if the channel is currently in one of
    /// `transition.from`. Returns `None` when it was not.
    pub async fn transition(
        pool: &PgPool,
        id: EntityId,
        transition: &ChannelTransition,
    ) -> Result<Option<Channel>, sqlx::Error> {
        let query = format!(
            "UPDATE channels SET
                status = $2,
                pid = $3,
                error_message = $4,
                input_bitrate = CASE WHEN $5 THEN NULL ELSE input_bitrate END,
                output_bitrate = CASE WHEN $5 THEN NULL ELSE output_bitrate END,
                uptime_seconds = CASE WHEN $5 THEN NULL ELSE uptime_seconds END,
                dropped_packets = CASE WHEN $5 THEN NULL ELSE dropped_packets END
             WHERE id = $1 AND status = ANY($6)
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Channel>(&query)
            .bind(id)
            .bind(transition.to)
            .bind(transition.pid)
            .bind(&transition.error_message)
            .bind(transition.clear_stats)
            .bind(&transition.from)
            .fetch_optional(pool)
            .await
    }

    /// Flush a live snapshot from the relay whose pid is `pid`.
    ///
    /// Ignored once the channel left starting/running or a newer process
    /// replaced it.
    pub async fn update_stats(
        pool: &PgPool,
        id: EntityId,
        pid: i32,
        stats: &ChannelStats,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE channels SET
                input_bitrate = $3,
                output_bitrate = $4,
                uptime_seconds = $5,
                dropped_packets = $6,
                last_output = COALESCE($7, last_output),
                last_output_at = COALESCE($8, last_output_at)
             WHERE id = $1 AND pid = $2 AND status = ANY($9)",
        )
        .bind(id)
        .bind(pid)
        .bind(stats.input_bitrate)
        .bind(stats.output_bitrate)
        .bind(stats.uptime_seconds)
        .bind(stats.dropped_packets)
        .bind(&stats.last_output)
        .bind(stats.last_output_at)
        .bind([ChannelStatus::Starting, ChannelStatus::Running].as_slice())
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Persist a probe result with `ts_analyzed_at = NOW()`.
    pub async fn set_ts_info(
        pool: &PgPool,
        id: EntityId,
        ts_info: &serde_json::Value,
    ) -> Result<Option<Channel>, sqlx::Error> {
        let query = format!(
            "UPDATE channels SET ts_info = $2, ts_analyzed_at = NOW() \
             WHERE id = $1 \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Channel>(&query)
            .bind(id)
            .bind(ts_info)
            .fetch_optional(pool)
            .await
    }

    /// Delete a channel unless it has a recording in progress.
    ///
    /// Returns `true` if the row was deleted.
    pub async fn delete_if_idle(pool: &PgPool, id: EntityId) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "DELETE FROM channels c \
             WHERE c.id = $1 AND NOT EXISTS ( \
                 SELECT 1 FROM recordings r WHERE r.channel_id = c.id AND r.status = $2 \
             )",
        )
        .bind(id)
        .bind(RecordingStatus::Recording)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
