//! Repository for the append-only `server_logs` table.

use sqlx::PgPool;
use srtcast_core::types::EntityId;

use crate::models::server_log::{CreateServerLog, LogListQuery, ServerLog};

/// Column list for `server_logs` queries.
const COLUMNS: &str = "id, server_id, channel_id, level, message, details, created_at";

pub struct ServerLogRepo;

impl ServerLogRepo {
    pub async fn create(pool: &PgPool, input: &CreateServerLog) -> Result<ServerLog, sqlx::Error> {
        let query = format!(
            "INSERT INTO server_logs (server_id, channel_id, level, message, details) \
             VALUES ($1, $2, $3, $4, $5) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, ServerLog>(&query)
            .bind(input.server_id)
            .bind(input.channel_id)
            .bind(input.level)
            .bind(&input.message)
            .bind(&input.details)
            .fetch_one(pool)
            .await
    }

    /// Newest entries of a server, optionally filtered by channel and level.
    pub async fn list(
        pool: &PgPool,
        server_id: EntityId,
        params: &LogListQuery,
    ) -> Result<Vec<ServerLog>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM server_logs \
             WHERE server_id = $1 \
               AND ($2::uuid IS NULL OR channel_id = $2) \
               AND ($3::log_level IS NULL OR level = $3) \
             ORDER BY created_at DESC \
             LIMIT $4"
        );
        sqlx::query_as::<_, ServerLog>(&query)
            .bind(server_id)
            .bind(params.channel_id)
            .bind(params.level)
            .bind(params.effective_limit())
            .fetch_all(pool)
            .await
    }
}
