//! Repository for the `servers` table.

use sqlx::PgPool;
use srtcast_core::types::{EntityId, Timestamp};

use crate::models::server::{CreateServer, Server, ServerHeartbeat, DEFAULT_BASE_PATH};
use crate::models::status::ServerStatus;

/// Column list for `servers` queries.
const COLUMNS: &str = "\
    id, name, token, status, last_seen_at, \
    cpu_usage, memory_usage, disk_usage, disk_total_gb, disk_used_gb, \
    base_path, created_at, updated_at";

pub struct ServerRepo;

impl ServerRepo {
    pub async fn create(pool: &PgPool, input: &CreateServer) -> Result<Server, sqlx::Error> {
        let query = format!(
            "INSERT INTO servers (name, token, base_path) \
             VALUES ($1, $2, $3) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Server>(&query)
            .bind(&input.name)
            .bind(&input.token)
            .bind(input.base_path.as_deref().unwrap_or(DEFAULT_BASE_PATH))
            .fetch_one(pool)
            .await
    }

    pub async fn find_by_id(pool: &PgPool, id: EntityId) -> Result<Option<Server>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM servers WHERE id = $1");
        sqlx::query_as::<_, Server>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// Look up the server an agent authenticates as.
    pub async fn find_by_token(pool: &PgPool, token: &str) -> Result<Option<Server>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM servers WHERE token = $1");
        sqlx::query_as::<_, Server>(&query)
            .bind(token)
            .fetch_optional(pool)
            .await
    }

    pub async fn list(pool: &PgPool) -> Result<Vec<Server>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM servers ORDER BY created_at ASC");
        sqlx::query_as::<_, Server>(&query).fetch_all(pool).await
    }

    /// Record a heartbeat: online, seen now, fresh resource gauges.
    pub async fn heartbeat(
        pool: &PgPool,
        id: EntityId,
        stats: &ServerHeartbeat,
    ) -> Result<Option<Server>, sqlx::Error> {
        let query = format!(
            "UPDATE servers SET \
                status = $2, last_seen_at = NOW(), \
                cpu_usage = $3, memory_usage = $4, disk_usage = $5, \
                disk_total_gb = $6, disk_used_gb = $7 \
             WHERE id = $1 \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Server>(&query)
            .bind(id)
            .bind(ServerStatus::Online)
            .bind(stats.cpu_usage)
            .bind(stats.memory_usage)
            .bind(stats.disk_usage)
            .bind(stats.disk_total_gb)
            .bind(stats.disk_used_gb)
            .fetch_optional(pool)
            .await
    }

    pub async fn set_status(
        pool: &PgPool,
        id: EntityId,
        status: ServerStatus,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("UPDATE servers SET status = $2 WHERE id = $1")
            .bind(id)
            .bind(status)
            .execute(pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Mark every non-offline server not seen since `cutoff` as offline.
    /// Returns the ids that changed.
    pub async fn mark_stale(pool: &PgPool, cutoff: Timestamp) -> Result<Vec<EntityId>, sqlx::Error> {
        sqlx::query_scalar::<_, EntityId>(
            "UPDATE servers SET status = $1 \
             WHERE status <> $1 AND (last_seen_at IS NULL OR last_seen_at < $2) \
             RETURNING id",
        )
        .bind(ServerStatus::Offline)
        .bind(cutoff)
        .fetch_all(pool)
        .await
    }

    /// Delete a server; channels, recordings, commands and logs cascade.
    pub async fn delete(pool: &PgPool, id: EntityId) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM servers WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
