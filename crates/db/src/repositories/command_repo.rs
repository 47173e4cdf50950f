//! Repository for the `commands` table.
//!
//! Status is monotonic: every update is guarded on the status it leaves.

use sqlx::PgPool;
use srtcast_core::types::{EntityId, Timestamp};

use crate::models::command::{Command, CreateCommand};
use crate::models::status::CommandStatus;

/// Column list for `commands` queries.
const COLUMNS: &str = "\
    id, server_id, channel_id, command_type, payload, status, result, \
    error_message, created_at, claimed_at, processed_at";

pub struct CommandRepo;

impl CommandRepo {
    pub async fn create(pool: &PgPool, input: &CreateCommand) -> Result<Command, sqlx::Error> {
        let query = format!(
            "INSERT INTO commands (server_id, channel_id, command_type, payload) \
             VALUES ($1, $2, $3, $4) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Command>(&query)
            .bind(input.server_id)
            .bind(input.channel_id)
            .bind(&input.command_type)
            .bind(&input.payload)
            .fetch_one(pool)
            .await
    }

    pub async fn find_by_id(pool: &PgPool, id: EntityId) -> Result<Option<Command>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM commands WHERE id = $1");
        sqlx::query_as::<_, Command>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// Pending commands for a server in creation order.
    pub async fn list_pending(
        pool: &PgPool,
        server_id: EntityId,
        limit: i64,
    ) -> Result<Vec<Command>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM commands \
             WHERE server_id = $1 AND status = $2 \
             ORDER BY created_at ASC, id ASC \
             LIMIT $3"
        );
        sqlx::query_as::<_, Command>(&query)
            .bind(server_id)
            .bind(CommandStatus::Pending)
            .bind(limit)
            .fetch_all(pool)
            .await
    }

    /// Most recent commands of a server, newest first.
    pub async fn list_recent(
        pool: &PgPool,
        server_id: EntityId,
        limit: i64,
    ) -> Result<Vec<Command>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM commands WHERE server_id = $1 \
             ORDER BY created_at DESC LIMIT $2"
        );
        sqlx::query_as::<_, Command>(&query)
            .bind(server_id)
            .bind(limit)
            .fetch_all(pool)
            .await
    }

    /// Atomically claim a pending command (pending -> processing).
    ///
    /// Returns `None` when another consumer already claimed it.
    pub async fn claim(pool: &PgPool, id: EntityId) -> Result<Option<Command>, sqlx::Error> {
        let query = format!(
            "UPDATE commands SET status = $2, claimed_at = NOW() \
             WHERE id = $1 AND status = $3 \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Command>(&query)
            .bind(id)
            .bind(CommandStatus::Processing)
            .bind(CommandStatus::Pending)
            .fetch_optional(pool)
            .await
    }

    pub async fn complete(
        pool: &PgPool,
        id: EntityId,
        result: &serde_json::Value,
    ) -> Result<bool, sqlx::Error> {
        let outcome = sqlx::query(
            "UPDATE commands SET status = $2, result = $3, processed_at = NOW() \
             WHERE id = $1 AND status = $4",
        )
        .bind(id)
        .bind(CommandStatus::Completed)
        .bind(result)
        .bind(CommandStatus::Processing)
        .execute(pool)
        .await?;
        Ok(outcome.rows_affected() > 0)
    }

    pub async fn fail(pool: &PgPool, id: EntityId, error: &str) -> Result<bool, sqlx::Error> {
        let outcome = sqlx::query(
            "UPDATE commands SET status = $2, error_message = $3, processed_at = NOW() \
             WHERE id = $1 AND status = $4",
        )
        .bind(id)
        .bind(CommandStatus::Failed)
        .bind(error)
        .bind(CommandStatus::Processing)
        .execute(pool)
        .await?;
        Ok(outcome.rows_affected() > 0)
    }

    /// Fail `processing` commands of a server claimed before `cutoff`,
    /// skipping the ids in `exclude`. Returns the failed ids.
    pub async fn fail_orphaned(
        pool: &PgPool,
        server_id: EntityId,
        cutoff: Timestamp,
        exclude: &[EntityId],
        error: &str,
    ) -> Result<Vec<EntityId>, sqlx::Error> {
        sqlx::query_scalar::<_, EntityId>(
            "UPDATE commands SET status = $2, error_message = $3, processed_at = NOW() \
             WHERE server_id = $1 AND status = $4 \
               AND COALESCE(claimed_at, created_at) < $5 \
               AND NOT (id = ANY($6)) \
             RETURNING id",
        )
        .bind(server_id)
        .bind(CommandStatus::Failed)
        .bind(error)
        .bind(CommandStatus::Processing)
        .bind(cutoff)
        .bind(exclude)
        .fetch_all(pool)
        .await
    }
}
