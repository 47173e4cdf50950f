//! [`Store`] backed by PostgreSQL.

use async_trait::async_trait;
use sqlx::PgPool;
use srtcast_core::types::{EntityId, Timestamp};

use crate::error::StoreError;
use crate::models::channel::{Channel, ChannelStats, ChannelTransition, CreateChannel, UpdateChannel};
use crate::models::command::{Command, CreateCommand};
use crate::models::recording::{CreateRecording, FinishRecording, Recording};
use crate::models::server::{CreateServer, Server, ServerHeartbeat};
use crate::models::server_log::{CreateServerLog, LogListQuery, ServerLog};
use crate::models::status::{RecordingStatus, ServerStatus};
use crate::repositories::{ChannelRepo, CommandRepo, RecordingRepo, ServerLogRepo, ServerRepo};
use crate::store::Store;

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PgStore {
    async fn create_server(&self, input: &CreateServer) -> Result<Server, StoreError> {
        ServerRepo::create(&self.pool, input)
            .await
            .map_err(StoreError::from_sqlx)
    }

    async fn get_server(&self, id: EntityId) -> Result<Option<Server>, StoreError> {
        Ok(ServerRepo::find_by_id(&self.pool, id).await?)
    }

    async fn find_server_by_token(&self, token: &str) -> Result<Option<Server>, StoreError> {
        Ok(ServerRepo::find_by_token(&self.pool, token).await?)
    }

    async fn list_servers(&self) -> Result<Vec<Server>, StoreError> {
        Ok(ServerRepo::list(&self.pool).await?)
    }

    async fn record_heartbeat(
        &self,
        id: EntityId,
        stats: &ServerHeartbeat,
    ) -> Result<Option<Server>, StoreError> {
        Ok(ServerRepo::heartbeat(&self.pool, id, stats).await?)
    }

    async fn set_server_status(
        &self,
        id: EntityId,
        status: ServerStatus,
    ) -> Result<bool, StoreError> {
        Ok(ServerRepo::set_status(&self.pool, id, status).await?)
    }

    async fn mark_stale_servers(&self, cutoff: Timestamp) -> Result<Vec<EntityId>, StoreError> {
        Ok(ServerRepo::mark_stale(&self.pool, cutoff).await?)
    }

    async fn delete_server(&self, id: EntityId) -> Result<bool, StoreError> {
        Ok(ServerRepo::delete(&self.pool, id).await?)
    }

    async fn create_channel(&self, input: &CreateChannel) -> Result<Channel, StoreError> {
        ChannelRepo::create(&self.pool, input)
            .await
            .map_err(StoreError::from_sqlx)
    }

    async fn get_channel(&self, id: EntityId) -> Result<Option<Channel>, StoreError> {
        Ok(ChannelRepo::find_by_id(&self.pool, id).await?)
    }

    async fn list_channels(&self, server_id: EntityId) -> Result<Vec<Channel>, StoreError> {
        Ok(ChannelRepo::list_by_server(&self.pool, server_id).await?)
    }

    async fn update_channel_config(
        &self,
        id: EntityId,
        input: &UpdateChannel,
    ) -> Result<Channel, StoreError> {
        if let Some(channel) = ChannelRepo::update_config(&self.pool, id, input).await? {
            return Ok(channel);
        }
        match ChannelRepo::find_by_id(&self.pool, id).await? {
            Some(channel) => Err(StoreError::Conflict(format!(
                "channel is {}; configuration can only be edited while stopped",
                channel.status
            ))),
            None => Err(StoreError::not_found("channel", id)),
        }
    }

    async fn transition_channel(
        &self,
        id: EntityId,
        transition: &ChannelTransition,
    ) -> Result<Option<Channel>, StoreError> {
        Ok(ChannelRepo::transition(&self.pool, id, transition).await?)
    }

    async fn update_channel_stats(
        &self,
        id: EntityId,
        pid: i32,
        stats: &ChannelStats,
    ) -> Result<bool, StoreError> {
        Ok(ChannelRepo::update_stats(&self.pool, id, pid, stats).await?)
    }

    async fn set_ts_info(
        &self,
        id: EntityId,
        ts_info: &serde_json::Value,
    ) -> Result<Option<Channel>, StoreError> {
        Ok(ChannelRepo::set_ts_info(&self.pool, id, ts_info).await?)
    }

    async fn delete_channel(&self, id: EntityId) -> Result<(), StoreError> {
        if ChannelRepo::delete_if_idle(&self.pool, id).await? {
            return Ok(());
        }
        match ChannelRepo::find_by_id(&self.pool, id).await? {
            Some(_) => Err(StoreError::Conflict(
                "channel has a recording in progress".into(),
            )),
            None => Err(StoreError::not_found("channel", id)),
        }
    }

    async fn create_recording(&self, input: &CreateRecording) -> Result<Recording, StoreError> {
        RecordingRepo::create(&self.pool, input)
            .await
            .map_err(StoreError::from_sqlx)
    }

    async fn get_recording(&self, id: EntityId) -> Result<Option<Recording>, StoreError> {
        Ok(RecordingRepo::find_by_id(&self.pool, id).await?)
    }

    async fn find_active_recording(
        &self,
        channel_id: EntityId,
    ) -> Result<Option<Recording>, StoreError> {
        Ok(RecordingRepo::find_active(&self.pool, channel_id).await?)
    }

    async fn list_recordings(&self, channel_id: EntityId) -> Result<Vec<Recording>, StoreError> {
        Ok(RecordingRepo::list_by_channel(&self.pool, channel_id).await?)
    }

    async fn list_recordings_by_status(
        &self,
        server_id: EntityId,
        status: RecordingStatus,
    ) -> Result<Vec<Recording>, StoreError> {
        Ok(RecordingRepo::list_by_server_and_status(&self.pool, server_id, status).await?)
    }

    async fn update_recording_progress(
        &self,
        id: EntityId,
        file_size_bytes: i64,
        duration_seconds: i32,
    ) -> Result<bool, StoreError> {
        Ok(RecordingRepo::update_progress(&self.pool, id, file_size_bytes, duration_seconds).await?)
    }

    async fn finish_recording(
        &self,
        id: EntityId,
        input: &FinishRecording,
    ) -> Result<Option<Recording>, StoreError> {
        Ok(RecordingRepo::finish(&self.pool, id, input).await?)
    }

    async fn begin_rewrap(&self, id: EntityId) -> Result<Option<Recording>, StoreError> {
        Ok(RecordingRepo::begin_rewrap(&self.pool, id).await?)
    }

    async fn complete_rewrap(
        &self,
        id: EntityId,
        mp4_filepath: &str,
    ) -> Result<Option<Recording>, StoreError> {
        Ok(RecordingRepo::complete_rewrap(&self.pool, id, mp4_filepath).await?)
    }

    async fn fail_rewrap(
        &self,
        id: EntityId,
        error: &str,
    ) -> Result<Option<Recording>, StoreError> {
        Ok(RecordingRepo::fail_rewrap(&self.pool, id, error).await?)
    }

    async fn insert_command(&self, input: &CreateCommand) -> Result<Command, StoreError> {
        CommandRepo::create(&self.pool, input)
            .await
            .map_err(StoreError::from_sqlx)
    }

    async fn get_command(&self, id: EntityId) -> Result<Option<Command>, StoreError> {
        Ok(CommandRepo::find_by_id(&self.pool, id).await?)
    }

    async fn list_pending_commands(
        &self,
        server_id: EntityId,
        limit: i64,
    ) -> Result<Vec<Command>, StoreError> {
        Ok(CommandRepo::list_pending(&self.pool, server_id, limit).await?)
    }

    async fn list_recent_commands(
        &self,
        server_id: EntityId,
        limit: i64,
    ) -> Result<Vec<Command>, StoreError> {
        Ok(CommandRepo::list_recent(&self.pool, server_id, limit).await?)
    }

    async fn claim_command(&self, id: EntityId) -> Result<Option<Command>, StoreError> {
        Ok(CommandRepo::claim(&self.pool, id).await?)
    }

    async fn complete_command(
        &self,
        id: EntityId,
        result: &serde_json::Value,
    ) -> Result<bool, StoreError> {
        Ok(CommandRepo::complete(&self.pool, id, result).await?)
    }

    async fn fail_command(&self, id: EntityId, error: &str) -> Result<bool, StoreError> {
        Ok(CommandRepo::fail(&self.pool, id, error).await?)
    }

    async fn fail_orphaned_commands(
        &self,
        server_id: EntityId,
        claimed_before: Timestamp,
        exclude: &[EntityId],
        error: &str,
    ) -> Result<Vec<EntityId>, StoreError> {
        Ok(CommandRepo::fail_orphaned(&self.pool, server_id, claimed_before, exclude, error).await?)
    }

    async fn insert_log(&self, input: &CreateServerLog) -> Result<ServerLog, StoreError> {
        Ok(ServerLogRepo::create(&self.pool, input).await?)
    }

    async fn list_logs(
        &self,
        server_id: EntityId,
        params: &LogListQuery,
    ) -> Result<Vec<ServerLog>, StoreError> {
        Ok(ServerLogRepo::list(&self.pool, server_id, params).await?)
    }
}
