//! The storage seam the agent and control layer are written against.

use async_trait::async_trait;
use srtcast_core::types::{EntityId, Timestamp};

use crate::error::StoreError;
use crate::models::channel::{Channel, ChannelStats, ChannelTransition, CreateChannel, UpdateChannel};
use crate::models::command::{Command, CreateCommand};
use crate::models::recording::{CreateRecording, FinishRecording, Recording};
use crate::models::server::{CreateServer, Server, ServerHeartbeat};
use crate::models::server_log::{CreateServerLog, LogListQuery, ServerLog};
use crate::models::status::{RecordingStatus, ServerStatus};

/// Every mutation is a single-row atomic write, and every conditional
/// write reports whether it applied (`Option`/`bool`) instead of failing.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    // -- servers ------------------------------------------------------------

    async fn create_server(&self, input: &CreateServer) -> Result<Server, StoreError>;

    async fn get_server(&self, id: EntityId) -> Result<Option<Server>, StoreError>;

    async fn find_server_by_token(&self, token: &str) -> Result<Option<Server>, StoreError>;

    async fn list_servers(&self) -> Result<Vec<Server>, StoreError>;

    async fn record_heartbeat(
        &self,
        id: EntityId,
        stats: &ServerHeartbeat,
    ) -> Result<Option<Server>, StoreError>;

    async fn set_server_status(&self, id: EntityId, status: ServerStatus)
        -> Result<bool, StoreError>;

    /// Mark servers not seen since `cutoff` offline; returns the ids changed.
    async fn mark_stale_servers(&self, cutoff: Timestamp) -> Result<Vec<EntityId>, StoreError>;

    /// Delete a server and everything it owns.
    async fn delete_server(&self, id: EntityId) -> Result<bool, StoreError>;

    // -- channels -----------------------------------------------------------

    async fn create_channel(&self, input: &CreateChannel) -> Result<Channel, StoreError>;

    async fn get_channel(&self, id: EntityId) -> Result<Option<Channel>, StoreError>;

    async fn list_channels(&self, server_id: EntityId) -> Result<Vec<Channel>, StoreError>;

    /// Edit configuration. `Conflict` unless the channel is stopped.
    async fn update_channel_config(
        &self,
        id: EntityId,
        input: &UpdateChannel,
    ) -> Result<Channel, StoreError>;

    /// Apply a guarded transition; `None` when the current status is not in
    /// `transition.from` or the channel does not exist.
    async fn transition_channel(
        &self,
        id: EntityId,
        transition: &ChannelTransition,
    ) -> Result<Option<Channel>, StoreError>;

    async fn update_channel_stats(
        &self,
        id: EntityId,
        pid: i32,
        stats: &ChannelStats,
    ) -> Result<bool, StoreError>;

    async fn set_ts_info(
        &self,
        id: EntityId,
        ts_info: &serde_json::Value,
    ) -> Result<Option<Channel>, StoreError>;

    /// Delete a channel. `Conflict` while it has a recording in progress.
    async fn delete_channel(&self, id: EntityId) -> Result<(), StoreError>;

    // -- recordings ---------------------------------------------------------

    /// Insert a `recording` row. `Conflict` if the channel already has one.
    async fn create_recording(&self, input: &CreateRecording) -> Result<Recording, StoreError>;

    async fn get_recording(&self, id: EntityId) -> Result<Option<Recording>, StoreError>;

    async fn find_active_recording(
        &self,
        channel_id: EntityId,
    ) -> Result<Option<Recording>, StoreError>;

    async fn list_recordings(&self, channel_id: EntityId) -> Result<Vec<Recording>, StoreError>;

    async fn list_recordings_by_status(
        &self,
        server_id: EntityId,
        status: RecordingStatus,
    ) -> Result<Vec<Recording>, StoreError>;

    async fn update_recording_progress(
        &self,
        id: EntityId,
        file_size_bytes: i64,
        duration_seconds: i32,
    ) -> Result<bool, StoreError>;

    async fn finish_recording(
        &self,
        id: EntityId,
        input: &FinishRecording,
    ) -> Result<Option<Recording>, StoreError>;

    async fn begin_rewrap(&self, id: EntityId) -> Result<Option<Recording>, StoreError>;

    async fn complete_rewrap(
        &self,
        id: EntityId,
        mp4_filepath: &str,
    ) -> Result<Option<Recording>, StoreError>;

    async fn fail_rewrap(&self, id: EntityId, error: &str)
        -> Result<Option<Recording>, StoreError>;

    // -- commands -----------------------------------------------------------

    async fn insert_command(&self, input: &CreateCommand) -> Result<Command, StoreError>;

    async fn get_command(&self, id: EntityId) -> Result<Option<Command>, StoreError>;

    /// Pending commands in creation order.
    async fn list_pending_commands(
        &self,
        server_id: EntityId,
        limit: i64,
    ) -> Result<Vec<Command>, StoreError>;

    async fn list_recent_commands(
        &self,
        server_id: EntityId,
        limit: i64,
    ) -> Result<Vec<Command>, StoreError>;

    /// pending -> processing. `None` if someone else got there first.
    async fn claim_command(&self, id: EntityId) -> Result<Option<Command>, StoreError>;

    async fn complete_command(
        &self,
        id: EntityId,
        result: &serde_json::Value,
    ) -> Result<bool, StoreError>;

    async fn fail_command(&self, id: EntityId, error: &str) -> Result<bool, StoreError>;

    async fn fail_orphaned_commands(
        &self,
        server_id: EntityId,
        claimed_before: Timestamp,
        exclude: &[EntityId],
        error: &str,
    ) -> Result<Vec<EntityId>, StoreError>;

    // -- logs ---------------------------------------------------------------

    async fn insert_log(&self, input: &CreateServerLog) -> Result<ServerLog, StoreError>;

    async fn list_logs(
        &self,
        server_id: EntityId,
        params: &LogListQuery,
    ) -> Result<Vec<ServerLog>, StoreError>;
}
