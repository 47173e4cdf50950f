//! In-process [`Store`] used by tests and local runs without PostgreSQL.
//!
//! Mirrors the database constraints the agent relies on: guarded
//! transitions, one active recording per channel, cascading deletes and
//! monotonic command status. Every committed mutation is announced on a
//! broadcast channel, standing in for the realtime feed observers use.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use srtcast_core::types::{EntityId, Timestamp};
use tokio::sync::broadcast;

use crate::error::StoreError;
use crate::models::channel::{Channel, ChannelStats, ChannelTransition, CreateChannel, UpdateChannel};
use crate::models::command::{Command, CreateCommand};
use crate::models::recording::{CreateRecording, FinishRecording, Recording};
use crate::models::server::{CreateServer, Server, ServerHeartbeat, DEFAULT_BASE_PATH};
use crate::models::server_log::{CreateServerLog, LogListQuery, ServerLog};
use crate::models::status::{ChannelStatus, CommandStatus, RecordingStatus, ServerStatus};
use crate::store::Store;

const CHANGE_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Servers,
    Channels,
    Recordings,
    Commands,
    ServerLogs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

/// One committed row change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreChange {
    pub table: Table,
    pub op: ChangeOp,
    pub id: EntityId,
}

#[derive(Default)]
struct Tables {
    servers: HashMap<EntityId, Server>,
    channels: HashMap<EntityId, Channel>,
    recordings: HashMap<EntityId, Recording>,
    /// Insertion order is creation order.
    commands: Vec<Command>,
    logs: Vec<ServerLog>,
}

pub struct MemoryStore {
    tables: Mutex<Tables>,
    changes: broadcast::Sender<StoreChange>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            tables: Mutex::new(Tables::default()),
            changes,
        }
    }

    /// Subscribe to committed row changes.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn announce(&self, table: Table, op: ChangeOp, id: EntityId) {
        // No subscribers is fine.
        let _ = self.changes.send(StoreChange { table, op, id });
    }

    fn announce_all(&self, table: Table, op: ChangeOp, ids: &[EntityId]) {
        for id in ids {
            self.announce(table, op, *id);
        }
    }
}

fn new_id() -> EntityId {
    uuid::Uuid::now_v7()
}

#[async_trait]
impl Store for MemoryStore {
    // -- servers ------------------------------------------------------------

    async fn create_server(&self, input: &CreateServer) -> Result<Server, StoreError> {
        let server = {
            let mut t = self.tables();
            if t.servers.values().any(|s| s.token == input.token) {
                return Err(StoreError::Conflict("violates uq_servers_token".into()));
            }
            let now = Utc::now();
            let server = Server {
                id: new_id(),
                name: input.name.clone(),
                token: input.token.clone(),
                status: ServerStatus::Offline,
                last_seen_at: None,
                cpu_usage: None,
                memory_usage: None,
                disk_usage: None,
                disk_total_gb: None,
                disk_used_gb: None,
                base_path: input
                    .base_path
                    .clone()
                    .unwrap_or_else(|| DEFAULT_BASE_PATH.to_string()),
                created_at: now,
                updated_at: now,
            };
            t.servers.insert(server.id, server.clone());
            server
        };
        self.announce(Table::Servers, ChangeOp::Insert, server.id);
        Ok(server)
    }

    async fn get_server(&self, id: EntityId) -> Result<Option<Server>, StoreError> {
        Ok(self.tables().servers.get(&id).cloned())
    }

    async fn find_server_by_token(&self, token: &str) -> Result<Option<Server>, StoreError> {
        Ok(self
            .tables()
            .servers
            .values()
            .find(|s| s.token == token)
            .cloned())
    }

    async fn list_servers(&self) -> Result<Vec<Server>, StoreError> {
        let mut servers: Vec<Server> = self.tables().servers.values().cloned().collect();
        servers.sort_by_key(|s| s.created_at);
        Ok(servers)
    }

    async fn record_heartbeat(
        &self,
        id: EntityId,
        stats: &ServerHeartbeat,
    ) -> Result<Option<Server>, StoreError> {
        let updated = {
            let mut t = self.tables();
            t.servers.get_mut(&id).map(|s| {
                let now = Utc::now();
                s.status = ServerStatus::Online;
                s.last_seen_at = Some(now);
                s.cpu_usage = stats.cpu_usage;
                s.memory_usage = stats.memory_usage;
                s.disk_usage = stats.disk_usage;
                s.disk_total_gb = stats.disk_total_gb;
                s.disk_used_gb = stats.disk_used_gb;
                s.updated_at = now;
                s.clone()
            })
        };
        if updated.is_some() {
            self.announce(Table::Servers, ChangeOp::Update, id);
        }
        Ok(updated)
    }

    async fn set_server_status(
        &self,
        id: EntityId,
        status: ServerStatus,
    ) -> Result<bool, StoreError> {
        let found = {
            let mut t = self.tables();
            match t.servers.get_mut(&id) {
                Some(s) => {
                    s.status = status;
                    s.updated_at = Utc::now();
                    true
                }
                None => false,
            }
        };
        if found {
            self.announce(Table::Servers, ChangeOp::Update, id);
        }
        Ok(found)
    }

    async fn mark_stale_servers(&self, cutoff: Timestamp) -> Result<Vec<EntityId>, StoreError> {
        let ids: Vec<EntityId> = {
            let mut t = self.tables();
            t.servers
                .values_mut()
                .filter(|s| {
                    s.status != ServerStatus::Offline
                        && s.last_seen_at.is_none_or(|seen| seen < cutoff)
                })
                .map(|s| {
                    s.status = ServerStatus::Offline;
                    s.updated_at = Utc::now();
                    s.id
                })
                .collect()
        };
        self.announce_all(Table::Servers, ChangeOp::Update, &ids);
        Ok(ids)
    }

    async fn delete_server(&self, id: EntityId) -> Result<bool, StoreError> {
        let (channel_ids, recording_ids) = {
            let mut t = self.tables();
            if t.servers.remove(&id).is_none() {
                return Ok(false);
            }
            let channel_ids: Vec<EntityId> = t
                .channels
                .values()
                .filter(|c| c.server_id == id)
                .map(|c| c.id)
                .collect();
            let recording_ids: Vec<EntityId> = t
                .recordings
                .values()
                .filter(|r| channel_ids.contains(&r.channel_id))
                .map(|r| r.id)
                .collect();
            t.channels.retain(|_, c| c.server_id != id);
            t.recordings.retain(|_, r| !channel_ids.contains(&r.channel_id));
            t.commands.retain(|c| c.server_id != id);
            t.logs.retain(|l| l.server_id != id);
            (channel_ids, recording_ids)
        };
        self.announce_all(Table::Recordings, ChangeOp::Delete, &recording_ids);
        self.announce_all(Table::Channels, ChangeOp::Delete, &channel_ids);
        self.announce(Table::Servers, ChangeOp::Delete, id);
        Ok(true)
    }

    // -- channels -----------------------------------------------------------

    async fn create_channel(&self, input: &CreateChannel) -> Result<Channel, StoreError> {
        let channel = {
            let mut t = self.tables();
            if !t.servers.contains_key(&input.server_id) {
                return Err(StoreError::not_found("server", input.server_id));
            }
            let now = Utc::now();
            let channel = Channel {
                id: new_id(),
                server_id: input.server_id,
                name: input.name.clone(),
                folder_name: input.folder_name.clone(),
                srt_input: input.srt_input.clone(),
                multicast_output: input.multicast_output.clone(),
                status: ChannelStatus::Stopped,
                pid: None,
                input_bitrate: None,
                output_bitrate: None,
                uptime_seconds: None,
                dropped_packets: None,
                error_message: None,
                last_output: None,
                last_output_at: None,
                ts_info: None,
                ts_analyzed_at: None,
                created_at: now,
                updated_at: now,
            };
            t.channels.insert(channel.id, channel.clone());
            channel
        };
        self.announce(Table::Channels, ChangeOp::Insert, channel.id);
        Ok(channel)
    }

    async fn get_channel(&self, id: EntityId) -> Result<Option<Channel>, StoreError> {
        Ok(self.tables().channels.get(&id).cloned())
    }

    async fn list_channels(&self, server_id: EntityId) -> Result<Vec<Channel>, StoreError> {
        let mut channels: Vec<Channel> = self
            .tables()
            .channels
            .values()
            .filter(|c| c.server_id == server_id)
            .cloned()
            .collect();
        channels.sort_by_key(|c| (c.created_at, c.id));
        Ok(channels)
    }

    async fn update_channel_config(
        &self,
        id: EntityId,
        input: &UpdateChannel,
    ) -> Result<Channel, StoreError> {
        let channel = {
            let mut t = self.tables();
            let channel = t
                .channels
                .get_mut(&id)
                .ok_or_else(|| StoreError::not_found("channel", id))?;
            if channel.status != ChannelStatus::Stopped {
                return Err(StoreError::Conflict(format!(
                    "channel is {}; configuration can only be edited while stopped",
                    channel.status
                )));
            }
            if let Some(name) = &input.name {
                channel.name = name.clone();
            }
            if let Some(folder) = &input.folder_name {
                channel.folder_name = folder.clone();
            }
            if let Some(srt) = &input.srt_input {
                channel.srt_input = srt.clone();
            }
            if let Some(mcast) = &input.multicast_output {
                channel.multicast_output = mcast.clone();
            }
            channel.updated_at = Utc::now();
            channel.clone()
        };
        self.announce(Table::Channels, ChangeOp::Update, id);
        Ok(channel)
    }

    async fn transition_channel(
        &self,
        id: EntityId,
        transition: &ChannelTransition,
    ) -> Result<Option<Channel>, StoreError> {
        let updated = {
            let mut t = self.tables();
            match t.channels.get_mut(&id) {
                Some(c) if transition.from.contains(&c.status) => {
                    c.status = transition.to;
                    c.pid = transition.pid;
                    c.error_message = transition.error_message.clone();
                    if transition.clear_stats {
                        c.input_bitrate = None;
                        c.output_bitrate = None;
                        c.uptime_seconds = None;
                        c.dropped_packets = None;
                    }
                    c.updated_at = Utc::now();
                    Some(c.clone())
                }
                _ => None,
            }
        };
        if updated.is_some() {
            self.announce(Table::Channels, ChangeOp::Update, id);
        }
        Ok(updated)
    }

    async fn update_channel_stats(
        &self,
        id: EntityId,
        pid: i32,
        stats: &ChannelStats,
    ) -> Result<bool, StoreError> {
        let applied = {
            let mut t = self.tables();
            match t.channels.get_mut(&id) {
                Some(c)
                    if c.pid == Some(pid)
                        && matches!(c.status, ChannelStatus::Starting | ChannelStatus::Running) =>
                {
                    c.input_bitrate = stats.input_bitrate;
                    c.output_bitrate = stats.output_bitrate;
                    c.uptime_seconds = Some(stats.uptime_seconds);
                    c.dropped_packets = Some(stats.dropped_packets);
                    if stats.last_output.is_some() {
                        c.last_output = stats.last_output.clone();
                    }
                    if stats.last_output_at.is_some() {
                        c.last_output_at = stats.last_output_at;
                    }
                    c.updated_at = Utc::now();
                    true
                }
                _ => false,
            }
        };
        if applied {
            self.announce(Table::Channels, ChangeOp::Update, id);
        }
        Ok(applied)
    }

    async fn set_ts_info(
        &self,
        id: EntityId,
        ts_info: &serde_json::Value,
    ) -> Result<Option<Channel>, StoreError> {
        let updated = {
            let mut t = self.tables();
            t.channels.get_mut(&id).map(|c| {
                let now = Utc::now();
                c.ts_info = Some(ts_info.clone());
                c.ts_analyzed_at = Some(now);
                c.updated_at = now;
                c.clone()
            })
        };
        if updated.is_some() {
            self.announce(Table::Channels, ChangeOp::Update, id);
        }
        Ok(updated)
    }

    async fn delete_channel(&self, id: EntityId) -> Result<(), StoreError> {
        let recording_ids: Vec<EntityId> = {
            let mut t = self.tables();
            if !t.channels.contains_key(&id) {
                return Err(StoreError::not_found("channel", id));
            }
            if t
                .recordings
                .values()
                .any(|r| r.channel_id == id && r.status == RecordingStatus::Recording)
            {
                return Err(StoreError::Conflict(
                    "channel has a recording in progress".into(),
                ));
            }
            t.channels.remove(&id);
            let ids = t
                .recordings
                .values()
                .filter(|r| r.channel_id == id)
                .map(|r| r.id)
                .collect();
            t.recordings.retain(|_, r| r.channel_id != id);
            t.commands.retain(|c| c.channel_id != Some(id));
            for log in t.logs.iter_mut().filter(|l| l.channel_id == Some(id)) {
                log.channel_id = None;
            }
            ids
        };
        self.announce_all(Table::Recordings, ChangeOp::Delete, &recording_ids);
        self.announce(Table::Channels, ChangeOp::Delete, id);
        Ok(())
    }

    // -- recordings ---------------------------------------------------------

    async fn create_recording(&self, input: &CreateRecording) -> Result<Recording, StoreError> {
        let recording = {
            let mut t = self.tables();
            if !t.channels.contains_key(&input.channel_id) {
                return Err(StoreError::not_found("channel", input.channel_id));
            }
            if t
                .recordings
                .values()
                .any(|r| r.channel_id == input.channel_id && r.status == RecordingStatus::Recording)
            {
                return Err(StoreError::Conflict(
                    "violates uq_recordings_active_per_channel".into(),
                ));
            }
            let now = Utc::now();
            let recording = Recording {
                id: new_id(),
                channel_id: input.channel_id,
                filename: input.filename.clone(),
                filepath: input.filepath.clone(),
                status: RecordingStatus::Recording,
                started_at: now,
                stopped_at: None,
                duration_seconds: None,
                file_size_bytes: None,
                mp4_filepath: None,
                error_message: None,
                created_at: now,
            };
            t.recordings.insert(recording.id, recording.clone());
            recording
        };
        self.announce(Table::Recordings, ChangeOp::Insert, recording.id);
        Ok(recording)
    }

    async fn get_recording(&self, id: EntityId) -> Result<Option<Recording>, StoreError> {
        Ok(self.tables().recordings.get(&id).cloned())
    }

    async fn find_active_recording(
        &self,
        channel_id: EntityId,
    ) -> Result<Option<Recording>, StoreError> {
        Ok(self
            .tables()
            .recordings
            .values()
            .find(|r| r.channel_id == channel_id && r.status == RecordingStatus::Recording)
            .cloned())
    }

    async fn list_recordings(&self, channel_id: EntityId) -> Result<Vec<Recording>, StoreError> {
        let mut recordings: Vec<Recording> = self
            .tables()
            .recordings
            .values()
            .filter(|r| r.channel_id == channel_id)
            .cloned()
            .collect();
        recordings.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(recordings)
    }

    async fn list_recordings_by_status(
        &self,
        server_id: EntityId,
        status: RecordingStatus,
    ) -> Result<Vec<Recording>, StoreError> {
        let t = self.tables();
        let mut recordings: Vec<Recording> = t
            .recordings
            .values()
            .filter(|r| {
                r.status == status
                    && t.channels
                        .get(&r.channel_id)
                        .is_some_and(|c| c.server_id == server_id)
            })
            .cloned()
            .collect();
        recordings.sort_by_key(|r| r.started_at);
        Ok(recordings)
    }

    async fn update_recording_progress(
        &self,
        id: EntityId,
        file_size_bytes: i64,
        duration_seconds: i32,
    ) -> Result<bool, StoreError> {
        let applied = {
            let mut t = self.tables();
            match t.recordings.get_mut(&id) {
                Some(r) if r.status == RecordingStatus::Recording => {
                    r.file_size_bytes = Some(file_size_bytes);
                    r.duration_seconds = Some(duration_seconds);
                    true
                }
                _ => false,
            }
        };
        if applied {
            self.announce(Table::Recordings, ChangeOp::Update, id);
        }
        Ok(applied)
    }

    async fn finish_recording(
        &self,
        id: EntityId,
        input: &FinishRecording,
    ) -> Result<Option<Recording>, StoreError> {
        let updated = {
            let mut t = self.tables();
            match t.recordings.get_mut(&id) {
                Some(r) if r.status == RecordingStatus::Recording => {
                    r.status = input.status;
                    r.stopped_at = Some(input.stopped_at);
                    r.duration_seconds = input.duration_seconds;
                    r.file_size_bytes = input.file_size_bytes;
                    r.error_message = input.error_message.clone();
                    Some(r.clone())
                }
                _ => None,
            }
        };
        if updated.is_some() {
            self.announce(Table::Recordings, ChangeOp::Update, id);
        }
        Ok(updated)
    }

    async fn begin_rewrap(&self, id: EntityId) -> Result<Option<Recording>, StoreError> {
        let updated = {
            let mut t = self.tables();
            match t.recordings.get_mut(&id) {
                Some(r) if r.is_rewrappable() => {
                    r.status = RecordingStatus::Processing;
                    r.error_message = None;
                    Some(r.clone())
                }
                _ => None,
            }
        };
        if updated.is_some() {
            self.announce(Table::Recordings, ChangeOp::Update, id);
        }
        Ok(updated)
    }

    async fn complete_rewrap(
        &self,
        id: EntityId,
        mp4_filepath: &str,
    ) -> Result<Option<Recording>, StoreError> {
        let updated = {
            let mut t = self.tables();
            match t.recordings.get_mut(&id) {
                Some(r) if r.status == RecordingStatus::Processing => {
                    r.status = RecordingStatus::Completed;
                    r.mp4_filepath = Some(mp4_filepath.to_string());
                    Some(r.clone())
                }
                _ => None,
            }
        };
        if updated.is_some() {
            self.announce(Table::Recordings, ChangeOp::Update, id);
        }
        Ok(updated)
    }

    async fn fail_rewrap(
        &self,
        id: EntityId,
        error: &str,
    ) -> Result<Option<Recording>, StoreError> {
        let updated = {
            let mut t = self.tables();
            match t.recordings.get_mut(&id) {
                Some(r) if r.status == RecordingStatus::Processing => {
                    r.status = RecordingStatus::Error;
                    r.error_message = Some(error.to_string());
                    Some(r.clone())
                }
                _ => None,
            }
        };
        if updated.is_some() {
            self.announce(Table::Recordings, ChangeOp::Update, id);
        }
        Ok(updated)
    }

    // -- commands -----------------------------------------------------------

    async fn insert_command(&self, input: &CreateCommand) -> Result<Command, StoreError> {
        let command = {
            let mut t = self.tables();
            if !t.servers.contains_key(&input.server_id) {
                return Err(StoreError::not_found("server", input.server_id));
            }
            let command = Command {
                id: new_id(),
                server_id: input.server_id,
                channel_id: input.channel_id,
                command_type: input.command_type.clone(),
                payload: input.payload.clone(),
                status: CommandStatus::Pending,
                result: None,
                error_message: None,
                created_at: Utc::now(),
                claimed_at: None,
                processed_at: None,
            };
            t.commands.push(command.clone());
            command
        };
        self.announce(Table::Commands, ChangeOp::Insert, command.id);
        Ok(command)
    }

    async fn get_command(&self, id: EntityId) -> Result<Option<Command>, StoreError> {
        Ok(self.tables().commands.iter().find(|c| c.id == id).cloned())
    }

    async fn list_pending_commands(
        &self,
        server_id: EntityId,
        limit: i64,
    ) -> Result<Vec<Command>, StoreError> {
        Ok(self
            .tables()
            .commands
            .iter()
            .filter(|c| c.server_id == server_id && c.status == CommandStatus::Pending)
            .take(usize::try_from(limit).unwrap_or(0))
            .cloned()
            .collect())
    }

    async fn list_recent_commands(
        &self,
        server_id: EntityId,
        limit: i64,
    ) -> Result<Vec<Command>, StoreError> {
        Ok(self
            .tables()
            .commands
            .iter()
            .rev()
            .filter(|c| c.server_id == server_id)
            .take(usize::try_from(limit).unwrap_or(0))
            .cloned()
            .collect())
    }

    async fn claim_command(&self, id: EntityId) -> Result<Option<Command>, StoreError> {
        let claimed = {
            let mut t = self.tables();
            match t.commands.iter_mut().find(|c| c.id == id) {
                Some(c) if c.status == CommandStatus::Pending => {
                    c.status = CommandStatus::Processing;
                    c.claimed_at = Some(Utc::now());
                    Some(c.clone())
                }
                _ => None,
            }
        };
        if claimed.is_some() {
            self.announce(Table::Commands, ChangeOp::Update, id);
        }
        Ok(claimed)
    }

    async fn complete_command(
        &self,
        id: EntityId,
        result: &serde_json::Value,
    ) -> Result<bool, StoreError> {
        let applied = {
            let mut t = self.tables();
            match t.commands.iter_mut().find(|c| c.id == id) {
                Some(c) if c.status == CommandStatus::Processing => {
                    c.status = CommandStatus::Completed;
                    c.result = Some(result.clone());
                    c.processed_at = Some(Utc::now());
                    true
                }
                _ => false,
            }
        };
        if applied {
            self.announce(Table::Commands, ChangeOp::Update, id);
        }
        Ok(applied)
    }

    async fn fail_command(&self, id: EntityId, error: &str) -> Result<bool, StoreError> {
        let applied = {
            let mut t = self.tables();
            match t.commands.iter_mut().find(|c| c.id == id) {
                Some(c) if c.status == CommandStatus::Processing => {
                    c.status = CommandStatus::Failed;
                    c.error_message = Some(error.to_string());
                    c.processed_at = Some(Utc::now());
                    true
                }
                _ => false,
            }
        };
        if applied {
            self.announce(Table::Commands, ChangeOp::Update, id);
        }
        Ok(applied)
    }

    async fn fail_orphaned_commands(
        &self,
        server_id: EntityId,
        claimed_before: Timestamp,
        exclude: &[EntityId],
        error: &str,
    ) -> Result<Vec<EntityId>, StoreError> {
        let ids: Vec<EntityId> = {
            let mut t = self.tables();
            let now = Utc::now();
            t.commands
                .iter_mut()
                .filter(|c| {
                    c.server_id == server_id
                        && c.status == CommandStatus::Processing
                        && c.claimed_at.unwrap_or(c.created_at) < claimed_before
                        && !exclude.contains(&c.id)
                })
                .map(|c| {
                    c.status = CommandStatus::Failed;
                    c.error_message = Some(error.to_string());
                    c.processed_at = Some(now);
                    c.id
                })
                .collect()
        };
        self.announce_all(Table::Commands, ChangeOp::Update, &ids);
        Ok(ids)
    }

    // -- logs ---------------------------------------------------------------

    async fn insert_log(&self, input: &CreateServerLog) -> Result<ServerLog, StoreError> {
        let log = ServerLog {
            id: new_id(),
            server_id: input.server_id,
            channel_id: input.channel_id,
            level: input.level,
            message: input.message.clone(),
            details: input.details.clone(),
            created_at: Utc::now(),
        };
        self.tables().logs.push(log.clone());
        self.announce(Table::ServerLogs, ChangeOp::Insert, log.id);
        Ok(log)
    }

    async fn list_logs(
        &self,
        server_id: EntityId,
        params: &LogListQuery,
    ) -> Result<Vec<ServerLog>, StoreError> {
        let limit = usize::try_from(params.effective_limit()).unwrap_or(0);
        Ok(self
            .tables()
            .logs
            .iter()
            .rev()
            .filter(|l| {
                l.server_id == server_id
                    && params.channel_id.is_none_or(|id| l.channel_id == Some(id))
                    && params.level.is_none_or(|level| l.level == level)
            })
            .take(limit)
            .cloned()
            .collect())
    }
}
