//! Operator control layer.
//!
//! The operations a dashboard performs against the shared store: server
//! registration, channel configuration and command submission. Rules that
//! must hold no matter which client writes (edits only while stopped, no
//! deletes under a live process or recording) are enforced here rather
//! than left to the UI.

use std::sync::Arc;

use serde_json::Value;
use srtcast_core::command::CommandRequest;
use srtcast_core::error::CoreError;
use srtcast_core::multicast::{self, MulticastAddr};
use srtcast_core::naming;
use srtcast_core::srt_url::SrtUrl;
use srtcast_core::token;
use srtcast_core::types::EntityId;
use srtcast_db::models::channel::{Channel, CreateChannel, UpdateChannel};
use srtcast_db::models::command::{Command, CreateCommand};
use srtcast_db::models::server::{CreateServer, Server};
use srtcast_db::models::server_log::{LogListQuery, ServerLog};
use srtcast_db::models::status::ChannelStatus;
use srtcast_db::Store;

use crate::error::AgentError;

/// Input for [`ControlPlane::create_channel`].
#[derive(Debug, Clone)]
pub struct NewChannel {
    pub server_id: EntityId,
    pub name: String,
    pub srt_input: String,
    /// Suggested from the server's channel count when omitted.
    pub multicast_output: Option<String>,
}

/// Input for [`ControlPlane::update_channel`]. `None` keeps the value.
#[derive(Debug, Clone, Default)]
pub struct ChannelEdit {
    pub name: Option<String>,
    pub srt_input: Option<String>,
    pub multicast_output: Option<String>,
}

pub struct ControlPlane {
    store: Arc<dyn Store>,
}

impl ControlPlane {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    // -----------------------------------------------------------------------
    // Servers
    // -----------------------------------------------------------------------

    /// Register a server with a freshly generated token.
    pub async fn create_server(
        &self,
        name: &str,
        base_path: Option<&str>,
    ) -> Result<Server, AgentError> {
        let name = non_empty("Server name", name)?;
        let base_path = base_path
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string);
        if let Some(path) = &base_path {
            if !path.starts_with('/') {
                return Err(CoreError::Validation(format!("Base path '{path}' must be absolute")).into());
            }
        }
        Ok(self
            .store
            .create_server(&CreateServer {
                name,
                token: token::generate_server_token(),
                base_path,
            })
            .await?)
    }

    /// Delete a server and, by cascade, its channels and recordings.
    ///
    /// Refused while any of its channels is not stopped.
    pub async fn delete_server(&self, server_id: EntityId) -> Result<(), AgentError> {
        let busy = self
            .store
            .list_channels(server_id)
            .await?
            .into_iter()
            .filter(|c| c.status != ChannelStatus::Stopped)
            .count();
        if busy > 0 {
            return Err(CoreError::Conflict(format!(
                "server has {busy} channel(s) that are not stopped"
            ))
            .into());
        }
        if !self.store.delete_server(server_id).await? {
            return Err(AgentError::NotFound {
                entity: "Server",
                id: server_id,
            });
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Channels
    // -----------------------------------------------------------------------

    /// The multicast output a new channel on `server_id` would get.
    pub async fn suggest_multicast(&self, server_id: EntityId) -> Result<String, AgentError> {
        let existing = self.store.list_channels(server_id).await?.len();
        Ok(multicast::suggest_next(existing))
    }

    pub async fn create_channel(&self, input: NewChannel) -> Result<Channel, AgentError> {
        if self.store.get_server(input.server_id).await?.is_none() {
            return Err(AgentError::NotFound {
                entity: "Server",
                id: input.server_id,
            });
        }
        let name = non_empty("Channel name", &input.name)?;
        let srt_input = SrtUrl::parse(&input.srt_input)?.to_string();
        let multicast_output = match input.multicast_output.as_deref() {
            Some(m) if !m.trim().is_empty() => MulticastAddr::parse(m)?.to_string(),
            _ => self.suggest_multicast(input.server_id).await?,
        };

        Ok(self
            .store
            .create_channel(&CreateChannel {
                server_id: input.server_id,
                folder_name: naming::folder_name(&name),
                name,
                srt_input,
                multicast_output,
            })
            .await?)
    }

    /// Edit a channel's configuration. Only allowed while it is stopped.
    pub async fn update_channel(
        &self,
        channel_id: EntityId,
        edit: ChannelEdit,
    ) -> Result<Channel, AgentError> {
        let name = edit
            .name
            .as_deref()
            .map(|n| non_empty("Channel name", n))
            .transpose()?;
        let update = UpdateChannel {
            folder_name: name.as_deref().map(naming::folder_name),
            name,
            srt_input: edit
                .srt_input
                .as_deref()
                .map(|s| SrtUrl::parse(s).map(|u| u.to_string()))
                .transpose()?,
            multicast_output: edit
                .multicast_output
                .as_deref()
                .map(|m| MulticastAddr::parse(m).map(|a| a.to_string()))
                .transpose()?,
        };
        Ok(self.store.update_channel_config(channel_id, &update).await?)
    }

    /// Delete a channel with its recordings and commands.
    ///
    /// Refused while its relay is live or a recording is in progress.
    pub async fn delete_channel(&self, channel_id: EntityId) -> Result<(), AgentError> {
        let channel = self
            .store
            .get_channel(channel_id)
            .await?
            .ok_or(AgentError::NotFound {
                entity: "Channel",
                id: channel_id,
            })?;
        if channel.status.has_process() {
            return Err(CoreError::Conflict(format!(
                "channel is {}; stop it before deleting",
                channel.status
            ))
            .into());
        }
        Ok(self.store.delete_channel(channel_id).await?)
    }

    // -----------------------------------------------------------------------
    // Commands and logs
    // -----------------------------------------------------------------------

    /// Validate and queue a command for `server_id`.
    ///
    /// The stored payload is the canonical one, with `.ts`/`.mp4`
    /// extensions applied.
    pub async fn enqueue_command(
        &self,
        server_id: EntityId,
        channel_id: Option<EntityId>,
        command_type: &str,
        payload: &Value,
    ) -> Result<Command, AgentError> {
        let request = CommandRequest::parse(command_type, payload)?;
        let kind = request.command_type();

        match channel_id {
            Some(id) => {
                let owned = self
                    .store
                    .get_channel(id)
                    .await?
                    .is_some_and(|c| c.server_id == server_id);
                if !owned {
                    return Err(AgentError::NotFound {
                        entity: "Channel",
                        id,
                    });
                }
            }
            None if kind.requires_channel() => {
                return Err(AgentError::InvalidPayload(format!("{kind} requires a channel_id")));
            }
            None => {}
        }

        Ok(self
            .store
            .insert_command(&CreateCommand {
                server_id,
                channel_id,
                command_type: kind.as_str().to_string(),
                payload: request.to_payload(),
            })
            .await?)
    }

    pub async fn list_commands(
        &self,
        server_id: EntityId,
        limit: i64,
    ) -> Result<Vec<Command>, AgentError> {
        Ok(self.store.list_recent_commands(server_id, limit).await?)
    }

    pub async fn list_logs(
        &self,
        server_id: EntityId,
        query: &LogListQuery,
    ) -> Result<Vec<ServerLog>, AgentError> {
        Ok(self.store.list_logs(server_id, query).await?)
    }
}

fn non_empty(what: &str, value: &str) -> Result<String, AgentError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(CoreError::Validation(format!("{what} must not be empty")).into());
    }
    Ok(value.to_string())
}
