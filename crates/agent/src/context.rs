use std::path::PathBuf;
use std::sync::Arc;

use srtcast_core::types::EntityId;
use srtcast_db::models::status::LogLevel;
use srtcast_db::Store;
use srtcast_events::{AgentEvent, EventBus};

use crate::config::AgentConfig;

/// Shared state every agent component is constructed with.
pub struct AgentContext {
    pub server_id: EntityId,
    /// Root directory for channel folders.
    pub base_path: PathBuf,
    pub config: AgentConfig,
    pub store: Arc<dyn Store>,
    pub events: Arc<EventBus>,
}

impl AgentContext {
    /// Publish an operator-visible event and mirror it to tracing.
    pub fn emit(&self, event: AgentEvent) {
        match event.level {
            LogLevel::Error => {
                tracing::error!(channel_id = ?event.channel_id, "{}", event.message)
            }
            LogLevel::Warn => {
                tracing::warn!(channel_id = ?event.channel_id, "{}", event.message)
            }
            LogLevel::Info => {
                tracing::info!(channel_id = ?event.channel_id, "{}", event.message)
            }
            LogLevel::Debug => {
                tracing::debug!(channel_id = ?event.channel_id, "{}", event.message)
            }
        }
        self.events.publish(event);
    }

    pub fn info(&self, channel_id: Option<EntityId>, message: impl Into<String>) {
        self.emit(scoped(AgentEvent::info(self.server_id, message), channel_id));
    }

    pub fn warn(&self, channel_id: Option<EntityId>, message: impl Into<String>) {
        self.emit(scoped(AgentEvent::warn(self.server_id, message), channel_id));
    }

    pub fn error(&self, channel_id: Option<EntityId>, message: impl Into<String>) {
        self.emit(scoped(AgentEvent::error(self.server_id, message), channel_id));
    }

    /// Folder holding a channel's recordings.
    pub fn channel_dir(&self, folder_name: &str) -> PathBuf {
        self.base_path.join(folder_name)
    }
}

fn scoped(event: AgentEvent, channel_id: Option<EntityId>) -> AgentEvent {
    match channel_id {
        Some(id) => event.with_channel(id),
        None => event,
    }
}
