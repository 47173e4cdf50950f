//! In-process event bus backed by a `tokio::sync::broadcast` channel.
//!
//! [`EventBus`] is shared via `Arc<EventBus>` by every agent component that
//! reports something an operator should see in the logs panel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use srtcast_core::types::EntityId;
use srtcast_db::models::status::LogLevel;
use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// AgentEvent
// ---------------------------------------------------------------------------

/// A diagnostic event raised by the agent.
///
/// Constructed with one of the level constructors and enriched with
/// [`with_channel`](AgentEvent::with_channel) and
/// [`with_details`](AgentEvent::with_details).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEvent {
    pub level: LogLevel,
    pub server_id: EntityId,
    pub channel_id: Option<EntityId>,
    pub message: String,
    /// Structured context, e.g. `{"pid": 1234, "exit_code": 1}`.
    pub details: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl AgentEvent {
    pub fn new(level: LogLevel, server_id: EntityId, message: impl Into<String>) -> Self {
        Self {
            level,
            server_id,
            channel_id: None,
            message: message.into(),
            details: None,
            timestamp: Utc::now(),
        }
    }

    pub fn info(server_id: EntityId, message: impl Into<String>) -> Self {
        Self::new(LogLevel::Info, server_id, message)
    }

    pub fn warn(server_id: EntityId, message: impl Into<String>) -> Self {
        Self::new(LogLevel::Warn, server_id, message)
    }

    pub fn error(server_id: EntityId, message: impl Into<String>) -> Self {
        Self::new(LogLevel::Error, server_id, message)
    }

    pub fn debug(server_id: EntityId, message: impl Into<String>) -> Self {
        Self::new(LogLevel::Debug, server_id, message)
    }

    pub fn with_channel(mut self, channel_id: EntityId) -> Self {
        self.channel_id = Some(channel_id);
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 1024;

/// In-process fan-out event bus.
///
/// ```rust
/// use srtcast_events::bus::{AgentEvent, EventBus};
///
/// let bus = EventBus::default();
/// let mut rx = bus.subscribe();
///
/// bus.publish(AgentEvent::info(uuid::Uuid::nil(), "Agent started"));
/// ```
pub struct EventBus {
    sender: broadcast::Sender<AgentEvent>,
}

impl EventBus {
    /// Create a bus with a specific channel capacity.
    ///
    /// When the buffer is full the oldest unconsumed events are dropped and
    /// slow receivers observe `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all current subscribers.
    pub fn publish(&self, event: AgentEvent) {
        // A send error only means there are no receivers.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
