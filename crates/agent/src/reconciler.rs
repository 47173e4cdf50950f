//! Channel state machine.
//!
//! Every status change of a channel goes through [`Reconciler::apply`],
//! which turns a [`RelayEvent`] into one guarded single-row update of
//! `status`, `pid` and `error_message` together.
//!
//! ```text
//! stopped|error --Started--> starting --Confirmed--> running
//! running|starting --StopRequested--> stopping --Exited--> stopped
//! starting|running|stopping|stopped|error --Failed--> error
//! error --Cleared--> stopped
//! ```

use std::sync::Arc;

use srtcast_core::types::EntityId;
use srtcast_db::models::channel::{Channel, ChannelTransition};
use srtcast_db::models::status::ChannelStatus;

use crate::context::AgentContext;
use crate::error::AgentError;

/// Something that happened to a channel's relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// A relay process was spawned.
    Started { pid: i32 },
    /// The process survived the launch grace period.
    Confirmed { pid: i32 },
    /// An operator asked for the relay to stop.
    StopRequested { pid: i32 },
    /// The process is gone and no restart is pending.
    Exited,
    /// Launch failure, crash, or a failed command on the channel.
    Failed { message: String },
    /// An errored channel without a process is reset by a stop request.
    Cleared,
}

impl RelayEvent {
    pub fn name(&self) -> &'static str {
        match self {
            RelayEvent::Started { .. } => "started",
            RelayEvent::Confirmed { .. } => "confirmed",
            RelayEvent::StopRequested { .. } => "stop_requested",
            RelayEvent::Exited => "exited",
            RelayEvent::Failed { .. } => "failed",
            RelayEvent::Cleared => "cleared",
        }
    }

    /// The guarded update this event maps to.
    pub fn transition(&self) -> ChannelTransition {
        use ChannelStatus::*;

        let (from, to, pid, error_message, clear_stats) = match self {
            RelayEvent::Started { pid } => (vec![Stopped, Error], Starting, Some(*pid), None, true),
            RelayEvent::Confirmed { pid } => (vec![Starting], Running, Some(*pid), None, false),
            RelayEvent::StopRequested { pid } => {
                (vec![Running, Starting], Stopping, Some(*pid), None, false)
            }
            RelayEvent::Exited => (vec![Stopping, Starting, Running], Stopped, None, None, true),
            RelayEvent::Failed { message } => (
                vec![Starting, Running, Stopping, Stopped, Error],
                Error,
                None,
                Some(message.clone()),
                true,
            ),
            RelayEvent::Cleared => (vec![Error], Stopped, None, None, true),
        };
        ChannelTransition {
            from,
            to,
            pid,
            error_message,
            clear_stats,
        }
    }
}

#[derive(Clone)]
pub struct Reconciler {
    ctx: Arc<AgentContext>,
}

impl Reconciler {
    pub fn new(ctx: Arc<AgentContext>) -> Self {
        Self { ctx }
    }

    /// Apply `event` to the channel, failing if its current status does not
    /// allow it.
    pub async fn apply(&self, channel_id: EntityId, event: RelayEvent) -> Result<Channel, AgentError> {
        let transition = event.transition();
        if let Some(channel) = self
            .ctx
            .store
            .transition_channel(channel_id, &transition)
            .await?
        {
            tracing::debug!(
                channel_id = %channel_id,
                event = event.name(),
                status = %channel.status,
                pid = ?channel.pid,
                "Channel transitioned",
            );
            return Ok(channel);
        }

        match self.ctx.store.get_channel(channel_id).await? {
            Some(channel) => Err(AgentError::InvalidTransition {
                channel_id,
                from: channel.status,
                event: event.name(),
            }),
            None => Err(AgentError::NotFound {
                entity: "Channel",
                id: channel_id,
            }),
        }
    }
}
