use std::time::Duration;

use srtcast_core::command::CommandParseError;
use srtcast_core::error::CoreError;
use srtcast_core::types::EntityId;
use srtcast_db::models::status::{ChannelStatus, RecordingStatus};
use srtcast_db::StoreError;

/// Everything that can go wrong while executing agent work.
///
/// Every command resolves to `completed` or `failed`; the `Display` text of
/// this error is what lands in `commands.error_message`.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Failed to launch {tool}: {reason}")]
    ProcessLaunch { tool: String, reason: String },

    #[error("Multicast output {multicast} is already used by channel {holder}")]
    MulticastConflict {
        multicast: String,
        holder: EntityId,
    },

    #[error("Process exited unexpectedly: {0}")]
    ProcessCrash(String),

    #[error("Probe produced no result within {}s", .0.as_secs())]
    ProbeTimeout(Duration),

    #[error("A probe is already running for channel {0}")]
    ProbeInProgress(EntityId),

    #[error("Probe failed: {0}")]
    ProbeFailed(String),

    #[error("Channel {channel_id} is {status}; recording requires a running channel")]
    ChannelNotRunning {
        channel_id: EntityId,
        status: ChannelStatus,
    },

    #[error("Channel {0} already has an active recording")]
    RecordingAlreadyActive(EntityId),

    #[error("Recording {0} is still in progress")]
    RecordingActive(EntityId),

    #[error("Recording {id} cannot be rewrapped (status {status}, already rewrapped: {rewrapped})")]
    RecordingNotRewrappable {
        id: EntityId,
        status: RecordingStatus,
        rewrapped: bool,
    },

    #[error("Unsupported command type: {0}")]
    UnsupportedCommand(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: EntityId },

    #[error("Channel {channel_id} cannot apply {event} while {from}")]
    InvalidTransition {
        channel_id: EntityId,
        from: ChannelStatus,
        event: &'static str,
    },

    #[error("Unknown server token")]
    Unauthorized,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AgentError {
    /// Whether the failure is a rejection that left every row as it was.
    ///
    /// Any other failure of a channel-scoped command moves the channel to
    /// `error` so the operator sees it.
    pub fn leaves_channel_untouched(&self) -> bool {
        matches!(
            self,
            AgentError::MulticastConflict { .. }
                | AgentError::ProbeTimeout(_)
                | AgentError::ProbeInProgress(_)
                | AgentError::ProbeFailed(_)
                | AgentError::ChannelNotRunning { .. }
                | AgentError::RecordingAlreadyActive(_)
                | AgentError::RecordingActive(_)
                | AgentError::RecordingNotRewrappable { .. }
                | AgentError::UnsupportedCommand(_)
                | AgentError::InvalidPayload(_)
                | AgentError::NotFound { .. }
                | AgentError::InvalidTransition { .. }
        )
    }
}

impl From<CommandParseError> for AgentError {
    fn from(e: CommandParseError) -> Self {
        match e {
            CommandParseError::Unsupported(kind) => AgentError::UnsupportedCommand(kind),
            invalid @ CommandParseError::InvalidPayload { .. } => {
                AgentError::InvalidPayload(invalid.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejections_leave_channel_untouched() {
        let id = uuid::Uuid::nil();
        assert!(AgentError::RecordingAlreadyActive(id).leaves_channel_untouched());
        assert!(AgentError::ProbeTimeout(Duration::from_secs(30)).leaves_channel_untouched());
        assert!(AgentError::UnsupportedCommand("reboot".into()).leaves_channel_untouched());
        assert!(AgentError::MulticastConflict {
            multicast: "239.1.1.1:5000".into(),
            holder: id,
        }
        .leaves_channel_untouched());
    }

    #[test]
    fn execution_failures_surface_on_channel() {
        let launch = AgentError::ProcessLaunch {
            tool: "srt-live-transmit".into(),
            reason: "No such file or directory".into(),
        };
        assert!(!launch.leaves_channel_untouched());
        assert!(!AgentError::ProcessCrash("exit code 1".into()).leaves_channel_untouched());
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        assert!(!AgentError::from(io).leaves_channel_untouched());
    }

    #[test]
    fn parse_errors_map_to_taxonomy() {
        let unsupported = AgentError::from(CommandParseError::Unsupported("reboot".into()));
        assert_eq!(unsupported.to_string(), "Unsupported command type: reboot");
    }
}
