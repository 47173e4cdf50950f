//! Command types and their payload schemas.
//!
//! A command row carries a free-form `command_type` string and a JSON
//! payload. [`CommandRequest::parse`] turns the pair into a typed request,
//! rejecting unknown types and malformed payloads before any handler runs.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::naming;
use crate::types::EntityId;

/// Every command type the agent executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    StartChannel,
    StopChannel,
    StartRecording,
    StopRecording,
    RewrapRecording,
    ProbeStream,
}

impl CommandType {
    pub const ALL: [CommandType; 6] = [
        CommandType::StartChannel,
        CommandType::StopChannel,
        CommandType::StartRecording,
        CommandType::StopRecording,
        CommandType::RewrapRecording,
        CommandType::ProbeStream,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CommandType::StartChannel => "start_channel",
            CommandType::StopChannel => "stop_channel",
            CommandType::StartRecording => "start_recording",
            CommandType::StopRecording => "stop_recording",
            CommandType::RewrapRecording => "rewrap_recording",
            CommandType::ProbeStream => "probe_stream",
        }
    }

    /// Whether the command row must carry a `channel_id`.
    ///
    /// Recording commands address their recording by id and may omit it.
    pub fn requires_channel(self) -> bool {
        !matches!(
            self,
            CommandType::StopRecording | CommandType::RewrapRecording
        )
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandType {
    type Err = CommandParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CommandType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| CommandParseError::Unsupported(s.to_string()))
    }
}

/// Why a command row could not be turned into a [`CommandRequest`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandParseError {
    #[error("Unsupported command type: {0}")]
    Unsupported(String),

    #[error("Invalid payload for {command_type}: {reason}")]
    InvalidPayload {
        command_type: CommandType,
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct StartRecordingPayload {
    filename: String,
}

#[derive(Debug, Deserialize)]
struct StopRecordingPayload {
    recording_id: EntityId,
}

#[derive(Debug, Deserialize)]
struct RewrapPayload {
    recording_id: EntityId,
    output_filename: String,
}

/// A validated command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandRequest {
    StartChannel,
    StopChannel,
    /// `filename` already carries the `.ts` extension.
    StartRecording { filename: String },
    StopRecording { recording_id: EntityId },
    /// `output_filename` already carries the `.mp4` extension.
    RewrapRecording {
        recording_id: EntityId,
        output_filename: String,
    },
    ProbeStream,
}

impl CommandRequest {
    /// Parse a `command_type` plus payload into a typed request.
    ///
    /// Payloads of commands that take none are ignored.
    pub fn parse(command_type: &str, payload: &Value) -> Result<Self, CommandParseError> {
        let kind: CommandType = command_type.parse()?;
        let invalid = |reason: String| CommandParseError::InvalidPayload {
            command_type: kind,
            reason,
        };

        let request = match kind {
            CommandType::StartChannel => CommandRequest::StartChannel,
            CommandType::StopChannel => CommandRequest::StopChannel,
            CommandType::ProbeStream => CommandRequest::ProbeStream,
            CommandType::StartRecording => {
                let p: StartRecordingPayload = decode(payload).map_err(invalid)?;
                let filename =
                    naming::recording_filename(&p.filename).map_err(|e| invalid(e.to_string()))?;
                CommandRequest::StartRecording { filename }
            }
            CommandType::StopRecording => {
                let p: StopRecordingPayload = decode(payload).map_err(invalid)?;
                CommandRequest::StopRecording {
                    recording_id: p.recording_id,
                }
            }
            CommandType::RewrapRecording => {
                let p: RewrapPayload = decode(payload).map_err(invalid)?;
                let output_filename = naming::rewrap_filename(&p.output_filename)
                    .map_err(|e| invalid(e.to_string()))?;
                CommandRequest::RewrapRecording {
                    recording_id: p.recording_id,
                    output_filename,
                }
            }
        };
        Ok(request)
    }

    pub fn command_type(&self) -> CommandType {
        match self {
            CommandRequest::StartChannel => CommandType::StartChannel,
            CommandRequest::StopChannel => CommandType::StopChannel,
            CommandRequest::StartRecording { .. } => CommandType::StartRecording,
            CommandRequest::StopRecording { .. } => CommandType::StopRecording,
            CommandRequest::RewrapRecording { .. } => CommandType::RewrapRecording,
            CommandRequest::ProbeStream => CommandType::ProbeStream,
        }
    }

    /// Canonical JSON payload for this request, as stored on the command row.
    pub fn to_payload(&self) -> Value {
        match self {
            CommandRequest::StartChannel
            | CommandRequest::StopChannel
            | CommandRequest::ProbeStream => serde_json::json!({}),
            CommandRequest::StartRecording { filename } => {
                serde_json::json!({ "filename": filename })
            }
            CommandRequest::StopRecording { recording_id } => {
                serde_json::json!({ "recording_id": recording_id })
            }
            CommandRequest::RewrapRecording {
                recording_id,
                output_filename,
            } => serde_json::json!({
                "recording_id": recording_id,
                "output_filename": output_filename,
            }),
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(payload: &Value) -> Result<T, String> {
    serde_json::from_value(payload.clone()).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn parses_payloadless_commands() {
        assert_eq!(
            CommandRequest::parse("start_channel", &Value::Null).unwrap(),
            CommandRequest::StartChannel
        );
        assert_eq!(
            CommandRequest::parse("probe_stream", &json!({"ignored": true})).unwrap(),
            CommandRequest::ProbeStream
        );
    }

    #[test]
    fn start_recording_appends_extension() {
        let req = CommandRequest::parse("start_recording", &json!({"filename": "match"})).unwrap();
        assert_eq!(
            req,
            CommandRequest::StartRecording {
                filename: "match.ts".into()
            }
        );
    }

    #[test]
    fn rewrap_parses_id_and_output() {
        let id = uuid::Uuid::new_v4();
        let req = CommandRequest::parse(
            "rewrap_recording",
            &json!({"recording_id": id.to_string(), "output_filename": "out"}),
        )
        .unwrap();
        assert_eq!(
            req,
            CommandRequest::RewrapRecording {
                recording_id: id,
                output_filename: "out.mp4".into()
            }
        );
        assert_eq!(req.to_payload()["output_filename"], "out.mp4");
    }

    #[test]
    fn unknown_type_is_unsupported() {
        assert_matches!(
            CommandRequest::parse("reboot", &json!({})),
            Err(CommandParseError::Unsupported(t)) if t == "reboot"
        );
    }

    #[test]
    fn malformed_payloads_are_rejected() {
        assert_matches!(
            CommandRequest::parse("start_recording", &json!({})),
            Err(CommandParseError::InvalidPayload { .. })
        );
        assert_matches!(
            CommandRequest::parse("stop_recording", &json!({"recording_id": "nope"})),
            Err(CommandParseError::InvalidPayload { .. })
        );
        assert_matches!(
            CommandRequest::parse("start_recording", &json!({"filename": "../x"})),
            Err(CommandParseError::InvalidPayload { .. })
        );
    }

    #[test]
    fn channel_requirement() {
        assert!(CommandType::StartChannel.requires_channel());
        assert!(CommandType::ProbeStream.requires_channel());
        assert!(!CommandType::RewrapRecording.requires_channel());
    }
}
