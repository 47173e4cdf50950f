//! Recording manager: captures and rewraps.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use srtcast_core::multicast::MulticastAddr;
use srtcast_core::types::EntityId;
use srtcast_db::models::recording::{CreateRecording, FinishRecording, Recording};
use srtcast_db::models::status::{ChannelStatus, RecordingStatus};
use srtcast_db::StoreError;
use srtcast_events::AgentEvent;
use tokio_util::task::TaskTracker;

use crate::context::AgentContext;
use crate::error::AgentError;
use crate::process::{OutputBuffer, CRASH_TAIL_CHARS};
use crate::supervisor::Supervisor;

pub struct Recorder {
    ctx: Arc<AgentContext>,
    supervisor: Arc<Supervisor>,
    rewraps: TaskTracker,
}

impl Recorder {
    pub fn new(ctx: Arc<AgentContext>, supervisor: Arc<Supervisor>) -> Self {
        Self {
            ctx,
            supervisor,
            rewraps: TaskTracker::new(),
        }
    }

    /// Start capturing a running channel to `<base>/<folder>/<filename>`.
    pub async fn start_recording(
        &self,
        channel_id: EntityId,
        filename: &str,
    ) -> Result<Recording, AgentError> {
        let channel = self
            .ctx
            .store
            .get_channel(channel_id)
            .await?
            .ok_or(AgentError::NotFound {
                entity: "Channel",
                id: channel_id,
            })?;
        if channel.status != ChannelStatus::Running {
            return Err(AgentError::ChannelNotRunning {
                channel_id,
                status: channel.status,
            });
        }
        if self.ctx.store.find_active_recording(channel_id).await?.is_some() {
            return Err(AgentError::RecordingAlreadyActive(channel_id));
        }
        let multicast = MulticastAddr::parse(&channel.multicast_output)?;

        let folder = self.ctx.channel_dir(&channel.folder_name);
        tokio::fs::create_dir_all(&folder).await?;
        let filepath = folder.join(filename);

        let recording = match self
            .ctx
            .store
            .create_recording(&CreateRecording {
                channel_id,
                filename: filename.to_string(),
                filepath: filepath.to_string_lossy().into_owned(),
            })
            .await
        {
            Ok(recording) => recording,
            Err(StoreError::Conflict(_)) => {
                return Err(AgentError::RecordingAlreadyActive(channel_id))
            }
            Err(e) => return Err(e.into()),
        };

        if let Err(e) = self.supervisor.start_capture(&recording, multicast).await {
            let message = e.to_string();
            self.ctx
                .store
                .finish_recording(
                    recording.id,
                    &FinishRecording {
                        status: RecordingStatus::Error,
                        stopped_at: chrono::Utc::now(),
                        duration_seconds: Some(0),
                        file_size_bytes: None,
                        error_message: Some(message.clone()),
                    },
                )
                .await?;
            self.ctx.error(Some(channel_id), format!("Recording failed to start: {message}"));
            return Err(e);
        }
        Ok(recording)
    }

    /// Stop a recording's capture and finalise it.
    ///
    /// A recording that already finished is returned as is.
    pub async fn stop_recording(&self, recording_id: EntityId) -> Result<Recording, AgentError> {
        let recording = self.get_recording(recording_id).await?;
        self.supervisor.stop_capture(&recording).await
    }

    /// Begin remuxing a finished recording into `output_filename`, next to
    /// the TS file. Returns the row in `processing`; the remux completes in
    /// the background.
    pub async fn rewrap(
        &self,
        recording_id: EntityId,
        output_filename: &str,
    ) -> Result<Recording, AgentError> {
        let recording = self.get_recording(recording_id).await?;
        if recording.status == RecordingStatus::Recording {
            return Err(AgentError::RecordingActive(recording_id));
        }
        let not_rewrappable = |r: &Recording| AgentError::RecordingNotRewrappable {
            id: r.id,
            status: r.status,
            rewrapped: r.mp4_filepath.is_some(),
        };
        if !recording.is_rewrappable() {
            return Err(not_rewrappable(&recording));
        }

        let Some(processing) = self.ctx.store.begin_rewrap(recording_id).await? else {
            let current = self.get_recording(recording_id).await?;
            return Err(not_rewrappable(&current));
        };

        let input = PathBuf::from(&processing.filepath);
        let output = output_path(&input, output_filename);
        self.ctx.info(
            Some(processing.channel_id),
            format!("Rewrap started: {} -> {}", processing.filename, output.display()),
        );

        let job = RewrapJob {
            ctx: self.ctx.clone(),
            recording_id,
            channel_id: processing.channel_id,
            input,
            output,
        };
        self.rewraps.spawn(job.run());
        Ok(processing)
    }

    /// Wait up to `timeout` for running rewraps.
    pub async fn drain(&self, timeout: Duration) {
        self.rewraps.close();
        if tokio::time::timeout(timeout, self.rewraps.wait()).await.is_err() {
            tracing::warn!(
                remaining = self.rewraps.len(),
                "Rewraps still running at shutdown, they will be marked failed on next start"
            );
        }
    }

    async fn get_recording(&self, recording_id: EntityId) -> Result<Recording, AgentError> {
        self.ctx
            .store
            .get_recording(recording_id)
            .await?
            .ok_or(AgentError::NotFound {
                entity: "Recording",
                id: recording_id,
            })
    }
}

/// Output file placed in the same directory as the input.
fn output_path(input: &Path, output_filename: &str) -> PathBuf {
    match input.parent() {
        Some(dir) => dir.join(output_filename),
        None => PathBuf::from(output_filename),
    }
}

// ---------------------------------------------------------------------------
// Rewrap job
// ---------------------------------------------------------------------------

struct RewrapJob {
    ctx: Arc<AgentContext>,
    recording_id: EntityId,
    channel_id: EntityId,
    input: PathBuf,
    output: PathBuf,
}

impl RewrapJob {
    async fn run(self) {
        let outcome = self.remux().await;
        let stored = match &outcome {
            Ok(()) => {
                let mp4 = self.output.to_string_lossy();
                self.ctx.store.complete_rewrap(self.recording_id, &mp4).await
            }
            Err(message) => self.ctx.store.fail_rewrap(self.recording_id, message).await,
        };

        match (&outcome, stored) {
            (Ok(()), Ok(_)) => self.ctx.emit(
                AgentEvent::info(self.ctx.server_id, "Rewrap completed")
                    .with_channel(self.channel_id)
                    .with_details(serde_json::json!({
                        "recording_id": self.recording_id,
                        "mp4_filepath": self.output.to_string_lossy(),
                    })),
            ),
            (Err(message), Ok(_)) => self
                .ctx
                .error(Some(self.channel_id), format!("Rewrap failed: {message}")),
            (_, Err(e)) => {
                tracing::error!(recording_id = %self.recording_id, error = %e, "Failed to store rewrap outcome");
            }
        }
    }

    /// Run the remux tool under the configured ceiling.
    async fn remux(&self) -> Result<(), String> {
        let timeout = self.ctx.config.rewrap_timeout;
        let tool = &self.ctx.config.remux_bin;
        let mut cmd = tool.command();
        cmd.arg("-y")
            .arg("-i")
            .arg(&self.input)
            .args(["-map", "0", "-c", "copy"])
            .arg(&self.output);

        match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(Ok(output)) if output.status.success() => Ok(()),
            Ok(Ok(output)) => {
                let mut buffer = OutputBuffer::default();
                for line in String::from_utf8_lossy(&output.stderr).lines() {
                    buffer.push(line);
                }
                Err(format!(
                    "{} exited with {}: {}",
                    tool.program,
                    crate::process::describe_exit(&output.status),
                    buffer.tail(CRASH_TAIL_CHARS)
                ))
            }
            Ok(Err(e)) => Err(format!("Failed to launch {}: {e}", tool.program)),
            Err(_) => Err(format!("Rewrap timed out after {}s", timeout.as_secs())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_sits_next_to_input() {
        assert_eq!(
            output_path(Path::new("/var/streaming/feed/rec.ts"), "out.mp4"),
            PathBuf::from("/var/streaming/feed/out.mp4")
        );
        assert_eq!(output_path(Path::new("rec.ts"), "out.mp4"), PathBuf::from("out.mp4"));
    }
}
