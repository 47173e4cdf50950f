//! Observation task of one capture process and recording finalisation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use srtcast_core::types::{EntityId, Timestamp};
use srtcast_db::models::recording::{FinishRecording, Recording};
use srtcast_db::models::status::RecordingStatus;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::context::AgentContext;
use crate::error::AgentError;
use crate::process::{self, ObservedChild, OutputBuffer};

use super::relay::DRAIN_WAIT;

pub(crate) struct CaptureHandle {
    pub generation: u64,
    pub channel_id: EntityId,
    pub stop: CancellationToken,
    pub task: JoinHandle<()>,
}

pub(crate) type CaptureRegistry = Arc<Mutex<HashMap<EntityId, CaptureHandle>>>;

pub(crate) fn lock_registry(
    registry: &CaptureRegistry,
) -> std::sync::MutexGuard<'_, HashMap<EntityId, CaptureHandle>> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) struct CaptureObserver {
    pub ctx: Arc<AgentContext>,
    pub recording_id: EntityId,
    pub channel_id: EntityId,
    pub filepath: PathBuf,
    pub started_at: Timestamp,
    pub generation: u64,
    pub pid: i32,
    pub registry: CaptureRegistry,
}

impl CaptureObserver {
    pub(crate) async fn run(self, mut observed: ObservedChild, stop: CancellationToken) {
        let mut output = OutputBuffer::default();
        let mut ticker = tokio::time::interval(self.ctx.config.stats_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut lines_open = true;

        let (status, requested) = loop {
            tokio::select! {
                _ = stop.cancelled() => {
                    // SIGINT lets the capture tool flush its last packets.
                    let status = process::terminate(
                        &mut observed.child,
                        self.pid,
                        libc::SIGINT,
                        self.ctx.config.stop_grace,
                    )
                    .await;
                    break (status.ok(), true);
                }
                status = observed.child.wait() => break (status.ok(), false),
                line = observed.lines.recv(), if lines_open => match line {
                    Some(line) => {
                        tracing::debug!(recording_id = %self.recording_id, "{line}");
                        output.push(line);
                    }
                    None => lines_open = false,
                },
                _ = ticker.tick() => self.report_progress().await,
            }
        };

        if requested {
            return;
        }
        while let Ok(Some(line)) = tokio::time::timeout(DRAIN_WAIT, observed.lines.recv()).await {
            output.push(line);
        }
        self.on_unexpected_exit(status, &output).await;
    }

    async fn report_progress(&self) {
        let (size, duration) = measure(&self.filepath, self.started_at).await;
        if let Err(e) = self
            .ctx
            .store
            .update_recording_progress(self.recording_id, size.unwrap_or(0), duration)
            .await
        {
            tracing::warn!(recording_id = %self.recording_id, error = %e, "Failed to update recording progress");
        }
    }

    async fn on_unexpected_exit(&self, status: Option<ExitStatus>, output: &OutputBuffer) {
        {
            let mut registry = lock_registry(&self.registry);
            match registry.get(&self.recording_id) {
                Some(handle) if handle.generation == self.generation => {
                    registry.remove(&self.recording_id);
                }
                // Someone is already stopping this capture.
                _ => return,
            }
        }

        let (final_status, error) = match status {
            Some(s) if s.success() => (RecordingStatus::Stopped, None),
            Some(s) => (
                RecordingStatus::Error,
                Some(process::crash_message("Capture", &s, output)),
            ),
            None => (
                RecordingStatus::Error,
                Some("Capture exited with an unknown status".to_string()),
            ),
        };

        let channel = Some(self.channel_id);
        match &error {
            Some(message) => self.ctx.error(channel, message.clone()),
            None => self.ctx.warn(channel, "Capture ended on its own"),
        }

        if let Err(e) = finalize(
            &self.ctx,
            self.recording_id,
            &self.filepath,
            self.started_at,
            final_status,
            error,
        )
        .await
        {
            tracing::error!(recording_id = %self.recording_id, error = %e, "Failed to finalise recording");
        }
    }
}

/// Current file size and elapsed seconds of a capture.
pub(crate) async fn measure(filepath: &Path, started_at: Timestamp) -> (Option<i64>, i32) {
    let size = tokio::fs::metadata(filepath)
        .await
        .ok()
        .and_then(|m| i64::try_from(m.len()).ok());
    let elapsed = (Utc::now() - started_at).num_seconds().max(0);
    (size, i32::try_from(elapsed).unwrap_or(i32::MAX))
}

/// Write the final size, duration and status of a recording.
///
/// If another path already finished the row, the stored row is returned.
pub(crate) async fn finalize(
    ctx: &AgentContext,
    recording_id: EntityId,
    filepath: &Path,
    started_at: Timestamp,
    status: RecordingStatus,
    error_message: Option<String>,
) -> Result<Recording, AgentError> {
    let (size, duration) = measure(filepath, started_at).await;
    let finished = ctx
        .store
        .finish_recording(
            recording_id,
            &FinishRecording {
                status,
                stopped_at: Utc::now(),
                duration_seconds: Some(duration),
                file_size_bytes: size,
                error_message,
            },
        )
        .await?;

    match finished {
        Some(recording) => Ok(recording),
        None => ctx
            .store
            .get_recording(recording_id)
            .await?
            .ok_or(AgentError::NotFound {
                entity: "Recording",
                id: recording_id,
            }),
    }
}
