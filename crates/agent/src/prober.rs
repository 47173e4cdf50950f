//! Out-of-band transport stream analysis.
//!
//! Runs the probe tool against a channel's SRT source, maps its JSON
//! report to [`TsInfo`] and stores it on the channel. The relay is never
//! touched.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use srtcast_core::ts_info::{self, TsInfo};
use srtcast_core::types::EntityId;
use srtcast_db::models::channel::Channel;
use srtcast_events::AgentEvent;

use crate::context::AgentContext;
use crate::error::AgentError;
use crate::process::{OutputBuffer, CRASH_TAIL_CHARS};

pub struct Prober {
    ctx: Arc<AgentContext>,
    in_progress: Arc<Mutex<HashSet<EntityId>>>,
}

/// Marks a channel as being probed until dropped.
struct ProbeSlot {
    channel_id: EntityId,
    in_progress: Arc<Mutex<HashSet<EntityId>>>,
}

impl Drop for ProbeSlot {
    fn drop(&mut self) {
        self.in_progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.channel_id);
    }
}

impl Prober {
    pub fn new(ctx: Arc<AgentContext>) -> Self {
        Self {
            ctx,
            in_progress: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn reserve(&self, channel_id: EntityId) -> Result<ProbeSlot, AgentError> {
        let mut in_progress = self.in_progress.lock().unwrap_or_else(PoisonError::into_inner);
        if !in_progress.insert(channel_id) {
            return Err(AgentError::ProbeInProgress(channel_id));
        }
        Ok(ProbeSlot {
            channel_id,
            in_progress: self.in_progress.clone(),
        })
    }

    /// Probe the channel's source and persist the result.
    ///
    /// A second probe of the same channel while one runs is rejected.
    pub async fn probe(&self, channel: &Channel) -> Result<TsInfo, AgentError> {
        let _slot = self.reserve(channel.id)?;
        let info = self.run_probe(&channel.srt_input).await?;

        let value = serde_json::to_value(&info)
            .map_err(|e| AgentError::ProbeFailed(format!("unserialisable probe result: {e}")))?;
        self.ctx.store.set_ts_info(channel.id, &value).await?;

        self.ctx.emit(
            AgentEvent::info(
                self.ctx.server_id,
                format!(
                    "Stream analysed: {} video, {} audio stream(s)",
                    info.video.len(),
                    info.audio.len()
                ),
            )
            .with_channel(channel.id)
            .with_details(value),
        );
        Ok(info)
    }

    async fn run_probe(&self, source: &str) -> Result<TsInfo, AgentError> {
        let timeout = self.ctx.config.probe_timeout;
        let tool = &self.ctx.config.probe_bin;
        let mut cmd = tool.command();
        cmd.args([
            "-v",
            "error",
            "-print_format",
            "json",
            "-show_format",
            "-show_programs",
            "-show_streams",
        ])
        .arg(source);

        let output = match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(AgentError::ProbeFailed(format!(
                    "failed to launch {}: {e}",
                    tool.program
                )))
            }
            Err(_) => return Err(AgentError::ProbeTimeout(timeout)),
        };

        if !output.status.success() {
            let mut buffer = OutputBuffer::default();
            for line in String::from_utf8_lossy(&output.stderr).lines() {
                buffer.push(line);
            }
            return Err(AgentError::ProbeFailed(format!(
                "{} exited with {}: {}",
                tool.program,
                crate::process::describe_exit(&output.status),
                buffer.tail(CRASH_TAIL_CHARS)
            )));
        }

        let info = ts_info::parse_ffprobe_json(&String::from_utf8_lossy(&output.stdout))
            .map_err(|e| AgentError::ProbeFailed(e.to_string()))?;
        if info.is_empty() {
            return Err(AgentError::ProbeFailed(
                "no programs or elementary streams found".into(),
            ));
        }
        Ok(info)
    }
}
