//! Observation task of one relay process.

use std::process::ExitStatus;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use srtcast_core::relay_stats::{self, LineKind};
use srtcast_core::types::{EntityId, Timestamp};
use srtcast_db::models::channel::ChannelStats;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::context::AgentContext;
use crate::process::{self, ObservedChild, OutputBuffer};

/// How long to keep collecting buffered lines after the process is gone.
pub(crate) const DRAIN_WAIT: Duration = Duration::from_millis(50);

/// Sent to the exit monitor when a relay dies without being asked to.
#[derive(Debug)]
pub struct ExitNotice {
    pub channel_id: EntityId,
    pub generation: u64,
    pub status: Option<ExitStatus>,
    /// Crash description including the output tail.
    pub message: String,
}

/// What the observation task hands back once the process is reaped.
#[derive(Debug, Default)]
pub struct RelayExit {
    pub status: Option<ExitStatus>,
    pub output: OutputBuffer,
}

// ---------------------------------------------------------------------------
// Live snapshot
// ---------------------------------------------------------------------------

/// Accumulated metrics of a running relay.
#[derive(Debug)]
pub(crate) struct LiveSnapshot {
    started: Instant,
    input_kbps: Option<i32>,
    output_kbps: Option<i32>,
    dropped_packets: i64,
    last_output: Option<String>,
    last_output_at: Option<Timestamp>,
}

impl LiveSnapshot {
    pub(crate) fn new() -> Self {
        Self {
            started: Instant::now(),
            input_kbps: None,
            output_kbps: None,
            dropped_packets: 0,
            last_output: None,
            last_output_at: None,
        }
    }

    /// Record one output line. Returns what the line is about.
    pub(crate) fn observe(&mut self, line: &str) -> LineKind {
        self.last_output = Some(line.to_string());
        self.last_output_at = Some(Utc::now());

        if let Some(sample) = relay_stats::parse_line(line) {
            if sample.input_kbps.is_some() {
                self.input_kbps = sample.input_kbps;
            }
            if sample.output_kbps.is_some() {
                self.output_kbps = sample.output_kbps;
            }
            if let Some(dropped) = sample.dropped_packets {
                self.dropped_packets = self.dropped_packets.saturating_add(dropped);
            }
            return LineKind::Other;
        }
        relay_stats::classify(line)
    }

    pub(crate) fn stats(&self) -> ChannelStats {
        ChannelStats {
            input_bitrate: self.input_kbps,
            output_bitrate: self.output_kbps,
            uptime_seconds: i64::try_from(self.started.elapsed().as_secs()).unwrap_or(i64::MAX),
            dropped_packets: self.dropped_packets,
            last_output: self.last_output.clone(),
            last_output_at: self.last_output_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Observer
// ---------------------------------------------------------------------------

pub(crate) struct RelayObserver {
    pub ctx: Arc<AgentContext>,
    pub channel_id: EntityId,
    pub generation: u64,
    pub pid: i32,
    pub exits: mpsc::UnboundedSender<ExitNotice>,
}

impl RelayObserver {
    /// Read output and flush snapshots until the process exits or `stop`
    /// fires. `exited` flips to `true` once the process is reaped.
    pub(crate) async fn run(
        self,
        mut observed: ObservedChild,
        stop: CancellationToken,
        exited: watch::Sender<bool>,
    ) -> RelayExit {
        let mut output = OutputBuffer::default();
        let mut snapshot = LiveSnapshot::new();
        let mut ticker = tokio::time::interval(self.ctx.config.stats_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut lines_open = true;

        let (status, requested) = loop {
            tokio::select! {
                _ = stop.cancelled() => {
                    let status = process::terminate(
                        &mut observed.child,
                        self.pid,
                        libc::SIGTERM,
                        self.ctx.config.stop_grace,
                    )
                    .await;
                    if let Err(e) = &status {
                        tracing::error!(channel_id = %self.channel_id, pid = self.pid, error = %e, "Failed to stop relay");
                    }
                    break (status.ok(), true);
                }
                status = observed.child.wait() => {
                    break (status.ok(), false);
                }
                line = observed.lines.recv(), if lines_open => match line {
                    Some(line) => self.on_line(line, &mut output, &mut snapshot),
                    None => lines_open = false,
                },
                _ = ticker.tick() => self.flush(&snapshot).await,
            }
        };

        while let Ok(Some(line)) = tokio::time::timeout(DRAIN_WAIT, observed.lines.recv()).await {
            output.push(line);
        }
        exited.send_replace(true);

        if !requested {
            let message = match &status {
                Some(status) => process::crash_message("Relay", status, &output),
                None => "Relay exited with an unknown status".to_string(),
            };
            let notice = ExitNotice {
                channel_id: self.channel_id,
                generation: self.generation,
                status,
                message,
            };
            if self.exits.send(notice).is_err() {
                tracing::warn!(channel_id = %self.channel_id, "Exit monitor is gone, relay exit not handled");
            }
        }

        RelayExit { status, output }
    }

    fn on_line(&self, line: String, output: &mut OutputBuffer, snapshot: &mut LiveSnapshot) {
        let kind = snapshot.observe(&line);
        let channel = Some(self.channel_id);
        match kind {
            LineKind::Connected | LineKind::Ready => self.ctx.info(channel, line.clone()),
            LineKind::ConnectionIssue => self.ctx.warn(channel, line.clone()),
            LineKind::Error => self.ctx.error(channel, line.clone()),
            LineKind::Other => {}
        }
        output.push(line);
    }

    async fn flush(&self, snapshot: &LiveSnapshot) {
        let stats = snapshot.stats();
        match self
            .ctx
            .store
            .update_channel_stats(self.channel_id, self.pid, &stats)
            .await
        {
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(channel_id = %self.channel_id, error = %e, "Failed to flush relay stats");
            }
        }
    }
}
