//! Process supervisor.
//!
//! Owns the relay process of every active channel and the capture process
//! of every active recording. Each process lives in an arena slot keyed by
//! channel or recording id together with a generation number, so exit
//! reports from a replaced process are recognised and ignored.
//!
//! Callers hold the channel's lock from [`ChannelLocks`](crate::locks::ChannelLocks)
//! around every relay operation.

mod capture;
mod relay;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use srtcast_core::multicast::MulticastAddr;
use srtcast_core::srt_url::SrtUrl;
use srtcast_core::types::EntityId;
use srtcast_db::models::channel::Channel;
use srtcast_db::models::recording::Recording;
use srtcast_db::models::status::{ChannelStatus, RecordingStatus};
use srtcast_events::AgentEvent;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::context::AgentContext;
use crate::error::AgentError;
use crate::locks::ChannelLocks;
use crate::process::{self, Stdout};
use crate::reconciler::{Reconciler, RelayEvent};

use self::capture::{CaptureHandle, CaptureObserver, CaptureRegistry};
pub use self::relay::{ExitNotice, RelayExit};
use self::relay::RelayObserver;

/// Relay statistics cadence passed to the relay tool, in milliseconds.
const RELAY_STATS_EVERY_MS: &str = "1000";

/// Capture tool sink that writes the received stream to stdout.
const CAPTURE_SINK: &str = "file://con";

struct RelayHandle {
    generation: u64,
    pid: i32,
    multicast: MulticastAddr,
    stop: CancellationToken,
    task: JoinHandle<RelayExit>,
}

/// Multicast address held by a relay launch that has not registered its
/// handle yet. Released on drop.
struct MulticastClaim<'a> {
    launching: &'a Mutex<HashMap<MulticastAddr, EntityId>>,
    multicast: MulticastAddr,
}

impl Drop for MulticastClaim<'_> {
    fn drop(&mut self) {
        self.launching
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.multicast);
    }
}

pub struct Supervisor {
    ctx: Arc<AgentContext>,
    reconciler: Reconciler,
    relays: Mutex<HashMap<EntityId, RelayHandle>>,
    /// Outputs reserved by launches in progress.
    launching: Mutex<HashMap<MulticastAddr, EntityId>>,
    captures: CaptureRegistry,
    next_generation: AtomicU64,
    exits: mpsc::UnboundedSender<ExitNotice>,
    /// Automatic restarts spent per channel since its last operator start.
    restarts: Mutex<HashMap<EntityId, u32>>,
}

impl Supervisor {
    /// Create a supervisor and the receiving end of its exit notices.
    pub fn new(ctx: Arc<AgentContext>) -> (Arc<Self>, mpsc::UnboundedReceiver<ExitNotice>) {
        let (exits, exit_rx) = mpsc::unbounded_channel();
        let supervisor = Self {
            reconciler: Reconciler::new(ctx.clone()),
            ctx,
            relays: Mutex::new(HashMap::new()),
            launching: Mutex::new(HashMap::new()),
            captures: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(1),
            exits,
            restarts: Mutex::new(HashMap::new()),
        };
        (Arc::new(supervisor), exit_rx)
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    fn relays(&self) -> std::sync::MutexGuard<'_, HashMap<EntityId, RelayHandle>> {
        self.relays.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pid of the channel's relay, if one is registered.
    pub fn relay_pid(&self, channel_id: EntityId) -> Option<i32> {
        self.relays().get(&channel_id).map(|h| h.pid)
    }

    /// Channels that currently have a relay process.
    pub fn running_relays(&self) -> Vec<EntityId> {
        self.relays().keys().copied().collect()
    }

    /// Recordings that currently have a capture process.
    pub fn active_captures(&self) -> Vec<EntityId> {
        capture::lock_registry(&self.captures).keys().copied().collect()
    }

    // -----------------------------------------------------------------------
    // Relays
    // -----------------------------------------------------------------------

    /// Start the channel's relay on operator request.
    ///
    /// Starting a channel that is already starting or running is a no-op.
    /// Resets the automatic restart budget.
    pub async fn start_relay(&self, channel: &Channel) -> Result<Channel, AgentError> {
        let registered = self.relay_pid(channel.id).is_some();
        match channel.status {
            ChannelStatus::Starting | ChannelStatus::Running if registered => {
                tracing::debug!(channel_id = %channel.id, "Relay already running");
                return Ok(channel.clone());
            }
            ChannelStatus::Starting | ChannelStatus::Running => {
                // Left behind by a previous agent; nothing is actually running.
                self.reconciler.apply(channel.id, RelayEvent::Exited).await?;
            }
            ChannelStatus::Stopping => {
                return Err(AgentError::InvalidTransition {
                    channel_id: channel.id,
                    from: channel.status,
                    event: "start",
                });
            }
            ChannelStatus::Stopped | ChannelStatus::Error => {}
        }

        self.restarts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&channel.id);
        self.launch_relay(channel).await
    }

    async fn launch_relay(&self, channel: &Channel) -> Result<Channel, AgentError> {
        let multicast = MulticastAddr::parse(&channel.multicast_output)?;
        let _claim = self.claim_multicast(channel.id, multicast)?;

        tokio::fs::create_dir_all(self.ctx.channel_dir(&channel.folder_name)).await?;

        let args = vec![
            channel.srt_input.clone(),
            multicast.relay_target(),
            "-v".to_string(),
            "-s".to_string(),
            RELAY_STATS_EVERY_MS.to_string(),
            "-pf".to_string(),
            "json".to_string(),
        ];
        let tool = &self.ctx.config.relay_bin;
        let mut observed = match process::spawn_observed(tool, &args, Stdout::Observed).await {
            Ok(observed) => observed,
            Err(e) => {
                let message = e.to_string();
                self.reconciler
                    .apply(channel.id, RelayEvent::Failed { message: message.clone() })
                    .await?;
                self.ctx.error(Some(channel.id), message);
                return Err(e);
            }
        };
        let pid = observed.pid;

        if let Err(e) = self.reconciler.apply(channel.id, RelayEvent::Started { pid }).await {
            let _ = observed.child.start_kill();
            return Err(e);
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let stop = CancellationToken::new();
        let (exited_tx, exited_rx) = watch::channel(false);
        let observer = RelayObserver {
            ctx: self.ctx.clone(),
            channel_id: channel.id,
            generation,
            pid,
            exits: self.exits.clone(),
        };
        {
            let mut relays = self.relays();
            let task = tokio::spawn(observer.run(observed, stop.clone(), exited_tx));
            relays.insert(
                channel.id,
                RelayHandle {
                    generation,
                    pid,
                    multicast,
                    stop,
                    task,
                },
            );
        }

        let source = SrtUrl::parse(&channel.srt_input)
            .map(|u| u.redacted())
            .unwrap_or_else(|_| channel.srt_input.clone());
        self.ctx.emit(
            AgentEvent::info(self.ctx.server_id, format!("Relay started (PID: {pid})"))
                .with_channel(channel.id)
                .with_details(serde_json::json!({
                    "pid": pid,
                    "srt_input": source,
                    "multicast_output": multicast.to_string(),
                })),
        );

        let mut exited = exited_rx;
        let died = tokio::time::timeout(
            self.ctx.config.launch_grace,
            exited.wait_for(|done| *done),
        )
        .await
        .is_ok();

        if died {
            let exit = self.take_relay(channel.id, generation).await.unwrap_or_default();
            let message = match &exit.status {
                Some(status) => process::crash_message("Relay", status, &exit.output),
                None => "Relay exited during startup".to_string(),
            };
            self.reconciler
                .apply(channel.id, RelayEvent::Failed { message: message.clone() })
                .await?;
            self.ctx.error(Some(channel.id), message.clone());
            return Err(AgentError::ProcessLaunch {
                tool: tool.program.clone(),
                reason: message,
            });
        }

        let running = self
            .reconciler
            .apply(channel.id, RelayEvent::Confirmed { pid })
            .await?;
        self.ctx.info(Some(channel.id), "Channel running");
        Ok(running)
    }

    /// Reserve `multicast` for `channel_id` until the returned claim drops.
    ///
    /// Registered relays and launches in progress both count as holders;
    /// the check and the reservation happen under the relay registry lock.
    fn claim_multicast(
        &self,
        channel_id: EntityId,
        multicast: MulticastAddr,
    ) -> Result<MulticastClaim<'_>, AgentError> {
        let relays = self.relays();
        let mut launching = self.launching.lock().unwrap_or_else(PoisonError::into_inner);
        let holder = relays
            .iter()
            .find(|(id, h)| **id != channel_id && h.multicast == multicast)
            .map(|(id, _)| *id)
            .or_else(|| {
                launching
                    .get(&multicast)
                    .copied()
                    .filter(|id| *id != channel_id)
            });
        if let Some(holder) = holder {
            return Err(AgentError::MulticastConflict {
                multicast: multicast.to_string(),
                holder,
            });
        }
        launching.insert(multicast, channel_id);
        Ok(MulticastClaim {
            launching: &self.launching,
            multicast,
        })
    }

    /// Remove the relay slot if it still holds `generation` and wait for
    /// its observation task.
    async fn take_relay(&self, channel_id: EntityId, generation: u64) -> Option<RelayExit> {
        let handle = {
            let mut relays = self.relays();
            match relays.get(&channel_id) {
                Some(h) if h.generation == generation => relays.remove(&channel_id),
                _ => None,
            }
        }?;
        Some(handle.task.await.unwrap_or_default())
    }

    /// Terminate the relay process of a handle that was already removed.
    async fn terminate_relay(&self, handle: RelayHandle) -> RelayExit {
        handle.stop.cancel();
        match handle.task.await {
            Ok(exit) => exit,
            Err(e) => {
                tracing::error!(pid = handle.pid, error = %e, "Relay observation task failed");
                RelayExit::default()
            }
        }
    }

    /// Stop the channel's relay.
    ///
    /// Stopping a stopped channel is a no-op. An errored channel without a
    /// process is reset to stopped. Any active recording is finalised first.
    pub async fn stop_relay(&self, channel_id: EntityId) -> Result<Channel, AgentError> {
        let channel = self.get_channel(channel_id).await?;
        let handle = self.relays().remove(&channel_id);

        let Some(handle) = handle else {
            return match channel.status {
                ChannelStatus::Stopped => Ok(channel),
                ChannelStatus::Error => {
                    self.stop_channel_capture(channel_id).await?;
                    self.reconciler.apply(channel_id, RelayEvent::Cleared).await
                }
                ChannelStatus::Starting | ChannelStatus::Running | ChannelStatus::Stopping => {
                    self.stop_channel_capture(channel_id).await?;
                    let stopped = self.reconciler.apply(channel_id, RelayEvent::Exited).await?;
                    self.ctx.info(Some(channel_id), "Channel stopped");
                    Ok(stopped)
                }
            };
        };

        self.stop_channel_capture(channel_id).await?;
        let pid = handle.pid;
        self.ctx.info(Some(channel_id), format!("Stopping channel (PID: {pid})"));
        if let Err(e) = self
            .reconciler
            .apply(channel_id, RelayEvent::StopRequested { pid })
            .await
        {
            tracing::warn!(channel_id = %channel_id, error = %e, "Stopping relay from unexpected status");
        }

        let exit = self.terminate_relay(handle).await;
        tracing::debug!(channel_id = %channel_id, pid, status = ?exit.status, "Relay reaped");

        let stopped = match self.reconciler.apply(channel_id, RelayEvent::Exited).await {
            Ok(channel) => channel,
            Err(AgentError::InvalidTransition { .. }) => self.get_channel(channel_id).await?,
            Err(e) => return Err(e),
        };
        self.ctx.info(Some(channel_id), "Channel stopped");
        Ok(stopped)
    }

    /// Move the channel to `error`, terminating its relay if there is one.
    pub async fn fail_channel(
        &self,
        channel_id: EntityId,
        message: impl Into<String>,
    ) -> Result<Channel, AgentError> {
        let message = message.into();
        let handle = self.relays().remove(&channel_id);
        if let Some(handle) = handle {
            self.stop_channel_capture(channel_id).await?;
            self.terminate_relay(handle).await;
        } else {
            let channel = self.get_channel(channel_id).await?;
            if channel.status == ChannelStatus::Error {
                return Ok(channel);
            }
        }
        self.reconciler
            .apply(channel_id, RelayEvent::Failed { message })
            .await
    }

    /// React to a relay that exited without being asked to.
    ///
    /// Failure exits move the channel to `error`. A clean exit of a relay
    /// that should be running is restarted while the restart budget lasts.
    pub async fn handle_exit(&self, notice: ExitNotice) -> Result<(), AgentError> {
        let channel_id = notice.channel_id;
        if self.take_relay(channel_id, notice.generation).await.is_none() {
            tracing::debug!(channel_id = %channel_id, generation = notice.generation, "Ignoring exit of a replaced relay");
            return Ok(());
        }

        self.stop_channel_capture(channel_id).await?;

        let clean = notice.status.is_some_and(|s| s.success());
        if clean {
            let attempt = {
                let mut restarts = self.restarts.lock().unwrap_or_else(PoisonError::into_inner);
                let spent = restarts.entry(channel_id).or_insert(0);
                (*spent < self.ctx.config.max_auto_restarts).then(|| {
                    *spent += 1;
                    *spent
                })
            };

            if let Some(attempt) = attempt {
                self.ctx.warn(
                    Some(channel_id),
                    format!(
                        "Relay exited cleanly while running, restarting (attempt {attempt}/{})",
                        self.ctx.config.max_auto_restarts
                    ),
                );
                let stopped = self.reconciler.apply(channel_id, RelayEvent::Exited).await?;
                if let Err(e) = self.launch_relay(&stopped).await {
                    tracing::warn!(channel_id = %channel_id, error = %e, "Automatic relay restart failed");
                    self.fail_channel(channel_id, format!("Automatic restart failed: {e}"))
                        .await?;
                }
                return Ok(());
            }
        }

        let message = if clean {
            format!(
                "Relay exited unexpectedly; automatic restart limit ({}) reached",
                self.ctx.config.max_auto_restarts
            )
        } else {
            notice.message
        };
        self.reconciler
            .apply(channel_id, RelayEvent::Failed { message: message.clone() })
            .await?;
        self.ctx.error(Some(channel_id), message);
        Ok(())
    }

    async fn get_channel(&self, channel_id: EntityId) -> Result<Channel, AgentError> {
        self.ctx
            .store
            .get_channel(channel_id)
            .await?
            .ok_or(AgentError::NotFound {
                entity: "Channel",
                id: channel_id,
            })
    }

    // -----------------------------------------------------------------------
    // Captures
    // -----------------------------------------------------------------------

    /// Launch a capture process writing the channel's multicast to the
    /// recording's file. Returns the capture pid.
    pub async fn start_capture(
        &self,
        recording: &Recording,
        multicast: MulticastAddr,
    ) -> Result<i32, AgentError> {
        let filepath = PathBuf::from(&recording.filepath);
        let args = vec![multicast.capture_source(), CAPTURE_SINK.to_string()];
        let observed = process::spawn_observed(
            &self.ctx.config.capture_bin,
            &args,
            Stdout::File(&filepath),
        )
        .await?;
        let pid = observed.pid;

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let stop = CancellationToken::new();
        let observer = CaptureObserver {
            ctx: self.ctx.clone(),
            recording_id: recording.id,
            channel_id: recording.channel_id,
            filepath,
            started_at: recording.started_at,
            generation,
            pid,
            registry: self.captures.clone(),
        };
        {
            let mut registry = capture::lock_registry(&self.captures);
            let task = tokio::spawn(observer.run(observed, stop.clone()));
            registry.insert(
                recording.id,
                CaptureHandle {
                    generation,
                    channel_id: recording.channel_id,
                    stop,
                    task,
                },
            );
        }

        self.ctx.emit(
            AgentEvent::info(
                self.ctx.server_id,
                format!("Recording started: {}", recording.filename),
            )
            .with_channel(recording.channel_id)
            .with_details(serde_json::json!({
                "recording_id": recording.id,
                "filepath": recording.filepath,
                "pid": pid,
            })),
        );
        Ok(pid)
    }

    /// Stop a recording's capture and finalise its size and duration.
    ///
    /// A recording that is no longer `recording` is returned unchanged.
    pub async fn stop_capture(&self, recording: &Recording) -> Result<Recording, AgentError> {
        if recording.status != RecordingStatus::Recording {
            return Ok(recording.clone());
        }

        let handle = capture::lock_registry(&self.captures).remove(&recording.id);
        if let Some(handle) = handle {
            handle.stop.cancel();
            if let Err(e) = handle.task.await {
                tracing::error!(recording_id = %recording.id, error = %e, "Capture observation task failed");
            }
        }

        let finished = capture::finalize(
            &self.ctx,
            recording.id,
            std::path::Path::new(&recording.filepath),
            recording.started_at,
            RecordingStatus::Stopped,
            None,
        )
        .await?;
        self.ctx.emit(
            AgentEvent::info(
                self.ctx.server_id,
                format!("Recording stopped: {}", finished.filename),
            )
            .with_channel(finished.channel_id)
            .with_details(serde_json::json!({
                "recording_id": finished.id,
                "file_size_bytes": finished.file_size_bytes,
                "duration_seconds": finished.duration_seconds,
            })),
        );
        Ok(finished)
    }

    /// Stop the channel's active recording, if any.
    pub async fn stop_channel_capture(
        &self,
        channel_id: EntityId,
    ) -> Result<Option<Recording>, AgentError> {
        match self.ctx.store.find_active_recording(channel_id).await? {
            Some(recording) => Ok(Some(self.stop_capture(&recording).await?)),
            None => Ok(None),
        }
    }

    /// Finalise a recording whose capture process is gone, such as one left
    /// `recording` by a previous agent run.
    pub async fn close_orphaned_recording(
        &self,
        recording: &Recording,
    ) -> Result<Recording, AgentError> {
        if let Some(handle) = capture::lock_registry(&self.captures).remove(&recording.id) {
            handle.stop.cancel();
        }
        capture::finalize(
            &self.ctx,
            recording.id,
            std::path::Path::new(&recording.filepath),
            recording.started_at,
            RecordingStatus::Stopped,
            None,
        )
        .await
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    /// Stop every capture and relay this supervisor owns.
    pub async fn shutdown(&self, locks: &ChannelLocks) {
        let capture_channels: Vec<EntityId> = capture::lock_registry(&self.captures)
            .values()
            .map(|h| h.channel_id)
            .collect();
        let mut channels = self.running_relays();
        for channel_id in capture_channels {
            if !channels.contains(&channel_id) {
                channels.push(channel_id);
            }
        }

        let stops = channels.into_iter().map(|channel_id| async move {
            let _guard = locks.lock(channel_id).await;
            let result = if self.relay_pid(channel_id).is_some() {
                self.stop_relay(channel_id).await.map(|_| ())
            } else {
                self.stop_channel_capture(channel_id).await.map(|_| ())
            };
            if let Err(e) = result {
                tracing::error!(channel_id = %channel_id, error = %e, "Failed to stop channel during shutdown");
            }
        });
        futures::future::join_all(stops).await;
    }
}
