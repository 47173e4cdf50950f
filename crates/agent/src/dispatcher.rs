//! Command dispatcher.
//!
//! Claims pending commands in creation order and routes each one to a
//! per-channel lane, so commands for one channel run strictly one after
//! another while different channels proceed in parallel. Probes skip the
//! lanes; the prober serialises them itself.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use srtcast_core::command::{CommandRequest, CommandType};
use srtcast_core::types::EntityId;
use srtcast_db::models::channel::Channel;
use srtcast_db::models::command::Command;
use srtcast_events::AgentEvent;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::context::AgentContext;
use crate::error::AgentError;
use crate::feed::CommandFeed;
use crate::locks::ChannelLocks;
use crate::prober::Prober;
use crate::recorder::Recorder;
use crate::supervisor::Supervisor;

// ---------------------------------------------------------------------------
// In-flight bookkeeping
// ---------------------------------------------------------------------------

/// Commands claimed by this agent that have not been resolved yet.
#[derive(Clone, Default)]
pub struct InFlight {
    inner: Arc<Mutex<HashSet<EntityId>>>,
}

impl InFlight {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<EntityId>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, id: EntityId) {
        self.lock().insert(id);
    }

    pub fn remove(&self, id: EntityId) {
        self.lock().remove(&id);
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.lock().contains(&id)
    }

    pub fn snapshot(&self) -> Vec<EntityId> {
        self.lock().iter().copied().collect()
    }
}

// ---------------------------------------------------------------------------
// CommandHandler
// ---------------------------------------------------------------------------

/// Executes one claimed command and writes its outcome.
pub struct CommandHandler {
    ctx: Arc<AgentContext>,
    supervisor: Arc<Supervisor>,
    recorder: Arc<Recorder>,
    prober: Arc<Prober>,
    locks: ChannelLocks,
    in_flight: InFlight,
}

impl CommandHandler {
    pub fn new(
        ctx: Arc<AgentContext>,
        supervisor: Arc<Supervisor>,
        recorder: Arc<Recorder>,
        prober: Arc<Prober>,
        locks: ChannelLocks,
        in_flight: InFlight,
    ) -> Self {
        Self {
            ctx,
            supervisor,
            recorder,
            prober,
            locks,
            in_flight,
        }
    }

    /// Run a claimed command to completion. Never leaves it `processing`
    /// unless the store itself is unreachable.
    pub async fn handle(&self, command: Command) {
        let started = Instant::now();
        let request = match CommandRequest::parse(&command.command_type, &command.payload) {
            Ok(request) => request,
            Err(e) => {
                self.on_failure(&command, AgentError::from(e)).await;
                self.in_flight.remove(command.id);
                return;
            }
        };

        let _guard = match self.lock_target(&command, &request).await {
            Some(channel_id) => Some(self.locks.lock(channel_id).await),
            None => None,
        };
        let outcome = self.execute(&command, &request).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(result) => {
                if let Err(e) = self.ctx.store.complete_command(command.id, &result).await {
                    tracing::error!(command_id = %command.id, error = %e, "Failed to complete command");
                }
                tracing::info!(
                    command_id = %command.id,
                    command_type = %command.command_type,
                    elapsed_ms,
                    "Command completed",
                );
            }
            Err(e) => self.on_failure(&command, e).await,
        }
        self.in_flight.remove(command.id);
    }

    async fn on_failure(&self, command: &Command, error: AgentError) {
        let message = error.to_string();
        // Recording and probe failures are reported on their own rows.
        let drives_relay = matches!(
            command.command_type.parse::<CommandType>(),
            Ok(CommandType::StartChannel | CommandType::StopChannel)
        );

        if let Some(channel_id) = command.channel_id.filter(|_| drives_relay) {
            if !error.leaves_channel_untouched() {
                if let Err(e) = self.supervisor.fail_channel(channel_id, message.clone()).await {
                    tracing::error!(channel_id = %channel_id, error = %e, "Failed to move channel to error");
                }
            }
        }

        if let Err(e) = self.ctx.store.fail_command(command.id, &message).await {
            tracing::error!(command_id = %command.id, error = %e, "Failed to mark command failed");
        }

        let mut event = AgentEvent::error(
            self.ctx.server_id,
            format!("Command {} failed: {message}", command.command_type),
        )
        .with_details(json!({ "command_id": command.id }));
        if let Some(channel_id) = command.channel_id {
            event = event.with_channel(channel_id);
        }
        self.ctx.emit(event);
    }

    /// Channel whose lock the command must hold.
    async fn lock_target(&self, command: &Command, request: &CommandRequest) -> Option<EntityId> {
        match request {
            CommandRequest::ProbeStream => None,
            CommandRequest::StopRecording { recording_id }
            | CommandRequest::RewrapRecording { recording_id, .. } => match command.channel_id {
                Some(id) => Some(id),
                None => self
                    .ctx
                    .store
                    .get_recording(*recording_id)
                    .await
                    .ok()
                    .flatten()
                    .map(|r| r.channel_id),
            },
            _ => command.channel_id,
        }
    }

    async fn execute(&self, command: &Command, request: &CommandRequest) -> Result<Value, AgentError> {
        match request {
            CommandRequest::StartChannel => {
                let channel = self.channel_of(command, request).await?;
                let channel = self.supervisor.start_relay(&channel).await?;
                Ok(json!({
                    "channel_id": channel.id,
                    "status": channel.status,
                    "pid": channel.pid,
                }))
            }
            CommandRequest::StopChannel => {
                let channel = self.channel_of(command, request).await?;
                let channel = self.supervisor.stop_relay(channel.id).await?;
                Ok(json!({
                    "channel_id": channel.id,
                    "status": channel.status,
                }))
            }
            CommandRequest::StartRecording { filename } => {
                let channel = self.channel_of(command, request).await?;
                let recording = self.recorder.start_recording(channel.id, filename).await?;
                Ok(json!({
                    "recording_id": recording.id,
                    "filename": recording.filename,
                    "filepath": recording.filepath,
                }))
            }
            CommandRequest::StopRecording { recording_id } => {
                let recording = self.recorder.stop_recording(*recording_id).await?;
                Ok(json!({
                    "recording_id": recording.id,
                    "status": recording.status,
                    "file_size_bytes": recording.file_size_bytes,
                    "duration_seconds": recording.duration_seconds,
                }))
            }
            CommandRequest::RewrapRecording {
                recording_id,
                output_filename,
            } => {
                let recording = self.recorder.rewrap(*recording_id, output_filename).await?;
                Ok(json!({
                    "recording_id": recording.id,
                    "status": recording.status,
                }))
            }
            CommandRequest::ProbeStream => {
                let channel = self.channel_of(command, request).await?;
                let info = self.prober.probe(&channel).await?;
                serde_json::to_value(info)
                    .map_err(|e| AgentError::ProbeFailed(format!("unserialisable probe result: {e}")))
            }
        }
    }

    /// The command's channel, which must belong to this server.
    async fn channel_of(&self, command: &Command, request: &CommandRequest) -> Result<Channel, AgentError> {
        let channel_id = command.channel_id.ok_or_else(|| {
            AgentError::InvalidPayload(format!("{} requires a channel_id", request.command_type()))
        })?;
        match self.ctx.store.get_channel(channel_id).await? {
            Some(channel) if channel.server_id == self.ctx.server_id => Ok(channel),
            _ => Err(AgentError::NotFound {
                entity: "Channel",
                id: channel_id,
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

type LaneKey = Option<EntityId>;
type Lanes = Arc<Mutex<HashMap<LaneKey, mpsc::UnboundedSender<Command>>>>;

pub struct Dispatcher {
    ctx: Arc<AgentContext>,
    handler: Arc<CommandHandler>,
    in_flight: InFlight,
    lanes: Lanes,
    tasks: TaskTracker,
}

impl Dispatcher {
    pub fn new(ctx: Arc<AgentContext>, handler: Arc<CommandHandler>, in_flight: InFlight) -> Self {
        Self {
            ctx,
            handler,
            in_flight,
            lanes: Arc::new(Mutex::new(HashMap::new())),
            tasks: TaskTracker::new(),
        }
    }

    /// Consume `feed` until it closes or `cancel` fires.
    pub async fn run<F: CommandFeed>(&self, mut feed: F, cancel: CancellationToken) {
        tracing::info!(server_id = %self.ctx.server_id, "Command dispatcher started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                batch = feed.next_batch() => match batch {
                    Some(commands) => {
                        for command in commands {
                            self.dispatch(command).await;
                        }
                    }
                    None => {
                        tracing::info!("Command feed closed");
                        break;
                    }
                },
            }
        }
        tracing::info!("Command dispatcher stopped accepting commands");
    }

    /// Claim a pending command and hand it to its lane.
    pub async fn dispatch(&self, command: Command) {
        if command.server_id != self.ctx.server_id || self.in_flight.contains(command.id) {
            return;
        }
        let claimed = match self.ctx.store.claim_command(command.id).await {
            Ok(Some(claimed)) => claimed,
            Ok(None) => {
                tracing::debug!(command_id = %command.id, "Command already claimed, skipping");
                return;
            }
            Err(e) => {
                tracing::warn!(command_id = %command.id, error = %e, "Failed to claim command");
                return;
            }
        };

        tracing::info!(
            command_id = %claimed.id,
            command_type = %claimed.command_type,
            channel_id = ?claimed.channel_id,
            "Command claimed",
        );
        self.in_flight.insert(claimed.id);

        if claimed.command_type == CommandType::ProbeStream.as_str() {
            let handler = self.handler.clone();
            self.tasks.spawn(async move { handler.handle(claimed).await });
        } else {
            self.route(claimed);
        }
    }

    fn route(&self, command: Command) {
        let key = command.channel_id;
        let mut lanes = self.lanes.lock().unwrap_or_else(PoisonError::into_inner);
        let command = match lanes.get(&key) {
            Some(tx) => match tx.send(command) {
                Ok(()) => return,
                Err(mpsc::error::SendError(command)) => command,
            },
            None => command,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        // The receiver is alive, so this cannot fail.
        let _ = tx.send(command);
        lanes.insert(key, tx);
        self.tasks
            .spawn(run_lane(key, rx, self.lanes.clone(), self.handler.clone()));
    }

    /// Number of lanes with queued or running work.
    pub fn active_lanes(&self) -> usize {
        self.lanes.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Wait up to `timeout` for handlers that are still running.
    pub async fn drain(&self, timeout: Duration) {
        self.tasks.close();
        if tokio::time::timeout(timeout, self.tasks.wait()).await.is_err() {
            tracing::warn!(
                in_flight = self.in_flight.snapshot().len(),
                "Command handlers still running at shutdown"
            );
        }
    }
}

/// Execute a lane's commands one by one. The lane removes itself once it
/// runs dry.
async fn run_lane(
    key: LaneKey,
    mut rx: mpsc::UnboundedReceiver<Command>,
    lanes: Lanes,
    handler: Arc<CommandHandler>,
) {
    let mut next = rx.recv().await;
    while let Some(command) = next {
        handler.handle(command).await;
        next = {
            let mut lanes = lanes.lock().unwrap_or_else(PoisonError::into_inner);
            match rx.try_recv() {
                Ok(command) => Some(command),
                Err(_) => {
                    lanes.remove(&key);
                    None
                }
            }
        };
    }
}
