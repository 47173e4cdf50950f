//! Agent assembly and lifecycle.
//!
//! [`Agent::connect`] authenticates against the store and wires every
//! component together, [`Agent::recover`] reconciles rows a previous run left
//! behind, [`Agent::start`] spawns the background services and
//! [`RunningAgent::shutdown`] tears them down in dependency order.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use srtcast_db::models::server::{Server, DEFAULT_BASE_PATH};
use srtcast_db::models::status::{ChannelStatus, RecordingStatus, ServerStatus};
use srtcast_db::Store;
use srtcast_events::{AgentEvent, EventBus, LogPersistence};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::collector::SystemCollector;
use crate::config::AgentConfig;
use crate::context::AgentContext;
use crate::dispatcher::{CommandHandler, Dispatcher, InFlight};
use crate::error::AgentError;
use crate::feed::CommandFeed;
use crate::locks::ChannelLocks;
use crate::prober::Prober;
use crate::reconciler::RelayEvent;
use crate::recorder::Recorder;
use crate::supervisor::{ExitNotice, Supervisor};
use crate::{heartbeat, watchdog};

/// Bound on every shutdown wait.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Event bus capacity.
const EVENT_BUS_CAPACITY: usize = 1024;

/// What [`Agent::recover`] found and fixed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub failed_commands: usize,
    pub closed_recordings: usize,
    pub failed_rewraps: usize,
    pub resumed_channels: usize,
    pub stopped_channels: usize,
}

/// A connected agent that has not started its services yet.
pub struct Agent {
    ctx: Arc<AgentContext>,
    supervisor: Arc<Supervisor>,
    exits: mpsc::UnboundedReceiver<ExitNotice>,
    recorder: Arc<Recorder>,
    locks: ChannelLocks,
    in_flight: InFlight,
    dispatcher: Arc<Dispatcher>,
    log_receiver: broadcast::Receiver<AgentEvent>,
}

impl Agent {
    /// Authenticate with the server token and build every component.
    pub async fn connect(config: AgentConfig, store: Arc<dyn Store>) -> Result<Self, AgentError> {
        let server = store
            .find_server_by_token(&config.server_token)
            .await?
            .ok_or(AgentError::Unauthorized)?;
        store
            .set_server_status(server.id, ServerStatus::Connecting)
            .await?;

        let base_path = resolve_base_path(&config, &server);
        tokio::fs::create_dir_all(&base_path).await?;

        let events = Arc::new(EventBus::new(EVENT_BUS_CAPACITY));
        let log_receiver = events.subscribe();
        let ctx = Arc::new(AgentContext {
            server_id: server.id,
            base_path,
            config,
            store,
            events,
        });

        let (supervisor, exits) = Supervisor::new(ctx.clone());
        let recorder = Arc::new(Recorder::new(ctx.clone(), supervisor.clone()));
        let prober = Arc::new(Prober::new(ctx.clone()));
        let locks = ChannelLocks::new();
        let in_flight = InFlight::default();
        let handler = Arc::new(CommandHandler::new(
            ctx.clone(),
            supervisor.clone(),
            recorder.clone(),
            prober,
            locks.clone(),
            in_flight.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(ctx.clone(), handler, in_flight.clone()));

        tracing::info!(
            server_id = %server.id,
            server_name = %server.name,
            base_path = %ctx.base_path.display(),
            "Agent authenticated",
        );

        Ok(Self {
            ctx,
            supervisor,
            exits,
            recorder,
            locks,
            in_flight,
            dispatcher,
            log_receiver,
        })
    }

    pub fn context(&self) -> &Arc<AgentContext> {
        &self.ctx
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    /// Reconcile rows left behind by a previous run of this server's agent.
    ///
    /// Commands still `processing` are failed, orphaned recordings are
    /// finalised and interrupted rewraps fail. Channels caught mid-stop
    /// become `stopped`; channels that were starting or running are
    /// relaunched when `RESUME_CHANNELS` is on and stopped otherwise.
    pub async fn recover(&self) -> Result<RecoveryReport, AgentError> {
        let ctx = &self.ctx;
        let mut report = RecoveryReport::default();

        report.failed_commands = ctx
            .store
            .fail_orphaned_commands(
                ctx.server_id,
                Utc::now(),
                &[],
                "Agent restarted while the command was processing",
            )
            .await?
            .len();

        for recording in ctx
            .store
            .list_recordings_by_status(ctx.server_id, RecordingStatus::Recording)
            .await?
        {
            self.supervisor.close_orphaned_recording(&recording).await?;
            report.closed_recordings += 1;
        }

        for recording in ctx
            .store
            .list_recordings_by_status(ctx.server_id, RecordingStatus::Processing)
            .await?
        {
            ctx.store
                .fail_rewrap(recording.id, "Agent restarted during rewrap")
                .await?;
            report.failed_rewraps += 1;
        }

        for channel in ctx.store.list_channels(ctx.server_id).await? {
            match channel.status {
                ChannelStatus::Stopping => {
                    self.supervisor
                        .reconciler()
                        .apply(channel.id, RelayEvent::Exited)
                        .await?;
                    report.stopped_channels += 1;
                }
                ChannelStatus::Starting | ChannelStatus::Running if ctx.config.resume_channels => {
                    match self.supervisor.start_relay(&channel).await {
                        Ok(_) => report.resumed_channels += 1,
                        Err(e) => {
                            ctx.error(
                                Some(channel.id),
                                format!("Failed to resume channel '{}': {e}", channel.name),
                            );
                        }
                    }
                }
                ChannelStatus::Starting | ChannelStatus::Running => {
                    self.supervisor
                        .reconciler()
                        .apply(channel.id, RelayEvent::Exited)
                        .await?;
                    report.stopped_channels += 1;
                }
                ChannelStatus::Stopped | ChannelStatus::Error => {}
            }
        }

        if report != RecoveryReport::default() {
            ctx.info(None, format!("Recovered from previous run: {report:?}"));
        }
        Ok(report)
    }

    /// Spawn the background services and start consuming `feed`.
    pub fn start<F>(self, feed: F) -> RunningAgent
    where
        F: CommandFeed + 'static,
    {
        let Self {
            ctx,
            supervisor,
            exits,
            recorder,
            locks,
            in_flight,
            dispatcher,
            log_receiver,
        } = self;

        let persistence_stop = CancellationToken::new();
        let persistence = tokio::spawn({
            let store = ctx.store.clone();
            let stop = persistence_stop.clone();
            async move {
                LogPersistence::run_until(store, log_receiver, async move { stop.cancelled().await })
                    .await
            }
        });

        let dispatch_cancel = CancellationToken::new();
        let dispatch_task = tokio::spawn({
            let dispatcher = dispatcher.clone();
            let cancel = dispatch_cancel.clone();
            async move { dispatcher.run(feed, cancel).await }
        });

        let background = CancellationToken::new();
        let collector = Arc::new(SystemCollector::new(ctx.base_path.clone()));
        let services = vec![
            tokio::spawn(monitor_exits(
                supervisor.clone(),
                locks.clone(),
                exits,
                background.clone(),
            )),
            tokio::spawn(heartbeat::run(ctx.clone(), collector, background.clone())),
            tokio::spawn(watchdog::run(ctx.clone(), in_flight, background.clone())),
        ];

        ctx.info(None, "Agent started");

        RunningAgent {
            ctx,
            supervisor,
            recorder,
            locks,
            dispatcher,
            dispatch_cancel,
            dispatch_task,
            background,
            services,
            persistence_stop,
            persistence,
        }
    }
}

/// Base path precedence: configuration, then the server row, then the
/// built-in default.
fn resolve_base_path(config: &AgentConfig, server: &Server) -> PathBuf {
    match &config.base_path {
        Some(path) => path.clone(),
        None if !server.base_path.trim().is_empty() => PathBuf::from(&server.base_path),
        None => PathBuf::from(DEFAULT_BASE_PATH),
    }
}

/// Route relay exit notices to the supervisor under the channel lock.
async fn monitor_exits(
    supervisor: Arc<Supervisor>,
    locks: ChannelLocks,
    mut exits: mpsc::UnboundedReceiver<ExitNotice>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            notice = exits.recv() => {
                let Some(notice) = notice else { break };
                let channel_id = notice.channel_id;
                let _guard = locks.lock(channel_id).await;
                if let Err(e) = supervisor.handle_exit(notice).await {
                    tracing::error!(channel_id = %channel_id, error = %e, "Failed to handle relay exit");
                }
            }
        }
    }
    tracing::info!("Relay exit monitor stopped");
}

// ---------------------------------------------------------------------------
// RunningAgent
// ---------------------------------------------------------------------------

/// Handle to an agent whose services are running.
pub struct RunningAgent {
    ctx: Arc<AgentContext>,
    supervisor: Arc<Supervisor>,
    recorder: Arc<Recorder>,
    locks: ChannelLocks,
    dispatcher: Arc<Dispatcher>,
    dispatch_cancel: CancellationToken,
    dispatch_task: JoinHandle<()>,
    background: CancellationToken,
    services: Vec<JoinHandle<()>>,
    persistence_stop: CancellationToken,
    persistence: JoinHandle<()>,
}

impl RunningAgent {
    pub fn context(&self) -> &Arc<AgentContext> {
        &self.ctx
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    /// Stop accepting commands, stop every process this agent owns, mark
    /// the server offline and flush the log.
    pub async fn shutdown(self) {
        tracing::info!("Agent shutting down");

        self.dispatch_cancel.cancel();
        let _ = tokio::time::timeout(SHUTDOWN_TIMEOUT, self.dispatch_task).await;
        self.dispatcher.drain(SHUTDOWN_TIMEOUT).await;
        tracing::info!("Command dispatcher stopped");

        self.recorder.drain(SHUTDOWN_TIMEOUT).await;

        // Exits caused by the stops below are requested, so the monitor can
        // go first.
        self.background.cancel();
        for handle in self.services {
            let _ = tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await;
        }
        tracing::info!("Background services stopped");

        self.supervisor.shutdown(&self.locks).await;
        tracing::info!("All relays and captures stopped");

        if let Err(e) = self
            .ctx
            .store
            .set_server_status(self.ctx.server_id, ServerStatus::Offline)
            .await
        {
            tracing::error!(error = %e, "Failed to mark server offline");
        }

        self.ctx.info(None, "Agent stopped");
        self.persistence_stop.cancel();
        let _ = tokio::time::timeout(SHUTDOWN_TIMEOUT, self.persistence).await;
        tracing::info!("Graceful shutdown complete");
    }
}
