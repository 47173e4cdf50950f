//! `srtcast-agent` -- per-server SRT relay agent.
//!
//! Authenticates with its server token, supervises one relay process per
//! active channel and one capture process per active recording, and
//! executes the commands operators queue in the shared database.
//!
//! # Environment variables
//!
//! | Variable                     | Required | Default             | Description                              |
//! |------------------------------|----------|---------------------|------------------------------------------|
//! | `DATABASE_URL`               | yes      | --                  | PostgreSQL connection string             |
//! | `SERVER_TOKEN`               | yes      | --                  | Token identifying this server            |
//! | `BASE_PATH`                  | no       | server row          | Root directory for channel folders       |
//! | `RELAY_BIN`                  | no       | `srt-live-transmit` | Relay tool (may include leading args)    |
//! | `CAPTURE_BIN`                | no       | `srt-live-transmit` | Capture tool                             |
//! | `PROBE_BIN`                  | no       | `ffprobe`           | Stream probe tool                        |
//! | `REMUX_BIN`                  | no       | `ffmpeg`            | TS to MP4 rewrap tool                    |
//! | `HEARTBEAT_INTERVAL_SECS`    | no       | `5`                 | Seconds between heartbeats               |
//! | `COMMAND_POLL_INTERVAL_SECS` | no       | `2`                 | Seconds between command polls            |
//! | `MAX_AUTO_RESTARTS`          | no       | `1`                 | Restarts after a clean unexpected exit   |
//! | `RESUME_CHANNELS`            | no       | `true`              | Relaunch running channels after a crash  |
//!
//! See [`AgentConfig::from_env`](srtcast_agent::AgentConfig::from_env) for
//! the complete list of timing knobs.

use std::sync::Arc;

use anyhow::Context as _;
use srtcast_agent::feed::{self, PollFeed};
use srtcast_agent::{Agent, AgentConfig};
use srtcast_db::PgStore;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "srtcast_agent=info,srtcast_events=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AgentConfig::from_env().context("Invalid agent configuration")?;

    let pool = srtcast_db::create_pool(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    tracing::info!("Database connection established");

    srtcast_db::run_migrations(&pool)
        .await
        .context("Failed to run database migrations")?;
    tracing::info!("Database migrations applied");

    let poll_interval = config.command_poll_interval;
    let store = Arc::new(PgStore::new(pool.clone()));
    let agent = Agent::connect(config, store.clone())
        .await
        .context("Agent authentication failed")?;
    let server_id = agent.context().server_id;

    let report = agent.recover().await.context("Startup recovery failed")?;
    tracing::info!(?report, "Startup recovery complete");

    let feed = PollFeed::new(store, server_id, poll_interval);
    let listener_cancel = CancellationToken::new();
    let listener = tokio::spawn(feed::listen_for_commands(
        pool,
        server_id,
        feed.waker(),
        listener_cancel.clone(),
    ));

    let running = agent.start(feed);
    tracing::info!(server_id = %server_id, "srtcast-agent running");

    shutdown_signal().await;

    listener_cancel.cancel();
    let _ = tokio::time::timeout(std::time::Duration::from_secs(5), listener).await;
    running.shutdown().await;
    Ok(())
}

/// Wait for SIGINT (Ctrl-C) or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
