//! Periodic server heartbeat.

use std::sync::Arc;

use srtcast_db::models::server::ServerHeartbeat;
use tokio_util::sync::CancellationToken;

use crate::collector::SystemCollector;
use crate::context::AgentContext;

/// Write `status=online`, `last_seen_at` and resource gauges on every tick
/// until `cancel` is triggered.
pub async fn run(ctx: Arc<AgentContext>, collector: Arc<SystemCollector>, cancel: CancellationToken) {
    tracing::info!(
        interval_secs = ctx.config.heartbeat_interval.as_secs(),
        "Heartbeat started"
    );
    let mut interval = tokio::time::interval(ctx.config.heartbeat_interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Heartbeat stopping");
                break;
            }
            _ = interval.tick() => beat(&ctx, &collector).await,
        }
    }
}

/// Collect gauges and write one heartbeat.
pub async fn beat(ctx: &AgentContext, collector: &Arc<SystemCollector>) {
    let collector = collector.clone();
    let stats = match tokio::task::spawn_blocking(move || collector.collect()).await {
        Ok(stats) => stats,
        Err(e) => {
            tracing::warn!(error = %e, "System stats collection failed");
            ServerHeartbeat::default()
        }
    };

    match ctx.store.record_heartbeat(ctx.server_id, &stats).await {
        Ok(Some(_)) => tracing::debug!(cpu = ?stats.cpu_usage, memory = ?stats.memory_usage, "Heartbeat written"),
        Ok(None) => tracing::warn!(server_id = %ctx.server_id, "Server row disappeared, heartbeat dropped"),
        Err(e) => tracing::error!(error = %e, "Failed to write heartbeat"),
    }
}
