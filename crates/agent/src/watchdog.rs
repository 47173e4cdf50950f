//! Orphaned-command and stale-server detection.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::context::AgentContext;
use crate::dispatcher::InFlight;

/// Upper bound on the pause between sweeps.
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Pause between sweeps: a quarter of the shorter threshold, capped.
pub fn sweep_interval(command_watchdog: Duration, stale_server_after: Duration) -> Duration {
    (command_watchdog.min(stale_server_after) / 4)
        .clamp(Duration::from_millis(100), MAX_SWEEP_INTERVAL)
}

/// Run the watchdog until `cancel` is triggered.
pub async fn run(ctx: Arc<AgentContext>, in_flight: InFlight, cancel: CancellationToken) {
    let every = sweep_interval(ctx.config.command_watchdog, ctx.config.stale_server_after);
    tracing::info!(interval_ms = every.as_millis() as u64, "Watchdog started");
    let mut interval = tokio::time::interval(every);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Watchdog stopping");
                break;
            }
            _ = interval.tick() => sweep(&ctx, &in_flight).await,
        }
    }
}

/// One pass: fail orphaned commands and mark silent servers offline.
pub async fn sweep(ctx: &AgentContext, in_flight: &InFlight) {
    let watchdog = ctx.config.command_watchdog;
    let claimed_before = Utc::now() - chrono::Duration::from_std(watchdog).unwrap_or_default();
    let message = format!(
        "Command orphaned: still processing after {}s without a handler",
        watchdog.as_secs()
    );
    match ctx
        .store
        .fail_orphaned_commands(ctx.server_id, claimed_before, &in_flight.snapshot(), &message)
        .await
    {
        Ok(ids) if !ids.is_empty() => {
            ctx.warn(None, format!("Failed {} orphaned command(s)", ids.len()));
        }
        Ok(_) => {}
        Err(e) => tracing::error!(error = %e, "Orphaned command sweep failed"),
    }

    let stale_after = chrono::Duration::from_std(ctx.config.stale_server_after).unwrap_or_default();
    match ctx.store.mark_stale_servers(Utc::now() - stale_after).await {
        Ok(ids) => {
            for id in ids.into_iter().filter(|id| *id != ctx.server_id) {
                tracing::info!(server_id = %id, "Server marked offline, heartbeat is stale");
            }
        }
        Err(e) => tracing::error!(error = %e, "Stale server sweep failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweep_interval_is_bounded() {
        assert_eq!(
            sweep_interval(Duration::from_secs(300), Duration::from_secs(30)),
            Duration::from_millis(7500)
        );
        assert_eq!(
            sweep_interval(Duration::from_secs(3600), Duration::from_secs(3600)),
            MAX_SWEEP_INTERVAL
        );
        assert_eq!(
            sweep_interval(Duration::from_millis(10), Duration::from_secs(30)),
            Duration::from_millis(100)
        );
    }
}
