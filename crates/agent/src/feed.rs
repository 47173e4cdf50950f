//! Command delivery.
//!
//! The dispatcher consumes a [`CommandFeed`] and does not care whether
//! commands are pulled on an interval or pushed: [`PollFeed`] reads pending
//! rows from the store (woken early by PostgreSQL notifications when
//! [`listen_for_commands`] runs), [`QueueFeed`] is an in-memory queue.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use srtcast_core::types::EntityId;
use srtcast_db::models::command::Command;
use srtcast_db::Store;
use tokio::sync::{mpsc, Notify};
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// PostgreSQL channel the command insert trigger notifies on.
pub const COMMAND_NOTIFY_CHANNEL: &str = "srtcast_commands";

/// Maximum pending commands fetched per poll.
pub const POLL_BATCH_SIZE: i64 = 100;

#[async_trait]
pub trait CommandFeed: Send {
    /// Pending commands in creation order. `None` once the feed is closed.
    async fn next_batch(&mut self) -> Option<Vec<Command>>;
}

// ---------------------------------------------------------------------------
// PollFeed
// ---------------------------------------------------------------------------

pub struct PollFeed {
    store: Arc<dyn Store>,
    server_id: EntityId,
    ticker: Interval,
    wake: Arc<Notify>,
}

impl PollFeed {
    pub fn new(store: Arc<dyn Store>, server_id: EntityId, every: Duration) -> Self {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            store,
            server_id,
            ticker,
            wake: Arc::new(Notify::new()),
        }
    }

    /// Handle that makes the next poll happen immediately.
    pub fn waker(&self) -> Arc<Notify> {
        self.wake.clone()
    }
}

#[async_trait]
impl CommandFeed for PollFeed {
    async fn next_batch(&mut self) -> Option<Vec<Command>> {
        tokio::select! {
            _ = self.ticker.tick() => {}
            _ = self.wake.notified() => {}
        }
        match self
            .store
            .list_pending_commands(self.server_id, POLL_BATCH_SIZE)
            .await
        {
            Ok(commands) => Some(commands),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to poll pending commands");
                Some(Vec::new())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// QueueFeed
// ---------------------------------------------------------------------------

/// In-memory feed. Commands are delivered in the order they are sent.
pub struct QueueFeed {
    rx: mpsc::UnboundedReceiver<Command>,
}

impl QueueFeed {
    pub fn channel() -> (mpsc::UnboundedSender<Command>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx })
    }
}

#[async_trait]
impl CommandFeed for QueueFeed {
    async fn next_batch(&mut self) -> Option<Vec<Command>> {
        let first = self.rx.recv().await?;
        let mut batch = vec![first];
        while let Ok(next) = self.rx.try_recv() {
            batch.push(next);
        }
        Some(batch)
    }
}

// ---------------------------------------------------------------------------
// PostgreSQL notifications
// ---------------------------------------------------------------------------

/// Backoff between listener reconnection attempts.
pub struct ReconnectConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

/// Calculate the next backoff delay, clamped to `max_delay`.
pub fn next_delay(current: Duration, config: &ReconnectConfig) -> Duration {
    let next_ms = (current.as_millis() as f64 * config.multiplier) as u64;
    Duration::from_millis(next_ms).min(config.max_delay)
}

/// Wake `wake` whenever a command is inserted for `server_id`.
///
/// Reconnects with exponential backoff until `cancel` fires. Polling keeps
/// working while the listener is down.
pub async fn listen_for_commands(
    pool: PgPool,
    server_id: EntityId,
    wake: Arc<Notify>,
    cancel: CancellationToken,
) {
    let config = ReconnectConfig::default();
    let mut delay = config.initial_delay;
    let server = server_id.to_string();

    loop {
        match subscribe(&pool).await {
            Ok(mut listener) => {
                tracing::info!(channel = COMMAND_NOTIFY_CHANNEL, "Listening for command notifications");
                delay = config.initial_delay;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        notification = listener.recv() => match notification {
                            Ok(n) if n.payload() == server => wake.notify_one(),
                            Ok(_) => {}
                            Err(e) => {
                                tracing::warn!(error = %e, "Command listener connection lost");
                                break;
                            }
                        },
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, delay_ms = delay.as_millis() as u64, "Failed to start command listener");
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
        delay = next_delay(delay, &config);
    }
}

async fn subscribe(pool: &PgPool) -> Result<PgListener, sqlx::Error> {
    let mut listener = PgListener::connect_with(pool).await?;
    listener.listen(COMMAND_NOTIFY_CHANNEL).await?;
    Ok(listener)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_cap() {
        let config = ReconnectConfig::default();
        let mut delay = config.initial_delay;
        for _ in 0..10 {
            delay = next_delay(delay, &config);
        }
        assert_eq!(delay, config.max_delay);
        assert_eq!(
            next_delay(Duration::from_secs(1), &config),
            Duration::from_secs(2)
        );
    }

    #[tokio::test]
    async fn queue_feed_batches_in_order() {
        let (tx, mut feed) = QueueFeed::channel();
        let make = |kind: &str| Command {
            id: uuid::Uuid::now_v7(),
            server_id: uuid::Uuid::nil(),
            channel_id: None,
            command_type: kind.to_string(),
            payload: serde_json::json!({}),
            status: srtcast_db::models::status::CommandStatus::Pending,
            result: None,
            error_message: None,
            created_at: chrono::Utc::now(),
            claimed_at: None,
            processed_at: None,
        };
        tx.send(make("start_channel")).unwrap();
        tx.send(make("stop_channel")).unwrap();

        let batch = feed.next_batch().await.unwrap();
        let kinds: Vec<_> = batch.iter().map(|c| c.command_type.as_str()).collect();
        assert_eq!(kinds, vec!["start_channel", "stop_channel"]);

        drop(tx);
        assert!(feed.next_batch().await.is_none());
    }
}
