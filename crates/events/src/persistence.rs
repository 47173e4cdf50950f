//! Durable log persistence service.
//!
//! [`LogPersistence`] subscribes to the [`EventBus`](crate::bus::EventBus)
//! and appends every received [`AgentEvent`] to `server_logs`. It runs as a
//! long-lived background task and exits when the bus is dropped.

use std::future::Future;
use std::sync::Arc;

use srtcast_db::models::server_log::{CreateServerLog, ServerLog};
use srtcast_db::{Store, StoreError};
use tokio::sync::broadcast;

use crate::bus::AgentEvent;

pub struct LogPersistence;

impl LogPersistence {
    /// Run the persistence loop until the bus closes.
    pub async fn run(store: Arc<dyn Store>, receiver: broadcast::Receiver<AgentEvent>) {
        Self::run_until(store, receiver, std::future::pending()).await
    }

    /// Run until the bus closes or `shutdown` resolves. Events already
    /// buffered when `shutdown` resolves are still written.
    pub async fn run_until<F>(
        store: Arc<dyn Store>,
        mut receiver: broadcast::Receiver<AgentEvent>,
        shutdown: F,
    ) where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                biased;
                received = receiver.recv() => match received {
                    Ok(event) => Self::write(store.as_ref(), &event).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "Log persistence lagged, some entries were dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::info!("Event bus closed, log persistence shutting down");
                        return;
                    }
                },
                _ = &mut shutdown => break,
            }
        }

        let mut flushed = 0usize;
        while let Ok(event) = receiver.try_recv() {
            Self::write(store.as_ref(), &event).await;
            flushed += 1;
        }
        tracing::info!(flushed, "Log persistence stopped");
    }

    async fn write(store: &dyn Store, event: &AgentEvent) {
        if let Err(e) = Self::persist(store, event).await {
            tracing::error!(
                error = %e,
                message = %event.message,
                "Failed to persist server log"
            );
        }
    }

    async fn persist(store: &dyn Store, event: &AgentEvent) -> Result<ServerLog, StoreError> {
        store
            .insert_log(&CreateServerLog {
                server_id: event.server_id,
                channel_id: event.channel_id,
                level: event.level,
                message: event.message.clone(),
                details: event.details.clone(),
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use srtcast_db::models::server::CreateServer;
    use srtcast_db::models::server_log::LogListQuery;
    use srtcast_db::models::status::LogLevel;
    use srtcast_db::MemoryStore;

    #[tokio::test]
    async fn events_are_written_until_bus_closes() {
        let store = Arc::new(MemoryStore::new());
        let server = store
            .create_server(&CreateServer {
                name: "edge".into(),
                token: "tok_persistence_test".into(),
                base_path: None,
            })
            .await
            .unwrap();

        let bus = EventBus::default();
        let task = tokio::spawn(LogPersistence::run(store.clone(), bus.subscribe()));

        bus.publish(AgentEvent::info(server.id, "Channel started"));
        bus.publish(AgentEvent::error(server.id, "Relay crashed"));
        drop(bus);
        task.await.unwrap();

        let logs = store
            .list_logs(server.id, &LogListQuery::default())
            .await
            .unwrap();
        assert_eq!(logs.len(), 2);
        // Newest first.
        assert_eq!(logs[0].level, LogLevel::Error);
        assert_eq!(logs[1].message, "Channel started");
    }

    #[tokio::test]
    async fn buffered_events_are_flushed_on_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let server = store
            .create_server(&CreateServer {
                name: "edge".into(),
                token: "tok_persistence_flush".into(),
                base_path: None,
            })
            .await
            .unwrap();

        let bus = EventBus::default();
        let receiver = bus.subscribe();
        bus.publish(AgentEvent::warn(server.id, "Relay restarting"));
        bus.publish(AgentEvent::info(server.id, "Channel stopped"));

        // Bus stays open; shutdown is already resolved.
        LogPersistence::run_until(store.clone(), receiver, async {}).await;

        let logs = store
            .list_logs(server.id, &LogListQuery::default())
            .await
            .unwrap();
        assert_eq!(logs.len(), 2);
    }
}
