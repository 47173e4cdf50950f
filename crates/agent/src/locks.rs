//! Per-channel mutual exclusion.
//!
//! Command handlers, the exit monitor and shutdown all take the channel's
//! lock before touching its relay, so a start and a stop for the same
//! channel can never interleave.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use srtcast_core::types::EntityId;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Clone, Default)]
pub struct ChannelLocks {
    inner: Arc<Mutex<HashMap<EntityId, Arc<AsyncMutex<()>>>>>,
}

impl ChannelLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `channel_id`.
    pub async fn lock(&self, channel_id: EntityId) -> OwnedMutexGuard<()> {
        let slot = {
            let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            // Drop slots nobody holds or waits on.
            map.retain(|_, m| Arc::strong_count(m) > 1);
            map.entry(channel_id).or_default().clone()
        };
        slot.lock_owned().await
    }
}
