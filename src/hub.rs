//! Values hub: one shared integer with broadcast on change.
//!
//! The value lives in memory only and starts at zero on every restart.

use std::sync::RwLock;

use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

/// Default number of unread updates a slow subscriber may fall behind by.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// A published value and the connection that published it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubUpdate {
    pub sender: Uuid,
    pub value: i64,
}

/// Shared hub state. Reads and writes are synchronized; clone the `Arc` to share.
pub struct ValuesHub {
    value: RwLock<i64>,
    updates: broadcast::Sender<HubUpdate>,
}

impl ValuesHub {
    pub fn new(capacity: usize) -> Self {
        let (updates, _) = broadcast::channel(capacity.max(1));
        Self {
            value: RwLock::new(0),
            updates,
        }
    }

    /// Current value.
    pub fn get(&self) -> i64 {
        *self.value.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Store `value` and send it to every subscriber except `sender`.
    ///
    /// Returns how many subscriptions the update was queued for.
    pub fn publish(&self, sender: Uuid, value: i64) -> usize {
        *self.value.write().unwrap_or_else(|e| e.into_inner()) = value;
        // No subscribers is not an error
        let receivers = self.updates.send(HubUpdate { sender, value }).unwrap_or(0);
        debug!(%sender, value, receivers, "Hub value published");
        receivers
    }

    /// Subscribe a connection to updates from other connections.
    pub fn subscribe(&self, connection_id: Uuid) -> HubSubscription {
        HubSubscription {
            connection_id,
            receiver: self.updates.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.updates.receiver_count()
    }
}

impl Default for ValuesHub {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

/// A connection's view of hub updates.
pub struct HubSubscription {
    connection_id: Uuid,
    receiver: broadcast::Receiver<HubUpdate>,
}

impl HubSubscription {
    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    /// Next value published by another connection, or `None` once the hub is gone.
    pub async fn recv(&mut self) -> Option<i64> {
        loop {
            match self.receiver.recv().await {
                Ok(update) if update.sender == self.connection_id => continue,
                Ok(update) => return Some(update.value),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(connection = %self.connection_id, skipped, "Hub subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
