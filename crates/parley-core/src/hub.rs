//! Connection hub: one bounded outbound queue per live connection.
//!
//! Delivery is at-most-once and never blocks. A connection whose queue is
//! full or closed loses that event; other recipients are unaffected.

use dashmap::DashMap;
use parley_protocol::{ServerEvent, UserId};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Default outbound queue capacity per connection.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique identifier for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Create a new connection ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a unique connection ID.
    #[must_use]
    pub fn generate() -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let counter = CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn_{:x}_{:x}", timestamp, counter))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Receiving half of a connection's outbound queue.
pub type EventReceiver = mpsc::Receiver<Arc<ServerEvent>>;

struct Slot {
    user_id: UserId,
    sender: mpsc::Sender<Arc<ServerEvent>>,
}

/// Registry of live connections and their outbound queues.
pub struct Hub {
    connections: DashMap<ConnectionId, Slot>,
    capacity: usize,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl Hub {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            connections: DashMap::new(),
            capacity: capacity.max(1),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Register a connection and hand back its queue.
    pub fn register(&self, connection_id: ConnectionId, user_id: UserId) -> EventReceiver {
        let (sender, receiver) = mpsc::channel(self.capacity);
        debug!(connection = %connection_id, user = %user_id, "Connection registered");
        self.connections
            .insert(connection_id, Slot { user_id, sender });
        receiver
    }

    /// Drop a connection's queue. Undelivered events are discarded.
    pub fn unregister(&self, connection_id: &ConnectionId) -> Option<UserId> {
        let removed = self.connections.remove(connection_id).map(|(_, slot)| slot.user_id);
        if removed.is_some() {
            debug!(connection = %connection_id, "Connection unregistered");
        }
        removed
    }

    /// The user bound to a connection.
    #[must_use]
    pub fn user_of(&self, connection_id: &ConnectionId) -> Option<UserId> {
        self.connections.get(connection_id).map(|slot| slot.user_id)
    }

    #[must_use]
    pub fn is_registered(&self, connection_id: &ConnectionId) -> bool {
        self.connections.contains_key(connection_id)
    }

    /// Enqueue an event for one connection.
    ///
    /// Returns `true` if the event was queued.
    pub fn deliver(&self, connection_id: &ConnectionId, event: Arc<ServerEvent>) -> bool {
        let Some(slot) = self.connections.get(connection_id) else {
            trace!(connection = %connection_id, "Deliver to unknown connection");
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        };

        match slot.sender.try_send(event) {
            Ok(()) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(
                    connection = %connection_id,
                    event = event.name(),
                    "Outbound queue full, dropping event"
                );
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                debug!(
                    connection = %connection_id,
                    event = event.name(),
                    "Connection closing, dropping event"
                );
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Enqueue one event for many connections.
    ///
    /// Returns the number of connections that accepted it.
    pub fn fan_out<'a>(
        &self,
        targets: impl IntoIterator<Item = &'a ConnectionId>,
        event: Arc<ServerEvent>,
    ) -> usize {
        targets
            .into_iter()
            .filter(|conn| self.deliver(conn, Arc::clone(&event)))
            .count()
    }

    /// Get hub statistics.
    #[must_use]
    pub fn stats(&self) -> HubStats {
        HubStats {
            connection_count: self.connections.len(),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

/// Hub statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubStats {
    /// Number of registered connections.
    pub connection_count: usize,
    /// Events queued since start.
    pub delivered: u64,
    /// Events dropped because a queue was full, closed or gone.
    pub dropped: u64,
}
