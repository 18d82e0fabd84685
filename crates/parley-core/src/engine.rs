//! Engine composition and periodic maintenance.

use parley_protocol::RoomId;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::clock::{Clock, SystemClock};
use crate::direct::{DirectChannel, MessageLimits};
use crate::hub::{Hub, DEFAULT_QUEUE_CAPACITY};
use crate::identity::{ConversationAudience, IdentityResolver, PassthroughResolver, PresenceAudience};
use crate::presence::PresenceRegistry;
use crate::room::{RoomBounds, RoomChannel};
use crate::store::{InMemoryStore, MessageStore};
use crate::typing::{TypingBus, TypingKey, DEFAULT_IDLE_TIMEOUT};

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Direct message bounds.
    pub limits: MessageLimits,
    /// Room creation and message bounds.
    pub rooms: RoomBounds,
    /// Idle window before a typing indicator lapses.
    pub typing_idle_timeout: Duration,
    /// Outbound queue capacity per connection.
    pub queue_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            limits: MessageLimits::default(),
            rooms: RoomBounds::default(),
            typing_idle_timeout: DEFAULT_IDLE_TIMEOUT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// The messaging engine.
///
/// Owns the connection hub, presence and typing state, and both channels.
/// Connection lifecycle lives in [`crate::gateway`], intent routing in
/// [`crate::dispatch`].
pub struct Engine {
    pub(crate) store: Arc<dyn MessageStore>,
    pub(crate) hub: Arc<Hub>,
    pub(crate) presence: Arc<PresenceRegistry>,
    pub(crate) typing: Arc<TypingBus>,
    pub(crate) direct: DirectChannel,
    pub(crate) rooms: RoomChannel,
    pub(crate) identity: Arc<dyn IdentityResolver>,
    pub(crate) audience: Arc<dyn PresenceAudience>,
    pub(crate) clock: Arc<dyn Clock>,
    config: EngineConfig,
}

/// Engine statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineStats {
    pub connections: usize,
    pub online_users: usize,
    pub live_rooms: usize,
    pub typing_entries: usize,
    pub delivered: u64,
    pub dropped: u64,
}

/// What one maintenance pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired_rooms: Vec<RoomId>,
    pub lapsed_typing: usize,
    pub pruned_locks: usize,
}

impl Engine {
    #[must_use]
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }

    #[must_use]
    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    #[must_use]
    pub fn presence(&self) -> &PresenceRegistry {
        &self.presence
    }

    #[must_use]
    pub fn typing(&self) -> &TypingBus {
        &self.typing
    }

    #[must_use]
    pub fn direct(&self) -> &DirectChannel {
        &self.direct
    }

    #[must_use]
    pub fn rooms(&self) -> &RoomChannel {
        &self.rooms
    }

    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    #[must_use]
    pub fn stats(&self) -> EngineStats {
        let hub = self.hub.stats();
        EngineStats {
            connections: hub.connection_count,
            online_users: self.presence.online_users().len(),
            live_rooms: self.rooms.live_count(),
            typing_entries: self.typing.len(),
            delivered: hub.delivered,
            dropped: hub.dropped,
        }
    }

    /// One maintenance pass: expire rooms, lapse idle typing indicators,
    /// forget idle conversation locks.
    pub async fn sweep(&self) -> SweepReport {
        let expired_rooms = self.rooms.sweep_expired().await;

        let lapsed = self.typing.expire_idle();
        for key in &lapsed {
            match *key {
                TypingKey::Direct { sender, recipient } => {
                    self.direct.notify_typing(sender, recipient, false);
                }
                TypingKey::Room { room, user } => self.rooms.typing_lapsed(room, user).await,
            }
        }

        let report = SweepReport {
            expired_rooms,
            lapsed_typing: lapsed.len(),
            pruned_locks: self.direct.prune_locks(),
        };
        if report != SweepReport::default() {
            debug!(
                expired_rooms = report.expired_rooms.len(),
                lapsed_typing = report.lapsed_typing,
                pruned_locks = report.pruned_locks,
                "Sweep finished"
            );
        }
        report
    }
}

/// Builder for [`Engine`].
///
/// Every collaborator has a default: the system clock, an in-memory store,
/// passthrough identity and conversation partners as presence audience.
#[derive(Default)]
pub struct EngineBuilder {
    config: EngineConfig,
    store: Option<Arc<dyn MessageStore>>,
    identity: Option<Arc<dyn IdentityResolver>>,
    audience: Option<Arc<dyn PresenceAudience>>,
    clock: Option<Arc<dyn Clock>>,
}

impl EngineBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn MessageStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn with_identity(mut self, identity: Arc<dyn IdentityResolver>) -> Self {
        self.identity = Some(identity);
        self
    }

    #[must_use]
    pub fn with_audience(mut self, audience: Arc<dyn PresenceAudience>) -> Self {
        self.audience = Some(audience);
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    #[must_use]
    pub fn build(self) -> Engine {
        let config = self.config;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryStore::new(Arc::clone(&clock))));
        let identity = self
            .identity
            .unwrap_or_else(|| Arc::new(PassthroughResolver));
        let audience = self
            .audience
            .unwrap_or_else(|| Arc::new(ConversationAudience::new(Arc::clone(&store))));

        let hub = Arc::new(Hub::new(config.queue_capacity));
        let presence = Arc::new(PresenceRegistry::new(Arc::clone(&clock)));
        let typing = Arc::new(TypingBus::new(config.typing_idle_timeout, Arc::clone(&clock)));
        let direct = DirectChannel::new(
            Arc::clone(&store),
            Arc::clone(&hub),
            Arc::clone(&presence),
            Arc::clone(&typing),
            Arc::clone(&clock),
            config.limits.clone(),
        );
        let rooms = RoomChannel::new(
            Arc::clone(&store),
            Arc::clone(&hub),
            Arc::clone(&typing),
            Arc::clone(&clock),
            config.rooms.clone(),
        );

        info!(
            queue_capacity = config.queue_capacity,
            typing_idle_ms = config.typing_idle_timeout.as_millis() as u64,
            "Engine ready"
        );

        Engine {
            store,
            hub,
            presence,
            typing,
            direct,
            rooms,
            identity,
            audience,
            clock,
            config,
        }
    }
}
