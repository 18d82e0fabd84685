//! Connection lifecycle: authenticate, open, close.

use parley_protocol::events::{PresenceNotice, Ready};
use parley_protocol::{ServerEvent, User, UserId};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::error::ChatResult;
use crate::hub::{ConnectionId, EventReceiver};
use crate::presence::PresenceChange;
use crate::typing::TypingKey;

/// An authenticated connection.
#[derive(Debug, Clone)]
pub struct Session {
    user: User,
    connection_id: ConnectionId,
}

impl Session {
    #[must_use]
    pub fn user(&self) -> &User {
        &self.user
    }

    #[must_use]
    pub fn user_id(&self) -> UserId {
        self.user.id
    }

    #[must_use]
    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }
}

/// A freshly opened connection and its outbound queue.
pub struct ConnectionLease {
    pub session: Session,
    pub events: EventReceiver,
}

impl Engine {
    /// Resolve a caller token to an internal user, creating it on first
    /// sight.
    ///
    /// # Errors
    ///
    /// `Unauthorized` if the token does not resolve, `Unavailable` if the
    /// store is down.
    pub async fn authenticate(&self, token: &str) -> ChatResult<User> {
        let identity = self.identity.resolve(token).await?;
        let user = self.store.upsert_user(&identity).await?;
        debug!(user = %user.id, subject = %user.external_ref, "Authenticated");
        Ok(user)
    }

    /// Register a connection for an authenticated user.
    ///
    /// The first event on the queue is always `ready`.
    pub async fn open_connection(&self, user: User) -> ConnectionLease {
        let connection_id = ConnectionId::generate();
        let user_id = user.id;
        let events = self.hub.register(connection_id.clone(), user_id);

        self.hub.deliver(
            &connection_id,
            Arc::new(ServerEvent::Ready(Ready {
                user_id,
                connection_id: connection_id.to_string(),
            })),
        );

        if let Some(change) = self
            .presence
            .connection_opened(user_id, connection_id.clone())
        {
            self.broadcast_presence(user_id, change).await;
        }

        match self.direct.deliver_pending(user_id).await {
            Ok(0) => {}
            Ok(count) => debug!(user = %user_id, count, "Delivered pending messages"),
            Err(e) => warn!(user = %user_id, error = %e, "Failed to deliver pending messages"),
        }

        info!(user = %user_id, connection = %connection_id, "Connection opened");
        ConnectionLease {
            session: Session {
                user,
                connection_id,
            },
            events,
        }
    }

    /// Tear a connection down: leave its rooms, drop its queue and update
    /// presence. Safe to call more than once.
    pub async fn close_connection(&self, session: &Session) {
        let user_id = session.user_id();
        let connection_id = session.connection_id();

        self.rooms.leave_connection(user_id, connection_id).await;
        self.hub.unregister(connection_id);

        if let Some(change) = self.presence.connection_closed(user_id, connection_id) {
            for key in self.typing.clear_user(user_id) {
                match key {
                    TypingKey::Direct { recipient, .. } => {
                        self.direct.notify_typing(user_id, recipient, false);
                    }
                    TypingKey::Room { room, .. } => {
                        self.rooms.typing_lapsed(room, user_id).await;
                    }
                }
            }
            self.broadcast_presence(user_id, change).await;
        }

        info!(user = %user_id, connection = %connection_id, "Connection closed");
    }

    /// Tell the user's audience about a presence edge.
    ///
    /// Dropped if a newer edge happened in the meantime.
    async fn broadcast_presence(&self, user_id: UserId, change: PresenceChange) {
        let targets: Vec<ConnectionId> = self
            .audience
            .audience(user_id)
            .await
            .into_iter()
            .filter(|watcher| *watcher != user_id)
            .flat_map(|watcher| self.presence.connections(watcher))
            .collect();
        if targets.is_empty() {
            return;
        }

        let online = change.is_online();
        let event = match change {
            PresenceChange::Online { .. } => ServerEvent::PresenceOnline(PresenceNotice {
                user_id,
                last_seen: None,
            }),
            PresenceChange::Offline { last_seen, .. } => ServerEvent::PresenceOffline(PresenceNotice {
                user_id,
                last_seen: Some(last_seen),
            }),
        };

        let emitted = self.presence.emit_if_current(user_id, &change, || {
            self.hub.fan_out(&targets, Arc::new(event));
        });
        if !emitted {
            debug!(user = %user_id, online, "Presence: stale transition not broadcast");
        }
    }
}
