//! Presence tracking for Parley.
//!
//! A user is online while at least one authenticated connection is open.
//! Each user's entry is a reference-counted set of connection handles;
//! only the 0→1 and 1→0 edges produce a [`PresenceChange`].

use dashmap::DashMap;
use parley_protocol::UserId;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

use crate::clock::Clock;
use crate::hub::ConnectionId;

/// Edge transition of a user's presence.
///
/// `generation` counts the user's edges; only the newest one may still be
/// broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceChange {
    Online { generation: u64 },
    Offline { last_seen: u64, generation: u64 },
}

impl PresenceChange {
    #[must_use]
    pub fn generation(&self) -> u64 {
        match *self {
            PresenceChange::Online { generation } | PresenceChange::Offline { generation, .. } => {
                generation
            }
        }
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        matches!(self, PresenceChange::Online { .. })
    }
}

/// Presence state for a single user.
#[derive(Debug, Default)]
struct PresenceEntry {
    connections: HashSet<ConnectionId>,
    /// When the last connection closed.
    last_seen: Option<u64>,
    generation: u64,
}

/// Serializable view of a user's presence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceSnapshot {
    pub user_id: UserId,
    pub online: bool,
    pub connections: usize,
    pub last_seen: Option<u64>,
}

/// Presence registry.
///
/// Entries live in a sharded map; the shard lock serializes every
/// read-modify-write of a user's entry.
pub struct PresenceRegistry {
    entries: DashMap<UserId, PresenceEntry>,
    clock: Arc<dyn Clock>,
}

impl PresenceRegistry {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Record a newly authenticated connection.
    ///
    /// Returns `Some(Online)` only on the user's first connection.
    pub fn connection_opened(
        &self,
        user_id: UserId,
        connection_id: ConnectionId,
    ) -> Option<PresenceChange> {
        let mut entry = self.entries.entry(user_id).or_default();
        let was_offline = entry.connections.is_empty();
        if !entry.connections.insert(connection_id.clone()) {
            return None;
        }

        debug!(
            user = %user_id,
            connection = %connection_id,
            connections = entry.connections.len(),
            "Presence: connection opened"
        );

        if !was_offline {
            return None;
        }
        entry.generation += 1;
        Some(PresenceChange::Online {
            generation: entry.generation,
        })
    }

    /// Record a closed connection.
    ///
    /// Returns `Some(Offline)` only when the user's last connection closes.
    /// Unknown handles are ignored.
    pub fn connection_closed(
        &self,
        user_id: UserId,
        connection_id: &ConnectionId,
    ) -> Option<PresenceChange> {
        let mut entry = self.entries.get_mut(&user_id)?;
        if !entry.connections.remove(connection_id) {
            return None;
        }

        debug!(
            user = %user_id,
            connection = %connection_id,
            connections = entry.connections.len(),
            "Presence: connection closed"
        );

        if entry.connections.is_empty() {
            let now = self.clock.now_millis();
            entry.last_seen = Some(now);
            entry.generation += 1;
            Some(PresenceChange::Offline {
                last_seen: now,
                generation: entry.generation,
            })
        } else {
            None
        }
    }

    /// Check if a user has at least one open connection.
    #[must_use]
    pub fn is_online(&self, user_id: UserId) -> bool {
        self.entries
            .get(&user_id)
            .is_some_and(|e| !e.connections.is_empty())
    }

    /// Number of open connections for a user.
    #[must_use]
    pub fn connection_count(&self, user_id: UserId) -> usize {
        self.entries
            .get(&user_id)
            .map(|e| e.connections.len())
            .unwrap_or(0)
    }

    /// All open connections of a user.
    #[must_use]
    pub fn connections(&self, user_id: UserId) -> Vec<ConnectionId> {
        self.entries
            .get(&user_id)
            .map(|e| e.connections.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// When the user's last connection closed. `None` while online or if never seen.
    #[must_use]
    pub fn last_seen(&self, user_id: UserId) -> Option<u64> {
        self.entries
            .get(&user_id)
            .filter(|e| e.connections.is_empty())
            .and_then(|e| e.last_seen)
    }

    #[must_use]
    pub fn snapshot(&self, user_id: UserId) -> PresenceSnapshot {
        match self.entries.get(&user_id) {
            Some(entry) => PresenceSnapshot {
                user_id,
                online: !entry.connections.is_empty(),
                connections: entry.connections.len(),
                last_seen: if entry.connections.is_empty() {
                    entry.last_seen
                } else {
                    None
                },
            },
            None => PresenceSnapshot {
                user_id,
                online: false,
                connections: 0,
                last_seen: None,
            },
        }
    }

    /// All users with at least one open connection.
    #[must_use]
    pub fn online_users(&self) -> Vec<UserId> {
        self.entries
            .iter()
            .filter(|e| !e.connections.is_empty())
            .map(|e| *e.key())
            .collect()
    }

    /// Run `emit` while the user's entry is pinned, but only if `change` is
    /// still the user's latest edge.
    ///
    /// Later transitions wait for `emit` to finish, so a stale event can
    /// never be published after a newer one. `emit` must not touch this
    /// registry.
    pub fn emit_if_current(
        &self,
        user_id: UserId,
        change: &PresenceChange,
        emit: impl FnOnce(),
    ) -> bool {
        let current = self.entries.get(&user_id);
        let latest = current.as_ref().map_or(0, |e| e.generation);
        if latest != change.generation() {
            return false;
        }
        emit();
        drop(current);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn registry() -> (PresenceRegistry, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(5_000));
        (PresenceRegistry::new(clock.clone()), clock)
    }

    #[test]
    fn test_only_edges_fire() {
        let (presence, _) = registry();
        let user = UserId(1);

        assert_eq!(
            presence.connection_opened(user, "a".into()),
            Some(PresenceChange::Online { generation: 1 })
        );
        assert_eq!(presence.connection_opened(user, "b".into()), None);
        assert_eq!(presence.connection_opened(user, "c".into()), None);
        assert_eq!(presence.connection_count(user), 3);

        assert_eq!(presence.connection_closed(user, &"a".into()), None);
        assert_eq!(presence.connection_closed(user, &"b".into()), None);
        assert!(presence.is_online(user));

        assert!(matches!(
            presence.connection_closed(user, &"c".into()),
            Some(PresenceChange::Offline { .. })
        ));
        assert!(!presence.is_online(user));
    }

    #[test]
    fn test_n_connections_one_offline_transition() {
        let (presence, _) = registry();
        let user = UserId(2);
        let conns: Vec<ConnectionId> = (0..5).map(|i| ConnectionId::new(format!("c{i}"))).collect();

        for c in &conns {
            presence.connection_opened(user, c.clone());
        }

        let offline_events = conns
            .iter()
            .filter_map(|c| presence.connection_closed(user, c))
            .count();
        assert_eq!(offline_events, 1);
        assert_eq!(presence.connection_count(user), 0);
    }

    #[test]
    fn test_duplicate_and_unknown_handles_are_ignored() {
        let (presence, _) = registry();
        let user = UserId(3);

        presence.connection_opened(user, "a".into());
        assert_eq!(presence.connection_opened(user, "a".into()), None);
        assert_eq!(presence.connection_count(user), 1);

        assert_eq!(presence.connection_closed(user, &"zzz".into()), None);
        assert_eq!(presence.connection_closed(UserId(99), &"a".into()), None);
        assert!(presence.is_online(user));
    }

    #[test]
    fn test_last_seen_recorded_on_offline() {
        let (presence, clock) = registry();
        let user = UserId(4);

        presence.connection_opened(user, "a".into());
        assert_eq!(presence.last_seen(user), None);

        clock.advance(250);
        presence.connection_closed(user, &"a".into());
        assert_eq!(presence.last_seen(user), Some(5_250));

        let snapshot = presence.snapshot(user);
        assert!(!snapshot.online);
        assert_eq!(snapshot.last_seen, Some(5_250));

        presence.connection_opened(user, "b".into());
        assert_eq!(presence.snapshot(user).last_seen, None);
    }

    #[test]
    fn test_emit_if_current() {
        let (presence, _) = registry();
        let user = UserId(5);
        let online = presence.connection_opened(user, "a".into()).unwrap();

        let mut fired = false;
        assert!(presence.emit_if_current(user, &online, || fired = true));
        assert!(fired);

        let offline = presence.connection_closed(user, &"a".into()).unwrap();
        assert!(!presence.emit_if_current(user, &online, || panic!("stale emit")));
        assert!(presence.emit_if_current(user, &offline, || {}));
    }

    #[test]
    fn test_flapping_user_suppresses_delayed_online() {
        let (presence, _) = registry();
        let user = UserId(7);

        let first = presence.connection_opened(user, "a".into()).unwrap();
        let offline = presence.connection_closed(user, &"a".into()).unwrap();
        let second = presence.connection_opened(user, "b".into()).unwrap();
        assert!(first.is_online() && second.is_online());
        assert!(first.generation() < offline.generation());
        assert!(offline.generation() < second.generation());

        // Both onlines match the boolean state, only the newest may go out.
        let mut published = Vec::new();
        for change in [first, offline, second] {
            presence.emit_if_current(user, &change, || published.push(change));
        }
        assert_eq!(published, vec![second]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_connect_disconnect_keeps_exact_count() {
        let (presence, _) = registry();
        let presence = Arc::new(presence);
        let user = UserId(6);

        let mut handles = Vec::new();
        for i in 0..64 {
            let presence = Arc::clone(&presence);
            handles.push(tokio::spawn(async move {
                let conn = ConnectionId::new(format!("c{i}"));
                presence.connection_opened(user, conn.clone());
                tokio::task::yield_now().await;
                if i % 2 == 0 {
                    presence.connection_closed(user, &conn);
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(presence.connection_count(user), 32);
        assert!(presence.is_online(user));
    }
}
