//! Ephemeral typing state.
//!
//! Never persisted. Every `isTyping: true` refreshes a deadline; an entry
//! whose deadline passes without a refresh is expired by
//! [`TypingBus::expire_idle`], so a client that vanishes without sending
//! `isTyping: false` cannot leave a stuck indicator behind.

use dashmap::DashMap;
use parley_protocol::{RoomId, UserId};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

use crate::clock::Clock;

/// Default idle window before a typing indicator lapses.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Who is typing to whom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypingKey {
    Direct { sender: UserId, recipient: UserId },
    Room { room: RoomId, user: UserId },
}

impl TypingKey {
    /// The user doing the typing.
    #[must_use]
    pub fn typist(&self) -> UserId {
        match self {
            TypingKey::Direct { sender, .. } => *sender,
            TypingKey::Room { user, .. } => *user,
        }
    }
}

pub struct TypingBus {
    /// Key -> deadline (ms).
    entries: DashMap<TypingKey, u64>,
    idle_timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl TypingBus {
    #[must_use]
    pub fn new(idle_timeout: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            idle_timeout,
            clock,
        }
    }

    /// Write or clear a typing state.
    ///
    /// Returns `true` if the visible state changed.
    pub fn set(&self, key: TypingKey, is_typing: bool) -> bool {
        let now = self.clock.now_millis();
        if is_typing {
            let deadline = now + self.idle_timeout.as_millis() as u64;
            let previous = self.entries.insert(key, deadline);
            previous.map_or(true, |old| old <= now)
        } else {
            self.entries
                .remove(&key)
                .is_some_and(|(_, deadline)| deadline > now)
        }
    }

    /// Check if a typing state is active right now.
    #[must_use]
    pub fn is_typing(&self, key: &TypingKey) -> bool {
        let now = self.clock.now_millis();
        self.entries.get(key).is_some_and(|deadline| *deadline > now)
    }

    /// Remove every entry whose deadline passed.
    ///
    /// Returns the expired keys so their audiences can be told.
    pub fn expire_idle(&self) -> Vec<TypingKey> {
        let now = self.clock.now_millis();
        let mut expired = Vec::new();
        self.entries.retain(|key, deadline| {
            if *deadline <= now {
                expired.push(*key);
                false
            } else {
                true
            }
        });
        if !expired.is_empty() {
            trace!(count = expired.len(), "Typing: expired idle entries");
        }
        expired
    }

    /// Drop every active entry a user is typing in.
    ///
    /// Returns the keys that were still active.
    pub fn clear_user(&self, user: UserId) -> Vec<TypingKey> {
        let now = self.clock.now_millis();
        let mut cleared = Vec::new();
        self.entries.retain(|key, deadline| {
            if key.typist() == user {
                if *deadline > now {
                    cleared.push(*key);
                }
                false
            } else {
                true
            }
        });
        cleared
    }

    /// Drop every entry of a room.
    pub fn clear_room(&self, room: RoomId) {
        self.entries
            .retain(|key, _| !matches!(key, TypingKey::Room { room: r, .. } if *r == room));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn bus() -> (TypingBus, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(0));
        (TypingBus::new(Duration::from_millis(1_000), clock.clone()), clock)
    }

    const KEY: TypingKey = TypingKey::Direct {
        sender: UserId(1),
        recipient: UserId(2),
    };

    #[test]
    fn test_set_and_clear() {
        let (bus, _) = bus();

        assert!(bus.set(KEY, true));
        assert!(!bus.set(KEY, true)); // refresh, no visible change
        assert!(bus.is_typing(&KEY));

        assert!(bus.set(KEY, false));
        assert!(!bus.is_typing(&KEY));
        assert!(!bus.set(KEY, false));
    }

    #[test]
    fn test_idle_expiry_without_clear() {
        let (bus, clock) = bus();
        bus.set(KEY, true);

        clock.advance(999);
        assert!(bus.expire_idle().is_empty());

        clock.advance(1);
        assert!(!bus.is_typing(&KEY));
        assert_eq!(bus.expire_idle(), vec![KEY]);
        assert!(bus.is_empty());
    }

    #[test]
    fn test_refresh_extends_deadline() {
        let (bus, clock) = bus();
        bus.set(KEY, true);
        clock.advance(800);
        bus.set(KEY, true);
        clock.advance(800);
        assert!(bus.is_typing(&KEY));
    }

    #[test]
    fn test_clear_user_and_room() {
        let (bus, _) = bus();
        let room_key = TypingKey::Room {
            room: 4,
            user: UserId(1),
        };
        let other = TypingKey::Room {
            room: 4,
            user: UserId(3),
        };
        bus.set(KEY, true);
        bus.set(room_key, true);
        bus.set(other, true);

        let mut cleared = bus.clear_user(UserId(1));
        cleared.sort_by_key(|k| matches!(k, TypingKey::Room { .. }));
        assert_eq!(cleared, vec![KEY, room_key]);
        assert!(bus.is_typing(&other));

        bus.clear_room(4);
        assert!(bus.is_empty());
    }
}
