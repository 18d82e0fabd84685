//! Topic rooms: capacity-bounded, time-boxed group channels.
//!
//! A room moves `Active → Expired → Purged`. Expiry is checked on every
//! join, post and typing signal, and eagerly by [`RoomChannel::sweep_expired`].
//! Each live room sits behind its own async mutex, held across persist and
//! enqueue so every member sees messages in acceptance order.

use dashmap::DashMap;
use parley_protocol::events::{ParticipantUpdate, RoomTypingNotice};
use parley_protocol::{
    EventScope, RoomId, RoomMessage, ServerEvent, TopicRoom, UserId, UserSummary,
};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::{ChatError, ChatResult};
use crate::hub::{ConnectionId, Hub};
use crate::store::{MessageStore, RoomDraft, RoomMessageDraft};
use crate::typing::{TypingBus, TypingKey};

const MINUTE_MS: u64 = 60_000;

/// Bounds applied to room creation and room messages.
#[derive(Debug, Clone)]
pub struct RoomBounds {
    pub max_title_chars: usize,
    pub max_category_chars: usize,
    pub min_duration_minutes: u64,
    pub max_duration_minutes: u64,
    pub min_max_users: u32,
    pub max_max_users: u32,
    pub max_message_chars: usize,
    /// Largest backfill served by [`RoomChannel::history`].
    pub history_limit: usize,
    /// How long a purged room keeps answering `RoomExpired` before it is
    /// forgotten and reads as `RoomNotFound`.
    pub purged_retention_minutes: u64,
}

impl Default for RoomBounds {
    fn default() -> Self {
        Self {
            max_title_chars: 50,
            max_category_chars: 32,
            min_duration_minutes: 1,
            max_duration_minutes: 1_440,
            min_max_users: 2,
            max_max_users: 500,
            max_message_chars: 1_000,
            history_limit: 100,
            purged_retention_minutes: 60,
        }
    }
}

/// Room creation request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoom {
    pub title: String,
    pub category: String,
    pub duration_minutes: u64,
    pub max_users: u32,
}

/// Listing filter.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoomFilter {
    /// Case-insensitive title substring.
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
}

struct Member {
    connections: HashSet<ConnectionId>,
}

struct LiveRoom {
    room: TopicRoom,
    members: HashMap<UserId, Member>,
    purged: bool,
}

impl LiveRoom {
    fn count(&self) -> u32 {
        self.members.len() as u32
    }

    fn snapshot(&self) -> TopicRoom {
        let mut room = self.room.clone();
        room.participant_count = self.count();
        room
    }

    fn connections(&self) -> Vec<ConnectionId> {
        self.members
            .values()
            .flat_map(|m| m.connections.iter().cloned())
            .collect()
    }

    fn connections_except(&self, user: UserId) -> Vec<ConnectionId> {
        self.members
            .iter()
            .filter(|(id, _)| **id != user)
            .flat_map(|(_, m)| m.connections.iter().cloned())
            .collect()
    }
}

/// The topic room channel.
pub struct RoomChannel {
    live: DashMap<RoomId, Arc<Mutex<LiveRoom>>>,
    /// Purged room ids and when they were purged.
    purged: DashMap<RoomId, u64>,
    by_connection: DashMap<ConnectionId, HashSet<RoomId>>,
    store: Arc<dyn MessageStore>,
    hub: Arc<Hub>,
    typing: Arc<TypingBus>,
    clock: Arc<dyn Clock>,
    bounds: RoomBounds,
}

impl RoomChannel {
    #[must_use]
    pub fn new(
        store: Arc<dyn MessageStore>,
        hub: Arc<Hub>,
        typing: Arc<TypingBus>,
        clock: Arc<dyn Clock>,
        bounds: RoomBounds,
    ) -> Self {
        Self {
            live: DashMap::new(),
            purged: DashMap::new(),
            by_connection: DashMap::new(),
            store,
            hub,
            typing,
            clock,
            bounds,
        }
    }

    #[must_use]
    pub fn bounds(&self) -> &RoomBounds {
        &self.bounds
    }

    /// Purged rooms still remembered as expired.
    #[must_use]
    pub fn purged_count(&self) -> usize {
        self.purged.len()
    }

    /// Number of rooms in live state.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Rooms a connection has joined.
    #[must_use]
    pub fn rooms_of(&self, conn: &ConnectionId) -> Vec<RoomId> {
        self.by_connection
            .get(conn)
            .map(|r| r.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Create a room. The creator is not joined.
    ///
    /// # Errors
    ///
    /// `InvalidPayload` when a field is out of bounds, `Unavailable` if the
    /// store is down.
    pub async fn create(&self, creator: UserId, request: CreateRoom) -> ChatResult<TopicRoom> {
        let title = request.title.trim().to_string();
        let category = request.category.trim().to_string();
        let b = &self.bounds;

        check_len("title", &title, b.max_title_chars)?;
        check_len("category", &category, b.max_category_chars)?;
        if request.duration_minutes < b.min_duration_minutes
            || request.duration_minutes > b.max_duration_minutes
        {
            return Err(ChatError::InvalidPayload(format!(
                "durationMinutes must be between {} and {}",
                b.min_duration_minutes, b.max_duration_minutes
            )));
        }
        if request.max_users < b.min_max_users || request.max_users > b.max_max_users {
            return Err(ChatError::InvalidPayload(format!(
                "maxUsers must be between {} and {}",
                b.min_max_users, b.max_max_users
            )));
        }

        let now = self.clock.now_millis();
        let room = self
            .store
            .insert_room(RoomDraft {
                title,
                category,
                creator,
                max_users: request.max_users,
                created_at: now,
                expires_at: now.saturating_add(request.duration_minutes.saturating_mul(MINUTE_MS)),
            })
            .await?;

        self.live.insert(
            room.id,
            Arc::new(Mutex::new(LiveRoom {
                room: room.clone(),
                members: HashMap::new(),
                purged: false,
            })),
        );

        info!(room = room.id, creator = %creator, title = %room.title, "Room created");
        Ok(room)
    }

    /// Fetch the live slot for a room, loading it from the store if needed.
    async fn slot(&self, id: RoomId) -> ChatResult<Arc<Mutex<LiveRoom>>> {
        if let Some(slot) = self.live.get(&id) {
            return Ok(Arc::clone(slot.value()));
        }
        if self.purged.contains_key(&id) {
            return Err(ChatError::RoomExpired(id));
        }

        let room = self
            .store
            .room(id)
            .await?
            .ok_or(ChatError::RoomNotFound(id))?;

        let slot = self
            .live
            .entry(id)
            .or_insert_with(|| {
                Arc::new(Mutex::new(LiveRoom {
                    room,
                    members: HashMap::new(),
                    purged: false,
                }))
            })
            .clone();
        Ok(slot)
    }

    /// Lazy expiry check. Purges the room if its time is up.
    async fn ensure_active(&self, room: &mut LiveRoom) -> ChatResult<()> {
        let id = room.room.id;
        if room.purged {
            return Err(ChatError::RoomExpired(id));
        }
        if room.room.is_expired_at(self.clock.now_millis()) {
            self.purge(room).await;
            return Err(ChatError::RoomExpired(id));
        }
        Ok(())
    }

    /// Notify and force-leave every member, then drop live state.
    async fn purge(&self, room: &mut LiveRoom) {
        let id = room.room.id;
        let connections = room.connections();
        let notice = Arc::new(ChatError::RoomExpired(id).to_event(EventScope::Room, Some(id)));
        let notified = self.hub.fan_out(&connections, notice);

        for conn in &connections {
            self.unindex(conn, id);
        }
        let members = room.members.len();
        room.members.clear();
        room.purged = true;

        self.purged.insert(id, self.clock.now_millis());
        self.live.remove(&id);
        self.typing.clear_room(id);

        if let Err(e) = self.store.delete_room(id).await {
            warn!(room = id, error = %e, "Failed to delete expired room from the store");
        }

        info!(room = id, members, notified, "Room expired");
    }

    fn index(&self, conn: &ConnectionId, id: RoomId) {
        self.by_connection.entry(conn.clone()).or_default().insert(id);
    }

    fn unindex(&self, conn: &ConnectionId, id: RoomId) {
        if let Some(mut rooms) = self.by_connection.get_mut(conn) {
            rooms.remove(&id);
        }
        self.by_connection.remove_if(conn, |_, rooms| rooms.is_empty());
    }

    fn participant_update(id: RoomId, count: u32) -> Arc<ServerEvent> {
        Arc::new(ServerEvent::RoomParticipantUpdate(ParticipantUpdate {
            room_id: id,
            count,
        }))
    }

    /// Join a room through a connection. Returns the participant count.
    ///
    /// Joining again, from the same or another connection, succeeds without
    /// changing the count.
    ///
    /// # Errors
    ///
    /// `RoomNotFound`, `RoomExpired`, `RoomFull`, or `Unavailable`.
    pub async fn join(&self, user: UserId, conn: &ConnectionId, id: RoomId) -> ChatResult<u32> {
        let slot = self.slot(id).await?;
        let mut room = slot.lock().await;
        self.ensure_active(&mut room).await?;

        if let Some(member) = room.members.get_mut(&user) {
            member.connections.insert(conn.clone());
            self.index(conn, id);
            let count = room.count();
            self.hub.deliver(conn, Self::participant_update(id, count));
            debug!(room = id, user = %user, connection = %conn, "Already joined");
            return Ok(count);
        }

        if room.count() >= room.room.max_users {
            return Err(ChatError::RoomFull(id));
        }

        self.store
            .add_participant(id, user, self.clock.now_millis())
            .await?;
        room.members.insert(
            user,
            Member {
                connections: HashSet::from([conn.clone()]),
            },
        );
        self.index(conn, id);

        let count = room.count();
        self.hub
            .fan_out(&room.connections(), Self::participant_update(id, count));
        debug!(room = id, user = %user, count, "Joined room");
        Ok(count)
    }

    /// Leave a room with every connection. Leaving twice is a no-op.
    ///
    /// # Errors
    ///
    /// `Unavailable` if the store is down; membership is kept in that case.
    pub async fn leave(&self, user: UserId, id: RoomId) -> ChatResult<()> {
        let Some(slot) = self.live.get(&id).map(|s| Arc::clone(s.value())) else {
            return Ok(());
        };
        let mut room = slot.lock().await;
        if room.purged || !room.members.contains_key(&user) {
            return Ok(());
        }

        self.store.remove_participant(id, user).await?;
        let Some(member) = room.members.remove(&user) else {
            return Ok(());
        };
        for conn in &member.connections {
            self.unindex(conn, id);
        }

        self.after_departure(&room, user);
        let update = Self::participant_update(id, room.count());
        self.hub.fan_out(&room.connections(), Arc::clone(&update));
        self.hub.fan_out(&member.connections, update);
        debug!(room = id, user = %user, count = room.count(), "Left room");
        Ok(())
    }

    /// Drop one connection from every room it joined.
    ///
    /// A member whose last joined connection goes is removed from the room.
    pub async fn leave_connection(&self, user: UserId, conn: &ConnectionId) {
        let rooms = self
            .by_connection
            .remove(conn)
            .map(|(_, rooms)| rooms)
            .unwrap_or_default();

        for id in rooms {
            let Some(slot) = self.live.get(&id).map(|s| Arc::clone(s.value())) else {
                continue;
            };
            let mut room = slot.lock().await;
            let emptied = match room.members.get_mut(&user) {
                Some(member) => {
                    member.connections.remove(conn);
                    member.connections.is_empty()
                }
                None => false,
            };
            if !emptied {
                continue;
            }

            room.members.remove(&user);
            if let Err(e) = self.store.remove_participant(id, user).await {
                warn!(room = id, user = %user, error = %e, "Failed to persist departure");
            }
            self.after_departure(&room, user);
            self.hub
                .fan_out(&room.connections(), Self::participant_update(id, room.count()));
            debug!(room = id, user = %user, connection = %conn, "Left room on disconnect");
        }
    }

    fn after_departure(&self, room: &LiveRoom, user: UserId) {
        let id = room.room.id;
        if self.typing.set(TypingKey::Room { room: id, user }, false) {
            self.hub.fan_out(
                &room.connections(),
                Arc::new(ServerEvent::RoomTyping(RoomTypingNotice {
                    room_id: id,
                    user_id: user,
                    is_typing: false,
                })),
            );
        }
    }

    /// Post a message to a room the user has joined.
    ///
    /// # Errors
    ///
    /// `EmptyPayload`, `PayloadTooLarge`, `RoomNotFound`, `RoomExpired`,
    /// `NotAMember`, or `Unavailable`.
    pub async fn post_message(
        &self,
        user: UserId,
        id: RoomId,
        content: &str,
    ) -> ChatResult<RoomMessage> {
        let content = content.trim();
        if content.is_empty() {
            return Err(ChatError::EmptyPayload);
        }
        let len = content.chars().count();
        if len > self.bounds.max_message_chars {
            return Err(ChatError::PayloadTooLarge {
                len,
                max: self.bounds.max_message_chars,
            });
        }

        let sender = self.store.user(user).await?.map(|u| u.summary());

        let slot = self.slot(id).await?;
        let mut room = slot.lock().await;
        self.ensure_active(&mut room).await?;
        if !room.members.contains_key(&user) {
            return Err(ChatError::NotAMember(id));
        }

        let mut message = self
            .store
            .insert_room_message(RoomMessageDraft {
                room_id: id,
                user_id: user,
                content: content.to_string(),
                created_at: self.clock.now_millis(),
            })
            .await?;
        message.sender = sender;

        if self.typing.set(TypingKey::Room { room: id, user }, false) {
            self.hub.fan_out(
                &room.connections_except(user),
                Arc::new(ServerEvent::RoomTyping(RoomTypingNotice {
                    room_id: id,
                    user_id: user,
                    is_typing: false,
                })),
            );
        }

        let delivered = self.hub.fan_out(
            &room.connections(),
            Arc::new(ServerEvent::RoomMessage(message.clone())),
        );
        debug!(room = id, user = %user, message = message.id, delivered, "Room message posted");
        Ok(message)
    }

    /// Forward a member's typing signal to the other members.
    ///
    /// # Errors
    ///
    /// `RoomNotFound`, `RoomExpired`, `NotAMember`, or `Unavailable`.
    pub async fn set_typing(&self, user: UserId, id: RoomId, is_typing: bool) -> ChatResult<()> {
        let slot = self.slot(id).await?;
        let mut room = slot.lock().await;
        self.ensure_active(&mut room).await?;
        if !room.members.contains_key(&user) {
            return Err(ChatError::NotAMember(id));
        }

        self.typing.set(TypingKey::Room { room: id, user }, is_typing);
        self.hub.fan_out(
            &room.connections_except(user),
            Arc::new(ServerEvent::RoomTyping(RoomTypingNotice {
                room_id: id,
                user_id: user,
                is_typing,
            })),
        );
        Ok(())
    }

    /// Tell the other members that an idle typing indicator lapsed.
    pub(crate) async fn typing_lapsed(&self, id: RoomId, user: UserId) {
        let Some(slot) = self.live.get(&id).map(|s| Arc::clone(s.value())) else {
            return;
        };
        let room = slot.lock().await;
        if room.purged || !room.members.contains_key(&user) {
            return;
        }
        self.hub.fan_out(
            &room.connections_except(user),
            Arc::new(ServerEvent::RoomTyping(RoomTypingNotice {
                room_id: id,
                user_id: user,
                is_typing: false,
            })),
        );
    }

    /// A room with its live participant count.
    ///
    /// # Errors
    ///
    /// `RoomNotFound`, `RoomExpired`, or `Unavailable`.
    pub async fn get(&self, id: RoomId) -> ChatResult<TopicRoom> {
        let slot = self.slot(id).await?;
        let mut room = slot.lock().await;
        self.ensure_active(&mut room).await?;
        Ok(room.snapshot())
    }

    /// Active rooms matching a filter, newest first.
    ///
    /// # Errors
    ///
    /// `Unavailable` if the store is down.
    pub async fn list(&self, filter: &RoomFilter) -> ChatResult<Vec<TopicRoom>> {
        let now = self.clock.now_millis();
        let search = filter
            .search
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_lowercase);
        let category = filter
            .category
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty());

        let mut rooms = Vec::new();
        for mut room in self.store.rooms().await? {
            if room.is_expired_at(now) || self.purged.contains_key(&room.id) {
                continue;
            }
            if let Some(search) = &search {
                if !room.title.to_lowercase().contains(search.as_str()) {
                    continue;
                }
            }
            if let Some(category) = category {
                if !room.category.eq_ignore_ascii_case(category) {
                    continue;
                }
            }

            let slot = self.live.get(&room.id).map(|s| Arc::clone(s.value()));
            if let Some(slot) = slot {
                room.participant_count = slot.lock().await.count();
            }
            rooms.push(room);
        }

        rooms.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(rooms)
    }

    /// The newest `limit` messages of an active room, oldest first.
    ///
    /// # Errors
    ///
    /// `InvalidPayload` for a bad limit, `RoomNotFound`, `RoomExpired`, or
    /// `Unavailable`.
    pub async fn history(&self, id: RoomId, limit: usize) -> ChatResult<Vec<RoomMessage>> {
        if limit == 0 || limit > self.bounds.history_limit {
            return Err(ChatError::InvalidPayload(format!(
                "limit must be between 1 and {}",
                self.bounds.history_limit
            )));
        }
        {
            let slot = self.slot(id).await?;
            let mut room = slot.lock().await;
            self.ensure_active(&mut room).await?;
        }

        let mut messages = self.store.room_messages(id, limit).await?;
        let mut senders: HashMap<UserId, Option<UserSummary>> = HashMap::new();
        for message in &mut messages {
            if !senders.contains_key(&message.user_id) {
                let summary = self.store.user(message.user_id).await?.map(|u| u.summary());
                senders.insert(message.user_id, summary);
            }
            message.sender = senders.get(&message.user_id).cloned().flatten();
        }
        Ok(messages)
    }

    /// Expire every room whose time is up, live or not, and forget purged
    /// rooms past their retention.
    ///
    /// Returns the purged room ids.
    pub async fn sweep_expired(&self) -> Vec<RoomId> {
        let now = self.clock.now_millis();
        let slots: Vec<_> = self
            .live
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut expired = Vec::new();
        for slot in slots {
            let mut room = slot.lock().await;
            if !room.purged && room.room.is_expired_at(now) {
                let id = room.room.id;
                self.purge(&mut room).await;
                expired.push(id);
            }
        }

        // Rooms nobody touched since creation never entered live state.
        match self.store.rooms().await {
            Ok(stored) => {
                for room in stored {
                    if !room.is_expired_at(now) || self.live.contains_key(&room.id) {
                        continue;
                    }
                    let fresh = self.purged.insert(room.id, now).is_none();
                    self.typing.clear_room(room.id);
                    if let Err(e) = self.store.delete_room(room.id).await {
                        warn!(room = room.id, error = %e, "Failed to delete expired room from the store");
                        continue;
                    }
                    if fresh {
                        debug!(room = room.id, "Idle room expired");
                        expired.push(room.id);
                    }
                }
            }
            Err(e) => warn!(error = %e, "Failed to scan rooms for expiry"),
        }

        let retention = self.bounds.purged_retention_minutes.saturating_mul(MINUTE_MS);
        self.purged
            .retain(|_, purged_at| now.saturating_sub(*purged_at) < retention);

        expired
    }
}

fn check_len(field: &str, value: &str, max: usize) -> ChatResult<()> {
    let len = value.chars().count();
    if len == 0 || len > max {
        return Err(ChatError::InvalidPayload(format!(
            "{field} must be 1 to {max} characters"
        )));
    }
    Ok(())
}
