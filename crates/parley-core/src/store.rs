//! Persistence boundary.
//!
//! The engine only specifies what is written and read; the storage engine
//! behind [`MessageStore`] is an external concern. [`InMemoryStore`] is the
//! built-in implementation used by the server and the tests.

use async_trait::async_trait;
use dashmap::DashMap;
use parley_protocol::{
    ConversationId, DirectMessage, MessageId, MessageStatus, RoomId, RoomMessage, TopicRoom, User,
    UserId,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

use crate::clock::Clock;

/// Store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The backing store cannot be reached. Writes were not applied.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Identity as reported by the identity provider.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExternalIdentity {
    /// Stable subject of the provider.
    pub subject: String,
    pub display_name: Option<String>,
    pub handle: Option<String>,
    pub avatar_url: Option<String>,
}

impl ExternalIdentity {
    #[must_use]
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            ..Self::default()
        }
    }
}

/// A direct message before it has an id.
#[derive(Debug, Clone)]
pub struct DirectDraft {
    pub sender: UserId,
    pub recipient: UserId,
    pub body: Option<String>,
    pub image_url: Option<String>,
    pub created_at: u64,
}

/// A room before it has an id.
#[derive(Debug, Clone)]
pub struct RoomDraft {
    pub title: String,
    pub category: String,
    pub creator: UserId,
    pub max_users: u32,
    pub created_at: u64,
    pub expires_at: u64,
}

/// A room message before it has an id.
#[derive(Debug, Clone)]
pub struct RoomMessageDraft {
    pub room_id: RoomId,
    pub user_id: UserId,
    pub content: String,
    pub created_at: u64,
}

/// Storage used by the engine.
///
/// Appends to unrelated conversations/rooms must be safe to run
/// concurrently. Message ids increase in insertion order within a
/// conversation or room.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Find the user bound to an external subject, creating it on first sight.
    async fn upsert_user(&self, identity: &ExternalIdentity) -> StoreResult<User>;

    async fn user(&self, id: UserId) -> StoreResult<Option<User>>;

    /// Append a direct message with status `sent`.
    async fn insert_direct_message(&self, draft: DirectDraft) -> StoreResult<DirectMessage>;

    /// Move messages addressed to `recipient` in `conversation` forward to
    /// `status`. Messages already at or past `status`, or not matching, are
    /// left alone. Returns the ids that changed.
    async fn advance_direct_status(
        &self,
        conversation: ConversationId,
        recipient: UserId,
        ids: &[MessageId],
        status: MessageStatus,
    ) -> StoreResult<Vec<MessageId>>;

    /// Messages of a conversation, newest first, optionally only those with
    /// an id below `before`, skipping `skip` and returning at most `take`.
    async fn direct_messages(
        &self,
        conversation: ConversationId,
        before: Option<MessageId>,
        skip: usize,
        take: usize,
    ) -> StoreResult<Vec<DirectMessage>>;

    /// Messages addressed to `recipient` still in status `sent`.
    async fn undelivered_direct_messages(&self, recipient: UserId)
        -> StoreResult<Vec<DirectMessage>>;

    /// Users `user` has exchanged direct messages with.
    async fn conversation_partners(&self, user: UserId) -> StoreResult<Vec<UserId>>;

    async fn insert_room(&self, draft: RoomDraft) -> StoreResult<TopicRoom>;

    async fn room(&self, id: RoomId) -> StoreResult<Option<TopicRoom>>;

    async fn rooms(&self) -> StoreResult<Vec<TopicRoom>>;

    async fn add_participant(&self, room: RoomId, user: UserId, joined_at: u64)
        -> StoreResult<()>;

    async fn remove_participant(&self, room: RoomId, user: UserId) -> StoreResult<()>;

    /// Drop a room with its participants and messages.
    async fn delete_room(&self, room: RoomId) -> StoreResult<()>;

    async fn insert_room_message(&self, draft: RoomMessageDraft) -> StoreResult<RoomMessage>;

    /// The newest `take` messages of a room, oldest first.
    async fn room_messages(&self, room: RoomId, take: usize) -> StoreResult<Vec<RoomMessage>>;
}

/// In-process store.
///
/// Each conversation and room log sits behind its own map entry, so appends
/// to different logs never wait on each other.
pub struct InMemoryStore {
    users: DashMap<UserId, User>,
    users_by_subject: DashMap<String, UserId>,
    conversations: DashMap<ConversationId, Vec<DirectMessage>>,
    rooms: DashMap<RoomId, TopicRoom>,
    participants: DashMap<RoomId, HashMap<UserId, u64>>,
    room_logs: DashMap<RoomId, Vec<RoomMessage>>,
    next_user: AtomicU64,
    next_message: AtomicU64,
    next_room: AtomicU64,
    next_room_message: AtomicU64,
    available: AtomicBool,
    clock: Arc<dyn Clock>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            users: DashMap::new(),
            users_by_subject: DashMap::new(),
            conversations: DashMap::new(),
            rooms: DashMap::new(),
            participants: DashMap::new(),
            room_logs: DashMap::new(),
            next_user: AtomicU64::new(1),
            next_message: AtomicU64::new(1),
            next_room: AtomicU64::new(1),
            next_room_message: AtomicU64::new(1),
            available: AtomicBool::new(true),
            clock,
        }
    }

    /// Simulate an outage: while unavailable every call fails.
    pub fn set_available(&self, available: bool) {
        if !available {
            warn!("In-memory store switched to unavailable");
        }
        self.available.store(available, Ordering::SeqCst);
    }

    /// Persisted participants of a room.
    #[must_use]
    pub fn participant_ids(&self, room: RoomId) -> Vec<UserId> {
        self.participants
            .get(&room)
            .map(|p| p.keys().copied().collect())
            .unwrap_or_default()
    }

    fn check(&self) -> StoreResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("in-memory store offline".into()))
        }
    }
}

#[async_trait]
impl MessageStore for InMemoryStore {
    async fn upsert_user(&self, identity: &ExternalIdentity) -> StoreResult<User> {
        self.check()?;
        let id = *self
            .users_by_subject
            .entry(identity.subject.clone())
            .or_insert_with(|| {
                let id = UserId(self.next_user.fetch_add(1, Ordering::SeqCst));
                self.users.insert(
                    id,
                    User {
                        id,
                        external_ref: identity.subject.clone(),
                        display_name: identity.display_name.clone(),
                        handle: identity.handle.clone(),
                        avatar_url: identity.avatar_url.clone(),
                        created_at: self.clock.now_millis(),
                    },
                );
                id
            });

        self.users
            .get(&id)
            .map(|u| u.clone())
            .ok_or_else(|| StoreError::Unavailable(format!("user {id} vanished")))
    }

    async fn user(&self, id: UserId) -> StoreResult<Option<User>> {
        self.check()?;
        Ok(self.users.get(&id).map(|u| u.clone()))
    }

    async fn insert_direct_message(&self, draft: DirectDraft) -> StoreResult<DirectMessage> {
        self.check()?;
        let conversation = ConversationId::between(draft.sender, draft.recipient);
        let mut log = self.conversations.entry(conversation).or_default();
        // Id is taken under the entry lock so ids follow log order.
        let message = DirectMessage {
            id: self.next_message.fetch_add(1, Ordering::SeqCst),
            conversation_id: conversation,
            sender_user_id: draft.sender,
            recipient_user_id: draft.recipient,
            body: draft.body,
            image_url: draft.image_url,
            status: MessageStatus::Sent,
            created_at: draft.created_at,
        };
        log.push(message.clone());
        Ok(message)
    }

    async fn advance_direct_status(
        &self,
        conversation: ConversationId,
        recipient: UserId,
        ids: &[MessageId],
        status: MessageStatus,
    ) -> StoreResult<Vec<MessageId>> {
        self.check()?;
        let Some(mut log) = self.conversations.get_mut(&conversation) else {
            return Ok(Vec::new());
        };

        let mut changed = Vec::new();
        for message in log.iter_mut() {
            if message.recipient_user_id == recipient
                && ids.contains(&message.id)
                && message.status.can_advance_to(status)
            {
                message.status = status;
                changed.push(message.id);
            }
        }
        Ok(changed)
    }

    async fn direct_messages(
        &self,
        conversation: ConversationId,
        before: Option<MessageId>,
        skip: usize,
        take: usize,
    ) -> StoreResult<Vec<DirectMessage>> {
        self.check()?;
        let Some(log) = self.conversations.get(&conversation) else {
            return Ok(Vec::new());
        };

        Ok(log
            .iter()
            .rev()
            .filter(|m| before.map_or(true, |b| m.id < b))
            .skip(skip)
            .take(take)
            .cloned()
            .collect())
    }

    async fn undelivered_direct_messages(
        &self,
        recipient: UserId,
    ) -> StoreResult<Vec<DirectMessage>> {
        self.check()?;
        Ok(self
            .conversations
            .iter()
            .filter(|log| log.key().includes(recipient))
            .flat_map(|log| {
                log.value()
                    .iter()
                    .filter(|m| m.recipient_user_id == recipient && m.status == MessageStatus::Sent)
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect())
    }

    async fn conversation_partners(&self, user: UserId) -> StoreResult<Vec<UserId>> {
        self.check()?;
        Ok(self
            .conversations
            .iter()
            .filter_map(|log| log.key().counterpart(user))
            .filter(|partner| *partner != user)
            .collect())
    }

    async fn insert_room(&self, draft: RoomDraft) -> StoreResult<TopicRoom> {
        self.check()?;
        let room = TopicRoom {
            id: self.next_room.fetch_add(1, Ordering::SeqCst),
            title: draft.title,
            category: draft.category,
            creator_id: draft.creator,
            max_users: draft.max_users,
            participant_count: 0,
            created_at: draft.created_at,
            expires_at: draft.expires_at,
        };
        self.rooms.insert(room.id, room.clone());
        Ok(room)
    }

    async fn room(&self, id: RoomId) -> StoreResult<Option<TopicRoom>> {
        self.check()?;
        Ok(self.rooms.get(&id).map(|r| r.clone()))
    }

    async fn rooms(&self) -> StoreResult<Vec<TopicRoom>> {
        self.check()?;
        Ok(self.rooms.iter().map(|r| r.clone()).collect())
    }

    async fn add_participant(
        &self,
        room: RoomId,
        user: UserId,
        joined_at: u64,
    ) -> StoreResult<()> {
        self.check()?;
        self.participants
            .entry(room)
            .or_default()
            .entry(user)
            .or_insert(joined_at);
        Ok(())
    }

    async fn remove_participant(&self, room: RoomId, user: UserId) -> StoreResult<()> {
        self.check()?;
        if let Some(mut members) = self.participants.get_mut(&room) {
            members.remove(&user);
        }
        Ok(())
    }

    async fn delete_room(&self, room: RoomId) -> StoreResult<()> {
        self.check()?;
        self.participants.remove(&room);
        self.room_logs.remove(&room);
        self.rooms.remove(&room);
        Ok(())
    }

    async fn insert_room_message(&self, draft: RoomMessageDraft) -> StoreResult<RoomMessage> {
        self.check()?;
        let mut log = self.room_logs.entry(draft.room_id).or_default();
        let message = RoomMessage {
            id: self.next_room_message.fetch_add(1, Ordering::SeqCst),
            room_id: draft.room_id,
            user_id: draft.user_id,
            content: draft.content,
            created_at: draft.created_at,
            sender: None,
        };
        log.push(message.clone());
        Ok(message)
    }

    async fn room_messages(&self, room: RoomId, take: usize) -> StoreResult<Vec<RoomMessage>> {
        self.check()?;
        let Some(log) = self.room_logs.get(&room) else {
            return Ok(Vec::new());
        };
        let start = log.len().saturating_sub(take);
        Ok(log[start..].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn store() -> InMemoryStore {
        InMemoryStore::new(Arc::new(ManualClock::new(100)))
    }

    fn draft(sender: u64, recipient: u64) -> DirectDraft {
        DirectDraft {
            sender: UserId(sender),
            recipient: UserId(recipient),
            body: Some("hi".into()),
            image_url: None,
            created_at: 100,
        }
    }

    #[tokio::test]
    async fn test_upsert_user_is_stable() {
        let store = store();
        let first = store.upsert_user(&ExternalIdentity::new("user_abc")).await.unwrap();
        let again = store.upsert_user(&ExternalIdentity::new("user_abc")).await.unwrap();
        let other = store.upsert_user(&ExternalIdentity::new("user_xyz")).await.unwrap();

        assert_eq!(first.id, again.id);
        assert_ne!(first.id, other.id);
        assert_eq!(first.external_ref, "user_abc");
    }

    #[tokio::test]
    async fn test_status_never_regresses() {
        let store = store();
        let msg = store.insert_direct_message(draft(1, 2)).await.unwrap();
        let conv = msg.conversation_id;

        let read = store
            .advance_direct_status(conv, UserId(2), &[msg.id], MessageStatus::Read)
            .await
            .unwrap();
        assert_eq!(read, vec![msg.id]);

        let delivered = store
            .advance_direct_status(conv, UserId(2), &[msg.id], MessageStatus::Delivered)
            .await
            .unwrap();
        assert!(delivered.is_empty());

        let page = store.direct_messages(conv, None, 0, 10).await.unwrap();
        assert_eq!(page[0].status, MessageStatus::Read);
    }

    #[tokio::test]
    async fn test_status_only_for_recipient() {
        let store = store();
        let msg = store.insert_direct_message(draft(1, 2)).await.unwrap();

        // The sender cannot mark their own message.
        let changed = store
            .advance_direct_status(msg.conversation_id, UserId(1), &[msg.id], MessageStatus::Read)
            .await
            .unwrap();
        assert!(changed.is_empty());
    }

    #[tokio::test]
    async fn test_direct_messages_newest_first_with_cursor() {
        let store = store();
        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(store.insert_direct_message(draft(1, 2)).await.unwrap().id);
        }
        let conv = ConversationId::between(UserId(2), UserId(1));

        let newest: Vec<_> = store
            .direct_messages(conv, None, 0, 2)
            .await
            .unwrap()
            .iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(newest, vec![ids[4], ids[3]]);

        let before: Vec<_> = store
            .direct_messages(conv, Some(ids[2]), 0, 10)
            .await
            .unwrap()
            .iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(before, vec![ids[1], ids[0]]);
    }

    #[tokio::test]
    async fn test_partners_and_undelivered() {
        let store = store();
        store.insert_direct_message(draft(1, 2)).await.unwrap();
        store.insert_direct_message(draft(3, 1)).await.unwrap();

        let mut partners = store.conversation_partners(UserId(1)).await.unwrap();
        partners.sort();
        assert_eq!(partners, vec![UserId(2), UserId(3)]);

        let pending = store.undelivered_direct_messages(UserId(1)).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].sender_user_id, UserId(3));
    }

    #[tokio::test]
    async fn test_room_messages_tail() {
        let store = store();
        for i in 0..4 {
            store
                .insert_room_message(RoomMessageDraft {
                    room_id: 1,
                    user_id: UserId(1),
                    content: format!("m{i}"),
                    created_at: i,
                })
                .await
                .unwrap();
        }
        let tail = store.room_messages(1, 2).await.unwrap();
        let contents: Vec<_> = tail.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m2", "m3"]);
    }

    #[tokio::test]
    async fn test_unavailable_rejects_writes() {
        let store = store();
        store.set_available(false);
        assert!(matches!(
            store.insert_direct_message(draft(1, 2)).await,
            Err(StoreError::Unavailable(_))
        ));

        store.set_available(true);
        assert!(store.insert_direct_message(draft(1, 2)).await.is_ok());
    }
}
