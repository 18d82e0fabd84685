//! Records shared by the engine, the wire and the HTTP surface.
//!
//! Every type serializes with camelCase field names. Timestamps are
//! milliseconds since the Unix epoch.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Internal numeric user identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub u64);

/// Direct message identifier.
pub type MessageId = u64;

/// Topic room identifier.
pub type RoomId = u64;

/// Room message identifier.
pub type RoomMessageId = u64;

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for UserId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Canonical identifier of a 1:1 conversation.
///
/// The lower user id always comes first, so `(a, b)` and `(b, a)` are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ConversationId {
    low: UserId,
    high: UserId,
}

impl ConversationId {
    /// Build the conversation id for two participants.
    #[must_use]
    pub fn between(a: UserId, b: UserId) -> Self {
        if a <= b {
            Self { low: a, high: b }
        } else {
            Self { low: b, high: a }
        }
    }

    /// Both participants, lower id first.
    #[must_use]
    pub fn participants(&self) -> (UserId, UserId) {
        (self.low, self.high)
    }

    /// Check if a user takes part in this conversation.
    #[must_use]
    pub fn includes(&self, user: UserId) -> bool {
        self.low == user || self.high == user
    }

    /// The participant that is not `user`, if `user` takes part at all.
    #[must_use]
    pub fn counterpart(&self, user: UserId) -> Option<UserId> {
        if self.low == user {
            Some(self.high)
        } else if self.high == user {
            Some(self.low)
        } else {
            None
        }
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.low, self.high)
    }
}

impl From<ConversationId> for String {
    fn from(id: ConversationId) -> String {
        id.to_string()
    }
}

impl TryFrom<String> for ConversationId {
    type Error = &'static str;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let (a, b) = value
            .split_once(':')
            .ok_or("Conversation id must look like <low>:<high>")?;
        let a = a.parse::<u64>().map_err(|_| "Invalid conversation participant")?;
        let b = b.parse::<u64>().map_err(|_| "Invalid conversation participant")?;
        Ok(Self::between(UserId(a), UserId(b)))
    }
}

/// Delivery status of a direct message.
///
/// Ordered: `Sent < Delivered < Read`. Status only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sent,
    Delivered,
    Read,
}

impl MessageStatus {
    fn rank(self) -> u8 {
        match self {
            MessageStatus::Sent => 0,
            MessageStatus::Delivered => 1,
            MessageStatus::Read => 2,
        }
    }

    /// Check if moving from `self` to `next` is a forward step.
    #[must_use]
    pub fn can_advance_to(self, next: MessageStatus) -> bool {
        next.rank() > self.rank()
    }
}

impl PartialOrd for MessageStatus {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MessageStatus {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Read => "read",
        };
        f.write_str(s)
    }
}

/// An internal user bound to an external identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    /// Opaque subject issued by the identity provider.
    pub external_ref: String,
    pub display_name: Option<String>,
    pub handle: Option<String>,
    pub avatar_url: Option<String>,
    pub created_at: u64,
}

impl User {
    /// The short form attached to room messages.
    #[must_use]
    pub fn summary(&self) -> UserSummary {
        UserSummary {
            id: self.id,
            display_name: self.display_name.clone(),
            avatar_url: self.avatar_url.clone(),
        }
    }
}

/// Display data of a message author.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub id: UserId,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
}

/// A message in a 1:1 conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectMessage {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_user_id: UserId,
    pub recipient_user_id: UserId,
    pub body: Option<String>,
    pub image_url: Option<String>,
    pub status: MessageStatus,
    pub created_at: u64,
}

/// An ephemeral, capacity-bounded topic room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicRoom {
    pub id: RoomId,
    pub title: String,
    pub category: String,
    pub creator_id: UserId,
    pub max_users: u32,
    /// Live member count; not persisted.
    #[serde(default)]
    pub participant_count: u32,
    pub created_at: u64,
    pub expires_at: u64,
}

impl TopicRoom {
    /// Check if the room has expired at the given time.
    #[must_use]
    pub fn is_expired_at(&self, now: u64) -> bool {
        now >= self.expires_at
    }
}

/// A message posted to a topic room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomMessage {
    pub id: RoomMessageId,
    pub room_id: RoomId,
    pub user_id: UserId,
    pub content: String,
    pub created_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<UserSummary>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversation_id_is_canonical() {
        let ab = ConversationId::between(UserId(7), UserId(3));
        let ba = ConversationId::between(UserId(3), UserId(7));
        assert_eq!(ab, ba);
        assert_eq!(ab.to_string(), "3:7");
        assert_eq!(ab.counterpart(UserId(3)), Some(UserId(7)));
        assert_eq!(ab.counterpart(UserId(9)), None);
    }

    #[test]
    fn test_conversation_id_serializes_as_string() {
        let id = ConversationId::between(UserId(2), UserId(1));
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"1:2\"");

        let parsed: ConversationId = serde_json::from_str("\"2:1\"").unwrap();
        assert_eq!(parsed, id);
        assert!(serde_json::from_str::<ConversationId>("\"12\"").is_err());
    }

    #[test]
    fn test_status_only_advances() {
        assert!(MessageStatus::Sent.can_advance_to(MessageStatus::Delivered));
        assert!(MessageStatus::Sent.can_advance_to(MessageStatus::Read));
        assert!(!MessageStatus::Read.can_advance_to(MessageStatus::Delivered));
        assert!(!MessageStatus::Delivered.can_advance_to(MessageStatus::Delivered));
        assert!(MessageStatus::Sent < MessageStatus::Read);
    }

    #[test]
    fn test_direct_message_field_names() {
        let msg = DirectMessage {
            id: 1,
            conversation_id: ConversationId::between(UserId(1), UserId(2)),
            sender_user_id: UserId(1),
            recipient_user_id: UserId(2),
            body: Some("hi".into()),
            image_url: None,
            status: MessageStatus::Sent,
            created_at: 10,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["senderUserId"], 1);
        assert_eq!(value["conversationId"], "1:2");
        assert_eq!(value["status"], "sent");
        assert!(value["imageUrl"].is_null());
    }
}
