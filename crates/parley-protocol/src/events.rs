//! Event types for the Parley protocol.
//!
//! Every frame is an envelope of an event name and a payload:
//!
//! ```json
//! {"event": "dm:send", "data": {"recipientUserId": 7, "body": "hi"}}
//! ```

use serde::{Deserialize, Serialize};

use crate::types::{
    ConversationId, DirectMessage, MessageId, MessageStatus, RoomId, RoomMessage, UserId,
};

/// Which error event answers a failed intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventScope {
    /// `dm:*` events, answered with `dm:error`.
    Direct,
    /// `room:*` events, answered with `room:error`.
    Room,
    /// Everything else, answered with `error`.
    System,
}

impl EventScope {
    /// Classify an event by name.
    #[must_use]
    pub fn of(event: &str) -> Self {
        if event.starts_with("dm:") {
            EventScope::Direct
        } else if event.starts_with("room:") {
            EventScope::Room
        } else {
            EventScope::System
        }
    }
}

/// `dm:send` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendDirect {
    pub recipient_user_id: UserId,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
}

/// `dm:typing` payload sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectTyping {
    pub recipient_user_id: UserId,
    pub is_typing: bool,
}

/// `dm:read` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkRead {
    pub message_ids: Vec<MessageId>,
    /// Author of the messages being marked.
    pub sender_user_id: UserId,
}

/// `room:message` payload sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostRoomMessage {
    pub room_id: RoomId,
    pub content: String,
}

/// `room:typing` payload sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomTyping {
    pub room_id: RoomId,
    pub is_typing: bool,
}

/// Keepalive payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

/// Intents a client may issue once the connection is ready.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    #[serde(rename = "dm:send")]
    DmSend(SendDirect),

    #[serde(rename = "dm:typing")]
    DmTyping(DirectTyping),

    #[serde(rename = "dm:read")]
    DmRead(MarkRead),

    #[serde(rename = "room:join")]
    RoomJoin(RoomId),

    #[serde(rename = "room:leave")]
    RoomLeave(RoomId),

    #[serde(rename = "room:message")]
    RoomMessage(PostRoomMessage),

    #[serde(rename = "room:typing")]
    RoomTyping(RoomTyping),

    #[serde(rename = "ping")]
    Ping(Option<Heartbeat>),
}

impl ClientEvent {
    /// The wire name of this event.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::DmSend(_) => "dm:send",
            ClientEvent::DmTyping(_) => "dm:typing",
            ClientEvent::DmRead(_) => "dm:read",
            ClientEvent::RoomJoin(_) => "room:join",
            ClientEvent::RoomLeave(_) => "room:leave",
            ClientEvent::RoomMessage(_) => "room:message",
            ClientEvent::RoomTyping(_) => "room:typing",
            ClientEvent::Ping(_) => "ping",
        }
    }

    /// The error scope of this event.
    #[must_use]
    pub fn scope(&self) -> EventScope {
        EventScope::of(self.name())
    }

    /// The room this intent targets, if any.
    #[must_use]
    pub fn room_id(&self) -> Option<RoomId> {
        match self {
            ClientEvent::RoomJoin(id) | ClientEvent::RoomLeave(id) => Some(*id),
            ClientEvent::RoomMessage(m) => Some(m.room_id),
            ClientEvent::RoomTyping(t) => Some(t.room_id),
            _ => None,
        }
    }
}

/// `ready` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ready {
    pub user_id: UserId,
    pub connection_id: String,
}

/// `dm:typing` payload delivered to the recipient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingNotice {
    pub sender_user_id: UserId,
    pub is_typing: bool,
}

/// `dm:status_update` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub message_ids: Vec<MessageId>,
    pub status: MessageStatus,
    pub conversation_id: ConversationId,
}

/// `dm:error` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectError {
    pub error: String,
    pub code: String,
}

/// `room:participant_update` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantUpdate {
    pub room_id: RoomId,
    pub count: u32,
}

/// `room:typing` payload delivered to other members.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomTypingNotice {
    pub room_id: RoomId,
    pub user_id: UserId,
    pub is_typing: bool,
}

/// `room:error` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<RoomId>,
    pub message: String,
    pub code: String,
}

/// `presence:online` / `presence:offline` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceNotice {
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<u64>,
}

/// `error` payload for intents outside the `dm:` and `room:` families.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemError {
    pub message: String,
    pub code: String,
}

/// Events pushed by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "ready")]
    Ready(Ready),

    #[serde(rename = "dm:message")]
    DmMessage(DirectMessage),

    #[serde(rename = "dm:typing")]
    DmTyping(TypingNotice),

    #[serde(rename = "dm:status_update")]
    DmStatusUpdate(StatusUpdate),

    #[serde(rename = "dm:error")]
    DmError(DirectError),

    #[serde(rename = "room:message")]
    RoomMessage(RoomMessage),

    #[serde(rename = "room:participant_update")]
    RoomParticipantUpdate(ParticipantUpdate),

    #[serde(rename = "room:typing")]
    RoomTyping(RoomTypingNotice),

    #[serde(rename = "room:error")]
    RoomError(RoomError),

    #[serde(rename = "presence:online")]
    PresenceOnline(PresenceNotice),

    #[serde(rename = "presence:offline")]
    PresenceOffline(PresenceNotice),

    #[serde(rename = "pong")]
    Pong(Heartbeat),

    #[serde(rename = "error")]
    Error(SystemError),
}

impl ServerEvent {
    /// The wire name of this event.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Ready(_) => "ready",
            ServerEvent::DmMessage(_) => "dm:message",
            ServerEvent::DmTyping(_) => "dm:typing",
            ServerEvent::DmStatusUpdate(_) => "dm:status_update",
            ServerEvent::DmError(_) => "dm:error",
            ServerEvent::RoomMessage(_) => "room:message",
            ServerEvent::RoomParticipantUpdate(_) => "room:participant_update",
            ServerEvent::RoomTyping(_) => "room:typing",
            ServerEvent::RoomError(_) => "room:error",
            ServerEvent::PresenceOnline(_) => "presence:online",
            ServerEvent::PresenceOffline(_) => "presence:offline",
            ServerEvent::Pong(_) => "pong",
            ServerEvent::Error(_) => "error",
        }
    }

    /// Build the error event matching a scope.
    #[must_use]
    pub fn scoped_error(
        scope: EventScope,
        room_id: Option<RoomId>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let code = code.into();
        let message = message.into();
        match scope {
            EventScope::Direct => ServerEvent::DmError(DirectError {
                error: message,
                code,
            }),
            EventScope::Room => ServerEvent::RoomError(RoomError {
                room_id,
                message,
                code,
            }),
            EventScope::System => ServerEvent::Error(SystemError { message, code }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_event_envelope() {
        let event: ClientEvent = serde_json::from_value(json!({
            "event": "dm:send",
            "data": {"recipientUserId": 7, "body": "hello"}
        }))
        .unwrap();

        match event {
            ClientEvent::DmSend(send) => {
                assert_eq!(send.recipient_user_id, UserId(7));
                assert_eq!(send.body.as_deref(), Some("hello"));
                assert!(send.image_url.is_none());
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_room_join_takes_bare_id() {
        let event: ClientEvent =
            serde_json::from_value(json!({"event": "room:join", "data": 12})).unwrap();
        assert_eq!(event, ClientEvent::RoomJoin(12));
        assert_eq!(event.room_id(), Some(12));
        assert_eq!(event.scope(), EventScope::Room);
    }

    #[test]
    fn test_server_event_names_match_wire() {
        let event = ServerEvent::RoomParticipantUpdate(ParticipantUpdate {
            room_id: 3,
            count: 2,
        });
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], event.name());
        assert_eq!(value["data"]["roomId"], 3);
        assert_eq!(value["data"]["count"], 2);
    }

    #[test]
    fn test_scoped_error() {
        let dm = ServerEvent::scoped_error(EventScope::Direct, None, "EMPTY_PAYLOAD", "empty");
        assert_eq!(dm.name(), "dm:error");

        let room = ServerEvent::scoped_error(EventScope::Room, Some(4), "ROOM_FULL", "full");
        let value = serde_json::to_value(&room).unwrap();
        assert_eq!(value["data"]["roomId"], 4);

        let sys = ServerEvent::scoped_error(EventScope::System, None, "INVALID_PAYLOAD", "bad");
        assert_eq!(sys.name(), "error");
    }

    #[test]
    fn test_ping_without_payload() {
        let event: ClientEvent = serde_json::from_value(json!({"event": "ping"})).unwrap();
        assert_eq!(event, ClientEvent::Ping(None));
    }

    #[test]
    fn test_scope_of_unknown_event() {
        assert_eq!(EventScope::of("dm:whatever"), EventScope::Direct);
        assert_eq!(EventScope::of("room:"), EventScope::Room);
        assert_eq!(EventScope::of("test:ping"), EventScope::System);
    }
}
