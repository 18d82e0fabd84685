//! Errors surfaced by the messaging engine.

use parley_protocol::{EventScope, ProtocolError, RoomId, ServerEvent};
use thiserror::Error;

use crate::store::StoreError;

/// Engine errors.
///
/// Everything except [`ChatError::Unavailable`] is a caller mistake and is
/// reported only to the originating connection.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChatError {
    /// Missing or unresolvable identity.
    #[error("Unauthorized")]
    Unauthorized,

    /// The intent is malformed or out of bounds.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// Neither a body nor an image was supplied.
    #[error("Message has neither text nor image")]
    EmptyPayload,

    /// A field exceeds its size bound.
    #[error("Payload too large: {len} exceeds {max}")]
    PayloadTooLarge { len: usize, max: usize },

    /// Self-addressed or unknown recipient.
    #[error("Invalid recipient")]
    InvalidRecipient,

    /// The caller has not joined the room.
    #[error("Not a member of room {0}")]
    NotAMember(RoomId),

    /// The room is at capacity.
    #[error("Room {0} is full")]
    RoomFull(RoomId),

    /// The room is past its expiry.
    #[error("Room {0} has expired")]
    RoomExpired(RoomId),

    /// No such room.
    #[error("Room {0} not found")]
    RoomNotFound(RoomId),

    /// Persistence is down; the caller should resubmit.
    #[error("Service unavailable: {0}")]
    Unavailable(String),
}

impl ChatError {
    /// Stable machine-readable code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            ChatError::Unauthorized => "UNAUTHORIZED",
            ChatError::InvalidPayload(_) => "INVALID_PAYLOAD",
            ChatError::EmptyPayload => "EMPTY_PAYLOAD",
            ChatError::PayloadTooLarge { .. } => "PAYLOAD_TOO_LARGE",
            ChatError::InvalidRecipient => "INVALID_RECIPIENT",
            ChatError::NotAMember(_) => "NOT_A_MEMBER",
            ChatError::RoomFull(_) => "ROOM_FULL",
            ChatError::RoomExpired(_) => "ROOM_EXPIRED",
            ChatError::RoomNotFound(_) => "ROOM_NOT_FOUND",
            ChatError::Unavailable(_) => "UNAVAILABLE",
        }
    }

    /// Whether resubmitting the same intent may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, ChatError::Unavailable(_))
    }

    /// The room the error refers to, if any.
    #[must_use]
    pub fn room_id(&self) -> Option<RoomId> {
        match self {
            ChatError::NotAMember(id)
            | ChatError::RoomFull(id)
            | ChatError::RoomExpired(id)
            | ChatError::RoomNotFound(id) => Some(*id),
            _ => None,
        }
    }

    /// Build the error event for the originating connection.
    #[must_use]
    pub fn to_event(&self, scope: EventScope, room_id: Option<RoomId>) -> ServerEvent {
        ServerEvent::scoped_error(scope, self.room_id().or(room_id), self.code(), self.to_string())
    }
}

impl From<StoreError> for ChatError {
    fn from(err: StoreError) -> Self {
        ChatError::Unavailable(err.to_string())
    }
}

impl From<ProtocolError> for ChatError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::FrameTooLarge(len) => ChatError::PayloadTooLarge {
                len,
                max: parley_protocol::codec::MAX_FRAME_SIZE,
            },
            other => ChatError::InvalidPayload(other.to_string()),
        }
    }
}

/// Engine result alias.
pub type ChatResult<T> = Result<T, ChatError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_unavailable_is_retryable() {
        assert!(ChatError::Unavailable("db down".into()).is_retryable());
        assert!(!ChatError::RoomFull(1).is_retryable());
        assert!(!ChatError::EmptyPayload.is_retryable());
    }

    #[test]
    fn test_room_error_event_carries_room() {
        let event = ChatError::RoomFull(9).to_event(EventScope::Room, None);
        match event {
            ServerEvent::RoomError(err) => {
                assert_eq!(err.room_id, Some(9));
                assert_eq!(err.code, "ROOM_FULL");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_store_errors_become_unavailable() {
        let err: ChatError = StoreError::Unavailable("connection refused".into()).into();
        assert_eq!(err.code(), "UNAVAILABLE");
        assert!(err.is_retryable());
    }
}
