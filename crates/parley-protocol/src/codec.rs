//! Codec for encoding and decoding Parley event envelopes.
//!
//! Text frames carry the JSON envelope as-is. Binary frames carry a
//! length-prefixed MessagePack encoding of the same envelope.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::events::EventScope;

/// Maximum frame size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Envelope key holding the event name.
pub const EVENT_KEY: &str = "event";

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// Not enough data to decode frame.
    #[error("Incomplete frame: need {0} more bytes")]
    Incomplete(usize),

    /// The frame is not a JSON/MessagePack document at all.
    #[error("Malformed frame: {0}")]
    Malformed(String),

    /// The envelope has no event name.
    #[error("Frame has no event name")]
    MissingEvent,

    /// The event name is known (or at least present) but the payload does not fit it.
    #[error("Invalid payload for {event}: {reason}")]
    InvalidPayload { event: String, reason: String },

    /// JSON encoding error.
    #[error("Encoding error: {0}")]
    Json(#[from] serde_json::Error),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
}

impl ProtocolError {
    /// The event name carried by the rejected frame, if it had one.
    #[must_use]
    pub fn event_name(&self) -> Option<&str> {
        match self {
            ProtocolError::InvalidPayload { event, .. } => Some(event),
            _ => None,
        }
    }

    /// The error scope a rejection should be reported in.
    #[must_use]
    pub fn scope(&self) -> EventScope {
        self.event_name()
            .map(EventScope::of)
            .unwrap_or(EventScope::System)
    }
}

/// Frame encoding used by a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireFormat {
    /// JSON text frames.
    #[default]
    Text,
    /// Length-prefixed MessagePack binary frames.
    Binary,
}

/// Encode an event as a JSON text frame.
///
/// # Errors
///
/// Returns an error if serialization fails or the frame is too large.
pub fn encode_text<T: Serialize>(event: &T) -> Result<String, ProtocolError> {
    let text = serde_json::to_string(event)?;
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }
    Ok(text)
}

/// Decode an event from a JSON text frame.
///
/// # Errors
///
/// Returns an error if the text is not JSON, has no event name, or the
/// payload does not match the event.
pub fn decode_text<T: DeserializeOwned>(text: &str) -> Result<T, ProtocolError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    decode_envelope(value)
}

/// Encode an event to a binary frame.
///
/// The encoded format is:
/// - 4 bytes: Big-endian length prefix
/// - N bytes: MessagePack-encoded envelope
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode_binary<T: Serialize>(event: &T) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    encode_into(event, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode an event into an existing buffer.
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode_into<T: Serialize>(event: &T, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let payload = rmp_serde::to_vec_named(event)?;

    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }

    buf.reserve(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);

    Ok(())
}

/// Decode an event from a complete binary frame.
///
/// # Errors
///
/// Returns an error if the data is incomplete, too large, or invalid.
pub fn decode_binary<T: DeserializeOwned>(data: &[u8]) -> Result<T, ProtocolError> {
    if data.len() < LENGTH_PREFIX_SIZE {
        return Err(ProtocolError::Incomplete(LENGTH_PREFIX_SIZE - data.len()));
    }

    let length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }

    let total_size = LENGTH_PREFIX_SIZE + length;
    if data.len() < total_size {
        return Err(ProtocolError::Incomplete(total_size - data.len()));
    }

    decode_msgpack(&data[LENGTH_PREFIX_SIZE..total_size])
}

/// Try to decode an event from a buffer, advancing it if successful.
///
/// Returns `Ok(Some(event))` if a complete frame was decoded,
/// `Ok(None)` if more data is needed, or `Err` on protocol error. A frame
/// with a bad payload is still consumed so the stream stays aligned.
///
/// # Errors
///
/// Returns an error if the frame is too large or invalid.
pub fn decode_from<T: DeserializeOwned>(buf: &mut BytesMut) -> Result<Option<T>, ProtocolError> {
    if buf.len() < LENGTH_PREFIX_SIZE {
        return Ok(None);
    }

    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }

    let total_size = LENGTH_PREFIX_SIZE + length;
    if buf.len() < total_size {
        return Ok(None);
    }

    buf.advance(LENGTH_PREFIX_SIZE);
    let payload = buf.split_to(length);
    decode_msgpack(&payload).map(Some)
}

fn decode_msgpack<T: DeserializeOwned>(payload: &[u8]) -> Result<T, ProtocolError> {
    let value: Value =
        rmp_serde::from_slice(payload).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    decode_envelope(value)
}

/// Decode an already parsed envelope, keeping the event name on failure.
fn decode_envelope<T: DeserializeOwned>(value: Value) -> Result<T, ProtocolError> {
    let event = match value.get(EVENT_KEY).and_then(Value::as_str) {
        Some(name) => name.to_owned(),
        None => return Err(ProtocolError::MissingEvent),
    };

    serde_json::from_value(value).map_err(|e| ProtocolError::InvalidPayload {
        event,
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ClientEvent, Heartbeat, PostRoomMessage, SendDirect, ServerEvent};
    use crate::types::UserId;

    #[test]
    fn test_text_decode_keeps_event_name_on_bad_payload() {
        let err = decode_text::<ClientEvent>(r#"{"event":"dm:send","data":{"body":"x"}}"#)
            .unwrap_err();
        assert_eq!(err.event_name(), Some("dm:send"));
        assert_eq!(err.scope(), EventScope::Direct);
    }

    #[test]
    fn test_text_decode_unknown_event() {
        let err = decode_text::<ClientEvent>(r#"{"event":"room:explode","data":1}"#).unwrap_err();
        assert_eq!(err.scope(), EventScope::Room);
    }

    #[test]
    fn test_text_decode_malformed() {
        assert!(matches!(
            decode_text::<ClientEvent>("not json"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            decode_text::<ClientEvent>(r#"{"data":1}"#),
            Err(ProtocolError::MissingEvent)
        ));
    }

    #[test]
    fn test_binary_frames_decode_as_text_would() {
        let event = ClientEvent::DmSend(SendDirect {
            recipient_user_id: UserId(9),
            body: Some("hello".into()),
            image_url: None,
        });
        let encoded = encode_binary(&event).unwrap();
        let decoded: ClientEvent = decode_binary(&encoded).unwrap();
        assert_eq!(decoded, event);

        let text = encode_text(&event).unwrap();
        let from_text: ClientEvent = decode_text(&text).unwrap();
        assert_eq!(from_text, decoded);
    }

    #[test]
    fn test_decode_incomplete() {
        let encoded = encode_binary(&ServerEvent::Pong(Heartbeat::default())).unwrap();

        match decode_binary::<ServerEvent>(&encoded[..5]) {
            Err(ProtocolError::Incomplete(_)) => {}
            other => panic!("Expected Incomplete error, got {:?}", other),
        }
    }

    #[test]
    fn test_streaming_decode() {
        let first = ClientEvent::RoomJoin(1);
        let second = ClientEvent::RoomMessage(PostRoomMessage {
            room_id: 1,
            content: "hey".into(),
        });

        let mut buf = BytesMut::new();
        encode_into(&first, &mut buf).unwrap();
        encode_into(&second, &mut buf).unwrap();
        // Partial third frame stays buffered.
        buf.extend_from_slice(&[0, 0, 0, 9, 1]);

        let decoded1: ClientEvent = decode_from(&mut buf).unwrap().unwrap();
        let decoded2: ClientEvent = decode_from(&mut buf).unwrap().unwrap();
        assert_eq!(decoded1, first);
        assert_eq!(decoded2, second);
        assert!(decode_from::<ClientEvent>(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 5);
    }

    #[test]
    fn test_frame_too_large_prefix() {
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_SIZE + 1) as u32);
        assert!(matches!(
            decode_from::<ClientEvent>(&mut buf),
            Err(ProtocolError::FrameTooLarge(_))
        ));
    }
}
