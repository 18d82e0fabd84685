//! # parley-protocol
//!
//! Wire protocol definitions for the Parley real-time messaging engine.
//!
//! This crate defines the records exchanged between clients and the server
//! (direct messages, topic rooms, room messages), the event envelope used on
//! the WebSocket, and the text/binary codecs.
//!
//! ## Event families
//!
//! - `dm:*` - Direct messages, typing, read receipts
//! - `room:*` - Topic room membership, messages, typing
//! - `presence:*` - Online/offline transitions
//! - `ready` / `ping` / `pong` / `error` - Connection lifecycle
//!
//! ## Example
//!
//! ```rust
//! use parley_protocol::{codec, ClientEvent};
//!
//! let event = ClientEvent::RoomJoin(42);
//! let text = codec::encode_text(&event).unwrap();
//! let decoded: ClientEvent = codec::decode_text(&text).unwrap();
//! assert_eq!(decoded, event);
//! ```

pub mod codec;
pub mod events;
pub mod types;
pub mod version;

pub use codec::{ProtocolError, WireFormat};
pub use events::{ClientEvent, EventScope, ServerEvent};
pub use types::{
    ConversationId, DirectMessage, MessageId, MessageStatus, RoomId, RoomMessage, RoomMessageId,
    TopicRoom, User, UserId, UserSummary,
};
pub use version::{Version, PROTOCOL_VERSION};
