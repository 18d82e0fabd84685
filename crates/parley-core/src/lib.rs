//! # parley-core
//!
//! The real-time messaging engine behind Parley.
//!
//! - **Gateway** - authenticate connections and bind them to users
//! - **Presence** - online/offline across many connections per user
//! - **Direct** - 1:1 messages with `sent → delivered → read` status
//! - **Room** - capacity-bounded topic rooms that expire
//! - **Typing** - ephemeral typing indicators with idle expiry
//! - **Dispatch** - intent routing and scoped error reporting
//! - **Hub** - bounded per-connection outbound queues
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Connection │────▶│  Dispatch   │────▶│ Direct/Room │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        ▲                                   │       │
//!        │            ┌─────────────┐        │       ▼
//!        └────────────│     Hub     │◀───────┘  ┌─────────┐
//!                     └─────────────┘           │  Store  │
//!                            ▲                  └─────────┘
//!                     ┌─────────────┐
//!                     │  Presence   │
//!                     └─────────────┘
//! ```

pub mod clock;
pub mod direct;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod hub;
pub mod identity;
pub mod locks;
pub mod presence;
pub mod room;
pub mod store;
pub mod typing;

pub use clock::{Clock, ManualClock, SystemClock};
pub use direct::{DirectChannel, MessageLimits, MessagePage, PageQuery};
pub use engine::{Engine, EngineBuilder, EngineConfig, EngineStats, SweepReport};
pub use error::{ChatError, ChatResult};
pub use gateway::{ConnectionLease, Session};
pub use hub::{ConnectionId, EventReceiver, Hub, HubStats};
pub use identity::{
    ConversationAudience, IdentityResolver, PassthroughResolver, PresenceAudience,
    StaticAudience, StaticTokenResolver,
};
pub use presence::{PresenceChange, PresenceRegistry, PresenceSnapshot};
pub use room::{CreateRoom, RoomBounds, RoomChannel, RoomFilter};
pub use store::{ExternalIdentity, InMemoryStore, MessageStore, StoreError};
pub use typing::{TypingBus, TypingKey};
