//! Shared fixtures for the Parley benchmarks.

use parley_core::{ConnectionLease, CreateRoom, Engine, EventReceiver};
use parley_protocol::events::SendDirect;
use parley_protocol::{RoomId, UserId};

/// Build a runtime for driving async engine calls from criterion.
///
/// # Panics
///
/// Panics if the runtime cannot be created.
#[must_use]
pub fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build tokio runtime")
}

/// An engine with `users` connected users, one connection each.
///
/// # Panics
///
/// Panics if a fixture user cannot be authenticated.
pub async fn connected_engine(users: usize) -> (Engine, Vec<ConnectionLease>) {
    let engine = Engine::builder().build();
    let mut leases = Vec::with_capacity(users);
    for i in 0..users {
        let user = engine
            .authenticate(&format!("bench-user-{i}"))
            .await
            .expect("passthrough auth accepts any subject");
        leases.push(engine.open_connection(user).await);
    }
    (engine, leases)
}

/// A room of capacity `members` joined by every lease.
///
/// # Panics
///
/// Panics if the room cannot be created or joined.
pub async fn crowded_room(engine: &Engine, leases: &[ConnectionLease]) -> RoomId {
    let creator = leases[0].session.user_id();
    let room = engine
        .rooms()
        .create(
            creator,
            CreateRoom {
                title: "bench".into(),
                category: "load".into(),
                duration_minutes: engine.rooms().bounds().max_duration_minutes,
                max_users: engine.rooms().bounds().max_max_users,
            },
        )
        .await
        .expect("bench room");
    for lease in leases {
        engine
            .rooms()
            .join(lease.session.user_id(), lease.session.connection_id(), room.id)
            .await
            .expect("bench join");
    }
    room.id
}

/// A direct message request with a body of `len` bytes.
#[must_use]
pub fn direct_to(recipient: UserId, len: usize) -> SendDirect {
    SendDirect {
        recipient_user_id: recipient,
        body: Some("x".repeat(len)),
        image_url: None,
    }
}

/// Discard everything queued for a connection.
pub fn drain(events: &mut EventReceiver) -> usize {
    let mut n = 0;
    while events.try_recv().is_ok() {
        n += 1;
    }
    n
}
