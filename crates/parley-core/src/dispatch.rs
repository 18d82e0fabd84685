//! Intent routing and error surfacing.
//!
//! Every intent is handled on behalf of one [`Session`]. A rejected intent
//! produces exactly one scoped error event (`dm:error`, `room:error` or
//! `error`) on the originating connection and nothing anywhere else.

use parley_protocol::events::Heartbeat;
use parley_protocol::{ClientEvent, EventScope, ProtocolError, RoomId, ServerEvent};
use std::sync::Arc;
use tracing::{debug, trace};

use crate::engine::Engine;
use crate::error::{ChatError, ChatResult};
use crate::gateway::Session;

impl Engine {
    /// Handle one decoded intent.
    ///
    /// # Errors
    ///
    /// Returns the rejection after it has been reported to the connection.
    pub async fn dispatch(&self, session: &Session, event: ClientEvent) -> ChatResult<()> {
        let name = event.name();
        let scope = event.scope();
        let room_id = event.room_id();
        trace!(connection = %session.connection_id(), event = name, "Dispatching");

        let result = self.route(session, event).await;
        if let Err(err) = &result {
            self.reject(session, err, scope, room_id);
            debug!(
                connection = %session.connection_id(),
                event = name,
                code = err.code(),
                error = %err,
                "Intent rejected"
            );
        }
        result
    }

    /// Handle one inbound frame that may have failed to decode.
    ///
    /// # Errors
    ///
    /// Decode failures are reported like any other rejection.
    pub async fn dispatch_frame(
        &self,
        session: &Session,
        frame: Result<ClientEvent, ProtocolError>,
    ) -> ChatResult<()> {
        match frame {
            Ok(event) => self.dispatch(session, event).await,
            Err(protocol) => {
                let scope = protocol.scope();
                let err = ChatError::from(protocol);
                self.reject(session, &err, scope, None);
                debug!(
                    connection = %session.connection_id(),
                    code = err.code(),
                    error = %err,
                    "Frame rejected"
                );
                Err(err)
            }
        }
    }

    fn reject(&self, session: &Session, err: &ChatError, scope: EventScope, room_id: Option<RoomId>) {
        self.hub.deliver(
            session.connection_id(),
            Arc::new(err.to_event(scope, room_id)),
        );
    }

    async fn route(&self, session: &Session, event: ClientEvent) -> ChatResult<()> {
        let user = session.user_id();
        match event {
            ClientEvent::DmSend(request) => {
                self.direct.send(user, request).await?;
            }
            ClientEvent::DmTyping(typing) => {
                self.direct
                    .set_typing(user, typing.recipient_user_id, typing.is_typing)?;
            }
            ClientEvent::DmRead(read) => {
                self.direct
                    .mark_read(user, &read.message_ids, read.sender_user_id)
                    .await?;
            }
            ClientEvent::RoomJoin(room) => {
                self.rooms.join(user, session.connection_id(), room).await?;
            }
            ClientEvent::RoomLeave(room) => {
                self.rooms.leave(user, room).await?;
            }
            ClientEvent::RoomMessage(post) => {
                self.rooms
                    .post_message(user, post.room_id, &post.content)
                    .await?;
            }
            ClientEvent::RoomTyping(typing) => {
                self.rooms
                    .set_typing(user, typing.room_id, typing.is_typing)
                    .await?;
            }
            ClientEvent::Ping(heartbeat) => {
                let timestamp = heartbeat
                    .and_then(|h| h.timestamp)
                    .unwrap_or_else(|| self.clock.now_millis());
                self.hub.deliver(
                    session.connection_id(),
                    Arc::new(ServerEvent::Pong(Heartbeat {
                        timestamp: Some(timestamp),
                    })),
                );
            }
        }
        Ok(())
    }
}
