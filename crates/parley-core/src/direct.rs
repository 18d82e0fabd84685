//! Direct (1:1) message channel.
//!
//! Sends are persisted with status `sent`, fanned out to the recipient and
//! echoed to the sender's own connections. Status moves forward only:
//! `sent → delivered` once a recipient connection accepted the message (or
//! on the recipient's next connect), `→ read` on an explicit `dm:read`.

use parley_protocol::events::{SendDirect, StatusUpdate, TypingNotice};
use parley_protocol::{ConversationId, DirectMessage, MessageId, MessageStatus, ServerEvent, UserId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::{ChatError, ChatResult};
use crate::hub::Hub;
use crate::locks::KeyedLocks;
use crate::presence::PresenceRegistry;
use crate::store::{DirectDraft, MessageStore};
use crate::typing::{TypingBus, TypingKey};

/// Bounds applied to direct-message intents.
#[derive(Debug, Clone)]
pub struct MessageLimits {
    /// Longest body, in characters.
    pub max_body_chars: usize,
    /// Longest image URL, in bytes.
    pub max_image_url_len: usize,
    /// Most ids accepted by one `dm:read`.
    pub max_read_batch: usize,
    /// Largest page size for history.
    pub max_page_limit: u32,
}

impl Default for MessageLimits {
    fn default() -> Self {
        Self {
            max_body_chars: 2_000,
            max_image_url_len: 2_048,
            max_read_batch: 500,
            max_page_limit: 100,
        }
    }
}

/// A history page request.
///
/// Page 1 holds the newest `limit` messages. `before` pins the page
/// boundaries to message ids so messages sent while a client pages back do
/// not shift older pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct PageQuery {
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub before: Option<MessageId>,
}

fn default_page() -> u32 {
    1
}

fn default_limit() -> u32 {
    20
}

impl Default for PageQuery {
    fn default() -> Self {
        Self {
            page: default_page(),
            limit: default_limit(),
            before: None,
        }
    }
}

impl PageQuery {
    #[must_use]
    pub fn new(page: u32, limit: u32) -> Self {
        Self {
            page,
            limit,
            before: None,
        }
    }

    #[must_use]
    pub fn before(mut self, id: MessageId) -> Self {
        self.before = Some(id);
        self
    }
}

/// One page of conversation history, oldest first.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePage {
    pub data: Vec<DirectMessage>,
    pub has_more: bool,
    pub page: u32,
    pub limit: u32,
    /// Anchor the page was cut from. Passing it back with the following
    /// page numbers keeps every page fixed while new messages arrive.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<MessageId>,
}

/// The direct message channel.
#[derive(Clone)]
pub struct DirectChannel {
    store: Arc<dyn MessageStore>,
    hub: Arc<Hub>,
    presence: Arc<PresenceRegistry>,
    typing: Arc<TypingBus>,
    locks: Arc<KeyedLocks<ConversationId>>,
    clock: Arc<dyn Clock>,
    limits: MessageLimits,
}

impl DirectChannel {
    #[must_use]
    pub fn new(
        store: Arc<dyn MessageStore>,
        hub: Arc<Hub>,
        presence: Arc<PresenceRegistry>,
        typing: Arc<TypingBus>,
        clock: Arc<dyn Clock>,
        limits: MessageLimits,
    ) -> Self {
        Self {
            store,
            hub,
            presence,
            typing,
            locks: Arc::new(KeyedLocks::new()),
            clock,
            limits,
        }
    }

    #[must_use]
    pub fn limits(&self) -> &MessageLimits {
        &self.limits
    }

    /// Send a direct message.
    ///
    /// Returns once the message is persisted and queued for every live
    /// connection of both participants. The `delivered` step runs after.
    ///
    /// # Errors
    ///
    /// `InvalidRecipient`, `EmptyPayload`, `PayloadTooLarge`,
    /// `InvalidPayload`, or `Unavailable` if the store is down.
    pub async fn send(&self, sender: UserId, request: SendDirect) -> ChatResult<DirectMessage> {
        let recipient = request.recipient_user_id;
        if recipient == sender {
            return Err(ChatError::InvalidRecipient);
        }

        let body = request
            .body
            .map(|b| b.trim().to_string())
            .filter(|b| !b.is_empty());
        let image_url = request
            .image_url
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty());

        if body.is_none() && image_url.is_none() {
            return Err(ChatError::EmptyPayload);
        }
        if let Some(body) = &body {
            let len = body.chars().count();
            if len > self.limits.max_body_chars {
                return Err(ChatError::PayloadTooLarge {
                    len,
                    max: self.limits.max_body_chars,
                });
            }
        }
        if let Some(url) = &image_url {
            validate_image_url(url, self.limits.max_image_url_len)?;
        }

        if self.store.user(recipient).await?.is_none() {
            return Err(ChatError::InvalidRecipient);
        }

        let conversation = ConversationId::between(sender, recipient);
        let (message, reached) = {
            let _turn = self.locks.lock(&conversation).await;
            let message = self
                .store
                .insert_direct_message(DirectDraft {
                    sender,
                    recipient,
                    body,
                    image_url,
                    created_at: self.clock.now_millis(),
                })
                .await?;

            let event = Arc::new(ServerEvent::DmMessage(message.clone()));
            let reached = self
                .hub
                .fan_out(&self.presence.connections(recipient), Arc::clone(&event));
            self.hub.fan_out(&self.presence.connections(sender), event);
            (message, reached)
        };

        debug!(
            conversation = %conversation,
            message = message.id,
            recipient_connections = reached,
            "Direct message accepted"
        );

        if self.typing.set(TypingKey::Direct { sender, recipient }, false) {
            self.notify_typing(sender, recipient, false);
        }

        if reached > 0 {
            self.spawn_delivered(&message);
        }

        Ok(message)
    }

    fn spawn_delivered(&self, message: &DirectMessage) {
        let channel = self.clone();
        let conversation = message.conversation_id;
        let author = message.sender_user_id;
        let reader = message.recipient_user_id;
        let id = message.id;

        tokio::spawn(async move {
            if let Err(e) = channel
                .advance(conversation, author, reader, &[id], MessageStatus::Delivered, false)
                .await
            {
                warn!(message = id, error = %e, "Failed to record delivery");
            }
        });
    }

    /// Mark messages from `counterpart` as read by `reader`.
    ///
    /// Returns the ids that changed. Ids that do not belong to the
    /// conversation, were not addressed to `reader`, or are already read
    /// are ignored.
    ///
    /// # Errors
    ///
    /// `InvalidRecipient`, `PayloadTooLarge`, or `Unavailable`.
    pub async fn mark_read(
        &self,
        reader: UserId,
        ids: &[MessageId],
        counterpart: UserId,
    ) -> ChatResult<Vec<MessageId>> {
        if counterpart == reader {
            return Err(ChatError::InvalidRecipient);
        }
        if ids.len() > self.limits.max_read_batch {
            return Err(ChatError::PayloadTooLarge {
                len: ids.len(),
                max: self.limits.max_read_batch,
            });
        }
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let conversation = ConversationId::between(reader, counterpart);
        self.advance(conversation, counterpart, reader, ids, MessageStatus::Read, true)
            .await
    }

    /// Advance status and tell the conversation about it.
    ///
    /// Runs under the conversation lock so status updates reach clients in
    /// the order they were applied.
    async fn advance(
        &self,
        conversation: ConversationId,
        author: UserId,
        reader: UserId,
        ids: &[MessageId],
        status: MessageStatus,
        echo_to_reader: bool,
    ) -> ChatResult<Vec<MessageId>> {
        let _turn = self.locks.lock(&conversation).await;
        let changed = self
            .store
            .advance_direct_status(conversation, reader, ids, status)
            .await?;

        if !changed.is_empty() {
            let event = Arc::new(ServerEvent::DmStatusUpdate(StatusUpdate {
                message_ids: changed.clone(),
                status,
                conversation_id: conversation,
            }));
            self.hub
                .fan_out(&self.presence.connections(author), Arc::clone(&event));
            if echo_to_reader {
                self.hub.fan_out(&self.presence.connections(reader), event);
            }
            debug!(
                conversation = %conversation,
                status = %status,
                count = changed.len(),
                "Direct message status advanced"
            );
        }

        Ok(changed)
    }

    /// Mark everything still `sent` to `recipient` as delivered.
    ///
    /// Called when the recipient connects. Returns the number of messages
    /// that changed.
    ///
    /// # Errors
    ///
    /// `Unavailable` if the store is down.
    pub async fn deliver_pending(&self, recipient: UserId) -> ChatResult<usize> {
        let pending = self.store.undelivered_direct_messages(recipient).await?;
        let mut by_sender: BTreeMap<UserId, Vec<MessageId>> = BTreeMap::new();
        for message in pending {
            by_sender
                .entry(message.sender_user_id)
                .or_default()
                .push(message.id);
        }

        let mut total = 0;
        for (sender, ids) in by_sender {
            let conversation = ConversationId::between(sender, recipient);
            total += self
                .advance(conversation, sender, recipient, &ids, MessageStatus::Delivered, false)
                .await?
                .len();
        }
        Ok(total)
    }

    /// One page of a conversation's history.
    ///
    /// Without a `before` anchor, page 1 is cut from the newest message and
    /// returns the anchor it used; later pages are offsets from that anchor.
    ///
    /// # Errors
    ///
    /// `InvalidRecipient`, `InvalidPayload` for out-of-range paging, or
    /// `Unavailable`.
    pub async fn list_page(
        &self,
        user: UserId,
        counterpart: UserId,
        query: PageQuery,
    ) -> ChatResult<MessagePage> {
        if counterpart == user {
            return Err(ChatError::InvalidRecipient);
        }
        if query.page == 0 {
            return Err(ChatError::InvalidPayload("page starts at 1".into()));
        }
        if query.limit == 0 || query.limit > self.limits.max_page_limit {
            return Err(ChatError::InvalidPayload(format!(
                "limit must be between 1 and {}",
                self.limits.max_page_limit
            )));
        }

        let limit = query.limit as usize;
        let skip = (query.page as usize - 1).saturating_mul(limit);
        let conversation = ConversationId::between(user, counterpart);
        let mut data = self
            .store
            .direct_messages(conversation, query.before, skip, limit + 1)
            .await?;

        let has_more = data.len() > limit;
        data.truncate(limit);
        let before = match query.before {
            Some(anchor) => Some(anchor),
            None if query.page == 1 => data.first().map(|m| m.id + 1),
            None => None,
        };
        data.reverse();

        Ok(MessagePage {
            data,
            has_more,
            page: query.page,
            limit: query.limit,
            before,
        })
    }

    /// Record and forward a typing signal.
    ///
    /// # Errors
    ///
    /// `InvalidRecipient` for self-addressed signals.
    pub fn set_typing(&self, sender: UserId, recipient: UserId, is_typing: bool) -> ChatResult<()> {
        if sender == recipient {
            return Err(ChatError::InvalidRecipient);
        }
        self.typing
            .set(TypingKey::Direct { sender, recipient }, is_typing);
        self.notify_typing(sender, recipient, is_typing);
        Ok(())
    }

    pub(crate) fn notify_typing(&self, sender: UserId, recipient: UserId, is_typing: bool) -> usize {
        let event = Arc::new(ServerEvent::DmTyping(TypingNotice {
            sender_user_id: sender,
            is_typing,
        }));
        self.hub.fan_out(&self.presence.connections(recipient), event)
    }

    /// Forget idle conversation locks.
    pub fn prune_locks(&self) -> usize {
        self.locks.prune()
    }
}

fn validate_image_url(url: &str, max_len: usize) -> ChatResult<()> {
    if url.len() > max_len {
        return Err(ChatError::PayloadTooLarge {
            len: url.len(),
            max: max_len,
        });
    }
    if !(url.starts_with("https://") || url.starts_with("http://")) {
        return Err(ChatError::InvalidPayload(
            "imageUrl must be an http(s) URL".into(),
        ));
    }
    if url.chars().any(char::is_whitespace) {
        return Err(ChatError::InvalidPayload(
            "imageUrl must not contain whitespace".into(),
        ));
    }
    Ok(())
}
