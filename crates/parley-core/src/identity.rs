//! Seams to the identity provider and the relationship graph.
//!
//! Token verification and "who cares about this user's presence" are owned
//! by external collaborators; the engine only depends on these traits.

use async_trait::async_trait;
use parley_protocol::UserId;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::error::ChatError;
use crate::store::{ExternalIdentity, MessageStore};

/// Longest token accepted by the built-in resolvers.
pub const MAX_TOKEN_LENGTH: usize = 4096;

/// Turns a caller token into an external identity.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// # Errors
    ///
    /// Returns [`ChatError::Unauthorized`] if the token cannot be resolved.
    async fn resolve(&self, token: &str) -> Result<ExternalIdentity, ChatError>;
}

/// Treats the token as the provider subject itself.
///
/// Suitable for development and for deployments where a gateway in front
/// of the server already verified the caller.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughResolver;

#[async_trait]
impl IdentityResolver for PassthroughResolver {
    async fn resolve(&self, token: &str) -> Result<ExternalIdentity, ChatError> {
        let subject = token.trim();
        if subject.is_empty() || subject.len() > MAX_TOKEN_LENGTH {
            return Err(ChatError::Unauthorized);
        }
        Ok(ExternalIdentity::new(subject))
    }
}

/// Resolves tokens from a fixed table.
#[derive(Debug, Default, Clone)]
pub struct StaticTokenResolver {
    tokens: HashMap<String, ExternalIdentity>,
}

impl StaticTokenResolver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a token for a subject.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>, identity: ExternalIdentity) -> Self {
        self.tokens.insert(token.into(), identity);
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl FromIterator<(String, String)> for StaticTokenResolver {
    /// Build from `token -> subject` pairs.
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            tokens: iter
                .into_iter()
                .map(|(token, subject)| (token, ExternalIdentity::new(subject)))
                .collect(),
        }
    }
}

#[async_trait]
impl IdentityResolver for StaticTokenResolver {
    async fn resolve(&self, token: &str) -> Result<ExternalIdentity, ChatError> {
        match self.tokens.get(token) {
            Some(identity) => Ok(identity.clone()),
            None => {
                debug!("Unknown token presented");
                Err(ChatError::Unauthorized)
            }
        }
    }
}

/// Decides who is told when a user comes online or goes offline.
#[async_trait]
pub trait PresenceAudience: Send + Sync {
    async fn audience(&self, user: UserId) -> Vec<UserId>;
}

/// Everyone the user has a direct conversation with.
pub struct ConversationAudience {
    store: Arc<dyn MessageStore>,
}

impl ConversationAudience {
    #[must_use]
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl PresenceAudience for ConversationAudience {
    async fn audience(&self, user: UserId) -> Vec<UserId> {
        match self.store.conversation_partners(user).await {
            Ok(partners) => partners,
            Err(e) => {
                // Presence is best effort.
                debug!(user = %user, error = %e, "Presence audience unavailable");
                Vec::new()
            }
        }
    }
}

/// A fixed audience, used when the relationship graph lives elsewhere and is
/// pushed in ahead of time.
#[derive(Debug, Default, Clone)]
pub struct StaticAudience {
    watchers: HashMap<UserId, Vec<UserId>>,
}

impl StaticAudience {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Let `watcher` see `user`'s presence.
    #[must_use]
    pub fn with_watcher(mut self, user: UserId, watcher: UserId) -> Self {
        self.watchers.entry(user).or_default().push(watcher);
        self
    }
}

#[async_trait]
impl PresenceAudience for StaticAudience {
    async fn audience(&self, user: UserId) -> Vec<UserId> {
        self.watchers.get(&user).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{DirectDraft, InMemoryStore};

    #[tokio::test]
    async fn test_passthrough_rejects_blank() {
        let resolver = PassthroughResolver;
        assert_eq!(resolver.resolve("   ").await, Err(ChatError::Unauthorized));
        assert_eq!(
            resolver.resolve(" user_1 ").await.unwrap().subject,
            "user_1"
        );
    }

    #[tokio::test]
    async fn test_static_tokens() {
        let resolver: StaticTokenResolver =
            [("secret".to_string(), "user_9".to_string())].into_iter().collect();
        assert_eq!(resolver.resolve("secret").await.unwrap().subject, "user_9");
        assert_eq!(resolver.resolve("guess").await, Err(ChatError::Unauthorized));
    }

    #[tokio::test]
    async fn test_conversation_audience() {
        let store = Arc::new(InMemoryStore::new(Arc::new(ManualClock::new(0))));
        store
            .insert_direct_message(DirectDraft {
                sender: UserId(1),
                recipient: UserId(2),
                body: Some("hey".into()),
                image_url: None,
                created_at: 0,
            })
            .await
            .unwrap();

        let audience = ConversationAudience::new(store.clone());
        assert_eq!(audience.audience(UserId(2)).await, vec![UserId(1)]);

        store.set_available(false);
        assert!(audience.audience(UserId(2)).await.is_empty());
    }
}
