//! Session storage interface and the in-memory implementation.

use super::{Message, Session};
use crate::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, trace};

/// Keyed storage for conversation sessions.
///
/// Implementations must make each operation atomic for a given conversation id.
/// Eviction is left to whoever owns the backing storage.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Return a snapshot of the session, creating an empty one on first access
    async fn get_or_create(&self, conversation_id: &str) -> Result<Session>;

    /// Append a message to the session history
    async fn append(&self, conversation_id: &str, message: Message) -> Result<()>;

    /// Remember the most recent image reference for the session
    async fn set_last_image(&self, conversation_id: &str, image_ref: String) -> Result<()>;

    /// Most recent image reference, if any
    async fn get_last_image(&self, conversation_id: &str) -> Result<Option<String>>;

    /// Snapshot of the session history (empty for unknown sessions)
    async fn messages(&self, conversation_id: &str) -> Result<Vec<Message>>;

    /// Number of sessions held (for diagnostics)
    async fn count(&self) -> Result<usize>;
}

/// In-memory implementation of SessionStore.
///
/// DashMap's per-shard locking makes every operation atomic per key, so
/// concurrent writers cannot lose history entries or `last_image` updates.
pub struct InMemorySessionStore {
    sessions: DashMap<String, Session>,
}

impl InMemorySessionStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::new(),
        })
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get_or_create(&self, conversation_id: &str) -> Result<Session> {
        let entry = self
            .sessions
            .entry(conversation_id.to_string())
            .or_insert_with(|| {
                debug!(target: "session_store", conversation_id, "Creating session");
                Session::new(conversation_id)
            });
        Ok(entry.value().clone())
    }

    async fn append(&self, conversation_id: &str, message: Message) -> Result<()> {
        let mut entry = self
            .sessions
            .entry(conversation_id.to_string())
            .or_insert_with(|| Session::new(conversation_id));
        trace!(target: "session_store", conversation_id, role = ?message.role, "Appending message");
        entry.messages.push(message);
        Ok(())
    }

    async fn set_last_image(&self, conversation_id: &str, image_ref: String) -> Result<()> {
        let mut entry = self
            .sessions
            .entry(conversation_id.to_string())
            .or_insert_with(|| Session::new(conversation_id));
        debug!(target: "session_store", conversation_id, image = %image_ref, "Storing last image");
        entry.last_image = Some(image_ref);
        Ok(())
    }

    async fn get_last_image(&self, conversation_id: &str) -> Result<Option<String>> {
        Ok(self
            .sessions
            .get(conversation_id)
            .and_then(|s| s.last_image.clone()))
    }

    async fn messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        Ok(self
            .sessions
            .get(conversation_id)
            .map(|s| s.messages.clone())
            .unwrap_or_default())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.sessions.len())
    }
}
