//! Pending-message store
//!
//! Submitting a message and opening its stream are separate HTTP requests;
//! the store holds the text in between, keyed by an opaque token. Entries
//! are single-use, bound to their conversation, and expire after five
//! minutes.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use uuid::Uuid;

pub const PENDING_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PendingError {
    #[error("Unknown or expired message token: {0}")]
    NotFound(String),
}

#[async_trait]
pub trait PendingStore: Send + Sync {
    /// Park a message, returning its consumption token
    async fn enqueue(&self, conversation_id: &str, text: &str) -> String;

    /// Take a message out of the store. Destructive on success and on
    /// expiry; a token bound to another conversation is left intact.
    async fn consume(&self, token: &str, conversation_id: &str) -> Result<String, PendingError>;
}

#[async_trait]
impl<T: PendingStore + ?Sized> PendingStore for Arc<T> {
    async fn enqueue(&self, conversation_id: &str, text: &str) -> String {
        (**self).enqueue(conversation_id, text).await
    }

    async fn consume(&self, token: &str, conversation_id: &str) -> Result<String, PendingError> {
        (**self).consume(token, conversation_id).await
    }
}

struct Entry {
    conversation_id: String,
    text: String,
    queued_at: Instant,
}

/// In-process pending store
pub struct InMemoryPendingStore {
    entries: Mutex<HashMap<String, Entry>>,
    ttl: Duration,
}

impl Default for InMemoryPendingStore {
    fn default() -> Self {
        Self::with_ttl(PENDING_TTL)
    }
}

impl InMemoryPendingStore {
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Periodically drop entries that were never consumed
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let swept = store.purge_expired();
                if swept > 0 {
                    tracing::debug!(swept, "Dropped expired pending messages");
                }
            }
        });
    }

    fn purge_expired(&self) -> usize {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        let now = Instant::now();
        entries.retain(|_, entry| now.duration_since(entry.queued_at) < self.ttl);
        before - entries.len()
    }
}

#[async_trait]
impl PendingStore for InMemoryPendingStore {
    async fn enqueue(&self, conversation_id: &str, text: &str) -> String {
        self.purge_expired();
        let token = Uuid::new_v4().to_string();
        self.entries.lock().unwrap().insert(
            token.clone(),
            Entry {
                conversation_id: conversation_id.to_string(),
                text: text.to_string(),
                queued_at: Instant::now(),
            },
        );
        token
    }

    async fn consume(&self, token: &str, conversation_id: &str) -> Result<String, PendingError> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries
            .get(token)
            .ok_or_else(|| PendingError::NotFound(token.to_string()))?;

        if entry.queued_at.elapsed() >= self.ttl {
            entries.remove(token);
            return Err(PendingError::NotFound(token.to_string()));
        }
        if entry.conversation_id != conversation_id {
            return Err(PendingError::NotFound(token.to_string()));
        }

        let entry = entries.remove(token).ok_or_else(|| {
            PendingError::NotFound(token.to_string())
        })?;
        Ok(entry.text)
    }
}
