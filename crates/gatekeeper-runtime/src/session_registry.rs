//! Conversation session registry
//!
//! Holds one conversation state per (chat, user) pair. Transitions on the
//! same session run one at a time; different sessions never wait on each
//! other.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

/// Identifies a conversation: who is talking, and where
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionKey {
    /// Chat the conversation happens in
    pub chat_id: i64,
    /// User driving the conversation
    pub user_id: i64,
}

impl SessionKey {
    /// Creates a key.
    #[must_use]
    pub const fn new(chat_id: i64, user_id: i64) -> Self {
        Self { chat_id, user_id }
    }
}

/// In-memory store of conversation states.
///
/// Generic over the state type so transports and tests can plug in their
/// own; the bot uses `gatekeeper_core::router::Conversation`.
pub struct SessionRegistry<S: Clone + Default + Send + 'static> {
    sessions: RwLock<HashMap<SessionKey, Arc<Mutex<S>>>>,
}

impl<S: Clone + Default + Send + 'static> Default for SessionRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Clone + Default + Send + 'static> SessionRegistry<S> {
    /// Create a new empty registry
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    async fn slot(&self, key: SessionKey) -> Arc<Mutex<S>> {
        {
            let sessions = self.sessions.read().await;
            if let Some(slot) = sessions.get(&key) {
                return Arc::clone(slot);
            }
        }
        let mut sessions = self.sessions.write().await;
        Arc::clone(sessions.entry(key).or_default())
    }

    /// Snapshot of the current state, the default one for unknown sessions
    pub async fn get(&self, key: SessionKey) -> S {
        let slot = {
            let sessions = self.sessions.read().await;
            sessions.get(&key).cloned()
        };
        match slot {
            Some(slot) => slot.lock().await.clone(),
            None => S::default(),
        }
    }

    /// Runs `transition` on the session state and stores the state it
    /// returns. Concurrent transitions on the same key are serialized.
    pub async fn transition<F, Fut, R>(&self, key: SessionKey, transition: F) -> R
    where
        F: FnOnce(S) -> Fut,
        Fut: Future<Output = (S, R)>,
    {
        let slot = self.slot(key).await;
        let mut state = slot.lock().await;
        let (next, result) = transition(state.clone()).await;
        *state = next;
        result
    }

    /// Resets a session to the default state
    pub async fn reset(&self, key: SessionKey) {
        let slot = self.slot(key).await;
        *slot.lock().await = S::default();
        debug!(chat_id = key.chat_id, user_id = key.user_id, "Session reset");
    }

    /// Number of known sessions
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Whether no session was ever touched
    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}
