//! Flood protection for "Access denied" replies.
//!
//! Non-administrators get one denial per cooldown period; further attempts
//! are dropped silently and only counted.

use moka::future::Cache;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Remembers users recently told they are not allowed in.
#[derive(Clone)]
pub struct DenialCache {
    cache: Cache<i64, ()>,
    silenced: Arc<AtomicU64>,
}

impl DenialCache {
    /// Creates a cache whose entries expire after `cooldown`.
    #[must_use]
    pub fn new(cooldown: Duration, max_capacity: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .time_to_live(cooldown)
            .build();
        Self {
            cache,
            silenced: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Whether a denial should be sent to `user_id` now.
    pub async fn should_send(&self, user_id: i64) -> bool {
        if self.cache.get(&user_id).await.is_none() {
            return true;
        }
        let count = self.silenced.fetch_add(1, Ordering::Relaxed) + 1;
        // Log only every 100th silenced attempt
        if count.is_multiple_of(100) {
            debug!(count, user_id, "Silenced repeated unauthorized attempts");
        }
        false
    }

    /// Starts the cooldown for `user_id`.
    pub async fn mark_sent(&self, user_id: i64) {
        self.cache.insert(user_id, ()).await;
    }

    /// Attempts dropped because of the cooldown
    #[must_use]
    pub fn silenced_count(&self) -> u64 {
        self.silenced.load(Ordering::Relaxed)
    }
}
