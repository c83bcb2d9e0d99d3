use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

/// Spaces calls at least `min_interval` apart, process-wide.
///
/// The wait happens while the lock is held, so concurrent callers queue up
/// behind each other instead of all waking at the same instant.
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl RateLimiter {
    /// Creates a limiter with the given minimum spacing.
    #[must_use]
    pub const fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_call: Mutex::const_new(None),
        }
    }

    /// Minimum spacing between two calls
    #[must_use]
    pub const fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Waits until a call is allowed and records it.
    pub async fn acquire(&self) {
        let mut last_call = self.last_call.lock().await;
        if let Some(previous) = *last_call {
            let elapsed = previous.elapsed();
            if elapsed < self.min_interval {
                sleep(self.min_interval - elapsed).await;
            }
        }
        *last_call = Some(Instant::now());
    }
}
