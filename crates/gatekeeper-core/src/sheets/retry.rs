use std::future::Future;
use std::time::Duration;
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::RetryIf;
use tracing::warn;

use super::backend::BackendError;

/// Bounded exponential backoff for transient backend failures.
///
/// Delays start at `initial_backoff` and double up to `max_backoff`.
/// Non-transient errors are returned without retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included
    pub max_attempts: usize,
    /// Delay before the second attempt
    pub initial_backoff: Duration,
    /// Cap for a single delay
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delays between attempts.
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        // from_millis(2) yields 2, 4, 8.. and the factor scales that onto
        // initial_backoff, 2 * initial_backoff..
        let factor = u64::try_from(self.initial_backoff.as_millis() / 2)
            .unwrap_or(u64::MAX)
            .max(1);
        ExponentialBackoff::from_millis(2)
            .factor(factor)
            .max_delay(self.max_backoff)
            .take(self.max_attempts.saturating_sub(1))
    }

    /// Runs `operation`, retrying transient failures.
    ///
    /// # Errors
    ///
    /// Returns the first non-transient error, or the last transient one once
    /// attempts are exhausted.
    pub async fn run<F, Fut, T>(&self, label: &str, operation: F) -> Result<T, BackendError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        RetryIf::spawn(self.delays(), operation, |e: &BackendError| {
            let retry = e.is_transient();
            if retry {
                warn!(operation = label, error = %e, "Transient spreadsheet failure, retrying");
            }
            retry
        })
        .await
    }
}
