use std::future::Future;
use std::time::Duration;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use tracing::warn;

use crate::config::{TRANSPORT_MAX_RETRIES, TRANSPORT_RETRY_BASE_MS, TRANSPORT_RETRY_MAX_DELAY_MS};

/// Retries an outbound transport call with jittered exponential backoff.
///
/// Unlike the sheet retry policy this one retries every error: transport
/// adapters only wrap idempotent sends with it.
///
/// # Errors
///
/// Returns the last error once all attempts are exhausted.
pub async fn retry_transport_operation<F, Fut, T, E>(operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let strategy = ExponentialBackoff::from_millis(TRANSPORT_RETRY_BASE_MS)
        .max_delay(Duration::from_millis(TRANSPORT_RETRY_MAX_DELAY_MS))
        .map(jitter)
        .take(TRANSPORT_MAX_RETRIES);

    let mut attempt = 0usize;
    let mut operation = operation;
    Retry::spawn(strategy, || {
        attempt += 1;
        let current = attempt;
        let fut = operation();
        async move {
            let result = fut.await;
            if let Err(e) = &result {
                warn!(attempt = current, error = %e, "Transport operation failed");
            }
            result
        }
    })
    .await
}

/// Truncates a string to at most `max_chars` characters, appending an
/// ellipsis when something was cut.
#[must_use]
pub fn truncate_str(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max_chars.saturating_sub(1)).collect();
    out.push('…');
    out
}

/// Escapes text for Telegram's HTML parse mode.
#[must_use]
pub fn escape_html(s: &str) -> String {
    html_escape::encode_text(s).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn truncate_keeps_short_strings() {
        assert_eq!(truncate_str("short", 10), "short");
        assert_eq!(truncate_str("abcdef", 4), "abc…");
    }

    #[test]
    fn escape_html_escapes_markup() {
        assert_eq!(escape_html("<b>&</b>"), "&lt;b&gt;&amp;&lt;/b&gt;");
    }

    #[tokio::test(start_paused = true)]
    async fn transport_retry_stops_after_success() {
        let calls = AtomicUsize::new(0);
        let result: Result<u32, String> = retry_transport_operation(|| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err("flaky".to_string())
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
