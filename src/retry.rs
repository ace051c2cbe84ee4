//! Bounded retry with exponential backoff.
//!
//! Both remote clients (put.io and the Arrs) share the same policy: up to
//! three attempts, 200 ms base delay doubled per attempt, no jitter so test
//! timings stay deterministic. Errors opt into retrying through the
//! [`Retryable`] trait; a transient HTTP error can carry a `Retry-After`
//! header value, which takes precedence over the computed backoff.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(200);

/// Retry policy knobs.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total number of attempts, including the first.
    pub max_attempts: u32,
    /// Starting delay; each retry doubles it.
    pub base_delay: Duration,
    /// Overrides the backoff computation per attempt (0-based). A server
    /// `Retry-After` still wins over the returned delay. Tests use this to
    /// collapse waits to zero.
    pub delay_for: Option<fn(u32) -> Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            delay_for: None,
        }
    }
}

/// Implemented by error types that know which of their values are transient.
pub trait Retryable {
    /// Whether another attempt could succeed.
    fn is_retryable(&self) -> bool;

    /// The raw `Retry-After` header value, when the server sent one.
    fn retry_after(&self) -> Option<&str> {
        None
    }
}

/// Terminal outcome of a retried operation.
#[derive(Debug)]
pub enum RetryError<E> {
    /// The operation failed with a non-retryable error, or attempts ran out.
    /// Carries the last error observed.
    Op(E),
    /// The cancellation token fired before the operation could complete.
    Cancelled,
}

impl<E: std::fmt::Display> std::fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryError::Op(e) => e.fmt(f),
            RetryError::Cancelled => write!(f, "operation cancelled"),
        }
    }
}

/// Run `op` with exponential backoff. Retries only errors whose
/// [`Retryable::is_retryable`] returns true, sleeping
/// `base_delay * 2^attempt` between attempts (or whatever
/// [`RetryConfig::delay_for`] computes instead) — the server-advised
/// `Retry-After` delay takes precedence over either. Cancellation is
/// honored before each attempt and during backoff sleeps.
pub async fn retry<T, E, Fut, Op>(
    cancel: &CancellationToken,
    cfg: &RetryConfig,
    mut op: Op,
) -> Result<T, RetryError<E>>
where
    E: Retryable,
    Op: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = cfg.max_attempts.max(1);
    for attempt in 0..max_attempts {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }

        let err = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if attempt == max_attempts - 1 || !err.is_retryable() {
            return Err(RetryError::Op(err));
        }

        let fallback = match cfg.delay_for {
            Some(delay_for) => delay_for(attempt),
            None => cfg.base_delay * 2u32.pow(attempt),
        };
        let delay = match err.retry_after() {
            Some(header) => retry_after_delay(header, fallback),
            None => fallback,
        };

        tokio::select! {
            () = cancel.cancelled() => return Err(RetryError::Cancelled),
            () = tokio::time::sleep(delay) => {}
        }
    }

    unreachable!("retry loop always returns from within");
}

/// Parse an HTTP `Retry-After` header value into a delay. Accepts a
/// non-negative integer number of seconds or an HTTP-date; anything else
/// (including negative integers) yields `fallback`.
pub fn retry_after_delay(header: &str, fallback: Duration) -> Duration {
    let header = header.trim();
    if header.is_empty() {
        return fallback;
    }

    if let Ok(secs) = header.parse::<u64>() {
        return Duration::from_secs(secs);
    }

    if let Ok(date) = chrono::DateTime::parse_from_rfc2822(header) {
        let delta = date.with_timezone(&chrono::Utc) - chrono::Utc::now();
        return delta.to_std().unwrap_or(Duration::ZERO);
    }

    fallback
}
