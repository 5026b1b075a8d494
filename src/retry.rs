//! Retry logic with exponential backoff
//!
//! One policy object ([`RetryConfig`]) is applied uniformly by every client
//! method. Errors classify themselves through [`IsRetryable`]; an explicit
//! wait requested by the origin (429 with `Retry-After`) is honoured as a lower
//! bound on the next delay.
//!
//! # Example
//!
//! ```no_run
//! use course_dl::retry::{IsRetryable, with_retry};
//! use course_dl::config::RetryConfig;
//!
//! #[derive(Debug)]
//! enum MyError {
//!     Transient,
//!     Permanent,
//! }
//!
//! impl std::fmt::Display for MyError {
//!     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
//!         write!(f, "{:?}", self)
//!     }
//! }
//!
//! impl IsRetryable for MyError {
//!     fn is_retryable(&self) -> bool {
//!         matches!(self, MyError::Transient)
//!     }
//! }
//!
//! # async fn example() -> Result<(), MyError> {
//! let config = RetryConfig::default();
//! with_retry(&config, || async {
//!     // Your operation here
//!     Ok::<_, MyError>(())
//! }).await?;
//! # Ok(())
//! # }
//! ```

use crate::config::RetryConfig;
use crate::error::{DownloadError, Error, ResolutionError};
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Trait for errors that can be classified as retryable or not
///
/// Transient failures (timeouts, connection failures, 5xx, 429) return `true`.
/// Permanent failures (other 4xx, malformed responses, disk errors) return `false`.
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;

    /// Minimum wait requested by the origin before the next attempt
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            Error::Network(e) => e.is_timeout() || e.is_connect(),
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::Interrupted
            ),
            Error::Resolution(e) => e.is_retryable(),
            Error::Download(e) => e.is_retryable(),
            // Auth and discovery failures are surfaced to the caller, never retried here
            Error::Auth(_) | Error::Discovery(_) => false,
            // Traversal failures are recorded per folder after the listing call gave up
            Error::Traversal(_) => false,
            Error::Config { .. } => false,
            Error::Serialization(_) => false,
            Error::SessionExpired { .. } => false,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::Resolution(e) => e.retry_after(),
            Error::Download(e) => e.retry_after(),
            _ => None,
        }
    }
}

impl IsRetryable for ResolutionError {
    fn is_retryable(&self) -> bool {
        matches!(self, ResolutionError::Transient { .. })
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            ResolutionError::Transient { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl IsRetryable for DownloadError {
    fn is_retryable(&self) -> bool {
        // A short body is treated like a dropped connection
        matches!(
            self,
            DownloadError::NetworkError { .. } | DownloadError::SizeMismatch { .. }
        )
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            DownloadError::NetworkError { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Execute an async operation with exponential backoff retry logic
///
/// `config.max_attempts` is the number of retries after the first attempt.
///
/// # Arguments
///
/// * `config` - Retry configuration (max attempts, delays, backoff multiplier, jitter)
/// * `operation` - Async closure that returns Result<T, E> where E implements IsRetryable
///
/// # Returns
///
/// Returns the successful result or the last error after all retry attempts are exhausted.
pub async fn with_retry<F, Fut, T, E>(config: &RetryConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: IsRetryable + std::fmt::Display,
{
    let mut attempt = 0;
    let mut delay = config.initial_delay;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    tracing::info!(attempts = attempt + 1, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if e.is_retryable() && attempt < config.max_attempts => {
                attempt += 1;

                let wait = next_wait(config, delay, e.retry_after());

                tracing::warn!(
                    error = %e,
                    attempt = attempt,
                    max_attempts = config.max_attempts,
                    delay_ms = wait.as_millis() as u64,
                    "Operation failed, retrying"
                );

                tokio::time::sleep(wait).await;

                delay = next_delay(config, delay);
            }
            Err(e) => {
                if e.is_retryable() {
                    tracing::error!(
                        error = %e,
                        attempts = attempt + 1,
                        "Operation failed after all retry attempts exhausted"
                    );
                } else {
                    tracing::debug!(error = %e, "Operation failed with non-retryable error");
                }
                return Err(e);
            }
        }
    }
}

/// Grow `delay` by the backoff multiplier, capped at `max_delay`
///
/// A product that does not fit a [`Duration`] saturates at the cap.
fn next_delay(config: &RetryConfig, delay: Duration) -> Duration {
    Duration::try_from_secs_f64(delay.as_secs_f64() * config.backoff_multiplier)
        .map_or(config.max_delay, |next| next.min(config.max_delay))
}

/// Delay before the next attempt: the (optionally jittered) backoff, but never
/// less than what the origin asked for
fn next_wait(config: &RetryConfig, delay: Duration, retry_after: Option<Duration>) -> Duration {
    let backoff = if config.jitter {
        add_jitter(delay)
    } else {
        delay
    };
    match retry_after {
        Some(explicit) => backoff.max(explicit),
        None => backoff,
    }
}

/// Add random jitter to a delay to prevent thundering herd
///
/// The actual delay will be between `delay` and `2 * delay`.
fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=1.0);
    Duration::try_from_secs_f64(delay.as_secs_f64() * (1.0 + jitter_factor)).unwrap_or(delay)
}
