//! Request rate limiting using a token bucket
//!
//! The origin enforces a single quota across every call type, so one
//! [`RateLimiter`] is shared by every client in a pipeline. Workers block in
//! [`RateLimiter::acquire`] before issuing a request.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::config::RateLimitConfig;

/// Token bucket state
struct TokenBucket {
    /// Available tokens
    tokens: f64,
    /// Last refill time
    last_refill: Instant,
    /// Tokens per second
    rate: f64,
    /// Maximum burst size
    capacity: f64,
}

impl TokenBucket {
    fn new(budget: u32, window: Duration) -> Self {
        let capacity = budget as f64;
        Self {
            tokens: capacity,
            last_refill: Instant::now(),
            rate: capacity / window.as_secs_f64(),
            capacity,
        }
    }

    /// Take one token, or report how long until one is available
    fn try_consume(&mut self) -> Option<Duration> {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            None
        } else {
            Some(Duration::from_secs_f64((1.0 - self.tokens) / self.rate))
        }
    }
}

/// Shared request limiter (cloneable, all clones draw from one bucket)
///
/// A budget of zero disables limiting.
#[derive(Clone)]
pub struct RateLimiter {
    bucket: Option<Arc<Mutex<TokenBucket>>>,
    /// Permits handed out so far
    granted: Arc<AtomicU64>,
}

impl RateLimiter {
    /// Create a limiter from configuration
    ///
    /// # Examples
    ///
    /// ```
    /// use course_dl::config::RateLimitConfig;
    /// use course_dl::rate_limiter::RateLimiter;
    /// use std::time::Duration;
    ///
    /// // 30 requests per minute
    /// let limiter = RateLimiter::new(&RateLimitConfig {
    ///     requests_per_window: 30,
    ///     window: Duration::from_secs(60),
    /// });
    /// ```
    #[must_use]
    pub fn new(config: &RateLimitConfig) -> Self {
        let bucket = (config.requests_per_window > 0 && !config.window.is_zero()).then(|| {
            Arc::new(Mutex::new(TokenBucket::new(
                config.requests_per_window,
                config.window,
            )))
        });
        Self {
            bucket,
            granted: Arc::new(AtomicU64::new(0)),
        }
    }

    /// A limiter that never waits
    #[must_use]
    pub fn unlimited() -> Self {
        Self {
            bucket: None,
            granted: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Whether this limiter enforces a budget
    pub fn is_limited(&self) -> bool {
        self.bucket.is_some()
    }

    /// Number of permits granted so far
    pub fn granted(&self) -> u64 {
        self.granted.load(Ordering::Relaxed)
    }

    /// Wait until a request may be issued
    pub async fn acquire(&self) {
        let Some(bucket) = &self.bucket else {
            self.granted.fetch_add(1, Ordering::Relaxed);
            return;
        };

        loop {
            // The lock is never held across an await point
            let wait = {
                let mut guard = bucket.lock().unwrap_or_else(|e| e.into_inner());
                guard.try_consume()
            };
            match wait {
                None => {
                    self.granted.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Some(wait) => {
                    tracing::trace!(wait_ms = wait.as_millis() as u64, "Waiting for request budget");
                    tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
                }
            }
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("limited", &self.is_limited())
            .field("granted", &self.granted())
            .finish()
    }
}
