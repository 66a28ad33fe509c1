use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::config::RateLimitConfig;

/// Per-client admission control using a continuous token bucket.
///
/// Each client identity (the peer IP for the HTTP surface) gets its own bucket the first
/// time it is seen. Buckets refill at `requests_per_second`, hold at most `burst_size`
/// tokens and are never evicted. One lock guards the whole map, including the refill
/// arithmetic of the bucket being checked.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: Mutex<HashMap<String, TokenBucket>>,
}

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
    max_tokens: f64,
    refill_rate: f64, // tokens per second
}

impl TokenBucket {
    fn new(max_tokens: u32, refill_rate: f64, now: Instant) -> Self {
        Self {
            tokens: f64::from(max_tokens),
            last_refill: now,
            max_tokens: f64::from(max_tokens),
            refill_rate,
        }
    }

    fn try_consume(&mut self, now: Instant) -> bool {
        self.refill(now);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.max_tokens);
            self.last_refill = now;
        }
    }

    /// Time until one whole token is available.
    fn time_to_next_token(&self) -> Duration {
        let missing = (1.0 - self.tokens).max(0.0);
        Duration::try_from_secs_f64(missing / self.refill_rate).unwrap_or(Duration::MAX)
    }
}

/// Result of rate limit check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitResult {
    Allowed,
    Limited { retry_after: Duration },
}

impl RateLimitResult {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitResult::Allowed)
    }
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Consume one token for `key` if one is available.
    pub fn allow(&self, key: &str) -> bool {
        self.check(key).is_allowed()
    }

    /// Like [`RateLimiter::allow`], but reports how long a denied client should wait.
    pub fn check(&self, key: &str) -> RateLimitResult {
        self.check_at(key, Instant::now())
    }

    fn check_at(&self, key: &str, now: Instant) -> RateLimitResult {
        if !self.config.enabled {
            return RateLimitResult::Allowed;
        }

        let mut buckets = self.lock();
        let bucket = buckets.entry(key.to_string()).or_insert_with(|| {
            TokenBucket::new(
                self.config.burst_size,
                self.config.requests_per_second,
                now,
            )
        });

        if bucket.try_consume(now) {
            debug!(key, remaining = bucket.tokens, "rate limit check passed");
            RateLimitResult::Allowed
        } else {
            let retry_after = bucket.time_to_next_token();
            warn!(key, ?retry_after, "rate limit exceeded");
            RateLimitResult::Limited { retry_after }
        }
    }

    /// Number of client buckets created so far.
    pub fn tracked_clients(&self) -> usize {
        self.lock().len()
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, TokenBucket>> {
        // Bucket arithmetic cannot leave the map half-updated, so a poisoned lock is still usable.
        self.buckets.lock().unwrap_or_else(|e| e.into_inner())
    }
}
