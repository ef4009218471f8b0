//! Rate & Payload Guard. Token-bucket limiting per connection, keyed
//! by action category.

use std::sync::Mutex;
use std::time::Instant;

use dashmap::DashMap;

use crate::models::ConnectionId;

/// How long an outbound queue may stay fully saturated before the
/// connection is treated as a slow consumer and closed.
pub const T_SLOW_SECS: u64 = 10;

/// How long an unauthenticated connection is given to send `authenticate`
/// before the gateway closes it with 4001.
pub const T_AUTH_SECS: u64 = 10;

/// Heartbeat ping interval / pong deadline.
pub const T_PING_SECS: u64 = 15;
pub const T_PONG_SECS: u64 = 20;

/// Request/response correlation timeout for `media_signal`.
pub const T_REQ_SECS: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateCategory {
    Auth,
    ChatSend,
    Typing,
    MediaSignal,
    VoiceActivity,
}

struct BucketSpec {
    capacity: u32,
    refill_period_secs: f64,
}

impl RateCategory {
    fn spec(self) -> BucketSpec {
        match self {
            RateCategory::Auth => BucketSpec { capacity: 5, refill_period_secs: 60.0 },
            RateCategory::ChatSend => BucketSpec { capacity: 15, refill_period_secs: 10.0 },
            RateCategory::Typing => BucketSpec { capacity: 30, refill_period_secs: 10.0 },
            RateCategory::MediaSignal => BucketSpec { capacity: 80, refill_period_secs: 5.0 },
            RateCategory::VoiceActivity => BucketSpec { capacity: 40, refill_period_secs: 5.0 },
        }
    }
}

/// Classic token bucket: refills continuously at `capacity / refill_period`
/// tokens/sec, capped at `capacity`.
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
    violations: u32,
}

impl TokenBucket {
    fn new(spec: BucketSpec, now: Instant) -> Self {
        Self {
            capacity: spec.capacity as f64,
            tokens: spec.capacity as f64,
            refill_per_sec: spec.capacity as f64 / spec.refill_period_secs,
            last_refill: now,
            violations: 0,
        }
    }

    /// Returns `Ok(())` if a token was consumed, or `Err(should_close)` if
    /// the bucket was empty — `should_close` is true once repeated
    /// violations exceed 3x capacity.
    fn try_consume(&mut self, now: Instant) -> Result<(), bool> {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            self.violations = 0;
            Ok(())
        } else {
            self.violations += 1;
            Err(self.violations as f64 >= self.capacity * 3.0)
        }
    }
}

pub struct RateLimiter {
    buckets: Mutex<[TokenBucket; 5]>,
}

const CATEGORIES: [RateCategory; 5] = [
    RateCategory::Auth,
    RateCategory::ChatSend,
    RateCategory::Typing,
    RateCategory::MediaSignal,
    RateCategory::VoiceActivity,
];

fn index_of(category: RateCategory) -> usize {
    CATEGORIES.iter().position(|c| *c == category).unwrap()
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::at(Instant::now())
    }

    pub fn at(now: Instant) -> Self {
        let buckets = CATEGORIES.map(|c| TokenBucket::new(c.spec(), now));
        Self { buckets: Mutex::new(buckets) }
    }

    /// `Ok(())` if allowed. `Err(true)` if the connection should be closed
    /// with 4004 due to sustained abuse; `Err(false)` for an ordinary
    /// single-request rejection (respond `signal_error{rate_limited}`).
    pub fn check(&self, category: RateCategory) -> Result<(), bool> {
        self.check_at(category, Instant::now())
    }

    pub fn check_at(&self, category: RateCategory, now: Instant) -> Result<(), bool> {
        let mut buckets = self.buckets.lock().unwrap();
        buckets[index_of(category)].try_consume(now)
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry of per-connection limiters, so the gateway can look one up by
/// connection id without threading it through every call site.
#[derive(Default)]
pub struct RateLimiterTable {
    limiters: DashMap<ConnectionId, std::sync::Arc<RateLimiter>>,
}

impl RateLimiterTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, connection_id: ConnectionId) -> std::sync::Arc<RateLimiter> {
        self.limiters.entry(connection_id).or_insert_with(|| std::sync::Arc::new(RateLimiter::new())).clone()
    }

    pub fn remove(&self, connection_id: ConnectionId) {
        self.limiters.remove(&connection_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn bucket_exhausts_then_refills() {
        let start = Instant::now();
        let limiter = RateLimiter::at(start);
        for _ in 0..15 {
            assert!(limiter.check_at(RateCategory::ChatSend, start).is_ok());
        }
        assert!(limiter.check_at(RateCategory::ChatSend, start).is_err());

        let later = start + Duration::from_secs(10);
        assert!(limiter.check_at(RateCategory::ChatSend, later).is_ok());
    }

    #[test]
    fn sustained_violations_signal_close() {
        let start = Instant::now();
        let limiter = RateLimiter::at(start);
        for _ in 0..5 {
            let _ = limiter.check_at(RateCategory::Auth, start);
        }
        let mut should_close = false;
        for _ in 0..20 {
            if let Err(close) = limiter.check_at(RateCategory::Auth, start) {
                should_close = close;
                if close {
                    break;
                }
            }
        }
        assert!(should_close);
    }

    #[test]
    fn categories_are_independent() {
        let start = Instant::now();
        let limiter = RateLimiter::at(start);
        for _ in 0..15 {
            limiter.check_at(RateCategory::ChatSend, start).unwrap();
        }
        assert!(limiter.check_at(RateCategory::ChatSend, start).is_err());
        assert!(limiter.check_at(RateCategory::Typing, start).is_ok());
    }
}
