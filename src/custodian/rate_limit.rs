use crate::config::RateLimitConfig;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Token bucket per caller identity
///
/// A `burst` of zero disables limiting.
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Take one token for `caller`; false when the bucket is empty
    pub fn check(&self, caller: &str) -> bool {
        self.check_at(caller, Instant::now())
    }

    pub fn check_at(&self, caller: &str, now: Instant) -> bool {
        if self.config.burst == 0 {
            return true;
        }
        let burst = f64::from(self.config.burst);
        let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
        let bucket = buckets.entry(caller.to_string()).or_insert(Bucket {
            tokens: burst,
            last: now,
        });
        let elapsed = now.saturating_duration_since(bucket.last).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.config.refill_per_sec).min(burst);
        bucket.last = now;
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_burst_then_refill() {
        let limiter = RateLimiter::new(RateLimitConfig {
            burst: 3,
            refill_per_sec: 1.0,
        });
        let t0 = Instant::now();
        assert!((0..3).all(|_| limiter.check_at("peer-a", t0)));
        assert!(!limiter.check_at("peer-a", t0));
        // other callers have their own bucket
        assert!(limiter.check_at("peer-b", t0));
        assert!(limiter.check_at("peer-a", t0 + Duration::from_millis(1100)));
        assert!(!limiter.check_at("peer-a", t0 + Duration::from_millis(1200)));
    }

    #[test]
    fn test_zero_burst_disables() {
        let limiter = RateLimiter::new(RateLimitConfig {
            burst: 0,
            refill_per_sec: 0.0,
        });
        assert!((0..1000).all(|_| limiter.check("x")));
    }
}
