use std::time::Instant;

use dashmap::DashMap;

/// Per-client token-bucket state. `tokens` is fractional so that
/// sub-second refills accumulate correctly between admit calls.
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token-bucket rate limiter keyed by client identity.
///
/// Buckets are created lazily on first sighting of an identity and are
/// never evicted — the domain assumes a bounded client population (one
/// bucket per distinct Common Name in the allow-list).
pub struct RateLimiter {
    burst: f64,
    rate: f64,
    buckets: DashMap<String, TokenBucket>,
}

impl RateLimiter {
    pub fn new(burst: u32, rate: f64) -> Self {
        RateLimiter {
            burst: burst as f64,
            rate,
            buckets: DashMap::new(),
        }
    }

    /// Admits one token for `identity` if available. Safe under
    /// concurrent calls for the same or different identities.
    pub fn admit(&self, identity: &str) -> bool {
        let now = Instant::now();
        let mut entry = self.buckets.entry(identity.to_owned()).or_insert_with(|| TokenBucket {
            tokens: self.burst,
            last_refill: now,
        });

        let elapsed = now.saturating_duration_since(entry.last_refill).as_secs_f64();
        entry.tokens = (entry.tokens + elapsed * self.rate).min(self.burst);
        entry.last_refill = now;

        if entry.tokens >= 1.0 {
            entry.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;
    use std::time::Duration;

    #[test]
    fn admits_up_to_burst_then_denies() {
        let limiter = RateLimiter::new(3, 1.0);
        assert!(limiter.admit("x"));
        assert!(limiter.admit("x"));
        assert!(limiter.admit("x"));
        assert!(!limiter.admit("x"));
    }

    #[test]
    fn refills_after_one_second() {
        let limiter = RateLimiter::new(3, 1.0);
        for _ in 0..3 {
            assert!(limiter.admit("x"));
        }
        assert!(!limiter.admit("x"));
        sleep(Duration::from_millis(1050));
        assert!(limiter.admit("x"));
        assert!(!limiter.admit("x"));
    }

    #[test]
    fn distinct_clients_have_independent_buckets() {
        let limiter = RateLimiter::new(1, 1.0);
        assert!(limiter.admit("x"));
        assert!(limiter.admit("y"));
        assert!(!limiter.admit("x"));
    }

    #[test]
    fn new_client_starts_with_a_full_bucket() {
        let limiter = RateLimiter::new(3, 1.0);
        assert!(limiter.admit("fresh"));
        assert!(limiter.admit("fresh"));
        assert!(limiter.admit("fresh"));
    }
}
