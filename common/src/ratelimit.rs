//! In-memory token-bucket rate limiting.
//!
//! Every WebSocket server runs two independent limiters: one keyed by
//! remote IP, one keyed by the caller-supplied client id. Buckets refill
//! continuously and idle entries are evicted opportunistically on the next
//! call, so no background task is needed.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct TokenBucket {
    rate_per_sec: f64,
    capacity: f64,
    tokens: f64,
    updated_at: Instant,
    last_seen: Instant,
}

impl TokenBucket {
    fn create(rate_per_min: u32, burst: u32, now: Instant) -> Self {
        let rate_per_min = rate_per_min.max(1);
        let capacity = burst.max(1) as f64;
        Self {
            rate_per_sec: rate_per_min as f64 / 60.0,
            capacity,
            tokens: capacity,
            updated_at: now,
            last_seen: now,
        }
    }

    fn allow_at(&mut self, now: Instant, cost: f64) -> bool {
        let elapsed = now.saturating_duration_since(self.updated_at).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.rate_per_sec).min(self.capacity);
            self.updated_at = now;
        }
        self.last_seen = now;
        if self.tokens >= cost {
            self.tokens -= cost;
            true
        } else {
            false
        }
    }
}

struct LimiterInner {
    buckets: HashMap<String, TokenBucket>,
    last_cleanup: Instant,
}

pub struct RateLimiter {
    rate_per_min: u32,
    burst: u32,
    idle_ttl: Duration,
    inner: Mutex<LimiterInner>,
}

impl RateLimiter {
    pub fn new(rate_per_min: u32, burst: u32) -> Self {
        Self::with_idle_ttl(rate_per_min, burst, Duration::from_secs(300))
    }

    pub fn with_idle_ttl(rate_per_min: u32, burst: u32, idle_ttl: Duration) -> Self {
        Self {
            rate_per_min: rate_per_min.max(1),
            burst: burst.max(1),
            idle_ttl: idle_ttl.max(Duration::from_secs(60)),
            inner: Mutex::new(LimiterInner {
                buckets: HashMap::new(),
                last_cleanup: Instant::now(),
            }),
        }
    }

    /// Admit or reject one request for the given key.
    pub fn allow(&self, key: &str) -> bool {
        self.allow_at(key, Instant::now())
    }

    fn allow_at(&self, key: &str, now: Instant) -> bool {
        let mut inner = self.inner.lock().expect("rate limiter lock poisoned");
        if now.saturating_duration_since(inner.last_cleanup) >= self.idle_ttl {
            inner.last_cleanup = now;
            let idle_ttl = self.idle_ttl;
            inner
                .buckets
                .retain(|_, b| now.saturating_duration_since(b.last_seen) < idle_ttl);
        }
        let bucket = inner
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| TokenBucket::create(self.rate_per_min, self.burst, now));
        bucket.allow_at(now, 1.0)
    }

    #[cfg(test)]
    fn bucket_count(&self) -> usize {
        self.inner.lock().unwrap().buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_is_admitted_then_rejected() {
        let limiter = RateLimiter::new(60, 3);
        let now = Instant::now();
        assert!(limiter.allow_at("a", now));
        assert!(limiter.allow_at("a", now));
        assert!(limiter.allow_at("a", now));
        assert!(!limiter.allow_at("a", now));
    }

    #[test]
    fn keys_are_independent() {
        let limiter = RateLimiter::new(60, 1);
        let now = Instant::now();
        assert!(limiter.allow_at("a", now));
        assert!(!limiter.allow_at("a", now));
        assert!(limiter.allow_at("b", now));
    }

    #[test]
    fn tokens_refill_over_time() {
        // 60/min = 1 token per second
        let limiter = RateLimiter::new(60, 1);
        let start = Instant::now();
        assert!(limiter.allow_at("a", start));
        assert!(!limiter.allow_at("a", start));
        assert!(limiter.allow_at("a", start + Duration::from_secs(1)));
        assert!(!limiter.allow_at("a", start + Duration::from_secs(1)));
    }

    #[test]
    fn refill_is_capped_at_burst() {
        let limiter = RateLimiter::new(600, 2);
        let start = Instant::now();
        assert!(limiter.allow_at("a", start));
        assert!(limiter.allow_at("a", start));
        // long idle period refills to capacity, not beyond
        let later = start + Duration::from_secs(3600);
        assert!(limiter.allow_at("a", later));
        assert!(limiter.allow_at("a", later));
        assert!(!limiter.allow_at("a", later));
    }

    #[test]
    fn one_minute_window_admits_at_most_rate_plus_burst() {
        let rate = 30u32;
        let burst = 10u32;
        let limiter = RateLimiter::new(rate, burst);
        let start = Instant::now();
        let mut admitted = 0;
        // hammer the limiter every 100ms for one minute
        for tick in 0..600 {
            let now = start + Duration::from_millis(tick * 100);
            if limiter.allow_at("k", now) {
                admitted += 1;
            }
        }
        assert!(admitted as u32 <= rate + burst);
        // and it should not starve either: at least the refill rate
        assert!(admitted as u32 >= rate);
    }

    #[test]
    fn idle_buckets_are_evicted() {
        let limiter = RateLimiter::with_idle_ttl(60, 60, Duration::from_secs(60));
        let start = Instant::now();
        assert!(limiter.allow_at("stale", start));
        assert_eq!(limiter.bucket_count(), 1);
        // next touch after the idle TTL sweeps the stale entry
        assert!(limiter.allow_at("fresh", start + Duration::from_secs(120)));
        assert_eq!(limiter.bucket_count(), 1);
    }
}
