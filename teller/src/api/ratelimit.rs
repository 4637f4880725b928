//! Per-IP request rate limiting.
//!
//! A token bucket per client IP, kept in an LRU so an address sweep
//! cannot grow memory without bound. Buckets refill continuously at
//! `capacity` tokens per window.

use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;
use std::time::Instant;

/// How many distinct client IPs to track at once.
const TRACKED_CLIENTS: usize = 4096;

/// Token-bucket limiter keyed by client IP.
#[derive(Debug)]
pub struct RateLimiter {
    buckets: Mutex<lru::LruCache<IpAddr, TokenBucket>>,
    capacity: u32,
    window: Duration,
}

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    refilled_at: Instant,
}

impl RateLimiter {
    /// Allow `capacity` requests per `window` per client IP.
    pub fn new(capacity: u32, window: Duration) -> Self {
        Self {
            buckets: Mutex::new(lru::LruCache::new(
                NonZeroUsize::new(TRACKED_CLIENTS).expect("nonzero capacity"),
            )),
            capacity,
            window,
        }
    }

    /// Whether a request from `ip` may proceed right now.
    pub fn allow(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let refill_per_sec = f64::from(self.capacity) / self.window.as_secs_f64();

        let mut buckets = self
            .buckets
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let bucket = buckets.get_or_insert_mut(ip, || TokenBucket {
            tokens: f64::from(self.capacity),
            refilled_at: now,
        });

        let elapsed = now.duration_since(bucket.refilled_at).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * refill_per_sec).min(f64::from(self.capacity));
        bucket.refilled_at = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}
