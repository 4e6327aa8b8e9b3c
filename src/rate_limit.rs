//! Token-bucket rate limiting keyed by actor.
//!
//! Each key owns a bucket holding at most `capacity` tokens. Every
//! `refill_interval_secs` seconds the bucket regains `refill_tokens` tokens.
//! A request consumes one token; an empty bucket rejects the request.
//! Buckets that have refilled to capacity are indistinguishable from fresh
//! ones and are swept at most once per refill interval.

use log::debug;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::RateLimitSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed { remaining: u32 },
    Denied { retry_after_secs: u64 },
}

impl RateDecision {
    pub fn is_denied(&self) -> bool {
        matches!(self, RateDecision::Denied { .. })
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: u32,
    last_refill: Instant,
}

impl Bucket {
    fn is_full_at(&self, now: Instant, settings: &RateLimitSettings) -> bool {
        let intervals = now.saturating_duration_since(self.last_refill).as_secs() / settings.refill_interval_secs;
        let refill = u64::from(settings.refill_tokens).saturating_mul(intervals);
        u64::from(self.tokens).saturating_add(refill) >= u64::from(settings.capacity)
    }
}

#[derive(Debug)]
struct Buckets {
    by_key: HashMap<String, Bucket>,
    last_sweep: Instant,
}

#[derive(Debug)]
pub struct TokenBucketLimiter {
    settings: RateLimitSettings,
    buckets: Mutex<Buckets>,
}

impl TokenBucketLimiter {
    pub fn new(settings: RateLimitSettings) -> Self {
        let buckets = Buckets { by_key: HashMap::new(), last_sweep: Instant::now() };
        Self { settings, buckets: Mutex::new(buckets) }
    }

    /// Number of keys currently holding a bucket.
    pub fn tracked_keys(&self) -> usize {
        match self.buckets.lock() {
            Ok(guard) => guard.by_key.len(),
            Err(poisoned) => poisoned.into_inner().by_key.len(),
        }
    }

    pub fn check(&self, key: &str) -> RateDecision {
        self.check_at(key, Instant::now())
    }

    pub fn check_at(&self, key: &str, now: Instant) -> RateDecision {
        let interval = Duration::from_secs(self.settings.refill_interval_secs);
        let capacity = self.settings.capacity;

        let mut buckets = match self.buckets.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if now.saturating_duration_since(buckets.last_sweep) >= interval {
            let settings = self.settings;
            let before = buckets.by_key.len();
            buckets.by_key.retain(|_, bucket| !bucket.is_full_at(now, &settings));
            buckets.last_sweep = now;
            debug!("Swept {} idle rate limit bucket(s)", before - buckets.by_key.len());
        }

        let bucket = buckets
            .by_key
            .entry(key.to_string())
            .or_insert_with(|| Bucket { tokens: capacity, last_refill: now });

        let elapsed = now.saturating_duration_since(bucket.last_refill);
        let intervals = (elapsed.as_secs() / self.settings.refill_interval_secs) as u32;
        if intervals > 0 {
            let refill = intervals.saturating_mul(self.settings.refill_tokens);
            bucket.tokens = bucket.tokens.saturating_add(refill).min(capacity);
            bucket.last_refill += interval * intervals;
        }

        if bucket.tokens > 0 {
            bucket.tokens -= 1;
            RateDecision::Allowed { remaining: bucket.tokens }
        } else {
            let waited = now.saturating_duration_since(bucket.last_refill);
            let retry_after_secs = interval.saturating_sub(waited).as_secs().max(1);
            debug!("Rate limit bucket empty for key {}", key);
            RateDecision::Denied { retry_after_secs }
        }
    }
}
