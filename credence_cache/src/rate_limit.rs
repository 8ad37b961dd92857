//! Token-bucket admission control for refreshes

use credence_clock::{Clock, DurationSecs, System, UnixTime};
use parking_lot::Mutex;
use serde::Deserialize;

/// Configuration for a [`RateLimiter`]
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    /// The most permits that can be held at once
    pub capacity: u32,
    /// The number of permits added every `refill_period`
    pub refill_amount: u32,
    /// The period over which `refill_amount` permits accumulate
    pub refill_period: DurationSecs,
}

impl RateLimitConfig {
    /// Allows `n` refreshes per day, with a burst of `n`
    pub fn per_day(n: u32) -> Self {
        Self {
            capacity: n,
            refill_amount: n,
            refill_period: DurationSecs::from_hours(24),
        }
    }
}

// Absorbs rounding from summing fractional refills
const EPSILON: f64 = 1e-9;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Option<UnixTime>,
}

/// A non-blocking token bucket
///
/// Permits accumulate continuously at `refill_amount / refill_period`, up to
/// `capacity`. The bucket starts full.
#[derive(Debug)]
pub struct RateLimiter<C = System> {
    capacity: f64,
    refill_amount: f64,
    refill_period: DurationSecs,
    bucket: Mutex<Bucket>,
    clock: C,
}

impl RateLimiter {
    /// Constructs a new rate limiter using the system clock
    pub fn new(capacity: u32, refill_amount: u32, refill_period: DurationSecs) -> Self {
        Self::with_clock(capacity, refill_amount, refill_period, System)
    }

    /// Allows `n` acquisitions per day
    pub fn per_day(n: u32) -> Self {
        Self::from_config(&RateLimitConfig::per_day(n))
    }

    /// Constructs a new rate limiter from configuration
    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.capacity, config.refill_amount, config.refill_period)
    }
}

impl<C: Clock> RateLimiter<C> {
    /// Constructs a new rate limiter using the given clock
    pub fn with_clock(
        capacity: u32,
        refill_amount: u32,
        refill_period: DurationSecs,
        clock: C,
    ) -> Self {
        let capacity = f64::from(capacity);
        Self {
            capacity,
            refill_amount: f64::from(refill_amount),
            refill_period,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: None,
            }),
            clock,
        }
    }

    /// Takes a permit if one is available
    pub fn try_acquire(&self) -> bool {
        self.try_acquire_at(self.clock.now())
    }

    /// Takes a permit if one is available as of `now`
    pub fn try_acquire_at(&self, now: UnixTime) -> bool {
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket, now);

        if bucket.tokens + EPSILON >= 1.0 {
            bucket.tokens = (bucket.tokens - 1.0).max(0.0);
            tracing::trace!(remaining = bucket.tokens, "rate limiter permit granted");
            true
        } else {
            tracing::debug!(remaining = bucket.tokens, "rate limiter permit denied");
            false
        }
    }

    #[cfg(test)]
    fn available_at(&self, now: UnixTime) -> u32 {
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket, now);
        (bucket.tokens + EPSILON).floor() as u32
    }

    fn refill(&self, bucket: &mut Bucket, now: UnixTime) {
        let last = match bucket.last_refill {
            Some(last) if now > last => last,
            Some(_) => return,
            None => {
                bucket.last_refill = Some(now);
                return;
            }
        };

        if self.refill_period.0 == 0 {
            bucket.tokens = self.capacity;
        } else {
            let elapsed = (now - last).0 as f64;
            let added = elapsed * self.refill_amount / self.refill_period.0 as f64;
            bucket.tokens = (bucket.tokens + added).min(self.capacity);
        }
        bucket.last_refill = Some(now);
    }
}
