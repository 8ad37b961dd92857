//! Configuration for cached resources
//!
//! Every configuration type has a [`Default`] matching the documented defaults,
//! builder-style `with_*` methods, and a [`Deserialize`] implementation so that
//! applications can load it from their own configuration files. Durations are
//! whole seconds unless the field name ends in `_ms`.

use std::time::Duration;

use credence_clock::{DurationSecs, UnixTime};
use serde::Deserialize;

use crate::{backoff::ErrorBackoffConfig, rate_limit::RateLimitConfig};

pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Bounds on how often a failed fetch is attempted again
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    max_retries: u32,
    backoff: ErrorBackoffConfig,
}

impl Default for RetryConfig {
    /// Three retries after the initial attempt, using the default error backoff
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: ErrorBackoffConfig::default(),
        }
    }
}

impl RetryConfig {
    /// Constructs a new retry configuration
    pub fn new(max_retries: u32, backoff: ErrorBackoffConfig) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    /// A configuration that never retries
    pub fn never() -> Self {
        Self::new(0, ErrorBackoffConfig::default())
    }

    /// The number of attempts made after the first one fails
    #[inline]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// The backoff applied between attempts
    #[inline]
    pub fn backoff(&self) -> &ErrorBackoffConfig {
        &self.backoff
    }
}

/// Configuration for a [`CachedResource`](crate::CachedResource)
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    time_to_live: DurationSecs,
    minimum_time_to_live: DurationSecs,
    preemptive_margin: Option<DurationSecs>,
    #[serde(rename = "refresh_timeout_ms", with = "millis")]
    refresh_timeout: Duration,
    eager: bool,
    outage_ttl: Option<DurationSecs>,
    retry: RetryConfig,
    refresh_backoff: ErrorBackoffConfig,
    rate_limit: Option<RateLimitConfig>,
}

impl Default for CacheConfig {
    /// Default cache configuration
    ///
    /// Values live for at most one hour and are refreshed only once expired. A refresh
    /// (retries included) is given 10 seconds. After a failed background refresh, reads
    /// wait out the default error backoff before starting another. There is no outage
    /// cache and no rate limit.
    fn default() -> Self {
        Self {
            time_to_live: DurationSecs::from_hours(1),
            minimum_time_to_live: DurationSecs::ZERO,
            preemptive_margin: None,
            refresh_timeout: Duration::from_secs(10),
            eager: false,
            outage_ttl: None,
            retry: RetryConfig::default(),
            refresh_backoff: ErrorBackoffConfig::default(),
            rate_limit: None,
        }
    }
}

impl CacheConfig {
    /// Caps how long a value is served, regardless of its own expiry
    pub fn with_time_to_live(mut self, ttl: DurationSecs) -> Self {
        self.time_to_live = ttl;
        self
    }

    /// Prevents preemptive refreshes sooner than `min` after a value was fetched
    pub fn with_minimum_time_to_live(mut self, min: DurationSecs) -> Self {
        self.minimum_time_to_live = min;
        self
    }

    /// Refreshes values in the background once they are within `margin` of expiring
    pub fn with_preemptive_margin(mut self, margin: DurationSecs) -> Self {
        self.preemptive_margin = Some(margin);
        self
    }

    /// Bounds the time spent on one refresh, retries included
    pub fn with_refresh_timeout(mut self, timeout: Duration) -> Self {
        self.refresh_timeout = timeout;
        self
    }

    /// Fetches the value once when the resource is started
    pub fn with_eager_fetch(mut self, eager: bool) -> Self {
        self.eager = eager;
        self
    }

    /// Keeps the last known good value for `ttl` to cover authority outages
    pub fn with_outage_ttl(mut self, ttl: DurationSecs) -> Self {
        self.outage_ttl = Some(ttl);
        self
    }

    /// Sets how failed fetches are retried
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets how long reads hold off starting another background refresh after one fails
    ///
    /// Delays are rounded up to whole seconds.
    pub fn with_refresh_backoff(mut self, backoff: ErrorBackoffConfig) -> Self {
        self.refresh_backoff = backoff;
        self
    }

    /// Limits how often a populated resource may be refreshed
    pub fn with_rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = Some(rate_limit);
        self
    }

    /// The longest time a value is served after being fetched
    #[inline]
    pub fn time_to_live(&self) -> DurationSecs {
        self.time_to_live
    }

    /// The earliest a preemptive refresh may occur after a fetch
    #[inline]
    pub fn minimum_time_to_live(&self) -> DurationSecs {
        self.minimum_time_to_live
    }

    /// The preemptive refresh margin, if preemptive refreshing is enabled
    #[inline]
    pub fn preemptive_margin(&self) -> Option<DurationSecs> {
        self.preemptive_margin
    }

    /// The time allowed for one refresh
    #[inline]
    pub fn refresh_timeout(&self) -> Duration {
        self.refresh_timeout
    }

    /// Whether the value is fetched when the resource is started
    #[inline]
    pub fn is_eager(&self) -> bool {
        self.eager
    }

    /// How long an outage value remains usable
    #[inline]
    pub fn outage_ttl(&self) -> Option<DurationSecs> {
        self.outage_ttl
    }

    /// The retry policy
    #[inline]
    pub fn retry(&self) -> &RetryConfig {
        &self.retry
    }

    /// The backoff between failed background refreshes
    #[inline]
    pub fn refresh_backoff(&self) -> &ErrorBackoffConfig {
        &self.refresh_backoff
    }

    /// The refresh rate limit, if any
    #[inline]
    pub fn rate_limit(&self) -> Option<&RateLimitConfig> {
        self.rate_limit.as_ref()
    }

    /// Computes when a value fetched at `fetched_at` expires and when it should be refreshed
    ///
    /// The value expires at the earlier of its own expiry and `fetched_at + time_to_live`.
    /// Without a preemptive margin it is refreshed when it expires. With a margin, the
    /// refresh is scheduled `margin` before expiry, but never before half of the lifetime
    /// has elapsed nor before `minimum_time_to_live` has passed. The result is clamped to
    /// `[fetched_at, expires_at]`.
    pub fn schedule(&self, fetched_at: UnixTime, value_expiry: Option<UnixTime>) -> Schedule {
        let cap = fetched_at + self.time_to_live;
        let expires_at = value_expiry.map_or(cap, |e| e.min(cap)).max(fetched_at);

        let refresh_at = match self.preemptive_margin {
            None => expires_at,
            Some(margin) => {
                let lifetime = expires_at - fetched_at;
                let floor = (fetched_at + lifetime / 2).max(fetched_at + self.minimum_time_to_live);
                (expires_at - margin).max(floor).min(expires_at)
            }
        };

        Schedule {
            expires_at,
            refresh_at,
        }
    }
}

/// The expiry and refresh point computed for a freshly fetched value
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Schedule {
    /// After this instant the value is no longer served
    pub expires_at: UnixTime,
    /// From this instant a background refresh is started
    pub refresh_at: UnixTime,
}
