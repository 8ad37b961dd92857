//! Backoff after consecutive failures
//!
//! [`ErrorBackoffConfig`] maps a count of consecutive failures to a delay.
//! [`ErrorBackoff`] keeps that count for one retry loop, watcher, or stream of
//! background refreshes, and can turn the delay into the instant before which
//! no further attempt should be made.

use std::time::Duration;

use credence_clock::{DurationSecs, UnixTime};
use serde::Deserialize;

/// How long to wait after a run of consecutive failures
///
/// The first failure waits `initial_delay_ms`. Each further failure multiplies the
/// delay by `multiplier`, up to `max_delay_ms`.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ErrorBackoffConfig {
    #[serde(rename = "initial_delay_ms", with = "crate::config::millis")]
    initial_delay: Duration,
    #[serde(rename = "max_delay_ms", with = "crate::config::millis")]
    max_delay: Duration,
    multiplier: u32,
}

impl Default for ErrorBackoffConfig {
    /// Starts at 100 ms and doubles up to 15 seconds
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(15),
            multiplier: 2,
        }
    }
}

impl ErrorBackoffConfig {
    /// Constructs a new backoff configuration
    ///
    /// A `multiplier` of zero is treated as one.
    pub fn new(initial_delay: Duration, max_delay: Duration, multiplier: u32) -> Self {
        Self {
            initial_delay,
            max_delay,
            multiplier: multiplier.max(1),
        }
    }

    /// A backoff that always waits the same amount of time
    pub fn fixed(delay: Duration) -> Self {
        Self::new(delay, delay, 1)
    }

    /// The delay after the first failure
    #[inline]
    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    /// The longest delay ever produced
    #[inline]
    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// The delay after `failures` consecutive failures
    ///
    /// No failures means no delay.
    pub fn delay_after(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }

        let mut delay = self.initial_delay.min(self.max_delay);
        for _ in 1..failures {
            if delay >= self.max_delay {
                break;
            }
            delay = delay.saturating_mul(self.multiplier).min(self.max_delay);
        }
        delay
    }
}

/// A running count of consecutive failures
#[derive(Clone, Debug)]
pub struct ErrorBackoff {
    config: ErrorBackoffConfig,
    failures: u32,
}

impl ErrorBackoff {
    /// Starts counting with no failures recorded
    pub fn new(config: ErrorBackoffConfig) -> Self {
        Self {
            config,
            failures: 0,
        }
    }

    /// Consecutive failures since the last success
    #[inline]
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Clears the failure count
    pub fn succeeded(&mut self) {
        self.failures = 0;
    }

    /// Records a failure and returns how long to wait before the next attempt
    pub fn failed(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        self.config.delay_after(self.failures)
    }

    /// Records a failure at `now` and returns the earliest time for the next attempt
    ///
    /// Sub-second delays round up, so the next attempt is always at least one
    /// second away.
    pub fn failed_at(&mut self, now: UnixTime) -> UnixTime {
        let delay = self.failed();
        let secs = delay.as_secs() + u64::from(delay.subsec_nanos() > 0);
        now + DurationSecs(secs.max(1))
    }
}

impl From<ErrorBackoffConfig> for ErrorBackoff {
    fn from(config: ErrorBackoffConfig) -> Self {
        Self::new(config)
    }
}
