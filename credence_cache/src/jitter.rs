//! Spreading watcher refreshes so that many instances don't stampede the authority
//!
//! A watcher refreshes a value somewhere in its refresh window, the span between
//! when the value was fetched and when it is due. A [`JitterSource`] picks the
//! point in that window.

use credence_clock::UnixTime;

/// Picks when, within a refresh window, a value is refreshed
pub trait JitterSource {
    /// Chooses the refresh time for a value fetched at `fetched_at` and due at `refresh_at`
    ///
    /// Implementations return a time in `[fetched_at, refresh_at]`.
    fn refresh_point(&mut self, fetched_at: UnixTime, refresh_at: UnixTime) -> UnixTime;
}

/// Refreshes exactly when the value is due
#[derive(Debug)]
pub struct NullJitter;

impl JitterSource for NullJitter {
    #[inline]
    fn refresh_point(&mut self, _fetched_at: UnixTime, refresh_at: UnixTime) -> UnixTime {
        refresh_at
    }
}

#[cfg(feature = "rand")]
mod random {
    use credence_clock::{DurationSecs, UnixTime};
    use rand::{Rng, SeedableRng};

    /// Refreshes early by a random amount bounded by the refresh window
    ///
    /// The refresh is moved earlier by up to `max_jitter`, but never by more than
    /// `max_share_percent` of the refresh window. Short-lived values therefore
    /// keep most of their window, while long-lived values are spread out by up
    /// to `max_jitter`.
    #[derive(Debug)]
    pub struct RandomEarlyJitter<R> {
        max_jitter: DurationSecs,
        max_share_percent: u8,
        rand_source: R,
    }

    impl RandomEarlyJitter<rand::rngs::StdRng> {
        /// Refreshes up to `max_jitter` early, and at most a quarter of the window early
        pub fn new(max_jitter: DurationSecs) -> Self {
            Self::with_rng(max_jitter, rand::rngs::StdRng::from_entropy())
        }
    }

    impl<R: Rng> RandomEarlyJitter<R> {
        /// Draws from a specific random source
        pub fn with_rng(max_jitter: DurationSecs, rand_source: R) -> Self {
            Self {
                max_jitter,
                max_share_percent: 25,
                rand_source,
            }
        }

        /// Bounds the jitter to `percent` of the refresh window, capped at 100
        pub fn with_max_share_percent(mut self, percent: u8) -> Self {
            self.max_share_percent = percent.min(100);
            self
        }

        fn bound(&self, window: DurationSecs) -> DurationSecs {
            let share = window.0.saturating_mul(u64::from(self.max_share_percent)) / 100;
            DurationSecs(share).min(self.max_jitter)
        }
    }

    impl<R: Rng> super::JitterSource for RandomEarlyJitter<R> {
        fn refresh_point(&mut self, fetched_at: UnixTime, refresh_at: UnixTime) -> UnixTime {
            let bound = self.bound(refresh_at.saturating_since(fetched_at));
            if bound == DurationSecs::ZERO {
                return refresh_at;
            }

            let early = self.rand_source.gen_range(0..=bound.0);
            refresh_at - DurationSecs(early)
        }
    }

}

#[cfg(feature = "rand")]
pub use random::RandomEarlyJitter;
