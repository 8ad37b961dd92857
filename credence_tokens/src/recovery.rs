//! Recovering from tokens rejected by downstream services

use std::{error, sync::Arc};

use credence_cache::{RateLimitConfig, RateLimiter};
use credence_clock::{Clock, System, UnixTime};

use crate::TokenSource;

/// What a recovery handler did in response to a rejected token
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RecoveryOutcome {
    /// The rejected token is no longer the current token, so nothing was done
    AlreadyRefreshed,
    /// A recovery refresh is already running
    InFlight,
    /// The rate limiter denied another recovery refresh
    RateLimited,
    /// A forced refresh was started in the background
    Scheduled,
}

/// Forces a token refresh when a downstream service rejects the current token
///
/// A downstream `401 Unauthorized` usually means the authority rotated its keys
/// or revoked the token before it expired. Refreshes are started in the
/// background, one at a time, and are rate limited so that a misbehaving
/// downstream cannot make us hammer the authority.
#[derive(Debug)]
pub struct RateLimitedRecoveryHandler<C = System> {
    limiter: RateLimiter,
    in_flight: Arc<tokio::sync::Mutex<()>>,
    clock: C,
}

impl RateLimitedRecoveryHandler {
    /// Constructs a new handler using the system clock
    pub fn new(rate_limit: RateLimitConfig) -> Self {
        Self::with_clock(rate_limit, System)
    }
}

impl<C: Clock> RateLimitedRecoveryHandler<C> {
    /// Constructs a new handler using the given clock
    pub fn with_clock(rate_limit: RateLimitConfig, clock: C) -> Self {
        Self {
            limiter: RateLimiter::from_config(&rate_limit),
            in_flight: Arc::new(tokio::sync::Mutex::new(())),
            clock,
        }
    }

    /// Reacts to `rejected_header`, the `Authorization` value a downstream rejected
    pub fn handle<S>(&self, source: Arc<S>, rejected_header: &str) -> RecoveryOutcome
    where
        S: TokenSource + ?Sized + 'static,
    {
        self.handle_at(source, rejected_header, self.clock.now())
    }

    /// Reacts to `rejected_header` as of `now`
    pub fn handle_at<S>(
        &self,
        source: Arc<S>,
        rejected_header: &str,
        now: UnixTime,
    ) -> RecoveryOutcome
    where
        S: TokenSource + ?Sized + 'static,
    {
        if let Some(current) = source.current_token() {
            if current.authorization_header() != rejected_header {
                tracing::debug!("rejected token already replaced, not refreshing");
                return RecoveryOutcome::AlreadyRefreshed;
            }
        }

        let guard = match Arc::clone(&self.in_flight).try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                tracing::debug!("recovery refresh already in flight");
                return RecoveryOutcome::InFlight;
            }
        };

        if !self.limiter.try_acquire_at(now) {
            tracing::warn!("token rejected downstream, but recovery refresh is rate limited");
            return RecoveryOutcome::RateLimited;
        }

        tracing::info!("token rejected downstream, forcing token refresh");
        tokio::spawn(async move {
            let _guard = guard;
            match source.get_token(true).await {
                Ok(token) => {
                    tracing::info!(
                        expires_at = token.expires_at().0,
                        "recovery refresh obtained new token"
                    );
                }
                Err(error) => {
                    tracing::warn!(
                        error = (&error as &dyn error::Error),
                        "recovery refresh failed"
                    );
                }
            }
        });

        RecoveryOutcome::Scheduled
    }

    /// Waits until no recovery refresh is running
    pub async fn idle(&self) {
        let _guard = self.in_flight.lock().await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use credence_cache::ResourceError;
    use credence_clock::{DurationSecs, TestClock};
    use parking_lot::Mutex;

    use super::*;
    use crate::{AccessToken, TokenType, TokenValue};

    #[derive(Debug, Default)]
    struct CountingSource {
        current: Mutex<Option<Arc<AccessToken>>>,
        refreshes: AtomicU32,
    }

    impl CountingSource {
        fn holding(value: &'static str) -> Arc<Self> {
            let source = Self::default();
            *source.current.lock() = Some(Arc::new(token(value)));
            Arc::new(source)
        }

        fn refreshes(&self) -> u32 {
            self.refreshes.load(Ordering::SeqCst)
        }
    }

    fn token(value: &'static str) -> AccessToken {
        AccessToken::new(
            TokenValue::from_static(value),
            TokenType::from_static("Bearer"),
            UnixTime(u64::MAX),
        )
    }

    #[async_trait]
    impl TokenSource for CountingSource {
        async fn get_token(
            &self,
            _force_refresh: bool,
        ) -> Result<Arc<AccessToken>, ResourceError> {
            let n = self.refreshes.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            let next = Arc::new(token(if n == 0 { "second" } else { "third" }));
            *self.current.lock() = Some(Arc::clone(&next));
            Ok(next)
        }

        fn current_token(&self) -> Option<Arc<AccessToken>> {
            self.current.lock().clone()
        }
    }

    fn handler() -> RateLimitedRecoveryHandler<TestClock> {
        RateLimitedRecoveryHandler::with_clock(
            RateLimitConfig::per_day(10),
            TestClock::new(UnixTime(0)),
        )
    }

    #[tokio::test]
    async fn rapid_rejections_of_the_same_token_refresh_once() {
        let handler = handler();
        let source = CountingSource::holding("first");

        assert_eq!(
            handler.handle(source.clone(), "Bearer first"),
            RecoveryOutcome::Scheduled
        );
        assert_eq!(
            handler.handle(source.clone(), "Bearer first"),
            RecoveryOutcome::InFlight
        );

        handler.idle().await;
        assert_eq!(
            handler.handle(source.clone(), "Bearer first"),
            RecoveryOutcome::AlreadyRefreshed
        );
        assert_eq!(source.refreshes(), 1);
    }

    #[tokio::test]
    async fn stale_rejections_are_ignored() {
        let handler = handler();
        let source = CountingSource::holding("current");

        assert_eq!(
            handler.handle(source.clone(), "Bearer old"),
            RecoveryOutcome::AlreadyRefreshed
        );
        handler.idle().await;
        assert_eq!(source.refreshes(), 0);
    }

    #[tokio::test]
    async fn recoveries_are_rate_limited() {
        let clock = TestClock::new(UnixTime(0));
        let handler =
            RateLimitedRecoveryHandler::with_clock(RateLimitConfig::per_day(1), clock.clone());
        let source = CountingSource::holding("first");

        assert_eq!(
            handler.handle(source.clone(), "Bearer first"),
            RecoveryOutcome::Scheduled
        );
        handler.idle().await;
        assert_eq!(
            handler.handle(source.clone(), "Bearer second"),
            RecoveryOutcome::RateLimited
        );

        clock.advance(DurationSecs::from_hours(24));
        assert_eq!(
            handler.handle(source.clone(), "Bearer second"),
            RecoveryOutcome::Scheduled
        );
        handler.idle().await;
        assert_eq!(source.refreshes(), 2);
    }
}
