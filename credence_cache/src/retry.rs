//! Bounded, classified retries

use std::{error, future::Future};

use crate::{backoff::ErrorBackoff, config::RetryConfig, error::FetchError};

/// Retries failed fetches that are classified as retryable
///
/// Retryable failures are retried at most `max_retries` times, sleeping for the
/// backoff delay or the authority's requested delay, whichever is longer.
/// Any other failure is returned immediately.
#[derive(Clone, Debug, Default)]
pub struct Retrier {
    config: RetryConfig,
}

impl Retrier {
    /// Constructs a new retrier
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// The retry policy in use
    #[inline]
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Runs `attempt` until it succeeds, fails permanently, or retries run out
    pub async fn run<T, F, Fut>(&self, mut attempt: F) -> Result<T, FetchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let mut backoff = ErrorBackoff::new(self.config.backoff().clone());
        let max_retries = self.config.max_retries();
        let mut retries = 0;

        loop {
            match attempt().await {
                Ok(value) => return Ok(value),
                Err(error) if !error.is_retryable() => {
                    tracing::debug!(
                        error = (&error as &dyn error::Error),
                        "fetch failed with non-retryable error"
                    );
                    return Err(error);
                }
                Err(error) if retries >= max_retries => {
                    tracing::warn!(
                        error = (&error as &dyn error::Error),
                        attempts = retries + 1,
                        "fetch failed, retries exhausted"
                    );
                    return Err(error);
                }
                Err(error) => {
                    retries += 1;
                    let delay = backoff.failed();
                    let delay = error.retry_after().map_or(delay, |hint| hint.max(delay));
                    tracing::warn!(
                        error = (&error as &dyn error::Error),
                        retry = retries,
                        max_retries,
                        delay_ms = delay.as_millis() as u64,
                        "fetch failed, will retry"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
