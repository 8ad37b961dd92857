//! Resilient caching of remote, slowly-changing resources
//!
//! A [`CachedResource`] holds a value fetched from a remote authority, such as a
//! JSON Web Key Set or an OAuth2 access token, and keeps it fresh without making
//! every caller pay for the round trip. It is built from a few smaller pieces,
//! each of which is usable on its own:
//!
//! * a [`Retrier`] that retries failures classified as transient,
//! * a [`RateLimiter`] that bounds how often a populated resource is refreshed,
//! * an [`OutageCache`] that keeps the last known good value around to ride out
//!   an authority outage, and
//! * a [`HealthAggregator`] that reports on many resources at once.
//!
//! Authorities only need to implement [`Fetch`].
//!
//! ```
//! use async_trait::async_trait;
//! use credence_cache::{CacheConfig, CachedResource, Fetch, FetchError, Fetched};
//! use credence_clock::DurationSecs;
//!
//! struct Greeting;
//!
//! #[async_trait]
//! impl Fetch for Greeting {
//!     type Output = String;
//!
//!     async fn fetch(&self) -> Result<Fetched<String>, FetchError> {
//!         Ok(Fetched::new("hello".to_owned()))
//!     }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), credence_cache::ResourceError> {
//! let config = CacheConfig::default()
//!     .with_time_to_live(DurationSecs::from_mins(5))
//!     .with_preemptive_margin(DurationSecs(30));
//! let greeting = CachedResource::new("greeting", Greeting, config);
//!
//! assert_eq!(*greeting.get(false).await?, "hello");
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! * `rand` (default): Provides [`RandomEarlyJitter`][jitter::RandomEarlyJitter] for
//!   jittering the refreshes of a spawned watcher.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

pub mod backoff;
mod config;
mod error;
mod health;
pub mod jitter;
mod outage;
mod rate_limit;
mod resource;
mod retry;

pub use config::{CacheConfig, RetryConfig, Schedule};
pub use error::{ErrorKind, FetchError, ResourceError};
pub use health::{HealthAggregator, HealthProbe, HealthStatus};
pub use outage::OutageCache;
pub use rate_limit::{RateLimitConfig, RateLimiter};
pub use resource::{CachedEntry, CachedResource, Fetch, Fetched};
pub use retry::Retrier;
