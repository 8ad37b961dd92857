//! Background management of OAuth2 client credentials tokens
//!
//! This library keeps a valid access token on hand for outbound calls without
//! asking the authority for one on every request, and without falling over when
//! the authority has a bad day.
//!
//! An [`AccessTokenLifecycle`] knows how to issue a token with the client
//! credentials grant, how to exchange a refresh token when the authority hands
//! one out, and how to revoke that refresh token on shutdown. A
//! [`CachedTokenSource`] puts the lifecycle behind a
//! [`CachedResource`](credence_cache::CachedResource), so tokens are refreshed
//! ahead of expiry in the background, concurrent callers share one request, and
//! transient authority failures are retried.
//!
//! When a downstream service rejects a token that has not yet expired, a
//! [`RateLimitedRecoveryHandler`] forces a refresh in the background.
//!
//! ```
//! use credence_cache::{jitter, backoff, CacheConfig};
//! use credence_clock::DurationSecs;
//! use credence_tokens::{
//!     dto::ClientCredentials, AccessTokenLifecycle, CachedTokenSource, ClientId, ClientSecret,
//!     LifecycleConfig, TokenSource,
//! };
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = LifecycleConfig::new(
//!     "https://auth.example.com/oauth/token".parse()?,
//!     ClientCredentials {
//!         client_id: ClientId::from_static("my-client"),
//!         client_secret: ClientSecret::from_static("my-secret"),
//!     },
//! )
//! .with_revoke_url("https://auth.example.com/oauth/revoke".parse()?)
//! .with_extra_param("audience", "https://api.example.com");
//!
//! let lifecycle = AccessTokenLifecycle::new(reqwest::Client::new(), config);
//! let tokens = CachedTokenSource::new(
//!     lifecycle,
//!     CacheConfig::default()
//!         .with_minimum_time_to_live(DurationSecs(30))
//!         .with_preemptive_margin(DurationSecs(60)),
//! );
//! tokens.spawn_watcher(
//!     jitter::RandomEarlyJitter::new(DurationSecs(10)),
//!     backoff::ErrorBackoffConfig::default(),
//! );
//!
//! let token = tokens.get_token(false).await?;
//! tracing::info!(token = format_args!("{:#?}", token.value()), "access token");
//!
//! tokens.close().await;
//! # Ok(())
//! # }
//! ```
//!
//! This crate includes an example of doing a periodic refresh in the examples
//! folder.
//!
//! # Features
//!
//! * `rand` (default): Enables random jittering of background refreshes.
//! * `default-tls` / `rustls-tls`: Selects the TLS implementation used by `reqwest`.

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

mod braids;
pub mod dto;
mod lifecycle;
mod recovery;
mod source;
mod tokens;

pub use braids::*;
pub use lifecycle::{AccessTokenLifecycle, ContentType, LifecycleConfig, LifecycleState};
pub use recovery::{RateLimitedRecoveryHandler, RecoveryOutcome};
pub use source::{CachedTokenSource, ConstTokenSource, TokenSource};
pub use tokens::{AccessToken, RefreshToken};
