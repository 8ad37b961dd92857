//! Remote JSON Web Key Sets

use std::sync::Arc;

use aliri::{jwa, jwk::KeyIdRef, Jwk, Jwks};
use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use credence_cache::{
    CacheConfig, CachedResource, ErrorKind, Fetch, FetchError, Fetched, HealthProbe,
    HealthStatus, RateLimitConfig, RateLimiter, ResourceError,
};
use credence_clock::{Clock, System};
use reqwest::{
    header::{self, HeaderValue},
    StatusCode,
};
use thiserror::Error;
use url::Url;

/// Indicates that a key could not be resolved
#[derive(Debug, Error)]
pub enum KeyError {
    /// No key set could be obtained, either live or from the outage cache
    #[error("JWKS unavailable")]
    KeysUnavailable(#[source] ResourceError),
    /// The key set holds no key matching the requested key ID and algorithm
    #[error("no matching key found to validate JWT")]
    UnknownKeyId,
}

#[derive(Debug)]
struct VolatileData {
    jwks: Jwks,
    etag: Option<HeaderValue>,
    last_modified: Option<HeaderValue>,
}

/// Fetches a JWKS from a remote URL
///
/// Validators from the previous response are sent with each request, and the
/// previous key set is reused when the authority responds `304 Not Modified`.
#[derive(Debug)]
pub struct JwksFetcher {
    client: reqwest::Client,
    url: Url,
    previous: ArcSwapOption<VolatileData>,
}

impl JwksFetcher {
    /// Constructs a fetcher for the JWKS at `url`
    pub fn new(client: reqwest::Client, url: Url) -> Self {
        Self {
            client,
            url,
            previous: ArcSwapOption::empty(),
        }
    }

    /// The JWKS URL
    #[inline]
    pub fn url(&self) -> &Url {
        &self.url
    }

    #[tracing::instrument(err(level = "debug"), skip(self), fields(jwks.url = %self.url))]
    async fn fetch_jwks(&self) -> Result<Jwks, FetchError> {
        tracing::debug!("refreshing JWKS");
        let mut request = self
            .client
            .get(self.url.clone())
            .header(header::ACCEPT, "application/json");

        let previous = self.previous.load_full();
        if let Some(data) = &previous {
            if let Some(etag) = &data.etag {
                request = request.header(header::IF_NONE_MATCH, etag);
            } else if let Some(last_modified) = &data.last_modified {
                request = request.header(header::IF_MODIFIED_SINCE, last_modified);
            }
        }

        let response = request.send().await.map_err(FetchError::transport)?;
        let status = response.status();

        if status == StatusCode::NOT_MODIFIED {
            return match previous {
                Some(data) => {
                    tracing::debug!("JWKS not modified");
                    Ok(data.jwks.clone())
                }
                None => Err(FetchError::new(
                    ErrorKind::Malformed,
                    "not modified response to an unconditional request",
                )),
            };
        }

        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(ToOwned::to_owned);
            tracing::warn!(
                http.status_code = status.as_u16(),
                "JWKS refresh failed; unexpected response status",
            );
            let body = response.text().await.unwrap_or_default();
            return Err(FetchError::from_status(status.as_u16(), body)
                .with_retry_after_header(retry_after.as_deref()));
        }

        let etag = response.headers().get(header::ETAG).map(ToOwned::to_owned);
        let last_modified = response
            .headers()
            .get(header::LAST_MODIFIED)
            .map(ToOwned::to_owned);
        let body = response.bytes().await.map_err(FetchError::transport)?;
        let jwks: Jwks = serde_json::from_slice(&body).map_err(FetchError::malformed)?;

        self.previous.store(Some(Arc::new(VolatileData {
            jwks: jwks.clone(),
            etag,
            last_modified,
        })));

        tracing::info!(keys = jwks.keys().len(), "JWKS refreshed");
        Ok(jwks)
    }
}

#[async_trait]
impl Fetch for JwksFetcher {
    type Output = Jwks;

    async fn fetch(&self) -> Result<Fetched<Jwks>, FetchError> {
        self.fetch_jwks().await.map(Fetched::new)
    }
}

/// Resolves signing keys from a cached, remotely held JWKS
///
/// When no key matches, the key set is refreshed once in case the authority has
/// rotated its keys. Those refreshes are limited separately, so that tokens with
/// made-up key IDs cannot be used to hammer the authority.
#[derive(Debug)]
pub struct JwkKeyResolver<C = System>
where
    C: Clock + Send + Sync + 'static,
{
    resource: CachedResource<JwksFetcher, C>,
    unknown_key_limiter: RateLimiter<C>,
}

impl JwkKeyResolver {
    /// Constructs a resolver using the system clock
    pub fn new(
        fetcher: JwksFetcher,
        config: CacheConfig,
        unknown_key_rate_limit: &RateLimitConfig,
    ) -> Self {
        Self::with_clock(fetcher, config, unknown_key_rate_limit, System)
    }
}

impl<C> JwkKeyResolver<C>
where
    C: Clock + Clone + Send + Sync + 'static,
{
    /// Constructs a resolver using the given clock
    pub fn with_clock(
        fetcher: JwksFetcher,
        config: CacheConfig,
        unknown_key_rate_limit: &RateLimitConfig,
        clock: C,
    ) -> Self {
        let name = format!("jwks:{}", fetcher.url());
        Self {
            resource: CachedResource::with_clock(name, fetcher, config, clock.clone()),
            unknown_key_limiter: RateLimiter::with_clock(
                unknown_key_rate_limit.capacity,
                unknown_key_rate_limit.refill_amount,
                unknown_key_rate_limit.refill_period,
                clock,
            ),
        }
    }
}

impl<C> JwkKeyResolver<C>
where
    C: Clock + Send + Sync + 'static,
{
    /// The cached key set
    #[inline]
    pub fn resource(&self) -> &CachedResource<JwksFetcher, C> {
        &self.resource
    }

    /// Gets the key matching `kid` (if any) and `alg`
    pub async fn get_key(
        &self,
        kid: Option<&KeyIdRef>,
        alg: jwa::Algorithm,
    ) -> Result<Jwk, KeyError> {
        let jwks = self
            .resource
            .get(false)
            .await
            .map_err(KeyError::KeysUnavailable)?;

        if let Some(key) = jwks.get_key_by_opt(kid, alg) {
            return Ok(key.clone());
        }

        if !self.unknown_key_limiter.try_acquire() {
            log_unknown_key(kid, alg, "unknown key refresh rate limited");
            return Err(KeyError::UnknownKeyId);
        }

        log_unknown_key(kid, alg, "unknown key, refreshing JWKS");
        let jwks = self
            .resource
            .get(true)
            .await
            .map_err(KeyError::KeysUnavailable)?;

        match jwks.get_key_by_opt(kid, alg) {
            Some(key) => Ok(key.clone()),
            None => {
                log_unknown_key(kid, alg, "unable to find matching key");
                Err(KeyError::UnknownKeyId)
            }
        }
    }
}

fn log_unknown_key(kid: Option<&KeyIdRef>, alg: jwa::Algorithm, message: &'static str) {
    if let Some(kid) = kid {
        tracing::debug!(%kid, %alg, "{}", message);
    } else {
        tracing::debug!(%alg, "{}", message);
    }
}

#[async_trait]
impl<C> HealthProbe for JwkKeyResolver<C>
where
    C: Clock + Send + Sync + 'static,
{
    async fn check(&self, refresh: bool) -> HealthStatus {
        self.resource.check(refresh).await
    }
}
