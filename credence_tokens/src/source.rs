//! Token sources

use std::sync::Arc;

use async_trait::async_trait;
use credence_cache::{
    backoff::ErrorBackoffConfig, jitter::JitterSource, CacheConfig, CachedResource, HealthProbe,
    HealthStatus, ResourceError,
};
use credence_clock::{Clock, System};

use crate::{AccessToken, AccessTokenLifecycle};

/// An asynchronous source of access tokens
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Gets a valid access token, obtaining a new one if required
    ///
    /// With `force_refresh`, a new token is obtained even if the current one is
    /// still valid.
    async fn get_token(&self, force_refresh: bool) -> Result<Arc<AccessToken>, ResourceError>;

    /// The most recently obtained token, without performing any I/O
    fn current_token(&self) -> Option<Arc<AccessToken>>;
}

#[async_trait]
impl<S: TokenSource + ?Sized> TokenSource for Arc<S> {
    async fn get_token(&self, force_refresh: bool) -> Result<Arc<AccessToken>, ResourceError> {
        (**self).get_token(force_refresh).await
    }

    fn current_token(&self) -> Option<Arc<AccessToken>> {
        (**self).current_token()
    }
}

/// A token source that caches tokens from an [`AccessTokenLifecycle`]
///
/// Tokens are refreshed ahead of expiry according to the [`CacheConfig`]. On
/// [`close`](Self::close), background refreshes are cancelled and the held
/// refresh token is revoked.
#[derive(Debug)]
pub struct CachedTokenSource<C = System>
where
    C: Clock + Send + Sync + 'static,
{
    lifecycle: Arc<AccessTokenLifecycle<C>>,
    resource: CachedResource<Arc<AccessTokenLifecycle<C>>, C>,
}

impl CachedTokenSource {
    /// Constructs a new cached token source using the system clock
    pub fn new(lifecycle: AccessTokenLifecycle, config: CacheConfig) -> Self {
        Self::with_clock(lifecycle, config, System)
    }
}

impl<C> CachedTokenSource<C>
where
    C: Clock + Send + Sync + 'static,
{
    /// Constructs a new cached token source using the given clock
    pub fn with_clock(lifecycle: AccessTokenLifecycle<C>, config: CacheConfig, clock: C) -> Self {
        let lifecycle = Arc::new(lifecycle);
        let resource =
            CachedResource::with_clock("access_token", Arc::clone(&lifecycle), config, clock);
        Self {
            lifecycle,
            resource,
        }
    }

    /// The underlying lifecycle
    #[inline]
    pub fn lifecycle(&self) -> &AccessTokenLifecycle<C> {
        &self.lifecycle
    }

    /// The underlying cached resource
    #[inline]
    pub fn resource(&self) -> &CachedResource<Arc<AccessTokenLifecycle<C>>, C> {
        &self.resource
    }

    /// Obtains the first token if the cache is configured to be eager
    pub async fn start(&self) -> Result<(), ResourceError> {
        self.resource.start().await
    }

    /// Spawns a task which refreshes the token in the background whenever it is due
    pub fn spawn_watcher<J>(&self, jitter_source: J, backoff_config: ErrorBackoffConfig)
    where
        J: JitterSource + Send + 'static,
    {
        self.resource.spawn_watcher(jitter_source, backoff_config)
    }

    /// Cancels background refreshes and revokes the held refresh token
    ///
    /// The most recent access token remains available until it expires.
    pub async fn close(&self) {
        self.resource.close();
        self.lifecycle.close().await;
    }
}

#[async_trait]
impl<C> TokenSource for CachedTokenSource<C>
where
    C: Clock + Send + Sync + 'static,
{
    async fn get_token(&self, force_refresh: bool) -> Result<Arc<AccessToken>, ResourceError> {
        self.resource.get(force_refresh).await
    }

    fn current_token(&self) -> Option<Arc<AccessToken>> {
        self.resource.peek()
    }
}

#[async_trait]
impl<C> HealthProbe for CachedTokenSource<C>
where
    C: Clock + Send + Sync + 'static,
{
    async fn check(&self, refresh: bool) -> HealthStatus {
        self.resource.check(refresh).await
    }
}

/// A token source that always provides the same token
///
/// Useful for statically configured credentials and for tests.
#[derive(Clone, Debug)]
pub struct ConstTokenSource {
    token: Arc<AccessToken>,
}

impl ConstTokenSource {
    /// Constructs a new source for `token`
    pub fn new(token: AccessToken) -> Self {
        Self {
            token: Arc::new(token),
        }
    }
}

#[async_trait]
impl TokenSource for ConstTokenSource {
    async fn get_token(&self, _force_refresh: bool) -> Result<Arc<AccessToken>, ResourceError> {
        Ok(Arc::clone(&self.token))
    }

    fn current_token(&self) -> Option<Arc<AccessToken>> {
        Some(Arc::clone(&self.token))
    }
}
