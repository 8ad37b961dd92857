//! Issuing, refreshing, and revoking client credentials tokens

use std::{
    collections::BTreeMap,
    error, fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use credence_cache::{ErrorKind, Fetch, FetchError, Fetched};
use credence_clock::{Clock, System, UnixTime};
use reqwest::header;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{
    dto::{
        ClientCredentials, ClientCredentialsGrant, RefreshTokenGrant, RevokeRequest,
        TokenResponse,
    },
    AccessToken, RefreshToken,
};

/// How request parameters are encoded in the request body
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    /// URL-encoded form data
    #[default]
    Form,
    /// A JSON object
    Json,
}

impl ContentType {
    fn attach_payload<S: Serialize>(
        self,
        request: reqwest::RequestBuilder,
        payload: &S,
    ) -> reqwest::RequestBuilder {
        match self {
            Self::Form => request.form(payload),
            Self::Json => request.json(payload),
        }
    }
}

/// Where and how to obtain tokens from an OAuth2 authority
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LifecycleConfig {
    issue_url: Url,
    #[serde(default)]
    refresh_url: Option<Url>,
    #[serde(default)]
    revoke_url: Option<Url>,
    credentials: ClientCredentials,
    #[serde(default)]
    extra_params: BTreeMap<String, String>,
    #[serde(default)]
    extra_headers: BTreeMap<String, String>,
    #[serde(default)]
    content_type: ContentType,
}

impl LifecycleConfig {
    /// Constructs a configuration which issues tokens from `issue_url`
    ///
    /// Refresh token exchanges are sent to the same URL unless configured otherwise.
    /// Refresh tokens are not revoked unless a revocation URL is configured.
    pub fn new(issue_url: Url, credentials: ClientCredentials) -> Self {
        Self {
            issue_url,
            refresh_url: None,
            revoke_url: None,
            credentials,
            extra_params: BTreeMap::new(),
            extra_headers: BTreeMap::new(),
            content_type: ContentType::Form,
        }
    }

    /// Sends refresh token exchanges to `url`
    pub fn with_refresh_url(mut self, url: Url) -> Self {
        self.refresh_url = Some(url);
        self
    }

    /// Revokes refresh tokens at `url` on close
    pub fn with_revoke_url(mut self, url: Url) -> Self {
        self.revoke_url = Some(url);
        self
    }

    /// Adds a parameter to issue and refresh requests, such as an `audience`
    pub fn with_extra_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_params.insert(name.into(), value.into());
        self
    }

    /// Adds a header to every request made to the authority
    pub fn with_extra_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_headers.insert(name.into(), value.into());
        self
    }

    /// Sends request parameters as a JSON body rather than form data
    pub fn using_json(mut self) -> Self {
        self.content_type = ContentType::Json;
        self
    }

    /// The client credentials
    #[inline]
    pub fn credentials(&self) -> &ClientCredentials {
        &self.credentials
    }

    /// The token issuing endpoint
    #[inline]
    pub fn issue_url(&self) -> &Url {
        &self.issue_url
    }

    /// The refresh token exchange endpoint
    #[inline]
    pub fn refresh_url(&self) -> &Url {
        self.refresh_url.as_ref().unwrap_or(&self.issue_url)
    }

    /// The refresh token revocation endpoint, if any
    #[inline]
    pub fn revoke_url(&self) -> Option<&Url> {
        self.revoke_url.as_ref()
    }
}

/// The lifecycle state of the held token
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    /// No token is held
    NoToken,
    /// A token is being issued with client credentials
    Issuing,
    /// A valid token has been obtained
    Valid,
    /// A refresh token is being exchanged for a new token
    Refreshing,
    /// The refresh token is being revoked
    Revoking,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::NoToken => "no token",
            Self::Issuing => "issuing",
            Self::Valid => "valid",
            Self::Refreshing => "refreshing",
            Self::Revoking => "revoking",
        })
    }
}

/// Obtains access tokens from an OAuth2 authority using the client credentials flow
///
/// When the authority hands out refresh tokens, the next fetch exchanges the held
/// refresh token instead, falling back to the client credentials grant if that
/// exchange fails. The held refresh token is taken out of the lifecycle before it
/// is exchanged or revoked, so it is never used twice.
///
/// Authority responses are classified as follows: `429` and `503` are
/// [`TemporarilyUnavailable`](ErrorKind::TemporarilyUnavailable), any other
/// unsuccessful status is a [`Client`](ErrorKind::Client) error, and unparsable
/// bodies are [`Malformed`](ErrorKind::Malformed).
#[derive(Debug)]
pub struct AccessTokenLifecycle<C = System> {
    client: reqwest::Client,
    config: LifecycleConfig,
    refresh_token: ArcSwapOption<RefreshToken>,
    state: parking_lot::Mutex<LifecycleState>,
    closed: AtomicBool,
    clock: C,
}

impl AccessTokenLifecycle {
    /// Constructs a new lifecycle using the system clock
    pub fn new(client: reqwest::Client, config: LifecycleConfig) -> Self {
        Self::with_clock(client, config, System)
    }
}

impl<C: Clock> AccessTokenLifecycle<C> {
    /// Constructs a new lifecycle using the given clock
    pub fn with_clock(client: reqwest::Client, config: LifecycleConfig, clock: C) -> Self {
        Self {
            client,
            config,
            refresh_token: ArcSwapOption::empty(),
            state: parking_lot::Mutex::new(LifecycleState::NoToken),
            closed: AtomicBool::new(false),
            clock,
        }
    }

    /// The configuration in use
    #[inline]
    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// The current lifecycle state
    pub fn state(&self) -> LifecycleState {
        *self.state.lock()
    }

    fn set_state(&self, state: LifecycleState) {
        let previous = std::mem::replace(&mut *self.state.lock(), state);
        if previous != state {
            tracing::trace!(from = %previous, to = %state, "token lifecycle transition");
        }
    }

    /// Whether an unexpired refresh token is held
    pub fn has_refresh_token(&self) -> bool {
        let now = self.clock.now();
        self.refresh_token
            .load()
            .as_ref()
            .map_or(false, |t| t.is_valid_at(now))
    }

    /// Whether [`close`](Self::close) has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Obtains a new token, preferring the held refresh token when there is one
    pub async fn fetch_token(&self) -> Result<AccessToken, FetchError> {
        if let Some(refresh_token) = self.take_refresh_token(self.clock.now()) {
            match self.exchange(refresh_token).await {
                Ok(token) => return Ok(token),
                Err(error) => {
                    tracing::warn!(
                        error = (&error as &dyn error::Error),
                        "refresh token exchange failed, falling back to client credentials"
                    );
                }
            }
        }

        self.issue().await
    }

    /// Issues a new token using the client credentials grant
    pub async fn issue(&self) -> Result<AccessToken, FetchError> {
        self.set_state(LifecycleState::Issuing);

        let grant = ClientCredentialsGrant {
            credentials: &self.config.credentials,
            extra: &self.config.extra_params,
        };

        match self
            .request_token(&self.config.issue_url, "client_credentials", &grant)
            .await
        {
            Ok(response) => Ok(self.accept(response, None).await),
            Err(error) => {
                self.set_state(LifecycleState::NoToken);
                Err(error)
            }
        }
    }

    /// Exchanges the held refresh token for a new token
    ///
    /// Fails with a client error if no unexpired refresh token is held. The refresh
    /// token is discarded if the exchange fails.
    pub async fn refresh(&self) -> Result<AccessToken, FetchError> {
        let refresh_token = self
            .take_refresh_token(self.clock.now())
            .ok_or_else(|| FetchError::new(ErrorKind::Client, "no valid refresh token held"))?;

        self.exchange(refresh_token).await
    }

    async fn exchange(&self, refresh_token: Arc<RefreshToken>) -> Result<AccessToken, FetchError> {
        self.set_state(LifecycleState::Refreshing);

        let grant = RefreshTokenGrant {
            credentials: &self.config.credentials,
            refresh_token: refresh_token.value(),
            extra: &self.config.extra_params,
        };

        match self
            .request_token(self.config.refresh_url(), "refresh_token", &grant)
            .await
        {
            Ok(response) => Ok(self.accept(response, Some(refresh_token)).await),
            Err(error) => {
                self.set_state(LifecycleState::NoToken);
                Err(error)
            }
        }
    }

    fn take_refresh_token(&self, now: UnixTime) -> Option<Arc<RefreshToken>> {
        let token = self.refresh_token.swap(None)?;
        if token.is_valid_at(now) {
            Some(token)
        } else {
            tracing::debug!("discarding expired refresh token");
            None
        }
    }

    async fn accept(
        &self,
        response: TokenResponse,
        previous: Option<Arc<RefreshToken>>,
    ) -> AccessToken {
        let now = self.clock.now();
        let token = AccessToken::new(
            response.access_token,
            response.token_type,
            now + response.expires_in,
        );

        let rotated = response.refresh_token.is_some();
        let refresh_token = match response.refresh_token {
            Some(value) => Some(Arc::new(RefreshToken::new(
                value,
                response.refresh_expires_in.map(|d| now + d),
            ))),
            None => previous,
        };
        let has_refresh_token = refresh_token.is_some();

        self.set_state(LifecycleState::Valid);

        if let Some(refresh_token) = refresh_token {
            self.retain_refresh_token(refresh_token).await;
        }

        tracing::info!(
            lifetime = response.expires_in.0,
            expires_at = token.expires_at().0,
            has_refresh_token,
            rotated,
            "received new access token"
        );

        token
    }

    async fn retain_refresh_token(&self, refresh_token: Arc<RefreshToken>) {
        if self.is_closed() {
            tracing::debug!("lifecycle closed, revoking refresh token instead of retaining it");
            self.revoke_token(&refresh_token).await;
            return;
        }

        self.refresh_token.store(Some(refresh_token));

        // A close that ran between the check and the store has already swapped
        // the slot empty, so whatever is held now must be revoked here
        if self.is_closed() {
            if let Some(stranded) = self.refresh_token.swap(None) {
                tracing::debug!("lifecycle closed while retaining refresh token, revoking it");
                self.revoke_token(&stranded).await;
            }
        }
    }

    /// Revokes the held refresh token, if any
    ///
    /// Revocation is best effort: failures are logged and otherwise ignored. The
    /// refresh token is taken out of the lifecycle first, so a token is revoked at
    /// most once and cannot be exchanged while it is being revoked.
    pub async fn revoke(&self) {
        let Some(refresh_token) = self.refresh_token.swap(None) else {
            tracing::trace!("no refresh token to revoke");
            return;
        };

        self.set_state(LifecycleState::Revoking);
        self.revoke_token(&refresh_token).await;
        self.set_state(LifecycleState::NoToken);
    }

    async fn revoke_token(&self, refresh_token: &RefreshToken) {
        if !refresh_token.is_valid_at(self.clock.now()) {
            tracing::debug!("refresh token already expired, not revoking");
            return;
        }

        let Some(url) = &self.config.revoke_url else {
            tracing::debug!("no revocation endpoint configured, discarding refresh token");
            return;
        };

        let request = RevokeRequest {
            credentials: &self.config.credentials,
            token: refresh_token.value(),
        };

        match self.build_request(url, &request).send().await {
            Ok(response) if response.status().is_success() => {
                tracing::info!(revoke_url = %url, "refresh token revoked");
            }
            Ok(response) => {
                tracing::warn!(
                    revoke_url = %url,
                    http.status_code = response.status().as_u16(),
                    "refresh token revocation rejected by authority"
                );
            }
            Err(error) => {
                tracing::warn!(
                    revoke_url = %url,
                    error = (&error as &dyn error::Error),
                    "unable to send refresh token revocation"
                );
            }
        }
    }

    /// Stops retaining refresh tokens and revokes the held one
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.revoke().await;
    }

    fn build_request<S: Serialize>(&self, url: &Url, payload: &S) -> reqwest::RequestBuilder {
        let mut request = self
            .config
            .content_type
            .attach_payload(self.client.post(url.clone()), payload)
            .header(header::ACCEPT, "application/json");

        for (name, value) in &self.config.extra_headers {
            request = request.header(name.as_str(), value.as_str());
        }

        request
    }

    #[tracing::instrument(
        err(level = "debug"),
        skip(self, url, payload),
        fields(
            token_url = %url,
            credentials.client_id = %self.config.credentials.client_id,
        ),
    )]
    async fn request_token<S: Serialize>(
        &self,
        url: &Url,
        grant_type: &'static str,
        payload: &S,
    ) -> Result<TokenResponse, FetchError> {
        tracing::trace!("requesting token from authority");

        let response = self
            .build_request(url, payload)
            .send()
            .await
            .map_err(classify_send_error)?;

        let status = response.status();
        tracing::debug!(
            response.status = status.as_u16(),
            "received token response from issuing authority"
        );

        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(ToOwned::to_owned);
            let body = response.text().await.unwrap_or_default();
            return Err(FetchError::from_status(status.as_u16(), body)
                .with_retry_after_header(retry_after.as_deref()));
        }

        let body = response.bytes().await.map_err(FetchError::transport)?;
        serde_json::from_slice(&body).map_err(FetchError::malformed)
    }
}

fn classify_send_error(error: reqwest::Error) -> FetchError {
    if error.is_builder() {
        FetchError::new(ErrorKind::Client, "invalid token request").with_source(error)
    } else {
        FetchError::transport(error)
    }
}

#[async_trait]
impl<C: Clock + Send + Sync + 'static> Fetch for AccessTokenLifecycle<C> {
    type Output = AccessToken;

    async fn fetch(&self) -> Result<Fetched<AccessToken>, FetchError> {
        let token = self.fetch_token().await?;
        let expires_at = token.expires_at();
        Ok(Fetched::expiring_at(token, expires_at))
    }
}
