//! Middleware to automatically attach authorization to outgoing requests
//!
//! When using [`ClientWithMiddleware`](reqwest_middleware::ClientWithMiddleware),
//! include the [`AccessTokenMiddleware`] in the middleware stack to use the
//! current access token provided by a [`TokenSource`] for each outbound request.
//!
//! If a request already has specified an `Authorization` header value by
//! the time that the middleware executes, the existing value will be left
//! in place, allowing overrides to be specified as required.
//!
//! ```
//! use std::sync::Arc;
//!
//! use credence_reqwest::AccessTokenMiddleware;
//! use reqwest::Client;
//! use reqwest_middleware::ClientBuilder;
//! # use credence_clock::UnixTime;
//! # use credence_tokens::{AccessToken, ConstTokenSource, TokenType, TokenValue};
//! #
//! # #[tokio::main(flavor = "current_thread")] async fn main() {
//! # let token_source = ConstTokenSource::new(AccessToken::new(
//! #     TokenValue::from_static("token"),
//! #     TokenType::from_static("Bearer"),
//! #     UnixTime(u64::MAX),
//! # ));
//!
//! let client = ClientBuilder::new(Client::default())
//!     .with(AccessTokenMiddleware::new(Arc::new(token_source)))
//!     .build();
//!
//! let req = client
//!     .get("https://example.com");
//! # async move { req
//!     .send()
//!     .await
//!     .unwrap();
//! # };
//! # }
//! ```
//!
//! The middleware can also be configured to add an authorization token
//! only conditionally. This can be useful in the event that you want to
//! use a single common middleware stack with multiple potential backends
//! and want to ensure that specific tokens are used for specific backends.
//!
//! These predicates can be composed together to evaluate more complex
//! requirements prior to attaching a token to a request.
//!
//! ```
//! # use std::sync::Arc;
//! use credence_reqwest::{AccessTokenMiddleware, ExactHostMatch, HttpsOnly};
//! use predicates::prelude::PredicateBooleanExt;
//! # use credence_clock::UnixTime;
//! # use credence_tokens::{AccessToken, ConstTokenSource, TokenType, TokenValue};
//! # let token_source = ConstTokenSource::new(AccessToken::new(
//! #     TokenValue::from_static("token"),
//! #     TokenType::from_static("Bearer"),
//! #     UnixTime(u64::MAX),
//! # ));
//!
//! AccessTokenMiddleware::new(Arc::new(token_source))
//!     .with_predicate(HttpsOnly.and(ExactHostMatch::new("example.com")));
//! ```
//!
//! # Recovering from rejected tokens
//!
//! A downstream service may reject a token before it expires, for example after
//! the authority revoked it. With a [`RateLimitedRecoveryHandler`] attached, a
//! `401 Unauthorized` response to a request carrying our token forces a refresh
//! of the token source in the background. The response itself is still returned
//! to the caller unchanged.

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    missing_copy_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

use std::{fmt, sync::Arc};

use credence_tokens::{RateLimitedRecoveryHandler, TokenSource};
use predicates::{prelude::*, reflection};
use reqwest::{header, Request, Response, StatusCode};
use reqwest_middleware::{Error, Middleware, Next, Result};

/// A middleware that injects an access token into outgoing requests
#[derive(Clone)]
pub struct AccessTokenMiddleware<P> {
    token_source: Arc<dyn TokenSource>,
    recovery: Option<Arc<RateLimitedRecoveryHandler>>,
    predicate: P,
}

impl<P: fmt::Debug> fmt::Debug for AccessTokenMiddleware<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessTokenMiddleware")
            .field("recovery", &self.recovery)
            .field("predicate", &self.predicate)
            .finish_non_exhaustive()
    }
}

impl AccessTokenMiddleware<HttpsOnly> {
    /// Construct a new middleware from a token source
    ///
    /// By default, this middleware will only send its token if the request
    /// is being sent via HTTPS. To change this behavior, provide a
    /// custom predicate with [`with_predicate()`][Self::with_predicate()].
    pub fn new(token_source: Arc<dyn TokenSource>) -> Self {
        Self {
            token_source,
            recovery: None,
            predicate: HttpsOnly,
        }
    }

    /// Replaces the default predicate with a custom predicate
    pub fn with_predicate<P>(self, predicate: P) -> AccessTokenMiddleware<P> {
        AccessTokenMiddleware {
            token_source: self.token_source,
            recovery: self.recovery,
            predicate,
        }
    }
}

impl<P> AccessTokenMiddleware<P> {
    /// Forces a token refresh through `recovery` whenever a request carrying
    /// our token is answered with `401 Unauthorized`
    pub fn with_recovery(mut self, recovery: Arc<RateLimitedRecoveryHandler>) -> Self {
        self.recovery = Some(recovery);
        self
    }

    async fn authorization_from_source(&self) -> Result<String> {
        let token = self
            .token_source
            .get_token(false)
            .await
            .map_err(Error::middleware)?;

        tracing::trace!(
            token.expires_at = token.expires_at().0,
            "obtained access token"
        );

        Ok(token.authorization_header())
    }
}

#[async_trait::async_trait]
impl<P> Middleware for AccessTokenMiddleware<P>
where
    P: Predicate<Request> + Send + Sync + 'static,
{
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut http::Extensions,
        next: Next<'_>,
    ) -> Result<Response> {
        let mut sent = None;
        if self.predicate.eval(&req) && !req.headers().contains_key(header::AUTHORIZATION) {
            let authorization = self.authorization_from_source().await?;
            let mut value =
                header::HeaderValue::from_str(&authorization).map_err(Error::middleware)?;
            value.set_sensitive(true);
            req.headers_mut().insert(header::AUTHORIZATION, value);
            sent = Some(authorization);
        }

        let response = next.run(req, extensions).await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            if let (Some(recovery), Some(authorization)) = (&self.recovery, sent) {
                let outcome =
                    recovery.handle(Arc::clone(&self.token_source), authorization.as_str());
                tracing::debug!(?outcome, "access token rejected downstream");
            }
        }

        Ok(response)
    }
}

/// Only attach an access token if the request is being sent over HTTPS
#[derive(Clone, Copy, Debug)]
pub struct HttpsOnly;

impl Predicate<Request> for HttpsOnly {
    #[inline]
    fn eval(&self, req: &Request) -> bool {
        req.url().scheme() == "https"
    }

    fn find_case(&self, expected: bool, req: &Request) -> Option<reflection::Case> {
        let result = self.eval(req);
        if result != expected {
            Some(
                reflection::Case::new(Some(self), result).add_product(reflection::Product::new(
                    "scheme",
                    req.url().scheme().to_owned(),
                )),
            )
        } else {
            None
        }
    }
}

impl reflection::PredicateReflection for HttpsOnly {}
impl fmt::Display for HttpsOnly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("scheme is https")
    }
}

/// Only attach an access token if the request is being sent to the exact host specified
#[derive(Clone, Debug)]
pub struct ExactHostMatch {
    host: String,
}

impl ExactHostMatch {
    /// Construct a new predicate from a host string
    pub fn new<S>(host: S) -> Self
    where
        S: ToString,
    {
        Self {
            host: host.to_string(),
        }
    }
}

impl Predicate<Request> for ExactHostMatch {
    #[inline]
    fn eval(&self, req: &Request) -> bool {
        req.url().host_str() == Some(&self.host)
    }

    fn find_case(&self, expected: bool, req: &Request) -> Option<reflection::Case> {
        let result = self.eval(req);
        if result != expected {
            Some(
                reflection::Case::new(Some(self), result).add_product(reflection::Product::new(
                    "host",
                    req.url().host_str().unwrap_or("<no host>").to_owned(),
                )),
            )
        } else {
            None
        }
    }
}

impl reflection::PredicateReflection for ExactHostMatch {}
impl fmt::Display for ExactHostMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("host == ")?;
        f.write_str(&self.host)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use async_trait::async_trait;
    use credence_cache::{RateLimitConfig, ResourceError};
    use credence_clock::UnixTime;
    use credence_tokens::{AccessToken, ConstTokenSource, TokenType, TokenValue};
    use reqwest::Client;
    use reqwest_middleware::ClientBuilder;

    use super::*;

    type TokenResult = std::result::Result<Arc<AccessToken>, ResourceError>;

    const TEST_TOKEN: &str = "this-is-a-test-token";
    const BEARER_TEST_TOKEN: &str = "Bearer this-is-a-test-token";

    fn token(value: String) -> AccessToken {
        AccessToken::new(
            TokenValue::new(value),
            TokenType::from_static("Bearer"),
            UnixTime(u64::MAX),
        )
    }

    struct AuthChecker {
        expected_authorization: String,
        checked: AtomicBool,
    }

    impl AuthChecker {
        pub fn new(expected: impl Into<String>) -> Self {
            Self {
                expected_authorization: expected.into(),
                checked: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl Middleware for AuthChecker {
        async fn handle(
            &self,
            req: Request,
            _: &mut http::Extensions,
            _: Next<'_>,
        ) -> Result<Response> {
            let authorization_header = req
                .headers()
                .get(header::AUTHORIZATION)
                .expect("no authorization header")
                .to_str()
                .expect("authorization header was not valid UTF-8");

            assert_eq!(authorization_header, self.expected_authorization);
            self.checked.store(true, Ordering::Release);

            Ok(http::Response::<&[u8]>::default().into())
        }
    }

    #[derive(Default)]
    struct NoAuthChecker {
        checked: AtomicBool,
    }

    #[async_trait]
    impl Middleware for NoAuthChecker {
        async fn handle(
            &self,
            req: Request,
            _: &mut http::Extensions,
            _: Next<'_>,
        ) -> Result<Response> {
            assert_eq!(req.headers().get(header::AUTHORIZATION), None);
            self.checked.store(true, Ordering::Release);

            Ok(http::Response::<&[u8]>::default().into())
        }
    }

    /// Rejects every request and records the authorization it was given
    #[derive(Default)]
    struct Rejecter {
        seen: parking_lot::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Middleware for Rejecter {
        async fn handle(
            &self,
            req: Request,
            _: &mut http::Extensions,
            _: Next<'_>,
        ) -> Result<Response> {
            if let Some(value) = req.headers().get(header::AUTHORIZATION) {
                self.seen
                    .lock()
                    .push(value.to_str().expect("valid header").to_owned());
            }

            let response = http::Response::builder()
                .status(StatusCode::UNAUTHORIZED)
                .body("")
                .expect("valid response");
            Ok(response.into())
        }
    }

    /// Hands out `token-0`, then `token-1` after a forced refresh, and so on
    #[derive(Default)]
    struct RotatingSource {
        refreshes: AtomicU32,
    }

    #[async_trait]
    impl TokenSource for RotatingSource {
        async fn get_token(&self, force_refresh: bool) -> TokenResult {
            if force_refresh {
                self.refreshes.fetch_add(1, Ordering::SeqCst);
            }
            Ok(self.current_token().expect("always has a token"))
        }

        fn current_token(&self) -> Option<Arc<AccessToken>> {
            let n = self.refreshes.load(Ordering::SeqCst);
            Some(Arc::new(token(format!("token-{n}"))))
        }
    }

    struct FailingSource;

    #[async_trait]
    impl TokenSource for FailingSource {
        async fn get_token(&self, _: bool) -> TokenResult {
            Err(ResourceError::RateLimited)
        }

        fn current_token(&self) -> Option<Arc<AccessToken>> {
            None
        }
    }

    fn prepare_middleware() -> AccessTokenMiddleware<HttpsOnly> {
        AccessTokenMiddleware::new(Arc::new(ConstTokenSource::new(token(TEST_TOKEN.to_owned()))))
    }

    mod when_request_does_not_have_an_authorization_header {
        use super::*;

        #[tokio::test]
        async fn middleware_with_defaults_attaches_token_on_https_request() {
            let auth_checker = Arc::new(AuthChecker::new(BEARER_TEST_TOKEN));

            let client = ClientBuilder::new(Client::default())
                .with(prepare_middleware())
                .with_arc(auth_checker.clone())
                .build();

            let resp = client.get("https://example.com").send().await.unwrap();

            assert_eq!(resp.status(), StatusCode::OK);
            assert!(auth_checker.checked.load(Ordering::Acquire));
        }

        #[tokio::test]
        async fn middleware_with_defaults_does_not_attach_token_on_http_request() {
            let auth_checker = Arc::new(NoAuthChecker::default());

            let client = ClientBuilder::new(Client::default())
                .with(prepare_middleware())
                .with_arc(auth_checker.clone())
                .build();

            let resp = client.get("http://example.com").send().await.unwrap();

            assert_eq!(resp.status(), StatusCode::OK);
            assert!(auth_checker.checked.load(Ordering::Acquire));
        }

        #[tokio::test]
        async fn unavailable_token_fails_the_request() {
            let client = ClientBuilder::new(Client::default())
                .with(AccessTokenMiddleware::new(Arc::new(FailingSource)))
                .with(NoAuthChecker::default())
                .build();

            let err = client.get("https://example.com").send().await.unwrap_err();

            assert!(matches!(err, Error::Middleware(_)));
        }

        mod and_predicate_evaluates_to_ignore {
            use super::*;

            #[tokio::test]
            async fn middleware_does_not_attach_access_token() {
                let middleware = prepare_middleware().with_predicate(predicate::never());
                let auth_checker = Arc::new(NoAuthChecker::default());

                let client = ClientBuilder::new(Client::default())
                    .with(middleware)
                    .with_arc(auth_checker.clone())
                    .build();

                let resp = client.get("https://example.com").send().await.unwrap();

                assert_eq!(resp.status(), StatusCode::OK);
                assert!(auth_checker.checked.load(Ordering::Acquire));
            }
        }
    }

    mod when_request_already_contains_an_authorization_header {
        use super::*;

        #[tokio::test]
        async fn middleware_does_not_attach_access_token() {
            const OVERRIDE_TOKEN: &str = "overridden!";
            // Reqwest uses a capital `B` bearer
            const BEARER_OVERRIDE_TOKEN: &str = "Bearer overridden!";

            let auth_checker = Arc::new(AuthChecker::new(BEARER_OVERRIDE_TOKEN));

            let client = ClientBuilder::new(Client::default())
                .with(prepare_middleware())
                .with_arc(auth_checker.clone())
                .build();

            let resp = client
                .get("https://example.com")
                .bearer_auth(OVERRIDE_TOKEN)
                .send()
                .await
                .unwrap();

            assert_eq!(resp.status(), StatusCode::OK);
            assert!(auth_checker.checked.load(Ordering::Acquire));
        }
    }

    mod when_downstream_rejects_the_token {
        use super::*;

        fn client_with_recovery(
            source: Arc<RotatingSource>,
            recovery: Arc<RateLimitedRecoveryHandler>,
            rejecter: Arc<Rejecter>,
        ) -> reqwest_middleware::ClientWithMiddleware {
            ClientBuilder::new(Client::default())
                .with(AccessTokenMiddleware::new(source).with_recovery(recovery))
                .with_arc(rejecter)
                .build()
        }

        #[tokio::test]
        async fn token_is_refreshed_for_the_next_request() {
            let source = Arc::new(RotatingSource::default());
            let recovery = Arc::new(RateLimitedRecoveryHandler::new(RateLimitConfig::per_day(10)));
            let rejecter = Arc::new(Rejecter::default());
            let client = client_with_recovery(source.clone(), recovery.clone(), rejecter.clone());

            let resp = client.get("https://example.com").send().await.unwrap();
            assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

            recovery.idle().await;
            assert_eq!(source.refreshes.load(Ordering::SeqCst), 1);

            client.get("https://example.com").send().await.unwrap();
            recovery.idle().await;
            assert_eq!(
                *rejecter.seen.lock(),
                vec!["Bearer token-0".to_owned(), "Bearer token-1".to_owned()]
            );
        }

        #[tokio::test]
        async fn recovery_is_rate_limited() {
            let source = Arc::new(RotatingSource::default());
            let recovery = Arc::new(RateLimitedRecoveryHandler::new(RateLimitConfig::per_day(1)));
            let rejecter = Arc::new(Rejecter::default());
            let client = client_with_recovery(source.clone(), recovery.clone(), rejecter);

            for _ in 0..3 {
                client.get("https://example.com").send().await.unwrap();
                recovery.idle().await;
            }

            assert_eq!(source.refreshes.load(Ordering::SeqCst), 1);
        }

        #[tokio::test]
        async fn overridden_authorization_is_not_recovered() {
            let source = Arc::new(RotatingSource::default());
            let recovery = Arc::new(RateLimitedRecoveryHandler::new(RateLimitConfig::per_day(10)));
            let rejecter = Arc::new(Rejecter::default());
            let client = client_with_recovery(source.clone(), recovery.clone(), rejecter);

            client
                .get("https://example.com")
                .bearer_auth("someone-elses-token")
                .send()
                .await
                .unwrap();
            recovery.idle().await;

            assert_eq!(source.refreshes.load(Ordering::SeqCst), 0);
        }
    }

    mod https_only_predicate {
        use super::*;

        #[test]
        fn matches_when_request_has_https_scheme() {
            let request =
                Request::new(reqwest::Method::GET, "https://example.com".parse().unwrap());
            let predicate = HttpsOnly;
            let result = dbg!(predicate.find_case(true, &request));
            assert!(result.is_none())
        }

        #[test]
        fn does_not_match_when_request_has_http_scheme() {
            let request = Request::new(reqwest::Method::GET, "http://example.com".parse().unwrap());
            let predicate = HttpsOnly;
            let result = dbg!(predicate.find_case(false, &request));
            assert!(result.is_none())
        }
    }

    mod exact_host_match_predicate {
        use super::*;

        #[test]
        fn matches_when_request_has_same_host() {
            let request =
                Request::new(reqwest::Method::GET, "https://example.com".parse().unwrap());
            let predicate = ExactHostMatch::new("example.com");
            let result = dbg!(predicate.find_case(true, &request));
            assert!(result.is_none())
        }

        #[test]
        fn does_not_match_when_request_has_different_host() {
            let request = Request::new(
                reqwest::Method::GET,
                "http://does-not-match.com".parse().unwrap(),
            );
            let predicate = ExactHostMatch::new("example.com");
            let result = dbg!(predicate.find_case(false, &request));
            assert!(result.is_none())
        }
    }
}
