//! Verifying tokens issued by a single issuer

use aliri::{
    error::{ClaimsRejected, JwtVerifyError},
    jwa,
    jwt::{self, CoreHeaders, HasAlgorithm},
    JwtRef,
};
use async_trait::async_trait;
use credence_cache::{CacheConfig, HealthProbe, HealthStatus, RateLimitConfig, ResourceError};
use credence_clock::{Clock, DurationSecs, System};
use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::{ClaimConstraint, Claims, JwkKeyResolver, JwksFetcher, KeyError};

/// Indicates that no key material could be obtained for an issuer
///
/// Unlike other verification failures, this says nothing about the token itself.
/// Callers should treat it as a temporary service failure rather than as an
/// authentication failure.
#[derive(Debug, Error)]
#[error("signing keys for issuer `{issuer}` are unavailable")]
pub struct KeysUnavailable {
    issuer: jwt::Issuer,
    #[source]
    source: ResourceError,
}

impl KeysUnavailable {
    /// The issuer whose keys are unavailable
    pub fn issuer(&self) -> &jwt::IssuerRef {
        &self.issuer
    }
}

/// Indicates why a token was not accepted
#[derive(Debug, Error)]
pub enum VerifyError {
    /// The token could not be decoded
    #[error("malformed token")]
    MalformedToken(#[source] Box<dyn std::error::Error + Send + Sync>),
    /// The token names no issuer, or an issuer that is not configured
    #[error("token issuer is not trusted")]
    UnknownIssuer,
    /// The issuer's key set holds no key matching the token
    #[error("no matching key found to validate JWT")]
    UnknownKeyId,
    /// No key material could be obtained for the issuer
    #[error(transparent)]
    KeysUnavailable(#[from] KeysUnavailable),
    /// The signature or the core claims are invalid
    #[error("invalid JWT")]
    JwtVerifyError(#[from] JwtVerifyError),
    /// The token claims to have been issued in the future
    #[error("token issued in the future")]
    IssuedInFuture,
    /// A required claim constraint was not satisfied
    #[error("claim constraint not satisfied: {0}")]
    ClaimRejected(ClaimConstraint),
}

impl VerifyError {
    /// Whether the failure is due to key material being unavailable, rather than
    /// a problem with the token
    pub fn is_keys_unavailable(&self) -> bool {
        matches!(self, Self::KeysUnavailable(_))
    }
}

#[cfg(feature = "rsa")]
fn default_algorithms() -> Vec<jwa::Algorithm> {
    vec![jwa::Algorithm::RS256]
}

#[cfg(not(feature = "rsa"))]
fn default_algorithms() -> Vec<jwa::Algorithm> {
    Vec::new()
}

fn default_unknown_key_rate_limit() -> RateLimitConfig {
    RateLimitConfig {
        capacity: 3,
        refill_amount: 1,
        refill_period: DurationSecs(60),
    }
}

/// The configuration of a trusted issuer
///
/// ```
/// # use credence_oauth2::TenantConfig;
/// let config: TenantConfig = serde_json::from_value(serde_json::json!({
///     "issuer": "https://tenant-a.example.com/",
///     "jwk_location": "https://tenant-a.example.com/.well-known/jwks.json",
///     "audiences": ["orders"],
///     "leeway": 30,
///     "claim_constraints": [
///         { "contains": { "claim": "scope", "value": "orders.read" } }
///     ],
///     "cache": { "outage_ttl": 86400, "preemptive_margin": 300 }
/// })).unwrap();
/// assert_eq!(config.issuer().as_str(), "https://tenant-a.example.com/");
/// ```
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TenantConfig {
    issuer: jwt::Issuer,
    jwk_location: Url,
    #[serde(default)]
    audiences: Vec<jwt::Audience>,
    #[serde(default = "default_algorithms")]
    algorithms: Vec<jwa::Algorithm>,
    #[serde(default)]
    leeway: DurationSecs,
    #[serde(default)]
    claim_constraints: Vec<ClaimConstraint>,
    #[serde(default)]
    cache: CacheConfig,
    #[serde(default = "default_unknown_key_rate_limit")]
    unknown_key_rate_limit: RateLimitConfig,
}

impl TenantConfig {
    /// Trusts tokens from `issuer`, verified with the keys published at `jwk_location`
    ///
    /// By default, tokens signed with RS256 are accepted with no leeway and no
    /// audience restriction. Unknown key IDs cause at most three extra key set
    /// refreshes, replenished at one per minute.
    pub fn new(issuer: jwt::Issuer, jwk_location: Url) -> Self {
        Self {
            issuer,
            jwk_location,
            audiences: Vec::new(),
            algorithms: default_algorithms(),
            leeway: DurationSecs::ZERO,
            claim_constraints: Vec::new(),
            cache: CacheConfig::default(),
            unknown_key_rate_limit: default_unknown_key_rate_limit(),
        }
    }

    /// Requires tokens to be addressed to `audience` (or another allowed audience)
    pub fn with_audience(mut self, audience: jwt::Audience) -> Self {
        self.audiences.push(audience);
        self
    }

    /// Accepts only tokens signed with one of `algorithms`
    pub fn with_algorithms(mut self, algorithms: impl IntoIterator<Item = jwa::Algorithm>) -> Self {
        self.algorithms = algorithms.into_iter().collect();
        self
    }

    /// Allows for clock skew when checking `exp`, `nbf`, and `iat`
    pub fn with_leeway(mut self, leeway: DurationSecs) -> Self {
        self.leeway = leeway;
        self
    }

    /// Adds a constraint that every accepted token must satisfy
    pub fn with_claim_constraint(mut self, constraint: ClaimConstraint) -> Self {
        self.claim_constraints.push(constraint);
        self
    }

    /// Configures caching of the key set
    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    /// Limits key set refreshes caused by unknown key IDs
    pub fn with_unknown_key_rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.unknown_key_rate_limit = rate_limit;
        self
    }

    /// The trusted issuer
    #[inline]
    pub fn issuer(&self) -> &jwt::IssuerRef {
        &self.issuer
    }

    /// Where the issuer publishes its keys
    #[inline]
    pub fn jwk_location(&self) -> &Url {
        &self.jwk_location
    }
}

/// Verifies tokens issued by one trusted issuer
#[derive(Debug)]
pub struct TenantVerifier<C = System>
where
    C: Clock + Send + Sync + 'static,
{
    issuer: jwt::Issuer,
    resolver: JwkKeyResolver<C>,
    validator: jwt::CoreValidator,
    algorithms: Vec<jwa::Algorithm>,
    leeway: DurationSecs,
    constraints: Vec<ClaimConstraint>,
    clock: C,
}

impl TenantVerifier {
    /// Constructs a verifier using the system clock
    pub fn new(client: reqwest::Client, config: TenantConfig) -> Self {
        Self::with_clock(client, config, System)
    }
}

impl<C> TenantVerifier<C>
where
    C: Clock + Clone + Send + Sync + 'static,
{
    /// Constructs a verifier using the given clock
    pub fn with_clock(client: reqwest::Client, config: TenantConfig, clock: C) -> Self {
        let TenantConfig {
            issuer,
            jwk_location,
            audiences,
            algorithms,
            leeway,
            claim_constraints,
            cache,
            unknown_key_rate_limit,
        } = config;

        // Expiry is checked against the verifier's own clock after signature validation
        let validator = jwt::CoreValidator::default()
            .ignore_expiration()
            .with_leeway_secs(leeway.0)
            .extend_approved_algorithms(algorithms.iter().copied())
            .extend_allowed_audiences(audiences)
            .require_issuer(issuer.clone());

        let resolver = JwkKeyResolver::with_clock(
            JwksFetcher::new(client, jwk_location),
            cache,
            &unknown_key_rate_limit,
            clock.clone(),
        );

        Self {
            issuer,
            resolver,
            validator,
            algorithms,
            leeway,
            constraints: claim_constraints,
            clock,
        }
    }
}

impl<C> TenantVerifier<C>
where
    C: Clock + Send + Sync + 'static,
{
    /// The trusted issuer
    #[inline]
    pub fn issuer(&self) -> &jwt::IssuerRef {
        &self.issuer
    }

    /// The key resolver for this issuer
    #[inline]
    pub fn resolver(&self) -> &JwkKeyResolver<C> {
        &self.resolver
    }

    /// Verifies a token from this issuer, returning its claims
    pub async fn verify(&self, token: &JwtRef) -> Result<Claims, VerifyError> {
        let decomposed = token
            .decompose::<jwt::BasicHeaders>()
            .map_err(|e| VerifyError::MalformedToken(Box::new(e)))?;

        let alg = decomposed.alg();
        if !self.algorithms.contains(&alg) {
            tracing::debug!(%alg, "token signed with an algorithm that is not accepted");
            return Err(JwtVerifyError::from(ClaimsRejected::InvalidAlgorithm).into());
        }

        let kid = decomposed.kid().map(ToOwned::to_owned);
        let key = self
            .resolver
            .get_key(kid.as_deref(), alg)
            .await
            .map_err(|e| match e {
                KeyError::UnknownKeyId => VerifyError::UnknownKeyId,
                KeyError::KeysUnavailable(source) => KeysUnavailable {
                    issuer: self.issuer.clone(),
                    source,
                }
                .into(),
            })?;

        let validated: jwt::Validated<Claims> = decomposed.verify(&key, &self.validator)?;
        let (_, claims) = validated.extract();

        let now = self.clock.now();
        match claims.expires_at() {
            Some(exp) if exp + self.leeway < now => {
                tracing::debug!(exp = exp.0, now = now.0, "token expired");
                return Err(JwtVerifyError::from(ClaimsRejected::TokenExpired).into());
            }
            Some(_) => {}
            None => {
                tracing::debug!("token has no expiry");
                return Err(
                    JwtVerifyError::from(ClaimsRejected::MissingRequiredClaim("exp")).into(),
                );
            }
        }

        // `nbf` and `iat` are optional, but must not be in the future when present
        if let Some(nbf) = claims.not_before() {
            if nbf > now + self.leeway {
                tracing::debug!(nbf = nbf.0, now = now.0, "token not yet valid");
                return Err(JwtVerifyError::from(ClaimsRejected::TokenNotYetValid).into());
            }
        }
        if let Some(iat) = claims.issued_at() {
            if iat > now + self.leeway {
                tracing::debug!(iat = iat.0, now = now.0, "token issued in the future");
                return Err(VerifyError::IssuedInFuture);
            }
        }

        if let Some(rejected) = self.constraints.iter().find(|c| !c.is_satisfied_by(&claims)) {
            tracing::debug!(constraint = %rejected, "claim constraint not satisfied");
            return Err(VerifyError::ClaimRejected(rejected.clone()));
        }

        Ok(claims)
    }

    /// Fetches the issuer's keys ahead of the first request, if the cache is eager
    pub async fn start(&self) -> Result<(), ResourceError> {
        self.resolver.resource().start().await
    }

    /// Cancels background key set refreshes
    pub fn close(&self) {
        self.resolver.resource().close();
    }
}

#[async_trait]
impl<C> HealthProbe for TenantVerifier<C>
where
    C: Clock + Send + Sync + 'static,
{
    async fn check(&self, refresh: bool) -> HealthStatus {
        self.resolver.check(refresh).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_requires_issuer_and_location() {
        let result = serde_json::from_value::<TenantConfig>(serde_json::json!({
            "issuer": "https://tenant.example.com/",
        }));
        assert!(result.is_err());
    }

    #[test]
    fn config_rejects_unknown_fields() {
        let result = serde_json::from_value::<TenantConfig>(serde_json::json!({
            "issuer": "https://tenant.example.com/",
            "jwk_location": "https://tenant.example.com/jwks.json",
            "audience": "orders",
        }));
        assert!(result.is_err());
    }

    #[test]
    fn config_defaults() {
        let config = TenantConfig::new(
            jwt::Issuer::from_static("https://tenant.example.com/"),
            "https://tenant.example.com/jwks.json".parse().unwrap(),
        );
        assert_eq!(config.leeway, DurationSecs::ZERO);
        assert_eq!(config.unknown_key_rate_limit.capacity, 3);
        assert!(config.claim_constraints.is_empty());
    }
}
