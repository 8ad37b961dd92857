//! Routing tokens to the verifier for their issuer

use std::{collections::HashMap, sync::Arc};

use aliri::{
    jwt::{self, IssuerRef},
    JwtRef,
};
use aliri_base64::Base64Url;
use async_trait::async_trait;
use credence_cache::{HealthProbe, HealthStatus};
use credence_clock::{Clock, System};
use serde::Deserialize;
use thiserror::Error;

use crate::{Claims, KeysUnavailable, TenantConfig, TenantVerifier, VerifyError};

/// Indicates that two tenants were configured for the same issuer
#[derive(Debug, Error)]
#[error("issuer `{0}` is configured more than once")]
pub struct DuplicateIssuer(jwt::Issuer);

#[derive(Deserialize)]
struct UntrustedIssuer {
    #[serde(default)]
    iss: Option<jwt::Issuer>,
}

/// Verifies tokens from any of several trusted issuers
///
/// The issuer is read from the token before it is verified, and the token is then
/// handed to the verifier for that issuer. The set of tenants is fixed at
/// construction.
#[derive(Debug)]
pub struct MultiTenantVerifier<C = System>
where
    C: Clock + Send + Sync + 'static,
{
    tenants: HashMap<jwt::Issuer, Arc<TenantVerifier<C>>>,
    clock: C,
}

impl MultiTenantVerifier {
    /// Constructs a verifier for each tenant, using the system clock
    pub fn from_tenants(
        client: reqwest::Client,
        tenants: impl IntoIterator<Item = TenantConfig>,
    ) -> Result<Self, DuplicateIssuer> {
        Self::from_tenants_with_clock(client, tenants, System)
    }
}

impl<C> MultiTenantVerifier<C>
where
    C: Clock + Clone + Send + Sync + 'static,
{
    /// Constructs a verifier for each tenant, using the given clock
    pub fn from_tenants_with_clock(
        client: reqwest::Client,
        tenants: impl IntoIterator<Item = TenantConfig>,
        clock: C,
    ) -> Result<Self, DuplicateIssuer> {
        let tenant_clock = clock.clone();
        let verifiers = tenants
            .into_iter()
            .map(move |config| TenantVerifier::with_clock(client.clone(), config, tenant_clock.clone()));
        Self::from_verifiers(verifiers, clock)
    }

    /// Routes between already constructed tenant verifiers
    pub fn from_verifiers(
        verifiers: impl IntoIterator<Item = TenantVerifier<C>>,
        clock: C,
    ) -> Result<Self, DuplicateIssuer> {
        let mut tenants = HashMap::new();
        for verifier in verifiers {
            let issuer = verifier.issuer().to_owned();
            if tenants.contains_key(&issuer) {
                return Err(DuplicateIssuer(issuer));
            }
            tenants.insert(issuer, Arc::new(verifier));
        }

        tracing::debug!(tenants = tenants.len(), "multi-tenant verifier configured");
        Ok(Self { tenants, clock })
    }
}

impl<C> MultiTenantVerifier<C>
where
    C: Clock + Send + Sync + 'static,
{
    /// The verifier for `issuer`, if it is trusted
    pub fn tenant(&self, issuer: &IssuerRef) -> Option<&Arc<TenantVerifier<C>>> {
        self.tenants.get(issuer)
    }

    /// All tenant verifiers
    pub fn tenants(&self) -> impl Iterator<Item = &Arc<TenantVerifier<C>>> {
        self.tenants.values()
    }

    /// Verifies a token, returning its claims if it is acceptable
    ///
    /// Tokens that are malformed, come from an untrusted issuer, or fail verification
    /// all yield `Ok(None)`. An error is returned only when the issuer's keys could not
    /// be obtained, so that callers can respond with a temporary failure rather than
    /// reject the caller.
    pub async fn verify(&self, token: &JwtRef) -> Result<Option<Claims>, KeysUnavailable> {
        match self.verify_detailed(token).await {
            Ok(claims) => Ok(Some(claims)),
            Err(VerifyError::KeysUnavailable(err)) => {
                tracing::warn!(
                    issuer = %err.issuer(),
                    error = (&err as &dyn std::error::Error),
                    "unable to verify token; signing keys unavailable"
                );
                Err(err)
            }
            Err(err) => {
                tracing::debug!(
                    error = (&err as &dyn std::error::Error),
                    "token rejected"
                );
                Ok(None)
            }
        }
    }

    /// Verifies a token, reporting why it was not accepted
    pub async fn verify_detailed(&self, token: &JwtRef) -> Result<Claims, VerifyError> {
        let issuer = untrusted_issuer(token)?;
        let tenant = self.tenants.get(&issuer).ok_or_else(|| {
            tracing::debug!(%issuer, "token from unknown issuer");
            VerifyError::UnknownIssuer
        })?;
        tenant.verify(token).await
    }

    /// Fetches every tenant's keys ahead of the first request, where the cache is eager
    ///
    /// Failures are logged and otherwise ignored; those tenants fetch their keys on
    /// first use instead.
    pub async fn start(&self) {
        for tenant in self.tenants.values() {
            if let Err(err) = tenant.start().await {
                tracing::warn!(
                    issuer = %tenant.issuer(),
                    error = (&err as &dyn std::error::Error),
                    "unable to fetch initial JWKS"
                );
            }
        }
    }

    /// Cancels background key set refreshes for every tenant
    pub fn close(&self) {
        for tenant in self.tenants.values() {
            tenant.close();
        }
    }
}

/// Reads the issuer from a token without verifying it
fn untrusted_issuer(token: &JwtRef) -> Result<jwt::Issuer, VerifyError> {
    let decomposed = token
        .decompose::<jwt::BasicHeaders>()
        .map_err(|e| VerifyError::MalformedToken(Box::new(e)))?;
    let payload = Base64Url::from_encoded(decomposed.untrusted_payload())
        .map_err(|e| VerifyError::MalformedToken(Box::new(e)))?;
    let claims: UntrustedIssuer = serde_json::from_slice(payload.as_slice())
        .map_err(|e| VerifyError::MalformedToken(Box::new(e)))?;
    claims.iss.ok_or(VerifyError::UnknownIssuer)
}

/// Healthy while at least one tenant's keys are available
#[async_trait]
impl<C> HealthProbe for MultiTenantVerifier<C>
where
    C: Clock + Send + Sync + 'static,
{
    async fn check(&self, refresh: bool) -> HealthStatus {
        let now = self.clock.now();
        if self.tenants.is_empty() {
            return HealthStatus::healthy(now);
        }

        let mut unhealthy = Vec::new();
        for tenant in self.tenants.values() {
            if tenant.check(false).await.success {
                return HealthStatus::healthy(now);
            }
            unhealthy.push(tenant);
        }

        if refresh {
            for tenant in unhealthy {
                if tenant.check(true).await.success {
                    return HealthStatus::healthy(self.clock.now());
                }
            }
        }

        HealthStatus::unhealthy(self.clock.now())
    }
}
