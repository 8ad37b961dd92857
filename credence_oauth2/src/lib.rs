//! JWT verification for services that trust several issuers
//!
//! Each trusted issuer (tenant) publishes its signing keys as a JSON Web Key
//! Set. This crate keeps those key sets cached with
//! [`credence_cache::CachedResource`], so verifying a token never waits on the
//! network unless the keys are missing, expired, or have been rotated. When an
//! authority goes down, requests keep being verified against the last keys
//! seen, for as long as the outage cache allows.
//!
//! A [`MultiTenantVerifier`] reads the issuer from an incoming token and hands
//! it to the [`TenantVerifier`] for that issuer. Malformed tokens and tokens
//! from unknown issuers are simply not accepted; only the inability to obtain
//! any keys is reported as an error ([`KeysUnavailable`]), so it can be
//! answered with a `503` rather than a `401`.
//!
//! ```no_run
//! use credence_oauth2::{MultiTenantVerifier, TenantConfig};
//! use aliri::{jwt, JwtRef};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let tenants: Vec<TenantConfig> = serde_json::from_str(r#"[
//!     {
//!         "issuer": "https://tenant-a.example.com/",
//!         "jwk_location": "https://tenant-a.example.com/.well-known/jwks.json",
//!         "audiences": ["orders"]
//!     },
//!     {
//!         "issuer": "https://tenant-b.example.com/",
//!         "jwk_location": "https://tenant-b.example.com/.well-known/jwks.json",
//!         "audiences": ["orders"]
//!     }
//! ]"#)?;
//!
//! let verifier = MultiTenantVerifier::from_tenants(reqwest::Client::new(), tenants)?;
//!
//! let token = JwtRef::from_str("eyJhbGciOi...");
//! match verifier.verify(token).await? {
//!     Some(claims) => println!("authenticated {:?}", claims.subject()),
//!     None => println!("anonymous"),
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Feature flags
//!
//! This crate does not enable TLS support in `reqwest` itself. If your
//! application already uses `reqwest` with some TLS settings, those are used.
//! Otherwise, enable the `default-tls` or `rustls-tls` feature so that keys can
//! be fetched over HTTPS. The `rsa`, `ec`, and `hmac` features select the
//! signing algorithms available through `aliri`.

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

mod claims;
mod constraint;
mod jwks;
mod multi_tenant;
mod tenant;

pub use claims::Claims;
pub use constraint::{ClaimConstraint, JsonType};
pub use jwks::{JwkKeyResolver, JwksFetcher, KeyError};
pub use multi_tenant::{DuplicateIssuer, MultiTenantVerifier};
pub use tenant::{KeysUnavailable, TenantConfig, TenantVerifier, VerifyError};
