use std::path::PathBuf;

use aliri::Jwt;
use clap::Parser;
use color_eyre::eyre::WrapErr;
use credence_cache::HealthProbe;
use credence_oauth2::{MultiTenantVerifier, TenantConfig};

#[derive(Debug, Parser)]
struct Opts {
    /// A JSON file listing the trusted tenants
    #[arg(short, long, env)]
    tenants: PathBuf,

    /// The tokens to verify
    #[arg(required = true)]
    tokens: Vec<Jwt>,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();

    let raw = std::fs::read_to_string(&opts.tenants)
        .wrap_err_with(|| format!("unable to read {}", opts.tenants.display()))?;
    let tenants: Vec<TenantConfig> =
        serde_json::from_str(&raw).wrap_err("invalid tenant configuration")?;

    let client = reqwest::Client::builder().https_only(true).build()?;
    let verifier = MultiTenantVerifier::from_tenants(client, tenants)?;
    verifier.start().await;

    for token in &opts.tokens {
        match verifier.verify(token).await {
            Ok(Some(claims)) => tracing::info!(
                issuer = ?claims.issuer(),
                subject = ?claims.subject(),
                "token accepted"
            ),
            Ok(None) => {
                let reason = verifier.verify_detailed(token).await.err();
                tracing::warn!(reason = ?reason, "token rejected")
            }
            Err(err) => tracing::error!(
                error = (&err as &dyn std::error::Error),
                "unable to verify token"
            ),
        }
    }

    let health = verifier.check(false).await;
    tracing::info!(healthy = health.success, "verifier health");

    verifier.close();
    Ok(())
}
