use std::time::Duration;

use clap::Parser;
use credence_cache::{backoff, jitter, CacheConfig, HealthProbe, RateLimitConfig};
use credence_clock::{Clock, DurationSecs, System};
use credence_tokens::{
    dto::ClientCredentials, AccessTokenLifecycle, CachedTokenSource, ClientId, ClientSecret,
    LifecycleConfig, TokenSource,
};
use tokio::time;

#[derive(Debug, Parser)]
struct Opts {
    /// The issuing authority's token request URL
    #[arg(short, long, env)]
    token_url: reqwest::Url,

    /// The issuing authority's token revocation URL
    #[arg(short, long, env)]
    revoke_url: Option<reqwest::Url>,

    /// The client ID of the client
    #[arg(short, long, env)]
    client_id: ClientId,

    /// The client secret used to identify the client to the issuing authority
    #[arg(short = 's', long, env, hide_env_values = true)]
    client_secret: ClientSecret,

    /// The audience to request a token for
    #[arg(short, long, env)]
    audience: Option<String>,

    /// Refresh this many seconds before the token expires
    #[arg(long, env, default_value_t = 60)]
    preemptive_margin: u64,
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

    let client = reqwest::Client::builder().https_only(true).build()?;

    let mut config = LifecycleConfig::new(
        opts.token_url,
        ClientCredentials {
            client_id: opts.client_id,
            client_secret: opts.client_secret,
        },
    );
    if let Some(revoke_url) = opts.revoke_url {
        config = config.with_revoke_url(revoke_url);
    }
    if let Some(audience) = opts.audience {
        config = config.with_extra_param("audience", audience);
    }

    let token_source = CachedTokenSource::new(
        AccessTokenLifecycle::new(client, config),
        CacheConfig::default()
            .with_eager_fetch(true)
            .with_preemptive_margin(DurationSecs(opts.preemptive_margin))
            .with_outage_ttl(DurationSecs::from_mins(15))
            .with_rate_limit(RateLimitConfig::per_day(1_000)),
    );

    token_source.start().await?;
    token_source.spawn_watcher(
        jitter::RandomEarlyJitter::new(DurationSecs(10)),
        backoff::ErrorBackoffConfig::default(),
    );

    if let Some(token) = token_source.current_token() {
        tracing::info!(
            token = format_args!("{:#?}", token.value()),
            "first access token"
        );
    }

    let mut interval = time::interval(Duration::from_secs(5));
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = tokio::signal::ctrl_c() => break,
        }

        let now = System.now();
        let health = token_source.check(false).await;
        match token_source.current_token() {
            Some(token) if token.is_valid_at(now) => {
                tracing::debug!(
                    healthy = health.success,
                    expires_at = token.expires_at().0,
                    remaining = token.until_expired_at(now).0,
                    "pulled token"
                )
            }
            Some(token) => {
                tracing::error!(
                    healthy = health.success,
                    expires_at = token.expires_at().0,
                    "pulled expired token"
                )
            }
            None => tracing::error!(healthy = health.success, "no token available"),
        }
    }

    tracing::info!("shutting down");
    token_source.close().await;

    Ok(())
}
