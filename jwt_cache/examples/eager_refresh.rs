use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use clap::Parser;
use jwt_cache::{expiry::ExpiryExtractor, expiry::JwtExpiry, sources, CacheConfig, TokenCache};
use jwt_cache_clock::{Clock, DurationMillis, System};
use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};
use tokio::time;

#[derive(Debug, Parser)]
struct Opts {
    /// How long each issued token lives, in seconds
    #[arg(short, long, env, default_value_t = 10)]
    lifetime_secs: u64,

    /// How long the simulated issuer takes to respond, in milliseconds
    #[arg(short, long, env, default_value_t = 750)]
    issuer_latency_ms: u64,

    /// Lead time for background refreshes, in milliseconds; zero disables them
    #[arg(short, long, env, default_value_t = 2_000)]
    eager_refresh_ms: u64,

    /// Minimum remaining validity for a token to be served, in milliseconds
    #[arg(short, long, env, default_value_t = 1_000)]
    minimum_validity_ms: u64,

    /// Number of times to poll the cache before exiting
    #[arg(short, long, env, default_value_t = 30)]
    polls: u32,
}

fn mint(exp: u64, serial: u64) -> String {
    let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"none","typ":"JWT"}"#);
    let claims = serde_json::json!({ "sub": "demo", "exp": exp, "jti": serial });
    format!("{header}.{}.", URL_SAFE_NO_PAD.encode(claims.to_string()))
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    dotenvy::dotenv().ok();
    color_eyre::install()?;

    tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();

    static ISSUED: AtomicU64 = AtomicU64::new(0);
    let lifetime = DurationMillis::from_secs(opts.lifetime_secs);
    let latency = Duration::from_millis(opts.issuer_latency_ms);

    let source = sources::from_fn(move || async move {
        time::sleep(latency).await;
        let serial = ISSUED.fetch_add(1, Ordering::SeqCst) + 1;
        let exp = (System.now() + lifetime).0 / 1000;
        tracing::info!(serial, exp, "issuer minted token");
        Ok::<_, std::io::Error>(mint(exp, serial))
    });

    let config = CacheConfig::default()
        .with_eager_refresh(DurationMillis(opts.eager_refresh_ms))
        .with_minimum_validity(DurationMillis(opts.minimum_validity_ms));

    let cache = TokenCache::builder(source)
        .with_config(config)
        .on_refresh_error(|error| tracing::error!(%error, "background refresh failed"))
        .build();

    let mut interval = time::interval(Duration::from_millis(500));
    for _ in 0..opts.polls {
        interval.tick().await;

        let started = time::Instant::now();
        let token = cache.get_token().await?;
        let waited_ms = started.elapsed().as_millis() as u64;
        let expiry = JwtExpiry.expiry(&token)?;
        let remaining_ms = (expiry - System.now()).0;

        if waited_ms > 0 {
            tracing::warn!(
                token = format_args!("{:#?}", token),
                waited_ms,
                remaining_ms,
                "pulled token after waiting on the issuer"
            );
        } else {
            tracing::debug!(
                token = format_args!("{:#?}", token),
                remaining_ms,
                "pulled token"
            );
        }
    }

    cache.dispose();
    tracing::info!(
        issued = ISSUED.load(Ordering::SeqCst),
        "done polling, cache disposed"
    );
    Ok(())
}
