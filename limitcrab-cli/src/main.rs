mod config;

use anyhow::{Context, Result};
use limitcrab::RedisStore;

use crate::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse configuration from environment variables and CLI arguments
    let config = Config::from_env_and_args()?;

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("limitcrab={}", config.log_level).parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let store = RedisStore::new(config.store_config().await?)
        .await
        .context("failed to open rate limit store")?;

    tracing::info!(
        "Taking {} token(s) from {:?} ({} per {:?}, {:?})",
        config.count,
        config.key,
        store.limits().tokens,
        store.limits().interval,
        store.failure_mode()
    );

    let mut allowed = 0;
    for i in 0..config.count {
        if i > 0 && !config.pause.is_zero() {
            tokio::time::sleep(config.pause).await;
        }

        let result = store.take(&config.key).await;
        if result.allowed {
            allowed += 1;
        }
        println!(
            "{} allowed={} limit={} remaining={} reset={}",
            config.key, result.allowed, result.limit, result.remaining, result.reset
        );
    }

    tracing::info!("{} of {} takes allowed", allowed, config.count);

    store.close().await?;
    Ok(())
}
