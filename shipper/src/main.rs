//! # HSM Action Shipper
//!
//! Tails Lustre MDT `hsm/actions` debugfs logs and ships `NEW`/`UPDATE`/
//! `PURGED` change events to per-MDT Redis Streams, with a background
//! maintenance pass that heals orphaned stream entries and trims history
//! down to the oldest still-live action.
//!
//! ## Architecture
//!
//! - Source Scanner reads the kernel-exposed action logs via glob.
//! - State Differ compares each snapshot against a durable on-disk Cache.
//! - Publisher appends the resulting events to Redis and only then advances
//!   the Cache, giving an at-least-once delivery guarantee.
//! - Maintenance Worker periodically replays each stream to find and purge
//!   orphans, then trims it.

use std::sync::Arc;

use clap::Parser;
use shipper_config::{Args, Config};
use shipper_core::redis_connector::RedisConnector;
use shipper_core::scanner::fs::RealSourceFs;
use shipper_core::types::Cache;
use shipper_core::{cache_store, lifecycle::Lifecycle};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = shipper_config::load(args.config.as_deref())?;
    args.apply_overrides(&mut config);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("shipper={},shipper_core={}", config.log_level, config.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("hsm-action-shipper starting");
    info!("watching {}", config.mdt_watch_glob);
    info!("cache file at {}", config.cache_path.display());
    info!(
        "redis target {}:{}/{}",
        config.redis.host, config.redis.port, config.redis.db
    );

    let connect_result = if args.run_once {
        RedisConnector::connect_bounded(&config.redis, shipper_core::redis_connector::RUN_ONCE_CONNECT_BUDGET).await
    } else {
        RedisConnector::connect(&config.redis).await
    };
    let store = match connect_result {
        Ok(store) => Arc::new(store),
        Err(err) => {
            error!("could not connect to redis: {err}");
            return Err(err.into());
        }
    };
    let fs = Arc::new(RealSourceFs);

    let cache = cache_store::load(&config.cache_path).await;
    info!("loaded cache with {} entr(ies)", cache.len());

    if args.run_once {
        run_once_and_exit(fs, store, config, cache).await
    } else {
        run_forever(fs, store, config, cache).await
    }
}

async fn run_once_and_exit(
    fs: Arc<RealSourceFs>,
    store: Arc<RedisConnector>,
    config: Config,
    cache: Cache,
) -> anyhow::Result<()> {
    let next_cache = shipper_core::run_once(fs, store, &config, cache.clone()).await;
    if let Err(err) = shipper_core::lifecycle::final_flush(&config.cache_path, &next_cache).await {
        error!("failed to persist cache after --run-once: {err}");
        return Err(err.into());
    }
    if next_cache.len() == cache.len() {
        info!("run-once cycle complete, {} entr(ies) in cache", next_cache.len());
    } else {
        info!(
            "run-once cycle complete, cache changed from {} to {} entr(ies)",
            cache.len(),
            next_cache.len()
        );
    }
    Ok(())
}

async fn run_forever(
    fs: Arc<RealSourceFs>,
    store: Arc<RedisConnector>,
    config: Config,
    cache: Cache,
) -> anyhow::Result<()> {
    let lifecycle = Lifecycle::new();
    lifecycle.spawn_signal_handlers();

    info!(
        "shipper loop every {}s, maintenance every {}s",
        config.poll_interval_secs, config.reconcile_interval_secs
    );

    shipper_core::run_daemon(fs, store, config, lifecycle, cache).await;

    warn!("hsm-action-shipper shutting down");
    Ok(())
}
