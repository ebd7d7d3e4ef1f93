//! Core daemon logic for the HSM action shipper: scanning, diffing,
//! publishing, maintenance, and the lifecycle glue that runs them as two
//! cooperating `tokio` tasks (§4, §5).

pub mod cache_store;
pub mod differ;
pub mod error;
pub mod lifecycle;
pub mod maintenance;
pub mod publisher;
pub mod redis_connector;
pub mod scanner;
pub mod types;

use std::sync::Arc;
use std::time::Duration;

use shipper_config::Config;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::lifecycle::Lifecycle;
use crate::maintenance::MaintenanceWorker;
use crate::publisher::Publisher;
use crate::redis_connector::StreamStore;
use crate::scanner::fs::SourceFs;
use crate::scanner::Scanner;
use crate::types::Cache;

/// Wires the Scanner, Differ, and Publisher into the per-cycle loop the
/// daemon runs at `poll_interval_secs` (§4, §5 "Shipper loop"). Generic over
/// [`StreamStore`] so the binary crate can hand this a live
/// [`crate::redis_connector::RedisConnector`] while tests substitute
/// [`crate::redis_connector::fake::FakeStreamStore`].
pub struct ShipperLoop<S: StreamStore> {
    scanner: Scanner,
    publisher: Publisher<S>,
}

impl<S: StreamStore> ShipperLoop<S> {
    pub fn new(fs: Arc<dyn SourceFs>, store: Arc<S>, config: &Config) -> Self {
        Self {
            scanner: Scanner::new(config.mdt_watch_glob.clone(), fs),
            publisher: Publisher::new(
                store,
                config.cache_path.clone(),
                config.redis_stream_prefix.clone(),
            ),
        }
    }

    /// One poll cycle (§4 "Shipper loop"): scan, diff against `cache`, and
    /// publish. Returns the Cache to carry into the next cycle — unchanged
    /// from the input on a publish failure, so the caller's retry is
    /// automatically a re-send of the exact same batch (§8 property 7).
    pub async fn run_once(&self, cache: Cache) -> Cache {
        let snapshot = self.scanner.scan().await;
        let (events, next_cache) = differ::diff(&snapshot, &cache);

        if events.is_empty() {
            return cache;
        }

        match self.publisher.publish(events, next_cache.clone()).await {
            Ok(_) => next_cache,
            Err(err) => {
                error!("poll cycle publish failed, cache unchanged: {err}");
                cache
            }
        }
    }
}

/// Wires the Maintenance Worker into the periodic reconcile/trim loop the
/// daemon runs at `reconcile_interval_secs` (§4.6, §5 "Maintenance Worker").
pub struct MaintenanceLoop<S: StreamStore> {
    worker: MaintenanceWorker<S>,
}

impl<S: StreamStore> MaintenanceLoop<S> {
    pub fn new(store: Arc<S>, config: &Config) -> Self {
        Self {
            worker: MaintenanceWorker::new(
                store,
                config.redis_stream_prefix.clone(),
                config.replay_chunk_size as usize,
                config.trim_chunk_size as usize,
                config.aggressive_trim_threshold,
            ),
        }
    }

    /// One maintenance pass: discover owned streams, then replay/reconcile/
    /// trim each against the handed-off Cache snapshot.
    pub async fn run_once(&self, cache_snapshot: &Cache) {
        let owned_mdts = match self.worker.discover_owned_mdts().await {
            Ok(mdts) => mdts,
            Err(err) => {
                warn!("maintenance pass skipped, could not discover owned streams: {err}");
                return;
            }
        };
        if owned_mdts.is_empty() {
            return;
        }
        let reports = self.worker.run_cycle(&owned_mdts, cache_snapshot).await;
        for (mdt, report) in reports {
            info!(
                "maintenance: {mdt} purged {} orphan(s), trimmed {} entr(ies), discarded={}",
                report.orphans_purged, report.trimmed, report.stream_discarded
            );
        }
    }
}

/// Runs the Shipper loop and Maintenance Worker as two cooperating tasks
/// until `lifecycle` signals a stop, then performs one final Cache flush
/// (§4.7). The Maintenance Worker sees the Shipper loop's Cache through a
/// `watch` channel — the lightest hand-off that always holds the latest
/// snapshot without the Maintenance task ever blocking the Shipper loop
/// (§5 "single writer, read-mostly Cache access").
pub async fn run_daemon<S: StreamStore + 'static>(
    fs: Arc<dyn SourceFs>,
    store: Arc<S>,
    config: Config,
    lifecycle: Lifecycle,
    initial_cache: Cache,
) {
    let (cache_tx, cache_rx) = watch::channel(initial_cache.clone());

    let shipper_handle = {
        let lifecycle = lifecycle.clone();
        let shipper_loop = ShipperLoop::new(fs, store.clone(), &config);
        let cache_path = config.cache_path.clone();
        let poll_interval = Duration::from_secs(config.poll_interval_secs);
        tokio::spawn(async move {
            let mut cache = initial_cache;
            loop {
                cache = shipper_loop.run_once(cache).await;
                let _ = cache_tx.send(cache.clone());

                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => {}
                    _ = lifecycle.stopped() => break,
                }
            }
            if let Err(err) = lifecycle::final_flush(&cache_path, &cache).await {
                error!("final cache flush failed: {err}");
            }
        })
    };

    let maintenance_handle = {
        let lifecycle = lifecycle.clone();
        let maintenance_loop = MaintenanceLoop::new(store, &config);
        let reconcile_interval = Duration::from_secs(config.reconcile_interval_secs);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(reconcile_interval) => {}
                    _ = lifecycle.stopped() => break,
                }
                let cache_snapshot = cache_rx.borrow().clone();
                maintenance_loop.run_once(&cache_snapshot).await;
            }
        })
    };

    let _ = tokio::join!(shipper_handle, maintenance_handle);
}

/// Runs exactly one Shipper poll cycle and, if due, one Maintenance pass,
/// then returns the resulting Cache (§6 "Process controls", `--run-once`).
///
/// Each `--run-once` invocation is a fresh process with no state carried
/// over from the last one, so due-ness for the Maintenance pass can't be
/// tracked in memory the way `run_daemon` tracks it. Instead it is tracked
/// in a marker file next to the Cache (`cache_store::load_last_maintenance`/
/// `commit_last_maintenance`): a pass runs when none has ever completed, or
/// when `reconcile_interval_secs` has elapsed since the last one.
pub async fn run_once<S: StreamStore + 'static>(
    fs: Arc<dyn SourceFs>,
    store: Arc<S>,
    config: &Config,
    cache: Cache,
) -> Cache {
    let shipper_loop = ShipperLoop::new(fs, store.clone(), config);
    let next_cache = shipper_loop.run_once(cache).await;

    let now = chrono::Utc::now().timestamp();
    let last_maintenance = cache_store::load_last_maintenance(&config.cache_path).await;
    let due = match last_maintenance {
        None => true,
        Some(last) => now.saturating_sub(last) >= config.reconcile_interval_secs as i64,
    };

    if due {
        let maintenance_loop = MaintenanceLoop::new(store, config);
        maintenance_loop.run_once(&next_cache).await;
        if let Err(err) = cache_store::commit_last_maintenance(&config.cache_path, now).await {
            error!("failed to record last-maintenance timestamp: {err}");
        }
    }

    next_cache
}
