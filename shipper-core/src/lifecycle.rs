//! Lifecycle Coordinator (§4.7): owns the shutdown flag both long-running
//! tasks poll, and performs the final Cache flush on shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use tracing::info;

use crate::error::Result;
use crate::types::Cache;

/// Shared stop signal: a flag plus a [`Notify`] so waiters can be woken
/// immediately rather than polling on a timer (§4.7 "cooperative shutdown").
#[derive(Clone)]
pub struct Lifecycle {
    stopping: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            stopping: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    pub fn request_stop(&self) {
        if !self.stopping.swap(true, Ordering::SeqCst) {
            info!("shutdown requested");
            self.notify.notify_waiters();
        }
    }

    /// Resolves immediately if a stop has already been requested, otherwise
    /// waits until [`Lifecycle::request_stop`] is called. Callers typically
    /// race this against a poll-interval sleep in a `tokio::select!`.
    pub async fn stopped(&self) {
        if self.is_stopping() {
            return;
        }
        self.notify.notified().await;
    }

    /// Registers SIGTERM/SIGINT handlers that request a stop exactly once
    /// (§4.7). Spawned as a detached background task; the process's main
    /// loop observes the effect through [`Lifecycle::stopped`].
    pub fn spawn_signal_handlers(&self) {
        let lifecycle = self.clone();
        tokio::spawn(async move {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                let mut sigterm = match signal(SignalKind::terminate()) {
                    Ok(sig) => sig,
                    Err(err) => {
                        tracing::warn!("failed to install SIGTERM handler: {err}");
                        return;
                    }
                };
                let mut sigint = match signal(SignalKind::interrupt()) {
                    Ok(sig) => sig,
                    Err(err) => {
                        tracing::warn!("failed to install SIGINT handler: {err}");
                        return;
                    }
                };
                tokio::select! {
                    _ = sigterm.recv() => info!("received SIGTERM"),
                    _ = sigint.recv() => info!("received SIGINT"),
                }
            }
            #[cfg(not(unix))]
            {
                let _ = tokio::signal::ctrl_c().await;
                info!("received ctrl-c");
            }
            lifecycle.request_stop();
        });
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// Final flush on shutdown (§4.7): persists whatever Cache state the caller
/// currently holds. Distinct from [`crate::cache_store::commit`]'s normal
/// per-cycle calls only in when it runs — the logic is identical, so this is
/// a thin, explicitly-named wrapper for readability at call sites.
pub async fn final_flush(cache_path: &std::path::Path, cache: &Cache) -> Result<()> {
    info!("performing final cache flush before exit");
    crate::cache_store::commit(cache_path, cache).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stopped_resolves_immediately_after_request() {
        let lifecycle = Lifecycle::new();
        assert!(!lifecycle.is_stopping());
        lifecycle.request_stop();
        assert!(lifecycle.is_stopping());
        lifecycle.stopped().await;
    }

    #[tokio::test]
    async fn stopped_wakes_waiter_on_request() {
        let lifecycle = Lifecycle::new();
        let waiter = lifecycle.clone();
        let handle = tokio::spawn(async move {
            waiter.stopped().await;
        });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        lifecycle.request_stop();
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("waiter should resolve after stop")
            .unwrap();
    }

    #[tokio::test]
    async fn final_flush_writes_cache_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        final_flush(&path, &Cache::new()).await.unwrap();
        assert!(path.exists());
    }
}
