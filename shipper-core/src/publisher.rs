//! Publisher (§4.3): partitions events per target stream, appends them via a
//! pipelined `XADD`, and — only on full success — commits the advanced
//! Cache. The at-least-once guarantee (§4.3, §7 `RedisAppend`) falls out of
//! that ordering: a failed flush leaves the Cache untouched, so the next
//! poll cycle re-derives and re-sends the identical batch.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tracing::{error, info};

use crate::cache_store;
use crate::error::Result;
use crate::types::{Cache, StreamEvent};
use crate::redis_connector::StreamStore;

pub struct Publisher<S: StreamStore> {
    store: Arc<S>,
    cache_path: std::path::PathBuf,
    stream_prefix: String,
}

impl<S: StreamStore> Publisher<S> {
    pub fn new(store: Arc<S>, cache_path: impl AsRef<Path>, stream_prefix: impl Into<String>) -> Self {
        Self {
            store,
            cache_path: cache_path.as_ref().to_path_buf(),
            stream_prefix: stream_prefix.into(),
        }
    }

    /// `publish(events, nextCache) -> Ok | Failure` (§4.3). On success,
    /// commits `next_cache` to disk. On any append failure, the Cache is
    /// left untouched and the error is returned so the caller can log it
    /// and retry next cycle.
    ///
    /// §4.3 point 4 also calls for recording, per MDT, the stream ID of the
    /// first `NEW` append in a batch, "for when the Maintenance Worker lacks
    /// a replayed start ID". The Maintenance Worker here never lacks one:
    /// `replay` (§4.6a) always reads each owned stream from the beginning,
    /// so there is no starting-ID hint to feed it, and nothing tracks this
    /// value.
    pub async fn publish(&self, events: Vec<StreamEvent>, next_cache: Cache) -> Result<()> {
        let mut by_stream: HashMap<String, Vec<StreamEvent>> = HashMap::new();
        for event in events {
            let stream = crate::types::stream_key(&self.stream_prefix, &event.mdt);
            by_stream.entry(stream).or_default().push(event);
        }

        // Append every stream's batch before committing the cache: a
        // failure partway through must not advance the cache for *any*
        // stream, since that stream's already-appended events would then
        // never be re-derived (§4.3 "do not update the Cache").
        let mut appended: Vec<(String, Vec<String>)> = Vec::new();
        for (stream, stream_events) in &by_stream {
            match self.store.pipeline_append(stream, stream_events).await {
                Ok(ids) => appended.push((stream.clone(), ids)),
                Err(err) => {
                    error!("publish batch for {stream} failed, cache not advanced: {err}");
                    return Err(err);
                }
            }
        }

        cache_store::commit(&self.cache_path, &next_cache).await?;
        info!(
            "published {} stream(s), {} total append(s)",
            appended.len(),
            appended.iter().map(|(_, ids)| ids.len()).sum::<usize>()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::differ::diff;
    use crate::redis_connector::fake::FakeStreamStore;
    use crate::scanner::parse_line;
    use std::sync::atomic::Ordering;

    fn snapshot(mdt: &str, lines: &[&str]) -> HashMap<String, Vec<crate::types::ActionRecord>> {
        let records = lines.iter().filter_map(|line| parse_line(mdt, line)).collect();
        let mut map = HashMap::new();
        map.insert(mdt.to_string(), records);
        map
    }

    #[tokio::test]
    async fn successful_publish_advances_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache_path = dir.path().join("cache.json");
        let store = Arc::new(FakeStreamStore::new());
        let publisher = Publisher::new(store.clone(), &cache_path, "hsm:actions");

        let snap = snapshot(
            "testfs-MDT0000",
            &["idx=[1/1] action=ARCHIVE fid=[0x1] status=STARTED"],
        );
        let (events, next_cache) = diff(&snap, &Cache::new());
        publisher.publish(events, next_cache.clone()).await.unwrap();

        let loaded = cache_store::load(&cache_path).await;
        assert_eq!(loaded.len(), 1);

        let entries = store.entries("hsm:actions:testfs-MDT0000");
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn failed_publish_leaves_cache_untouched_and_retry_resends_same_events() {
        let dir = tempfile::tempdir().unwrap();
        let cache_path = dir.path().join("cache.json");
        let store = Arc::new(FakeStreamStore::new());
        store.fail_next_append.store(true, Ordering::SeqCst);
        let publisher = Publisher::new(store.clone(), &cache_path, "hsm:actions");

        let snap = snapshot(
            "testfs-MDT0000",
            &["idx=[1/1] action=ARCHIVE fid=[0x1] status=STARTED"],
        );
        let (events, next_cache) = diff(&snap, &Cache::new());
        let err = publisher.publish(events.clone(), next_cache.clone()).await;
        assert!(err.is_err());

        let loaded = cache_store::load(&cache_path).await;
        assert!(loaded.is_empty());

        // Retry: diff against the still-empty cache produces the identical
        // event set (§8 property 7).
        let (retry_events, retry_cache) = diff(&snap, &loaded);
        assert_eq!(retry_events.len(), events.len());
        publisher.publish(retry_events, retry_cache).await.unwrap();
        let loaded = cache_store::load(&cache_path).await;
        assert_eq!(loaded.len(), 1);
    }
}
