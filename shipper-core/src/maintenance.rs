//! Maintenance Worker (§4.6): for each owned stream, replay it to
//! reconstruct stream-state, inject corrective `PURGED`s for orphans, then
//! trim the stream up to the oldest still-live action's introducing ID.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::redis_connector::StreamStore;
use crate::types::{stream_key, Cache, EventType, StreamEvent};

/// Per-`action_key` bookkeeping kept during replay (§9 Open Question): the
/// most recent stream ID (for orphan detection) and the earliest
/// non-purged stream ID (the trim lower bound) are tracked separately.
#[derive(Debug, Clone)]
struct LiveEntry {
    most_recent_id: String,
    earliest_id: String,
    last_event: StreamEvent,
}

#[derive(Debug, Default)]
pub struct MaintenanceReport {
    pub orphans_purged: usize,
    pub trimmed: u64,
    pub stream_discarded: bool,
}

pub struct MaintenanceWorker<S: StreamStore> {
    store: Arc<S>,
    stream_prefix: String,
    replay_chunk_size: usize,
    trim_chunk_size: usize,
    aggressive_trim_threshold: u64,
}

impl<S: StreamStore> MaintenanceWorker<S> {
    pub fn new(
        store: Arc<S>,
        stream_prefix: impl Into<String>,
        replay_chunk_size: usize,
        trim_chunk_size: usize,
        aggressive_trim_threshold: u64,
    ) -> Self {
        Self {
            store,
            stream_prefix: stream_prefix.into(),
            replay_chunk_size,
            trim_chunk_size,
            aggressive_trim_threshold,
        }
    }

    /// Discovers which MDTs this host currently owns a stream for, via
    /// `SCAN` over `<prefix>:*` (§4.6 "owned stream"). Used instead of the
    /// Cache's MDT set so a stream that has gone fully idle (no entries left
    /// in the Cache at all) is still found and discarded.
    pub async fn discover_owned_mdts(&self) -> Result<Vec<String>> {
        let pattern = format!("{}:*", self.stream_prefix);
        let keys = self.store.scan_keys(&pattern).await?;
        let prefix_with_colon = format!("{}:", self.stream_prefix);
        Ok(keys
            .into_iter()
            .filter_map(|key| key.strip_prefix(&prefix_with_colon).map(str::to_string))
            .collect())
    }

    /// Runs one maintenance pass over every MDT owned by this host, using
    /// the handed-off Cache snapshot to detect orphans (§4.6). A failure on
    /// one stream aborts only that stream's pass; other streams still run
    /// (§4.6 "Failure model").
    pub async fn run_cycle(&self, owned_mdts: &[String], cache_snapshot: &Cache) -> HashMap<String, MaintenanceReport> {
        let mut reports = HashMap::new();
        for mdt in owned_mdts {
            let stream = stream_key(&self.stream_prefix, mdt);
            match self.run_stream(&stream, mdt, cache_snapshot).await {
                Ok(report) => {
                    reports.insert(mdt.clone(), report);
                }
                Err(err) => {
                    warn!("maintenance pass for {stream} aborted: {err}");
                }
            }
        }
        reports
    }

    async fn run_stream(&self, stream: &str, mdt: &str, cache_snapshot: &Cache) -> Result<MaintenanceReport> {
        info!("maintenance: replaying {stream}");
        let mut live = self.replay(stream).await?;

        let orphans_purged = self.reconcile(stream, mdt, &mut live, cache_snapshot).await?;

        let mut report = MaintenanceReport {
            orphans_purged,
            ..Default::default()
        };

        if live.is_empty() {
            let removed = self.store.trim_maxlen_zero(stream).await?;
            report.trimmed = removed;
            report.stream_discarded = true;
            info!("maintenance: {stream} has no live actions, discarded ({removed} entries)");
            return Ok(report);
        }

        let oldest_live_id = live
            .values()
            .map(|entry| entry.earliest_id.clone())
            .min_by(|a, b| compare_stream_ids(a, b))
            .expect("live is non-empty");

        let mut total_removed = 0u64;
        loop {
            let removed = self
                .store
                .trim_minid(stream, &oldest_live_id, self.trim_chunk_size)
                .await?;
            total_removed += removed;
            if removed < self.aggressive_trim_threshold {
                break;
            }
            debug!(
                "maintenance: {stream} aggressive trim removed {removed} (>= threshold {}), retrying",
                self.aggressive_trim_threshold
            );
        }
        report.trimmed = total_removed;
        info!("maintenance: {stream} trimmed to minid {oldest_live_id} ({total_removed} entries removed)");
        Ok(report)
    }

    /// (a) Replay: reads the stream from the beginning in pages, building a
    /// map from `action_key` to its most-recent and earliest-non-purged
    /// stream IDs.
    async fn replay(&self, stream: &str) -> Result<HashMap<String, LiveEntry>> {
        let mut live: HashMap<String, LiveEntry> = HashMap::new();
        let mut cursor = "-".to_string();

        loop {
            let page = self
                .store
                .range_read(stream, &cursor, self.replay_chunk_size)
                .await?;
            let page_len = page.len();
            if page.is_empty() {
                break;
            }

            for (id, event) in &page {
                match event.event_type {
                    EventType::New | EventType::Update => {
                        live.entry(event.action_key.clone())
                            .and_modify(|entry| {
                                entry.most_recent_id = id.clone();
                                entry.last_event = event.clone();
                            })
                            .or_insert_with(|| LiveEntry {
                                most_recent_id: id.clone(),
                                earliest_id: id.clone(),
                                last_event: event.clone(),
                            });
                    }
                    EventType::Purged => {
                        live.remove(&event.action_key);
                    }
                }
            }

            if page_len < self.replay_chunk_size {
                break;
            }
            cursor = next_cursor(&page.last().unwrap().0);
        }

        Ok(live)
    }

    /// (b) Reconcile: any `action_key` alive in the replay but whose
    /// `(fid, action)` has no match in the Cache snapshot for this MDT is an
    /// orphan — append a corrective `PURGED` and drop it from `live`.
    async fn reconcile(
        &self,
        stream: &str,
        mdt: &str,
        live: &mut HashMap<String, LiveEntry>,
        cache_snapshot: &Cache,
    ) -> Result<usize> {
        let known_action_keys: std::collections::HashSet<String> = cache_snapshot
            .values()
            .filter(|entry| entry.mdt == mdt)
            .map(|entry| entry.action_key())
            .collect();

        let orphan_keys: Vec<String> = live
            .keys()
            .filter(|key| !known_action_keys.contains(*key))
            .cloned()
            .collect();

        let now = Utc::now().timestamp();
        let mut purge_events = Vec::with_capacity(orphan_keys.len());
        for key in &orphan_keys {
            if let Some(entry) = live.get(key) {
                let mut purged = entry.last_event.clone();
                purged.event_type = EventType::Purged;
                purged.status = "PURGED".to_string();
                purged.timestamp = now;
                purged.raw = None;
                purged.hash = purged.hash.or(Some(crate::types::digest(
                    entry.last_event.raw.as_deref().unwrap_or(""),
                )));
                purge_events.push(purged);
            }
        }

        if !purge_events.is_empty() {
            // An append failure here is a benign deferment (§4.6): the
            // orphan is simply re-detected next cycle.
            match self.store.pipeline_append(stream, &purge_events).await {
                Ok(_) => {
                    for key in &orphan_keys {
                        live.remove(key);
                    }
                }
                Err(err) => {
                    warn!("maintenance: orphan purge append for {stream} deferred: {err}");
                }
            }
        }

        Ok(orphan_keys.len())
    }
}

/// Bumps a stream ID of the form `<ms>-<seq>` to the next exclusive cursor
/// for the following `XRANGE` page.
fn next_cursor(last_id: &str) -> String {
    let mut parts = last_id.splitn(2, '-');
    let ms = parts.next().unwrap_or("0");
    let seq: u64 = parts.next().unwrap_or("0").parse().unwrap_or(0);
    format!("({ms}-{seq}")
}

fn compare_stream_ids(a: &str, b: &str) -> std::cmp::Ordering {
    fn parts(id: &str) -> (u64, u64) {
        let mut split = id.splitn(2, '-');
        let ms: u64 = split.next().unwrap_or("0").parse().unwrap_or(0);
        let seq: u64 = split.next().unwrap_or("0").parse().unwrap_or(0);
        (ms, seq)
    }
    parts(a).cmp(&parts(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::redis_connector::fake::FakeStreamStore;
    use crate::types::{CacheEntry, PrimaryKey};

    fn new_event(mdt: &str, cat_idx: u64, rec_idx: u64, fid: &str, action: &str, status: &str) -> StreamEvent {
        StreamEvent {
            event_type: EventType::New,
            mdt: mdt.to_string(),
            cat_idx,
            rec_idx,
            fid: fid.to_string(),
            action: action.to_string(),
            status: status.to_string(),
            action_key: crate::types::action_key(fid, action),
            timestamp: 0,
            raw: Some(format!("idx=[{cat_idx}/{rec_idx}] action={action} fid=[{fid}] status={status}")),
            hash: None,
        }
    }

    fn purged_event(mdt: &str, cat_idx: u64, rec_idx: u64, fid: &str, action: &str) -> StreamEvent {
        let mut event = new_event(mdt, cat_idx, rec_idx, fid, action, "PURGED");
        event.event_type = EventType::Purged;
        event.raw = None;
        event.hash = Some("deadbeef".to_string());
        event
    }

    #[tokio::test]
    async fn orphan_is_purged_then_stream_discarded() {
        // S3: seed a stream with one NEW, empty cache snapshot (source file
        // empty too), expect a synthetic PURGED then XTRIM MAXLEN 0.
        let store = Arc::new(FakeStreamStore::new());
        let stream = "hsm:actions:testfs-MDT0000";
        store
            .pipeline_append(
                stream,
                &[new_event("testfs-MDT0000", 1, 1, "0xA", "ARCHIVE", "STARTED")],
            )
            .await
            .unwrap();

        let worker = MaintenanceWorker::new(store.clone(), "hsm:actions", 1000, 1000, 5000);
        let reports = worker
            .run_cycle(&["testfs-MDT0000".to_string()], &Cache::new())
            .await;

        let report = &reports["testfs-MDT0000"];
        assert_eq!(report.orphans_purged, 1);
        assert!(report.stream_discarded);

        let entries = store.entries(stream);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].1.event_type, EventType::Purged);
        assert_eq!(entries[1].1.status, "PURGED");
        assert_eq!(entries[1].1.fid, "0xA");
    }

    #[tokio::test]
    async fn trim_preserves_live_action_introducing_id() {
        // S4: NEW for 0xA at t0, many UPDATEs keep 0xA live, NEW+PURGED for
        // 0xB. Cache snapshot has 0xA live. Expect MINID trim with a floor
        // at or before t0, and the first NEW for 0xA survives.
        let store = Arc::new(FakeStreamStore::new());
        let stream = "hsm:actions:testfs-MDT0000";

        store
            .pipeline_append(
                stream,
                &[new_event("testfs-MDT0000", 1, 1, "0xA", "ARCHIVE", "STARTED")],
            )
            .await
            .unwrap();
        for i in 0..10 {
            let mut update = new_event("testfs-MDT0000", 1, 1, "0xA", "ARCHIVE", "WAITING");
            update.event_type = EventType::Update;
            update.raw = Some(format!("update {i}"));
            store.pipeline_append(stream, &[update]).await.unwrap();
        }
        store
            .pipeline_append(
                stream,
                &[new_event("testfs-MDT0000", 2, 2, "0xB", "ARCHIVE", "STARTED")],
            )
            .await
            .unwrap();
        store
            .pipeline_append(stream, &[purged_event("testfs-MDT0000", 2, 2, "0xB", "ARCHIVE")])
            .await
            .unwrap();

        let mut cache = Cache::new();
        cache.insert(
            PrimaryKey::new("testfs-MDT0000", 1, 1),
            CacheEntry {
                mdt: "testfs-MDT0000".into(),
                cat_idx: 1,
                rec_idx: 1,
                fid: "0xA".into(),
                action: "ARCHIVE".into(),
                status: "WAITING".into(),
                raw: "update 9".into(),
                hash: crate::types::digest("update 9"),
                timestamp: 0,
            },
        );

        let worker = MaintenanceWorker::new(store.clone(), "hsm:actions", 1000, 1000, 5000);
        let reports = worker
            .run_cycle(&["testfs-MDT0000".to_string()], &cache)
            .await;
        let report = &reports["testfs-MDT0000"];
        assert_eq!(report.orphans_purged, 0);
        assert!(!report.stream_discarded);

        let entries = store.entries(stream);
        assert!(entries
            .iter()
            .any(|(_, event)| event.fid == "0xA" && event.event_type == EventType::New));
    }

    #[tokio::test]
    async fn aggressive_trim_repeats_until_below_threshold() {
        // S6: 20,000 purged entries then one live action; with a threshold
        // of 5, maintenance must loop trim_minid until the chunk removed
        // falls under the threshold.
        let store = Arc::new(FakeStreamStore::new());
        let stream = "hsm:actions:testfs-MDT0000";

        for i in 0..20_000u64 {
            let event = purged_event("testfs-MDT0000", 9, i, "0xold", "ARCHIVE");
            store.pipeline_append(stream, &[event]).await.unwrap();
        }
        store
            .pipeline_append(
                stream,
                &[new_event("testfs-MDT0000", 1, 1, "0xA", "ARCHIVE", "STARTED")],
            )
            .await
            .unwrap();

        let mut cache = Cache::new();
        cache.insert(
            PrimaryKey::new("testfs-MDT0000", 1, 1),
            CacheEntry {
                mdt: "testfs-MDT0000".into(),
                cat_idx: 1,
                rec_idx: 1,
                fid: "0xA".into(),
                action: "ARCHIVE".into(),
                status: "STARTED".into(),
                raw: "idx=[1/1] action=ARCHIVE fid=[0xA] status=STARTED".into(),
                hash: crate::types::digest("idx=[1/1] action=ARCHIVE fid=[0xA] status=STARTED"),
                timestamp: 0,
            },
        );

        // A large XTRIM LIMIT lets one call remove most of the backlog; the
        // aggressive-trim threshold then forces a second, near-empty call
        // rather than leaving the loop after the first big one.
        let worker = MaintenanceWorker::new(store.clone(), "hsm:actions", 1000, 25_000, 5000);
        let reports = worker
            .run_cycle(&["testfs-MDT0000".to_string()], &cache)
            .await;
        let report = &reports["testfs-MDT0000"];
        assert!(report.trimmed >= 19_999);
    }
}
