//! State Differ (§4.2): pure comparison of a freshly parsed snapshot against
//! the persistent Cache, emitting `NEW`/`UPDATE`/`PURGED` events.

use std::collections::HashMap;

use chrono::Utc;

use crate::types::{ActionRecord, Cache, CacheEntry, EventType, StreamEvent};

/// `diff(snapshot, cache) -> (events, nextCache)` (§4.2). `snapshot` is keyed
/// by MDT, as produced by [`crate::scanner::Scanner::scan`]. Pure: performs
/// no I/O and takes no lock.
pub fn diff(
    snapshot: &HashMap<String, Vec<ActionRecord>>,
    cache: &Cache,
) -> (Vec<StreamEvent>, Cache) {
    let now = Utc::now().timestamp();
    let mut next_cache = cache.clone();

    let mut live_mdts: std::collections::HashSet<&str> = std::collections::HashSet::new();

    // Group records by (mdt) with (cat_idx, rec_idx) ascending within a
    // group, per §4.2's ordering requirement. NEW and UPDATE are collected
    // separately so the final append order is all-NEW, then all-UPDATE,
    // then all-PURGED, grouped by MDT (§4.2, §3 invariant 4).
    let mut new_events: Vec<StreamEvent> = Vec::new();
    let mut update_events: Vec<StreamEvent> = Vec::new();
    let mut purged_events: Vec<StreamEvent> = Vec::new();

    for (mdt, records) in snapshot {
        live_mdts.insert(mdt.as_str());
        let mut sorted: Vec<&ActionRecord> = records.iter().collect();
        sorted.sort_by_key(|record| (record.cat_idx, record.rec_idx));

        for record in sorted {
            let key = record.primary_key();
            match cache.get(&key) {
                None => {
                    new_events.push(StreamEvent::new_or_update(EventType::New, record, now));
                    next_cache.insert(key, CacheEntry::from_record(record, now));
                }
                Some(existing) if existing.hash != record.hash => {
                    update_events.push(StreamEvent::new_or_update(EventType::Update, record, now));
                    next_cache.insert(key, CacheEntry::from_record(record, now));
                }
                Some(_) => {
                    // unchanged: no event, cache entry stays as-is
                }
            }
        }
    }

    // Any cached key whose MDT didn't appear in this snapshot at all, or
    // whose specific (cat_idx, rec_idx) disappeared from a present MDT's
    // file, is purged (§4.2 step 3, and the "MDT failed away" edge case).
    let mut purged: Vec<&CacheEntry> = cache
        .values()
        .filter(|entry| {
            let key = entry.primary_key();
            !live_mdts.contains(entry.mdt.as_str())
                || !snapshot
                    .get(&entry.mdt)
                    .map(|records| records.iter().any(|r| r.primary_key() == key))
                    .unwrap_or(false)
        })
        .collect();
    purged.sort_by_key(|entry| (entry.mdt.clone(), entry.cat_idx, entry.rec_idx));

    for entry in purged {
        purged_events.push(StreamEvent::purged_from_entry(entry, now));
        next_cache.remove(&entry.primary_key());
    }

    new_events.sort_by_key(|event| (event.mdt.clone(), event.cat_idx, event.rec_idx));
    update_events.sort_by_key(|event| (event.mdt.clone(), event.cat_idx, event.rec_idx));

    let mut events = Vec::with_capacity(new_events.len() + update_events.len() + purged_events.len());
    events.extend(new_events);
    events.extend(update_events);
    events.extend(purged_events);

    (events, next_cache)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::parse_line;
    use std::collections::HashMap;

    fn snapshot(mdt: &str, lines: &[&str]) -> HashMap<String, Vec<ActionRecord>> {
        let records = lines
            .iter()
            .filter_map(|line| parse_line(mdt, line))
            .collect();
        let mut map = HashMap::new();
        map.insert(mdt.to_string(), records);
        map
    }

    #[test]
    fn new_record_emits_new_event() {
        let snap = snapshot(
            "testfs-MDT0000",
            &["idx=[1/1] action=ARCHIVE fid=[0x1] status=STARTED"],
        );
        let (events, next_cache) = diff(&snap, &Cache::new());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::New);
        assert_eq!(events[0].status, "STARTED");
        assert_eq!(next_cache.len(), 1);
    }

    #[test]
    fn changed_raw_emits_update_event() {
        let snap1 = snapshot(
            "testfs-MDT0000",
            &["idx=[1/1] action=ARCHIVE fid=[0x1] status=STARTED"],
        );
        let (_events, cache) = diff(&snap1, &Cache::new());

        let snap2 = snapshot(
            "testfs-MDT0000",
            &["idx=[1/1] action=ARCHIVE fid=[0x1] status=WAITING"],
        );
        let (events, next_cache) = diff(&snap2, &cache);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::Update);
        assert_eq!(events[0].status, "WAITING");
        assert_eq!(next_cache.len(), 1);
    }

    #[test]
    fn unchanged_raw_emits_nothing() {
        let snap = snapshot(
            "testfs-MDT0000",
            &["idx=[1/1] action=ARCHIVE fid=[0x1] status=STARTED"],
        );
        let (_events, cache) = diff(&snap, &Cache::new());
        let (events, _next_cache) = diff(&snap, &cache);
        assert!(events.is_empty());
    }

    #[test]
    fn disappeared_line_emits_purged_with_cached_payload() {
        let snap = snapshot(
            "testfs-MDT0000",
            &["idx=[1/1] action=ARCHIVE fid=[0x1] status=WAITING"],
        );
        let (_events, cache) = diff(&snap, &Cache::new());

        let empty_snap: HashMap<String, Vec<ActionRecord>> = HashMap::new();
        let (events, next_cache) = diff(&empty_snap, &cache);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::Purged);
        assert_eq!(events[0].status, "PURGED");
        assert_eq!(events[0].action, "ARCHIVE");
        assert_eq!(events[0].fid, "0x1");
        assert!(next_cache.is_empty());
    }

    #[test]
    fn mdt_disappearing_entirely_purges_all_its_entries_only() {
        let mut snap = snapshot(
            "testfs-MDT0000",
            &["idx=[1/1] action=ARCHIVE fid=[0x1] status=STARTED"],
        );
        snap.insert(
            "testfs-MDT0001".to_string(),
            parse_line(
                "testfs-MDT0001",
                "idx=[1/1] action=RESTORE fid=[0x2] status=STARTED",
            )
            .into_iter()
            .collect(),
        );
        let (_events, cache) = diff(&snap, &Cache::new());

        snap.remove("testfs-MDT0001");
        let (events, next_cache) = diff(&snap, &cache);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].mdt, "testfs-MDT0001");
        assert_eq!(events[0].event_type, EventType::Purged);
        assert_eq!(next_cache.len(), 1);
        assert!(next_cache.values().all(|e| e.mdt == "testfs-MDT0000"));
    }

    #[test]
    fn new_precedes_update_and_purged_for_same_key_within_batch() {
        // Two different keys: one NEW, one that will be purged. Order must
        // be all-NEW, then all-UPDATE, then all-PURGED (§3 invariant 4).
        let snap1 = snapshot(
            "testfs-MDT0000",
            &[
                "idx=[1/1] action=ARCHIVE fid=[0x1] status=STARTED",
                "idx=[2/2] action=ARCHIVE fid=[0x2] status=STARTED",
            ],
        );
        let (_events, cache) = diff(&snap1, &Cache::new());

        let snap2 = snapshot(
            "testfs-MDT0000",
            &["idx=[1/1] action=ARCHIVE fid=[0x1] status=WAITING"],
        );
        let (events, _next_cache) = diff(&snap2, &cache);
        // key [2/2] purged, key [1/1] updated
        assert_eq!(events[0].event_type, EventType::Update);
        assert_eq!(events[1].event_type, EventType::Purged);
    }
}
