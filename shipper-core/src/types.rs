//! The data model (§3): `ActionRecord`, `CacheEntry`, `StreamEvent`,
//! `StreamKey`, and the `(mdt, cat_idx, rec_idx)` primary key.

use std::collections::HashMap;

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

/// `(mdt, cat_idx, rec_idx)` — identifies a distinct line in one MDT's
/// action log (§3, §GLOSSARY).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PrimaryKey {
    pub mdt: String,
    pub cat_idx: u64,
    pub rec_idx: u64,
}

impl PrimaryKey {
    pub fn new(mdt: impl Into<String>, cat_idx: u64, rec_idx: u64) -> Self {
        Self {
            mdt: mdt.into(),
            cat_idx,
            rec_idx,
        }
    }
}

/// `fid + ":" + action` — correlates a logical operation across index
/// changes (§3, §GLOSSARY).
pub fn action_key(fid: &str, action: &str) -> String {
    format!("{fid}:{action}")
}

/// `prefix + ":" + mdt` — the Redis stream key for one MDT (§3).
pub fn stream_key(prefix: &str, mdt: &str) -> String {
    format!("{prefix}:{mdt}")
}

/// Hex digest of a raw action-log line. The spec calls for a "128-bit hex
/// digest", i.e. MD5 — not used for any security property here, only as a
/// cheap change-detection fingerprint.
pub fn digest(raw: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(raw.as_bytes());
    hex::encode(hasher.finalize())
}

/// One live HSM request as parsed from a single action-log line (§3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionRecord {
    pub mdt: String,
    pub cat_idx: u64,
    pub rec_idx: u64,
    pub fid: String,
    pub action: String,
    pub status: String,
    pub raw: String,
    pub hash: String,
}

impl ActionRecord {
    pub fn primary_key(&self) -> PrimaryKey {
        PrimaryKey::new(self.mdt.clone(), self.cat_idx, self.rec_idx)
    }

    pub fn action_key(&self) -> String {
        action_key(&self.fid, &self.action)
    }
}

/// Persisted last-known state for one [`ActionRecord`] (§3, §4.4).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub mdt: String,
    pub cat_idx: u64,
    pub rec_idx: u64,
    pub fid: String,
    pub action: String,
    pub status: String,
    pub raw: String,
    pub hash: String,
    pub timestamp: i64,
}

impl CacheEntry {
    pub fn from_record(record: &ActionRecord, timestamp: i64) -> Self {
        Self {
            mdt: record.mdt.clone(),
            cat_idx: record.cat_idx,
            rec_idx: record.rec_idx,
            fid: record.fid.clone(),
            action: record.action.clone(),
            status: record.status.clone(),
            raw: record.raw.clone(),
            hash: record.hash.clone(),
            timestamp,
        }
    }

    pub fn primary_key(&self) -> PrimaryKey {
        PrimaryKey::new(self.mdt.clone(), self.cat_idx, self.rec_idx)
    }

    pub fn action_key(&self) -> String {
        action_key(&self.fid, &self.action)
    }
}

/// The durable map of last-known action state (§3 invariant 1).
pub type Cache = HashMap<PrimaryKey, CacheEntry>;

/// One unit appended to a stream (§3, §6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventType {
    New,
    Update,
    Purged,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::New => "NEW",
            EventType::Update => "UPDATE",
            EventType::Purged => "PURGED",
        }
    }
}

impl Serialize for EventType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        match raw.as_str() {
            "NEW" => Ok(EventType::New),
            "UPDATE" => Ok(EventType::Update),
            "PURGED" => Ok(EventType::Purged),
            other => Err(serde::de::Error::custom(format!(
                "unknown event_type {other}"
            ))),
        }
    }
}

/// `StreamEvent` — the wire shape appended under the `data` field of each
/// `XADD` (§3, §6). `raw` is carried for `NEW`/`UPDATE`; `hash` for `PURGED`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEvent {
    pub event_type: EventType,
    pub mdt: String,
    pub cat_idx: u64,
    pub rec_idx: u64,
    pub fid: String,
    pub action: String,
    pub status: String,
    pub action_key: String,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

impl StreamEvent {
    pub fn new_or_update(event_type: EventType, record: &ActionRecord, timestamp: i64) -> Self {
        debug_assert!(matches!(event_type, EventType::New | EventType::Update));
        Self {
            event_type,
            mdt: record.mdt.clone(),
            cat_idx: record.cat_idx,
            rec_idx: record.rec_idx,
            fid: record.fid.clone(),
            action: record.action.clone(),
            status: record.status.clone(),
            action_key: record.action_key(),
            timestamp,
            raw: Some(record.raw.clone()),
            hash: None,
        }
    }

    /// Builds a `PURGED` event carrying the last-known payload from a cache
    /// entry, per §3: "all payload fields are carried over from the last-known
    /// CacheEntry so consumers can reason about purges without
    /// cross-referencing earlier entries". `status` is overridden to the
    /// literal string `PURGED`.
    pub fn purged_from_entry(entry: &CacheEntry, timestamp: i64) -> Self {
        Self {
            event_type: EventType::Purged,
            mdt: entry.mdt.clone(),
            cat_idx: entry.cat_idx,
            rec_idx: entry.rec_idx,
            fid: entry.fid.clone(),
            action: entry.action.clone(),
            status: "PURGED".to_string(),
            action_key: entry.action_key(),
            timestamp,
            raw: None,
            hash: Some(entry.hash.clone()),
        }
    }

    pub fn primary_key(&self) -> PrimaryKey {
        PrimaryKey::new(self.mdt.clone(), self.cat_idx, self.rec_idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_stable() {
        let a = digest("idx=[1/1] action=ARCHIVE fid=[0x1] status=STARTED");
        let b = digest("idx=[1/1] action=ARCHIVE fid=[0x1] status=STARTED");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32); // 128 bits as hex
    }

    #[test]
    fn action_key_format() {
        assert_eq!(action_key("0x1", "ARCHIVE"), "0x1:ARCHIVE");
    }

    #[test]
    fn purged_event_overrides_status() {
        let entry = CacheEntry {
            mdt: "testfs-MDT0000".into(),
            cat_idx: 1,
            rec_idx: 1,
            fid: "0x1".into(),
            action: "ARCHIVE".into(),
            status: "WAITING".into(),
            raw: "raw line".into(),
            hash: digest("raw line"),
            timestamp: 0,
        };
        let event = StreamEvent::purged_from_entry(&entry, 100);
        assert_eq!(event.status, "PURGED");
        assert_eq!(event.action, "ARCHIVE");
        assert_eq!(event.hash.as_deref(), Some(entry.hash.as_str()));
        assert!(event.raw.is_none());
    }
}
