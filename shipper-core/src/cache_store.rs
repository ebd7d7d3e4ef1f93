//! Cache Store (§4.4): durable, atomically-replaced JSON file holding the
//! last-known state of every live action.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{Result, ShipperError};
use crate::types::{Cache, CacheEntry, PrimaryKey};

fn key_to_string(key: &PrimaryKey) -> String {
    format!("{}|{}|{}", key.mdt, key.cat_idx, key.rec_idx)
}

fn key_from_string(raw: &str) -> Option<PrimaryKey> {
    let mut parts = raw.splitn(3, '|');
    let mdt = parts.next()?.to_string();
    let cat_idx: u64 = parts.next()?.parse().ok()?;
    let rec_idx: u64 = parts.next()?.parse().ok()?;
    Some(PrimaryKey::new(mdt, cat_idx, rec_idx))
}

/// Loads the durable Cache from `path`. Returns an empty cache (and logs a
/// warning) if the file is missing or malformed — per §4.4, a bad cache file
/// must never prevent the shipper from starting.
pub async fn load(path: &Path) -> Cache {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            debug!("no cache file at {}, starting empty", path.display());
            return Cache::new();
        }
        Err(err) => {
            warn!("failed to read cache file {}: {err}", path.display());
            return Cache::new();
        }
    };

    let raw: BTreeMap<String, CacheEntry> = match serde_json::from_str(&contents) {
        Ok(raw) => raw,
        Err(err) => {
            warn!("cache file {} is malformed: {err}", path.display());
            return Cache::new();
        }
    };

    raw.into_iter()
        .filter_map(|(key, entry)| {
            let parsed = key_from_string(&key)?;
            Some((parsed, entry))
        })
        .collect()
}

/// Serializes `cache` and atomically replaces `path` with it: write to
/// `<path>.tmp`, `fsync`, then rename over the final path (§4.4). A crash at
/// any point leaves either the previous or the new version intact.
pub async fn commit(path: &Path, cache: &Cache) -> Result<()> {
    let raw: BTreeMap<String, &CacheEntry> = cache
        .iter()
        .map(|(key, entry)| (key_to_string(key), entry))
        .collect();
    let json = serde_json::to_vec_pretty(&raw)?;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| ShipperError::CacheWrite {
                path: path.display().to_string(),
                source,
            })?;
    }

    let tmp_path = tmp_path_for(path);
    write_and_sync(&tmp_path, &json)
        .await
        .map_err(|source| ShipperError::CacheWrite {
            path: tmp_path.display().to_string(),
            source,
        })?;

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|source| ShipperError::CacheWrite {
            path: path.display().to_string(),
            source,
        })?;

    debug!("committed cache ({} entries) to {}", cache.len(), path.display());
    Ok(())
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

fn last_maintenance_path(cache_path: &Path) -> PathBuf {
    let mut path = cache_path.as_os_str().to_owned();
    path.push(".last-maintenance");
    PathBuf::from(path)
}

/// Unix timestamp of the last completed maintenance pass, or `None` if no
/// pass has ever completed (fresh install, or the marker file is missing).
/// `--run-once` uses this to decide whether a pass is due (§4.6 "Runs on a
/// timer"); the long-running daemon instead tracks due-ness with its own
/// in-memory interval timer (`lib.rs::run_daemon`) and never reads this file.
pub async fn load_last_maintenance(cache_path: &Path) -> Option<i64> {
    let path = last_maintenance_path(cache_path);
    let contents = tokio::fs::read_to_string(&path).await.ok()?;
    contents.trim().parse().ok()
}

/// Atomically records `timestamp` as the time of the last completed
/// maintenance pass, using the same write-tmp-then-rename pattern as
/// [`commit`].
pub async fn commit_last_maintenance(cache_path: &Path, timestamp: i64) -> Result<()> {
    let path = last_maintenance_path(cache_path);
    let tmp_path = tmp_path_for(&path);

    write_and_sync(&tmp_path, timestamp.to_string().as_bytes())
        .await
        .map_err(|source| ShipperError::CacheWrite {
            path: tmp_path.display().to_string(),
            source,
        })?;

    tokio::fs::rename(&tmp_path, &path)
        .await
        .map_err(|source| ShipperError::CacheWrite {
            path: path.display().to_string(),
            source,
        })?;

    Ok(())
}

async fn write_and_sync(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;

    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(contents).await?;
    file.sync_all().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PrimaryKey;

    fn sample_entry(mdt: &str, cat_idx: u64, rec_idx: u64) -> CacheEntry {
        CacheEntry {
            mdt: mdt.to_string(),
            cat_idx,
            rec_idx,
            fid: "0x1".to_string(),
            action: "ARCHIVE".to_string(),
            status: "STARTED".to_string(),
            raw: "raw line".to_string(),
            hash: crate::types::digest("raw line"),
            timestamp: 1234,
        }
    }

    #[tokio::test]
    async fn round_trips_through_commit_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");

        let mut cache = Cache::new();
        let key = PrimaryKey::new("testfs-MDT0000", 1, 1);
        cache.insert(key.clone(), sample_entry("testfs-MDT0000", 1, 1));

        commit(&path, &cache).await.unwrap();
        let loaded = load(&path).await;
        assert_eq!(loaded.get(&key), cache.get(&key));
    }

    #[tokio::test]
    async fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("does-not-exist.json");
        let loaded = load(&path).await;
        assert!(loaded.is_empty());
    }

    #[tokio::test]
    async fn malformed_file_loads_empty_with_warning() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        tokio::fs::write(&path, b"not json").await.unwrap();
        let loaded = load(&path).await;
        assert!(loaded.is_empty());
    }

    #[tokio::test]
    async fn commit_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("cache.json");
        let cache = Cache::new();
        commit(&path, &cache).await.unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn no_partial_file_left_behind_after_commit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        let cache = Cache::new();
        commit(&path, &cache).await.unwrap();
        assert!(!tmp_path_for(&path).exists());
    }

    #[tokio::test]
    async fn last_maintenance_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let cache_path = dir.path().join("cache.json");
        assert_eq!(load_last_maintenance(&cache_path).await, None);

        commit_last_maintenance(&cache_path, 1_700_000_000).await.unwrap();
        assert_eq!(load_last_maintenance(&cache_path).await, Some(1_700_000_000));
    }
}
