//! Redis Connector (§4.5): the single reconnecting client exposing the
//! append-batch, scan-keys, range-read, and trim primitives every other
//! component uses. Grounded on the teacher's `ferrex-core::database::cache`
//! `RedisCache`, which wraps a `redis::aio::ConnectionManager` behind typed
//! errors and raw `redis::cmd(...)` calls for operations without a
//! strongly-typed helper (there, `FLUSHDB`; here, `XADD`/`XRANGE`/`XTRIM`).

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use shipper_config::RedisConfig;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Result, ShipperError};
use crate::types::StreamEvent;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// One page of a stream range read: the server-assigned entry ID and its
/// decoded `StreamEvent` payload.
pub type StreamPage = Vec<(String, StreamEvent)>;

/// The primitives the rest of the crate needs against a Redis Stream
/// instance (§4.5, §6). A trait so the Publisher and Maintenance Worker can
/// be unit tested against [`FakeStreamStore`] without a live Redis.
#[async_trait]
pub trait StreamStore: Send + Sync {
    /// `SCAN MATCH pattern` (§6): stream key discovery.
    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>>;

    /// Pipelined `XADD key * data <json>` for each event, in order. Returns
    /// the server-assigned IDs in append order (§4.3).
    async fn pipeline_append(&self, stream: &str, events: &[StreamEvent]) -> Result<Vec<String>>;

    /// One page of `XRANGE key start +`, at most `count` entries, ordered
    /// oldest-first. `start` is `-` for the beginning of the stream or an
    /// exclusive-from-previous-page cursor of the form `id-0` with the last
    /// seen ID's sequence bumped by the caller.
    async fn range_read(&self, stream: &str, start: &str, count: usize) -> Result<StreamPage>;

    /// `XTRIM key MINID ~ min_id LIMIT chunk_size`. Returns the number of
    /// entries removed by this call (approximate trims may remove fewer than
    /// requested, or — if the limit is hit — up to `chunk_size`).
    async fn trim_minid(&self, stream: &str, min_id: &str, chunk_size: usize) -> Result<u64>;

    /// `XTRIM key MAXLEN 0`: discards the stream entirely (§4.6c).
    async fn trim_maxlen_zero(&self, stream: &str) -> Result<u64>;

    /// `DEL key`.
    async fn delete_key(&self, stream: &str) -> Result<()>;
}

/// The real connector: one `ConnectionManager` per process, guarded by a
/// mutex so a pipeline is built and flushed atomically with respect to other
/// callers (§5 "single mutex guarding the Redis connection").
pub struct RedisConnector {
    client: redis::Client,
    conn: Mutex<ConnectionManager>,
}

impl RedisConnector {
    /// Connects with exponential backoff starting at 1s, doubling to a
    /// ceiling of 60s, resetting on success (§4.5). Retries indefinitely —
    /// for the long-running daemon, an unreachable Redis at startup is worth
    /// waiting out rather than exiting.
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        Self::connect_inner(config, None).await
    }

    /// As [`Self::connect`], but gives up and returns `Err` once `budget`
    /// has elapsed without a successful connection, instead of retrying
    /// forever. `--run-once` uses this so an unreachable Redis produces a
    /// non-zero exit within a bounded time instead of hanging (§6 "Process
    /// controls": "non-zero on unrecoverable error... Redis unreachable for
    /// longer than a bounded retry envelope").
    pub async fn connect_bounded(config: &RedisConfig, budget: Duration) -> Result<Self> {
        Self::connect_inner(config, Some(budget)).await
    }

    async fn connect_inner(config: &RedisConfig, budget: Option<Duration>) -> Result<Self> {
        let url = connection_url_with_auth(config);
        let client = redis::Client::open(url).map_err(ShipperError::RedisConnect)?;

        let manager_config = ConnectionManagerConfig::new()
            .set_connection_timeout(Duration::from_secs(config.connect_timeout_secs))
            .set_response_timeout(Duration::from_secs(config.read_timeout_secs));

        let conn = connect_with_backoff(&client, &manager_config, budget).await?;
        info!("connected to redis at {}", config.host);
        Ok(Self {
            client,
            conn: Mutex::new(conn),
        })
    }
}

/// Default retry envelope for `--run-once` connects (§6 "Process controls").
pub const RUN_ONCE_CONNECT_BUDGET: Duration = Duration::from_secs(60);

fn connection_url_with_auth(config: &RedisConfig) -> String {
    match &config.password {
        Some(password) => format!(
            "redis://:{}@{}:{}/{}",
            password.expose(),
            config.host,
            config.port,
            config.db
        ),
        None => config.connection_url(),
    }
}

async fn connect_with_backoff(
    client: &redis::Client,
    manager_config: &ConnectionManagerConfig,
    budget: Option<Duration>,
) -> Result<ConnectionManager> {
    let started = tokio::time::Instant::now();
    let mut backoff = INITIAL_BACKOFF;
    loop {
        match ConnectionManager::new_with_config(client.clone(), manager_config.clone()).await {
            Ok(conn) => return Ok(conn),
            Err(err) => {
                if let Some(budget) = budget {
                    if started.elapsed() >= budget {
                        warn!("redis connect retry envelope ({budget:?}) exhausted: {err}");
                        return Err(ShipperError::RedisConnect(err));
                    }
                }
                warn!("redis connect failed, retrying in {backoff:?}: {err}");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }
}

fn event_to_json(event: &StreamEvent) -> Result<String> {
    Ok(serde_json::to_string(event)?)
}

fn json_to_event(value: &str) -> Result<StreamEvent> {
    Ok(serde_json::from_str(value)?)
}

#[async_trait]
impl StreamStore for RedisConnector {
    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.lock().await;
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next_cursor, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(200)
                .query_async(&mut *conn)
                .await
                .map_err(ShipperError::RedisConnect)?;
            keys.extend(batch);
            if next_cursor == 0 {
                break;
            }
            cursor = next_cursor;
        }
        Ok(keys)
    }

    async fn pipeline_append(&self, stream: &str, events: &[StreamEvent]) -> Result<Vec<String>> {
        if events.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.lock().await;
        let mut pipe = redis::pipe();
        for event in events {
            let json = event_to_json(event)?;
            pipe.cmd("XADD").arg(stream).arg("*").arg("data").arg(json);
        }
        let ids: Vec<String> = pipe
            .query_async(&mut *conn)
            .await
            .map_err(|source| ShipperError::RedisAppend {
                stream: stream.to_string(),
                source,
            })?;
        debug!("appended {} events to {stream}", ids.len());
        Ok(ids)
    }

    async fn range_read(&self, stream: &str, start: &str, count: usize) -> Result<StreamPage> {
        let mut conn = self.conn.lock().await;
        let raw: Vec<(String, Vec<(String, String)>)> = redis::cmd("XRANGE")
            .arg(stream)
            .arg(start)
            .arg("+")
            .arg("COUNT")
            .arg(count)
            .query_async(&mut *conn)
            .await
            .map_err(|source| ShipperError::MaintenanceReplay {
                stream: stream.to_string(),
                source,
            })?;

        let mut page = Vec::with_capacity(raw.len());
        for (id, fields) in raw {
            if let Some((_, json)) = fields.into_iter().find(|(field, _)| field == "data") {
                match json_to_event(&json) {
                    Ok(event) => page.push((id, event)),
                    Err(err) => warn!("skipping unparseable stream entry {id} on {stream}: {err}"),
                }
            }
        }
        Ok(page)
    }

    async fn trim_minid(&self, stream: &str, min_id: &str, chunk_size: usize) -> Result<u64> {
        let mut conn = self.conn.lock().await;
        redis::cmd("XTRIM")
            .arg(stream)
            .arg("MINID")
            .arg("~")
            .arg(min_id)
            .arg("LIMIT")
            .arg(chunk_size)
            .query_async(&mut *conn)
            .await
            .map_err(|source| ShipperError::MaintenanceTrim {
                stream: stream.to_string(),
                source,
            })
    }

    async fn trim_maxlen_zero(&self, stream: &str) -> Result<u64> {
        let mut conn = self.conn.lock().await;
        redis::cmd("XTRIM")
            .arg(stream)
            .arg("MAXLEN")
            .arg(0)
            .query_async(&mut *conn)
            .await
            .map_err(|source| ShipperError::MaintenanceTrim {
                stream: stream.to_string(),
                source,
            })
    }

    async fn delete_key(&self, stream: &str) -> Result<()> {
        let mut conn = self.conn.lock().await;
        redis::cmd("DEL")
            .arg(stream)
            .query_async::<()>(&mut *conn)
            .await
            .map_err(ShipperError::RedisConnect)?;
        Ok(())
    }
}


/// In-memory fake used by Publisher/Maintenance unit tests (§0.5): models
/// each stream as an append-only, ID-ordered list so the real trim/replay
/// algorithms can be exercised deterministically without a live Redis.
pub mod fake {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    pub struct FakeStreamStore {
        streams: StdMutex<HashMap<String, Vec<(u64, StreamEvent)>>>,
        next_id: StdMutex<u64>,
        /// When `Some`, the next `pipeline_append` call fails instead of
        /// succeeding — used to simulate S2 ("transactional replay").
        pub fail_next_append: std::sync::atomic::AtomicBool,
    }

    impl FakeStreamStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn entries(&self, stream: &str) -> Vec<(u64, StreamEvent)> {
            self.streams
                .lock()
                .unwrap()
                .get(stream)
                .cloned()
                .unwrap_or_default()
        }

        fn allocate_id(&self) -> u64 {
            let mut next = self.next_id.lock().unwrap();
            *next += 1;
            *next
        }
    }

    fn fmt_id(id: u64) -> String {
        format!("{id}-0")
    }

    /// Parses a `XRANGE`-style start bound into an inclusive numeric floor.
    /// A leading `(` marks an exclusive bound (as produced by the
    /// maintenance replay's page cursor); the fake store has no separate
    /// notion of exclusivity, so it folds that into "+1".
    fn parse_id(raw: &str) -> u64 {
        let (raw, exclusive) = match raw.strip_prefix('(') {
            Some(rest) => (rest, true),
            None => (raw, false),
        };
        let id: u64 = raw.split('-').next().unwrap_or(raw).parse().unwrap_or(0);
        if exclusive {
            id + 1
        } else {
            id
        }
    }

    #[async_trait]
    impl StreamStore for FakeStreamStore {
        async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
            let prefix = pattern.trim_end_matches('*');
            Ok(self
                .streams
                .lock()
                .unwrap()
                .keys()
                .filter(|k| k.starts_with(prefix))
                .cloned()
                .collect())
        }

        async fn pipeline_append(&self, stream: &str, events: &[StreamEvent]) -> Result<Vec<String>> {
            if self
                .fail_next_append
                .swap(false, std::sync::atomic::Ordering::SeqCst)
            {
                return Err(ShipperError::RedisAppend {
                    stream: stream.to_string(),
                    source: redis::RedisError::from((
                        redis::ErrorKind::IoError,
                        "simulated append failure",
                    )),
                });
            }
            let mut streams = self.streams.lock().unwrap();
            let entry = streams.entry(stream.to_string()).or_default();
            let mut ids = Vec::with_capacity(events.len());
            for event in events {
                let id = self.allocate_id();
                entry.push((id, event.clone()));
                ids.push(fmt_id(id));
            }
            Ok(ids)
        }

        async fn range_read(&self, stream: &str, start: &str, count: usize) -> Result<StreamPage> {
            let from = if start == "-" { 0 } else { parse_id(start) };
            let streams = self.streams.lock().unwrap();
            let entries = streams.get(stream).cloned().unwrap_or_default();
            Ok(entries
                .into_iter()
                .filter(|(id, _)| *id >= from)
                .take(count)
                .map(|(id, event)| (fmt_id(id), event))
                .collect())
        }

        async fn trim_minid(&self, stream: &str, min_id: &str, chunk_size: usize) -> Result<u64> {
            let min = parse_id(min_id);
            let mut streams = self.streams.lock().unwrap();
            let entry = streams.entry(stream.to_string()).or_default();
            let mut removed = 0u64;
            while removed < chunk_size as u64 {
                match entry.first() {
                    Some((id, _)) if *id < min => {
                        entry.remove(0);
                        removed += 1;
                    }
                    _ => break,
                }
            }
            Ok(removed)
        }

        async fn trim_maxlen_zero(&self, stream: &str) -> Result<u64> {
            let mut streams = self.streams.lock().unwrap();
            let entry = streams.entry(stream.to_string()).or_default();
            let removed = entry.len() as u64;
            entry.clear();
            Ok(removed)
        }

        async fn delete_key(&self, stream: &str) -> Result<()> {
            self.streams.lock().unwrap().remove(stream);
            Ok(())
        }
    }
}
