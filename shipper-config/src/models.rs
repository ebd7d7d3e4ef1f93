use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Raw configuration as it appears in an optional TOML file. Every field is
/// optional; a missing field falls through to the environment, then to the
/// compiled-in default (see [`Config::assemble`]).
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct FileConfig {
    pub mdt_watch_glob: Option<String>,
    pub cache_path: Option<PathBuf>,
    pub poll_interval_secs: Option<u64>,
    pub reconcile_interval_secs: Option<u64>,
    #[serde(default)]
    pub redis: FileRedisConfig,
    pub redis_stream_prefix: Option<String>,
    pub trim_chunk_size: Option<u64>,
    pub aggressive_trim_threshold: Option<u64>,
    pub replay_chunk_size: Option<u64>,
    pub log_level: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileRedisConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub db: Option<i64>,
    pub password: Option<String>,
    pub connect_timeout_secs: Option<u64>,
    pub read_timeout_secs: Option<u64>,
}

/// A Redis password that zeroizes its backing memory on drop and never
/// appears in `Debug` output, mirroring how the teacher workspace treats
/// auth secrets (see its `zeroize`-backed credential types).
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct RedisPassword(String);

impl RedisPassword {
    pub fn new(value: String) -> Self {
        Self(value)
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for RedisPassword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RedisPassword(\"<redacted>\")")
    }
}

/// Fully assembled, validated configuration for one shipper process.
#[derive(Debug, Clone)]
pub struct Config {
    pub mdt_watch_glob: String,
    pub cache_path: PathBuf,
    pub poll_interval_secs: u64,
    pub reconcile_interval_secs: u64,
    pub redis: RedisConfig,
    pub redis_stream_prefix: String,
    pub trim_chunk_size: u64,
    pub aggressive_trim_threshold: u64,
    pub replay_chunk_size: u64,
    pub log_level: String,
}

#[derive(Clone)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub db: i64,
    pub password: Option<RedisPassword>,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
}

impl fmt::Debug for RedisConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("db", &self.db)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("read_timeout_secs", &self.read_timeout_secs)
            .finish()
    }
}

impl RedisConfig {
    /// A `redis://` connection URL without embedding the password (the
    /// connector supplies it separately via `AUTH`-capable client options).
    pub fn connection_url(&self) -> String {
        format!("redis://{}:{}/{}", self.host, self.port, self.db)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mdt_watch_glob: "/sys/kernel/debug/lustre/mdt/*-MDT????/hsm/actions".to_string(),
            cache_path: PathBuf::from("/var/cache/hsm-action-shipper/cache.json"),
            poll_interval_secs: 20,
            reconcile_interval_secs: 21_600,
            redis: RedisConfig {
                host: "127.0.0.1".to_string(),
                port: 6379,
                db: 0,
                password: None,
                connect_timeout_secs: 5,
                read_timeout_secs: 30,
            },
            redis_stream_prefix: "hsm:actions".to_string(),
            trim_chunk_size: 1_000,
            aggressive_trim_threshold: 5_000,
            replay_chunk_size: 1_000,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Layers a [`FileConfig`] over the compiled-in defaults.
    pub fn apply_file(&mut self, file: FileConfig) {
        if let Some(v) = file.mdt_watch_glob {
            self.mdt_watch_glob = v;
        }
        if let Some(v) = file.cache_path {
            self.cache_path = v;
        }
        if let Some(v) = file.poll_interval_secs {
            self.poll_interval_secs = v;
        }
        if let Some(v) = file.reconcile_interval_secs {
            self.reconcile_interval_secs = v;
        }
        if let Some(v) = file.redis.host {
            self.redis.host = v;
        }
        if let Some(v) = file.redis.port {
            self.redis.port = v;
        }
        if let Some(v) = file.redis.db {
            self.redis.db = v;
        }
        if let Some(v) = file.redis.password {
            self.redis.password = Some(RedisPassword::new(v));
        }
        if let Some(v) = file.redis.connect_timeout_secs {
            self.redis.connect_timeout_secs = v;
        }
        if let Some(v) = file.redis.read_timeout_secs {
            self.redis.read_timeout_secs = v;
        }
        if let Some(v) = file.redis_stream_prefix {
            self.redis_stream_prefix = v;
        }
        if let Some(v) = file.trim_chunk_size {
            self.trim_chunk_size = v;
        }
        if let Some(v) = file.aggressive_trim_threshold {
            self.aggressive_trim_threshold = v;
        }
        if let Some(v) = file.replay_chunk_size {
            self.replay_chunk_size = v;
        }
        if let Some(v) = file.log_level {
            self.log_level = v;
        }
    }

    /// Validates cross-field and range constraints not expressible as types.
    pub fn validate(&self) -> crate::error::Result<()> {
        use crate::error::ConfigLoadError as E;

        if self.redis.port == 0 {
            return Err(E::InvalidRedisPort(self.redis.port.to_string()));
        }
        if self.poll_interval_secs == 0 {
            return Err(E::MustBePositive {
                field: "poll_interval_secs",
            });
        }
        if self.reconcile_interval_secs == 0 {
            return Err(E::MustBePositive {
                field: "reconcile_interval_secs",
            });
        }
        if self.trim_chunk_size == 0 {
            return Err(E::MustBePositive {
                field: "trim_chunk_size",
            });
        }
        if self.replay_chunk_size == 0 {
            return Err(E::MustBePositive {
                field: "replay_chunk_size",
            });
        }
        Ok(())
    }
}
