use thiserror::Error;

/// Error kinds named in the component design, one variant per policy in the
/// error handling design (teacher analogue: `ferrex-core::error::MediaError`).
#[derive(Error, Debug)]
pub enum ShipperError {
    #[error("failed to read source file {path}: {source}")]
    SourceRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse line in {path}: {line}")]
    Parse { path: String, line: String },

    #[error("redis append to stream {stream} failed: {source}")]
    RedisAppend {
        stream: String,
        #[source]
        source: redis::RedisError,
    },

    #[error("redis connection failed: {0}")]
    RedisConnect(#[source] redis::RedisError),

    #[error("failed to write cache file {path}: {source}")]
    CacheWrite {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("maintenance replay of stream {stream} failed: {source}")]
    MaintenanceReplay {
        stream: String,
        #[source]
        source: redis::RedisError,
    },

    #[error("maintenance trim of stream {stream} failed: {source}")]
    MaintenanceTrim {
        stream: String,
        #[source]
        source: redis::RedisError,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ShipperError>;
