use thiserror::Error;

/// Failures that can occur while assembling the effective [`crate::Config`].
#[derive(Error, Debug)]
pub enum ConfigLoadError {
    #[error("failed to read config file {path}: {source}")]
    FileRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] config::ConfigError),

    #[error("invalid redis port: {0}")]
    InvalidRedisPort(String),

    #[error("{field} must be greater than zero")]
    MustBePositive { field: &'static str },
}

pub type Result<T> = std::result::Result<T, ConfigLoadError>;
