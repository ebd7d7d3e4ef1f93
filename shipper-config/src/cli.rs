use std::path::PathBuf;

use clap::Parser;

use crate::models::Config;

/// Command-line arguments for the shipper binary. Anything left `None` falls
/// through to the assembled file/environment configuration (see
/// `ferrex-server/src/main.rs`'s `Args`, which overrides `ExtConfig` fields
/// the same way).
#[derive(Parser, Debug)]
#[command(name = "hsm-action-shipper", version, about)]
pub struct Args {
    /// Path to an optional TOML config file.
    #[arg(long, env = "SHIPPER_CONFIG_PATH")]
    pub config: Option<PathBuf>,

    /// Glob matching Lustre HSM action-log files (overrides config).
    #[arg(long, env = "SHIPPER_MDT_WATCH_GLOB")]
    pub mdt_watch_glob: Option<String>,

    /// Path to the durable cache file (overrides config).
    #[arg(long, env = "SHIPPER_CACHE_PATH")]
    pub cache_path: Option<PathBuf>,

    /// Seconds between shipper poll cycles (overrides config).
    #[arg(long, env = "SHIPPER_POLL_INTERVAL_SECS")]
    pub poll_interval_secs: Option<u64>,

    /// Redis host (overrides config).
    #[arg(long, env = "SHIPPER_REDIS_HOST")]
    pub redis_host: Option<String>,

    /// Redis port (overrides config).
    #[arg(long, env = "SHIPPER_REDIS_PORT")]
    pub redis_port: Option<u16>,

    /// Run exactly one poll cycle (plus a maintenance pass if due) and exit.
    #[arg(long)]
    pub run_once: bool,

    /// Diagnostic verbosity, forwarded to `RUST_LOG` if unset.
    #[arg(long, env = "SHIPPER_LOG_LEVEL")]
    pub log_level: Option<String>,
}

impl Args {
    /// Applies CLI overrides on top of an assembled [`Config`]. CLI flags
    /// are the highest-precedence source, matching the teacher's pattern of
    /// letting `Args` win over `ExtConfig::from_env()`.
    pub fn apply_overrides(&self, config: &mut Config) {
        if let Some(ref v) = self.mdt_watch_glob {
            config.mdt_watch_glob = v.clone();
        }
        if let Some(ref v) = self.cache_path {
            config.cache_path = v.clone();
        }
        if let Some(v) = self.poll_interval_secs {
            config.poll_interval_secs = v;
        }
        if let Some(ref v) = self.redis_host {
            config.redis.host = v.clone();
        }
        if let Some(v) = self.redis_port {
            config.redis.port = v;
        }
        if let Some(ref v) = self.log_level {
            config.log_level = v.clone();
        }
    }
}
