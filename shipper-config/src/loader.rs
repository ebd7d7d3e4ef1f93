use std::path::Path;

use tracing::{debug, warn};

use crate::error::{ConfigLoadError, Result};
use crate::models::{Config, FileConfig};

/// Assembles the effective [`Config`] from, in increasing precedence:
/// compiled-in defaults, an optional TOML file, and `SHIPPER_*` environment
/// variables. CLI flags are applied by the binary crate afterwards (see
/// `shipper-config::cli::Args::apply_overrides`), matching the
/// defaults → file → env → CLI precedence the teacher workspace uses for its
/// own `ExtConfig::from_env()` plus CLI-argument overrides in
/// `ferrex-server/src/main.rs`.
pub fn load(config_path: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    if let Some(path) = config_path {
        debug!("loading config file {}", path.display());
        let file_config = load_file(path)?;
        config.apply_file(file_config);
    }

    apply_env(&mut config)?;
    config.validate()?;
    Ok(config)
}

fn load_file(path: &Path) -> Result<FileConfig> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigLoadError::FileRead {
        path: path.display().to_string(),
        source,
    })?;

    let settings = config::Config::builder()
        .add_source(config::File::from_str(&contents, config::FileFormat::Toml))
        .build()?;

    settings.try_deserialize().map_err(ConfigLoadError::from)
}

/// Overlays `SHIPPER_*` environment variables onto an already-assembled
/// config. Uses `config::Environment` with a double-underscore separator so
/// `SHIPPER_REDIS__HOST` maps to `redis.host` the same way nested `FileConfig`
/// sections do.
fn apply_env(config: &mut Config) -> Result<()> {
    let env_source = config::Environment::with_prefix("SHIPPER")
        .separator("__")
        .try_parsing(true);

    let settings = match config::Config::builder()
        .add_source(env_source)
        .build()
    {
        Ok(settings) => settings,
        Err(err) => {
            warn!("failed to read SHIPPER_* environment overrides: {err}");
            return Ok(());
        }
    };

    if let Ok(file_config) = settings.try_deserialize::<FileConfig>() {
        config.apply_file(file_config);
    }

    if let Ok(password) = std::env::var("SHIPPER_REDIS_PASSWORD") {
        if !password.is_empty() {
            config.redis.password = Some(crate::models::RedisPassword::new(password));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_with_no_file() {
        let config = load(None).expect("defaults must validate");
        assert_eq!(config.poll_interval_secs, 20);
        assert_eq!(config.reconcile_interval_secs, 21_600);
        assert_eq!(config.redis_stream_prefix, "hsm:actions");
    }

    #[test]
    fn file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            poll_interval_secs = 5
            [redis]
            host = "redis.internal"
            port = 6380
            "#
        )
        .unwrap();

        let config = load(Some(file.path())).expect("file config must load");
        assert_eq!(config.poll_interval_secs, 5);
        assert_eq!(config.redis.host, "redis.internal");
        assert_eq!(config.redis.port, 6380);
    }

    #[test]
    fn rejects_zero_poll_interval() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "poll_interval_secs = 0").unwrap();

        let err = load(Some(file.path())).unwrap_err();
        assert!(matches!(err, ConfigLoadError::MustBePositive { .. }));
    }

    #[test]
    fn rejects_zero_redis_port() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[redis]\nport = 0").unwrap();

        let err = load(Some(file.path())).unwrap_err();
        assert!(matches!(err, ConfigLoadError::InvalidRedisPort(_)));
    }

    #[test]
    fn missing_config_file_reports_file_read_error() {
        let err = load_file(Path::new("/nonexistent/shipper-config-test.toml")).unwrap_err();
        assert!(matches!(err, ConfigLoadError::FileRead { .. }));
    }
}
