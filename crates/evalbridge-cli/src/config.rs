//! Configuration loading.

use evalbridge_types::config::BridgeConfig;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Load configuration from `path`, or the default location.
///
/// A missing, unreadable or unparsable file yields the defaults.
pub fn load_config(path: Option<&Path>) -> BridgeConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(path = %config_path.display(), "Config file not found, using defaults");
        return BridgeConfig::default();
    }

    match std::fs::read_to_string(&config_path) {
        Ok(contents) => match BridgeConfig::from_toml(&contents) {
            Ok(config) => {
                info!(path = %config_path.display(), "Loaded configuration");
                config
            }
            Err(e) => {
                warn!(
                    error = %e,
                    path = %config_path.display(),
                    "Failed to parse config, using defaults"
                );
                BridgeConfig::default()
            }
        },
        Err(e) => {
            warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to read config file, using defaults"
            );
            BridgeConfig::default()
        }
    }
}

/// `~/.evalbridge/config.toml`.
pub fn default_config_path() -> PathBuf {
    evalbridge_home().join("config.toml")
}

pub fn evalbridge_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".evalbridge")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_file_gives_defaults() {
        let config = load_config(Some(Path::new("/nonexistent/evalbridge.toml")));
        assert_eq!(config.peer.port, 7888);
    }

    #[test]
    fn test_loads_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[peer]\nport = 5555\n\n[shell]\ntimeout_secs = 5").unwrap();
        let config = load_config(Some(file.path()));
        assert_eq!(config.peer.port, 5555);
        assert_eq!(config.peer.host, "127.0.0.1");
        assert_eq!(config.shell.timeout_secs, 5);
        assert_eq!(config.session.poll_interval_ms, 50);
    }

    #[test]
    fn test_bad_toml_gives_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[peer\nport = ").unwrap();
        let config = load_config(Some(file.path()));
        assert_eq!(config.peer.port, 7888);
    }

    #[test]
    fn test_default_path() {
        assert!(default_config_path().ends_with(".evalbridge/config.toml"));
    }
}
