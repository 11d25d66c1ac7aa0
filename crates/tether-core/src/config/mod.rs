//! Configuration management for tether attach
//!
//! Files are TOML unless their extension is `.json`.

mod agent;
mod attach;
mod executor;
pub mod serde_utils;

pub use agent::{AgentConfig, BackoffConfig, Transport};
pub use attach::AttachConfig;
pub use executor::{Cmd, ExecutorConfig, SessionConfig};

use crate::error::ConfigError;
use std::path::{Path, PathBuf};

/// Get the default configuration directory
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tether")
}

/// Get the default configuration file path for a component (`attach`, `agent`)
pub fn default_config_path(component: &str) -> PathBuf {
    default_config_dir().join(format!("{}.toml", component))
}

fn is_json(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}

/// Load configuration from a file
pub fn load_config<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Invalid(format!("Failed to read config: {}", e)))?;

    if is_json(path) {
        Ok(serde_json::from_str(&content)?)
    } else {
        Ok(toml::from_str(&content)?)
    }
}

/// Save configuration to a file
pub fn save_config<T: serde::Serialize>(path: &Path, config: &T) -> Result<(), ConfigError> {
    let content = if is_json(path) {
        serde_json::to_string_pretty(config)?
    } else {
        toml::to_string_pretty(config)?
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| ConfigError::Invalid(format!("Failed to create config dir: {}", e)))?;
    }

    std::fs::write(path, content)
        .map_err(|e| ConfigError::Invalid(format!("Failed to write config: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        assert!(matches!(
            load_config::<AttachConfig>(&path),
            Err(ConfigError::NotFound(_))
        ));
    }

    #[test]
    fn test_toml_and_json_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AttachConfig::default();
        config.port = 9999;
        config.debug = true;

        for name in ["attach.toml", "nested/attach.json"] {
            let path = dir.path().join(name);
            save_config(&path, &config).unwrap();
            let loaded: AttachConfig = load_config(&path).unwrap();
            assert_eq!(loaded.port, 9999);
            assert!(loaded.debug);
        }

        let json = std::fs::read_to_string(dir.path().join("nested/attach.json")).unwrap();
        assert!(json.trim_start().starts_with('{'));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path("agent");
        assert!(path.ends_with("tether/agent.toml"));
    }
}
