//! Agent (container side) configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::serde_utils::{duration_millis, duration_secs};

/// How the agent reaches the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// Dial `controller_address`
    Tcp,
    /// Open `serial_device`
    Serial,
}

/// Configuration for the tether agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub transport: Transport,

    /// Controller listener, used with [`Transport::Tcp`]
    pub controller_address: String,

    /// Serial device bridged to the controller, used with [`Transport::Serial`]
    pub serial_device: PathBuf,

    /// SSH host key; an ephemeral key is generated when unset
    pub key_path: Option<PathBuf>,

    /// Executor configuration describing the sessions to run
    pub executor_config_path: PathBuf,

    /// File holding the container id (first 64 bytes)
    pub container_id_path: PathBuf,

    /// Interval between frame sync attempts
    #[serde(with = "duration_millis")]
    pub handshake_tick: Duration,

    /// Reconnect backoff for the TCP transport
    pub backoff: BackoffConfig,

    /// Program run on fork handoff
    pub fork_helper: Option<PathBuf>,

    /// Answer the lossiness check during frame sync
    pub debug: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            transport: Transport::Tcp,
            controller_address: "127.0.0.1:2377".to_string(),
            serial_device: PathBuf::from("/dev/ttyS1"),
            key_path: None,
            executor_config_path: super::default_config_dir().join("executor.toml"),
            container_id_path: PathBuf::from("/etc/container-id"),
            handshake_tick: Duration::from_millis(10),
            backoff: BackoffConfig::default(),
            fork_helper: None,
            debug: false,
        }
    }
}

/// Exponential backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    #[serde(with = "duration_secs")]
    pub initial: Duration,

    #[serde(with = "duration_secs")]
    pub max: Duration,

    pub multiplier: f64,

    /// Jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.transport, Transport::Tcp);
        assert_eq!(config.controller_address, "127.0.0.1:2377");
        assert_eq!(config.handshake_tick, Duration::from_millis(10));
        assert_eq!(config.backoff.max, Duration::from_secs(60));
    }

    #[test]
    fn test_serial_transport_from_toml() {
        let toml_str = r#"
            transport = "serial"
            serial_device = "/dev/ttyS2"
            handshake_tick = 25

            [backoff]
            initial = 2
        "#;
        let config: AgentConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.transport, Transport::Serial);
        assert_eq!(config.serial_device, PathBuf::from("/dev/ttyS2"));
        assert_eq!(config.handshake_tick, Duration::from_millis(25));
        assert_eq!(config.backoff.initial, Duration::from_secs(2));
        assert_eq!(config.backoff.multiplier, 2.0);
    }
}
