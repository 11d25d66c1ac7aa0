//! Attach server (controller side) configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::serde_utils::duration_secs;

/// Default attach listener port
pub const DEFAULT_ATTACH_PORT: u16 = 2377;

/// Configuration for the attach server and its connector
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AttachConfig {
    /// Management address to listen on
    pub host: String,

    pub port: u16,

    /// Request the lossiness check during frame sync
    pub debug: bool,

    /// Deadline for one frame sync attempt
    #[serde(with = "duration_secs")]
    pub handshake_timeout: Duration,

    /// Deadline for an interactor ping round-trip
    #[serde(with = "duration_secs")]
    pub ping_timeout: Duration,

    #[serde(with = "duration_secs")]
    pub keepalive_interval: Duration,

    /// A mux with no keepalive reply for this long is closed
    #[serde(with = "duration_secs")]
    pub keepalive_timeout: Duration,

    /// Expected agent host key fingerprint
    pub pinned_host_key: Option<String>,

    /// Refuse agents whose key does not match `pinned_host_key`
    pub strict_host_key: bool,
}

impl Default for AttachConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_ATTACH_PORT,
            debug: false,
            handshake_timeout: Duration::from_secs(1),
            ping_timeout: Duration::from_secs(5),
            keepalive_interval: Duration::from_secs(30),
            keepalive_timeout: Duration::from_secs(90),
            pinned_host_key: None,
            strict_host_key: false,
        }
    }
}

impl AttachConfig {
    /// `host:port` for binding
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: AttachConfig = toml::from_str("port = 4000\nping_timeout = 2\n").unwrap();
        assert_eq!(config.port, 4000);
        assert_eq!(config.ping_timeout, Duration::from_secs(2));
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.keepalive_timeout, Duration::from_secs(90));
        assert_eq!(config.bind_address(), "127.0.0.1:4000");
    }
}
