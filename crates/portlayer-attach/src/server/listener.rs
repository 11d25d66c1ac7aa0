//! Attach server
//!
//! Owns the TCP listener agents dial into and the connector fed by it.

use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use tether_core::config::AttachConfig;
use tether_core::{ConnectorError, ContainerId};

use crate::connector::{Connector, SharedInteractor};

/// Listener plus connector lifecycle
pub struct AttachServer {
    config: AttachConfig,
    connector: Mutex<Option<Connector>>,
}

impl AttachServer {
    pub fn new(config: AttachConfig) -> Self {
        Self {
            config,
            connector: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &AttachConfig {
        &self.config
    }

    /// Bind `host:port` and start accepting agents
    ///
    /// `debug` asks every agent for the lossiness check during frame sync.
    pub async fn start(&self, debug: bool) -> Result<()> {
        let mut slot = self.connector.lock().await;
        if slot.is_some() {
            anyhow::bail!("attach server already started");
        }

        let addr = self.config.bind_address();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| ConnectorError::Bind(format!("{}: {}", addr, e)))
            .with_context(|| format!("Failed to bind to {}", addr))?;

        let config = AttachConfig {
            debug: self.config.debug || debug,
            ..self.config.clone()
        };
        let connector = Connector::with_listener(listener, config)
            .context("Failed to read listener address")?;
        connector.start()?;

        tracing::info!(
            "Attach server listening on {}",
            connector.url().unwrap_or_default()
        );
        *slot = Some(connector);
        Ok(())
    }

    /// Close the listener and stop the connector
    pub async fn stop(&self) {
        let connector = self.connector.lock().await.take();
        if let Some(connector) = connector {
            connector.stop().await;
        }
    }

    /// Interactor for `id`
    ///
    /// A zero `timeout` is a single lookup; otherwise the call waits up to
    /// `timeout` for the container to connect.
    pub async fn get(
        &self,
        cancel: &CancellationToken,
        id: &ContainerId,
        timeout: Duration,
    ) -> Result<SharedInteractor, ConnectorError> {
        let connector = self.connector().await.ok_or(ConnectorError::Stopped)?;
        if timeout.is_zero() {
            connector.lookup(id).await
        } else {
            connector.interaction_within(cancel, id, timeout).await
        }
    }

    /// `tcp://host:port` once started
    pub async fn url(&self) -> Option<String> {
        self.connector.lock().await.as_ref().and_then(Connector::url)
    }

    pub async fn connector(&self) -> Option<Connector> {
        self.connector.lock().await.clone()
    }
}

impl std::fmt::Debug for AttachServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachServer")
            .field("bind", &self.config.bind_address())
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn ephemeral() -> AttachConfig {
        AttachConfig {
            port: 0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_start_binds_and_reports_url() {
        let server = AttachServer::new(ephemeral());
        assert!(server.url().await.is_none());

        server.start(false).await.unwrap();
        let url = server.url().await.unwrap();
        assert!(url.starts_with("tcp://127.0.0.1:"));
        assert!(!url.ends_with(":0"));

        assert!(server.start(false).await.is_err());
        server.stop().await;
        assert!(server.url().await.is_none());
    }

    #[tokio::test]
    async fn test_get_before_start() {
        let server = AttachServer::new(ephemeral());
        let cancel = CancellationToken::new();
        let result = server.get(&cancel, &"c1".into(), Duration::ZERO).await;
        assert_eq!(result.err(), Some(ConnectorError::Stopped));
    }

    #[tokio::test]
    async fn test_get_zero_timeout_is_lookup() {
        let server = AttachServer::new(ephemeral());
        server.start(false).await.unwrap();
        let cancel = CancellationToken::new();

        let result = server.get(&cancel, &"c1".into(), Duration::ZERO).await;
        assert_eq!(result.err(), Some(ConnectorError::NotFound("c1".into())));

        let result = server
            .get(&cancel, &"c1".into(), Duration::from_millis(30))
            .await;
        assert_eq!(result.err(), Some(ConnectorError::Timeout));
        server.stop().await;
    }

    #[tokio::test]
    async fn test_bind_conflict() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let server = AttachServer::new(AttachConfig {
            port,
            ..Default::default()
        });
        assert!(server.start(false).await.is_err());
    }
}
