//! SSH server side of the control connection
//!
//! The controller is the SSH client. It authenticates with `none` and opens
//! a single session channel, which carries the mux.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use russh::server::{self, Auth, Config, Msg, Session};
use russh::{Channel, MethodSet};
use russh_keys::key::KeyPair;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Bound on the controller opening its session channel after connecting
pub const SESSION_OPEN_TIMEOUT: Duration = Duration::from_secs(30);

/// Host key from `path`, or a fresh Ed25519 key
pub fn load_host_key(path: Option<&Path>) -> anyhow::Result<KeyPair> {
    match path {
        Some(path) => {
            tracing::info!("Loading host key from {:?}", path);
            russh_keys::load_secret_key(path, None)
                .with_context(|| format!("Failed to load host key from {:?}", path))
        }
        None => {
            tracing::debug!("Generating ephemeral host key");
            KeyPair::generate_ed25519().ok_or_else(|| anyhow::anyhow!("Failed to generate Ed25519 key"))
        }
    }
}

pub fn server_config(key: KeyPair) -> Arc<Config> {
    let mut config = Config::default();
    config.keys.push(key);
    config.methods = MethodSet::NONE;
    config.inactivity_timeout = None;
    config.auth_rejection_time = Duration::from_millis(0);
    config.auth_rejection_time_initial = Some(Duration::from_millis(0));
    Arc::new(config)
}

/// Accepts the controller and hands over its session channel
struct ControlHandler {
    channels: mpsc::UnboundedSender<Channel<Msg>>,
}

#[async_trait]
impl server::Handler for ControlHandler {
    type Error = anyhow::Error;

    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        tracing::debug!("Controller authenticated as {}", user);
        Ok(Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        tracing::debug!("Controller opened session channel {:?}", channel.id());
        Ok(self.channels.send(channel).is_ok())
    }
}

/// A running SSH server session with the controller's channel
pub struct ControlSession {
    pub channel: Channel<Msg>,
    /// Drives the SSH connection; ends when it closes
    pub driver: JoinHandle<anyhow::Result<()>>,
}

/// Run the SSH server over `stream` until the controller opens its channel
pub async fn accept<S>(stream: S, config: Arc<Config>) -> anyhow::Result<ControlSession>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel();
    let running = server::run_stream(config, stream, ControlHandler { channels: tx })
        .await
        .context("SSH negotiation failed")?;
    let mut driver = tokio::spawn(running);

    let channel = tokio::select! {
        channel = rx.recv() => channel,
        finished = &mut driver => {
            return match finished {
                Ok(Ok(())) => Err(anyhow::anyhow!("Controller left before opening a channel")),
                Ok(Err(e)) => Err(e.context("SSH session failed")),
                Err(e) => Err(anyhow::anyhow!("SSH session task failed: {}", e)),
            };
        }
        _ = tokio::time::sleep(SESSION_OPEN_TIMEOUT) => None,
    };

    match channel {
        Some(channel) => Ok(ControlSession { channel, driver }),
        None => {
            driver.abort();
            Err(anyhow::anyhow!("Controller did not open a session channel"))
        }
    }
}
