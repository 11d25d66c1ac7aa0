//! Agent link establishment
//!
//! An accepted byte stream becomes an agent link in three steps: frame sync,
//! an SSH client session (the controller is the SSH client even though it
//! accepted the TCP connection), and the channel multiplexer riding on one
//! SSH session channel.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Config, Handle};
use russh::Disconnect;
use russh_keys::key::PublicKey;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use tether_core::config::AttachConfig;
use tether_protocol::{handshake, GlobalRequest, HandshakeError, Mux, MuxHandle, NewChannel};

/// Fixed user name presented to agents
pub const AGENT_USER: &str = "daemon";

/// Failures while turning a stream into an agent link
#[derive(Debug, Error)]
pub enum EstablishError {
    /// Frame sync gave up (EOF or I/O error)
    #[error("Frame sync failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("SSH setup failed: {0}")]
    Ssh(#[from] anyhow::Error),

    /// The agent refused `none` authentication
    #[error("Agent rejected authentication")]
    AuthRejected,
}

/// SSH client handler checking the agent's host key
///
/// The byte channel is the trust boundary, so any key is accepted unless the
/// operator pinned a fingerprint and asked for strict checking.
pub struct AgentKeyCheck {
    pinned: Option<String>,
    strict: bool,
}

impl AgentKeyCheck {
    pub fn new(pinned: Option<String>, strict: bool) -> Self {
        Self { pinned, strict }
    }
}

#[async_trait]
impl client::Handler for AgentKeyCheck {
    type Error = anyhow::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint();
        tracing::debug!("Agent host key: {}", fingerprint);

        let Some(expected) = &self.pinned else {
            return Ok(true);
        };
        if fingerprint == *expected {
            tracing::debug!("Agent host key matches pinned fingerprint");
            return Ok(true);
        }

        tracing::warn!(
            "Agent host key differs from pinned: expected {}, got {}",
            expected,
            fingerprint
        );
        Ok(!self.strict)
    }
}

/// A fully established connection to one agent
pub struct AgentLink {
    pub mux: MuxHandle,
    pub globals: mpsc::UnboundedReceiver<GlobalRequest>,
    pub opens: mpsc::UnboundedReceiver<NewChannel>,
    /// Keeps the SSH session alive for as long as the link is served
    pub session: Option<Handle<AgentKeyCheck>>,
    pub peer: String,
}

impl AgentLink {
    /// Link over an already running mux, with no SSH session underneath
    pub fn from_mux(
        (mux, globals, opens): (
            MuxHandle,
            mpsc::UnboundedReceiver<GlobalRequest>,
            mpsc::UnboundedReceiver<NewChannel>,
        ),
        peer: impl Into<String>,
    ) -> Self {
        Self {
            mux,
            globals,
            opens,
            session: None,
            peer: peer.into(),
        }
    }

    /// Tear down the SSH session, if any
    pub async fn disconnect(session: Option<Handle<AgentKeyCheck>>) {
        if let Some(session) = session {
            let _ = session
                .disconnect(Disconnect::ByApplication, "link closed", "en")
                .await;
        }
    }
}

impl std::fmt::Debug for AgentLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentLink")
            .field("mux", &self.mux)
            .field("peer", &self.peer)
            .finish()
    }
}

/// Run frame sync as the controller until it succeeds
///
/// Retriable failures and elapsed windows start another purge and round;
/// EOF and I/O errors abandon the stream.
pub async fn sync<S>(
    stream: &mut S,
    window: Duration,
    debug: bool,
    peer: &str,
) -> Result<u32, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        handshake::purge(stream).await?;

        match tokio::time::timeout(window, handshake::client(stream, debug)).await {
            Ok(Ok(())) => return Ok(attempts),
            Ok(Err(e)) if e.is_retriable() => {
                tracing::debug!(peer, attempt = attempts, "Handshake failed: {}", e);
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                tracing::trace!(peer, attempt = attempts, "Handshake window elapsed");
            }
        }
    }
}

/// Turn an accepted stream into an [`AgentLink`]
pub async fn establish<S>(
    mut stream: S,
    config: &AttachConfig,
    peer: String,
) -> Result<AgentLink, EstablishError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let attempts = sync(&mut stream, config.handshake_timeout, config.debug, &peer).await?;
    tracing::debug!(peer = %peer, "Frame sync after {} attempt(s)", attempts);

    let ssh_config = Arc::new(Config {
        inactivity_timeout: None,
        ..Default::default()
    });
    let handler = AgentKeyCheck::new(config.pinned_host_key.clone(), config.strict_host_key);

    let mut session = client::connect_stream(ssh_config, stream, handler)
        .await
        .map_err(|e| anyhow::anyhow!("SSH negotiation with {} failed: {}", peer, e))?;

    let authenticated = session
        .authenticate_none(AGENT_USER)
        .await
        .map_err(|e| anyhow::anyhow!("Authentication error: {}", e))?;
    if !authenticated {
        return Err(EstablishError::AuthRejected);
    }

    let channel = session
        .channel_open_session()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to open session channel: {}", e))?;

    tracing::debug!(peer = %peer, "SSH session up, starting mux");
    let (mux, globals, opens) = Mux::start(channel.into_stream());

    Ok(AgentLink {
        mux,
        globals,
        opens,
        session: Some(session),
        peer,
    })
}
