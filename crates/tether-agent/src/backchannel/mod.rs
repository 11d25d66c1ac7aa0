//! Control connection to the controller
//!
//! The agent reaches the controller over TCP or a serial device, runs frame
//! sync, serves SSH with the agent as the server, and dispatches the mux on
//! the controller's session channel. When the connection drops it starts
//! over. A fork handoff tells the controller to let go, runs the fork helper
//! and then reconnects.

mod reconnect;
mod ssh;
mod transport;

pub use reconnect::ExponentialBackoff;
pub use ssh::{load_host_key, server_config};
pub use transport::{describe, dial, open, open_serial, BoxStream, ControlStream, Duplex};

use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use russh_keys::key::KeyPair;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use tether_core::config::AgentConfig;
use tether_protocol::{handshake, msgs, HandshakeError, Mux, MuxHandle};

use crate::dispatcher::Dispatcher;
use crate::reaper::Reaper;

/// Bound on the controller acknowledging a fork announcement
const FORK_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// How one control connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ended {
    /// The controller or the transport went away
    Closed,
    /// The agent is shutting down
    Cancelled,
    /// A fork handoff released the connection
    Forked,
}

/// Agent side of frame sync: purge, then answer on every tick until synced
pub async fn sync<S>(stream: &mut S, tick: Duration) -> Result<u32, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    handshake::purge(stream).await?;

    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut attempts = 0u32;
    loop {
        ticker.tick().await;
        attempts += 1;
        match handshake::server(stream).await {
            Ok(()) => return Ok(attempts),
            Err(e) if e.is_retriable() => {
                tracing::debug!(attempt = attempts, "Handshake failed: {}", e);
                handshake::purge(stream).await?;
            }
            Err(e) => return Err(e),
        }
    }
}

/// The agent's control loop
pub struct Backchannel {
    config: AgentConfig,
    dispatcher: Dispatcher,
    ssh: Arc<russh::server::Config>,
}

impl Backchannel {
    pub fn new(config: AgentConfig, dispatcher: Dispatcher, key: KeyPair) -> Self {
        Self {
            config,
            dispatcher,
            ssh: server_config(key),
        }
    }

    /// Connect, serve and reconnect until `cancel` fires
    ///
    /// Every message on `forks` triggers a fork handoff on the live
    /// connection.
    pub async fn run(&self, cancel: CancellationToken, mut forks: mpsc::Receiver<()>) {
        let mut backoff = ExponentialBackoff::from_config(&self.config.backoff);
        let target = describe(&self.config);

        loop {
            let stream = tokio::select! {
                _ = cancel.cancelled() => return,
                stream = self.connect(&target, &mut backoff) => stream,
            };
            tracing::info!("Connected to controller at {}", target);
            backoff.reset();

            match self.serve_stream(stream, &cancel, &mut forks).await {
                Ok(Ended::Cancelled) => return,
                Ok(Ended::Forked) => self.run_fork_helper().await,
                Ok(Ended::Closed) => tracing::info!("Control connection lost"),
                Err(e) => tracing::warn!("Control connection failed: {:#}", e),
            }

            let delay = backoff.next_delay();
            tracing::debug!("Reconnecting in {:?}", delay);
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn connect(&self, target: &str, backoff: &mut ExponentialBackoff) -> BoxStream {
        loop {
            match open(&self.config).await {
                Ok(stream) => return stream,
                Err(e) => {
                    let delay = backoff.next_delay();
                    tracing::warn!("Cannot reach {}: {}. Retrying in {:?}", target, e, delay);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Serve one control connection over `stream`
    pub async fn serve_stream<S>(
        &self,
        mut stream: S,
        cancel: &CancellationToken,
        forks: &mut mpsc::Receiver<()>,
    ) -> anyhow::Result<Ended>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let attempts = tokio::select! {
            _ = cancel.cancelled() => return Ok(Ended::Cancelled),
            synced = sync(&mut stream, self.config.handshake_tick) => synced?,
        };
        tracing::debug!("Frame sync after {} attempt(s)", attempts);

        let session = tokio::select! {
            _ = cancel.cancelled() => return Ok(Ended::Cancelled),
            session = ssh::accept(stream, self.ssh.clone()) => session?,
        };

        let (mux, globals, opens) = Mux::start(session.channel.into_stream());
        let served = tokio::spawn({
            let dispatcher = self.dispatcher.clone();
            let mux = mux.clone();
            async move { dispatcher.serve(mux, globals, opens).await }
        });

        let ended = tokio::select! {
            _ = mux.closed() => Ended::Closed,
            _ = cancel.cancelled() => Ended::Cancelled,
            Some(()) = forks.recv() => {
                announce_fork(&mux).await;
                Ended::Forked
            }
        };

        mux.close();
        let _ = served.await;
        session.driver.abort();
        Ok(ended)
    }

    async fn run_fork_helper(&self) {
        let Some(helper) = self.config.fork_helper.clone() else {
            return;
        };
        match run_helper(helper.clone()).await {
            Ok(status) => tracing::info!("Fork helper {:?} exited with {}", helper, status),
            Err(e) => tracing::error!("Fork helper {:?} failed: {}", helper, e),
        }
    }
}

/// Tell the controller this connection is going away for a fork
async fn announce_fork(mux: &MuxHandle) {
    tracing::info!("Announcing fork handoff");
    match tokio::time::timeout(
        FORK_REPLY_TIMEOUT,
        mux.global_request(msgs::FORK_REQ, true, Bytes::new()),
    )
    .await
    {
        Ok(Ok(Some(reply))) if reply.ok => tracing::debug!("Controller acknowledged fork"),
        Ok(Ok(_)) => tracing::warn!("Controller refused fork announcement"),
        Ok(Err(e)) => tracing::warn!("Fork announcement failed: {}", e),
        Err(_) => tracing::warn!("No reply to fork announcement"),
    }
}

/// Run `helper` to completion through the reaper
async fn run_helper(helper: PathBuf) -> std::io::Result<u32> {
    let ((), exit) = Reaper::global().track(|| {
        Command::new(&helper)
            .spawn()
            .map(|child| (child.id() as i32, ()))
    })?;
    exit.await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::Other, "child exit lost"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_sync_against_controller() {
        let (mut agent, mut controller) = duplex(1024);
        let agent_side = tokio::spawn(async move {
            sync(&mut agent, Duration::from_millis(10)).await
        });

        handshake::purge(&mut controller).await.unwrap();
        loop {
            match tokio::time::timeout(
                Duration::from_millis(200),
                handshake::client(&mut controller, false),
            )
            .await
            {
                Ok(Ok(())) => break,
                Ok(Err(e)) if e.is_retriable() => {}
                Ok(Err(e)) => panic!("client failed: {}", e),
                Err(_) => {}
            }
            handshake::purge(&mut controller).await.unwrap();
        }
        assert!(agent_side.await.unwrap().unwrap() >= 1);
    }

    #[tokio::test]
    async fn test_sync_eof() {
        let (mut agent, controller) = duplex(64);
        drop(controller);
        assert!(matches!(
            sync(&mut agent, Duration::from_millis(10)).await,
            Err(HandshakeError::Eof)
        ));
    }

    #[tokio::test]
    async fn test_fork_helper_runs() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("forked");
        let helper = dir.path().join("helper.sh");
        std::fs::write(
            &helper,
            format!("#!/bin/sh\ntouch {}\nexit 4\n", marker.display()),
        )
        .unwrap();
        std::fs::set_permissions(
            &helper,
            std::os::unix::fs::PermissionsExt::from_mode(0o755),
        )
        .unwrap();

        assert_eq!(run_helper(helper).await.unwrap(), 4);
        assert!(marker.exists());
    }
}
