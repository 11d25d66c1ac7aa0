//! Controller-side interactor bound to one attach channel

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;

use tether_core::{ContainerId, InteractionError, SessionInteractor};
use tether_protocol::msgs::{self, WindowSize};
use tether_protocol::{Channel, MuxHandle, ProtocolError, Reply};

/// First agent revision that understands `ping` and `unblock`
pub const PING_UNBLOCK_REVISION: u32 = 1;

type ExitSlot = Option<Result<u32, InteractionError>>;

/// Interactor over an SSH-style attach channel
pub struct Interactor {
    id: ContainerId,
    mux: MuxHandle,
    channel: Channel,
    version: u32,
    ping_timeout: Duration,
    closed: AtomicBool,
    exit_rx: watch::Receiver<ExitSlot>,
}

impl Interactor {
    /// Open the attach channel for `id` on `mux`
    pub async fn open(
        mux: &MuxHandle,
        id: ContainerId,
        version: u32,
        ping_timeout: Duration,
    ) -> Result<Self, InteractionError> {
        let channel = mux
            .open_channel(msgs::ATTACH_CHANNEL, Bytes::from(id.as_str().to_owned()))
            .await?;

        let (exit_tx, exit_rx) = watch::channel(None);
        if let Some(mut requests) = channel.take_requests() {
            let id = id.clone();
            tokio::spawn(async move {
                while let Some(req) = requests.recv().await {
                    if req.name() != msgs::EXIT_STATUS_REQ {
                        tracing::debug!(container_id = %id, "Unexpected channel request {}", req.name());
                        continue;
                    }
                    match msgs::decode_u32(req.payload(), msgs::EXIT_STATUS_REQ) {
                        Ok(code) => {
                            tracing::info!(container_id = %id, "Session exited with status {}", code);
                            exit_tx.send_replace(Some(Ok(code)));
                        }
                        Err(e) => tracing::warn!(container_id = %id, "Bad exit-status: {}", e),
                    }
                }
                // Channel gone; a recorded status stays
                exit_tx.send_if_modified(|slot| {
                    if slot.is_none() {
                        *slot = Some(Err(InteractionError::TransportClosed));
                        true
                    } else {
                        false
                    }
                });
            });
        }

        Ok(Self {
            id,
            mux: mux.clone(),
            channel,
            version,
            ping_timeout,
            closed: AtomicBool::new(false),
            exit_rx,
        })
    }

    /// Agent revision this interactor was opened against
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Identifier of the multiplexer carrying this channel
    pub fn mux_id(&self) -> u64 {
        self.mux.id()
    }

    /// Send `name` and wait for its reply, bounded by the ping timeout
    async fn request(&self, name: &str, payload: Bytes) -> Result<Reply, InteractionError> {
        if self.is_closed() {
            return Err(InteractionError::TransportClosed);
        }
        let reply = tokio::time::timeout(
            self.ping_timeout,
            self.channel.send_request(name, true, payload),
        )
        .await
        .map_err(|_| InteractionError::Timeout(name.to_string()))?;
        match reply? {
            Some(reply) => Ok(reply),
            None => Err(InteractionError::RequestFailed(name.to_string())),
        }
    }
}

#[async_trait]
impl SessionInteractor for Interactor {
    fn id(&self) -> &ContainerId {
        &self.id
    }

    fn stdout(&self) -> Box<dyn AsyncRead + Send + Unpin> {
        Box::new(self.channel.reader())
    }

    fn stderr(&self) -> Box<dyn AsyncRead + Send + Unpin> {
        Box::new(self.channel.stderr())
    }

    fn stdin(&self) -> Box<dyn AsyncWrite + Send + Unpin> {
        Box::new(self.channel.writer())
    }

    async fn signal(&self, name: &str) -> Result<(), InteractionError> {
        let reply = self.request(msgs::SIGNAL_REQ, msgs::encode_string(name)).await?;
        if !reply.ok {
            return Err(InteractionError::SignalFailed(name.to_string()));
        }
        Ok(())
    }

    async fn resize(&self, size: WindowSize) -> Result<(), InteractionError> {
        let reply = self.request(msgs::WINDOW_CHANGE_REQ, size.encode()).await?;
        if !reply.ok {
            return Err(InteractionError::ResizeFailed);
        }
        Ok(())
    }

    async fn close_stdin(&self) -> Result<(), InteractionError> {
        let reply = self.request(msgs::CLOSE_STDIN_REQ, Bytes::new()).await?;
        if !reply.ok {
            return Err(InteractionError::CloseStdinFailed);
        }
        self.channel.close_write().map_err(InteractionError::from)
    }

    async fn ping(&self) -> Result<(), InteractionError> {
        if self.is_closed() {
            return Err(InteractionError::PingFailed("channel closed".into()));
        }

        if self.version < PING_UNBLOCK_REVISION {
            return tokio::time::timeout(self.ping_timeout, self.mux.keepalive())
                .await
                .map_err(|_| InteractionError::PingFailed("keepalive timed out".into()))?
                .map_err(|e| InteractionError::PingFailed(e.to_string()));
        }

        let token = Bytes::from(rand::random::<[u8; 8]>().to_vec());
        let reply = tokio::time::timeout(
            self.ping_timeout,
            self.channel.send_request(msgs::PING_REQ, true, token.clone()),
        )
        .await
        .map_err(|_| InteractionError::PingFailed("timed out".into()))?
        .map_err(|e: ProtocolError| InteractionError::PingFailed(e.to_string()))?;

        match reply {
            Some(reply) if reply.ok && reply.payload == token => Ok(()),
            Some(reply) if reply.ok => Err(InteractionError::PingFailed("echo mismatch".into())),
            _ => Err(InteractionError::PingFailed("rejected".into())),
        }
    }

    async fn unblock(&self) -> Result<(), InteractionError> {
        if self.version < PING_UNBLOCK_REVISION {
            return Ok(());
        }
        let reply = self
            .request(msgs::UNBLOCK_REQ, msgs::encode_string(self.id.as_str()))
            .await?;
        if !reply.ok {
            return Err(InteractionError::UnblockFailed);
        }
        Ok(())
    }

    async fn exit_status(&self) -> Result<u32, InteractionError> {
        let mut rx = self.exit_rx.clone();
        let slot = rx
            .wait_for(|slot| slot.is_some())
            .await
            .map_err(|_| InteractionError::TransportClosed)?;
        match slot.as_ref() {
            Some(result) => result.clone(),
            None => Err(InteractionError::TransportClosed),
        }
    }

    async fn close(&self) -> Result<(), InteractionError> {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            tracing::debug!(container_id = %self.id, "Closing interaction");
            self.channel.close();
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.channel.is_closed()
    }
}

impl std::fmt::Debug for Interactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interactor")
            .field("id", &self.id)
            .field("channel", &self.channel)
            .field("version", &self.version)
            .finish()
    }
}
