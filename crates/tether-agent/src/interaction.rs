//! Interaction plugin
//!
//! The agent half of an attach channel. Binds channels to sessions, answers
//! their requests, implements the run-block release gate, and provides
//! session I/O to the process manager.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use tokio::io::AsyncReadExt;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use tether_core::SessionError;
use tether_protocol::msgs::{self, WindowSize};
use tether_protocol::{Channel, ChannelRequest};

use crate::launch::Launch;
use crate::plugin::{Capabilities, Plugin};
use crate::process::{Releaser, Terminal};
use crate::session::Session;
use crate::signals;

const STDIN_CHUNK: usize = 32 * 1024;

struct Inner {
    uuid: Uuid,
    /// Release gates by session id
    gates: DashMap<String, watch::Sender<bool>>,
    unblocks: AtomicU64,
}

#[derive(Clone)]
pub struct Interaction {
    inner: Arc<Inner>,
}

impl Default for Interaction {
    fn default() -> Self {
        Self::new()
    }
}

impl Interaction {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                uuid: Uuid::new_v4(),
                gates: DashMap::new(),
                unblocks: AtomicU64::new(0),
            }),
        }
    }

    fn gate(&self, id: &str) -> watch::Receiver<bool> {
        self.inner
            .gates
            .entry(id.to_string())
            .or_insert_with(|| watch::channel(false).0)
            .subscribe()
    }

    /// Open the release gate of session `id`; repeated calls are no-ops
    pub fn unblock(&self, id: &str) {
        self.inner.unblocks.fetch_add(1, Ordering::Relaxed);
        let opened = !self
            .inner
            .gates
            .entry(id.to_string())
            .or_insert_with(|| watch::channel(false).0)
            .send_replace(true);
        if opened {
            tracing::info!(session = id, "Unblocked");
        }
    }

    /// `unblock` requests received so far
    pub fn unblock_count(&self) -> u64 {
        self.inner.unblocks.load(Ordering::Relaxed)
    }

    /// Bind `channel` to `session` and serve its requests until it closes
    pub async fn attach(&self, session: Arc<Session>, channel: Channel) {
        let requests = channel.take_requests();
        let attachment = session.attach(channel.clone()).await;
        if channel.is_closed() {
            return;
        }

        let stdin_close = CancellationToken::new();
        if session.config.open_stdin {
            tokio::spawn(forward_stdin(
                session.clone(),
                channel.clone(),
                stdin_close.clone(),
            ));
        }

        let Some(mut requests) = requests else {
            tracing::warn!(session = %session.id, "Channel requests already taken");
            return;
        };

        let interaction = self.clone();
        tokio::spawn(async move {
            while let Some(req) = requests.recv().await {
                interaction.handle(&session, &stdin_close, req);
            }
            session.detach(attachment).await;
            tracing::debug!(session = %session.id, attachment, "Channel detached");
        });
    }

    fn handle(&self, session: &Session, stdin_close: &CancellationToken, req: ChannelRequest) {
        match req.name() {
            msgs::WINDOW_CHANGE_REQ => {
                let ok = match WindowSize::decode(req.payload()) {
                    Ok(size) => match session.resize(size) {
                        Ok(()) => true,
                        Err(e) => {
                            tracing::warn!(session = %session.id, "Resize failed: {}", e);
                            false
                        }
                    },
                    Err(e) => {
                        tracing::warn!(session = %session.id, "Bad window-change: {}", e);
                        false
                    }
                };
                req.reply(ok, Bytes::new());
            }
            msgs::SIGNAL_REQ => {
                let ok = match msgs::decode_string(req.payload(), "signal") {
                    Ok(name) => match signals::lookup(&name) {
                        Some(signal) => session.signal(signal).is_ok(),
                        None => {
                            tracing::warn!(
                                session = %session.id,
                                "{}",
                                SessionError::UnknownSignal(name)
                            );
                            false
                        }
                    },
                    Err(_) => false,
                };
                req.reply(ok, Bytes::new());
            }
            msgs::CLOSE_STDIN_REQ => {
                // The forwarder closes once the input that preceded this request is fed
                if session.config.open_stdin {
                    stdin_close.cancel();
                } else {
                    session.close_stdin();
                }
                req.reply(true, Bytes::new());
            }
            msgs::PING_REQ => {
                let echo = req.payload().clone();
                req.reply(true, echo);
            }
            msgs::UNBLOCK_REQ => {
                self.unblock(&session.id);
                req.reply(true, Bytes::new());
            }
            other => {
                tracing::debug!(session = %session.id, "Unsupported channel request {}", other);
            }
        }
    }
}

/// Copy channel input into the session's stdin
///
/// Input already received is fed before a `close-stdin` takes effect.
/// Channel EOF alone leaves the child's stdin open.
async fn forward_stdin(session: Arc<Session>, channel: Channel, close: CancellationToken) {
    let mut reader = channel.reader();
    let mut buf = BytesMut::with_capacity(STDIN_CHUNK);
    loop {
        buf.clear();
        tokio::select! {
            biased;
            read = reader.read_buf(&mut buf) => match read {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    if !session.feed_stdin(buf.split().freeze()) {
                        tracing::debug!(session = %session.id, "Dropping input, stdin is closed");
                    }
                }
            },
            _ = close.cancelled() => {
                session.close_stdin();
                return;
            }
        }
    }

    tokio::select! {
        _ = close.cancelled() => session.close_stdin(),
        _ = channel.closed() => {}
    }
}

#[async_trait]
impl Releaser for Interaction {
    async fn release(&self, session: Arc<Session>, out: oneshot::Sender<()>) {
        let mut gate = self.gate(&session.id);
        if gate.wait_for(|open| *open).await.is_ok() {
            let _ = out.send(());
        }
    }
}

#[async_trait]
impl Terminal for Interaction {
    fn pseudo_terminal(&self, session: &Arc<Session>) -> Result<Launch, SessionError> {
        Launch::pty(&session.config)
    }

    fn non_interact(&self, session: &Arc<Session>) -> Result<Launch, SessionError> {
        Launch::pipes(&session.config)
    }

    async fn close(&self, session: &Arc<Session>, status: u32) {
        session.finish(status).await;
    }
}

#[async_trait]
impl Plugin for Interaction {
    fn name(&self) -> &str {
        "interaction"
    }

    fn uuid(&self) -> Uuid {
        self.inner.uuid
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            signaler: true,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tether_core::config::{Cmd, SessionConfig};
    use tether_protocol::{Mux, MuxHandle};
    use tokio::io::duplex;

    struct Pair {
        controller: MuxHandle,
        _agent: MuxHandle,
        opens: tokio::sync::mpsc::UnboundedReceiver<tether_protocol::NewChannel>,
    }

    fn pair() -> Pair {
        let (a, b) = duplex(256 * 1024);
        let (controller, _, _) = Mux::start(a);
        let (agent, _, opens) = Mux::start(b);
        Pair {
            controller,
            _agent: agent,
            opens,
        }
    }

    async fn attached(interaction: &Interaction, session: Arc<Session>) -> (Channel, Pair) {
        let mut pair = pair();
        let open = tokio::spawn({
            let controller = pair.controller.clone();
            async move {
                controller
                    .open_channel(msgs::ATTACH_CHANNEL, Bytes::from_static(b"c1"))
                    .await
                    .unwrap()
            }
        });
        let incoming = pair.opens.recv().await.unwrap();
        interaction.attach(session, incoming.accept().unwrap()).await;
        (open.await.unwrap(), pair)
    }

    fn session(config: SessionConfig) -> Arc<Session> {
        Session::new(SessionConfig {
            id: "c1".into(),
            attach: true,
            ..config
        })
    }

    async fn request(channel: &Channel, name: &str, payload: Bytes) -> (bool, Bytes) {
        let reply = channel.send_request(name, true, payload).await.unwrap().unwrap();
        (reply.ok, reply.payload)
    }

    #[tokio::test]
    async fn test_ping_echoes() {
        let interaction = Interaction::new();
        let (channel, _pair) = attached(&interaction, session(SessionConfig::default())).await;
        let (ok, payload) = request(&channel, msgs::PING_REQ, Bytes::from_static(b"token")).await;
        assert!(ok);
        assert_eq!(&payload[..], b"token");
    }

    #[tokio::test]
    async fn test_unblock_idempotent() {
        let interaction = Interaction::new();
        let s = session(SessionConfig::default());
        let (channel, _pair) = attached(&interaction, s.clone()).await;

        let (tx, rx) = oneshot::channel();
        let releaser = interaction.clone();
        tokio::spawn(async move { releaser.release(s, tx).await });

        for _ in 0..3 {
            let (ok, _) = request(&channel, msgs::UNBLOCK_REQ, Bytes::from_static(b"1")).await;
            assert!(ok);
        }
        tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(interaction.unblock_count(), 3);
    }

    #[tokio::test]
    async fn test_release_after_unblock() {
        let interaction = Interaction::new();
        interaction.unblock("c1");
        let (tx, rx) = oneshot::channel();
        interaction.release(session(SessionConfig::default()), tx).await;
        assert!(rx.await.is_ok());
    }

    #[tokio::test]
    async fn test_window_change_without_tty() {
        let interaction = Interaction::new();
        let (channel, _pair) = attached(&interaction, session(SessionConfig::default())).await;

        let (ok, _) = request(&channel, msgs::WINDOW_CHANGE_REQ, WindowSize::new(0, 0).encode()).await;
        assert!(ok);
        let (ok, _) = request(&channel, msgs::WINDOW_CHANGE_REQ, Bytes::from_static(b"short")).await;
        assert!(!ok);
    }

    #[tokio::test]
    async fn test_signal_requests() {
        let interaction = Interaction::new();
        let (channel, _pair) = attached(&interaction, session(SessionConfig::default())).await;

        // Known mnemonic but no child yet
        let (ok, _) = request(&channel, msgs::SIGNAL_REQ, msgs::encode_string("TERM")).await;
        assert!(!ok);
        let (ok, _) = request(&channel, msgs::SIGNAL_REQ, msgs::encode_string("BOGUS")).await;
        assert!(!ok);
    }

    #[tokio::test]
    async fn test_unknown_request_fails() {
        let interaction = Interaction::new();
        let (channel, _pair) = attached(&interaction, session(SessionConfig::default())).await;
        let (ok, _) = request(&channel, "pty-req", Bytes::new()).await;
        assert!(!ok);
    }

    #[tokio::test]
    async fn test_stdin_forwarded_until_close() {
        let interaction = Interaction::new();
        let s = session(SessionConfig {
            open_stdin: true,
            cmd: Cmd::new("/bin/cat", ["cat"]),
            ..Default::default()
        });
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        s.launched(1, Some(tx), None);
        let (channel, _pair) = attached(&interaction, s.clone()).await;

        channel.write_all(b"input").await.unwrap();
        assert_eq!(&rx.recv().await.unwrap()[..], b"input");

        let (ok, _) = request(&channel, msgs::CLOSE_STDIN_REQ, Bytes::new()).await;
        assert!(ok);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_stdin_before_launch_is_held() {
        let interaction = Interaction::new();
        let s = session(SessionConfig {
            open_stdin: true,
            run_block: true,
            cmd: Cmd::new("/bin/cat", ["cat"]),
            ..Default::default()
        });
        let (channel, _pair) = attached(&interaction, s.clone()).await;

        channel.write_all(b"hello\n").await.unwrap();
        let (ok, _) = request(&channel, msgs::CLOSE_STDIN_REQ, Bytes::new()).await;
        assert!(ok);

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::time::timeout(Duration::from_secs(1), async {
            while !s.stdin_close_pending() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        s.launched(1, Some(tx), None);

        assert_eq!(&rx.recv().await.unwrap()[..], b"hello\n");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_detach_on_close() {
        let interaction = Interaction::new();
        let s = session(SessionConfig::default());
        let (channel, _pair) = attached(&interaction, s.clone()).await;
        assert_eq!(s.attachment_count().await, 1);

        channel.close();
        tokio::time::timeout(Duration::from_secs(1), async {
            while s.attachment_count().await > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }
}
