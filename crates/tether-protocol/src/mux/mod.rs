//! Channel multiplexer
//!
//! Runs the connection protocol over one byte stream: global requests with
//! replies, channel open negotiation, per-channel data and requests, and a
//! transport keepalive answered here without involving the application.
//!
//! [`Mux::start`] splits the stream into a reader task and a writer task and
//! hands back a cloneable [`MuxHandle`] plus two queues: inbound global
//! requests and inbound channel opens.

mod channel;
mod request;

pub use channel::{Channel, ChannelReader, ChannelWriter, NewChannel};
pub use request::{ChannelRequest, GlobalRequest, Reply};

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use self::channel::ChannelState;
use crate::codec::{Frame, FrameCodec};
use crate::error::ProtocolError;
use crate::message::Message;
use crate::msgs::KEEPALIVE_REQ;

/// Receive window we advertise for every channel
pub const LOCAL_WINDOW: u32 = 2 * 1024 * 1024;

/// Largest data payload per frame
pub const MAX_PACKET: u32 = 32 * 1024;

/// Consumed bytes that trigger a window adjust
pub(crate) const WINDOW_ADJUST_THRESHOLD: u32 = LOCAL_WINDOW / 2;

static NEXT_MUX_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

type OpenResult = Result<Channel, ProtocolError>;

pub(crate) struct Shared {
    id: u64,
    out: mpsc::UnboundedSender<Frame>,
    pub(crate) channels: DashMap<u32, Arc<ChannelState>>,
    pending_global: DashMap<u32, oneshot::Sender<Reply>>,
    pending_opens: DashMap<u32, oneshot::Sender<OpenResult>>,
    next_channel: AtomicU32,
    next_seq: AtomicU32,
    pub(crate) closed: CancellationToken,
}

impl Shared {
    pub(crate) fn send(&self, frame: Frame) -> bool {
        !self.closed.is_cancelled() && self.out.send(frame).is_ok()
    }

    pub(crate) fn next_channel_id(&self) -> u32 {
        self.next_channel.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn next_seq(&self) -> u32 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    fn dispatch(
        self: &Arc<Self>,
        frame: Frame,
        globals: &mpsc::UnboundedSender<GlobalRequest>,
        opens: &mpsc::UnboundedSender<NewChannel>,
    ) {
        let Frame { channel, message } = frame;

        match message {
            Message::GlobalRequest {
                seq,
                name,
                want_reply,
                payload,
            } => {
                let req = GlobalRequest::new(self.clone(), seq, name, want_reply, payload);
                if req.name() == KEEPALIVE_REQ {
                    req.reply(true, Bytes::new());
                } else if let Err(mpsc::error::SendError(req)) = globals.send(req) {
                    debug!("No handler for global request {}", req.name());
                }
            }
            Message::RequestSuccess { seq, payload } => {
                if let Some((_, tx)) = self.pending_global.remove(&seq) {
                    let _ = tx.send(Reply::success(payload));
                }
            }
            Message::RequestFailure { seq } => {
                if let Some((_, tx)) = self.pending_global.remove(&seq) {
                    let _ = tx.send(Reply::failure());
                }
            }
            Message::ChannelOpen {
                channel_type,
                sender,
                initial_window,
                max_packet,
                extra,
            } => {
                let new = NewChannel::new(
                    self.clone(),
                    channel_type,
                    sender,
                    initial_window,
                    max_packet,
                    extra,
                );
                // Dropping it rejects the open
                let _ = opens.send(new);
            }
            Message::ChannelOpenConfirmation {
                sender,
                initial_window,
                max_packet,
            } => {
                let local = channel.as_u32();
                let state =
                    ChannelState::new(self.clone(), local, sender, initial_window, max_packet);
                match self.pending_opens.remove(&local) {
                    Some((_, tx)) => {
                        self.channels.insert(local, state.clone());
                        if let Err(Ok(ch)) = tx.send(Ok(Channel::from_state(state))) {
                            // Opener went away while waiting
                            ch.close();
                        }
                    }
                    None => {
                        debug!("Unexpected confirmation for {}", channel);
                        Channel::from_state(state).close();
                    }
                }
            }
            Message::ChannelOpenFailure { reason, message } => {
                if let Some((_, tx)) = self.pending_opens.remove(&channel.as_u32()) {
                    let _ = tx.send(Err(ProtocolError::OpenRejected { reason, message }));
                }
            }
            other => {
                let state = self
                    .channels
                    .get(&channel.as_u32())
                    .map(|entry| entry.value().clone());
                match state {
                    Some(state) => state.handle(other),
                    None => debug!("Dropping {:?} for unknown {}", other.message_type(), channel),
                }
            }
        }
    }

    fn shutdown(&self) {
        self.closed.cancel();
        let states: Vec<_> = self.channels.iter().map(|e| e.value().clone()).collect();
        for state in states {
            state.teardown();
        }
        self.channels.clear();
        self.pending_global.clear();
        self.pending_opens.clear();
    }
}

/// Entry point for running the multiplexer over a stream
pub struct Mux;

impl Mux {
    /// Start the reader and writer tasks over `io`
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<S>(
        io: S,
    ) -> (
        MuxHandle,
        mpsc::UnboundedReceiver<GlobalRequest>,
        mpsc::UnboundedReceiver<NewChannel>,
    )
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (global_tx, global_rx) = mpsc::unbounded_channel();
        let (open_tx, open_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            id: NEXT_MUX_ID.fetch_add(1, Ordering::Relaxed),
            out: out_tx,
            channels: DashMap::new(),
            pending_global: DashMap::new(),
            pending_opens: DashMap::new(),
            next_channel: AtomicU32::new(1),
            next_seq: AtomicU32::new(1),
            closed: CancellationToken::new(),
        });

        let (read_half, write_half) = tokio::io::split(io);

        tokio::spawn(write_loop(
            FramedWrite::new(write_half, FrameCodec::new()),
            out_rx,
            shared.clone(),
        ));
        tokio::spawn(read_loop(
            FramedRead::new(read_half, FrameCodec::new()),
            shared.clone(),
            global_tx,
            open_tx,
        ));

        (MuxHandle { shared }, global_rx, open_rx)
    }
}

async fn read_loop<R>(
    mut frames: FramedRead<R, FrameCodec>,
    shared: Arc<Shared>,
    globals: mpsc::UnboundedSender<GlobalRequest>,
    opens: mpsc::UnboundedSender<NewChannel>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let next = tokio::select! {
            _ = shared.closed.cancelled() => break,
            next = frames.next() => next,
        };

        match next {
            Some(Ok(frame)) => shared.dispatch(frame, &globals, &opens),
            Some(Err(e)) => {
                warn!("Mux {} read error: {}", shared.id, e);
                break;
            }
            None => {
                debug!("Mux {} peer closed the stream", shared.id);
                break;
            }
        }
    }

    shared.shutdown();
}

async fn write_loop<W>(
    mut sink: FramedWrite<W, FrameCodec>,
    mut rx: mpsc::UnboundedReceiver<Frame>,
    shared: Arc<Shared>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            biased;
            frame = rx.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = sink.send(frame).await {
                        warn!("Mux {} write error: {}", shared.id, e);
                        break;
                    }
                }
                None => break,
            },
            _ = shared.closed.cancelled() => {
                // Flush what was queued before the close
                while let Ok(frame) = rx.try_recv() {
                    if sink.feed(frame).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }

    let _ = sink.close().await;
    shared.shutdown();
}

/// Cloneable handle to a running multiplexer
#[derive(Clone)]
pub struct MuxHandle {
    shared: Arc<Shared>,
}

impl MuxHandle {
    /// Process-unique identifier of this multiplexer
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Send a global request, waiting for the reply if one is wanted
    pub async fn global_request(
        &self,
        name: &str,
        want_reply: bool,
        payload: Bytes,
    ) -> Result<Option<Reply>, ProtocolError> {
        let seq = self.shared.next_seq();
        let msg = Message::GlobalRequest {
            seq,
            name: name.to_string(),
            want_reply,
            payload,
        };

        if !want_reply {
            return if self.shared.send(Frame::control(msg)) {
                Ok(None)
            } else {
                Err(ProtocolError::MuxClosed)
            };
        }

        let (tx, rx) = oneshot::channel();
        self.shared.pending_global.insert(seq, tx);
        if self.shared.closed.is_cancelled() || !self.shared.send(Frame::control(msg)) {
            self.shared.pending_global.remove(&seq);
            return Err(ProtocolError::MuxClosed);
        }

        rx.await.map(Some).map_err(|_| ProtocolError::MuxClosed)
    }

    /// Open a channel of `channel_type`, passing `extra` to the peer
    pub async fn open_channel(
        &self,
        channel_type: &str,
        extra: Bytes,
    ) -> Result<Channel, ProtocolError> {
        let local = self.shared.next_channel_id();
        let (tx, rx) = oneshot::channel();
        self.shared.pending_opens.insert(local, tx);

        let msg = Message::ChannelOpen {
            channel_type: channel_type.to_string(),
            sender: local,
            initial_window: LOCAL_WINDOW,
            max_packet: MAX_PACKET,
            extra,
        };
        if self.shared.closed.is_cancelled() || !self.shared.send(Frame::control(msg)) {
            self.shared.pending_opens.remove(&local);
            return Err(ProtocolError::MuxClosed);
        }

        rx.await.map_err(|_| ProtocolError::MuxClosed)?
    }

    /// Round-trip a keepalive; any reply counts as alive
    pub async fn keepalive(&self) -> Result<(), ProtocolError> {
        self.global_request(KEEPALIVE_REQ, true, Bytes::new())
            .await
            .map(|_| ())
    }

    /// Number of open channels
    pub fn channel_count(&self) -> usize {
        self.shared.channels.len()
    }

    /// Shut down the multiplexer, closing every channel
    pub fn close(&self) {
        self.shared.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Resolves once the multiplexer has shut down
    pub async fn closed(&self) {
        self.shared.closed.cancelled().await
    }
}

impl std::fmt::Debug for MuxHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxHandle")
            .field("id", &self.shared.id)
            .field("channels", &self.shared.channels.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::OpenFailureReason;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    type Side = (
        MuxHandle,
        mpsc::UnboundedReceiver<GlobalRequest>,
        mpsc::UnboundedReceiver<NewChannel>,
    );

    fn pair() -> (Side, Side) {
        let (a, b) = duplex(64 * 1024);
        (Mux::start(a), Mux::start(b))
    }

    /// Open an attach-style channel from `a`, accepted on `b`
    async fn open(a: &MuxHandle, opens: &mut mpsc::UnboundedReceiver<NewChannel>) -> (Channel, Channel) {
        let opener = a.open_channel("attach", Bytes::from_static(b"c1"));
        let acceptor = async {
            let new = opens.recv().await.unwrap();
            assert_eq!(new.channel_type(), "attach");
            assert_eq!(&new.extra()[..], b"c1");
            new.accept().unwrap()
        };
        let (ours, theirs) = tokio::join!(opener, acceptor);
        (ours.unwrap(), theirs)
    }

    #[tokio::test]
    async fn test_global_request_reply() {
        let ((client, _, _), (_server, mut globals, _)) = pair();

        tokio::spawn(async move {
            let req = globals.recv().await.unwrap();
            assert_eq!(req.name(), "version");
            req.reply(true, Bytes::from_static(&[0, 0, 0, 1]));
        });

        let reply = client
            .global_request("version", true, Bytes::new())
            .await
            .unwrap()
            .unwrap();
        assert!(reply.ok);
        assert_eq!(&reply.payload[..], &[0, 0, 0, 1]);
    }

    #[tokio::test]
    async fn test_dropped_request_fails() {
        let ((client, _, _), (_server, mut globals, _)) = pair();

        tokio::spawn(async move {
            let req = globals.recv().await.unwrap();
            drop(req);
        });

        let reply = client
            .global_request("unknown", true, Bytes::new())
            .await
            .unwrap()
            .unwrap();
        assert!(!reply.ok);
    }

    #[tokio::test]
    async fn test_keepalive_answered_by_peer_mux() {
        let ((client, _, _), (_server, _globals, _)) = pair();
        client.keepalive().await.unwrap();
    }

    #[tokio::test]
    async fn test_channel_data_both_ways() {
        let ((client, _, _), (_server, _, mut opens)) = pair();
        let (ours, theirs) = open(&client, &mut opens).await;

        ours.write_all(b"echo hi\n").await.unwrap();
        let mut buf = [0u8; 8];
        theirs.reader().read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"echo hi\n");

        theirs.write_all(b"hi\n").await.unwrap();
        theirs.write_stderr(b"warn\n").await.unwrap();
        theirs.close_write().unwrap();

        let mut out = Vec::new();
        ours.reader().read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hi\n");
        let mut err = Vec::new();
        ours.stderr().read_to_end(&mut err).await.unwrap();
        assert_eq!(err, b"warn\n");
    }

    #[tokio::test]
    async fn test_rejected_open() {
        let ((client, _, _), (_server, _, mut opens)) = pair();

        tokio::spawn(async move {
            let new = opens.recv().await.unwrap();
            new.reject(OpenFailureReason::ConnectFailed, "no such container");
        });

        match client.open_channel("attach", Bytes::from_static(b"nope")).await {
            Err(ProtocolError::OpenRejected { reason, message }) => {
                assert_eq!(reason, OpenFailureReason::ConnectFailed);
                assert_eq!(message, "no such container");
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unhandled_open_is_rejected() {
        let (a, b) = duplex(4096);
        let (client, _, _) = Mux::start(a);
        let (_server, _, opens) = Mux::start(b);
        drop(opens);

        assert!(matches!(
            client.open_channel("attach", Bytes::new()).await,
            Err(ProtocolError::OpenRejected { .. })
        ));
    }

    #[tokio::test]
    async fn test_channel_request_reply() {
        let ((client, _, _), (_server, _, mut opens)) = pair();
        let (ours, theirs) = open(&client, &mut opens).await;

        let mut reqs = theirs.take_requests().unwrap();
        assert!(theirs.take_requests().is_none());
        tokio::spawn(async move {
            while let Some(req) = reqs.recv().await {
                match req.name() {
                    "ping" => {
                        let echo = req.payload().clone();
                        req.reply(true, echo);
                    }
                    _ => drop(req),
                }
            }
        });

        let reply = ours
            .send_request("ping", true, Bytes::from_static(b"token"))
            .await
            .unwrap()
            .unwrap();
        assert!(reply.ok);
        assert_eq!(&reply.payload[..], b"token");

        let reply = ours
            .send_request("bogus", true, Bytes::new())
            .await
            .unwrap()
            .unwrap();
        assert!(!reply.ok);

        assert!(ours
            .send_request("signal", false, Bytes::new())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_bulk_transfer_crosses_window() {
        let ((client, _, _), (_server, _, mut opens)) = pair();
        let (ours, theirs) = open(&client, &mut opens).await;

        let payload: Vec<u8> = (0..(5 * LOCAL_WINDOW as usize / 2))
            .map(|i| (i % 251) as u8)
            .collect();
        let expected = payload.clone();

        let writer = tokio::spawn(async move {
            let mut w = ours.writer();
            w.write_all(&payload).await.unwrap();
            w.shutdown().await.unwrap();
        });

        let mut got = Vec::new();
        theirs.reader().read_to_end(&mut got).await.unwrap();
        writer.await.unwrap();
        assert_eq!(got.len(), expected.len());
        assert!(got == expected);
    }

    #[tokio::test]
    async fn test_write_after_eof_is_broken_pipe() {
        let ((client, _, _), (_server, _, mut opens)) = pair();
        let (ours, _theirs) = open(&client, &mut opens).await;

        ours.close_write().unwrap();
        let err = ours.writer().write_all(b"late").await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn test_close_propagates() {
        let ((client, _, _), (_server, _, mut opens)) = pair();
        let (ours, theirs) = open(&client, &mut opens).await;
        assert_eq!(client.channel_count(), 1);

        theirs.close();
        tokio::time::timeout(std::time::Duration::from_secs(5), ours.closed())
            .await
            .unwrap();
        assert!(ours.is_closed());
        assert_eq!(client.channel_count(), 0);
        assert!(matches!(
            ours.send_request("ping", true, Bytes::new()).await,
            Err(ProtocolError::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn test_mux_close_fails_everything() {
        let ((client, _, _), (server, _globals, mut opens)) = pair();
        let (ours, _theirs) = open(&client, &mut opens).await;

        let pending = {
            let client = client.clone();
            // Never answered: the peer holds the request without replying
            tokio::spawn(async move { client.global_request("containers", true, Bytes::new()).await })
        };
        tokio::task::yield_now().await;

        client.close();
        assert!(matches!(pending.await.unwrap(), Err(ProtocolError::MuxClosed)));
        assert!(ours.is_closed());

        tokio::time::timeout(std::time::Duration::from_secs(5), server.closed())
            .await
            .unwrap();
        assert!(matches!(
            client.open_channel("attach", Bytes::new()).await,
            Err(ProtocolError::MuxClosed)
        ));
    }
}
