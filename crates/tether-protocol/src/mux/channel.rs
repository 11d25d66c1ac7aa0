//! Multiplexed channels
//!
//! Each channel carries two inbound byte streams (data and extended data),
//! channel-scoped requests, and window-based flow control in both
//! directions. Send credit is a semaphore whose permits are bytes: a write
//! consumes permits, a `ChannelWindowAdjust` from the peer adds them back.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::request::{ChannelRequest, Reply};
use super::{lock, Shared, LOCAL_WINDOW, MAX_PACKET, WINDOW_ADJUST_THRESHOLD};
use crate::channel::ChannelId;
use crate::codec::Frame;
use crate::error::ProtocolError;
use crate::message::{Message, OpenFailureReason};

struct ReaderInner {
    rx: mpsc::UnboundedReceiver<Bytes>,
    pending: Bytes,
}

pub(crate) struct ChannelState {
    pub(crate) local_id: u32,
    remote_id: u32,
    max_packet: usize,
    window_cap: usize,
    remote_window: Semaphore,

    stdout_tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    stderr_tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    stdout: Arc<Mutex<ReaderInner>>,
    stderr: Arc<Mutex<ReaderInner>>,
    requests_tx: Mutex<Option<mpsc::UnboundedSender<ChannelRequest>>>,
    requests_rx: Mutex<Option<mpsc::UnboundedReceiver<ChannelRequest>>>,

    pending: DashMap<u32, oneshot::Sender<Reply>>,
    consumed: AtomicU32,
    eof_sent: AtomicBool,
    close_sent: AtomicBool,
    closed: CancellationToken,
    shared: Arc<Shared>,
}

impl ChannelState {
    pub(crate) fn new(
        shared: Arc<Shared>,
        local_id: u32,
        remote_id: u32,
        remote_window: u32,
        remote_max_packet: u32,
    ) -> Arc<Self> {
        let (stdout_tx, stdout_rx) = mpsc::unbounded_channel();
        let (stderr_tx, stderr_rx) = mpsc::unbounded_channel();
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();

        Arc::new(Self {
            local_id,
            remote_id,
            max_packet: (remote_max_packet as usize).clamp(1, MAX_PACKET as usize),
            window_cap: (remote_window as usize).max(1),
            remote_window: Semaphore::new(remote_window as usize),
            stdout_tx: Mutex::new(Some(stdout_tx)),
            stderr_tx: Mutex::new(Some(stderr_tx)),
            stdout: Arc::new(Mutex::new(ReaderInner {
                rx: stdout_rx,
                pending: Bytes::new(),
            })),
            stderr: Arc::new(Mutex::new(ReaderInner {
                rx: stderr_rx,
                pending: Bytes::new(),
            })),
            requests_tx: Mutex::new(Some(requests_tx)),
            requests_rx: Mutex::new(Some(requests_rx)),
            pending: DashMap::new(),
            consumed: AtomicU32::new(0),
            eof_sent: AtomicBool::new(false),
            close_sent: AtomicBool::new(false),
            closed: CancellationToken::new(),
            shared,
        })
    }

    /// Queue a message for the peer's end of this channel
    ///
    /// Nothing is sent once our close has gone out.
    pub(crate) fn send(&self, msg: Message) -> bool {
        if self.close_sent.load(Ordering::Acquire) {
            return false;
        }
        self.shared
            .send(Frame::new(ChannelId::new(self.remote_id), msg))
    }

    /// Route one inbound message
    pub(crate) fn handle(self: &Arc<Self>, msg: Message) {
        match msg {
            Message::ChannelData(data) => self.deliver(&self.stdout_tx, data),
            Message::ChannelExtendedData(data) => self.deliver(&self.stderr_tx, data),
            Message::ChannelWindowAdjust { bytes } => {
                trace!("{} window +{}", ChannelId::new(self.local_id), bytes);
                self.remote_window.add_permits(bytes as usize);
            }
            Message::ChannelEof => {
                debug!("{} received EOF", ChannelId::new(self.local_id));
                lock(&self.stdout_tx).take();
                lock(&self.stderr_tx).take();
            }
            Message::ChannelClose => {
                debug!("{} closed by peer", ChannelId::new(self.local_id));
                if !self.close_sent.swap(true, Ordering::AcqRel) {
                    self.shared.send(Frame::new(
                        ChannelId::new(self.remote_id),
                        Message::ChannelClose,
                    ));
                }
                self.teardown();
            }
            Message::ChannelRequest {
                seq,
                name,
                want_reply,
                payload,
            } => {
                let req = ChannelRequest::new(self.clone(), seq, name, want_reply, payload);
                let tx = lock(&self.requests_tx).clone();
                if let Some(tx) = tx {
                    // A failed send drops the request, which answers it
                    let _ = tx.send(req);
                }
            }
            Message::ChannelSuccess { seq, payload } => {
                if let Some((_, tx)) = self.pending.remove(&seq) {
                    let _ = tx.send(Reply::success(payload));
                }
            }
            Message::ChannelFailure { seq } => {
                if let Some((_, tx)) = self.pending.remove(&seq) {
                    let _ = tx.send(Reply::failure());
                }
            }
            other => {
                debug!(
                    "Ignoring {:?} on {}",
                    other.message_type(),
                    ChannelId::new(self.local_id)
                );
            }
        }
    }

    fn deliver(&self, tx: &Mutex<Option<mpsc::UnboundedSender<Bytes>>>, data: Bytes) {
        let len = data.len();
        let delivered = match lock(tx).as_ref() {
            Some(tx) => tx.send(data).is_ok(),
            None => false,
        };
        if !delivered {
            // Nobody will read it, give the credit straight back
            self.consumed(len);
        }
    }

    /// Account for bytes handed to a reader and replenish the peer's window
    fn consumed(&self, n: usize) {
        if n == 0 {
            return;
        }
        let total = self.consumed.fetch_add(n as u32, Ordering::AcqRel) + n as u32;
        if total >= WINDOW_ADJUST_THRESHOLD {
            let bytes = self.consumed.swap(0, Ordering::AcqRel);
            if bytes > 0 && !self.closed.is_cancelled() {
                self.send(Message::ChannelWindowAdjust { bytes });
            }
        }
    }

    /// Release everything tied to this channel
    pub(crate) fn teardown(&self) {
        self.closed.cancel();
        self.remote_window.close();
        lock(&self.stdout_tx).take();
        lock(&self.stderr_tx).take();
        lock(&self.requests_tx).take();
        let queued = lock(&self.requests_rx).take();
        drop(queued);
        self.pending.clear();
        self.shared.channels.remove(&self.local_id);
    }

    async fn write_packet(&self, data: &[u8], extended: bool) -> Result<usize, ProtocolError> {
        if data.is_empty() {
            return Ok(0);
        }
        if self.eof_sent.load(Ordering::Acquire) || self.closed.is_cancelled() {
            return Err(ProtocolError::ChannelClosed);
        }

        let n = data.len().min(self.max_packet).min(self.window_cap);
        let permit = tokio::select! {
            permit = self.remote_window.acquire_many(n as u32) => {
                permit.map_err(|_| ProtocolError::ChannelClosed)?
            }
            _ = self.closed.cancelled() => return Err(ProtocolError::ChannelClosed),
        };
        permit.forget();

        if self.eof_sent.load(Ordering::Acquire) {
            return Err(ProtocolError::ChannelClosed);
        }

        let chunk = Bytes::copy_from_slice(&data[..n]);
        let msg = if extended {
            Message::ChannelExtendedData(chunk)
        } else {
            Message::ChannelData(chunk)
        };
        if !self.send(msg) {
            return Err(ProtocolError::ChannelClosed);
        }
        Ok(n)
    }

    async fn write_all(&self, mut data: &[u8], extended: bool) -> Result<(), ProtocolError> {
        while !data.is_empty() {
            let n = self.write_packet(data, extended).await?;
            data = &data[n..];
        }
        Ok(())
    }
}

/// Handle to one open channel
///
/// Cloning yields another handle to the same channel. Readers obtained from
/// different handles share one inbound queue.
#[derive(Clone)]
pub struct Channel {
    state: Arc<ChannelState>,
}

impl Channel {
    pub(crate) fn from_state(state: Arc<ChannelState>) -> Self {
        Self { state }
    }

    /// Our id for this channel
    pub fn id(&self) -> ChannelId {
        ChannelId::new(self.state.local_id)
    }

    /// Primary inbound stream
    pub fn reader(&self) -> ChannelReader {
        ChannelReader {
            inner: self.state.stdout.clone(),
            state: self.state.clone(),
        }
    }

    /// Extended (stderr) inbound stream
    pub fn stderr(&self) -> ChannelReader {
        ChannelReader {
            inner: self.state.stderr.clone(),
            state: self.state.clone(),
        }
    }

    /// Primary outbound stream; shutting it down sends EOF
    pub fn writer(&self) -> ChannelWriter {
        ChannelWriter::new(self.clone(), false)
    }

    /// Extended (stderr) outbound stream; shutting it down sends EOF
    pub fn stderr_writer(&self) -> ChannelWriter {
        ChannelWriter::new(self.clone(), true)
    }

    pub async fn write_all(&self, data: &[u8]) -> Result<(), ProtocolError> {
        self.state.write_all(data, false).await
    }

    pub async fn write_stderr(&self, data: &[u8]) -> Result<(), ProtocolError> {
        self.state.write_all(data, true).await
    }

    /// Inbound channel requests; available once
    pub fn take_requests(&self) -> Option<mpsc::UnboundedReceiver<ChannelRequest>> {
        lock(&self.state.requests_rx).take()
    }

    /// Send a channel request, waiting for the reply if one is wanted
    pub async fn send_request(
        &self,
        name: &str,
        want_reply: bool,
        payload: Bytes,
    ) -> Result<Option<Reply>, ProtocolError> {
        let state = &self.state;
        if state.closed.is_cancelled() {
            return Err(ProtocolError::ChannelClosed);
        }

        let seq = state.shared.next_seq();
        let msg = Message::ChannelRequest {
            seq,
            name: name.to_string(),
            want_reply,
            payload,
        };

        if !want_reply {
            return if state.send(msg) {
                Ok(None)
            } else {
                Err(ProtocolError::ChannelClosed)
            };
        }

        let (tx, rx) = oneshot::channel();
        state.pending.insert(seq, tx);
        // Teardown may have drained the map before our insert
        if state.closed.is_cancelled() {
            state.pending.remove(&seq);
            return Err(ProtocolError::ChannelClosed);
        }
        if !state.send(msg) {
            state.pending.remove(&seq);
            return Err(ProtocolError::ChannelClosed);
        }

        rx.await.map(Some).map_err(|_| ProtocolError::ChannelClosed)
    }

    /// Half-close: tell the peer we will send no more data
    pub fn close_write(&self) -> Result<(), ProtocolError> {
        if self.state.closed.is_cancelled() {
            return Err(ProtocolError::ChannelClosed);
        }
        if !self.state.eof_sent.swap(true, Ordering::AcqRel) {
            self.state.send(Message::ChannelEof);
        }
        Ok(())
    }

    /// Close the channel; idempotent
    pub fn close(&self) {
        if !self.state.close_sent.swap(true, Ordering::AcqRel) {
            self.state.shared.send(Frame::new(
                ChannelId::new(self.state.remote_id),
                Message::ChannelClose,
            ));
        }
        self.state.teardown();
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.is_cancelled()
    }

    /// Resolves once the channel is closed from either side or the mux dies
    pub async fn closed(&self) {
        self.state.closed.cancelled().await
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("local", &self.state.local_id)
            .field("remote", &self.state.remote_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Inbound byte stream of a channel
pub struct ChannelReader {
    inner: Arc<Mutex<ReaderInner>>,
    state: Arc<ChannelState>,
}

impl AsyncRead for ChannelReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        let n = {
            let mut inner = lock(&self.inner);
            loop {
                if !inner.pending.is_empty() {
                    let n = buf.remaining().min(inner.pending.len());
                    let chunk = inner.pending.split_to(n);
                    buf.put_slice(&chunk);
                    break n;
                }
                match inner.rx.poll_recv(cx) {
                    Poll::Ready(Some(data)) => inner.pending = data,
                    // EOF
                    Poll::Ready(None) => return Poll::Ready(Ok(())),
                    Poll::Pending => return Poll::Pending,
                }
            }
        };

        self.state.consumed(n);
        Poll::Ready(Ok(()))
    }
}

type WriteFuture = Pin<Box<dyn Future<Output = io::Result<usize>> + Send>>;

/// Outbound byte stream of a channel
pub struct ChannelWriter {
    channel: Channel,
    extended: bool,
    in_flight: Option<WriteFuture>,
}

impl ChannelWriter {
    fn new(channel: Channel, extended: bool) -> Self {
        Self {
            channel,
            extended,
            in_flight: None,
        }
    }
}

fn broken_pipe(e: ProtocolError) -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, e)
}

impl AsyncWrite for ChannelWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.in_flight.is_none() {
            let state = self.channel.state.clone();
            let extended = self.extended;
            let data = Bytes::copy_from_slice(&buf[..buf.len().min(MAX_PACKET as usize)]);
            self.in_flight = Some(Box::pin(async move {
                state
                    .write_packet(&data, extended)
                    .await
                    .map_err(broken_pipe)
            }));
        }

        let result = match self.in_flight.as_mut() {
            Some(fut) => futures::ready!(fut.as_mut().poll(cx)),
            None => Ok(0),
        };
        self.in_flight = None;
        Poll::Ready(result)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if let Some(fut) = self.in_flight.as_mut() {
            let result = futures::ready!(fut.as_mut().poll(cx));
            self.in_flight = None;
            result?;
        }
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        futures::ready!(self.as_mut().poll_flush(cx))?;
        Poll::Ready(self.channel.close_write().map_err(broken_pipe))
    }
}

/// An incoming channel open awaiting a decision
///
/// Dropping it without accepting rejects the open.
pub struct NewChannel {
    shared: Arc<Shared>,
    channel_type: String,
    remote_id: u32,
    initial_window: u32,
    max_packet: u32,
    extra: Bytes,
    answered: bool,
}

impl NewChannel {
    pub(crate) fn new(
        shared: Arc<Shared>,
        channel_type: String,
        remote_id: u32,
        initial_window: u32,
        max_packet: u32,
        extra: Bytes,
    ) -> Self {
        Self {
            shared,
            channel_type,
            remote_id,
            initial_window,
            max_packet,
            extra,
            answered: false,
        }
    }

    pub fn channel_type(&self) -> &str {
        &self.channel_type
    }

    /// Type-specific data sent with the open
    pub fn extra(&self) -> &Bytes {
        &self.extra
    }

    pub fn accept(mut self) -> Result<Channel, ProtocolError> {
        self.answered = true;
        if self.shared.closed.is_cancelled() {
            return Err(ProtocolError::MuxClosed);
        }

        let local_id = self.shared.next_channel_id();
        let state = ChannelState::new(
            self.shared.clone(),
            local_id,
            self.remote_id,
            self.initial_window,
            self.max_packet,
        );
        self.shared.channels.insert(local_id, state.clone());

        let confirmed = self.shared.send(Frame::new(
            ChannelId::new(self.remote_id),
            Message::ChannelOpenConfirmation {
                sender: local_id,
                initial_window: LOCAL_WINDOW,
                max_packet: MAX_PACKET,
            },
        ));
        if !confirmed {
            state.teardown();
            return Err(ProtocolError::MuxClosed);
        }

        Ok(Channel::from_state(state))
    }

    pub fn reject(mut self, reason: OpenFailureReason, message: &str) {
        self.send_failure(reason, message);
    }

    fn send_failure(&mut self, reason: OpenFailureReason, message: &str) {
        if self.answered {
            return;
        }
        self.answered = true;
        self.shared.send(Frame::new(
            ChannelId::new(self.remote_id),
            Message::ChannelOpenFailure {
                reason,
                message: message.to_string(),
            },
        ));
    }
}

impl Drop for NewChannel {
    fn drop(&mut self) {
        self.send_failure(
            OpenFailureReason::AdministrativelyProhibited,
            "channel open not accepted",
        );
    }
}

impl std::fmt::Debug for NewChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NewChannel")
            .field("channel_type", &self.channel_type)
            .field("remote_id", &self.remote_id)
            .finish()
    }
}
