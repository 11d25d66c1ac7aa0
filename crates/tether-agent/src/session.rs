//! Session runtime state
//!
//! A [`Session`] wraps one configured process. Output goes through a
//! [`MultiWriter`] per stream, which fans bytes out to every attached
//! channel and keeps a bounded backlog while nothing is attached. Stdin is
//! fed by any number of attached channels through one queue; input and a
//! `close-stdin` that arrive while no child is running are held for the next
//! launch.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::{Bytes, BytesMut};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use portable_pty::{MasterPty, PtySize};
use tokio::sync::{mpsc, watch};

use tether_core::config::SessionConfig;
use tether_core::SessionError;
use tether_protocol::msgs::{self, WindowSize};
use tether_protocol::Channel;

/// Bytes of output retained per stream while no channel is attached
pub const BACKLOG_LIMIT: usize = 64 * 1024;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Clone)]
struct Sink {
    id: u64,
    channel: Channel,
}

#[derive(Default)]
struct WriterState {
    sinks: Vec<Sink>,
    backlog: BytesMut,
}

/// Fan-out writer for one output stream
pub struct MultiWriter {
    extended: bool,
    state: tokio::sync::Mutex<WriterState>,
}

impl MultiWriter {
    /// `extended` routes writes to the channels' stderr stream
    pub fn new(extended: bool) -> Self {
        Self {
            extended,
            state: tokio::sync::Mutex::new(WriterState::default()),
        }
    }

    async fn send(&self, channel: &Channel, data: &[u8]) -> bool {
        let result = if self.extended {
            channel.write_stderr(data).await
        } else {
            channel.write_all(data).await
        };
        result.is_ok()
    }

    /// Deliver `data` to every attached channel, or to the backlog
    ///
    /// Channel writes happen outside the lock, so a stalled attachment never
    /// holds up attach or detach.
    pub async fn write(&self, data: &[u8]) {
        let sinks = {
            let mut state = self.state.lock().await;
            if state.sinks.is_empty() {
                state.backlog.extend_from_slice(data);
                let excess = state.backlog.len().saturating_sub(BACKLOG_LIMIT);
                if excess > 0 {
                    let _ = state.backlog.split_to(excess);
                }
                return;
            }
            state.sinks.clone()
        };

        let mut dead = Vec::new();
        for sink in &sinks {
            if !self.send(&sink.channel, data).await {
                dead.push(sink.id);
            }
        }
        if !dead.is_empty() {
            self.state
                .lock()
                .await
                .sinks
                .retain(|s| !dead.contains(&s.id));
        }
    }

    /// Attach a channel, replaying any backlog to it first
    pub async fn add(&self, id: u64, channel: Channel) {
        let mut state = self.state.lock().await;
        let backlog = state.backlog.split().freeze();
        if !backlog.is_empty() && !self.send(&channel, &backlog).await {
            return;
        }
        state.sinks.push(Sink { id, channel });
    }

    pub async fn remove(&self, id: u64) {
        self.state.lock().await.sinks.retain(|s| s.id != id);
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.sinks.len()
    }

    /// Bytes held for the next attach
    pub async fn backlog(&self) -> Bytes {
        Bytes::copy_from_slice(&self.state.lock().await.backlog)
    }
}

/// An attached channel
struct Attachment {
    id: u64,
    channel: Channel,
}

/// Mutable per-session state
#[derive(Default)]
struct SessionState {
    pid: Option<i32>,
    started: bool,
    resurrection_count: u32,
    exit_status: Option<u32>,
    pty: Option<Box<dyn MasterPty + Send>>,
    window: Option<WindowSize>,
    stdin: Option<mpsc::UnboundedSender<Bytes>>,
    /// Input received while no child was running
    stdin_pending: Vec<Bytes>,
    stdin_pending_len: usize,
    /// A close requested while no child was running
    stdin_close_pending: bool,
}

/// One configured process and its I/O
pub struct Session {
    pub id: String,
    pub config: SessionConfig,
    pub stdout: MultiWriter,
    pub stderr: MultiWriter,
    state: Mutex<SessionState>,
    attachments: tokio::sync::Mutex<(Vec<Attachment>, bool)>,
    next_attachment: AtomicU64,
    finished: watch::Sender<Option<u32>>,
}

impl Session {
    pub fn new(config: SessionConfig) -> Arc<Self> {
        let (finished, _) = watch::channel(None);
        Arc::new(Self {
            id: config.id.clone(),
            config,
            stdout: MultiWriter::new(false),
            stderr: MultiWriter::new(true),
            state: Mutex::new(SessionState::default()),
            attachments: tokio::sync::Mutex::new((Vec::new(), false)),
            next_attachment: AtomicU64::new(1),
            finished,
        })
    }

    pub fn pid(&self) -> Option<i32> {
        lock(&self.state).pid
    }

    pub fn started(&self) -> bool {
        lock(&self.state).started
    }

    pub fn resurrection_count(&self) -> u32 {
        lock(&self.state).resurrection_count
    }

    pub fn exit_status(&self) -> Option<u32> {
        lock(&self.state).exit_status
    }

    /// Record a freshly spawned child
    pub(crate) fn launched(
        &self,
        pid: i32,
        stdin: Option<mpsc::UnboundedSender<Bytes>>,
        pty: Option<Box<dyn MasterPty + Send>>,
    ) {
        let mut state = lock(&self.state);
        if state.started {
            state.resurrection_count += 1;
        }
        state.started = true;
        state.pid = Some(pid);
        state.exit_status = None;
        state.pty = pty;

        let pending = std::mem::take(&mut state.stdin_pending);
        state.stdin_pending_len = 0;
        let close = std::mem::take(&mut state.stdin_close_pending);
        state.stdin = match stdin {
            Some(tx) => {
                if !pending.is_empty() {
                    tracing::debug!(session = %self.id, chunks = pending.len(), "Replaying held stdin");
                }
                for data in pending {
                    let _ = tx.send(data);
                }
                if close {
                    tracing::debug!(session = %self.id, "Closed stdin");
                    None
                } else {
                    Some(tx)
                }
            }
            None => None,
        };
    }

    /// Record a child exit; the pty and stdin go with it
    pub(crate) fn exited(&self, status: u32) {
        let mut state = lock(&self.state);
        state.pid = None;
        state.exit_status = Some(status);
        state.stdin = None;
        state.pty = None;
    }

    /// Resolves with the final exit status once the session is finished
    pub async fn wait(&self) -> u32 {
        let mut rx = self.finished.subscribe();
        loop {
            if let Some(status) = *rx.borrow_and_update() {
                return status;
            }
            if rx.changed().await.is_err() {
                return self.exit_status().unwrap_or(0);
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished.borrow().is_some()
    }

    /// Queue bytes for the child's stdin
    ///
    /// Before the child is running the bytes are held, up to
    /// [`BACKLOG_LIMIT`], and handed over at launch. Returns false when the
    /// input can never reach a child.
    pub fn feed_stdin(&self, data: Bytes) -> bool {
        let mut state = lock(&self.state);
        if let Some(tx) = state.stdin.as_ref() {
            return tx.send(data).is_ok();
        }
        if state.pid.is_some()
            || !self.config.open_stdin
            || state.stdin_close_pending
            || self.is_finished()
            || state.stdin_pending_len + data.len() > BACKLOG_LIMIT
        {
            return false;
        }
        state.stdin_pending_len += data.len();
        state.stdin_pending.push(data);
        true
    }

    /// Half-close the child's stdin, or the next child's if none is running
    pub fn close_stdin(&self) {
        let mut state = lock(&self.state);
        if state.stdin.take().is_some() {
            tracing::debug!(session = %self.id, "Closed stdin");
        } else if state.pid.is_none() && self.config.open_stdin {
            tracing::debug!(session = %self.id, "Closing stdin at launch");
            state.stdin_close_pending = true;
        }
    }

    /// A `close-stdin` is waiting for the next launch
    pub(crate) fn stdin_close_pending(&self) -> bool {
        lock(&self.state).stdin_close_pending
    }

    pub fn has_tty(&self) -> bool {
        lock(&self.state).pty.is_some()
    }

    /// Last requested window size, applied when a pty is next allocated
    pub fn window(&self) -> Option<WindowSize> {
        lock(&self.state).window
    }

    /// Resize the pty; sessions without one accept and ignore the request
    ///
    /// A size with zero rows or columns is accepted and left unapplied.
    pub fn resize(&self, size: WindowSize) -> Result<(), SessionError> {
        if size.cols == 0 || size.rows == 0 {
            tracing::debug!(session = %self.id, "Ignoring empty window size");
            return Ok(());
        }
        let mut state = lock(&self.state);
        if self.config.tty {
            state.window = Some(size);
        }
        let Some(pty) = state.pty.as_ref() else {
            return Ok(());
        };

        let clamp = |v: u32| u16::try_from(v).unwrap_or(u16::MAX);
        tracing::debug!(session = %self.id, "Resizing pty to {}x{}", size.cols, size.rows);
        pty.resize(PtySize {
            rows: clamp(size.rows),
            cols: clamp(size.cols),
            pixel_width: clamp(size.width_px),
            pixel_height: clamp(size.height_px),
        })
        .map_err(|e| SessionError::Pty(e.to_string()))
    }

    /// Deliver `signal` to the running child
    pub fn signal(&self, signal: Signal) -> Result<(), SessionError> {
        let pid = self
            .pid()
            .ok_or_else(|| SessionError::NotRunning(self.id.clone()))?;
        tracing::info!(session = %self.id, pid, "Sending {}", signal);
        kill(Pid::from_raw(pid), signal).map_err(|e| SessionError::Signal(e.to_string()))
    }

    /// Bind `channel` to this session's output
    ///
    /// A session that already finished replays its backlog, then sends EOF,
    /// its exit status and closes the channel.
    pub async fn attach(&self, channel: Channel) -> u64 {
        let id = self.next_attachment.fetch_add(1, Ordering::Relaxed);
        let mut attachments = self.attachments.lock().await;

        self.stdout.add(id, channel.clone()).await;
        if !self.config.tty {
            self.stderr.add(id, channel.clone()).await;
        }

        if attachments.1 {
            let status = self.exit_status().unwrap_or(0);
            drop(attachments);
            self.stdout.remove(id).await;
            self.stderr.remove(id).await;
            deliver_exit(&channel, status).await;
            return id;
        }

        attachments.0.push(Attachment { id, channel });
        tracing::debug!(session = %self.id, attachment = id, "Channel attached");
        id
    }

    /// Unbind an attachment whose channel went away
    pub async fn detach(&self, id: u64) {
        self.stdout.remove(id).await;
        self.stderr.remove(id).await;
        self.attachments.lock().await.0.retain(|a| a.id != id);
    }

    pub async fn attachment_count(&self) -> usize {
        self.attachments.lock().await.0.len()
    }

    /// Final exit: every attached channel gets EOF, exit status, close
    pub(crate) async fn finish(&self, status: u32) {
        let drained = {
            let mut attachments = self.attachments.lock().await;
            attachments.1 = true;
            std::mem::take(&mut attachments.0)
        };

        for attachment in drained {
            self.stdout.remove(attachment.id).await;
            self.stderr.remove(attachment.id).await;
            deliver_exit(&attachment.channel, status).await;
        }

        self.finished.send_replace(Some(status));
        tracing::info!(session = %self.id, "Session finished with status {}", status);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("pid", &self.pid())
            .field("exit_status", &self.exit_status())
            .finish()
    }
}

/// EOF, then `exit-status`, then close
async fn deliver_exit(channel: &Channel, status: u32) {
    let _ = channel.close_write();
    if let Err(e) = channel
        .send_request(msgs::EXIT_STATUS_REQ, false, msgs::encode_u32(status))
        .await
    {
        tracing::debug!("Could not deliver exit status: {}", e);
    }
    channel.close();
}
