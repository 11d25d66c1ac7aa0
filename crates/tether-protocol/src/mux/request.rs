//! Inbound requests and their replies

use std::sync::Arc;

use bytes::Bytes;

use super::channel::ChannelState;
use super::Shared;
use crate::codec::Frame;
use crate::message::Message;

/// Answer to a request that asked for one
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub ok: bool,
    pub payload: Bytes,
}

impl Reply {
    pub fn success(payload: Bytes) -> Self {
        Self { ok: true, payload }
    }

    pub fn failure() -> Self {
        Self {
            ok: false,
            payload: Bytes::new(),
        }
    }
}

/// A connection-level request from the peer
///
/// Dropping a request that wants a reply answers it with failure.
pub struct GlobalRequest {
    shared: Arc<Shared>,
    seq: u32,
    name: String,
    want_reply: bool,
    payload: Bytes,
    replied: bool,
}

impl GlobalRequest {
    pub(crate) fn new(
        shared: Arc<Shared>,
        seq: u32,
        name: String,
        want_reply: bool,
        payload: Bytes,
    ) -> Self {
        Self {
            shared,
            seq,
            name,
            want_reply,
            payload,
            replied: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn want_reply(&self) -> bool {
        self.want_reply
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Answer the request; a no-op when no reply was asked for
    pub fn reply(mut self, ok: bool, payload: Bytes) {
        self.send_reply(ok, payload);
    }

    fn send_reply(&mut self, ok: bool, payload: Bytes) {
        if self.replied || !self.want_reply {
            return;
        }
        self.replied = true;
        let seq = self.seq;
        let msg = if ok {
            Message::RequestSuccess { seq, payload }
        } else {
            Message::RequestFailure { seq }
        };
        self.shared.send(Frame::control(msg));
    }
}

impl Drop for GlobalRequest {
    fn drop(&mut self) {
        self.send_reply(false, Bytes::new());
    }
}

impl std::fmt::Debug for GlobalRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalRequest")
            .field("seq", &self.seq)
            .field("name", &self.name)
            .field("want_reply", &self.want_reply)
            .finish()
    }
}

/// A request addressed to one channel
///
/// Dropping a request that wants a reply answers it with failure.
pub struct ChannelRequest {
    state: Arc<ChannelState>,
    seq: u32,
    name: String,
    want_reply: bool,
    payload: Bytes,
    replied: bool,
}

impl ChannelRequest {
    pub(crate) fn new(
        state: Arc<ChannelState>,
        seq: u32,
        name: String,
        want_reply: bool,
        payload: Bytes,
    ) -> Self {
        Self {
            state,
            seq,
            name,
            want_reply,
            payload,
            replied: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn want_reply(&self) -> bool {
        self.want_reply
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn reply(mut self, ok: bool, payload: Bytes) {
        self.send_reply(ok, payload);
    }

    fn send_reply(&mut self, ok: bool, payload: Bytes) {
        if self.replied || !self.want_reply {
            return;
        }
        self.replied = true;
        let seq = self.seq;
        let msg = if ok {
            Message::ChannelSuccess { seq, payload }
        } else {
            Message::ChannelFailure { seq }
        };
        self.state.send(msg);
    }
}

impl Drop for ChannelRequest {
    fn drop(&mut self) {
        self.send_reply(false, Bytes::new());
    }
}

impl std::fmt::Debug for ChannelRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelRequest")
            .field("channel", &self.state.local_id)
            .field("seq", &self.seq)
            .field("name", &self.name)
            .field("want_reply", &self.want_reply)
            .finish()
    }
}
