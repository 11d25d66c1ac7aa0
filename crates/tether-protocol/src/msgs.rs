//! Request vocabulary and payload encodings
//!
//! Payloads follow SSH wire conventions: a `string` is a 4-byte big-endian
//! length followed by that many bytes, a `uint32` is 4 bytes big-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Channel type for per-container attach channels
pub const ATTACH_CHANNEL: &str = "attach";

/// Global request: list (or announce) container ids
pub const CONTAINERS_REQ: &str = "containers";
/// Global request: request-vocabulary revision
pub const VERSION_REQ: &str = "version";
/// Global request: agent is about to fork/suspend
pub const FORK_REQ: &str = "fork";
/// Global request: transport liveness check, answered by the multiplexer itself
pub const KEEPALIVE_REQ: &str = "keepalive@tether";

/// Channel request: deliver a signal to the session's process
pub const SIGNAL_REQ: &str = "signal";
/// Channel request: resize the session's terminal
pub const WINDOW_CHANGE_REQ: &str = "window-change";
/// Channel request: close the session's stdin
pub const CLOSE_STDIN_REQ: &str = "close-stdin";
/// Channel request: liveness check echoed by the agent
pub const PING_REQ: &str = "ping";
/// Channel request: release a run-blocked session
pub const UNBLOCK_REQ: &str = "unblock";
/// Channel request: exit code, sent by the agent
pub const EXIT_STATUS_REQ: &str = "exit-status";

/// Terminal dimensions carried by `window-change`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSize {
    pub cols: u32,
    pub rows: u32,
    pub width_px: u32,
    pub height_px: u32,
}

impl WindowSize {
    pub fn new(cols: u32, rows: u32) -> Self {
        Self {
            cols,
            rows,
            width_px: 0,
            height_px: 0,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(16);
        buf.put_u32(self.cols);
        buf.put_u32(self.rows);
        buf.put_u32(self.width_px);
        buf.put_u32(self.height_px);
        buf.freeze()
    }

    pub fn decode(mut payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() < 16 {
            return Err(ProtocolError::MalformedPayload {
                what: WINDOW_CHANGE_REQ,
            });
        }
        Ok(Self {
            cols: payload.get_u32(),
            rows: payload.get_u32(),
            width_px: payload.get_u32(),
            height_px: payload.get_u32(),
        })
    }
}

impl Default for WindowSize {
    fn default() -> Self {
        Self::new(80, 24)
    }
}

/// Append an SSH string
pub fn put_string(buf: &mut BytesMut, s: &[u8]) {
    buf.put_u32(s.len() as u32);
    buf.put_slice(s);
}

/// Take an SSH string off the front of `payload`
pub fn get_string<'a>(payload: &mut &'a [u8], what: &'static str) -> Result<&'a [u8], ProtocolError> {
    if payload.len() < 4 {
        return Err(ProtocolError::MalformedPayload { what });
    }
    let len = payload.get_u32() as usize;
    if payload.len() < len {
        return Err(ProtocolError::MalformedPayload { what });
    }
    let (s, rest) = payload.split_at(len);
    *payload = rest;
    Ok(s)
}

/// A single string payload
pub fn encode_string(s: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + s.len());
    put_string(&mut buf, s.as_bytes());
    buf.freeze()
}

pub fn decode_string(mut payload: &[u8], what: &'static str) -> Result<String, ProtocolError> {
    let s = get_string(&mut payload, what)?;
    String::from_utf8(s.to_vec()).map_err(|_| ProtocolError::MalformedPayload { what })
}

/// `uint32 count` followed by `count` strings
pub fn encode_containers<S: AsRef<str>>(ids: &[S]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u32(ids.len() as u32);
    for id in ids {
        put_string(&mut buf, id.as_ref().as_bytes());
    }
    buf.freeze()
}

pub fn decode_containers(mut payload: &[u8]) -> Result<Vec<String>, ProtocolError> {
    let what = CONTAINERS_REQ;
    if payload.len() < 4 {
        return Err(ProtocolError::MalformedPayload { what });
    }
    let count = payload.get_u32() as usize;
    // Each entry needs at least its length prefix
    if count > payload.len() / 4 {
        return Err(ProtocolError::MalformedPayload { what });
    }

    let mut ids = Vec::with_capacity(count);
    for _ in 0..count {
        let s = get_string(&mut payload, what)?;
        ids.push(String::from_utf8(s.to_vec()).map_err(|_| ProtocolError::MalformedPayload { what })?);
    }
    Ok(ids)
}

pub fn encode_u32(value: u32) -> Bytes {
    Bytes::copy_from_slice(&value.to_be_bytes())
}

pub fn decode_u32(mut payload: &[u8], what: &'static str) -> Result<u32, ProtocolError> {
    if payload.len() < 4 {
        return Err(ProtocolError::MalformedPayload { what });
    }
    Ok(payload.get_u32())
}
