//! Multiplexer messages
//!
//! These are the messages exchanged over an established session once the
//! frame sync handshake has completed. They mirror the SSH connection
//! protocol: connection-level (global) requests, channel open negotiation,
//! channel data with window flow control, channel requests, and EOF/close.
//!
//! # Message Flow
//!
//! Typical sequence for one attach:
//!
//! 1. Controller sends `GlobalRequest("version")`, agent replies `RequestSuccess`
//! 2. Controller sends `ChannelOpen("attach", id)`, agent replies `ChannelOpenConfirmation`
//! 3. Controller sends `ChannelRequest("unblock")` if the session is run-blocked
//! 4. `ChannelData` and `ChannelExtendedData` flow, `ChannelWindowAdjust` replenishes credit
//! 5. On exit the agent sends `ChannelEof`, `ChannelRequest("exit-status")`, `ChannelClose`
//!
//! Replies to requests carry the sequence number of the request they answer.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Request-vocabulary revision reported in reply to the `version` request
pub const PROTOCOL_VERSION: u32 = 1;

/// Message type identifier carried in the frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    GlobalRequest = 0x01,
    RequestSuccess = 0x02,
    RequestFailure = 0x03,
    ChannelOpen = 0x10,
    ChannelOpenConfirmation = 0x11,
    ChannelOpenFailure = 0x12,
    ChannelWindowAdjust = 0x13,
    ChannelData = 0x14,
    ChannelExtendedData = 0x15,
    ChannelEof = 0x16,
    ChannelClose = 0x17,
    ChannelRequest = 0x18,
    ChannelSuccess = 0x19,
    ChannelFailure = 0x1A,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::GlobalRequest),
            0x02 => Some(Self::RequestSuccess),
            0x03 => Some(Self::RequestFailure),
            0x10 => Some(Self::ChannelOpen),
            0x11 => Some(Self::ChannelOpenConfirmation),
            0x12 => Some(Self::ChannelOpenFailure),
            0x13 => Some(Self::ChannelWindowAdjust),
            0x14 => Some(Self::ChannelData),
            0x15 => Some(Self::ChannelExtendedData),
            0x16 => Some(Self::ChannelEof),
            0x17 => Some(Self::ChannelClose),
            0x18 => Some(Self::ChannelRequest),
            0x19 => Some(Self::ChannelSuccess),
            0x1A => Some(Self::ChannelFailure),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Why a channel open was refused (SSH reason codes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpenFailureReason {
    AdministrativelyProhibited,
    ConnectFailed,
    UnknownChannelType,
    ResourceShortage,
}

impl fmt::Display for OpenFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::AdministrativelyProhibited => "administratively prohibited",
            Self::ConnectFailed => "connect failed",
            Self::UnknownChannelType => "unknown channel type",
            Self::ResourceShortage => "resource shortage",
        };
        f.write_str(s)
    }
}

/// Multiplexer protocol message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Connection-level request
    GlobalRequest {
        seq: u32,
        name: String,
        want_reply: bool,
        payload: Bytes,
    },

    /// Positive reply to a global request
    RequestSuccess { seq: u32, payload: Bytes },

    /// Negative reply to a global request
    RequestFailure { seq: u32 },

    /// Ask the peer to open a channel; `sender` is our id for it
    ChannelOpen {
        channel_type: String,
        sender: u32,
        initial_window: u32,
        max_packet: u32,
        extra: Bytes,
    },

    /// Channel accepted; `sender` is the peer's id for it
    ChannelOpenConfirmation {
        sender: u32,
        initial_window: u32,
        max_packet: u32,
    },

    /// Channel refused
    ChannelOpenFailure {
        reason: OpenFailureReason,
        message: String,
    },

    /// Grant more send credit
    ChannelWindowAdjust { bytes: u32 },

    /// Primary data stream (stdin toward the agent, stdout toward the controller)
    ChannelData(Bytes),

    /// Secondary data stream (stderr)
    ChannelExtendedData(Bytes),

    /// No more data will be sent on this channel
    ChannelEof,

    /// Channel is finished
    ChannelClose,

    /// Channel-scoped request
    ChannelRequest {
        seq: u32,
        name: String,
        want_reply: bool,
        payload: Bytes,
    },

    /// Positive reply to a channel request
    ChannelSuccess { seq: u32, payload: Bytes },

    /// Negative reply to a channel request
    ChannelFailure { seq: u32 },
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::GlobalRequest { .. } => MessageType::GlobalRequest,
            Message::RequestSuccess { .. } => MessageType::RequestSuccess,
            Message::RequestFailure { .. } => MessageType::RequestFailure,
            Message::ChannelOpen { .. } => MessageType::ChannelOpen,
            Message::ChannelOpenConfirmation { .. } => MessageType::ChannelOpenConfirmation,
            Message::ChannelOpenFailure { .. } => MessageType::ChannelOpenFailure,
            Message::ChannelWindowAdjust { .. } => MessageType::ChannelWindowAdjust,
            Message::ChannelData(_) => MessageType::ChannelData,
            Message::ChannelExtendedData(_) => MessageType::ChannelExtendedData,
            Message::ChannelEof => MessageType::ChannelEof,
            Message::ChannelClose => MessageType::ChannelClose,
            Message::ChannelRequest { .. } => MessageType::ChannelRequest,
            Message::ChannelSuccess { .. } => MessageType::ChannelSuccess,
            Message::ChannelFailure { .. } => MessageType::ChannelFailure,
        }
    }
}
