//! Protocol error types

use thiserror::Error;

use crate::message::OpenFailureReason;

/// Errors that can occur during protocol operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Invalid frame header
    #[error("Invalid frame header")]
    InvalidHeader,

    /// Unknown message type
    #[error("Unknown message type: {0}")]
    UnknownMessageType(u8),

    /// Payload exceeds maximum size
    #[error("Payload too large: {size} bytes exceeds maximum of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    /// Request payload could not be decoded
    #[error("Malformed {what} payload")]
    MalformedPayload { what: &'static str },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The multiplexer is gone (peer closed or local shutdown)
    #[error("Multiplexer closed")]
    MuxClosed,

    /// The channel was closed, or its write side was half-closed
    #[error("Channel closed")]
    ChannelClosed,

    /// The peer refused to open a channel
    #[error("Channel open rejected ({reason}): {message}")]
    OpenRejected {
        reason: OpenFailureReason,
        message: String,
    },
}

impl ProtocolError {
    /// Whether this error means the peer (or the stream to it) is gone
    pub fn is_transport_closed(&self) -> bool {
        matches!(
            self,
            ProtocolError::MuxClosed | ProtocolError::ChannelClosed | ProtocolError::Io(_)
        )
    }
}

/// Frame sync failures
///
/// `Retry` is the retriable class: the caller purges the stream and runs
/// another round. `Eof` and `Io` end the attempt for good.
#[derive(Error, Debug)]
pub enum HandshakeError {
    /// The bytes read did not form the expected exchange
    #[error("Handshake mismatch: {0}")]
    Retry(String),

    /// The read window elapsed before the peer answered
    #[error("Handshake timed out")]
    Timeout,

    /// The stream reported end of file
    #[error("Stream closed during handshake")]
    Eof,

    /// Debug lossiness check failed
    #[error("Lossiness check failed: {0}")]
    Lossy(String),

    /// Other I/O error
    #[error("I/O error during handshake: {0}")]
    Io(#[from] std::io::Error),
}

impl HandshakeError {
    /// Whether another round may succeed
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            HandshakeError::Retry(_) | HandshakeError::Timeout | HandshakeError::Lossy(_)
        )
    }
}
