//! Core error types for tether attach

use std::path::PathBuf;
use tether_protocol::{HandshakeError, ProtocolError};
use thiserror::Error;

use crate::types::ContainerId;

/// Top-level error type
#[derive(Error, Debug)]
pub enum TetherError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("Interaction error: {0}")]
    Interaction(#[from] InteractionError),

    #[error("Connector error: {0}")]
    Connector(#[from] ConnectorError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures of operations on one attach channel
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InteractionError {
    /// The peer or the connection to it is gone
    #[error("Transport closed")]
    TransportClosed,

    /// The agent refused to open the attach channel
    #[error("Channel open rejected ({reason}): {message}")]
    ChannelOpenRejected { reason: String, message: String },

    #[error("Signal {0} failed")]
    SignalFailed(String),

    #[error("Window change failed")]
    ResizeFailed,

    #[error("Ping failed: {0}")]
    PingFailed(String),

    #[error("Close stdin failed")]
    CloseStdinFailed,

    #[error("Unblock failed")]
    UnblockFailed,

    /// A request was answered with failure
    #[error("Request {0} failed")]
    RequestFailed(String),

    /// No reply to a request within the ping timeout
    #[error("Request {0} timed out")]
    Timeout(String),
}

impl From<ProtocolError> for InteractionError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::OpenRejected { reason, message } => {
                InteractionError::ChannelOpenRejected {
                    reason: reason.to_string(),
                    message,
                }
            }
            e if e.is_transport_closed() => InteractionError::TransportClosed,
            e => InteractionError::RequestFailed(e.to_string()),
        }
    }
}

/// Failures of the connector registry
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectorError {
    #[error("Transport closed")]
    TransportClosed,

    /// The caller's deadline passed
    #[error("Timed out waiting for interaction")]
    Timeout,

    /// The caller cancelled the wait
    #[error("Interaction wait cancelled")]
    Cancelled,

    /// Single lookup found nothing
    #[error("No interaction for container {0}")]
    NotFound(ContainerId),

    /// The connector has been stopped
    #[error("Connector stopped")]
    Stopped,

    #[error("Failed to bind listener: {0}")]
    Bind(String),

    #[error("Interaction error: {0}")]
    Interaction(#[from] InteractionError),
}

/// Agent-side session failures
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Session already started: {0}")]
    AlreadyStarted(String),

    #[error("Session is not running: {0}")]
    NotRunning(String),

    #[error("Failed to spawn process: {0}")]
    Spawn(String),

    #[error("PTY error: {0}")]
    Pty(String),

    #[error("Unknown signal: {0}")]
    UnknownSignal(String),

    #[error("Failed to deliver signal: {0}")]
    Signal(String),

    #[error("Unknown user or group: {0}")]
    UnknownUser(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),
}
