//! Controller-side handle to one attached session

use async_trait::async_trait;
use tether_protocol::WindowSize;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::InteractionError;
use crate::types::ContainerId;

/// An open attach channel to one container session
///
/// Methods may be called concurrently from different tasks. Reads (or
/// writes) on the same stream direction are not synchronized; callers
/// serialize them.
#[async_trait]
pub trait SessionInteractor: Send + Sync {
    fn id(&self) -> &ContainerId;

    /// Session stdout; reads end at EOF or close
    fn stdout(&self) -> Box<dyn AsyncRead + Send + Unpin>;

    fn stderr(&self) -> Box<dyn AsyncRead + Send + Unpin>;

    /// Session stdin; shutting the writer down half-closes the channel
    fn stdin(&self) -> Box<dyn AsyncWrite + Send + Unpin>;

    /// Deliver a signal by mnemonic (`TERM`, `SIGINT`, ...)
    async fn signal(&self, name: &str) -> Result<(), InteractionError>;

    async fn resize(&self, size: WindowSize) -> Result<(), InteractionError>;

    /// Close the session's stdin; later stdin writes fail
    async fn close_stdin(&self) -> Result<(), InteractionError>;

    /// Round-trip an echo; fails on timeout or mismatch
    async fn ping(&self) -> Result<(), InteractionError>;

    /// Release a run-blocked session; idempotent
    async fn unblock(&self) -> Result<(), InteractionError>;

    /// Wait for the session's exit code
    async fn exit_status(&self) -> Result<u32, InteractionError>;

    /// Close the channel; later calls are no-ops
    async fn close(&self) -> Result<(), InteractionError>;

    fn is_closed(&self) -> bool;
}
