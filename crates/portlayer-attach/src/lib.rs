//! portlayer-attach: Controller side of tether attach
//!
//! Agents running inside containers dial the attach server. Each accepted
//! stream is frame-synced, wrapped in an SSH client session and a channel
//! multiplexer, and asked which containers it hosts. The connector then
//! opens one attach channel per container and serves lookups from the
//! resulting registry.

pub mod connection;
pub mod connector;
pub mod interaction;
pub mod server;

pub use connector::{Connector, SharedInteractor};
pub use interaction::Interactor;
pub use server::{AgentLink, AttachServer};
