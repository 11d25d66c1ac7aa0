//! Attach server: listener ownership and agent link setup

mod handler;
mod listener;

pub use handler::{establish, sync, AgentKeyCheck, AgentLink, EstablishError, AGENT_USER};
pub use listener::AttachServer;
