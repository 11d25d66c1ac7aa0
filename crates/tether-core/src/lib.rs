//! tether-core: Shared types, configuration and traits for tether attach
//!
//! This crate holds what both sides of an attach connection agree on beyond
//! the wire format: container identity, the executor and session
//! configuration consumed by the agent, daemon configuration, error types,
//! and the controller-facing `SessionInteractor` trait.

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use error::{ConfigError, ConnectorError, InteractionError, SessionError, TetherError};
pub use traits::SessionInteractor;
pub use types::ContainerId;
