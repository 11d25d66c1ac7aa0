//! tether: container-side agent for attach sessions
//!
//! The agent runs the sessions of one container, dials the port layer's
//! attach server over TCP or a serial line, and serves attach channels to
//! those sessions over the control connection.

pub mod backchannel;
pub mod dispatcher;
pub mod interaction;
pub mod launch;
pub mod plugin;
pub mod process;
pub mod reaper;
pub mod session;
pub mod signals;
pub mod state;

pub use backchannel::Backchannel;
pub use dispatcher::Dispatcher;
pub use interaction::Interaction;
pub use process::Process;
pub use session::Session;
pub use state::Tether;
