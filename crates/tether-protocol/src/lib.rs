//! tether-protocol: Wire protocol for tether attach
//!
//! This crate defines everything that travels between the controller
//! (port layer) and the container agent (tether): the byte-level frame
//! sync handshake, the binary frame codec, the channel multiplexer that
//! rides on top of it, and the payload encodings of the request vocabulary.

pub mod channel;
pub mod codec;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod message;
pub mod msgs;
pub mod mux;

pub use channel::ChannelId;
pub use codec::{Frame, FrameCodec};
pub use error::{HandshakeError, ProtocolError};
pub use frame::{FrameHeader, HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use message::{Message, MessageType, OpenFailureReason, PROTOCOL_VERSION};
pub use msgs::WindowSize;
pub use mux::{
    Channel, ChannelReader, ChannelRequest, ChannelWriter, GlobalRequest, Mux, MuxHandle,
    NewChannel, Reply,
};
