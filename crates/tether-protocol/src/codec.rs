//! Tokio codec for multiplexer frames

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::channel::ChannelId;
use crate::error::ProtocolError;
use crate::frame::{FrameHeader, MAX_PAYLOAD_SIZE};
use crate::message::Message;

/// A decoded frame: recipient channel plus message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub channel: ChannelId,
    pub message: Message,
}

impl Frame {
    pub fn new(channel: ChannelId, message: Message) -> Self {
        Self { channel, message }
    }

    /// A connection-level frame
    pub fn control(message: Message) -> Self {
        Self::new(ChannelId::CONTROL, message)
    }
}

/// Codec for encoding/decoding multiplexer frames
#[derive(Debug, Default)]
pub struct FrameCodec {
    /// Header already consumed while waiting for its payload
    pending_header: Option<FrameHeader>,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let header = match self.pending_header.take() {
            Some(h) => h,
            None => match FrameHeader::decode(src)? {
                Some(h) => h,
                None => return Ok(None),
            },
        };

        let payload_len = header.payload_length as usize;
        if src.len() < payload_len {
            src.reserve(payload_len - src.len());
            self.pending_header = Some(header);
            return Ok(None);
        }

        let payload = src.split_to(payload_len);
        let message: Message = bincode::deserialize(&payload)?;

        if message.message_type() != header.message_type {
            return Err(ProtocolError::InvalidHeader);
        }

        Ok(Some(Frame::new(header.channel, message)))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = bincode::serialize(&frame.message)?;
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }

        FrameHeader::new(
            frame.channel,
            frame.message.message_type(),
            payload.len() as u32,
        )
        .encode(dst);
        dst.extend_from_slice(&payload);

        Ok(())
    }
}
