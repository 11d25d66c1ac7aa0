//! Frame header encoding/decoding
//!
//! Every multiplexer message travels in one frame with an 8-byte header:
//! - recipient channel: 4 bytes (u32, big-endian, 0 addresses the connection)
//! - message type: 1 byte
//! - payload length: 3 bytes (u24, big-endian)

use bytes::{Buf, BufMut, BytesMut};

use crate::channel::ChannelId;
use crate::error::ProtocolError;
use crate::message::MessageType;

/// Size of the frame header in bytes
pub const HEADER_SIZE: usize = 8;

/// Largest payload the 24-bit length field can describe
pub const MAX_PAYLOAD_SIZE: usize = 0x00FF_FFFF;

/// Routing and length information preceding each payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub channel: ChannelId,
    pub message_type: MessageType,
    pub payload_length: u32,
}

impl FrameHeader {
    pub fn new(channel: ChannelId, message_type: MessageType, payload_length: u32) -> Self {
        Self {
            channel,
            message_type,
            payload_length,
        }
    }

    /// Write the header to `dst`
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_SIZE);
        dst.put_u32(self.channel.as_u32());
        dst.put_u8(self.message_type.as_u8());
        let len = self.payload_length & MAX_PAYLOAD_SIZE as u32;
        dst.put_slice(&len.to_be_bytes()[1..]);
    }

    /// Read a header from the front of `src`
    ///
    /// Nothing is consumed unless a full, valid header is present.
    pub fn decode(src: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let type_byte = src[4];
        let message_type = MessageType::from_u8(type_byte)
            .ok_or(ProtocolError::UnknownMessageType(type_byte))?;

        let channel = ChannelId::new(src.get_u32());
        src.advance(1);
        let mut len = [0u8; 4];
        src.copy_to_slice(&mut len[1..]);

        Ok(Some(Self {
            channel,
            message_type,
            payload_length: u32::from_be_bytes(len),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let header = FrameHeader::new(ChannelId::new(0x0102_0304), MessageType::ChannelData, 0x0A0B0C);
        let mut buf = BytesMut::new();
        header.encode(&mut buf);

        let expected = [0x01, 0x02, 0x03, 0x04, MessageType::ChannelData.as_u8(), 0x0A, 0x0B, 0x0C];
        assert_eq!(&buf[..], &expected[..]);

        let decoded = FrameHeader::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, header);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_short_buffer_is_untouched() {
        let mut buf = BytesMut::from(&[0u8, 0, 0, 7, 1][..]);
        assert!(FrameHeader::decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 5);
    }

    #[test]
    fn test_unknown_message_type() {
        let mut buf = BytesMut::from(&[0, 0, 0, 1, 0xEE, 0, 0, 10][..]);
        assert!(matches!(
            FrameHeader::decode(&mut buf),
            Err(ProtocolError::UnknownMessageType(0xEE))
        ));
    }
}
