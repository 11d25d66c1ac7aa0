//! Channel identifier type

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier for one multiplexed channel, as numbered by the receiving side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelId(pub u32);

impl ChannelId {
    /// Create a new channel ID
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the raw ID value
    pub fn as_u32(&self) -> u32 {
        self.0
    }

    /// Special channel ID for connection-level (global) messages
    pub const CONTROL: ChannelId = ChannelId(0);

    /// Whether this addresses the connection rather than a channel
    pub fn is_control(&self) -> bool {
        *self == Self::CONTROL
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "channel-{}", self.0)
    }
}

impl From<u32> for ChannelId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_id_display() {
        let id = ChannelId::new(42);
        assert_eq!(format!("{}", id), "channel-42");
    }

    #[test]
    fn test_control_channel() {
        assert!(ChannelId::CONTROL.is_control());
        assert!(!ChannelId::new(1).is_control());
    }
}
