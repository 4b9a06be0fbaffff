//! MQTT Protocol definitions and types
//!
//! Defines the MQTT v3.1.1 packet types used by the broker connection.

mod error;
mod packet;
mod return_code;

pub use error::{DecodeError, EncodeError};
pub use packet::*;
pub use return_code::ConnectReturnCode;

/// Protocol level sent in CONNECT (MQTT v3.1.1)
pub const PROTOCOL_LEVEL: u8 = 4;

/// Quality of Service levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum QoS {
    /// At most once delivery
    #[default]
    AtMostOnce = 0,
    /// At least once delivery
    AtLeastOnce = 1,
    /// Exactly once delivery
    ExactlyOnce = 2,
}

impl QoS {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(QoS::AtMostOnce),
            1 => Some(QoS::AtLeastOnce),
            2 => Some(QoS::ExactlyOnce),
            _ => None,
        }
    }
}
