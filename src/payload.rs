//! Ping payload codec
//!
//! The ping payload is the only binary format relayed between the two
//! transports: 24 bytes, three big-endian `u64` fields
//! `[timestamp_ns][sender_id][sequence_id]`.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Encoded size of a [`PingPayload`]
pub const PING_PAYLOAD_LEN: usize = 24;

/// Error decoding a ping payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadError {
    /// Payload is not exactly [`PING_PAYLOAD_LEN`] bytes
    InvalidLength(usize),
}

impl fmt::Display for PayloadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadError::InvalidLength(len) => write!(
                f,
                "ping payload must be {} bytes, got {}",
                PING_PAYLOAD_LEN, len
            ),
        }
    }
}

impl std::error::Error for PayloadError {}

/// Timestamped ping relayed between the broker and the local side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PingPayload {
    /// Nanoseconds since the Unix epoch at send time
    pub timestamp_ns: u64,
    /// Opaque identifier of the originating node or user
    pub sender_id: u64,
    /// Message identifier, 0 when not applicable
    pub sequence_id: u64,
}

impl PingPayload {
    pub fn new(timestamp_ns: u64, sender_id: u64, sequence_id: u64) -> Self {
        Self {
            timestamp_ns,
            sender_id,
            sequence_id,
        }
    }

    /// Build a payload stamped with the current time
    pub fn now(sender_id: u64, sequence_id: u64) -> Self {
        Self::new(now_ns(), sender_id, sequence_id)
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(PING_PAYLOAD_LEN);
        buf.put_u64(self.timestamp_ns);
        buf.put_u64(self.sender_id);
        buf.put_u64(self.sequence_id);
        buf.freeze()
    }

    pub fn decode(mut data: &[u8]) -> Result<Self, PayloadError> {
        if data.len() != PING_PAYLOAD_LEN {
            return Err(PayloadError::InvalidLength(data.len()));
        }
        Ok(Self {
            timestamp_ns: data.get_u64(),
            sender_id: data.get_u64(),
            sequence_id: data.get_u64(),
        })
    }

    /// Whole milliseconds between the send timestamp and `now_ns`.
    ///
    /// Clock skew between sender and receiver can put the timestamp in the
    /// future; the result saturates at zero in that case.
    pub fn latency_ms(&self, now_ns: u64) -> u64 {
        now_ns.saturating_sub(self.timestamp_ns) / 1_000_000
    }
}

/// Current wall clock time in nanoseconds since the Unix epoch
pub fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_wire_layout_is_big_endian() {
        let payload = PingPayload::new(1, 2, 0x0102_0304_0506_0708);
        let bytes = payload.encode();
        assert_eq!(bytes.len(), PING_PAYLOAD_LEN);
        assert_eq!(&bytes[..8], &[0, 0, 0, 0, 0, 0, 0, 1]);
        assert_eq!(&bytes[8..16], &[0, 0, 0, 0, 0, 0, 0, 2]);
        assert_eq!(&bytes[16..], &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_latency_scenario() {
        let payload = PingPayload::decode(&PingPayload::new(1_000_000_000, 42, 7).encode()).unwrap();
        assert_eq!(payload.sender_id, 42);
        assert_eq!(payload.sequence_id, 7);

        let now = now_ns();
        let latency = payload.latency_ms(now);
        assert_eq!(latency, (now - 1_000_000_000) / 1_000_000);
    }

    #[test]
    fn test_latency_saturates_for_future_timestamp() {
        let payload = PingPayload::new(5_000_000_000, 0, 0);
        assert_eq!(payload.latency_ms(1_000_000_000), 0);
        assert_eq!(payload.latency_ms(5_002_999_999), 2);
    }

    #[test]
    fn test_now_is_after_2020() {
        let payload = PingPayload::now(9, 0);
        assert!(payload.timestamp_ns > 1_577_836_800_000_000_000);
        assert_eq!(payload.sender_id, 9);
    }

    proptest! {
        #[test]
        fn prop_roundtrip(t in any::<u64>(), s in any::<u64>(), q in any::<u64>()) {
            let decoded = PingPayload::decode(&PingPayload::new(t, s, q).encode()).unwrap();
            prop_assert_eq!(decoded, PingPayload::new(t, s, q));
        }

        #[test]
        fn prop_wrong_length_fails(data in proptest::collection::vec(any::<u8>(), 0..64)) {
            prop_assume!(data.len() != PING_PAYLOAD_LEN);
            prop_assert_eq!(
                PingPayload::decode(&data),
                Err(PayloadError::InvalidLength(data.len()))
            );
        }
    }
}
