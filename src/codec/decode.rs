//! MQTT Packet Decoder

use bytes::Bytes;

use super::{read_binary, read_string, read_u16, read_variable_int, MAX_REMAINING_LENGTH};
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, DecodeError, Packet, PacketId, Publish, QoS, SubAck,
    Subscribe, Subscription, PROTOCOL_LEVEL,
};

/// MQTT v3.1.1 Packet Decoder
pub struct Decoder {
    /// Maximum packet size
    max_packet_size: usize,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            max_packet_size: MAX_REMAINING_LENGTH,
        }
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size.min(MAX_REMAINING_LENGTH);
        self
    }

    /// Decode a packet from the buffer
    /// Returns (packet, bytes_consumed), or `None` when the buffer holds
    /// only part of a packet
    pub fn decode(&self, buf: &[u8]) -> Result<Option<(Packet, usize)>, DecodeError> {
        if buf.len() < 2 {
            return Ok(None);
        }

        let first_byte = buf[0];
        let packet_type = first_byte >> 4;
        let flags = first_byte & 0x0F;

        let (remaining_length, len_bytes) = match read_variable_int(&buf[1..]) {
            Ok(r) => r,
            Err(DecodeError::InsufficientData) => return Ok(None),
            Err(e) => return Err(e),
        };

        if remaining_length as usize > self.max_packet_size {
            return Err(DecodeError::PacketTooLarge);
        }

        let total_len = 1 + len_bytes + remaining_length as usize;
        if buf.len() < total_len {
            return Ok(None);
        }

        let body = &buf[1 + len_bytes..total_len];

        let packet = match packet_type {
            1 => self.decode_connect(flags, body)?,
            2 => self.decode_connack(flags, body)?,
            3 => self.decode_publish(flags, body)?,
            4 => Packet::PubAck(self.decode_ack(flags, 0, body)?),
            5 => Packet::PubRec(self.decode_ack(flags, 0, body)?),
            6 => Packet::PubRel(self.decode_ack(flags, 2, body)?),
            7 => Packet::PubComp(self.decode_ack(flags, 0, body)?),
            8 => self.decode_subscribe(flags, body)?,
            9 => self.decode_suback(flags, body)?,
            12 | 13 | 14 => {
                if flags != 0 {
                    return Err(DecodeError::InvalidFlags);
                }
                if !body.is_empty() {
                    return Err(DecodeError::MalformedPacket("unexpected payload"));
                }
                match packet_type {
                    12 => Packet::PingReq,
                    13 => Packet::PingResp,
                    _ => Packet::Disconnect,
                }
            }
            _ => return Err(DecodeError::InvalidPacketType(packet_type)),
        };

        Ok(Some((packet, total_len)))
    }

    fn decode_connect(&self, flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
        if flags != 0 {
            return Err(DecodeError::InvalidFlags);
        }
        let mut pos = 0;

        let (protocol_name, len) = read_string(body)?;
        pos += len;
        if protocol_name != "MQTT" {
            return Err(DecodeError::InvalidProtocolName);
        }

        let level = *body.get(pos).ok_or(DecodeError::InsufficientData)?;
        pos += 1;
        if level != PROTOCOL_LEVEL {
            return Err(DecodeError::InvalidProtocolVersion(level));
        }

        let connect_flags = *body.get(pos).ok_or(DecodeError::InsufficientData)?;
        pos += 1;
        if (connect_flags & 0x01) != 0 {
            return Err(DecodeError::InvalidFlags);
        }
        // Will messages are never sent by this client
        if (connect_flags & 0x04) != 0 {
            return Err(DecodeError::MalformedPacket("will message not supported"));
        }
        let clean_session = (connect_flags & 0x02) != 0;
        let password_flag = (connect_flags & 0x40) != 0;
        let username_flag = (connect_flags & 0x80) != 0;
        if !username_flag && password_flag {
            return Err(DecodeError::InvalidFlags);
        }

        let keep_alive = read_u16(&body[pos..])?;
        pos += 2;

        let (client_id, len) = read_string(&body[pos..])?;
        pos += len;

        let username = if username_flag {
            let (username, len) = read_string(&body[pos..])?;
            pos += len;
            Some(username.to_string())
        } else {
            None
        };

        let password = if password_flag {
            let (password, len) = read_binary(&body[pos..])?;
            pos += len;
            Some(Bytes::copy_from_slice(password))
        } else {
            None
        };

        if pos != body.len() {
            return Err(DecodeError::MalformedPacket("trailing bytes in CONNECT"));
        }

        Ok(Packet::Connect(Box::new(Connect {
            client_id: client_id.to_string(),
            clean_session,
            keep_alive,
            username,
            password,
        })))
    }

    fn decode_connack(&self, flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
        if flags != 0 {
            return Err(DecodeError::InvalidFlags);
        }
        let [ack_flags, code] = body else {
            return Err(DecodeError::MalformedPacket("CONNACK must be 2 bytes"));
        };
        if ack_flags & 0xFE != 0 {
            return Err(DecodeError::InvalidFlags);
        }
        let return_code =
            ConnectReturnCode::from_u8(*code).ok_or(DecodeError::InvalidReturnCode(*code))?;

        Ok(Packet::ConnAck(ConnAck {
            session_present: ack_flags & 0x01 != 0,
            return_code,
        }))
    }

    fn decode_publish(&self, flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
        let dup = (flags & 0x08) != 0;
        let qos_bits = (flags >> 1) & 0x03;
        let qos = QoS::from_u8(qos_bits).ok_or(DecodeError::InvalidQoS(qos_bits))?;
        let retain = (flags & 0x01) != 0;

        let (topic, mut pos) = read_string(body)?;
        if topic.contains(['+', '#']) {
            return Err(DecodeError::MalformedPacket("wildcard in topic name"));
        }

        let packet_id = if qos != QoS::AtMostOnce {
            let id = read_u16(&body[pos..])?;
            pos += 2;
            if id == 0 {
                return Err(DecodeError::MalformedPacket("packet identifier is zero"));
            }
            Some(id)
        } else {
            None
        };

        Ok(Packet::Publish(Publish {
            dup,
            qos,
            retain,
            topic: topic.to_string(),
            packet_id,
            payload: Bytes::copy_from_slice(&body[pos..]),
        }))
    }

    fn decode_ack(&self, flags: u8, expected: u8, body: &[u8]) -> Result<PacketId, DecodeError> {
        if flags != expected {
            return Err(DecodeError::InvalidFlags);
        }
        if body.len() != 2 {
            return Err(DecodeError::MalformedPacket("acknowledgement must be 2 bytes"));
        }
        Ok(PacketId(read_u16(body)?))
    }

    fn decode_subscribe(&self, flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
        if flags != 0x02 {
            return Err(DecodeError::InvalidFlags);
        }
        let packet_id = read_u16(body)?;
        let mut pos = 2;
        let mut subscriptions = Vec::new();

        while pos < body.len() {
            let (filter, len) = read_string(&body[pos..])?;
            pos += len;
            let qos_byte = *body.get(pos).ok_or(DecodeError::InsufficientData)?;
            pos += 1;
            let qos = QoS::from_u8(qos_byte).ok_or(DecodeError::InvalidQoS(qos_byte))?;
            subscriptions.push(Subscription {
                filter: filter.to_string(),
                qos,
            });
        }

        if subscriptions.is_empty() {
            return Err(DecodeError::MalformedPacket("SUBSCRIBE without filters"));
        }

        Ok(Packet::Subscribe(Subscribe {
            packet_id,
            subscriptions,
        }))
    }

    fn decode_suback(&self, flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
        if flags != 0 {
            return Err(DecodeError::InvalidFlags);
        }
        let packet_id = read_u16(body)?;
        let return_codes = body[2..]
            .iter()
            .map(|&code| match code {
                0x80 => Ok(None),
                other => QoS::from_u8(other)
                    .map(Some)
                    .ok_or(DecodeError::InvalidQoS(other)),
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Packet::SubAck(SubAck {
            packet_id,
            return_codes,
        }))
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}
