//! OSC 1.0 wire codec
//!
//! All numeric fields are big-endian. Strings are NUL terminated and, like
//! blobs, padded with zeros to a multiple of four bytes.

use bytes::{BufMut, BytesMut};

use super::{OscBundle, OscError, OscMessage, OscPacket, OscType};

const BUNDLE_TAG: &[u8; 8] = b"#bundle\0";

/// Nested bundles deeper than this are rejected
const MAX_BUNDLE_DEPTH: usize = 8;

#[inline]
fn padded_len(len: usize) -> usize {
    (len + 3) & !3
}

fn write_padded_str(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    // At least one NUL terminator
    let pad = padded_len(s.len() + 1) - s.len();
    buf.put_bytes(0, pad);
}

fn write_blob(buf: &mut BytesMut, data: &[u8]) -> Result<(), OscError> {
    let len = i32::try_from(data.len()).map_err(|_| OscError::TooLarge)?;
    buf.put_i32(len);
    buf.put_slice(data);
    buf.put_bytes(0, padded_len(data.len()) - data.len());
    Ok(())
}

/// Encode a packet, appending it to `buf`
pub fn encode_packet(packet: &OscPacket, buf: &mut BytesMut) -> Result<(), OscError> {
    match packet {
        OscPacket::Message(msg) => encode_message(msg, buf),
        OscPacket::Bundle(bundle) => {
            buf.put_slice(BUNDLE_TAG);
            buf.put_u64(bundle.timetag);
            for element in &bundle.content {
                let mut inner = BytesMut::new();
                encode_packet(element, &mut inner)?;
                let len = i32::try_from(inner.len()).map_err(|_| OscError::TooLarge)?;
                buf.put_i32(len);
                buf.put_slice(&inner);
            }
            Ok(())
        }
    }
}

fn encode_message(msg: &OscMessage, buf: &mut BytesMut) -> Result<(), OscError> {
    if !msg.address.starts_with('/') {
        return Err(OscError::InvalidAddress(msg.address.clone()));
    }
    write_padded_str(buf, &msg.address);

    let tags: String = std::iter::once(',')
        .chain(msg.args.iter().map(OscType::tag))
        .collect();
    write_padded_str(buf, &tags);

    for arg in &msg.args {
        match arg {
            OscType::Int(v) => buf.put_i32(*v),
            OscType::Float(v) => buf.put_f32(*v),
            OscType::String(s) => write_padded_str(buf, s),
            OscType::Blob(b) => write_blob(buf, b)?,
            OscType::Long(v) => buf.put_i64(*v),
            OscType::Double(v) => buf.put_f64(*v),
            OscType::Time(v) => buf.put_u64(*v),
            OscType::Bool(_) | OscType::Nil | OscType::Inf => {}
        }
    }
    Ok(())
}

/// Cursor over a datagram
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], OscError> {
        if self.remaining() < n {
            return Err(OscError::InsufficientData);
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], OscError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn padded_str(&mut self) -> Result<&'a str, OscError> {
        let rest = &self.buf[self.pos..];
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(OscError::InsufficientData)?;
        let s = std::str::from_utf8(&rest[..nul]).map_err(|_| OscError::InvalidUtf8)?;
        self.take(padded_len(nul + 1))?;
        Ok(s)
    }

    fn blob(&mut self) -> Result<&'a [u8], OscError> {
        let len = i32::from_be_bytes(self.array()?);
        let len = usize::try_from(len).map_err(|_| OscError::InsufficientData)?;
        let data = self.take(len)?;
        self.take(padded_len(len) - len)?;
        Ok(data)
    }
}

/// Decode one datagram
pub fn decode_packet(buf: &[u8]) -> Result<OscPacket, OscError> {
    decode_at_depth(buf, 0)
}

fn decode_at_depth(buf: &[u8], depth: usize) -> Result<OscPacket, OscError> {
    if buf.starts_with(BUNDLE_TAG) {
        if depth >= MAX_BUNDLE_DEPTH {
            return Err(OscError::MalformedBundle("nesting too deep"));
        }
        decode_bundle(buf, depth).map(OscPacket::Bundle)
    } else {
        decode_message(buf).map(OscPacket::Message)
    }
}

fn decode_bundle(buf: &[u8], depth: usize) -> Result<OscBundle, OscError> {
    let mut reader = Reader::new(buf);
    reader.take(BUNDLE_TAG.len())?;
    let timetag = u64::from_be_bytes(reader.array()?);

    let mut content = Vec::new();
    while reader.remaining() > 0 {
        let size = i32::from_be_bytes(reader.array()?);
        let size = usize::try_from(size)
            .map_err(|_| OscError::MalformedBundle("negative element size"))?;
        if size % 4 != 0 {
            return Err(OscError::MalformedBundle("element size not 4-byte aligned"));
        }
        let element = reader.take(size)?;
        content.push(decode_at_depth(element, depth + 1)?);
    }

    Ok(OscBundle { timetag, content })
}

fn decode_message(buf: &[u8]) -> Result<OscMessage, OscError> {
    let mut reader = Reader::new(buf);

    let address = reader.padded_str()?;
    if !address.starts_with('/') {
        return Err(OscError::InvalidAddress(address.to_string()));
    }

    // Some old senders omit the type tag string entirely
    if reader.remaining() == 0 {
        return Ok(OscMessage::new(address, Vec::new()));
    }
    let tags = reader.padded_str()?;
    let tags = tags.strip_prefix(',').ok_or(OscError::MissingTypeTags)?;

    let mut args = Vec::with_capacity(tags.len());
    for tag in tags.chars() {
        let arg = match tag {
            'i' => OscType::Int(i32::from_be_bytes(reader.array()?)),
            'f' => OscType::Float(f32::from_be_bytes(reader.array()?)),
            's' => OscType::String(reader.padded_str()?.to_string()),
            'b' => OscType::Blob(reader.blob()?.to_vec()),
            'h' => OscType::Long(i64::from_be_bytes(reader.array()?)),
            'd' => OscType::Double(f64::from_be_bytes(reader.array()?)),
            't' => OscType::Time(u64::from_be_bytes(reader.array()?)),
            'T' => OscType::Bool(true),
            'F' => OscType::Bool(false),
            'N' => OscType::Nil,
            'I' => OscType::Inf,
            other => return Err(OscError::UnsupportedType(other)),
        };
        args.push(arg);
    }

    Ok(OscMessage::new(address, args))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn encode(packet: &OscPacket) -> Vec<u8> {
        let mut buf = BytesMut::new();
        encode_packet(packet, &mut buf).unwrap();
        buf.to_vec()
    }

    #[test]
    fn test_bool_message_wire_format() {
        let msg = OscPacket::Message(OscMessage::new("/avatar/ping", vec![true.into()]));
        let bytes = encode(&msg);

        let mut expected = b"/avatar/ping\0\0\0\0".to_vec();
        expected.extend_from_slice(b",T\0\0");
        assert_eq!(bytes, expected);
        assert_eq!(decode_packet(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_mixed_arguments() {
        let msg = OscPacket::Message(OscMessage::new(
            "/a",
            vec![
                OscType::Int(-7),
                OscType::Float(0.5),
                OscType::String("hey".into()),
                OscType::Blob(vec![1, 2, 3, 4, 5]),
                OscType::Long(1 << 40),
                OscType::Double(2.25),
                OscType::Time(99),
                OscType::Bool(false),
                OscType::Nil,
                OscType::Inf,
            ],
        ));
        let bytes = encode(&msg);
        assert_eq!(bytes.len() % 4, 0);
        assert_eq!(decode_packet(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_nested_bundle_flattens_in_order() {
        let inner = OscPacket::Bundle(OscBundle {
            timetag: 1,
            content: vec![OscPacket::Message(OscMessage::new("/b", vec![false.into()]))],
        });
        let outer = OscPacket::Bundle(OscBundle {
            timetag: 1,
            content: vec![
                OscPacket::Message(OscMessage::new("/a", vec![true.into()])),
                inner,
            ],
        });

        let decoded = decode_packet(&encode(&outer)).unwrap();
        let messages = decoded.into_messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].address, "/a");
        assert_eq!(messages[1].address, "/b");
        assert_eq!(messages[1].args, vec![OscType::Bool(false)]);
    }

    #[test]
    fn test_message_without_type_tags() {
        let decoded = decode_packet(b"/ping\0\0\0").unwrap();
        assert_eq!(decoded, OscPacket::Message(OscMessage::new("/ping", vec![])));
    }

    #[test]
    fn test_rejects_bad_address() {
        let mut buf = BytesMut::new();
        let err = encode_packet(
            &OscPacket::Message(OscMessage::new("avatar", vec![])),
            &mut buf,
        )
        .unwrap_err();
        assert_eq!(err, OscError::InvalidAddress("avatar".to_string()));

        assert!(matches!(
            decode_packet(b"nope\0\0\0\0,\0\0\0"),
            Err(OscError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_rejects_truncated_and_unknown() {
        assert_eq!(
            decode_packet(b"/a\0\0,i\0\0\0\0"),
            Err(OscError::InsufficientData)
        );
        assert_eq!(
            decode_packet(b"/a\0\0,x\0\0"),
            Err(OscError::UnsupportedType('x'))
        );
        assert_eq!(
            decode_packet(b"/a\0\0i\0\0\0"),
            Err(OscError::MissingTypeTags)
        );
    }

    #[test]
    fn test_bundle_rejects_unaligned_element() {
        let mut buf = BytesMut::new();
        buf.put_slice(BUNDLE_TAG);
        buf.put_u64(1);
        buf.put_i32(3);
        buf.put_slice(b"/a\0");
        assert!(matches!(
            decode_packet(&buf),
            Err(OscError::MalformedBundle(_))
        ));
    }
}
