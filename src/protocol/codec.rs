//! Protocol codec for encoding/decoding messages
//!
//! Frames are written into a fixed-capacity buffer and fail closed as soon
//! as the next field does not fit. Decoding never trusts the sender: every
//! read is bounds-checked against the region named by the size field.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::{
    value_tags, FullHeader, MessageHeader, MessageType, ReducedHeader, Update, Value,
    DOMAIN_FIELD_LEN, FULL_IDENTIFIER, ORIGINATOR_FIELD_LEN, REDUCED_IDENTIFIER,
};

/// Smallest possible record: key length(4) + empty key + tag(4) + size(4)
const MIN_RECORD_LEN: usize = 12;

/// Offset of the size field, directly after the identifier
const SIZE_OFFSET: usize = 8;

/// Codec errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Unrecognized message header")]
    InvalidHeader,

    #[error("Invalid message size: {size} (header: {header}, available: {available})")]
    InvalidSize {
        size: u64,
        header: usize,
        available: usize,
    },

    #[error("Unknown message type: {0}")]
    UnknownMessageType(u32),

    #[error("Unknown value type: {0}")]
    UnknownValueType(u32),

    #[error("Message truncated while reading {0}")]
    Truncated(&'static str),

    #[error("Invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("Buffer overflow: needed {needed} bytes, {remaining} remaining")]
    Overflow { needed: usize, remaining: usize },

    #[error("Field too long: {field} is {len} bytes (max: {max})")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },
}

pub type CodecResult<T> = Result<T, CodecError>;

/// Writes fields into a buffer that may never grow past `capacity`
pub struct FrameWriter {
    buf: BytesMut,
    capacity: usize,
}

impl FrameWriter {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Bytes still available before the capacity is reached
    pub fn remaining(&self) -> usize {
        self.capacity - self.buf.len()
    }

    fn reserve(&self, needed: usize) -> CodecResult<()> {
        if needed > self.remaining() {
            return Err(CodecError::Overflow {
                needed,
                remaining: self.remaining(),
            });
        }
        Ok(())
    }

    pub fn put_u8(&mut self, v: u8) -> CodecResult<()> {
        self.reserve(1)?;
        self.buf.put_u8(v);
        Ok(())
    }

    pub fn put_u32(&mut self, v: u32) -> CodecResult<()> {
        self.reserve(4)?;
        self.buf.put_u32(v);
        Ok(())
    }

    pub fn put_u64(&mut self, v: u64) -> CodecResult<()> {
        self.reserve(8)?;
        self.buf.put_u64(v);
        Ok(())
    }

    pub fn put_i64(&mut self, v: i64) -> CodecResult<()> {
        self.reserve(8)?;
        self.buf.put_i64(v);
        Ok(())
    }

    pub fn put_f64(&mut self, v: f64) -> CodecResult<()> {
        self.reserve(8)?;
        self.buf.put_f64(v);
        Ok(())
    }

    pub fn put_slice(&mut self, bytes: &[u8]) -> CodecResult<()> {
        self.reserve(bytes.len())?;
        self.buf.put_slice(bytes);
        Ok(())
    }

    /// Write a NUL-padded string of exactly `width` bytes. At least one NUL
    /// always terminates the field.
    pub fn put_fixed_str(&mut self, field: &'static str, s: &str, width: usize) -> CodecResult<()> {
        if s.len() >= width {
            return Err(CodecError::FieldTooLong {
                field,
                len: s.len(),
                max: width - 1,
            });
        }
        self.reserve(width)?;
        self.buf.put_slice(s.as_bytes());
        self.buf.put_bytes(0, width - s.len());
        Ok(())
    }

    /// Write a u32 length prefix followed by the bytes
    pub fn put_prefixed(&mut self, bytes: &[u8]) -> CodecResult<()> {
        self.reserve(4 + bytes.len())?;
        self.buf.put_u32(bytes.len() as u32);
        self.buf.put_slice(bytes);
        Ok(())
    }

    /// Overwrite the size field with the current frame length
    fn patch_size(&mut self) {
        let len = self.buf.len() as u64;
        self.buf[SIZE_OFFSET..SIZE_OFFSET + 8].copy_from_slice(&len.to_be_bytes());
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Write a header. The size field is written as zero and patched by `encode`.
pub fn encode_header(writer: &mut FrameWriter, header: &MessageHeader) -> CodecResult<()> {
    match header {
        MessageHeader::Full(h) => {
            writer.put_slice(&FULL_IDENTIFIER)?;
            writer.put_u64(0)?;
            writer.put_fixed_str("domain", &h.domain, DOMAIN_FIELD_LEN)?;
            writer.put_fixed_str("originator", &h.originator, ORIGINATOR_FIELD_LEN)?;
            writer.put_u32(h.message_type as u32)?;
            writer.put_u32(h.updates)?;
            writer.put_u32(h.quality)?;
            writer.put_u64(h.clock)?;
            writer.put_u64(h.timestamp)?;
            writer.put_u8(h.ttl)?;
        }
        MessageHeader::Reduced(h) => {
            writer.put_slice(&REDUCED_IDENTIFIER)?;
            writer.put_u64(0)?;
            writer.put_u32(h.updates)?;
            writer.put_u64(h.clock)?;
            writer.put_u8(h.ttl)?;
        }
    }
    Ok(())
}

/// Write one key/value record
pub fn encode_update(writer: &mut FrameWriter, update: &Update) -> CodecResult<()> {
    writer.put_prefixed(update.key.as_bytes())?;
    writer.put_u32(update.value.type_tag())?;
    writer.put_u32(update.value.wire_size())?;
    match &update.value {
        Value::Integer(i) => writer.put_i64(*i)?,
        Value::Double(d) => writer.put_f64(*d)?,
        Value::String(s) => writer.put_slice(s.as_bytes())?,
        Value::IntegerArray(values) => {
            for v in values {
                writer.put_i64(*v)?;
            }
        }
        Value::DoubleArray(values) => {
            for v in values {
                writer.put_f64(*v)?;
            }
        }
        Value::Binary(bytes) => writer.put_slice(bytes)?,
    }
    Ok(())
}

/// Encode a complete message into a frame of at most `capacity` bytes.
///
/// The header's update count is taken from `updates`.
pub fn encode(header: &MessageHeader, updates: &[Update], capacity: usize) -> CodecResult<Bytes> {
    let mut header = header.clone();
    header.set_updates(updates.len() as u32);

    let mut writer = FrameWriter::new(capacity);
    encode_header(&mut writer, &header)?;
    for update in updates {
        encode_update(&mut writer, update)?;
    }
    writer.patch_size();
    Ok(writer.finish())
}

fn need(buf: &&[u8], n: usize, what: &'static str) -> CodecResult<()> {
    if buf.remaining() < n {
        return Err(CodecError::Truncated(what));
    }
    Ok(())
}

fn take<'a>(buf: &mut &'a [u8], n: usize, what: &'static str) -> CodecResult<&'a [u8]> {
    need(buf, n, what)?;
    let (head, tail) = buf.split_at(n);
    *buf = tail;
    Ok(head)
}

fn read_fixed_str(buf: &mut &[u8], width: usize, what: &'static str) -> CodecResult<String> {
    let raw = take(buf, width, what)?;
    let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
    std::str::from_utf8(&raw[..end])
        .map(str::to_string)
        .map_err(|_| CodecError::InvalidUtf8(what))
}

/// Decode a message header.
///
/// Returns the header and the slice holding its update records, bounded by
/// the size field. Anything past the size field is ignored.
pub fn decode_header(buf: &[u8]) -> CodecResult<(MessageHeader, &[u8])> {
    if buf.len() < SIZE_OFFSET {
        return Err(CodecError::InvalidHeader);
    }

    let reduced = if buf[..SIZE_OFFSET] == REDUCED_IDENTIFIER {
        true
    } else if buf[..SIZE_OFFSET] == FULL_IDENTIFIER {
        false
    } else {
        return Err(CodecError::InvalidHeader);
    };

    let header_len = if reduced {
        ReducedHeader::ENCODED_LEN
    } else {
        FullHeader::ENCODED_LEN
    };
    if buf.len() < header_len {
        return Err(CodecError::Truncated("header"));
    }

    let mut cursor = &buf[SIZE_OFFSET..header_len];
    let size = cursor.get_u64();
    if size < header_len as u64 || size > buf.len() as u64 {
        return Err(CodecError::InvalidSize {
            size,
            header: header_len,
            available: buf.len(),
        });
    }

    let header = if reduced {
        let updates = cursor.get_u32();
        let clock = cursor.get_u64();
        let ttl = cursor.get_u8();
        MessageHeader::Reduced(ReducedHeader {
            updates,
            clock,
            ttl,
        })
    } else {
        let domain = read_fixed_str(&mut cursor, DOMAIN_FIELD_LEN, "domain")?;
        let originator = read_fixed_str(&mut cursor, ORIGINATOR_FIELD_LEN, "originator")?;
        let raw_type = cursor.get_u32();
        let message_type =
            MessageType::from_u32(raw_type).ok_or(CodecError::UnknownMessageType(raw_type))?;
        let updates = cursor.get_u32();
        let quality = cursor.get_u32();
        let clock = cursor.get_u64();
        let timestamp = cursor.get_u64();
        let ttl = cursor.get_u8();
        MessageHeader::Full(FullHeader {
            domain,
            originator,
            message_type,
            updates,
            quality,
            clock,
            timestamp,
            ttl,
        })
    };

    Ok((header, &buf[header_len..size as usize]))
}

fn decode_update(buf: &mut &[u8]) -> CodecResult<Update> {
    need(buf, 4, "key length")?;
    let key_len = buf.get_u32() as usize;
    let key = take(buf, key_len, "key")?;
    let key = std::str::from_utf8(key)
        .map_err(|_| CodecError::InvalidUtf8("key"))?
        .to_string();

    need(buf, 8, "value header")?;
    let tag = buf.get_u32();
    let size = buf.get_u32() as usize;

    let value = match tag {
        value_tags::INTEGER => {
            need(buf, 8, "integer")?;
            Value::Integer(buf.get_i64())
        }
        value_tags::DOUBLE => {
            need(buf, 8, "double")?;
            Value::Double(buf.get_f64())
        }
        value_tags::STRING => {
            let raw = take(buf, size, "string")?;
            let s = std::str::from_utf8(raw).map_err(|_| CodecError::InvalidUtf8("string"))?;
            Value::String(s.to_string())
        }
        value_tags::INTEGER_ARRAY => {
            need(buf, size.saturating_mul(8), "integer array")?;
            Value::IntegerArray((0..size).map(|_| buf.get_i64()).collect())
        }
        value_tags::DOUBLE_ARRAY => {
            need(buf, size.saturating_mul(8), "double array")?;
            Value::DoubleArray((0..size).map(|_| buf.get_f64()).collect())
        }
        value_tags::BINARY => Value::Binary(take(buf, size, "binary")?.to_vec()),
        other => return Err(CodecError::UnknownValueType(other)),
    };

    Ok(Update { key, value })
}

/// Decode exactly `count` records from the slice returned by `decode_header`
pub fn decode_updates(mut buf: &[u8], count: u32) -> CodecResult<Vec<Update>> {
    let mut updates = Vec::with_capacity((count as usize).min(buf.len() / MIN_RECORD_LEN));
    for _ in 0..count {
        updates.push(decode_update(&mut buf)?);
    }
    if !buf.is_empty() {
        tracing::trace!("Ignoring {} trailing bytes after {} updates", buf.len(), count);
    }
    Ok(updates)
}

/// Decode a complete message
pub fn decode(buf: &[u8]) -> CodecResult<(MessageHeader, Vec<Update>)> {
    let (header, body) = decode_header(buf)?;
    let updates = decode_updates(body, header.updates())?;
    Ok((header, updates))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_updates() -> Vec<Update> {
        vec![
            Update::new("drone.0.altitude", Value::Double(12.5)),
            Update::new("drone.0.id", Value::Integer(7)),
            Update::new("region.0.label", Value::String("north ridge".into())),
            Update::new("region.0.bounds", Value::IntegerArray(vec![40, -80, 41, -79])),
            Update::new("drone.0.gps", Value::DoubleArray(vec![40.44, -79.94])),
            Update::new("thermal.0.frame", Value::Binary(vec![0, 1, 2, 255])),
        ]
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let header = MessageHeader::full("swarm", "10.0.0.4:40000", 3, 42, 2);
        let updates = sample_updates();

        let frame = encode(&header, &updates, 4096).unwrap();
        let (decoded, decoded_updates) = decode(&frame).unwrap();

        match decoded {
            MessageHeader::Full(h) => {
                assert_eq!(h.domain, "swarm");
                assert_eq!(h.originator, "10.0.0.4:40000");
                assert_eq!(h.message_type, MessageType::MultiAssign);
                assert_eq!(h.updates, updates.len() as u32);
                assert_eq!(h.quality, 3);
                assert_eq!(h.clock, 42);
                assert_eq!(h.ttl, 2);
            }
            _ => panic!("Wrong header shape"),
        }
        assert_eq!(decoded_updates, updates);
    }

    #[test]
    fn test_reduced_roundtrip() {
        let header = MessageHeader::reduced(9);
        let updates = vec![Update::new("x", Value::Integer(5))];

        let frame = encode(&header, &updates, 256).unwrap();
        assert_eq!(frame.len(), ReducedHeader::ENCODED_LEN + updates[0].encoded_len());

        let (decoded, decoded_updates) = decode(&frame).unwrap();
        assert!(decoded.is_reduced());
        assert_eq!(decoded.clock(), 9);
        assert_eq!(decoded_updates, updates);
    }

    #[test]
    fn test_size_field_matches_frame() {
        let header = MessageHeader::full("swarm", "a:1", 0, 1, 0);
        let frame = encode(&header, &sample_updates(), 4096).unwrap();
        let size = u64::from_be_bytes(frame[8..16].try_into().unwrap());
        assert_eq!(size, frame.len() as u64);
    }

    #[test]
    fn test_overflow_fails_closed() {
        let header = MessageHeader::reduced(1);
        let updates = vec![Update::new("x", Value::String("a".repeat(100)))];

        let result = encode(&header, &updates, 64);
        assert!(matches!(result, Err(CodecError::Overflow { .. })));

        // The header alone does not fit either
        let result = encode(&MessageHeader::full("d", "o", 0, 0, 0), &[], 64);
        assert!(matches!(result, Err(CodecError::Overflow { .. })));
    }

    #[test]
    fn test_field_too_long() {
        let header = MessageHeader::full("d".repeat(DOMAIN_FIELD_LEN), "o", 0, 0, 0);
        let result = encode(&header, &[], 4096);
        assert!(matches!(result, Err(CodecError::FieldTooLong { field: "domain", .. })));
    }

    #[test]
    fn test_random_bytes_are_invalid() {
        let garbage: Vec<u8> = (0..200u32).map(|i| (i * 37 % 251) as u8).collect();
        assert_eq!(decode_header(&garbage).unwrap_err(), CodecError::InvalidHeader);
        assert_eq!(decode_header(&[]).unwrap_err(), CodecError::InvalidHeader);
        assert_eq!(decode_header(b"SWCA").unwrap_err(), CodecError::InvalidHeader);
    }

    #[test]
    fn test_other_version_is_rejected() {
        let header = MessageHeader::full("swarm", "a:1", 0, 1, 0);
        let mut frame = encode(&header, &[], 4096).unwrap().to_vec();
        frame[6] = b'2';
        assert_eq!(decode_header(&frame).unwrap_err(), CodecError::InvalidHeader);
    }

    #[test]
    fn test_size_larger_than_buffer() {
        let header = MessageHeader::reduced(1);
        let frame = encode(&header, &[Update::new("x", Value::Integer(1))], 256).unwrap();
        let cut = &frame[..frame.len() - 1];
        assert!(matches!(decode_header(cut), Err(CodecError::InvalidSize { .. })));
    }

    #[test]
    fn test_never_reads_past_size() {
        let header = MessageHeader::reduced(1);
        let updates = vec![Update::new("x", Value::Integer(1))];
        let mut frame = encode(&header, &updates, 256).unwrap().to_vec();
        frame.extend_from_slice(&[0xAB; 40]);

        let (_, body) = decode_header(&frame).unwrap();
        assert_eq!(body.len(), updates[0].encoded_len());
        assert_eq!(decode(&frame).unwrap().1, updates);
    }

    #[test]
    fn test_truncated_updates() {
        let header = MessageHeader::reduced(1);
        let updates = vec![
            Update::new("a", Value::Integer(1)),
            Update::new("b", Value::Integer(2)),
        ];
        let frame = encode(&header, &updates, 256).unwrap();
        let (_, body) = decode_header(&frame).unwrap();

        // Claim one more record than the body carries
        assert!(matches!(decode_updates(body, 3), Err(CodecError::Truncated(_))));
        // Cut the second record short
        assert!(matches!(
            decode_updates(&body[..body.len() - 3], 2),
            Err(CodecError::Truncated(_))
        ));
    }

    #[test]
    fn test_hostile_counts_do_not_allocate() {
        // A header claiming u32::MAX updates with an empty body
        let mut frame = encode(&MessageHeader::reduced(1), &[], 64).unwrap().to_vec();
        frame[16..20].copy_from_slice(&u32::MAX.to_be_bytes());
        assert!(matches!(decode(&frame), Err(CodecError::Truncated(_))));

        // An array record claiming u32::MAX elements
        let mut writer = FrameWriter::new(64);
        writer.put_prefixed(b"k").unwrap();
        writer.put_u32(value_tags::DOUBLE_ARRAY).unwrap();
        writer.put_u32(u32::MAX).unwrap();
        let body = writer.finish();
        assert!(matches!(decode_updates(&body, 1), Err(CodecError::Truncated(_))));
    }

    #[test]
    fn test_unknown_value_type() {
        let mut writer = FrameWriter::new(64);
        writer.put_prefixed(b"k").unwrap();
        writer.put_u32(99).unwrap();
        writer.put_u32(1).unwrap();
        let body = writer.finish();
        assert_eq!(
            decode_updates(&body, 1).unwrap_err(),
            CodecError::UnknownValueType(99)
        );
    }

    #[test]
    fn test_unknown_message_type() {
        let header = MessageHeader::full("swarm", "a:1", 0, 1, 0);
        let mut frame = encode(&header, &[], 256).unwrap().to_vec();
        let type_offset = 16 + DOMAIN_FIELD_LEN + ORIGINATOR_FIELD_LEN;
        frame[type_offset..type_offset + 4].copy_from_slice(&77u32.to_be_bytes());
        assert_eq!(
            decode_header(&frame).unwrap_err(),
            CodecError::UnknownMessageType(77)
        );
    }
}
