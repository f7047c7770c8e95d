//! Wire serialization for [`Message`]. Every length field is an
//! unsigned LEB128 varint; this repository picks LEB128 because it is
//! the one length-prefix scheme the distilled specification left open
//! and the rest of the on-disk format (frame-then-base64) otherwise
//! composes cleanly with it.
//!
//! Layout: `payload_len(varint) payload_bytes
//! metadata_count(varint) (key_len(varint) key_bytes value_len(varint)
//! value_bytes)* stream_id(varint)`.
//!
//! The stream name is not carried on the wire, matching the upstream
//! system's own treatment of stream identity as a numeric id; on
//! deserialization the origin's name is left empty and only the id is
//! restored.

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::message::{Message, StreamId};

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("unexpected end of input while decoding {0}")]
    Truncated(&'static str),
    #[error("metadata key is not valid utf-8")]
    InvalidKey,
}

fn put_varint(buf: &mut BytesMut, mut value: u64) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if value == 0 {
            break;
        }
    }
}

fn get_varint(buf: &mut Bytes, field: &'static str) -> Result<u64, WireError> {
    let mut result: u64 = 0;
    let mut shift = 0u32;
    loop {
        if !buf.has_remaining() {
            return Err(WireError::Truncated(field));
        }
        let byte = buf.get_u8();
        result |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok(result);
        }
        shift += 7;
    }
}

fn take_bytes(buf: &mut Bytes, len: usize, field: &'static str) -> Result<Bytes, WireError> {
    if buf.remaining() < len {
        return Err(WireError::Truncated(field));
    }
    Ok(buf.split_to(len))
}

pub fn serialize(msg: &Message) -> Bytes {
    let mut out = BytesMut::new();

    put_varint(&mut out, msg.payload().len() as u64);
    out.extend_from_slice(msg.payload());

    put_varint(&mut out, msg.metadata().len() as u64);
    for (key, value) in msg.metadata() {
        put_varint(&mut out, key.len() as u64);
        out.extend_from_slice(key.as_bytes());
        put_varint(&mut out, value.len() as u64);
        out.extend_from_slice(value);
    }

    put_varint(&mut out, msg.origin().id());

    out.freeze()
}

pub fn deserialize(data: Bytes) -> Result<Message, WireError> {
    let mut buf = data;

    let payload_len = get_varint(&mut buf, "payload length")? as usize;
    let payload = take_bytes(&mut buf, payload_len, "payload")?;

    let metadata_count = get_varint(&mut buf, "metadata count")?;
    let mut metadata = BTreeMap::new();
    for _ in 0..metadata_count {
        let key_len = get_varint(&mut buf, "metadata key length")? as usize;
        let key_bytes = take_bytes(&mut buf, key_len, "metadata key")?;
        let key = String::from_utf8(key_bytes.to_vec()).map_err(|_| WireError::InvalidKey)?;
        let value_len = get_varint(&mut buf, "metadata value length")? as usize;
        let value = take_bytes(&mut buf, value_len, "metadata value")?;
        metadata.insert(key, value);
    }

    let stream_id = get_varint(&mut buf, "stream id")?;

    Ok(Message::with_metadata(
        payload,
        metadata,
        StreamId::new("", stream_id),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_payload_metadata_and_stream_id() {
        let mut metadata = BTreeMap::new();
        metadata.insert("foo".to_string(), Bytes::from_static(b"bar"));
        let msg = Message::with_metadata(
            Bytes::from_static(b"hello world"),
            metadata,
            StreamId::new("orders", 42),
        );

        let wire = serialize(&msg);
        let decoded = deserialize(wire).unwrap();

        assert_eq!(decoded.payload(), msg.payload());
        assert_eq!(decoded.metadata(), msg.metadata());
        assert_eq!(decoded.origin().id(), msg.origin().id());
    }

    #[test]
    fn empty_metadata_round_trips() {
        let msg = Message::new(Bytes::from_static(b""), StreamId::new("s", 7));
        let decoded = deserialize(serialize(&msg)).unwrap();
        assert_eq!(decoded.payload(), msg.payload());
        assert!(decoded.metadata().is_empty());
    }

    #[test]
    fn truncated_input_is_an_error() {
        let msg = Message::new(Bytes::from_static(b"hi"), StreamId::new("s", 1));
        let mut wire = serialize(&msg).to_vec();
        wire.truncate(wire.len() - 1);
        assert!(deserialize(Bytes::from(wire)).is_err());
    }
}
