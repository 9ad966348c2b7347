//! Wire codec for kernel messages.
//!
//! Messages without buffers travel as JSON text frames. Messages with buffers
//! travel as one binary frame:
//!
//! ```text
//! ┌──────────┬───────────────────────┬────────────┬──────────┬─────┐
//! │ n (4B BE)│ n offsets (4B BE each)│ JSON bytes │ buffer 0 │ ... │
//! └──────────┴───────────────────────┴────────────┴──────────┴─────┘
//! ```
//!
//! `n` counts the JSON part plus every buffer. Offsets are absolute; the end of
//! the last part is the end of the frame.

use tokio_util::bytes::{BufMut, Bytes, BytesMut};

use super::message::ProtocolMessage;

/// Size of one header field (count or offset).
const FIELD_SIZE: usize = 4;

/// A transport payload: websocket text or binary frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Text(String),
    Binary(Bytes),
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Fewer than the two parts (json + one buffer) a binary frame requires.
    #[error("invalid incoming kernel message: {0} parts")]
    InvalidPartCount(u32),

    #[error("truncated frame header ({available} bytes, need {needed})")]
    Truncated { needed: usize, available: usize },

    #[error("invalid part offsets {offsets:?} for {len}-byte frame")]
    InvalidOffsets { offsets: Vec<usize>, len: usize },

    #[error("frame too large ({0} bytes)")]
    FrameTooLarge(usize),

    #[error("invalid utf-8 in message json: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("invalid message json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Serialize a message for the transport.
pub fn encode(msg: &ProtocolMessage) -> Result<Payload, CodecError> {
    if msg.buffers.is_empty() {
        let json = serde_json::to_string(msg)?;
        tracing::trace!(json_size_bytes = json.len(), "Encoding text frame");
        return Ok(Payload::Text(json));
    }
    encode_binary(msg).map(Payload::Binary)
}

/// Deserialize a transport payload into a message.
pub fn decode(payload: Payload) -> Result<ProtocolMessage, CodecError> {
    match payload {
        Payload::Text(text) => Ok(serde_json::from_str(&text)?),
        Payload::Binary(bytes) => decode_binary(bytes),
    }
}

fn encode_binary(msg: &ProtocolMessage) -> Result<Bytes, CodecError> {
    let json = serde_json::to_vec(msg)?;
    let parts = 1 + msg.buffers.len();
    let header_len = FIELD_SIZE * (parts + 1);
    let total = header_len
        + json.len()
        + msg.buffers.iter().map(|b| b.len()).sum::<usize>();
    if total > u32::MAX as usize {
        return Err(CodecError::FrameTooLarge(total));
    }

    tracing::trace!(
        json_size_bytes = json.len(),
        buffers = msg.buffers.len(),
        frame_size_bytes = total,
        "Encoding binary frame"
    );

    let mut dst = BytesMut::with_capacity(total);
    dst.put_u32(parts as u32);
    let mut offset = header_len;
    dst.put_u32(offset as u32);
    offset += json.len();
    // The final part's end is implicit, so only n offsets are written.
    for buffer in &msg.buffers[..msg.buffers.len() - 1] {
        dst.put_u32(offset as u32);
        offset += buffer.len();
    }
    dst.put_u32(offset as u32);

    dst.put_slice(&json);
    for buffer in &msg.buffers {
        dst.put_slice(buffer);
    }
    Ok(dst.freeze())
}

fn read_u32(buf: &[u8], at: usize) -> usize {
    let mut field = [0u8; FIELD_SIZE];
    field.copy_from_slice(&buf[at..at + FIELD_SIZE]);
    u32::from_be_bytes(field) as usize
}

fn decode_binary(buf: Bytes) -> Result<ProtocolMessage, CodecError> {
    if buf.len() < FIELD_SIZE {
        return Err(CodecError::Truncated {
            needed: FIELD_SIZE,
            available: buf.len(),
        });
    }

    let parts = read_u32(&buf, 0);
    if parts < 2 {
        return Err(CodecError::InvalidPartCount(parts as u32));
    }

    let header_len = parts
        .checked_add(1)
        .and_then(|n| n.checked_mul(FIELD_SIZE))
        .ok_or(CodecError::InvalidPartCount(parts as u32))?;
    if buf.len() < header_len {
        return Err(CodecError::Truncated {
            needed: header_len,
            available: buf.len(),
        });
    }

    let offsets: Vec<usize> = (1..=parts).map(|i| read_u32(&buf, i * FIELD_SIZE)).collect();
    let in_order = offsets.windows(2).all(|w| w[0] <= w[1]);
    let in_range = offsets[0] >= header_len && offsets[parts - 1] <= buf.len();
    if !in_order || !in_range {
        return Err(CodecError::InvalidOffsets {
            offsets,
            len: buf.len(),
        });
    }

    let json = std::str::from_utf8(&buf[offsets[0]..offsets[1]])?;
    let mut msg: ProtocolMessage = serde_json::from_str(json)?;

    msg.buffers = (1..parts)
        .map(|i| {
            let start = offsets[i];
            let stop = offsets.get(i + 1).copied().unwrap_or(buf.len());
            buf.slice(start..stop)
        })
        .collect();

    Ok(msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::message::{Channel, EXECUTE_REQUEST, Header};
    use serde_json::{Map, json};

    fn sample(buffers: Vec<Bytes>) -> ProtocolMessage {
        let mut content = Map::new();
        content.insert("code".into(), json!("1+1"));
        let mut metadata = Map::new();
        metadata.insert("trusted".into(), json!(true));
        ProtocolMessage::new(Channel::Shell, Header::new(EXECUTE_REQUEST, "u", "s"), content)
            .with_metadata(metadata)
            .with_parent(Header::new("comm_open", "u", "s"))
            .with_buffers(buffers)
    }

    fn raw_frame(parts: u32, offsets: &[u32], body: &[u8]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u32(parts);
        for offset in offsets {
            buf.put_u32(*offset);
        }
        buf.put_slice(body);
        buf.freeze()
    }

    #[test]
    fn message_without_buffers_encodes_as_text() {
        let msg = sample(Vec::new());
        let payload = encode(&msg).unwrap();
        let Payload::Text(text) = &payload else {
            panic!("expected text payload");
        };
        assert!(!text.contains("buffers"));

        let decoded = decode(payload).unwrap();
        assert_eq!(decoded, msg);
        assert!(decoded.buffers.is_empty());
    }

    #[test]
    fn binary_frame_roundtrips_every_buffer() {
        let buffers = vec![
            Bytes::from_static(b"\x00\x01\x02"),
            Bytes::new(),
            Bytes::from(vec![0xAB; 1024]),
        ];
        let msg = sample(buffers.clone());
        let payload = encode(&msg).unwrap();
        assert!(matches!(payload, Payload::Binary(_)));

        let decoded = decode(payload).unwrap();
        assert_eq!(decoded.header, msg.header);
        assert_eq!(decoded.parent_header, msg.parent_header);
        assert_eq!(decoded.content, msg.content);
        assert_eq!(decoded.metadata, msg.metadata);
        assert_eq!(decoded.channel, msg.channel);
        assert_eq!(decoded.buffers, buffers);
    }

    #[test]
    fn binary_header_layout() {
        let msg = sample(vec![Bytes::from_static(b"abc"), Bytes::from_static(b"de")]);
        let Payload::Binary(frame) = encode(&msg).unwrap() else {
            panic!("expected binary payload");
        };
        let json_len = serde_json::to_vec(&msg).unwrap().len();

        assert_eq!(read_u32(&frame, 0), 3);
        assert_eq!(read_u32(&frame, 4), 16);
        assert_eq!(read_u32(&frame, 8), 16 + json_len);
        assert_eq!(read_u32(&frame, 12), 16 + json_len + 3);
        assert_eq!(frame.len(), 16 + json_len + 5);
        assert_eq!(&frame[frame.len() - 5..], b"abcde");
    }

    #[test]
    fn rejects_fewer_than_two_parts() {
        for parts in [0u32, 1] {
            let frame = raw_frame(parts, &[8], b"{}");
            assert!(matches!(
                decode(Payload::Binary(frame)),
                Err(CodecError::InvalidPartCount(n)) if n == parts
            ));
        }
    }

    #[test]
    fn rejects_truncated_header() {
        let frame = raw_frame(3, &[16], b"");
        assert!(matches!(
            decode(Payload::Binary(frame)),
            Err(CodecError::Truncated { needed: 16, available: 8 })
        ));

        assert!(matches!(
            decode(Payload::Binary(Bytes::from_static(b"\x00\x00"))),
            Err(CodecError::Truncated { .. })
        ));
    }

    #[test]
    fn rejects_decreasing_offsets() {
        let frame = raw_frame(2, &[20, 12], b"{}{}{}{}{}");
        assert!(matches!(
            decode(Payload::Binary(frame)),
            Err(CodecError::InvalidOffsets { .. })
        ));
    }

    #[test]
    fn rejects_offsets_out_of_range() {
        let frame = raw_frame(2, &[12, 400], b"{}");
        assert!(matches!(
            decode(Payload::Binary(frame)),
            Err(CodecError::InvalidOffsets { .. })
        ));

        // json offset pointing into the header
        let frame = raw_frame(2, &[4, 12], b"{}");
        assert!(matches!(
            decode(Payload::Binary(frame)),
            Err(CodecError::InvalidOffsets { .. })
        ));
    }

    #[test]
    fn rejects_garbage_json() {
        assert!(matches!(
            decode(Payload::Text("not json".into())),
            Err(CodecError::Json(_))
        ));
        let frame = raw_frame(2, &[12, 14], b"\xff\xfexx");
        assert!(matches!(
            decode(Payload::Binary(frame)),
            Err(CodecError::Utf8(_))
        ));
    }
}
