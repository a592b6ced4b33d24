//! Binary framing for topic-addressed messages.
//!
//! Wire format:
//! ```text
//! [version:1][topic_len:1][reserved:2][payload_len:4][topic:topic_len][payload:payload_len]
//! ```
//! Header size: 8 bytes.  `payload_len` is big-endian.  The topic is UTF-8.
//!
//! The payload itself is a bincode-encoded value; [`encode_payload`] and
//! [`decode_payload`] wrap that step so the transport never touches bincode
//! directly.
//!
//! # Why frame at all?
//!
//! TCP is a byte stream: one `write` on the publisher side can arrive as two
//! `read`s on the subscriber side, or two writes as one read.  The fixed-size
//! header tells the reader exactly how many more bytes belong to the current
//! message, so it can cut the stream back into messages.

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

use crate::domain::gaze::PositionError;
use crate::protocol::messages::{
    FRAME_HEADER_SIZE, MAX_PAYLOAD_LEN, MAX_TOPIC_LEN, PROTOCOL_VERSION,
};

/// Errors that can occur while encoding or decoding frames and payloads.
#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    /// The byte slice is shorter than the minimum required length.
    #[error("insufficient data: need at least {needed} bytes, got {available}")]
    InsufficientData { needed: usize, available: usize },

    /// The version byte in the header is not supported.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// The topic does not fit in the one-byte length field.
    #[error("topic too long: {0} bytes (max {max})", max = MAX_TOPIC_LEN)]
    TopicTooLong(usize),

    /// The topic bytes are not valid UTF-8.
    #[error("topic is not valid UTF-8")]
    InvalidTopic,

    /// The payload exceeds [`MAX_PAYLOAD_LEN`].
    #[error("payload too large: {0} bytes (max {max})", max = MAX_PAYLOAD_LEN)]
    PayloadTooLarge(usize),

    /// The payload could not be (de)serialized.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// A gaze message lacks the `:` between sender id and coordinates.
    #[error("missing ':' separator in {0:?}")]
    MissingSeparator(String),

    /// A gaze message has an empty sender id.
    #[error("empty sender id")]
    EmptySenderId,

    /// A gaze message carries the wrong number of coordinate fields.
    #[error("expected {expected} coordinate fields, found {found}")]
    WrongFieldCount { expected: usize, found: usize },

    /// A coordinate field is not a number.
    #[error("invalid coordinate {0:?}")]
    InvalidCoordinate(String),

    /// The coordinates are numbers but not a valid gaze position.
    #[error(transparent)]
    Position(#[from] PositionError),

    /// A heartbeat payload is not `"<address>:<port>"`.
    #[error("invalid heartbeat payload {0:?}")]
    InvalidHeartbeat(String),
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Lengths announced by a frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub topic_len: usize,
    pub payload_len: usize,
}

impl FrameHeader {
    /// Number of bytes following the header.
    pub fn body_len(&self) -> usize {
        self.topic_len + self.payload_len
    }
}

// ── Frames ────────────────────────────────────────────────────────────────────

/// Encodes `topic` and an already-serialized `payload` into one frame.
///
/// # Errors
///
/// Returns [`ProtocolError::TopicTooLong`] or [`ProtocolError::PayloadTooLarge`]
/// when a length does not fit the header.
///
/// # Examples
///
/// ```rust
/// use wayl_core::protocol::codec::{decode_frame, encode_frame};
///
/// let bytes = encode_frame("gaze_exchange", b"abc").unwrap();
/// let (frame, consumed) = decode_frame(&bytes).unwrap();
/// assert_eq!(frame.topic, "gaze_exchange");
/// assert_eq!(consumed, bytes.len());
/// ```
pub fn encode_frame(topic: &str, payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let topic_bytes = topic.as_bytes();
    if topic_bytes.len() > MAX_TOPIC_LEN {
        return Err(ProtocolError::TopicTooLong(topic_bytes.len()));
    }
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(ProtocolError::PayloadTooLarge(payload.len()));
    }

    let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + topic_bytes.len() + payload.len());
    buf.push(PROTOCOL_VERSION);
    buf.push(topic_bytes.len() as u8);
    buf.push(0x00); // reserved
    buf.push(0x00); // reserved
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(topic_bytes);
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Parses the fixed-size header at the start of `bytes`.
///
/// Stream readers call this on the first [`FRAME_HEADER_SIZE`] bytes to learn
/// how much more to read.
///
/// # Errors
///
/// Returns [`ProtocolError`] for short input, an unknown version or an
/// oversized payload.
pub fn decode_frame_header(bytes: &[u8]) -> Result<FrameHeader, ProtocolError> {
    if bytes.len() < FRAME_HEADER_SIZE {
        return Err(ProtocolError::InsufficientData {
            needed: FRAME_HEADER_SIZE,
            available: bytes.len(),
        });
    }
    if bytes[0] != PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion(bytes[0]));
    }

    let topic_len = bytes[1] as usize;
    // bytes[2..4] are reserved – ignored on decode
    let payload_len = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
    if payload_len > MAX_PAYLOAD_LEN {
        return Err(ProtocolError::PayloadTooLarge(payload_len));
    }
    Ok(FrameHeader {
        topic_len,
        payload_len,
    })
}

/// Decodes one frame from the beginning of `bytes`.
///
/// Returns the frame and the number of bytes consumed.
///
/// # Errors
///
/// Returns [`ProtocolError`] if the bytes are truncated or malformed.
pub fn decode_frame(bytes: &[u8]) -> Result<(Frame, usize), ProtocolError> {
    let header = decode_frame_header(bytes)?;
    let total = FRAME_HEADER_SIZE + header.body_len();
    if bytes.len() < total {
        return Err(ProtocolError::InsufficientData {
            needed: total,
            available: bytes.len(),
        });
    }
    let frame = decode_frame_body(header, &bytes[FRAME_HEADER_SIZE..total])?;
    Ok((frame, total))
}

/// Splits a frame body (everything after the header) into topic and payload.
///
/// # Errors
///
/// Returns [`ProtocolError::InsufficientData`] if `body` is shorter than the
/// header announced, or [`ProtocolError::InvalidTopic`] for non-UTF-8 topics.
pub fn decode_frame_body(header: FrameHeader, body: &[u8]) -> Result<Frame, ProtocolError> {
    if body.len() < header.body_len() {
        return Err(ProtocolError::InsufficientData {
            needed: header.body_len(),
            available: body.len(),
        });
    }
    let topic = std::str::from_utf8(&body[..header.topic_len])
        .map_err(|_| ProtocolError::InvalidTopic)?
        .to_string();
    let payload = body[header.topic_len..header.body_len()].to_vec();
    Ok(Frame { topic, payload })
}

// ── Payloads ──────────────────────────────────────────────────────────────────

/// Serializes a payload value with bincode.
///
/// # Errors
///
/// Returns [`ProtocolError::MalformedPayload`] if serialization fails.
pub fn encode_payload<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serialize(value).map_err(|e| ProtocolError::MalformedPayload(e.to_string()))
}

/// Deserializes a bincode payload.
///
/// # Errors
///
/// Returns [`ProtocolError::MalformedPayload`] if the bytes do not describe a `T`.
pub fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    bincode::deserialize(bytes).map_err(|e| ProtocolError::MalformedPayload(e.to_string()))
}

/// Decodes a frame payload that carries a text message.
///
/// # Errors
///
/// Returns [`ProtocolError::MalformedPayload`] if the payload is not a string.
pub fn decode_text_payload(bytes: &[u8]) -> Result<String, ProtocolError> {
    decode_payload::<String>(bytes)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_frame_writes_header_fields() {
        // Arrange / Act
        let bytes = encode_frame("gaze", &[1, 2, 3]).unwrap();

        // Assert
        assert_eq!(bytes[0], PROTOCOL_VERSION);
        assert_eq!(bytes[1], 4, "topic length");
        assert_eq!(&bytes[4..8], &3u32.to_be_bytes());
        assert_eq!(&bytes[8..12], b"gaze");
        assert_eq!(&bytes[12..], &[1, 2, 3]);
    }

    #[test]
    fn test_decode_frame_reports_bytes_consumed_with_trailing_data() {
        // Arrange: two frames back to back
        let mut bytes = encode_frame("a", b"xy").unwrap();
        let first_len = bytes.len();
        bytes.extend(encode_frame("b", b"z").unwrap());

        // Act
        let (frame, consumed) = decode_frame(&bytes).unwrap();

        // Assert
        assert_eq!(frame.topic, "a");
        assert_eq!(frame.payload, b"xy");
        assert_eq!(consumed, first_len);
    }

    #[test]
    fn test_decode_frame_rejects_truncated_body() {
        let bytes = encode_frame("gaze", b"payload").unwrap();
        let result = decode_frame(&bytes[..bytes.len() - 2]);
        assert!(matches!(result, Err(ProtocolError::InsufficientData { .. })));
    }

    #[test]
    fn test_decode_frame_header_rejects_short_input() {
        let result = decode_frame_header(&[PROTOCOL_VERSION, 0, 0]);
        assert_eq!(
            result,
            Err(ProtocolError::InsufficientData {
                needed: FRAME_HEADER_SIZE,
                available: 3
            })
        );
    }

    #[test]
    fn test_decode_frame_header_rejects_unknown_version() {
        let mut bytes = encode_frame("gaze", b"").unwrap();
        bytes[0] = 0x7F;
        assert_eq!(decode_frame_header(&bytes), Err(ProtocolError::UnsupportedVersion(0x7F)));
    }

    #[test]
    fn test_decode_frame_header_rejects_oversized_payload_claim() {
        let mut bytes = encode_frame("gaze", b"").unwrap();
        bytes[4..8].copy_from_slice(&u32::MAX.to_be_bytes());
        assert!(matches!(
            decode_frame_header(&bytes),
            Err(ProtocolError::PayloadTooLarge(_))
        ));
    }

    #[test]
    fn test_encode_frame_rejects_long_topic() {
        let topic = "t".repeat(MAX_TOPIC_LEN + 1);
        assert_eq!(
            encode_frame(&topic, b""),
            Err(ProtocolError::TopicTooLong(MAX_TOPIC_LEN + 1))
        );
    }

    #[test]
    fn test_decode_frame_body_rejects_invalid_utf8_topic() {
        let header = FrameHeader {
            topic_len: 2,
            payload_len: 0,
        };
        assert_eq!(decode_frame_body(header, &[0xFF, 0xFE]), Err(ProtocolError::InvalidTopic));
    }

    #[test]
    fn test_text_payload_survives_encoding() {
        let bytes = encode_payload("peer7:0.1,0.2").unwrap();
        assert_eq!(decode_text_payload(&bytes).unwrap(), "peer7:0.1,0.2");
    }

    #[test]
    fn test_decode_text_payload_rejects_garbage() {
        // A bincode string starts with a u64 length; this one claims far more
        // bytes than are present.
        let result = decode_text_payload(&[0xFF; 8]);
        assert!(matches!(result, Err(ProtocolError::MalformedPayload(_))));
    }
}
