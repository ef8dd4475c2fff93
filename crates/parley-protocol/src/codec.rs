//! Codecs for Parley events.
//!
//! Text frames carry JSON. Binary frames carry MessagePack behind a 4-byte
//! big-endian length prefix, so several events may share one buffer.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Maximum frame size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// Not enough data to decode frame.
    #[error("Incomplete frame: need {0} more bytes")]
    Incomplete(usize),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Wire encoding of a connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Encoding {
    /// JSON text frames.
    #[default]
    Json,
    /// Length-prefixed MessagePack binary frames.
    MessagePack,
}

/// An encoded frame, ready for a WebSocket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Encoded {
    /// A text frame.
    Text(String),
    /// A binary frame.
    Binary(Bytes),
}

impl Encoded {
    /// Encoded size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Encoded::Text(text) => text.len(),
            Encoded::Binary(data) => data.len(),
        }
    }

    /// Whether the frame is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Encode a value with the given encoding.
///
/// # Errors
///
/// Returns an error if serialization fails or the frame is too large.
pub fn encode_as<T: Serialize>(encoding: Encoding, value: &T) -> Result<Encoded, ProtocolError> {
    match encoding {
        Encoding::Json => encode_json(value).map(Encoded::Text),
        Encoding::MessagePack => encode(value).map(Encoded::Binary),
    }
}

/// Encode a value as JSON text.
///
/// # Errors
///
/// Returns an error if serialization fails or the frame is too large.
pub fn encode_json<T: Serialize>(value: &T) -> Result<String, ProtocolError> {
    let text = serde_json::to_string(value)?;
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }
    Ok(text)
}

/// Decode a value from JSON text.
///
/// # Errors
///
/// Returns an error if the text is too large or is not a valid event.
pub fn decode_json<T: DeserializeOwned>(text: &str) -> Result<T, ProtocolError> {
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }
    Ok(serde_json::from_str(text)?)
}

/// Encode a value to a length-prefixed MessagePack frame.
///
/// The encoded format is:
/// - 4 bytes: Big-endian length prefix
/// - N bytes: MessagePack-encoded value
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode<T: Serialize>(value: &T) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    encode_into(value, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode a value into an existing buffer.
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode_into<T: Serialize>(value: &T, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let payload = rmp_serde::to_vec_named(value)?;

    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }

    buf.reserve(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);

    Ok(())
}

/// Decode a value from a length-prefixed MessagePack frame.
///
/// # Errors
///
/// Returns an error if the data is incomplete, too large, or invalid.
pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T, ProtocolError> {
    if data.len() < LENGTH_PREFIX_SIZE {
        return Err(ProtocolError::Incomplete(LENGTH_PREFIX_SIZE - data.len()));
    }

    let length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }

    let total_size = LENGTH_PREFIX_SIZE + length;
    if data.len() < total_size {
        return Err(ProtocolError::Incomplete(total_size - data.len()));
    }

    Ok(rmp_serde::from_slice(&data[LENGTH_PREFIX_SIZE..total_size])?)
}

/// Try to decode a value from a buffer, advancing it if successful.
///
/// Returns `Ok(Some(value))` if a complete frame was decoded,
/// `Ok(None)` if more data is needed, or `Err` on protocol error.
///
/// # Errors
///
/// Returns an error if the frame is too large or invalid.
pub fn decode_from<T: DeserializeOwned>(buf: &mut BytesMut) -> Result<Option<T>, ProtocolError> {
    if buf.len() < LENGTH_PREFIX_SIZE {
        return Ok(None);
    }

    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }

    let total_size = LENGTH_PREFIX_SIZE + length;
    if buf.len() < total_size {
        return Ok(None);
    }

    buf.advance(LENGTH_PREFIX_SIZE);
    let payload = buf.split_to(length);
    Ok(Some(rmp_serde::from_slice(&payload)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ClientEvent, ServerEvent};
    use crate::types::ChatMessage;

    #[test]
    fn test_message_event_survives_both_encodings() {
        let message = ChatMessage::to_room("alice", "conn-1".into(), "general", "hi", 7)
            .with_id("m-1");
        let event = ServerEvent::MessageReceived { message };

        for encoding in [Encoding::Json, Encoding::MessagePack] {
            let decoded: ServerEvent = match encode_as(encoding, &event).unwrap() {
                Encoded::Text(text) => decode_json(&text).unwrap(),
                Encoded::Binary(data) => decode(&data).unwrap(),
            };
            assert_eq!(decoded, event);
        }
    }

    #[test]
    fn test_decode_incomplete() {
        let encoded = encode(&ClientEvent::join("alice")).unwrap();

        match decode::<ClientEvent>(&encoded[..5]) {
            Err(ProtocolError::Incomplete(_)) => {}
            other => panic!("Expected Incomplete error, got {:?}", other),
        }
    }

    #[test]
    fn test_oversized_length_prefix() {
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_SIZE + 1) as u32);

        match decode_from::<ClientEvent>(&mut buf) {
            Err(ProtocolError::FrameTooLarge(_)) => {}
            other => panic!("Expected FrameTooLarge error, got {:?}", other),
        }
    }

    #[test]
    fn test_streaming_decode() {
        let first = ClientEvent::join("alice");
        let second = ClientEvent::typing(true);

        let mut buf = BytesMut::new();
        encode_into(&first, &mut buf).unwrap();
        encode_into(&second, &mut buf).unwrap();

        // Feed a partial third frame to check it is left in the buffer.
        let partial = encode(&ClientEvent::send("later")).unwrap();
        buf.extend_from_slice(&partial[..3]);

        assert_eq!(decode_from::<ClientEvent>(&mut buf).unwrap(), Some(first));
        assert_eq!(decode_from::<ClientEvent>(&mut buf).unwrap(), Some(second));
        assert_eq!(decode_from::<ClientEvent>(&mut buf).unwrap(), None);
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn test_invalid_json_event() {
        assert!(matches!(
            decode_json::<ClientEvent>("{\"type\":\"join\"}"),
            Err(ProtocolError::Json(_))
        ));
    }
}
