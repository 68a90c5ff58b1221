//! Codec for the JSON frames pushed over the stream.
//!
//! Each stream frame carries one JSON-encoded [`Message`]. Malformed frames
//! are a protocol error the transport logs and drops; they are never fatal
//! to the connection.

use thiserror::Error;

use crate::message::Message;

/// Maximum accepted frame size (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// Frame contained no payload.
    #[error("Empty frame")]
    Empty,

    /// Frame was not valid JSON or did not match the message shape.
    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Decode a message from a JSON text frame.
///
/// # Errors
///
/// Returns an error if the frame is empty, too large, or not a valid
/// JSON-encoded message.
pub fn decode_message(frame: &str) -> Result<Message, ProtocolError> {
    let trimmed = frame.trim();
    if trimmed.is_empty() {
        return Err(ProtocolError::Empty);
    }
    if trimmed.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(trimmed.len()));
    }
    Ok(serde_json::from_str(trimmed)?)
}

/// Decode a message from a binary frame containing UTF-8 JSON.
///
/// # Errors
///
/// Returns an error if the frame is empty, too large, or malformed.
pub fn decode_message_bytes(frame: &[u8]) -> Result<Message, ProtocolError> {
    if frame.is_empty() {
        return Err(ProtocolError::Empty);
    }
    if frame.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(frame.len()));
    }
    Ok(serde_json::from_slice(frame)?)
}

/// Encode a message to a JSON text frame.
///
/// # Errors
///
/// Returns an error if serialization fails or the result is oversized.
pub fn encode_message(message: &Message) -> Result<String, ProtocolError> {
    let encoded = serde_json::to_string(message)?;
    if encoded.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(encoded.len()));
    }
    Ok(encoded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Priority;
    use serde_json::json;

    #[test]
    fn test_encode_decode_roundtrip() {
        let messages = vec![
            Message::new("broadcast").with_data(json!({"text": "hello"})),
            Message::new("topic_message")
                .with_topic("chat:lobby")
                .with_priority(Priority::Critical)
                .with_ttl(0),
            Message::new("pong"),
            Message::new("notification")
                .with_sender("srv")
                .with_metadata_entry("origin", json!("scheduler")),
        ];

        for message in messages {
            let encoded = encode_message(&message).unwrap();
            let decoded = decode_message(&encoded).unwrap();
            assert_eq!(message, decoded);
        }
    }

    #[test]
    fn test_decode_defaults() {
        // Only the discriminator is required on the wire.
        let decoded = decode_message(r#"{"type":"system"}"#).unwrap();
        assert_eq!(decoded.kind, "system");
        assert_eq!(decoded.priority, Priority::Normal);
        assert!(decoded.topic.is_none());
        assert!(decoded.ttl.is_none());
    }

    #[test]
    fn test_decode_malformed() {
        assert!(matches!(
            decode_message("not json at all"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(decode_message("  "), Err(ProtocolError::Empty)));
        assert!(matches!(
            decode_message_bytes(b"{\"type\""),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_frame_too_large() {
        let frame = format!(
            r#"{{"type":"broadcast","data":"{}"}}"#,
            "x".repeat(MAX_FRAME_SIZE)
        );
        assert!(matches!(
            decode_message(&frame),
            Err(ProtocolError::FrameTooLarge(_))
        ));
    }
}
