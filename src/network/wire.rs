//! Bincode envelope encoding.
//!
//! Transports are message framed, so a single envelope maps to a single
//! channel payload. Maximum envelope size: 4MB (prevents memory exhaustion
//! attacks).

use crate::constants::protocol::MAX_MESSAGE_SIZE;
use crate::error::WireError;
use crate::network::message::Message;

/// Serialize a Message into one channel payload
pub fn serialize_message(message: &Message) -> Result<Vec<u8>, WireError> {
    let payload = bincode::serialize(message).map_err(WireError::Encode)?;

    if payload.is_empty() {
        return Err(WireError::Empty);
    }
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(WireError::TooLarge {
            size: payload.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(payload)
}

/// Parse one channel payload into a Message
pub fn parse_message(bytes: &[u8]) -> Result<Message, WireError> {
    if bytes.is_empty() {
        return Err(WireError::Empty);
    }
    if bytes.len() > MAX_MESSAGE_SIZE {
        return Err(WireError::TooLarge {
            size: bytes.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    bincode::deserialize(bytes).map_err(WireError::Decode)
}
