//! Frame encoding
//!
//! Commands travel as JSON text frames. Control frames (ping/pong/close) are
//! handled by the WebSocket layer and decode to `None`.

use serde::Serialize;
use serde::de::DeserializeOwned;
use tungstenite::protocol::Message as WsMessage;

use crate::message::{MessageMetadata, SingleMessage};
use courier_utils::checksum;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unexpected {0} frame")]
    UnexpectedFrame(&'static str),
}

/// Serialize a command into a text frame.
pub fn encode<T: Serialize>(command: &T) -> Result<WsMessage, CodecError> {
    Ok(WsMessage::text(serde_json::to_string(command)?))
}

/// Parse a frame. Control frames yield `Ok(None)`.
pub fn decode<T: DeserializeOwned>(frame: &WsMessage) -> Result<Option<T>, CodecError> {
    match frame {
        WsMessage::Text(text) => Ok(Some(serde_json::from_str(text.as_str())?)),
        WsMessage::Binary(bytes) => Ok(Some(serde_json::from_slice(bytes)?)),
        WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Close(_) => Ok(None),
        WsMessage::Frame(_) => Err(CodecError::UnexpectedFrame("raw")),
    }
}

/// CRC32 over the serialized metadata, resumed over the payload.
pub fn frame_checksum(metadata: &MessageMetadata, payload: &[u8]) -> Result<u32, CodecError> {
    let header = serde_json::to_vec(metadata)?;
    Ok(checksum::resume(checksum::compute(&header), payload))
}

/// Whether `expected` matches the checksum of the given frame contents.
pub fn verify_checksum(metadata: &MessageMetadata, payload: &[u8], expected: u32) -> bool {
    matches!(frame_checksum(metadata, payload), Ok(actual) if actual == expected)
}

/// Serialize batch members into one payload.
pub fn encode_batch(messages: &[SingleMessage]) -> Result<Vec<u8>, CodecError> {
    Ok(serde_json::to_vec(messages)?)
}

pub fn decode_batch(payload: &[u8]) -> Result<Vec<SingleMessage>, CodecError> {
    Ok(serde_json::from_slice(payload)?)
}
