//! courier_transport
//!
//! The wire protocol spoken between the client library and the broker:
//! tagged JSON commands carried in WebSocket text frames, base64 payloads and
//! CRC32 frame checksums.

pub mod codec;
pub mod message;


pub use codec::{
    CodecError, decode, decode_batch, encode, encode_batch, frame_checksum, verify_checksum,
};
pub use message::{
    AckType, ClientCommand, CompressionType, InitialPosition, MessageIdData, MessageMetadata,
    ServerCommand, ServerError, SingleMessage, SubType, CLIENT_VERSION, SERVER_VERSION,
};
pub use tungstenite::protocol::Message as WsMessage;
