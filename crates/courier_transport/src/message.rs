//! Protocol commands
//!
//! Every command is a JSON object with a `type` tag sent as a WebSocket text
//! frame. Requests that expect a direct answer carry a `request_id` which the
//! broker echoes back in `success`, `producer_success` or `error`. Sends are
//! correlated by `(producer_id, sequence_id)` and delivered messages by
//! `consumer_id`.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Version string sent in `connect` by the client library.
pub const CLIENT_VERSION: &str = concat!("courier-client/", env!("CARGO_PKG_VERSION"));

/// Version string sent in `connected` by the standalone broker.
pub const SERVER_VERSION: &str = concat!("courier-broker/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    Connect {
        client_version: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        auth_token: Option<String>,
    },
    Producer {
        request_id: u64,
        producer_id: u64,
        topic: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        producer_name: Option<String>,
    },
    Send {
        producer_id: u64,
        sequence_id: u64,
        highest_sequence_id: u64,
        metadata: MessageMetadata,
        #[serde(with = "base64_payload")]
        payload: Vec<u8>,
        checksum: u32,
    },
    Subscribe {
        request_id: u64,
        consumer_id: u64,
        topic: String,
        subscription: String,
        sub_type: SubType,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        consumer_name: Option<String>,
        #[serde(default)]
        initial_position: InitialPosition,
    },
    Flow {
        consumer_id: u64,
        permits: u32,
    },
    Ack {
        consumer_id: u64,
        message_ids: Vec<MessageIdData>,
        ack_type: AckType,
    },
    /// An empty `message_ids` asks for every unacknowledged message.
    RedeliverUnacknowledged {
        consumer_id: u64,
        #[serde(default)]
        message_ids: Vec<MessageIdData>,
    },
    Unsubscribe {
        request_id: u64,
        consumer_id: u64,
    },
    CloseProducer {
        request_id: u64,
        producer_id: u64,
    },
    CloseConsumer {
        request_id: u64,
        consumer_id: u64,
    },
    Ping,
    Pong,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerCommand {
    Connected {
        server_version: String,
    },
    ProducerSuccess {
        request_id: u64,
        producer_name: String,
    },
    Success {
        request_id: u64,
    },
    /// A refused request, or a connection-level refusal when `request_id` is absent.
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
        code: ServerError,
        message: String,
    },
    SendReceipt {
        producer_id: u64,
        sequence_id: u64,
        highest_sequence_id: u64,
        message_id: MessageIdData,
    },
    SendError {
        producer_id: u64,
        sequence_id: u64,
        code: ServerError,
        message: String,
    },
    Message {
        consumer_id: u64,
        message_id: MessageIdData,
        #[serde(default)]
        redelivery_count: u32,
        metadata: MessageMetadata,
        #[serde(with = "base64_payload")]
        payload: Vec<u8>,
        checksum: u32,
    },
    Ping,
    Pong,
}

/// Position of an entry in a topic: the ledger (one per topic incarnation)
/// and the entry within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
pub struct MessageIdData {
    pub ledger_id: u64,
    pub entry_id: u64,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct MessageMetadata {
    pub producer_name: String,
    pub sequence_id: u64,
    /// Milliseconds since the Unix epoch.
    pub publish_time: i64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_key: Option<String>,
    #[serde(default)]
    pub compression: CompressionType,
    /// Payload size before compression.
    #[serde(default)]
    pub uncompressed_size: u32,
    /// Set when the payload is a JSON array of [`SingleMessage`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_messages_in_batch: Option<u32>,
}

/// One member of a batched payload.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct SingleMessage {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_key: Option<String>,
    #[serde(with = "base64_payload")]
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionType {
    #[default]
    None,
    Lz4,
    Zlib,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubType {
    #[default]
    Exclusive,
    Shared,
    Failover,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InitialPosition {
    #[default]
    Latest,
    Earliest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AckType {
    Individual,
    Cumulative,
}

/// Refusal codes carried by `error` and `send_error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerError {
    UnknownError,
    MetadataError,
    AuthenticationError,
    AuthorizationError,
    ConsumerBusy,
    ProducerBusy,
    ServiceNotReady,
    TopicNotFound,
    InvalidTopicName,
    SubscriptionNotFound,
    ConsumerNotFound,
    ProducerNotFound,
    TooManyRequests,
    ChecksumError,
    NotAllowed,
    TooManyConnections,
    UnsupportedVersion,
}

impl ServerError {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerError::UnknownError => "unknown_error",
            ServerError::MetadataError => "metadata_error",
            ServerError::AuthenticationError => "authentication_error",
            ServerError::AuthorizationError => "authorization_error",
            ServerError::ConsumerBusy => "consumer_busy",
            ServerError::ProducerBusy => "producer_busy",
            ServerError::ServiceNotReady => "service_not_ready",
            ServerError::TopicNotFound => "topic_not_found",
            ServerError::InvalidTopicName => "invalid_topic_name",
            ServerError::SubscriptionNotFound => "subscription_not_found",
            ServerError::ConsumerNotFound => "consumer_not_found",
            ServerError::ProducerNotFound => "producer_not_found",
            ServerError::TooManyRequests => "too_many_requests",
            ServerError::ChecksumError => "checksum_error",
            ServerError::NotAllowed => "not_allowed",
            ServerError::TooManyConnections => "too_many_connections",
            ServerError::UnsupportedVersion => "unsupported_version",
        }
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for MessageIdData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ledger_id, self.entry_id)
    }
}

mod base64_payload {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
