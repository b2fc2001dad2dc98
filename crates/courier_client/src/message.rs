use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use courier_transport::MessageIdData;

/// Broker-assigned identity of a message, used for acknowledgment.
///
/// Messages published in a batch share the entry and differ by batch index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId {
    ledger_id: u64,
    entry_id: u64,
    batch_index: Option<u32>,
}

impl MessageId {
    pub(crate) fn new(entry: MessageIdData, batch_index: Option<u32>) -> Self {
        Self {
            ledger_id: entry.ledger_id,
            entry_id: entry.entry_id,
            batch_index,
        }
    }

    pub fn ledger_id(&self) -> u64 {
        self.ledger_id
    }

    pub fn entry_id(&self) -> u64 {
        self.entry_id
    }

    pub fn batch_index(&self) -> Option<u32> {
        self.batch_index
    }

    pub(crate) fn entry(&self) -> MessageIdData {
        MessageIdData {
            ledger_id: self.ledger_id,
            entry_id: self.entry_id,
        }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.batch_index {
            Some(index) => write!(f, "{}:{}:{}", self.ledger_id, self.entry_id, index),
            None => write!(f, "{}:{}", self.ledger_id, self.entry_id),
        }
    }
}

/// A message received by a consumer. Immutable.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub(crate) payload: Vec<u8>,
    pub(crate) id: MessageId,
    pub(crate) topic: Arc<str>,
    pub(crate) properties: BTreeMap<String, String>,
    pub(crate) partition_key: Option<String>,
    pub(crate) publish_time: i64,
    pub(crate) producer_name: String,
    pub(crate) redelivery_count: u32,
    /// Number of messages sharing the entry, for batched messages.
    pub(crate) batch_size: Option<u32>,
}

impl Message {
    pub fn data(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_data(self) -> Vec<u8> {
        self.payload
    }

    /// Payload as UTF-8, if it is.
    pub fn data_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    pub fn message_id(&self) -> MessageId {
        self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn partition_key(&self) -> Option<&str> {
        self.partition_key.as_deref()
    }

    pub fn publish_time(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.publish_time)
            .single()
            .unwrap_or_default()
    }

    pub fn producer_name(&self) -> &str {
        &self.producer_name
    }

    /// How many times the broker delivered this message before.
    pub fn redelivery_count(&self) -> u32 {
        self.redelivery_count
    }

    /// Whether acknowledging this message completes its entry.
    pub(crate) fn completes_entry(&self) -> bool {
        match (self.id.batch_index, self.batch_size) {
            (Some(index), Some(size)) => index + 1 >= size,
            _ => true,
        }
    }
}

/// A message to publish.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutgoingMessage {
    pub(crate) payload: Vec<u8>,
    pub(crate) properties: BTreeMap<String, String>,
    pub(crate) partition_key: Option<String>,
}

impl OutgoingMessage {
    pub fn builder(payload: impl Into<Vec<u8>>) -> MessageBuilder {
        MessageBuilder::new(payload)
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

#[derive(Debug, Clone, Default)]
pub struct MessageBuilder {
    message: OutgoingMessage,
}

impl MessageBuilder {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            message: OutgoingMessage {
                payload: payload.into(),
                ..Default::default()
            },
        }
    }

    pub fn property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.message.properties.insert(key.into(), value.into());
        self
    }

    pub fn partition_key(mut self, key: impl Into<String>) -> Self {
        self.message.partition_key = Some(key.into());
        self
    }

    pub fn build(self) -> OutgoingMessage {
        self.message
    }
}

impl From<Vec<u8>> for OutgoingMessage {
    fn from(payload: Vec<u8>) -> Self {
        MessageBuilder::new(payload).build()
    }
}

impl From<&[u8]> for OutgoingMessage {
    fn from(payload: &[u8]) -> Self {
        MessageBuilder::new(payload.to_vec()).build()
    }
}

impl From<&str> for OutgoingMessage {
    fn from(payload: &str) -> Self {
        MessageBuilder::new(payload.as_bytes().to_vec()).build()
    }
}

impl From<String> for OutgoingMessage {
    fn from(payload: String) -> Self {
        MessageBuilder::new(payload.into_bytes()).build()
    }
}

impl From<MessageBuilder> for OutgoingMessage {
    fn from(builder: MessageBuilder) -> Self {
        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(ledger_id: u64, entry_id: u64) -> MessageIdData {
        MessageIdData {
            ledger_id,
            entry_id,
        }
    }

    #[test]
    fn message_id_ordering_and_display() {
        let plain = MessageId::new(entry(1, 4), None);
        let first = MessageId::new(entry(1, 4), Some(0));
        let second = MessageId::new(entry(1, 4), Some(1));
        assert!(plain < first && first < second);
        assert!(second < MessageId::new(entry(1, 5), None));
        assert_eq!(plain.to_string(), "1:4");
        assert_eq!(second.to_string(), "1:4:1");
        assert_eq!(second.entry(), entry(1, 4));
    }

    #[test]
    fn builder_sets_properties() {
        let msg: OutgoingMessage = MessageBuilder::new("body")
            .property("a", "1")
            .partition_key("user-7")
            .into();
        assert_eq!(msg.payload(), b"body");
        assert_eq!(msg.properties.get("a").map(String::as_str), Some("1"));
        assert_eq!(msg.partition_key.as_deref(), Some("user-7"));
    }

    #[test]
    fn batch_completion() {
        let mut msg = Message {
            payload: b"x".to_vec(),
            id: MessageId::new(entry(1, 0), Some(1)),
            topic: Arc::from("t"),
            properties: BTreeMap::new(),
            partition_key: None,
            publish_time: 0,
            producer_name: "p".to_string(),
            redelivery_count: 0,
            batch_size: Some(3),
        };
        assert!(!msg.completes_entry());
        msg.id = MessageId::new(entry(1, 0), Some(2));
        assert!(msg.completes_entry());
        msg.batch_size = None;
        msg.id = MessageId::new(entry(1, 0), None);
        assert!(msg.completes_entry());
        assert_eq!(msg.publish_time().timestamp_millis(), 0);
    }
}
