use std::time::Instant;

use courier_transport::SingleMessage;

use crate::message::OutgoingMessage;
use crate::producer::SendCallback;

/// Serialized size at which an open batch is flushed regardless of count.
pub(crate) const MAX_BATCH_BYTES: usize = 128 * 1024;

/// A flushed batch, ready to become one send operation.
pub(crate) struct Batch {
    pub(crate) messages: Vec<SingleMessage>,
    pub(crate) callbacks: Vec<SendCallback>,
    pub(crate) first_sequence_id: u64,
    pub(crate) last_sequence_id: u64,
    pub(crate) publish_time: i64,
}

/// Messages accumulated by a producer before they are published as one entry.
pub(crate) struct BatchContainer {
    max_messages: u32,
    messages: Vec<SingleMessage>,
    callbacks: Vec<SendCallback>,
    first_sequence_id: u64,
    last_sequence_id: u64,
    publish_time: i64,
    bytes: usize,
    created_at: Option<Instant>,
}

impl BatchContainer {
    pub(crate) fn new(max_messages: u32) -> Self {
        Self {
            max_messages: max_messages.max(1),
            messages: Vec::new(),
            callbacks: Vec::new(),
            first_sequence_id: 0,
            last_sequence_id: 0,
            publish_time: 0,
            bytes: 0,
            created_at: None,
        }
    }

    pub(crate) fn add(
        &mut self,
        sequence_id: u64,
        message: OutgoingMessage,
        callback: SendCallback,
        publish_time: i64,
    ) {
        if self.messages.is_empty() {
            self.first_sequence_id = sequence_id;
            self.publish_time = publish_time;
            self.created_at = Some(Instant::now());
        }
        self.last_sequence_id = sequence_id;
        self.bytes += message.payload.len();
        self.messages.push(SingleMessage {
            properties: message.properties,
            partition_key: message.partition_key,
            payload: message.payload,
        });
        self.callbacks.push(callback);
    }

    pub(crate) fn len(&self) -> usize {
        self.messages.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub(crate) fn is_full(&self) -> bool {
        self.messages.len() >= self.max_messages as usize || self.bytes >= MAX_BATCH_BYTES
    }

    /// When the first message of the open batch was added.
    pub(crate) fn created_at(&self) -> Option<Instant> {
        self.created_at
    }

    pub(crate) fn take(&mut self) -> Option<Batch> {
        if self.messages.is_empty() {
            return None;
        }
        self.bytes = 0;
        self.created_at = None;
        Some(Batch {
            messages: std::mem::take(&mut self.messages),
            callbacks: std::mem::take(&mut self.callbacks),
            first_sequence_id: self.first_sequence_id,
            last_sequence_id: self.last_sequence_id,
            publish_time: self.publish_time,
        })
    }

    /// Remove every queued callback, leaving the container empty.
    pub(crate) fn drain_callbacks(&mut self) -> Vec<SendCallback> {
        self.take().map(|batch| batch.callbacks).unwrap_or_default()
    }
}
