//! Topic management
//!
//! A `Topic` holds a bounded in-memory entry log, the producers attached to it
//! (by name) and its subscriptions. Entry ids are assigned sequentially within
//! the topic's ledger; retention trims the oldest entries once the log exceeds
//! its size bound or its entries exceed the TTL.
//!
//! Callers must synchronize access (the broker lock).

use std::collections::{HashMap, VecDeque};

use courier_transport::{InitialPosition, MessageIdData, MessageMetadata, ServerCommand};

use crate::session::SessionId;
use crate::subscription::{ConsumerKey, Subscription};

#[derive(Debug, Clone)]
pub struct Entry {
    pub entry_id: u64,
    pub metadata: MessageMetadata,
    pub payload: Vec<u8>,
    pub checksum: u32,
    /// Broker receive time in milliseconds since the epoch.
    pub stored_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachedProducer {
    pub session: SessionId,
    pub producer_id: u64,
}

#[derive(Debug)]
pub struct Topic {
    pub name: String,
    pub ledger_id: u64,
    pub entries: VecDeque<Entry>,
    pub producers: HashMap<String, AttachedProducer>,
    pub subscriptions: HashMap<String, Subscription>,
    next_entry_id: u64,
    max_entries: usize,
}

/// Check a topic name of the form `persistent://tenant/namespace/topic`.
pub fn validate_topic_name(name: &str) -> Result<(), String> {
    let rest = name
        .strip_prefix("persistent://")
        .or_else(|| name.strip_prefix("non-persistent://"))
        .ok_or_else(|| format!("Invalid topic domain in '{name}'"))?;

    let segments: Vec<&str> = rest.split('/').collect();
    if segments.len() < 3 || segments.iter().any(|s| s.is_empty()) {
        return Err(format!("Invalid topic name '{name}'"));
    }
    Ok(())
}

impl Topic {
    pub fn new(name: &str, ledger_id: u64, max_entries: usize) -> Self {
        Self {
            name: name.to_string(),
            ledger_id,
            entries: VecDeque::new(),
            producers: HashMap::new(),
            subscriptions: HashMap::new(),
            next_entry_id: 0,
            max_entries,
        }
    }

    /// Id the next appended entry will receive.
    pub fn head(&self) -> u64 {
        self.next_entry_id
    }

    pub fn message_id(&self, entry_id: u64) -> MessageIdData {
        MessageIdData {
            ledger_id: self.ledger_id,
            entry_id,
        }
    }

    pub fn start_position(&self, position: InitialPosition) -> u64 {
        match position {
            InitialPosition::Latest => self.next_entry_id,
            InitialPosition::Earliest => self
                .entries
                .front()
                .map(|e| e.entry_id)
                .unwrap_or(self.next_entry_id),
        }
    }

    pub fn append(
        &mut self,
        metadata: MessageMetadata,
        payload: Vec<u8>,
        checksum: u32,
        now_ms: i64,
    ) -> MessageIdData {
        let entry_id = self.next_entry_id;
        self.next_entry_id += 1;
        self.entries.push_back(Entry {
            entry_id,
            metadata,
            payload,
            checksum,
            stored_at: now_ms,
        });
        while self.max_entries > 0 && self.entries.len() > self.max_entries {
            self.entries.pop_front();
        }
        self.message_id(entry_id)
    }

    pub fn entry(&self, entry_id: u64) -> Option<&Entry> {
        find_entry(&self.entries, entry_id)
    }

    /// Drop entries stored before `cutoff_ms`. Returns how many were removed.
    pub fn expire(&mut self, cutoff_ms: i64) -> usize {
        let mut removed = 0;
        while self.entries.front().is_some_and(|e| e.stored_at < cutoff_ms) {
            self.entries.pop_front();
            removed += 1;
        }
        removed
    }

    /// Collect every delivery the subscriptions can make right now.
    pub fn dispatch(&mut self) -> Vec<(ConsumerKey, ServerCommand)> {
        let head = self.next_entry_id;
        let ledger_id = self.ledger_id;
        let mut out = Vec::new();

        for subscription in self.subscriptions.values_mut() {
            while let Some(delivery) = subscription.next_delivery(head) {
                let Some(entry) = find_entry(&self.entries, delivery.entry_id) else {
                    // Trimmed by retention: give the permit back and move on.
                    subscription.discard(delivery.entry_id);
                    subscription.add_permits(&delivery.consumer, 1);
                    continue;
                };

                let command = ServerCommand::Message {
                    consumer_id: delivery.consumer.consumer_id,
                    message_id: MessageIdData {
                        ledger_id,
                        entry_id: entry.entry_id,
                    },
                    redelivery_count: delivery.redelivery_count,
                    metadata: entry.metadata.clone(),
                    payload: entry.payload.clone(),
                    checksum: entry.checksum,
                };
                out.push((delivery.consumer, command));
            }
        }
        out
    }
}

fn find_entry(entries: &VecDeque<Entry>, entry_id: u64) -> Option<&Entry> {
    let first = entries.front()?.entry_id;
    let index = usize::try_from(entry_id.checked_sub(first)?).ok()?;
    entries.get(index)
}
