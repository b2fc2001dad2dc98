//! Subscription cursor and dispatch state
//!
//! A subscription tracks, for one named cursor over a topic:
//! - the next entry to read (`read_position`)
//! - entries dispatched but not yet acknowledged (`pending`), each owned by the
//!   consumer it was delivered to
//! - entries that must be delivered again (`redeliver`), served before new
//!   entries
//!
//! Which consumer receives the next entry depends on the subscription type:
//! Exclusive admits a single consumer, Failover delivers to the consumer with
//! the lowest name and Shared rotates over every consumer holding permits.

use std::collections::{BTreeMap, BTreeSet};

use courier_transport::{ServerError, SubType};

use crate::session::SessionId;

/// Identifies a consumer across sessions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConsumerKey {
    pub session: SessionId,
    pub consumer_id: u64,
}

impl ConsumerKey {
    pub fn new(session: &str, consumer_id: u64) -> Self {
        Self {
            session: session.to_string(),
            consumer_id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SubscribedConsumer {
    pub key: ConsumerKey,
    pub name: String,
    pub permits: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub consumer: ConsumerKey,
    pub redelivery_count: u32,
}

/// One delivery decision: send entry `entry_id` to `consumer`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub consumer: ConsumerKey,
    pub entry_id: u64,
    pub redelivery_count: u32,
}

#[derive(Debug)]
pub struct Subscription {
    pub name: String,
    pub sub_type: SubType,
    pub consumers: Vec<SubscribedConsumer>,
    pub read_position: u64,
    pub pending: BTreeMap<u64, PendingEntry>,
    pub redeliver: BTreeSet<u64>,
    redelivery_counts: BTreeMap<u64, u32>,
    round_robin: usize,
}

impl Subscription {
    pub fn new(name: &str, sub_type: SubType, read_position: u64) -> Self {
        Self {
            name: name.to_string(),
            sub_type,
            consumers: Vec::new(),
            read_position,
            pending: BTreeMap::new(),
            redeliver: BTreeSet::new(),
            redelivery_counts: BTreeMap::new(),
            round_robin: 0,
        }
    }

    pub fn add_consumer(
        &mut self,
        key: ConsumerKey,
        name: String,
        sub_type: SubType,
    ) -> Result<(), (ServerError, String)> {
        if self.consumers.is_empty() {
            self.sub_type = sub_type;
        } else if self.sub_type != sub_type {
            return Err((
                ServerError::ConsumerBusy,
                format!(
                    "Subscription {} is of type {:?}, requested {:?}",
                    self.name, self.sub_type, sub_type
                ),
            ));
        } else if self.sub_type == SubType::Exclusive {
            return Err((
                ServerError::ConsumerBusy,
                format!("Exclusive consumer is already connected to {}", self.name),
            ));
        }

        self.consumers.push(SubscribedConsumer {
            key,
            name,
            permits: 0,
        });
        Ok(())
    }

    /// Remove a consumer; everything it held unacknowledged becomes eligible
    /// for redelivery. Returns whether the consumer was attached.
    pub fn remove_consumer(&mut self, key: &ConsumerKey) -> bool {
        let before = self.consumers.len();
        self.consumers.retain(|c| &c.key != key);
        if self.consumers.len() == before {
            return false;
        }
        self.redeliver_owned_by(key, &[]);
        true
    }

    pub fn has_consumer(&self, key: &ConsumerKey) -> bool {
        self.consumers.iter().any(|c| &c.key == key)
    }

    pub fn add_permits(&mut self, key: &ConsumerKey, permits: u32) {
        if let Some(consumer) = self.consumers.iter_mut().find(|c| &c.key == key) {
            consumer.permits = consumer.permits.saturating_add(permits);
        }
    }

    pub fn acknowledge(&mut self, entry_id: u64) {
        self.pending.remove(&entry_id);
        self.redeliver.remove(&entry_id);
        self.redelivery_counts.remove(&entry_id);
    }

    /// Acknowledge every entry up to and including `entry_id`.
    pub fn acknowledge_cumulative(&mut self, entry_id: u64) {
        let acked: Vec<u64> = self
            .pending
            .range(..=entry_id)
            .map(|(id, _)| *id)
            .chain(self.redeliver.range(..=entry_id).copied())
            .collect();
        for id in acked {
            self.acknowledge(id);
        }
        if self.read_position <= entry_id {
            self.read_position = entry_id + 1;
        }
    }

    /// Move entries owned by `key` back to the redelivery set. An empty
    /// `entry_ids` selects everything the consumer holds.
    pub fn redeliver_owned_by(&mut self, key: &ConsumerKey, entry_ids: &[u64]) -> usize {
        let selected: Vec<u64> = self
            .pending
            .iter()
            .filter(|(id, pending)| {
                &pending.consumer == key && (entry_ids.is_empty() || entry_ids.contains(id))
            })
            .map(|(id, _)| *id)
            .collect();

        for id in &selected {
            if let Some(pending) = self.pending.remove(id) {
                self.redelivery_counts
                    .insert(*id, pending.redelivery_count.saturating_add(1));
                self.redeliver.insert(*id);
            }
        }
        selected.len()
    }

    /// Forget an entry that no longer exists in the topic.
    pub fn discard(&mut self, entry_id: u64) {
        self.acknowledge(entry_id);
    }

    /// Pick the next entry and the consumer that should receive it, consuming
    /// one permit. `head` is the id the topic will assign to its next entry.
    pub fn next_delivery(&mut self, head: u64) -> Option<Delivery> {
        let from_redeliver = self.redeliver.first().copied();
        if from_redeliver.is_none() && self.read_position >= head {
            return None;
        }

        let index = self.select_consumer()?;
        let consumer = &mut self.consumers[index];
        consumer.permits -= 1;
        let key = consumer.key.clone();

        let entry_id = match from_redeliver {
            Some(id) => {
                self.redeliver.remove(&id);
                id
            }
            None => {
                let id = self.read_position;
                self.read_position += 1;
                id
            }
        };

        let redelivery_count = self.redelivery_counts.get(&entry_id).copied().unwrap_or(0);
        self.pending.insert(
            entry_id,
            PendingEntry {
                consumer: key.clone(),
                redelivery_count,
            },
        );

        Some(Delivery {
            consumer: key,
            entry_id,
            redelivery_count,
        })
    }

    fn select_consumer(&mut self) -> Option<usize> {
        match self.sub_type {
            SubType::Exclusive => self.consumers.first().filter(|c| c.permits > 0).map(|_| 0),
            SubType::Failover => {
                let (index, active) = self
                    .consumers
                    .iter()
                    .enumerate()
                    .min_by(|(_, a), (_, b)| a.name.cmp(&b.name))?;
                (active.permits > 0).then_some(index)
            }
            SubType::Shared => {
                let count = self.consumers.len();
                for offset in 0..count {
                    let index = (self.round_robin + offset) % count;
                    if self.consumers[index].permits > 0 {
                        self.round_robin = (index + 1) % count;
                        return Some(index);
                    }
                }
                None
            }
        }
    }

    /// Name of the consumer currently receiving messages, for Failover and
    /// Exclusive subscriptions.
    pub fn active_consumer(&self) -> Option<&SubscribedConsumer> {
        match self.sub_type {
            SubType::Exclusive => self.consumers.first(),
            SubType::Failover => self.consumers.iter().min_by(|a, b| a.name.cmp(&b.name)),
            SubType::Shared => None,
        }
    }
}
