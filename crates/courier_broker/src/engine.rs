//! Broker engine
//!
//! This module contains the in-memory broker implementation responsible for:
//! - tracking connected sessions and the producers/consumers they registered
//! - auto-creating topics and appending published entries to their logs
//! - dispatching entries to subscriptions under flow control
//! - acknowledgment, redelivery and retention (size and TTL)
//!
//! The public API is synchronous and designed to be held behind a lock
//! (`Arc<Mutex<Broker>>`) by the transport layer. Replies and deliveries are
//! pushed into the sessions' outbound channels while the lock is held; no
//! network I/O happens here.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use courier_config::BrokerSettings;
use courier_transport::{
    AckType, ClientCommand, InitialPosition, MessageIdData, MessageMetadata, ServerCommand,
    ServerError, SubType, verify_checksum,
};
use courier_utils::lock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::session::{ConsumerRegistration, ProducerRegistration, Session, SessionId};
use crate::subscription::{ConsumerKey, Subscription};
use crate::topic::{AttachedProducer, Topic, validate_topic_name};

#[derive(Debug)]
pub struct Broker {
    pub topics: HashMap<String, Topic>,
    pub sessions: HashMap<SessionId, Session>,
    settings: BrokerSettings,
    next_ledger_id: u64,
    next_producer_seq: u64,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(BrokerSettings::default())
    }
}

impl Broker {
    /// How often the expiry loop applies the message TTL.
    pub const EXPIRY_CHECK_INTERVAL: Duration = Duration::from_secs(1);

    pub fn new(settings: BrokerSettings) -> Self {
        Self {
            topics: HashMap::new(),
            sessions: HashMap::new(),
            settings,
            next_ledger_id: 1,
            next_producer_seq: 0,
        }
    }

    pub fn settings(&self) -> &BrokerSettings {
        &self.settings
    }

    /// Register a session unless the connection limit is reached.
    pub fn register_session(&mut self, session: Session) -> Result<(), Session> {
        if self.sessions.len() >= self.settings.max_connections {
            return Err(session);
        }
        self.sessions.insert(session.id.clone(), session);
        Ok(())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn mark_authenticated(&mut self, session_id: &str) {
        if let Some(session) = self.sessions.get_mut(session_id) {
            session.authenticated = true;
        }
    }

    pub fn is_authenticated(&self, session_id: &str) -> bool {
        self.sessions
            .get(session_id)
            .is_some_and(|session| session.authenticated)
    }

    /// Reply to a session directly.
    pub fn reply(&self, session_id: &str, command: &ServerCommand) {
        if let Some(session) = self.sessions.get(session_id) {
            if !session.send(command) {
                debug!("Session {session_id} is gone, dropping reply");
            }
        }
    }

    /// Remove a session and release everything it registered. Entries its
    /// consumers held unacknowledged go back to their subscriptions.
    pub fn cleanup_session(&mut self, session_id: &str) {
        let Some(session) = self.sessions.remove(session_id) else {
            return;
        };

        for registration in session.producers.values() {
            if let Some(topic) = self.topics.get_mut(&registration.topic) {
                topic.producers.remove(&registration.name);
            }
        }

        let mut touched = Vec::new();
        for (consumer_id, registration) in &session.consumers {
            let key = ConsumerKey::new(session_id, *consumer_id);
            if let Some(subscription) = self
                .topics
                .get_mut(&registration.topic)
                .and_then(|t| t.subscriptions.get_mut(&registration.subscription))
            {
                subscription.remove_consumer(&key);
                touched.push(registration.topic.clone());
            }
        }

        for topic in touched {
            self.dispatch(&topic);
        }
        info!("Cleaned up session {session_id}");
    }

    /// Drop every session, as if each connection had been cut.
    pub fn disconnect_all_sessions(&mut self) -> usize {
        let ids: Vec<SessionId> = self.sessions.keys().cloned().collect();
        for id in &ids {
            self.cleanup_session(id);
        }
        ids.len()
    }

    /// Handle a command from an authenticated session.
    pub fn handle_command(&mut self, session_id: &str, command: ClientCommand) {
        match command {
            ClientCommand::Producer {
                request_id,
                producer_id,
                topic,
                producer_name,
            } => self.create_producer(session_id, request_id, producer_id, &topic, producer_name),
            ClientCommand::Send {
                producer_id,
                sequence_id,
                highest_sequence_id,
                metadata,
                payload,
                checksum,
            } => self.publish(
                session_id,
                producer_id,
                sequence_id,
                highest_sequence_id,
                metadata,
                payload,
                checksum,
            ),
            ClientCommand::Subscribe {
                request_id,
                consumer_id,
                topic,
                subscription,
                sub_type,
                consumer_name,
                initial_position,
            } => self.subscribe(
                session_id,
                request_id,
                consumer_id,
                &topic,
                &subscription,
                sub_type,
                consumer_name,
                initial_position,
            ),
            ClientCommand::Flow {
                consumer_id,
                permits,
            } => self.flow(session_id, consumer_id, permits),
            ClientCommand::Ack {
                consumer_id,
                message_ids,
                ack_type,
            } => self.acknowledge(session_id, consumer_id, &message_ids, ack_type),
            ClientCommand::RedeliverUnacknowledged {
                consumer_id,
                message_ids,
            } => self.redeliver_unacknowledged(session_id, consumer_id, &message_ids),
            ClientCommand::Unsubscribe {
                request_id,
                consumer_id,
            } => self.unsubscribe(session_id, request_id, consumer_id),
            ClientCommand::CloseProducer {
                request_id,
                producer_id,
            } => self.close_producer(session_id, request_id, producer_id),
            ClientCommand::CloseConsumer {
                request_id,
                consumer_id,
            } => self.close_consumer(session_id, request_id, consumer_id),
            ClientCommand::Ping => self.reply(session_id, &ServerCommand::Pong),
            ClientCommand::Pong => {}
            ClientCommand::Connect { .. } => self.reply(
                session_id,
                &error(None, ServerError::NotAllowed, "Already connected"),
            ),
        }
    }

    pub fn create_producer(
        &mut self,
        session_id: &str,
        request_id: u64,
        producer_id: u64,
        topic_name: &str,
        producer_name: Option<String>,
    ) {
        if let Err(message) = validate_topic_name(topic_name) {
            self.reply(
                session_id,
                &error(Some(request_id), ServerError::InvalidTopicName, &message),
            );
            return;
        }
        let Some(session) = self.sessions.get(session_id) else {
            return;
        };
        if session.producers.contains_key(&producer_id) {
            self.reply(
                session_id,
                &error(
                    Some(request_id),
                    ServerError::NotAllowed,
                    &format!("Producer id {producer_id} already in use"),
                ),
            );
            return;
        }

        self.ensure_topic(topic_name);
        let name = match producer_name.filter(|name| !name.is_empty()) {
            Some(name) => name,
            None => self.generate_producer_name(topic_name),
        };

        let Some(topic) = self.topics.get_mut(topic_name) else {
            return;
        };
        if topic.producers.contains_key(&name) {
            self.reply(
                session_id,
                &error(
                    Some(request_id),
                    ServerError::ProducerBusy,
                    &format!("Producer with name '{name}' is already connected to topic"),
                ),
            );
            return;
        }
        topic.producers.insert(
            name.clone(),
            AttachedProducer {
                session: session_id.to_string(),
                producer_id,
            },
        );

        if let Some(session) = self.sessions.get_mut(session_id) {
            session.producers.insert(
                producer_id,
                ProducerRegistration {
                    topic: topic_name.to_string(),
                    name: name.clone(),
                },
            );
        }
        info!("Created producer {name} on {topic_name}");
        self.reply(
            session_id,
            &ServerCommand::ProducerSuccess {
                request_id,
                producer_name: name,
            },
        );
    }

    #[allow(clippy::too_many_arguments)]
    pub fn publish(
        &mut self,
        session_id: &str,
        producer_id: u64,
        sequence_id: u64,
        highest_sequence_id: u64,
        metadata: MessageMetadata,
        payload: Vec<u8>,
        checksum: u32,
    ) {
        let send_error = |code: ServerError, message: &str| ServerCommand::SendError {
            producer_id,
            sequence_id,
            code,
            message: message.to_string(),
        };

        let Some(registration) = self
            .sessions
            .get(session_id)
            .and_then(|s| s.producers.get(&producer_id))
            .cloned()
        else {
            self.reply(
                session_id,
                &send_error(ServerError::ProducerNotFound, "Producer is not registered"),
            );
            return;
        };

        if !verify_checksum(&metadata, &payload, checksum) {
            warn!(
                "Checksum mismatch from producer {} on {}",
                registration.name, registration.topic
            );
            self.reply(
                session_id,
                &send_error(ServerError::ChecksumError, "Checksum verification failed"),
            );
            return;
        }

        let now_ms = chrono::Utc::now().timestamp_millis();
        let Some(topic) = self.topics.get_mut(&registration.topic) else {
            self.reply(
                session_id,
                &send_error(ServerError::TopicNotFound, "Topic was removed"),
            );
            return;
        };
        let message_id = topic.append(metadata, payload, checksum, now_ms);

        self.reply(
            session_id,
            &ServerCommand::SendReceipt {
                producer_id,
                sequence_id,
                highest_sequence_id,
                message_id,
            },
        );
        self.dispatch(&registration.topic);
    }

    #[allow(clippy::too_many_arguments)]
    pub fn subscribe(
        &mut self,
        session_id: &str,
        request_id: u64,
        consumer_id: u64,
        topic_name: &str,
        subscription_name: &str,
        sub_type: SubType,
        consumer_name: Option<String>,
        initial_position: InitialPosition,
    ) {
        if let Err(message) = validate_topic_name(topic_name) {
            self.reply(
                session_id,
                &error(Some(request_id), ServerError::InvalidTopicName, &message),
            );
            return;
        }
        if subscription_name.is_empty() {
            self.reply(
                session_id,
                &error(
                    Some(request_id),
                    ServerError::NotAllowed,
                    "Subscription name must not be empty",
                ),
            );
            return;
        }
        let Some(session) = self.sessions.get(session_id) else {
            return;
        };
        if session.consumers.contains_key(&consumer_id) {
            self.reply(
                session_id,
                &error(
                    Some(request_id),
                    ServerError::NotAllowed,
                    &format!("Consumer id {consumer_id} already in use"),
                ),
            );
            return;
        }

        let name = consumer_name
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string()[..5].to_string());
        let key = ConsumerKey::new(session_id, consumer_id);

        let topic = self.ensure_topic(topic_name);
        let start = topic.start_position(initial_position);
        let subscription = topic
            .subscriptions
            .entry(subscription_name.to_string())
            .or_insert_with(|| Subscription::new(subscription_name, sub_type, start));

        if let Err((code, message)) = subscription.add_consumer(key, name.clone(), sub_type) {
            self.reply(session_id, &error(Some(request_id), code, &message));
            return;
        }

        if let Some(session) = self.sessions.get_mut(session_id) {
            session.consumers.insert(
                consumer_id,
                ConsumerRegistration {
                    topic: topic_name.to_string(),
                    subscription: subscription_name.to_string(),
                },
            );
        }
        info!("Consumer {name} subscribed to {topic_name} as {subscription_name} ({sub_type:?})");
        self.reply(session_id, &ServerCommand::Success { request_id });
    }

    pub fn flow(&mut self, session_id: &str, consumer_id: u64, permits: u32) {
        let key = ConsumerKey::new(session_id, consumer_id);
        let Some(registration) = self.consumer_registration(&key) else {
            debug!("Flow for unknown consumer {consumer_id} on {session_id}");
            return;
        };
        if let Some(subscription) = self.subscription_mut(&registration) {
            subscription.add_permits(&key, permits);
        }
        self.dispatch(&registration.topic);
    }

    pub fn acknowledge(
        &mut self,
        session_id: &str,
        consumer_id: u64,
        message_ids: &[MessageIdData],
        ack_type: AckType,
    ) {
        let key = ConsumerKey::new(session_id, consumer_id);
        let Some(registration) = self.consumer_registration(&key) else {
            return;
        };
        let Some(topic) = self.topics.get_mut(&registration.topic) else {
            return;
        };
        let ledger_id = topic.ledger_id;
        let Some(subscription) = topic.subscriptions.get_mut(&registration.subscription) else {
            return;
        };

        let entries = message_ids
            .iter()
            .filter(|id| id.ledger_id == ledger_id)
            .map(|id| id.entry_id);
        match ack_type {
            AckType::Individual => entries.for_each(|entry| subscription.acknowledge(entry)),
            AckType::Cumulative => {
                if subscription.sub_type == SubType::Shared {
                    warn!("Ignoring cumulative ack on shared subscription {}", subscription.name);
                    return;
                }
                if let Some(last) = entries.max() {
                    subscription.acknowledge_cumulative(last);
                }
            }
        }
    }

    pub fn redeliver_unacknowledged(
        &mut self,
        session_id: &str,
        consumer_id: u64,
        message_ids: &[MessageIdData],
    ) {
        let key = ConsumerKey::new(session_id, consumer_id);
        let Some(registration) = self.consumer_registration(&key) else {
            return;
        };
        let Some(topic) = self.topics.get_mut(&registration.topic) else {
            return;
        };
        let ledger_id = topic.ledger_id;
        let entry_ids: Vec<u64> = message_ids
            .iter()
            .filter(|id| id.ledger_id == ledger_id)
            .map(|id| id.entry_id)
            .collect();
        if !message_ids.is_empty() && entry_ids.is_empty() {
            return;
        }
        if let Some(subscription) = topic.subscriptions.get_mut(&registration.subscription) {
            let moved = subscription.redeliver_owned_by(&key, &entry_ids);
            debug!("Redelivering {moved} entries on {}", subscription.name);
        }
        self.dispatch(&registration.topic);
    }

    pub fn unsubscribe(&mut self, session_id: &str, request_id: u64, consumer_id: u64) {
        let key = ConsumerKey::new(session_id, consumer_id);
        let Some(registration) = self.consumer_registration(&key) else {
            self.reply(
                session_id,
                &error(Some(request_id), ServerError::ConsumerNotFound, "Consumer not found"),
            );
            return;
        };
        let Some(topic) = self.topics.get_mut(&registration.topic) else {
            return;
        };
        let others = topic
            .subscriptions
            .get(&registration.subscription)
            .map(|s| s.consumers.iter().filter(|c| c.key != key).count())
            .unwrap_or(0);
        if others > 0 {
            self.reply(
                session_id,
                &error(
                    Some(request_id),
                    ServerError::NotAllowed,
                    "Subscription has other connected consumers",
                ),
            );
            return;
        }

        topic.subscriptions.remove(&registration.subscription);
        if let Some(session) = self.sessions.get_mut(session_id) {
            session.consumers.remove(&consumer_id);
        }
        info!(
            "Removed subscription {} from {}",
            registration.subscription, registration.topic
        );
        self.reply(session_id, &ServerCommand::Success { request_id });
    }

    pub fn close_producer(&mut self, session_id: &str, request_id: u64, producer_id: u64) {
        let registration = self
            .sessions
            .get_mut(session_id)
            .and_then(|s| s.producers.remove(&producer_id));
        if let Some(registration) = registration {
            if let Some(topic) = self.topics.get_mut(&registration.topic) {
                topic.producers.remove(&registration.name);
            }
            debug!("Closed producer {} on {}", registration.name, registration.topic);
        }
        self.reply(session_id, &ServerCommand::Success { request_id });
    }

    pub fn close_consumer(&mut self, session_id: &str, request_id: u64, consumer_id: u64) {
        let registration = self
            .sessions
            .get_mut(session_id)
            .and_then(|s| s.consumers.remove(&consumer_id));
        if let Some(registration) = registration {
            let key = ConsumerKey::new(session_id, consumer_id);
            if let Some(subscription) = self.subscription_mut(&registration) {
                subscription.remove_consumer(&key);
            }
            self.dispatch(&registration.topic);
        }
        self.reply(session_id, &ServerCommand::Success { request_id });
    }

    /// Apply the message TTL. Returns the number of expired entries.
    pub fn expire_messages(&mut self, now_ms: i64) -> usize {
        if self.settings.message_ttl_secs == 0 {
            return 0;
        }
        let ttl_ms = i64::try_from(self.settings.message_ttl_secs.saturating_mul(1000))
            .unwrap_or(i64::MAX);
        let cutoff = now_ms.saturating_sub(ttl_ms);
        self.topics
            .values_mut()
            .map(|topic| topic.expire(cutoff))
            .sum()
    }

    pub async fn start_expiry_loop(broker: Arc<Mutex<Broker>>) {
        loop {
            tokio::time::sleep(Self::EXPIRY_CHECK_INTERVAL).await;
            let expired = lock(&broker).expire_messages(chrono::Utc::now().timestamp_millis());
            if expired > 0 {
                debug!("Expired {expired} entries");
            }
        }
    }

    /// Push every possible delivery on `topic_name` to its consumers.
    pub fn dispatch(&mut self, topic_name: &str) {
        let Some(topic) = self.topics.get_mut(topic_name) else {
            return;
        };
        for (consumer, command) in topic.dispatch() {
            match self.sessions.get(&consumer.session) {
                Some(session) => {
                    if !session.send(&command) {
                        debug!("Delivery to {} failed", consumer.session);
                    }
                }
                None => warn!("No session registered with id: {}", consumer.session),
            }
        }
    }

    fn ensure_topic(&mut self, topic_name: &str) -> &mut Topic {
        let max_entries = self.settings.max_messages_per_topic;
        let next_ledger_id = &mut self.next_ledger_id;
        self.topics.entry(topic_name.to_string()).or_insert_with(|| {
            let ledger_id = *next_ledger_id;
            *next_ledger_id += 1;
            info!("Created topic {topic_name}");
            Topic::new(topic_name, ledger_id, max_entries)
        })
    }

    fn generate_producer_name(&mut self, topic_name: &str) -> String {
        loop {
            let name = format!("standalone-0-{}", self.next_producer_seq);
            self.next_producer_seq += 1;
            let taken = self
                .topics
                .get(topic_name)
                .is_some_and(|t| t.producers.contains_key(&name));
            if !taken {
                return name;
            }
        }
    }

    fn consumer_registration(&self, key: &ConsumerKey) -> Option<ConsumerRegistration> {
        self.sessions
            .get(&key.session)
            .and_then(|s| s.consumers.get(&key.consumer_id))
            .cloned()
    }

    fn subscription_mut(
        &mut self,
        registration: &ConsumerRegistration,
    ) -> Option<&mut Subscription> {
        self.topics
            .get_mut(&registration.topic)
            .and_then(|t| t.subscriptions.get_mut(&registration.subscription))
    }
}

fn error(request_id: Option<u64>, code: ServerError, message: &str) -> ServerCommand {
    ServerCommand::Error {
        request_id,
        code,
        message: message.to_string(),
    }
}
