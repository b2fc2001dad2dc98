//! Consumer
//!
//! Inbound messages are buffered in a bounded queue. The broker only pushes as
//! many entries as the consumer has granted permits for; permits are returned
//! in bulk once half of the receiver queue has been handed to the
//! application. Messages reach the application either through a blocking
//! `receive` or through a listener running on a dedicated dispatch thread.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use courier_transport::{
    AckType, ClientCommand, MessageIdData, MessageMetadata, decode_batch, verify_checksum,
};
use courier_utils::{lock, wait, wait_timeout};
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

use crate::client::on_io_thread;
use crate::compression::decompress;
use crate::config::{ConsumerConfig, ConsumerType, MessageListener};
use crate::connection::{Connection, ConsumerEvents};
use crate::error::{Error, Result};
use crate::message::{Message, MessageId};

/// How long an idle dispatch thread waits before re-checking the consumer.
const LISTENER_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Active,
    Connecting,
    Closed,
}

/// Delivery state of one entry handed to the application.
#[derive(Debug)]
struct Unacked {
    batch_size: Option<u32>,
    acked: BTreeSet<u32>,
    delivered_at: Instant,
}

impl Unacked {
    fn is_complete(&self) -> bool {
        match self.batch_size {
            Some(size) => self.acked.len() >= size as usize,
            None => true,
        }
    }
}

struct ConsumerState {
    status: Status,
    queue: VecDeque<Message>,
    /// Permits earned since the last flow command.
    available_permits: u32,
    unacked: BTreeMap<MessageIdData, Unacked>,
}

pub(crate) struct ConsumerInner {
    topic: Arc<str>,
    subscription: String,
    consumer_id: u64,
    config: ConsumerConfig,
    connection: Connection,
    handle: Handle,
    state: Mutex<ConsumerState>,
    available: Condvar,
    listener_thread: Mutex<Option<JoinHandle<()>>>,
}

/// Receives messages from one subscription. Clones share the same consumer.
#[derive(Clone)]
pub struct Consumer {
    inner: Arc<ConsumerInner>,
}

impl Consumer {
    /// Subscribe and grant the initial permits, blocking until the broker answers.
    pub(crate) fn subscribe(
        connection: Connection,
        topic: &str,
        subscription: &str,
        config: ConsumerConfig,
    ) -> Result<Self> {
        let consumer_id = connection.next_consumer_id();
        connection.request(|request_id| {
            subscribe_command(request_id, consumer_id, topic, subscription, &config)
        })?;

        let handle = connection.handle().clone();
        let inner = Arc::new(ConsumerInner {
            topic: Arc::from(topic),
            subscription: subscription.to_string(),
            consumer_id,
            config,
            connection,
            handle,
            state: Mutex::new(ConsumerState {
                status: Status::Active,
                queue: VecDeque::new(),
                available_permits: 0,
                unacked: BTreeMap::new(),
            }),
            available: Condvar::new(),
            listener_thread: Mutex::new(None),
        });

        let events: Weak<ConsumerInner> = Arc::downgrade(&inner);
        inner.connection.register_consumer(consumer_id, events);

        let listener = inner.config.message_listener().cloned();
        if let Some(listener) = listener {
            let weak = Arc::downgrade(&inner);
            let spawned = thread::Builder::new()
                .name(format!("courier-listener-{consumer_id}"))
                .spawn(move || run_listener(weak, listener));
            match spawned {
                Ok(thread) => *lock(&inner.listener_thread) = Some(thread),
                Err(e) => {
                    let consumer = Self { inner };
                    let _ = consumer.close();
                    return Err(Error::InvalidOperation(format!(
                        "failed to start listener thread: {e}"
                    )));
                }
            }
        }

        let timeout = inner.config.unacked_messages_timeout_ms();
        if timeout > 0 {
            inner
                .handle
                .spawn(run_unacked_timer(Arc::downgrade(&inner), Duration::from_millis(timeout)));
        }

        inner.send_flow(inner.receiver_queue_size());
        info!(
            topic = %inner.topic,
            subscription = %inner.subscription,
            consumer_id,
            "subscribed"
        );
        Ok(Self { inner })
    }

    pub(crate) fn downgrade(&self) -> Weak<ConsumerInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn from_inner(inner: Arc<ConsumerInner>) -> Self {
        Self { inner }
    }

    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    pub fn subscription(&self) -> &str {
        &self.inner.subscription
    }

    /// Configured name; empty when the broker generated one.
    pub fn consumer_name(&self) -> &str {
        self.inner.config.consumer_name()
    }

    /// Block until a message arrives.
    pub fn receive(&self) -> Result<Message> {
        self.inner.receive(None)
    }

    /// Block until a message arrives or `timeout` passes (`Error::Timeout`).
    /// A zero timeout waits forever.
    pub fn receive_timeout(&self, timeout: Duration) -> Result<Message> {
        let timeout = (!timeout.is_zero()).then_some(timeout);
        self.inner.receive(timeout)
    }

    pub fn acknowledge(&self, message: &Message) -> Result<()> {
        self.inner.acknowledge(message.message_id())
    }

    pub fn acknowledge_id(&self, message_id: MessageId) -> Result<()> {
        self.inner.acknowledge(message_id)
    }

    /// Acknowledge every message up to and including `message`. Not allowed on
    /// Shared subscriptions.
    pub fn acknowledge_cumulative(&self, message: &Message) -> Result<()> {
        self.inner.acknowledge_cumulative(message.message_id())
    }

    /// Drop buffered messages and ask the broker to redeliver everything this
    /// consumer has not acknowledged.
    pub fn redeliver_unacknowledged_messages(&self) -> Result<()> {
        self.inner.redeliver_all()
    }

    /// Delete the subscription on the broker and close the consumer.
    pub fn unsubscribe(&self) -> Result<()> {
        self.inner.unsubscribe()
    }

    /// Stop dispatching and release the consumer on the broker. The
    /// subscription is kept. Idempotent.
    pub fn close(&self) -> Result<()> {
        self.inner.close()
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.inner.state).status == Status::Closed
    }
}

fn subscribe_command(
    request_id: u64,
    consumer_id: u64,
    topic: &str,
    subscription: &str,
    config: &ConsumerConfig,
) -> ClientCommand {
    let consumer_name = Some(config.consumer_name())
        .filter(|name| !name.is_empty())
        .map(str::to_string);
    ClientCommand::Subscribe {
        request_id,
        consumer_id,
        topic: topic.to_string(),
        subscription: subscription.to_string(),
        sub_type: config.consumer_type(),
        consumer_name,
        initial_position: config.initial_position(),
    }
}

impl ConsumerInner {
    fn receiver_queue_size(&self) -> u32 {
        self.config.receiver_queue_size().max(1) as u32
    }

    fn send_flow(&self, permits: u32) {
        if permits > 0 {
            debug!(consumer_id = self.consumer_id, permits, "granting permits");
            self.connection.send_command(ClientCommand::Flow {
                consumer_id: self.consumer_id,
                permits,
            });
        }
    }

    fn send_ack(&self, message_id: MessageIdData, ack_type: AckType) {
        self.connection.send_command(ClientCommand::Ack {
            consumer_id: self.consumer_id,
            message_ids: vec![message_id],
            ack_type,
        });
    }

    /// Return `count` permits, flowing them once half the queue is earned.
    fn increase_permits(&self, state: &mut ConsumerState, count: u32) {
        state.available_permits += count;
        let threshold = (self.receiver_queue_size() / 2).max(1);
        if state.available_permits >= threshold && state.status == Status::Active {
            let permits = std::mem::take(&mut state.available_permits);
            self.send_flow(permits);
        }
    }

    /// Track a message handed to the application.
    fn on_handed_out(&self, state: &mut ConsumerState, message: &Message) {
        state
            .unacked
            .entry(message.id.entry())
            .or_insert_with(|| Unacked {
                batch_size: message.batch_size,
                acked: BTreeSet::new(),
                delivered_at: Instant::now(),
            });
        if message.completes_entry() {
            self.increase_permits(state, 1);
        }
    }

    fn receive(&self, timeout: Option<Duration>) -> Result<Message> {
        if self.config.has_message_listener() {
            return Err(Error::InvalidOperation(
                "receive is not allowed when a message listener is set".to_string(),
            ));
        }
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut state = lock(&self.state);
        loop {
            if state.status == Status::Closed {
                return Err(Error::AlreadyClosed("consumer"));
            }
            if let Some(message) = state.queue.pop_front() {
                self.on_handed_out(&mut state, &message);
                return Ok(message);
            }
            state = match deadline {
                None => wait(&self.available, state),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::Timeout);
                    }
                    wait_timeout(&self.available, state, deadline - now)
                }
            };
        }
    }

    /// Next message for the dispatch thread, or `None` after a poll interval.
    fn next_for_listener(&self) -> Option<Message> {
        let mut state = lock(&self.state);
        if state.status == Status::Closed {
            return None;
        }
        if state.queue.is_empty() {
            state = wait_timeout(&self.available, state, LISTENER_POLL_INTERVAL);
        }
        if state.status == Status::Closed {
            return None;
        }
        let message = state.queue.pop_front()?;
        self.on_handed_out(&mut state, &message);
        Some(message)
    }

    fn acknowledge(&self, message_id: MessageId) -> Result<()> {
        let entry = message_id.entry();
        let complete = {
            let mut state = lock(&self.state);
            if state.status == Status::Closed {
                return Err(Error::AlreadyClosed("consumer"));
            }
            match state.unacked.get_mut(&entry) {
                Some(unacked) => {
                    if let Some(index) = message_id.batch_index() {
                        unacked.acked.insert(index);
                    }
                    if unacked.is_complete() {
                        state.unacked.remove(&entry);
                        true
                    } else {
                        false
                    }
                }
                None => message_id.batch_index().is_none(),
            }
        };
        if complete {
            self.send_ack(entry, AckType::Individual);
        }
        Ok(())
    }

    fn acknowledge_cumulative(&self, message_id: MessageId) -> Result<()> {
        if self.config.consumer_type() == ConsumerType::Shared {
            return Err(Error::InvalidOperation(
                "cumulative acknowledgment is not allowed on shared subscriptions".to_string(),
            ));
        }
        let entry = message_id.entry();
        let ack_up_to = {
            let mut state = lock(&self.state);
            if state.status == Status::Closed {
                return Err(Error::AlreadyClosed("consumer"));
            }
            let rest = state.unacked.split_off(&entry);
            state.unacked = rest;

            let complete = match (state.unacked.get_mut(&entry), message_id.batch_index()) {
                (Some(unacked), Some(index)) => {
                    unacked.acked.extend(0..=index);
                    unacked.is_complete()
                }
                _ => true,
            };
            if complete {
                state.unacked.remove(&entry);
                Some(entry)
            } else {
                entry.entry_id.checked_sub(1).map(|entry_id| MessageIdData {
                    ledger_id: entry.ledger_id,
                    entry_id,
                })
            }
        };
        if let Some(up_to) = ack_up_to {
            self.send_ack(up_to, AckType::Cumulative);
        }
        Ok(())
    }

    fn redeliver_all(&self) -> Result<()> {
        let mut state = lock(&self.state);
        if state.status == Status::Closed {
            return Err(Error::AlreadyClosed("consumer"));
        }
        let cleared = state.queue.drain(..).filter(Message::completes_entry).count() as u32;
        state.unacked.clear();
        self.connection
            .send_command(ClientCommand::RedeliverUnacknowledged {
                consumer_id: self.consumer_id,
                message_ids: Vec::new(),
            });
        self.increase_permits(&mut state, cleared);
        debug!(consumer_id = self.consumer_id, cleared, "requested redelivery");
        Ok(())
    }

    /// Ask the broker to redeliver entries unacknowledged for longer than `timeout`.
    fn redeliver_expired(&self, timeout: Duration) -> bool {
        let expired: Vec<MessageIdData> = {
            let mut state = lock(&self.state);
            match state.status {
                Status::Closed => return false,
                Status::Connecting => return true,
                Status::Active => {}
            }
            let now = Instant::now();
            let expired: Vec<_> = state
                .unacked
                .iter()
                .filter(|(_, unacked)| now.duration_since(unacked.delivered_at) >= timeout)
                .map(|(entry, _)| *entry)
                .collect();
            for entry in &expired {
                state.unacked.remove(entry);
            }
            expired
        };
        if !expired.is_empty() {
            info!(
                topic = %self.topic,
                count = expired.len(),
                "redelivering unacknowledged messages"
            );
            self.connection
                .send_command(ClientCommand::RedeliverUnacknowledged {
                    consumer_id: self.consumer_id,
                    message_ids: expired,
                });
        }
        true
    }

    /// Mark closed and stop the dispatch thread. Returns false if already closed.
    fn shut_down(&self) -> bool {
        {
            let mut state = lock(&self.state);
            if state.status == Status::Closed {
                return false;
            }
            state.status = Status::Closed;
            state.queue.clear();
            state.unacked.clear();
            self.available.notify_all();
        }
        let listener = lock(&self.listener_thread).take();
        if let Some(listener) = listener {
            if listener.thread().id() != thread::current().id() {
                let _ = listener.join();
            }
        }
        self.connection.remove_consumer(self.consumer_id);
        true
    }

    fn close(&self) -> Result<()> {
        if !self.shut_down() {
            return Ok(());
        }
        let consumer_id = self.consumer_id;
        if !on_io_thread() && self.connection.is_connected() {
            if let Err(e) = self.connection.request(|request_id| ClientCommand::CloseConsumer {
                request_id,
                consumer_id,
            }) {
                debug!(topic = %self.topic, "close consumer request failed: {}", e);
            }
        } else {
            self.connection.send_command(ClientCommand::CloseConsumer {
                request_id: u64::MAX,
                consumer_id,
            });
        }
        info!(topic = %self.topic, subscription = %self.subscription, "closed consumer");
        Ok(())
    }

    fn unsubscribe(&self) -> Result<()> {
        if lock(&self.state).status == Status::Closed {
            return Err(Error::AlreadyClosed("consumer"));
        }
        let consumer_id = self.consumer_id;
        self.connection.request(|request_id| ClientCommand::Unsubscribe {
            request_id,
            consumer_id,
        })?;
        self.shut_down();
        info!(topic = %self.topic, subscription = %self.subscription, "unsubscribed");
        Ok(())
    }

    /// Build the application messages carried by one broker entry.
    fn unpack(
        &self,
        message_id: MessageIdData,
        redelivery_count: u32,
        metadata: MessageMetadata,
        payload: Vec<u8>,
    ) -> Result<Vec<Message>> {
        let payload = decompress(
            metadata.compression,
            &payload,
            metadata.uncompressed_size as usize,
        )?;

        let Some(batch_size) = metadata.num_messages_in_batch else {
            return Ok(vec![Message {
                payload,
                id: MessageId::new(message_id, None),
                topic: self.topic.clone(),
                properties: metadata.properties,
                partition_key: metadata.partition_key,
                publish_time: metadata.publish_time,
                producer_name: metadata.producer_name,
                redelivery_count,
                batch_size: None,
            }]);
        };

        let members = decode_batch(&payload).map_err(|e| Error::InvalidMessage(e.to_string()))?;
        if members.len() != batch_size as usize {
            return Err(Error::InvalidMessage(format!(
                "batch declares {batch_size} messages but carries {}",
                members.len()
            )));
        }
        Ok(members
            .into_iter()
            .enumerate()
            .map(|(index, member)| Message {
                payload: member.payload,
                id: MessageId::new(message_id, Some(index as u32)),
                topic: self.topic.clone(),
                properties: member.properties,
                partition_key: member.partition_key,
                publish_time: metadata.publish_time,
                producer_name: metadata.producer_name.clone(),
                redelivery_count,
                batch_size: Some(batch_size),
            })
            .collect())
    }

    async fn resubscribe(self: Arc<Self>) {
        let mut backoff = self.connection.retry_backoff();
        loop {
            let epoch = self.connection.epoch();
            if lock(&self.state).status != Status::Connecting {
                return;
            }
            let consumer_id = self.consumer_id;
            let result = self
                .connection
                .request_async(|request_id| {
                    subscribe_command(
                        request_id,
                        consumer_id,
                        &self.topic,
                        &self.subscription,
                        &self.config,
                    )
                })
                .await;

            match result {
                Ok(_) => {
                    {
                        let mut state = lock(&self.state);
                        if state.status != Status::Connecting {
                            return;
                        }
                        state.status = Status::Active;
                        state.available_permits = 0;
                    }
                    self.send_flow(self.receiver_queue_size());
                    info!(
                        topic = %self.topic,
                        subscription = %self.subscription,
                        "consumer reconnected"
                    );
                    return;
                }
                Err(e) => {
                    let delay = backoff.next();
                    warn!(topic = %self.topic, ?delay, "failed to resubscribe: {}", e);
                    tokio::time::sleep(delay).await;
                    if self.connection.epoch() != epoch || self.connection.is_closed() {
                        return;
                    }
                }
            }
        }
    }
}

impl ConsumerEvents for ConsumerInner {
    fn on_message(
        &self,
        message_id: MessageIdData,
        redelivery_count: u32,
        metadata: MessageMetadata,
        payload: Vec<u8>,
        checksum: u32,
    ) {
        let unpacked = if verify_checksum(&metadata, &payload, checksum) {
            self.unpack(message_id, redelivery_count, metadata, payload)
        } else {
            Err(Error::InvalidMessage("checksum mismatch".to_string()))
        };

        let mut state = lock(&self.state);
        if state.status != Status::Active {
            return;
        }
        match unpacked {
            Ok(messages) => {
                state.queue.extend(messages);
                self.available.notify_all();
            }
            Err(e) => {
                warn!(topic = %self.topic, %message_id, "discarding message: {}", e);
                self.send_ack(message_id, AckType::Individual);
                self.increase_permits(&mut state, 1);
            }
        }
    }

    fn on_connection_lost(&self) {
        let mut state = lock(&self.state);
        if state.status != Status::Active {
            return;
        }
        state.status = Status::Connecting;
        state.queue.clear();
        state.unacked.clear();
        state.available_permits = 0;
        debug!(topic = %self.topic, "cleared receiver queue after connection loss");
    }

    fn on_reconnected(self: Arc<Self>) {
        let handle = self.handle.clone();
        handle.spawn(self.resubscribe());
    }
}

impl Drop for ConsumerInner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|e| e.into_inner());
        if state.status == Status::Closed {
            return;
        }
        state.status = Status::Closed;
        self.connection.remove_consumer(self.consumer_id);
        self.connection.send_command(ClientCommand::CloseConsumer {
            request_id: u64::MAX,
            consumer_id: self.consumer_id,
        });
    }
}

fn run_listener(consumer: Weak<ConsumerInner>, listener: MessageListener) {
    loop {
        let Some(inner) = consumer.upgrade() else {
            return;
        };
        if let Some(message) = inner.next_for_listener() {
            let handle = Consumer::from_inner(inner.clone());
            let id = message.message_id();
            if catch_unwind(AssertUnwindSafe(|| listener(&handle, message))).is_err() {
                error!(topic = %inner.topic, message_id = %id, "message listener panicked");
            }
        }
        if lock(&inner.state).status == Status::Closed {
            return;
        }
    }
}

async fn run_unacked_timer(consumer: Weak<ConsumerInner>, timeout: Duration) {
    let period = (timeout / 2).max(Duration::from_millis(10));
    let mut ticker = tokio::time::interval(period);
    loop {
        ticker.tick().await;
        let Some(inner) = consumer.upgrade() else {
            return;
        };
        if !inner.redeliver_expired(timeout) {
            return;
        }
    }
}
