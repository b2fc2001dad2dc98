//! Producer
//!
//! Every send becomes an `OpSend` in a FIFO queue, bounded by
//! `max_pending_messages`. The broker acknowledges operations in order with a
//! receipt carrying the sequence id; the receipt pops the head of the queue and
//! completes its callbacks on the I/O thread that read it. Batched messages
//! share a single operation.

use std::collections::VecDeque;
use std::sync::mpsc::sync_channel;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use courier_transport::{
    ClientCommand, MessageIdData, MessageMetadata, ServerError, encode_batch, frame_checksum,
};
use courier_utils::{lock, wait, wait_timeout};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::batch::{Batch, BatchContainer};
use crate::client::on_io_thread;
use crate::compression::compress;
use crate::config::ProducerConfig;
use crate::connection::{Connection, ProducerEvents, Response};
use crate::error::{Error, Result};
use crate::message::{MessageId, OutgoingMessage};

/// Largest payload accepted by `send`.
pub const MAX_MESSAGE_SIZE: usize = 5 * 1024 * 1024;

const CLOSED_CALLBACK_THREAD_NAME: &str = "courier-closed";

pub(crate) type SendCallback = Box<dyn FnOnce(Result<MessageId>) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Ready,
    Connecting,
    Closing,
    Closed,
}

struct OpSend {
    sequence_id: u64,
    highest_sequence_id: u64,
    command: ClientCommand,
    callbacks: Vec<SendCallback>,
    batched: bool,
    sent: bool,
    deadline: Option<Instant>,
}

struct ProducerState {
    status: Status,
    next_sequence_id: u64,
    last_sequence_id: i64,
    pending: VecDeque<OpSend>,
    /// Messages in `pending` plus the open batch.
    pending_messages: usize,
    /// Operations whose callbacks were taken off `pending` but have not
    /// finished running yet.
    completing: usize,
    batch: BatchContainer,
}

impl ProducerState {
    fn is_drained(&self) -> bool {
        self.pending.is_empty() && self.completing == 0
    }
}

pub(crate) struct ProducerInner {
    topic: String,
    producer_id: u64,
    producer_name: String,
    config: ProducerConfig,
    connection: Connection,
    handle: Handle,
    state: Mutex<ProducerState>,
    changed: Condvar,
}

/// Publishes messages to one topic. Clones share the same producer.
#[derive(Clone)]
pub struct Producer {
    inner: Arc<ProducerInner>,
}

impl Producer {
    /// Register a producer with the broker, blocking until it answers.
    pub(crate) fn create(
        connection: Connection,
        topic: &str,
        config: ProducerConfig,
    ) -> Result<Self> {
        let producer_id = connection.next_producer_id();
        let requested_name = config.producer_name().map(str::to_string);
        let response = connection.request(|request_id| ClientCommand::Producer {
            request_id,
            producer_id,
            topic: topic.to_string(),
            producer_name: requested_name.clone(),
        })?;
        let producer_name = match response {
            Response::ProducerSuccess { producer_name } => producer_name,
            Response::Success => requested_name.unwrap_or_default(),
        };

        let handle = connection.handle().clone();
        let inner = Arc::new(ProducerInner {
            topic: topic.to_string(),
            producer_id,
            producer_name,
            state: Mutex::new(ProducerState {
                status: Status::Ready,
                next_sequence_id: 0,
                last_sequence_id: -1,
                pending: VecDeque::new(),
                pending_messages: 0,
                completing: 0,
                batch: BatchContainer::new(config.batching_max_messages()),
            }),
            changed: Condvar::new(),
            config,
            connection,
            handle,
        });

        let events: Weak<ProducerInner> = Arc::downgrade(&inner);
        inner.connection.register_producer(producer_id, events);
        if let Some(period) = inner.timer_period() {
            inner.handle.spawn(run_timer(Arc::downgrade(&inner), period));
        }

        info!(
            topic = %inner.topic,
            producer = %inner.producer_name,
            producer_id,
            "created producer"
        );
        Ok(Self { inner })
    }

    pub(crate) fn downgrade(&self) -> Weak<ProducerInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn from_inner(inner: Arc<ProducerInner>) -> Self {
        Self { inner }
    }

    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    pub fn producer_name(&self) -> &str {
        &self.inner.producer_name
    }

    /// Highest sequence id acknowledged by the broker, `-1` before the first receipt.
    pub fn last_sequence_id(&self) -> i64 {
        lock(&self.inner.state).last_sequence_id
    }

    /// Publish a message and block until the broker acknowledges it.
    pub fn send(&self, message: impl Into<OutgoingMessage>) -> Result<MessageId> {
        if on_io_thread() {
            return Err(Error::InvalidOperation(
                "blocking send issued from an I/O thread".to_string(),
            ));
        }
        let (tx, rx) = sync_channel(1);
        self.send_async(message, move |result| {
            let _ = tx.send(result);
        });
        if self.inner.config.batching_enabled() {
            let mut state = lock(&self.inner.state);
            self.inner.flush_batch(&mut state);
        }
        rx.recv().map_err(|_| Error::AlreadyClosed("producer"))?
    }

    /// Publish a message without waiting. `callback` runs exactly once, never
    /// on the calling thread, with the assigned message id or the failure.
    /// It receives only the outcome: capture a `Producer` clone or the
    /// payload in the closure when the callback needs them.
    ///
    /// Blocks while `max_pending_messages` sends are outstanding, unless
    /// `block_if_queue_full` is off.
    pub fn send_async<F>(&self, message: impl Into<OutgoingMessage>, callback: F)
    where
        F: FnOnce(Result<MessageId>) + Send + 'static,
    {
        if let Err((error, callback)) = self.inner.enqueue(message.into(), Box::new(callback)) {
            debug!(topic = %self.inner.topic, "send failed: {}", error);
            match error {
                // The client runtime may already be shut down.
                Error::AlreadyClosed(_) => fail_detached(callback, error),
                error => {
                    self.inner.handle.spawn(async move { callback(Err(error)) });
                }
            }
        }
    }

    /// Publish the open batch and wait until every pending send completes.
    pub fn flush(&self) -> Result<()> {
        if on_io_thread() {
            return Err(Error::InvalidOperation(
                "blocking flush issued from an I/O thread".to_string(),
            ));
        }
        let deadline = Instant::now() + self.inner.connection.operation_timeout();
        let mut state = lock(&self.inner.state);
        if state.status == Status::Closed {
            return Err(Error::AlreadyClosed("producer"));
        }
        self.inner.flush_batch(&mut state);
        while !state.is_drained() {
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout);
            }
            state = wait_timeout(&self.inner.changed, state, deadline - now);
        }
        Ok(())
    }

    /// Wait for outstanding sends, then release the producer on the broker.
    /// Sends still pending after the operation timeout fail with `Timeout`.
    /// Idempotent.
    pub fn close(&self) -> Result<()> {
        self.inner.close()
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.inner.state).status == Status::Closed
    }
}

impl ProducerInner {
    fn timer_period(&self) -> Option<Duration> {
        let batching = self.config.batching_enabled();
        if !batching && self.config.send_timeout_millis() == 0 {
            return None;
        }
        let mut period = Duration::from_millis(100);
        if batching {
            period = period.min(Duration::from_millis(self.config.batching_max_publish_delay_ms()));
        }
        Some(period.max(Duration::from_millis(1)))
    }

    fn enqueue(
        &self,
        message: OutgoingMessage,
        callback: SendCallback,
    ) -> std::result::Result<(), (Error, SendCallback)> {
        if message.payload.len() > MAX_MESSAGE_SIZE {
            let error = Error::InvalidMessage(format!(
                "payload of {} bytes exceeds the {MAX_MESSAGE_SIZE} byte limit",
                message.payload.len()
            ));
            return Err((error, callback));
        }

        let max_pending = self.config.max_pending_messages().max(1) as usize;
        let mut state = lock(&self.state);
        loop {
            if matches!(state.status, Status::Closing | Status::Closed) {
                return Err((Error::AlreadyClosed("producer"), callback));
            }
            if state.pending_messages < max_pending {
                break;
            }
            if !self.config.block_if_queue_full() || on_io_thread() {
                return Err((Error::ProducerQueueFull, callback));
            }
            state = wait(&self.changed, state);
        }

        let sequence_id = state.next_sequence_id;
        state.next_sequence_id += 1;
        state.pending_messages += 1;
        let publish_time = Utc::now().timestamp_millis();

        if self.config.batching_enabled() {
            state.batch.add(sequence_id, message, callback, publish_time);
            if state.batch.is_full() {
                self.flush_batch(&mut state);
            }
            return Ok(());
        }

        let metadata = MessageMetadata {
            producer_name: self.producer_name.clone(),
            sequence_id,
            publish_time,
            properties: message.properties,
            partition_key: message.partition_key,
            ..Default::default()
        };
        match self.build_op(metadata, sequence_id, message.payload) {
            Ok(command) => {
                self.push_op(&mut state, sequence_id, sequence_id, command, vec![callback], false);
                Ok(())
            }
            Err(error) => {
                state.pending_messages -= 1;
                Err((error, callback))
            }
        }
    }

    /// Compress, checksum and wrap a payload into a send command.
    fn build_op(
        &self,
        mut metadata: MessageMetadata,
        highest_sequence_id: u64,
        payload: Vec<u8>,
    ) -> Result<ClientCommand> {
        let compression = self.config.compression_type();
        let compressed = compress(compression, &payload)?;
        metadata.compression = compression;
        metadata.uncompressed_size = payload.len() as u32;
        let checksum = frame_checksum(&metadata, &compressed)
            .map_err(|e| Error::InvalidMessage(e.to_string()))?;

        Ok(ClientCommand::Send {
            producer_id: self.producer_id,
            sequence_id: metadata.sequence_id,
            highest_sequence_id,
            metadata,
            payload: compressed,
            checksum,
        })
    }

    fn push_op(
        &self,
        state: &mut ProducerState,
        sequence_id: u64,
        highest_sequence_id: u64,
        command: ClientCommand,
        callbacks: Vec<SendCallback>,
        batched: bool,
    ) {
        let deadline = match self.config.send_timeout_millis() {
            0 => None,
            millis => Some(Instant::now() + Duration::from_millis(millis)),
        };
        let sent = state.status == Status::Ready && self.connection.send_command(command.clone());
        state.pending.push_back(OpSend {
            sequence_id,
            highest_sequence_id,
            command,
            callbacks,
            batched,
            sent,
            deadline,
        });
    }

    /// Turn the open batch into a send operation.
    fn flush_batch(&self, state: &mut ProducerState) {
        let Some(batch) = state.batch.take() else {
            return;
        };
        let Batch {
            messages,
            callbacks,
            first_sequence_id,
            last_sequence_id,
            publish_time,
        } = batch;

        let metadata = MessageMetadata {
            producer_name: self.producer_name.clone(),
            sequence_id: first_sequence_id,
            publish_time,
            num_messages_in_batch: Some(messages.len() as u32),
            ..Default::default()
        };
        let command = encode_batch(&messages)
            .map_err(|e| Error::InvalidMessage(e.to_string()))
            .and_then(|payload| self.build_op(metadata, last_sequence_id, payload));

        match command {
            Ok(command) => {
                debug!(
                    topic = %self.topic,
                    first_sequence_id,
                    messages = callbacks.len(),
                    "flushing batch"
                );
                self.push_op(state, first_sequence_id, last_sequence_id, command, callbacks, true);
            }
            Err(error) => {
                warn!(topic = %self.topic, "dropping batch: {}", error);
                state.pending_messages -= callbacks.len();
                self.changed.notify_all();
                for callback in callbacks {
                    let error = error.clone();
                    self.handle.spawn(async move { callback(Err(error)) });
                }
            }
        }
    }

    /// Flush an expired batch and fail timed-out sends. Returns false once the
    /// producer is closed.
    fn on_timer(&self) -> bool {
        let now = Instant::now();
        let expired = {
            let mut state = lock(&self.state);
            if state.status == Status::Closed {
                return false;
            }
            let delay = Duration::from_millis(self.config.batching_max_publish_delay_ms());
            if state
                .batch
                .created_at()
                .is_some_and(|created| now.duration_since(created) >= delay)
            {
                self.flush_batch(&mut state);
            }

            let mut expired = Vec::new();
            while state
                .pending
                .front()
                .is_some_and(|op| op.deadline.is_some_and(|deadline| deadline <= now))
            {
                if let Some(op) = state.pending.pop_front() {
                    state.pending_messages -= op.callbacks.len();
                    expired.extend(op.callbacks);
                }
            }
            if expired.is_empty() {
                return true;
            }
            state.completing += 1;
            self.changed.notify_all();
            expired
        };

        let _completing = Completing(self);
        warn!(topic = %self.topic, count = expired.len(), "send timed out");
        for callback in expired {
            callback(Err(Error::Timeout));
        }
        true
    }

    fn close(&self) -> Result<()> {
        {
            let mut state = lock(&self.state);
            match state.status {
                Status::Closed | Status::Closing => return Ok(()),
                _ => state.status = Status::Closing,
            }
            self.flush_batch(&mut state);
        }

        let blocking = !on_io_thread();
        let leftovers = {
            let mut state = lock(&self.state);
            if blocking {
                let deadline = Instant::now() + self.connection.operation_timeout();
                while !state.is_drained() {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    state = wait_timeout(&self.changed, state, deadline - now);
                }
            }
            state.status = Status::Closed;
            state.pending_messages = 0;
            self.changed.notify_all();
            let mut leftovers: Vec<SendCallback> =
                state.pending.drain(..).flat_map(|op| op.callbacks).collect();
            leftovers.extend(state.batch.drain_callbacks());
            leftovers
        };
        for callback in leftovers {
            callback(Err(Error::Timeout));
        }

        self.connection.remove_producer(self.producer_id);
        let producer_id = self.producer_id;
        if blocking && self.connection.is_connected() {
            if let Err(e) = self.connection.request(|request_id| ClientCommand::CloseProducer {
                request_id,
                producer_id,
            }) {
                debug!(topic = %self.topic, "close producer request failed: {}", e);
            }
        } else {
            self.connection.send_command(ClientCommand::CloseProducer {
                request_id: u64::MAX,
                producer_id,
            });
        }
        info!(topic = %self.topic, producer = %self.producer_name, "closed producer");
        Ok(())
    }

    async fn reconnect(self: Arc<Self>) {
        let mut backoff = self.connection.retry_backoff();
        loop {
            let epoch = self.connection.epoch();
            if lock(&self.state).status != Status::Connecting {
                return;
            }
            let producer_id = self.producer_id;
            let result = self
                .connection
                .request_async(|request_id| ClientCommand::Producer {
                    request_id,
                    producer_id,
                    topic: self.topic.clone(),
                    producer_name: Some(self.producer_name.clone()),
                })
                .await;

            match result {
                Ok(_) => {
                    let resent = {
                        let mut state = lock(&self.state);
                        if state.status != Status::Connecting {
                            return;
                        }
                        state.status = Status::Ready;
                        let mut resent = 0;
                        for op in state.pending.iter_mut().filter(|op| !op.sent) {
                            op.sent = self.connection.send_command(op.command.clone());
                            resent += 1;
                        }
                        self.changed.notify_all();
                        resent
                    };
                    info!(
                        topic = %self.topic,
                        producer = %self.producer_name,
                        resent,
                        "producer reconnected"
                    );
                    return;
                }
                Err(e) => {
                    let delay = backoff.next();
                    warn!(topic = %self.topic, ?delay, "failed to re-register producer: {}", e);
                    tokio::time::sleep(delay).await;
                    if self.connection.epoch() != epoch || self.connection.is_closed() {
                        return;
                    }
                }
            }
        }
    }
}

impl ProducerEvents for ProducerInner {
    fn on_receipt(&self, sequence_id: u64, highest_sequence_id: u64, message_id: MessageIdData) {
        let (callbacks, batched) = {
            let mut state = lock(&self.state);
            match state.pending.front() {
                Some(op) if op.sequence_id == sequence_id => {}
                Some(op) if sequence_id < op.sequence_id => {
                    debug!(topic = %self.topic, sequence_id, "late receipt ignored");
                    return;
                }
                Some(op) => {
                    warn!(
                        topic = %self.topic,
                        sequence_id,
                        expected = op.sequence_id,
                        "out of order receipt ignored"
                    );
                    return;
                }
                None => {
                    debug!(topic = %self.topic, sequence_id, "receipt with no pending send");
                    return;
                }
            }
            let Some(op) = state.pending.pop_front() else {
                return;
            };
            state.pending_messages -= op.callbacks.len();
            state.last_sequence_id = highest_sequence_id as i64;
            state.completing += 1;
            self.changed.notify_all();
            (op.callbacks, op.batched)
        };

        let _completing = Completing(self);
        for (index, callback) in callbacks.into_iter().enumerate() {
            let batch_index = batched.then_some(index as u32);
            callback(Ok(MessageId::new(message_id, batch_index)));
        }
    }

    fn on_send_error(&self, sequence_id: u64, code: ServerError, message: String) {
        let callbacks = {
            let mut state = lock(&self.state);
            let Some(position) = state.pending.iter().position(|op| op.sequence_id == sequence_id)
            else {
                return;
            };
            let Some(op) = state.pending.remove(position) else {
                return;
            };
            state.pending_messages -= op.callbacks.len();
            state.completing += 1;
            self.changed.notify_all();
            op.callbacks
        };
        let _completing = Completing(self);
        warn!(topic = %self.topic, sequence_id, %code, "broker rejected send: {}", message);
        let error = Error::from_server(code, message);
        for callback in callbacks {
            callback(Err(error.clone()));
        }
    }

    fn on_connection_lost(&self) {
        let failed = {
            let mut state = lock(&self.state);
            if state.status == Status::Ready {
                state.status = Status::Connecting;
            }
            let mut failed = Vec::new();
            let mut kept = VecDeque::with_capacity(state.pending.len());
            for op in state.pending.drain(..) {
                if op.sent {
                    failed.extend(op.callbacks);
                } else {
                    kept.push_back(op);
                }
            }
            state.pending = kept;
            state.pending_messages -= failed.len();
            if failed.is_empty() {
                return;
            }
            state.completing += 1;
            self.changed.notify_all();
            failed
        };
        let _completing = Completing(self);
        warn!(topic = %self.topic, count = failed.len(), "failing in-flight sends");
        for callback in failed {
            callback(Err(Error::ConnectionLost));
        }
    }

    fn on_reconnected(self: Arc<Self>) {
        let handle = self.handle.clone();
        handle.spawn(self.reconnect());
    }
}

impl Drop for ProducerInner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|e| e.into_inner());
        if state.status == Status::Closed {
            return;
        }
        state.status = Status::Closed;
        let mut callbacks: Vec<SendCallback> =
            state.pending.drain(..).flat_map(|op| op.callbacks).collect();
        callbacks.extend(state.batch.drain_callbacks());
        for callback in callbacks {
            callback(Err(Error::AlreadyClosed("producer")));
        }
        self.connection.remove_producer(self.producer_id);
        self.connection.send_command(ClientCommand::CloseProducer {
            request_id: u64::MAX,
            producer_id: self.producer_id,
        });
    }
}

/// Run a failed callback on a short-lived thread of its own.
fn fail_detached(callback: SendCallback, error: Error) {
    let spawned = thread::Builder::new()
        .name(CLOSED_CALLBACK_THREAD_NAME.to_string())
        .spawn(move || callback(Err(error)));
    if let Err(e) = spawned {
        warn!("failed to start callback thread: {}", e);
    }
}

/// Marks one batch of callbacks as finished once dropped, even if a callback
/// panicked.
struct Completing<'a>(&'a ProducerInner);

impl Drop for Completing<'_> {
    fn drop(&mut self) {
        let mut state = lock(&self.0.state);
        state.completing = state.completing.saturating_sub(1);
        self.0.changed.notify_all();
    }
}

async fn run_timer(producer: Weak<ProducerInner>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    loop {
        ticker.tick().await;
        let Some(inner) = producer.upgrade() else {
            return;
        };
        if !inner.on_timer() {
            return;
        }
    }
}
