//! Client, producer and consumer configuration
//!
//! Plain value objects: setters return `&mut Self` for chaining and perform no
//! validation. Values are checked when a producer or consumer is created.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use courier_config::ClientSettings;

use crate::consumer::Consumer;
use crate::message::Message;

pub use courier_transport::{CompressionType, InitialPosition, SubType as ConsumerType};

/// Push-mode delivery callback, invoked on the consumer's dispatch thread.
pub type MessageListener = Arc<dyn Fn(&Consumer, Message) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    operation_timeout: Duration,
    connection_timeout: Duration,
    io_threads: usize,
    keep_alive_interval: Duration,
    auth_token: Option<String>,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_secs(30),
            connection_timeout: Duration::from_secs(10),
            io_threads: 1,
            keep_alive_interval: Duration::from_secs(30),
            auth_token: None,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(60),
        }
    }
}

impl ClientConfig {
    pub fn from_settings(settings: &ClientSettings) -> Self {
        let mut config = Self::default();
        config
            .set_operation_timeout(Duration::from_secs(settings.operation_timeout_secs))
            .set_connection_timeout(Duration::from_millis(settings.connection_timeout_ms))
            .set_io_threads(settings.io_threads)
            .set_keep_alive_interval(Duration::from_secs(settings.keep_alive_secs));
        if let Some(token) = &settings.auth_token {
            config.set_auth_token(token);
        }
        config
    }

    /// Deadline for requests such as creating a producer or subscribing.
    pub fn operation_timeout(&self) -> Duration {
        self.operation_timeout
    }

    pub fn set_operation_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn connection_timeout(&self) -> Duration {
        self.connection_timeout
    }

    pub fn set_connection_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.connection_timeout = timeout;
        self
    }

    /// Number of connection I/O threads.
    pub fn io_threads(&self) -> usize {
        self.io_threads
    }

    pub fn set_io_threads(&mut self, threads: usize) -> &mut Self {
        self.io_threads = threads;
        self
    }

    pub fn keep_alive_interval(&self) -> Duration {
        self.keep_alive_interval
    }

    pub fn set_keep_alive_interval(&mut self, interval: Duration) -> &mut Self {
        self.keep_alive_interval = interval;
        self
    }

    pub fn auth_token(&self) -> Option<&str> {
        self.auth_token.as_deref()
    }

    pub fn set_auth_token(&mut self, token: impl Into<String>) -> &mut Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn initial_backoff(&self) -> Duration {
        self.initial_backoff
    }

    pub fn max_backoff(&self) -> Duration {
        self.max_backoff
    }

    /// Reconnect delays start at `initial` and double up to `max`.
    pub fn set_backoff(&mut self, initial: Duration, max: Duration) -> &mut Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }
}

#[derive(Debug, Clone)]
pub struct ProducerConfig {
    send_timeout_millis: u64,
    compression_type: CompressionType,
    max_pending_messages: i32,
    producer_name: Option<String>,
    block_if_queue_full: bool,
    batching_enabled: bool,
    batching_max_messages: u32,
    batching_max_publish_delay_ms: u64,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            send_timeout_millis: 0,
            compression_type: CompressionType::None,
            max_pending_messages: 1000,
            producer_name: None,
            block_if_queue_full: true,
            batching_enabled: false,
            batching_max_messages: 1000,
            batching_max_publish_delay_ms: 10,
        }
    }
}

impl ProducerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// `0` waits forever.
    pub fn send_timeout_millis(&self) -> u64 {
        self.send_timeout_millis
    }

    pub fn set_send_timeout_millis(&mut self, millis: u64) -> &mut Self {
        self.send_timeout_millis = millis;
        self
    }

    pub fn compression_type(&self) -> CompressionType {
        self.compression_type
    }

    pub fn set_compression_type(&mut self, compression: CompressionType) -> &mut Self {
        self.compression_type = compression;
        self
    }

    /// Bound on outstanding asynchronous sends. Must be at least 1 when the
    /// producer is created.
    pub fn max_pending_messages(&self) -> i32 {
        self.max_pending_messages
    }

    pub fn set_max_pending_messages(&mut self, max: i32) -> &mut Self {
        self.max_pending_messages = max;
        self
    }

    pub fn producer_name(&self) -> Option<&str> {
        self.producer_name.as_deref()
    }

    pub fn set_producer_name(&mut self, name: impl Into<String>) -> &mut Self {
        self.producer_name = Some(name.into());
        self
    }

    pub fn block_if_queue_full(&self) -> bool {
        self.block_if_queue_full
    }

    pub fn set_block_if_queue_full(&mut self, block: bool) -> &mut Self {
        self.block_if_queue_full = block;
        self
    }

    pub fn batching_enabled(&self) -> bool {
        self.batching_enabled
    }

    pub fn set_batching_enabled(&mut self, enabled: bool) -> &mut Self {
        self.batching_enabled = enabled;
        self
    }

    pub fn batching_max_messages(&self) -> u32 {
        self.batching_max_messages
    }

    pub fn set_batching_max_messages(&mut self, max: u32) -> &mut Self {
        self.batching_max_messages = max;
        self
    }

    pub fn batching_max_publish_delay_ms(&self) -> u64 {
        self.batching_max_publish_delay_ms
    }

    pub fn set_batching_max_publish_delay_ms(&mut self, millis: u64) -> &mut Self {
        self.batching_max_publish_delay_ms = millis;
        self
    }
}

#[derive(Clone)]
pub struct ConsumerConfig {
    consumer_type: ConsumerType,
    consumer_name: String,
    message_listener: Option<MessageListener>,
    receiver_queue_size: i32,
    unacked_messages_timeout_ms: u64,
    initial_position: InitialPosition,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            consumer_type: ConsumerType::Exclusive,
            consumer_name: String::new(),
            message_listener: None,
            receiver_queue_size: 1000,
            unacked_messages_timeout_ms: 0,
            initial_position: InitialPosition::Latest,
        }
    }
}

impl fmt::Debug for ConsumerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerConfig")
            .field("consumer_type", &self.consumer_type)
            .field("consumer_name", &self.consumer_name)
            .field("message_listener", &self.message_listener.is_some())
            .field("receiver_queue_size", &self.receiver_queue_size)
            .field("unacked_messages_timeout_ms", &self.unacked_messages_timeout_ms)
            .field("initial_position", &self.initial_position)
            .finish()
    }
}

impl ConsumerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn consumer_type(&self) -> ConsumerType {
        self.consumer_type
    }

    pub fn set_consumer_type(&mut self, consumer_type: ConsumerType) -> &mut Self {
        self.consumer_type = consumer_type;
        self
    }

    /// Empty means the broker picks a name.
    pub fn consumer_name(&self) -> &str {
        &self.consumer_name
    }

    pub fn set_consumer_name(&mut self, name: impl Into<String>) -> &mut Self {
        self.consumer_name = name.into();
        self
    }

    pub fn message_listener(&self) -> Option<&MessageListener> {
        self.message_listener.as_ref()
    }

    pub fn has_message_listener(&self) -> bool {
        self.message_listener.is_some()
    }

    pub fn set_message_listener<F>(&mut self, listener: F) -> &mut Self
    where
        F: Fn(&Consumer, Message) + Send + Sync + 'static,
    {
        self.message_listener = Some(Arc::new(listener));
        self
    }

    pub fn receiver_queue_size(&self) -> i32 {
        self.receiver_queue_size
    }

    pub fn set_receiver_queue_size(&mut self, size: i32) -> &mut Self {
        self.receiver_queue_size = size;
        self
    }

    /// `0` disables client-side redelivery of unacknowledged messages.
    pub fn unacked_messages_timeout_ms(&self) -> u64 {
        self.unacked_messages_timeout_ms
    }

    pub fn set_unacked_messages_timeout_ms(&mut self, millis: u64) -> &mut Self {
        self.unacked_messages_timeout_ms = millis;
        self
    }

    pub fn initial_position(&self) -> InitialPosition {
        self.initial_position
    }

    pub fn set_initial_position(&mut self, position: InitialPosition) -> &mut Self {
        self.initial_position = position;
        self
    }
}
