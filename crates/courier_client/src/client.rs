//! Client entry point
//!
//! A `Client` owns the I/O runtime, the connection pool and every producer and
//! consumer created through it. Closing the client (explicitly or by dropping
//! its last handle) closes those first and only then tears down connections
//! and the runtime.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;

use courier_config::ClientSettings;
use courier_utils::lock;
use tokio::runtime::{Handle, Runtime};
use tracing::{debug, info};

use crate::config::{ClientConfig, ConsumerConfig, ProducerConfig};
use crate::connection::ConnectionPool;
use crate::consumer::{Consumer, ConsumerInner};
use crate::error::{Error, Result};
use crate::producer::{Producer, ProducerInner};
use crate::service_url::ServiceUrl;

/// Name of the threads running connection I/O and user callbacks.
pub const IO_THREAD_NAME: &str = "courier-io";

/// Whether the current thread belongs to a client runtime. Blocking calls made
/// from such a thread could wait on themselves.
pub(crate) fn on_io_thread() -> bool {
    thread::current().name() == Some(IO_THREAD_NAME)
}

struct ClientShared {
    service_url: ServiceUrl,
    config: ClientConfig,
    runtime: Mutex<Option<Runtime>>,
    pool: ConnectionPool,
    producers: Mutex<Vec<Weak<ProducerInner>>>,
    consumers: Mutex<Vec<Weak<ConsumerInner>>>,
    closed: AtomicBool,
}

/// Factory for producers and consumers talking to one broker.
#[derive(Clone)]
pub struct Client {
    shared: Arc<ClientShared>,
}

impl Client {
    pub fn new(service_url: &str) -> Result<Self> {
        Self::with_config(service_url, ClientConfig::default())
    }

    pub fn with_config(service_url: &str, config: ClientConfig) -> Result<Self> {
        let service_url = ServiceUrl::parse(service_url)?;
        if config.io_threads() < 1 {
            return Err(Error::InvalidConfiguration(
                "io_threads must be at least 1".to_string(),
            ));
        }

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.io_threads())
            .thread_name(IO_THREAD_NAME)
            .enable_all()
            .build()
            .map_err(|e| Error::InvalidConfiguration(format!("failed to start runtime: {e}")))?;
        let handle: Handle = runtime.handle().clone();

        debug!(url = %service_url, io_threads = config.io_threads(), "created client");
        Ok(Self {
            shared: Arc::new(ClientShared {
                pool: ConnectionPool::new(handle, config.clone()),
                service_url,
                config,
                runtime: Mutex::new(Some(runtime)),
                producers: Mutex::new(Vec::new()),
                consumers: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Build a client from the `client` section of the loaded settings.
    pub fn from_settings(settings: &ClientSettings) -> Result<Self> {
        Self::with_config(&settings.service_url, ClientConfig::from_settings(settings))
    }

    pub fn service_url(&self) -> &ServiceUrl {
        &self.shared.service_url
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    pub fn create_producer(&self, topic: &str) -> Result<Producer> {
        self.create_producer_with_config(topic, ProducerConfig::default())
    }

    /// Create a producer, blocking until the broker registers it.
    pub fn create_producer_with_config(
        &self,
        topic: &str,
        config: ProducerConfig,
    ) -> Result<Producer> {
        self.ensure_usable()?;
        if config.max_pending_messages() < 1 {
            return Err(Error::InvalidConfiguration(format!(
                "max_pending_messages must be at least 1, got {}",
                config.max_pending_messages()
            )));
        }
        validate_name("topic", topic)?;

        let connection = self.shared.pool.get_connection(&self.shared.service_url)?;
        let producer = Producer::create(connection, topic, config)?;
        {
            let mut producers = lock(&self.shared.producers);
            producers.retain(|p| p.strong_count() > 0);
            producers.push(producer.downgrade());
        }
        if self.shared.closed.load(Ordering::SeqCst) {
            let _ = producer.close();
            return Err(Error::AlreadyClosed("client"));
        }
        Ok(producer)
    }

    pub fn subscribe(&self, topic: &str, subscription: &str) -> Result<Consumer> {
        self.subscribe_with_config(topic, subscription, ConsumerConfig::default())
    }

    /// Subscribe, blocking until the broker accepts the consumer. With a
    /// message listener configured, dispatch starts immediately.
    pub fn subscribe_with_config(
        &self,
        topic: &str,
        subscription: &str,
        config: ConsumerConfig,
    ) -> Result<Consumer> {
        self.ensure_usable()?;
        if config.receiver_queue_size() < 1 {
            return Err(Error::InvalidConfiguration(format!(
                "receiver_queue_size must be at least 1, got {}",
                config.receiver_queue_size()
            )));
        }
        validate_name("topic", topic)?;
        validate_name("subscription", subscription)?;

        let connection = self.shared.pool.get_connection(&self.shared.service_url)?;
        let consumer = Consumer::subscribe(connection, topic, subscription, config)?;
        {
            let mut consumers = lock(&self.shared.consumers);
            consumers.retain(|c| c.strong_count() > 0);
            consumers.push(consumer.downgrade());
        }
        if self.shared.closed.load(Ordering::SeqCst) {
            let _ = consumer.close();
            return Err(Error::AlreadyClosed("client"));
        }
        Ok(consumer)
    }

    /// Close every producer and consumer, then the connections. Idempotent.
    pub fn close(&self) -> Result<()> {
        if on_io_thread() {
            return Err(Error::InvalidOperation(
                "client close issued from an I/O thread".to_string(),
            ));
        }
        self.shared.close();
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::AlreadyClosed("client"));
        }
        if on_io_thread() {
            return Err(Error::InvalidOperation(
                "blocking client call issued from an I/O thread".to_string(),
            ));
        }
        Ok(())
    }
}

fn validate_name(kind: &str, name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::InvalidConfiguration(format!("{kind} name must not be empty")));
    }
    Ok(())
}

impl ClientShared {
    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let producers: Vec<_> = lock(&self.producers)
            .drain(..)
            .filter_map(|p| p.upgrade())
            .collect();
        for producer in producers {
            let _ = Producer::from_inner(producer).close();
        }

        let consumers: Vec<_> = lock(&self.consumers)
            .drain(..)
            .filter_map(|c| c.upgrade())
            .collect();
        for consumer in consumers {
            let _ = Consumer::from_inner(consumer).close();
        }

        self.pool.close_all();
        if let Some(runtime) = lock(&self.runtime).take() {
            runtime.shutdown_background();
        }
        info!(url = %self.service_url, "client closed");
    }
}

impl Drop for ClientShared {
    fn drop(&mut self) {
        self.close();
    }
}
