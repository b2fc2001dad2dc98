//! courier_client
//!
//! A blocking pub/sub client. A [`Client`] owns a small Tokio runtime that
//! drives one multiplexed WebSocket connection per broker; [`Producer`] and
//! [`Consumer`] handles talk to it through channels and block the calling
//! thread only where the operation is synchronous by nature.
//!
//! ```no_run
//! use std::time::Duration;
//! use courier_client::Client;
//!
//! let client = Client::new("pulsar://localhost:6650/")?;
//! let producer = client.create_producer("persistent://public/default/demo")?;
//! let consumer = client.subscribe("persistent://public/default/demo", "sub")?;
//! producer.send("hello")?;
//! let message = consumer.receive_timeout(Duration::from_secs(1))?;
//! consumer.acknowledge(&message)?;
//! client.close()?;
//! # Ok::<(), courier_client::Error>(())
//! ```

mod batch;
pub mod client;
mod compression;
pub mod config;
mod connection;
pub mod consumer;
pub mod error;
pub mod message;
pub mod producer;
pub mod service_url;

pub use client::{Client, IO_THREAD_NAME};
pub use config::{
    ClientConfig, CompressionType, ConsumerConfig, ConsumerType, InitialPosition,
    MessageListener, ProducerConfig,
};
pub use consumer::Consumer;
pub use error::{Error, Result};
pub use message::{Message, MessageBuilder, MessageId, OutgoingMessage};
pub use producer::{MAX_MESSAGE_SIZE, Producer};
pub use service_url::ServiceUrl;
