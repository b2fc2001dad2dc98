//! Error types for the courier client library

use courier_transport::ServerError;

/// Every failure the client reports. Cloneable so one outcome can be handed to
/// several waiting callbacks.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Transport or handshake failure.
    #[error("connect error: {0}")]
    Connect(String),

    /// A blocking call exceeded its deadline.
    #[error("operation timed out")]
    Timeout,

    /// An Exclusive or Failover subscription already has a conflicting consumer.
    #[error("consumer busy: {0}")]
    ConsumerBusy(String),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The broker refused the request.
    #[error("broker rejected request ({code}): {message}")]
    BrokerRejected { code: ServerError, message: String },

    /// The connection failed while the operation was in flight.
    #[error("connection lost")]
    ConnectionLost,

    #[error("producer queue is full")]
    ProducerQueueFull,

    #[error("{0} is already closed")]
    AlreadyClosed(&'static str),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Map a broker refusal to the matching client error kind.
    pub fn from_server(code: ServerError, message: String) -> Self {
        match code {
            ServerError::ConsumerBusy => Error::ConsumerBusy(message),
            ServerError::AuthenticationError
            | ServerError::TooManyConnections
            | ServerError::UnsupportedVersion => Error::Connect(format!("{code}: {message}")),
            _ => Error::BrokerRejected { code, message },
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout)
    }
}
