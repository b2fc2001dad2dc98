//! courier_broker
//!
//! An in-memory standalone broker speaking the courier protocol. It exists to
//! run the client library end to end: topics are created on first use, entries
//! live in bounded in-memory logs and nothing survives a restart.
//!
//! Public types:
//! - `Broker`: the engine holding sessions, topics and subscriptions
//! - `BrokerServer`: the WebSocket front end

pub mod auth;
pub mod engine;
pub mod server;
pub mod session;
pub mod subscription;
pub mod topic;

pub use engine::Broker;
pub use server::{BrokerServer, start_websocket_server};
