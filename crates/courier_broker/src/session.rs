//! Connected client sessions
//!
//! A `Session` is the broker's view of one WebSocket connection: the sending
//! half of its outbound channel and the producers and consumers it registered.
//! Dropping the session drops the sender, which ends the connection's write
//! loop and closes the socket.

use std::collections::HashMap;

use courier_transport::{ServerCommand, WsMessage, encode};
use tokio::sync::mpsc::UnboundedSender;
use tracing::warn;
use uuid::Uuid;

pub type SessionId = String;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerRegistration {
    pub topic: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerRegistration {
    pub topic: String,
    pub subscription: String,
}

#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub sender: UnboundedSender<WsMessage>,
    pub authenticated: bool,
    pub producers: HashMap<u64, ProducerRegistration>,
    pub consumers: HashMap<u64, ConsumerRegistration>,
}

impl Session {
    pub fn new(sender: UnboundedSender<WsMessage>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            sender,
            authenticated: false,
            producers: HashMap::new(),
            consumers: HashMap::new(),
        }
    }

    /// Queue a command for this session. Returns `false` when the connection
    /// is already gone.
    pub fn send(&self, command: &ServerCommand) -> bool {
        let frame = match encode(command) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Failed to encode command for {}: {e}", self.id);
                return false;
            }
        };
        self.sender.send(frame).is_ok()
    }
}
